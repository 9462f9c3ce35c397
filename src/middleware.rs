//! The tower integration: a [`Layer`] wrapping an inner service (the
//! backend) with the caching dispatcher. Within one request the dispatcher
//! is strictly sequential; the only suspension points are storage calls and
//! backend invocations.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{header::EXPECT, request, Method, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use thiserror::Error;
use tower::{Layer, Service, ServiceExt};

use crate::{
    client_validator_wins, conditional_parts, fetch_parts, merge_not_modified,
    rewrite_path, BoxError, CacheControl, CacheError, CacheManager,
    CacheOptions, ProxyCache, ResponseView, Trace, TtlSpec, CACHE_KEY_HEADER,
    CACHE_TIME_HEADER, CACHE_TIME_PASS_HEADER, TRACE_HEADER,
};

/// Errors surfaced by [`ProxyCacheService`]. Backend failures are passed
/// along inside [`ServiceError::Backend`] and never turned into hits.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The cache core failed
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// Collecting a response body failed
    #[error("body error: {0}")]
    Body(#[source] BoxError),
    /// The backend service failed
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),
}

/// The caching middleware as a tower [`Layer`].
pub struct ProxyCacheLayer<M>
where
    M: CacheManager,
{
    cache: Arc<ProxyCache<M>>,
}

impl<M: CacheManager> Clone for ProxyCacheLayer<M> {
    fn clone(&self) -> Self {
        Self { cache: self.cache.clone() }
    }
}

impl<M: CacheManager> fmt::Debug for ProxyCacheLayer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCacheLayer").finish_non_exhaustive()
    }
}

impl<M> ProxyCacheLayer<M>
where
    M: CacheManager,
{
    /// Creates a layer with default options around a manager. Default
    /// options carry no rules, so nothing is cached until rules are set.
    pub fn new(manager: M) -> Self {
        Self::with_cache(ProxyCache::new(manager))
    }

    /// Creates a layer from a manager and explicit options.
    pub fn with_options(manager: M, options: CacheOptions) -> Self {
        Self::with_cache(ProxyCache::with_options(manager, options))
    }

    /// Creates a layer around a pre-built cache core.
    pub fn with_cache(cache: ProxyCache<M>) -> Self {
        Self { cache: Arc::new(cache) }
    }
}

impl<S, M> Layer<S> for ProxyCacheLayer<M>
where
    M: CacheManager,
{
    type Service = ProxyCacheService<S, M>;

    fn layer(&self, inner: S) -> Self::Service {
        ProxyCacheService { inner, cache: self.cache.clone() }
    }
}

/// The caching middleware service produced by [`ProxyCacheLayer`].
pub struct ProxyCacheService<S, M>
where
    M: CacheManager,
{
    inner: S,
    cache: Arc<ProxyCache<M>>,
}

impl<S: Clone, M: CacheManager> Clone for ProxyCacheService<S, M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), cache: self.cache.clone() }
    }
}

impl<S, M: CacheManager> fmt::Debug for ProxyCacheService<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCacheService").finish_non_exhaustive()
    }
}

/// The per-request dispatch context: the trace buffer and the timers
/// feeding the diagnostic headers. Request-local, never shared.
struct DispatchContext {
    trace: Vec<Trace>,
    started: Instant,
    backend: Option<Duration>,
}

impl DispatchContext {
    fn new() -> Self {
        Self { trace: Vec::new(), started: Instant::now(), backend: None }
    }

    fn push(&mut self, token: Trace) {
        self.trace.push(token);
    }

    fn record_backend(&mut self, elapsed: Duration) {
        self.backend = Some(self.backend.unwrap_or(Duration::ZERO) + elapsed);
    }

    fn annotate(&self, headers: &mut http::HeaderMap, key: &str) {
        let trace = self
            .trace
            .iter()
            .map(Trace::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = trace.parse() {
            headers.insert(TRACE_HEADER, value);
        }
        if let Ok(value) = key.parse() {
            headers.insert(CACHE_KEY_HEADER, value);
        }
        let backend = self.backend.unwrap_or(Duration::ZERO);
        let total = self.started.elapsed().saturating_sub(backend);
        if let Ok(value) = total.as_micros().to_string().parse() {
            headers.insert(CACHE_TIME_HEADER, value);
        }
        if self.backend.is_some() {
            if let Ok(value) = backend.as_micros().to_string().parse() {
                headers.insert(CACHE_TIME_PASS_HEADER, value);
            }
        }
    }
}

/// Collects a body fully into memory.
async fn collect_body<B>(body: B) -> Result<Bytes, B::Error>
where
    B: Body,
{
    let collected = BodyExt::collect(body).await?;
    Ok(collected.to_bytes())
}

/// Forwards a request to the backend, accounting its wall time separately
/// from the cache's own.
async fn forward<S, B, ResBody>(
    service: S,
    request: Request<B>,
    ctx: &mut DispatchContext,
) -> Result<Response<ResBody>, ServiceError>
where
    S: Service<Request<B>, Response = Response<ResBody>>,
    S::Error: Into<BoxError>,
{
    let started = Instant::now();
    let result = service.oneshot(request).await;
    ctx.record_backend(started.elapsed());
    result.map_err(|err| ServiceError::Backend(err.into()))
}

fn serve_buffered<B>(
    response: Response<Bytes>,
    ctx: &DispatchContext,
    key: &str,
) -> Response<CacheBody<B>> {
    let (mut parts, body) = response.into_parts();
    ctx.annotate(&mut parts.headers, key);
    Response::from_parts(parts, CacheBody::Buffered(body))
}

fn serve_passthrough<B>(
    response: Response<B>,
    ctx: &DispatchContext,
    key: &str,
) -> Response<CacheBody<B>> {
    let (mut parts, body) = response.into_parts();
    ctx.annotate(&mut parts.headers, key);
    Response::from_parts(parts, CacheBody::Passthrough(body))
}

/// Materializes a backend response, readies it for storage, stores it when
/// the adjusted response is cacheable, and hands it back for serving.
async fn complete_fetch<M, B>(
    cache: &ProxyCache<M>,
    ctx: &mut DispatchContext,
    parts: &request::Parts,
    key: &str,
    ttl: TtlSpec,
    response: Response<B>,
) -> Result<Response<Bytes>, ServiceError>
where
    M: CacheManager,
    B: Body,
    B::Error: Into<BoxError>,
{
    let (fresh_parts, fresh_body) = response.into_parts();
    let bytes = collect_body(fresh_body)
        .await
        .map_err(|err| ServiceError::Body(err.into()))?;
    let mut view = ResponseView::from_parts(fresh_parts, bytes);
    let storage_ttl = cache.prepare_store(&parts.headers, &mut view, ttl);
    if view.is_cacheable() {
        ctx.push(Trace::Store);
        cache.store(key.to_string(), &parts.headers, &view, storage_ttl).await;
    }
    Ok(view.finalize())
}

impl<S, M, ReqBody, ResBody> Service<Request<ReqBody>>
    for ProxyCacheService<S, M>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Into<BoxError>,
    M: CacheManager,
{
    type Response = Response<CacheBody<ResBody>>;
    type Error = ServiceError;
    type Future = Pin<
        Box<
            dyn Future<Output = Result<Self::Response, Self::Error>> + Send,
        >,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|err| ServiceError::Backend(err.into()))
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let cache = Arc::clone(&self.cache);
        let inner = self.inner.clone();

        Box::pin(async move {
            let mut ctx = DispatchContext::new();
            let (mut parts, body) = request.into_parts();

            // Safe methods read through the cache; everything else writes,
            // so the key is pessimistically invalidated.
            if parts.method != Method::GET && parts.method != Method::HEAD {
                let key = cache.cache_key(&parts);
                ctx.push(Trace::Invalidate);
                cache.invalidate(&key).await;
                ctx.push(Trace::Pass);
                let response =
                    forward(inner, Request::from_parts(parts, body), &mut ctx)
                        .await?;
                return Ok(serve_passthrough(response, &ctx, &key));
            }

            // Expect: 100-continue semantics must reach the backend intact.
            if parts.headers.contains_key(EXPECT) {
                let key = cache.cache_key(&parts);
                ctx.push(Trace::Expect);
                ctx.push(Trace::Pass);
                let response =
                    forward(inner, Request::from_parts(parts, body), &mut ctx)
                        .await?;
                return Ok(serve_passthrough(response, &ctx, &key));
            }

            let reload = cache.options.allow_reload
                && CacheControl::from_headers(&parts.headers).no_cache;
            ctx.push(if reload { Trace::Reload } else { Trace::Lookup });

            let matched = cache.options.rules.matched(parts.uri.path());
            let matched = match matched {
                Some(matched) => matched,
                None => {
                    let key = cache.cache_key(&parts);
                    ctx.push(Trace::Pass);
                    let response = forward(
                        inner,
                        Request::from_parts(parts, body),
                        &mut ctx,
                    )
                    .await?;
                    return Ok(serve_passthrough(response, &ctx, &key));
                }
            };
            if matched.path != parts.uri.path() {
                rewrite_path(&mut parts, &matched.path);
            }
            let key = cache.cache_key(&parts);

            // Without cache_queries a query string means this URL is not
            // ours to cache; drop whatever the query-less key holds.
            if parts.uri.query().is_some_and(|query| !query.is_empty())
                && !cache.options.cache_queries
            {
                ctx.push(Trace::Invalidate);
                cache.invalidate(&key).await;
                ctx.push(Trace::Pass);
                let response =
                    forward(inner, Request::from_parts(parts, body), &mut ctx)
                        .await?;
                return Ok(serve_passthrough(response, &ctx, &key));
            }

            if matched.ttl == TtlSpec::Invalidate {
                ctx.push(Trace::Invalidate);
                cache.invalidate(&key).await;
                ctx.push(Trace::Pass);
                let response =
                    forward(inner, Request::from_parts(parts, body), &mut ctx)
                        .await?;
                return Ok(serve_passthrough(response, &ctx, &key));
            }

            if !reload {
                if let Some(entry) = cache.lookup(&key).await {
                    ctx.push(Trace::Hit);
                    let mut stored = entry.response.into_view();
                    stored.refresh_age();
                    if stored.is_fresh() {
                        ctx.push(Trace::Refurbish);
                        return Ok(serve_buffered(
                            stored.finalize(),
                            &ctx,
                            &key,
                        ));
                    }

                    ctx.push(Trace::Validate);
                    let sub = conditional_parts(&parts, &stored);
                    let response =
                        forward(inner, Request::from_parts(sub, body), &mut ctx)
                            .await?;
                    if response.status() == StatusCode::NOT_MODIFIED {
                        ctx.push(Trace::NotModified);
                        let (fresh_parts, _) = response.into_parts();
                        if client_validator_wins(&parts, &stored, &fresh_parts)
                        {
                            // The client's own validator matched something
                            // this cache does not hold; its 304 is theirs.
                            let mut view = ResponseView::from_parts(
                                fresh_parts,
                                Bytes::new(),
                            );
                            view.make_not_modified();
                            return Ok(serve_buffered(
                                view.finalize(),
                                &ctx,
                                &key,
                            ));
                        }
                        merge_not_modified(&mut stored, &fresh_parts);
                        let storage_ttl = cache.prepare_store(
                            &parts.headers,
                            &mut stored,
                            matched.ttl,
                        );
                        if stored.is_cacheable() {
                            cache
                                .store(
                                    key.clone(),
                                    &parts.headers,
                                    &stored,
                                    storage_ttl,
                                )
                                .await;
                        }
                        return Ok(serve_buffered(
                            stored.finalize(),
                            &ctx,
                            &key,
                        ));
                    }
                    // Anything else replaces the stored body outright; a
                    // 5xx is served but never evicts the existing entry.
                    let served = complete_fetch(
                        &cache,
                        &mut ctx,
                        &parts,
                        &key,
                        matched.ttl,
                        response,
                    )
                    .await?;
                    return Ok(serve_buffered(served, &ctx, &key));
                }
                ctx.push(Trace::Miss);
            }

            ctx.push(Trace::Fetch);
            let sub = fetch_parts(&parts);
            let response =
                forward(inner, Request::from_parts(sub, body), &mut ctx)
                    .await?;
            let served = complete_fetch(
                &cache,
                &mut ctx,
                &parts,
                &key,
                matched.ttl,
                response,
            )
            .await?;
            Ok(serve_buffered(served, &ctx, &key))
        })
    }
}

/// The response body type produced by [`ProxyCacheService`]: either a
/// buffered body that went through the cache machinery, or the backend's
/// own body forwarded untouched on pass-through.
pub enum CacheBody<B> {
    /// A materialized body served by the cache
    Buffered(Bytes),
    /// The backend body, forwarded without buffering
    Passthrough(B),
}

impl<B> fmt::Debug for CacheBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => {
                f.debug_tuple("Buffered").field(&bytes.len()).finish()
            }
            Self::Passthrough(_) => {
                f.debug_tuple("Passthrough").finish()
            }
        }
    }
}

impl<B> Body for CacheBody<B>
where
    B: Body + Unpin,
    B::Data: Into<Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match &mut *self {
            Self::Buffered(bytes) => {
                if bytes.is_empty() {
                    Poll::Ready(None)
                } else {
                    let data = std::mem::take(bytes);
                    Poll::Ready(Some(Ok(http_body::Frame::data(data))))
                }
            }
            Self::Passthrough(body) => {
                Pin::new(body).poll_frame(cx).map(|frame| {
                    frame.map(|result| {
                        result
                            .map(|frame| frame.map_data(Into::into))
                            .map_err(Into::into)
                    })
                })
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Buffered(bytes) => bytes.is_empty(),
            Self::Passthrough(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            Self::Buffered(bytes) => {
                http_body::SizeHint::with_exact(bytes.len() as u64)
            }
            Self::Passthrough(body) => body.size_hint(),
        }
    }
}
