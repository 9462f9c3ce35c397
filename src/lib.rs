#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A shared HTTP caching middleware for [tower](https://docs.rs/tower)
//! services.
//!
//! The middleware sits between an HTTP client (or upstream reverse proxy)
//! and a backend service, answers GET and HEAD requests from a pluggable
//! key-value store when freshness and validation rules permit, and falls
//! back to the backend otherwise. It implements the shared-cache subset of
//! HTTP/1.1 caching (RFC 2616 §13): freshness from `Cache-Control` and
//! `Expires`, conditional revalidation with `If-Modified-Since` and
//! `If-None-Match`, invalidation on unsafe methods, pass-through of
//! uncacheable traffic, and per-route TTL rules.
//!
//! Every response carries a diagnostic trace of the dispatcher states the
//! request went through (`x-plack-cache`), the canonical cache key
//! (`x-plack-cache-key`), and handling times in microseconds
//! (`x-plack-cache-time`, with backend time split out into
//! `x-plack-cache-time-pass`).
//!
//! ## Basic usage
//!
//! ```rust
//! # #[cfg(feature = "manager-moka")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use bytes::Bytes;
//! use http_body_util::Full;
//! use proxy_cache::{
//!     CacheOptions, Matcher, MokaManager, ProxyCacheLayer, Rule, RuleSet,
//!     TtlSpec,
//! };
//! use tower::{service_fn, Layer};
//!
//! let options = CacheOptions {
//!     rules: RuleSet::new(vec![
//!         // Static assets get five minutes regardless of the origin.
//!         Rule::new(Matcher::pattern("^/assets/")?, TtlSpec::Seconds(300)),
//!         // Everything else keeps its own lifetime, capped at a minute.
//!         Rule::new(
//!             Matcher::pattern("^/")?,
//!             TtlSpec::Range { min: None, max: Some(60) },
//!         ),
//!     ])?,
//!     ..Default::default()
//! };
//!
//! let layer = ProxyCacheLayer::with_options(MokaManager::default(), options);
//! let service = layer.layer(service_fn(|_req: http::Request<Full<Bytes>>| {
//!     async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(Full::new(
//!             Bytes::from("hello"),
//!         )))
//!     }
//! }));
//! # let _ = service;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "manager-moka"))]
//! # fn main() {}
//! ```
//!
//! ## Rules
//!
//! The cache does nothing without rules: requests no rule matches are
//! passed straight through. A rule pairs a [`Matcher`] (a path pattern or a
//! predicate that may rewrite the path) with a [`TtlSpec`]: a fixed
//! lifetime, a clamping range over the origin-declared lifetime, or a
//! forced invalidation. The first matching rule wins, so more specific
//! rules go first.
//!
//! ## Storage
//!
//! Entries live behind the [`CacheManager`] trait. Two managers ship with
//! the crate: [`MokaManager`] (in-memory, feature `manager-moka`, default)
//! and [`CACacheManager`] (on disk, feature `manager-cacache`). TTL
//! interpretation is delegated to the manager. A broken store degrades the
//! middleware to annotated pass-through: read failures count as misses and
//! write failures are logged and swallowed.

mod error;
mod managers;
mod middleware;
mod response;
mod rules;

use std::{fmt, time::Duration};

use http::{
    header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH},
    request, response as http_response, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri,
};
use serde::{Deserialize, Serialize};
use url::Url;

pub use error::{BoxError, CacheError, Result};
pub use middleware::{
    CacheBody, ProxyCacheLayer, ProxyCacheService, ServiceError,
};
pub use response::{CacheControl, ResponseView};
pub use rules::{
    Matcher, PathPredicate, Rule, RuleError, RuleMatch, RuleSet, TtlSpec,
};

#[cfg(feature = "manager-cacache")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-cacache")))]
pub use managers::cacache::CACacheManager;

#[cfg(feature = "manager-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
pub use managers::moka::MokaManager;

/// `x-plack-cache` header: the comma-joined dispatcher trace for the request
pub const TRACE_HEADER: &str = "x-plack-cache";
/// `x-plack-cache-key` header: the canonical cache key for the request
pub const CACHE_KEY_HEADER: &str = "x-plack-cache-key";
/// `x-plack-cache-time` header: handling time in microseconds, backend time
/// excluded
pub const CACHE_TIME_HEADER: &str = "x-plack-cache-time";
/// `x-plack-cache-time-pass` header: backend time in microseconds, present
/// only when the backend was called
pub const CACHE_TIME_PASS_HEADER: &str = "x-plack-cache-time-pass";

// 304 headers adopted from a revalidation response onto the stored entry
const NOT_MODIFIED_MERGE_HEADERS: &[&str] =
    &["date", "expires", "cache-control", "etag", "last-modified"];

/// A dispatcher state token. Exactly one token is recorded per state the
/// request enters, in order, and the sequence is emitted in the
/// [`TRACE_HEADER`] response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trace {
    /// The cache was consulted for this request
    Lookup,
    /// Storage held an entry for the key
    Hit,
    /// Storage held nothing for the key
    Miss,
    /// The backend was asked for a full response
    Fetch,
    /// The response was written to storage
    Store,
    /// The request was forwarded without further cache involvement
    Pass,
    /// The entry for the key was removed
    Invalidate,
    /// An `Expect` header forced pass-through
    Expect,
    /// A client reload bypassed the stored entry
    Reload,
    /// A stale entry was revalidated against the backend
    Validate,
    /// The backend confirmed the stored entry with a 304
    NotModified,
    /// A fresh entry was served with its age recomputed
    Refurbish,
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lookup => "lookup",
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Fetch => "fetch",
            Self::Store => "store",
            Self::Pass => "pass",
            Self::Invalidate => "invalidate",
            Self::Expect => "expect",
            Self::Reload => "reload",
            Self::Validate => "validate",
            Self::NotModified => "notmodified",
            Self::Refurbish => "refurbish",
        })
    }
}

/// A persisted response triple.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CachedResponse {
    /// HTTP response status code
    pub status: u16,
    /// HTTP response headers as ordered name/value pairs
    pub headers: Vec<(String, String)>,
    /// HTTP response body
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Captures a [`ResponseView`] for storage, with its directive mapping
    /// serialized back into the headers.
    pub fn from_view(view: &ResponseView) -> Self {
        Self {
            status: view.status().as_u16(),
            headers: headers_to_pairs(&view.serialized_headers()),
            body: view.body().to_vec(),
        }
    }

    /// The stored status as a [`StatusCode`].
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The stored headers as a [`HeaderMap`], skipping anything that no
    /// longer parses.
    pub fn header_map(&self) -> HeaderMap {
        pairs_to_header_map(&self.headers)
    }

    /// Rehydrates the triple into a [`ResponseView`] against the current
    /// clock.
    pub fn into_view(self) -> ResponseView {
        let headers = self.header_map();
        ResponseView::new(self.status_code(), headers, self.body.into())
    }
}

/// A persisted cache entry: the stored response plus the request headers it
/// was fetched with. The request headers exist to feed future `Vary`
/// negotiation and are not consulted yet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheEntry {
    /// Headers of the request that produced the stored response
    pub request_headers: Vec<(String, String)>,
    /// The stored response triple
    pub response: CachedResponse,
}

impl CacheEntry {
    /// Builds an entry from the inbound request headers and a captured
    /// response.
    pub fn new(request_headers: &HeaderMap, response: CachedResponse) -> Self {
        Self { request_headers: headers_to_pairs(request_headers), response }
    }
}

/// A trait providing methods for storing, reading, and removing cache
/// records. TTL interpretation is delegated to the implementation; `None`
/// means no storage-imposed lifetime.
#[async_trait::async_trait]
pub trait CacheManager: Send + Sync + 'static {
    /// Attempts to pull a cached entry, `None` on miss.
    async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>>;
    /// Attempts to cache an entry for at most `ttl`.
    async fn put(
        &self,
        cache_key: String,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()>;
    /// Attempts to remove a record from cache.
    async fn delete(&self, cache_key: &str) -> Result<()>;
}

/// Configuration consumed by the dispatcher.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Ordered TTL rules. An empty set caches nothing.
    pub rules: RuleSet,
    /// Header names stripped from backend responses before wrapping.
    pub scrub: Vec<String>,
    /// When false (the default), requests with a query string invalidate
    /// the query-less key and pass through; when true the query is part of
    /// the cache key.
    pub cache_queries: bool,
    /// When true, a client `Cache-Control: no-cache` bypasses the stored
    /// entry and refetches. Ignored when false (the default).
    pub allow_reload: bool,
    /// Request headers that mark a response `private` unless the response
    /// declared `public` itself.
    pub private_headers: Vec<String>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            rules: RuleSet::default(),
            scrub: Vec::new(),
            cache_queries: false,
            allow_reload: false,
            private_headers: vec![
                "authorization".to_string(),
                "cookie".to_string(),
            ],
        }
    }
}

/// The cache core: a storage manager plus the dispatch configuration.
/// Wrap it in a [`ProxyCacheLayer`] to put it in front of a service.
#[derive(Debug, Clone)]
pub struct ProxyCache<M: CacheManager> {
    /// Manager instance that implements the [`CacheManager`] trait.
    pub manager: M,
    /// The dispatch configuration.
    pub options: CacheOptions,
}

impl<M: CacheManager> ProxyCache<M> {
    /// Builds a cache with default options around a manager.
    pub fn new(manager: M) -> Self {
        Self { manager, options: CacheOptions::default() }
    }

    /// Builds a cache from a manager and explicit options.
    pub fn with_options(manager: M, options: CacheOptions) -> Self {
        Self { manager, options }
    }

    /// The canonical cache key for a request: the normalized absolute URL
    /// (lowercased scheme and host, default port elided), with the query
    /// stripped unless `cache_queries` is set. The method is never part of
    /// the key, so HEAD is answered from a GET entry.
    pub fn cache_key(&self, parts: &request::Parts) -> String {
        match request_url(parts) {
            Some(mut url) => {
                url.set_fragment(None);
                if !self.options.cache_queries {
                    url.set_query(None);
                }
                url.to_string()
            }
            // No recoverable authority; key on the path instead of
            // refusing to serve.
            None => match parts.uri.query() {
                Some(query) if self.options.cache_queries => {
                    format!("{}?{}", parts.uri.path(), query)
                }
                _ => parts.uri.path().to_string(),
            },
        }
    }

    pub(crate) async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        match self.manager.get(key).await {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("cache read for {key} failed, treating as miss: {err}");
                None
            }
        }
    }

    pub(crate) async fn invalidate(&self, key: &str) {
        if let Err(err) = self.manager.delete(key).await {
            log::warn!("cache invalidation for {key} failed: {err}");
        }
    }

    pub(crate) async fn store(
        &self,
        key: String,
        request_headers: &HeaderMap,
        view: &ResponseView,
        ttl: Option<Duration>,
    ) {
        let entry =
            CacheEntry::new(request_headers, CachedResponse::from_view(view));
        if let Err(err) = self.manager.put(key, entry, ttl).await {
            log::warn!("cache store failed: {err}");
        }
    }

    /// Readies a backend response for the store decision: scrubs configured
    /// headers, anchors a missing `Date`, marks the response private when
    /// the request carried credential headers, and arbitrates the rule TTL
    /// against the origin-declared one (`must-revalidate` lets the origin
    /// win). Returns the lifetime to hand to storage.
    pub(crate) fn prepare_store(
        &self,
        request_headers: &HeaderMap,
        view: &mut ResponseView,
        ttl: TtlSpec,
    ) -> Option<Duration> {
        for name in &self.options.scrub {
            view.headers_mut().remove(name.as_str());
        }
        if view.date().is_none() {
            view.set_date(view.clock());
        }
        let marks_private = self
            .options
            .private_headers
            .iter()
            .any(|name| request_headers.contains_key(name.as_str()));
        if marks_private && !view.cache_control().public {
            view.cache_control_mut().private = true;
        }
        if !view.is_must_revalidate() {
            if let Some(seconds) = ttl.arbitrate(view.ttl()) {
                if view.ttl() != Some(seconds as i64) {
                    view.set_ttl(seconds);
                }
            }
        }
        view.ttl().filter(|ttl| *ttl > 0).map(|ttl| Duration::from_secs(ttl as u64))
    }
}

/// Clones request parts for an unconditional backend fetch: the cache is
/// not conditionally fetching, so client validators are stripped. Cache
/// fills always go out as GET, since the entry answers GET and HEAD alike
/// and a HEAD-shaped fill would persist an empty body under the shared key.
pub(crate) fn fetch_parts(parts: &request::Parts) -> request::Parts {
    let mut sub = parts.clone();
    sub.method = http::Method::GET;
    sub.headers.remove(IF_MODIFIED_SINCE);
    sub.headers.remove(IF_NONE_MATCH);
    sub
}

/// Clones request parts for revalidating a stored response:
/// `If-Modified-Since` is the stored `Last-Modified` byte-for-byte, and
/// `If-None-Match` is the union of the client-supplied set and the stored
/// response's validators.
pub(crate) fn conditional_parts(
    parts: &request::Parts,
    stored: &ResponseView,
) -> request::Parts {
    let mut sub = parts.clone();
    sub.method = http::Method::GET;
    match stored.last_modified() {
        Some(last_modified) => {
            if let Ok(value) = HeaderValue::from_str(last_modified) {
                sub.headers.insert(IF_MODIFIED_SINCE, value);
            }
        }
        None => {
            sub.headers.remove(IF_MODIFIED_SINCE);
        }
    }
    let mut etags = etag_list(parts.headers.get_all(IF_NONE_MATCH));
    for etag in etag_list(stored.headers().get_all(ETAG)) {
        if !etags.contains(&etag) {
            etags.push(etag);
        }
    }
    if etags.is_empty() {
        sub.headers.remove(IF_NONE_MATCH);
    } else if let Ok(value) = HeaderValue::from_str(&etags.join(", ")) {
        sub.headers.insert(IF_NONE_MATCH, value);
    }
    sub
}

/// A 304 whose validator matched something the client supplied but the
/// cache does not hold belongs to the client, not to the stored entry.
pub(crate) fn client_validator_wins(
    parts: &request::Parts,
    stored: &ResponseView,
    not_modified: &http_response::Parts,
) -> bool {
    let etag = match not_modified.headers.get(ETAG).and_then(|v| v.to_str().ok())
    {
        Some(etag) => etag.trim().to_string(),
        None => return false,
    };
    let client = etag_list(parts.headers.get_all(IF_NONE_MATCH));
    let held = etag_list(stored.headers().get_all(ETAG));
    client.contains(&etag) && !held.contains(&etag)
}

/// Adopts the freshness headers of a revalidation 304 onto the stored
/// response and recomputes its age against the new `Date`.
pub(crate) fn merge_not_modified(
    stored: &mut ResponseView,
    not_modified: &http_response::Parts,
) {
    for name in NOT_MODIFIED_MERGE_HEADERS {
        if let Some(value) = not_modified.headers.get(*name) {
            stored
                .headers_mut()
                .insert(HeaderName::from_static(*name), value.clone());
        }
    }
    stored.reparse_cache_control();
    stored.refresh_age();
}

/// Swaps the request path after a rule rewrite, keeping the query intact.
/// An unparsable rewrite is dropped rather than failing the request.
pub(crate) fn rewrite_path(parts: &mut request::Parts, new_path: &str) {
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_string(),
    };
    match http::uri::PathAndQuery::try_from(path_and_query.as_str()) {
        Ok(path_and_query) => {
            let mut uri_parts = parts.uri.clone().into_parts();
            uri_parts.path_and_query = Some(path_and_query);
            if let Ok(uri) = Uri::from_parts(uri_parts) {
                parts.uri = uri;
            }
        }
        Err(err) => {
            log::warn!("ignoring rule path rewrite to {new_path:?}: {err}");
        }
    }
}

fn etag_list<'a>(
    values: impl IntoIterator<Item = &'a HeaderValue>,
) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|etag| !etag.is_empty())
        .map(str::to_string)
        .collect()
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn pairs_to_header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) =
            (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
        {
            headers.append(name, value);
        }
    }
    headers
}

/// Reconstructs the effective request URL from the parts, recovering the
/// scheme from `x-forwarded-proto` or the host when the URI is relative.
fn request_url(parts: &request::Parts) -> Option<Url> {
    if parts.uri.scheme().is_some() {
        return Url::parse(&parts.uri.to_string()).ok();
    }
    let host = parts
        .uri
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            parts
                .headers
                .get("host")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })?;
    let scheme = determine_scheme(&host, &parts.headers);
    let mut url = Url::parse(&format!("{scheme}://{host}/")).ok()?;
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());
    Some(url)
}

fn determine_scheme(host: &str, headers: &HeaderMap) -> &'static str {
    if let Some(proto) =
        headers.get("x-forwarded-proto").and_then(|value| value.to_str().ok())
    {
        return if proto.eq_ignore_ascii_case("http") { "http" } else { "https" };
    }
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    }
}
