//! The response metadata view: a parsed [`Cache-Control`] model plus the
//! freshness, validation, and cacheability judgements made against a single
//! response at a single instant.
//!
//! [`Cache-Control`]: https://datatracker.ietf.org/doc/html/rfc2616#section-14.9

use std::{
    collections::BTreeMap,
    fmt::Write,
    time::SystemTime,
};

use bytes::Bytes;
use http::{
    header::{AGE, CACHE_CONTROL, DATE, ETAG, EXPIRES, LAST_MODIFIED, VARY},
    response, HeaderMap, HeaderValue, Response, StatusCode,
};

// rfc2616 13.4, restricted to the statuses this cache understands
const CACHEABLE_STATUS_CODES: &[u16] = &[200, 203, 300, 301, 302, 404, 410];

// rfc2616 10.3.5: headers that must not accompany a 304
const NOT_MODIFIED_OMIT_HEADERS: &[&str] = &[
    "allow",
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "last-modified",
];

/// A parsed `Cache-Control` header.
///
/// Known directives get typed fields; anything else lands in `extensions`
/// and survives re-serialization. Directive order is not preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-store` is present
    pub no_store: bool,
    /// `no-cache` is present
    pub no_cache: bool,
    /// `private` is present
    pub private: bool,
    /// `public` is present
    pub public: bool,
    /// `must-revalidate` is present
    pub must_revalidate: bool,
    /// `proxy-revalidate` is present
    pub proxy_revalidate: bool,
    /// Numeric `max-age` value
    pub max_age: Option<u64>,
    /// Numeric `s-maxage` value
    pub s_maxage: Option<u64>,
    /// Unknown directives, and known directives whose value did not parse
    pub extensions: BTreeMap<String, Option<String>>,
}

impl CacheControl {
    /// Parses a single header value. Empty tokens are ignored and malformed
    /// numeric values are preserved verbatim in `extensions`.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        for part in value.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            let mut kv = part.splitn(2, '=');
            let k = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
            if k.is_empty() {
                continue;
            }
            let v = kv.next().map(|v| v.trim().trim_matches('"').to_string());
            match (k.as_str(), &v) {
                ("no-store", None) => cc.no_store = true,
                ("no-cache", None) => cc.no_cache = true,
                ("private", None) => cc.private = true,
                ("public", None) => cc.public = true,
                ("must-revalidate", None) => cc.must_revalidate = true,
                ("proxy-revalidate", None) => cc.proxy_revalidate = true,
                ("max-age", Some(raw)) => match raw.parse() {
                    Ok(n) => cc.max_age = Some(n),
                    Err(_) => {
                        cc.extensions.insert(k, v);
                    }
                },
                ("s-maxage", Some(raw)) => match raw.parse() {
                    Ok(n) => cc.s_maxage = Some(n),
                    Err(_) => {
                        cc.extensions.insert(k, v);
                    }
                },
                // A known flag carrying a value still counts as the flag,
                // but the raw pair is what gets re-emitted.
                ("no-store", Some(_)) => {
                    cc.no_store = true;
                    cc.extensions.insert(k, v);
                }
                ("no-cache", Some(_)) => {
                    cc.no_cache = true;
                    cc.extensions.insert(k, v);
                }
                ("private", Some(_)) => {
                    cc.private = true;
                    cc.extensions.insert(k, v);
                }
                ("public", Some(_)) => {
                    cc.public = true;
                    cc.extensions.insert(k, v);
                }
                ("must-revalidate", Some(_)) => {
                    cc.must_revalidate = true;
                    cc.extensions.insert(k, v);
                }
                ("proxy-revalidate", Some(_)) => {
                    cc.proxy_revalidate = true;
                    cc.extensions.insert(k, v);
                }
                _ => {
                    cc.extensions.insert(k, v);
                }
            }
        }
        cc
    }

    /// Parses every `Cache-Control` value present in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut joined = String::new();
        for value in headers.get_all(CACHE_CONTROL) {
            if let Ok(v) = value.to_str() {
                if !joined.is_empty() {
                    joined.push(',');
                }
                joined.push_str(v);
            }
        }
        Self::parse(&joined)
    }

    /// True when no directive at all is set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Re-serializes the directive mapping, or `None` when it is empty and
    /// the header should be omitted entirely.
    pub fn to_header_value(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::new();
        let flags = [
            ("no-store", self.no_store),
            ("no-cache", self.no_cache),
            ("public", self.public),
            ("private", self.private),
            ("must-revalidate", self.must_revalidate),
            ("proxy-revalidate", self.proxy_revalidate),
        ];
        for (name, set) in flags {
            // Value-carrying variants of known flags live in extensions.
            if set && !self.extensions.contains_key(name) {
                push_directive(&mut out, name, None);
            }
        }
        if let Some(n) = self.max_age {
            push_directive(&mut out, "max-age", Some(&n.to_string()));
        }
        if let Some(n) = self.s_maxage {
            push_directive(&mut out, "s-maxage", Some(&n.to_string()));
        }
        for (name, value) in &self.extensions {
            push_directive(&mut out, name, value.as_deref());
        }
        Some(out)
    }
}

fn push_directive(out: &mut String, name: &str, value: Option<&str>) {
    if !out.is_empty() {
        out.push_str(", ");
    }
    out.push_str(name);
    if let Some(v) = value {
        let needs_quote =
            v.is_empty() || v.bytes().any(|b| !b.is_ascii_alphanumeric());
        out.push('=');
        if needs_quote {
            let _ = write!(out, "\"{v}\"");
        } else {
            out.push_str(v);
        }
    }
}

/// A view over a single response triple `(status, headers, body)` with the
/// freshness arithmetic of rfc2616 13 attached.
///
/// The clock is captured once at construction so every judgement against
/// this response uses the same reading. The view is request-local and never
/// shared.
#[derive(Debug, Clone)]
pub struct ResponseView {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    cache_control: CacheControl,
    now: SystemTime,
}

impl ResponseView {
    /// Wraps a response triple, capturing the current time.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self::with_clock(status, headers, body, SystemTime::now())
    }

    /// Wraps a response triple against an explicit clock reading.
    pub fn with_clock(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        now: SystemTime,
    ) -> Self {
        let cache_control = CacheControl::from_headers(&headers);
        Self { status, headers, body, cache_control, now }
    }

    /// Wraps an owned `http::Response`.
    pub fn from_response(response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        Self::from_parts(parts, body)
    }

    /// Wraps response parts plus a materialized body.
    pub fn from_parts(parts: response::Parts, body: Bytes) -> Self {
        Self::new(parts.status, parts.headers, body)
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The underlying header collection.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the underlying header collection.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The materialized body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The parsed directive mapping.
    pub fn cache_control(&self) -> &CacheControl {
        &self.cache_control
    }

    /// Mutable access to the parsed directive mapping. Changes are written
    /// back to the header collection on [`finalize`](Self::finalize).
    pub fn cache_control_mut(&mut self) -> &mut CacheControl {
        &mut self.cache_control
    }

    /// The clock reading frozen at construction.
    pub fn clock(&self) -> SystemTime {
        self.now
    }

    /// Re-derives the directive mapping after the `Cache-Control` header
    /// was replaced wholesale (a revalidation merge).
    pub(crate) fn reparse_cache_control(&mut self) {
        self.cache_control = CacheControl::from_headers(&self.headers);
    }

    /// A clone of the header collection with the current directive mapping
    /// serialized in, suitable for persisting.
    pub fn serialized_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        write_cache_control(&mut headers, &self.cache_control);
        headers
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn set_header(&mut self, name: http::header::HeaderName, value: &str) {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
    }

    /// The `Expires` header as an instant, `None` when absent or malformed.
    pub fn expires(&self) -> Option<SystemTime> {
        self.header_str("expires").and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// Sets the `Expires` header in RFC 1123 format.
    pub fn set_expires(&mut self, at: SystemTime) {
        self.set_header(EXPIRES, &httpdate::fmt_http_date(at));
    }

    /// The `Date` header as an instant, `None` when absent or malformed.
    pub fn date(&self) -> Option<SystemTime> {
        self.header_str("date").and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// Sets the `Date` header in RFC 1123 format.
    pub fn set_date(&mut self, at: SystemTime) {
        self.set_header(DATE, &httpdate::fmt_http_date(at));
    }

    /// The raw `ETag` header.
    pub fn etag(&self) -> Option<&str> {
        self.header_str("etag")
    }

    /// Sets the `ETag` header.
    pub fn set_etag(&mut self, value: &str) {
        self.set_header(ETAG, value);
    }

    /// The raw `Vary` header.
    pub fn vary(&self) -> Option<&str> {
        self.header_str("vary")
    }

    /// Sets the `Vary` header.
    pub fn set_vary(&mut self, value: &str) {
        self.set_header(VARY, value);
    }

    /// The raw `Last-Modified` header. Deliberately never parsed to an
    /// instant: validator comparison is byte-for-byte against
    /// `If-Modified-Since`, so origin byte-identity must be preserved.
    pub fn last_modified(&self) -> Option<&str> {
        self.header_str("last-modified")
    }

    /// Sets the `Last-Modified` header.
    pub fn set_last_modified(&mut self, value: &str) {
        self.set_header(LAST_MODIFIED, value);
    }

    /// Current age in seconds: the `Age` header when it parses, otherwise
    /// `now − Date` clamped at zero, otherwise zero.
    pub fn age(&self) -> u64 {
        if let Some(age) = self.header_str("age").and_then(|v| v.parse().ok()) {
            return age;
        }
        self.date()
            .and_then(|date| self.now.duration_since(date).ok())
            .map_or(0, |elapsed| elapsed.as_secs())
    }

    /// Overwrites the `Age` header.
    pub fn set_age(&mut self, seconds: u64) {
        self.set_header(AGE, &seconds.to_string());
    }

    /// Recomputes age from the `Date` header and the captured clock,
    /// discarding whatever `Age` the response carried. Applied to every
    /// stored response before it is judged or served.
    pub fn refresh_age(&mut self) {
        let age = self
            .date()
            .and_then(|date| self.now.duration_since(date).ok())
            .map_or(0, |elapsed| elapsed.as_secs());
        self.set_age(age);
    }

    /// Freshness lifetime in seconds: `s-maxage`, else `max-age`, else
    /// `Expires − Date` (`Expires − now` when `Date` is absent), clamped at
    /// zero. `None` when the response declares no lifetime at all.
    pub fn max_age(&self) -> Option<u64> {
        if let Some(n) = self.cache_control.s_maxage {
            return Some(n);
        }
        if let Some(n) = self.cache_control.max_age {
            return Some(n);
        }
        let expires = self.expires()?;
        let base = self.date().unwrap_or(self.now);
        Some(expires.duration_since(base).map_or(0, |left| left.as_secs()))
    }

    /// Seconds of freshness remaining, possibly negative. `None` when no
    /// lifetime is declared.
    pub fn ttl(&self) -> Option<i64> {
        self.max_age().map(|max_age| max_age as i64 - self.age() as i64)
    }

    /// Extends the lifetime to `seconds` from now by writing
    /// `s-maxage = age + seconds`.
    pub fn set_ttl(&mut self, seconds: u64) {
        self.cache_control.s_maxage = Some(self.age() + seconds);
    }

    /// Forces a fresh response stale by driving its age up to its lifetime.
    pub fn expire(&mut self) {
        if self.is_fresh() {
            if let Some(max_age) = self.max_age() {
                self.set_age(max_age);
            }
        }
    }

    /// A response is fresh while it has a declared lifetime it has not yet
    /// outlived.
    pub fn is_fresh(&self) -> bool {
        self.ttl().is_some_and(|ttl| ttl > 0)
    }

    /// A response is validateable when it carries a validator usable in a
    /// conditional request.
    pub fn is_validateable(&self) -> bool {
        self.headers.contains_key(LAST_MODIFIED)
            || self.headers.contains_key(ETAG)
    }

    /// Whether this response may be stored by a shared cache. Conservative:
    /// anything absent or malformed counts against storing.
    pub fn is_cacheable(&self) -> bool {
        CACHEABLE_STATUS_CODES.contains(&self.status.as_u16())
            && !self.cache_control.no_store
            && !self.cache_control.private
            && (self.is_validateable() || self.is_fresh())
    }

    /// Whether the origin demands revalidation once stale (`must-revalidate`
    /// or its shared-cache variant `proxy-revalidate`).
    pub fn is_must_revalidate(&self) -> bool {
        self.cache_control.must_revalidate
            || self.cache_control.proxy_revalidate
    }

    /// Rewrites the response into a conformant `304 Not Modified`: empty
    /// body, and none of the entity headers rfc2616 10.3.5 forbids.
    pub fn make_not_modified(&mut self) {
        self.status = StatusCode::NOT_MODIFIED;
        self.body = Bytes::new();
        for name in NOT_MODIFIED_OMIT_HEADERS {
            self.headers.remove(*name);
        }
    }

    /// Hands the triple back, re-serializing the directive mapping into a
    /// single `Cache-Control` header (omitted entirely when empty).
    pub fn finalize(mut self) -> Response<Bytes> {
        write_cache_control(&mut self.headers, &self.cache_control);
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

fn write_cache_control(headers: &mut HeaderMap, cache_control: &CacheControl) {
    match cache_control.to_header_value() {
        Some(value) => {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(CACHE_CONTROL, value);
            }
        }
        None => {
            headers.remove(CACHE_CONTROL);
        }
    }
}
