use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// A boxed error for body and backend failures crossing the middleware
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A generic error for HTTP caches
#[derive(Error, Debug)]
pub enum CacheError {
    /// Error from http
    #[error(transparent)]
    Http(#[from] http::Error),
    /// There was an error converting the header to a string
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// The rule set was misconfigured
    #[error(transparent)]
    Rule(#[from] crate::rules::RuleError),
    /// Error from cacache
    #[cfg(feature = "manager-cacache")]
    #[error(transparent)]
    CaCache(#[from] cacache::Error),
    /// Error from the entry serialization format
    #[cfg(any(feature = "manager-cacache", feature = "manager-moka"))]
    #[error(transparent)]
    Postcard(#[from] postcard::Error),
    /// A custom storage backend failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl CacheError {
    /// Wraps an arbitrary storage backend failure
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
