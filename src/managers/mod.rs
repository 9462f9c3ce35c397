//! The [`CacheManager`](crate::CacheManager) implementations shipped with
//! the crate.

#[cfg(feature = "manager-cacache")]
pub mod cacache;

#[cfg(feature = "manager-moka")]
pub mod moka;
