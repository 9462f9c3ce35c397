use std::{
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{CacheEntry, CacheManager, Result};

/// Implements [`CacheManager`] with
/// [`cacache`](https://github.com/zkat/cacache-rs) as the on-disk backend.
///
/// cacache has no lifetime support of its own, so entries carry an
/// expiry stamp: an expired read counts as a miss and lazily removes the
/// record.
#[derive(Debug, Clone)]
pub struct CACacheManager {
    /// Directory where the cache will be stored.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct Stored {
    expires_at: Option<u64>,
    entry: CacheEntry,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

impl CACacheManager {
    /// Creates a manager rooted at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) -> Result<()> {
        cacache::clear(&self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheManager for CACacheManager {
    async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let bytes = match cacache::read(&self.path, cache_key).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let stored: Stored = postcard::from_bytes(&bytes)?;
        if stored.expires_at.is_some_and(|at| at <= unix_now()) {
            cacache::remove(&self.path, cache_key).await.ok();
            return Ok(None);
        }
        Ok(Some(stored.entry))
    }

    async fn put(
        &self,
        cache_key: String,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let stored = Stored {
            expires_at: ttl.map(|ttl| unix_now() + ttl.as_secs()),
            entry,
        };
        let bytes = postcard::to_allocvec(&stored)?;
        cacache::write(&self.path, cache_key, bytes).await?;
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> Result<()> {
        Ok(cacache::remove(&self.path, cache_key).await?)
    }
}
