use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{future::Cache, Expiry};

use crate::{CacheEntry, CacheManager, Result};

/// Implements [`CacheManager`] with [`moka`](https://github.com/moka-rs/moka)
/// as the in-memory backend. Entry lifetimes are enforced by moka itself
/// through a per-entry expiry policy.
#[derive(Clone)]
pub struct MokaManager {
    cache: Cache<String, Stored>,
}

#[derive(Clone)]
struct Stored {
    ttl: Option<Duration>,
    bytes: Arc<Vec<u8>>,
}

struct EntryTtl;

impl Expiry<String, Stored> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

impl fmt::Debug for MokaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaManager").finish_non_exhaustive()
    }
}

impl Default for MokaManager {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MokaManager {
    /// Creates a manager holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(EntryTtl)
                .build(),
        }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheManager for MokaManager {
    async fn get(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        match self.cache.get(cache_key).await {
            Some(stored) => Ok(Some(postcard::from_bytes(&stored.bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        cache_key: String,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = postcard::to_allocvec(&entry)?;
        self.cache
            .insert(cache_key, Stored { ttl, bytes: Arc::new(bytes) })
            .await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn delete(&self, cache_key: &str) -> Result<()> {
        self.cache.invalidate(cache_key).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}
