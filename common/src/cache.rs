//! Keyed async cache with hit/miss accounting.
//!
//! The dataframe cache manager keeps its registered plans here. Lookups made
//! through [`Cache::get`] count towards the statistics; bookkeeping reads go
//! through [`Cache::peek`] so they do not skew them.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use moka::future::Cache as MokaCache;

use crate::error::{CommonError, Result};

#[async_trait]
pub trait Cache<K, V>: Send + Sync + Debug
where
    K: Send + Sync + Clone + Hash + Eq + Debug + 'static,
    V: Send + Sync + Clone + Debug + 'static,
{
    /// Look a key up, recording a hit or a miss.
    async fn get(&self, key: &K) -> Option<V>;

    async fn peek(&self, key: &K) -> Option<V>;

    async fn put(&self, key: K, value: V);

    async fn remove(&self, key: &K) -> Option<V>;

    async fn keys(&self) -> Vec<K>;

    async fn clear(&self);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub entry_count: u64,
}

/// Builds a moka-backed [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    max_capacity: u64,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self {
            max_capacity: 1_000,
        }
    }
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on the number of entries. Beyond it moka evicts by recency.
    pub fn max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = capacity;
        self
    }

    pub fn build<K, V>(self) -> Result<Arc<dyn Cache<K, V>>>
    where
        K: Send + Sync + Clone + Hash + Eq + Debug + 'static,
        V: Send + Sync + Clone + Debug + 'static,
    {
        if self.max_capacity == 0 {
            return Err(CommonError::configuration(
                "cache capacity must be greater than zero",
            ));
        }
        Ok(Arc::new(MokaStore {
            inner: MokaCache::new(self.max_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }))
    }
}

#[derive(Debug)]
struct MokaStore<K, V>
where
    K: Send + Sync + Clone + Hash + Eq + Debug + 'static,
    V: Send + Sync + Clone + Debug + 'static,
{
    inner: MokaCache<K, V>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[async_trait]
impl<K, V> Cache<K, V> for MokaStore<K, V>
where
    K: Send + Sync + Clone + Hash + Eq + Debug + 'static,
    V: Send + Sync + Clone + Debug + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.get(key).await;
        let counter = if value.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    async fn peek(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }

    async fn put(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    async fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).await
    }

    async fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|(k, _)| k.as_ref().clone()).collect()
    }

    async fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
    }

    async fn len(&self) -> usize {
        self.inner.run_pending_tasks().await;
        self.inner.entry_count() as usize
    }

    async fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks().await;
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            entry_count: self.inner.entry_count(),
        }
    }
}
