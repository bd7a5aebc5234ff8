//! In-process cache backend.
//!
//! Stores exact `serde_json::Value` objects in a [`DashMap`] with lazy expiry
//! on read plus a periodic sweep task. Suitable for single-instance
//! deployments and as the automatic fallback when Redis is unreachable; not
//! visible to other proxy instances, so the distributed lock short-circuits
//! on top of it.

use super::{glob_match, CacheError, CacheStore, StoreStats};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, time::Instant};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self { value, expires_at: ttl.map(|d| Instant::now() + d) }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [`CacheStore`] backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

/// Interval between expiry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Spawns the periodic expiry sweeper.
    ///
    /// The task exits when the shutdown channel fires; it never pins the
    /// process alive on its own.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        let store = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let before = store.entries.len();
                        store.entries.retain(|_, entry| !entry.is_expired());
                        let removed = before.saturating_sub(store.entries.len());
                        if removed > 0 {
                            tracing::debug!(removed, "memory cache sweep");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Number of entries currently held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), MemoryEntry::new(value.clone(), ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        // The entry API holds the shard lock through the whole decision, so
        // two concurrent callers cannot both install.
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new(value.clone(), Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value.clone(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, CacheError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, CacheError> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get(key).await?);
        }
        Ok(results)
    }

    async fn multi_set(
        &self,
        entries: &[(String, Value)],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(key, value, ttl).await?;
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn backend_kind(&self) -> &'static str {
        "memory"
    }

    fn is_shared(&self) -> bool {
        false
    }

    async fn stats(&self) -> StoreStats {
        StoreStats { entries: Some(self.entries.len()) }
    }
}
