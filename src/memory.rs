//! In-memory pool implementation.
//!
//! The reference [`CachePool`] backend: a concurrent map with TTLs
//! honored lazily on read. Suitable for tests, local caching, and as the
//! template for wiring a real backend.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::PoolResult;
use crate::pool::CachePool;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn new(value: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// DashMap-backed pool honoring per-record TTLs.
#[derive(Debug, Default)]
pub struct MemoryPool {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    /// Whether the pool holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired records eagerly. Reads already ignore them; this
    /// just reclaims the memory.
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }

    /// Remove a record out-of-band, simulating backend eviction (LRU,
    /// out-of-memory). Tests use this to exercise tag-record loss.
    pub fn evict(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

#[async_trait]
impl CachePool for MemoryPool {
    async fn get_many(&self, keys: &[String]) -> PoolResult<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::new();
        for key in keys {
            if let Some(entry) = self.entries.get(key) {
                if entry.is_expired() {
                    drop(entry);
                    self.entries.remove(key);
                } else {
                    found.insert(key.clone(), entry.value.clone());
                }
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> PoolResult<bool> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value, ttl));
        Ok(true)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> PoolResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, keys: &[String]) -> PoolResult<bool> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> PoolResult<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear(&self, prefix: Option<&str>) -> PoolResult<bool> {
        match prefix {
            None | Some("") => self.entries.clear(),
            Some(prefix) => self.entries.retain(|key, _| !key.starts_with(prefix)),
        }
        Ok(true)
    }
}
