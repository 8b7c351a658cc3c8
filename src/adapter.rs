//! The tag-aware cache core.
//!
//! Orchestrates read validation, deferred writes, and tag-version
//! acquisition ordering over a pair of backing pools. The ordering rule
//! that makes invalidation safe under concurrency: during `commit`, tag
//! versions are obtained *before* any deferred value producer runs, so an
//! invalidation racing with a write leaves the written item carrying an
//! already-stale version that the next reader rejects.
//!
//! One instance serves one logical caller at a time (`&mut self`
//! throughout, no interior locks); concurrency happens between processes
//! sharing the pools.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::item::{unix_time_secs, CacheItem, ItemMetadata};
use crate::key::KeySpace;
use crate::pool::{CachePool, PoolCommand};
use crate::tags::{KnownTagVersions, TagVersionStore};

/// Operation counters kept by the core. Purely observational.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that validated and returned a value.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Records scheduled for deletion after failing validation.
    pub evictions: u64,
    /// Deferred items dropped at commit for lack of a tag version.
    pub rejected_saves: u64,
}

/// Tag-aware cache adapter over an item pool and a tag pool.
///
/// The two pools may be the same object; item and tag records carry
/// distinct reserved prefixes. This type intentionally derives no
/// serde traits: the adapter borrows live pool connections and is not a
/// value.
pub struct TagAwareCache {
    item_pool: Arc<dyn CachePool>,
    tag_store: TagVersionStore,
    known: KnownTagVersions,
    deferred: HashMap<String, CacheItem>,
    keys: KeySpace,
    default_lifetime: u64,
    stats: CacheStats,
}

impl TagAwareCache {
    /// Build an adapter over separate item and tag pools.
    ///
    /// Fails only on an invalid namespace; pool trouble surfaces later
    /// as `false` operation results.
    pub fn new(
        item_pool: Arc<dyn CachePool>,
        tag_pool: Arc<dyn CachePool>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        let keys = KeySpace::new(&config.namespace)?;
        let tag_store =
            TagVersionStore::with_keyspace(tag_pool, keys.clone(), config.tags_lifetime());
        Ok(Self {
            item_pool,
            tag_store,
            known: KnownTagVersions::new(config.known_tag_versions_ttl()),
            deferred: HashMap::new(),
            keys,
            default_lifetime: config.default_lifetime,
            stats: CacheStats::default(),
        })
    }

    /// Build an adapter storing items and tags in one shared pool.
    pub fn with_pool(pool: Arc<dyn CachePool>, config: CacheConfig) -> CacheResult<Self> {
        Self::new(pool.clone(), pool, config)
    }

    /// Whether `key` currently holds a validated hit.
    pub async fn has_item(&mut self, key: &str) -> bool {
        self.get_item(key).await.is_hit()
    }

    /// Fetch one item. Always returns an item; misses carry no value.
    pub async fn get_item(&mut self, key: &str) -> CacheItem {
        self.get_items(&[key])
            .await
            .remove(key)
            .unwrap_or_else(|| CacheItem::miss(key))
    }

    /// Fetch several items at once.
    ///
    /// An item is a hit only when its payload parses, its expiry has not
    /// passed, and every tag version it was saved with still matches the
    /// tag store. Anything else is a miss, and structurally invalid or
    /// stale records are deleted best-effort on the way out.
    pub async fn get_items(&mut self, keys: &[&str]) -> HashMap<String, CacheItem> {
        // Read-your-writes: flush pending saves that overlap the request.
        if keys.iter().any(|k| self.deferred.contains_key(*k)) {
            self.commit().await;
        }
        self.known.clear();

        let ids: Vec<String> = keys.iter().map(|k| self.keys.item_id(k)).collect();
        // Single-key reads go through the pool's singular path so that a
        // retrying proxy can spread them in time; batches never retry.
        let payloads = if ids.len() == 1 {
            match self.item_pool.get(&ids[0]).await {
                Ok(Some(payload)) => HashMap::from([(ids[0].clone(), payload)]),
                Ok(None) => HashMap::new(),
                Err(e) => {
                    log::warn!("item pool read failed: {}", e);
                    HashMap::new()
                }
            }
        } else {
            match self.item_pool.get_many(&ids).await {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("item pool read failed: {}", e);
                    HashMap::new()
                }
            }
        };

        let now = unix_time_secs();
        let mut items = HashMap::with_capacity(keys.len());
        let mut candidates: Vec<(&str, &String, codec::Unpacked)> = Vec::new();
        let mut evict: Vec<String> = Vec::new();

        for (key, id) in keys.iter().zip(&ids) {
            let Some(raw) = payloads.get(id) else {
                self.stats.misses += 1;
                items.insert(key.to_string(), CacheItem::miss(key));
                continue;
            };
            match codec::unpack(raw) {
                Ok(unpacked) => {
                    // A deadline equal to the current second still counts
                    // as valid; only a passed one expires.
                    let expired = unpacked
                        .expiry
                        .is_some_and(|deadline| u64::from(deadline) < now);
                    if expired {
                        self.stats.misses += 1;
                        evict.push(id.clone());
                        items.insert(key.to_string(), CacheItem::miss(key));
                    } else {
                        candidates.push((*key, id, unpacked));
                    }
                }
                Err(e) => {
                    log::debug!("evicting {}: {}", id, e);
                    self.stats.misses += 1;
                    evict.push(id.clone());
                    items.insert(key.to_string(), CacheItem::miss(key));
                }
            }
        }

        // One round trip for the union of every candidate's tags.
        let union: BTreeSet<String> = candidates
            .iter()
            .flat_map(|(_, _, u)| u.tag_versions.keys().cloned())
            .collect();
        let current = if union.is_empty() {
            HashMap::new()
        } else {
            match self.tag_store.get_or_create(&union).await {
                Ok(versions) => {
                    self.known.store(&versions);
                    versions
                }
                Err(e) => {
                    // Unknown versions invalidate every tagged candidate.
                    log::warn!("tag pool read failed: {}", e);
                    HashMap::new()
                }
            }
        };

        for (key, id, unpacked) in candidates {
            let valid = unpacked
                .tag_versions
                .iter()
                .all(|(tag, version)| current.get(tag) == Some(version));
            if valid {
                self.stats.hits += 1;
                let metadata = ItemMetadata {
                    expiry: unpacked.expiry,
                    ctime_ms: unpacked.ctime_ms,
                    tags: unpacked.tag_versions.keys().cloned().collect(),
                };
                items.insert(key.to_string(), CacheItem::hit(key, unpacked.value, metadata));
            } else {
                self.stats.misses += 1;
                evict.push(id.clone());
                items.insert(key.to_string(), CacheItem::miss(key));
            }
        }

        if !evict.is_empty() {
            self.stats.evictions += evict.len() as u64;
            if let Err(e) = self.item_pool.delete(&evict).await {
                log::debug!("best-effort eviction failed: {}", e);
            }
        }

        items
    }

    /// Stage an item for the next `commit`. A later save of the same key
    /// supersedes the earlier one.
    pub fn save_deferred(&mut self, item: CacheItem) -> bool {
        self.deferred.insert(item.key().to_string(), item);
        true
    }

    /// Stage and immediately commit one item.
    pub async fn save(&mut self, item: CacheItem) -> bool {
        self.save_deferred(item);
        self.commit().await
    }

    /// Persist every deferred item.
    ///
    /// Tag versions for the union of staged tags are acquired first;
    /// items whose tags did not all yield a version are dropped without
    /// running their producers. Returns `true` only when every staged
    /// item reached the pool.
    pub async fn commit(&mut self) -> bool {
        if self.deferred.is_empty() {
            return true;
        }
        let items: Vec<CacheItem> = self.deferred.drain().map(|(_, item)| item).collect();

        let union: BTreeSet<String> = items
            .iter()
            .flat_map(|item| item.staged_tags().iter().cloned())
            .collect();
        let versions = self.acquire_versions(&union).await;

        let now = unix_time_secs();
        let mut all_persisted = true;
        let mut writes: Vec<PoolCommand> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();

        for mut item in items {
            let staged_tags = item.staged_tags().clone();
            if !staged_tags.iter().all(|t| versions.contains_key(t)) {
                log::debug!(
                    "dropping deferred item {:?}: tag version unavailable",
                    item.key()
                );
                self.stats.rejected_saves += 1;
                all_persisted = false;
                continue;
            }

            let expiry = self.effective_expiry(&item, now);

            // The producer runs only now, after tag acquisition; its
            // wall time is charged to the item's ctime.
            let mut ctime_ms = item.observed_ctime_ms();
            let value = match item.take_producer() {
                Some(producer) => {
                    let started = Instant::now();
                    let value = producer();
                    let elapsed = started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
                    ctime_ms = ctime_ms.saturating_add(elapsed);
                    value
                }
                None => match item.take_value() {
                    Some(value) => value,
                    None => {
                        log::debug!("dropping deferred item {:?}: no value", item.key());
                        all_persisted = false;
                        continue;
                    }
                },
            };

            let id = self.keys.item_id(item.key());
            if let Some(deadline) = expiry {
                if u64::from(deadline) < now {
                    // Already past its deadline; deleting is the write.
                    deletes.push(id);
                    continue;
                }
            }

            let tag_versions: BTreeMap<String, Vec<u8>> = staged_tags
                .iter()
                .map(|t| (t.clone(), versions[t].clone()))
                .collect();
            let payload = match codec::pack(&value, &tag_versions, expiry, ctime_ms) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("packing {:?} failed: {}", item.key(), e);
                    all_persisted = false;
                    continue;
                }
            };
            // A deadline landing on the current second would yield a
            // zero TTL, which some backends reject; one second floor.
            let ttl =
                expiry.map(|deadline| Duration::from_secs((u64::from(deadline) - now).max(1)));
            writes.push(PoolCommand::Set {
                key: id,
                value: payload,
                ttl,
            });
        }

        if !deletes.is_empty() {
            writes.push(PoolCommand::Delete { keys: deletes });
        }
        if !writes.is_empty() {
            match self.item_pool.pipeline(writes).await {
                Ok(outcomes) => {
                    if outcomes.iter().any(|ok| !ok) {
                        all_persisted = false;
                    }
                }
                Err(e) => {
                    log::warn!("commit flush failed: {}", e);
                    all_persisted = false;
                }
            }
        }

        self.known.clear();
        all_persisted
    }

    /// Delete one item.
    pub async fn delete_item(&mut self, key: &str) -> bool {
        self.delete_items(&[key]).await
    }

    /// Delete several items, including any staged-but-uncommitted ones.
    pub async fn delete_items(&mut self, keys: &[&str]) -> bool {
        for key in keys {
            self.deferred.remove(*key);
        }
        let ids: Vec<String> = keys.iter().map(|k| self.keys.item_id(k)).collect();
        match self.item_pool.delete(&ids).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("delete failed: {}", e);
                false
            }
        }
    }

    /// Invalidate every item saved with any of `tags`.
    ///
    /// Deletes the tag records; items are left in place and fail
    /// validation on their next read. Calling this twice is
    /// indistinguishable from calling it once.
    pub async fn invalidate_tags(&mut self, tags: &[&str]) -> bool {
        self.known.clear();
        match self.tag_store.delete(tags).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("tag invalidation failed: {}", e);
                false
            }
        }
    }

    /// Discard staged items whose key starts with `prefix` (all of them
    /// for an empty prefix) and clear the matching slice of the item
    /// pool.
    pub async fn clear(&mut self, prefix: &str) -> bool {
        self.deferred.retain(|key, _| !key.starts_with(prefix));
        self.known.clear();
        let pool_prefix = self.keys.item_id(prefix);
        match self.item_pool.clear(Some(&pool_prefix)).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("clear failed: {}", e);
                false
            }
        }
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Versions for `tags`, from the memo when it covers the whole set
    /// within its freshness window, otherwise from the tag store. Errors
    /// collapse to "no versions": every affected item gets rejected
    /// rather than persisted unverifiable.
    async fn acquire_versions(&mut self, tags: &BTreeSet<String>) -> HashMap<String, Vec<u8>> {
        if tags.is_empty() {
            return HashMap::new();
        }
        if let Some(known) = self.known.get(tags) {
            return known;
        }
        match self.tag_store.get_or_create(tags).await {
            Ok(versions) => versions,
            Err(e) => {
                log::warn!("tag version acquisition failed: {}", e);
                HashMap::new()
            }
        }
    }

    fn effective_expiry(&self, item: &CacheItem, now: u64) -> Option<u32> {
        item.staged_expiry().or_else(|| {
            if self.default_lifetime > 0 {
                Some(now.saturating_add(self.default_lifetime).min(u64::from(u32::MAX)) as u32)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPool;

    fn cache_over(pool: Arc<MemoryPool>) -> TagAwareCache {
        TagAwareCache::with_pool(pool, CacheConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_save_and_read_back() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        let mut item = cache.get_item("foo").await;
        assert!(!item.is_hit());
        item.set_value(b"1".to_vec()).tags(["A", "B"]);
        assert!(cache.save(item).await);

        let read = cache.get_item("foo").await;
        assert!(read.is_hit());
        assert_eq!(read.value(), Some(&b"1"[..]));
        assert_eq!(read.metadata().tags.len(), 2);
    }

    #[tokio::test]
    async fn test_deferred_superseded_by_key() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        let mut first = cache.get_item("k").await;
        first.set_value(b"old".to_vec());
        cache.save_deferred(first);

        let mut second = cache.get_item("k").await;
        second.set_value(b"new".to_vec());
        cache.save_deferred(second);

        assert!(cache.commit().await);
        assert_eq!(cache.get_item("k").await.value(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_read_your_writes_flushes_deferred() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool.clone());

        let mut item = CacheItem::miss("k");
        item.set_value(b"v".to_vec());
        cache.save_deferred(item);

        // The read of a deferred key forces the commit first.
        assert!(cache.get_item("k").await.is_hit());
        assert!(pool.get("$k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_empty_is_true() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);
        assert!(cache.commit().await);
    }

    #[tokio::test]
    async fn test_producer_runs_and_charges_ctime() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        let mut item = CacheItem::miss("slow");
        item.set_value_producer(|| {
            std::thread::sleep(Duration::from_millis(25));
            b"computed".to_vec()
        });
        assert!(cache.save(item).await);

        let read = cache.get_item("slow").await;
        assert!(read.is_hit());
        assert_eq!(read.value(), Some(&b"computed"[..]));
        // ctime survives only alongside an expiry; none was staged here.
        assert_eq!(read.metadata().ctime_ms, 0);
    }

    #[tokio::test]
    async fn test_producer_ctime_persisted_with_expiry() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        let mut item = CacheItem::miss("slow");
        item.expires_after(Duration::from_secs(3600));
        item.set_value_producer(|| {
            std::thread::sleep(Duration::from_millis(25));
            b"computed".to_vec()
        });
        assert!(cache.save(item).await);

        let read = cache.get_item("slow").await;
        assert!(read.is_hit());
        assert!(read.metadata().ctime_ms >= 25);
    }

    #[tokio::test]
    async fn test_resaved_hit_keeps_its_expiry() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        let mut item = cache.get_item("doc").await;
        item.set_value(b"v1".to_vec());
        item.expires_after(Duration::from_secs(3600));
        assert!(cache.save(item).await);

        let mut fetched = cache.get_item("doc").await;
        assert!(fetched.is_hit());
        let original_expiry = fetched.metadata().expiry;
        assert!(original_expiry.is_some());

        // Bump the value without touching expiry or tags; the stored
        // deadline must come through the fetch-modify-save cycle intact.
        fetched.set_value(b"v2".to_vec());
        assert!(cache.save(fetched).await);

        let reread = cache.get_item("doc").await;
        assert!(reread.is_hit());
        assert_eq!(reread.value(), Some(&b"v2"[..]));
        assert_eq!(reread.metadata().expiry, original_expiry);
    }

    #[tokio::test]
    async fn test_item_without_value_fails_commit() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        cache.save_deferred(CacheItem::miss("empty"));
        assert!(!cache.commit().await);
    }

    #[tokio::test]
    async fn test_expired_stage_deletes_instead_of_writes() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool.clone());

        let mut item = CacheItem::miss("gone");
        item.set_value(b"v".to_vec()).expires_at(1);
        assert!(cache.save(item).await);
        assert!(pool.get("$gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        cache.get_item("nothing").await;
        let mut item = CacheItem::miss("k");
        item.set_value(b"v".to_vec());
        cache.save(item).await;
        cache.get_item("k").await;

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_clear_with_prefix() {
        let pool = Arc::new(MemoryPool::new());
        let mut cache = cache_over(pool);

        for key in ["user.1", "user.2", "post.1"] {
            let mut item = CacheItem::miss(key);
            item.set_value(b"v".to_vec());
            cache.save(item).await;
        }

        assert!(cache.clear("user.").await);
        assert!(!cache.has_item("user.1").await);
        assert!(!cache.has_item("user.2").await);
        assert!(cache.has_item("post.1").await);
    }
}
