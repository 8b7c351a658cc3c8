//! Tag-version store and the short-lived memo of recently read versions.
//!
//! Each tag maps to an opaque version token. Invalidating a tag deletes
//! its record; it is never overwritten, so a half-failed write in a
//! memory-pressured backend can never leave a stale token masquerading as
//! a fresh one. New tokens come only from the create-if-absent path, and
//! when concurrent creators race, whichever token lands first wins for
//! everyone.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rand::Rng;

use crate::error::PoolResult;
use crate::key::KeySpace;
use crate::pool::{CachePool, PoolCommand};

/// Probability that a fully-hit lookup refreshes the TTL of the tags it
/// touched. Tags read at least once a minute on average never expire;
/// cold tags age out.
const REFRESH_PROBABILITY: f64 = 60.0 / 86_400.0;

/// Stable per-process discriminator mixed into every version token to
/// keep tokens from different processes distinct even when their RNG
/// draws collide across restarts.
static INSTANCE_ID: Lazy<u32> = Lazy::new(|| {
    let hostname = gethostname::gethostname();
    let seed = format!("{}@{}", std::process::id(), hostname.to_string_lossy());
    let mut crc = flate2::Crc::new();
    crc.update(seed.as_bytes());
    crc.sum()
});

/// Generate a fresh 8-byte version token: four random bytes followed by
/// the process instance id.
pub(crate) fn new_version() -> Vec<u8> {
    let mut token = rand::thread_rng().gen::<u32>().to_le_bytes().to_vec();
    token.extend_from_slice(&INSTANCE_ID.to_le_bytes());
    token
}

/// The per-tag version store.
///
/// Answers `get_or_create` and `delete` against any [`CachePool`]. May
/// return fewer tags than requested: callers treat an absent version as
/// an invalidation.
pub struct TagVersionStore {
    pool: Arc<dyn CachePool>,
    keys: KeySpace,
    tags_lifetime: Option<Duration>,
}

impl TagVersionStore {
    /// Build a store over `pool`, scoped to `namespace`.
    pub fn new(
        pool: Arc<dyn CachePool>,
        namespace: &str,
        tags_lifetime: Option<Duration>,
    ) -> crate::error::CacheResult<Self> {
        Ok(Self::with_keyspace(
            pool,
            KeySpace::new(namespace)?,
            tags_lifetime,
        ))
    }

    pub(crate) fn with_keyspace(
        pool: Arc<dyn CachePool>,
        keys: KeySpace,
        tags_lifetime: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            keys,
            tags_lifetime,
        }
    }

    /// Read the current version of every tag, creating versions for tags
    /// that have none.
    ///
    /// Tag ids are processed in sorted order so that backends which
    /// serialise writes see every caller knock in the same sequence.
    /// For each absent tag a fresh token is offered with create-if-absent
    /// semantics; when the conditional set loses a race the tag is simply
    /// omitted from the result, since another writer's token is already
    /// current and a re-read is not required for correctness.
    pub async fn get_or_create(
        &self,
        tags: &BTreeSet<String>,
    ) -> PoolResult<HashMap<String, Vec<u8>>> {
        if tags.is_empty() {
            return Ok(HashMap::new());
        }

        // BTreeSet iteration is sorted, and ids share one prefix, so id
        // order matches tag order.
        let ids: Vec<String> = tags.iter().map(|t| self.keys.tag_id(t)).collect();
        let existing = self.pool.get_many(&ids).await?;

        let mut versions: HashMap<String, Vec<u8>> = HashMap::with_capacity(tags.len());
        let mut creates: Vec<(String, Vec<u8>)> = Vec::new();
        for (tag, id) in tags.iter().zip(&ids) {
            match existing.get(id) {
                Some(version) => {
                    versions.insert(tag.clone(), version.clone());
                }
                None => creates.push((tag.clone(), new_version())),
            }
        }

        if creates.is_empty() {
            self.maybe_refresh(&ids).await;
            return Ok(versions);
        }

        let commands: Vec<PoolCommand> = creates
            .iter()
            .map(|(tag, version)| PoolCommand::SetIfAbsent {
                key: self.keys.tag_id(tag),
                value: version.clone(),
                ttl: self.tags_lifetime,
            })
            .collect();
        let outcomes = self.pool.pipeline(commands).await?;
        for ((tag, version), created) in creates.into_iter().zip(outcomes) {
            if created {
                versions.insert(tag, version);
            }
        }

        Ok(versions)
    }

    /// Invalidate tags by deleting their records.
    pub async fn delete(&self, tags: &[&str]) -> PoolResult<bool> {
        if tags.is_empty() {
            return Ok(true);
        }
        let ids: Vec<String> = tags.iter().map(|t| self.keys.tag_id(t)).collect();
        self.pool.delete(&ids).await
    }

    /// Occasionally push back the expiry of tags that were all found,
    /// so that tags still in active use outlive their nominal TTL.
    async fn maybe_refresh(&self, ids: &[String]) {
        let Some(lifetime) = self.tags_lifetime else {
            return;
        };
        if rand::thread_rng().gen::<f64>() >= REFRESH_PROBABILITY {
            return;
        }
        let commands: Vec<PoolCommand> = ids
            .iter()
            .map(|id| PoolCommand::Expire {
                key: id.clone(),
                ttl: lifetime,
            })
            .collect();
        if let Err(e) = self.pool.pipeline(commands).await {
            log::debug!("tag TTL refresh failed: {}", e);
        }
    }
}

/// Memo of the most recent `get_or_create` result.
///
/// Lets a save that immediately follows a read reuse the versions the
/// read already fetched, skipping one pool round trip without weakening
/// the tag-before-value ordering (the versions were still obtained ahead
/// of the value computation).
pub(crate) struct KnownTagVersions {
    versions: HashMap<String, Vec<u8>>,
    retrieved_at: Option<Instant>,
    window: Duration,
}

impl KnownTagVersions {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            versions: HashMap::new(),
            retrieved_at: None,
            window,
        }
    }

    /// Remember a freshly fetched version set, replacing the previous
    /// memo entirely.
    pub(crate) fn store(&mut self, versions: &HashMap<String, Vec<u8>>) {
        self.versions = versions.clone();
        self.retrieved_at = Some(Instant::now());
    }

    /// Return the memoised versions for `tags`, but only when the memo
    /// is still within its wall-clock window and covers every requested
    /// tag. A zero window makes the memo one-shot.
    pub(crate) fn get(&mut self, tags: &BTreeSet<String>) -> Option<HashMap<String, Vec<u8>>> {
        let retrieved_at = self.retrieved_at?;
        if !self.window.is_zero() && retrieved_at.elapsed() > self.window {
            self.clear();
            return None;
        }
        if !tags.iter().all(|t| self.versions.contains_key(t)) {
            return None;
        }
        let subset = tags
            .iter()
            .map(|t| (t.clone(), self.versions[t].clone()))
            .collect();
        if self.window.is_zero() {
            self.clear();
        }
        Some(subset)
    }

    pub(crate) fn clear(&mut self) {
        self.versions.clear();
        self.retrieved_at = None;
    }
}
