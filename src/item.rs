//! The transient cache item handed between the caller and the core.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A deferred value producer, run by the core during `commit` after tag
/// versions have been acquired.
pub type ValueProducer = Box<dyn FnOnce() -> Vec<u8> + Send>;

/// Current Unix time in whole seconds.
pub(crate) fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Metadata observed on a stored item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    /// Unix epoch seconds after which the item is stale.
    pub expiry: Option<u32>,
    /// Milliseconds the stored value took to compute.
    pub ctime_ms: u32,
    /// Tags the item was saved with.
    pub tags: BTreeSet<String>,
}

/// A cache item in flight.
///
/// Created by `get_item`/`get_items`, populated by the caller, handed to
/// `save`/`save_deferred`, and consumed by `commit`. The staged metadata
/// starts out as a copy of what was observed on read, so re-saving a hit
/// keeps its expiry and tags unless the caller changes them.
pub struct CacheItem {
    key: String,
    value: Option<Vec<u8>>,
    hit: bool,
    metadata: ItemMetadata,
    staged_expiry: Option<u32>,
    staged_tags: BTreeSet<String>,
    producer: Option<ValueProducer>,
}

impl CacheItem {
    /// A miss for `key`: no value, no metadata.
    pub(crate) fn miss(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            hit: false,
            metadata: ItemMetadata::default(),
            staged_expiry: None,
            staged_tags: BTreeSet::new(),
            producer: None,
        }
    }

    /// A validated hit carrying the stored value and observed metadata.
    pub(crate) fn hit(key: &str, value: Vec<u8>, metadata: ItemMetadata) -> Self {
        let staged_expiry = metadata.expiry;
        let staged_tags = metadata.tags.clone();
        Self {
            key: key.to_string(),
            value: Some(value),
            hit: true,
            metadata,
            staged_expiry,
            staged_tags,
            producer: None,
        }
    }

    /// The user key this item was requested under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the read that produced this item was a validated hit.
    pub fn is_hit(&self) -> bool {
        self.hit
    }

    /// The current value, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Metadata observed when the item was read. Empty for misses.
    pub fn metadata(&self) -> &ItemMetadata {
        &self.metadata
    }

    /// Set the value to persist on the next save.
    pub fn set_value(&mut self, value: Vec<u8>) -> &mut Self {
        self.value = Some(value);
        self.producer = None;
        self
    }

    /// Defer the value to a producer, run by the core during `commit`
    /// only after every attached tag has a current version. The
    /// producer's wall-clock runtime is recorded as the item's ctime.
    pub fn set_value_producer<F>(&mut self, producer: F) -> &mut Self
    where
        F: FnOnce() -> Vec<u8> + Send + 'static,
    {
        self.producer = Some(Box::new(producer));
        self
    }

    /// Expire at an absolute Unix epoch second.
    pub fn expires_at(&mut self, epoch_secs: u32) -> &mut Self {
        self.staged_expiry = Some(epoch_secs);
        self
    }

    /// Expire after a relative duration from now.
    pub fn expires_after(&mut self, lifetime: Duration) -> &mut Self {
        let deadline = unix_time_secs().saturating_add(lifetime.as_secs());
        self.staged_expiry = Some(deadline.min(u32::MAX as u64) as u32);
        self
    }

    /// Attach an invalidation tag.
    pub fn tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.staged_tags.insert(tag.into());
        self
    }

    /// Attach several invalidation tags.
    pub fn tags<I, T>(&mut self, tags: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for tag in tags {
            self.staged_tags.insert(tag.into());
        }
        self
    }

    /// Drop every staged tag, detaching the item from its invalidation
    /// classes on the next save.
    pub fn clear_tags(&mut self) -> &mut Self {
        self.staged_tags.clear();
        self
    }

    pub(crate) fn staged_tags(&self) -> &BTreeSet<String> {
        &self.staged_tags
    }

    pub(crate) fn staged_expiry(&self) -> Option<u32> {
        self.staged_expiry
    }

    pub(crate) fn observed_ctime_ms(&self) -> u32 {
        self.metadata.ctime_ms
    }

    pub(crate) fn take_producer(&mut self) -> Option<ValueProducer> {
        self.producer.take()
    }

    pub(crate) fn take_value(&mut self) -> Option<Vec<u8>> {
        self.value.take()
    }
}

impl fmt::Debug for CacheItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItem")
            .field("key", &self.key)
            .field("hit", &self.hit)
            .field("value_len", &self.value.as_ref().map(|v| v.len()))
            .field("metadata", &self.metadata)
            .field("staged_expiry", &self.staged_expiry)
            .field("staged_tags", &self.staged_tags)
            .field("deferred", &self.producer.is_some())
            .finish()
    }
}
