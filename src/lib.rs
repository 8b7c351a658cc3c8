//! # tagcache - Tag-Aware Cache Facade
//!
//! Layers safe, guaranteed tag-based invalidation on top of any key/value
//! cache pool, including ephemeral pools subject to LRU eviction or
//! out-of-memory pressure.
//!
//! ## Architecture
//!
//! - `codec`: packing of (value, tag versions, expiry, ctime) into one
//!   opaque payload per item
//! - `tags`: the per-tag version store (atomic create-if-absent, delete
//!   on invalidation, probabilistic TTL refresh)
//! - `adapter`: the core: read validation, deferred commits, and the
//!   tag-before-value ordering that makes invalidation race-safe
//! - `retry`: a pool proxy spreading re-reads of a missing key in time to
//!   blunt cache stampedes
//! - `pool` / `memory`: the backing-pool contract and its in-memory
//!   reference implementation
//!
//! ## How invalidation stays correct
//!
//! Items remember the version token of every tag they were saved with. A
//! read is a hit only when each remembered token still matches the tag
//! store. Invalidation deletes the tag record, so every dependent item
//! fails validation at once, even items written by a process that raced
//! the invalidation, because writers acquire tag versions *before*
//! computing their values.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tagcache::{CacheConfig, MemoryPool, TagAwareCache};
//!
//! # async fn example() -> Result<(), tagcache::CacheError> {
//! let pool = Arc::new(MemoryPool::new());
//! let mut cache = TagAwareCache::with_pool(pool, CacheConfig::default())?;
//!
//! let mut item = cache.get_item("user.42.profile").await;
//! if !item.is_hit() {
//!     item.set_value(b"rendered profile".to_vec());
//!     item.tag("user.42").tag("profiles");
//!     cache.save(item).await;
//! }
//!
//! // Later: drop everything touching user 42 in one call.
//! cache.invalidate_tags(&["user.42"]).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core adapter
pub mod adapter;

// Payload packing
pub mod codec;

// Configuration
pub mod config;

// Error types
pub mod error;

// Transient item handle
pub mod item;

// Backing pool contract and reference implementation
pub mod memory;
pub mod pool;

// Stampede-mitigating retry proxy
pub mod retry;

// Tag-version store
pub mod tags;

// Key grammar (internal)
mod key;

// Re-export commonly used types
pub use adapter::{CacheStats, TagAwareCache};
pub use config::{CacheConfig, RetryConfig};
pub use error::{CacheError, CacheResult, PoolError, PoolResult};
pub use item::{CacheItem, ItemMetadata};
pub use memory::MemoryPool;
pub use pool::{CachePool, PoolCommand};
pub use retry::{RetryStrategy, RetryingPool};
pub use tags::TagVersionStore;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
