//! The backing pool contract shared by item and tag stores.
//!
//! Any key/value backend that can multi-get, conditionally create, and
//! delete satisfies this trait; the facade never assumes more. Backends
//! with native pipelining override [`CachePool::pipeline`]; everyone else
//! inherits the sequential fallback.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PoolResult;

/// A backend-abstracted command descriptor for pipelined execution.
#[derive(Debug, Clone)]
pub enum PoolCommand {
    /// Unconditional write, with optional TTL.
    Set {
        /// Record id.
        key: String,
        /// Payload bytes.
        value: Vec<u8>,
        /// Time to live, unbounded when absent.
        ttl: Option<Duration>,
    },
    /// Atomic create-if-absent, with optional TTL.
    SetIfAbsent {
        /// Record id.
        key: String,
        /// Payload bytes.
        value: Vec<u8>,
        /// Time to live, unbounded when absent.
        ttl: Option<Duration>,
    },
    /// Atomic multi-delete.
    Delete {
        /// Record ids.
        keys: Vec<String>,
    },
    /// Reset the TTL of an existing record.
    Expire {
        /// Record id.
        key: String,
        /// New time to live.
        ttl: Duration,
    },
}

/// Contract satisfied by both the item pool and the tag pool.
#[async_trait]
pub trait CachePool: Send + Sync {
    /// Read a single record. The default delegates to [`Self::get_many`];
    /// wrapping proxies may override it independently.
    async fn get(&self, key: &str) -> PoolResult<Option<Vec<u8>>> {
        let mut found = self.get_many(&[key.to_string()]).await?;
        Ok(found.remove(key))
    }

    /// Read several records at once; absent keys are simply missing from
    /// the result map.
    async fn get_many(&self, keys: &[String]) -> PoolResult<HashMap<String, Vec<u8>>>;

    /// Write a record unconditionally.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> PoolResult<bool>;

    /// Create a record only if the key is currently absent. Returns
    /// whether this caller's value was installed.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> PoolResult<bool>;

    /// Delete records. Absent keys are not an error.
    async fn delete(&self, keys: &[String]) -> PoolResult<bool>;

    /// Reset the TTL of an existing record. Returns `false` when the key
    /// does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> PoolResult<bool>;

    /// Drop every record whose id starts with `prefix`, or all records
    /// when no prefix is given. Backends without prefix support may treat
    /// any prefix as a full clear.
    async fn clear(&self, prefix: Option<&str>) -> PoolResult<bool>;

    /// Execute a batch of commands, returning one boolean outcome per
    /// command in order. The fallback runs them sequentially.
    async fn pipeline(&self, commands: Vec<PoolCommand>) -> PoolResult<Vec<bool>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let ok = match command {
                PoolCommand::Set { key, value, ttl } => self.set(&key, &value, ttl).await?,
                PoolCommand::SetIfAbsent { key, value, ttl } => {
                    self.set_if_absent(&key, &value, ttl).await?
                }
                PoolCommand::Delete { keys } => self.delete(&keys).await?,
                PoolCommand::Expire { key, ttl } => self.expire(&key, ttl).await?,
            };
            results.push(ok);
        }
        Ok(results)
    }
}
