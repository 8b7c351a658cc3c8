//! Key grammar: namespace validation and record id construction.
//!
//! Item and tag records share one namespace partition but carry distinct
//! reserved prefixes, so the two kinds can never collide even when both
//! live in the same pool.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CacheError, CacheResult};

/// Reserved prefix for item records.
pub(crate) const ITEM_PREFIX: &str = "$";

/// Reserved prefix for tag records.
pub(crate) const TAG_PREFIX: &str = "#";

static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-+_.A-Za-z0-9]*$").unwrap());

/// Precomputed namespace partition for building record ids.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    /// `"ns:"` for a non-empty namespace, `""` otherwise.
    partition: String,
}

impl KeySpace {
    pub(crate) fn new(namespace: &str) -> CacheResult<Self> {
        if !NAMESPACE_RE.is_match(namespace) {
            return Err(CacheError::InvalidArgument(format!(
                "namespace {:?} contains characters outside [-+_.A-Za-z0-9]",
                namespace
            )));
        }
        let partition = if namespace.is_empty() {
            String::new()
        } else {
            format!("{}:", namespace)
        };
        Ok(Self { partition })
    }

    /// Full id of an item record.
    pub(crate) fn item_id(&self, key: &str) -> String {
        format!("{}{}{}", self.partition, ITEM_PREFIX, key)
    }

    /// Full id of a tag record.
    pub(crate) fn tag_id(&self, tag: &str) -> String {
        format!("{}{}{}", self.partition, TAG_PREFIX, tag)
    }
}
