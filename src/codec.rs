//! Packing and unpacking of item payloads.
//!
//! Every item record combines three slots in one opaque payload: the user
//! value, the versions of the tags the item was saved with, and a compact
//! expiry/ctime block. The payload is bincode-encoded; anything that does
//! not decode to exactly this shape is rejected, which is how foreign or
//! corrupted records surface as misses instead of errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Shortest acceptable packed metadata block: a bare big-endian expiry.
const META_MIN: usize = 4;

/// Longest acceptable packed metadata block: expiry plus a full
/// little-endian ctime.
const META_MAX: usize = 8;

/// On-wire payload shape.
///
/// `tags` and `meta` are omitted (not encoded as empty) when the item has
/// no tags or no expiry metadata.
#[derive(Serialize, Deserialize)]
struct PackedPayload {
    value: Vec<u8>,
    tags: Option<BTreeMap<String, Vec<u8>>>,
    meta: Option<Vec<u8>>,
}

/// The decoded form of an item payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    /// Opaque user value.
    pub value: Vec<u8>,
    /// Tag name to version token, as captured at save time.
    pub tag_versions: BTreeMap<String, Vec<u8>>,
    /// Unix epoch seconds after which the item is stale, when recorded.
    pub expiry: Option<u32>,
    /// Wall-clock milliseconds the value took to compute.
    pub ctime_ms: u32,
}

/// Pack an item into one opaque payload.
///
/// The metadata block is written only for items that carry an expiry; a
/// ctime without an expiry is dropped, since the block cannot express
/// "no deadline" without a sentinel that readers would misread as an
/// already-elapsed one.
pub fn pack(
    value: &[u8],
    tag_versions: &BTreeMap<String, Vec<u8>>,
    expiry: Option<u32>,
    ctime_ms: u32,
) -> CacheResult<Vec<u8>> {
    let payload = PackedPayload {
        value: value.to_vec(),
        tags: if tag_versions.is_empty() {
            None
        } else {
            Some(tag_versions.clone())
        },
        meta: expiry.map(|e| pack_meta(e, ctime_ms)),
    };
    bincode::serialize(&payload).map_err(|e| CacheError::Codec(e.to_string()))
}

/// Unpack a payload, rejecting anything that is not a well-formed item
/// record.
pub fn unpack(payload: &[u8]) -> CacheResult<Unpacked> {
    let decoded: PackedPayload = bincode::deserialize(payload)
        .map_err(|e| CacheError::Codec(format!("malformed payload: {}", e)))?;

    let (expiry, ctime_ms) = match decoded.meta {
        Some(meta) => {
            let (expiry, ctime) = unpack_meta(&meta)?;
            (Some(expiry), ctime)
        }
        None => (None, 0),
    };

    Ok(Unpacked {
        value: decoded.value,
        tag_versions: decoded.tags.unwrap_or_default(),
        expiry,
        ctime_ms,
    })
}

/// Pack `(expiry, ctime)` into 5..=8 bytes.
///
/// The expiry occupies four big-endian bytes; the ctime follows in
/// little-endian order with trailing zero bytes trimmed, so small
/// computation times cost a single byte.
fn pack_meta(expiry: u32, ctime_ms: u32) -> Vec<u8> {
    let mut meta = expiry.to_be_bytes().to_vec();
    let ctime = ctime_ms.to_le_bytes();
    let used = ctime.iter().rposition(|&b| b != 0).map_or(1, |i| i + 1);
    meta.extend_from_slice(&ctime[..used]);
    meta
}

/// Decode a 4..=8 byte metadata block, zero-padding the ctime on the
/// right.
fn unpack_meta(meta: &[u8]) -> CacheResult<(u32, u32)> {
    if meta.len() < META_MIN || meta.len() > META_MAX {
        return Err(CacheError::Codec(format!(
            "metadata block of {} bytes outside {}..={}",
            meta.len(),
            META_MIN,
            META_MAX
        )));
    }
    let mut buf = [0u8; META_MAX];
    buf[..meta.len()].copy_from_slice(meta);
    let expiry = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let ctime = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((expiry, ctime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn versions(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(t, v)| (t.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_round_trip_plain_value() {
        let packed = pack(b"hello", &BTreeMap::new(), None, 0).unwrap();
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked.value, b"hello");
        assert!(unpacked.tag_versions.is_empty());
        assert_eq!(unpacked.expiry, None);
        assert_eq!(unpacked.ctime_ms, 0);
    }

    #[test]
    fn test_round_trip_with_tags_and_meta() {
        let tags = versions(&[("news", b"\x01\x02\x03\x04\x05\x06\x07\x08")]);
        let packed = pack(b"v", &tags, Some(1_700_000_000), 1234).unwrap();
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked.tag_versions, tags);
        assert_eq!(unpacked.expiry, Some(1_700_000_000));
        assert_eq!(unpacked.ctime_ms, 1234);
    }

    #[test]
    fn test_ctime_trimming() {
        // A zero ctime still occupies one byte next to the expiry.
        let meta = pack_meta(10, 0);
        assert_eq!(meta.len(), 5);
        assert_eq!(unpack_meta(&meta).unwrap(), (10, 0));

        // A full-width ctime uses all eight bytes.
        let meta = pack_meta(10, u32::MAX);
        assert_eq!(meta.len(), 8);
        assert_eq!(unpack_meta(&meta).unwrap(), (10, u32::MAX));
    }

    #[test]
    fn test_bare_expiry_meta_accepted() {
        // Four bytes (expiry only) is a valid block even though pack
        // never emits one shorter than five.
        assert_eq!(unpack_meta(&42u32.to_be_bytes()).unwrap(), (42, 0));
    }

    #[test]
    fn test_meta_length_bounds() {
        assert!(unpack_meta(&[0; 3]).is_err());
        assert!(unpack_meta(&[0; 9]).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(unpack(b"").is_err());
        assert!(unpack(b"\xff\xff\xff\xff\xff\xff\xff\xff\xff\xff").is_err());
    }

    #[test]
    fn test_ctime_dropped_without_expiry() {
        let packed = pack(b"v", &BTreeMap::new(), None, 999).unwrap();
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked.ctime_ms, 0);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            value in proptest::collection::vec(any::<u8>(), 0..256),
            tag in "[a-z]{1,12}",
            version in proptest::collection::vec(any::<u8>(), 1..16),
            expiry in 1u32..,
            ctime in any::<u32>(),
        ) {
            let tags = versions(&[(tag.as_str(), version.as_slice())]);
            let packed = pack(&value, &tags, Some(expiry), ctime).unwrap();
            let unpacked = unpack(&packed).unwrap();
            prop_assert_eq!(unpacked.value, value);
            prop_assert_eq!(unpacked.tag_versions, tags);
            prop_assert_eq!(unpacked.expiry, Some(expiry));
            prop_assert_eq!(unpacked.ctime_ms, ctime);
        }
    }
}
