//! Hash-bucketed key index over string -> NodeId lookups.
//!
//! The on-disk half lives in two snapshot sections: a bucket array of B+1
//! offsets into a contiguous entry array, entries of one bucket stored
//! adjacently and sorted by (hash64, stringId). Bucket count targets a ~50%
//! load factor. Lookups hash with xxh64, scan the bucket slice for equal
//! hashes, and confirm byte-for-byte string equality through the string
//! table before trusting a hit. The in-memory half (delta additions and
//! tombstones) merges in front of the snapshot in
//! [`OverlayView::key_lookup`](crate::storage::delta::OverlayView::key_lookup).

use crate::types::{NodeId, StringId};

/// One key-index entry as built and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    /// xxh64 of the key bytes.
    pub hash: u64,
    /// Interned key string.
    pub string_id: StringId,
    /// Node the key resolves to.
    pub node_id: NodeId,
}

/// Bucket count for a key population: twice the key count for ~50% load,
/// rounded up to a power of two, at least 16.
pub fn bucket_count(num_keys: usize) -> usize {
    (num_keys.saturating_mul(2)).next_power_of_two().max(16)
}

/// Builds the bucket offset array and the bucket-sorted entry array.
pub fn build(mut entries: Vec<KeyEntry>) -> (Vec<u32>, Vec<KeyEntry>) {
    let buckets = bucket_count(entries.len());
    let buckets_u64 = buckets as u64;
    entries.sort_by(|a, b| {
        let ab = a.hash % buckets_u64;
        let bb = b.hash % buckets_u64;
        ab.cmp(&bb)
            .then(a.hash.cmp(&b.hash))
            .then(a.string_id.cmp(&b.string_id))
            .then(a.node_id.cmp(&b.node_id))
    });

    let mut offsets = vec![0u32; buckets + 1];
    for entry in &entries {
        offsets[(entry.hash % buckets_u64) as usize + 1] += 1;
    }
    for i in 0..buckets {
        offsets[i + 1] += offsets[i];
    }
    (offsets, entries)
}

/// Probes a built index. `resolve` maps a stringId to its bytes for the
/// equality confirmation; collisions on hash are resolved by comparing the
/// actual key.
pub fn probe<'a, F>(
    buckets: &[u32],
    entries: &[KeyEntry],
    hash: u64,
    key: &str,
    resolve: F,
) -> Option<NodeId>
where
    F: Fn(StringId) -> Option<&'a str>,
{
    if buckets.len() < 2 {
        return None;
    }
    let bucket_total = buckets.len() - 1;
    let bucket = (hash % bucket_total as u64) as usize;
    let start = buckets[bucket] as usize;
    let end = buckets[bucket + 1] as usize;
    for entry in entries.get(start..end)? {
        if entry.hash != hash {
            continue;
        }
        if resolve(entry.string_id) == Some(key) {
            return Some(entry.node_id);
        }
    }
    None
}
