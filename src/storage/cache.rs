//! Bounded LRU caches with reverse indices for targeted invalidation.
//!
//! Four sub-caches: node and edge property caches storing
//! `Option<PropValue>` (a cached `None` means verified-absent, distinct from
//! a cache miss), a traversal cache of bounded neighbor lists keyed by a
//! packed (node, etype-or-all, direction) word, a key-lookup cache, and a
//! content-addressed query cache with optional TTL.
//!
//! Reverse indices make invalidation O(k) in the number of affected
//! entries: node property keys per node, edge property keys per triple,
//! traversal entries by source and by appearance in cached destination
//! lists. Invalidation is idempotent; a lost race only costs a cache miss.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::types::{Direction, ETypeId, Edge, NodeId, PropKeyId, PropValue};

/// Capacities and policies for the cache layer.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Max cached (node, propkey) values.
    pub max_node_props: usize,
    /// Max cached (edge, propkey) values.
    pub max_edge_props: usize,
    /// Max cached traversal entries.
    pub max_traversal_entries: usize,
    /// Max neighbors stored per traversal entry; larger neighborhoods are
    /// cached truncated and readers fall back to full enumeration.
    pub traversal_entry_cap: usize,
    /// Max cached query results.
    pub max_query_entries: usize,
    /// Query result time-to-live; `None` keeps entries until evicted.
    pub query_ttl: Option<Duration>,
    /// Max cached key lookups.
    pub max_key_entries: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_node_props: 10_000,
            max_edge_props: 10_000,
            max_traversal_entries: 2_000,
            traversal_entry_cap: 64,
            max_query_entries: 512,
            query_ttl: None,
            max_key_entries: 10_000,
        }
    }
}

/// Packed traversal cache key: node, etype (0 = all), direction.
pub type TraversalKey = u128;

fn pack_traversal_key(node: NodeId, etype: Option<ETypeId>, direction: Direction) -> TraversalKey {
    let dir = match direction {
        Direction::Out => 0u128,
        Direction::In => 1,
        Direction::Both => 2,
    };
    ((node as u128) << 34) | ((etype.unwrap_or(0) as u128) << 2) | dir
}

/// One cached neighbor list.
#[derive(Debug, Clone)]
pub struct TraversalEntry {
    /// Cached edges, at most `traversal_entry_cap`.
    pub edges: Vec<Edge>,
    /// True when the real neighborhood exceeded the cap; callers must fall
    /// back to full enumeration.
    pub truncated: bool,
}

struct QueryEntry {
    value: Arc<dyn std::any::Any + Send + Sync>,
    inserted: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    hits: u64,
    misses: u64,
}

impl Counter {
    fn hit(&mut self) {
        self.hits += 1;
    }
    fn miss(&mut self) {
        self.misses += 1;
    }
}

/// Statistics for one sub-cache.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubCacheStats {
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses.
    pub misses: u64,
    /// Entries currently cached.
    pub size: usize,
    /// Capacity limit.
    pub capacity: usize,
    /// size / capacity.
    pub utilization: f64,
}

/// Statistics across all sub-caches.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Node property sub-cache.
    pub node_props: SubCacheStats,
    /// Edge property sub-cache.
    pub edge_props: SubCacheStats,
    /// Traversal sub-cache.
    pub traversal: SubCacheStats,
    /// Key lookup sub-cache.
    pub keys: SubCacheStats,
    /// Query sub-cache.
    pub query: SubCacheStats,
    /// Hits / (hits + misses) across every sub-cache.
    pub overall_hit_rate: f64,
}

fn sub_stats<K: std::hash::Hash + Eq, V>(cache: &LruCache<K, V>, counter: Counter) -> SubCacheStats {
    let capacity = cache.cap().get();
    SubCacheStats {
        hits: counter.hits,
        misses: counter.misses,
        size: cache.len(),
        capacity,
        utilization: cache.len() as f64 / capacity as f64,
    }
}

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

/// The cache layer. Wrapped in a lock by the database handle; methods take
/// `&mut self`.
pub struct CacheManager {
    options: CacheOptions,
    node_props: LruCache<(NodeId, PropKeyId), Option<PropValue>>,
    node_rev: FxHashMap<NodeId, FxHashSet<PropKeyId>>,
    edge_props: LruCache<(NodeId, ETypeId, NodeId, PropKeyId), Option<PropValue>>,
    edge_rev: FxHashMap<(NodeId, ETypeId, NodeId), FxHashSet<PropKeyId>>,
    traversal: LruCache<TraversalKey, TraversalEntry>,
    trav_by_source: FxHashMap<NodeId, FxHashSet<TraversalKey>>,
    trav_by_appearance: FxHashMap<NodeId, FxHashSet<TraversalKey>>,
    keys: LruCache<String, Option<NodeId>>,
    query: LruCache<String, QueryEntry>,
    node_counter: Counter,
    edge_counter: Counter,
    traversal_counter: Counter,
    key_counter: Counter,
    query_counter: Counter,
}

impl CacheManager {
    /// Builds a cache layer with the given capacities.
    pub fn new(options: CacheOptions) -> Self {
        Self {
            node_props: LruCache::new(cap(options.max_node_props)),
            node_rev: FxHashMap::default(),
            edge_props: LruCache::new(cap(options.max_edge_props)),
            edge_rev: FxHashMap::default(),
            traversal: LruCache::new(cap(options.max_traversal_entries)),
            trav_by_source: FxHashMap::default(),
            trav_by_appearance: FxHashMap::default(),
            keys: LruCache::new(cap(options.max_key_entries)),
            query: LruCache::new(cap(options.max_query_entries)),
            node_counter: Counter::default(),
            edge_counter: Counter::default(),
            traversal_counter: Counter::default(),
            key_counter: Counter::default(),
            query_counter: Counter::default(),
            options,
        }
    }

    // ------------------------------------------------------------------
    // Node properties
    // ------------------------------------------------------------------

    /// Cached node property; `Some(None)` means verified-absent.
    pub fn get_node_prop(&mut self, node: NodeId, key: PropKeyId) -> Option<Option<PropValue>> {
        match self.node_props.get(&(node, key)) {
            Some(v) => {
                self.node_counter.hit();
                Some(v.clone())
            }
            None => {
                self.node_counter.miss();
                None
            }
        }
    }

    /// Caches a node property read result.
    pub fn put_node_prop(&mut self, node: NodeId, key: PropKeyId, value: Option<PropValue>) {
        if let Some(((old_node, old_key), _)) = self.node_props.push((node, key), value) {
            if (old_node, old_key) != (node, key) {
                if let Some(set) = self.node_rev.get_mut(&old_node) {
                    set.remove(&old_key);
                    if set.is_empty() {
                        self.node_rev.remove(&old_node);
                    }
                }
            }
        }
        self.node_rev.entry(node).or_default().insert(key);
    }

    // ------------------------------------------------------------------
    // Edge properties
    // ------------------------------------------------------------------

    /// Cached edge property; `Some(None)` means verified-absent.
    pub fn get_edge_prop(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Option<Option<PropValue>> {
        match self.edge_props.get(&(src, etype, dst, key)) {
            Some(v) => {
                self.edge_counter.hit();
                Some(v.clone())
            }
            None => {
                self.edge_counter.miss();
                None
            }
        }
    }

    /// Caches an edge property read result.
    pub fn put_edge_prop(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
        value: Option<PropValue>,
    ) {
        if let Some(((os, oe, od, ok), _)) = self.edge_props.push((src, etype, dst, key), value) {
            if (os, oe, od, ok) != (src, etype, dst, key) {
                if let Some(set) = self.edge_rev.get_mut(&(os, oe, od)) {
                    set.remove(&ok);
                    if set.is_empty() {
                        self.edge_rev.remove(&(os, oe, od));
                    }
                }
            }
        }
        self.edge_rev.entry((src, etype, dst)).or_default().insert(key);
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Cached neighbor list for (node, etype-or-all, direction).
    pub fn get_traversal(
        &mut self,
        node: NodeId,
        etype: Option<ETypeId>,
        direction: Direction,
    ) -> Option<TraversalEntry> {
        let key = pack_traversal_key(node, etype, direction);
        match self.traversal.get(&key) {
            Some(entry) => {
                self.traversal_counter.hit();
                Some(entry.clone())
            }
            None => {
                self.traversal_counter.miss();
                None
            }
        }
    }

    /// Caches a neighbor list, truncating at the per-entry cap.
    pub fn put_traversal(
        &mut self,
        node: NodeId,
        etype: Option<ETypeId>,
        direction: Direction,
        edges: &[Edge],
    ) {
        let key = pack_traversal_key(node, etype, direction);
        let truncated = edges.len() > self.options.traversal_entry_cap;
        let stored: Vec<Edge> = edges
            .iter()
            .take(self.options.traversal_entry_cap)
            .copied()
            .collect();
        if let Some((old_key, old_entry)) = self.traversal.push(key, TraversalEntry {
            edges: stored.clone(),
            truncated,
        }) {
            if old_key != key {
                self.unlink_traversal(old_key, &old_entry);
            }
        }
        self.trav_by_source.entry(node).or_default().insert(key);
        for edge in &stored {
            self.trav_by_appearance.entry(edge.src).or_default().insert(key);
            self.trav_by_appearance.entry(edge.dst).or_default().insert(key);
        }
    }

    fn unlink_traversal(&mut self, key: TraversalKey, entry: &TraversalEntry) {
        let node = (key >> 34) as NodeId;
        if let Some(set) = self.trav_by_source.get_mut(&node) {
            set.remove(&key);
            if set.is_empty() {
                self.trav_by_source.remove(&node);
            }
        }
        for edge in &entry.edges {
            for endpoint in [edge.src, edge.dst] {
                if let Some(set) = self.trav_by_appearance.get_mut(&endpoint) {
                    set.remove(&key);
                    if set.is_empty() {
                        self.trav_by_appearance.remove(&endpoint);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Key lookups
    // ------------------------------------------------------------------

    /// Cached key lookup; `Some(None)` means verified-absent.
    pub fn get_key(&mut self, key: &str) -> Option<Option<NodeId>> {
        match self.keys.get(key) {
            Some(v) => {
                self.key_counter.hit();
                Some(*v)
            }
            None => {
                self.key_counter.miss();
                None
            }
        }
    }

    /// Caches a key lookup result.
    pub fn put_key(&mut self, key: &str, value: Option<NodeId>) {
        self.keys.push(key.to_string(), value);
    }

    // ------------------------------------------------------------------
    // Query cache
    // ------------------------------------------------------------------

    /// Cached query result by content fingerprint, honoring the TTL.
    pub fn get_query(&mut self, fingerprint: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        let expired = match self.query.peek(fingerprint) {
            Some(entry) => self
                .options
                .query_ttl
                .is_some_and(|ttl| entry.inserted.elapsed() > ttl),
            None => {
                self.query_counter.miss();
                return None;
            }
        };
        if expired {
            self.query.pop(fingerprint);
            self.query_counter.miss();
            return None;
        }
        self.query_counter.hit();
        self.query.get(fingerprint).map(|e| Arc::clone(&e.value))
    }

    /// Caches an arbitrary query result payload.
    pub fn put_query(
        &mut self,
        fingerprint: &str,
        value: Arc<dyn std::any::Any + Send + Sync>,
    ) {
        self.query.push(
            fingerprint.to_string(),
            QueryEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Evicts everything affected by a node mutation: its property entries
    /// and every traversal entry that starts at it or lists it.
    pub fn invalidate_node(&mut self, node: NodeId) {
        if let Some(keys) = self.node_rev.remove(&node) {
            for key in keys {
                self.node_props.pop(&(node, key));
            }
        }
        let mut stale: FxHashSet<TraversalKey> = FxHashSet::default();
        if let Some(set) = self.trav_by_source.remove(&node) {
            stale.extend(set);
        }
        if let Some(set) = self.trav_by_appearance.remove(&node) {
            stale.extend(set);
        }
        for key in stale {
            if let Some(entry) = self.traversal.pop(&key) {
                self.unlink_traversal(key, &entry);
            }
        }
    }

    /// Evicts everything affected by one edge mutation: the triple's
    /// property entries and the out-from-src / in-to-dst traversal entries
    /// for the edge's type and the all-types variant, in every direction
    /// combination.
    pub fn invalidate_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) {
        if let Some(keys) = self.edge_rev.remove(&(src, etype, dst)) {
            for key in keys {
                self.edge_props.pop(&(src, etype, dst, key));
            }
        }
        let mut stale: Vec<TraversalKey> = Vec::with_capacity(12);
        for etype_sel in [Some(etype), None] {
            for dir in [Direction::Out, Direction::Both] {
                stale.push(pack_traversal_key(src, etype_sel, dir));
            }
            for dir in [Direction::In, Direction::Both] {
                stale.push(pack_traversal_key(dst, etype_sel, dir));
            }
        }
        for key in stale {
            if let Some(entry) = self.traversal.pop(&key) {
                self.unlink_traversal(key, &entry);
            }
        }
    }

    /// Evicts one cached key lookup.
    pub fn invalidate_key(&mut self, key: &str) {
        self.keys.pop(key);
    }

    /// Clears every sub-cache. The query cache is content-addressed and is
    /// only ever cleared wholesale.
    pub fn clear(&mut self) {
        self.node_props.clear();
        self.node_rev.clear();
        self.edge_props.clear();
        self.edge_rev.clear();
        self.traversal.clear();
        self.trav_by_source.clear();
        self.trav_by_appearance.clear();
        self.keys.clear();
        self.query.clear();
    }

    /// Clears only the query cache.
    pub fn clear_query(&mut self) {
        self.query.clear();
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        let node = sub_stats(&self.node_props, self.node_counter);
        let edge = sub_stats(&self.edge_props, self.edge_counter);
        let traversal = sub_stats(&self.traversal, self.traversal_counter);
        let keys = sub_stats(&self.keys, self.key_counter);
        let query = sub_stats(&self.query, self.query_counter);
        let hits = node.hits + edge.hits + traversal.hits + keys.hits + query.hits;
        let total = hits + node.misses + edge.misses + traversal.misses + keys.misses + query.misses;
        CacheStats {
            node_props: node,
            edge_props: edge,
            traversal,
            keys,
            query,
            overall_hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Resets hit/miss counters without touching cached entries.
    pub fn reset_stats(&mut self) {
        self.node_counter = Counter::default();
        self.edge_counter = Counter::default();
        self.traversal_counter = Counter::default();
        self.key_counter = Counter::default();
        self.query_counter = Counter::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CacheManager {
        CacheManager::new(CacheOptions::default())
    }

    #[test]
    fn node_prop_absent_is_distinct_from_uncached() {
        let mut cache = manager();
        assert_eq!(cache.get_node_prop(1, 2), None);
        cache.put_node_prop(1, 2, None);
        assert_eq!(cache.get_node_prop(1, 2), Some(None));
        cache.put_node_prop(1, 3, Some(PropValue::Int(9)));
        assert_eq!(cache.get_node_prop(1, 3), Some(Some(PropValue::Int(9))));
    }

    #[test]
    fn invalidate_node_evicts_props_and_traversals() {
        let mut cache = manager();
        cache.put_node_prop(1, 2, Some(PropValue::Int(1)));
        cache.put_node_prop(1, 3, Some(PropValue::Int(2)));
        cache.put_node_prop(9, 2, Some(PropValue::Int(3)));
        let edges = [Edge {
            src: 5,
            etype: 1,
            dst: 1,
        }];
        cache.put_traversal(5, None, Direction::Out, &edges);
        cache.put_traversal(1, None, Direction::In, &edges);

        cache.invalidate_node(1);
        assert_eq!(cache.get_node_prop(1, 2), None);
        assert_eq!(cache.get_node_prop(1, 3), None);
        assert_eq!(cache.get_node_prop(9, 2), Some(Some(PropValue::Int(3))));
        // Both the entry sourced at 1 and the entry listing 1 are gone.
        assert!(cache.get_traversal(5, None, Direction::Out).is_none());
        assert!(cache.get_traversal(1, None, Direction::In).is_none());
    }

    #[test]
    fn invalidate_edge_targets_both_endpoints() {
        let mut cache = manager();
        let e = Edge {
            src: 1,
            etype: 7,
            dst: 2,
        };
        cache.put_edge_prop(1, 7, 2, 3, Some(PropValue::Float(0.5)));
        cache.put_traversal(1, Some(7), Direction::Out, &[e]);
        cache.put_traversal(1, None, Direction::Out, &[e]);
        cache.put_traversal(2, Some(7), Direction::In, &[e]);
        cache.put_traversal(3, Some(7), Direction::Out, &[]);

        cache.invalidate_edge(1, 7, 2);
        assert_eq!(cache.get_edge_prop(1, 7, 2, 3), None);
        assert!(cache.get_traversal(1, Some(7), Direction::Out).is_none());
        assert!(cache.get_traversal(1, None, Direction::Out).is_none());
        assert!(cache.get_traversal(2, Some(7), Direction::In).is_none());
        // Unrelated entry survives.
        assert!(cache.get_traversal(3, Some(7), Direction::Out).is_some());
    }

    #[test]
    fn traversal_truncation_flag() {
        let mut cache = CacheManager::new(CacheOptions {
            traversal_entry_cap: 2,
            ..Default::default()
        });
        let edges: Vec<Edge> = (0..5)
            .map(|i| Edge {
                src: 1,
                etype: 1,
                dst: 10 + i,
            })
            .collect();
        cache.put_traversal(1, Some(1), Direction::Out, &edges);
        let entry = cache.get_traversal(1, Some(1), Direction::Out).unwrap();
        assert!(entry.truncated);
        assert_eq!(entry.edges.len(), 2);
    }

    #[test]
    fn query_cache_ttl_expires() {
        let mut cache = CacheManager::new(CacheOptions {
            query_ttl: Some(Duration::from_millis(0)),
            ..Default::default()
        });
        cache.put_query("q1", Arc::new(42u32));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get_query("q1").is_none());
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let mut cache = manager();
        cache.put_node_prop(1, 2, Some(PropValue::Int(1)));
        for _ in 0..9 {
            cache.get_node_prop(1, 2);
        }
        cache.get_node_prop(1, 9);
        let stats = cache.stats();
        assert_eq!(stats.node_props.hits, 9);
        assert_eq!(stats.node_props.misses, 1);
        assert!(stats.overall_hit_rate > 0.89 && stats.overall_hit_rate < 0.91);
        assert_eq!(stats.node_props.size, 1);
    }

    #[test]
    fn lru_eviction_maintains_reverse_index() {
        let mut cache = CacheManager::new(CacheOptions {
            max_node_props: 2,
            ..Default::default()
        });
        cache.put_node_prop(1, 1, Some(PropValue::Int(1)));
        cache.put_node_prop(2, 1, Some(PropValue::Int(2)));
        cache.put_node_prop(3, 1, Some(PropValue::Int(3))); // evicts (1,1)
        assert_eq!(cache.get_node_prop(1, 1), None);
        // Invalidating the evicted node must not disturb live entries.
        cache.invalidate_node(1);
        assert!(cache.get_node_prop(2, 1).is_some());
        assert!(cache.get_node_prop(3, 1).is_some());
    }
}
