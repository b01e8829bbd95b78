//! MVCC: snapshot isolation over the shared delta and snapshot.
//!
//! The transaction manager mints start timestamps at begin and commit
//! timestamps at commit from one monotonic counter. Conflict detection is
//! first-committer-wins: a committing transaction aborts if any entity it
//! wrote was committed by someone else after its start timestamp.
//!
//! Version chains are created lazily: when a transaction commits while other
//! transactions are active, the pre-commit value of each written entity is
//! seeded as a base version (commit timestamp 0) before the new value is
//! linked. Readers walk a chain newest to oldest and take the first version
//! with `commit_ts <= start_ts`. Entities without a chain fall through to
//! delta + snapshot. Garbage collection prunes whole chains once the newest
//! version drops below the minimum active start timestamp.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{GrafitoError, Result};
use crate::types::{ETypeId, NodeId, PropKeyId, PropValue, Timestamp, TxId};

/// Conflict-detection granularity: the entity identities a transaction
/// records for its writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// A node and everything hanging off it (props, labels, vectors).
    Node(NodeId),
    /// A single edge triple and its properties.
    Edge(NodeId, ETypeId, NodeId),
    /// A key-index binding.
    Key(String),
}

struct CommittedTx {
    commit_ts: Timestamp,
    writes: FxHashSet<EntityKey>,
}

/// Mints timestamps, tracks active transactions, validates commits.
pub struct TxManager {
    next_ts: Timestamp,
    next_txid: TxId,
    active: FxHashMap<TxId, Timestamp>,
    committed: VecDeque<CommittedTx>,
}

impl TxManager {
    /// Creates a manager whose transaction ids continue from `next_txid`.
    pub fn new(next_txid: TxId) -> Self {
        Self {
            next_ts: 1,
            next_txid,
            active: FxHashMap::default(),
            committed: VecDeque::new(),
        }
    }

    /// Begins a transaction, returning its id and start timestamp.
    pub fn begin(&mut self) -> (TxId, Timestamp) {
        let txid = self.next_txid;
        self.next_txid += 1;
        let start_ts = self.next_ts;
        self.next_ts += 1;
        self.active.insert(txid, start_ts);
        (txid, start_ts)
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Minimum start timestamp across active transactions, or the next
    /// timestamp when none are active.
    pub fn min_active_ts(&self) -> Timestamp {
        self.active.values().copied().min().unwrap_or(self.next_ts)
    }

    /// Timestamp a non-transactional read observes: everything committed.
    pub fn read_ts(&self) -> Timestamp {
        self.next_ts
    }

    /// Validates first-committer-wins and commits, returning the commit
    /// timestamp. On conflict the transaction is aborted and the conflicting
    /// entity reported.
    pub fn commit(
        &mut self,
        txid: TxId,
        writes: &FxHashSet<EntityKey>,
    ) -> Result<Timestamp> {
        let start_ts = self
            .active
            .get(&txid)
            .copied()
            .ok_or(GrafitoError::TransactionMisuse("transaction is not active"))?;

        if !writes.is_empty() {
            for committed in self.committed.iter().rev() {
                if committed.commit_ts <= start_ts {
                    break;
                }
                if let Some(key) = writes.iter().find(|k| committed.writes.contains(*k)) {
                    self.active.remove(&txid);
                    return Err(GrafitoError::Conflict(format!(
                        "{key:?} was committed by a concurrent transaction"
                    )));
                }
            }
        }

        self.active.remove(&txid);
        let commit_ts = self.next_ts;
        self.next_ts += 1;
        if !writes.is_empty() {
            self.committed.push_back(CommittedTx {
                commit_ts,
                writes: writes.clone(),
            });
        }
        Ok(commit_ts)
    }

    /// Drops an active transaction without committing.
    pub fn abort(&mut self, txid: TxId) {
        self.active.remove(&txid);
    }

    /// Prunes committed-writes entries no active transaction can conflict
    /// with any more.
    pub fn prune_committed(&mut self) {
        let min = self.min_active_ts();
        while let Some(front) = self.committed.front() {
            if front.commit_ts >= min {
                break;
            }
            self.committed.pop_front();
        }
    }

    #[cfg(test)]
    fn committed_len(&self) -> usize {
        self.committed.len()
    }
}

#[derive(Debug, Clone)]
struct Version<T> {
    txid: TxId,
    commit_ts: Timestamp,
    value: T,
}

fn visible<'a, T>(
    chain: &'a [Version<T>],
    start_ts: Timestamp,
    txid: TxId,
) -> Option<&'a T> {
    chain
        .iter()
        .rev()
        .find(|v| v.commit_ts <= start_ts || (txid != 0 && v.txid == txid))
        .map(|v| &v.value)
}

fn publish<T>(
    chain: &mut Vec<Version<T>>,
    value: T,
    txid: TxId,
    commit_ts: Timestamp,
    base: impl FnOnce() -> T,
) {
    if chain.is_empty() {
        chain.push(Version {
            txid: 0,
            commit_ts: 0,
            value: base(),
        });
    }
    chain.push(Version {
        txid,
        commit_ts,
        value,
    });
}

fn prune_chains<K: std::hash::Hash + Eq, T>(
    map: &mut FxHashMap<K, Vec<Version<T>>>,
    min_active: Timestamp,
) -> u64 {
    let mut pruned = 0u64;
    map.retain(|_, chain| {
        let below = chain
            .iter()
            .take_while(|v| v.commit_ts < min_active)
            .count();
        if below == chain.len() {
            // Newest version already equals the fallthrough state.
            pruned += chain.len() as u64;
            false
        } else if below > 1 {
            // Keep one baseline below the horizon plus everything newer.
            pruned += (below - 1) as u64;
            chain.drain(..below - 1);
            true
        } else {
            true
        }
    });
    pruned
}

/// Garbage collection statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Versions unlinked since open.
    pub versions_pruned: u64,
    /// GC passes since open.
    pub gc_runs: u64,
    /// Milliseconds since the Unix epoch of the last pass.
    pub last_gc_unix_ms: u64,
}

/// Lazily populated per-entity version chains.
#[derive(Default)]
pub struct VersionStore {
    node_exists: FxHashMap<NodeId, Vec<Version<bool>>>,
    edge_exists: FxHashMap<(NodeId, ETypeId, NodeId), Vec<Version<bool>>>,
    node_props: FxHashMap<(NodeId, PropKeyId), Vec<Version<Option<PropValue>>>>,
    edge_props: FxHashMap<(NodeId, ETypeId, NodeId, PropKeyId), Vec<Version<Option<PropValue>>>>,
    key_lookup: FxHashMap<String, Vec<Version<Option<NodeId>>>>,
    stats: GcStats,
}

impl VersionStore {
    /// Whether any chain exists at all (fast path for readers).
    pub fn is_empty(&self) -> bool {
        self.node_exists.is_empty()
            && self.edge_exists.is_empty()
            && self.node_props.is_empty()
            && self.edge_props.is_empty()
            && self.key_lookup.is_empty()
    }

    /// Publishes a node existence change.
    pub fn publish_node(
        &mut self,
        node: NodeId,
        exists: bool,
        txid: TxId,
        ts: Timestamp,
        base: impl FnOnce() -> bool,
    ) {
        publish(self.node_exists.entry(node).or_default(), exists, txid, ts, base);
    }

    /// Publishes an edge existence change.
    pub fn publish_edge(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        exists: bool,
        txid: TxId,
        ts: Timestamp,
        base: impl FnOnce() -> bool,
    ) {
        publish(
            self.edge_exists.entry((src, etype, dst)).or_default(),
            exists,
            txid,
            ts,
            base,
        );
    }

    /// Publishes a node property change.
    pub fn publish_node_prop(
        &mut self,
        node: NodeId,
        key: PropKeyId,
        value: Option<PropValue>,
        txid: TxId,
        ts: Timestamp,
        base: impl FnOnce() -> Option<PropValue>,
    ) {
        publish(
            self.node_props.entry((node, key)).or_default(),
            value,
            txid,
            ts,
            base,
        );
    }

    /// Publishes an edge property change.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_edge_prop(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
        value: Option<PropValue>,
        txid: TxId,
        ts: Timestamp,
        base: impl FnOnce() -> Option<PropValue>,
    ) {
        publish(
            self.edge_props.entry((src, etype, dst, key)).or_default(),
            value,
            txid,
            ts,
            base,
        );
    }

    /// Publishes a key binding change.
    pub fn publish_key(
        &mut self,
        key: &str,
        value: Option<NodeId>,
        txid: TxId,
        ts: Timestamp,
        base: impl FnOnce() -> Option<NodeId>,
    ) {
        publish(
            self.key_lookup.entry(key.to_string()).or_default(),
            value,
            txid,
            ts,
            base,
        );
    }

    /// Node existence as seen at `start_ts`; `None` when no chain exists.
    pub fn node_visible(&self, node: NodeId, start_ts: Timestamp, txid: TxId) -> Option<bool> {
        self.node_exists
            .get(&node)
            .and_then(|c| visible(c, start_ts, txid))
            .copied()
    }

    /// Edge existence as seen at `start_ts`.
    pub fn edge_visible(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        start_ts: Timestamp,
        txid: TxId,
    ) -> Option<bool> {
        self.edge_exists
            .get(&(src, etype, dst))
            .and_then(|c| visible(c, start_ts, txid))
            .copied()
    }

    /// Node property as seen at `start_ts`. Outer `None` = no chain.
    pub fn node_prop_visible(
        &self,
        node: NodeId,
        key: PropKeyId,
        start_ts: Timestamp,
        txid: TxId,
    ) -> Option<Option<PropValue>> {
        self.node_props
            .get(&(node, key))
            .and_then(|c| visible(c, start_ts, txid))
            .cloned()
    }

    /// Edge property as seen at `start_ts`.
    pub fn edge_prop_visible(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
        start_ts: Timestamp,
        txid: TxId,
    ) -> Option<Option<PropValue>> {
        self.edge_props
            .get(&(src, etype, dst, key))
            .and_then(|c| visible(c, start_ts, txid))
            .cloned()
    }

    /// Key binding as seen at `start_ts`.
    pub fn key_visible(
        &self,
        key: &str,
        start_ts: Timestamp,
        txid: TxId,
    ) -> Option<Option<NodeId>> {
        self.key_lookup
            .get(key)
            .and_then(|c| visible(c, start_ts, txid))
            .cloned()
    }

    /// Versioned edges incident to `node` in the given direction, with the
    /// existence value visible at `start_ts`. Used by neighbor enumeration
    /// to re-include edges deleted after the reader's start and exclude
    /// edges added after it.
    pub fn edges_touching(
        &self,
        node: NodeId,
        out: bool,
        start_ts: Timestamp,
        txid: TxId,
    ) -> Vec<((NodeId, ETypeId, NodeId), bool)> {
        self.edge_exists
            .iter()
            .filter(|((src, _, dst), _)| if out { *src == node } else { *dst == node })
            .filter_map(|(&triple, chain)| {
                visible(chain, start_ts, txid).map(|&exists| (triple, exists))
            })
            .collect()
    }

    /// Prunes chains below the minimum active timestamp.
    pub fn gc(&mut self, min_active: Timestamp) -> u64 {
        let mut pruned = 0u64;
        pruned += prune_chains(&mut self.node_exists, min_active);
        pruned += prune_chains(&mut self.edge_exists, min_active);
        pruned += prune_chains(&mut self.node_props, min_active);
        pruned += prune_chains(&mut self.edge_props, min_active);
        pruned += prune_chains(&mut self.key_lookup, min_active);
        self.stats.versions_pruned += pruned;
        self.stats.gc_runs += 1;
        self.stats.last_gc_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if pruned > 0 {
            debug!(pruned = pruned, min_active = min_active, "mvcc.gc");
        }
        pruned
    }

    /// Garbage collection statistics.
    pub fn stats(&self) -> GcStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_committer_wins() {
        let mut mgr = TxManager::new(1);
        let (t1, _s1) = mgr.begin();
        let (t2, _s2) = mgr.begin();

        let mut w2 = FxHashSet::default();
        w2.insert(EntityKey::Node(7));
        mgr.commit(t2, &w2).unwrap();

        let mut w1 = FxHashSet::default();
        w1.insert(EntityKey::Node(7));
        match mgr.commit(t1, &w1) {
            Err(GrafitoError::Conflict(_)) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn disjoint_writes_do_not_conflict() {
        let mut mgr = TxManager::new(1);
        let (t1, _) = mgr.begin();
        let (t2, _) = mgr.begin();
        let mut w2 = FxHashSet::default();
        w2.insert(EntityKey::Node(1));
        mgr.commit(t2, &w2).unwrap();
        let mut w1 = FxHashSet::default();
        w1.insert(EntityKey::Edge(2, 1, 3));
        mgr.commit(t1, &w1).unwrap();
    }

    #[test]
    fn committed_log_prunes_below_min_active() {
        let mut mgr = TxManager::new(1);
        let (t1, _) = mgr.begin();
        let mut w = FxHashSet::default();
        w.insert(EntityKey::Node(1));
        mgr.commit(t1, &w).unwrap();
        assert_eq!(mgr.committed_len(), 1);
        mgr.prune_committed();
        assert_eq!(mgr.committed_len(), 0, "no active readers pin the entry");

        let (_t2, _) = mgr.begin();
        let (t3, _) = mgr.begin();
        let mut w3 = FxHashSet::default();
        w3.insert(EntityKey::Node(2));
        mgr.commit(t3, &w3).unwrap();
        mgr.prune_committed();
        assert_eq!(mgr.committed_len(), 1, "t2 still pins the entry");
    }

    #[test]
    fn version_chain_visibility() {
        let mut store = VersionStore::default();
        // Commit at ts 5 while a reader that started at ts 3 is active;
        // the base captures the pre-commit value.
        store.publish_node_prop(1, 2, Some(PropValue::Int(20)), 9, 5, || {
            Some(PropValue::Int(10))
        });

        // Reader at ts 3 sees the base.
        assert_eq!(
            store.node_prop_visible(1, 2, 3, 4),
            Some(Some(PropValue::Int(10)))
        );
        // Reader at ts 6 sees the committed value.
        assert_eq!(
            store.node_prop_visible(1, 2, 6, 4),
            Some(Some(PropValue::Int(20)))
        );
        // The committer itself sees its own value regardless of ts.
        assert_eq!(
            store.node_prop_visible(1, 2, 3, 9),
            Some(Some(PropValue::Int(20)))
        );
        // Unversioned entities fall through.
        assert_eq!(store.node_prop_visible(1, 3, 3, 4), None);
    }

    #[test]
    fn deleted_edge_stays_visible_to_old_reader() {
        let mut store = VersionStore::default();
        store.publish_edge(1, 7, 2, false, 9, 5, || true);
        assert_eq!(store.edge_visible(1, 7, 2, 3, 0), Some(true));
        assert_eq!(store.edge_visible(1, 7, 2, 5, 0), Some(false));
        let touching = store.edges_touching(1, true, 3, 0);
        assert_eq!(touching, vec![((1, 7, 2), true)]);
    }

    #[test]
    fn gc_drops_settled_chains() {
        let mut store = VersionStore::default();
        store.publish_node(1, false, 9, 5, || true);
        store.publish_node_prop(1, 2, Some(PropValue::Int(1)), 9, 5, || None);

        // An active reader at ts 3 pins everything.
        assert_eq!(store.gc(3), 0);
        assert!(!store.is_empty());

        // Horizon past the newest version: chains collapse.
        let pruned = store.gc(6);
        assert!(pruned >= 4, "expected both chains dropped, pruned={pruned}");
        assert!(store.is_empty());
        assert_eq!(store.stats().gc_runs, 2);
    }

    #[test]
    fn gc_keeps_baseline_for_mid_horizon_readers() {
        let mut store = VersionStore::default();
        store.publish_node_prop(1, 2, Some(PropValue::Int(20)), 8, 5, || {
            Some(PropValue::Int(10))
        });
        store.publish_node_prop(1, 2, Some(PropValue::Int(30)), 9, 9, || None);

        // Reader horizon at ts 7: the ts-5 version is its baseline.
        store.gc(7);
        assert_eq!(
            store.node_prop_visible(1, 2, 7, 0),
            Some(Some(PropValue::Int(20)))
        );
        assert_eq!(
            store.node_prop_visible(1, 2, 9, 0),
            Some(Some(PropValue::Int(30)))
        );
    }
}
