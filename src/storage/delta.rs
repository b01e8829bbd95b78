//! In-memory overlay of uncheckpointed changes.
//!
//! A [`DeltaState`] collects every mutation not yet folded into a snapshot:
//! created and tombstoned nodes, per-node patches, edge add/delete patch
//! lists for both directions, edge property patches, key-index additions and
//! tombstones, and new schema entries. Reads consult the delta first and
//! fall back to the snapshot.
//!
//! During a background checkpoint the engine runs with two layers: the
//! frozen delta being folded into the next snapshot and the live delta
//! receiving new commits. [`OverlayView`] merges the two with live-wins
//! precedence.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::types::{ETypeId, LabelId, NodeId, PropKeyId, PropValue};

/// One adjacency patch: an edge endpoint seen from a fixed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgePatch {
    /// Edge type of the patched edge.
    pub etype: ETypeId,
    /// The other endpoint.
    pub other: NodeId,
}

type PatchList = SmallVec<[EdgePatch; 4]>;

/// Per-node patch: key, label membership changes, property changes.
#[derive(Debug, Clone, Default)]
pub struct NodeDelta {
    /// Key the node was created with, if any. Only set on created nodes.
    pub key: Option<String>,
    /// Labels added since the snapshot.
    pub labels_added: BTreeSet<LabelId>,
    /// Labels removed since the snapshot.
    pub labels_removed: BTreeSet<LabelId>,
    /// Property patches; `None` marks a delete.
    pub props: FxHashMap<PropKeyId, Option<PropValue>>,
}

/// Mutable overlay of uncommitted or uncheckpointed changes.
#[derive(Debug, Default)]
pub struct DeltaState {
    /// Nodes created since the snapshot.
    pub created_nodes: FxHashMap<NodeId, NodeDelta>,
    /// Patches against nodes that exist in the snapshot.
    pub modified_nodes: FxHashMap<NodeId, NodeDelta>,
    /// Tombstones against snapshot nodes.
    pub deleted_nodes: FxHashSet<NodeId>,
    /// Outgoing edge additions per source node.
    pub out_add: FxHashMap<NodeId, PatchList>,
    /// Outgoing edge deletions per source node.
    pub out_del: FxHashMap<NodeId, PatchList>,
    /// Incoming edge additions per destination node.
    pub in_add: FxHashMap<NodeId, PatchList>,
    /// Incoming edge deletions per destination node.
    pub in_del: FxHashMap<NodeId, PatchList>,
    /// Edge property patches; `None` marks a delete.
    pub edge_props: FxHashMap<(NodeId, ETypeId, NodeId), FxHashMap<PropKeyId, Option<PropValue>>>,
    /// Key-index additions.
    pub key_index: FxHashMap<String, NodeId>,
    /// Key-index tombstones.
    pub key_index_deleted: FxHashSet<String>,
    /// Labels defined since the snapshot.
    pub new_labels: FxHashMap<LabelId, String>,
    /// Edge types defined since the snapshot.
    pub new_etypes: FxHashMap<ETypeId, String>,
    /// Property keys defined since the snapshot.
    pub new_propkeys: FxHashMap<PropKeyId, String>,
    /// Vector set/delete intents, routed to the vector store at commit or
    /// after WAL replay. `None` marks a delete.
    pub pending_vectors: FxHashMap<(NodeId, PropKeyId), Option<Arc<Vec<f32>>>>,
}

fn remove_patch(list: &mut FxHashMap<NodeId, PatchList>, node: NodeId, patch: EdgePatch) -> bool {
    if let Some(patches) = list.get_mut(&node) {
        if let Some(pos) = patches.iter().position(|p| *p == patch) {
            patches.remove(pos);
            if patches.is_empty() {
                list.remove(&node);
            }
            return true;
        }
    }
    false
}

fn push_patch(list: &mut FxHashMap<NodeId, PatchList>, node: NodeId, patch: EdgePatch) {
    let patches = list.entry(node).or_default();
    if !patches.contains(&patch) {
        patches.push(patch);
    }
}

impl DeltaState {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.modified_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.out_add.is_empty()
            && self.out_del.is_empty()
            && self.edge_props.is_empty()
            && self.key_index.is_empty()
            && self.key_index_deleted.is_empty()
            && self.new_labels.is_empty()
            && self.new_etypes.is_empty()
            && self.new_propkeys.is_empty()
            && self.pending_vectors.is_empty()
    }

    /// Total edge additions across all nodes.
    pub fn total_edges_added(&self) -> usize {
        self.out_add.values().map(|p| p.len()).sum()
    }

    /// Total edge deletions across all nodes.
    pub fn total_edges_deleted(&self) -> usize {
        self.out_del.values().map(|p| p.len()).sum()
    }

    // ------------------------------------------------------------------
    // Mutators (also used by WAL replay)
    // ------------------------------------------------------------------

    /// Records a schema label definition.
    pub fn define_label(&mut self, id: LabelId, name: &str) {
        self.new_labels.insert(id, name.to_string());
    }

    /// Records a schema edge-type definition.
    pub fn define_etype(&mut self, id: ETypeId, name: &str) {
        self.new_etypes.insert(id, name.to_string());
    }

    /// Records a schema property-key definition.
    pub fn define_propkey(&mut self, id: PropKeyId, name: &str) {
        self.new_propkeys.insert(id, name.to_string());
    }

    /// Records a node creation, registering its key when present.
    pub fn create_node(&mut self, node: NodeId, key: Option<&str>) {
        let entry = self.created_nodes.entry(node).or_default();
        if let Some(key) = key {
            entry.key = Some(key.to_string());
            self.key_index.insert(key.to_string(), node);
            self.key_index_deleted.remove(key);
        }
    }

    /// Records a node deletion. `key` is the node's resolved key, looked up
    /// by the caller across pending/delta/snapshot before the tombstone
    /// hides it.
    pub fn delete_node(&mut self, node: NodeId, key: Option<&str>) {
        if self.created_nodes.remove(&node).is_none() {
            self.deleted_nodes.insert(node);
        }
        self.modified_nodes.remove(&node);
        if let Some(key) = key {
            self.key_index.remove(key);
            self.key_index_deleted.insert(key.to_string());
        }
    }

    /// Records an edge addition, cancelling a matching pending deletion.
    pub fn add_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) {
        remove_patch(&mut self.out_del, src, EdgePatch { etype, other: dst });
        remove_patch(&mut self.in_del, dst, EdgePatch { etype, other: src });
        push_patch(&mut self.out_add, src, EdgePatch { etype, other: dst });
        push_patch(&mut self.in_add, dst, EdgePatch { etype, other: src });
    }

    /// Records an edge deletion, cancelling a matching pending addition.
    pub fn delete_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) {
        remove_patch(&mut self.out_add, src, EdgePatch { etype, other: dst });
        remove_patch(&mut self.in_add, dst, EdgePatch { etype, other: src });
        push_patch(&mut self.out_del, src, EdgePatch { etype, other: dst });
        push_patch(&mut self.in_del, dst, EdgePatch { etype, other: src });
        self.edge_props.remove(&(src, etype, dst));
    }

    fn node_entry(&mut self, node: NodeId) -> &mut NodeDelta {
        if self.created_nodes.contains_key(&node) {
            self.created_nodes.get_mut(&node).unwrap()
        } else {
            self.modified_nodes.entry(node).or_default()
        }
    }

    /// Records a node property write.
    pub fn set_node_prop(&mut self, node: NodeId, key: PropKeyId, value: PropValue) {
        self.node_entry(node).props.insert(key, Some(value));
    }

    /// Records a node property delete.
    pub fn del_node_prop(&mut self, node: NodeId, key: PropKeyId) {
        self.node_entry(node).props.insert(key, None);
    }

    /// Records a label addition on a node.
    pub fn add_node_label(&mut self, node: NodeId, label: LabelId) {
        let entry = self.node_entry(node);
        entry.labels_removed.remove(&label);
        entry.labels_added.insert(label);
    }

    /// Records a label removal from a node.
    pub fn remove_node_label(&mut self, node: NodeId, label: LabelId) {
        let entry = self.node_entry(node);
        entry.labels_added.remove(&label);
        entry.labels_removed.insert(label);
    }

    /// Records an edge property write.
    pub fn set_edge_prop(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
        value: PropValue,
    ) {
        self.edge_props
            .entry((src, etype, dst))
            .or_default()
            .insert(key, Some(value));
    }

    /// Records an edge property delete.
    pub fn del_edge_prop(&mut self, src: NodeId, etype: ETypeId, dst: NodeId, key: PropKeyId) {
        self.edge_props
            .entry((src, etype, dst))
            .or_default()
            .insert(key, None);
    }

    /// Records a vector set intent.
    pub fn set_vector(&mut self, node: NodeId, key: PropKeyId, vector: Arc<Vec<f32>>) {
        self.pending_vectors.insert((node, key), Some(vector));
    }

    /// Records a vector delete intent.
    pub fn del_vector(&mut self, node: NodeId, key: PropKeyId) {
        self.pending_vectors.insert((node, key), None);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether `node` was created in this delta.
    pub fn is_node_created(&self, node: NodeId) -> bool {
        self.created_nodes.contains_key(&node)
    }

    /// Whether `node` is tombstoned in this delta.
    pub fn is_node_deleted(&self, node: NodeId) -> bool {
        self.deleted_nodes.contains(&node)
    }

    /// Patch entry for `node`, created or modified.
    pub fn node_delta(&self, node: NodeId) -> Option<&NodeDelta> {
        self.created_nodes
            .get(&node)
            .or_else(|| self.modified_nodes.get(&node))
    }

    /// Property patch for `(node, key)`. Outer `None` means "no information";
    /// inner `None` means "deleted here".
    pub fn node_prop(&self, node: NodeId, key: PropKeyId) -> Option<Option<&PropValue>> {
        self.node_delta(node)
            .and_then(|d| d.props.get(&key))
            .map(|v| v.as_ref())
    }

    /// Edge property patch for the triple and key.
    pub fn edge_prop(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Option<Option<&PropValue>> {
        self.edge_props
            .get(&(src, etype, dst))
            .and_then(|m| m.get(&key))
            .map(|v| v.as_ref())
    }

    /// Whether the edge was added in this delta.
    pub fn is_edge_added(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
        self.out_add
            .get(&src)
            .is_some_and(|p| p.contains(&EdgePatch { etype, other: dst }))
    }

    /// Whether the edge was deleted in this delta.
    pub fn is_edge_deleted(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
        self.out_del
            .get(&src)
            .is_some_and(|p| p.contains(&EdgePatch { etype, other: dst }))
    }

    /// Folds a transaction's pending delta into this one, preserving the
    /// pending operations' insertion order semantics.
    pub fn merge(&mut self, mut pending: DeltaState) {
        for (id, name) in pending.new_labels.drain() {
            self.new_labels.insert(id, name);
        }
        for (id, name) in pending.new_etypes.drain() {
            self.new_etypes.insert(id, name);
        }
        for (id, name) in pending.new_propkeys.drain() {
            self.new_propkeys.insert(id, name);
        }

        for (node, patch) in pending.created_nodes.drain() {
            self.create_node(node, patch.key.as_deref());
            self.apply_node_patch(node, patch);
        }
        for (node, patch) in pending.modified_nodes.drain() {
            self.apply_node_patch(node, patch);
        }
        for node in pending.deleted_nodes.drain() {
            self.delete_node(node, None);
        }

        for (src, patches) in pending.out_add.drain() {
            for patch in patches {
                self.add_edge(src, patch.etype, patch.other);
            }
        }
        for (src, patches) in pending.out_del.drain() {
            for patch in patches {
                self.delete_edge(src, patch.etype, patch.other);
            }
        }

        for ((src, etype, dst), props) in pending.edge_props.drain() {
            for (key, value) in props {
                match value {
                    Some(value) => self.set_edge_prop(src, etype, dst, key, value),
                    None => self.del_edge_prop(src, etype, dst, key),
                }
            }
        }

        // Tombstones first, then additions, so a key deleted and re-added in
        // the pending delta stays resolvable.
        for key in pending.key_index_deleted.drain() {
            if !pending.key_index.contains_key(&key) {
                self.key_index.remove(&key);
                self.key_index_deleted.insert(key);
            }
        }
        for (key, node) in pending.key_index.drain() {
            self.key_index_deleted.remove(&key);
            self.key_index.insert(key, node);
        }

        for (slot, vector) in pending.pending_vectors.drain() {
            self.pending_vectors.insert(slot, vector);
        }
    }

    fn apply_node_patch(&mut self, node: NodeId, patch: NodeDelta) {
        for label in patch.labels_added {
            self.add_node_label(node, label);
        }
        for label in patch.labels_removed {
            self.remove_node_label(node, label);
        }
        for (key, value) in patch.props {
            match value {
                Some(value) => self.set_node_prop(node, key, value),
                None => self.del_node_prop(node, key),
            }
        }
    }
}

/// Read view over the frozen (being checkpointed) and live delta layers.
///
/// Live entries win; the frozen layer only answers where the live layer has
/// no information. Node IDs are never reused, so the deleted sets of both
/// layers union cleanly.
#[derive(Clone, Copy)]
pub struct OverlayView<'a> {
    frozen: Option<&'a DeltaState>,
    live: &'a DeltaState,
}

impl<'a> OverlayView<'a> {
    /// Builds a view over an optional frozen layer and the live layer.
    pub fn new(frozen: Option<&'a DeltaState>, live: &'a DeltaState) -> Self {
        Self { frozen, live }
    }

    fn layers(&self) -> impl Iterator<Item = &'a DeltaState> {
        // Live first: its entries take precedence.
        std::iter::once(self.live).chain(self.frozen)
    }

    /// Whether the node is tombstoned in either layer.
    pub fn is_node_deleted(&self, node: NodeId) -> bool {
        self.layers().any(|d| d.is_node_deleted(node))
    }

    /// Whether the node was created in either layer.
    pub fn is_node_created(&self, node: NodeId) -> bool {
        self.layers().any(|d| d.is_node_created(node))
    }

    /// Key the node was created with, when created in the overlay.
    pub fn created_node_key(&self, node: NodeId) -> Option<Option<&'a str>> {
        for layer in self.layers() {
            if let Some(patch) = layer.created_nodes.get(&node) {
                return Some(patch.key.as_deref());
            }
        }
        None
    }

    /// Node property patch with live-over-frozen precedence.
    pub fn node_prop(&self, node: NodeId, key: PropKeyId) -> Option<Option<&'a PropValue>> {
        for layer in self.layers() {
            if let Some(v) = layer.node_prop(node, key) {
                return Some(v);
            }
        }
        None
    }

    /// Edge property patch with live-over-frozen precedence.
    pub fn edge_prop(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Option<Option<&'a PropValue>> {
        for layer in self.layers() {
            if let Some(v) = layer.edge_prop(src, etype, dst, key) {
                return Some(v);
            }
        }
        None
    }

    /// All property patches visible for a node, newest layer first.
    pub fn node_prop_patches(&self, node: NodeId) -> FxHashMap<PropKeyId, Option<&'a PropValue>> {
        let mut out = FxHashMap::default();
        // Frozen first so live overwrites.
        for layer in self.frozen.iter().copied().chain(std::iter::once(self.live)) {
            if let Some(patch) = layer.node_delta(node) {
                for (k, v) in &patch.props {
                    out.insert(*k, v.as_ref());
                }
            }
        }
        out
    }

    /// All edge property patches for a triple, live overwriting frozen.
    pub fn edge_prop_patches(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
    ) -> FxHashMap<PropKeyId, Option<&'a PropValue>> {
        let mut out = FxHashMap::default();
        for layer in self.frozen.iter().copied().chain(std::iter::once(self.live)) {
            if let Some(props) = layer.edge_props.get(&(src, etype, dst)) {
                for (k, v) in props {
                    out.insert(*k, v.as_ref());
                }
            }
        }
        out
    }

    /// Label membership changes for a node merged across layers.
    pub fn label_patches(&self, node: NodeId) -> (BTreeSet<LabelId>, BTreeSet<LabelId>) {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for layer in self.frozen.iter().copied().chain(std::iter::once(self.live)) {
            if let Some(patch) = layer.node_delta(node) {
                for &l in &patch.labels_added {
                    removed.remove(&l);
                    added.insert(l);
                }
                for &l in &patch.labels_removed {
                    added.remove(&l);
                    removed.insert(l);
                }
            }
        }
        (added, removed)
    }

    /// Effective adjacency patches for one node and direction: the combined
    /// additions and deletions after live-wins reconciliation.
    pub fn adjacency_patches(&self, node: NodeId, out: bool) -> (Vec<EdgePatch>, Vec<EdgePatch>) {
        let select = |d: &'a DeltaState, add: bool| -> Option<&'a PatchList> {
            match (out, add) {
                (true, true) => d.out_add.get(&node),
                (true, false) => d.out_del.get(&node),
                (false, true) => d.in_add.get(&node),
                (false, false) => d.in_del.get(&node),
            }
        };
        let mut adds: Vec<EdgePatch> = Vec::new();
        let mut dels: Vec<EdgePatch> = Vec::new();
        if let Some(frozen) = self.frozen {
            adds.extend(select(frozen, true).into_iter().flatten().copied());
            dels.extend(select(frozen, false).into_iter().flatten().copied());
        }
        // Live layer reconciles: a live add cancels a frozen delete and vice
        // versa, matching the single-layer last-writer-wins discipline.
        for &patch in select(self.live, true).into_iter().flatten() {
            dels.retain(|p| *p != patch);
            if !adds.contains(&patch) {
                adds.push(patch);
            }
        }
        for &patch in select(self.live, false).into_iter().flatten() {
            adds.retain(|p| *p != patch);
            if !dels.contains(&patch) {
                dels.push(patch);
            }
        }
        (adds, dels)
    }

    /// Two-level key lookup over the overlay. `Some(Some(id))` = added here,
    /// `Some(None)` = tombstoned here, `None` = ask the snapshot.
    pub fn key_lookup(&self, key: &str) -> Option<Option<NodeId>> {
        for layer in self.layers() {
            if let Some(&node) = layer.key_index.get(key) {
                return Some(Some(node));
            }
            if layer.key_index_deleted.contains(key) {
                return Some(None);
            }
        }
        None
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_delete_same_edge_cancels() {
        let mut delta = DeltaState::new();
        delta.add_edge(1, 7, 2);
        assert!(delta.is_edge_added(1, 7, 2));
        delta.delete_edge(1, 7, 2);
        assert!(!delta.is_edge_added(1, 7, 2));
        assert!(delta.is_edge_deleted(1, 7, 2));
        delta.add_edge(1, 7, 2);
        assert!(delta.is_edge_added(1, 7, 2));
        assert!(!delta.is_edge_deleted(1, 7, 2));
    }

    #[test]
    fn delete_node_tombstones_key() {
        let mut delta = DeltaState::new();
        delta.create_node(5, Some("alice"));
        assert_eq!(delta.key_index.get("alice"), Some(&5));
        delta.delete_node(5, Some("alice"));
        assert!(!delta.is_node_created(5));
        assert!(delta.key_index_deleted.contains("alice"));
        assert!(delta.key_index.get("alice").is_none());
        // Created-then-deleted nodes leave no tombstone against the snapshot.
        assert!(!delta.is_node_deleted(5));
    }

    #[test]
    fn key_reuse_after_delete_resolves_to_new_node() {
        let mut delta = DeltaState::new();
        delta.create_node(5, Some("alice"));
        delta.delete_node(5, Some("alice"));
        delta.create_node(6, Some("alice"));
        let live = delta;
        let view = OverlayView::new(None, &live);
        assert_eq!(view.key_lookup("alice"), Some(Some(6)));
    }

    #[test]
    fn prop_patch_precedence() {
        let mut frozen = DeltaState::new();
        frozen.set_node_prop(1, 2, PropValue::Int(10));
        frozen.set_node_prop(1, 3, PropValue::Int(30));
        let mut live = DeltaState::new();
        live.set_node_prop(1, 2, PropValue::Int(20));
        live.del_node_prop(1, 4);

        let view = OverlayView::new(Some(&frozen), &live);
        assert_eq!(view.node_prop(1, 2), Some(Some(&PropValue::Int(20))));
        assert_eq!(view.node_prop(1, 3), Some(Some(&PropValue::Int(30))));
        assert_eq!(view.node_prop(1, 4), Some(None));
        assert_eq!(view.node_prop(1, 5), None);
    }

    #[test]
    fn overlay_adjacency_reconciles_layers() {
        let mut frozen = DeltaState::new();
        frozen.add_edge(1, 7, 2);
        frozen.add_edge(1, 7, 3);
        let mut live = DeltaState::new();
        live.delete_edge(1, 7, 3);
        live.add_edge(1, 7, 4);

        let view = OverlayView::new(Some(&frozen), &live);
        let (adds, dels) = view.adjacency_patches(1, true);
        assert!(adds.contains(&EdgePatch { etype: 7, other: 2 }));
        assert!(adds.contains(&EdgePatch { etype: 7, other: 4 }));
        assert!(!adds.contains(&EdgePatch { etype: 7, other: 3 }));
        assert!(dels.contains(&EdgePatch { etype: 7, other: 3 }));
    }

    #[test]
    fn merge_folds_pending_in_order() {
        let mut live = DeltaState::new();
        live.create_node(1, Some("a"));

        let mut pending = DeltaState::new();
        pending.create_node(2, Some("b"));
        pending.add_edge(1, 7, 2);
        pending.set_node_prop(2, 9, PropValue::Bool(true));
        pending.delete_node(1, Some("a"));

        live.merge(pending);
        assert!(live.is_node_created(2));
        assert!(!live.is_node_created(1));
        assert!(live.key_index_deleted.contains("a"));
        assert_eq!(live.key_index.get("b"), Some(&2));
        assert_eq!(
            live.node_prop(2, 9),
            Some(Some(&PropValue::Bool(true)))
        );
    }
}
