//! Merged reads: cache -> transaction pending -> MVCC versions -> delta
//! overlay -> snapshot.
//!
//! Every read funnels through a [`ReadCtx`]: committed reads carry no
//! pending layer and no timestamp; transactional reads carry the
//! transaction's pending delta and, under MVCC, its start timestamp for
//! version-chain visibility. Caching applies only to committed reads.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::query::{
    self, DijkstraConfig, PathResult, TraversalStep, TraverseOptions, TraverseResult,
};
use crate::storage::delta::{DeltaState, OverlayView};
use crate::types::{
    Direction, ETypeId, Edge, LabelId, NodeId, PropKeyId, PropValue, Timestamp, TxId,
};

use super::{DbInner, GraphDB};

/// The layers one read operates against.
#[derive(Clone, Copy, Default)]
pub(crate) struct ReadCtx<'a> {
    /// The calling transaction's pending delta.
    pub(crate) pending: Option<&'a DeltaState>,
    /// `(txid, start_ts)` for MVCC visibility; `None` reads latest committed.
    pub(crate) ts: Option<(TxId, Timestamp)>,
}

impl DbInner {
    fn chain_node_visible(&self, ctx: ReadCtx<'_>, node: NodeId) -> Option<bool> {
        let (txid, ts) = ctx.ts?;
        let mvcc = self.mvcc.as_ref()?;
        let versions = mvcc.versions.lock();
        if versions.is_empty() {
            return None;
        }
        versions.node_visible(node, ts, txid)
    }

    pub(crate) fn node_exists_ctx(&self, ctx: ReadCtx<'_>, node: NodeId) -> bool {
        if let Some(pending) = ctx.pending {
            if pending.is_node_deleted(node) {
                return false;
            }
            if pending.is_node_created(node) {
                return true;
            }
        }
        if let Some(visible) = self.chain_node_visible(ctx, node) {
            return visible;
        }
        let delta = self.delta.read();
        let view = delta.view();
        if view.is_node_deleted(node) {
            return false;
        }
        if view.is_node_created(node) {
            return true;
        }
        self.snapshot
            .read()
            .as_deref()
            .is_some_and(|s| s.has_node(node))
    }

    pub(crate) fn edge_exists_ctx(
        &self,
        ctx: ReadCtx<'_>,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
    ) -> bool {
        if !self.node_exists_ctx(ctx, src) || !self.node_exists_ctx(ctx, dst) {
            return false;
        }
        if let Some(pending) = ctx.pending {
            if pending.is_edge_deleted(src, etype, dst) {
                return false;
            }
            if pending.is_edge_added(src, etype, dst) {
                return true;
            }
        }
        if let Some((txid, ts)) = ctx.ts {
            if let Some(mvcc) = self.mvcc.as_ref() {
                let versions = mvcc.versions.lock();
                if let Some(visible) = versions.edge_visible(src, etype, dst, ts, txid) {
                    return visible;
                }
            }
        }
        let delta = self.delta.read();
        let view = delta.view();
        if view
            .adjacency_patches(src, true)
            .1
            .iter()
            .any(|p| p.etype == etype && p.other == dst)
        {
            return false;
        }
        if view
            .adjacency_patches(src, true)
            .0
            .iter()
            .any(|p| p.etype == etype && p.other == dst)
        {
            return true;
        }
        let snapshot = self.snapshot.read();
        let Some(snap) = snapshot.as_deref() else {
            return false;
        };
        match (snap.phys_node(src), snap.phys_node(dst)) {
            (Some(s), Some(d)) => snap.has_edge(s, etype, d),
            _ => false,
        }
    }

    pub(crate) fn node_prop_ctx(
        &self,
        ctx: ReadCtx<'_>,
        node: NodeId,
        key: PropKeyId,
    ) -> Option<PropValue> {
        if !self.node_exists_ctx(ctx, node) {
            return None;
        }
        if let Some(pending) = ctx.pending {
            if let Some(patch) = pending.node_prop(node, key) {
                return patch.cloned();
            }
        }
        if let Some((txid, ts)) = ctx.ts {
            if let Some(mvcc) = self.mvcc.as_ref() {
                if let Some(value) = mvcc.versions.lock().node_prop_visible(node, key, ts, txid) {
                    return value;
                }
            }
        }
        let delta = self.delta.read();
        if let Some(patch) = delta.view().node_prop(node, key) {
            return patch.cloned();
        }
        let snapshot = self.snapshot.read();
        let snap = snapshot.as_deref()?;
        let phys = snap.phys_node(node)?;
        snap.node_prop(phys, key).ok().flatten()
    }

    pub(crate) fn node_props_ctx(
        &self,
        ctx: ReadCtx<'_>,
        node: NodeId,
    ) -> Vec<(PropKeyId, PropValue)> {
        if !self.node_exists_ctx(ctx, node) {
            return Vec::new();
        }
        let mut merged: FxHashMap<PropKeyId, Option<PropValue>> = FxHashMap::default();
        {
            let snapshot = self.snapshot.read();
            if let Some(snap) = snapshot.as_deref() {
                if let Some(phys) = snap.phys_node(node) {
                    if let Ok(props) = snap.node_props(phys) {
                        for (key, value) in props {
                            merged.insert(key, Some(value));
                        }
                    }
                }
            }
        }
        {
            let delta = self.delta.read();
            for (key, patch) in delta.view().node_prop_patches(node) {
                merged.insert(key, patch.cloned());
            }
        }
        if let Some(pending) = ctx.pending {
            if let Some(patch) = pending.node_delta(node) {
                for (key, value) in &patch.props {
                    merged.insert(*key, value.clone());
                }
            }
        }
        // MVCC overrides patch-level values per key.
        if let Some((txid, ts)) = ctx.ts {
            if let Some(mvcc) = self.mvcc.as_ref() {
                let versions = mvcc.versions.lock();
                if !versions.is_empty() {
                    let keys: Vec<PropKeyId> = merged.keys().copied().collect();
                    for key in keys {
                        let own = ctx
                            .pending
                            .is_some_and(|p| p.node_prop(node, key).is_some());
                        if own {
                            continue;
                        }
                        if let Some(value) = versions.node_prop_visible(node, key, ts, txid) {
                            merged.insert(key, value);
                        }
                    }
                }
            }
        }
        let mut out: Vec<(PropKeyId, PropValue)> = merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    pub(crate) fn node_labels_ctx(&self, ctx: ReadCtx<'_>, node: NodeId) -> Vec<LabelId> {
        if !self.node_exists_ctx(ctx, node) {
            return Vec::new();
        }
        let mut labels: std::collections::BTreeSet<LabelId> = std::collections::BTreeSet::new();
        {
            let snapshot = self.snapshot.read();
            if let Some(snap) = snapshot.as_deref() {
                if let Some(phys) = snap.phys_node(node) {
                    labels.extend(snap.node_labels(phys));
                }
            }
        }
        {
            let delta = self.delta.read();
            let (added, removed) = delta.view().label_patches(node);
            for l in added {
                labels.insert(l);
            }
            for l in removed {
                labels.remove(&l);
            }
        }
        if let Some(pending) = ctx.pending {
            if let Some(patch) = pending.node_delta(node) {
                for &l in &patch.labels_added {
                    labels.insert(l);
                }
                for l in &patch.labels_removed {
                    labels.remove(l);
                }
            }
        }
        labels.into_iter().collect()
    }

    pub(crate) fn edge_prop_ctx(
        &self,
        ctx: ReadCtx<'_>,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Option<PropValue> {
        if !self.edge_exists_ctx(ctx, src, etype, dst) {
            return None;
        }
        if let Some(pending) = ctx.pending {
            if let Some(patch) = pending.edge_prop(src, etype, dst, key) {
                return patch.cloned();
            }
        }
        if let Some((txid, ts)) = ctx.ts {
            if let Some(mvcc) = self.mvcc.as_ref() {
                if let Some(value) = mvcc
                    .versions
                    .lock()
                    .edge_prop_visible(src, etype, dst, key, ts, txid)
                {
                    return value;
                }
            }
        }
        let delta = self.delta.read();
        if let Some(patch) = delta.view().edge_prop(src, etype, dst, key) {
            return patch.cloned();
        }
        let snapshot = self.snapshot.read();
        let snap = snapshot.as_deref()?;
        let (s, d) = (snap.phys_node(src)?, snap.phys_node(dst)?);
        let idx = snap.find_edge_index(s, etype, d)?;
        snap.edge_prop(idx, key).ok().flatten()
    }

    pub(crate) fn edge_props_ctx(
        &self,
        ctx: ReadCtx<'_>,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
    ) -> Vec<(PropKeyId, PropValue)> {
        if !self.edge_exists_ctx(ctx, src, etype, dst) {
            return Vec::new();
        }
        let mut merged: FxHashMap<PropKeyId, Option<PropValue>> = FxHashMap::default();
        {
            let snapshot = self.snapshot.read();
            if let Some(snap) = snapshot.as_deref() {
                if let (Some(s), Some(d)) = (snap.phys_node(src), snap.phys_node(dst)) {
                    if let Some(idx) = snap.find_edge_index(s, etype, d) {
                        if let Ok(props) = snap.edge_props(idx) {
                            for (key, value) in props {
                                merged.insert(key, Some(value));
                            }
                        }
                    }
                }
            }
        }
        {
            let delta = self.delta.read();
            for (key, patch) in delta.view().edge_prop_patches(src, etype, dst) {
                merged.insert(key, patch.cloned());
            }
        }
        if let Some(pending) = ctx.pending {
            if let Some(props) = pending.edge_props.get(&(src, etype, dst)) {
                for (key, value) in props {
                    merged.insert(*key, value.clone());
                }
            }
        }
        // MVCC overrides patch-level values per key, mirroring the node
        // plural accessor.
        if let Some((txid, ts)) = ctx.ts {
            if let Some(mvcc) = self.mvcc.as_ref() {
                let versions = mvcc.versions.lock();
                if !versions.is_empty() {
                    let keys: Vec<PropKeyId> = merged.keys().copied().collect();
                    for key in keys {
                        let own = ctx
                            .pending
                            .is_some_and(|p| p.edge_prop(src, etype, dst, key).is_some());
                        if own {
                            continue;
                        }
                        if let Some(value) =
                            versions.edge_prop_visible(src, etype, dst, key, ts, txid)
                        {
                            merged.insert(key, value);
                        }
                    }
                }
            }
        }
        let mut out: Vec<(PropKeyId, PropValue)> = merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    pub(crate) fn key_lookup_ctx(&self, ctx: ReadCtx<'_>, key: &str) -> Option<NodeId> {
        if let Some(pending) = ctx.pending {
            if let Some(result) = OverlayView::new(None, pending).key_lookup(key) {
                return result;
            }
        }
        if let Some((txid, ts)) = ctx.ts {
            if let Some(mvcc) = self.mvcc.as_ref() {
                if let Some(result) = mvcc.versions.lock().key_visible(key, ts, txid) {
                    return result.filter(|&node| self.node_exists_ctx(ctx, node));
                }
            }
        }
        {
            let delta = self.delta.read();
            if let Some(result) = delta.view().key_lookup(key) {
                return result;
            }
        }
        let node = {
            let snapshot = self.snapshot.read();
            snapshot.as_deref()?.key_lookup(key)?
        };
        self.node_exists_ctx(ctx, node).then_some(node)
    }

    /// The node's key, resolved across layers (used before a tombstone
    /// hides it).
    pub(crate) fn node_key_ctx(&self, ctx: ReadCtx<'_>, node: NodeId) -> Option<String> {
        if let Some(pending) = ctx.pending {
            if let Some(key) = OverlayView::new(None, pending).created_node_key(node) {
                return key.map(String::from);
            }
        }
        {
            let delta = self.delta.read();
            if let Some(key) = delta.view().created_node_key(node) {
                return key.map(String::from);
            }
        }
        let snapshot = self.snapshot.read();
        let snap = snapshot.as_deref()?;
        let phys = snap.phys_node(node)?;
        snap.node_key(phys).map(String::from)
    }

    fn directed_neighbors(
        &self,
        ctx: ReadCtx<'_>,
        node: NodeId,
        out: bool,
        etype: Option<ETypeId>,
    ) -> Vec<Edge> {
        if !self.node_exists_ctx(ctx, node) {
            return Vec::new();
        }

        let make_edge = |et: ETypeId, other: NodeId| -> Edge {
            if out {
                Edge {
                    src: node,
                    etype: et,
                    dst: other,
                }
            } else {
                Edge {
                    src: other,
                    etype: et,
                    dst: node,
                }
            }
        };
        let etype_ok = |et: ETypeId| etype.map_or(true, |want| et == want);
        let pending_deleted = |edge: &Edge| {
            ctx.pending
                .is_some_and(|p| p.is_edge_deleted(edge.src, edge.etype, edge.dst))
        };

        // Versioned edges incident to this node, for readers that must see
        // past (or not yet see) concurrent commits.
        let chain: Option<FxHashMap<(NodeId, ETypeId, NodeId), bool>> =
            ctx.ts.and_then(|(txid, ts)| {
                let mvcc = self.mvcc.as_ref()?;
                let versions = mvcc.versions.lock();
                if versions.is_empty() {
                    return None;
                }
                Some(versions.edges_touching(node, out, ts, txid).into_iter().collect())
            });

        let mut edges: Vec<Edge> = Vec::new();
        let mut seen: FxHashSet<Edge> = FxHashSet::default();
        let push = |edge: Edge, edges: &mut Vec<Edge>, seen: &mut FxHashSet<Edge>| {
            if seen.insert(edge) {
                edges.push(edge);
            }
        };

        let delta = self.delta.read();
        let view = delta.view();
        let (adds, dels) = view.adjacency_patches(node, out);
        let other_visible = |other: NodeId| -> bool {
            if ctx.pending.is_some_and(|p| p.is_node_deleted(other)) {
                return false;
            }
            if let Some(visible) = self.chain_node_visible(ctx, other) {
                return visible;
            }
            !view.is_node_deleted(other)
        };
        let delta_deleted = |et: ETypeId, other: NodeId| {
            dels.iter().any(|p| p.etype == et && p.other == other)
        };

        // Snapshot slice, already sorted by (etype, other).
        {
            let snapshot = self.snapshot.read();
            if let Some(snap) = snapshot.as_deref() {
                if let Some(phys) = snap.phys_node(node) {
                    let slice = if out {
                        snap.out_neighbors(phys)
                    } else {
                        snap.in_neighbors(phys)
                    };
                    for (et, other_phys) in slice {
                        if !etype_ok(et) {
                            continue;
                        }
                        let Some(other) = snap.node_id(other_phys) else {
                            continue;
                        };
                        let edge = make_edge(et, other);
                        if pending_deleted(&edge) {
                            continue;
                        }
                        let visible = match chain
                            .as_ref()
                            .and_then(|c| c.get(&(edge.src, edge.etype, edge.dst)))
                        {
                            Some(&v) => v,
                            None => !delta_deleted(et, other),
                        };
                        if visible && other_visible(other) {
                            push(edge, &mut edges, &mut seen);
                        }
                    }
                }
            }
        }

        // Delta additions.
        for patch in &adds {
            if !etype_ok(patch.etype) {
                continue;
            }
            let edge = make_edge(patch.etype, patch.other);
            if pending_deleted(&edge) {
                continue;
            }
            if let Some(&false) = chain
                .as_ref()
                .and_then(|c| c.get(&(edge.src, edge.etype, edge.dst)))
            {
                continue;
            }
            if other_visible(patch.other) {
                push(edge, &mut edges, &mut seen);
            }
        }

        // Pending additions: a transaction's own writes are always visible.
        if let Some(pending) = ctx.pending {
            let list = if out {
                pending.out_add.get(&node)
            } else {
                pending.in_add.get(&node)
            };
            for patch in list.into_iter().flatten() {
                if !etype_ok(patch.etype) {
                    continue;
                }
                if pending.is_node_deleted(patch.other) {
                    continue;
                }
                push(make_edge(patch.etype, patch.other), &mut edges, &mut seen);
            }
        }

        // Version-chain edges invisible in the merged layers but still
        // visible to this reader (deleted after its start timestamp).
        if let Some(chain) = chain.as_ref() {
            for (&(src, et, dst), &visible) in chain {
                if !visible || !etype_ok(et) {
                    continue;
                }
                let edge = Edge {
                    src,
                    etype: et,
                    dst,
                };
                if pending_deleted(&edge) {
                    continue;
                }
                let other = if out { dst } else { src };
                if other_visible(other) {
                    push(edge, &mut edges, &mut seen);
                }
            }
        }

        edges.sort_by_key(|e| (e.etype, if out { e.dst } else { e.src }));
        edges
    }

    pub(crate) fn neighbors_ctx(
        &self,
        ctx: ReadCtx<'_>,
        node: NodeId,
        direction: Direction,
        etype: Option<ETypeId>,
    ) -> Vec<Edge> {
        match direction {
            Direction::Out => self.directed_neighbors(ctx, node, true, etype),
            Direction::In => self.directed_neighbors(ctx, node, false, etype),
            Direction::Both => {
                let mut edges = self.directed_neighbors(ctx, node, true, etype);
                let mut seen: FxHashSet<Edge> = edges.iter().copied().collect();
                for edge in self.directed_neighbors(ctx, node, false, etype) {
                    if seen.insert(edge) {
                        edges.push(edge);
                    }
                }
                edges
            }
        }
    }

    pub(crate) fn list_nodes_ctx(&self, ctx: ReadCtx<'_>) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        {
            let snapshot = self.snapshot.read();
            if let Some(snap) = snapshot.as_deref() {
                for phys in 0..snap.header.num_nodes as u32 {
                    if let Some(node) = snap.node_id(phys) {
                        nodes.push(node);
                    }
                }
            }
        }
        {
            let delta = self.delta.read();
            if let Some(frozen) = delta.frozen.as_ref() {
                nodes.extend(frozen.created_nodes.keys().copied());
            }
            nodes.extend(delta.live.created_nodes.keys().copied());
        }
        if let Some(pending) = ctx.pending {
            nodes.extend(pending.created_nodes.keys().copied());
        }
        nodes.sort_unstable();
        nodes.dedup();
        nodes.retain(|&n| self.node_exists_ctx(ctx, n));
        nodes
    }

    pub(crate) fn list_edges_ctx(
        &self,
        ctx: ReadCtx<'_>,
        etype: Option<ETypeId>,
    ) -> Vec<Edge> {
        let mut edges = Vec::new();
        for node in self.list_nodes_ctx(ctx) {
            edges.extend(self.directed_neighbors(ctx, node, true, etype));
        }
        edges.sort();
        edges.dedup();
        edges
    }

}

impl GraphDB {
    fn latest(&self) -> ReadCtx<'static> {
        ReadCtx::default()
    }

    /// Resolves a key to its node.
    pub fn node_by_key(&self, key: &str) -> crate::error::Result<Option<NodeId>> {
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Some(hit) = cache.lock().get_key(key) {
                return Ok(hit);
            }
        }
        let result = self.inner.key_lookup_ctx(self.latest(), key);
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().put_key(key, result);
        }
        Ok(result)
    }

    /// Whether a node exists in the committed state.
    pub fn node_exists(&self, node: NodeId) -> bool {
        self.inner.node_exists_ctx(self.latest(), node)
    }

    /// Whether an edge exists in the committed state.
    pub fn edge_exists(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
        self.inner.edge_exists_ctx(self.latest(), src, etype, dst)
    }

    /// One committed node property, through the property cache.
    pub fn node_prop(&self, node: NodeId, key: PropKeyId) -> Option<PropValue> {
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Some(hit) = cache.lock().get_node_prop(node, key) {
                return hit;
            }
        }
        let value = self.inner.node_prop_ctx(self.latest(), node, key);
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().put_node_prop(node, key, value.clone());
        }
        value
    }

    /// All committed properties of a node.
    pub fn node_props(&self, node: NodeId) -> Vec<(PropKeyId, PropValue)> {
        self.inner.node_props_ctx(self.latest(), node)
    }

    /// Committed labels of a node, sorted.
    pub fn node_labels(&self, node: NodeId) -> Vec<LabelId> {
        self.inner.node_labels_ctx(self.latest(), node)
    }

    /// One committed edge property, through the property cache.
    pub fn edge_prop(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Option<PropValue> {
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Some(hit) = cache.lock().get_edge_prop(src, etype, dst, key) {
                return hit;
            }
        }
        let value = self.inner.edge_prop_ctx(self.latest(), src, etype, dst, key);
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().put_edge_prop(src, etype, dst, key, value.clone());
        }
        value
    }

    /// All committed properties of an edge.
    pub fn edge_props(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> Vec<(PropKeyId, PropValue)> {
        self.inner.edge_props_ctx(self.latest(), src, etype, dst)
    }

    /// Committed out-neighbors, sorted by (etype, dst), through the
    /// traversal cache.
    pub fn neighbors_out(&self, node: NodeId, etype: Option<ETypeId>) -> Vec<Edge> {
        self.cached_neighbors(node, Direction::Out, etype)
    }

    /// Committed in-neighbors, sorted by (etype, src).
    pub fn neighbors_in(&self, node: NodeId, etype: Option<ETypeId>) -> Vec<Edge> {
        self.cached_neighbors(node, Direction::In, etype)
    }

    fn cached_neighbors(&self, node: NodeId, direction: Direction, etype: Option<ETypeId>) -> Vec<Edge> {
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Some(entry) = cache.lock().get_traversal(node, etype, direction) {
                if !entry.truncated {
                    return entry.edges;
                }
            }
        }
        let edges = self.inner.neighbors_ctx(self.latest(), node, direction, etype);
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().put_traversal(node, etype, direction, &edges);
        }
        edges
    }

    /// All committed node ids, ascending.
    pub fn list_nodes(&self) -> Vec<NodeId> {
        self.inner.list_nodes_ctx(self.latest())
    }

    /// All committed edges, optionally filtered by type.
    pub fn list_edges(&self, etype: Option<ETypeId>) -> Vec<Edge> {
        self.inner.list_edges_ctx(self.latest(), etype)
    }

    /// Committed node count.
    pub fn count_nodes(&self) -> usize {
        self.list_nodes().len()
    }

    /// Committed edge count, optionally by type.
    pub fn count_edges(&self, etype: Option<ETypeId>) -> usize {
        self.list_edges(etype).len()
    }

    /// Runs `compute` once per distinct fingerprint, serving repeats from
    /// the content-addressed query cache until its TTL expires.
    pub fn cached_query<T, F>(&self, fingerprint: &str, compute: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(cache) = self.inner.cache.as_ref() {
            if let Some(hit) = cache.lock().get_query(fingerprint) {
                if let Ok(typed) = hit.downcast::<T>() {
                    return typed;
                }
            }
            let value = Arc::new(compute());
            cache
                .lock()
                .put_query(fingerprint, Arc::clone(&value) as Arc<_>);
            return value;
        }
        Arc::new(compute())
    }

    // ------------------------------------------------------------------
    // Algorithms over the committed state
    // ------------------------------------------------------------------

    fn neighbor_fn(&self) -> impl Fn(NodeId, Direction, Option<ETypeId>) -> Vec<Edge> + '_ {
        move |node, direction, etype| {
            self.inner
                .neighbors_ctx(ReadCtx::default(), node, direction, etype)
        }
    }

    fn weight_fn(&self, weight_key: Option<PropKeyId>) -> impl Fn(&Edge) -> f64 + '_ {
        move |edge: &Edge| match weight_key {
            Some(key) => self
                .inner
                .edge_prop_ctx(ReadCtx::default(), edge.src, edge.etype, edge.dst, key)
                .and_then(|v| v.as_weight())
                .unwrap_or(1.0),
            None => 1.0,
        }
    }

    /// Multi-hop traversal: one frontier expansion per step.
    pub fn traverse(
        &self,
        sources: &[NodeId],
        steps: &[TraversalStep],
        unique: bool,
    ) -> Vec<TraverseResult> {
        query::traverse(sources, steps, unique, self.neighbor_fn())
    }

    /// Depth-bounded traversal.
    pub fn traverse_depth(
        &self,
        sources: &[NodeId],
        etype: Option<ETypeId>,
        options: TraverseOptions,
    ) -> Vec<TraverseResult> {
        query::traverse_depth(sources, etype, options, self.neighbor_fn())
    }

    /// Breadth-first shortest path by hop count.
    pub fn bfs(
        &self,
        source: NodeId,
        target: NodeId,
        allowed_etypes: Option<&[ETypeId]>,
        max_depth: usize,
    ) -> PathResult {
        query::bfs(source, target, allowed_etypes, max_depth, self.neighbor_fn())
    }

    /// Dijkstra shortest path; `weight_key` selects the edge property whose
    /// numeric values weigh edges (missing or non-numeric weighs 1).
    pub fn dijkstra(&self, config: &DijkstraConfig, weight_key: Option<PropKeyId>) -> PathResult {
        query::dijkstra(config, self.neighbor_fn(), self.weight_fn(weight_key))
    }

    /// Yen's k shortest simple paths.
    pub fn k_shortest(
        &self,
        config: &DijkstraConfig,
        k: usize,
        weight_key: Option<PropKeyId>,
    ) -> Vec<PathResult> {
        query::k_shortest(config, k, self.neighbor_fn(), self.weight_fn(weight_key))
    }

    /// Nodes reachable from `source` within `max_depth` hops.
    pub fn reachable_nodes(
        &self,
        source: NodeId,
        max_depth: usize,
        etype: Option<ETypeId>,
    ) -> Vec<NodeId> {
        query::reachable_nodes(source, max_depth, etype, self.neighbor_fn())
    }

    /// Whether any path of at most `max_depth` hops connects the nodes.
    pub fn has_path(&self, source: NodeId, target: NodeId, max_depth: usize) -> bool {
        self.bfs(source, target, None, max_depth).found
    }
}
