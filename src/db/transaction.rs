//! Transactions: buffered mutations, WAL append at commit, MVCC
//! publication, delta fold, and cache invalidation.
//!
//! A [`Transaction`] buffers its WAL frames and its pending delta locally.
//! Nothing touches the shared engine until `commit`, which (under the
//! commit lock) validates first-committer-wins, appends the frames plus a
//! `Commit` marker to the active WAL region, persists the header per the
//! sync mode, publishes MVCC versions for concurrent readers, folds the
//! pending delta into the live delta, applies vector intents, and
//! invalidates caches. `rollback` (or dropping the guard) discards
//! everything.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::error::{GrafitoError, Result};
use crate::storage::delta::DeltaState;
use crate::storage::mvcc::EntityKey;
use crate::storage::vstore::{VectorIndexSpec, VectorStore};
use crate::storage::wal::WalRecord;
use crate::types::{
    Direction, ETypeId, Edge, LabelId, NodeId, PropKeyId, PropValue, Timestamp, TxId,
};

use super::read::ReadCtx;
use super::{checkpoint, GraphDB, SyncMode};

enum Invalidation {
    Node(NodeId),
    Edge(NodeId, ETypeId, NodeId),
    Key(String),
}

#[derive(Clone, Copy)]
enum SchemaKind {
    Label,
    Etype,
    Propkey,
}

/// An open transaction. Mutations require `read_only == false`; `commit`
/// and `rollback` consume the guard, and dropping it uncommitted rolls
/// back.
pub struct Transaction<'db> {
    db: &'db GraphDB,
    txid: TxId,
    start_ts: Timestamp,
    read_only: bool,
    finished: bool,
    pending: DeltaState,
    wal_buf: Vec<u8>,
    writes: FxHashSet<EntityKey>,
    invalidations: Vec<Invalidation>,
    defined_schema: Vec<(SchemaKind, u32)>,
    pending_vector_specs: FxHashMap<PropKeyId, VectorIndexSpec>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db GraphDB, txid: TxId, start_ts: Timestamp, read_only: bool) -> Self {
        Self {
            db,
            txid,
            start_ts,
            read_only,
            finished: false,
            pending: DeltaState::new(),
            wal_buf: Vec::new(),
            writes: FxHashSet::default(),
            invalidations: Vec::new(),
            defined_schema: Vec::new(),
            pending_vector_specs: FxHashMap::default(),
        }
    }

    /// This transaction's id.
    pub fn txid(&self) -> TxId {
        self.txid
    }

    /// Whether this transaction is read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn ctx(&self) -> ReadCtx<'_> {
        ReadCtx {
            pending: Some(&self.pending),
            ts: self.db.inner.mvcc.as_ref().map(|_| (self.txid, self.start_ts)),
        }
    }

    fn require_write(&self) -> Result<()> {
        if self.read_only {
            return Err(GrafitoError::ReadOnly);
        }
        if self.finished {
            return Err(GrafitoError::TransactionMisuse(
                "transaction already finished",
            ));
        }
        Ok(())
    }

    fn log(&mut self, record: &WalRecord) {
        record.encode_frame(&mut self.wal_buf);
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    fn get_or_create_schema(&mut self, kind: SchemaKind, name: &str) -> Result<u32> {
        self.require_write()?;
        if name.is_empty() {
            return Err(GrafitoError::InvalidArgument(
                "schema names must be non-empty".to_string(),
            ));
        }
        let inner = &self.db.inner;
        let mut schema = inner.schema.write();
        let (table, counter) = match kind {
            SchemaKind::Label => (&mut schema.labels, &inner.next_label_id),
            SchemaKind::Etype => (&mut schema.etypes, &inner.next_etype_id),
            SchemaKind::Propkey => (&mut schema.propkeys, &inner.next_propkey_id),
        };
        if let Some(id) = table.id(name) {
            return Ok(id);
        }
        let id = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        table.insert(id, name);
        drop(schema);

        let record = match kind {
            SchemaKind::Label => {
                self.pending.define_label(id, name);
                WalRecord::DefineLabel {
                    id,
                    name: name.to_string(),
                }
            }
            SchemaKind::Etype => {
                self.pending.define_etype(id, name);
                WalRecord::DefineEtype {
                    id,
                    name: name.to_string(),
                }
            }
            SchemaKind::Propkey => {
                self.pending.define_propkey(id, name);
                WalRecord::DefinePropkey {
                    id,
                    name: name.to_string(),
                }
            }
        };
        self.log(&record);
        self.defined_schema.push((kind, id));
        Ok(id)
    }

    /// Returns the label id for `name`, defining it if new.
    pub fn get_or_create_label(&mut self, name: &str) -> Result<LabelId> {
        self.get_or_create_schema(SchemaKind::Label, name)
    }

    /// Returns the edge type id for `name`, defining it if new.
    pub fn get_or_create_etype(&mut self, name: &str) -> Result<ETypeId> {
        self.get_or_create_schema(SchemaKind::Etype, name)
    }

    /// Returns the property key id for `name`, defining it if new.
    pub fn get_or_create_propkey(&mut self, name: &str) -> Result<PropKeyId> {
        self.get_or_create_schema(SchemaKind::Propkey, name)
    }

    // ------------------------------------------------------------------
    // Node mutations
    // ------------------------------------------------------------------

    /// Creates a node, optionally bound to a unique key.
    pub fn create_node(&mut self, key: Option<&str>) -> Result<NodeId> {
        self.require_write()?;
        self.check_key_free(key)?;
        let node = self.db.inner.alloc_node_id();
        self.apply_create(node, key);
        Ok(node)
    }

    /// Creates a node with a caller-chosen id (deterministic imports). The
    /// allocator is bumped past it.
    pub fn create_node_with_id(&mut self, node: NodeId, key: Option<&str>) -> Result<NodeId> {
        self.require_write()?;
        if node == 0 {
            return Err(GrafitoError::InvalidArgument(
                "node id 0 is reserved".to_string(),
            ));
        }
        if self.db.inner.node_exists_ctx(self.ctx(), node) {
            return Err(GrafitoError::InvalidArgument(format!(
                "node {node} already exists"
            )));
        }
        self.check_key_free(key)?;
        self.db.inner.reserve_node_id(node);
        self.apply_create(node, key);
        Ok(node)
    }

    fn check_key_free(&self, key: Option<&str>) -> Result<()> {
        let Some(key) = key else {
            return Ok(());
        };
        if key.is_empty() {
            return Err(GrafitoError::InvalidArgument(
                "node keys must be non-empty".to_string(),
            ));
        }
        if let Some(existing) = self.db.inner.key_lookup_ctx(self.ctx(), key) {
            return Err(GrafitoError::InvalidArgument(format!(
                "key {key:?} already bound to node {existing}"
            )));
        }
        Ok(())
    }

    fn apply_create(&mut self, node: NodeId, key: Option<&str>) {
        self.log(&WalRecord::CreateNode {
            node,
            key: key.map(String::from),
        });
        self.pending.create_node(node, key);
        self.writes.insert(EntityKey::Node(node));
        if let Some(key) = key {
            self.writes.insert(EntityKey::Key(key.to_string()));
            self.invalidations.push(Invalidation::Key(key.to_string()));
        }
    }

    /// Deletes a node. Its key is tombstoned and residual edges are hidden
    /// until the next checkpoint drops them.
    pub fn delete_node(&mut self, node: NodeId) -> Result<()> {
        self.require_write()?;
        if !self.db.inner.node_exists_ctx(self.ctx(), node) {
            return Err(GrafitoError::NotFound("node"));
        }
        let key = self.db.inner.node_key_ctx(self.ctx(), node);
        self.log(&WalRecord::DeleteNode { node });
        self.pending.delete_node(node, key.as_deref());
        // Vector rows die with the node; the tombstones are implicit in the
        // DeleteNode record and re-derived the same way on replay.
        let vector_keys: Vec<PropKeyId> =
            self.db.inner.vectors.read().keys().copied().collect();
        for propkey in vector_keys {
            self.pending.del_vector(node, propkey);
        }
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        if let Some(key) = key {
            self.writes.insert(EntityKey::Key(key.clone()));
            self.invalidations.push(Invalidation::Key(key));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Edge mutations
    // ------------------------------------------------------------------

    /// Adds the edge (src, etype, dst). At most one edge exists per triple;
    /// re-adding is a no-op at read time.
    pub fn add_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) -> Result<()> {
        self.require_write()?;
        if !self.db.inner.etype_defined(etype) {
            return Err(GrafitoError::InvalidArgument(format!(
                "unknown edge type {etype}"
            )));
        }
        if !self.db.inner.node_exists_ctx(self.ctx(), src) {
            return Err(GrafitoError::NotFound("source node"));
        }
        if !self.db.inner.node_exists_ctx(self.ctx(), dst) {
            return Err(GrafitoError::NotFound("destination node"));
        }
        self.log(&WalRecord::AddEdge { src, etype, dst });
        self.pending.add_edge(src, etype, dst);
        self.record_edge_write(src, etype, dst);
        Ok(())
    }

    /// Adds an edge by type name, defining the type if new.
    pub fn add_edge_by_name(&mut self, src: NodeId, etype: &str, dst: NodeId) -> Result<()> {
        let etype = self.get_or_create_etype(etype)?;
        self.add_edge(src, etype, dst)
    }

    /// Deletes the edge (src, etype, dst). Idempotent.
    pub fn delete_edge(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) -> Result<()> {
        self.require_write()?;
        self.log(&WalRecord::DeleteEdge { src, etype, dst });
        self.pending.delete_edge(src, etype, dst);
        self.record_edge_write(src, etype, dst);
        Ok(())
    }

    fn record_edge_write(&mut self, src: NodeId, etype: ETypeId, dst: NodeId) {
        self.writes.insert(EntityKey::Edge(src, etype, dst));
        self.invalidations.push(Invalidation::Edge(src, etype, dst));
    }

    // ------------------------------------------------------------------
    // Properties and labels
    // ------------------------------------------------------------------

    fn check_propkey(&self, key: PropKeyId) -> Result<()> {
        if !self.db.inner.propkey_defined(key) {
            return Err(GrafitoError::InvalidArgument(format!(
                "unknown property key {key}"
            )));
        }
        Ok(())
    }

    /// Sets a node property.
    pub fn set_node_prop(&mut self, node: NodeId, key: PropKeyId, value: PropValue) -> Result<()> {
        self.require_write()?;
        self.check_propkey(key)?;
        if !self.db.inner.node_exists_ctx(self.ctx(), node) {
            return Err(GrafitoError::NotFound("node"));
        }
        self.log(&WalRecord::SetNodeProp {
            node,
            key,
            value: value.clone(),
        });
        self.pending.set_node_prop(node, key, value);
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        Ok(())
    }

    /// Sets a node property by key name, defining the key if new.
    pub fn set_node_prop_by_name(
        &mut self,
        node: NodeId,
        key: &str,
        value: PropValue,
    ) -> Result<()> {
        let key = self.get_or_create_propkey(key)?;
        self.set_node_prop(node, key, value)
    }

    /// Deletes a node property.
    pub fn del_node_prop(&mut self, node: NodeId, key: PropKeyId) -> Result<()> {
        self.require_write()?;
        self.check_propkey(key)?;
        self.log(&WalRecord::DelNodeProp { node, key });
        self.pending.del_node_prop(node, key);
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        Ok(())
    }

    /// Sets an edge property; the edge must exist.
    pub fn set_edge_prop(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
        value: PropValue,
    ) -> Result<()> {
        self.require_write()?;
        self.check_propkey(key)?;
        if !self.db.inner.edge_exists_ctx(self.ctx(), src, etype, dst) {
            return Err(GrafitoError::NotFound("edge"));
        }
        self.log(&WalRecord::SetEdgeProp {
            src,
            etype,
            dst,
            key,
            value: value.clone(),
        });
        self.pending.set_edge_prop(src, etype, dst, key, value);
        self.writes.insert(EntityKey::Edge(src, etype, dst));
        self.invalidations.push(Invalidation::Edge(src, etype, dst));
        Ok(())
    }

    /// Deletes an edge property.
    pub fn del_edge_prop(
        &mut self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Result<()> {
        self.require_write()?;
        self.check_propkey(key)?;
        self.log(&WalRecord::DelEdgeProp {
            src,
            etype,
            dst,
            key,
        });
        self.pending.del_edge_prop(src, etype, dst, key);
        self.writes.insert(EntityKey::Edge(src, etype, dst));
        self.invalidations.push(Invalidation::Edge(src, etype, dst));
        Ok(())
    }

    /// Adds a label to a node.
    pub fn add_node_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.require_write()?;
        if !self.db.inner.label_defined(label) {
            return Err(GrafitoError::InvalidArgument(format!(
                "unknown label {label}"
            )));
        }
        if !self.db.inner.node_exists_ctx(self.ctx(), node) {
            return Err(GrafitoError::NotFound("node"));
        }
        self.log(&WalRecord::AddNodeLabel { node, label });
        self.pending.add_node_label(node, label);
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        Ok(())
    }

    /// Removes a label from a node.
    pub fn remove_node_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.require_write()?;
        self.log(&WalRecord::RemoveNodeLabel { node, label });
        self.pending.remove_node_label(node, label);
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vectors
    // ------------------------------------------------------------------

    /// Creates a vector store for a property key with an explicit
    /// configuration. The dimension is fixed from here on.
    pub fn create_vector_index(&mut self, propkey: PropKeyId, spec: VectorIndexSpec) -> Result<()> {
        self.require_write()?;
        self.check_propkey(propkey)?;
        if spec.dim == 0 {
            return Err(GrafitoError::InvalidArgument(
                "vector dimension must be positive".to_string(),
            ));
        }
        if let Some(store) = self.db.inner.vectors.read().get(&propkey) {
            if store.dim() != spec.dim {
                return Err(GrafitoError::VectorDimensionMismatch {
                    expected: store.dim(),
                    got: spec.dim,
                });
            }
            return Ok(());
        }
        let mut blob = Vec::new();
        spec.encode_into(&mut blob);
        self.log(&WalRecord::CreateVectorIndex {
            propkey,
            spec: blob,
        });
        self.pending_vector_specs.insert(propkey, spec);
        Ok(())
    }

    /// Sets a node's vector under a property key. The first vector written
    /// to a key fixes that key's dimension.
    pub fn set_node_vector(&mut self, node: NodeId, key: PropKeyId, vector: &[f32]) -> Result<()> {
        self.require_write()?;
        self.check_propkey(key)?;
        if !self.db.inner.node_exists_ctx(self.ctx(), node) {
            return Err(GrafitoError::NotFound("node"));
        }
        if vector.is_empty() {
            return Err(GrafitoError::InvalidArgument(
                "vectors must be non-empty".to_string(),
            ));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(GrafitoError::InvalidArgument(
                "vector contains non-finite values".to_string(),
            ));
        }
        let expected = self
            .db
            .inner
            .vectors
            .read()
            .get(&key)
            .map(|s| s.dim())
            .or_else(|| self.pending_vector_specs.get(&key).map(|s| s.dim))
            .or_else(|| {
                self.pending
                    .pending_vectors
                    .iter()
                    .find(|((_, k), v)| *k == key && v.is_some())
                    .and_then(|(_, v)| v.as_ref().map(|v| v.len()))
            });
        if let Some(expected) = expected {
            if expected != vector.len() {
                return Err(GrafitoError::VectorDimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }
        self.log(&WalRecord::SetNodeVector {
            node,
            key,
            vector: vector.to_vec(),
        });
        self.pending.set_vector(node, key, Arc::new(vector.to_vec()));
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        Ok(())
    }

    /// Deletes a node's vector. Idempotent.
    pub fn del_node_vector(&mut self, node: NodeId, key: PropKeyId) -> Result<()> {
        self.require_write()?;
        self.log(&WalRecord::DelNodeVector { node, key });
        self.pending.del_vector(node, key);
        self.writes.insert(EntityKey::Node(node));
        self.invalidations.push(Invalidation::Node(node));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads (pending-aware)
    // ------------------------------------------------------------------

    /// Key lookup through this transaction's view.
    pub fn node_by_key(&self, key: &str) -> Option<NodeId> {
        self.db.inner.key_lookup_ctx(self.ctx(), key)
    }

    /// Node existence through this transaction's view.
    pub fn node_exists(&self, node: NodeId) -> bool {
        self.db.inner.node_exists_ctx(self.ctx(), node)
    }

    /// Edge existence through this transaction's view.
    pub fn edge_exists(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> bool {
        self.db.inner.edge_exists_ctx(self.ctx(), src, etype, dst)
    }

    /// Node property through this transaction's view.
    pub fn node_prop(&self, node: NodeId, key: PropKeyId) -> Option<PropValue> {
        self.db.inner.node_prop_ctx(self.ctx(), node, key)
    }

    /// All node properties through this transaction's view.
    pub fn node_props(&self, node: NodeId) -> Vec<(PropKeyId, PropValue)> {
        self.db.inner.node_props_ctx(self.ctx(), node)
    }

    /// Node labels through this transaction's view.
    pub fn node_labels(&self, node: NodeId) -> Vec<LabelId> {
        self.db.inner.node_labels_ctx(self.ctx(), node)
    }

    /// Edge property through this transaction's view.
    pub fn edge_prop(
        &self,
        src: NodeId,
        etype: ETypeId,
        dst: NodeId,
        key: PropKeyId,
    ) -> Option<PropValue> {
        self.db.inner.edge_prop_ctx(self.ctx(), src, etype, dst, key)
    }

    /// All edge properties through this transaction's view.
    pub fn edge_props(&self, src: NodeId, etype: ETypeId, dst: NodeId) -> Vec<(PropKeyId, PropValue)> {
        self.db.inner.edge_props_ctx(self.ctx(), src, etype, dst)
    }

    /// Neighbors through this transaction's view, sorted by (etype, other).
    pub fn neighbors(
        &self,
        node: NodeId,
        direction: Direction,
        etype: Option<ETypeId>,
    ) -> Vec<Edge> {
        self.db.inner.neighbors_ctx(self.ctx(), node, direction, etype)
    }

    /// A node's vector through this transaction's view.
    pub fn node_vector(&self, node: NodeId, key: PropKeyId) -> Option<Vec<f32>> {
        if self.pending.is_node_deleted(node) {
            return None;
        }
        if let Some(op) = self.pending.pending_vectors.get(&(node, key)) {
            return op.as_ref().map(|v| v.as_ref().clone());
        }
        self.db.node_vector(node, key)
    }

    // ------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------

    /// Commits: WAL append + durability per sync mode, then visibility.
    pub fn commit(mut self) -> Result<()> {
        if self.read_only {
            self.finish_readonly();
            return Ok(());
        }
        self.finished = true;
        let inner = Arc::clone(&self.db.inner);

        // Close the frame batch.
        let mut batch = std::mem::take(&mut self.wal_buf);
        if batch.is_empty() && self.writes.is_empty() {
            if let Some(mvcc) = inner.mvcc.as_ref() {
                mvcc.tx.lock().abort(self.txid);
            }
            return Ok(());
        }
        WalRecord::Commit { txid: self.txid }.encode_frame(&mut batch);

        // Make room before entering the critical section.
        if !inner.wal.lock().fits(batch.len() as u64) && inner.options.auto_checkpoint {
            if let Err(err) = checkpoint::run_checkpoint(&inner) {
                if let Some(mvcc) = inner.mvcc.as_ref() {
                    mvcc.tx.lock().abort(self.txid);
                }
                self.rollback_schema();
                return Err(err);
            }
        }

        let mut pending = std::mem::take(&mut self.pending);
        let writes = std::mem::take(&mut self.writes);

        {
            let _commit = inner.commit_lock.lock();

            if !inner.wal.lock().fits(batch.len() as u64) {
                let available = inner.wal.lock().available();
                if let Some(mvcc) = inner.mvcc.as_ref() {
                    mvcc.tx.lock().abort(self.txid);
                }
                self.rollback_schema();
                return Err(GrafitoError::WalFull {
                    needed: batch.len() as u64,
                    available,
                });
            }

            // First-committer-wins validation, then the commit timestamp.
            let commit_ts = match inner.mvcc.as_ref() {
                Some(mvcc) => {
                    let mut tx = mvcc.tx.lock();
                    match tx.commit(self.txid, &writes) {
                        Ok(ts) => Some((ts, tx.active_count() > 0)),
                        Err(err) => {
                            drop(tx);
                            self.rollback_schema();
                            return Err(err);
                        }
                    }
                }
                None => None,
            };

            // Append and persist.
            {
                let mut file = inner.file.lock();
                let mut wal = inner.wal.lock();
                wal.append(&mut file, &batch)?;
            }
            if inner.options.sync_mode != SyncMode::Off {
                inner.persist_header(inner.options.sync_mode == SyncMode::Full)?;
            }

            // Publish versions for concurrent readers before the delta
            // changes under them.
            if let Some((ts, true)) = commit_ts {
                publish_versions(&inner, &pending, self.txid, ts);
            }

            // Vector intents reach the stores at visibility time.
            let sealed = apply_vector_ops(
                &inner,
                std::mem::take(&mut self.pending_vector_specs),
                &pending,
            )?;
            if !sealed.is_empty() {
                let mut seal_batch = Vec::new();
                for (propkey, fragment) in sealed {
                    WalRecord::SealFragment { propkey, fragment }.encode_frame(&mut seal_batch);
                }
                WalRecord::Commit { txid: self.txid }.encode_frame(&mut seal_batch);
                let mut file = inner.file.lock();
                let mut wal = inner.wal.lock();
                if let Err(err) = wal.append(&mut file, &seal_batch) {
                    warn!(error = %err, "wal.seal_record.dropped");
                }
            }

            // Vector intents are fully applied; the delta only carries the
            // graph-side changes forward.
            pending.pending_vectors.clear();
            inner.delta.write().live.merge(pending);
        }

        // Targeted cache invalidation outside the commit lock.
        if let Some(cache) = inner.cache.as_ref() {
            let mut cache = cache.lock();
            for invalidation in self.invalidations.drain(..) {
                match invalidation {
                    Invalidation::Node(node) => cache.invalidate_node(node),
                    Invalidation::Edge(src, etype, dst) => {
                        cache.invalidate_edge(src, etype, dst)
                    }
                    Invalidation::Key(key) => cache.invalidate_key(&key),
                }
            }
        }

        // Opportunistic MVCC housekeeping.
        if let Some(mvcc) = inner.mvcc.as_ref() {
            let min_active = {
                let mut tx = mvcc.tx.lock();
                tx.prune_committed();
                tx.min_active_ts()
            };
            mvcc.versions.lock().gc(min_active);
        }

        debug!(txid = self.txid, "tx.commit");

        // Auto-checkpoint after all locks are released.
        if inner.options.auto_checkpoint
            && checkpoint::should_checkpoint(&inner, inner.options.checkpoint_threshold)
        {
            if inner.options.background_checkpoint {
                inner.request_background_checkpoint();
            } else if let Err(err) = checkpoint::run_checkpoint(&inner) {
                warn!(error = %err, "checkpoint.auto.failed");
            }
        }
        Ok(())
    }

    /// Discards every buffered mutation.
    pub fn rollback(mut self) -> Result<()> {
        self.abort();
        Ok(())
    }

    fn finish_readonly(&mut self) {
        self.finished = true;
        if let Some(mvcc) = self.db.inner.mvcc.as_ref() {
            mvcc.tx.lock().abort(self.txid);
        }
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(mvcc) = self.db.inner.mvcc.as_ref() {
            mvcc.tx.lock().abort(self.txid);
        }
        self.rollback_schema();
        debug!(txid = self.txid, "tx.rollback");
    }

    fn rollback_schema(&mut self) {
        if self.defined_schema.is_empty() {
            return;
        }
        let mut schema = self.db.inner.schema.write();
        for (kind, id) in self.defined_schema.drain(..) {
            match kind {
                SchemaKind::Label => schema.labels.remove(id),
                SchemaKind::Etype => schema.etypes.remove(id),
                SchemaKind::Propkey => schema.propkeys.remove(id),
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Seeds base versions and links the committed values for every entity the
/// transaction wrote, so active readers keep seeing their snapshot.
fn publish_versions(
    inner: &Arc<super::DbInner>,
    pending: &DeltaState,
    txid: TxId,
    commit_ts: Timestamp,
) {
    let ctx = ReadCtx::default();
    let mvcc = inner.mvcc.as_ref().expect("publish requires mvcc");

    // Precompute pre-commit values with committed reads before touching the
    // version store.
    let mut node_creates: Vec<NodeId> = pending.created_nodes.keys().copied().collect();
    node_creates.sort_unstable();
    let node_deletes: Vec<NodeId> = pending.deleted_nodes.iter().copied().collect();

    let mut edge_ops: Vec<((NodeId, ETypeId, NodeId), bool, bool)> = Vec::new();
    for (&src, patches) in &pending.out_add {
        for p in patches {
            let old = inner.edge_exists_ctx(ctx, src, p.etype, p.other);
            edge_ops.push(((src, p.etype, p.other), true, old));
        }
    }
    for (&src, patches) in &pending.out_del {
        for p in patches {
            let old = inner.edge_exists_ctx(ctx, src, p.etype, p.other);
            edge_ops.push(((src, p.etype, p.other), false, old));
        }
    }

    let mut node_props: Vec<(NodeId, PropKeyId, Option<PropValue>, Option<PropValue>)> = Vec::new();
    for (&node, patch) in pending.created_nodes.iter().chain(&pending.modified_nodes) {
        for (&key, value) in &patch.props {
            let old = inner.node_prop_ctx(ctx, node, key);
            node_props.push((node, key, value.clone(), old));
        }
    }

    let mut edge_props: Vec<(
        (NodeId, ETypeId, NodeId),
        PropKeyId,
        Option<PropValue>,
        Option<PropValue>,
    )> = Vec::new();
    for (&(src, etype, dst), props) in &pending.edge_props {
        for (&key, value) in props {
            let old = inner.edge_prop_ctx(ctx, src, etype, dst, key);
            edge_props.push(((src, etype, dst), key, value.clone(), old));
        }
    }

    let mut key_ops: Vec<(String, Option<NodeId>, Option<NodeId>)> = Vec::new();
    for key in &pending.key_index_deleted {
        if pending.key_index.contains_key(key) {
            continue;
        }
        let old = inner.key_lookup_ctx(ctx, key);
        key_ops.push((key.clone(), None, old));
    }
    for (key, &node) in &pending.key_index {
        let old = inner.key_lookup_ctx(ctx, key);
        key_ops.push((key.clone(), Some(node), old));
    }

    let mut versions = mvcc.versions.lock();
    for node in node_creates {
        versions.publish_node(node, true, txid, commit_ts, || false);
    }
    for node in node_deletes {
        versions.publish_node(node, false, txid, commit_ts, || true);
    }
    for ((src, etype, dst), exists, old) in edge_ops {
        versions.publish_edge(src, etype, dst, exists, txid, commit_ts, move || old);
    }
    for (node, key, value, old) in node_props {
        versions.publish_node_prop(node, key, value, txid, commit_ts, move || old);
    }
    for ((src, etype, dst), key, value, old) in edge_props {
        versions.publish_edge_prop(src, etype, dst, key, value, txid, commit_ts, move || old);
    }
    for (key, value, old) in key_ops {
        versions.publish_key(&key, value, txid, commit_ts, move || old);
    }
}

/// Applies pending vector intents to the stores, creating stores on first
/// use. Returns the fragments sealed by these inserts.
fn apply_vector_ops(
    inner: &Arc<super::DbInner>,
    specs: FxHashMap<PropKeyId, VectorIndexSpec>,
    pending: &DeltaState,
) -> Result<Vec<(PropKeyId, u32)>> {
    let mut sealed = Vec::new();
    if specs.is_empty() && pending.pending_vectors.is_empty() {
        return Ok(sealed);
    }
    let mut stores = inner.vectors.write();
    for (propkey, spec) in specs {
        stores.entry(propkey).or_insert_with(|| VectorStore::new(spec));
    }
    let mut ops: Vec<(&(NodeId, PropKeyId), &Option<Arc<Vec<f32>>>)> =
        pending.pending_vectors.iter().collect();
    ops.sort_by_key(|((node, key), _)| (*key, *node));
    for (&(node, key), op) in ops {
        match op {
            Some(vector) => {
                let store = stores
                    .entry(key)
                    .or_insert_with(|| VectorStore::new(VectorIndexSpec::new(vector.len())));
                if let Some(fragment) = store.insert(node, vector)? {
                    sealed.push((key, fragment));
                }
            }
            None => {
                if let Some(store) = stores.get_mut(&key) {
                    store.delete(node);
                }
            }
        }
    }
    Ok(sealed)
}
