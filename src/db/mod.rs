//! The database handle: open/recovery, schema registry, transactions,
//! reads, maintenance, and stats.

mod checkpoint;
mod config;
mod read;
mod transaction;
mod vector;

pub use checkpoint::CheckpointStats;
pub use config::{CacheOptions, Options, SyncMode};
pub use transaction::Transaction;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::error::{GrafitoError, Result};
use crate::storage::cache::{CacheManager, CacheStats};
use crate::storage::delta::{DeltaState, OverlayView};
use crate::storage::header::{ContainerFile, Header};
use crate::storage::mvcc::{TxManager, VersionStore};
use crate::storage::snapshot::Snapshot;
use crate::storage::vstore::{VectorIndexSpec, VectorStore};
use crate::storage::wal::{Wal, WalRecord};
use crate::types::{DbStats, ETypeId, LabelId, MvccStats, NodeId, PropKeyId};

/// Minimum WAL area accepted at open.
const MIN_WAL_SIZE: u64 = 16 * 1024;

#[derive(Default)]
pub(crate) struct NameTable {
    by_name: FxHashMap<String, u32>,
    by_id: FxHashMap<u32, String>,
}

impl NameTable {
    pub(crate) fn insert(&mut self, id: u32, name: &str) {
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
    }

    pub(crate) fn remove(&mut self, id: u32) {
        if let Some(name) = self.by_id.remove(&id) {
            self.by_name.remove(&name);
        }
    }

    pub(crate) fn id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn name(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(|s| s.as_str())
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (u32, &str)> {
        self.by_id.iter().map(|(&id, name)| (id, name.as_str()))
    }
}

/// Append-only id <-> name registries for labels, edge types, property keys.
#[derive(Default)]
pub(crate) struct SchemaRegistry {
    pub(crate) labels: NameTable,
    pub(crate) etypes: NameTable,
    pub(crate) propkeys: NameTable,
}

/// The live delta plus the frozen layer a running checkpoint is folding.
#[derive(Default)]
pub(crate) struct DeltaLayers {
    pub(crate) frozen: Option<DeltaState>,
    pub(crate) live: DeltaState,
}

impl DeltaLayers {
    pub(crate) fn view(&self) -> OverlayView<'_> {
        OverlayView::new(self.frozen.as_ref(), &self.live)
    }
}

pub(crate) struct MvccState {
    pub(crate) tx: Mutex<TxManager>,
    pub(crate) versions: Mutex<VersionStore>,
}

pub(crate) enum WorkerMsg {
    Checkpoint,
    Shutdown,
}

pub(crate) struct WorkerHandle {
    pub(crate) sender: mpsc::Sender<WorkerMsg>,
    join: Option<std::thread::JoinHandle<()>>,
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) options: Options,
    pub(crate) file: Mutex<ContainerFile>,
    pub(crate) header: Mutex<Header>,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) snapshot: RwLock<Option<Arc<Snapshot>>>,
    pub(crate) delta: RwLock<DeltaLayers>,
    pub(crate) schema: RwLock<SchemaRegistry>,
    pub(crate) next_node_id: AtomicU64,
    pub(crate) next_label_id: AtomicU32,
    pub(crate) next_etype_id: AtomicU32,
    pub(crate) next_propkey_id: AtomicU32,
    pub(crate) mvcc: Option<MvccState>,
    /// Serializes commits: WAL append order defines commit order.
    pub(crate) commit_lock: Mutex<()>,
    /// At most one checkpoint at a time.
    pub(crate) checkpoint_lock: Mutex<()>,
    pub(crate) cache: Option<Mutex<CacheManager>>,
    pub(crate) vectors: RwLock<FxHashMap<PropKeyId, VectorStore>>,
    pub(crate) worker: Mutex<Option<WorkerHandle>>,
}

impl DbInner {
    pub(crate) fn alloc_node_id(&self) -> NodeId {
        self.next_node_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn reserve_node_id(&self, node: NodeId) {
        let desired = node.saturating_add(1);
        self.next_node_id.fetch_max(desired, Ordering::SeqCst);
    }

    pub(crate) fn label_defined(&self, id: LabelId) -> bool {
        id >= 1 && id < self.next_label_id.load(Ordering::SeqCst)
    }

    pub(crate) fn etype_defined(&self, id: ETypeId) -> bool {
        id >= 1 && id < self.next_etype_id.load(Ordering::SeqCst)
    }

    pub(crate) fn propkey_defined(&self, id: PropKeyId) -> bool {
        id >= 1 && id < self.next_propkey_id.load(Ordering::SeqCst)
    }

    /// Applies one replayed WAL record to the recovery state.
    fn replay_record(&self, record: WalRecord) -> Result<()> {
        let mut delta = self.delta.write();
        match record {
            WalRecord::CreateNode { node, key } => {
                self.reserve_node_id(node);
                delta.live.create_node(node, key.as_deref());
            }
            WalRecord::DeleteNode { node } => {
                // Resolve the node's key before the tombstone hides it.
                let key = match OverlayView::new(delta.frozen.as_ref(), &delta.live)
                    .created_node_key(node)
                {
                    Some(key) => key.map(|s| s.to_string()),
                    None => {
                        let snapshot = self.snapshot.read();
                        snapshot.as_deref().and_then(|s| {
                            s.phys_node(node)
                                .and_then(|phys| s.node_key(phys).map(|k| k.to_string()))
                        })
                    }
                };
                delta.live.delete_node(node, key.as_deref());
                drop(delta);
                for store in self.vectors.write().values_mut() {
                    store.delete(node);
                }
            }
            WalRecord::AddEdge { src, etype, dst } => delta.live.add_edge(src, etype, dst),
            WalRecord::DeleteEdge { src, etype, dst } => delta.live.delete_edge(src, etype, dst),
            WalRecord::DefineLabel { id, name } => {
                self.next_label_id.fetch_max(id + 1, Ordering::SeqCst);
                self.schema.write().labels.insert(id, &name);
                delta.live.define_label(id, &name);
            }
            WalRecord::DefineEtype { id, name } => {
                self.next_etype_id.fetch_max(id + 1, Ordering::SeqCst);
                self.schema.write().etypes.insert(id, &name);
                delta.live.define_etype(id, &name);
            }
            WalRecord::DefinePropkey { id, name } => {
                self.next_propkey_id.fetch_max(id + 1, Ordering::SeqCst);
                self.schema.write().propkeys.insert(id, &name);
                delta.live.define_propkey(id, &name);
            }
            WalRecord::SetNodeProp { node, key, value } => delta.live.set_node_prop(node, key, value),
            WalRecord::DelNodeProp { node, key } => delta.live.del_node_prop(node, key),
            WalRecord::SetEdgeProp {
                src,
                etype,
                dst,
                key,
                value,
            } => delta.live.set_edge_prop(src, etype, dst, key, value),
            WalRecord::DelEdgeProp {
                src,
                etype,
                dst,
                key,
            } => delta.live.del_edge_prop(src, etype, dst, key),
            WalRecord::AddNodeLabel { node, label } => delta.live.add_node_label(node, label),
            WalRecord::RemoveNodeLabel { node, label } => delta.live.remove_node_label(node, label),
            WalRecord::SetNodeVector { node, key, vector } => {
                drop(delta);
                let mut stores = self.vectors.write();
                let store = stores
                    .entry(key)
                    .or_insert_with(|| VectorStore::new(VectorIndexSpec::new(vector.len())));
                store.insert(node, &vector)?;
            }
            WalRecord::DelNodeVector { node, key } => {
                drop(delta);
                if let Some(store) = self.vectors.write().get_mut(&key) {
                    store.delete(node);
                }
            }
            WalRecord::CreateVectorIndex { propkey, spec } => {
                drop(delta);
                let mut cur = crate::primitives::bytes::Cursor::new(&spec);
                let spec = VectorIndexSpec::decode_from(&mut cur)?;
                self.vectors
                    .write()
                    .entry(propkey)
                    .or_insert_with(|| VectorStore::new(spec));
            }
            WalRecord::SealFragment { propkey, fragment } => {
                drop(delta);
                if let Some(store) = self.vectors.write().get_mut(&propkey) {
                    store.seal_fragment(fragment);
                }
            }
            WalRecord::CompactFragments { propkey } => {
                drop(delta);
                if let Some(store) = self.vectors.write().get_mut(&propkey) {
                    store.compact()?;
                }
            }
            WalRecord::Commit { .. } => {}
        }
        Ok(())
    }

    /// Writes the current header fields (WAL state, counters) back to disk
    /// per the configured sync mode. Caller holds the commit lock.
    pub(crate) fn persist_header(&self, full_sync: bool) -> Result<()> {
        let header = {
            let wal = self.wal.lock();
            let mut header = self.header.lock();
            header.wal = wal.regions;
            header.active_wal_region = wal.active;
            header.next_node_id = self.next_node_id.load(Ordering::SeqCst);
            header.next_label_id = self.next_label_id.load(Ordering::SeqCst);
            header.next_etype_id = self.next_etype_id.load(Ordering::SeqCst);
            header.next_propkey_id = self.next_propkey_id.load(Ordering::SeqCst);
            header.clone()
        };
        let mut file = self.file.lock();
        file.write_header(&header)?;
        if full_sync {
            file.sync()?;
        }
        Ok(())
    }

    pub(crate) fn request_background_checkpoint(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.sender.send(WorkerMsg::Checkpoint);
        }
    }
}

/// An open container: the public handle. Cheap to clone; all clones share
/// one engine.
#[derive(Clone)]
pub struct GraphDB {
    pub(crate) inner: Arc<DbInner>,
}

impl GraphDB {
    /// Opens (or creates) a container file.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<GraphDB> {
        let path = path.as_ref();
        if !options.page_size.is_power_of_two() || options.page_size < 512 {
            return Err(GrafitoError::InvalidArgument(format!(
                "page size {} must be a power of two of at least 512",
                options.page_size
            )));
        }
        if options.wal_size < MIN_WAL_SIZE {
            return Err(GrafitoError::InvalidArgument(format!(
                "WAL size {} below the {MIN_WAL_SIZE} byte minimum",
                options.wal_size
            )));
        }

        let exists = path.exists();
        if !exists && !options.create_if_missing {
            return Err(GrafitoError::NotFound("database file"));
        }
        if !exists && options.read_only {
            return Err(GrafitoError::ReadOnly);
        }

        let (mut file, header) = if exists {
            let mut file = ContainerFile::open(path, options.read_only)?;
            let header = file.read_header()?;
            (file, header)
        } else {
            let mut file = ContainerFile::create(path)?;
            let header = Header::new(options.page_size, options.wal_size);
            file.write_header(&header)?;
            file.set_len(header.wal_end())?;
            file.sync()?;
            (file, header)
        };

        // Load the active snapshot region into a shared immutable buffer.
        let snapshot = if header.snapshot_len > 0 {
            let mut buf = vec![0u8; header.snapshot_len as usize];
            file.read_at(header.snapshot_offset, &mut buf)?;
            Some(Arc::new(Snapshot::parse(bytes::Bytes::from(buf))?))
        } else {
            None
        };

        let mut schema = SchemaRegistry::default();
        let mut vectors = FxHashMap::default();
        if let Some(snap) = snapshot.as_deref() {
            for id in 1..=snap.header.num_labels {
                if let Some(name) = snap.label_name(id) {
                    schema.labels.insert(id, name);
                }
            }
            for id in 1..=snap.header.num_etypes {
                if let Some(name) = snap.etype_name(id) {
                    schema.etypes.insert(id, name);
                }
            }
            for id in 1..=snap.header.num_propkeys {
                if let Some(name) = snap.propkey_name(id) {
                    schema.propkeys.insert(id, name);
                }
            }
            for (propkey, blob) in snap.vector_manifests()? {
                vectors.insert(propkey, VectorStore::decode(blob)?);
            }
        }

        let wal = Wal::from_header(header.wal, header.active_wal_region);
        let inner = Arc::new(DbInner {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            header: Mutex::new(header.clone()),
            wal: Mutex::new(wal),
            snapshot: RwLock::new(snapshot),
            delta: RwLock::new(DeltaLayers::default()),
            schema: RwLock::new(schema),
            next_node_id: AtomicU64::new(header.next_node_id),
            next_label_id: AtomicU32::new(header.next_label_id),
            next_etype_id: AtomicU32::new(header.next_etype_id),
            next_propkey_id: AtomicU32::new(header.next_propkey_id),
            mvcc: options.mvcc.then(|| MvccState {
                tx: Mutex::new(TxManager::new(1)),
                versions: Mutex::new(VersionStore::default()),
            }),
            commit_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            cache: options
                .cache
                .clone()
                .map(|opts| Mutex::new(CacheManager::new(opts))),
            vectors: RwLock::new(vectors),
            worker: Mutex::new(None),
            options,
        });

        // Replay the WAL: the inactive region first (it is older when
        // non-empty, left behind by a checkpoint that never flipped), then
        // the active region.
        let mut replayed = 0usize;
        {
            let header = inner.header.lock().clone();
            let inactive = 1 - header.active_wal_region;
            for region_idx in [inactive, header.active_wal_region] {
                let region = header.wal[region_idx as usize];
                if region.used() == 0 {
                    continue;
                }
                let (transactions, durable_len) = {
                    let mut file = inner.file.lock();
                    Wal::replay_region(&mut file, &region)?
                };
                for records in transactions {
                    for record in records {
                        inner.replay_record(record)?;
                        replayed += 1;
                    }
                }
                // Rewind past a discarded tail so new appends overwrite it.
                if durable_len < region.used() {
                    let mut wal = inner.wal.lock();
                    let r = &mut wal.regions[region_idx as usize];
                    r.tail = r.head + durable_len;
                }
            }
        }
        if replayed > 0 {
            info!(records = replayed, "wal.replay.complete");
        }

        // A crash mid-checkpoint can leave both regions populated. Fold
        // everything now so the next region switch finds its target empty.
        if !inner.options.read_only {
            let both_used = {
                let wal = inner.wal.lock();
                wal.regions.iter().all(|r| r.used() > 0)
            };
            if both_used {
                warn!("wal.recovery.checkpoint: both regions populated after crash");
                checkpoint::recovery_checkpoint(&inner)?;
            }
        }

        if inner.options.background_checkpoint && !inner.options.read_only {
            let weak: Weak<DbInner> = Arc::downgrade(&inner);
            let (sender, receiver) = mpsc::channel::<WorkerMsg>();
            let join = std::thread::Builder::new()
                .name("grafito-checkpoint".to_string())
                .spawn(move || {
                    while let Ok(WorkerMsg::Checkpoint) = receiver.recv() {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        if let Err(err) = checkpoint::run_checkpoint(&inner) {
                            warn!(error = %err, "checkpoint.background.failed");
                        }
                    }
                })
                .map_err(std::io::Error::from)?;
            *inner.worker.lock() = Some(WorkerHandle {
                sender,
                join: Some(join),
            });
        }

        info!(
            path = %inner.path.display(),
            generation = inner.header.lock().snapshot_gen,
            "db.open"
        );
        Ok(GraphDB { inner })
    }

    /// Path the container was opened from.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether this handle is read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    /// Begins a transaction. Any number of read transactions may be open;
    /// write transactions validate first-committer-wins at commit.
    pub fn begin(&self, read_only: bool) -> Result<Transaction<'_>> {
        if self.inner.options.read_only && !read_only {
            return Err(GrafitoError::ReadOnly);
        }
        let (txid, start_ts) = match self.inner.mvcc.as_ref() {
            Some(mvcc) => mvcc.tx.lock().begin(),
            None => (0, 0),
        };
        Ok(Transaction::new(self, txid, start_ts, read_only))
    }

    // ------------------------------------------------------------------
    // Schema lookups (read-only; definitions happen inside transactions)
    // ------------------------------------------------------------------

    /// Label id by name.
    pub fn label_id(&self, name: &str) -> Option<LabelId> {
        self.inner.schema.read().labels.id(name)
    }

    /// Label name by id.
    pub fn label_name(&self, id: LabelId) -> Option<String> {
        self.inner.schema.read().labels.name(id).map(String::from)
    }

    /// Edge type id by name.
    pub fn etype_id(&self, name: &str) -> Option<ETypeId> {
        self.inner.schema.read().etypes.id(name)
    }

    /// Edge type name by id.
    pub fn etype_name(&self, id: ETypeId) -> Option<String> {
        self.inner.schema.read().etypes.name(id).map(String::from)
    }

    /// Property key id by name.
    pub fn propkey_id(&self, name: &str) -> Option<PropKeyId> {
        self.inner.schema.read().propkeys.id(name)
    }

    /// Property key name by id.
    pub fn propkey_name(&self, id: PropKeyId) -> Option<String> {
        self.inner.schema.read().propkeys.name(id).map(String::from)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Point-in-time engine statistics.
    pub fn stats(&self) -> DbStats {
        // Computed first: it takes the same locks this method holds below.
        let recommend_compact = checkpoint::should_checkpoint(&self.inner, 0.8);
        let header = self.inner.header.lock().clone();
        let delta = self.inner.delta.read();
        let snapshot = self.inner.snapshot.read();
        let (snapshot_nodes, snapshot_edges, snapshot_max_node_id) = snapshot
            .as_deref()
            .map(|s| (s.header.num_nodes, s.header.num_edges, s.header.max_node_id))
            .unwrap_or((0, 0, 0));
        let wal_bytes = self.inner.wal.lock().used();
        let frozen = delta.frozen.as_ref();
        let live = &delta.live;
        let count = |f: fn(&DeltaState) -> usize| {
            f(live) + frozen.map(f).unwrap_or(0)
        };
        DbStats {
            snapshot_gen: header.snapshot_gen,
            snapshot_nodes,
            snapshot_edges,
            snapshot_max_node_id,
            delta_nodes_created: count(|d| d.created_nodes.len()),
            delta_nodes_deleted: count(|d| d.deleted_nodes.len()),
            delta_edges_added: count(DeltaState::total_edges_added),
            delta_edges_deleted: count(DeltaState::total_edges_deleted),
            wal_bytes,
            recommend_compact,
            mvcc: self.inner.mvcc.as_ref().map(|mvcc| {
                let tx = mvcc.tx.lock();
                let gc = mvcc.versions.lock().stats();
                MvccStats {
                    active_transactions: tx.active_count(),
                    min_active_ts: tx.min_active_ts(),
                    versions_pruned: gc.versions_pruned,
                    gc_runs: gc.gc_runs,
                    last_gc_unix_ms: gc.last_gc_unix_ms,
                }
            }),
        }
    }

    /// Cache statistics, when caching is enabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.cache.as_ref().map(|c| c.lock().stats())
    }

    /// Resets cache hit/miss counters.
    pub fn cache_reset_stats(&self) {
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().reset_stats();
        }
    }

    /// Clears every cache.
    pub fn cache_clear(&self) {
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().clear();
        }
    }

    /// Clears only the query cache.
    pub fn cache_clear_query(&self) {
        if let Some(cache) = self.inner.cache.as_ref() {
            cache.lock().clear_query();
        }
    }

    /// Flushes state and closes the container. Outstanding clones of the
    /// handle keep the engine alive; this only guarantees the final header
    /// write happened.
    pub fn close(self) -> Result<()> {
        self.shutdown_worker();
        if !self.inner.options.read_only {
            let _commit = self.inner.commit_lock.lock();
            self.inner.persist_header(true)?;
        }
        debug!(path = %self.inner.path.display(), "db.close");
        Ok(())
    }

    fn shutdown_worker(&self) {
        let mut guard = self.inner.worker.lock();
        if let Some(worker) = guard.as_mut() {
            let _ = worker.sender.send(WorkerMsg::Shutdown);
            if let Some(join) = worker.join.take() {
                drop(guard);
                let _ = join.join();
                return;
            }
        }
    }

}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.sender.send(WorkerMsg::Shutdown);
            if let Some(join) = worker.join {
                // The final handle can be dropped from the worker itself.
                if join.thread().id() != std::thread::current().id() {
                    let _ = join.join();
                }
            }
        }
        if !self.options.read_only {
            // Best-effort final header flush.
            let header = self.header.get_mut().clone();
            let _ = self.file.get_mut().write_header(&header);
            let _ = self.file.get_mut().sync();
        }
    }
}
