//! Checkpointing: fold snapshot + frozen delta into a new snapshot, flip
//! the header, truncate the WAL.
//!
//! Writers are blocked only twice, briefly: to switch the active WAL region
//! (moving the live delta behind a frozen layer) and to flip the header
//! after the new snapshot bytes are durable. In between, commits continue
//! against the other region and reads merge live-over-frozen-over-snapshot.
//!
//! A failed checkpoint leaves the frozen layer and region in place; the
//! next attempt resumes from them. Crash before the flip keeps the old
//! header authoritative and both WAL regions replayable.
//!
//! Snapshot placement ping-pongs between the gap right after the WAL area
//! and the space after the live snapshot, so the file stays bounded near
//! header + WAL + two snapshots; the flip is followed by a truncate to the
//! end of live data.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{GrafitoError, Result};
use crate::storage::delta::{DeltaState, OverlayView};
use crate::storage::snapshot::{build_snapshot, EdgeData, NodeData, Snapshot, SnapshotInput};
use crate::storage::wal::WalRecord;
use crate::types::{NodeId, PropValue};

use super::{DbInner, GraphDB};

/// Outcome of one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStats {
    /// Generation of the snapshot produced.
    pub generation: u64,
    /// Nodes in the new snapshot.
    pub num_nodes: u64,
    /// Edges in the new snapshot.
    pub num_edges: u64,
    /// Wall time spent.
    pub duration_ms: u64,
}

/// Whether checkpoint heuristics trip at the given WAL usage threshold:
/// active-region fill, or delta churn above 10% of the snapshot.
pub(crate) fn should_checkpoint(inner: &DbInner, threshold: f64) -> bool {
    if inner.wal.lock().usage() >= threshold {
        return true;
    }
    let (snap_nodes, snap_edges) = {
        let snapshot = inner.snapshot.read();
        match snapshot.as_deref() {
            Some(snap) => (snap.header.num_nodes, snap.header.num_edges),
            None => return false,
        }
    };
    let delta = inner.delta.read();
    let layers = [Some(&delta.live), delta.frozen.as_ref()];
    let count = |f: fn(&DeltaState) -> usize| -> usize {
        layers.iter().flatten().map(|d| f(d)).sum()
    };
    let node_changes = count(|d| d.created_nodes.len() + d.deleted_nodes.len());
    let edge_changes = count(|d| d.total_edges_added() + d.total_edges_deleted());
    (snap_nodes > 0 && node_changes as u64 > snap_nodes / 10)
        || (snap_edges > 0 && edge_changes as u64 > snap_edges / 10)
}

/// Merges the snapshot and the frozen delta into writer input. Live-delta
/// changes are excluded: their WAL records sit in the region that stays
/// active and replay onto the new snapshot.
fn gather(inner: &DbInner, frozen: &DeltaState) -> Result<SnapshotInput> {
    let snapshot = inner.snapshot.read();
    let snap = snapshot.as_deref();
    let view = OverlayView::new(None, frozen);

    let mut input = SnapshotInput::default();
    {
        let schema = inner.schema.read();
        input.labels = schema.labels.entries().map(|(id, n)| (id, n.to_string())).collect();
        input.etypes = schema.etypes.entries().map(|(id, n)| (id, n.to_string())).collect();
        input.propkeys = schema
            .propkeys
            .entries()
            .map(|(id, n)| (id, n.to_string()))
            .collect();
    }

    let node_alive = |node: NodeId| -> bool {
        if frozen.is_node_deleted(node) {
            return false;
        }
        frozen.is_node_created(node)
            || snap.is_some_and(|s| s.has_node(node))
    };

    // Snapshot nodes, patched.
    if let Some(snap) = snap {
        for phys in 0..snap.header.num_nodes as u32 {
            let Some(node) = snap.node_id(phys) else {
                continue;
            };
            if frozen.is_node_deleted(node) {
                continue;
            }
            let mut props: BTreeMap<_, _> = snap.node_props(phys)?.into_iter().collect();
            for (key, patch) in view.node_prop_patches(node) {
                match patch {
                    Some(value) => props.insert(key, value.clone()),
                    None => props.remove(&key),
                };
            }
            let mut labels: Vec<_> = snap.node_labels(phys);
            let (added, removed) = view.label_patches(node);
            labels.retain(|l| !removed.contains(l));
            labels.extend(added);
            input.nodes.push(NodeData {
                node_id: node,
                key: snap.node_key(phys).map(String::from),
                labels,
                props,
            });
        }
    }

    // Nodes created since.
    let mut created: Vec<(&NodeId, _)> = frozen.created_nodes.iter().collect();
    created.sort_by_key(|(node, _)| **node);
    for (&node, patch) in created {
        let mut labels: Vec<_> = patch.labels_added.iter().copied().collect();
        labels.retain(|l| !patch.labels_removed.contains(l));
        input.nodes.push(NodeData {
            node_id: node,
            key: patch.key.clone(),
            labels,
            props: patch
                .props
                .iter()
                .filter_map(|(k, v)| v.clone().map(|v| (*k, v)))
                .collect(),
        });
    }

    // Snapshot edges, minus deletions and dead endpoints, props patched.
    if let Some(snap) = snap {
        for phys in 0..snap.header.num_nodes as u32 {
            let Some(src) = snap.node_id(phys) else {
                continue;
            };
            if frozen.is_node_deleted(src) {
                continue;
            }
            let (start, _) = snap.out_range(phys);
            for (i, (etype, dst_phys)) in snap.out_neighbors(phys).into_iter().enumerate() {
                let Some(dst) = snap.node_id(dst_phys) else {
                    continue;
                };
                if frozen.is_node_deleted(dst) || frozen.is_edge_deleted(src, etype, dst) {
                    continue;
                }
                let mut props: BTreeMap<_, _> =
                    snap.edge_props(start + i)?.into_iter().collect();
                for (key, patch) in view.edge_prop_patches(src, etype, dst) {
                    match patch {
                        Some(value) => props.insert(key, value.clone()),
                        None => props.remove(&key),
                    };
                }
                input.edges.push(EdgeData {
                    src,
                    etype,
                    dst,
                    props,
                });
            }
        }
    }

    // Edges added since.
    let mut added_edges: Vec<(NodeId, u32, NodeId)> = Vec::new();
    for (&src, patches) in &frozen.out_add {
        for patch in patches {
            added_edges.push((src, patch.etype, patch.other));
        }
    }
    added_edges.sort_unstable();
    for (src, etype, dst) in added_edges {
        if !node_alive(src) || !node_alive(dst) {
            continue;
        }
        let props: BTreeMap<u32, PropValue> = frozen
            .edge_props
            .get(&(src, etype, dst))
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.clone().map(|v| (*k, v)))
                    .collect()
            })
            .unwrap_or_default();
        input.edges.push(EdgeData {
            src,
            etype,
            dst,
            props,
        });
    }

    // Vector stores travel whole; committed inserts are already applied.
    {
        let stores = inner.vectors.read();
        let mut keys: Vec<_> = stores.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            input.vector_manifests.push((key, stores[&key].encode()));
        }
    }

    input.generation = inner.header.lock().snapshot_gen + 1;
    Ok(input)
}

/// Runs one checkpoint to completion. Resumes a previously frozen layer if
/// an earlier attempt failed after the region switch.
pub(crate) fn run_checkpoint(inner: &DbInner) -> Result<CheckpointStats> {
    run_checkpoint_mode(inner, false)
}

/// Open-time recovery checkpoint: both WAL regions held data after a crash
/// mid-checkpoint, so the whole replayed delta is folded and both regions
/// are cleared. Only callable before commits start.
pub(crate) fn recovery_checkpoint(inner: &DbInner) -> Result<CheckpointStats> {
    run_checkpoint_mode(inner, true)
}

fn run_checkpoint_mode(inner: &DbInner, recovery: bool) -> Result<CheckpointStats> {
    let _guard = inner.checkpoint_lock.lock();
    let started = Instant::now();

    // Phase 1 (brief): freeze the active region and the live delta. In
    // recovery mode everything replayed sits in the live delta and no
    // commits can race, so the active region freezes in place.
    let frozen_region = {
        let _commit = inner.commit_lock.lock();
        let mut delta = inner.delta.write();
        if recovery {
            let live = std::mem::take(&mut delta.live);
            delta.frozen = Some(live);
            inner.wal.lock().active
        } else if delta.frozen.is_some() {
            // Resuming after a failed attempt; regions already switched.
            1 - inner.wal.lock().active
        } else {
            let mut wal = inner.wal.lock();
            let frozen_region = wal.switch_region()?;
            let live = std::mem::take(&mut delta.live);
            delta.frozen = Some(live);
            frozen_region
        }
    };

    // Phase 2: merge and serialize without blocking anyone.
    let input = {
        let delta = inner.delta.read();
        let frozen = delta.frozen.as_ref().expect("frozen layer present");
        gather(inner, frozen)?
    };
    let generation = input.generation;
    let buffer = build_snapshot(input)?;
    let new_snapshot = Snapshot::parse(Bytes::from(buffer.clone()))?;
    let (num_nodes, num_edges) = (new_snapshot.header.num_nodes, new_snapshot.header.num_edges);

    // Phase 3: write the bytes into free space and make them durable.
    let offset = {
        let header = inner.header.lock().clone();
        let page = header.page_size as u64;
        let align = |v: u64| v.div_ceil(page) * page;
        let base = align(header.wal_end());
        if header.snapshot_len == 0 || base + buffer.len() as u64 <= header.snapshot_offset {
            base
        } else {
            align(header.snapshot_offset + header.snapshot_len).max(base)
        }
    };
    {
        let mut file = inner.file.lock();
        file.write_at(offset, &buffer)?;
        file.sync()?;
    }

    // Phase 4 (brief): header flip, then release the frozen layer and
    // region and trim dead bytes.
    {
        let _commit = inner.commit_lock.lock();
        {
            let mut wal = inner.wal.lock();
            wal.clear_region(frozen_region);
            if recovery {
                wal.clear_region(1 - frozen_region);
            }
            let mut header = inner.header.lock();
            header.snapshot_offset = offset;
            header.snapshot_len = buffer.len() as u64;
            header.snapshot_gen = generation;
            header.wal = wal.regions;
            header.active_wal_region = wal.active;
        }
        inner.persist_header(true)?;
        *inner.snapshot.write() = Some(std::sync::Arc::new(new_snapshot));
        inner.delta.write().frozen = None;
        let end = offset + buffer.len() as u64;
        let mut file = inner.file.lock();
        if file.len()? > end {
            file.set_len(end)?;
        }
    }

    let stats = CheckpointStats {
        generation,
        num_nodes,
        num_edges,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        generation = generation,
        nodes = num_nodes,
        edges = num_edges,
        ms = stats.duration_ms,
        "checkpoint.complete"
    );
    Ok(stats)
}

impl GraphDB {
    /// Folds the current state into a new snapshot and truncates the WAL.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        if self.inner.options.read_only {
            return Err(GrafitoError::ReadOnly);
        }
        run_checkpoint(&self.inner)
    }

    /// Resizes the WAL area. Requires quiescence; runs a checkpoint first
    /// and relocates the snapshot when the new area would overlap it.
    pub fn resize_wal(&self, bytes: u64) -> Result<()> {
        if self.inner.options.read_only {
            return Err(GrafitoError::ReadOnly);
        }
        if bytes < super::MIN_WAL_SIZE {
            return Err(GrafitoError::InvalidArgument(format!(
                "WAL size {bytes} below the {} byte minimum",
                super::MIN_WAL_SIZE
            )));
        }
        run_checkpoint(&self.inner)?;

        let inner = &self.inner;
        let _guard = inner.checkpoint_lock.lock();
        let _commit = inner.commit_lock.lock();
        {
            let delta = inner.delta.read();
            let wal = inner.wal.lock();
            let quiescent = wal.regions.iter().all(|r| r.used() == 0)
                && delta.live.is_empty()
                && delta.frozen.is_none();
            if !quiescent {
                return Err(GrafitoError::InvalidArgument(
                    "WAL is not quiescent; retry after commits settle".to_string(),
                ));
            }
        }

        let mut header = inner.header.lock().clone();
        let relayout = crate::storage::header::Header::new(header.page_size, bytes);
        header.wal = relayout.wal;
        header.active_wal_region = 0;

        // Relocate the snapshot when the grown WAL area would overlap it.
        if header.snapshot_len > 0 && header.snapshot_offset < header.wal_end() {
            let page = header.page_size as u64;
            let new_offset = header.wal_end().div_ceil(page) * page;
            let mut buf = vec![0u8; header.snapshot_len as usize];
            let mut file = inner.file.lock();
            file.read_at(header.snapshot_offset, &mut buf)?;
            file.write_at(new_offset, &buf)?;
            file.sync()?;
            header.snapshot_offset = new_offset;
        }

        {
            let mut file = inner.file.lock();
            file.write_header(&header)?;
            file.sync()?;
            let end = (header.snapshot_offset + header.snapshot_len).max(header.wal_end());
            file.set_len(end)?;
        }
        *inner.header.lock() = header.clone();
        *inner.wal.lock() = crate::storage::wal::Wal::from_header(header.wal, 0);
        debug!(bytes = bytes, "wal.resized");
        Ok(())
    }

    /// Compacts vector stores (WAL-logged), rebuilds trained indexes, and
    /// checkpoints.
    pub fn optimize(&self) -> Result<CheckpointStats> {
        if self.inner.options.read_only {
            return Err(GrafitoError::ReadOnly);
        }
        let inner = &self.inner;
        {
            let _commit = inner.commit_lock.lock();
            let mut stores = inner.vectors.write();
            let mut keys: Vec<_> = stores.keys().copied().collect();
            keys.sort_unstable();
            if !keys.is_empty() {
                let mut batch = Vec::new();
                for &propkey in &keys {
                    WalRecord::CompactFragments { propkey }.encode_frame(&mut batch);
                }
                WalRecord::Commit { txid: 0 }.encode_frame(&mut batch);
                {
                    let mut file = inner.file.lock();
                    let mut wal = inner.wal.lock();
                    wal.append(&mut file, &batch)?;
                }
                inner.persist_header(inner.options.sync_mode == super::SyncMode::Full)?;
                for key in keys {
                    if let Some(store) = stores.get_mut(&key) {
                        store.compact()?;
                    }
                }
            }
        }
        run_checkpoint(inner)
    }

    /// Reclaims dead container space: checkpoints into the lowest free slot
    /// and truncates. Runs a second pass when the first left the snapshot
    /// in the high slot.
    pub fn vacuum(&self) -> Result<CheckpointStats> {
        if self.inner.options.read_only {
            return Err(GrafitoError::ReadOnly);
        }
        let stats = run_checkpoint(&self.inner)?;
        let needs_second_pass = {
            let header = self.inner.header.lock();
            let page = header.page_size as u64;
            let low = header.wal_end().div_ceil(page) * page;
            header.snapshot_len > 0 && header.snapshot_offset > low
        };
        if needs_second_pass {
            return run_checkpoint(&self.inner);
        }
        Ok(stats)
    }
}
