//! Columnar vector store: per-property-key fragments of fixed-dimension
//! f32 vectors with a liveness bitmap, brute-force and IVF/IVF-PQ search,
//! and snapshot (de)serialization.
//!
//! Inserts append to the open fragment; a fragment that reaches the target
//! size is sealed and becomes immutable. Deletes flip the bitmap and leave
//! data in place until a compaction fuses live rows into fresh fragments.
//! All mutations are WAL-logged by the database layer before they reach the
//! store.

pub mod distance;
pub mod ivf;
pub mod kmeans;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::{GrafitoError, Result};
use crate::primitives::bytes::{put_f32, put_u32, put_u64, Cursor};
use crate::types::NodeId;

pub use ivf::{IvfParams, PqParams};

use ivf::IvfIndex;

/// Distance metric of a vector store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VectorMetric {
    /// Euclidean (L2) distance; similarity = 1 / (1 + distance).
    Euclidean,
    /// Cosine distance over normalized vectors; similarity = 1 - distance.
    Cosine,
    /// Negative dot product as distance; similarity = dot product.
    Dot,
}

impl VectorMetric {
    fn tag(self) -> u8 {
        match self {
            VectorMetric::Euclidean => 0,
            VectorMetric::Cosine => 1,
            VectorMetric::Dot => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => VectorMetric::Euclidean,
            1 => VectorMetric::Cosine,
            2 => VectorMetric::Dot,
            other => {
                return Err(GrafitoError::corrupt(format!(
                    "unknown vector metric tag {other}"
                )))
            }
        })
    }
}

/// Configuration of one vector store, fixed at creation (dimension on first
/// insert, immutable thereafter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndexSpec {
    /// Vector dimension.
    pub dim: usize,
    /// Distance metric.
    pub metric: VectorMetric,
    /// Normalize vectors on insert (forced on for cosine).
    pub normalize: bool,
    /// Rows per row group inside a fragment.
    pub row_group_size: usize,
    /// Rows after which a fragment is sealed.
    pub fragment_target: usize,
    /// IVF parameters; `None` keeps the store brute-force only.
    pub ivf: Option<IvfParams>,
}

impl VectorIndexSpec {
    /// Serializes the spec (shared by the snapshot manifest and the WAL
    /// index-creation record).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        put_u32(out, self.dim as u32);
        out.push(self.metric.tag());
        out.push(u8::from(self.normalize));
        put_u32(out, self.row_group_size as u32);
        put_u32(out, self.fragment_target as u32);
        match self.ivf.as_ref() {
            Some(params) => {
                out.push(1);
                put_u32(out, params.n_clusters as u32);
                put_u32(out, params.n_probe as u32);
                put_u32(out, params.training_threshold as u32);
                match params.pq {
                    Some(pq) => {
                        out.push(1);
                        put_u32(out, pq.subspaces as u32);
                        put_u32(out, pq.centroids_per_subspace as u32);
                    }
                    None => out.push(0),
                }
            }
            None => out.push(0),
        }
    }

    /// Decodes a spec serialized with [`encode_into`](Self::encode_into).
    pub fn decode_from(cur: &mut Cursor<'_>) -> Result<Self> {
        let dim = cur.u32()? as usize;
        let metric = VectorMetric::from_tag(cur.u8()?)?;
        let normalize = cur.u8()? != 0;
        let row_group_size = cur.u32()? as usize;
        let fragment_target = cur.u32()? as usize;
        let ivf = if cur.u8()? != 0 {
            let n_clusters = cur.u32()? as usize;
            let n_probe = cur.u32()? as usize;
            let training_threshold = cur.u32()? as usize;
            let pq = if cur.u8()? != 0 {
                Some(PqParams {
                    subspaces: cur.u32()? as usize,
                    centroids_per_subspace: cur.u32()? as usize,
                })
            } else {
                None
            };
            Some(IvfParams {
                n_clusters,
                n_probe,
                training_threshold,
                pq,
            })
        } else {
            None
        };
        Ok(Self {
            dim,
            metric,
            normalize,
            row_group_size,
            fragment_target,
            ivf,
        })
    }

    /// Spec with defaults for a given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            metric: VectorMetric::Euclidean,
            normalize: false,
            row_group_size: 1024,
            fragment_target: 8192,
            ivf: None,
        }
    }

    /// Sets the metric, enabling normalization for cosine.
    pub fn metric(mut self, metric: VectorMetric) -> Self {
        self.metric = metric;
        if metric == VectorMetric::Cosine {
            self.normalize = true;
        }
        self
    }

    /// Enables IVF with the given parameters.
    pub fn ivf(mut self, params: IvfParams) -> Self {
        self.ivf = Some(params);
        self
    }
}

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VectorSearchHit {
    /// Matching node.
    pub node_id: NodeId,
    /// Distance under the store's metric.
    pub distance: f32,
    /// Derived similarity score.
    pub similarity: f32,
}

/// Store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct VectorStoreStats {
    /// Vector dimension.
    pub dim: usize,
    /// Distance metric.
    pub metric: VectorMetric,
    /// Fragment count.
    pub fragments: usize,
    /// Fragments sealed so far.
    pub sealed_fragments: usize,
    /// Live rows.
    pub live_rows: usize,
    /// Tombstoned rows awaiting compaction.
    pub deleted_rows: usize,
    /// Whether an IVF index is trained.
    pub index_trained: bool,
    /// Trained cluster count (0 when untrained).
    pub clusters: usize,
}

/// One immutable-once-sealed run of row groups.
#[derive(Debug, Clone, Default)]
struct Fragment {
    /// Row groups of `row_group_size * dim` f32 values each; the last may
    /// be partially filled.
    groups: Vec<Vec<f32>>,
    rows: usize,
    live: Vec<u64>,
    row_nodes: Vec<NodeId>,
    sealed: bool,
    live_count: usize,
}

impl Fragment {
    fn push(&mut self, node: NodeId, vector: &[f32], row_group_size: usize) -> u32 {
        let dim = vector.len();
        let row = self.rows;
        let group = row / row_group_size;
        if group == self.groups.len() {
            self.groups.push(Vec::with_capacity(row_group_size * dim));
        }
        self.groups[group].extend_from_slice(vector);
        self.rows += 1;
        self.row_nodes.push(node);
        let word = row / 64;
        if word == self.live.len() {
            self.live.push(0);
        }
        self.live[word] |= 1u64 << (row % 64);
        self.live_count += 1;
        row as u32
    }

    fn vector(&self, row: u32, dim: usize, row_group_size: usize) -> &[f32] {
        let row = row as usize;
        let group = row / row_group_size;
        let within = (row % row_group_size) * dim;
        &self.groups[group][within..within + dim]
    }

    fn is_live(&self, row: u32) -> bool {
        let row = row as usize;
        self.live
            .get(row / 64)
            .is_some_and(|w| w & (1u64 << (row % 64)) != 0)
    }

    fn kill(&mut self, row: u32) -> bool {
        let idx = row as usize / 64;
        let bit = 1u64 << (row as usize % 64);
        if self.live[idx] & bit != 0 {
            self.live[idx] &= !bit;
            self.live_count -= 1;
            true
        } else {
            false
        }
    }
}

/// A per-property-key vector store.
pub struct VectorStore {
    /// Store configuration.
    pub spec: VectorIndexSpec,
    fragments: Vec<Fragment>,
    node_rows: FxHashMap<NodeId, (u32, u32)>,
    index: Option<IvfIndex>,
}

impl VectorStore {
    /// Creates an empty store.
    pub fn new(spec: VectorIndexSpec) -> Self {
        Self {
            spec,
            fragments: Vec::new(),
            node_rows: FxHashMap::default(),
            index: None,
        }
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.spec.dim
    }

    /// Live vector count.
    pub fn live_count(&self) -> usize {
        self.fragments.iter().map(|f| f.live_count).sum()
    }

    /// Whether the node has a live vector.
    pub fn contains(&self, node: NodeId) -> bool {
        self.node_rows.contains_key(&node)
    }

    /// The node's vector, if live.
    pub fn get(&self, node: NodeId) -> Option<&[f32]> {
        let &(frag, row) = self.node_rows.get(&node)?;
        Some(self.fragments[frag as usize].vector(row, self.spec.dim, self.spec.row_group_size))
    }

    fn prepared(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.spec.dim {
            return Err(GrafitoError::VectorDimensionMismatch {
                expected: self.spec.dim,
                got: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(GrafitoError::InvalidArgument(
                "vector contains non-finite values".to_string(),
            ));
        }
        let mut prepared = vector.to_vec();
        if self.spec.normalize {
            distance::normalize_in_place(&mut prepared);
        }
        Ok(prepared)
    }

    /// Inserts or replaces a node's vector. Returns the index of a fragment
    /// that reached its target size and was sealed by this insert, so the
    /// caller can log it.
    pub fn insert(&mut self, node: NodeId, vector: &[f32]) -> Result<Option<u32>> {
        let prepared = self.prepared(vector)?;
        if self.contains(node) {
            self.delete(node);
        }

        let open = match self.fragments.iter().position(|f| !f.sealed) {
            Some(i) => i,
            None => {
                self.fragments.push(Fragment::default());
                self.fragments.len() - 1
            }
        };
        let row = self.fragments[open].push(node, &prepared, self.spec.row_group_size);
        self.node_rows.insert(node, (open as u32, row));

        if let Some(index) = self.index.as_mut() {
            index.insert(node, &prepared);
        }

        if self.fragments[open].rows >= self.spec.fragment_target {
            self.fragments[open].sealed = true;
            return Ok(Some(open as u32));
        }
        Ok(None)
    }

    /// Marks a fragment sealed during WAL replay.
    pub fn seal_fragment(&mut self, fragment: u32) {
        if let Some(f) = self.fragments.get_mut(fragment as usize) {
            f.sealed = true;
        }
    }

    /// Deletes a node's vector. Idempotent.
    pub fn delete(&mut self, node: NodeId) -> bool {
        let Some((frag, row)) = self.node_rows.remove(&node) else {
            return false;
        };
        let vector = self.fragments[frag as usize]
            .vector(row, self.spec.dim, self.spec.row_group_size)
            .to_vec();
        let killed = self.fragments[frag as usize].kill(row);
        if let Some(index) = self.index.as_mut() {
            index.remove(node, Some(&vector));
        }
        killed
    }

    /// Iterates live (node, vector) pairs in storage order.
    pub fn iter_live(&self) -> impl Iterator<Item = (NodeId, &[f32])> {
        let dim = self.spec.dim;
        let rgs = self.spec.row_group_size;
        self.fragments.iter().flat_map(move |frag| {
            (0..frag.rows as u32).filter_map(move |row| {
                if frag.is_live(row) {
                    Some((frag.row_nodes[row as usize], frag.vector(row, dim, rgs)))
                } else {
                    None
                }
            })
        })
    }

    fn metric_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.spec.metric {
            VectorMetric::Euclidean => distance::euclidean(a, b),
            VectorMetric::Cosine => distance::cosine_distance(a, b),
            VectorMetric::Dot => -distance::dot(a, b),
        }
    }

    fn similarity(&self, dist: f32) -> f32 {
        match self.spec.metric {
            VectorMetric::Euclidean => 1.0 / (1.0 + dist),
            VectorMetric::Cosine => 1.0 - dist,
            VectorMetric::Dot => -dist,
        }
    }

    fn top_k(&self, query: &[f32], candidates: impl Iterator<Item = NodeId>, k: usize) -> Vec<VectorSearchHit> {
        let mut hits: Vec<VectorSearchHit> = Vec::new();
        for node in candidates {
            let Some(vector) = self.get(node) else {
                continue;
            };
            let dist = self.metric_distance(query, vector);
            hits.push(VectorSearchHit {
                node_id: node,
                distance: dist,
                similarity: self.similarity(dist),
            });
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.node_id.cmp(&b.node_id)));
        hits.truncate(k);
        hits
    }

    /// Exhaustive scan over live rows; ground truth for the IVF paths.
    pub fn brute_force_search(&self, query: &[f32], k: usize) -> Result<Vec<VectorSearchHit>> {
        let prepared = self.prepared(query)?;
        let nodes: Vec<NodeId> = self.iter_live().map(|(n, _)| n).collect();
        Ok(self.top_k(&prepared, nodes.into_iter(), k))
    }

    /// Searches the store: IVF (with optional ADC pre-ranking) when an index
    /// is trained, brute force otherwise.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        n_probe: Option<usize>,
    ) -> Result<Vec<VectorSearchHit>> {
        let Some(index) = self.index.as_ref() else {
            return self.brute_force_search(query, k);
        };
        let prepared = self.prepared(query)?;
        let probes = n_probe
            .or_else(|| self.spec.ivf.as_ref().map(|p| p.n_probe))
            .unwrap_or(8);
        let mut candidates = index.candidates(&prepared, probes);
        if candidates.iter().all(|(_, approx)| approx.is_some()) && !candidates.is_empty() {
            // ADC pre-rank, then refine the best 4k exactly.
            candidates.sort_by(|a, b| a.1.unwrap().total_cmp(&b.1.unwrap()));
            candidates.truncate((k * 4).max(k));
        }
        Ok(self.top_k(&prepared, candidates.into_iter().map(|(n, _)| n), k))
    }

    /// Trains the IVF index when configured and enough live vectors exist.
    /// Returns whether a (re)train happened.
    pub fn train_index(&mut self, seed: Option<u64>) -> Result<bool> {
        let Some(params) = self.spec.ivf.clone() else {
            return Ok(false);
        };
        let live = self.live_count();
        if live < params.training_threshold.max(params.n_clusters) {
            return Ok(false);
        }
        let mut samples = Vec::with_capacity(live * self.spec.dim);
        let mut nodes = Vec::with_capacity(live);
        for (node, vector) in self.iter_live() {
            nodes.push(node);
            samples.extend_from_slice(vector);
        }
        let index = IvfIndex::train(&samples, &nodes, self.spec.dim, &params, seed)?;
        debug!(
            nodes = nodes.len(),
            clusters = index.posting_sizes().len(),
            "vstore.index.trained"
        );
        self.index = Some(index);
        Ok(true)
    }

    /// Whether an IVF index is trained.
    pub fn index_trained(&self) -> bool {
        self.index.is_some()
    }

    /// Fuses live rows into fresh fragments, dropping tombstones, and
    /// retrains the index if one was trained. Returns rows reclaimed.
    pub fn compact(&mut self) -> Result<usize> {
        let reclaimed: usize = self
            .fragments
            .iter()
            .map(|f| f.rows - f.live_count)
            .sum();
        let live: Vec<(NodeId, Vec<f32>)> = self
            .iter_live()
            .map(|(n, v)| (n, v.to_vec()))
            .collect();
        self.fragments.clear();
        self.node_rows.clear();
        let had_index = self.index.take().is_some();
        for (node, vector) in live {
            let open = match self.fragments.iter().position(|f| !f.sealed) {
                Some(i) => i,
                None => {
                    self.fragments.push(Fragment::default());
                    self.fragments.len() - 1
                }
            };
            let row = self.fragments[open].push(node, &vector, self.spec.row_group_size);
            self.node_rows.insert(node, (open as u32, row));
            if self.fragments[open].rows >= self.spec.fragment_target {
                self.fragments[open].sealed = true;
            }
        }
        if had_index {
            self.train_index(None)?;
        }
        Ok(reclaimed)
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> VectorStoreStats {
        let live = self.live_count();
        let total: usize = self.fragments.iter().map(|f| f.rows).sum();
        VectorStoreStats {
            dim: self.spec.dim,
            metric: self.spec.metric,
            fragments: self.fragments.len(),
            sealed_fragments: self.fragments.iter().filter(|f| f.sealed).count(),
            live_rows: live,
            deleted_rows: total - live,
            index_trained: self.index.is_some(),
            clusters: self.index.as_ref().map(|i| i.posting_sizes().len()).unwrap_or(0),
        }
    }

    // ------------------------------------------------------------------
    // Snapshot serialization
    // ------------------------------------------------------------------

    /// Serializes the store (fragments, bitmap, node map, trained index)
    /// into a manifest blob for the snapshot.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, 1); // manifest version
        self.spec.encode_into(&mut out);

        put_u32(&mut out, self.fragments.len() as u32);
        for frag in &self.fragments {
            out.push(u8::from(frag.sealed));
            put_u32(&mut out, frag.rows as u32);
            for group in &frag.groups {
                for &v in group {
                    put_f32(&mut out, v);
                }
            }
            put_u32(&mut out, frag.live.len() as u32);
            for &word in &frag.live {
                put_u64(&mut out, word);
            }
            for &node in &frag.row_nodes {
                put_u64(&mut out, node);
            }
        }

        match self.index.as_ref() {
            Some(index) => {
                out.push(1);
                put_u32(&mut out, index.n_clusters as u32);
                for &c in &index.centroids {
                    put_f32(&mut out, c);
                }
                for posting in &index.postings {
                    put_u32(&mut out, posting.len() as u32);
                    for &node in posting {
                        put_u64(&mut out, node);
                    }
                }
                match index.pq.as_ref() {
                    Some(pq) => {
                        out.push(1);
                        put_u32(&mut out, pq.subspaces as u32);
                        put_u32(&mut out, pq.sub_dim as u32);
                        put_u32(&mut out, pq.centroids_per as u32);
                        for &c in &pq.codebooks {
                            put_f32(&mut out, c);
                        }
                        put_u32(&mut out, pq.codes.len() as u32);
                        let mut codes: Vec<_> = pq.codes.iter().collect();
                        codes.sort_by_key(|(node, _)| **node);
                        for (node, code) in codes {
                            put_u64(&mut out, *node);
                            out.extend_from_slice(code);
                        }
                    }
                    None => out.push(0),
                }
            }
            None => out.push(0),
        }
        out
    }

    /// Reconstructs a store from a manifest blob.
    pub fn decode(blob: &[u8]) -> Result<VectorStore> {
        let mut cur = Cursor::new(blob);
        let version = cur.u32()?;
        if version != 1 {
            return Err(GrafitoError::corrupt(format!(
                "unsupported vector manifest version {version}"
            )));
        }
        let spec = VectorIndexSpec::decode_from(&mut cur)?;
        let dim = spec.dim;
        let row_group_size = spec.row_group_size;

        let n_fragments = cur.u32()? as usize;
        let mut fragments = Vec::with_capacity(n_fragments);
        let mut node_rows = FxHashMap::default();
        for frag_idx in 0..n_fragments {
            let sealed = cur.u8()? != 0;
            let rows = cur.u32()? as usize;
            let mut groups = Vec::new();
            let mut remaining = rows;
            while remaining > 0 {
                let take = remaining.min(row_group_size);
                groups.push(cur.f32_vec(take * dim)?);
                remaining -= take;
            }
            let words = cur.u32()? as usize;
            let mut live = Vec::with_capacity(words);
            for _ in 0..words {
                live.push(cur.u64()?);
            }
            let mut row_nodes = Vec::with_capacity(rows);
            for _ in 0..rows {
                row_nodes.push(cur.u64()?);
            }
            let mut live_count = 0usize;
            for row in 0..rows {
                if live.get(row / 64).is_some_and(|w| w & (1u64 << (row % 64)) != 0) {
                    node_rows.insert(row_nodes[row], (frag_idx as u32, row as u32));
                    live_count += 1;
                }
            }
            fragments.push(Fragment {
                groups,
                rows,
                live,
                row_nodes,
                sealed,
                live_count,
            });
        }

        let index = if cur.u8()? != 0 {
            let n_clusters = cur.u32()? as usize;
            let centroids = cur.f32_vec(n_clusters * dim)?;
            let mut postings = Vec::with_capacity(n_clusters);
            for _ in 0..n_clusters {
                let len = cur.u32()? as usize;
                let mut posting = Vec::with_capacity(len);
                for _ in 0..len {
                    posting.push(cur.u64()?);
                }
                postings.push(posting);
            }
            let pq = if cur.u8()? != 0 {
                let subspaces = cur.u32()? as usize;
                let sub_dim = cur.u32()? as usize;
                let centroids_per = cur.u32()? as usize;
                let codebooks = cur.f32_vec(subspaces * centroids_per * sub_dim)?;
                let n_codes = cur.u32()? as usize;
                let mut codes = FxHashMap::default();
                for _ in 0..n_codes {
                    let node = cur.u64()?;
                    let code = cur.take(subspaces)?.to_vec();
                    codes.insert(node, code);
                }
                Some(ivf::PqIndex {
                    subspaces,
                    sub_dim,
                    centroids_per,
                    codebooks,
                    codes,
                })
            } else {
                None
            };
            Some(IvfIndex {
                dim,
                n_clusters,
                centroids,
                postings,
                pq,
            })
        } else {
            None
        };

        if cur.remaining() != 0 {
            return Err(GrafitoError::corrupt(
                "trailing bytes in vector manifest".to_string(),
            ));
        }

        Ok(VectorStore {
            spec,
            fragments,
            node_rows,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn filled_store(n: usize, dim: usize, spec: VectorIndexSpec) -> VectorStore {
        let mut store = VectorStore::new(spec);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for node in 1..=n as NodeId {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            store.insert(node, &v).unwrap();
        }
        store
    }

    #[test]
    fn insert_get_delete() {
        let mut store = VectorStore::new(VectorIndexSpec::new(3));
        store.insert(1, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(store.get(1), Some(&[1.0, 2.0, 3.0][..]));
        assert!(store.contains(1));
        assert_eq!(store.live_count(), 1);

        // Replacement keeps one live row for the node.
        store.insert(1, &[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(store.get(1), Some(&[4.0, 5.0, 6.0][..]));
        assert_eq!(store.live_count(), 1);

        assert!(store.delete(1));
        assert!(!store.delete(1));
        assert_eq!(store.get(1), None);
        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn dimension_is_fixed() {
        let mut store = VectorStore::new(VectorIndexSpec::new(3));
        store.insert(1, &[1.0, 0.0, 0.0]).unwrap();
        match store.insert(2, &[1.0, 0.0]) {
            Err(GrafitoError::VectorDimensionMismatch { expected, got }) => {
                assert_eq!((expected, got), (3, 2));
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn fragment_seals_at_target() {
        let mut spec = VectorIndexSpec::new(2);
        spec.fragment_target = 4;
        spec.row_group_size = 2;
        let mut store = VectorStore::new(spec);
        let mut sealed = None;
        for node in 1..=4 {
            sealed = store.insert(node, &[node as f32, 0.0]).unwrap();
        }
        assert_eq!(sealed, Some(0));
        store.insert(5, &[5.0, 0.0]).unwrap();
        assert_eq!(store.stats().fragments, 2);
        assert_eq!(store.stats().sealed_fragments, 1);
    }

    #[test]
    fn brute_force_orders_by_distance() {
        let mut store = VectorStore::new(VectorIndexSpec::new(2));
        store.insert(1, &[0.0, 0.0]).unwrap();
        store.insert(2, &[1.0, 0.0]).unwrap();
        store.insert(3, &[5.0, 0.0]).unwrap();
        let hits = store.brute_force_search(&[0.1, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node_id, 1);
        assert_eq!(hits[1].node_id, 2);
        assert!(hits[0].distance <= hits[1].distance);
        assert!((hits[0].similarity - 1.0 / (1.0 + hits[0].distance)).abs() < 1e-6);
    }

    #[test]
    fn cosine_normalizes_and_scores() {
        let mut store =
            VectorStore::new(VectorIndexSpec::new(2).metric(VectorMetric::Cosine));
        store.insert(1, &[10.0, 0.0]).unwrap();
        store.insert(2, &[0.0, 3.0]).unwrap();
        let hits = store.search(&[1.0, 0.0], 2, None).unwrap();
        assert_eq!(hits[0].node_id, 1);
        assert!(hits[0].distance.abs() < 1e-6);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!((hits[1].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ivf_agrees_with_brute_force_on_top_hit() {
        let spec = VectorIndexSpec::new(8).ivf(IvfParams {
            n_clusters: 8,
            n_probe: 8,
            training_threshold: 0,
            pq: None,
        });
        let mut store = filled_store(200, 8, spec);
        assert!(store.train_index(Some(5)).unwrap());
        let query = vec![0.1f32; 8];
        let exact = store.brute_force_search(&query, 5).unwrap();
        let approx = store.search(&query, 5, Some(8)).unwrap();
        // Probing every cluster makes IVF exhaustive.
        assert_eq!(exact, approx);
    }

    #[test]
    fn training_respects_threshold() {
        let spec = VectorIndexSpec::new(4).ivf(IvfParams {
            n_clusters: 4,
            n_probe: 2,
            training_threshold: 100,
            pq: None,
        });
        let mut store = filled_store(10, 4, spec);
        assert!(!store.train_index(Some(1)).unwrap());
        assert!(!store.index_trained());
    }

    #[test]
    fn compact_reclaims_tombstones() {
        let mut store = filled_store(50, 4, VectorIndexSpec::new(4));
        for node in 1..=25 {
            store.delete(node);
        }
        assert_eq!(store.stats().deleted_rows, 25);
        let reclaimed = store.compact().unwrap();
        assert_eq!(reclaimed, 25);
        let stats = store.stats();
        assert_eq!(stats.deleted_rows, 0);
        assert_eq!(stats.live_rows, 25);
        assert!(store.get(30).is_some());
        assert!(store.get(10).is_none());
    }

    #[test]
    fn encode_decode_roundtrip_preserves_search() {
        let spec = VectorIndexSpec::new(8).ivf(IvfParams {
            n_clusters: 4,
            n_probe: 4,
            training_threshold: 0,
            pq: Some(PqParams {
                subspaces: 4,
                centroids_per_subspace: 16,
            }),
        });
        let mut store = filled_store(64, 8, spec);
        store.delete(7);
        assert!(store.train_index(Some(9)).unwrap());

        let blob = store.encode();
        let decoded = VectorStore::decode(&blob).unwrap();
        assert_eq!(decoded.spec, store.spec);
        assert_eq!(decoded.live_count(), store.live_count());
        assert!(decoded.index_trained());
        assert_eq!(decoded.get(12), store.get(12));
        assert_eq!(decoded.get(7), None);

        let query = vec![0.3f32; 8];
        let a = store.search(&query, 5, Some(4)).unwrap();
        let b = decoded.search(&query, 5, Some(4)).unwrap();
        assert_eq!(a, b);
        // Encoding is deterministic.
        assert_eq!(blob, decoded.encode());
    }
}
