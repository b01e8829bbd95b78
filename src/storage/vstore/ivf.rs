//! IVF and IVF-PQ index over the columnar vector store.
//!
//! IVF partitions vectors by nearest k-means centroid; a search scans the
//! `n_probe` nearest clusters instead of the whole store. With product
//! quantization enabled, residuals to the assigned centroid are quantized
//! per subspace and candidates are scored with asymmetric distance
//! computation (ADC) tables built once per probed cluster, then refined
//! exactly by the caller.

use rustc_hash::FxHashMap;

use crate::error::{GrafitoError, Result};
use crate::types::NodeId;

use super::distance::squared_euclidean;
use super::kmeans::{kmeans, KMeansConfig};

/// IVF construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfParams {
    /// Cluster count for the coarse quantizer.
    pub n_clusters: usize,
    /// Default clusters probed per search.
    pub n_probe: usize,
    /// Minimum live vectors before training is allowed.
    pub training_threshold: usize,
    /// Product quantization parameters, when enabled.
    pub pq: Option<PqParams>,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            n_clusters: 100,
            n_probe: 8,
            training_threshold: 256,
            pq: None,
        }
    }
}

/// Product quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PqParams {
    /// Number of subspaces the vector is split into.
    pub subspaces: usize,
    /// Codebook entries per subspace (at most 256; codes are one byte).
    pub centroids_per_subspace: usize,
}

impl Default for PqParams {
    fn default() -> Self {
        Self {
            subspaces: 8,
            centroids_per_subspace: 256,
        }
    }
}

/// Trained product quantizer: per-subspace codebooks plus per-node codes.
#[derive(Debug, Clone)]
pub struct PqIndex {
    pub(crate) subspaces: usize,
    pub(crate) sub_dim: usize,
    pub(crate) centroids_per: usize,
    /// `subspaces * centroids_per * sub_dim`, row-major.
    pub(crate) codebooks: Vec<f32>,
    pub(crate) codes: FxHashMap<NodeId, Vec<u8>>,
}

impl PqIndex {
    fn encode_residual(&self, residual: &[f32]) -> Vec<u8> {
        let mut code = Vec::with_capacity(self.subspaces);
        for s in 0..self.subspaces {
            let sub = &residual[s * self.sub_dim..(s + 1) * self.sub_dim];
            let mut best = 0u8;
            let mut best_d = f32::INFINITY;
            for j in 0..self.centroids_per {
                let base = (s * self.centroids_per + j) * self.sub_dim;
                let d = squared_euclidean(sub, &self.codebooks[base..base + self.sub_dim]);
                if d < best_d {
                    best_d = d;
                    best = j as u8;
                }
            }
            code.push(best);
        }
        code
    }

    fn adc_table(&self, query_residual: &[f32]) -> Vec<f32> {
        let mut table = vec![0.0f32; self.subspaces * self.centroids_per];
        for s in 0..self.subspaces {
            let sub = &query_residual[s * self.sub_dim..(s + 1) * self.sub_dim];
            for j in 0..self.centroids_per {
                let base = (s * self.centroids_per + j) * self.sub_dim;
                table[s * self.centroids_per + j] =
                    squared_euclidean(sub, &self.codebooks[base..base + self.sub_dim]);
            }
        }
        table
    }

    fn score(&self, table: &[f32], code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(s, &j)| table[s * self.centroids_per + j as usize])
            .sum()
    }
}

/// A trained IVF (optionally IVF-PQ) index.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    pub(crate) dim: usize,
    pub(crate) n_clusters: usize,
    /// `n_clusters * dim`, row-major.
    pub(crate) centroids: Vec<f32>,
    /// Node ids per cluster.
    pub(crate) postings: Vec<Vec<NodeId>>,
    pub(crate) pq: Option<PqIndex>,
}

impl IvfIndex {
    /// Trains the coarse quantizer (and PQ codebooks when configured) over
    /// the given sample, then assigns every sample to its posting list.
    pub fn train(
        samples: &[f32],
        nodes: &[NodeId],
        dim: usize,
        params: &IvfParams,
        seed: Option<u64>,
    ) -> Result<IvfIndex> {
        let n = nodes.len();
        let n_clusters = params.n_clusters.min(n).max(1);
        let result = kmeans(
            samples,
            n,
            dim,
            &KMeansConfig {
                n_clusters,
                seed,
                ..Default::default()
            },
        )?;

        let mut postings = vec![Vec::new(); n_clusters];
        for (i, &node) in nodes.iter().enumerate() {
            postings[result.assignments[i] as usize].push(node);
        }

        let pq = match params.pq {
            Some(pq_params) => Some(Self::train_pq(
                samples,
                nodes,
                dim,
                &result.centroids,
                &result.assignments,
                pq_params,
                seed,
            )?),
            None => None,
        };

        Ok(IvfIndex {
            dim,
            n_clusters,
            centroids: result.centroids,
            postings,
            pq,
        })
    }

    fn train_pq(
        samples: &[f32],
        nodes: &[NodeId],
        dim: usize,
        centroids: &[f32],
        assignments: &[u32],
        params: PqParams,
        seed: Option<u64>,
    ) -> Result<PqIndex> {
        let n = nodes.len();
        if params.subspaces == 0 || dim % params.subspaces != 0 {
            return Err(GrafitoError::InvalidArgument(format!(
                "dimension {dim} is not divisible into {} subspaces",
                params.subspaces
            )));
        }
        if params.centroids_per_subspace == 0 || params.centroids_per_subspace > 256 {
            return Err(GrafitoError::InvalidArgument(
                "PQ codebooks are limited to 256 entries per subspace".to_string(),
            ));
        }
        let sub_dim = dim / params.subspaces;
        let centroids_per = params.centroids_per_subspace.min(n);

        // Residuals to the assigned coarse centroid.
        let mut residuals = vec![0.0f32; n * dim];
        for i in 0..n {
            let c = assignments[i] as usize;
            for d in 0..dim {
                residuals[i * dim + d] = samples[i * dim + d] - centroids[c * dim + d];
            }
        }

        let mut codebooks = vec![0.0f32; params.subspaces * centroids_per * sub_dim];
        let mut sub_assignments = vec![vec![0u32; n]; params.subspaces];
        for s in 0..params.subspaces {
            let mut sub_vectors = vec![0.0f32; n * sub_dim];
            for i in 0..n {
                sub_vectors[i * sub_dim..(i + 1) * sub_dim]
                    .copy_from_slice(&residuals[i * dim + s * sub_dim..i * dim + (s + 1) * sub_dim]);
            }
            let result = kmeans(
                &sub_vectors,
                n,
                sub_dim,
                &KMeansConfig {
                    n_clusters: centroids_per,
                    seed: seed.map(|v| v.wrapping_add(s as u64 + 1)),
                    ..Default::default()
                },
            )?;
            let base = s * centroids_per * sub_dim;
            codebooks[base..base + centroids_per * sub_dim].copy_from_slice(&result.centroids);
            sub_assignments[s] = result.assignments;
        }

        let mut codes = FxHashMap::default();
        for (i, &node) in nodes.iter().enumerate() {
            let code: Vec<u8> = (0..params.subspaces)
                .map(|s| sub_assignments[s][i] as u8)
                .collect();
            codes.insert(node, code);
        }

        Ok(PqIndex {
            subspaces: params.subspaces,
            sub_dim,
            centroids_per,
            codebooks,
            codes,
        })
    }

    fn nearest_cluster(&self, vector: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_d = f32::INFINITY;
        for c in 0..self.n_clusters {
            let d = squared_euclidean(vector, &self.centroids[c * self.dim..(c + 1) * self.dim]);
            if d < best_d {
                best_d = d;
                best = c;
            }
        }
        best
    }

    /// Adds a vector committed after training.
    pub fn insert(&mut self, node: NodeId, vector: &[f32]) {
        let cluster = self.nearest_cluster(vector);
        self.postings[cluster].push(node);
        if let Some(pq) = self.pq.as_mut() {
            let base = cluster * self.dim;
            let residual: Vec<f32> = vector
                .iter()
                .zip(&self.centroids[base..base + self.dim])
                .map(|(v, c)| v - c)
                .collect();
            let code = pq.encode_residual(&residual);
            pq.codes.insert(node, code);
        }
    }

    /// Removes a node; `vector` narrows the posting scan to one cluster.
    pub fn remove(&mut self, node: NodeId, vector: Option<&[f32]>) {
        match vector {
            Some(v) => {
                let cluster = self.nearest_cluster(v);
                self.postings[cluster].retain(|&n| n != node);
            }
            None => {
                for posting in &mut self.postings {
                    posting.retain(|&n| n != node);
                }
            }
        }
        if let Some(pq) = self.pq.as_mut() {
            pq.codes.remove(&node);
        }
    }

    /// Clusters nearest to the query, closest first.
    pub fn probe(&self, query: &[f32], n_probe: usize) -> Vec<usize> {
        let mut order: Vec<(f32, usize)> = (0..self.n_clusters)
            .map(|c| {
                (
                    squared_euclidean(query, &self.centroids[c * self.dim..(c + 1) * self.dim]),
                    c,
                )
            })
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0));
        order.truncate(n_probe.max(1));
        order.into_iter().map(|(_, c)| c).collect()
    }

    /// Candidate nodes from the probed clusters. With PQ trained, each
    /// candidate carries an ADC-approximated squared distance for
    /// pre-ranking; without PQ the distance slot is `None`.
    pub fn candidates(&self, query: &[f32], n_probe: usize) -> Vec<(NodeId, Option<f32>)> {
        let clusters = self.probe(query, n_probe);
        let mut out = Vec::new();
        match self.pq.as_ref() {
            Some(pq) => {
                for c in clusters {
                    let base = c * self.dim;
                    let residual: Vec<f32> = query
                        .iter()
                        .zip(&self.centroids[base..base + self.dim])
                        .map(|(q, ctr)| q - ctr)
                        .collect();
                    let table = pq.adc_table(&residual);
                    for &node in &self.postings[c] {
                        let approx = pq.codes.get(&node).map(|code| pq.score(&table, code));
                        out.push((node, approx));
                    }
                }
            }
            None => {
                for c in clusters {
                    out.extend(self.postings[c].iter().map(|&n| (n, None)));
                }
            }
        }
        out
    }

    /// Posting list sizes, for stats.
    pub fn posting_sizes(&self) -> Vec<usize> {
        self.postings.iter().map(|p| p.len()).collect()
    }
}
