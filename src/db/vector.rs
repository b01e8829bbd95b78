//! Vector API surface on the database handle.

use crate::error::{GrafitoError, Result};
use crate::storage::vstore::{VectorIndexSpec, VectorSearchHit, VectorStoreStats};
use crate::types::{NodeId, PropKeyId};

use super::GraphDB;

impl GraphDB {
    /// Creates a vector store for a property key in a one-shot transaction.
    /// See [`Transaction::create_vector_index`](super::Transaction::create_vector_index)
    /// for the transactional form.
    pub fn create_vector_index(&self, propkey: PropKeyId, spec: VectorIndexSpec) -> Result<()> {
        let mut tx = self.begin(false)?;
        tx.create_vector_index(propkey, spec)?;
        tx.commit()
    }

    /// A node's committed vector under a property key.
    pub fn node_vector(&self, node: NodeId, key: PropKeyId) -> Option<Vec<f32>> {
        if !self.node_exists(node) {
            return None;
        }
        self.inner
            .vectors
            .read()
            .get(&key)
            .and_then(|store| store.get(node).map(|v| v.to_vec()))
    }

    /// Whether a node has a committed vector under a property key.
    pub fn has_node_vector(&self, node: NodeId, key: PropKeyId) -> bool {
        self.node_vector(node, key).is_some()
    }

    /// Approximate (or brute-force, before training) nearest-neighbor
    /// search. Hits come back sorted by distance ascending; hits for nodes
    /// deleted since their vectors were written are filtered out.
    pub fn search_vectors(
        &self,
        key: PropKeyId,
        query: &[f32],
        k: usize,
        n_probe: Option<usize>,
    ) -> Result<Vec<VectorSearchHit>> {
        self.search_vectors_within(key, query, k, n_probe, None)
    }

    /// [`search_vectors`](Self::search_vectors) with a maximum-distance
    /// cutoff: hits farther than `threshold` are dropped.
    pub fn search_vectors_within(
        &self,
        key: PropKeyId,
        query: &[f32],
        k: usize,
        n_probe: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<VectorSearchHit>> {
        let stores = self.inner.vectors.read();
        let store = stores
            .get(&key)
            .ok_or(GrafitoError::NotFound("vector store"))?;
        // Over-fetch to survive the liveness filter below.
        let raw = store.search(query, k.saturating_mul(2).max(k), n_probe)?;
        drop(stores);
        let mut hits: Vec<VectorSearchHit> = raw
            .into_iter()
            .filter(|hit| threshold.map_or(true, |t| hit.distance <= t))
            .filter(|hit| self.node_exists(hit.node_id))
            .collect();
        hits.truncate(k);
        Ok(hits)
    }

    /// Trains (or retrains) the IVF index for a property key when its
    /// configuration and population allow it. Returns whether training ran.
    pub fn build_vector_index(&self, key: PropKeyId, seed: Option<u64>) -> Result<bool> {
        let mut stores = self.inner.vectors.write();
        let store = stores
            .get_mut(&key)
            .ok_or(GrafitoError::NotFound("vector store"))?;
        store.train_index(seed)
    }

    /// Statistics for one vector store.
    pub fn vector_stats(&self, key: PropKeyId) -> Option<VectorStoreStats> {
        self.inner.vectors.read().get(&key).map(|s| s.stats())
    }

    /// Property keys that have vector stores.
    pub fn vector_propkeys(&self) -> Vec<PropKeyId> {
        let mut keys: Vec<_> = self.inner.vectors.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}
