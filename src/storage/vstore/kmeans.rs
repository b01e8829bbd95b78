//! K-means clustering for IVF training: k-means++ seeding plus Lloyd's
//! iterations with a relative-inertia convergence test.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{GrafitoError, Result};

use super::distance::squared_euclidean;

/// Clustering configuration.
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Number of clusters.
    pub n_clusters: usize,
    /// Iteration cap.
    pub max_iterations: usize,
    /// Relative inertia change below which training stops.
    pub tolerance: f32,
    /// Seed for reproducible training; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 100,
            max_iterations: 25,
            tolerance: 1e-4,
            seed: None,
        }
    }
}

/// Trained centroids and per-vector assignments.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Row-major centroid matrix, `n_clusters x dim`.
    pub centroids: Vec<f32>,
    /// Cluster index per input vector.
    pub assignments: Vec<u32>,
    /// Final sum of squared distances to assigned centroids.
    pub inertia: f32,
}

/// Runs k-means over `n` vectors of `dim` packed row-major in `vectors`.
pub fn kmeans(vectors: &[f32], n: usize, dim: usize, config: &KMeansConfig) -> Result<KMeansResult> {
    if config.n_clusters == 0 || n < config.n_clusters {
        return Err(GrafitoError::InvalidArgument(format!(
            "k-means needs at least {} vectors, have {n}",
            config.n_clusters
        )));
    }
    if vectors.len() != n * dim {
        return Err(GrafitoError::InvalidArgument(format!(
            "k-means input length {} does not match {n} x {dim}",
            vectors.len()
        )));
    }

    let k = config.n_clusters;
    let mut centroids = plus_plus_init(vectors, n, dim, k, config.seed);
    let mut assignments = vec![0u32; n];
    let mut prev_inertia = f32::INFINITY;

    for _ in 0..config.max_iterations {
        let inertia = assign(vectors, n, dim, &centroids, k, &mut assignments);
        if (prev_inertia - inertia).abs() / inertia.max(1.0) < config.tolerance {
            break;
        }
        prev_inertia = inertia;
        update_centroids(vectors, n, dim, &assignments, k, &mut centroids);
    }

    let inertia = assign(vectors, n, dim, &centroids, k, &mut assignments);
    Ok(KMeansResult {
        centroids,
        assignments,
        inertia,
    })
}

fn plus_plus_init(vectors: &[f32], n: usize, dim: usize, k: usize, seed: Option<u64>) -> Vec<f32> {
    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    };
    let mut centroids = Vec::with_capacity(k * dim);
    let first = rng.gen_range(0..n);
    centroids.extend_from_slice(&vectors[first * dim..(first + 1) * dim]);

    let mut min_dists = vec![f32::INFINITY; n];
    for _ in 1..k {
        let latest = &centroids[centroids.len() - dim..];
        let mut total = 0.0f64;
        for i in 0..n {
            let d = squared_euclidean(&vectors[i * dim..(i + 1) * dim], latest);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }
        let pick = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                target -= d as f64;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.extend_from_slice(&vectors[pick * dim..(pick + 1) * dim]);
    }
    centroids
}

fn assign(
    vectors: &[f32],
    n: usize,
    dim: usize,
    centroids: &[f32],
    k: usize,
    assignments: &mut [u32],
) -> f32 {
    let mut inertia = 0.0f32;
    for i in 0..n {
        let v = &vectors[i * dim..(i + 1) * dim];
        let mut best = 0u32;
        let mut best_d = f32::INFINITY;
        for c in 0..k {
            let d = squared_euclidean(v, &centroids[c * dim..(c + 1) * dim]);
            if d < best_d {
                best_d = d;
                best = c as u32;
            }
        }
        assignments[i] = best;
        inertia += best_d;
    }
    inertia
}

fn update_centroids(
    vectors: &[f32],
    n: usize,
    dim: usize,
    assignments: &[u32],
    k: usize,
    centroids: &mut [f32],
) {
    let mut sums = vec![0.0f32; k * dim];
    let mut counts = vec![0u32; k];
    for i in 0..n {
        let c = assignments[i] as usize;
        counts[c] += 1;
        let v = &vectors[i * dim..(i + 1) * dim];
        for (s, &x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(v) {
            *s += x;
        }
    }
    for c in 0..k {
        if counts[c] == 0 {
            continue; // empty cluster keeps its previous centroid
        }
        let inv = 1.0 / counts[c] as f32;
        for d in 0..dim {
            centroids[c * dim + d] = sums[c * dim + d] * inv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_obvious_clusters() {
        // Two tight blobs around (0,0) and (10,10).
        let mut data = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f32 * 0.01;
            if i < 10 {
                data.extend_from_slice(&[jitter, -jitter]);
            } else {
                data.extend_from_slice(&[10.0 + jitter, 10.0 - jitter]);
            }
        }
        let result = kmeans(
            &data,
            20,
            2,
            &KMeansConfig {
                n_clusters: 2,
                seed: Some(42),
                ..Default::default()
            },
        )
        .unwrap();
        let first = result.assignments[0];
        assert!(result.assignments[..10].iter().all(|&a| a == first));
        assert!(result.assignments[10..].iter().all(|&a| a != first));
        assert!(result.inertia < 0.1);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let data: Vec<f32> = (0..256).map(|i| (i as f32).sin()).collect();
        let config = KMeansConfig {
            n_clusters: 4,
            seed: Some(7),
            ..Default::default()
        };
        let a = kmeans(&data, 64, 4, &config).unwrap();
        let b = kmeans(&data, 64, 4, &config).unwrap();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.assignments, b.assignments);
    }

    #[test]
    fn rejects_underpopulated_input() {
        let data = vec![0.0f32; 8];
        let config = KMeansConfig {
            n_clusters: 5,
            ..Default::default()
        };
        assert!(kmeans(&data, 2, 4, &config).is_err());
    }
}
