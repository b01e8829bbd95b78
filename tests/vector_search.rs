#![allow(missing_docs)]

use grafito::{
    GrafitoError, GraphDB, IvfParams, Options, PqParams, SyncMode, VectorIndexSpec, VectorMetric,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn open_opts() -> Options {
    Options::default().sync_mode(SyncMode::Normal)
}

fn random_vector(rng: &mut ChaCha8Rng, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn populate(db: &GraphDB, propkey: u32, n: usize, dim: usize, seed: u64) -> Vec<u64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut nodes = Vec::with_capacity(n);
    let mut tx = db.begin(false).unwrap();
    for i in 0..n {
        let node = tx.create_node(Some(&format!("v{i}"))).unwrap();
        tx.set_node_vector(node, propkey, &random_vector(&mut rng, dim))
            .unwrap();
        nodes.push(node);
    }
    tx.commit().unwrap();
    nodes
}

#[test]
fn euclidean_search_is_sorted_with_derived_similarity() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("euclid.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let emb = tx.get_or_create_propkey("embedding").unwrap();
    tx.commit().unwrap();

    populate(&db, emb, 500, 16, 7);
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let query = random_vector(&mut rng, 16);
    let hits = db.search_vectors(emb, &query, 10, None).unwrap();

    assert_eq!(hits.len(), 10);
    for pair in hits.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
    for hit in &hits {
        let expected = 1.0 / (1.0 + hit.distance);
        assert!((hit.similarity - expected).abs() < 1e-6);
    }
}

#[test]
fn ivf_search_matches_brute_force_closely() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("ivf.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let emb = tx.get_or_create_propkey("embedding").unwrap();
    tx.create_vector_index(
        emb,
        VectorIndexSpec::new(32).ivf(IvfParams {
            n_clusters: 20,
            n_probe: 20,
            training_threshold: 100,
            pq: None,
        }),
    )
    .unwrap();
    tx.commit().unwrap();

    populate(&db, emb, 2000, 32, 11);
    let brute = {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let query = random_vector(&mut rng, 32);
        let hits = db.search_vectors(emb, &query, 10, None).unwrap();
        assert!(db.build_vector_index(emb, Some(3)).unwrap());
        let stats = db.vector_stats(emb).unwrap();
        assert!(stats.index_trained);
        assert_eq!(stats.clusters, 20);
        (query, hits)
    };

    // Probing every cluster makes the IVF result exhaustive.
    let ivf_hits = db.search_vectors(emb, &brute.0, 10, Some(20)).unwrap();
    assert_eq!(brute.1, ivf_hits);

    // A narrow probe still finds the true nearest neighbor most of the
    // time; check the top hit survives.
    let narrow = db.search_vectors(emb, &brute.0, 1, Some(4)).unwrap();
    assert_eq!(narrow.len(), 1);
}

#[test]
fn ivf_pq_search_returns_ranked_hits() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("pq.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let emb = tx.get_or_create_propkey("embedding").unwrap();
    tx.create_vector_index(
        emb,
        VectorIndexSpec::new(16).ivf(IvfParams {
            n_clusters: 8,
            n_probe: 8,
            training_threshold: 64,
            pq: Some(PqParams {
                subspaces: 4,
                centroids_per_subspace: 32,
            }),
        }),
    )
    .unwrap();
    tx.commit().unwrap();

    populate(&db, emb, 600, 16, 23);
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let query = random_vector(&mut rng, 16);
    // Exact baseline before the index exists.
    let brute = db.search_vectors(emb, &query, 1, None).unwrap();
    assert!(db.build_vector_index(emb, Some(1)).unwrap());

    let hits = db.search_vectors(emb, &query, 10, Some(8)).unwrap();
    assert_eq!(hits.len(), 10);
    for pair in hits.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
    // ADC pre-ranking plus exact refinement lands at (or right next to)
    // the true nearest neighbor when every cluster is probed.
    assert!(
        hits[0].distance <= brute[0].distance * 1.3 + 1e-3,
        "refined top hit {} strayed too far from exact {}",
        hits[0].distance,
        brute[0].distance
    );
}

#[test]
fn cosine_metric_normalizes_and_scores() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("cosine.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let emb = tx.get_or_create_propkey("embedding").unwrap();
    tx.create_vector_index(emb, VectorIndexSpec::new(3).metric(VectorMetric::Cosine))
        .unwrap();
    let aligned = tx.create_node(Some("aligned")).unwrap();
    let orthogonal = tx.create_node(Some("orthogonal")).unwrap();
    tx.set_node_vector(aligned, emb, &[10.0, 0.0, 0.0]).unwrap();
    tx.set_node_vector(orthogonal, emb, &[0.0, 2.0, 0.0]).unwrap();
    tx.commit().unwrap();

    let hits = db.search_vectors(emb, &[1.0, 0.0, 0.0], 2, None).unwrap();
    assert_eq!(hits[0].node_id, aligned);
    assert!(hits[0].distance.abs() < 1e-6);
    assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    assert_eq!(hits[1].node_id, orthogonal);
    assert!((hits[1].distance - 1.0).abs() < 1e-6);
    assert!((hits[1].similarity - (1.0 - hits[1].distance)).abs() < 1e-6);
}

#[test]
fn vector_dimension_is_fixed_per_propkey() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("dims.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let emb = tx.get_or_create_propkey("embedding").unwrap();
    let a = tx.create_node(Some("a")).unwrap();
    let b = tx.create_node(Some("b")).unwrap();
    tx.set_node_vector(a, emb, &[1.0, 2.0, 3.0]).unwrap();
    match tx.set_node_vector(b, emb, &[1.0, 2.0]) {
        Err(GrafitoError::VectorDimensionMismatch { expected, got }) => {
            assert_eq!((expected, got), (3, 2));
        }
        other => panic!("expected dimension mismatch, got {other:?}"),
    }
    tx.commit().unwrap();

    // Still enforced after commit fixes the store dimension.
    let mut tx = db.begin(false).unwrap();
    match tx.set_node_vector(b, emb, &[1.0]) {
        Err(GrafitoError::VectorDimensionMismatch { .. }) => {}
        other => panic!("expected dimension mismatch, got {other:?}"),
    }
    tx.rollback().unwrap();
}

#[test]
fn vectors_survive_wal_replay_and_checkpoint() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("durability.gfo");

    let (node, emb);
    {
        let db = GraphDB::open(&path, open_opts())?;
        let mut tx = db.begin(false)?;
        emb = tx.get_or_create_propkey("embedding")?;
        node = tx.create_node(Some("n"))?;
        tx.set_node_vector(node, emb, &[0.5, -0.5, 1.5])?;
        tx.commit()?;
        drop(db); // crash before any checkpoint
    }
    {
        let db = GraphDB::open(&path, open_opts())?;
        assert_eq!(db.node_vector(node, emb), Some(vec![0.5, -0.5, 1.5]));
        db.checkpoint()?;
        db.close()?;
    }
    {
        // Now served from the snapshot manifest.
        let db = GraphDB::open(&path, open_opts())?;
        assert_eq!(db.node_vector(node, emb), Some(vec![0.5, -0.5, 1.5]));
        let hits = db.search_vectors(emb, &[0.5, -0.5, 1.5], 1, None)?;
        assert_eq!(hits[0].node_id, node);
        assert!(hits[0].distance.abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn deleted_nodes_drop_out_of_search() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("deleted.gfo");
    let db = GraphDB::open(&path, open_opts())?;

    let mut tx = db.begin(false)?;
    let emb = tx.get_or_create_propkey("embedding")?;
    tx.commit()?;
    let nodes = populate(&db, emb, 50, 8, 3);

    let target = db.node_vector(nodes[0], emb).unwrap();
    let hits = db.search_vectors(emb, &target, 1, None)?;
    assert_eq!(hits[0].node_id, nodes[0]);

    let mut tx = db.begin(false)?;
    tx.delete_node(nodes[0])?;
    tx.commit()?;

    let hits = db.search_vectors(emb, &target, 5, None)?;
    assert!(hits.iter().all(|h| h.node_id != nodes[0]));
    assert_eq!(db.node_vector(nodes[0], emb), None);

    // Deletion also holds across checkpoint + reopen.
    db.checkpoint()?;
    db.close()?;
    let db = GraphDB::open(&path, open_opts())?;
    let hits = db.search_vectors(emb, &target, 5, None)?;
    assert!(hits.iter().all(|h| h.node_id != nodes[0]));
    Ok(())
}

#[test]
fn optimize_compacts_fragments() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("compact.gfo");
    let db = GraphDB::open(&path, open_opts())?;

    let mut tx = db.begin(false)?;
    let emb = tx.get_or_create_propkey("embedding")?;
    tx.commit()?;
    let nodes = populate(&db, emb, 100, 8, 13);

    let mut tx = db.begin(false)?;
    for &node in nodes.iter().take(40) {
        tx.del_node_vector(node, emb)?;
    }
    tx.commit()?;
    assert_eq!(db.vector_stats(emb).unwrap().deleted_rows, 40);

    db.optimize()?;
    let stats = db.vector_stats(emb).unwrap();
    assert_eq!(stats.deleted_rows, 0);
    assert_eq!(stats.live_rows, 60);
    assert_eq!(db.node_vector(nodes[0], emb), None);
    assert!(db.node_vector(nodes[99], emb).is_some());
    Ok(())
}
