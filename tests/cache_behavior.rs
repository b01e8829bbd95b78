#![allow(missing_docs)]

use std::time::Duration;

use grafito::{CacheOptions, GraphDB, Options, PropValue, SyncMode};
use tempfile::tempdir;

fn open_opts() -> Options {
    Options::default().sync_mode(SyncMode::Normal)
}

#[test]
fn repeated_prop_reads_hit_the_cache() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("hits.gfo");
    let db = GraphDB::open(&path, open_opts())?;

    let mut tx = db.begin(false)?;
    let age = tx.get_or_create_propkey("age")?;
    let n = tx.create_node(Some("n"))?;
    tx.set_node_prop(n, age, PropValue::Int(30))?;
    tx.commit()?;
    db.cache_reset_stats();

    for _ in 0..1000 {
        assert_eq!(db.node_prop(n, age), Some(PropValue::Int(30)));
    }
    let stats = db.cache_stats().unwrap();
    assert_eq!(stats.node_props.misses, 1, "only the first read misses");
    assert_eq!(stats.node_props.hits, 999);
    assert!((stats.overall_hit_rate - 0.999).abs() < 1e-6);
    Ok(())
}

#[test]
fn cache_does_not_change_results() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let build = |path: &std::path::Path, cache: Option<CacheOptions>| -> grafito::Result<GraphDB> {
        let db = GraphDB::open(path, open_opts().cache(cache))?;
        let mut tx = db.begin(false)?;
        let rel = tx.get_or_create_etype("REL")?;
        let score = tx.get_or_create_propkey("score")?;
        let nodes: Vec<_> = (0..20)
            .map(|i| tx.create_node(Some(&format!("n{i}"))).unwrap())
            .collect();
        for (i, &n) in nodes.iter().enumerate() {
            tx.set_node_prop(n, score, PropValue::Int(i as i64))?;
            tx.add_edge(n, rel, nodes[(i + 3) % nodes.len()])?;
        }
        tx.commit()?;
        Ok(db)
    };

    let cached = build(&dir.path().join("cached.gfo"), Some(CacheOptions::default()))?;
    let uncached = build(&dir.path().join("uncached.gfo"), None)?;

    let score = cached.propkey_id("score").unwrap();
    for key in (0..20).map(|i| format!("n{i}")) {
        let a = cached.node_by_key(&key)?;
        let b = uncached.node_by_key(&key)?;
        assert_eq!(a, b);
        let node = a.unwrap();
        // Read twice so the second cached read is served from cache.
        assert_eq!(cached.node_prop(node, score), uncached.node_prop(node, score));
        assert_eq!(cached.node_prop(node, score), uncached.node_prop(node, score));
        assert_eq!(
            cached.neighbors_out(node, None),
            uncached.neighbors_out(node, None)
        );
        assert_eq!(
            cached.neighbors_out(node, None),
            uncached.neighbors_out(node, None)
        );
    }
    assert!(uncached.cache_stats().is_none());
    Ok(())
}

#[test]
fn mutations_invalidate_stale_entries() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("invalidate.gfo");
    let db = GraphDB::open(&path, open_opts())?;

    let mut tx = db.begin(false)?;
    let rel = tx.get_or_create_etype("REL")?;
    let age = tx.get_or_create_propkey("age")?;
    let a = tx.create_node(Some("a"))?;
    let b = tx.create_node(Some("b"))?;
    tx.set_node_prop(a, age, PropValue::Int(1))?;
    tx.add_edge(a, rel, b)?;
    tx.commit()?;

    // Warm every cache.
    assert_eq!(db.node_prop(a, age), Some(PropValue::Int(1)));
    assert_eq!(db.node_by_key("a")?, Some(a));
    assert_eq!(db.neighbors_out(a, None).len(), 1);

    let mut tx = db.begin(false)?;
    tx.set_node_prop(a, age, PropValue::Int(2))?;
    tx.delete_edge(a, rel, b)?;
    tx.commit()?;

    assert_eq!(db.node_prop(a, age), Some(PropValue::Int(2)));
    assert!(db.neighbors_out(a, None).is_empty());

    // Key cache invalidation on delete.
    let mut tx = db.begin(false)?;
    tx.delete_node(a)?;
    tx.commit()?;
    assert_eq!(db.node_by_key("a")?, None);
    assert_eq!(db.node_prop(a, age), None);
    Ok(())
}

#[test]
fn verified_absent_is_cached() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("absent.gfo");
    let db = GraphDB::open(&path, open_opts())?;

    let mut tx = db.begin(false)?;
    let age = tx.get_or_create_propkey("age")?;
    let n = tx.create_node(Some("n"))?;
    tx.commit()?;
    db.cache_reset_stats();

    assert_eq!(db.node_prop(n, age), None);
    assert_eq!(db.node_prop(n, age), None);
    let stats = db.cache_stats().unwrap();
    assert_eq!(stats.node_props.misses, 1);
    assert_eq!(stats.node_props.hits, 1, "absent values are cached too");
    Ok(())
}

#[test]
fn query_cache_serves_fingerprinted_results() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("query.gfo");
    let db = GraphDB::open(
        &path,
        open_opts().cache(Some(CacheOptions {
            query_ttl: Some(Duration::from_secs(60)),
            ..Default::default()
        })),
    )?;

    let mut tx = db.begin(false)?;
    for i in 0..5 {
        tx.create_node(Some(&format!("n{i}")))?;
    }
    tx.commit()?;

    let mut computed = 0u32;
    let first = db.cached_query("nodes:all", || {
        computed += 1;
        db.list_nodes()
    });
    let second = db.cached_query("nodes:all", || {
        computed += 1;
        db.list_nodes()
    });
    assert_eq!(computed, 1, "second call is served from cache");
    assert_eq!(*first, *second);
    assert_eq!(first.len(), 5);

    // Content-addressed: the query cache is never invalidated by identity,
    // only cleared wholesale.
    let mut tx = db.begin(false)?;
    tx.create_node(Some("n5"))?;
    tx.commit()?;
    let stale = db.cached_query("nodes:all", || {
        db.list_nodes()
    });
    assert_eq!(stale.len(), 5, "cached payload is returned as-is");
    db.cache_clear_query();
    let fresh = db.cached_query("nodes:all", || db.list_nodes());
    assert_eq!(fresh.len(), 6);
    Ok(())
}

#[test]
fn truncated_traversal_entries_fall_back() -> grafito::Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("truncated.gfo");
    let db = GraphDB::open(
        &path,
        open_opts().cache(Some(CacheOptions {
            traversal_entry_cap: 4,
            ..Default::default()
        })),
    )?;

    let mut tx = db.begin(false)?;
    let rel = tx.get_or_create_etype("REL")?;
    let hub = tx.create_node(Some("hub"))?;
    for i in 0..20 {
        let spoke = tx.create_node(Some(&format!("s{i}")))?;
        tx.add_edge(hub, rel, spoke)?;
    }
    tx.commit()?;

    // Larger than the per-entry cap: full results on every read.
    assert_eq!(db.neighbors_out(hub, None).len(), 20);
    assert_eq!(db.neighbors_out(hub, None).len(), 20);
    Ok(())
}
