#![allow(missing_docs)]

use grafito::{GrafitoError, GraphDB, Options, PropValue, SyncMode};
use tempfile::tempdir;

fn open_opts() -> Options {
    Options::default().sync_mode(SyncMode::Normal)
}

fn fixture(path: &std::path::Path) -> (GraphDB, u64, u32) {
    let db = GraphDB::open(path, open_opts()).unwrap();
    let mut tx = db.begin(false).unwrap();
    let age = tx.get_or_create_propkey("age").unwrap();
    let x = tx.create_node(Some("x")).unwrap();
    tx.set_node_prop(x, age, PropValue::Int(10)).unwrap();
    tx.commit().unwrap();
    (db, x, age)
}

#[test]
fn first_committer_wins_on_same_node() {
    let dir = tempdir().expect("tmpdir");
    let (db, x, age) = fixture(&dir.path().join("conflict.gfo"));

    let mut t1 = db.begin(false).unwrap();
    assert_eq!(t1.node_prop(x, age), Some(PropValue::Int(10)));

    let mut t2 = db.begin(false).unwrap();
    t2.set_node_prop(x, age, PropValue::Int(20)).unwrap();
    t2.commit().unwrap();

    t1.set_node_prop(x, age, PropValue::Int(30)).unwrap();
    match t1.commit() {
        Err(GrafitoError::Conflict(_)) => {}
        other => panic!("expected conflict, got {other:?}"),
    }

    // The database holds the first committer's value.
    assert_eq!(db.node_prop(x, age), Some(PropValue::Int(20)));
}

#[test]
fn reader_keeps_its_snapshot_across_concurrent_commits() {
    let dir = tempdir().expect("tmpdir");
    let (db, x, age) = fixture(&dir.path().join("snapshot_reads.gfo"));

    let t1 = db.begin(true).unwrap();
    assert_eq!(t1.node_prop(x, age), Some(PropValue::Int(10)));

    let mut t2 = db.begin(false).unwrap();
    t2.set_node_prop(x, age, PropValue::Int(20)).unwrap();
    t2.commit().unwrap();

    // Committed state moved on; the old reader has not.
    assert_eq!(db.node_prop(x, age), Some(PropValue::Int(20)));
    assert_eq!(t1.node_prop(x, age), Some(PropValue::Int(10)));
    t1.commit().unwrap();

    // A fresh transaction sees the new value.
    let t3 = db.begin(true).unwrap();
    assert_eq!(t3.node_prop(x, age), Some(PropValue::Int(20)));
    t3.commit().unwrap();
}

#[test]
fn reader_still_sees_edges_deleted_after_its_start() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("edge_visibility.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let rel = tx.get_or_create_etype("REL").unwrap();
    let a = tx.create_node(Some("a")).unwrap();
    let b = tx.create_node(Some("b")).unwrap();
    tx.add_edge(a, rel, b).unwrap();
    tx.commit().unwrap();

    let t1 = db.begin(true).unwrap();
    assert!(t1.edge_exists(a, rel, b));

    let mut t2 = db.begin(false).unwrap();
    t2.delete_edge(a, rel, b).unwrap();
    t2.commit().unwrap();

    assert!(!db.edge_exists(a, rel, b));
    assert!(t1.edge_exists(a, rel, b), "old reader keeps the edge");
    let neighbors = t1.neighbors(a, grafito::Direction::Out, None);
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].dst, b);
    t1.commit().unwrap();
}

#[test]
fn reader_lists_edge_props_from_its_snapshot() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("edge_props.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let rel = tx.get_or_create_etype("REL").unwrap();
    let weight = tx.get_or_create_propkey("weight").unwrap();
    let a = tx.create_node(Some("a")).unwrap();
    let b = tx.create_node(Some("b")).unwrap();
    tx.add_edge(a, rel, b).unwrap();
    tx.set_edge_prop(a, rel, b, weight, PropValue::Int(1)).unwrap();
    tx.commit().unwrap();

    let t1 = db.begin(true).unwrap();

    let mut t2 = db.begin(false).unwrap();
    let note = t2.get_or_create_propkey("note").unwrap();
    t2.set_edge_prop(a, rel, b, weight, PropValue::Int(2)).unwrap();
    t2.set_edge_prop(a, rel, b, note, PropValue::String("x".into()))
        .unwrap();
    t2.commit().unwrap();

    // Committed state shows both updates; the old reader sees neither.
    let latest = db.edge_props(a, rel, b);
    assert_eq!(
        latest,
        vec![
            (weight, PropValue::Int(2)),
            (note, PropValue::String("x".into())),
        ]
    );
    assert_eq!(t1.edge_props(a, rel, b), vec![(weight, PropValue::Int(1))]);
    assert_eq!(t1.edge_prop(a, rel, b, note), None);
    t1.commit().unwrap();
}

#[test]
fn reader_does_not_see_nodes_created_after_its_start() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("node_visibility.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    tx.create_node(Some("before")).unwrap();
    tx.commit().unwrap();

    let t1 = db.begin(true).unwrap();

    let mut t2 = db.begin(false).unwrap();
    let late = t2.create_node(Some("after")).unwrap();
    t2.commit().unwrap();

    assert!(db.node_exists(late));
    assert!(!t1.node_exists(late));
    assert_eq!(t1.node_by_key("after"), None);
    assert!(t1.node_by_key("before").is_some());
    t1.commit().unwrap();
}

#[test]
fn own_writes_are_visible_before_commit() {
    let dir = tempdir().expect("tmpdir");
    let (db, x, age) = fixture(&dir.path().join("own_writes.gfo"));

    let mut t1 = db.begin(false).unwrap();
    t1.set_node_prop(x, age, PropValue::Int(77)).unwrap();
    assert_eq!(t1.node_prop(x, age), Some(PropValue::Int(77)));
    // Not visible outside yet.
    assert_eq!(db.node_prop(x, age), Some(PropValue::Int(10)));
    t1.commit().unwrap();
    assert_eq!(db.node_prop(x, age), Some(PropValue::Int(77)));
}

#[test]
fn rollback_discards_everything() {
    let dir = tempdir().expect("tmpdir");
    let (db, x, age) = fixture(&dir.path().join("rollback.gfo"));

    let mut t1 = db.begin(false).unwrap();
    t1.set_node_prop(x, age, PropValue::Int(99)).unwrap();
    let doomed = t1.create_node(Some("doomed")).unwrap();
    t1.rollback().unwrap();

    assert_eq!(db.node_prop(x, age), Some(PropValue::Int(10)));
    assert!(!db.node_exists(doomed));
    assert_eq!(db.node_by_key("doomed").unwrap(), None);

    // Dropping an uncommitted transaction behaves like rollback.
    {
        let mut t2 = db.begin(false).unwrap();
        t2.set_node_prop(x, age, PropValue::Int(1)).unwrap();
    }
    assert_eq!(db.node_prop(x, age), Some(PropValue::Int(10)));
}

#[test]
fn disjoint_writers_both_commit() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("disjoint.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut setup = db.begin(false).unwrap();
    let age = setup.get_or_create_propkey("age").unwrap();
    let a = setup.create_node(Some("a")).unwrap();
    let b = setup.create_node(Some("b")).unwrap();
    setup.commit().unwrap();

    let mut t1 = db.begin(false).unwrap();
    let mut t2 = db.begin(false).unwrap();
    t1.set_node_prop(a, age, PropValue::Int(1)).unwrap();
    t2.set_node_prop(b, age, PropValue::Int(2)).unwrap();
    t2.commit().unwrap();
    t1.commit().unwrap();

    assert_eq!(db.node_prop(a, age), Some(PropValue::Int(1)));
    assert_eq!(db.node_prop(b, age), Some(PropValue::Int(2)));
}

#[test]
fn gc_prunes_once_readers_finish() {
    let dir = tempdir().expect("tmpdir");
    let (db, x, age) = fixture(&dir.path().join("gc.gfo"));

    let t1 = db.begin(true).unwrap();
    let mut t2 = db.begin(false).unwrap();
    t2.set_node_prop(x, age, PropValue::Int(20)).unwrap();
    t2.commit().unwrap();

    let stats = db.stats().mvcc.unwrap();
    assert_eq!(stats.active_transactions, 1);
    t1.commit().unwrap();

    // The next commit runs opportunistic GC with no readers pinning chains.
    let mut t3 = db.begin(false).unwrap();
    t3.set_node_prop(x, age, PropValue::Int(21)).unwrap();
    t3.commit().unwrap();

    let stats = db.stats().mvcc.unwrap();
    assert_eq!(stats.active_transactions, 0);
    assert!(stats.gc_runs > 0);
    assert!(stats.versions_pruned > 0);
    assert!(stats.last_gc_unix_ms > 0);
}

#[test]
fn conflicting_key_claims_resolve_first_committer_wins() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("keyrace.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut t1 = db.begin(false).unwrap();
    let mut t2 = db.begin(false).unwrap();
    let n2 = t2.create_node(Some("shared")).unwrap();
    let _n1 = t1.create_node(Some("shared")).unwrap();
    t2.commit().unwrap();
    match t1.commit() {
        Err(GrafitoError::Conflict(_)) => {}
        other => panic!("expected key conflict, got {other:?}"),
    }
    assert_eq!(db.node_by_key("shared").unwrap(), Some(n2));
}
