#![allow(missing_docs)]

use grafito::{
    DijkstraConfig, Direction, GraphDB, Options, PropValue, SyncMode, TraversalStep,
    TraverseOptions,
};
use tempfile::tempdir;

fn open_opts() -> Options {
    Options::default().sync_mode(SyncMode::Normal)
}

struct Triangle {
    db: GraphDB,
    a: u64,
    b: u64,
    c: u64,
    etype: u32,
    weight: u32,
}

/// Nodes a, b, c keyed by name; edges (a->b), (b->c), (a->c), all one type.
fn triangle(path: &std::path::Path) -> Triangle {
    let db = GraphDB::open(path, open_opts()).unwrap();
    let mut tx = db.begin(false).unwrap();
    let etype = tx.get_or_create_etype("LINK").unwrap();
    let weight = tx.get_or_create_propkey("weight").unwrap();
    let a = tx.create_node(Some("a")).unwrap();
    let b = tx.create_node(Some("b")).unwrap();
    let c = tx.create_node(Some("c")).unwrap();
    tx.add_edge(a, etype, b).unwrap();
    tx.add_edge(b, etype, c).unwrap();
    tx.add_edge(a, etype, c).unwrap();
    tx.commit().unwrap();
    Triangle {
        db,
        a,
        b,
        c,
        etype,
        weight,
    }
}

#[test]
fn dijkstra_without_weights_takes_the_direct_edge() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("unweighted.gfo"));
    let result = t
        .db
        .dijkstra(&DijkstraConfig::new(t.a, t.c), Some(t.weight));
    assert!(result.found);
    assert_eq!(result.path, vec![t.a, t.c]);
    assert_eq!(result.total_weight, 1.0);
    assert_eq!(result.edges.len(), 1);
}

#[test]
fn dijkstra_with_weights_prefers_the_cheap_detour() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("weighted.gfo"));
    let mut tx = t.db.begin(false).unwrap();
    tx.set_edge_prop(t.a, t.etype, t.b, t.weight, PropValue::Int(1))
        .unwrap();
    tx.set_edge_prop(t.b, t.etype, t.c, t.weight, PropValue::Int(1))
        .unwrap();
    tx.set_edge_prop(t.a, t.etype, t.c, t.weight, PropValue::Float(3.0))
        .unwrap();
    tx.commit().unwrap();

    let result = t
        .db
        .dijkstra(&DijkstraConfig::new(t.a, t.c), Some(t.weight));
    assert!(result.found);
    assert_eq!(result.path, vec![t.a, t.b, t.c]);
    assert_eq!(result.total_weight, 2.0);
    assert_eq!(result.edges.len(), 2);
}

#[test]
fn non_numeric_weights_fall_back_to_one() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("nonnumeric.gfo"));
    let mut tx = t.db.begin(false).unwrap();
    tx.set_edge_prop(t.a, t.etype, t.c, t.weight, PropValue::String("heavy".into()))
        .unwrap();
    tx.commit().unwrap();

    // The string weight counts as 1, so the direct edge still wins.
    let result = t
        .db
        .dijkstra(&DijkstraConfig::new(t.a, t.c), Some(t.weight));
    assert_eq!(result.path, vec![t.a, t.c]);
    assert_eq!(result.total_weight, 1.0);
}

#[test]
fn bfs_and_has_path() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("bfs.gfo"));
    let result = t.db.bfs(t.a, t.c, Some(&[t.etype]), 10);
    assert!(result.found);
    assert_eq!(result.path, vec![t.a, t.c], "fewest hops wins");

    assert!(t.db.has_path(t.a, t.c, 10));
    assert!(!t.db.has_path(t.c, t.a, 10), "edges are directed");
}

#[test]
fn k_shortest_enumerates_both_routes() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("yen.gfo"));
    let mut tx = t.db.begin(false).unwrap();
    tx.set_edge_prop(t.a, t.etype, t.c, t.weight, PropValue::Int(3))
        .unwrap();
    tx.commit().unwrap();

    let results = t
        .db
        .k_shortest(&DijkstraConfig::new(t.a, t.c), 3, Some(t.weight));
    assert_eq!(results.len(), 2, "only two simple paths exist");
    assert_eq!(results[0].path, vec![t.a, t.b, t.c]);
    assert_eq!(results[0].total_weight, 2.0);
    assert_eq!(results[1].path, vec![t.a, t.c]);
    assert_eq!(results[1].total_weight, 3.0);
}

#[test]
fn traversal_steps_and_depth_windows() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("traverse.gfo"));

    let one_hop = t.db.traverse(
        &[t.a],
        &[TraversalStep {
            direction: Direction::Out,
            etype: Some(t.etype),
        }],
        true,
    );
    let nodes: Vec<_> = one_hop.iter().map(|r| r.node_id).collect();
    assert_eq!(nodes, vec![t.b, t.c]);
    assert!(one_hop.iter().all(|r| r.depth == 1 && r.edge.is_some()));

    let two_hops = t.db.traverse(
        &[t.a],
        &[
            TraversalStep {
                direction: Direction::Out,
                etype: Some(t.etype),
            },
            TraversalStep {
                direction: Direction::In,
                etype: Some(t.etype),
            },
        ],
        false,
    );
    // Out reaches {b, c}; In from b reaches {a}, In from c reaches {a, b}.
    let nodes: Vec<_> = two_hops.iter().map(|r| r.node_id).collect();
    assert_eq!(nodes, vec![t.a, t.a, t.b]);

    let window = t.db.traverse_depth(
        &[t.a],
        Some(t.etype),
        TraverseOptions {
            direction: Direction::Out,
            min_depth: 2,
            max_depth: 3,
            unique: false,
        },
    );
    // Depth 2: a->b->c and a->c->(nothing); only c at depth 2.
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].node_id, t.c);
    assert_eq!(window[0].depth, 2);
}

#[test]
fn reachability_and_deleted_nodes() {
    let dir = tempdir().expect("tmpdir");
    let t = triangle(&dir.path().join("reach.gfo"));
    assert_eq!(t.db.reachable_nodes(t.a, 10, None), vec![t.a, t.b, t.c]);
    assert_eq!(t.db.reachable_nodes(t.c, 10, None), vec![t.c]);

    let mut tx = t.db.begin(false).unwrap();
    tx.delete_node(t.b).unwrap();
    tx.commit().unwrap();

    assert_eq!(t.db.reachable_nodes(t.a, 10, None), vec![t.a, t.c]);
    assert!(t.db.neighbors_out(t.b, None).is_empty());
    let result = t.db.dijkstra(&DijkstraConfig::new(t.a, t.c), None);
    assert_eq!(result.path, vec![t.a, t.c]);
}

#[test]
fn self_loops_are_explored() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("loops.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();
    let mut tx = db.begin(false).unwrap();
    let rel = tx.get_or_create_etype("REL").unwrap();
    let n = tx.create_node(Some("n")).unwrap();
    tx.add_edge(n, rel, n).unwrap();
    tx.commit().unwrap();

    let out = db.neighbors_out(n, None);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].src, n);
    assert_eq!(out[0].dst, n);

    let results = db.traverse(
        &[n],
        &[TraversalStep {
            direction: Direction::Out,
            etype: None,
        }],
        false,
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node_id, n);
    assert_eq!(db.reachable_nodes(n, 5, None), vec![n]);
}

#[test]
fn merged_neighbors_combine_snapshot_and_delta() {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("merged.gfo");
    let db = GraphDB::open(&path, open_opts()).unwrap();

    let mut tx = db.begin(false).unwrap();
    let rel = tx.get_or_create_etype("REL").unwrap();
    let hub = tx.create_node(Some("hub")).unwrap();
    let s1 = tx.create_node(Some("s1")).unwrap();
    let s2 = tx.create_node(Some("s2")).unwrap();
    tx.add_edge(hub, rel, s1).unwrap();
    tx.add_edge(hub, rel, s2).unwrap();
    tx.commit().unwrap();
    db.checkpoint().unwrap();

    // Post-checkpoint delta: delete one snapshot edge, add a new one.
    let mut tx = db.begin(false).unwrap();
    let s3 = tx.create_node(Some("s3")).unwrap();
    tx.delete_edge(hub, rel, s1).unwrap();
    tx.add_edge(hub, rel, s3).unwrap();
    tx.commit().unwrap();

    let out: Vec<_> = db.neighbors_out(hub, None).iter().map(|e| e.dst).collect();
    assert_eq!(out, vec![s2, s3], "sorted merge of snapshot minus delta");
    assert!(db.edge_exists(hub, rel, s2));
    assert!(!db.edge_exists(hub, rel, s1));
    assert!(db.edge_exists(hub, rel, s3));
}
