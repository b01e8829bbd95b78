//! Shortest-path queries: BFS by hop count, Dijkstra by edge weight, Yen's
//! k-shortest simple paths, and reachability.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::types::{Direction, ETypeId, Edge, NodeId};

use super::other_endpoint;

/// Configuration for weighted shortest-path queries.
#[derive(Debug, Clone)]
pub struct DijkstraConfig {
    /// Start node.
    pub source: NodeId,
    /// Target node.
    pub target: NodeId,
    /// Edge types allowed on the path; `None` allows every type.
    pub allowed_etypes: Option<Vec<ETypeId>>,
    /// Expansion direction.
    pub direction: Direction,
    /// Hop cap; expansion stops past this depth.
    pub max_depth: usize,
}

impl DijkstraConfig {
    /// Builds a default config from source to target.
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            source,
            target,
            allowed_etypes: None,
            direction: Direction::Out,
            max_depth: 100,
        }
    }

    /// Restricts traversal to one edge type.
    pub fn via(mut self, etype: ETypeId) -> Self {
        self.allowed_etypes.get_or_insert_with(Vec::new).push(etype);
        self
    }

    /// Sets the hop cap.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Sets the expansion direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// Result of a path query.
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    /// Nodes from source to target, inclusive.
    pub path: Vec<NodeId>,
    /// Edges traversed, in order.
    pub edges: Vec<Edge>,
    /// Sum of edge weights along the path.
    pub total_weight: f64,
    /// Whether any path was found.
    pub found: bool,
}

impl PathResult {
    /// The no-path result.
    pub fn not_found() -> Self {
        Self {
            path: Vec::new(),
            edges: Vec::new(),
            total_weight: f64::INFINITY,
            found: false,
        }
    }
}

#[derive(Debug, Clone)]
struct PathState {
    cost: f64,
    depth: usize,
    parent: Option<NodeId>,
    edge: Option<Edge>,
}

struct HeapEntry {
    cost: f64,
    seq: u64,
    node: NodeId,
}

// Min-heap on (cost, insertion order): equal-weight paths resolve to the
// first-discovered one, which follows the sorted (etype, neighbor)
// expansion order.
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then(other.seq.cmp(&self.seq))
    }
}

fn etype_allowed(config: &DijkstraConfig, etype: ETypeId) -> bool {
    match config.allowed_etypes.as_ref() {
        Some(allowed) => allowed.contains(&etype),
        None => true,
    }
}

fn reconstruct(
    states: &FxHashMap<NodeId, PathState>,
    source: NodeId,
    target: NodeId,
) -> PathResult {
    let mut path = vec![target];
    let mut edges = Vec::new();
    let mut current = target;
    while current != source {
        let Some(state) = states.get(&current) else {
            return PathResult::not_found();
        };
        let (Some(parent), Some(edge)) = (state.parent, state.edge) else {
            return PathResult::not_found();
        };
        edges.push(edge);
        path.push(parent);
        current = parent;
    }
    path.reverse();
    edges.reverse();
    PathResult {
        path,
        edges,
        total_weight: states.get(&target).map(|s| s.cost).unwrap_or(0.0),
        found: true,
    }
}

fn dijkstra_filtered<F, W>(
    config: &DijkstraConfig,
    neighbors: &F,
    weight: &W,
    banned_nodes: &FxHashSet<NodeId>,
    banned_edges: &FxHashSet<Edge>,
) -> PathResult
where
    F: Fn(NodeId, Direction, Option<ETypeId>) -> Vec<Edge>,
    W: Fn(&Edge) -> f64,
{
    if banned_nodes.contains(&config.source) {
        return PathResult::not_found();
    }
    let mut states: FxHashMap<NodeId, PathState> = FxHashMap::default();
    let mut settled: FxHashSet<NodeId> = FxHashSet::default();
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    let mut seq = 0u64;

    states.insert(
        config.source,
        PathState {
            cost: 0.0,
            depth: 0,
            parent: None,
            edge: None,
        },
    );
    heap.push(HeapEntry {
        cost: 0.0,
        seq,
        node: config.source,
    });

    while let Some(entry) = heap.pop() {
        let current = entry.node;
        if !settled.insert(current) {
            continue;
        }
        if current == config.target {
            return reconstruct(&states, config.source, config.target);
        }
        let (cost, depth) = {
            let s = &states[&current];
            (s.cost, s.depth)
        };
        if depth >= config.max_depth {
            continue;
        }

        for edge in neighbors(current, config.direction, None) {
            if !etype_allowed(config, edge.etype) || banned_edges.contains(&edge) {
                continue;
            }
            let next = other_endpoint(&edge, current, config.direction);
            if settled.contains(&next) || banned_nodes.contains(&next) {
                continue;
            }
            let next_cost = cost + weight(&edge);
            let improves = states.get(&next).map_or(true, |s| next_cost < s.cost);
            if improves {
                states.insert(
                    next,
                    PathState {
                        cost: next_cost,
                        depth: depth + 1,
                        parent: Some(current),
                        edge: Some(edge),
                    },
                );
                seq += 1;
                heap.push(HeapEntry {
                    cost: next_cost,
                    seq,
                    node: next,
                });
            }
        }
    }
    PathResult::not_found()
}

/// Dijkstra's shortest path. `weight` derives the cost of one edge; the
/// database layer maps a weight property onto it, coercing numeric values
/// and treating anything else as 1.
pub fn dijkstra<F, W>(config: &DijkstraConfig, neighbors: F, weight: W) -> PathResult
where
    F: Fn(NodeId, Direction, Option<ETypeId>) -> Vec<Edge>,
    W: Fn(&Edge) -> f64,
{
    if config.source == config.target {
        return PathResult {
            path: vec![config.source],
            edges: Vec::new(),
            total_weight: 0.0,
            found: true,
        };
    }
    dijkstra_filtered(
        config,
        &neighbors,
        &weight,
        &FxHashSet::default(),
        &FxHashSet::default(),
    )
}

/// Breadth-first shortest path by hop count. Ties break by neighbor
/// insertion order (snapshot sort order, then delta additions).
pub fn bfs<F>(
    source: NodeId,
    target: NodeId,
    allowed_etypes: Option<&[ETypeId]>,
    max_depth: usize,
    neighbors: F,
) -> PathResult
where
    F: Fn(NodeId, Direction, Option<ETypeId>) -> Vec<Edge>,
{
    if source == target {
        return PathResult {
            path: vec![source],
            edges: Vec::new(),
            total_weight: 0.0,
            found: true,
        };
    }
    let mut parents: FxHashMap<NodeId, (NodeId, Edge)> = FxHashMap::default();
    let mut visited: FxHashSet<NodeId> = FxHashSet::default();
    visited.insert(source);
    let mut frontier = vec![source];
    let mut depth = 0usize;

    while !frontier.is_empty() && depth < max_depth {
        depth += 1;
        let mut next = Vec::new();
        for &node in &frontier {
            for edge in neighbors(node, Direction::Out, None) {
                if let Some(allowed) = allowed_etypes {
                    if !allowed.contains(&edge.etype) {
                        continue;
                    }
                }
                let reached = other_endpoint(&edge, node, Direction::Out);
                if !visited.insert(reached) {
                    continue;
                }
                parents.insert(reached, (node, edge));
                if reached == target {
                    let mut path = vec![target];
                    let mut edges = Vec::new();
                    let mut current = target;
                    while current != source {
                        let (parent, edge) = parents[&current];
                        edges.push(edge);
                        path.push(parent);
                        current = parent;
                    }
                    path.reverse();
                    edges.reverse();
                    let total_weight = edges.len() as f64;
                    return PathResult {
                        path,
                        edges,
                        total_weight,
                        found: true,
                    };
                }
                next.push(reached);
            }
        }
        frontier = next;
    }
    PathResult::not_found()
}

/// Yen's algorithm: up to `k` shortest simple paths, enumerated through
/// deviations of the previous best path.
pub fn k_shortest<F, W>(config: &DijkstraConfig, k: usize, neighbors: F, weight: W) -> Vec<PathResult>
where
    F: Fn(NodeId, Direction, Option<ETypeId>) -> Vec<Edge>,
    W: Fn(&Edge) -> f64,
{
    let mut found: Vec<PathResult> = Vec::new();
    if k == 0 {
        return found;
    }
    let first = dijkstra(config, &neighbors, &weight);
    if !first.found {
        return found;
    }
    found.push(first);

    let mut candidates: Vec<PathResult> = Vec::new();
    while found.len() < k {
        let previous = found.last().unwrap().clone();
        for spur_idx in 0..previous.path.len().saturating_sub(1) {
            let spur_node = previous.path[spur_idx];
            let root_path = &previous.path[..=spur_idx];
            let root_edges = &previous.edges[..spur_idx];

            // Ban edges that would retrace any accepted path sharing this
            // root, and ban root nodes to keep paths simple.
            let mut banned_edges: FxHashSet<Edge> = FxHashSet::default();
            for accepted in &found {
                if accepted.path.len() > spur_idx && accepted.path[..=spur_idx] == *root_path {
                    if let Some(&edge) = accepted.edges.get(spur_idx) {
                        banned_edges.insert(edge);
                    }
                }
            }
            let banned_nodes: FxHashSet<NodeId> =
                root_path[..spur_idx].iter().copied().collect();

            let spur_config = DijkstraConfig {
                source: spur_node,
                ..config.clone()
            };
            let spur = dijkstra_filtered(&spur_config, &neighbors, &weight, &banned_nodes, &banned_edges);
            if !spur.found {
                continue;
            }

            let root_weight: f64 = root_edges.iter().map(|e| weight(e)).sum();
            let mut path = root_path.to_vec();
            path.extend_from_slice(&spur.path[1..]);
            let mut edges = root_edges.to_vec();
            edges.extend_from_slice(&spur.edges);
            let candidate = PathResult {
                path,
                edges,
                total_weight: root_weight + spur.total_weight,
                found: true,
            };
            if !found.iter().any(|p| p.path == candidate.path)
                && !candidates.iter().any(|p| p.path == candidate.path)
            {
                candidates.push(candidate);
            }
        }

        if candidates.is_empty() {
            break;
        }
        candidates.sort_by(|a, b| {
            a.total_weight
                .total_cmp(&b.total_weight)
                .then_with(|| a.path.cmp(&b.path))
        });
        found.push(candidates.remove(0));
    }
    found
}

/// Collects every node reachable from `source` within `max_depth` hops.
pub fn reachable_nodes<F>(
    source: NodeId,
    max_depth: usize,
    etype: Option<ETypeId>,
    neighbors: F,
) -> Vec<NodeId>
where
    F: Fn(NodeId, Direction, Option<ETypeId>) -> Vec<Edge>,
{
    let mut visited: FxHashSet<NodeId> = FxHashSet::default();
    visited.insert(source);
    let mut frontier = vec![source];
    for _ in 0..max_depth {
        let mut next = Vec::new();
        for &node in &frontier {
            for edge in neighbors(node, Direction::Out, etype) {
                let reached = other_endpoint(&edge, node, Direction::Out);
                if visited.insert(reached) {
                    next.push(reached);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    let mut out: Vec<NodeId> = visited.into_iter().collect();
    out.sort_unstable();
    out
}
