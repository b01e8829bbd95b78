//! # Grafito - Embedded Graph Database with Vector Search
//!
//! Grafito is an embedded graph database persisted in a single file. It stores
//! typed nodes, typed directed edges, string-keyed lookups, scalar and vector
//! properties, and labels, and serves point lookups, traversals, shortest
//! paths, and approximate nearest-neighbor search.
//!
//! ## Quick Start
//!
//! ```no_run
//! use grafito::{GraphDB, Options, PropValue};
//!
//! let db = GraphDB::open("social.gfo", Options::default())?;
//!
//! let mut tx = db.begin(false)?;
//! let knows = tx.get_or_create_etype("KNOWS")?;
//! let age = tx.get_or_create_propkey("age")?;
//! let alice = tx.create_node(Some("alice"))?;
//! let bob = tx.create_node(Some("bob"))?;
//! tx.add_edge(alice, knows, bob)?;
//! tx.set_node_prop(alice, age, PropValue::Int(30))?;
//! tx.commit()?;
//!
//! assert_eq!(db.node_by_key("alice")?, Some(alice));
//! # Ok::<(), grafito::GrafitoError>(())
//! ```
//!
//! ## Architecture
//!
//! Committed state lives in two places: an immutable on-disk snapshot in
//! Compressed Sparse Row form, and an in-memory delta of changes not yet
//! folded into a snapshot. Mutations are logged to a write-ahead log inside
//! the container file before they become visible; a checkpoint merges
//! snapshot and delta into a new snapshot and truncates the WAL. Two WAL
//! regions allow writes to continue while a checkpoint runs. Transactions
//! get snapshot isolation from an MVCC layer with first-committer-wins
//! conflict resolution.

pub mod db;
pub mod error;
pub mod primitives;
pub mod query;
pub mod storage;
pub mod types;

pub use crate::db::{CacheOptions, CheckpointStats, GraphDB, Options, SyncMode, Transaction};
pub use crate::error::{GrafitoError, Result};
pub use crate::query::{
    DijkstraConfig, PathResult, TraversalStep, TraverseOptions, TraverseResult,
};
pub use crate::storage::cache::CacheStats;
pub use crate::storage::vstore::{
    IvfParams, PqParams, VectorIndexSpec, VectorMetric, VectorSearchHit, VectorStoreStats,
};
pub use crate::types::{
    DbStats, Direction, ETypeId, Edge, LabelId, MvccStats, NodeId, PropKeyId, PropValue,
};
