//! Immutable CSR snapshot: on-disk layout shared by writer and reader.
//!
//! A snapshot is one contiguous byte run inside the container: a fixed
//! header, a section table, then 8-byte-aligned section payloads. Every
//! section carries its own CRC in the table entry; the header carries a CRC
//! over its fixed fields. Adjacency is stored in Compressed Sparse Row form
//! for both directions, sorted by (etype, neighbor) within each node's
//! slice.

pub mod reader;
pub mod writer;

pub use reader::Snapshot;
pub use writer::{build_snapshot, EdgeData, NodeData, SnapshotInput};

/// Magic at the start of a snapshot run ("GFS1").
pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"GFS1");
/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;
/// Fixed snapshot header length.
pub const SNAPSHOT_HEADER_LEN: usize = 64;
/// Bytes per section table entry: offset, length, crc, padding.
pub const SECTION_ENTRY_LEN: usize = 24;
/// Alignment of section payloads.
pub const SECTION_ALIGN: usize = 8;
/// Bytes per encoded property value: tag, padding, payload word.
pub const PROP_VALUE_LEN: usize = 16;
/// Bytes per key-index entry: hash, stringId, padding, NodeId.
pub const KEY_ENTRY_LEN: usize = 24;

/// Section identifiers, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionId {
    /// Physical index -> NodeId (u64 each, ascending).
    NodeIds = 0,
    /// Physical index -> key stringId (u32 each, 0 = no key).
    NodeKeys = 1,
    /// Out-CSR offsets (u32, num_nodes + 1).
    OutOffsets = 2,
    /// Out-CSR destination physical indexes (u32).
    OutDst = 3,
    /// Out-CSR edge types (u32).
    OutEtype = 4,
    /// In-CSR offsets (u32, num_nodes + 1).
    InOffsets = 5,
    /// In-CSR source physical indexes (u32).
    InSrc = 6,
    /// In-CSR edge types (u32).
    InEtype = 7,
    /// Node label list offsets (u32, num_nodes + 1).
    NodeLabelOffsets = 8,
    /// Concatenated sorted label ids (u32).
    NodeLabelIds = 9,
    /// Node property offsets (u32, num_nodes + 1).
    NodePropOffsets = 10,
    /// Node property key ids (u32).
    NodePropKeys = 11,
    /// Node property values (16 bytes each).
    NodePropVals = 12,
    /// Edge property offsets (u32, num_edges + 1), indexed by out-CSR edge
    /// position.
    EdgePropOffsets = 13,
    /// Edge property key ids (u32).
    EdgePropKeys = 14,
    /// Edge property values (16 bytes each).
    EdgePropVals = 15,
    /// LabelId -> name stringId (u32, num_labels + 1; slot 0 reserved).
    LabelNames = 16,
    /// ETypeId -> name stringId (u32, num_etypes + 1).
    EtypeNames = 17,
    /// PropKeyId -> name stringId (u32, num_propkeys + 1).
    PropkeyNames = 18,
    /// Key-index bucket offsets (u32, bucket_count + 1).
    KeyBuckets = 19,
    /// Key-index entries (24 bytes each), bucket-contiguous.
    KeyEntries = 20,
    /// Inline vector byte offsets (u64, count + 1).
    VectorOffsets = 21,
    /// Inline vector f32 payloads.
    VectorData = 22,
    /// Serialized vector store manifests.
    VectorManifests = 23,
    /// String table byte offsets (u32, num_strings + 1).
    StringOffsets = 24,
    /// Concatenated UTF-8 string bytes.
    StringBytes = 25,
}

impl SectionId {
    /// Number of sections in the table.
    pub const COUNT: usize = 26;

    /// All ids in table order.
    pub fn all() -> impl Iterator<Item = SectionId> {
        (0..Self::COUNT as u32).map(|i| Self::from_u32(i).unwrap())
    }

    /// Converts a table index back to an id.
    pub fn from_u32(v: u32) -> Option<Self> {
        use SectionId::*;
        Some(match v {
            0 => NodeIds,
            1 => NodeKeys,
            2 => OutOffsets,
            3 => OutDst,
            4 => OutEtype,
            5 => InOffsets,
            6 => InSrc,
            7 => InEtype,
            8 => NodeLabelOffsets,
            9 => NodeLabelIds,
            10 => NodePropOffsets,
            11 => NodePropKeys,
            12 => NodePropVals,
            13 => EdgePropOffsets,
            14 => EdgePropKeys,
            15 => EdgePropVals,
            16 => LabelNames,
            17 => EtypeNames,
            18 => PropkeyNames,
            19 => KeyBuckets,
            20 => KeyEntries,
            21 => VectorOffsets,
            22 => VectorData,
            23 => VectorManifests,
            24 => StringOffsets,
            25 => StringBytes,
            _ => return None,
        })
    }
}

/// Parsed fixed header of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Generation stamped by the producing checkpoint.
    pub generation: u64,
    /// Node count.
    pub num_nodes: u64,
    /// Edge count.
    pub num_edges: u64,
    /// Highest NodeId present.
    pub max_node_id: u64,
    /// Label count.
    pub num_labels: u32,
    /// Edge type count.
    pub num_etypes: u32,
    /// Property key count.
    pub num_propkeys: u32,
    /// String table entries (including the reserved empty string 0).
    pub num_strings: u32,
}
