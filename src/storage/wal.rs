//! Write-ahead log: frame codec, dual-region bookkeeping, replay.
//!
//! The WAL lives inside the container in two regions. One region is active
//! and receives appends; the other is quiescent so a checkpoint can fold it
//! into the next snapshot while commits continue. Frames are
//! `[type:u8][len:u32][payload][crc:u32]` with the CRC covering type and
//! payload. A transaction's records are buffered and appended contiguously,
//! closed by a `Commit` frame; replay folds complete transactions and
//! discards a truncated tail.

use tracing::{debug, warn};

use crate::error::{GrafitoError, Result};
use crate::primitives::bytes::{put_f32, put_str, put_u32, put_u64, Cursor};
use crate::storage::header::{ContainerFile, WalRegionState};
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::{ETypeId, LabelId, NodeId, PropKeyId, PropValue, TxId};

/// One logged mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// Node creation with optional key.
    CreateNode {
        /// Allocated node id.
        node: NodeId,
        /// Unique key, when assigned.
        key: Option<String>,
    },
    /// Node deletion.
    DeleteNode {
        /// Deleted node id.
        node: NodeId,
    },
    /// Edge addition.
    AddEdge {
        /// Source node.
        src: NodeId,
        /// Edge type.
        etype: ETypeId,
        /// Destination node.
        dst: NodeId,
    },
    /// Edge deletion.
    DeleteEdge {
        /// Source node.
        src: NodeId,
        /// Edge type.
        etype: ETypeId,
        /// Destination node.
        dst: NodeId,
    },
    /// Label definition.
    DefineLabel {
        /// Allocated label id.
        id: LabelId,
        /// Label name.
        name: String,
    },
    /// Edge type definition.
    DefineEtype {
        /// Allocated edge type id.
        id: ETypeId,
        /// Edge type name.
        name: String,
    },
    /// Property key definition.
    DefinePropkey {
        /// Allocated property key id.
        id: PropKeyId,
        /// Property key name.
        name: String,
    },
    /// Node property write.
    SetNodeProp {
        /// Target node.
        node: NodeId,
        /// Property key.
        key: PropKeyId,
        /// New value.
        value: PropValue,
    },
    /// Node property delete.
    DelNodeProp {
        /// Target node.
        node: NodeId,
        /// Property key.
        key: PropKeyId,
    },
    /// Edge property write.
    SetEdgeProp {
        /// Source node.
        src: NodeId,
        /// Edge type.
        etype: ETypeId,
        /// Destination node.
        dst: NodeId,
        /// Property key.
        key: PropKeyId,
        /// New value.
        value: PropValue,
    },
    /// Edge property delete.
    DelEdgeProp {
        /// Source node.
        src: NodeId,
        /// Edge type.
        etype: ETypeId,
        /// Destination node.
        dst: NodeId,
        /// Property key.
        key: PropKeyId,
    },
    /// Label added to a node.
    AddNodeLabel {
        /// Target node.
        node: NodeId,
        /// Added label.
        label: LabelId,
    },
    /// Label removed from a node.
    RemoveNodeLabel {
        /// Target node.
        node: NodeId,
        /// Removed label.
        label: LabelId,
    },
    /// Vector written for a node under a property key.
    SetNodeVector {
        /// Target node.
        node: NodeId,
        /// Vector property key.
        key: PropKeyId,
        /// Dense f32 payload.
        vector: Vec<f32>,
    },
    /// Vector deleted for a node.
    DelNodeVector {
        /// Target node.
        node: NodeId,
        /// Vector property key.
        key: PropKeyId,
    },
    /// Vector store created with an explicit configuration.
    CreateVectorIndex {
        /// Vector property key.
        propkey: PropKeyId,
        /// Serialized [`VectorIndexSpec`](crate::storage::vstore::VectorIndexSpec).
        spec: Vec<u8>,
    },
    /// Vector store fragment sealed at its target size.
    SealFragment {
        /// Vector property key.
        propkey: PropKeyId,
        /// Sealed fragment index.
        fragment: u32,
    },
    /// Vector store fragments compacted (live rows fused).
    CompactFragments {
        /// Vector property key.
        propkey: PropKeyId,
    },
    /// Commit marker closing a transaction.
    Commit {
        /// Committing transaction.
        txid: TxId,
    },
}

impl WalRecord {
    fn type_tag(&self) -> u8 {
        match self {
            WalRecord::CreateNode { .. } => 1,
            WalRecord::DeleteNode { .. } => 2,
            WalRecord::AddEdge { .. } => 3,
            WalRecord::DeleteEdge { .. } => 4,
            WalRecord::DefineLabel { .. } => 5,
            WalRecord::DefineEtype { .. } => 6,
            WalRecord::DefinePropkey { .. } => 7,
            WalRecord::SetNodeProp { .. } => 8,
            WalRecord::DelNodeProp { .. } => 9,
            WalRecord::SetEdgeProp { .. } => 10,
            WalRecord::DelEdgeProp { .. } => 11,
            WalRecord::AddNodeLabel { .. } => 12,
            WalRecord::RemoveNodeLabel { .. } => 13,
            WalRecord::SetNodeVector { .. } => 14,
            WalRecord::DelNodeVector { .. } => 15,
            WalRecord::SealFragment { .. } => 16,
            WalRecord::CompactFragments { .. } => 17,
            WalRecord::Commit { .. } => 18,
            WalRecord::CreateVectorIndex { .. } => 19,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            WalRecord::CreateNode { node, key } => {
                put_u64(out, *node);
                match key {
                    Some(key) => {
                        out.push(1);
                        put_str(out, key);
                    }
                    None => out.push(0),
                }
            }
            WalRecord::DeleteNode { node } => put_u64(out, *node),
            WalRecord::AddEdge { src, etype, dst } | WalRecord::DeleteEdge { src, etype, dst } => {
                put_u64(out, *src);
                put_u32(out, *etype);
                put_u64(out, *dst);
            }
            WalRecord::DefineLabel { id, name }
            | WalRecord::DefineEtype { id, name }
            | WalRecord::DefinePropkey { id, name } => {
                put_u32(out, *id);
                put_str(out, name);
            }
            WalRecord::SetNodeProp { node, key, value } => {
                put_u64(out, *node);
                put_u32(out, *key);
                encode_prop_value(out, value);
            }
            WalRecord::DelNodeProp { node, key } => {
                put_u64(out, *node);
                put_u32(out, *key);
            }
            WalRecord::SetEdgeProp {
                src,
                etype,
                dst,
                key,
                value,
            } => {
                put_u64(out, *src);
                put_u32(out, *etype);
                put_u64(out, *dst);
                put_u32(out, *key);
                encode_prop_value(out, value);
            }
            WalRecord::DelEdgeProp {
                src,
                etype,
                dst,
                key,
            } => {
                put_u64(out, *src);
                put_u32(out, *etype);
                put_u64(out, *dst);
                put_u32(out, *key);
            }
            WalRecord::AddNodeLabel { node, label }
            | WalRecord::RemoveNodeLabel { node, label } => {
                put_u64(out, *node);
                put_u32(out, *label);
            }
            WalRecord::SetNodeVector { node, key, vector } => {
                put_u64(out, *node);
                put_u32(out, *key);
                put_u32(out, vector.len() as u32);
                for &v in vector {
                    put_f32(out, v);
                }
            }
            WalRecord::DelNodeVector { node, key } => {
                put_u64(out, *node);
                put_u32(out, *key);
            }
            WalRecord::SealFragment { propkey, fragment } => {
                put_u32(out, *propkey);
                put_u32(out, *fragment);
            }
            WalRecord::CompactFragments { propkey } => put_u32(out, *propkey),
            WalRecord::Commit { txid } => put_u64(out, *txid),
            WalRecord::CreateVectorIndex { propkey, spec } => {
                put_u32(out, *propkey);
                put_u32(out, spec.len() as u32);
                out.extend_from_slice(spec);
            }
        }
    }

    /// Appends the full frame (type, length, payload, CRC) to `out`. The
    /// CRC covers the type tag and the payload.
    pub fn encode_frame(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);
        let tag = self.type_tag();
        out.push(tag);
        put_u32(out, payload.len() as u32);
        out.extend_from_slice(&payload);
        put_u32(out, frame_crc(tag, &payload));
    }

    fn decode_payload(tag: u8, payload: &[u8]) -> Result<WalRecord> {
        let mut cur = Cursor::new(payload);
        let record = match tag {
            1 => {
                let node = cur.u64()?;
                let key = match cur.u8()? {
                    0 => None,
                    1 => Some(cur.str()?),
                    other => {
                        return Err(GrafitoError::corrupt(format!(
                            "invalid key marker {other} in CreateNode frame"
                        )))
                    }
                };
                WalRecord::CreateNode { node, key }
            }
            2 => WalRecord::DeleteNode { node: cur.u64()? },
            3 | 4 => {
                let src = cur.u64()?;
                let etype = cur.u32()?;
                let dst = cur.u64()?;
                if tag == 3 {
                    WalRecord::AddEdge { src, etype, dst }
                } else {
                    WalRecord::DeleteEdge { src, etype, dst }
                }
            }
            5 | 6 | 7 => {
                let id = cur.u32()?;
                let name = cur.str()?;
                match tag {
                    5 => WalRecord::DefineLabel { id, name },
                    6 => WalRecord::DefineEtype { id, name },
                    _ => WalRecord::DefinePropkey { id, name },
                }
            }
            8 => WalRecord::SetNodeProp {
                node: cur.u64()?,
                key: cur.u32()?,
                value: decode_prop_value(&mut cur)?,
            },
            9 => WalRecord::DelNodeProp {
                node: cur.u64()?,
                key: cur.u32()?,
            },
            10 => WalRecord::SetEdgeProp {
                src: cur.u64()?,
                etype: cur.u32()?,
                dst: cur.u64()?,
                key: cur.u32()?,
                value: decode_prop_value(&mut cur)?,
            },
            11 => WalRecord::DelEdgeProp {
                src: cur.u64()?,
                etype: cur.u32()?,
                dst: cur.u64()?,
                key: cur.u32()?,
            },
            12 => WalRecord::AddNodeLabel {
                node: cur.u64()?,
                label: cur.u32()?,
            },
            13 => WalRecord::RemoveNodeLabel {
                node: cur.u64()?,
                label: cur.u32()?,
            },
            14 => {
                let node = cur.u64()?;
                let key = cur.u32()?;
                let dim = cur.u32()? as usize;
                WalRecord::SetNodeVector {
                    node,
                    key,
                    vector: cur.f32_vec(dim)?,
                }
            }
            15 => WalRecord::DelNodeVector {
                node: cur.u64()?,
                key: cur.u32()?,
            },
            16 => WalRecord::SealFragment {
                propkey: cur.u32()?,
                fragment: cur.u32()?,
            },
            17 => WalRecord::CompactFragments { propkey: cur.u32()? },
            18 => WalRecord::Commit { txid: cur.u64()? },
            19 => {
                let propkey = cur.u32()?;
                let len = cur.u32()? as usize;
                WalRecord::CreateVectorIndex {
                    propkey,
                    spec: cur.take(len)?.to_vec(),
                }
            }
            other => {
                return Err(GrafitoError::corrupt(format!(
                    "unknown WAL record type {other}"
                )))
            }
        };
        if cur.remaining() != 0 {
            return Err(GrafitoError::corrupt(format!(
                "WAL frame type {tag} has {} trailing bytes",
                cur.remaining()
            )));
        }
        Ok(record)
    }
}

/// Encodes a tagged property value for the WAL wire format.
pub(crate) fn encode_prop_value(out: &mut Vec<u8>, value: &PropValue) {
    out.push(value.tag());
    match value {
        PropValue::Null => {}
        PropValue::Bool(b) => out.push(u8::from(*b)),
        PropValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        PropValue::String(s) => put_str(out, s),
        PropValue::Vector(v) => {
            put_u32(out, v.len() as u32);
            for &x in v {
                put_f32(out, x);
            }
        }
    }
}

/// Decodes a tagged property value; total over untrusted bytes.
pub(crate) fn decode_prop_value(cur: &mut Cursor<'_>) -> Result<PropValue> {
    match cur.u8()? {
        0 => Ok(PropValue::Null),
        1 => Ok(PropValue::Bool(cur.u8()? != 0)),
        2 => Ok(PropValue::Int(cur.i64()?)),
        3 => Ok(PropValue::Float(cur.f64()?)),
        4 => Ok(PropValue::String(cur.str()?)),
        5 => {
            let dim = cur.u32()? as usize;
            Ok(PropValue::Vector(cur.f32_vec(dim)?))
        }
        other => Err(GrafitoError::corrupt(format!(
            "unknown property value tag {other}"
        ))),
    }
}

/// In-memory bookkeeping for the two WAL regions.
///
/// Region offsets and lengths come from the header; appends advance the
/// active region's tail. Frames never split across a region boundary: a
/// batch that does not fit forces a region switch (via checkpoint) or a
/// `WalFull` error.
#[derive(Debug, Clone)]
pub struct Wal {
    /// Both regions, mirroring the header fields.
    pub regions: [WalRegionState; 2],
    /// Region receiving appends.
    pub active: u8,
}

impl Wal {
    /// Builds the WAL state from header fields.
    pub fn from_header(regions: [WalRegionState; 2], active: u8) -> Self {
        Self { regions, active }
    }

    /// The active region.
    pub fn active_region(&self) -> &WalRegionState {
        &self.regions[self.active as usize]
    }

    /// Free bytes in the active region.
    pub fn available(&self) -> u64 {
        let region = self.active_region();
        region.len.saturating_sub(region.tail)
    }

    /// Bytes occupied in the active region.
    pub fn used(&self) -> u64 {
        self.active_region().used()
    }

    /// Fraction of the active region occupied, in [0, 1].
    pub fn usage(&self) -> f64 {
        let region = self.active_region();
        if region.len == 0 {
            return 0.0;
        }
        region.used() as f64 / region.len as f64
    }

    /// Whether a batch of `len` bytes fits the active region.
    pub fn fits(&self, len: u64) -> bool {
        len <= self.available()
    }

    /// Appends an encoded frame batch to the active region.
    pub fn append(&mut self, file: &mut ContainerFile, batch: &[u8]) -> Result<()> {
        let len = batch.len() as u64;
        if !self.fits(len) {
            return Err(GrafitoError::WalFull {
                needed: len,
                available: self.available(),
            });
        }
        let region = &mut self.regions[self.active as usize];
        file.write_at(region.offset + region.tail, batch)?;
        region.tail += len;
        Ok(())
    }

    /// Freezes the active region and activates the other, which must be
    /// empty. Returns the frozen region's index.
    pub fn switch_region(&mut self) -> Result<u8> {
        let frozen = self.active;
        let next = 1 - self.active;
        let next_region = &self.regions[next as usize];
        if next_region.used() != 0 {
            return Err(GrafitoError::WalFull {
                needed: 0,
                available: 0,
            });
        }
        self.active = next;
        debug!(frozen = frozen, active = next, "wal.region.switch");
        Ok(frozen)
    }

    /// Resets a region to empty after the checkpoint consuming it completed.
    pub fn clear_region(&mut self, region: u8) {
        let r = &mut self.regions[region as usize];
        r.head = 0;
        r.tail = 0;
    }

    /// Scans one region's frames and groups them into committed
    /// transactions.
    ///
    /// A frame whose bytes run out before its declared length (a torn
    /// trailing write) ends the scan silently, and records after the last
    /// `Commit` are discarded with it. A structurally complete frame whose
    /// CRC does not match, or that decodes to garbage, is real corruption
    /// and surfaces as an error.
    ///
    /// Also returns the byte length of the durable prefix: everything up to
    /// and including the last `Commit` frame. The caller rewinds the
    /// region's tail to this boundary so new appends overwrite a discarded
    /// tail instead of landing beyond it.
    pub fn replay_region(
        file: &mut ContainerFile,
        region: &WalRegionState,
    ) -> Result<(Vec<Vec<WalRecord>>, u64)> {
        let used = region.used();
        if used == 0 {
            return Ok((Vec::new(), 0));
        }
        let mut buf = vec![0u8; used as usize];
        file.read_at(region.offset + region.head, &mut buf)?;

        let mut committed: Vec<Vec<WalRecord>> = Vec::new();
        let mut open: Vec<WalRecord> = Vec::new();
        let mut cur = Cursor::new(&buf);
        let mut durable_len = 0u64;

        while cur.remaining() > 0 {
            let frame_start = cur.position();
            match parse_frame(&mut cur)? {
                FrameOutcome::Truncated => {
                    warn!(
                        offset = frame_start,
                        "wal.replay.truncated_tail: discarding torn frame"
                    );
                    break;
                }
                FrameOutcome::Record(WalRecord::Commit { .. }) => {
                    if !open.is_empty() {
                        committed.push(std::mem::take(&mut open));
                    }
                    durable_len = cur.position() as u64;
                }
                FrameOutcome::Record(record) => open.push(record),
            }
        }

        if !open.is_empty() {
            warn!(
                records = open.len(),
                "wal.replay.uncommitted_tail: discarding records without commit"
            );
        }
        Ok((committed, durable_len))
    }
}

fn frame_crc(tag: u8, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&[tag]);
    hasher.update(payload);
    hasher.finalize()
}

/// One frame-parse attempt: a record, or a clean signal that the buffer
/// ended mid-frame. Everything else is corruption.
enum FrameOutcome {
    Record(WalRecord),
    Truncated,
}

fn parse_frame(cur: &mut Cursor<'_>) -> Result<FrameOutcome> {
    // The type tag and length prefix must be present before anything can
    // be judged.
    if cur.remaining() < 5 {
        return Ok(FrameOutcome::Truncated);
    }
    let tag = cur.u8()?;
    let len = cur.u32()? as usize;
    // A frame shorter than its declared length is a torn write, not
    // corruption: the crash interrupted the append mid-frame.
    if cur.remaining() < len.saturating_add(4) {
        return Ok(FrameOutcome::Truncated);
    }
    let payload = cur.take(len)?;
    let stored_crc = cur.u32()?;
    if stored_crc != frame_crc(tag, payload) {
        return Err(GrafitoError::corrupt(format!(
            "WAL frame crc mismatch for type {tag}"
        )));
    }
    WalRecord::decode_payload(tag, payload).map(FrameOutcome::Record)
}
