//! Snapshot reader: zero-copy accessors over one snapshot byte run.
//!
//! The header is parsed eagerly and every section CRC is verified once at
//! parse time; all subsequent accessors index straight into the shared
//! immutable buffer. Edge existence is O(log k) by binary search within a
//! node's (etype, dst)-sorted slice, neighbor listing is O(k), property
//! access is O(p) over a node's sorted property block.

use bytes::Bytes;

use crate::error::{GrafitoError, Result};
use crate::primitives::bytes::{read_u32_at, read_u64_at, u32_slice_get, u64_slice_get};
use crate::types::checksum::{crc32, xxh64_key};
use crate::types::{ETypeId, LabelId, NodeId, PhysNode, PropKeyId, PropValue, StringId};

use super::{
    SectionId, SnapshotHeader, KEY_ENTRY_LEN, PROP_VALUE_LEN, SECTION_ENTRY_LEN,
    SNAPSHOT_HEADER_LEN, SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};

#[derive(Debug, Clone, Copy)]
struct SectionEntry {
    offset: u64,
    len: u64,
}

/// A parsed, validated snapshot over a shared immutable buffer.
#[derive(Debug)]
pub struct Snapshot {
    buf: Bytes,
    /// Fixed header fields.
    pub header: SnapshotHeader,
    sections: Vec<SectionEntry>,
}

impl Snapshot {
    /// Parses and validates a snapshot byte run.
    pub fn parse(buf: Bytes) -> Result<Self> {
        if buf.len() < SNAPSHOT_HEADER_LEN {
            return Err(GrafitoError::corrupt(format!(
                "snapshot too small: {} bytes",
                buf.len()
            )));
        }
        if read_u32_at(&buf, 0) != SNAPSHOT_MAGIC {
            return Err(GrafitoError::corrupt("bad snapshot magic"));
        }
        let version = read_u32_at(&buf, 4);
        if version != SNAPSHOT_VERSION {
            return Err(GrafitoError::corrupt(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let stored_crc = read_u32_at(&buf, 56);
        let computed = crc32(&buf[..56]);
        if stored_crc != computed {
            return Err(GrafitoError::corrupt("snapshot header crc mismatch"));
        }
        let header = SnapshotHeader {
            generation: read_u64_at(&buf, 8),
            num_nodes: read_u64_at(&buf, 16),
            num_edges: read_u64_at(&buf, 24),
            max_node_id: read_u64_at(&buf, 32),
            num_labels: read_u32_at(&buf, 40),
            num_etypes: read_u32_at(&buf, 44),
            num_propkeys: read_u32_at(&buf, 48),
            num_strings: read_u32_at(&buf, 52),
        };

        let table_end = SNAPSHOT_HEADER_LEN + SectionId::COUNT * SECTION_ENTRY_LEN;
        if buf.len() < table_end {
            return Err(GrafitoError::corrupt("snapshot section table truncated"));
        }
        let mut sections = Vec::with_capacity(SectionId::COUNT);
        for i in 0..SectionId::COUNT {
            let base = SNAPSHOT_HEADER_LEN + i * SECTION_ENTRY_LEN;
            let entry = SectionEntry {
                offset: read_u64_at(&buf, base),
                len: read_u64_at(&buf, base + 8),
            };
            let crc = read_u32_at(&buf, base + 16);
            if entry.len > 0 {
                let start = entry.offset as usize;
                let end = start
                    .checked_add(entry.len as usize)
                    .filter(|&e| e <= buf.len())
                    .ok_or_else(|| {
                        GrafitoError::corrupt(format!("section {i} out of bounds"))
                    })?;
                let computed = crc32(&buf[start..end]);
                if computed != crc {
                    return Err(GrafitoError::corrupt(format!(
                        "section {i} crc mismatch"
                    )));
                }
            }
            sections.push(entry);
        }

        Ok(Self {
            buf,
            header,
            sections,
        })
    }

    fn section(&self, id: SectionId) -> &[u8] {
        let entry = self.sections[id as usize];
        if entry.len == 0 {
            return &[];
        }
        &self.buf[entry.offset as usize..(entry.offset + entry.len) as usize]
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// NodeId for a physical index.
    pub fn node_id(&self, phys: PhysNode) -> Option<NodeId> {
        u64_slice_get(self.section(SectionId::NodeIds), phys as usize)
    }

    /// Physical index for a NodeId. The node-id table is ascending, so this
    /// is a binary search.
    pub fn phys_node(&self, node_id: NodeId) -> Option<PhysNode> {
        let ids = self.section(SectionId::NodeIds);
        let count = ids.len() / 8;
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let v = read_u64_at(ids, mid * 8);
            match v.cmp(&node_id) {
                std::cmp::Ordering::Equal => return Some(mid as PhysNode),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Whether a NodeId exists in this snapshot.
    pub fn has_node(&self, node_id: NodeId) -> bool {
        self.phys_node(node_id).is_some()
    }

    /// The key assigned to a node, if any.
    pub fn node_key(&self, phys: PhysNode) -> Option<&str> {
        let string_id = u32_slice_get(self.section(SectionId::NodeKeys), phys as usize)?;
        if string_id == 0 {
            return None;
        }
        self.string(string_id)
    }

    /// Sorted label ids of a node.
    pub fn node_labels(&self, phys: PhysNode) -> Vec<LabelId> {
        let offsets = self.section(SectionId::NodeLabelOffsets);
        let ids = self.section(SectionId::NodeLabelIds);
        let (start, end) = match range_at(offsets, phys as usize) {
            Some(r) => r,
            None => return Vec::new(),
        };
        (start..end).filter_map(|i| u32_slice_get(ids, i)).collect()
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Resolves a stringId against the string table.
    pub fn string(&self, id: StringId) -> Option<&str> {
        if id == 0 {
            return Some("");
        }
        let offsets = self.section(SectionId::StringOffsets);
        let bytes = self.section(SectionId::StringBytes);
        let start = u32_slice_get(offsets, id as usize)? as usize;
        let end = u32_slice_get(offsets, id as usize + 1)? as usize;
        std::str::from_utf8(bytes.get(start..end)?).ok()
    }

    fn require_string(&self, id: StringId) -> Result<&str> {
        self.string(id)
            .ok_or_else(|| GrafitoError::corrupt(format!("stringId {id} out of bounds")))
    }

    // ------------------------------------------------------------------
    // Adjacency
    // ------------------------------------------------------------------

    /// Out-edge index range of a node in the CSR arrays.
    pub fn out_range(&self, phys: PhysNode) -> (usize, usize) {
        range_at(self.section(SectionId::OutOffsets), phys as usize).unwrap_or((0, 0))
    }

    /// In-edge index range of a node.
    pub fn in_range(&self, phys: PhysNode) -> (usize, usize) {
        range_at(self.section(SectionId::InOffsets), phys as usize).unwrap_or((0, 0))
    }

    /// Out-neighbors of a node as (etype, dst phys), in (etype, dst) order.
    pub fn out_neighbors(&self, phys: PhysNode) -> Vec<(ETypeId, PhysNode)> {
        let (start, end) = self.out_range(phys);
        let etypes = self.section(SectionId::OutEtype);
        let dsts = self.section(SectionId::OutDst);
        (start..end)
            .filter_map(|i| Some((u32_slice_get(etypes, i)?, u32_slice_get(dsts, i)?)))
            .collect()
    }

    /// In-neighbors of a node as (etype, src phys), in (etype, src) order.
    pub fn in_neighbors(&self, phys: PhysNode) -> Vec<(ETypeId, PhysNode)> {
        let (start, end) = self.in_range(phys);
        let etypes = self.section(SectionId::InEtype);
        let srcs = self.section(SectionId::InSrc);
        (start..end)
            .filter_map(|i| Some((u32_slice_get(etypes, i)?, u32_slice_get(srcs, i)?)))
            .collect()
    }

    /// Out-degree of a node.
    pub fn out_degree(&self, phys: PhysNode) -> usize {
        let (start, end) = self.out_range(phys);
        end - start
    }

    /// Binary search for an edge within the source's sorted slice. Returns
    /// the out-CSR edge index used for edge property access.
    pub fn find_edge_index(
        &self,
        src_phys: PhysNode,
        etype: ETypeId,
        dst_phys: PhysNode,
    ) -> Option<usize> {
        let (start, end) = self.out_range(src_phys);
        let etypes = self.section(SectionId::OutEtype);
        let dsts = self.section(SectionId::OutDst);
        let mut lo = start;
        let mut hi = end;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = (u32_slice_get(etypes, mid)?, u32_slice_get(dsts, mid)?);
            match mid_key.cmp(&(etype, dst_phys)) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    /// Whether an edge exists in the snapshot.
    pub fn has_edge(&self, src_phys: PhysNode, etype: ETypeId, dst_phys: PhysNode) -> bool {
        self.find_edge_index(src_phys, etype, dst_phys).is_some()
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    fn decode_prop(&self, vals: &[u8], idx: usize) -> Result<PropValue> {
        let base = idx * PROP_VALUE_LEN;
        if base + PROP_VALUE_LEN > vals.len() {
            return Err(GrafitoError::corrupt("property value index out of bounds"));
        }
        let tag = vals[base];
        let payload = read_u64_at(vals, base + 8);
        Ok(match tag {
            0 => PropValue::Null,
            1 => PropValue::Bool(payload != 0),
            2 => PropValue::Int(payload as i64),
            3 => PropValue::Float(f64::from_bits(payload)),
            4 => PropValue::String(self.require_string(payload as StringId)?.to_string()),
            5 => PropValue::Vector(self.inline_vector(payload)?),
            other => {
                return Err(GrafitoError::corrupt(format!(
                    "unknown property tag {other} in snapshot"
                )))
            }
        })
    }

    fn inline_vector(&self, idx: u64) -> Result<Vec<f32>> {
        let offsets = self.section(SectionId::VectorOffsets);
        let data = self.section(SectionId::VectorData);
        let start = u64_slice_get(offsets, idx as usize)
            .ok_or_else(|| GrafitoError::corrupt("vector index out of bounds"))?
            as usize;
        let end = u64_slice_get(offsets, idx as usize + 1)
            .ok_or_else(|| GrafitoError::corrupt("vector index out of bounds"))?
            as usize;
        let bytes = data
            .get(start..end)
            .ok_or_else(|| GrafitoError::corrupt("vector payload out of bounds"))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn prop_block(
        &self,
        offsets_id: SectionId,
        keys_id: SectionId,
        vals_id: SectionId,
        idx: usize,
    ) -> Result<Vec<(PropKeyId, PropValue)>> {
        let offsets = self.section(offsets_id);
        let keys = self.section(keys_id);
        let vals = self.section(vals_id);
        let Some((start, end)) = range_at(offsets, idx) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(end - start);
        for i in start..end {
            let key = u32_slice_get(keys, i)
                .ok_or_else(|| GrafitoError::corrupt("property key index out of bounds"))?;
            out.push((key, self.decode_prop(vals, i)?));
        }
        Ok(out)
    }

    fn prop_in_block(
        &self,
        offsets_id: SectionId,
        keys_id: SectionId,
        vals_id: SectionId,
        idx: usize,
        key: PropKeyId,
    ) -> Result<Option<PropValue>> {
        let offsets = self.section(offsets_id);
        let keys = self.section(keys_id);
        let vals = self.section(vals_id);
        let Some((start, end)) = range_at(offsets, idx) else {
            return Ok(None);
        };
        for i in start..end {
            if u32_slice_get(keys, i) == Some(key) {
                return Ok(Some(self.decode_prop(vals, i)?));
            }
        }
        Ok(None)
    }

    /// All properties of a node, sorted by key id.
    pub fn node_props(&self, phys: PhysNode) -> Result<Vec<(PropKeyId, PropValue)>> {
        self.prop_block(
            SectionId::NodePropOffsets,
            SectionId::NodePropKeys,
            SectionId::NodePropVals,
            phys as usize,
        )
    }

    /// One property of a node.
    pub fn node_prop(&self, phys: PhysNode, key: PropKeyId) -> Result<Option<PropValue>> {
        self.prop_in_block(
            SectionId::NodePropOffsets,
            SectionId::NodePropKeys,
            SectionId::NodePropVals,
            phys as usize,
            key,
        )
    }

    /// All properties of the edge at an out-CSR index.
    pub fn edge_props(&self, edge_index: usize) -> Result<Vec<(PropKeyId, PropValue)>> {
        self.prop_block(
            SectionId::EdgePropOffsets,
            SectionId::EdgePropKeys,
            SectionId::EdgePropVals,
            edge_index,
        )
    }

    /// One property of the edge at an out-CSR index.
    pub fn edge_prop(&self, edge_index: usize, key: PropKeyId) -> Result<Option<PropValue>> {
        self.prop_in_block(
            SectionId::EdgePropOffsets,
            SectionId::EdgePropKeys,
            SectionId::EdgePropVals,
            edge_index,
            key,
        )
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    fn schema_name(&self, section: SectionId, id: u32) -> Option<&str> {
        let string_id = u32_slice_get(self.section(section), id as usize)?;
        if string_id == 0 {
            return None;
        }
        self.string(string_id)
    }

    /// Label name by id.
    pub fn label_name(&self, id: LabelId) -> Option<&str> {
        self.schema_name(SectionId::LabelNames, id)
    }

    /// Edge type name by id.
    pub fn etype_name(&self, id: ETypeId) -> Option<&str> {
        self.schema_name(SectionId::EtypeNames, id)
    }

    /// Property key name by id.
    pub fn propkey_name(&self, id: PropKeyId) -> Option<&str> {
        self.schema_name(SectionId::PropkeyNames, id)
    }

    // ------------------------------------------------------------------
    // Key index
    // ------------------------------------------------------------------

    /// Looks a key up in the snapshot's hash index: hash, one bucket scan,
    /// byte-for-byte confirmation through the string table.
    pub fn key_lookup(&self, key: &str) -> Option<NodeId> {
        let buckets = self.section(SectionId::KeyBuckets);
        let entries = self.section(SectionId::KeyEntries);
        if buckets.len() < 8 {
            return None;
        }
        let bucket_count = buckets.len() / 4 - 1;
        let hash = xxh64_key(key);
        let bucket = (hash % bucket_count as u64) as usize;
        let start = u32_slice_get(buckets, bucket)? as usize;
        let end = u32_slice_get(buckets, bucket + 1)? as usize;
        for i in start..end {
            let entry = entries.get(i * KEY_ENTRY_LEN..(i + 1) * KEY_ENTRY_LEN)?;
            if read_u64_at(entry, 0) != hash {
                continue;
            }
            let string_id = read_u32_at(entry, 8);
            if self.string(string_id) == Some(key) {
                return Some(read_u64_at(entry, 16));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Vector manifests
    // ------------------------------------------------------------------

    /// Serialized vector store manifests as (propkey, blob) pairs.
    pub fn vector_manifests(&self) -> Result<Vec<(PropKeyId, &[u8])>> {
        let section = self.section(SectionId::VectorManifests);
        if section.is_empty() {
            return Ok(Vec::new());
        }
        if section.len() < 4 {
            return Err(GrafitoError::corrupt("vector manifest section truncated"));
        }
        let count = read_u32_at(section, 0) as usize;
        let table_len = 4 + count * 20;
        if section.len() < table_len {
            return Err(GrafitoError::corrupt("vector manifest table truncated"));
        }
        let blob_base = table_len;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let base = 4 + i * 20;
            let propkey = read_u32_at(section, base);
            let offset = read_u64_at(section, base + 4) as usize;
            let len = read_u64_at(section, base + 12) as usize;
            let blob = section
                .get(blob_base + offset..blob_base + offset + len)
                .ok_or_else(|| GrafitoError::corrupt("vector manifest blob out of bounds"))?;
            out.push((propkey, blob));
        }
        Ok(out)
    }
}

fn range_at(offsets: &[u8], idx: usize) -> Option<(usize, usize)> {
    let start = u32_slice_get(offsets, idx)? as usize;
    let end = u32_slice_get(offsets, idx + 1)? as usize;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::super::writer::{build_snapshot, tests::sample_input};
    use super::*;

    fn parsed() -> Snapshot {
        let buf = build_snapshot(sample_input()).unwrap();
        Snapshot::parse(Bytes::from(buf)).unwrap()
    }

    #[test]
    fn node_and_key_lookups() {
        let snap = parsed();
        assert_eq!(snap.header.num_nodes, 3);
        assert_eq!(snap.phys_node(1), Some(0));
        assert_eq!(snap.phys_node(2), Some(1));
        assert_eq!(snap.phys_node(3), None);
        assert_eq!(snap.phys_node(4), Some(2));
        assert_eq!(snap.node_id(2), Some(4));
        assert_eq!(snap.node_key(0), Some("user:alice"));
        assert_eq!(snap.node_key(2), None);
        assert_eq!(snap.key_lookup("user:alice"), Some(1));
        assert_eq!(snap.key_lookup("user:bob"), Some(2));
        assert_eq!(snap.key_lookup("user:carol"), None);
    }

    #[test]
    fn adjacency_is_sorted_and_symmetric() {
        let snap = parsed();
        let out = snap.out_neighbors(0);
        assert_eq!(out, vec![(1, 1), (2, 2)]);
        assert!(snap.has_edge(0, 1, 1));
        assert!(snap.has_edge(1, 1, 0));
        assert!(!snap.has_edge(0, 1, 2));
        // Every out edge appears as an in edge on the other side.
        for phys in 0..3u32 {
            for (etype, dst) in snap.out_neighbors(phys) {
                assert!(
                    snap.in_neighbors(dst).contains(&(etype, phys)),
                    "missing mirror of ({phys}, {etype}, {dst})"
                );
            }
        }
    }

    #[test]
    fn props_roundtrip() {
        let snap = parsed();
        assert_eq!(
            snap.node_prop(0, 1).unwrap(),
            Some(PropValue::String("Alice".into()))
        );
        assert_eq!(snap.node_prop(0, 2).unwrap(), Some(PropValue::Int(30)));
        assert_eq!(snap.node_prop(0, 3).unwrap(), None);
        let edge = snap.find_edge_index(0, 1, 1).unwrap();
        assert_eq!(
            snap.edge_prop(edge, 3).unwrap(),
            Some(PropValue::Float(0.9))
        );
        assert_eq!(snap.node_props(2).unwrap(), Vec::new());
    }

    #[test]
    fn schema_names_resolve() {
        let snap = parsed();
        assert_eq!(snap.label_name(1), Some("Person"));
        assert_eq!(snap.etype_name(2), Some("CREATED"));
        assert_eq!(snap.propkey_name(3), Some("weight"));
        assert_eq!(snap.label_name(9), None);
    }

    #[test]
    fn labels_sorted_deduped() {
        let snap = parsed();
        assert_eq!(snap.node_labels(1), vec![1]);
        assert_eq!(snap.node_labels(2), vec![2]);
    }

    #[test]
    fn corrupted_section_is_rejected() {
        let buf = build_snapshot(sample_input()).unwrap();
        let mut corrupted = buf.clone();
        // First payload byte after the section table: inside the node-id
        // table, which its section CRC covers.
        let first_payload =
            crate::primitives::bytes::align_up(SNAPSHOT_HEADER_LEN + SectionId::COUNT * SECTION_ENTRY_LEN, 8);
        corrupted[first_payload] ^= 0xFF;
        let err = Snapshot::parse(Bytes::from(corrupted)).unwrap_err();
        assert!(err.to_string().contains("crc mismatch"), "{err}");
    }

    #[test]
    fn reparse_reproduces_bytes() {
        // Write -> parse -> rebuild from parsed state -> identical bytes.
        let first = build_snapshot(sample_input()).unwrap();
        let snap = Snapshot::parse(Bytes::from(first.clone())).unwrap();

        let mut input = sample_input();
        input.nodes.clear();
        for phys in 0..snap.header.num_nodes as u32 {
            let node_id = snap.node_id(phys).unwrap();
            input.nodes.push(super::super::writer::NodeData {
                node_id,
                key: snap.node_key(phys).map(|s| s.to_string()),
                labels: snap.node_labels(phys),
                props: snap.node_props(phys).unwrap().into_iter().collect(),
            });
        }
        input.edges.clear();
        for phys in 0..snap.header.num_nodes as u32 {
            let (start, _) = snap.out_range(phys);
            for (i, (etype, dst)) in snap.out_neighbors(phys).into_iter().enumerate() {
                input.edges.push(super::super::writer::EdgeData {
                    src: snap.node_id(phys).unwrap(),
                    etype,
                    dst: snap.node_id(dst).unwrap(),
                    props: snap.edge_props(start + i).unwrap().into_iter().collect(),
                });
            }
        }
        let second = build_snapshot(input).unwrap();
        assert_eq!(first, second);
    }
}
