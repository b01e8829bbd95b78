//! Snapshot writer: serializes the merged graph state into CSR form.
//!
//! The writer deduplicates every string (keys, schema names, string property
//! values) into an interned string table, builds out- and in-CSR adjacency
//! sorted by (etype, neighbor), encodes property blocks against the string
//! and vector tables, builds the hash-bucketed key index, and emits the
//! section run with per-section CRCs. Output is deterministic: the same
//! input produces byte-identical bytes.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::error::{GrafitoError, Result};
use crate::primitives::bytes::{align_up, put_f32, put_u32, put_u64, write_u32_at, write_u64_at};
use crate::storage::keyindex::{self, KeyEntry};
use crate::types::checksum::{crc32, xxh64_key};
use crate::types::{ETypeId, LabelId, NodeId, PhysNode, PropKeyId, PropValue, StringId};

use super::{
    SectionId, KEY_ENTRY_LEN, PROP_VALUE_LEN, SECTION_ALIGN, SECTION_ENTRY_LEN, SNAPSHOT_HEADER_LEN,
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};

/// One node's merged state offered to the writer.
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    /// Node identifier.
    pub node_id: NodeId,
    /// Unique key, when assigned.
    pub key: Option<String>,
    /// Label memberships (any order; the writer sorts and dedups).
    pub labels: Vec<LabelId>,
    /// Properties, keyed for deterministic iteration.
    pub props: BTreeMap<PropKeyId, PropValue>,
}

/// One edge's merged state offered to the writer.
#[derive(Debug, Clone)]
pub struct EdgeData {
    /// Source node.
    pub src: NodeId,
    /// Edge type.
    pub etype: ETypeId,
    /// Destination node.
    pub dst: NodeId,
    /// Edge properties.
    pub props: BTreeMap<PropKeyId, PropValue>,
}

/// Complete input for one snapshot build.
#[derive(Debug, Default)]
pub struct SnapshotInput {
    /// Generation to stamp into the header.
    pub generation: u64,
    /// All live nodes.
    pub nodes: Vec<NodeData>,
    /// All live edges; endpoints must appear in `nodes`.
    pub edges: Vec<EdgeData>,
    /// Label schema.
    pub labels: BTreeMap<LabelId, String>,
    /// Edge type schema.
    pub etypes: BTreeMap<ETypeId, String>,
    /// Property key schema.
    pub propkeys: BTreeMap<PropKeyId, String>,
    /// Serialized vector store manifests per property key.
    pub vector_manifests: Vec<(PropKeyId, Vec<u8>)>,
}

struct StringTable {
    strings: Vec<String>,
    ids: FxHashMap<String, StringId>,
}

impl StringTable {
    fn new() -> Self {
        let mut ids = FxHashMap::default();
        ids.insert(String::new(), 0);
        Self {
            strings: vec![String::new()],
            ids,
        }
    }

    fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.strings.len() as StringId;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }

    fn lookup(&self, s: &str) -> StringId {
        self.ids.get(s).copied().unwrap_or(0)
    }
}

struct Csr {
    offsets: Vec<u32>,
    neighbor: Vec<u32>,
    etype: Vec<u32>,
}

fn build_out_csr(num_nodes: usize, edges: &[(PhysNode, ETypeId, PhysNode)]) -> Csr {
    let mut counts = vec![0u32; num_nodes];
    for &(src, _, _) in edges {
        counts[src as usize] += 1;
    }
    let mut offsets = vec![0u32; num_nodes + 1];
    for i in 0..num_nodes {
        offsets[i + 1] = offsets[i] + counts[i];
    }
    let mut grouped: Vec<Vec<(ETypeId, PhysNode)>> = vec![Vec::new(); num_nodes];
    for &(src, etype, dst) in edges {
        grouped[src as usize].push((etype, dst));
    }
    let mut neighbor = vec![0u32; edges.len()];
    let mut etype_arr = vec![0u32; edges.len()];
    for (src, mut list) in grouped.into_iter().enumerate() {
        list.sort_unstable();
        let mut pos = offsets[src] as usize;
        for (etype, dst) in list {
            neighbor[pos] = dst;
            etype_arr[pos] = etype;
            pos += 1;
        }
    }
    Csr {
        offsets,
        neighbor,
        etype: etype_arr,
    }
}

fn build_in_csr(num_nodes: usize, out: &Csr) -> Csr {
    let mut counts = vec![0u32; num_nodes];
    for &dst in &out.neighbor {
        counts[dst as usize] += 1;
    }
    let mut offsets = vec![0u32; num_nodes + 1];
    for i in 0..num_nodes {
        offsets[i + 1] = offsets[i] + counts[i];
    }
    let mut grouped: Vec<Vec<(ETypeId, PhysNode)>> = vec![Vec::new(); num_nodes];
    for src in 0..num_nodes {
        let start = out.offsets[src] as usize;
        let end = out.offsets[src + 1] as usize;
        for i in start..end {
            grouped[out.neighbor[i] as usize].push((out.etype[i], src as PhysNode));
        }
    }
    let mut neighbor = vec![0u32; out.neighbor.len()];
    let mut etype_arr = vec![0u32; out.neighbor.len()];
    for (dst, mut list) in grouped.into_iter().enumerate() {
        list.sort_unstable();
        let mut pos = offsets[dst] as usize;
        for (etype, src) in list {
            neighbor[pos] = src;
            etype_arr[pos] = etype;
            pos += 1;
        }
    }
    Csr {
        offsets,
        neighbor,
        etype: etype_arr,
    }
}

struct VectorTable {
    offsets: Vec<u64>,
    data: Vec<u8>,
}

impl VectorTable {
    fn new() -> Self {
        Self {
            offsets: vec![0],
            data: Vec::new(),
        }
    }

    fn push(&mut self, vector: &[f32]) -> u64 {
        for &v in vector {
            put_f32(&mut self.data, v);
        }
        self.offsets.push(self.data.len() as u64);
        (self.offsets.len() - 2) as u64
    }
}

fn encode_prop(value: &PropValue, strings: &StringTable, vectors: &mut VectorTable) -> (u8, u64) {
    match value {
        PropValue::Null => (0, 0),
        PropValue::Bool(b) => (1, u64::from(*b)),
        PropValue::Int(v) => (2, *v as u64),
        PropValue::Float(v) => (3, v.to_bits()),
        PropValue::String(s) => (4, strings.lookup(s) as u64),
        PropValue::Vector(v) => (5, vectors.push(v)),
    }
}

fn encode_u32s(values: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for &v in values {
        put_u32(&mut out, v);
    }
    out
}

fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for &v in values {
        put_u64(&mut out, v);
    }
    out
}

fn encode_props(vals: &[(u8, u64)]) -> Vec<u8> {
    let mut out = vec![0u8; vals.len() * PROP_VALUE_LEN];
    for (i, &(tag, payload)) in vals.iter().enumerate() {
        out[i * PROP_VALUE_LEN] = tag;
        write_u64_at(&mut out, i * PROP_VALUE_LEN + 8, payload);
    }
    out
}

fn name_table(count: u32, lookup: impl Fn(u32) -> Option<StringId>) -> Vec<u32> {
    let mut ids = vec![0u32; count as usize + 1];
    for (slot, id) in ids.iter_mut().enumerate().skip(1) {
        *id = lookup(slot as u32).unwrap_or(0);
    }
    ids
}

/// Builds a complete snapshot byte run from the merged state.
pub fn build_snapshot(input: SnapshotInput) -> Result<Vec<u8>> {
    let SnapshotInput {
        generation,
        mut nodes,
        edges,
        labels,
        etypes,
        propkeys,
        mut vector_manifests,
    } = input;

    nodes.sort_by_key(|n| n.node_id);

    let mut phys_of: FxHashMap<NodeId, PhysNode> = FxHashMap::default();
    let mut node_ids = Vec::with_capacity(nodes.len());
    let mut max_node_id = 0u64;
    for (i, node) in nodes.iter().enumerate() {
        if phys_of.insert(node.node_id, i as PhysNode).is_some() {
            return Err(GrafitoError::InvalidArgument(format!(
                "duplicate node {} in snapshot input",
                node.node_id
            )));
        }
        node_ids.push(node.node_id);
        max_node_id = max_node_id.max(node.node_id);
    }

    let mut phys_edges = Vec::with_capacity(edges.len());
    for edge in &edges {
        let (Some(&src), Some(&dst)) = (phys_of.get(&edge.src), phys_of.get(&edge.dst)) else {
            return Err(GrafitoError::InvalidArgument(format!(
                "edge ({}, {}, {}) references a missing node",
                edge.src, edge.etype, edge.dst
            )));
        };
        phys_edges.push((src, edge.etype, dst));
    }

    // Intern strings in a fixed order so output bytes are reproducible.
    let mut strings = StringTable::new();
    for name in labels.values() {
        strings.intern(name);
    }
    for name in etypes.values() {
        strings.intern(name);
    }
    for name in propkeys.values() {
        strings.intern(name);
    }
    let node_key_ids: Vec<StringId> = nodes
        .iter()
        .map(|n| n.key.as_deref().map(|k| strings.intern(k)).unwrap_or(0))
        .collect();
    for node in &nodes {
        for value in node.props.values() {
            if let PropValue::String(s) = value {
                strings.intern(s);
            }
        }
    }
    for edge in &edges {
        for value in edge.props.values() {
            if let PropValue::String(s) = value {
                strings.intern(s);
            }
        }
    }

    let out_csr = build_out_csr(nodes.len(), &phys_edges);
    let in_csr = build_in_csr(nodes.len(), &out_csr);

    // Node labels, sorted and deduplicated per node.
    let mut label_offsets = vec![0u32; nodes.len() + 1];
    let mut label_ids: Vec<u32> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let mut sorted = node.labels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        label_ids.extend(sorted);
        label_offsets[i + 1] = label_ids.len() as u32;
    }

    // Property blocks.
    let mut vectors = VectorTable::new();
    let mut node_prop_offsets = vec![0u32; nodes.len() + 1];
    let mut node_prop_keys: Vec<u32> = Vec::new();
    let mut node_prop_vals: Vec<(u8, u64)> = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        for (&key, value) in &node.props {
            node_prop_keys.push(key);
            node_prop_vals.push(encode_prop(value, &strings, &mut vectors));
        }
        node_prop_offsets[i + 1] = node_prop_keys.len() as u32;
    }

    // Edge properties are indexed by out-CSR edge position.
    let mut edge_prop_map: FxHashMap<(PhysNode, ETypeId, PhysNode), &BTreeMap<PropKeyId, PropValue>> =
        FxHashMap::default();
    for (edge, &(src, etype, dst)) in edges.iter().zip(&phys_edges) {
        if !edge.props.is_empty() {
            edge_prop_map.insert((src, etype, dst), &edge.props);
        }
    }
    let mut edge_prop_offsets = vec![0u32; phys_edges.len() + 1];
    let mut edge_prop_keys: Vec<u32> = Vec::new();
    let mut edge_prop_vals: Vec<(u8, u64)> = Vec::new();
    for src in 0..nodes.len() {
        let start = out_csr.offsets[src] as usize;
        let end = out_csr.offsets[src + 1] as usize;
        for i in start..end {
            let triple = (src as PhysNode, out_csr.etype[i], out_csr.neighbor[i]);
            if let Some(props) = edge_prop_map.get(&triple) {
                for (&key, value) in props.iter() {
                    edge_prop_keys.push(key);
                    edge_prop_vals.push(encode_prop(value, &strings, &mut vectors));
                }
            }
            edge_prop_offsets[i + 1] = edge_prop_keys.len() as u32;
        }
    }

    // Key index.
    let mut key_entries = Vec::new();
    for (node, &string_id) in nodes.iter().zip(&node_key_ids) {
        if let Some(key) = node.key.as_deref() {
            key_entries.push(KeyEntry {
                hash: xxh64_key(key),
                string_id,
                node_id: node.node_id,
            });
        }
    }
    let (key_buckets, key_entries) = keyindex::build(key_entries);
    let mut key_entry_bytes = vec![0u8; key_entries.len() * KEY_ENTRY_LEN];
    for (i, entry) in key_entries.iter().enumerate() {
        let base = i * KEY_ENTRY_LEN;
        write_u64_at(&mut key_entry_bytes, base, entry.hash);
        write_u32_at(&mut key_entry_bytes, base + 8, entry.string_id);
        write_u64_at(&mut key_entry_bytes, base + 16, entry.node_id);
    }

    // Schema name tables.
    let label_names = name_table(labels.len() as u32, |id| {
        labels.get(&id).map(|n| strings.lookup(n))
    });
    let etype_names = name_table(etypes.len() as u32, |id| {
        etypes.get(&id).map(|n| strings.lookup(n))
    });
    let propkey_names = name_table(propkeys.len() as u32, |id| {
        propkeys.get(&id).map(|n| strings.lookup(n))
    });

    // String table sections.
    let mut string_offsets = vec![0u32; strings.strings.len() + 1];
    let mut string_bytes = Vec::new();
    for (i, s) in strings.strings.iter().enumerate() {
        string_bytes.extend_from_slice(s.as_bytes());
        string_offsets[i + 1] = string_bytes.len() as u32;
    }

    // Vector manifests section.
    vector_manifests.sort_by_key(|(k, _)| *k);
    let mut manifest_bytes = Vec::new();
    put_u32(&mut manifest_bytes, vector_manifests.len() as u32);
    let mut blob_off = 0u64;
    for (propkey, blob) in &vector_manifests {
        put_u32(&mut manifest_bytes, *propkey);
        put_u64(&mut manifest_bytes, blob_off);
        put_u64(&mut manifest_bytes, blob.len() as u64);
        blob_off += blob.len() as u64;
    }
    for (_, blob) in &vector_manifests {
        manifest_bytes.extend_from_slice(blob);
    }

    let mut sections: FxHashMap<SectionId, Vec<u8>> = FxHashMap::default();
    sections.insert(SectionId::NodeIds, encode_u64s(&node_ids));
    sections.insert(SectionId::NodeKeys, encode_u32s(&node_key_ids));
    sections.insert(SectionId::OutOffsets, encode_u32s(&out_csr.offsets));
    sections.insert(SectionId::OutDst, encode_u32s(&out_csr.neighbor));
    sections.insert(SectionId::OutEtype, encode_u32s(&out_csr.etype));
    sections.insert(SectionId::InOffsets, encode_u32s(&in_csr.offsets));
    sections.insert(SectionId::InSrc, encode_u32s(&in_csr.neighbor));
    sections.insert(SectionId::InEtype, encode_u32s(&in_csr.etype));
    sections.insert(SectionId::NodeLabelOffsets, encode_u32s(&label_offsets));
    sections.insert(SectionId::NodeLabelIds, encode_u32s(&label_ids));
    sections.insert(SectionId::NodePropOffsets, encode_u32s(&node_prop_offsets));
    sections.insert(SectionId::NodePropKeys, encode_u32s(&node_prop_keys));
    sections.insert(SectionId::NodePropVals, encode_props(&node_prop_vals));
    sections.insert(SectionId::EdgePropOffsets, encode_u32s(&edge_prop_offsets));
    sections.insert(SectionId::EdgePropKeys, encode_u32s(&edge_prop_keys));
    sections.insert(SectionId::EdgePropVals, encode_props(&edge_prop_vals));
    sections.insert(SectionId::LabelNames, encode_u32s(&label_names));
    sections.insert(SectionId::EtypeNames, encode_u32s(&etype_names));
    sections.insert(SectionId::PropkeyNames, encode_u32s(&propkey_names));
    sections.insert(SectionId::KeyBuckets, encode_u32s(&key_buckets));
    sections.insert(SectionId::KeyEntries, key_entry_bytes);
    if vectors.offsets.len() > 1 {
        sections.insert(SectionId::VectorOffsets, encode_u64s(&vectors.offsets));
        sections.insert(SectionId::VectorData, vectors.data);
    }
    if !vector_manifests.is_empty() {
        sections.insert(SectionId::VectorManifests, manifest_bytes);
    }
    sections.insert(SectionId::StringOffsets, encode_u32s(&string_offsets));
    sections.insert(SectionId::StringBytes, string_bytes);

    Ok(emit(
        generation,
        nodes.len() as u64,
        phys_edges.len() as u64,
        max_node_id,
        labels.len() as u32,
        etypes.len() as u32,
        propkeys.len() as u32,
        strings.strings.len() as u32,
        &sections,
    ))
}

#[allow(clippy::too_many_arguments)]
fn emit(
    generation: u64,
    num_nodes: u64,
    num_edges: u64,
    max_node_id: u64,
    num_labels: u32,
    num_etypes: u32,
    num_propkeys: u32,
    num_strings: u32,
    sections: &FxHashMap<SectionId, Vec<u8>>,
) -> Vec<u8> {
    let table_len = SectionId::COUNT * SECTION_ENTRY_LEN;
    let mut data_off = align_up(SNAPSHOT_HEADER_LEN + table_len, SECTION_ALIGN);
    let mut placed: Vec<(u64, u64, u32)> = Vec::with_capacity(SectionId::COUNT);
    for id in SectionId::all() {
        match sections.get(&id) {
            Some(data) if !data.is_empty() => {
                placed.push((data_off as u64, data.len() as u64, crc32(data)));
                data_off = align_up(data_off + data.len(), SECTION_ALIGN);
            }
            _ => placed.push((0, 0, 0)),
        }
    }

    let total = data_off;
    let mut buf = vec![0u8; total];
    write_u32_at(&mut buf, 0, SNAPSHOT_MAGIC);
    write_u32_at(&mut buf, 4, SNAPSHOT_VERSION);
    write_u64_at(&mut buf, 8, generation);
    write_u64_at(&mut buf, 16, num_nodes);
    write_u64_at(&mut buf, 24, num_edges);
    write_u64_at(&mut buf, 32, max_node_id);
    write_u32_at(&mut buf, 40, num_labels);
    write_u32_at(&mut buf, 44, num_etypes);
    write_u32_at(&mut buf, 48, num_propkeys);
    write_u32_at(&mut buf, 52, num_strings);
    let header_crc = crc32(&buf[..56]);
    write_u32_at(&mut buf, 56, header_crc);

    for (i, &(offset, len, crc)) in placed.iter().enumerate() {
        let base = SNAPSHOT_HEADER_LEN + i * SECTION_ENTRY_LEN;
        write_u64_at(&mut buf, base, offset);
        write_u64_at(&mut buf, base + 8, len);
        write_u32_at(&mut buf, base + 16, crc);
    }
    for (id, &(offset, len, _)) in SectionId::all().zip(&placed) {
        if len > 0 {
            let data = &sections[&id];
            buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
    }
    buf
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::primitives::bytes::read_u64_at;

    pub(crate) fn sample_input() -> SnapshotInput {
        let mut labels = BTreeMap::new();
        labels.insert(1, "Person".to_string());
        labels.insert(2, "Document".to_string());
        let mut etypes = BTreeMap::new();
        etypes.insert(1, "KNOWS".to_string());
        etypes.insert(2, "CREATED".to_string());
        let mut propkeys = BTreeMap::new();
        propkeys.insert(1, "name".to_string());
        propkeys.insert(2, "age".to_string());
        propkeys.insert(3, "weight".to_string());

        let nodes = vec![
            NodeData {
                node_id: 1,
                key: Some("user:alice".into()),
                labels: vec![1],
                props: BTreeMap::from([
                    (1, PropValue::String("Alice".into())),
                    (2, PropValue::Int(30)),
                ]),
            },
            NodeData {
                node_id: 2,
                key: Some("user:bob".into()),
                labels: vec![1, 1],
                props: BTreeMap::from([(1, PropValue::String("Bob".into()))]),
            },
            NodeData {
                node_id: 4,
                key: None,
                labels: vec![2],
                props: BTreeMap::new(),
            },
        ];
        let edges = vec![
            EdgeData {
                src: 1,
                etype: 1,
                dst: 2,
                props: BTreeMap::from([(3, PropValue::Float(0.9))]),
            },
            EdgeData {
                src: 2,
                etype: 1,
                dst: 1,
                props: BTreeMap::new(),
            },
            EdgeData {
                src: 1,
                etype: 2,
                dst: 4,
                props: BTreeMap::new(),
            },
        ];
        SnapshotInput {
            generation: 1,
            nodes,
            edges,
            labels,
            etypes,
            propkeys,
            vector_manifests: Vec::new(),
        }
    }

    #[test]
    fn header_fields_and_determinism() {
        let a = build_snapshot(sample_input()).unwrap();
        let b = build_snapshot(sample_input()).unwrap();
        assert_eq!(a, b, "same input must produce byte-identical output");
        assert_eq!(read_u64_at(&a, 16), 3); // num_nodes
        assert_eq!(read_u64_at(&a, 24), 3); // num_edges
        assert_eq!(read_u64_at(&a, 32), 4); // max_node_id
    }

    #[test]
    fn rejects_dangling_edge() {
        let mut input = sample_input();
        input.edges.push(EdgeData {
            src: 99,
            etype: 1,
            dst: 1,
            props: BTreeMap::new(),
        });
        assert!(build_snapshot(input).is_err());
    }

    #[test]
    fn empty_snapshot_builds() {
        let buf = build_snapshot(SnapshotInput {
            generation: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(read_u64_at(&buf, 16), 0);
        assert_eq!(read_u64_at(&buf, 24), 0);
    }
}
