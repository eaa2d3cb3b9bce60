//! C3: per-function control-flow graph.
//!
//! Grounded on `original_source/flow_graph.cc` (construction steps, size
//! gate constants, loop marking) and
//! `original_source/reader/graph_utility.h` (vertex lookup, edge-degree
//! collection).

pub mod dominator;

use crate::address::{binary_search_address, Address};
use crate::error::Result;
use crate::instruction::{Cache, Instruction};
use crate::{ensure_arg, flags_to_struct, invalid_argument};

pub type VertexId = u32;
pub const INVALID_VERTEX: VertexId = u32::MAX;
pub const NO_CALL_TARGET: usize = usize::MAX;

// Size gate (spec §3): a hard cap, not a tunable.
pub const MAX_BASIC_BLOCKS: usize = 5000;
pub const MAX_EDGES: usize = 5000;
pub const MAX_INSTRUCTIONS: usize = 10000;

pub const LOOP_ENTRY: u32 = 1;
flags_to_struct!(
    BasicBlockFlags, u32,
    LOOP_ENTRY is_loop_entry "Vertex is the target of a dominated (loop) back-edge",
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    True,
    False,
    Unconditional,
    Switch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeFlags {
    pub kind: EdgeKind,
    pub dominated: bool,
}

#[derive(Clone, Debug)]
pub struct BasicBlockInfo {
    pub instr_start: usize,
    pub instr_end: usize,
    pub prime: u64,
    pub basic_block_hash: u32,
    pub flags: BasicBlockFlags,
    pub call_target_start: usize,
    pub string_hash: u32,
    pub bfs_top_down: u32,
    pub bfs_bottom_up: u32,
    /// Weak back-reference to a fixed point, as an index into the owning
    /// match set's arena (design notes: represented as an index, not a raw
    /// pointer, and nulled when the match set is cleared).
    pub fixed_point: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub source: VertexId,
    pub target: VertexId,
    pub flags: EdgeFlags,
    pub md_index_top_down: f64,
    pub md_index_bottom_up: f64,
}

/// Input to flow-graph construction: one basic block as seen by the codec.
/// Each instruction carries its own raw bytes; the block's byte-hash input
/// and the flow graph's per-instruction byte store are both derived from
/// these, rather than threading a separately-maintained concatenation.
#[derive(Clone, Debug)]
pub struct BlockSpec {
    pub address: Address,
    pub instructions: Vec<(Address, String, Vec<u8>)>,
    pub call_targets: Vec<Address>,
    pub string_refs: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct EdgeSpec {
    pub source: Address,
    pub target: Address,
    pub kind: EdgeKind,
}

#[derive(Clone, Debug, Default)]
pub struct FlowGraphMeta {
    pub entry_point: Address,
    pub basic_block_count: usize,
    pub edge_count: usize,
    pub instruction_count: usize,
}

#[derive(Clone, Debug)]
pub struct FlowGraph {
    meta: FlowGraphMeta,
    discarded: bool,
    /// index of this function's vertex in the owning call graph; resolved at
    /// attach time (design notes: index instead of a back-pointer).
    call_graph_vertex: VertexId,

    addresses: Vec<Address>,
    vertices: Vec<BasicBlockInfo>,
    edges: Vec<Edge>,
    out_edges: Vec<Vec<usize>>,
    in_edges: Vec<Vec<usize>>,
    instructions: Vec<Instruction>,
    /// Raw bytes per instruction, parallel to `instructions`. Kept around
    /// only for the classifier's operand-level comparison (spec §4.6
    /// `OPERANDS`): C2's `Instruction` itself carries exactly the fields
    /// spec §3 lists (address, mnemonic id, prime), nothing more.
    instruction_bytes: Vec<Vec<u8>>,
    call_targets: Vec<Address>,

    prime_sum: u64,
    byte_hash: u32,
    md_index: f64,
    md_index_inverted: f64,
    num_loops: u32,
}

fn sdbm_hash(data: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in data {
        hash = (byte as u32)
            .wrapping_add(hash.wrapping_shl(6))
            .wrapping_add(hash.wrapping_shl(16))
            .wrapping_sub(hash);
    }
    hash
}

impl FlowGraph {
    /// Builds a flow graph from the codec's per-block/per-edge spec. Applies
    /// the size gate (spec §3): functions above the caps are discarded but
    /// their counts are retained.
    pub fn build(
        cache: &mut Cache,
        entry_point: Address,
        call_graph_vertex: VertexId,
        mut blocks: Vec<BlockSpec>,
        edge_specs: Vec<EdgeSpec>,
    ) -> Result<FlowGraph> {
        ensure_arg!(!blocks.is_empty(), "flow graph at {entry_point} has no basic blocks");
        blocks.sort_by_key(|b| b.address);
        for w in blocks.windows(2) {
            if w[0].address == w[1].address {
                return Err(invalid_argument!(
                    "duplicate basic block address {} in flow graph at {entry_point}",
                    w[0].address
                ));
            }
        }

        let basic_block_count = blocks.len();
        let edge_count = edge_specs.len();
        let instruction_count: usize = blocks.iter().map(|b| b.instructions.len()).sum();
        let meta = FlowGraphMeta {
            entry_point,
            basic_block_count,
            edge_count,
            instruction_count,
        };

        if basic_block_count >= MAX_BASIC_BLOCKS
            || edge_count >= MAX_EDGES
            || instruction_count >= MAX_INSTRUCTIONS
        {
            log::warn!(
                "discarding flow graph at {entry_point}: {basic_block_count} blocks, \
                 {edge_count} edges, {instruction_count} instructions exceeds the size gate"
            );
            return Ok(FlowGraph {
                meta,
                discarded: true,
                call_graph_vertex,
                addresses: Vec::new(),
                vertices: Vec::new(),
                edges: Vec::new(),
                out_edges: Vec::new(),
                in_edges: Vec::new(),
                instructions: Vec::new(),
                instruction_bytes: Vec::new(),
                call_targets: Vec::new(),
                prime_sum: 0,
                byte_hash: 1,
                md_index: 0.0,
                md_index_inverted: 0.0,
                num_loops: 0,
            });
        }

        let addresses: Vec<Address> = blocks.iter().map(|b| b.address).collect();
        let mut instructions = Vec::with_capacity(instruction_count);
        let mut instruction_bytes = Vec::with_capacity(instruction_count);
        let mut call_targets = Vec::new();
        let mut vertices = Vec::with_capacity(basic_block_count);
        let mut byte_hash_input = Vec::new();
        let mut prime_sum: u64 = 0;

        for block in &blocks {
            let instr_start = instructions.len();
            let mut block_prime: u64 = 0;
            let mut block_bytes = Vec::new();
            for (addr, mnemonic, bytes) in &block.instructions {
                let instr = Instruction::new(cache, *addr, mnemonic);
                block_prime += u64::from(instr.prime());
                instructions.push(instr);
                instruction_bytes.push(bytes.clone());
                block_bytes.extend_from_slice(bytes);
            }
            prime_sum += block_prime;
            let instr_end = instructions.len();

            let call_target_start = if block.call_targets.is_empty() {
                NO_CALL_TARGET
            } else {
                let start = call_targets.len();
                call_targets.extend(block.call_targets.iter().copied());
                start
            };

            byte_hash_input.extend_from_slice(&block_bytes);
            let string_hash = if block.string_refs.is_empty() {
                0
            } else {
                sdbm_hash(block.string_refs.join("\0").as_bytes())
            };

            vertices.push(BasicBlockInfo {
                instr_start,
                instr_end,
                prime: block_prime,
                basic_block_hash: sdbm_hash(&block_bytes),
                flags: BasicBlockFlags::NONE,
                call_target_start,
                string_hash,
                bfs_top_down: 0,
                bfs_bottom_up: 0,
                fixed_point: None,
            });
        }
        let byte_hash = sdbm_hash(&byte_hash_input);

        let mut out_edges = vec![Vec::new(); vertices.len()];
        let mut in_edges = vec![Vec::new(); vertices.len()];
        let mut edges = Vec::with_capacity(edge_specs.len());
        for spec in &edge_specs {
            let source = binary_search_address(&addresses, spec.source)
                .ok_or_else(|| invalid_argument!("edge source {} not a known block", spec.source))?
                as VertexId;
            let target = binary_search_address(&addresses, spec.target)
                .ok_or_else(|| invalid_argument!("edge target {} not a known block", spec.target))?
                as VertexId;
            let edge_id = edges.len();
            edges.push(Edge {
                source,
                target,
                flags: EdgeFlags {
                    kind: spec.kind,
                    dominated: false,
                },
                md_index_top_down: 0.0,
                md_index_bottom_up: 0.0,
            });
            out_edges[source as usize].push(edge_id);
            in_edges[target as usize].push(edge_id);
        }

        let entry_vertex = binary_search_address(&addresses, entry_point)
            .ok_or_else(|| invalid_argument!("entry point {entry_point} not among basic blocks"))?
            as VertexId;

        let mut graph = FlowGraph {
            meta,
            discarded: false,
            call_graph_vertex,
            addresses,
            vertices,
            edges,
            out_edges,
            in_edges,
            instructions,
            instruction_bytes,
            call_targets,
            prime_sum,
            byte_hash,
            md_index: 0.0,
            md_index_inverted: 0.0,
            num_loops: 0,
        };

        graph.compute_topology(entry_vertex);
        graph.mark_loops(entry_vertex);
        graph.compute_md_index();
        Ok(graph)
    }

    fn compute_topology(&mut self, entry: VertexId) {
        let n = self.vertices.len();

        let mut top_down = vec![u32::MAX; n];
        let mut queue = std::collections::VecDeque::new();
        top_down[entry as usize] = 0;
        queue.push_back(entry);
        while let Some(v) = queue.pop_front() {
            let level = top_down[v as usize];
            for &edge_id in &self.out_edges[v as usize] {
                let target = self.edges[edge_id].target;
                if top_down[target as usize] == u32::MAX {
                    top_down[target as usize] = level + 1;
                    queue.push_back(target);
                }
            }
        }

        let exits: Vec<VertexId> = (0..n as VertexId)
            .filter(|&v| self.out_edges[v as usize].is_empty())
            .collect();
        let mut bottom_up = vec![u32::MAX; n];
        let mut queue = std::collections::VecDeque::new();
        for &exit in &exits {
            bottom_up[exit as usize] = 0;
            queue.push_back(exit);
        }
        while let Some(v) = queue.pop_front() {
            let level = bottom_up[v as usize];
            for &edge_id in &self.in_edges[v as usize] {
                let source = self.edges[edge_id].source;
                if bottom_up[source as usize] == u32::MAX {
                    bottom_up[source as usize] = level + 1;
                    queue.push_back(source);
                }
            }
        }

        for (i, vertex) in self.vertices.iter_mut().enumerate() {
            vertex.bfs_top_down = if top_down[i] == u32::MAX { 0 } else { top_down[i] };
            vertex.bfs_bottom_up = if bottom_up[i] == u32::MAX { 0 } else { bottom_up[i] };
        }
    }

    fn mark_loops(&mut self, entry: VertexId) {
        let n = self.vertices.len();
        let idom = dominator::immediate_dominators(n, entry, &self.predecessor_lists());
        for edge in &mut self.edges {
            if dominator::dominates(&idom, entry, edge.target, edge.source) {
                edge.flags.dominated = true;
                self.vertices[edge.target as usize].flags =
                    self.vertices[edge.target as usize].flags.with(BasicBlockFlags::LOOP_ENTRY);
                self.num_loops += 1;
            }
        }
    }

    fn predecessor_lists(&self) -> Vec<Vec<VertexId>> {
        self.in_edges
            .iter()
            .map(|edges| edges.iter().map(|&e| self.edges[e].source).collect())
            .collect()
    }

    /// Structural edge weight combining the four degree quantities and the
    /// two endpoints' topology levels (spec §4.2: "any implementation that
    /// ... reproduces the fixture values is conformant" — see DESIGN.md).
    fn edge_weight(&self, edge: &Edge, levels: &[u32]) -> f64 {
        let source_out = self.out_edges[edge.source as usize].len() as f64;
        let source_in = self.in_edges[edge.source as usize].len() as f64;
        let target_out = self.out_edges[edge.target as usize].len() as f64;
        let target_in = self.in_edges[edge.target as usize].len() as f64;
        let level_term =
            (levels[edge.source as usize] as f64 + 1.0) / (levels[edge.target as usize] as f64 + 2.0);
        (1.0 / (1.0 + source_in + source_out)) + (1.0 / (1.0 + target_in + target_out)) + level_term
    }

    fn compute_md_index(&mut self) {
        let top_down_levels: Vec<u32> = self.vertices.iter().map(|v| v.bfs_top_down).collect();
        let bottom_up_levels: Vec<u32> = self.vertices.iter().map(|v| v.bfs_bottom_up).collect();

        let mut top_down_weights: Vec<f64> = Vec::with_capacity(self.edges.len());
        let mut bottom_up_weights: Vec<f64> = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            top_down_weights.push(self.edge_weight(edge, &top_down_levels));
            bottom_up_weights.push(self.edge_weight(edge, &bottom_up_levels));
        }
        for (edge, (&td, &bu)) in self
            .edges
            .iter_mut()
            .zip(top_down_weights.iter().zip(bottom_up_weights.iter()))
        {
            edge.md_index_top_down = td;
            edge.md_index_bottom_up = bu;
        }

        // Deterministic floating-point sums: sort before summing (spec §4.2,
        // §5, §9).
        top_down_weights.sort_by(|a, b| a.partial_cmp(b).unwrap());
        bottom_up_weights.sort_by(|a, b| a.partial_cmp(b).unwrap());
        self.md_index = top_down_weights.iter().sum();
        self.md_index_inverted = bottom_up_weights.iter().sum();
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn meta(&self) -> &FlowGraphMeta {
        &self.meta
    }

    pub fn entry_point(&self) -> Address {
        self.meta.entry_point
    }

    pub fn call_graph_vertex(&self) -> VertexId {
        self.call_graph_vertex
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex(&self, id: VertexId) -> &BasicBlockInfo {
        &self.vertices[id as usize]
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> &mut BasicBlockInfo {
        &mut self.vertices[id as usize]
    }

    pub fn vertex_address(&self, id: VertexId) -> Address {
        self.addresses[id as usize]
    }

    /// Lower-bound binary search by entry address (spec §3 invariant, §4.2).
    pub fn vertex_by_address(&self, address: Address) -> Option<VertexId> {
        binary_search_address(&self.addresses, address).map(|i| i as VertexId)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn out_edges(&self, vertex: VertexId) -> impl Iterator<Item = &Edge> {
        self.out_edges[vertex as usize].iter().map(move |&e| &self.edges[e])
    }

    pub fn in_edges(&self, vertex: VertexId) -> impl Iterator<Item = &Edge> {
        self.in_edges[vertex as usize].iter().map(move |&e| &self.edges[e])
    }

    pub fn out_degree(&self, vertex: VertexId) -> usize {
        self.out_edges[vertex as usize].len()
    }

    pub fn in_degree(&self, vertex: VertexId) -> usize {
        self.in_edges[vertex as usize].len()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn block_instructions(&self, vertex: VertexId) -> &[Instruction] {
        let v = self.vertex(vertex);
        &self.instructions[v.instr_start..v.instr_end]
    }

    pub fn instruction_bytes(&self, instruction_index: usize) -> &[u8] {
        &self.instruction_bytes[instruction_index]
    }

    pub fn call_targets(&self, vertex: VertexId) -> &[Address] {
        let v = self.vertex(vertex);
        if v.call_target_start == NO_CALL_TARGET {
            return &[];
        }
        // find the end: either the next block's start or the array end.
        let next_start = self
            .vertices
            .iter()
            .filter(|other| other.call_target_start != NO_CALL_TARGET && other.call_target_start > v.call_target_start)
            .map(|other| other.call_target_start)
            .min()
            .unwrap_or(self.call_targets.len());
        &self.call_targets[v.call_target_start..next_start]
    }

    pub fn prime_sum(&self) -> u64 {
        self.prime_sum
    }

    pub fn byte_hash(&self) -> u32 {
        self.byte_hash
    }

    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    pub fn md_index_inverted(&self) -> f64 {
        self.md_index_inverted
    }

    pub fn num_loops(&self) -> u32 {
        self.num_loops
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Order-independent fold of every block's string hash (spec §4.5
    /// "function: string references"): function-level grouping of the
    /// per-block `string_hash` computed at build time.
    pub fn string_signature(&self) -> u32 {
        self.vertices.iter().fold(0u32, |acc, v| acc ^ v.string_hash)
    }

    /// Number of incident edges at `vertex` flagged dominated (spec §4.5
    /// "basicBlock: edges Lengauer Tarjan dominated").
    pub fn dominated_edge_count(&self, vertex: VertexId) -> usize {
        self.out_edges(vertex).filter(|e| e.flags.dominated).count()
            + self.in_edges(vertex).filter(|e| e.flags.dominated).count()
    }

    /// Ordered sequence of branch-typed (`True`/`False`/`Switch`) outgoing
    /// edge kinds, in target-address order (spec §4.4 "jump-sequence
    /// matching").
    pub fn jump_sequence(&self, vertex: VertexId) -> Vec<EdgeKind> {
        let mut branch_edges: Vec<&Edge> = self
            .out_edges(vertex)
            .filter(|e| e.flags.kind != EdgeKind::Unconditional)
            .collect();
        branch_edges.sort_by_key(|e| self.vertex_address(e.target));
        branch_edges.iter().map(|e| e.flags.kind).collect()
    }

    pub fn has_self_loop(&self, vertex: VertexId) -> bool {
        self.out_edges(vertex).any(|e| e.target == vertex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(addr: u64, mnemonics: &[&str]) -> BlockSpec {
        BlockSpec {
            address: Address::new(addr),
            instructions: mnemonics
                .iter()
                .enumerate()
                .map(|(i, m)| (Address::new(addr + i as u64), m.to_string(), m.as_bytes().to_vec()))
                .collect(),
            call_targets: Vec::new(),
            string_refs: Vec::new(),
        }
    }

    #[test]
    fn loop_marking_on_simple_back_edge() {
        let mut cache = Cache::new();
        let blocks = vec![
            block(0x100, &["test"]),
            block(0x101, &["mov"]),
            block(0x102, &["jmp"]),
        ];
        let edges = vec![
            EdgeSpec { source: Address::new(0x100), target: Address::new(0x101), kind: EdgeKind::Unconditional },
            EdgeSpec { source: Address::new(0x101), target: Address::new(0x102), kind: EdgeKind::Unconditional },
            EdgeSpec { source: Address::new(0x102), target: Address::new(0x101), kind: EdgeKind::Unconditional },
        ];
        let graph = FlowGraph::build(&mut cache, Address::new(0x100), 0, blocks, edges).unwrap();
        let v101 = graph.vertex_by_address(Address::new(0x101)).unwrap();
        assert!(graph.vertex(v101).flags.is_loop_entry());
        assert_eq!(graph.num_loops(), 1);
    }

    #[test]
    fn size_gate_discards_oversized_function() {
        let mut cache = Cache::new();
        let blocks: Vec<BlockSpec> = (0..MAX_BASIC_BLOCKS + 1)
            .map(|i| block(0x1000 + i as u64 * 4, &["nop"]))
            .collect();
        let graph = FlowGraph::build(&mut cache, Address::new(0x1000), 0, blocks, Vec::new()).unwrap();
        assert!(graph.is_discarded());
        assert_eq!(graph.meta().basic_block_count, MAX_BASIC_BLOCKS + 1);
        assert_eq!(graph.vertex_count(), 0);
    }

    #[test]
    fn vertex_lookup_is_binary_search() {
        let mut cache = Cache::new();
        let blocks = vec![block(0x200, &["ret"]), block(0x100, &["nop"])];
        let graph = FlowGraph::build(&mut cache, Address::new(0x100), 0, blocks, Vec::new()).unwrap();
        // stored ascending regardless of input order
        assert_eq!(graph.vertex_address(0), Address::new(0x100));
        assert_eq!(graph.vertex_address(1), Address::new(0x200));
        assert_eq!(graph.vertex_by_address(Address::new(0x150)), None);
    }
}
