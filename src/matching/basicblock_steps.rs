//! C7: the closed, ordered catalogue of basic-block-level matching steps
//! (spec §4.5), run by the sub-pipeline once a function pair is committed.

use crate::flow_graph::{EdgeKind, FlowGraph, VertexId};
use crate::matching::signature::{self, Signature};

pub type BasicBlockSignatureFn = fn(&FlowGraph, VertexId) -> Option<Signature>;

pub struct BasicBlockStep {
    pub id: &'static str,
    pub confidence: f64,
    pub signature: BasicBlockSignatureFn,
}

fn neighbor_primes(flow: &FlowGraph, vertex: VertexId) -> Vec<u64> {
    let own_prime = flow.vertex(vertex).prime;
    let mut primes: Vec<u64> = flow
        .out_edges(vertex)
        .map(|e| own_prime ^ flow.vertex(e.target).prime)
        .chain(flow.in_edges(vertex).map(|e| own_prime ^ flow.vertex(e.source).prime))
        .collect();
    primes.push(own_prime);
    primes
}

fn sig_edges_prime_product(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_multiset(neighbor_primes(flow, vertex)))
}

fn sig_hash_matching_min4(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let info = flow.vertex(vertex);
    if info.instr_end - info.instr_start < 4 {
        return None;
    }
    Some(signature::from_u32(info.basic_block_hash))
}

fn sig_prime_matching_min4(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let info = flow.vertex(vertex);
    if info.instr_end - info.instr_start < 4 {
        return None;
    }
    Some(signature::from_u64(info.prime))
}

fn sig_call_reference_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let targets: Vec<u64> = flow.call_targets(vertex).iter().map(|&a| a.into()).collect();
    Some(signature::from_multiset(targets))
}

fn sig_string_references_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_u32(flow.vertex(vertex).string_hash))
}

fn sig_edges_md_index_top_down(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let weights: Vec<f64> = flow.out_edges(vertex).map(|e| e.md_index_top_down).collect();
    let mut sorted = weights;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let sum: f64 = sorted.iter().sum();
    Some(signature::from_f64_bucketed(sum, 6))
}

fn sig_edges_md_index_bottom_up(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let weights: Vec<f64> = flow.in_edges(vertex).map(|e| e.md_index_bottom_up).collect();
    let mut sorted = weights;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let sum: f64 = sorted.iter().sum();
    Some(signature::from_f64_bucketed(sum, 6))
}

fn sig_md_index_top_down(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_u64(flow.vertex(vertex).bfs_top_down as u64))
}

fn sig_md_index_bottom_up(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_u64(flow.vertex(vertex).bfs_bottom_up as u64))
}

fn sig_relaxed_md_index(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let level = flow.vertex(vertex).bfs_top_down / 2;
    Some(signature::from_u64(level as u64))
}

fn sig_prime_matching_min0(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_u64(flow.vertex(vertex).prime))
}

fn sig_edges_dominated(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_u64(flow.dominated_edge_count(vertex) as u64))
}

fn sig_loop_entry_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_bool(flow.vertex(vertex).flags.is_loop_entry()))
}

fn sig_self_loop_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_bool(flow.has_self_loop(vertex)))
}

fn sig_entry_point_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_bool(flow.vertex_address(vertex) == flow.entry_point()))
}

fn sig_exit_point_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_bool(flow.out_degree(vertex) == 0))
}

fn sig_instruction_count_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let info = flow.vertex(vertex);
    Some(signature::from_u64((info.instr_end - info.instr_start) as u64))
}

fn edge_kind_code(kind: EdgeKind) -> u64 {
    match kind {
        EdgeKind::True => 0,
        EdgeKind::False => 1,
        EdgeKind::Unconditional => 2,
        EdgeKind::Switch => 3,
    }
}

fn sig_jump_sequence_matching(flow: &FlowGraph, vertex: VertexId) -> Option<Signature> {
    let sequence: Vec<u64> = flow.jump_sequence(vertex).into_iter().map(edge_kind_code).collect();
    Some(signature::from_sequence(&sequence))
}

pub fn catalogue() -> Vec<BasicBlockStep> {
    vec![
        BasicBlockStep { id: "basicBlock: edges prime product", confidence: 1.0, signature: sig_edges_prime_product },
        BasicBlockStep {
            id: "basicBlock: hash matching (4 instructions minimum)",
            confidence: 1.0,
            signature: sig_hash_matching_min4,
        },
        BasicBlockStep {
            id: "basicBlock: prime matching (4 instructions minimum)",
            confidence: 0.9,
            signature: sig_prime_matching_min4,
        },
        BasicBlockStep { id: "basicBlock: call reference matching", confidence: 0.8, signature: sig_call_reference_matching },
        BasicBlockStep {
            id: "basicBlock: string references matching",
            confidence: 0.8,
            signature: sig_string_references_matching,
        },
        BasicBlockStep { id: "basicBlock: edges MD index (top down)", confidence: 0.7, signature: sig_edges_md_index_top_down },
        BasicBlockStep {
            id: "basicBlock: edges MD index (bottom up)",
            confidence: 0.7,
            signature: sig_edges_md_index_bottom_up,
        },
        BasicBlockStep { id: "basicBlock: MD index matching (top down)", confidence: 0.7, signature: sig_md_index_top_down },
        BasicBlockStep { id: "basicBlock: MD index matching (bottom up)", confidence: 0.7, signature: sig_md_index_bottom_up },
        BasicBlockStep { id: "basicBlock: relaxed MD index matching", confidence: 0.6, signature: sig_relaxed_md_index },
        BasicBlockStep {
            id: "basicBlock: prime matching (0 instructions minimum)",
            confidence: 0.5,
            signature: sig_prime_matching_min0,
        },
        BasicBlockStep {
            id: "basicBlock: edges Lengauer Tarjan dominated",
            confidence: 0.4,
            signature: sig_edges_dominated,
        },
        BasicBlockStep { id: "basicBlock: loop entry matching", confidence: 0.4, signature: sig_loop_entry_matching },
        BasicBlockStep { id: "basicBlock: self loop matching", confidence: 0.3, signature: sig_self_loop_matching },
        BasicBlockStep { id: "basicBlock: entry point matching", confidence: 0.2, signature: sig_entry_point_matching },
        BasicBlockStep { id: "basicBlock: exit point matching", confidence: 0.1, signature: sig_exit_point_matching },
        BasicBlockStep {
            id: "basicBlock: instruction count matching",
            confidence: 0.0,
            signature: sig_instruction_count_matching,
        },
        BasicBlockStep { id: "basicBlock: jump sequence matching", confidence: 0.0, signature: sig_jump_sequence_matching },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_starts_and_ends_at_declared_confidences() {
        let steps = catalogue();
        assert_eq!(steps.first().unwrap().confidence, 1.0);
        assert_eq!(steps.last().unwrap().confidence, 0.0);
        assert_eq!(steps.len(), 18);
    }
}
