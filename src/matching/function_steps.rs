//! C7: the closed, ordered catalogue of function-level matching steps
//! (spec §4.5). Declaration order here *is* the matching order (spec
//! §4.4): earlier steps claim 1x1 buckets before later, weaker ones run.

use crate::call_graph::{CallGraph, Direction, VertexId};
use crate::matching::signature::{self, Signature};

pub type FunctionSignatureFn = fn(&CallGraph, VertexId) -> Option<Signature>;

pub struct FunctionStep {
    pub id: &'static str,
    pub confidence: f64,
    pub signature: FunctionSignatureFn,
}

fn sig_hash_matching(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_u32(flow.byte_hash()))
}

fn sig_edges_flowgraph_md_index(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_f64_bucketed(flow.md_index(), 6))
}

fn sig_edges_callgraph_md_index(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_f64_bucketed(call_graph.vertex_md_contribution(vertex, Direction::Both), 6))
}

fn sig_md_index_flowgraph_top_down(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_f64_bucketed(flow.md_index(), 6))
}

fn sig_md_index_flowgraph_bottom_up(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_f64_bucketed(flow.md_index_inverted(), 6))
}

fn sig_prime_signature(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_u64(flow.prime_sum()))
}

fn sig_md_index_callgraph_top_down(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_f64_bucketed(call_graph.vertex_md_contribution(vertex, Direction::Out), 6))
}

fn sig_md_index_callgraph_bottom_up(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_f64_bucketed(call_graph.vertex_md_contribution(vertex, Direction::In), 6))
}

fn sig_relaxed_md_index(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_f64_bucketed(flow.md_index(), 1))
}

fn sig_instruction_count(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_u64(flow.instruction_count() as u64))
}

fn sig_string_references(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_u32(flow.string_signature()))
}

fn sig_loop_count(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    let flow = call_graph.flow_graph(vertex)?;
    Some(signature::from_u64(flow.num_loops() as u64))
}

fn callee_addresses(call_graph: &CallGraph, vertex: VertexId) -> Vec<u64> {
    call_graph.callees(vertex).map(|v| call_graph.vertex_address(v).into()).collect()
}

fn sig_call_sequence_exact(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_sequence(&callee_addresses(call_graph, vertex)))
}

fn sig_call_sequence_topology(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_u64(call_graph.out_degree(vertex) as u64))
}

fn sig_call_sequence_sequence(call_graph: &CallGraph, vertex: VertexId) -> Option<Signature> {
    Some(signature::from_multiset(callee_addresses(call_graph, vertex)))
}

/// Not used as a partition key: spec §4.5 describes "function: address
/// sequence" as "signed delta to prior matched function's address, used
/// only as a propagation tiebreaker", not a bucketing signature. Always
/// `None` here; `matching::pipeline` consults addresses directly when
/// tie-breaking.
fn sig_address_sequence(_call_graph: &CallGraph, _vertex: VertexId) -> Option<Signature> {
    None
}

pub fn catalogue() -> Vec<FunctionStep> {
    vec![
        FunctionStep { id: "function: hash matching", confidence: 1.0, signature: sig_hash_matching },
        FunctionStep { id: "function: edges flowgraph MD index", confidence: 1.0, signature: sig_edges_flowgraph_md_index },
        FunctionStep { id: "function: edges callgraph MD index", confidence: 0.9, signature: sig_edges_callgraph_md_index },
        FunctionStep {
            id: "function: MD index matching (flowgraph MD index, top down)",
            confidence: 0.9,
            signature: sig_md_index_flowgraph_top_down,
        },
        FunctionStep {
            id: "function: MD index matching (flowgraph MD index, bottom up)",
            confidence: 0.9,
            signature: sig_md_index_flowgraph_bottom_up,
        },
        FunctionStep { id: "function: prime signature matching", confidence: 0.9, signature: sig_prime_signature },
        FunctionStep {
            id: "function: MD index matching (callGraph MD index, top down)",
            confidence: 0.8,
            signature: sig_md_index_callgraph_top_down,
        },
        FunctionStep {
            id: "function: MD index matching (callGraph MD index, bottom up)",
            confidence: 0.8,
            signature: sig_md_index_callgraph_bottom_up,
        },
        FunctionStep { id: "function: relaxed MD index matching", confidence: 0.7, signature: sig_relaxed_md_index },
        FunctionStep { id: "function: instruction count", confidence: 0.4, signature: sig_instruction_count },
        FunctionStep { id: "function: address sequence", confidence: 0.4, signature: sig_address_sequence },
        FunctionStep { id: "function: string references", confidence: 0.7, signature: sig_string_references },
        FunctionStep { id: "function: loop count matching", confidence: 0.6, signature: sig_loop_count },
        FunctionStep {
            id: "function: call sequence matching (exact)",
            confidence: 0.1,
            signature: sig_call_sequence_exact,
        },
        FunctionStep {
            id: "function: call sequence matching (topology)",
            confidence: 0.0,
            signature: sig_call_sequence_topology,
        },
        FunctionStep {
            id: "function: call sequence matching (sequence)",
            confidence: 0.0,
            signature: sig_call_sequence_sequence,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_is_in_declared_confidence_order_for_the_top_steps() {
        let steps = catalogue();
        assert_eq!(steps[0].id, "function: hash matching");
        assert_eq!(steps[0].confidence, 1.0);
        assert_eq!(steps.last().unwrap().confidence, 0.0);
    }

    #[test]
    fn address_sequence_step_never_produces_a_bucket_key() {
        let graph = CallGraph::build(Vec::new(), Vec::new()).unwrap();
        assert!(sig_address_sequence(&graph, 0).is_none());
    }
}
