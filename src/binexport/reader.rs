//! Materializes C2/C3/C4 from a decoded artifact (spec §4.2 "Built by the
//! codec from a binary-export proto"). Grounded on
//! `original_source/reader/flow_graph.cc` and `original_source/reader/call_graph.cc`
//! for the two-pass shape: call graph first (so flow graphs can resolve
//! their owning vertex), then one flow graph per function.

use crate::address::Address;
use crate::binexport::proto::{all_instruction_addresses, BinExport2, EdgeType, VertexType};
use crate::call_graph::{CallGraph, VertexFlags, VertexSpec};
use crate::error::Result;
use crate::flow_graph::{BlockSpec, EdgeKind, EdgeSpec, FlowGraph};
use crate::instruction::Cache;
use crate::invalid_argument;

fn vertex_flags(kind: VertexType, has_mangled: bool, has_demangled: bool) -> VertexFlags {
    let mut flags = match kind {
        VertexType::Normal => VertexFlags::NONE,
        VertexType::Library => VertexFlags::LIBRARY,
        VertexType::Thunk => VertexFlags::THUNK,
        VertexType::Imported => VertexFlags::IMPORTED,
        VertexType::Invalid => VertexFlags::INVALID,
    };
    if has_mangled {
        flags = flags.with(VertexFlags::NAME);
    }
    if has_demangled {
        flags = flags.with(VertexFlags::DEMANGLED_NAME);
    }
    flags
}

fn edge_kind(kind: EdgeType) -> EdgeKind {
    match kind {
        EdgeType::ConditionTrue => EdgeKind::True,
        EdgeType::ConditionFalse => EdgeKind::False,
        EdgeType::Unconditional => EdgeKind::Unconditional,
        EdgeType::Switch => EdgeKind::Switch,
    }
}

fn block_entry_address(proto: &BinExport2, addresses: &[Address], bb_index: u32) -> Result<Address> {
    let block = proto
        .basic_block
        .get(bb_index as usize)
        .ok_or_else(|| invalid_argument!("flow graph references unknown basic block {bb_index}"))?;
    let first_range = block
        .instruction_index
        .first()
        .ok_or_else(|| invalid_argument!("basic block {bb_index} has no instructions"))?;
    Ok(addresses[first_range.begin as usize])
}

fn block_spec(proto: &BinExport2, addresses: &[Address], bb_index: u32) -> Result<BlockSpec> {
    let block = &proto.basic_block[bb_index as usize];
    let mut instructions = Vec::new();
    let mut call_targets = Vec::new();
    for range in &block.instruction_index {
        let end = range.resolved_end();
        for idx in range.begin..end {
            let instr = &proto.instruction[idx as usize];
            let mnemonic = proto
                .mnemonic
                .get(instr.mnemonic_index as usize)
                .ok_or_else(|| invalid_argument!("instruction {idx} references unknown mnemonic"))?;
            instructions.push((addresses[idx as usize], mnemonic.clone(), instr.raw_bytes.clone()));
            call_targets.extend(instr.call_targets.iter().copied());
        }
    }
    let address = instructions
        .first()
        .map(|(addr, ..)| *addr)
        .ok_or_else(|| invalid_argument!("basic block {bb_index} has no instructions"))?;
    Ok(BlockSpec {
        address,
        instructions,
        call_targets,
        string_refs: Vec::new(),
    })
}

/// Builds a call graph with every function's flow graph attached.
pub fn build_from_artifact(proto: &BinExport2, cache: &mut Cache) -> Result<CallGraph> {
    let vertex_specs: Vec<VertexSpec> = proto
        .call_graph
        .vertex
        .iter()
        .map(|v| VertexSpec {
            address: v.address,
            mangled_name: v.mangled_name.clone(),
            demangled_name: v.demangled_name.clone(),
            module_name: v.module_index.and_then(|i| proto.string_table.get(i as usize).cloned()),
            library_name: v.library_index.and_then(|i| proto.string_table.get(i as usize).cloned()),
            flags: vertex_flags(v.kind, v.mangled_name.is_some(), v.demangled_name.is_some()),
        })
        .collect();
    let edge_specs: Vec<(Address, Address)> = proto
        .call_graph
        .edge
        .iter()
        .map(|e| {
            (
                proto.call_graph.vertex[e.source_vertex_index as usize].address,
                proto.call_graph.vertex[e.target_vertex_index as usize].address,
            )
        })
        .collect();
    let mut call_graph = CallGraph::build(vertex_specs, edge_specs)?;

    let addresses = all_instruction_addresses(proto);

    for flow_graph_proto in &proto.flow_graph {
        let entry_point = block_entry_address(proto, &addresses, flow_graph_proto.entry_basic_block_index)?;
        let call_graph_vertex = call_graph
            .vertex_by_address(entry_point)
            .ok_or_else(|| invalid_argument!("flow graph entry {entry_point} has no call graph vertex"))?;

        let blocks: Result<Vec<BlockSpec>> = flow_graph_proto
            .basic_block_index
            .iter()
            .map(|&idx| block_spec(proto, &addresses, idx))
            .collect();
        let blocks = blocks?;

        let edges: Result<Vec<EdgeSpec>> = flow_graph_proto
            .edge
            .iter()
            .map(|e| {
                Ok(EdgeSpec {
                    source: block_entry_address(proto, &addresses, e.source_basic_block_index)?,
                    target: block_entry_address(proto, &addresses, e.target_basic_block_index)?,
                    kind: edge_kind(e.kind),
                })
            })
            .collect();
        let edges = edges?;

        let flow_graph = FlowGraph::build(cache, entry_point, call_graph_vertex, blocks, edges)?;
        call_graph.attach_flow_graph(flow_graph)?;
    }

    Ok(call_graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binexport::proto::{
        BasicBlock, CallGraphEdge as ProtoCallGraphEdge, CallGraphVertex, FlowGraph as ProtoFlowGraph,
        IndexRange, Instruction,
    };

    fn instr(address: Option<u64>, size: usize, mnemonic_index: u32) -> Instruction {
        Instruction {
            address: address.map(Address::new),
            raw_bytes: vec![0x90; size],
            mnemonic_index,
            ..Instruction::default()
        }
    }

    #[test]
    fn single_function_round_trips_into_call_and_flow_graph() {
        let mut proto = BinExport2 {
            mnemonic: vec!["nop".to_string(), "ret".to_string()],
            instruction: vec![instr(Some(0x1000), 1, 0), instr(Some(0x1001), 1, 1)],
            basic_block: vec![BasicBlock { instruction_index: vec![IndexRange { begin: 0, end: Some(2) }] }],
            ..BinExport2::default()
        };
        proto.flow_graph.push(ProtoFlowGraph {
            entry_basic_block_index: 0,
            basic_block_index: vec![0],
            edge: Vec::new(),
        });
        proto.call_graph.vertex.push(CallGraphVertex {
            address: Address::new(0x1000),
            mangled_name: None,
            demangled_name: None,
            module_index: None,
            library_index: None,
            kind: VertexType::Normal,
        });

        let mut cache = Cache::new();
        let call_graph = build_from_artifact(&proto, &mut cache).unwrap();
        assert_eq!(call_graph.vertex_count(), 1);
        let vertex = call_graph.vertex_by_address(Address::new(0x1000)).unwrap();
        let flow_graph = call_graph.flow_graph(vertex).unwrap();
        assert_eq!(flow_graph.vertex_count(), 1);
        assert_eq!(flow_graph.instruction_count(), 2);
    }

    #[test]
    fn two_functions_with_a_call_edge() {
        let mut proto = BinExport2 {
            mnemonic: vec!["ret".to_string()],
            instruction: vec![instr(Some(0x10000), 1, 0), instr(Some(0x20000), 1, 0)],
            basic_block: vec![
                BasicBlock { instruction_index: vec![IndexRange { begin: 0, end: None }] },
                BasicBlock { instruction_index: vec![IndexRange { begin: 1, end: None }] },
            ],
            ..BinExport2::default()
        };
        proto.flow_graph.push(ProtoFlowGraph { entry_basic_block_index: 0, basic_block_index: vec![0], edge: Vec::new() });
        proto.flow_graph.push(ProtoFlowGraph { entry_basic_block_index: 1, basic_block_index: vec![1], edge: Vec::new() });
        proto.call_graph.vertex.push(CallGraphVertex {
            address: Address::new(0x10000),
            mangled_name: None,
            demangled_name: None,
            module_index: None,
            library_index: None,
            kind: VertexType::Normal,
        });
        proto.call_graph.vertex.push(CallGraphVertex {
            address: Address::new(0x20000),
            mangled_name: None,
            demangled_name: None,
            module_index: None,
            library_index: None,
            kind: VertexType::Normal,
        });
        proto.call_graph.edge.push(ProtoCallGraphEdge { source_vertex_index: 1, target_vertex_index: 0 });

        let mut cache = Cache::new();
        let call_graph = build_from_artifact(&proto, &mut cache).unwrap();
        assert_eq!(call_graph.vertex_count(), 2);
        assert_eq!(call_graph.edges().len(), 1);
        assert!(call_graph.md_index() > 0.0);
    }
}
