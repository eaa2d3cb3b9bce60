//! C6: the matching pipeline that drives C7's step catalogues to a
//! committed [`FixedPointSet`].
//!
//! Grounded on `original_source/change_classifier_test.cc`'s
//! `DiffBinaryBuilder` for the overall "build two binaries, match them,
//! inspect the resulting fixed points" shape, and spec §4.4's declaration-
//! order loop / propagation / manual-match rules.

pub mod basicblock_steps;
pub mod function_steps;
pub mod signature;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::call_graph::{CallGraph, VertexId as CallGraphVertexId};
use crate::classify;
use crate::error::Result;
use crate::fixed_point::{self, FixedPoint, FixedPointSet, InstructionMatch};
use crate::flow_graph::{FlowGraph, VertexId as FlowGraphVertexId};
use crate::instruction::lcs;
use basicblock_steps::BasicBlockStep;
use function_steps::FunctionStep;
use signature::Signature;

/// Returned by the progress callback between steps (spec §4.4
/// "Cancellation and progress").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Stop,
}

fn matched_pairs_map(fixed_points: &FixedPointSet) -> HashMap<CallGraphVertexId, CallGraphVertexId> {
    fixed_points.iter().map(|fp| (fp.primary_vertex, fp.secondary_vertex)).collect()
}

fn propagation_overlap(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    p: CallGraphVertexId,
    s: CallGraphVertexId,
    matched: &HashMap<CallGraphVertexId, CallGraphVertexId>,
) -> i64 {
    let secondary_callees: HashSet<CallGraphVertexId> = secondary_cg.callees(s).collect();
    primary_cg
        .callees(p)
        .filter(|c| matched.get(c).is_some_and(|d| secondary_callees.contains(d)))
        .count() as i64
}

/// Resolves one signature bucket to zero or more committed pairs. A 1x1
/// bucket commits unconditionally. Larger buckets are scored by
/// propagation overlap, then lexicographic address order (spec §4.4); a
/// pair commits only if it is the unique top scorer for both of its
/// endpoints within its score tier, otherwise the step skips it
/// ambiguously and leaves it for a later, weaker step.
fn resolve_bucket(
    primary_candidates: &[CallGraphVertexId],
    secondary_candidates: &[CallGraphVertexId],
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    matched: &HashMap<CallGraphVertexId, CallGraphVertexId>,
) -> Vec<(CallGraphVertexId, CallGraphVertexId)> {
    if primary_candidates.len() == 1 && secondary_candidates.len() == 1 {
        return vec![(primary_candidates[0], secondary_candidates[0])];
    }

    let mut scored: Vec<(i64, u64, u64, CallGraphVertexId, CallGraphVertexId)> = Vec::new();
    for &p in primary_candidates {
        for &s in secondary_candidates {
            let overlap = propagation_overlap(primary_cg, secondary_cg, p, s, matched);
            scored.push((
                overlap,
                primary_cg.vertex_address(p).into(),
                secondary_cg.vertex_address(s).into(),
                p,
                s,
            ));
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut used_primary = HashSet::new();
    let mut used_secondary = HashSet::new();
    let mut commits = Vec::new();
    let mut i = 0;
    while i < scored.len() {
        let score = scored[i].0;
        let mut j = i;
        while j < scored.len() && scored[j].0 == score {
            j += 1;
        }
        let tier = &scored[i..j];
        for &(_, _, _, p, s) in tier {
            if used_primary.contains(&p) || used_secondary.contains(&s) {
                continue;
            }
            let p_count = tier.iter().filter(|&&(_, _, _, tp, _)| tp == p).count();
            let s_count = tier.iter().filter(|&&(_, _, _, _, ts)| ts == s).count();
            if p_count == 1 && s_count == 1 {
                used_primary.insert(p);
                used_secondary.insert(s);
                commits.push((p, s));
            }
        }
        i = j;
    }
    commits
}

fn partition_by_signature<V: Copy + Ord>(
    vertices: impl Iterator<Item = V>,
    already_matched: impl Fn(V) -> bool,
    signature_of: impl Fn(V) -> Option<Signature>,
) -> BTreeMap<Signature, Vec<V>> {
    let mut buckets: BTreeMap<Signature, Vec<V>> = BTreeMap::new();
    for v in vertices {
        if already_matched(v) {
            continue;
        }
        if let Some(sig) = signature_of(v) {
            buckets.entry(sig).or_default().push(v);
        }
    }
    buckets
}

fn merge_buckets<V: Copy + Ord>(
    primary: BTreeMap<Signature, Vec<V>>,
    mut secondary: BTreeMap<Signature, Vec<V>>,
) -> Vec<(Vec<V>, Vec<V>)> {
    primary
        .into_iter()
        .filter_map(|(sig, pv)| secondary.remove(&sig).map(|sv| (pv, sv)))
        .collect()
}

fn commit_function_pair(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    p: CallGraphVertexId,
    s: CallGraphVertexId,
    step_id: &str,
    confidence: f64,
    fixed_points: &mut FixedPointSet,
) -> Result<()> {
    let mut fp = FixedPoint::new(primary_cg.vertex_address(p), secondary_cg.vertex_address(s), p, s, step_id, confidence);
    run_basic_block_subpipeline(primary_cg, secondary_cg, p, s, &mut fp);
    fixed_points.commit(fp)
}

fn run_function_step(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    step: &FunctionStep,
    fixed_points: &mut FixedPointSet,
) -> Result<u32> {
    let matched = matched_pairs_map(fixed_points);
    let primary_buckets = partition_by_signature(
        0..primary_cg.vertex_count() as CallGraphVertexId,
        |v| fixed_points.is_primary_matched(v),
        |v| (step.signature)(primary_cg, v),
    );
    let secondary_buckets = partition_by_signature(
        0..secondary_cg.vertex_count() as CallGraphVertexId,
        |v| fixed_points.is_secondary_matched(v),
        |v| (step.signature)(secondary_cg, v),
    );

    let mut commits = 0u32;
    for (pc, sc) in merge_buckets(primary_buckets, secondary_buckets) {
        for (p, s) in resolve_bucket(&pc, &sc, primary_cg, secondary_cg, &matched) {
            commit_function_pair(primary_cg, secondary_cg, p, s, step.id, step.confidence, fixed_points)?;
            commits += 1;
        }
    }
    Ok(commits)
}

/// Re-runs function matching restricted to call-adjacent pairs of already
/// matched functions (spec §4.4 "Propagation"). Returns the number of new
/// commits this round.
fn run_propagation_round(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    steps: &[FunctionStep],
    fixed_points: &mut FixedPointSet,
) -> Result<u32> {
    let matched = matched_pairs_map(fixed_points);
    let mut eligible_primary = HashSet::new();
    let mut eligible_secondary = HashSet::new();
    for fp in fixed_points.iter() {
        eligible_primary.extend(primary_cg.callees(fp.primary_vertex).filter(|c| !fixed_points.is_primary_matched(*c)));
        eligible_secondary
            .extend(secondary_cg.callees(fp.secondary_vertex).filter(|c| !fixed_points.is_secondary_matched(*c)));
    }
    if eligible_primary.is_empty() || eligible_secondary.is_empty() {
        return Ok(0);
    }

    let mut commits = 0u32;
    for step in steps {
        let primary_buckets = partition_by_signature(
            eligible_primary.iter().copied(),
            |v| fixed_points.is_primary_matched(v),
            |v| (step.signature)(primary_cg, v),
        );
        let secondary_buckets = partition_by_signature(
            eligible_secondary.iter().copied(),
            |v| fixed_points.is_secondary_matched(v),
            |v| (step.signature)(secondary_cg, v),
        );
        for (pc, sc) in merge_buckets(primary_buckets, secondary_buckets) {
            for (p, s) in resolve_bucket(&pc, &sc, primary_cg, secondary_cg, &matched) {
                commit_function_pair(
                    primary_cg,
                    secondary_cg,
                    p,
                    s,
                    fixed_point::FUNCTION_CALL_REFERENCE,
                    step.confidence,
                    fixed_points,
                )?;
                commits += 1;
            }
        }
    }
    Ok(commits)
}

fn match_instructions(
    primary_flow: &FlowGraph,
    secondary_flow: &FlowGraph,
    primary_vertex: FlowGraphVertexId,
    secondary_vertex: FlowGraphVertexId,
) -> Vec<InstructionMatch> {
    let primary_instrs = primary_flow.block_instructions(primary_vertex);
    let secondary_instrs = secondary_flow.block_instructions(secondary_vertex);
    let offset_p = primary_flow.vertex(primary_vertex).instr_start;
    let offset_s = secondary_flow.vertex(secondary_vertex).instr_start;

    let mut matches: Vec<InstructionMatch> = lcs(primary_instrs, secondary_instrs)
        .into_iter()
        .map(|(i, j)| InstructionMatch { primary_instruction: offset_p + i, secondary_instruction: offset_s + j })
        .collect();

    if let (Some(first_p), Some(first_s)) = (primary_instrs.first(), secondary_instrs.first()) {
        if first_p.mnemonic_id() == first_s.mnemonic_id()
            && !matches.iter().any(|m| m.primary_instruction == offset_p)
            && !matches.iter().any(|m| m.secondary_instruction == offset_s)
        {
            matches.push(InstructionMatch { primary_instruction: offset_p, secondary_instruction: offset_s });
        }
    }
    if let (Some(last_p), Some(last_s)) = (primary_instrs.last(), secondary_instrs.last()) {
        let pi = offset_p + primary_instrs.len() - 1;
        let si = offset_s + secondary_instrs.len() - 1;
        if last_p.mnemonic_id() == last_s.mnemonic_id()
            && !matches.iter().any(|m| m.primary_instruction == pi)
            && !matches.iter().any(|m| m.secondary_instruction == si)
        {
            matches.push(InstructionMatch { primary_instruction: pi, secondary_instruction: si });
        }
    }

    matches.sort_by_key(|m| m.primary_instruction);
    matches.dedup();
    matches
}

fn run_basic_block_subpipeline(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    p: CallGraphVertexId,
    s: CallGraphVertexId,
    fp: &mut FixedPoint,
) {
    let (Some(primary_flow), Some(secondary_flow)) = (primary_cg.flow_graph(p), secondary_cg.flow_graph(s)) else {
        return;
    };
    if primary_flow.is_discarded() || secondary_flow.is_discarded() {
        return;
    }

    let mut matched_primary: HashSet<FlowGraphVertexId> = HashSet::new();
    let mut matched_secondary: HashSet<FlowGraphVertexId> = HashSet::new();

    for step in &basicblock_steps::catalogue() {
        let primary_buckets = partition_by_signature(
            0..primary_flow.vertex_count() as FlowGraphVertexId,
            |v| matched_primary.contains(&v),
            |v| (step.signature)(primary_flow, v),
        );
        let secondary_buckets = partition_by_signature(
            0..secondary_flow.vertex_count() as FlowGraphVertexId,
            |v| matched_secondary.contains(&v),
            |v| (step.signature)(secondary_flow, v),
        );
        for (pc, sc) in merge_buckets(primary_buckets, secondary_buckets) {
            if pc.len() != 1 || sc.len() != 1 {
                // Ambiguous buckets skip at this step; a later, weaker step
                // may still resolve the remaining candidates individually.
                continue;
            }
            let (pv, sv) = (pc[0], sc[0]);
            matched_primary.insert(pv);
            matched_secondary.insert(sv);
            let instruction_matches = match_instructions(primary_flow, secondary_flow, pv, sv);
            fp.add_basic_block_match(pv, sv, step.id, instruction_matches);
        }
    }
}

/// Runs the full function-level pipeline, then propagation, over two
/// already-built call graphs. `manual_matches` are committed first with
/// the reserved `function: manual name` step id and bypass step ordering
/// (spec §4.4). `progress` is invoked once per function step (by id) and
/// once per propagation round (with [`fixed_point::FUNCTION_CALL_REFERENCE`]);
/// returning [`StepControl::Stop`] ends the pipeline with the partial
/// result intact.
pub fn run(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    manual_matches: &[(CallGraphVertexId, CallGraphVertexId)],
    progress: impl FnMut(&str) -> StepControl,
) -> Result<FixedPointSet> {
    run_with_steps(primary_cg, secondary_cg, manual_matches, &function_steps::catalogue(), progress)
}

/// Returns the two catalogues the default pipeline runs (spec §4.5's closed,
/// ordered step lists). A collaborator may reorder or subset the function
/// step list and pass it to [`run_with_steps`]; no file-based configuration
/// format is in scope (spec's Non-goals) — this in-memory list is the whole
/// of "configuration" here.
pub fn default_pipeline() -> (Vec<function_steps::FunctionStep>, Vec<basicblock_steps::BasicBlockStep>) {
    (function_steps::catalogue(), basicblock_steps::catalogue())
}

/// Same as [`run`], but over a caller-supplied function step list instead of
/// the full declared catalogue (e.g. a reordered or subset list from
/// [`default_pipeline`]). The basic-block sub-pipeline always runs the full
/// catalogue regardless, since it is not exposed as a collaborator seam.
pub fn run_with_steps(
    primary_cg: &CallGraph,
    secondary_cg: &CallGraph,
    manual_matches: &[(CallGraphVertexId, CallGraphVertexId)],
    steps: &[function_steps::FunctionStep],
    mut progress: impl FnMut(&str) -> StepControl,
) -> Result<FixedPointSet> {
    let mut fixed_points = FixedPointSet::new();

    for &(p, s) in manual_matches {
        commit_function_pair(primary_cg, secondary_cg, p, s, fixed_point::FUNCTION_MANUAL, 1.0, &mut fixed_points)?;
    }

    for step in steps {
        if progress(step.id) == StepControl::Stop {
            finalize(primary_cg, secondary_cg, &mut fixed_points);
            return Ok(fixed_points);
        }
        run_function_step(primary_cg, secondary_cg, step, &mut fixed_points)?;
    }

    loop {
        if progress(fixed_point::FUNCTION_CALL_REFERENCE) == StepControl::Stop {
            break;
        }
        let commits = run_propagation_round(primary_cg, secondary_cg, steps, &mut fixed_points)?;
        if commits == 0 {
            break;
        }
    }

    finalize(primary_cg, secondary_cg, &mut fixed_points);
    Ok(fixed_points)
}

/// Assigns similarity and change flags to every committed fixed point
/// (spec §4.6), once matching has finished.
fn finalize(primary_cg: &CallGraph, secondary_cg: &CallGraph, fixed_points: &mut FixedPointSet) {
    for fp in fixed_points.iter_mut() {
        let primary_flow = primary_cg.flow_graph(fp.primary_vertex);
        let secondary_flow = secondary_cg.flow_graph(fp.secondary_vertex);
        fp.flags = classify::classify(fp, primary_cg, secondary_cg, primary_flow, secondary_flow);
        if let (Some(pf), Some(sf)) = (primary_flow, secondary_flow) {
            fp.similarity = classify::fixed_point_similarity(fp, pf, sf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::call_graph::{CallGraph, VertexFlags, VertexSpec};
    use crate::flow_graph::{BlockSpec, EdgeKind, EdgeSpec, FlowGraph};
    use crate::instruction::Cache;

    fn vertex(address: u64) -> VertexSpec {
        VertexSpec {
            address: Address::new(address),
            mangled_name: None,
            demangled_name: None,
            module_name: None,
            library_name: None,
            flags: VertexFlags::NONE,
        }
    }

    fn single_block_function(cache: &mut Cache, entry: u64, call_graph_vertex: CallGraphVertexId, mnemonics: &[&str]) -> FlowGraph {
        let block = BlockSpec {
            address: Address::new(entry),
            instructions: mnemonics
                .iter()
                .enumerate()
                .map(|(i, m)| (Address::new(entry + i as u64), m.to_string(), m.as_bytes().to_vec()))
                .collect(),
            call_targets: Vec::new(),
            string_refs: Vec::new(),
        };
        FlowGraph::build(cache, Address::new(entry), call_graph_vertex, vec![block], Vec::new()).unwrap()
    }

    #[test]
    fn identical_single_function_binaries_match_on_hash() {
        let mut cache = Cache::new();
        let mut primary = CallGraph::build(vec![vertex(0x1000)], Vec::new()).unwrap();
        let mut secondary = CallGraph::build(vec![vertex(0x9000)], Vec::new()).unwrap();
        primary.attach_flow_graph(single_block_function(&mut cache, 0x1000, 0, &["push", "mov", "pop", "ret"])).unwrap();
        secondary.attach_flow_graph(single_block_function(&mut cache, 0x9000, 0, &["push", "mov", "pop", "ret"])).unwrap();

        let fixed_points = run(&primary, &secondary, &[], |_| StepControl::Continue).unwrap();
        assert_eq!(fixed_points.len(), 1);
        let fp = fixed_points.iter().next().unwrap();
        assert_eq!(fp.step_id, "function: hash matching");
        assert_eq!(fp.basic_block_fixed_points.len(), 1);
        assert_eq!(fp.basic_block_fixed_points[0].instruction_matches.len(), 4);
    }

    #[test]
    fn manual_match_bypasses_step_ordering() {
        let mut cache = Cache::new();
        let mut primary = CallGraph::build(vec![vertex(0x1000), vertex(0x2000)], Vec::new()).unwrap();
        let mut secondary = CallGraph::build(vec![vertex(0x9000), vertex(0xa000)], Vec::new()).unwrap();
        primary.attach_flow_graph(single_block_function(&mut cache, 0x1000, 0, &["nop"])).unwrap();
        primary.attach_flow_graph(single_block_function(&mut cache, 0x2000, 1, &["ret"])).unwrap();
        secondary.attach_flow_graph(single_block_function(&mut cache, 0x9000, 0, &["ret"])).unwrap();
        secondary.attach_flow_graph(single_block_function(&mut cache, 0xa000, 1, &["nop"])).unwrap();

        let fixed_points = run(&primary, &secondary, &[(0, 0)], |_| StepControl::Continue).unwrap();
        assert!(fixed_points.iter().any(|fp| fp.step_id == fixed_point::FUNCTION_MANUAL && fp.primary_vertex == 0 && fp.secondary_vertex == 0));
    }

    #[test]
    fn stopping_on_first_step_yields_an_empty_but_valid_result() {
        let mut cache = Cache::new();
        let mut primary = CallGraph::build(vec![vertex(0x1000)], Vec::new()).unwrap();
        let mut secondary = CallGraph::build(vec![vertex(0x9000)], Vec::new()).unwrap();
        primary.attach_flow_graph(single_block_function(&mut cache, 0x1000, 0, &["nop"])).unwrap();
        secondary.attach_flow_graph(single_block_function(&mut cache, 0x9000, 0, &["nop"])).unwrap();

        let fixed_points = run(&primary, &secondary, &[], |_| StepControl::Stop).unwrap();
        assert!(fixed_points.is_empty());
    }
}
