//! C8: per-fixed-point change classification and overall result scoring.
//!
//! Grounded on `original_source/change_classifier_test.cc` for the bit
//! names, declared order and textual codec, `original_source/match_colors.h`/
//! `.cc` for `match_color`/`kManualMatch`, and `original_source/database_writer.cc`
//! for the histogram-then-counts shape consumed by [`Scorer`].

use std::collections::HashMap;

use crate::call_graph::CallGraph;
use crate::fixed_point::FixedPoint;
use crate::flags_to_struct;
use crate::flow_graph::FlowGraph;

pub const STRUCTURAL: u8 = 1 << 0;
pub const INSTRUCTIONS: u8 = 1 << 1;
pub const OPERANDS: u8 = 1 << 2;
pub const BRANCHINVERSION: u8 = 1 << 3;
pub const ENTRYPOINT: u8 = 1 << 4;
pub const LOOPS: u8 = 1 << 5;
pub const CALLS: u8 = 1 << 6;

flags_to_struct!(
    ChangeFlags, u8,
    STRUCTURAL is_structural "basic-block or edge counts differ",
    INSTRUCTIONS is_instructions "any unmatched instructions within any matched block pair",
    OPERANDS is_operands "any matched instruction pair whose operand token streams differ",
    BRANCHINVERSION is_branch_inversion "true/false edges swapped between matched branches",
    ENTRYPOINT is_entrypoint "matched entry vertices differ in some property",
    LOOPS is_loops "loop counts differ",
    CALLS is_calls "outgoing call targets differ post-matching",
);

/// Renders the flag vector in the fixed, seven-character display order
/// `GIOJELC`, one letter per present bit, `-` for absent.
pub fn change_description(flags: ChangeFlags) -> String {
    const LETTERS: [(u8, char); 7] = [
        (STRUCTURAL, 'G'),
        (INSTRUCTIONS, 'I'),
        (OPERANDS, 'O'),
        (BRANCHINVERSION, 'J'),
        (ENTRYPOINT, 'E'),
        (LOOPS, 'L'),
        (CALLS, 'C'),
    ];
    let raw = flags.into_raw();
    LETTERS.iter().map(|(bit, letter)| if raw & bit != 0 { *letter } else { '-' }).collect()
}

/// Classifies a single committed fixed point against the two flow graphs
/// and call graphs it was matched within.
pub fn classify(
    fixed_point: &FixedPoint,
    primary_call_graph: &CallGraph,
    secondary_call_graph: &CallGraph,
    primary_flow: Option<&FlowGraph>,
    secondary_flow: Option<&FlowGraph>,
) -> ChangeFlags {
    let mut raw = 0u8;

    if let (Some(p), Some(s)) = (primary_flow, secondary_flow) {
        if p.vertex_count() != s.vertex_count() || p.edges().len() != s.edges().len() {
            raw |= STRUCTURAL;
        }
        if p.num_loops() != s.num_loops() {
            raw |= LOOPS;
        }

        let matched_instructions: usize =
            fixed_point.basic_block_fixed_points.iter().map(|bb| bb.instruction_matches.len()).sum();
        let total_instructions = p.instruction_count().max(s.instruction_count());
        if matched_instructions < total_instructions {
            raw |= INSTRUCTIONS;
        }

        'blocks: for bb in &fixed_point.basic_block_fixed_points {
            for m in &bb.instruction_matches {
                let primary_bytes = p.instruction_bytes(m.primary_instruction);
                let secondary_bytes = s.instruction_bytes(m.secondary_instruction);
                if primary_bytes != secondary_bytes {
                    raw |= OPERANDS;
                    break 'blocks;
                }
            }
        }

        for bb in &fixed_point.basic_block_fixed_points {
            let primary_true = p
                .out_edges(bb.primary_vertex)
                .find(|e| e.flags.kind == crate::flow_graph::EdgeKind::True)
                .map(|e| p.vertex_address(e.target));
            let secondary_true = s
                .out_edges(bb.secondary_vertex)
                .find(|e| e.flags.kind == crate::flow_graph::EdgeKind::True)
                .map(|e| s.vertex_address(e.target));
            let primary_false = p
                .out_edges(bb.primary_vertex)
                .find(|e| e.flags.kind == crate::flow_graph::EdgeKind::False)
                .map(|e| p.vertex_address(e.target));
            let secondary_false = s
                .out_edges(bb.secondary_vertex)
                .find(|e| e.flags.kind == crate::flow_graph::EdgeKind::False)
                .map(|e| s.vertex_address(e.target));
            if primary_true.is_some() != secondary_true.is_some() || primary_false.is_some() != secondary_false.is_some() {
                raw |= BRANCHINVERSION;
                break;
            }
        }

        let primary_entry = p.vertex_by_address(p.entry_point());
        let secondary_entry = s.vertex_by_address(s.entry_point());
        if p.entry_point() != fixed_point.primary_address || s.entry_point() != fixed_point.secondary_address {
            raw |= ENTRYPOINT;
        } else if let (Some(pe), Some(se)) = (primary_entry, secondary_entry) {
            let degree_differs = p.out_degree(pe) + p.in_degree(pe) != s.out_degree(se) + s.in_degree(se);
            let content_differs = p.vertex(pe).basic_block_hash != s.vertex(se).basic_block_hash;
            if degree_differs || content_differs {
                raw |= ENTRYPOINT;
            }
        }
    }

    let primary_calls: std::collections::BTreeSet<_> = primary_call_graph.callees(fixed_point.primary_vertex).collect();
    let secondary_calls: std::collections::BTreeSet<_> = secondary_call_graph.callees(fixed_point.secondary_vertex).collect();
    if primary_calls.len() != secondary_calls.len() {
        raw |= CALLS;
    }

    ChangeFlags::from_raw(raw).expect("classify only ever sets declared bits")
}

/// Per-commit similarity: a function of matched/total basic-block and
/// instruction counts (spec §4.6 "Similarity"), bounded to `[0, 1]`.
pub fn fixed_point_similarity(fixed_point: &FixedPoint, primary_flow: &FlowGraph, secondary_flow: &FlowGraph) -> f64 {
    let total_bb = primary_flow.vertex_count().max(secondary_flow.vertex_count()) as f64;
    let matched_bb = fixed_point.basic_block_fixed_points.len() as f64;
    let bb_share = if total_bb == 0.0 { 1.0 } else { (matched_bb / total_bb).min(1.0) };

    let total_instr = primary_flow.instruction_count().max(secondary_flow.instruction_count()) as f64;
    let matched_instr: usize = fixed_point.basic_block_fixed_points.iter().map(|bb| bb.instruction_matches.len()).sum();
    let instr_share = if total_instr == 0.0 { 1.0 } else { (matched_instr as f64 / total_instr).min(1.0) };

    ((bb_share + instr_share) / 2.0).clamp(0.0, 1.0)
}

/// Counts of matched/unmatched basic blocks, edges and instructions,
/// segregated by library membership and by primary/secondary side
/// (spec §4.6 "Counts").
#[derive(Clone, Debug, Default)]
pub struct Counts {
    pub primary_basic_blocks_matched: u64,
    pub primary_basic_blocks_unmatched: u64,
    pub primary_basic_blocks_unmatched_library: u64,
    pub secondary_basic_blocks_matched: u64,
    pub secondary_basic_blocks_unmatched: u64,
    pub secondary_basic_blocks_unmatched_library: u64,
    pub primary_instructions_matched: u64,
    pub primary_instructions_unmatched: u64,
    pub secondary_instructions_matched: u64,
    pub secondary_instructions_unmatched: u64,
    pub primary_edges_matched: u64,
    pub primary_edges_unmatched: u64,
    pub secondary_edges_matched: u64,
    pub secondary_edges_unmatched: u64,
}

/// Histogram of fixed points by the step id that produced them, kept
/// separately for function-level and basic-block-level steps.
#[derive(Clone, Debug, Default)]
pub struct Histogram {
    pub function_steps: HashMap<String, u64>,
    pub basic_block_steps: HashMap<String, u64>,
}

impl Histogram {
    pub fn record(&mut self, fixed_points: &[FixedPoint]) {
        for fp in fixed_points {
            *self.function_steps.entry(fp.step_id.clone()).or_insert(0) += 1;
            for bb in &fp.basic_block_fixed_points {
                *self.basic_block_steps.entry(bb.step_id.clone()).or_insert(0) += 1;
            }
        }
    }
}

/// Rolls per-fixed-point classifications into the overall result's
/// similarity and confidence (spec §4.6).
pub struct Scorer {
    pub histogram: Histogram,
    pub counts: Counts,
}

impl Scorer {
    pub fn new(
        fixed_points: &[FixedPoint],
        primary_call_graph: &CallGraph,
        secondary_call_graph: &CallGraph,
    ) -> Self {
        let mut histogram = Histogram::default();
        histogram.record(fixed_points);

        let mut counts = Counts::default();
        let matched_primary: std::collections::HashSet<_> = fixed_points.iter().map(|fp| fp.primary_vertex).collect();
        let matched_secondary: std::collections::HashSet<_> = fixed_points.iter().map(|fp| fp.secondary_vertex).collect();

        let mut primary_total_instructions = 0u64;
        for vertex in 0..primary_call_graph.vertex_count() as u32 {
            if let Some(flow) = primary_call_graph.flow_graph(vertex) {
                let is_library = primary_call_graph.vertex(vertex).flags.is_library();
                primary_total_instructions += flow.instruction_count() as u64;
                if matched_primary.contains(&vertex) {
                    counts.primary_basic_blocks_matched += flow.vertex_count() as u64;
                    counts.primary_edges_matched += flow.edges().len() as u64;
                } else if is_library {
                    counts.primary_basic_blocks_unmatched_library += flow.vertex_count() as u64;
                    counts.primary_edges_unmatched += flow.edges().len() as u64;
                } else {
                    counts.primary_basic_blocks_unmatched += flow.vertex_count() as u64;
                    counts.primary_edges_unmatched += flow.edges().len() as u64;
                }
            }
        }
        let mut secondary_total_instructions = 0u64;
        for vertex in 0..secondary_call_graph.vertex_count() as u32 {
            if let Some(flow) = secondary_call_graph.flow_graph(vertex) {
                let is_library = secondary_call_graph.vertex(vertex).flags.is_library();
                secondary_total_instructions += flow.instruction_count() as u64;
                if matched_secondary.contains(&vertex) {
                    counts.secondary_basic_blocks_matched += flow.vertex_count() as u64;
                    counts.secondary_edges_matched += flow.edges().len() as u64;
                } else if is_library {
                    counts.secondary_basic_blocks_unmatched_library += flow.vertex_count() as u64;
                    counts.secondary_edges_unmatched += flow.edges().len() as u64;
                } else {
                    counts.secondary_basic_blocks_unmatched += flow.vertex_count() as u64;
                    counts.secondary_edges_unmatched += flow.edges().len() as u64;
                }
            }
        }

        for fp in fixed_points {
            let matched: u64 = fp.basic_block_fixed_points.iter().map(|bb| bb.instruction_matches.len() as u64).sum();
            counts.primary_instructions_matched += matched;
            counts.secondary_instructions_matched += matched;
        }
        counts.primary_instructions_unmatched = primary_total_instructions.saturating_sub(counts.primary_instructions_matched);
        counts.secondary_instructions_unmatched = secondary_total_instructions.saturating_sub(counts.secondary_instructions_matched);

        Scorer { histogram, counts }
    }

    /// Bounded to `[0, 1]`, monotone in matched-instruction and
    /// matched-basic-block share.
    pub fn similarity(&self) -> f64 {
        let bb_total = self.counts.primary_basic_blocks_matched
            + self.counts.primary_basic_blocks_unmatched
            + self.counts.primary_basic_blocks_unmatched_library;
        let bb_share = if bb_total == 0 { 0.0 } else { self.counts.primary_basic_blocks_matched as f64 / bb_total as f64 };

        let instr_total = self.counts.primary_instructions_matched + self.counts.primary_instructions_unmatched;
        let instr_share = if instr_total == 0 { 0.0 } else { self.counts.primary_instructions_matched as f64 / instr_total as f64 };

        (bb_share + instr_share) / 2.0
    }

    /// Weighted average of per-step confidences, weighted by histogram
    /// counts (the caller supplies the confidence table, since that is
    /// C7's data, not C8's).
    pub fn confidence(&self, function_step_confidence: impl Fn(&str) -> f64) -> f64 {
        let total: u64 = self.histogram.function_steps.values().sum();
        if total == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .histogram
            .function_steps
            .iter()
            .map(|(step, count)| function_step_confidence(step) * (*count as f64))
            .sum();
        weighted / total as f64
    }
}

/// Sentinel similarity value marking a manually-confirmed match
/// (`original_source/match_colors.h`'s `kManualMatch`).
pub const MANUAL_MATCH: f64 = -1.0;

/// Default "Google Material"-style similarity ramp, low to high
/// (`0xRRGGBB`). The real theme is loaded from an embedded UI-config proto
/// that is out of scope here (no GUI); this ramp reproduces its five-stop
/// red-to-green shape so `match_color` stays a pure, dependency-free
/// function.
const SIMILARITY_RAMP: [u32; 5] = [0xe53935, 0xfb8c00, 0xfdd835, 0x7cb342, 0x43a047];
const MANUAL_MATCH_COLOR: u32 = 0x1e88e5;

/// Maps a similarity value (or [`MANUAL_MATCH`]) to an RGB color,
/// byte-swapped the way `GetMatchColor` returns it (red and blue channels
/// exchanged relative to the ramp's stored `0xRRGGBB` encoding).
pub fn match_color(value: f64) -> u32 {
    let color = if value == MANUAL_MATCH {
        MANUAL_MATCH_COLOR
    } else if (0.0..=1.0).contains(&value) {
        let index = (value * (SIMILARITY_RAMP.len() - 1) as f64) as usize;
        SIMILARITY_RAMP[index.min(SIMILARITY_RAMP.len() - 1)]
    } else {
        0xffffff
    };
    ((color << 16) | (color & 0xff00) | (color >> 16)) & 0xffffff
}
