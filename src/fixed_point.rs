//! Confirmed function-pair and basic-block-pair matches (spec §3 "Fixed
//! point"/"Basic-block fixed point", §9 "back-references from blocks to
//! fixed points").
//!
//! Grounded on `original_source/change_classifier_test.cc`'s
//! `DiffBinaryBuilder`/`FixedPoint::Add` idiom: a fixed point is built
//! incrementally (function-level commit, then one `Add` per basic-block
//! pair) and owns its basic-block sub-matches outright.

use std::collections::HashSet;

use crate::address::Address;
use crate::call_graph::VertexId as CallGraphVertexId;
use crate::classify::ChangeFlags;
use crate::error::Result;
use crate::failed_precondition;
use crate::flow_graph::VertexId as FlowGraphVertexId;

/// A matched pair of instructions, referenced by index into each flow
/// graph's instruction array (spec §3: "Instructions are referenced by
/// basic blocks through index ranges, never by pointer" — matches extend
/// that rule to pairs).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstructionMatch {
    pub primary_instruction: usize,
    pub secondary_instruction: usize,
}

#[derive(Clone, Debug)]
pub struct BasicBlockFixedPoint {
    pub primary_vertex: FlowGraphVertexId,
    pub secondary_vertex: FlowGraphVertexId,
    pub step_id: String,
    pub instruction_matches: Vec<InstructionMatch>,
}

/// Reserved step ids outside the ordered catalogue (spec §4.4's "function:
/// manual" and §4.5's "function: manual name" name the same reserved id;
/// `function: manual name` is used here since §4.5 gives it as the
/// catalogue's formal spelling).
pub const FUNCTION_MANUAL: &str = "function: manual name";
pub const FUNCTION_CALL_REFERENCE: &str = "function: call reference";
pub const BASICBLOCK_PROPAGATION: &str = "basicBlock: propagation";
pub const BASICBLOCK_MANUAL: &str = "basicBlock: manual";

#[derive(Clone, Debug)]
pub struct FixedPoint {
    pub primary_address: Address,
    pub secondary_address: Address,
    pub primary_vertex: CallGraphVertexId,
    pub secondary_vertex: CallGraphVertexId,
    pub step_id: String,
    pub similarity: f64,
    pub confidence: f64,
    pub flags: ChangeFlags,
    pub basic_block_fixed_points: Vec<BasicBlockFixedPoint>,
    pub comments_ported: bool,
}

impl FixedPoint {
    pub fn new(
        primary_address: Address,
        secondary_address: Address,
        primary_vertex: CallGraphVertexId,
        secondary_vertex: CallGraphVertexId,
        step_id: impl Into<String>,
        confidence: f64,
    ) -> Self {
        FixedPoint {
            primary_address,
            secondary_address,
            primary_vertex,
            secondary_vertex,
            step_id: step_id.into(),
            similarity: 0.0,
            confidence,
            flags: ChangeFlags::NONE,
            basic_block_fixed_points: Vec::new(),
            comments_ported: false,
        }
    }

    pub fn add_basic_block_match(
        &mut self,
        primary_vertex: FlowGraphVertexId,
        secondary_vertex: FlowGraphVertexId,
        step_id: impl Into<String>,
        instruction_matches: Vec<InstructionMatch>,
    ) {
        self.basic_block_fixed_points.push(BasicBlockFixedPoint {
            primary_vertex,
            secondary_vertex,
            step_id: step_id.into(),
            instruction_matches,
        });
    }
}

/// Ordered container of committed fixed points (spec §3 "Ownership
/// summary": "Fixed points are owned by a match set ... keyed by the
/// primary and secondary flow-graph pointers").
#[derive(Default)]
pub struct FixedPointSet {
    points: Vec<FixedPoint>,
    matched_primary: HashSet<CallGraphVertexId>,
    matched_secondary: HashSet<CallGraphVertexId>,
}

impl FixedPointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_primary_matched(&self, vertex: CallGraphVertexId) -> bool {
        self.matched_primary.contains(&vertex)
    }

    pub fn is_secondary_matched(&self, vertex: CallGraphVertexId) -> bool {
        self.matched_secondary.contains(&vertex)
    }

    /// Commits `fixed_point`. Fails if either endpoint is already matched
    /// (spec §7 `FailedPrecondition`: "duplicate fixed point commit").
    pub fn commit(&mut self, fixed_point: FixedPoint) -> Result<()> {
        if self.matched_primary.contains(&fixed_point.primary_vertex)
            || self.matched_secondary.contains(&fixed_point.secondary_vertex)
        {
            return Err(failed_precondition!(
                "duplicate fixed point commit for primary {} / secondary {}",
                fixed_point.primary_address,
                fixed_point.secondary_address
            ));
        }
        self.matched_primary.insert(fixed_point.primary_vertex);
        self.matched_secondary.insert(fixed_point.secondary_vertex);
        self.points.push(fixed_point);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixedPoint> {
        self.points.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FixedPoint> {
        self.points.iter_mut()
    }

    pub fn into_vec(self) -> Vec<FixedPoint> {
        self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_commit_is_rejected() {
        let mut set = FixedPointSet::new();
        set.commit(FixedPoint::new(Address::new(0x1000), Address::new(0x2000), 0, 0, "function: hash matching", 1.0))
            .unwrap();
        let dup = FixedPoint::new(Address::new(0x1000), Address::new(0x3000), 0, 1, "function: hash matching", 1.0);
        assert!(set.commit(dup).is_err());
    }

    #[test]
    fn distinct_vertices_commit_cleanly() {
        let mut set = FixedPointSet::new();
        set.commit(FixedPoint::new(Address::new(0x1000), Address::new(0x2000), 0, 0, "function: hash matching", 1.0))
            .unwrap();
        set.commit(FixedPoint::new(Address::new(0x1100), Address::new(0x2100), 1, 1, "function: hash matching", 1.0))
            .unwrap();
        assert_eq!(set.len(), 2);
    }
}
