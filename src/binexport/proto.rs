//! Decoded shape of the consumed artifact (spec §6.1). Grounded on
//! `original_source/binexport.cc`/`binexport.h` (`GetInstructionAddress`,
//! `GetAllInstructionAddresses`) and `original_source/flow_graph.cc`'s
//! comment-keying logic.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::address::Address;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaInformation {
    pub executable_name: String,
    pub executable_id: String,
    pub architecture_name: String,
    pub timestamp: i64,
}

/// Wire tag, not a reverse-engineered upstream value: `original_source/`
/// carries the enum's call sites (`GetEdgeTypeFromProto`) but not the
/// `.proto` file itself, so these are this crate's own canonical numbering
/// rather than the real BinExport2 wire constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
#[serde(try_from = "u8", into = "u8")]
pub enum EdgeType {
    ConditionTrue = 0,
    ConditionFalse = 1,
    Unconditional = 2,
    Switch = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
#[serde(try_from = "u8", into = "u8")]
pub enum VertexType {
    Normal = 0,
    Library = 1,
    Thunk = 2,
    Imported = 3,
    Invalid = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, Deserialize)]
#[repr(u8)]
#[serde(try_from = "u8", into = "u8")]
pub enum CommentType {
    Default = 0,
    Anterior = 1,
    Posterior = 2,
    Function = 3,
    Enum = 4,
    Location = 5,
    GlobalReference = 6,
    LocalReference = 7,
}

/// Base constant for the comment operand-number encoding (spec §6.1).
pub const K_MAX_OP: u32 = 8;

/// Maps a decoded comment onto the `(address, operand_num)` key used by the
/// flow graph's shared comment map (spec §4.2 step 4, §6.1), reproducing the
/// offset table verbatim.
pub fn comment_operand_num(kind: CommentType, operand_index: u32, repeatable: bool) -> u32 {
    match kind {
        CommentType::Default => K_MAX_OP + if repeatable { 1 } else { 2 },
        CommentType::Enum => operand_index,
        CommentType::Anterior => K_MAX_OP + 3,
        CommentType::Posterior => K_MAX_OP + 4,
        CommentType::Function => K_MAX_OP + if repeatable { 5 } else { 6 },
        CommentType::Location => K_MAX_OP + 7,
        CommentType::GlobalReference => K_MAX_OP + 1024 + operand_index,
        CommentType::LocalReference => K_MAX_OP + 2018 + operand_index,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Comment {
    pub instruction_index: u32,
    pub operand_index: u32,
    pub kind: CommentType,
    pub repeatable: bool,
    pub string_table_index: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Instruction {
    /// Present only on the first instruction of a continuous run (spec §6.1).
    pub address: Option<Address>,
    pub raw_bytes: Vec<u8>,
    pub mnemonic_index: u32,
    pub operand_indices: Vec<u32>,
    pub call_targets: Vec<Address>,
    pub comment_indices: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndexRange {
    pub begin: u32,
    pub end: Option<u32>,
}

impl IndexRange {
    /// `end` defaults to `begin + 1` (spec §6.1).
    pub fn resolved_end(&self) -> u32 {
        self.end.unwrap_or(self.begin + 1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasicBlock {
    pub instruction_index: Vec<IndexRange>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub source_basic_block_index: u32,
    pub target_basic_block_index: u32,
    pub kind: EdgeType,
    pub is_back_edge: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowGraph {
    pub entry_basic_block_index: u32,
    pub basic_block_index: Vec<u32>,
    pub edge: Vec<Edge>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallGraphVertex {
    pub address: Address,
    pub mangled_name: Option<String>,
    pub demangled_name: Option<String>,
    pub module_index: Option<u32>,
    pub library_index: Option<u32>,
    pub kind: VertexType,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CallGraphEdge {
    pub source_vertex_index: u32,
    pub target_vertex_index: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CallGraph {
    pub vertex: Vec<CallGraphVertex>,
    pub edge: Vec<CallGraphEdge>,
}

/// The decoded artifact as a whole. Field order mirrors spec §6.1.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BinExport2 {
    pub meta_information: MetaInformation,
    pub string_table: Vec<String>,
    pub mnemonic: Vec<String>,
    pub instruction: Vec<Instruction>,
    pub basic_block: Vec<BasicBlock>,
    pub flow_graph: Vec<FlowGraph>,
    pub call_graph: CallGraph,
    pub comment: Vec<Comment>,
}

/// Resolves the address of `instruction[index]`, walking backward through
/// the continuous run it belongs to when no address is stored directly.
/// Mirrors `original_source/binexport.cc`'s `GetInstructionAddress`.
pub fn instruction_address(proto: &BinExport2, index: usize) -> Address {
    if let Some(address) = proto.instruction[index].address {
        return address;
    }
    let mut delta: u64 = 0;
    let mut i = index;
    loop {
        i -= 1;
        delta += proto.instruction[i].raw_bytes.len() as u64;
        if let Some(address) = proto.instruction[i].address {
            return address.checked_add(delta).expect("instruction address overflow");
        }
    }
}

/// Resolves every instruction's address in one forward pass, equivalent to
/// (but cheaper than) calling [`instruction_address`] per index. Mirrors
/// `original_source/binexport.cc`'s `GetAllInstructionAddresses`.
pub fn all_instruction_addresses(proto: &BinExport2) -> Vec<Address> {
    let mut result = Vec::with_capacity(proto.instruction.len());
    let mut address = Address::ZERO;
    let mut next_address = Address::ZERO;
    for (i, instruction) in proto.instruction.iter().enumerate() {
        if let Some(stored) = instruction.address {
            address = stored;
            next_address = Address::new(stored.0 + instruction.raw_bytes.len() as u64);
        } else if i == 0 {
            panic!("first instruction in a BinExport2 artifact must carry an address");
        } else {
            address = next_address;
            next_address = Address::new(next_address.0 + instruction.raw_bytes.len() as u64);
        }
        result.push(address);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn instr(address: Option<u64>, size: usize) -> Instruction {
        Instruction {
            address: address.map(Address::new),
            raw_bytes: vec![0u8; size],
            ..Instruction::default()
        }
    }

    fn fixture() -> BinExport2 {
        let instruction = vec![
            instr(Some(0x10000000), 4),
            instr(None, 8),
            instr(None, 4),
            instr(None, 8),
            instr(Some(0x10000100), 4),
            instr(None, 8),
            instr(None, 4),
            instr(None, 8),
            instr(Some(0x20000000), 4),
            instr(Some(0x20000004), 4),
            instr(Some(0x20000008), 4),
        ];
        BinExport2 { instruction, ..BinExport2::default() }
    }

    #[test]
    fn instruction_address_spot_checks() {
        let proto = fixture();
        assert_eq!(instruction_address(&proto, 0), Address::new(0x10000000));
        assert_eq!(instruction_address(&proto, 3), Address::new(0x10000010));
        assert_eq!(instruction_address(&proto, 7), Address::new(0x10000110));
        assert_eq!(instruction_address(&proto, 9), Address::new(0x20000004));
    }

    #[test]
    fn all_instruction_addresses_matches_spot_checks() {
        let proto = fixture();
        let all = all_instruction_addresses(&proto);
        assert_eq!(all[0], Address::new(0x10000000));
        assert_eq!(all[3], Address::new(0x10000010));
        assert_eq!(all[7], Address::new(0x10000110));
        assert_eq!(all[9], Address::new(0x20000004));
    }

    #[rstest]
    #[case(CommentType::Default, 0, true, 9)]
    #[case(CommentType::Default, 0, false, 10)]
    #[case(CommentType::Anterior, 0, false, 11)]
    #[case(CommentType::Posterior, 0, false, 12)]
    #[case(CommentType::Function, 0, true, 13)]
    #[case(CommentType::Function, 0, false, 14)]
    #[case(CommentType::Location, 0, false, 15)]
    #[case(CommentType::Enum, 3, false, 3)]
    #[case(CommentType::GlobalReference, 2, false, 8 + 1024 + 2)]
    #[case(CommentType::LocalReference, 1, false, 8 + 2018 + 1)]
    fn comment_operand_num_offsets(#[case] kind: CommentType, #[case] operand_index: u32, #[case] repeatable: bool, #[case] expected: u32) {
        assert_eq!(comment_operand_num(kind, operand_index, repeatable), expected);
    }

    #[test]
    fn index_range_end_defaults_to_begin_plus_one() {
        let range = IndexRange { begin: 5, end: None };
        assert_eq!(range.resolved_end(), 6);
    }
}
