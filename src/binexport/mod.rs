//! C5: the consumed binary-export artifact (spec §6.1) and the emitted
//! legacy header (spec §6.2).
//!
//! The wire format itself (a real protocol-buffer schema in the original
//! system) is a declared external collaborator; what the core needs is the
//! decoded shape and the two address/offset conventions the spec pins down
//! (continuous-run instruction addressing, comment operand-number offsets).
//! `proto` models that decoded shape as plain Rust structs; `header` is the
//! one piece of wire format actually specified (§6.2) and is grounded on
//! `original_source/binexport_header.cc` byte-for-byte.

pub mod header;
pub mod proto;
pub mod reader;

pub use header::{BinExportHeader, FlowGraphOffset};
pub use proto::*;
pub use reader::build_from_artifact;

use std::io::Read;

/// Extension-trait-over-`Read` binary parsing idiom, the same shape as
/// `Vector35-idb-rs/src/ida_reader.rs`'s `IdaUnpack`, sized to exactly what
/// the legacy header needs: fixed-width little-endian integers.
pub trait BinExportRead: Read {
    fn read_u32_le(&mut self) -> std::io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<R: Read + ?Sized> BinExportRead for R {}
