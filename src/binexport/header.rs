//! The optional legacy binary header (spec §6.2), byte-for-byte from
//! `original_source/binexport_header.cc`: three little-endian `u32`s
//! followed by `num_flow_graphs` `(u64, u32)` pairs. Reading appends a
//! synthetic trailing entry bounding the last payload.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::binexport::BinExportRead;
use crate::error::Result;
use crate::invalid_argument;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowGraphOffset {
    pub address: u64,
    pub offset: u32,
}

#[derive(Clone, Debug, Default)]
pub struct BinExportHeader {
    pub meta_offset: u32,
    pub call_graph_offset: u32,
    pub num_flow_graphs: u32,
    pub flow_graph_offsets: Vec<FlowGraphOffset>,
}

impl BinExportHeader {
    pub fn new(num_flow_graphs: u32) -> Self {
        BinExportHeader {
            meta_offset: 0,
            call_graph_offset: 0,
            num_flow_graphs,
            flow_graph_offsets: vec![FlowGraphOffset::default(); num_flow_graphs as usize],
        }
    }

    /// Reads the header, then appends a synthetic trailing
    /// `{address: 0, offset: file_size}` entry bounding the last payload
    /// (spec §6.2, §8 E2E-D).
    pub fn parse_from<R: Read + Seek>(reader: &mut R) -> Result<BinExportHeader> {
        let meta_offset = reader.read_u32_le()?;
        let call_graph_offset = reader.read_u32_le()?;
        if meta_offset == 0 || call_graph_offset == 0 {
            return Err(invalid_argument!("invalid .BinExport input file: zero offset in header"));
        }

        let num_flow_graphs = reader.read_u32_le()?;
        let mut flow_graph_offsets = Vec::with_capacity(num_flow_graphs as usize + 1);
        for _ in 0..num_flow_graphs {
            let address = reader.read_u64_le()?;
            let offset = reader.read_u32_le()?;
            flow_graph_offsets.push(FlowGraphOffset { address, offset });
        }

        let current = reader.stream_position()?;
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(current))?;
        flow_graph_offsets.push(FlowGraphOffset {
            address: 0,
            offset: file_size as u32,
        });

        Ok(BinExportHeader {
            meta_offset,
            call_graph_offset,
            num_flow_graphs,
            flow_graph_offsets,
        })
    }

    /// Writes exactly `num_flow_graphs` entries — the synthetic trailing
    /// entry added by [`Self::parse_from`] is a read-side convenience and is
    /// never serialized.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.meta_offset.to_le_bytes())?;
        writer.write_all(&self.call_graph_offset.to_le_bytes())?;
        writer.write_all(&self.num_flow_graphs.to_le_bytes())?;
        for offset in self.flow_graph_offsets.iter().take(self.num_flow_graphs as usize) {
            writer.write_all(&offset.address.to_le_bytes())?;
            writer.write_all(&offset.offset.to_le_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_appends_synthetic_trailing_entry() {
        let mut header = BinExportHeader::new(2);
        header.meta_offset = 12;
        header.call_graph_offset = 200;
        header.flow_graph_offsets[0] = FlowGraphOffset { address: 0x1000, offset: 64 };
        header.flow_graph_offsets[1] = FlowGraphOffset { address: 0x2000, offset: 128 };

        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let header_len = buf.len();
        buf.extend(std::iter::repeat(0u8).take(37)); // trailing payload padding
        let file_size = buf.len();

        let mut cursor = Cursor::new(buf);
        let parsed = BinExportHeader::parse_from(&mut cursor).unwrap();
        assert_eq!(parsed.num_flow_graphs, 2);
        assert_eq!(parsed.flow_graph_offsets.len(), 3);
        assert_eq!(parsed.flow_graph_offsets[0].address, 0x1000);
        assert_eq!(parsed.flow_graph_offsets[2], FlowGraphOffset { address: 0, offset: file_size as u32 });
        assert_eq!(cursor.position() as usize, header_len);
    }

    #[test]
    fn zero_offset_is_rejected() {
        let buf = vec![0u8; 12];
        let mut cursor = Cursor::new(buf);
        assert!(BinExportHeader::parse_from(&mut cursor).is_err());
    }
}
