//! Record I/O collaborator traits.
//!
//! The engine never parses or emits the source record format itself; it
//! talks to four narrow collaborators. On the compression side a
//! [`RawInput`] produces raw records (opaque byte strings, typically lines)
//! and a [`RecordParser`] turns a raw record into a [`VariantDesc`] plus one
//! [`Cell`] per declared key. Decompression mirrors this with a
//! [`RecordFormatter`] and a [`RawOutput`]. The split matches the pipeline,
//! which runs I/O and parsing in different stages concurrently.
//!
//! [`MemoryInput`]/[`MemoryOutput`] are in-memory implementations carrying
//! records through a trivial length-prefixed raw form; the test suites and
//! benchmarks run the full pipeline against them.

use std::collections::VecDeque;

use varzip_core::error::{Result, VarzipError};
use varzip_core::varint;

use crate::record::{Cell, Record, VariantDesc};

/// Source of raw records.
pub trait RawInput: Send {
    /// Read the next raw record into `raw`; `false` at end of input.
    fn read_raw(&mut self, raw: &mut Vec<u8>) -> Result<bool>;
}

/// Parser from raw records to typed records.
pub trait RecordParser: Send {
    /// Parse one raw record. `cells` arrives sized to the key table.
    fn parse(&mut self, raw: &[u8], desc: &mut VariantDesc, cells: &mut [Cell]) -> Result<()>;
}

/// Formatter from typed records back to raw records.
pub trait RecordFormatter: Send {
    /// Format one record into `raw`.
    fn format(&mut self, desc: &VariantDesc, cells: &[Cell], raw: &mut Vec<u8>) -> Result<()>;
}

/// Sink for raw records.
pub trait RawOutput: Send {
    /// Write one raw record.
    fn write_raw(&mut self, raw: &[u8]) -> Result<()>;
}

// ---- in-memory implementations ----------------------------------------

fn serialize_record(desc: &VariantDesc, cells: &[Cell], out: &mut Vec<u8>) {
    out.clear();
    varint::put_str(out, &desc.chrom);
    varint::put_int(out, desc.pos);
    varint::put_str(out, &desc.id);
    varint::put_str(out, &desc.ref_allele);
    varint::put_str(out, &desc.alt);
    varint::put_str(out, &desc.qual);

    varint::put_uint(out, cells.len() as u64);
    for cell in cells {
        out.push(u8::from(cell.present));
        varint::put_uint(out, u64::from(cell.count));
        varint::put_uint(out, cell.data.len() as u64);
        out.extend_from_slice(&cell.data);
    }
}

fn deserialize_record(raw: &[u8], desc: &mut VariantDesc, cells: &mut [Cell]) -> Result<()> {
    let mut pos = 0usize;
    desc.chrom = varint::get_str(raw, &mut pos)?;
    desc.pos = varint::get_int(raw, &mut pos)?;
    desc.id = varint::get_str(raw, &mut pos)?;
    desc.ref_allele = varint::get_str(raw, &mut pos)?;
    desc.alt = varint::get_str(raw, &mut pos)?;
    desc.qual = varint::get_str(raw, &mut pos)?;

    let n = varint::get_uint(raw, &mut pos)? as usize;
    if n != cells.len() {
        return Err(VarzipError::corrupt_input("cell count mismatch"));
    }

    for cell in cells.iter_mut() {
        cell.present = raw
            .get(pos)
            .copied()
            .ok_or_else(|| VarzipError::corrupt_input("truncated record"))?
            != 0;
        pos += 1;
        cell.count = varint::get_uint(raw, &mut pos)? as u32;
        let len = varint::get_uint(raw, &mut pos)? as usize;
        cell.data = raw
            .get(pos..pos + len)
            .ok_or_else(|| VarzipError::corrupt_input("truncated record"))?
            .to_vec();
        pos += len;
    }

    Ok(())
}

/// In-memory record source: hands out pre-built records through the raw
/// form.
#[derive(Debug, Default)]
pub struct MemoryInput {
    records: VecDeque<Vec<u8>>,
}

impl MemoryInput {
    /// Build an input over the given records.
    pub fn new(records: &[Record]) -> Self {
        let mut queue = VecDeque::with_capacity(records.len());
        let mut buf = Vec::new();
        for (desc, cells) in records {
            serialize_record(desc, cells, &mut buf);
            queue.push_back(buf.clone());
        }
        Self { records: queue }
    }
}

impl RawInput for MemoryInput {
    fn read_raw(&mut self, raw: &mut Vec<u8>) -> Result<bool> {
        match self.records.pop_front() {
            Some(bytes) => {
                *raw = bytes;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Parser for the in-memory raw form.
#[derive(Debug, Default)]
pub struct MemoryParser;

impl RecordParser for MemoryParser {
    fn parse(&mut self, raw: &[u8], desc: &mut VariantDesc, cells: &mut [Cell]) -> Result<()> {
        deserialize_record(raw, desc, cells)
    }
}

/// Formatter into the in-memory raw form.
#[derive(Debug, Default)]
pub struct MemoryFormatter;

impl RecordFormatter for MemoryFormatter {
    fn format(&mut self, desc: &VariantDesc, cells: &[Cell], raw: &mut Vec<u8>) -> Result<()> {
        serialize_record(desc, cells, raw);
        Ok(())
    }
}

/// In-memory record sink; collects the decoded records.
#[derive(Debug, Default)]
pub struct MemoryOutput {
    /// Collected raw records.
    pub raws: Vec<Vec<u8>>,
}

impl MemoryOutput {
    /// Decode the collected raw records back into typed records.
    pub fn into_records(self, no_keys: usize) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(self.raws.len());
        for raw in &self.raws {
            let mut desc = VariantDesc::default();
            let mut cells = vec![Cell::default(); no_keys];
            deserialize_record(raw, &mut desc, &mut cells)?;
            records.push((desc, cells));
        }
        Ok(records)
    }
}

impl RawOutput for MemoryOutput {
    fn write_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.raws.push(raw.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Cell;

    #[test]
    fn test_memory_raw_form_roundtrip() {
        let desc = VariantDesc {
            chrom: "chr1".into(),
            pos: 100,
            id: ".".into(),
            ref_allele: "A".into(),
            alt: "T".into(),
            qual: "30".into(),
        };
        let cells = vec![Cell::flag(true), Cell::ints(&[42, 7])];

        let mut raw = Vec::new();
        serialize_record(&desc, &cells, &mut raw);

        let mut desc2 = VariantDesc::default();
        let mut cells2 = vec![Cell::default(); 2];
        deserialize_record(&raw, &mut desc2, &mut cells2).unwrap();

        assert_eq!(desc2, desc);
        assert_eq!(cells2, cells);
    }
}
