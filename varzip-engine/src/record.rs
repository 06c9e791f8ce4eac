//! Keys, variant descriptions, and cells.

use varzip_core::error::{Result, VarzipError};

/// Which record section a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// FILTER key: a per-record flag.
    Filter,
    /// INFO key: per-record values.
    Info,
    /// FORMAT key: per-sample values.
    Format,
}

impl KeyKind {
    /// Wire byte of the kind.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Filter => 0,
            Self::Info => 1,
            Self::Format => 2,
        }
    }

    /// Parse the wire byte.
    pub fn from_u8(x: u8) -> Result<Self> {
        match x {
            0 => Ok(Self::Filter),
            1 => Ok(Self::Info),
            2 => Ok(Self::Format),
            _ => Err(VarzipError::corrupt_archive("unknown key kind")),
        }
    }
}

/// Value type of a key's cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Present/absent only.
    Flag,
    /// 32-bit integers (the genotype column is stored as Int).
    Int,
    /// 32-bit floats, handled as opaque bit patterns.
    Real,
    /// Byte strings.
    Str,
}

impl ValueType {
    /// Wire byte of the type.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Flag => 0,
            Self::Int => 1,
            Self::Real => 2,
            Self::Str => 3,
        }
    }

    /// Parse the wire byte.
    pub fn from_u8(x: u8) -> Result<Self> {
        match x {
            0 => Ok(Self::Flag),
            1 => Ok(Self::Int),
            2 => Ok(Self::Real),
            3 => Ok(Self::Str),
            _ => Err(VarzipError::corrupt_archive("unknown value type")),
        }
    }
}

/// One declared FILTER/INFO/FORMAT column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDesc {
    /// Stable id assigned by the record source.
    pub key_id: u32,
    /// Record section.
    pub kind: KeyKind,
    /// Cell value type.
    pub value_type: ValueType,
}

/// The fixed descriptive tuple of a record. Position is delta-coded against
/// the previous record inside the archive; the quality field stays textual
/// so its exact spelling survives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDesc {
    /// Chromosome / contig name.
    pub chrom: String,
    /// 1-based position.
    pub pos: i64,
    /// Record id (`.` when absent).
    pub id: String,
    /// Reference allele.
    pub ref_allele: String,
    /// Alternate alleles, comma separated.
    pub alt: String,
    /// Quality, verbatim text.
    pub qual: String,
}

/// Value of one (record, key) pair. For FORMAT keys `count` is
/// samples × items-per-sample; for INFO it is the item count; for strings
/// the byte count; flags carry no payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    /// Whether the key is present in this record.
    pub present: bool,
    /// Payload bytes (4 × count for int/real, count for text).
    pub data: Vec<u8>,
    /// Number of value slots.
    pub count: u32,
}

impl Cell {
    /// A present cell over 32-bit values.
    pub fn ints(values: &[u32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            present: true,
            data,
            count: values.len() as u32,
        }
    }

    /// A present text cell.
    pub fn text(bytes: &[u8]) -> Self {
        Self {
            present: true,
            data: bytes.to_vec(),
            count: bytes.len() as u32,
        }
    }

    /// A flag cell.
    pub fn flag(present: bool) -> Self {
        Self {
            present,
            data: Vec::new(),
            count: u32::from(present),
        }
    }

    /// Payload reinterpreted as 32-bit words.
    pub fn as_ints(&self) -> Vec<u32> {
        self.data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

/// One decoded record: its description plus one cell per declared key.
pub type Record = (VariantDesc, Vec<Cell>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_bytes_roundtrip() {
        for kind in [KeyKind::Filter, KeyKind::Info, KeyKind::Format] {
            assert_eq!(KeyKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
        for vt in [ValueType::Flag, ValueType::Int, ValueType::Real, ValueType::Str] {
            assert_eq!(ValueType::from_u8(vt.as_u8()).unwrap(), vt);
        }
        assert!(KeyKind::from_u8(9).is_err());
    }

    #[test]
    fn test_cell_ints() {
        let c = Cell::ints(&[1, 0x8000_0001]);
        assert_eq!(c.count, 2);
        assert_eq!(c.as_ints(), vec![1, 0x8000_0001]);
    }
}
