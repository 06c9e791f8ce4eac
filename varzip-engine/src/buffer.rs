//! Per-column accumulators of typed cells.
//!
//! A [`ColumnBuffer`] holds two parallel vectors: one size entry per cell,
//! plus payload bytes for value-bearing cells. The writer side appends until
//! [`ColumnBuffer::is_full`]; the reader side is loaded from a decoded part
//! and consumed cell by cell. A buffer can instead hold a byte-wise mapping
//! ("function" mode), in which case reads translate the source column's
//! payload of the current record.
//!
//! Integer cells may be stored through a signed per-value varint with this
//! code table (value → lead byte):
//!
//! | value | code |
//! |---|---|
//! | 0 | 0 |
//! | `0x8000_0000` | 1 |
//! | 1..124 | value + 1 |
//! | −124..−1 | value + 250 |
//! | ± 2-byte magnitude | 250/251, then 2 bytes |
//! | ± 3-byte magnitude | 252/253, then 3 bytes |
//! | ± 4-byte magnitude | 254/255, then 4 bytes |

use std::collections::HashMap;
use varzip_core::error::{Result, VarzipError};

/// Byte-wise mapping from source-column payloads to this column's payloads.
pub type FunctionMap = HashMap<Vec<u8>, Vec<u8>>;

/// Accumulator for one column.
#[derive(Debug, Default)]
pub struct ColumnBuffer {
    max_size: u32,

    sizes: Vec<u32>,
    data: Vec<u8>,

    size_pos: usize,
    data_pos: usize,

    is_function: bool,
    no_data: bool,
    function: FunctionMap,
}

impl ColumnBuffer {
    /// Create a writer-side buffer that reports full at `max_size`.
    pub fn with_max_size(max_size: u32) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// `true` once the accumulated payload plus size entries reach the
    /// configured threshold.
    pub fn is_full(&self) -> bool {
        self.data.len() + 4 * self.sizes.len() >= self.max_size as usize
    }

    /// `true` when every loaded cell has been consumed.
    pub fn is_empty(&self) -> bool {
        self.size_pos >= self.sizes.len() && !self.is_function && !self.no_data
    }

    // ---- writer side ----------------------------------------------------

    /// Append a flag cell (the 0/1 travels in the size vector).
    pub fn write_flag(&mut self, flag: bool) {
        self.sizes.push(u32::from(flag));
    }

    /// Append an int/real cell: `count` 32-bit values as raw bytes.
    pub fn write_values(&mut self, payload: &[u8], count: u32) {
        self.sizes.push(count);
        self.data.extend_from_slice(&payload[..4 * count as usize]);
    }

    /// Append an int cell through the per-value varint.
    pub fn write_values_var(&mut self, payload: &[u8], count: u32) {
        self.sizes.push(count);
        for chunk in payload[..4 * count as usize].chunks_exact(4) {
            let v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            encode_cell_varint(&mut self.data, v);
        }
    }

    /// Append a position delta: sign and byte count packed into the size
    /// entry, big-endian magnitude bytes in the payload.
    pub fn write_int64(&mut self, x: i64) {
        let (mag, sign) = if x < 0 { (x.unsigned_abs(), 1) } else { (x as u64, 0) };

        let mut bytes = [0u8; 8];
        let mut no_bytes = 0usize;
        let mut tmp = mag;
        while tmp != 0 {
            bytes[no_bytes] = (tmp & 0xff) as u8;
            tmp >>= 8;
            no_bytes += 1;
        }

        self.sizes.push(sign + 2 * no_bytes as u32);
        for i in (0..no_bytes).rev() {
            self.data.push(bytes[i]);
        }
    }

    /// Append a text cell: `count` raw bytes.
    pub fn write_text(&mut self, payload: &[u8], count: u32) {
        self.sizes.push(count);
        if count != 0 {
            self.data.extend_from_slice(&payload[..count as usize]);
        }
    }

    /// Take the accumulated vectors and reset the buffer for the next part.
    pub fn take(&mut self) -> (Vec<u32>, Vec<u8>) {
        (std::mem::take(&mut self.sizes), std::mem::take(&mut self.data))
    }

    // ---- reader side ----------------------------------------------------

    /// Load a decoded part.
    pub fn load(&mut self, sizes: Vec<u32>, data: Vec<u8>) {
        self.no_data = sizes.is_empty();
        self.sizes = sizes;
        self.data = data;
        self.size_pos = 0;
        self.data_pos = 0;
        self.is_function = false;
    }

    /// Put the buffer into function mode with the given mapping.
    pub fn load_function(&mut self, function: FunctionMap) {
        self.function = function;
        self.is_function = true;
    }

    /// Read a flag cell; absent columns read as 0.
    pub fn read_flag(&mut self) -> bool {
        if self.sizes.is_empty() {
            return false;
        }
        let f = self.sizes[self.size_pos];
        self.size_pos += 1;
        f != 0
    }

    /// Read an int/real cell: raw payload plus slot count.
    pub fn read_values(&mut self) -> (Vec<u8>, u32) {
        if self.sizes.is_empty() {
            return (Vec::new(), 0);
        }

        let count = self.sizes[self.size_pos];
        self.size_pos += 1;

        let bytes = 4 * count as usize;
        let payload = self.data[self.data_pos..self.data_pos + bytes].to_vec();
        self.data_pos += bytes;

        (payload, count)
    }

    /// Read an int cell stored through the per-value varint.
    pub fn read_values_var(&mut self) -> Result<(Vec<u8>, u32)> {
        if self.sizes.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let count = self.sizes[self.size_pos];
        self.size_pos += 1;

        let mut payload = Vec::with_capacity(4 * count as usize);
        for _ in 0..count {
            let v = decode_cell_varint(&self.data, &mut self.data_pos)?;
            payload.extend_from_slice(&v.to_le_bytes());
        }

        Ok((payload, count))
    }

    /// Read a position delta.
    pub fn read_int64(&mut self) -> i64 {
        if self.sizes.is_empty() {
            return 0;
        }
        let lead = self.sizes[self.size_pos];
        self.size_pos += 1;

        let no_bytes = (lead / 2) as usize;
        let negative = lead & 1 != 0;

        let mut x = 0i64;
        for _ in 0..no_bytes {
            x = (x << 8) + i64::from(self.data[self.data_pos]);
            self.data_pos += 1;
        }

        if negative { -x } else { x }
    }

    /// Read a text cell.
    pub fn read_text(&mut self) -> (Vec<u8>, u32) {
        if self.sizes.is_empty() {
            return (Vec::new(), 0);
        }

        let count = self.sizes[self.size_pos];
        self.size_pos += 1;

        let bytes = count as usize;
        let payload = self.data[self.data_pos..self.data_pos + bytes].to_vec();
        self.data_pos += bytes;

        (payload, count)
    }

    /// Function-mode read: translate the source column's payload for the
    /// current record. An empty mapping is the identity.
    pub fn apply_function(&self, src_payload: &[u8], src_count: u32) -> (Vec<u8>, u32) {
        if src_count == 0 {
            return (Vec::new(), 0);
        }

        if self.function.is_empty() {
            return (src_payload.to_vec(), src_count);
        }

        match self.function.get(src_payload) {
            Some(mapped) => (mapped.clone(), mapped.len() as u32 / 4),
            None => (src_payload.to_vec(), src_count),
        }
    }
}

/// Encode one signed 32-bit value (as its u32 bit pattern).
pub fn encode_cell_varint(out: &mut Vec<u8>, val: u32) {
    let i_val = val as i32;

    if val == 0 {
        out.push(0);
    } else if val == 0x8000_0000 {
        out.push(1);
    } else if i_val > 0 && i_val < 125 {
        out.push((i_val + 1) as u8);
    } else if i_val < 0 && i_val > -125 {
        out.push((i_val + 250) as u8);
    } else if i_val > 0 && i_val < 256 * 256 {
        out.push(250);
        out.push((i_val >> 8) as u8);
        out.push((i_val & 0xff) as u8);
    } else if i_val < 0 && -i_val < 256 * 256 {
        let m = -i_val;
        out.push(251);
        out.push((m >> 8) as u8);
        out.push((m & 0xff) as u8);
    } else if i_val > 0 && i_val < 256 * 256 * 256 {
        out.push(252);
        out.push((i_val >> 16) as u8);
        out.push(((i_val >> 8) & 0xff) as u8);
        out.push((i_val & 0xff) as u8);
    } else if i_val < 0 && -i_val < 256 * 256 * 256 {
        let m = -i_val;
        out.push(253);
        out.push((m >> 16) as u8);
        out.push(((m >> 8) & 0xff) as u8);
        out.push((m & 0xff) as u8);
    } else if i_val > 0 {
        out.push(254);
        out.push((i_val >> 24) as u8);
        out.push(((i_val >> 16) & 0xff) as u8);
        out.push(((i_val >> 8) & 0xff) as u8);
        out.push((i_val & 0xff) as u8);
    } else {
        let m = (-i64::from(i_val)) as u32;
        out.push(255);
        out.push((m >> 24) as u8);
        out.push(((m >> 16) & 0xff) as u8);
        out.push(((m >> 8) & 0xff) as u8);
        out.push((m & 0xff) as u8);
    }
}

/// Decode one value; fails on a truncated payload.
pub fn decode_cell_varint(data: &[u8], pos: &mut usize) -> Result<u32> {
    let take = |pos: &mut usize| -> Result<u32> {
        let b = *data
            .get(*pos)
            .ok_or_else(|| VarzipError::corrupt_input("truncated cell varint"))?;
        *pos += 1;
        Ok(u32::from(b))
    };

    let code = take(pos)?;

    Ok(match code {
        0 => 0,
        1 => 0x8000_0000,
        2..=125 => code - 1,
        126..=249 => (code as i32 - 250) as u32,
        250 => (take(pos)? << 8) + take(pos)?,
        251 => ((take(pos)? << 8) + take(pos)?).wrapping_neg(),
        252 => (take(pos)? << 16) + (take(pos)? << 8) + take(pos)?,
        253 => ((take(pos)? << 16) + (take(pos)? << 8) + take(pos)?).wrapping_neg(),
        254 => (take(pos)? << 24) + (take(pos)? << 16) + (take(pos)? << 8) + take(pos)?,
        _ => ((take(pos)? << 24) + (take(pos)? << 16) + (take(pos)? << 8) + take(pos)?)
            .wrapping_neg(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_roundtrip(v: u32) {
        let mut out = Vec::new();
        encode_cell_varint(&mut out, v);
        let mut pos = 0;
        assert_eq!(decode_cell_varint(&out, &mut pos).unwrap(), v, "value {v:#x}");
        assert_eq!(pos, out.len());
    }

    #[test]
    fn test_cell_varint_table() {
        // The documented single-byte codes.
        let mut out = Vec::new();
        encode_cell_varint(&mut out, 0);
        assert_eq!(out, vec![0]);

        out.clear();
        encode_cell_varint(&mut out, 0x8000_0000);
        assert_eq!(out, vec![1]);

        out.clear();
        encode_cell_varint(&mut out, 125i32 as u32);
        assert_eq!(out, vec![250, 0, 125]); // 125 needs the 2-byte form

        out.clear();
        encode_cell_varint(&mut out, 124);
        assert_eq!(out, vec![125]);

        out.clear();
        encode_cell_varint(&mut out, (-124i32) as u32);
        assert_eq!(out, vec![126]);
    }

    #[test]
    fn test_cell_varint_full_range() {
        for v in [
            0u32,
            1,
            124,
            125,
            255,
            65_535,
            65_536,
            (1 << 24) - 1,
            1 << 24,
            i32::MAX as u32,
            0x8000_0000,
            (-1i32) as u32,
            (-124i32) as u32,
            (-125i32) as u32,
            (-65_535i32) as u32,
            (-65_536i32) as u32,
            (i32::MIN + 1) as u32,
        ] {
            varint_roundtrip(v);
        }
    }

    #[test]
    fn test_truncated_varint_fails() {
        let mut out = Vec::new();
        encode_cell_varint(&mut out, 70_000);
        out.pop();
        let mut pos = 0;
        assert!(decode_cell_varint(&out, &mut pos).is_err());
    }

    #[test]
    fn test_buffer_write_read_cycle() {
        let mut buf = ColumnBuffer::with_max_size(1 << 20);

        buf.write_flag(true);
        buf.write_values(&7u32.to_le_bytes(), 1);
        buf.write_text(b"PASS", 4);
        buf.write_int64(-300);
        buf.write_text(b"", 0);

        let (sizes, data) = buf.take();
        assert_eq!(sizes, vec![1, 1, 4, 2 * 2 + 1, 0]);

        let mut rd = ColumnBuffer::default();
        rd.load(sizes, data);
        assert!(rd.read_flag());
        assert_eq!(rd.read_values(), (7u32.to_le_bytes().to_vec(), 1));
        assert_eq!(rd.read_text(), (b"PASS".to_vec(), 4));
        assert_eq!(rd.read_int64(), -300);
        assert_eq!(rd.read_text(), (Vec::new(), 0));
        assert!(rd.is_empty());
    }

    #[test]
    fn test_varsize_cells() {
        let mut buf = ColumnBuffer::with_max_size(1 << 20);
        let values = [0u32, 1, 300, (-5i32) as u32, 0x8000_0000];
        let mut payload = Vec::new();
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        buf.write_values_var(&payload, values.len() as u32);

        let (sizes, data) = buf.take();
        assert!(data.len() < payload.len());

        let mut rd = ColumnBuffer::default();
        rd.load(sizes, data);
        let (decoded, count) = rd.read_values_var().unwrap();
        assert_eq!(count, values.len() as u32);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_is_full_threshold() {
        let mut buf = ColumnBuffer::with_max_size(16);
        assert!(!buf.is_full());
        buf.write_text(b"abcd", 4); // 4 data + 4 for the size entry
        assert!(!buf.is_full());
        buf.write_text(b"abcd", 4); // 8 data + 8 for size entries
        assert!(buf.is_full());
    }

    #[test]
    fn test_function_mode() {
        let mut map = FunctionMap::new();
        map.insert(5u32.to_le_bytes().to_vec(), 50u32.to_le_bytes().to_vec());

        let mut buf = ColumnBuffer::default();
        buf.load_function(map);
        assert!(!buf.is_empty());

        let (mapped, count) = buf.apply_function(&5u32.to_le_bytes(), 1);
        assert_eq!((mapped, count), (50u32.to_le_bytes().to_vec(), 1));

        // Identity mapping for empty function tables.
        let mut id_buf = ColumnBuffer::default();
        id_buf.load_function(FunctionMap::new());
        let (mapped, count) = id_buf.apply_function(&9u32.to_le_bytes(), 1);
        assert_eq!((mapped, count), (9u32.to_le_bytes().to_vec(), 1));
    }
}
