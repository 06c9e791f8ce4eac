//! LZP pre-pass: collapse long repeats before block sorting.
//!
//! A hash table maps the previous four bytes of context to the last position
//! where that context was seen. When the bytes ahead match the candidate for
//! at least `min_len` bytes the stretch is replaced by an escape byte and a
//! match length; literals equal to the escape byte are escaped with a zero
//! length. Encoder and decoder update the table at exactly the same output
//! positions, so no table contents travel in the stream.

use varzip_core::error::{Result, VarzipError};
use varzip_core::varint;

const ESCAPE: u8 = 0xff;
const CTX_LEN: usize = 4;

#[inline]
fn hash_ctx(bytes: &[u8], hash_bits: u32) -> usize {
    let ctx = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (ctx.wrapping_mul(2654435761) >> (32 - hash_bits)) as usize
}

/// Compress `input`. Returns `None` when the pre-pass does not shrink it.
pub fn compress(input: &[u8], hash_bits: u32, min_len: u32) -> Option<Vec<u8>> {
    if input.len() <= CTX_LEN + min_len as usize {
        return None;
    }

    let mut table = vec![u32::MAX; 1 << hash_bits];
    let mut out = Vec::with_capacity(input.len() / 2);
    out.extend_from_slice(&input[..CTX_LEN]);

    let mut i = CTX_LEN;
    while i < input.len() {
        let h = hash_ctx(&input[i - CTX_LEN..i], hash_bits);
        let cand = table[h];
        table[h] = i as u32;

        if cand != u32::MAX {
            let cand = cand as usize;
            let mut len = 0usize;
            while i + len < input.len() && input[cand + len] == input[i + len] {
                len += 1;
            }

            if len >= min_len as usize {
                out.push(ESCAPE);
                varint::put_uint(&mut out, (len - min_len as usize + 1) as u64);
                i += len;
                continue;
            }
        }

        if input[i] == ESCAPE {
            out.push(ESCAPE);
            varint::put_uint(&mut out, 0);
        } else {
            out.push(input[i]);
        }
        i += 1;
    }

    (out.len() < input.len()).then_some(out)
}

/// Decompress a pre-pass buffer back into the original bytes.
pub fn decompress(input: &[u8], hash_bits: u32, min_len: u32) -> Result<Vec<u8>> {
    if input.len() < CTX_LEN {
        return Err(VarzipError::corrupt_input("short pre-pass buffer"));
    }

    let mut table = vec![u32::MAX; 1 << hash_bits];
    let mut out = Vec::with_capacity(input.len() * 2);
    out.extend_from_slice(&input[..CTX_LEN]);

    let mut pos = CTX_LEN;
    while pos < input.len() {
        let i = out.len();
        let h = hash_ctx(&out[i - CTX_LEN..i], hash_bits);
        let cand = table[h];
        table[h] = i as u32;

        let c = input[pos];
        pos += 1;

        if c != ESCAPE {
            out.push(c);
            continue;
        }

        let v = varint::get_uint(input, &mut pos)
            .map_err(|_| VarzipError::corrupt_input("truncated match length"))?;

        if v == 0 {
            out.push(ESCAPE);
            continue;
        }

        if cand == u32::MAX {
            return Err(VarzipError::corrupt_input("match with no candidate"));
        }

        let len = v as usize + min_len as usize - 1;
        let cand = cand as usize;
        for k in 0..len {
            let byte = out[cand + k];
            out.push(byte);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8], min_len: u32) {
        if let Some(compressed) = compress(data, 16, min_len) {
            let recovered = decompress(&compressed, 16, min_len).unwrap();
            assert_eq!(recovered, data);
        }
    }

    #[test]
    fn test_repetitive_shrinks() {
        let data: Vec<u8> = b"0123456789abcdef"
            .iter()
            .cycle()
            .take(8_192)
            .copied()
            .collect();
        let compressed = compress(&data, 16, 32).expect("repetitive input must shrink");
        assert!(compressed.len() < data.len() / 4);
        assert_eq!(decompress(&compressed, 16, 32).unwrap(), data);
    }

    #[test]
    fn test_escape_bytes_survive() {
        let mut data = vec![ESCAPE; 600];
        data.extend_from_slice(b"tail");
        roundtrip(&data, 32);
    }

    #[test]
    fn test_incompressible_is_none() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 17 % 256) as u8).collect();
        assert!(compress(&data, 16, 64).is_none());
    }

    #[test]
    fn test_mixed_content() {
        let mut data = Vec::new();
        for i in 0..50 {
            data.extend_from_slice(b"chr1\t92851\t.\tA\tT\t30\tPASS\tDP=23;AF=0.5\n");
            data.push((i % 256) as u8);
        }
        roundtrip(&data, 16);
        roundtrip(&data, 64);
    }
}
