//! # varzip Block Coder
//!
//! The generic bytes → bytes block compressor used for column size vectors
//! and for column data that has no specialized codec. The pipeline is:
//!
//! 1. optional LZP pre-pass (long repeated stretches collapse into
//!    back-references before block sorting)
//! 2. Burrows-Wheeler Transform per block
//! 3. Move-to-Front transform
//! 4. zero-run RLE (bijective base-2 run digits)
//! 5. adaptive order-1 range-coded entropy stage
//!
//! Callers treat the coder as a black box with four numeric parameters; the
//! incompressible fallback stores the input verbatim, so `compress` never
//! loses data and `decompress` recovers it bit-identically.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bwt;
mod entropy;
pub mod lzp;
pub mod mtf;

use varzip_core::error::{Result, VarzipError};
use varzip_core::varint;

/// Entropy-stage flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoderKind {
    /// Single adaptive model, no byte context.
    Qlfc,
    /// One adaptive model per preceding byte.
    #[default]
    QlfcAdaptive,
}

/// Tunable parameters of the block coder.
#[derive(Debug, Clone, Copy)]
pub struct BlockParams {
    /// Maximum block size for the BWT stage, in MiB.
    pub block_size: u32,
    /// log2 of the LZP hash-table size.
    pub lzp_hash_bits: u32,
    /// Minimum LZP match length; 0 disables the pre-pass.
    pub lzp_min_len: u32,
    /// Entropy-stage flavour.
    pub coder: CoderKind,
}

impl BlockParams {
    /// Parameters used for column size vectors.
    pub fn sizes() -> Self {
        Self {
            block_size: 25,
            lzp_hash_bits: 16,
            lzp_min_len: 128,
            coder: CoderKind::QlfcAdaptive,
        }
    }

    /// Parameters used for generic column data.
    pub fn data() -> Self {
        Self {
            block_size: 25,
            lzp_hash_bits: 16,
            lzp_min_len: 64,
            coder: CoderKind::QlfcAdaptive,
        }
    }
}

impl Default for BlockParams {
    fn default() -> Self {
        Self::data()
    }
}

// Container flags, first byte of every compressed buffer.
const FLAG_STORED: u8 = 1;
const FLAG_LZP: u8 = 2;

// Inputs shorter than this skip the whole pipeline.
const MIN_PIPELINE_LEN: usize = 64;

/// Stateless block compressor configured by [`BlockParams`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockCoder {
    params: BlockParams,
}

impl BlockCoder {
    /// Create a coder with the given parameters.
    pub fn new(params: BlockParams) -> Self {
        Self { params }
    }

    /// Compress `input` into a self-contained buffer.
    pub fn compress(&self, input: &[u8]) -> Vec<u8> {
        if input.len() < MIN_PIPELINE_LEN {
            return store(input);
        }

        let (pre, lzp_applied) = if self.params.lzp_min_len > 0 {
            match lzp::compress(input, self.params.lzp_hash_bits, self.params.lzp_min_len) {
                Some(reduced) => (reduced, true),
                None => (input.to_vec(), false),
            }
        } else {
            (input.to_vec(), false)
        };

        let mut out = vec![if lzp_applied { FLAG_LZP } else { 0 }];
        varint::put_uint(&mut out, pre.len() as u64);

        let block_len = (self.params.block_size as usize).max(1) << 20;
        let blocks: Vec<&[u8]> = pre.chunks(block_len).collect();
        varint::put_uint(&mut out, blocks.len() as u64);

        let mut mtf_blocks = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let (transformed, orig_ptr) = bwt::transform(block);
            varint::put_uint(&mut out, block.len() as u64);
            varint::put_uint(&mut out, u64::from(orig_ptr));
            mtf_blocks.push(mtf::transform(&transformed));
        }

        let coded = entropy::encode(&mtf_blocks, self.params.coder);
        out.extend_from_slice(&coded);

        if out.len() >= input.len() + 1 {
            return store(input);
        }

        out
    }

    /// Decompress a buffer produced by [`BlockCoder::compress`].
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let flags = *input
            .first()
            .ok_or_else(|| VarzipError::corrupt_input("empty block-coded buffer"))?;

        if flags & FLAG_STORED != 0 {
            return Ok(input[1..].to_vec());
        }

        let mut pos = 1usize;
        let pre_len = varint::get_uint(input, &mut pos)? as usize;
        let no_blocks = varint::get_uint(input, &mut pos)? as usize;

        if no_blocks > pre_len + 1 {
            return Err(VarzipError::corrupt_input("implausible block count"));
        }

        let mut block_descs = Vec::with_capacity(no_blocks);
        let mut total = 0usize;
        for _ in 0..no_blocks {
            let block_len = varint::get_uint(input, &mut pos)? as usize;
            let orig_ptr = varint::get_uint(input, &mut pos)? as u32;
            total += block_len;
            block_descs.push((block_len, orig_ptr));
        }

        if total != pre_len {
            return Err(VarzipError::corrupt_input(
                "block lengths do not sum to the declared size",
            ));
        }

        let lengths: Vec<usize> = block_descs.iter().map(|d| d.0).collect();
        let mtf_blocks = entropy::decode(&input[pos..], &lengths, self.params.coder)?;

        let mut pre = Vec::with_capacity(pre_len);
        for (mtf_data, &(block_len, orig_ptr)) in mtf_blocks.iter().zip(&block_descs) {
            let transformed = mtf::inverse_transform(mtf_data);
            if transformed.len() != block_len {
                return Err(VarzipError::corrupt_input("block length mismatch"));
            }
            pre.extend_from_slice(&bwt::inverse_transform(&transformed, orig_ptr)?);
        }

        if flags & FLAG_LZP != 0 {
            return lzp::decompress(&pre, self.params.lzp_hash_bits, self.params.lzp_min_len);
        }

        Ok(pre)
    }
}

fn store(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 1);
    out.push(FLAG_STORED);
    out.extend_from_slice(input);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) {
        let coder = BlockCoder::new(BlockParams::data());
        let compressed = coder.compress(data);
        let recovered = coder.decompress(&compressed).unwrap();
        assert_eq!(recovered, data);
    }

    #[test]
    fn test_roundtrip_empty() {
        roundtrip(b"");
    }

    #[test]
    fn test_roundtrip_short_is_stored() {
        let coder = BlockCoder::new(BlockParams::data());
        let compressed = coder.compress(b"abc");
        assert_eq!(compressed[0], FLAG_STORED);
        assert_eq!(coder.decompress(&compressed).unwrap(), b"abc");
    }

    #[test]
    fn test_roundtrip_runs() {
        let mut data = vec![0u8; 5_000];
        data.extend(vec![7u8; 5_000]);
        data.extend((0..5_000).map(|i| (i % 251) as u8));
        roundtrip(&data);
    }

    #[test]
    fn test_roundtrip_text() {
        let data: Vec<u8> = b"chr1\t100\trs571\tA\tT\t30\tPASS\t"
            .iter()
            .cycle()
            .take(40_000)
            .copied()
            .collect();
        let coder = BlockCoder::new(BlockParams::data());
        let compressed = coder.compress(&data);
        assert!(compressed.len() < data.len() / 4);
        assert_eq!(coder.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_random_bytes() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        let mut rng = StdRng::seed_from_u64(7);
        let data: Vec<u8> = (0..30_000).map(|_| rng.r#gen()).collect();
        roundtrip(&data);
    }

    #[test]
    fn test_roundtrip_without_lzp() {
        let params = BlockParams {
            lzp_min_len: 0,
            ..BlockParams::data()
        };
        let data: Vec<u8> = (0..10_000).map(|i| (i / 64) as u8).collect();
        let coder = BlockCoder::new(params);
        let compressed = coder.compress(&data);
        assert_eq!(coder.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_multi_block_input() {
        let params = BlockParams {
            block_size: 1,
            ..BlockParams::data()
        };
        // Two BWT blocks at 1 MiB block size.
        let data: Vec<u8> = (0..(1 << 20) + 4096).map(|i| (i % 13) as u8).collect();
        let coder = BlockCoder::new(params);
        let compressed = coder.compress(&data);
        assert_eq!(coder.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_truncated_fails() {
        let coder = BlockCoder::new(BlockParams::data());
        let data: Vec<u8> = (0..10_000).map(|i| (i % 7) as u8).collect();
        let mut compressed = coder.compress(&data);
        compressed.truncate(compressed.len() / 2);
        assert!(coder.decompress(&compressed).is_err());
    }
}
