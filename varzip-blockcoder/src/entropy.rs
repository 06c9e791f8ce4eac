//! Entropy stage: zero-run RLE over MTF output, range-coded with adaptive
//! byte models.
//!
//! MTF output is dominated by zero runs. Runs are re-expressed as bijective
//! base-2 digits over two run symbols (RUNA/RUNB), every other byte value is
//! shifted up by one, and the resulting 257-symbol stream is coded with an
//! adaptive model, optionally conditioned on the previous symbol.

use crate::CoderKind;
use varzip_core::error::{Result, VarzipError};
use varzip_rangecoder::{CoderModel, ContextMap, DenseModel, RangeDecoder, RangeEncoder};

const RUN_A: usize = 0;
const RUN_B: usize = 1;
const SYM_SHIFT: usize = 2;
// 2 run symbols + 255 shifted byte values; one past the sparse models'
// 8-bit symbol field, so the stage runs on the dense family.
const ALPHABET: usize = 257;

type ByteModel = CoderModel<DenseModel<ALPHABET, 16, 32>>;

// Run symbols for `n` zeros, bijective base 2 (RUNA = 1, RUNB = 2).
fn push_run(symbols: &mut Vec<usize>, mut n: usize) {
    while n > 0 {
        if n & 1 == 1 {
            symbols.push(RUN_A);
            n = (n - 1) >> 1;
        } else {
            symbols.push(RUN_B);
            n = (n - 2) >> 1;
        }
    }
}

fn to_symbols(blocks: &[Vec<u8>]) -> Vec<Vec<usize>> {
    blocks
        .iter()
        .map(|block| {
            let mut symbols = Vec::with_capacity(block.len() / 2 + 16);
            let mut zero_run = 0usize;

            for &b in block {
                if b == 0 {
                    zero_run += 1;
                } else {
                    push_run(&mut symbols, zero_run);
                    zero_run = 0;
                    symbols.push(b as usize + SYM_SHIFT - 1);
                }
            }
            push_run(&mut symbols, zero_run);

            symbols
        })
        .collect()
}

fn context_of(prev: usize, coder: CoderKind) -> u64 {
    match coder {
        CoderKind::Qlfc => 0,
        CoderKind::QlfcAdaptive => prev as u64,
    }
}

/// Encode the MTF blocks into one range-coded stream.
pub fn encode(blocks: &[Vec<u8>], coder: CoderKind) -> Vec<u8> {
    let mut models: ContextMap<ByteModel> = ContextMap::new();
    let mut rc = RangeEncoder::new();

    let mut prev = 0usize;
    for symbols in to_symbols(blocks) {
        for sym in symbols {
            models
                .get_or_insert(context_of(prev, coder))
                .encode(&mut rc, sym);
            prev = sym;
        }
    }

    rc.finish()
}

/// Decode the range-coded stream back into MTF blocks of the given lengths.
pub fn decode(data: &[u8], block_lengths: &[usize], coder: CoderKind) -> Result<Vec<Vec<u8>>> {
    let mut models: ContextMap<ByteModel> = ContextMap::new();
    let mut rc = RangeDecoder::new(data)?;

    let mut blocks = Vec::with_capacity(block_lengths.len());
    let mut prev = 0usize;

    for &block_len in block_lengths {
        let mut block = Vec::with_capacity(block_len);
        let mut run_shift = 0u32;
        let mut run = 0usize;

        while block.len() + run < block_len || run_shift != 0 {
            let sym = models
                .get_or_insert(context_of(prev, coder))
                .decode(&mut rc)?;
            prev = sym;

            match sym {
                RUN_A | RUN_B => {
                    run += (sym + 1) << run_shift;
                    run_shift += 1;

                    if block.len() + run > block_len {
                        return Err(VarzipError::corrupt_input("zero run crosses block end"));
                    }
                    // A maximal run is followed by a non-run symbol or the
                    // block end, so flush when the block is exactly filled.
                    if block.len() + run == block_len {
                        block.resize(block_len, 0);
                        run = 0;
                        run_shift = 0;
                    }
                }
                _ => {
                    let new_len = block.len() + run;
                    block.resize(new_len, 0);
                    run = 0;
                    run_shift = 0;
                    block.push((sym - SYM_SHIFT + 1) as u8);
                }
            }
        }

        if block.len() != block_len {
            return Err(VarzipError::corrupt_input("short entropy-coded block"));
        }

        blocks.push(block);
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(blocks: Vec<Vec<u8>>, coder: CoderKind) {
        let coded = encode(&blocks, coder);
        let lengths: Vec<usize> = blocks.iter().map(Vec::len).collect();
        let decoded = decode(&coded, &lengths, coder).unwrap();
        assert_eq!(decoded, blocks);
    }

    #[test]
    fn test_zero_runs() {
        roundtrip(vec![vec![0; 1000]], CoderKind::QlfcAdaptive);
        roundtrip(vec![vec![0; 12345]], CoderKind::Qlfc);
    }

    #[test]
    fn test_mixed_blocks() {
        let a: Vec<u8> = (0..4096).map(|i| if i % 7 == 0 { (i % 5) as u8 } else { 0 }).collect();
        let b: Vec<u8> = (0..100).map(|i| (i % 255) as u8 + 1).collect();
        roundtrip(vec![a, b], CoderKind::QlfcAdaptive);
    }

    #[test]
    fn test_run_at_block_boundary() {
        // Block ends mid-run-digit sequence; the decoder must flush exactly.
        roundtrip(vec![vec![0, 0, 0, 0, 0, 0, 0], vec![1, 0, 0]], CoderKind::QlfcAdaptive);
    }
}
