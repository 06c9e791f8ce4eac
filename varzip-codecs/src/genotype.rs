//! Genotype column codec.
//!
//! Encoding a part runs, per variant row:
//!
//! 1. bias transform: for ploidy > 1, a set phase bit on the second
//!    haplotype increments the first haplotype value, folding the phase into
//!    the value space
//! 2. missing (`0x8000_0001`) becomes 0 and every other value shifts by +1
//! 3. the sample-major grid is reordered haplotype-major
//! 4. the PBWT permutation turns the row into long runs, emitted as
//!    (symbol, length) pairs with the last length replaced by a 0 sentinel
//!
//! The pair stream is range coded: symbols as 4-bit chunks under a rolling
//! 16-bit symbol context, lengths as an ilog2 prefix under a 20-bit rolling
//! context with power-of-two suffix models per (symbol, prefix), and runs of
//! 512 or more through byte-wise large-value models. Both rolling contexts
//! reset to all-ones at every row sentinel so rows self-synchronize.

use crate::pbwt::Pbwt;
use varzip_core::error::{Result, VarzipError};
use varzip_core::utils::ilog2;
use varzip_rangecoder::{
    AdjustableModel, AdjustableModelEmb, CoderModel, ContextMap, DenseModel, RangeDecoder,
    RangeEncoder,
};

/// Missing-call sentinel in the caller's value space.
const MISSING: u32 = 0x8000_0001;

const CTX_SYMBOL_FLAG: u64 = 1 << 60;
const CTX_SYMBOL_MASK: u64 = 0xffff;

const CTX_PREFIX_MASK: u64 = 0xfffff;
const CTX_PREFIX_FLAG: u64 = 2 << 60;
const CTX_SUFFIX_FLAG: u64 = 3 << 60;
const CTX_LARGE_FLAG: [u64; 4] = [4 << 60, 5 << 60, 6 << 60, 7 << 60];

type PrefixModel = CoderModel<DenseModel<11, 10, 1>>;
type SymbolModel = CoderModel<DenseModel<16, 15, 1>>;
type LargeModel = CoderModel<AdjustableModel<256, 15, 1>>;

type Suf2 = CoderModel<DenseModel<2, 11, 1>>;
type Suf4 = CoderModel<DenseModel<4, 11, 1>>;
type Suf8 = CoderModel<DenseModel<8, 11, 1>>;
type Suf16 = CoderModel<DenseModel<16, 11, 1>>;
type Suf32 = CoderModel<DenseModel<32, 11, 1>>;
type Suf64 = CoderModel<AdjustableModelEmb<64, 11, 1>>;
type Suf128 = CoderModel<AdjustableModelEmb<128, 11, 1>>;
type Suf256 = CoderModel<AdjustableModelEmb<256, 11, 1>>;

/// Codec state for the genotype column of one archive direction.
#[derive(Debug)]
pub struct GenotypeCodec {
    no_samples: u32,

    pbwt: Pbwt,

    ctx_symbol: u64,
    ctx_prefix: u64,

    prefix_models: ContextMap<PrefixModel>,
    symbol_models: ContextMap<SymbolModel>,
    large_models: ContextMap<LargeModel>,

    suf2: ContextMap<Suf2>,
    suf4: ContextMap<Suf4>,
    suf8: ContextMap<Suf8>,
    suf16: ContextMap<Suf16>,
    suf32: ContextMap<Suf32>,
    suf64: ContextMap<Suf64>,
    suf128: ContextMap<Suf128>,
    suf256: ContextMap<Suf256>,
}

impl GenotypeCodec {
    /// Create a codec for `no_samples` samples at the given ploidy.
    pub fn new(no_samples: u32, ploidy: u32, neglect_limit: u32) -> Self {
        let row_width = (no_samples.max(1) * ploidy.max(1)) as usize;

        Self {
            no_samples: no_samples.max(1),
            pbwt: Pbwt::start(row_width, neglect_limit),
            ctx_symbol: CTX_SYMBOL_MASK,
            ctx_prefix: CTX_PREFIX_MASK,
            prefix_models: ContextMap::new(),
            symbol_models: ContextMap::new(),
            large_models: ContextMap::new(),
            suf2: ContextMap::new(),
            suf4: ContextMap::new(),
            suf8: ContextMap::new(),
            suf16: ContextMap::new(),
            suf32: ContextMap::new(),
            suf64: ContextMap::new(),
            suf128: ContextMap::new(),
            suf256: ContextMap::new(),
        }
    }

    fn reset_row_contexts(&mut self) {
        self.ctx_symbol = CTX_SYMBOL_MASK;
        self.ctx_prefix = CTX_PREFIX_MASK;
    }

    /// Encode one part. `sizes` holds value slots per row (samples ×
    /// haplotypes) and is rewritten in place to haplotype counts; `data` is
    /// the little-endian u32 grid. Returns the coded stream and the raw-size
    /// metadata word (the number of run-length words).
    pub fn encode(&mut self, sizes: &mut [u32], data: &[u8]) -> (Vec<u8>, u64) {
        let mut res: Vec<(u32, u32)> = Vec::new();
        let mut row_reordered: Vec<u32> = Vec::new();
        let mut rle: Vec<(u32, u32)> = Vec::new();

        let mut off = 0usize;
        for &count in sizes.iter() {
            if count == 0 {
                continue; // record without genotype data
            }
            let count = count as usize;
            let mut row: Vec<u32> = data[off..off + 4 * count]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            off += 4 * count;

            let no_haplotypes = count / self.no_samples as usize;
            let ns = self.no_samples as usize;

            // Fold the phase bit of the second haplotype into the first.
            if no_haplotypes > 1 {
                for k in 0..ns {
                    if row[k * no_haplotypes + 1] & 1 != 0 {
                        row[k * no_haplotypes] += 1;
                    }
                }
            }

            row_reordered.clear();
            row_reordered.resize(count, 0);
            let mut max_gt_val = 0u32;

            for j in 0..no_haplotypes {
                for k in 0..ns {
                    let raw = row[k * no_haplotypes + j];
                    let gt_val = if raw == MISSING { 0 } else { raw + 1 };

                    row_reordered[j * ns + k] = gt_val;
                    if gt_val > max_gt_val {
                        max_gt_val = gt_val;
                    }
                }
            }

            self.pbwt.encode_row(max_gt_val, &row_reordered, &mut rle);

            if let Some(last) = rle.last_mut() {
                last.1 = 0; // end-of-row sentinel
            }
            res.extend_from_slice(&rle);
        }

        for s in sizes.iter_mut() {
            *s /= self.no_samples;
        }

        if res.is_empty() {
            return (Vec::new(), 0);
        }

        let mut rc = RangeEncoder::new();
        self.reset_row_contexts();

        for &(symbol, len) in &res {
            self.encode_run_len(&mut rc, symbol, len);
            if len == 0 {
                self.reset_row_contexts();
            }
        }

        (rc.finish(), 2 * res.len() as u64)
    }

    /// Decode one part. `sizes` holds haplotype counts per row (the stored
    /// size stream); `raw_size` is the metadata word written by
    /// [`GenotypeCodec::encode`]. Returns the little-endian u32 grid.
    pub fn decode(&mut self, sizes: &[u32], coded: &[u8], raw_size: u64) -> Result<Vec<u8>> {
        if raw_size == 0 {
            return Ok(Vec::new());
        }

        let ns = self.no_samples;
        let mut full_rle: Vec<(u32, u32)> = Vec::with_capacity(raw_size as usize / 2);

        let mut rc = RangeDecoder::new(coded)?;
        self.reset_row_contexts();

        let mut i_variant = 0usize;
        let mut cur_variant_size = 0u32;

        for _ in 0..raw_size / 2 {
            let (symbol, mut len) = self.decode_run_len(&mut rc)?;

            if len == 0 {
                self.reset_row_contexts();
                while sizes.get(i_variant) == Some(&0) {
                    i_variant += 1;
                }
                let row_width = *sizes.get(i_variant).ok_or_else(|| {
                    VarzipError::corrupt_input("more genotype rows than size entries")
                })? * ns;
                i_variant += 1;

                len = row_width.checked_sub(cur_variant_size).ok_or_else(|| {
                    VarzipError::corrupt_input("genotype row longer than its declared size")
                })?;
                cur_variant_size = 0;
            } else {
                cur_variant_size += len;
            }

            full_rle.push((symbol, len));
        }

        while sizes.get(i_variant) == Some(&0) {
            i_variant += 1;
        }
        if i_variant != sizes.len() || cur_variant_size != 0 {
            return Err(VarzipError::corrupt_input(
                "genotype row sizes do not match the coded stream",
            ));
        }

        // PBWT decoding back to sample-major value space.
        let total_slots: usize = sizes.iter().map(|&s| (s * ns) as usize).sum();
        let mut out = Vec::with_capacity(total_slots * 4);

        let mut row_rle: Vec<(u32, u32)> = Vec::new();
        let mut decoded: Vec<u32> = Vec::new();
        let mut row: Vec<u32> = Vec::new();

        let mut p = 0usize;
        for &hap_count in sizes {
            if hap_count == 0 {
                continue;
            }
            let row_width = hap_count * ns;
            row_rle.clear();

            let mut c_len = 0u32;
            let mut max_val = 0u32;
            while c_len < row_width {
                let pair = *full_rle.get(p).ok_or_else(|| {
                    VarzipError::corrupt_input("genotype stream ended inside a row")
                })?;
                p += 1;

                row_rle.push(pair);
                c_len += pair.1;
                if pair.0 > max_val {
                    max_val = pair.0;
                }
            }
            if c_len != row_width {
                return Err(VarzipError::corrupt_input("genotype run crosses a row boundary"));
            }

            self.pbwt.decode_row(max_val, &row_rle, &mut decoded);

            let no_haplotypes = hap_count as usize;
            let nsz = ns as usize;
            row.clear();
            row.resize(decoded.len(), 0);

            for j in 0..no_haplotypes {
                for k in 0..nsz {
                    let gt_val = decoded[j * nsz + k];
                    row[k * no_haplotypes + j] = if gt_val == 0 { MISSING } else { gt_val - 1 };
                }
            }

            // Recover the phase bit of the first haplotype.
            if no_haplotypes > 1 {
                for k in 0..nsz {
                    if row[k * no_haplotypes] & 1 != 0 {
                        row[k * no_haplotypes] -= 1;
                    }
                }
            }

            for &v in &row {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }

        Ok(out)
    }

    fn encode_run_len(&mut self, rc: &mut RangeEncoder, symbol: u32, len: u32) {
        // Symbol, in chunks of 15.
        let sym_model = self
            .symbol_models
            .get_or_insert(self.ctx_symbol + CTX_SYMBOL_FLAG);

        if symbol < 15 {
            sym_model.encode(rc, symbol as usize);
        } else {
            let mut x = symbol;
            loop {
                if x < 15 {
                    sym_model.encode(rc, x as usize);
                    break;
                }
                sym_model.encode(rc, 15);
                x -= 15;
            }
        }

        let symbol_clipped = symbol.min(15) as u64;

        self.ctx_symbol = ((self.ctx_symbol << 4) + symbol_clipped) & CTX_SYMBOL_MASK;
        self.symbol_models.prefetch(self.ctx_symbol + CTX_SYMBOL_FLAG);

        self.ctx_prefix = ((self.ctx_prefix << 4) + symbol_clipped) & CTX_PREFIX_MASK;

        // Run length: ilog2 prefix, then suffix or large-value bytes.
        let prefix = ilog2(len);
        let prefix_model = self
            .prefix_models
            .get_or_insert(self.ctx_prefix + CTX_PREFIX_FLAG);

        if prefix < 2 {
            prefix_model.encode(rc, prefix as usize);
        } else if prefix < 10 {
            prefix_model.encode(rc, prefix as usize);

            let ctx_suf = CTX_SUFFIX_FLAG + (symbol_clipped << 8) + u64::from(prefix);
            let base = 1u32 << (prefix - 1);
            let rest = (len - base) as usize;

            match base {
                2 => self.suf2.get_or_insert(ctx_suf).encode(rc, rest),
                4 => self.suf4.get_or_insert(ctx_suf).encode(rc, rest),
                8 => self.suf8.get_or_insert(ctx_suf).encode(rc, rest),
                16 => self.suf16.get_or_insert(ctx_suf).encode(rc, rest),
                32 => self.suf32.get_or_insert(ctx_suf).encode(rc, rest),
                64 => self.suf64.get_or_insert(ctx_suf).encode(rc, rest),
                128 => self.suf128.get_or_insert(ctx_suf).encode(rc, rest),
                _ => self.suf256.get_or_insert(ctx_suf).encode(rc, rest),
            }
        } else {
            prefix_model.encode(rc, 10); // large-value flag

            let mut ctx = CTX_LARGE_FLAG[0] + (symbol_clipped << 16);
            let mut folded = 0u64;
            for (plane, shift) in [(0usize, 24u32), (1, 16), (2, 8), (3, 0)] {
                let byte = (len >> shift) & 0xff;
                self.large_models
                    .get_or_insert(ctx + folded)
                    .encode(rc, byte as usize);

                ctx = CTX_LARGE_FLAG[(plane + 1).min(3)] + (symbol_clipped << 16);
                folded = (folded << 8) + u64::from(byte);
            }
        }

        self.ctx_prefix = ((self.ctx_prefix << 4) + u64::from(prefix)) & CTX_PREFIX_MASK;
        self.prefix_models.prefetch(self.ctx_prefix + CTX_PREFIX_FLAG);
    }

    fn decode_run_len(&mut self, rc: &mut RangeDecoder<'_>) -> Result<(u32, u32)> {
        let sym_model = self
            .symbol_models
            .get_or_insert(self.ctx_symbol + CTX_SYMBOL_FLAG);

        let mut symbol = sym_model.decode(rc)? as u32;
        if symbol == 15 {
            loop {
                let x = sym_model.decode(rc)? as u32;
                symbol += x;
                if x < 15 {
                    break;
                }
            }
        }

        let symbol_clipped = symbol.min(15) as u64;

        self.ctx_symbol = ((self.ctx_symbol << 4) + symbol_clipped) & CTX_SYMBOL_MASK;
        self.symbol_models.prefetch(self.ctx_symbol + CTX_SYMBOL_FLAG);

        self.ctx_prefix = ((self.ctx_prefix << 4) + symbol_clipped) & CTX_PREFIX_MASK;

        let prefix_model = self
            .prefix_models
            .get_or_insert(self.ctx_prefix + CTX_PREFIX_FLAG);
        let mut prefix = prefix_model.decode(rc)? as u32;

        let len;
        if prefix < 2 {
            len = prefix;
        } else if prefix < 10 {
            let ctx_suf = CTX_SUFFIX_FLAG + (symbol_clipped << 8) + u64::from(prefix);
            let base = 1u32 << (prefix - 1);

            let rest = match base {
                2 => self.suf2.get_or_insert(ctx_suf).decode(rc)?,
                4 => self.suf4.get_or_insert(ctx_suf).decode(rc)?,
                8 => self.suf8.get_or_insert(ctx_suf).decode(rc)?,
                16 => self.suf16.get_or_insert(ctx_suf).decode(rc)?,
                32 => self.suf32.get_or_insert(ctx_suf).decode(rc)?,
                64 => self.suf64.get_or_insert(ctx_suf).decode(rc)?,
                128 => self.suf128.get_or_insert(ctx_suf).decode(rc)?,
                _ => self.suf256.get_or_insert(ctx_suf).decode(rc)?,
            };
            len = base + rest as u32;
        } else {
            let mut ctx = CTX_LARGE_FLAG[0] + (symbol_clipped << 16);
            let mut folded = 0u64;
            let mut value = 0u32;

            for plane in 0..4usize {
                let byte = self.large_models.get_or_insert(ctx + folded).decode(rc)? as u32;
                value = (value << 8) + byte;

                ctx = CTX_LARGE_FLAG[(plane + 1).min(3)] + (symbol_clipped << 16);
                folded = (folded << 8) + u64::from(byte);
            }

            len = value;
            prefix = ilog2(len);
        }

        self.ctx_prefix = ((self.ctx_prefix << 4) + u64::from(prefix)) & CTX_PREFIX_MASK;
        self.prefix_models.prefetch(self.ctx_prefix + CTX_PREFIX_FLAG);

        Ok((symbol, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_bytes(rows: &[Vec<u32>]) -> (Vec<u32>, Vec<u8>) {
        let sizes: Vec<u32> = rows.iter().map(|r| r.len() as u32).collect();
        let mut data = Vec::new();
        for row in rows {
            for &v in row {
                data.extend_from_slice(&v.to_le_bytes());
            }
        }
        (sizes, data)
    }

    fn roundtrip(rows: &[Vec<u32>], no_samples: u32, ploidy: u32, neglect_limit: u32) {
        let (mut sizes, data) = grid_bytes(rows);

        let mut enc = GenotypeCodec::new(no_samples, ploidy, neglect_limit);
        let (coded, raw_size) = enc.encode(&mut sizes, &data);

        let mut dec = GenotypeCodec::new(no_samples, ploidy, neglect_limit);
        let decoded = dec.decode(&sizes, &coded, raw_size).unwrap();
        assert_eq!(decoded, data);
    }

    // htslib-style call encoding: (allele + 1) << 1 | phased.
    fn call(allele: u32, phased: bool) -> u32 {
        ((allele + 1) << 1) | u32::from(phased)
    }

    #[test]
    fn test_diploid_grid() {
        // row0 = [0|0, 0|1, 1|0, 1|1], row1 all 0|0, row2 mixed.
        let rows = vec![
            vec![
                call(0, true), call(0, true),
                call(0, true), call(1, true),
                call(1, true), call(0, true),
                call(1, true), call(1, true),
            ],
            vec![call(0, true); 8],
            vec![
                call(1, true), call(1, true),
                call(1, true), call(0, true),
                call(0, true), call(1, true),
                call(0, true), call(0, true),
            ],
        ];
        roundtrip(&rows, 4, 2, 10);
    }

    #[test]
    fn test_near_constant_row_preserves_permutation() {
        let dense: Vec<u32> = (0..8).map(|i| call(i % 2, true)).collect();
        let constant = vec![call(0, true); 8];
        // With neglect_limit high, the constant row must not disturb the
        // permutation between the two dense rows.
        roundtrip(&[dense.clone(), constant, dense], 4, 2, 10);
    }

    #[test]
    fn test_single_row_single_sample() {
        roundtrip(&[vec![call(0, false), call(1, false)]], 1, 2, 10);
    }

    #[test]
    fn test_missing_calls() {
        let rows = vec![
            vec![MISSING, MISSING, call(0, true), call(1, true)],
            vec![call(0, true), call(0, true), MISSING, MISSING],
        ];
        roundtrip(&rows, 2, 2, 10);
    }

    #[test]
    fn test_haploid() {
        let rows: Vec<Vec<u32>> = (0..20)
            .map(|r| (0..16).map(|i| call(u32::from((i + r) % 5 == 0), false)).collect())
            .collect();
        roundtrip(&rows, 16, 1, 3);
    }

    #[test]
    fn test_unphased_phase_bit_roundtrip() {
        let rows = vec![vec![
            call(0, false), call(1, true),
            call(1, false), call(0, false),
            call(0, true), call(0, false),
        ]];
        roundtrip(&rows, 3, 2, 10);
    }

    #[test]
    fn test_large_run_lengths() {
        // One deviant call keeps the long run ahead of the end-of-row
        // sentinel, so the large-value byte planes are exercised.
        let width = 300_000u32;
        let mut row = vec![call(0, true); width as usize];
        let last = row.len() - 1;
        row[last] = call(1, true);
        roundtrip(&[row], width / 2, 2, 10);
    }

    #[test]
    fn test_rows_without_genotype_data() {
        let rows = vec![
            vec![call(0, true); 8],
            vec![],
            vec![call(1, true), call(0, true), call(0, true), call(1, true),
                 call(0, true), call(0, true), call(0, true), call(0, true)],
            vec![],
        ];
        roundtrip(&rows, 4, 2, 10);
    }

    #[test]
    fn test_run_len_codes_above_16m() {
        // Direct run-length coding check for lengths beyond 2^24.
        let mut enc = GenotypeCodec::new(1, 1, 0);
        let mut rc = RangeEncoder::new();
        let runs = [(3u32, 20_000_000u32), (1, 5), (3, 1 << 25)];
        for &(s, l) in &runs {
            enc.encode_run_len(&mut rc, s, l);
        }
        let coded = rc.finish();

        let mut dec = GenotypeCodec::new(1, 1, 0);
        let mut rd = RangeDecoder::new(&coded).unwrap();
        for &(s, l) in &runs {
            assert_eq!(dec.decode_run_len(&mut rd).unwrap(), (s, l));
        }
    }

    #[test]
    fn test_wide_alphabet_symbols() {
        // Allele indices above 14 exercise the 15-chunk symbol escape.
        let rows = vec![
            (0..12).map(|i| call(i as u32 * 3, true)).collect::<Vec<u32>>(),
            (0..12).map(|i| call(40 - i as u32, true)).collect(),
        ];
        roundtrip(&rows, 6, 2, 2);
    }

    #[test]
    fn test_corrupt_row_sizes_rejected() {
        let rows = vec![vec![call(0, true); 8]];
        let (mut sizes, data) = grid_bytes(&rows);

        let mut enc = GenotypeCodec::new(4, 2, 10);
        let (coded, raw_size) = enc.encode(&mut sizes, &data);

        // Claim a different row shape than what was encoded.
        let mut dec = GenotypeCodec::new(4, 2, 10);
        assert!(dec.decode(&[1, 1], &coded, raw_size).is_err());
    }
}
