//! Adaptive frequency models for the range coder.
//!
//! Three families, all parameterized at compile time by the alphabet size
//! `A`, the rescale threshold exponent `LOG` (rescale when the total reaches
//! `1 << LOG`), and the per-update increment `ADD`:
//!
//! - [`DenseModel`]: one counter per symbol, starting at 1
//! - [`AdjustableModel`]: a sorted sparse list of `(symbol, counter)` pairs
//!   that rewrites itself into a dense array once a third of the alphabet
//!   has been seen, and never converts back
//! - [`AdjustableModelEmb`]: same contract, with the first two pairs held
//!   inline before any allocation happens
//!
//! Unseen symbols weigh 1 in every family, so the three families assign
//! identical frequencies for the same update history — the sparse forms are
//! purely a memory optimization for the many-contexts maps.
//!
//! Rescaling ceiling-halves every counter so no symbol ever drops to zero.

use crate::coder::{RangeDecoder, RangeEncoder};
use varzip_core::error::Result;

/// Uniform interface over the model families; the range coder is polymorphic
/// over this trait.
pub trait FreqModel: Default {
    /// Frequency triple for `sym`: (symbol freq, cumulative freq, total).
    fn get_freq(&self, sym: usize) -> (u32, u32, u32);
    /// Record one occurrence of `sym`.
    fn update(&mut self, sym: usize);
    /// Symbol whose frequency band contains `cum`.
    fn get_sym(&self, cum: u32) -> usize;
    /// Current frequency total.
    fn total(&self) -> u32;
}

// Packed sparse entry: symbol in the top 8 bits, counter in the low 24.
const VALUE_MASK: u32 = 0x00ff_ffff;
const SYMBOL_SHIFT: u32 = 24;

#[inline]
fn pack_sv(sym: u32, val: u32) -> u32 {
    (sym << SYMBOL_SHIFT) + val
}

fn sparse_get_freq(pairs: &[u32], sym: usize, total: u32) -> (u32, u32, u32) {
    let sym = sym as u32;
    let mut left = 0u32;
    let mut cnt = 0u32;
    let mut sym_freq = 1u32;

    for &x in pairs {
        let s = x >> SYMBOL_SHIFT;
        let v = x & VALUE_MASK;

        if s < sym {
            left += v;
            cnt += 1;
        } else {
            if s == sym {
                sym_freq = v;
            }
            break;
        }
    }

    left += sym - cnt;
    (sym_freq, left, total)
}

fn sparse_get_sym(pairs: &[u32], alphabet: u32, total: u32, cum: u32) -> usize {
    let mut t = 0u32;
    let mut cnt = 0u32;

    for &x in pairs {
        let s = x >> SYMBOL_SHIFT;
        let v = x & VALUE_MASK;

        t += v;

        if t + (s - cnt) > cum {
            if t + (s - cnt) - v <= cum {
                return s as usize;
            }
            return (s - (t + (s - cnt) - v - cum)) as usize;
        }

        cnt += 1;
    }

    (alphabet - (total - cum)) as usize
}

// Halve every stored counter (ceiling) and re-derive the total, counting
// every unseen symbol as 1.
fn sparse_rescale(pairs: &mut [u32], alphabet: u32) -> u32 {
    let mut total = 0u32;
    for x in pairs.iter_mut() {
        let v = ((*x & VALUE_MASK) + 1) / 2;
        *x = (*x & !VALUE_MASK) + v;
        total += v;
    }
    total + (alphabet - pairs.len() as u32)
}

fn dense_rescale(stats: &mut [u32]) -> u32 {
    let mut total = 0u32;
    for x in stats.iter_mut() {
        *x = (*x + 1) / 2;
        total += *x;
    }
    total
}

fn dense_get_freq(stats: &[u32], sym: usize, total: u32) -> (u32, u32, u32) {
    let left: u32 = stats[..sym].iter().sum();
    (stats[sym], left, total)
}

fn dense_get_sym(stats: &[u32], cum: u32) -> usize {
    let mut t = 0u32;
    for (i, &v) in stats.iter().enumerate() {
        t += v;
        if t > cum {
            return i;
        }
    }
    stats.len() - 1
}

// Promote a sparse pair list into a dense counter array.
fn sparse_to_dense(pairs: &[u32], alphabet: usize) -> Box<[u32]> {
    let mut stats = vec![1u32; alphabet].into_boxed_slice();
    for &x in pairs {
        stats[(x >> SYMBOL_SHIFT) as usize] = x & VALUE_MASK;
    }
    stats
}

const fn compact_limit(alphabet: usize) -> usize {
    let limit = alphabet * 33 / 100;
    if limit < 4 { 4 } else { limit }
}

/// Dense model: one counter per symbol.
#[derive(Debug, Clone)]
pub struct DenseModel<const A: usize, const LOG: u32, const ADD: u32> {
    stats: [u32; A],
    total: u32,
}

impl<const A: usize, const LOG: u32, const ADD: u32> Default for DenseModel<A, LOG, ADD> {
    fn default() -> Self {
        Self {
            stats: [1; A],
            total: A as u32,
        }
    }
}

impl<const A: usize, const LOG: u32, const ADD: u32> FreqModel for DenseModel<A, LOG, ADD> {
    fn get_freq(&self, sym: usize) -> (u32, u32, u32) {
        dense_get_freq(&self.stats, sym, self.total)
    }

    fn update(&mut self, sym: usize) {
        self.stats[sym] += ADD;
        self.total += ADD;
        while self.total >= (1 << LOG) {
            self.total = dense_rescale(&mut self.stats);
        }
    }

    fn get_sym(&self, cum: u32) -> usize {
        dense_get_sym(&self.stats, cum)
    }

    fn total(&self) -> u32 {
        self.total
    }
}

#[derive(Debug, Clone)]
enum AdjRepr {
    Sparse(Vec<u32>),
    Dense(Box<[u32]>),
}

/// Adjustable model: sparse until a third of the alphabet is populated, then
/// dense for the rest of its life.
#[derive(Debug, Clone)]
pub struct AdjustableModel<const A: usize, const LOG: u32, const ADD: u32> {
    repr: AdjRepr,
    total: u32,
}

impl<const A: usize, const LOG: u32, const ADD: u32> Default for AdjustableModel<A, LOG, ADD> {
    fn default() -> Self {
        Self {
            repr: AdjRepr::Sparse(Vec::new()),
            total: A as u32,
        }
    }
}

impl<const A: usize, const LOG: u32, const ADD: u32> FreqModel for AdjustableModel<A, LOG, ADD> {
    fn get_freq(&self, sym: usize) -> (u32, u32, u32) {
        match &self.repr {
            AdjRepr::Sparse(pairs) => sparse_get_freq(pairs, sym, self.total),
            AdjRepr::Dense(stats) => dense_get_freq(stats, sym, self.total),
        }
    }

    fn update(&mut self, sym: usize) {
        let mut promoted: Option<AdjRepr> = None;

        match &mut self.repr {
            AdjRepr::Sparse(pairs) => {
                let expanded = sparse_update(pairs, sym as u32, ADD);
                if expanded && pairs.len() >= compact_limit(A) {
                    promoted = Some(AdjRepr::Dense(sparse_to_dense(pairs, A)));
                }
            }
            AdjRepr::Dense(stats) => {
                stats[sym] += ADD;
            }
        }

        if let Some(repr) = promoted {
            self.repr = repr;
        }
        self.total += ADD;

        while self.total >= (1 << LOG) {
            self.total = match &mut self.repr {
                AdjRepr::Sparse(pairs) => sparse_rescale(pairs, A as u32),
                AdjRepr::Dense(stats) => dense_rescale(stats),
            };
        }
    }

    fn get_sym(&self, cum: u32) -> usize {
        match &self.repr {
            AdjRepr::Sparse(pairs) => sparse_get_sym(pairs, A as u32, self.total, cum),
            AdjRepr::Dense(stats) => dense_get_sym(stats, cum),
        }
    }

    fn total(&self) -> u32 {
        self.total
    }
}

// Insert-or-bump into the sorted pair list; true when a new pair appeared.
fn sparse_update(pairs: &mut Vec<u32>, sym: u32, add: u32) -> bool {
    let mut i = 0;
    let mut expanded = false;

    while i < pairs.len() {
        let s = pairs[i] >> SYMBOL_SHIFT;
        if s == sym {
            break;
        }
        if s > sym {
            pairs.insert(i, pack_sv(sym, 1));
            expanded = true;
            break;
        }
        i += 1;
    }

    if i == pairs.len() {
        pairs.push(pack_sv(sym, 1));
        expanded = true;
    }

    pairs[i] += add;
    expanded
}

#[derive(Debug, Clone)]
enum EmbRepr {
    Inline { pairs: [u32; 2], len: u8 },
    Sparse(Vec<u32>),
    Dense(Box<[u32]>),
}

/// Adjustable model with the first two pairs held inline.
#[derive(Debug, Clone)]
pub struct AdjustableModelEmb<const A: usize, const LOG: u32, const ADD: u32> {
    repr: EmbRepr,
    total: u32,
}

impl<const A: usize, const LOG: u32, const ADD: u32> Default for AdjustableModelEmb<A, LOG, ADD> {
    fn default() -> Self {
        Self {
            repr: EmbRepr::Inline {
                pairs: [0; 2],
                len: 0,
            },
            total: A as u32,
        }
    }
}

impl<const A: usize, const LOG: u32, const ADD: u32> AdjustableModelEmb<A, LOG, ADD> {
    fn pairs(&self) -> Option<&[u32]> {
        match &self.repr {
            EmbRepr::Inline { pairs, len } => Some(&pairs[..*len as usize]),
            EmbRepr::Sparse(pairs) => Some(pairs),
            EmbRepr::Dense(_) => None,
        }
    }
}

impl<const A: usize, const LOG: u32, const ADD: u32> FreqModel for AdjustableModelEmb<A, LOG, ADD> {
    fn get_freq(&self, sym: usize) -> (u32, u32, u32) {
        match self.pairs() {
            Some(pairs) => sparse_get_freq(pairs, sym, self.total),
            None => match &self.repr {
                EmbRepr::Dense(stats) => dense_get_freq(stats, sym, self.total),
                _ => unreachable!(),
            },
        }
    }

    fn update(&mut self, sym: usize) {
        let mut new_repr: Option<EmbRepr> = None;

        match &mut self.repr {
            EmbRepr::Inline { pairs, len } => {
                let n = *len as usize;
                let sym32 = sym as u32;

                let mut i = 0;
                while i < n {
                    let s = pairs[i] >> SYMBOL_SHIFT;
                    if s >= sym32 {
                        break;
                    }
                    i += 1;
                }

                let exists = i < n && (pairs[i] >> SYMBOL_SHIFT) == sym32;

                if exists {
                    pairs[i] += ADD;
                } else if n < 2 {
                    // Shift the tail right and drop the new pair in place.
                    if i < n {
                        pairs[n] = pairs[n - 1];
                    }
                    pairs[i] = pack_sv(sym32, 1 + ADD);
                    *len += 1;
                } else {
                    // Third distinct symbol: spill to the allocated form.
                    let mut spilled = Vec::with_capacity(4);
                    spilled.extend_from_slice(&pairs[..n]);
                    spilled.insert(i, pack_sv(sym32, 1 + ADD));
                    new_repr = Some(EmbRepr::Sparse(spilled));
                }
            }
            EmbRepr::Sparse(pairs) => {
                let expanded = sparse_update(pairs, sym as u32, ADD);
                if expanded && pairs.len() >= compact_limit(A) {
                    new_repr = Some(EmbRepr::Dense(sparse_to_dense(pairs, A)));
                }
            }
            EmbRepr::Dense(stats) => {
                stats[sym] += ADD;
            }
        }

        if let Some(repr) = new_repr {
            self.repr = repr;
        }
        self.total += ADD;

        while self.total >= (1 << LOG) {
            self.total = match &mut self.repr {
                EmbRepr::Inline { pairs, len } => {
                    sparse_rescale(&mut pairs[..*len as usize], A as u32)
                }
                EmbRepr::Sparse(pairs) => sparse_rescale(pairs, A as u32),
                EmbRepr::Dense(stats) => dense_rescale(stats),
            };
        }
    }

    fn get_sym(&self, cum: u32) -> usize {
        match self.pairs() {
            Some(pairs) => sparse_get_sym(pairs, A as u32, self.total, cum),
            None => match &self.repr {
                EmbRepr::Dense(stats) => dense_get_sym(stats, cum),
                _ => unreachable!(),
            },
        }
    }

    fn total(&self) -> u32 {
        self.total
    }
}

/// A frequency model paired with range-coder entry points.
#[derive(Debug, Clone, Default)]
pub struct CoderModel<M: FreqModel> {
    model: M,
}

impl<M: FreqModel> CoderModel<M> {
    /// Fresh model in its initial state.
    pub fn new() -> Self {
        Self {
            model: M::default(),
        }
    }

    /// Encode `sym` and update the model.
    pub fn encode(&mut self, rc: &mut RangeEncoder, sym: usize) {
        let (sym_freq, cum_freq, total) = self.model.get_freq(sym);
        rc.encode_frequency(u64::from(sym_freq), u64::from(cum_freq), u64::from(total));
        self.model.update(sym);
    }

    /// Decode one symbol and update the model.
    pub fn decode(&mut self, rc: &mut RangeDecoder<'_>) -> Result<usize> {
        let total = self.model.total();
        let cum = rc.decode_cum(u64::from(total))? as u32;

        let sym = self.model.get_sym(cum);
        let (sym_freq, cum_freq, _) = self.model.get_freq(sym);
        rc.update_frequency(u64::from(sym_freq), u64::from(cum_freq))?;
        self.model.update(sym);

        Ok(sym)
    }

    /// Update the model without coding anything (used when a value travelled
    /// through a side channel but should still train this model).
    pub fn update(&mut self, sym: usize) {
        self.model.update(sym);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<M: FreqModel>(symbols: &[usize]) {
        let mut enc_model: CoderModel<M> = CoderModel::new();
        let mut rc = RangeEncoder::new();
        for &s in symbols {
            enc_model.encode(&mut rc, s);
        }
        let coded = rc.finish();

        let mut dec_model: CoderModel<M> = CoderModel::new();
        let mut rd = RangeDecoder::new(&coded).unwrap();
        for &s in symbols {
            assert_eq!(dec_model.decode(&mut rd).unwrap(), s);
        }
    }

    #[test]
    fn test_dense_roundtrip() {
        let symbols: Vec<usize> = (0..5_000).map(|i| (i * 7 + i / 13) % 16).collect();
        roundtrip::<DenseModel<16, 15, 1>>(&symbols);
    }

    #[test]
    fn test_adjustable_roundtrip() {
        let symbols: Vec<usize> = (0..5_000).map(|i| (i * 31) % 256).collect();
        roundtrip::<AdjustableModel<256, 15, 1>>(&symbols);
    }

    #[test]
    fn test_adjustable_emb_roundtrip() {
        // Stays within the inline pairs for a while, then spills and
        // eventually converts to dense.
        let mut symbols = vec![3usize; 100];
        symbols.extend(vec![9usize; 100]);
        symbols.extend((0..5_000).map(|i| (i * 31) % 256));
        roundtrip::<AdjustableModelEmb<256, 16, 1>>(&symbols);
    }

    #[test]
    fn test_families_code_identically() {
        // Unseen symbols weigh 1 in every family, so dense and sparse forms
        // must produce byte-identical streams for the same history.
        let symbols: Vec<usize> = (0..2_000).map(|i| (i * i + 3 * i) % 64).collect();

        let mut m1: CoderModel<DenseModel<64, 13, 4>> = CoderModel::new();
        let mut rc1 = RangeEncoder::new();
        let mut m2: CoderModel<AdjustableModel<64, 13, 4>> = CoderModel::new();
        let mut rc2 = RangeEncoder::new();
        let mut m3: CoderModel<AdjustableModelEmb<64, 13, 4>> = CoderModel::new();
        let mut rc3 = RangeEncoder::new();

        for &s in &symbols {
            m1.encode(&mut rc1, s);
            m2.encode(&mut rc2, s);
            m3.encode(&mut rc3, s);
        }

        let c1 = rc1.finish();
        assert_eq!(c1, rc2.finish());
        assert_eq!(c1, rc3.finish());
    }

    #[test]
    fn test_rescale_keeps_symbols_alive() {
        let mut m: DenseModel<4, 8, 16> = DenseModel::default();
        for _ in 0..10_000 {
            m.update(2);
        }
        for s in 0..4 {
            let (f, _, _) = m.get_freq(s);
            assert!(f >= 1);
        }
        assert!(m.total() < 1 << 8);
    }

    #[test]
    fn test_randomized_adjustable_emb() {
        use rand::{Rng, SeedableRng, rngs::StdRng};
        let mut rng = StdRng::seed_from_u64(42);
        let symbols: Vec<usize> = (0..20_000).map(|_| rng.gen_range(0..128)).collect();
        roundtrip::<AdjustableModelEmb<128, 11, 1>>(&symbols);
    }
}
