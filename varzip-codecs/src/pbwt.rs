//! Positional Burrows-Wheeler permutation over genotype rows.
//!
//! A permutation of the haplotype columns is maintained across successive
//! rows: each row is read through the previous permutation and re-sorted by
//! a counting sort on its symbols, so haplotypes that agreed recently stay
//! adjacent and the rows collapse into long runs.
//!
//! Near-constant rows (fewer than `neglect_limit` non-majority symbols) do
//! not update the permutation — rare-variant noise would otherwise destroy
//! the locality the later rows depend on. When the row width shrinks, the
//! indices that fell off are remembered so rows that grow back reuse their
//! previous rank before brand-new indices are appended.

use varzip_core::utils::{calc_cumulate_histogram, calc_cumulate_histogram_rle};

/// PBWT permutation state, shared by the encode and decode directions.
#[derive(Debug, Default)]
pub struct Pbwt {
    neglect_limit: u32,

    perm_prev: Vec<u32>,
    perm_cur: Vec<u32>,
    removed_ids: Vec<u32>,
    hist: Vec<u32>,
}

impl Pbwt {
    /// Initialize for `no_items` haplotype columns.
    pub fn start(no_items: usize, neglect_limit: u32) -> Self {
        Self {
            neglect_limit,
            perm_prev: (0..no_items as u32).collect(),
            perm_cur: Vec::with_capacity(no_items),
            removed_ids: Vec::new(),
            hist: Vec::new(),
        }
    }

    // Resize the permutation to `new_size`, recycling removed indices on
    // growth and parking them on shrink.
    fn adjust_size(&mut self, new_size: usize) {
        let prev_size = self.perm_prev.len();

        if new_size > prev_size {
            if self.removed_ids.len() >= new_size {
                for i in prev_size..new_size {
                    self.perm_prev.push(self.removed_ids[i]);
                }
            } else {
                for i in prev_size..new_size {
                    self.perm_prev.push(i as u32);
                }
            }
        } else if new_size < prev_size {
            if self.removed_ids.len() < prev_size {
                self.removed_ids.resize(prev_size, 0);
            }

            let mut out = new_size;
            for &x in &self.perm_prev {
                if x >= new_size as u32 {
                    self.removed_ids[out] = x;
                    out += 1;
                }
            }

            self.perm_prev.retain(|&x| x < new_size as u32);
        }
    }

    /// Forward transform one row: emit its permuted symbols as run-length
    /// pairs and advance the permutation.
    pub fn encode_row(&mut self, max_val: u32, input: &[u32], rle: &mut Vec<(u32, u32)>) {
        self.hist.resize(max_val as usize + 1, 0);
        let row_len = input.len();

        let mut max_count = 0;
        calc_cumulate_histogram(input, &mut self.hist, &mut max_count);

        let mut perm_saved = Vec::new();
        if row_len != self.perm_prev.len() {
            if (row_len as u32).saturating_sub(max_count) < self.neglect_limit {
                perm_saved = self.perm_prev.clone();
            }
            self.adjust_size(row_len);
        }

        self.perm_cur.resize(row_len, 0);

        rle.clear();
        let mut prev_symbol = input[self.perm_prev[0] as usize];
        let mut run_len = 0u32;

        for i in 0..row_len {
            let cur_symbol = input[self.perm_prev[i] as usize];

            if cur_symbol == prev_symbol {
                run_len += 1;
            } else {
                rle.push((prev_symbol, run_len));
                prev_symbol = cur_symbol;
                run_len = 1;
            }

            self.perm_cur[self.hist[cur_symbol as usize] as usize] = self.perm_prev[i];
            self.hist[cur_symbol as usize] += 1;
        }

        rle.push((prev_symbol, run_len));

        if row_len as u32 - max_count >= self.neglect_limit {
            std::mem::swap(&mut self.perm_prev, &mut self.perm_cur);
        } else if !perm_saved.is_empty() {
            self.perm_prev = perm_saved;
        }
    }

    /// Reverse transform one row of run-length pairs back to column order.
    pub fn decode_row(&mut self, max_val: u32, rle: &[(u32, u32)], output: &mut Vec<u32>) {
        self.hist.resize(max_val as usize + 1, 0);

        let row_len: u32 = rle.iter().map(|&(_, len)| len).sum();
        output.clear();
        output.resize(row_len as usize, 0);

        let mut max_count = 0;
        calc_cumulate_histogram_rle(rle, &mut self.hist, &mut max_count);

        let mut perm_saved = Vec::new();
        if row_len as usize != self.perm_prev.len() {
            if row_len.saturating_sub(max_count) < self.neglect_limit {
                perm_saved = self.perm_prev.clone();
            }
            self.adjust_size(row_len as usize);
        }

        self.perm_cur.resize(row_len as usize, 0);

        let mut rle_iter = rle.iter().filter(|&&(_, len)| len > 0);
        let (mut cur_symbol, mut cur_cnt) = rle_iter.next().copied().unwrap_or((0, 0));

        for i in 0..row_len as usize {
            output[self.perm_prev[i] as usize] = cur_symbol;

            self.perm_cur[self.hist[cur_symbol as usize] as usize] = self.perm_prev[i];
            self.hist[cur_symbol as usize] += 1;

            cur_cnt -= 1;
            if cur_cnt == 0 {
                if let Some(&(sym, cnt)) = rle_iter.next() {
                    cur_symbol = sym;
                    cur_cnt = cnt;
                }
            }
        }

        if row_len - max_count >= self.neglect_limit {
            std::mem::swap(&mut self.perm_prev, &mut self.perm_cur);
        } else if !perm_saved.is_empty() {
            self.perm_prev = perm_saved;
        }
    }

    /// Current permutation (exposed for tests).
    pub fn permutation(&self) -> &[u32] {
        &self.perm_prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_rows(rows: &[Vec<u32>], neglect_limit: u32) {
        let n = rows[0].len();
        let mut fwd = Pbwt::start(n, neglect_limit);
        let mut rev = Pbwt::start(n, neglect_limit);

        let mut rle = Vec::new();
        let mut decoded = Vec::new();

        for row in rows {
            let max_val = *row.iter().max().unwrap();
            fwd.encode_row(max_val, row, &mut rle);

            let total: u32 = rle.iter().map(|&(_, l)| l).sum();
            assert_eq!(total as usize, row.len());

            rev.decode_row(max_val, &rle, &mut decoded);
            assert_eq!(&decoded, row);
        }
    }

    #[test]
    fn test_single_row() {
        roundtrip_rows(&[vec![1, 2, 1, 1, 2, 0, 0, 1]], 10);
    }

    #[test]
    fn test_many_rows_all_limits() {
        let rows: Vec<Vec<u32>> = (0..50)
            .map(|r| (0..64).map(|i| u32::from((i + r) % 7 == 0)).collect())
            .collect();

        for limit in [0, 1, 10, 1000] {
            roundtrip_rows(&rows, limit);
        }
    }

    #[test]
    fn test_near_constant_row_keeps_permutation() {
        let mut pbwt = Pbwt::start(8, 10);
        let mut rle = Vec::new();

        pbwt.encode_row(1, &[0, 1, 0, 1, 0, 1, 0, 1], &mut rle);
        let perm_after_dense = pbwt.permutation().to_vec();

        // 1 non-majority symbol < neglect_limit: permutation must not move.
        pbwt.encode_row(1, &[0, 0, 0, 0, 0, 0, 0, 1], &mut rle);
        assert_eq!(pbwt.permutation(), perm_after_dense.as_slice());
    }

    #[test]
    fn test_row_width_changes() {
        // Widths shrink then grow back; removed indices must be reusable.
        let rows = [
            (0..16).map(|i| i % 3).collect::<Vec<u32>>(),
            (0..8).map(|i| i % 2).collect(),
            (0..16).map(|i| u32::from(i % 5 == 0)).collect(),
            (0..4).map(|i| i % 2).collect(),
            (0..16).map(|i| i % 4).collect(),
        ];

        let mut fwd = Pbwt::start(16, 0);
        let mut rev = Pbwt::start(16, 0);
        let mut rle = Vec::new();
        let mut decoded = Vec::new();

        for row in &rows {
            let max_val = *row.iter().max().unwrap();
            fwd.encode_row(max_val, row, &mut rle);
            rev.decode_row(max_val, &rle, &mut decoded);
            assert_eq!(&decoded, row);
        }
    }

    #[test]
    fn test_long_runs_compress() {
        // Sorted symbols concentrate: after a few identical rows the RLE
        // must collapse to one run per symbol value.
        let row: Vec<u32> = (0..100).map(|i| u32::from(i % 10 == 0)).collect();
        let mut pbwt = Pbwt::start(100, 0);
        let mut rle = Vec::new();

        pbwt.encode_row(1, &row, &mut rle);
        pbwt.encode_row(1, &row, &mut rle);
        assert_eq!(rle.len(), 2);
    }
}
