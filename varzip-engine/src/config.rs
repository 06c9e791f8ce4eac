//! Per-archive configuration.
//!
//! Everything tunable lives here and travels with the writer/reader; there
//! is no process-wide state. The parameter block written into the archive
//! (`db_params` stream) additionally records the values decoding depends on.

use varzip_blockcoder::BlockParams;

/// Metadata flag marking a text-preprocessed part; the rest of the word is
/// the raw size.
pub const PP_COMPRESS_FLAG: u64 = 1 << 30;

/// Number of fixed per-record description fields (chrom, pos, id, ref, alt,
/// qual).
pub const NO_DESC_FIELDS: usize = 6;

/// Names of the description size streams, in field order.
pub const DESC_STREAM_SIZE: [&str; NO_DESC_FIELDS] = [
    "db_chrom_size",
    "db_pos_size",
    "db_id_size",
    "db_ref_size",
    "db_alt_size",
    "db_qual_size",
];

/// Names of the description data streams, in field order.
pub const DESC_STREAM_DATA: [&str; NO_DESC_FIELDS] = [
    "idb_chrom_data",
    "idb_pos_data",
    "idb_id_data",
    "idb_ref_data",
    "idb_alt_data",
    "idb_qual_data",
];

/// Engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Rows with fewer non-majority genotype symbols than this do not
    /// update the PBWT permutation.
    pub neglect_limit: u32,
    /// Total thread budget; the worker pool uses `max(1, threads − 1)`.
    pub no_threads: u32,
    /// Compression level, 1..=3.
    pub compression_level: u32,

    /// Flush threshold of ordinary column buffers.
    pub max_buffer_size: u32,
    /// Flush threshold of the genotype column buffer.
    pub max_buffer_gt_size: u32,
    /// Flush threshold of the description-field buffers.
    pub max_buffer_desc_size: u32,

    /// Per-stream cap on queued-but-uncompressed parts.
    pub max_inflight_parts: u32,

    /// Records exchanged per pipeline cycle.
    pub records_per_cycle: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            neglect_limit: 10,
            no_threads: 8,
            compression_level: 3,
            max_buffer_size: 8 << 20,
            max_buffer_gt_size: 256 << 20,
            max_buffer_desc_size: 8 << 20,
            max_inflight_parts: 4,
            records_per_cycle: 8192,
        }
    }
}

impl Config {
    /// Worker-pool width for this thread budget.
    pub fn no_worker_threads(&self) -> usize {
        self.no_threads.saturating_sub(1).max(1) as usize
    }

    /// Block-coder parameters for size vectors.
    pub fn block_params_sizes(&self) -> BlockParams {
        BlockParams::sizes()
    }

    /// Block-coder parameters for generic column data.
    pub fn block_params_data(&self) -> BlockParams {
        BlockParams::data()
    }

    /// Block-coder parameters for the meta/header/samples blocks.
    pub fn block_params_meta(&self) -> BlockParams {
        BlockParams::data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count() {
        let mut c = Config::default();
        c.no_threads = 1;
        assert_eq!(c.no_worker_threads(), 1);
        c.no_threads = 8;
        assert_eq!(c.no_worker_threads(), 7);
    }
}
