//! Carry-less range coder over 64-bit state.
//!
//! Renormalization emits one byte whenever the top byte of `low` and
//! `low + range` agree (the carry-less criterion); the encoder flushes eight
//! bytes of `low` at the end and the decoder primes an eight-byte window on
//! start, so a well-formed stream never starves the decoder.

use varzip_core::bytestream::{ByteReader, ByteWriter};
use varzip_core::error::{Result, VarzipError};

/// Renormalization threshold: range is stretched while it fits below this.
const TOP_VALUE: u64 = 0x00ff_ffff_ffff_ffff;

/// Mask selecting the top byte of the 64-bit state.
const MASK_64: u64 = 0xff00_0000_0000_0000;

/// Range encoder writing into an owned byte buffer.
#[derive(Debug)]
pub struct RangeEncoder {
    out: ByteWriter,
    low: u64,
    range: u64,
}

impl RangeEncoder {
    /// Create a started encoder.
    pub fn new() -> Self {
        Self {
            out: ByteWriter::new(),
            low: 0,
            range: MASK_64,
        }
    }

    /// Encode one symbol given its frequency, cumulative frequency, and the
    /// model total.
    pub fn encode_frequency(&mut self, sym_freq: u64, cum_freq: u64, total: u64) {
        debug_assert!(self.range > total);
        self.range /= total;
        self.low = self.low.wrapping_add(self.range * cum_freq);
        self.range *= sym_freq;

        while self.range <= TOP_VALUE {
            if (self.low ^ self.low.wrapping_add(self.range)) & MASK_64 != 0 {
                let r = self.low;
                self.range = (r | TOP_VALUE) - r;
            }
            self.out.put((self.low >> 56) as u8);
            self.low <<= 8;
            self.range <<= 8;
        }
    }

    /// Flush the remaining state and take the coded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for _ in 0..8 {
            self.out.put((self.low >> 56) as u8);
            self.low <<= 8;
        }
        self.out.into_vec()
    }
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Range decoder reading from a borrowed byte slice.
#[derive(Debug)]
pub struct RangeDecoder<'a> {
    input: ByteReader<'a>,
    low: u64,
    range: u64,
    buffer: u64,
}

impl<'a> RangeDecoder<'a> {
    /// Create a started decoder; fails when the stream is shorter than the
    /// eight-byte priming window.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut input = ByteReader::new(data);

        let mut buffer = 0u64;
        for i in 1..=8u32 {
            buffer |= u64::from(input.get()?) << (64 - i * 8);
        }

        Ok(Self {
            input,
            low: 0,
            range: MASK_64,
            buffer,
        })
    }

    /// Narrow the range to `total` and return the cumulative frequency the
    /// coded symbol falls into.
    pub fn decode_cum(&mut self, total: u64) -> Result<u64> {
        debug_assert!(total != 0);
        self.range /= total;
        let cum = self.buffer / self.range;
        if cum >= total {
            return Err(VarzipError::corrupt_input(
                "cumulative frequency outside model total",
            ));
        }
        Ok(cum)
    }

    /// Commit the chosen symbol's frequency band and renormalize, pulling
    /// bytes as needed.
    pub fn update_frequency(&mut self, sym_freq: u64, cum_freq: u64) -> Result<()> {
        let r = cum_freq * self.range;
        self.buffer -= r;
        self.low = self.low.wrapping_add(r);
        self.range *= sym_freq;

        while self.range <= TOP_VALUE {
            if (self.low ^ self.low.wrapping_add(self.range)) & MASK_64 != 0 {
                let r = self.low;
                self.range = (r | TOP_VALUE) - r;
            }
            self.buffer = (self.buffer << 8) + u64::from(self.input.get()?);
            self.low <<= 8;
            self.range <<= 8;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_roundtrip() {
        // Fixed uniform model over 4 symbols, frequency 1 each.
        let symbols = [0u64, 3, 1, 2, 2, 0, 3, 3, 1, 0];

        let mut enc = RangeEncoder::new();
        for &s in &symbols {
            enc.encode_frequency(1, s, 4);
        }
        let coded = enc.finish();

        let mut dec = RangeDecoder::new(&coded).unwrap();
        for &s in &symbols {
            let cum = dec.decode_cum(4).unwrap();
            assert_eq!(cum, s);
            dec.update_frequency(1, cum).unwrap();
        }
    }

    #[test]
    fn test_skewed_roundtrip() {
        // 2-symbol model, 9:1 skew, long run of the frequent symbol.
        let mut enc = RangeEncoder::new();
        for i in 0..10_000u32 {
            let sym = u64::from(i % 100 == 0);
            let (f, c) = if sym == 0 { (9, 0) } else { (1, 9) };
            enc.encode_frequency(f, c, 10);
        }
        let coded = enc.finish();
        assert!(coded.len() < 2_000);

        let mut dec = RangeDecoder::new(&coded).unwrap();
        for i in 0..10_000u32 {
            let cum = dec.decode_cum(10).unwrap();
            let sym = u64::from(cum >= 9);
            assert_eq!(sym, u64::from(i % 100 == 0));
            let (f, c) = if sym == 0 { (9, 0) } else { (1, 9) };
            dec.update_frequency(f, c).unwrap();
        }
    }

    #[test]
    fn test_short_stream_rejected() {
        assert!(RangeDecoder::new(&[1, 2, 3]).is_err());
    }
}
