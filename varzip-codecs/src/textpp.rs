//! Reversible text preprocessing for string columns.
//!
//! The encoder tokenizes a byte buffer into words, numbers, base letters,
//! zero runs, bar runs, and plain bytes, then rewrites it over a partitioned
//! output alphabet:
//!
//! | bytes | meaning |
//! |---|---|
//! | 0 | end of the per-part dictionary update |
//! | 1..4 | base letter A/C/G/T followed by ':' |
//! | 5..127 | plain byte |
//! | 128..227 | one base-100 digit of a packed number |
//! | 228..237 | zero run of length 1..10 |
//! | 238..252 | bar run of length 1..15 |
//! | 253..255 | word reference (3/2/1 code bytes) |
//!
//! A word seen for the 16th time is promoted into a dictionary that persists
//! across parts of the same column; the words promoted while encoding a part
//! are shipped ahead of its payload as '\n'-terminated strings closed by a
//! NUL, so the decoder's dictionary stays in lockstep.

use std::collections::HashMap;
use varzip_core::error::{Result, VarzipError};

/// Occurrence count at which a word enters the dictionary.
const MIN_WORD_CNT: u32 = 16;
/// Minimum token length for word treatment.
const MIN_WORD_LEN: usize = 6;
/// Longest digit run packed as a number.
const MAX_NUMBER_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Nothing,
    Word,
    Number,
    Bars,
    ZeroRun,
    Base,
}

/// Per-column reversible text preprocessor. One instance per column per
/// direction; its dictionary survives across parts.
#[derive(Debug, Default)]
pub struct TextPreproc {
    dict: HashMap<Vec<u8>, u32>,
    candidates: HashMap<Vec<u8>, u32>,
    next_code: u32,
    // words promoted while encoding the current part, shipped ahead of its
    // payload
    pending_words: Vec<Vec<u8>>,

    // decode side
    words: Vec<Vec<u8>>,
}

impl TextPreproc {
    /// Create an empty preprocessor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `input`, producing the dictionary update followed by the coded
    /// payload.
    pub fn encode(&mut self, input: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(input.len() / 2 + 16);

        let tokens = self.update_dict(input);
        self.store_dict(&mut output);
        self.compress_part(input, &tokens, &mut output);

        output
    }

    /// Decode a buffer produced by [`TextPreproc::encode`].
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() * 2);
        let mut pos = 0usize;

        self.load_dict(input, &mut pos)?;
        self.decompress_part(input, &mut pos, &mut output)?;

        Ok(output)
    }

    // First pass: tokenize, count words, promote the ones that reach the
    // threshold. Tokens are (kind, start, len) triples into `input`.
    fn update_dict(&mut self, input: &[u8]) -> Vec<(Token, usize, usize)> {
        let mut tokens = Vec::new();
        let mut new_words = Vec::new();
        let mut pos = 0usize;

        while pos < input.len() {
            let start = pos;
            let token = get_token(input, &mut pos);
            tokens.push((token, start, pos - start));

            if token == Token::Word {
                let word = &input[start..pos];
                if !self.dict.contains_key(word) {
                    let cnt = self.candidates.entry(word.to_vec()).or_insert(0);
                    *cnt += 1;
                    if *cnt == MIN_WORD_CNT {
                        self.candidates.remove(word);
                        self.dict.insert(word.to_vec(), self.next_code);
                        self.next_code += 1;
                        new_words.push(word.to_vec());
                    }
                }
            }
        }

        self.pending_words = new_words;
        tokens
    }

    fn store_dict(&mut self, output: &mut Vec<u8>) {
        for word in self.pending_words.drain(..) {
            output.extend_from_slice(&word);
            output.push(b'\n');
        }
        output.push(0);
    }

    fn load_dict(&mut self, input: &[u8], pos: &mut usize) -> Result<()> {
        let mut word = Vec::new();

        loop {
            let c = *input
                .get(*pos)
                .ok_or_else(|| VarzipError::corrupt_input("unterminated text dictionary"))?;
            *pos += 1;

            match c {
                0 => {
                    if !word.is_empty() {
                        self.words.push(word);
                    }
                    return Ok(());
                }
                b'\n' => {
                    if !word.is_empty() {
                        self.words.push(std::mem::take(&mut word));
                    }
                }
                _ => word.push(c),
            }
        }
    }

    fn compress_part(
        &self,
        input: &[u8],
        tokens: &[(Token, usize, usize)],
        output: &mut Vec<u8>,
    ) {
        for &(token, start, len) in tokens {
            let bytes = &input[start..start + len];
            match token {
                Token::Word => match self.dict.get(bytes) {
                    Some(&code) => encode_word(output, code),
                    None => output.extend_from_slice(bytes),
                },
                Token::Base => encode_base(output, bytes[0]),
                Token::Number => encode_number(output, bytes),
                Token::Bars => encode_bars(output, len as u32),
                Token::ZeroRun => encode_zero_run(output, len as u32),
                Token::Nothing => output.extend_from_slice(bytes),
            }
        }
    }

    fn decompress_part(
        &self,
        input: &[u8],
        pos: &mut usize,
        output: &mut Vec<u8>,
    ) -> Result<()> {
        while *pos < input.len() {
            let c = input[*pos];
            *pos += 1;

            match c {
                1..=4 => {
                    output.push(b" ACGT"[c as usize]);
                    output.push(b':');
                }
                0..=127 => output.push(c),
                128..=227 => {
                    *pos -= 1;
                    decode_number(input, pos, output);
                }
                228..=237 => {
                    *pos -= 1;
                    decode_zero_run(input, pos, output);
                }
                238..=252 => {
                    *pos -= 1;
                    decode_bars(input, pos, output);
                }
                _ => {
                    *pos -= 1;
                    self.decode_word(input, pos, output)?;
                }
            }
        }

        Ok(())
    }

    fn decode_word(&self, input: &[u8], pos: &mut usize, output: &mut Vec<u8>) -> Result<()> {
        let take = |pos: &mut usize| -> Result<usize> {
            let b = *input
                .get(*pos)
                .ok_or_else(|| VarzipError::corrupt_input("truncated word reference"))?;
            *pos += 1;
            Ok(b as usize)
        };

        let prefix = take(pos)?;
        let code = match prefix {
            255 => take(pos)?,
            254 => 256 + take(pos)? * 256 + take(pos)?,
            _ => 256 + 256 * 256 + take(pos)? * 65536 + take(pos)? * 256 + take(pos)?,
        };

        let word = self
            .words
            .get(code)
            .ok_or_else(|| VarzipError::corrupt_input("word reference outside dictionary"))?;
        output.extend_from_slice(word);

        Ok(())
    }
}

fn is_word_symbol(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'(' | b')' | b'&' | b'/')
}

fn get_token(input: &[u8], pos: &mut usize) -> Token {
    let c = input[*pos];

    match c {
        b'1'..=b'9' => {
            while *pos < input.len() && input[*pos].is_ascii_digit() {
                *pos += 1;
            }
            Token::Number
        }
        b'0' => {
            while *pos < input.len() && input[*pos] == b'0' {
                *pos += 1;
            }
            Token::ZeroRun
        }
        b'|' => {
            while *pos < input.len() && input[*pos] == b'|' {
                *pos += 1;
            }
            Token::Bars
        }
        b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
            let start = *pos;
            *pos += 1;

            if matches!(c, b'A' | b'C' | b'G' | b'T')
                && *pos < input.len()
                && input[*pos] == b':'
            {
                *pos += 1;
                return Token::Base;
            }

            while *pos < input.len() && is_word_symbol(input[*pos]) {
                *pos += 1;
            }

            if *pos - start >= MIN_WORD_LEN {
                Token::Word
            } else {
                Token::Nothing
            }
        }
        _ => {
            *pos += 1;
            Token::Nothing
        }
    }
}

fn encode_word(output: &mut Vec<u8>, code: u32) {
    let mut x = code as usize;

    if x < 256 {
        output.push(255);
        output.push(x as u8);
        return;
    }

    x -= 256;
    if x < 256 * 256 {
        output.push(254);
        output.push((x >> 8) as u8);
        output.push((x & 0xff) as u8);
        return;
    }

    x -= 256 * 256;
    output.push(253);
    output.push((x >> 16) as u8);
    output.push(((x >> 8) & 0xff) as u8);
    output.push((x & 0xff) as u8);
}

fn encode_base(output: &mut Vec<u8>, letter: u8) {
    let code = match letter {
        b'A' => 1,
        b'C' => 2,
        b'G' => 3,
        _ => 4,
    };
    output.push(code);
}

fn encode_number(output: &mut Vec<u8>, digits: &[u8]) {
    if digits.len() > MAX_NUMBER_LEN {
        output.extend_from_slice(digits);
        return;
    }

    let mut x = 0u64;
    for &c in digits {
        x = x * 10 + u64::from(c - b'0');
    }

    // Big-endian digits in base 100, offset into 128..227.
    let mut packed = [0u8; 8];
    let mut len = 0;
    while x != 0 {
        packed[len] = (x % 100) as u8;
        x /= 100;
        len += 1;
    }

    for i in (0..len).rev() {
        output.push(128 + packed[i]);
    }
}

fn encode_bars(output: &mut Vec<u8>, mut len: u32) {
    while len != 0 {
        let x = len.min(15);
        output.push(253 - x as u8); // 238..252
        len -= x;
    }
}

fn encode_zero_run(output: &mut Vec<u8>, mut len: u32) {
    while len != 0 {
        let x = len.min(10);
        output.push(238 - x as u8); // 228..237
        len -= x;
    }
}

fn decode_number(input: &[u8], pos: &mut usize, output: &mut Vec<u8>) {
    let mut x = 0u64;

    while *pos < input.len() {
        let c = input[*pos];
        if !(128..=227).contains(&c) {
            break;
        }
        *pos += 1;
        x = x * 100 + u64::from(c - 128);
    }

    output.extend_from_slice(x.to_string().as_bytes());
}

fn decode_zero_run(input: &[u8], pos: &mut usize, output: &mut Vec<u8>) {
    while *pos < input.len() {
        let c = input[*pos];
        if !(228..=237).contains(&c) {
            break;
        }
        *pos += 1;
        let len = 238 - c;
        output.extend(std::iter::repeat_n(b'0', len as usize));
    }
}

fn decode_bars(input: &[u8], pos: &mut usize, output: &mut Vec<u8>) {
    while *pos < input.len() {
        let c = input[*pos];
        if !(238..=252).contains(&c) {
            break;
        }
        *pos += 1;
        let len = 253 - c;
        output.extend(std::iter::repeat_n(b'|', len as usize));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &[u8]) {
        let mut enc = TextPreproc::new();
        let mut dec = TextPreproc::new();
        let coded = enc.encode(input);
        assert_eq!(dec.decode(&coded).unwrap(), input, "failed for {:?}", input);
    }

    #[test]
    fn test_plain_text_untouched_semantically() {
        roundtrip(b"PASS");
        roundtrip(b".");
        roundtrip(b"");
        roundtrip(b"a;b;c");
    }

    #[test]
    fn test_numbers_and_zero_runs() {
        roundtrip(b"123456789");
        roundtrip(b"000000000000");
        roundtrip(b"10002000");
        // 16+ digits stay plain
        roundtrip(b"1234567890123456789");
    }

    #[test]
    fn test_bars_and_bases() {
        roundtrip(b"1|1|0|1");
        roundtrip(b"||||||||||||||||||||");
        roundtrip(b"A:T:G:C:");
    }

    #[test]
    fn test_word_promotion_across_parts() {
        let part: Vec<u8> = b"LongAnnotationWord;OtherLongWord;"
            .iter()
            .cycle()
            .take(33 * 20)
            .copied()
            .collect();

        let mut enc = TextPreproc::new();
        let mut dec = TextPreproc::new();

        // First part promotes the words; second part must reuse the codes.
        let c1 = enc.encode(&part);
        let c2 = enc.encode(&part);
        assert!(c2.len() < c1.len());
        assert_eq!(dec.decode(&c1).unwrap(), part);
        assert_eq!(dec.decode(&c2).unwrap(), part);
    }

    #[test]
    fn test_short_inputs_below_word_len() {
        roundtrip(b"abcde"); // 5 < MIN_WORD_LEN
        roundtrip(b"AC");
    }

    #[test]
    fn test_mixed_annotation_line() {
        roundtrip(b"gene_name=BRCA2&exon/intron(3);score=0.991;depth=000123||");
    }
}
