//! Dictionary + context range coder for INFO and FORMAT columns.
//!
//! Values (32-bit ints or float bit patterns) are interned into a shared
//! dictionary. Per value a binary "known" model decides between the plain
//! path (four byte-plane models, one per byte of the new value) and the code
//! path (the dictionary code in up to four byte planes, each conditioned on
//! the previous planes and a caller-shaped context).
//!
//! INFO columns are dispatched on the shape of their size vector (zero, one
//! per record, constant width, mixtures with zeros, or anything else), and
//! the one/constant paths pick their context order once per column through
//! an entropy estimate over the whole part, transmitting the choice ahead of
//! the payload.
//!
//! FORMAT columns come in the fixed-width flavour (context mixes the two
//! previous rows and the left neighbour) and the variable-width flavour
//! (per-sample "same as previous entry" bit, contexts keyed by item and
//! sample index).

use std::collections::{HashMap, HashSet};
use varzip_core::error::{Result, VarzipError};
use varzip_rangecoder::{
    AdjustableModelEmb, CoderModel, ContextMap, DenseModel, RangeDecoder, RangeEncoder,
};

/// Reserved hash-table sentinel; always coded through the plain path.
const HT_EMPTY_KEY: u32 = 0x7fff_ffff;

/// Dictionary growth cap.
const MAX_DICT_SIZE: u32 = 1 << 20;

const CTX_SMALL_MASK: u64 = 0xfffff;

type SameModel = CoderModel<DenseModel<2, 19, 16>>;
type KnownModel = CoderModel<DenseModel<2, 15, 1>>;
type Known2Model = CoderModel<DenseModel<2, 19, 16>>;
type PlainModel = CoderModel<AdjustableModelEmb<256, 16, 1>>;
type CodeModel = CoderModel<AdjustableModelEmb<256, 19, 128>>;
type EntropyTypeModel = CoderModel<DenseModel<16, 19, 16>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum InfoShape {
    #[default]
    Unknown,
    Zero,
    One,
    ZeroOne,
    Constant,
    ZeroConstant,
    Any,
}

/// Codec state for one INFO or FORMAT column in one direction.
#[derive(Debug, Default)]
pub struct FieldCodec {
    no_samples: u32,

    dict: HashMap<u32, u32>,
    dict_dec: Vec<u32>,

    same_models: ContextMap<SameModel>,
    known_models: ContextMap<KnownModel>,
    known2_models: ContextMap<Known2Model>,
    plain_models: ContextMap<PlainModel>,
    code_models: ContextMap<CodeModel>,
    entropy_type_models: ContextMap<EntropyTypeModel>,

    shape: InfoShape,
    ctx_mode: u32,
}

fn words_of(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl FieldCodec {
    /// Create a codec for a column over `no_samples` samples.
    pub fn new(no_samples: u32) -> Self {
        Self {
            no_samples,
            ..Self::default()
        }
    }

    // ---- FORMAT entry points -------------------------------------------

    /// Encode a FORMAT part.
    pub fn encode_format(&mut self, sizes: &[u32], data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        if sizes.iter().all(|&s| s == self.no_samples) {
            self.encode_format_one(sizes, data)
        } else {
            self.encode_format_many(sizes, data)
        }
    }

    /// Decode a FORMAT part into `raw_len` bytes.
    pub fn decode_format(&mut self, sizes: &[u32], coded: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        if coded.is_empty() || raw_len == 0 {
            return Ok(Vec::new());
        }

        if sizes.iter().all(|&s| s == self.no_samples) {
            self.decode_format_one(sizes, coded)
        } else {
            self.decode_format_many(sizes, coded)
        }
    }

    // ---- INFO entry points ---------------------------------------------

    /// Encode an INFO part.
    pub fn encode_info(&mut self, sizes: &[u32], data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        let (shape, param) = determine_info_shape(sizes);
        if shape != self.shape {
            self.shape = shape;
            self.ctx_mode = 0;
        }

        match shape {
            InfoShape::Zero | InfoShape::Unknown => Vec::new(),
            InfoShape::One | InfoShape::ZeroOne | InfoShape::Any => self.encode_info_one(data),
            InfoShape::Constant | InfoShape::ZeroConstant => {
                self.encode_info_constant(param, data)
            }
        }
    }

    /// Decode an INFO part into `raw_len` bytes.
    pub fn decode_info(&mut self, sizes: &[u32], coded: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        if coded.is_empty() || raw_len == 0 {
            return Ok(Vec::new());
        }

        let (shape, param) = determine_info_shape(sizes);
        if shape != self.shape {
            self.shape = shape;
            self.ctx_mode = 0;
        }

        match shape {
            InfoShape::Zero | InfoShape::Unknown => Ok(Vec::new()),
            InfoShape::One | InfoShape::ZeroOne | InfoShape::Any => {
                self.decode_info_one(coded, raw_len)
            }
            InfoShape::Constant | InfoShape::ZeroConstant => {
                self.decode_info_constant(param, coded, raw_len)
            }
        }
    }

    // ---- shared sub-protocols ------------------------------------------

    fn encode_plain(&mut self, rc: &mut RangeEncoder, x: u32) {
        for k in 0..4u64 {
            self.plain_models
                .get_or_insert(k)
                .encode(rc, ((x >> (8 * k)) & 0xff) as usize);
        }
    }

    fn decode_plain(&mut self, rc: &mut RangeDecoder<'_>) -> Result<u32> {
        let mut x = 0u32;
        for k in 0..4u64 {
            let byte = self.plain_models.get_or_insert(k).decode(rc)? as u32;
            x += byte << (8 * k);
        }
        Ok(x)
    }

    // Code planes with tag bits at the top two context bits; high-plane
    // bytes fold into the context of the following planes.
    fn encode_code(&mut self, rc: &mut RangeEncoder, mut ctx: u64, code: u32) {
        let dict_size = self.dict.len() as u32;

        if dict_size > 256 * 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (3 << 62))
                .encode(rc, (code >> 24) as usize);
        }
        if dict_size > 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (2 << 62))
                .encode(rc, ((code >> 16) & 0xff) as usize);
            ctx += u64::from(code & 0xf_0000);
        }
        if dict_size > 256 {
            self.code_models
                .get_or_insert(ctx + (1 << 62))
                .encode(rc, ((code >> 8) & 0xff) as usize);
            ctx += u64::from(code & 0xff00);
        }
        self.code_models
            .get_or_insert(ctx)
            .encode(rc, (code & 0xff) as usize);
    }

    fn decode_code(&mut self, rc: &mut RangeDecoder<'_>, mut ctx: u64) -> Result<u32> {
        let dict_size = self.dict_dec.len() as u32;
        let mut code = 0u32;

        if dict_size > 256 * 256 * 256 {
            code = (self.code_models.get_or_insert(ctx + (3 << 62)).decode(rc)? as u32) << 24;
        }
        if dict_size > 256 * 256 {
            code += (self.code_models.get_or_insert(ctx + (2 << 62)).decode(rc)? as u32) << 16;
            ctx += u64::from(code & 0xf_0000);
        }
        if dict_size > 256 {
            code += (self.code_models.get_or_insert(ctx + (1 << 62)).decode(rc)? as u32) << 8;
            ctx += u64::from(code & 0xff00);
        }
        code += self.code_models.get_or_insert(ctx).decode(rc)? as u32;

        Ok(code)
    }

    // Train the code models on a plain-path value without emitting anything.
    fn update_code_enc(&mut self, mut ctx: u64, code: u32) {
        let dict_size = self.dict.len() as u32;

        if dict_size > 256 * 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (3 << 62))
                .update((code >> 24) as usize);
        }
        if dict_size > 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (2 << 62))
                .update(((code >> 16) & 0xff) as usize);
            ctx += u64::from(code & 0xf_0000);
        }
        if dict_size > 256 {
            self.code_models
                .get_or_insert(ctx + (1 << 62))
                .update(((code >> 8) & 0xff) as usize);
            ctx += u64::from(code & 0xff00);
        }
        self.code_models
            .get_or_insert(ctx)
            .update((code & 0xff) as usize);
    }

    fn update_code_dec(&mut self, mut ctx: u64, code: u32) {
        let dict_size = self.dict_dec.len() as u32;

        if dict_size > 256 * 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (3 << 62))
                .update((code >> 24) as usize);
        }
        if dict_size > 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (2 << 62))
                .update(((code >> 16) & 0xff) as usize);
            ctx += u64::from(code & 0xf_0000);
        }
        if dict_size > 256 {
            self.code_models
                .get_or_insert(ctx + (1 << 62))
                .update(((code >> 8) & 0xff) as usize);
            ctx += u64::from(code & 0xff00);
        }
        self.code_models
            .get_or_insert(ctx)
            .update((code & 0xff) as usize);
    }

    fn encode_ctx_type(&mut self, rc: &mut RangeEncoder, ctx_type: u32) {
        self.entropy_type_models
            .get_or_insert(0)
            .encode(rc, ctx_type as usize);
    }

    fn decode_ctx_type(&mut self, rc: &mut RangeDecoder<'_>) -> Result<u32> {
        Ok(self.entropy_type_models.get_or_insert(0).decode(rc)? as u32)
    }

    // ---- INFO one value per record -------------------------------------

    fn encode_info_one(&mut self, data: &[u8]) -> Vec<u8> {
        let values = words_of(data);
        let mut rc = RangeEncoder::new();

        if self.ctx_mode == 0 {
            let ent = [
                entropy_est_1(&mut values.iter().map(|&v| [v]).collect()),
                entropy_est_2(
                    &mut values.windows(2).map(|w| [w[0], w[1]]).collect(),
                ),
                entropy_est_3(
                    &mut values.windows(3).map(|w| [w[0], w[1], w[2]]).collect(),
                ),
            ];
            self.ctx_mode = arg_min(&ent) as u32 + 1;
            let mode = self.ctx_mode;
            self.encode_ctx_type(&mut rc, mode);
        }

        let ctx_mask: u64 = match self.ctx_mode {
            1 => 0xfffff,
            2 => 0xff_ffff_ffff,
            _ => 0xfff_ffff_ffff_ffff,
        };

        let mut ctx: u64 = !0;

        for &v in &values {
            ctx <<= 20;
            ctx &= ctx_mask;

            let code;
            match self.lookup(v) {
                None => {
                    self.known_models.get_or_insert(0).encode(&mut rc, 0);
                    self.encode_plain(&mut rc, v);

                    code = self.dict.len() as u32;
                    if code < MAX_DICT_SIZE && v != HT_EMPTY_KEY {
                        self.dict.insert(v, code);
                    }

                    self.update_code_enc(ctx, code);
                }
                Some(c) => {
                    code = c;
                    self.known_models.get_or_insert(0).encode(&mut rc, 1);
                    self.encode_code(&mut rc, ctx, code);
                }
            }

            ctx += u64::from(code) & CTX_SMALL_MASK;
        }

        rc.finish()
    }

    fn decode_info_one(&mut self, coded: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let mut rc = RangeDecoder::new(coded)?;

        if self.ctx_mode == 0 {
            self.ctx_mode = self.decode_ctx_type(&mut rc)?;
            if !(1..=3).contains(&self.ctx_mode) {
                return Err(VarzipError::corrupt_input("invalid context order"));
            }
        }

        let ctx_mask: u64 = match self.ctx_mode {
            1 => 0xfffff,
            2 => 0xff_ffff_ffff,
            _ => 0xfff_ffff_ffff_ffff,
        };

        let mut ctx: u64 = !0;
        let mut out = Vec::with_capacity(raw_len);

        for _ in 0..raw_len / 4 {
            ctx <<= 20;
            ctx &= ctx_mask;

            let code;
            let val;
            if self.known_models.get_or_insert(0).decode(&mut rc)? == 0 {
                val = self.decode_plain(&mut rc)?;

                code = self.dict_dec.len() as u32;
                if code < MAX_DICT_SIZE && val != HT_EMPTY_KEY {
                    self.dict_dec.push(val);
                }

                self.update_code_dec(ctx, code);
            } else {
                code = self.decode_code(&mut rc, ctx)?;
                val = self.dict_value(code)?;
            }

            out.extend_from_slice(&val.to_le_bytes());
            ctx += u64::from(code) & CTX_SMALL_MASK;
        }

        Ok(out)
    }

    // ---- INFO constant width -------------------------------------------

    fn encode_info_constant(&mut self, width: u32, data: &[u8]) -> Vec<u8> {
        let values = words_of(data);
        let s = width as usize;
        let no_rows = values.len() / s;
        let no_items = values.len();
        let m = u32::MAX;

        let mut rc = RangeEncoder::new();

        if self.ctx_mode == 0 {
            let at = |i: usize, j: isize, dj: isize, di: isize| -> u32 {
                // value at (row i + di, col j + dj), m outside the grid
                let jj = j + dj;
                let row = i as isize + di;
                if jj < 0 || row < 0 {
                    m
                } else {
                    values[(row as usize) * s + jj as usize]
                }
            };

            let mut ent = [0f64; 9];
            {
                let mut vec: Vec<[u32; 1]> = values.iter().map(|&v| [v]).collect();
                ent[0] = entropy_est_1(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([at(i, j as isize, -1, 0), values[i * s + j]]);
                    }
                }
                ent[1] = entropy_est_2(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([
                            at(i, j as isize, -2, 0),
                            at(i, j as isize, -1, 0),
                            values[i * s + j],
                        ]);
                    }
                }
                ent[2] = entropy_est_3(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([at(i, j as isize, 0, -1), values[i * s + j]]);
                    }
                }
                ent[3] = entropy_est_2(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([
                            at(i, j as isize, 0, -2),
                            at(i, j as isize, 0, -1),
                            values[i * s + j],
                        ]);
                    }
                }
                ent[4] = entropy_est_3(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([
                            at(i, j as isize, -1, 0),
                            at(i, j as isize, 0, -1),
                            values[i * s + j],
                        ]);
                    }
                }
                ent[5] = entropy_est_3(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([j as u32, at(i, j as isize, -1, 0), values[i * s + j]]);
                    }
                }
                ent[6] = entropy_est_3(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([j as u32, at(i, j as isize, 0, -1), values[i * s + j]]);
                    }
                }
                ent[7] = entropy_est_3(&mut vec);
            }
            {
                let mut vec = Vec::with_capacity(no_items);
                for i in 0..no_rows {
                    for j in 0..s {
                        vec.push([j as u32, values[i * s + j]]);
                    }
                }
                ent[8] = entropy_est_2(&mut vec);
            }

            self.ctx_mode = arg_min(&ent) as u32 + 1;
            let mode = self.ctx_mode;
            self.encode_ctx_type(&mut rc, mode);
        }

        let mut codes = vec![0u32; no_items];
        let mut ctx: u64 = 0;

        for i in 0..no_rows {
            for j in 0..s {
                let idx = i * s + j;
                ctx = constant_context(self.ctx_mode, ctx, &codes, idx, i, j, s, m);

                let v = values[idx];
                let code;
                match self.lookup(v) {
                    None => {
                        self.known_models.get_or_insert(0).encode(&mut rc, 0);
                        self.encode_plain(&mut rc, v);

                        code = self.dict.len() as u32;
                        if code < MAX_DICT_SIZE && v != HT_EMPTY_KEY {
                            self.dict.insert(v, code);
                        }

                        self.update_code_enc(ctx, code);
                    }
                    Some(c) => {
                        code = c;
                        self.known_models.get_or_insert(0).encode(&mut rc, 1);
                        self.encode_code(&mut rc, ctx, code);
                    }
                }

                codes[idx] = code;
            }
        }

        rc.finish()
    }

    fn decode_info_constant(&mut self, width: u32, coded: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let s = width as usize;
        if s == 0 || raw_len % (4 * s) != 0 {
            return Err(VarzipError::corrupt_input("constant-width payload misaligned"));
        }
        let no_rows = raw_len / (4 * s);
        let no_items = raw_len / 4;
        let m = u32::MAX;

        let mut rc = RangeDecoder::new(coded)?;

        if self.ctx_mode == 0 {
            self.ctx_mode = self.decode_ctx_type(&mut rc)?;
            if !(1..=9).contains(&self.ctx_mode) {
                return Err(VarzipError::corrupt_input("invalid context order"));
            }
        }

        let mut codes = vec![0u32; no_items];
        let mut out = Vec::with_capacity(raw_len);
        let mut ctx: u64 = 0;

        for i in 0..no_rows {
            for j in 0..s {
                let idx = i * s + j;
                ctx = constant_context(self.ctx_mode, ctx, &codes, idx, i, j, s, m);

                let code;
                let val;
                if self.known_models.get_or_insert(0).decode(&mut rc)? == 0 {
                    val = self.decode_plain(&mut rc)?;

                    code = self.dict_dec.len() as u32;
                    if code < MAX_DICT_SIZE && val != HT_EMPTY_KEY {
                        self.dict_dec.push(val);
                    }

                    self.update_code_dec(ctx, code);
                } else {
                    code = self.decode_code(&mut rc, ctx)?;
                    val = self.dict_value(code)?;
                }

                out.extend_from_slice(&val.to_le_bytes());
                codes[idx] = code;
            }
        }

        Ok(out)
    }

    // ---- FORMAT fixed width --------------------------------------------

    fn encode_format_one(&mut self, sizes: &[u32], data: &[u8]) -> Vec<u8> {
        let values = words_of(data);
        let ns = self.no_samples as usize;
        let mut rc = RangeEncoder::new();

        // Rolling three rows of codes, indexed by sample.
        let mut codes = [vec![0u64; ns], vec![0u64; ns], vec![0u64; ns]];

        let mut q = values.iter();
        for i in 0..sizes.len() {
            for j in 0..ns {
                let v = *q.next().expect("format grid shorter than its size vector");

                let code;
                match self.lookup(v) {
                    None => {
                        self.known_models.get_or_insert(0).encode(&mut rc, 0);
                        self.encode_plain(&mut rc, v);

                        code = self.dict.len() as u32;
                        if code < MAX_DICT_SIZE && v != HT_EMPTY_KEY {
                            self.dict.insert(v, code);
                        }
                    }
                    Some(c) => {
                        code = c;
                        self.known_models.get_or_insert(0).encode(&mut rc, 1);

                        let mut ctx = 0u64;
                        ctx += if i > 0 {
                            (codes[(i + 2) % 3][j] & CTX_SMALL_MASK) << 24
                        } else {
                            CTX_SMALL_MASK << 24
                        };
                        ctx += if j > 0 {
                            (codes[i % 3][j - 1] & CTX_SMALL_MASK) << 44
                        } else {
                            CTX_SMALL_MASK << 44
                        };

                        self.encode_format_code(&mut rc, ctx, code);
                    }
                }

                codes[i % 3][j] = u64::from(code);
            }
        }

        rc.finish()
    }

    fn decode_format_one(&mut self, sizes: &[u32], coded: &[u8]) -> Result<Vec<u8>> {
        let ns = self.no_samples as usize;
        let mut rc = RangeDecoder::new(coded)?;

        let mut codes = [vec![0u64; ns], vec![0u64; ns], vec![0u64; ns]];
        let mut out = Vec::with_capacity(sizes.len() * ns * 4);

        for i in 0..sizes.len() {
            for j in 0..ns {
                let code;
                let val;

                if self.known_models.get_or_insert(0).decode(&mut rc)? == 0 {
                    val = self.decode_plain(&mut rc)?;

                    code = self.dict_dec.len() as u32;
                    if code < MAX_DICT_SIZE && val != HT_EMPTY_KEY {
                        self.dict_dec.push(val);
                    }
                } else {
                    let mut ctx = 0u64;
                    ctx += if i > 0 {
                        (codes[(i + 2) % 3][j] & CTX_SMALL_MASK) << 24
                    } else {
                        CTX_SMALL_MASK << 24
                    };
                    ctx += if j > 0 {
                        (codes[i % 3][j - 1] & CTX_SMALL_MASK) << 44
                    } else {
                        CTX_SMALL_MASK << 44
                    };

                    code = self.decode_format_code(&mut rc, ctx)?;
                    val = self.dict_value(code)?;
                }

                out.extend_from_slice(&val.to_le_bytes());
                codes[i % 3][j] = u64::from(code);
            }
        }

        Ok(out)
    }

    // FORMAT-one code planes use low tag bits (the context occupies the
    // high bits).
    fn encode_format_code(&mut self, rc: &mut RangeEncoder, mut ctx: u64, code: u32) {
        let dict_size = self.dict.len() as u32;

        if dict_size > 256 * 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (3 << 20))
                .encode(rc, (code >> 24) as usize);
        }
        if dict_size > 256 * 256 {
            self.code_models
                .get_or_insert(ctx + (2 << 20))
                .encode(rc, ((code >> 16) & 0xff) as usize);
            ctx += u64::from(code & 0xf_0000);
        }
        if dict_size > 256 {
            self.code_models
                .get_or_insert(ctx + (1 << 20))
                .encode(rc, ((code >> 8) & 0xff) as usize);
            ctx += u64::from(code & 0xff00);
        }
        self.code_models
            .get_or_insert(ctx)
            .encode(rc, (code & 0xff) as usize);
    }

    fn decode_format_code(&mut self, rc: &mut RangeDecoder<'_>, mut ctx: u64) -> Result<u32> {
        let dict_size = self.dict_dec.len() as u32;
        let mut code = 0u32;

        if dict_size > 256 * 256 * 256 {
            code = (self.code_models.get_or_insert(ctx + (3 << 20)).decode(rc)? as u32) << 24;
        }
        if dict_size > 256 * 256 {
            code += (self.code_models.get_or_insert(ctx + (2 << 20)).decode(rc)? as u32) << 16;
            ctx += u64::from(code & 0xf_0000);
        }
        if dict_size > 256 {
            code += (self.code_models.get_or_insert(ctx + (1 << 20)).decode(rc)? as u32) << 8;
            ctx += u64::from(code & 0xff00);
        }
        code += self.code_models.get_or_insert(ctx).decode(rc)? as u32;

        Ok(code)
    }

    // ---- FORMAT variable width -----------------------------------------

    fn encode_format_many(&mut self, sizes: &[u32], data: &[u8]) -> Vec<u8> {
        let values = words_of(data);
        let ns = self.no_samples.max(1) as usize;
        let mut rc = RangeEncoder::new();

        let mut pos = 0usize; // index of the current entry start
        let mut prev_items = 0usize;

        for &c_size in sizes {
            let cur_items = c_size as usize / ns;

            if c_size != 0 {
                for j in 0..ns {
                    if pos >= cur_items
                        && prev_items == cur_items
                        && values[pos - cur_items..pos] == values[pos..pos + cur_items]
                    {
                        self.same_models.get_or_insert(0).encode(&mut rc, 1);
                        pos += cur_items;
                        continue;
                    }
                    if pos >= cur_items && prev_items == cur_items {
                        self.same_models.get_or_insert(0).encode(&mut rc, 0);
                    }

                    let mut ctx = 0u64;

                    for k in 0..cur_items {
                        let x = values[pos + k];

                        ctx &= 0x1fff_ffff_ffff;
                        ctx += (k as u64) << 58;
                        if k == 0 {
                            ctx += ((j as u64) & 0x1fff) << 45;
                        }

                        match self.lookup(x) {
                            None => {
                                self.known2_models.get_or_insert(0).encode(&mut rc, 0);
                                self.encode_plain(&mut rc, x);

                                let code = self.dict.len() as u32;
                                if code < MAX_DICT_SIZE && x != HT_EMPTY_KEY {
                                    self.dict.insert(x, code);
                                }

                                ctx += u64::from(code);
                                ctx <<= 15;
                            }
                            Some(code) => {
                                self.known2_models.get_or_insert(0).encode(&mut rc, 1);
                                self.encode_many_code(&mut rc, &mut ctx, code);

                                ctx += u64::from(code & 0xff);
                                ctx <<= 15;
                            }
                        }
                    }

                    pos += cur_items;
                }
            }

            prev_items = cur_items;
        }

        rc.finish()
    }

    fn decode_format_many(&mut self, sizes: &[u32], coded: &[u8]) -> Result<Vec<u8>> {
        let ns = self.no_samples.max(1) as usize;
        let mut rc = RangeDecoder::new(coded)?;

        let total: usize = sizes.iter().map(|&s| s as usize).sum();
        let mut out: Vec<u32> = Vec::with_capacity(total);

        let mut prev_items = 0usize;

        for &c_size in sizes {
            let cur_items = c_size as usize / ns;

            if c_size != 0 {
                for j in 0..ns {
                    let pos = out.len();

                    if pos >= cur_items
                        && prev_items == cur_items
                        && self.same_models.get_or_insert(0).decode(&mut rc)? == 1
                    {
                        for k in 0..cur_items {
                            let v = out[pos - cur_items + k];
                            out.push(v);
                        }
                        continue;
                    }

                    let mut ctx = 0u64;

                    for k in 0..cur_items {
                        ctx &= 0x1fff_ffff_ffff;
                        ctx += (k as u64) << 58;
                        if k == 0 {
                            ctx += ((j as u64) & 0x1fff) << 45;
                        }

                        if self.known2_models.get_or_insert(0).decode(&mut rc)? == 0 {
                            let val = self.decode_plain(&mut rc)?;

                            let code = self.dict_dec.len() as u32;
                            if code < MAX_DICT_SIZE && val != HT_EMPTY_KEY {
                                self.dict_dec.push(val);
                            }

                            out.push(val);
                            ctx += u64::from(code);
                            ctx <<= 15;
                        } else {
                            let code = self.decode_many_code(&mut rc, &mut ctx)?;
                            out.push(self.dict_value(code)?);

                            ctx += u64::from(code & 0xff);
                            ctx <<= 15;
                        }
                    }
                }
            }

            prev_items = cur_items;
        }

        let mut bytes = Vec::with_capacity(out.len() * 4);
        for v in out {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Ok(bytes)
    }

    // FORMAT-many code planes, tags in bits 61..63.
    fn encode_many_code(&mut self, rc: &mut RangeEncoder, ctx: &mut u64, code: u32) {
        let dict_size = self.dict.len() as u32;

        if dict_size > 256 * 256 * 256 {
            self.code_models
                .get_or_insert(*ctx + (4 << 61))
                .encode(rc, (code >> 24) as usize);
        }
        if dict_size > 256 * 256 {
            self.code_models
                .get_or_insert(*ctx + (3 << 61))
                .encode(rc, ((code >> 16) & 0xff) as usize);
        }
        if dict_size > 256 {
            self.code_models
                .get_or_insert(*ctx + (2 << 61))
                .encode(rc, ((code >> 8) & 0xff) as usize);
            *ctx += u64::from(code & 0x7f00);
        }
        self.code_models
            .get_or_insert(*ctx + (1 << 61))
            .encode(rc, (code & 0xff) as usize);
    }

    fn decode_many_code(&mut self, rc: &mut RangeDecoder<'_>, ctx: &mut u64) -> Result<u32> {
        let dict_size = self.dict_dec.len() as u32;
        let mut code = 0u32;

        if dict_size > 256 * 256 * 256 {
            code = (self.code_models.get_or_insert(*ctx + (4 << 61)).decode(rc)? as u32) << 24;
        }
        if dict_size > 256 * 256 {
            code += (self.code_models.get_or_insert(*ctx + (3 << 61)).decode(rc)? as u32) << 16;
        }
        if dict_size > 256 {
            code += (self.code_models.get_or_insert(*ctx + (2 << 61)).decode(rc)? as u32) << 8;
            *ctx += u64::from(code & 0x7f00);
        }
        code += self.code_models.get_or_insert(*ctx + (1 << 61)).decode(rc)? as u32;

        Ok(code)
    }

    // ---- dictionary ----------------------------------------------------

    fn lookup(&self, value: u32) -> Option<u32> {
        if value == HT_EMPTY_KEY {
            return None;
        }
        self.dict.get(&value).copied()
    }

    fn dict_value(&self, code: u32) -> Result<u32> {
        self.dict_dec
            .get(code as usize)
            .copied()
            .ok_or_else(|| VarzipError::corrupt_input("dictionary code out of range"))
    }
}

// Context assembly shared by the INFO constant encode and decode loops.
#[allow(clippy::too_many_arguments)]
fn constant_context(
    mode: u32,
    prev_ctx: u64,
    codes: &[u32],
    idx: usize,
    i: usize,
    j: usize,
    s: usize,
    m: u32,
) -> u64 {
    let left = |d: usize| -> u64 {
        if j >= d {
            u64::from(codes[idx - d]) & CTX_SMALL_MASK
        } else {
            u64::from(m) & CTX_SMALL_MASK
        }
    };
    let above = |d: usize| -> u64 {
        if i >= d {
            u64::from(codes[idx - d * s]) & CTX_SMALL_MASK
        } else {
            u64::from(m) & CTX_SMALL_MASK
        }
    };

    match mode {
        1 => 0,
        2 => left(1),
        3 => (left(2) << 20) + left(1),
        4 => above(1),
        5 => (above(2) << 20) + above(1),
        6 => (left(1) << 20) + above(1),
        7 => left(1) + ((j as u64 & CTX_SMALL_MASK) << 20),
        8 => above(1) + ((j as u64 & CTX_SMALL_MASK) << 20),
        _ => prev_ctx + (j as u64 & CTX_SMALL_MASK),
    }
}

fn determine_info_shape(sizes: &[u32]) -> (InfoShape, u32) {
    let mut values: HashSet<u32> = HashSet::new();

    for &x in sizes {
        values.insert(x);
        if values.len() > 2 {
            return (InfoShape::Any, 0);
        }
    }

    if values.len() == 1 {
        let v = *values.iter().next().unwrap();
        return match v {
            0 => (InfoShape::Zero, 0),
            1 => (InfoShape::One, 1),
            _ => (InfoShape::Constant, v),
        };
    }

    if values.contains(&0) && values.contains(&1) {
        return (InfoShape::ZeroOne, 1);
    }

    if values.contains(&0) {
        let v = *values.iter().find(|&&x| x != 0).unwrap();
        return (InfoShape::ZeroConstant, v);
    }

    (InfoShape::Any, 0)
}

fn arg_min(xs: &[f64]) -> usize {
    let mut best = 0;
    for (i, &x) in xs.iter().enumerate() {
        if x < xs[best] {
            best = i;
        }
    }
    best
}

// Cost estimate of coding the last tuple element conditioned on the leading
// elements: per context group, the zero-order entropy of the symbol counts
// plus a model-table charge, plus a charge per distinct context.
fn entropy_group_cost(counts: &[(u32, u32)]) -> f64 {
    let n = counts.len() as f64;
    let mut r = n * n.log2().max(8.0);

    let sum: f64 = counts.iter().map(|&(_, c)| f64::from(c)).sum();
    for &(_, c) in counts {
        r -= f64::from(c) * (f64::from(c) / sum).log2();
    }

    r
}

macro_rules! entropy_est_impl {
    ($name:ident, $size:expr) => {
        fn $name(vec: &mut Vec<[u32; $size]>) -> f64 {
            if vec.len() <= 1 {
                return 0.0;
            }

            vec.sort_unstable();

            let mut stats_size = 0u32;
            let mut r = 0f64;
            let mut counts: Vec<(u32, u32)> = vec![(vec[0][$size - 1], 1)];

            for q in 1..vec.len() {
                let prev = &vec[q - 1];
                let cur = &vec[q];

                if prev[..$size - 1] == cur[..$size - 1] {
                    let last = counts.last_mut().unwrap();
                    if cur[$size - 1] == last.0 {
                        last.1 += 1;
                    } else {
                        counts.push((cur[$size - 1], 1));
                    }
                } else {
                    stats_size += 1;
                    r += entropy_group_cost(&counts);
                    counts.clear();
                    counts.push((cur[$size - 1], 1));
                }
            }

            stats_size += 1;
            r += entropy_group_cost(&counts);

            r += f64::from(stats_size) * f64::from(stats_size).log2();
            r
        }
    };
}

entropy_est_impl!(entropy_est_1, 1);
entropy_est_impl!(entropy_est_2, 2);
entropy_est_impl!(entropy_est_3, 3);

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(values: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * 4);
        for &v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_info_shape_detection() {
        assert_eq!(determine_info_shape(&[0, 0, 0]).0, InfoShape::Zero);
        assert_eq!(determine_info_shape(&[1, 1]).0, InfoShape::One);
        assert_eq!(determine_info_shape(&[3, 3, 3]), (InfoShape::Constant, 3));
        assert_eq!(determine_info_shape(&[0, 1, 0, 1]).0, InfoShape::ZeroOne);
        assert_eq!(
            determine_info_shape(&[0, 2, 0, 2]),
            (InfoShape::ZeroConstant, 2)
        );
        assert_eq!(determine_info_shape(&[1, 2, 3]).0, InfoShape::Any);
    }

    fn roundtrip_info(sizes: &[u32], values: &[u32], no_samples: u32) {
        let data = bytes_of(values);

        let mut enc = FieldCodec::new(no_samples);
        let coded = enc.encode_info(sizes, &data);

        let mut dec = FieldCodec::new(no_samples);
        let decoded = dec.decode_info(sizes, &coded, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    fn roundtrip_format(sizes: &[u32], values: &[u32], no_samples: u32) {
        let data = bytes_of(values);

        let mut enc = FieldCodec::new(no_samples);
        let coded = enc.encode_format(sizes, &data);

        let mut dec = FieldCodec::new(no_samples);
        let decoded = dec.decode_format(sizes, &coded, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_info_one_repeated_values() {
        // Second and later occurrences ride the known-value path.
        roundtrip_info(&[1, 1], &[42, 42], 1);
        roundtrip_info(&[1; 200], &(0..200u32).map(|i| i % 3).collect::<Vec<_>>(), 1);
    }

    #[test]
    fn test_info_one_floats() {
        let values: Vec<u32> = (0..100).map(|i| (i as f32 * 0.25).to_bits()).collect();
        roundtrip_info(&[1; 100], &values, 1);
    }

    #[test]
    fn test_info_zero_one() {
        // Rows with zero width carry no payload words.
        let sizes = [1u32, 0, 1, 0, 1];
        roundtrip_info(&sizes, &[7, 8, 7], 1);
    }

    #[test]
    fn test_info_constant() {
        let sizes = [2u32; 50];
        let values: Vec<u32> = (0..100).map(|i| (i % 2) * 1000 + i / 20).collect();
        roundtrip_info(&sizes, &values, 1);
    }

    #[test]
    fn test_info_zero_constant() {
        let sizes = [3u32, 0, 3, 3, 0, 3];
        let values: Vec<u32> = (0..12).map(|i| i % 4).collect();
        roundtrip_info(&sizes, &values, 1);
    }

    #[test]
    fn test_info_any() {
        let sizes = [1u32, 2, 3, 1, 2];
        let values: Vec<u32> = (0..9).collect();
        roundtrip_info(&sizes, &values, 1);
    }

    #[test]
    fn test_info_sentinel_value_plain_path() {
        // The hash-sentinel value must code through the plain path every
        // time and still round-trip.
        roundtrip_info(&[1; 4], &[HT_EMPTY_KEY, HT_EMPTY_KEY, 5, HT_EMPTY_KEY], 1);
    }

    #[test]
    fn test_format_one() {
        let ns = 4u32;
        let sizes = [ns; 30];
        let values: Vec<u32> = (0..120).map(|i| (i % 7) * 10).collect();
        roundtrip_format(&sizes, &values, ns);
    }

    #[test]
    fn test_format_many_identical_entries() {
        // Two items per sample, most entries identical to the previous one:
        // exercises the "same" bit.
        let ns = 3u32;
        let sizes = [6u32; 20];
        let mut values = Vec::new();
        for _ in 0..20 * 3 {
            values.extend_from_slice(&[11, 22]);
        }
        roundtrip_format(&sizes, &values, ns);
    }

    #[test]
    fn test_format_many_varying_widths() {
        let ns = 2u32;
        let sizes = [2u32, 4, 2, 6, 0, 2];
        let total: u32 = sizes.iter().sum();
        let values: Vec<u32> = (0..total).map(|i| i * 3 % 11).collect();
        roundtrip_format(&sizes, &values, ns);
    }

    #[test]
    fn test_multi_part_state_carries_over() {
        // The dictionary persists across parts: the second part must decode
        // against the dictionary built by the first.
        let ns = 1u32;
        let sizes = [1u32; 50];
        let part1: Vec<u32> = (0..50).map(|i| i % 10).collect();
        let part2: Vec<u32> = (0..50).map(|i| (i + 5) % 10).collect();

        let mut enc = FieldCodec::new(ns);
        let c1 = enc.encode_info(&sizes, &bytes_of(&part1));
        let c2 = enc.encode_info(&sizes, &bytes_of(&part2));

        let mut dec = FieldCodec::new(ns);
        assert_eq!(dec.decode_info(&sizes, &c1, 200).unwrap(), bytes_of(&part1));
        assert_eq!(dec.decode_info(&sizes, &c2, 200).unwrap(), bytes_of(&part2));
    }

    #[test]
    fn test_corrupt_code_rejected() {
        let mut enc = FieldCodec::new(1);
        let coded = enc.encode_info(&[1; 10], &bytes_of(&[1, 2, 3, 1, 2, 3, 1, 2, 3, 1]));

        let mut dec = FieldCodec::new(1);
        // Claim a longer payload than was coded; decoding past the end must
        // fail instead of fabricating values.
        assert!(dec.decode_info(&[1; 30], &coded, 120).is_err());
    }
}
