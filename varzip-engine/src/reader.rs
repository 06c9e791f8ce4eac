//! Decompressing archive reader.
//!
//! On open the reader loads the parameter block, the meta/header/samples
//! blocks, and the dedup node/edge lists, then starts a worker pool fed by
//! a queue of column ids. Each worker fetches the column's next part,
//! decodes it with the column's codec, and parks the result in the column's
//! slot; [`VariantReader::next_record`] pulls cells column by column,
//! re-queueing a column id whenever its buffer drains. A column id is only
//! re-queued after its previous part was consumed, so parts of one column
//! decode strictly in order while different columns decode in parallel.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use varzip_archive::Archive;
use varzip_blockcoder::BlockCoder;
use varzip_core::error::{Result, VarzipError};
use varzip_core::varint;

use crate::buffer::{ColumnBuffer, FunctionMap};
use crate::config::{Config, DESC_STREAM_DATA, DESC_STREAM_SIZE, NO_DESC_FIELDS, PP_COMPRESS_FLAG};
use crate::optimize;
use crate::queue::RegisteringQueue;
use crate::record::{Cell, KeyDesc, KeyKind, Record, ValueType, VariantDesc};
use crate::writer::{ColumnCodec, make_codec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnId {
    Key(usize),
    Desc(usize),
}

#[derive(Debug)]
enum DecodedPart {
    Data { sizes: Vec<u32>, data: Vec<u8> },
    Function(FunctionMap),
}

#[derive(Debug)]
struct ReadShared {
    archive: Arc<Archive>,
    config: Config,
    keys: Vec<KeyDesc>,
    no_samples: u32,

    codecs: Vec<Mutex<ColumnCodec>>,
    // Columns stored as a function of another column.
    func_cols: Vec<bool>,

    slots: Mutex<Vec<Option<DecodedPart>>>,
    slots_cv: Condvar,
    error: Mutex<Option<VarzipError>>,
}

impl ReadShared {
    fn set_error(&self, e: VarzipError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
        // Wake the consumer so it can observe the failure.
        self.slots_cv.notify_all();
    }

    fn park(&self, slot: usize, part: DecodedPart) {
        let mut slots = self.slots.lock().unwrap();
        slots[slot] = Some(part);
        self.slots_cv.notify_all();
    }

    fn decode_column(&self, id: ColumnId) -> Result<DecodedPart> {
        match id {
            ColumnId::Desc(f) => self.decode_desc(f),
            ColumnId::Key(i) => {
                if self.func_cols[i] {
                    let map =
                        optimize::load_function(&self.archive, &format!("func_{i}_data"))?;
                    return Ok(DecodedPart::Function(map));
                }
                self.decode_key(i)
            }
        }
    }

    fn decode_sizes(&self, compressed: &[u8], count: u64) -> Result<Vec<u32>> {
        let bc = BlockCoder::new(self.config.block_params_sizes());
        let bytes = bc.decompress(compressed)?;

        if bytes.len() != count as usize * 4 {
            return Err(VarzipError::corrupt_input(
                "size vector does not match its declared length",
            ));
        }

        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn decode_desc(&self, f: usize) -> Result<DecodedPart> {
        let sid_size = self.archive.require_stream(DESC_STREAM_SIZE[f])?;
        let sid_data = self.archive.require_stream(DESC_STREAM_DATA[f])?;

        let Some((compressed, count)) = self.archive.get_part(sid_size)? else {
            return Ok(DecodedPart::Data {
                sizes: Vec::new(),
                data: Vec::new(),
            });
        };
        let sizes = self.decode_sizes(&compressed, count)?;

        let (compressed, raw) = self
            .archive
            .get_part(sid_data)?
            .ok_or_else(|| VarzipError::corrupt_archive("size part without a data part"))?;

        let data = if raw == 0 {
            Vec::new()
        } else {
            let bc = BlockCoder::new(self.config.block_params_data());
            let data = bc.decompress(&compressed)?;
            if data.len() != raw as usize {
                return Err(VarzipError::corrupt_input("data part length mismatch"));
            }
            data
        };

        // The position field packs the byte count into the size entry; the
        // text fields count raw bytes.
        let expected: u64 = if f == 1 {
            sizes.iter().map(|&s| u64::from(s >> 1)).sum()
        } else {
            sizes.iter().map(|&s| u64::from(s)).sum()
        };
        if data.len() as u64 != expected {
            return Err(VarzipError::corrupt_input(
                "description payload does not match its size vector",
            ));
        }

        Ok(DecodedPart::Data { sizes, data })
    }

    fn decode_key(&self, i: usize) -> Result<DecodedPart> {
        let sid_size = self.archive.require_stream(&format!("key_{i}_size"))?;
        let sid_data = self.archive.require_stream(&format!("key_{i}_data"))?;

        let Some((compressed, count)) = self.archive.get_part(sid_size)? else {
            return Ok(DecodedPart::Data {
                sizes: Vec::new(),
                data: Vec::new(),
            });
        };
        let mut sizes = self.decode_sizes(&compressed, count)?;

        let (data_compressed, mut raw) = self
            .archive
            .get_part(sid_data)?
            .ok_or_else(|| VarzipError::corrupt_archive("size part without a data part"))?;

        let mut codec = self.codecs[i].lock().unwrap();
        let data = match &mut *codec {
            ColumnCodec::Genotype(gc) => {
                let data = gc.decode(&sizes, &data_compressed, raw)?;
                for s in sizes.iter_mut() {
                    *s *= self.no_samples;
                }
                data
            }
            ColumnCodec::Format(fc) => {
                let data = fc.decode_format(&sizes, &data_compressed, raw as usize)?;
                if data.len() != raw as usize {
                    return Err(VarzipError::corrupt_input("data part length mismatch"));
                }
                data
            }
            ColumnCodec::Info(fc) => {
                let data = fc.decode_info(&sizes, &data_compressed, raw as usize)?;
                if data.len() != raw as usize {
                    return Err(VarzipError::corrupt_input("data part length mismatch"));
                }
                data
            }
            ColumnCodec::Generic(text_pp) => {
                let preprocessed = raw >= PP_COMPRESS_FLAG;
                if preprocessed {
                    raw -= PP_COMPRESS_FLAG;
                }

                if raw == 0 {
                    Vec::new()
                } else {
                    let bc = BlockCoder::new(self.config.block_params_data());
                    let data = bc.decompress(&data_compressed)?;
                    if data.len() != raw as usize {
                        return Err(VarzipError::corrupt_input("data part length mismatch"));
                    }

                    if preprocessed {
                        text_pp.decode(&data)?
                    } else {
                        data
                    }
                }
            }
        };

        // Cross-check the payload against the size vector so later cell
        // reads cannot run past the buffer.
        let expected: u64 = match self.keys[i].value_type {
            ValueType::Flag => 0,
            ValueType::Str => sizes.iter().map(|&s| u64::from(s)).sum(),
            ValueType::Int | ValueType::Real => {
                4 * sizes.iter().map(|&s| u64::from(s)).sum::<u64>()
            }
        };
        if data.len() as u64 != expected {
            return Err(VarzipError::corrupt_input(
                "column payload does not match its size vector",
            ));
        }

        Ok(DecodedPart::Data { sizes, data })
    }
}

fn read_worker_loop(shared: &ReadShared, queue: &RegisteringQueue<ColumnId>) {
    while let Some(id) = queue.pop() {
        let slot = match id {
            ColumnId::Key(i) => i,
            ColumnId::Desc(f) => shared.keys.len() + f,
        };

        match shared.decode_column(id) {
            Ok(part) => shared.park(slot, part),
            Err(e) => {
                shared.set_error(e);
                // Park an empty part so the consumer wakes and sees the
                // error instead of waiting forever.
                shared.park(
                    slot,
                    DecodedPart::Data {
                        sizes: Vec::new(),
                        data: Vec::new(),
                    },
                );
            }
        }
    }
}

/// Decompressing half of the engine.
#[derive(Debug)]
pub struct VariantReader {
    shared: Arc<ReadShared>,
    prep_queue: Arc<RegisteringQueue<ColumnId>>,
    workers: Vec<JoinHandle<()>>,

    bufs: Vec<ColumnBuffer>,
    desc_bufs: Vec<ColumnBuffer>,

    keys: Vec<KeyDesc>,
    gt_key: Option<usize>,
    no_variants: u64,
    no_samples: u32,
    ploidy: u8,
    neglect_limit: u32,
    meta: String,
    header: String,
    samples: Vec<String>,

    data_nodes: Vec<(i32, bool)>,
    data_edges: Vec<usize>, // target column -> source column
    size_nodes: Vec<(i32, bool)>,

    i_variant: u64,
    prev_pos: i64,
    closed: bool,
}

impl VariantReader {
    /// Open an archive and start the decode workers.
    pub fn open(path: impl AsRef<std::path::Path>, mut config: Config) -> Result<Self> {
        let archive = Arc::new(Archive::open(path)?);

        // Parameter block.
        let sid = archive.require_stream("db_params")?;
        let (params, _) = archive
            .get_part(sid)?
            .ok_or_else(|| VarzipError::corrupt_archive("empty parameter stream"))?;

        let mut pos = 0usize;
        let no_variants = varint::get_counter(&params, &mut pos)?;
        let no_samples = varint::get_counter(&params, &mut pos)? as u32;
        let ploidy = varint::get_fixed(&params, &mut pos, 1)? as u8;
        let neglect_limit = varint::get_counter(&params, &mut pos)? as u32;
        let no_keys = varint::get_counter(&params, &mut pos)? as usize;
        let gt_key_id = varint::get_int(&params, &mut pos)?;

        let mut keys = Vec::with_capacity(no_keys);
        for _ in 0..no_keys {
            let key_id = varint::get_counter(&params, &mut pos)? as u32;
            let kind = KeyKind::from_u8(varint::get_fixed(&params, &mut pos, 1)? as u8)?;
            let value_type = ValueType::from_u8(varint::get_fixed(&params, &mut pos, 1)? as u8)?;
            keys.push(KeyDesc {
                key_id,
                kind,
                value_type,
            });
        }

        let gt_key = if gt_key_id >= 0 && (gt_key_id as usize) < no_keys {
            Some(gt_key_id as usize)
        } else {
            None
        };

        config.neglect_limit = neglect_limit;

        // Meta / header / samples blocks.
        let bc = BlockCoder::new(config.block_params_meta());
        let mut blocks = Vec::with_capacity(3);
        for name in ["db_meta", "db_header", "db_samples"] {
            let sid = archive.require_stream(name)?;
            let (compressed, _) = archive.get_part(sid)?.unwrap_or_default();
            blocks.push(if compressed.is_empty() {
                Vec::new()
            } else {
                bc.decompress(&compressed)?
            });
        }

        let mut pos = 0usize;
        let meta = varint::get_str(&blocks[0], &mut pos).unwrap_or_default();
        let mut pos = 0usize;
        let header = varint::get_str(&blocks[1], &mut pos).unwrap_or_default();

        let mut samples = Vec::with_capacity(no_samples as usize);
        let mut pos = 0usize;
        for _ in 0..no_samples {
            if pos < blocks[2].len() {
                samples.push(varint::get_str(&blocks[2], &mut pos)?);
            } else {
                samples.push(String::new());
            }
        }

        // Dedup node/edge lists.
        let size_nodes = optimize::load_nodes(&archive, "size_nodes", no_keys)?;
        let _size_edges = optimize::load_edges(&archive, "size_edges", no_keys)?;
        let data_nodes = optimize::load_nodes(&archive, "data_nodes", no_keys)?;
        let data_edge_list = optimize::load_edges(&archive, "data_edges", no_keys)?;

        if data_nodes.len() != no_keys
            || data_nodes
                .iter()
                .any(|&(id, _)| id < 0 || id as usize >= no_keys)
        {
            return Err(VarzipError::corrupt_archive(
                "dedup node list does not cover the key table",
            ));
        }

        let mut data_edges = vec![usize::MAX; no_keys];
        for &(from, to) in &data_edge_list {
            if from < 0 || to < 0 || from as usize >= no_keys || to as usize >= no_keys {
                return Err(VarzipError::corrupt_archive("dedup edge outside the key table"));
            }
            data_edges[to as usize] = from as usize;
        }

        let func_cols: Vec<bool> = (0..no_keys)
            .map(|i| archive.stream_id(&format!("func_{i}_data")).is_some())
            .collect();

        if func_cols
            .iter()
            .enumerate()
            .any(|(i, &f)| f && data_edges[i] == usize::MAX)
        {
            return Err(VarzipError::corrupt_archive(
                "function stream without a source edge",
            ));
        }

        let codecs = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                Mutex::new(make_codec(
                    key,
                    gt_key == Some(i),
                    no_samples,
                    u32::from(ploidy),
                    neglect_limit,
                ))
            })
            .collect();

        let shared = Arc::new(ReadShared {
            archive,
            config,
            keys: keys.clone(),
            no_samples,
            codecs,
            func_cols,
            slots: Mutex::new((0..no_keys + NO_DESC_FIELDS).map(|_| None).collect()),
            slots_cv: Condvar::new(),
            error: Mutex::new(None),
        });

        let prep_queue = Arc::new(RegisteringQueue::new(1));
        for i in 0..no_keys {
            prep_queue.push(ColumnId::Key(i));
        }
        for f in 0..NO_DESC_FIELDS {
            prep_queue.push(ColumnId::Desc(f));
        }

        let workers = (0..config.no_worker_threads())
            .map(|_| {
                let shared = Arc::clone(&shared);
                let queue = Arc::clone(&prep_queue);
                std::thread::spawn(move || read_worker_loop(&shared, &queue))
            })
            .collect();

        Ok(Self {
            shared,
            prep_queue,
            workers,
            bufs: (0..no_keys).map(|_| ColumnBuffer::default()).collect(),
            desc_bufs: (0..NO_DESC_FIELDS).map(|_| ColumnBuffer::default()).collect(),
            keys,
            gt_key,
            no_variants,
            no_samples,
            ploidy,
            neglect_limit,
            meta,
            header,
            samples,
            data_nodes,
            data_edges,
            size_nodes,
            i_variant: 0,
            prev_pos: 0,
            closed: false,
        })
    }

    /// Declared number of records.
    pub fn no_variants(&self) -> u64 {
        self.no_variants
    }

    /// Pipeline batch size from the configuration.
    pub fn config_records_per_cycle(&self) -> usize {
        self.shared.config.records_per_cycle
    }

    /// Number of samples.
    pub fn no_samples(&self) -> u32 {
        self.no_samples
    }

    /// Declared ploidy.
    pub fn ploidy(&self) -> u8 {
        self.ploidy
    }

    /// Neglect limit the archive was written with.
    pub fn neglect_limit(&self) -> u32 {
        self.neglect_limit
    }

    /// The key table.
    pub fn keys(&self) -> &[KeyDesc] {
        &self.keys
    }

    /// Index of the genotype key, if any.
    pub fn gt_key(&self) -> Option<usize> {
        self.gt_key
    }

    /// Free-form metadata.
    pub fn meta(&self) -> &str {
        &self.meta
    }

    /// Verbatim source header.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Ordered sample names.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// The stored size-stream dedup nodes (exposed for inspection).
    pub fn size_nodes(&self) -> &[(i32, bool)] {
        &self.size_nodes
    }

    fn take_slot(&self, slot: usize) -> Result<DecodedPart> {
        let mut slots = self.shared.slots.lock().unwrap();
        loop {
            if let Some(e) = self.shared.error.lock().unwrap().take() {
                return Err(e);
            }
            if let Some(part) = slots[slot].take() {
                return Ok(part);
            }
            slots = self.shared.slots_cv.wait(slots).unwrap();
        }
    }

    /// Decode the next record; `None` past the declared record count.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.i_variant >= self.no_variants {
            return Ok(None);
        }

        for f in 0..NO_DESC_FIELDS {
            if self.desc_bufs[f].is_empty() {
                let part = self.take_slot(self.keys.len() + f)?;
                let DecodedPart::Data { sizes, data } = part else {
                    return Err(VarzipError::corrupt_archive(
                        "description field stored as a function",
                    ));
                };
                self.desc_bufs[f].load(sizes, data);
                self.prep_queue.push(ColumnId::Desc(f));
            }
        }

        let mut desc = VariantDesc::default();

        let (chrom, _) = self.desc_bufs[0].read_text();
        desc.chrom = String::from_utf8_lossy(&chrom).into_owned();
        let (id, _) = self.desc_bufs[2].read_text();
        desc.id = String::from_utf8_lossy(&id).into_owned();
        let (ref_allele, _) = self.desc_bufs[3].read_text();
        desc.ref_allele = String::from_utf8_lossy(&ref_allele).into_owned();
        let (alt, _) = self.desc_bufs[4].read_text();
        desc.alt = String::from_utf8_lossy(&alt).into_owned();
        let (qual, _) = self.desc_bufs[5].read_text();
        desc.qual = String::from_utf8_lossy(&qual).into_owned();

        desc.pos = self.desc_bufs[1].read_int64() + self.prev_pos;
        self.prev_pos = desc.pos;

        let mut cells = vec![Cell::default(); self.keys.len()];

        for idx in 0..self.keys.len() {
            let ii = self.data_nodes[idx].0 as usize;

            if self.bufs[ii].is_empty() {
                match self.take_slot(ii)? {
                    DecodedPart::Data { sizes, data } => {
                        self.bufs[ii].load(sizes, data);
                        self.prep_queue.push(ColumnId::Key(ii));
                    }
                    DecodedPart::Function(map) => {
                        // A function buffer serves every remaining record;
                        // the column id is not re-queued.
                        self.bufs[ii].load_function(map);
                    }
                }
            }

            match self.keys[ii].value_type {
                ValueType::Int | ValueType::Real => {
                    let (data, count) = if self.shared.func_cols[ii] {
                        let src = self.data_edges[ii];
                        self.bufs[ii].apply_function(&cells[src].data, cells[src].count)
                    } else {
                        self.bufs[ii].read_values()
                    };

                    cells[ii] = Cell {
                        present: count != 0,
                        data,
                        count,
                    };
                }
                ValueType::Str => {
                    let (data, count) = self.bufs[ii].read_text();
                    cells[ii] = Cell {
                        present: count != 0,
                        data,
                        count,
                    };
                }
                ValueType::Flag => {
                    let present = self.bufs[ii].read_flag();
                    cells[ii] = Cell::flag(present);
                }
            }
        }

        self.i_variant += 1;
        Ok(Some((desc, cells)))
    }

    /// Stop the workers and release the archive.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.prep_queue.mark_completed();
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for VariantReader {
    fn drop(&mut self) {
        self.close();
    }
}
