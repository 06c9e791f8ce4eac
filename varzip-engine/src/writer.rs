//! Compressing archive writer.
//!
//! The writer owns one [`ColumnBuffer`] per declared key plus six for the
//! record description fields. [`VariantWriter::add_record`] routes cells
//! into the buffers; a full buffer is packaged together with pre-reserved
//! part slots and queued for the worker pool. Workers pick the codec by
//! column kind, block until their part id is next for the column (so parts
//! commit in deterministic order), compress, and append to the archive.
//!
//! Per column at most [`Config::max_inflight_parts`] packages are in flight;
//! the enqueueing side blocks on the cap, bounding peak memory.
//!
//! [`VariantWriter::finish`] flushes every buffer, drains the pool, writes
//! the parameter and header streams, closes the archive, and runs the
//! stream-deduplication rewrite.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use varzip_archive::Archive;
use varzip_blockcoder::BlockCoder;
use varzip_codecs::{FieldCodec, GenotypeCodec, TextPreproc};
use varzip_core::error::{Result, VarzipError};
use varzip_core::varint;

use crate::buffer::ColumnBuffer;
use crate::config::{Config, DESC_STREAM_DATA, DESC_STREAM_SIZE, NO_DESC_FIELDS, PP_COMPRESS_FLAG};
use crate::optimize;
use crate::queue::RegisteringQueue;
use crate::record::{Cell, KeyDesc, KeyKind, ValueType, VariantDesc};

/// Per-column codec state, locked by the worker that holds the column's
/// part-order turn.
#[derive(Debug)]
pub(crate) enum ColumnCodec {
    /// Block coder with optional text preprocessing.
    Generic(TextPreproc),
    /// INFO dictionary codec.
    Info(FieldCodec),
    /// FORMAT dictionary codec.
    Format(FieldCodec),
    /// Genotype codec.
    Genotype(GenotypeCodec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageKind {
    Field,
    Genotype,
    Desc,
}

#[derive(Debug)]
struct Package {
    kind: PackageKind,
    // Order-gate slot: key index, or no_keys + description-field index.
    slot: usize,
    stream_size: usize,
    stream_data: usize,
    part_id: usize,
    sizes: Vec<u32>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Shared {
    archive: Arc<Archive>,
    config: Config,
    keys: Vec<KeyDesc>,
    gt_key: Option<usize>,

    codecs: Vec<Mutex<ColumnCodec>>,

    // Expected next part id per slot.
    order: Mutex<Vec<usize>>,
    order_cv: Condvar,

    // Queued-but-unfinished package count per slot.
    inflight: Mutex<Vec<u32>>,
    inflight_cv: Condvar,

    error: Mutex<Option<VarzipError>>,
}

impl Shared {
    fn is_next(&self, pck: &Package) -> bool {
        self.order.lock().unwrap()[pck.slot] == pck.part_id
    }

    fn wait_turn(&self, slot: usize, part_id: usize) {
        let mut order = self.order.lock().unwrap();
        while order[slot] != part_id {
            order = self.order_cv.wait(order).unwrap();
        }
    }

    fn advance(&self, slot: usize) {
        let mut order = self.order.lock().unwrap();
        order[slot] += 1;
        self.order_cv.notify_all();
    }

    fn set_error(&self, e: VarzipError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn has_error(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    fn compress_package(&self, pck: &mut Package) -> Result<()> {
        match pck.kind {
            PackageKind::Desc => self.compress_desc(pck),
            PackageKind::Field => self.compress_field(pck),
            PackageKind::Genotype => self.compress_genotype(pck),
        }
    }

    fn compress_desc(&self, pck: &Package) -> Result<()> {
        let bc_sizes = BlockCoder::new(self.config.block_params_sizes());
        let bc_data = BlockCoder::new(self.config.block_params_data());

        let compressed = bc_sizes.compress(&size_bytes(&pck.sizes));
        self.archive.add_part_complete(
            pck.stream_size,
            pck.part_id,
            &compressed,
            pck.sizes.len() as u64,
        )?;

        if pck.data.is_empty() {
            self.archive
                .add_part_complete(pck.stream_data, pck.part_id, &[], 0)?;
        } else {
            let compressed = bc_data.compress(&pck.data);
            self.archive.add_part_complete(
                pck.stream_data,
                pck.part_id,
                &compressed,
                pck.data.len() as u64,
            )?;
        }

        self.archive.add_raw_size(pck.stream_data, pck.data.len() as u64);
        Ok(())
    }

    fn compress_field(&self, pck: &Package) -> Result<()> {
        let key = self.keys[pck.slot];
        let mut codec = self.codecs[pck.slot].lock().unwrap();

        match &mut *codec {
            ColumnCodec::Format(fc) => {
                let coded = fc.encode_format(&pck.sizes, &pck.data);
                self.archive.add_part_complete(
                    pck.stream_data,
                    pck.part_id,
                    &coded,
                    pck.data.len() as u64,
                )?;
            }
            ColumnCodec::Info(fc) => {
                let coded = fc.encode_info(&pck.sizes, &pck.data);
                self.archive.add_part_complete(
                    pck.stream_data,
                    pck.part_id,
                    &coded,
                    pck.data.len() as u64,
                )?;
            }
            ColumnCodec::Generic(text_pp) => {
                let bc_data = BlockCoder::new(self.config.block_params_data());

                if pck.data.is_empty() {
                    self.archive
                        .add_part_complete(pck.stream_data, pck.part_id, &[], 0)?;
                } else if key.value_type == ValueType::Str
                    && 64 * pck.sizes.len() < pck.data.len()
                {
                    let preprocessed = text_pp.encode(&pck.data);
                    let compressed = bc_data.compress(&preprocessed);
                    self.archive.add_part_complete(
                        pck.stream_data,
                        pck.part_id,
                        &compressed,
                        preprocessed.len() as u64 + PP_COMPRESS_FLAG,
                    )?;
                } else {
                    let compressed = bc_data.compress(&pck.data);
                    self.archive.add_part_complete(
                        pck.stream_data,
                        pck.part_id,
                        &compressed,
                        pck.data.len() as u64,
                    )?;
                }
            }
            ColumnCodec::Genotype(_) => {
                return Err(VarzipError::protocol("genotype package routed as field"));
            }
        }

        let bc_sizes = BlockCoder::new(self.config.block_params_sizes());
        let compressed = bc_sizes.compress(&size_bytes(&pck.sizes));
        self.archive.add_part_complete(
            pck.stream_size,
            pck.part_id,
            &compressed,
            pck.sizes.len() as u64,
        )?;

        self.archive.add_raw_size(pck.stream_data, pck.data.len() as u64);
        Ok(())
    }

    fn compress_genotype(&self, pck: &mut Package) -> Result<()> {
        let mut codec = self.codecs[pck.slot].lock().unwrap();
        let ColumnCodec::Genotype(gc) = &mut *codec else {
            return Err(VarzipError::protocol("field package routed as genotype"));
        };

        let (coded, raw_size) = gc.encode(&mut pck.sizes, &pck.data);

        let bc_sizes = BlockCoder::new(self.config.block_params_sizes());
        let compressed = bc_sizes.compress(&size_bytes(&pck.sizes));
        self.archive.add_part_complete(
            pck.stream_size,
            pck.part_id,
            &compressed,
            pck.sizes.len() as u64,
        )?;

        self.archive
            .add_part_complete(pck.stream_data, pck.part_id, &coded, raw_size)?;

        self.archive.add_raw_size(pck.stream_data, pck.data.len() as u64);
        Ok(())
    }
}

fn size_bytes(sizes: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sizes.len() * 4);
    for &s in sizes {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

fn worker_loop(shared: &Shared, queue: &RegisteringQueue<Package>) {
    while let Some(mut pck) = queue.pop_with_hint(|p| shared.is_next(p)) {
        {
            let mut inflight = shared.inflight.lock().unwrap();
            inflight[pck.slot] -= 1;
            shared.inflight_cv.notify_all();
        }

        shared.wait_turn(pck.slot, pck.part_id);

        if shared.has_error() {
            // A failed archive is discarded wholesale; just keep the part
            // order moving so nobody deadlocks.
            shared.advance(pck.slot);
            continue;
        }

        let result = shared.compress_package(&mut pck);
        shared.advance(pck.slot);

        if let Err(e) = result {
            shared.set_error(e);
        }
    }
}

/// Compressing half of the engine.
#[derive(Debug)]
pub struct VariantWriter {
    shared: Arc<Shared>,
    queue: Arc<RegisteringQueue<Package>>,
    workers: Vec<JoinHandle<()>>,

    bufs: Vec<ColumnBuffer>,
    desc_bufs: Vec<ColumnBuffer>,

    stream_size: Vec<usize>,
    stream_data: Vec<usize>,
    desc_size: Vec<usize>,
    desc_data: Vec<usize>,

    no_samples: u32,
    ploidy: u32,

    meta: String,
    header: String,
    samples: Vec<String>,

    no_variants: u64,
    prev_pos: i64,
    finished: bool,
}

impl VariantWriter {
    /// Create an archive at `path` for the given key table. `gt_key` is the
    /// index (into `keys`) of the genotype column, if one exists.
    pub fn create(
        path: impl AsRef<std::path::Path>,
        config: Config,
        keys: Vec<KeyDesc>,
        gt_key: Option<usize>,
        no_samples: u32,
        ploidy: u32,
    ) -> Result<Self> {
        let archive = Arc::new(Archive::create(path)?);
        let no_keys = keys.len();

        let mut stream_size = Vec::with_capacity(no_keys);
        let mut stream_data = Vec::with_capacity(no_keys);
        for i in 0..no_keys {
            stream_size.push(archive.register_stream(&format!("key_{i}_size"))?);
        }
        for i in 0..no_keys {
            stream_data.push(archive.register_stream(&format!("key_{i}_data"))?);
        }

        let mut desc_size = Vec::with_capacity(NO_DESC_FIELDS);
        let mut desc_data = Vec::with_capacity(NO_DESC_FIELDS);
        for name in DESC_STREAM_SIZE {
            desc_size.push(archive.register_stream(name)?);
        }
        for name in DESC_STREAM_DATA {
            desc_data.push(archive.register_stream(name)?);
        }

        let codecs = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                Mutex::new(make_codec(
                    key,
                    gt_key == Some(i),
                    no_samples,
                    ploidy,
                    config.neglect_limit,
                ))
            })
            .collect();

        let shared = Arc::new(Shared {
            archive,
            config,
            keys,
            gt_key,
            codecs,
            order: Mutex::new(vec![0; no_keys + NO_DESC_FIELDS]),
            order_cv: Condvar::new(),
            inflight: Mutex::new(vec![0; no_keys + NO_DESC_FIELDS]),
            inflight_cv: Condvar::new(),
            error: Mutex::new(None),
        });

        let queue = Arc::new(RegisteringQueue::new(1));

        let workers = (0..config.no_worker_threads())
            .map(|_| {
                let shared = Arc::clone(&shared);
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || worker_loop(&shared, &queue))
            })
            .collect();

        let bufs = (0..no_keys)
            .map(|i| {
                ColumnBuffer::with_max_size(if gt_key == Some(i) {
                    config.max_buffer_gt_size
                } else {
                    config.max_buffer_size
                })
            })
            .collect();
        let desc_bufs = (0..NO_DESC_FIELDS)
            .map(|_| ColumnBuffer::with_max_size(config.max_buffer_desc_size))
            .collect();

        Ok(Self {
            shared,
            queue,
            workers,
            bufs,
            desc_bufs,
            stream_size,
            stream_data,
            desc_size,
            desc_data,
            no_samples,
            ploidy,
            meta: String::new(),
            header: String::new(),
            samples: Vec::new(),
            no_variants: 0,
            prev_pos: 0,
            finished: false,
        })
    }

    /// Free-form metadata stored alongside the records.
    pub fn set_meta(&mut self, meta: impl Into<String>) {
        self.meta = meta.into();
    }

    /// Verbatim header text of the source file.
    pub fn set_header(&mut self, header: impl Into<String>) {
        self.header = header.into();
    }

    /// Ordered sample names.
    pub fn set_samples(&mut self, samples: Vec<String>) {
        self.samples = samples;
    }

    /// Number of records added so far.
    pub fn no_variants(&self) -> u64 {
        self.no_variants
    }

    /// Number of declared keys.
    pub fn no_keys(&self) -> usize {
        self.shared.keys.len()
    }

    /// Pipeline batch size from the configuration.
    pub fn config_records_per_cycle(&self) -> usize {
        self.shared.config.records_per_cycle
    }

    fn check_error(&self) -> Result<()> {
        if let Some(e) = self.shared.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(())
    }

    /// Append one record.
    pub fn add_record(&mut self, desc: &VariantDesc, cells: &[Cell]) -> Result<()> {
        if self.finished {
            return Err(VarzipError::protocol("add_record after finish"));
        }
        self.check_error()?;

        const CHROM: usize = 0;
        const POS: usize = 1;
        const ID: usize = 2;
        const REF: usize = 3;
        const ALT: usize = 4;
        const QUAL: usize = 5;

        self.desc_bufs[CHROM].write_text(desc.chrom.as_bytes(), desc.chrom.len() as u32);
        self.desc_bufs[POS].write_int64(desc.pos - self.prev_pos);
        self.desc_bufs[ID].write_text(desc.id.as_bytes(), desc.id.len() as u32);
        self.desc_bufs[REF].write_text(desc.ref_allele.as_bytes(), desc.ref_allele.len() as u32);
        self.desc_bufs[ALT].write_text(desc.alt.as_bytes(), desc.alt.len() as u32);
        self.desc_bufs[QUAL].write_text(desc.qual.as_bytes(), desc.qual.len() as u32);
        self.prev_pos = desc.pos;

        for f in 0..NO_DESC_FIELDS {
            if self.desc_bufs[f].is_full() {
                self.flush_desc(f)?;
            }
        }

        for i in 0..self.shared.keys.len() {
            let cell = &cells[i];
            match self.shared.keys[i].value_type {
                ValueType::Int | ValueType::Real => {
                    let count = if cell.present { cell.count } else { 0 };
                    self.bufs[i].write_values(&cell.data, count);
                }
                ValueType::Str => {
                    let count = if cell.present { cell.count } else { 0 };
                    self.bufs[i].write_text(&cell.data, count);
                }
                ValueType::Flag => {
                    self.bufs[i].write_flag(cell.present);
                }
            }

            if self.bufs[i].is_full() {
                self.flush_key(i)?;
            }
        }

        self.no_variants += 1;
        Ok(())
    }

    fn enqueue(&self, pck: Package) {
        let mut inflight = self.shared.inflight.lock().unwrap();
        while inflight[pck.slot] >= self.shared.config.max_inflight_parts {
            inflight = self.shared.inflight_cv.wait(inflight).unwrap();
        }
        inflight[pck.slot] += 1;
        drop(inflight);

        self.queue.push(pck);
    }

    fn flush_key(&mut self, i: usize) -> Result<()> {
        let part_id = self.shared.archive.add_part_prepare(self.stream_size[i])?;
        self.shared.archive.add_part_prepare(self.stream_data[i])?;

        let (sizes, data) = self.bufs[i].take();
        let kind = if self.shared.gt_key == Some(i) {
            PackageKind::Genotype
        } else {
            PackageKind::Field
        };

        self.enqueue(Package {
            kind,
            slot: i,
            stream_size: self.stream_size[i],
            stream_data: self.stream_data[i],
            part_id,
            sizes,
            data,
        });
        Ok(())
    }

    fn flush_desc(&mut self, f: usize) -> Result<()> {
        let part_id = self.shared.archive.add_part_prepare(self.desc_size[f])?;
        self.shared.archive.add_part_prepare(self.desc_data[f])?;

        let (sizes, data) = self.desc_bufs[f].take();

        self.enqueue(Package {
            kind: PackageKind::Desc,
            slot: self.shared.keys.len() + f,
            stream_size: self.desc_size[f],
            stream_data: self.desc_data[f],
            part_id,
            sizes,
            data,
        });
        Ok(())
    }

    fn save_descriptions(&self) -> Result<()> {
        let archive = &self.shared.archive;
        let keys = &self.shared.keys;

        let mut params = Vec::new();
        varint::put_int(&mut params, self.no_variants as i64);
        varint::put_int(&mut params, i64::from(self.no_samples));
        varint::put_fixed(&mut params, u64::from(self.ploidy), 1);
        varint::put_int(&mut params, i64::from(self.shared.config.neglect_limit));
        varint::put_int(&mut params, keys.len() as i64);
        varint::put_int(
            &mut params,
            self.shared.gt_key.map_or(-1, |k| k as i64),
        );

        for key in keys {
            varint::put_int(&mut params, i64::from(key.key_id));
            varint::put_fixed(&mut params, u64::from(key.kind.as_u8()), 1);
            varint::put_fixed(&mut params, u64::from(key.value_type.as_u8()), 1);
        }

        let sid = archive.register_stream("db_params")?;
        archive.add_part(sid, &params, 0)?;
        archive.set_raw_size(sid, params.len() as u64);

        let bc = BlockCoder::new(self.shared.config.block_params_meta());

        let mut blocks: Vec<(&str, Vec<u8>)> = Vec::new();
        let mut meta_block = Vec::new();
        varint::put_str(&mut meta_block, &self.meta);
        blocks.push(("db_meta", meta_block));

        let mut header_block = Vec::new();
        varint::put_str(&mut header_block, &self.header);
        blocks.push(("db_header", header_block));

        let mut samples_block = Vec::new();
        for s in &self.samples {
            varint::put_str(&mut samples_block, s);
        }
        blocks.push(("db_samples", samples_block));

        for (name, raw) in blocks {
            let compressed = bc.compress(&raw);
            let sid = archive.register_stream(name)?;
            archive.add_part(sid, &compressed, 0)?;
            archive.set_raw_size(sid, raw.len() as u64);
        }

        Ok(())
    }

    /// Flush everything, drain the workers, write the footer, and run the
    /// stream-deduplication rewrite. Consumes the writer.
    pub fn finish(mut self) -> Result<u64> {
        self.finished = true;

        for i in 0..self.shared.keys.len() {
            self.flush_key(i)?;
        }
        for f in 0..NO_DESC_FIELDS {
            self.flush_desc(f)?;
        }

        self.queue.mark_completed();
        for worker in self.workers.drain(..) {
            worker.join().map_err(|_| VarzipError::Cancelled)?;
        }
        self.check_error()?;

        self.save_descriptions()?;
        self.shared.archive.close()?;

        let path = self.shared.archive.path().to_path_buf();
        let no_keys = self.shared.keys.len();
        // All workers are joined and the footer is on disk; the rewrite
        // works on the closed file.
        optimize::optimize_archive(&path, no_keys)?;

        log::info!("archive finished: {} records", self.no_variants);
        Ok(self.no_variants)
    }
}

impl Drop for VariantWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.queue.mark_completed();
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

pub(crate) fn make_codec(
    key: &KeyDesc,
    is_gt: bool,
    no_samples: u32,
    ploidy: u32,
    neglect_limit: u32,
) -> ColumnCodec {
    if is_gt {
        return ColumnCodec::Genotype(GenotypeCodec::new(no_samples, ploidy, neglect_limit));
    }

    match (key.kind, key.value_type) {
        (KeyKind::Format, ValueType::Int | ValueType::Real) => {
            ColumnCodec::Format(FieldCodec::new(no_samples))
        }
        (KeyKind::Info, ValueType::Int | ValueType::Real) => {
            ColumnCodec::Info(FieldCodec::new(no_samples))
        }
        _ => ColumnCodec::Generic(TextPreproc::new()),
    }
}
