//! Four-stage barrier pipeline.
//!
//! Compression runs four long-lived stages over double-buffered vectors:
//!
//! - stage A reads raw records from the [`RawInput`]
//! - stage B parses the previous cycle's raw batch into typed records
//! - stage C feeds the batch before that into the [`VariantWriter`]
//! - the control stage swaps the buffer pairs at a reusable 4-way barrier,
//!   reports progress, and raises the end flag once both buffer pairs drain
//!
//! Every stage hits the barrier twice per cycle: the first count-down says
//! "produced/consumed", the second releases the next cycle, with the swap
//! happening in between. Decompression runs the mirrored arrangement
//! (decode → format → write).
//!
//! A failing stage parks its error and the pipeline winds down through the
//! normal end-flag path; the first error is returned after all stages have
//! joined.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

use varzip_core::error::{Result, VarzipError};

use crate::io::{RawInput, RawOutput, RecordFormatter, RecordParser};
use crate::reader::VariantReader;
use crate::record::{Cell, Record, VariantDesc};
use crate::writer::VariantWriter;

fn park_error(slot: &Mutex<Option<VarzipError>>, e: VarzipError) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(e);
    }
}

/// Drive `input` through `writer` until end of input. Returns the number of
/// records compressed; `progress` is called once per cycle with the running
/// total.
pub fn compress<I, P>(
    input: &mut I,
    parser: &mut P,
    writer: VariantWriter,
    mut progress: impl FnMut(u64),
) -> Result<u64>
where
    I: RawInput,
    P: RecordParser,
{
    let batch = writer.config_records_per_cycle();
    let no_keys = writer.no_keys();

    let barrier = Barrier::new(4);
    let end = AtomicBool::new(false);
    let error: Mutex<Option<VarzipError>> = Mutex::new(None);

    let raw_io: Mutex<Vec<Vec<u8>>> = Mutex::new(vec![Vec::new(); batch]);
    let raw_parse: Mutex<Vec<Vec<u8>>> = Mutex::new(vec![Vec::new(); batch]);
    let s_io = AtomicUsize::new(0);
    let s_parse = AtomicUsize::new(0);

    let rec_io: Mutex<Vec<Record>> = Mutex::new(Vec::new());
    let rec_compress: Mutex<Vec<Record>> = Mutex::new(Vec::new());

    let writer_slot: Mutex<Option<VariantWriter>> = Mutex::new(Some(writer));
    let mut total = 0u64;

    std::thread::scope(|scope| {
        // Stage A: raw record I/O.
        scope.spawn(|| {
            while !end.load(Ordering::Acquire) {
                let mut raws = raw_io.lock().unwrap();
                let mut filled = 0usize;

                while filled < batch {
                    match input.read_raw(&mut raws[filled]) {
                        Ok(true) => filled += 1,
                        Ok(false) => break,
                        Err(e) => {
                            park_error(&error, e);
                            break;
                        }
                    }
                }

                s_io.store(filled, Ordering::Release);
                drop(raws);

                barrier.wait();
                barrier.wait();
            }
        });

        // Stage B: parse raw records into typed records.
        scope.spawn(|| {
            barrier.wait();
            barrier.wait();

            while !end.load(Ordering::Acquire) {
                let raws = raw_parse.lock().unwrap();
                let mut records = rec_io.lock().unwrap();
                records.clear();

                let n = s_parse.load(Ordering::Acquire);
                for raw in raws.iter().take(n) {
                    let mut desc = VariantDesc::default();
                    let mut cells = vec![Cell::default(); no_keys];
                    match parser.parse(raw, &mut desc, &mut cells) {
                        Ok(()) => records.push((desc, cells)),
                        Err(e) => {
                            park_error(&error, e);
                            break;
                        }
                    }
                }

                drop(records);
                drop(raws);

                barrier.wait();
                barrier.wait();
            }
        });

        // Stage C: feed records into the compressing writer.
        scope.spawn(|| {
            barrier.wait();
            barrier.wait();

            while !end.load(Ordering::Acquire) {
                let records = rec_compress.lock().unwrap();

                if error.lock().unwrap().is_none() {
                    let mut slot = writer_slot.lock().unwrap();
                    if let Some(writer) = slot.as_mut() {
                        for (desc, cells) in records.iter() {
                            if let Err(e) = writer.add_record(desc, cells) {
                                park_error(&error, e);
                                break;
                            }
                        }
                    }
                }

                drop(records);

                barrier.wait();
                barrier.wait();
            }
        });

        // Control stage: swap the double buffers, detect the end.
        loop {
            barrier.wait();

            {
                let mut a = raw_io.lock().unwrap();
                let mut b = raw_parse.lock().unwrap();
                std::mem::swap(&mut *a, &mut *b);
                s_parse.store(s_io.load(Ordering::Acquire), Ordering::Release);

                let mut c = rec_io.lock().unwrap();
                let mut d = rec_compress.lock().unwrap();
                std::mem::swap(&mut *c, &mut *d);

                total += d.len() as u64;

                let drained = d.is_empty() && s_parse.load(Ordering::Acquire) == 0;
                if drained || error.lock().unwrap().is_some() {
                    end.store(true, Ordering::Release);
                }
            }

            barrier.wait();
            progress(total);

            if end.load(Ordering::Acquire) {
                break;
            }
        }
    });

    if let Some(e) = error.lock().unwrap().take() {
        return Err(e);
    }

    let writer = writer_slot.into_inner().unwrap().unwrap();
    writer.finish()
}

/// Drive `reader` through `output` until the declared record count.
pub fn decompress<F, O>(
    mut reader: VariantReader,
    formatter: &mut F,
    output: &mut O,
    mut progress: impl FnMut(u64),
) -> Result<u64>
where
    F: RecordFormatter,
    O: RawOutput,
{
    let batch = reader.config_records_per_cycle();
    let no_variants = reader.no_variants();

    let barrier = Barrier::new(4);
    let end = AtomicBool::new(false);
    let error: Mutex<Option<VarzipError>> = Mutex::new(None);

    let rec_decode: Mutex<Vec<Record>> = Mutex::new(Vec::new());
    let rec_format: Mutex<Vec<Record>> = Mutex::new(Vec::new());

    let raw_format: Mutex<Vec<Vec<u8>>> = Mutex::new(vec![Vec::new(); batch]);
    let raw_io: Mutex<Vec<Vec<u8>>> = Mutex::new(vec![Vec::new(); batch]);
    let s_format = AtomicUsize::new(0);
    let s_io = AtomicUsize::new(0);

    let mut total = 0u64;

    std::thread::scope(|scope| {
        // Decode stage: pull records out of the archive.
        scope.spawn(|| {
            while !end.load(Ordering::Acquire) {
                let mut records = rec_decode.lock().unwrap();
                records.clear();

                if error.lock().unwrap().is_none() {
                    for _ in 0..batch {
                        match reader.next_record() {
                            Ok(Some(record)) => records.push(record),
                            Ok(None) => break,
                            Err(e) => {
                                park_error(&error, e);
                                break;
                            }
                        }
                    }
                }

                drop(records);

                barrier.wait();
                barrier.wait();
            }

            reader.close();
        });

        // Format stage: records to raw records.
        scope.spawn(|| {
            while !end.load(Ordering::Acquire) {
                let records = rec_format.lock().unwrap();
                let mut raws = raw_format.lock().unwrap();

                let mut filled = 0usize;
                for (desc, cells) in records.iter() {
                    if let Err(e) = formatter.format(desc, cells, &mut raws[filled]) {
                        park_error(&error, e);
                        break;
                    }
                    filled += 1;
                }
                s_format.store(filled, Ordering::Release);

                drop(raws);
                drop(records);

                barrier.wait();
                barrier.wait();
            }
        });

        // Raw I/O stage: write raw records to the sink.
        scope.spawn(|| {
            barrier.wait();
            barrier.wait();

            while !end.load(Ordering::Acquire) {
                let raws = raw_io.lock().unwrap();
                let n = s_io.load(Ordering::Acquire);

                for raw in raws.iter().take(n) {
                    if let Err(e) = output.write_raw(raw) {
                        park_error(&error, e);
                        break;
                    }
                }

                drop(raws);

                barrier.wait();
                barrier.wait();
            }
        });

        // Control stage.
        loop {
            barrier.wait();

            {
                let mut a = raw_format.lock().unwrap();
                let mut b = raw_io.lock().unwrap();
                std::mem::swap(&mut *a, &mut *b);
                s_io.store(s_format.load(Ordering::Acquire), Ordering::Release);

                let mut c = rec_decode.lock().unwrap();
                let mut d = rec_format.lock().unwrap();
                std::mem::swap(&mut *c, &mut *d);

                total += d.len() as u64;

                let drained = d.is_empty() && s_io.load(Ordering::Acquire) == 0;
                if drained || error.lock().unwrap().is_some() {
                    end.store(true, Ordering::Release);
                }
            }

            barrier.wait();
            progress(total.min(no_variants));

            if end.load(Ordering::Acquire) {
                break;
            }
        }
    });

    if let Some(e) = error.lock().unwrap().take() {
        return Err(e);
    }

    Ok(total)
}
