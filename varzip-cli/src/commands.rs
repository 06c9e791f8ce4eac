//! Command implementations.

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use varzip_archive::Archive;
use varzip_core::error::Result;
use varzip_engine::{Config, VariantReader, VariantWriter, pipeline};

use crate::text_format::{TextFormatter, TextInput, TextOutput, TextParser};

fn print_progress(count: u64) {
    eprint!("{count}\r");
    std::io::stderr().flush().ok();
}

/// `varzip compress`
pub fn compress(
    input: &Path,
    archive: &Path,
    neglect_limit: u32,
    threads: u32,
    level: u32,
) -> Result<()> {
    let started = Instant::now();

    let (mut text_input, header) = TextInput::open(input)?;
    let mut parser = TextParser::new(&header);

    let config = Config {
        neglect_limit,
        no_threads: threads.max(1),
        compression_level: level,
        ..Config::default()
    };

    // Ploidy of the archive: the common case is diploid calls; the genotype
    // codec derives the actual per-row width from the data.
    let ploidy = if header.table.gt_key.is_some() { 2 } else { 0 };

    let mut writer = VariantWriter::create(
        archive,
        config,
        header.table.keys.clone(),
        header.table.gt_key,
        header.samples.len() as u32,
        ploidy,
    )?;
    writer.set_header(header.text.clone());
    writer.set_samples(header.samples.clone());

    let no_records = pipeline::compress(&mut text_input, &mut parser, writer, print_progress)?;

    eprintln!(
        "{no_records} records compressed in {:.2} s",
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

/// `varzip decompress`
pub fn decompress(archive: &Path, output: &Path, threads: u32) -> Result<()> {
    let started = Instant::now();

    let config = Config {
        no_threads: threads.max(1),
        ..Config::default()
    };

    let reader = VariantReader::open(archive, config)?;

    // Key names are recovered from the stored header text.
    let names = key_names_from_header(reader.header(), reader.keys().len());
    let mut formatter = TextFormatter::new(
        reader.keys(),
        &names,
        reader.gt_key(),
        reader.samples().len(),
    );

    let mut text_output = TextOutput::create(output, reader.header(), reader.samples())?;
    let no_records = pipeline::decompress(reader, &mut formatter, &mut text_output, print_progress)?;
    text_output.finish()?;

    eprintln!(
        "{no_records} records decompressed in {:.2} s",
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

// Rebuild the key-name table by re-parsing the stored header text the same
// way the compressor did.
fn key_names_from_header(header_text: &str, no_keys: usize) -> Vec<String> {
    let mut text = header_text.to_string();
    text.push_str("\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n");

    let mut cursor = std::io::Cursor::new(text.into_bytes());
    match crate::text_format::read_header(&mut cursor) {
        Ok(header) if header.table.names.len() == no_keys => header.table.names,
        _ => (0..no_keys).map(|i| format!("K{i}")).collect(),
    }
}

#[derive(Serialize)]
struct StreamInfo {
    name: String,
    parts: usize,
    raw_size: u64,
    compressed_size: u64,
}

/// `varzip info`
pub fn info(archive: &Path, json: bool) -> Result<()> {
    let archive = Archive::open(archive)?;

    let streams: Vec<StreamInfo> = archive
        .stream_names()
        .into_iter()
        .enumerate()
        .map(|(id, name)| StreamInfo {
            name,
            parts: archive.no_parts(id),
            raw_size: archive.raw_size(id),
            compressed_size: archive.compressed_size(id),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&streams).unwrap_or_default());
        return Ok(());
    }

    println!("{:<20} {:>8} {:>14} {:>14}", "stream", "parts", "raw", "compressed");
    let mut total_raw = 0u64;
    let mut total_compressed = 0u64;
    for s in &streams {
        println!(
            "{:<20} {:>8} {:>14} {:>14}",
            s.name, s.parts, s.raw_size, s.compressed_size
        );
        total_raw += s.raw_size;
        total_compressed += s.compressed_size;
    }
    println!(
        "{:<20} {:>8} {:>14} {:>14}",
        "total",
        streams.len(),
        total_raw,
        total_compressed
    );

    Ok(())
}
