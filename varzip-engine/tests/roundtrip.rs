//! End-to-end archive round trips through the writer/reader pair and the
//! four-stage pipeline.

use std::path::PathBuf;

use varzip_engine::io::{MemoryFormatter, MemoryInput, MemoryOutput, MemoryParser};
use varzip_engine::record::Record;
use varzip_engine::{
    Cell, Config, KeyDesc, KeyKind, ValueType, VariantDesc, VariantReader, VariantWriter, pipeline,
};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("varzip_e2e_{}_{}.vz", std::process::id(), name))
}

fn small_config() -> Config {
    Config {
        no_threads: 3,
        records_per_cycle: 16,
        ..Config::default()
    }
}

fn desc(chrom: &str, pos: i64, id: &str, ref_allele: &str, alt: &str, qual: &str) -> VariantDesc {
    VariantDesc {
        chrom: chrom.into(),
        pos,
        id: id.into(),
        ref_allele: ref_allele.into(),
        alt: alt.into(),
        qual: qual.into(),
    }
}

fn write_records(
    path: &PathBuf,
    keys: &[KeyDesc],
    gt_key: Option<usize>,
    no_samples: u32,
    ploidy: u32,
    records: &[Record],
) {
    let mut writer = VariantWriter::create(
        path,
        small_config(),
        keys.to_vec(),
        gt_key,
        no_samples,
        ploidy,
    )
    .unwrap();

    for (d, cells) in records {
        writer.add_record(d, cells).unwrap();
    }
    assert_eq!(writer.finish().unwrap(), records.len() as u64);
}

fn read_records(path: &PathBuf) -> (VariantReader, Vec<Record>) {
    let mut reader = VariantReader::open(path, small_config()).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        records.push(record);
    }
    (reader, records)
}

#[test]
fn empty_archive() {
    let path = temp_path("empty");

    write_records(&path, &[], None, 5, 0, &[]);

    let (reader, records) = read_records(&path);
    assert_eq!(reader.no_variants(), 0);
    assert_eq!(reader.no_samples(), 5);
    assert_eq!(reader.ploidy(), 0);
    assert!(reader.keys().is_empty());
    assert!(records.is_empty());

    std::fs::remove_file(&path).ok();
}

#[test]
fn one_variant_one_filter_key() {
    let path = temp_path("filter");

    let keys = [KeyDesc {
        key_id: 7,
        kind: KeyKind::Filter,
        value_type: ValueType::Flag,
    }];
    let records = vec![(
        desc("chr1", 100, ".", "A", "T", "30"),
        vec![Cell::flag(true)],
    )];

    write_records(&path, &keys, None, 1, 2, &records);

    let (reader, decoded) = read_records(&path);
    assert_eq!(reader.keys(), &keys);
    assert_eq!(decoded, records);

    std::fs::remove_file(&path).ok();
}

#[test]
fn info_int_known_value_path() {
    let path = temp_path("info42");

    let keys = [KeyDesc {
        key_id: 0,
        kind: KeyKind::Info,
        value_type: ValueType::Int,
    }];
    let records = vec![
        (desc("chr1", 100, ".", "A", "T", "30"), vec![Cell::ints(&[42])]),
        (desc("chr1", 140, ".", "C", "G", "31"), vec![Cell::ints(&[42])]),
    ];

    write_records(&path, &keys, None, 1, 2, &records);

    let (_, decoded) = read_records(&path);
    assert_eq!(decoded, records);

    std::fs::remove_file(&path).ok();
}

// htslib-style genotype call encoding: (allele + 1) << 1 | phased.
fn call(allele: u32, phased: bool) -> u32 {
    ((allele + 1) << 1) | u32::from(phased)
}

#[test]
fn genotype_grid_diploid() {
    let path = temp_path("gt");

    let keys = [KeyDesc {
        key_id: 0,
        kind: KeyKind::Format,
        value_type: ValueType::Int,
    }];

    // row0 = [0|0, 0|1, 1|0, 1|1], row1 all 0|0, row2 mixed.
    let rows: [Vec<u32>; 3] = [
        vec![
            call(0, true), call(0, true),
            call(0, true), call(1, true),
            call(1, true), call(0, true),
            call(1, true), call(1, true),
        ],
        vec![call(0, true); 8],
        vec![
            call(1, true), call(1, true),
            call(1, true), call(0, true),
            call(0, true), call(1, true),
            call(0, true), call(0, true),
        ],
    ];

    let records: Vec<Record> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            (
                desc("chr1", 100 + i as i64 * 10, ".", "A", "T", "30"),
                vec![Cell::ints(row)],
            )
        })
        .collect();

    write_records(&path, &keys, Some(0), 4, 2, &records);

    let (reader, decoded) = read_records(&path);
    assert_eq!(reader.gt_key(), Some(0));
    assert_eq!(decoded, records);

    std::fs::remove_file(&path).ok();
}

#[test]
fn mixed_key_table_multiple_parts() {
    let path = temp_path("mixed");

    let keys = [
        KeyDesc { key_id: 0, kind: KeyKind::Filter, value_type: ValueType::Flag },
        KeyDesc { key_id: 1, kind: KeyKind::Info, value_type: ValueType::Int },
        KeyDesc { key_id: 2, kind: KeyKind::Info, value_type: ValueType::Real },
        KeyDesc { key_id: 3, kind: KeyKind::Info, value_type: ValueType::Str },
        KeyDesc { key_id: 0, kind: KeyKind::Format, value_type: ValueType::Int },
        KeyDesc { key_id: 1, kind: KeyKind::Format, value_type: ValueType::Int },
    ];

    // Small buffers force several parts per column.
    let config = Config {
        no_threads: 4,
        max_buffer_size: 512,
        max_buffer_gt_size: 1024,
        max_buffer_desc_size: 256,
        ..Config::default()
    };

    let no_samples = 3u32;
    let records: Vec<Record> = (0..500)
        .map(|i| {
            let gt: Vec<u32> = (0..no_samples * 2)
                .map(|k| call(u32::from((i + k) % 7 == 0), true))
                .collect();
            let depths: Vec<u32> = (0..no_samples).map(|k| 10 + (i + k) % 5).collect();

            (
                desc(
                    if i % 2 == 0 { "chr1" } else { "chr2" },
                    1000 + i as i64 * 3,
                    &format!("rs{}", 100000 + i),
                    "A",
                    if i % 3 == 0 { "T" } else { "C,G" },
                    "29.5",
                ),
                vec![
                    Cell::flag(i % 4 != 0),
                    Cell::ints(&[i % 16]),
                    if i % 5 == 0 {
                        Cell::default()
                    } else {
                        Cell::ints(&[(i as f32 / 8.0).to_bits()])
                    },
                    Cell::text(format!("annotation_text_{};long_word_here", i % 3).as_bytes()),
                    Cell::ints(&gt),
                    Cell::ints(&depths),
                ],
            )
        })
        .collect();

    let mut writer =
        VariantWriter::create(&path, config, keys.to_vec(), Some(4), no_samples, 2).unwrap();
    writer.set_meta("generated fixture");
    writer.set_header("##fileformat=VCFv4.2");
    writer.set_samples(vec!["S1".into(), "S2".into(), "S3".into()]);
    for (d, cells) in &records {
        writer.add_record(d, cells).unwrap();
    }
    writer.finish().unwrap();

    let mut reader = VariantReader::open(&path, config).unwrap();
    assert_eq!(reader.meta(), "generated fixture");
    assert_eq!(reader.header(), "##fileformat=VCFv4.2");
    assert_eq!(reader.samples(), ["S1", "S2", "S3"]);

    let mut decoded = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        decoded.push(record);
    }
    assert_eq!(decoded.len(), records.len());

    for ((d1, c1), (d2, c2)) in records.iter().zip(&decoded) {
        assert_eq!(d1, d2);
        for (a, b) in c1.iter().zip(c2) {
            assert_eq!(a.present, b.present);
            if a.present {
                assert_eq!(a.data, b.data);
                assert_eq!(a.count, b.count);
            }
        }
    }

    std::fs::remove_file(&path).ok();
}

#[test]
fn identical_info_columns_deduplicate() {
    let path = temp_path("dedup");

    let keys = [
        KeyDesc { key_id: 0, kind: KeyKind::Info, value_type: ValueType::Int },
        KeyDesc { key_id: 1, kind: KeyKind::Info, value_type: ValueType::Int },
    ];

    let records: Vec<Record> = (0..200)
        .map(|i| {
            let v = (i % 9) * 11;
            (
                desc("1", 50 + i as i64, ".", "G", "A", "."),
                vec![Cell::ints(&[v]), Cell::ints(&[v])],
            )
        })
        .collect();

    write_records(&path, &keys, None, 1, 2, &records);

    // One data stream must be stored as a link to the other.
    let (reader, decoded) = read_records(&path);
    assert_eq!(decoded, records);
    drop(reader);

    let archive = varzip_archive::Archive::open(&path).unwrap();
    let nodes = varzip_engine::optimize::load_nodes(&archive, "data_nodes", 2).unwrap();
    let edges = varzip_engine::optimize::load_edges(&archive, "data_edges", 2).unwrap();
    assert_eq!(edges, vec![(0, 1)]);
    assert_eq!(nodes.iter().filter(|n| !n.1).count(), 1);

    std::fs::remove_file(&path).ok();
}

#[test]
fn deterministic_archives() {
    let build = |path: &PathBuf| {
        let keys = [
            KeyDesc { key_id: 0, kind: KeyKind::Info, value_type: ValueType::Int },
            KeyDesc { key_id: 0, kind: KeyKind::Format, value_type: ValueType::Int },
        ];
        let records: Vec<Record> = (0..300)
            .map(|i| {
                (
                    desc("chrX", i as i64 * 7, ".", "T", "A", "40"),
                    vec![
                        Cell::ints(&[i * 13 % 40]),
                        Cell::ints(&[call(i % 2, false), call((i + 1) % 2, false)]),
                    ],
                )
            })
            .collect();
        write_records(path, &keys, Some(1), 1, 2, &records);
    };

    let p1 = temp_path("det1");
    let p2 = temp_path("det2");
    build(&p1);
    build(&p2);

    let b1 = std::fs::read(&p1).unwrap();
    let b2 = std::fs::read(&p2).unwrap();
    assert_eq!(b1, b2);

    std::fs::remove_file(&p1).ok();
    std::fs::remove_file(&p2).ok();
}

#[test]
fn pipeline_end_to_end() {
    let path = temp_path("pipeline");

    let keys = [
        KeyDesc { key_id: 0, kind: KeyKind::Filter, value_type: ValueType::Flag },
        KeyDesc { key_id: 1, kind: KeyKind::Info, value_type: ValueType::Int },
    ];

    let records: Vec<Record> = (0..100)
        .map(|i| {
            (
                desc("chr7", 10 + i as i64, ".", "G", "T", "12"),
                vec![Cell::flag(i % 3 == 0), Cell::ints(&[i % 5, i % 7])],
            )
        })
        .collect();

    let writer =
        VariantWriter::create(&path, small_config(), keys.to_vec(), None, 1, 2).unwrap();

    let mut input = MemoryInput::new(&records);
    let mut parser = MemoryParser;
    let written = pipeline::compress(&mut input, &mut parser, writer, |_| {}).unwrap();
    assert_eq!(written, 100);

    let reader = VariantReader::open(&path, small_config()).unwrap();
    let mut formatter = MemoryFormatter;
    let mut output = MemoryOutput::default();
    let read = pipeline::decompress(reader, &mut formatter, &mut output, |_| {}).unwrap();
    assert_eq!(read, 100);

    let decoded = output.into_records(keys.len()).unwrap();
    assert_eq!(decoded, records);

    std::fs::remove_file(&path).ok();
}
