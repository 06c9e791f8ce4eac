//! Plain-text variant record collaborator.
//!
//! Reads and writes a tab-separated record format with a `##` header
//! carrying FILTER/INFO/FORMAT declarations and a `#CHROM ...` column line
//! listing the samples. This lives outside the compression core: the engine
//! only sees the collaborator traits.
//!
//! Value conventions follow the usual variant-call text form: `.` means
//! missing (integer sentinel `0x8000_0000`, float sentinel `0x7f80_0001`,
//! genotype call 0), short per-sample vectors are padded with the vector-end
//! sentinel `0x8000_0001`, and genotype calls are stored as
//! `(allele + 1) << 1 | phased`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use varzip_core::error::{Result, VarzipError};
use varzip_engine::io::{RawInput, RawOutput, RecordFormatter, RecordParser};
use varzip_engine::record::{Cell, KeyDesc, KeyKind, ValueType, VariantDesc};

/// Missing-value sentinel for integers.
const INT_MISSING: u32 = 0x8000_0000;
/// Vector-end padding sentinel.
const INT_VECTOR_END: u32 = 0x8000_0001;
/// Missing-value sentinel for floats (a quiet-NaN pattern).
const FLOAT_MISSING: u32 = 0x7f80_0001;
/// Missing genotype call.
const GT_MISSING: u32 = 0;

/// Key table plus name lookup built from a parsed header.
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    /// Declared keys in column order (filters, then info, then format).
    pub keys: Vec<KeyDesc>,
    /// Key names, parallel to `keys`.
    pub names: Vec<String>,
    /// Index of the genotype key, if declared.
    pub gt_key: Option<usize>,

    filter_by_name: HashMap<String, usize>,
    info_by_name: HashMap<String, usize>,
    format_by_name: HashMap<String, usize>,
}

impl KeyTable {
    fn push(&mut self, name: &str, kind: KeyKind, value_type: ValueType) {
        let per_kind = match kind {
            KeyKind::Filter => &mut self.filter_by_name,
            KeyKind::Info => &mut self.info_by_name,
            KeyKind::Format => &mut self.format_by_name,
        };
        if per_kind.contains_key(name) {
            return;
        }

        let key_id = per_kind.len() as u32;
        per_kind.insert(name.to_string(), self.keys.len());

        if kind == KeyKind::Format && name == "GT" {
            self.gt_key = Some(self.keys.len());
        }

        self.keys.push(KeyDesc {
            key_id,
            kind,
            value_type,
        });
        self.names.push(name.to_string());
    }
}

fn attribute<'a>(decl: &'a str, name: &str) -> Option<&'a str> {
    let inner = decl.strip_prefix('<')?.strip_suffix('>')?;
    for field in inner.split(',') {
        if let Some(value) = field.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value.trim_matches('"'));
            }
        }
    }
    None
}

fn declared_type(decl: &str) -> ValueType {
    match attribute(decl, "Type") {
        Some("Integer") => ValueType::Int,
        Some("Float") => ValueType::Real,
        Some("Flag") => ValueType::Flag,
        _ => ValueType::Str,
    }
}

/// Parsed header: verbatim text, key table, sample names.
#[derive(Debug, Default)]
pub struct Header {
    /// Verbatim `##` lines.
    pub text: String,
    /// Declared keys.
    pub table: KeyTable,
    /// Sample names from the column line.
    pub samples: Vec<String>,
}

/// Parse the header lines of a record file.
pub fn read_header(reader: &mut impl BufRead) -> Result<Header> {
    let mut header = Header::default();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(VarzipError::corrupt_input("input ends before the column line"));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);

        if let Some(rest) = trimmed.strip_prefix("##") {
            if !header.text.is_empty() {
                header.text.push('\n');
            }
            header.text.push_str(trimmed);

            if let Some(decl) = rest.strip_prefix("FILTER=") {
                if let Some(id) = attribute(decl, "ID") {
                    header.table.push(id, KeyKind::Filter, ValueType::Flag);
                }
            } else if let Some(decl) = rest.strip_prefix("INFO=") {
                if let Some(id) = attribute(decl, "ID") {
                    header.table.push(id, KeyKind::Info, declared_type(decl));
                }
            } else if let Some(decl) = rest.strip_prefix("FORMAT=") {
                if let Some(id) = attribute(decl, "ID") {
                    let vt = if id == "GT" {
                        ValueType::Int
                    } else {
                        declared_type(decl)
                    };
                    header.table.push(id, KeyKind::Format, vt);
                }
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix('#') {
            // Column line: fixed columns, then FORMAT + samples.
            let columns: Vec<&str> = rest.split('\t').collect();
            if columns.len() > 9 {
                header.samples = columns[9..].iter().map(|s| s.to_string()).collect();
            }
            // The implicit pass filter.
            header.table.push("PASS", KeyKind::Filter, ValueType::Flag);
            return Ok(header);
        }

        return Err(VarzipError::corrupt_input("record line before the column line"));
    }
}

// ---- reading ------------------------------------------------------------

/// Line reader over a record file, header already consumed.
#[derive(Debug)]
pub struct TextInput {
    reader: BufReader<File>,
}

impl TextInput {
    /// Open `path` and parse its header.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Header)> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| VarzipError::open_failure(path.display().to_string(), e.to_string()))?;
        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader)?;
        Ok((Self { reader }, header))
    }
}

impl RawInput for TextInput {
    fn read_raw(&mut self, raw: &mut Vec<u8>) -> Result<bool> {
        raw.clear();
        loop {
            let n = self.reader.read_until(b'\n', raw)?;
            if n == 0 {
                return Ok(false);
            }
            while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if !raw.is_empty() {
                return Ok(true);
            }
        }
    }
}

/// Parser from text lines to typed records.
#[derive(Debug)]
pub struct TextParser {
    table: KeyTable,
    no_samples: usize,
}

impl TextParser {
    /// Build a parser over a parsed header.
    pub fn new(header: &Header) -> Self {
        Self {
            table: header.table.clone(),
            no_samples: header.samples.len(),
        }
    }

    fn parse_info(&self, field: &str, cells: &mut [Cell]) -> Result<()> {
        if field == "." {
            return Ok(());
        }

        for item in field.split(';') {
            let (name, value) = match item.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (item, None),
            };

            let Some(&idx) = self.table.info_by_name.get(name) else {
                return Err(VarzipError::corrupt_input(format!(
                    "undeclared INFO key: {name}"
                )));
            };

            cells[idx] = match (self.table.keys[idx].value_type, value) {
                (ValueType::Flag, _) | (_, None) => Cell::flag(true),
                (ValueType::Int, Some(v)) => {
                    Cell::ints(&parse_typed_list(v, ValueType::Int)?)
                }
                (ValueType::Real, Some(v)) => {
                    Cell::ints(&parse_typed_list(v, ValueType::Real)?)
                }
                (_, Some(v)) => Cell::text(v.as_bytes()),
            };
        }

        Ok(())
    }

    fn parse_samples(
        &self,
        format_field: &str,
        sample_fields: &[&str],
        cells: &mut [Cell],
    ) -> Result<()> {
        let format_keys: Vec<usize> = format_field
            .split(':')
            .map(|name| {
                self.table.format_by_name.get(name).copied().ok_or_else(|| {
                    VarzipError::corrupt_input(format!("undeclared FORMAT key: {name}"))
                })
            })
            .collect::<Result<_>>()?;

        for (slot, &idx) in format_keys.iter().enumerate() {
            let entries: Vec<&str> = sample_fields
                .iter()
                .map(|s| s.split(':').nth(slot).unwrap_or("."))
                .collect();

            let is_gt = self.table.gt_key == Some(idx);
            let vt = self.table.keys[idx].value_type;

            if is_gt {
                let calls: Vec<Vec<u32>> = entries
                    .iter()
                    .map(|e| parse_genotype(e))
                    .collect::<Result<_>>()?;
                let ploidy = calls.iter().map(Vec::len).max().unwrap_or(0);

                let mut values = Vec::with_capacity(self.no_samples * ploidy);
                for call in &calls {
                    values.extend_from_slice(call);
                    values.extend(std::iter::repeat_n(INT_VECTOR_END, ploidy - call.len()));
                }
                cells[idx] = Cell::ints(&values);
            } else if vt == ValueType::Int || vt == ValueType::Real {
                let lists: Vec<Vec<u32>> = entries
                    .iter()
                    .map(|e| parse_typed_list(e, vt))
                    .collect::<Result<_>>()?;
                let width = lists.iter().map(Vec::len).max().unwrap_or(0);

                let mut values = Vec::with_capacity(self.no_samples * width);
                for list in &lists {
                    values.extend_from_slice(list);
                    values.extend(std::iter::repeat_n(INT_VECTOR_END, width - list.len()));
                }
                cells[idx] = Cell::ints(&values);
            } else {
                // String FORMAT values: per-sample strings joined by tabs.
                let joined = entries.join("\t");
                cells[idx] = Cell::text(joined.as_bytes());
            }
        }

        Ok(())
    }
}

impl RecordParser for TextParser {
    fn parse(&mut self, raw: &[u8], desc: &mut VariantDesc, cells: &mut [Cell]) -> Result<()> {
        let line = std::str::from_utf8(raw)
            .map_err(|_| VarzipError::corrupt_input("record line is not valid UTF-8"))?;
        let fields: Vec<&str> = line.split('\t').collect();

        if fields.len() < 8 {
            return Err(VarzipError::corrupt_input("record line with missing columns"));
        }

        desc.chrom = fields[0].to_string();
        desc.pos = fields[1]
            .parse()
            .map_err(|_| VarzipError::corrupt_input("unparsable position"))?;
        desc.id = fields[2].to_string();
        desc.ref_allele = fields[3].to_string();
        desc.alt = fields[4].to_string();
        desc.qual = fields[5].to_string();

        for cell in cells.iter_mut() {
            *cell = Cell::default();
        }

        if fields[6] != "." {
            for name in fields[6].split(';') {
                let Some(&idx) = self.table.filter_by_name.get(name) else {
                    return Err(VarzipError::corrupt_input(format!(
                        "undeclared FILTER: {name}"
                    )));
                };
                cells[idx] = Cell::flag(true);
            }
        }

        self.parse_info(fields[7], cells)?;

        if fields.len() > 9 {
            self.parse_samples(fields[8], &fields[9..], cells)?;
        }

        Ok(())
    }
}

fn parse_typed_list(field: &str, vt: ValueType) -> Result<Vec<u32>> {
    field
        .split(',')
        .map(|item| {
            if item == "." {
                return Ok(match vt {
                    ValueType::Real => FLOAT_MISSING,
                    _ => INT_MISSING,
                });
            }
            match vt {
                ValueType::Real => item
                    .parse::<f32>()
                    .map(f32::to_bits)
                    .map_err(|_| VarzipError::corrupt_input("unparsable float value")),
                _ => item
                    .parse::<i32>()
                    .map(|v| v as u32)
                    .map_err(|_| VarzipError::corrupt_input("unparsable integer value")),
            }
        })
        .collect()
}

fn parse_genotype(entry: &str) -> Result<Vec<u32>> {
    if entry == "." {
        return Ok(vec![GT_MISSING]);
    }

    let mut calls = Vec::new();
    let mut phased = false;
    for part in entry.split_inclusive(['/', '|']) {
        let (allele_text, next_phased) = match part.strip_suffix('|') {
            Some(a) => (a, true),
            None => match part.strip_suffix('/') {
                Some(a) => (a, false),
                None => (part, false),
            },
        };

        let call = if allele_text == "." {
            GT_MISSING
        } else {
            let allele: u32 = allele_text
                .parse()
                .map_err(|_| VarzipError::corrupt_input("unparsable genotype allele"))?;
            ((allele + 1) << 1) | u32::from(phased)
        };
        calls.push(call);
        phased = next_phased;
    }

    Ok(calls)
}

// ---- writing ------------------------------------------------------------

/// Line writer for a record file.
#[derive(Debug)]
pub struct TextOutput {
    writer: BufWriter<File>,
}

impl TextOutput {
    /// Create `path` and write the header and column line.
    pub fn create(
        path: impl AsRef<Path>,
        header_text: &str,
        samples: &[String],
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| VarzipError::open_failure(path.display().to_string(), e.to_string()))?;
        let mut writer = BufWriter::new(file);

        if !header_text.is_empty() {
            writer.write_all(header_text.as_bytes())?;
            writer.write_all(b"\n")?;
        }

        write!(writer, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO")?;
        if !samples.is_empty() {
            write!(writer, "\tFORMAT")?;
            for s in samples {
                write!(writer, "\t{s}")?;
            }
        }
        writer.write_all(b"\n")?;

        Ok(Self { writer })
    }

    /// Flush the underlying file.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl RawOutput for TextOutput {
    fn write_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.writer.write_all(raw)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Formatter from typed records back to text lines.
#[derive(Debug)]
pub struct TextFormatter {
    keys: Vec<KeyDesc>,
    names: Vec<String>,
    gt_key: Option<usize>,
    no_samples: usize,
}

impl TextFormatter {
    /// Build a formatter for a reader's key table.
    pub fn new(
        keys: &[KeyDesc],
        names: &[String],
        gt_key: Option<usize>,
        no_samples: usize,
    ) -> Self {
        Self {
            keys: keys.to_vec(),
            names: names.to_vec(),
            gt_key,
            no_samples,
        }
    }

    fn format_value(&self, vt: ValueType, v: u32) -> String {
        match vt {
            ValueType::Real => {
                if v == FLOAT_MISSING {
                    ".".to_string()
                } else {
                    format!("{}", f32::from_bits(v))
                }
            }
            _ => {
                if v == INT_MISSING {
                    ".".to_string()
                } else {
                    format!("{}", v as i32)
                }
            }
        }
    }
}

impl RecordFormatter for TextFormatter {
    fn format(&mut self, desc: &VariantDesc, cells: &[Cell], raw: &mut Vec<u8>) -> Result<()> {
        let mut line = String::with_capacity(128);

        line.push_str(&desc.chrom);
        line.push('\t');
        line.push_str(&desc.pos.to_string());
        line.push('\t');
        line.push_str(&desc.id);
        line.push('\t');
        line.push_str(&desc.ref_allele);
        line.push('\t');
        line.push_str(&desc.alt);
        line.push('\t');
        line.push_str(&desc.qual);

        // FILTER
        let filters: Vec<&str> = self
            .keys
            .iter()
            .enumerate()
            .filter(|&(i, k)| k.kind == KeyKind::Filter && cells[i].present)
            .map(|(i, _)| self.names[i].as_str())
            .collect();
        line.push('\t');
        if filters.is_empty() {
            line.push('.');
        } else {
            line.push_str(&filters.join(";"));
        }

        // INFO
        let mut info_items = Vec::new();
        for (i, key) in self.keys.iter().enumerate() {
            if key.kind != KeyKind::Info || !cells[i].present {
                continue;
            }
            match key.value_type {
                ValueType::Flag => info_items.push(self.names[i].clone()),
                ValueType::Str => info_items.push(format!(
                    "{}={}",
                    self.names[i],
                    String::from_utf8_lossy(&cells[i].data)
                )),
                vt => {
                    let values: Vec<String> = cells[i]
                        .as_ints()
                        .iter()
                        .map(|&v| self.format_value(vt, v))
                        .collect();
                    info_items.push(format!("{}={}", self.names[i], values.join(",")));
                }
            }
        }
        line.push('\t');
        if info_items.is_empty() {
            line.push('.');
        } else {
            line.push_str(&info_items.join(";"));
        }

        // FORMAT + samples
        if self.no_samples > 0 {
            let present_format: Vec<usize> = self
                .keys
                .iter()
                .enumerate()
                .filter(|&(i, k)| k.kind == KeyKind::Format && cells[i].present)
                .map(|(i, _)| i)
                .collect();

            if !present_format.is_empty() {
                let names: Vec<&str> = present_format
                    .iter()
                    .map(|&i| self.names[i].as_str())
                    .collect();
                line.push('\t');
                line.push_str(&names.join(":"));

                // Pre-split string FORMAT cells into per-sample values.
                let string_values: HashMap<usize, Vec<String>> = present_format
                    .iter()
                    .filter(|&&i| {
                        self.keys[i].value_type == ValueType::Str && self.gt_key != Some(i)
                    })
                    .map(|&i| {
                        let joined = String::from_utf8_lossy(&cells[i].data).into_owned();
                        (i, joined.split('\t').map(String::from).collect())
                    })
                    .collect();

                for s in 0..self.no_samples {
                    let mut entries = Vec::with_capacity(present_format.len());

                    for &i in &present_format {
                        if self.gt_key == Some(i) {
                            entries.push(format_genotype_for_sample(
                                &cells[i],
                                s,
                                self.no_samples,
                            ));
                        } else if self.keys[i].value_type == ValueType::Str {
                            entries.push(
                                string_values[&i]
                                    .get(s)
                                    .cloned()
                                    .unwrap_or_else(|| ".".to_string()),
                            );
                        } else {
                            let values = cells[i].as_ints();
                            let width = values.len() / self.no_samples.max(1);
                            let slice = &values[s * width..(s + 1) * width];

                            let texts: Vec<String> = slice
                                .iter()
                                .filter(|&&v| v != INT_VECTOR_END)
                                .map(|&v| self.format_value(self.keys[i].value_type, v))
                                .collect();
                            entries.push(if texts.is_empty() {
                                ".".to_string()
                            } else {
                                texts.join(",")
                            });
                        }
                    }

                    line.push('\t');
                    line.push_str(&entries.join(":"));
                }
            }
        }

        raw.clear();
        raw.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

fn format_genotype_for_sample(cell: &Cell, sample: usize, no_samples: usize) -> String {
    let values = cell.as_ints();
    let ploidy = values.len() / no_samples.max(1);
    let calls = &values[sample * ploidy..(sample + 1) * ploidy];

    let mut out = String::new();
    for (k, &call) in calls.iter().enumerate() {
        if call == INT_VECTOR_END {
            break;
        }
        if k > 0 {
            out.push(if call & 1 != 0 { '|' } else { '/' });
        }
        if call == GT_MISSING {
            out.push('.');
        } else {
            out.push_str(&((call >> 1) - 1).to_string());
        }
    }

    if out.is_empty() { ".".to_string() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "\
##fileformat=VCFv4.2\n\
##FILTER=<ID=q10,Description=\"low qual\">\n\
##INFO=<ID=DP,Number=1,Type=Integer,Description=\"depth\">\n\
##INFO=<ID=AF,Number=A,Type=Float,Description=\"freq\">\n\
##INFO=<ID=DB,Number=0,Type=Flag,Description=\"db\">\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"gt\">\n\
##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"depth\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\n";

    fn parse_header() -> Header {
        let mut cursor = Cursor::new(HEADER.as_bytes());
        read_header(&mut cursor).unwrap()
    }

    #[test]
    fn test_header_keys() {
        let header = parse_header();
        assert_eq!(header.samples, ["S1", "S2"]);

        // q10, DP, AF, DB, GT, DP(format), PASS
        assert_eq!(header.table.keys.len(), 7);
        assert_eq!(header.table.names[0], "q10");
        assert_eq!(header.table.keys[0].kind, KeyKind::Filter);
        assert_eq!(header.table.keys[1].value_type, ValueType::Int);
        assert_eq!(header.table.keys[2].value_type, ValueType::Real);
        assert_eq!(header.table.gt_key, Some(4));
        assert_eq!(header.table.names[6], "PASS");
    }

    #[test]
    fn test_record_roundtrip_through_text() {
        let header = parse_header();
        let mut parser = TextParser::new(&header);
        let mut formatter = TextFormatter::new(
            &header.table.keys,
            &header.table.names,
            header.table.gt_key,
            header.samples.len(),
        );

        let line = "chr1\t1234\trs77\tA\tT,C\t50\tPASS\tDP=23;AF=0.5,0.25;DB\tGT:DP\t0|1:12\t1/1:.";

        let mut desc = VariantDesc::default();
        let mut cells = vec![Cell::default(); header.table.keys.len()];
        parser
            .parse(line.as_bytes(), &mut desc, &mut cells)
            .unwrap();

        assert_eq!(desc.chrom, "chr1");
        assert_eq!(desc.pos, 1234);
        assert_eq!(desc.qual, "50");

        let mut raw = Vec::new();
        formatter.format(&desc, &cells, &mut raw).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), line);
    }

    #[test]
    fn test_missing_fields_roundtrip() {
        let header = parse_header();
        let mut parser = TextParser::new(&header);
        let mut formatter = TextFormatter::new(
            &header.table.keys,
            &header.table.names,
            header.table.gt_key,
            header.samples.len(),
        );

        let line = "chr2\t99\t.\tG\tA\t.\t.\t.\tGT\t.\t0/0";

        let mut desc = VariantDesc::default();
        let mut cells = vec![Cell::default(); header.table.keys.len()];
        parser
            .parse(line.as_bytes(), &mut desc, &mut cells)
            .unwrap();

        let mut raw = Vec::new();
        formatter.format(&desc, &cells, &mut raw).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), line);
    }

    #[test]
    fn test_genotype_parsing() {
        assert_eq!(parse_genotype("0|1").unwrap(), vec![2, 5]);
        assert_eq!(parse_genotype("1/1").unwrap(), vec![4, 4]);
        assert_eq!(parse_genotype(".").unwrap(), vec![GT_MISSING]);
        assert_eq!(parse_genotype("./1").unwrap(), vec![GT_MISSING, 4]);
    }
}
