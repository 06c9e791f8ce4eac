//! Stream/part archive container.
//!
//! An archive is an ordered set of named streams, each an append-only
//! sequence of parts. On disk every part is a lead-byte metadata varint
//! followed by the part bytes; the footer (stream names, raw sizes, part
//! offset/size tables) is written last, closed by a fixed 8-byte
//! little-endian footer size so a reader can locate it from the file tail.
//!
//! Part slots are reserved with [`Archive::add_part_prepare`] and filled
//! with [`Archive::add_part_complete`], so parts land in reservation order
//! within a stream no matter how workers interleave. A partial archive has
//! no footer and is invalid by construction.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use varzip_core::error::{Result, VarzipError};
use varzip_core::varint;

#[derive(Debug, Clone, Copy, Default)]
struct Part {
    offset: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct StreamEntry {
    name: String,
    parts: Vec<Part>,
    raw_size: u64,
    // read-side part iterator
    cur_id: usize,
}

#[derive(Debug)]
enum Backing {
    Writer(BufWriter<File>),
    Reader(File),
}

#[derive(Debug)]
struct Inner {
    backing: Backing,
    offset: u64,
    streams: Vec<StreamEntry>,
    by_name: HashMap<String, usize>,
    closed: bool,
}

/// Archive handle, shareable across worker threads.
#[derive(Debug)]
pub struct Archive {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl Archive {
    /// Create a new archive file for writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|e| VarzipError::open_failure(path.display().to_string(), e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                backing: Backing::Writer(BufWriter::with_capacity(1 << 20, file)),
                offset: 0,
                streams: Vec::new(),
                by_name: HashMap::new(),
                closed: false,
            }),
            path,
        })
    }

    /// Open an existing archive for reading and load its footer index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .map_err(|e| VarzipError::open_failure(path.display().to_string(), e.to_string()))?;

        let (streams, by_name) = read_footer(&mut file)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                backing: Backing::Reader(file),
                offset: 0,
                streams,
                by_name,
                closed: false,
            }),
            path,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a new stream; fails on a duplicate name.
    pub fn register_stream(&self, name: &str) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        if inner.by_name.contains_key(name) {
            return Err(VarzipError::duplicate_stream(name));
        }

        let id = inner.streams.len();
        inner.streams.push(StreamEntry {
            name: name.to_string(),
            ..StreamEntry::default()
        });
        inner.by_name.insert(name.to_string(), id);

        Ok(id)
    }

    /// Id of a registered stream, if any.
    pub fn stream_id(&self, name: &str) -> Option<usize> {
        self.inner.lock().unwrap().by_name.get(name).copied()
    }

    /// Id of a registered stream, or a `StreamNotFound` error.
    pub fn require_stream(&self, name: &str) -> Result<usize> {
        self.stream_id(name)
            .ok_or_else(|| VarzipError::stream_not_found(name))
    }

    /// Number of registered streams.
    pub fn no_streams(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    /// Names of all streams, in id order.
    pub fn stream_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.streams.iter().map(|s| s.name.clone()).collect()
    }

    /// Append a part in one step (reserve + write).
    pub fn add_part(&self, stream_id: usize, data: &[u8], metadata: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let part = inner.write_part(data, metadata)?;
        inner.streams[stream_id].parts.push(part);
        Ok(())
    }

    /// Reserve the next part slot of a stream; bytes come later through
    /// [`Archive::add_part_complete`].
    pub fn add_part_prepare(&self, stream_id: usize) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let parts = &mut inner.streams[stream_id].parts;
        parts.push(Part::default());
        Ok(parts.len() - 1)
    }

    /// Write the bytes of a reserved part slot.
    pub fn add_part_complete(
        &self,
        stream_id: usize,
        part_id: usize,
        data: &[u8],
        metadata: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let part = inner.write_part(data, metadata)?;
        inner.streams[stream_id].parts[part_id] = part;
        Ok(())
    }

    /// Read the next part of a stream in insertion order. `None` once the
    /// stream is exhausted.
    pub fn get_part(&self, stream_id: usize) -> Result<Option<(Vec<u8>, u64)>> {
        let mut inner = self.inner.lock().unwrap();

        let entry = &inner.streams[stream_id];
        let Some(&part) = entry.parts.get(entry.cur_id) else {
            return Ok(None);
        };
        inner.streams[stream_id].cur_id += 1;

        if part.size == 0 {
            return Ok(Some((Vec::new(), 0)));
        }

        let Backing::Reader(file) = &mut inner.backing else {
            return Err(VarzipError::protocol("get_part on an archive opened for writing"));
        };

        file.seek(SeekFrom::Start(part.offset))?;
        let metadata = read_varint(file)?;

        let mut data = vec![0u8; part.size as usize];
        file.read_exact(&mut data).map_err(|_| {
            VarzipError::corrupt_archive("part shorter than its declared size")
        })?;

        Ok(Some((data, metadata)))
    }

    /// Rewind a stream's part iterator.
    pub fn reset_part_iterator(&self, stream_id: usize) {
        self.inner.lock().unwrap().streams[stream_id].cur_id = 0;
    }

    /// Record the raw (uncompressed) size of a stream.
    pub fn set_raw_size(&self, stream_id: usize, raw_size: u64) {
        self.inner.lock().unwrap().streams[stream_id].raw_size = raw_size;
    }

    /// Add to the raw (uncompressed) size of a stream.
    pub fn add_raw_size(&self, stream_id: usize, raw_size: u64) {
        self.inner.lock().unwrap().streams[stream_id].raw_size += raw_size;
    }

    /// Raw (uncompressed) size of a stream.
    pub fn raw_size(&self, stream_id: usize) -> u64 {
        self.inner.lock().unwrap().streams[stream_id].raw_size
    }

    /// Total on-disk size of a stream's parts.
    pub fn compressed_size(&self, stream_id: usize) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.streams[stream_id].parts.iter().map(|p| p.size).sum()
    }

    /// Number of parts in a stream.
    pub fn no_parts(&self, stream_id: usize) -> usize {
        self.inner.lock().unwrap().streams[stream_id].parts.len()
    }

    /// Register `name` as an alias of an existing stream: the new stream
    /// shares the target's part table and raw size, and no bytes are
    /// written.
    pub fn link_stream(&self, name: &str, target_id: usize) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        if inner.by_name.contains_key(name) {
            return Err(VarzipError::duplicate_stream(name));
        }

        let id = inner.streams.len();
        let entry = StreamEntry {
            name: name.to_string(),
            parts: inner.streams[target_id].parts.clone(),
            raw_size: inner.streams[target_id].raw_size,
            cur_id: 0,
        };
        inner.streams.push(entry);
        inner.by_name.insert(name.to_string(), id);

        Ok(id)
    }

    /// Close the archive. In write mode this serializes the footer; without
    /// it the file is not a valid archive.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        if let Backing::Writer(_) = inner.backing {
            let mut footer = Vec::new();
            varint::put_uint(&mut footer, inner.streams.len() as u64);

            for stream in &inner.streams {
                varint::put_str(&mut footer, &stream.name);
                varint::put_uint(&mut footer, stream.parts.len() as u64);
                varint::put_uint(&mut footer, stream.raw_size);

                for part in &stream.parts {
                    varint::put_uint(&mut footer, part.offset);
                    varint::put_uint(&mut footer, part.size);
                }

                log::debug!(
                    "stream {}: raw {} packed {}",
                    stream.name,
                    stream.raw_size,
                    stream.parts.iter().map(|p| p.size).sum::<u64>()
                );
            }

            let mut trailer = Vec::new();
            varint::put_fixed(&mut trailer, footer.len() as u64, 8);

            let Backing::Writer(w) = &mut inner.backing else {
                unreachable!()
            };
            w.write_all(&footer)?;
            w.write_all(&trailer)?;
            w.flush()?;
        }

        Ok(())
    }
}

impl Inner {
    fn write_part(&mut self, data: &[u8], metadata: u64) -> Result<Part> {
        if self.closed {
            return Err(VarzipError::protocol("write into a closed archive"));
        }
        let Backing::Writer(w) = &mut self.backing else {
            return Err(VarzipError::protocol("write into an archive opened for reading"));
        };

        let mut head = Vec::new();
        varint::put_uint(&mut head, metadata);
        w.write_all(&head)?;
        if !data.is_empty() {
            w.write_all(data)?;
        }

        let part = Part {
            offset: self.offset,
            size: data.len() as u64,
        };
        self.offset += head.len() as u64 + data.len() as u64;

        Ok(part)
    }
}

fn read_varint(file: &mut File) -> Result<u64> {
    let mut lead = [0u8; 1];
    file.read_exact(&mut lead)?;

    let no_bytes = lead[0] as usize;
    if no_bytes > 8 {
        return Err(VarzipError::corrupt_archive("oversized metadata varint"));
    }

    let mut buf = [0u8; 8];
    file.read_exact(&mut buf[..no_bytes])?;

    let mut x = 0u64;
    for &b in &buf[..no_bytes] {
        x = (x << 8) | u64::from(b);
    }
    Ok(x)
}

type FooterIndex = (Vec<StreamEntry>, HashMap<String, usize>);

fn read_footer(file: &mut File) -> Result<FooterIndex> {
    let file_len = file.metadata()?.len();
    if file_len < 8 {
        return Err(VarzipError::corrupt_archive("file too short for a footer"));
    }

    file.seek(SeekFrom::End(-8))?;
    let mut trailer = [0u8; 8];
    file.read_exact(&mut trailer)?;
    let mut pos = 0usize;
    let footer_size = varint::get_fixed(&trailer, &mut pos, 8)?;

    if footer_size + 8 > file_len {
        return Err(VarzipError::corrupt_archive("footer size exceeds the file"));
    }

    file.seek(SeekFrom::End(-(8 + footer_size as i64)))?;
    let mut footer = vec![0u8; footer_size as usize];
    file.read_exact(&mut footer)?;

    let mut pos = 0usize;
    let no_streams = varint::get_uint(&footer, &mut pos)? as usize;

    let mut streams = Vec::with_capacity(no_streams);
    let mut by_name = HashMap::with_capacity(no_streams);

    for id in 0..no_streams {
        let name = varint::get_str(&footer, &mut pos)?;
        let no_parts = varint::get_uint(&footer, &mut pos)? as usize;
        let raw_size = varint::get_uint(&footer, &mut pos)?;

        // Two varints per part, at least one byte each.
        if no_parts > footer.len() - pos.min(footer.len()) {
            return Err(VarzipError::corrupt_archive("implausible part count"));
        }

        let mut parts = Vec::with_capacity(no_parts);
        for _ in 0..no_parts {
            let offset = varint::get_uint(&footer, &mut pos)?;
            let size = varint::get_uint(&footer, &mut pos)?;
            parts.push(Part { offset, size });
        }

        by_name.insert(name.clone(), id);
        streams.push(StreamEntry {
            name,
            parts,
            raw_size,
            cur_id: 0,
        });
    }

    Ok((streams, by_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("varzip_archive_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_roundtrip_parts_and_metadata() {
        let path = temp_path("roundtrip");

        let archive = Archive::create(&path).unwrap();
        let a = archive.register_stream("key_0_size").unwrap();
        let b = archive.register_stream("key_0_data").unwrap();

        archive.add_part(a, b"sizes-part-0", 12).unwrap();
        archive.add_part(b, b"data-part-0", 11).unwrap();
        archive.add_part(a, b"sizes-part-1", (1 << 30) + 7).unwrap();
        archive.add_part(b, &[], 0).unwrap();
        archive.set_raw_size(a, 999);
        archive.close().unwrap();

        let archive = Archive::open(&path).unwrap();
        let a = archive.require_stream("key_0_size").unwrap();
        let b = archive.require_stream("key_0_data").unwrap();
        assert_eq!(archive.raw_size(a), 999);

        assert_eq!(
            archive.get_part(a).unwrap().unwrap(),
            (b"sizes-part-0".to_vec(), 12)
        );
        assert_eq!(
            archive.get_part(a).unwrap().unwrap(),
            (b"sizes-part-1".to_vec(), (1 << 30) + 7)
        );
        assert!(archive.get_part(a).unwrap().is_none());

        assert_eq!(
            archive.get_part(b).unwrap().unwrap(),
            (b"data-part-0".to_vec(), 11)
        );
        assert_eq!(archive.get_part(b).unwrap().unwrap(), (Vec::new(), 0));

        archive.reset_part_iterator(b);
        assert_eq!(
            archive.get_part(b).unwrap().unwrap(),
            (b"data-part-0".to_vec(), 11)
        );

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reserved_slots_keep_order() {
        let path = temp_path("slots");

        let archive = Archive::create(&path).unwrap();
        let s = archive.register_stream("s").unwrap();

        let p0 = archive.add_part_prepare(s).unwrap();
        let p1 = archive.add_part_prepare(s).unwrap();
        assert_eq!((p0, p1), (0, 1));

        // Written out of order on disk; read back in slot order.
        archive.add_part_complete(s, p1, b"second", 2).unwrap();
        archive.add_part_complete(s, p0, b"first", 1).unwrap();
        archive.close().unwrap();

        let archive = Archive::open(&path).unwrap();
        let s = archive.require_stream("s").unwrap();
        assert_eq!(archive.get_part(s).unwrap().unwrap(), (b"first".to_vec(), 1));
        assert_eq!(archive.get_part(s).unwrap().unwrap(), (b"second".to_vec(), 2));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_duplicate_stream_rejected() {
        let path = temp_path("dup");
        let archive = Archive::create(&path).unwrap();
        archive.register_stream("x").unwrap();
        assert!(matches!(
            archive.register_stream("x"),
            Err(VarzipError::DuplicateStream { .. })
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_linked_stream_shares_parts() {
        let path = temp_path("link");

        let archive = Archive::create(&path).unwrap();
        let a = archive.register_stream("key_0_data").unwrap();
        archive.add_part(a, b"shared", 6).unwrap();
        archive.set_raw_size(a, 6);
        archive.link_stream("key_1_data", a).unwrap();
        archive.close().unwrap();

        let archive = Archive::open(&path).unwrap();
        let b = archive.require_stream("key_1_data").unwrap();
        assert_eq!(archive.get_part(b).unwrap().unwrap(), (b"shared".to_vec(), 6));
        assert_eq!(archive.raw_size(b), 6);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_missing_footer_rejected() {
        let path = temp_path("nofooter");
        std::fs::write(&path, b"abc").unwrap();
        assert!(Archive::open(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
