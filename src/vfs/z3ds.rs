//! Z3DS: a random-access compressed container. A fixed 0x20 header names
//! the wrapped file's magic, a typed key-value metadata block follows, then
//! independent zstd frames with a trailing seekable seek-table. The header
//! is rewritten on close once the final sizes are known.

use crate::ctr::util::align_up;
use crate::error::{TitleVaultError, TitleVaultResult};
use crate::vfs::ByteFile;
use binrw::{BinRead, BinWrite};
use byteorder::{ByteOrder, LittleEndian};
use log::error;
use std::io::{Cursor, SeekFrom};
use std::sync::Mutex;

pub const Z3DS_MAGIC: [u8; 4] = *b"Z3DS";
pub const Z3DS_VERSION: u8 = 1;
pub const Z3DS_HEADER_SIZE: usize = 0x20;

pub const DEFAULT_FRAME_SIZE: usize = 256 * 1024;
pub const DEFAULT_CIA_FRAME_SIZE: usize = 32 * 1024 * 1024;
/// Passing zero lets the format maximum (1 GiB per frame) apply.
pub const MAX_FRAME_SIZE: usize = 0;

const FORMAT_MAX_FRAME_SIZE: usize = 0x4000_0000;

const SKIPPABLE_FRAME_MAGIC: u32 = 0x184D2A5E;
const SEEKABLE_FOOTER_MAGIC: u32 = 0x8F92EAB1;
const SEEK_TABLE_FOOTER_SIZE: usize = 9;
const CHECKSUM_FLAG: u8 = 1 << 7;

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct Z3dsHeader {
    pub magic: [u8; 4],
    pub underlying_magic: [u8; 4],
    pub version: u8,
    pub reserved: u8,
    pub header_size: u16,
    pub metadata_size: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl Z3dsHeader {
    fn new(underlying_magic: [u8; 4]) -> Z3dsHeader {
        Z3dsHeader {
            magic: Z3DS_MAGIC,
            underlying_magic,
            version: Z3DS_VERSION,
            reserved: 0,
            header_size: Z3DS_HEADER_SIZE as u16,
            metadata_size: 0,
            compressed_size: 0,
            uncompressed_size: 0,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Z3DS_HEADER_SIZE);
        self.write(&mut Cursor::new(&mut buf))
            .expect("header serialization cannot fail");
        buf
    }

    fn is_valid(&self) -> bool {
        self.magic == Z3DS_MAGIC && self.version == Z3DS_VERSION
    }
}

pub const METADATA_VERSION: u8 = 1;
const METADATA_ITEM_BINARY: u8 = 1;

/// Typed key-value metadata. Only the binary item type exists so far;
/// unknown types are skipped on read for forward compatibility.
#[derive(Debug, Clone, Default)]
pub struct Z3dsMetadata {
    items: Vec<(String, Vec<u8>)>,
}

impl Z3dsMetadata {
    pub fn from_bytes(data: &[u8]) -> Z3dsMetadata {
        let mut metadata = Z3dsMetadata::default();
        if data.is_empty() || data[0] != METADATA_VERSION {
            return metadata;
        }

        let mut pos = 1usize;
        while pos + 4 <= data.len() {
            let item_type = data[pos];
            if item_type == 0 {
                break;
            }
            let name_len = data[pos + 1] as usize;
            let data_len = LittleEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
            pos += 4;
            if pos + name_len + data_len > data.len() {
                break;
            }
            if item_type == METADATA_ITEM_BINARY {
                let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
                let value = data[pos + name_len..pos + name_len + data_len].to_vec();
                metadata.items.push((name, value));
            }
            pos += name_len + data_len;
        }
        metadata
    }

    pub fn as_binary(&self) -> Vec<u8> {
        if self.items.is_empty() {
            return Vec::new();
        }
        let mut out = vec![METADATA_VERSION];
        for (name, value) in &self.items {
            let name_len = name.len().min(0xFF);
            let data_len = value.len().min(0xFFFF);
            out.push(METADATA_ITEM_BINARY);
            out.push(name_len as u8);
            out.extend_from_slice(&(data_len as u16).to_le_bytes());
            out.extend_from_slice(&name.as_bytes()[..name_len]);
            out.extend_from_slice(&value[..data_len]);
        }
        out.extend_from_slice(&[0u8; 4]);
        out
    }

    pub fn add(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        self.items.push((name.to_string(), data.into()));
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(item_name, _)| item_name == name)
            .map(|(_, value)| value.as_slice())
    }
}

fn build_seek_table(frames: &[(u32, u32)]) -> Vec<u8> {
    let payload_len = frames.len() * 8 + SEEK_TABLE_FOOTER_SIZE;
    let mut out = Vec::with_capacity(8 + payload_len);
    out.extend_from_slice(&SKIPPABLE_FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&(payload_len as u32).to_le_bytes());
    for &(compressed, decompressed) in frames {
        out.extend_from_slice(&compressed.to_le_bytes());
        out.extend_from_slice(&decompressed.to_le_bytes());
    }
    out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    out.push(0); // no per-frame checksums
    out.extend_from_slice(&SEEKABLE_FOOTER_MAGIC.to_le_bytes());
    out
}

/// Sequential-write side. Bytes are buffered into frames of at most
/// `frame_size` uncompressed bytes; each frame compresses independently so
/// the read side can seek.
pub struct Z3dsWriteFile {
    inner: Box<dyn ByteFile>,
    header: Z3dsHeader,
    metadata: Z3dsMetadata,
    preamble_written: bool,
    frame_size: usize,
    frame_buf: Vec<u8>,
    frames: Vec<(u32, u32)>,
    written_uncompressed: u64,
    written_compressed: u64,
    inner_pos: u64,
    closed: bool,
}

impl Z3dsWriteFile {
    pub fn new(
        inner: Box<dyn ByteFile>,
        underlying_magic: [u8; 4],
        frame_size: usize,
    ) -> Z3dsWriteFile {
        let frame_size = if frame_size == 0 {
            FORMAT_MAX_FRAME_SIZE
        } else {
            frame_size.min(FORMAT_MAX_FRAME_SIZE)
        };

        let mut metadata = Z3dsMetadata::default();
        metadata.add(
            "compressor",
            format!("titlevault {}", env!("CARGO_PKG_VERSION")),
        );
        metadata.add(
            "date",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        metadata.add("maxframesize", frame_size.to_string());

        Z3dsWriteFile {
            inner,
            header: Z3dsHeader::new(underlying_magic),
            metadata,
            preamble_written: false,
            frame_size,
            frame_buf: Vec::new(),
            frames: Vec::new(),
            written_uncompressed: 0,
            written_compressed: 0,
            inner_pos: 0,
            closed: false,
        }
    }

    /// Extra metadata can be added until the first content byte arrives.
    pub fn metadata_mut(&mut self) -> &mut Z3dsMetadata {
        &mut self.metadata
    }

    fn write_preamble(&mut self) -> TitleVaultResult<()> {
        if self.preamble_written {
            return Ok(());
        }
        self.preamble_written = true;

        self.inner.write_at(0, &[0u8; Z3DS_HEADER_SIZE])?;
        self.inner_pos = Z3DS_HEADER_SIZE as u64;

        let binary = self.metadata.as_binary();
        if !binary.is_empty() {
            let padded_len = align_up(binary.len() as u64, 0x10) as usize;
            let mut padded = binary;
            padded.resize(padded_len, 0);
            self.inner.write_at(self.inner_pos, &padded)?;
            self.header.metadata_size = padded_len as u32;
            self.inner_pos += padded_len as u64;
        }
        Ok(())
    }

    fn flush_frame(&mut self, len: usize) -> TitleVaultResult<()> {
        if len == 0 {
            return Ok(());
        }
        let chunk: Vec<u8> = self.frame_buf.drain(..len).collect();
        let compressed = zstd::bulk::compress(&chunk, 0).map_err(|err| {
            error!("zstd frame compression error: {err}");
            TitleVaultError::Io(err)
        })?;
        self.inner.write_at(self.inner_pos, &compressed)?;
        self.inner_pos += compressed.len() as u64;
        self.written_compressed += compressed.len() as u64;
        self.frames.push((compressed.len() as u32, chunk.len() as u32));
        Ok(())
    }
}

impl ByteFile for Z3dsWriteFile {
    fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> TitleVaultResult<usize> {
        Err(TitleVaultError::InvalidState)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize> {
        if offset != self.written_uncompressed {
            return Err(TitleVaultError::InvalidState);
        }
        self.write_preamble()?;

        self.frame_buf.extend_from_slice(buf);
        while self.frame_buf.len() >= self.frame_size {
            self.flush_frame(self.frame_size)?;
        }
        self.written_uncompressed += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, _pos: SeekFrom) -> TitleVaultResult<u64> {
        Err(TitleVaultError::InvalidState)
    }

    fn size(&mut self) -> TitleVaultResult<u64> {
        Ok(self.written_uncompressed)
    }

    fn close(&mut self) -> TitleVaultResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.write_preamble()?;
        let remaining = self.frame_buf.len();
        self.flush_frame(remaining)?;

        let table = build_seek_table(&self.frames);
        self.inner.write_at(self.inner_pos, &table)?;
        self.written_compressed += table.len() as u64;

        self.header.compressed_size = self.written_compressed;
        self.header.uncompressed_size = self.written_uncompressed;
        self.inner.write_at(0, &self.header.serialize())?;

        self.inner.close()
    }
}

impl Drop for Z3dsWriteFile {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

struct FrameEntry {
    compressed_offset: u64,
    compressed_size: u32,
    uncompressed_offset: u64,
    uncompressed_size: u32,
}

/// Random-access read side. The underlying decompressor state (a one-frame
/// cache) is not shareable, so reads serialize on a mutex.
pub struct Z3dsReadFile {
    inner: Box<dyn ByteFile>,
    header: Z3dsHeader,
    metadata: Z3dsMetadata,
    frames: Vec<FrameEntry>,
    cursor: u64,
    cache: Mutex<Option<(usize, Vec<u8>)>>,
}

impl Z3dsReadFile {
    /// Reads the first 0x20 bytes and, when they form a valid header,
    /// returns the wrapped file's magic. Lets installers detect compressed
    /// inputs transparently.
    pub fn peek_underlying_magic(file: &mut dyn ByteFile) -> Option<[u8; 4]> {
        let mut raw = [0u8; Z3DS_HEADER_SIZE];
        if file.read_at(0, &mut raw).ok()? != Z3DS_HEADER_SIZE {
            return None;
        }
        let header = Z3dsHeader::read(&mut Cursor::new(&raw)).ok()?;
        header.is_valid().then_some(header.underlying_magic)
    }

    pub fn open(mut inner: Box<dyn ByteFile>) -> TitleVaultResult<Z3dsReadFile> {
        let mut raw = [0u8; Z3DS_HEADER_SIZE];
        if inner.read_at(0, &mut raw)? != Z3DS_HEADER_SIZE {
            return Err(TitleVaultError::InvalidFormat("truncated header"));
        }
        let header = Z3dsHeader::read(&mut Cursor::new(&raw))
            .map_err(|_| TitleVaultError::InvalidFormat("bad header"))?;
        if !header.is_valid() {
            return Err(TitleVaultError::InvalidFormat("bad magic or version"));
        }

        let metadata = if header.metadata_size != 0 {
            let mut buf = vec![0u8; header.metadata_size as usize];
            inner.read_at(header.header_size as u64, &mut buf)?;
            Z3dsMetadata::from_bytes(&buf)
        } else {
            Z3dsMetadata::default()
        };

        let file_size = inner.size()?;
        if file_size < SEEK_TABLE_FOOTER_SIZE as u64 {
            return Err(TitleVaultError::InvalidFormat("missing seek table"));
        }
        let mut footer = [0u8; SEEK_TABLE_FOOTER_SIZE];
        inner.read_at(file_size - SEEK_TABLE_FOOTER_SIZE as u64, &mut footer)?;
        if LittleEndian::read_u32(&footer[5..9]) != SEEKABLE_FOOTER_MAGIC {
            return Err(TitleVaultError::InvalidFormat("missing seek table"));
        }
        let frame_count = LittleEndian::read_u32(&footer[0..4]) as usize;
        let descriptor = footer[4];
        let entry_size = if descriptor & CHECKSUM_FLAG != 0 { 12 } else { 8 };

        let table_len = frame_count * entry_size;
        let table_start = file_size
            .checked_sub((SEEK_TABLE_FOOTER_SIZE + table_len) as u64)
            .ok_or(TitleVaultError::InvalidFormat("bad seek table"))?;
        let mut table = vec![0u8; table_len];
        inner.read_at(table_start, &mut table)?;

        let mut frames = Vec::with_capacity(frame_count);
        let mut compressed_offset = header.header_size as u64 + header.metadata_size as u64;
        let mut uncompressed_offset = 0u64;
        for i in 0..frame_count {
            let entry = &table[i * entry_size..];
            let compressed_size = LittleEndian::read_u32(&entry[0..4]);
            let uncompressed_size = LittleEndian::read_u32(&entry[4..8]);
            frames.push(FrameEntry {
                compressed_offset,
                compressed_size,
                uncompressed_offset,
                uncompressed_size,
            });
            compressed_offset += compressed_size as u64;
            uncompressed_offset += uncompressed_size as u64;
        }

        Ok(Z3dsReadFile {
            inner,
            header,
            metadata,
            frames,
            cursor: 0,
            cache: Mutex::new(None),
        })
    }

    pub fn underlying_magic(&self) -> [u8; 4] {
        self.header.underlying_magic
    }

    pub fn metadata(&self) -> &Z3dsMetadata {
        &self.metadata
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_size
    }

    /// Sequential read advancing the internal cursor.
    pub fn read(&mut self, buf: &mut [u8]) -> TitleVaultResult<usize> {
        let read = self.read_at(self.cursor, buf)?;
        self.cursor += read as u64;
        Ok(read)
    }

    fn frame_index_for(&self, offset: u64) -> Option<usize> {
        if self.frames.is_empty() {
            return None;
        }
        let index = self
            .frames
            .partition_point(|frame| frame.uncompressed_offset <= offset);
        let candidate = index.checked_sub(1)?;
        let frame = &self.frames[candidate];
        (offset < frame.uncompressed_offset + frame.uncompressed_size as u64).then_some(candidate)
    }
}

impl ByteFile for Z3dsReadFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> TitleVaultResult<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            let position = offset + total as u64;
            let Some(index) = self.frame_index_for(position) else {
                break;
            };

            // The decompressor cache is not thread safe; serialize access.
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if cache.as_ref().map(|(cached, _)| *cached) != Some(index) {
                let frame = &self.frames[index];
                let mut compressed = vec![0u8; frame.compressed_size as usize];
                let read = self.inner.read_at(frame.compressed_offset, &mut compressed)?;
                if read != compressed.len() {
                    return Err(TitleVaultError::InvalidFormat("truncated frame"));
                }
                let decompressed =
                    zstd::bulk::decompress(&compressed, frame.uncompressed_size as usize)
                        .map_err(|err| {
                            error!("zstd frame decompression error: {err}");
                            TitleVaultError::Io(err)
                        })?;
                *cache = Some((index, decompressed));
            }

            let frame = &self.frames[index];
            let data = &cache.as_ref().unwrap().1;
            let inside = (position - frame.uncompressed_offset) as usize;
            let take = (data.len() - inside).min(buf.len() - total);
            buf[total..total + take].copy_from_slice(&data[inside..inside + take]);
            total += take;
        }
        Ok(total)
    }

    fn write_at(&mut self, _offset: u64, _buf: &[u8]) -> TitleVaultResult<usize> {
        Err(TitleVaultError::InvalidState)
    }

    fn seek(&mut self, pos: SeekFrom) -> TitleVaultResult<u64> {
        let base = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.cursor as i64 + delta,
            SeekFrom::End(delta) => self.header.uncompressed_size as i64 + delta,
        };
        if base < 0 {
            return Err(TitleVaultError::InvalidArgument("seek before start"));
        }
        self.cursor = base as u64;
        Ok(self.cursor)
    }

    fn size(&mut self) -> TitleVaultResult<u64> {
        Ok(self.header.uncompressed_size)
    }

    fn close(&mut self) -> TitleVaultResult<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::PlainFile;
    use tempfile::tempdir;

    fn compress_to_file(path: &std::path::Path, payload: &[u8], frame_size: usize) {
        let inner = Box::new(PlainFile::create(path).unwrap());
        let mut writer = Z3dsWriteFile::new(inner, *b"NCCH", frame_size);
        writer.metadata_mut().add("origin", "unit-test");

        // Feed in uneven chunks to exercise the frame buffering.
        let mut offset = 0u64;
        for chunk in payload.chunks(1000) {
            writer.write_at(offset, chunk).unwrap();
            offset += chunk.len() as u64;
        }
        writer.close().unwrap();
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn roundtrip_with_multiple_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.z3ds");
        let payload = patterned(10_000);
        compress_to_file(&path, &payload, 4096);

        let mut reader = Z3dsReadFile::open(Box::new(PlainFile::open(&path).unwrap())).unwrap();
        assert_eq!(reader.underlying_magic(), *b"NCCH");
        assert_eq!(reader.uncompressed_size(), 10_000);
        assert_eq!(reader.metadata().get("origin").unwrap(), b"unit-test");
        assert!(reader.metadata().get("compressor").is_some());
        assert!(reader.metadata().get("date").is_some());
        assert_eq!(reader.metadata().get("maxframesize").unwrap(), b"4096");

        let mut all = vec![0u8; 10_000];
        assert_eq!(reader.read_at(0, &mut all).unwrap(), 10_000);
        assert_eq!(all, payload);
    }

    #[test]
    fn reads_at_arbitrary_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.z3ds");
        let payload = patterned(9_500);
        compress_to_file(&path, &payload, 2048);

        let mut reader = Z3dsReadFile::open(Box::new(PlainFile::open(&path).unwrap())).unwrap();
        for offset in [0usize, 1, 2047, 2048, 2049, 5000, 9_400] {
            let mut buf = vec![0u8; 100];
            let read = reader.read_at(offset as u64, &mut buf).unwrap();
            let expected = (9_500 - offset).min(100);
            assert_eq!(read, expected);
            assert_eq!(&buf[..read], &payload[offset..offset + read]);
        }

        // Past the end yields zero bytes.
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_at(20_000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sequential_read_and_seek() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.z3ds");
        let payload = patterned(5_000);
        compress_to_file(&path, &payload, 1024);

        let mut reader = Z3dsReadFile::open(Box::new(PlainFile::open(&path).unwrap())).unwrap();
        let mut first = vec![0u8; 3000];
        reader.read(&mut first).unwrap();
        assert_eq!(first, payload[..3000]);

        let mut rest = vec![0u8; 2000];
        reader.read(&mut rest).unwrap();
        assert_eq!(rest, payload[3000..]);

        reader.seek(SeekFrom::End(-100)).unwrap();
        let mut tail = vec![0u8; 100];
        assert_eq!(reader.read(&mut tail).unwrap(), 100);
        assert_eq!(tail, payload[4900..]);

        assert!(reader.seek(SeekFrom::Current(-20_000)).is_err());
    }

    #[test]
    fn magic_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("probe.z3ds");
        compress_to_file(&path, b"content", DEFAULT_FRAME_SIZE);

        let mut file = PlainFile::open(&path).unwrap();
        assert_eq!(Z3dsReadFile::peek_underlying_magic(&mut file), Some(*b"NCCH"));

        let plain_path = dir.path().join("plain.bin");
        let mut plain = PlainFile::create(&plain_path).unwrap();
        plain.write_at(0, &[0u8; 0x40]).unwrap();
        assert_eq!(Z3dsReadFile::peek_underlying_magic(&mut plain), None);
    }

    #[test]
    fn header_records_final_sizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sizes.z3ds");
        let payload = patterned(3_000);
        compress_to_file(&path, &payload, 1024);

        let mut raw = PlainFile::open(&path).unwrap();
        let mut head = [0u8; Z3DS_HEADER_SIZE];
        raw.read_at(0, &mut head).unwrap();
        let header = Z3dsHeader::read(&mut Cursor::new(&head)).unwrap();

        assert_eq!(header.uncompressed_size, 3_000);
        assert!(header.compressed_size > 0);
        assert_eq!(header.metadata_size % 0x10, 0);
        // Compressed stream spans from after the metadata to the file end.
        let file_len = raw.size().unwrap();
        assert_eq!(
            header.compressed_size,
            file_len - header.header_size as u64 - header.metadata_size as u64
        );
    }

    #[test]
    fn metadata_binary_roundtrip() {
        let mut metadata = Z3dsMetadata::default();
        metadata.add("alpha", b"1".to_vec());
        metadata.add("beta", vec![0u8; 300]);

        let binary = metadata.as_binary();
        let reparsed = Z3dsMetadata::from_bytes(&binary);
        assert_eq!(reparsed.get("alpha").unwrap(), b"1");
        assert_eq!(reparsed.get("beta").unwrap().len(), 300);
        assert_eq!(reparsed.get("gamma"), None);
    }

    #[test]
    fn empty_payload_still_produces_valid_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.z3ds");

        let inner = Box::new(PlainFile::create(&path).unwrap());
        let mut writer = Z3dsWriteFile::new(inner, *b"CIA\0", DEFAULT_FRAME_SIZE);
        writer.close().unwrap();

        let mut reader = Z3dsReadFile::open(Box::new(PlainFile::open(&path).unwrap())).unwrap();
        assert_eq!(reader.uncompressed_size(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(0, &mut buf).unwrap(), 0);
    }
}
