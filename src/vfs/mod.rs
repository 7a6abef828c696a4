//! Byte-level file abstraction. Storage layers (per-console encryption,
//! seekable compression) each implement [`ByteFile`] over another
//! [`ByteFile`]; composition is explicit at the call site.

pub mod crypto_file;
pub mod z3ds;

use crate::error::TitleVaultResult;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub trait ByteFile: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> TitleVaultResult<usize>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize>;

    fn seek(&mut self, pos: SeekFrom) -> TitleVaultResult<u64>;

    fn size(&mut self) -> TitleVaultResult<u64>;

    fn close(&mut self) -> TitleVaultResult<()>;
}

/// Unencrypted, uncompressed file at the bottom of every stack.
pub struct PlainFile {
    file: File,
}

impl PlainFile {
    pub fn create(path: &Path) -> TitleVaultResult<PlainFile> {
        Ok(PlainFile {
            file: OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        })
    }

    pub fn open(path: &Path) -> TitleVaultResult<PlainFile> {
        Ok(PlainFile {
            file: File::open(path)?,
        })
    }
}

impl ByteFile for PlainFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> TitleVaultResult<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let read = self.file.read(&mut buf[total..])?;
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> TitleVaultResult<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn size(&mut self) -> TitleVaultResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn close(&mut self) -> TitleVaultResult<()> {
        self.file.flush()?;
        Ok(())
    }
}
