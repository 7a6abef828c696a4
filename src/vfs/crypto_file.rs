use crate::crypto::{self, AesIv, AesKey};
use crate::error::{TitleVaultError, TitleVaultResult};
use crate::unique::{self, UniqueCryptoFileId};
use crate::vfs::ByteFile;
use std::io::SeekFrom;

/// Transparent AES-CTR layer over another file. Writes encrypt before
/// forwarding, reads decrypt after fetching; the keystream position is
/// always the file offset, so random access works on both sides.
pub struct CryptoFile {
    inner: Box<dyn ByteFile>,
    key: AesKey,
    ctr: AesIv,
}

impl CryptoFile {
    /// Wraps `inner` with the per-console key for `purpose`. Fails when no
    /// valid console-unique data is loaded.
    pub fn wrap(inner: Box<dyn ByteFile>, purpose: UniqueCryptoFileId) -> TitleVaultResult<CryptoFile> {
        let (key, ctr) = unique::unique_file_key(purpose).ok_or(TitleVaultError::InvalidState)?;
        Ok(CryptoFile::with_key(inner, key, ctr))
    }

    pub fn with_key(inner: Box<dyn ByteFile>, key: AesKey, ctr: AesIv) -> CryptoFile {
        CryptoFile { inner, key, ctr }
    }
}

impl ByteFile for CryptoFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> TitleVaultResult<usize> {
        let read = self.inner.read_at(offset, buf)?;
        crypto::ctr_apply(&self.key, &self.ctr, offset, &mut buf[..read]);
        Ok(read)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize> {
        let mut encrypted = buf.to_vec();
        crypto::ctr_apply(&self.key, &self.ctr, offset, &mut encrypted);
        self.inner.write_at(offset, &encrypted)
    }

    fn seek(&mut self, pos: SeekFrom) -> TitleVaultResult<u64> {
        self.inner.seek(pos)
    }

    fn size(&mut self) -> TitleVaultResult<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> TitleVaultResult<()> {
        self.inner.close()
    }
}
