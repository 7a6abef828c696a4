use crate::ctr::models::ticket::Ticket;
use crate::ctr::models::title_metadata::TitleMetadata;
use crate::ctr::util::align_64;
use crate::error::{TitleVaultError, TitleVaultResult};
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

pub const CIA_HEADER_SIZE: u64 = 0x2020;

/// Fixed-size header of an installable archive. Scalars are little endian;
/// the crypto structures that follow are big endian.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct CiaHeader {
    pub header_size: u32,
    pub cia_type: u16,
    pub version: u16,
    pub cert_chain_size: u32,
    pub ticket_size: u32,
    pub tmd_size: u32,
    pub meta_size: u32,
    pub content_size: u64,
    /// Bitmap of content indices present in the archive.
    #[br(count = 0x2000)]
    pub content_index: Vec<u8>,
}

impl CiaHeader {
    pub fn empty() -> CiaHeader {
        CiaHeader {
            header_size: CIA_HEADER_SIZE as u32,
            cia_type: 0,
            version: 0,
            cert_chain_size: 0,
            ticket_size: 0,
            tmd_size: 0,
            meta_size: 0,
            content_size: 0,
            content_index: vec![0; 0x2000],
        }
    }

    pub fn set_content_present(&mut self, content_index: usize) {
        let byte_index = content_index / 8;
        let bit_index = 7 - (content_index % 8);
        if byte_index < self.content_index.len() {
            self.content_index[byte_index] |= 1 << bit_index;
        }
    }

    pub fn content_present(&self, content_index: usize) -> bool {
        let byte_index = content_index / 8;
        let bit_index = 7 - (content_index % 8);
        self.content_index
            .get(byte_index)
            .is_some_and(|byte| byte & (1 << bit_index) != 0)
    }

    /// Section offsets: each block starts at the previous block's end
    /// rounded up to 0x40.
    pub fn cert_offset(&self) -> u64 {
        align_64(self.header_size as u64)
    }

    pub fn ticket_offset(&self) -> u64 {
        align_64(self.cert_offset() + self.cert_chain_size as u64)
    }

    pub fn tmd_offset(&self) -> u64 {
        align_64(self.ticket_offset() + self.ticket_size as u64)
    }

    pub fn content_offset(&self) -> u64 {
        align_64(self.tmd_offset() + self.tmd_size as u64)
    }

    pub fn meta_offset(&self) -> u64 {
        align_64(self.content_offset() + self.content_size)
    }
}

/// Optional trailing block with dependencies, core version and the icon.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct MetaData {
    #[br(count = 0x180)]
    pub dependency_list: Vec<u8>,
    #[br(count = 0x180)]
    pub reserved1: Vec<u8>,
    pub core_version: u32,
    #[br(count = 0xFC)]
    pub reserved2: Vec<u8>,
    /// System-menu icon data (SMDH)
    #[br(count = 0x36C0)]
    pub icon_data: Vec<u8>,
}

/// Progressively populated view of an installable archive. The streaming
/// installer fills it section by section as bytes arrive; whole-file readers
/// populate it in one go.
#[derive(Debug, Clone, Default)]
pub struct CiaContainer {
    header: Option<CiaHeader>,
    ticket: Option<Ticket>,
    tmd: Option<TitleMetadata>,
    meta: Option<MetaData>,
}

impl CiaContainer {
    pub fn load_header(&mut self, data: &[u8]) -> TitleVaultResult<()> {
        let header = CiaHeader::read(&mut Cursor::new(data))?;
        if header.header_size as u64 != CIA_HEADER_SIZE {
            return Err(TitleVaultError::InvalidFormat("bad archive header size"));
        }
        self.header = Some(header);
        Ok(())
    }

    pub fn load_ticket(&mut self, data: &[u8], offset: usize) -> TitleVaultResult<()> {
        let slice = data
            .get(offset..)
            .ok_or(TitleVaultError::InvalidFormat("ticket out of bounds"))?;
        self.ticket = Some(Ticket::from_bytes(slice)?);
        Ok(())
    }

    pub fn provide_ticket(&mut self, ticket: Ticket) {
        self.ticket = Some(ticket);
    }

    pub fn load_title_metadata(&mut self, data: &[u8], offset: usize) -> TitleVaultResult<()> {
        let slice = data
            .get(offset..)
            .ok_or(TitleVaultError::InvalidFormat("TMD out of bounds"))?;
        self.tmd = Some(TitleMetadata::from_bytes(slice)?);
        Ok(())
    }

    pub fn provide_title_metadata(&mut self, tmd: TitleMetadata) {
        self.tmd = Some(tmd);
    }

    pub fn load_meta(&mut self, data: &[u8], offset: usize) -> TitleVaultResult<()> {
        let slice = data
            .get(offset..)
            .ok_or(TitleVaultError::InvalidFormat("meta block out of bounds"))?;
        self.meta = Some(MetaData::read(&mut Cursor::new(slice))?);
        Ok(())
    }

    pub fn header(&self) -> TitleVaultResult<&CiaHeader> {
        self.header
            .as_ref()
            .ok_or(TitleVaultError::InvalidState)
    }

    pub fn ticket(&self) -> TitleVaultResult<&Ticket> {
        self.ticket
            .as_ref()
            .ok_or(TitleVaultError::InvalidState)
    }

    pub fn ticket_mut(&mut self) -> TitleVaultResult<&mut Ticket> {
        self.ticket
            .as_mut()
            .ok_or(TitleVaultError::InvalidState)
    }

    pub fn tmd(&self) -> TitleVaultResult<&TitleMetadata> {
        self.tmd.as_ref().ok_or(TitleVaultError::InvalidState)
    }

    pub fn meta(&self) -> Option<&MetaData> {
        self.meta.as_ref()
    }

    pub fn content_offset(&self) -> u64 {
        self.header
            .as_ref()
            .map(|header| header.content_offset())
            .unwrap_or(u64::MAX)
    }

    /// Absolute archive offset of content at `position`, skipping the
    /// aligned sizes of all earlier contents.
    pub fn content_data_offset(&self, position: usize) -> Option<u64> {
        let header = self.header.as_ref()?;
        let tmd = self.tmd.as_ref()?;
        let mut offset = header.content_offset();
        for earlier in 0..position {
            offset += align_64(tmd.content_size(earlier)?);
        }
        Some(offset)
    }

    pub fn content_size(&self, position: usize) -> u64 {
        self.tmd
            .as_ref()
            .and_then(|tmd| tmd.content_size(position))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctr::models::title_metadata::tests::sample_tmd;

    fn sample_header() -> CiaHeader {
        let mut header = CiaHeader::empty();
        header.cert_chain_size = 0x0A00;
        header.ticket_size = 0x0350;
        header.tmd_size = 0x0B34;
        header.content_size = 0x8000;
        header
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.write(&mut Cursor::new(&mut buf)).unwrap();
        assert_eq!(buf.len() as u64, CIA_HEADER_SIZE);

        let read_back = CiaHeader::read(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(read_back.cert_chain_size, 0x0A00);
        assert_eq!(read_back.content_size, 0x8000);
    }

    #[test]
    fn section_offsets_are_aligned() {
        let header = sample_header();
        assert_eq!(header.cert_offset(), 0x2040);
        assert_eq!(header.ticket_offset(), 0x2A40);
        assert_eq!(header.tmd_offset(), 0x2DC0);
        assert_eq!(header.content_offset(), 0x3900);
        assert_eq!(header.meta_offset(), 0xB900);
    }

    #[test]
    fn content_index_bitmap() {
        let mut header = CiaHeader::empty();
        header.set_content_present(0);
        header.set_content_present(9);

        assert!(header.content_present(0));
        assert!(header.content_present(9));
        assert!(!header.content_present(1));
        assert_eq!(header.content_index[0], 0x80);
        assert_eq!(header.content_index[1], 0x40);
    }

    #[test]
    fn content_data_offsets_skip_aligned_sizes() {
        let mut container = CiaContainer::default();
        let mut buf = Vec::new();
        sample_header().write(&mut Cursor::new(&mut buf)).unwrap();
        container.load_header(&buf).unwrap();
        container.provide_title_metadata(sample_tmd(&[(0, 0, 0, 0x123), (1, 1, 0, 0x40)]));

        let base = container.content_offset();
        assert_eq!(container.content_data_offset(0), Some(base));
        assert_eq!(container.content_data_offset(1), Some(base + 0x140));
    }
}
