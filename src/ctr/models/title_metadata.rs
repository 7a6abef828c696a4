use crate::crypto::AesIv;
use crate::ctr::models::signature::SignatureData;
use crate::error::{TitleVaultError, TitleVaultResult};
use binrw::{BinRead, BinWrite};
use byteorder::{BigEndian, ByteOrder};
use std::io::Cursor;
use std::path::Path;

/// Index of the main executable content within a title.
pub const MAIN_CONTENT: usize = 0;

/// Title metadata lists every content a title consists of together with its
/// id, size, type flags and hash.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct TitleMetadata {
    /// Signature data; the hash for the signature covers the TMD header.
    pub signature_data: SignatureData,

    /// Title Metadata Header
    pub header: TitleMetadataHeader,

    /// Content info records; 64 exist, usually only the first is used.
    #[br(count = 64)]
    pub content_info_records: Vec<ContentInfoRecord>,

    /// One chunk record per content, counted by the header.
    #[br(count = header.content_count)]
    pub content_chunk_records: Vec<ContentChunkRecord>,
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct TitleMetadataHeader {
    /// Signature Issuer
    #[br(count = 0x40)]
    pub signature_issuer: Vec<u8>,

    /// Version
    pub version: u8,

    /// CaCrlVersion
    pub ca_crl_version: u8,

    /// SignerCrlVersion
    pub signer_crl_version: u8,

    /// Reserved
    pub reserved1: u8,

    /// System Version
    pub system_version: u64,

    /// Title ID
    pub title_id: u64,

    /// Title Type
    pub title_type: u32,

    /// Group ID
    pub group_id: u16,

    /// Save data size in bytes, little endian unlike its neighbors
    #[brw(little)]
    pub save_data_size: u32,

    /// SRL private save data size in bytes, little endian
    #[brw(little)]
    pub srl_private_save_data_size: u32,

    /// Reserved
    pub reserved2: u32,

    /// SRL Flag
    pub srl_flag: u8,

    /// Reserved
    #[br(count = 0x31)]
    pub reserved3: Vec<u8>,

    /// Access Rights
    pub access_rights: u32,

    /// Title Version
    pub title_version: u16,

    /// Content Count
    pub content_count: u16,

    /// Boot Content
    pub boot_content: u16,

    /// Padding
    pub padding: u16,

    /// SHA-256 hash over the content info records
    #[br(count = 0x20)]
    pub content_info_records_hash: Vec<u8>,
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct ContentInfoRecord {
    /// Content index offset
    pub content_index_offset: u16,

    /// Number of chunk records covered by this record's hash
    pub content_command_count: u16,

    /// SHA-256 hash of the covered chunk records
    #[br(count = 0x20)]
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct ContentChunkRecord {
    /// Content id, names the `<id>.app` file on disk
    pub content_id: u32,

    /// Content index, the logical position within the title
    pub content_index: u16,

    /// Content type flags
    pub content_type: ContentType,

    /// Content size
    pub content_size: u64,

    /// SHA-256 hash of the content
    #[br(count = 0x20)]
    pub hash: Vec<u8>,
}

/// Flags for a content chunk.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[brw(big)]
pub struct ContentType(pub u16);

impl ContentType {
    pub const ENCRYPTED: u16 = 0x0001;
    pub const DISC: u16 = 0x0002;
    pub const CFM: u16 = 0x0004;
    pub const OPTIONAL: u16 = 0x4000;
    pub const SHARED: u16 = 0x8000;

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn is_optional(&self) -> bool {
        self.0 & Self::OPTIONAL != 0
    }

    pub fn is_shared(&self) -> bool {
        self.0 & Self::SHARED != 0
    }
}

impl TitleMetadata {
    pub fn from_bytes(data: &[u8]) -> TitleVaultResult<TitleMetadata> {
        Ok(TitleMetadata::read(&mut Cursor::new(data))?)
    }

    pub fn load(path: &Path) -> TitleVaultResult<TitleMetadata> {
        let data = std::fs::read(path)
            .map_err(|_| TitleVaultError::NotFound(path.display().to_string()))?;
        TitleMetadata::from_bytes(&data)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut Cursor::new(&mut buf))
            .expect("TMD serialization cannot fail");
        buf
    }

    pub fn save(&self, path: &Path) -> TitleVaultResult<()> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }

    pub fn title_id(&self) -> u64 {
        self.header.title_id
    }

    pub fn title_version(&self) -> u16 {
        self.header.title_version
    }

    pub fn title_type(&self) -> u32 {
        self.header.title_type
    }

    pub fn content_count(&self) -> usize {
        self.content_chunk_records.len()
    }

    pub fn content_id(&self, position: usize) -> Option<u32> {
        self.content_chunk_records
            .get(position)
            .map(|record| record.content_id)
    }

    pub fn content_index(&self, position: usize) -> Option<u16> {
        self.content_chunk_records
            .get(position)
            .map(|record| record.content_index)
    }

    pub fn content_size(&self, position: usize) -> Option<u64> {
        self.content_chunk_records
            .get(position)
            .map(|record| record.content_size)
    }

    pub fn content_type(&self, position: usize) -> Option<ContentType> {
        self.content_chunk_records
            .get(position)
            .map(|record| record.content_type)
    }

    /// Counter used to decrypt the content at `position` with the title key:
    /// the content index in the first two bytes, the rest zero.
    pub fn content_ctr(&self, position: usize) -> Option<AesIv> {
        let record = self.content_chunk_records.get(position)?;
        let mut ctr = [0u8; 16];
        BigEndian::write_u16(&mut ctr[..2], record.content_index);
        Some(ctr)
    }

    pub fn has_encrypted_content(&self) -> bool {
        self.content_chunk_records
            .iter()
            .any(|record| record.content_type.is_encrypted())
    }

    pub fn combined_content_size(&self) -> u64 {
        self.content_chunk_records
            .iter()
            .map(|record| record.content_size)
            .sum()
    }
}
