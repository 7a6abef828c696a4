use binrw::{BinRead, BinWrite};
use std::io::Cursor;

pub const NCCH_MAGIC: [u8; 4] = *b"NCCH";
pub const NCCH_HEADER_SIZE: usize = 0x200;

/// Content-container header. All scalars little endian; offsets and sizes
/// are in media units except in the prototype layout.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct NcchHeader {
    /// RSA signature over the header; its first 16 bytes double as the
    /// primary key Y for region decryption.
    #[br(count = 0x100)]
    pub signature: Vec<u8>,

    pub magic: [u8; 4],

    /// Content size in media units
    pub content_size: u32,

    pub partition_id: [u8; 8],

    pub maker_code: u16,

    /// Header format version, selects the counter derivation scheme
    pub version: u16,

    /// Hash snippet used to validate a seed against this container
    pub seed_check: u32,

    pub program_id: u64,

    #[br(count = 0x10)]
    pub reserved1: Vec<u8>,

    #[br(count = 0x20)]
    pub logo_hash: Vec<u8>,

    #[br(count = 0x10)]
    pub product_code: Vec<u8>,

    #[br(count = 0x20)]
    pub extended_header_hash: Vec<u8>,

    /// Extended header size in bytes; zero when absent
    pub extended_header_size: u32,

    pub reserved2: u32,

    /// flags[3] selects the secondary key slot, flags[7] carries the
    /// crypto bits.
    pub flags: [u8; 8],

    pub plain_offset: u32,
    pub plain_size: u32,
    pub logo_offset: u32,
    pub logo_size: u32,
    pub exefs_offset: u32,
    pub exefs_size: u32,
    pub exefs_hash_size: u32,
    pub reserved3: u32,
    pub romfs_offset: u32,
    pub romfs_size: u32,
    pub romfs_hash_size: u32,
    pub reserved4: u32,

    #[br(count = 0x20)]
    pub exefs_hash: Vec<u8>,

    #[br(count = 0x20)]
    pub romfs_hash: Vec<u8>,
}

const FLAG_FIXED_KEY: u8 = 1 << 0;
const FLAG_NO_CRYPTO: u8 = 1 << 2;
const FLAG_SEED_CRYPTO: u8 = 1 << 5;

impl NcchHeader {
    pub fn from_bytes(data: &[u8]) -> binrw::BinResult<NcchHeader> {
        NcchHeader::read(&mut Cursor::new(data))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NCCH_HEADER_SIZE);
        self.write(&mut Cursor::new(&mut buf))
            .expect("NCCH header serialization cannot fail");
        buf
    }

    pub fn is_ncch(&self) -> bool {
        self.magic == NCCH_MAGIC
    }

    pub fn fixed_key(&self) -> bool {
        self.flags[7] & FLAG_FIXED_KEY != 0
    }

    pub fn no_crypto(&self) -> bool {
        self.flags[7] & FLAG_NO_CRYPTO != 0
    }

    pub fn set_no_crypto(&mut self, value: bool) {
        if value {
            self.flags[7] |= FLAG_NO_CRYPTO;
        } else {
            self.flags[7] &= !FLAG_NO_CRYPTO;
        }
    }

    pub fn seed_crypto(&self) -> bool {
        self.flags[7] & FLAG_SEED_CRYPTO != 0
    }

    pub fn secondary_key_slot(&self) -> u8 {
        self.flags[3]
    }

    /// Primary key Y: the leading 16 bytes of the header signature.
    pub fn key_y_primary(&self) -> [u8; 16] {
        self.signature[..16].try_into().unwrap()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub(crate) fn sample_header() -> NcchHeader {
        NcchHeader {
            signature: (0u8..=0xFF).collect(),
            magic: NCCH_MAGIC,
            content_size: 0x100,
            partition_id: [0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE],
            maker_code: 0,
            version: 2,
            seed_check: 0,
            program_id: 0x0004000000030000,
            reserved1: vec![0; 0x10],
            logo_hash: vec![0; 0x20],
            product_code: vec![0; 0x10],
            extended_header_hash: vec![0; 0x20],
            extended_header_size: 0x400,
            reserved2: 0,
            flags: [0; 8],
            plain_offset: 0,
            plain_size: 0,
            logo_offset: 0,
            logo_size: 0,
            exefs_offset: 3,
            exefs_size: 4,
            exefs_hash_size: 1,
            reserved3: 0,
            romfs_offset: 8,
            romfs_size: 4,
            romfs_hash_size: 1,
            reserved4: 0,
            exefs_hash: vec![0; 0x20],
            romfs_hash: vec![0; 0x20],
        }
    }

    #[test]
    fn header_is_0x200_bytes() {
        let header = sample_header();
        let bytes = header.serialize();
        assert_eq!(bytes.len(), NCCH_HEADER_SIZE);

        let reparsed = NcchHeader::from_bytes(&bytes).unwrap();
        assert!(reparsed.is_ncch());
        assert_eq!(reparsed.exefs_offset, 3);
        assert_eq!(reparsed.romfs_offset, 8);
        assert_eq!(reparsed.key_y_primary(), header.signature[..16]);
    }

    #[test]
    fn crypto_flags() {
        let mut header = sample_header();
        assert!(!header.no_crypto());
        assert!(!header.fixed_key());
        assert!(!header.seed_crypto());

        header.flags[7] = 0b0010_0101;
        assert!(header.no_crypto());
        assert!(header.fixed_key());
        assert!(header.seed_crypto());

        header.set_no_crypto(false);
        assert!(!header.no_crypto());
        header.set_no_crypto(true);
        assert_eq!(header.flags[7], 0b0010_0101);

        header.flags[3] = 10;
        assert_eq!(header.secondary_key_slot(), 10);
    }
}
