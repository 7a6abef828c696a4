use binrw::{BinRead, BinWrite};
use std::io::Cursor;

pub const EXEFS_HEADER_SIZE: usize = 0x200;
pub const EXEFS_SECTION_COUNT: usize = 8;

/// One named section inside an exefs. Offsets are relative to the end of
/// the exefs header.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, Default)]
#[brw(little)]
pub struct ExeFsSectionHeader {
    pub name: [u8; 8],
    pub offset: u32,
    pub size: u32,
}

impl ExeFsSectionHeader {
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Icon and banner sections stay under the primary key; everything else
    /// (notably `.code`) uses the secondary key.
    pub fn uses_primary_key(&self) -> bool {
        matches!(self.name_str(), "icon" | "banner")
    }
}

/// The 0x200-byte exefs header: eight section records, reserved space and
/// one hash per section in reverse order.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct ExeFsHeader {
    pub sections: [ExeFsSectionHeader; EXEFS_SECTION_COUNT],
    pub reserved: [u8; 0x80],
    pub hashes: [[u8; 0x20]; EXEFS_SECTION_COUNT],
}

impl ExeFsHeader {
    pub fn from_bytes(data: &[u8]) -> binrw::BinResult<ExeFsHeader> {
        ExeFsHeader::read(&mut Cursor::new(data))
    }
}
