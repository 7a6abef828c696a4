use crate::crypto::{self, AesIv, AesKey};
use crate::ctr::models::exe_fs_header::{EXEFS_HEADER_SIZE, ExeFsHeader};
use crate::ctr::models::ncch::{NCCH_HEADER_SIZE, NcchHeader};
use crate::ctr::models::seeddb;
use crate::ctr::util::align_up;
use crate::keys::{self, slot_id};
use crate::vfs::ByteFile;
use log::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    ExHeader,
    ExefsHeader,
    ExefsPrimary,
    ExefsSecondary,
    Romfs,
}

#[derive(Debug, Clone, Copy)]
struct CryptoRegion {
    kind: RegionKind,
    offset: u64,
    size: u64,
    /// Offset the region's CTR stream starts at; the keystream position for
    /// a write is the distance from here.
    seek_from: u64,
}

/// Container layout variant. Prototype-era containers use raw byte offsets
/// and a smaller exefs section alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerVariant {
    #[default]
    Retail,
    Proto,
}

/// Streaming sink for one content payload. Buffers the container header,
/// derives per-region keys and counters, then decrypts exactly the defined
/// regions while passing everything else through. Never raises: failures
/// latch an error state and further input is discarded.
pub struct NcchCryptoFile {
    file: Box<dyn ByteFile>,
    decryption_authorized: bool,
    variant: ContainerVariant,

    is_error: bool,
    is_not_ncch: bool,
    written: u64,

    header_buf: Vec<u8>,
    header_parsed: bool,
    is_encrypted: bool,

    primary_key: AesKey,
    secondary_key: AesKey,
    exheader_ctr: AesIv,
    exefs_ctr: AesIv,
    romfs_ctr: AesIv,

    regions: Vec<CryptoRegion>,
    exefs_header_buf: Vec<u8>,
    exefs_header_processed: bool,
}

impl NcchCryptoFile {
    pub fn new(file: Box<dyn ByteFile>, decryption_authorized: bool) -> NcchCryptoFile {
        NcchCryptoFile::with_variant(file, decryption_authorized, ContainerVariant::Retail)
    }

    pub fn with_variant(
        file: Box<dyn ByteFile>,
        decryption_authorized: bool,
        variant: ContainerVariant,
    ) -> NcchCryptoFile {
        NcchCryptoFile {
            file,
            decryption_authorized,
            variant,
            is_error: false,
            is_not_ncch: false,
            written: 0,
            header_buf: Vec::with_capacity(NCCH_HEADER_SIZE),
            header_parsed: false,
            is_encrypted: false,
            primary_key: [0; 16],
            secondary_key: [0; 16],
            exheader_ctr: [0; 16],
            exefs_ctr: [0; 16],
            romfs_ctr: [0; 16],
            regions: Vec::new(),
            exefs_header_buf: Vec::with_capacity(EXEFS_HEADER_SIZE),
            exefs_header_processed: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn close(&mut self) {
        // Payloads shorter than a container header never resolve the magic
        // check; store whatever was buffered untouched.
        if !self.header_parsed && !self.is_not_ncch && !self.header_buf.is_empty() {
            self.is_not_ncch = true;
            let raw = std::mem::take(&mut self.header_buf);
            self.emit(&raw);
        }
        if self.file.close().is_err() {
            self.is_error = true;
        }
    }

    fn emit(&mut self, data: &[u8]) {
        if self.is_error {
            return;
        }
        match self.file.write_at(self.written, data) {
            Ok(_) => self.written += data.len() as u64,
            Err(err) => {
                error!("Content sink write failed: {err}");
                self.is_error = true;
            }
        }
    }

    fn media_unit(&self) -> u64 {
        match self.variant {
            ContainerVariant::Retail => crate::ctr::MEDIA_UNIT_SIZE as u64,
            // Prototype-era images use raw byte offsets.
            ContainerVariant::Proto => 1,
        }
    }

    fn exefs_section_align(&self) -> u64 {
        match self.variant {
            ContainerVariant::Retail => 0x200,
            ContainerVariant::Proto => 0x10,
        }
    }

    pub fn write(&mut self, mut buffer: &[u8]) {
        if self.is_error {
            return;
        }

        if self.is_not_ncch {
            self.emit(buffer);
            return;
        }

        // Buffer the container header before anything can be decided.
        if self.header_buf.len() < NCCH_HEADER_SIZE {
            let to_copy = buffer.len().min(NCCH_HEADER_SIZE - self.header_buf.len());
            self.header_buf.extend_from_slice(&buffer[..to_copy]);
            buffer = &buffer[to_copy..];
        }

        if !self.header_parsed && self.header_buf.len() == NCCH_HEADER_SIZE {
            let Ok(header) = NcchHeader::from_bytes(&self.header_buf) else {
                error!("Unreadable content header");
                self.is_error = true;
                return;
            };

            if !header.is_ncch() {
                // Most likely legacy contents, store without any processing.
                self.is_not_ncch = true;
                let raw_header = std::mem::take(&mut self.header_buf);
                self.emit(&raw_header);
                self.emit(buffer);
                return;
            }

            if !header.no_crypto() {
                if !self.decryption_authorized {
                    error!("Blocked unauthorized encrypted content installation.");
                    self.is_error = true;
                    return;
                }
                self.is_encrypted = true;
                self.derive_keys(&header);
                self.derive_counters(&header);
            } else {
                debug!("No crypto");
                self.is_encrypted = false;
            }
            self.header_parsed = true;

            if self.is_error {
                return;
            }

            if self.is_encrypted {
                self.build_region_table(&header);
            }

            // The persisted container is always stored decrypted, so flag it
            // as such before writing the header out.
            let mut out_header = header;
            out_header.set_no_crypto(true);
            let serialized = out_header.serialize();
            self.emit(&serialized);
        }

        if !self.header_parsed {
            return;
        }

        while !buffer.is_empty() && !self.is_error {
            let Some(region) = self.closest_region(self.written) else {
                // Nothing left to decrypt in this file.
                self.emit(buffer);
                return;
            };

            if self.written < region.offset {
                // Plain gap before the region starts.
                let to_write = buffer.len().min((region.offset - self.written) as usize);
                self.emit(&buffer[..to_write]);
                buffer = &buffer[to_write..];
                continue;
            }

            let to_write = buffer
                .len()
                .min((region.offset + region.size - self.written) as usize);
            if self.is_encrypted {
                let mut temp = buffer[..to_write].to_vec();
                let (key, ctr) = self.region_key_ctr(&region);
                let keystream_offset = self.written - region.seek_from;
                crypto::ctr_apply(&key, &ctr, keystream_offset, &mut temp);
                self.emit(&temp);

                if region.kind == RegionKind::ExefsHeader {
                    self.feed_exefs_header(&region, &temp);
                }
            } else {
                self.emit(&buffer[..to_write]);
            }
            buffer = &buffer[to_write..];
        }
    }

    fn derive_keys(&mut self, header: &NcchHeader) {
        if header.fixed_key() {
            debug!("Fixed-key crypto");
            self.primary_key = [0; 16];
            self.secondary_key = [0; 16];
            return;
        }

        keys::init();
        let key_y_primary = header.key_y_primary();

        let key_y_secondary = if !header.seed_crypto() {
            key_y_primary
        } else {
            match seeddb::get_seed(header.program_id) {
                Some(seed) => {
                    let mut input = [0u8; 32];
                    input[..16].copy_from_slice(&key_y_primary);
                    input[16..].copy_from_slice(&seed);
                    let digest = crypto::sha256(&input);
                    digest[..16].try_into().unwrap()
                }
                None => {
                    error!("Seed for program {:016X} not found", header.program_id);
                    self.is_error = true;
                    key_y_primary
                }
            }
        };

        match keys::ncch_normal_key(slot_id::NCCH_SECURE1, &key_y_primary) {
            Some(key) => self.primary_key = key,
            None => {
                error!("Secure1 KeyX missing");
                self.is_error = true;
            }
        }

        let (slot, label) = match header.secondary_key_slot() {
            0 => (slot_id::NCCH_SECURE1, "Secure1"),
            1 => (slot_id::NCCH_SECURE2, "Secure2"),
            10 => (slot_id::NCCH_SECURE3, "Secure3"),
            11 => (slot_id::NCCH_SECURE4, "Secure4"),
            other => {
                error!("Unknown secondary key slot {other}");
                self.is_error = true;
                return;
            }
        };
        debug!("{label} crypto");
        match keys::ncch_normal_key(slot, &key_y_secondary) {
            Some(key) => self.secondary_key = key,
            None => {
                error!("{label} KeyX missing");
                self.is_error = true;
            }
        }
    }

    fn derive_counters(&mut self, header: &NcchHeader) {
        match header.version {
            0 | 2 => {
                debug!("Container version 0/2");
                // A per-section magic number prefixed by the partition id in
                // reverse order.
                let mut prefix = header.partition_id;
                prefix.reverse();
                self.exheader_ctr[..8].copy_from_slice(&prefix);
                self.exefs_ctr = self.exheader_ctr;
                self.romfs_ctr = self.exheader_ctr;
                self.exheader_ctr[8] = 1;
                self.exefs_ctr[8] = 2;
                self.romfs_ctr[8] = 3;
            }
            1 => {
                debug!("Container version 1");
                // The section's byte offset prefixed by the partition id, as
                // if the whole image were one CTR stream.
                let unit = self.media_unit() as u32;
                self.exheader_ctr[..8].copy_from_slice(&header.partition_id);
                self.exefs_ctr = self.exheader_ctr;
                self.romfs_ctr = self.exheader_ctr;
                self.exheader_ctr[12..].copy_from_slice(&0x200u32.to_be_bytes());
                self.exefs_ctr[12..]
                    .copy_from_slice(&(header.exefs_offset * unit).to_be_bytes());
                self.romfs_ctr[12..]
                    .copy_from_slice(&(header.romfs_offset * unit).to_be_bytes());
            }
            other => {
                error!("Unknown container version {other}");
                self.is_error = true;
            }
        }
    }

    fn build_region_table(&mut self, header: &NcchHeader) {
        let unit = self.media_unit();
        if header.extended_header_size != 0 {
            self.regions.push(CryptoRegion {
                kind: RegionKind::ExHeader,
                offset: NCCH_HEADER_SIZE as u64,
                size: 0x400,
                seek_from: NCCH_HEADER_SIZE as u64,
            });
        }
        if header.exefs_size != 0 {
            let offset = header.exefs_offset as u64 * unit;
            self.regions.push(CryptoRegion {
                kind: RegionKind::ExefsHeader,
                offset,
                size: EXEFS_HEADER_SIZE as u64,
                seek_from: offset,
            });
        }
        if header.romfs_size != 0 {
            let offset = header.romfs_offset as u64 * unit;
            self.regions.push(CryptoRegion {
                kind: RegionKind::Romfs,
                offset,
                size: header.romfs_size as u64 * unit,
                seek_from: offset,
            });
        }
    }

    fn closest_region(&self, offset: u64) -> Option<CryptoRegion> {
        let mut closest: Option<CryptoRegion> = None;
        for region in &self.regions {
            if offset >= region.offset && offset < region.offset + region.size {
                return Some(*region);
            }
            if offset < region.offset
                && closest.is_none_or(|candidate| region.offset < candidate.offset)
            {
                closest = Some(*region);
            }
        }
        closest
    }

    fn region_key_ctr(&self, region: &CryptoRegion) -> (AesKey, AesIv) {
        match region.kind {
            RegionKind::ExHeader => (self.primary_key, self.exheader_ctr),
            RegionKind::ExefsHeader | RegionKind::ExefsPrimary => {
                (self.primary_key, self.exefs_ctr)
            }
            RegionKind::ExefsSecondary => (self.secondary_key, self.exefs_ctr),
            RegionKind::Romfs => (self.secondary_key, self.romfs_ctr),
        }
    }

    /// Collects the decrypted exefs header; once complete, its section list
    /// expands the region table with one sub-region per non-empty section.
    fn feed_exefs_header(&mut self, region: &CryptoRegion, decrypted: &[u8]) {
        if self.exefs_header_buf.len() < EXEFS_HEADER_SIZE {
            let to_copy = decrypted
                .len()
                .min(EXEFS_HEADER_SIZE - self.exefs_header_buf.len());
            self.exefs_header_buf.extend_from_slice(&decrypted[..to_copy]);
        }
        if self.exefs_header_processed || self.exefs_header_buf.len() < EXEFS_HEADER_SIZE {
            return;
        }

        match ExeFsHeader::from_bytes(&self.exefs_header_buf) {
            Ok(exefs) => {
                for section in &exefs.sections {
                    if section.size == 0 {
                        continue;
                    }
                    let kind = if section.uses_primary_key() {
                        RegionKind::ExefsPrimary
                    } else {
                        RegionKind::ExefsSecondary
                    };
                    self.regions.push(CryptoRegion {
                        kind,
                        offset: region.offset + EXEFS_HEADER_SIZE as u64 + section.offset as u64,
                        size: align_up(section.size as u64, self.exefs_section_align()),
                        seek_from: region.offset,
                    });
                }
            }
            Err(_) => error!("Unreadable exefs header"),
        }
        self.exefs_header_processed = true;
    }
}
