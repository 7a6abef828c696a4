use crate::crypto::{self, AesKey, ecc};
use crate::ctr::models::signature::SignatureData;
use crate::error::{TitleVaultError, TitleVaultResult};
use crate::keys::{self, slot_id};
use crate::unique;
use binrw::{BinRead, BinWrite};
use byteorder::{BigEndian, ByteOrder};
use log::{error, warn};
use std::io::Cursor;
use std::path::Path;

/// Tickets grant rights to a title and store its title key, AES-CBC
/// encrypted with either a common key or a per-console wrapping.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct Ticket {
    /// Signature data; the hash for the signature covers the ticket body.
    pub signature_data: SignatureData,

    /// Ticket body
    pub body: TicketBody,

    /// Trailing hierarchical rights table
    pub content_index: ContentIndex,
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct TicketBody {
    /// Issuer
    #[br(count = 0x40)]
    pub issuer: Vec<u8>,

    /// ECC public key used for personalized title-key wrapping
    #[br(count = 0x3C)]
    pub ecc_public_key: Vec<u8>,

    /// Version (always 1 for this console generation)
    pub version: u8,

    /// CaCrlVersion
    pub ca_crl_version: u8,

    /// SignerCrlVersion
    pub signer_crl_version: u8,

    /// Title key, encrypted with a common key Y (common tickets) plus a
    /// console-unique ECDH layer (personalized tickets)
    #[br(count = 0x10)]
    pub title_key: Vec<u8>,

    /// Reserved
    pub reserved1: u8,

    /// TicketID
    pub ticket_id: u64,

    /// ConsoleID; zero marks a common ticket
    pub console_id: u32,

    /// TitleID
    pub title_id: u64,

    /// Reserved
    pub reserved2: u16,

    /// Ticket title version
    pub ticket_title_version: u16,

    /// Reserved
    pub reserved3: u64,

    /// License Type
    pub license_type: u8,

    /// Index into the common key Y table
    pub common_key_index: u8,

    /// Reserved
    #[br(count = 0x2A)]
    pub reserved4: Vec<u8>,

    /// eShop Account ID
    pub eshop_account_id: u32,

    /// Reserved
    pub reserved5: u8,

    /// Audit
    pub audit: u8,

    /// Reserved
    #[br(count = 0x42)]
    pub reserved6: Vec<u8>,

    /// Limits (play count, play time)
    #[br(count = 0x40)]
    pub limits: Vec<u8>,
}

/// Raw rights table. Its size lives in the second u32 of its own header;
/// the inner encoding is parsed lazily by the rights queries.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct ContentIndex {
    pub header_word: u32,

    /// Total size of the block, including these first two words
    #[br(assert(total_size >= 8))]
    pub total_size: u32,

    #[br(count = total_size as usize - 8)]
    pub data: Vec<u8>,
}

const MAIN_HEADER_SIZE: usize = 20;
const INDEX_HEADER_SIZE: usize = 20;
const RIGHTS_FIELD_SIZE: usize = 2 + 2 + 0x80;

#[derive(Debug, Clone)]
struct RightsField {
    start_index: u16,
    rights: [u8; 0x80],
}

impl ContentIndex {
    pub fn empty() -> ContentIndex {
        // Minimal well-formed table: main header only, no index headers.
        let mut data = vec![0u8; MAIN_HEADER_SIZE - 8];
        BigEndian::write_u32(&mut data[0..4], MAIN_HEADER_SIZE as u32);
        BigEndian::write_u16(&mut data[6..8], INDEX_HEADER_SIZE as u16);
        ContentIndex {
            header_word: 0x0001_0014,
            total_size: MAIN_HEADER_SIZE as u32,
            data,
        }
    }

    fn raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size as usize);
        out.extend_from_slice(&self.header_word.to_be_bytes());
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Extracts the supported rights entries. Index headers with an
    /// unsupported type are logged and skipped; their encoding is not
    /// documented anywhere.
    fn rights_fields(&self, title_id: u64, ticket_id: u64) -> Option<Vec<RightsField>> {
        let raw = self.raw();
        if raw.len() < MAIN_HEADER_SIZE {
            error!("Ticket content index is too small");
            return None;
        }

        let always1 = BigEndian::read_u16(&raw[0..2]);
        let header_size = BigEndian::read_u16(&raw[2..4]);
        let table_size = BigEndian::read_u32(&raw[4..8]);
        let headers_offset = BigEndian::read_u32(&raw[8..12]) as usize;
        let headers_count = BigEndian::read_u16(&raw[12..14]);
        let index_header_size = BigEndian::read_u16(&raw[14..16]);

        if always1 != 1
            || header_size as usize != MAIN_HEADER_SIZE
            || table_size as usize != raw.len()
            || index_header_size as usize != INDEX_HEADER_SIZE
        {
            error!(
                "Ticket content index has unexpected parameters title_id={title_id:016X}, \
                 ticket_id={ticket_id:016X}, always1={always1}, header_size={header_size}, \
                 size={table_size}, index_header_size={index_header_size}"
            );
            return None;
        }

        let mut fields = Vec::new();
        for i in 0..headers_count as usize {
            let offset = headers_offset + INDEX_HEADER_SIZE * i;
            let Some(header) = raw.get(offset..offset + INDEX_HEADER_SIZE) else {
                error!("Ticket content index header {i} out of bounds");
                return None;
            };
            let data_offset = BigEndian::read_u32(&header[0..4]) as usize;
            let entry_count = BigEndian::read_u32(&header[4..8]);
            let entry_size = BigEndian::read_u32(&header[8..12]) as usize;
            let entry_type = BigEndian::read_u16(&header[16..18]);

            if entry_type != 3 || entry_size != RIGHTS_FIELD_SIZE {
                warn!(
                    "Found unsupported index header type, skipping... \
                     title_id={title_id:016X}, ticket_id={ticket_id:016X}, type={entry_type}"
                );
                continue;
            }

            for j in 0..entry_count as usize {
                let entry_offset = data_offset + entry_size * j;
                let Some(entry) = raw.get(entry_offset..entry_offset + entry_size) else {
                    error!("Ticket rights entry {j} out of bounds");
                    return None;
                };
                let mut rights = [0u8; 0x80];
                rights.copy_from_slice(&entry[4..]);
                fields.push(RightsField {
                    start_index: BigEndian::read_u16(&entry[2..4]),
                    rights,
                });
            }
        }
        Some(fields)
    }
}

impl Ticket {
    pub fn from_bytes(data: &[u8]) -> TitleVaultResult<Ticket> {
        Ok(Ticket::read(&mut Cursor::new(data))?)
    }

    pub fn load(path: &Path) -> TitleVaultResult<Ticket> {
        let data = std::fs::read(path)
            .map_err(|_| TitleVaultError::NotFound(path.display().to_string()))?;
        Ticket::from_bytes(&data)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut Cursor::new(&mut buf))
            .expect("ticket serialization cannot fail");
        buf
    }

    pub fn save(&self, path: &Path) -> TitleVaultResult<()> {
        std::fs::write(path, self.serialize())?;
        Ok(())
    }

    pub fn title_id(&self) -> u64 {
        self.body.title_id
    }

    pub fn ticket_id(&self) -> u64 {
        self.body.ticket_id
    }

    pub fn version(&self) -> u16 {
        self.body.ticket_title_version
    }

    /// Personalized tickets belong to one console. A zero console id marks a
    /// common ticket; anything else must match the loaded OTP.
    pub fn is_personal(&self) -> bool {
        if self.body.console_id == 0 {
            return false;
        }
        match unique::otp() {
            Some(otp) => self.body.console_id == otp.device_id(),
            None => {
                error!("Invalid OTP");
                false
            }
        }
    }

    /// Unwraps the per-console layer of a personalized title key in place:
    /// ECDH with the ticket's ECC public key, SHA-1 of the agreement as the
    /// AES key, ticket id as the IV. Common tickets need no fixup.
    pub fn do_titlekey_fixup(&mut self) -> TitleVaultResult<()> {
        if self.body.console_id == 0 {
            return Ok(());
        }

        let (otp, ct_cert) = match (unique::otp(), unique::ct_cert()) {
            (Some(otp), Some(ct_cert)) => (otp, ct_cert),
            _ => {
                error!("Tried to fixup a ticket without a valid OTP/CTCert");
                return Err(TitleVaultError::InvalidState);
            }
        };

        if self.body.console_id != otp.device_id() {
            error!("Tried to fixup a ticket that does not correspond to this console");
            return Err(TitleVaultError::InvalidState);
        }

        let ticket_public = ecc::create_public_key(&self.body.ecc_public_key);
        let agreement = ct_cert.ecdh_agree(&ticket_public);
        if agreement.is_empty() {
            error!("Failed to perform ECDH agreement");
            return Err(TitleVaultError::UnsupportedCrypto("ECDH agreement failed"));
        }

        let digest = crypto::sha1(&agreement);
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);

        let mut iv = [0u8; 16];
        BigEndian::write_u64(&mut iv[..8], self.body.ticket_id);

        crypto::cbc_decrypt(&key, &iv, &mut self.body.title_key);
        Ok(())
    }

    /// Decrypts the stored title key with the selected common key. The IV is
    /// the title id followed by zeros.
    pub fn title_key(&self) -> Option<AesKey> {
        keys::select_common_key_index(self.body.common_key_index);
        if !keys::is_normal_key_available(slot_id::TICKET_COMMON_KEY) {
            error!("CommonKey {} missing", self.body.common_key_index);
            return None;
        }
        let key = keys::normal_key(slot_id::TICKET_COMMON_KEY)?;

        let mut iv = [0u8; 16];
        BigEndian::write_u64(&mut iv[..8], self.body.title_id);

        let mut title_key: AesKey = self.body.title_key.as_slice().try_into().ok()?;
        crypto::cbc_decrypt(&key, &iv, &mut title_key);
        Some(title_key)
    }

    /// Rights query over the content index table. With no entries, indices
    /// below 256 are implicitly granted.
    pub fn has_rights(&self, content_index: u16) -> bool {
        let Some(fields) = self
            .content_index
            .rights_fields(self.title_id(), self.ticket_id())
        else {
            return false;
        };

        if fields.is_empty() {
            return content_index < 256;
        }

        for field in &fields {
            if content_index < field.start_index {
                break;
            }
            let bit_pos = (content_index - field.start_index) as usize;
            if bit_pos >= 1024 {
                continue;
            }
            if field.rights[bit_pos / 8] & (1 << (bit_pos % 8)) != 0 {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctr::models::signature::SignatureType;
    use crate::ctr::util::align_up;

    pub(crate) fn sample_body(console_id: u32, title_key: [u8; 16]) -> TicketBody {
        TicketBody {
            issuer: {
                let mut issuer = b"Root-CA00000003-XS0000000c".to_vec();
                issuer.resize(0x40, 0);
                issuer
            },
            ecc_public_key: vec![0x00; 0x3C],
            version: 1,
            ca_crl_version: 0,
            signer_crl_version: 0,
            title_key: title_key.to_vec(),
            reserved1: 0,
            ticket_id: 0x0123456789ABCDEF,
            console_id,
            title_id: 0x000400000F70_0000,
            reserved2: 0,
            ticket_title_version: 0x0100,
            reserved3: 0,
            license_type: 0,
            common_key_index: 0,
            reserved4: vec![0x00; 0x2A],
            eshop_account_id: 0,
            reserved5: 0,
            audit: 0,
            reserved6: vec![0x00; 0x42],
            limits: vec![0x00; 0x40],
        }
    }

    pub(crate) fn sample_ticket(console_id: u32) -> Ticket {
        Ticket {
            signature_data: SignatureData::new(SignatureType::Rsa2048Sha256, vec![0xAA; 0x100]),
            body: sample_body(console_id, [0x11; 16]),
            content_index: ContentIndex::empty(),
        }
    }

    fn rights_table(entries: &[(u16, &[u16])]) -> ContentIndex {
        // Main header, then one type-3 index header, then the entries.
        let headers_offset = MAIN_HEADER_SIZE;
        let data_offset = headers_offset + INDEX_HEADER_SIZE;
        let total = data_offset + entries.len() * RIGHTS_FIELD_SIZE;

        let mut raw = vec![0u8; total];
        BigEndian::write_u16(&mut raw[0..2], 1);
        BigEndian::write_u16(&mut raw[2..4], MAIN_HEADER_SIZE as u16);
        BigEndian::write_u32(&mut raw[4..8], total as u32);
        BigEndian::write_u32(&mut raw[8..12], headers_offset as u32);
        BigEndian::write_u16(&mut raw[12..14], 1);
        BigEndian::write_u16(&mut raw[14..16], INDEX_HEADER_SIZE as u16);

        let header = &mut raw[headers_offset..headers_offset + INDEX_HEADER_SIZE];
        BigEndian::write_u32(&mut header[0..4], data_offset as u32);
        BigEndian::write_u32(&mut header[4..8], entries.len() as u32);
        BigEndian::write_u32(&mut header[8..12], RIGHTS_FIELD_SIZE as u32);
        BigEndian::write_u16(&mut header[16..18], 3);

        for (i, (start_index, set_bits)) in entries.iter().enumerate() {
            let offset = data_offset + i * RIGHTS_FIELD_SIZE;
            let entry = &mut raw[offset..offset + RIGHTS_FIELD_SIZE];
            BigEndian::write_u16(&mut entry[2..4], *start_index);
            for bit in *set_bits {
                entry[4 + (*bit as usize) / 8] |= 1 << (bit % 8);
            }
        }

        ContentIndex {
            header_word: BigEndian::read_u32(&raw[0..4]),
            total_size: total as u32,
            data: raw[8..].to_vec(),
        }
    }

    #[test]
    fn serialized_length_matches_layout() {
        let ticket = sample_ticket(0);
        let bytes = ticket.serialize();

        let sig_len = ticket.signature_data.signature_type.signature_size();
        let content_index_len = ticket.content_index.total_size as u64;
        assert_eq!(
            bytes.len() as u64,
            align_up(4 + sig_len as u64, 0x40) + 356 + content_index_len
        );
    }

    #[test]
    fn parse_serialize_is_stable() {
        let ticket = sample_ticket(0x12345678);
        let bytes = ticket.serialize();
        let reparsed = Ticket::from_bytes(&bytes).unwrap();
        assert_eq!(reparsed.serialize(), bytes);
        assert_eq!(reparsed.title_id(), ticket.title_id());
        assert_eq!(reparsed.ticket_id(), ticket.ticket_id());
        assert_eq!(reparsed.body.console_id, 0x12345678);
    }

    #[test]
    fn common_ticket_fixup_is_a_noop() {
        let mut ticket = sample_ticket(0);
        ticket.do_titlekey_fixup().unwrap();
        assert_eq!(ticket.body.title_key, vec![0x11; 16]);
    }

    #[test]
    fn empty_rights_table_grants_low_indices() {
        let ticket = sample_ticket(0);
        assert!(ticket.has_rights(0));
        assert!(ticket.has_rights(255));
        assert!(!ticket.has_rights(256));
        assert!(!ticket.has_rights(0x1234));
    }

    #[test]
    fn rights_bitmap_is_evaluated_in_entry_order() {
        let mut ticket = sample_ticket(0);
        ticket.content_index = rights_table(&[(5, &[3])]);

        assert!(ticket.has_rights(8)); // bit 3 of the entry starting at 5
        assert!(!ticket.has_rights(7)); // bit 2 is clear
        assert!(!ticket.has_rights(4)); // below start index aborts the walk
    }

    #[test]
    fn rights_entries_past_the_query_deny() {
        let mut ticket = sample_ticket(0);
        ticket.content_index = rights_table(&[(0, &[0]), (2048, &[0])]);

        assert!(ticket.has_rights(0));
        // Inside the gap between both entries: first entry's field is too
        // short, second entry starts past the query.
        assert!(!ticket.has_rights(1500));
        assert!(ticket.has_rights(2048));
    }

    #[test]
    fn unsupported_index_header_type_is_skipped() {
        let mut ticket = sample_ticket(0);
        let mut table = rights_table(&[(0, &[1])]);
        // Flip the index header type to something unknown; the walker must
        // skip it and fall back to the empty-table rule.
        let type_offset = MAIN_HEADER_SIZE + 16 - 8;
        BigEndian::write_u16(&mut table.data[type_offset..type_offset + 2], 7);
        ticket.content_index = table;

        assert!(ticket.has_rights(100)); // < 256 with no usable entries
        assert!(!ticket.has_rights(300));
    }
}
