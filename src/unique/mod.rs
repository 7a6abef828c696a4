//! Console-unique data: the OTP blob, the device certificate derived from
//! it, region info, the local friend-code seed and the movable seed. All of
//! it lives in a lazily-initialized process-wide singleton; consumers only
//! ever see clones of the parsed objects.

use crate::crypto::{self, AesIv, AesKey, ecc};
use crate::ctr::models::certificate::Certificate;
use crate::dirs;
use crate::keys;
use binrw::{BinRead, BinWrite};
use lazy_static::lazy_static;
use log::{error, warn};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::RwLock;

pub const OTP_MAGIC: u32 = 0xDEAD_B00F;
pub const OTP_SIZE: usize = 0x100;
const OTP_BODY_SIZE: usize = 0xE0;

const ISSUER_RETAIL: &str = "Nintendo CA - G3_NintendoCTR2prod";
const ISSUER_DEV: &str = "Nintendo CA - G3_NintendoCTR2dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureDataLoadStatus {
    Loaded,
    InvalidSignature,
    RegionChanged,
    NotFound,
    Invalid,
    IoError,
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct OtpBody {
    pub magic: u32,
    pub device_id: u32,
    pub fallback_movable_key_y: [u8; 0x10],
    pub otp_version: u8,
    pub system_type: u8,
    pub manufacture_date: [u8; 6],
    pub ctcert_expiry_date: u32,
    pub ctcert_priv_key: [u8; 0x20],
    #[br(count = 0x3C)]
    pub ctcert_signature: Vec<u8>,
    #[br(count = 0x10)]
    pub reserved: Vec<u8>,
    #[br(count = 0x50)]
    pub random_seed: Vec<u8>,
}

/// Parsed and hash-verified OTP.
#[derive(Debug, Clone)]
pub struct Otp {
    body: OtpBody,
}

impl Otp {
    pub fn device_id(&self) -> u32 {
        self.body.device_id
    }

    pub fn system_type(&self) -> u8 {
        self.body.system_type
    }

    pub fn is_dev(&self) -> bool {
        self.body.system_type != 0
    }

    /// Early OTP revisions stored the expiration big endian.
    pub fn ctcert_expiration(&self) -> u32 {
        if self.body.otp_version < 5 {
            self.body.ctcert_expiry_date.swap_bytes()
        } else {
            self.body.ctcert_expiry_date
        }
    }

    pub fn ctcert_private_key(&self) -> [u8; 0x20] {
        self.body.ctcert_priv_key
    }

    pub fn ctcert_signature(&self) -> Vec<u8> {
        self.body.ctcert_signature.clone()
    }

    pub fn fallback_movable_key_y(&self) -> [u8; 0x10] {
        self.body.fallback_movable_key_y
    }
}

/// Region info with the console serial, RSA signed.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct SecureInfo {
    #[br(count = 0x100)]
    pub signature: Vec<u8>,
    pub region: u8,
    pub unknown: u8,
    #[br(count = 0xF)]
    pub serial_number: Vec<u8>,
}

pub const REGION_COUNT: u8 = 7;

impl SecureInfo {
    fn body_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(0x11);
        body.push(self.region);
        body.push(self.unknown);
        body.extend_from_slice(&self.serial_number);
        body
    }

    pub fn verify_signature(&self) -> bool {
        keys::with_store(|s| s.secure_info_slot()).verify(&self.body_bytes(), &self.signature)
    }
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct LocalFriendCodeSeed {
    #[br(count = 0x100)]
    pub signature: Vec<u8>,
    pub unknown: u64,
    pub friend_code_seed: u64,
}

impl LocalFriendCodeSeed {
    fn body_bytes(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(0x10);
        body.extend_from_slice(&self.unknown.to_le_bytes());
        body.extend_from_slice(&self.friend_code_seed.to_le_bytes());
        body
    }

    pub fn verify_signature(&self) -> bool {
        keys::with_store(|s| s.lfcs_slot()).verify(&self.body_bytes(), &self.signature)
    }
}

pub const MOVABLE_MAGIC: [u8; 4] = *b"SEED";

/// movable.sed: the SD crypto seed, embedding a friend-code seed and a
/// key Y half. Consoles ship either the short or the MAC-carrying layout.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(little)]
pub struct MovableSed {
    pub magic: [u8; 4],
    pub unk0: u8,
    pub is_full: u8,
    pub unk1: u8,
    pub unk2: u8,
    pub lfcs: LocalFriendCodeSeed,
    pub key_y: [u8; 8],
    #[br(if(is_full != 0), count = 0x10)]
    pub unknown_full: Vec<u8>,
    #[br(if(is_full != 0), count = 0x10)]
    pub aes_mac: Vec<u8>,
}

impl MovableSed {
    pub fn is_valid(&self) -> bool {
        self.magic == MOVABLE_MAGIC
    }

    pub fn verify_signature(&self) -> bool {
        self.lfcs.verify_signature()
    }
}

/// Purpose tag mixed into per-console file keys. Distinct consumers get
/// distinct keystreams over the same console material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueCryptoFileId {
    Ncch = 0,
}

#[derive(Default)]
struct UniqueData {
    otp: Option<Otp>,
    ct_cert: Option<Certificate>,
    secure_info: Option<SecureInfo>,
    secure_info_signature_valid: bool,
    secure_info_region_changed: bool,
    lfcs: Option<LocalFriendCodeSeed>,
    lfcs_signature_valid: bool,
    movable: Option<MovableSed>,
    movable_signature_valid: bool,
}

lazy_static! {
    static ref UNIQUE: RwLock<UniqueData> = RwLock::new(UniqueData::default());
}

pub fn otp_path() -> PathBuf {
    dirs::sys_data_dir().join("otp.bin")
}

pub fn secure_info_path() -> PathBuf {
    dirs::nand_dir().join("rw/sys/SecureInfo_A")
}

pub fn lfcs_path() -> PathBuf {
    dirs::nand_dir().join("rw/sys/LocalFriendCodeSeed_B")
}

pub fn movable_path() -> PathBuf {
    dirs::nand_dir().join("private/movable.sed")
}

fn parse_otp(raw: &[u8]) -> Result<Otp, SecureDataLoadStatus> {
    if raw.len() != OTP_SIZE {
        error!("Invalid OTP size");
        return Err(SecureDataLoadStatus::Invalid);
    }

    let mut buf: Vec<u8> = raw.to_vec();
    let magic_of = |data: &[u8]| u32::from_le_bytes(data[..4].try_into().unwrap());

    if magic_of(&buf) != OTP_MAGIC {
        let Some((key, iv)) = keys::otp_key_iv() else {
            error!("OTP is encrypted and no OTP key material is available");
            return Err(SecureDataLoadStatus::Invalid);
        };
        crypto::cbc_decrypt(&key, &iv, &mut buf);
        if magic_of(&buf) != OTP_MAGIC {
            error!("OTP failed to decrypt (or uses dev keys)");
            return Err(SecureDataLoadStatus::Invalid);
        }
    }

    let digest = crypto::sha256(&buf[..OTP_BODY_SIZE]);
    if digest != buf[OTP_BODY_SIZE..] {
        error!("OTP is corrupted");
        return Err(SecureDataLoadStatus::Invalid);
    }

    let body = OtpBody::read(&mut Cursor::new(&buf))
        .map_err(|_| SecureDataLoadStatus::Invalid)?;
    Ok(Otp { body })
}

fn build_ct_cert(otp: &Otp) -> Option<Certificate> {
    let issuer = if otp.is_dev() { ISSUER_DEV } else { ISSUER_RETAIL };
    let name = format!("CT{:08X}-{:02X}", otp.device_id(), otp.system_type());

    let cert = Certificate::build_device(
        issuer,
        &name,
        otp.ctcert_expiration(),
        ecc::create_private_key(&otp.ctcert_private_key(), true),
        ecc::create_signature(&otp.ctcert_signature()),
    );

    let Some(root_public) = keys::root_public_key() else {
        error!("No ECC root public key available to verify the device certificate");
        return None;
    };
    if !cert.verify_myself(&root_public) {
        error!("CTCert failed verification");
        return None;
    }
    Some(cert)
}

/// Installs an OTP from raw bytes, deriving and verifying the device
/// certificate in the process.
pub fn load_otp_bytes(raw: &[u8]) -> SecureDataLoadStatus {
    let otp = match parse_otp(raw) {
        Ok(otp) => otp,
        Err(status) => {
            invalidate_otp();
            return status;
        }
    };

    let Some(ct_cert) = build_ct_cert(&otp) else {
        invalidate_otp();
        return SecureDataLoadStatus::InvalidSignature;
    };

    let mut guard = UNIQUE.write().unwrap();
    guard.otp = Some(otp);
    guard.ct_cert = Some(ct_cert);
    SecureDataLoadStatus::Loaded
}

pub fn load_otp() -> SecureDataLoadStatus {
    if UNIQUE.read().unwrap().otp.is_some() {
        return SecureDataLoadStatus::Loaded;
    }
    let raw = match std::fs::read(otp_path()) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return SecureDataLoadStatus::NotFound;
        }
        Err(_) => return SecureDataLoadStatus::IoError,
    };
    load_otp_bytes(&raw)
}

pub fn load_secure_info() -> SecureDataLoadStatus {
    {
        let guard = UNIQUE.read().unwrap();
        if guard.secure_info.is_some() {
            return if guard.secure_info_signature_valid {
                SecureDataLoadStatus::Loaded
            } else if guard.secure_info_region_changed {
                SecureDataLoadStatus::RegionChanged
            } else {
                SecureDataLoadStatus::InvalidSignature
            };
        }
    }

    let raw = match std::fs::read(secure_info_path()) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return SecureDataLoadStatus::NotFound;
        }
        Err(_) => return SecureDataLoadStatus::IoError,
    };
    if raw.len() != 0x111 {
        return SecureDataLoadStatus::Invalid;
    }
    let Ok(info) = SecureInfo::read(&mut Cursor::new(&raw)) else {
        return SecureDataLoadStatus::Invalid;
    };

    let signature_valid = info.verify_signature();
    let mut region_changed = false;
    if !signature_valid {
        // Distinguish a region change from plain corruption by testing the
        // signature against every other region byte.
        let mut copy = info.clone();
        for region in 0..REGION_COUNT {
            if region == info.region {
                continue;
            }
            copy.region = region;
            if copy.verify_signature() {
                region_changed = true;
                warn!("SecureInfo_A is region changed and its signature invalid");
                break;
            }
        }
        if !region_changed {
            warn!("SecureInfo_A signature check failed");
        }
    }

    let mut guard = UNIQUE.write().unwrap();
    guard.secure_info = Some(info);
    guard.secure_info_signature_valid = signature_valid;
    guard.secure_info_region_changed = region_changed;

    if signature_valid {
        SecureDataLoadStatus::Loaded
    } else if region_changed {
        SecureDataLoadStatus::RegionChanged
    } else {
        SecureDataLoadStatus::InvalidSignature
    }
}

pub fn load_lfcs() -> SecureDataLoadStatus {
    {
        let guard = UNIQUE.read().unwrap();
        if guard.lfcs.is_some() {
            return if guard.lfcs_signature_valid {
                SecureDataLoadStatus::Loaded
            } else {
                SecureDataLoadStatus::InvalidSignature
            };
        }
    }

    let raw = match std::fs::read(lfcs_path()) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return SecureDataLoadStatus::NotFound;
        }
        Err(_) => return SecureDataLoadStatus::IoError,
    };
    if raw.len() != 0x110 {
        return SecureDataLoadStatus::Invalid;
    }
    let Ok(lfcs) = LocalFriendCodeSeed::read(&mut Cursor::new(&raw)) else {
        return SecureDataLoadStatus::Invalid;
    };

    let signature_valid = lfcs.verify_signature();
    if !signature_valid {
        warn!("LocalFriendCodeSeed_B signature check failed");
    }

    let mut guard = UNIQUE.write().unwrap();
    guard.lfcs = Some(lfcs);
    guard.lfcs_signature_valid = signature_valid;

    if signature_valid {
        SecureDataLoadStatus::Loaded
    } else {
        SecureDataLoadStatus::InvalidSignature
    }
}

pub fn load_movable() -> SecureDataLoadStatus {
    {
        let guard = UNIQUE.read().unwrap();
        if guard.movable.is_some() {
            return if guard.movable_signature_valid {
                SecureDataLoadStatus::Loaded
            } else {
                SecureDataLoadStatus::InvalidSignature
            };
        }
    }

    let raw = match std::fs::read(movable_path()) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return SecureDataLoadStatus::NotFound;
        }
        Err(_) => return SecureDataLoadStatus::IoError,
    };
    if raw.len() != 0x120 && raw.len() != 0x140 {
        return SecureDataLoadStatus::Invalid;
    }
    let movable = match MovableSed::read(&mut Cursor::new(&raw)) {
        Ok(movable) if movable.is_valid() => movable,
        _ => return SecureDataLoadStatus::Invalid,
    };

    let signature_valid = movable.verify_signature();
    if !signature_valid {
        warn!("movable.sed signature check failed");
    }

    let mut guard = UNIQUE.write().unwrap();
    guard.movable = Some(movable);
    guard.movable_signature_valid = signature_valid;

    if signature_valid {
        SecureDataLoadStatus::Loaded
    } else {
        SecureDataLoadStatus::InvalidSignature
    }
}

pub fn otp() -> Option<Otp> {
    load_otp();
    UNIQUE.read().unwrap().otp.clone()
}

pub fn ct_cert() -> Option<Certificate> {
    load_otp();
    UNIQUE.read().unwrap().ct_cert.clone()
}

pub fn secure_info() -> Option<SecureInfo> {
    load_secure_info();
    UNIQUE.read().unwrap().secure_info.clone()
}

pub fn lfcs() -> Option<LocalFriendCodeSeed> {
    load_lfcs();
    UNIQUE.read().unwrap().lfcs.clone()
}

pub fn movable() -> Option<MovableSed> {
    load_movable();
    UNIQUE.read().unwrap().movable.clone()
}

fn invalidate_otp() {
    let mut guard = UNIQUE.write().unwrap();
    guard.otp = None;
    guard.ct_cert = None;
}

pub fn invalidate() {
    *UNIQUE.write().unwrap() = UniqueData::default();
}

/// Key and counter for a per-console wrapped file. The digest binds the
/// device certificate public key, the device id and the purpose tag.
pub fn unique_file_key(id: UniqueCryptoFileId) -> Option<(AesKey, AesIv)> {
    let otp = otp()?;
    let ct_cert = ct_cert()?;

    let mut input = Vec::with_capacity(0x44);
    input.extend_from_slice(&ct_cert.public_key_ecc().xy());
    input.extend_from_slice(&otp.device_id().to_le_bytes());
    input.extend_from_slice(&(id as u32).to_le_bytes());

    let digest = crypto::sha256(&input);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    let mut ctr = [0u8; 16];
    ctr[..12].copy_from_slice(&digest[16..28]);
    Some((key, ctr))
}
