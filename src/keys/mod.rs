//! Process-wide key store: slotted AES keys with hardware-style normal-key
//! generation, RSA slots and the ECC root public key, loaded from a plain
//! text table grouped by `:AES` / `:RSA` / `:ECC` sections. When no table
//! file exists, a bundled encrypted copy is decrypted and parsed instead.

mod default_keys;
pub mod rsa;

use self::rsa::RsaSlot;
use crate::crypto::{self, AesIv, AesKey, ecc};
use crate::dirs;
use lazy_static::lazy_static;
use log::error;
use std::fs;
use std::sync::RwLock;

pub const KEYS_FILE: &str = "aes_keys.txt";

pub mod slot_id {
    pub const NCCH_SECURE1: usize = 0x2C;
    pub const NCCH_SECURE2: usize = 0x25;
    pub const NCCH_SECURE3: usize = 0x18;
    pub const NCCH_SECURE4: usize = 0x1B;
    pub const MOVABLE_SOURCE: usize = 0x35;
    pub const DLP_NFC_DATA_KEY: usize = 0x39;
    pub const TICKET_COMMON_KEY: usize = 0x3D;
    pub const MAX: usize = 0x40;
}

pub const MAX_COMMON_KEYS: usize = 6;
pub const NUM_NFC_SECRETS: usize = 2;

/// `Normal = ROL128((ROL128(X, 2) XOR Y) + C, 87)`. The hardware generator
/// is not observable, so the constant comes from the key table.
pub fn scramble(key_x: &AesKey, key_y: &AesKey, constant: &AesKey) -> AesKey {
    let x = u128::from_be_bytes(*key_x);
    let y = u128::from_be_bytes(*key_y);
    let c = u128::from_be_bytes(*constant);
    (x.rotate_left(2) ^ y)
        .wrapping_add(c)
        .rotate_left(87)
        .to_be_bytes()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeySlot {
    x: Option<AesKey>,
    y: Option<AesKey>,
    normal: Option<AesKey>,
}

impl KeySlot {
    fn set_key_x(&mut self, key: Option<AesKey>, constant: &AesKey) {
        self.x = key;
        self.generate_normal(constant);
    }

    fn set_key_y(&mut self, key: Option<AesKey>, constant: &AesKey) {
        self.y = key;
        self.generate_normal(constant);
    }

    fn set_normal(&mut self, key: Option<AesKey>) {
        self.normal = key;
    }

    fn generate_normal(&mut self, constant: &AesKey) {
        self.normal = match (&self.x, &self.y) {
            (Some(x), Some(y)) => Some(scramble(x, y, constant)),
            _ => None,
        };
    }
}

#[derive(Debug, Clone, Default)]
pub struct NfcSecret {
    pub phrase: Vec<u8>,
    pub seed: Vec<u8>,
    pub hmac_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    generator_constant: AesKey,
    slots: [KeySlot; slot_id::MAX],
    common_key_y: [Option<AesKey>; MAX_COMMON_KEYS],
    dlp_nfc_key_y: [Option<AesKey>; 2],
    nfc_secrets: [NfcSecret; NUM_NFC_SECRETS],
    nfc_iv: Option<AesIv>,
    otp_key: Option<AesKey>,
    otp_iv: Option<AesIv>,
    movable_key: KeySlot,
    movable_cmac: KeySlot,
    rsa_slots: [RsaSlot; 4],
    rsa_ticket_wrap: RsaSlot,
    rsa_secure_info: RsaSlot,
    rsa_lfcs: RsaSlot,
    ecc_root_public: Option<ecc::PublicKey>,
}

impl Default for KeyStore {
    fn default() -> Self {
        KeyStore {
            generator_constant: [0; 16],
            slots: [KeySlot::default(); slot_id::MAX],
            common_key_y: [None; MAX_COMMON_KEYS],
            dlp_nfc_key_y: [None; 2],
            nfc_secrets: Default::default(),
            nfc_iv: None,
            otp_key: None,
            otp_iv: None,
            movable_key: KeySlot::default(),
            movable_cmac: KeySlot::default(),
            rsa_slots: Default::default(),
            rsa_ticket_wrap: RsaSlot::default(),
            rsa_secure_info: RsaSlot::default(),
            rsa_lfcs: RsaSlot::default(),
            ecc_root_public: None,
        }
    }
}

fn parse_key(value: &str) -> Option<AesKey> {
    let bytes = hex::decode(value).ok()?;
    bytes.as_slice().try_into().ok()
}

fn parse_key_slot_name(name: &str) -> Option<(usize, char)> {
    let rest = name.strip_prefix("slot0x")?;
    let pos = rest.find("Key")?;
    let slot = usize::from_str_radix(&rest[..pos], 16).ok()?;
    let mut suffix = rest[pos + 3..].chars();
    let kind = suffix.next()?;
    if suffix.next().is_some() {
        return None;
    }
    Some((slot, kind))
}

fn parse_rsa_slot_name(name: &str) -> Option<(usize, char)> {
    let rest = name.strip_prefix("slot0x")?;
    if rest.len() < 2 {
        return None;
    }
    let (digits, suffix) = rest.split_at(rest.len() - 1);
    let slot = usize::from_str_radix(digits, 16).ok()?;
    Some((slot, suffix.chars().next()?))
}

fn parse_indexed_name<'a>(name: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = name.strip_prefix(prefix)?;
    let digits_end = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .map(|(i, _)| i + 1)
        .last()?;
    let index = rest[..digits_end].parse().ok()?;
    Some((index, &rest[digits_end..]))
}

impl KeyStore {
    /// Parses a key table. Unknown or malformed entries are logged and
    /// skipped, matching how the table format evolved over time.
    pub fn from_table(text: &str) -> KeyStore {
        let mut store = KeyStore::default();
        let mut mode = "";

        for raw_line in text.lines() {
            let line = raw_line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix(':') {
                mode = section;
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                error!("Failed to parse {line}");
                continue;
            };
            match mode {
                "AES" => store.parse_aes_entry(name, value),
                "RSA" => store.parse_rsa_entry(name, value),
                "ECC" => store.parse_ecc_entry(name, value),
                _ => {}
            }
        }

        let movable_x = store.slots[slot_id::MOVABLE_SOURCE].x;
        let constant = store.generator_constant;
        store.movable_key.set_key_x(movable_x, &constant);
        store.movable_cmac.set_key_x(movable_x, &constant);

        store
    }

    fn parse_aes_entry(&mut self, name: &str, value: &str) {
        if let Some((index, field)) = parse_indexed_name(name, "nfcSecret") {
            let Ok(bytes) = hex::decode(value) else {
                error!("Invalid NFC secret {value}");
                return;
            };
            if index >= self.nfc_secrets.len() {
                error!("Invalid NFC secret index {index}");
                return;
            }
            match field {
                "Phrase" => self.nfc_secrets[index].phrase = bytes,
                "Seed" => self.nfc_secrets[index].seed = bytes,
                "HmacKey" => self.nfc_secrets[index].hmac_key = bytes,
                _ => error!("Invalid NFC secret '{name}'"),
            }
            return;
        }

        let Some(key) = parse_key(value) else {
            error!("Invalid key {value}");
            return;
        };

        if let Some((index, rest)) = parse_indexed_name(name, "common") {
            if !rest.is_empty() || index >= MAX_COMMON_KEYS {
                error!("Invalid common key entry '{name}'");
            } else {
                self.common_key_y[index] = Some(key);
            }
            return;
        }

        match name {
            "generatorConstant" => {
                self.generator_constant = key;
                // Recompute every slot that already has both halves.
                let constant = self.generator_constant;
                for slot in &mut self.slots {
                    slot.generate_normal(&constant);
                }
            }
            "otpKey" => self.otp_key = Some(key),
            "otpIV" => self.otp_iv = Some(key),
            "movableKeyY" => {
                let constant = self.generator_constant;
                self.movable_key.set_key_y(Some(key), &constant);
            }
            "movableCmacY" => {
                let constant = self.generator_constant;
                self.movable_cmac.set_key_y(Some(key), &constant);
            }
            "dlpKeyY" => self.dlp_nfc_key_y[0] = Some(key),
            "nfcKeyY" => self.dlp_nfc_key_y[1] = Some(key),
            "nfcIv" => self.nfc_iv = Some(key),
            _ => {
                let Some((slot, kind)) = parse_key_slot_name(name) else {
                    error!("Invalid key name '{name}'");
                    return;
                };
                if slot >= slot_id::MAX {
                    error!("Out of range key slot ID {slot:#X}");
                    return;
                }
                let constant = self.generator_constant;
                match kind {
                    'X' => self.slots[slot].set_key_x(Some(key), &constant),
                    'Y' => self.slots[slot].set_key_y(Some(key), &constant),
                    'N' => self.slots[slot].set_normal(Some(key)),
                    _ => error!("Invalid key type '{kind}'"),
                }
            }
        }
    }

    fn parse_rsa_entry(&mut self, name: &str, value: &str) {
        let Ok(bytes) = hex::decode(value) else {
            error!("Invalid key {value}");
            return;
        };
        match name {
            "ticketWrapExp" => self.rsa_ticket_wrap.set_exponent(bytes),
            "ticketWrapMod" => self.rsa_ticket_wrap.set_modulus(bytes),
            "secureInfoExp" => self.rsa_secure_info.set_exponent(bytes),
            "secureInfoMod" => self.rsa_secure_info.set_modulus(bytes),
            "lfcsExp" => self.rsa_lfcs.set_exponent(bytes),
            "lfcsMod" => self.rsa_lfcs.set_modulus(bytes),
            _ => {
                let Some((slot, kind)) = parse_rsa_slot_name(name) else {
                    error!("Invalid key name '{name}'");
                    return;
                };
                if slot >= self.rsa_slots.len() {
                    error!("Out of range key slot ID {slot:#X}");
                    return;
                }
                match kind {
                    'X' => self.rsa_slots[slot].set_exponent(bytes),
                    'M' => self.rsa_slots[slot].set_modulus(bytes),
                    'P' => self.rsa_slots[slot].set_private_d(bytes),
                    _ => error!("Invalid key type '{kind}'"),
                }
            }
        }
    }

    fn parse_ecc_entry(&mut self, name: &str, value: &str) {
        let Ok(bytes) = hex::decode(value) else {
            error!("Invalid key {value}");
            return;
        };
        if name == "rootPublicXY" {
            self.ecc_root_public = Some(ecc::create_public_key(&bytes));
        } else {
            error!("Invalid key name '{name}'");
        }
    }

    pub fn generator_constant(&self) -> AesKey {
        self.generator_constant
    }

    pub fn set_key_x(&mut self, slot: usize, key: AesKey) {
        let constant = self.generator_constant;
        self.slots[slot].set_key_x(Some(key), &constant);
    }

    pub fn set_key_y(&mut self, slot: usize, key: AesKey) {
        let constant = self.generator_constant;
        self.slots[slot].set_key_y(Some(key), &constant);
    }

    pub fn set_normal_key(&mut self, slot: usize, key: AesKey) {
        self.slots[slot].set_normal(Some(key));
    }

    pub fn is_key_x_available(&self, slot: usize) -> bool {
        self.slots[slot].x.is_some()
    }

    pub fn is_normal_key_available(&self, slot: usize) -> bool {
        self.slots[slot].normal.is_some()
    }

    pub fn normal_key(&self, slot: usize) -> Option<AesKey> {
        self.slots[slot].normal
    }

    /// Rebinds the ticket common-key slot to common key Y `index`.
    pub fn select_common_key_index(&mut self, index: u8) {
        let key = self
            .common_key_y
            .get(index as usize)
            .copied()
            .flatten();
        let constant = self.generator_constant;
        self.slots[slot_id::TICKET_COMMON_KEY].set_key_y(key, &constant);
    }

    pub fn otp_key_iv(&self) -> Option<(AesKey, AesIv)> {
        Some((self.otp_key?, self.otp_iv?))
    }

    pub fn movable_key(&self, cmac: bool) -> Option<AesKey> {
        if cmac {
            self.movable_cmac.normal
        } else {
            self.movable_key.normal
        }
    }

    pub fn rsa_slot(&self, slot: usize) -> RsaSlot {
        self.rsa_slots.get(slot).cloned().unwrap_or_default()
    }

    pub fn ticket_wrap_slot(&self) -> RsaSlot {
        self.rsa_ticket_wrap.clone()
    }

    pub fn secure_info_slot(&self) -> RsaSlot {
        self.rsa_secure_info.clone()
    }

    pub fn lfcs_slot(&self) -> RsaSlot {
        self.rsa_lfcs.clone()
    }

    pub fn root_public_key(&self) -> Option<ecc::PublicKey> {
        self.ecc_root_public
    }

    pub fn nfc_secret(&self, index: usize) -> Option<&NfcSecret> {
        self.nfc_secrets.get(index)
    }

    pub fn nfc_iv(&self) -> Option<AesIv> {
        self.nfc_iv
    }
}

lazy_static! {
    static ref STORE: RwLock<Option<KeyStore>> = RwLock::new(None);
}

fn load_table_text() -> String {
    let path = dirs::sys_data_dir().join(KEYS_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => {
            let mut blob = default_keys::DEFAULT_KEYS_ENC.to_vec();
            crypto::cbc_decrypt(&[0u8; 16], &[0u8; 16], &mut blob);
            String::from_utf8_lossy(&blob).into_owned()
        }
    }
}

/// Builds the store on first use. Subsequent calls are no-ops.
pub fn init() {
    if STORE.read().unwrap().is_some() {
        return;
    }
    let store = KeyStore::from_table(&load_table_text());
    let mut guard = STORE.write().unwrap();
    if guard.is_none() {
        *guard = Some(store);
    }
}

/// Replaces the process-wide store outright. Used on key-table reload and by
/// tests that need a deterministic environment.
pub fn install_store(store: KeyStore) {
    *STORE.write().unwrap() = Some(store);
}

pub fn with_store<R>(f: impl FnOnce(&KeyStore) -> R) -> R {
    init();
    f(STORE.read().unwrap().as_ref().unwrap())
}

pub fn with_store_mut<R>(f: impl FnOnce(&mut KeyStore) -> R) -> R {
    init();
    f(STORE.write().unwrap().as_mut().unwrap())
}

pub fn normal_key(slot: usize) -> Option<AesKey> {
    with_store(|s| s.normal_key(slot))
}

pub fn is_normal_key_available(slot: usize) -> bool {
    with_store(|s| s.is_normal_key_available(slot))
}

pub fn select_common_key_index(index: u8) {
    with_store_mut(|s| s.select_common_key_index(index));
}

pub fn otp_key_iv() -> Option<(AesKey, AesIv)> {
    with_store(|s| s.otp_key_iv())
}

pub fn root_public_key() -> Option<ecc::PublicKey> {
    with_store(|s| s.root_public_key())
}

/// Binds `key_y` into an NCCH secure slot and returns the resulting normal
/// key, atomically with respect to other derivations.
pub fn ncch_normal_key(slot: usize, key_y: &AesKey) -> Option<AesKey> {
    with_store_mut(|s| {
        s.set_key_y(slot, *key_y);
        s.normal_key(slot)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
# comment line
:AES
generatorConstant=1FF9E9AAC5FE0408024591DC5D52768A
slot0x2CKeyX=B98E95CECA3E4D171F76A94DE934C053
slot0x3DKeyN=000102030405060708090A0B0C0D0E0F
common0=64C5FD55DD3AD988325BAAEC5243DB98
common1=4AAA3D0E27D4D728D0B1B433F0F9CBC8
:RSA
ticketWrapExp=010001
ticketWrapMod=C0FFEE
slot0x0X=03
slot0x0M=BB
:ECC
rootPublicXY=0102
";

    #[test]
    fn scramble_matches_reference() {
        // NormalKey = ROL128((ROL128(X, 2) XOR Y) + C, 87); the expected
        // value was computed out of band for this (X, Y, C) triple.
        let x = [0x5A; 16];
        let y = [0x3D; 16];
        let c = parse_key("1FF9E9AAC5FE0408024591DC5D52768A").unwrap();

        let expected = parse_key("1858D3656F3A271EFF8D292C2E2B4CF3").unwrap();
        assert_eq!(scramble(&x, &y, &c), expected);
    }

    #[test]
    fn slot_regenerates_normal_when_either_half_changes() {
        let constant = [0x11u8; 16];
        let mut slot = KeySlot::default();
        slot.set_key_x(Some([0xAA; 16]), &constant);
        assert!(slot.normal.is_none());

        slot.set_key_y(Some([0xBB; 16]), &constant);
        let first = slot.normal.unwrap();
        assert_eq!(first, scramble(&[0xAA; 16], &[0xBB; 16], &constant));

        slot.set_key_x(Some([0xCC; 16]), &constant);
        let second = slot.normal.unwrap();
        assert_ne!(first, second);

        // Direct normal assignment leaves the halves alone.
        slot.set_normal(Some([0x0F; 16]));
        assert_eq!(slot.x, Some([0xCC; 16]));
        assert_eq!(slot.y, Some([0xBB; 16]));
    }

    #[test]
    fn table_parsing_covers_all_sections() {
        let store = KeyStore::from_table(TABLE);

        assert_eq!(
            store.generator_constant(),
            parse_key("1FF9E9AAC5FE0408024591DC5D52768A").unwrap()
        );
        assert!(store.is_key_x_available(slot_id::NCCH_SECURE1));
        assert!(store.is_normal_key_available(slot_id::TICKET_COMMON_KEY));
        assert!(store.ticket_wrap_slot().is_ready());
        assert_eq!(store.rsa_slot(0).modulus(), &[0xBB]);
        assert!(store.root_public_key().is_some());
    }

    #[test]
    fn common_key_selection_rebinds_ticket_slot() {
        let mut store = KeyStore::from_table(TABLE);

        // The slot has no KeyX, so only the preset normal key exists until a
        // slot with both halves is built; selection still swaps the Y half.
        store.select_common_key_index(0);
        assert!(!store.is_normal_key_available(slot_id::TICKET_COMMON_KEY));

        store.set_key_x(slot_id::TICKET_COMMON_KEY, [0x77; 16]);
        store.select_common_key_index(1);
        let with_one = store.normal_key(slot_id::TICKET_COMMON_KEY).unwrap();
        store.select_common_key_index(0);
        let with_zero = store.normal_key(slot_id::TICKET_COMMON_KEY).unwrap();
        assert_ne!(with_one, with_zero);

        // Out-of-range index clears the binding.
        store.select_common_key_index(9);
        assert!(!store.is_normal_key_available(slot_id::TICKET_COMMON_KEY));
    }

    #[test]
    fn bundled_table_decrypts_and_parses() {
        let mut blob = default_keys::DEFAULT_KEYS_ENC.to_vec();
        crypto::cbc_decrypt(&[0u8; 16], &[0u8; 16], &mut blob);
        let text = String::from_utf8_lossy(&blob).into_owned();
        let store = KeyStore::from_table(&text);

        assert!(store.is_key_x_available(slot_id::NCCH_SECURE1));
        assert!(store.is_key_x_available(slot_id::NCCH_SECURE2));
        assert!(store.is_key_x_available(slot_id::NCCH_SECURE3));
        assert!(store.is_key_x_available(slot_id::NCCH_SECURE4));
        assert_ne!(store.generator_constant(), [0u8; 16]);
    }
}
