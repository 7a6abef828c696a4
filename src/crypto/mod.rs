use aes::Aes128;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher, StreamCipherSeek};
use block_padding::NoPadding;
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub mod ecc;

pub type Aes128CbcDec = cbc::Decryptor<Aes128>;
pub type Aes128CbcEnc = cbc::Encryptor<Aes128>;
pub type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub type AesKey = [u8; 16];
pub type AesIv = [u8; 16];

/// AES-128-CBC in-place decryption without padding. `data` must be a whole
/// number of blocks; anything else is a caller bug.
pub fn cbc_decrypt(key: &AesKey, iv: &AesIv, data: &mut [u8]) {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .expect("data length must be block aligned");
}

/// AES-128-CBC in-place encryption without padding.
pub fn cbc_encrypt(key: &AesKey, iv: &AesIv, data: &mut [u8]) {
    let len = data.len();
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .expect("data length must be block aligned");
}

/// AES-128-CTR keystream positioned at the start of the stream.
pub fn ctr_cipher(key: &AesKey, ctr: &AesIv) -> Aes128Ctr {
    Aes128Ctr::new(key.into(), ctr.into())
}

/// AES-128-CTR keystream pre-seeked to an arbitrary byte offset, so a region
/// can be decrypted from the middle without replaying earlier blocks.
pub fn ctr_cipher_at(key: &AesKey, ctr: &AesIv, offset: u64) -> Aes128Ctr {
    let mut cipher = ctr_cipher(key, ctr);
    if offset != 0 {
        cipher.seek(offset);
    }
    cipher
}

pub fn ctr_apply(key: &AesKey, ctr: &AesIv, offset: u64, data: &mut [u8]) {
    ctr_cipher_at(key, ctr, offset).apply_keystream(data);
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}
