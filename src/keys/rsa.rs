use log::error;
use num_bigint_dig::BigUint;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::Sha256;

use crate::crypto::sha256;

// ASN.1 DigestInfo prefix for SHA-256 inside PKCS#1 v1.5 signatures.
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

/// One RSA key slot from the key table: public (exponent, modulus) and an
/// optional private exponent for slots that are allowed to sign.
#[derive(Debug, Clone, Default)]
pub struct RsaSlot {
    exponent: Vec<u8>,
    modulus: Vec<u8>,
    private_d: Vec<u8>,
}

impl RsaSlot {
    pub fn set_exponent(&mut self, exponent: Vec<u8>) {
        self.exponent = exponent;
    }

    pub fn set_modulus(&mut self, modulus: Vec<u8>) {
        self.modulus = modulus;
    }

    pub fn set_private_d(&mut self, private_d: Vec<u8>) {
        self.private_d = private_d;
    }

    pub fn is_ready(&self) -> bool {
        !self.exponent.is_empty() && !self.modulus.is_empty()
    }

    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Raw RSA: `message ^ exponent mod modulus`, encoded big-endian into
    /// `out_size` bytes (or the minimal encoding when `None`).
    pub fn modular_exponentiation(&self, message: &[u8], out_size: Option<usize>) -> Vec<u8> {
        let result = BigUint::from_bytes_be(message).modpow(
            &BigUint::from_bytes_be(&self.exponent),
            &BigUint::from_bytes_be(&self.modulus),
        );
        let raw = result.to_bytes_be();
        match out_size {
            None => raw,
            Some(size) if size >= raw.len() => {
                let mut out = vec![0u8; size];
                out[size - raw.len()..].copy_from_slice(&raw);
                out
            }
            Some(size) => raw[raw.len() - size..].to_vec(),
        }
    }

    /// PKCS#1 v1.5 SHA-256 signature using the slot's private exponent.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        if self.private_d.is_empty() {
            error!("Cannot sign, RSA slot does not have a private key");
            return Vec::new();
        }

        let k = self.modulus.len();
        let digest = sha256(message);
        let ps_len = k - 3 - SHA256_DIGEST_INFO.len() - digest.len();

        let mut em = Vec::with_capacity(k);
        em.push(0x00);
        em.push(0x01);
        em.resize(2 + ps_len, 0xFF);
        em.push(0x00);
        em.extend_from_slice(&SHA256_DIGEST_INFO);
        em.extend_from_slice(&digest);

        let signature = BigUint::from_bytes_be(&em).modpow(
            &BigUint::from_bytes_be(&self.private_d),
            &BigUint::from_bytes_be(&self.modulus),
        );
        let raw = signature.to_bytes_be();
        let mut out = vec![0u8; k];
        out[k - raw.len()..].copy_from_slice(&raw);
        out
    }

    /// PKCS#1 v1.5 SHA-256 verification. Never raises; malformed keys or
    /// signatures simply fail the check.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(public_key) = RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from_bytes_be(&self.exponent),
        ) else {
            return false;
        };
        public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &sha256(message), signature)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};

    fn generated_slot() -> RsaSlot {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let mut slot = RsaSlot::default();
        slot.set_modulus(private_key.n().to_bytes_be());
        slot.set_exponent(private_key.e().to_bytes_be());
        slot.set_private_d(private_key.d().to_bytes_be());
        slot
    }

    #[test]
    fn sign_verify_roundtrip() {
        let slot = generated_slot();
        let signature = slot.sign(b"ticket body");
        assert_eq!(signature.len(), 256);
        assert!(slot.verify(b"ticket body", &signature));
        assert!(!slot.verify(b"other body", &signature));
    }

    #[test]
    fn modular_exponentiation_sizes() {
        let mut slot = RsaSlot::default();
        // 187 = 11 * 17, e = 3: 4^3 mod 187 = 64
        slot.set_modulus(vec![0xBB]);
        slot.set_exponent(vec![0x03]);
        assert_eq!(slot.modular_exponentiation(&[0x04], None), vec![0x40]);
        assert_eq!(
            slot.modular_exponentiation(&[0x04], Some(4)),
            vec![0, 0, 0, 0x40]
        );
    }

    #[test]
    fn sign_without_private_key_is_empty() {
        let mut slot = RsaSlot::default();
        slot.set_modulus(vec![0xBB; 256]);
        slot.set_exponent(vec![0x01, 0x00, 0x01]);
        assert!(slot.sign(b"data").is_empty());
    }
}
