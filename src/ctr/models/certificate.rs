use crate::crypto::ecc;
use crate::ctr::models::signature::SignatureType;
use binrw::{BinRead, BinWrite};
use log::error;
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u32)]
pub enum KeyType {
    /// 4096-bit RSA public key (modulus and public exponent)
    Rsa4096 = 0x0,
    /// 2048-bit RSA public key (modulus and public exponent)
    Rsa2048 = 0x1,
    /// sect233r1 ECC public key
    EllipticCurve = 0x2,
}

/// Certificates carry the public key used to verify child signatures and are
/// themselves signed, chaining up to a root whose public key is held in the
/// key store.
#[derive(Debug, Clone, BinRead, BinWrite)]
#[brw(big)]
pub struct Certificate {
    /// Signature Type
    pub signature_type: SignatureType,

    /// Signature over the serialized body, made by the issuer
    #[br(count = signature_type.signature_size())]
    pub signature: Vec<u8>,

    /// Padding aligning the body to 0x40 bytes
    #[br(count = signature_type.padding_size())]
    pub padding: Vec<u8>,

    /// Issuer chain, e.g. `Root-CA00000003`
    #[br(count = 0x40)]
    pub issuer: Vec<u8>,

    /// Key Type
    pub key_type: KeyType,

    /// Certificate name, e.g. `CT00C0FFEE-00`
    #[br(count = 0x40)]
    pub name: Vec<u8>,

    /// Expiration time as UNIX timestamp, used at least for device certs
    pub expiration_time: u32,

    /// Public Key
    #[br(args(key_type))]
    pub public_key: PublicKey,

    /// Private half for freshly built ECC certificates. Never serialized.
    #[br(ignore)]
    #[bw(ignore)]
    private_key_ecc: Option<ecc::PrivateKey>,
}

#[derive(Debug, Clone, BinRead, BinWrite)]
#[br(import(key_type: KeyType))]
pub enum PublicKey {
    #[br(pre_assert(key_type == KeyType::Rsa4096))]
    Rsa4096 {
        #[br(count = 0x200)]
        modulus: Vec<u8>,
        #[brw(big)]
        public_exponent: u32,
        #[br(count = 0x34)]
        padding: Vec<u8>,
    },
    #[br(pre_assert(key_type == KeyType::Rsa2048))]
    Rsa2048 {
        #[br(count = 0x100)]
        modulus: Vec<u8>,
        #[brw(big)]
        public_exponent: u32,
        #[br(count = 0x34)]
        padding: Vec<u8>,
    },
    #[br(pre_assert(key_type == KeyType::EllipticCurve))]
    EllipticCurve {
        #[br(count = 0x3C)]
        public_key: Vec<u8>,
        #[br(count = 0x3C)]
        padding: Vec<u8>,
    },
}

fn padded_name(text: &str) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.truncate(0x40);
    out.resize(0x40, 0);
    out
}

fn trimmed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Certificate {
    /// Builds a fresh ECC certificate signed by `parent`. The parent is only
    /// borrowed for signing; the result owns all of its bytes. A failed
    /// post-construction self check is logged but still returns the
    /// certificate, the caller decides what to do with it.
    pub fn build_ecc(parent: &Certificate, issuer: &str, name: &str, expiration: u32) -> Certificate {
        let (private_key, public_key) = ecc::generate_key_pair();

        let mut cert = Certificate {
            signature_type: SignatureType::EcdsaSha256,
            signature: vec![0; SignatureType::EcdsaSha256.signature_size()],
            padding: vec![0; SignatureType::EcdsaSha256.padding_size()],
            issuer: padded_name(issuer),
            key_type: KeyType::EllipticCurve,
            name: padded_name(name),
            expiration_time: expiration,
            public_key: PublicKey::EllipticCurve {
                public_key: public_key.xy().to_vec(),
                padding: vec![0; 0x3C],
            },
            private_key_ecc: Some(private_key),
        };

        let signature = parent.sign(&cert.serialize_body());
        cert.signature = signature.rs()[..0x3C].to_vec();

        if !cert.verify_myself(&parent.public_key_ecc()) {
            error!("Failed to verify newly generated certificate");
        }
        cert
    }

    /// Rebuilds a device certificate from provisioned material: the private
    /// key and the issuer signature both come from console-unique storage.
    pub fn build_device(
        issuer: &str,
        name: &str,
        expiration: u32,
        private_key: ecc::PrivateKey,
        signature: ecc::Signature,
    ) -> Certificate {
        let public_key = ecc::make_public_key(&private_key);
        Certificate {
            signature_type: SignatureType::EcdsaSha256,
            signature: signature.rs()[..0x3C].to_vec(),
            padding: vec![0; SignatureType::EcdsaSha256.padding_size()],
            issuer: padded_name(issuer),
            key_type: KeyType::EllipticCurve,
            name: padded_name(name),
            expiration_time: expiration,
            public_key: PublicKey::EllipticCurve {
                public_key: public_key.xy().to_vec(),
                padding: vec![0; 0x3C],
            },
            private_key_ecc: Some(private_key),
        }
    }

    pub fn from_bytes(data: &[u8]) -> binrw::BinResult<Certificate> {
        Certificate::read(&mut Cursor::new(data))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut Cursor::new(&mut buf))
            .expect("certificate serialization cannot fail");
        buf
    }

    /// The signed region: issuer through public key, zero-padded so that the
    /// total (with its one-past marker) lands on a 0x40 boundary.
    pub fn serialize_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.issuer);
        body.extend_from_slice(&(self.key_type as u32).to_be_bytes());
        body.extend_from_slice(&self.name);
        body.extend_from_slice(&self.expiration_time.to_be_bytes());
        match &self.public_key {
            PublicKey::Rsa4096 { modulus, public_exponent, .. }
            | PublicKey::Rsa2048 { modulus, public_exponent, .. } => {
                body.extend_from_slice(modulus);
                body.extend_from_slice(&public_exponent.to_be_bytes());
            }
            PublicKey::EllipticCurve { public_key, .. } => {
                body.extend_from_slice(public_key);
            }
        }
        let aligned = crate::ctr::util::align_up(body.len() as u64 + 1, 0x40) as usize;
        body.resize(aligned, 0);
        body
    }

    pub fn issuer_str(&self) -> String {
        trimmed_name(&self.issuer)
    }

    pub fn name_str(&self) -> String {
        trimmed_name(&self.name)
    }

    pub fn public_key_ecc(&self) -> ecc::PublicKey {
        match &self.public_key {
            PublicKey::EllipticCurve { public_key, .. } => ecc::create_public_key(public_key),
            _ => {
                error!("Certificate is not ECC");
                ecc::PublicKey::default()
            }
        }
    }

    pub fn private_key_ecc(&self) -> Option<&ecc::PrivateKey> {
        self.private_key_ecc.as_ref()
    }

    pub fn set_private_key_ecc(&mut self, private_key: ecc::PrivateKey) {
        if self.key_type != KeyType::EllipticCurve {
            error!("Certificate is not ECC");
            return;
        }
        self.private_key_ecc = Some(private_key);
    }

    /// Checks this certificate's own signature against the issuer's public
    /// key. Only ECDSA parents are supported; other types fail the check.
    pub fn verify_myself(&self, parent_public: &ecc::PublicKey) -> bool {
        if self.signature_type != SignatureType::EcdsaSha256 {
            return false;
        }
        ecc::verify(
            &self.serialize_body(),
            &ecc::create_signature(&self.signature),
            parent_public,
        )
    }

    /// Verifies `data` against this certificate's embedded key. Unsupported
    /// key types return false without raising.
    pub fn verify(&self, data: &[u8], signature: &ecc::Signature) -> bool {
        match self.key_type {
            KeyType::EllipticCurve => ecc::verify(data, signature, &self.public_key_ecc()),
            _ => false,
        }
    }

    pub fn sign(&self, data: &[u8]) -> ecc::Signature {
        match &self.private_key_ecc {
            Some(private_key) if self.key_type == KeyType::EllipticCurve => {
                ecc::sign(data, private_key)
            }
            _ => {
                error!("Certificate cannot sign, no ECC private key");
                ecc::Signature::default()
            }
        }
    }

    pub fn ecdh_agree(&self, others_public_key: &ecc::PublicKey) -> Vec<u8> {
        if self.key_type != KeyType::EllipticCurve {
            error!("Tried to agree with a non ECC certificate");
            return Vec::new();
        }
        match &self.private_key_ecc {
            Some(private_key) => ecc::agree(private_key, others_public_key),
            None => {
                error!("Certificate has no ECC private key for agreement");
                Vec::new()
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.signature.is_empty()
    }
}
