use binrw::{BinRead, BinWrite};

/// The signature method is determined by a big-endian tag in front of the
/// signature bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u32)]
pub enum SignatureType {
    /// RSA_4096 SHA1 (legacy, not produced anymore)
    Rsa4096Sha1 = 0x010000,

    /// RSA_2048 SHA1 (legacy, not produced anymore)
    Rsa2048Sha1 = 0x010001,

    /// Elliptic Curve with SHA1 (legacy, not produced anymore)
    EllipticCurveSha1 = 0x010002,

    /// RSA_4096 SHA256
    Rsa4096Sha256 = 0x010003,

    /// RSA_2048 SHA256
    Rsa2048Sha256 = 0x010004,

    /// ECDSA with SHA256
    EcdsaSha256 = 0x010005,
}

impl SignatureType {
    pub fn signature_size(&self) -> usize {
        match self {
            Self::Rsa4096Sha1 | Self::Rsa4096Sha256 => 0x200,
            Self::Rsa2048Sha1 | Self::Rsa2048Sha256 => 0x100,
            Self::EllipticCurveSha1 | Self::EcdsaSha256 => 0x3C,
        }
    }

    /// Padding bringing the signed body to the next 0x40 boundary after
    /// tag + signature.
    pub fn padding_size(&self) -> usize {
        match self {
            Self::Rsa4096Sha1 | Self::Rsa4096Sha256 => 0x3C,
            Self::Rsa2048Sha1 | Self::Rsa2048Sha256 => 0x3C,
            Self::EllipticCurveSha1 | Self::EcdsaSha256 => 0x40,
        }
    }

    /// Offset of the signed body from the start of the signature block.
    pub fn body_offset(&self) -> usize {
        4 + self.signature_size() + self.padding_size()
    }
}

/// Generic signature data structure shared by tickets, title metadata and
/// certificates.
#[derive(Debug, Clone, BinRead, BinWrite)]
pub struct SignatureData {
    #[brw(big)]
    pub signature_type: SignatureType,
    #[br(count = signature_type.signature_size())]
    pub signature: Vec<u8>,
    #[br(count = signature_type.padding_size())]
    pub padding: Vec<u8>,
}

impl SignatureData {
    pub fn new(signature_type: SignatureType, signature: Vec<u8>) -> SignatureData {
        SignatureData {
            signature_type,
            signature,
            padding: vec![0; signature_type.padding_size()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn signature_sizes() {
        assert_eq!(SignatureType::Rsa4096Sha256.signature_size(), 0x200);
        assert_eq!(SignatureType::Rsa2048Sha256.signature_size(), 0x100);
        assert_eq!(SignatureType::EcdsaSha256.signature_size(), 0x3C);
    }

    #[test]
    fn body_is_always_0x40_aligned() {
        for ty in [
            SignatureType::Rsa4096Sha256,
            SignatureType::Rsa2048Sha256,
            SignatureType::EcdsaSha256,
        ] {
            assert_eq!(ty.body_offset() % 0x40, 0);
        }
    }

    #[test]
    fn signature_data_roundtrip() {
        let sig_data = SignatureData::new(SignatureType::EcdsaSha256, vec![0xAA; 0x3C]);

        let mut buf = Vec::new();
        sig_data.write_be(&mut Cursor::new(&mut buf)).unwrap();
        assert_eq!(buf.len(), 0x80); // 4 + 0x3C + 0x40

        let mut cursor = Cursor::new(&buf);
        let read_back = SignatureData::read_be(&mut cursor).unwrap();
        assert_eq!(sig_data.signature_type, read_back.signature_type);
        assert_eq!(sig_data.signature, read_back.signature);
        assert_eq!(sig_data.padding, read_back.padding);
    }
}
