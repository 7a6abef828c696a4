//! ECDSA, ECDH and key generation on sect233r1, the curve used by device
//! certificates and personalized tickets. No ecosystem crate covers binary
//! curves, so the group law lives here on top of the GF(2^233) field module;
//! scalar arithmetic modulo the subgroup order uses the same bigint backend
//! as the RSA stack.

mod field;

use crate::crypto::sha256;
use field::FieldElement;
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use log::error;
use num_bigint_dig::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

/// Coordinate and scalar size for sect233r1.
pub const INT_SIZE: usize = 0x1E;

// Curve: y^2 + xy = x^3 + a*x^2 + b with a = 1.
const CURVE_B: [u8; INT_SIZE] =
    hex_literal::hex!("0066647EDE6C332C7F8C0923BB58213B333B20E9CE4281FE115F7D8F90AD");
const GEN_X: [u8; INT_SIZE] =
    hex_literal::hex!("00FAC9DFCBAC8313BB2139F1BB755FEF65BC391F8B36F8F8EB7371FD558B");
const GEN_Y: [u8; INT_SIZE] =
    hex_literal::hex!("01006A08A41903350678E58528BEBF8A0BEFF867A7CA36716F7E01F81052");
const ORDER: [u8; INT_SIZE] =
    hex_literal::hex!("01000000000000000000000000000013E974E72F8A6922031D2603CFE0D7");

lazy_static! {
    static ref N: BigUint = BigUint::from_bytes_be(&ORDER);
    static ref GENERATOR: Point = Point {
        x: FieldElement::from_bytes(&GEN_X),
        y: FieldElement::from_bytes(&GEN_Y),
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PrivateKey {
    pub x: [u8; INT_SIZE],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PublicKey {
    pub x: [u8; INT_SIZE],
    pub y: [u8; INT_SIZE],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Signature {
    pub r: [u8; INT_SIZE],
    pub s: [u8; INT_SIZE],
}

impl PublicKey {
    /// Concatenated (x, y) coordinates, the wire layout used by tickets
    /// and certificates.
    pub fn xy(&self) -> [u8; INT_SIZE * 2] {
        let mut out = [0u8; INT_SIZE * 2];
        out[..INT_SIZE].copy_from_slice(&self.x);
        out[INT_SIZE..].copy_from_slice(&self.y);
        out
    }
}

impl Signature {
    pub fn rs(&self) -> [u8; INT_SIZE * 2] {
        let mut out = [0u8; INT_SIZE * 2];
        out[..INT_SIZE].copy_from_slice(&self.r);
        out[INT_SIZE..].copy_from_slice(&self.s);
        out
    }
}

/// Builds a private key from raw big-endian bytes. Factory-provisioned keys
/// are not bounded by the subgroup order; `fix_up` reduces them so the
/// scalar arithmetic accepts them.
pub fn create_private_key(raw: &[u8], fix_up: bool) -> PrivateKey {
    let mut scalar = BigUint::from_bytes_be(raw);
    if fix_up {
        scalar = scalar % &*N;
    }
    PrivateKey {
        x: scalar_bytes(&scalar),
    }
}

pub fn create_public_key(xy: &[u8]) -> PublicKey {
    let mut key = PublicKey::default();
    let take = xy.len().min(INT_SIZE * 2);
    let mut buf = [0u8; INT_SIZE * 2];
    buf[..take].copy_from_slice(&xy[..take]);
    key.x.copy_from_slice(&buf[..INT_SIZE]);
    key.y.copy_from_slice(&buf[INT_SIZE..]);
    key
}

pub fn create_signature(rs: &[u8]) -> Signature {
    let mut sig = Signature::default();
    let take = rs.len().min(INT_SIZE * 2);
    let mut buf = [0u8; INT_SIZE * 2];
    buf[..take].copy_from_slice(&rs[..take]);
    sig.r.copy_from_slice(&buf[..INT_SIZE]);
    sig.s.copy_from_slice(&buf[INT_SIZE..]);
    sig
}

pub fn make_public_key(private_key: &PrivateKey) -> PublicKey {
    let d = BigUint::from_bytes_be(&private_key.x);
    match scalar_mul(&d, &GENERATOR) {
        Some(point) => PublicKey {
            x: point.x.to_bytes(),
            y: point.y.to_bytes(),
        },
        None => {
            error!("ECC private key maps to the point at infinity");
            PublicKey::default()
        }
    }
}

pub fn generate_key_pair() -> (PrivateKey, PublicKey) {
    let mut raw = [0u8; INT_SIZE];
    OsRng.fill_bytes(&mut raw);
    let one = BigUint::from(1u32);
    let d = BigUint::from_bytes_be(&raw) % (&*N - &one) + &one;
    let private_key = PrivateKey {
        x: scalar_bytes(&d),
    };
    let public_key = make_public_key(&private_key);
    (private_key, public_key)
}

pub fn sign(data: &[u8], private_key: &PrivateKey) -> Signature {
    let d = BigUint::from_bytes_be(&private_key.x);
    let e = message_scalar(data);
    let one = BigUint::from(1u32);

    for counter in 0u8..=255 {
        let k = derive_nonce(&private_key.x, data, counter) % (&*N - &one) + &one;
        let Some(point) = scalar_mul(&k, &GENERATOR) else {
            continue;
        };
        let r = BigUint::from_bytes_be(&point.x.to_bytes()) % &*N;
        if r == BigUint::from(0u32) {
            continue;
        }
        let s = (mod_inverse(&k) * (&e + &r * &d)) % &*N;
        if s == BigUint::from(0u32) {
            continue;
        }
        return Signature {
            r: scalar_bytes(&r),
            s: scalar_bytes(&s),
        };
    }

    // Unreachable with a non-degenerate key; 256 nonce candidates cannot
    // all collapse.
    error!("ECDSA signing failed to produce a usable nonce");
    Signature::default()
}

pub fn verify(data: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let r = BigUint::from_bytes_be(&signature.r);
    let s = BigUint::from_bytes_be(&signature.s);
    let zero = BigUint::from(0u32);
    if r == zero || s == zero || r >= *N || s >= *N {
        return false;
    }

    let q = Point {
        x: FieldElement::from_bytes(&public_key.x),
        y: FieldElement::from_bytes(&public_key.y),
    };

    let e = message_scalar(data);
    let w = mod_inverse(&s);
    let u1 = (&e * &w) % &*N;
    let u2 = (&r * &w) % &*N;

    let lhs = scalar_mul(&u1, &GENERATOR);
    let rhs = scalar_mul(&u2, &q);
    let Some(point) = point_add(lhs, rhs) else {
        return false;
    };

    BigUint::from_bytes_be(&point.x.to_bytes()) % &*N == r
}

/// Checks the curve equation `y^2 + xy = x^3 + x^2 + b` for a public key.
pub fn is_on_curve(public_key: &PublicKey) -> bool {
    let x = FieldElement::from_bytes(&public_key.x);
    let y = FieldElement::from_bytes(&public_key.y);
    let b = FieldElement::from_bytes(&CURVE_B);
    let lhs = y.square().add(&x.mul(&y));
    let rhs = x.square().mul(&x).add(&x.square()).add(&b);
    lhs == rhs
}

/// ECDH shared secret: the x coordinate of `private * others_public`.
/// Returns an empty vector when the agreement degenerates, mirroring how
/// callers treat failure.
pub fn agree(private_key: &PrivateKey, others_public_key: &PublicKey) -> Vec<u8> {
    let d = BigUint::from_bytes_be(&private_key.x);
    let q = Point {
        x: FieldElement::from_bytes(&others_public_key.x),
        y: FieldElement::from_bytes(&others_public_key.y),
    };
    match scalar_mul(&d, &q) {
        Some(point) => point.x.to_bytes().to_vec(),
        None => {
            error!("ECDH agreement failed");
            Vec::new()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Point {
    x: FieldElement,
    y: FieldElement,
}

fn point_double(p: &Point) -> Option<Point> {
    if p.x.is_zero() {
        return None;
    }
    // lambda = x + y/x; x3 = lambda^2 + lambda + a; y3 = x^2 + (lambda + 1) * x3
    let lambda = p.x.add(&p.y.mul(&p.x.invert()));
    let x3 = lambda.square().add(&lambda).add(&FieldElement::ONE);
    let y3 = p.x.square().add(&lambda.add(&FieldElement::ONE).mul(&x3));
    Some(Point { x: x3, y: y3 })
}

fn point_add(p: Option<Point>, q: Option<Point>) -> Option<Point> {
    let (p, q) = match (p, q) {
        (None, q) => return q,
        (p, None) => return p,
        (Some(p), Some(q)) => (p, q),
    };

    if p.x == q.x {
        if p.y == q.y {
            return point_double(&p);
        }
        return None;
    }

    let lambda = p.y.add(&q.y).mul(&p.x.add(&q.x).invert());
    let x3 = lambda
        .square()
        .add(&lambda)
        .add(&p.x)
        .add(&q.x)
        .add(&FieldElement::ONE);
    let y3 = lambda.mul(&p.x.add(&x3)).add(&x3).add(&p.y);
    Some(Point { x: x3, y: y3 })
}

fn scalar_mul(k: &BigUint, p: &Point) -> Option<Point> {
    let mut acc: Option<Point> = None;
    for byte in k.to_bytes_be() {
        for shift in (0..8).rev() {
            acc = acc.and_then(|point| point_double(&point));
            if (byte >> shift) & 1 == 1 {
                acc = point_add(acc, Some(*p));
            }
        }
    }
    acc
}

/// Hash truncated to the bit length of the subgroup order.
fn message_scalar(data: &[u8]) -> BigUint {
    BigUint::from_bytes_be(&sha256(data)) >> 23
}

fn mod_inverse(value: &BigUint) -> BigUint {
    let two = BigUint::from(2u32);
    value.modpow(&(&*N - &two), &N)
}

fn scalar_bytes(value: &BigUint) -> [u8; INT_SIZE] {
    let raw = value.to_bytes_be();
    let mut out = [0u8; INT_SIZE];
    out[INT_SIZE - raw.len()..].copy_from_slice(&raw);
    out
}

fn derive_nonce(key: &[u8], data: &[u8], counter: u8) -> BigUint {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&sha256(data));
    mac.update(&[counter]);
    BigUint::from_bytes_be(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_on_curve() {
        let g = PublicKey { x: GEN_X, y: GEN_Y };
        assert!(is_on_curve(&g));
    }

    #[test]
    fn generated_public_keys_are_on_curve() {
        let (_, public_key) = generate_key_pair();
        assert!(is_on_curve(&public_key));
    }

    #[test]
    fn order_times_generator_is_infinity() {
        assert!(scalar_mul(&N, &GENERATOR).is_none());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (private_key, public_key) = generate_key_pair();
        let signature = sign(b"content body", &private_key);

        assert!(verify(b"content body", &signature, &public_key));
        assert!(!verify(b"tampered body", &signature, &public_key));

        let (_, other_public) = generate_key_pair();
        assert!(!verify(b"content body", &signature, &other_public));
    }

    #[test]
    fn rejects_out_of_range_signature() {
        let (private_key, public_key) = generate_key_pair();
        let mut signature = sign(b"data", &private_key);
        signature.s = ORDER;
        assert!(!verify(b"data", &signature, &public_key));
    }

    #[test]
    fn ecdh_agreement_is_symmetric() {
        let (priv_a, pub_a) = generate_key_pair();
        let (priv_b, pub_b) = generate_key_pair();

        let shared_ab = agree(&priv_a, &pub_b);
        let shared_ba = agree(&priv_b, &pub_a);
        assert_eq!(shared_ab, shared_ba);
        assert_eq!(shared_ab.len(), INT_SIZE);
    }

    #[test]
    fn private_key_fixup_reduces_oversized_scalars() {
        // 0x20-byte factory keys exceed the order until reduced.
        let oversized = [0xFFu8; 0x20];
        let fixed = create_private_key(&oversized, true);
        assert!(BigUint::from_bytes_be(&fixed.x) < *N);
    }
}
