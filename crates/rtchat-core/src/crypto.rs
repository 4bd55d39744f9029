// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cryptographic identity primitives.
//!
//! Peers prove ownership of a name with RSA-PSS signatures: 2048-bit modulus,
//! public exponent 65537, SHA-256, 32-byte salt. Keys are persisted in JWK
//! form so the key-value store only ever holds JSON strings.
//!
//! Signatures and challenges cross the wire in the legacy character-per-byte
//! rendering ([`byte_string`]): every byte becomes the char U+0000..U+00FF.
//! JSON carries those strings unharmed, and the rendering survives every
//! peer that predates a binary-safe encoding.

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// RSA modulus size in bits.
const MODULUS_BITS: usize = 2048;
/// PSS salt length in bytes (the SHA-256 digest size).
const SALT_LEN: usize = 32;
/// Challenge length in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// A generated key pair, both halves in JWK form.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_jwk: String,
    pub private_jwk: String,
}

/// Signing/verification seam. The default implementation is
/// [`RsaPssCrypto`]; tests may substitute a deterministic fake.
pub trait CryptoProvider: Send + Sync + 'static {
    fn generate_keypair(&self) -> Result<KeyPair, Error>;
    /// Sign `message` with a private JWK; returns the raw signature bytes.
    fn sign(&self, private_jwk: &str, message: &[u8]) -> Result<Vec<u8>, Error>;
    /// Verify `signature` over `message` under a public JWK.
    fn verify(&self, public_jwk: &str, message: &[u8], signature: &[u8]) -> Result<bool, Error>;
    fn random_bytes(&self, n: usize) -> Vec<u8>;
}

// ── Byte-string rendering ─────────────────────────────────────────────────────

/// Render bytes as a string, one char per byte (U+0000..U+00FF).
pub fn byte_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Recover bytes from a [`byte_string`] rendering. Chars above U+00FF are
/// truncated to their low byte; well-formed input never contains any.
pub fn string_bytes(s: &str) -> Vec<u8> {
    s.chars().map(|c| (c as u32 & 0xff) as u8).collect()
}

/// A fresh random challenge in wire rendering.
pub fn make_challenge(crypto: &dyn CryptoProvider) -> String {
    byte_string(&crypto.random_bytes(CHALLENGE_LEN))
}

// ── JWK codec ─────────────────────────────────────────────────────────────────

/// JSON Web Key for an RSA key. Private fields are omitted for public keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
}

fn b64(n: &BigUint) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(n.to_bytes_be())
}

fn un_b64(field: &str, value: &str) -> Result<BigUint, Error> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| Error::Crypto(format!("JWK field {field}: {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn parse_jwk(jwk: &str) -> Result<Jwk, Error> {
    let parsed: Jwk =
        serde_json::from_str(jwk).map_err(|e| Error::Crypto(format!("malformed JWK: {e}")))?;
    if parsed.kty != "RSA" {
        return Err(Error::Crypto(format!("unsupported kty {:?}", parsed.kty)));
    }
    Ok(parsed)
}

fn public_from_jwk(jwk: &str) -> Result<RsaPublicKey, Error> {
    let jwk = parse_jwk(jwk)?;
    RsaPublicKey::new(un_b64("n", &jwk.n)?, un_b64("e", &jwk.e)?)
        .map_err(|e| Error::Crypto(e.to_string()))
}

fn private_from_jwk(jwk: &str) -> Result<RsaPrivateKey, Error> {
    let jwk = parse_jwk(jwk)?;
    let d = jwk
        .d
        .as_deref()
        .ok_or_else(|| Error::Crypto("JWK has no private exponent".into()))?;
    let p = jwk
        .p
        .as_deref()
        .ok_or_else(|| Error::Crypto("JWK has no prime p".into()))?;
    let q = jwk
        .q
        .as_deref()
        .ok_or_else(|| Error::Crypto("JWK has no prime q".into()))?;
    RsaPrivateKey::from_components(
        un_b64("n", &jwk.n)?,
        un_b64("e", &jwk.e)?,
        un_b64("d", d)?,
        vec![un_b64("p", p)?, un_b64("q", q)?],
    )
    .map_err(|e| Error::Crypto(e.to_string()))
}

fn public_jwk(key: &RsaPublicKey) -> Jwk {
    Jwk {
        kty: "RSA".into(),
        alg: Some("PS256".into()),
        n: b64(key.n()),
        e: b64(key.e()),
        d: None,
        p: None,
        q: None,
    }
}

fn private_jwk(key: &RsaPrivateKey) -> Jwk {
    let primes = key.primes();
    Jwk {
        kty: "RSA".into(),
        alg: Some("PS256".into()),
        n: b64(key.n()),
        e: b64(key.e()),
        d: Some(b64(key.d())),
        p: primes.first().map(b64),
        q: primes.get(1).map(b64),
    }
}

// ── Default provider ──────────────────────────────────────────────────────────

/// RSA-PSS provider over the OS CSPRNG.
#[derive(Debug, Clone, Default)]
pub struct RsaPssCrypto;

impl RsaPssCrypto {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for RsaPssCrypto {
    fn generate_keypair(&self) -> Result<KeyPair, Error> {
        let private = RsaPrivateKey::new(&mut OsRng, MODULUS_BITS)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        let public_jwk = serde_json::to_string(&public_jwk(&public))
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let private_jwk = serde_json::to_string(&private_jwk(&private))
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(KeyPair {
            public_jwk,
            private_jwk,
        })
    }

    fn sign(&self, private_jwk: &str, message: &[u8]) -> Result<Vec<u8>, Error> {
        let key = private_from_jwk(private_jwk)?;
        let digest = Sha256::digest(message);
        key.sign_with_rng(&mut OsRng, Pss::new_with_salt::<Sha256>(SALT_LEN), &digest)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    fn verify(&self, public_jwk: &str, message: &[u8], signature: &[u8]) -> Result<bool, Error> {
        let key = public_from_jwk(public_jwk)?;
        let digest = Sha256::digest(message);
        Ok(key
            .verify(Pss::new_with_salt::<Sha256>(SALT_LEN), &digest, signature)
            .is_ok())
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; n];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> KeyPair {
        RsaPssCrypto::new().generate_keypair().unwrap()
    }

    #[test]
    fn byte_string_round_trip() {
        let bytes: Vec<u8> = (0..=255).collect();
        let s = byte_string(&bytes);
        assert_eq!(string_bytes(&s), bytes);
        // The rendering survives JSON.
        let json = serde_json::to_string(&s).unwrap();
        let back: String = serde_json::from_str(&json).unwrap();
        assert_eq!(string_bytes(&back), bytes);
    }

    #[test]
    fn challenge_has_wire_length() {
        let crypto = RsaPssCrypto::new();
        let c = make_challenge(&crypto);
        assert_eq!(string_bytes(&c).len(), CHALLENGE_LEN);
    }

    #[test]
    fn sign_verify_round_trip() {
        let crypto = RsaPssCrypto::new();
        let keys = keypair();
        let msg = b"challenge bytes";
        let sig = crypto.sign(&keys.private_jwk, msg).unwrap();
        assert!(crypto.verify(&keys.public_jwk, msg, &sig).unwrap());
    }

    #[test]
    fn perturbed_signature_fails() {
        let crypto = RsaPssCrypto::new();
        let keys = keypair();
        let msg = b"challenge bytes";
        let mut sig = crypto.sign(&keys.private_jwk, msg).unwrap();
        sig[0] ^= 0x01;
        assert!(!crypto.verify(&keys.public_jwk, msg, &sig).unwrap());
    }

    #[test]
    fn perturbed_message_fails() {
        let crypto = RsaPssCrypto::new();
        let keys = keypair();
        let sig = crypto.sign(&keys.private_jwk, b"original").unwrap();
        assert!(!crypto.verify(&keys.public_jwk, b"tampered", &sig).unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let crypto = RsaPssCrypto::new();
        let keys = keypair();
        let other = keypair();
        let sig = crypto.sign(&keys.private_jwk, b"msg").unwrap();
        assert!(!crypto.verify(&other.public_jwk, b"msg", &sig).unwrap());
    }

    #[test]
    fn jwk_round_trips_through_store_form() {
        let keys = keypair();
        // Re-parse both halves as a store would hand them back.
        let public: Jwk = serde_json::from_str(&keys.public_jwk).unwrap();
        assert_eq!(public.kty, "RSA");
        assert!(public.d.is_none(), "public JWK must not leak private parts");
        let private: Jwk = serde_json::from_str(&keys.private_jwk).unwrap();
        assert!(private.d.is_some() && private.p.is_some() && private.q.is_some());

        // A signature made after the round-trip still verifies.
        let crypto = RsaPssCrypto::new();
        let reloaded = serde_json::to_string(&private).unwrap();
        let sig = crypto.sign(&reloaded, b"after reload").unwrap();
        assert!(crypto.verify(&keys.public_jwk, b"after reload", &sig).unwrap());
    }

    #[test]
    fn malformed_jwk_is_rejected() {
        let crypto = RsaPssCrypto::new();
        assert!(crypto.sign("not json", b"m").is_err());
        assert!(crypto.verify("{\"kty\":\"EC\"}", b"m", b"s").is_err());
    }
}
