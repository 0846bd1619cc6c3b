//! Update image integrity: streaming SHA-256 and RSA signature check.
//!
//! Release images are signed offline: the signer hashes the image with
//! SHA-256 and produces an RSA-2048 PKCS#1 v1.5 signature over that digest.
//! The badge recomputes the digest from the staged file, compares it with
//! the header checksum, then checks the signature against the embedded
//! public key.

use core::fmt;

use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

pub const DIGEST_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    /// The embedded PEM does not hold a usable RSA public key.
    InvalidKey,
    /// Signature does not match the checksum under the key.
    BadSignature,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "public key could not be parsed"),
            Self::BadSignature => write!(f, "signature verification failed"),
        }
    }
}

/// Incremental SHA-256 over an image streamed in chunks.
#[derive(Default)]
pub struct ImageDigest {
    hasher: Sha256,
}

impl ImageDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> [u8; DIGEST_SIZE] {
        self.hasher.finalize().into()
    }
}

/// One-shot digest, used by signing tools and tests.
pub fn digest(data: &[u8]) -> [u8; DIGEST_SIZE] {
    Sha256::digest(data).into()
}

/// RSA public key that release images are signed with.
pub struct SignatureVerifier {
    key: RsaPublicKey,
}

impl SignatureVerifier {
    /// Parse an SPKI `-----BEGIN PUBLIC KEY-----` document.
    pub fn from_pem(pem: &str) -> Result<Self, VerifyError> {
        RsaPublicKey::from_public_key_pem(pem)
            .map(|key| Self { key })
            .map_err(|_| VerifyError::InvalidKey)
    }

    /// Check that `signature` signs `checksum` (PKCS#1 v1.5, SHA-256).
    pub fn verify(&self, checksum: &[u8; DIGEST_SIZE], signature: &[u8]) -> Result<(), VerifyError> {
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), checksum, signature)
            .map_err(|_| VerifyError::BadSignature)
    }
}

/// Lowercase hex rendering of a digest for logs.
pub fn to_hex(bytes: &[u8; DIGEST_SIZE]) -> heapless::String<{ DIGEST_SIZE * 2 }> {
    use core::fmt::Write;
    let mut out = heapless::String::new();
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
