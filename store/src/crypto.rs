//! Envelope encryption for metadata and object payloads.
//!
//! Every sealed region carries a 12-byte IV and a detached 16-byte tag,
//! stored next to the data they protect. IVs are never random: they are
//! a 4-byte domain label followed by a big-endian commit counter, so a
//! key never sees the same nonce twice across metadata and object
//! envelopes.

use aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce domain for the metadata block header envelope.
pub const METADATA_DOMAIN: [u8; 4] = *b"MET1";
/// Nonce domain for object payload envelopes.
pub const OBJECT_DOMAIN: [u8; 4] = *b"OBJ1";

/// Builds the 12-byte IV for `counter` in the given domain.
pub fn build_nonce(domain: [u8; 4], counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&domain);
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// AEAD algorithm used to seal envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeAlgorithm {
    ChaCha20Poly1305,
    Aes256Gcm,
}

/// Stored IV and authentication tag for one sealed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Envelope {
    pub iv: [u8; 12],
    pub tag: [u8; 16],
}

impl Envelope {
    /// Encoded size: IV followed by tag.
    pub const LEN: usize = 28;

    pub fn encode_into(&self, out: &mut [u8]) {
        out[..12].copy_from_slice(&self.iv);
        out[12..Self::LEN].copy_from_slice(&self.tag);
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut envelope = Envelope::default();
        envelope.iv.copy_from_slice(&bytes[..12]);
        envelope.tag.copy_from_slice(&bytes[12..Self::LEN]);
        envelope
    }

    /// Commit counter recovered from the IV tail.
    pub fn counter(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.iv[4..12]);
        u64::from_be_bytes(raw)
    }
}

/// Symmetric cipher sealing metadata and object envelopes.
///
/// The key is wiped from memory when the cipher is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeCipher {
    #[zeroize(skip)]
    algorithm: EnvelopeAlgorithm,
    key: [u8; 32],
}

impl EnvelopeCipher {
    /// Cipher using ChaCha20-Poly1305 with the given key.
    pub const fn chacha20_poly1305(key: [u8; 32]) -> Self {
        Self {
            algorithm: EnvelopeAlgorithm::ChaCha20Poly1305,
            key,
        }
    }

    /// Cipher using AES-256-GCM with the given key.
    pub const fn aes256_gcm(key: [u8; 32]) -> Self {
        Self {
            algorithm: EnvelopeAlgorithm::Aes256Gcm,
            key,
        }
    }

    pub fn algorithm(&self) -> EnvelopeAlgorithm {
        self.algorithm
    }

    /// Encrypts `buf` in place and returns the detached tag.
    ///
    /// The ciphertext has the same length as the plaintext; callers
    /// store the tag in the envelope next to the IV.
    pub fn seal_detached(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; 16], aead::Error> {
        match self.algorithm {
            EnvelopeAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(&self.key.into());
                cipher
                    .encrypt_in_place_detached(nonce.into(), aad, buf)
                    .map(Into::into)
            }
            EnvelopeAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(&self.key.into());
                cipher
                    .encrypt_in_place_detached(nonce.into(), aad, buf)
                    .map(Into::into)
            }
        }
    }

    /// Decrypts `buf` in place after checking the detached tag.
    pub fn open_detached(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; 16],
    ) -> Result<(), aead::Error> {
        match self.algorithm {
            EnvelopeAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(&self.key.into());
                cipher.decrypt_in_place_detached(nonce.into(), aad, buf, tag.into())
            }
            EnvelopeAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(&self.key.into());
                cipher.decrypt_in_place_detached(nonce.into(), aad, buf, tag.into())
            }
        }
    }

    /// Authenticates `aad` without encrypting anything.
    ///
    /// Used for the metadata tables, which stay readable in flash but
    /// must not be forgeable.
    pub fn mac(&self, nonce: &[u8; 12], aad: &[u8]) -> Result<[u8; 16], aead::Error> {
        self.seal_detached(nonce, aad, &mut [])
    }

    /// Checks a tag produced by [`EnvelopeCipher::mac`].
    pub fn verify_mac(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        tag: &[u8; 16],
    ) -> Result<(), aead::Error> {
        self.open_detached(nonce, aad, &mut [], tag)
    }
}
