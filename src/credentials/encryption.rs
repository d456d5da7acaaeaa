//! AES-256-GCM encryption for stored YNAB tokens.
//!
//! The key is derived once per process with PBKDF2-HMAC-SHA256 from the
//! configured secret and salt and never written anywhere. Every call to
//! [`TokenCipher::encrypt`] draws a fresh 96-bit nonce.
//!
//! # Wire format
//! ```text
//! current: base64( "YM\x01" || nonce(12) || ciphertext || tag(16) )
//! legacy:  base64(              nonce(12) || ciphertext || tag(16) )
//! ```
//! The magic prefix is the discriminator. A value that carries it is only
//! ever decoded as the current format.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// GCM authentication tag size in bytes
const TAG_SIZE: usize = 16;

/// "YM" + format version 1
const MAGIC: [u8; 3] = [0x59, 0x4d, 0x01];

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encrypted value is not valid base64")]
    InvalidEncoding,

    #[error("encrypted value is too short ({0} bytes)")]
    Truncated(usize),

    #[error("decryption failed (wrong key or corrupted data)")]
    Authentication,

    #[error("decrypted data is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("encryption failed")]
    Encryption,
}

/// Decoded layout of a stored secret.
#[derive(Debug, PartialEq, Eq)]
enum Envelope<'a> {
    Tagged {
        nonce: &'a [u8],
        ciphertext: &'a [u8],
    },
    Legacy {
        nonce: &'a [u8],
        ciphertext: &'a [u8],
    },
}

impl<'a> Envelope<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, CipherError> {
        if let Some(rest) = bytes.strip_prefix(&MAGIC[..]) {
            if rest.len() < NONCE_SIZE + TAG_SIZE {
                return Err(CipherError::Truncated(bytes.len()));
            }
            let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
            return Ok(Envelope::Tagged { nonce, ciphertext });
        }

        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::Truncated(bytes.len()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        Ok(Envelope::Legacy { nonce, ciphertext })
    }

    fn parts(&self) -> (&'a [u8], &'a [u8]) {
        match *self {
            Envelope::Tagged { nonce, ciphertext } | Envelope::Legacy { nonce, ciphertext } => {
                (nonce, ciphertext)
            }
        }
    }
}

/// Token cipher holding the derived key.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derives the key from `secret` and `salt`.
    ///
    /// Deterministic: the same secret and salt always yield the same key, so
    /// values written by one process decrypt in the next.
    pub fn new(secret: &str, salt: &str) -> Result<Self, CipherError> {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            salt.as_bytes(),
            secret.as_bytes(),
            &mut key,
        );
        Self::from_key_bytes(&key)
    }

    /// Builds a cipher from a raw 32-byte key.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey(key.len()))?;
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext` into the current tagged format.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        // Never reuse a nonce under the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut combined = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&MAGIC);
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypts a value in either the tagged or the legacy format.
    pub fn decrypt(&self, value: &str) -> Result<String, CipherError> {
        let bytes = BASE64
            .decode(value.trim())
            .map_err(|_| CipherError::InvalidEncoding)?;

        let envelope = Envelope::parse(&bytes)?;
        let (nonce, ciphertext) = envelope.parts();

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }

    /// Best-effort sniff of whether `value` looks like one of our ciphertexts.
    ///
    /// Only used to tell a stored plaintext token from an encrypted one.
    /// It says nothing about authenticity.
    pub fn is_encrypted(value: &str) -> bool {
        let Ok(bytes) = BASE64.decode(value.trim()) else {
            return false;
        };

        if bytes.starts_with(&MAGIC) && bytes.len() >= MAGIC.len() + NONCE_SIZE {
            return true;
        }

        bytes.len() > NONCE_SIZE
    }
}
