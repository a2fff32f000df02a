//! Authenticated encryption for credential fields at rest.
//!
//! Ciphertext is `base64(nonce (12 bytes) || sealed payload || tag (16 bytes))`
//! using AES-256-GCM with a single process-wide key. The empty string maps to
//! the empty string in both directions.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Result type alias for encryption operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption key must be exactly {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Malformed ciphertext: {0}")]
    Malformed(&'static str),

    /// Integrity check failed (wrong key or tampered ciphertext)
    #[error("Ciphertext failed authentication")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,
}

/// Encrypts and decrypts token strings with AES-256-GCM
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Build the service from raw key bytes.
    ///
    /// The caller keeps ownership of the key material and is responsible for
    /// zeroizing it; the cipher holds its own expanded copy.
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + sealed.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&sealed);
        Ok(STANDARD.encode(output))
    }

    /// Decrypt a value produced by [`EncryptionService::encrypt`].
    ///
    /// Never returns partial plaintext: any failure is an error.
    pub fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| CryptoError::Malformed("not valid base64"))?;
        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Malformed("ciphertext too short"));
        }

        let (nonce_bytes, sealed) = raw.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce_bytes), sealed)
                .map_err(|_| CryptoError::Authentication)?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::Malformed("plaintext is not UTF-8"))
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(&[7u8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let crypto = service();
        let sealed = crypto.encrypt("ya29.access-token").unwrap();
        assert_ne!(sealed, "ya29.access-token");
        assert_eq!(crypto.decrypt(&sealed).unwrap(), "ya29.access-token");
    }

    #[test]
    fn test_empty_string_maps_to_empty() {
        let crypto = service();
        assert_eq!(crypto.encrypt("").unwrap(), "");
        assert_eq!(crypto.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let crypto = service();
        assert_ne!(
            crypto.encrypt("same").unwrap(),
            crypto.encrypt("same").unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert_eq!(
            EncryptionService::new(&[1u8; 16]).unwrap_err(),
            CryptoError::InvalidKeyLength(16)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let crypto = service();
        let sealed = crypto.encrypt("refresh-token").unwrap();
        let mut raw = STANDARD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = STANDARD.encode(raw);

        assert_eq!(
            crypto.decrypt(&tampered).unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let sealed = service().encrypt("refresh-token").unwrap();
        let other = EncryptionService::new(&[9u8; KEY_SIZE]).unwrap();
        assert_eq!(
            other.decrypt(&sealed).unwrap_err(),
            CryptoError::Authentication
        );
    }

    #[test]
    fn test_malformed_input() {
        let crypto = service();
        assert!(matches!(
            crypto.decrypt("%%% not base64"),
            Err(CryptoError::Malformed(_))
        ));
        assert!(matches!(
            crypto.decrypt(&STANDARD.encode([0u8; 8])),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        assert!(format!("{:?}", service()).contains("[REDACTED]"));
    }
}
