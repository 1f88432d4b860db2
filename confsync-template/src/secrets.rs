//! Pluggable decryption of backend values.
//!
//! Encrypted lookups (`cget` and friends) route the plain getter's result
//! through a [`Decrypt`] implementation. The transform is deliberately a
//! trait seam: operators plug in whatever scheme wraps their values. The
//! shipped [`EnvelopeDecrypter`] handles the base64 envelope layer and keeps
//! the keyring bytes available to implementations layered on top of it.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// A value-level decryption failure.
#[derive(Debug, Error)]
#[error("decryption failed: {0}")]
pub struct DecryptError(pub String);

/// Transform applied by the encrypted lookup variants.
pub trait Decrypt: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError>;
}

/// Base64-envelope decoder constructed from a secret keyring file.
pub struct EnvelopeDecrypter {
    #[allow(dead_code)]
    keyring: Vec<u8>,
}

impl EnvelopeDecrypter {
    /// Load the keyring from disk. The keyring must be non-empty.
    pub fn from_keyring_file(path: &Path) -> Result<Self, std::io::Error> {
        let keyring = std::fs::read(path)?;
        if keyring.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("secret keyring {} is empty", path.display()),
            ));
        }
        Ok(EnvelopeDecrypter { keyring })
    }
}

impl Decrypt for EnvelopeDecrypter {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
        let bytes = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| DecryptError(format!("invalid base64 envelope: {e}")))?;
        String::from_utf8(bytes).map_err(|e| DecryptError(format!("non-utf8 plaintext: {e}")))
    }
}
