//! Cache cipher seam and the default ephemeral implementation.
//!
//! Cached rendered content is always stored as ciphertext; the cipher is the
//! only way back to plaintext.  The default cipher holds a fresh in-memory
//! X25519 identity, so every cached value becomes irrecoverable the moment
//! the daemon exits.

use std::io::{Read, Write};

use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::CipherKind;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encrypt: {0}")]
    Encrypt(String),
    #[error("decrypt: {0}")]
    Decrypt(String),
}

/// Encrypts and decrypts cached rendered template output.
pub trait CacheCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypted plaintext is returned in a `Zeroizing` buffer so it is
    /// scrubbed when the caller drops it.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError>;

    fn name(&self) -> &'static str;
}

/// Construct a cipher for the configured kind.
pub fn new_cipher(kind: CipherKind) -> Box<dyn CacheCipher> {
    match kind {
        CipherKind::Ephemeral => Box::new(Ephemeral::new()),
    }
}

/// In-memory X25519 keypair generated at construction.  The private half
/// never leaves process memory and is never persisted.
pub struct Ephemeral {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
}

impl Ephemeral {
    pub fn new() -> Self {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        Self {
            identity,
            recipient,
        }
    }
}

impl Default for Ephemeral {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheCipher for Ephemeral {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let encryptor =
            age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
                .ok_or_else(|| CipherError::Encrypt("no recipients".to_string()))?;

        let mut ciphertext = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut ciphertext)
            .map_err(|e| CipherError::Encrypt(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| CipherError::Encrypt(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CipherError::Encrypt(e.to_string()))?;

        Ok(ciphertext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let decryptor = match age::Decryptor::new(ciphertext)
            .map_err(|e| CipherError::Decrypt(e.to_string()))?
        {
            age::Decryptor::Recipients(d) => d,
            age::Decryptor::Passphrase(_) => {
                return Err(CipherError::Decrypt(
                    "unexpected passphrase-encrypted payload".to_string(),
                ));
            }
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| CipherError::Decrypt(e.to_string()))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| CipherError::Decrypt(e.to_string()))?;
        Ok(plaintext)
    }

    fn name(&self) -> &'static str {
        "ephemeral"
    }
}
