//! Core subsystems of the slinky daemon.
//!
//! slinky materializes templated secret files (`~/.netrc`, `~/.npmrc`,
//! `~/.docker/config.json`, ...) at stable filesystem paths without ever
//! persisting plaintext to durable storage.  This crate holds everything
//! except the mount backends themselves: the configuration model, the
//! encrypted cache and its cipher seam, the template renderer, the
//! fingerprint-keyed resolver, the directory-scoped context manager, the
//! reload dispatcher, the symlink manager, and the control protocol.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod cache;
pub mod cipher;
pub mod config;
pub mod config_watch;
pub mod context;
pub mod control;
pub mod digest;
pub mod fsutil;
pub mod mount;
pub mod paths;
pub mod reload;
pub mod render;
pub mod resolver;
pub mod symlink;
pub mod trust;

/// Rendered secret content, scrubbed from memory on drop.
///
/// Backends hold one of these per open handle / in-flight write and rely on
/// the `Zeroizing` wrapper to overwrite the buffer when the handle is
/// released.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Create from an already-zeroizing buffer (avoids a plain copy).
    pub fn from_zeroizing(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes([redacted])")
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(self.0.to_vec()))
    }
}

impl Serialize for SecretBytes {
    fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Err(serde::ser::Error::custom(
            "SecretBytes cannot be serialized",
        ))
    }
}

impl<'de> Deserialize<'de> for SecretBytes {
    fn deserialize<D>(_deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Err(serde::de::Error::custom(
            "SecretBytes cannot be deserialized",
        ))
    }
}
