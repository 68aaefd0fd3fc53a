//! Encrypted in-memory cache with per-entry TTL, stale serving, and
//! background reaping.
//!
//! Entries hold ciphertext only; the resolver decrypts on the way out.
//! Every removal path (clear, per-key clear, cipher swap, reaper eviction)
//! zeroes the ciphertext buffer before dropping it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroize;

use crate::SecretBytes;
use crate::cipher::{CacheCipher, CipherError};

/// How often the reaper sweeps for expired entries.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Expired,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub ciphertext: Vec<u8>,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl Entry {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn fresh(&self) -> bool {
        self.age() < self.ttl
    }

    pub fn stale(&self) -> bool {
        let age = self.age();
        age >= self.ttl && age < 2 * self.ttl
    }

    pub fn expired(&self) -> bool {
        self.age() >= 2 * self.ttl
    }

    pub fn state(&self) -> EntryState {
        if self.fresh() {
            EntryState::Fresh
        } else if self.stale() {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }
}

/// Metadata about a cache entry, for the control surface.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub age: Duration,
    pub ttl: Duration,
    pub state: EntryState,
}

struct Inner {
    entries: HashMap<String, Entry>,
    cipher: Box<dyn CacheCipher>,
}

pub struct SecretCache {
    inner: RwLock<Inner>,
}

impl SecretCache {
    pub fn new(cipher: Box<dyn CacheCipher>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                cipher,
            }),
        }
    }

    /// A copy of the entry for `key`, if present (regardless of state).
    pub fn get(&self, key: &str) -> Option<Entry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).cloned()
    }

    /// Encrypt `plaintext` and store it under `key`.  Encryption happens
    /// synchronously so plaintext never sits in the map.
    pub fn put(&self, key: &str, plaintext: &[u8], ttl: Duration) -> Result<(), CipherError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let ciphertext = inner.cipher.encrypt(plaintext)?;
        inner.entries.insert(
            key.to_string(),
            Entry {
                ciphertext,
                created_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    /// Decrypt an entry with the current cipher.
    pub fn decrypt(&self, entry: &Entry) -> Result<SecretBytes, CipherError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let plaintext = inner.cipher.decrypt(&entry.ciphertext)?;
        Ok(SecretBytes::from_zeroizing(plaintext))
    }

    /// Zero and drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for entry in inner.entries.values_mut() {
            entry.ciphertext.zeroize();
        }
        inner.entries.clear();
    }

    /// Zero and drop one entry.
    pub fn clear_key(&self, key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut entry) = inner.entries.remove(key) {
            entry.ciphertext.zeroize();
        }
    }

    /// Replace the cipher, zeroing every entry first.  Ciphertext produced
    /// by the outgoing cipher is unrecoverable afterwards.
    pub fn swap_cipher(&self, cipher: Box<dyn CacheCipher>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for entry in inner.entries.values_mut() {
            entry.ciphertext.zeroize();
        }
        inner.entries.clear();
        inner.cipher = cipher;
    }

    pub fn stats(&self) -> HashMap<String, EntryInfo> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    EntryInfo {
                        age: entry.age(),
                        ttl: entry.ttl,
                        state: entry.state(),
                    },
                )
            })
            .collect()
    }

    pub fn cipher_name(&self) -> &'static str {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.cipher.name()
    }

    /// Evict entries past 2×TTL.  Called by the reaper; public so tests can
    /// drive a sweep directly.
    pub fn reap(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.retain(|key, entry| {
            if entry.expired() {
                debug!(key, "reaping expired cache entry");
                entry.ciphertext.zeroize();
                false
            } else {
                true
            }
        });
    }

    /// Sweep for expired entries every 30 s until cancelled.
    pub async fn run_reaper(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of tokio's interval fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.reap(),
            }
        }
    }
}
