//! Direnv-style trust store for project configs.
//!
//! Project configs can execute arbitrary commands via the `exec` template
//! builtin, so each one must be explicitly approved before the daemon will
//! load it.  Approval records the SHA-256 of the file; any content change
//! requires re-approval.  The database is a JSON map of canonical path to
//! hex digest, persisted under the state directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::digest::sha256_hex;
use crate::paths::state_dir;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("untrusted project config: {0:?} (approve it before activating this directory)")]
    Untrusted(PathBuf),
    #[error("trust store {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing trust store {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A project-config file whose contents were read once and verified against
/// the store.  Parsing these bytes (rather than re-reading the file) closes
/// the TOCTOU window between the trust check and the parse.
#[derive(Debug, Clone)]
pub struct VerifiedFile {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

pub struct TrustStore {
    path: PathBuf,
    db: Mutex<Option<HashMap<String, String>>>,
}

impl TrustStore {
    /// Create a store backed by the given JSON file.  The file is created
    /// lazily on first write.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            db: Mutex::new(None),
        }
    }

    /// `$XDG_STATE_HOME/slinky/trusted.json`.
    pub fn default_store_path() -> PathBuf {
        state_dir().join("trusted.json")
    }

    /// Whether the config file at `path` has been approved and is unchanged
    /// since approval.
    pub fn is_trusted(&self, path: &Path) -> Result<bool, TrustError> {
        let mut guard = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let db = self.load(&mut guard)?;

        let canonical = canonical_key(path)?;
        let Some(stored) = db.get(&canonical) else {
            return Ok(false);
        };

        let data = std::fs::read(path).map_err(|source| TrustError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(*stored == sha256_hex(&data))
    }

    /// Approve the config file at `path` by recording its current hash.
    pub fn allow(&self, path: &Path) -> Result<(), TrustError> {
        let mut guard = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let db = self.load(&mut guard)?;

        let canonical = canonical_key(path)?;
        let data = std::fs::read(path).map_err(|source| TrustError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        db.insert(canonical, sha256_hex(&data));
        self.save(db)
    }

    /// Revoke approval for the config file at `path`.
    pub fn deny(&self, path: &Path) -> Result<(), TrustError> {
        let mut guard = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let db = self.load(&mut guard)?;

        let canonical = canonical_key(path)?;
        db.remove(&canonical);
        self.save(db)
    }

    /// Read each config file once, verify its hash against the store, and
    /// return the verified contents.  Fails with `Untrusted` naming the
    /// first path that is unapproved or has changed since approval.
    pub fn read_and_verify_paths(&self, paths: &[PathBuf]) -> Result<Vec<VerifiedFile>, TrustError> {
        let mut guard = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let db = self.load(&mut guard)?;

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let canonical = canonical_key(path)?;
            let data = std::fs::read(path).map_err(|source| TrustError::Io {
                path: path.clone(),
                source,
            })?;

            match db.get(&canonical) {
                Some(stored) if *stored == sha256_hex(&data) => {
                    files.push(VerifiedFile {
                        path: path.clone(),
                        data,
                    });
                }
                _ => return Err(TrustError::Untrusted(path.clone())),
            }
        }
        Ok(files)
    }

    fn load<'a>(
        &self,
        guard: &'a mut Option<HashMap<String, String>>,
    ) -> Result<&'a mut HashMap<String, String>, TrustError> {
        if guard.is_none() {
            let db = match std::fs::read(&self.path) {
                Ok(data) => serde_json::from_slice(&data).map_err(|source| TrustError::Parse {
                    path: self.path.clone(),
                    source,
                })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(source) => {
                    return Err(TrustError::Io {
                        path: self.path.clone(),
                        source,
                    });
                }
            };
            *guard = Some(db);
        }
        Ok(guard.as_mut().expect("just populated"))
    }

    fn save(&self, db: &HashMap<String, String>) -> Result<(), TrustError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TrustError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let mut data = serde_json::to_vec_pretty(db).map_err(|source| TrustError::Parse {
            path: self.path.clone(),
            source,
        })?;
        data.push(b'\n');
        std::fs::write(&self.path, data).map_err(|source| TrustError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn canonical_key(path: &Path) -> Result<String, TrustError> {
    let abs = std::path::absolute(path).map_err(|source| TrustError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(abs.to_string_lossy().into_owned())
}
