//! Symlinks from conventional paths (e.g. `~/.netrc`) into the mount.
//!
//! The manager owns a `name → link path` map of links it created and
//! reconciles it against config changes.  Entries it did not create are
//! only ever touched according to the configured conflict policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{error, info};

use crate::config::{Config, ConflictMode, FileConfig};
use crate::paths::expand_path;

#[derive(Debug, Error)]
pub enum SymlinkError {
    #[error("symlink target {0:?} is a directory, refusing to replace")]
    IsDirectory(PathBuf),
    #[error(
        "file conflict at {0:?}: existing file is not managed by slinky; back it up or remove it manually, or set conflict = \"backup\""
    )]
    Conflict(PathBuf),
    #[error("creating symlink for {name:?}: {source}")]
    Io {
        name: String,
        source: std::io::Error,
    },
}

pub struct SymlinkManager {
    managed: Mutex<HashMap<String, PathBuf>>,
}

impl SymlinkManager {
    pub fn new() -> Self {
        Self {
            managed: Mutex::new(HashMap::new()),
        }
    }

    /// Create symlinks for every configured file that has a symlink path.
    pub fn setup(&self, cfg: &Config, mount_point: &Path) -> Result<(), SymlinkError> {
        let mut managed = self.managed.lock().unwrap_or_else(PoisonError::into_inner);

        for (name, fc) in &cfg.files {
            let Some(link) = symlink_path(fc) else {
                continue;
            };
            let target = mount_point.join(name);
            create_symlink(
                name,
                &target,
                &link,
                mount_point,
                cfg.settings.symlink.conflict,
                &cfg.settings.symlink.backup_extension,
            )?;
            managed.insert(name.clone(), link.clone());
            info!(link = %link.display(), target = %target.display(), "symlink created");
        }
        Ok(())
    }

    /// Diff managed links against a new file set: drop links whose file
    /// disappeared or whose link path moved, create the missing ones.
    pub fn reconcile_with_config(
        &self,
        new_files: &HashMap<String, std::sync::Arc<FileConfig>>,
        mount_point: &Path,
        conflict: ConflictMode,
        backup_extension: &str,
    ) -> Result<(), SymlinkError> {
        let mut managed = self.managed.lock().unwrap_or_else(PoisonError::into_inner);

        let stale: Vec<(String, PathBuf)> = managed
            .iter()
            .filter(|(name, link)| {
                match new_files.get(*name).and_then(|fc| symlink_path(fc)) {
                    Some(new_link) => new_link != **link,
                    None => true,
                }
            })
            .map(|(name, link)| (name.clone(), link.clone()))
            .collect();

        for (name, link) in stale {
            match std::fs::remove_file(&link) {
                Ok(()) => info!(link = %link.display(), file = name, "stale symlink removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(link = %link.display(), error = %e, "failed to remove stale symlink");
                }
            }
            managed.remove(&name);
        }

        for (name, fc) in new_files {
            let Some(link) = symlink_path(fc) else {
                continue;
            };
            if managed.get(name) == Some(&link) {
                continue; // already managed at the same path
            }

            let target = mount_point.join(name);
            create_symlink(
                name,
                &target,
                &link,
                mount_point,
                conflict,
                backup_extension,
            )?;
            managed.insert(name.clone(), link.clone());
            info!(link = %link.display(), target = %target.display(), "symlink created");
        }

        Ok(())
    }

    /// Unlink every managed symlink (missing ones ignored).  Backups made
    /// under the `backup` conflict mode are not restored.
    pub fn cleanup(&self) {
        let mut managed = self.managed.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, link) in managed.drain() {
            match std::fs::remove_file(&link) {
                Ok(()) => info!(link = %link.display(), file = name, "symlink removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(link = %link.display(), error = %e, "failed to remove symlink"),
            }
        }
    }

    /// The links currently under management (tests and status surfaces).
    pub fn managed_links(&self) -> HashMap<String, PathBuf> {
        self.managed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for SymlinkManager {
    fn default() -> Self {
        Self::new()
    }
}

fn symlink_path(fc: &FileConfig) -> Option<PathBuf> {
    fc.symlink
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(expand_path)
}

fn create_symlink(
    name: &str,
    target: &Path,
    link: &Path,
    mount_point: &Path,
    conflict: ConflictMode,
    backup_extension: &str,
) -> Result<(), SymlinkError> {
    if let Some(dir) = link.parent() {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::create_dir_all(dir).map_err(|source| SymlinkError::Io {
            name: name.to_string(),
            source,
        })?;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    }

    match std::fs::symlink_metadata(link) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SymlinkError::Io {
                name: name.to_string(),
                source,
            });
        }
        Ok(meta) => {
            if meta.is_dir() {
                return Err(SymlinkError::IsDirectory(link.to_path_buf()));
            }
            if meta.file_type().is_symlink() {
                let dest = std::fs::read_link(link).unwrap_or_default();
                if is_under_mount(&dest, mount_point) {
                    // Ours (or a predecessor daemon's): always safe to
                    // replace.
                    std::fs::remove_file(link).map_err(|source| SymlinkError::Io {
                        name: name.to_string(),
                        source,
                    })?;
                } else {
                    handle_conflict(name, link, conflict, backup_extension)?;
                }
            } else {
                handle_conflict(name, link, conflict, backup_extension)?;
            }
        }
    }

    std::os::unix::fs::symlink(target, link).map_err(|source| SymlinkError::Io {
        name: name.to_string(),
        source,
    })
}

/// An existing non-managed entry sits at the link path; apply the
/// configured conflict mode.
fn handle_conflict(
    name: &str,
    link: &Path,
    conflict: ConflictMode,
    backup_extension: &str,
) -> Result<(), SymlinkError> {
    match conflict {
        ConflictMode::Backup => {
            let mut backup = link.as_os_str().to_owned();
            backup.push(backup_extension);
            let backup = PathBuf::from(backup);
            std::fs::rename(link, &backup).map_err(|source| SymlinkError::Io {
                name: name.to_string(),
                source,
            })?;
            info!(original = %link.display(), backup = %backup.display(), "backed up existing file");
            Ok(())
        }
        ConflictMode::Error => Err(SymlinkError::Conflict(link.to_path_buf())),
    }
}

fn is_under_mount(path: &Path, mount_point: &Path) -> bool {
    path == mount_point || path.starts_with(mount_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        mount: PathBuf,
        home: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mount = tmp.path().join("mount");
        let home = tmp.path().join("home");
        std::fs::create_dir_all(&mount).unwrap();
        std::fs::create_dir_all(&home).unwrap();
        Fixture {
            mount,
            home,
            _tmp: tmp,
        }
    }

    fn config_with_symlink(name: &str, link: &Path, conflict: ConflictMode, ext: &str) -> Config {
        let mut cfg = Config::default();
        cfg.settings.symlink.conflict = conflict;
        cfg.settings.symlink.backup_extension = ext.to_string();
        cfg.files.insert(
            name.to_string(),
            Arc::new(FileConfig {
                render: crate::config::RenderMode::Command,
                command: Some("true".to_string()),
                symlink: Some(link.to_string_lossy().into_owned()),
                ..FileConfig::default()
            }),
        );
        cfg
    }

    #[test]
    fn setup_creates_link_into_mount() {
        let fx = fixture();
        let link = fx.home.join(".netrc");
        let cfg = config_with_symlink("netrc", &link, ConflictMode::Error, ".bkp");

        let m = SymlinkManager::new();
        m.setup(&cfg, &fx.mount).unwrap();

        assert_eq!(std::fs::read_link(&link).unwrap(), fx.mount.join("netrc"));
        assert_eq!(m.managed_links().len(), 1);
    }

    #[test]
    fn existing_directory_always_refused() {
        let fx = fixture();
        let link = fx.home.join(".netrc");
        std::fs::create_dir_all(&link).unwrap();

        for conflict in [ConflictMode::Error, ConflictMode::Backup] {
            let cfg = config_with_symlink("netrc", &link, conflict, ".bkp");
            let err = SymlinkManager::new().setup(&cfg, &fx.mount).unwrap_err();
            assert!(matches!(err, SymlinkError::IsDirectory(_)));
            assert!(link.is_dir());
        }
    }

    #[test]
    fn regular_file_error_mode_fails() {
        let fx = fixture();
        let link = fx.home.join(".netrc");
        std::fs::write(&link, "old").unwrap();

        let cfg = config_with_symlink("netrc", &link, ConflictMode::Error, ".bkp");
        let err = SymlinkManager::new().setup(&cfg, &fx.mount).unwrap_err();
        assert!(matches!(err, SymlinkError::Conflict(_)));
        // Untouched.
        assert_eq!(std::fs::read_to_string(&link).unwrap(), "old");
    }

    #[test]
    fn regular_file_backup_mode_renames_then_links() {
        // S6: conflict = backup, backup_extension = "~".
        let fx = fixture();
        let link = fx.home.join(".netrc");
        std::fs::write(&link, "old").unwrap();

        let cfg = config_with_symlink("netrc", &link, ConflictMode::Backup, "~");
        SymlinkManager::new().setup(&cfg, &fx.mount).unwrap();

        assert_eq!(std::fs::read_link(&link).unwrap(), fx.mount.join("netrc"));
        let backup = fx.home.join(".netrc~");
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "old");
    }

    #[test]
    fn foreign_symlink_respects_conflict_mode() {
        let fx = fixture();
        let link = fx.home.join(".netrc");
        let elsewhere = fx.home.join("elsewhere");
        std::fs::write(&elsewhere, "x").unwrap();
        std::os::unix::fs::symlink(&elsewhere, &link).unwrap();

        let cfg = config_with_symlink("netrc", &link, ConflictMode::Error, ".bkp");
        let err = SymlinkManager::new().setup(&cfg, &fx.mount).unwrap_err();
        assert!(matches!(err, SymlinkError::Conflict(_)));

        let cfg = config_with_symlink("netrc", &link, ConflictMode::Backup, ".bkp");
        SymlinkManager::new().setup(&cfg, &fx.mount).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), fx.mount.join("netrc"));
        assert!(fx.home.join(".netrc.bkp").exists());
    }

    #[test]
    fn managed_symlink_replaced_silently() {
        let fx = fixture();
        let link = fx.home.join(".netrc");
        // A link into the mount from a previous daemon run.
        std::os::unix::fs::symlink(fx.mount.join("stale-name"), &link).unwrap();

        let cfg = config_with_symlink("netrc", &link, ConflictMode::Error, ".bkp");
        SymlinkManager::new().setup(&cfg, &fx.mount).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), fx.mount.join("netrc"));
    }

    #[test]
    fn reconcile_drops_stale_and_adds_new() {
        let fx = fixture();
        let old_link = fx.home.join(".netrc");
        let cfg = config_with_symlink("netrc", &old_link, ConflictMode::Error, ".bkp");

        let m = SymlinkManager::new();
        m.setup(&cfg, &fx.mount).unwrap();

        // New file set: netrc is gone, npmrc appears.
        let new_link = fx.home.join(".npmrc");
        let new_cfg = config_with_symlink("npmrc", &new_link, ConflictMode::Error, ".bkp");
        m.reconcile_with_config(&new_cfg.files, &fx.mount, ConflictMode::Error, ".bkp")
            .unwrap();

        assert!(!old_link.exists());
        assert_eq!(std::fs::read_link(&new_link).unwrap(), fx.mount.join("npmrc"));
        let managed = m.managed_links();
        assert_eq!(managed.len(), 1);
        assert!(managed.contains_key("npmrc"));
    }

    #[test]
    fn cleanup_unlinks_everything_but_keeps_backups() {
        let fx = fixture();
        let link = fx.home.join(".netrc");
        std::fs::write(&link, "old").unwrap();

        let cfg = config_with_symlink("netrc", &link, ConflictMode::Backup, "~");
        let m = SymlinkManager::new();
        m.setup(&cfg, &fx.mount).unwrap();

        m.cleanup();
        assert!(!link.exists());
        // Backup is not auto-restored.
        assert_eq!(
            std::fs::read_to_string(fx.home.join(".netrc~")).unwrap(),
            "old"
        );
        assert!(m.managed_links().is_empty());
    }
}
