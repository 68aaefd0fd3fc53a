//! FUSE mount backend.
//!
//! Files exist only as in-memory responses to `read()` syscalls.  The tree
//! is fully dynamic: `lookup` and `readdir` consult the context manager's
//! effective file set on every call, so activation switches are visible
//! immediately without remounting.  Entry and attribute TTLs are zero so
//! the kernel never caches a directory view.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fuser::{BackgroundSession, MountOption, SessionACL};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use slinky_core::config::{Config, CurrentConfig};
use slinky_core::context::ContextManager;
use slinky_core::mount::{Backend, BackendError};
use slinky_core::resolver::SecretResolver;

mod fs;

use fs::SlinkyFs;

pub struct FuseBackend {
    mount_point: PathBuf,
    cfg: CurrentConfig,
    resolver: Arc<SecretResolver>,
    context: Option<Arc<ContextManager>>,
    session: Mutex<Option<BackgroundSession>>,
}

impl FuseBackend {
    /// `context` may be `None` (global files only).
    pub fn new(
        cfg: Arc<Config>,
        resolver: Arc<SecretResolver>,
        context: Option<Arc<ContextManager>>,
    ) -> Self {
        Self {
            mount_point: cfg.settings.mount.mount_point.clone(),
            cfg: CurrentConfig::new(cfg),
            resolver,
            context,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Backend for FuseBackend {
    async fn mount(&self, token: CancellationToken) -> Result<(), BackendError> {
        // Clean up any stale mount left by a previous daemon instance
        // (crash, or a service manager restarting before unmount finished).
        unmount_stale(&self.mount_point);

        std::fs::create_dir_all(&self.mount_point)?;

        let fs = SlinkyFs::new(
            self.cfg.clone(),
            Arc::clone(&self.resolver),
            self.context.clone(),
            tokio::runtime::Handle::current(),
        );

        let mut config = fuser::Config::default();
        config.mount_options = vec![
            MountOption::RO,
            MountOption::FSName("slinky".to_string()),
        ];
        config.acl = SessionACL::Owner;

        let session = fuser::spawn_mount2(fs, &self.mount_point, &config).map_err(|e| {
            BackendError::Mount {
                backend: "fuse",
                path: self.mount_point.display().to_string(),
                message: e.to_string(),
            }
        })?;
        *self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session);

        info!(path = %self.mount_point.display(), "FUSE mounted");

        token.cancelled().await;
        info!("context cancelled, unmounting FUSE");
        self.unmount().await
    }

    async fn unmount(&self) -> Result<(), BackendError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the session signals the FUSE thread to stop and performs
        // the kernel unmount.
        drop(session);

        // Belt-and-suspenders in case the kernel mount outlives the session
        // (e.g. the process was killed mid-teardown last run).
        let _ = std::process::Command::new("fusermount3")
            .args(["-u", self.mount_point.to_string_lossy().as_ref()])
            .output();

        Ok(())
    }

    /// Lookup and readdir are already dynamic; nothing to reconcile.
    fn reconfigure(&self) {}

    fn update_config(&self, cfg: Arc<Config>) {
        self.cfg.store(cfg);
    }

    fn name(&self) -> &'static str {
        "fuse"
    }
}

/// Detect and clean a stale FUSE mount at `path`.  Stale means stat fails
/// with anything other than ENOENT (e.g. "Transport endpoint is not
/// connected"), or the path is a live mount point (device ID differs from
/// its parent) left behind by a previous daemon.
fn unmount_stale(mount_point: &Path) {
    if !is_mounted_or_stale(mount_point) {
        return;
    }
    info!(path = %mount_point.display(), "cleaning stale FUSE mount");
    let path = mount_point.to_string_lossy();
    if std::process::Command::new("umount")
        .arg(path.as_ref())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
    {
        return;
    }
    if cfg!(target_os = "macos") {
        warn!(path = %mount_point.display(), "umount failed, trying diskutil");
        if let Err(e) = std::process::Command::new("diskutil")
            .args(["unmount", "force", path.as_ref()])
            .status()
        {
            error!(path = %mount_point.display(), error = %e, "failed to clean stale mount");
        }
    } else {
        error!(path = %mount_point.display(), "failed to clean stale mount");
    }
}

fn is_mounted_or_stale(path: &Path) -> bool {
    let st = match nix::sys::stat::stat(path) {
        // ENOENT means the path doesn't exist — not mounted.  Any other
        // errno (ENOTCONN, EIO, ...) indicates a stale mount.
        Err(errno) => return errno != nix::errno::Errno::ENOENT,
        Ok(st) => st,
    };

    let Some(parent) = path.parent() else {
        return false;
    };
    match nix::sys::stat::stat(parent) {
        Ok(parent_st) => st.st_dev != parent_st.st_dev,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_not_stale() {
        assert!(!is_mounted_or_stale(Path::new("/nonexistent/slinky-mount")));
    }

    #[test]
    fn ordinary_directory_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("mnt");
        std::fs::create_dir_all(&sub).unwrap();
        assert!(!is_mounted_or_stale(&sub));
    }
}
