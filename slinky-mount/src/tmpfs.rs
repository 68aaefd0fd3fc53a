//! RAM-backed mount backend.
//!
//! Linux uses a real tmpfs mount (needs mount privileges); macOS attaches a
//! small RAM disk via hdiutil + diskutil.  Files are materialized with
//! atomic writes and re-rendered on a timer derived from the minimum TTL.
//! Every file departure — reconcile or teardown — zero-overwrites the bytes
//! before unlinking, so plaintext cannot be recovered from the backing
//! store.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slinky_core::config::{Config, CurrentConfig, FileConfig};
use slinky_core::context::ContextManager;
use slinky_core::fsutil::{clean_empty_dirs, scrub_file};
use slinky_core::mount::{Backend, BackendError};
use slinky_core::resolver::SecretResolver;

/// Floor for the refresh ticker.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
/// TTL assumed when no file configures one.
const FALLBACK_TTL: Duration = Duration::from_secs(5 * 60);

/// Platform-specific acquisition of a RAM-backed mount.
pub trait PlatformMounter: Send + Sync {
    fn mount(&self) -> std::io::Result<()>;
    fn unmount(&self) -> std::io::Result<()>;
}

pub struct TmpfsBackend {
    mount_point: PathBuf,
    cfg: CurrentConfig,
    resolver: Arc<SecretResolver>,
    context: Option<Arc<ContextManager>>,
    mounter: Box<dyn PlatformMounter>,
    /// File name → absolute path of the written file.
    rendered: Mutex<HashMap<String, PathBuf>>,
    reconfig: Notify,
}

impl TmpfsBackend {
    pub fn new(
        cfg: Arc<Config>,
        resolver: Arc<SecretResolver>,
        context: Option<Arc<ContextManager>>,
    ) -> Self {
        let mounter = new_platform_mounter(&cfg.settings.mount.mount_point);
        Self::with_mounter(cfg, resolver, context, mounter)
    }

    /// Construct with an explicit mounter (tests use [`DirMounter`]).
    pub fn with_mounter(
        cfg: Arc<Config>,
        resolver: Arc<SecretResolver>,
        context: Option<Arc<ContextManager>>,
        mounter: Box<dyn PlatformMounter>,
    ) -> Self {
        Self {
            mount_point: cfg.settings.mount.mount_point.clone(),
            cfg: CurrentConfig::new(cfg),
            resolver,
            context,
            mounter,
            rendered: Mutex::new(HashMap::new()),
            reconfig: Notify::new(),
        }
    }

    fn effective_files(&self) -> HashMap<String, Arc<FileConfig>> {
        if let Some(context) = &self.context {
            return context.effective_file_configs();
        }
        self.cfg.load().files.clone()
    }

    /// Resolve and write every effective file; per-file failures are logged
    /// and skipped.
    async fn render_all(&self) {
        for (name, fc) in self.effective_files() {
            if let Err(e) = self.render_file(&name, &fc).await {
                warn!(file = name, error = %e, "skipping file render");
            }
        }
    }

    async fn render_file(&self, name: &str, fc: &FileConfig) -> Result<(), String> {
        let content = self
            .resolver
            .resolve(name)
            .await
            .map_err(|e| e.to_string())?;

        let dest = self.mount_point.join(name);
        atomic_write(&dest, content.as_slice(), fc.mode).map_err(|e| e.to_string())?;
        drop(content);

        self.rendered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), dest.clone());
        debug!(name, path = %dest.display(), "rendered file");
        Ok(())
    }

    /// Scrub files that left the effective set, render the current set,
    /// remove now-empty subdirectories.
    async fn reconcile(&self) {
        let files = self.effective_files();

        let departed: Vec<(String, PathBuf)> = {
            let mut rendered = self.rendered.lock().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<String> = rendered
                .keys()
                .filter(|name| !files.contains_key(*name))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|name| rendered.remove(&name).map(|path| (name, path)))
                .collect()
        };

        for (name, path) in departed {
            match scrub_file(&path) {
                Ok(()) => debug!(file = name, "scrubbed removed file"),
                Err(e) => {
                    error!(file = name, path = %path.display(), error = %e, "scrub failed during reconcile");
                }
            }
        }

        clean_empty_dirs(&self.mount_point);

        for (name, fc) in files {
            if let Err(e) = self.render_file(&name, &fc).await {
                error!(file = name, error = %e, "render failed during reconcile");
            }
        }
    }

    /// Zero-overwrite and remove every rendered file.
    fn scrub_all(&self) {
        let rendered: HashMap<String, PathBuf> = self
            .rendered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (name, path) in rendered {
            match scrub_file(&path) {
                Ok(()) => debug!(file = name, path = %path.display(), "scrubbed file"),
                Err(e) => error!(file = name, path = %path.display(), error = %e, "scrub failed"),
            }
        }

        clean_empty_dirs(&self.mount_point);
    }

    /// Refresh at half the minimum TTL, clamped to at least one second.
    /// Half so a secret is re-rendered before a consumer can observe an
    /// expired one.
    fn refresh_interval(&self) -> Duration {
        (self.min_ttl() / 2).max(MIN_REFRESH_INTERVAL)
    }

    fn min_ttl(&self) -> Duration {
        let default_ttl = self.cfg.load().settings.cache.default_ttl;
        let min = self
            .effective_files()
            .values()
            .map(|fc| fc.file_ttl(default_ttl))
            .min()
            .unwrap_or(Duration::ZERO);
        if min.is_zero() { FALLBACK_TTL } else { min }
    }
}

#[async_trait]
impl Backend for TmpfsBackend {
    async fn mount(&self, token: CancellationToken) -> Result<(), BackendError> {
        self.mounter.mount().map_err(|e| BackendError::Mount {
            backend: "tmpfs",
            path: self.mount_point.display().to_string(),
            message: e.to_string(),
        })?;

        info!(path = %self.mount_point.display(), "tmpfs mounted");

        self.render_all().await;

        let mut interval = self.refresh_interval();
        info!(?interval, "starting refresh loop");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("context cancelled, cleaning up tmpfs");
                    self.scrub_all();
                    if let Err(e) = self.mounter.unmount() {
                        error!(error = %e, "unmount error");
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    // The cache's stale-refresh path dedupes the renders.
                    self.render_all().await;
                }
                _ = self.reconfig.notified() => {
                    info!("reconfigure triggered, re-rendering");
                    self.reconcile().await;
                    let new_interval = self.refresh_interval();
                    if new_interval != interval {
                        info!(old = ?interval, new = ?new_interval, "refresh interval changed");
                        interval = new_interval;
                        ticker = tokio::time::interval(new_interval);
                        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        ticker.tick().await;
                    }
                }
            }
        }
    }

    async fn unmount(&self) -> Result<(), BackendError> {
        self.scrub_all();
        self.mounter.unmount().map_err(|e| BackendError::Unmount {
            backend: "tmpfs",
            message: e.to_string(),
        })
    }

    fn reconfigure(&self) {
        self.reconfig.notify_one();
    }

    fn update_config(&self, cfg: Arc<Config>) {
        self.cfg.store(cfg);
    }

    fn name(&self) -> &'static str {
        "tmpfs"
    }
}

/// Write `content` atomically: temp file in the destination directory
/// (created 0600), chmod to the configured mode, write, rename over the
/// destination.
fn atomic_write(dest: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let dir = dest.parent().unwrap_or(Path::new("/"));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".slinky-")
        .tempfile_in(dir)?;
    std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Platform mounters
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn new_platform_mounter(path: &Path) -> Box<dyn PlatformMounter> {
    Box::new(LinuxTmpfsMounter {
        path: path.to_path_buf(),
    })
}

#[cfg(target_os = "macos")]
fn new_platform_mounter(path: &Path) -> Box<dyn PlatformMounter> {
    Box::new(RamDiskMounter {
        path: path.to_path_buf(),
        device: Mutex::new(None),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn new_platform_mounter(path: &Path) -> Box<dyn PlatformMounter> {
    Box::new(DirMounter {
        path: path.to_path_buf(),
    })
}

/// Real tmpfs mount; requires root or CAP_SYS_ADMIN.
#[cfg(target_os = "linux")]
struct LinuxTmpfsMounter {
    path: PathBuf,
}

#[cfg(target_os = "linux")]
impl PlatformMounter for LinuxTmpfsMounter {
    fn mount(&self) -> std::io::Result<()> {
        use nix::mount::{MsFlags, mount};

        std::fs::create_dir_all(&self.path)?;
        mount(
            Some("tmpfs"),
            &self.path,
            Some("tmpfs"),
            MsFlags::empty(),
            Some("size=4m,mode=0700"),
        )
        .map_err(std::io::Error::from)
    }

    fn unmount(&self) -> std::io::Result<()> {
        use nix::mount::{MntFlags, umount2};

        umount2(&self.path, MntFlags::MNT_DETACH).map_err(std::io::Error::from)?;
        std::fs::remove_dir(&self.path)
    }
}

/// 4 MB HFS+ RAM disk via hdiutil + diskutil (APFS needs ~16 MB minimum,
/// wasteful for a handful of small files).
#[cfg(target_os = "macos")]
struct RamDiskMounter {
    path: PathBuf,
    /// Whole-disk device (e.g. "/dev/disk4") while attached.
    device: Mutex<Option<String>>,
}

#[cfg(target_os = "macos")]
impl PlatformMounter for RamDiskMounter {
    fn mount(&self) -> std::io::Result<()> {
        use std::process::Command;

        std::fs::create_dir_all(&self.path)?;

        // 8192 sectors * 512 bytes = 4 MB.
        let out = Command::new("hdiutil")
            .args(["attach", "-nomount", "ram://8192"])
            .output()?;
        if !out.status.success() {
            return Err(std::io::Error::other("hdiutil attach failed"));
        }
        let device = String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| std::io::Error::other("hdiutil attach: unexpected empty output"))?;
        let partition = format!("{device}s1");

        let detach = |device: &str| {
            let _ = Command::new("hdiutil").args(["detach", device]).status();
        };

        if !Command::new("diskutil")
            .args(["eraseDisk", "HFS+", "Slinky", &device])
            .status()?
            .success()
        {
            detach(&device);
            return Err(std::io::Error::other("diskutil eraseDisk failed"));
        }

        // diskutil auto-mounts at /Volumes/Slinky; remount at our path.
        let _ = Command::new("diskutil")
            .args(["unmount", "/Volumes/Slinky"])
            .status();

        let path = self.path.to_string_lossy();
        if !Command::new("diskutil")
            .args(["mount", "-mountPoint", path.as_ref(), &partition])
            .status()?
            .success()
        {
            detach(&device);
            return Err(std::io::Error::other(format!(
                "diskutil mount at {path} failed"
            )));
        }

        let _ = Command::new("chflags").args(["hidden", path.as_ref()]).status();

        *self.device.lock().unwrap_or_else(PoisonError::into_inner) = Some(device);
        Ok(())
    }

    fn unmount(&self) -> std::io::Result<()> {
        use std::process::Command;

        let Some(device) = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        if !Command::new("hdiutil")
            .args(["detach", &device, "-force"])
            .status()?
            .success()
        {
            return Err(std::io::Error::other(format!(
                "hdiutil detach {device} failed"
            )));
        }
        let _ = std::fs::remove_dir(&self.path);
        Ok(())
    }
}

/// Plain-directory fallback: no RAM backing, but the full render/scrub
/// lifecycle.  Used by tests and as a stand-in where mount privileges are
/// unavailable.
pub struct DirMounter {
    pub path: PathBuf,
}

impl PlatformMounter for DirMounter {
    fn mount(&self) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::create_dir_all(&self.path)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o700))
    }

    fn unmount(&self) -> std::io::Result<()> {
        std::fs::remove_dir_all(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slinky_core::cache::SecretCache;
    use slinky_core::cipher::Ephemeral;
    use slinky_core::config::RenderMode;

    fn command_file(output: &str, mode: u32) -> Arc<FileConfig> {
        Arc::new(FileConfig {
            render: RenderMode::Command,
            command: Some("sh".to_string()),
            args: vec!["-c".to_string(), format!("printf %s '{output}'")],
            mode,
            ..FileConfig::default()
        })
    }

    fn backend_with(
        mount_point: &Path,
        files: &[(&str, Arc<FileConfig>)],
    ) -> Arc<TmpfsBackend> {
        let mut cfg = Config::default();
        cfg.settings.mount.mount_point = mount_point.to_path_buf();
        for (name, fc) in files {
            cfg.files.insert(name.to_string(), Arc::clone(fc));
        }
        let cfg = Arc::new(cfg);
        let current = CurrentConfig::new(Arc::clone(&cfg));
        let resolver = Arc::new(SecretResolver::new(
            current,
            Arc::new(SecretCache::new(Box::new(Ephemeral::new()))),
            None,
        ));
        Arc::new(TmpfsBackend::with_mounter(
            Arc::clone(&cfg),
            resolver,
            None,
            Box::new(DirMounter {
                path: mount_point.to_path_buf(),
            }),
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mount_renders_files_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        let backend = backend_with(
            &mount,
            &[
                ("netrc", command_file("machine x", 0o640)),
                ("docker/config.json", command_file("{}", 0o600)),
            ],
        );

        let token = CancellationToken::new();
        let mount_token = token.clone();
        let mount_backend = Arc::clone(&backend);
        let handle = tokio::spawn(async move { mount_backend.mount(mount_token).await });

        let netrc = mount.join("netrc");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !netrc.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(std::fs::read(&netrc).unwrap(), b"machine x");
        assert_eq!(
            std::fs::read(mount.join("docker/config.json")).unwrap(),
            b"{}"
        );
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&netrc).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        token.cancel();
        handle.await.unwrap().unwrap();
        // Teardown scrubbed and the dir mounter removed the tree.
        assert!(!netrc.exists());
        assert!(!mount.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconcile_scrubs_departed_files() {
        // Property 11: after reconcile removes F, nothing exists at F.
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        let backend = backend_with(
            &mount,
            &[
                ("keep", command_file("k", 0o600)),
                ("sub/drop", command_file("d", 0o600)),
            ],
        );

        let token = CancellationToken::new();
        let mount_token = token.clone();
        let mount_backend = Arc::clone(&backend);
        let handle = tokio::spawn(async move { mount_backend.mount(mount_token).await });

        let drop_path = mount.join("sub/drop");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !drop_path.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drop_path.exists());

        let mut new_cfg = Config::default();
        new_cfg.settings.mount.mount_point = mount.clone();
        new_cfg
            .files
            .insert("keep".to_string(), command_file("k", 0o600));
        backend.cfg.store(Arc::new(new_cfg));
        backend.reconfigure();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while drop_path.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!drop_path.exists(), "departed file still present");
        assert!(!mount.join("sub").exists(), "empty subdir not cleaned");
        assert_eq!(std::fs::read(mount.join("keep")).unwrap(), b"k");

        token.cancel();
        let _ = handle.await;
    }

    #[test]
    fn atomic_write_creates_parents_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/file");
        atomic_write(&dest, b"payload", 0o640).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        // Overwrite in place.
        atomic_write(&dest, b"v2", 0o640).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"v2");
    }

    #[test]
    fn refresh_interval_derives_from_min_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");

        let fast = Arc::new(FileConfig {
            render: RenderMode::Command,
            command: Some("true".to_string()),
            ttl: Some(Duration::from_secs(30)),
            ..FileConfig::default()
        });
        let backend = backend_with(&mount, &[("fast", fast), ("slow", command_file("s", 0o600))]);
        // min(30s, default 5m) / 2.
        assert_eq!(backend.refresh_interval(), Duration::from_secs(15));

        // Sub-second TTLs clamp to the 1 s floor.
        let tiny = Arc::new(FileConfig {
            render: RenderMode::Command,
            command: Some("true".to_string()),
            ttl: Some(Duration::from_millis(100)),
            ..FileConfig::default()
        });
        let backend = backend_with(&mount, &[("tiny", tiny)]);
        assert_eq!(backend.refresh_interval(), Duration::from_secs(1));

        // No files: fall back to 5m/2.
        let backend = backend_with(&mount, &[]);
        assert_eq!(backend.refresh_interval(), Duration::from_secs(150));
    }
}
