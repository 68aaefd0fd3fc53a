//! Named-pipe mount backend.
//!
//! Each effective file gets a FIFO under the mount directory.  When a
//! consumer opens the pipe for reading, the per-file serve task resolves
//! the secret and streams it through the kernel pipe buffer; the local
//! plaintext buffer is scrubbed the moment the write completes.
//!
//! Nothing here needs mount privileges — just a writable directory and
//! mkfifo.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slinky_core::config::{Config, CurrentConfig, FileConfig};
use slinky_core::context::ContextManager;
use slinky_core::fsutil::clean_empty_dirs;
use slinky_core::mount::{Backend, BackendError};
use slinky_core::resolver::SecretResolver;

/// How long to wait between reader-presence polls.
const NO_READER_BACKOFF: Duration = Duration::from_millis(50);

pub struct FifoBackend {
    mount_point: PathBuf,
    cfg: CurrentConfig,
    resolver: Arc<SecretResolver>,
    context: Option<Arc<ContextManager>>,
    state: Mutex<FifoState>,
    reconfig: Notify,
}

struct FifoState {
    /// File name → FIFO path.
    fifos: HashMap<String, PathBuf>,
    /// File name → serve-task cancellation.
    tasks: HashMap<String, CancellationToken>,
}

impl FifoBackend {
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
            state: Mutex::new(FifoState {
                fifos: HashMap::new(),
                tasks: HashMap::new(),
            }),
            reconfig: Notify::new(),
        }
    }

    fn effective_files(&self) -> HashMap<String, Arc<FileConfig>> {
        if let Some(context) = &self.context {
            return context.effective_file_configs();
        }
        self.cfg.load().files.clone()
    }

    /// Diff the effective set against running FIFOs: cancel and remove the
    /// stale, create and serve the new.
    fn reconcile(&self, parent: &CancellationToken) {
        let files = self.effective_files();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let stale: Vec<String> = state
            .fifos
            .keys()
            .filter(|name| !files.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(token) = state.tasks.remove(&name) {
                token.cancel();
            }
            if let Some(path) = state.fifos.remove(&name) {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(name, "fifo removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => error!(name, path = %path.display(), error = %e, "fifo remove failed"),
                }
            }
        }

        clean_empty_dirs(&self.mount_point);

        for (name, fc) in files {
            if state.fifos.contains_key(&name) {
                continue;
            }

            let fifo_path = self.mount_point.join(&name);
            if let Some(dir) = fifo_path.parent()
                && dir != self.mount_point
                && let Err(e) = create_dir_0700(dir)
            {
                error!(dir = %dir.display(), error = %e, "fifo mkdir failed");
                continue;
            }

            let mode = if fc.mode == 0 { 0o600 } else { fc.mode };
            match mkfifo(&fifo_path, Mode::from_bits_truncate(mode as _)) {
                Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => {
                    error!(name, path = %fifo_path.display(), error = %e, "mkfifo failed");
                    continue;
                }
            }

            let token = parent.child_token();
            state.tasks.insert(name.clone(), token.clone());
            state.fifos.insert(name.clone(), fifo_path.clone());

            let resolver = Arc::clone(&self.resolver);
            let serve_name = name.clone();
            tokio::spawn(async move {
                serve_loop(token, serve_name, fifo_path, resolver).await;
            });
            debug!(name, "fifo created");
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        for (name, token) in state.tasks.drain() {
            token.cancel();
            debug!(name, "fifo serve task cancelled");
        }
        for (name, path) in state.fifos.drain() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(name, path = %path.display(), error = %e, "fifo remove on teardown failed"),
            }
        }

        clean_empty_dirs(&self.mount_point);
        // Only succeeds if empty, which is the point.
        let _ = std::fs::remove_dir(&self.mount_point);
    }
}

#[async_trait]
impl Backend for FifoBackend {
    async fn mount(&self, token: CancellationToken) -> Result<(), BackendError> {
        create_dir_0700(&self.mount_point).map_err(|e| BackendError::Mount {
            backend: "fifo",
            path: self.mount_point.display().to_string(),
            message: e.to_string(),
        })?;

        info!(path = %self.mount_point.display(), "fifo backend mounted");

        self.reconcile(&token);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("fifo: context cancelled, cleaning up");
                    self.teardown();
                    return Ok(());
                }
                _ = self.reconfig.notified() => {
                    info!("fifo: reconfigure triggered");
                    self.reconcile(&token);
                }
            }
        }
    }

    async fn unmount(&self) -> Result<(), BackendError> {
        self.teardown();
        Ok(())
    }

    fn reconfigure(&self) {
        // A stored permit absorbs further signals until the next reconcile.
        self.reconfig.notify_one();
    }

    fn update_config(&self, cfg: Arc<Config>) {
        self.cfg.store(cfg);
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}

/// Poll for readers and stream the secret to each one.
///
/// `open(O_WRONLY | O_NONBLOCK)` fails with ENXIO while no reader holds the
/// other end; that is the loop's cooperative wait point.
async fn serve_loop(
    token: CancellationToken,
    name: String,
    fifo_path: PathBuf,
    resolver: Arc<SecretResolver>,
) {
    loop {
        if token.is_cancelled() {
            return;
        }

        let file = match std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo_path)
        {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(NO_READER_BACKOFF) => {}
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                error!(name, error = %e, "fifo open error");
                return;
            }
        };

        let content = match resolver.resolve(&name).await {
            Ok(content) => content,
            Err(e) => {
                error!(name, error = %e, "fifo resolve error");
                drop(file);
                continue;
            }
        };

        // The reader is attached; switch the descriptor back to blocking
        // and hand the write to the blocking pool.  Dropping the content
        // scrubs the plaintext buffer.
        unsafe {
            libc::fcntl(file.as_raw_fd(), libc::F_SETFL, 0);
        }
        let write_name = name.clone();
        let _ = tokio::task::spawn_blocking(move || {
            use std::io::Write as _;
            let mut file = file;
            if let Err(e) = file.write_all(content.as_slice()) {
                warn!(name = write_name, error = %e, "fifo write error");
            }
            drop(content);
        })
        .await;
    }
}

fn create_dir_0700(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::create_dir_all(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}
