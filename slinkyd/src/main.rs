//! The slinky daemon.
//!
//! Wires the core subsystems together and runs the mount loop: config and
//! trust stores, the encrypted cache, the context manager with its
//! reconcile callback, the resolver, the selected mount backend, the
//! symlink manager, template and config watchers, the reload dispatcher,
//! the control socket, and the session/cache reapers.
//!
//! SIGINT/SIGTERM shut everything down; SIGHUP forces a config reload.

use std::collections::HashMap;
use std::io::Write as _;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context as _, bail};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use slinky_core::cache::SecretCache;
use slinky_core::cipher::new_cipher;
use slinky_core::config::{Config, CurrentConfig};
use slinky_core::config_watch::ConfigWatcher;
use slinky_core::context::{ContextManager, SessionReaper};
use slinky_core::control::ControlServer;
use slinky_core::mount::Backend;
use slinky_core::paths::{default_config_path, expand_path, state_dir};
use slinky_core::reload::{ActionKind, Dispatcher, Rule};
use slinky_core::render::watcher::TemplateWatcher;
use slinky_core::resolver::SecretResolver;
use slinky_core::symlink::SymlinkManager;
use slinky_core::trust::TrustStore;

type BackendSlot = Arc<Mutex<Option<Arc<dyn Backend>>>>;

struct Args {
    config: Option<PathBuf>,
    mount_backend: Option<String>,
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(default_config_path);

    let mut cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(slinky_core::config::ConfigError::Read { path, source })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            eprintln!("config file not found at {}, using defaults", path.display());
            Config::default()
        }
        Err(e) => return Err(e).context("loading config"),
    };

    if let Some(backend) = &args.mount_backend {
        cfg.settings.mount.backend = backend
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
    }

    std::fs::create_dir_all(state_dir()).context("creating state directory")?;
    init_logging(args.verbose).context("initializing logging")?;

    let _pid_file = acquire_pid_lock().context("acquiring PID lock")?;

    let cfg = Arc::new(cfg);
    let current_cfg = CurrentConfig::new(Arc::clone(&cfg));

    let cache = Arc::new(SecretCache::new(new_cipher(cfg.settings.cache.cipher)));
    let symlink_mgr = Arc::new(SymlinkManager::new());
    let trust_store = Arc::new(TrustStore::new(TrustStore::default_store_path()));

    let root = CancellationToken::new();

    // The backend and template watcher are wired into the context manager's
    // on-change callback before they exist; the slots fill in below.
    let backend_slot: BackendSlot = Arc::new(Mutex::new(None));
    let watcher_slot: Arc<Mutex<Option<Arc<TemplateWatcher>>>> = Arc::new(Mutex::new(None));

    let ctx_mgr = {
        let current_cfg = current_cfg.clone();
        let symlink_mgr = Arc::clone(&symlink_mgr);
        let backend_slot = Arc::clone(&backend_slot);
        let watcher_slot = Arc::clone(&watcher_slot);
        Arc::new(ContextManager::new(
            &cfg,
            cfg.project_config_names(),
            Some(Box::new(move |effective| {
                let latest = current_cfg.load();
                let files: HashMap<_, _> = effective
                    .into_iter()
                    .map(|(name, ef)| (name, ef.file))
                    .collect();
                if let Err(e) = symlink_mgr.reconcile_with_config(
                    &files,
                    &latest.settings.mount.mount_point,
                    latest.settings.symlink.conflict,
                    &latest.settings.symlink.backup_extension,
                ) {
                    error!(error = %e, "symlink reconcile failed");
                }
                if let Some(backend) = backend_slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    backend.reconfigure();
                }
                if let Some(watcher) = watcher_slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    for fc in files.values() {
                        if let Some(template) = fc.template.as_deref() {
                            watcher.watch(&expand_path(template));
                        }
                    }
                }
            })),
        ))
    };
    ctx_mgr.set_trust_store(Arc::clone(&trust_store));

    let resolver = Arc::new(SecretResolver::new(
        current_cfg.clone(),
        Arc::clone(&cache),
        Some(Arc::clone(&ctx_mgr)),
    ));

    let backend: Arc<dyn Backend> = Arc::from(slinky_mount::new_backend(
        Arc::clone(&cfg),
        Arc::clone(&resolver),
        Some(Arc::clone(&ctx_mgr)),
    ));
    *backend_slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&backend));

    // FUSE needs the mount point to exist; tmpfs and fifo create their own.
    std::fs::create_dir_all(&cfg.settings.mount.mount_point)
        .context("creating mount point")?;

    symlink_mgr
        .setup(&cfg, &cfg.settings.mount.mount_point)
        .context("setting up symlinks")?;

    // Template watcher: a changed template re-renders through the backend.
    let tpl_watcher = {
        let backend_slot = Arc::clone(&backend_slot);
        match TemplateWatcher::new(Box::new(move || {
            if let Some(backend) = backend_slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                backend.reconfigure();
            }
        })) {
            Ok(watcher) => {
                let watcher = Arc::new(watcher);
                for fc in cfg.files.values() {
                    if let Some(template) = fc.template.as_deref() {
                        watcher.watch(&expand_path(template));
                    }
                }
                let run_watcher = Arc::clone(&watcher);
                let run_token = root.child_token();
                tokio::spawn(async move { run_watcher.run(run_token).await });
                *watcher_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&watcher));
                Some(watcher)
            }
            Err(e) => {
                warn!(error = %e, "template watcher unavailable");
                None
            }
        }
    };

    // restart_tx signals the mount loop to rebuild the backend when the
    // backend kind or mount point changes; try_send coalesces bursts.
    let (restart_tx, mut restart_rx) = tokio::sync::mpsc::channel::<()>(1);

    let dispatcher = build_dispatcher(
        restart_tx.clone(),
        current_cfg.clone(),
        Arc::clone(&backend_slot),
        Arc::clone(&ctx_mgr),
        Arc::clone(&symlink_mgr),
        Arc::clone(&cache),
        tpl_watcher.clone(),
    );

    let cfg_watcher = match ConfigWatcher::new(
        &config_path,
        Arc::clone(&cfg),
        Box::new(move |old, new, diff| dispatcher.dispatch(old, new, diff)),
    ) {
        Ok(watcher) => {
            let run_watcher = Arc::clone(&watcher);
            let run_token = root.child_token();
            tokio::spawn(async move { run_watcher.run(run_token).await });
            Some(watcher)
        }
        Err(e) => {
            warn!(error = %e, "config watcher unavailable");
            None
        }
    };

    let ctl_server = Arc::new(ControlServer::new(None, Arc::clone(&ctx_mgr)));
    ctl_server.set_cache(Arc::clone(&cache));
    {
        let current_cfg = current_cfg.clone();
        ctl_server.set_config_hash_fn(Box::new(move || {
            current_cfg.load().hash().unwrap_or_else(|e| {
                error!(error = %e, "config hash failed");
                String::new()
            })
        }));
    }
    {
        let server = Arc::clone(&ctl_server);
        let token = root.child_token();
        tokio::spawn(async move {
            if let Err(e) = server.serve(token).await {
                error!(error = %e, "control socket error");
            }
        });
    }

    {
        let reaper = SessionReaper::new(Arc::clone(&ctx_mgr));
        let token = root.child_token();
        tokio::spawn(async move { reaper.run(token).await });
    }
    {
        let cache = Arc::clone(&cache);
        let token = root.child_token();
        tokio::spawn(async move { cache.run_reaper(token).await });
    }

    spawn_signal_handler(
        root.clone(),
        Arc::clone(&symlink_mgr),
        cfg_watcher.clone(),
    )?;

    info!(
        backend = %backend.name(),
        mount_point = %cfg.settings.mount.mount_point.display(),
        files = cfg.files.len(),
        control_socket = %ctl_server.socket_path().display(),
        "starting slinky"
    );

    // Mount loop: the backend runs until the root context cancels or a
    // restart-class config change asks for a rebuild.
    let mut active_backend = backend;
    loop {
        let mount_token = root.child_token();
        let mut mount_handle = {
            let backend = Arc::clone(&active_backend);
            let token = mount_token.clone();
            tokio::spawn(async move { backend.mount(token).await })
        };

        tokio::select! {
            result = &mut mount_handle => {
                mount_token.cancel();
                remove_pid_file();
                return result
                    .context("mount task panicked")?
                    .context("mount backend failed");
            }
            _ = restart_rx.recv() => {
                if root.is_cancelled() {
                    mount_token.cancel();
                    let _ = (&mut mount_handle).await;
                    remove_pid_file();
                    return Ok(());
                }

                info!("reinitializing mount backend");
                mount_token.cancel();
                let _ = (&mut mount_handle).await;

                let new_cfg = current_cfg.load();
                symlink_mgr.cleanup();

                let new_backend: Arc<dyn Backend> = Arc::from(slinky_mount::new_backend(
                    Arc::clone(&new_cfg),
                    Arc::clone(&resolver),
                    Some(Arc::clone(&ctx_mgr)),
                ));
                *backend_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&new_backend));

                std::fs::create_dir_all(&new_cfg.settings.mount.mount_point)
                    .context("creating mount point")?;
                symlink_mgr
                    .setup(&new_cfg, &new_cfg.settings.mount.mount_point)
                    .context("setting up symlinks")?;

                if let Some(watcher) = &tpl_watcher {
                    for fc in new_cfg.files.values() {
                        if let Some(template) = fc.template.as_deref() {
                            watcher.watch(&expand_path(template));
                        }
                    }
                }

                active_backend = new_backend;
                info!(
                    backend = %active_backend.name(),
                    mount_point = %new_cfg.settings.mount.mount_point.display(),
                    "mount backend reinitialized"
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_dispatcher(
    restart_tx: tokio::sync::mpsc::Sender<()>,
    current_cfg: CurrentConfig,
    backend_slot: BackendSlot,
    ctx_mgr: Arc<ContextManager>,
    symlink_mgr: Arc<SymlinkManager>,
    cache: Arc<SecretCache>,
    tpl_watcher: Option<Arc<TemplateWatcher>>,
) -> Arc<Dispatcher> {
    let mut dispatcher = Dispatcher::new(Box::new(move || {
        let _ = restart_tx.try_send(());
    }));

    // Prologues: the shared config handle first (resolver and hash read
    // through it), then each backend's own view.
    {
        let current_cfg = current_cfg.clone();
        dispatcher.on_always(Box::new(move |_, new| {
            current_cfg.store(Arc::clone(new));
        }));
    }
    {
        let backend_slot = Arc::clone(&backend_slot);
        dispatcher.on_always(Box::new(move |_, new| {
            if let Some(backend) = backend_slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                backend.update_config(Arc::clone(new));
            }
        }));
    }

    // Rule 1: swap the global context when files or the project config
    // filename list change.
    {
        let ctx_mgr = Arc::clone(&ctx_mgr);
        dispatcher.register(Rule {
            name: "update-global-context",
            kind: ActionKind::Callback,
            matches: Box::new(|diff| {
                diff.files_changed()
                    || diff.old_settings.project_config_names
                        != diff.new_settings.project_config_names
            }),
            handle: Some(Box::new(move |_, new, _| {
                ctx_mgr.update_global(new, new.project_config_names());
            })),
        });
    }

    // Rule 2: settings-only changes re-reconcile symlinks and poke the
    // backend.
    {
        let current_cfg = current_cfg.clone();
        let ctx_mgr = Arc::clone(&ctx_mgr);
        let symlink_mgr = Arc::clone(&symlink_mgr);
        let backend_slot = Arc::clone(&backend_slot);
        dispatcher.register(Rule {
            name: "reconcile-symlinks-and-backend",
            kind: ActionKind::Callback,
            matches: Box::new(|diff| {
                diff.has_changes()
                    && !diff.files_changed()
                    && diff.old_settings.project_config_names
                        == diff.new_settings.project_config_names
            }),
            handle: Some(Box::new(move |_, _, _| {
                let latest = current_cfg.load();
                let files = ctx_mgr.effective_file_configs();
                if let Err(e) = symlink_mgr.reconcile_with_config(
                    &files,
                    &latest.settings.mount.mount_point,
                    latest.settings.symlink.conflict,
                    &latest.settings.symlink.backup_extension,
                ) {
                    error!(error = %e, "symlink reconcile after config reload failed");
                }
                if let Some(backend) = backend_slot.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    backend.reconfigure();
                }
            })),
        });
    }

    // Rule 3: keep template watches current on any change.
    if let Some(watcher) = tpl_watcher {
        dispatcher.register(Rule {
            name: "update-template-watcher",
            kind: ActionKind::Callback,
            matches: Box::new(|diff| diff.has_changes()),
            handle: Some(Box::new(move |_, new, _| {
                for fc in new.files.values() {
                    if let Some(template) = fc.template.as_deref() {
                        watcher.watch(&expand_path(template));
                    }
                }
            })),
        });
    }

    // Rule 4: hot-swap the cache cipher (wipes the cache).
    {
        dispatcher.register(Rule {
            name: "swap-cache-cipher",
            kind: ActionKind::Callback,
            matches: Box::new(|diff| {
                diff.old_settings.cache.cipher != diff.new_settings.cache.cipher
            }),
            handle: Some(Box::new(move |_, new, _| {
                cache.swap_cipher(new_cipher(new.settings.cache.cipher));
                info!(cipher = %new.settings.cache.cipher, "cache cipher hot-reloaded");
            })),
        });
    }

    // Rule 5: backend kind or mount point changes rebuild the mount.
    dispatcher.register(Rule {
        name: "restart-mount",
        kind: ActionKind::Restart,
        matches: Box::new(|diff| {
            diff.old_settings.mount.backend != diff.new_settings.mount.backend
                || diff.old_settings.mount.mount_point != diff.new_settings.mount.mount_point
        }),
        handle: None,
    });

    Arc::new(dispatcher)
}

fn spawn_signal_handler(
    root: CancellationToken,
    symlink_mgr: Arc<SymlinkManager>,
    cfg_watcher: Option<Arc<ConfigWatcher>>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading config");
                    if let Some(watcher) = cfg_watcher.clone() {
                        tokio::task::spawn_blocking(move || watcher.force_reload());
                    }
                }
            }
        }
        info!("received signal, shutting down");
        symlink_mgr.cleanup();
        root.cancel();
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Process plumbing
// ---------------------------------------------------------------------------

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path())
        .context("opening log file")?;
    let log_file = Arc::new(Mutex::new(log_file));

    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || TeeWriter {
            file: Arc::clone(&log_file),
        })
        .init();
    Ok(())
}

/// Writes to stderr and the daemon log file.
struct TeeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

fn pid_file_path() -> PathBuf {
    state_dir().join("pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("daemon.log")
}

/// Take the advisory exclusive lock on the PID file for the process's
/// lifetime and record our PID in it.
fn acquire_pid_lock() -> anyhow::Result<std::fs::File> {
    let path = pid_file_path();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("opening PID file {}", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        bail!("another slinky daemon holds the PID lock at {}", path.display());
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(pid_file_path());
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        mount_backend: None,
        verbose: false,
    };

    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        let arg = argv[i].as_str();
        match arg {
            "--config" | "-c" => {
                let Some(path) = argv.get(i + 1) else {
                    eprintln!("error: --config requires a path argument");
                    std::process::exit(1);
                };
                args.config = Some(PathBuf::from(path));
                i += 1;
            }
            "--mount" | "-m" => {
                let Some(backend) = argv.get(i + 1) else {
                    eprintln!("error: --mount requires a backend argument");
                    std::process::exit(1);
                };
                args.mount_backend = Some(backend.clone());
                i += 1;
            }
            "--verbose" | "-v" => args.verbose = true,
            "--help" | "-h" => {
                eprintln!("Usage: slinkyd [--config <path>] [--mount <backend>] [--verbose]");
                eprintln!();
                eprintln!("Options:");
                eprintln!(
                    "  -c, --config <path>    Path to config file (default: $XDG_CONFIG_HOME/slinky/config.toml)"
                );
                eprintln!(
                    "  -m, --mount <backend>  Mount backend (auto, fuse, tmpfs, fifo); overrides config"
                );
                eprintln!("  -v, --verbose          Debug-level logging");
                eprintln!("  -h, --help             Show this help message");
                std::process::exit(0);
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    args.config = Some(PathBuf::from(path));
                } else if let Some(backend) = other.strip_prefix("--mount=") {
                    args.mount_backend = Some(backend.to_string());
                } else {
                    eprintln!("error: unknown argument {other:?}");
                    std::process::exit(1);
                }
            }
        }
        i += 1;
    }
    args
}
