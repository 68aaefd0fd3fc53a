//! Global config file watcher.
//!
//! Watches the config file's parent directory (editors save atomically via
//! write-to-temp + rename, which would orphan a watch on the file itself),
//! debounces bursts, reloads, and hands `(old, new, diff)` to the reload
//! callback.  A reload that fails to parse keeps the current config.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DiffResult, diff};

const DEBOUNCE: Duration = Duration::from_millis(500);

pub type ReloadFn = Box<dyn Fn(&Arc<Config>, &Arc<Config>, &DiffResult) + Send + Sync>;

pub struct ConfigWatcher {
    path: PathBuf,
    current: Mutex<Arc<Config>>,
    on_reload: ReloadFn,
    _watcher: Mutex<RecommendedWatcher>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<notify::Result<Event>>>>,
}

impl ConfigWatcher {
    pub fn new(
        path: &Path,
        initial: Arc<Config>,
        on_reload: ReloadFn,
    ) -> notify::Result<Arc<Self>> {
        let path = std::path::absolute(path).map_err(notify::Error::io)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;

        let dir = path.parent().unwrap_or(Path::new("/"));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        Ok(Arc::new(Self {
            path,
            current: Mutex::new(initial),
            on_reload,
            _watcher: Mutex::new(watcher),
            rx: Mutex::new(Some(rx)),
        }))
    }

    /// Consume filesystem events until cancelled, debouncing rapid bursts
    /// into a single reload.  Call once.
    pub async fn run(&self, token: CancellationToken) {
        let Some(mut rx) = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("config watcher: run called twice");
            return;
        };

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = rx.recv() => event,
            };
            match event {
                None => return,
                Some(Err(e)) => {
                    warn!(error = %e, "config watcher error");
                    continue;
                }
                Some(Ok(event)) => {
                    if !self.relevant(&event) {
                        continue;
                    }
                }
            }

            // Debounce: absorb further events, resetting the timer each
            // time, then reload once.
            let deadline = tokio::time::sleep(DEBOUNCE);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = &mut deadline => {
                        self.reload();
                        break;
                    }
                    event = rx.recv() => {
                        match event {
                            None => {
                                self.reload();
                                return;
                            }
                            Some(Ok(event)) if self.relevant(&event) => {
                                deadline
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + DEBOUNCE);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    /// Reload immediately (SIGHUP path).
    pub fn force_reload(&self) {
        self.reload();
    }

    /// The config the watcher currently considers live.
    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn relevant(&self, event: &Event) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        event.paths.iter().any(|p| {
            p == &self.path
                || std::path::absolute(p)
                    .map(|abs| abs == self.path)
                    .unwrap_or(false)
        })
    }

    fn reload(&self) {
        let new = match Config::load(&self.path) {
            Ok(cfg) => Arc::new(cfg),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "config reload failed, keeping current config");
                return;
            }
        };

        let old = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            let old = Arc::clone(&current);
            let d = diff(&old, &new);
            if !d.has_changes() {
                debug!("config file changed on disk but content is identical");
                return;
            }
            *current = Arc::clone(&new);
            old
        };

        let d = diff(&old, &new);
        info!(
            files_added = d.files_added().len(),
            files_removed = d.files_removed().len(),
            files_modified = d.files_modified().len(),
            "config reloaded"
        );
        (self.on_reload)(&old, &new, &d);
    }
}
