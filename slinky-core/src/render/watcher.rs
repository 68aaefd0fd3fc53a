//! Template file watcher.
//!
//! Watches registered template paths and fires a single on-change callback
//! per event batch.  The daemon wires the callback to the mount backend's
//! reconfigure signal: a template edit re-renders the affected files (the
//! fingerprint changes with the template bytes, so cache entries for the
//! old text simply stop being referenced).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type OnChange = Box<dyn Fn() + Send + Sync>;

pub struct TemplateWatcher {
    watcher: Mutex<RecommendedWatcher>,
    paths: Mutex<HashSet<PathBuf>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<notify::Result<Event>>>>,
    on_change: OnChange,
}

impl TemplateWatcher {
    pub fn new(on_change: OnChange) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        Ok(Self {
            watcher: Mutex::new(watcher),
            paths: Mutex::new(HashSet::new()),
            rx: Mutex::new(Some(rx)),
            on_change,
        })
    }

    /// Add a template path to be watched.  Duplicate calls are ignored;
    /// unwatchable paths are logged and skipped.
    pub fn watch(&self, path: &Path) {
        let abs = match std::path::absolute(path) {
            Ok(p) => p,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "template watcher: cannot resolve path");
                return;
            }
        };

        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if paths.contains(&abs) {
            return;
        }
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = watcher.watch(&abs, RecursiveMode::NonRecursive) {
            debug!(path = %abs.display(), error = %e, "template watcher: cannot watch");
            return;
        }
        debug!(path = %abs.display(), "template watcher: watching");
        paths.insert(abs);
    }

    /// Remove a path from watching.
    pub fn unwatch(&self, path: &Path) {
        let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if paths.remove(&abs) {
            let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = watcher.unwatch(&abs);
            debug!(path = %abs.display(), "template watcher: unwatched");
        }
    }

    /// Consume filesystem events until cancelled.  Call once.
    pub async fn run(&self, token: CancellationToken) {
        let Some(mut rx) = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("template watcher: run called twice");
            return;
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = rx.recv() => {
                    match event {
                        None => return,
                        Some(Err(e)) => warn!(error = %e, "template watcher error"),
                        Some(Ok(event)) => self.dispatch(&event),
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        let tracked = {
            let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
            event.paths.iter().any(|p| {
                paths.contains(p)
                    || std::path::absolute(p)
                        .map(|abs| paths.contains(&abs))
                        .unwrap_or(false)
            })
        };

        if tracked {
            info!(paths = ?event.paths, kind = ?event.kind, "template changed");
            (self.on_change)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn change_to_watched_template_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = dir.path().join("netrc.tpl");
        std::fs::write(&tpl, "v1").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let watcher =
            Arc::new(TemplateWatcher::new(Box::new(move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap());
        watcher.watch(&tpl);

        let token = CancellationToken::new();
        let run_token = token.clone();
        let run_watcher = Arc::clone(&watcher);
        let handle = tokio::spawn(async move { run_watcher.run(run_token).await });

        // Give the OS watcher a moment to register, then touch the file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&tpl, "v2").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(fired.load(Ordering::SeqCst) > 0, "callback never fired");

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unwatched_paths_do_not_fire() {
        let dir = tempfile::tempdir().unwrap();
        let tracked = dir.path().join("tracked.tpl");
        let untracked = dir.path().join("untracked.tpl");
        std::fs::write(&tracked, "x").unwrap();
        std::fs::write(&untracked, "x").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let watcher =
            Arc::new(TemplateWatcher::new(Box::new(move || {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap());
        watcher.watch(&tracked);
        watcher.unwatch(&tracked);

        let token = CancellationToken::new();
        let run_token = token.clone();
        let run_watcher = Arc::clone(&watcher);
        let handle = tokio::spawn(async move { run_watcher.run(run_token).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&untracked, "y").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        token.cancel();
        let _ = handle.await;
    }
}
