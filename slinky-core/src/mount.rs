//! The mount backend contract.
//!
//! Three interchangeable presentation layers (FUSE filesystem, RAM-disk,
//! named-pipe streamer) implement this trait; the daemon selects one by the
//! configured backend kind and drives it through one lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("mounting {backend} at {path:?}: {message}")]
    Mount {
        backend: &'static str,
        path: String,
        message: String,
    },
    #[error("unmounting {backend}: {message}")]
    Unmount {
        backend: &'static str,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A presentation layer for the effective file set.
///
/// Backends are constructed once per mount generation; changing the backend
/// kind or the mount point tears the old one down and builds a new one.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Initialize the presentation and serve reads until `token` is
    /// cancelled, then tear down.  Blocks for the backend's lifetime.
    async fn mount(&self, token: CancellationToken) -> Result<(), BackendError>;

    /// Explicit teardown; idempotent.
    async fn unmount(&self) -> Result<(), BackendError>;

    /// Signal that the effective file set changed.  Coalesced: a pending
    /// signal absorbs further ones until the backend reconciles.
    fn reconfigure(&self);

    /// Replace the backend's view of the global config (settings such as
    /// TTLs).  Mount-point or kind changes are handled by the reload
    /// dispatcher's restart rule, not here.
    fn update_config(&self, cfg: Arc<Config>);

    fn name(&self) -> &'static str;
}
