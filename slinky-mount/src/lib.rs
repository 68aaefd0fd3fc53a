//! Mount backend construction and auto-selection.
//!
//! `auto` prefers FUSE (fully dynamic, nothing ever touches a filesystem),
//! then tmpfs (needs mount privileges), then FIFO (works anywhere).

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use slinky_core::config::{BackendKind, Config};
use slinky_core::context::ContextManager;
use slinky_core::mount::Backend;
use slinky_core::resolver::SecretResolver;

pub mod fifo;
pub mod tmpfs;

pub use fifo::FifoBackend;
pub use tmpfs::{DirMounter, TmpfsBackend};

/// Build the configured mount backend.  `auto` resolves by probing.
pub fn new_backend(
    cfg: Arc<Config>,
    resolver: Arc<SecretResolver>,
    context: Option<Arc<ContextManager>>,
) -> Box<dyn Backend> {
    let kind = match cfg.settings.mount.backend {
        BackendKind::Auto => resolve_auto_backend(),
        kind => kind,
    };

    match kind {
        BackendKind::Fuse => Box::new(slinky_fuse::FuseBackend::new(cfg, resolver, context)),
        BackendKind::Tmpfs => Box::new(TmpfsBackend::new(cfg, resolver, context)),
        _ => Box::new(FifoBackend::new(cfg, resolver, context)),
    }
}

/// Probe for available backends.  Preference: FUSE > tmpfs > FIFO.
pub fn resolve_auto_backend() -> BackendKind {
    if fuse_available() {
        info!("auto backend: FUSE available, using fuse");
        return BackendKind::Fuse;
    }
    if tmpfs_available() {
        info!("auto backend: tmpfs available, using tmpfs");
        return BackendKind::Tmpfs;
    }
    warn!("auto backend: FUSE and tmpfs not available, falling back to fifo");
    BackendKind::Fifo
}

/// Whether the system supports FUSE mounts.
pub fn fuse_available() -> bool {
    if cfg!(target_os = "macos") {
        // Only macFUSE is supported; FUSE-T's NFS translation is not.
        [
            "/dev/macfuse0",
            "/dev/osxfuse0",
            "/Library/Filesystems/macfuse.fs",
            "/Library/Filesystems/osxfuse.fs",
        ]
        .iter()
        .any(|path| Path::new(path).exists())
    } else if cfg!(target_os = "linux") {
        Path::new("/dev/fuse").exists()
            && (binary_in_path("fusermount3") || binary_in_path("fusermount"))
    } else {
        false
    }
}

/// Whether the system can create RAM-backed mounts.
pub fn tmpfs_available() -> bool {
    if cfg!(target_os = "macos") {
        // Present on all standard installs.
        binary_in_path("hdiutil") && binary_in_path("diskutil")
    } else if cfg!(target_os = "linux") {
        // tmpfs mounts require root or CAP_SYS_ADMIN.
        nix::unistd::geteuid().is_root()
    } else {
        false
    }
}

fn binary_in_path(name: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slinky_core::cache::SecretCache;
    use slinky_core::cipher::Ephemeral;
    use slinky_core::config::CurrentConfig;

    fn resolver(cfg: &Arc<Config>) -> Arc<SecretResolver> {
        Arc::new(SecretResolver::new(
            CurrentConfig::new(Arc::clone(cfg)),
            Arc::new(SecretCache::new(Box::new(Ephemeral::new()))),
            None,
        ))
    }

    #[test]
    fn explicit_kinds_build_matching_backends() {
        for (kind, want) in [
            (BackendKind::Fifo, "fifo"),
            (BackendKind::Tmpfs, "tmpfs"),
            (BackendKind::Fuse, "fuse"),
        ] {
            let mut cfg = Config::default();
            cfg.settings.mount.backend = kind;
            let cfg = Arc::new(cfg);
            let backend = new_backend(Arc::clone(&cfg), resolver(&cfg), None);
            assert_eq!(backend.name(), want);
        }
    }

    #[test]
    fn auto_resolves_to_some_concrete_kind() {
        let kind = resolve_auto_backend();
        assert_ne!(kind, BackendKind::Auto);
    }

    #[test]
    fn binary_in_path_finds_sh() {
        assert!(binary_in_path("sh"));
        assert!(!binary_in_path("slinky-no-such-binary-zz"));
    }
}
