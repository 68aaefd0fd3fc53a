//! The FUSE filesystem.
//!
//! ```text
//! /                      ino 1  (root)
//! ├── netrc              file inode, mode from config
//! └── docker/            directory inode for the "docker/" prefix
//!     └── config.json    file inode
//! ```
//!
//! No static tree exists: every `lookup`/`readdir` consults the current
//! effective set, and inodes are allocated lazily per name/prefix.  `open`
//! resolves the file through the resolver; the handle's bytes are scrubbed
//! on `release`.  Handles are served with direct I/O so the page cache
//! never holds plaintext.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    AccessFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation,
    INodeNo, LockOwner, OpenFlags, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request,
};
use tracing::{debug, error};

use slinky_core::SecretBytes;
use slinky_core::config::{CurrentConfig, FileConfig};
use slinky_core::context::ContextManager;
use slinky_core::resolver::SecretResolver;

const INO_ROOT: u64 = 1;
/// First inode for dynamically allocated entries.
const INO_DYNAMIC_START: u64 = 2;

/// What an inode number stands for.  Directory prefixes carry a trailing
/// slash ("" is the root).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum InodeKey {
    File(String),
    Dir(String),
}

/// Lazily grown name/prefix ↔ inode mapping.  Names keep their inode for
/// the filesystem's lifetime so the kernel's open handles stay valid across
/// activation switches.
struct InodeTable {
    by_ino: HashMap<u64, InodeKey>,
    by_key: HashMap<InodeKey, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_key: HashMap::new(),
            next: INO_DYNAMIC_START,
        };
        table.by_ino.insert(INO_ROOT, InodeKey::Dir(String::new()));
        table.by_key.insert(InodeKey::Dir(String::new()), INO_ROOT);
        table
    }

    fn intern(&mut self, key: InodeKey) -> u64 {
        if let Some(ino) = self.by_key.get(&key) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, key.clone());
        self.by_key.insert(key, ino);
        ino
    }

    fn key(&self, ino: u64) -> Option<InodeKey> {
        self.by_ino.get(&ino).cloned()
    }
}

pub struct SlinkyFs {
    cfg: CurrentConfig,
    resolver: Arc<SecretResolver>,
    context: Option<Arc<ContextManager>>,
    runtime: tokio::runtime::Handle,
    inodes: RwLock<InodeTable>,
    handles: Mutex<HandleTable>,
    // Captured at construction so every inode reports the same owner.
    uid: u32,
    gid: u32,
}

struct HandleTable {
    open: HashMap<u64, SecretBytes>,
    next: u64,
}

impl SlinkyFs {
    pub fn new(
        cfg: CurrentConfig,
        resolver: Arc<SecretResolver>,
        context: Option<Arc<ContextManager>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            cfg,
            resolver,
            context,
            runtime,
            inodes: RwLock::new(InodeTable::new()),
            handles: Mutex::new(HandleTable {
                open: HashMap::new(),
                next: 1,
            }),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    /// The current file set: the context manager's effective view when one
    /// is attached, the global config's files otherwise.
    fn effective_files(&self) -> HashMap<String, Arc<FileConfig>> {
        if let Some(context) = &self.context {
            return context.effective_file_configs();
        }
        self.cfg.load().files.clone()
    }

    fn file_attr(&self, ino: u64, mode: u32) -> FileAttr {
        self.make_attr(ino, FileType::RegularFile, mode, 0, 1)
    }

    fn dir_attr(&self, ino: u64) -> FileAttr {
        self.make_attr(ino, FileType::Directory, 0o755, 4096, 2)
    }

    fn make_attr(&self, ino: u64, kind: FileType, perm: u32, size: u64, nlink: u32) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: INodeNo(ino),
            // Size 0 for files: content length varies per render and
            // DIRECT_IO means the kernel never relies on it.
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: UNIX_EPOCH,
            kind,
            perm: perm as u16,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn intern(&self, key: InodeKey) -> u64 {
        self.inodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .intern(key)
    }

    fn key_of(&self, ino: u64) -> Option<InodeKey> {
        self.inodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .key(ino)
    }

    /// Resolve a lookup within a directory prefix against the live file
    /// set: an exact name is a file, a name prefix is a directory.
    fn lookup_entry(&self, prefix: &str, name: &str) -> Option<(u64, FileAttr)> {
        let files = self.effective_files();
        let full = format!("{prefix}{name}");

        if let Some(fc) = files.get(&full) {
            let ino = self.intern(InodeKey::File(full));
            return Some((ino, self.file_attr(ino, fc.mode)));
        }

        let sub_prefix = format!("{full}/");
        if files.keys().any(|n| n.starts_with(&sub_prefix)) {
            let ino = self.intern(InodeKey::Dir(sub_prefix));
            return Some((ino, self.dir_attr(ino)));
        }

        None
    }

    /// Immediate children of a directory prefix, deduplicated by leading
    /// path segment.
    fn dir_children(&self, prefix: &str) -> Vec<(u64, FileType, String)> {
        let files = self.effective_files();
        let mut seen = HashMap::new();

        for (name, fc) in &files {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => {
                    seen.entry(rest.to_string()).or_insert_with(|| {
                        let ino = self.intern(InodeKey::File(name.clone()));
                        (ino, FileType::RegularFile, fc.mode)
                    });
                }
                Some((top, _)) => {
                    seen.entry(top.to_string()).or_insert_with(|| {
                        let ino = self.intern(InodeKey::Dir(format!("{prefix}{top}/")));
                        (ino, FileType::Directory, 0o755)
                    });
                }
            }
        }

        let mut entries: Vec<(u64, FileType, String)> = seen
            .into_iter()
            .map(|(name, (ino, kind, _mode))| (ino, kind, name))
            .collect();
        entries.sort_by(|a, b| a.2.cmp(&b.2));
        entries
    }
}

impl Filesystem for SlinkyFs {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(InodeKey::Dir(prefix)) = self.key_of(parent.0) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.lookup_entry(&prefix, name) {
            Some((ino, attr)) => {
                debug!(parent = parent.0, name, ino, "fuse lookup");
                // Zero TTL: the kernel revalidates on every access, so
                // activation changes are visible immediately.
                reply.entry(&Duration::ZERO, &attr, Generation(0));
            }
            None => reply.error(Errno::ENOENT),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.key_of(ino.0) {
            Some(InodeKey::Dir(_)) => reply.attr(&Duration::ZERO, &self.dir_attr(ino.0)),
            Some(InodeKey::File(name)) => match self.effective_files().get(&name) {
                Some(fc) => reply.attr(&Duration::ZERO, &self.file_attr(ino.0, fc.mode)),
                None => reply.error(Errno::ENOENT),
            },
            None => reply.error(Errno::ENOENT),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        // The mount is restricted to our own UID (SessionACL::Owner); only
        // existence matters here.
        match self.key_of(ino.0) {
            Some(InodeKey::Dir(_)) => reply.ok(),
            Some(InodeKey::File(name)) => {
                if self.effective_files().contains_key(&name) {
                    reply.ok();
                } else {
                    reply.error(Errno::ENOENT);
                }
            }
            None => reply.error(Errno::ENOENT),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let Some(InodeKey::File(name)) = self.key_of(ino.0) else {
            reply.error(Errno::ENOENT);
            return;
        };

        let content = match self.runtime.block_on(self.resolver.resolve(&name)) {
            Ok(content) => content,
            Err(e) => {
                error!(file = name, error = %e, "resolve failed");
                reply.error(Errno::EIO);
                return;
            }
        };

        let fh = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            let fh = handles.next;
            handles.next += 1;
            handles.open.insert(fh, content);
            fh
        };

        // Direct I/O: reads bypass the page cache, so plaintext never
        // outlives the handle.
        reply.opened(FileHandle(fh), FopenFlags::FOPEN_DIRECT_IO);
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        match handles.open.get(&fh.0) {
            None => reply.error(Errno::EBADF),
            Some(content) => {
                let content = content.as_slice();
                let start = (offset as usize).min(content.len());
                let end = (start + size as usize).min(content.len());
                reply.data(&content[start..end]);
            }
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Dropping the SecretBytes overwrites the buffer with zeros.
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .remove(&fh.0);
        drop(removed);
        reply.ok();
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        match self.key_of(ino.0) {
            Some(InodeKey::Dir(_)) => reply.opened(FileHandle(0), FopenFlags::empty()),
            _ => reply.error(Errno::ENOENT),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let Some(InodeKey::Dir(prefix)) = self.key_of(ino.0) else {
            reply.error(Errno::ENOENT);
            return;
        };

        let parent_ino = if prefix.is_empty() {
            INO_ROOT
        } else {
            let trimmed = &prefix[..prefix.len() - 1];
            match trimmed.rfind('/') {
                Some(idx) => self.intern(InodeKey::Dir(trimmed[..=idx].to_string())),
                None => INO_ROOT,
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino.0, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        entries.extend(self.dir_children(&prefix));

        for (i, (child_ino, kind, name)) in entries.iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            if reply.add(INodeNo(*child_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let files = self.effective_files().len() as u64;
        // Virtual filesystem: no blocks, file count only.
        reply.statfs(0, 0, 0, files, 0, 4096, 255, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_interns_stably() {
        let mut table = InodeTable::new();
        let a = table.intern(InodeKey::File("netrc".to_string()));
        let b = table.intern(InodeKey::File("netrc".to_string()));
        assert_eq!(a, b);
        assert!(a >= INO_DYNAMIC_START);

        let dir = table.intern(InodeKey::Dir("docker/".to_string()));
        assert_ne!(a, dir);
        assert_eq!(table.key(INO_ROOT), Some(InodeKey::Dir(String::new())));
        assert_eq!(table.key(a), Some(InodeKey::File("netrc".to_string())));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dir_children_dedups_prefixes() {
        use slinky_core::cache::SecretCache;
        use slinky_core::cipher::Ephemeral;
        use slinky_core::config::{Config, RenderMode};

        let mut cfg = Config::default();
        for name in ["netrc", "docker/config.json", "docker/daemon.json"] {
            cfg.files.insert(
                name.to_string(),
                Arc::new(FileConfig {
                    render: RenderMode::Command,
                    command: Some("true".to_string()),
                    ..FileConfig::default()
                }),
            );
        }
        let current = CurrentConfig::new(Arc::new(cfg));
        let resolver = Arc::new(SecretResolver::new(
            current.clone(),
            Arc::new(SecretCache::new(Box::new(Ephemeral::new()))),
            None,
        ));
        let fs = SlinkyFs::new(current, resolver, None, tokio::runtime::Handle::current());

        let children = fs.dir_children("");
        let names: Vec<&str> = children.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec!["docker", "netrc"]);
        assert_eq!(children[0].1, FileType::Directory);
        assert_eq!(children[1].1, FileType::RegularFile);

        let nested = fs.dir_children("docker/");
        let names: Vec<&str> = nested.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec!["config.json", "daemon.json"]);

        // Lookup agrees with readdir.
        assert!(fs.lookup_entry("", "docker").is_some());
        assert!(fs.lookup_entry("docker/", "config.json").is_some());
        assert!(fs.lookup_entry("", "ghost").is_none());
    }
}
