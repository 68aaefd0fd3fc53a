//! Shared filesystem utilities.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Remove empty subdirectories under `root`, bottom-up.  The root directory
/// itself is not removed.
pub fn clean_empty_dirs(root: &Path) {
    let mut dirs = Vec::new();
    collect_dirs(root, &mut dirs);
    dirs.reverse();
    for dir in dirs {
        // Only succeeds if empty.
        let _ = fs::remove_dir(&dir);
    }
}

fn collect_dirs(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push(path.clone());
            collect_dirs(&path, out);
        }
    }
}

/// Overwrite the file at `path` with zeros, fsync, and remove it.
///
/// A missing file is not an error.  Used by the RAM-disk backend on file
/// departure and teardown so plaintext cannot be recovered from the backing
/// store.
pub fn scrub_file(path: &Path) -> io::Result<()> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut f = fs::OpenOptions::new().write(true).open(path)?;
    zero_fill(&mut f, meta.len())?;
    f.sync_all()?;
    drop(f);

    fs::remove_file(path)
}

/// Write `len` zero bytes to `w` in fixed 32 KiB chunks (bounded memory for
/// arbitrarily large files).
fn zero_fill<W: Write>(w: &mut W, len: u64) -> io::Result<()> {
    let buf = [0u8; 32 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(buf.len() as u64) as usize;
        w.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fill_writes_exact_length() {
        let mut out = Vec::new();
        zero_fill(&mut out, 100_000).unwrap();
        assert_eq!(out.len(), 100_000);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn scrub_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, b"machine github.com password hunter2").unwrap();

        scrub_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn scrub_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scrub_file(&dir.path().join("nope")).is_ok());
    }

    #[test]
    fn clean_empty_dirs_removes_nested() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("keep")).unwrap();
        fs::write(root.join("keep/file"), b"x").unwrap();

        clean_empty_dirs(root);

        assert!(!root.join("a").exists());
        assert!(root.join("keep/file").exists());
        assert!(root.exists());
    }
}
