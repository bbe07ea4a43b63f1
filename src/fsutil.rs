//! Filesystem helpers shared by drivers and the backup orchestrator
//!
//! Everything here is blocking; async callers go through
//! `tokio::task::spawn_blocking`.

use crate::error::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Lexically normalize a path: drop `.` components, resolve `..` against
/// preceding components and strip trailing separators. Does not touch the
/// filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Make a path absolute against the current directory, then clean it
pub fn absolute_clean(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty path",
        )));
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(clean_path(&absolute))
}

/// Whether `rel` (relative to a volume root) falls under one of `excludes`
pub fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    excludes
        .iter()
        .map(|e| clean_path(Path::new(e)))
        .any(|e| rel.starts_with(&e))
}

/// Recursively copy the contents of `src` into `dst`, overwriting files that
/// already exist. Symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dst: &Path, excludes: &[String]) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0u64;

    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(src)
                .map(|rel| !is_excluded(rel, excludes))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            remove_if_present(&target)?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copied += fs::copy(entry.path(), &target)?;
        }
    }

    Ok(copied)
}

/// Total size of regular files under `root`, leaving out `excludes`
pub fn dir_size(root: &Path, excludes: &[String]) -> Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| rel.as_os_str().is_empty() || !is_excluded(rel, excludes))
                .unwrap_or(true)
        });
    for entry in walker {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(walk_error)?.len();
        }
    }
    Ok(total)
}

/// Remove a file, symlink or directory tree; absent paths are fine
pub fn remove_if_present(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Capacity figures of the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Free bytes available to unprivileged users
    pub available_bytes: u64,
    pub block_size: u64,
}

impl FsUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Query filesystem capacity for `path` via `statvfs`
pub fn fs_usage(path: &Path) -> io::Result<FsUsage> {
    let stat = rustix::fs::statvfs(path).map_err(io::Error::from)?;
    let fragment = if stat.f_frsize > 0 {
        stat.f_frsize
    } else {
        stat.f_bsize
    };
    Ok(FsUsage {
        total_bytes: stat.f_blocks.saturating_mul(fragment),
        free_bytes: stat.f_bfree.saturating_mul(fragment),
        available_bytes: stat.f_bavail.saturating_mul(fragment),
        block_size: stat.f_bsize,
    })
}

/// Closest existing ancestor of `path` (the path itself if it exists)
pub fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// Run blocking filesystem work off the async executor
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

/// Write `data` to a temporary file next to `path` and rename it into place
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut file = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

pub(crate) fn walk_error(err: walkdir::Error) -> Error {
    match err.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::Internal("filesystem loop while walking directory".into()),
    }
}
