//! # Tessera FS
//!
//! Filesystem helpers used by the center store.
//!
//! Every failure is reported as an [`FsError`] carrying the path that was
//! being touched, so callers never see a bare `std::io::Error`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

pub use error::FsError;

/// Creates a directory and all of its missing parents.
pub async fn create_dir_all(path: impl AsRef<Path>) -> Result<(), FsError> {
    let path = path.as_ref();
    fs::create_dir_all(path)
        .await
        .map_err(|e| FsError::io("create directory", path, e))
}

/// Creates a directory with the given unix mode. The parent must exist.
///
/// On non-unix targets the mode is ignored.
pub async fn create_dir_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<(), FsError> {
    let path = path.as_ref();
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder
        .create(path)
        .await
        .map_err(|e| FsError::io("create directory", path, e))
}

/// Returns true if a regular file exists at `path`.
pub async fn file_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path.as_ref())
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Returns true if a directory exists at `path`.
pub async fn dir_exists(path: impl AsRef<Path>) -> bool {
    fs::metadata(path.as_ref())
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Reads a UTF-8 text file.
pub async fn read_text(path: impl AsRef<Path>) -> Result<String, FsError> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .await
        .map_err(|e| FsError::io("read", path, e))
}

/// A file to be created by [`write_new_all`].
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Destination; must not exist yet.
    pub path: PathBuf,
    /// File content.
    pub content: String,
    /// Unix permission bits. Without a mode the file is owner-only.
    pub mode: Option<u32>,
}

impl NewFile {
    /// Describes a new file at `path`.
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>, mode: Option<u32>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode,
        }
    }
}

/// Writes a text file that must not exist yet.
///
/// See [`write_new_all`].
pub async fn write_new(
    path: impl AsRef<Path>,
    content: &str,
    mode: Option<u32>,
) -> Result<(), FsError> {
    write_new_all(vec![NewFile::new(path.as_ref(), content, mode)]).await
}

/// Writes several files that must not exist yet, in order.
///
/// Each file is written and synced under a temporary name in its target
/// directory, then linked into place without replacing anything, so an
/// existing entry yields [`FsError::AlreadyExists`] and is left untouched.
/// A file is never visible at its final path with partial content.
///
/// If any file fails, the files already placed by this call are removed.
/// The work runs on the blocking pool and completes even if the returned
/// future is dropped.
pub async fn write_new_all(files: Vec<NewFile>) -> Result<(), FsError> {
    let Some(first) = files.first().map(|f| f.path.clone()) else {
        return Ok(());
    };

    tokio::task::spawn_blocking(move || place_all(&files))
        .await
        .map_err(|e| FsError::io("write", first, io::Error::other(e)))?
}

fn place_all(files: &[NewFile]) -> Result<(), FsError> {
    let mut placed: Vec<&Path> = Vec::with_capacity(files.len());
    for file in files {
        if let Err(e) = place(file) {
            for path in placed {
                if let Err(cleanup) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %cleanup, "Failed to roll back file");
                }
            }
            return Err(e);
        }
        placed.push(&file.path);
    }
    Ok(())
}

fn place(file: &NewFile) -> Result<(), FsError> {
    let dir = match file.path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| FsError::io("create", dir, e))?;

    tmp.write_all(file.content.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| FsError::io("write", tmp.path(), e))?;

    #[cfg(unix)]
    {
        if let Some(mode) = file.mode {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(mode))
                .map_err(|e| FsError::io("set permissions on", tmp.path(), e))?;
        }
    }

    tmp.persist_noclobber(&file.path)
        .map_err(|e| FsError::io("create", &file.path, e.error))?;

    debug!(path = %file.path.display(), "File written");
    Ok(())
}

/// Removes a file, treating a missing file as success.
pub async fn remove_file_if_exists(path: impl AsRef<Path>) -> Result<(), FsError> {
    let path = path.as_ref();
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::io("remove", path, e)),
    }
}

/// Renames `from` to `to`.
pub async fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), FsError> {
    let (from, to) = (from.as_ref(), to.as_ref());
    fs::rename(from, to)
        .await
        .map_err(|e| FsError::io("rename", to, e))
}
