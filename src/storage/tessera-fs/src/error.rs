//! Filesystem error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Entry already exists where an exclusive create was requested.
    #[error("entry already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Entry not found.
    #[error("entry not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Any other I/O failure.
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        /// Operation that was attempted.
        op: &'static str,
        /// Path the operation was attempted on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl FsError {
    /// Wraps an I/O error with the attempted operation and path.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path),
            io::ErrorKind::NotFound => FsError::NotFound(path),
            _ => FsError::Io { op, path, source },
        }
    }

    /// Path the failed operation was attempted on.
    pub fn path(&self) -> &std::path::Path {
        match self {
            FsError::AlreadyExists(path) | FsError::NotFound(path) => path,
            FsError::Io { path, .. } => path,
        }
    }
}
