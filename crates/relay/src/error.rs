//! Error types for the relay core.

use std::path::PathBuf;

/// Errors produced by upload tasks and the registry.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("declared upload size is zero")]
    EmptyUpload,

    #[error("cannot create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot open temporary file {}: {source}", .path.display())]
    OpenTemp {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("upload not started")]
    NotStarted,

    #[error("upload stopped")]
    Stopped,

    #[error("received {received} bytes, declared {declared}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("chunk overruns declared size: {received} > {declared}")]
    Overflow { declared: u64, received: u64 },

    #[error("upload already in progress: {}", .0.display())]
    Conflict(PathBuf),
}
