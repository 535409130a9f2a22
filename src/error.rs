use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::rpc::RpcError;

/// Errors surfaced by the file-access layer.
///
/// Results of single-flight operations are handed to every waiting caller,
/// so the error is cheaply cloneable.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Local file I/O failed.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// A daemon call failed.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// The daemon runs an engine or plugin set this layer cannot work with.
    #[error("unsupported daemon: {0}")]
    Unsupported(String),

    /// A piece or cache flush did not become ready in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The daemon does not know the torrent and it could not be re-added.
    #[error("torrent not found: {0}")]
    TorrentNotFound(String),

    /// Re-adding a torrent produced a different identity.
    #[error("torrent hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid file index: {0}")]
    InvalidFileIndex(usize),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("read-only file system")]
    ReadOnly,

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    /// The daemon returned a status record that cannot be interpreted.
    #[error("invalid torrent status: {0}")]
    InvalidStatus(String),

    /// The operation was cancelled by its owner.
    #[error("operation cancelled")]
    Cancelled,

    /// A background task panicked.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(inner) => inner.kind(),
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
            Error::Timeout(_) => io::ErrorKind::TimedOut,
            Error::TorrentNotFound(_) => io::ErrorKind::NotFound,
            Error::InvalidFileIndex(_)
            | Error::InvalidPieceIndex(_)
            | Error::BadHandle(_)
            | Error::PathTraversal(_) => io::ErrorKind::InvalidInput,
            Error::ReadOnly => io::ErrorKind::ReadOnlyFilesystem,
            Error::Cancelled => io::ErrorKind::Interrupted,
            Error::Rpc(_)
            | Error::HashMismatch { .. }
            | Error::InvalidStatus(_)
            | Error::Task(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
