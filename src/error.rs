use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::state::Side;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The caller wired something up wrongly. Raised before any I/O happens.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("replica {side}: {source}")]
    Backend { side: Side, source: BackendError },
    /// The baseline exists but could not be decoded. Never treated as an empty baseline.
    #[error("baseline {path:?} is corrupt: {reason}")]
    DataCorruption { path: PathBuf, reason: String },
    #[error("baseline {0:?} is held by another process")]
    BaselineLocked(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn backend(side: Side, source: BackendError) -> Self {
        SyncError::Backend { side, source }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Unreachable,
    PermissionDenied,
    NotFound,
    Timeout,
    Protocol,
    AuthenticationFailed,
    UnknownHostKey,
    /// A progress callback asked for the transfer to stop.
    Cancelled,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match *self {
            BackendErrorKind::Unreachable => "unreachable",
            BackendErrorKind::PermissionDenied => "permission denied",
            BackendErrorKind::NotFound => "not found",
            BackendErrorKind::Timeout => "timed out",
            BackendErrorKind::Protocol => "protocol error",
            BackendErrorKind::AuthenticationFailed => "authentication failed",
            BackendErrorKind::UnknownHostKey => "unknown host key",
            BackendErrorKind::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new<M: Into<String>>(kind: BackendErrorKind, message: M) -> Self {
        BackendError {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled<M: Into<String>>(message: M) -> Self {
        BackendError::new(BackendErrorKind::Cancelled, message)
    }

    /// Connectivity failures make every following action slow to fail as well,
    /// so they stop the rest of the batch.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Unreachable | BackendErrorKind::Timeout
        )
    }

    pub fn from_io<C: fmt::Display>(err: io::Error, context: C) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => BackendErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => BackendErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => BackendErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::AddrNotAvailable => BackendErrorKind::Unreachable,
            _ => BackendErrorKind::Protocol,
        };
        BackendError::new(kind, format!("{}: {}", context, err))
    }
}
