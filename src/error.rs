use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = FerryError> = std::result::Result<T, E>;

/// Operational failures raised by pipeline stages.
///
/// Every stage returns one of these instead of panicking, so the orchestrator
/// always gets the chance to clean up.
#[derive(Debug, Error)]
pub enum FerryError {
    #[error("invalid remote path '{0}': refusing to install onto the filesystem root or an empty path")]
    InvalidRemotePath(String),

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("archive error: {0}")]
    ArchiveFormat(String),

    #[error("authentication failed for {username}@{host}: {reason}")]
    AuthenticationFailure {
        host: String,
        username: String,
        reason: String,
    },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    NetworkTimeout { operation: String, after: Duration },

    #[error("upload failed after {attempts} attempt(s): {last_error}")]
    UploadExhausted { attempts: u32, last_error: String },

    #[error("checksum mismatch: local {local}, remote {remote}")]
    ChecksumMismatch { local: String, remote: String },

    #[error("remote command `{command}` exited with {exit_code}: {stderr}")]
    RemoteCommandFailure {
        command: String,
        exit_code: u32,
        stderr: String,
    },

    /// Only ever reported as a warning next to an install failure.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    #[error("invalid private key {}: {reason}", .path.display())]
    InvalidKey { path: PathBuf, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for FerryError {
    fn from(e: russh::Error) -> Self {
        FerryError::Transport(e.to_string())
    }
}

impl From<zip::result::ZipError> for FerryError {
    fn from(e: zip::result::ZipError) -> Self {
        FerryError::ArchiveFormat(e.to_string())
    }
}

impl From<walkdir::Error> for FerryError {
    fn from(e: walkdir::Error) -> Self {
        FerryError::ArchiveFormat(e.to_string())
    }
}

impl From<tokio::task::JoinError> for FerryError {
    fn from(e: tokio::task::JoinError) -> Self {
        FerryError::Io(std::io::Error::other(e))
    }
}
