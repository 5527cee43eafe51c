use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures that prevent a flash job from producing a real exit code
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Failed to stage {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Executor I/O error: {0}")]
    ExecutorIo(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Download startup failure: {0}")]
    StartFailure(String),
    #[error("Download failed: {0}")]
    Transient(String),
    #[error("Download stalled at {progress}%")]
    Stall { progress: u64 },
    #[error("Download failed, please check network connection or storage space")]
    RetriesExhausted,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Hash verification failed. Expected: {expected}, got: {actual}")]
    Checksum { expected: String, actual: String },
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        DownloadError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Http(e.to_string())
    }
}
