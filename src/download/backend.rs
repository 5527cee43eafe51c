use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fetch handed to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    pub description: String,
    /// Expected SHA-256 of the payload, hex encoded
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Pending,
    Running,
    Succeeded(PathBuf),
    Failed(String),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Succeeded(_) | TransferStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub status: TransferStatus,
    /// Zero while the size is unknown
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
}

/// Something that moves bytes from a URL to a local file in the background.
///
/// Backends publish the id of every transfer reaching a terminal state on
/// the completion channel; `query` must already report that state by then.
pub trait TransferBackend: Send + Sync {
    fn enqueue(&self, request: &TransferRequest) -> Result<TransferId, DownloadError>;

    /// `None` once the transfer is unknown, e.g. after `remove`
    fn query(&self, id: TransferId) -> Option<TransferSnapshot>;

    /// Cancel the transfer if it is still running and forget it
    fn remove(&self, id: TransferId);

    fn subscribe_completions(&self) -> broadcast::Receiver<TransferId>;
}
