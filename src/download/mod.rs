pub mod backend;
pub mod http;
pub mod monitor;

pub use backend::{TransferBackend, TransferId, TransferRequest, TransferSnapshot, TransferStatus};
pub use http::HttpTransferBackend;
pub use monitor::{
    DownloadEvent, DownloadKey, DownloadMonitor, DownloadRequest, DownloadState, DownloadStatus,
};
