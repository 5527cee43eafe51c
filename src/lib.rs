// Public library interface for ksu-flasher
//
// The flash pipeline and the download monitor are exposed as a library so
// the command-line front end and the helper binaries share one implementation.

pub mod config;
pub mod download;
pub mod error;
pub mod executor;
pub mod flash;
pub mod logging;
pub mod models;
pub mod utils;

pub use config::FlasherConfig;
pub use error::{DownloadError, FlashError};
pub use models::{FlashJob, FlashResult, FlashingStatus, LkmSelection};
