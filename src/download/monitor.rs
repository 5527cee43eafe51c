// Resilient fetching on top of a transfer backend
//
// Every request gets exactly one terminal event: Downloaded, Downloading (for
// a request that attached to a transfer already in flight) or Error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::backend::{TransferBackend, TransferId, TransferRequest, TransferStatus};
use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// Identity used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DownloadKey {
    pub url: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
    pub description: String,
    pub sha256: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            url: url.into(),
            description: file_name.clone(),
            file_name,
            sha256: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn key(&self) -> DownloadKey {
        DownloadKey {
            url: self.url.clone(),
            file_name: self.file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Downloaded { key: DownloadKey, path: PathBuf },
    Downloading { key: DownloadKey },
    Error { key: DownloadKey, error: DownloadError },
}

impl DownloadEvent {
    pub fn key(&self) -> &DownloadKey {
        match self {
            DownloadEvent::Downloaded { key, .. }
            | DownloadEvent::Downloading { key }
            | DownloadEvent::Error { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DownloadStatus {
    Pending,
    Running,
    Succeeded(PathBuf),
}

/// Progress of one tracked download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadState {
    pub status: DownloadStatus,
    pub bytes_total: u64,
    pub bytes_downloaded: u64,
    pub retry_count: u32,
    /// Consecutive polls without progress
    pub stall_samples: u32,
}

impl DownloadState {
    fn new() -> Self {
        Self {
            status: DownloadStatus::Pending,
            bytes_total: 0,
            bytes_downloaded: 0,
            retry_count: 0,
            stall_samples: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, DownloadStatus::Pending | DownloadStatus::Running)
    }

    /// Whole percent, only known once the total size is
    pub fn progress(&self) -> Option<u64> {
        (self.bytes_total > 0).then(|| self.bytes_downloaded * 100 / self.bytes_total)
    }
}

enum Attempt {
    Finished(PathBuf),
    Failed(DownloadError),
    Stalled(DownloadError),
}

struct Inner {
    backend: Arc<dyn TransferBackend>,
    config: DownloadConfig,
    download_dir: PathBuf,
    table: Mutex<HashMap<DownloadKey, DownloadState>>,
    events: mpsc::UnboundedSender<DownloadEvent>,
}

/// Deduplicating download front end with stall detection and bounded retries
#[derive(Clone)]
pub struct DownloadMonitor {
    inner: Arc<Inner>,
}

impl DownloadMonitor {
    /// Events for every request are delivered on the returned receiver
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        config: DownloadConfig,
        download_dir: impl Into<PathBuf>,
    ) -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(Inner {
                backend,
                config,
                download_dir: download_dir.into(),
                table: Mutex::new(HashMap::new()),
                events,
            }),
        };
        (monitor, rx)
    }

    pub fn destination(&self, file_name: &str) -> PathBuf {
        self.inner.download_dir.join(file_name)
    }

    pub fn state(&self, key: &DownloadKey) -> Option<DownloadState> {
        self.inner.table().get(key).cloned()
    }

    /// Start fetching `request`, or attach to a transfer already tracked for
    /// the same URL and file name. Must be called within a tokio runtime.
    ///
    /// Finished entries stay in the table so a repeated request is answered
    /// from disk. Entries whose file has since disappeared are evicted here.
    pub fn download(&self, request: DownloadRequest) {
        let key = request.key();
        {
            let mut table = self.inner.table();
            table.retain(|_, state| match &state.status {
                DownloadStatus::Succeeded(path) => path.exists(),
                _ => true,
            });
            if let Some(state) = table.get(&key) {
                match &state.status {
                    DownloadStatus::Pending | DownloadStatus::Running => {
                        debug!("{} is already downloading", request.file_name);
                        self.inner.emit(DownloadEvent::Downloading { key });
                        return;
                    }
                    DownloadStatus::Succeeded(path) if path.exists() => {
                        debug!("{} was already downloaded to {:?}", request.file_name, path);
                        let path = path.clone();
                        self.inner.emit(DownloadEvent::Downloaded { key, path });
                        return;
                    }
                    DownloadStatus::Succeeded(_) => {}
                }
            }
            table.insert(key.clone(), DownloadState::new());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.supervise(key, request).await;
        });
    }
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<DownloadKey, DownloadState>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DownloadEvent) {
        if self.events.send(event).is_err() {
            debug!("Download event dropped, nobody is listening");
        }
    }

    fn modify(&self, key: &DownloadKey, change: impl FnOnce(&mut DownloadState)) {
        if let Some(state) = self.table().get_mut(key) {
            change(state);
        }
    }

    fn fail(&self, key: DownloadKey, error: DownloadError) {
        error!("Download of {} failed: {}", key.file_name, error);
        self.table().remove(&key);
        self.emit(DownloadEvent::Error { key, error });
    }

    /// Run attempts until one succeeds or the retry budget is spent
    async fn supervise(&self, key: DownloadKey, request: DownloadRequest) {
        let transfer = TransferRequest {
            url: request.url.clone(),
            destination: self.download_dir.join(&request.file_name),
            description: request.description.clone(),
            sha256: request.sha256.clone(),
        };

        let mut retry_count = 0u32;
        loop {
            remove_stale(&transfer.destination).await;

            // Subscribe first so a completion racing the enqueue is not missed
            let completions = self.backend.subscribe_completions();
            let id = match self.backend.enqueue(&transfer) {
                Ok(id) => id,
                Err(e) => {
                    let error = match e {
                        DownloadError::StartFailure(_) => e,
                        other => DownloadError::StartFailure(other.to_string()),
                    };
                    self.fail(key, error);
                    return;
                }
            };

            let can_restart = retry_count < self.config.max_retry_count;
            let attempt = tokio::select! {
                attempt = self.poll(&key, id, can_restart) => attempt,
                attempt = self.await_completion(id, completions) => attempt,
            };

            match attempt {
                Attempt::Finished(path) => {
                    info!("Downloaded {} to {:?}", key.file_name, path);
                    self.modify(&key, |s| s.status = DownloadStatus::Succeeded(path.clone()));
                    self.emit(DownloadEvent::Downloaded { key, path });
                    return;
                }
                Attempt::Failed(e) => {
                    self.backend.remove(id);
                    if !can_restart {
                        warn!("Giving up on {} after {} retries: {}", key.file_name, retry_count, e);
                        self.fail(key, DownloadError::RetriesExhausted);
                        return;
                    }
                    retry_count += 1;
                    info!(
                        "Download of {} failed ({}), retry {}/{}",
                        key.file_name, e, retry_count, self.config.max_retry_count
                    );
                    self.restart(&key, retry_count);
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Attempt::Stalled(e) => {
                    self.backend.remove(id);
                    retry_count += 1;
                    warn!("{}, restarting {}", e, key.file_name);
                    self.restart(&key, retry_count);
                }
            }
        }
    }

    fn restart(&self, key: &DownloadKey, retry_count: u32) {
        self.modify(key, |s| {
            *s = DownloadState {
                retry_count,
                ..DownloadState::new()
            }
        });
    }

    /// Sample the transfer every poll interval until it ends or stalls.
    ///
    /// Only whole-percent progress counts as movement. A stall is reported
    /// only while a restart is still allowed; otherwise polling carries on.
    async fn poll(&self, key: &DownloadKey, id: TransferId, can_restart: bool) -> Attempt {
        let mut last_progress: Option<u64> = None;
        let mut stall_samples = 0u32;

        loop {
            let Some(snapshot) = self.backend.query(id) else {
                return Attempt::Failed(DownloadError::Transient(format!("transfer {} vanished", id)));
            };
            let running = snapshot.status == TransferStatus::Running;

            match snapshot.status {
                TransferStatus::Succeeded(path) => return Attempt::Finished(path),
                TransferStatus::Failed(reason) => {
                    return Attempt::Failed(DownloadError::Transient(reason));
                }
                TransferStatus::Pending | TransferStatus::Running => {
                    if snapshot.bytes_total > 0 {
                        let progress = snapshot.bytes_downloaded * 100 / snapshot.bytes_total;
                        if last_progress == Some(progress) {
                            stall_samples += 1;
                            if stall_samples > self.config.stall_threshold && can_restart {
                                return Attempt::Stalled(DownloadError::Stall { progress });
                            }
                        } else {
                            debug!(
                                "Download progress: {}% ({}/{})",
                                progress, snapshot.bytes_downloaded, snapshot.bytes_total
                            );
                            last_progress = Some(progress);
                            stall_samples = 0;
                        }
                    }
                    self.modify(key, |s| {
                        if running {
                            s.status = DownloadStatus::Running;
                        }
                        s.bytes_total = snapshot.bytes_total;
                        s.bytes_downloaded = snapshot.bytes_downloaded;
                        s.stall_samples = stall_samples;
                    });
                }
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Wait for the backend to announce that `id` ended
    async fn await_completion(
        &self,
        id: TransferId,
        mut completions: broadcast::Receiver<TransferId>,
    ) -> Attempt {
        loop {
            match completions.recv().await {
                Ok(done) if done == id => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Missed {} completion notices, relying on polling", skipped);
                }
                // Polling still covers this transfer
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }

        match self.backend.query(id).map(|s| s.status) {
            Some(TransferStatus::Succeeded(path)) => Attempt::Finished(path),
            Some(TransferStatus::Failed(reason)) => Attempt::Failed(DownloadError::Transient(reason)),
            other => Attempt::Failed(DownloadError::Transient(format!(
                "transfer {} announced completion in state {:?}",
                id, other
            ))),
        }
    }
}

async fn remove_stale(destination: &std::path::Path) {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => debug!("Removed stale {:?}", destination),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove stale {:?}: {}", destination, e),
    }
}
