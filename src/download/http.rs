use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{TransferBackend, TransferId, TransferRequest, TransferSnapshot, TransferStatus};
use crate::error::DownloadError;
use crate::utils::checksum::{StreamingHasher, check_digest};

struct Transfer {
    snapshot: TransferSnapshot,
    partial: PathBuf,
    task: Option<JoinHandle<()>>,
}

type TransferTable = Arc<Mutex<HashMap<TransferId, Transfer>>>;

fn lock(table: &TransferTable) -> MutexGuard<'_, HashMap<TransferId, Transfer>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Streams downloads over HTTP(S) into `<destination>.download`, renaming
/// the file into place once it is complete and verified
pub struct HttpTransferBackend {
    client: reqwest::Client,
    transfers: TransferTable,
    completions: broadcast::Sender<TransferId>,
}

impl HttpTransferBackend {
    pub fn new(user_agent: &str) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::StartFailure(format!("Failed to build HTTP client: {}", e)))?;
        let (completions, _) = broadcast::channel(64);
        Ok(Self {
            client,
            transfers: Arc::new(Mutex::new(HashMap::new())),
            completions,
        })
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".download");
    PathBuf::from(name)
}

fn update(table: &TransferTable, id: TransferId, change: impl FnOnce(&mut TransferSnapshot)) {
    if let Some(transfer) = lock(table).get_mut(&id) {
        change(&mut transfer.snapshot);
    }
}

async fn fetch(
    client: reqwest::Client,
    table: TransferTable,
    id: TransferId,
    request: TransferRequest,
    partial: PathBuf,
) -> Result<PathBuf, DownloadError> {
    if let Some(parent) = request.destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = client.get(&request.url).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::Http(format!(
            "Failed to download file, status: {}",
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    update(&table, id, |s| {
        s.status = TransferStatus::Running;
        s.bytes_total = total_size;
    });

    let mut output_file = tokio::fs::File::create(&partial).await?;
    let mut hasher = request.sha256.as_ref().map(|_| StreamingHasher::new());
    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(item) = stream.next().await {
        let chunk = item?;
        output_file.write_all(&chunk).await?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }
        downloaded += chunk.len() as u64;
        update(&table, id, |s| s.bytes_downloaded = downloaded);
    }

    output_file.flush().await?;
    drop(output_file);

    if let (Some(hasher), Some(expected)) = (hasher, request.sha256.as_deref()) {
        check_digest(&hasher.finalize_hex(), expected)?;
    }

    tokio::fs::rename(&partial, &request.destination).await?;
    Ok(request.destination)
}

impl TransferBackend for HttpTransferBackend {
    fn enqueue(&self, request: &TransferRequest) -> Result<TransferId, DownloadError> {
        reqwest::Url::parse(&request.url)
            .map_err(|e| DownloadError::StartFailure(format!("Invalid URL {}: {}", request.url, e)))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DownloadError::StartFailure(format!("No async runtime: {}", e)))?;

        let id = TransferId::new();
        let partial = partial_path(&request.destination);
        lock(&self.transfers).insert(
            id,
            Transfer {
                snapshot: TransferSnapshot {
                    status: TransferStatus::Pending,
                    bytes_total: 0,
                    bytes_downloaded: 0,
                },
                partial: partial.clone(),
                task: None,
            },
        );

        info!("Downloading {} ({}) to {:?}", request.url, request.description, request.destination);

        let client = self.client.clone();
        let table = self.transfers.clone();
        let completions = self.completions.clone();
        let request = request.clone();
        let task = runtime.spawn(async move {
            let result = fetch(client, table.clone(), id, request, partial.clone()).await;
            let status = match result {
                Ok(path) => {
                    info!("Download {} finished: {:?}", id, path);
                    TransferStatus::Succeeded(path)
                }
                Err(e) => {
                    error!("Download {} failed: {}", id, e);
                    if let Err(e) = tokio::fs::remove_file(&partial).await {
                        debug!("No partial file to clean up at {:?}: {}", partial, e);
                    }
                    TransferStatus::Failed(e.to_string())
                }
            };
            update(&table, id, |s| s.status = status);
            let _ = completions.send(id);
        });

        if let Some(transfer) = lock(&self.transfers).get_mut(&id) {
            transfer.task = Some(task);
        }
        Ok(id)
    }

    fn query(&self, id: TransferId) -> Option<TransferSnapshot> {
        lock(&self.transfers).get(&id).map(|t| t.snapshot.clone())
    }

    fn remove(&self, id: TransferId) {
        let Some(transfer) = lock(&self.transfers).remove(&id) else {
            return;
        };
        if let Some(task) = transfer.task {
            task.abort();
        }
        if !transfer.snapshot.status.is_terminal() {
            if let Err(e) = std::fs::remove_file(&transfer.partial) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial download {:?}: {}", transfer.partial, e);
                }
            }
        }
        debug!("Removed transfer {}", id);
    }

    fn subscribe_completions(&self) -> broadcast::Receiver<TransferId> {
        self.completions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, destination: PathBuf) -> TransferRequest {
        TransferRequest {
            url: url.to_string(),
            destination,
            description: "test".to_string(),
            sha256: None,
        }
    }

    #[test]
    fn partial_file_sits_next_to_destination() {
        assert_eq!(
            partial_path(Path::new("/sdcard/Download/ksu.zip")),
            PathBuf::from("/sdcard/Download/ksu.zip.download")
        );
    }

    #[tokio::test]
    async fn malformed_url_fails_to_start() {
        let backend = HttpTransferBackend::new("ksu-flasher-test").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = backend.enqueue(&request("not a url", dir.path().join("x.zip")));
        assert!(matches!(result, Err(DownloadError::StartFailure(_))));
    }

    #[test]
    fn enqueue_outside_runtime_fails_to_start() {
        let backend = HttpTransferBackend::new("ksu-flasher-test").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = backend.enqueue(&request("http://127.0.0.1:9/x.zip", dir.path().join("x.zip")));
        assert!(matches!(result, Err(DownloadError::StartFailure(_))));
    }

    #[tokio::test]
    async fn unreachable_host_ends_failed_and_announced() {
        let backend = HttpTransferBackend::new("ksu-flasher-test").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut completions = backend.subscribe_completions();

        // Port 9 (discard) on loopback is not expected to accept connections
        let id = backend
            .enqueue(&request("http://127.0.0.1:9/x.zip", dir.path().join("x.zip")))
            .unwrap();

        assert_eq!(completions.recv().await.unwrap(), id);
        let snapshot = backend.query(id).unwrap();
        assert!(matches!(snapshot.status, TransferStatus::Failed(_)));
        assert!(!dir.path().join("x.zip").exists());

        backend.remove(id);
        assert!(backend.query(id).is_none());
    }
}
