// SPDX-License-Identifier: MIT OR Apache-2.0
//! The operation book: spawn, track, drain, cancel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::Xxh64;

use crate::{
    DOWNLOAD_TIMEOUT_SECS, IoCompletion, OperationKind, UPLOAD_TIMEOUT_SECS,
    generate_operation_id,
};

/// Registry of in-flight I/O operations keyed by 8-hex-char operation id.
///
/// Operations run as tokio tasks over the process-wide pooled HTTP client
/// and publish [`IoCompletion`] records into an internal queue; the owner
/// drains them with [`IoBook::process_completed_operations`] on its own
/// loop.
pub struct IoBook {
    client: reqwest::Client,
    download_dir: PathBuf,
    pending: HashMap<String, JoinHandle<()>>,
    completed_tx: mpsc::UnboundedSender<IoCompletion>,
    completed_rx: mpsc::UnboundedReceiver<IoCompletion>,
}

impl IoBook {
    /// Book writing downloads under `download_dir`, with a fresh pooled
    /// HTTP client.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self::with_client(reqwest::Client::new(), download_dir)
    }

    /// Book sharing an existing pooled HTTP client.
    pub fn with_client(client: reqwest::Client, download_dir: impl Into<PathBuf>) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            client,
            download_dir: download_dir.into(),
            pending: HashMap::new(),
            completed_tx,
            completed_rx,
        }
    }

    fn track(&mut self, operation_id: String, handle: JoinHandle<()>) -> String {
        self.pending.insert(operation_id.clone(), handle);
        operation_id
    }

    /// Start a download; returns its operation id.
    ///
    /// The body is streamed to `<download_dir>/<filename>` while hashing
    /// incrementally. When `expected_hash` is given, the completion record
    /// carries `hash_valid`; the file is left on disk either way so the
    /// caller decides whether to discard it.
    pub fn download(
        &mut self,
        url: impl Into<String>,
        filename: Option<String>,
        expected_hash: Option<String>,
        metadata: Map<String, Value>,
    ) -> String {
        let operation_id = generate_operation_id();
        let url = url.into();
        let filename = filename.unwrap_or_else(|| {
            url.split('?')
                .next()
                .and_then(|u| u.rsplit('/').next())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("download_{operation_id}"))
        });
        let file_path = self.download_dir.join(&filename);
        let client = self.client.clone();
        let tx = self.completed_tx.clone();
        let op = operation_id.clone();

        let handle = tokio::spawn(async move {
            let record = match run_download(client, &url, &file_path, expected_hash.as_deref()).await
            {
                Ok((size, hash, hash_valid)) => IoCompletion {
                    operation_id: op.clone(),
                    kind: OperationKind::Download,
                    success: true,
                    error: None,
                    file_path: Some(file_path.clone()),
                    url: Some(url.clone()),
                    size,
                    hash: Some(hash),
                    hash_valid,
                    data: None,
                    metadata,
                },
                Err(e) => {
                    warn!(operation = %op, url = %url, error = %e, "download failed");
                    let mut record =
                        IoCompletion::failure(op.clone(), OperationKind::Download, e, metadata);
                    record.url = Some(url.clone());
                    record.hash_valid = expected_hash.is_some().then_some(false);
                    record
                }
            };
            let _ = tx.send(record);
        });
        debug!(operation = %operation_id, "download started");
        self.track(operation_id, handle)
    }

    /// Start an upload; returns its operation id.
    ///
    /// PUTs the file bytes to `upload_url` with the supplied headers and
    /// reports the content hash in the completion record.
    pub fn upload(
        &mut self,
        file_path: impl Into<PathBuf>,
        upload_url: impl Into<String>,
        headers: Vec<(String, String)>,
        metadata: Map<String, Value>,
    ) -> String {
        let operation_id = generate_operation_id();
        let file_path = file_path.into();
        let upload_url = upload_url.into();
        let client = self.client.clone();
        let tx = self.completed_tx.clone();
        let op = operation_id.clone();

        let handle = tokio::spawn(async move {
            let record = match run_upload(client, &file_path, &upload_url, &headers).await {
                Ok((size, hash)) => IoCompletion {
                    operation_id: op.clone(),
                    kind: OperationKind::Upload,
                    success: true,
                    error: None,
                    file_path: Some(file_path.clone()),
                    url: Some(upload_url.clone()),
                    size,
                    hash: Some(hash),
                    hash_valid: None,
                    data: None,
                    metadata,
                },
                Err(e) => {
                    warn!(operation = %op, url = %upload_url, error = %e, "upload failed");
                    let mut record =
                        IoCompletion::failure(op.clone(), OperationKind::Upload, e, metadata);
                    record.file_path = Some(file_path.clone());
                    record.url = Some(upload_url.clone());
                    record
                }
            };
            let _ = tx.send(record);
        });
        debug!(operation = %operation_id, "upload started");
        self.track(operation_id, handle)
    }

    /// Read a stored file; the completion record carries its bytes.
    pub fn load_file(&mut self, path: impl Into<PathBuf>, metadata: Map<String, Value>) -> String {
        let operation_id = generate_operation_id();
        let path = path.into();
        let tx = self.completed_tx.clone();
        let op = operation_id.clone();

        let handle = tokio::spawn(async move {
            let record = match tokio::fs::read(&path).await {
                Ok(bytes) => IoCompletion {
                    operation_id: op.clone(),
                    kind: OperationKind::StorageLoad,
                    success: true,
                    error: None,
                    file_path: Some(path.clone()),
                    url: None,
                    size: bytes.len() as u64,
                    hash: Some(hash_hex(&bytes)),
                    hash_valid: None,
                    data: Some(bytes),
                    metadata,
                },
                Err(e) => {
                    let mut record = IoCompletion::failure(
                        op.clone(),
                        OperationKind::StorageLoad,
                        e.to_string(),
                        metadata,
                    );
                    record.file_path = Some(path.clone());
                    record
                }
            };
            let _ = tx.send(record);
        });
        self.track(operation_id, handle)
    }

    /// Write bytes into managed storage through a temp-and-rename.
    pub fn save_file(
        &mut self,
        path: impl Into<PathBuf>,
        bytes: Vec<u8>,
        metadata: Map<String, Value>,
    ) -> String {
        let operation_id = generate_operation_id();
        let path = path.into();
        let tx = self.completed_tx.clone();
        let op = operation_id.clone();

        let handle = tokio::spawn(async move {
            let record = match write_atomic(&path, &bytes).await {
                Ok(()) => IoCompletion {
                    operation_id: op.clone(),
                    kind: OperationKind::StorageSave,
                    success: true,
                    error: None,
                    file_path: Some(path.clone()),
                    url: None,
                    size: bytes.len() as u64,
                    hash: Some(hash_hex(&bytes)),
                    hash_valid: None,
                    data: None,
                    metadata,
                },
                Err(e) => {
                    let mut record = IoCompletion::failure(
                        op.clone(),
                        OperationKind::StorageSave,
                        e.to_string(),
                        metadata,
                    );
                    record.file_path = Some(path.clone());
                    record
                }
            };
            let _ = tx.send(record);
        });
        self.track(operation_id, handle)
    }

    /// Copy an external file into managed storage.
    pub fn import_external(
        &mut self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        metadata: Map<String, Value>,
    ) -> String {
        let operation_id = generate_operation_id();
        let source = source.into();
        let target = target.into();
        let tx = self.completed_tx.clone();
        let op = operation_id.clone();

        let handle = tokio::spawn(async move {
            let result = async {
                let bytes = tokio::fs::read(&source).await?;
                write_atomic(&target, &bytes).await?;
                Ok::<_, std::io::Error>(bytes)
            }
            .await;
            let record = match result {
                Ok(bytes) => IoCompletion {
                    operation_id: op.clone(),
                    kind: OperationKind::ExternalImport,
                    success: true,
                    error: None,
                    file_path: Some(target.clone()),
                    url: None,
                    size: bytes.len() as u64,
                    hash: Some(hash_hex(&bytes)),
                    hash_valid: None,
                    data: None,
                    metadata,
                },
                Err(e) => {
                    let mut record = IoCompletion::failure(
                        op.clone(),
                        OperationKind::ExternalImport,
                        e.to_string(),
                        metadata,
                    );
                    record.file_path = Some(target.clone());
                    record
                }
            };
            let _ = tx.send(record);
        });
        self.track(operation_id, handle)
    }

    /// Drain every completion that arrived since the last call.
    ///
    /// Call this from the owning loop; finished operations leave the
    /// pending registry here.
    pub fn process_completed_operations(&mut self) -> Vec<IoCompletion> {
        let mut completed = Vec::new();
        while let Ok(record) = self.completed_rx.try_recv() {
            self.pending.remove(&record.operation_id);
            completed.push(record);
        }
        completed
    }

    /// Whether any operation is still pending.
    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of pending operations.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Abort every outstanding operation (best effort for in-flight HTTP).
    pub fn cancel_all(&mut self) {
        for (operation_id, handle) in self.pending.drain() {
            debug!(operation = %operation_id, "cancelling");
            handle.abort();
        }
    }

    /// Wait for every pending operation, then return the final drained
    /// completions. Each task gets a 10 s grace period before being
    /// abandoned.
    pub async fn close(mut self) -> Vec<IoCompletion> {
        for (operation_id, handle) in self.pending.drain() {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(_) => {}
                Err(_) => warn!(operation = %operation_id, "operation did not finish before close"),
            }
        }
        let mut leftover = Vec::new();
        while let Ok(record) = self.completed_rx.try_recv() {
            leftover.push(record);
        }
        info!(drained = leftover.len(), "io book closed");
        leftover
    }
}

impl std::fmt::Debug for IoBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBook")
            .field("pending", &self.pending.len())
            .field("download_dir", &self.download_dir)
            .finish()
    }
}

pub(crate) fn hash_hex(bytes: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh64::xxh64(bytes, 0))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn run_download(
    client: reqwest::Client,
    url: &str,
    file_path: &Path,
    expected_hash: Option<&str>,
) -> Result<(u64, String, Option<bool>), String> {
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| e.to_string())?;
    }
    let response = client
        .get(url)
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;

    let mut file = tokio::fs::File::create(file_path)
        .await
        .map_err(|e| e.to_string())?;
    let mut hasher = Xxh64::new(0);
    let mut size: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(|e| e.to_string())?;
    }
    file.flush().await.map_err(|e| e.to_string())?;

    let hash = format!("{:016x}", hasher.digest());
    let hash_valid = expected_hash.map(|expected| expected.eq_ignore_ascii_case(&hash));
    if hash_valid == Some(false) {
        warn!(%url, expected = ?expected_hash, got = %hash, "download hash mismatch");
    }
    Ok((size, hash, hash_valid))
}

async fn run_upload(
    client: reqwest::Client,
    file_path: &Path,
    upload_url: &str,
    headers: &[(String, String)],
) -> Result<(u64, String), String> {
    let bytes = tokio::fs::read(file_path).await.map_err(|e| e.to_string())?;
    let size = bytes.len() as u64;
    let hash = hash_hex(&bytes);

    let mut request = client
        .put(upload_url)
        .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
        .body(bytes);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    request
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;
    Ok((size, hash))
}
