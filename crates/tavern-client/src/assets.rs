// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client-side upload/download coordination.
//!
//! State machine per asset: hash locally, ask the server for a presigned
//! URL, move the bytes through the [`IoBook`], confirm the outcome, and
//! register verified bytes in the [`AssetCache`]. Pending operations live
//! in the book's metadata; the main loop drains completions through
//! [`AssetCoordinator::handle_completion`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tavern_assets::{AssetCache, AssetError, asset_id_from_hash, xxh64_hex_file};
use tavern_io::{IoBook, IoCompletion, OperationKind};
use tavern_protocol::MessageType;
use tracing::{debug, info, warn};

use crate::session::{ClientSession, Notice};

#[derive(Debug, Clone)]
struct PendingUpload {
    file_path: PathBuf,
    filename: String,
    xxhash: String,
}

/// Coordinates presigned asset transfers between the server, the blob
/// store, the io book, and the local cache.
pub struct AssetCoordinator {
    cache: AssetCache,
    book: IoBook,
    pending_uploads: HashMap<String, PendingUpload>,
}

impl AssetCoordinator {
    /// Coordinator over an open cache and io book.
    pub fn new(cache: AssetCache, book: IoBook) -> Self {
        Self {
            cache,
            book,
            pending_uploads: HashMap::new(),
        }
    }

    /// Read access to the cache (e.g. for resolving texture paths).
    pub fn cache(&mut self) -> &mut AssetCache {
        &mut self.cache
    }

    /// Whether any transfer is still in flight.
    pub fn is_busy(&self) -> bool {
        self.book.is_busy() || !self.pending_uploads.is_empty()
    }

    // -- upload flow --------------------------------------------------------

    /// Start uploading a local file.
    ///
    /// Hashes the bytes, derives the canonical asset id, and sends
    /// `asset_upload_request`. Content already verified in the cache skips
    /// the request entirely and reports ready.
    pub fn begin_upload(
        &mut self,
        session: &ClientSession,
        file_path: &Path,
    ) -> Result<Option<Notice>, AssetError> {
        let xxhash = xxh64_hex_file(file_path)?;
        let asset_id = asset_id_from_hash(&xxhash);
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| asset_id.clone());

        if self.cache.is_cached(&asset_id) && self.cache.verify(&asset_id)? {
            debug!(%asset_id, "upload skipped, content already cached");
            let local_path = self.cache.cached_path(&asset_id).unwrap_or_default();
            return Ok(Some(Notice::AssetReady {
                asset_id,
                local_path,
            }));
        }

        let file_size = std::fs::metadata(file_path)?.len();
        session.send_payload(
            MessageType::AssetUploadRequest,
            json!({
                "filename": filename,
                "file_size": file_size,
                "xxhash": xxhash,
                "asset_id": asset_id,
                "content_type": content_type_for(&filename),
            }),
        );
        self.pending_uploads.insert(
            asset_id.clone(),
            PendingUpload {
                file_path: file_path.to_path_buf(),
                filename,
                xxhash,
            },
        );
        info!(%asset_id, "upload requested");
        Ok(None)
    }

    /// React to `asset_upload_response`: start the PUT or fail the upload.
    pub fn on_upload_response(
        &mut self,
        data: &Map<String, Value>,
    ) -> Option<Notice> {
        let asset_id = data.get("asset_id").and_then(Value::as_str)?.to_string();
        let Some(pending) = self.pending_uploads.get(&asset_id) else {
            warn!(%asset_id, "upload response without a pending upload");
            return None;
        };
        let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
        let upload_url = data.get("upload_url").and_then(Value::as_str);
        let (Some(upload_url), true) = (upload_url, success) else {
            let reason = data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("upload refused")
                .to_string();
            self.pending_uploads.remove(&asset_id);
            return Some(Notice::AssetFailed { asset_id, reason });
        };

        let headers = data
            .get("required_headers")
            .and_then(Value::as_array)
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|pair| {
                        let name = pair.get(0)?.as_str()?;
                        let value = pair.get(1)?.as_str()?;
                        Some((name.to_string(), value.to_string()))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let metadata = json!({
            "asset_id": asset_id,
            "xxhash": pending.xxhash,
            "filename": pending.filename,
        })
        .as_object()
        .cloned()
        .unwrap_or_default();
        self.book
            .upload(pending.file_path.clone(), upload_url, headers, metadata);
        debug!(%asset_id, "presigned PUT started");
        None
    }

    // -- download flow ------------------------------------------------------

    /// Request a download unless the asset is already cached and verifies.
    pub fn request_download(
        &mut self,
        session: &ClientSession,
        asset_id: &str,
    ) -> Result<Option<Notice>, AssetError> {
        if self.cache.is_cached(asset_id) && self.cache.verify(asset_id)? {
            let local_path = self.cache.cached_path(asset_id).unwrap_or_default();
            return Ok(Some(Notice::AssetReady {
                asset_id: asset_id.to_string(),
                local_path,
            }));
        }
        session.send_payload(
            MessageType::AssetDownloadRequest,
            json!({ "asset_id": asset_id }),
        );
        Ok(None)
    }

    /// React to `asset_download_response`: start the verified GET.
    pub fn on_download_response(&mut self, data: &Map<String, Value>) -> Option<Notice> {
        let asset_id = data.get("asset_id").and_then(Value::as_str)?.to_string();
        let Some(download_url) = data.get("download_url").and_then(Value::as_str) else {
            return Some(Notice::AssetFailed {
                asset_id,
                reason: "download response without a url".into(),
            });
        };
        let expected = data
            .get("xxhash")
            .and_then(Value::as_str)
            .map(str::to_string);
        let metadata = json!({ "asset_id": asset_id })
            .as_object()
            .cloned()
            .unwrap_or_default();
        self.book.download(
            download_url,
            Some(format!("{asset_id}.bin")),
            expected,
            metadata,
        );
        debug!(%asset_id, "verified download started");
        None
    }

    // -- completion draining ------------------------------------------------

    /// Drain the io book, settling uploads and downloads.
    ///
    /// Called from the client main loop; completions for storage
    /// operations pass through untouched in the returned list.
    pub fn poll(
        &mut self,
        session: &ClientSession,
    ) -> (Vec<Notice>, Vec<IoCompletion>) {
        let mut notices = Vec::new();
        let mut passthrough = Vec::new();
        for completion in self.book.process_completed_operations() {
            match completion.kind {
                OperationKind::Upload | OperationKind::Download => {
                    if let Some(notice) = self.handle_completion(session, completion) {
                        notices.push(notice);
                    }
                }
                _ => passthrough.push(completion),
            }
        }
        (notices, passthrough)
    }

    /// Settle one upload/download completion.
    pub fn handle_completion(
        &mut self,
        session: &ClientSession,
        completion: IoCompletion,
    ) -> Option<Notice> {
        let asset_id = completion
            .metadata
            .get("asset_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match completion.kind {
            OperationKind::Upload => {
                let pending = self.pending_uploads.remove(&asset_id);
                if completion.success {
                    let xxhash = completion.hash.clone().unwrap_or_default();
                    session.send_payload(
                        MessageType::AssetUploadConfirm,
                        json!({ "asset_id": asset_id, "xxhash": xxhash, "success": true }),
                    );
                    if let Some(pending) = pending {
                        match self.cache.register_uploaded_asset(
                            &asset_id,
                            &pending.file_path,
                            &pending.filename,
                        ) {
                            Ok(record) => {
                                return Some(Notice::AssetReady {
                                    asset_id,
                                    local_path: record.local_path,
                                });
                            }
                            Err(e) => {
                                warn!(%asset_id, error = %e, "cache ingest after upload failed");
                                return Some(Notice::AssetFailed {
                                    asset_id,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                    None
                } else {
                    let reason = completion.error.unwrap_or_else(|| "upload failed".into());
                    session.send_payload(
                        MessageType::AssetUploadConfirm,
                        json!({ "asset_id": asset_id, "success": false, "error": reason }),
                    );
                    Some(Notice::AssetFailed { asset_id, reason })
                }
            }
            OperationKind::Download => {
                if !completion.success {
                    return Some(Notice::AssetFailed {
                        asset_id,
                        reason: completion.error.unwrap_or_else(|| "download failed".into()),
                    });
                }
                if completion.hash_valid == Some(false) {
                    // Corrupt or substituted bytes never enter the cache.
                    if let Some(path) = &completion.file_path {
                        let _ = std::fs::remove_file(path);
                    }
                    warn!(%asset_id, "discarding download with invalid hash");
                    return Some(Notice::AssetFailed {
                        asset_id,
                        reason: "hash_mismatch".into(),
                    });
                }
                let path = completion.file_path?;
                match self.cache.register_downloaded_asset(&asset_id, &path) {
                    Ok(record) => Some(Notice::AssetReady {
                        asset_id,
                        local_path: record.local_path,
                    }),
                    Err(e) => Some(Notice::AssetFailed {
                        asset_id,
                        reason: e.to_string(),
                    }),
                }
            }
            _ => None,
        }
    }

    /// Close the io book, waiting for in-flight transfers.
    pub async fn close(self) -> Vec<IoCompletion> {
        self.book.close().await
    }
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
