// SPDX-License-Identifier: MIT OR Apache-2.0
//! The narrow seam to the external blob store.
//!
//! The broker never proxies asset bytes; it hands out short-lived URLs and
//! lets clients talk to the store directly.

use serde::{Deserialize, Serialize};

/// A presigned upload target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignedUpload {
    /// URL to PUT the bytes to.
    pub upload_url: String,
    /// Headers the PUT must carry.
    pub required_headers: Vec<(String, String)>,
    /// Seconds since epoch after which the URL stops working.
    pub expires_at: f64,
}

/// A presigned download source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresignedDownload {
    /// URL to GET the bytes from.
    pub download_url: String,
    /// Seconds since epoch after which the URL stops working.
    pub expires_at: f64,
}

/// Issues presigned URLs against the deployment's blob store.
pub trait BlobPresigner: Send + Sync {
    /// Presign an upload of `asset_id` with the given integrity tag.
    fn presign_put(&self, asset_id: &str, filename: &str, xxhash: &str) -> PresignedUpload;
    /// Presign a download of `asset_id`.
    fn presign_get(&self, asset_id: &str) -> PresignedDownload;
}

/// Development signer: deterministic URLs under a base, expiry as a query
/// parameter. Stands in for the real store's signing endpoint in tests and
/// single-host deployments.
#[derive(Debug, Clone)]
pub struct LocalPresigner {
    base_url: String,
    expiry_secs: u64,
}

impl LocalPresigner {
    /// Signer issuing URLs under `base_url` valid for `expiry_secs`.
    pub fn new(base_url: impl Into<String>, expiry_secs: u64) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            expiry_secs,
        }
    }

    fn expires_at(&self) -> f64 {
        tavern_protocol::now_epoch() + self.expiry_secs as f64
    }
}

impl BlobPresigner for LocalPresigner {
    fn presign_put(&self, asset_id: &str, filename: &str, xxhash: &str) -> PresignedUpload {
        let expires_at = self.expires_at();
        PresignedUpload {
            upload_url: format!(
                "{}/assets/{asset_id}/{filename}?expires={expires_at}",
                self.base_url
            ),
            required_headers: vec![
                ("x-amz-meta-xxhash".to_string(), xxhash.to_string()),
                (
                    "x-amz-meta-upload-timestamp".to_string(),
                    format!("{}", tavern_protocol::now_epoch() as u64),
                ),
            ],
            expires_at,
        }
    }

    fn presign_get(&self, asset_id: &str) -> PresignedDownload {
        let expires_at = self.expires_at();
        PresignedDownload {
            download_url: format!("{}/assets/{asset_id}?expires={expires_at}", self.base_url),
            expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_rooted_and_carry_expiry() {
        let signer = LocalPresigner::new("http://blobs.local/", 900);
        let up = signer.presign_put("cafe0123cafe0123", "map.png", "cafe0123cafe0123");
        assert!(up.upload_url.starts_with("http://blobs.local/assets/cafe0123cafe0123/map.png"));
        assert!(up.required_headers.iter().any(|(k, _)| k == "x-amz-meta-xxhash"));
        assert!(up.expires_at > tavern_protocol::now_epoch());

        let down = signer.presign_get("cafe0123cafe0123");
        assert!(down.download_url.contains("/assets/cafe0123cafe0123"));
    }
}
