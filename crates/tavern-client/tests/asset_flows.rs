// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end asset coordination against a mock blob store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tavern_assets::{asset_id_for, xxh64_hex};
use tavern_client::{AssetCoordinator, ClientProtocol, Notice, SendFn};
use tavern_protocol::{Envelope, MessageType};
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    protocol: ClientProtocol,
    notices: mpsc::UnboundedReceiver<Notice>,
    sent: Arc<Mutex<Vec<Envelope>>>,
    dirs: tempfile::TempDir,
}

fn harness() -> Harness {
    let dirs = tempfile::tempdir().unwrap();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = sent.clone();
    let send: SendFn = Arc::new(move |envelope| sink.lock().unwrap().push(envelope));

    let cache = tavern_assets::AssetCache::open(dirs.path().join("cache")).unwrap();
    let book = tavern_io::IoBook::new(dirs.path().join("downloads"));
    let assets = AssetCoordinator::new(cache, book);

    let (protocol, notices) = ClientProtocol::new("game-1", "7", "mira", send, assets);
    Harness {
        protocol,
        notices,
        sent,
        dirs,
    }
}

fn envelope(kind: MessageType, data: serde_json::Value) -> Envelope {
    Envelope::with_data(kind, data.as_object().cloned().unwrap_or_default())
}

async fn poll_until_notice(h: &mut Harness) -> Notice {
    for _ in 0..300 {
        h.protocol.poll_io();
        if let Ok(notice) = h.notices.try_recv() {
            return notice;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no notice arrived");
}

#[tokio::test]
async fn upload_flow_puts_confirms_and_caches() {
    let server = MockServer::start().await;
    let mut h = harness();

    let bytes = b"a freshly painted token";
    let xxhash = xxh64_hex(bytes);
    let asset_id = asset_id_for(bytes);
    let file = h.dirs.path().join("token.png");
    std::fs::write(&file, bytes).unwrap();

    Mock::given(method("PUT"))
        .and(path(format!("/assets/{asset_id}/token.png")))
        .and(header("x-amz-meta-xxhash", xxhash.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // 1. User starts the upload: the request goes out with the derived id.
    h.protocol.upload_asset(&file);
    let request = {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::AssetUploadRequest);
        assert_eq!(sent[0].data["asset_id"], json!(asset_id));
        assert_eq!(sent[0].data["xxhash"], json!(xxhash));
        assert_eq!(sent[0].data["content_type"], "image/png");
        sent[0].clone()
    };

    // 2. Server answers with the presigned PUT.
    h.protocol.handle_envelope(&envelope(
        MessageType::AssetUploadResponse,
        json!({
            "success": true,
            "asset_id": request.data["asset_id"],
            "upload_url": format!("{}/assets/{asset_id}/token.png", server.uri()),
            "required_headers": [["x-amz-meta-xxhash", xxhash]],
        }),
    ));

    // 3. The PUT lands, the confirm goes out, the cache registers.
    let notice = poll_until_notice(&mut h).await;
    match notice {
        Notice::AssetReady {
            asset_id: ready, ..
        } => assert_eq!(ready, asset_id),
        other => panic!("unexpected notice {other:?}"),
    }
    let sent = h.sent.lock().unwrap();
    let confirm = sent.last().unwrap();
    assert_eq!(confirm.kind, MessageType::AssetUploadConfirm);
    assert_eq!(confirm.data["success"], true);
    assert_eq!(confirm.data["asset_id"], json!(asset_id));
    assert_eq!(confirm.data["xxhash"], json!(xxhash));
}

#[tokio::test]
async fn failed_put_confirms_failure() {
    let server = MockServer::start().await;
    let mut h = harness();

    let bytes = b"denied at the store";
    let asset_id = asset_id_for(bytes);
    let file = h.dirs.path().join("denied.bin");
    std::fs::write(&file, bytes).unwrap();

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    h.protocol.upload_asset(&file);
    h.protocol.handle_envelope(&envelope(
        MessageType::AssetUploadResponse,
        json!({
            "success": true,
            "asset_id": asset_id,
            "upload_url": format!("{}/anywhere", server.uri()),
            "required_headers": [],
        }),
    ));

    let notice = poll_until_notice(&mut h).await;
    assert!(matches!(notice, Notice::AssetFailed { .. }));
    let sent = h.sent.lock().unwrap();
    let confirm = sent.last().unwrap();
    assert_eq!(confirm.kind, MessageType::AssetUploadConfirm);
    assert_eq!(confirm.data["success"], false);
    assert!(confirm.data["error"].as_str().is_some());
}

#[tokio::test]
async fn verified_download_registers_in_cache() {
    let server = MockServer::start().await;
    let mut h = harness();

    let bytes = b"a downloaded battle map".to_vec();
    let xxhash = xxh64_hex(&bytes);
    let asset_id = asset_id_for(&bytes);

    Mock::given(method("GET"))
        .and(path(format!("/assets/{asset_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
        .mount(&server)
        .await;

    h.protocol.download_asset(&asset_id);
    {
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.last().unwrap().kind, MessageType::AssetDownloadRequest);
    }

    h.protocol.handle_envelope(&envelope(
        MessageType::AssetDownloadResponse,
        json!({
            "asset_id": asset_id,
            "download_url": format!("{}/assets/{asset_id}", server.uri()),
            "xxhash": xxhash,
        }),
    ));

    match poll_until_notice(&mut h).await {
        Notice::AssetReady {
            asset_id: ready,
            local_path,
        } => {
            assert_eq!(ready, asset_id);
            assert_eq!(std::fs::read(local_path).unwrap(), bytes);
        }
        other => panic!("unexpected notice {other:?}"),
    }

    // A second request is served from cache without touching the wire.
    let outbound_before = h.sent.lock().unwrap().len();
    h.protocol.download_asset(&asset_id);
    match h.notices.try_recv().unwrap() {
        Notice::AssetReady { asset_id: ready, .. } => assert_eq!(ready, asset_id),
        other => panic!("unexpected notice {other:?}"),
    }
    assert_eq!(h.sent.lock().unwrap().len(), outbound_before);
}

#[tokio::test]
async fn hash_mismatch_discards_the_download() {
    let server = MockServer::start().await;
    let mut h = harness();

    let bytes = b"tampered bytes".to_vec();
    let asset_id = "aaaa1111bbbb2222";

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
        .mount(&server)
        .await;

    h.protocol.download_asset(asset_id);
    h.protocol.handle_envelope(&envelope(
        MessageType::AssetDownloadResponse,
        json!({
            "asset_id": asset_id,
            "download_url": format!("{}/assets/{asset_id}", server.uri()),
            // The server's recorded hash disagrees with the delivered bytes.
            "xxhash": "0000000000000000",
        }),
    ));

    match poll_until_notice(&mut h).await {
        Notice::AssetFailed {
            asset_id: failed,
            reason,
        } => {
            assert_eq!(failed, asset_id);
            assert_eq!(reason, "hash_mismatch");
        }
        other => panic!("unexpected notice {other:?}"),
    }
    // Nothing was registered and the corrupt file is gone.
    assert!(!h.protocol.cache_contains(asset_id));
    let downloads = h.dirs.path().join("downloads");
    let leftover = std::fs::read_dir(&downloads)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}
