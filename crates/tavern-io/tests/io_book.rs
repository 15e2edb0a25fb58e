// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operation-book behavior against a mock blob store.

use std::time::Duration;

use serde_json::{Map, json};
use tavern_io::{IoBook, OperationKind};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn meta(value: serde_json::Value) -> Map<String, serde_json::Value> {
    value.as_object().unwrap().clone()
}

async fn drain_one(book: &mut IoBook) -> tavern_io::IoCompletion {
    for _ in 0..200 {
        let mut done = book.process_completed_operations();
        if let Some(record) = done.pop() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation did not complete in time");
}

#[tokio::test]
async fn download_streams_to_disk_and_hashes() {
    let server = MockServer::start().await;
    let body = b"map tile bytes".to_vec();
    Mock::given(method("GET"))
        .and(path("/blob/map.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut book = IoBook::new(dir.path());
    let op = book.download(
        format!("{}/blob/map.png", server.uri()),
        None,
        None,
        meta(json!({"asset_id": "abc"})),
    );
    assert!(book.is_busy());

    let record = drain_one(&mut book).await;
    assert_eq!(record.operation_id, op);
    assert_eq!(record.kind, OperationKind::Download);
    assert!(record.success);
    assert_eq!(record.size, body.len() as u64);
    assert_eq!(record.metadata["asset_id"], "abc");
    // No expectation was supplied, so no verdict is rendered.
    assert!(record.hash_valid.is_none());
    // Filename falls out of the URL path.
    let file_path = record.file_path.unwrap();
    assert_eq!(file_path.file_name().unwrap(), "map.png");
    assert_eq!(std::fs::read(&file_path).unwrap(), body);
    assert!(!book.is_busy());
}

#[tokio::test]
async fn download_verifies_expected_hash() {
    let server = MockServer::start().await;
    let body = b"verified payload".to_vec();
    Mock::given(method("GET"))
        .and(path("/blob/x"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut book = IoBook::new(dir.path());

    // First fetch without expectation to learn the true digest.
    book.download(format!("{}/blob/x", server.uri()), Some("probe.bin".into()), None, Map::new());
    let probe = drain_one(&mut book).await;
    let true_hash = probe.hash.clone().unwrap();

    // Matching expectation verifies.
    book.download(
        format!("{}/blob/x", server.uri()),
        Some("good.bin".into()),
        Some(true_hash.to_uppercase()),
        Map::new(),
    );
    let good = drain_one(&mut book).await;
    assert_eq!(good.hash_valid, Some(true));

    // Wrong expectation flags the record without failing the transfer.
    book.download(
        format!("{}/blob/x", server.uri()),
        Some("bad.bin".into()),
        Some("0000000000000000".into()),
        Map::new(),
    );
    let bad = drain_one(&mut book).await;
    assert!(bad.success);
    assert_eq!(bad.hash_valid, Some(false));
    assert_eq!(bad.hash.unwrap(), true_hash);
}

#[tokio::test]
async fn download_http_error_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut book = IoBook::new(dir.path());
    book.download(
        format!("{}/blob/missing", server.uri()),
        Some("nope.bin".into()),
        Some("aaaabbbbccccdddd".into()),
        Map::new(),
    );
    let record = drain_one(&mut book).await;
    assert!(!record.success);
    assert!(record.error.is_some());
    // A failed verified download is never hash-valid.
    assert_eq!(record.hash_valid, Some(false));
}

#[tokio::test]
async fn upload_puts_bytes_with_required_headers() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/presigned/asset"))
        .and(header("x-amz-meta-xxhash", "cafe0123cafe0123"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("upload.bin");
    std::fs::write(&file, b"upload me").unwrap();

    let mut book = IoBook::new(dir.path());
    book.upload(
        &file,
        format!("{}/presigned/asset", server.uri()),
        vec![("x-amz-meta-xxhash".into(), "cafe0123cafe0123".into())],
        Map::new(),
    );
    let record = drain_one(&mut book).await;
    assert!(record.success, "{:?}", record.error);
    assert_eq!(record.kind, OperationKind::Upload);
    assert_eq!(record.size, 9);
    assert!(record.hash.is_some());
}

#[tokio::test]
async fn storage_round_trip_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let mut book = IoBook::new(dir.path());

    let target = dir.path().join("store/notes.json");
    book.save_file(&target, b"{\"a\":1}".to_vec(), Map::new());
    let saved = drain_one(&mut book).await;
    assert!(saved.success);
    assert_eq!(saved.kind, OperationKind::StorageSave);

    book.load_file(&target, Map::new());
    let loaded = drain_one(&mut book).await;
    assert!(loaded.success);
    assert_eq!(loaded.data.as_deref(), Some(b"{\"a\":1}".as_slice()));
    assert_eq!(loaded.hash, saved.hash);

    let imported_target = dir.path().join("store/imported.json");
    book.import_external(&target, &imported_target, Map::new());
    let imported = drain_one(&mut book).await;
    assert!(imported.success);
    assert_eq!(imported.kind, OperationKind::ExternalImport);
    assert!(imported_target.exists());
}

#[tokio::test]
async fn cancel_all_clears_pending() {
    let server = MockServer::start().await;
    // A response that stalls longer than the test.
    Mock::given(method("GET"))
        .and(path("/blob/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(30))
                .set_body_bytes(b"late".to_vec()),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut book = IoBook::new(dir.path());
    book.download(format!("{}/blob/slow", server.uri()), None, None, Map::new());
    assert_eq!(book.pending_count(), 1);

    book.cancel_all();
    assert!(!book.is_busy());
    assert!(book.process_completed_operations().is_empty());
}

#[tokio::test]
async fn close_drains_finished_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut book = IoBook::new(dir.path());
    let target = dir.path().join("f.bin");
    book.save_file(&target, b"x".to_vec(), Map::new());
    // Give the task a moment, then close without draining first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let leftover = book.close().await;
    assert_eq!(leftover.len(), 1);
    assert!(leftover[0].success);
}
