//! End-to-end multipart put scenarios over the in-memory store.

mod common;

use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{MockConnector, MockStore};
use sluice::checksum::ChecksumAlgorithm;
use sluice::http::NoopSigner;
use sluice::transfer::ranged_put::PutOptions;
use sluice::{
    Client, ClientConfig, ErrorKind, Headers, StandardRetryStrategy, TransferCallbacks,
};

const MIB: u64 = 1024 * 1024;

fn test_client(store: &Arc<MockStore>, retries: usize) -> Client {
    let mut config = ClientConfig::default();
    config.request_loop_threads = 4;
    config.delivery_loop_threads = 1;
    Client::with_collaborators(
        config,
        Arc::new(MockConnector { store: store.clone() }),
        Arc::new(StandardRetryStrategy::with_limits(retries, 1)),
        Arc::new(NoopSigner),
        Arc::new(sluice::host::FixedHostResolver(0)),
    )
    .unwrap()
}

fn put_options(content: Vec<u8>, algorithm: ChecksumAlgorithm) -> PutOptions {
    PutOptions {
        host: "bucket.example.com".to_string(),
        key: "data.bin".to_string(),
        content_length: content.len() as u64,
        body: Box::new(Cursor::new(content)),
        headers: Headers::new(),
        checksum_algorithm: algorithm,
        resume_token: None,
        part_size: None,
        callbacks: TransferCallbacks::default(),
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

#[test]
fn test_fresh_25_mib_put_uses_four_parts() {
    let store = MockStore::new();
    let client = test_client(&store, 0);
    let content = patterned((25 * MIB) as usize);
    let put = client.put_object(put_options(content, ChecksumAlgorithm::Crc32c)).unwrap();
    assert_eq!(put.total_num_parts(), 4);

    let result = put.wait_for_finish(Duration::from_secs(30)).unwrap();
    assert!(result.is_success(), "{:?}", result.error);

    {
        let state = store.state.lock().unwrap();
        assert_eq!(state.completed.len(), 1);
        let completed = &state.completed[0];
        assert_eq!(completed.part_count, 4);
        assert_eq!(completed.key, "data.bin");
        assert!(state.uploads.is_empty());
        assert!(state.aborted.is_empty());
    }
    // Three full parts and one 1 MiB tail went up.
    let stats = client.stats();
    assert_eq!(stats.bytes_uploaded, 25 * MIB);
    assert_eq!(stats.requests_failed, 0);
    client.shutdown();
}

#[test]
fn test_put_body_streamed_from_file() {
    let store = MockStore::new();
    let client = test_client(&store, 0);
    let content = patterned((9 * MIB) as usize);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, &content).unwrap();
    let reader = std::fs::File::open(file.path()).unwrap();
    let mut options = put_options(Vec::new(), ChecksumAlgorithm::Crc32);
    options.content_length = content.len() as u64;
    options.body = Box::new(reader);
    let put = client.put_object(options).unwrap();
    assert!(put.wait_for_finish(Duration::from_secs(30)).unwrap().is_success());
    assert_eq!(client.stats().bytes_uploaded, 9 * MIB);
    client.shutdown();
}

#[test]
fn test_part_bodies_carry_checksums() {
    let store = MockStore::new();
    let client = test_client(&store, 0);
    let content = patterned((16 * MIB) as usize);
    let put = client.put_object(put_options(content, ChecksumAlgorithm::Sha256)).unwrap();
    assert!(put.wait_for_finish(Duration::from_secs(30)).unwrap().is_success());
    let state = store.state.lock().unwrap();
    // Checksums were captured by the store from the request headers.
    assert_eq!(state.completed.len(), 1);
    drop(state);
    client.shutdown();
}

#[test]
fn test_progress_callback_reaches_content_length() {
    let store = MockStore::new();
    let client = test_client(&store, 0);
    let progress = Arc::new(std::sync::Mutex::new((0u64, 0u64)));
    let progress_cb = progress.clone();
    let content = patterned((16 * MIB) as usize);
    let mut options = put_options(content, ChecksumAlgorithm::None);
    options.callbacks.on_progress = Some(Box::new(move |done, total| {
        let mut seen = progress_cb.lock().unwrap();
        seen.0 = seen.0.max(done);
        seen.1 = total;
    }));
    let put = client.put_object(options).unwrap();
    assert!(put.wait_for_finish(Duration::from_secs(30)).unwrap().is_success());
    let seen = *progress.lock().unwrap();
    assert_eq!(seen, (16 * MIB, 16 * MIB));
    client.shutdown();
}

#[test]
fn test_headers_callback_carries_final_etag() {
    let store = MockStore::new();
    let client = test_client(&store, 0);
    let etag_seen = Arc::new(std::sync::Mutex::new(None::<String>));
    let etag_cb = etag_seen.clone();
    let mut options = put_options(patterned((8 * MIB) as usize), ChecksumAlgorithm::None);
    options.callbacks.on_headers = Some(Box::new(move |headers, status| {
        assert_eq!(status, 200);
        *etag_cb.lock().unwrap() = headers.get("ETag").map(str::to_string);
    }));
    let put = client.put_object(options).unwrap();
    assert!(put.wait_for_finish(Duration::from_secs(30)).unwrap().is_success());
    let etag = etag_seen.lock().unwrap().clone().unwrap();
    // Quote entities in the XML body were decoded back into quotes.
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    let state = store.state.lock().unwrap();
    assert_eq!(etag.trim_matches('"'), state.completed[0].final_etag);
    drop(state);
    client.shutdown();
}

#[test]
fn test_create_failure_exhausts_retries_without_abort() {
    let store = MockStore::new();
    store.state.lock().unwrap().create_failures_remaining = 10;
    let client = test_client(&store, 1);
    let put = client.put_object(put_options(patterned((8 * MIB) as usize), ChecksumAlgorithm::None)).unwrap();
    let result = put.wait_for_finish(Duration::from_secs(30)).unwrap();
    let error = result.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Http);
    assert_eq!(error.response_status(), Some(500));
    // One initial attempt plus one retry.
    assert_eq!(store.method_count("POST"), 2);
    // Without an upload id, nothing can be aborted.
    assert!(!store.saw_abort());
    client.shutdown();
}

#[test]
fn test_transient_part_failure_is_retried_to_success() {
    let store = MockStore::new();
    store.state.lock().unwrap().part_failures_remaining = 1;
    let client = test_client(&store, 2);
    let content = patterned((16 * MIB) as usize);
    let put = client.put_object(put_options(content, ChecksumAlgorithm::Crc32)).unwrap();
    let result = put.wait_for_finish(Duration::from_secs(30)).unwrap();
    assert!(result.is_success(), "{:?}", result.error);
    let stats = client.stats();
    assert!(stats.requests_retried >= 1);
    assert_eq!(store.state.lock().unwrap().completed.len(), 1);
    client.shutdown();
}

#[test]
fn test_part_failure_after_retries_aborts_upload() {
    let store = MockStore::new();
    store.state.lock().unwrap().part_failures_remaining = 100;
    let client = test_client(&store, 1);
    let put = client.put_object(put_options(patterned((16 * MIB) as usize), ChecksumAlgorithm::None)).unwrap();
    let result = put.wait_for_finish(Duration::from_secs(30)).unwrap();
    assert_eq!(result.error.unwrap().response_status(), Some(500));
    // The failed upload was aborted server-side.
    assert!(store.saw_abort());
    assert!(store.state.lock().unwrap().uploads.is_empty());
    client.shutdown();
}

#[test]
fn test_cancel_mid_upload_aborts() {
    let store = MockStore::new();
    store.part_delay_ms.store(30, Ordering::SeqCst);
    let client = test_client(&store, 0);
    let put = client.put_object(put_options(patterned((32 * MIB) as usize), ChecksumAlgorithm::None)).unwrap();
    // Wait for the upload to exist server-side, then cancel.
    for _ in 0..200 {
        if !store.state.lock().unwrap().uploads.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    put.cancel();
    let result = put.wait_for_finish(Duration::from_secs(30)).unwrap();
    assert_eq!(result.error.unwrap().kind(), ErrorKind::Canceled);
    assert!(store.saw_abort());
    client.shutdown();
}

#[test]
fn test_admission_never_exceeds_connection_ceiling() {
    let store = MockStore::new();
    store.part_delay_ms.store(5, Ordering::SeqCst);
    let mut config = ClientConfig::default();
    config.request_loop_threads = 6;
    config.delivery_loop_threads = 1;
    config.max_active_connections_override = Some(3);
    let client = Client::with_collaborators(
        config,
        Arc::new(MockConnector { store: store.clone() }),
        Arc::new(StandardRetryStrategy::with_limits(0, 1)),
        Arc::new(NoopSigner),
        Arc::new(sluice::host::FixedHostResolver(0)),
    )
    .unwrap();
    let put = client.put_object(put_options(patterned((48 * MIB) as usize), ChecksumAlgorithm::None)).unwrap();
    assert!(put.wait_for_finish(Duration::from_secs(60)).unwrap().is_success());
    assert!(store.max_in_flight.load(Ordering::SeqCst) <= 3);
    client.shutdown();
}
