//! In-memory object store standing in for the network in integration
//! tests. Speaks just enough of the multipart wire protocol: create,
//! upload part, list (with pagination), complete, abort.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice::checksum::{self, ChecksumAlgorithm};
use sluice::http::{
    Connector, EndpointOptions, Headers, HttpConnection, HttpConnectionManager,
    HttpRequestMessage, HttpResponse,
};
use sluice::TransferError;

#[derive(Clone)]
pub struct MockPart {
    pub etag: String,
    pub checksum: Option<(String, String)>,
    pub size: usize,
}

#[derive(Default)]
pub struct MockUpload {
    pub key: String,
    pub parts: BTreeMap<u32, MockPart>,
}

pub struct CompletedUpload {
    pub upload_id: String,
    pub key: String,
    pub part_count: usize,
    pub final_etag: String,
}

#[derive(Default)]
pub struct StoreState {
    pub next_upload_id: u32,
    pub uploads: HashMap<String, MockUpload>,
    pub completed: Vec<CompletedUpload>,
    pub aborted: Vec<String>,
    pub requests_seen: Vec<(String, String)>,
    pub create_failures_remaining: u32,
    pub part_failures_remaining: u32,
}

#[derive(Default)]
pub struct MockStore {
    pub state: Mutex<StoreState>,
    pub list_page_size: AtomicUsize,
    pub part_delay_ms: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        let store = MockStore::default();
        store.list_page_size.store(usize::MAX, Ordering::SeqCst);
        Arc::new(store)
    }

    /// Deterministic part ETag: derived from the bytes, so two uploads of
    /// the same content agree.
    pub fn part_etag(part_number: u32, body: &[u8]) -> String {
        let digest = checksum::compute(ChecksumAlgorithm::Crc32, body).unwrap_or_default();
        format!("p{}-{}", part_number, digest.trim_end_matches('='))
    }

    /// Pre-populate an in-progress upload (the resume scenarios).
    pub fn seed_upload(&self, upload_id: &str, key: &str, parts: Vec<(u32, MockPart)>) {
        let mut state = self.state.lock().unwrap();
        let mut upload = MockUpload { key: key.to_string(), parts: BTreeMap::new() };
        for (number, part) in parts {
            upload.parts.insert(number, part);
        }
        state.uploads.insert(upload_id.to_string(), upload);
    }

    pub fn method_count(&self, method: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.requests_seen.iter().filter(|(m, _)| m == method).count()
    }

    pub fn saw_abort(&self) -> bool {
        !self.state.lock().unwrap().aborted.is_empty()
    }
}

pub struct MockConnector {
    pub store: Arc<MockStore>,
}

impl Connector for MockConnector {
    fn connection_manager(&self, _host: &str, _options: &EndpointOptions) -> Arc<dyn HttpConnectionManager> {
        Arc::new(MockManager {
            store: self.store.clone(),
            down: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

pub struct MockManager {
    store: Arc<MockStore>,
    down: std::sync::atomic::AtomicBool,
}

impl HttpConnectionManager for MockManager {
    fn try_acquire(&self) -> Option<Box<dyn HttpConnection>> {
        Some(Box::new(MockConnection { store: self.store.clone() }))
    }

    fn release(&self, _connection: Box<dyn HttpConnection>, _reusable: bool) {}

    fn begin_shutdown(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    fn is_shut_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    store: Arc<MockStore>,
}

fn response(status: u16, headers: Headers, body: String) -> HttpResponse {
    HttpResponse { status, headers, body: body.into_bytes() }
}

fn query_params(path_and_query: &str) -> (String, HashMap<String, String>) {
    match path_and_query.split_once('?') {
        None => (path_and_query.to_string(), HashMap::new()),
        Some((path, query)) => {
            let params = query
                .split('&')
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect();
            (path.to_string(), params)
        }
    }
}

fn checksum_tag(header_name: &str) -> &'static str {
    if header_name.ends_with("crc32c") {
        "ChecksumCRC32C"
    } else if header_name.ends_with("crc32") {
        "ChecksumCRC32"
    } else if header_name.ends_with("sha1") {
        "ChecksumSHA1"
    } else {
        "ChecksumSHA256"
    }
}

/// Extract (PartNumber, ETag) pairs from a CompleteMultipartUpload body.
fn listed_parts(body: &str) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    for block in body.split("<Part>").skip(1) {
        let number = block
            .split("<PartNumber>")
            .nth(1)
            .and_then(|rest| rest.split("</PartNumber>").next())
            .and_then(|text| text.trim().parse::<u32>().ok());
        let etag = block
            .split("<ETag>")
            .nth(1)
            .and_then(|rest| rest.split("</ETag>").next())
            .map(|text| text.trim().to_string());
        if let (Some(number), Some(etag)) = (number, etag) {
            out.push((number, etag));
        }
    }
    out
}

impl HttpConnection for MockConnection {
    fn execute(&mut self, message: &HttpRequestMessage, body: &[u8]) -> Result<HttpResponse, TransferError> {
        let in_flight = self.store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let result = self.handle(message, body);
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MockConnection {
    fn handle(&self, message: &HttpRequestMessage, body: &[u8]) -> Result<HttpResponse, TransferError> {
        let (path, params) = query_params(&message.path_and_query);
        let key = path.trim_start_matches('/').to_string();
        {
            let mut state = self.store.state.lock().unwrap();
            state
                .requests_seen
                .push((message.method.clone(), message.path_and_query.clone()));
        }
        match message.method.as_str() {
            "POST" if params.contains_key("uploads") => self.create(&key),
            "PUT" if params.contains_key("partNumber") => {
                let delay = self.store.part_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    std::thread::sleep(Duration::from_millis(delay as u64));
                }
                self.upload_part(&params, message, body)
            }
            "POST" => self.complete(&params, body),
            "DELETE" => self.abort(&params),
            "GET" => self.list_parts(&params),
            _ => Ok(response(405, Headers::new(), String::new())),
        }
    }

    fn create(&self, key: &str) -> Result<HttpResponse, TransferError> {
        let mut state = self.store.state.lock().unwrap();
        if state.create_failures_remaining > 0 {
            state.create_failures_remaining -= 1;
            return Ok(response(500, Headers::new(), "server busy".to_string()));
        }
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state
            .uploads
            .insert(upload_id.clone(), MockUpload { key: key.to_string(), parts: BTreeMap::new() });
        let body = format!(
            "<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
            key, upload_id
        );
        Ok(response(200, Headers::new(), body))
    }

    fn upload_part(
        &self,
        params: &HashMap<String, String>,
        message: &HttpRequestMessage,
        body: &[u8],
    ) -> Result<HttpResponse, TransferError> {
        let part_number: u32 = params.get("partNumber").and_then(|v| v.parse().ok()).unwrap_or(0);
        let upload_id = params.get("uploadId").cloned().unwrap_or_default();
        let mut state = self.store.state.lock().unwrap();
        if state.part_failures_remaining > 0 {
            state.part_failures_remaining -= 1;
            return Ok(response(500, Headers::new(), "part failed".to_string()));
        }
        let Some(upload) = state.uploads.get_mut(&upload_id) else {
            return Ok(response(404, Headers::new(), "no such upload".to_string()));
        };
        let checksum = message
            .headers
            .iter()
            .find(|(name, _)| name.starts_with("x-amz-checksum-"))
            .map(|(name, value)| (name.to_string(), value.to_string()));
        let etag = MockStore::part_etag(part_number, body);
        upload
            .parts
            .insert(part_number, MockPart { etag: etag.clone(), checksum, size: body.len() });
        let mut headers = Headers::new();
        headers.add("ETag", &format!("\"{}\"", etag));
        Ok(response(200, headers, String::new()))
    }

    fn complete(
        &self,
        params: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<HttpResponse, TransferError> {
        let upload_id = params.get("uploadId").cloned().unwrap_or_default();
        let body_text = String::from_utf8_lossy(body);
        let listed = listed_parts(&body_text);
        let mut state = self.store.state.lock().unwrap();
        let Some(upload) = state.uploads.get(&upload_id) else {
            return Ok(response(404, Headers::new(), "no such upload".to_string()));
        };
        for (number, etag) in &listed {
            match upload.parts.get(number) {
                Some(stored) if &stored.etag == etag => {}
                _ => return Ok(response(400, Headers::new(), format!("bad part {}", number))),
            }
        }
        // Final ETag derives from the listed part etags, so identical
        // content yields an identical result no matter how it got here.
        let joined = listed.iter().map(|(_, etag)| etag.as_str()).collect::<Vec<_>>().join(",");
        let final_etag = checksum::compute(ChecksumAlgorithm::Crc32, joined.as_bytes())
            .unwrap_or_default()
            .trim_end_matches('=')
            .to_string();
        let upload = state.uploads.remove(&upload_id).unwrap_or_default();
        state.completed.push(CompletedUpload {
            upload_id: upload_id.clone(),
            key: upload.key,
            part_count: listed.len(),
            final_etag: final_etag.clone(),
        });
        let body = format!(
            "<CompleteMultipartUploadResult><ETag>&quot;{}&quot;</ETag></CompleteMultipartUploadResult>",
            final_etag
        );
        Ok(response(200, Headers::new(), body))
    }

    fn abort(&self, params: &HashMap<String, String>) -> Result<HttpResponse, TransferError> {
        let upload_id = params.get("uploadId").cloned().unwrap_or_default();
        let mut state = self.store.state.lock().unwrap();
        state.uploads.remove(&upload_id);
        state.aborted.push(upload_id);
        Ok(response(204, Headers::new(), String::new()))
    }

    fn list_parts(&self, params: &HashMap<String, String>) -> Result<HttpResponse, TransferError> {
        let upload_id = params.get("uploadId").cloned().unwrap_or_default();
        let marker: u32 = params
            .get("part-number-marker")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let page_size = self.store.list_page_size.load(Ordering::SeqCst);
        let state = self.store.state.lock().unwrap();
        let Some(upload) = state.uploads.get(&upload_id) else {
            return Ok(response(404, Headers::new(), "no such upload".to_string()));
        };
        let remaining: Vec<(u32, MockPart)> = upload
            .parts
            .range((marker + 1)..)
            .map(|(number, part)| (*number, part.clone()))
            .collect();
        let page = &remaining[..remaining.len().min(page_size)];
        let truncated = remaining.len() > page.len();
        let mut body = String::from("<ListPartsResult>");
        body.push_str(&format!("<IsTruncated>{}</IsTruncated>", truncated));
        if truncated {
            if let Some((last, _)) = page.last() {
                body.push_str(&format!("<NextPartNumberMarker>{}</NextPartNumberMarker>", last));
            }
        }
        for (number, part) in page {
            body.push_str("<Part>");
            body.push_str(&format!("<PartNumber>{}</PartNumber>", number));
            body.push_str(&format!("<ETag>&quot;{}&quot;</ETag>", part.etag));
            body.push_str(&format!("<Size>{}</Size>", part.size));
            if let Some((header, value)) = &part.checksum {
                let tag = checksum_tag(header);
                body.push_str(&format!("<{}>{}</{}>", tag, value, tag));
            }
            body.push_str("</Part>");
        }
        body.push_str("</ListPartsResult>");
        Ok(response(200, Headers::new(), body))
    }
}
