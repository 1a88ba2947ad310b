//! Resumable checksummed multipart put.
//!
//! Fresh uploads run CreateMultipartUpload, then the part loop, then
//! CompleteMultipartUpload. Resumed uploads first page through ListParts
//! to learn which parts the server already has, skip those bytes in the
//! body stream (re-verifying their stored checksums), and upload the
//! rest. A transfer with a finish result drains in-flight requests and
//! then aborts the server-side upload unless the failure was a pause or
//! resume failure.

use std::io::Read;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::checksum::{self, ChecksumAlgorithm};
use crate::client::ClientImpl;
use crate::config::{ClientConfig, MAX_PARTS, MIN_PART_SIZE};
use crate::error_handling::{utils as err, ErrorKind, TransferError};
use crate::http::{strip_etag_quotes, Headers, HttpRequestMessage};
use crate::request::{Request, RequestTag};
use crate::transfer::resume::ResumeToken;
use crate::transfer::{
    Transfer, TransferCallbacks, TransferCore, TransferKind, TransferResult, UpdateFlags,
    UpdateOutcome,
};
use crate::utils::log;
use crate::xml;

/// SSE-C headers copied from the CreateMultipartUpload response and echoed
/// into the final user-visible headers.
const NEEDED_RESPONSE_HEADERS: [&str; 3] = [
    "x-amz-server-side-encryption-customer-algorithm",
    "x-amz-server-side-encryption-customer-key-MD5",
    "x-amz-server-side-encryption-context",
];

/// SSE-C request headers repeated on every UploadPart.
const PART_REQUEST_HEADERS: [&str; 3] = [
    "x-amz-server-side-encryption-customer-algorithm",
    "x-amz-server-side-encryption-customer-key",
    "x-amz-server-side-encryption-customer-key-MD5",
];

/// Options for submitting a multipart put.
pub struct PutOptions {
    pub host: String,
    /// Object key, without a leading slash.
    pub key: String,
    pub content_length: u64,
    pub body: Box<dyn Read + Send>,
    pub headers: Headers,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Token from a previous `pause`; switches construction to resume.
    pub resume_token: Option<ResumeToken>,
    /// Per-transfer override of the client part size.
    pub part_size: Option<u64>,
    pub callbacks: TransferCallbacks,
}

#[derive(Default)]
struct PhaseState {
    sent: bool,
    completed: bool,
    error: Option<ErrorKind>,
}

impl PhaseState {
    fn in_flight(&self) -> bool {
        self.sent && !self.completed
    }

    fn succeeded(&self) -> bool {
        self.completed && self.error.is_none()
    }
}

struct PutSynced {
    upload_id: Option<String>,
    etags: Vec<Option<String>>,
    checksums: Vec<Option<String>>,
    num_parts_sent: u32,
    num_parts_completed: u32,
    num_parts_successful: u32,
    num_parts_failed: u32,
    list_parts: PhaseState,
    create_mpu: PhaseState,
    complete_mpu: PhaseState,
    abort_mpu: PhaseState,
    /// Marker for the next ListParts page; present between pages.
    list_parts_marker: Option<String>,
    needed_response_headers: Headers,
    bytes_transferred: u64,
}

/// Touched only from the scheduler loop.
struct PutThreaded {
    next_part_number: u32,
}

/// The user body stream plus the count of parts consumed from it. Reads
/// are strictly serial; only request preparation touches this.
struct BodyStream {
    stream: Box<dyn Read + Send>,
    parts_read: u32,
}

pub struct MultipartPut {
    core: Arc<TransferCore>,
    client: Weak<ClientImpl>,
    content_length: u64,
    part_size: u64,
    total_num_parts: u32,
    resumed: bool,
    compute_content_md5: bool,
    body: Mutex<BodyStream>,
    synced: Mutex<PutSynced>,
    threaded: Mutex<PutThreaded>,
}

impl MultipartPut {
    pub(crate) fn new(
        client: Weak<ClientImpl>,
        config: &ClientConfig,
        options: PutOptions,
    ) -> Result<Arc<Self>, TransferError> {
        let PutOptions {
            host,
            key,
            content_length,
            body,
            headers,
            checksum_algorithm,
            resume_token,
            part_size,
            callbacks,
        } = options;
        if host.is_empty() || key.is_empty() {
            return Err(err::invalid_argument("put_object", "host and key are required"));
        }

        let resumed = resume_token.is_some();
        let (part_size, total_num_parts, upload_id) = match resume_token {
            Some(token) => {
                token.validate_for_put(content_length, MIN_PART_SIZE, MAX_PARTS)?;
                if token.partition_size > config.max_part_size {
                    return Err(err::invalid_argument(
                        "resume_token",
                        format!(
                            "partition_size {} above max_part_size {}",
                            token.partition_size, config.max_part_size
                        ),
                    ));
                }
                (token.partition_size, token.total_num_parts, Some(token.multipart_upload_id))
            }
            None => {
                let mut part_size = part_size.unwrap_or(config.part_size);
                // Grow the part size when the object would exceed the
                // store's part-count cap.
                let floor = content_length.div_ceil(u64::from(MAX_PARTS));
                if part_size < floor {
                    part_size = floor;
                }
                if part_size > config.max_part_size {
                    return Err(err::invalid_argument(
                        "put_object",
                        format!(
                            "content length {} needs parts larger than max_part_size {}",
                            content_length, config.max_part_size
                        ),
                    ));
                }
                let total = content_length.div_ceil(part_size).max(1);
                (part_size, total as u32, None)
            }
        };

        let compute_content_md5 = config.compute_content_md5 || headers.contains("Content-MD5");
        let core = Arc::new(TransferCore::new(
            TransferKind::MultipartPut,
            &host,
            &key,
            headers,
            checksum_algorithm,
            callbacks,
            config.initial_read_window,
        ));
        let slots = total_num_parts as usize;
        Ok(Arc::new(Self {
            core,
            client,
            content_length,
            part_size,
            total_num_parts,
            resumed,
            compute_content_md5,
            body: Mutex::new(BodyStream { stream: body, parts_read: 0 }),
            synced: Mutex::new(PutSynced {
                upload_id,
                etags: vec![None; slots],
                checksums: vec![None; slots],
                num_parts_sent: 0,
                num_parts_completed: 0,
                num_parts_successful: 0,
                num_parts_failed: 0,
                list_parts: PhaseState::default(),
                create_mpu: PhaseState::default(),
                complete_mpu: PhaseState::default(),
                abort_mpu: PhaseState::default(),
                list_parts_marker: None,
                needed_response_headers: Headers::new(),
                bytes_transferred: 0,
            }),
            threaded: Mutex::new(PutThreaded { next_part_number: 1 }),
        }))
    }

    pub fn total_num_parts(&self) -> u32 {
        self.total_num_parts
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Capture a resume token (when the upload is far enough along for one
    /// to exist) and halt the transfer with a `Paused` result. Pausing
    /// never aborts the server-side upload.
    pub fn pause(&self) -> Result<Option<ResumeToken>, TransferError> {
        let token = {
            let synced = self.synced.lock().unwrap();
            if synced.create_mpu.succeeded() {
                synced
                    .upload_id
                    .as_ref()
                    .map(|id| ResumeToken::for_put(id, self.part_size, self.total_num_parts))
            } else {
                None
            }
        };
        if self.core.set_finish_result(TransferResult::failure(err::paused("pause"))) {
            log(&format!("paused put of {}/{}", self.core.host(), self.core.key()));
        }
        self.poke_client();
        Ok(token)
    }

    /// Cancel the transfer. A no-op when a finish result (including a
    /// pause) is already recorded.
    pub fn cancel(&self) {
        self.core.cancel();
        self.poke_client();
    }

    pub fn wait_for_finish(&self, timeout: Duration) -> Option<TransferResult> {
        self.core.wait_for_finish(timeout)
    }

    pub fn finish_result(&self) -> Option<TransferResult> {
        self.core.finish_result()
    }

    fn poke_client(&self) {
        if let Some(client) = self.client.upgrade() {
            client.schedule_process_work();
        }
    }

    fn set_fail(&self, error: TransferError) {
        if self.core.set_finish_result(TransferResult::failure(error.clone())) {
            log(&format!(
                "put of {}/{} failed: {}",
                self.core.host(),
                self.core.key(),
                error
            ));
        }
    }

    fn part_len(&self, part_number: u32) -> usize {
        let start = u64::from(part_number - 1) * self.part_size;
        (self.content_length - start).min(self.part_size) as usize
    }

    /// Scheduler work for a transfer that already has a finish result:
    /// drain in-flight requests, then abort the server-side upload unless
    /// that is suppressed.
    fn update_after_finish(&self, result: &TransferResult) -> UpdateOutcome {
        let mut synced = self.synced.lock().unwrap();
        if synced.list_parts.in_flight()
            || synced.create_mpu.in_flight()
            || synced.complete_mpu.in_flight()
            || synced.num_parts_completed < synced.num_parts_sent
        {
            return UpdateOutcome::waiting();
        }
        let suppress = match result.error.as_ref() {
            None => true,
            Some(error) => error.suppresses_abort(),
        };
        let abort_wanted = !suppress && !synced.complete_mpu.succeeded() && synced.upload_id.is_some();
        if abort_wanted && !synced.abort_mpu.sent {
            synced.abort_mpu.sent = true;
            return UpdateOutcome::work(Request::new(RequestTag::AbortMultipartUpload, 0).with_always_send());
        }
        if synced.abort_mpu.in_flight() {
            return UpdateOutcome::waiting();
        }
        UpdateOutcome::done()
    }

    fn prepare_list_parts(&self, request: &mut Request) -> Result<(), TransferError> {
        let (upload_id, marker) = {
            let synced = self.synced.lock().unwrap();
            (synced.upload_id.clone(), synced.list_parts_marker.clone())
        };
        let upload_id = upload_id
            .ok_or_else(|| err::internal("prepare_list_parts", "no upload id to list"))?;
        let mut path = format!("/{}?uploadId={}", self.core.key(), upload_id);
        if let Some(marker) = marker {
            path.push_str(&format!("&part-number-marker={}", marker));
        }
        request.message = Some(HttpRequestMessage::new("GET", &path));
        Ok(())
    }

    fn prepare_create(&self, request: &mut Request) -> Result<(), TransferError> {
        let mut message =
            HttpRequestMessage::new("POST", &format!("/{}?uploads", self.core.key()));
        for (name, value) in self.core.initial_headers().iter() {
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("Content-MD5") {
                continue;
            }
            message.headers.set(name, value);
        }
        if let Some(name) = self.core.checksum_algorithm().amz_name() {
            message.headers.set("x-amz-checksum-algorithm", name);
        }
        request.message = Some(message);
        Ok(())
    }

    fn prepare_part(&self, request: &mut Request) -> Result<(), TransferError> {
        let part_number = request.part_number;
        if request.num_times_prepared == 0 {
            let data = self.read_part_from_stream(part_number)?;
            if self.core.checksum_algorithm() != ChecksumAlgorithm::None {
                let digest = checksum::compute(self.core.checksum_algorithm(), &data);
                let mut synced = self.synced.lock().unwrap();
                synced.checksums[(part_number - 1) as usize] = digest;
            }
            request.body = data;
        }
        // Retries reuse the body and message composed the first time.
        if request.message.is_some() {
            return Ok(());
        }
        let upload_id = {
            let synced = self.synced.lock().unwrap();
            synced.upload_id.clone()
        }
        .ok_or_else(|| err::internal("prepare_upload_part", "no upload id"))?;
        let mut message = HttpRequestMessage::new(
            "PUT",
            &format!(
                "/{}?partNumber={}&uploadId={}",
                self.core.key(),
                part_number,
                upload_id
            ),
        );
        for name in PART_REQUEST_HEADERS {
            if let Some(value) = self.core.initial_headers().get(name) {
                message.headers.set(name, value);
            }
        }
        if let Some(header) = self.core.checksum_algorithm().header_name() {
            let stored = {
                let synced = self.synced.lock().unwrap();
                synced.checksums[(part_number - 1) as usize].clone()
            };
            if let Some(digest) = stored {
                message.headers.set(header, &digest);
            }
        }
        if self.compute_content_md5 {
            message.headers.set("Content-MD5", &checksum::content_md5(&request.body));
        }
        request.message = Some(message);
        Ok(())
    }

    fn prepare_complete(&self, request: &mut Request) -> Result<(), TransferError> {
        let (upload_id, xml_body) = {
            let synced = self.synced.lock().unwrap();
            let upload_id = synced
                .upload_id
                .clone()
                .ok_or_else(|| err::internal("prepare_complete", "no upload id"))?;
            let xml_body = build_complete_xml(
                &synced.etags,
                &synced.checksums,
                self.core.checksum_algorithm(),
            )?;
            (upload_id, xml_body)
        };
        let mut message = HttpRequestMessage::new(
            "POST",
            &format!("/{}?uploadId={}", self.core.key(), upload_id),
        );
        message.headers.set("Content-Type", "application/xml");
        request.body = xml_body.into_bytes();
        request.message = Some(message);
        Ok(())
    }

    fn prepare_abort(&self, request: &mut Request) -> Result<(), TransferError> {
        let upload_id = {
            let synced = self.synced.lock().unwrap();
            synced.upload_id.clone()
        }
        .ok_or_else(|| err::internal("prepare_abort", "no upload id"))?;
        request.message = Some(HttpRequestMessage::new(
            "DELETE",
            &format!("/{}?uploadId={}", self.core.key(), upload_id),
        ));
        Ok(())
    }

    /// Read one part's bytes. When resuming, bytes of parts the server
    /// already holds are first read and discarded, and each discarded
    /// part's checksum is re-computed and compared against the stored one.
    fn read_part_from_stream(&self, part_number: u32) -> Result<Vec<u8>, TransferError> {
        let stored_checksums = {
            let synced = self.synced.lock().unwrap();
            synced.checksums.clone()
        };
        let algorithm = self.core.checksum_algorithm();
        let mut body = self.body.lock().unwrap();
        while body.parts_read + 1 < part_number {
            let skipped = body.parts_read + 1;
            let data = read_exact_part(&mut body.stream, self.part_len(skipped), skipped)?;
            if algorithm != ChecksumAlgorithm::None {
                let expected = stored_checksums
                    .get((skipped - 1) as usize)
                    .and_then(|c| c.as_deref())
                    .filter(|c| !c.is_empty());
                if let Some(expected) = expected {
                    let actual = checksum::compute(algorithm, &data);
                    if actual.as_deref() != Some(expected) {
                        return Err(TransferError::new(
                            ErrorKind::ResumedPartChecksumMismatch,
                            "prepare_upload_part",
                            format!("resumed part {} does not match its uploaded checksum", skipped),
                        ));
                    }
                }
            }
            body.parts_read = skipped;
        }
        let data = read_exact_part(&mut body.stream, self.part_len(part_number), part_number)?;
        body.parts_read = part_number;
        Ok(data)
    }

    fn finished_list_parts(&self, request: &Request, error: Option<TransferError>) {
        if let Some(error) = error {
            let mut synced = self.synced.lock().unwrap();
            synced.list_parts.completed = true;
            synced.list_parts.error = Some(error.kind());
            drop(synced);
            self.set_fail(error);
            return;
        }
        let body = String::from_utf8_lossy(&request.response_body).into_owned();
        let page = match parse_list_parts_page(&body, self.core.checksum_algorithm(), self.total_num_parts)
        {
            Ok(page) => page,
            Err(error) => {
                let mut synced = self.synced.lock().unwrap();
                synced.list_parts.completed = true;
                synced.list_parts.error = Some(error.kind());
                drop(synced);
                self.set_fail(error);
                return;
            }
        };
        let mut synced = self.synced.lock().unwrap();
        for entry in page.parts {
            let slot = (entry.part_number - 1) as usize;
            synced.etags[slot] = Some(entry.etag);
            if let Some(digest) = entry.checksum {
                synced.checksums[slot] = Some(digest);
            }
        }
        match page.next_marker {
            Some(marker) => {
                // Another page: rearm the phase with the new marker.
                synced.list_parts_marker = Some(marker);
                synced.list_parts.sent = false;
            }
            None => {
                let mut recovered_bytes = 0u64;
                for part_number in 1..=self.total_num_parts {
                    if synced.etags[(part_number - 1) as usize].is_some() {
                        synced.num_parts_sent += 1;
                        synced.num_parts_completed += 1;
                        synced.num_parts_successful += 1;
                        recovered_bytes += self.part_len(part_number) as u64;
                    }
                }
                synced.bytes_transferred += recovered_bytes;
                synced.list_parts.completed = true;
                synced.create_mpu.sent = true;
                synced.create_mpu.completed = true;
                log(&format!(
                    "resume of {}/{}: server already has {} of {} parts",
                    self.core.host(),
                    self.core.key(),
                    synced.num_parts_successful,
                    self.total_num_parts
                ));
            }
        }
    }

    fn finished_create(&self, request: &Request, error: Option<TransferError>) {
        if let Some(error) = error {
            let mut synced = self.synced.lock().unwrap();
            synced.create_mpu.completed = true;
            synced.create_mpu.error = Some(error.kind());
            drop(synced);
            self.set_fail(error);
            return;
        }
        let body = String::from_utf8_lossy(&request.response_body);
        let upload_id = xml::top_level_tag(&body, "UploadId").map(str::trim).filter(|s| !s.is_empty());
        let Some(upload_id) = upload_id else {
            let error = TransferError::new(
                ErrorKind::MissingUploadId,
                "create_multipart_upload",
                "response carried no UploadId",
            );
            let mut synced = self.synced.lock().unwrap();
            synced.create_mpu.completed = true;
            synced.create_mpu.error = Some(error.kind());
            drop(synced);
            self.set_fail(error);
            return;
        };
        let mut synced = self.synced.lock().unwrap();
        synced.upload_id = Some(upload_id.to_string());
        for name in NEEDED_RESPONSE_HEADERS {
            if let Some(value) = request.response_headers.get(name) {
                synced.needed_response_headers.set(name, value);
            }
        }
        synced.create_mpu.completed = true;
        log(&format!(
            "created multipart upload {} for {}/{}",
            upload_id,
            self.core.host(),
            self.core.key()
        ));
    }

    fn finished_part(&self, request: &Request, error: Option<TransferError>) {
        let progress = {
            let mut synced = self.synced.lock().unwrap();
            synced.num_parts_completed += 1;
            match error {
                Some(error) => {
                    synced.num_parts_failed += 1;
                    drop(synced);
                    self.set_fail(error);
                    None
                }
                None => {
                    let etag = request
                        .response_headers
                        .get("ETag")
                        .map(strip_etag_quotes)
                        .filter(|e| !e.is_empty());
                    match etag {
                        Some(etag) => {
                            synced.num_parts_successful += 1;
                            synced.etags[(request.part_number - 1) as usize] = Some(etag.to_string());
                            synced.bytes_transferred += request.body.len() as u64;
                            Some(synced.bytes_transferred)
                        }
                        None => {
                            synced.num_parts_failed += 1;
                            drop(synced);
                            self.set_fail(err::internal(
                                "upload_part",
                                format!("part {} response missing ETag", request.part_number),
                            ));
                            None
                        }
                    }
                }
            }
        };
        if let Some(bytes_transferred) = progress {
            self.core.invoke_progress_callback(bytes_transferred, self.content_length);
        }
    }

    fn finished_complete(&self, request: &Request, error: Option<TransferError>) {
        if let Some(error) = error {
            let mut synced = self.synced.lock().unwrap();
            synced.complete_mpu.completed = true;
            synced.complete_mpu.error = Some(error.kind());
            drop(synced);
            self.set_fail(error);
            return;
        }
        let final_headers = {
            let mut synced = self.synced.lock().unwrap();
            synced.complete_mpu.completed = true;
            let mut headers = request.response_headers.clone();
            headers.merge(&synced.needed_response_headers);
            let body = String::from_utf8_lossy(&request.response_body);
            if let Some(etag) = xml::top_level_tag(&body, "ETag") {
                headers.set("ETag", &xml::unescape_entities(etag.trim()));
            }
            headers
        };
        self.core.invoke_headers_callback(&final_headers, request.response_status);
        self.core
            .set_finish_result(TransferResult::success(Some(request.response_status)));
        log(&format!(
            "completed multipart upload of {}/{} ({} parts)",
            self.core.host(),
            self.core.key(),
            self.total_num_parts
        ));
    }

    fn finished_abort(&self, _request: &Request, error: Option<TransferError>) {
        let mut synced = self.synced.lock().unwrap();
        synced.abort_mpu.completed = true;
        if let Some(error) = error {
            // The transfer already has its finish result; just record it.
            synced.abort_mpu.error = Some(error.kind());
        }
    }
}

impl Transfer for MultipartPut {
    fn core(&self) -> &Arc<TransferCore> {
        &self.core
    }

    fn update(&self, flags: UpdateFlags) -> UpdateOutcome {
        if let Some(result) = self.core.finish_result() {
            return self.update_after_finish(&result);
        }
        let mut synced = self.synced.lock().unwrap();
        if self.resumed && !synced.list_parts.completed {
            if !synced.list_parts.sent {
                synced.list_parts.sent = true;
                return UpdateOutcome::work(Request::new(RequestTag::ListParts, 0));
            }
            return UpdateOutcome::waiting();
        }
        if !synced.create_mpu.completed {
            if !synced.create_mpu.sent {
                synced.create_mpu.sent = true;
                return UpdateOutcome::work(
                    Request::new(RequestTag::CreateMultipartUpload, 0).with_recorded_headers(),
                );
            }
            return UpdateOutcome::waiting();
        }
        if synced.num_parts_sent < self.total_num_parts {
            // Upload streams are read strictly serially; under pressure,
            // one part in flight at a time is enough.
            if flags.conservative && synced.num_parts_sent > synced.num_parts_completed {
                return UpdateOutcome::waiting();
            }
            let mut threaded = self.threaded.lock().unwrap();
            let mut part_number = threaded.next_part_number.max(1);
            while part_number <= self.total_num_parts
                && synced.etags[(part_number - 1) as usize].is_some()
            {
                part_number += 1;
            }
            if part_number <= self.total_num_parts {
                threaded.next_part_number = part_number + 1;
                synced.num_parts_sent += 1;
                return UpdateOutcome::work(Request::new(RequestTag::UploadPart, part_number));
            }
            return UpdateOutcome::waiting();
        }
        if synced.num_parts_completed < self.total_num_parts {
            return UpdateOutcome::waiting();
        }
        if !synced.complete_mpu.completed {
            if !synced.complete_mpu.sent {
                synced.complete_mpu.sent = true;
                return UpdateOutcome::work(
                    Request::new(RequestTag::CompleteMultipartUpload, 0).with_recorded_headers(),
                );
            }
            return UpdateOutcome::waiting();
        }
        UpdateOutcome::done()
    }

    fn prepare_request(&self, request: &mut Request) -> Result<(), TransferError> {
        match request.tag {
            RequestTag::ListParts => self.prepare_list_parts(request)?,
            RequestTag::CreateMultipartUpload => self.prepare_create(request)?,
            RequestTag::UploadPart => self.prepare_part(request)?,
            RequestTag::CompleteMultipartUpload => self.prepare_complete(request)?,
            RequestTag::AbortMultipartUpload => self.prepare_abort(request)?,
        }
        request.num_times_prepared += 1;
        Ok(())
    }

    fn finished_request(&self, request: Request, error: Option<TransferError>) {
        match request.tag {
            RequestTag::ListParts => self.finished_list_parts(&request, error),
            RequestTag::CreateMultipartUpload => self.finished_create(&request, error),
            RequestTag::UploadPart => self.finished_part(&request, error),
            RequestTag::CompleteMultipartUpload => self.finished_complete(&request, error),
            RequestTag::AbortMultipartUpload => self.finished_abort(&request, error),
        }
    }

    fn pause(&self) -> Result<Option<ResumeToken>, TransferError> {
        MultipartPut::pause(self)
    }
}

struct ListedPart {
    part_number: u32,
    etag: String,
    checksum: Option<String>,
}

struct ListPartsPage {
    parts: Vec<ListedPart>,
    next_marker: Option<String>,
}

fn parse_list_parts_page(
    body: &str,
    algorithm: ChecksumAlgorithm,
    total_num_parts: u32,
) -> Result<ListPartsPage, TransferError> {
    let parse_error = |detail: String| {
        TransferError::new(ErrorKind::ListPartsParseFailed, "list_parts", detail)
    };
    if xml::root_inner(body).is_none() {
        return Err(parse_error("response is not an XML document".to_string()));
    }
    let mut parts = Vec::new();
    for fragment in xml::top_level_tags(body, "Part") {
        let number_text = xml::child(fragment, "PartNumber")
            .ok_or_else(|| parse_error("part entry missing PartNumber".to_string()))?;
        let part_number: u32 = number_text
            .trim()
            .parse()
            .map_err(|_| parse_error(format!("bad PartNumber {:?}", number_text)))?;
        if part_number == 0 || part_number > total_num_parts {
            return Err(parse_error(format!(
                "PartNumber {} outside 1..={}",
                part_number, total_num_parts
            )));
        }
        let etag_raw = xml::child(fragment, "ETag")
            .ok_or_else(|| parse_error(format!("part {} missing ETag", part_number)))?;
        let etag = strip_etag_quotes(&xml::unescape_entities(etag_raw)).to_string();
        if etag.is_empty() {
            return Err(parse_error(format!("part {} has empty ETag", part_number)));
        }
        let checksum = algorithm
            .xml_tag()
            .and_then(|tag| xml::child(fragment, tag))
            .map(|digest| digest.trim().to_string())
            .filter(|digest| !digest.is_empty());
        parts.push(ListedPart { part_number, etag, checksum });
    }
    let truncated = xml::top_level_tag(body, "IsTruncated")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let next_marker = if truncated {
        let marker = xml::top_level_tag(body, "NextPartNumberMarker")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| parse_error("truncated page without NextPartNumberMarker".to_string()))?;
        Some(marker)
    } else {
        None
    };
    Ok(ListPartsPage { parts, next_marker })
}

fn build_complete_xml(
    etags: &[Option<String>],
    checksums: &[Option<String>],
    algorithm: ChecksumAlgorithm,
) -> Result<String, TransferError> {
    let mut out = String::from("<CompleteMultipartUpload>\n");
    for (index, etag) in etags.iter().enumerate() {
        let etag = etag.as_ref().ok_or_else(|| {
            err::internal("prepare_complete", format!("part {} has no ETag", index + 1))
        })?;
        out.push_str("  <Part>\n");
        out.push_str(&format!("    <PartNumber>{}</PartNumber>\n", index + 1));
        out.push_str(&format!("    <ETag>{}</ETag>\n", xml::escape_text(etag)));
        if let Some(tag) = algorithm.xml_tag() {
            if let Some(digest) = checksums.get(index).and_then(|c| c.as_deref()) {
                out.push_str(&format!("    <{}>{}</{}>\n", tag, digest, tag));
            }
        }
        out.push_str("  </Part>\n");
    }
    out.push_str("</CompleteMultipartUpload>");
    Ok(out)
}

fn read_exact_part(
    stream: &mut (dyn Read + Send),
    len: usize,
    part_number: u32,
) -> Result<Vec<u8>, TransferError> {
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).map_err(|e| {
        err::internal(
            "read_body_stream",
            format!("reading part {}: {}", part_number, e),
        )
    })?;
    Ok(data)
}
