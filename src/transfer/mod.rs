//! Shared transfer contract: the lifecycle, locking, ordered body
//! delivery, and finish plumbing every transfer variant builds on.
//!
//! Lock order is always client lock before transfer lock, and neither is
//! held while calling into the HTTP layer, user callbacks, or endpoint
//! release.

pub mod ranged_put;
pub mod resume;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::checksum::ChecksumAlgorithm;
use crate::error_handling::{utils as err, TransferError};
use crate::event_loop::EventLoopHandle;
use crate::http::{Headers, HttpRequestMessage, RequestSigner};
use crate::request::Request;
use crate::transfer::resume::ResumeToken;

/// Which transfer variant a handle drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    MultipartPut,
}

/// Scheduler hints passed to `update`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateFlags {
    /// The queue is already long enough; refrain from deep queuing.
    pub conservative: bool,
}

/// What `update` produced: the next request to drive, or nothing — with
/// `has_work` false meaning the transfer is done and should be finished.
pub struct UpdateOutcome {
    pub request: Option<Request>,
    pub has_work: bool,
}

impl UpdateOutcome {
    pub fn work(request: Request) -> Self {
        Self { request: Some(request), has_work: true }
    }

    pub fn waiting() -> Self {
        Self { request: None, has_work: true }
    }

    pub fn done() -> Self {
        Self { request: None, has_work: false }
    }
}

/// Final outcome handed to the finish callback, captured once and never
/// overwritten.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub error: Option<TransferError>,
    pub response_status: Option<u16>,
}

impl TransferResult {
    pub fn success(response_status: Option<u16>) -> Self {
        Self { error: None, response_status }
    }

    pub fn failure(error: TransferError) -> Self {
        let response_status = error.response_status();
        Self { error: Some(error), response_status }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub type HeadersCallback = Box<dyn Fn(&Headers, u16) + Send + Sync>;
pub type BodyCallback = Box<dyn Fn(u64, &[u8]) + Send + Sync>;
/// (bytes transferred so far, total content length)
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;
pub type FinishCallback = Box<dyn Fn(&TransferResult) + Send + Sync>;

#[derive(Default)]
pub struct TransferCallbacks {
    pub on_headers: Option<HeadersCallback>,
    pub on_body: Option<BodyCallback>,
    pub on_progress: Option<ProgressCallback>,
    pub on_finish: Option<FinishCallback>,
}

/// One ordered chunk awaiting delivery. The `Ord` impl is inverted so
/// the `BinaryHeap` behaves as a min-heap on (part number, offset).
struct DeliveryChunk {
    part_number: u32,
    offset: u64,
    data: Vec<u8>,
}

impl PartialEq for DeliveryChunk {
    fn eq(&self, other: &Self) -> bool {
        self.part_number == other.part_number && self.offset == other.offset
    }
}

impl Eq for DeliveryChunk {}

impl PartialOrd for DeliveryChunk {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeliveryChunk {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so BinaryHeap pops the smallest part first.
        (other.part_number, other.offset).cmp(&(self.part_number, self.offset))
    }
}

struct CoreSynced {
    finish_result: Option<TransferResult>,
    finish_dispatched: bool,
    finish_done: bool,
    delivery_queue: BinaryHeap<DeliveryChunk>,
    next_delivery_part: u32,
    /// Remaining flow-control window; `None` disables backpressure.
    read_window: Option<u64>,
    delivery_handle: Option<EventLoopHandle>,
    delivery_scheduled: bool,
}

/// State and plumbing shared by all transfer variants. Wrapped in an Arc
/// by each variant so delivery tasks can hold it directly.
pub struct TransferCore {
    kind: TransferKind,
    host: String,
    key: String,
    initial_headers: Headers,
    checksum_algorithm: ChecksumAlgorithm,
    callbacks: TransferCallbacks,
    synced: Mutex<CoreSynced>,
    finish_cv: Condvar,
}

impl TransferCore {
    pub fn new(
        kind: TransferKind,
        host: &str,
        key: &str,
        initial_headers: Headers,
        checksum_algorithm: ChecksumAlgorithm,
        callbacks: TransferCallbacks,
        initial_read_window: Option<u64>,
    ) -> Self {
        Self {
            kind,
            host: host.to_string(),
            key: key.to_string(),
            initial_headers,
            checksum_algorithm,
            callbacks,
            synced: Mutex::new(CoreSynced {
                finish_result: None,
                finish_dispatched: false,
                finish_done: false,
                delivery_queue: BinaryHeap::new(),
                next_delivery_part: 1,
                read_window: initial_read_window,
                delivery_handle: None,
                delivery_scheduled: false,
            }),
            finish_cv: Condvar::new(),
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn initial_headers(&self) -> &Headers {
        &self.initial_headers
    }

    pub fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.checksum_algorithm
    }

    /// Bind the loop user callbacks are delivered on. Set once at submit.
    pub(crate) fn set_delivery_handle(&self, handle: EventLoopHandle) {
        let mut synced = self.synced.lock().unwrap();
        synced.delivery_handle = Some(handle);
    }

    /// Record the terminal result. First writer wins; returns whether this
    /// call captured it.
    pub fn set_finish_result(&self, result: TransferResult) -> bool {
        let mut synced = self.synced.lock().unwrap();
        if synced.finish_result.is_some() {
            return false;
        }
        synced.finish_result = Some(result);
        true
    }

    pub fn finish_result(&self) -> Option<TransferResult> {
        self.synced.lock().unwrap().finish_result.clone()
    }

    pub fn is_finish_result_set(&self) -> bool {
        self.synced.lock().unwrap().finish_result.is_some()
    }

    /// Cancel: capture a canceled result unless one is already recorded.
    pub fn cancel(&self) -> bool {
        self.set_finish_result(TransferResult::failure(err::canceled("cancel")))
    }

    /// Queue a body chunk for in-order delivery and kick the drain task.
    pub fn deliver_body_chunk(self: &std::sync::Arc<Self>, part_number: u32, offset: u64, data: Vec<u8>) {
        {
            let mut synced = self.synced.lock().unwrap();
            synced.delivery_queue.push(DeliveryChunk { part_number, offset, data });
        }
        self.kick_delivery();
    }

    /// Widen the flow-control window and resume delivery.
    pub fn increment_read_window(self: &std::sync::Arc<Self>, bytes: u64) {
        {
            let mut synced = self.synced.lock().unwrap();
            if let Some(window) = synced.read_window.as_mut() {
                *window = window.saturating_add(bytes);
            }
        }
        self.kick_delivery();
    }

    /// Schedule one drain pass on the delivery loop; runs it inline when
    /// no loop is bound (tests, teardown) or the loop is gone.
    fn kick_delivery(self: &std::sync::Arc<Self>) {
        let handle = {
            let mut synced = self.synced.lock().unwrap();
            if synced.delivery_scheduled {
                return;
            }
            synced.delivery_scheduled = true;
            synced.delivery_handle.clone()
        };
        match handle {
            Some(handle) => {
                let core = self.clone();
                if !handle.schedule(Box::new(move || core.drain_delivery_queue())) {
                    self.drain_delivery_queue();
                }
            }
            None => self.drain_delivery_queue(),
        }
    }

    /// Pop every in-order chunk the window allows, then invoke the body
    /// callback off-lock for each.
    fn drain_delivery_queue(&self) {
        let mut ready = Vec::new();
        {
            let mut synced = self.synced.lock().unwrap();
            synced.delivery_scheduled = false;
            loop {
                let fits = match synced.delivery_queue.peek() {
                    Some(chunk) if chunk.part_number == synced.next_delivery_part => {
                        match synced.read_window {
                            Some(window) => chunk.data.len() as u64 <= window,
                            None => true,
                        }
                    }
                    _ => false,
                };
                if !fits {
                    break;
                }
                let Some(chunk) = synced.delivery_queue.pop() else { break };
                if let Some(window) = synced.read_window.as_mut() {
                    *window = window.saturating_sub(chunk.data.len() as u64);
                }
                synced.next_delivery_part += 1;
                ready.push(chunk);
            }
        }
        if let Some(on_body) = self.callbacks.on_body.as_ref() {
            for chunk in &ready {
                on_body(chunk.offset, &chunk.data);
            }
        }
    }

    pub(crate) fn invoke_headers_callback(&self, headers: &Headers, status: u16) {
        if let Some(on_headers) = self.callbacks.on_headers.as_ref() {
            on_headers(headers, status);
        }
    }

    pub(crate) fn invoke_progress_callback(&self, bytes_transferred: u64, content_length: u64) {
        if let Some(on_progress) = self.callbacks.on_progress.as_ref() {
            on_progress(bytes_transferred, content_length);
        }
    }

    /// Dispatch the finish callback on the delivery loop, exactly once.
    /// Falls back to running inline when no delivery loop is available.
    pub(crate) fn dispatch_finish(self: &std::sync::Arc<Self>) {
        let handle = {
            let mut synced = self.synced.lock().unwrap();
            if synced.finish_dispatched {
                return;
            }
            if synced.finish_result.is_none() {
                synced.finish_result = Some(TransferResult::success(None));
            }
            synced.finish_dispatched = true;
            synced.delivery_handle.clone()
        };
        match handle {
            Some(handle) => {
                let core = self.clone();
                if !handle.schedule(Box::new(move || core.run_finish())) {
                    self.run_finish();
                }
            }
            None => self.run_finish(),
        }
    }

    /// Run the finish callback inline. Used by `dispatch_finish` and by
    /// client teardown when the delivery loops are already gone.
    pub(crate) fn run_finish(&self) {
        // Anything still queued but deliverable goes out before finish.
        self.drain_delivery_queue();
        let result = self
            .synced
            .lock()
            .unwrap()
            .finish_result
            .clone()
            .unwrap_or_else(|| TransferResult::success(None));
        if let Some(on_finish) = self.callbacks.on_finish.as_ref() {
            on_finish(&result);
        }
        let mut synced = self.synced.lock().unwrap();
        synced.finish_done = true;
        self.finish_cv.notify_all();
    }

    /// Block until the finish callback has run. Returns the result, or
    /// `None` on timeout.
    pub fn wait_for_finish(&self, timeout: Duration) -> Option<TransferResult> {
        let mut synced = self.synced.lock().unwrap();
        while !synced.finish_done {
            let (guard, wait) = self.finish_cv.wait_timeout(synced, timeout).unwrap();
            synced = guard;
            if wait.timed_out() && !synced.finish_done {
                return None;
            }
        }
        synced.finish_result.clone()
    }
}

/// The variant seam. A transfer produces requests via `update`, fills
/// their bodies and messages in `prepare_request`, and advances its state
/// machine in `finished_request`. Defaults cover signing and pause.
pub trait Transfer: Send + Sync {
    fn core(&self) -> &std::sync::Arc<TransferCore>;

    /// Produce the next request under the transfer lock, or report
    /// "waiting" / "done". Never blocks.
    fn update(&self, flags: UpdateFlags) -> UpdateOutcome;

    /// Compose body bytes and the HTTP message. Runs off-lock on the
    /// scheduler loop; may read the body stream and compute checksums.
    fn prepare_request(&self, request: &mut Request) -> Result<(), TransferError>;

    /// Advance state from a completed request (success or terminal
    /// failure after retries). Invoked off-lock; takes the transfer lock
    /// internally.
    fn finished_request(&self, request: Request, error: Option<TransferError>);

    /// Timestamp requests are signed with.
    fn signing_time(&self) -> std::time::SystemTime {
        std::time::SystemTime::now()
    }

    /// Apply the signing hook to an outgoing message.
    fn sign(
        &self,
        signer: &dyn RequestSigner,
        region: &str,
        message: &mut HttpRequestMessage,
    ) -> Result<(), TransferError> {
        signer.sign(message, region, self.signing_time())
    }

    /// Capture a resume token and halt. Variants without resume support
    /// reject.
    fn pause(&self) -> Result<Option<ResumeToken>, TransferError> {
        Err(err::invalid_argument("pause", "transfer kind does not support pause"))
    }
}
