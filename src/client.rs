//! The transfer client: endpoint table, admission control, and the
//! process-work task driving every transfer through
//! update → prepare → send → finish.
//!
//! Mutable client state is split two ways. `synced` is guarded by the
//! client lock and may be touched from any thread. `threaded` belongs to
//! the scheduler: every access happens on loop 0 of the request group, so
//! its mutex is never contended; it exists to satisfy the borrow checker,
//! not other threads.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, EndpointEntry};
use crate::error_handling::{utils as err, TransferError};
use crate::event_loop::{EventLoopGroup, EventLoopHandle};
use crate::host::{DefaultHostResolver, HostResolver};
use crate::http::{
    Connector, EndpointOptions, HttpConnection, HttpConnectionManager, NoopSigner, RequestSigner,
    UreqConnector,
};
use crate::request::{Request, RequestTag};
use crate::retry::{RetryDecision, RetryStrategy, StandardRetryStrategy};
use crate::transfer::ranged_put::{MultipartPut, PutOptions};
use crate::transfer::{Transfer, TransferKind, TransferResult, UpdateFlags};
use crate::utils::log;

/// Connections one virtual IP is worth, per transfer kind.
fn connections_per_vip(kind: TransferKind) -> usize {
    match kind {
        TransferKind::MultipartPut => 10,
    }
}

/// A request traveling the pipeline together with its owning transfer.
struct WorkItem {
    transfer: Arc<dyn Transfer>,
    request: Request,
    /// Requeue at the front (retries) instead of the back.
    front: bool,
}

enum FinishCode {
    Success,
    Failed,
    Retry(Duration),
}

#[derive(Default)]
struct ClientStats {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    requests_retried: AtomicU64,
    bytes_uploaded: AtomicU64,
    requests_network_io: AtomicUsize,
}

/// Point-in-time view of the client's counters.
#[derive(Debug, Clone, Default)]
pub struct ClientStatsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub requests_retried: u64,
    pub bytes_uploaded: u64,
    pub requests_network_io: usize,
}

struct ClientSynced {
    endpoints: HashMap<String, EndpointEntry>,
    pending_transfers: Vec<Arc<dyn Transfer>>,
    prepared_requests: Vec<WorkItem>,
    retry_requests: Vec<WorkItem>,
    process_work_scheduled: bool,
    active: bool,
    start_destroy_executing: bool,
    finish_destroy: bool,
    num_endpoints_allocated: u64,
    num_failed_prepares: u64,
}

/// Scheduler-loop-only state.
struct ClientThreaded {
    transfers: Vec<Arc<dyn Transfer>>,
    request_queue: VecDeque<WorkItem>,
    num_requests_being_prepared: usize,
}

pub(crate) struct ClientImpl {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    retry_strategy: Arc<dyn RetryStrategy>,
    signer: Arc<dyn RequestSigner>,
    resolver: Arc<dyn HostResolver>,
    /// Loop 0 of the request group; all scheduler work is pinned here.
    scheduler: EventLoopHandle,
    /// Remaining request-group loops; sends run here.
    senders: Vec<EventLoopHandle>,
    next_sender: AtomicUsize,
    delivery_handles: Vec<EventLoopHandle>,
    next_delivery: AtomicUsize,
    groups: Mutex<Option<(EventLoopGroup, EventLoopGroup)>>,
    synced: Mutex<ClientSynced>,
    destroy_cv: Condvar,
    threaded: Mutex<ClientThreaded>,
    stats: ClientStats,
}

/// Cheap-to-clone handle on the transfer engine.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientImpl>,
}

impl Client {
    /// Client with the production collaborators: pooled `ureq` transport,
    /// standard retry strategy, anonymous signing, system DNS.
    pub fn new(config: ClientConfig) -> Result<Self, TransferError> {
        Self::with_collaborators(
            config,
            Arc::new(UreqConnector),
            Arc::new(StandardRetryStrategy::new()),
            Arc::new(NoopSigner),
            Arc::new(DefaultHostResolver),
        )
    }

    /// Client with explicit collaborators (tests, custom transports,
    /// real signers).
    pub fn with_collaborators(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        retry_strategy: Arc<dyn RetryStrategy>,
        signer: Arc<dyn RequestSigner>,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        let request_group = EventLoopGroup::new(config.request_loop_threads);
        let delivery_group = EventLoopGroup::new(config.delivery_loop_threads);
        let scheduler = request_group.handle(0);
        let senders: Vec<EventLoopHandle> =
            (1..request_group.len()).map(|i| request_group.handle(i)).collect();
        let delivery_handles: Vec<EventLoopHandle> =
            (0..delivery_group.len()).map(|i| delivery_group.handle(i)).collect();
        let inner = Arc::new(ClientImpl {
            config,
            connector,
            retry_strategy,
            signer,
            resolver,
            scheduler,
            senders,
            next_sender: AtomicUsize::new(0),
            delivery_handles,
            next_delivery: AtomicUsize::new(0),
            groups: Mutex::new(Some((request_group, delivery_group))),
            synced: Mutex::new(ClientSynced {
                endpoints: HashMap::new(),
                pending_transfers: Vec::new(),
                prepared_requests: Vec::new(),
                retry_requests: Vec::new(),
                process_work_scheduled: false,
                active: true,
                start_destroy_executing: false,
                finish_destroy: false,
                num_endpoints_allocated: 0,
                num_failed_prepares: 0,
            }),
            destroy_cv: Condvar::new(),
            threaded: Mutex::new(ClientThreaded {
                transfers: Vec::new(),
                request_queue: VecDeque::new(),
                num_requests_being_prepared: 0,
            }),
            stats: ClientStats::default(),
        });
        Ok(Client { inner })
    }

    /// Submit a multipart put. The returned handle exposes pause, cancel,
    /// and wait; progress arrives through the option callbacks.
    pub fn put_object(&self, options: PutOptions) -> Result<Arc<MultipartPut>, TransferError> {
        self.inner.put_object(options)
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.inner.stats_snapshot()
    }

    /// Stop accepting transfers, let everything in flight run to its
    /// terminal state, tear down endpoints and both loop groups.
    pub fn shutdown(&self) {
        self.inner.begin_shutdown();
        self.inner.wait_destroyed();
        self.inner.join_groups();
        log("client shut down");
    }
}

impl ClientImpl {
    fn put_object(self: &Arc<Self>, options: PutOptions) -> Result<Arc<MultipartPut>, TransferError> {
        {
            let synced = self.synced.lock().unwrap();
            if !synced.active {
                return Err(err::invalid_argument("put_object", "client is shutting down"));
            }
        }
        let put = MultipartPut::new(Arc::downgrade(self), &self.config, options)?;
        put.core().set_delivery_handle(self.next_delivery_handle());
        // The transfer holds one endpoint ref for its whole lifetime.
        self.acquire_endpoint(put.core().host());
        {
            let mut synced = self.synced.lock().unwrap();
            synced.pending_transfers.push(put.clone() as Arc<dyn Transfer>);
        }
        self.schedule_process_work();
        Ok(put)
    }

    fn stats_snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            requests_total: self.stats.requests_total.load(Ordering::Relaxed),
            requests_success: self.stats.requests_success.load(Ordering::Relaxed),
            requests_failed: self.stats.requests_failed.load(Ordering::Relaxed),
            requests_retried: self.stats.requests_retried.load(Ordering::Relaxed),
            bytes_uploaded: self.stats.bytes_uploaded.load(Ordering::Relaxed),
            requests_network_io: self.stats.requests_network_io.load(Ordering::Relaxed),
        }
    }

    fn next_sender(&self) -> EventLoopHandle {
        let index = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders[index % self.senders.len()].clone()
    }

    fn next_delivery_handle(&self) -> EventLoopHandle {
        let index = self.next_delivery.fetch_add(1, Ordering::Relaxed);
        self.delivery_handles[index % self.delivery_handles.len()].clone()
    }

    /// Admission ceiling: ideal VIPs (gated by what DNS advertises for
    /// the endpoint) times connections per VIP, clamped by the override.
    fn max_active_connections_for(&self, address_count: usize, kind: TransferKind) -> usize {
        let mut vips = self.config.ideal_vip_count();
        if address_count > 0 {
            vips = vips.min(address_count);
        }
        let ceiling = (vips * connections_per_vip(kind)).max(1);
        match self.config.max_active_connections_override {
            Some(cap) => ceiling.min(cap.max(1)),
            None => ceiling,
        }
    }

    fn max_requests_in_flight(&self) -> usize {
        self.max_active_connections_for(0, TransferKind::MultipartPut)
    }

    /// Preparation ceiling: double the send ceiling so body reads and
    /// checksumming overlap network I/O.
    fn max_requests_prepare(&self) -> usize {
        self.max_requests_in_flight() * 2
    }

    /// Mark work pending and enqueue the work task unless one already is.
    pub(crate) fn schedule_process_work(self: &Arc<Self>) {
        {
            let mut synced = self.synced.lock().unwrap();
            if synced.process_work_scheduled || synced.finish_destroy {
                return;
            }
            synced.process_work_scheduled = true;
        }
        let weak = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.process_work();
            }
        }));
        if !scheduled {
            let mut synced = self.synced.lock().unwrap();
            synced.process_work_scheduled = false;
        }
    }

    /// The work task. Single-threaded, cooperative, non-reentrant: drains
    /// the synced lists under the client lock, then runs the scheduling
    /// passes on `threaded` without it.
    fn process_work(self: &Arc<Self>) {
        let (new_transfers, prepared, retries) = {
            let mut synced = self.synced.lock().unwrap();
            synced.process_work_scheduled = false;
            (
                std::mem::take(&mut synced.pending_transfers),
                std::mem::take(&mut synced.prepared_requests),
                std::mem::take(&mut synced.retry_requests),
            )
        };
        let mut threaded = self.threaded.lock().unwrap();
        threaded.transfers.extend(new_transfers);
        Self::queue_requests_threaded(&mut threaded, prepared);
        for item in retries {
            self.dispatch_prepare(&mut threaded, item);
        }
        self.update_transfers_threaded(&mut threaded);
        self.update_connections_threaded(&mut threaded);
        let idle = threaded.transfers.is_empty()
            && threaded.request_queue.is_empty()
            && threaded.num_requests_being_prepared == 0
            && self.stats.requests_network_io.load(Ordering::SeqCst) == 0;
        drop(threaded);
        self.check_destroy(idle);
    }

    /// Append (or prepend, for retries) ready requests to the queue.
    fn queue_requests_threaded(threaded: &mut ClientThreaded, items: Vec<WorkItem>) {
        for item in items {
            if item.front {
                threaded.request_queue.push_front(item);
            } else {
                threaded.request_queue.push_back(item);
            }
        }
    }

    /// Round-robin the ongoing transfers, asking each for its next
    /// request until the pipeline budget is spent or no one has work.
    fn update_transfers_threaded(self: &Arc<Self>, threaded: &mut ClientThreaded) {
        let max_prepare = self.max_requests_prepare();
        let max_in_flight = self.max_requests_in_flight();
        let outstanding = |threaded: &ClientThreaded, stats: &ClientStats| {
            threaded.request_queue.len()
                + threaded.num_requests_being_prepared
                + stats.requests_network_io.load(Ordering::SeqCst)
        };
        let mut progressed = true;
        while progressed && outstanding(threaded, &self.stats) < max_prepare {
            progressed = false;
            let mut index = 0;
            while index < threaded.transfers.len() {
                if outstanding(threaded, &self.stats) >= max_prepare {
                    break;
                }
                let conservative = threaded.request_queue.len()
                    + threaded.num_requests_being_prepared
                    >= max_in_flight;
                let transfer = threaded.transfers[index].clone();
                let outcome = transfer.update(UpdateFlags { conservative });
                match outcome.request {
                    Some(request) => {
                        self.dispatch_prepare(
                            threaded,
                            WorkItem { transfer, request, front: false },
                        );
                        progressed = true;
                        index += 1;
                    }
                    None if !outcome.has_work => {
                        threaded.transfers.remove(index);
                        self.finish_transfer(transfer);
                        progressed = true;
                    }
                    None => index += 1,
                }
            }
        }
    }

    /// Run preparation asynchronously on the scheduler loop; completion
    /// lands in `synced.prepared_requests` and re-pokes the work task.
    fn dispatch_prepare(self: &Arc<Self>, threaded: &mut ClientThreaded, item: WorkItem) {
        threaded.num_requests_being_prepared += 1;
        let weak = Arc::downgrade(self);
        let scheduled = self.scheduler.schedule(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.run_prepare(item);
            }
        }));
        if !scheduled {
            threaded.num_requests_being_prepared -= 1;
        }
    }

    fn run_prepare(self: &Arc<Self>, mut item: WorkItem) {
        let result = if item.transfer.core().is_finish_result_set() && !item.request.always_send {
            Err(err::canceled(item.request.tag.operation_name()))
        } else {
            item.transfer.prepare_request(&mut item.request)
        };
        {
            let mut threaded = self.threaded.lock().unwrap();
            threaded.num_requests_being_prepared -= 1;
        }
        match result {
            Ok(()) => {
                let mut synced = self.synced.lock().unwrap();
                synced.prepared_requests.push(item);
            }
            Err(error) => {
                {
                    let mut synced = self.synced.lock().unwrap();
                    synced.num_failed_prepares += 1;
                }
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                let transfer = item.transfer.clone();
                transfer.finished_request(item.request, Some(error));
            }
        }
        self.schedule_process_work();
    }

    /// Match queued requests to endpoint connections within the admission
    /// ceiling, and hand each pairing to a sender loop.
    fn update_connections_threaded(self: &Arc<Self>, threaded: &mut ClientThreaded) {
        loop {
            let Some(item) = threaded.request_queue.pop_front() else { break };
            // A finished transfer's leftover requests are not sent, with
            // the abort's always-send as the exception.
            if item.transfer.core().is_finish_result_set() && !item.request.always_send {
                let transfer = item.transfer.clone();
                transfer.finished_request(item.request, Some(err::canceled("send")));
                continue;
            }
            let endpoint = self.acquire_endpoint(item.transfer.core().host());
            let ceiling = self
                .max_active_connections_for(endpoint.address_count(), item.transfer.core().kind());
            if self.stats.requests_network_io.load(Ordering::SeqCst) >= ceiling {
                self.release_endpoint(endpoint.host());
                threaded.request_queue.push_front(item);
                break;
            }
            match endpoint.manager().try_acquire() {
                Some(connection) => {
                    self.stats.requests_network_io.fetch_add(1, Ordering::SeqCst);
                    self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
                    let weak = Arc::downgrade(self);
                    let host = endpoint.host().to_string();
                    let scheduled = self.next_sender().schedule(Box::new(move || {
                        if let Some(client) = weak.upgrade() {
                            client.execute_request(host, connection, item);
                        }
                    }));
                    if !scheduled {
                        // Sender loops are gone; teardown owns cleanup.
                        self.stats.requests_network_io.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                None => {
                    self.release_endpoint(endpoint.host());
                    threaded.request_queue.push_front(item);
                    break;
                }
            }
        }
    }

    /// Send one prepared request on one acquired connection; classify the
    /// result with the retry strategy and feed the transfer's state
    /// machine. Runs on a sender loop, no client locks held.
    fn execute_request(
        self: &Arc<Self>,
        host: String,
        mut connection: Box<dyn HttpConnection>,
        mut item: WorkItem,
    ) {
        let operation = item.request.tag.operation_name();
        let mut reusable = true;
        let mut error: Option<TransferError> = None;

        match item.request.message.clone() {
            None => error = Some(err::internal(operation, "request was never prepared")),
            Some(mut message) => {
                if let Err(e) = item.transfer.sign(self.signer.as_ref(), &self.config.region, &mut message)
                {
                    error = Some(e);
                } else {
                    match connection.execute(&message, &item.request.body) {
                        Ok(response) => {
                            item.request.response_status = response.status;
                            item.request.response_headers = response.headers;
                            item.request.response_body = response.body;
                            if !(200..300).contains(&response.status) {
                                error = Some(err::http_error(operation, response.status));
                            }
                        }
                        Err(e) => {
                            reusable = false;
                            error = Some(e);
                        }
                    }
                }
            }
        }

        let mut token = item
            .request
            .retry_token
            .take()
            .unwrap_or_else(|| self.retry_strategy.acquire_token());
        let code = match error.as_ref() {
            None => {
                self.retry_strategy.on_success(&token);
                FinishCode::Success
            }
            Some(e) => match self.retry_strategy.on_failure(&mut token, e) {
                RetryDecision::Retry { delay } => FinishCode::Retry(delay),
                RetryDecision::Fail => FinishCode::Failed,
            },
        };
        item.request.retry_token = Some(token);

        if let Some(manager) = self.endpoint_manager(&host) {
            manager.release(connection, reusable);
        }
        self.stats.requests_network_io.fetch_sub(1, Ordering::SeqCst);
        self.notify_request_finished(host, item, code, error);
    }

    /// Completion signal from the HTTP layer: advance the owning
    /// transfer's state machine (or requeue a retry) and re-poke the
    /// scheduler.
    fn notify_request_finished(
        self: &Arc<Self>,
        host: String,
        mut item: WorkItem,
        code: FinishCode,
        error: Option<TransferError>,
    ) {
        match code {
            FinishCode::Success => {
                self.stats.requests_success.fetch_add(1, Ordering::Relaxed);
                if item.request.tag == RequestTag::UploadPart {
                    self.stats
                        .bytes_uploaded
                        .fetch_add(item.request.body.len() as u64, Ordering::Relaxed);
                }
                let transfer = item.transfer.clone();
                transfer.finished_request(item.request, None);
            }
            FinishCode::Failed => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                let transfer = item.transfer.clone();
                transfer.finished_request(item.request, error);
            }
            FinishCode::Retry(delay) => {
                self.stats.requests_retried.fetch_add(1, Ordering::Relaxed);
                log(&format!(
                    "retrying {} for {}/{} after {:?}",
                    item.request.tag.operation_name(),
                    host,
                    item.transfer.core().key(),
                    delay
                ));
                std::thread::sleep(delay);
                item.front = true;
                let mut synced = self.synced.lock().unwrap();
                synced.retry_requests.push(item);
                drop(synced);
            }
        }

        self.release_endpoint(&host);
        self.schedule_process_work();
    }

    fn finish_transfer(&self, transfer: Arc<dyn Transfer>) {
        transfer.core().dispatch_finish();
        self.release_endpoint(transfer.core().host());
    }

    /// Look up or create the endpoint for `host` and take one reference.
    /// The ref count only ever moves under the client lock.
    fn acquire_endpoint(&self, host: &str) -> Arc<Endpoint> {
        {
            let mut synced = self.synced.lock().unwrap();
            if let Some(entry) = synced.endpoints.get_mut(host) {
                entry.ref_count += 1;
                return entry.endpoint.clone();
            }
        }
        // Build the manager off-lock (DNS + agent construction), then
        // settle the race under the lock.
        let address_count = self.resolver.address_count(host);
        let options = EndpointOptions {
            max_connections: self
                .max_active_connections_for(address_count, TransferKind::MultipartPut),
            connect_timeout_ms: self.config.connect_timeout_ms,
            use_tls: self.config.use_tls,
            port: self.config.port,
            proxy: self.config.effective_proxy(),
        };
        let manager = self.connector.connection_manager(host, &options);
        let endpoint = Arc::new(Endpoint::new(host, manager, address_count));
        let mut synced = self.synced.lock().unwrap();
        if let Some(entry) = synced.endpoints.get_mut(host) {
            entry.ref_count += 1;
            return entry.endpoint.clone();
        }
        let mut entry = EndpointEntry::new(endpoint.clone());
        entry.ref_count = 1;
        synced.endpoints.insert(host.to_string(), entry);
        synced.num_endpoints_allocated += 1;
        endpoint
    }

    /// Drop one endpoint reference. Reaching zero removes the table entry
    /// in the same critical section; the manager shutdown happens after
    /// the lock is released.
    fn release_endpoint(&self, host: &str) {
        let removed = {
            let mut synced = self.synced.lock().unwrap();
            match synced.endpoints.get_mut(host) {
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count == 0 {
                        synced.endpoints.remove(host).map(|entry| entry.endpoint)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(endpoint) = removed {
            endpoint.manager().begin_shutdown();
        }
    }

    fn endpoint_manager(&self, host: &str) -> Option<Arc<dyn HttpConnectionManager>> {
        let synced = self.synced.lock().unwrap();
        synced.endpoints.get(host).map(|entry| entry.endpoint.manager().clone())
    }

    fn begin_shutdown(self: &Arc<Self>) {
        {
            let mut synced = self.synced.lock().unwrap();
            if synced.start_destroy_executing {
                return;
            }
            synced.start_destroy_executing = true;
            synced.active = false;
        }
        self.schedule_process_work();
    }

    fn wait_destroyed(&self) {
        let mut synced = self.synced.lock().unwrap();
        while !synced.finish_destroy {
            synced = self.destroy_cv.wait(synced).unwrap();
        }
    }

    fn check_destroy(&self, idle: bool) {
        let mut synced = self.synced.lock().unwrap();
        if synced.active || synced.finish_destroy {
            return;
        }
        if idle
            && synced.pending_transfers.is_empty()
            && synced.prepared_requests.is_empty()
            && synced.retry_requests.is_empty()
            && synced.endpoints.is_empty()
        {
            synced.finish_destroy = true;
            self.destroy_cv.notify_all();
        }
    }

    fn join_groups(&self) {
        let groups = self.groups.lock().unwrap().take();
        if let Some((mut request_group, mut delivery_group)) = groups {
            request_group.shutdown();
            delivery_group.shutdown();
        }
    }
}

impl Drop for ClientImpl {
    fn drop(&mut self) {
        // Without an explicit shutdown, stop the loops first, then fail
        // whatever was still queued so waiters wake.
        self.join_groups();
        let transfers: Vec<Arc<dyn Transfer>> = {
            let mut threaded = self.threaded.lock().unwrap();
            let mut list = std::mem::take(&mut threaded.transfers);
            drop(threaded);
            let mut synced = self.synced.lock().unwrap();
            list.extend(std::mem::take(&mut synced.pending_transfers));
            list
        };
        for transfer in transfers {
            transfer
                .core()
                .set_finish_result(TransferResult::failure(err::canceled("client_dropped")));
            transfer.core().run_finish();
        }
    }
}
