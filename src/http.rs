//! HTTP layer seam. The scheduler only ever talks to the traits here;
//! the production implementation rides one `ureq::Agent` per endpoint for
//! connection reuse, with a Condvar-guarded slot count capping concurrent
//! requests per endpoint. Tests substitute scripted connectors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error_handling::{utils as err, TransferError};

/// Header list with case-insensitive lookup, preserving insertion order.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// Replace any existing header of the same name.
    pub fn set(&mut self, name: &str, value: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.add(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Copy every header from `other`, replacing same-named entries.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A composed HTTP request line plus headers; the body travels separately
/// in the owning request's buffer so retries reuse it without copying.
#[derive(Debug, Clone)]
pub struct HttpRequestMessage {
    pub method: String,
    /// Path plus query string, starting with '/'.
    pub path_and_query: String,
    pub headers: Headers,
}

impl HttpRequestMessage {
    pub fn new(method: &str, path_and_query: &str) -> Self {
        Self {
            method: method.to_string(),
            path_and_query: path_and_query.to_string(),
            headers: Headers::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One live connection executing one request at a time.
pub trait HttpConnection: Send {
    fn execute(&mut self, message: &HttpRequestMessage, body: &[u8]) -> Result<HttpResponse, TransferError>;
}

/// Per-endpoint pool of connections. `try_acquire` is non-blocking; the
/// scheduler's admission ceiling keeps demand at or below capacity.
pub trait HttpConnectionManager: Send + Sync {
    fn try_acquire(&self) -> Option<Box<dyn HttpConnection>>;
    /// Return a connection. `reusable` is false after transport errors.
    fn release(&self, connection: Box<dyn HttpConnection>, reusable: bool);
    fn begin_shutdown(&self);
    /// True once shutdown was requested and no connection is outstanding.
    fn is_shut_down(&self) -> bool;
}

/// Factory producing one connection manager per endpoint host.
pub trait Connector: Send + Sync {
    fn connection_manager(&self, host: &str, options: &EndpointOptions) -> Arc<dyn HttpConnectionManager>;
}

/// Settings an endpoint's connection manager is built with.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
    pub use_tls: bool,
    pub port: Option<u16>,
    pub proxy: Option<String>,
}

/// Signing hook applied to every request before it is sent. The
/// timestamp comes from the owning transfer (its signing-time hook).
pub trait RequestSigner: Send + Sync {
    fn sign(
        &self,
        message: &mut HttpRequestMessage,
        region: &str,
        timestamp: std::time::SystemTime,
    ) -> Result<(), TransferError>;
}

/// Default signer for anonymous access and tests.
pub struct NoopSigner;

impl RequestSigner for NoopSigner {
    fn sign(
        &self,
        _message: &mut HttpRequestMessage,
        _region: &str,
        _timestamp: std::time::SystemTime,
    ) -> Result<(), TransferError> {
        Ok(())
    }
}

/// ETag header values arrive wrapped in double quotes; stored values are
/// always unquoted.
pub fn strip_etag_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Counted connection slots capping concurrent requests per endpoint.
struct ConnectionSlots {
    in_use: Mutex<usize>,
    max: usize,
}

impl ConnectionSlots {
    fn new(max: usize) -> Self {
        Self {
            in_use: Mutex::new(0),
            max: max.max(1),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut in_use = self.in_use.lock().unwrap();
        if *in_use >= self.max {
            return false;
        }
        *in_use += 1;
        true
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock().unwrap();
        *in_use = in_use.saturating_sub(1);
    }

    fn none_in_use(&self) -> bool {
        *self.in_use.lock().unwrap() == 0
    }
}

/// Production connector: one pooled agent per endpoint.
pub struct UreqConnector;

impl Connector for UreqConnector {
    fn connection_manager(&self, host: &str, options: &EndpointOptions) -> Arc<dyn HttpConnectionManager> {
        Arc::new(UreqConnectionManager::new(host, options))
    }
}

const REQUEST_TIMEOUT_MS: u64 = 300_000;
const MAX_IDLE_PER_HOST: usize = 32;

pub struct UreqConnectionManager {
    agent: ureq::Agent,
    base_url: String,
    slots: ConnectionSlots,
    shutdown: AtomicBool,
}

impl UreqConnectionManager {
    pub fn new(host: &str, options: &EndpointOptions) -> Self {
        let mut builder = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(options.connect_timeout_ms))
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .max_idle_connections_per_host(MAX_IDLE_PER_HOST);
        if let Some(proxy) = options.proxy.as_deref() {
            match ureq::Proxy::new(proxy) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => crate::utils::log_error(&format!("ignoring bad proxy {}: {}", proxy, e)),
            }
        }
        let scheme = if options.use_tls { "https" } else { "http" };
        let base_url = match options.port {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };
        Self {
            agent: builder.build(),
            base_url,
            slots: ConnectionSlots::new(options.max_connections),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl HttpConnectionManager for UreqConnectionManager {
    fn try_acquire(&self) -> Option<Box<dyn HttpConnection>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        if !self.slots.try_acquire() {
            return None;
        }
        Some(Box::new(UreqConnection {
            agent: self.agent.clone(),
            base_url: self.base_url.clone(),
        }))
    }

    fn release(&self, _connection: Box<dyn HttpConnection>, _reusable: bool) {
        // The agent owns socket reuse; dropping the handle frees the slot.
        self.slots.release();
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) && self.slots.none_in_use()
    }
}

struct UreqConnection {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpConnection for UreqConnection {
    fn execute(&mut self, message: &HttpRequestMessage, body: &[u8]) -> Result<HttpResponse, TransferError> {
        let url = format!("{}{}", self.base_url, message.path_and_query);
        let mut request = self.agent.request(&message.method, &url);
        for (name, value) in message.headers.iter() {
            request = request.set(name, value);
        }
        let result = if body.is_empty() {
            request.call()
        } else {
            request.send_bytes(body)
        };
        let response = match result {
            Ok(resp) => resp,
            // Non-2xx is still a response the state machine classifies.
            Err(ureq::Error::Status(_, resp)) => resp,
            Err(e) => return Err(err::transport_error("http_execute", e.to_string())),
        };
        let status = response.status();
        let mut headers = Headers::new();
        for name in response.headers_names() {
            if let Some(value) = response.header(&name) {
                headers.add(&name, value);
            }
        }
        let hint = headers
            .get("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = Vec::with_capacity(if hint > 0 { hint } else { 16 * 1024 });
        use std::io::Read;
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| err::io_error("http_read_body", e))?;
        Ok(HttpResponse { status, headers, body })
    }
}
