//! Client configuration. CLI-less library: plain struct with defaults,
//! a few knobs overridable from the environment.

use std::env;

use crate::error_handling::{utils as err, TransferError};
use crate::utils::env_usize;

/// Default part size for multipart uploads (8 MiB).
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest part size the object store accepts for any part but the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest single part the object store accepts (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS: u32 = 10_000;

/// Estimated throughput one virtual IP of the store endpoint sustains.
const THROUGHPUT_PER_VIP_GBPS: f64 = 4.0;

/// Whether proxy settings may be picked up from the process environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEnv {
    Disabled,
    FromEnvironment,
}

/// Configuration for a [`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub region: String,
    /// Target aggregate throughput; drives the ideal virtual-IP estimate
    /// and with it the connection ceiling.
    pub throughput_target_gbps: f64,
    pub part_size: u64,
    pub max_part_size: u64,
    /// Add a Content-MD5 header to each uploaded part.
    pub compute_content_md5: bool,
    /// Hard cap on concurrent connections per transfer, overriding the
    /// throughput-derived ceiling.
    pub max_active_connections_override: Option<usize>,
    /// Flow-control window for ordered body delivery; `None` disables
    /// backpressure.
    pub initial_read_window: Option<u64>,
    pub connect_timeout_ms: u64,
    pub use_tls: bool,
    /// Port override; defaults to 443/80 depending on `use_tls`.
    pub port: Option<u16>,
    /// Explicit proxy URL. Takes precedence over `proxy_env`.
    pub proxy: Option<String>,
    pub proxy_env: ProxyEnv,
    /// Threads in the request event-loop group (loop 0 is the scheduler).
    pub request_loop_threads: usize,
    /// Threads in the delivery event-loop group (user callbacks).
    pub delivery_loop_threads: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            region: "us-east-1".to_string(),
            throughput_target_gbps: 10.0,
            part_size: DEFAULT_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            compute_content_md5: false,
            max_active_connections_override: None,
            initial_read_window: None,
            connect_timeout_ms: 10_000,
            use_tls: true,
            port: None,
            proxy: None,
            proxy_env: ProxyEnv::Disabled,
            request_loop_threads: env_usize("SLUICE_EVENT_LOOP_THREADS", (cpus + 1).clamp(2, 8)),
            delivery_loop_threads: env_usize("SLUICE_DELIVERY_THREADS", 2),
        }
    }
}

impl ClientConfig {
    /// Number of virtual IPs needed to reach the throughput target.
    pub fn ideal_vip_count(&self) -> usize {
        let vips = (self.throughput_target_gbps / THROUGHPUT_PER_VIP_GBPS).ceil();
        (vips as usize).max(1)
    }

    /// Explicit proxy, or the environment proxy when enabled.
    pub fn effective_proxy(&self) -> Option<String> {
        if self.proxy.is_some() {
            return self.proxy.clone();
        }
        if self.proxy_env == ProxyEnv::FromEnvironment {
            return env::var("HTTPS_PROXY")
                .or_else(|_| env::var("https_proxy"))
                .ok()
                .filter(|v| !v.is_empty());
        }
        None
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.part_size < MIN_PART_SIZE {
            return Err(err::invalid_argument(
                "client_config",
                format!("part_size {} below minimum {}", self.part_size, MIN_PART_SIZE),
            ));
        }
        if self.part_size > self.max_part_size {
            return Err(err::invalid_argument(
                "client_config",
                format!("part_size {} above max_part_size {}", self.part_size, self.max_part_size),
            ));
        }
        if self.throughput_target_gbps <= 0.0 {
            return Err(err::invalid_argument(
                "client_config",
                "throughput_target_gbps must be positive",
            ));
        }
        if self.request_loop_threads < 2 {
            return Err(err::invalid_argument(
                "client_config",
                "request_loop_threads must be at least 2 (scheduler + senders)",
            ));
        }
        Ok(())
    }
}
