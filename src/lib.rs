//! sluice: high-throughput transfer engine for S3-compatible object
//! stores. One logical upload becomes many concurrent HTTP requests over
//! pooled per-endpoint connections, scheduled on a single work loop, with
//! resumable checksummed multipart puts.

pub mod checksum;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error_handling;
pub mod event_loop;
pub mod host;
pub mod http;
pub mod request;
pub mod retry;
pub mod transfer;
pub mod utils;
pub mod xml;

// Re-export the main API surface.
pub use checksum::ChecksumAlgorithm;
pub use client::{Client, ClientStatsSnapshot};
pub use config::{ClientConfig, ProxyEnv, DEFAULT_PART_SIZE, MAX_PARTS, MIN_PART_SIZE};
pub use error_handling::{ErrorKind, TransferError};
pub use http::{Connector, Headers, HttpConnection, HttpConnectionManager, RequestSigner};
pub use retry::{RetryDecision, RetryStrategy, RetryToken, StandardRetryStrategy};
pub use transfer::ranged_put::{MultipartPut, PutOptions};
pub use transfer::resume::ResumeToken;
pub use transfer::{TransferCallbacks, TransferResult};
