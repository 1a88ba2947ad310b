//! Retry strategy collaborator. The standard strategy retries transport
//! failures, 429 and 5xx with exponential backoff plus jitter; counts and
//! base delay are tunable from the environment.

use std::time::Duration;

use crate::error_handling::{ErrorKind, TransferError};
use crate::utils::{env_u64, env_usize};

const DEFAULT_RETRY_COUNT: usize = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 5_000;

/// Per-request retry state, acquired before the first attempt.
#[derive(Debug, Clone)]
pub struct RetryToken {
    pub attempts: u32,
}

impl RetryToken {
    fn new() -> Self {
        Self { attempts: 0 }
    }
}

pub enum RetryDecision {
    Retry { delay: Duration },
    Fail,
}

pub trait RetryStrategy: Send + Sync {
    fn acquire_token(&self) -> RetryToken;
    fn on_success(&self, token: &RetryToken);
    /// Classify a failed attempt: retry after a delay, or surface it.
    fn on_failure(&self, token: &mut RetryToken, error: &TransferError) -> RetryDecision;
}

pub struct StandardRetryStrategy {
    max_retries: usize,
    base_backoff_ms: u64,
}

impl StandardRetryStrategy {
    pub fn new() -> Self {
        Self {
            max_retries: env_usize("SLUICE_HTTP_RETRIES", DEFAULT_RETRY_COUNT),
            base_backoff_ms: env_u64("SLUICE_HTTP_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS),
        }
    }

    pub fn with_limits(max_retries: usize, base_backoff_ms: u64) -> Self {
        Self { max_retries, base_backoff_ms }
    }

    fn is_retryable(error: &TransferError) -> bool {
        if error.kind() != ErrorKind::Http {
            return false;
        }
        match error.response_status() {
            // Transport-level failure with no response.
            None => true,
            Some(status) => status == 429 || status >= 500,
        }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(MAX_BACKOFF_MS);
        // Up to 25% jitter so synchronized retries fan out.
        let jitter_span = base / 4;
        let jitter = if jitter_span > 0 {
            rand::random::<u64>() % (jitter_span * 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

impl Default for StandardRetryStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStrategy for StandardRetryStrategy {
    fn acquire_token(&self) -> RetryToken {
        RetryToken::new()
    }

    fn on_success(&self, _token: &RetryToken) {}

    fn on_failure(&self, token: &mut RetryToken, error: &TransferError) -> RetryDecision {
        token.attempts += 1;
        if !Self::is_retryable(error) || token.attempts as usize > self.max_retries {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry { delay: self.backoff(token.attempts) }
    }
}
