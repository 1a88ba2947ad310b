//! Structured error handling for sluice transfers.
//! One error type carries the failure kind, the operation that raised it,
//! and the HTTP response status when one was observed.

use std::fmt;

/// Failure classification. Kinds are compared when deciding lifecycle
/// behavior (e.g. `Paused` and `ResumeFailed` suppress the server-side
/// abort of an in-progress multipart upload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-supplied options or token failed validation.
    InvalidArgument,
    /// CreateMultipartUpload response carried no `<UploadId>`.
    MissingUploadId,
    /// ListParts response body could not be parsed.
    ListPartsParseFailed,
    /// A resumed part's re-computed checksum differs from the stored one.
    ResumedPartChecksumMismatch,
    /// Resuming from a token failed; the server-side upload is left intact.
    ResumeFailed,
    /// The transfer was paused; the server-side upload is left intact.
    Paused,
    /// The transfer was canceled by the caller.
    Canceled,
    /// The server answered with a non-success HTTP status.
    Http,
    /// Unexpected I/O or internal failure.
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::MissingUploadId => "missing_upload_id",
            ErrorKind::ListPartsParseFailed => "list_parts_parse_failed",
            ErrorKind::ResumedPartChecksumMismatch => "resumed_part_checksum_mismatch",
            ErrorKind::ResumeFailed => "resume_failed",
            ErrorKind::Paused => "paused",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Http => "http",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error for all transfer operations.
#[derive(Debug, Clone)]
pub struct TransferError {
    kind: ErrorKind,
    operation: String,
    detail: String,
    response_status: Option<u16>,
}

impl TransferError {
    pub fn new(kind: ErrorKind, operation: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.to_string(),
            detail: detail.into(),
            response_status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.response_status = Some(status);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn response_status(&self) -> Option<u16> {
        self.response_status
    }

    /// True for failures after which the server-side multipart state must
    /// be left in place: pause, and both resume-failure kinds.
    pub fn suppresses_abort(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Paused | ErrorKind::ResumeFailed | ErrorKind::ResumedPartChecksumMismatch
        )
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error in {}: {}", self.kind.name(), self.operation, self.detail)?;
        if let Some(status) = self.response_status {
            write!(f, " (status: {})", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransferError {}

/// Constructor helpers for the common error patterns.
pub mod utils {
    use super::*;

    pub fn invalid_argument(operation: &str, detail: impl Into<String>) -> TransferError {
        TransferError::new(ErrorKind::InvalidArgument, operation, detail)
    }

    pub fn internal(operation: &str, detail: impl Into<String>) -> TransferError {
        TransferError::new(ErrorKind::Internal, operation, detail)
    }

    pub fn io_error(operation: &str, source: std::io::Error) -> TransferError {
        TransferError::new(ErrorKind::Internal, operation, source.to_string())
    }

    pub fn http_error(operation: &str, status: u16) -> TransferError {
        TransferError::new(ErrorKind::Http, operation, format!("HTTP {}", status)).with_status(status)
    }

    pub fn transport_error(operation: &str, detail: impl Into<String>) -> TransferError {
        TransferError::new(ErrorKind::Http, operation, detail)
    }

    pub fn paused(operation: &str) -> TransferError {
        TransferError::new(ErrorKind::Paused, operation, "transfer paused")
    }

    pub fn canceled(operation: &str) -> TransferError {
        TransferError::new(ErrorKind::Canceled, operation, "transfer canceled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_status() {
        let err = utils::http_error("upload_part", 503);
        let text = err.to_string();
        assert!(text.contains("upload_part"));
        assert!(text.contains("503"));
        assert_eq!(err.kind(), ErrorKind::Http);
    }

    #[test]
    fn test_abort_suppression_kinds() {
        assert!(utils::paused("pause").suppresses_abort());
        let resume = TransferError::new(ErrorKind::ResumeFailed, "resume", "bad token");
        assert!(resume.suppresses_abort());
        let mismatch =
            TransferError::new(ErrorKind::ResumedPartChecksumMismatch, "prepare", "part 1");
        assert!(mismatch.suppresses_abort());
        assert!(!utils::canceled("cancel").suppresses_abort());
        assert!(!utils::http_error("create", 500).suppresses_abort());
    }
}
