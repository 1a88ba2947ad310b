//! A single HTTP request driven on behalf of one transfer. Many requests
//! are created per transfer; each is prepared (body + message composed),
//! sent on an acquired connection, then handed back to the transfer's
//! finished hook together with its response buffers.

use crate::http::{Headers, HttpRequestMessage};
use crate::retry::RetryToken;

/// Which wire operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    ListParts,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
}

impl RequestTag {
    pub fn operation_name(&self) -> &'static str {
        match self {
            RequestTag::ListParts => "list_parts",
            RequestTag::CreateMultipartUpload => "create_multipart_upload",
            RequestTag::UploadPart => "upload_part",
            RequestTag::CompleteMultipartUpload => "complete_multipart_upload",
            RequestTag::AbortMultipartUpload => "abort_multipart_upload",
        }
    }
}

pub struct Request {
    pub tag: RequestTag,
    /// 1-based part number; 0 when the request is not a part upload.
    pub part_number: u32,
    /// Send even after the owning transfer has a finish result (abort).
    pub always_send: bool,
    pub record_response_headers: bool,
    /// Incremented by every preparation pass. A retried request keeps its
    /// body, so preparation skips the body-stream read when this is > 0.
    pub num_times_prepared: u32,
    pub body: Vec<u8>,
    pub message: Option<HttpRequestMessage>,
    pub response_status: u16,
    pub response_headers: Headers,
    pub response_body: Vec<u8>,
    pub retry_token: Option<RetryToken>,
}

impl Request {
    pub fn new(tag: RequestTag, part_number: u32) -> Self {
        Self {
            tag,
            part_number,
            always_send: false,
            record_response_headers: false,
            num_times_prepared: 0,
            body: Vec::new(),
            message: None,
            response_status: 0,
            response_headers: Headers::new(),
            response_body: Vec::new(),
            retry_token: None,
        }
    }

    pub fn with_always_send(mut self) -> Self {
        self.always_send = true;
        self
    }

    pub fn with_recorded_headers(mut self) -> Self {
        self.record_response_headers = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_defaults() {
        let request = Request::new(RequestTag::UploadPart, 3);
        assert_eq!(request.part_number, 3);
        assert_eq!(request.num_times_prepared, 0);
        assert!(!request.always_send);
        assert!(request.message.is_none());
    }

    #[test]
    fn test_abort_is_always_send() {
        let request = Request::new(RequestTag::AbortMultipartUpload, 0).with_always_send();
        assert!(request.always_send);
        assert_eq!(request.tag.operation_name(), "abort_multipart_upload");
    }
}
