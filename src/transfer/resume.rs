//! Pause/resume token: a small JSON object sufficient to reconstruct a
//! multipart put's progress in a later process. The wire shape is stable
//! across releases; do not rename fields.

use serde::{Deserialize, Serialize};

use crate::error_handling::{utils as err, TransferError};

/// Token `type` literal for multipart puts.
pub const PUT_RESUME_TOKEN_TYPE: &str = "AWS_S3_META_REQUEST_TYPE_PUT_OBJECT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    #[serde(rename = "type")]
    pub token_type: String,
    pub multipart_upload_id: String,
    pub partition_size: u64,
    pub total_num_parts: u32,
}

impl ResumeToken {
    pub fn for_put(upload_id: &str, partition_size: u64, total_num_parts: u32) -> Self {
        Self {
            token_type: PUT_RESUME_TOKEN_TYPE.to_string(),
            multipart_upload_id: upload_id.to_string(),
            partition_size,
            total_num_parts,
        }
    }

    pub fn to_json(&self) -> Result<String, TransferError> {
        serde_json::to_string(self)
            .map_err(|e| err::internal("resume_token_serialize", e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, TransferError> {
        serde_json::from_str(json)
            .map_err(|e| err::invalid_argument("resume_token_parse", e.to_string()))
    }

    /// Validate the token against a put of `content_length` bytes.
    pub fn validate_for_put(
        &self,
        content_length: u64,
        min_part_size: u64,
        max_parts: u32,
    ) -> Result<(), TransferError> {
        if self.token_type != PUT_RESUME_TOKEN_TYPE {
            return Err(err::invalid_argument(
                "resume_token",
                format!("unexpected token type {:?}", self.token_type),
            ));
        }
        if self.multipart_upload_id.is_empty() {
            return Err(err::invalid_argument("resume_token", "empty multipart_upload_id"));
        }
        if self.partition_size < min_part_size {
            return Err(err::invalid_argument(
                "resume_token",
                format!(
                    "partition_size {} below minimum part size {}",
                    self.partition_size, min_part_size
                ),
            ));
        }
        if self.total_num_parts > max_parts {
            return Err(err::invalid_argument(
                "resume_token",
                format!("total_num_parts {} above maximum {}", self.total_num_parts, max_parts),
            ));
        }
        let implied = content_length.div_ceil(self.partition_size).max(1);
        if implied != u64::from(self.total_num_parts) {
            return Err(err::invalid_argument(
                "resume_token",
                format!(
                    "content length {} with partition_size {} implies {} parts, token says {}",
                    content_length, self.partition_size, implied, self.total_num_parts
                ),
            ));
        }
        Ok(())
    }
}
