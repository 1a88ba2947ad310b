//! Per-part checksums and content-MD5.
//! Digests travel base64-encoded, in the `x-amz-checksum-*` request headers
//! and the matching elements of the CompleteMultipartUpload XML.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Pluggable per-part checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    None,
    Crc32,
    Crc32c,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::None => "none",
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Crc32c => "crc32c",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Request/response header carrying this checksum, if any.
    pub fn header_name(&self) -> Option<&'static str> {
        match self {
            ChecksumAlgorithm::None => None,
            ChecksumAlgorithm::Crc32 => Some("x-amz-checksum-crc32"),
            ChecksumAlgorithm::Crc32c => Some("x-amz-checksum-crc32c"),
            ChecksumAlgorithm::Sha1 => Some("x-amz-checksum-sha1"),
            ChecksumAlgorithm::Sha256 => Some("x-amz-checksum-sha256"),
        }
    }

    /// Value of the `x-amz-checksum-algorithm` header.
    pub fn amz_name(&self) -> Option<&'static str> {
        match self {
            ChecksumAlgorithm::None => None,
            ChecksumAlgorithm::Crc32 => Some("CRC32"),
            ChecksumAlgorithm::Crc32c => Some("CRC32C"),
            ChecksumAlgorithm::Sha1 => Some("SHA1"),
            ChecksumAlgorithm::Sha256 => Some("SHA256"),
        }
    }

    /// Element name inside ListParts and CompleteMultipartUpload XML.
    pub fn xml_tag(&self) -> Option<&'static str> {
        match self {
            ChecksumAlgorithm::None => None,
            ChecksumAlgorithm::Crc32 => Some("ChecksumCRC32"),
            ChecksumAlgorithm::Crc32c => Some("ChecksumCRC32C"),
            ChecksumAlgorithm::Sha1 => Some("ChecksumSHA1"),
            ChecksumAlgorithm::Sha256 => Some("ChecksumSHA256"),
        }
    }

    pub fn hasher(&self) -> ChecksumHasher {
        match self {
            ChecksumAlgorithm::None => ChecksumHasher::None,
            ChecksumAlgorithm::Crc32 => ChecksumHasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Crc32c => ChecksumHasher::Crc32c(0),
            ChecksumAlgorithm::Sha1 => ChecksumHasher::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => ChecksumHasher::Sha256(Sha256::new()),
        }
    }
}

/// Streaming hasher for one part's bytes.
pub enum ChecksumHasher {
    None,
    Crc32(crc32fast::Hasher),
    Crc32c(u32),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ChecksumHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumHasher::None => {}
            ChecksumHasher::Crc32(h) => h.update(data),
            ChecksumHasher::Crc32c(state) => *state = crc32c::crc32c_append(*state, data),
            ChecksumHasher::Sha1(h) => h.update(data),
            ChecksumHasher::Sha256(h) => h.update(data),
        }
    }

    /// Base64 digest, or `None` for the no-op algorithm.
    pub fn finish(self) -> Option<String> {
        match self {
            ChecksumHasher::None => None,
            ChecksumHasher::Crc32(h) => Some(BASE64.encode(h.finalize().to_be_bytes())),
            ChecksumHasher::Crc32c(state) => Some(BASE64.encode(state.to_be_bytes())),
            ChecksumHasher::Sha1(h) => Some(BASE64.encode(h.finalize())),
            ChecksumHasher::Sha256(h) => Some(BASE64.encode(h.finalize())),
        }
    }
}

/// One-shot checksum of a full buffer.
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Option<String> {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finish()
}

/// Base64 MD5 for the Content-MD5 header.
pub fn content_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        // crc32("123456789") = 0xCBF43926
        let digest = compute(ChecksumAlgorithm::Crc32, b"123456789").unwrap();
        assert_eq!(digest, BASE64.encode(0xCBF43926u32.to_be_bytes()));
    }

    #[test]
    fn test_crc32c_known_value() {
        // crc32c("123456789") = 0xE3069283
        let digest = compute(ChecksumAlgorithm::Crc32c, b"123456789").unwrap();
        assert_eq!(digest, BASE64.encode(0xE3069283u32.to_be_bytes()));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Crc32c,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Sha256,
        ] {
            let mut hasher = algorithm.hasher();
            for chunk in data.chunks(7) {
                hasher.update(chunk);
            }
            assert_eq!(hasher.finish(), compute(algorithm, data), "{}", algorithm.name());
        }
    }

    #[test]
    fn test_none_produces_no_digest() {
        assert_eq!(compute(ChecksumAlgorithm::None, b"data"), None);
        assert_eq!(ChecksumAlgorithm::None.header_name(), None);
    }

    #[test]
    fn test_content_md5_empty() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }
}
