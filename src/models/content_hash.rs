//! The content digest that identifies a file's bytes.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Length of an MD5 digest in bytes.
pub const CONTENT_HASH_LEN: usize = 16;

/// MD5 digest of a file's complete byte content.
///
/// Serialized as 32 lowercase hex characters. Because parsing accepts nothing
/// else, a `ContentHash` is always safe to use as a path segment or object key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentHashError {
    #[error("content hash must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("content hash contains a non-hex character")]
    InvalidCharacter,
}

impl ContentHash {
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Hash a complete byte sequence in one pass.
    pub fn compute(data: impl AsRef<[u8]>) -> Self {
        Self(md5::compute(data).0)
    }

    /// Two-level shard directory names taken from the first two digest bytes.
    pub fn shards(&self) -> (String, String) {
        (format!("{:02x}", self.0[0]), format!("{:02x}", self.0[1]))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl FromStr for ContentHash {
    type Err = ContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end_matches('\n');
        if s.len() != CONTENT_HASH_LEN * 2 {
            return Err(ContentHashError::InvalidLength {
                expected: CONTENT_HASH_LEN * 2,
                actual: s.len(),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContentHashError::InvalidCharacter);
        }

        let mut out = [0u8; CONTENT_HASH_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| ContentHashError::InvalidCharacter)?;
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ContentHashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}
