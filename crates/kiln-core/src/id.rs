//! Content ids.
//!
//! An [`FsId`] is a fixed-width BLAKE3 digest with a canonical lowercase hex
//! printing. The same type identifies a serialised term in the term store
//! and a materialised path in the path store; equality is bytewise.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Width of a content id in bytes.
pub const ID_BYTES: usize = 32;

/// A content id: the BLAKE3 digest of a serialised term or of filesystem
/// content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FsId([u8; ID_BYTES]);

impl FsId {
    /// Wraps a raw digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsId({self})")
    }
}

/// Error parsing an id from its hex form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid id `{input}`: {reason}")]
pub struct ParseIdError {
    /// The rejected input.
    pub input: String,
    /// Why it was rejected.
    pub reason: String,
}

impl FromStr for FsId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_BYTES * 2 {
            return Err(ParseIdError {
                input: s.to_string(),
                reason: format!("expected {} hex characters, got {}", ID_BYTES * 2, s.len()),
            });
        }
        let bytes = hex::decode(s).map_err(|e| ParseIdError {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

/// Hashes a byte slice into an id.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> FsId {
    FsId(*blake3::hash(bytes).as_bytes())
}

/// Streaming hasher producing an [`FsId`].
///
/// Used where the input does not fit in memory at once, e.g. hashing a
/// directory tree entry by entry.
#[derive(Debug, Default)]
pub struct IdHasher(blake3::Hasher);

impl IdHasher {
    /// Creates an empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    /// Feeds bytes into the hasher.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Finishes hashing and returns the id.
    #[must_use]
    pub fn finish(&self) -> FsId {
        FsId(*self.0.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let id = hash_bytes(b"some content");
        let printed = id.to_string();
        assert_eq!(printed.len(), ID_BYTES * 2);
        assert_eq!(printed, printed.to_lowercase());
        assert_eq!(printed.parse::<FsId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = "abcd".parse::<FsId>().unwrap_err();
        assert!(err.reason.contains("64 hex characters"));
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        let input = "zz".repeat(ID_BYTES);
        assert!(input.parse::<FsId>().is_err());
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_bytes(b"payload"), hash_bytes(b"payload"));
        assert_ne!(hash_bytes(b"payload"), hash_bytes(b"payload2"));
    }

    #[test]
    fn test_streaming_hasher_matches_one_shot() {
        let mut hasher = IdHasher::new();
        hasher.update(b"split ").update(b"input");
        assert_eq!(hasher.finish(), hash_bytes(b"split input"));
    }
}
