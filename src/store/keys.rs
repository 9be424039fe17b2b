//! Content hashes, logical path identifiers and name validation.

use std::fmt;

use ring::digest::{digest, SHA256};
use serde::Serialize;

use super::error::StoreError;

/// Length of a hex-encoded SHA-256 digest
pub const CONTENT_HASH_HEX_LEN: usize = 64;

/// Maximum length of a namespace or link name, in bytes
pub const MAX_SEGMENT_LEN: usize = 255;

/// SHA-256 digest of a blob's bytes, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash the given bytes.
    pub fn compute(data: &[u8]) -> Self {
        let digest = digest(&SHA256, data);
        let hex: String = digest
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self(hex)
    }

    /// Parse a lowercase hex digest. Returns `None` for anything else.
    pub fn parse(hex: &str) -> Option<Self> {
        let valid = hex.len() == CONTENT_HASH_HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reversible encoding of a logical link path (`namespace/name`).
///
/// Each segment escapes `%` and `/` before the segments are joined, so two
/// different paths can never encode to the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalPathId(String);

impl LogicalPathId {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", escape(namespace), escape(name)))
    }

    /// Wrap an identifier read back from the marker table.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Recover `(namespace, name)`. Returns `None` if the identifier is malformed.
    pub fn decode(&self) -> Option<(String, String)> {
        let (namespace, name) = self.0.split_once('/')?;
        if name.contains('/') {
            return None;
        }
        Some((unescape(namespace)?, unescape(name)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalPathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "2F" => out.push('/'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// Validate a namespace or link name as a single, visible path segment.
pub fn validate_segment(kind: &str, segment: &str) -> Result<(), StoreError> {
    let reason = if segment.is_empty() {
        Some("must not be empty")
    } else if segment.len() > MAX_SEGMENT_LEN {
        Some("is too long")
    } else if segment.starts_with('.') {
        Some("must not start with '.'")
    } else if segment.contains(['/', '\\', '\0']) {
        Some("must not contain path separators")
    } else if segment.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidName(format!("{kind} '{segment}' {reason}"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_known_digest() {
        assert_eq!(
            ContentHash::compute(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            ContentHash::compute(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_parse_rejects_non_digests() {
        let hash = ContentHash::compute(b"hello");
        assert_eq!(ContentHash::parse(hash.as_str()), Some(hash.clone()));
        assert!(ContentHash::parse(&hash.as_str().to_uppercase()).is_none());
        assert!(ContentHash::parse("abc").is_none());
        assert!(ContentHash::parse(&"g".repeat(64)).is_none());
    }

    #[test]
    fn test_logical_id_decodes() {
        let id = LogicalPathId::new("photos", "a.jpg");
        assert_eq!(id.as_str(), "photos/a.jpg");
        assert_eq!(
            id.decode(),
            Some(("photos".to_string(), "a.jpg".to_string()))
        );
    }

    #[test]
    fn test_logical_id_is_collision_free() {
        // The naive "replace / with _" scheme maps both of these to "a_b_c".
        let a = LogicalPathId::new("a/b", "c");
        let b = LogicalPathId::new("a", "b/c");
        assert_ne!(a, b);
        assert_eq!(a.decode(), Some(("a/b".to_string(), "c".to_string())));
        assert_eq!(b.decode(), Some(("a".to_string(), "b/c".to_string())));

        let c = LogicalPathId::new("x%2F", "y");
        let d = LogicalPathId::new("x/", "y");
        assert_ne!(c, d);
        assert_eq!(c.decode(), Some(("x%2F".to_string(), "y".to_string())));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(LogicalPathId::from_encoded("no-separator").decode().is_none());
        assert!(LogicalPathId::from_encoded("a/b/c").decode().is_none());
        assert!(LogicalPathId::from_encoded("a/%zz").decode().is_none());
        assert!(LogicalPathId::from_encoded("a/%2").decode().is_none());
    }

    #[test]
    fn test_validate_segment() {
        assert!(validate_segment("name", "a.jpg").is_ok());
        assert!(validate_segment("name", "my file (1).png").is_ok());
        assert!(validate_segment("name", "").is_err());
        assert!(validate_segment("name", ".hidden").is_err());
        assert!(validate_segment("name", "..").is_err());
        assert!(validate_segment("name", "a/b").is_err());
        assert!(validate_segment("name", "a\\b").is_err());
        assert!(validate_segment("name", "a\nb").is_err());
        assert!(validate_segment("name", &"x".repeat(256)).is_err());
    }
}
