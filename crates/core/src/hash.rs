//! The 20-byte content-addressed root hash.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Width of a [`Head`] in bytes.
pub const HASH_LEN: usize = 20;

/// Hex width of a [`Head`] when rendered as a string.
pub const HASH_HEX_LEN: usize = 2 * HASH_LEN;

/// A 20-byte hash naming a root of the content-addressed DAG.
///
/// The all-zero value means "unknown / unset" and is what a freshly created
/// store reports before anything has been committed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Head([u8; HASH_LEN]);

impl Head {
    /// The zero head.
    pub const EMPTY: Head = Head([0u8; HASH_LEN]);

    pub fn new(bytes: [u8; HASH_LEN]) -> Head {
        Head(bytes)
    }

    /// Hash of arbitrary content: SHA-256 truncated to 20 bytes.
    pub fn of(data: &[u8]) -> Head {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest[..HASH_LEN]);
        Head(bytes)
    }

    /// True for the all-zero "unset" head.
    pub fn is_empty(&self) -> bool {
        *self == Head::EMPTY
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Parse a 40-character lowercase hex string.
    pub fn parse(s: &str) -> Option<Head> {
        if !is_valid_commit_hash(s) {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(Head(bytes))
    }
}

/// Whether `s` has the shape of a commit hash: exactly 40 lowercase hex
/// characters. Shape only; the caller still has to resolve it.
pub fn is_valid_commit_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Head({})", self)
    }
}

impl FromStr for Head {
    type Err = String;

    fn from_str(s: &str) -> Result<Head, String> {
        Head::parse(s).ok_or_else(|| format!("invalid head: {s:?}"))
    }
}

impl Serialize for Head {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Head {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Head, D::Error> {
        struct HeadVisitor;

        impl Visitor<'_> for HeadVisitor {
            type Value = Head;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 40-character hex hash")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Head, E> {
                Head::parse(v).ok_or_else(|| E::custom(format!("invalid head: {v:?}")))
            }
        }

        deserializer.deserialize_str(HeadVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_head_is_empty() {
        assert!(Head::EMPTY.is_empty());
        assert!(Head::default().is_empty());
        assert!(!Head::of(b"x").is_empty());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let h = Head::of(b"some chunk content");
        let s = h.to_string();
        assert_eq!(s.len(), HASH_HEX_LEN);
        assert_eq!(Head::parse(&s), Some(h));
    }

    #[test]
    fn test_commit_hash_shape() {
        let h = Head::of(b"abc").to_string();
        assert!(is_valid_commit_hash(&h));
        assert!(!is_valid_commit_hash("main"));
        assert!(!is_valid_commit_hash(&h[..39]));
        assert!(!is_valid_commit_hash(&h.to_uppercase()));
        assert!(!is_valid_commit_hash(&format!("{}g", &h[..39])));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let h = Head::of(b"refs");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{h}\""));
        let back: Head = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
