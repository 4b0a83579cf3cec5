//! Cached objects are named by a fixed-length content fingerprint.
//! The fingerprint doubles as the object's on-disk name: the first
//! byte selects one of 256 shard subdirectories, and the rest of the
//! hex digits name the file in that subdirectory.
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::QuotaError;

/// Number of raw bytes in a [`ContentId`].
pub const CONTENT_ID_LEN: usize = 20;

/// A `ContentId` is an opaque 20-byte fingerprint for a cached
/// object.  The quota manager never looks inside; it only compares,
/// orders, and renders identifiers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId([u8; CONTENT_ID_LEN]);

#[inline]
fn hex_digit(nibble: u8) -> char {
    b"0123456789abcdef"[(nibble & 0xf) as usize] as char
}

#[inline]
fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Checks whether `s` consists only of lowercase hex digits.
pub(crate) fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl ContentId {
    /// Wraps raw fingerprint bytes.
    pub const fn new(bytes: [u8; CONTENT_ID_LEN]) -> ContentId {
        ContentId(bytes)
    }

    /// Returns the SHA-1 fingerprint of `data`.
    pub fn of(data: &[u8]) -> ContentId {
        ContentId(extendhash::sha1::compute_hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_ID_LEN] {
        &self.0
    }

    /// Renders the identifier as 40 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        let mut ret = String::with_capacity(2 * CONTENT_ID_LEN);
        for byte in &self.0 {
            ret.push(hex_digit(byte >> 4));
            ret.push(hex_digit(*byte));
        }

        ret
    }

    /// Parses 40 hex digits (either case) into an identifier.
    pub fn from_hex(hex: &str) -> Option<ContentId> {
        let hex = hex.as_bytes();
        if hex.len() != 2 * CONTENT_ID_LEN {
            return None;
        }

        let mut bytes = [0u8; CONTENT_ID_LEN];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            bytes[i] = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
        }

        Some(ContentId(bytes))
    }

    /// Returns the path of this object relative to the cache
    /// directory: `ab/cdef...` for identifier `abcdef...`.
    pub fn relative_path(&self) -> PathBuf {
        let hex = self.to_hex();
        let mut ret = PathBuf::from(&hex[0..2]);

        ret.push(&hex[2..]);
        ret
    }

    /// Recovers the identifier from a shard directory name and a file
    /// name, the inverse of [`ContentId::relative_path`].  Only the
    /// lowercase spelling that `relative_path` produces is accepted.
    pub fn from_shard_entry(shard: &str, name: &str) -> Option<ContentId> {
        if shard.len() != 2 || !is_lower_hex(shard) || !is_lower_hex(name) {
            return None;
        }

        ContentId::from_hex(&format!("{}{}", shard, name))
    }

    /// Returns the absolute object path under `cache_dir`.
    pub fn object_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(self.relative_path())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl FromStr for ContentId {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<ContentId, QuotaError> {
        ContentId::from_hex(s)
            .ok_or_else(|| QuotaError::InvalidPayload(format!("bad content id {:?}", s)))
    }
}

impl From<[u8; CONTENT_ID_LEN]> for ContentId {
    fn from(bytes: [u8; CONTENT_ID_LEN]) -> ContentId {
        ContentId(bytes)
    }
}

#[test]
fn test_hex_round_trip() {
    let id = ContentId::of(b"hello");

    // SHA-1("hello")
    assert_eq!(id.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    assert_eq!(ContentId::from_hex(&id.to_hex()), Some(id));
    assert_eq!(
        ContentId::from_hex("AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D"),
        Some(id)
    );
}

#[test]
fn test_reject_bad_hex() {
    assert_eq!(ContentId::from_hex(""), None);
    assert_eq!(ContentId::from_hex("aa"), None);
    assert_eq!(
        ContentId::from_hex("zzf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"),
        None
    );
    assert!("not an id".parse::<ContentId>().is_err());
}

#[test]
fn test_sharded_path() {
    let id = ContentId::of(b"hello");
    let rel = id.relative_path();

    assert_eq!(rel, Path::new("aa/f4c61ddcc5e8a2dabede0f3b482cd9aea9434d"));
    assert_eq!(
        ContentId::from_shard_entry("aa", "f4c61ddcc5e8a2dabede0f3b482cd9aea9434d"),
        Some(id)
    );
    // Shard names must be exactly two digits.
    assert_eq!(
        ContentId::from_shard_entry("a", "af4c61ddcc5e8a2dabede0f3b482cd9aea9434d"),
        None
    );
    // Uppercase names do not live where `relative_path` says.
    assert_eq!(
        ContentId::from_shard_entry("AA", "f4c61ddcc5e8a2dabede0f3b482cd9aea9434d"),
        None
    );
    assert_eq!(
        ContentId::from_shard_entry("aa", "F4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D"),
        None
    );
}
