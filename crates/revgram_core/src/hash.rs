//! Hashes used by the reverser.
//!
//! Two families live here:
//! - [`Fingerprint`]: BLAKE3 content hash of a printed document or blob.
//! - [`PathHash`] and [`StructHasher`]: FNV-1a-64 hashes over little-endian
//!   words, used for structural paths and structural type identity. These
//!   must be stable across runs, so they never use a randomized hasher.

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

/// A BLAKE3 content fingerprint (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// The number of bytes in a fingerprint
    pub const LEN: usize = 32;

    /// Compute the fingerprint of data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, FingerprintError> {
        let bytes = hex::decode(hex).map_err(|_| FingerprintError::InvalidHex)?;
        if bytes.len() != Self::LEN {
            return Err(FingerprintError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Fingerprint parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError {
    /// Invalid hex encoding
    #[error("invalid hex encoding")]
    InvalidHex,
    /// Invalid length (not 32 bytes)
    #[error("invalid fingerprint length: {0} (expected 32)")]
    InvalidLength(usize),
}

/// Position-stable identifier of a field inside a matched argument
///
/// Each step down the type tree extends the hash with one edge (a type
/// identity, a field index, or an element index). Two runs that walk the
/// same structure arrive at the same hash regardless of byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PathHash(pub u64);

impl PathHash {
    /// The empty path
    pub const ROOT: Self = Self(0);

    /// Extend the path by one edge
    #[must_use]
    pub fn extend(self, edge: u64) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.0.to_le_bytes());
        hasher.write(&edge.to_le_bytes());
        Self(hasher.finish())
    }
}

impl fmt::Display for PathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Incremental FNV-1a-64 hasher over little-endian words and strings
#[derive(Default)]
pub struct StructHasher {
    inner: FnvHasher,
}

impl StructHasher {
    /// Create a new hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one word
    pub fn word(&mut self, value: u64) -> &mut Self {
        self.inner.write(&value.to_le_bytes());
        self
    }

    /// Feed a string, length-prefixed
    pub fn text(&mut self, value: &str) -> &mut Self {
        self.word(value.len() as u64);
        self.inner.write(value.as_bytes());
        self
    }

    /// Finish and return the hash
    #[must_use]
    pub fn finish(&self) -> u64 {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_compute() {
        let a = Fingerprint::compute(b"syz_harness");
        let b = Fingerprint::compute(b"syz_harness");
        let c = Fingerprint::compute(b"syz_harness2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = Fingerprint::compute(b"doc");
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
        assert_eq!(
            Fingerprint::from_hex("abcd"),
            Err(FingerprintError::InvalidLength(2))
        );
        assert_eq!(Fingerprint::from_hex("zz"), Err(FingerprintError::InvalidHex));
    }

    #[test]
    fn test_path_hash_matches_fnv1a() {
        // FNV-1a-64 of sixteen zero bytes
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for _ in 0..16 {
            h ^= 0;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        assert_eq!(PathHash::ROOT.extend(0).0, h);
    }

    #[test]
    fn test_path_hash_order_sensitive() {
        let ab = PathHash::ROOT.extend(1).extend(2);
        let ba = PathHash::ROOT.extend(2).extend(1);
        assert_ne!(ab, ba);
        assert_eq!(ab, PathHash::ROOT.extend(1).extend(2));
    }

    #[test]
    fn test_struct_hasher_text_is_length_prefixed() {
        let mut a = StructHasher::new();
        a.text("ab").text("c");
        let mut b = StructHasher::new();
        b.text("a").text("bc");
        assert_ne!(a.finish(), b.finish());
    }
}
