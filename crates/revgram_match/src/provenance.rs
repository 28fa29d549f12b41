//! Bytes observed at structural positions of matched signatures.

use revgram_core::PathHash;
use revgram_grammar::{SignatureId, TypeRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structural position of captured bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvenanceKey {
    /// Event index in the trace
    pub event: usize,
    /// Matched signature
    pub signature: SignatureId,
    /// Argument position
    pub arg: usize,
    /// Path from the argument root
    pub path: PathHash,
    /// Type examined at that path
    pub ty: TypeRef,
}

/// Captured bytes per structural position, ordered for deterministic walks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    entries: BTreeMap<ProvenanceKey, Vec<u8>>,
}

impl Provenance {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes, replacing earlier bytes at the same key
    pub fn record(&mut self, key: ProvenanceKey, bytes: Vec<u8>) {
        self.entries.insert(key, bytes);
    }

    /// Merge another map, its entries winning
    pub fn extend(&mut self, other: Provenance) {
        self.entries.extend(other.entries);
    }

    /// Bytes at a key
    #[must_use]
    pub fn get(&self, key: &ProvenanceKey) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&ProvenanceKey, &[u8])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
