//! Resource lifecycle configuration.
//!
//! Everything the matcher knows about how handles come and go is here
//! rather than in the catalogue: which handles exist before the first
//! event, which kinds are never allocated by any operation, and which
//! operations release or duplicate a handle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Handle bound before the first event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSeed {
    /// Handle value
    pub handle: u64,
    /// Resource name
    pub name: String,
    /// Compatible kinds
    pub kinds: Vec<String>,
}

impl ResourceSeed {
    /// Create a new seed
    #[must_use]
    pub fn new(handle: u64, name: impl Into<String>, kinds: &[&str]) -> Self {
        Self {
            handle,
            name: name.into(),
            kinds: kinds.iter().map(|k| (*k).to_string()).collect(),
        }
    }
}

/// Where a duplicator finds a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleSource {
    /// Argument word at this position
    Arg(usize),
    /// Return value
    Ret,
}

/// Operation that makes a second handle for the same resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duplicator {
    /// Operation name
    pub name: String,
    /// Existing handle
    pub old: HandleSource,
    /// New handle
    pub new: HandleSource,
}

impl Duplicator {
    /// Create a new duplicator
    #[must_use]
    pub fn new(name: impl Into<String>, old: HandleSource, new: HandleSource) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }
}

/// Matcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Handles bound before the first event
    pub seeds: Vec<ResourceSeed>,
    /// Kinds no operation allocates, accepted as inputs anywhere
    pub no_alloc_kinds: BTreeSet<String>,
    /// Operations that drop the binding of their input handles
    pub release_ops: BTreeSet<String>,
    /// Operations that copy bindings to a new handle
    pub duplicators: Vec<Duplicator>,
    /// Kind a binding must carry to be copied by a duplicator
    pub duplicable_kind: String,
}

impl MatchConfig {
    /// Linux defaults: standard streams as terminals, `close` releases,
    /// `dup`/`dup2`/`dup3` duplicate
    #[must_use]
    pub fn linux() -> Self {
        let tty = |handle| ResourceSeed::new(handle, "fd_tty", &["fd", "fd_tty"]);
        Self {
            seeds: vec![tty(0), tty(1), tty(2)],
            no_alloc_kinds: ["time_sec", "time_nsec", "time_usec"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            release_ops: std::iter::once("close".to_string()).collect(),
            duplicators: vec![
                Duplicator::new("dup", HandleSource::Arg(0), HandleSource::Ret),
                Duplicator::new("dup2", HandleSource::Arg(0), HandleSource::Arg(1)),
                Duplicator::new("dup3", HandleSource::Arg(0), HandleSource::Arg(1)),
            ],
            duplicable_kind: "fd".to_string(),
        }
    }

    /// Configuration with no seeds or special operations
    #[must_use]
    pub fn empty() -> Self {
        Self {
            seeds: Vec::new(),
            no_alloc_kinds: BTreeSet::new(),
            release_ops: BTreeSet::new(),
            duplicators: Vec::new(),
            duplicable_kind: String::new(),
        }
    }

    /// Add a seed
    #[must_use]
    pub fn with_seed(mut self, seed: ResourceSeed) -> Self {
        self.seeds.push(seed);
        self
    }

    /// Add a release operation
    #[must_use]
    pub fn with_release_op(mut self, name: impl Into<String>) -> Self {
        self.release_ops.insert(name.into());
        self
    }

    /// Duplicator for an operation name
    #[must_use]
    pub fn duplicator(&self, name: &str) -> Option<&Duplicator> {
        self.duplicators.iter().find(|d| d.name == name)
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self::linux()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_defaults() {
        let config = MatchConfig::default();
        assert_eq!(config.seeds.len(), 3);
        assert!(config.no_alloc_kinds.contains("time_nsec"));
        assert!(config.release_ops.contains("close"));
        assert_eq!(
            config.duplicator("dup2").map(|d| d.new),
            Some(HandleSource::Arg(1))
        );
        assert!(config.duplicator("open").is_none());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = MatchConfig::linux().with_release_op("munmap");
        let json = serde_json::to_string(&config).unwrap();
        let back: MatchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
