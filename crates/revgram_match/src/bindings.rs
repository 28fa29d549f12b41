//! Live resource handles during one match run.

use crate::config::{MatchConfig, ResourceSeed};
use std::collections::{BTreeMap, BTreeSet};

/// handle value -> resource name -> compatible kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBindings {
    handles: BTreeMap<u64, BTreeMap<String, BTreeSet<String>>>,
}

impl ResourceBindings {
    /// Create an empty set of bindings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings holding the configured seeds
    #[must_use]
    pub fn seeded(config: &MatchConfig) -> Self {
        let mut bindings = Self::new();
        for ResourceSeed { handle, name, kinds } in &config.seeds {
            bindings.bind(*handle, name, kinds.iter().map(String::as_str));
        }
        bindings
    }

    /// Record that `handle` now refers to resource `name` of `kinds`
    pub fn bind<'k>(&mut self, handle: u64, name: &str, kinds: impl IntoIterator<Item = &'k str>) {
        self.handles
            .entry(handle)
            .or_default()
            .entry(name.to_string())
            .or_default()
            .extend(kinds.into_iter().map(str::to_string));
    }

    /// Resource names bound to `handle` that are compatible with `kind`
    #[must_use]
    pub fn compatible(&self, handle: u64, kind: &str) -> Vec<String> {
        self.handles
            .get(&handle)
            .map(|names| {
                names
                    .iter()
                    .filter(|(_, kinds)| kinds.contains(kind))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop one resource binding from a handle
    pub fn release(&mut self, handle: u64, name: &str) {
        if let Some(names) = self.handles.get_mut(&handle) {
            names.remove(name);
        }
    }

    /// Copy every binding of `old` carrying `kind` onto `new`
    pub fn duplicate(&mut self, old: u64, new: u64, kind: &str) {
        let Some(names) = self.handles.get(&old) else {
            return;
        };
        let copied: Vec<(String, BTreeSet<String>)> = names
            .iter()
            .filter(|(_, kinds)| kinds.contains(kind))
            .map(|(name, kinds)| (name.clone(), kinds.clone()))
            .collect();
        let target = self.handles.entry(new).or_default();
        for (name, kinds) in copied {
            target.insert(name, kinds);
        }
    }

    /// Whether any resource is bound to `handle`
    #[must_use]
    pub fn is_bound(&self, handle: u64) -> bool {
        self.handles.get(&handle).is_some_and(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_handles() {
        let b = ResourceBindings::seeded(&MatchConfig::linux());
        assert_eq!(b.compatible(1, "fd"), vec!["fd_tty".to_string()]);
        assert!(b.compatible(1, "sock").is_empty());
        assert!(!b.is_bound(3));
    }

    #[test]
    fn test_release_and_duplicate() {
        let mut b = ResourceBindings::new();
        b.bind(3, "fd_file", ["fd", "fd_file"]);
        b.duplicate(3, 7, "fd");
        assert_eq!(b.compatible(7, "fd_file"), vec!["fd_file".to_string()]);
        b.release(3, "fd_file");
        assert!(!b.is_bound(3));
        assert!(b.is_bound(7));
        b.duplicate(3, 8, "fd");
        assert!(!b.is_bound(8));
    }
}
