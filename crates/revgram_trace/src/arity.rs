//! Per-architecture operation arity tables.
//!
//! The trace log does not carry an argument count: an op-start record is
//! followed by as many words as the operation takes, so the decoder must be
//! told the arity of every opcode it may see.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of argument words read for opcodes missing from the table
pub const DEFAULT_ARITY: usize = 6;

/// Argument counts of x86-64 Linux system calls, indexed by number
const LINUX_X86_64: &[u8] = &[
    3, 3, 3, 1, 2, 2, 2, 3, 3, 6, 3, 2, 1, 4, 4, 1, 3, 4, 4, 3,
    3, 2, 1, 5, 0, 5, 3, 3, 3, 3, 3, 3, 1, 2, 0, 2, 2, 1, 3, 0,
    4, 3, 3, 3, 6, 6, 3, 3, 2, 3, 2, 3, 3, 4, 5, 5, 5, 0, 0, 3,
    1, 4, 2, 1, 3, 3, 4, 1, 2, 4, 5, 3, 3, 2, 1, 1, 2, 2, 3, 2,
    1, 1, 2, 2, 1, 2, 2, 1, 2, 3, 2, 2, 3, 3, 3, 1, 2, 2, 2, 1,
    1, 4, 0, 3, 0, 1, 1, 0, 0, 2, 0, 0, 0, 2, 2, 2, 2, 3, 3, 3,
    3, 1, 1, 1, 1, 2, 2, 2, 4, 3, 2, 2, 2, 3, 1, 1, 2, 2, 2, 3,
    2, 3, 2, 2, 3, 1, 1, 1, 2, 2, 2, 1, 0, 0, 3, 2, 1, 6, 3, 1,
    2, 1, 0, 1, 2, 5, 2, 2, 1, 4, 2, 2, 2, 3, 1, 3, 2, 1, 1, 4,
    1, 1, 1, 1, 1, 1, 0, 3, 5, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2,
    2, 1, 6, 3, 3, 1, 2, 1, 4, 3, 3, 1, 3, 1, 1, 1, 5, 3, 1, 0,
    4, 4, 3, 4, 2, 1, 1, 2, 2, 2, 4, 1, 4, 4, 3, 2, 1, 6, 3, 5,
    4, 1, 5, 5, 2, 3, 4, 5, 4, 4, 5, 3, 2, 0, 3, 2, 4, 4, 3, 4,
    5, 3, 4, 3, 4, 5, 3, 4, 3, 3, 6, 5, 1, 2, 3, 6, 4, 4, 4, 6,
    4, 6, 3, 2, 1, 4, 4, 2, 4, 4, 2, 1, 3, 2, 1, 5, 5, 4, 5, 5,
    2, 5, 4, 5, 5, 2, 1, 4, 2, 3, 6, 6, 5, 3, 3, 4, 5, 3, 3, 2,
    5, 3, 5, 1, 2, 3, 6, 6, 6, 4, 2, 1, 5, 6, 4, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6, 6,
    6, 6, 6, 6, 4, 2, 6, 4, 3, 5, 2, 5, 3, 3, 2, 2, 3, 4, 3, 4,
    5, 6, 5, 4, 3, 4, 2, 1, 2, 5, 4, 4, 4, 3, 4, 6, 4, 4, 4, 4,
    4, 3, 3,
];

/// Maps an opcode to the number of argument words recorded for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArityTable {
    dense: Vec<u8>,
    overrides: BTreeMap<u64, usize>,
    fallback: usize,
}

impl ArityTable {
    /// Table for x86-64 Linux system calls
    #[must_use]
    pub fn linux_x86_64() -> Self {
        Self {
            dense: LINUX_X86_64.to_vec(),
            overrides: BTreeMap::new(),
            fallback: DEFAULT_ARITY,
        }
    }

    /// Table where every opcode takes `arity` words
    #[must_use]
    pub fn uniform(arity: usize) -> Self {
        Self {
            dense: Vec::new(),
            overrides: BTreeMap::new(),
            fallback: arity,
        }
    }

    /// Table built from explicit entries, unknown opcodes use [`DEFAULT_ARITY`]
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = (u64, usize)>) -> Self {
        Self {
            dense: Vec::new(),
            overrides: entries.into_iter().collect(),
            fallback: DEFAULT_ARITY,
        }
    }

    /// Override the arity of one opcode
    #[must_use]
    pub fn with_entry(mut self, opcode: u64, arity: usize) -> Self {
        self.overrides.insert(opcode, arity);
        self
    }

    /// Number of argument words for `opcode`
    #[must_use]
    pub fn arity(&self, opcode: u64) -> usize {
        if let Some(&n) = self.overrides.get(&opcode) {
            return n;
        }
        usize::try_from(opcode)
            .ok()
            .and_then(|idx| self.dense.get(idx))
            .map_or(self.fallback, |&n| usize::from(n))
    }
}

impl Default for ArityTable {
    fn default() -> Self {
        Self::linux_x86_64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_table_known_entries() {
        let table = ArityTable::linux_x86_64();
        assert_eq!(table.arity(0), 3); // read
        assert_eq!(table.arity(3), 1); // close
        assert_eq!(table.arity(9), 6); // mmap
        assert_eq!(table.arity(37), 1); // alarm
        assert_eq!(table.arity(461), 3);
        assert_eq!(table.arity(462), 3); // last entry
        assert_eq!(LINUX_X86_64.len(), 463);
    }

    #[test]
    fn test_unknown_opcode_uses_fallback() {
        let table = ArityTable::linux_x86_64();
        assert_eq!(table.arity(463), DEFAULT_ARITY);
        assert_eq!(table.arity(u64::MAX), DEFAULT_ARITY);
    }

    #[test]
    fn test_overrides_win() {
        let table = ArityTable::linux_x86_64().with_entry(0, 1);
        assert_eq!(table.arity(0), 1);

        let custom = ArityTable::from_entries([(1000, 2)]);
        assert_eq!(custom.arity(1000), 2);
        assert_eq!(custom.arity(1), DEFAULT_ARITY);
        assert_eq!(ArityTable::uniform(0).arity(5), 0);
    }
}
