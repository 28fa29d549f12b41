//! Longest common substrings between a blob and captured bytes.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Half-open byte range
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Span {
    /// First byte
    pub begin: usize,
    /// One past the last byte
    pub end: usize,
}

impl Span {
    /// Create a new span
    #[must_use]
    pub const fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    /// Number of bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    /// Check if empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// As a slice range
    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.begin..self.end
    }

    /// Whether two spans share a byte
    #[must_use]
    pub const fn overlaps(&self, other: &Span) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

/// Equal ranges in two byte strings
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CommonSubstr {
    /// Range in the first string
    pub a: Span,
    /// Range in the second string
    pub b: Span,
}

/// Common substrings of `a` and `b`, longest first, pairwise disjoint in `a`
///
/// For every end position in `b` the longest substring ending there is
/// kept; candidates overlapping a longer one already chosen are dropped.
#[must_use]
pub fn longest_common_substrings(a: &[u8], b: &[u8]) -> Vec<CommonSubstr> {
    let mut run = vec![0usize; b.len()];
    let mut best = vec![CommonSubstr::default(); b.len()];
    for (ia, &ca) in a.iter().enumerate() {
        for ib in (0..b.len()).rev() {
            if ca != b[ib] {
                run[ib] = 0;
                continue;
            }
            run[ib] = if ib == 0 { 1 } else { run[ib - 1] + 1 };
            let n = run[ib];
            if n > best[ib].a.len() {
                best[ib] = CommonSubstr {
                    a: Span::new(ia + 1 - n, ia + 1),
                    b: Span::new(ib + 1 - n, ib + 1),
                };
            }
        }
    }

    best.sort_by(|x, y| y.a.len().cmp(&x.a.len()).then_with(|| x.cmp(y)));
    let mut out: Vec<CommonSubstr> = Vec::new();
    for cs in best {
        if cs.a.is_empty() || out.iter().any(|o| o.a.overlaps(&cs.a)) {
            continue;
        }
        out.push(cs);
    }
    out
}

/// Shrink `cs` past leading and trailing positions where `x` and `y` agree
///
/// Bytes equal in both blobs cannot tell which blob a capture came from,
/// so they never count as evidence. The `b` range shrinks in step.
#[must_use]
pub fn trim_common(cs: CommonSubstr, x: &[u8], y: &[u8]) -> CommonSubstr {
    let same = |i: usize| matches!((x.get(i), y.get(i)), (Some(p), Some(q)) if p == q);
    let (mut begin, mut end) = (cs.a.begin, cs.a.end);
    while begin < end && same(begin) {
        begin += 1;
    }
    while begin < end && same(end - 1) {
        end -= 1;
    }
    CommonSubstr {
        a: Span::new(begin, end),
        b: Span::new(cs.b.begin + (begin - cs.a.begin), cs.b.end - (cs.a.end - end)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_match() {
        let found = longest_common_substrings(b"xxABCDyy", b"ABCD");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].a, Span::new(2, 6));
        assert_eq!(found[0].b, Span::new(0, 4));
    }

    #[test]
    fn test_disjoint_longest_first() {
        let found = longest_common_substrings(b"abcXdeYfghij", b"fghij-abc-de");
        let lens: Vec<usize> = found.iter().map(|c| c.a.len()).collect();
        assert_eq!(lens, vec![5, 3, 2]);
        assert_eq!(found[0].a, Span::new(7, 12));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(longest_common_substrings(b"", b"abc").is_empty());
        assert!(longest_common_substrings(b"abc", b"").is_empty());
        assert!(longest_common_substrings(b"abc", b"xyz").is_empty());
    }

    #[test]
    fn test_trim_common() {
        let x = [0x41, 0x00, 0x00, 0x07];
        let y = [0x41, 0xff, 0xff, 0x07];
        let cs = CommonSubstr {
            a: Span::new(0, 4),
            b: Span::new(2, 6),
        };
        let trimmed = trim_common(cs, &x, &y);
        assert_eq!(trimmed.a, Span::new(1, 3));
        assert_eq!(trimmed.b, Span::new(3, 5));

        let all_same = trim_common(cs, &x, &x);
        assert!(all_same.a.is_empty());
    }

    fn brute_longest(a: &[u8], b: &[u8]) -> usize {
        let mut best = 0;
        for i in 0..a.len() {
            for j in 0..b.len() {
                let mut n = 0;
                while i + n < a.len() && j + n < b.len() && a[i + n] == b[j + n] {
                    n += 1;
                }
                best = best.max(n);
            }
        }
        best
    }

    proptest! {
        #[test]
        fn prop_lcs_disjoint_sorted_and_common(
            a in prop::collection::vec(0u8..4, 0..24),
            b in prop::collection::vec(0u8..4, 0..24),
        ) {
            let found = longest_common_substrings(&a, &b);
            for cs in &found {
                prop_assert_eq!(&a[cs.a.range()], &b[cs.b.range()]);
            }
            for w in found.windows(2) {
                prop_assert!(w[0].a.len() >= w[1].a.len());
            }
            for (i, x) in found.iter().enumerate() {
                for y in &found[i + 1..] {
                    prop_assert!(!x.a.overlaps(&y.a));
                }
            }
            prop_assert_eq!(found.first().map_or(0, |c| c.a.len()), brute_longest(&a, &b));
        }
    }
}
