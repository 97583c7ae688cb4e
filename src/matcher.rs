//! Tolerant identity matching.
//!
//! Identity text in the ledger is typed by hand, so exact comparison is too
//! brittle and substring search too permissive. Strings are compared with a
//! normalized indel similarity:
//!
//! ```text
//! similarity(a, b) = 2 * LCS(a, b) / (|a| + |b|)
//! ```
//!
//! over case-folded, trimmed characters. The measure is deterministic and
//! symmetric, `1.0` for equal strings and `0.0` for disjoint ones.
//!
//! LCS is never shorter than the sum of greedily chosen matching blocks
//! (longest common run first, then recurse on either side), so this ratio is
//! never lower than a block-based ratio such as Python's
//! `difflib.SequenceMatcher.ratio()`. A threshold of `0.85` here therefore
//! accepts slightly more pairs than the same number would under a block-based
//! measure: `"aba"` vs `"bda"` scores `0.67` here against `0.33` there.

/// Default similarity threshold (inclusive).
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.85;

/// Similarity of two identity strings in `[0.0, 1.0]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = fold(a);
    let b: Vec<char> = fold(b);

    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    (2 * lcs_len(&a, &b)) as f64 / total as f64
}

fn fold(s: &str) -> Vec<char> {
    s.trim().chars().flat_map(char::to_lowercase).collect()
}

/// Longest common subsequence length, two-row DP.
fn lcs_len(a: &[char], b: &[char]) -> usize {
    // Iterate over the longer string so the rows stay short.
    let (outer, inner) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut prev = vec![0usize; inner.len() + 1];
    let mut curr = vec![0usize; inner.len() + 1];

    for &oc in outer {
        for (j, &ic) in inner.iter().enumerate() {
            curr[j + 1] = if oc == ic {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[inner.len()]
}

/// Threshold-based identity matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityMatcher {
    threshold: f64,
}

impl IdentityMatcher {
    /// Create a matcher; the threshold is clamped to `[0.0, 1.0]`.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// The configured threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether `submitted` is close enough to `known`.
    pub fn matches(&self, submitted: &str, known: &str) -> bool {
        similarity(submitted, known) >= self.threshold
    }
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

/// Match with the default threshold.
pub fn matches(submitted: &str, known: &str) -> bool {
    IdentityMatcher::default().matches(submitted, known)
}
