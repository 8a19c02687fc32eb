//! File-scope normalization and overlap.
//!
//! Two paths overlap when they are equal or one is a directory prefix of the
//! other on a path-component boundary: `src` overlaps `src/auth.py`, while
//! `src/a` does not overlap `src/ab`. An empty path (`.` or `/`) stands for
//! the whole tree and overlaps everything.

use std::collections::BTreeSet;

/// Normalize a declared path: forward slashes, no `.` components, no
/// leading `./` or `/`, no trailing or doubled separators.
pub fn normalize(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Overlap between two already-normalized paths.
fn overlaps_normalized(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() || a == b {
        return true;
    }
    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    long.starts_with(short) && long.as_bytes().get(short.len()) == Some(&b'/')
}

/// Whether two declared paths touch the same file or directory.
pub fn overlaps(a: &str, b: &str) -> bool {
    overlaps_normalized(&normalize(a), &normalize(b))
}

/// Paths of `a` that overlap anything in `b`, plus the paths of `b` they hit.
pub fn overlapping_paths(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    let mut hits = BTreeSet::new();
    for pa in a {
        for pb in b {
            let (na, nb) = (normalize(pa), normalize(pb));
            if overlaps_normalized(&na, &nb) {
                hits.insert(na);
                hits.insert(nb);
            }
        }
    }
    hits
}

/// A growing set of claimed paths that new scopes are checked against.
#[derive(Debug, Clone, Default)]
pub struct ScopeSet {
    paths: Vec<String>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Claim every path of `scope`.
    pub fn claim<'a>(&mut self, scope: impl IntoIterator<Item = &'a String>) {
        for path in scope {
            let normalized = normalize(path);
            if !self.paths.contains(&normalized) {
                self.paths.push(normalized);
            }
        }
    }

    /// Whether any path of `scope` overlaps a claimed path.
    pub fn conflicts_with<'a>(&self, scope: impl IntoIterator<Item = &'a String>) -> bool {
        scope.into_iter().any(|path| {
            let normalized = normalize(path);
            self.paths
                .iter()
                .any(|claimed| overlaps_normalized(claimed, &normalized))
        })
    }
}
