use std::collections::HashSet;

use remotex_state::{ContentDigest, FileRecord};

/// Directional comparison of two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// In `other`, not in `original`
    pub added: Vec<FileRecord>,
    /// In `original`, not in `other`
    pub removed: Vec<FileRecord>,
    /// In both
    pub same: Vec<FileRecord>,
}

impl DiffResult {
    /// Nothing to transfer or delete.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare `original` against `other` by exact `(path, digest)` match.
///
/// A file whose content changed shows up once in `removed` (old digest) and
/// once in `added` (new digest).
pub fn diff(original: &[FileRecord], other: &[FileRecord]) -> DiffResult {
    let original_keys: HashSet<(&str, &ContentDigest)> = original
        .iter()
        .map(|f| (f.path.as_str(), &f.digest))
        .collect();
    let other_keys: HashSet<(&str, &ContentDigest)> = other
        .iter()
        .map(|f| (f.path.as_str(), &f.digest))
        .collect();

    let mut result = DiffResult::default();
    for file in original {
        if other_keys.contains(&(file.path.as_str(), &file.digest)) {
            result.same.push(file.clone());
        } else {
            result.removed.push(file.clone());
        }
    }
    for file in other {
        if !original_keys.contains(&(file.path.as_str(), &file.digest)) {
            result.added.push(file.clone());
        }
    }
    result
}
