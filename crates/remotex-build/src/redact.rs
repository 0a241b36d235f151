//! Removal of server filesystem paths from driver output.

use std::path::Path;

/// Replaces absolute server paths with stable placeholders.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    // longest path first so nested paths are replaced before their parents
    rules: Vec<(String, &'static str)>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `path` with `placeholder` wherever it appears.
    pub fn with_path(mut self, path: &Path, placeholder: &'static str) -> Self {
        let text = path.to_string_lossy().trim_end_matches('/').to_string();
        if !text.is_empty() {
            self.rules.push((text, placeholder));
            self.rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }
        self
    }

    pub fn redact(&self, output: &str) -> String {
        self.rules
            .iter()
            .fold(output.to_string(), |acc, (path, placeholder)| {
                acc.replace(path.as_str(), placeholder)
            })
    }
}
