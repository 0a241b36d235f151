//! The `.remotex` file marking a local project root.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use remotex_core::BuildOptions;
use serde::{Deserialize, Serialize};

pub const PROJECT_CONFIG_NAME: &str = ".remotex";

/// Per-project client settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub project_name: String,
    /// Pull `aux` along with `out` after a build
    pub save_aux_files: bool,
    /// Defaults for `remotex build`
    pub build_options: BuildOptions,
}

impl ProjectConfig {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            ..Default::default()
        }
    }

    pub fn read(root: &Path) -> Result<Self> {
        let path = root.join(PROJECT_CONFIG_NAME);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if config.project_name.is_empty() {
            bail!("{} has no projectName", path.display());
        }
        Ok(config)
    }

    pub fn write(&self, root: &Path) -> Result<()> {
        let path = root.join(PROJECT_CONFIG_NAME);
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, raw + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Nearest directory at or above `start` holding a `.remotex` file.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_CONFIG_NAME).is_file())
        .map(Path::to_path_buf)
        .with_context(|| {
            format!(
                "{} is not inside a remotex project (no {PROJECT_CONFIG_NAME} found)",
                start.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotex_core::Engine;

    #[test]
    fn root_found_from_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("thesis");
        std::fs::create_dir_all(root.join("src/chapters")).unwrap();
        ProjectConfig::new("thesis").write(&root).unwrap();

        let found = find_project_root(&root.join("src/chapters")).unwrap();
        assert_eq!(found, root);
        assert!(find_project_root(dir.path()).is_err());
    }

    #[test]
    fn reads_camel_case_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_NAME),
            r#"{"projectName": "thesis", "buildOptions": {"engine": "xe", "cleanBuild": true}}"#,
        )
        .unwrap();
        let config = ProjectConfig::read(dir.path()).unwrap();
        assert_eq!(config.project_name, "thesis");
        assert!(!config.save_aux_files);
        assert_eq!(config.build_options.engine, Engine::XeLatex);
        assert!(config.build_options.clean_build);
    }

    #[test]
    fn missing_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_NAME), "{}").unwrap();
        assert!(ProjectConfig::read(dir.path()).is_err());
    }
}
