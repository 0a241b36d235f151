//! Server-side build configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use remotex_core::BuildPolicy;
use serde::{Deserialize, Serialize};

/// Default TeX Live image for containerized builds.
pub const DEFAULT_IMAGE: &str = "texlive/texlive:latest";

/// Where the driver runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// latexmk as a local subprocess
    #[default]
    Native,
    /// latexmk inside an ephemeral container
    Container,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Native => f.write_str("native"),
            BuildMode::Container => f.write_str("container"),
        }
    }
}

impl FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(BuildMode::Native),
            "container" | "docker" => Ok(BuildMode::Container),
            other => Err(format!("unknown build mode: {other}")),
        }
    }
}

/// Configuration for the build service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of all project trees (`<root>/<owner>/<project>`)
    pub projects_root: PathBuf,
    /// Read-only include directory exposed to every build
    pub shared_dir: Option<PathBuf>,
    pub build_mode: BuildMode,
    /// Builds running longer than this are cancelled
    pub max_build_time_secs: u64,
    /// Upload size limit in bytes
    pub max_file_size: u64,
    pub policy: BuildPolicy,
    pub container_image: String,
    /// How long a container kill may take before it counts as failed
    pub kill_grace_secs: u64,
    /// Native driver executable
    pub driver: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("projects"),
            shared_dir: None,
            build_mode: BuildMode::Native,
            max_build_time_secs: 120,
            max_file_size: 50 * 1024 * 1024,
            policy: BuildPolicy::default(),
            container_image: DEFAULT_IMAGE.to_string(),
            kill_grace_secs: 5,
            driver: "latexmk".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn max_build_time(&self) -> Duration {
        Duration::from_secs(self.max_build_time_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}
