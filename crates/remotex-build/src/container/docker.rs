//! [`ContainerRuntime`] backed by the `docker` command line.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ContainerError, ContainerExit, ContainerRuntime, ContainerSpec, MountSource};

/// Drives a local Docker (or compatible) engine through its CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String, ContainerError> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ContainerError::Runtime(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// `docker create` arguments for `spec`.
pub fn create_args(spec: &ContainerSpec) -> Result<Vec<String>, ContainerError> {
    let mut args = vec!["create".to_string()];
    if spec.auto_remove {
        args.push("--rm".to_string());
    }
    args.push("--name".to_string());
    args.push(spec.name.clone());
    if spec.network_disabled {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    args.push("--workdir".to_string());
    args.push(spec.working_dir.clone());

    for mount in &spec.mounts {
        let value = match &mount.source {
            MountSource::Bind { host, read_only } => {
                let host = host.to_string_lossy();
                // commas separate --mount fields
                if host.contains(',') {
                    return Err(ContainerError::Runtime(format!(
                        "mount source {host} contains ','"
                    )));
                }
                let mut value = format!("type=bind,source={host},target={}", mount.target);
                if *read_only {
                    value.push_str(",readonly");
                }
                value
            }
            MountSource::Tmpfs => format!("type=tmpfs,target={}", mount.target),
        };
        args.push("--mount".to_string());
        args.push(value);
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    Ok(args)
}

/// Exit status the docker CLI uses for its own failures.
const DOCKER_CLI_FAILURE: i32 = 125;

/// Tell a container that ran and exited apart from a container that never
/// started: the latter is a runtime error, not the driver's exit status.
fn classify_start(exit_code: i32, stdout: &str, stderr: &str) -> Result<ContainerExit, ContainerError> {
    let daemon_error = stderr
        .lines()
        .find(|line| line.starts_with("Error response from daemon"));
    if exit_code != 0 {
        if let Some(line) = daemon_error {
            return Err(ContainerError::Runtime(line.trim().to_string()));
        }
        if exit_code == DOCKER_CLI_FAILURE {
            return Err(ContainerError::Runtime(format!(
                "docker start failed: {}",
                stderr.trim()
            )));
        }
    }
    let mut merged = stdout.to_string();
    merged.push_str(stderr);
    Ok(ContainerExit {
        exit_code,
        output: merged,
    })
}

fn is_gone(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("is not running")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let id = self.run(&create_args(spec)?).await?;
        if id.is_empty() {
            return Err(ContainerError::Runtime("create returned no id".into()));
        }
        debug!(%id, "container created");
        Ok(id)
    }

    async fn start_attached(&self, id: &str) -> Result<ContainerExit, ContainerError> {
        let output = Command::new(&self.program)
            .args(["start", "--attach", id])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        let exit_code = output
            .status
            .code()
            .ok_or_else(|| ContainerError::Runtime(format!("docker start terminated ({})", output.status)))?;
        classify_start(
            exit_code,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        let args = ["kill", "--signal", "KILL", id].map(String::from);
        match self.run(&args).await {
            Err(ContainerError::Runtime(stderr)) if is_gone(&stderr) => Err(ContainerError::Gone {
                id: id.to_string(),
            }),
            other => other.map(|_| ()),
        }
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        let mut child = Command::new(&self.program)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ContainerError::Runtime("docker pull pipes unavailable".into()));
        };
        // the pull is only complete once the progress stream is exhausted;
        // stderr is read alongside so a chatty failure cannot fill its pipe
        let progress = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                debug!(progress = %line);
            }
            Ok::<_, std::io::Error>(())
        };
        let mut errors = Vec::new();
        let (progress, collected) = tokio::join!(progress, stderr.read_to_end(&mut errors));
        progress?;
        collected?;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(ContainerError::Runtime(
                String::from_utf8_lossy(&errors).trim().to_string(),
            ))
        }
    }
}
