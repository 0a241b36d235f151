//! latexmk as a local subprocess.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use remotex_core::{RemotexError, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::context::BuildContext;
use crate::executor::BuildExecutor;
use crate::flags::{driver_args, BuildJob};

/// How long to wait for the pipes to close once the driver's group is gone.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// Runs the driver directly on the host.
#[derive(Debug, Clone)]
pub struct NativeExecutor {
    program: String,
    prefix_args: Vec<String>,
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new("latexmk", Vec::<String>::new())
    }
}

impl NativeExecutor {
    /// `prefix_args` go before the generated driver arguments.
    pub fn new(program: impl Into<String>, prefix_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
        }
    }
}

/// The driver's process group. Killed once the driver is done or
/// abandoned, so helpers it forked cannot keep writing into the project.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // SAFETY: killpg only takes integers and sends a signal.
            let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pgid, error = %err, "failed to kill driver process group");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Read stdout and stderr concurrently into one buffer, in arrival order.
async fn drain(mut stdout: ChildStdout, mut stderr: ChildStderr) -> Vec<u8> {
    let mut merged = Vec::new();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => merged.extend_from_slice(&out_buf[..n]),
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => merged.extend_from_slice(&err_buf[..n]),
            },
        }
    }
    merged
}

fn classify(status: ExitStatus, output: String) -> Result<String> {
    if status.success() {
        return Ok(output);
    }
    match status.code() {
        Some(exit_code) => Err(RemotexError::Driver { exit_code, output }),
        None => Err(RemotexError::Internal {
            reason: format!("driver terminated abnormally ({status})"),
            output,
        }),
    }
}

#[async_trait]
impl BuildExecutor for NativeExecutor {
    async fn execute(&self, job: &BuildJob, ctx: &BuildContext) -> Result<String> {
        let dirs = &job.dirs;
        let aux = dirs.aux.as_ref().map(|p| p.to_string_lossy().into_owned());
        let out = dirs.out.to_string_lossy().into_owned();
        let args = driver_args(&job.options, aux.as_deref(), &out, &job.policy)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(&args)
            .current_dir(&dirs.src)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(shared) = &dirs.shared {
            // trailing `//` searches subdirectories, the empty entry keeps the defaults
            cmd.env("TEXINPUTS", format!("{}//:", shared.display()));
        }

        info!(program = %self.program, src = %dirs.src.display(), ?args, "starting native build");
        let mut child = cmd
            .spawn()
            .map_err(|e| RemotexError::internal(format!("failed to start {}: {e}", self.program)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RemotexError::internal("driver pipes unavailable"));
        };
        let mut group = ProcessGroup { pgid: child.id() };
        let drainer = tokio::spawn(drain(stdout, stderr));

        let waited = tokio::select! {
            status = child.wait() => Ok(status),
            reason = ctx.done() => {
                warn!(reason = reason.describe(), "killing native build");
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill driver");
                }
                Err(reason)
            }
        };
        // background helpers of a driver that already exited
        group.kill();

        let output = tokio::time::timeout(DRAIN_AFTER_KILL, drainer)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or_default();
        let output = String::from_utf8_lossy(&output).into_owned();
        debug!(bytes = output.len(), "driver output captured");

        match waited {
            Ok(Ok(status)) => classify(status, output),
            Ok(Err(e)) => Err(RemotexError::Internal {
                reason: format!("waiting for driver: {e}"),
                output,
            }),
            Err(reason) => Err(RemotexError::Internal {
                reason: reason.describe().to_string(),
                output,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::DriverDirs;
    use remotex_core::{BuildOptions, BuildPolicy};

    fn job(dir: &std::path::Path) -> BuildJob {
        for sub in ["src", "aux", "out"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        BuildJob {
            options: BuildOptions::default(),
            dirs: DriverDirs {
                src: dir.join("src"),
                aux: Some(dir.join("aux")),
                out: dir.join("out"),
                shared: None,
            },
            policy: BuildPolicy::default(),
        }
    }

    fn script(body: &str) -> NativeExecutor {
        NativeExecutor::new("sh", ["-c", body, "latexmk"])
    }

    #[tokio::test]
    async fn success_returns_merged_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script("echo out; echo err >&2; exit 0");
        let output = exec
            .execute(&job(dir.path()), &BuildContext::background())
            .await
            .unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn runs_in_src_with_generated_args() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script(r#"pwd; echo "$@""#);
        let output = exec
            .execute(&job(dir.path()), &BuildContext::background())
            .await
            .unwrap();
        assert!(output.contains("/src"));
        assert!(output.contains("-pdf"));
        assert!(output.contains("-norc"));
        assert!(output.contains("-interaction=batchmode"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_driver_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script("echo '! Undefined control sequence.'; exit 1");
        let err = exec
            .execute(&job(dir.path()), &BuildContext::background())
            .await
            .unwrap_err();
        match err {
            RemotexError::Driver { exit_code, output } => {
                assert_eq!(exit_code, 1);
                assert!(output.contains("Undefined control sequence"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_driver() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script("echo started; exec sleep 30");
        let ctx = BuildContext::background().with_timeout(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = exec.execute(&job(dir.path()), &ctx).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            RemotexError::Internal { reason, output } => {
                assert!(reason.contains("maximum duration"));
                assert!(output.contains("started"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_forked_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script("(sleep 1; echo late > ../out/late.pdf) & wait");
        let ctx = BuildContext::background().with_timeout(Duration::from_millis(200));
        let err = exec.execute(&job(dir.path()), &ctx).await.unwrap_err();
        assert!(matches!(err, RemotexError::Internal { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("out/late.pdf").exists());
    }

    #[tokio::test]
    async fn helpers_do_not_outlive_a_finished_driver() {
        let dir = tempfile::tempdir().unwrap();
        let exec = script("(sleep 1; echo late > ../out/late.pdf) & echo done");
        let started = std::time::Instant::now();
        let output = exec
            .execute(&job(dir.path()), &BuildContext::background())
            .await
            .unwrap();
        assert!(output.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("out/late.pdf").exists());
    }

    #[tokio::test]
    async fn missing_program_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let exec = NativeExecutor::new("/nonexistent/latexmk", Vec::<String>::new());
        let err = exec
            .execute(&job(dir.path()), &BuildContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, RemotexError::Internal { .. }));
    }

    #[tokio::test]
    async fn shared_dir_is_on_texinputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path());
        job.dirs.shared = Some(dir.path().join("shared"));
        let exec = script(r#"echo "TEXINPUTS=$TEXINPUTS""#);
        let output = exec.execute(&job, &BuildContext::background()).await.unwrap();
        assert!(output.contains("/shared//:"));
    }
}
