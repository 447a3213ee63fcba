//! External command execution.
//!
//! Every backend shells out (`pct`, `pvesm`, `zfs`, `crun`, `qm`); this
//! module is the single place that spawns, captures, times out, and kills
//! those children. Non-zero exits always surface as errors carrying the
//! command line, exit code, and stderr verbatim.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};

use crate::{Error, Result};

/// Default budget for external commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for `create`-class commands.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Grace between SIGTERM and SIGKILL when a timed-out child is reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Captured output of a finished command.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CmdOutput {
    /// Stdout, lossily decoded.
    pub stdout: String,
    /// Stderr, lossily decoded.
    pub stderr: String,
}

/// A single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    op: &'static str,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Cmd {
    /// New command attributed to lifecycle operation `op`.
    pub fn new(op: &'static str, program: impl Into<String>) -> Self {
        Self {
            op,
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Overrides the time budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The rendered command line, for logs and errors.
    pub fn rendered(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    /// Runs the command, capturing output. Non-zero exit is an error.
    pub async fn output(&self) -> Result<CmdOutput> {
        let rendered = self.rendered();
        tracing::debug!(command = %rendered, "running");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes while waiting so the child can't block on a full
        // pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let drain = tokio::spawn(async move {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            (stdout, stderr)
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                terminate(&mut child).await;
                drain.abort();
                return Err(Error::Timeout {
                    op: self.op,
                    budget: self.timeout,
                });
            }
        };

        let (stdout, stderr) = drain.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_owned();

        if status.success() {
            Ok(CmdOutput { stdout, stderr })
        } else {
            Err(Error::CommandFailed {
                op: self.op,
                command: rendered,
                code: status.code().unwrap_or(-1),
                stderr,
            })
        }
    }

    /// Runs the command, discarding stdout.
    pub async fn run(&self) -> Result<()> {
        self.output().await.map(|_| ())
    }

    /// Runs with inherited stdio (for `exec`), returning the exit code
    /// verbatim; a signal-terminated child yields `128 + signo`.
    pub async fn passthrough(&self) -> Result<i32> {
        use std::os::unix::process::ExitStatusExt as _;

        tracing::debug!(command = %self.rendered(), "running (passthrough)");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let status = child.wait().await?;
        Ok(status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1))
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(raw) = child.id()
        && let Ok(pid) = i32::try_from(raw)
    {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Whether `program` resolves to an executable on `PATH`.
pub fn probe(program: &str) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(program);
        if let Ok(meta) = candidate.metadata()
            && meta.is_file()
            && meta.permissions().mode() & 0o111 != 0
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = Cmd::new("info", "echo").arg("hello").output().await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let err = Cmd::new("info", "sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .output()
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed {
                op, code, stderr, ..
            } => {
                assert_eq!(op, "info");
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let err = Cmd::new("start", "sleep")
            .arg("30")
            .timeout(Duration::from_millis(200))
            .output()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TIMEOUT");
    }

    #[tokio::test]
    async fn passthrough_returns_exit_code() {
        let code = Cmd::new("exec", "sh")
            .args(["-c", "exit 7"])
            .passthrough()
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn probe_finds_sh() {
        assert!(probe("sh"));
        assert!(!probe("definitely-not-a-real-binary-name"));
    }
}
