//! Minimal external-tool invocation with a time budget.
//!
//! Conversion shells out to `pveam` (template cache queries) and `tar`
//! (template archive creation). On timeout the child gets SIGTERM, a 5 s
//! grace period, then SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};

use crate::{Error, Result};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs `program` with `args`, capturing stdout. Non-zero exit and timeout
/// both fail; stderr travels verbatim in the error.
pub(crate) async fn run(program: &str, args: &[&str], limit: Duration) -> Result<String> {
    let rendered = render(program, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain both pipes concurrently so a chatty child cannot block on a
    // full pipe buffer while we wait for it.
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

    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            terminate(&mut child).await;
            drain.abort();
            return Err(Error::ToolTimeout {
                command: rendered,
                secs: limit.as_secs(),
            });
        }
    };

    let (stdout, stderr) = drain.await.unwrap_or_default();
    if status.success() {
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    } else {
        Err(Error::Tool {
            command: rendered,
            code: status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
        })
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

/// Renders a command line for error messages.
fn render(program: &str, args: &[&str]) -> String {
    let mut out = String::from(program);
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}
