//! `crun`/`runc` adapter.
//!
//! Thin pass-through to an external runtime speaking the OCI runtime
//! command-line convention. The runtime owns its own state; no VMID, no
//! template conversion, no `pct`. Checkpoint and restore are reported as
//! unsupported by the dispatcher.

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use serde::Deserialize;

use super::{ContainerInfo, ExecOpts, short_name};
use crate::cmd::{self, Cmd};
use crate::config::{BackendKind, Config};
use crate::state::ContainerState;
use crate::{Error, Result};

/// Adapter over an OCI runtime binary.
#[derive(Debug)]
pub struct OciCliDriver {
    name: &'static str,
    binary: PathBuf,
}

impl OciCliDriver {
    /// Builds the adapter for `crun` or `runc`, probing the binary.
    pub fn new(kind: BackendKind, config: &Config) -> Result<Self> {
        let (name, options) = match kind {
            BackendKind::Crun => ("crun", &config.backends.crun),
            BackendKind::Runc => ("runc", &config.backends.runc),
            other => {
                return Err(Error::Internal(format!(
                    "OCI CLI adapter cannot drive '{other}'"
                )));
            }
        };
        let binary = options
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(name));
        let present = (binary.is_absolute() && binary.is_file())
            || cmd::probe(&binary.to_string_lossy());
        if !present {
            return Err(Error::BackendUnavailable {
                backend: name,
                reason: format!("`{}` not found", binary.display()),
            });
        }
        Ok(Self { name, binary })
    }

    /// The runtime's name (`crun` or `runc`).
    pub const fn name(&self) -> &'static str {
        self.name
    }

    fn bin(&self) -> String {
        self.binary.to_string_lossy().into_owned()
    }

    /// `<runtime> create --bundle <dir> <id>`
    pub async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        Cmd::new("create", self.bin())
            .args(["create", "--bundle"])
            .arg(bundle.to_string_lossy())
            .arg(id)
            .run()
            .await
    }

    /// `<runtime> start <id>`
    pub async fn start(&self, id: &str) -> Result<()> {
        Cmd::new("start", self.bin()).args(["start", id]).run().await
    }

    /// SIGTERM through the runtime; the runtime handles escalation policy.
    pub async fn stop(&self, id: &str) -> Result<()> {
        Cmd::new("stop", self.bin())
            .args(["kill", id, "TERM"])
            .run()
            .await
    }

    /// `<runtime> kill <id> <SIG>`
    pub async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        Cmd::new("kill", self.bin())
            .args(["kill", id, short_name(signal)])
            .run()
            .await
    }

    /// `<runtime> delete <id>`; absorbs "does not exist" for idempotency.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = Cmd::new("delete", self.bin()).args(["delete", id]).run().await;
        match result {
            Err(Error::CommandFailed { stderr, .. })
                if stderr.to_ascii_lowercase().contains("does not exist") =>
            {
                tracing::debug!(container_id = id, "delete: nothing to do");
                Ok(())
            }
            other => other,
        }
    }

    /// `<runtime> exec <id> -- <argv>` with proxied stdio.
    pub async fn exec(&self, id: &str, argv: &[String], opts: &ExecOpts) -> Result<i32> {
        let mut args: Vec<String> = vec!["exec".into()];
        if opts.tty {
            args.push("--tty".into());
        }
        for kv in &opts.env {
            args.push("--env".into());
            args.push(kv.clone());
        }
        args.push(id.to_owned());
        args.extend(argv.iter().cloned());
        Cmd::new("exec", self.bin()).args(args).passthrough().await
    }

    /// `<runtime> list --format json`
    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let out = Cmd::new("list", self.bin())
            .args(["list", "--format", "json"])
            .output()
            .await?;
        let rows = parse_list(&out.stdout)?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerInfo {
                id: row.id,
                vmid: None,
                status: row.status,
                image_or_template: Some(row.bundle.clone()),
                created_at: 0,
                backend: self.name,
                addresses: Vec::new(),
            })
            .collect())
    }

    /// `<runtime> state <id>` summarized into the info record.
    pub async fn info(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.state(id).await?;
        Ok(ContainerInfo {
            id: state.id,
            vmid: None,
            status: state.status.to_string(),
            image_or_template: Some(state.bundle.display().to_string()),
            created_at: state.created_at,
            backend: self.name,
            addresses: Vec::new(),
        })
    }

    /// `<runtime> state <id>`, parsed as an OCI state document.
    pub async fn state(&self, id: &str) -> Result<ContainerState> {
        let out = Cmd::new("info", self.bin()).args(["state", id]).output().await?;
        Ok(serde_json::from_str(&out.stdout)?)
    }
}

/// One row of `list --format json` output.
#[derive(Debug, Deserialize)]
struct ListRow {
    id: String,
    status: String,
    #[serde(default)]
    bundle: String,
}

fn parse_list(stdout: &str) -> Result<Vec<ListRow>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(stdout)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn list_json_parsing() {
        let out = r#"[
            {"ociVersion":"1.0.2","id":"web","pid":312,"status":"running",
             "bundle":"/srv/bundles/web","created":"2026-07-01T10:00:00Z","owner":""},
            {"id":"db","pid":0,"status":"stopped","bundle":"/srv/bundles/db"}
        ]"#;
        let rows = parse_list(out).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "web");
        assert_eq!(rows[0].status, "running");
        assert_eq!(rows[1].bundle, "/srv/bundles/db");
    }

    #[test]
    fn empty_list_output() {
        assert!(parse_list("").unwrap().is_empty());
        assert!(parse_list("  \n").unwrap().is_empty());
    }

    #[test]
    fn state_document_parsing() {
        let raw = r#"{"ociVersion":"1.0.2","id":"web","status":"running",
                      "pid":312,"bundle":"/srv/bundles/web"}"#;
        let state: ContainerState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.id, "web");
        assert_eq!(state.pid, 312);
        assert_eq!(state.vmid, 0);
    }
}
