//! Backend drivers and dispatch.
//!
//! Every backend exposes the same lifecycle contract
//! (create/start/stop/kill/delete/exec/list/info/checkpoint/restore);
//! dispatch is a tagged variant so unsupported verbs return
//! `UNSUPPORTED_OPERATION` instead of panicking. Implementations differ
//! wildly underneath: `pct` for Proxmox LXC, the OCI runtime CLI for
//! crun/runc, `qm` for Proxmox VMs.

mod lxc;
mod oci_cli;
mod vm;

use std::path::Path;

pub use lxc::LxcDriver;
use nix::sys::signal::Signal;
pub use oci_cli::OciCliDriver;
use serde::Serialize;
pub use vm::VmDriver;

use crate::config::{BackendKind, Config};
use crate::state::ContainerState;
use crate::{Error, Result};

/// Observable record returned by `info` and `list`.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct ContainerInfo {
    /// Container id.
    pub id: String,
    /// Proxmox VMID, for the Proxmox backends.
    pub vmid: Option<u32>,
    /// Current status string.
    pub status: String,
    /// Template or image the container was created from, when known.
    pub image_or_template: Option<String>,
    /// Creation time, unix seconds (0 when unknown).
    pub created_at: u64,
    /// Owning backend.
    pub backend: &'static str,
    /// Known addresses (from the network configuration).
    pub addresses: Vec<String>,
}

/// Options for `exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    /// Extra environment (`KEY=VALUE`) for the command.
    pub env: Vec<String>,
    /// Allocate a terminal.
    pub tty: bool,
}

/// A resolved backend driver.
#[derive(Debug)]
#[non_exhaustive]
pub enum Backend {
    /// Proxmox LXC via `pct`.
    Lxc(LxcDriver),
    /// `crun`/`runc` via the OCI runtime CLI.
    OciCli(OciCliDriver),
    /// Proxmox QEMU via `qm`.
    Vm(VmDriver),
}

impl Backend {
    /// Instantiates the driver for `kind`, probing its prerequisites.
    pub fn new(kind: BackendKind, config: &Config) -> Result<Self> {
        match kind {
            BackendKind::ProxmoxLxc => Ok(Self::Lxc(LxcDriver::new(config)?)),
            BackendKind::Crun | BackendKind::Runc => {
                Ok(Self::OciCli(OciCliDriver::new(kind, config)?))
            }
            BackendKind::ProxmoxVm => Ok(Self::Vm(VmDriver::new(config)?)),
        }
    }

    /// The backend's configured name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Lxc(_) => "proxmox-lxc",
            Self::OciCli(driver) => driver.name(),
            Self::Vm(_) => "proxmox-vm",
        }
    }

    /// Creates a container from an OCI bundle.
    pub async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        match self {
            Self::Lxc(d) => d.create(id, bundle).await,
            Self::OciCli(d) => d.create(id, bundle).await,
            Self::Vm(d) => d.create(id, bundle),
        }
    }

    /// Starts a created (or stopped) container.
    pub async fn start(&self, id: &str) -> Result<()> {
        match self {
            Self::Lxc(d) => d.start(id).await,
            Self::OciCli(d) => d.start(id).await,
            Self::Vm(d) => d.start(id).await,
        }
    }

    /// Gracefully stops a running container, escalating on timeout.
    pub async fn stop(&self, id: &str) -> Result<()> {
        match self {
            Self::Lxc(d) => d.stop(id).await,
            Self::OciCli(d) => d.stop(id).await,
            Self::Vm(d) => d.stop(id).await,
        }
    }

    /// Sends a signal to the container's init process.
    pub async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        match self {
            Self::Lxc(d) => d.kill(id, signal).await,
            Self::OciCli(d) => d.kill(id, signal).await,
            Self::Vm(d) => d.kill(id, signal).await,
        }
    }

    /// Deletes a stopped container. Idempotent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        match self {
            Self::Lxc(d) => d.delete(id).await,
            Self::OciCli(d) => d.delete(id).await,
            Self::Vm(d) => d.delete(id).await,
        }
    }

    /// Runs a command inside a running container; returns its exit code.
    pub async fn exec(&self, id: &str, argv: &[String], opts: &ExecOpts) -> Result<i32> {
        match self {
            Self::Lxc(d) => d.exec(id, argv, opts).await,
            Self::OciCli(d) => d.exec(id, argv, opts).await,
            Self::Vm(_) => Err(Error::Unsupported {
                backend: "proxmox-vm",
                op: "exec",
            }),
        }
    }

    /// Lists this backend's containers.
    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        match self {
            Self::Lxc(d) => d.list().await,
            Self::OciCli(d) => d.list().await,
            Self::Vm(d) => d.list().await,
        }
    }

    /// Detailed record for one container.
    pub async fn info(&self, id: &str) -> Result<ContainerInfo> {
        match self {
            Self::Lxc(d) => d.info(id).await,
            Self::OciCli(d) => d.info(id).await,
            Self::Vm(d) => d.info(id).await,
        }
    }

    /// The container's OCI state document.
    pub async fn state(&self, id: &str) -> Result<ContainerState> {
        match self {
            Self::Lxc(d) => d.state(id),
            Self::OciCli(d) => d.state(id).await,
            Self::Vm(d) => d.state(id),
        }
    }

    /// Captures filesystem state; returns the snapshot name or image path.
    pub async fn checkpoint(&self, id: &str, image_dir: Option<&Path>) -> Result<String> {
        match self {
            Self::Lxc(d) => d.checkpoint(id, image_dir).await,
            Self::OciCli(d) => Err(Error::Unsupported {
                backend: d.name(),
                op: "checkpoint",
            }),
            Self::Vm(_) => Err(Error::Unsupported {
                backend: "proxmox-vm",
                op: "checkpoint",
            }),
        }
    }

    /// Restores filesystem state from a named or the latest checkpoint.
    pub async fn restore(&self, id: &str, snapshot: Option<&str>) -> Result<String> {
        match self {
            Self::Lxc(d) => d.restore(id, snapshot).await,
            Self::OciCli(d) => Err(Error::Unsupported {
                backend: d.name(),
                op: "restore",
            }),
            Self::Vm(_) => Err(Error::Unsupported {
                backend: "proxmox-vm",
                op: "restore",
            }),
        }
    }
}

/// Parses a signal given as a number (`9`), a short name (`KILL`), or a full
/// name (`SIGKILL`).
pub fn parse_signal(input: &str) -> Result<Signal> {
    let invalid = || Error::SpecInvalid {
        path: "signal".to_owned(),
        reason: format!("'{input}' is not a recognized signal"),
    };

    if let Ok(num) = input.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| invalid());
    }
    let upper = input.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse().map_err(|_| invalid())
}

/// Signals that terminate the container rather than being forwarded.
pub(crate) const fn is_terminating(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGTERM | Signal::SIGKILL | Signal::SIGINT | Signal::SIGQUIT | Signal::SIGHUP
    )
}

/// Signal name without the `SIG` prefix (`kill -TERM` spelling).
pub(crate) fn short_name(signal: Signal) -> &'static str {
    signal.as_str().strip_prefix("SIG").unwrap_or(signal.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parsing() {
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("4096").is_err());
    }

    #[test]
    fn terminating_set() {
        assert!(is_terminating(Signal::SIGTERM));
        assert!(is_terminating(Signal::SIGKILL));
        assert!(!is_terminating(Signal::SIGSTOP));
        assert!(!is_terminating(Signal::SIGUSR1));
    }

    #[test]
    fn short_names() {
        assert_eq!(short_name(Signal::SIGTERM), "TERM");
        assert_eq!(short_name(Signal::SIGUSR1), "USR1");
    }
}
