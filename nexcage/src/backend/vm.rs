//! Proxmox VM (`qm`) adapter.
//!
//! Lifecycle-signature compatibility only: the bundle → VM conversion is a
//! stub, so `create` is unsupported, and the remaining verbs drive `qm`
//! against a mapping and a state file (tagged `proxmox-vm`) provisioned
//! out-of-band.

use nix::sys::signal::Signal;

use super::{ContainerInfo, is_terminating};
use crate::cmd::{self, Cmd};
use crate::config::Config;
use crate::mapping::MappingStore;
use crate::state::{self, ContainerState, StateStore, Status};
use crate::{Error, Result};

/// This driver's name, as routed and as tagged into state files.
const BACKEND_NAME: &str = "proxmox-vm";

/// The Proxmox QEMU backend.
#[derive(Debug)]
pub struct VmDriver {
    mapping: MappingStore,
    state: StateStore,
}

impl VmDriver {
    /// Builds the driver, probing for `qm`.
    pub fn new(config: &Config) -> Result<Self> {
        if !cmd::probe("qm") {
            return Err(Error::BackendUnavailable {
                backend: BACKEND_NAME,
                reason: "`qm` not found in PATH".to_owned(),
            });
        }
        Ok(Self {
            mapping: MappingStore::open(&config.state_dir)?,
            state: StateStore::open(&config.state_dir)?,
        })
    }

    /// Bundle → VM conversion is not implemented.
    pub fn create(&self, _id: &str, _bundle: &std::path::Path) -> Result<()> {
        Err(Error::Unsupported {
            backend: BACKEND_NAME,
            op: "create",
        })
    }

    /// `qm start <vmid>`
    pub async fn start(&self, id: &str) -> Result<()> {
        let mut st = self.state.read(id)?;
        state::require(&st, "start", &[Status::Created, Status::Stopped])?;
        let vmid = st.vmid.to_string();
        Cmd::new("start", "qm")
            .args(["start", vmid.as_str()])
            .run()
            .await?;
        st.status = Status::Running;
        self.state.write(&st)
    }

    /// `qm shutdown <vmid>`, falling back to `qm stop`.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut st = self.state.read(id)?;
        if st.status == Status::Stopped {
            return Ok(());
        }
        state::require(&st, "stop", &[Status::Running, Status::Paused])?;
        let vmid = st.vmid.to_string();
        if Cmd::new("stop", "qm")
            .args(["shutdown", vmid.as_str()])
            .run()
            .await
            .is_err()
        {
            Cmd::new("stop", "qm")
                .args(["stop", vmid.as_str()])
                .run()
                .await?;
        }
        st.status = Status::Stopped;
        st.pid = 0;
        self.state.write(&st)
    }

    /// Terminating signals map to `qm stop`; anything else is unsupported
    /// for VMs.
    pub async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        if !is_terminating(signal) {
            return Err(Error::Unsupported {
                backend: BACKEND_NAME,
                op: "kill (non-terminating signal)",
            });
        }
        let mut st = self.state.read(id)?;
        state::require(&st, "kill", &[Status::Running, Status::Paused])?;
        let vmid = st.vmid.to_string();
        Cmd::new("kill", "qm")
            .args(["stop", vmid.as_str()])
            .run()
            .await?;
        st.status = Status::Stopped;
        st.pid = 0;
        self.state.write(&st)
    }

    /// `qm destroy <vmid>`; releases the mapping and state. Idempotent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let st = self.state.try_read(id)?;
        let entry = self.mapping.lookup(id)?;
        if st.is_none() && entry.is_none() {
            return Ok(());
        }
        if let Some(st) = &st {
            state::require(
                st,
                "delete",
                &[Status::Creating, Status::Created, Status::Stopped],
            )?;
        }
        if let Some(entry) = &entry {
            let vmid = entry.vmid.to_string();
            let destroy = Cmd::new("delete", "qm")
                .args(["destroy", vmid.as_str()])
                .run()
                .await;
            match destroy {
                Err(Error::CommandFailed { stderr, .. })
                    if stderr.to_ascii_lowercase().contains("does not exist") =>
                {
                    tracing::debug!(vmid = entry.vmid, "VM already gone");
                }
                other => other?,
            }
        }
        self.mapping.release(id)?;
        self.state.delete(id)
    }

    /// This driver's containers from the shared state store (entries tagged
    /// `proxmox-vm`), with status refreshed via `qm status` where possible.
    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut infos = Vec::new();
        for st in self.state.list()? {
            if st.backend != BACKEND_NAME {
                continue;
            }
            infos.push(self.info_record(st).await);
        }
        Ok(infos)
    }

    /// State file merged with `qm status`.
    pub async fn info(&self, id: &str) -> Result<ContainerInfo> {
        let st = self.state.read(id)?;
        Ok(self.info_record(st).await)
    }

    async fn info_record(&self, st: ContainerState) -> ContainerInfo {
        let vmid = st.vmid.to_string();
        let status = Cmd::new("info", "qm")
            .args(["status", vmid.as_str()])
            .output()
            .await
            .ok()
            .and_then(|out| parse_qm_status(&out.stdout))
            .unwrap_or_else(|| st.status.to_string());
        ContainerInfo {
            id: st.id,
            vmid: Some(st.vmid),
            status,
            image_or_template: None,
            created_at: st.created_at,
            backend: BACKEND_NAME,
            addresses: Vec::new(),
        }
    }

    /// The container's persisted OCI state.
    pub fn state(&self, id: &str) -> Result<ContainerState> {
        self.state.read(id)
    }
}

/// The status value from `qm status` output (`status: running`).
fn parse_qm_status(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("status:")
            .map(|rest| rest.trim().to_owned())
    })
}
