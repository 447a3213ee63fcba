//! OCI container state and its on-disk store.
//!
//! One `state/<container_id>.json` per live container, in the OCI runtime
//! state format plus the `vmid`, `created_at`, and `backend` extensions.
//! The directory is shared by every driver; the `backend` tag partitions
//! it. Writes are atomic (temp file + rename) under an exclusive advisory
//! lock; reads take a shared lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::lock::FileLock;
use crate::{Error, Result};

/// The OCI runtime spec version stamped into state files.
pub const OCI_VERSION: &str = "1.0.2";

/// Container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Status {
    /// Mid-create; visible to observers only after a crash.
    Creating,
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Frozen by SIGSTOP.
    Paused,
    /// Exited or stopped.
    Stopped,
}

impl Status {
    /// Lowercase status name, as serialized.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted OCI state of a managed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ContainerState {
    /// OCI runtime spec version.
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    /// Container id.
    pub id: String,
    /// Lifecycle status.
    pub status: Status,
    /// Init PID; 0 when unknown.
    #[serde(default)]
    pub pid: u32,
    /// Bundle directory the container was created from.
    pub bundle: PathBuf,
    /// Proxmox VMID (project extension; 0 for non-Proxmox backends).
    #[serde(default)]
    pub vmid: u32,
    /// Creation time, unix seconds (project extension).
    #[serde(default)]
    pub created_at: u64,
    /// Owning backend name (project extension). The state directory is
    /// shared by every driver; this tag is how each one finds its own
    /// entries. Empty when the document came from an external runtime.
    #[serde(default)]
    pub backend: String,
}

impl ContainerState {
    /// Fresh state in `creating`, pid 0, owned by `backend`.
    pub fn new(
        id: impl Into<String>,
        bundle: impl Into<PathBuf>,
        vmid: u32,
        backend: impl Into<String>,
    ) -> Self {
        Self {
            oci_version: OCI_VERSION.to_owned(),
            id: id.into(),
            status: Status::Creating,
            pid: 0,
            bundle: bundle.into(),
            vmid,
            created_at: unix_now(),
            backend: backend.into(),
        }
    }
}

/// Fails with `STATE_INVALID_TRANSITION` unless the container's status is in
/// `allowed`. State is left untouched by the caller on error.
pub fn require(state: &ContainerState, op: &'static str, allowed: &[Status]) -> Result<()> {
    if allowed.contains(&state.status) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            op,
            id: state.id.clone(),
            status: state.status,
        })
    }
}

/// Store of per-container OCI state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Opens (or creates) `<state_dir>/state/`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("state");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Atomically persists `state` under an exclusive lock.
    pub fn write(&self, state: &ContainerState) -> Result<()> {
        let path = self.path(&state.id);
        let _lock = FileLock::exclusive(&self.lock_path(&state.id))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Reads a container's state; `NOT_FOUND` when absent.
    pub fn read(&self, id: &str) -> Result<ContainerState> {
        self.try_read(id)?.ok_or_else(|| Error::NotFound {
            what: "container",
            name: id.to_owned(),
        })
    }

    /// Reads a container's state, `None` when absent.
    pub fn try_read(&self, id: &str) -> Result<Option<ContainerState>> {
        let path = self.path(id);
        let _lock = FileLock::shared(&self.lock_path(id))?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a container's state file. Absent is fine (idempotent delete).
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path(id);
        {
            let _lock = FileLock::exclusive(&self.lock_path(id))?;
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
        }
        let _ = fs::remove_file(self.lock_path(id));
        Ok(())
    }

    /// All persisted states, sorted by container id.
    pub fn list(&self) -> Result<Vec<ContainerState>> {
        let mut states = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(state) = self.try_read(id)? {
                states.push(state);
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }
}

/// Seconds since the epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
