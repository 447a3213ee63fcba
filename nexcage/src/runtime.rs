//! One-shot runtime facade.
//!
//! The only API the CLI consumes: loads configuration once, validates the
//! container id, routes to a backend driver, and dispatches a single
//! lifecycle operation. Each process invocation executes one operation and
//! exits; cross-process correctness comes from the stores' file locks.

use std::path::Path;

use nix::sys::signal::Signal;

use crate::backend::{Backend, ContainerInfo, ExecOpts};
use crate::config::{Config, Overrides};
use crate::state::ContainerState;
use crate::{Error, Result, validate};

/// The NexCage runtime.
#[derive(Debug)]
pub struct Runtime {
    config: Config,
}

impl Runtime {
    /// Resolves the effective configuration. Called once per process.
    pub fn open(overrides: &Overrides) -> Result<Self> {
        let config = Config::load(overrides)?;
        Ok(Self { config })
    }

    /// The effective configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Routes a container id to its backend driver, probing prerequisites.
    fn backend_for(&self, id: &str) -> Result<Backend> {
        validate::container_id(id)?;
        let kind = self.config.backend_for(id);
        tracing::debug!(container_id = id, backend = %kind, "routed");
        Backend::new(kind, &self.config)
    }

    /// Creates a container from an OCI bundle directory.
    pub async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        self.backend_for(id)?.create(id, bundle).await
    }

    /// Starts a created or stopped container.
    pub async fn start(&self, id: &str) -> Result<()> {
        self.backend_for(id)?.start(id).await
    }

    /// Gracefully stops a container.
    pub async fn stop(&self, id: &str) -> Result<()> {
        self.backend_for(id)?.stop(id).await
    }

    /// Sends a signal to a container's init process.
    pub async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        self.backend_for(id)?.kill(id, signal).await
    }

    /// Deletes a stopped container. Idempotent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.backend_for(id)?.delete(id).await
    }

    /// Runs a command in a running container; returns its exit code.
    pub async fn exec(&self, id: &str, argv: &[String], opts: &ExecOpts) -> Result<i32> {
        self.backend_for(id)?.exec(id, argv, opts).await
    }

    /// Lists containers across every backend this configuration can route
    /// to (the default plus each routing target). A backend whose tool is
    /// absent on this host is skipped with a warning so it cannot hide the
    /// others' containers.
    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut infos = Vec::new();
        for kind in self.config.configured_backends() {
            match Backend::new(kind, &self.config) {
                Ok(backend) => infos.extend(backend.list().await?),
                Err(Error::BackendUnavailable { backend, reason }) => {
                    tracing::warn!(backend, reason = %reason, "skipping unavailable backend in list");
                }
                Err(e) => return Err(e),
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    /// Detailed record for one container.
    pub async fn info(&self, id: &str) -> Result<ContainerInfo> {
        self.backend_for(id)?.info(id).await
    }

    /// The container's OCI state document.
    pub async fn state(&self, id: &str) -> Result<ContainerState> {
        self.backend_for(id)?.state(id).await
    }

    /// Captures filesystem state; returns the snapshot name or image path.
    pub async fn checkpoint(&self, id: &str, image_dir: Option<&Path>) -> Result<String> {
        self.backend_for(id)?.checkpoint(id, image_dir).await
    }

    /// Restores filesystem state from a named or the latest checkpoint.
    /// Does not start the container.
    pub async fn restore(&self, id: &str, snapshot: Option<&str>) -> Result<String> {
        self.backend_for(id)?.restore(id, snapshot).await
    }
}
