//! Proxmox LXC driver.
//!
//! Drives the `pct` CLI through the full lifecycle: template conversion,
//! deterministic VMID allocation, `pct create` argument composition, mount
//! and feature application, post-create verification via `pct config`, and
//! the start/stop/kill/delete/exec/list/info verbs. All operations are
//! synchronous and return when `pct` reports completion or the budget runs
//! out.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nexcage_oci::{Bundle, Converter, Cpu, Mount, NamespaceType, Spec};
use nix::sys::signal::Signal;

use super::{ContainerInfo, ExecOpts, is_terminating, short_name};
use crate::checkpoint::CheckpointEngine;
use crate::cmd::{self, CREATE_TIMEOUT, Cmd};
use crate::config::{Config, LxcOptions};
use crate::mapping::MappingStore;
use crate::state::{self, ContainerState, StateStore, Status};
use crate::{Error, Result};

/// This driver's name, as routed and as tagged into state files.
const BACKEND_NAME: &str = "proxmox-lxc";

/// Where Proxmox keeps per-container LXC configuration.
const PVE_LXC_CONF_DIR: &str = "/etc/pve/lxc";

/// Sleep between startup readiness probes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The Proxmox LXC backend.
#[derive(Debug)]
pub struct LxcDriver {
    opts: LxcOptions,
    converter: Converter,
    mapping: MappingStore,
    state: StateStore,
}

impl LxcDriver {
    /// Builds the driver, probing for `pct`.
    pub fn new(config: &Config) -> Result<Self> {
        if !cmd::probe("pct") {
            return Err(Error::BackendUnavailable {
                backend: BACKEND_NAME,
                reason: "`pct` not found in PATH".to_owned(),
            });
        }
        let opts = config.backends.lxc.clone();
        let converter = Converter::new(&config.template_dir, &opts.storage)
            .keep_staging(config.debug);
        Ok(Self {
            opts,
            converter,
            mapping: MappingStore::open(&config.state_dir)?,
            state: StateStore::open(&config.state_dir)?,
        })
    }

    /// Creates a container from an OCI bundle.
    pub async fn create(&self, id: &str, bundle_dir: &Path) -> Result<()> {
        if self.state.try_read(id)?.is_some() {
            return Err(Error::AlreadyExists {
                what: "container",
                name: id.to_owned(),
            });
        }

        let bundle = Bundle::load(bundle_dir)?;
        let template = self.converter.resolve(&bundle, id).await?;

        let reserved = self.reserved_vmids().await?;
        let vmid = self.mapping.allocate(id, bundle_dir, &reserved)?;

        // Transient `creating` marker; a crash from here on is recovered by
        // an idempotent delete.
        self.state
            .write(&ContainerState::new(id, bundle_dir, vmid, BACKEND_NAME))?;

        let limits = EffectiveLimits::resolve(&bundle.spec, &self.opts);
        let args = create_args(vmid, &template.path, &bundle, id, &limits, &self.opts);
        Cmd::new("create", "pct")
            .args(args)
            .timeout(CREATE_TIMEOUT)
            .run()
            .await?;

        self.apply_mounts(vmid, &bundle.spec.mounts).await?;
        self.apply_features(vmid, &bundle.spec).await?;
        self.verify(vmid, &bundle.spec, &limits).await?;

        let mut created = ContainerState::new(id, bundle_dir, vmid, BACKEND_NAME);
        created.status = Status::Created;
        self.state.write(&created)?;
        tracing::info!(container_id = id, vmid, template = %template.name, "container created");
        Ok(())
    }

    /// Starts the container and waits for `pct status` to report `running`.
    pub async fn start(&self, id: &str) -> Result<()> {
        let mut st = self.state.read(id)?;
        state::require(&st, "start", &[Status::Created, Status::Stopped])?;

        let vmid = st.vmid.to_string();
        Cmd::new("start", "pct")
            .args(["start", vmid.as_str()])
            .run()
            .await?;
        self.wait_running(st.vmid).await?;

        st.status = Status::Running;
        st.pid = self.query_pid(st.vmid).await;
        self.state.write(&st)?;
        tracing::info!(container_id = id, vmid = st.vmid, pid = st.pid, "container started");
        Ok(())
    }

    /// Graceful shutdown; escalates to a hard stop when the grace period
    /// runs out. Idempotent on already-stopped containers.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut st = self.state.read(id)?;
        if st.status == Status::Stopped {
            tracing::debug!(container_id = id, "already stopped");
            return Ok(());
        }
        state::require(&st, "stop", &[Status::Running, Status::Paused])?;

        let vmid = st.vmid.to_string();
        let grace = self.opts.stop_timeout_secs.to_string();
        let shutdown = Cmd::new("stop", "pct")
            .args(["shutdown", vmid.as_str(), "--timeout", grace.as_str()])
            .timeout(Duration::from_secs(self.opts.stop_timeout_secs + 10))
            .run()
            .await;
        if let Err(e) = shutdown {
            tracing::warn!(container_id = id, error = %e, "graceful shutdown failed; forcing stop");
            Cmd::new("stop", "pct")
                .args(["stop", vmid.as_str()])
                .run()
                .await?;
        }

        st.status = Status::Stopped;
        st.pid = 0;
        self.state.write(&st)
    }

    /// Sends `signal` to the container's init.
    ///
    /// Terminating signals go through `pct stop`; SIGSTOP/SIGCONT pause and
    /// resume; anything else is forwarded via `pct exec` with state
    /// untouched.
    pub async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        let mut st = self.state.read(id)?;
        let vmid = st.vmid.to_string();

        match signal {
            Signal::SIGSTOP => {
                state::require(&st, "kill", &[Status::Running])?;
                self.signal_init(&vmid, "STOP").await?;
                st.status = Status::Paused;
            }
            Signal::SIGCONT => {
                state::require(&st, "kill", &[Status::Paused])?;
                self.signal_init(&vmid, "CONT").await?;
                st.status = Status::Running;
            }
            s if is_terminating(s) => {
                state::require(&st, "kill", &[Status::Running, Status::Paused])?;
                Cmd::new("kill", "pct")
                    .args(["stop", vmid.as_str()])
                    .run()
                    .await?;
                st.status = Status::Stopped;
                st.pid = 0;
            }
            other => {
                state::require(&st, "kill", &[Status::Running])?;
                self.signal_init(&vmid, short_name(other)).await?;
                return Ok(());
            }
        }
        self.state.write(&st)
    }

    /// Destroys the container and releases its mapping and state.
    /// Idempotent: succeeds when nothing is left to remove.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let st = self.state.try_read(id)?;
        let entry = self.mapping.lookup(id)?;
        if st.is_none() && entry.is_none() {
            tracing::debug!(container_id = id, "delete: nothing to do");
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
            let destroy = Cmd::new("delete", "pct")
                .args(["destroy", vmid.as_str()])
                .run()
                .await;
            match destroy {
                Err(Error::CommandFailed { stderr, .. }) if is_not_found_stderr(&stderr) => {
                    tracing::debug!(vmid = entry.vmid, "CT already gone");
                }
                other => other?,
            }
        }

        self.mapping.release(id)?;
        self.state.delete(id)?;
        tracing::info!(container_id = id, "container deleted");
        Ok(())
    }

    /// Runs a command inside the container, proxying stdio. Returns the
    /// command's exit code verbatim.
    pub async fn exec(&self, id: &str, argv: &[String], opts: &ExecOpts) -> Result<i32> {
        let st = self.state.read(id)?;
        state::require(&st, "exec", &[Status::Running])?;

        let mut args: Vec<String> = vec!["exec".into(), st.vmid.to_string(), "--".into()];
        if !opts.env.is_empty() {
            args.push("/usr/bin/env".into());
            args.extend(opts.env.iter().cloned());
        }
        args.extend(argv.iter().cloned());
        Cmd::new("exec", "pct").args(args).passthrough().await
    }

    /// This driver's containers, with status refreshed from the live host
    /// where possible. The state directory is shared with the other
    /// drivers; only entries tagged `proxmox-lxc` belong here.
    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let mut infos = Vec::new();
        for mut st in self.state.list()? {
            if st.backend != BACKEND_NAME {
                continue;
            }
            if let Ok(live) = self.query_status(st.vmid).await
                && let Some(next) = reconcile(st.status, &live)
            {
                st.status = next;
                let _ = self.state.write(&st);
            }
            infos.push(ContainerInfo {
                id: st.id.clone(),
                vmid: Some(st.vmid),
                status: st.status.to_string(),
                image_or_template: None,
                created_at: st.created_at,
                backend: BACKEND_NAME,
                addresses: Vec::new(),
            });
        }
        Ok(infos)
    }

    /// State file + `pct config` + `pct status` merged into one record.
    pub async fn info(&self, id: &str) -> Result<ContainerInfo> {
        let mut st = self.state.read(id)?;
        if let Ok(live) = self.query_status(st.vmid).await
            && let Some(next) = reconcile(st.status, &live)
        {
            st.status = next;
            let _ = self.state.write(&st);
        }

        let vmid = st.vmid.to_string();
        let summary = Cmd::new("info", "pct")
            .args(["config", vmid.as_str()])
            .output()
            .await
            .map(|out| parse_config_summary(&out.stdout))
            .unwrap_or_default();

        Ok(ContainerInfo {
            id: st.id.clone(),
            vmid: Some(st.vmid),
            status: st.status.to_string(),
            image_or_template: summary.template,
            created_at: st.created_at,
            backend: BACKEND_NAME,
            addresses: summary.addresses,
        })
    }

    /// The container's persisted OCI state.
    pub fn state(&self, id: &str) -> Result<ContainerState> {
        self.state.read(id)
    }

    /// ZFS-preferred filesystem checkpoint.
    pub async fn checkpoint(&self, id: &str, image_dir: Option<&Path>) -> Result<String> {
        let st = self.state.read(id)?;
        CheckpointEngine::new(self.opts.zfs_pool.clone())
            .checkpoint(id, st.pid, image_dir)
            .await
    }

    /// Rolls the rootfs dataset back; never touches the state file.
    pub async fn restore(&self, id: &str, snapshot: Option<&str>) -> Result<String> {
        self.state.read(id)?;
        CheckpointEngine::new(self.opts.zfs_pool.clone())
            .restore(id, snapshot)
            .await
    }

    /// VMIDs already in use on this host, per `pct list`.
    async fn reserved_vmids(&self) -> Result<BTreeSet<u32>> {
        let out = Cmd::new("create", "pct").args(["list"]).output().await?;
        Ok(parse_pct_list(&out.stdout))
    }

    /// Appends `mp<i>` entries to the container's Proxmox config file.
    async fn apply_mounts(&self, vmid: u32, mounts: &[Mount]) -> Result<()> {
        let mut lines = Vec::new();
        for mount in mounts {
            let Some(source) = &mount.source else {
                tracing::debug!(
                    destination = %mount.destination.display(),
                    "mount without source left to LXC defaults"
                );
                continue;
            };
            self.check_mount_source(source).await?;
            lines.push(mount_line(lines.len(), source, mount));
        }
        if lines.is_empty() {
            return Ok(());
        }

        let conf = PathBuf::from(PVE_LXC_CONF_DIR).join(format!("{vmid}.conf"));
        let mut file = OpenOptions::new().append(true).open(&conf)?;
        for line in &lines {
            writeln!(file, "{line}")?;
        }
        tracing::debug!(vmid, mounts = lines.len(), "mounts applied");
        Ok(())
    }

    /// Validates a mount source: `storage:path` against `pvesm list`, host
    /// paths against the filesystem.
    async fn check_mount_source(&self, source: &str) -> Result<()> {
        if let Some((storage, _)) = storage_source(source) {
            let listing = Cmd::new("create", "pvesm")
                .args(["list", storage])
                .output()
                .await
                .map_err(|_| Error::MountSourceMissing {
                    source_ref: source.to_owned(),
                })?;
            if !listing.stdout.lines().any(|l| l.starts_with(source)) {
                return Err(Error::MountSourceMissing {
                    source_ref: source.to_owned(),
                });
            }
            return Ok(());
        }
        if !Path::new(source).exists() {
            return Err(Error::MountSourceMissing {
                source_ref: source.to_owned(),
            });
        }
        Ok(())
    }

    /// `pct set --features` for user-namespace bundles; warns on shared
    /// namespace requests and proceeds with isolated ones.
    async fn apply_features(&self, vmid: u32, spec: &Spec) -> Result<()> {
        for ns in shared_namespaces(spec) {
            tracing::warn!(
                vmid,
                namespace = ?ns.ns_type,
                path = %ns.path.as_deref().unwrap_or(Path::new("")).display(),
                "NAMESPACE_SHARED_UNSUPPORTED: joining an existing namespace is not supported; proceeding isolated"
            );
        }
        if wants_user_namespace(spec) {
            let vmid = vmid.to_string();
            Cmd::new("create", "pct")
                .args(["set", vmid.as_str(), "--features", "nesting=1,keyctl=1"])
                .run()
                .await?;
        }
        Ok(())
    }

    /// Confirms the expected settings landed, via `pct config`.
    async fn verify(&self, vmid: u32, spec: &Spec, limits: &EffectiveLimits) -> Result<()> {
        let vmid_arg = vmid.to_string();
        let out = Cmd::new("create", "pct")
            .args(["config", vmid_arg.as_str()])
            .output()
            .await?;
        if let Some(line) = first_missing_line(&out.stdout, &expected_lines(spec, limits)) {
            return Err(Error::VerificationFailed {
                vmid,
                reason: format!("expected `{line}` in pct config output"),
            });
        }
        Ok(())
    }

    /// Polls `pct status` until `running` or the configured budget elapses.
    /// Transient probe failures are retried until the deadline.
    async fn wait_running(&self, vmid: u32) -> Result<()> {
        let budget = Duration::from_secs(self.opts.start_timeout_secs);
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if let Ok(status) = self.query_status(vmid).await
                && status == "running"
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    op: "start",
                    budget,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn query_status(&self, vmid: u32) -> Result<String> {
        let vmid = vmid.to_string();
        let out = Cmd::new("info", "pct")
            .args(["status", vmid.as_str()])
            .output()
            .await?;
        parse_status(&out.stdout)
            .ok_or_else(|| Error::Internal("unparseable pct status output".to_owned()))
    }

    /// Init PID from `pct status --verbose`; 0 when unavailable (the
    /// verbose field is not guaranteed across Proxmox versions).
    async fn query_pid(&self, vmid: u32) -> u32 {
        let vmid = vmid.to_string();
        match Cmd::new("info", "pct")
            .args(["status", vmid.as_str(), "--verbose"])
            .output()
            .await
        {
            Ok(out) => parse_pid(&out.stdout).unwrap_or(0),
            Err(_) => 0,
        }
    }

    async fn signal_init(&self, vmid: &str, name: &str) -> Result<()> {
        let sig = format!("-{name}");
        Cmd::new("kill", "pct")
            .args(["exec", vmid, "--", "kill", sig.as_str(), "1"])
            .run()
            .await
    }
}

/// Creation-time resource limits after precedence resolution:
/// bundle > runtime sandbox config > built-in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EffectiveLimits {
    memory_mib: u64,
    cores: u32,
}

impl EffectiveLimits {
    fn resolve(spec: &Spec, opts: &LxcOptions) -> Self {
        let resources = spec.linux.as_ref().and_then(|l| l.resources);

        let memory_mib = resources
            .and_then(|r| r.memory)
            .and_then(|m| m.limit)
            .map_or(opts.memory_mib, memory_mib_from_bytes);

        let cores = resources
            .and_then(|r| r.cpu)
            .and_then(|cpu| cores_from_cpu(&cpu))
            .unwrap_or(opts.cores);

        Self { memory_mib, cores }
    }
}

/// Bytes → MiB, rounded up; non-positive limits fall back to 1 MiB.
fn memory_mib_from_bytes(bytes: i64) -> u64 {
    let bytes = u64::try_from(bytes).unwrap_or(0);
    bytes.div_ceil(1 << 20).max(1)
}

/// The fixed CPU translation: quota/period wins over shares.
///
/// `cores = max(1, ceil(quota / period))`, or `max(1, round(shares / 1024))`
/// when only shares are given. Deliberately deterministic; do not "improve".
fn cores_from_cpu(cpu: &Cpu) -> Option<u32> {
    if let (Some(quota), Some(period)) = (cpu.quota, cpu.period)
        && quota > 0
        && period > 0
    {
        let quota = u64::try_from(quota).unwrap_or(0);
        let cores = quota.div_ceil(period).max(1);
        return Some(u32::try_from(cores).unwrap_or(u32::MAX));
    }
    cpu.shares.map(|shares| {
        let rounded = (shares + 512) / 1024;
        u32::try_from(rounded.max(1)).unwrap_or(u32::MAX)
    })
}

/// `pct create` argument vector.
fn create_args(
    vmid: u32,
    template: &Path,
    bundle: &Bundle,
    container_id: &str,
    limits: &EffectiveLimits,
    opts: &LxcOptions,
) -> Vec<String> {
    let mut args = vec![
        "create".to_owned(),
        vmid.to_string(),
        template.to_string_lossy().into_owned(),
        "--hostname".to_owned(),
        bundle.hostname_or(container_id).to_owned(),
        "--memory".to_owned(),
        limits.memory_mib.to_string(),
        "--cores".to_owned(),
        limits.cores.to_string(),
    ];
    if wants_user_namespace(&bundle.spec) {
        args.push("--unprivileged".to_owned());
        args.push("1".to_owned());
    }
    args.push("--net0".to_owned());
    args.push(format!("name=eth0,bridge={},ip={}", opts.bridge, opts.ip));
    args
}

/// Whether the bundle requests a user namespace.
fn wants_user_namespace(spec: &Spec) -> bool {
    spec.linux
        .as_ref()
        .is_some_and(|l| l.namespaces.iter().any(|n| n.ns_type == NamespaceType::User))
}

/// Namespace requests that name an existing namespace path.
fn shared_namespaces(spec: &Spec) -> Vec<&nexcage_oci::Namespace> {
    spec.linux
        .as_ref()
        .map(|l| l.namespaces.iter().filter(|n| n.path.is_some()).collect())
        .unwrap_or_default()
}

/// One `mp<i>` line for the Proxmox config file.
///
/// Only `ro`/`readonly` is interpreted (`ro=1`); every other option is
/// passed through verbatim — a documented limitation, with `pct config`
/// verification as the backstop.
fn mount_line(index: usize, source: &str, mount: &Mount) -> String {
    let mut line = format!("mp{index}: {source},mp={}", mount.destination.display());
    let mut readonly = false;
    let mut extras = Vec::new();
    for option in &mount.options {
        match option.as_str() {
            "ro" | "readonly" => readonly = true,
            other => {
                tracing::info!(option = other, "passing unrecognized mount option through");
                extras.push(other);
            }
        }
    }
    if readonly {
        line.push_str(",ro=1");
    }
    for extra in extras {
        line.push(',');
        line.push_str(extra);
    }
    line
}

/// Splits a `storage:path` source; `None` for host paths.
fn storage_source(source: &str) -> Option<(&str, &str)> {
    if source.starts_with('/') {
        return None;
    }
    source.split_once(':')
}

/// Config lines `pct config` must echo back after create.
fn expected_lines(spec: &Spec, limits: &EffectiveLimits) -> Vec<String> {
    let mut expected = vec![
        format!("memory: {}", limits.memory_mib),
        format!("cores: {}", limits.cores),
    ];
    if wants_user_namespace(spec) {
        expected.push("features: nesting=1,keyctl=1".to_owned());
    }
    let mut index = 0;
    for mount in &spec.mounts {
        if let Some(source) = &mount.source {
            expected.push(mount_line(index, source, mount));
            index += 1;
        }
    }
    expected
}

/// First expected line absent from `pct config` output, if any.
fn first_missing_line(stdout: &str, expected: &[String]) -> Option<String> {
    let actual: BTreeSet<&str> = stdout.lines().map(str::trim).collect();
    expected
        .iter()
        .find(|line| !actual.contains(line.as_str()))
        .cloned()
}

/// VMIDs from `pct list` output (header line skipped by parse failure).
fn parse_pct_list(stdout: &str) -> BTreeSet<u32> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// The status value from `pct status` output (`status: running`).
fn parse_status(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("status:")
            .map(|rest| rest.trim().to_owned())
    })
}

/// The init PID from `pct status --verbose` output (`pid: 1234`).
fn parse_pid(stdout: &str) -> Option<u32> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("pid:")
            .and_then(|rest| rest.trim().parse().ok())
    })
}

/// Status refresh against the live host. Only live evidence that contradicts
/// the stored status flips it; a never-started container stays `created`
/// even though Proxmox reports it `stopped`.
fn reconcile(stored: Status, live: &str) -> Option<Status> {
    match (stored, live) {
        (Status::Running | Status::Paused, "stopped") => Some(Status::Stopped),
        (Status::Stopped, "running") => Some(Status::Running),
        _ => None,
    }
}

/// Template and address summary from `pct config` output.
#[derive(Debug, Default)]
struct ConfigSummary {
    template: Option<String>,
    addresses: Vec<String>,
}

fn parse_config_summary(stdout: &str) -> ConfigSummary {
    let mut summary = ConfigSummary::default();
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ostemplate:") {
            summary.template = Some(rest.trim().to_owned());
        } else if let Some(rest) = line.strip_prefix("net0:") {
            for field in rest.trim().split(',') {
                if let Some(ip) = field.strip_prefix("ip=") {
                    summary.addresses.push(ip.to_owned());
                }
            }
        }
    }
    summary
}

/// Proxmox "already gone" stderr patterns absorbed by idempotent delete.
fn is_not_found_stderr(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("does not exist") || lower.contains("no such")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nexcage_oci::RootfsSource;
    use std::path::PathBuf;

    fn spec_from(json: &str) -> Spec {
        serde_json::from_str(json).unwrap()
    }

    fn bundle_from(json: &str) -> Bundle {
        Bundle {
            dir: PathBuf::from("/tmp/b1"),
            spec: spec_from(json),
            rootfs: RootfsSource::Directory(PathBuf::from("/tmp/b1/rootfs")),
        }
    }

    const BASE: &str = r#"{
        "ociVersion": "1.0.2",
        "hostname": "h1",
        "process": {"args": ["/bin/sh"]},
        "root": {"path": "rootfs"}
    }"#;

    #[test]
    fn memory_rounding() {
        assert_eq!(memory_mib_from_bytes(268_435_456), 256);
        assert_eq!(memory_mib_from_bytes(268_435_457), 257);
        assert_eq!(memory_mib_from_bytes(1), 1);
        assert_eq!(memory_mib_from_bytes(-5), 1);
    }

    #[test]
    fn cpu_translation_shares() {
        let shares_only = |shares| Cpu {
            shares: Some(shares),
            quota: None,
            period: None,
        };
        assert_eq!(cores_from_cpu(&shares_only(1024)), Some(1));
        assert_eq!(cores_from_cpu(&shares_only(1536)), Some(2));
        assert_eq!(cores_from_cpu(&shares_only(2048)), Some(2));
        assert_eq!(cores_from_cpu(&shares_only(2)), Some(1));
    }

    #[test]
    fn cpu_translation_quota_period() {
        let quota = Cpu {
            shares: Some(1024),
            quota: Some(250_000),
            period: Some(100_000),
        };
        // Quota/period wins over shares: ceil(2.5) = 3.
        assert_eq!(cores_from_cpu(&quota), Some(3));
    }

    #[test]
    fn limits_precedence_bundle_wins() {
        let spec = spec_from(
            r#"{
                "ociVersion": "1.0.2",
                "process": {"args": ["/bin/sh"]},
                "root": {"path": "rootfs"},
                "linux": {"resources": {"memory": {"limit": 268435456}}}
            }"#,
        );
        let opts = LxcOptions {
            memory_mib: 1024,
            ..LxcOptions::default()
        };
        let limits = EffectiveLimits::resolve(&spec, &opts);
        assert_eq!(limits.memory_mib, 256);
        assert_eq!(limits.cores, 1);
    }

    #[test]
    fn limits_fall_back_to_options() {
        let spec = spec_from(BASE);
        let opts = LxcOptions {
            memory_mib: 2048,
            cores: 4,
            ..LxcOptions::default()
        };
        let limits = EffectiveLimits::resolve(&spec, &opts);
        assert_eq!(limits.memory_mib, 2048);
        assert_eq!(limits.cores, 4);
    }

    #[test]
    fn create_args_composition() {
        let bundle = bundle_from(BASE);
        let limits = EffectiveLimits {
            memory_mib: 256,
            cores: 2,
        };
        let args = create_args(
            104_729,
            Path::new("/var/lib/vz/template/cache/h1-1712345678.tar.zst"),
            &bundle,
            "c1",
            &limits,
            &LxcOptions::default(),
        );
        assert_eq!(
            args,
            vec![
                "create",
                "104729",
                "/var/lib/vz/template/cache/h1-1712345678.tar.zst",
                "--hostname",
                "h1",
                "--memory",
                "256",
                "--cores",
                "2",
                "--net0",
                "name=eth0,bridge=vmbr0,ip=dhcp",
            ]
        );
    }

    #[test]
    fn user_namespace_adds_unprivileged() {
        let bundle = bundle_from(
            r#"{
                "ociVersion": "1.0.2",
                "process": {"args": ["/bin/sh"]},
                "root": {"path": "rootfs"},
                "linux": {"namespaces": [{"type": "user"}]}
            }"#,
        );
        let args = create_args(
            100,
            Path::new("/t.tar.zst"),
            &bundle,
            "c3",
            &EffectiveLimits {
                memory_mib: 512,
                cores: 1,
            },
            &LxcOptions::default(),
        );
        let joined = args.join(" ");
        assert!(joined.contains("--unprivileged 1"));
        // Hostname falls back to the container id.
        assert!(joined.contains("--hostname c3"));
    }

    #[test]
    fn mount_line_readonly() {
        let mount = Mount {
            destination: PathBuf::from("/data"),
            source: Some("/host/data".to_owned()),
            mount_type: "bind".to_owned(),
            options: vec!["ro".to_owned()],
        };
        assert_eq!(
            mount_line(0, "/host/data", &mount),
            "mp0: /host/data,mp=/data,ro=1"
        );
    }

    #[test]
    fn mount_line_passes_unknown_options_through() {
        let mount = Mount {
            destination: PathBuf::from("/data"),
            source: Some("/host/data".to_owned()),
            mount_type: "bind".to_owned(),
            options: vec!["readonly".to_owned(), "noatime".to_owned()],
        };
        assert_eq!(
            mount_line(1, "/host/data", &mount),
            "mp1: /host/data,mp=/data,ro=1,noatime"
        );
    }

    #[test]
    fn storage_source_detection() {
        assert_eq!(
            storage_source("local:backup/x.raw"),
            Some(("local", "backup/x.raw"))
        );
        assert_eq!(storage_source("/host/data"), None);
        assert_eq!(storage_source("relative/path"), None);
    }

    #[test]
    fn expected_lines_cover_mounts_and_features() {
        let spec = spec_from(
            r#"{
                "ociVersion": "1.0.2",
                "process": {"args": ["/bin/sh"]},
                "root": {"path": "rootfs"},
                "mounts": [{"destination": "/data", "source": "/host/data",
                            "type": "bind", "options": ["ro"]}],
                "linux": {"namespaces": [{"type": "user"}]}
            }"#,
        );
        let expected = expected_lines(
            &spec,
            &EffectiveLimits {
                memory_mib: 256,
                cores: 1,
            },
        );
        assert!(expected.contains(&"memory: 256".to_owned()));
        assert!(expected.contains(&"features: nesting=1,keyctl=1".to_owned()));
        assert!(expected.contains(&"mp0: /host/data,mp=/data,ro=1".to_owned()));
    }

    #[test]
    fn verification_finds_missing_line() {
        let stdout = "arch: amd64\nmemory: 256\ncores: 1\n";
        let expected = vec!["memory: 256".to_owned(), "cores: 2".to_owned()];
        assert_eq!(
            first_missing_line(stdout, &expected),
            Some("cores: 2".to_owned())
        );
        let matching = vec!["memory: 256".to_owned(), "cores: 1".to_owned()];
        assert_eq!(first_missing_line(stdout, &matching), None);
    }

    #[test]
    fn pct_list_parsing() {
        let out = "VMID       Status     Lock         Name\n\
                   100        running                 web\n\
                   104729     stopped                 db\n";
        let vmids = parse_pct_list(out);
        assert!(vmids.contains(&100));
        assert!(vmids.contains(&104_729));
        assert_eq!(vmids.len(), 2);
    }

    #[test]
    fn pct_status_parsing() {
        assert_eq!(parse_status("status: running\n").as_deref(), Some("running"));
        assert_eq!(parse_status("status: stopped\n").as_deref(), Some("stopped"));
        assert_eq!(parse_status("garbage"), None);
    }

    #[test]
    fn pid_parsing() {
        let verbose = "status: running\npid: 4242\nuptime: 5\n";
        assert_eq!(parse_pid(verbose), Some(4242));
        assert_eq!(parse_pid("status: running\n"), None);
    }

    #[test]
    fn reconcile_only_on_contradiction() {
        assert_eq!(reconcile(Status::Running, "stopped"), Some(Status::Stopped));
        assert_eq!(reconcile(Status::Paused, "stopped"), Some(Status::Stopped));
        assert_eq!(reconcile(Status::Stopped, "running"), Some(Status::Running));
        assert_eq!(reconcile(Status::Created, "stopped"), None);
        assert_eq!(reconcile(Status::Running, "running"), None);
    }

    #[test]
    fn config_summary_parsing() {
        let out = "arch: amd64\nostemplate: local:vztmpl/h1-1712345678.tar.zst\n\
                   net0: name=eth0,bridge=vmbr0,ip=192.168.1.50/24\n";
        let summary = parse_config_summary(out);
        assert_eq!(
            summary.template.as_deref(),
            Some("local:vztmpl/h1-1712345678.tar.zst")
        );
        assert_eq!(summary.addresses, vec!["192.168.1.50/24".to_owned()]);
    }

    #[test]
    fn not_found_stderr_patterns() {
        assert!(is_not_found_stderr("CT 104729 does not exist"));
        assert!(is_not_found_stderr("no such container"));
        assert!(!is_not_found_stderr("permission denied"));
    }
}
