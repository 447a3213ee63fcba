//! Runtime configuration and backend routing.
//!
//! Effective configuration is resolved once per process from, highest
//! precedence first: command-line overrides, `NEXCAGE_*` environment
//! variables, a discovered JSON config file, built-in defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default base directory for mapping and state files.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/nexcage";

/// Default Proxmox template cache directory.
pub const DEFAULT_TEMPLATE_DIR: &str = "/var/lib/vz/template/cache";

/// The backend drivers a container can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum BackendKind {
    /// Proxmox LXC via `pct`.
    ProxmoxLxc,
    /// The `crun` OCI runtime.
    Crun,
    /// The `runc` OCI runtime.
    Runc,
    /// Proxmox QEMU via `qm`.
    ProxmoxVm,
}

impl BackendKind {
    /// Kebab-case backend name, as configured.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProxmoxLxc => "proxmox-lxc",
            Self::Crun => "crun",
            Self::Runc => "runc",
            Self::ProxmoxVm => "proxmox-vm",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "proxmox-lxc" => Ok(Self::ProxmoxLxc),
            "crun" => Ok(Self::Crun),
            "runc" => Ok(Self::Runc),
            "proxmox-vm" => Ok(Self::ProxmoxVm),
            other => Err(Error::ConfigInvalid {
                reason: format!(
                    "unknown backend '{other}', expected proxmox-lxc, crun, runc, or proxmox-vm"
                ),
            }),
        }
    }
}

/// Log verbosity, config-file spelling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Diagnostics.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Problems worth attention.
    Warn,
    /// Failures.
    Error,
    /// Fatal failures only (mapped to `error` for the subscriber).
    Fatal,
}

impl LogLevel {
    /// The `tracing` filter directive for this level.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error | Self::Fatal => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(Error::ConfigInvalid {
                reason: format!("unknown log level '{other}'"),
            }),
        }
    }
}

/// One ordered routing rule: first glob match on the container id wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RoutingRule {
    /// Glob pattern matched against the container id.
    pub pattern: String,
    /// Backend used when the pattern matches.
    pub backend: BackendKind,
}

/// Options for the Proxmox LXC backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct LxcOptions {
    /// Bridge for `--net0`.
    pub bridge: String,
    /// IP configuration for `--net0` (`dhcp` or CIDR).
    pub ip: String,
    /// Proxmox storage queried for templates and volumes.
    pub storage: String,
    /// ZFS pool holding `containers/<id>` datasets; enables checkpoints.
    pub zfs_pool: Option<String>,
    /// Default memory when the bundle sets no limit, MiB.
    pub memory_mib: u64,
    /// Default core count when the bundle sets no CPU limits.
    pub cores: u32,
    /// Startup readiness budget, seconds.
    pub start_timeout_secs: u64,
    /// Graceful shutdown budget before escalating to a hard stop, seconds.
    pub stop_timeout_secs: u64,
}

impl Default for LxcOptions {
    fn default() -> Self {
        Self {
            bridge: "vmbr0".to_owned(),
            ip: "dhcp".to_owned(),
            storage: "local".to_owned(),
            zfs_pool: None,
            memory_mib: 512,
            cores: 1,
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
        }
    }
}

/// Options for the `crun`/`runc` backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct OciOptions {
    /// Explicit runtime binary path; the backend name is used otherwise.
    pub binary: Option<PathBuf>,
}

/// Options for the Proxmox VM backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VmOptions {
    /// Bridge for the VM's first NIC.
    pub bridge: String,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            bridge: "vmbr0".to_owned(),
        }
    }
}

/// Per-backend option blocks, keyed by backend name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Backends {
    /// `backends.proxmox-lxc.*`
    #[serde(rename = "proxmox-lxc")]
    pub lxc: LxcOptions,
    /// `backends.crun.*`
    pub crun: OciOptions,
    /// `backends.runc.*`
    pub runc: OciOptions,
    /// `backends.proxmox-vm.*`
    #[serde(rename = "proxmox-vm")]
    pub vm: VmOptions,
}

/// The effective runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Backend used when no routing rule matches.
    pub default_backend: BackendKind,
    /// Ordered routing rules.
    pub routing: Vec<RoutingRule>,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Log file; stderr only when absent.
    pub log_file: Option<PathBuf>,
    /// Base directory for mapping and state files.
    pub state_dir: PathBuf,
    /// Proxmox template cache directory.
    pub template_dir: PathBuf,
    /// Per-backend options.
    pub backends: Backends,
    /// Verbose diagnostics; preserves converter staging directories.
    #[serde(skip)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::ProxmoxLxc,
            routing: Vec::new(),
            log_level: LogLevel::default(),
            log_file: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            backends: Backends::default(),
            debug: false,
        }
    }
}

/// Command-line overrides, applied on top of env and file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Explicit config file path (discovery is skipped).
    pub config_file: Option<PathBuf>,
    /// Overrides `state_dir`.
    pub state_dir: Option<PathBuf>,
    /// Overrides `log_level`.
    pub log_level: Option<LogLevel>,
    /// Overrides `log_file`.
    pub log_file: Option<PathBuf>,
    /// Overrides `default_backend`.
    pub backend: Option<BackendKind>,
    /// Forces debug diagnostics.
    pub debug: bool,
}

impl Config {
    /// Resolves the effective configuration. Called once per process.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let mut config = match &overrides.config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::discover()?,
        };
        config.apply_env(std::env::vars())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parses a config file; the file must exist and parse.
    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::ConfigInvalid {
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Walks the fixed search path; absence of any file yields defaults.
    fn discover() -> Result<Self> {
        let mut candidates = vec![PathBuf::from("/etc/nexcage/config.json")];
        if let Some(base) = dirs::config_dir() {
            candidates.push(base.join("nexcage/config.json"));
        }
        for path in candidates {
            if path.is_file() {
                tracing::debug!(path = %path.display(), "loaded configuration file");
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    /// Applies `NEXCAGE_*` variables from an arbitrary iterator (testable
    /// without touching the process environment).
    pub(crate) fn apply_env(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "NEXCAGE_STATE_DIR" => self.state_dir = PathBuf::from(value),
                "NEXCAGE_LOG_FILE" => self.log_file = Some(PathBuf::from(value)),
                "NEXCAGE_LOG_LEVEL" => self.log_level = value.parse()?,
                "NEXCAGE_DEBUG" => self.debug = is_truthy(&value),
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(dir) = &overrides.state_dir {
            self.state_dir.clone_from(dir);
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(file) = &overrides.log_file {
            self.log_file = Some(file.clone());
        }
        if let Some(backend) = overrides.backend {
            self.default_backend = backend;
        }
        if overrides.debug {
            self.debug = true;
            self.log_level = LogLevel::Debug;
        }
    }

    /// Rejects unusable routing patterns up front.
    fn validate(&self) -> Result<()> {
        for rule in &self.routing {
            glob::Pattern::new(&rule.pattern).map_err(|e| Error::ConfigInvalid {
                reason: format!("routing pattern '{}': {e}", rule.pattern),
            })?;
        }
        Ok(())
    }

    /// Every backend reachable through this configuration: the default plus
    /// each routing target, deduplicated in that order.
    pub fn configured_backends(&self) -> Vec<BackendKind> {
        let mut kinds = vec![self.default_backend];
        for rule in &self.routing {
            if !kinds.contains(&rule.backend) {
                kinds.push(rule.backend);
            }
        }
        kinds
    }

    /// Resolves the backend for a container id: first matching routing rule,
    /// else the default backend.
    pub fn backend_for(&self, container_id: &str) -> BackendKind {
        for rule in &self.routing {
            if let Ok(pattern) = glob::Pattern::new(&rule.pattern)
                && pattern.matches(container_id)
            {
                return rule.backend;
            }
        }
        self.default_backend
    }
}

/// Truthy spellings for `NEXCAGE_DEBUG`.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Iterator<Item = (String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.default_backend, BackendKind::ProxmoxLxc);
        assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.backends.lxc.bridge, "vmbr0");
    }

    #[test]
    fn file_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "default_backend": "crun",
                "routing": [{"pattern": "pve-*", "backend": "proxmox-lxc"}],
                "log_level": "debug",
                "state_dir": "/srv/nexcage",
                "backends": {"proxmox-lxc": {"bridge": "vmbr1", "zfs_pool": "tank"}}
            }"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.default_backend, BackendKind::Crun);
        assert_eq!(config.backends.lxc.bridge, "vmbr1");
        assert_eq!(config.backends.lxc.zfs_pool.as_deref(), Some("tank"));
        assert_eq!(config.backends.lxc.memory_mib, 512);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn bad_file_is_config_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert_eq!(err.kind(), "CONFIG_INVALID");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("NEXCAGE_STATE_DIR", "/tmp/nx"),
                ("NEXCAGE_LOG_LEVEL", "warn"),
                ("NEXCAGE_DEBUG", "1"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/nx"));
        assert_eq!(config.log_level, LogLevel::Warn);
        assert!(config.debug);
    }

    #[test]
    fn bad_env_level_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("NEXCAGE_LOG_LEVEL", "loud")]))
            .unwrap_err();
        assert_eq!(err.kind(), "CONFIG_INVALID");
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("NEXCAGE_STATE_DIR", "/from-env")]))
            .unwrap();
        config.apply_overrides(&Overrides {
            state_dir: Some(PathBuf::from("/from-cli")),
            backend: Some(BackendKind::Runc),
            ..Overrides::default()
        });
        assert_eq!(config.state_dir, PathBuf::from("/from-cli"));
        assert_eq!(config.default_backend, BackendKind::Runc);
    }

    #[test]
    fn routing_first_match_wins() {
        let mut config = Config::default();
        config.routing = vec![
            RoutingRule {
                pattern: "vm-*".to_owned(),
                backend: BackendKind::ProxmoxVm,
            },
            RoutingRule {
                pattern: "*".to_owned(),
                backend: BackendKind::Crun,
            },
        ];
        assert_eq!(config.backend_for("vm-7"), BackendKind::ProxmoxVm);
        assert_eq!(config.backend_for("web-1"), BackendKind::Crun);
    }

    #[test]
    fn configured_backends_dedupe_in_order() {
        let mut config = Config::default();
        assert_eq!(config.configured_backends(), vec![BackendKind::ProxmoxLxc]);

        config.routing = vec![
            RoutingRule {
                pattern: "vm-*".to_owned(),
                backend: BackendKind::ProxmoxVm,
            },
            RoutingRule {
                pattern: "oci-*".to_owned(),
                backend: BackendKind::Crun,
            },
            RoutingRule {
                pattern: "*".to_owned(),
                backend: BackendKind::ProxmoxLxc,
            },
        ];
        assert_eq!(
            config.configured_backends(),
            vec![
                BackendKind::ProxmoxLxc,
                BackendKind::ProxmoxVm,
                BackendKind::Crun
            ]
        );
    }

    #[test]
    fn routing_falls_back_to_default() {
        let config = Config::default();
        assert_eq!(config.backend_for("anything"), BackendKind::ProxmoxLxc);
    }

    #[test]
    fn invalid_pattern_rejected_at_load() {
        let mut config = Config::default();
        config.routing = vec![RoutingRule {
            pattern: "[".to_owned(),
            backend: BackendKind::Crun,
        }];
        assert_eq!(config.validate().unwrap_err().kind(), "CONFIG_INVALID");
    }

    #[test]
    fn truthy_spellings() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("on"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
