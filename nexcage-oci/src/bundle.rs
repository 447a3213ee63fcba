//! OCI bundle parsing and validation.
//!
//! Parses the subset of the OCI runtime `config.json` that the LXC
//! translation consumes. Unknown top-level keys are tolerated (logged, never
//! fatal); type errors on the known numeric fields are reported with the
//! offending JSON path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::extract::ArchiveFormat;
use crate::{Error, Result};

/// OCI annotation naming the image this bundle was unpacked from.
pub const IMAGE_REF_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Project-specific fallback annotation for the image reference.
pub const IMAGE_REF_FALLBACK_ANNOTATION: &str = "org.nexcage.image.ref";

/// Mount types the LXC translation understands.
const MOUNT_TYPES: &[&str] = &["bind", "tmpfs", "proc", "sysfs", "mqueue", "devpts", "cgroup"];

/// Top-level `config.json` keys the parser consumes.
const KNOWN_KEYS: &[&str] = &[
    "ociVersion",
    "hostname",
    "process",
    "root",
    "mounts",
    "linux",
    "annotations",
];

/// Numeric fields checked up front so a type mismatch names its JSON path.
const NUMERIC_FIELDS: &[&str] = &[
    "process.user.uid",
    "process.user.gid",
    "linux.resources.memory.limit",
    "linux.resources.cpu.shares",
    "linux.resources.cpu.quota",
    "linux.resources.cpu.period",
];

/// The parsed `config.json`, reduced to what the runtime uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    /// OCI runtime spec version; must match `1.0.x`.
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    /// Container hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// The process to run inside the container.
    pub process: Process,
    /// The root filesystem.
    pub root: Root,
    /// Additional mounts, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Linux-specific configuration (resources, namespaces).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
    /// Free-form annotations. Sorted map so canonical output is stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// The container's initial process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Argument vector; must be non-empty with non-empty elements.
    pub args: Vec<String>,
    /// Environment variables (`KEY=VALUE`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(default = "default_cwd")]
    pub cwd: String,
    /// User the process runs as.
    #[serde(default)]
    pub user: User,
    /// Whether a terminal is attached.
    #[serde(default)]
    pub terminal: bool,
}

/// Uid/gid pair for the container process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id inside the container.
    #[serde(default)]
    pub uid: u32,
    /// Group id inside the container.
    #[serde(default)]
    pub gid: u32,
}

/// The root filesystem reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    /// Path to the rootfs, relative to the bundle directory.
    pub path: PathBuf,
    /// Whether the rootfs should be mounted read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// A single mount entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Absolute path inside the container.
    pub destination: PathBuf,
    /// Host path or `storage:path` source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Mount type; one of the recognized set.
    #[serde(rename = "type", default = "default_mount_type")]
    pub mount_type: String,
    /// Mount options, mostly passed through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linux {
    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Requested namespaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
}

/// Resource limits from `linux.resources`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    /// CPU limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
}

/// Memory limit in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    /// Limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// CPU weight and bandwidth limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpu {
    /// Relative CPU weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// CPU bandwidth quota per period, in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// CPU bandwidth period, in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

/// A requested namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace kind.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to an existing namespace to join (unsupported downstream).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// The OCI namespace kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// Process id namespace.
    Pid,
    /// Network namespace.
    Network,
    /// System V IPC namespace.
    Ipc,
    /// Hostname namespace.
    Uts,
    /// Mount namespace.
    Mount,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

fn default_cwd() -> String {
    "/".to_owned()
}

fn default_mount_type() -> String {
    "bind".to_owned()
}

/// Where the bundle's root filesystem actually lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootfsSource {
    /// A plain directory to be copied.
    Directory(PathBuf),
    /// An archive to be extracted.
    Archive {
        /// Path to the archive file.
        path: PathBuf,
        /// Detected compression format.
        format: ArchiveFormat,
    },
}

/// A validated, loaded OCI bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    /// The bundle directory.
    pub dir: PathBuf,
    /// The parsed spec.
    pub spec: Spec,
    /// Resolved rootfs location.
    pub rootfs: RootfsSource,
}

impl Bundle {
    /// Loads and validates the bundle at `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.json");
        let raw = fs::read_to_string(&config_path).map_err(|e| Error::Spec {
            path: "config.json".to_owned(),
            reason: format!("cannot read {}: {e}", config_path.display()),
        })?;

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| Error::Spec {
            path: "config.json".to_owned(),
            reason: format!("invalid JSON: {e}"),
        })?;

        warn_unknown_keys(&value);
        check_numeric_fields(&value)?;

        let spec: Spec = serde_json::from_value(value).map_err(|e| Error::Spec {
            path: "config.json".to_owned(),
            reason: e.to_string(),
        })?;
        spec.validate()?;

        let rootfs = resolve_rootfs(dir, &spec.root.path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            spec,
            rootfs,
        })
    }

    /// Returns the image reference annotation, if present.
    pub fn image_ref(&self) -> Option<&str> {
        self.spec
            .annotations
            .get(IMAGE_REF_ANNOTATION)
            .or_else(|| self.spec.annotations.get(IMAGE_REF_FALLBACK_ANNOTATION))
            .map(String::as_str)
    }

    /// Returns the configured hostname, falling back to `fallback`.
    pub fn hostname_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.spec.hostname.as_deref().unwrap_or(fallback)
    }
}

impl Spec {
    /// Canonical JSON rendering; `parse ∘ canonical ∘ parse` is the identity.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Applies the validation rules that do not need filesystem access.
    fn validate(&self) -> Result<()> {
        if self.oci_version != "1.0" && !self.oci_version.starts_with("1.0.") {
            return Err(Error::Spec {
                path: "ociVersion".to_owned(),
                reason: format!("unsupported version '{}', expected 1.0.x", self.oci_version),
            });
        }

        if self.process.args.is_empty() {
            return Err(Error::Spec {
                path: "process.args".to_owned(),
                reason: "must be a non-empty array".to_owned(),
            });
        }
        if let Some(idx) = self.process.args.iter().position(String::is_empty) {
            return Err(Error::Spec {
                path: format!("process.args[{idx}]"),
                reason: "must be a non-empty string".to_owned(),
            });
        }

        for (idx, mount) in self.mounts.iter().enumerate() {
            if !mount.destination.is_absolute() {
                return Err(Error::Spec {
                    path: format!("mounts[{idx}].destination"),
                    reason: format!("'{}' is not absolute", mount.destination.display()),
                });
            }
            if !MOUNT_TYPES.contains(&mount.mount_type.as_str()) {
                return Err(Error::Spec {
                    path: format!("mounts[{idx}].type"),
                    reason: format!(
                        "unrecognized type '{}', expected one of {}",
                        mount.mount_type,
                        MOUNT_TYPES.join(", ")
                    ),
                });
            }
        }

        Ok(())
    }
}

/// Logs unknown top-level keys; tolerated for forward compatibility.
fn warn_unknown_keys(value: &serde_json::Value) {
    let Some(obj) = value.as_object() else { return };
    for key in obj.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "ignoring unknown top-level key in config.json");
        }
    }
}

/// Rejects non-numeric values in the known numeric fields, naming the path.
fn check_numeric_fields(root: &serde_json::Value) -> Result<()> {
    for path in NUMERIC_FIELDS {
        let mut cursor = root;
        let mut present = true;
        for segment in path.split('.') {
            match cursor.get(segment) {
                Some(v) => cursor = v,
                None => {
                    present = false;
                    break;
                }
            }
        }
        if present && !cursor.is_null() && !cursor.is_number() {
            return Err(Error::Spec {
                path: (*path).to_owned(),
                reason: format!("expected a number, got {}", json_type_name(cursor)),
            });
        }
    }
    Ok(())
}

/// Human-readable JSON type name for error messages.
fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Lexically normalizes a path: resolves `.` and `..` without touching disk.
pub(crate) fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Joins `rel` onto `base` and verifies the result stays inside `base`.
pub(crate) fn normalize_within(base: &Path, rel: &Path) -> Result<PathBuf> {
    let candidate = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        base.join(rel)
    };
    let normalized = lexical_normalize(&candidate);
    if !normalized.starts_with(lexical_normalize(base)) {
        return Err(Error::PathEscape {
            path: rel.to_path_buf(),
        });
    }
    Ok(normalized)
}

/// Locates the rootfs named by `root.path`: a directory, the exact archive,
/// or a sibling archive with a recognized suffix.
fn resolve_rootfs(bundle_dir: &Path, root_path: &Path) -> Result<RootfsSource> {
    let resolved = normalize_within(bundle_dir, root_path)?;

    if resolved.is_dir() {
        return Ok(RootfsSource::Directory(resolved));
    }
    if resolved.is_file()
        && let Some(format) = ArchiveFormat::detect(&resolved)
    {
        return Ok(RootfsSource::Archive {
            path: resolved,
            format,
        });
    }

    // `root.path` of "rootfs" with "rootfs.tar.zst" on disk.
    for suffix in [".tar", ".tar.gz", ".tar.zst"] {
        let mut name = resolved.as_os_str().to_owned();
        name.push(suffix);
        let candidate = PathBuf::from(name);
        if candidate.is_file()
            && let Some(format) = ArchiveFormat::detect(&candidate)
        {
            return Ok(RootfsSource::Archive {
                path: candidate,
                format,
            });
        }
    }

    Err(Error::Spec {
        path: "root.path".to_owned(),
        reason: format!(
            "'{}' is neither a directory nor a rootfs archive",
            root_path.display()
        ),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path, config: &str) {
        fs::create_dir_all(dir.join("rootfs")).unwrap();
        fs::write(dir.join("rootfs/placeholder"), b"x").unwrap();
        fs::write(dir.join("config.json"), config).unwrap();
    }

    const MINIMAL: &str = r#"{
        "ociVersion": "1.0.2",
        "process": { "args": ["/bin/sh"] },
        "root": { "path": "rootfs" }
    }"#;

    #[test]
    fn parse_minimal() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(tmp.path(), MINIMAL);
        let bundle = Bundle::load(tmp.path()).unwrap();
        assert_eq!(bundle.spec.process.args, vec!["/bin/sh"]);
        assert_eq!(bundle.spec.process.cwd, "/");
        assert!(matches!(bundle.rootfs, RootfsSource::Directory(_)));
    }

    #[test]
    fn rejects_missing_config() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Spec { .. }));
    }

    #[test]
    fn rejects_bad_version() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"2.1","process":{"args":["/bin/sh"]},"root":{"path":"rootfs"}}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("ociVersion"));
    }

    #[test]
    fn rejects_empty_args() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":[]},"root":{"path":"rootfs"}}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("process.args"));
    }

    #[test]
    fn rejects_empty_arg_element() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh",""]},"root":{"path":"rootfs"}}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("process.args[1]"));
    }

    #[test]
    fn rejects_relative_mount_destination() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]},"root":{"path":"rootfs"},
                "mounts":[{"destination":"data","source":"/host/data","type":"bind"}]}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("mounts[0].destination"));
    }

    #[test]
    fn rejects_unknown_mount_type() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]},"root":{"path":"rootfs"},
                "mounts":[{"destination":"/data","type":"nfs"}]}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("mounts[0].type"));
    }

    #[test]
    fn rejects_root_escape() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]},"root":{"path":"../outside"}}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::PathEscape { .. }));
    }

    #[test]
    fn rejects_string_memory_limit() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]},"root":{"path":"rootfs"},
                "linux":{"resources":{"memory":{"limit":"256m"}}}}"#,
        );
        let err = Bundle::load(tmp.path()).unwrap_err();
        match err {
            Error::Spec { path, reason } => {
                assert_eq!(path, "linux.resources.memory.limit");
                assert!(reason.contains("a string"));
            }
            other => panic!("expected Spec error, got {other}"),
        }
    }

    #[test]
    fn tolerates_unknown_top_level_keys() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{"ociVersion":"1.0.2","process":{"args":["/bin/sh"]},"root":{"path":"rootfs"},
                "hooks":{},"windows":{}}"#,
        );
        Bundle::load(tmp.path()).unwrap();
    }

    #[test]
    fn detects_archive_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("rootfs.tar.gz"), b"").unwrap();
        fs::write(tmp.path().join("config.json"), MINIMAL).unwrap();
        let bundle = Bundle::load(tmp.path()).unwrap();
        assert!(matches!(
            bundle.rootfs,
            RootfsSource::Archive {
                format: ArchiveFormat::TarGz,
                ..
            }
        ));
    }

    #[test]
    fn canonical_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        write_bundle(
            tmp.path(),
            r#"{
                "ociVersion": "1.0.2",
                "hostname": "h1",
                "process": {
                    "args": ["/bin/sh", "-c", "true"],
                    "env": ["PATH=/usr/bin", "TERM=xterm"],
                    "cwd": "/srv",
                    "user": {"uid": 1000, "gid": 1000}
                },
                "root": {"path": "rootfs", "readonly": true},
                "mounts": [{"destination": "/data", "source": "/host/data",
                            "type": "bind", "options": ["ro", "noatime"]}],
                "linux": {
                    "resources": {"memory": {"limit": 268435456},
                                  "cpu": {"shares": 2048, "quota": 200000, "period": 100000}},
                    "namespaces": [{"type": "pid"}, {"type": "user"}]
                },
                "annotations": {"org.opencontainers.image.ref.name": "alpine:3.20"}
            }"#,
        );
        let bundle = Bundle::load(tmp.path()).unwrap();
        let canonical = bundle.spec.canonical_json().unwrap();
        let reparsed: Spec = serde_json::from_str(&canonical).unwrap();
        assert_eq!(reparsed, bundle.spec);
        assert_eq!(bundle.image_ref(), Some("alpine:3.20"));
    }

    #[test]
    fn normalize_within_accepts_inner_dots() {
        let base = Path::new("/b");
        let p = normalize_within(base, Path::new("a/./c/../d")).unwrap();
        assert_eq!(p, Path::new("/b/a/d"));
    }

    #[test]
    fn normalize_within_rejects_escape() {
        let base = Path::new("/b");
        assert!(normalize_within(base, Path::new("a/../../etc")).is_err());
    }
}
