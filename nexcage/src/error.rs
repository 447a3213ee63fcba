//! Error taxonomy for NexCage operations.
//!
//! One enum, one variant per kind from the error model. Variants carry
//! structured context (container id, vmid, command line, stderr, exit code,
//! path) in named fields; the CLI is the only layer that turns these into
//! exit codes and rendered strings.

use std::path::PathBuf;
use std::time::Duration;

use crate::state::Status;

/// Alias for `Result<T, nexcage::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by NexCage operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or unresolvable configuration.
    #[error("invalid configuration: {reason}")]
    ConfigInvalid {
        /// What was wrong.
        reason: String,
    },

    /// The OCI bundle (or a container id) failed validation.
    #[error("invalid spec at {path}: {reason}")]
    SpecInvalid {
        /// JSON path (or field name) of the offending value.
        path: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// A path escapes its permitted root.
    #[error("path escapes its permitted root: {}", path.display())]
    PathUnsafe {
        /// The offending path.
        path: PathBuf,
    },

    /// Container id, VMID, bundle, or file absent.
    #[error("{what} '{name}' not found")]
    NotFound {
        /// What kind of thing is missing.
        what: &'static str,
        /// Its identifier.
        name: String,
    },

    /// Container id or VMID already taken.
    #[error("{what} '{name}' already exists")]
    AlreadyExists {
        /// What kind of thing collided.
        what: &'static str,
        /// Its identifier.
        name: String,
    },

    /// The operation is illegal in the container's current state.
    #[error("cannot {op} container '{id}' while {status}")]
    InvalidTransition {
        /// The requested lifecycle operation.
        op: &'static str,
        /// The container id.
        id: String,
        /// The state the container was found in.
        status: Status,
    },

    /// A required external command is missing or non-functional.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        /// The backend that cannot run.
        backend: &'static str,
        /// Why.
        reason: String,
    },

    /// An external command exited non-zero.
    #[error("{op}: `{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        /// The lifecycle operation that invoked the command.
        op: &'static str,
        /// The rendered command line.
        command: String,
        /// The command's exit code.
        code: i32,
        /// The command's stderr, verbatim.
        stderr: String,
    },

    /// A mount's host path or storage source is unreachable.
    #[error("mount source unreachable: {source_ref}")]
    MountSourceMissing {
        /// The host path or `storage:path` reference.
        source_ref: String,
    },

    /// Post-create `pct config` did not confirm the expected settings.
    #[error("verification failed for CT {vmid}: {reason}")]
    VerificationFailed {
        /// The container's VMID.
        vmid: u32,
        /// The first mismatch found.
        reason: String,
    },

    /// The image converter could not copy a rootfs entry.
    #[error("rootfs copy failed at {}: {reason}", path.display())]
    RootfsCopyFailed {
        /// The source path that could not be copied.
        path: PathBuf,
        /// The underlying failure.
        reason: String,
    },

    /// The image converter staged a rootfs with no regular files.
    #[error("staged rootfs at {} contains no regular files", path.display())]
    RootfsEmpty {
        /// The staging root.
        path: PathBuf,
    },

    /// Mapping file I/O failure.
    #[error("mapping file I/O: {source}")]
    MappingIo {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The mapping file exists but cannot be parsed. Never silently
    /// discarded; the caller decides.
    #[error("mapping file {} is corrupt: {reason}", path.display())]
    MappingCorrupt {
        /// The mapping file path.
        path: PathBuf,
        /// The parse failure.
        reason: String,
    },

    /// An operation exceeded its time budget.
    #[error("{op} timed out after {}s", budget.as_secs())]
    Timeout {
        /// The operation that timed out.
        op: &'static str,
        /// The exceeded budget.
        budget: Duration,
    },

    /// No free VMID within the probe budget.
    #[error("no free VMID after {probes} probes")]
    VmidExhausted {
        /// The exhausted probe budget.
        probes: u32,
    },

    /// Neither ZFS nor the fallback checkpoint tool is usable.
    #[error("no checkpoint mechanism available: {reason}")]
    CheckpointUnavailable {
        /// Why both paths were rejected.
        reason: String,
    },

    /// The backend does not implement the requested verb.
    #[error("backend '{backend}' does not support {op}")]
    Unsupported {
        /// The backend.
        backend: &'static str,
        /// The unimplemented verb.
        op: &'static str,
    },

    /// Uncategorized I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure outside the specialized stores.
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Invariant violation. Used sparingly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable kind name for this error, as surfaced by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::SpecInvalid { .. } => "SPEC_INVALID",
            Self::PathUnsafe { .. } => "PATH_UNSAFE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "STATE_INVALID_TRANSITION",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::CommandFailed { op, .. } => command_kind(op),
            Self::MountSourceMissing { .. } => "MOUNT_SOURCE_MISSING",
            Self::VerificationFailed { .. } => "VERIFICATION_FAILED",
            Self::RootfsCopyFailed { .. } => "ROOTFS_COPY_FAILED",
            Self::RootfsEmpty { .. } => "ROOTFS_EMPTY",
            Self::MappingIo { .. } => "MAPPING_IO",
            Self::MappingCorrupt { .. } => "MAPPING_CORRUPT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::VmidExhausted { .. } => "VMID_EXHAUSTED",
            Self::CheckpointUnavailable { .. } => "CHECKPOINT_UNAVAILABLE",
            Self::Unsupported { .. } => "UNSUPPORTED_OPERATION",
            Self::Io(_) => "IO",
            Self::Json(_) => "IO",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The process exit code the CLI maps this error to.
    ///
    /// 127 for a missing backend tool, 125 for runtime failures of external
    /// commands, 1 for everything else (2, misuse, is the argument parser's).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BackendUnavailable { .. } => 127,
            Self::CommandFailed { .. }
            | Self::Timeout { .. }
            | Self::VerificationFailed { .. }
            | Self::RootfsCopyFailed { .. }
            | Self::RootfsEmpty { .. } => 125,
            _ => 1,
        }
    }

    /// Structured context pairs for the CLI's single-line rendering.
    pub fn context(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::CommandFailed {
                command,
                code,
                stderr,
                ..
            } => vec![
                ("command", command.clone()),
                ("exit_code", code.to_string()),
                ("stderr", stderr.clone()),
            ],
            Self::InvalidTransition { id, status, .. } => vec![
                ("container_id", id.clone()),
                ("status", status.to_string()),
            ],
            Self::VerificationFailed { vmid, .. } => vec![("vmid", vmid.to_string())],
            Self::NotFound { name, .. } | Self::AlreadyExists { name, .. } => {
                vec![("name", name.clone())]
            }
            Self::SpecInvalid { path, .. } => vec![("path", path.clone())],
            Self::PathUnsafe { path }
            | Self::RootfsEmpty { path }
            | Self::MappingCorrupt { path, .. } => {
                vec![("path", path.display().to_string())]
            }
            Self::RootfsCopyFailed { path, .. } => vec![("path", path.display().to_string())],
            _ => Vec::new(),
        }
    }
}

/// Maps a lifecycle operation to its `BACKEND_*_FAILED` kind name.
fn command_kind(op: &str) -> &'static str {
    match op {
        "create" => "BACKEND_CREATE_FAILED",
        "start" => "BACKEND_START_FAILED",
        "stop" => "BACKEND_STOP_FAILED",
        "kill" => "BACKEND_KILL_FAILED",
        "delete" => "BACKEND_DELETE_FAILED",
        "exec" => "BACKEND_EXEC_FAILED",
        "list" => "BACKEND_LIST_FAILED",
        "info" => "BACKEND_INFO_FAILED",
        "checkpoint" => "BACKEND_CHECKPOINT_FAILED",
        "restore" => "BACKEND_RESTORE_FAILED",
        "convert" => "BACKEND_CONVERT_FAILED",
        _ => "BACKEND_COMMAND_FAILED",
    }
}

impl From<nexcage_oci::Error> for Error {
    fn from(e: nexcage_oci::Error) -> Self {
        match e {
            nexcage_oci::Error::Spec { path, reason } => Self::SpecInvalid { path, reason },
            nexcage_oci::Error::PathEscape { path } => Self::PathUnsafe { path },
            nexcage_oci::Error::RootfsCopy { path, source } => Self::RootfsCopyFailed {
                path,
                reason: source.to_string(),
            },
            nexcage_oci::Error::RootfsEmpty { path } => Self::RootfsEmpty { path },
            nexcage_oci::Error::Tool {
                command,
                code,
                stderr,
            } => Self::CommandFailed {
                op: "convert",
                command,
                code,
                stderr,
            },
            nexcage_oci::Error::ToolTimeout { secs, .. } => Self::Timeout {
                op: "convert",
                budget: Duration::from_secs(secs),
            },
            nexcage_oci::Error::Io(e) => Self::Io(e),
            nexcage_oci::Error::Json(e) => Self::Json(e),
            other => Self::Internal(other.to_string()),
        }
    }
}
