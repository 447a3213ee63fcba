//! OCI bundle ingestion and LXC template conversion for NexCage.
//!
//! Takes an on-disk OCI bundle (a `config.json` plus a rootfs directory or
//! archive) and turns it into something the Proxmox LXC toolchain can
//! consume:
//!
//! ```text
//! Bundle (public API)
//!  ├── bundle   — config.json parsing and validation
//!  ├── extract  — .tar / .tar.gz / .tar.zst rootfs extraction
//!  └── convert  — staging, LXC rootfs shaping, template archive creation
//! ```
//!
//! Image *distribution* (registry pulls) is deliberately absent: bundles
//! arrive on disk, produced by whatever unpacked the image.

#![allow(clippy::missing_docs_in_private_items)]

mod bundle;
mod convert;
mod extract;
mod tool;

use std::path::PathBuf;

pub use bundle::{
    Bundle, Cpu, Linux, Memory, Mount, Namespace, NamespaceType, Process, Resources, Root,
    RootfsSource, Spec, User, IMAGE_REF_ANNOTATION, IMAGE_REF_FALLBACK_ANNOTATION,
};
pub use convert::{Converter, Template};
pub use extract::ArchiveFormat;

/// Result type for nexcage-oci operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from bundle parsing and template conversion.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The bundle `config.json` failed validation. `path` is the JSON path
    /// of the offending field (or `config.json` for whole-file problems).
    #[error("invalid bundle spec at {path}: {reason}")]
    Spec {
        /// JSON path of the offending field.
        path: String,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// A rootfs or archive entry path escapes its permitted root.
    #[error("path escapes its root: {}", path.display())]
    PathEscape {
        /// The offending path.
        path: PathBuf,
    },

    /// A single entry of the recursive rootfs copy failed.
    #[error("rootfs copy failed at {}: {source}", path.display())]
    RootfsCopy {
        /// The source path that could not be copied.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The staged rootfs contains no regular files from the source.
    #[error("staged rootfs at {} contains no regular files", path.display())]
    RootfsEmpty {
        /// The staging root that came up empty.
        path: PathBuf,
    },

    /// An external tool (`pveam`, `tar`) exited non-zero.
    #[error("`{command}` exited with code {code}: {stderr}")]
    Tool {
        /// The rendered command line.
        command: String,
        /// The tool's exit code.
        code: i32,
        /// The tool's stderr, verbatim.
        stderr: String,
    },

    /// An external tool exceeded its time budget.
    #[error("`{command}` timed out after {secs}s")]
    ToolTimeout {
        /// The rendered command line.
        command: String,
        /// The budget that was exceeded.
        secs: u64,
    },

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
