//! OCI-compliant container runtime shim for Proxmox VE.
//!
//! `nexcage` materializes OCI bundles as Proxmox LXC containers by driving
//! the `pct` toolchain, with fan-out to `crun`/`runc` and a `qm` stub.
//!
//! ```text
//! Runtime (public API, one operation per process)
//!  ├── Config      — file/env/CLI precedence + glob routing rules
//!  ├── Backend     — tagged dispatch: proxmox-lxc | crun | runc | proxmox-vm
//!  │    └── LxcDriver — template convert, VMID allocate, pct lifecycle
//!  ├── MappingStore — deterministic id ↔ VMID map (mapping.json, flock)
//!  ├── StateStore   — OCI state.json per container (atomic, flock)
//!  └── CheckpointEngine — ZFS snapshots, criu fallback
//! ```
//!
//! Each invocation is a short-lived one-shot command executor; concurrent
//! invocations on the same host are serialized through advisory file locks
//! on the mapping and state files.

mod backend;
mod checkpoint;
mod cmd;
mod config;
mod error;
mod lock;
mod mapping;
mod runtime;
mod state;
pub mod validate;

pub use backend::{Backend, ContainerInfo, ExecOpts, LxcDriver, OciCliDriver, VmDriver, parse_signal};
pub use checkpoint::CheckpointEngine;
pub use cmd::{Cmd, CmdOutput, probe};
pub use config::{
    BackendKind, Backends, Config, LogLevel, LxcOptions, OciOptions, Overrides, RoutingRule,
    VmOptions,
};
pub use error::{Error, Result};
pub use mapping::{MappingEntry, MappingStore, VMID_MAX, VMID_MIN};
pub use runtime::Runtime;
pub use state::{ContainerState, OCI_VERSION, StateStore, Status};
