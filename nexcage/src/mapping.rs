//! Deterministic container-id → VMID mapping.
//!
//! The mapping file is a JSON object `{ id: { vmid, created_at, bundle_path } }`
//! under the runtime state directory. Candidates derive from a SHA-256 of the
//! container id folded into the VMID range, so `allocate; release; allocate`
//! for the same id reproduces the same VMID on an otherwise unchanged host.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::lock::FileLock;
use crate::state::unix_now;
use crate::{Error, Result};

/// Lowest assignable VMID; Proxmox reserves 0–99.
pub const VMID_MIN: u32 = 100;

/// Highest assignable VMID.
pub const VMID_MAX: u32 = 999_999;

/// Linear-probe budget before giving up with `VMID_EXHAUSTED`.
const PROBE_BUDGET: u32 = 10_000;

/// One persisted mapping record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct MappingEntry {
    /// Assigned Proxmox VMID.
    pub vmid: u32,
    /// Allocation time, unix seconds.
    pub created_at: u64,
    /// Bundle the container was created from.
    pub bundle_path: PathBuf,
}

/// The id ↔ VMID mapping store.
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl MappingStore {
    /// Opens the store under `state_dir` (`mapping.json`).
    pub fn open(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).map_err(|e| Error::MappingIo { source: e })?;
        Ok(Self {
            path: state_dir.join("mapping.json"),
            lock_path: state_dir.join("mapping.lock"),
        })
    }

    /// Assigns (or returns the already-assigned) VMID for `id`.
    ///
    /// The candidate is the id's hash folded into the VMID range; collisions
    /// with existing entries or `reserved` (live Proxmox VMIDs) probe
    /// linearly with wraparound, skipping 0–99, within [`PROBE_BUDGET`].
    pub fn allocate(&self, id: &str, bundle_path: &Path, reserved: &BTreeSet<u32>) -> Result<u32> {
        let _lock = FileLock::exclusive(&self.lock_path).map_err(|e| Error::MappingIo { source: e })?;
        let mut map = self.load_locked()?;

        if let Some(entry) = map.get(id) {
            return Ok(entry.vmid);
        }

        let taken: BTreeSet<u32> = map.values().map(|e| e.vmid).collect();
        let mut candidate = hash_candidate(id);
        for _ in 0..PROBE_BUDGET {
            if !taken.contains(&candidate) && !reserved.contains(&candidate) {
                map.insert(
                    id.to_owned(),
                    MappingEntry {
                        vmid: candidate,
                        created_at: unix_now(),
                        bundle_path: bundle_path.to_path_buf(),
                    },
                );
                self.save_locked(&map)?;
                tracing::debug!(container_id = id, vmid = candidate, "allocated VMID");
                return Ok(candidate);
            }
            candidate = next_vmid(candidate);
        }
        Err(Error::VmidExhausted {
            probes: PROBE_BUDGET,
        })
    }

    /// Looks up the entry for a container id.
    pub fn lookup(&self, id: &str) -> Result<Option<MappingEntry>> {
        let _lock = FileLock::shared(&self.lock_path).map_err(|e| Error::MappingIo { source: e })?;
        Ok(self.load_locked()?.remove(id))
    }

    /// Reverse lookup by VMID.
    pub fn lookup_by_vmid(&self, vmid: u32) -> Result<Option<(String, MappingEntry)>> {
        let _lock = FileLock::shared(&self.lock_path).map_err(|e| Error::MappingIo { source: e })?;
        Ok(self
            .load_locked()?
            .into_iter()
            .find(|(_, entry)| entry.vmid == vmid))
    }

    /// Removes the entry for `id`. Absent is fine (idempotent delete).
    pub fn release(&self, id: &str) -> Result<()> {
        let _lock = FileLock::exclusive(&self.lock_path).map_err(|e| Error::MappingIo { source: e })?;
        let mut map = self.load_locked()?;
        if map.remove(id).is_some() {
            self.save_locked(&map)?;
        }
        Ok(())
    }

    /// All live entries.
    pub fn entries(&self) -> Result<BTreeMap<String, MappingEntry>> {
        let _lock = FileLock::shared(&self.lock_path).map_err(|e| Error::MappingIo { source: e })?;
        self.load_locked()
    }

    /// Reads the whole file. Missing means empty; unparseable is surfaced as
    /// `MAPPING_CORRUPT`, never discarded.
    fn load_locked(&self) -> Result<BTreeMap<String, MappingEntry>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(Error::MappingIo { source: e }),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| Error::MappingCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Rewrites the whole file via temp + rename.
    fn save_locked(&self, map: &BTreeMap<String, MappingEntry>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(map)?;
        fs::write(&tmp, data).map_err(|e| Error::MappingIo { source: e })?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::MappingIo { source: e })?;
        Ok(())
    }
}

/// Folds a SHA-256 of the id into the VMID range.
pub(crate) fn hash_candidate(id: &str) -> u32 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let h = u64::from_be_bytes(prefix);
    let span = u64::from(VMID_MAX - VMID_MIN) + 1;
    VMID_MIN + u32::try_from(h % span).unwrap_or(0)
}

/// Next probe slot, wrapping from the top of the range back to 100.
const fn next_vmid(vmid: u32) -> u32 {
    if vmid >= VMID_MAX { VMID_MIN } else { vmid + 1 }
}
