//! ZFS-backed checkpoint and restore.
//!
//! Prefers timestamped snapshots of the container's rootfs dataset
//! (`<pool>/containers/<id>@checkpoint-<unix_ts>`); falls back to `criu`
//! when ZFS is not usable on this host. Restore rolls the dataset back to a
//! named or the most recent checkpoint; ZFS discards snapshots newer than
//! the target, which is accepted. Retention is host policy, handled
//! out-of-band with the ZFS tooling.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::cmd::{self, Cmd};
use crate::state::unix_now;
use crate::{Error, Result};

/// Snapshot name prefix; the suffix is the creation unix timestamp.
const SNAPSHOT_PREFIX: &str = "checkpoint-";

/// Captures and restores container filesystem state.
#[derive(Debug, Clone)]
pub struct CheckpointEngine {
    pool: Option<String>,
    timeout: Duration,
}

impl CheckpointEngine {
    /// Engine over the configured ZFS pool (`None` disables the ZFS path).
    pub fn new(pool: Option<String>) -> Self {
        Self {
            pool,
            timeout: cmd::DEFAULT_TIMEOUT,
        }
    }

    /// Dataset holding a container's rootfs, by convention.
    fn dataset(&self, container_id: &str) -> Option<String> {
        self.pool
            .as_ref()
            .map(|pool| format!("{pool}/containers/{container_id}"))
    }

    /// Whether the dataset exists on this host.
    async fn dataset_exists(&self, dataset: &str) -> bool {
        Cmd::new("checkpoint", "zfs")
            .args(["list", "-H", "-o", "name", dataset])
            .timeout(self.timeout)
            .output()
            .await
            .is_ok()
    }

    /// Captures the container's filesystem state and returns the snapshot
    /// name (ZFS) or the image directory (fallback).
    ///
    /// `pid` and `image_dir` feed the fallback tool; the ZFS path ignores
    /// both.
    pub async fn checkpoint(
        &self,
        container_id: &str,
        pid: u32,
        image_dir: Option<&Path>,
    ) -> Result<String> {
        if let Some(dataset) = self.dataset(container_id)
            && cmd::probe("zfs")
            && self.dataset_exists(&dataset).await
        {
            let snapshot = format!("{SNAPSHOT_PREFIX}{}", unix_now());
            let target = format!("{dataset}@{snapshot}");
            Cmd::new("checkpoint", "zfs")
                .args(["snapshot", target.as_str()])
                .timeout(self.timeout)
                .run()
                .await?;
            tracing::info!(container_id, %snapshot, "ZFS checkpoint created");
            return Ok(snapshot);
        }

        if cmd::probe("criu") {
            let image_dir = image_dir.ok_or_else(|| Error::CheckpointUnavailable {
                reason: "fallback checkpoint requires an image path (--image-path)".to_owned(),
            })?;
            if pid == 0 {
                return Err(Error::CheckpointUnavailable {
                    reason: "fallback checkpoint requires a known container PID".to_owned(),
                });
            }
            std::fs::create_dir_all(image_dir)?;
            let image = image_dir.to_string_lossy().into_owned();
            let tree = pid.to_string();
            Cmd::new("checkpoint", "criu")
                .args(["dump", "--tree", tree.as_str(), "--images-dir", image.as_str()])
                .timeout(self.timeout)
                .run()
                .await?;
            tracing::info!(container_id, image_dir = %image, "criu checkpoint created");
            return Ok(image);
        }

        Err(Error::CheckpointUnavailable {
            reason: "no usable ZFS dataset and no criu on this host".to_owned(),
        })
    }

    /// Rolls the container's dataset back to `snapshot`, or to the most
    /// recent checkpoint when none is named. Container status is left
    /// unchanged; restore never starts the container.
    pub async fn restore(&self, container_id: &str, snapshot: Option<&str>) -> Result<String> {
        let dataset = self.dataset(container_id).ok_or_else(|| {
            Error::CheckpointUnavailable {
                reason: "no zfs_pool configured".to_owned(),
            }
        })?;
        if !cmd::probe("zfs") || !self.dataset_exists(&dataset).await {
            return Err(Error::CheckpointUnavailable {
                reason: format!("dataset '{dataset}' is not usable on this host"),
            });
        }

        let target = match snapshot {
            Some(name) => name.to_owned(),
            None => {
                let names = self.list_snapshots(&dataset).await?;
                most_recent(&names).ok_or_else(|| Error::NotFound {
                    what: "checkpoint",
                    name: container_id.to_owned(),
                })?
            }
        };

        // `-r` discards snapshots newer than the target (ZFS semantics).
        let full = format!("{dataset}@{target}");
        Cmd::new("restore", "zfs")
            .args(["rollback", "-r", full.as_str()])
            .timeout(self.timeout)
            .run()
            .await?;
        tracing::info!(container_id, snapshot = %target, "rolled back to checkpoint");
        Ok(target)
    }

    /// Snapshot names (`checkpoint-*` only) on the dataset.
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let out = Cmd::new("restore", "zfs")
            .args(["list", "-H", "-t", "snapshot", "-o", "name", dataset])
            .timeout(self.timeout)
            .output()
            .await?;
        Ok(parse_snapshot_names(&out.stdout))
    }
}

/// Extracts `checkpoint-*` snapshot names from `zfs list -H -o name` output.
fn parse_snapshot_names(stdout: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    for line in stdout.lines() {
        if let Some((_, snapshot)) = line.trim().split_once('@')
            && snapshot_ts(snapshot).is_some()
        {
            names.insert(snapshot.to_owned());
        }
    }
    names.into_iter().collect()
}

/// The trailing unix timestamp of a `checkpoint-<ts>` name.
fn snapshot_ts(name: &str) -> Option<u64> {
    name.strip_prefix(SNAPSHOT_PREFIX)?.parse().ok()
}

/// The checkpoint with the largest trailing timestamp.
fn most_recent(names: &[String]) -> Option<String> {
    names
        .iter()
        .filter_map(|n| snapshot_ts(n).map(|ts| (ts, n)))
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, n)| n.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_parsing() {
        assert_eq!(snapshot_ts("checkpoint-1712345678"), Some(1_712_345_678));
        assert_eq!(snapshot_ts("checkpoint-"), None);
        assert_eq!(snapshot_ts("checkpoint-abc"), None);
        assert_eq!(snapshot_ts("weekly-1712345678"), None);
    }

    #[test]
    fn most_recent_by_trailing_timestamp() {
        let names = vec![
            "checkpoint-100".to_owned(),
            "checkpoint-900".to_owned(),
            "checkpoint-500".to_owned(),
        ];
        assert_eq!(most_recent(&names).as_deref(), Some("checkpoint-900"));
        assert_eq!(most_recent(&[]), None);
    }

    #[test]
    fn zfs_list_output_parsing() {
        let out = "tank/containers/c1@checkpoint-100\n\
                   tank/containers/c1@manual-backup\n\
                   tank/containers/c1@checkpoint-200\n";
        assert_eq!(
            parse_snapshot_names(out),
            vec!["checkpoint-100".to_owned(), "checkpoint-200".to_owned()]
        );
    }
}
