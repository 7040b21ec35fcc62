//! File snapshots for rollback
//!
//! Every propose saves the file as it was before the rewrite, and operators
//! can take snapshots on demand. A snapshot can later be turned into a restore
//! proposal, which goes through the same confirm gate as any other change.

use chrono::Utc;
use hotpatch_core::{HotpatchError, Result, TargetSpec};
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

/// Snapshot name prefix, sortable and free of '_'
const SNAPSHOT_TIMESTAMP: &str = "%Y-%m-%dT%H-%M-%S-%3f";

/// A stored snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// File name inside the snapshot directory
    pub name: String,
    pub bytes: u64,
}

/// Directory of `<timestamp>_<target>_<file>` snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn subject(target: &TargetSpec) -> String {
        format!("{}_{}", target.key, target.file_name())
    }

    /// Whether `name` is `<timestamp>_<key>_<file>` for exactly this target
    fn belongs_to(target: &TargetSpec, name: &str) -> bool {
        // The timestamp never contains '_', so the first one ends it
        match name.split_once('_') {
            Some((stamp, subject)) => {
                !stamp.is_empty()
                    && stamp.chars().all(|c| c.is_ascii_digit() || c == '-' || c == 'T')
                    && subject == Self::subject(target)
            }
            None => false,
        }
    }

    /// Save `content` as a new snapshot of `target`
    pub async fn save(&self, target: &TargetSpec, content: &str) -> Result<SnapshotInfo> {
        fs::create_dir_all(&self.dir).await?;

        let timestamp = Utc::now().format(SNAPSHOT_TIMESTAMP);
        let name = format!("{}_{}", timestamp, Self::subject(target));
        fs::write(self.dir.join(&name), content).await?;

        info!("Saved snapshot {} of {}", name, target);
        Ok(SnapshotInfo {
            name,
            bytes: content.len() as u64,
        })
    }

    /// Snapshots of `target`, oldest first
    pub async fn list(&self, target: &TargetSpec) -> Result<Vec<SnapshotInfo>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !Self::belongs_to(target, &name) {
                continue;
            }
            let bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            snapshots.push(SnapshotInfo { name, bytes });
        }

        // Timestamp prefix sorts chronologically
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    /// Read a snapshot of `target` by name
    pub async fn load(&self, target: &TargetSpec, name: &str) -> Result<String> {
        validate_snapshot_name(target, name)?;

        match fs::read_to_string(self.dir.join(name)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HotpatchError::Snapshot(
                format!("Snapshot not found: {}", name),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject names that escape the snapshot directory or belong to another target
fn validate_snapshot_name(target: &TargetSpec, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(HotpatchError::Snapshot(format!(
            "Invalid snapshot name: {}",
            name
        )));
    }

    if !SnapshotStore::belongs_to(target, name) {
        return Err(HotpatchError::Snapshot(format!(
            "Snapshot {} does not belong to target {}",
            name, target.key
        )));
    }

    Ok(())
}
