//! Audit log - append-only record of pushes, cancels and failures
//!
//! One JSON object per line in `<state_dir>/deploy_log.jsonl`. Writes from the
//! workflow go through [`AuditLog::record`], which is fail-open: a broken log
//! never changes the outcome of a confirm or cancel.

use hotpatch_core::fail_open::fail_open_with_retries;
use hotpatch_core::{AuditRecord, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Attempts for a single audit append
const APPEND_ATTEMPTS: usize = 2;

/// Append-only audit log
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record, logging instead of failing
    pub async fn record(&self, record: AuditRecord) {
        fail_open_with_retries("audit::record", || self.append(&record), APPEND_ATTEMPTS).await;
    }

    /// Append a record
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;

        debug!("Audit {} for {} by {}", record.event, record.file, record.actor);
        Ok(())
    }

    /// The last `n` records, oldest first
    pub async fn recent(&self, n: usize) -> Result<Vec<AuditRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let records: Vec<AuditRecord> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed audit line: {}", e);
                    None
                }
            })
            .collect();

        let skip = records.len().saturating_sub(n);
        Ok(records.into_iter().skip(skip).collect())
    }
}
