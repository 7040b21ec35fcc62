//! Conversation memory - short per-target history for transform context
//!
//! Not needed for the correctness of propose/confirm. The controller reads a
//! few recent entries to give the model context and appends the operator's
//! instruction once a change is written.

use async_trait::async_trait;
use hotpatch_core::{MemoryEntry, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// Source of recent history per target
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// The last `n` entries for `target_key`, oldest first
    async fn recent(&self, target_key: &str, n: usize) -> Result<Vec<MemoryEntry>>;

    /// Append an entry for `target_key`
    async fn remember(&self, target_key: &str, entry: MemoryEntry) -> Result<()>;
}

type MemoryFile = BTreeMap<String, Vec<MemoryEntry>>;

/// JSON-file backed memory, bounded to `retain` entries per target
pub struct FileMemory {
    path: PathBuf,
    retain: usize,
    // Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl FileMemory {
    pub fn new(path: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            path: path.into(),
            retain: retain.max(1),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<MemoryFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(MemoryFile::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MemoryFile::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, memory: &MemoryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(memory)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl MemoryProvider for FileMemory {
    async fn recent(&self, target_key: &str, n: usize) -> Result<Vec<MemoryEntry>> {
        let memory = self.load().await?;
        let entries = memory.get(target_key).cloned().unwrap_or_default();
        let skip = entries.len().saturating_sub(n);
        Ok(entries.into_iter().skip(skip).collect())
    }

    async fn remember(&self, target_key: &str, entry: MemoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut memory = self.load().await?;
        let entries = memory.entry(target_key.to_string()).or_default();
        entries.push(entry);
        if entries.len() > self.retain {
            let excess = entries.len() - self.retain;
            entries.drain(..excess);
        }
        debug!("Memory for {} now holds {} entries", target_key, entries.len());

        self.save(&memory).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_remember_and_recall() {
        let temp_dir = TempDir::new().unwrap();
        let memory = FileMemory::new(temp_dir.path().join("memory.json"), 10);

        memory.remember("nowbot", MemoryEntry::user("add /start")).await.unwrap();
        memory
            .remember("nowbot", MemoryEntry::assistant("written; deployed"))
            .await
            .unwrap();
        memory.remember("devbot", MemoryEntry::user("fix typo")).await.unwrap();

        let now = memory.recent("nowbot", 5).await.unwrap();
        assert_eq!(now.len(), 2);
        assert_eq!(now[0].content, "add /start");
        assert_eq!(now[1].content, "written; deployed");

        let dev = memory.recent("devbot", 5).await.unwrap();
        assert_eq!(dev.len(), 1);
    }

    #[tokio::test]
    async fn test_retention_bound() {
        let temp_dir = TempDir::new().unwrap();
        let memory = FileMemory::new(temp_dir.path().join("memory.json"), 3);

        for i in 0..6 {
            memory
                .remember("nowbot", MemoryEntry::user(format!("change {i}")))
                .await
                .unwrap();
        }

        let all = memory.recent("nowbot", 100).await.unwrap();
        let contents: Vec<&str> = all.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["change 3", "change 4", "change 5"]);

        let last_two = memory.recent("nowbot", 2).await.unwrap();
        assert_eq!(last_two[0].content, "change 4");
    }

    #[tokio::test]
    async fn test_unknown_target_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let memory = FileMemory::new(temp_dir.path().join("memory.json"), 3);
        assert!(memory.recent("nowbot", 5).await.unwrap().is_empty());
    }
}
