//! Deployment history journal.
//!
//! Append-only JSON lines in `deployment_history.json`. Retention is
//! unbounded; callers prune externally if they care.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Failed,
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub image_tag: String,
    pub container_name: String,
    pub status: HistoryStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl DeploymentHistoryEntry {
    pub fn new(
        strategy: &str,
        image_tag: &str,
        container_name: &str,
        status: HistoryStatus,
        duration_ms: u64,
        output: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            strategy: strategy.to_string(),
            image_tag: image_tag.to_string(),
            container_name: container_name.to_string(),
            status,
            duration_ms,
            output,
        }
    }
}

/// The journal file, serialized by a mutex so concurrent operations append
/// whole lines.
pub struct DeploymentHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DeploymentHistory {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn append(&self, entry: &DeploymentHistoryEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.write_lock.lock().expect("history lock poisoned");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// The last `limit` entries, most recent first. Unparseable lines are
    /// skipped rather than failing the whole read.
    pub fn recent(&self, limit: usize) -> Result<Vec<DeploymentHistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut entries: Vec<DeploymentHistoryEntry> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> (tempfile::TempDir, DeploymentHistory) {
        let tmp = tempfile::tempdir().unwrap();
        let history = DeploymentHistory::new(tmp.path().join("deployment_history.json"));
        (tmp, history)
    }

    fn entry(name: &str, status: HistoryStatus) -> DeploymentHistoryEntry {
        DeploymentHistoryEntry::new("rolling", "app:1", name, status, 1234, None)
    }

    #[test]
    fn append_then_read_back() {
        let (_tmp, history) = history();
        history.append(&entry("a", HistoryStatus::Success)).unwrap();
        history.append(&entry("b", HistoryStatus::Failed)).unwrap();

        let entries = history.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        // Most recent first.
        assert_eq!(entries[0].container_name, "b");
        assert_eq!(entries[0].status, HistoryStatus::Failed);
        assert_eq!(entries[1].container_name, "a");
    }

    #[test]
    fn limit_truncates() {
        let (_tmp, history) = history();
        for i in 0..5 {
            history
                .append(&entry(&format!("app-{i}"), HistoryStatus::Success))
                .unwrap();
        }
        let entries = history.recent(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].container_name, "app-4");
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (_tmp, history) = history();
        history.append(&entry("good", HistoryStatus::Success)).unwrap();
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&history.path)
                .unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        history.append(&entry("also-good", HistoryStatus::Success)).unwrap();
        assert_eq!(history.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn missing_file_reads_empty() {
        let (_tmp, history) = history();
        assert!(history.recent(10).unwrap().is_empty());
    }
}
