//! Feedback store
//!
//! Per-(pattern, value) verdicts recorded by users. Persistence is a
//! single append-only JSONL file read fully at engine construction;
//! writes are line appends under a single-writer lock. Scans read an
//! immutable snapshot taken at scan start, so feedback recorded mid-scan
//! only affects future scans.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub pattern_id: String,
    pub value: String,
    pub is_false_positive: bool,
    pub timestamp: DateTime<Utc>,
}

/// Immutable view handed to scorers at scan start.
pub type FeedbackSnapshot = Arc<HashMap<(String, String), bool>>;

pub struct FeedbackStore {
    path: PathBuf,
    entries: RwLock<HashMap<(String, String), FeedbackRecord>>,
    writer: Mutex<()>,
}

impl FeedbackStore {
    /// Load the store, tolerating a missing file and skipping corrupt
    /// lines (the log is append-only; a torn tail line is expected after
    /// a crash).
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                for (number, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<FeedbackRecord>(line) {
                        Ok(record) => {
                            entries.insert(
                                (record.pattern_id.clone(), record.value.clone()),
                                record,
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                "skipping corrupt feedback line {} in {}: {}",
                                number + 1,
                                path.display(),
                                e
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read feedback store {}", path.display()));
            }
        }
        tracing::debug!("loaded {} feedback records from {}", entries.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    /// Record a verdict. Recording the same verdict twice is a no-op; a
    /// changed verdict appends a new line (last record wins on load).
    pub fn record(&self, pattern_id: &str, value: &str, is_false_positive: bool) -> Result<()> {
        let key = (pattern_id.to_string(), value.to_string());
        {
            let entries = self.entries.read().expect("feedback lock poisoned");
            if let Some(existing) = entries.get(&key) {
                if existing.is_false_positive == is_false_positive {
                    return Ok(());
                }
            }
        }

        let record = FeedbackRecord {
            pattern_id: pattern_id.to_string(),
            value: value.to_string(),
            is_false_positive,
            timestamp: Utc::now(),
        };

        let _write_guard = self.writer.lock().expect("feedback writer poisoned");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create feedback directory {}", parent.display())
            })?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open feedback store {}", self.path.display()))?;
        let line = serde_json::to_string(&record).context("failed to serialize feedback")?;
        writeln!(file, "{line}").context("failed to append feedback record")?;

        self.entries
            .write()
            .expect("feedback lock poisoned")
            .insert(key, record);
        Ok(())
    }

    /// Snapshot the current verdicts for one scan.
    pub fn snapshot(&self) -> FeedbackSnapshot {
        let entries = self.entries.read().expect("feedback lock poisoned");
        Arc::new(
            entries
                .iter()
                .map(|(key, record)| (key.clone(), record.is_false_positive))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("feedback lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feedback.jsonl");

        let store = FeedbackStore::load(&path).unwrap();
        store.record("generic-api-key", "abc123", true).unwrap();
        store.record("github-token", "ghp_x", false).unwrap();
        assert_eq!(store.len(), 2);

        let reloaded = FeedbackStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let snapshot = reloaded.snapshot();
        assert_eq!(
            snapshot.get(&("generic-api-key".into(), "abc123".into())),
            Some(&true)
        );
    }

    #[test]
    fn recording_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feedback.jsonl");

        let store = FeedbackStore::load(&path).unwrap();
        store.record("p", "v", true).unwrap();
        store.record("p", "v", true).unwrap();
        store.record("p", "v", true).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }

    #[test]
    fn changed_verdict_appends_and_last_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feedback.jsonl");

        let store = FeedbackStore::load(&path).unwrap();
        store.record("p", "v", true).unwrap();
        store.record("p", "v", false).unwrap();

        let reloaded = FeedbackStore::load(&path).unwrap();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.get(&("p".into(), "v".into())), Some(&false));
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feedback.jsonl");
        std::fs::write(
            &path,
            "{\"patternId\":\"p\",\"value\":\"v\",\"isFalsePositive\":true,\"timestamp\":\"2026-01-01T00:00:00Z\"}\nnot json\n",
        )
        .unwrap();

        let store = FeedbackStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
    }
}
