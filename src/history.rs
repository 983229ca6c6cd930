use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Append-only JSON-L ledger of benchmark runs and upload attempts.
#[derive(Debug, Clone)]
pub struct RunHistory {
    log_path: PathBuf,
}

impl RunHistory {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Unable to create history directory {}", parent.display())
            })?;
        }

        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open run history {}", self.log_path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Append, logging failures instead of returning them.
    pub fn record(&self, entry: &HistoryEntry) {
        if let Err(err) = self.append(entry) {
            warn!(path = %self.log_path.display(), error = %err, "failed to record run history");
        }
    }

    /// Read the most recent `limit` entries, oldest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        if limit == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.log_path)
            .with_context(|| format!("Failed to open run history {}", self.log_path.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<HistoryEntry> = VecDeque::with_capacity(limit);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: HistoryEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(line = index + 1, error = %err, "skipping malformed history line");
                    continue;
                }
            };
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(entry);
        }

        Ok(buffer.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryKind {
    Run,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: HistoryKind,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub before_mean: Option<f64>,
    #[serde(default)]
    pub after_mean: Option<f64>,
    /// Signed percentage, positive when faster.
    #[serde(default)]
    pub improvement: Option<f64>,
    pub outcome: String,
}

impl HistoryEntry {
    pub fn new(session_id: Uuid, kind: HistoryKind, outcome: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            kind,
            instance: None,
            image: None,
            before_mean: None,
            after_mean: None,
            improvement: None,
            outcome: outcome.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(outcome: &str) -> HistoryEntry {
        let mut entry = HistoryEntry::new(Uuid::new_v4(), HistoryKind::Run, outcome);
        entry.instance = Some("acme__widgets-42".into());
        entry.improvement = Some(12.5);
        entry
    }

    #[test]
    fn read_recent_keeps_the_tail() {
        let dir = tempdir().unwrap();
        let history = RunHistory::new(dir.path().join("history").join("runs.jsonl"));
        for index in 0..5 {
            history.append(&entry(&format!("run-{index}"))).unwrap();
        }

        let recent = history.read_recent(2).unwrap();
        let outcomes: Vec<_> = recent.iter().map(|e| e.outcome.as_str()).collect();
        assert_eq!(outcomes, vec!["run-3", "run-4"]);
        assert!(history.read_recent(0).unwrap().is_empty());
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let history = RunHistory::new(dir.path().join("absent.jsonl"));
        assert!(history.read_recent(10).unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let history = RunHistory::new(path.clone());
        history.append(&entry("first")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        history.append(&entry("second")).unwrap();

        let recent = history.read_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].outcome, "second");
        assert_eq!(recent[1].instance.as_deref(), Some("acme__widgets-42"));
    }
}
