//! Attempt history and rollback-point tracking (§4.C).

use crate::error::RasenResult;
use crate::models::{AttemptRecord, KnownGoodCommit};
use crate::store::atomic::{atomic_write, read_with_recovery, FileLock};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AttemptHistory {
    #[serde(default)]
    records: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GoodCommits {
    #[serde(default)]
    commits: Vec<KnownGoodCommit>,
}

pub struct RecoveryStore {
    history_path: PathBuf,
    commits_path: PathBuf,
}

impl RecoveryStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            history_path: state_dir.join("attempt_history.json"),
            commits_path: state_dir.join("good_commits.json"),
        }
    }

    pub fn record_attempt(
        &self,
        subtask_id: &str,
        session: u32,
        success: bool,
        approach: &str,
        commit_hash: Option<String>,
        error_message: Option<&str>,
    ) -> RasenResult<()> {
        let mut history = self.load_history()?;
        history.records.push(AttemptRecord {
            subtask_id: subtask_id.to_string(),
            session,
            success,
            approach: approach.to_string(),
            commit_hash,
            error_message: error_message.map(|m| m.to_string()),
            timestamp: Utc::now(),
        });
        self.save_history(&history)
    }

    pub fn failed_approaches(&self, subtask_id: &str) -> RasenResult<Vec<String>> {
        let history = self.load_history()?;
        Ok(history
            .records
            .iter()
            .filter(|r| r.subtask_id == subtask_id && !r.success)
            .map(|r| r.approach.clone())
            .collect())
    }

    pub fn attempt_count(&self, subtask_id: &str) -> RasenResult<usize> {
        let history = self.load_history()?;
        Ok(history
            .records
            .iter()
            .filter(|r| r.subtask_id == subtask_id)
            .count())
    }

    pub fn record_good_commit(&self, hash: &str, subtask_id: &str) -> RasenResult<()> {
        let mut commits = self.load_commits()?;
        commits.commits.push(KnownGoodCommit {
            hash: hash.to_string(),
            subtask_id: subtask_id.to_string(),
            timestamp: Utc::now(),
        });
        self.save_commits(&commits)
    }

    pub fn last_good_commit(&self) -> RasenResult<Option<String>> {
        let commits = self.load_commits()?;
        Ok(commits.commits.last().map(|c| c.hash.clone()))
    }

    /// `true` once the last `threshold` attempts on a subtask all failed.
    pub fn is_thrashing(&self, subtask_id: &str, threshold: usize) -> RasenResult<bool> {
        let history = self.load_history()?;
        let records: Vec<_> = history
            .records
            .iter()
            .filter(|r| r.subtask_id == subtask_id)
            .collect();
        if records.len() < threshold {
            return Ok(false);
        }
        Ok(records[records.len() - threshold..]
            .iter()
            .all(|r| !r.success))
    }

    /// Human-readable hints for injection into the next attempt's prompt.
    pub fn recovery_hints(&self, subtask_id: &str) -> RasenResult<Vec<String>> {
        let history = self.load_history()?;
        let records: Vec<_> = history
            .records
            .iter()
            .filter(|r| r.subtask_id == subtask_id)
            .collect();

        if records.is_empty() {
            return Ok(vec!["This is the first attempt at this subtask".to_string()]);
        }

        let mut hints = vec![format!("Previous attempts: {}", records.len())];
        let recent = &records[records.len().saturating_sub(3)..];
        for (i, record) in recent.iter().enumerate() {
            let status = if record.success { "SUCCESS" } else { "FAILED" };
            hints.push(format!("Attempt {}: {} - {status}", i + 1, record.approach));
        }

        if records.len() >= 2 {
            hints.push("IMPORTANT: Try a DIFFERENT approach than previous attempts".to_string());
            hints.push(
                "Consider: a different library, a different pattern, or a simpler implementation"
                    .to_string(),
            );
        }

        Ok(hints)
    }

    fn load_history(&self) -> RasenResult<AttemptHistory> {
        if !self.history_path.exists() {
            return Ok(AttemptHistory::default());
        }
        let _lock = FileLock::acquire_shared(&self.history_path)?;
        match read_with_recovery(&self.history_path) {
            Some(content) => Ok(serde_json::from_str(&content).unwrap_or_default()),
            None => Ok(AttemptHistory::default()),
        }
    }

    fn save_history(&self, history: &AttemptHistory) -> RasenResult<()> {
        let _lock = FileLock::acquire_exclusive(&self.history_path)?;
        let content = serde_json::to_string_pretty(history)?;
        atomic_write(&self.history_path, &content)
    }

    fn load_commits(&self) -> RasenResult<GoodCommits> {
        if !self.commits_path.exists() {
            return Ok(GoodCommits::default());
        }
        let _lock = FileLock::acquire_shared(&self.commits_path)?;
        match read_with_recovery(&self.commits_path) {
            Some(content) => Ok(serde_json::from_str(&content).unwrap_or_default()),
            None => Ok(GoodCommits::default()),
        }
    }

    fn save_commits(&self, commits: &GoodCommits) -> RasenResult<()> {
        let _lock = FileLock::acquire_exclusive(&self.commits_path)?;
        let content = serde_json::to_string_pretty(commits)?;
        atomic_write(&self.commits_path, &content)
    }
}
