//! Real-time status file for external monitoring (§4.E).

use crate::error::RasenResult;
use crate::models::StatusInfo;
use crate::store::atomic::atomic_write;
use std::path::{Path, PathBuf};

pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn update(&self, status: &StatusInfo) -> RasenResult<()> {
        let content = serde_json::to_string_pretty(status)?;
        atomic_write(&self.path, &content)
    }

    pub fn load(&self) -> RasenResult<Option<StatusInfo>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn mark_completed(&self) -> RasenResult<()> {
        if let Some(mut status) = self.load()? {
            status.mark_completed();
            self.update(&status)?;
        }
        Ok(())
    }

    pub fn mark_failed(&self, reason: &str) -> RasenResult<()> {
        if let Some(mut status) = self.load()? {
            status.mark_failed(reason);
            self.update(&status)?;
        }
        Ok(())
    }

    pub fn mark_interrupted(&self) -> RasenResult<()> {
        if let Some(mut status) = self.load()? {
            status.mark_interrupted();
            self.update(&status)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample() -> StatusInfo {
        StatusInfo {
            pid: 1234,
            iteration: 1,
            subtask_id: Some("t1".to_string()),
            subtask_description: Some("first subtask".to_string()),
            current_phase: "coding".to_string(),
            last_activity: Utc::now(),
            status: "running".to_string(),
            total_commits: 0,
            completed_subtasks: 0,
            total_subtasks: 3,
        }
    }

    #[test]
    fn update_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        store.update(&sample()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.pid, 1234);
        assert_eq!(loaded.status, "running");
    }

    #[test]
    fn mark_failed_prefixes_reason() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        store.update(&sample()).unwrap();
        store.mark_failed("git commit rejected").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.status, "failed: git commit rejected");
    }

    #[test]
    fn mark_completed_is_a_no_op_without_existing_status() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path().join("status.json"));
        store.mark_completed().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
