//! Implementation plan persistence (§4.B).

use crate::error::{RasenError, RasenResult};
use crate::models::{ImplementationPlan, Subtask, SubtaskStatus};
use crate::store::atomic::{atomic_write, read_with_recovery, FileLock};
use chrono::Utc;
use std::path::{Path, PathBuf};

pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("state.json"),
        }
    }

    pub fn has_plan(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> RasenResult<Option<ImplementationPlan>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let _lock = FileLock::acquire_shared(&self.path)?;
        let content = read_with_recovery(&self.path)
            .ok_or_else(|| RasenError::storage(&self.path, "plan file unreadable"))?;
        let plan = serde_json::from_str(&content)
            .map_err(|e| RasenError::storage(&self.path, format!("failed to parse plan: {e}")))?;
        Ok(Some(plan))
    }

    pub fn save(&self, mut plan: ImplementationPlan) -> RasenResult<()> {
        plan.updated_at = Utc::now();
        let _lock = FileLock::acquire_exclusive(&self.path)?;
        let content = serde_json::to_string_pretty(&plan)?;
        atomic_write(&self.path, &content)
    }

    /// In-progress subtasks take priority over pending ones, so a crash
    /// mid-subtask resumes the same subtask rather than skipping ahead.
    pub fn next_subtask(&self) -> RasenResult<Option<Subtask>> {
        let Some(plan) = self.load()? else {
            return Ok(None);
        };
        if let Some(subtask) = plan
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::InProgress)
        {
            return Ok(Some(subtask.clone()));
        }
        Ok(plan
            .subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::Pending)
            .cloned())
    }

    pub fn mark_in_progress(&self, subtask_id: &str) -> RasenResult<()> {
        self.update_status(subtask_id, SubtaskStatus::InProgress)
    }

    pub fn mark_complete(&self, subtask_id: &str) -> RasenResult<()> {
        self.update_status(subtask_id, SubtaskStatus::Completed)
    }

    pub fn mark_failed(&self, subtask_id: &str) -> RasenResult<()> {
        self.update_status(subtask_id, SubtaskStatus::Failed)
    }

    pub fn increment_attempts(&self, subtask_id: &str, approach: &str) -> RasenResult<()> {
        let mut plan = self.load()?.ok_or(RasenError::NoPlan)?;
        let subtask = plan
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| RasenError::SubtaskNotFound(subtask_id.to_string()))?;
        subtask.attempts += 1;
        subtask.last_approach = Some(approach.to_string());
        self.save(plan)
    }

    pub fn completion_stats(&self) -> RasenResult<(usize, usize)> {
        Ok(self
            .load()?
            .map(|p| p.completion_stats())
            .unwrap_or((0, 0)))
    }

    fn update_status(&self, subtask_id: &str, status: SubtaskStatus) -> RasenResult<()> {
        let mut plan = self.load()?.ok_or(RasenError::NoPlan)?;
        let subtask = plan
            .subtasks
            .iter_mut()
            .find(|s| s.id == subtask_id)
            .ok_or_else(|| RasenError::SubtaskNotFound(subtask_id.to_string()))?;
        subtask.status = status;
        self.save(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_plan() -> ImplementationPlan {
        let mut plan = ImplementationPlan::new("demo task");
        plan.subtasks.push(Subtask::new("t1", "first subtask"));
        plan.subtasks.push(Subtask::new("t2", "second subtask"));
        plan
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        store.save(sample_plan()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.task_name, "demo task");
        assert_eq!(loaded.subtasks.len(), 2);
    }

    #[test]
    fn next_subtask_prefers_in_progress_over_pending() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        store.save(sample_plan()).unwrap();
        store.mark_in_progress("t2").unwrap();

        let next = store.next_subtask().unwrap().unwrap();
        assert_eq!(next.id, "t2");
    }

    #[test]
    fn increment_attempts_records_approach() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        store.save(sample_plan()).unwrap();
        store.increment_attempts("t1", "tried approach A").unwrap();

        let plan = store.load().unwrap().unwrap();
        let subtask = plan.subtasks.iter().find(|s| s.id == "t1").unwrap();
        assert_eq!(subtask.attempts, 1);
        assert_eq!(subtask.last_approach.as_deref(), Some("tried approach A"));
    }

    #[test]
    fn completion_stats_counts_completed_subtasks() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        store.save(sample_plan()).unwrap();
        store.mark_complete("t1").unwrap();

        assert_eq!(store.completion_stats().unwrap(), (1, 2));
    }

    #[test]
    fn mark_failed_on_missing_subtask_errors() {
        let dir = tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        store.save(sample_plan()).unwrap();
        assert!(store.mark_failed("nope").is_err());
    }
}
