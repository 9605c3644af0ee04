//! Session metrics persistence and aggregation (§4.E).

use crate::error::RasenResult;
use crate::models::{AggregateMetrics, AgentType, SessionMetrics};
use crate::store::atomic::{atomic_write, FileLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetricsData {
    #[serde(default)]
    sessions: Vec<SessionMetrics>,
    #[serde(default)]
    aggregate: AggregateMetrics,
}

pub struct MetricsStore {
    path: PathBuf,
}

impl MetricsStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("metrics.json"),
        }
    }

    pub fn record_session(&self, metrics: SessionMetrics) -> RasenResult<()> {
        let _lock = FileLock::acquire_exclusive(&self.path)?;
        let mut data = self.load_data();
        data.aggregate.record(&metrics);
        data.sessions.push(metrics);
        let content = serde_json::to_string_pretty(&data)?;
        atomic_write(&self.path, &content)
    }

    pub fn aggregate(&self) -> AggregateMetrics {
        self.load_data().aggregate
    }

    pub fn all_sessions(&self) -> Vec<SessionMetrics> {
        self.load_data().sessions
    }

    pub fn by_agent(&self, agent_type: AgentType) -> Vec<SessionMetrics> {
        self.load_data()
            .sessions
            .into_iter()
            .filter(|s| s.agent_type == agent_type)
            .collect()
    }

    pub fn recent_sessions(&self, count: usize) -> Vec<SessionMetrics> {
        let sessions = self.load_data().sessions;
        let start = sessions.len().saturating_sub(count);
        sessions[start..].to_vec()
    }

    /// Corrupted or missing metrics files degrade to an empty aggregate
    /// rather than failing the caller: metrics are diagnostic, not load
    /// bearing for correctness.
    fn load_data(&self) -> MetricsData {
        if !self.path.exists() {
            return MetricsData::default();
        }
        let Ok(_lock) = FileLock::acquire_shared(&self.path) else {
            return MetricsData::default();
        };
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn session(agent_type: AgentType, tokens: u64) -> SessionMetrics {
        SessionMetrics {
            session_id: uuid::Uuid::new_v4().to_string(),
            agent_type,
            subtask_id: Some("t1".to_string()),
            duration_seconds: 12.5,
            input_tokens: tokens,
            output_tokens: tokens,
            total_tokens: tokens * 2,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            status: "completed".to_string(),
        }
    }

    #[test]
    fn record_session_updates_aggregate() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        store.record_session(session(AgentType::Coder, 100)).unwrap();
        store.record_session(session(AgentType::Reviewer, 50)).unwrap();

        let agg = store.aggregate();
        assert_eq!(agg.total_sessions, 2);
        assert_eq!(agg.total_tokens, 300);
        assert_eq!(agg.sessions_by_agent["coder"], 1);
        assert_eq!(agg.sessions_by_agent["reviewer"], 1);
    }

    #[test]
    fn by_agent_filters_sessions() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        store.record_session(session(AgentType::Coder, 10)).unwrap();
        store.record_session(session(AgentType::Qa, 20)).unwrap();

        assert_eq!(store.by_agent(AgentType::Coder).len(), 1);
        assert_eq!(store.by_agent(AgentType::Qa).len(), 1);
    }

    #[test]
    fn recent_sessions_returns_tail() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        for _ in 0..5 {
            store.record_session(session(AgentType::Coder, 1)).unwrap();
        }
        assert_eq!(store.recent_sessions(2).len(), 2);
    }

    #[test]
    fn aggregate_is_empty_when_no_file_exists() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::new(dir.path());
        assert_eq!(store.aggregate().total_sessions, 0);
    }
}
