//! Data model shared by the stores and the main loop (§3 of the design).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskReview {
    pub status: String,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub iteration: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskQa {
    pub status: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub status: SubtaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_approach: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<SubtaskReview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa: Option<SubtaskQa>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: SubtaskStatus::Pending,
            attempts: 0,
            last_approach: None,
            title: None,
            files: Vec::new(),
            tests: Vec::new(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            review: None,
            qa: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanReview {
    pub status: String,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub iteration: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanQa {
    pub status: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub recurring_issues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMemory {
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub learnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub task_name: String,
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub review: PlanReview,
    #[serde(default)]
    pub qa: PlanQa,
    #[serde(default)]
    pub memory: PlanMemory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AggregateMetrics>,
    #[serde(default)]
    pub session_history: Vec<SessionMetrics>,
}

impl ImplementationPlan {
    pub fn new(task_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            subtasks: Vec::new(),
            created_at: now,
            updated_at: now,
            project: None,
            description: None,
            notes: Vec::new(),
            review: PlanReview::default(),
            qa: PlanQa::default(),
            memory: PlanMemory::default(),
            metrics: None,
            session_history: Vec::new(),
        }
    }

    pub fn completion_stats(&self) -> (usize, usize) {
        let completed = self
            .subtasks
            .iter()
            .filter(|s| matches!(s.status, SubtaskStatus::Completed))
            .count();
        (completed, self.subtasks.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub subtask_id: String,
    pub session: u32,
    pub success: bool,
    pub approach: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownGoodCommit {
    pub hash: String,
    pub subtask_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Pattern,
    Decision,
    Fix,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pattern => write!(f, "pattern"),
            Self::Decision => write!(f, "decision"),
            Self::Fix => write!(f, "fix"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub pid: u32,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_description: Option<String>,
    pub current_phase: String,
    pub last_activity: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub total_commits: u32,
    #[serde(default)]
    pub completed_subtasks: usize,
    #[serde(default)]
    pub total_subtasks: usize,
}

impl StatusInfo {
    pub fn mark_failed(&mut self, reason: impl std::fmt::Display) {
        self.status = format!("failed: {}", reason);
        self.last_activity = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = "completed".to_string();
        self.last_activity = Utc::now();
    }

    pub fn mark_interrupted(&mut self) {
        self.status = "interrupted".to_string();
        self.last_activity = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Initializer,
    Coder,
    Reviewer,
    Qa,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializer => write!(f, "initializer"),
            Self::Coder => write!(f, "coder"),
            Self::Reviewer => write!(f, "reviewer"),
            Self::Qa => write!(f, "qa"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub agent_type: AgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    pub duration_seconds: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateMetrics {
    #[serde(default)]
    pub total_sessions: u64,
    #[serde(default)]
    pub total_duration_seconds: f64,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub sessions_by_agent: HashMap<String, u64>,
    #[serde(default)]
    pub tokens_by_agent: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AggregateMetrics {
    pub fn record(&mut self, metrics: &SessionMetrics) {
        self.total_sessions += 1;
        self.total_duration_seconds += metrics.duration_seconds;
        self.total_input_tokens += metrics.input_tokens;
        self.total_output_tokens += metrics.output_tokens;
        self.total_tokens += metrics.total_tokens;

        let agent = metrics.agent_type.to_string();
        *self.sessions_by_agent.entry(agent.clone()).or_insert(0) += 1;
        *self.tokens_by_agent.entry(agent).or_insert(0) += metrics.total_tokens;

        if self.started_at.is_none() {
            self.started_at = Some(metrics.started_at);
        }
        self.completed_at = Some(metrics.completed_at.unwrap_or_else(Utc::now));
    }
}

/// A single `<event topic="...">payload</event>` marker (§4.F). Transient,
/// never persisted by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    pub payload: String,
}

/// In-memory-only loop state, recreated on every process start (§3).
#[derive(Debug, Clone)]
pub struct LoopState {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub current_subtask_id: Option<String>,
    pub completion_confirmations: u32,
    pub consecutive_failures: u32,
    pub total_commits: u32,
    pub no_commit_counts: HashMap<String, u32>,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            started_at: Utc::now(),
            current_subtask_id: None,
            completion_confirmations: 0,
            consecutive_failures: 0,
            total_commits: 0,
            no_commit_counts: HashMap::new(),
        }
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}
