//! Error taxonomy for the orchestrator core.
//!
//! Mirrors the error categories in §7 of the design: configuration, session,
//! validation, storage, version control, stall, and user cancellation.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

pub type RasenResult<T> = Result<T, RasenError>;

/// A structured view of an error, suitable for CLI output or log lines.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    pub recovery_action: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
    pub retryable: bool,
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RasenError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("session failed: {0}")]
    Session(String),

    #[error("session timed out after {timeout_seconds}s (session {session_id})")]
    SessionTimeout {
        session_id: String,
        timeout_seconds: u64,
    },

    #[error("agent runner unavailable: {0}")]
    RunnerUnavailable(String),

    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("lock error at {path:?}: {message}")]
    Lock { path: PathBuf, message: String },

    #[error("no plan exists for this task")]
    NoPlan,

    #[error("subtask not found: {0}")]
    SubtaskNotFound(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("stalled: no commits for {sessions} consecutive sessions on subtask {subtask_id}")]
    Stalled { subtask_id: String, sessions: u32 },

    #[error("too many consecutive failures ({count})")]
    ConsecutiveFailures { count: u32 },

    #[error("max iterations reached ({max})")]
    MaxIterations { max: u32 },

    #[error("max runtime exceeded ({max_seconds}s)")]
    MaxRuntime { max_seconds: u64 },

    #[error("cancelled by user")]
    UserCancelled,

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RasenError {
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn lock(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Lock {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn git(message: impl Into<String>) -> Self {
        Self::Git(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the underlying condition is plausibly transient and worth
    /// a local retry (used by the git wrapper's backoff logic).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("another git process")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Session(_) => "session_failed",
            Self::SessionTimeout { .. } => "session_timeout",
            Self::RunnerUnavailable(_) => "runner_unavailable",
            Self::Storage { .. } => "storage_error",
            Self::Lock { .. } => "lock_error",
            Self::NoPlan => "no_plan",
            Self::SubtaskNotFound(_) => "subtask_not_found",
            Self::Git(_) => "git_error",
            Self::Stalled { .. } => "stalled",
            Self::ConsecutiveFailures { .. } => "consecutive_failures",
            Self::MaxIterations { .. } => "max_iterations",
            Self::MaxRuntime { .. } => "max_runtime",
            Self::UserCancelled => "user_cancelled",
            Self::Daemon(_) => "daemon_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }

    fn recovery_action(&self) -> String {
        match self {
            Self::Config(_) => "Fix the configuration file and restart".to_string(),
            Self::Session(_) => "The loop will retry with the next session".to_string(),
            Self::SessionTimeout { .. } => "Increase session_timeout_seconds or simplify the subtask".to_string(),
            Self::RunnerUnavailable(_) => "Install or configure the coding assistant binary".to_string(),
            Self::Storage { .. } => "Inspect the state directory for corruption; restore from backup if present".to_string(),
            Self::Lock { .. } => "Check for a stale lock or a second running instance".to_string(),
            Self::NoPlan => "Run `rasen init` to create a plan first".to_string(),
            Self::SubtaskNotFound(_) => "Check the subtask id against the current plan".to_string(),
            Self::Git(_) => "Verify the working tree is a valid git repository".to_string(),
            Self::Stalled { .. } => "Review recovery hints and try a different approach".to_string(),
            Self::ConsecutiveFailures { .. } => "Inspect recent attempts and intervene manually".to_string(),
            Self::MaxIterations { .. } => "Increase max_iterations and resume".to_string(),
            Self::MaxRuntime { .. } => "Increase max_runtime_seconds and resume".to_string(),
            Self::UserCancelled => "Resume with `rasen resume` when ready".to_string(),
            Self::Daemon(_) => "Check for a stale PID file or conflicting instance".to_string(),
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) => "Inspect the underlying file for corruption".to_string(),
        }
    }

    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: self.code().to_string(),
            message: self.to_string(),
            recovery_action: self.recovery_action(),
            context: HashMap::new(),
            retryable: self.is_retryable(),
        }
    }
}
