//! Layered configuration (§10.M).
//!
//! Loading order: built-in defaults < project-level `rasen.yml` < task-level
//! `config.yaml` inside the state directory (legacy `agents.*` shape
//! transformed into the flat shape below before merging) < environment
//! variable overrides.

use crate::error::{RasenError, RasenResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    pub max_runtime_seconds: u64,
    pub session_delay_seconds: u64,
    pub session_timeout_seconds: u64,
    pub max_no_commit_sessions: u32,
    pub max_consecutive_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_runtime_seconds: 6 * 3600,
            session_delay_seconds: 5,
            session_timeout_seconds: 1800,
            max_no_commit_sessions: 3,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub per_subtask: bool,
    pub max_loops: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_subtask: true,
            max_loops: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub enabled: bool,
    pub per_subtask: bool,
    pub max_iterations: u32,
    pub recurring_issue_threshold: u32,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_subtask: false,
            max_iterations: 3,
            recurring_issue_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub require_tests: bool,
    pub require_lint: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            require_tests: true,
            require_lint: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub max_tokens: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub review: ReviewConfig,
    pub qa: QaConfig,
    pub backpressure: BackpressureConfig,
    pub memory: MemoryConfig,
    /// Per-agent model override, e.g. `{"coder": "opus", "reviewer": "sonnet"}`.
    pub agents: HashMap<String, AgentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: Option<String>,
}

impl Config {
    /// Load defaults, then overlay `project_file` (e.g. `rasen.yml`) if it
    /// exists, then overlay `task_file` (e.g. `<state_dir>/config.yaml`,
    /// transformed from its legacy nested shape) if it exists, then apply
    /// environment variable overrides.
    pub fn load(project_file: Option<&Path>, task_file: Option<&Path>) -> RasenResult<Self> {
        let mut data = serde_yaml::to_value(Self::default())?;

        if let Some(path) = project_file {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                let overlay: serde_yaml::Value = serde_yaml::from_str(&text)?;
                deep_merge(&mut data, overlay);
            }
        }

        if let Some(path) = task_file {
            if path.exists() {
                let text = std::fs::read_to_string(path)?;
                let raw: serde_yaml::Value = serde_yaml::from_str(&text)?;
                let transformed = transform_task_config(raw);
                deep_merge(&mut data, transformed);
            }
        }

        let mut config: Config = serde_yaml::from_value(data)
            .map_err(|e| RasenError::config(format!("invalid configuration: {e}")))?;

        apply_env_overrides(&mut config);
        Ok(config)
    }
}

/// Recursively merges `override_value` on top of `base`, mapping-wise;
/// scalars and sequences in `override_value` replace the base outright.
fn deep_merge(base: &mut serde_yaml::Value, override_value: serde_yaml::Value) {
    match (base, override_value) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, override_value) => {
            *base_slot = override_value;
        }
    }
}

/// Task-level `config.yaml` historically used a nested `agents.reviewer` /
/// `agents.qa` shape; transform it into the flat `review`/`qa` shape before
/// merging.
fn transform_task_config(mut raw: serde_yaml::Value) -> serde_yaml::Value {
    let Some(mapping) = raw.as_mapping_mut() else {
        return raw;
    };
    let agents_key = serde_yaml::Value::String("agents".to_string());
    let Some(agents) = mapping.remove(&agents_key) else {
        return raw;
    };
    let Some(agents_map) = agents.as_mapping() else {
        return raw;
    };

    if let Some(reviewer) = agents_map.get("reviewer").and_then(|v| v.as_mapping()) {
        let review_key = serde_yaml::Value::String("review".to_string());
        let mut review = serde_yaml::Mapping::new();
        if let Some(enabled) = reviewer.get("enabled") {
            review.insert("enabled".into(), enabled.clone());
        }
        if let Some(max_iterations) = reviewer.get("max_iterations") {
            review.insert("max_loops".into(), max_iterations.clone());
        }
        mapping.insert(review_key, serde_yaml::Value::Mapping(review));
    }

    if let Some(qa) = agents_map.get("qa").and_then(|v| v.as_mapping()) {
        let qa_key = serde_yaml::Value::String("qa".to_string());
        let mut qa_out = serde_yaml::Mapping::new();
        if let Some(enabled) = qa.get("enabled") {
            qa_out.insert("enabled".into(), enabled.clone());
        }
        if let Some(max_iterations) = qa.get("max_iterations") {
            qa_out.insert("max_iterations".into(), max_iterations.clone());
        }
        if let Some(threshold) = qa.get("recurring_issue_threshold") {
            qa_out.insert("recurring_issue_threshold".into(), threshold.clone());
        }
        mapping.insert(qa_key, serde_yaml::Value::Mapping(qa_out));
    }

    raw
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(model) = std::env::var("RASEN_AGENT_MODEL") {
        config
            .agents
            .entry("coder".to_string())
            .or_default()
            .model = Some(model);
    }
    if let Ok(value) = std::env::var("RASEN_MAX_ITERATIONS") {
        if let Ok(n) = value.parse() {
            config.orchestrator.max_iterations = n;
        }
    }
    if let Ok(value) = std::env::var("RASEN_SESSION_TIMEOUT") {
        if let Ok(n) = value.parse() {
            config.orchestrator.session_timeout_seconds = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_when_no_files_present() {
        let config = Config::load(None, None).unwrap();
        assert_eq!(config.orchestrator.max_iterations, 50);
        assert!(config.review.enabled);
        assert!(config.backpressure.require_tests);
    }

    #[test]
    fn project_file_overlays_defaults() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("rasen.yml");
        std::fs::write(&project, "orchestrator:\n  max_iterations: 10\n").unwrap();

        let config = Config::load(Some(&project), None).unwrap();
        assert_eq!(config.orchestrator.max_iterations, 10);
        assert_eq!(config.orchestrator.max_no_commit_sessions, 3);
    }

    #[test]
    fn task_file_legacy_agents_shape_is_transformed() {
        let dir = tempdir().unwrap();
        let task = dir.path().join("config.yaml");
        std::fs::write(
            &task,
            "agents:\n  reviewer:\n    enabled: false\n    max_iterations: 7\n  qa:\n    enabled: true\n    recurring_issue_threshold: 5\n",
        )
        .unwrap();

        let config = Config::load(None, Some(&task)).unwrap();
        assert!(!config.review.enabled);
        assert_eq!(config.review.max_loops, 7);
        assert_eq!(config.qa.recurring_issue_threshold, 5);
    }

    #[test]
    fn env_overrides_win_over_files() {
        std::env::set_var("RASEN_MAX_ITERATIONS", "99");
        let config = Config::load(None, None).unwrap();
        assert_eq!(config.orchestrator.max_iterations, 99);
        std::env::remove_var("RASEN_MAX_ITERATIONS");
    }
}
