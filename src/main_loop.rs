//! Main orchestration loop (§4.L): the state machine that drives a single
//! orchestrator process from a task description to a finished build.

use crate::config::Config;
use crate::error::RasenResult;
use crate::events::{self, parse_events};
use crate::git::GitRepo;
use crate::models::{AgentType, LoopState, SessionMetrics, Subtask};
use crate::prompts::{self, Role};
use crate::qa_loop::{QaLoop, QaOutcome};
use crate::review_loop::{ReviewLoop, ReviewOutcome};
use crate::session_runner::AgentRunner;
use crate::store::{MemoryStore, MetricsStore, PlanStore, RecoveryStore, StatusStore};
use crate::validation::validate_completion;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Complete,
    MaxIterations,
    MaxRuntime,
    Stalled { subtask_id: String },
    ConsecutiveFailures,
    UserCancelled,
    Error(String),
}

pub struct MainLoop {
    config: Config,
    project_dir: PathBuf,
    state_dir: PathBuf,
    plan_store: PlanStore,
    recovery_store: RecoveryStore,
    memory_store: MemoryStore,
    status_store: StatusStore,
    metrics_store: MetricsStore,
    git: GitRepo,
    runner: Box<dyn AgentRunner>,
    shutdown: Arc<AtomicBool>,
    state: LoopState,
}

impl MainLoop {
    pub fn new(
        config: Config,
        project_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        runner: impl AgentRunner + 'static,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let runner: Box<dyn AgentRunner> = Box::new(runner);
        let project_dir = project_dir.into();
        let state_dir = state_dir.into();
        Self {
            plan_store: PlanStore::new(&state_dir),
            recovery_store: RecoveryStore::new(&state_dir),
            memory_store: MemoryStore::new(state_dir.join("memories.md")),
            status_store: StatusStore::new(state_dir.join("status.json")),
            metrics_store: MetricsStore::new(&state_dir),
            git: GitRepo::new(&project_dir, "[rasen]"),
            config,
            project_dir,
            state_dir,
            runner,
            shutdown,
            state: LoopState::new(),
        }
    }

    pub async fn run(&mut self, task_description: &str) -> RasenResult<TerminationReason> {
        info!("starting orchestration loop");
        let runtime_start = Instant::now();
        let baseline_commit = self.current_commit();

        if !self.plan_store.has_plan() {
            if let Some(reason) = self.run_planning(task_description).await? {
                return Ok(reason);
            }
        }

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.status_store.mark_interrupted()?;
                return Ok(TerminationReason::UserCancelled);
            }
            if self.state.iteration >= self.config.orchestrator.max_iterations {
                return Ok(TerminationReason::MaxIterations);
            }
            if runtime_start.elapsed() >= Duration::from_secs(self.config.orchestrator.max_runtime_seconds) {
                return Ok(TerminationReason::MaxRuntime);
            }

            self.state.iteration += 1;

            let Some(subtask) = self.plan_store.next_subtask()? else {
                return self.run_final_validation(task_description, &baseline_commit).await;
            };

            self.plan_store.mark_in_progress(&subtask.id)?;
            self.state.current_subtask_id = Some(subtask.id.clone());
            self.update_status(&subtask)?;

            let commit_before = self.current_commit();

            match self.run_coding_session(&subtask).await {
                Ok(outcome) => {
                    if let Some(reason) = self.handle_coding_outcome(&subtask, &commit_before, outcome).await? {
                        return Ok(reason);
                    }
                }
                Err(crate::error::RasenError::RunnerUnavailable(msg)) => {
                    self.status_store.mark_failed(&format!("agent runner unavailable: {msg}"))?;
                    return Ok(TerminationReason::Error(format!(
                        "agent runner unavailable: {msg}"
                    )));
                }
                Err(e) => {
                    warn!(subtask_id = %subtask.id, error = %e, "coding session failed");
                    self.state.consecutive_failures += 1;
                }
            }

            if self.state.consecutive_failures >= self.config.orchestrator.max_consecutive_failures {
                self.status_store.mark_failed("too many consecutive failures")?;
                return Ok(TerminationReason::ConsecutiveFailures);
            }

            tokio::time::sleep(Duration::from_secs(self.config.orchestrator.session_delay_seconds)).await;
        }
    }

    /// Runs only the initializer, without entering the iteration loop. Used
    /// by the `init`/`reinit` CLI commands.
    pub async fn initialize(&mut self, task_description: &str) -> RasenResult<()> {
        if let Some(reason) = self.run_planning(task_description).await? {
            return Err(crate::error::RasenError::Session(format!(
                "initialization failed: {reason:?}"
            )));
        }
        Ok(())
    }

    async fn run_planning(&mut self, task_description: &str) -> RasenResult<Option<TerminationReason>> {
        info!("no plan found, running initializer");
        let mut substitutions = HashMap::new();
        substitutions.insert("task_description", task_description.to_string());
        substitutions.insert("project_dir", self.project_dir.display().to_string());
        let prompt = prompts::assemble(Role::Initializer, &substitutions);

        let timeout = Duration::from_secs(self.config.orchestrator.session_timeout_seconds);
        let result = self.runner.run(&prompt, &self.project_dir, timeout, None).await;

        match result {
            Ok(session) => {
                self.record_session_metrics(AgentType::Initializer, None, &session, runtime_zero());
                if !self.plan_store.has_plan() {
                    self.status_store.mark_failed("initializer did not produce a plan")?;
                    return Ok(Some(TerminationReason::Error(
                        "initializer did not produce a plan".to_string(),
                    )));
                }
                Ok(None)
            }
            Err(e) => {
                self.status_store.mark_failed(&e.to_string())?;
                Ok(Some(TerminationReason::Error(e.to_string())))
            }
        }
    }

    async fn run_coding_session(&mut self, subtask: &Subtask) -> RasenResult<CodingOutcome> {
        let memory_context = self
            .memory_store
            .format_for_injection(self.config.memory.max_tokens);
        let failed_approaches = self.recovery_store.failed_approaches(&subtask.id)?;
        let attempt_number = self.recovery_store.attempt_count(&subtask.id)? + 1;

        let failed_section = if failed_approaches.is_empty() {
            String::new()
        } else {
            let mut section = String::from("## Previous Failed Approaches\n");
            for approach in &failed_approaches {
                section.push_str(&format!("- {approach}\n"));
            }
            section
        };

        let mut substitutions = HashMap::new();
        substitutions.insert("subtask_id", subtask.id.clone());
        substitutions.insert("subtask_description", subtask.description.clone());
        substitutions.insert("attempt_number", attempt_number.to_string());
        substitutions.insert("memory_context", memory_context);
        substitutions.insert("failed_approaches_section", failed_section);
        substitutions.insert("project_dir", self.project_dir.display().to_string());
        let prompt = prompts::assemble(Role::Coder, &substitutions);

        let timeout = Duration::from_secs(self.config.orchestrator.session_timeout_seconds);
        let started = Instant::now();
        let session = self.runner.run(&prompt, &self.project_dir, timeout, None).await?;
        let elapsed = started.elapsed();

        self.record_session_metrics(AgentType::Coder, Some(subtask.id.clone()), &session, elapsed);

        let parsed_events = parse_events(&session.stdout_text);
        let success = session.exit_code == Some(0) && events::has_completion(&parsed_events);

        Ok(CodingOutcome {
            events: parsed_events,
            exit_code: session.exit_code,
            output_tail: tail(&session.stdout_text, 500),
            success,
        })
    }

    async fn handle_coding_outcome(
        &mut self,
        subtask: &Subtask,
        commit_before: &str,
        outcome: CodingOutcome,
    ) -> RasenResult<Option<TerminationReason>> {
        let commits_made = if commit_before.is_empty() {
            0
        } else {
            self.git.commits_since(commit_before).unwrap_or(0)
        };

        if commits_made == 0 {
            let count = self
                .state
                .no_commit_counts
                .entry(subtask.id.clone())
                .or_insert(0);
            *count += 1;
            if *count >= self.config.orchestrator.max_no_commit_sessions {
                self.status_store
                    .mark_failed(&format!("stalled: no commits for {count} consecutive sessions"))?;
                return Ok(Some(TerminationReason::Stalled {
                    subtask_id: subtask.id.clone(),
                }));
            }
        } else {
            self.state.no_commit_counts.insert(subtask.id.clone(), 0);
            self.state.total_commits += commits_made as u32;
        }

        let commit_after = self.current_commit();
        let approach = summarize_approach(&outcome.events, &subtask.description);
        self.recovery_store.record_attempt(
            &subtask.id,
            self.state.iteration,
            outcome.success,
            &approach,
            outcome.success.then(|| commit_after.clone()),
            (!outcome.success).then(|| outcome.output_tail.as_str()),
        )?;

        if outcome.success {
            if validate_completion(&outcome.events, &self.config.backpressure) {
                if self.config.review.enabled && self.config.review.per_subtask {
                    let review_loop = ReviewLoop {
                        config: &self.config.review,
                        runner: self.runner.as_ref(),
                        plan_store: &self.plan_store,
                        git: &self.git,
                        project_dir: &self.project_dir,
                        session_timeout: Duration::from_secs(self.config.orchestrator.session_timeout_seconds),
                        session_delay: Duration::from_secs(self.config.orchestrator.session_delay_seconds),
                    };
                    match review_loop.run(Some(subtask), commit_before).await? {
                        ReviewOutcome::Passed => {
                            self.plan_store.mark_complete(&subtask.id)?;
                            self.recovery_store.record_good_commit(&commit_after, &subtask.id)?;
                        }
                        ReviewOutcome::Failed { .. } => {
                            self.state.consecutive_failures += 1;
                        }
                    }
                } else {
                    self.plan_store.mark_complete(&subtask.id)?;
                    self.recovery_store.record_good_commit(&commit_after, &subtask.id)?;
                }
            } else {
                warn!(subtask_id = %subtask.id, "completion claimed but backpressure validation failed");
                self.state.consecutive_failures += 1;
            }
        } else if events::has_blocked(&outcome.events) {
            self.plan_store.mark_failed(&subtask.id)?;
            self.state.consecutive_failures += 1;
        } else {
            self.state.consecutive_failures += 1;
        }

        Ok(None)
    }

    async fn run_final_validation(
        &mut self,
        task_description: &str,
        baseline_commit: &str,
    ) -> RasenResult<TerminationReason> {
        if self.config.review.enabled && !self.config.review.per_subtask {
            let review_loop = ReviewLoop {
                config: &self.config.review,
                runner: self.runner.as_ref(),
                plan_store: &self.plan_store,
                git: &self.git,
                project_dir: &self.project_dir,
                session_timeout: Duration::from_secs(self.config.orchestrator.session_timeout_seconds),
                session_delay: Duration::from_secs(self.config.orchestrator.session_delay_seconds),
            };
            if let ReviewOutcome::Failed { .. } = review_loop.run(None, baseline_commit).await? {
                self.status_store.mark_failed("build-level review failed")?;
                return Ok(TerminationReason::Error("build-level review failed".to_string()));
            }
        }

        if self.config.qa.enabled {
            let plan = self.plan_store.load()?.ok_or(crate::error::RasenError::NoPlan)?;
            let qa_loop = QaLoop {
                config: &self.config.qa,
                runner: self.runner.as_ref(),
                plan_store: &self.plan_store,
                git: &self.git,
                project_dir: &self.project_dir,
                session_timeout: Duration::from_secs(self.config.orchestrator.session_timeout_seconds),
                session_delay: Duration::from_secs(self.config.orchestrator.session_delay_seconds),
            };
            if let QaOutcome::Failed = qa_loop.run(&plan, task_description, baseline_commit).await? {
                self.status_store.mark_failed("QA did not approve the build")?;
                return Ok(TerminationReason::Error("QA did not approve the build".to_string()));
            }
        }

        self.status_store.mark_completed()?;
        Ok(TerminationReason::Complete)
    }

    fn current_commit(&self) -> String {
        self.git.current_commit().unwrap_or_default()
    }

    fn update_status(&self, subtask: &Subtask) -> RasenResult<()> {
        let (completed, total) = self.plan_store.completion_stats()?;
        let status = crate::models::StatusInfo {
            pid: std::process::id(),
            iteration: self.state.iteration,
            subtask_id: Some(subtask.id.clone()),
            subtask_description: Some(subtask.description.clone()),
            current_phase: "coding".to_string(),
            last_activity: Utc::now(),
            status: "running".to_string(),
            total_commits: self.state.total_commits,
            completed_subtasks: completed,
            total_subtasks: total,
        };
        self.status_store.update(&status)
    }

    fn record_session_metrics(
        &self,
        agent_type: AgentType,
        subtask_id: Option<String>,
        session: &crate::session_runner::SessionRunResult,
        duration: Duration,
    ) {
        let metrics = SessionMetrics {
            session_id: session.session_id.clone(),
            agent_type,
            subtask_id,
            duration_seconds: duration.as_secs_f64(),
            input_tokens: session.input_tokens,
            output_tokens: session.output_tokens,
            total_tokens: session.total_tokens,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            status: if session.exit_code == Some(0) { "completed" } else { "failed" }.to_string(),
        };
        let _ = self.metrics_store.record_session(metrics);
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

struct CodingOutcome {
    events: Vec<crate::models::Event>,
    #[allow(dead_code)]
    exit_code: Option<i32>,
    output_tail: String,
    success: bool,
}

/// A short human-readable label for what the session tried, for storage in
/// the attempt history and later injection into "Previous Failed
/// Approaches" prompt sections. Falls back to the subtask description when
/// the session reported no usable event payload.
fn summarize_approach(parsed_events: &[crate::models::Event], subtask_description: &str) -> String {
    if let Some(event) = events::completion_event(parsed_events) {
        return event.payload.clone();
    }
    if let Some(payload) = events::event_payload(parsed_events, "build.blocked") {
        return payload.to_string();
    }
    subtask_description.to_string()
}

fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        text.to_string()
    } else {
        text[text.len() - max_bytes..].to_string()
    }
}

fn runtime_zero() -> Duration {
    Duration::from_secs(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_truncates_to_last_n_bytes() {
        let text = "a".repeat(600) + "END";
        let tail = tail(&text, 500);
        assert_eq!(tail.len(), 500);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn tail_returns_whole_string_when_shorter_than_limit() {
        assert_eq!(tail("short", 500), "short");
    }
}
