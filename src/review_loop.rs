//! Review sub-loop (§4.J): reviewer approves or requests changes on a
//! completed subtask before it is allowed to count as done.

use crate::config::ReviewConfig;
use crate::error::RasenResult;
use crate::git::GitRepo;
use crate::models::{ImplementationPlan, PlanReview, Subtask, SubtaskReview};
use crate::prompts::{self, Role};
use crate::session_runner::AgentRunner;
use crate::store::PlanStore;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Passed,
    Failed { feedback: Vec<String> },
}

pub struct ReviewLoop<'a> {
    pub config: &'a ReviewConfig,
    pub runner: &'a dyn AgentRunner,
    pub plan_store: &'a PlanStore,
    pub git: &'a GitRepo,
    pub project_dir: &'a Path,
    pub session_timeout: Duration,
    pub session_delay: Duration,
}

impl<'a> ReviewLoop<'a> {
    /// Runs the review sub-loop for `subtask`, diffing against
    /// `baseline_commit`. When `subtask` is `None`, this is the
    /// build-level review pass over the whole plan.
    pub async fn run(&self, subtask: Option<&Subtask>, baseline_commit: &str) -> RasenResult<ReviewOutcome> {
        if !self.config.enabled {
            return Ok(ReviewOutcome::Passed);
        }

        let max_loops = self.config.max_loops;
        let subtask_id = subtask.map(|s| s.id.as_str()).unwrap_or("build-complete");

        for iteration in 1..=max_loops {
            info!(subtask_id, iteration, max_loops, "running reviewer session");

            let git_diff = self.diff_since(baseline_commit);

            let description = subtask
                .map(|s| s.description.clone())
                .unwrap_or_else(|| "Final validation of the completed build.".to_string());

            let mut substitutions = HashMap::new();
            substitutions.insert("subtask_id", subtask_id.to_string());
            substitutions.insert("subtask_description", description);
            substitutions.insert("git_diff", git_diff);
            substitutions.insert("project_dir", self.project_dir.display().to_string());
            let prompt = prompts::assemble(Role::Reviewer, &substitutions);

            let session = self
                .runner
                .run(&prompt, self.project_dir, self.session_timeout, None)
                .await;

            let verdict = match session {
                Ok(_) => self.read_verdict(subtask_id),
                Err(e) => {
                    warn!(error = %e, "reviewer session failed, treating as approved");
                    Verdict::Approved
                }
            };

            match verdict {
                Verdict::Approved => {
                    info!(subtask_id, "review approved");
                    return Ok(ReviewOutcome::Passed);
                }
                Verdict::ChangesRequested(feedback) => {
                    if iteration >= max_loops {
                        warn!(subtask_id, max_loops, "review loop exhausted with changes still requested");
                        return Ok(ReviewOutcome::Failed { feedback });
                    }
                    self.run_fix_session(subtask_id, &feedback).await?;
                    tokio::time::sleep(self.session_delay).await;
                }
            }
        }

        Ok(ReviewOutcome::Failed { feedback: Vec::new() })
    }

    fn diff_since(&self, baseline_commit: &str) -> String {
        if baseline_commit.is_empty() {
            return "(no baseline commit — treating as a fresh repository)".to_string();
        }
        self.git
            .diff_since(baseline_commit)
            .unwrap_or_else(|_| "(could not generate diff)".to_string())
    }

    /// Reviewer sessions are read-only: the sub-loop never trusts the
    /// session's own stdout for the verdict, only what the session wrote
    /// into the plan's review fields.
    fn read_verdict(&self, subtask_id: &str) -> Verdict {
        let Ok(Some(plan)) = self.plan_store.load() else {
            return Verdict::Approved;
        };

        let review = if subtask_id == "build-complete" {
            Some(plan.review.clone())
        } else {
            plan.subtasks
                .iter()
                .find(|s| s.id == subtask_id)
                .and_then(|s| s.review.clone())
                .map(|r| PlanReview {
                    status: r.status,
                    feedback: r.feedback,
                    iteration: r.iteration,
                })
        };

        match review {
            Some(r) if r.status == "approved" => Verdict::Approved,
            Some(r) if r.status == "changes_requested" => Verdict::ChangesRequested(r.feedback),
            _ => Verdict::Approved,
        }
    }

    async fn run_fix_session(&self, subtask_id: &str, feedback: &[String]) -> RasenResult<()> {
        let issues_text = feedback.join("\n");
        let mut substitutions = HashMap::new();
        substitutions.insert("subtask_id", subtask_id.to_string());
        substitutions.insert(
            "subtask_description",
            format!("Fix review issues: {issues_text}"),
        );
        substitutions.insert("attempt_number", "review-fix".to_string());
        substitutions.insert("memory_context", String::new());
        substitutions.insert("failed_approaches_section", String::new());
        substitutions.insert("project_dir", self.project_dir.display().to_string());
        let prompt = prompts::assemble(Role::Coder, &substitutions);

        self.runner
            .run(&prompt, self.project_dir, self.session_timeout, None)
            .await?;
        Ok(())
    }
}

enum Verdict {
    Approved,
    ChangesRequested(Vec<String>),
}

pub fn subtask_review_status(subtask: &Subtask) -> Option<&SubtaskReview> {
    subtask.review.as_ref()
}

pub fn plan_review_status(plan: &ImplementationPlan) -> &PlanReview {
    &plan.review
}
