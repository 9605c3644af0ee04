//! QA sub-loop (§4.K): final acceptance pass over the whole plan, with
//! recurring-issue escalation to a human.

use crate::config::QaConfig;
use crate::error::RasenResult;
use crate::git::GitRepo;
use crate::models::ImplementationPlan;
use crate::prompts::{self, Role};
use crate::session_runner::AgentRunner;
use crate::store::PlanStore;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QaOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone)]
struct QaIteration {
    approved: bool,
    issues: Vec<String>,
}

/// Accumulates per-iteration QA issues to detect ones that recur across
/// fix attempts rather than getting resolved.
#[derive(Debug, Default)]
struct QaHistory {
    issue_counts: HashMap<String, u32>,
    iterations: Vec<QaIteration>,
}

impl QaHistory {
    fn record(&mut self, iteration: QaIteration) {
        for issue in &iteration.issues {
            *self.issue_counts.entry(normalize(issue)).or_insert(0) += 1;
        }
        self.iterations.push(iteration);
    }

    fn recurring_issues(&self, threshold: u32) -> Vec<(String, u32)> {
        self.issue_counts
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(issue, count)| (issue.clone(), *count))
            .collect()
    }
}

fn normalize(issue: &str) -> String {
    issue.to_lowercase().trim().to_string()
}

pub struct QaLoop<'a> {
    pub config: &'a QaConfig,
    pub runner: &'a dyn AgentRunner,
    pub plan_store: &'a PlanStore,
    pub git: &'a GitRepo,
    pub project_dir: &'a Path,
    pub session_timeout: Duration,
    pub session_delay: Duration,
}

impl<'a> QaLoop<'a> {
    pub async fn run(
        &self,
        plan: &ImplementationPlan,
        task_description: &str,
        baseline_commit: &str,
    ) -> RasenResult<QaOutcome> {
        if !self.config.enabled {
            return Ok(QaOutcome::Passed);
        }

        let max_iterations = self.config.max_iterations;
        let mut history = QaHistory::default();

        for iteration in 1..=max_iterations {
            info!(iteration, max_iterations, "running QA session");

            let iteration_result = self.run_qa_session(plan, task_description, baseline_commit).await;
            history.record(iteration_result.clone());

            if iteration_result.approved {
                info!("QA approved — implementation complete");
                return Ok(QaOutcome::Passed);
            }

            warn!(issues = iteration_result.issues.len(), "QA rejected implementation");

            let recurring = history.recurring_issues(self.config.recurring_issue_threshold);
            if !recurring.is_empty() {
                error!(count = recurring.len(), "recurring QA issues detected, escalating");
                self.write_escalation(&recurring, &history)?;
                return Ok(QaOutcome::Failed);
            }

            if iteration >= max_iterations {
                error!(max_iterations, "QA loop exhausted without approval");
                return Ok(QaOutcome::Failed);
            }

            self.run_fix_session(&iteration_result.issues).await?;
            tokio::time::sleep(self.session_delay).await;
        }

        Ok(QaOutcome::Failed)
    }

    async fn run_qa_session(
        &self,
        plan: &ImplementationPlan,
        task_description: &str,
        baseline_commit: &str,
    ) -> QaIteration {
        let mut substitutions = HashMap::new();
        substitutions.insert("task_description", task_description.to_string());
        substitutions.insert("implementation_plan", summarize_plan(plan));
        substitutions.insert("full_git_diff", self.diff_since(baseline_commit));
        substitutions.insert("test_results", "(see coder session output)".to_string());
        substitutions.insert("project_dir", self.project_dir.display().to_string());
        let prompt = prompts::assemble(Role::Qa, &substitutions);

        let session = self
            .runner
            .run(&prompt, self.project_dir, self.session_timeout, None)
            .await;

        match session {
            Ok(_) => self.read_verdict(),
            Err(e) => {
                // Unlike review, QA silence or failure is fail-closed.
                error!(error = %e, "QA session failed, treating as rejected");
                QaIteration {
                    approved: false,
                    issues: vec![format!("QA session failed: {e}")],
                }
            }
        }
    }

    fn read_verdict(&self) -> QaIteration {
        let Ok(Some(plan)) = self.plan_store.load() else {
            return QaIteration {
                approved: false,
                issues: vec!["no plan found when reading QA verdict".to_string()],
            };
        };

        match plan.qa.status.as_str() {
            "approved" => QaIteration {
                approved: true,
                issues: Vec::new(),
            },
            "rejected" => QaIteration {
                approved: false,
                issues: if plan.qa.issues.is_empty() {
                    vec!["no clear QA signal received".to_string()]
                } else {
                    plan.qa.issues.clone()
                },
            },
            _ => QaIteration {
                approved: false,
                issues: vec!["no clear QA signal received".to_string()],
            },
        }
    }

    async fn run_fix_session(&self, issues: &[String]) -> RasenResult<()> {
        let issues_text = issues
            .iter()
            .enumerate()
            .map(|(i, issue)| format!("{}. {issue}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        let mut substitutions = HashMap::new();
        substitutions.insert("subtask_id", "qa-fix".to_string());
        substitutions.insert(
            "subtask_description",
            format!("Fix QA issues:\n{issues_text}"),
        );
        substitutions.insert("attempt_number", "qa-fix".to_string());
        substitutions.insert("memory_context", String::new());
        substitutions.insert("failed_approaches_section", String::new());
        substitutions.insert("project_dir", self.project_dir.display().to_string());
        let prompt = prompts::assemble(Role::Coder, &substitutions);

        self.runner
            .run(&prompt, self.project_dir, self.session_timeout, None)
            .await?;
        Ok(())
    }

    fn diff_since(&self, baseline_commit: &str) -> String {
        if baseline_commit.is_empty() {
            return "(no baseline commit — treating as a fresh repository)".to_string();
        }
        self.git
            .diff_since(baseline_commit)
            .unwrap_or_else(|_| "(could not generate diff)".to_string())
    }

    fn write_escalation(&self, recurring: &[(String, u32)], history: &QaHistory) -> RasenResult<()> {
        let path = self.project_dir.join("QA_ESCALATION.md");
        let content = render_escalation(recurring, history);
        std::fs::write(&path, content)?;
        info!(path = %path.display(), "wrote QA escalation artifact");
        Ok(())
    }
}

fn summarize_plan(plan: &ImplementationPlan) -> String {
    let mut out = format!("Total subtasks: {}\n", plan.subtasks.len());
    for subtask in &plan.subtasks {
        out.push_str(&format!(
            "- {}: {} [{:?}]\n",
            subtask.id, subtask.description, subtask.status
        ));
    }
    out
}

fn render_escalation(recurring: &[(String, u32)], history: &QaHistory) -> String {
    let mut out = String::from("# QA Escalation - Human Intervention Required\n\n");
    out.push_str(
        "## Summary\n\nThe QA validation loop has detected recurring issues that the agent \
cannot resolve autonomously. Human review and intervention is required to proceed.\n\n",
    );

    out.push_str(&format!(
        "## Recurring Issues\n\n{} issue(s) have recurred at or above the configured threshold:\n\n",
        recurring.len()
    ));
    for (issue, count) in recurring {
        out.push_str(&format!("### Issue (occurred {count} times)\n\n{issue}\n\n"));
    }

    out.push_str(&format!(
        "## QA History\n\nTotal QA iterations: {}\n\n",
        history.iterations.len()
    ));
    for (i, iteration) in history.iterations.iter().enumerate() {
        let status = if iteration.approved { "APPROVED" } else { "REJECTED" };
        out.push_str(&format!("### Iteration {}: {status}\n\n", i + 1));
        if !iteration.approved {
            out.push_str("Issues found:\n");
            for issue in &iteration.issues {
                out.push_str(&format!("- {issue}\n"));
            }
            out.push('\n');
        }
    }

    out.push_str(
        "## Next Steps\n\n1. Review the recurring issues above\n2. Manually fix the issues or provide clearer guidance\n3. Delete this file when ready to resume\n4. Run `rasen resume` to continue\n",
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_flags_recurring_issues_at_threshold() {
        let mut history = QaHistory::default();
        for _ in 0..3 {
            history.record(QaIteration {
                approved: false,
                issues: vec!["Missing error handling".to_string()],
            });
        }
        let recurring = history.recurring_issues(3);
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].1, 3);
    }

    #[test]
    fn history_normalizes_case_and_whitespace_when_counting() {
        let mut history = QaHistory::default();
        history.record(QaIteration {
            approved: false,
            issues: vec!["Missing error handling".to_string()],
        });
        history.record(QaIteration {
            approved: false,
            issues: vec!["  missing ERROR handling  ".to_string()],
        });
        let recurring = history.recurring_issues(2);
        assert_eq!(recurring.len(), 1);
    }

    #[test]
    fn escalation_artifact_mentions_issue_and_count() {
        let mut history = QaHistory::default();
        for _ in 0..3 {
            history.record(QaIteration {
                approved: false,
                issues: vec!["flaky test suite".to_string()],
            });
        }
        let recurring = history.recurring_issues(3);
        let rendered = render_escalation(&recurring, &history);
        assert!(rendered.contains("flaky test suite"));
        assert!(rendered.contains("occurred 3 times"));
        assert!(rendered.contains("QA History"));
    }
}
