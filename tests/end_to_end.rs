//! End-to-end scenarios for the Main Loop (§8 seed tests), driven against a
//! scripted agent runner so no real coding assistant binary is spawned.

mod common;

use async_trait::async_trait;
use rasen::error::RasenResult;
use rasen::main_loop::{MainLoop, TerminationReason};
use rasen::session_runner::{AgentRunner, SessionRunResult};
use rasen::store::{PlanStore, RecoveryStore};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A turn receives the rendered prompt so tests can assert on its content
/// (e.g. that fix-session prompts carry the literal reviewer feedback).
type Turn = Box<dyn FnMut(&str) -> RasenResult<SessionRunResult> + Send>;

struct RecordingRunner {
    turns: Mutex<Vec<Turn>>,
    prompts: Mutex<Vec<String>>,
}

impl RecordingRunner {
    fn new(turns: Vec<Turn>) -> Self {
        let mut turns = turns;
        turns.reverse();
        Self {
            turns: Mutex::new(turns),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for RecordingRunner {
    async fn run(
        &self,
        prompt: &str,
        _cwd: &Path,
        _timeout: Duration,
        _model: Option<&str>,
    ) -> RasenResult<SessionRunResult> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut turns = self.turns.lock().unwrap();
        let mut turn = turns.pop().expect("RecordingRunner ran out of scripted turns");
        turn(prompt)
    }
}

fn session(stdout: impl Into<String>) -> SessionRunResult {
    SessionRunResult {
        session_id: "scripted".to_string(),
        exit_code: Some(0),
        stdout_text: stdout.into(),
        stderr_text: String::new(),
        input_tokens: 0,
        output_tokens: 0,
        total_tokens: 0,
    }
}

fn no_shutdown() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

// Scenario 1: happy path, single subtask, review+QA off.
#[tokio::test]
async fn happy_path_single_subtask_completes() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &["t1"]);

    let mut config = common::default_config();
    config.review.enabled = false;
    config.qa.enabled = false;

    let project_dir = fixture.project_dir();
    let runner = RecordingRunner::new(vec![Box::new({
        let project_dir = project_dir.clone();
        move |_prompt| {
            common::commit_change(&project_dir, "feature.txt", "implemented");
            Ok(session(r#"<event topic="build.done">tests: pass, lint: pass</event>"#))
        }
    })]);

    let mut main_loop = MainLoop::new(config, &project_dir, fixture.state_dir(), runner, no_shutdown());
    let reason = main_loop.run("build a feature").await.unwrap();

    assert_eq!(reason, TerminationReason::Complete);

    let plan_store = PlanStore::new(fixture.state_dir());
    assert_eq!(plan_store.completion_stats().unwrap(), (1, 1));

    let recovery = RecoveryStore::new(fixture.state_dir());
    assert!(recovery.last_good_commit().unwrap().is_some());
    assert_eq!(recovery.attempt_count("t1").unwrap(), 1);
}

// Scenario 2: missing evidence — completion claimed without the required
// tests-pass token keeps the subtask in progress and counts as a failure.
#[tokio::test]
async fn missing_evidence_keeps_subtask_in_progress() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &["t1"]);

    let mut config = common::default_config();
    config.review.enabled = false;
    config.qa.enabled = false;
    config.orchestrator.max_consecutive_failures = 1;

    let project_dir = fixture.project_dir();
    let runner = RecordingRunner::new(vec![Box::new(|_prompt| {
        Ok(session(r#"<event topic="build.done">lint: pass</event>"#))
    })]);

    let mut main_loop = MainLoop::new(config, &project_dir, fixture.state_dir(), runner, no_shutdown());
    let reason = main_loop.run("build a feature").await.unwrap();

    assert_eq!(reason, TerminationReason::ConsecutiveFailures);

    let plan_store = PlanStore::new(fixture.state_dir());
    let plan = plan_store.load().unwrap().unwrap();
    assert_eq!(
        plan.subtasks[0].status,
        rasen::models::SubtaskStatus::InProgress
    );
}

// Scenario 3: stall — three consecutive zero-commit, no-event sessions.
#[tokio::test]
async fn stalls_after_max_no_commit_sessions() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &["t1"]);

    let mut config = common::default_config();
    config.review.enabled = false;
    config.qa.enabled = false;
    config.orchestrator.max_no_commit_sessions = 3;
    config.orchestrator.max_consecutive_failures = 100;

    let project_dir = fixture.project_dir();
    let runner = RecordingRunner::new(vec![
        Box::new(|_| Ok(session("still working, no event yet"))),
        Box::new(|_| Ok(session("still working, no event yet"))),
        Box::new(|_| Ok(session("still working, no event yet"))),
    ]);

    let mut main_loop = MainLoop::new(config, &project_dir, fixture.state_dir(), runner, no_shutdown());
    let reason = main_loop.run("build a feature").await.unwrap();

    assert_eq!(
        reason,
        TerminationReason::Stalled {
            subtask_id: "t1".to_string()
        }
    );

    let status = rasen::store::status::StatusStore::new(fixture.state_dir().join("status.json"))
        .load()
        .unwrap()
        .unwrap();
    assert!(status.status.starts_with("failed"));
}

// Scenario 4: review rejects once with feedback, then approves; the fix
// session's prompt must carry the literal reviewer feedback text.
#[tokio::test]
async fn review_rejects_once_then_approves() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &["t1"]);

    let mut config = common::default_config();
    config.review.enabled = true;
    config.review.per_subtask = true;
    config.review.max_loops = 3;
    config.qa.enabled = false;
    config.backpressure.require_tests = false;
    config.backpressure.require_lint = false;

    let project_dir = fixture.project_dir();
    let state_dir = fixture.state_dir();

    let runner = RecordingRunner::new(vec![
        // coder: implements the subtask and claims done
        Box::new({
            let project_dir = project_dir.clone();
            move |_| {
                common::commit_change(&project_dir, "feature.txt", "v1");
                Ok(session(r#"<event topic="build.done">done</event>"#))
            }
        }),
        // reviewer iteration 1: requests changes via plan state
        Box::new({
            let state_dir = state_dir.clone();
            move |_| {
                let store = PlanStore::new(&state_dir);
                let mut plan = store.load().unwrap().unwrap();
                let subtask = plan.subtasks.iter_mut().find(|s| s.id == "t1").unwrap();
                subtask.review = Some(rasen::models::SubtaskReview {
                    status: "changes_requested".to_string(),
                    feedback: vec!["add type hints".to_string()],
                    iteration: 1,
                });
                store.save(plan).unwrap();
                Ok(session("reviewed"))
            }
        }),
        // coder fix session for the review feedback
        Box::new({
            let project_dir = project_dir.clone();
            move |_| {
                common::commit_change(&project_dir, "feature.txt", "v2");
                Ok(session("fixed"))
            }
        }),
        // reviewer iteration 2: approves
        Box::new({
            let state_dir = state_dir.clone();
            move |_| {
                let store = PlanStore::new(&state_dir);
                let mut plan = store.load().unwrap().unwrap();
                let subtask = plan.subtasks.iter_mut().find(|s| s.id == "t1").unwrap();
                subtask.review = Some(rasen::models::SubtaskReview {
                    status: "approved".to_string(),
                    feedback: vec![],
                    iteration: 2,
                });
                store.save(plan).unwrap();
                Ok(session("reviewed"))
            }
        }),
    ]);

    let runner = Arc::new(runner);
    let runner_handle = Arc::clone(&runner);

    struct Delegating(Arc<RecordingRunner>);
    #[async_trait]
    impl AgentRunner for Delegating {
        async fn run(
            &self,
            prompt: &str,
            cwd: &Path,
            timeout: Duration,
            model: Option<&str>,
        ) -> RasenResult<SessionRunResult> {
            self.0.run(prompt, cwd, timeout, model).await
        }
    }

    let mut main_loop = MainLoop::new(
        config,
        &project_dir,
        fixture.state_dir(),
        Delegating(runner_handle),
        no_shutdown(),
    );
    let reason = main_loop.run("build a feature").await.unwrap();

    assert_eq!(reason, TerminationReason::Complete);

    let plan_store = PlanStore::new(fixture.state_dir());
    assert_eq!(plan_store.completion_stats().unwrap(), (1, 1));

    let prompts = runner.prompts();
    assert!(
        prompts.iter().any(|p| p.contains("add type hints")),
        "expected a fix-session prompt to carry the reviewer feedback, got: {prompts:?}"
    );
}

// Scenario 5: recurring QA issue escalates and writes QA_ESCALATION.md.
#[tokio::test]
async fn recurring_qa_issue_escalates() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &["t1"]);

    let mut config = common::default_config();
    config.review.enabled = false;
    config.qa.enabled = true;
    config.qa.per_subtask = false;
    config.qa.max_iterations = 5;
    config.qa.recurring_issue_threshold = 3;
    config.backpressure.require_tests = false;
    config.backpressure.require_lint = false;

    let project_dir = fixture.project_dir();
    let state_dir = fixture.state_dir();

    let reject_with = |issue: &'static str, state_dir: std::path::PathBuf| -> Turn {
        Box::new(move |_| {
            let store = PlanStore::new(&state_dir);
            let mut plan = store.load().unwrap().unwrap();
            plan.qa.status = "rejected".to_string();
            plan.qa.issues = vec![issue.to_string()];
            store.save(plan).unwrap();
            Ok(session("qa ran"))
        })
    };

    let fix_turn = || -> Turn { Box::new(|_| Ok(session("attempted fix"))) };

    let runner = RecordingRunner::new(vec![
        // coder completes the only subtask
        Box::new({
            let project_dir = project_dir.clone();
            move |_| {
                common::commit_change(&project_dir, "feature.txt", "v1");
                Ok(session(r#"<event topic="build.done">done</event>"#))
            }
        }),
        // qa iteration 1: rejects with "Flaky test suite"
        reject_with("Flaky test suite", state_dir.clone()),
        fix_turn(),
        // qa iteration 2: rejects with same issue, different case/whitespace
        reject_with("  flaky TEST suite  ", state_dir.clone()),
        fix_turn(),
        // qa iteration 3: rejects again, recurrence threshold reached
        reject_with("flaky test suite", state_dir.clone()),
    ]);

    let mut main_loop = MainLoop::new(config, &project_dir, fixture.state_dir(), runner, no_shutdown());
    let reason = main_loop.run("build a feature").await.unwrap();

    assert!(matches!(reason, TerminationReason::Error(_)));

    let escalation_path = project_dir.join("QA_ESCALATION.md");
    assert!(escalation_path.exists());
    let content = std::fs::read_to_string(&escalation_path).unwrap();
    assert!(content.to_lowercase().contains("flaky test suite"));
    assert!(content.contains("occurred 3 times"));
}

// Scenario 6 (crash between writes) is covered at the store level in
// store::atomic's unit tests, which simulate a stale temp file left behind
// by an interrupted write and assert `load` only ever sees the prior or new
// valid content, never a partial one.

// Boundary: a session whose exit is zero but emits no completion event must
// not mark its subtask complete, and running out of iterations terminates
// with MaxIterations rather than Complete.
#[tokio::test]
async fn exhausting_max_iterations_does_not_report_complete() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &["t1"]);

    let mut config = common::default_config();
    config.review.enabled = false;
    config.qa.enabled = false;
    config.orchestrator.max_iterations = 2;
    config.orchestrator.max_consecutive_failures = 100;
    config.orchestrator.max_no_commit_sessions = 100;

    let project_dir = fixture.project_dir();
    let runner = RecordingRunner::new(vec![
        Box::new(|_| Ok(session("no event, still working"))),
        Box::new(|_| Ok(session("no event, still working"))),
    ]);

    let mut main_loop = MainLoop::new(config, &project_dir, fixture.state_dir(), runner, no_shutdown());
    let reason = main_loop.run("build a feature").await.unwrap();

    assert_eq!(reason, TerminationReason::MaxIterations);

    let plan_store = PlanStore::new(fixture.state_dir());
    assert_eq!(plan_store.completion_stats().unwrap(), (0, 1));
}

// Boundary: an empty plan goes straight from subtask selection to final
// validation and completes immediately.
#[tokio::test]
async fn empty_plan_completes_immediately() {
    let fixture = common::setup();
    common::seed_plan(&fixture.state_dir(), &[]);

    let mut config = common::default_config();
    config.review.enabled = false;
    config.qa.enabled = false;

    let project_dir = fixture.project_dir();
    let runner = RecordingRunner::new(vec![]);

    let mut main_loop = MainLoop::new(config, &project_dir, fixture.state_dir(), runner, no_shutdown());
    let reason = main_loop.run("build nothing").await.unwrap();

    assert_eq!(reason, TerminationReason::Complete);
}
