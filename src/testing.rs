//! Scripted `AgentRunner` fake for exercising the Main Loop and sub-loops
//! without spawning a real coding assistant binary (§10.S).

use crate::error::RasenResult;
use crate::session_runner::{AgentRunner, SessionRunResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// One scripted turn: a closure run synchronously in place of spawning a
/// real session, so a test can perform the file/git side effects a real
/// coding assistant would have made (writing a file, committing, updating
/// the plan's review/qa fields) before handing back the canned result.
pub type Turn = Box<dyn FnMut() -> RasenResult<SessionRunResult> + Send>;

/// Runs scripted turns in order, one per call to `run()`. Panics if called
/// more times than it was given turns for, so a test's scenario is fully
/// accounted for.
pub struct ScriptedRunner {
    turns: Mutex<Vec<Turn>>,
}

impl ScriptedRunner {
    pub fn new(turns: Vec<Turn>) -> Self {
        let mut turns = turns;
        turns.reverse();
        Self {
            turns: Mutex::new(turns),
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        _prompt: &str,
        _cwd: &Path,
        _timeout_duration: Duration,
        _model: Option<&str>,
    ) -> RasenResult<SessionRunResult> {
        let mut turns = self.turns.lock().unwrap();
        let mut turn = turns.pop().expect("ScriptedRunner ran out of scripted turns");
        turn()
    }
}

/// Builds a minimal successful `SessionRunResult` carrying the given stdout,
/// for tests that only care about event markers in the output.
pub fn scripted_session(stdout: impl Into<String>) -> SessionRunResult {
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
