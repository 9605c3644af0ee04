//! Backpressure validator (§4.G).
//!
//! Decides whether a completion claim carries the evidence the configured
//! policy requires. This gate is pure text matching: no network, file, or
//! subprocess work.

use crate::config::BackpressureConfig;
use crate::events::completion_event;
use crate::models::Event;

const TESTS_PASS_TOKENS: [&str; 2] = ["tests: pass", "test pass"];
const LINT_PASS_TOKENS: [&str; 2] = ["lint: pass", "lint pass"];
const TYPE_CHECK_PASS_TOKENS: [&str; 2] = ["mypy: pass", "type check: pass"];

/// `true` iff a completion event is present and it satisfies every enabled
/// requirement in `policy`.
pub fn validate_completion(events: &[Event], policy: &BackpressureConfig) -> bool {
    let Some(event) = completion_event(events) else {
        return false;
    };
    let payload = event.payload.to_lowercase();

    if policy.require_tests && !TESTS_PASS_TOKENS.iter().any(|t| payload.contains(t)) {
        return false;
    }
    if policy.require_lint && !LINT_PASS_TOKENS.iter().any(|t| payload.contains(t)) {
        return false;
    }
    true
}

/// Independent evidence signals found in a completion payload, for
/// diagnostics and `SubtaskReview`/`SubtaskQa` population. Does not
/// participate in the pass/fail gate above.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityEvidence {
    pub tests_pass: bool,
    pub lint_pass: bool,
    pub type_check_pass: bool,
}

pub fn quality_evidence(payload: &str) -> QualityEvidence {
    let lower = payload.to_lowercase();
    QualityEvidence {
        tests_pass: TESTS_PASS_TOKENS.iter().any(|t| lower.contains(t)),
        lint_pass: LINT_PASS_TOKENS.iter().any(|t| lower.contains(t)),
        type_check_pass: TYPE_CHECK_PASS_TOKENS.iter().any(|t| lower.contains(t)),
    }
}
