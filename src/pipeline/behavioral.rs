//! Behavioral verification layer.
//!
//! Runs the sandbox's test subset covering the files the action touched,
//! within the configured time budget. A timeout is an infrastructure
//! failure; an action touching nothing testable passes through.

use super::{FailureKind, LayerContext, LayerKind, LayerResult, Stage, VerificationLayer};
use crate::action::Action;
use crate::error::Error;
use async_trait::async_trait;
use serde_json::json;

/// How much test output to keep in layer details.
const OUTPUT_TAIL_CHARS: usize = 2_000;

fn tail(text: &str) -> String {
    if text.len() <= OUTPUT_TAIL_CHARS {
        return text.to_string();
    }
    let start = text.len() - OUTPUT_TAIL_CHARS;
    let boundary = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(start);
    text[boundary..].to_string()
}

pub struct BehavioralLayer;

impl BehavioralLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BehavioralLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationLayer for BehavioralLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Behavioral
    }

    fn stage(&self) -> Stage {
        Stage::PostApply
    }

    async fn run(&self, action: &Action, ctx: &LayerContext) -> LayerResult {
        let paths = action.touched_paths();
        if paths.is_empty() {
            return LayerResult::pass_through(LayerKind::Behavioral, "no_covering_tests");
        }

        match ctx.sandbox.run_tests(&paths, ctx.config.test_timeout).await {
            Ok(outcome) if outcome.is_green() => LayerResult::pass(
                LayerKind::Behavioral,
                1.0,
                format!("{} test(s) passed", outcome.passed),
            )
            .with_detail("duration_ms", outcome.duration_ms),
            Ok(outcome) => LayerResult::fail(
                LayerKind::Behavioral,
                1.0,
                format!("{} test(s) failed", outcome.failed),
            )
            .with_detail("failed", outcome.failed)
            .with_detail("passed", outcome.passed)
            .with_detail("stdout", json!(tail(&outcome.stdout)))
            .with_detail("stderr", json!(tail(&outcome.stderr))),
            Err(Error::Timeout { duration_ms }) => LayerResult::fail(
                LayerKind::Behavioral,
                0.9,
                "timeout",
            )
            .with_failure_kind(FailureKind::Infrastructure)
            .with_detail("timeout_ms", duration_ms),
            Err(e) => LayerResult::fail(LayerKind::Behavioral, 0.9, format!("test run failed: {e}"))
                .with_failure_kind(FailureKind::Infrastructure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{context, FakeSandbox};
    use crate::sandbox::TestOutcome;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_green_run_passes() {
        let sandbox = Arc::new(FakeSandbox::new());
        let ctx = context(sandbox);
        let action = Action::edit("utils.py", "x = 1");
        let result = BehavioralLayer::new().run(&action, &ctx).await;
        assert!(result.passed);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_failing_tests_block() {
        let sandbox = Arc::new(FakeSandbox::new());
        sandbox.set_test_outcome(TestOutcome {
            passed: 2,
            failed: 1,
            stdout: "FAILED test_utils.py::test_sum - assert 3 == 4".into(),
            stderr: String::new(),
            duration_ms: 50,
        });
        let ctx = context(sandbox);
        let action = Action::edit("utils.py", "x = 1");
        let result = BehavioralLayer::new().run(&action, &ctx).await;

        assert!(!result.passed);
        assert!(result.is_blocking_failure(0.7));
        assert_eq!(result.details.get("failed").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_untargeted_action_passes_through() {
        let ctx = context(Arc::new(FakeSandbox::new()));
        let result = BehavioralLayer::new()
            .run(&Action::command("echo hi"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.reason, "no_covering_tests");
    }

    #[test]
    fn test_tail_truncates_long_output() {
        let long = "x".repeat(5_000);
        assert_eq!(tail(&long).len(), OUTPUT_TAIL_CHARS);
        assert_eq!(tail("short"), "short");
    }
}
