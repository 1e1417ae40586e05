//! Intent verification layer.
//!
//! Asks the LLM judge whether the produced artifact satisfies the
//! intention's acceptance criteria. An unclear verdict counts as a pass at
//! confidence 0.5, as does an empty criteria list.

use super::{FailureKind, LayerContext, LayerKind, LayerResult, Stage, VerificationLayer};
use crate::action::Action;
use crate::proposer::{JudgeVerdict, ProposalKind, ProposalRequest, Purpose};
use async_trait::async_trait;
use serde_json::json;

pub struct IntentLayer;

impl IntentLayer {
    pub fn new() -> Self {
        Self
    }

    fn judge_context(action: &Action, ctx: &LayerContext) -> String {
        let mut parts = vec![format!(
            "Action: {} {}",
            action.action_type,
            action.target.as_deref().unwrap_or("-")
        )];
        if let Some(applied) = &ctx.applied {
            if !applied.diff.is_empty() {
                parts.push(format!("Applied diff:\n{}", applied.diff));
            }
        } else if !action.content.is_empty() {
            parts.push(format!("Proposed content:\n{}", action.content));
        }
        parts.join("\n\n")
    }
}

impl Default for IntentLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationLayer for IntentLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Intent
    }

    fn stage(&self) -> Stage {
        Stage::PostApply
    }

    async fn run(&self, action: &Action, ctx: &LayerContext) -> LayerResult {
        let criteria: Vec<String> = ctx
            .criteria
            .iter()
            .filter(|c| !c.trim().is_empty())
            .cloned()
            .collect();
        if criteria.is_empty() {
            return LayerResult::pass(
                LayerKind::Intent,
                0.5,
                "unclear: no acceptance criteria",
            );
        }

        let Some(judge) = &ctx.judge else {
            return LayerResult::pass_through(LayerKind::Intent, "no_judge_configured");
        };

        let request = ProposalRequest::new(ctx.what.clone(), Purpose::Judge)
            .with_criteria(criteria.clone())
            .with_context(Self::judge_context(action, ctx));

        match judge.propose(request).await {
            Ok(proposal) => {
                let elapsed = proposal.elapsed_ms;
                let result = match proposal.kind {
                    ProposalKind::Verdict { verdict, reason } => match verdict {
                        JudgeVerdict::Pass => {
                            LayerResult::pass(LayerKind::Intent, 0.9, "criteria satisfied")
                        }
                        JudgeVerdict::Unclear => LayerResult::pass(
                            LayerKind::Intent,
                            0.5,
                            format!("unclear: {reason}"),
                        ),
                        JudgeVerdict::Fail => {
                            LayerResult::fail(LayerKind::Intent, 0.9, reason)
                                .with_detail("criteria", json!(criteria))
                        }
                    },
                    other => LayerResult::pass_through(
                        LayerKind::Intent,
                        format!("judge returned non-verdict: {}", variant_name(&other)),
                    ),
                };
                result.with_detail("judge_elapsed_ms", elapsed)
            }
            Err(e) => LayerResult::fail(LayerKind::Intent, 0.9, format!("judge error: {e}"))
                .with_failure_kind(FailureKind::Infrastructure),
        }
    }
}

fn variant_name(kind: &ProposalKind) -> &'static str {
    match kind {
        ProposalKind::Decomposition(_) => "decomposition",
        ProposalKind::Action(_) => "action",
        ProposalKind::Verdict { .. } => "verdict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{context, FakeSandbox, ScriptedProposer};
    use crate::proposer::SubIntention;
    use std::sync::Arc;

    fn ctx_with_judge(verdict: JudgeVerdict) -> super::super::LayerContext {
        let mut ctx = context(Arc::new(FakeSandbox::new()));
        ctx.judge = Some(Arc::new(ScriptedProposer::judging(verdict)));
        ctx
    }

    #[tokio::test]
    async fn test_judge_pass() {
        let ctx = ctx_with_judge(JudgeVerdict::Pass);
        let result = IntentLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_judge_fail_carries_criteria() {
        let ctx = ctx_with_judge(JudgeVerdict::Fail);
        let result = IntentLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(!result.passed);
        assert!(result.is_blocking_failure(0.7));
        assert!(result.details.contains_key("criteria"));
    }

    #[tokio::test]
    async fn test_unclear_is_half_confidence_pass() {
        let ctx = ctx_with_judge(JudgeVerdict::Unclear);
        let result = IntentLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_empty_criteria_is_unclear() {
        let mut ctx = ctx_with_judge(JudgeVerdict::Pass);
        ctx.criteria = vec!["   ".into()];
        let result = IntentLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.confidence, 0.5);
        assert!(result.reason.starts_with("unclear"));
    }

    #[tokio::test]
    async fn test_no_judge_passes_through() {
        let ctx = context(Arc::new(FakeSandbox::new()));
        let result = IntentLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.reason, "no_judge_configured");
    }

    struct ConfusedJudge;

    #[async_trait]
    impl crate::proposer::ActionProposer for ConfusedJudge {
        async fn propose(
            &self,
            _request: ProposalRequest,
        ) -> crate::error::Result<crate::proposer::Proposal> {
            Ok(crate::proposer::Proposal::new(
                ProposalKind::Decomposition(vec![SubIntention::new("odd", vec![])]),
                1,
            ))
        }
    }

    #[tokio::test]
    async fn test_non_verdict_reply_degrades() {
        let mut ctx = context(Arc::new(FakeSandbox::new()));
        ctx.judge = Some(Arc::new(ConfusedJudge));
        let result = IntentLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.confidence, 0.5);
    }
}
