//! Syntax verification layer.
//!
//! Parses the affected source with the language-appropriate parser and
//! fails on ERROR or missing nodes. Languages without a registered parser
//! degrade to a pass-through; the pipeline continues.

use super::{LayerContext, LayerKind, LayerResult, Stage, VerificationLayer};
use crate::action::{Action, ActionType};
use async_trait::async_trait;

pub struct SyntaxLayer;

impl SyntaxLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SyntaxLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationLayer for SyntaxLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Syntax
    }

    fn stage(&self) -> Stage {
        Stage::PreApply
    }

    async fn run(&self, action: &Action, ctx: &LayerContext) -> LayerResult {
        if !matches!(action.action_type, ActionType::Create | ActionType::Edit) {
            return LayerResult::pass_through(LayerKind::Syntax, "no source payload");
        }

        // Whitespace payloads never parse into anything reviewable.
        if action.content.trim().is_empty() {
            return LayerResult::fail(LayerKind::Syntax, 0.9, "empty source payload");
        }

        let Some(parser) = action
            .target_extension()
            .and_then(|ext| ctx.parsers.for_extension(&ext))
        else {
            return LayerResult::pass_through(LayerKind::Syntax, "unsupported_language");
        };

        let check = parser.check_syntax(&action.content);
        if check.valid {
            LayerResult::pass(LayerKind::Syntax, 1.0, "parse clean")
        } else {
            let reason = check.error.unwrap_or_else(|| "syntax error".into());
            LayerResult::fail(LayerKind::Syntax, 0.9, reason)
                .with_detail("language", parser.language())
        }
    }
}
