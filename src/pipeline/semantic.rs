//! Semantic verification layer.
//!
//! Flags names referenced in load context with no visible definition
//! (errors) and imports the toolchain cannot resolve (warnings), using the
//! parser registry. When a language server is available its error
//! diagnostics deepen the check; when neither a parser nor a server can
//! help, the layer passes through at confidence 0.5.

use super::{LayerContext, LayerKind, LayerResult, Stage, VerificationLayer};
use crate::action::{Action, ActionType};
use async_trait::async_trait;
use serde_json::json;

pub struct SemanticLayer;

impl SemanticLayer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SemanticLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationLayer for SemanticLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Semantic
    }

    fn stage(&self) -> Stage {
        Stage::PreApply
    }

    async fn run(&self, action: &Action, ctx: &LayerContext) -> LayerResult {
        if !matches!(action.action_type, ActionType::Create | ActionType::Edit) {
            return LayerResult::pass_through(LayerKind::Semantic, "no source payload");
        }

        let target = action.target.as_deref().unwrap_or_default();
        let findings = action
            .target_extension()
            .and_then(|ext| ctx.parsers.for_extension(&ext))
            .and_then(|parser| parser.analyze(&action.content, &ctx.known_modules));

        // Deeper check via the language-server pool, when one is serving
        // this file's language. Absent data means "no error reported".
        let lsp_errors = match &ctx.lsp {
            Some(manager) if manager.client_for_file(target).is_some() => {
                manager.update(target, &action.content);
                Some(manager.errors(target))
            }
            _ => None,
        };

        let findings = match findings {
            Some(findings) => findings,
            None => {
                // No parser for this language; the server alone decides.
                let Some(errors) = lsp_errors else {
                    return LayerResult::pass_through(LayerKind::Semantic, "lsp_unavailable");
                };
                if errors.is_empty() {
                    return LayerResult::pass(
                        LayerKind::Semantic,
                        1.0,
                        "no diagnostics reported",
                    );
                }
                return LayerResult::fail(
                    LayerKind::Semantic,
                    0.9,
                    format!("{} language-server error(s)", errors.len()),
                )
                .with_detail(
                    "lsp_errors",
                    json!(errors.iter().map(|d| d.message.clone()).collect::<Vec<_>>()),
                );
            }
        };

        let undefined: Vec<String> = findings
            .undefined_names
            .iter()
            .map(|f| f.name.clone())
            .collect();
        let unresolved: Vec<String> = findings
            .unresolved_imports
            .iter()
            .map(|f| f.name.clone())
            .collect();
        let lsp_error_messages: Vec<String> = lsp_errors
            .iter()
            .flatten()
            .map(|d| d.message.clone())
            .collect();

        let error_count = undefined.len() + lsp_error_messages.len();
        if error_count == 0 {
            let reason = if unresolved.is_empty() {
                "no semantic issues".to_string()
            } else {
                format!("{} unresolved import(s), no errors", unresolved.len())
            };
            return LayerResult::pass(LayerKind::Semantic, 1.0, reason)
                .with_detail("unresolved_imports", json!(unresolved));
        }

        let reason = if undefined.is_empty() {
            format!("{} language-server error(s)", lsp_error_messages.len())
        } else {
            format!("undefined name(s): {}", undefined.join(", "))
        };
        LayerResult::fail(LayerKind::Semantic, 0.9, reason)
            .with_detail("undefined_names", json!(undefined))
            .with_detail("unresolved_imports", json!(unresolved))
            .with_detail("lsp_errors", json!(lsp_error_messages))
    }
}
