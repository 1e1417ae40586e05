//! Structural verification layer.
//!
//! Runs only when the action carries a structural IR payload. Payload
//! semantics live with the sandbox/proposer contract, so verification is
//! delegated to a pluggable [`StructuralVerifier`]; without one, only
//! well-formedness is checked.

use super::{LayerContext, LayerKind, LayerResult, Stage, VerificationLayer};
use crate::action::{Action, StructuralIr};
use async_trait::async_trait;
use std::sync::Arc;

/// Pluggable assembler/checker for structural IR payloads.
pub trait StructuralVerifier: Send + Sync {
    /// Verify an IR payload; `Err` carries the rejection reason.
    fn verify(&self, ir: &StructuralIr) -> std::result::Result<(), String>;
}

/// The structural gate.
pub struct StructuralLayer {
    verifier: Option<Arc<dyn StructuralVerifier>>,
}

impl StructuralLayer {
    pub fn new() -> Self {
        Self { verifier: None }
    }

    pub fn with_verifier(verifier: Arc<dyn StructuralVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }
}

impl Default for StructuralLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerificationLayer for StructuralLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Structural
    }

    fn stage(&self) -> Stage {
        Stage::PreApply
    }

    async fn run(&self, action: &Action, _ctx: &LayerContext) -> LayerResult {
        let Some(ir) = &action.structural_ir else {
            return LayerResult::pass_through(LayerKind::Structural, "no structural payload");
        };

        match &self.verifier {
            Some(verifier) => match verifier.verify(ir) {
                Ok(()) => LayerResult::pass(LayerKind::Structural, 1.0, "structural verify clean"),
                Err(reason) => LayerResult::fail(LayerKind::Structural, 0.9, reason)
                    .with_detail("listing", ir.listing.clone()),
            },
            None => {
                if ir.is_well_formed() {
                    LayerResult::pass(
                        LayerKind::Structural,
                        0.9,
                        "structural payload well-formed",
                    )
                } else {
                    LayerResult::fail(
                        LayerKind::Structural,
                        0.9,
                        "malformed structural payload",
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{context, FakeSandbox};

    struct RejectAll;

    impl StructuralVerifier for RejectAll {
        fn verify(&self, _ir: &StructuralIr) -> Result<(), String> {
            Err("opcode 0x7f not allowed".into())
        }
    }

    #[tokio::test]
    async fn test_no_payload_is_pass_through() {
        let ctx = context(Arc::new(FakeSandbox::new()));
        let result = StructuralLayer::new()
            .run(&Action::edit("a.py", "x = 1"), &ctx)
            .await;
        assert!(result.passed);
        assert_eq!(result.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_well_formed_payload_passes_without_verifier() {
        let ctx = context(Arc::new(FakeSandbox::new()));
        let action = Action::edit("a.py", "x = 1")
            .with_structural_ir(StructuralIr::new(vec![1, 2, 3], "PUSH 1"));
        let result = StructuralLayer::new().run(&action, &ctx).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_verifier_rejection_blocks() {
        let ctx = context(Arc::new(FakeSandbox::new()));
        let action = Action::edit("a.py", "x = 1")
            .with_structural_ir(StructuralIr::new(vec![0x7f], "BAD"));
        let result = StructuralLayer::with_verifier(Arc::new(RejectAll))
            .run(&action, &ctx)
            .await;

        assert!(!result.passed);
        assert!(result.is_blocking_failure(0.7));
        assert_eq!(result.reason, "opcode 0x7f not allowed");
    }
}
