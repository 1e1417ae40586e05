//! Layered verification pipeline.
//!
//! A fixed ordered gate of verification layers (structural, syntax,
//! semantic, behavioral, intent). Layers run cheapest-first and the
//! pipeline short-circuits on the first failing layer whose confidence
//! exceeds the blocking threshold; lower-confidence failures are advisory
//! and never halt execution.

mod behavioral;
mod intent;
mod semantic;
mod structural;
mod syntax;

pub use behavioral::BehavioralLayer;
pub use intent::IntentLayer;
pub use semantic::SemanticLayer;
pub use structural::{StructuralLayer, StructuralVerifier};
pub use syntax::SyntaxLayer;

use crate::action::{Action, ActionType};
use crate::lsp::LspManager;
use crate::parser::ParserRegistry;
use crate::proposer::ActionProposer;
use crate::sandbox::{AppliedChange, Sandbox};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default confidence above which a failing layer halts the pipeline.
pub const DEFAULT_BLOCKING_THRESHOLD: f64 = 0.7;

/// Identifies one verification layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Structural,
    Syntax,
    Semantic,
    Behavioral,
    Intent,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Structural => "structural",
            Self::Syntax => "syntax",
            Self::Semantic => "semantic",
            Self::Behavioral => "behavioral",
            Self::Intent => "intent",
        };
        write!(f, "{}", s)
    }
}

/// When a layer runs relative to the sandbox apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Runs against the proposed action before it is applied
    PreApply,
    /// Runs against the sandbox state the action produced
    PostApply,
}

/// The kinds of failure the core recognizes and propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// High-risk action refused by policy or checkpoint
    Safety,
    /// Structural IR rejected
    Structural,
    /// Parse error
    Syntax,
    /// Undefined name, unresolved import, type error
    Semantic,
    /// Test failure or runtime exception post-apply
    Behavioral,
    /// Artifact does not satisfy acceptance criteria
    Intent,
    /// Timeout, dead process, unreachable sandbox
    Infrastructure,
    /// Max cycles or max depth exceeded
    Budget,
}

impl FailureKind {
    /// Whether a cycle that failed this way may be retried.
    ///
    /// Safety and budget failures end the intention; everything else may
    /// be re-prompted with failure context (infrastructure up to a small
    /// retry cap enforced by the engine).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Safety | Self::Budget)
    }
}

impl From<LayerKind> for FailureKind {
    fn from(layer: LayerKind) -> Self {
        match layer {
            LayerKind::Structural => Self::Structural,
            LayerKind::Syntax => Self::Syntax,
            LayerKind::Semantic => Self::Semantic,
            LayerKind::Behavioral => Self::Behavioral,
            LayerKind::Intent => Self::Intent,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Safety => "safety",
            Self::Structural => "structural",
            Self::Syntax => "syntax",
            Self::Semantic => "semantic",
            Self::Behavioral => "behavioral",
            Self::Intent => "intent",
            Self::Infrastructure => "infrastructure",
            Self::Budget => "budget",
        };
        write!(f, "{}", s)
    }
}

/// Structured reason for a halted cycle or failed intention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    /// The failing layer, when the failure came from the pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerKind>,
    pub reason: String,
    /// Structured details from the failing layer
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl FailureReason {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            layer: None,
            reason: reason.into(),
            details: Map::new(),
        }
    }

    pub fn with_layer(mut self, layer: LayerKind) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Whether this failure carries a security tag (always unrecoverable
    /// for the engine, regardless of kind).
    pub fn is_security(&self) -> bool {
        self.reason.starts_with("security_")
            || self
                .details
                .get("factors")
                .and_then(Value::as_array)
                .map_or(false, |factors| {
                    factors
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|f| f.starts_with("security_"))
                })
    }
}

/// Verdict of a single verification layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerResult {
    pub layer: LayerKind,
    pub passed: bool,
    /// In `[0.0, 1.0]`. A pass at 0.5 or below is a non-blocking
    /// pass-through (the layer was inapplicable).
    pub confidence: f64,
    pub reason: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Overrides the layer→kind mapping for the halting reason
    /// (infrastructure failures inside a layer).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl LayerResult {
    pub fn pass(layer: LayerKind, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            layer,
            passed: true,
            confidence,
            reason: reason.into(),
            details: Map::new(),
            failure_kind: None,
        }
    }

    pub fn fail(layer: LayerKind, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            layer,
            passed: false,
            confidence,
            reason: reason.into(),
            details: Map::new(),
            failure_kind: None,
        }
    }

    /// Non-blocking pass-through for an inapplicable layer.
    pub fn pass_through(layer: LayerKind, reason: impl Into<String>) -> Self {
        Self::pass(layer, 0.5, reason)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }

    /// Whether this result halts the pipeline at the given threshold.
    pub fn is_blocking_failure(&self, threshold: f64) -> bool {
        !self.passed && self.confidence > threshold
    }

    fn to_failure_reason(&self) -> FailureReason {
        let kind = self.failure_kind.unwrap_or_else(|| self.layer.into());
        FailureReason {
            kind,
            layer: Some(self.layer),
            reason: self.reason.clone(),
            details: self.details.clone(),
        }
    }
}

/// Full report of a pipeline run: layer results in execution order, the
/// overall verdict, and the first blocking failure if any.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub results: Vec<LayerResult>,
    /// Pass iff every executed layer passed
    pub overall: bool,
    /// The first failing layer's reason, when the pipeline halted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halting: Option<FailureReason>,
}

impl VerificationReport {
    /// An empty (vacuously passing) report.
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            overall: true,
            halting: None,
        }
    }

    /// Fold another report into this one, preserving execution order.
    pub fn merge(&mut self, other: VerificationReport) {
        self.results.extend(other.results);
        self.overall = self.overall && other.overall;
        if self.halting.is_none() {
            self.halting = other.halting;
        }
    }

    /// Which layers executed in this report.
    pub fn executed_layers(&self) -> Vec<LayerKind> {
        self.results.iter().map(|r| r.layer).collect()
    }
}

/// Configuration shared by the pipeline and its layers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Failures at or below this confidence are advisory
    pub blocking_threshold: f64,
    /// Whether behavioral/intent layers run for Query actions
    pub verify_queries: bool,
    /// Time budget for behavioral test runs
    pub test_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            blocking_threshold: DEFAULT_BLOCKING_THRESHOLD,
            verify_queries: false,
            test_timeout: Duration::from_secs(120),
        }
    }
}

/// Everything a layer may consult while verifying one action.
pub struct LayerContext {
    /// Goal of the intention under verification
    pub what: String,
    /// Acceptance criteria of the intention
    pub criteria: Vec<String>,
    /// Sandbox the action targets
    pub sandbox: Arc<dyn Sandbox>,
    /// LLM judge for the intent layer and batch settlement
    pub judge: Option<Arc<dyn ActionProposer>>,
    /// Language-server pool for deeper semantic checks
    pub lsp: Option<Arc<LspManager>>,
    /// Source parsers for syntax/semantic checks
    pub parsers: Arc<ParserRegistry>,
    /// Workspace modules considered resolvable
    pub known_modules: HashSet<String>,
    /// The applied change, present for post-apply layers
    pub applied: Option<AppliedChange>,
    pub config: PipelineConfig,
}

/// One gate in the pipeline.
#[async_trait]
pub trait VerificationLayer: Send + Sync {
    fn kind(&self) -> LayerKind;
    fn stage(&self) -> Stage;

    /// Verify one action. Layers are stateless beyond what they receive
    /// and translate their own infrastructure errors into results.
    async fn run(&self, action: &Action, ctx: &LayerContext) -> LayerResult;
}

/// The ordered verification gate.
pub struct VerificationPipeline {
    layers: Vec<Box<dyn VerificationLayer>>,
    blocking_threshold: f64,
}

impl VerificationPipeline {
    /// Pipeline with the standard five layers in order.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_BLOCKING_THRESHOLD)
    }

    /// Standard layers with a custom blocking threshold.
    pub fn with_threshold(blocking_threshold: f64) -> Self {
        Self {
            layers: vec![
                Box::new(StructuralLayer::new()),
                Box::new(SyntaxLayer::new()),
                Box::new(SemanticLayer::new()),
                Box::new(BehavioralLayer::new()),
                Box::new(IntentLayer::new()),
            ],
            blocking_threshold,
        }
    }

    /// Pipeline over custom layers (kept in the given order).
    pub fn with_layers(layers: Vec<Box<dyn VerificationLayer>>, blocking_threshold: f64) -> Self {
        Self {
            layers,
            blocking_threshold,
        }
    }

    /// Attach a structural verifier by replacing the structural layer.
    pub fn with_structural_verifier(mut self, verifier: Arc<dyn StructuralVerifier>) -> Self {
        for layer in &mut self.layers {
            if layer.kind() == LayerKind::Structural {
                *layer = Box::new(StructuralLayer::with_verifier(verifier));
                break;
            }
        }
        self
    }

    /// Run the layers for `stage` (or all layers when `None`) against an
    /// action, short-circuiting on the first blocking failure.
    pub async fn run(
        &self,
        action: &Action,
        ctx: &LayerContext,
        stage: Option<Stage>,
    ) -> VerificationReport {
        let mut report = VerificationReport::empty();

        for layer in &self.layers {
            if let Some(stage) = stage {
                if layer.stage() != stage {
                    continue;
                }
            }

            // Post-apply layers are disabled for queries by configuration.
            if action.action_type == ActionType::Query
                && !ctx.config.verify_queries
                && layer.stage() == Stage::PostApply
            {
                continue;
            }

            let result = layer.run(action, ctx).await;
            debug!(
                layer = %result.layer,
                passed = result.passed,
                confidence = result.confidence,
                reason = %result.reason,
                "layer result"
            );

            let blocking = result.is_blocking_failure(self.blocking_threshold);
            if !result.passed {
                report.overall = false;
            }
            if blocking && report.halting.is_none() {
                report.halting = Some(result.to_failure_reason());
            }
            report.results.push(result);

            if blocking {
                break;
            }
        }

        report
    }
}

impl Default for VerificationPipeline {
    fn default() -> Self {
        Self::new()
    }
}
