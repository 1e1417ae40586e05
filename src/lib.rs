//! # riva-core
//!
//! A recursive intention-verification core for agentic code generation.
//! Given a user-stated intention and a sandboxed repository checkout, the
//! engine drives a language model through a bounded, self-verifying loop:
//! decompose the task, propose actions, apply them, and gate every change
//! through a layered verification pipeline before committing to it.
//!
//! ## Core Components
//!
//! - **Risk**: pure pattern classifier for proposed actions
//! - **Trust**: session budget deciding verify-now / defer / skip
//! - **Pipeline**: ordered verification layers (structural → syntax →
//!   semantic → behavioral → intent) with short-circuit on blocking failure
//! - **Batcher**: coalesces deferred low-risk checks into one judgment
//! - **LSP**: per-workspace language-server pool for diagnostics
//! - **Engine**: the intention state machine and recursion governor
//!
//! ## Example
//!
//! ```rust,ignore
//! use riva_core::{IntentionEngine, EngineConfig};
//!
//! let engine = IntentionEngine::new(proposer, sandbox)
//!     .with_config(EngineConfig::default());
//!
//! let report = engine
//!     .run("add `import json` to utils.py", vec!["utils.py imports json".into()])
//!     .await;
//! println!("{}", report.metrics.summary());
//! ```

pub mod action;
pub mod batcher;
pub mod cancel;
pub mod engine;
pub mod error;
pub mod intention;
pub mod lsp;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod proposer;
mod proptest;
pub mod risk;
pub mod sandbox;
pub mod trust;

// Re-exports for convenience
pub use action::{Action, ActionType, ActionViolation, StructuralIr};
pub use batcher::{BatchOutcome, DeferredVerification, VerificationBatcher};
pub use cancel::CancelSignal;
pub use engine::{EngineConfig, IntentionEngine, Session, SessionReport};
pub use error::{Error, Result};
pub use intention::{
    CycleRecord, Intention, IntentionId, IntentionStatus, IntentionTree,
};
pub use lsp::{
    default_servers, Diagnostic, DiagnosticSeverity, HoverInfo, LanguageServerConfig, LspClient,
    LspLocation, LspManager, LspStatus, ServerHealth,
};
pub use metrics::{ExecutionMetrics, LayerTally, LlmCallPurpose, PurposeStats};
pub use parser::{
    CodeParser, NameFinding, ParserRegistry, PythonParser, RustParser, SemanticFindings,
    SyntaxCheck,
};
pub use pipeline::{
    BehavioralLayer, FailureKind, FailureReason, IntentLayer, LayerContext, LayerKind,
    LayerResult, PipelineConfig, SemanticLayer, Stage, StructuralLayer, StructuralVerifier,
    SyntaxLayer, VerificationLayer, VerificationPipeline, VerificationReport,
    DEFAULT_BLOCKING_THRESHOLD,
};
pub use proposer::{
    ActionProposer, FailureContext, JudgeVerdict, Proposal, ProposalKind, ProposalRequest,
    ProposedAction, Purpose, SubIntention, ToolProvider,
};
pub use risk::{assess, is_boilerplate, ActionRisk, RiskLevel};
pub use sandbox::{
    AppliedChange, Checkpoint, CheckpointDecision, MetricsSink, Sandbox, SnapshotId, TestOutcome,
};
pub use trust::{Decision, TrustBudget};
