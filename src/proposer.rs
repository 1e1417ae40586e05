//! Proposer and tool-provider capability traits.
//!
//! The core never talks to an LLM transport directly. Collaborators
//! implement [`ActionProposer`] behind whatever HTTP/IPC plumbing they use;
//! the engine sees only tagged proposal variants.

use crate::action::Action;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Why the engine is calling the proposer. Reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Break an intention into sub-intentions
    Decompose,
    /// Propose the next action for an intention
    Act,
    /// Judge produced output against expectations
    Judge,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Decompose => "decompose",
            Self::Act => "act",
            Self::Judge => "judge",
        };
        write!(f, "{}", s)
    }
}

/// A sub-intention requested by a decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubIntention {
    /// Goal description
    pub what: String,
    /// Acceptance criteria, in order
    pub criteria: Vec<String>,
}

impl SubIntention {
    pub fn new(what: impl Into<String>, criteria: Vec<String>) -> Self {
        Self {
            what: what.into(),
            criteria,
        }
    }
}

/// An action proposal with the proposer's own expectations attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    /// The action to take
    pub action: Action,
    /// What the proposer expects the action to accomplish
    pub expected_outcome: String,
    /// Hint that the next action is expected to be high risk,
    /// used to flush deferred verifications pre-emptively
    #[serde(default)]
    pub expect_high_risk: bool,
}

impl ProposedAction {
    pub fn new(action: Action, expected_outcome: impl Into<String>) -> Self {
        Self {
            action,
            expected_outcome: expected_outcome.into(),
            expect_high_risk: false,
        }
    }

    pub fn with_high_risk_hint(mut self) -> Self {
        self.expect_high_risk = true;
        self
    }
}

/// Judge verdict on whether produced output satisfies expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeVerdict {
    Pass,
    Fail,
    /// The judge could not decide; treated as a low-confidence pass
    Unclear,
}

/// The tagged payload of a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProposalKind {
    /// Request to decompose into ordered sub-intentions
    Decomposition(Vec<SubIntention>),
    /// The next action to try
    Action(ProposedAction),
    /// A judgment, with free-form reasoning
    Verdict { verdict: JudgeVerdict, reason: String },
}

/// What the proposer returned, with timing for metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub kind: ProposalKind,
    /// Wall-clock time the proposer call took
    pub elapsed_ms: u64,
}

impl Proposal {
    pub fn new(kind: ProposalKind, elapsed_ms: u64) -> Self {
        Self { kind, elapsed_ms }
    }
}

/// Structured failure context handed back to the proposer on retry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Layer or subsystem that failed
    pub failed_at: String,
    /// Short reason
    pub reason: String,
    /// Structured details from the failing layer (e.g. undefined names)
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// A request for the proposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRequest {
    /// Goal of the intention being worked
    pub what: String,
    /// Acceptance criteria of the intention
    pub criteria: Vec<String>,
    /// Assembled repository/session context
    pub context: String,
    /// Why the engine is asking
    pub purpose: Purpose,
    /// Failure context from the previous cycle, when retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureContext>,
}

impl ProposalRequest {
    pub fn new(what: impl Into<String>, purpose: Purpose) -> Self {
        Self {
            what: what.into(),
            criteria: Vec::new(),
            context: String::new(),
            purpose,
            failure: None,
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_failure(mut self, failure: FailureContext) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// The LLM proposer capability.
///
/// Failures (timeouts, unparseable structured output, empty responses)
/// surface as `Err` and are classified by the engine as recoverable
/// infrastructure failures.
#[async_trait]
pub trait ActionProposer: Send + Sync {
    async fn propose(&self, request: ProposalRequest) -> Result<Proposal>;
}

/// Read-only tool capability the proposer may use during context assembly.
///
/// None of these operations apply changes.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Read a file's content by repository-relative path.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Search file contents; returns `(path, line, text)` matches.
    async fn grep(&self, pattern: &str, path_glob: Option<&str>)
        -> Result<Vec<(String, u32, String)>>;

    /// Look up a symbol definition; returns `(path, line)` locations.
    async fn symbol_lookup(&self, name: &str) -> Result<Vec<(String, u32)>>;

    /// Current repository status (branch, dirty files) as display text.
    async fn git_status(&self) -> Result<String>;
}
