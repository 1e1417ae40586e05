//! Error types for riva-core.

use thiserror::Error;

/// Result type alias using riva-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during RIVA operations.
///
/// These are infrastructure-level errors. Verification verdicts and cycle
/// outcomes are modelled as explicit result values in the pipeline and
/// engine modules, never as `Err`.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation exceeded its time budget
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Proposer (LLM adapter) failure
    #[error("Proposer error during {purpose}: {message}")]
    Proposer { purpose: String, message: String },

    /// Sandbox capability failure
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Language-server subprocess communication error
    #[error("LSP communication error: {0}")]
    LspComm(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Recursion depth exceeded
    #[error("Maximum recursion depth {max_depth} exceeded")]
    MaxDepthExceeded { max_depth: u32 },

    /// Per-intention cycle budget exceeded
    #[error("Maximum cycles per intention {max_cycles} exceeded")]
    CyclesExhausted { max_cycles: u32 },

    /// Session cancelled by external signal
    #[error("Session cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a proposer error.
    pub fn proposer(purpose: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Proposer {
            purpose: purpose.into(),
            message: message.into(),
        }
    }

    /// Create a sandbox error.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    /// Create an LSP communication error.
    pub fn lsp_comm(message: impl Into<String>) -> Self {
        Self::LspComm(message.into())
    }

    /// Create a max depth exceeded error.
    pub fn max_depth_exceeded(max_depth: u32) -> Self {
        Self::MaxDepthExceeded { max_depth }
    }

    /// Create a cycles exhausted error.
    pub fn cycles_exhausted(max_cycles: u32) -> Self {
        Self::CyclesExhausted { max_cycles }
    }
}
