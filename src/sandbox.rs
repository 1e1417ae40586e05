//! Sandbox, checkpoint, and metrics-sink capability traits.
//!
//! The core consumes these capabilities; collaborators own the filesystem
//! lock, the commit graph, the confirmation UX, and metrics storage.
//! Sandbox failures surface as values ([`AppliedChange::error`],
//! [`TestOutcome`]) or as [`crate::error::Error::Sandbox`] for
//! infrastructure breakage, never as panics across the engine boundary.

use crate::action::Action;
use crate::error::Result;
use crate::metrics::ExecutionMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of applying an action inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Whether the sandbox accepted and applied the change
    pub success: bool,
    /// Unified diff of the change, when applicable
    pub diff: String,
    /// Rejection or failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppliedChange {
    /// An accepted change with its diff.
    pub fn applied(diff: impl Into<String>) -> Self {
        Self {
            success: true,
            diff: diff.into(),
            error: None,
        }
    }

    /// A rejected change.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            diff: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Identifier of a sandbox snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Outcome of a test run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Number of passing tests
    pub passed: u32,
    /// Number of failing tests
    pub failed: u32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl TestOutcome {
    /// Whether the run is green.
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }
}

/// Sandboxed checkout the engine owns for the session's duration.
///
/// Each `apply` is all-or-nothing per action.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Read a file by repository-relative path.
    async fn read(&self, path: &str) -> Result<String>;

    /// Apply an action. A rejected change is `Ok` with `success = false`;
    /// `Err` means the sandbox itself is unreachable.
    async fn apply(&self, action: &Action) -> Result<AppliedChange>;

    /// Snapshot the current state at an intention boundary.
    async fn snapshot(&self) -> Result<SnapshotId>;

    /// Restore a previously taken snapshot.
    async fn restore(&self, id: &SnapshotId) -> Result<()>;

    /// Run the test subset covering `paths` within `timeout`.
    async fn run_tests(&self, paths: &[String], timeout: Duration) -> Result<TestOutcome>;
}

/// Decision returned by the human-confirmation boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointDecision {
    Approve,
    Reject,
    /// Approve a modified replacement action instead
    Modify(Action),
}

/// Confirmation boundary consulted before high-risk actions.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn ask(&self, action: &Action, reason: &str) -> Result<CheckpointDecision>;
}

/// Write-only receiver of session-end metrics snapshots.
pub trait MetricsSink: Send + Sync {
    fn record(&self, snapshot: &ExecutionMetrics);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applied_change_constructors() {
        let ok = AppliedChange::applied("+import json");
        assert!(ok.success);
        assert!(ok.error.is_none());

        let rejected = AppliedChange::rejected("path escapes sandbox");
        assert!(!rejected.success);
        assert_eq!(rejected.error.as_deref(), Some("path escapes sandbox"));
    }

    #[test]
    fn test_test_outcome_green() {
        let outcome = TestOutcome {
            passed: 3,
            failed: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 120,
        };
        assert!(outcome.is_green());
    }
}
