//! Intention tree and per-cycle execution traces.
//!
//! Intentions form a recursion tree owned exclusively by the engine. Nodes
//! live in an arena keyed by stable ids; child references are id-valued and
//! traces are append-only, so there is no shared mutability anywhere in the
//! tree.

use crate::action::Action;
use crate::pipeline::{FailureReason, VerificationReport};
use crate::risk::ActionRisk;
use crate::trust::Decision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Stable identifier of an intention within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentionId(pub u32);

impl std::fmt::Display for IntentionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "intention-{}", self.0)
    }
}

/// Lifecycle status of an intention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentionStatus {
    /// Created, not yet worked
    Pending,
    /// Currently being cycled
    Active,
    /// Split into children; outcome follows theirs
    Decomposed,
    /// Terminal pass
    Verified,
    /// Terminal fail
    Failed,
    /// Terminal: cancelled externally
    Abandoned,
}

impl IntentionStatus {
    /// Whether this status is terminal. Terminal statuses never change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::Abandoned)
    }
}

impl std::fmt::Display for IntentionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Decomposed => "decomposed",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Record of one RIVA cycle against an intention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// 1-based cycle number within the intention
    pub cycle: u32,
    /// The proposed action, when the cycle got that far
    pub action: Option<Action>,
    /// Risk classification of the action
    pub risk: Option<ActionRisk>,
    /// Trust decision for the action
    pub decision: Option<Decision>,
    /// Full verification report, when the pipeline ran
    pub report: Option<VerificationReport>,
    /// Short outcome note (e.g. "verified", "retry: semantic")
    pub outcome: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl CycleRecord {
    pub fn new(cycle: u32, outcome: impl Into<String>) -> Self {
        Self {
            cycle,
            action: None,
            risk: None,
            decision: None,
            report: None,
            outcome: outcome.into(),
            duration_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_risk(mut self, risk: ActionRisk) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_report(mut self, report: VerificationReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// A node in the intention recursion tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intention {
    pub id: IntentionId,
    /// Goal description
    pub what: String,
    /// Ordered acceptance criteria
    pub criteria: Vec<String>,
    pub status: IntentionStatus,
    /// 0 for the root
    pub depth: u32,
    pub parent: Option<IntentionId>,
    /// Ordered child ids
    pub children: Vec<IntentionId>,
    pub created_at: DateTime<Utc>,
    /// Append-only record of cycles run against this intention
    pub trace: Vec<CycleRecord>,
    /// Terminal failure reason, for reporting
    pub failure: Option<FailureReason>,
    /// Cycles consumed so far
    pub cycles_used: u32,
}

impl Intention {
    fn new(
        id: IntentionId,
        what: impl Into<String>,
        criteria: Vec<String>,
        depth: u32,
        parent: Option<IntentionId>,
    ) -> Self {
        Self {
            id,
            what: what.into(),
            criteria,
            status: IntentionStatus::Pending,
            depth,
            parent,
            children: Vec::new(),
            created_at: Utc::now(),
            trace: Vec::new(),
            failure: None,
            cycles_used: 0,
        }
    }

    /// Whether every acceptance criterion list entry is blank.
    pub fn has_criteria(&self) -> bool {
        self.criteria.iter().any(|c| !c.trim().is_empty())
    }
}

/// Arena-allocated intention tree. Mutated only by the owning engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentionTree {
    nodes: Vec<Intention>,
}

impl IntentionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root intention.
    pub fn create_root(&mut self, what: impl Into<String>, criteria: Vec<String>) -> IntentionId {
        debug_assert!(self.nodes.is_empty(), "tree already has a root");
        let id = IntentionId(self.nodes.len() as u32);
        self.nodes.push(Intention::new(id, what, criteria, 0, None));
        id
    }

    /// Create a child of `parent` in order.
    pub fn add_child(
        &mut self,
        parent: IntentionId,
        what: impl Into<String>,
        criteria: Vec<String>,
    ) -> IntentionId {
        let depth = self.get(parent).map(|p| p.depth + 1).unwrap_or(0);
        let id = IntentionId(self.nodes.len() as u32);
        self.nodes
            .push(Intention::new(id, what, criteria, depth, Some(parent)));
        if let Some(parent_node) = self.get_mut(parent) {
            parent_node.children.push(id);
        }
        id
    }

    pub fn get(&self, id: IntentionId) -> Option<&Intention> {
        self.nodes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: IntentionId) -> Option<&mut Intention> {
        self.nodes.get_mut(id.0 as usize)
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Intention> {
        self.nodes.iter()
    }

    /// Transition an intention's status.
    ///
    /// A terminal status never changes; an attempt to move out of one is
    /// ignored and logged. Returns whether the transition was applied.
    pub fn set_status(&mut self, id: IntentionId, status: IntentionStatus) -> bool {
        let Some(node) = self.get_mut(id) else {
            return false;
        };
        if node.status.is_terminal() {
            if node.status != status {
                warn!(
                    intention = %id,
                    from = %node.status,
                    to = %status,
                    "ignored transition out of terminal status"
                );
            }
            return false;
        }
        node.status = status;
        true
    }

    /// Record a terminal failure with its reason.
    pub fn fail(&mut self, id: IntentionId, reason: FailureReason) {
        if self.set_status(id, IntentionStatus::Failed) {
            if let Some(node) = self.get_mut(id) {
                node.failure = Some(reason);
            }
        }
    }

    /// Append a cycle record to an intention's trace.
    pub fn record_cycle(&mut self, id: IntentionId, record: CycleRecord) {
        if let Some(node) = self.get_mut(id) {
            node.cycles_used = node.cycles_used.max(record.cycle);
            node.trace.push(record);
        }
    }

    /// Ids of `id` and all its ancestors, nearest first.
    pub fn ancestors_inclusive(&self, id: IntentionId) -> Vec<IntentionId> {
        let mut out = Vec::new();
        let mut current = Some(id);
        while let Some(cursor) = current {
            out.push(cursor);
            current = self.get(cursor).and_then(|n| n.parent);
        }
        out
    }

    /// Abandon `id` and every non-terminal ancestor (external cancellation).
    pub fn abandon_upwards(&mut self, id: IntentionId) {
        for node_id in self.ancestors_inclusive(id) {
            self.set_status(node_id, IntentionStatus::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FailureKind, FailureReason};

    #[test]
    fn test_root_and_children_ordering() {
        let mut tree = IntentionTree::new();
        let root = tree.create_root("refactor module X", vec!["compiles".into()]);
        let a = tree.add_child(root, "extract helper", vec!["helper exists".into()]);
        let b = tree.add_child(root, "update callers", vec!["callers updated".into()]);

        let root_node = tree.get(root).unwrap();
        assert_eq!(root_node.children, vec![a, b]);
        assert_eq!(tree.get(a).unwrap().depth, 1);
        assert_eq!(tree.get(b).unwrap().parent, Some(root));
    }

    #[test]
    fn test_terminal_status_never_changes() {
        let mut tree = IntentionTree::new();
        let root = tree.create_root("goal", vec!["done".into()]);

        assert!(tree.set_status(root, IntentionStatus::Active));
        assert!(tree.set_status(root, IntentionStatus::Verified));
        assert!(!tree.set_status(root, IntentionStatus::Failed));
        assert_eq!(tree.get(root).unwrap().status, IntentionStatus::Verified);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut tree = IntentionTree::new();
        let root = tree.create_root("goal", vec![]);
        tree.set_status(root, IntentionStatus::Active);
        tree.fail(
            root,
            FailureReason::new(FailureKind::Budget, "cycles exhausted"),
        );

        let node = tree.get(root).unwrap();
        assert_eq!(node.status, IntentionStatus::Failed);
        assert_eq!(node.failure.as_ref().unwrap().kind, FailureKind::Budget);
    }

    #[test]
    fn test_trace_is_append_only() {
        let mut tree = IntentionTree::new();
        let root = tree.create_root("goal", vec!["done".into()]);
        tree.record_cycle(root, CycleRecord::new(1, "retry: syntax"));
        tree.record_cycle(root, CycleRecord::new(2, "verified"));

        let node = tree.get(root).unwrap();
        assert_eq!(node.trace.len(), 2);
        assert_eq!(node.cycles_used, 2);
        assert_eq!(node.trace[0].outcome, "retry: syntax");
    }

    #[test]
    fn test_abandon_cascades_to_ancestors() {
        let mut tree = IntentionTree::new();
        let root = tree.create_root("goal", vec![]);
        let child = tree.add_child(root, "sub", vec!["ok".into()]);
        let grandchild = tree.add_child(child, "leaf", vec!["ok".into()]);
        tree.set_status(root, IntentionStatus::Decomposed);
        tree.set_status(child, IntentionStatus::Decomposed);
        tree.set_status(grandchild, IntentionStatus::Active);

        tree.abandon_upwards(grandchild);

        assert_eq!(
            tree.get(grandchild).unwrap().status,
            IntentionStatus::Abandoned
        );
        assert_eq!(tree.get(child).unwrap().status, IntentionStatus::Abandoned);
        assert_eq!(tree.get(root).unwrap().status, IntentionStatus::Abandoned);
    }

    #[test]
    fn test_verified_children_not_abandoned() {
        let mut tree = IntentionTree::new();
        let root = tree.create_root("goal", vec![]);
        let done = tree.add_child(root, "done child", vec!["ok".into()]);
        tree.set_status(root, IntentionStatus::Decomposed);
        tree.set_status(done, IntentionStatus::Active);
        tree.set_status(done, IntentionStatus::Verified);

        tree.abandon_upwards(root);

        // The verified sibling keeps its terminal status.
        assert_eq!(tree.get(done).unwrap().status, IntentionStatus::Verified);
        assert_eq!(tree.get(root).unwrap().status, IntentionStatus::Abandoned);
    }

    #[test]
    fn test_has_criteria() {
        let mut tree = IntentionTree::new();
        let empty = tree.create_root("goal", vec!["  ".into()]);
        assert!(!tree.get(empty).unwrap().has_criteria());
    }
}
