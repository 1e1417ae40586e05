//! Session-scoped trust budget.
//!
//! The trust budget decides whether a proposed action must be verified
//! inline, may be deferred into the batcher, or may be skipped outright.
//! Trust is spent by skipping, depleted by missed failures, and replenished
//! by verified successes, so a session that keeps skipping decays toward
//! mandatory verification.

use crate::risk::{ActionRisk, RiskLevel};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default starting trust.
pub const DEFAULT_INITIAL_TRUST: u32 = 100;
/// Default trust floor; at the floor every action verifies.
pub const DEFAULT_TRUST_FLOOR: u32 = 20;
/// Default trust spent per skipped verification.
pub const DEFAULT_SKIP_COST: u32 = 2;
/// Default replenishment for a verified success.
pub const DEFAULT_REPLENISH: u32 = 10;
/// Default depletion for a missed failure.
pub const DEFAULT_DEPLETE: u32 = 20;
/// Replenishment for a caught failure (verification earned its keep).
pub const CAUGHT_FAILURE_REPLENISH: u32 = 5;

/// Verification decision for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run the pipeline before applying
    VerifyNow,
    /// Apply now, verify later in a batch
    Defer,
    /// Apply without any verification record
    Skip,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::VerifyNow => "verify_now",
            Self::Defer => "defer",
            Self::Skip => "skip",
        };
        write!(f, "{}", s)
    }
}

/// Session trust counter and verification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustBudget {
    /// Starting (and maximum) trust
    pub initial: u32,
    /// Current trust, always within `[floor, initial]`
    pub remaining: u32,
    /// Lower bound; at the floor everything verifies
    pub floor: u32,
    /// Trust spent per skipped verification
    pub skip_cost: u32,
    /// Whether Skip decisions become Defer for batchable risks
    pub batching_enabled: bool,
    /// Count of VerifyNow decisions handed out
    pub verifications_performed: u32,
    /// Count of Skip/Defer decisions handed out
    pub verifications_skipped: u32,
    /// Failures caught by a verification that ran
    pub failures_caught: u32,
    /// Failures that slipped past a skipped verification
    pub failures_missed: u32,
}

impl Default for TrustBudget {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_TRUST, DEFAULT_TRUST_FLOOR)
    }
}

impl TrustBudget {
    /// Create a budget with the given initial trust and floor.
    pub fn new(initial: u32, floor: u32) -> Self {
        let floor = floor.min(initial);
        Self {
            initial,
            remaining: initial,
            floor,
            skip_cost: DEFAULT_SKIP_COST,
            batching_enabled: false,
            verifications_performed: 0,
            verifications_skipped: 0,
            failures_caught: 0,
            failures_missed: 0,
        }
    }

    /// Set the per-skip trust cost.
    pub fn with_skip_cost(mut self, cost: u32) -> Self {
        self.skip_cost = cost;
        self
    }

    /// Enable Defer decisions (a batcher is attached downstream).
    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching_enabled = enabled;
        self
    }

    /// Current trust as a fraction of initial.
    pub fn trust_level(&self) -> f64 {
        if self.initial == 0 {
            return 0.0;
        }
        self.remaining as f64 / self.initial as f64
    }

    /// High-trust mode: remaining at or above 80% of the default scale.
    pub fn is_high_trust(&self) -> bool {
        self.remaining >= 80
    }

    /// Low-trust mode: remaining at or below 50.
    pub fn is_low_trust(&self) -> bool {
        self.remaining <= 50
    }

    /// Whether trust has bottomed out.
    pub fn at_floor(&self) -> bool {
        self.remaining <= self.floor
    }

    /// Decide how a risk should be verified, recording the decision.
    ///
    /// High risk always verifies. Medium risk may skip only above 85
    /// trust; low risk may skip above 70. At the floor everything
    /// verifies. Skipping spends a little trust so streaks decay.
    pub fn decide(&mut self, risk: &ActionRisk) -> Decision {
        let can_skip = match risk.level {
            RiskLevel::High => false,
            RiskLevel::Medium => self.remaining > 85,
            RiskLevel::Low => self.remaining > 70,
        };

        if !can_skip || self.at_floor() {
            self.verifications_performed += 1;
            return Decision::VerifyNow;
        }

        self.verifications_skipped += 1;
        self.spend(self.skip_cost);

        if risk.can_batch && self.batching_enabled {
            Decision::Defer
        } else {
            Decision::Skip
        }
    }

    /// Replenish trust after a verified success. Caps at `initial`.
    pub fn replenish(&mut self, amount: u32) {
        self.remaining = (self.remaining + amount).min(self.initial);
    }

    /// Deplete trust after a missed failure. Floors at `floor`.
    pub fn deplete(&mut self, amount: u32) {
        self.failures_missed += 1;
        self.spend(amount);
        debug!(
            remaining = self.remaining,
            missed = self.failures_missed,
            "trust depleted after missed failure"
        );
    }

    /// Record a failure that a verification caught.
    ///
    /// The verification earned its keep, so trust recovers slightly.
    pub fn record_failure_caught(&mut self) {
        self.failures_caught += 1;
        self.replenish(CAUGHT_FAILURE_REPLENISH);
    }

    /// Lower `remaining` without counting a missed failure.
    fn spend(&mut self, amount: u32) {
        self.remaining = self.remaining.saturating_sub(amount).max(self.floor);
    }

    /// One-line summary of the budget state.
    pub fn summary(&self) -> String {
        format!(
            "trust {}/{} (verified={} skipped={} caught={} missed={})",
            self.remaining,
            self.initial,
            self.verifications_performed,
            self.verifications_skipped,
            self.failures_caught,
            self.failures_missed,
        )
    }
}
