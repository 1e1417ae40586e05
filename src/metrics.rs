//! Execution metrics for a RIVA session.
//!
//! Session-scoped aggregate of LLM call counts and timings, verification
//! outcomes per layer and per risk level, and retry/failure counts. The
//! engine owns the live value; external sinks receive an immutable snapshot
//! on session end.

use crate::pipeline::LayerKind;
use crate::proposer::Purpose;
use crate::risk::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What an LLM call was for, as recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmCallPurpose {
    Decomposition,
    Action,
    Verification,
    /// A retry re-prompt carrying failure context
    Reflection,
}

impl From<Purpose> for LlmCallPurpose {
    fn from(purpose: Purpose) -> Self {
        match purpose {
            Purpose::Decompose => Self::Decomposition,
            Purpose::Act => Self::Action,
            Purpose::Judge => Self::Verification,
        }
    }
}

/// Call count and cumulative milliseconds for one purpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurposeStats {
    pub calls: u32,
    pub total_ms: u64,
}

/// Pass/fail tally for one verification layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTally {
    pub passed: u32,
    pub failed: u32,
}

/// Metrics for a single RIVA execution session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,

    // LLM calls by purpose
    pub llm_decomposition: PurposeStats,
    pub llm_action: PurposeStats,
    pub llm_verification: PurposeStats,
    pub llm_reflection: PurposeStats,

    // Decomposition tracking
    pub decomposition_count: u32,
    pub max_depth_reached: u32,

    // Verification layer executions
    pub layer_tallies: HashMap<LayerKind, LayerTally>,
    /// Total layer executions; equals the sum of all tallies
    pub verifications_performed: u32,
    pub verifications_skipped: u32,

    // Verified actions by risk level
    pub verifications_high_risk: u32,
    pub verifications_medium_risk: u32,
    pub verifications_low_risk: u32,

    pub retry_count: u32,
    pub failure_count: u32,

    pub success: bool,
    pub first_try_success: bool,
}

impl ExecutionMetrics {
    /// Start metrics for a new session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            total_duration_ms: 0,
            llm_decomposition: PurposeStats::default(),
            llm_action: PurposeStats::default(),
            llm_verification: PurposeStats::default(),
            llm_reflection: PurposeStats::default(),
            decomposition_count: 0,
            max_depth_reached: 0,
            layer_tallies: HashMap::new(),
            verifications_performed: 0,
            verifications_skipped: 0,
            verifications_high_risk: 0,
            verifications_medium_risk: 0,
            verifications_low_risk: 0,
            retry_count: 0,
            failure_count: 0,
            success: false,
            first_try_success: false,
        }
    }

    /// Record an LLM call.
    pub fn record_llm_call(&mut self, purpose: LlmCallPurpose, duration_ms: u64) {
        let stats = match purpose {
            LlmCallPurpose::Decomposition => &mut self.llm_decomposition,
            LlmCallPurpose::Action => &mut self.llm_action,
            LlmCallPurpose::Verification => &mut self.llm_verification,
            LlmCallPurpose::Reflection => &mut self.llm_reflection,
        };
        stats.calls += 1;
        stats.total_ms += duration_ms;
    }

    /// Total LLM calls across purposes.
    pub fn llm_calls_total(&self) -> u32 {
        self.llm_decomposition.calls
            + self.llm_action.calls
            + self.llm_verification.calls
            + self.llm_reflection.calls
    }

    /// Record a decomposition at the given depth.
    pub fn record_decomposition(&mut self, depth: u32) {
        self.decomposition_count += 1;
        self.max_depth_reached = self.max_depth_reached.max(depth);
    }

    /// Record one executed verification layer.
    pub fn record_layer(&mut self, layer: LayerKind, passed: bool) {
        let tally = self.layer_tallies.entry(layer).or_default();
        if passed {
            tally.passed += 1;
        } else {
            tally.failed += 1;
        }
        self.verifications_performed += 1;
    }

    /// Record a verified action at its risk level.
    pub fn record_verification(&mut self, level: RiskLevel) {
        match level {
            RiskLevel::High => self.verifications_high_risk += 1,
            RiskLevel::Medium => self.verifications_medium_risk += 1,
            RiskLevel::Low => self.verifications_low_risk += 1,
        }
    }

    /// Record a skipped (or deferred) verification.
    pub fn record_skip(&mut self) {
        self.verifications_skipped += 1;
    }

    /// Record a retry attempt.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Record a failure.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    /// Mark the session complete and derive summary flags.
    pub fn complete(&mut self, success: bool) {
        let now = Utc::now();
        self.total_duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
        self.success = success;
        self.first_try_success = success && self.retry_count == 0;
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        format!(
            "session {}: {} ({} llm calls, {} verified layers, {} skipped, {} retries, {} failures)",
            self.session_id,
            if self.success { "success" } else { "failed" },
            self.llm_calls_total(),
            self.verifications_performed,
            self.verifications_skipped,
            self.retry_count,
            self.failure_count,
        )
    }
}
