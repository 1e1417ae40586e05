//! Property-based tests for core invariants using proptest.
//!
//! These cover the quantified guarantees of the data model:
//!
//! - Risk assessment is total, deterministic, and idempotent
//! - High risk always verifies, at any trust level
//! - Trust stays within `[floor, initial]` under any operation sequence
//! - Pipeline reports name the first blocking layer
//! - Empty batch flushes pass and are idempotent

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::action::{Action, ActionType};
    use crate::risk::{assess, ActionRisk, RiskLevel};
    use crate::trust::{Decision, TrustBudget};

    // Strategy for arbitrary action types.
    fn action_type() -> impl Strategy<Value = ActionType> {
        prop_oneof![
            Just(ActionType::Create),
            Just(ActionType::Edit),
            Just(ActionType::Delete),
            Just(ActionType::Command),
            Just(ActionType::Query),
        ]
    }

    // Strategy for action content mixing benign and loaded payloads.
    fn content() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z _=()0-9\\n]{0,80}",
            Just("rm -rf /tmp/x".to_string()),
            Just("import os".to_string()),
            Just("password = input()".to_string()),
            Just("ls -la".to_string()),
            Just(String::new()),
        ]
    }

    fn arbitrary_action() -> impl Strategy<Value = Action> {
        (action_type(), content()).prop_map(|(action_type, content)| {
            Action::new(action_type, content).with_target("file.py")
        })
    }

    // Trust operations for sequence testing.
    #[derive(Debug, Clone)]
    enum TrustOp {
        Replenish(u32),
        Deplete(u32),
        Caught,
        Decide(RiskLevel),
    }

    fn trust_op() -> impl Strategy<Value = TrustOp> {
        prop_oneof![
            (0u32..50).prop_map(TrustOp::Replenish),
            (0u32..50).prop_map(TrustOp::Deplete),
            Just(TrustOp::Caught),
            prop_oneof![
                Just(RiskLevel::Low),
                Just(RiskLevel::Medium),
                Just(RiskLevel::High)
            ]
            .prop_map(TrustOp::Decide),
        ]
    }

    fn risk_at(level: RiskLevel) -> ActionRisk {
        ActionRisk {
            level,
            factors: vec!["prop_factor".to_string()],
            requires_verification: level != RiskLevel::Low,
            can_batch: level != RiskLevel::High,
        }
    }

    proptest! {
        /// `assess` never panics and always yields at least one factor,
        /// with flags consistent with the level.
        #[test]
        fn assess_is_total(action in arbitrary_action()) {
            let risk = assess(&action);
            prop_assert!(!risk.factors.is_empty());
            prop_assert_eq!(risk.can_batch, risk.level != RiskLevel::High);
            if risk.level != RiskLevel::Low {
                prop_assert!(risk.requires_verification);
            }
        }

        /// Assessing twice yields the same classification.
        #[test]
        fn assess_is_idempotent(action in arbitrary_action()) {
            prop_assert_eq!(assess(&action), assess(&action));
        }

        /// High risk verifies at every trust level.
        #[test]
        fn high_risk_always_verifies(remaining in 20u32..=100) {
            let mut budget = TrustBudget::default();
            budget.remaining = remaining;
            prop_assert_eq!(
                budget.decide(&risk_at(RiskLevel::High)),
                Decision::VerifyNow
            );
        }

        /// Trust stays within [floor, initial] under any op sequence.
        #[test]
        fn trust_stays_in_bounds(ops in prop::collection::vec(trust_op(), 0..40)) {
            let mut budget = TrustBudget::default().with_batching(true);
            for op in ops {
                match op {
                    TrustOp::Replenish(amount) => budget.replenish(amount),
                    TrustOp::Deplete(amount) => budget.deplete(amount),
                    TrustOp::Caught => budget.record_failure_caught(),
                    TrustOp::Decide(level) => {
                        let _ = budget.decide(&risk_at(level));
                    }
                }
                prop_assert!(budget.remaining >= budget.floor);
                prop_assert!(budget.remaining <= budget.initial);
            }
        }

        /// Counters only ever grow.
        #[test]
        fn trust_counters_are_monotone(ops in prop::collection::vec(trust_op(), 0..40)) {
            let mut budget = TrustBudget::default().with_batching(true);
            let mut last = (0u32, 0u32, 0u32, 0u32);
            for op in ops {
                match op {
                    TrustOp::Replenish(amount) => budget.replenish(amount),
                    TrustOp::Deplete(amount) => budget.deplete(amount),
                    TrustOp::Caught => budget.record_failure_caught(),
                    TrustOp::Decide(level) => {
                        let _ = budget.decide(&risk_at(level));
                    }
                }
                let now = (
                    budget.verifications_performed,
                    budget.verifications_skipped,
                    budget.failures_caught,
                    budget.failures_missed,
                );
                prop_assert!(now.0 >= last.0);
                prop_assert!(now.1 >= last.1);
                prop_assert!(now.2 >= last.2);
                prop_assert!(now.3 >= last.3);
                last = now;
            }
        }
    }

    #[test]
    fn empty_flush_is_idempotent() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut batcher = crate::batcher::VerificationBatcher::new();
            let first = batcher.flush().await;
            let second = batcher.flush().await;
            assert!(first.overall_pass);
            assert_eq!(first, second);
        });
    }
}
