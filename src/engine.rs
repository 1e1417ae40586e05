//! Intention engine: the RIVA state machine.
//!
//! Drives one Recognize→Intend→Verify→Act cycle at a time against an
//! intention tree, invoking risk assessment, the trust budget, the
//! verification pipeline, and the batcher. Recursion descends but never
//! fans out, so the engine is single-threaded over its session state and
//! termination is guaranteed by the depth and cycle bounds.

use crate::action::Action;
use crate::batcher::{BatchOutcome, VerificationBatcher};
use crate::cancel::CancelSignal;
use crate::error::Error;
use crate::intention::{CycleRecord, IntentionId, IntentionStatus, IntentionTree};
use crate::lsp::LspManager;
use crate::metrics::{ExecutionMetrics, LlmCallPurpose};
use crate::parser::ParserRegistry;
use crate::pipeline::{
    FailureKind, FailureReason, LayerContext, PipelineConfig, Stage, StructuralVerifier,
    VerificationPipeline, VerificationReport,
};
use crate::proposer::{
    ActionProposer, FailureContext, ProposalKind, ProposalRequest, ProposedAction, Purpose,
    SubIntention,
};
use crate::risk::{assess, RiskLevel};
use crate::sandbox::{AppliedChange, Checkpoint, CheckpointDecision, MetricsSink, Sandbox};
use crate::trust::{Decision, TrustBudget};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Hard limits and knobs injected at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum recursion depth of the intention tree
    pub max_depth: u32,
    /// Maximum RIVA cycles per intention
    pub max_cycles_per_intention: u32,
    /// Confidence above which a failing layer halts the pipeline
    pub blocking_threshold: f64,
    /// Starting trust for the session budget
    pub initial_trust: u32,
    /// Trust floor; at the floor every action verifies
    pub floor_trust: u32,
    /// Trust spent per skipped verification
    pub skip_cost: u32,
    /// Upper bound on one proposer call
    pub proposal_timeout: Duration,
    /// Upper bound on one behavioral test run
    pub test_timeout: Duration,
    /// Whether behavioral/intent layers run for Query actions
    pub verify_queries: bool,
    /// Whether high-risk actions stop at the confirmation boundary.
    /// Only consulted when a checkpoint is attached.
    pub require_approval_high_risk: bool,
    /// Infrastructure failures tolerated per intention before failing
    pub infrastructure_retry_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_cycles_per_intention: 5,
            blocking_threshold: crate::pipeline::DEFAULT_BLOCKING_THRESHOLD,
            initial_trust: crate::trust::DEFAULT_INITIAL_TRUST,
            floor_trust: crate::trust::DEFAULT_TRUST_FLOOR,
            skip_cost: crate::trust::DEFAULT_SKIP_COST,
            proposal_timeout: Duration::from_secs(60),
            test_timeout: Duration::from_secs(120),
            verify_queries: false,
            require_approval_high_risk: true,
            infrastructure_retry_cap: 2,
        }
    }
}

/// Mutable per-run state, threaded explicitly through the engine.
pub struct Session {
    pub id: String,
    pub tree: IntentionTree,
    pub trust: TrustBudget,
    pub batcher: VerificationBatcher,
    pub metrics: ExecutionMetrics,
    pub cancel: CancelSignal,
}

/// Terminal summary of a session, shaped for user-visible reporting.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    /// Terminal status of the root intention
    pub status: IntentionStatus,
    /// Goal text of the root intention
    pub goal: String,
    /// The acceptance criterion that remained unmet, when identifiable
    pub unmet_criterion: Option<String>,
    /// Kind of the terminal failure, when the session failed
    pub failure_kind: Option<FailureKind>,
    /// The failing layer, when the failure came from the pipeline
    pub failing_layer: Option<crate::pipeline::LayerKind>,
    /// Short failure reason
    pub failure_reason: Option<String>,
    pub verifications_performed: u32,
    pub verifications_skipped: u32,
    pub failures_caught: u32,
    pub failures_missed: u32,
    /// Full metrics snapshot, as handed to the sink
    pub metrics: ExecutionMetrics,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        self.status == IntentionStatus::Verified
    }
}

enum CycleOutcome {
    Verified,
    Retry(FailureContext),
    Fatal(FailureReason),
    Abandoned,
}

enum DecompositionOutcome {
    Settled,
    Retry(FailureContext),
}

/// The top-level RIVA engine.
pub struct IntentionEngine {
    config: EngineConfig,
    proposer: Arc<dyn ActionProposer>,
    sandbox: Arc<dyn Sandbox>,
    pipeline: VerificationPipeline,
    parsers: Arc<ParserRegistry>,
    lsp: Option<Arc<LspManager>>,
    checkpoint: Option<Arc<dyn Checkpoint>>,
    sink: Option<Arc<dyn MetricsSink>>,
    known_modules: HashSet<String>,
    cancel: CancelSignal,
}

impl IntentionEngine {
    pub fn new(proposer: Arc<dyn ActionProposer>, sandbox: Arc<dyn Sandbox>) -> Self {
        let config = EngineConfig::default();
        let pipeline = VerificationPipeline::with_threshold(config.blocking_threshold);
        Self {
            config,
            proposer,
            sandbox,
            pipeline,
            parsers: Arc::new(ParserRegistry::with_defaults()),
            lsp: None,
            checkpoint: None,
            sink: None,
            known_modules: HashSet::new(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.pipeline = VerificationPipeline::with_threshold(config.blocking_threshold);
        self.config = config;
        self
    }

    pub fn with_lsp(mut self, lsp: Arc<LspManager>) -> Self {
        self.lsp = Some(lsp);
        self
    }

    /// Attach the confirmation boundary. It is consulted for high-risk
    /// actions only while `require_approval_high_risk` is set.
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_known_modules(mut self, modules: HashSet<String>) -> Self {
        self.known_modules = modules;
        self
    }

    pub fn with_structural_verifier(mut self, verifier: Arc<dyn StructuralVerifier>) -> Self {
        self.pipeline = std::mem::replace(&mut self.pipeline, VerificationPipeline::new())
            .with_structural_verifier(verifier);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// The session's cancel signal; clone it to cancel from outside.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Drive a root intention to a terminal status and report.
    pub async fn run(&self, goal: impl Into<String>, criteria: Vec<String>) -> SessionReport {
        let mut session = self.new_session();
        let goal = goal.into();
        let root = session.tree.create_root(goal.clone(), criteria);
        info!(session = %session.id, goal = %goal, "starting RIVA session");

        self.execute_intention(&mut session, root).await;

        // Session end: settle anything still deferred, best-effort.
        if session.batcher.has_pending() {
            let _ = self.flush_batcher(&mut session).await;
        }

        // A root left non-terminal can only mean cancellation raced a
        // transition; make the terminal state explicit.
        let root_status = session.tree.get(root).map(|n| n.status);
        if root_status.map_or(false, |s| !s.is_terminal()) {
            session.tree.set_status(root, IntentionStatus::Abandoned);
        }

        let succeeded = session.tree.get(root).map(|n| n.status) == Some(IntentionStatus::Verified);
        session.metrics.complete(succeeded);

        if let Some(sink) = &self.sink {
            sink.record(&session.metrics);
        }
        if let Some(lsp) = &self.lsp {
            lsp.shutdown_all();
        }

        info!(session = %session.id, "{}", session.metrics.summary());
        self.report(&session, root)
    }

    fn new_session(&self) -> Session {
        let id = format!("exec-{}", uuid::Uuid::new_v4());
        Session {
            trust: TrustBudget::new(self.config.initial_trust, self.config.floor_trust)
                .with_skip_cost(self.config.skip_cost)
                .with_batching(true),
            batcher: VerificationBatcher::with_judge(Arc::clone(&self.proposer)),
            metrics: ExecutionMetrics::new(id.clone()),
            tree: IntentionTree::new(),
            cancel: self.cancel.clone(),
            id,
        }
    }

    fn report(&self, session: &Session, root: IntentionId) -> SessionReport {
        let node = session.tree.get(root).expect("root exists");
        let failure = node.failure.clone();
        let unmet_criterion = failure
            .as_ref()
            .and_then(|f| f.details.get("criteria"))
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(String::from);

        SessionReport {
            session_id: session.id.clone(),
            status: node.status,
            goal: node.what.clone(),
            unmet_criterion,
            failure_kind: failure.as_ref().map(|f| f.kind),
            failing_layer: failure.as_ref().and_then(|f| f.layer),
            failure_reason: failure.as_ref().map(|f| f.reason.clone()),
            verifications_performed: session.trust.verifications_performed,
            verifications_skipped: session.trust.verifications_skipped,
            failures_caught: session.trust.failures_caught,
            failures_missed: session.trust.failures_missed,
            metrics: session.metrics.clone(),
        }
    }

    /// Recursive driver for one intention. Boxed for recursion.
    fn execute_intention<'a>(
        &'a self,
        session: &'a mut Session,
        id: IntentionId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if session.cancel.is_cancelled() {
                self.abandon(session, id).await;
                return;
            }

            session.tree.set_status(id, IntentionStatus::Active);
            let max_cycles = self.config.max_cycles_per_intention;

            let mut failure_ctx: Option<FailureContext> = None;
            let mut last_failure_sig: Option<String> = None;
            let mut infrastructure_failures = 0u32;

            for cycle_no in 1..=max_cycles {
                if session.cancel.is_cancelled() {
                    self.abandon(session, id).await;
                    return;
                }

                let cycle_started = Instant::now();
                let (what, criteria) = {
                    let node = session.tree.get(id).expect("intention exists");
                    (node.what.clone(), node.criteria.clone())
                };

                let retrying = failure_ctx.is_some();
                let mut request =
                    ProposalRequest::new(what, Purpose::Act).with_criteria(criteria);
                if let Some(ctx) = failure_ctx.take() {
                    request = request.with_failure(ctx);
                }

                let proposal = match tokio::time::timeout(
                    self.config.proposal_timeout,
                    self.proposer.propose(request),
                )
                .await
                {
                    Ok(Ok(proposal)) => proposal,
                    Ok(Err(e)) => {
                        warn!(intention = %id, error = %e, "proposer failed");
                        infrastructure_failures += 1;
                        if infrastructure_failures > self.config.infrastructure_retry_cap {
                            self.fail_intention(
                                session,
                                id,
                                FailureReason::new(
                                    FailureKind::Infrastructure,
                                    format!("proposer failed repeatedly: {e}"),
                                ),
                            )
                            .await;
                            return;
                        }
                        failure_ctx = Some(FailureContext {
                            failed_at: "infrastructure".into(),
                            reason: e.to_string(),
                            details: Default::default(),
                        });
                        session.metrics.record_retry();
                        continue;
                    }
                    Err(_) => {
                        warn!(intention = %id, "proposer timed out");
                        infrastructure_failures += 1;
                        if infrastructure_failures > self.config.infrastructure_retry_cap {
                            self.fail_intention(
                                session,
                                id,
                                FailureReason::new(FailureKind::Infrastructure, "timeout")
                                    .with_detail(
                                        "timeout_ms",
                                        self.config.proposal_timeout.as_millis() as u64,
                                    ),
                            )
                            .await;
                            return;
                        }
                        failure_ctx = Some(FailureContext {
                            failed_at: "infrastructure".into(),
                            reason: "timeout".into(),
                            details: Default::default(),
                        });
                        session.metrics.record_retry();
                        continue;
                    }
                };

                let purpose = match (&proposal.kind, retrying) {
                    (ProposalKind::Decomposition(_), _) => LlmCallPurpose::Decomposition,
                    (_, true) => LlmCallPurpose::Reflection,
                    (_, false) => LlmCallPurpose::Action,
                };
                session.metrics.record_llm_call(purpose, proposal.elapsed_ms);

                let outcome = match proposal.kind {
                    ProposalKind::Decomposition(subs) => {
                        match self.handle_decomposition(session, id, subs).await {
                            DecompositionOutcome::Settled => return,
                            DecompositionOutcome::Retry(ctx) => CycleOutcome::Retry(ctx),
                        }
                    }
                    ProposalKind::Action(proposed) => {
                        self.run_action_cycle(session, id, cycle_no, proposed, cycle_started)
                            .await
                    }
                    ProposalKind::Verdict { .. } => CycleOutcome::Retry(FailureContext {
                        failed_at: "proposer".into(),
                        reason: "expected an action or decomposition, got a verdict".into(),
                        details: Default::default(),
                    }),
                };

                match outcome {
                    CycleOutcome::Verified => {
                        session.tree.set_status(id, IntentionStatus::Verified);
                        debug!(intention = %id, cycle = cycle_no, "intention verified");
                        return;
                    }
                    CycleOutcome::Fatal(reason) => {
                        self.fail_intention(session, id, reason).await;
                        return;
                    }
                    CycleOutcome::Abandoned => return,
                    CycleOutcome::Retry(ctx) => {
                        let signature = format!("{}:{}", ctx.failed_at, ctx.reason);
                        if last_failure_sig.as_deref() == Some(signature.as_str()) {
                            // The same failure twice in a row will not heal.
                            self.fail_intention(
                                session,
                                id,
                                FailureReason::new(
                                    FailureKind::Infrastructure,
                                    format!("repeated identical failure: {}", ctx.reason),
                                )
                                .with_detail("failed_at", ctx.failed_at.clone()),
                            )
                            .await;
                            return;
                        }
                        last_failure_sig = Some(signature);
                        if ctx.failed_at == "infrastructure" {
                            infrastructure_failures += 1;
                            if infrastructure_failures > self.config.infrastructure_retry_cap {
                                self.fail_intention(
                                    session,
                                    id,
                                    FailureReason::new(FailureKind::Infrastructure, ctx.reason),
                                )
                                .await;
                                return;
                            }
                        }
                        session.metrics.record_retry();
                        debug!(intention = %id, cycle = cycle_no, reason = %ctx.reason, "retrying");
                        failure_ctx = Some(ctx);
                    }
                }
            }

            // Cycle budget exhausted.
            self.fail_intention(
                session,
                id,
                FailureReason::new(
                    FailureKind::Budget,
                    format!("max cycles ({max_cycles}) exhausted"),
                ),
            )
            .await;
        })
    }

    async fn handle_decomposition(
        &self,
        session: &mut Session,
        id: IntentionId,
        subs: Vec<SubIntention>,
    ) -> DecompositionOutcome {
        let depth = session.tree.get(id).map(|n| n.depth).unwrap_or(0);
        if depth + 1 > self.config.max_depth {
            self.fail_intention(
                session,
                id,
                FailureReason::new(
                    FailureKind::Budget,
                    format!("max depth ({}) exceeded", self.config.max_depth),
                ),
            )
            .await;
            return DecompositionOutcome::Settled;
        }

        if subs.is_empty() {
            return DecompositionOutcome::Retry(FailureContext {
                failed_at: "decomposition".into(),
                reason: "decomposition produced no sub-intentions".into(),
                details: Default::default(),
            });
        }
        // Only the root may carry no acceptance criteria.
        if let Some(missing) = subs
            .iter()
            .find(|s| s.criteria.iter().all(|c| c.trim().is_empty()))
        {
            return DecompositionOutcome::Retry(FailureContext {
                failed_at: "decomposition".into(),
                reason: format!(
                    "sub-intention '{}' has no acceptance criteria",
                    missing.what
                ),
                details: Default::default(),
            });
        }

        // Decomposition is an intention boundary.
        self.flush_batcher(session).await;

        let children: Vec<IntentionId> = subs
            .into_iter()
            .map(|sub| session.tree.add_child(id, sub.what, sub.criteria))
            .collect();
        session.tree.set_status(id, IntentionStatus::Decomposed);
        session.metrics.record_decomposition(depth + 1);
        info!(intention = %id, children = children.len(), "decomposed");

        // Left-to-right: child i+1 starts only after child i is terminal.
        for child in children {
            self.execute_intention(session, child).await;

            let child_node = session.tree.get(child).expect("child exists");
            match child_node.status {
                IntentionStatus::Verified => continue,
                IntentionStatus::Failed => {
                    let reason = child_node.failure.clone().unwrap_or_else(|| {
                        FailureReason::new(FailureKind::Intent, "child intention failed")
                    });
                    let child_goal = child_node.what.clone();
                    session
                        .tree
                        .fail(id, reason.with_detail("failed_child", child_goal));
                    return DecompositionOutcome::Settled;
                }
                IntentionStatus::Abandoned => {
                    // Cancellation already cascaded to the ancestors.
                    return DecompositionOutcome::Settled;
                }
                other => {
                    warn!(child = %child, status = %other, "child ended non-terminal");
                    session.tree.fail(
                        id,
                        FailureReason::new(
                            FailureKind::Infrastructure,
                            "child ended in a non-terminal status",
                        ),
                    );
                    return DecompositionOutcome::Settled;
                }
            }
        }

        // Every child verified; the parent follows at this boundary.
        self.flush_batcher(session).await;
        session.tree.set_status(id, IntentionStatus::Verified);
        DecompositionOutcome::Settled
    }

    async fn run_action_cycle(
        &self,
        session: &mut Session,
        id: IntentionId,
        cycle_no: u32,
        proposed: ProposedAction,
        cycle_started: Instant,
    ) -> CycleOutcome {
        let mut action = proposed.action;
        let expected_outcome = proposed.expected_outcome;

        let violations = action.validate();
        if !violations.is_empty() {
            let joined = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return CycleOutcome::Retry(FailureContext {
                failed_at: "action_validation".into(),
                reason: joined,
                details: Default::default(),
            });
        }

        let mut risk = assess(&action);
        debug!(intention = %id, level = %risk.level, factors = ?risk.factors, "risk assessed");

        // Deferred work settles before any high-risk action runs.
        if risk.level == RiskLevel::High || proposed.expect_high_risk {
            self.flush_batcher(session).await;
        }

        if risk.level == RiskLevel::High && self.config.require_approval_high_risk {
            if let Some(checkpoint) = &self.checkpoint {
                let reason = risk.factors.join(", ");
                match checkpoint.ask(&action, &reason).await {
                    Ok(CheckpointDecision::Approve) => {}
                    Ok(CheckpointDecision::Reject) => {
                        session.trust.record_failure_caught();
                        return CycleOutcome::Fatal(
                            FailureReason::new(
                                FailureKind::Safety,
                                "high-risk action rejected at checkpoint",
                            )
                            .with_detail("factors", json!(risk.factors)),
                        );
                    }
                    Ok(CheckpointDecision::Modify(replacement)) => {
                        if !replacement.is_valid() {
                            return CycleOutcome::Retry(FailureContext {
                                failed_at: "checkpoint".into(),
                                reason: "replacement action is invalid".into(),
                                details: Default::default(),
                            });
                        }
                        action = replacement;
                        risk = assess(&action);
                    }
                    Err(e) => {
                        return CycleOutcome::Retry(FailureContext {
                            failed_at: "infrastructure".into(),
                            reason: format!("checkpoint unavailable: {e}"),
                            details: Default::default(),
                        });
                    }
                }
            }
        }

        let decision = session.trust.decide(&risk);
        debug!(intention = %id, decision = %decision, trust = %session.trust.summary(), "trust decision");

        let mut record = CycleRecord::new(cycle_no, "")
            .with_action(action.clone())
            .with_risk(risk.clone())
            .with_decision(decision);

        let outcome = match decision {
            Decision::VerifyNow => {
                session.metrics.record_verification(risk.level);
                self.verify_and_apply(session, id, &action, &mut record).await
            }
            Decision::Defer => {
                session.metrics.record_skip();
                match self.apply(&action).await {
                    Ok(applied) => {
                        let result_text = if applied.diff.is_empty() {
                            format!(
                                "applied {} {}",
                                action.action_type,
                                action.target.as_deref().unwrap_or("-")
                            )
                        } else {
                            format!("applied change:\n{}", applied.diff)
                        };
                        session
                            .batcher
                            .defer(action.clone(), result_text, expected_outcome);

                        // Boundary flush before the Verified transition;
                        // a failure of our own item demotes to a retry.
                        let flush = self.flush_batcher(session).await;
                        let own_failure = flush
                            .failures
                            .iter()
                            .find(|item| item.action == action)
                            .cloned();
                        match own_failure {
                            Some(item) => CycleOutcome::Retry(FailureContext {
                                failed_at: "batch_verification".into(),
                                reason: format!(
                                    "deferred verification failed: {}",
                                    item.result
                                ),
                                details: Default::default(),
                            }),
                            None => CycleOutcome::Verified,
                        }
                    }
                    Err(outcome) => outcome,
                }
            }
            Decision::Skip => {
                session.metrics.record_skip();
                match self.apply(&action).await {
                    Ok(_) => {
                        // No verification record; older deferred items
                        // still settle at this boundary.
                        self.flush_batcher(session).await;
                        CycleOutcome::Verified
                    }
                    Err(outcome) => outcome,
                }
            }
        };

        record.outcome = match &outcome {
            CycleOutcome::Verified => "verified".to_string(),
            CycleOutcome::Retry(ctx) => format!("retry: {}", ctx.failed_at),
            CycleOutcome::Fatal(reason) => format!("failed: {}", reason.kind),
            CycleOutcome::Abandoned => "abandoned".to_string(),
        };
        record.duration_ms = cycle_started.elapsed().as_millis() as u64;
        session.tree.record_cycle(id, record);

        outcome
    }

    /// VerifyNow path: pre-apply layers, apply, post-apply layers.
    async fn verify_and_apply(
        &self,
        session: &mut Session,
        id: IntentionId,
        action: &Action,
        record: &mut CycleRecord,
    ) -> CycleOutcome {
        let ctx = self.layer_context(session, id, None);
        let pre = self.pipeline.run(action, &ctx, Some(Stage::PreApply)).await;
        self.record_report(session, &pre);

        if let Some(halting) = pre.halting.clone() {
            record.report = Some(pre);
            session.trust.record_failure_caught();
            return self.classify_halt(halting);
        }

        let applied = match self.apply(action).await {
            Ok(applied) => applied,
            Err(outcome) => {
                record.report = Some(pre);
                return outcome;
            }
        };

        if session.cancel.is_cancelled() {
            record.report = Some(pre);
            self.abandon(session, id).await;
            return CycleOutcome::Abandoned;
        }

        let post_ctx = self.layer_context(session, id, Some(applied));
        let post = self
            .pipeline
            .run(action, &post_ctx, Some(Stage::PostApply))
            .await;
        self.record_report(session, &post);

        let mut full = pre;
        full.merge(post);
        let halting = full.halting.clone();
        record.report = Some(full);

        match halting {
            Some(halting) => {
                session.trust.record_failure_caught();
                self.classify_halt(halting)
            }
            None => {
                session.trust.replenish(crate::trust::DEFAULT_REPLENISH);
                // Older deferred items settle at this boundary too.
                self.flush_batcher(session).await;
                CycleOutcome::Verified
            }
        }
    }

    /// Apply via sandbox; translates rejection and unreachability.
    async fn apply(&self, action: &Action) -> std::result::Result<AppliedChange, CycleOutcome> {
        match self.sandbox.apply(action).await {
            Ok(applied) if applied.success => Ok(applied),
            Ok(applied) => {
                // Sandbox policy said no; that is terminal for the intention.
                let reason = applied
                    .error
                    .unwrap_or_else(|| "sandbox rejected the change".to_string());
                Err(CycleOutcome::Fatal(FailureReason::new(
                    FailureKind::Safety,
                    format!("sandbox rejected: {reason}"),
                )))
            }
            Err(Error::Timeout { duration_ms }) => Err(CycleOutcome::Retry(FailureContext {
                failed_at: "infrastructure".into(),
                reason: format!("sandbox timeout after {duration_ms}ms"),
                details: Default::default(),
            })),
            Err(e) => Err(CycleOutcome::Retry(FailureContext {
                failed_at: "infrastructure".into(),
                reason: format!("sandbox unreachable: {e}"),
                details: Default::default(),
            })),
        }
    }

    fn classify_halt(&self, halting: FailureReason) -> CycleOutcome {
        if halting.is_security() || !halting.kind.is_recoverable() {
            return CycleOutcome::Fatal(halting);
        }
        CycleOutcome::Retry(FailureContext {
            failed_at: halting
                .layer
                .map(|l| l.to_string())
                .unwrap_or_else(|| halting.kind.to_string()),
            reason: halting.reason.clone(),
            details: halting.details.clone(),
        })
    }

    async fn fail_intention(&self, session: &mut Session, id: IntentionId, reason: FailureReason) {
        warn!(intention = %id, kind = %reason.kind, reason = %reason.reason, "intention failed");
        // Failure is an intention boundary.
        self.flush_batcher(session).await;
        session.metrics.record_failure();
        session.tree.fail(id, reason);
    }

    async fn abandon(&self, session: &mut Session, id: IntentionId) {
        info!(intention = %id, "abandoning on cancellation");
        if session.batcher.has_pending() {
            let _ = self.flush_batcher(session).await;
        }
        session.tree.abandon_upwards(id);
    }

    /// Flush the batcher, folding its outcome into trust and metrics.
    async fn flush_batcher(&self, session: &mut Session) -> BatchOutcome {
        let outcome = session.batcher.flush().await;
        if let Some(elapsed) = outcome.judge_elapsed_ms {
            session
                .metrics
                .record_llm_call(LlmCallPurpose::Verification, elapsed);
        }
        for _ in &outcome.failures {
            session.trust.record_failure_caught();
        }
        outcome
    }

    fn record_report(&self, session: &mut Session, report: &VerificationReport) {
        for result in &report.results {
            session.metrics.record_layer(result.layer, result.passed);
            // Judge calls made inside the intent layer surface here.
            if let Some(elapsed) = result
                .details
                .get("judge_elapsed_ms")
                .and_then(Value::as_u64)
            {
                session
                    .metrics
                    .record_llm_call(LlmCallPurpose::Verification, elapsed);
            }
        }
    }

    fn layer_context(
        &self,
        session: &Session,
        id: IntentionId,
        applied: Option<AppliedChange>,
    ) -> LayerContext {
        let node = session.tree.get(id).expect("intention exists");
        LayerContext {
            what: node.what.clone(),
            criteria: node.criteria.clone(),
            sandbox: Arc::clone(&self.sandbox),
            judge: Some(Arc::clone(&self.proposer)),
            lsp: self.lsp.clone(),
            parsers: Arc::clone(&self.parsers),
            known_modules: self.known_modules.clone(),
            applied,
            config: PipelineConfig {
                blocking_threshold: self.config.blocking_threshold,
                verify_queries: self.config.verify_queries,
                test_timeout: self.config.test_timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{FakeSandbox, ScriptedProposer};
    use crate::proposer::{JudgeVerdict, Proposal};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn proposed_action(action: Action) -> ProposalKind {
        ProposalKind::Action(ProposedAction::new(action, "change applied as described"))
    }

    fn engine_with(
        script: Vec<ProposalKind>,
        sandbox: Arc<FakeSandbox>,
        config: EngineConfig,
    ) -> IntentionEngine {
        IntentionEngine::new(Arc::new(ScriptedProposer::new(script)), sandbox)
            .with_config(config)
    }

    #[tokio::test]
    async fn test_boilerplate_import_defers_and_verifies() {
        let sandbox = Arc::new(FakeSandbox::new());
        let engine = engine_with(
            vec![proposed_action(Action::edit("utils.py", "import json"))],
            Arc::clone(&sandbox),
            EngineConfig::default(),
        );

        let report = engine
            .run("add import json to utils.py", vec!["utils.py imports json".into()])
            .await;

        assert_eq!(report.status, IntentionStatus::Verified);
        // Pipeline never ran: no layer executions recorded.
        assert_eq!(report.metrics.verifications_performed, 0);
        assert_eq!(report.verifications_skipped, 1);
        assert_eq!(report.verifications_performed, 0);
        // The sandbox saw the edit.
        assert_eq!(
            sandbox.files.lock().unwrap().get("utils.py").unwrap(),
            "import json"
        );
    }

    /// Rejects everything and counts how often it was consulted.
    struct RejectingCheckpoint {
        asks: AtomicU32,
    }

    impl RejectingCheckpoint {
        fn new() -> Self {
            Self {
                asks: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Checkpoint for RejectingCheckpoint {
        async fn ask(
            &self,
            _action: &Action,
            _reason: &str,
        ) -> crate::error::Result<CheckpointDecision> {
            self.asks.fetch_add(1, Ordering::SeqCst);
            Ok(CheckpointDecision::Reject)
        }
    }

    #[tokio::test]
    async fn test_destructive_command_rejected_at_checkpoint() {
        let sandbox = Arc::new(FakeSandbox::new());
        let checkpoint = Arc::new(RejectingCheckpoint::new());
        let engine = engine_with(
            vec![proposed_action(Action::command("rm -rf /tmp/test"))],
            Arc::clone(&sandbox),
            EngineConfig::default(),
        )
        .with_checkpoint(Arc::clone(&checkpoint) as Arc<dyn Checkpoint>);

        let report = engine.run("clean temp dir", vec!["/tmp/test removed".into()]).await;

        assert_eq!(report.status, IntentionStatus::Failed);
        assert_eq!(report.failure_kind, Some(FailureKind::Safety));
        assert_eq!(checkpoint.asks.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures_caught, 1);
        assert_eq!(report.failures_missed, 0);
        assert_eq!(report.metrics.failure_count, 1);
        // Nothing was applied.
        assert!(sandbox.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approval_toggle_bypasses_attached_checkpoint() {
        // The config field gates the confirmation step, not the mere
        // presence of a checkpoint.
        let sandbox = Arc::new(FakeSandbox::new());
        let checkpoint = Arc::new(RejectingCheckpoint::new());
        let config = EngineConfig {
            require_approval_high_risk: false,
            ..EngineConfig::default()
        };
        let engine = engine_with(
            vec![proposed_action(Action::command("rm -rf /tmp/test"))],
            Arc::clone(&sandbox),
            config,
        )
        .with_checkpoint(Arc::clone(&checkpoint) as Arc<dyn Checkpoint>);

        let report = engine.run("clean temp dir", vec!["/tmp/test removed".into()]).await;

        // Never consulted, so its Reject could not fire; the action went
        // through the pipeline instead and verified.
        assert_eq!(checkpoint.asks.load(Ordering::SeqCst), 0);
        assert_eq!(report.status, IntentionStatus::Verified);
        assert_eq!(report.failure_kind, None);
        assert_eq!(report.verifications_performed, 1);
    }

    #[tokio::test]
    async fn test_undefined_name_retries_with_context() {
        let sandbox = Arc::new(FakeSandbox::new());
        let proposer = Arc::new(RecordingProposer::new(vec![
            proposed_action(Action::create("main.py", "def f():\n    return g()\n")),
            proposed_action(Action::create("main.py", "def f():\n    return 2\n")),
        ]));
        let config = EngineConfig {
            initial_trust: 70, // below the skip thresholds: everything verifies
            ..EngineConfig::default()
        };
        let engine = IntentionEngine::new(proposer.clone(), sandbox)
            .with_config(config);

        let report = engine
            .run("write function f", vec!["f returns a value".into()])
            .await;

        assert_eq!(report.status, IntentionStatus::Verified);
        assert_eq!(report.metrics.retry_count, 1);

        // The retry prompt carried the semantic failure details.
        let requests = proposer.requests.lock().unwrap();
        let retry = requests
            .iter()
            .filter(|r| r.purpose == Purpose::Act)
            .nth(1)
            .expect("second act request");
        let failure = retry.failure.as_ref().expect("failure context attached");
        assert_eq!(failure.failed_at, "semantic");
        assert_eq!(
            failure.details.get("undefined_names").unwrap(),
            &json!(["g"])
        );
    }

    #[tokio::test]
    async fn test_decomposition_runs_children_in_order_and_stops_on_failure() {
        let sandbox = Arc::new(FakeSandbox::new());
        let script = vec![
            ProposalKind::Decomposition(vec![
                SubIntention::new("extract helper", vec!["helper exists".into()]),
                SubIntention::new("update callers", vec!["callers updated".into()]),
                SubIntention::new("run tests", vec!["tests pass".into()]),
            ]),
            // Child 1 verifies via the defer path.
            proposed_action(Action::edit("helper.py", "import json")),
            // Child 2 gets a junk verdict, retries are capped at 1 cycle.
            ProposalKind::Verdict {
                verdict: JudgeVerdict::Pass,
                reason: "not an action".into(),
            },
        ];
        let config = EngineConfig {
            max_cycles_per_intention: 1,
            ..EngineConfig::default()
        };
        let engine = engine_with(script, Arc::clone(&sandbox), config);

        let report = engine.run("refactor module X", vec!["module X tidy".into()]).await;

        assert_eq!(report.status, IntentionStatus::Failed);
        assert_eq!(report.metrics.decomposition_count, 1);
        // Child 3 never started: only child 1's file exists, and the
        // proposer script ran dry during child 2.
        assert_eq!(sandbox.files.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_failure_demotes_to_retry() {
        let sandbox = Arc::new(FakeSandbox::new());
        let script = vec![
            proposed_action(Action::edit("a.py", "import json")),
            // Judge verdict for the first flush: our item fails.
            ProposalKind::Verdict {
                verdict: JudgeVerdict::Fail,
                reason: "1: FAIL".into(),
            },
            // Retry proposes a second edit that settles heuristically.
            proposed_action(Action::edit("a.py", "import sys")),
        ];
        let engine = engine_with(script, Arc::clone(&sandbox), EngineConfig::default());

        let report = engine.run("add import", vec!["a.py imports json".into()]).await;

        assert_eq!(report.status, IntentionStatus::Verified);
        assert_eq!(report.metrics.retry_count, 1);
        assert_eq!(report.failures_caught, 1);
    }

    struct AlwaysDecompose {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionProposer for AlwaysDecompose {
        async fn propose(&self, _request: ProposalRequest) -> crate::error::Result<Proposal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Proposal::new(
                ProposalKind::Decomposition(vec![SubIntention::new(
                    "go deeper",
                    vec!["depth reached".into()],
                )]),
                1,
            ))
        }
    }

    #[tokio::test]
    async fn test_depth_bound_terminates_runaway_decomposition() {
        let sandbox = Arc::new(FakeSandbox::new());
        let proposer = Arc::new(AlwaysDecompose {
            calls: AtomicU32::new(0),
        });
        let config = EngineConfig {
            max_depth: 3,
            max_cycles_per_intention: 2,
            ..EngineConfig::default()
        };
        let engine = IntentionEngine::new(proposer.clone(), sandbox).with_config(config.clone());

        let report = engine.run("recurse forever", vec!["never".into()]).await;

        assert_eq!(report.status, IntentionStatus::Failed);
        assert_eq!(report.failure_kind, Some(FailureKind::Budget));
        // One decomposition call per level, bounded by the depth budget.
        let calls = proposer.calls.load(Ordering::SeqCst);
        assert!(calls <= config.max_depth * config.max_cycles_per_intention);
    }

    #[tokio::test]
    async fn test_cycles_exhausted_is_budget_failure() {
        let sandbox = Arc::new(FakeSandbox::new());
        // Alternate two distinct junk verdicts so the repeated-identical
        // shortcut does not kick in before the cycle budget.
        let script = vec![
            ProposalKind::Decomposition(vec![]),
            ProposalKind::Verdict {
                verdict: JudgeVerdict::Pass,
                reason: "junk".into(),
            },
            ProposalKind::Decomposition(vec![]),
        ];
        let config = EngineConfig {
            max_cycles_per_intention: 3,
            ..EngineConfig::default()
        };
        let engine = engine_with(script, sandbox, config);

        let report = engine.run("goal", vec!["done".into()]).await;
        assert_eq!(report.status, IntentionStatus::Failed);
        assert_eq!(report.failure_kind, Some(FailureKind::Budget));
        assert!(report
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("max cycles"));
    }

    #[tokio::test]
    async fn test_repeated_identical_failure_is_terminal() {
        let sandbox = Arc::new(FakeSandbox::new());
        let script = vec![
            ProposalKind::Decomposition(vec![]),
            ProposalKind::Decomposition(vec![]),
        ];
        let engine = engine_with(script, sandbox, EngineConfig::default());

        let report = engine.run("goal", vec!["done".into()]).await;
        assert_eq!(report.status, IntentionStatus::Failed);
        assert!(report
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("repeated identical failure"));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_everything() {
        let sandbox = Arc::new(FakeSandbox::new());
        let engine = engine_with(
            vec![proposed_action(Action::edit("a.py", "import json"))],
            sandbox,
            EngineConfig::default(),
        );
        engine.cancel_signal().cancel();

        let report = engine.run("goal", vec!["done".into()]).await;
        assert_eq!(report.status, IntentionStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_sandbox_rejection_is_terminal() {
        let sandbox = Arc::new(FakeSandbox::new());
        *sandbox.reject_next.lock().unwrap() = true;
        let engine = engine_with(
            vec![proposed_action(Action::edit("a.py", "import json"))],
            Arc::clone(&sandbox),
            EngineConfig::default(),
        );

        let report = engine.run("goal", vec!["done".into()]).await;
        assert_eq!(report.status, IntentionStatus::Failed);
        assert_eq!(report.failure_kind, Some(FailureKind::Safety));
        assert!(report.failure_reason.unwrap().contains("sandbox rejected"));
    }

    #[tokio::test]
    async fn test_metrics_layer_invariant_holds_after_run() {
        let sandbox = Arc::new(FakeSandbox::new());
        let proposer = Arc::new(RecordingProposer::new(vec![proposed_action(
            Action::create("main.py", "def f():\n    return 2\n"),
        )]));
        let config = EngineConfig {
            initial_trust: 60,
            ..EngineConfig::default()
        };
        let engine = IntentionEngine::new(proposer, sandbox).with_config(config);

        let report = engine.run("write f", vec!["f returns 2".into()]).await;
        assert_eq!(report.status, IntentionStatus::Verified);

        let total: u32 = report
            .metrics
            .layer_tallies
            .values()
            .map(|t| t.passed + t.failed)
            .sum();
        assert_eq!(total, report.metrics.verifications_performed);
        assert!(total > 0);
    }

    /// Proposer that records every request it sees, then replays a script.
    struct RecordingProposer {
        inner: ScriptedProposer,
        requests: Mutex<Vec<ProposalRequest>>,
    }

    impl RecordingProposer {
        fn new(script: Vec<ProposalKind>) -> Self {
            Self {
                inner: ScriptedProposer::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ActionProposer for RecordingProposer {
        async fn propose(&self, request: ProposalRequest) -> crate::error::Result<Proposal> {
            self.requests.lock().unwrap().push(request.clone());
            self.inner.propose(request).await
        }
    }
}
