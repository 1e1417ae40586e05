//! Verification batcher.
//!
//! Accumulates deferred low/medium-risk verifications and settles them
//! together at an intention boundary, turning N judge calls into at most
//! one grouped judgment. Without a judge, a keyword heuristic decides,
//! erring toward failure on unclear output.

use crate::action::Action;
use crate::proposer::{ActionProposer, ProposalKind, ProposalRequest, Purpose};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// A verification waiting in the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredVerification {
    pub action: Action,
    /// What actually happened, as reported by the sandbox/proposer
    pub result: String,
    /// What the proposer expected to happen
    pub expected: String,
}

impl DeferredVerification {
    pub fn new(action: Action, result: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            action,
            result: result.into(),
            expected: expected.into(),
        }
    }
}

/// Outcome of settling a batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Pass iff every item passed
    pub overall_pass: bool,
    /// Every item with its individual verdict, in defer order
    pub per_item: Vec<(DeferredVerification, bool)>,
    /// The failing items only
    pub failures: Vec<DeferredVerification>,
    /// Wall-clock of the judge call, when one was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_elapsed_ms: Option<u64>,
}

impl BatchOutcome {
    fn empty() -> Self {
        Self {
            overall_pass: true,
            per_item: Vec::new(),
            failures: Vec::new(),
            judge_elapsed_ms: None,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.per_item.iter().filter(|(_, passed)| *passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

static ERROR_INDICATORS: &[&str] = &[
    "error",
    "traceback",
    "permission denied",
    "exception",
    "failed",
    "not found",
    "fatal",
];

static SUCCESS_INDICATORS: &[&str] = &[
    "created",
    "added",
    "done",
    "ok",
    "success",
    "complete",
    "updated",
    "applied",
    "passed",
];

static VERDICT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:item\s*)?(\d+)\s*[:.)-]\s*(pass|fail)\b").expect("invalid regex")
});

/// Buffers deferred verifications until the next flush.
pub struct VerificationBatcher {
    judge: Option<Arc<dyn ActionProposer>>,
    pending: Vec<DeferredVerification>,
}

impl VerificationBatcher {
    /// Heuristic-only batcher.
    pub fn new() -> Self {
        Self {
            judge: None,
            pending: Vec::new(),
        }
    }

    /// Batcher that settles through an LLM judge.
    pub fn with_judge(judge: Arc<dyn ActionProposer>) -> Self {
        Self {
            judge: Some(judge),
            pending: Vec::new(),
        }
    }

    /// Queue a verification for the next flush.
    pub fn defer(
        &mut self,
        action: Action,
        result: impl Into<String>,
        expected: impl Into<String>,
    ) {
        self.pending
            .push(DeferredVerification::new(action, result, expected));
    }

    /// Number of verifications waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop pending verifications without settling them.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Settle every pending verification in one grouped check.
    ///
    /// Idempotent when empty: flushing with nothing pending passes and
    /// two consecutive empty flushes are equal.
    pub async fn flush(&mut self) -> BatchOutcome {
        if self.pending.is_empty() {
            return BatchOutcome::empty();
        }

        let items = std::mem::take(&mut self.pending);
        debug!(count = items.len(), "flushing deferred verifications");

        let mut judge_elapsed_ms = None;
        let verdicts = match &self.judge {
            Some(judge) => {
                let (verdicts, elapsed) = self.settle_with_judge(judge.as_ref(), &items).await;
                judge_elapsed_ms = elapsed;
                match verdicts {
                    Some(verdicts) => verdicts,
                    // Judge unusable; the heuristic is the safe fallback.
                    None => items.iter().map(heuristic_verdict).collect(),
                }
            }
            None => items.iter().map(heuristic_verdict).collect(),
        };

        let per_item: Vec<(DeferredVerification, bool)> =
            items.into_iter().zip(verdicts).collect();
        let failures: Vec<DeferredVerification> = per_item
            .iter()
            .filter(|(_, passed)| !passed)
            .map(|(item, _)| item.clone())
            .collect();

        BatchOutcome {
            overall_pass: failures.is_empty(),
            per_item,
            failures,
            judge_elapsed_ms,
        }
    }

    async fn settle_with_judge(
        &self,
        judge: &dyn ActionProposer,
        items: &[DeferredVerification],
    ) -> (Option<Vec<bool>>, Option<u64>) {
        let prompt = build_batch_prompt(items);
        let request = ProposalRequest::new("settle deferred verifications", Purpose::Judge)
            .with_context(prompt);

        let proposal = match judge.propose(request).await {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(error = %e, "batch judge call failed; falling back to heuristic");
                return (None, None);
            }
        };
        let elapsed = Some(proposal.elapsed_ms);

        let reply = match proposal.kind {
            ProposalKind::Verdict { reason, .. } => reason,
            _ => {
                warn!("batch judge returned non-verdict; falling back to heuristic");
                return (None, elapsed);
            }
        };

        let verdicts = parse_batch_verdicts(&reply, items.len());
        if verdicts.is_none() {
            warn!("unparseable batch verdict; falling back to heuristic");
        }
        (verdicts, elapsed)
    }
}

impl Default for VerificationBatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// One prompt listing every pending item with its expectation and result.
fn build_batch_prompt(items: &[DeferredVerification]) -> String {
    let mut prompt = String::from(
        "Judge each item below. Reply with one line per item in the form\n\
         `<item number>: PASS` or `<item number>: FAIL`.\n\n",
    );
    for (index, item) in items.iter().enumerate() {
        prompt.push_str(&format!(
            "Item {}:\n  action: {} {}\n  expected: {}\n  result: {}\n\n",
            index + 1,
            item.action.action_type,
            item.action.target.as_deref().unwrap_or("-"),
            item.expected,
            item.result,
        ));
    }
    prompt
}

/// Parse `N: PASS|FAIL` lines into per-item verdicts.
fn parse_batch_verdicts(reply: &str, expected_count: usize) -> Option<Vec<bool>> {
    let mut verdicts = vec![None; expected_count];
    for capture in VERDICT_LINE.captures_iter(reply) {
        let index: usize = capture[1].parse().ok()?;
        if index == 0 || index > expected_count {
            continue;
        }
        verdicts[index - 1] = Some(capture[2].eq_ignore_ascii_case("pass"));
    }
    verdicts.into_iter().collect()
}

fn contains_word(text: &str, word: &str) -> bool {
    if word.contains(' ') {
        return text.contains(word);
    }
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|w| w == word)
}

/// Keyword heuristic: pass needs a success indicator (or overlap with the
/// expected outcome) and no error indicator; anything unclear fails.
fn heuristic_verdict(item: &DeferredVerification) -> bool {
    let result = item.result.to_lowercase();

    if ERROR_INDICATORS.iter().any(|w| contains_word(&result, w)) {
        return false;
    }

    if SUCCESS_INDICATORS.iter().any(|w| contains_word(&result, w)) {
        return true;
    }

    // Expected-outcome keyword overlap counts as success evidence.
    let expected = item.expected.to_lowercase();
    expected
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 3)
        .any(|w| contains_word(&result, w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use crate::pipeline::testing::ScriptedProposer;
    use crate::proposer::JudgeVerdict;

    fn action() -> Action {
        Action::new(ActionType::Create, "create file.py").with_target("file.py")
    }

    #[tokio::test]
    async fn test_empty_flush_passes_and_is_idempotent() {
        let mut batcher = VerificationBatcher::new();
        let first = batcher.flush().await;
        let second = batcher.flush().await;
        assert!(first.overall_pass);
        assert!(first.per_item.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_defer_accumulates_and_flush_clears() {
        let mut batcher = VerificationBatcher::new();
        batcher.defer(action(), "File created successfully", "file exists");
        batcher.defer(action(), "Done. Function updated.", "function updated");
        assert_eq!(batcher.pending_count(), 2);
        assert!(batcher.has_pending());

        let outcome = batcher.flush().await;
        assert!(outcome.overall_pass);
        assert_eq!(outcome.passed_count(), 2);
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_drops_without_settling() {
        let mut batcher = VerificationBatcher::new();
        batcher.defer(action(), "result", "expected");
        batcher.clear();
        assert_eq!(batcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_indicators_fail() {
        let mut batcher = VerificationBatcher::new();
        batcher.defer(action(), "Error: file not found", "file exists");
        batcher.defer(action(), "Traceback (most recent call last)", "should run");
        batcher.defer(action(), "Permission denied: /etc/passwd", "should write");

        let outcome = batcher.flush().await;
        assert!(!outcome.overall_pass);
        assert_eq!(outcome.failed_count(), 3);
    }

    #[tokio::test]
    async fn test_unclear_result_fails() {
        let mut batcher = VerificationBatcher::new();
        batcher.defer(action(), "xyz 123 abc", "should update configuration");

        let outcome = batcher.flush().await;
        assert!(!outcome.overall_pass);
    }

    #[tokio::test]
    async fn test_expected_keyword_overlap_passes() {
        let mut batcher = VerificationBatcher::new();
        batcher.defer(
            action(),
            "new function calculate_total now in utils.py",
            "function calculate_total added",
        );

        let outcome = batcher.flush().await;
        assert!(outcome.overall_pass);
    }

    #[tokio::test]
    async fn test_mixed_results_identify_failures() {
        let mut batcher = VerificationBatcher::new();
        batcher.defer(action(), "File created successfully", "file exists");
        batcher.defer(action(), "Error: disk full", "data written");

        let outcome = batcher.flush().await;
        assert!(!outcome.overall_pass);
        assert_eq!(outcome.passed_count(), 1);
        assert_eq!(outcome.failed_count(), 1);
        assert!(outcome.failures[0].result.contains("disk full"));
    }

    #[tokio::test]
    async fn test_judge_verdict_lines_drive_outcome() {
        let judge = Arc::new(ScriptedProposer::new(vec![ProposalKind::Verdict {
            verdict: JudgeVerdict::Fail,
            reason: "1: PASS\n2: FAIL".into(),
        }]));
        let mut batcher = VerificationBatcher::with_judge(judge);
        batcher.defer(action(), "edit applied to a.py", "a.py updated");
        batcher.defer(action(), "edit applied to b.py", "b.py updated");

        let outcome = batcher.flush().await;
        assert!(!outcome.overall_pass);
        assert_eq!(
            outcome
                .per_item
                .iter()
                .map(|(_, passed)| *passed)
                .collect::<Vec<_>>(),
            vec![true, false]
        );
        assert_eq!(outcome.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_judge_reply_falls_back_to_heuristic() {
        let judge = Arc::new(ScriptedProposer::new(vec![ProposalKind::Verdict {
            verdict: JudgeVerdict::Pass,
            reason: "all of these look great to me!".into(),
        }]));
        let mut batcher = VerificationBatcher::with_judge(judge);
        batcher.defer(action(), "File created successfully", "file exists");

        let outcome = batcher.flush().await;
        // Heuristic fallback still sees the success indicator.
        assert!(outcome.overall_pass);
    }

    #[test]
    fn test_batch_prompt_lists_every_item() {
        let items = vec![
            DeferredVerification::new(action(), "result1", "expected1"),
            DeferredVerification::new(
                Action::new(ActionType::Edit, "edit file2").with_target("file2.py"),
                "result2",
                "expected2",
            ),
        ];
        let prompt = build_batch_prompt(&items);
        assert!(prompt.contains("Item 1:"));
        assert!(prompt.contains("Item 2:"));
        assert!(prompt.contains("expected1"));
        assert!(prompt.contains("expected2"));
        assert!(prompt.contains("create"));
        assert!(prompt.contains("edit"));
    }

    #[test]
    fn test_parse_verdicts_variants() {
        assert_eq!(
            parse_batch_verdicts("1: PASS\n2: fail", 2),
            Some(vec![true, false])
        );
        assert_eq!(
            parse_batch_verdicts("Item 1: pass\nItem 2: PASS", 2),
            Some(vec![true, true])
        );
        // Missing an item → unparseable.
        assert_eq!(parse_batch_verdicts("1: PASS", 2), None);
        assert_eq!(parse_batch_verdicts("nothing useful", 1), None);
    }
}
