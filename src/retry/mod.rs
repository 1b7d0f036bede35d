//! Retry controller.
//!
//! When a phase fails, the controller decides whether to retry the same
//! phase, rewind to an earlier phase that likely caused the failure (for
//! example `test` failing sends work back to `implement`), or give up.
//! Every retry is counted in a [`RetryRecord`] keyed by the
//! `(failing, target)` pair, and the count is checked against
//! `max_retries` before the next attempt.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

/// Failure output kept in a retry context; the tail is the useful part.
pub const MAX_FAILURE_SUMMARY: usize = 2000;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Failing phase -> phase to rewind to.
pub fn default_retry_map() -> HashMap<String, String> {
    ["test", "test_unit", "test_e2e", "validate", "review"]
        .into_iter()
        .map(|phase| (phase.to_string(), "implement".to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub map: HashMap<String, String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            map: default_retry_map(),
        }
    }
}

/// Attempt counter for one `(failing, target)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub failing_phase: String,
    pub target_phase: String,
    pub attempts: u32,
    pub last_failure: String,
    pub updated_at: DateTime<Utc>,
}

/// Failure information injected into the rewound phase's next render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub failing_phase: String,
    pub target_phase: String,
    pub attempt_number: u32,
    pub failure_summary: String,
    pub created_at: DateTime<Utc>,
}

impl RetryContext {
    pub fn render(&self) -> String {
        let mut out = String::from("## Retry Context\n\n");
        if self.failing_phase == self.target_phase {
            out.push_str(&format!(
                "This phase is being retried after it failed (attempt {}).\n\n",
                self.attempt_number
            ));
        } else {
            out.push_str(&format!(
                "This phase is being re-executed because the later phase `{}` failed (attempt {}).\n\n",
                self.failing_phase, self.attempt_number
            ));
        }
        out.push_str("### What went wrong\n\n```\n");
        out.push_str(&self.failure_summary);
        out.push_str("\n```\n\nAddress the failure above before signalling completion.\n");
        out
    }
}

/// Why a phase stopped without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseFailure {
    /// The agent asked for human input.
    Blocked { reason: String },
    /// Budget exhaustion, timeout, or another agent error.
    Retryable { summary: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the failing phase itself.
    RetrySame { attempt: u32, context: RetryContext },
    /// Rewind to an earlier phase and re-run forward from there.
    Rewind { target: String, attempt: u32, context: RetryContext },
    /// Park the task as blocked; a human has to respond.
    Escalate { reason: String },
    /// The pair has used up its retries.
    GiveUp { reason: String },
}

impl RetryPolicy {
    /// The phase a failure of `failing` should rewind to. Falls back to
    /// `failing` itself when the mapped target is not an earlier phase of
    /// this plan.
    pub fn target_for<'a>(&'a self, plan: &Plan, failing: &'a str) -> &'a str {
        let Some(target) = self.map.get(failing) else {
            return failing;
        };
        match (plan.position(target), plan.position(failing)) {
            (Some(t), Some(f)) if t < f => target.as_str(),
            _ => failing,
        }
    }

    pub fn decide(
        &self,
        plan: &Plan,
        failing: &str,
        failure: &PhaseFailure,
        records: &[RetryRecord],
    ) -> RetryDecision {
        let summary = match failure {
            PhaseFailure::Blocked { reason } => {
                return RetryDecision::Escalate {
                    reason: reason.clone(),
                };
            }
            PhaseFailure::Retryable { summary } => summary,
        };

        let target = self.target_for(plan, failing);
        let used = find_record(records, failing, target).map_or(0, |r| r.attempts);
        if used >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!(
                    "Phase '{}' exhausted {} of {} retries (target '{}'): {}",
                    failing,
                    used,
                    self.max_retries,
                    target,
                    truncate_tail(summary, 200)
                ),
            };
        }

        let attempt = used + 1;
        let context = RetryContext {
            failing_phase: failing.to_string(),
            target_phase: target.to_string(),
            attempt_number: attempt,
            failure_summary: truncate_tail(summary, MAX_FAILURE_SUMMARY),
            created_at: Utc::now(),
        };
        if target == failing {
            RetryDecision::RetrySame { attempt, context }
        } else {
            RetryDecision::Rewind {
                target: target.to_string(),
                attempt,
                context,
            }
        }
    }
}

pub fn find_record<'a>(
    records: &'a [RetryRecord],
    failing: &str,
    target: &str,
) -> Option<&'a RetryRecord> {
    records
        .iter()
        .find(|r| r.failing_phase == failing && r.target_phase == target)
}

/// Count one more attempt for the pair, creating the record on first use.
pub fn record_attempt(records: &mut Vec<RetryRecord>, context: &RetryContext) -> u32 {
    let now = Utc::now();
    if let Some(record) = records.iter_mut().find(|r| {
        r.failing_phase == context.failing_phase && r.target_phase == context.target_phase
    }) {
        record.attempts += 1;
        record.last_failure = context.failure_summary.clone();
        record.updated_at = now;
        return record.attempts;
    }
    records.push(RetryRecord {
        failing_phase: context.failing_phase.clone(),
        target_phase: context.target_phase.clone(),
        attempts: 1,
        last_failure: context.failure_summary.clone(),
        updated_at: now,
    });
    1
}

/// Keep the last `max` characters, marking the cut.
pub fn truncate_tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - max).collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanOptions, PlanTemplate, resolve_plan};

    fn plan(ids: &[&str]) -> Plan {
        resolve_plan(&PlanTemplate::linear("t", ids), &PlanOptions::default()).unwrap()
    }

    fn failure() -> PhaseFailure {
        PhaseFailure::Retryable {
            summary: "3 tests failed".into(),
        }
    }

    #[test]
    fn test_rewinds_to_mapped_earlier_phase() {
        let policy = RetryPolicy::default();
        let plan = plan(&["spec", "implement", "test"]);
        match policy.decide(&plan, "test", &failure(), &[]) {
            RetryDecision::Rewind {
                target,
                attempt,
                context,
            } => {
                assert_eq!(target, "implement");
                assert_eq!(attempt, 1);
                assert_eq!(context.failing_phase, "test");
                assert_eq!(context.failure_summary, "3 tests failed");
            }
            other => panic!("Expected rewind, got {:?}", other),
        }
    }

    #[test]
    fn test_unmapped_phase_retries_itself() {
        let policy = RetryPolicy::default();
        let plan = plan(&["spec", "implement"]);
        assert!(matches!(
            policy.decide(&plan, "implement", &failure(), &[]),
            RetryDecision::RetrySame { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_mapped_target_missing_from_plan_retries_itself() {
        let policy = RetryPolicy::default();
        let plan = plan(&["spec", "review"]);
        assert_eq!(policy.target_for(&plan, "review"), "review");
    }

    #[test]
    fn test_blocked_escalates_without_counting() {
        let policy = RetryPolicy::default();
        let plan = plan(&["implement", "test"]);
        let decision = policy.decide(
            &plan,
            "test",
            &PhaseFailure::Blocked {
                reason: "need creds".into(),
            },
            &[],
        );
        assert_eq!(
            decision,
            RetryDecision::Escalate {
                reason: "need creds".into()
            }
        );
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let plan = plan(&["implement", "test"]);
        let mut records = Vec::new();
        for expected in 1..=2 {
            match policy.decide(&plan, "test", &failure(), &records) {
                RetryDecision::Rewind { attempt, context, .. } => {
                    assert_eq!(attempt, expected);
                    assert_eq!(record_attempt(&mut records, &context), expected);
                }
                other => panic!("Expected rewind, got {:?}", other),
            }
        }
        let decision = policy.decide(&plan, "test", &failure(), &records);
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
        // Giving up is deterministic and leaves the record at its terminal count.
        assert_eq!(policy.decide(&plan, "test", &failure(), &records), decision);
        assert_eq!(find_record(&records, "test", "implement").unwrap().attempts, 2);
    }

    #[test]
    fn test_zero_max_retries_gives_up_immediately() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let plan = plan(&["implement", "test"]);
        assert!(matches!(
            policy.decide(&plan, "test", &failure(), &[]),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_truncate_tail_keeps_the_end() {
        assert_eq!(truncate_tail("short", 10), "short");
        assert_eq!(truncate_tail("abcdefghij", 4), "...ghij");
    }

    #[test]
    fn test_render_mentions_failing_phase() {
        let ctx = RetryContext {
            failing_phase: "test".into(),
            target_phase: "implement".into(),
            attempt_number: 2,
            failure_summary: "assertion failed".into(),
            created_at: Utc::now(),
        };
        let text = ctx.render();
        assert!(text.starts_with("## Retry Context"));
        assert!(text.contains("`test` failed (attempt 2)"));
        assert!(text.contains("assertion failed"));
    }
}
