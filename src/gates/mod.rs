//! Gate evaluation for completed phases.
//!
//! Each phase carries a [`GatePolicy`]. When the agent emits a completion
//! marker the executor hands the marker to [`evaluate`], which either
//! approves, rejects, or parks the phase until a human decides.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::signals::Completion;

static VERDICT_WORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*(pass|passed|fail|failed)\b[\s:.\-]*(.*)$").unwrap());

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Approve as soon as the completion marker is seen.
    #[default]
    Auto,
    /// The agent grades its own output with a pass/fail verdict.
    #[serde(alias = "ai")]
    Agent,
    /// Park the task as `blocked` until someone calls approve or reject.
    Human,
}

impl GatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Agent => "agent",
            Self::Human => "human",
        }
    }
}

impl std::fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "agent" | "ai" => Ok(Self::Agent),
            "human" => Ok(Self::Human),
            _ => Err(format!(
                "Invalid gate policy '{}'. Valid values: auto, agent, human",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Approve,
    Reject,
}

/// An append-only record of one gate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub phase: String,
    pub policy: GatePolicy,
    pub outcome: GateOutcome,
    /// `"auto"`, `"agent"`, or the human decider's identity.
    pub decider: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl GateDecision {
    pub fn new(
        phase: &str,
        policy: GatePolicy,
        outcome: GateOutcome,
        decider: impl Into<String>,
        comment: Option<String>,
    ) -> Self {
        Self {
            phase: phase.to_string(),
            policy,
            outcome,
            decider: decider.into(),
            comment,
            decided_at: Utc::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.outcome == GateOutcome::Approve
    }
}

/// Result of evaluating a completion marker against a policy.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvaluation {
    Decided(GateDecision),
    AwaitingHuman,
}

/// The agent's self-assessment carried on its completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub pass: bool,
    pub rationale: String,
}

#[derive(Deserialize)]
struct VerdictJson {
    verdict: String,
    #[serde(default)]
    rationale: String,
}

fn parse_verdict_word(word: &str) -> Option<bool> {
    match word.to_lowercase().as_str() {
        "pass" | "passed" => Some(true),
        "fail" | "failed" => Some(false),
        _ => None,
    }
}

/// Parse a verdict from a completion marker.
///
/// Accepts a `verdict="pass"` attribute, a JSON body such as
/// `{"verdict": "fail", "rationale": "..."}`, or a body starting with
/// `PASS`/`FAIL`. Returns `None` when none of these match.
pub fn parse_verdict(completion: &Completion) -> Option<Verdict> {
    let body = completion.body.trim();

    if let Some(attr) = &completion.verdict {
        let pass = parse_verdict_word(attr)?;
        return Some(Verdict {
            pass,
            rationale: body.to_string(),
        });
    }

    if body.starts_with('{') {
        let parsed: VerdictJson = serde_json::from_str(body).ok()?;
        return Some(Verdict {
            pass: parse_verdict_word(&parsed.verdict)?,
            rationale: parsed.rationale,
        });
    }

    let caps = VERDICT_WORD_REGEX.captures(body)?;
    Some(Verdict {
        pass: parse_verdict_word(caps.get(1)?.as_str())?,
        rationale: caps.get(2).map_or("", |m| m.as_str()).trim().to_string(),
    })
}

/// Evaluate a phase completion under the given policy.
pub fn evaluate(phase: &str, policy: GatePolicy, completion: &Completion) -> GateEvaluation {
    match policy {
        GatePolicy::Auto => GateEvaluation::Decided(GateDecision::new(
            phase,
            policy,
            GateOutcome::Approve,
            "auto",
            None,
        )),
        GatePolicy::Agent => {
            let decision = match parse_verdict(completion) {
                Some(v) if v.pass => {
                    GateDecision::new(phase, policy, GateOutcome::Approve, "agent", Some(v.rationale))
                }
                Some(v) => {
                    GateDecision::new(phase, policy, GateOutcome::Reject, "agent", Some(v.rationale))
                }
                None => GateDecision::new(
                    phase,
                    policy,
                    GateOutcome::Reject,
                    "agent",
                    Some("Could not parse a pass/fail verdict from the completion output".into()),
                ),
            };
            GateEvaluation::Decided(decision)
        }
        GatePolicy::Human => GateEvaluation::AwaitingHuman,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(body: &str, verdict: Option<&str>) -> Completion {
        Completion {
            body: body.to_string(),
            verdict: verdict.map(str::to_string),
        }
    }

    #[test]
    fn test_auto_always_approves() {
        match evaluate("spec", GatePolicy::Auto, &completion("", None)) {
            GateEvaluation::Decided(d) => {
                assert!(d.is_approved());
                assert_eq!(d.decider, "auto");
            }
            other => panic!("Expected decision, got {:?}", other),
        }
    }

    #[test]
    fn test_human_waits() {
        assert_eq!(
            evaluate("merge", GatePolicy::Human, &completion("done", None)),
            GateEvaluation::AwaitingHuman
        );
    }

    #[test]
    fn test_agent_verdict_from_json() {
        let c = completion(r#"{"verdict": "pass", "rationale": "all tests green"}"#, None);
        let v = parse_verdict(&c).unwrap();
        assert!(v.pass);
        assert_eq!(v.rationale, "all tests green");
    }

    #[test]
    fn test_agent_verdict_from_attribute() {
        let c = completion("missing error handling", Some("fail"));
        let v = parse_verdict(&c).unwrap();
        assert!(!v.pass);
        assert_eq!(v.rationale, "missing error handling");
    }

    #[test]
    fn test_agent_verdict_from_leading_word() {
        let v = parse_verdict(&completion("PASS: looks good", None)).unwrap();
        assert!(v.pass);
        assert_eq!(v.rationale, "looks good");

        let v = parse_verdict(&completion("failed - flaky test", None)).unwrap();
        assert!(!v.pass);
        assert_eq!(v.rationale, "flaky test");
    }

    #[test]
    fn test_unparseable_verdict_rejects() {
        match evaluate("review", GatePolicy::Agent, &completion("I think it's fine", None)) {
            GateEvaluation::Decided(d) => {
                assert_eq!(d.outcome, GateOutcome::Reject);
                assert!(d.comment.unwrap().contains("Could not parse"));
            }
            other => panic!("Expected decision, got {:?}", other),
        }
        assert!(parse_verdict(&completion("{not json", None)).is_none());
        assert!(parse_verdict(&completion("x", Some("maybe"))).is_none());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("HUMAN".parse::<GatePolicy>().unwrap(), GatePolicy::Human);
        assert_eq!("ai".parse::<GatePolicy>().unwrap(), GatePolicy::Agent);
        assert!("manual".parse::<GatePolicy>().is_err());
    }
}
