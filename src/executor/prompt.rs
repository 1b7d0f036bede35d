//! Working context handed to the agent for one phase iteration.

use crate::artifacts::{ArtifactStore, output_artifact_name};
use crate::gates::GatePolicy;
use crate::plan::PhaseSpec;
use crate::state::TaskState;

/// Per-artifact cap inside a prompt; longer artifacts are cut at the end.
const MAX_ARTIFACT_CHARS: usize = 16_000;

/// Text of every earlier, finished phase's artifacts, in plan order.
pub fn prior_artifacts(
    store: &dyn ArtifactStore,
    state: &TaskState,
    phase: &str,
) -> anyhow::Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    let Some(pos) = state.plan.position(phase) else {
        return Ok(found);
    };
    for spec in &state.plan.phases()[..pos] {
        if !state.phase(&spec.id).is_some_and(|r| r.status.is_done()) {
            continue;
        }
        let mut names = spec.artifacts.clone();
        let output = output_artifact_name(&spec.id);
        if !names.contains(&output) {
            names.push(output);
        }
        for name in names {
            if let Some(content) = store.read(&state.task.id, &name)?
                && !content.trim().is_empty()
            {
                found.push((name, content));
            }
        }
    }
    Ok(found)
}

fn clip(content: &str) -> String {
    if content.chars().count() <= MAX_ARTIFACT_CHARS {
        return content.to_string();
    }
    let head: String = content.chars().take(MAX_ARTIFACT_CHARS).collect();
    format!("{}\n\n[... truncated ...]", head)
}

/// Render the prompt for `spec` at `iteration`.
pub fn render(
    state: &TaskState,
    spec: &PhaseSpec,
    artifacts: &[(String, String)],
    iteration: u32,
) -> String {
    let task = &state.task;
    let mut out = format!("# {}: {}\n\n", task.id, task.title);
    if !task.description.trim().is_empty() {
        out.push_str(task.description.trim());
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "Weight: {} | Category: {}\n\n## Current phase: {} (iteration {} of {})\n\n",
        task.weight, task.category, spec.id, iteration, spec.max_iterations
    ));

    out.push_str("## Plan\n\n");
    for phase in state.plan.phases() {
        let status = state
            .phase(&phase.id)
            .map_or("pending", |r| r.status.as_str());
        let marker = if phase.id == spec.id { " <- you are here" } else { "" };
        out.push_str(&format!("- {} ({}){}\n", phase.id, status, marker));
    }
    out.push('\n');

    if !artifacts.is_empty() {
        out.push_str("## Prior artifacts\n\n");
        for (name, content) in artifacts {
            out.push_str(&format!("### {}\n\n{}\n\n", name, clip(content).trim_end()));
        }
    }

    if let Some(context) = &state.retry_context
        && context.target_phase == spec.id
    {
        out.push_str(&context.render());
        out.push('\n');
    }

    if let Some(feedback) = state.phase(&spec.id).and_then(|r| r.feedback.as_deref()) {
        out.push_str("## Reviewer feedback\n\nThe previous attempt at this phase was rejected:\n\n");
        out.push_str(feedback.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Completion protocol\n\n");
    match spec.gate {
        GatePolicy::Agent => out.push_str(
            "When the phase is done, evaluate your own work and emit \
             `<phase_complete verdict=\"pass\">rationale</phase_complete>` or \
             `<phase_complete verdict=\"fail\">rationale</phase_complete>`.\n",
        ),
        GatePolicy::Auto | GatePolicy::Human => out.push_str(
            "When the phase is done, emit `<phase_complete>summary of the result</phase_complete>`.\n",
        ),
    }
    out.push_str(
        "If you cannot continue without a human decision, emit \
         `<phase_blocked>what you need</phase_blocked>` instead.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use crate::retry::RetryContext;
    use crate::state::PhaseStatus;
    use crate::state::test_support::sample_state;
    use tempfile::tempdir;

    #[test]
    fn test_render_includes_retry_context_for_target_only() {
        let mut state = sample_state(&["implement", "test"]);
        state.retry_context = Some(RetryContext {
            failing_phase: "test".into(),
            target_phase: "implement".into(),
            attempt_number: 1,
            failure_summary: "assertion failed: left == right".into(),
            created_at: chrono::Utc::now(),
        });
        let implement = state.plan.get("implement").unwrap().clone();
        let test = state.plan.get("test").unwrap().clone();

        let prompt = render(&state, &implement, &[], 1);
        assert!(prompt.contains("## Retry Context"));
        assert!(prompt.contains("assertion failed"));
        assert!(prompt.contains("implement (pending) <- you are here"));

        let prompt = render(&state, &test, &[], 1);
        assert!(!prompt.contains("## Retry Context"));
    }

    #[test]
    fn test_render_feedback_and_agent_protocol() {
        let mut state = sample_state(&["review"]);
        state.phase_mut("review").unwrap().feedback = Some("Missing tests".into());
        let mut review = state.plan.get("review").unwrap().clone();
        review.gate = GatePolicy::Agent;
        let prompt = render(&state, &review, &[], 3);
        assert!(prompt.contains("Missing tests"));
        assert!(prompt.contains("verdict=\"pass\""));
        assert!(prompt.contains("iteration 3 of"));
    }

    #[test]
    fn test_prior_artifacts_from_done_phases() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let mut state = sample_state(&["spec", "implement", "test"]);
        store.write("TASK-001", "spec.md", "the spec").unwrap();
        store.write("TASK-001", "implement.md", "not finished").unwrap();
        state.phase_mut("spec").unwrap().status = PhaseStatus::Completed;

        let found = prior_artifacts(&store, &state, "test").unwrap();
        assert_eq!(found, [("spec.md".to_string(), "the spec".to_string())]);
        assert!(prior_artifacts(&store, &state, "spec").unwrap().is_empty());
    }
}
