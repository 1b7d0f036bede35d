//! Plan builder: validates a phase template and orders it topologically.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::errors::PlanError;
use crate::gates::GatePolicy;

use super::templates::PlanTemplate;
use super::{DEFAULT_MAX_ITERATIONS, PhaseSpec, Plan};

/// Settings that adjust a template while it is resolved.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub default_max_iterations: u32,
    /// Per-phase gate overrides, keyed by phase id.
    pub gate_overrides: HashMap<String, GatePolicy>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            gate_overrides: HashMap::new(),
        }
    }
}

/// Resolve a template into a validated [`Plan`].
///
/// Phases without an explicit `depends_on` depend on the phase listed just
/// before them. The result is a stable topological order: among phases whose
/// dependencies are all satisfied, template order wins.
pub fn resolve_plan(template: &PlanTemplate, options: &PlanOptions) -> Result<Plan, PlanError> {
    if template.phases.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut index_map: HashMap<&str, usize> = HashMap::new();
    for (i, phase) in template.phases.iter().enumerate() {
        if index_map.insert(phase.id.as_str(), i).is_some() {
            return Err(PlanError::DuplicatePhase(phase.id.clone()));
        }
    }

    let mut specs = Vec::with_capacity(template.phases.len());
    for (i, phase) in template.phases.iter().enumerate() {
        let depends_on = match &phase.depends_on {
            Some(deps) => deps.clone(),
            None if i > 0 => vec![template.phases[i - 1].id.clone()],
            None => Vec::new(),
        };
        let gate = options
            .gate_overrides
            .get(&phase.id)
            .copied()
            .unwrap_or(phase.gate);
        specs.push(PhaseSpec {
            id: phase.id.clone(),
            gate,
            max_iterations: phase
                .max_iterations
                .unwrap_or(options.default_max_iterations)
                .max(1),
            depends_on,
            artifacts: phase.artifacts.clone(),
            timeout_secs: phase.timeout_secs,
        });
    }

    // Edges: reverse[to] = deps of `to`, forward[from] = dependents of `from`.
    let mut forward: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    let mut in_degree: Vec<usize> = vec![0; specs.len()];
    for (to, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            let from = *index_map
                .get(dep.as_str())
                .ok_or_else(|| PlanError::UnknownDependency {
                    phase: spec.id.clone(),
                    dependency: dep.clone(),
                })?;
            forward[from].push(to);
            in_degree[to] += 1;
        }
    }

    // Kahn's algorithm with a min-heap so ties resolve in template order.
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(specs.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dependent in &forward[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() != specs.len() {
        let cycle: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| specs[i].id.clone())
            .collect();
        return Err(PlanError::Cycle(cycle));
    }

    let mut slots: Vec<Option<PhaseSpec>> = specs.into_iter().map(Some).collect();
    let ordered = order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();
    Ok(Plan::from_ordered(template.name.clone(), ordered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PhaseTemplate;

    fn template(phases: Vec<PhaseTemplate>) -> PlanTemplate {
        PlanTemplate {
            name: "test".into(),
            phases,
        }
    }

    fn phase(id: &str, deps: Option<&[&str]>) -> PhaseTemplate {
        PhaseTemplate {
            id: id.into(),
            depends_on: deps.map(|d| d.iter().map(|s| s.to_string()).collect()),
            ..PhaseTemplate::default()
        }
    }

    #[test]
    fn test_linear_chain_by_default() {
        let plan = resolve_plan(
            &template(vec![phase("spec", None), phase("implement", None), phase("test", None)]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.ids().collect::<Vec<_>>(), ["spec", "implement", "test"]);
        assert_eq!(plan.get("test").unwrap().depends_on, ["implement"]);
        assert!(plan.get("spec").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_reorders_to_respect_dependencies() {
        let plan = resolve_plan(
            &template(vec![
                phase("docs", Some(&["implement"])),
                phase("implement", Some(&["spec"])),
                phase("spec", Some(&[])),
            ]),
            &PlanOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.ids().collect::<Vec<_>>(), ["spec", "implement", "docs"]);
    }

    #[test]
    fn test_every_phase_follows_its_dependencies() {
        let plan = resolve_plan(
            &template(vec![
                phase("e", Some(&["c", "d"])),
                phase("d", Some(&["a"])),
                phase("c", Some(&["b"])),
                phase("b", Some(&["a"])),
                phase("a", Some(&[])),
            ]),
            &PlanOptions::default(),
        )
        .unwrap();
        for (pos, spec) in plan.phases().iter().enumerate() {
            for dep in &spec.depends_on {
                assert!(plan.position(dep).unwrap() < pos, "{} before {}", dep, spec.id);
            }
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let err = resolve_plan(
            &template(vec![phase("test", Some(&["build"]))]),
            &PlanOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownDependency {
                phase: "test".into(),
                dependency: "build".into()
            }
        );
    }

    #[test]
    fn test_duplicate_phase() {
        let err = resolve_plan(
            &template(vec![phase("spec", None), phase("spec", None)]),
            &PlanOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::DuplicatePhase("spec".into()));
    }

    #[test]
    fn test_cycle_detected() {
        let err = resolve_plan(
            &template(vec![
                phase("a", Some(&["c"])),
                phase("b", Some(&["a"])),
                phase("c", Some(&["b"])),
            ]),
            &PlanOptions::default(),
        )
        .unwrap_err();
        match err {
            PlanError::Cycle(ids) => assert_eq!(ids.len(), 3),
            other => panic!("Expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_plan() {
        assert_eq!(
            resolve_plan(&template(vec![]), &PlanOptions::default()).unwrap_err(),
            PlanError::Empty
        );
    }

    #[test]
    fn test_gate_overrides_and_iteration_default() {
        let mut options = PlanOptions {
            default_max_iterations: 7,
            ..PlanOptions::default()
        };
        options
            .gate_overrides
            .insert("merge".into(), GatePolicy::Human);
        let mut merge = phase("merge", None);
        merge.max_iterations = Some(3);
        let plan = resolve_plan(&template(vec![phase("implement", None), merge]), &options).unwrap();
        assert_eq!(plan.get("implement").unwrap().max_iterations, 7);
        assert_eq!(plan.get("merge").unwrap().max_iterations, 3);
        assert_eq!(plan.get("merge").unwrap().gate, GatePolicy::Human);
        assert_eq!(plan.get("implement").unwrap().gate, GatePolicy::Auto);
    }
}
