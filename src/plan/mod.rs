//! Plan resolution: turning a task's weight and category into an ordered,
//! dependency-checked list of phases.
//!
//! - [`templates`] supplies the raw phase lists (built-in or from a directory)
//! - [`builder`] validates dependencies and fixes the execution order

pub mod builder;
pub mod templates;

use serde::{Deserialize, Serialize};

use crate::gates::GatePolicy;

pub use builder::{PlanOptions, resolve_plan};
pub use templates::{BuiltinPlans, DirPlanSource, PhaseTemplate, PlanSource, PlanTemplate};

/// Default iteration budget when neither template nor config sets one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// One phase of a resolved plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: String,
    pub gate: GatePolicy,
    pub max_iterations: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Files that, when present with real content, satisfy this phase.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Per-phase wall-clock limit overriding the configured default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PhaseSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            gate: GatePolicy::Auto,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            depends_on: Vec::new(),
            artifacts: Vec::new(),
            timeout_secs: None,
        }
    }
}

/// An immutable, validated phase sequence. Phases are stored in execution
/// order: every phase appears after all of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Template name the plan was resolved from.
    pub name: String,
    phases: Vec<PhaseSpec>,
}

impl Plan {
    pub(crate) fn from_ordered(name: String, phases: Vec<PhaseSpec>) -> Self {
        Self { name, phases }
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Position of a phase in execution order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.id.as_str())
    }
}
