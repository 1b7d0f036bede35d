//! Plan templates: the raw phase lists each task weight starts from.
//!
//! Built-in templates are embedded YAML. A [`DirPlanSource`] lets a project
//! override them with files named `<weight>-<category>.yaml` or
//! `<weight>.yaml`:
//!
//! ```yaml
//! name: medium
//! phases:
//!   - id: spec
//!     artifacts: [spec.md]
//!   - id: implement
//!     max_iterations: 30
//!   - id: merge
//!     gate: human
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::PlanError;
use crate::gates::GatePolicy;
use crate::task::{Category, Weight};

const TRIVIAL: &str = include_str!("templates/trivial.yaml");
const SMALL: &str = include_str!("templates/small.yaml");
const MEDIUM: &str = include_str!("templates/medium.yaml");
const LARGE: &str = include_str!("templates/large.yaml");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: String,
    #[serde(default)]
    pub gate: GatePolicy,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// `None` means "depends on the previous phase".
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTemplate {
    pub name: String,
    pub phases: Vec<PhaseTemplate>,
}

impl PlanTemplate {
    pub fn parse(yaml: &str) -> Result<Self, PlanError> {
        serde_yaml::from_str(yaml).map_err(|e| PlanError::Template(e.to_string()))
    }

    /// Build a linear template from bare phase ids, all with `auto` gates.
    pub fn linear(name: &str, ids: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            phases: ids
                .iter()
                .map(|id| PhaseTemplate {
                    id: id.to_string(),
                    ..PhaseTemplate::default()
                })
                .collect(),
        }
    }
}

/// Maps a task's weight and category to a phase template.
pub trait PlanSource: Send + Sync {
    fn template(&self, weight: Weight, category: Category) -> Result<PlanTemplate, PlanError>;
}

/// The embedded default templates.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPlans;

impl PlanSource for BuiltinPlans {
    fn template(&self, weight: Weight, _category: Category) -> Result<PlanTemplate, PlanError> {
        let yaml = match weight {
            Weight::Trivial => TRIVIAL,
            Weight::Small => SMALL,
            Weight::Medium => MEDIUM,
            Weight::Large => LARGE,
        };
        PlanTemplate::parse(yaml)
    }
}

/// Templates loaded from a directory, falling back to the built-ins.
#[derive(Debug, Clone)]
pub struct DirPlanSource {
    dir: PathBuf,
}

impl DirPlanSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PlanSource for DirPlanSource {
    fn template(&self, weight: Weight, category: Category) -> Result<PlanTemplate, PlanError> {
        let candidates = [
            self.dir
                .join(format!("{}-{}.yaml", weight.as_str(), category.as_str())),
            self.dir.join(format!("{}.yaml", weight.as_str())),
        ];
        for path in &candidates {
            match std::fs::read_to_string(path) {
                Ok(yaml) => {
                    tracing::debug!(path = %path.display(), "Using plan template override");
                    return PlanTemplate::parse(&yaml).map_err(|e| match e {
                        PlanError::Template(msg) => {
                            PlanError::Template(format!("{}: {}", path.display(), msg))
                        }
                        other => other,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(PlanError::Template(format!("{}: {}", path.display(), e)));
                }
            }
        }
        BuiltinPlans.template(weight, category)
    }
}
