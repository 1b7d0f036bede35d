//! Marker types produced by the sentinel scanner.

use serde::{Deserialize, Serialize};

/// Body of a completion marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Text between the opening and closing tags, trimmed.
    pub body: String,
    /// Value of a `verdict="..."` attribute on the opening tag, if present.
    #[serde(default)]
    pub verdict: Option<String>,
}

/// A marker that ends the current phase iteration loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sentinel {
    Complete(Completion),
    Blocked { reason: String },
}

impl Sentinel {
    pub fn is_complete(&self) -> bool {
        matches!(self, Sentinel::Complete(_))
    }
}
