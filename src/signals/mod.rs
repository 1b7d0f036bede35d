//! Sentinel markers emitted by the agent.
//!
//! The agent ends a phase by writing one of two markers into its output:
//!
//! - `<phase_complete>...</phase_complete>` - the phase is done. The body may
//!   carry a self-evaluation verdict for `agent` gates.
//! - `<phase_blocked>reason</phase_blocked>` - the phase needs human input.
//!
//! Output arrives in arbitrary chunks, so markers are found with an
//! incremental [`SentinelScanner`] rather than by matching whole responses.

mod scanner;
mod types;

pub use scanner::SentinelScanner;
pub use types::{Completion, Sentinel};
