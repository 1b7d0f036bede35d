//! External coding agent invocation.
//!
//! The executor hands a rendered prompt to an [`AgentRunner`] and consumes
//! the returned [`AgentStream`] chunk by chunk, scanning for sentinels as the
//! text arrives. Dropping the stream must stop the agent.

pub mod claude;
pub mod scripted;

use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::AgentError;

pub use claude::ClaudeRunner;
pub use scripted::{Invocation, ScriptStep, ScriptedAgent};

/// One agent iteration for one phase.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub phase: String,
    pub iteration: u32,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Session to continue, when the agent reported one earlier.
    pub session_id: Option<String>,
}

/// A piece of agent output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentChunk {
    pub text: String,
    /// Set when the agent announces (or changes) its session.
    pub session_id: Option<String>,
}

impl AgentChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
        }
    }
}

pub type AgentStream = BoxStream<'static, Result<AgentChunk, AgentError>>;

/// Abstraction over the agent process for testability.
/// Real implementation: [`ClaudeRunner`]. Deterministic double: [`ScriptedAgent`].
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentStream, AgentError>;
}
