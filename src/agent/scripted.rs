//! Deterministic agent that replays scripted responses.
//!
//! A script maps phase ids to the responses returned on successive
//! invocations of that phase. The last response repeats once a phase's list
//! runs out, and `"*"` supplies responses for phases without their own entry.
//!
//! ```yaml
//! spec:
//!   - "Wrote the spec. <phase_complete/>"
//! test:
//!   - output: "2 tests failed"
//!     exit_code: 1
//!   - "All green <phase_complete/>"
//! "*":
//!   - "<phase_complete/>"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{AgentChunk, AgentRequest, AgentRunner, AgentStream};
use crate::errors::AgentError;

const WILDCARD: &str = "*";

/// Output is delivered in pieces of this many characters so sentinels
/// regularly straddle chunk boundaries.
const CHUNK_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    Say(String),
    Detailed {
        #[serde(default)]
        output: String,
        /// Fail the invocation after streaming `output`.
        #[serde(default)]
        exit_code: Option<i32>,
        /// Wait before producing any output.
        #[serde(default)]
        delay_ms: u64,
    },
}

impl ScriptStep {
    fn parts(&self) -> (&str, Option<i32>, u64) {
        match self {
            ScriptStep::Say(output) => (output, None, 0),
            ScriptStep::Detailed {
                output,
                exit_code,
                delay_ms,
            } => (output, *exit_code, *delay_ms),
        }
    }
}

/// A record of one invocation, for inspection after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub task_id: String,
    pub phase: String,
    pub iteration: u32,
    pub prompt: String,
}

#[derive(Default)]
struct Replay {
    cursors: HashMap<String, usize>,
    log: Vec<Invocation>,
}

pub struct ScriptedAgent {
    script: HashMap<String, Vec<ScriptStep>>,
    replay: Mutex<Replay>,
}

impl ScriptedAgent {
    pub fn new(script: HashMap<String, Vec<ScriptStep>>) -> Self {
        Self {
            script,
            replay: Mutex::new(Replay::default()),
        }
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let script: HashMap<String, Vec<ScriptStep>> =
            serde_yaml::from_str(yaml).context("Failed to parse replay script")?;
        Ok(Self::new(script))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay script: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Builder-style helper for tests and embedding.
    pub fn with_phase(mut self, phase: &str, steps: Vec<ScriptStep>) -> Self {
        self.script.insert(phase.to_string(), steps);
        self
    }

    /// Every invocation so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .clone()
    }

    /// Phase ids in invocation order.
    pub fn phase_sequence(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.phase).collect()
    }

    fn next_step(&self, request: &AgentRequest) -> Option<ScriptStep> {
        let key = if self.script.contains_key(&request.phase) {
            request.phase.as_str()
        } else {
            WILDCARD
        };
        let steps = self.script.get(key).filter(|s| !s.is_empty())?;

        let mut replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
        replay.log.push(Invocation {
            task_id: request.task_id.clone(),
            phase: request.phase.clone(),
            iteration: request.iteration,
            prompt: request.prompt.clone(),
        });
        let cursor = replay.cursors.entry(request.phase.clone()).or_insert(0);
        let step = steps[(*cursor).min(steps.len() - 1)].clone();
        *cursor += 1;
        Some(step)
    }
}

fn split_chunks(output: &str) -> Vec<String> {
    let chars: Vec<char> = output.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        let step = self.next_step(&request).ok_or_else(|| {
            AgentError::Unavailable(format!("no scripted response for phase '{}'", request.phase))
        })?;
        let (output, exit_code, delay_ms) = step.parts();

        let mut items: Vec<Result<AgentChunk, AgentError>> =
            split_chunks(output).into_iter().map(|c| Ok(AgentChunk::text(c))).collect();
        if let Some(exit_code) = exit_code {
            items.push(Err(AgentError::NonZeroExit { exit_code }));
        }

        let delay = Duration::from_millis(delay_ms);
        let stream = futures::stream::once(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            futures::stream::iter(items)
        });
        Ok(Box::pin(futures::StreamExt::flatten(stream)))
    }
}
