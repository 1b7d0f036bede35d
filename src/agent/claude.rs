//! Agent adapter for the Claude CLI's `stream-json` output.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use super::{AgentChunk, AgentRequest, AgentRunner, AgentStream};
use crate::errors::AgentError;

/// Events from the CLI's stream-json output format. Only the fields the
/// engine needs are decoded.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

fn session(id: String) -> Option<String> {
    (!id.is_empty()).then_some(id)
}

/// Turn one stdout line into a chunk. Lines that are not stream-json are
/// passed through as plain text.
fn parse_line(line: &str) -> Result<Option<AgentChunk>, AgentError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let event = match serde_json::from_str::<StreamEvent>(line) {
        Ok(event) => event,
        Err(_) => return Ok(Some(AgentChunk::text(format!("{}\n", line)))),
    };
    match event {
        StreamEvent::Assistant {
            message,
            session_id,
        } => {
            let mut text = String::new();
            for block in message.content {
                if let ContentBlock::Text { text: t } = block {
                    text.push_str(&t);
                    text.push('\n');
                }
            }
            Ok(Some(AgentChunk {
                text,
                session_id: session(session_id),
            }))
        }
        StreamEvent::Result {
            is_error: true,
            result,
            ..
        } => Err(AgentError::Malformed(
            result.unwrap_or_else(|| "agent reported an error result".to_string()),
        )),
        // The final result repeats the assistant text already streamed.
        StreamEvent::Result { session_id, .. } => Ok(session(session_id).map(|id| AgentChunk {
            text: String::new(),
            session_id: Some(id),
        })),
        StreamEvent::Other => Ok(None),
    }
}

struct RunningAgent {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
}

/// Spawns the agent CLI once per iteration with the prompt on stdin.
pub struct ClaudeRunner {
    command: String,
    args: Vec<String>,
}

impl ClaudeRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(session_id) = &request.session_id {
            cmd.arg("--resume").arg(session_id);
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(&request.working_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Unavailable(format!("{}: {}", self.command, e)))?;

        tracing::debug!(
            task_id = %request.task_id,
            phase = %request.phase,
            iteration = request.iteration,
            pid = child.id().unwrap_or(0),
            "Agent process spawned"
        );

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| AgentError::Unavailable(format!("writing prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AgentError::Unavailable(format!("closing stdin: {}", e)))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Unavailable("agent stdout not captured".into()))?;
        let running = RunningAgent {
            lines: BufReader::new(stdout).lines(),
            child,
        };

        // The child lives inside the stream state, so dropping the stream
        // kills the process.
        let stream = futures::stream::unfold(Some(running), |state| async move {
            let mut state = state?;
            loop {
                match state.lines.next_line().await {
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), Some(state))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), None)),
                    },
                    Ok(None) => {
                        return match state.child.wait().await {
                            Ok(status) if status.success() => None,
                            Ok(status) => Some((
                                Err(AgentError::NonZeroExit {
                                    exit_code: status.code().unwrap_or(-1),
                                }),
                                None,
                            )),
                            Err(e) => Some((Err(AgentError::Unavailable(e.to_string())), None)),
                        };
                    }
                    Err(e) => {
                        return Some((
                            Err(AgentError::Malformed(format!("reading agent output: {}", e))),
                            None,
                        ));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
