//! Generation backends.
//!
//! A run asks [`BackendSelection::probe`] once which backend to use. The
//! agent-backed path streams [`AgentMessage`]s while it works and reports a
//! [`GenerationOutcome`]; anything other than a completed outcome with a
//! preview path sends the orchestrator to the local fallback generator.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Token accounting reported with a terminal result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

/// A structured message streamed by an agent backend while it works.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    AssistantText {
        text: String,
        model: Option<String>,
        stop_reason: Option<String>,
    },
    ToolUse {
        id: Option<String>,
        name: String,
        input: Value,
    },
    Result {
        total_cost_usd: Option<f64>,
        stop_reason: Option<String>,
        usage: Usage,
    },
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub workspace_root: PathBuf,
    pub template: Option<String>,
}

/// Normalized result of an agent generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed { preview_path: Option<String> },
    Unavailable { reason: String },
    Failed { reason: String },
}

/// An agent that writes a project into a workspace.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Run generation, pushing intermediate messages into `events`.
    /// Send errors on `events` are ignored.
    async fn generate(
        &self,
        request: &GenerationRequest,
        events: mpsc::UnboundedSender<AgentMessage>,
    ) -> GenerationOutcome;
}

/// Which generator a run will use, decided once at run start.
pub enum BackendSelection {
    Agent(Arc<dyn GenerationBackend>),
    Fallback { reason: String },
}

impl BackendSelection {
    pub fn probe(agent: Option<&Arc<dyn GenerationBackend>>) -> Self {
        match agent {
            Some(backend) if backend.is_available() => Self::Agent(Arc::clone(backend)),
            _ => Self::Fallback {
                reason: "Claude service unavailable or not configured.".to_string(),
            },
        }
    }
}

// ── Claude CLI backend ────────────────────────────────────────────────

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Entry point the agent is told to produce.
const AGENT_PREVIEW_PATH: &str = "index.html";

/// Build the instruction text sent to the agent.
pub fn compose_prompt(prompt: &str, template: Option<&str>) -> String {
    let base = "You are a software engineer. \
        Always scaffold the project non-interactively with \
        'pnpm create vite <project-name> --template react --no-interactive'. \
        After scaffolding, run `pnpm install` to install dependencies. \
        Only change the code needed to fulfil the user's instructions. \
        Run `pnpm run build` to build the project; the task is complete when it succeeds.";
    match template {
        Some(t) if !t.trim().is_empty() => format!(
            "{}\nModify the generated {} application to satisfy the request below, \
             following Vite + React conventions.\nUser prompt: {}",
            base, t, prompt
        ),
        _ => format!("{}\nUser prompt: {}", base, prompt),
    }
}

/// One line of `claude --output-format stream-json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamLine {
    #[serde(rename = "assistant")]
    Assistant { message: StreamAssistant },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        stop_reason: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamAssistant {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(other)]
    Other,
}

/// Map a stream-json line to agent messages.
///
/// Tool invocations come first, followed by one `AssistantText` holding the
/// message's text blocks joined by newlines. Non-JSON and unknown lines map
/// to nothing.
pub fn parse_stream_line(line: &str) -> Vec<AgentMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Vec::new();
    }
    let Ok(parsed) = serde_json::from_str::<StreamLine>(trimmed) else {
        return Vec::new();
    };

    match parsed {
        StreamLine::Assistant { message } => {
            let mut out = Vec::new();
            let mut texts = Vec::new();
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => texts.push(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        out.push(AgentMessage::ToolUse { id, name, input })
                    }
                    ContentBlock::Other => {}
                }
            }
            if !texts.is_empty() {
                out.push(AgentMessage::AssistantText {
                    text: texts.join("\n"),
                    model: message.model,
                    stop_reason: message.stop_reason,
                });
            }
            out
        }
        StreamLine::Result {
            total_cost_usd,
            stop_reason,
            usage,
        } => vec![AgentMessage::Result {
            total_cost_usd,
            stop_reason,
            usage: usage.unwrap_or_default(),
        }],
        StreamLine::Other => Vec::new(),
    }
}

/// Last `max` characters of `text`.
fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

/// Drives the `claude` CLI in print mode inside the workspace.
pub struct ClaudeCliBackend {
    command: String,
    timeout: Duration,
    enabled: bool,
}

impl ClaudeCliBackend {
    pub fn new(command: impl Into<String>, timeout: Duration, enabled: bool) -> Self {
        Self {
            command: command.into(),
            timeout,
            enabled,
        }
    }

    fn args(prompt: &str) -> Vec<String> {
        [
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
            "-p",
            prompt,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[async_trait]
impl GenerationBackend for ClaudeCliBackend {
    fn name(&self) -> &str {
        "claude"
    }

    fn is_available(&self) -> bool {
        self.enabled
            && std::env::var("ANTHROPIC_API_KEY").is_ok_and(|key| !key.trim().is_empty())
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        events: mpsc::UnboundedSender<AgentMessage>,
    ) -> GenerationOutcome {
        if !self.is_available() {
            return GenerationOutcome::Unavailable {
                reason: "Claude API key is not configured".to_string(),
            };
        }

        let prompt = compose_prompt(&request.prompt, request.template.as_deref());
        let mut child = match Command::new(&self.command)
            .args(Self::args(&prompt))
            .current_dir(&request.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return GenerationOutcome::Unavailable {
                    reason: format!("failed to spawn {}: {}", self.command, e),
                };
            }
        };

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return GenerationOutcome::Failed {
                reason: "failed to capture claude output".to_string(),
            };
        };
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let stream = async {
            // Raw lines: one undecodable byte must not stop the drain and
            // leave the child blocked on a full pipe.
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        for message in parse_stream_line(text.trim_end()) {
                            let _ = events.send(message);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read claude output");
                        break;
                    }
                }
            }
            drop(reader);
            child.wait().await
        };

        let waited = tokio::time::timeout(self.timeout, stream).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return GenerationOutcome::Failed {
                    reason: format!("failed to wait for claude: {}", e),
                };
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill timed out claude process");
                }
                let _ = child.wait().await;
                stderr_task.abort();
                return GenerationOutcome::Failed {
                    reason: format!("timed out after {} seconds", self.timeout.as_secs()),
                };
            }
        };

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            let detail = tail(stderr.trim(), 500);
            let code = status.code().unwrap_or(-1);
            let reason = if detail.is_empty() {
                format!("claude exited with code {}", code)
            } else {
                format!("claude exited with code {}: {}", code, detail)
            };
            return GenerationOutcome::Failed { reason };
        }

        GenerationOutcome::Completed {
            preview_path: Some(AGENT_PREVIEW_PATH.to_string()),
        }
    }
}
