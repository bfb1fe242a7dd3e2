use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form JSON object carried by projects, events and messages.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Running,
    Ready,
    Failed,
    Canceled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Canceled)
    }

    /// Transition table for the project lifecycle.
    ///
    /// A terminal project may be moved back to `pending` when a new run is
    /// requested; `running` can never be re-entered from `running`.
    pub fn can_transition_to(&self, to: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Canceled)
                | (Pending, Pending)
                | (Running, Ready)
                | (Running, Failed)
                | (Running, Canceled)
                | (Ready, Pending)
                | (Failed, Pending)
                | (Canceled, Pending)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectEventType {
    ProjectCreated,
    StatusUpdated,
    LogAppended,
    PreviewReady,
    Error,
    AssistantMessage,
    ToolUse,
    ResultMessage,
}

impl ProjectEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::StatusUpdated => "status_updated",
            Self::LogAppended => "log_appended",
            Self::PreviewReady => "preview_ready",
            Self::Error => "error",
            Self::AssistantMessage => "assistant_message",
            Self::ToolUse => "tool_use",
            Self::ResultMessage => "result_message",
        }
    }
}

impl std::fmt::Display for ProjectEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_created" => Ok(Self::ProjectCreated),
            "status_updated" => Ok(Self::StatusUpdated),
            "log_appended" => Ok(Self::LogAppended),
            "preview_ready" => Ok(Self::PreviewReady),
            "error" => Ok(Self::Error),
            "assistant_message" => Ok(Self::AssistantMessage),
            "tool_use" => Ok(Self::ToolUse),
            "result_message" => Ok(Self::ResultMessage),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Complete,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub prompt: String,
    pub status: ProjectStatus,
    pub project_dir: String,
    pub template: Option<String>,
    pub preview_url: Option<String>,
    pub metadata: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for persisting a new project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: String,
    pub user_id: String,
    pub prompt: String,
    pub project_dir: String,
    pub template: Option<String>,
    pub metadata: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectEvent {
    pub project_id: String,
    #[serde(rename = "type")]
    pub event_type: ProjectEventType,
    pub message: Option<String>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl ProjectEvent {
    pub fn new(
        project_id: &str,
        event_type: ProjectEventType,
        message: Option<String>,
        payload: Payload,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            event_type,
            message,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A plain `log_appended` line with an empty payload.
    pub fn log(project_id: &str, message: impl Into<String>) -> Self {
        Self::new(
            project_id,
            ProjectEventType::LogAppended,
            Some(message.into()),
            Payload::new(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMessage {
    pub id: String,
    pub project_id: String,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub content: String,
    pub parent_id: Option<String>,
    pub metadata: Option<Payload>,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for appending a message to a project's conversation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub project_id: String,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub content: String,
    pub parent_id: Option<String>,
    pub metadata: Option<Payload>,
}

/// One entry of a workspace listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Build a payload map from `(key, value)` pairs.
pub fn payload<I, K>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
