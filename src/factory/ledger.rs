use std::sync::Arc;

use super::models::{MessageRole, MessageStatus, NewMessage, Payload, ProjectMessage};
use super::repository::ProjectRepository;
use crate::errors::{FactoryError, FactoryResult};

/// Joiner placed between existing content and an appended chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `"\n"`, used for streamed assistant text.
    Line,
    /// `"\n\n"`, used for tool notices and fallback notes.
    Paragraph,
}

impl Separator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "\n",
            Self::Paragraph => "\n\n",
        }
    }
}

/// Tracks the assistant message a run writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCursor {
    pub message_id: String,
    pub finalized: bool,
}

impl LedgerCursor {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            finalized: false,
        }
    }
}

fn join_content(existing: &str, text: &str, separator: Separator) -> String {
    if existing.is_empty() {
        text.to_string()
    } else {
        format!("{}{}{}", existing, separator.as_str(), text)
            .trim_end()
            .to_string()
    }
}

/// Ordered, per-project conversation log.
///
/// Messages are append-only: content grows by `append_content` while the
/// message is pending, and `finalize` moves it to a terminal status once.
#[derive(Clone)]
pub struct MessageLedger {
    repo: Arc<dyn ProjectRepository>,
}

impl MessageLedger {
    pub fn new(repo: Arc<dyn ProjectRepository>) -> Self {
        Self { repo }
    }

    pub async fn create_message(
        &self,
        project_id: &str,
        role: MessageRole,
        status: MessageStatus,
        content: impl Into<String>,
        parent_id: Option<String>,
        metadata: Option<Payload>,
    ) -> FactoryResult<ProjectMessage> {
        self.repo
            .create_message(NewMessage {
                project_id: project_id.to_string(),
                role,
                status,
                content: content.into(),
                parent_id,
                metadata,
            })
            .await
    }

    pub async fn list(&self, project_id: &str) -> FactoryResult<Vec<ProjectMessage>> {
        self.repo.list_messages(project_id).await
    }

    /// Append `text` to a pending message.
    ///
    /// Blank text changes nothing. Terminal messages are returned as stored.
    /// Returns `None` when the message does not exist.
    pub async fn append_content(
        &self,
        message_id: &str,
        text: &str,
        separator: Separator,
    ) -> FactoryResult<Option<ProjectMessage>> {
        let message = match self.repo.get_message(message_id).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if text.trim().is_empty() || message.status.is_terminal() {
            return Ok(Some(message));
        }
        let content = join_content(&message.content, text, separator);
        self.repo
            .update_message_content(message_id, &content)
            .await
            .map(Some)
    }

    /// Move a message to `complete` or `error`, merging `metadata` into
    /// what is stored. A message that is already terminal is left alone.
    pub async fn finalize(
        &self,
        message_id: &str,
        status: MessageStatus,
        metadata: Option<Payload>,
    ) -> FactoryResult<ProjectMessage> {
        if !status.is_terminal() {
            return Err(FactoryError::BadRequest(format!(
                "cannot finalize message with status '{}'",
                status
            )));
        }
        let message = self.repo.get_message(message_id).await?;
        if message.status.is_terminal() {
            return Ok(message);
        }
        let merged = match (message.metadata, metadata) {
            (existing, None) => existing,
            (None, Some(extra)) => Some(extra),
            (Some(mut existing), Some(extra)) => {
                existing.extend(extra);
                Some(existing)
            }
        };
        self.repo
            .update_message_status(message_id, status, merged)
            .await
    }

    /// Append through a cursor, skipping once the cursor has been finalized.
    pub async fn append(
        &self,
        cursor: &LedgerCursor,
        text: &str,
        separator: Separator,
    ) -> FactoryResult<()> {
        if !cursor.finalized {
            self.append_content(&cursor.message_id, text, separator).await?;
        }
        Ok(())
    }

    /// Finalize through a cursor unless it already was.
    pub async fn finalize_once(
        &self,
        cursor: &mut LedgerCursor,
        status: MessageStatus,
        metadata: Option<Payload>,
    ) -> FactoryResult<()> {
        if cursor.finalized {
            return Ok(());
        }
        self.finalize(&cursor.message_id, status, metadata).await?;
        cursor.finalized = true;
        Ok(())
    }
}
