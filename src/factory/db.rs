use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FactoryDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct FactoryDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str =
    "id, user_id, prompt, status, project_dir, template, preview_url, metadata, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, project_id, role, status, content, parent_id, metadata, sequence, created_at, updated_at";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    project_dir TEXT NOT NULL,
                    template TEXT,
                    preview_url TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS project_messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    status TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    parent_id TEXT,
                    metadata TEXT,
                    sequence INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(project_id, sequence)
                );

                CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_project_messages_project ON project_messages(project_id, sequence);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(&self, project: &NewProject) -> Result<Project> {
        let ts = now();
        let metadata =
            serde_json::to_string(&project.metadata).context("Failed to encode project metadata")?;
        self.conn
            .execute(
                "INSERT INTO projects (id, user_id, prompt, status, project_dir, template, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    project.id,
                    project.user_id,
                    project.prompt,
                    ProjectStatus::Pending.as_str(),
                    project.project_dir,
                    project.template,
                    metadata,
                    ts,
                ],
            )
            .context("Failed to insert project")?;
        self.get_project(&project.id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Projects owned by `user_id`, newest first.
    pub fn list_projects(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM projects WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                PROJECT_COLUMNS
            ))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![user_id, limit, offset], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn update_project_status(&self, id: &str, status: ProjectStatus) -> Result<Option<Project>> {
        self.conn
            .execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now(), id],
            )
            .context("Failed to update project status")?;
        self.get_project(id)
    }

    pub fn update_preview_url(&self, id: &str, preview_url: Option<&str>) -> Result<Option<Project>> {
        self.conn
            .execute(
                "UPDATE projects SET preview_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![preview_url, now(), id],
            )
            .context("Failed to update preview url")?;
        self.get_project(id)
    }

    pub fn update_prompt(&self, id: &str, prompt: &str) -> Result<Option<Project>> {
        self.conn
            .execute(
                "UPDATE projects SET prompt = ?1, updated_at = ?2 WHERE id = ?3",
                params![prompt, now(), id],
            )
            .context("Failed to update project prompt")?;
        self.get_project(id)
    }

    // ── Message CRUD ──────────────────────────────────────────────────

    /// Insert a message with the next per-project sequence number.
    pub fn create_message(&self, message: &NewMessage) -> Result<ProjectMessage> {
        let id = Uuid::new_v4().simple().to_string();
        let ts = now();
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode message metadata")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin message transaction")?;
        let sequence: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM project_messages WHERE project_id = ?1",
                params![message.project_id],
                |row| row.get(0),
            )
            .context("Failed to compute message sequence")?;
        tx.execute(
            "INSERT INTO project_messages (id, project_id, role, status, content, parent_id, metadata, sequence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                message.project_id,
                message.role.as_str(),
                message.status.as_str(),
                message.content,
                message.parent_id,
                metadata,
                sequence,
                ts,
            ],
        )
        .context("Failed to insert message")?;
        tx.commit().context("Failed to commit message")?;

        self.get_message(&id)?
            .context("Message not found after insert")
    }

    /// Messages for a project in sequence order.
    pub fn list_messages(&self, project_id: &str) -> Result<Vec<ProjectMessage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM project_messages WHERE project_id = ?1 ORDER BY sequence ASC",
                MESSAGE_COLUMNS
            ))
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![project_id], MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(messages)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<ProjectMessage>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM project_messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                MessageRow::from_row,
            )
            .optional()
            .context("Failed to query message")?;
        row.map(MessageRow::into_message).transpose()
    }

    pub fn update_message_content(&self, id: &str, content: &str) -> Result<Option<ProjectMessage>> {
        self.conn
            .execute(
                "UPDATE project_messages SET content = ?1, updated_at = ?2 WHERE id = ?3",
                params![content, now(), id],
            )
            .context("Failed to update message content")?;
        self.get_message(id)
    }

    /// Set the status and, when given, replace the stored metadata.
    pub fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        metadata: Option<&Payload>,
    ) -> Result<Option<ProjectMessage>> {
        match metadata {
            Some(meta) => {
                let encoded =
                    serde_json::to_string(meta).context("Failed to encode message metadata")?;
                self.conn
                    .execute(
                        "UPDATE project_messages SET status = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
                        params![status.as_str(), encoded, now(), id],
                    )
                    .context("Failed to update message status")?;
            }
            None => {
                self.conn
                    .execute(
                        "UPDATE project_messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                        params![status.as_str(), now(), id],
                    )
                    .context("Failed to update message status")?;
            }
        }
        self.get_message(id)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

/// Intermediate row struct for projects before converting the status,
/// metadata and timestamp strings into typed values.
struct ProjectRow {
    id: String,
    user_id: String,
    prompt: String,
    status: String,
    project_dir: String,
    template: Option<String>,
    preview_url: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            prompt: row.get(2)?,
            status: row.get(3)?,
            project_dir: row.get(4)?,
            template: row.get(5)?,
            preview_url: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let status = ProjectStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse project status")?;
        let metadata: Payload =
            serde_json::from_str(&self.metadata).context("Failed to parse project metadata JSON")?;
        Ok(Project {
            id: self.id,
            user_id: self.user_id,
            prompt: self.prompt,
            status,
            project_dir: self.project_dir,
            template: self.template,
            preview_url: self.preview_url,
            metadata,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for project_messages.
struct MessageRow {
    id: String,
    project_id: String,
    role: String,
    status: String,
    content: String,
    parent_id: Option<String>,
    metadata: Option<String>,
    sequence: i64,
    created_at: String,
    updated_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            role: row.get(2)?,
            status: row.get(3)?,
            content: row.get(4)?,
            parent_id: row.get(5)?,
            metadata: row.get(6)?,
            sequence: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<ProjectMessage> {
        let role = MessageRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message role")?;
        let status = MessageStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message status")?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<Payload>)
            .transpose()
            .context("Failed to parse message metadata JSON")?;
        Ok(ProjectMessage {
            id: self.id,
            project_id: self.project_id,
            role,
            status,
            content: self.content,
            parent_id: self.parent_id,
            metadata,
            sequence: self.sequence,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
