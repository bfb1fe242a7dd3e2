use async_trait::async_trait;

use super::db::DbHandle;
use super::models::{
    MessageStatus, NewMessage, NewProject, Payload, Project, ProjectMessage, ProjectStatus,
};
use crate::errors::{FactoryError, FactoryResult};

pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Persistence for projects and their conversation messages.
///
/// Lookups by id return `ProjectNotFound` / `MessageNotFound` rather than
/// `Option` so callers can propagate with `?`.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create_project(&self, project: NewProject) -> FactoryResult<Project>;

    /// Fetch a project. When `owner` is given, a project owned by someone
    /// else is reported as missing.
    async fn get_project(&self, id: &str, owner: Option<&str>) -> FactoryResult<Project>;

    async fn list_projects(&self, owner: &str, limit: u32, offset: u32)
    -> FactoryResult<Vec<Project>>;

    async fn update_status(&self, id: &str, status: ProjectStatus) -> FactoryResult<Project>;

    async fn update_preview_url(&self, id: &str, preview_url: Option<&str>)
    -> FactoryResult<Project>;

    async fn update_prompt(&self, id: &str, prompt: &str) -> FactoryResult<Project>;

    async fn create_message(&self, message: NewMessage) -> FactoryResult<ProjectMessage>;

    async fn list_messages(&self, project_id: &str) -> FactoryResult<Vec<ProjectMessage>>;

    async fn get_message(&self, id: &str) -> FactoryResult<ProjectMessage>;

    async fn update_message_content(&self, id: &str, content: &str)
    -> FactoryResult<ProjectMessage>;

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        metadata: Option<Payload>,
    ) -> FactoryResult<ProjectMessage>;
}

/// `ProjectRepository` backed by the SQLite `DbHandle`.
#[derive(Clone)]
pub struct SqliteProjectRepository {
    db: DbHandle,
}

impl SqliteProjectRepository {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

fn project_missing(id: &str) -> FactoryError {
    FactoryError::ProjectNotFound { id: id.to_string() }
}

fn message_missing(id: &str) -> FactoryError {
    FactoryError::MessageNotFound { id: id.to_string() }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn create_project(&self, project: NewProject) -> FactoryResult<Project> {
        Ok(self.db.call(move |db| db.create_project(&project)).await?)
    }

    async fn get_project(&self, id: &str, owner: Option<&str>) -> FactoryResult<Project> {
        let key = id.to_string();
        let project = self
            .db
            .call(move |db| db.get_project(&key))
            .await?
            .ok_or_else(|| project_missing(id))?;
        match owner {
            Some(owner) if owner != project.user_id => Err(project_missing(id)),
            _ => Ok(project),
        }
    }

    async fn list_projects(
        &self,
        owner: &str,
        limit: u32,
        offset: u32,
    ) -> FactoryResult<Vec<Project>> {
        let owner = owner.to_string();
        Ok(self
            .db
            .call(move |db| db.list_projects(&owner, limit, offset))
            .await?)
    }

    async fn update_status(&self, id: &str, status: ProjectStatus) -> FactoryResult<Project> {
        let key = id.to_string();
        self.db
            .call(move |db| db.update_project_status(&key, status))
            .await?
            .ok_or_else(|| project_missing(id))
    }

    async fn update_preview_url(
        &self,
        id: &str,
        preview_url: Option<&str>,
    ) -> FactoryResult<Project> {
        let key = id.to_string();
        let url = preview_url.map(str::to_string);
        self.db
            .call(move |db| db.update_preview_url(&key, url.as_deref()))
            .await?
            .ok_or_else(|| project_missing(id))
    }

    async fn update_prompt(&self, id: &str, prompt: &str) -> FactoryResult<Project> {
        let key = id.to_string();
        let prompt = prompt.to_string();
        self.db
            .call(move |db| db.update_prompt(&key, &prompt))
            .await?
            .ok_or_else(|| project_missing(id))
    }

    async fn create_message(&self, message: NewMessage) -> FactoryResult<ProjectMessage> {
        let project_id = message.project_id.clone();
        let exists = {
            let key = project_id.clone();
            self.db.call(move |db| db.get_project(&key)).await?.is_some()
        };
        if !exists {
            return Err(project_missing(&project_id));
        }
        Ok(self.db.call(move |db| db.create_message(&message)).await?)
    }

    async fn list_messages(&self, project_id: &str) -> FactoryResult<Vec<ProjectMessage>> {
        let key = project_id.to_string();
        Ok(self.db.call(move |db| db.list_messages(&key)).await?)
    }

    async fn get_message(&self, id: &str) -> FactoryResult<ProjectMessage> {
        let key = id.to_string();
        self.db
            .call(move |db| db.get_message(&key))
            .await?
            .ok_or_else(|| message_missing(id))
    }

    async fn update_message_content(
        &self,
        id: &str,
        content: &str,
    ) -> FactoryResult<ProjectMessage> {
        let key = id.to_string();
        let content = content.to_string();
        self.db
            .call(move |db| db.update_message_content(&key, &content))
            .await?
            .ok_or_else(|| message_missing(id))
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        metadata: Option<Payload>,
    ) -> FactoryResult<ProjectMessage> {
        let key = id.to_string();
        self.db
            .call(move |db| db.update_message_status(&key, status, metadata.as_ref()))
            .await?
            .ok_or_else(|| message_missing(id))
    }
}
