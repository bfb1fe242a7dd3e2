//! Project lifecycle and the background generation run.
//!
//! `ProjectOrchestrator` is the only component that moves a project's
//! status. A run is claimed in the [`RunRegistry`] before anything is
//! written, which is what makes a second `start_run` on the same project a
//! `Conflict` instead of a second writer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::build_pipeline::PostGenerationPipeline;
use super::events::{EventBus, Subscription};
use super::fallback::FallbackGenerator;
use super::generation::{
    AgentMessage, BackendSelection, GenerationBackend, GenerationOutcome, GenerationRequest,
};
use super::ledger::{LedgerCursor, MessageLedger, Separator};
use super::models::{
    FileEntry, MessageRole, MessageStatus, NewProject, Payload, Project, ProjectEvent,
    ProjectEventType, ProjectMessage, ProjectStatus, payload,
};
use super::preview::build_preview_url;
use super::repository::ProjectRepository;
use super::tasks::{RunRegistry, RunTicket};
use super::workspace::{self, WorkspaceProvisioner};
use crate::errors::{FactoryError, FactoryResult};

const FALLBACK_NOTE: &str = "Falling back to local scaffold generator.";

/// Options for one generation run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Replaces the stored prompt before generating.
    pub prompt_override: Option<String>,
    /// Content of a user turn recorded once the run slot is claimed. It
    /// becomes the assistant's parent and, absent an override, the prompt.
    pub user_content: Option<String>,
    /// Existing user message the assistant reply is threaded under.
    pub user_message_id: Option<String>,
    /// Initial content of the assistant message.
    pub assistant_intro: Option<String>,
}

/// Collaborators handed to [`ProjectOrchestrator::new`].
pub struct OrchestratorParts {
    pub repo: Arc<dyn ProjectRepository>,
    pub bus: Arc<EventBus>,
    pub provisioner: WorkspaceProvisioner,
    pub pipeline: PostGenerationPipeline,
    pub agent: Option<Arc<dyn GenerationBackend>>,
    pub fallback: Arc<dyn FallbackGenerator>,
    pub api_prefix: String,
}

struct Inner {
    repo: Arc<dyn ProjectRepository>,
    ledger: MessageLedger,
    bus: Arc<EventBus>,
    provisioner: WorkspaceProvisioner,
    pipeline: PostGenerationPipeline,
    agent: Option<Arc<dyn GenerationBackend>>,
    fallback: Arc<dyn FallbackGenerator>,
    api_prefix: String,
    statuses: Mutex<HashMap<String, ProjectStatus>>,
    runs: Arc<RunRegistry>,
}

/// State carried from `start_run` into the spawned task.
struct RunContext {
    project: Project,
    cursor: LedgerCursor,
    ticket: RunTicket,
}

#[derive(Clone)]
pub struct ProjectOrchestrator {
    inner: Arc<Inner>,
}

fn conflict(project_id: &str) -> FactoryError {
    FactoryError::Conflict {
        project_id: project_id.to_string(),
    }
}

fn failure(reason: &str, detail: Option<&str>) -> Payload {
    let mut meta = payload([("reason", json!(reason))]);
    if let Some(detail) = detail {
        meta.insert("detail".to_string(), json!(detail));
    }
    meta
}

impl ProjectOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let ledger = MessageLedger::new(Arc::clone(&parts.repo));
        Self {
            inner: Arc::new(Inner {
                repo: parts.repo,
                ledger,
                bus: parts.bus,
                provisioner: parts.provisioner,
                pipeline: parts.pipeline,
                agent: parts.agent,
                fallback: parts.fallback,
                api_prefix: parts.api_prefix,
                statuses: Mutex::new(HashMap::new()),
                runs: Arc::new(RunRegistry::new()),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    // ── Status cache ──────────────────────────────────────────────────

    fn statuses(&self) -> MutexGuard<'_, HashMap<String, ProjectStatus>> {
        self.inner
            .statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cache_status(&self, project_id: &str, status: ProjectStatus) {
        self.statuses().insert(project_id.to_string(), status);
    }

    /// Current status, seeding the cache from persistence on first access.
    pub async fn status(&self, project_id: &str) -> FactoryResult<ProjectStatus> {
        let cached = self.statuses().get(project_id).copied();
        if let Some(status) = cached {
            return Ok(status);
        }
        let project = self.inner.repo.get_project(project_id, None).await?;
        Ok(*self
            .statuses()
            .entry(project_id.to_string())
            .or_insert(project.status))
    }

    async fn set_status(&self, project_id: &str, to: ProjectStatus) -> FactoryResult<Project> {
        let from = self.status(project_id).await?;
        if !from.can_transition_to(to) {
            return Err(FactoryError::InvalidTransition { from, to });
        }
        let project = self.inner.repo.update_status(project_id, to).await?;
        self.cache_status(project_id, to);
        tracing::info!(project_id, from = %from, to = %to, "project status changed");
        self.publish(ProjectEvent::new(
            project_id,
            ProjectEventType::StatusUpdated,
            Some(format!("Status changed to {}", to)),
            payload([("status", json!(to.as_str()))]),
        ));
        Ok(project)
    }

    // ── Events ────────────────────────────────────────────────────────

    fn publish(&self, event: ProjectEvent) {
        self.inner.bus.publish(event);
    }

    fn log(&self, project_id: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(project_id, "{}", message);
        self.publish(ProjectEvent::log(project_id, message));
    }

    fn emit_error(&self, project_id: &str, message: &str, detail: Option<&str>) {
        let body = match detail {
            Some(detail) => payload([("detail", json!(detail))]),
            None => Payload::new(),
        };
        self.publish(ProjectEvent::new(
            project_id,
            ProjectEventType::Error,
            Some(message.to_string()),
            body,
        ));
    }

    /// Subscribe to a project's event stream. Unknown projects are rejected.
    pub async fn subscribe(&self, project_id: &str) -> FactoryResult<Subscription> {
        self.inner.repo.get_project(project_id, None).await?;
        Ok(self.inner.bus.subscribe(project_id))
    }

    pub fn unsubscribe(&self, project_id: &str, subscriber_id: u64) {
        self.inner.bus.unsubscribe(project_id, subscriber_id);
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Provision a workspace and persist a new `pending` project.
    pub async fn create_project(
        &self,
        user_id: &str,
        prompt: &str,
        template: Option<String>,
        metadata: Payload,
    ) -> FactoryResult<Project> {
        let id = Uuid::new_v4().simple().to_string();
        let workspace = self.inner.provisioner.provision(user_id, &id).await?;
        let project = self
            .inner
            .repo
            .create_project(NewProject {
                id: id.clone(),
                user_id: user_id.to_string(),
                prompt: prompt.to_string(),
                project_dir: workspace.project_dir.to_string_lossy().into_owned(),
                template,
                metadata,
            })
            .await?;
        self.cache_status(&id, project.status);
        tracing::info!(project_id = %id, user_id, "project created");
        self.publish(ProjectEvent::new(
            &id,
            ProjectEventType::ProjectCreated,
            Some("Project created".to_string()),
            payload([
                ("status", json!(project.status.as_str())),
                ("template", json!(project.template)),
            ]),
        ));
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str, owner: Option<&str>) -> FactoryResult<Project> {
        self.inner.repo.get_project(project_id, owner).await
    }

    pub async fn list_projects(
        &self,
        owner: &str,
        limit: u32,
        offset: u32,
    ) -> FactoryResult<Vec<Project>> {
        self.inner.repo.list_projects(owner, limit, offset).await
    }

    pub async fn list_messages(
        &self,
        project_id: &str,
        owner: Option<&str>,
    ) -> FactoryResult<Vec<ProjectMessage>> {
        self.inner.repo.get_project(project_id, owner).await?;
        self.inner.ledger.list(project_id).await
    }

    /// List files below the project's generation root.
    pub async fn list_files(
        &self,
        project_id: &str,
        owner: Option<&str>,
        path: Option<String>,
    ) -> FactoryResult<Vec<FileEntry>> {
        let project = self.inner.repo.get_project(project_id, owner).await?;
        let root = workspace::generation_root(Path::new(&project.project_dir));
        tokio::task::spawn_blocking(move || workspace::list_files(&root, path.as_deref()))
            .await
            .map_err(|e| anyhow::anyhow!("File listing task panicked: {}", e))?
    }

    /// Read one generated file as text for display.
    pub async fn read_file(
        &self,
        project_id: &str,
        owner: Option<&str>,
        path: String,
    ) -> FactoryResult<String> {
        let project = self.inner.repo.get_project(project_id, owner).await?;
        let root = workspace::generation_root(Path::new(&project.project_dir));
        tokio::task::spawn_blocking(move || workspace::read_file(&root, &path))
            .await
            .map_err(|e| anyhow::anyhow!("File read task panicked: {}", e))?
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Start a background generation run.
    ///
    /// Rejects with `Conflict`, without touching any state, while the
    /// project is `running` or another run holds its slot. Returns the user
    /// message recorded for `request.user_content`, if any.
    pub async fn start_run(
        &self,
        project_id: &str,
        request: RunRequest,
    ) -> FactoryResult<Option<ProjectMessage>> {
        if self.status(project_id).await? == ProjectStatus::Running {
            return Err(conflict(project_id));
        }
        let ticket = self
            .inner
            .runs
            .try_claim(project_id)
            .await
            .ok_or_else(|| conflict(project_id))?;

        match self.prepare_run(project_id, ticket, request).await {
            Ok((ctx, user_message)) => {
                let this = self.clone();
                self.inner
                    .runs
                    .spawn(project_id, ticket, async move { this.execute_run(ctx).await })
                    .await;
                Ok(user_message)
            }
            Err(e) => {
                self.inner.runs.release(project_id, ticket).await;
                Err(e)
            }
        }
    }

    async fn prepare_run(
        &self,
        project_id: &str,
        ticket: RunTicket,
        request: RunRequest,
    ) -> FactoryResult<(RunContext, Option<ProjectMessage>)> {
        self.set_status(project_id, ProjectStatus::Pending).await?;

        let user_content = request
            .user_content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let user_message = match user_content {
            Some(content) => Some(
                self.inner
                    .ledger
                    .create_message(
                        project_id,
                        MessageRole::User,
                        MessageStatus::Complete,
                        content,
                        None,
                        None,
                    )
                    .await?,
            ),
            None => None,
        };

        let prompt = request
            .prompt_override
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .or(user_content);
        if let Some(prompt) = prompt {
            self.inner.repo.update_prompt(project_id, prompt).await?;
        }

        let parent_id = user_message
            .as_ref()
            .map(|m| m.id.clone())
            .or(request.user_message_id);
        let intro = request.assistant_intro.unwrap_or_default();
        let message = self
            .inner
            .ledger
            .create_message(
                project_id,
                MessageRole::Assistant,
                MessageStatus::Pending,
                intro.trim(),
                parent_id,
                None,
            )
            .await?;
        let project = self.set_status(project_id, ProjectStatus::Running).await?;
        let ctx = RunContext {
            project,
            cursor: LedgerCursor::new(message.id),
            ticket,
        };
        Ok((ctx, user_message))
    }

    /// Abort the active run and mark the project `canceled`.
    ///
    /// The run's task has fully stopped before the status changes.
    pub async fn cancel(&self, project_id: &str) -> FactoryResult<Project> {
        let from = self.status(project_id).await?;
        if !from.can_transition_to(ProjectStatus::Canceled) {
            return Err(FactoryError::InvalidTransition {
                from,
                to: ProjectStatus::Canceled,
            });
        }
        self.inner.runs.abort(project_id).await;
        let project = self.set_status(project_id, ProjectStatus::Canceled).await?;
        for message in self.inner.ledger.list(project_id).await? {
            if message.role == MessageRole::Assistant && message.status == MessageStatus::Pending {
                self.inner
                    .ledger
                    .finalize(&message.id, MessageStatus::Error, Some(failure("canceled", None)))
                    .await?;
            }
        }
        self.log(project_id, "Project generation canceled.");
        Ok(project)
    }

    /// Abort every run, then close the event bus.
    pub async fn shutdown(&self) {
        self.inner.runs.shutdown().await;
        self.inner.bus.shutdown();
    }

    async fn execute_run(self, ctx: RunContext) {
        let RunContext {
            project,
            mut cursor,
            ticket,
        } = ctx;
        let project_id = project.id.clone();
        let terminal = match self.drive(&project, &mut cursor).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(project_id = %project_id, error = %e, "generation run failed");
                let detail = e.to_string();
                self.emit_error(&project_id, "Project generation failed", Some(&detail));
                if let Err(e) = self
                    .inner
                    .ledger
                    .finalize_once(
                        &mut cursor,
                        MessageStatus::Error,
                        Some(failure("internal_error", Some(&detail))),
                    )
                    .await
                {
                    tracing::warn!(project_id = %project_id, error = %e, "failed to finalize assistant message");
                }
                ProjectStatus::Failed
            }
        };
        self.finish_run(&project_id, ticket, terminal).await;
    }

    /// Free the run slot, then publish the terminal status. The run must
    /// not write anything after this.
    async fn finish_run(&self, project_id: &str, ticket: RunTicket, status: ProjectStatus) {
        self.inner.runs.release(project_id, ticket).await;
        if let Err(e) = self.set_status(project_id, status).await {
            tracing::warn!(project_id, status = %status, error = %e, "failed to record terminal status");
        }
    }

    /// Run generation and the build. Returns the terminal status; the
    /// assistant message is already finalized either way.
    async fn drive(&self, project: &Project, cursor: &mut LedgerCursor) -> FactoryResult<ProjectStatus> {
        let id = project.id.as_str();
        self.log(id, "Starting project generation...");
        let generation_root = workspace::generation_root(Path::new(&project.project_dir));
        tokio::fs::create_dir_all(&generation_root).await?;

        let entry = match self.generate(project, &generation_root, cursor).await? {
            None => return Ok(ProjectStatus::Failed),
            Some(path) if !path.trim().is_empty() => path,
            Some(_) => {
                self.log(id, "Generation produced no preview entry point.");
                self.emit_error(id, "Generation produced no preview entry point", None);
                self.inner
                    .ledger
                    .finalize_once(cursor, MessageStatus::Error, Some(failure("generation_failed", None)))
                    .await?;
                return Ok(ProjectStatus::Failed);
            }
        };

        let bus = Arc::clone(&self.inner.bus);
        let log_id = id.to_string();
        let mut sink = move |line: String| bus.publish(ProjectEvent::log(&log_id, line));
        let preview_path = match self.inner.pipeline.run(&generation_root, &mut sink).await {
            Ok(Some(built)) => built,
            Ok(None) => entry,
            Err(e) => {
                let detail = e.to_string();
                tracing::warn!(project_id = id, error = %detail, "post-generation step failed");
                self.log(id, format!("Post-generation step failed: {}", detail));
                self.emit_error(id, "Post-generation step failed", Some(&detail));
                self.inner
                    .ledger
                    .finalize_once(
                        cursor,
                        MessageStatus::Error,
                        Some(failure("build_failed", Some(&detail))),
                    )
                    .await?;
                return Ok(ProjectStatus::Failed);
            }
        };

        if let Some(url) = build_preview_url(&self.inner.api_prefix, id, Some(&preview_path)) {
            self.inner.repo.update_preview_url(id, Some(&url)).await?;
            self.log(id, format!("Preview available at {}", url));
            self.publish(ProjectEvent::new(
                id,
                ProjectEventType::PreviewReady,
                Some("Preview ready".to_string()),
                payload([("preview_url", json!(url))]),
            ));
        }

        self.inner
            .ledger
            .finalize_once(cursor, MessageStatus::Complete, None)
            .await?;
        self.log(id, "Project ready.");
        Ok(ProjectStatus::Ready)
    }

    /// Produce the generated files. Returns the entry path, or `None` when
    /// the run failed and its message is finalized.
    async fn generate(
        &self,
        project: &Project,
        generation_root: &Path,
        cursor: &mut LedgerCursor,
    ) -> FactoryResult<Option<String>> {
        let id = project.id.as_str();
        let reason = match BackendSelection::probe(self.inner.agent.as_ref()) {
            BackendSelection::Agent(backend) => {
                self.log(id, "Invoking Claude service...");
                let request = GenerationRequest {
                    prompt: project.prompt.clone(),
                    workspace_root: generation_root.to_path_buf(),
                    template: project.template.clone(),
                };
                match self.run_agent(id, backend.as_ref(), &request, cursor).await? {
                    GenerationOutcome::Completed {
                        preview_path: Some(path),
                    } if !path.trim().is_empty() => {
                        self.log(id, "Claude generation finished.");
                        return Ok(Some(path));
                    }
                    GenerationOutcome::Completed { .. } => {
                        self.log(id, "Claude generation finished.");
                        "Claude generation did not produce a preview entry point.".to_string()
                    }
                    GenerationOutcome::Unavailable { reason } => {
                        format!("Claude service unavailable: {}", reason)
                    }
                    GenerationOutcome::Failed { reason } => {
                        format!("Claude generation error: {}", reason)
                    }
                }
            }
            BackendSelection::Fallback { reason } => reason,
        };
        self.run_fallback(project, generation_root, cursor, &reason)
            .await
    }

    /// Drive the agent while forwarding its messages as they arrive.
    async fn run_agent(
        &self,
        project_id: &str,
        backend: &dyn GenerationBackend,
        request: &GenerationRequest,
        cursor: &mut LedgerCursor,
    ) -> FactoryResult<GenerationOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generation = backend.generate(request, tx);
        tokio::pin!(generation);
        let outcome = loop {
            tokio::select! {
                outcome = &mut generation => break outcome,
                Some(message) = rx.recv() => {
                    self.forward_agent_message(project_id, cursor, message).await?;
                }
            }
        };
        while let Ok(message) = rx.try_recv() {
            self.forward_agent_message(project_id, cursor, message).await?;
        }
        tracing::debug!(project_id, backend = backend.name(), outcome = ?outcome, "agent finished");
        Ok(outcome)
    }

    async fn forward_agent_message(
        &self,
        project_id: &str,
        cursor: &mut LedgerCursor,
        message: AgentMessage,
    ) -> FactoryResult<()> {
        let ledger = &self.inner.ledger;
        match message {
            AgentMessage::AssistantText {
                text,
                model,
                stop_reason,
            } => {
                ledger.append(cursor, &text, Separator::Line).await?;
                self.publish(ProjectEvent::new(
                    project_id,
                    ProjectEventType::AssistantMessage,
                    None,
                    payload([
                        ("text", json!(text)),
                        ("model", json!(model)),
                        ("stop_reason", json!(stop_reason)),
                    ]),
                ));
            }
            AgentMessage::ToolUse { id, name, input } => {
                ledger
                    .append(cursor, &format!("Using tool `{}`", name), Separator::Paragraph)
                    .await?;
                self.publish(ProjectEvent::new(
                    project_id,
                    ProjectEventType::ToolUse,
                    None,
                    payload([("id", json!(id)), ("name", json!(name)), ("input", input)]),
                ));
            }
            AgentMessage::Result {
                total_cost_usd,
                stop_reason,
                usage,
            } => {
                let meta = payload([
                    ("usage", json!(usage)),
                    ("total_cost_usd", json!(total_cost_usd)),
                    ("stop_reason", json!(stop_reason)),
                ]);
                ledger
                    .finalize_once(cursor, MessageStatus::Complete, Some(meta.clone()))
                    .await?;
                self.publish(ProjectEvent::new(
                    project_id,
                    ProjectEventType::ResultMessage,
                    None,
                    meta,
                ));
            }
        }
        Ok(())
    }

    async fn run_fallback(
        &self,
        project: &Project,
        generation_root: &Path,
        cursor: &mut LedgerCursor,
        reason: &str,
    ) -> FactoryResult<Option<String>> {
        let id = project.id.as_str();
        tracing::warn!(project_id = id, reason, "using local scaffold generator");
        self.log(id, reason);
        self.log(id, "Falling back to local scaffold generator...");
        self.inner
            .ledger
            .append(cursor, FALLBACK_NOTE, Separator::Paragraph)
            .await?;

        match self.inner.fallback.generate(generation_root, &project.prompt).await {
            Ok(path) => {
                self.log(id, "Fallback generation completed.");
                Ok(Some(path))
            }
            Err(e) => {
                let detail = e.to_string();
                self.emit_error(id, "Fallback generation failed", Some(&detail));
                self.log(id, format!("Fallback generator failed: {}", detail));
                self.inner
                    .ledger
                    .finalize_once(
                        cursor,
                        MessageStatus::Error,
                        Some(failure("fallback_failed", Some(&detail))),
                    )
                    .await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::command::{CommandOutcome, CommandOutput, CommandRunner, CommandSpec};
    use crate::factory::db::{DbHandle, FactoryDb};
    use crate::factory::fallback::StaticScaffoldGenerator;
    use crate::factory::generation::Usage;
    use crate::factory::repository::SqliteProjectRepository;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct ExitRunner(i32);

    #[async_trait]
    impl CommandRunner for ExitRunner {
        async fn run(&self, _spec: &CommandSpec) -> anyhow::Result<CommandOutcome> {
            Ok(CommandOutcome::Exited(CommandOutput {
                exit_code: self.0,
                stdout: String::new(),
                stderr: if self.0 == 0 { String::new() } else { "boom".into() },
            }))
        }
    }

    /// Streams a fixed script of messages, then returns `outcome`.
    struct ScriptedBackend {
        messages: Vec<AgentMessage>,
        outcome: GenerationOutcome,
        files: Vec<(&'static str, &'static str)>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedBackend {
        fn new(outcome: GenerationOutcome) -> Self {
            Self {
                messages: Vec::new(),
                outcome,
                files: Vec::new(),
                gate: None,
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            events: mpsc::UnboundedSender<AgentMessage>,
        ) -> GenerationOutcome {
            for message in &self.messages {
                let _ = events.send(message.clone());
            }
            for (name, body) in &self.files {
                std::fs::write(request.workspace_root.join(name), body).unwrap();
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.outcome.clone()
        }
    }

    struct BrokenFallback;

    #[async_trait]
    impl FallbackGenerator for BrokenFallback {
        async fn generate(&self, _root: &Path, _prompt: &str) -> FactoryResult<String> {
            Err(FactoryError::FallbackFailed("disk full".into()))
        }
    }

    struct EmptyFallback;

    #[async_trait]
    impl FallbackGenerator for EmptyFallback {
        async fn generate(&self, _root: &Path, _prompt: &str) -> FactoryResult<String> {
            Ok(String::new())
        }
    }

    struct Harness {
        orchestrator: ProjectOrchestrator,
        _dir: tempfile::TempDir,
    }

    fn harness(
        agent: Option<Arc<dyn GenerationBackend>>,
        fallback: Arc<dyn FallbackGenerator>,
        exit_code: i32,
    ) -> Harness {
        crate::logging::init_test();
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteProjectRepository::new(DbHandle::new(FactoryDb::new_in_memory().unwrap()));
        let orchestrator = ProjectOrchestrator::new(OrchestratorParts {
            repo: Arc::new(repo),
            bus: Arc::new(EventBus::new()),
            provisioner: WorkspaceProvisioner::new(dir.path()),
            pipeline: PostGenerationPipeline::new(
                Arc::new(ExitRunner(exit_code)),
                Duration::from_secs(5),
            ),
            agent,
            fallback,
            api_prefix: "/api".to_string(),
        });
        Harness {
            orchestrator,
            _dir: dir,
        }
    }

    async fn wait_for(orch: &ProjectOrchestrator, id: &str, status: ProjectStatus) -> Project {
        for _ in 0..200 {
            if orch.status(id).await.unwrap() == status && !orch.inner.runs.is_active(id).await {
                return orch.get_project(id, None).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("project {} never reached {}", id, status);
    }

    fn messages_of(orch: &ProjectOrchestrator, id: &str) -> Vec<String> {
        orch.bus()
            .history(id)
            .into_iter()
            .filter_map(|e| e.message)
            .collect()
    }

    fn types_of(orch: &ProjectOrchestrator, id: &str) -> Vec<ProjectEventType> {
        orch.bus().history(id).into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_create_project_is_pending_with_workspace() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch
            .create_project("alice", "Todo app", Some("react".into()), Payload::new())
            .await
            .unwrap();

        assert_eq!(project.status, ProjectStatus::Pending);
        assert_eq!(project.id.len(), 32);
        assert!(Path::new(&project.project_dir).join("generated-app").is_dir());
        let history = orch.bus().history(&project.id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, ProjectEventType::ProjectCreated);
        assert_eq!(history[0].payload["template"], json!("react"));
    }

    #[tokio::test]
    async fn test_fallback_run_reaches_ready() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();

        let done = wait_for(orch, &project.id, ProjectStatus::Ready).await;
        assert_eq!(
            done.preview_url,
            Some(format!("/api/projects/{}/preview/index.html", project.id))
        );

        let logs = messages_of(orch, &project.id);
        assert!(logs.contains(&"Claude service unavailable or not configured.".to_string()));
        assert!(logs.contains(&"Falling back to local scaffold generator...".to_string()));
        assert!(logs.contains(&"Project ready.".to_string()));

        let messages = orch.list_messages(&project.id, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[0].content, FALLBACK_NOTE);
    }

    #[tokio::test]
    async fn test_agent_messages_flow_into_ledger_and_bus() {
        let mut backend = ScriptedBackend::new(GenerationOutcome::Completed {
            preview_path: Some("index.html".into()),
        });
        backend.messages = vec![
            AgentMessage::AssistantText {
                text: "Scaffolding".into(),
                model: Some("claude".into()),
                stop_reason: None,
            },
            AgentMessage::ToolUse {
                id: Some("t1".into()),
                name: "Write".into(),
                input: json!({"path": "index.html"}),
            },
            AgentMessage::Result {
                total_cost_usd: Some(0.25),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: Some(10),
                    output_tokens: Some(20),
                },
            },
        ];
        backend.files = vec![("index.html", "<html></html>")];
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(
            &project.id,
            RunRequest {
                assistant_intro: Some("On it.".into()),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap();
        wait_for(orch, &project.id, ProjectStatus::Ready).await;

        let message = &orch.list_messages(&project.id, None).await.unwrap()[0];
        assert_eq!(message.content, "On it.\nScaffolding\n\nUsing tool `Write`");
        assert_eq!(message.status, MessageStatus::Complete);
        let meta = message.metadata.clone().unwrap();
        assert_eq!(meta["total_cost_usd"], json!(0.25));
        assert_eq!(meta["usage"]["output_tokens"], json!(20));

        let types = types_of(orch, &project.id);
        for expected in [
            ProjectEventType::AssistantMessage,
            ProjectEventType::ToolUse,
            ProjectEventType::ResultMessage,
            ProjectEventType::PreviewReady,
        ] {
            assert!(types.contains(&expected), "missing {:?}", expected);
        }
        assert!(messages_of(orch, &project.id).contains(&"Invoking Claude service...".to_string()));
    }

    #[tokio::test]
    async fn test_agent_failure_falls_back() {
        let backend = ScriptedBackend::new(GenerationOutcome::Failed {
            reason: "boom".into(),
        });
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        wait_for(orch, &project.id, ProjectStatus::Ready).await;

        let logs = messages_of(orch, &project.id);
        assert!(logs.contains(&"Claude generation error: boom".to_string()));
        assert!(logs.contains(&"Fallback generation completed.".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_failure_marks_failed() {
        let h = harness(None, Arc::new(BrokenFallback), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        let failed = wait_for(orch, &project.id, ProjectStatus::Failed).await;
        assert!(failed.preview_url.is_none());

        let history = orch.bus().history(&project.id);
        let error = history
            .iter()
            .find(|e| e.event_type == ProjectEventType::Error)
            .unwrap();
        assert_eq!(error.message.as_deref(), Some("Fallback generation failed"));
        assert!(error.payload["detail"].as_str().unwrap().contains("disk full"));
        // No pipeline step ran.
        assert!(!messages_of(orch, &project.id).iter().any(|m| m.starts_with("Running pnpm")));

        let message = &orch.list_messages(&project.id, None).await.unwrap()[0];
        assert_eq!(message.status, MessageStatus::Error);
        assert_eq!(message.metadata.as_ref().unwrap()["reason"], json!("fallback_failed"));
    }

    #[tokio::test]
    async fn test_empty_entry_is_generation_failure() {
        let h = harness(None, Arc::new(EmptyFallback), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        wait_for(orch, &project.id, ProjectStatus::Failed).await;

        let message = &orch.list_messages(&project.id, None).await.unwrap()[0];
        assert_eq!(message.status, MessageStatus::Error);
        assert_eq!(message.metadata.as_ref().unwrap()["reason"], json!("generation_failed"));
    }

    #[tokio::test]
    async fn test_build_failure_marks_failed() {
        let mut backend = ScriptedBackend::new(GenerationOutcome::Completed {
            preview_path: Some("index.html".into()),
        });
        backend.files = vec![
            ("package.json", r#"{"scripts":{"build":"vite build"}}"#),
            ("index.html", "<html></html>"),
        ];
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 1);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        wait_for(orch, &project.id, ProjectStatus::Failed).await;

        let logs = messages_of(orch, &project.id);
        assert!(logs.contains(
            &"Post-generation step failed: Running pnpm install failed with exit code 1".to_string()
        ));
        let message = &orch.list_messages(&project.id, None).await.unwrap()[0];
        let meta = message.metadata.as_ref().unwrap();
        assert_eq!(meta["reason"], json!("build_failed"));
        assert_eq!(
            meta["detail"],
            json!("Running pnpm install failed with exit code 1")
        );
    }

    #[tokio::test]
    async fn test_second_run_while_running_is_conflict() {
        let gate = Arc::new(Notify::new());
        let mut backend = ScriptedBackend::new(GenerationOutcome::Completed {
            preview_path: Some("index.html".into()),
        });
        backend.gate = Some(Arc::clone(&gate));
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        assert_eq!(orch.status(&project.id).await.unwrap(), ProjectStatus::Running);
        // Wait until the run is parked inside the backend.
        for _ in 0..200 {
            if messages_of(orch, &project.id).contains(&"Invoking Claude service...".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let events_before = orch.bus().history(&project.id).len();
        let messages_before = orch.list_messages(&project.id, None).await.unwrap().len();
        let err = orch
            .start_run(
                &project.id,
                RunRequest {
                    prompt_override: Some("changed".into()),
                    user_content: Some("rejected turn".into()),
                    ..RunRequest::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::Conflict { .. }));
        assert_eq!(orch.status(&project.id).await.unwrap(), ProjectStatus::Running);
        assert_eq!(
            orch.list_messages(&project.id, None).await.unwrap().len(),
            messages_before
        );
        assert_eq!(orch.get_project(&project.id, None).await.unwrap().prompt, "P");

        assert_eq!(orch.bus().history(&project.id).len(), events_before);

        gate.notify_one();
        wait_for(orch, &project.id, ProjectStatus::Ready).await;
    }

    #[tokio::test]
    async fn test_rerun_after_ready_updates_prompt() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        wait_for(orch, &project.id, ProjectStatus::Ready).await;

        let user = orch
            .start_run(
                &project.id,
                RunRequest {
                    user_content: Some("  Make it blue ".into()),
                    ..RunRequest::default()
                },
            )
            .await
            .unwrap()
            .expect("user turn recorded");
        assert_eq!(user.role, MessageRole::User);
        assert_eq!(user.content, "Make it blue");
        let done = wait_for(orch, &project.id, ProjectStatus::Ready).await;
        assert_eq!(done.prompt, "Make it blue");

        let messages = orch.list_messages(&project.id, None).await.unwrap();
        let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(messages[1].id, user.id);
        assert_eq!(messages[2].parent_id.as_deref(), Some(user.id.as_str()));
    }

    #[tokio::test]
    async fn test_restart_on_live_ready_event() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        let mut sub = orch.subscribe(&project.id).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();

        let ready = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = sub.receiver.recv().await {
                if event.event_type == ProjectEventType::StatusUpdated
                    && event.payload["status"] == json!("ready")
                {
                    return event;
                }
            }
            panic!("bus closed before ready");
        })
        .await
        .expect("ready event");
        assert_eq!(ready.message.as_deref(), Some("Status changed to ready"));

        // The first run has nothing left to write once ready is published.
        let first = &orch.list_messages(&project.id, None).await.unwrap()[0];
        assert_eq!(first.status, MessageStatus::Complete);
        orch.start_run(&project.id, RunRequest::default())
            .await
            .expect("a project reported ready accepts a new run");
        wait_for(orch, &project.id, ProjectStatus::Ready).await;
        assert_eq!(orch.list_messages(&project.id, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ready_is_the_last_event_of_a_run() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        let mut sub = orch.subscribe(&project.id).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = sub.receiver.recv().await {
                let done = event.event_type == ProjectEventType::StatusUpdated
                    && event.payload["status"] == json!("ready");
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("ready event");
        assert_eq!(seen[seen.len() - 2].message.as_deref(), Some("Project ready."));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.receiver.try_recv().is_err(), "no event may follow ready");
    }

    #[tokio::test]
    async fn test_cancel_running_project() {
        let gate = Arc::new(Notify::new());
        let mut backend = ScriptedBackend::new(GenerationOutcome::Completed {
            preview_path: Some("index.html".into()),
        });
        backend.gate = Some(gate);
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();

        let canceled = orch.cancel(&project.id).await.unwrap();
        assert_eq!(canceled.status, ProjectStatus::Canceled);
        assert!(!orch.inner.runs.is_active(&project.id).await);

        let message = &orch.list_messages(&project.id, None).await.unwrap()[0];
        assert_eq!(message.status, MessageStatus::Error);
        assert_eq!(message.metadata.as_ref().unwrap()["reason"], json!("canceled"));

        let err = orch.cancel(&project.id).await.unwrap_err();
        assert!(matches!(err, FactoryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_then_immediate_restart() {
        let gate = Arc::new(Notify::new());
        let mut backend = ScriptedBackend::new(GenerationOutcome::Completed {
            preview_path: Some("index.html".into()),
        });
        backend.files = vec![("index.html", "<html></html>")];
        backend.gate = Some(Arc::clone(&gate));
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();
        for _ in 0..200 {
            if messages_of(orch, &project.id).contains(&"Invoking Claude service...".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orch.cancel(&project.id).await.unwrap();
        let canceled_at = orch.bus().history(&project.id).len();
        orch.start_run(&project.id, RunRequest::default())
            .await
            .expect("restart right after cancel");
        gate.notify_one();
        wait_for(orch, &project.id, ProjectStatus::Ready).await;

        // Nothing from the aborted run lands after the cancel.
        let statuses: Vec<String> = orch.bus().history(&project.id)[canceled_at..]
            .iter()
            .filter(|e| e.event_type == ProjectEventType::StatusUpdated)
            .map(|e| e.payload["status"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(statuses, vec!["pending", "running", "ready"]);

        let messages = orch.list_messages(&project.id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].status, MessageStatus::Error);
        assert_eq!(messages[0].metadata.as_ref().unwrap()["reason"], json!("canceled"));
        assert_eq!(messages[1].status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn test_start_run_on_missing_project() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        let err = h
            .orchestrator
            .start_run("missing", RunRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_unknown_project() {
        let h = harness(None, Arc::new(StaticScaffoldGenerator), 0);
        assert!(h.orchestrator.subscribe("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_active_runs() {
        let mut backend = ScriptedBackend::new(GenerationOutcome::Completed {
            preview_path: Some("index.html".into()),
        });
        backend.gate = Some(Arc::new(Notify::new()));
        let h = harness(Some(Arc::new(backend)), Arc::new(StaticScaffoldGenerator), 0);
        let orch = &h.orchestrator;
        let project = orch.create_project("u", "P", None, Payload::new()).await.unwrap();
        orch.start_run(&project.id, RunRequest::default()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), orch.shutdown())
            .await
            .unwrap();
        assert!(!orch.inner.runs.is_active(&project.id).await);
        // Shutdown is a hard stop; the status is left as it was.
        assert_eq!(orch.status(&project.id).await.unwrap(), ProjectStatus::Running);
    }
}
