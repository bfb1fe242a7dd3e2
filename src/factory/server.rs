use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::api::{self, AppState, SharedState};
use super::build_pipeline::PostGenerationPipeline;
use super::command::ProcessRunner;
use super::db::{DbHandle, FactoryDb};
use super::events::EventBus;
use super::fallback::StaticScaffoldGenerator;
use super::generation::{ClaudeCliBackend, GenerationBackend};
use super::orchestrator::{OrchestratorParts, ProjectOrchestrator};
use super::repository::SqliteProjectRepository;
use super::workspace::WorkspaceProvisioner;
use crate::config::FactoryConfig;

/// Wire the production collaborators described by `config`.
pub fn build_state(config: &FactoryConfig) -> Result<SharedState> {
    let db = FactoryDb::new(&config.db_path).context("Failed to initialize factory database")?;
    std::fs::create_dir_all(&config.projects_root).with_context(|| {
        format!(
            "Failed to create projects root {}",
            config.projects_root.display()
        )
    })?;

    let agent: Arc<dyn GenerationBackend> = Arc::new(ClaudeCliBackend::new(
        config.claude_cmd.clone(),
        config.agent_timeout(),
        config.agent_enabled,
    ));
    let orchestrator = ProjectOrchestrator::new(OrchestratorParts {
        repo: Arc::new(SqliteProjectRepository::new(DbHandle::new(db))),
        bus: Arc::new(EventBus::new()),
        provisioner: WorkspaceProvisioner::new(config.projects_root.clone()),
        pipeline: PostGenerationPipeline::new(Arc::new(ProcessRunner), config.command_timeout()),
        agent: Some(agent),
        fallback: Arc::new(StaticScaffoldGenerator),
        api_prefix: config.api_prefix.clone(),
    });
    Ok(Arc::new(AppState { orchestrator }))
}

fn cors_layer(config: &FactoryConfig) -> CorsLayer {
    if config.dev_mode {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the full application router: REST API, WebSocket and CORS.
pub fn build_router(state: SharedState, config: &FactoryConfig) -> Router {
    api::api_router(&config.api_prefix)
        .layer(cors_layer(config))
        .with_state(state)
}

/// Start the factory server and run until Ctrl+C.
pub async fn start_server(config: FactoryConfig) -> Result<()> {
    let state = build_state(&config)?;
    let app = build_router(state.clone(), &config);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        projects_root = %config.projects_root.display(),
        "app factory listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.orchestrator.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config(dir: &tempfile::TempDir) -> FactoryConfig {
        FactoryConfig {
            projects_root: dir.path().join("projects"),
            db_path: dir.path().join("db").join("factory.db"),
            agent_enabled: false,
            ..FactoryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_state_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        build_state(&config).unwrap();
        assert!(config.projects_root.is_dir());
        assert!(config.db_path.exists());
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let app = build_router(build_state(&config).unwrap(), &config);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = FactoryConfig {
            api_prefix: "/v1".to_string(),
            ..test_config(&dir)
        };
        let app = build_router(build_state(&config).unwrap(), &config);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/v1/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["projects"], serde_json::json!([]));

        let resp = app
            .oneshot(Request::builder().uri("/api/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let app = build_router(build_state(&config).unwrap(), &config);
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("http://localhost:5173")
        );
    }

    #[tokio::test]
    async fn test_cors_rejects_unknown_origin() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let app = build_router(build_state(&config).unwrap(), &config);
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
