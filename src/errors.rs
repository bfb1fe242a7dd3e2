//! Typed error enums for the generation factory.
//!
//! `FactoryError` is the one error surfaced by the orchestrator, the
//! persistence layer and the post-generation pipeline. Leaf helpers keep
//! using `anyhow::Result` with `.context()` and are folded in through the
//! `Other` variant.

use thiserror::Error;

use crate::factory::models::ProjectStatus;

/// Errors from the project generation subsystem.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Message {id} not found")]
    MessageNotFound { id: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Path '{path}' escapes sandbox '{base}'")]
    SandboxEscape { path: String, base: String },

    #[error("Project generation already running for project {project_id}")]
    Conflict { project_id: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ProjectStatus,
        to: ProjectStatus,
    },

    #[error("Generation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Generation backend error: {0}")]
    BackendError(String),

    #[error("{label} timed out after {seconds} seconds")]
    PipelineTimeout { label: String, seconds: u64 },

    #[error("{label} failed with exit code {exit_code}")]
    PipelineCommandFailed { label: String, exit_code: i32 },

    #[error("Fallback generation failed: {0}")]
    FallbackFailed(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FactoryError {
    /// True for lookup failures that a client should see as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound { .. }
                | Self::MessageNotFound { .. }
                | Self::FileNotFound { .. }
        )
    }
}

pub type FactoryResult<T> = std::result::Result<T, FactoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_error_not_found_carries_id() {
        let err = FactoryError::ProjectNotFound {
            id: "abc123".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Project abc123 not found");
    }

    #[test]
    fn file_not_found_is_not_found() {
        let err = FactoryError::FileNotFound {
            path: "src/missing.js".into(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "File not found: src/missing.js");
    }

    #[test]
    fn sandbox_escape_message_names_both_paths() {
        let err = FactoryError::SandboxEscape {
            path: "../etc/passwd".into(),
            base: "/srv/projects/u/p".into(),
        };
        assert_eq!(
            err.to_string(),
            "Path '../etc/passwd' escapes sandbox '/srv/projects/u/p'"
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn pipeline_errors_render_label() {
        let timeout = FactoryError::PipelineTimeout {
            label: "Running pnpm install".into(),
            seconds: 900,
        };
        assert_eq!(
            timeout.to_string(),
            "Running pnpm install timed out after 900 seconds"
        );

        let failed = FactoryError::PipelineCommandFailed {
            label: "Running pnpm run build".into(),
            exit_code: 2,
        };
        assert_eq!(
            failed.to_string(),
            "Running pnpm run build failed with exit code 2"
        );
    }

    #[test]
    fn invalid_transition_uses_status_names() {
        let err = FactoryError::InvalidTransition {
            from: ProjectStatus::Ready,
            to: ProjectStatus::Canceled,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition from ready to canceled"
        );
    }

    #[test]
    fn factory_error_implements_std_error() {
        fn assert_error<E: std::error::Error>(_: &E) {}
        let err = FactoryError::BadRequest("bad".into());
        assert_error(&err);
    }

    #[test]
    fn anyhow_errors_convert_into_other() {
        let err: FactoryError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, FactoryError::Other(_)));
        assert_eq!(err.to_string(), "disk on fire");
    }
}
