//! Service configuration.
//!
//! Values come from built-in defaults, then an optional `app-factory.toml`,
//! then `APP_FACTORY_*` environment variables, each layer overriding the
//! previous one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::factory::generation::DEFAULT_AGENT_TIMEOUT;
use crate::factory::preview::DEFAULT_API_PREFIX;

pub const CONFIG_FILE: &str = "app-factory.toml";
pub const ENV_PREFIX: &str = "APP_FACTORY_";

#[derive(Debug, Clone, PartialEq)]
pub struct FactoryConfig {
    pub projects_root: PathBuf,
    pub api_prefix: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub command_timeout_secs: u64,
    pub agent_timeout_secs: u64,
    pub claude_cmd: String,
    pub agent_enabled: bool,
    pub allowed_origins: Vec<String>,
    pub dev_mode: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("/tmp/app-factory-projects"),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            port: 3141,
            db_path: PathBuf::from(".app-factory/factory.db"),
            command_timeout_secs: 900,
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT.as_secs(),
            claude_cmd: "claude".to_string(),
            agent_enabled: true,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            dev_mode: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Raw TOML layout. Every field is optional and overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    server: Option<ServerSection>,
    workspace: Option<WorkspaceSection>,
    pipeline: Option<PipelineSection>,
    agent: Option<AgentSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    api_prefix: Option<String>,
    db_path: Option<PathBuf>,
    allowed_origins: Option<Vec<String>>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceSection {
    projects_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PipelineSection {
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    enabled: Option<bool>,
    command: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    json: Option<bool>,
}

impl FactoryConfig {
    /// Load from an explicit file, or from `app-factory.toml` in the
    /// working directory when present, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: ConfigToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(server) = raw.server {
            if let Some(port) = server.port {
                config.port = port;
            }
            if let Some(prefix) = server.api_prefix {
                config.api_prefix = prefix;
            }
            if let Some(db_path) = server.db_path {
                config.db_path = db_path;
            }
            if let Some(origins) = server.allowed_origins {
                config.allowed_origins = origins;
            }
            if let Some(dev_mode) = server.dev_mode {
                config.dev_mode = dev_mode;
            }
        }
        if let Some(workspace) = raw.workspace
            && let Some(root) = workspace.projects_root
        {
            config.projects_root = root;
        }
        if let Some(pipeline) = raw.pipeline
            && let Some(secs) = pipeline.command_timeout_secs
        {
            config.command_timeout_secs = secs;
        }
        if let Some(agent) = raw.agent {
            if let Some(enabled) = agent.enabled {
                config.agent_enabled = enabled;
            }
            if let Some(command) = agent.command {
                config.claude_cmd = command;
            }
            if let Some(secs) = agent.timeout_secs {
                config.agent_timeout_secs = secs;
            }
        }
        if let Some(logging) = raw.logging {
            if let Some(level) = logging.level {
                config.log_level = level;
            }
            if let Some(json) = logging.json {
                config.log_json = json;
            }
        }

        Ok(config)
    }

    /// Overlay `APP_FACTORY_*` variables (and `CLAUDE_CMD`) read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        if let Some(root) = var("PROJECTS_ROOT") {
            self.projects_root = PathBuf::from(root);
        }
        if let Some(prefix) = var("API_PREFIX") {
            self.api_prefix = prefix;
        }
        if let Some(port) = var("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}PORT: {}", ENV_PREFIX, port))?;
        }
        if let Some(db_path) = var("DB_PATH") {
            self.db_path = PathBuf::from(db_path);
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(cmd) = lookup("CLAUDE_CMD").filter(|v| !v.trim().is_empty()) {
            self.claude_cmd = cmd;
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = FactoryConfig::default();
        assert_eq!(config.port, 3141);
        assert_eq!(config.api_prefix, "/api");
        assert_eq!(config.projects_root, PathBuf::from("/tmp/app-factory-projects"));
        assert_eq!(config.command_timeout(), Duration::from_secs(900));
        assert_eq!(config.agent_timeout(), Duration::from_secs(1800));
        assert!(config.agent_enabled);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config = FactoryConfig::from_toml_str(
            r#"
            [server]
            port = 8080
            allowed_origins = ["https://app.example.com"]

            [agent]
            enabled = false

            [pipeline]
            command_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.allowed_origins, vec!["https://app.example.com"]);
        assert!(!config.agent_enabled);
        assert_eq!(config.command_timeout_secs, 60);
        assert_eq!(config.api_prefix, "/api");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(
            FactoryConfig::from_toml_str("").unwrap(),
            FactoryConfig::default()
        );
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(FactoryConfig::from_toml_str("[server\nport = ").is_err());
        assert!(FactoryConfig::from_toml_str("[server]\nport = \"high\"").is_err());
        assert!(FactoryConfig::from_toml_str("[mystery]\nkey = 1").is_err());
    }

    #[test]
    fn test_from_file_reads_and_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\njson = true\n").unwrap();
        let config = FactoryConfig::from_file(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.log_json);

        let missing = FactoryConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(format!("{:#}", missing).contains("nope.toml"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("APP_FACTORY_PORT", "9000"),
            ("APP_FACTORY_PROJECTS_ROOT", "/srv/projects"),
            ("APP_FACTORY_API_PREFIX", "/v1"),
            ("APP_FACTORY_LOG_LEVEL", ""),
            ("CLAUDE_CMD", "/opt/claude"),
        ]
        .into_iter()
        .collect();
        let mut config = FactoryConfig::from_toml_str("[server]\nport = 8080").unwrap();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.projects_root, PathBuf::from("/srv/projects"));
        assert_eq!(config.api_prefix, "/v1");
        assert_eq!(config.claude_cmd, "/opt/claude");
        // Blank values are ignored.
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_env_invalid_port_is_error() {
        let mut config = FactoryConfig::default();
        let err = config
            .apply_env(|k| (k == "APP_FACTORY_PORT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("APP_FACTORY_PORT"));
    }
}
