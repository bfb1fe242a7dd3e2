//! Server commands: `app-factory serve` and `app-factory init-db`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use app_factory::config::FactoryConfig;
use app_factory::factory::{db::FactoryDb, server};
use app_factory::logging;

/// Apply command-line overrides on top of the loaded configuration.
fn with_overrides(
    mut config: FactoryConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> FactoryConfig {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(db_path) = db_path {
        config.db_path = db_path;
    }
    if dev {
        config.dev_mode = true;
    }
    config
}

pub async fn cmd_serve(
    config: FactoryConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let config = with_overrides(config, port, db_path, dev);
    let _guard = logging::init(&config.log_level, config.log_json)?;
    server::start_server(config).await
}

pub fn cmd_init_db(config: FactoryConfig, db_path: Option<PathBuf>) -> Result<()> {
    let config = with_overrides(config, None, db_path, false);
    FactoryDb::new(&config.db_path).with_context(|| {
        format!("Failed to initialize database at {}", config.db_path.display())
    })?;
    println!("Factory database initialized at {}", config.db_path.display());
    Ok(())
}
