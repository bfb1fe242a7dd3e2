use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "app-factory")]
#[command(version, about = "Generate runnable web apps from natural-language prompts")]
pub struct Cli {
    /// Path to an app-factory.toml (defaults to ./app-factory.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the SQLite database
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema and exit
    InitDb {
        /// Path to the SQLite database
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = app_factory::config::FactoryConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(config, port, db_path, dev).await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(config, db_path)?;
        }
    }

    Ok(())
}
