//! # Outreach: Multi-Channel Retention Core
//!
//! Usage:
//!   outreach serve                 # HTTP gateway + queue consumers
//!   outreach serve --no-workers    # Gateway only (consumers run elsewhere)
//!   outreach worker                # Queue consumers only
//!   outreach cron                  # One scheduler run, report on stdout
//!   outreach migrate               # Create or upgrade the database schema

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use outreach_core::OutreachConfig;
use outreach_engine::Engine;
use outreach_gateway::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "outreach",
    version,
    about = "📣 Outreach: multi-channel retention outreach core"
)]
struct Cli {
    /// Config file (default: ~/.outreach/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not start queue consumers in this process
        #[arg(long)]
        no_workers: bool,
    },
    /// Run queue consumers until interrupted
    Worker,
    /// Run the scheduler once and print the report
    Cron,
    /// Open the database and apply the schema
    Migrate,
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "outreach=debug,outreach_engine=debug,outreach_queue=debug,outreach_gateway=debug,tower_http=debug"
    } else {
        "outreach=info,outreach_engine=info,outreach_queue=info,outreach_channels=info,outreach_gateway=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }
}

fn load_config(path: Option<&str>) -> Result<OutreachConfig> {
    let config = match path {
        Some(p) => {
            let path = PathBuf::from(shellexpand::tilde(p).to_string());
            let mut config = OutreachConfig::load_from(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config
        }
        None => OutreachConfig::load()?,
    };
    if let Some(parent) = config.database_path().parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Migrate => {
            let path = config.database_path();
            outreach_store::Store::open(&path)?;
            println!("✅ Schema ready at {}", path.display());
        }
        Command::Cron => {
            let engine = Engine::from_config(config)?;
            let report = engine.cron.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            engine.shutdown().await;
        }
        Command::Worker => {
            let engine = Engine::from_config(config)?;
            let workers = engine.workers();
            if workers.channels().is_empty() {
                tracing::warn!("⚠️ No active channel integrations, nothing to consume");
            }
            workers.start().await;
            shutdown_signal().await;
            workers.shutdown().await;
            engine.shutdown().await;
        }
        Command::Serve { port, no_workers } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if config.cron.secret.is_none() {
                tracing::warn!("⚠️ CRON_SECRET is not set, /cron/run will reject every trigger");
            }
            let engine = Arc::new(Engine::from_config(config)?);
            let workers = if no_workers {
                None
            } else {
                let pool = Arc::new(engine.workers());
                pool.start().await;
                Some(pool)
            };

            let state = AppState::new(engine.clone(), workers.clone());
            outreach_gateway::start(state, shutdown_signal()).await?;

            if let Some(pool) = workers {
                pool.shutdown().await;
            }
            engine.shutdown().await;
        }
    }
    Ok(())
}
