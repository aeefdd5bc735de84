use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cadence::adapters::AdapterRegistry;
use cadence::config::CadenceConfig;
use cadence::engine::Orchestrator;
use cadence::server;
use cadence::store::{Db, DbHandle};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Release train orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (defaults to ./cadence.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration daemon: scheduling loop plus HTTP ingress
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces and allow permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Run exactly one evaluation pass over all active releases and exit
    Tick,
    /// Print every release with its stage progress
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = CadenceConfig::load(cli.config.as_deref())?;
    init_tracing(cli.verbose, config.log.json);

    match cli.command {
        Commands::Serve { port, dev } => {
            let mut server_config = config.server_config();
            if let Some(port) = port {
                server_config.port = port;
            }
            if dev {
                server_config.dev_mode = true;
            }
            server::start_server(server_config).await
        }
        Commands::Tick => {
            let orchestrator = open_orchestrator(&config)?;
            let summary = orchestrator.tick().await?;
            println!(
                "Tick finished: {} evaluated, {} skipped, {} failed",
                summary.evaluated, summary.skipped, summary.failed
            );
            Ok(())
        }
        Commands::Status => {
            let orchestrator = open_orchestrator(&config)?;
            let releases = orchestrator.list_releases().await?;
            if releases.is_empty() {
                println!("No releases.");
                return Ok(());
            }
            for release in releases {
                println!(
                    "{}  {}/{}  phase={}  platforms={}",
                    release.id,
                    release.tenant,
                    release.version,
                    release.phase,
                    release
                        .platforms
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                );
                let detail = orchestrator.release_detail(release.id).await?;
                for stage in detail.stages {
                    println!(
                        "    {:<16} {}{}",
                        stage.stage.to_string(),
                        stage.status,
                        if stage.auto_advance { "  [auto]" } else { "" }
                    );
                }
            }
            Ok(())
        }
    }
}

fn open_orchestrator(config: &CadenceConfig) -> Result<Arc<Orchestrator>> {
    let db_path = &config.database.path;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(Db::new(db_path).context("Failed to open database")?);
    Ok(Arc::new(Orchestrator::new(db, AdapterRegistry::local())))
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose { "cadence=debug,info" } else { "info" })
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
