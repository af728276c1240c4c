mod ask_cmd;
mod config;
mod serve_cmd;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use config::{CliOverrides, DocqConfig};

#[derive(Parser)]
#[command(name = "docq", about = "Ask questions about documents using an external analysis worker")]
struct Cli {
    /// Worker executable (overrides DOCQ_WORKER env var)
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    /// Worker timeout in seconds (overrides DOCQ_WORKER_TIMEOUT_SECS env var)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a docq config file with default settings
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP service
    Serve {
        /// Address to bind (overrides DOCQ_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides DOCQ_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single query against a local document and print the result
    Ask {
        /// Path to the document
        file: PathBuf,
        /// Question to ask about the document
        query: String,
    },
}

/// Execute the `docq init` command: write config file.
fn cmd_init(worker: Option<&PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    if let Some(worker) = worker {
        cfg.worker.executable = worker.display().to_string();
    }

    config::save_config_to(&cfg, &path)?;

    println!("Config written to {}", path.display());
    println!("  worker.executable = {}", cfg.worker.executable);
    println!("  worker.timeout_secs = {}", cfg.worker.timeout_secs);
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!();
    println!("Next: run `docq serve` or `docq ask <file> <query>`.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut overrides = CliOverrides {
        worker: cli.worker.clone(),
        timeout_secs: cli.timeout,
        ..Default::default()
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(cli.worker.as_ref(), force)?;
        }
        Commands::Serve { bind, port } => {
            overrides.bind = bind;
            overrides.port = port;
            let resolved = DocqConfig::resolve(&overrides)?;
            tracing::info!(
                worker = %resolved.worker.display(),
                artifact_dir = %resolved.artifact_dir.display(),
                max_workers = resolved.orchestrator.max_concurrent_workers,
                timeout_secs = resolved.launch.timeout.as_secs(),
                "starting docq"
            );
            let orchestrator = Arc::new(resolved.build_orchestrator());
            serve_cmd::run_serve(
                orchestrator,
                &resolved.bind,
                resolved.port,
                resolved.body_limit(),
            )
            .await?;
        }
        Commands::Ask { file, query } => {
            let resolved = DocqConfig::resolve(&overrides)?;
            let orchestrator = resolved.build_orchestrator();
            let ok = ask_cmd::run_ask(&orchestrator, &file, &query).await?;
            if !ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
