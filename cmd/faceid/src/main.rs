//! faceid - face verification server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use faceid_facestore::FaceStore;
use faceid_kv::RedbStore;
use faceid_service::{ServiceConfig, ServiceContext, VerificationService};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod server;

/// Face verification server.
///
/// Enrolls face images under caller-chosen identities and verifies new
/// images against them by embedding similarity.
#[derive(Parser)]
#[command(name = "faceid")]
#[command(about = "Face verification server")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/WebSocket server
    Serve(ServeArgs),
    /// Open the store, check it and list enrolled identities
    Inspect,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Listen address (overrides config), e.g. ":8000"
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Data directory (overrides config)
    #[arg(short = 'd', long)]
    pub data_dir: Option<PathBuf>,

    /// Inference pool size (overrides config)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };

    match &cli.command {
        Commands::Serve(args) => serve(config, args).await,
        Commands::Inspect => inspect(&config),
    }
}

async fn serve(mut config: ServiceConfig, args: &ServeArgs) -> Result<()> {
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;

    let listen = config.listen.clone();
    let tokens = config.tokens.clone();
    let ctx = ServiceContext::open(config).context("open service")?;
    let service = Arc::new(VerificationService::start(ctx));

    let result = server::serve(Arc::clone(&service), tokens, &listen, shutdown_signal()).await;

    // Flush even when the server failed.
    service.shutdown().await.context("shutdown")?;
    result
}

fn inspect(config: &ServiceConfig) -> Result<()> {
    config.validate()?;
    let kv = RedbStore::open(config.table_path())
        .with_context(|| format!("open {}", config.table_path().display()))?;
    let store = FaceStore::open(config.dim, config.index_path(), Box::new(kv))?;
    store.check_consistency()?;

    println!("{} identities (dim {})", store.len(), store.dim());
    for identity in store.identities() {
        println!("  {identity}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
