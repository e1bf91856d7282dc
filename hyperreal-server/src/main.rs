use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hyperreal_core::{spawn_worker, Configuration, Orchestrator, OutputStore};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod routes;

#[derive(Parser, Debug)]
#[command(author, version, about = "Hyper-realism image generation server")]
struct Args {
    /// YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Overrides `generation.output_dir` from the configuration
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Load model weights before accepting requests
    #[arg(long)]
    preload: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = Configuration::load(&args.config)?;
    if let Some(dir) = args.output_dir {
        config.generation.output_dir = dir;
    }
    let config = Arc::new(config);

    // Hardware defects stop the process before anything is served.
    let engine = match hyperreal_core::build(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("CRITICAL HARDWARE ERROR: {e}");
            std::process::exit(1);
        }
    };

    let store = OutputStore::new(config.generation.output_dir.clone());
    let orchestrator = Orchestrator::new(config.clone(), engine.into_shared(), store);
    let (handle, _worker) = spawn_worker(orchestrator).context("failed to start worker")?;

    if args.preload {
        info!("Preloading models");
        handle.preload().await?;
    }

    let app = routes::router(routes::AppState {
        handle,
        config: config.clone(),
        output_dir: config.generation.output_dir.clone(),
    });

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Engine ready, serving on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
