//! evod: HTTP daemon for the Evo campaign engine.

mod api;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use evo_core::capabilities::{demo, http::HttpCapabilities};
use evo_core::{EngineConfig, JobManager, Orchestrator, METRICS};
use evo_state::{MemoryRepository, Repository, SurrealRepository};

use api::AppState;

#[derive(Parser, Debug)]
#[command(name = "evod")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evo daemon: campaigns, rounds and lineage over HTTP", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "EVOD_ADDR", default_value = "127.0.0.1:7700")]
    addr: String,

    /// Use a throwaway in-process store instead of SurrealDB
    #[arg(long)]
    memory: bool,

    /// Base URL of an external capability service; demo capabilities otherwise
    #[arg(long, env = "EVO_CAPABILITY_URL")]
    capability_url: Option<String>,

    /// Finished jobs are forgotten after this many seconds
    #[arg(long, env = "EVOD_JOB_RETENTION_SECS", default_value = "3600")]
    job_retention_secs: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    evo_core::init_tracing(args.json, level);

    let engine = EngineConfig::from_env().context("Invalid EVO_* engine configuration")?;
    let capabilities = match &args.capability_url {
        Some(url) => {
            info!(url = %url, "using HTTP capabilities");
            HttpCapabilities::new(url.as_str(), engine.call_timeout)
                .map_err(|e| anyhow!("{e}"))
                .context("Failed to build capability client")?
                .into_capabilities()
        }
        None => demo::capabilities(),
    };

    let repo: Arc<dyn Repository> = if args.memory {
        Arc::new(MemoryRepository::new())
    } else {
        Arc::new(
            SurrealRepository::from_env()
                .await
                .context("Failed to connect to Evo database")?,
        )
    };

    let jobs = JobManager::new(Orchestrator::new(repo, capabilities, engine));
    let sweeper = spawn_job_sweeper(jobs.clone(), Duration::from_secs(args.job_retention_secs));

    let app = api::api_router()
        .with_state(Arc::new(AppState::new(jobs)))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;
    info!(addr = %listener.local_addr()?, "evod listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    METRICS.flush();
    info!("evod shut down");
    Ok(())
}

/// Periodically drop finished jobs older than `retention`.
fn spawn_job_sweeper(jobs: JobManager, retention: Duration) -> tokio::task::JoinHandle<()> {
    let max_age = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::hours(1));
    let period = (retention / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            let removed = jobs.cleanup(max_age);
            if removed > 0 {
                info!(removed, "expired jobs removed");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
