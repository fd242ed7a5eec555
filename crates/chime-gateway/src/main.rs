use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use chime_core::ChimeConfig;
use chime_scheduler::{JobRegistry, JobStore, LockCoordinator, SchedulerEngine, SqliteJobStore};

mod app;
mod http;
mod jobs;

/// Chime node — clustered cron scheduler with an HTTP management API.
#[derive(Parser, Debug)]
#[command(name = "chime-gateway", version, about)]
struct Cli {
    /// Path to chime.toml (default: ~/.chime/chime.toml).
    #[arg(long, env = "CHIME_CONFIG")]
    config: Option<String>,

    /// Overrides `node.instance_id`. Must be unique across the cluster.
    #[arg(long)]
    instance_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chime_gateway=info,chime_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ChimeConfig::load(cli.config.as_deref())?;
    if let Some(id) = cli.instance_id {
        config.node.instance_id = id;
    }
    let instance_id = config.node.resolve_instance_id();

    // all nodes of a cluster share this one file
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(
        &db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?);

    let handlers = Arc::new(jobs::builtin_handlers());
    let coordinator = Arc::new(LockCoordinator::new(
        store.clone(),
        instance_id.clone(),
        &config.scheduler,
    )?);
    let engine = Arc::new(SchedulerEngine::new(
        config.scheduler.clone(),
        store.clone(),
        coordinator,
        handlers.clone(),
    )?);
    let registry = JobRegistry::new(store, handlers, config.scheduler.default_handler.clone());

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(instance_id.clone(), registry, engine.clone()));
    let router = app::build_router(state);

    engine.start()?;
    info!(%addr, instance = %instance_id, "chime node listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // let in-flight handlers finish before giving up the locks
    engine.stop(true).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Create the parent directory of the database file if it does not exist yet.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), "cannot create database directory: {e}");
            }
        }
    }
}
