//! dispatchq entry point.
//!
//! `serve` (the default) runs the queue engine, scheduler, and HTTP API
//! until interrupted. `status` prints a snapshot of an existing database.
//! `check-config` validates the configuration and prints the effective
//! tuning.

use anyhow::Result;
use arc_swap::ArcSwap;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use dispatchq::api;
use dispatchq::cli::{Cli, Command};
use dispatchq::config::{
    self, EngineConfig,
    watcher::{WatcherConfig, start_config_watcher},
};
use dispatchq::db::Database;
use dispatchq::engine::Engine;
use dispatchq::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log, cli.verbose)?;

    let config_path = config::resolve_config_path(cli.config.as_deref());
    let config = config::load_config(config_path.as_deref())?;
    let db_path = config::resolve_database_path(&config, cli.database.as_deref());

    match cli.command {
        Some(Command::Status) => run_status(&db_path),
        Some(Command::CheckConfig) => run_check_config(&config, config_path.as_deref()),
        Some(Command::Serve) | None => run_serve(config, config_path, db_path).await,
    }
}

async fn run_serve(
    config: EngineConfig,
    config_path: Option<PathBuf>,
    db_path: PathBuf,
) -> Result<()> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;
    info!("Database ready at {}", db_path.display());

    let server = config.server.clone();
    let shared = Arc::new(ArcSwap::from_pointee(config));
    let (engine, scheduler) = Engine::new(db, Arc::clone(&shared));
    let scheduler_task = scheduler.spawn();

    if let Some(path) = config_path {
        spawn_reload_task(Arc::clone(&engine), path);
    }

    let (api_shutdown, addr) =
        api::start_server(Arc::clone(&engine), &server.host, server.port).await?;
    info!(
        "dispatchq {} serving on http://{}",
        env!("CARGO_PKG_VERSION"),
        addr
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = api_shutdown.send(());
    engine.shutdown().await;
    scheduler_task.await?;
    Ok(())
}

/// Re-read the config file whenever it changes on disk. A file that fails
/// to parse or validate leaves the running configuration untouched.
fn spawn_reload_task(engine: Arc<Engine>, path: PathBuf) {
    let mut watcher = match start_config_watcher(path.clone(), WatcherConfig::default()) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!("Config watcher unavailable, hot reload disabled: {err}");
            return;
        }
    };
    tokio::spawn(async move {
        while let Some(event) = watcher.wait_for_change().await {
            if !event.requires_reload() {
                continue;
            }
            match config::load_config(Some(&path)) {
                Ok(new) => {
                    if let Err(err) = engine.reload_config(new) {
                        warn!("Config reload rejected: {err:#}");
                    }
                }
                Err(err) => {
                    warn!("Config reload failed, keeping current settings: {err:#}");
                }
            }
        }
    });
}

fn run_status(db_path: &Path) -> Result<()> {
    let db = Database::open(db_path)?;
    let tasks = db.status_counts()?;
    let executors = db.list_executors()?;
    let out = serde_json::json!({
        "database": db_path.display().to_string(),
        "tasks": tasks,
        "executors": executors,
        "latest_event_seq": db.latest_event_seq()?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn run_check_config(config: &EngineConfig, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => println!("# Configuration OK: {}", path.display()),
        None => println!("# No config file found; built-in defaults are in effect"),
    }
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}
