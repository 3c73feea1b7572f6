//! Composition root. Wires the store and every component together with
//! explicit dependency injection (no global singletons) and runs until a
//! shutdown signal arrives. Does not install its own OS signal handler
//! beyond the standard `ctrl_c` future; a dedicated crash guard is a
//! separate concern outside this crate.
//!
//! No request surface (HTTP, CLI subcommands) is wired in here; those are
//! external to the core and compose on top of the library crate.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use engine::config::Config;
use engine::evolution::EvolutionEngine;
use engine::executor::Executor;
use engine::governor::Governor;
use engine::router::Router;
use engine::shutdown::ShutdownCoordinator;
use engine::tier::TierResolver;

#[derive(Parser, Debug)]
#[command(name = "engined", about = "Self-managing orchestration engine daemon")]
struct Cli {
    /// Explicit config file path; falls back to the project/user search chain.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());
    info!(db_path = ?config.storage.db_path, "engine starting");

    std::fs::create_dir_all(&config.storage.sidecar_dir).context("failed to create sidecar directory")?;
    if let Some(parent) = config.storage.db_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create store directory")?;
    }

    let db = store::Db::open(&config.storage.db_path).context("failed to open store")?;

    let governor = Arc::new(Governor::new(db.clone(), config.governor.clone(), &config.storage.sidecar_dir));
    let router = Arc::new(Router::new(db.clone(), config.router.clone(), governor.clone()));
    let tier_registry = load_tier_registry(&config.storage.sidecar_dir);
    let tier_resolver = Arc::new(TierResolver::new(db.clone(), config.tier.clone(), tier_registry));
    let evolution = Arc::new(EvolutionEngine::new(db.clone(), config.evolution.tier_feedback_every));
    let executor = Arc::new(Executor::new(db.clone(), config.executor.clone()));
    let shutdown = ShutdownCoordinator::new(db.clone(), config.executor.shutdown_timeout_secs);

    let _ = (&router, &tier_resolver, &evolution, &executor);

    info!("engine ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");

    shutdown.run().context("shutdown sequence failed")?;
    Ok(())
}

fn load_tier_registry(sidecar_dir: &std::path::Path) -> engine::domain::TierRegistry {
    let path = sidecar_dir.join("tier-registry.json");
    store::read_json(&path).unwrap_or_default().unwrap_or_default()
}
