//! # Metronome Daemon
//!
//! Reference host for the Metronome scheduling core: registers handlers,
//! recovers persisted jobs into a fresh engine, and runs until signalled.
//!
//! Usage:
//!   metronomed                     # Run with ~/.metronome/config.toml
//!   metronomed --db /tmp/jobs.db   # Custom job database
//!   metronomed --demo              # Seed a few demo jobs on first run

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use metronome_core::{MetronomeConfig, MetronomeError};
use metronome_scheduler::{
    ConcurrencyPolicy, Coordinator, DefinitionStore, EventHub, HandlerRegistry, NewJob,
    SchedulerEngine,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "metronomed",
    version,
    about = "Metronome — dynamic job scheduling daemon"
)]
struct Cli {
    /// Path to config.toml (default: ~/.metronome/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the job database path
    #[arg(long)]
    db: Option<String>,

    /// Seed demo jobs (heartbeat, report, cache warm-up)
    #[arg(long)]
    demo: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

/// Handlers this host ships. A real embedding registers its own work
/// units here, before recovery runs.
fn build_registry() -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("demo:heartbeat", |ctx| async move {
        tracing::info!("Heartbeat from '{}' at {}", ctx.name, ctx.fired_at);
        Ok(())
    });
    registry.register_fn("demo:report", |ctx| async move {
        tracing::info!("Generating report for '{}/{}'", ctx.group, ctx.name);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    });
    registry.register_fn("demo:cache-warm", |ctx| async move {
        tracing::info!("Warming caches ({})", ctx.job_id);
        Ok(())
    });
    registry
}

async fn seed_demo_jobs(coordinator: &Coordinator) {
    let jobs = [
        NewJob::new("heartbeat", "demo", "@every 30s", "demo:heartbeat"),
        NewJob::new("nightly-report", "demo", "0 3 * * *", "demo:report")
            .with_policy(ConcurrencyPolicy::QueueIfRunning),
        NewJob::new("cache-warm", "demo", "*/15 * * * *", "demo:cache-warm")
            .with_policy(ConcurrencyPolicy::SkipIfRunning),
    ];
    for job in jobs {
        match coordinator.define(job.clone()).await {
            Ok(def) => tracing::info!("Seeded demo job '{}/{}'", def.group, def.name),
            Err(MetronomeError::DuplicateName { .. }) => {}
            Err(e) => tracing::warn!("Could not seed '{}': {e}", job.name),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "metronomed=debug,metronome_scheduler=debug"
    } else {
        "metronomed=info,metronome_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => MetronomeConfig::load_from(&PathBuf::from(expand_path(path)))?,
        None => MetronomeConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.db_path = PathBuf::from(expand_path(db));
    }
    tracing::info!("Job database: {}", config.db_path.display());

    // Wire the core: registry first, then store, engine, coordinator
    let registry = build_registry();
    let store = Arc::new(DefinitionStore::open(&config.db_path)?);
    let events = Arc::new(EventHub::new(config.scheduler.event_history));
    let (engine, notices) = SchedulerEngine::new(
        registry.clone(),
        Duration::from_secs(config.scheduler.max_sleep_secs.max(1)),
    );
    let coordinator = Coordinator::new(store, registry, engine, events, &config.scheduler);

    // Recover persisted definitions into the fresh engine, then start
    // the loops
    coordinator.recover().await?;
    coordinator.engine().spawn();
    coordinator.spawn_outcome_writer(notices);
    coordinator.spawn_reconciler();

    if cli.demo {
        seed_demo_jobs(&coordinator).await;
    }

    // Forward job events to the log; a real host would publish these to
    // its message bus
    let mut event_rx = coordinator.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!("Event: {:?} {} ({})", event.kind, event.name, event.job_id);
        }
    });

    let jobs = coordinator.list_jobs().await?;
    tracing::info!("Metronome running with {} job(s)", jobs.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, draining in-flight runs");
    coordinator.shutdown().await;
    Ok(())
}
