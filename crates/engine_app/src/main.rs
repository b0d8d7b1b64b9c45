//! # engine_app — server binary
//!
//! Builds a [`World`], registers the built-in housekeeping systems and runs
//! the fixed-timestep tick loop until `--max-ticks` is reached or Ctrl-C is
//! pressed. With `--backup-dir` a snapshot is written on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use engine_app::{
    EngineConfig, FileBridge, Persistence, SaveRequest, SaveType, Scheduler, Target, World,
};
use engine_component::{EntityId, IdStrategy};
use engine_system::{Priority, System, SystemConfig, SystemContext, SystemError, SystemState};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engine_app", about = "ECS game server core")]
struct Args {
    /// Target ticks per second (overrides ENGINE_TICK_RATE)
    #[arg(short, long)]
    tick_rate: Option<f64>,

    /// Stop after this many ticks (0 = run until Ctrl-C)
    #[arg(short, long, default_value_t = 0)]
    max_ticks: u64,

    /// Entity id strategy: sequential, random or time-ordered
    #[arg(short, long)]
    id_strategy: Option<IdStrategy>,

    /// Directory to write a snapshot to on shutdown
    #[arg(short, long)]
    backup_dir: Option<PathBuf>,
}

/// Logs a heartbeat once a second.
struct Heartbeat {
    every: u64,
}

impl System for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn priority(&self) -> Priority {
        Priority::Idle
    }

    fn execute(
        &self,
        ctx: &mut SystemContext,
        entities: &[EntityId],
        state: SystemState,
    ) -> Result<SystemState, SystemError> {
        let beats = state["beats"].as_u64().unwrap_or(0) + 1;
        if ctx.tick_id % self.every == 0 {
            info!(
                tick_id = ctx.tick_id,
                beats,
                entities = entities.len(),
                "heartbeat"
            );
        }
        Ok(json!({ "beats": beats }))
    }
}

/// Collects destroyed entities whose retention has expired.
struct GarbageCollector {
    world: Arc<World>,
}

impl System for GarbageCollector {
    fn name(&self) -> &str {
        "garbage_collector"
    }

    fn priority(&self) -> Priority {
        Priority::Low
    }

    fn execute(
        &self,
        _ctx: &mut SystemContext,
        _entities: &[EntityId],
        state: SystemState,
    ) -> Result<SystemState, SystemError> {
        let collected = self.world.collect_garbage().len() as u64;
        let total = state["collected"].as_u64().unwrap_or(0) + collected;
        Ok(json!({ "collected": total }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("engine_app=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::from_env()?;
    if let Some(rate) = args.tick_rate {
        config.scheduler.tick_rate = rate;
    }
    config.scheduler.max_ticks = args.max_ticks;
    if let Some(strategy) = args.id_strategy {
        config.registry = config.registry.with_id_strategy(strategy);
    }
    if let Some(dir) = args.backup_dir {
        config = config.with_backup_dir(dir);
    }

    info!(
        tick_rate = config.scheduler.tick_rate,
        max_ticks = config.scheduler.max_ticks,
        id_strategy = ?config.registry.id_strategy,
        "engine starting"
    );

    let world = Arc::new(World::new("engine", config.registry.clone()));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&world), config.scheduler.clone()));

    let per_second = config.scheduler.tick_rate.round().max(1.0) as u64;
    scheduler.register(Heartbeat { every: per_second })?;
    scheduler.register_system(
        Arc::new(GarbageCollector {
            world: Arc::clone(&world),
        }),
        SystemConfig::new("garbage_collector").with_run_interval(per_second),
    )?;
    scheduler.start()?;

    tokio::select! {
        ticks = scheduler.join() => {
            info!(ticks = ticks.unwrap_or_default(), "tick loop finished");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested");
            scheduler.stop().await;
        }
    }
    scheduler.shutdown();

    if let Some(dir) = &config.backup_dir {
        let persistence = Persistence::new(Arc::clone(&world))
            .with_bridge(Target::File, Arc::new(FileBridge::new(dir)?));
        let receipt = persistence.save(SaveRequest::new(SaveType::Full, Target::File))?;
        info!(id = %receipt.id, dir = %dir.display(), rows = receipt.rows, "snapshot written");
    }

    world.shutdown();
    info!("engine shut down");
    Ok(())
}
