//! Strata headless server.
//!
//! Wires configuration, logging and one chunk manager per world layer over
//! the in-memory store, then drives a scripted observer walk so the whole
//! chunk lifecycle (preload, activation, migration, eviction, saving) runs
//! end to end.
//!
//! Run with: `cargo run -p strata-server -- --ticks 400 --layer 0 --layer 1`

mod host;
mod walk;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use strata_chunk::{ChannelSink, ChunkEvent, ChunkEventSink, MemoryStore, MemoryWorld};
use strata_config::{CliArgs, Config, default_config_dir};
use tracing::{error, info, warn};

use crate::walk::{TICKS_PER_CHUNK, Walk};

/// Ticks between stats lines.
const STATS_EVERY: u64 = 50;

/// Chunks kept active around the observer.
const ACTIVE_RADIUS: u32 = 1;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("strata-server: {err}; using default config");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    strata_log::init_logging(config.debug.log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    if let Err(err) = config.validate() {
        error!("Invalid configuration: {err}");
        return ExitCode::FAILURE;
    }

    info!("Strata server");
    info!(
        "Region: {} | Layers: {:?} | Chunk: {}x{} tiles",
        config.server.region, config.server.layers, config.chunk.tile_grid_dim, config.chunk.tile_grid_dim
    );
    info!(
        "Preload radius: {} | Cache: {} chunks, ttl {}s | Workers: {} load, {} save",
        config.preload.radius,
        config.cache.capacity,
        config.cache.ttl_secs,
        config.workers.load_workers,
        config.workers.save_workers,
    );

    let store = Arc::new(MemoryStore::new());
    let world = Arc::new(MemoryWorld::new());
    let columns = (config.server.demo_ticks / TICKS_PER_CHUNK + 1).min(i32::MAX as u64) as i32;
    let seeded = host::seed_demo_world(&store, &config, columns);
    info!("Seeded {seeded} chunks per layer");

    let (sink, events) = ChannelSink::bounded(1024);
    let sink: Arc<dyn ChunkEventSink> = Arc::new(sink);
    let managers = match host::start_layers(&config, &store, &world, Some(sink)) {
        Ok(managers) => managers,
        Err(err) => {
            error!("Failed to start chunk managers: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut walk = Walk::new(&managers, &world, config.chunk.chunk_world_size(), ACTIVE_RADIUS);
    let tick_interval = Duration::from_millis(config.server.tick_ms);
    let (mut loaded, mut unloaded, mut degraded) = (0u64, 0u64, 0u64);

    for tick in 0..config.server.demo_ticks {
        walk.step(tick);

        for event in events.try_iter() {
            match event {
                ChunkEvent::Loaded(event) => {
                    loaded += 1;
                    if event.degraded {
                        degraded += 1;
                        warn!(coord = %event.coord, layer = %event.layer, "chunk loaded degraded");
                    }
                }
                ChunkEvent::Unloaded(_) => unloaded += 1,
            }
        }

        if tick % STATS_EVERY == 0 {
            for manager in &managers {
                info!("tick {tick}: {}", manager.stats());
            }
        }
        std::thread::sleep(tick_interval);
    }

    let summary = walk.stats();
    info!(
        "Walk finished at {:?}: {} chunk moves, {} migrations ({} reindexed, {} buffered)",
        walk.observer(),
        summary.observer_moves,
        summary.migrations,
        summary.reindexed,
        summary.buffered,
    );
    info!("Events: {loaded} loaded ({degraded} degraded), {unloaded} unloaded");

    drop(walk);
    for manager in managers {
        manager.shutdown();
    }
    let writes = store.calls();
    info!(
        "Store writes: {} tile upserts, {} occupant upserts",
        writes.tile_upserts, writes.occupant_upserts
    );
    ExitCode::SUCCESS
}
