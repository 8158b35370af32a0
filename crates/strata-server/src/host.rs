//! Builds one chunk manager per configured layer over shared in-memory
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use strata_chunk::{
    ChunkCoord, ChunkError, ChunkEventSink, ChunkManager, LayerId, ManagerConfig, ManagerDeps,
    MemoryStore, MemoryWorld, NullSink, OccupantKind, OccupantRecord,
};
use strata_config::Config;

/// Chunk rows seeded on each side of the walk line.
const SEED_HALF_HEIGHT: i32 = 2;

/// Upper bound on seeded chunk columns, whatever the tick count.
const MAX_SEED_COLUMNS: i32 = 96;

/// Translates the file config into the manager's runtime config.
pub fn manager_config(config: &Config) -> ManagerConfig {
    ManagerConfig {
        region: config.server.region.clone(),
        tile_grid_dim: config.chunk.tile_grid_dim,
        cell_size: config.chunk.cell_size,
        preload_radius: config.preload.radius,
        cache_capacity: config.cache.capacity,
        cache_ttl: Duration::from_secs(config.cache.ttl_secs),
        sweep_interval: Duration::from_millis(config.cache.sweep_interval_ms),
        load_workers: config.workers.load_workers,
        save_workers: config.workers.save_workers,
        load_queue_capacity: config.workers.load_queue_capacity,
        save_queue_capacity: config.workers.save_queue_capacity,
        load_timeout: Duration::from_millis(config.workers.load_timeout_ms),
        save_timeout: Duration::from_millis(config.workers.save_timeout_ms),
    }
}

/// Starts a manager for every layer in `config.server.layers`.
///
/// Managers already started are shut down by their `Drop` if a later one
/// fails to spawn its workers.
pub fn start_layers(
    config: &Config,
    store: &Arc<MemoryStore>,
    world: &Arc<MemoryWorld>,
    sink: Option<Arc<dyn ChunkEventSink>>,
) -> Result<Vec<ChunkManager>, ChunkError> {
    let sink = sink.unwrap_or_else(|| Arc::new(NullSink));
    config
        .server
        .layers
        .iter()
        .map(|&layer| {
            let deps = ManagerDeps::new(store.clone(), world.clone(), world.clone())
                .with_sink(Arc::clone(&sink));
            ChunkManager::new(manager_config(config), LayerId(layer), deps)
        })
        .collect()
}

/// Fills the store with a band of chunks along the observer's path.
///
/// Every chunk gets a tile pattern, one static occupant at its centre and
/// one dynamic occupant near its west edge. Returns the number of chunks
/// seeded per layer.
pub fn seed_demo_world(store: &MemoryStore, config: &Config, columns: i32) -> usize {
    let size = config.chunk.chunk_world_size();
    let dim = config.chunk.tile_grid_dim as usize;
    let margin = config.preload.radius.min(i32::MAX as u32) as i32 + 1;
    let columns = columns.clamp(1, MAX_SEED_COLUMNS);

    let mut seeded = 0;
    for &layer in &config.server.layers {
        let layer_id = LayerId(layer);
        let mut next_id = (layer as u64) << 32;
        seeded = 0;
        for cx in -margin..columns + margin {
            for cy in -SEED_HALF_HEIGHT..=SEED_HALF_HEIGHT {
                let coord = ChunkCoord::new(cx, cy);
                let fill = (cx.rem_euclid(7) + cy.rem_euclid(3)) as u8 + layer as u8;
                store.put_tiles(&config.server.region, layer_id, coord, vec![fill; dim * dim], 0);

                let origin_x = cx as f64 * size;
                let origin_y = cy as f64 * size;
                for (kind, x, y) in [
                    (OccupantKind::Static, origin_x + size * 0.5, origin_y + size * 0.5),
                    (OccupantKind::Dynamic, origin_x + size * 0.1, origin_y + size * 0.25),
                ] {
                    next_id += 1;
                    store.put_occupant(
                        &config.server.region,
                        OccupantRecord {
                            id: next_id,
                            kind,
                            x,
                            y,
                            coord,
                            layer: layer_id,
                            payload: Vec::new(),
                        },
                    );
                }
                seeded += 1;
            }
        }
    }
    seeded
}
