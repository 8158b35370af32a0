#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use strata_chunk::{
    ChannelSink, ChunkCoord, ChunkEvent, ChunkManager, ChunkState, LayerId, ManagerConfig,
    ManagerDeps, ManualClock, MemoryStore, MemoryWorld, OccupantKind, OccupantRecord,
};

pub const REGION: &str = "test";
pub const LAYER: LayerId = LayerId(0);
pub const TILE_DIM: u32 = 4;

pub struct Harness {
    pub manager: ChunkManager,
    pub store: Arc<MemoryStore>,
    pub world: Arc<MemoryWorld>,
    pub clock: Arc<ManualClock>,
    pub events: Receiver<ChunkEvent>,
}

/// Small chunks, radius-1 zone, no janitor thread, generous deadlines.
pub fn config() -> ManagerConfig {
    ManagerConfig {
        region: REGION.to_string(),
        tile_grid_dim: TILE_DIM,
        cell_size: 8.0,
        preload_radius: 1,
        cache_capacity: 64,
        cache_ttl: Duration::from_secs(60),
        sweep_interval: Duration::ZERO,
        load_workers: 2,
        save_workers: 1,
        load_queue_capacity: 64,
        save_queue_capacity: 64,
        load_timeout: Duration::from_secs(2),
        save_timeout: Duration::from_secs(2),
    }
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: ManagerConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let world = Arc::new(MemoryWorld::new());
    let clock = Arc::new(ManualClock::new());
    let (sink, events) = ChannelSink::bounded(1024);
    let deps = ManagerDeps::new(store.clone(), world.clone(), world.clone())
        .with_sink(Arc::new(sink))
        .with_clock(clock.clone());
    let manager = ChunkManager::new(config, LAYER, deps).expect("manager should start");
    Harness {
        manager,
        store,
        world,
        clock,
        events,
    }
}

pub fn record(id: u64, kind: OccupantKind, x: f64, y: f64, coord: ChunkCoord) -> OccupantRecord {
    OccupantRecord {
        id,
        kind,
        x,
        y,
        coord,
        layer: LAYER,
        payload: vec![id as u8],
    }
}

/// Stores tiles `[fill; 16]` and one dynamic occupant per id.
pub fn seed(store: &MemoryStore, coord: ChunkCoord, fill: u8, ids: &[u64]) {
    store.put_tiles(REGION, LAYER, coord, vec![fill; (TILE_DIM * TILE_DIM) as usize], 1);
    for &id in ids {
        store.put_occupant(REGION, record(id, OccupantKind::Dynamic, id as f64, 1.0, coord));
    }
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

pub fn state_of(manager: &ChunkManager, coord: ChunkCoord) -> Option<ChunkState> {
    manager.get_chunk(coord).map(|c| c.state())
}

pub fn wait_state(manager: &ChunkManager, coord: ChunkCoord, state: ChunkState) {
    wait_until(&format!("{coord} to become {state:?}"), || {
        state_of(manager, coord) == Some(state)
    });
}

/// Requests a load and waits for it to finish.
pub fn load(manager: &ChunkManager, coord: ChunkCoord) {
    manager.request_load(coord);
    wait_state(manager, coord, ChunkState::Preloaded);
}

/// Occupant ids buffered in a chunk, sorted.
pub fn buffered_ids(manager: &ChunkManager, coord: ChunkCoord) -> Vec<u64> {
    let mut ids: Vec<u64> = manager
        .get_chunk(coord)
        .map(|c| c.buffered_occupants().iter().map(|r| r.id).collect())
        .unwrap_or_default();
    ids.sort_unstable();
    ids
}
