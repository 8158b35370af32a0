//! Per-layer chunk manager.
//!
//! Lock order, outermost first: a chunk's transition lock (two only during
//! migration, taken in coordinate order), the chunk table, the state sets,
//! the eviction cache, chunk data. Locks at the same level are never nested,
//! and no lock is held across a storage call.

mod eviction;
mod migration;
mod preload;
mod stats;
mod workers;

pub use migration::MigrationOutcome;
pub use preload::{ObserverId, PreloadDiff};
pub use stats::ManagerStats;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use crate::cache::RecencyCache;
use crate::chunk::{Chunk, ChunkSnapshot, ChunkState};
use crate::clock::{Clock, SystemClock};
use crate::coord::{ChunkCoord, LayerId};
use crate::error::ChunkError;
use crate::events::{ChunkEventSink, NullSink};
use crate::ledger::{SaveLedger, WriteTicket};
use crate::occupant::{ChunkAffiliation, EntityComponents, OccupantFactory, OccupantKind, OccupantRecord};
use crate::queue::{LoadJob, LoadQueue, SaveJob, SaveOrigin, SaveQueue};
use crate::store::{ChunkStore, IoPool};
use crate::EntityHandle;

use stats::Counters;

/// Tuning for one [`ChunkManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Storage region key.
    pub region: String,
    /// Tiles per chunk side.
    pub tile_grid_dim: u32,
    /// Spatial index cell size in world units.
    pub cell_size: f64,
    /// Chebyshev radius of the preload zone around each observer.
    pub preload_radius: u32,
    pub cache_capacity: usize,
    /// Idle time before a cached chunk is evicted. Zero disables expiry.
    pub cache_ttl: Duration,
    /// How often the janitor sweeps the cache. Zero disables the janitor;
    /// call [`ChunkManager::sweep`] instead.
    pub sweep_interval: Duration,
    pub load_workers: usize,
    pub save_workers: usize,
    pub load_queue_capacity: usize,
    pub save_queue_capacity: usize,
    /// Deadline for one chunk's storage reads. Zero means no deadline.
    pub load_timeout: Duration,
    /// Deadline for one chunk's storage writes. Zero means no deadline.
    pub save_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            region: "local".to_string(),
            tile_grid_dim: 32,
            cell_size: 8.0,
            preload_radius: 2,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            load_workers: 2,
            save_workers: 1,
            load_queue_capacity: 256,
            save_queue_capacity: 256,
            load_timeout: Duration::from_secs(2),
            save_timeout: Duration::from_secs(5),
        }
    }
}

/// Collaborators injected into a manager.
#[derive(Clone)]
pub struct ManagerDeps {
    pub store: Arc<dyn ChunkStore>,
    pub factory: Arc<dyn OccupantFactory>,
    pub components: Arc<dyn EntityComponents>,
    pub sink: Arc<dyn ChunkEventSink>,
    pub clock: Arc<dyn Clock>,
}

impl ManagerDeps {
    /// Dependencies with no event consumer and the system clock.
    pub fn new(
        store: Arc<dyn ChunkStore>,
        factory: Arc<dyn OccupantFactory>,
        components: Arc<dyn EntityComponents>,
    ) -> Self {
        Self {
            store,
            factory,
            components,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChunkEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Membership sets; `active`, `preloaded` and the eviction cache are
/// pairwise disjoint.
#[derive(Debug, Default)]
struct StateSets {
    active: FxHashSet<ChunkCoord>,
    preloaded: FxHashSet<ChunkCoord>,
    zone: FxHashSet<ChunkCoord>,
    observers: FxHashMap<ObserverId, ChunkCoord>,
}

/// An evicted snapshot whose write has not been confirmed.
#[derive(Debug)]
struct PendingSave {
    snapshot: Arc<ChunkSnapshot>,
    ticket: Arc<WriteTicket>,
    failed: bool,
}

/// State shared between the manager handle and its worker threads.
pub(crate) struct Inner {
    config: ManagerConfig,
    layer: LayerId,
    deps: ManagerDeps,
    chunks: RwLock<FxHashMap<ChunkCoord, Arc<Chunk>>>,
    sets: RwLock<StateSets>,
    cache: Mutex<RecencyCache<ChunkCoord>>,
    load_queue: LoadQueue,
    save_queue: SaveQueue,
    pending_saves: DashMap<ChunkCoord, PendingSave>,
    ledger: Arc<SaveLedger>,
    load_io: IoPool,
    save_io: IoPool,
    counters: Counters,
    shutting_down: AtomicBool,
}

/// Owns every chunk of one layer and drives their lifecycle.
///
/// All methods take `&self` and are safe to call from any thread. Dropping
/// the manager performs [`shutdown`](Self::shutdown).
pub struct ChunkManager {
    inner: Arc<Inner>,
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChunkManager {
    /// Creates the manager and starts its load, save and janitor threads.
    pub fn new(config: ManagerConfig, layer: LayerId, deps: ManagerDeps) -> Result<Self, ChunkError> {
        let inner = Arc::new(Inner::new(config, layer, deps).map_err(ChunkError::Spawn)?);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let mut handles = Vec::new();
        let spawned = workers::spawn_all(&inner, &stop_rx, &mut handles);

        let manager = Self {
            inner,
            stop: Mutex::new(Some(stop_tx)),
            workers: Mutex::new(handles),
        };
        if let Err(err) = spawned {
            manager.shutdown();
            return Err(ChunkError::Spawn(err));
        }

        let config = &manager.inner.config;
        info!(
            %layer,
            region = %config.region,
            load_workers = config.load_workers,
            save_workers = config.save_workers,
            preload_radius = config.preload_radius,
            "chunk manager started"
        );
        Ok(manager)
    }

    pub fn layer(&self) -> LayerId {
        self.inner.layer
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The resident chunk at `coord`, in any state.
    pub fn get_chunk(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.inner.get_chunk(coord)
    }

    /// The resident chunk at `coord`, creating an unloaded placeholder if
    /// there is none.
    pub fn get_or_create_chunk(&self, coord: ChunkCoord) -> Arc<Chunk> {
        self.inner.get_or_create_chunk(coord)
    }

    /// Queues a load if the chunk is unloaded. Returns `true` if a job was
    /// queued; a full queue drops the request and leaves the chunk unloaded.
    pub fn request_load(&self, coord: ChunkCoord) -> bool {
        self.inner.request_load(coord)
    }

    /// Brings a preloaded chunk's occupants to life.
    ///
    /// Returns [`ChunkError::ChunkNotLoaded`] after requesting a load if the
    /// chunk has no data yet. Activating an active chunk is a no-op.
    pub fn activate(&self, coord: ChunkCoord) -> Result<(), ChunkError> {
        self.inner.activate(coord)
    }

    /// Returns an active chunk's live occupants to dormant records.
    pub fn deactivate(&self, coord: ChunkCoord) -> Result<(), ChunkError> {
        self.inner.deactivate(coord)
    }

    /// Writes a resident chunk to storage without unloading it. Live
    /// occupants are captured but stay live.
    pub fn request_save(&self, coord: ChunkCoord) -> Result<(), ChunkError> {
        self.inner.request_save(coord)
    }

    /// Evicts `coord` now if it is eligible: resident, neither active nor
    /// preloaded, and not loading. Returns `true` if it was evicted.
    pub fn evict(&self, coord: ChunkCoord) -> bool {
        self.inner.evict(coord, eviction::SaveMode::Queued)
    }

    /// Evicts expired cache entries and retries failed saves. The janitor
    /// thread calls this on its interval.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Records `observer` at `coord` and updates the preload zone.
    pub fn update_observer(&self, observer: ObserverId, coord: ChunkCoord) -> PreloadDiff {
        self.inner.update_observer(observer, coord)
    }

    /// Single-observer form of [`update_observer`](Self::update_observer).
    pub fn on_observer_moved(&self, coord: ChunkCoord) -> PreloadDiff {
        self.inner.update_observer(ObserverId::PRIMARY, coord)
    }

    /// Forgets `observer`; chunks only it kept in the zone leave the zone.
    pub fn remove_observer(&self, observer: ObserverId) -> PreloadDiff {
        self.inner.remove_observer(observer)
    }

    /// Coordinates currently inside the preload zone, sorted.
    pub fn preload_zone(&self) -> Vec<ChunkCoord> {
        self.inner.preload_zone()
    }

    /// Moves an entity's chunk ownership from `from` to `to`.
    pub fn migrate_object(
        &self,
        handle: EntityHandle,
        from: ChunkCoord,
        to: ChunkCoord,
    ) -> Result<MigrationOutcome, ChunkError> {
        self.inner.migrate_object(handle, from, to)
    }

    /// Active chunks, sorted by coordinate.
    pub fn active_chunks(&self) -> Vec<Arc<Chunk>> {
        self.active_chunk_coords()
            .into_iter()
            .filter_map(|coord| self.inner.get_chunk(coord))
            .collect()
    }

    pub fn active_chunk_coords(&self) -> Vec<ChunkCoord> {
        sorted(&self.inner.sets.read().active)
    }

    pub fn preloaded_chunk_coords(&self) -> Vec<ChunkCoord> {
        sorted(&self.inner.sets.read().preloaded)
    }

    /// Returns `true` if `coord` is waiting in the eviction cache.
    pub fn is_cached(&self, coord: ChunkCoord) -> bool {
        self.inner.cache.lock().contains(&coord)
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.stats()
    }

    /// Stops the workers and writes every resident chunk.
    ///
    /// Active chunks are saved with their live occupants, which stay live.
    /// Preloaded chunks are saved in place. Every other resident chunk is
    /// evicted, including placeholders that only hold occupants that
    /// migrated in and chunks whose load was abandoned. Snapshots whose save
    /// never ran or failed are written synchronously. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(layer = %self.inner.layer, "chunk manager shutting down");

        drop(self.stop.lock().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("chunk-worker").to_string();
            if handle.join().is_err() {
                error!("worker thread {name} panicked");
            }
        }

        self.inner.flush_on_shutdown();
        info!("{}", self.inner.stats());
    }
}

impl Drop for ChunkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ChunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkManager")
            .field("layer", &self.inner.layer)
            .field("region", &self.inner.config.region)
            .field("resident", &self.inner.chunks.read().len())
            .finish()
    }
}

fn sorted(set: &FxHashSet<ChunkCoord>) -> Vec<ChunkCoord> {
    let mut coords: Vec<ChunkCoord> = set.iter().copied().collect();
    coords.sort_unstable();
    coords
}

impl Inner {
    fn new(config: ManagerConfig, layer: LayerId, deps: ManagerDeps) -> std::io::Result<Self> {
        let cache = RecencyCache::new(config.cache_capacity, config.cache_ttl);
        let load_queue = LoadQueue::new(config.load_queue_capacity);
        let save_queue = SaveQueue::new(config.save_queue_capacity);
        // One spare thread per pool so a single stuck call does not stall
        // every worker.
        let load_threads = config.load_workers.max(1) + 1;
        let save_threads = config.save_workers.max(1) + 1;
        let load_io = IoPool::new("chunk-load-io", load_threads, load_threads * 4, config.load_timeout)?;
        let save_io = IoPool::new("chunk-save-io", save_threads, save_threads * 4, config.save_timeout)?;
        Ok(Self {
            config,
            layer,
            deps,
            chunks: RwLock::new(FxHashMap::default()),
            sets: RwLock::new(StateSets::default()),
            cache: Mutex::new(cache),
            load_queue,
            save_queue,
            pending_saves: DashMap::new(),
            ledger: Arc::new(SaveLedger::new()),
            load_io,
            save_io,
            counters: Counters::default(),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn get_chunk(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.chunks.read().get(&coord).cloned()
    }

    fn get_or_create_chunk(&self, coord: ChunkCoord) -> Arc<Chunk> {
        if let Some(chunk) = self.chunks.read().get(&coord) {
            return Arc::clone(chunk);
        }
        let mut chunks = self.chunks.write();
        let chunk = chunks.entry(coord).or_insert_with(|| {
            Arc::new(Chunk::new(
                coord,
                self.layer,
                self.config.tile_grid_dim,
                self.config.cell_size,
            ))
        });
        Arc::clone(chunk)
    }

    fn request_load(&self, coord: ChunkCoord) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        loop {
            let chunk = self.get_or_create_chunk(coord);
            let transition = chunk.lock_transition();
            if chunk.is_retired() {
                continue;
            }

            match chunk.state() {
                ChunkState::Unloaded => {}
                ChunkState::Preloaded => {
                    let mut sets = self.sets.write();
                    if sets.zone.contains(&coord) {
                        sets.preloaded.insert(coord);
                    }
                    return false;
                }
                ChunkState::Loading | ChunkState::Active => return false,
            }

            Counters::bump(&self.counters.load_requests);
            chunk.set_state(ChunkState::Loading);
            let job = LoadJob {
                chunk: Arc::clone(&chunk),
                enqueued_at: self.deps.clock.now(),
            };
            if self.load_queue.offer(job).is_ok() {
                debug!(%coord, "chunk load queued");
                return true;
            }

            let overflow = self.park_unloaded(coord);
            chunk.set_state(ChunkState::Unloaded);
            drop(transition);
            Counters::bump(&self.counters.loads_dropped);
            warn!(%coord, layer = %self.layer, "load queue full; dropping load request");
            self.evict_overflow(overflow);
            return false;
        }
    }

    /// Files a chunk that fell back to `Unloaded` into the eviction cache,
    /// unless the zone or an activation still wants it. Caller holds the
    /// chunk's transition lock and evicts the returned overflow after
    /// releasing it.
    fn park_unloaded(&self, coord: ChunkCoord) -> Vec<ChunkCoord> {
        {
            let sets = self.sets.read();
            if sets.zone.contains(&coord) || sets.active.contains(&coord) {
                return Vec::new();
            }
        }
        let now = self.deps.clock.now();
        self.cache.lock().insert(coord, now)
    }

    fn activate(&self, coord: ChunkCoord) -> Result<(), ChunkError> {
        if self.is_shutting_down() {
            return Err(ChunkError::ShuttingDown);
        }
        let chunk = loop {
            let chunk = self.get_or_create_chunk(coord);
            if !chunk.is_retired() {
                break chunk;
            }
        };

        let transition = chunk.lock_transition();
        if chunk.is_retired() {
            drop(transition);
            return self.activate(coord);
        }
        match chunk.try_state()? {
            ChunkState::Active => return Ok(()),
            ChunkState::Unloaded | ChunkState::Loading => {
                drop(transition);
                self.request_load(coord);
                return Err(ChunkError::ChunkNotLoaded(coord));
            }
            ChunkState::Preloaded => {}
        }

        let index = chunk.index();
        index.clear();
        let mut live = 0usize;
        for handle in chunk.take_stranded() {
            match self.deps.components.placement(handle) {
                Some(at) => {
                    match at.kind {
                        OccupantKind::Static => index.add_static(handle, at.x, at.y),
                        OccupantKind::Dynamic => index.add_dynamic(handle, at.x, at.y),
                    }
                    live += 1;
                }
                None => warn!(%coord, %handle, "stranded occupant left the simulation"),
            }
        }
        let mut quarantined = Vec::new();
        for record in chunk.take_buffered() {
            match self.deps.factory.instantiate(&record) {
                Ok(handle) => {
                    self.deps
                        .components
                        .set_affiliation(handle, ChunkAffiliation::new(coord));
                    match record.kind {
                        OccupantKind::Static => index.add_static(handle, record.x, record.y),
                        OccupantKind::Dynamic => index.add_dynamic(handle, record.x, record.y),
                    }
                    live += 1;
                }
                Err(err) => {
                    error!(%coord, occupant = record.id, "skipping occupant: {err}");
                    Counters::bump(&self.counters.occupant_failures);
                    quarantined.push(record);
                }
            }
        }
        // Records that failed to instantiate stay buffered and are persisted
        // with the chunk.
        chunk.append_buffered(quarantined);
        {
            let mut sets = self.sets.write();
            sets.preloaded.remove(&coord);
            sets.active.insert(coord);
        }
        self.cache.lock().remove(&coord);
        chunk.set_state(ChunkState::Active);
        drop(transition);

        debug!(%coord, live, "chunk activated");
        Ok(())
    }

    fn deactivate(&self, coord: ChunkCoord) -> Result<(), ChunkError> {
        let chunk = self.get_chunk(coord).ok_or(ChunkError::ChunkNotFound(coord))?;
        let transition = chunk.lock_transition();
        if chunk.is_retired() {
            return Err(ChunkError::ChunkNotFound(coord));
        }
        if chunk.try_state()? != ChunkState::Active {
            return Err(ChunkError::ChunkNotActive(coord));
        }

        let index = chunk.index();
        let (records, stuck) = self.capture(coord, index.all_handles());
        for record in &records {
            self.deps.factory.despawn(record.handle);
        }
        let dormant = records.len();
        let stranded = stuck.len();
        chunk.append_buffered(records.into_iter().map(|r| r.record).collect());
        chunk.append_stranded(stuck);
        index.clear();
        let overflow = self.file_preloaded(coord);
        chunk.set_state(ChunkState::Preloaded);
        drop(transition);

        if stranded > 0 {
            warn!(%coord, stranded, "occupants failed to serialize and were left live");
        }
        self.evict_overflow(overflow);
        debug!(%coord, dormant, "chunk deactivated");
        Ok(())
    }

    /// Serializes live occupants of the chunk at `coord`. Returns the
    /// captured records and the handles that could not be serialized.
    fn capture(
        &self,
        coord: ChunkCoord,
        handles: impl IntoIterator<Item = EntityHandle>,
    ) -> (Vec<CapturedOccupant>, Vec<EntityHandle>) {
        let mut captured = Vec::new();
        let mut stuck = Vec::new();
        for handle in handles {
            match self.deps.factory.serialize(handle) {
                Ok(mut record) => {
                    record.coord = coord;
                    record.layer = self.layer;
                    captured.push(CapturedOccupant { handle, record });
                }
                Err(err) => {
                    error!(%coord, %handle, "failed to serialize occupant: {err}");
                    Counters::bump(&self.counters.occupant_failures);
                    stuck.push(handle);
                }
            }
        }
        (captured, stuck)
    }

    /// Files a chunk that is becoming preloaded: into the preloaded set when
    /// it is inside the zone, otherwise into the eviction cache. Caller holds
    /// the chunk's transition lock and passes the returned cache overflow to
    /// [`evict_overflow`](Self::evict_overflow) after releasing it.
    fn file_preloaded(&self, coord: ChunkCoord) -> Vec<ChunkCoord> {
        let in_zone = {
            let mut sets = self.sets.write();
            sets.active.remove(&coord);
            let in_zone = sets.zone.contains(&coord);
            if in_zone {
                sets.preloaded.insert(coord);
            }
            in_zone
        };
        let now = self.deps.clock.now();
        let mut cache = self.cache.lock();
        if in_zone {
            cache.remove(&coord);
            return Vec::new();
        }
        cache.insert(coord, now)
    }

    fn request_save(&self, coord: ChunkCoord) -> Result<(), ChunkError> {
        let chunk = self.get_chunk(coord).ok_or(ChunkError::ChunkNotFound(coord))?;
        let job = {
            let _transition = chunk.lock_transition();
            if chunk.is_retired() {
                return Err(ChunkError::ChunkNotFound(coord));
            }
            let live = match chunk.try_state()? {
                ChunkState::Active => chunk.index().all_handles(),
                ChunkState::Preloaded => chunk.stranded_handles(),
                ChunkState::Unloaded | ChunkState::Loading => {
                    return Err(ChunkError::ChunkNotLoaded(coord));
                }
            };
            let (live, _) = self.capture(coord, live);
            let snapshot = chunk.snapshot_with(live.into_iter().map(|c| c.record).collect());
            let ticket = self.ledger.issue(&snapshot);
            SaveJob {
                snapshot: Arc::new(snapshot),
                ticket,
                origin: SaveOrigin::Checkpoint,
            }
        };
        let mode = if self.is_shutting_down() {
            eviction::SaveMode::Inline
        } else {
            eviction::SaveMode::Queued
        };
        self.dispatch_save(job, mode);
        Ok(())
    }

    fn stats(&self) -> ManagerStats {
        let (resident, missed_updates, stranded) = {
            let chunks = self.chunks.read();
            let missed = chunks.values().map(|c| c.index().missed_updates()).sum();
            let stranded = chunks.values().map(|c| c.stranded_len()).sum();
            (chunks.len(), missed, stranded)
        };
        let (active, preloaded) = {
            let sets = self.sets.read();
            (sets.active.len(), sets.preloaded.len())
        };
        let cached = self.cache.lock().len();
        let c = &self.counters;
        ManagerStats {
            layer: self.layer,
            resident,
            active,
            preloaded,
            inactive: resident.saturating_sub(active + preloaded),
            cached,
            load_queue_depth: self.load_queue.len(),
            save_queue_depth: self.save_queue.len(),
            pending_saves: self.pending_saves.len(),
            stranded,
            load_requests: Counters::get(&c.load_requests),
            loads_dropped: Counters::get(&c.loads_dropped),
            loads_completed: Counters::get(&c.loads_completed),
            loads_degraded: Counters::get(&c.loads_degraded),
            loads_timed_out: Counters::get(&c.loads_timed_out),
            cache_hits: Counters::get(&c.cache_hits),
            cache_misses: Counters::get(&c.cache_misses),
            evictions: Counters::get(&c.evictions),
            saves_completed: Counters::get(&c.saves_completed),
            saves_inline: Counters::get(&c.saves_inline),
            saves_failed: Counters::get(&c.saves_failed),
            writes_superseded: self.ledger.skipped(),
            occupant_failures: Counters::get(&c.occupant_failures),
            missed_updates,
        }
    }

    fn flush_on_shutdown(&self) {
        // The workers are gone; queued loads will never run.
        let all: Vec<Arc<Chunk>> = self.chunks.read().values().cloned().collect();
        for chunk in &all {
            let _transition = chunk.lock_transition();
            if !chunk.is_retired() && chunk.state() == ChunkState::Loading {
                chunk.set_state(ChunkState::Unloaded);
            }
        }

        let resident: Vec<ChunkCoord> = {
            let sets = self.sets.read();
            sets.active.iter().chain(sets.preloaded.iter()).copied().collect()
        };
        for coord in resident {
            if let Err(err) = self.request_save(coord) {
                warn!(%coord, "shutdown save skipped: {err}");
            }
        }

        let cached = self.cache.lock().drain();
        for coord in cached {
            self.evict(coord, eviction::SaveMode::Inline);
        }

        // Chunks outside the cache that are neither active nor preloaded:
        // placeholders in the zone and chunks whose load was abandoned.
        let leftover: Vec<ChunkCoord> = {
            let chunks = self.chunks.read();
            let sets = self.sets.read();
            chunks
                .keys()
                .filter(|c| !sets.active.contains(c) && !sets.preloaded.contains(c))
                .copied()
                .collect()
        };
        for coord in leftover {
            self.evict(coord, eviction::SaveMode::Inline);
        }

        self.retry_pending_saves(true, eviction::SaveMode::Inline);
        let left = self.pending_saves.len();
        if left > 0 {
            error!(layer = %self.layer, left, "chunk snapshots could not be written before shutdown");
        }
        let stranded: usize = self.chunks.read().values().map(|c| c.stranded_len()).sum();
        if stranded > 0 {
            error!(layer = %self.layer, stranded, "occupants could not be serialized before shutdown");
        }

        self.load_io.close();
        self.save_io.close();
    }
}

struct CapturedOccupant {
    handle: EntityHandle,
    record: OccupantRecord,
}
