//! In-memory [`ChunkStore`] and entity world.
//!
//! Used by the demo server and the test suite. [`MemoryStore`] counts every
//! call and can inject latency and failures; [`MemoryWorld`] is a minimal
//! entity simulation implementing [`OccupantFactory`] and
//! [`EntityComponents`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use strata_spatial::EntityHandle;

use crate::coord::{ChunkCoord, LayerId};
use crate::occupant::{
    ChunkAffiliation, EntityComponents, OccupantError, OccupantFactory, OccupantRecord, Placement,
};
use crate::store::{ChunkStore, StorageError, StoredTiles};

type ChunkKey = (String, LayerId, ChunkCoord);

#[derive(Debug, Default)]
struct Tables {
    tiles: FxHashMap<ChunkKey, StoredTiles>,
    occupants: FxHashMap<(String, u64), OccupantRecord>,
}

/// Call counters of a [`MemoryStore`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreCalls {
    pub tile_reads: u64,
    pub occupant_reads: u64,
    pub tile_upserts: u64,
    pub occupant_upserts: u64,
}

/// A [`ChunkStore`] backed by hash maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    tile_reads: AtomicU64,
    occupant_reads: AtomicU64,
    tile_upserts: AtomicU64,
    occupant_upserts: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a chunk's tiles without counting a call.
    pub fn put_tiles(&self, region: &str, layer: LayerId, coord: ChunkCoord, tiles: Vec<u8>, last_tick: u64) {
        self.tables
            .lock()
            .tiles
            .insert((region.to_string(), layer, coord), StoredTiles { tiles, last_tick });
    }

    /// Seeds an occupant without counting a call.
    pub fn put_occupant(&self, region: &str, record: OccupantRecord) {
        self.tables
            .lock()
            .occupants
            .insert((region.to_string(), record.id), record);
    }

    pub fn tiles_of(&self, region: &str, layer: LayerId, coord: ChunkCoord) -> Option<StoredTiles> {
        self.tables
            .lock()
            .tiles
            .get(&(region.to_string(), layer, coord))
            .cloned()
    }

    /// Stored occupants of a chunk, sorted by id.
    pub fn occupants_of(&self, region: &str, layer: LayerId, coord: ChunkCoord) -> Vec<OccupantRecord> {
        let tables = self.tables.lock();
        let mut records: Vec<OccupantRecord> = tables
            .occupants
            .iter()
            .filter(|((r, _), rec)| r == region && rec.layer == layer && rec.coord == coord)
            .map(|(_, rec)| rec.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn calls(&self) -> StoreCalls {
        StoreCalls {
            tile_reads: self.tile_reads.load(Ordering::Relaxed),
            occupant_reads: self.occupant_reads.load(Ordering::Relaxed),
            tile_upserts: self.tile_upserts.load(Ordering::Relaxed),
            occupant_upserts: self.occupant_upserts.load(Ordering::Relaxed),
        }
    }

    pub fn reset_calls(&self) {
        for counter in [
            &self.tile_reads,
            &self.occupant_reads,
            &self.tile_upserts,
            &self.occupant_upserts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Makes every read fail with a backend error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    fn before_call(&self, counter: &AtomicU64, failing: &AtomicBool) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        counter.fetch_add(1, Ordering::Relaxed);
        if failing.load(Ordering::Relaxed) {
            return Err(StorageError::Backend("injected failure".to_string()));
        }
        Ok(())
    }
}

impl ChunkStore for MemoryStore {
    fn get_chunk_tiles(
        &self,
        region: &str,
        coord: ChunkCoord,
        layer: LayerId,
    ) -> Result<Option<StoredTiles>, StorageError> {
        self.before_call(&self.tile_reads, &self.fail_reads)?;
        Ok(self.tiles_of(region, layer, coord))
    }

    fn get_occupants_by_chunk(
        &self,
        region: &str,
        coord: ChunkCoord,
        layer: LayerId,
    ) -> Result<Vec<OccupantRecord>, StorageError> {
        self.before_call(&self.occupant_reads, &self.fail_reads)?;
        Ok(self.occupants_of(region, layer, coord))
    }

    fn upsert_chunk_tiles(
        &self,
        region: &str,
        coord: ChunkCoord,
        layer: LayerId,
        tiles: &[u8],
        last_tick: u64,
    ) -> Result<(), StorageError> {
        self.before_call(&self.tile_upserts, &self.fail_writes)?;
        self.put_tiles(region, layer, coord, tiles.to_vec(), last_tick);
        Ok(())
    }

    fn upsert_occupant(&self, region: &str, record: &OccupantRecord) -> Result<(), StorageError> {
        self.before_call(&self.occupant_upserts, &self.fail_writes)?;
        self.put_occupant(region, record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LiveEntity {
    record: OccupantRecord,
    affiliation: Option<ChunkAffiliation>,
}

#[derive(Debug, Default)]
struct WorldState {
    live: FxHashMap<EntityHandle, LiveEntity>,
    failing: FxHashSet<u64>,
    unserializable: FxHashSet<u64>,
}

/// A minimal entity simulation.
///
/// Handles are never reused; each instantiation gets a fresh one.
#[derive(Debug)]
pub struct MemoryWorld {
    state: Mutex<WorldState>,
    next_handle: AtomicU64,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Moves a live entity. Returns its old placement.
    pub fn move_to(&self, handle: EntityHandle, x: f64, y: f64) -> Option<Placement> {
        let mut state = self.state.lock();
        let entity = state.live.get_mut(&handle)?;
        let old = Placement {
            kind: entity.record.kind,
            x: entity.record.x,
            y: entity.record.y,
        };
        entity.record.x = x;
        entity.record.y = y;
        Some(old)
    }

    /// Handle of the live entity with occupant id `id`.
    pub fn handle_of(&self, id: u64) -> Option<EntityHandle> {
        self.state
            .lock()
            .live
            .iter()
            .find(|(_, e)| e.record.id == id)
            .map(|(h, _)| *h)
    }

    pub fn is_live(&self, handle: EntityHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// Occupant ids of every live entity, sorted.
    pub fn live_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().live.values().map(|e| e.record.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Makes instantiation of occupant `id` fail.
    pub fn fail_instantiation_of(&self, id: u64) {
        self.state.lock().failing.insert(id);
    }

    /// Makes serialization of occupant `id` fail.
    pub fn fail_serialization_of(&self, id: u64) {
        self.state.lock().unserializable.insert(id);
    }

    /// Undoes [`fail_serialization_of`](Self::fail_serialization_of).
    pub fn allow_serialization_of(&self, id: u64) {
        self.state.lock().unserializable.remove(&id);
    }
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl OccupantFactory for MemoryWorld {
    fn instantiate(&self, record: &OccupantRecord) -> Result<EntityHandle, OccupantError> {
        let mut state = self.state.lock();
        if state.failing.contains(&record.id) {
            return Err(OccupantError::Instantiate {
                id: record.id,
                reason: "injected failure".to_string(),
            });
        }
        let handle = EntityHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.live.insert(
            handle,
            LiveEntity {
                record: record.clone(),
                affiliation: None,
            },
        );
        Ok(handle)
    }

    fn serialize(&self, handle: EntityHandle) -> Result<OccupantRecord, OccupantError> {
        let state = self.state.lock();
        let entity = state.live.get(&handle).ok_or(OccupantError::UnknownEntity(handle))?;
        if state.unserializable.contains(&entity.record.id) {
            return Err(OccupantError::Serialize {
                handle,
                reason: "injected failure".to_string(),
            });
        }
        Ok(entity.record.clone())
    }

    fn despawn(&self, handle: EntityHandle) {
        self.state.lock().live.remove(&handle);
    }
}

impl EntityComponents for MemoryWorld {
    fn affiliation(&self, handle: EntityHandle) -> Option<ChunkAffiliation> {
        self.state.lock().live.get(&handle)?.affiliation
    }

    fn set_affiliation(&self, handle: EntityHandle, affiliation: ChunkAffiliation) {
        if let Some(entity) = self.state.lock().live.get_mut(&handle) {
            entity.affiliation = Some(affiliation);
            entity.record.coord = affiliation.current;
        }
    }

    fn placement(&self, handle: EntityHandle) -> Option<Placement> {
        let state = self.state.lock();
        let entity = state.live.get(&handle)?;
        Some(Placement {
            kind: entity.record.kind,
            x: entity.record.x,
            y: entity.record.y,
        })
    }
}
