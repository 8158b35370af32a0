//! A single chunk: lifecycle state, tile payload, buffered occupants and
//! the spatial index of its live occupants.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashSet;
use strata_spatial::{EntityHandle, SpatialIndex};

use crate::coord::{ChunkCoord, LayerId};
use crate::error::ChunkError;
use crate::occupant::OccupantRecord;

/// Lifecycle state of a chunk.
///
/// Legal transitions:
///
/// ```text
/// Unloaded → Loading → Preloaded ⇄ Active
/// Loading → Unloaded            (load dropped or timed out)
/// Preloaded | Unloaded → evicted
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkState {
    /// No data in memory. May still hold occupants that migrated in.
    Unloaded = 0,
    /// A load job is queued or running.
    Loading = 1,
    /// Data in memory, occupants dormant as records.
    Preloaded = 2,
    /// Occupants live in the simulation and indexed.
    Active = 3,
}

impl TryFrom<u8> for ChunkState {
    type Error = ChunkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unloaded),
            1 => Ok(Self::Loading),
            2 => Ok(Self::Preloaded),
            3 => Ok(Self::Active),
            other => Err(ChunkError::InvalidChunkState(other)),
        }
    }
}

#[derive(Debug, Default)]
struct ChunkData {
    tiles: Option<Vec<u8>>,
    last_tick: u64,
    raw_occupants: Vec<OccupantRecord>,
    degraded: bool,
    /// Live entities that failed to serialize when the chunk deactivated.
    stranded: Vec<EntityHandle>,
}

/// Everything that must be persisted for a chunk, detached from it.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkSnapshot {
    pub coord: ChunkCoord,
    pub layer: LayerId,
    /// `None` when the chunk never finished loading.
    pub tiles: Option<Vec<u8>>,
    pub last_tick: u64,
    pub occupants: Vec<OccupantRecord>,
    /// Tiles are placeholders from a failed load and must not be written.
    pub degraded: bool,
}

impl ChunkSnapshot {
    /// Returns `true` if there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_none() && self.occupants.is_empty()
    }

    /// Returns `true` if the tile payload should be upserted.
    pub fn writes_tiles(&self) -> bool {
        self.tiles.is_some() && !self.degraded
    }

    /// Layers this snapshot over an older unsaved snapshot of the same
    /// chunk. Occupants here replace older records with the same id. Tiles
    /// come from this snapshot unless it has none, or only placeholder
    /// tiles while the older one has real ones.
    pub fn merged_over(self, older: &ChunkSnapshot) -> ChunkSnapshot {
        let newer_ids: FxHashSet<u64> = self.occupants.iter().map(|r| r.id).collect();
        let mut occupants: Vec<OccupantRecord> = older
            .occupants
            .iter()
            .filter(|r| !newer_ids.contains(&r.id))
            .cloned()
            .collect();
        occupants.extend(self.occupants);

        let keep_older_tiles =
            self.tiles.is_none() || (self.degraded && older.writes_tiles());
        let (tiles, last_tick, degraded) = if keep_older_tiles {
            (older.tiles.clone(), older.last_tick, older.degraded)
        } else {
            (self.tiles, self.last_tick, self.degraded)
        };
        ChunkSnapshot {
            coord: self.coord,
            layer: self.layer,
            tiles,
            last_tick,
            occupants,
            degraded,
        }
    }
}

/// A fixed-size square of tiles plus its occupants.
///
/// State changes are serialized by a per-chunk transition lock held by the
/// manager; readers may observe the state at any time.
pub struct Chunk {
    coord: ChunkCoord,
    layer: LayerId,
    tile_grid_dim: u32,
    state: AtomicU8,
    retired: AtomicBool,
    transition: Mutex<()>,
    data: RwLock<ChunkData>,
    index: SpatialIndex,
}

impl Chunk {
    /// Creates an unloaded placeholder.
    pub fn new(coord: ChunkCoord, layer: LayerId, tile_grid_dim: u32, cell_size: f64) -> Self {
        Self {
            coord,
            layer,
            tile_grid_dim,
            state: AtomicU8::new(ChunkState::Unloaded as u8),
            retired: AtomicBool::new(false),
            transition: Mutex::new(()),
            data: RwLock::new(ChunkData::default()),
            index: SpatialIndex::new(cell_size),
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn tile_grid_dim(&self) -> u32 {
        self.tile_grid_dim
    }

    /// Number of tiles in a fully loaded payload.
    pub fn tile_count(&self) -> usize {
        self.tile_grid_dim as usize * self.tile_grid_dim as usize
    }

    /// Decodes the state word.
    pub fn try_state(&self) -> Result<ChunkState, ChunkError> {
        ChunkState::try_from(self.state.load(Ordering::Acquire))
    }

    /// Current state. The state word only ever holds values written through
    /// [`ChunkState`], so decoding cannot fail in practice.
    pub fn state(&self) -> ChunkState {
        self.try_state().unwrap_or(ChunkState::Unloaded)
    }

    pub(crate) fn set_state(&self, state: ChunkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock()
    }

    /// Returns `true` once the chunk has been evicted from its manager.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Spatial index of live occupants; `None` unless the chunk is active.
    pub fn spatial(&self) -> Option<&SpatialIndex> {
        (self.state() == ChunkState::Active).then_some(&self.index)
    }

    pub(crate) fn index(&self) -> &SpatialIndex {
        &self.index
    }

    /// Returns `true` if tile data has been installed.
    pub fn is_loaded(&self) -> bool {
        self.data.read().tiles.is_some()
    }

    /// Returns `true` if the last load hit a storage error.
    pub fn is_degraded(&self) -> bool {
        self.data.read().degraded
    }

    /// A copy of the tile payload, if loaded.
    pub fn tiles(&self) -> Option<Vec<u8>> {
        self.data.read().tiles.clone()
    }

    /// Tile at grid position `(tx, ty)`.
    pub fn tile(&self, tx: u32, ty: u32) -> Option<u8> {
        let offset = self.tile_offset(tx, ty)?;
        self.data.read().tiles.as_ref()?.get(offset).copied()
    }

    /// Overwrites one tile. Returns `false` if the chunk is not loaded or the
    /// position is outside the grid.
    pub fn set_tile(&self, tx: u32, ty: u32, value: u8) -> bool {
        let Some(offset) = self.tile_offset(tx, ty) else {
            return false;
        };
        let mut data = self.data.write();
        match data.tiles.as_mut().and_then(|tiles| tiles.get_mut(offset)) {
            Some(tile) => {
                *tile = value;
                true
            }
            None => false,
        }
    }

    fn tile_offset(&self, tx: u32, ty: u32) -> Option<usize> {
        (tx < self.tile_grid_dim && ty < self.tile_grid_dim)
            .then(|| ty as usize * self.tile_grid_dim as usize + tx as usize)
    }

    pub fn last_tick(&self) -> u64 {
        self.data.read().last_tick
    }

    pub fn set_last_tick(&self, tick: u64) {
        self.data.write().last_tick = tick;
    }

    /// Number of dormant occupant records.
    pub fn buffered_len(&self) -> usize {
        self.data.read().raw_occupants.len()
    }

    /// A copy of the dormant occupant records.
    pub fn buffered_occupants(&self) -> Vec<OccupantRecord> {
        self.data.read().raw_occupants.clone()
    }

    pub(crate) fn take_buffered(&self) -> Vec<OccupantRecord> {
        std::mem::take(&mut self.data.write().raw_occupants)
    }

    pub(crate) fn append_buffered(&self, records: Vec<OccupantRecord>) {
        self.data.write().raw_occupants.extend(records);
    }

    pub(crate) fn push_buffered(&self, record: OccupantRecord) {
        self.data.write().raw_occupants.push(record);
    }

    /// Live entities that could not be serialized when the chunk last
    /// deactivated. They stay in the simulation, affiliated with this chunk,
    /// until a later save or eviction manages to serialize them.
    pub fn stranded_handles(&self) -> Vec<EntityHandle> {
        self.data.read().stranded.clone()
    }

    pub(crate) fn stranded_len(&self) -> usize {
        self.data.read().stranded.len()
    }

    pub(crate) fn take_stranded(&self) -> Vec<EntityHandle> {
        std::mem::take(&mut self.data.write().stranded)
    }

    pub(crate) fn append_stranded(&self, handles: Vec<EntityHandle>) {
        self.data.write().stranded.extend(handles);
    }

    /// Installs loaded data, merging in occupants that arrived while the
    /// chunk was unloaded or loading. On an id collision the buffered record
    /// is newer than storage and wins.
    ///
    /// Returns the merged occupant count.
    pub(crate) fn install_loaded(
        &self,
        tiles: Vec<u8>,
        last_tick: u64,
        stored: Vec<OccupantRecord>,
        degraded: bool,
    ) -> usize {
        let mut data = self.data.write();
        let early = std::mem::take(&mut data.raw_occupants);
        let early_ids: FxHashSet<u64> = early.iter().map(|r| r.id).collect();

        let mut merged: Vec<OccupantRecord> =
            stored.into_iter().filter(|r| !early_ids.contains(&r.id)).collect();
        merged.extend(early);

        data.tiles = Some(tiles);
        data.last_tick = last_tick;
        data.degraded = degraded;
        data.raw_occupants = merged;
        data.raw_occupants.len()
    }

    /// Moves all persistent data out of the chunk.
    pub(crate) fn take_snapshot(&self) -> ChunkSnapshot {
        let mut data = self.data.write();
        ChunkSnapshot {
            coord: self.coord,
            layer: self.layer,
            tiles: data.tiles.take(),
            last_tick: data.last_tick,
            occupants: std::mem::take(&mut data.raw_occupants),
            degraded: std::mem::take(&mut data.degraded),
        }
    }

    /// Copies the persistent data, adding `live` records for occupants that
    /// are currently instantiated.
    pub(crate) fn snapshot_with(&self, live: Vec<OccupantRecord>) -> ChunkSnapshot {
        let data = self.data.read();
        let mut occupants = data.raw_occupants.clone();
        occupants.extend(live);
        ChunkSnapshot {
            coord: self.coord,
            layer: self.layer,
            tiles: data.tiles.clone(),
            last_tick: data.last_tick,
            occupants,
            degraded: data.degraded,
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("layer", &self.layer)
            .field("state", &self.state())
            .field("retired", &self.is_retired())
            .field("buffered", &self.buffered_len())
            .field("stranded", &self.stranded_len())
            .field("indexed", &self.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occupant::OccupantKind;

    fn record(id: u64, x: f64) -> OccupantRecord {
        OccupantRecord {
            id,
            kind: OccupantKind::Static,
            x,
            y: 0.0,
            coord: ChunkCoord::new(0, 0),
            layer: LayerId(0),
            payload: Vec::new(),
        }
    }

    fn chunk() -> Chunk {
        Chunk::new(ChunkCoord::new(0, 0), LayerId(0), 4, 8.0)
    }

    #[test]
    fn test_new_chunk_is_unloaded_placeholder() {
        let chunk = chunk();
        assert_eq!(chunk.state(), ChunkState::Unloaded);
        assert!(!chunk.is_loaded());
        assert!(chunk.tiles().is_none());
        assert!(chunk.spatial().is_none());
        assert!(!chunk.is_retired());
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ChunkState::Unloaded,
            ChunkState::Loading,
            ChunkState::Preloaded,
            ChunkState::Active,
        ] {
            assert_eq!(ChunkState::try_from(state as u8).unwrap(), state);
        }
        assert!(matches!(ChunkState::try_from(9), Err(ChunkError::InvalidChunkState(9))));
    }

    #[test]
    fn test_spatial_only_when_active() {
        let chunk = chunk();
        chunk.set_state(ChunkState::Preloaded);
        assert!(chunk.spatial().is_none());
        chunk.set_state(ChunkState::Active);
        assert!(chunk.spatial().is_some());
    }

    #[test]
    fn test_tiles_require_load_and_bounds() {
        let chunk = chunk();
        assert!(!chunk.set_tile(0, 0, 5));

        chunk.install_loaded(vec![0; 16], 7, Vec::new(), false);
        assert!(chunk.set_tile(3, 2, 5));
        assert_eq!(chunk.tile(3, 2), Some(5));
        assert_eq!(chunk.tiles().unwrap()[2 * 4 + 3], 5);
        assert!(!chunk.set_tile(4, 0, 1));
        assert_eq!(chunk.tile(0, 4), None);
        assert_eq!(chunk.last_tick(), 7);
    }

    #[test]
    fn test_install_merges_early_occupants_and_prefers_them() {
        let chunk = chunk();
        chunk.push_buffered(record(2, 99.0));
        chunk.push_buffered(record(3, 1.0));

        let count = chunk.install_loaded(vec![0; 16], 0, vec![record(1, 0.0), record(2, 0.0)], false);
        assert_eq!(count, 3);

        let buffered = chunk.buffered_occupants();
        let two = buffered.iter().find(|r| r.id == 2).unwrap();
        assert_eq!(two.x, 99.0);
        assert_eq!(buffered.iter().filter(|r| r.id == 2).count(), 1);
    }

    #[test]
    fn test_take_snapshot_empties_chunk() {
        let chunk = chunk();
        chunk.install_loaded(vec![1; 16], 3, vec![record(1, 0.0)], true);

        let snapshot = chunk.take_snapshot();
        assert_eq!(snapshot.tiles.as_deref(), Some(&[1u8; 16][..]));
        assert_eq!(snapshot.occupants.len(), 1);
        assert!(snapshot.degraded);
        assert!(!snapshot.writes_tiles());

        assert!(!chunk.is_loaded());
        assert_eq!(chunk.buffered_len(), 0);
        assert!(!chunk.is_degraded());
    }

    #[test]
    fn test_placeholder_snapshot_skips_tiles() {
        let chunk = chunk();
        assert!(chunk.take_snapshot().is_empty());

        chunk.push_buffered(record(5, 0.0));
        let snapshot = chunk.take_snapshot();
        assert!(!snapshot.is_empty());
        assert!(!snapshot.writes_tiles());
    }

    fn snapshot(tiles: Option<Vec<u8>>, occupants: Vec<OccupantRecord>) -> ChunkSnapshot {
        ChunkSnapshot {
            coord: ChunkCoord::new(0, 0),
            layer: LayerId(0),
            tiles,
            last_tick: 0,
            occupants,
            degraded: false,
        }
    }

    #[test]
    fn test_merge_keeps_older_tiles_and_unreplaced_occupants() {
        let older = snapshot(Some(vec![9; 16]), vec![record(1, 0.0), record(2, 0.0)]);
        let newer = snapshot(None, vec![record(2, 50.0), record(3, 0.0)]);

        let merged = newer.merged_over(&older);
        assert_eq!(merged.tiles.as_deref(), Some(&[9u8; 16][..]));
        let mut ids: Vec<u64> = merged.occupants.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(merged.occupants.iter().find(|r| r.id == 2).unwrap().x, 50.0);
    }

    #[test]
    fn test_merge_prefers_newer_real_tiles() {
        let mut older = snapshot(Some(vec![1; 16]), Vec::new());
        older.last_tick = 3;
        let mut newer = snapshot(Some(vec![2; 16]), Vec::new());
        newer.last_tick = 8;
        let merged = newer.clone().merged_over(&older);
        assert_eq!(merged.tiles, Some(vec![2; 16]));
        assert_eq!(merged.last_tick, 8);

        newer.degraded = true;
        let merged = newer.merged_over(&older);
        assert_eq!(merged.tiles, Some(vec![1; 16]));
        assert!(merged.writes_tiles());
    }

    #[test]
    fn test_stranded_handles_are_tracked_separately() {
        let chunk = chunk();
        chunk.append_stranded(vec![EntityHandle(4), EntityHandle(5)]);
        assert_eq!(chunk.stranded_handles(), vec![EntityHandle(4), EntityHandle(5)]);
        assert_eq!(chunk.buffered_len(), 0);
        assert_eq!(chunk.take_stranded().len(), 2);
        assert!(chunk.stranded_handles().is_empty());
    }

    #[test]
    fn test_snapshot_with_keeps_buffer() {
        let chunk = chunk();
        chunk.install_loaded(vec![0; 16], 0, vec![record(1, 0.0)], false);
        let snapshot = chunk.snapshot_with(vec![record(2, 0.0)]);
        assert_eq!(snapshot.occupants.len(), 2);
        assert_eq!(chunk.buffered_len(), 1);
        assert!(chunk.is_loaded());
    }
}
