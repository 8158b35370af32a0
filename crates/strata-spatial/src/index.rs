//! Uniform-grid point index over static and dynamic occupants.
//!
//! The index does not remember where a handle is: callers pass the position
//! on every add/remove, and must remove-then-add (or call
//! [`SpatialIndex::update_dynamic`]) when an occupant moves. Queries are
//! conservative: every handle in a cell touching the query box is returned,
//! so callers re-filter by exact distance.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::morton::{cell_coord, morton_decode, morton_encode};

/// Live simulation handle of an indexed occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(pub u64);

impl std::fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type CellMap = FxHashMap<u64, Vec<EntityHandle>>;

#[derive(Default)]
struct Populations {
    statics: CellMap,
    dynamics: CellMap,
}

impl Populations {
    fn occupied_cells(&self) -> usize {
        self.statics.len() + self.dynamics.len()
    }
}

/// Spatial index for one chunk.
///
/// All operations take `&self`; a reader/writer lock guards both
/// populations so the index can be shared between the tick thread and
/// query callers.
pub struct SpatialIndex {
    cell_size: f64,
    cells: RwLock<Populations>,
    /// Moves dropped because the handle was not in its old cell.
    missed_updates: AtomicU64,
}

impl SpatialIndex {
    /// Creates an empty index with square cells of `cell_size` world units.
    ///
    /// Non-finite or non-positive sizes fall back to 1.0.
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            1.0
        };
        Self {
            cell_size,
            cells: RwLock::new(Populations::default()),
            missed_updates: AtomicU64::new(0),
        }
    }

    /// Cell edge length in world units.
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Morton key of the cell containing `(x, y)`.
    pub fn cell_key(&self, x: f64, y: f64) -> u64 {
        morton_encode(cell_coord(x, self.cell_size), cell_coord(y, self.cell_size))
    }

    /// Inserts a static occupant.
    pub fn add_static(&self, handle: EntityHandle, x: f64, y: f64) {
        let key = self.cell_key(x, y);
        self.cells.write().statics.entry(key).or_default().push(handle);
    }

    /// Inserts a dynamic occupant.
    pub fn add_dynamic(&self, handle: EntityHandle, x: f64, y: f64) {
        let key = self.cell_key(x, y);
        self.cells.write().dynamics.entry(key).or_default().push(handle);
    }

    /// Removes a static occupant. Returns `false` if it was not in that cell.
    pub fn remove_static(&self, handle: EntityHandle, x: f64, y: f64) -> bool {
        let key = self.cell_key(x, y);
        remove_from(&mut self.cells.write().statics, key, handle)
    }

    /// Removes a dynamic occupant. Returns `false` if it was not in that cell.
    pub fn remove_dynamic(&self, handle: EntityHandle, x: f64, y: f64) -> bool {
        let key = self.cell_key(x, y);
        remove_from(&mut self.cells.write().dynamics, key, handle)
    }

    /// Moves a dynamic occupant from its old cell to its new one.
    ///
    /// When both positions share a cell nothing changes. When the handle is
    /// missing from the old cell it is *not* inserted into the new one: a
    /// stale caller must not resurrect a removed handle. Such misses are
    /// counted in [`missed_updates`](Self::missed_updates).
    ///
    /// Returns `true` if the handle is now indexed at the new position.
    pub fn update_dynamic(
        &self,
        handle: EntityHandle,
        old_x: f64,
        old_y: f64,
        new_x: f64,
        new_y: f64,
    ) -> bool {
        let old_key = self.cell_key(old_x, old_y);
        let new_key = self.cell_key(new_x, new_y);

        let mut cells = self.cells.write();
        if old_key == new_key {
            let present = cells
                .dynamics
                .get(&old_key)
                .is_some_and(|cell| cell.contains(&handle));
            if !present {
                self.record_miss(handle, old_x, old_y);
            }
            return present;
        }

        if !remove_from(&mut cells.dynamics, old_key, handle) {
            self.record_miss(handle, old_x, old_y);
            return false;
        }
        cells.dynamics.entry(new_key).or_default().push(handle);
        true
    }

    fn record_miss(&self, handle: EntityHandle, x: f64, y: f64) {
        self.missed_updates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%handle, x, y, "dynamic update for handle missing from its old cell");
    }

    /// Handles in every cell intersecting the square of half-extent `radius`
    /// centred on `(x, y)`.
    pub fn query_radius(&self, x: f64, y: f64, radius: f64) -> Vec<EntityHandle> {
        let r = radius.abs();
        self.query_aabb(x - r, y - r, x + r, y + r)
    }

    /// Handles in every cell intersecting the box `[min, max]`.
    ///
    /// Inverted bounds are swapped.
    pub fn query_aabb(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<EntityHandle> {
        let (min_x, max_x) = if min_x <= max_x { (min_x, max_x) } else { (max_x, min_x) };
        let (min_y, max_y) = if min_y <= max_y { (min_y, max_y) } else { (max_y, min_y) };

        let min_cx = cell_coord(min_x, self.cell_size);
        let max_cx = cell_coord(max_x, self.cell_size);
        let min_cy = cell_coord(min_y, self.cell_size);
        let max_cy = cell_coord(max_y, self.cell_size);

        let cells = self.cells.read();
        let mut out = Vec::new();

        let width = (max_cx as i64 - min_cx as i64 + 1) as u64;
        let height = (max_cy as i64 - min_cy as i64 + 1) as u64;
        let span = width.saturating_mul(height);
        if span > cells.occupied_cells() as u64 {
            // Box covers more cells than are occupied: scan occupied cells instead.
            let in_range = |key: &u64| {
                let (cx, cy) = morton_decode(*key);
                (min_cx..=max_cx).contains(&cx) && (min_cy..=max_cy).contains(&cy)
            };
            for map in [&cells.statics, &cells.dynamics] {
                for (_, cell) in map.iter().filter(|(key, _)| in_range(key)) {
                    out.extend_from_slice(cell);
                }
            }
            return out;
        }

        for cx in min_cx..=max_cx {
            for cy in min_cy..=max_cy {
                let key = morton_encode(cx, cy);
                if let Some(cell) = cells.statics.get(&key) {
                    out.extend_from_slice(cell);
                }
                if let Some(cell) = cells.dynamics.get(&key) {
                    out.extend_from_slice(cell);
                }
            }
        }
        out
    }

    /// Drops every static occupant.
    pub fn clear_static(&self) {
        self.cells.write().statics.clear();
    }

    /// Drops every dynamic occupant.
    pub fn clear_dynamic(&self) {
        self.cells.write().dynamics.clear();
    }

    /// Drops both populations.
    pub fn clear(&self) {
        let mut cells = self.cells.write();
        cells.statics.clear();
        cells.dynamics.clear();
    }

    /// Every indexed handle, static first.
    pub fn all_handles(&self) -> Vec<EntityHandle> {
        let cells = self.cells.read();
        cells
            .statics
            .values()
            .chain(cells.dynamics.values())
            .flatten()
            .copied()
            .collect()
    }

    /// Every dynamic handle; the per-tick movement pass iterates these.
    pub fn dynamic_handles(&self) -> Vec<EntityHandle> {
        self.cells.read().dynamics.values().flatten().copied().collect()
    }

    /// Every static handle.
    pub fn static_handles(&self) -> Vec<EntityHandle> {
        self.cells.read().statics.values().flatten().copied().collect()
    }

    /// Total number of indexed entries.
    pub fn len(&self) -> usize {
        let cells = self.cells.read();
        cells.statics.values().map(Vec::len).sum::<usize>()
            + cells.dynamics.values().map(Vec::len).sum::<usize>()
    }

    /// Returns `true` if neither population holds an entry.
    pub fn is_empty(&self) -> bool {
        self.cells.read().occupied_cells() == 0
    }

    /// Number of non-empty cells across both populations.
    pub fn cell_count(&self) -> usize {
        self.cells.read().occupied_cells()
    }

    /// Number of dynamic updates dropped because the handle was not found.
    pub fn missed_updates(&self) -> u64 {
        self.missed_updates.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("cell_size", &self.cell_size)
            .field("entries", &self.len())
            .field("cells", &self.cell_count())
            .finish()
    }
}

/// Swap-removes `handle` from the cell at `key`, dropping the cell once empty.
fn remove_from(map: &mut CellMap, key: u64, handle: EntityHandle) -> bool {
    let Some(cell) = map.get_mut(&key) else {
        return false;
    };
    let Some(pos) = cell.iter().position(|h| *h == handle) else {
        return false;
    };
    cell.swap_remove(pos);
    if cell.is_empty() {
        map.remove(&key);
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn h(id: u64) -> EntityHandle {
        EntityHandle(id)
    }

    #[test]
    fn test_add_query_remove_dynamic() {
        let index = SpatialIndex::new(8.0);
        index.add_dynamic(h(42), 10.0, 10.0);

        let found = index.query_radius(10.0, 10.0, 5.0);
        assert_eq!(found.iter().filter(|x| **x == h(42)).count(), 1);

        index.remove_dynamic(h(42), 10.0, 10.0);
        assert!(!index.query_radius(10.0, 10.0, 5.0).contains(&h(42)));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let index = SpatialIndex::new(8.0);
        index.add_static(h(1), 1.0, 1.0);
        index.add_dynamic(h(2), 1.0, 1.0);

        assert!(!index.remove_static(h(99), 1.0, 1.0));
        assert!(!index.remove_dynamic(h(99), 100.0, 100.0));
        // Right handle, wrong population.
        assert!(!index.remove_static(h(2), 1.0, 1.0));

        let mut all = index.all_handles();
        all.sort();
        assert_eq!(all, vec![h(1), h(2)]);
    }

    #[test]
    fn test_remove_keeps_other_entries_in_cell() {
        let index = SpatialIndex::new(8.0);
        for id in 0..5 {
            index.add_dynamic(h(id), 2.0, 2.0);
        }
        assert!(index.remove_dynamic(h(1), 2.0, 2.0));

        let mut left = index.query_aabb(0.0, 0.0, 4.0, 4.0);
        left.sort();
        assert_eq!(left, vec![h(0), h(2), h(3), h(4)]);
    }

    #[test]
    fn test_update_dynamic_moves_between_cells() {
        let index = SpatialIndex::new(8.0);
        index.add_dynamic(h(7), 1.0, 1.0);

        assert!(index.update_dynamic(h(7), 1.0, 1.0, 50.0, 50.0));
        assert!(!index.query_aabb(0.0, 0.0, 4.0, 4.0).contains(&h(7)));
        assert!(index.query_aabb(48.0, 48.0, 52.0, 52.0).contains(&h(7)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_update_dynamic_within_same_cell() {
        let index = SpatialIndex::new(8.0);
        index.add_dynamic(h(7), 1.0, 1.0);
        assert!(index.update_dynamic(h(7), 1.0, 1.0, 2.0, 2.0));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_update_without_presence_does_not_resurrect() {
        let index = SpatialIndex::new(8.0);
        index.add_dynamic(h(3), 60.0, 60.0);

        assert!(!index.update_dynamic(h(7), 1.0, 1.0, 60.0, 60.0));

        let target = index.query_aabb(56.0, 56.0, 63.0, 63.0);
        assert_eq!(target, vec![h(3)]);
        assert_eq!(index.missed_updates(), 1);
    }

    #[test]
    fn test_update_ignores_static_population() {
        let index = SpatialIndex::new(8.0);
        index.add_static(h(5), 1.0, 1.0);
        assert!(!index.update_dynamic(h(5), 1.0, 1.0, 30.0, 30.0));
        assert_eq!(index.static_handles(), vec![h(5)]);
        assert!(index.dynamic_handles().is_empty());
    }

    #[test]
    fn test_query_radius_is_conservative() {
        let index = SpatialIndex::new(10.0);
        // Same cell as the query centre but outside the exact radius.
        index.add_static(h(1), 9.9, 9.9);
        let found = index.query_radius(0.5, 0.5, 1.0);
        assert!(found.contains(&h(1)));
    }

    #[test]
    fn test_query_excludes_distant_cells() {
        let index = SpatialIndex::new(8.0);
        index.add_static(h(1), 0.0, 0.0);
        index.add_dynamic(h(2), 100.0, 100.0);
        index.add_dynamic(h(3), -100.0, 4.0);

        assert_eq!(index.query_radius(0.0, 0.0, 4.0), vec![h(1)]);
        assert_eq!(index.query_radius(-100.0, 4.0, 1.0), vec![h(3)]);
    }

    #[test]
    fn test_query_spanning_negative_cells() {
        let index = SpatialIndex::new(8.0);
        index.add_dynamic(h(1), -3.0, -3.0);
        index.add_dynamic(h(2), 3.0, 3.0);

        let mut found = index.query_radius(0.0, 0.0, 1.0);
        found.sort();
        assert_eq!(found, vec![h(1), h(2)]);
    }

    #[test]
    fn test_huge_query_uses_occupied_cells() {
        let index = SpatialIndex::new(1.0);
        index.add_static(h(1), 5.0, 5.0);
        index.add_dynamic(h(2), -1.0e6, 1.0e6);
        index.add_dynamic(h(3), 1.0e9, 1.0e9);

        let mut found = index.query_aabb(-2.0e6, -2.0e6, 2.0e6, 2.0e6);
        found.sort();
        assert_eq!(found, vec![h(1), h(2)]);
    }

    #[test]
    fn test_inverted_aabb_is_normalised() {
        let index = SpatialIndex::new(8.0);
        index.add_static(h(1), 5.0, 5.0);
        assert_eq!(index.query_aabb(10.0, 10.0, 0.0, 0.0), vec![h(1)]);
    }

    #[test]
    fn test_clear_populations_independently() {
        let index = SpatialIndex::new(8.0);
        index.add_static(h(1), 0.0, 0.0);
        index.add_dynamic(h(2), 0.0, 0.0);

        index.clear_dynamic();
        assert_eq!(index.all_handles(), vec![h(1)]);

        index.add_dynamic(h(2), 0.0, 0.0);
        index.clear_static();
        assert_eq!(index.all_handles(), vec![h(2)]);

        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.cell_count(), 0);
    }

    #[test]
    fn test_invalid_cell_size_falls_back() {
        assert_eq!(SpatialIndex::new(0.0).cell_size(), 1.0);
        assert_eq!(SpatialIndex::new(f64::INFINITY).cell_size(), 1.0);
        assert_eq!(SpatialIndex::new(-4.0).cell_size(), 1.0);
    }

    #[test]
    fn test_concurrent_mutation_and_queries() {
        let index = Arc::new(SpatialIndex::new(4.0));
        let mut threads = Vec::new();

        for t in 0..4u64 {
            let index = Arc::clone(&index);
            threads.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    let id = t * 1000 + i;
                    let pos = (i % 32) as f64;
                    index.add_dynamic(h(id), pos, pos);
                    let _ = index.query_radius(pos, pos, 2.0);
                    if i % 2 == 0 {
                        assert!(index.update_dynamic(h(id), pos, pos, pos + 10.0, pos));
                    }
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(index.len(), 1000);
        assert_eq!(index.dynamic_handles().len(), 1000);
        assert_eq!(index.missed_updates(), 0);
    }
}
