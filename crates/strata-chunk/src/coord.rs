//! Chunk and layer identifiers.

use serde::{Deserialize, Serialize};

/// Identifies a chunk's position on a layer's chunk grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    /// Chunk-grid X coordinate.
    pub x: i32,
    /// Chunk-grid Y coordinate.
    pub y: i32,
}

impl ChunkCoord {
    /// Creates a new chunk coordinate.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing world position `(x, y)` for chunks `chunk_world_size` units wide.
    pub fn from_world(x: f64, y: f64, chunk_world_size: f64) -> Self {
        Self {
            x: (x / chunk_world_size).floor() as i32,
            y: (y / chunk_world_size).floor() as i32,
        }
    }

    /// Returns the coordinate offset by `(dx, dy)`, saturating at the grid edge.
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }

    /// Chebyshev (chessboard) distance between two coordinates.
    pub fn chebyshev_distance(self, other: Self) -> u64 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dy = (self.y as i64 - other.y as i64).unsigned_abs();
        dx.max(dy)
    }

    /// Returns `true` if both axis deltas are at most `radius`.
    pub fn is_neighbor(self, other: Self, radius: u32) -> bool {
        self.chebyshev_distance(other) <= radius as u64
    }

    /// Every coordinate within Chebyshev distance `radius`, including `self`.
    ///
    /// Yields `(2r + 1)²` coordinates, row by row.
    pub fn neighborhood(self, radius: u32) -> impl Iterator<Item = ChunkCoord> {
        let r = radius.min(i32::MAX as u32) as i32;
        (-r..=r).flat_map(move |dy| (-r..=r).map(move |dx| self.offset(dx, dy)))
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Identifies an independently simulated world layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u32);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer-{}", self.0)
    }
}
