//! Per-chunk spatial indexing: a uniform grid over two independent
//! populations (static and dynamic occupants) keyed by Morton cell codes.

pub mod index;
pub mod morton;

pub use index::{EntityHandle, SpatialIndex};
pub use morton::{CellCoord, cell_coord, morton_decode, morton_encode};
