//! Z-order (Morton) cell keys.
//!
//! A world position is bucketed into integer cell coordinates by floor
//! division, and the two `i32` cell axes are bit-interleaved into a single
//! `u64`. Negative cells are reinterpreted as `u32` first, so every pair of
//! `i32` values maps to a distinct key.

/// Integer cell coordinate `(cx, cy)`.
pub type CellCoord = (i32, i32);

/// Cell containing world coordinate `v` for a grid of `cell_size`.
///
/// Saturates at the `i32` bounds; NaN maps to cell 0.
#[inline]
pub fn cell_coord(v: f64, cell_size: f64) -> i32 {
    (v / cell_size).floor() as i32
}

/// Interleaves the bits of `cx` (even positions) and `cy` (odd positions).
#[inline]
pub fn morton_encode(cx: i32, cy: i32) -> u64 {
    spread(cx as u32) | (spread(cy as u32) << 1)
}

/// Inverse of [`morton_encode`].
#[inline]
pub fn morton_decode(key: u64) -> CellCoord {
    (compact(key) as i32, compact(key >> 1) as i32)
}

fn spread(v: u32) -> u64 {
    let mut x = v as u64;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

fn compact(key: u64) -> u32 {
    let mut x = key & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x >> 4)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x >> 8)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x >> 16)) & 0x0000_0000_FFFF_FFFF;
    x as u32
}
