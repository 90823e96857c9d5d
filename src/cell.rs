//! Grid coordinate types for cells and vertical sections.
//!
//! A cell is one column of the world grid, addressed by `(x, z)`. Sections
//! subdivide a cell vertically and carry their own `y` index. Both types pack
//! into a `u64` key so they can live in flat hash maps and worklists without
//! hashing a struct.

use std::fmt;

/// Horizontal position of a cell on the world grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPos {
    pub x: i32,
    pub z: i32,
}

impl CellPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packs the position into a map key. `from_key` inverts this exactly
    /// for the full `i32` range.
    pub fn key(self) -> u64 {
        ((self.x as u32 as u64) << 32) | (self.z as u32 as u64)
    }

    pub fn from_key(key: u64) -> Self {
        Self {
            x: (key >> 32) as u32 as i32,
            z: key as u32 as i32,
        }
    }

    pub fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x.wrapping_add(dx),
            z: self.z.wrapping_add(dz),
        }
    }

    /// Chebyshev distance, the metric used by square neighborhoods.
    pub fn distance(self, other: Self) -> u32 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dz = (self.z as i64 - other.z as i64).unsigned_abs();
        dx.max(dz) as u32
    }

    /// The eight surrounding cells, in a fixed scan order.
    pub fn neighbors(self) -> impl Iterator<Item = CellPos> {
        let center = self;
        (-1..=1).flat_map(move |dx| {
            (-1..=1).filter_map(move |dz| {
                if dx == 0 && dz == 0 {
                    None
                } else {
                    Some(center.offset(dx, dz))
                }
            })
        })
    }

    /// Every cell within `radius` (Chebyshev), including this one.
    pub fn square(self, radius: u32) -> impl Iterator<Item = CellPos> {
        let center = self;
        let r = radius as i32;
        (-r..=r).flat_map(move |dx| (-r..=r).map(move |dz| center.offset(dx, dz)))
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Position of one vertical section within the grid.
///
/// Packed keys give `x` and `z` 22 bits each and `y` 20 bits, so the usable
/// range is roughly +/-2 million sections horizontally and +/-500k vertically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

const SECTION_XZ_BITS: u32 = 22;
const SECTION_Y_BITS: u32 = 20;

impl SectionPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn key(self) -> u64 {
        let x = (self.x as u64) & ((1 << SECTION_XZ_BITS) - 1);
        let y = (self.y as u64) & ((1 << SECTION_Y_BITS) - 1);
        let z = (self.z as u64) & ((1 << SECTION_XZ_BITS) - 1);
        (x << (SECTION_XZ_BITS + SECTION_Y_BITS)) | (y << SECTION_XZ_BITS) | z
    }

    pub fn from_key(key: u64) -> Self {
        // Shift left then arithmetic-shift right to sign-extend each field.
        let x = (key as i64) >> (SECTION_XZ_BITS + SECTION_Y_BITS);
        let y = ((key << SECTION_XZ_BITS) as i64) >> (64 - SECTION_Y_BITS);
        let z = ((key << (SECTION_XZ_BITS + SECTION_Y_BITS)) as i64) >> (64 - SECTION_XZ_BITS);
        Self {
            x: x as i32,
            y: y as i32,
            z: z as i32,
        }
    }

    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x.wrapping_add(dx),
            y: self.y.wrapping_add(dy),
            z: self.z.wrapping_add(dz),
        }
    }

    /// The cell this section belongs to.
    pub fn cell(self) -> CellPos {
        CellPos::new(self.x, self.z)
    }

    /// The 26 face-, edge- and corner-adjacent sections.
    pub fn neighbors(self) -> impl Iterator<Item = SectionPos> {
        let center = self;
        (-1..=1).flat_map(move |dx| {
            (-1..=1).flat_map(move |dy| {
                (-1..=1).filter_map(move |dz| {
                    if dx == 0 && dy == 0 && dz == 0 {
                        None
                    } else {
                        Some(center.offset(dx, dy, dz))
                    }
                })
            })
        })
    }
}

impl fmt::Display for SectionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_key_round_trip() {
        let cases = [
            CellPos::new(0, 0),
            CellPos::new(1, -1),
            CellPos::new(-1, 1),
            CellPos::new(i32::MAX, i32::MIN),
            CellPos::new(-123_456, 987_654),
        ];
        for pos in cases {
            assert_eq!(CellPos::from_key(pos.key()), pos);
        }
    }

    #[test]
    fn test_cell_keys_are_distinct_for_swapped_axes() {
        assert_ne!(CellPos::new(3, 7).key(), CellPos::new(7, 3).key());
    }

    #[test]
    fn test_cell_distance_is_chebyshev() {
        let a = CellPos::new(0, 0);
        assert_eq!(a.distance(CellPos::new(3, 1)), 3);
        assert_eq!(a.distance(CellPos::new(-2, -5)), 5);
        assert_eq!(a.distance(a), 0);
    }

    #[test]
    fn test_cell_neighbors_count_and_distance() {
        let center = CellPos::new(10, -4);
        let neighbors: Vec<_> = center.neighbors().collect();
        assert_eq!(neighbors.len(), 8);
        for n in neighbors {
            assert_eq!(center.distance(n), 1);
        }
    }

    #[test]
    fn test_cell_square_covers_radius() {
        let center = CellPos::new(-3, 2);
        let cells: Vec<_> = center.square(2).collect();
        assert_eq!(cells.len(), 25);
        assert!(cells.contains(&center));
        for c in cells {
            assert!(center.distance(c) <= 2);
        }
    }

    #[test]
    fn test_section_key_round_trip() {
        let cases = [
            SectionPos::new(0, 0, 0),
            SectionPos::new(1, -2, 3),
            SectionPos::new(-100, 50, -7),
            SectionPos::new(2_000_000, -400_000, -2_000_000),
        ];
        for pos in cases {
            assert_eq!(SectionPos::from_key(pos.key()), pos);
        }
    }

    #[test]
    fn test_section_neighbors_count() {
        let center = SectionPos::new(4, 1, -9);
        let neighbors: Vec<_> = center.neighbors().collect();
        assert_eq!(neighbors.len(), 26);
        assert!(!neighbors.contains(&center));
    }

    #[test]
    fn test_section_cell_projection() {
        assert_eq!(SectionPos::new(5, 12, -8).cell(), CellPos::new(5, -8));
    }
}
