//! Voxel grid content bound at binding 3.
//!
//! The grid is a dense 15x15x15 array of `i32` cells (0 = empty,
//! non-zero = solid), indexed `x * 225 + y * 15 + z`. It occupies the
//! world-space box from (1, 1, 1) to (16, 16, 16) with unit-sized cells.

use crate::vulkan::raytracing::Aabb;

/// Cells along each axis.
pub const GRID_DIM: usize = 15;
/// Total number of cells.
pub const VOXEL_COUNT: usize = GRID_DIM * GRID_DIM * GRID_DIM;
/// World-space minimum corner of the grid.
pub const GRID_MIN: [f32; 3] = [1.0, 1.0, 1.0];

/// Dense voxel occupancy grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelGrid {
    cells: Vec<i32>,
}

impl Default for VoxelGrid {
    fn default() -> Self {
        Self::sphere([7, 7, 7], 16)
    }
}

impl VoxelGrid {
    /// An all-empty grid.
    pub fn empty() -> Self {
        Self { cells: vec![0; VOXEL_COUNT] }
    }

    /// Solid cells where the squared distance to `center` is at most `radius_sq`.
    pub fn sphere(center: [i32; 3], radius_sq: i32) -> Self {
        let mut grid = Self::empty();
        for x in 0..GRID_DIM {
            for y in 0..GRID_DIM {
                for z in 0..GRID_DIM {
                    let dx = x as i32 - center[0];
                    let dy = y as i32 - center[1];
                    let dz = z as i32 - center[2];
                    if dx * dx + dy * dy + dz * dz <= radius_sq {
                        grid.cells[Self::index(x, y, z)] = 1;
                    }
                }
            }
        }
        grid
    }

    /// Rebuild a grid from cells read back from the GPU.
    pub fn from_cells(cells: Vec<i32>) -> Option<Self> {
        (cells.len() == VOXEL_COUNT).then_some(Self { cells })
    }

    /// Linear index of cell (x, y, z).
    pub const fn index(x: usize, y: usize, z: usize) -> usize {
        x * GRID_DIM * GRID_DIM + y * GRID_DIM + z
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> i32 {
        self.cells[Self::index(x, y, z)]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, value: i32) {
        self.cells[Self::index(x, y, z)] = value;
    }

    pub fn cells(&self) -> &[i32] {
        &self.cells
    }

    pub fn solid_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c != 0).count()
    }

    /// Size of the storage buffer in bytes.
    pub const fn byte_size() -> u64 {
        (VOXEL_COUNT * std::mem::size_of::<i32>()) as u64
    }

    /// Bounding box handed to the bottom-level acceleration structure.
    pub fn bounds() -> Aabb {
        let extent = GRID_DIM as f32;
        Aabb {
            min: GRID_MIN,
            max: [GRID_MIN[0] + extent, GRID_MIN[1] + extent, GRID_MIN[2] + extent],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_voxel_count() {
        assert_eq!(VOXEL_COUNT, 3375);
        assert_eq!(VoxelGrid::byte_size(), 3375 * 4);
    }

    #[test]
    fn test_index_is_x_major() {
        assert_eq!(VoxelGrid::index(0, 0, 0), 0);
        assert_eq!(VoxelGrid::index(0, 0, 1), 1);
        assert_eq!(VoxelGrid::index(0, 1, 0), 15);
        assert_eq!(VoxelGrid::index(1, 0, 0), 225);
        assert_eq!(VoxelGrid::index(14, 14, 14), VOXEL_COUNT - 1);
    }

    #[test]
    fn test_bounds_cover_grid() {
        let bounds = VoxelGrid::bounds();
        assert_eq!(bounds.min, [1.0, 1.0, 1.0]);
        assert_eq!(bounds.max, [16.0, 16.0, 16.0]);
    }

    // ============================================================
    // Sphere pattern
    // ============================================================

    #[test]
    fn test_default_is_centered_sphere() {
        let grid = VoxelGrid::default();
        assert_eq!(grid.get(7, 7, 7), 1);
        assert_eq!(grid.get(7, 7, 11), 1);
        assert_eq!(grid.get(7, 7, 12), 0);
        assert_eq!(grid.get(0, 0, 0), 0);
        assert_eq!(grid.get(9, 9, 9), 1); // 4 + 4 + 4 = 12
        assert_eq!(grid.get(10, 9, 9), 0); // 9 + 4 + 4 = 17
    }

    #[test]
    fn test_sphere_cells_are_binary() {
        let grid = VoxelGrid::default();
        assert!(grid.cells().iter().all(|&c| c == 0 || c == 1));
    }

    #[test]
    fn test_sphere_solid_count_matches_brute_force() {
        let expected = (0..15i32)
            .flat_map(|x| (0..15i32).flat_map(move |y| (0..15i32).map(move |z| (x, y, z))))
            .filter(|&(x, y, z)| (x - 7).pow(2) + (y - 7).pow(2) + (z - 7).pow(2) <= 16)
            .count();
        assert_eq!(VoxelGrid::default().solid_count(), expected);
    }

    #[test]
    fn test_sphere_is_symmetric() {
        let grid = VoxelGrid::default();
        for x in 0..GRID_DIM {
            for y in 0..GRID_DIM {
                for z in 0..GRID_DIM {
                    assert_eq!(grid.get(x, y, z), grid.get(14 - x, y, z));
                    assert_eq!(grid.get(x, y, z), grid.get(z, y, x));
                }
            }
        }
    }

    // ============================================================
    // from_cells / set
    // ============================================================

    #[test]
    fn test_from_cells_rejects_wrong_length() {
        assert!(VoxelGrid::from_cells(vec![0; 10]).is_none());
        assert!(VoxelGrid::from_cells(vec![0; VOXEL_COUNT]).is_some());
    }

    #[test]
    fn test_from_cells_preserves_pattern() {
        let grid = VoxelGrid::default();
        let copy = VoxelGrid::from_cells(grid.cells().to_vec()).unwrap();
        assert_eq!(copy, grid);
    }

    #[test]
    fn test_set_then_get() {
        let mut grid = VoxelGrid::empty();
        grid.set(3, 4, 5, 1);
        assert_eq!(grid.get(3, 4, 5), 1);
        assert_eq!(grid.solid_count(), 1);
    }
}
