//! Fixed-grid voxel occupancy set.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoxelError {
    #[error("voxel size must be positive, got {0}")]
    NonPositiveVoxelSize(f32),
}

/// O(1) insert/membership over a fixed cubic grid.
///
/// The grid is centred at `(center_x, center_y, center_z)` with side
/// `2 · half_range` and cell size `voxel_size`; cell state is one bit.
/// Used for per-frame voxel de-duplication: the first point to land in a
/// cell is kept, later ones are dropped.
#[derive(Debug, Clone)]
pub struct VoxelSet {
    inv_voxel_size: f32,
    min_x: f32,
    min_y: f32,
    min_z: f32,
    grid_x: usize,
    grid_y: usize,
    grid_z: usize,
    bits: Vec<u64>,
}

impl VoxelSet {
    pub fn new(
        voxel_size: f32,
        center_x: f32,
        center_y: f32,
        center_z: f32,
        half_range: f32,
    ) -> Result<Self, VoxelError> {
        if voxel_size <= 0.0 {
            return Err(VoxelError::NonPositiveVoxelSize(voxel_size));
        }

        let inv_voxel_size = 1.0 / voxel_size;
        let cells_per_axis = ((half_range * 2.0) * inv_voxel_size).ceil() as usize;
        let total = cells_per_axis * cells_per_axis * cells_per_axis;

        Ok(Self {
            inv_voxel_size,
            min_x: center_x - half_range,
            min_y: center_y - half_range,
            min_z: center_z - half_range,
            grid_x: cells_per_axis,
            grid_y: cells_per_axis,
            grid_z: cells_per_axis,
            bits: vec![0; total.div_ceil(64)],
        })
    }

    /// Clear every cell.
    pub fn reset(&mut self) {
        self.bits.fill(0);
    }

    /// Insert a point. Returns true iff the containing cell was previously
    /// empty and the point lies within the grid bounds. Repeated inserts
    /// into the same cell return false after the first.
    pub fn insert(&mut self, x: f32, y: f32, z: f32) -> bool {
        let ix = ((x - self.min_x) * self.inv_voxel_size).floor() as i64;
        let iy = ((y - self.min_y) * self.inv_voxel_size).floor() as i64;
        let iz = ((z - self.min_z) * self.inv_voxel_size).floor() as i64;

        if ix < 0
            || iy < 0
            || iz < 0
            || ix >= self.grid_x as i64
            || iy >= self.grid_y as i64
            || iz >= self.grid_z as i64
        {
            return false;
        }

        let idx = iz as usize * self.grid_y * self.grid_x + iy as usize * self.grid_x + ix as usize;
        let (word, bit) = (idx / 64, idx % 64);
        let mask = 1u64 << bit;

        if self.bits[word] & mask != 0 {
            return false;
        }

        self.bits[word] |= mask;
        true
    }
}
