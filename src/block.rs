//! Block partitioning of a volume into kernel-padded, memory-bounded pieces.
//!
//! A convolution computed on a block padded by `kernel − 1` voxels per side
//! is exact over the unpadded interior, so blocks can be processed
//! independently as long as their interiors tile the volume exactly. The
//! padded (outer) extent is kept uniform across all blocks of a partition;
//! where it reaches beyond the volume the missing context is supplied by
//! mirror extension when the block is copied out.

use crate::error::{DeconvError, Result};
use ndarray::{s, Array3, ArrayView3, ArrayViewMut3};

/// One axis-aligned piece of a partitioned volume.
///
/// `inner_min`/`inner_dims` describe the interior region in volume
/// coordinates; it is the only part of the block that is ever written back.
/// `outer_min` is signed because the padding of border blocks reaches
/// outside the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Position in the enumeration order of the partition.
    pub index: usize,
    /// Tile index along each axis.
    pub grid: [usize; 3],
    /// Interior origin, volume coordinates.
    pub inner_min: [usize; 3],
    /// Interior size; clamped at the far border of the volume.
    pub inner_dims: [usize; 3],
    /// Padded origin in signed coordinates.
    pub outer_min: [i64; 3],
    /// Padded size; identical for every block of a partition.
    pub outer_dims: [usize; 3],
}

impl Block {
    /// Offset of the interior inside the padded extent. Equal to the
    /// padding because the outer extent is not clamped.
    pub fn offset(&self) -> [usize; 3] {
        let mut o = [0usize; 3];
        for d in 0..3 {
            o[d] = (self.inner_min[d] as i64 - self.outer_min[d]) as usize;
        }
        o
    }

    /// True when the padded extents of `self` and `other` intersect.
    /// Blocks that interfere must not be processed in the same batch.
    pub fn interferes(&self, other: &Block) -> bool {
        for d in 0..3 {
            let a_end = self.outer_min[d] + self.outer_dims[d] as i64;
            let b_end = other.outer_min[d] + other.outer_dims[d] as i64;
            if a_end <= other.outer_min[d] || b_end <= self.outer_min[d] {
                return false;
            }
        }
        true
    }

    /// Copies the padded extent out of `volume`, mirroring coordinates that
    /// fall outside it.
    pub fn read_padded(&self, volume: ArrayView3<'_, f32>) -> Array3<f32> {
        let mut out = Array3::zeros((
            self.outer_dims[0],
            self.outer_dims[1],
            self.outer_dims[2],
        ));
        self.read_padded_into(volume, &mut out);
        out
    }

    /// Like [`Block::read_padded`] but reuses a caller-owned scratch buffer
    /// of the outer shape.
    pub fn read_padded_into(&self, volume: ArrayView3<'_, f32>, out: &mut Array3<f32>) {
        let dims = volume.dim();
        let n = [dims.0, dims.1, dims.2];
        debug_assert_eq!(
            out.dim(),
            (self.outer_dims[0], self.outer_dims[1], self.outer_dims[2])
        );
        for x in 0..self.outer_dims[0] {
            let sx = mirror_index(self.outer_min[0] + x as i64, n[0]);
            for y in 0..self.outer_dims[1] {
                let sy = mirror_index(self.outer_min[1] + y as i64, n[1]);
                for z in 0..self.outer_dims[2] {
                    let sz = mirror_index(self.outer_min[2] + z as i64, n[2]);
                    out[(x, y, z)] = volume[(sx, sy, sz)];
                }
            }
        }
    }

    /// View of the interior region inside a padded buffer of this block.
    pub fn inner_of<'a>(&self, outer: &'a Array3<f32>) -> ArrayView3<'a, f32> {
        let o = self.offset();
        outer.slice(s![
            o[0]..o[0] + self.inner_dims[0],
            o[1]..o[1] + self.inner_dims[1],
            o[2]..o[2] + self.inner_dims[2],
        ])
    }

    /// Mutable view of this block's interior inside the full volume.
    pub fn inner_of_volume_mut<'a>(
        &self,
        volume: &'a mut Array3<f32>,
    ) -> ArrayViewMut3<'a, f32> {
        volume.slice_mut(s![
            self.inner_min[0]..self.inner_min[0] + self.inner_dims[0],
            self.inner_min[1]..self.inner_min[1] + self.inner_dims[1],
            self.inner_min[2]..self.inner_min[2] + self.inner_dims[2],
        ])
    }

    /// View of this block's interior inside the full volume.
    pub fn inner_of_volume<'a>(&self, volume: ArrayView3<'a, f32>) -> ArrayView3<'a, f32> {
        volume.slice_move(s![
            self.inner_min[0]..self.inner_min[0] + self.inner_dims[0],
            self.inner_min[1]..self.inner_min[1] + self.inner_dims[1],
            self.inner_min[2]..self.inner_min[2] + self.inner_dims[2],
        ])
    }
}

/// A full block decomposition of one volume.
#[derive(Debug, Clone)]
pub struct Partition {
    pub blocks: Vec<Block>,
    /// Nominal interior size of a tile (the last tile per axis may be
    /// smaller).
    pub inner_dims: [usize; 3],
    /// Uniform padded size of every block.
    pub outer_dims: [usize; 3],
    /// Padding per side, `kernel − 1`.
    pub pad: [usize; 3],
    /// Tile counts per axis.
    pub tiles: [usize; 3],
}

/// Splits `volume_dims` into blocks whose interiors tile the volume exactly
/// and whose padded extent is `block_dims`.
///
/// Fails with [`DeconvError::PartitionFailure`] when `block_dims` cannot
/// accommodate the `kernel_dims − 1` padding on both sides of a non-empty
/// interior.
pub fn partition(
    volume_dims: [usize; 3],
    kernel_dims: [usize; 3],
    block_dims: [usize; 3],
) -> Result<Partition> {
    let mut pad = [0usize; 3];
    let mut inner = [0usize; 3];
    let mut tiles = [0usize; 3];
    for d in 0..3 {
        pad[d] = kernel_dims[d] - 1;
        if block_dims[d] <= 2 * pad[d] {
            return Err(DeconvError::PartitionFailure {
                dim: d,
                block_size: block_dims[d],
                kernel_size: kernel_dims[d],
            });
        }
        inner[d] = block_dims[d] - 2 * pad[d];
        tiles[d] = volume_dims[d].div_ceil(inner[d]);
    }

    let mut blocks = Vec::with_capacity(tiles[0] * tiles[1] * tiles[2]);
    let mut index = 0;
    for gx in 0..tiles[0] {
        for gy in 0..tiles[1] {
            for gz in 0..tiles[2] {
                let grid = [gx, gy, gz];
                let mut inner_min = [0usize; 3];
                let mut inner_dims = [0usize; 3];
                let mut outer_min = [0i64; 3];
                for d in 0..3 {
                    inner_min[d] = grid[d] * inner[d];
                    inner_dims[d] = inner[d].min(volume_dims[d] - inner_min[d]);
                    outer_min[d] = inner_min[d] as i64 - pad[d] as i64;
                }
                blocks.push(Block {
                    index,
                    grid,
                    inner_min,
                    inner_dims,
                    outer_min,
                    outer_dims: block_dims,
                });
                index += 1;
            }
        }
    }

    Ok(Partition {
        blocks,
        inner_dims: inner,
        outer_dims: block_dims,
        pad,
        tiles,
    })
}

/// Reflects an out-of-range coordinate back into `0..n` by mirroring at the
/// boundaries without repeating the edge sample (period `2n − 2`).
pub fn mirror_index(i: i64, n: usize) -> usize {
    debug_assert!(n > 0);
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as i64 - 1);
    let mut m = i.rem_euclid(period);
    if m >= n as i64 {
        m = period - m;
    }
    m as usize
}
