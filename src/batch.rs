//! Grouping of blocks into mutually non-interfering batches.
//!
//! Two blocks interfere when their padded extents intersect; such blocks
//! must land in different batches so that one batch can be computed in
//! parallel and written back without races. Blocks are grouped by spatial
//! congruence classes of their tile index: along each axis a class stride
//! of `1 + ceil(2·pad / inner)` tiles guarantees that same-class blocks are
//! far enough apart that even their padding cannot touch.

use crate::block::{Block, Partition};
use ndarray::ArrayView3;

/// Sorts the blocks of a partition into an ordered list of batches.
///
/// Guarantees: within a batch no two blocks interfere, and every block of
/// the partition appears in exactly one batch. Batches smaller than
/// `min_batch_len` are compacted into earlier batches where possible to
/// bound the batch count on fine grids.
pub fn sort_into_batches(partition: &Partition, min_batch_len: usize) -> Vec<Vec<Block>> {
    let mut stride = [1usize; 3];
    for d in 0..3 {
        stride[d] = 1 + (2 * partition.pad[d]).div_ceil(partition.inner_dims[d].max(1));
        stride[d] = stride[d].min(partition.tiles[d].max(1));
    }

    let num_classes = stride[0] * stride[1] * stride[2];
    let mut batches: Vec<Vec<Block>> = vec![Vec::new(); num_classes];
    for block in &partition.blocks {
        let cx = block.grid[0] % stride[0];
        let cy = block.grid[1] % stride[1];
        let cz = block.grid[2] % stride[2];
        let class = (cx * stride[1] + cy) * stride[2] + cz;
        batches[class].push(block.clone());
    }
    batches.retain(|b| !b.is_empty());

    if min_batch_len > 1 {
        compact_small_batches(&mut batches, min_batch_len);
    }

    // Largest batches first maximizes early parallelism.
    batches.sort_by(|a, b| b.len().cmp(&a.len()));
    batches
}

/// Moves blocks out of undersized batches into any other batch that can
/// take them without violating non-interference. Blocks that fit nowhere
/// stay where they are; correctness never depends on the compaction
/// succeeding.
fn compact_small_batches(batches: &mut Vec<Vec<Block>>, min_batch_len: usize) {
    let mut i = 0;
    while i < batches.len() {
        if batches[i].len() >= min_batch_len {
            i += 1;
            continue;
        }
        let small = std::mem::take(&mut batches[i]);
        let mut kept = Vec::new();
        'blocks: for block in small {
            for (j, target) in batches.iter_mut().enumerate() {
                if j == i || target.is_empty() {
                    continue;
                }
                if target.iter().all(|other| !block.interferes(other)) {
                    target.push(block);
                    continue 'blocks;
                }
            }
            kept.push(block);
        }
        batches[i] = kept;
        i += 1;
    }
    batches.retain(|b| !b.is_empty());
}

/// Drops blocks whose interior weight region is entirely zero; they cannot
/// contribute to the update. Emptied batches are removed. A block whose
/// interior does not fit inside the weight volume is kept conservatively,
/// wasted computation is preferable to silently dropping data.
pub fn filter_empty_weight_blocks(
    batches: Vec<Vec<Block>>,
    weight: ArrayView3<'_, f32>,
) -> Vec<Vec<Block>> {
    let dims = weight.dim();
    let mut dropped = 0usize;
    let mut filtered: Vec<Vec<Block>> = Vec::with_capacity(batches.len());
    for batch in batches {
        let batch: Vec<Block> = batch
            .into_iter()
            .filter(|block| {
                let fits = (0..3).all(|d| {
                    block.inner_min[d] + block.inner_dims[d] <= [dims.0, dims.1, dims.2][d]
                });
                if !fits {
                    log::warn!(
                        "block {} exceeds weight volume, keeping it conservatively",
                        block.index
                    );
                    return true;
                }
                let has_content = block
                    .inner_of_volume(weight)
                    .iter()
                    .any(|&w| w != 0.0);
                if !has_content {
                    dropped += 1;
                }
                has_content
            })
            .collect();
        if !batch.is_empty() {
            filtered.push(batch);
        }
    }
    if dropped > 0 {
        log::debug!("content filter dropped {dropped} zero-weight blocks");
    }
    filtered
}
