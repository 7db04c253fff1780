//! Per-block compute unit of the multiplicative update.
//!
//! Each rayon worker owns one `BlockWorker` holding its padded scratch
//! buffers; a block's update never touches PSI directly but returns a
//! staged copy of the interior for the driver to flush later.

use crate::block::Block;
use crate::config::DeconvolutionConfig;
use crate::error::{DeconvError, Result};
use crate::view::DeconView;
use ndarray::{Array3, ArrayView3, Zip};
use serde::Serialize;

/// Summed and maximum per-voxel change of one update, folded per view per
/// iteration for logging and convergence checks.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IterationStats {
    pub sum_change: f64,
    pub max_change: f32,
}

impl IterationStats {
    pub fn merge(&mut self, other: &IterationStats) {
        self.sum_change += other.sum_change;
        self.max_change = self.max_change.max(other.max_change);
    }
}

/// One computed block interior waiting for write-back.
#[derive(Debug)]
pub struct StagedBlock {
    pub block: Block,
    pub data: Array3<f32>,
    pub stats: IterationStats,
}

impl StagedBlock {
    /// Commits the staged interior into PSI. Called only from the driver's
    /// single-threaded flush step.
    pub fn write(self, psi: &mut Array3<f32>) {
        self.block.inner_of_volume_mut(psi).assign(&self.data);
    }
}

/// Worker-owned scratch state for running block updates.
pub struct BlockWorker {
    psi_block: Array3<f32>,
    obs_block: Array3<f32>,
    view_index: usize,
    min_value: f32,
    min_value_img: f32,
}

impl BlockWorker {
    pub fn new(view: &DeconView, view_index: usize, config: &DeconvolutionConfig) -> Self {
        let o = view.outer_dims;
        BlockWorker {
            psi_block: Array3::zeros((o[0], o[1], o[2])),
            obs_block: Array3::zeros((o[0], o[1], o[2])),
            view_index,
            min_value: config.min_value,
            min_value_img: config.min_value_img,
        }
    }

    /// Runs one multiplicative update for `block` against a snapshot of
    /// PSI:
    ///
    /// 1. blur the padded PSI copy with the forward kernel,
    /// 2. divide the observed image by the blurred estimate (the
    ///    denominator is floored at a small fraction of the view's peak
    ///    intensity to stay away from zero),
    /// 3. back-project the ratio with the adjoint kernel,
    /// 4. multiply the interior by the correction, floored at `min_value`
    ///    to keep PSI strictly positive,
    /// 5. blend with the per-voxel weight so zero-weight voxels stay put.
    pub fn run_iteration(
        &mut self,
        view: &DeconView,
        block: &Block,
        psi: ArrayView3<'_, f32>,
    ) -> Result<StagedBlock> {
        block.read_padded_into(psi, &mut self.psi_block);
        block.read_padded_into(view.image.view(), &mut self.obs_block);

        // (1) predicted blur of the current estimate
        let mut ratio = view.convolve1(self.psi_block.view());

        // (2) observed / predicted, guarded against division by zero;
        // the floor scales with the view's intensity range
        let floor = self.min_value_img * view.max_intensity.max(1.0);
        Zip::from(&mut ratio)
            .and(&self.obs_block)
            .for_each(|r, &obs| *r = obs / r.max(floor));

        // (3) back-projection through the paired kernel
        let correction = view.convolve2(ratio.view());

        // (4) + (5) multiplicative update of the interior, weight-blended
        let psi_inner = block.inner_of(&self.psi_block);
        let corr_inner = block.inner_of(&correction);
        let weight_inner = block.inner_of_volume(view.weight.view());

        let mut data = Array3::zeros((
            block.inner_dims[0],
            block.inner_dims[1],
            block.inner_dims[2],
        ));
        let mut stats = IterationStats::default();
        let min_value = self.min_value;
        let mut finite = true;

        Zip::from(&mut data)
            .and(&psi_inner)
            .and(&corr_inner)
            .and(&weight_inner)
            .for_each(|out, &p, &c, &w| {
                let value = (p * c).max(min_value);
                let next = p + w * (value - p);
                if !next.is_finite() {
                    finite = false;
                }
                let change = (next - p).abs();
                stats.sum_change += change as f64;
                stats.max_change = stats.max_change.max(change);
                *out = next;
            });

        if !finite {
            return Err(DeconvError::ComputeFailure {
                view: self.view_index,
                block: block.index,
                reason: "update produced a non-finite value".into(),
            });
        }

        Ok(StagedBlock {
            block: block.clone(),
            data,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeconvolutionConfig;
    use crate::psf::{gaussian_kernel_3d, PsfPair};
    use approx::assert_abs_diff_eq;

    fn test_view(weight_value: f32) -> (DeconView, DeconvolutionConfig) {
        let config = DeconvolutionConfig {
            block_size: [20, 20, 20],
            ..DeconvolutionConfig::default()
        };
        let mut image = Array3::<f32>::from_elem((12, 12, 12), 1.0);
        image[(6, 6, 6)] = 10.0;
        let weight = Array3::<f32>::from_elem((12, 12, 12), weight_value);
        let psf = PsfPair::matched(gaussian_kernel_3d([0.5, 0.5, 0.5])).unwrap();
        let view = DeconView::new(image, weight, psf, &config).unwrap();
        (view, config)
    }

    #[test]
    fn zero_weight_leaves_psi_unchanged() {
        let (view, config) = test_view(0.0);
        let psi = Array3::<f32>::from_elem((12, 12, 12), 2.0);
        let mut worker = BlockWorker::new(&view, 0, &config);
        // zero-weight blocks are normally filtered out, run one manually
        let part =
            crate::block::partition([12, 12, 12], view.psf.dims(), [20, 20, 20]).unwrap();
        let staged = worker
            .run_iteration(&view, &part.blocks[0], psi.view())
            .unwrap();
        assert_abs_diff_eq!(staged.stats.max_change, 0.0, epsilon = 1e-7);
        for &v in staged.data.iter() {
            assert_abs_diff_eq!(v, 2.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn update_stays_positive_and_finite() {
        let (view, config) = test_view(1.0);
        // hostile start: PSI nearly zero, denominator floor must hold
        let psi = Array3::<f32>::from_elem((12, 12, 12), 1e-9);
        let mut worker = BlockWorker::new(&view, 0, &config);
        let block = view.batches[0][0].clone();
        let staged = worker.run_iteration(&view, &block, psi.view()).unwrap();
        for &v in staged.data.iter() {
            assert!(v.is_finite());
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn non_finite_update_reports_the_worker_view_index() {
        let (view, config) = test_view(1.0);
        let mut psi = Array3::<f32>::from_elem((12, 12, 12), 1.0);
        psi[(6, 6, 6)] = f32::NAN;
        let mut worker = BlockWorker::new(&view, 3, &config);
        let block = view.batches[0][0].clone();
        let err = worker
            .run_iteration(&view, &block, psi.view())
            .unwrap_err();
        match err {
            DeconvError::ComputeFailure { view, block: b, .. } => {
                assert_eq!(view, 3);
                assert_eq!(b, block.index);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn update_moves_towards_observation() {
        let (view, config) = test_view(1.0);
        // flat start below the image mean: the correction must raise PSI
        let psi = Array3::<f32>::from_elem((12, 12, 12), 0.5);
        let mut worker = BlockWorker::new(&view, 0, &config);
        let block = view.batches[0][0].clone();
        let staged = worker.run_iteration(&view, &block, psi.view()).unwrap();
        assert!(staged.stats.sum_change > 0.0);
        let mean: f32 = staged.data.iter().sum::<f32>() / staged.data.len() as f32;
        assert!(mean > 0.5);
    }
}
