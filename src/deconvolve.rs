//! The deconvolution driver: owns the shared estimate volume (PSI) and runs
//! the per-view, per-batch multiplicative update loop.
//!
//! Each batch is dispatched to a bounded rayon pool; the batch join is the
//! only synchronization point. Workers read from a snapshot of PSI taken
//! when the view's pass begins, so every block of the pass sees the same
//! estimate and the result is independent of how the volume was
//! partitioned. Results are staged and committed exactly one batch late:
//! the previous batch's writes must not land until the current batch has
//! captured its padded copies. PSI itself is only ever mutated by the
//! single-threaded flush step.

use crate::compute::{BlockWorker, IterationStats, StagedBlock};
use crate::config::{DeconvolutionConfig, PsiInit};
use crate::error::{DeconvError, Result};
use crate::view::DeconView;
use cancellable_loops::try_for_each_cancellable;
use crossbeam_channel::Sender;
use ndarray::{Array3, ArrayView3, Zip};
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

/// Convergence summary of one view within one iteration.
#[derive(Debug, Clone, Copy)]
pub struct ViewIterationStats {
    pub view: usize,
    pub blocks: usize,
    pub stats: IterationStats,
}

/// Progress report sent after each view of each iteration.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub iteration: usize,
    pub stats: ViewIterationStats,
}

/// Multi-view Richardson-Lucy deconvolution over a shared estimate volume.
pub struct MultiViewDeconvolution {
    views: Vec<DeconView>,
    psi: Array3<f32>,
    config: DeconvolutionConfig,
    pool: rayon::ThreadPool,
    iteration: usize,
    progress: Option<Sender<ProgressEvent>>,
}

impl MultiViewDeconvolution {
    /// Builds the driver. All views must share the output volume's shape;
    /// at least one view must have workable blocks.
    pub fn new(views: Vec<DeconView>, config: DeconvolutionConfig) -> Result<Self> {
        let first = views.first().ok_or(DeconvError::NoViews)?;
        let dims = first.volume_dims();
        for view in &views {
            if view.volume_dims() != dims {
                return Err(DeconvError::ShapeMismatch {
                    expected: dims,
                    actual: view.volume_dims(),
                });
            }
        }
        if !views.iter().any(|v| v.is_workable()) {
            return Err(DeconvError::NoViews);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(|e| DeconvError::ThreadPool(e.to_string()))?;

        let psi = init_psi(&views, dims, config.psi_init);

        Ok(MultiViewDeconvolution {
            views,
            psi,
            config,
            pool,
            iteration: 0,
            progress: None,
        })
    }

    /// Registers a channel that receives per-view statistics as iterations
    /// progress.
    pub fn set_progress_sender(&mut self, sender: Sender<ProgressEvent>) {
        self.progress = Some(sender);
    }

    pub fn psi(&self) -> ArrayView3<'_, f32> {
        self.psi.view()
    }

    /// Runs the configured number of iterations. The abort flag is checked
    /// between iterations only; the unit of abortable work is one whole
    /// iteration.
    pub fn run(&mut self, abort_flag: &AtomicBool) -> Result<()> {
        try_for_each_cancellable(0..self.config.num_iterations, abort_flag, |_| {
            self.run_next_iteration().map(|_| ())
        })
    }

    /// Runs one iteration over all views and returns per-view statistics.
    ///
    /// On a compute failure the iteration aborts after the failing batch's
    /// join; batches flushed before the failure remain committed and PSI
    /// stays self-consistent.
    pub fn run_next_iteration(&mut self) -> Result<Vec<ViewIterationStats>> {
        let start = Instant::now();
        let iteration = self.iteration;
        let mut all_stats = Vec::with_capacity(self.views.len());

        for view_index in 0..self.views.len() {
            let view = &self.views[view_index];
            if !view.is_workable() {
                log::warn!("iteration {iteration}: skipping view {view_index} without workable blocks");
                continue;
            }

            let mut view_stats = IterationStats::default();
            let mut blocks_done = 0usize;
            // staged results of the previous batch, committed one batch late
            let mut pending: Vec<StagedBlock> = Vec::new();
            // workers read the estimate as it stood when this view's pass
            // began; without the snapshot, a batch two steps behind would
            // already see committed writes and the result would depend on
            // how the volume was partitioned
            let snapshot = self.psi.clone();

            for batch in &view.batches {
                let psi = snapshot.view();
                let config = &self.config;
                let computed: std::result::Result<Vec<StagedBlock>, DeconvError> =
                    self.pool.install(|| {
                        batch
                            .par_iter()
                            .map_init(
                                || BlockWorker::new(view, view_index, config),
                                |worker, block| worker.run_iteration(view, block, psi),
                            )
                            .collect()
                    });
                // the batch join has completed; any failure surfaces here
                // and leaves previously flushed batches committed
                let staged = match computed {
                    Ok(staged) => staged,
                    Err(err) => {
                        log::error!("iteration {iteration} aborted: {err}");
                        return Err(err);
                    }
                };

                for s in &staged {
                    view_stats.merge(&s.stats);
                }
                blocks_done += staged.len();

                flush(&mut self.psi, pending);
                pending = staged;
            }
            flush(&mut self.psi, pending);

            let stats = ViewIterationStats {
                view: view_index,
                blocks: blocks_done,
                stats: view_stats,
            };
            log::info!(
                "iteration {iteration} view {view_index}: {} blocks, sum change {:.3e}, max change {:.3e}",
                stats.blocks,
                stats.stats.sum_change,
                stats.stats.max_change
            );
            if let Some(sender) = &self.progress {
                sender.send(ProgressEvent { iteration, stats }).ok();
            }
            all_stats.push(stats);
        }

        self.iteration += 1;
        log::debug!(
            "iteration {iteration} finished in {:?}",
            start.elapsed()
        );
        Ok(all_stats)
    }

    /// Consumes the driver and returns the deconvolved volume.
    pub fn into_psi(self) -> Array3<f32> {
        self.psi
    }
}

/// Commits a batch's staged interiors into PSI. Write order within a flush
/// is irrelevant, interiors of one batch are disjoint by construction.
fn flush(psi: &mut Array3<f32>, staged: Vec<StagedBlock>) {
    for s in staged {
        s.write(psi);
    }
}

/// Seeds PSI according to the configured policy.
fn init_psi(views: &[DeconView], dims: [usize; 3], init: PsiInit) -> Array3<f32> {
    match init {
        PsiInit::Constant(value) => Array3::from_elem((dims[0], dims[1], dims[2]), value),
        PsiInit::AverageOfViews => {
            let mut num = Array3::<f32>::zeros((dims[0], dims[1], dims[2]));
            let mut den = Array3::<f32>::zeros((dims[0], dims[1], dims[2]));
            for view in views {
                Zip::from(&mut num)
                    .and(&mut den)
                    .and(&view.image)
                    .and(&view.weight)
                    .for_each(|n, d, &img, &w| {
                        *n += w * img;
                        *d += w;
                    });
            }
            let covered_sum: f64 = Zip::from(&num)
                .and(&den)
                .fold(0.0, |acc, &n, &d| if d > 0.0 { acc + (n / d) as f64 } else { acc });
            let covered_count = den.iter().filter(|&&d| d > 0.0).count();
            let fallback = if covered_count > 0 {
                (covered_sum / covered_count as f64) as f32
            } else {
                1.0
            };
            Zip::from(&mut num)
                .and(&den)
                .for_each(|n, &d| *n = if d > 0.0 { *n / d } else { fallback });
            num
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeconvolutionConfig;
    use crate::convolve::convolve_same;
    use crate::psf::{gaussian_kernel_3d, PsfPair};
    use std::sync::atomic::Ordering;

    /// A smooth positive phantom: constant background plus two blobs.
    fn phantom(dims: (usize, usize, usize)) -> Array3<f32> {
        let c1 = [dims.0 as f32 / 3.0, dims.1 as f32 / 2.0, dims.2 as f32 / 2.0];
        let c2 = [
            2.0 * dims.0 as f32 / 3.0,
            dims.1 as f32 / 3.0,
            dims.2 as f32 / 2.0,
        ];
        Array3::from_shape_fn(dims, |(x, y, z)| {
            let p = [x as f32, y as f32, z as f32];
            let r1: f32 = (0..3).map(|d| (p[d] - c1[d]).powi(2)).sum();
            let r2: f32 = (0..3).map(|d| (p[d] - c2[d]).powi(2)).sum();
            0.5 + 3.0 * (-r1 / 18.0).exp() + 2.0 * (-r2 / 8.0).exp()
        })
    }

    fn run_single_view(
        observed: &Array3<f32>,
        psf: &PsfPair,
        block_size: [usize; 3],
        num_iterations: usize,
    ) -> Array3<f32> {
        let config = DeconvolutionConfig {
            block_size,
            num_iterations,
            ..DeconvolutionConfig::default()
        };
        let weight = Array3::from_elem(observed.dim(), 1.0f32);
        let view = DeconView::new(observed.clone(), weight, psf.clone(), &config).unwrap();
        let mut decon = MultiViewDeconvolution::new(vec![view], config).unwrap();
        decon.run(&AtomicBool::new(false)).unwrap();
        decon.into_psi()
    }

    fn max_abs_diff(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
        Zip::from(a)
            .and(b)
            .fold(0.0f32, |m, &x, &y| m.max((x - y).abs()))
    }

    /// Splitting the volume into blocks must not change the result: every
    /// block of a two-batch plan reads the same iteration-start estimate
    /// that a whole-volume block would.
    #[test]
    fn partitioned_run_matches_whole_volume_run_direct() {
        let psf = PsfPair::matched(gaussian_kernel_3d([0.6; 3])).unwrap();
        assert_eq!(psf.dims(), [5, 5, 5]);
        let observed = convolve_same(phantom((32, 32, 16)).view(), psf.kernel1.view());

        // pad = 4 per side: [40, 24, 24] tiles the volume as two blocks in
        // two batches, [40, 40, 24] covers it whole
        let split = run_single_view(&observed, &psf, [40, 24, 24], 5);
        let whole = run_single_view(&observed, &psf, [40, 40, 24], 5);

        assert!(max_abs_diff(&split, &whole) <= 1e-4);
    }

    /// Same property on the FFT path, where the two plans transform blocks
    /// of different shapes.
    #[test]
    fn partitioned_run_matches_whole_volume_run_fft() {
        let psf = PsfPair::matched(gaussian_kernel_3d([1.3; 3])).unwrap();
        assert_eq!(psf.dims(), [9, 9, 9]);
        let observed = convolve_same(phantom((96, 64, 32)).view(), psf.kernel1.view());

        let split = run_single_view(&observed, &psf, [112, 48, 48], 5);
        let whole = run_single_view(&observed, &psf, [112, 80, 48], 5);

        assert!(max_abs_diff(&split, &whole) <= 1e-4);
    }

    /// The partition must not show through even when the plan has many
    /// batches and write-back interleaves with later batches: every block
    /// reads the estimate as it stood when the view's pass began.
    #[test]
    fn many_batch_plan_matches_whole_volume_run() {
        let psf = PsfPair::matched(gaussian_kernel_3d([1.3; 3])).unwrap();
        assert_eq!(psf.dims(), [9, 9, 9]);
        let observed = convolve_same(phantom((128, 128, 32)).view(), psf.kernel1.view());

        // 48-wide padded blocks leave a 32-cubed interior: a 4x4x1 tile
        // grid scheduled into four batches
        let config = DeconvolutionConfig {
            block_size: [48, 48, 48],
            ..DeconvolutionConfig::default()
        };
        let weight = Array3::from_elem(observed.dim(), 1.0f32);
        let plan = DeconView::new(observed.clone(), weight, psf.clone(), &config).unwrap();
        assert_eq!(plan.num_blocks(), 16);
        assert!(plan.batches.len() > 2);

        let split = run_single_view(&observed, &psf, [48, 48, 48], 5);
        let whole = run_single_view(&observed, &psf, [144, 144, 48], 5);

        assert!(max_abs_diff(&split, &whole) <= 1e-4);
    }

    /// On well-conditioned input the per-iteration change must shrink.
    #[test]
    fn change_statistics_decay_over_iterations() {
        let psf = PsfPair::matched(gaussian_kernel_3d([1.0; 3])).unwrap();
        let observed = convolve_same(phantom((24, 24, 24)).view(), psf.kernel1.view());
        let config = DeconvolutionConfig {
            block_size: [36, 36, 36],
            num_iterations: 8,
            ..DeconvolutionConfig::default()
        };
        let weight = Array3::from_elem(observed.dim(), 1.0f32);
        let view = DeconView::new(observed, weight, psf, &config).unwrap();
        let mut decon = MultiViewDeconvolution::new(vec![view], config).unwrap();

        let mut changes = Vec::new();
        for _ in 0..8 {
            let stats = decon.run_next_iteration().unwrap();
            changes.push(stats[0].stats.sum_change);
        }
        assert!(changes[0] > 0.0);
        // allow a whisker of slack for floating-point noise near convergence
        for pair in changes[1..].windows(2) {
            assert!(pair[1] <= pair[0] * 1.01, "changes grew: {changes:?}");
        }
    }

    /// A blurred point source must sharpen back towards the original: the
    /// peak grows well beyond the observed maximum and the error against
    /// the ground truth shrinks.
    #[test]
    fn point_source_round_trip() {
        let psf = PsfPair::matched(gaussian_kernel_3d([2.0; 3])).unwrap();
        assert_eq!(psf.dims(), [13, 13, 13]);
        let mut sharp = Array3::<f32>::zeros((64, 64, 64));
        sharp[(32, 32, 32)] = 1000.0;
        let observed = convolve_same(sharp.view(), psf.kernel1.view());
        let observed_max = observed.iter().cloned().fold(f32::MIN, f32::max);

        let psi = run_single_view(&observed, &psf, [88, 88, 88], 50);

        let rms = |a: &Array3<f32>| -> f64 {
            let sum: f64 = Zip::from(a)
                .and(&sharp)
                .fold(0.0, |acc, &x, &t| acc + ((x - t) as f64).powi(2));
            (sum / a.len() as f64).sqrt()
        };
        let initial_rms = rms(&observed);
        let final_rms = rms(&psi);
        // within 5% of the dynamic range, and strictly better than the input
        assert!(final_rms < 0.05 * 1000.0);
        assert!(final_rms < initial_rms);

        let peak = psi.iter().cloned().fold(f32::MIN, f32::max);
        assert!(peak > 10.0 * observed_max, "peak only reached {peak}");

        // flux is approximately conserved
        let flux: f64 = psi.iter().map(|&v| v as f64).sum();
        assert!((flux - 1000.0).abs() < 150.0, "flux drifted to {flux}");
    }

    #[test]
    fn multi_view_runs_and_reports_progress() {
        let truth = phantom((24, 24, 16));
        let psf_a = PsfPair::matched(gaussian_kernel_3d([0.6; 3])).unwrap();
        let psf_b = PsfPair::matched(gaussian_kernel_3d([0.8; 3])).unwrap();
        let config = DeconvolutionConfig {
            block_size: [40, 40, 40],
            num_iterations: 3,
            ..DeconvolutionConfig::default()
        };
        let views = vec![
            DeconView::new(
                convolve_same(truth.view(), psf_a.kernel1.view()),
                Array3::from_elem(truth.dim(), 0.5f32),
                psf_a,
                &config,
            )
            .unwrap(),
            DeconView::new(
                convolve_same(truth.view(), psf_b.kernel1.view()),
                Array3::from_elem(truth.dim(), 0.5f32),
                psf_b,
                &config,
            )
            .unwrap(),
        ];
        let mut decon = MultiViewDeconvolution::new(views, config).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        decon.set_progress_sender(tx);
        decon.run(&AtomicBool::new(false)).unwrap();

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3 * 2);
        assert_eq!(events[0].iteration, 0);
        assert_eq!(events[0].stats.view, 0);
        assert_eq!(events[5].iteration, 2);
        assert_eq!(events[5].stats.view, 1);

        let psi = decon.into_psi();
        assert!(psi.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn mismatched_view_shapes_are_rejected() {
        let config = DeconvolutionConfig::default();
        let psf = PsfPair::matched(gaussian_kernel_3d([0.6; 3])).unwrap();
        let make = |dims: (usize, usize, usize)| {
            DeconView::new(
                Array3::from_elem(dims, 1.0f32),
                Array3::from_elem(dims, 1.0f32),
                psf.clone(),
                &config,
            )
            .unwrap()
        };
        let views = vec![make((16, 16, 16)), make((16, 16, 8))];
        assert!(matches!(
            MultiViewDeconvolution::new(views, config),
            Err(DeconvError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn raised_abort_flag_stops_before_first_iteration() {
        let psf = PsfPair::matched(gaussian_kernel_3d([0.6; 3])).unwrap();
        let observed = convolve_same(phantom((16, 16, 16)).view(), psf.kernel1.view());
        let config = DeconvolutionConfig {
            block_size: [24, 24, 24],
            psi_init: PsiInit::Constant(1.0),
            num_iterations: 10,
            ..DeconvolutionConfig::default()
        };
        let weight = Array3::from_elem(observed.dim(), 1.0f32);
        let view = DeconView::new(observed, weight, psf, &config).unwrap();
        let mut decon = MultiViewDeconvolution::new(vec![view], config).unwrap();

        let abort = AtomicBool::new(false);
        abort.store(true, Ordering::Relaxed);
        decon.run(&abort).unwrap();
        for &v in decon.psi().iter() {
            assert_eq!(v, 1.0);
        }
    }
}
