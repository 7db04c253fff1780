//! Per-view container: one acquired image, its confidence weight, the PSF
//! kernel pair and the block/batch plan for this view's data footprint.
//!
//! A `DeconView` is built once before the iteration loop and is read-only
//! afterwards; worker threads share it by reference.

use crate::batch::{filter_empty_weight_blocks, sort_into_batches};
use crate::block::{partition, Block};
use crate::config::DeconvolutionConfig;
use crate::convolve::{convolve_same, DIRECT_TAP_LIMIT};
use crate::error::{DeconvError, Result};
use crate::fft::{Fft3, KernelSpectrum};
use crate::psf::PsfPair;
use ndarray::{Array3, ArrayView3};

/// How this view's convolutions are evaluated.
///
/// Small kernels run the naive spatial loop; larger ones go through FFTs
/// with kernel spectra precomputed for the uniform padded block shape.
pub enum ConvStrategy {
    Direct,
    Fft {
        fft: Fft3,
        kernel1: KernelSpectrum,
        kernel2: KernelSpectrum,
    },
}

/// One view of the specimen: image, weight, PSF pair and block plan.
pub struct DeconView {
    pub image: Array3<f32>,
    pub weight: Array3<f32>,
    pub psf: PsfPair,
    /// Maximum image intensity, scales the division guard of the update.
    pub max_intensity: f32,
    /// Ordered batches of mutually non-interfering blocks. Empty when the
    /// block size cannot accommodate this view's kernel padding; the driver
    /// skips such views.
    pub batches: Vec<Vec<Block>>,
    /// Uniform padded block shape of this view's partition.
    pub outer_dims: [usize; 3],
    pub strategy: ConvStrategy,
}

impl DeconView {
    /// Builds the view and derives its block/batch plan.
    ///
    /// Fails hard on mismatched image/weight shapes; an incompatible block
    /// size only degrades the view to "no workable blocks" with a warning,
    /// per the partition-failure policy.
    pub fn new(
        image: Array3<f32>,
        weight: Array3<f32>,
        psf: PsfPair,
        config: &DeconvolutionConfig,
    ) -> Result<Self> {
        let idim = image.dim();
        let wdim = weight.dim();
        if idim != wdim {
            return Err(DeconvError::ShapeMismatch {
                expected: [idim.0, idim.1, idim.2],
                actual: [wdim.0, wdim.1, wdim.2],
            });
        }

        let volume_dims = [idim.0, idim.1, idim.2];
        let kernel_dims = psf.dims();

        let (batches, outer_dims) =
            match partition(volume_dims, kernel_dims, config.block_size) {
                Ok(part) => {
                    let outer = part.outer_dims;
                    let batches = sort_into_batches(&part, config.min_batch_len);
                    let batches = filter_empty_weight_blocks(batches, weight.view());
                    (batches, outer)
                }
                Err(err) => {
                    log::warn!("view has no workable blocks: {err}");
                    (Vec::new(), config.block_size)
                }
            };

        let taps = kernel_dims[0] * kernel_dims[1] * kernel_dims[2];
        let strategy = if taps > DIRECT_TAP_LIMIT && !batches.is_empty() {
            let fft = Fft3::new(outer_dims);
            let kernel1 = fft.kernel_spectrum(psf.kernel1.view());
            let kernel2 = fft.kernel_spectrum(psf.kernel2.view());
            ConvStrategy::Fft {
                fft,
                kernel1,
                kernel2,
            }
        } else {
            ConvStrategy::Direct
        };

        let max_intensity = image.iter().cloned().fold(f32::MIN, f32::max);

        Ok(DeconView {
            image,
            weight,
            psf,
            max_intensity,
            batches,
            outer_dims,
            strategy,
        })
    }

    /// Builds the view from raw kernels, deriving the adjoint kernel
    /// according to the configured pairing policy.
    pub fn from_raw_kernels(
        image: Array3<f32>,
        weight: Array3<f32>,
        kernel1: Array3<f32>,
        kernel2: Option<Array3<f32>>,
        config: &DeconvolutionConfig,
    ) -> Result<Self> {
        let psf = PsfPair::from_kernels(kernel1, kernel2, config.psf_pairing)?;
        Self::new(image, weight, psf, config)
    }

    pub fn volume_dims(&self) -> [usize; 3] {
        let d = self.image.dim();
        [d.0, d.1, d.2]
    }

    pub fn num_blocks(&self) -> usize {
        self.batches.iter().map(|b| b.len()).sum()
    }

    /// A view without workable blocks is skipped by the driver.
    pub fn is_workable(&self) -> bool {
        !self.batches.is_empty()
    }

    /// Convolution with the forward kernel.
    pub fn convolve1(&self, block: ArrayView3<'_, f32>) -> Array3<f32> {
        match &self.strategy {
            ConvStrategy::Direct => convolve_same(block, self.psf.kernel1.view()),
            ConvStrategy::Fft { fft, kernel1, .. } => fft.convolve(block, kernel1),
        }
    }

    /// Convolution with the paired (adjoint) kernel.
    pub fn convolve2(&self, block: ArrayView3<'_, f32>) -> Array3<f32> {
        match &self.strategy {
            ConvStrategy::Direct => convolve_same(block, self.psf.kernel2.view()),
            ConvStrategy::Fft { fft, kernel2, .. } => fft.convolve(block, kernel2),
        }
    }
}
