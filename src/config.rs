//! Configuration structs for the deconvolution driver and the input fusion
//! stage. Everything is passed explicitly into constructors; there is no
//! process-wide default state.

use serde::{Deserialize, Serialize};

/// How the second kernel of a view's PSF pair is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsfPairing {
    /// Both kernels are supplied by the caller and used as given.
    Independent,
    /// Only the forward kernel is supplied; the adjoint kernel is derived by
    /// flipping it along every axis.
    Matched,
}

/// How the shared estimate volume (PSI) is seeded before the first
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PsiInit {
    /// Constant everywhere.
    Constant(f32),
    /// Per-voxel weighted average of all view images; voxels no view covers
    /// fall back to the global mean of the covered ones.
    AverageOfViews,
}

/// Parameters of the block-partitioned multiplicative update loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeconvolutionConfig {
    /// Outer (padded) block size per dimension. The interior that a block
    /// actually contributes is `block_size − 2 · (kernel_size − 1)`.
    pub block_size: [usize; 3],
    /// Number of multiplicative updates over all views.
    pub num_iterations: usize,
    /// Floor applied to the updated estimate, keeps PSI strictly positive.
    pub min_value: f32,
    /// Floor applied to the blurred-estimate denominator before division.
    pub min_value_img: f32,
    /// Kernel pairing policy, see [`PsfPairing`].
    pub psf_pairing: PsfPairing,
    /// PSI seeding, see [`PsiInit`].
    pub psi_init: PsiInit,
    /// Worker threads for per-batch block dispatch. `0` lets rayon pick one
    /// thread per core.
    pub num_threads: usize,
    /// Batches smaller than this are compacted into earlier batches where
    /// the non-interference invariant allows it.
    pub min_batch_len: usize,
}

impl Default for DeconvolutionConfig {
    fn default() -> Self {
        DeconvolutionConfig {
            block_size: [384, 384, 384],
            num_iterations: 10,
            min_value: 1e-4,
            min_value_img: 1e-4,
            psf_pairing: PsfPairing::Independent,
            psi_init: PsiInit::AverageOfViews,
            num_threads: 0,
            min_batch_len: 1,
        }
    }
}

/// Parameters of the input fusion stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Integer downsampling factor applied to the output grid.
    pub downsampling: usize,
    /// Voxels (in view-local coordinates) ignored at each view border
    /// before the blending ramp starts.
    pub blending_border: f32,
    /// Width of the linear blending ramp in voxels.
    pub blending_range: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            downsampling: 1,
            blending_border: 0.0,
            blending_range: 12.0,
        }
    }
}
