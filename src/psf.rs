//! Point-spread-function kernel pairs.
//!
//! Each view contributes two small 3D kernels: the forward kernel used to
//! blur the current estimate, and its paired (adjoint) counterpart used to
//! back-project the correction. Both must be odd-sized along every
//! dimension so that a well-defined centre exists and the block padding of
//! `size − 1` voxels is exact and symmetric.

use crate::config::PsfPairing;
use crate::error::{DeconvError, Result};
use ndarray::{s, Array3};
use std::sync::Arc;

/// The two convolution kernels of one view.
///
/// Kernels are normalized to unit sum on construction; a multiplicative
/// update against an unnormalized PSF drifts in overall intensity.
/// The pair is shared read-only across worker threads.
#[derive(Debug, Clone)]
pub struct PsfPair {
    pub kernel1: Arc<Array3<f32>>,
    pub kernel2: Arc<Array3<f32>>,
}

impl PsfPair {
    /// Builds a pair from explicit forward and adjoint kernels.
    pub fn new(kernel1: Array3<f32>, kernel2: Array3<f32>) -> Result<Self> {
        validate_odd(&kernel1)?;
        validate_odd(&kernel2)?;
        let d1 = kernel1.dim();
        let d2 = kernel2.dim();
        if d1 != d2 {
            return Err(DeconvError::ShapeMismatch {
                expected: [d1.0, d1.1, d1.2],
                actual: [d2.0, d2.1, d2.2],
            });
        }
        Ok(PsfPair {
            kernel1: Arc::new(normalized(kernel1)),
            kernel2: Arc::new(normalized(kernel2)),
        })
    }

    /// Builds a pair from the forward kernel alone; the adjoint kernel is
    /// its mirror image along every axis.
    pub fn matched(kernel1: Array3<f32>) -> Result<Self> {
        let kernel2 = flip3(&kernel1);
        Self::new(kernel1, kernel2)
    }

    /// Applies the configured pairing policy.
    ///
    /// `Independent` requires `kernel2`; `Matched` ignores it and derives
    /// the adjoint kernel by flipping `kernel1`.
    pub fn from_kernels(
        kernel1: Array3<f32>,
        kernel2: Option<Array3<f32>>,
        pairing: PsfPairing,
    ) -> Result<Self> {
        match pairing {
            PsfPairing::Matched => Self::matched(kernel1),
            PsfPairing::Independent => match kernel2 {
                Some(k2) => Self::new(kernel1, k2),
                // an absent second kernel degrades to the matched policy
                None => Self::matched(kernel1),
            },
        }
    }

    /// Kernel size per dimension (identical for both kernels).
    pub fn dims(&self) -> [usize; 3] {
        let d = self.kernel1.dim();
        [d.0, d.1, d.2]
    }
}

fn validate_odd(kernel: &Array3<f32>) -> Result<()> {
    let d = kernel.dim();
    for (dim, size) in [d.0, d.1, d.2].into_iter().enumerate() {
        if size % 2 == 0 {
            return Err(DeconvError::InvalidKernel { dim, size });
        }
    }
    Ok(())
}

fn normalized(mut kernel: Array3<f32>) -> Array3<f32> {
    let sum: f32 = kernel.iter().sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|v| v / sum);
    }
    kernel
}

/// Mirrors a kernel along all three axes.
pub fn flip3(kernel: &Array3<f32>) -> Array3<f32> {
    kernel.slice(s![..;-1, ..;-1, ..;-1]).to_owned()
}

/// Creates a normalized, odd-sized 3D Gaussian kernel.
///
/// The kernel extends to three standard deviations per dimension; a sigma
/// of zero along an axis collapses that axis to a single sample.
pub fn gaussian_kernel_3d(sigma: [f32; 3]) -> Array3<f32> {
    let mut half = [0usize; 3];
    for d in 0..3 {
        half[d] = (3.0 * sigma[d]).ceil().max(0.0) as usize;
    }
    let dims = [2 * half[0] + 1, 2 * half[1] + 1, 2 * half[2] + 1];
    let mut kernel = Array3::zeros((dims[0], dims[1], dims[2]));
    for ((x, y, z), v) in kernel.indexed_iter_mut() {
        let mut e = 0.0f32;
        for (d, i) in [x, y, z].into_iter().enumerate() {
            if sigma[d] > 0.0 {
                let r = i as f32 - half[d] as f32;
                e += r * r / (2.0 * sigma[d] * sigma[d]);
            }
        }
        *v = (-e).exp();
    }
    normalized(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gaussian_kernel_is_normalized_and_centred() {
        let k = gaussian_kernel_3d([2.0, 2.0, 1.0]);
        let d = k.dim();
        assert_eq!(d, (13, 13, 7));
        assert_abs_diff_eq!(k.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        let centre = k[(6, 6, 3)];
        assert!(k.iter().all(|&v| v <= centre));
    }

    #[test]
    fn even_kernel_is_rejected() {
        let k = Array3::<f32>::ones((3, 4, 3));
        assert!(matches!(
            PsfPair::matched(k),
            Err(DeconvError::InvalidKernel { dim: 1, size: 4 })
        ));
    }

    #[test]
    fn matched_pair_flips_the_kernel() {
        let mut k = Array3::<f32>::zeros((3, 3, 3));
        k[(0, 1, 2)] = 1.0;
        let pair = PsfPair::matched(k).unwrap();
        assert_abs_diff_eq!(pair.kernel2[(2, 1, 0)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pair.kernel2[(0, 1, 2)], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn pairs_with_different_sizes_are_rejected() {
        let k1 = Array3::<f32>::ones((3, 3, 3));
        let k2 = Array3::<f32>::ones((5, 3, 3));
        assert!(matches!(
            PsfPair::new(k1, k2),
            Err(DeconvError::ShapeMismatch { .. })
        ));
    }
}
