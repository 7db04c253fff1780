//! Direct (spatial-domain) 3D convolution.
//!
//! The direct path is used for small kernels where setting up FFTs costs
//! more than the naive triple loop; both paths compute the same values over
//! a block's interior because the padding of `kernel − 1` voxels absorbs
//! all boundary effects.

use crate::block::mirror_index;
use ndarray::{Array1, Array3, ArrayView3, Axis};

/// Threshold on the number of kernel taps below which the direct path is
/// used instead of the FFT path.
pub const DIRECT_TAP_LIMIT: usize = 7 * 7 * 7;

/// Convolves `input` with `kernel`, returning an output of the same size.
///
/// Out-of-range samples are treated as zero. The result is exact wherever
/// the kernel support stays inside the input, i.e. everywhere a padded
/// block's interior lands.
pub fn convolve_same(input: ArrayView3<'_, f32>, kernel: ArrayView3<'_, f32>) -> Array3<f32> {
    let (n0, n1, n2) = input.dim();
    let (k0, k1, k2) = kernel.dim();
    let c = [k0 as i64 / 2, k1 as i64 / 2, k2 as i64 / 2];

    let mut out = Array3::zeros((n0, n1, n2));
    for x in 0..n0 {
        for y in 0..n1 {
            for z in 0..n2 {
                let mut sum = 0.0f32;
                for u in 0..k0 {
                    let sx = x as i64 + c[0] - u as i64;
                    if sx < 0 || sx >= n0 as i64 {
                        continue;
                    }
                    for v in 0..k1 {
                        let sy = y as i64 + c[1] - v as i64;
                        if sy < 0 || sy >= n1 as i64 {
                            continue;
                        }
                        for w in 0..k2 {
                            let sz = z as i64 + c[2] - w as i64;
                            if sz < 0 || sz >= n2 as i64 {
                                continue;
                            }
                            sum += kernel[(u, v, w)]
                                * input[(sx as usize, sy as usize, sz as usize)];
                        }
                    }
                }
                out[(x, y, z)] = sum;
            }
        }
    }
    out
}

/// Smooths a volume in place with a separable Gaussian, mirroring at the
/// borders. Used to soften weight transitions between views before
/// normalization.
pub fn smooth_gaussian(volume: &mut Array3<f32>, sigma: f32) {
    if sigma <= 0.0 {
        return;
    }
    let half = (3.0 * sigma).ceil() as usize;
    let mut taps = Array1::<f32>::zeros(2 * half + 1);
    for (i, t) in taps.iter_mut().enumerate() {
        let r = i as f32 - half as f32;
        *t = (-r * r / (2.0 * sigma * sigma)).exp();
    }
    let sum: f32 = taps.iter().sum();
    taps.mapv_inplace(|t| t / sum);

    for axis in 0..3 {
        let n = volume.len_of(Axis(axis));
        let mut line = vec![0.0f32; n];
        for mut lane in volume.lanes_mut(Axis(axis)) {
            for (i, l) in line.iter_mut().enumerate() {
                *l = lane[i];
            }
            for (i, out) in lane.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (j, &t) in taps.iter().enumerate() {
                    let s = mirror_index(i as i64 + j as i64 - half as i64, n);
                    acc += t * line[s];
                }
                *out = acc;
            }
        }
    }
}
