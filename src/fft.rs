//! FFT-based 3D convolution.
//!
//! The forward transform runs real-to-complex along the contiguous axis
//! (realfft) and complex FFTs along the remaining two axes (rustfft), which
//! halves the spectrum size compared to a fully complex transform. Kernel
//! spectra are computed once per padded block shape and shared read-only
//! between worker threads; each worker owns its own plans and lane buffers.
//!
//! The convolution is circular, which is exact over a block's interior
//! because the padding of `kernel − 1` voxels per side exceeds the kernel
//! radius that wrap-around can contaminate.

use ndarray::{Array3, ArrayView3, Axis, Zip};
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Spectrum of a kernel, premultiplied layout for one padded block shape.
#[derive(Debug, Clone)]
pub struct KernelSpectrum {
    pub shape: [usize; 3],
    pub spectrum: Array3<Complex32>,
}

/// 3D FFT plans and scratch for one padded block shape.
pub struct Fft3 {
    shape: [usize; 3],
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    fft_axis0: [Arc<dyn Fft<f32>>; 2],
    fft_axis1: [Arc<dyn Fft<f32>>; 2],
}

impl Fft3 {
    /// Plans transforms for volumes of the given shape.
    pub fn new(shape: [usize; 3]) -> Self {
        let mut real_planner = RealFftPlanner::<f32>::new();
        let mut planner = FftPlanner::<f32>::new();
        Fft3 {
            shape,
            r2c: real_planner.plan_fft_forward(shape[2]),
            c2r: real_planner.plan_fft_inverse(shape[2]),
            fft_axis0: [
                planner.plan_fft_forward(shape[0]),
                planner.plan_fft_inverse(shape[0]),
            ],
            fft_axis1: [
                planner.plan_fft_forward(shape[1]),
                planner.plan_fft_inverse(shape[1]),
            ],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Half-spectrum length along the contiguous axis.
    fn spectrum_len(&self) -> usize {
        self.shape[2] / 2 + 1
    }

    /// Real-to-complex 3D forward transform.
    pub fn forward(&self, input: ArrayView3<'_, f32>) -> Array3<Complex32> {
        debug_assert_eq!(
            input.dim(),
            (self.shape[0], self.shape[1], self.shape[2])
        );
        let m = self.spectrum_len();
        let mut spec = Array3::<Complex32>::zeros((self.shape[0], self.shape[1], m));

        // axis 2: real-to-complex per lane
        let mut line = self.r2c.make_input_vec();
        let mut out = self.r2c.make_output_vec();
        for x in 0..self.shape[0] {
            for y in 0..self.shape[1] {
                for z in 0..self.shape[2] {
                    line[z] = input[(x, y, z)];
                }
                self.r2c
                    .process(&mut line, &mut out)
                    .expect("planned r2c length matches buffer");
                for (z, &v) in out.iter().enumerate() {
                    spec[(x, y, z)] = v;
                }
            }
        }

        self.fft_lanes(&mut spec, Axis(1), &self.fft_axis1[0]);
        self.fft_lanes(&mut spec, Axis(0), &self.fft_axis0[0]);
        spec
    }

    /// Complex-to-real 3D inverse transform, normalized so that
    /// `inverse(forward(x)) == x`.
    pub fn inverse(&self, mut spec: Array3<Complex32>) -> Array3<f32> {
        self.fft_lanes(&mut spec, Axis(0), &self.fft_axis0[1]);
        self.fft_lanes(&mut spec, Axis(1), &self.fft_axis1[1]);

        let mut out = Array3::<f32>::zeros((self.shape[0], self.shape[1], self.shape[2]));
        let mut line = self.c2r.make_input_vec();
        let mut real = self.c2r.make_output_vec();
        let scale = 1.0 / (self.shape[0] * self.shape[1] * self.shape[2]) as f32;
        for x in 0..self.shape[0] {
            for y in 0..self.shape[1] {
                for (z, l) in line.iter_mut().enumerate() {
                    *l = spec[(x, y, z)];
                }
                // DC and Nyquist bins of a real signal are real; strip the
                // rounding residue realfft would reject
                line[0].im = 0.0;
                if self.shape[2] % 2 == 0 {
                    let last = line.len() - 1;
                    line[last].im = 0.0;
                }
                self.c2r
                    .process(&mut line, &mut real)
                    .expect("planned c2r length matches buffer");
                for (z, &v) in real.iter().enumerate() {
                    out[(x, y, z)] = v * scale;
                }
            }
        }
        out
    }

    /// Runs a planned 1D FFT over every lane of `spec` along `axis`.
    fn fft_lanes(&self, spec: &mut Array3<Complex32>, axis: Axis, fft: &Arc<dyn Fft<f32>>) {
        let n = spec.len_of(axis);
        let mut buffer = vec![Complex32::default(); n];
        let mut scratch = vec![Complex32::default(); fft.get_inplace_scratch_len()];
        for mut lane in spec.lanes_mut(axis) {
            for (i, b) in buffer.iter_mut().enumerate() {
                *b = lane[i];
            }
            fft.process_with_scratch(&mut buffer, &mut scratch);
            for (i, &b) in buffer.iter().enumerate() {
                lane[i] = b;
            }
        }
    }

    /// Precomputes the spectrum of a kernel for this block shape. The
    /// kernel centre is wrapped to the origin so that spectrum
    /// multiplication realizes a centred convolution.
    pub fn kernel_spectrum(&self, kernel: ArrayView3<'_, f32>) -> KernelSpectrum {
        let (k0, k1, k2) = kernel.dim();
        let c = [k0 / 2, k1 / 2, k2 / 2];
        let mut padded = Array3::<f32>::zeros((self.shape[0], self.shape[1], self.shape[2]));
        for ((i, j, l), &v) in kernel.indexed_iter() {
            let x = (i as i64 - c[0] as i64).rem_euclid(self.shape[0] as i64) as usize;
            let y = (j as i64 - c[1] as i64).rem_euclid(self.shape[1] as i64) as usize;
            let z = (l as i64 - c[2] as i64).rem_euclid(self.shape[2] as i64) as usize;
            padded[(x, y, z)] = v;
        }
        KernelSpectrum {
            shape: self.shape,
            spectrum: self.forward(padded.view()),
        }
    }

    /// Circular convolution of `input` with a precomputed kernel spectrum.
    pub fn convolve(&self, input: ArrayView3<'_, f32>, kernel: &KernelSpectrum) -> Array3<f32> {
        debug_assert_eq!(kernel.shape, self.shape);
        let mut spec = self.forward(input);
        Zip::from(&mut spec)
            .and(&kernel.spectrum)
            .for_each(|s, &k| *s *= k);
        self.inverse(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolve::convolve_same;
    use crate::psf::gaussian_kernel_3d;
    use approx::assert_abs_diff_eq;
    use ndarray::s;

    fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
        let mut v = Array3::<f32>::zeros(shape);
        for ((x, y, z), p) in v.indexed_iter_mut() {
            *p = ((x * 7 + y * 3 + z * 5) % 11) as f32 + 0.25;
        }
        v
    }

    #[test]
    fn forward_inverse_roundtrip() {
        let input = ramp((12, 10, 9));
        let fft = Fft3::new([12, 10, 9]);
        let back = fft.inverse(fft.forward(input.view()));
        for (a, b) in back.iter().zip(input.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn fft_matches_direct_convolution_on_interior() {
        let input = ramp((16, 14, 12));
        let kernel = gaussian_kernel_3d([1.0, 1.0, 1.0]); // 7x7x7
        let fft = Fft3::new([16, 14, 12]);
        let spec = fft.kernel_spectrum(kernel.view());
        let by_fft = fft.convolve(input.view(), &spec);
        let direct = convolve_same(input.view(), kernel.view());
        // padding kernel-1 = 6 voxels would be exact; compare the region
        // both methods compute without boundary effects
        let inner = s![6..10, 6..8, 6..6 + 1];
        for (a, b) in by_fft.slice(inner).iter().zip(direct.slice(inner).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn delta_kernel_spectrum_is_identity() {
        let input = ramp((8, 8, 8));
        let mut delta = Array3::<f32>::zeros((3, 3, 3));
        delta[(1, 1, 1)] = 1.0;
        let fft = Fft3::new([8, 8, 8]);
        let spec = fft.kernel_spectrum(delta.view());
        let out = fft.convolve(input.view(), &spec);
        for (a, b) in out.iter().zip(input.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }
}
