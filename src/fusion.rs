//! Input fusion: resamples registered views into the common bounding box
//! and normalizes the per-voxel confidence weights across view groups.
//!
//! Each view arrives with an affine transform mapping its local voxel grid
//! into world (bounding-box) coordinates. Fusion walks the output grid,
//! pulls every view back through the inverse transform with trilinear
//! interpolation, fades each view's weight to zero inside a configurable
//! border band, and accumulates a weighted average per group. The fused
//! image/weight pairs are what [`crate::view::DeconView`] is built from.

use crate::config::FusionConfig;
use crate::convolve::smooth_gaussian;
use crate::error::{DeconvError, Result};
use ndarray::{Array3, Zip};

/// Affine map from view-local voxel coordinates to world coordinates,
/// stored as the upper 3×4 of the homogeneous matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub m: [[f64; 4]; 3],
}

impl AffineTransform {
    pub fn identity() -> Self {
        let mut m = [[0.0; 4]; 3];
        for d in 0..3 {
            m[d][d] = 1.0;
        }
        AffineTransform { m }
    }

    pub fn translation(t: [f64; 3]) -> Self {
        let mut a = Self::identity();
        for d in 0..3 {
            a.m[d][3] = t[d];
        }
        a
    }

    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for r in 0..3 {
            out[r] = self.m[r][0] * p[0]
                + self.m[r][1] * p[1]
                + self.m[r][2] * p[2]
                + self.m[r][3];
        }
        out
    }

    /// Inverse transform, or `None` when the linear part is singular.
    pub fn invert(&self) -> Option<AffineTransform> {
        let m = &self.m;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let mut inv = [[0.0; 4]; 3];
        inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
        // translation of the inverse: -A⁻¹ t
        for r in 0..3 {
            inv[r][3] = -(inv[r][0] * m[0][3] + inv[r][1] * m[1][3] + inv[r][2] * m[2][3]);
        }
        Some(AffineTransform { m: inv })
    }
}

/// One registered input view as delivered by the upstream pipeline.
#[derive(Debug, Clone)]
pub struct ViewInput {
    pub image: Array3<f32>,
    pub weight: Array3<f32>,
    pub transform: AffineTransform,
}

/// Fused image and raw (unnormalized) weight of one view group.
#[derive(Debug, Clone)]
pub struct FusedGroup {
    pub image: Array3<f32>,
    pub weight: Array3<f32>,
}

/// Fuses each group of registered views into the common bounding box.
///
/// The output grid covers `bounding_box` at the configured integer
/// downsampling. Within a group, views are combined as a weighted average;
/// the group's weight volume is the sum of the contributing view weights
/// and is handed on to [`normalize_weights`].
pub fn fuse_groups(
    groups: &[Vec<ViewInput>],
    bounding_box: [usize; 3],
    config: &FusionConfig,
) -> Result<Vec<FusedGroup>> {
    let ds = config.downsampling.max(1);
    let dims = (
        bounding_box[0].div_ceil(ds),
        bounding_box[1].div_ceil(ds),
        bounding_box[2].div_ceil(ds),
    );
    groups
        .iter()
        .map(|views| fuse_group(views, dims, ds, config))
        .collect()
}

fn fuse_group(
    views: &[ViewInput],
    dims: (usize, usize, usize),
    ds: usize,
    config: &FusionConfig,
) -> Result<FusedGroup> {
    let mut num = Array3::<f32>::zeros(dims);
    let mut den = Array3::<f32>::zeros(dims);

    for (view_index, view) in views.iter().enumerate() {
        if view.image.dim() != view.weight.dim() {
            let d = view.weight.dim();
            let e = view.image.dim();
            return Err(DeconvError::ShapeMismatch {
                expected: [e.0, e.1, e.2],
                actual: [d.0, d.1, d.2],
            });
        }
        let inverse = view
            .transform
            .invert()
            .ok_or(DeconvError::SingularTransform { view: view_index })?;
        let image = &view.image;
        let weight = &view.weight;
        Zip::indexed(&mut num)
            .and(&mut den)
            .par_for_each(|(x, y, z), n, d| {
                let world = [
                    (x * ds) as f64,
                    (y * ds) as f64,
                    (z * ds) as f64,
                ];
                let src = inverse.apply(world);
                if let Some(v) = sample_trilinear(image, src) {
                    let w = sample_trilinear(weight, src).unwrap_or(0.0)
                        * border_fade(src, image.dim(), config);
                    *n += w * v;
                    *d += w;
                }
            });
    }

    let mut image = num;
    Zip::from(&mut image)
        .and(&den)
        .par_for_each(|v, &w| *v = if w > 0.0 { *v / w } else { 0.0 });
    Ok(FusedGroup { image, weight: den })
}

/// Scales the per-group weights so that they sum to `osem_speedup` at every
/// voxel covered by at least one group (and to zero elsewhere), capping
/// individual weights at 1. An optional Gaussian smoothing is applied first
/// to soften hard transitions between views.
pub fn normalize_weights(
    weights: &mut [Array3<f32>],
    osem_speedup: f32,
    smoothing_sigma: Option<f32>,
) {
    if weights.is_empty() {
        return;
    }
    if let Some(sigma) = smoothing_sigma {
        if sigma > 0.0 {
            for w in weights.iter_mut() {
                smooth_gaussian(w, sigma);
            }
        }
    }
    let mut total = Array3::<f32>::zeros(weights[0].dim());
    for w in weights.iter() {
        Zip::from(&mut total).and(w).for_each(|t, &v| *t += v);
    }
    for w in weights.iter_mut() {
        Zip::from(w)
            .and(&total)
            .par_for_each(|v, &t| {
                *v = if t > 0.0 {
                    (*v / t * osem_speedup).min(1.0)
                } else {
                    0.0
                }
            });
    }
}

/// Trilinear interpolation at a fractional coordinate; `None` outside the
/// volume.
fn sample_trilinear(volume: &Array3<f32>, p: [f64; 3]) -> Option<f32> {
    let dims = volume.dim();
    let n = [dims.0, dims.1, dims.2];
    for d in 0..3 {
        if n[d] == 0 || p[d] < 0.0 || p[d] > (n[d] - 1) as f64 {
            return None;
        }
    }
    let mut i0 = [0usize; 3];
    let mut i1 = [0usize; 3];
    let mut f = [0.0f32; 3];
    for d in 0..3 {
        i0[d] = p[d].floor() as usize;
        i1[d] = (i0[d] + 1).min(n[d] - 1);
        f[d] = (p[d] - i0[d] as f64) as f32;
    }
    let mut value = 0.0f32;
    for cx in 0..2 {
        for cy in 0..2 {
            for cz in 0..2 {
                let wx = if cx == 0 { 1.0 - f[0] } else { f[0] };
                let wy = if cy == 0 { 1.0 - f[1] } else { f[1] };
                let wz = if cz == 0 { 1.0 - f[2] } else { f[2] };
                let idx = (
                    if cx == 0 { i0[0] } else { i1[0] },
                    if cy == 0 { i0[1] } else { i1[1] },
                    if cz == 0 { i0[2] } else { i1[2] },
                );
                value += wx * wy * wz * volume[idx];
            }
        }
    }
    Some(value)
}

/// Per-dimension linear fade of a view's weight towards its borders: zero
/// within `blending_border` voxels of an edge, ramping up to one over the
/// next `blending_range` voxels.
fn border_fade(p: [f64; 3], dims: (usize, usize, usize), config: &FusionConfig) -> f32 {
    let n = [dims.0, dims.1, dims.2];
    let border = config.blending_border;
    let range = config.blending_range;
    let mut fade = 1.0f32;
    for d in 0..3 {
        if n[d] == 0 {
            return 0.0;
        }
        let dist = p[d].min((n[d] - 1) as f64 - p[d]) as f32;
        let f = if dist < border {
            0.0
        } else if range > 0.0 && dist < border + range {
            (dist - border) / range
        } else {
            1.0
        };
        fade *= f.clamp(0.0, 1.0);
    }
    fade
}
