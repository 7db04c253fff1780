//! Block-partitioned multi-view Richardson-Lucy deconvolution.
//!
//! Several differently-blurred, registered 3D views of the same specimen
//! (multi-view light-sheet acquisitions) are combined into one sharper
//! volume. The estimate ("PSI") is refined iteratively: every view blurs
//! the current estimate with its point-spread function, compares against
//! its observed image, and pushes a multiplicative correction back.
//!
//! Volumes can be far larger than what a single FFT buffer should hold, so
//! the engine splits each view into kernel-padded blocks
//! ([`block::partition`]), schedules them into batches with pairwise
//! non-overlapping padded extents ([`batch::sort_into_batches`]) and runs
//! the blocks of a batch in parallel, committing writes one batch late so
//! in-flight reads never observe a half-updated estimate
//! ([`deconvolve::MultiViewDeconvolution`]).
//!
//! The [`fusion`] module resamples registered raw views into the common
//! bounding box and normalizes confidence weights across view groups,
//! producing the image/weight pairs a [`view::DeconView`] is built from.

pub mod batch;
pub mod block;
pub mod compute;
pub mod config;
pub mod convolve;
pub mod deconvolve;
pub mod error;
pub mod fft;
pub mod fusion;
pub mod psf;
pub mod view;

pub use config::{DeconvolutionConfig, FusionConfig, PsfPairing, PsiInit};
pub use deconvolve::{MultiViewDeconvolution, ProgressEvent, ViewIterationStats};
pub use error::{DeconvError, Result};
pub use fusion::{fuse_groups, normalize_weights, AffineTransform, FusedGroup, ViewInput};
pub use psf::PsfPair;
pub use view::DeconView;
