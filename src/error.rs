//! Error types for the deconvolution engine.

use thiserror::Error;

/// Result type alias for deconvolution operations
pub type Result<T> = std::result::Result<T, DeconvError>;

/// Errors raised while preparing views or running iterations.
#[derive(Error, Debug)]
pub enum DeconvError {
    /// Block size incompatible with the kernel size: after removing the
    /// padding of `kernel − 1` voxels per side the block interior would be
    /// empty along the named dimension.
    #[error(
        "cannot partition volume: block size {block_size} leaves no interior \
         for kernel size {kernel_size} along dimension {dim}"
    )]
    PartitionFailure {
        dim: usize,
        block_size: usize,
        kernel_size: usize,
    },

    /// A per-block compute task failed; identifies the view and block.
    #[error("compute failed for view {view} block {block}: {reason}")]
    ComputeFailure {
        view: usize,
        block: usize,
        reason: String,
    },

    /// Image and weight (or PSI and view) volumes disagree in shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// PSF kernels must be odd-sized along every dimension.
    #[error("invalid PSF kernel: dimension {dim} has even size {size}")]
    InvalidKernel { dim: usize, size: usize },

    /// A view's transform into the common bounding box is not invertible.
    #[error("transform of view {view} is singular and cannot be inverted")]
    SingularTransform { view: usize },

    /// The driver was constructed without any usable view.
    #[error("no views with workable blocks")]
    NoViews,

    /// The bounded worker pool could not be built.
    #[error("thread pool: {0}")]
    ThreadPool(String),
}
