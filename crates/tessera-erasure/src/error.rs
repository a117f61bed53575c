//! Error types for slice encoding and reconstruction.

/// Errors from slice encoding or object reconstruction.
#[derive(Debug, thiserror::Error)]
pub enum ErasureError {
    /// The Reed-Solomon library returned an error.
    #[error("reed-solomon error: {0}")]
    ReedSolomon(#[from] reed_solomon_simd::Error),

    /// Fewer surviving slices than data slices.
    #[error("not enough slices: need {needed}, got {got}")]
    NotEnoughSlices {
        /// Minimum slices required (the data count).
        needed: usize,
        /// Slices actually provided.
        got: usize,
    },

    /// A slice id outside `1..=data+parity` was provided.
    #[error("slice id {0} out of range")]
    BadSliceId(u16),

    /// A provided slice does not match the expected slice size.
    #[error("slice size mismatch: expected {expected}, got {got}")]
    SliceSizeMismatch {
        /// Expected slice size for this object.
        expected: usize,
        /// Size of the slice provided.
        got: usize,
    },

    /// The input object was empty.
    #[error("cannot encode empty object")]
    EmptyObject,
}
