//! Error types for the runtime.
//!
//! Two taxa exist on purpose: [`LoadError`] covers everything that can go
//! wrong while reading a model or tensor artifact and is always recoverable
//! by the caller (retry, fall back to another file). [`Error`] covers runtime
//! faults. Memory exhaustion and mid-forward device failure are *not*
//! represented here — they are fatal and panic, with no partial-batch
//! recovery attempted.

use crate::DType;

/// Runtime errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// An index fell outside the tensor's shape on the given axis.
    #[error("index {index} out of range for axis {axis} with size {size}")]
    OutOfRange {
        axis: usize,
        index: usize,
        size: usize,
    },

    /// Two shapes are incompatible for the requested operation.
    #[error("incompatible shapes for {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// The dtype is not supported by this operation.
    #[error("unsupported dtype {dtype} for operation {op}")]
    UnsupportedDType { op: &'static str, dtype: DType },

    /// No device with this id exists in the registry.
    #[error("unknown device id {id} ({count} devices present)")]
    UnknownDevice { id: usize, count: usize },

    /// No binding with this name or index exists on the engine.
    #[error("no binding named {0:?} on this engine")]
    UnknownBinding(String),

    /// A batch larger than the engine supports was requested.
    #[error("batch of {requested} exceeds engine max batch {max}")]
    BatchTooLarge { requested: usize, max: usize },

    /// Row preprocessing failed; only the offending request is affected.
    #[error("row preprocessing failed: {0}")]
    Preprocess(String),

    /// Row postprocessing failed; only the offending request is affected.
    #[error("row postprocessing failed: {0}")]
    Postprocess(String),

    /// The worker shut down before this request's batch was executed.
    #[error("inference worker shut down before the request completed")]
    Canceled,
}

/// Failures while loading a model plan or tensor file.
///
/// Loading never panics: a missing file, foreign format, or stale version all
/// land here so the caller can retry or pick a fallback artifact.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the expected magic number.
    #[error("bad magic 0x{found:08X}, expected 0x{expected:08X}")]
    BadMagic { found: u32, expected: u32 },

    /// The artifact was produced by an incompatible format version.
    #[error("unsupported plan version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// The dtype code in the file is unknown to this build.
    #[error("unsupported dtype code {0}")]
    UnsupportedDType(u32),

    /// The file ended before the declared payload was read.
    #[error("truncated file: expected {expected} more bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// The artifact's internal structure is inconsistent.
    #[error("malformed artifact: {0}")]
    Malformed(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
