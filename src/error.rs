//! Error types for the back-end.
//!
//! Programmer errors (malformed IR handed in by the driver) are asserted;
//! everything the pipeline can legitimately report travels through
//! [`BackendError`].

use thiserror::Error;

/// Main error type for the compilation pipeline.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("register allocation failed: live-range splitting required for {value}")]
    LiveRangeSplitting {
        /// Debug rendering of the value whose compound could not be placed.
        value: String,
    },

    #[error("move cycle of length {length} requires a temporary register")]
    MoveCycleTooLong { length: usize },

    #[error("unsupported encoding: {reason}")]
    UnsupportedEncoding { reason: String },

    #[error("unexpected {stage} instruction: {kind}")]
    UnexpectedInstruction {
        stage: &'static str,
        kind: String,
    },

    #[error("ELF layout violated: {reason}")]
    LayoutViolation { reason: String },
}

/// Result type alias for pipeline operations.
pub type BackendResult<T> = Result<T, BackendError>;
