//! Error types for cycling arithmetic

use thiserror::Error;

/// Convenience result type using [`CyclingError`]
pub type Result<T> = std::result::Result<T, CyclingError>;

/// Errors raised by cycle point, interval and sequence operations
///
/// Mixing the integer and date-time domains is a programming error and is
/// reported as [`CyclingError::DomainMismatch`] wherever the operation can
/// return a `Result`. Infallible trait impls (`Ord`) panic instead.
#[derive(Debug, Error)]
pub enum CyclingError {
    /// An operation combined an integer value with a date-time value
    #[error("cycling domain mismatch: {left} vs {right}")]
    DomainMismatch {
        /// Domain of the left-hand operand
        left: String,
        /// Domain of the right-hand operand
        right: String,
    },

    /// A cycle point string could not be parsed in either domain
    #[error("invalid cycle point: {0}")]
    InvalidPoint(String),

    /// An interval string could not be parsed in either domain
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// A sequence was defined with a zero or non-advancing step
    #[error("sequence step must be non-zero and positive: {0}")]
    InvalidStep(String),

    /// Point or interval arithmetic overflowed its domain
    #[error("cycling arithmetic overflow: {0}")]
    Overflow(String),
}
