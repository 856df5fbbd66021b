//! Hard errors: construction-time geometry validation and bulk-call
//! precondition checks.
//!
//! Soft per-key capacity failures never appear here; they are reported as
//! [`Outcome::Full`](crate::Outcome::Full) in the caller's result buffer.

/// A table could not be constructed or a bulk call was malformed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("key width {0} must be between 1 and 64 bits")]
    KeyWidth(u32),

    #[error("address width {addr} must be smaller than the key width {key}")]
    AddrWidth { addr: u32, key: u32 },

    #[error("bucket size {0} must be a divisor of the 32-lane warp")]
    BucketSize(usize),

    #[error(
        "row width {row} cannot hold {state} state bits plus a {rem}-bit remainder"
    )]
    RowWidth { row: u32, state: u32, rem: u32 },

    #[error("key range length {keys} does not match result length {results}")]
    LengthMismatch { keys: usize, results: usize },

    #[error("scratch length {got} is too small, need {need}")]
    ScratchTooSmall { got: usize, need: usize },

    #[error("range length {len} exceeds the {width}-bit representable limit")]
    RangeTooLong { len: usize, width: u32 },
}
