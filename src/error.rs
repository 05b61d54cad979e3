//! Error types and result alias.
//!
//! The allocator's only caller-visible failure is a duplicate live range
//! at ingest. Everything else is recovered internally: unusable splits
//! route through the second-chance queue, and ranges that still cannot be
//! placed degrade into spills.

use crate::interval::Interval;
use crate::RegClass;
use thiserror::Error;

/// The result type used throughout the allocator.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors surfaced by the allocator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Two input ranges in the same register class cover exactly the same
    /// interval. Detected before allocation begins.
    #[error("duplicate live range {interval} in {class} class")]
    DuplicateRange {
        /// The register class both ranges allocate from.
        class: RegClass,
        /// The interval supplied twice.
        interval: Interval,
    },
}
