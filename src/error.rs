//! # Error taxonomy of the memory subsystem
//!
//! Recoverable conditions are carried as [`Error`] values. Hardware-constraint
//! violations (table frames that are not page aligned, physical addresses that
//! exceed the supported width) are bugs in the kernel itself and are checked
//! with assertions instead, never returned.

/// A recoverable memory-management error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No physical frame, or a page-table frame, could be allocated.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The requested virtual range collides with an existing region.
    #[error("virtual range overlaps an existing region")]
    Overlap,
    /// A malformed request (zero-length span, unknown flags, offset past the
    /// end of the backing object).
    #[error("invalid argument")]
    InvalidArgument,
    /// An access the mapping forbids. Surfaced to the faulting process as a
    /// signal, never a kernel panic.
    #[error("access violation")]
    AccessViolation,
    /// No registered page directory matches the given table root.
    #[error("no page directory registered for table root")]
    NoSuchDirectory,
}

pub type Result<T> = core::result::Result<T, Error>;
