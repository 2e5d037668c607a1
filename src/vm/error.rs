//! VM error type
//!
//! Status codes surfaced by the page list and the paged object layer.
//! They mirror the kernel status values returned from VMO syscalls.

use thiserror::Error;

/// Result type used throughout the VM subsystem
pub type VmResult<T> = Result<T, VmError>;

/// VM subsystem errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Offset or range cannot be represented or lies outside the object
    #[error("offset out of range")]
    OutOfRange,

    /// Argument is malformed (unaligned offset, zero length, ...)
    #[error("invalid arguments")]
    InvalidArgs,

    /// A page already occupies the requested slot
    #[error("page slot already occupied")]
    AlreadyExists,

    /// Operation conflicts with the current state (pinned pages, skew already set)
    #[error("bad state")]
    BadState,

    /// The physical allocator could not satisfy the request
    #[error("out of physical pages")]
    NoMemory,

    /// A required page is not present
    #[error("page not found")]
    NotFound,

    /// Operation is not supported on this object
    #[error("operation not supported")]
    NotSupported,
}
