//! vmo_pages - Page bookkeeping for paged VM objects
//!
//! This crate tracks which physical pages back each offset of a virtual
//! memory object: a sparse, node-based page list with skewed node
//! alignment for COW clones, splice lists for moving page ranges between
//! objects, and merging for collapsing clone chains.

#![cfg_attr(not(test), no_std)]
// Kernel code often needs explicit casts between offset and index types
#![allow(clippy::unnecessary_cast)]

// Standard library replacement for no_std
extern crate alloc;

pub mod klog;
pub mod vm;

pub use vm::{PageHandle, PageList, PageSpliceList, PhysicalAllocator, VmError, VmObjectPaged, VmResult};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "vmo_pages";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "vmo_pages");
        assert!(!VERSION.is_empty());
    }
}
