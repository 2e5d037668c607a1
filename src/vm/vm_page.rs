//! VM Page - Physical Page Handles
//!
//! A `VmPage` describes one physical page. Page lists never own the
//! descriptor itself; they hold a `PageHandle`, the move-only token a
//! physical allocator hands out. Because the handle is not `Clone`, a page
//! can sit in at most one list slot at a time.

use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Page size as an offset quantity
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

// ============================================================================
// Page State
// ============================================================================

/// Lifecycle state of a physical page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// On the allocator's free queue
    Free = 0,
    /// Handed out by the allocator, not yet placed in an object
    Alloc = 1,
    /// Owned by a VM object's page list
    Object = 2,
    /// Wired for kernel use
    Wired = 3,
}

impl PageState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PageState::Free,
            1 => PageState::Alloc,
            2 => PageState::Object,
            _ => PageState::Wired,
        }
    }
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Physical page descriptor
#[derive(Debug)]
pub struct VmPage {
    /// Physical address of this page
    phys_addr: u64,

    /// Page number within the owning allocator
    page_num: u32,

    /// Current `PageState`
    state: AtomicU8,

    /// Pin count; a pinned page may not be decommitted or spliced away
    pin_count: AtomicU32,
}

impl VmPage {
    /// Create a new free page descriptor
    pub fn new(phys_addr: u64, page_num: u32) -> Self {
        Self {
            phys_addr,
            page_num,
            state: AtomicU8::new(PageState::Free as u8),
            pin_count: AtomicU32::new(0),
        }
    }

    /// Physical address of the page
    pub fn paddr(&self) -> u64 {
        self.phys_addr
    }

    /// Page number within the allocator
    pub fn page_num(&self) -> u32 {
        self.page_num
    }

    /// Current state
    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Set the page state
    pub fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current pin count
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Check if the page is pinned
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Increment the pin count
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the pin count
    ///
    /// Returns false if the page was not pinned.
    pub fn unpin(&self) -> bool {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }
}

// ============================================================================
// Page Handle
// ============================================================================

/// Exclusive reference to an allocated physical page
///
/// Only a physical allocator creates handles, and only a physical allocator
/// consumes them again when the page is freed.
pub struct PageHandle {
    page: Arc<VmPage>,
}

impl PageHandle {
    /// Wrap an allocator-owned descriptor. Allocator use only.
    pub(crate) fn from_page(page: Arc<VmPage>) -> Self {
        Self { page }
    }

    /// Unwrap back into the shared descriptor. Allocator use only.
    pub(crate) fn into_page(self) -> Arc<VmPage> {
        self.page
    }

    /// Check whether two handles name the same physical page
    pub fn same_page(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.page, &other.page)
    }
}

impl Deref for PageHandle {
    type Target = VmPage;

    fn deref(&self) -> &VmPage {
        &self.page
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("paddr", &format_args!("{:#x}", self.page.phys_addr))
            .field("state", &self.state())
            .field("pin_count", &self.pin_count())
            .finish()
    }
}

impl PartialEq for PageHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_page(other)
    }
}

impl Eq for PageHandle {}

// ============================================================================
// Alignment
// ============================================================================

/// Check page alignment
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE_U64 - 1) == 0
}
