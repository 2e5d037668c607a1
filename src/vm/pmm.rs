//! Physical Memory Manager
//!
//! The page list never allocates; pages come from a `PhysicalAllocator`
//! injected into each VM object. `PageManager` is the arena implementation
//! backing a fixed physical range with a free page queue.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::error::{VmError, VmResult};
use crate::vm::vm_page::{PageHandle, PageState, VmPage, PAGE_SHIFT, PAGE_SIZE_U64};

// ============================================================================
// Allocator Trait
// ============================================================================

/// Source and sink of physical pages
pub trait PhysicalAllocator: Send + Sync {
    /// Allocate a single page
    fn alloc_page(&self) -> VmResult<PageHandle>;

    /// Allocate `count` pages, not necessarily contiguous
    ///
    /// All-or-nothing: on failure `out` is left as it was.
    fn alloc_pages(&self, count: usize, out: &mut Vec<PageHandle>) -> VmResult<()>;

    /// Allocate `count` physically contiguous pages whose first physical
    /// address is aligned to `1 << align_log2` (at least page aligned)
    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
        out: &mut Vec<PageHandle>,
    ) -> VmResult<()>;

    /// Return a page to the allocator
    fn free_page(&self, page: PageHandle);

    /// Return a batch of pages
    fn free_pages(&self, pages: Vec<PageHandle>) {
        for page in pages {
            self.free_page(page);
        }
    }

    /// Number of free pages
    fn free_count(&self) -> usize;
}

// ============================================================================
// Page Manager
// ============================================================================

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    pub total: usize,
    pub free: usize,
    pub allocated: usize,
    pub alloc_calls: u64,
    pub free_calls: u64,
}

struct PageManagerInner {
    /// All pages in the arena, indexed by page number
    pages: Vec<Arc<VmPage>>,
    /// Free page queue (page numbers)
    free_queue: VecDeque<u32>,
    alloc_calls: u64,
    free_calls: u64,
}

impl PageManagerInner {
    fn take(&mut self, page_num: u32) -> PageHandle {
        let page = Arc::clone(&self.pages[page_num as usize]);
        debug_assert_eq!(page.state(), PageState::Free);
        page.set_state(PageState::Alloc);
        PageHandle::from_page(page)
    }

    fn owns(&self, page: &PageHandle) -> bool {
        self.pages
            .get(page.page_num() as usize)
            .is_some_and(|p| core::ptr::eq(Arc::as_ptr(p), &**page))
    }
}

/// Arena allocator over a contiguous physical range
pub struct PageManager {
    base_paddr: u64,
    inner: Mutex<PageManagerInner>,
}

impl PageManager {
    /// Create a manager for `page_count` pages starting at `base_paddr`
    pub fn new(base_paddr: u64, page_count: u32) -> Self {
        debug_assert_eq!(base_paddr & (PAGE_SIZE_U64 - 1), 0);

        let mut pages = Vec::with_capacity(page_count as usize);
        let mut free_queue = VecDeque::with_capacity(page_count as usize);
        for page_num in 0..page_count {
            let paddr = base_paddr + ((page_num as u64) << PAGE_SHIFT);
            pages.push(Arc::new(VmPage::new(paddr, page_num)));
            free_queue.push_back(page_num);
        }

        log::debug!(
            "pmm: arena {:#x}..{:#x} ({} pages)",
            base_paddr,
            base_paddr + ((page_count as u64) << PAGE_SHIFT),
            page_count
        );

        Self {
            base_paddr,
            inner: Mutex::new(PageManagerInner {
                pages,
                free_queue,
                alloc_calls: 0,
                free_calls: 0,
            }),
        }
    }

    /// First physical address managed by this arena
    pub fn base_paddr(&self) -> u64 {
        self.base_paddr
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        let inner = self.inner.lock();
        let total = inner.pages.len();
        let free = inner.free_queue.len();
        PageStats {
            total,
            free,
            allocated: total - free,
            alloc_calls: inner.alloc_calls,
            free_calls: inner.free_calls,
        }
    }
}

impl PhysicalAllocator for PageManager {
    fn alloc_page(&self) -> VmResult<PageHandle> {
        let mut inner = self.inner.lock();
        let page_num = inner.free_queue.pop_front().ok_or(VmError::NoMemory)?;
        inner.alloc_calls += 1;
        Ok(inner.take(page_num))
    }

    fn alloc_pages(&self, count: usize, out: &mut Vec<PageHandle>) -> VmResult<()> {
        let mut inner = self.inner.lock();
        if inner.free_queue.len() < count {
            log::warn!(
                "pmm: alloc_pages({}) with {} free",
                count,
                inner.free_queue.len()
            );
            return Err(VmError::NoMemory);
        }
        inner.alloc_calls += 1;
        out.reserve(count);
        for _ in 0..count {
            let page_num = inner.free_queue.pop_front().ok_or(VmError::NoMemory)?;
            let page = inner.take(page_num);
            out.push(page);
        }
        Ok(())
    }

    fn alloc_contiguous(
        &self,
        count: usize,
        align_log2: u8,
        out: &mut Vec<PageHandle>,
    ) -> VmResult<()> {
        if count == 0 {
            return Err(VmError::InvalidArgs);
        }
        let align_log2 = (align_log2 as usize).max(PAGE_SHIFT);
        if align_log2 >= 64 {
            return Err(VmError::InvalidArgs);
        }
        let align = 1u64 << align_log2;

        let mut inner = self.inner.lock();
        let total = inner.pages.len();

        // First page number whose physical address satisfies the alignment.
        let first_aligned = self
            .base_paddr
            .checked_next_multiple_of(align)
            .ok_or(VmError::NoMemory)?;
        let first = ((first_aligned - self.base_paddr) >> PAGE_SHIFT) as usize;
        let stride = (align >> PAGE_SHIFT) as usize;
        let mut start = first;

        let found = loop {
            if start.checked_add(count).map_or(true, |end| end > total) {
                break None;
            }
            let run = &inner.pages[start..start + count];
            match run.iter().rposition(|p| p.state() != PageState::Free) {
                None => break Some(start),
                Some(busy) => {
                    // Skip past the busy page, keeping alignment.
                    let next = start + busy + 1;
                    start = first + (next - first).div_ceil(stride) * stride;
                }
            }
        };

        let start = found.ok_or(VmError::NoMemory)?;
        inner.alloc_calls += 1;
        let range = start as u32..(start + count) as u32;
        inner.free_queue.retain(|n| !range.contains(n));
        out.reserve(count);
        for page_num in range {
            let page = inner.take(page_num);
            out.push(page);
        }
        Ok(())
    }

    fn free_page(&self, page: PageHandle) {
        debug_assert!(!page.is_pinned(), "freeing pinned page {:?}", page);

        let mut inner = self.inner.lock();
        if !inner.owns(&page) {
            log::warn!("pmm: free of foreign page {:#x}", page.paddr());
            debug_assert!(false, "page {:#x} not from this arena", page.paddr());
            return;
        }

        let page = page.into_page();
        page.set_state(PageState::Free);
        inner.free_queue.push_back(page.page_num());
        inner.free_calls += 1;
    }

    fn free_count(&self) -> usize {
        self.inner.lock().free_queue.len()
    }
}
