//! VM Object - Paged Memory Objects
//!
//! A `VmObjectPaged` owns one `PageList` behind a spin lock and draws its
//! pages from an injected `PhysicalAllocator`. Objects can be cloned
//! copy-on-write: the child starts with an empty list whose skew lines its
//! nodes up with the parent's, reads fall through to the parent, and a
//! write fault gives the child a private page.
//!
//! Lock order is always child before parent.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::vm::counters::{
    C_COLLAPSES, C_COW_CLONES, C_COW_FAULTS, C_MERGE_FREED, C_MERGE_KEPT, C_PAGES_COMMITTED,
    C_PAGES_DECOMMITTED, C_PAGES_RELEASED, C_SPLICE_DISCARDED, C_SPLICE_SUPPLIED, C_SPLICE_TAKES,
};
use crate::vm::error::{VmError, VmResult};
use crate::vm::page_list::{PageList, PageSpliceList, Walk};
use crate::vm::pmm::PhysicalAllocator;
use crate::vm::vm_page::{is_page_aligned, PageHandle, PageState, PAGE_SIZE, PAGE_SIZE_U64};
use crate::vm_counter;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);

    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct VmObjectInner {
    /// Size in bytes
    size: u64,

    /// Pages owned by this object
    page_list: PageList,

    /// COW parent
    parent: Option<Arc<VmObjectPaged>>,

    /// Offset of this object within its parent
    parent_offset: u64,

    /// Offsets below this limit fall through to the parent
    parent_limit: u64,

    /// Live COW clones of this object
    children: u32,
}

impl VmObjectInner {
    /// Validate `[offset, offset + len)` against the object size
    fn check_range(&self, offset: u64, len: u64) -> VmResult<u64> {
        if !is_page_aligned(offset) || !is_page_aligned(len) {
            return Err(VmError::InvalidArgs);
        }
        let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > self.size {
            return Err(VmError::OutOfRange);
        }
        Ok(end)
    }

    /// Fail with `BadState` if any page in `[start, end)` is pinned
    fn check_unpinned(&self, start: u64, end: u64) -> VmResult<()> {
        self.page_list.for_every_page_in_range(
            |page, offset| {
                if page.is_pinned() {
                    log::warn!("vmo: page at {:#x} is pinned", offset);
                    return Err(VmError::BadState);
                }
                Ok(Walk::Next)
            },
            start,
            end,
        )?;
        Ok(())
    }
}

/// Largest object size a list with `skew` can back
fn size_fits(list: &PageList, size: u64) -> bool {
    size == 0 || size - PAGE_SIZE_U64 <= list.max_offset()
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// Paged VM object backed by a page list
pub struct VmObjectPaged {
    id: VmObjectId,
    pmm: Arc<dyn PhysicalAllocator>,
    inner: Mutex<VmObjectInner>,
}

impl VmObjectPaged {
    /// Create an empty object of `size` bytes
    pub fn create(pmm: Arc<dyn PhysicalAllocator>, size: u64) -> VmResult<Arc<Self>> {
        if !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        let page_list = PageList::new();
        if !size_fits(&page_list, size) {
            return Err(VmError::OutOfRange);
        }

        let obj = Arc::new(Self {
            id: VmObjectId::next(),
            pmm,
            inner: Mutex::new(VmObjectInner {
                size,
                page_list,
                parent: None,
                parent_offset: 0,
                parent_limit: 0,
                children: 0,
            }),
        });
        log::trace!("vmo {}: created, size {:#x}", obj.id.0, size);
        Ok(obj)
    }

    /// Object ID
    pub fn id(&self) -> VmObjectId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// COW parent, if this object is a clone
    pub fn parent(&self) -> Option<Arc<VmObjectPaged>> {
        self.inner.lock().parent.clone()
    }

    /// Offset of this object within its parent
    pub fn parent_offset(&self) -> u64 {
        self.inner.lock().parent_offset
    }

    /// Pages owned by this object (not counting pages seen via the parent)
    pub fn attributed_pages(&self) -> usize {
        self.inner.lock().page_list.page_count()
    }

    /// Commit pages for every uncommitted offset in `[offset, offset + len)`
    ///
    /// Either every gap is filled or, on `NoMemory`, nothing changes.
    pub fn commit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let end = inner.check_range(offset, len)?;

        let mut gaps = Vec::new();
        inner.page_list.for_every_page_and_gap_in_range(
            |_, _| Ok(Walk::Next),
            |start, end| {
                gaps.push((start, end));
                Ok(Walk::Next)
            },
            offset,
            end,
        )?;
        let needed: u64 = gaps.iter().map(|(s, e)| (e - s) / PAGE_SIZE_U64).sum();
        if needed == 0 {
            return Ok(());
        }

        let mut pages = Vec::new();
        self.pmm.alloc_pages(needed as usize, &mut pages)?;

        // Offsets still backed by the parent get private copies.
        let shared_end = if inner.parent.is_some() {
            inner.parent_limit
        } else {
            0
        };
        let mut shared = 0u64;
        for (start, end) in gaps {
            for page_offset in (start..end).step_by(PAGE_SIZE) {
                let Some(page) = pages.pop() else {
                    break;
                };
                if page_offset < shared_end {
                    shared += 1;
                }
                page.set_state(PageState::Object);
                if let Err((err, page)) = inner.page_list.add_page(page, page_offset) {
                    self.pmm.free_page(page);
                    self.pmm.free_pages(pages);
                    return Err(err);
                }
            }
        }

        vm_counter!(C_PAGES_COMMITTED, needed - shared);
        vm_counter!(C_COW_FAULTS, shared);
        log::trace!(
            "vmo {}: committed {} pages ({} over parent) in [{:#x}, {:#x})",
            self.id.0,
            needed,
            shared,
            offset,
            end
        );
        Ok(())
    }

    /// Release every page in `[offset, offset + len)`
    pub fn decommit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        let mut freed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let end = inner.check_range(offset, len)?;
            if inner.parent.is_some() {
                return Err(VmError::NotSupported);
            }
            inner.check_unpinned(offset, end)?;
            inner.page_list.remove_pages(offset, end, &mut freed);
        }

        vm_counter!(C_PAGES_DECOMMITTED, freed.len());
        log::trace!("vmo {}: decommitted {} pages", self.id.0, freed.len());
        self.pmm.free_pages(freed);
        Ok(())
    }

    /// Report `(offset, paddr)` for committed pages from `offset` onward,
    /// stopping at the first uncommitted offset
    ///
    /// Returns the number of pages reported; anything short of
    /// `len / PAGE_SIZE` means the range is only partly committed.
    pub fn lookup<F>(&self, offset: u64, len: u64, mut f: F) -> VmResult<usize>
    where
        F: FnMut(u64, u64),
    {
        let inner = self.inner.lock();
        let end = inner.check_range(offset, len)?;

        let mut found = 0;
        inner.page_list.for_every_page_and_gap_in_range(
            |page, page_offset| {
                f(page_offset, page.paddr());
                found += 1;
                Ok(Walk::Next)
            },
            |_, _| Ok(Walk::Stop),
            offset,
            end,
        )?;
        Ok(found)
    }

    /// Pin every page in `[offset, offset + len)`
    ///
    /// Fails with `NotFound` without pinning anything if a page is missing.
    pub fn pin(&self, offset: u64, len: u64) -> VmResult<()> {
        let inner = self.inner.lock();
        let end = inner.check_range(offset, len)?;

        inner.page_list.for_every_page_and_gap_in_range(
            |_, _| Ok(Walk::Next),
            |_, _| Err(VmError::NotFound),
            offset,
            end,
        )?;
        inner.page_list.for_every_page_in_range(
            |page, _| {
                page.pin();
                Ok(Walk::Next)
            },
            offset,
            end,
        )?;
        Ok(())
    }

    /// Drop one pin from every page in `[offset, offset + len)`
    pub fn unpin(&self, offset: u64, len: u64) -> VmResult<()> {
        let inner = self.inner.lock();
        let end = inner.check_range(offset, len)?;

        inner.page_list.for_every_page_and_gap_in_range(
            |page, _| {
                if page.is_pinned() {
                    Ok(Walk::Next)
                } else {
                    Err(VmError::BadState)
                }
            },
            |_, _| Err(VmError::BadState),
            offset,
            end,
        )?;
        inner.page_list.for_every_page_in_range(
            |page, _| {
                page.unpin();
                Ok(Walk::Next)
            },
            offset,
            end,
        )?;
        Ok(())
    }

    /// Physical address backing `offset`, looking through COW parents
    pub fn get_page_paddr(&self, offset: u64) -> Option<u64> {
        let (parent, parent_offset) = {
            let inner = self.inner.lock();
            if offset >= inner.size {
                return None;
            }
            if let Some(page) = inner.page_list.get_page(offset) {
                return Some(page.paddr());
            }
            if offset >= inner.parent_limit {
                return None;
            }
            let parent = inner.parent.clone()?;
            (parent, offset + inner.parent_offset)
        };
        parent.get_page_paddr(parent_offset)
    }

    /// Make sure this object owns a private page at `offset`
    ///
    /// Returns the page's physical address.
    pub fn fault_for_write(&self, offset: u64) -> VmResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_range(offset, PAGE_SIZE_U64)?;
        if let Some(page) = inner.page_list.get_page(offset) {
            return Ok(page.paddr());
        }

        let shared = offset < inner.parent_limit && inner.parent.is_some();
        let page = self.pmm.alloc_page()?;
        let paddr = page.paddr();
        page.set_state(PageState::Object);
        if let Err((err, page)) = inner.page_list.add_page(page, offset) {
            self.pmm.free_page(page);
            return Err(err);
        }

        if shared {
            vm_counter!(C_COW_FAULTS);
            log::trace!("vmo {}: cow fault at {:#x}", self.id.0, offset);
        } else {
            vm_counter!(C_PAGES_COMMITTED);
        }
        Ok(paddr)
    }

    /// Move the pages of `[offset, offset + len)` out of this object
    ///
    /// Pages left in the returned list when it is dropped go back to this
    /// object's allocator.
    pub fn take_pages(&self, offset: u64, len: u64) -> VmResult<PageSpliceList> {
        let mut inner = self.inner.lock();
        let end = inner.check_range(offset, len)?;
        if inner.parent.is_some() {
            return Err(VmError::NotSupported);
        }
        inner.check_unpinned(offset, end)?;

        let splice = inner
            .page_list
            .take_pages(offset, len, Arc::clone(&self.pmm))?;

        vm_counter!(C_SPLICE_TAKES);
        log::trace!(
            "vmo {}: took [{:#x}, {:#x}), {} pages",
            self.id.0,
            offset,
            end,
            splice.remaining_pages()
        );
        Ok(splice)
    }

    /// Fill `[offset, offset + len)` from `splice`, in offset order
    ///
    /// Offsets that already hold a page keep it; the supplied page is
    /// freed. Gaps in the splice leave the offset untouched.
    pub fn supply_pages(&self, offset: u64, len: u64, splice: &mut PageSpliceList) -> VmResult<()> {
        let mut discarded = Vec::new();
        let mut supplied = 0u64;
        let result = {
            let mut inner = self.inner.lock();
            let end = inner.check_range(offset, len)?;

            let mut result = Ok(());
            for page_offset in (offset..end).step_by(PAGE_SIZE) {
                if splice.is_done() {
                    break;
                }
                let Some(page) = splice.pop() else {
                    continue;
                };
                page.set_state(PageState::Object);
                match inner.page_list.add_page(page, page_offset) {
                    Ok(()) => supplied += 1,
                    Err((VmError::AlreadyExists, page)) => discarded.push(page),
                    Err((err, page)) => {
                        discarded.push(page);
                        result = Err(err);
                        break;
                    }
                }
            }
            result
        };

        vm_counter!(C_SPLICE_SUPPLIED, supplied);
        vm_counter!(C_SPLICE_DISCARDED, discarded.len());
        self.pmm.free_pages(discarded);
        result
    }

    /// Create a copy-on-write clone of `[offset, offset + size)`
    pub fn create_cow_clone(self: &Arc<Self>, offset: u64, size: u64) -> VmResult<Arc<Self>> {
        if !is_page_aligned(offset) || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        offset.checked_add(size).ok_or(VmError::OutOfRange)?;

        let mut inner = self.inner.lock();
        let mut page_list = PageList::new();
        page_list.initialize_skew(inner.page_list.skew(), offset)?;
        if !size_fits(&page_list, size) {
            return Err(VmError::OutOfRange);
        }

        let parent_limit = size.min(inner.size.saturating_sub(offset));
        let child = Arc::new(Self {
            id: VmObjectId::next(),
            pmm: Arc::clone(&self.pmm),
            inner: Mutex::new(VmObjectInner {
                size,
                page_list,
                parent: Some(Arc::clone(self)),
                parent_offset: offset,
                parent_limit,
                children: 0,
            }),
        });
        inner.children += 1;

        vm_counter!(C_COW_CLONES);
        log::debug!(
            "vmo {}: cow clone {} at {:#x}, size {:#x}",
            self.id.0,
            child.id.0,
            offset,
            size
        );
        Ok(child)
    }

    /// Fold the parent into this clone if nothing else references it
    ///
    /// The parent's pages in the range this clone sees move here unless
    /// this clone already has its own page at that offset; every other
    /// parent page is freed. The clone then hangs off the grandparent.
    /// Returns whether a collapse happened; a pinned parent page that would
    /// be freed leaves the chain as it is.
    pub fn collapse(&self) -> VmResult<bool> {
        let mut freed = Vec::new();
        let parent = {
            let mut inner = self.inner.lock();
            let Some(parent) = inner.parent.take() else {
                return Ok(false);
            };
            if Arc::strong_count(&parent) != 1 {
                inner.parent = Some(parent);
                return Ok(false);
            }

            let mut parent_inner = parent.inner.lock();
            if parent_inner.children != 1 {
                drop(parent_inner);
                inner.parent = Some(parent);
                return Ok(false);
            }

            let start = inner.parent_offset;
            let end = start + inner.parent_limit;
            let pinned = parent_inner.page_list.for_every_page(|page, offset| {
                let shadowed = offset >= start
                    && offset < end
                    && inner.page_list.get_page(offset - start).is_some();
                let released = offset < start || offset >= end || shadowed;
                if released && page.is_pinned() {
                    return Ok(Walk::Stop);
                }
                Ok(Walk::Next)
            })?;
            if pinned == Walk::Stop {
                log::debug!(
                    "vmo {}: parent {} holds pinned pages, not collapsing",
                    self.id.0,
                    parent.id.0
                );
                drop(parent_inner);
                inner.parent = Some(parent);
                return Ok(false);
            }

            let mut source = core::mem::take(&mut parent_inner.page_list);
            let mut kept = 0u64;
            let mut shadowed = 0u64;
            let merged = inner.page_list.merge_from_range(
                &mut source,
                start,
                end,
                0,
                |_, _| shadowed += 1,
                |page, _| {
                    page.set_state(PageState::Object);
                    kept += 1;
                },
                &mut freed,
            );
            if let Err(err) = merged {
                parent_inner.page_list = source;
                drop(parent_inner);
                inner.parent = Some(parent);
                return Err(err);
            }
            source.remove_all_pages(&mut freed);

            // Adopt the grandparent; the parent's slot in its child count
            // passes to this object.
            inner.parent_limit = inner
                .parent_limit
                .min(parent_inner.parent_limit.saturating_sub(inner.parent_offset));
            inner.parent_offset += parent_inner.parent_offset;
            inner.parent = parent_inner.parent.take();
            if inner.parent.is_none() {
                inner.parent_limit = 0;
            }
            parent_inner.children = 0;

            vm_counter!(C_COLLAPSES);
            vm_counter!(C_MERGE_KEPT, kept);
            vm_counter!(C_MERGE_FREED, shadowed);
            log::debug!(
                "vmo {}: collapsed parent {} ({} kept, {} freed)",
                self.id.0,
                parent.id.0,
                kept,
                freed.len()
            );
            drop(parent_inner);
            parent
        };

        drop(parent);
        self.pmm.free_pages(freed);
        Ok(true)
    }

    /// Change the object size, freeing pages past a smaller end
    pub fn resize(&self, new_size: u64) -> VmResult<()> {
        if !is_page_aligned(new_size) {
            return Err(VmError::InvalidArgs);
        }
        let mut freed = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !size_fits(&inner.page_list, new_size) {
                return Err(VmError::OutOfRange);
            }
            if inner.children > 0 {
                return Err(VmError::BadState);
            }
            let old_size = inner.size;
            if new_size < old_size {
                inner.check_unpinned(new_size, old_size)?;
                inner.page_list.remove_pages(new_size, old_size, &mut freed);
                inner.parent_limit = inner.parent_limit.min(new_size);
            }
            inner.size = new_size;
        }

        vm_counter!(C_PAGES_RELEASED, freed.len());
        log::trace!("vmo {}: resized to {:#x}", self.id.0, new_size);
        self.pmm.free_pages(freed);
        Ok(())
    }
}

impl Drop for VmObjectPaged {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut freed: Vec<PageHandle> = Vec::new();
        inner.page_list.remove_all_pages(&mut freed);
        debug_assert!(freed.iter().all(|p| !p.is_pinned()), "destroying pinned pages");

        if let Some(parent) = inner.parent.take() {
            let mut parent_inner = parent.inner.lock();
            parent_inner.children = parent_inner.children.saturating_sub(1);
        }

        vm_counter!(C_PAGES_RELEASED, freed.len());
        log::trace!("vmo {}: destroyed, {} pages freed", self.id.0, freed.len());
        self.pmm.free_pages(freed);
    }
}

impl core::fmt::Debug for VmObjectPaged {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VmObjectPaged")
            .field("id", &self.id)
            .field("size", &format_args!("{:#x}", inner.size))
            .field("pages", &inner.page_list.page_count())
            .field("parent", &inner.parent.as_ref().map(|p| p.id))
            .field("parent_offset", &format_args!("{:#x}", inner.parent_offset))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pmm::PageManager;

    const PAGE: u64 = PAGE_SIZE_U64;

    fn pmm(pages: u32) -> (Arc<PageManager>, Arc<dyn PhysicalAllocator>) {
        let pmm = Arc::new(PageManager::new(0x100_0000, pages));
        let dynamic: Arc<dyn PhysicalAllocator> = pmm.clone();
        (pmm, dynamic)
    }

    #[test]
    fn test_object_creation() {
        let (_, alloc) = pmm(1);
        let obj = VmObjectPaged::create(alloc.clone(), 4 * PAGE).unwrap();
        assert_eq!(obj.size(), 4 * PAGE);
        assert_eq!(obj.attributed_pages(), 0);
        assert!(obj.parent().is_none());

        assert_eq!(
            VmObjectPaged::create(alloc.clone(), 100).unwrap_err(),
            VmError::InvalidArgs
        );
        assert_eq!(
            VmObjectPaged::create(alloc, u64::MAX & !0xfff).unwrap_err(),
            VmError::OutOfRange
        );
    }

    #[test]
    fn test_commit_and_decommit() {
        let (pmm, alloc) = pmm(8);
        let obj = VmObjectPaged::create(alloc, 8 * PAGE).unwrap();

        obj.commit_range(2 * PAGE, 3 * PAGE).unwrap();
        assert_eq!(obj.attributed_pages(), 3);
        // Recommitting only fills the new gap.
        obj.commit_range(0, 4 * PAGE).unwrap();
        assert_eq!(obj.attributed_pages(), 5);
        assert_eq!(pmm.free_count(), 3);

        obj.decommit_range(PAGE, 2 * PAGE).unwrap();
        assert_eq!(obj.attributed_pages(), 3);
        assert_eq!(pmm.free_count(), 5);

        assert_eq!(obj.commit_range(0, 9 * PAGE), Err(VmError::OutOfRange));
        drop(obj);
        assert_eq!(pmm.free_count(), 8);
    }

    #[test]
    fn test_commit_out_of_memory_is_atomic() {
        let (pmm, alloc) = pmm(2);
        let obj = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        assert_eq!(obj.commit_range(0, 4 * PAGE), Err(VmError::NoMemory));
        assert_eq!(obj.attributed_pages(), 0);
        assert_eq!(pmm.free_count(), 2);
    }

    #[test]
    fn test_lookup_counts_until_gap() {
        let (_, alloc) = pmm(4);
        let obj = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        obj.commit_range(0, 2 * PAGE).unwrap();

        let mut seen = Vec::new();
        let found = obj.lookup(0, 4 * PAGE, |offset, _| seen.push(offset)).unwrap();
        assert_eq!(found, 2);
        assert_eq!(seen, [0, PAGE]);

        assert_eq!(obj.lookup(2 * PAGE, 2 * PAGE, |_, _| {}).unwrap(), 0);
        assert_eq!(obj.lookup(0, PAGE, |_, _| {}).unwrap(), 1);
    }

    #[test]
    fn test_pin_blocks_decommit() {
        let (_, alloc) = pmm(4);
        let obj = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        obj.commit_range(0, 2 * PAGE).unwrap();

        assert_eq!(obj.pin(0, 3 * PAGE), Err(VmError::NotFound));
        obj.pin(0, 2 * PAGE).unwrap();
        assert_eq!(obj.decommit_range(0, PAGE), Err(VmError::BadState));
        assert_eq!(obj.take_pages(0, PAGE).unwrap_err(), VmError::BadState);
        assert_eq!(obj.resize(0), Err(VmError::BadState));

        obj.unpin(0, 2 * PAGE).unwrap();
        assert_eq!(obj.unpin(0, PAGE), Err(VmError::BadState));
        obj.decommit_range(0, PAGE).unwrap();
        assert_eq!(obj.attributed_pages(), 1);
    }

    #[test]
    fn test_take_and_supply() {
        let (pmm, alloc) = pmm(6);
        let src = VmObjectPaged::create(alloc.clone(), 4 * PAGE).unwrap();
        let dst = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        src.commit_range(0, PAGE).unwrap();
        src.commit_range(2 * PAGE, 2 * PAGE).unwrap();
        dst.commit_range(3 * PAGE, PAGE).unwrap();
        let src_paddr = src.get_page_paddr(0).unwrap();
        let dst_paddr = dst.get_page_paddr(3 * PAGE).unwrap();

        let mut splice = src.take_pages(0, 4 * PAGE).unwrap();
        assert_eq!(src.attributed_pages(), 0);

        dst.supply_pages(0, 4 * PAGE, &mut splice).unwrap();
        assert!(splice.is_done());
        assert_eq!(dst.get_page_paddr(0), Some(src_paddr));
        assert_eq!(dst.get_page_paddr(PAGE), None);
        // Already-populated offset kept its own page.
        assert_eq!(dst.get_page_paddr(3 * PAGE), Some(dst_paddr));
        assert_eq!(dst.attributed_pages(), 3);
        assert_eq!(pmm.free_count(), 3);
    }

    #[test]
    fn test_dropped_splice_frees_pages() {
        let (pmm, alloc) = pmm(4);
        let obj = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        obj.commit_range(0, 4 * PAGE).unwrap();

        let splice = obj.take_pages(PAGE, 2 * PAGE).unwrap();
        assert_eq!(pmm.free_count(), 0);
        drop(splice);
        assert_eq!(pmm.free_count(), 2);
        assert_eq!(obj.attributed_pages(), 2);
    }

    #[test]
    fn test_cow_clone_reads_through() {
        let (pmm, alloc) = pmm(8);
        let parent = VmObjectPaged::create(alloc, 8 * PAGE).unwrap();
        parent.commit_range(0, 8 * PAGE).unwrap();

        let child = parent.create_cow_clone(3 * PAGE, 4 * PAGE).unwrap();
        assert_eq!(child.parent().map(|p| p.id()), Some(parent.id()));
        assert_eq!(child.get_page_paddr(0), parent.get_page_paddr(3 * PAGE));
        assert_eq!(child.attributed_pages(), 0);
        assert_eq!(child.get_page_paddr(4 * PAGE), None);

        // Parent has clones, so it cannot be resized.
        assert_eq!(parent.resize(PAGE), Err(VmError::BadState));
        assert_eq!(child.take_pages(0, PAGE).unwrap_err(), VmError::NotSupported);

        assert_eq!(pmm.free_count(), 0);
        assert_eq!(child.fault_for_write(0), Err(VmError::NoMemory));
    }

    #[test]
    fn test_cow_fault_gives_private_page() {
        let (_, alloc) = pmm(4);
        let parent = VmObjectPaged::create(alloc, 2 * PAGE).unwrap();
        parent.commit_range(0, 2 * PAGE).unwrap();
        let child = parent.create_cow_clone(0, 2 * PAGE).unwrap();

        let shared = parent.get_page_paddr(PAGE).unwrap();
        let private = child.fault_for_write(PAGE).unwrap();
        assert_ne!(shared, private);
        assert_eq!(child.get_page_paddr(PAGE), Some(private));
        assert_eq!(parent.get_page_paddr(PAGE), Some(shared));
        assert_eq!(child.fault_for_write(PAGE), Ok(private));
        assert_eq!(child.attributed_pages(), 1);
    }

    #[test]
    fn test_collapse_merges_parent() {
        let (pmm, alloc) = pmm(16);
        let parent = VmObjectPaged::create(alloc, 8 * PAGE).unwrap();
        parent.commit_range(0, 8 * PAGE).unwrap();
        let child = parent.create_cow_clone(2 * PAGE, 4 * PAGE).unwrap();
        let private = child.fault_for_write(PAGE).unwrap();
        let inherited = parent.get_page_paddr(2 * PAGE).unwrap();

        // The parent handle is still held elsewhere.
        assert_eq!(child.collapse(), Ok(false));

        drop(parent);
        assert_eq!(child.collapse(), Ok(true));
        assert!(child.parent().is_none());
        assert_eq!(child.attributed_pages(), 4);
        assert_eq!(child.get_page_paddr(0), Some(inherited));
        assert_eq!(child.get_page_paddr(PAGE), Some(private));
        // Child kept 4 pages; the shadowed parent page and the 4 outside
        // the clone window went back.
        assert_eq!(pmm.free_count(), 12);

        assert_eq!(child.collapse(), Ok(false));
        drop(child);
        assert_eq!(pmm.free_count(), 16);
    }

    #[test]
    fn test_collapse_adopts_grandparent() {
        let (pmm, alloc) = pmm(8);
        let root = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        root.commit_range(0, 4 * PAGE).unwrap();
        let middle = root.create_cow_clone(PAGE, 3 * PAGE).unwrap();
        middle.fault_for_write(0).unwrap();
        let leaf = middle.create_cow_clone(PAGE, 2 * PAGE).unwrap();

        drop(middle);
        assert_eq!(leaf.collapse(), Ok(true));
        assert_eq!(leaf.parent().map(|p| p.id()), Some(root.id()));
        assert_eq!(leaf.parent_offset(), 2 * PAGE);
        assert_eq!(leaf.get_page_paddr(0), root.get_page_paddr(2 * PAGE));
        // Middle's private page at its offset 0 was outside the leaf window.
        assert_eq!(leaf.attributed_pages(), 0);
        assert_eq!(pmm.free_count(), 4);
    }

    #[test]
    fn test_collapse_keeps_pinned_parent() {
        let (pmm, alloc) = pmm(8);
        let parent = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        parent.commit_range(0, 4 * PAGE).unwrap();
        // Outside the clone window.
        parent.pin(3 * PAGE, PAGE).unwrap();
        let child = parent.create_cow_clone(0, 2 * PAGE).unwrap();
        let pinned = parent.get_page_paddr(3 * PAGE).unwrap();

        drop(parent);
        assert_eq!(child.collapse(), Ok(false));
        assert!(child.parent().is_some());
        assert_eq!(child.attributed_pages(), 0);
        assert_eq!(pmm.free_count(), 4);

        let parent = child.parent().unwrap();
        assert_eq!(parent.get_page_paddr(3 * PAGE), Some(pinned));
        parent.unpin(3 * PAGE, PAGE).unwrap();

        // Shadowed by the child's private page.
        parent.pin(0, PAGE).unwrap();
        child.fault_for_write(0).unwrap();
        drop(parent);
        assert_eq!(child.collapse(), Ok(false));
        assert_eq!(pmm.free_count(), 3);

        let parent = child.parent().unwrap();
        parent.unpin(0, PAGE).unwrap();
        drop(parent);
        assert_eq!(child.collapse(), Ok(true));
        assert!(child.parent().is_none());
        assert_eq!(child.attributed_pages(), 2);
        assert_eq!(pmm.free_count(), 6);
    }

    #[test]
    fn test_clone_commit_counts_cow_faults() {
        let (_, alloc) = pmm(8);
        let parent = VmObjectPaged::create(alloc, 2 * PAGE).unwrap();
        parent.commit_range(0, 2 * PAGE).unwrap();
        let child = parent.create_cow_clone(PAGE, 3 * PAGE).unwrap();

        let before = crate::vm::counters::snapshot();
        child.commit_range(0, 3 * PAGE).unwrap();
        let after = crate::vm::counters::snapshot();

        assert_eq!(child.attributed_pages(), 3);
        assert_ne!(child.get_page_paddr(0), parent.get_page_paddr(PAGE));
        if crate::vm::counters::VM_COUNTERS_ENABLED {
            // Offset 0 was backed by the parent; the other two were not.
            assert!(after.cow_faults >= before.cow_faults + 1);
            assert!(after.pages_committed >= before.pages_committed + 2);
        }
    }

    #[test]
    fn test_resize_frees_tail() {
        let (pmm, alloc) = pmm(4);
        let obj = VmObjectPaged::create(alloc, 4 * PAGE).unwrap();
        obj.commit_range(0, 4 * PAGE).unwrap();
        obj.resize(PAGE).unwrap();
        assert_eq!(obj.size(), PAGE);
        assert_eq!(obj.attributed_pages(), 1);
        assert_eq!(pmm.free_count(), 3);
        obj.resize(8 * PAGE).unwrap();
        assert_eq!(obj.get_page_paddr(4 * PAGE), None);
    }
}
