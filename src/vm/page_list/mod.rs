//! Page List - Sparse offset to page map for VM objects
//!
//! A `PageList` records which physical page backs each page-sized offset
//! of a VM object. Pages are grouped into `PageListNode`s of `FAN_OUT`
//! slots, and nodes live in an ordered map keyed by their base offset.
//!
//! The base offset is taken in *skewed* space (`offset + skew`). COW clones
//! derive their skew from the parent's skew plus the clone offset, so a
//! child's node boundaries fall on the parent's node boundaries and whole
//! nodes can move between the two lists when a clone chain collapses.
//!
//! The list does no locking and no allocation of pages. It stores handles
//! it is given and hands every removed handle back to the caller.

pub mod address;
pub mod node;
pub mod splice;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::vm::error::{VmError, VmResult};
use crate::vm::pmm::PhysicalAllocator;
use crate::vm::vm_page::{is_page_aligned, PageHandle, PAGE_SIZE_U64};

pub use address::{NodeAddress, FAN_OUT, NODE_SPAN};
pub use node::PageListNode;
pub use splice::PageSpliceList;

/// Visitor verdict for page list walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Keep walking
    Next,
    /// Stop here; the walk returns `Walk::Stop`
    Stop,
}

/// Sparse map from object offset to page handle
#[derive(Debug, Default)]
pub struct PageList {
    nodes: BTreeMap<u64, PageListNode>,
    skew: u64,
    skew_initialized: bool,
    /// Number of occupied slots across all nodes
    page_count: usize,
}

impl PageList {
    /// Create an empty, unskewed list
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the skew of a list that belongs to a clone at `offset` in a
    /// parent whose list has skew `parent_skew`
    ///
    /// Must be called at most once, before the first page is added.
    pub fn initialize_skew(&mut self, parent_skew: u64, offset: u64) -> VmResult<()> {
        if self.skew_initialized || !self.nodes.is_empty() {
            return Err(VmError::BadState);
        }
        if !is_page_aligned(parent_skew) || !is_page_aligned(offset) || parent_skew >= NODE_SPAN
        {
            return Err(VmError::InvalidArgs);
        }
        self.skew = (parent_skew + offset % NODE_SPAN) % NODE_SPAN;
        self.skew_initialized = true;
        Ok(())
    }

    /// Skew of this list, in `[0, NODE_SPAN)`
    pub fn skew(&self) -> u64 {
        self.skew
    }

    /// Largest offset `add_page` accepts
    pub fn max_offset(&self) -> u64 {
        address::max_offset(self.skew)
    }

    /// Locate `offset`, distinguishing unaligned from unrepresentable
    fn address(&self, offset: u64) -> VmResult<NodeAddress> {
        if !is_page_aligned(offset) {
            return Err(VmError::InvalidArgs);
        }
        NodeAddress::from_offset(offset, self.skew).ok_or(VmError::OutOfRange)
    }

    /// Insert `page` at `offset`
    ///
    /// On error the list is unchanged and the page is handed back.
    pub fn add_page(&mut self, page: PageHandle, offset: u64) -> Result<(), (VmError, PageHandle)> {
        let addr = match self.address(offset) {
            Ok(addr) => addr,
            Err(err) => return Err((err, page)),
        };
        let node = self.nodes.entry(addr.key()).or_default();
        if let Err(page) = node.set(addr.index(), page) {
            return Err((VmError::AlreadyExists, page));
        }
        self.page_count += 1;
        Ok(())
    }

    /// Page at `offset`, if any
    pub fn get_page(&self, offset: u64) -> Option<&PageHandle> {
        let addr = NodeAddress::from_offset(offset, self.skew)?;
        self.nodes.get(&addr.key())?.get(addr.index())
    }

    /// Remove and return the page at `offset`
    pub fn remove_page(&mut self, offset: u64) -> Option<PageHandle> {
        let addr = NodeAddress::from_offset(offset, self.skew)?;
        let node = self.nodes.get_mut(&addr.key())?;
        let page = node.take(addr.index())?;
        if node.is_empty() {
            self.nodes.remove(&addr.key());
        }
        self.page_count -= 1;
        Some(page)
    }

    /// Skewed bounds of `[start, end)`, or `None` if nothing in the range
    /// can hold a page
    fn skewed_range(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        if start >= end {
            return None;
        }
        let start_s = start.checked_add(self.skew)?;
        Some((start_s, end.saturating_add(self.skew)))
    }

    /// Keys of the nodes overlapping skewed `[start_s, end_s)`
    fn node_keys(&self, start_s: u64, end_s: u64) -> Vec<u64> {
        let first_key = start_s & !(NODE_SPAN - 1);
        self.nodes.range(first_key..end_s).map(|(&k, _)| k).collect()
    }

    /// Remove every page in `[start, end)` into `free_list`
    ///
    /// Slots of partially covered nodes outside the range are kept.
    pub fn remove_pages(&mut self, start: u64, end: u64, free_list: &mut Vec<PageHandle>) {
        debug_assert!(is_page_aligned(start) && is_page_aligned(end));
        let Some((start_s, end_s)) = self.skewed_range(start, end) else {
            return;
        };

        for key in self.node_keys(start_s, end_s) {
            let Some(node) = self.nodes.get_mut(&key) else {
                continue;
            };
            for index in 0..FAN_OUT {
                let skewed = NodeAddress::new(key, index).skewed_offset();
                if skewed < start_s || skewed >= end_s {
                    continue;
                }
                if let Some(page) = node.take(index) {
                    free_list.push(page);
                    self.page_count -= 1;
                }
            }
            if node.is_empty() {
                self.nodes.remove(&key);
            }
        }
    }

    /// Remove every page in the list into `free_list`
    pub fn remove_all_pages(&mut self, free_list: &mut Vec<PageHandle>) {
        free_list.reserve(self.page_count);
        for node in self.nodes.values_mut() {
            node.drain_into(free_list);
        }
        self.nodes.clear();
        self.page_count = 0;
    }

    /// True if the list holds no pages
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of pages held
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Number of allocated nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Visit present pages in `[start, end)` in offset order
    fn visit_pages<F>(&self, start: u64, end: u64, mut visit: F) -> VmResult<Walk>
    where
        F: FnMut(&PageHandle, u64) -> VmResult<Walk>,
    {
        let Some((start_s, _)) = self.skewed_range(start, end) else {
            return Ok(Walk::Next);
        };
        let first_key = start_s & !(NODE_SPAN - 1);

        for (&key, node) in self.nodes.range(first_key..) {
            for (index, page) in node.iter() {
                let Some(offset) = NodeAddress::new(key, index).to_offset(self.skew) else {
                    continue;
                };
                if offset < start {
                    continue;
                }
                if offset >= end {
                    return Ok(Walk::Next);
                }
                if visit(page, offset)? == Walk::Stop {
                    return Ok(Walk::Stop);
                }
            }
        }
        Ok(Walk::Next)
    }

    /// Call `visit` for every page in offset order
    pub fn for_every_page<F>(&self, visit: F) -> VmResult<Walk>
    where
        F: FnMut(&PageHandle, u64) -> VmResult<Walk>,
    {
        self.visit_pages(0, u64::MAX, visit)
    }

    /// Call `visit` for every page in `[start, end)` in offset order
    pub fn for_every_page_in_range<F>(&self, visit: F, start: u64, end: u64) -> VmResult<Walk>
    where
        F: FnMut(&PageHandle, u64) -> VmResult<Walk>,
    {
        self.visit_pages(start, end, visit)
    }

    /// Walk `[start, end)` in offset order, calling `per_page` for each
    /// present page and `per_gap` once for each maximal run of absent
    /// offsets
    ///
    /// Every offset in the range is covered by exactly one call.
    pub fn for_every_page_and_gap_in_range<P, G>(
        &self,
        mut per_page: P,
        mut per_gap: G,
        start: u64,
        end: u64,
    ) -> VmResult<Walk>
    where
        P: FnMut(&PageHandle, u64) -> VmResult<Walk>,
        G: FnMut(u64, u64) -> VmResult<Walk>,
    {
        let mut expected = start;
        let walk = self.visit_pages(start, end, |page, offset| {
            if offset > expected && per_gap(expected, offset)? == Walk::Stop {
                return Ok(Walk::Stop);
            }
            expected = offset + PAGE_SIZE_U64;
            per_page(page, offset)
        })?;
        if walk == Walk::Stop {
            return Ok(Walk::Stop);
        }
        if expected < end {
            return per_gap(expected, end);
        }
        Ok(Walk::Next)
    }

    /// Lift `[start, start + length)` out of the list
    ///
    /// Nodes entirely inside the range move to the splice list as-is;
    /// partially covered nodes give up only their in-range slots. Pages
    /// still in the splice list when it is dropped go to `free_target`.
    pub fn take_pages(
        &mut self,
        start: u64,
        length: u64,
        free_target: Arc<dyn PhysicalAllocator>,
    ) -> VmResult<PageSpliceList> {
        if !is_page_aligned(start) || !is_page_aligned(length) {
            return Err(VmError::InvalidArgs);
        }
        let end = start.checked_add(length).ok_or(VmError::OutOfRange)?;

        let mut taken = BTreeMap::new();
        if let Some((start_s, end_s)) = self.skewed_range(start, end) {
            for key in self.node_keys(start_s, end_s) {
                let whole = key >= start_s && end_s - key >= NODE_SPAN;
                if whole {
                    if let Some(node) = self.nodes.remove(&key) {
                        self.page_count -= node.len();
                        taken.insert(key, node);
                    }
                    continue;
                }

                let Some(node) = self.nodes.get_mut(&key) else {
                    continue;
                };
                let mut lifted = PageListNode::new();
                for index in 0..FAN_OUT {
                    let skewed = NodeAddress::new(key, index).skewed_offset();
                    if skewed < start_s || skewed >= end_s {
                        continue;
                    }
                    if let Some(page) = node.take(index) {
                        // Fresh node, slot is free.
                        let _ = lifted.set(index, page);
                        self.page_count -= 1;
                    }
                }
                if node.is_empty() {
                    self.nodes.remove(&key);
                }
                if !lifted.is_empty() {
                    taken.insert(key, lifted);
                }
            }
        }

        Ok(PageSpliceList::new(start, length, self.skew, taken, free_target))
    }

    /// Merge `source`'s pages in `[start, end)` into this list at the same
    /// offsets
    ///
    /// See `merge_from_range`.
    pub fn merge_from<F, K>(
        &mut self,
        source: &mut PageList,
        start: u64,
        end: u64,
        on_freed: F,
        on_kept: K,
        free_list: &mut Vec<PageHandle>,
    ) -> VmResult<()>
    where
        F: FnMut(&PageHandle, u64),
        K: FnMut(&PageHandle, u64),
    {
        self.merge_from_range(source, start, end, start, on_freed, on_kept, free_list)
    }

    /// Merge `source`'s pages in `[source_start, source_end)` into this
    /// list, source offset `o` landing at `o - source_start + dest_start`
    ///
    /// Where this list already has a page the source page is shadowed: it
    /// is reported to `on_freed` and appended to `free_list`. Otherwise the
    /// source page moves here and is reported to `on_kept`. Both callbacks
    /// receive the destination offset. Source pages outside the range stay
    /// where they are.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_from_range<F, K>(
        &mut self,
        source: &mut PageList,
        source_start: u64,
        source_end: u64,
        dest_start: u64,
        mut on_freed: F,
        mut on_kept: K,
        free_list: &mut Vec<PageHandle>,
    ) -> VmResult<()>
    where
        F: FnMut(&PageHandle, u64),
        K: FnMut(&PageHandle, u64),
    {
        if !is_page_aligned(source_start)
            || !is_page_aligned(source_end)
            || !is_page_aligned(dest_start)
        {
            return Err(VmError::InvalidArgs);
        }
        let Some((start_s, end_s)) = source.skewed_range(source_start, source_end) else {
            return Ok(());
        };
        let dest_end = dest_start
            .checked_add(source_end - source_start)
            .ok_or(VmError::OutOfRange)?;
        self.address(dest_end - PAGE_SIZE_U64)?;

        // Node boundaries line up when both ranges start at the same
        // position within a node.
        let source_phase = (source_start % NODE_SPAN + source.skew) % NODE_SPAN;
        let dest_phase = (dest_start % NODE_SPAN + self.skew) % NODE_SPAN;
        let aligned = source_phase == dest_phase;

        for key in source.node_keys(start_s, end_s) {
            let Some(mut node) = source.nodes.remove(&key) else {
                continue;
            };
            let node_pages = node.len();

            let whole = key >= start_s && end_s - key >= NODE_SPAN;
            if aligned && whole {
                let dest_offset = key - source.skew - source_start + dest_start;
                if let Ok(dest) = self.address(dest_offset) {
                    debug_assert_eq!(dest.index(), 0);
                    if !self.nodes.contains_key(&dest.key()) {
                        for (index, page) in node.iter() {
                            on_kept(page, dest_offset + NodeAddress::new(0, index).skewed_offset());
                        }
                        source.page_count -= node_pages;
                        self.page_count += node_pages;
                        self.nodes.insert(dest.key(), node);
                        continue;
                    }
                }
            }

            for index in 0..FAN_OUT {
                let addr = NodeAddress::new(key, index);
                let skewed = addr.skewed_offset();
                if skewed < start_s || skewed >= end_s {
                    continue;
                }
                let Some(page) = node.take(index) else {
                    continue;
                };
                source.page_count -= 1;

                let dest_offset = skewed - source.skew - source_start + dest_start;
                if self.get_page(dest_offset).is_some() {
                    on_freed(&page, dest_offset);
                    free_list.push(page);
                    continue;
                }
                on_kept(&page, dest_offset);
                if let Err((err, page)) = self.add_page(page, dest_offset) {
                    debug_assert!(false, "merge add at {:#x} failed: {:?}", dest_offset, err);
                    free_list.push(page);
                }
            }

            if !node.is_empty() {
                source.nodes.insert(key, node);
            }
        }
        Ok(())
    }
}

impl Drop for PageList {
    fn drop(&mut self) {
        if self.page_count != 0 {
            log::error!("page list dropped holding {} pages", self.page_count);
            debug_assert!(false, "page list dropped while holding pages");
        }
    }
}
