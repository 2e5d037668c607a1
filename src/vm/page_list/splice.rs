//! Splice lists: page ranges lifted out of a page list
//!
//! `PageList::take_pages` moves whole nodes into the splice list where it
//! can, so taking a large range costs one map operation per node rather
//! than one per page. Consumers drain it in offset order with `pop`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use super::address::NodeAddress;
use super::node::PageListNode;
use crate::vm::pmm::PhysicalAllocator;
use crate::vm::vm_page::{PageHandle, PAGE_SIZE_U64};

/// Move-only, single-pass sequence of the slots taken from a page list
pub struct PageSpliceList {
    /// Object offset of the first slot
    offset: u64,
    /// Length of the taken range in bytes
    length: u64,
    /// Bytes already popped
    pos: u64,
    /// Skew of the list the nodes were taken from
    skew: u64,
    nodes: BTreeMap<u64, PageListNode>,
    /// Allocator that receives pages still held when the list is dropped
    free_target: Arc<dyn PhysicalAllocator>,
}

impl PageSpliceList {
    pub(super) fn new(
        offset: u64,
        length: u64,
        skew: u64,
        nodes: BTreeMap<u64, PageListNode>,
        free_target: Arc<dyn PhysicalAllocator>,
    ) -> Self {
        Self {
            offset,
            length,
            pos: 0,
            skew,
            nodes,
            free_target,
        }
    }

    /// Pop the next slot; `None` for a gap or once the list is done
    pub fn pop(&mut self) -> Option<PageHandle> {
        if self.is_done() {
            return None;
        }
        let offset = self.offset + self.pos;
        self.pos += PAGE_SIZE_U64;

        let addr = NodeAddress::from_offset(offset, self.skew)?;
        let node = self.nodes.get_mut(&addr.key())?;
        let page = node.take(addr.index());
        if node.is_empty() {
            self.nodes.remove(&addr.key());
        }
        page
    }

    /// True once every slot has been popped
    pub fn is_done(&self) -> bool {
        self.pos >= self.length
    }

    /// Object offset of the next slot `pop` will return
    pub fn position(&self) -> u64 {
        self.offset + self.pos
    }

    /// Total number of slots, popped or not
    pub fn len_pages(&self) -> u64 {
        self.length / PAGE_SIZE_U64
    }

    /// Number of pages not yet popped
    pub fn remaining_pages(&self) -> usize {
        self.nodes.values().map(PageListNode::len).sum()
    }

    /// Move every unpopped page into `free_list`, in offset order, and
    /// mark the list done
    pub fn free_remaining(&mut self, free_list: &mut Vec<PageHandle>) {
        for node in self.nodes.values_mut() {
            node.drain_into(free_list);
        }
        self.nodes.clear();
        self.pos = self.length;
    }
}

impl Iterator for PageSpliceList {
    type Item = Option<PageHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done() {
            None
        } else {
            Some(self.pop())
        }
    }
}

impl fmt::Debug for PageSpliceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSpliceList")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("length", &format_args!("{:#x}", self.length))
            .field("pos", &format_args!("{:#x}", self.pos))
            .field("remaining_pages", &self.remaining_pages())
            .finish()
    }
}

impl Drop for PageSpliceList {
    fn drop(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let mut pages = Vec::new();
        self.free_remaining(&mut pages);
        if !pages.is_empty() {
            log::trace!("splice: freeing {} unpopped pages", pages.len());
            self.free_target.free_pages(pages);
        }
    }
}
