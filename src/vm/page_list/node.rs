//! Page list node: `FAN_OUT` consecutive page slots

use core::array;

use super::address::FAN_OUT;
use crate::vm::vm_page::PageHandle;

/// Fixed-size run of page slots covering one `NODE_SPAN`
#[derive(Debug)]
pub struct PageListNode {
    pages: [Option<PageHandle>; FAN_OUT],
}

impl PageListNode {
    /// Create an empty node
    pub fn new() -> Self {
        Self {
            pages: array::from_fn(|_| None),
        }
    }

    /// Page in slot `index`
    pub fn get(&self, index: usize) -> Option<&PageHandle> {
        self.pages[index].as_ref()
    }

    /// Store `page` in an empty slot
    ///
    /// An occupied slot is left untouched and `page` is handed back.
    pub fn set(&mut self, index: usize, page: PageHandle) -> Result<(), PageHandle> {
        let slot = &mut self.pages[index];
        if slot.is_some() {
            return Err(page);
        }
        *slot = Some(page);
        Ok(())
    }

    /// Clear slot `index`, returning what it held
    pub fn take(&mut self, index: usize) -> Option<PageHandle> {
        self.pages[index].take()
    }

    /// True if every slot is empty
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(Option::is_none)
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    /// Occupied slots with their indices, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageHandle)> {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (i, p)))
    }

    /// Drain every occupied slot into `out`, in slot order
    pub fn drain_into(&mut self, out: &mut alloc::vec::Vec<PageHandle>) {
        out.extend(self.pages.iter_mut().filter_map(Option::take));
    }
}

impl Default for PageListNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pmm::{PageManager, PhysicalAllocator};
    use alloc::vec::Vec;

    #[test]
    fn test_node_set_take() {
        let pmm = PageManager::new(0, 2);
        let mut node = PageListNode::new();
        assert!(node.is_empty());

        let page = pmm.alloc_page().unwrap();
        let paddr = page.paddr();
        node.set(3, page).unwrap();
        assert!(!node.is_empty());
        assert_eq!(node.len(), 1);
        assert_eq!(node.get(3).map(|p| p.paddr()), Some(paddr));
        assert!(node.get(4).is_none());

        // Occupied slot hands the new page back.
        let other = pmm.alloc_page().unwrap();
        let other = node.set(3, other).unwrap_err();
        pmm.free_page(other);

        let page = node.take(3).unwrap();
        assert!(node.is_empty());
        pmm.free_page(page);
    }

    #[test]
    fn test_node_drain() {
        let pmm = PageManager::new(0, FAN_OUT as u32);
        let mut node = PageListNode::new();
        for i in (0..FAN_OUT).step_by(2) {
            node.set(i, pmm.alloc_page().unwrap()).unwrap();
        }
        assert_eq!(node.iter().map(|(i, _)| i).collect::<Vec<_>>(), [0, 2, 4, 6, 8, 10, 12, 14]);

        let mut out = Vec::new();
        node.drain_into(&mut out);
        assert_eq!(out.len(), FAN_OUT / 2);
        assert!(node.is_empty());
        pmm.free_pages(out);
    }

    #[test]
    #[should_panic]
    fn test_node_index_out_of_range() {
        let node = PageListNode::new();
        let _ = node.get(FAN_OUT);
    }
}
