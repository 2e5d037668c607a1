//! Node addressing for page lists
//!
//! A page list keys its nodes by the node's base offset in *skewed* space,
//! that is `offset + skew`. `NodeAddress` does that translation with every
//! step overflow-checked so an unrepresentable offset is rejected instead
//! of wrapping into an unrelated node.

use crate::vm::vm_page::{PAGE_SHIFT, PAGE_SIZE_U64};

/// Number of page slots per node
pub const FAN_OUT: usize = 16;

/// Bytes of object offset covered by one node
pub const NODE_SPAN: u64 = FAN_OUT as u64 * PAGE_SIZE_U64;

const _: () = assert!(FAN_OUT.is_power_of_two());

/// Location of one page slot: which node, and which slot inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeAddress {
    /// Skewed base offset of the node, a multiple of `NODE_SPAN`
    key: u64,
    /// Slot within the node
    index: usize,
}

impl NodeAddress {
    /// Locate `offset` in a list with the given `skew`
    ///
    /// Returns `None` if the offset is not page aligned, if adding the skew
    /// overflows, or if the covering node's end is not representable.
    pub fn from_offset(offset: u64, skew: u64) -> Option<Self> {
        if offset & (PAGE_SIZE_U64 - 1) != 0 {
            return None;
        }
        Self::from_skewed(offset.checked_add(skew)?)
    }

    /// Locate an already-skewed, page aligned offset
    pub fn from_skewed(skewed: u64) -> Option<Self> {
        let key = skewed & !(NODE_SPAN - 1);
        key.checked_add(NODE_SPAN)?;
        Some(Self {
            key,
            index: ((skewed - key) >> PAGE_SHIFT) as usize,
        })
    }

    /// Build from a node key and slot index
    pub fn new(key: u64, index: usize) -> Self {
        debug_assert_eq!(key & (NODE_SPAN - 1), 0);
        debug_assert!(index < FAN_OUT);
        Self { key, index }
    }

    /// Node key (skewed base offset)
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Slot index within the node
    pub fn index(&self) -> usize {
        self.index
    }

    /// Skewed offset of this slot
    pub fn skewed_offset(&self) -> u64 {
        self.key + ((self.index as u64) << PAGE_SHIFT)
    }

    /// Object offset of this slot, `None` for the slots that sit before
    /// offset zero in the first node of a skewed list
    pub fn to_offset(&self, skew: u64) -> Option<u64> {
        self.skewed_offset().checked_sub(skew)
    }
}

/// Largest offset `NodeAddress::from_offset` accepts for `skew`
pub fn max_offset(skew: u64) -> u64 {
    // The last node whose end is representable starts at
    // `(u64::MAX - NODE_SPAN + 1)` rounded down to a node boundary.
    let last_key = (u64::MAX - NODE_SPAN) & !(NODE_SPAN - 1);
    last_key + NODE_SPAN - PAGE_SIZE_U64 - skew
}
