//! Paged Virtual Memory Objects
//!
//! Provides the page bookkeeping beneath VM objects:
//! - vm_page: physical page descriptors and move-only page handles
//! - pmm: physical page allocator interface and arena implementation
//! - page_list: sparse offset to page map, splice lists, merging
//! - vm_object: paged objects with COW clones and collapse
//! - counters: event counters for page traffic
//! - error: status codes shared by all of the above

pub mod counters;
pub mod error;
pub mod page_list;
pub mod pmm;
pub mod vm_object;
pub mod vm_page;

pub use error::{VmError, VmResult};
pub use page_list::{NodeAddress, PageList, PageListNode, PageSpliceList, Walk, FAN_OUT, NODE_SPAN};
pub use pmm::{PageManager, PageStats, PhysicalAllocator};
pub use vm_object::{VmObjectId, VmObjectPaged};
pub use vm_page::{PageHandle, PageState, VmPage, PAGE_SIZE, PAGE_SIZE_U64};
