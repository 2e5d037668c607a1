//! End-to-end tests for paged VM objects
//!
//! Drives a clone chain through faults, page moves and a collapse, and
//! checks page accounting, counters and the kernel log along the way.

use std::sync::Arc;

use log::LevelFilter;
use vmo_pages::klog;
use vmo_pages::vm::counters;
use vmo_pages::vm::{PageManager, PhysicalAllocator, VmObjectPaged, PAGE_SIZE_U64};

const PAGE: u64 = PAGE_SIZE_U64;

#[test]
fn clone_chain_lifecycle() {
    klog::init(LevelFilter::Trace).unwrap();
    let before = counters::snapshot();

    let pmm = Arc::new(PageManager::new(0x8000_0000, 64));
    let alloc: Arc<dyn PhysicalAllocator> = pmm.clone();

    // A 20 page object straddles a node boundary.
    let root = VmObjectPaged::create(alloc.clone(), 20 * PAGE).unwrap();
    root.commit_range(0, 20 * PAGE).unwrap();
    assert_eq!(pmm.free_count(), 44);

    let clone = root.create_cow_clone(5 * PAGE, 12 * PAGE).unwrap();
    for offset in [0, 7 * PAGE, 11 * PAGE] {
        let shared = clone.get_page_paddr(offset).unwrap();
        let private = clone.fault_for_write(offset).unwrap();
        assert_ne!(shared, private);
    }
    assert_eq!(clone.attributed_pages(), 3);

    // Move two pages of an unrelated object into the clone's gaps.
    let donor = VmObjectPaged::create(alloc, 2 * PAGE).unwrap();
    donor.commit_range(0, 2 * PAGE).unwrap();
    let donated = donor.get_page_paddr(0).unwrap();
    let mut splice = donor.take_pages(0, 2 * PAGE).unwrap();
    clone.supply_pages(PAGE, 2 * PAGE, &mut splice).unwrap();
    drop(splice);
    assert_eq!(clone.get_page_paddr(PAGE), Some(donated));
    assert_eq!(clone.attributed_pages(), 5);

    let root_id = root.id();
    drop(root);
    assert!(clone.collapse().unwrap());
    assert!(clone.parent().is_none());
    assert_eq!(clone.attributed_pages(), 12);
    let mut seen = 0;
    let found = clone
        .lookup(0, 12 * PAGE, |offset, _| {
            assert_eq!(offset, seen * PAGE);
            seen += 1;
        })
        .unwrap();
    assert_eq!(found, 12);

    // 12 pages in the clone, 8 root pages outside its window and 5
    // shadowed root pages went back.
    assert_eq!(pmm.free_count(), 52);
    drop(donor);
    drop(clone);
    assert_eq!(pmm.free_count(), 64);

    let after = counters::snapshot();
    if counters::VM_COUNTERS_ENABLED {
        assert!(after.cow_clones > before.cow_clones);
        assert!(after.cow_faults >= before.cow_faults + 3);
        assert!(after.collapses > before.collapses);
        assert!(after.merge_kept >= before.merge_kept + 7);
        assert!(after.merge_freed >= before.merge_freed + 5);
        assert!(after.splice_supplied >= before.splice_supplied + 2);
    }

    let mut lines = Vec::new();
    klog::klog().drain(|line| lines.push(line.to_string()));
    let collapse_line = format!("collapsed parent {}", root_id.0);
    assert!(lines.iter().any(|line| line.contains(&collapse_line)));
}
