//! VM Event Counters
//!
//! Kernel-wide counters for page list traffic through the paged object
//! layer. Useful for debugging and for checking page accounting in tests.
//!
//! ## Counter Categories
//!
//! - **Commit**: pages committed and decommitted
//! - **Splice**: pages taken out of and supplied into objects
//! - **Clone**: COW clones, write faults and collapses
//! - **Merge**: pages kept or freed while collapsing a clone chain

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Atomically updated event counter
#[derive(Debug)]
pub struct VmCounter {
    value: AtomicU64,
    name: &'static str,
}

impl VmCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Commit Counters
// ============================================================================

/// Pages committed into objects
pub static C_PAGES_COMMITTED: VmCounter = VmCounter::new("pages_committed");
/// Pages decommitted from objects
pub static C_PAGES_DECOMMITTED: VmCounter = VmCounter::new("pages_decommitted");
/// Pages freed when an object shrank or was destroyed
pub static C_PAGES_RELEASED: VmCounter = VmCounter::new("pages_released");

// ============================================================================
// Splice Counters
// ============================================================================

/// take_pages calls
pub static C_SPLICE_TAKES: VmCounter = VmCounter::new("splice_takes");
/// Pages supplied from splice lists
pub static C_SPLICE_SUPPLIED: VmCounter = VmCounter::new("splice_supplied");
/// Supplied pages dropped because the offset was already populated
pub static C_SPLICE_DISCARDED: VmCounter = VmCounter::new("splice_discarded");

// ============================================================================
// Clone Counters
// ============================================================================

/// COW clones created
pub static C_COW_CLONES: VmCounter = VmCounter::new("cow_clones");
/// Write faults that gave a clone a private page
pub static C_COW_FAULTS: VmCounter = VmCounter::new("cow_faults");
/// Clone chain collapses
pub static C_COLLAPSES: VmCounter = VmCounter::new("collapses");

// ============================================================================
// Merge Counters
// ============================================================================

/// Pages moved into the surviving list during a merge
pub static C_MERGE_KEPT: VmCounter = VmCounter::new("merge_kept");
/// Shadowed pages freed during a merge
pub static C_MERGE_FREED: VmCounter = VmCounter::new("merge_freed");

// ============================================================================
// Counter Macros (compile-time switchable)
// ============================================================================

/// Whether counters are enabled (`counters` feature)
pub const VM_COUNTERS_ENABLED: bool = cfg!(feature = "counters");

/// Bump a counter by one, or by `n`, when counters are enabled
#[macro_export]
macro_rules! vm_counter {
    ($counter:expr) => {
        if $crate::vm::counters::VM_COUNTERS_ENABLED {
            $counter.inc();
        }
    };
    ($counter:expr, $n:expr) => {
        if $crate::vm::counters::VM_COUNTERS_ENABLED {
            $counter.add($n as u64);
        }
    };
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of all VM counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub pages_committed: u64,
    pub pages_decommitted: u64,
    pub pages_released: u64,
    pub splice_takes: u64,
    pub splice_supplied: u64,
    pub splice_discarded: u64,
    pub cow_clones: u64,
    pub cow_faults: u64,
    pub collapses: u64,
    pub merge_kept: u64,
    pub merge_freed: u64,
}

/// Take a snapshot of all counters
pub fn snapshot() -> CounterSnapshot {
    CounterSnapshot {
        pages_committed: C_PAGES_COMMITTED.get(),
        pages_decommitted: C_PAGES_DECOMMITTED.get(),
        pages_released: C_PAGES_RELEASED.get(),
        splice_takes: C_SPLICE_TAKES.get(),
        splice_supplied: C_SPLICE_SUPPLIED.get(),
        splice_discarded: C_SPLICE_DISCARDED.get(),
        cow_clones: C_COW_CLONES.get(),
        cow_faults: C_COW_FAULTS.get(),
        collapses: C_COLLAPSES.get(),
        merge_kept: C_MERGE_KEPT.get(),
        merge_freed: C_MERGE_FREED.get(),
    }
}

/// Reset all counters
pub fn reset_all() {
    for counter in all_counters() {
        counter.reset();
    }
}

/// Every counter, for iteration and dumping
pub fn all_counters() -> [&'static VmCounter; 11] {
    [
        &C_PAGES_COMMITTED,
        &C_PAGES_DECOMMITTED,
        &C_PAGES_RELEASED,
        &C_SPLICE_TAKES,
        &C_SPLICE_SUPPLIED,
        &C_SPLICE_DISCARDED,
        &C_COW_CLONES,
        &C_COW_FAULTS,
        &C_COLLAPSES,
        &C_MERGE_KEPT,
        &C_MERGE_FREED,
    ]
}
