//! Temporary-allocation detection.
//!
//! An allocation is "temporary" when it is freed while still among the N
//! most recent live allocations of its thread. The per-thread window
//! keeps hot churn visible without remembering the whole heap.

use std::collections::{HashMap, VecDeque};

use crate::aggregate::{LocationKey, LocationTotals};
use crate::format::{Allocation, AllocatorClass};

/// Finds allocations freed within a recency window.
pub struct TemporaryAllocationsAggregator {
    max_items: usize,
    windows: HashMap<u64, VecDeque<Allocation>>,
    temporaries: Vec<Allocation>,
}

impl TemporaryAllocationsAggregator {
    /// `max_items` is the per-thread window size.
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            windows: HashMap::new(),
            temporaries: Vec::new(),
        }
    }

    pub fn add(&mut self, allocation: &Allocation) {
        match allocation.allocator.class() {
            AllocatorClass::SimpleAllocator | AllocatorClass::RangedAllocator => {
                let window = self.windows.entry(allocation.tid).or_default();
                window.push_back(*allocation);
                if window.len() > self.max_items {
                    window.pop_front();
                }
            }
            AllocatorClass::SimpleDeallocator | AllocatorClass::RangedDeallocator => {
                let ranged = allocation.allocator.class() == AllocatorClass::RangedDeallocator;
                let Some(window) = self.windows.get_mut(&allocation.tid) else {
                    return;
                };
                // Addresses match simple allocations outright; ranged
                // deallocations must also match the mapped length, so a
                // partial munmap never counts as a temporary.
                let matched = window.iter().rposition(|candidate| {
                    candidate.address == allocation.address
                        && (!ranged || candidate.size == allocation.size)
                });
                if let Some(index) = matched {
                    let candidate = window.remove(index).expect("index from rposition");
                    self.temporaries.push(candidate);
                }
            }
        }
    }

    /// Every temporary allocation seen so far, in detection order.
    pub fn temporaries(&self) -> &[Allocation] {
        &self.temporaries
    }

    /// Reduce the temporaries by location.
    pub fn snapshot(&self, merge_threads: bool) -> HashMap<LocationKey, LocationTotals> {
        let mut out: HashMap<LocationKey, LocationTotals> = HashMap::new();
        for allocation in &self.temporaries {
            let mut key = LocationKey::for_allocation(allocation);
            if merge_threads {
                key = key.merged();
            }
            let totals = out.entry(key).or_default();
            totals.n_allocations += allocation.n_allocations;
            totals.n_bytes += allocation.size;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::testing::event;
    use crate::format::AllocatorKind;

    #[test]
    fn free_within_window_is_temporary() {
        let mut agg = TemporaryAllocationsAggregator::new(4);
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x1000, 32));
        agg.add(&event(1, 1, AllocatorKind::Free, 0x1000, 0));
        assert_eq!(agg.temporaries().len(), 1);
        assert_eq!(agg.temporaries()[0].size, 32);
    }

    #[test]
    fn window_eviction_prevents_matching() {
        let mut agg = TemporaryAllocationsAggregator::new(2);
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x1000, 1));
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x2000, 1));
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x3000, 1));
        // 0x1000 slid out of the two-entry window.
        agg.add(&event(1, 1, AllocatorKind::Free, 0x1000, 0));
        assert!(agg.temporaries().is_empty());
    }

    #[test]
    fn windows_are_per_thread() {
        let mut agg = TemporaryAllocationsAggregator::new(4);
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x1000, 8));
        // Same address freed on another thread: no match.
        agg.add(&event(2, 1, AllocatorKind::Free, 0x1000, 0));
        assert!(agg.temporaries().is_empty());
    }

    #[test]
    fn partial_munmap_is_not_temporary() {
        let mut agg = TemporaryAllocationsAggregator::new(4);
        agg.add(&event(1, 1, AllocatorKind::Mmap, 0x10000, 0x2000));
        agg.add(&event(1, 1, AllocatorKind::Munmap, 0x10000, 0x1000));
        assert!(agg.temporaries().is_empty());
        // The exact range does match.
        agg.add(&event(1, 1, AllocatorKind::Mmap, 0x30000, 0x2000));
        agg.add(&event(1, 1, AllocatorKind::Munmap, 0x30000, 0x2000));
        assert_eq!(agg.temporaries().len(), 1);
    }

    #[test]
    fn snapshot_groups_by_location() {
        let mut agg = TemporaryAllocationsAggregator::new(8);
        for i in 0..3usize {
            agg.add(&event(1, 9, AllocatorKind::Malloc, 0x1000 + i * 16, 10));
            agg.add(&event(1, 9, AllocatorKind::Free, 0x1000 + i * 16, 0));
        }
        let reduced = agg.snapshot(false);
        let totals = reduced.values().next().unwrap();
        assert_eq!(totals.n_allocations, 3);
        assert_eq!(totals.n_bytes, 30);
    }
}
