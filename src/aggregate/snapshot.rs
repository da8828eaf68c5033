//! Point-in-time heap snapshot.

use std::collections::HashMap;

use crate::aggregate::{LocationKey, LocationTotals};
use crate::ds::IntervalTree;
use crate::format::{Allocation, AllocatorClass};

/// Tracks the live heap: a pointer map for malloc-family allocations and
/// an interval tree for mmap-family ranges, so partial unmaps are
/// respected. `snapshot` reduces whatever is live by location.
#[derive(Default)]
pub struct SnapshotAllocationAggregator {
    ptr_to_allocation: HashMap<usize, Allocation>,
    ranged: IntervalTree<Allocation>,
}

impl SnapshotAllocationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, allocation: &Allocation) {
        match allocation.allocator.class() {
            AllocatorClass::SimpleAllocator => {
                self.ptr_to_allocation
                    .insert(allocation.address, *allocation);
            }
            AllocatorClass::SimpleDeallocator => {
                self.ptr_to_allocation.remove(&allocation.address);
            }
            AllocatorClass::RangedAllocator => {
                self.ranged
                    .add(allocation.address, allocation.size, *allocation);
            }
            AllocatorClass::RangedDeallocator => {
                self.ranged.remove(allocation.address, allocation.size);
            }
        }
    }

    /// Live bytes right now, across both allocation families.
    pub fn live_bytes(&self) -> usize {
        self.ptr_to_allocation
            .values()
            .map(|a| a.size)
            .sum::<usize>()
            + self.ranged.total_bytes()
    }

    /// Reduce the live heap by location. Ranged allocations contribute
    /// the summed size of their surviving sub-intervals.
    pub fn snapshot(&self, merge_threads: bool) -> HashMap<LocationKey, LocationTotals> {
        let mut out: HashMap<LocationKey, LocationTotals> = HashMap::new();
        let key_of = |allocation: &Allocation| {
            let key = LocationKey::for_allocation(allocation);
            if merge_threads {
                key.merged()
            } else {
                key
            }
        };
        for allocation in self.ptr_to_allocation.values() {
            let totals = out.entry(key_of(allocation)).or_default();
            totals.n_allocations += allocation.n_allocations;
            totals.n_bytes += allocation.size;
        }
        for (interval, allocation) in self.ranged.iter() {
            let totals = out.entry(key_of(allocation)).or_default();
            totals.n_allocations += 1;
            totals.n_bytes += interval.size();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::testing::event;
    use crate::format::AllocatorKind;
    use crate::util::size::kb;

    #[test]
    fn simple_allocation_lifetime() {
        let mut agg = SnapshotAllocationAggregator::new();
        agg.add(&event(1, 7, AllocatorKind::Malloc, 0x1000, 100));
        let live = agg.snapshot(false);
        assert_eq!(live.len(), 1);
        let totals = live
            .get(&LocationKey {
                frame_index: 7,
                native_frame_id: 0,
                tid: 1,
            })
            .unwrap();
        assert_eq!(totals.n_bytes, 100);
        assert_eq!(totals.n_allocations, 1);

        agg.add(&event(1, 7, AllocatorKind::Free, 0x1000, 0));
        assert!(agg.snapshot(false).is_empty());
    }

    #[test]
    fn partial_munmap_respects_surviving_range() {
        let mut agg = SnapshotAllocationAggregator::new();
        agg.add(&event(1, 3, AllocatorKind::Mmap, 0x10000, kb(8)));
        agg.add(&event(1, 3, AllocatorKind::Munmap, 0x10000 + kb(4), kb(4)));
        let live = agg.snapshot(false);
        let totals = live.values().next().unwrap();
        assert_eq!(totals.n_bytes, kb(4));
        assert_eq!(agg.live_bytes(), kb(4));
    }

    #[test]
    fn realloc_moves_bytes_to_new_site() {
        let mut agg = SnapshotAllocationAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x1000, 10));
        // A realloc shows up as a free of the old pointer and an
        // allocation of the new one at the reallocating call site.
        agg.add(&event(1, 1, AllocatorKind::Free, 0x1000, 0));
        agg.add(&event(1, 2, AllocatorKind::Realloc, 0x2000, 20));
        let live = agg.snapshot(false);
        assert_eq!(live.len(), 1);
        let (key, totals) = live.iter().next().unwrap();
        assert_eq!(key.frame_index, 2);
        assert_eq!(totals.n_bytes, 20);
    }

    #[test]
    fn merge_threads_collapses_tids() {
        let mut agg = SnapshotAllocationAggregator::new();
        agg.add(&event(1, 5, AllocatorKind::Malloc, 0x1000, 10));
        agg.add(&event(2, 5, AllocatorKind::Malloc, 0x2000, 30));
        assert_eq!(agg.snapshot(false).len(), 2);
        let merged = agg.snapshot(true);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.values().next().unwrap().n_bytes, 40);
    }

    #[test]
    fn snapshot_totals_match_live_bytes() {
        let mut agg = SnapshotAllocationAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x1000, 64));
        agg.add(&event(1, 2, AllocatorKind::Mmap, 0x20000, kb(16)));
        agg.add(&event(1, 2, AllocatorKind::Munmap, 0x20000, kb(2)));
        agg.add(&event(2, 3, AllocatorKind::Calloc, 0x3000, 128));
        let total: usize = agg.snapshot(false).values().map(|t| t.n_bytes).sum();
        assert_eq!(total, agg.live_bytes());
        assert_eq!(total, 64 + kb(14) + 128);
    }
}
