//! Allocation lifetime bucketing.
//!
//! An external driver calls `capture_snapshot` at interesting boundaries;
//! every allocation is then classified by the snapshot interval it was
//! born in and the one it died in. Allocations never freed report a
//! `None` death interval, which is how leak totals fall out of the same
//! reduction.

use std::collections::HashMap;

use crate::aggregate::{LocationKey, LocationTotals};
use crate::ds::{IntervalTree, Removal};
use crate::format::{Allocation, AllocatorClass};

/// `(born, died, location)`; `died` is `None` while (or forever if) the
/// allocation survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LifetimeKey {
    pub allocated_in_snapshot: usize,
    pub deallocated_in_snapshot: Option<usize>,
    pub location: LocationKey,
}

/// Buckets allocations by (birth snapshot, death snapshot, location).
#[derive(Default)]
pub struct AllocationLifetimeAggregator {
    current_snapshot: usize,
    simple: HashMap<usize, (usize, LocationKey, usize)>,
    ranged: IntervalTree<(usize, LocationKey)>,
    finished: HashMap<LifetimeKey, LocationTotals>,
}

impl AllocationLifetimeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next snapshot interval.
    pub fn capture_snapshot(&mut self) {
        self.current_snapshot += 1;
    }

    pub fn add(&mut self, allocation: &Allocation) {
        let location = LocationKey::for_allocation(allocation);
        match allocation.allocator.class() {
            AllocatorClass::SimpleAllocator => {
                self.simple.insert(
                    allocation.address,
                    (self.current_snapshot, location, allocation.size),
                );
            }
            AllocatorClass::SimpleDeallocator => {
                if let Some((born, location, size)) = self.simple.remove(&allocation.address) {
                    self.record(born, Some(self.current_snapshot), location, size, 1);
                }
            }
            AllocatorClass::RangedAllocator => {
                self.ranged.add(
                    allocation.address,
                    allocation.size,
                    (self.current_snapshot, location),
                );
            }
            AllocatorClass::RangedDeallocator => {
                for piece in self.ranged.remove(allocation.address, allocation.size) {
                    let (born, location) = piece.value;
                    let count = match piece.removal {
                        Removal::FullyRemoved => 1,
                        _ => 0,
                    };
                    self.record(
                        born,
                        Some(self.current_snapshot),
                        location,
                        piece.interval.size(),
                        count,
                    );
                }
            }
        }
    }

    fn record(
        &mut self,
        born: usize,
        died: Option<usize>,
        location: LocationKey,
        bytes: usize,
        count: usize,
    ) {
        let totals = self
            .finished
            .entry(LifetimeKey {
                allocated_in_snapshot: born,
                deallocated_in_snapshot: died,
                location,
            })
            .or_default();
        totals.n_bytes += bytes;
        totals.n_allocations += count;
    }

    /// Reduce everything seen so far; still-live allocations land in the
    /// never-deallocated bucket.
    pub fn snapshot(&self) -> HashMap<LifetimeKey, LocationTotals> {
        let mut out = self.finished.clone();
        let mut live = |born: usize, location: LocationKey, bytes: usize, count: usize| {
            let totals = out
                .entry(LifetimeKey {
                    allocated_in_snapshot: born,
                    deallocated_in_snapshot: None,
                    location,
                })
                .or_default();
            totals.n_bytes += bytes;
            totals.n_allocations += count;
        };
        for (born, location, size) in self.simple.values() {
            live(*born, *location, *size, 1);
        }
        for (interval, (born, location)) in self.ranged.iter() {
            live(*born, *location, interval.size(), 1);
        }
        out
    }
}
