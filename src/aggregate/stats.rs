//! Whole-capture statistics.

use std::collections::{BTreeMap, HashMap};

use crate::aggregate::{LocationKey, LocationTotals};
use crate::format::{Allocation, AllocatorKind};

/// Totals, a log-scale size histogram, per-allocator counts, and
/// per-location totals for top-N queries.
#[derive(Default)]
pub struct AllocationStatsAggregator {
    total_allocations: u64,
    total_bytes: u64,
    /// Keyed by floor(log2(size)); zero-byte allocations use bucket 0.
    count_by_size: BTreeMap<u32, u64>,
    count_by_allocator: HashMap<AllocatorKind, u64>,
    by_location: HashMap<LocationKey, LocationTotals>,
}

impl AllocationStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, allocation: &Allocation) {
        if !allocation.allocator.is_allocator() {
            return;
        }
        self.total_allocations += 1;
        self.total_bytes += allocation.size as u64;
        *self
            .count_by_size
            .entry(size_bucket(allocation.size))
            .or_default() += 1;
        *self
            .count_by_allocator
            .entry(allocation.allocator)
            .or_default() += 1;
        let totals = self
            .by_location
            .entry(LocationKey::for_allocation(allocation))
            .or_default();
        totals.n_allocations += allocation.n_allocations;
        totals.n_bytes += allocation.size;
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Histogram of allocation sizes by power-of-two bucket.
    pub fn size_histogram(&self) -> &BTreeMap<u32, u64> {
        &self.count_by_size
    }

    pub fn count_for_allocator(&self, allocator: AllocatorKind) -> u64 {
        self.count_by_allocator
            .get(&allocator)
            .copied()
            .unwrap_or(0)
    }

    /// The `n` locations with the most allocated bytes, descending.
    pub fn top_locations_by_bytes(&self, n: usize) -> Vec<(LocationKey, LocationTotals)> {
        let mut entries: Vec<_> = self
            .by_location
            .iter()
            .map(|(key, totals)| (*key, *totals))
            .collect();
        entries.sort_by(|a, b| b.1.n_bytes.cmp(&a.1.n_bytes));
        entries.truncate(n);
        entries
    }

    /// The `n` locations with the most allocation events, descending.
    pub fn top_locations_by_count(&self, n: usize) -> Vec<(LocationKey, LocationTotals)> {
        let mut entries: Vec<_> = self
            .by_location
            .iter()
            .map(|(key, totals)| (*key, *totals))
            .collect();
        entries.sort_by(|a, b| b.1.n_allocations.cmp(&a.1.n_allocations));
        entries.truncate(n);
        entries
    }
}

fn size_bucket(size: usize) -> u32 {
    if size == 0 {
        0
    } else {
        usize::BITS - 1 - size.leading_zeros()
    }
}
