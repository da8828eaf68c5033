//! High-water-mark attribution.
//!
//! Tracks the running heap size and, for every location, how much it
//! contributed at the moment the heap peaked. A peak is finalized the
//! first time the heap strictly shrinks after setting a new global
//! maximum; at that instant every location's pending deltas describe its
//! state at the peak, so they can be folded lazily the next time the
//! location is touched (or at snapshot time) instead of walking all
//! locations on every peak.

use std::collections::HashMap;

use crate::aggregate::{LocationKey, LocationTotals};
use crate::ds::{IntervalTree, Removal};
use crate::format::{Allocation, AllocatorClass};

#[derive(Debug, Clone, Copy, Default)]
struct UsageHistory {
    /// Last finalized peak this history's committed values describe.
    last_known_peak: u64,
    bytes_committed: i64,
    count_committed: i64,
    /// Deltas accumulated since `last_known_peak` was finalized.
    bytes_since: i64,
    count_since: i64,
}

impl UsageHistory {
    fn rebase(&mut self, peak_count: u64) {
        if self.last_known_peak < peak_count {
            self.bytes_committed += self.bytes_since;
            self.count_committed += self.count_since;
            self.bytes_since = 0;
            self.count_since = 0;
            self.last_known_peak = peak_count;
        }
    }

    /// Contribution at the most recent peak (`effective_peak` counts a
    /// still-standing peak as finalized).
    fn peak_contribution(&self, effective_peak: u64) -> (i64, i64) {
        if self.last_known_peak < effective_peak {
            (
                self.bytes_committed + self.bytes_since,
                self.count_committed + self.count_since,
            )
        } else {
            (self.bytes_committed, self.count_committed)
        }
    }

    /// Current usage: everything ever applied.
    fn current(&self) -> (i64, i64) {
        (
            self.bytes_committed + self.bytes_since,
            self.count_committed + self.count_since,
        )
    }
}

/// Attributes the heap's high water mark (and current leaks) to
/// locations.
#[derive(Default)]
pub struct HighWaterMarkAggregator {
    current_heap: usize,
    peak_heap: usize,
    /// The heap is sitting at an unfinalized global maximum.
    at_peak: bool,
    /// Number of finalized peaks.
    peak_count: u64,
    histories: HashMap<LocationKey, UsageHistory>,
    simple: HashMap<usize, (LocationKey, usize)>,
    ranged: IntervalTree<LocationKey>,
}

impl HighWaterMarkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, allocation: &Allocation) {
        let key = LocationKey::for_allocation(allocation);
        match allocation.allocator.class() {
            AllocatorClass::SimpleAllocator => {
                self.simple
                    .insert(allocation.address, (key, allocation.size));
                self.apply(key, allocation.size as i64, 1);
            }
            AllocatorClass::SimpleDeallocator => {
                if let Some((key, size)) = self.simple.remove(&allocation.address) {
                    self.finalize_peak_if_shrinking();
                    self.apply(key, -(size as i64), -1);
                }
            }
            AllocatorClass::RangedAllocator => {
                self.ranged.add(allocation.address, allocation.size, key);
                self.apply(key, allocation.size as i64, 1);
            }
            AllocatorClass::RangedDeallocator => {
                let removed = self.ranged.remove(allocation.address, allocation.size);
                if removed.is_empty() {
                    return;
                }
                self.finalize_peak_if_shrinking();
                for piece in removed {
                    // Partial removals shrink bytes only; the piece that
                    // empties its allocation retires the count too.
                    let count_delta = match piece.removal {
                        Removal::FullyRemoved => -1,
                        _ => 0,
                    };
                    self.apply(piece.value, -(piece.interval.size() as i64), count_delta);
                }
            }
        }
    }

    fn finalize_peak_if_shrinking(&mut self) {
        if self.at_peak {
            self.peak_count += 1;
            self.at_peak = false;
        }
    }

    fn apply(&mut self, key: LocationKey, bytes_delta: i64, count_delta: i64) {
        let history = self.histories.entry(key).or_default();
        history.rebase(self.peak_count);
        history.bytes_since += bytes_delta;
        history.count_since += count_delta;
        self.current_heap = (self.current_heap as i64 + bytes_delta).max(0) as usize;
        if self.current_heap > self.peak_heap {
            self.peak_heap = self.current_heap;
            self.at_peak = true;
        }
    }

    pub fn current_heap_size(&self) -> usize {
        self.current_heap
    }

    /// The high water mark observed so far.
    pub fn peak_heap_size(&self) -> usize {
        self.peak_heap
    }

    fn effective_peak(&self) -> u64 {
        self.peak_count + u64::from(self.at_peak)
    }

    /// Per-location contribution to the high water mark.
    pub fn high_water_mark_by_location(
        &self,
        merge_threads: bool,
    ) -> HashMap<LocationKey, LocationTotals> {
        let effective = self.effective_peak();
        self.reduce(merge_threads, |history| history.peak_contribution(effective))
    }

    /// Per-location bytes still live (the leak report when taken at the
    /// end of a session).
    pub fn leaks_by_location(&self, merge_threads: bool) -> HashMap<LocationKey, LocationTotals> {
        self.reduce(merge_threads, |history| history.current())
    }

    fn reduce(
        &self,
        merge_threads: bool,
        value: impl Fn(&UsageHistory) -> (i64, i64),
    ) -> HashMap<LocationKey, LocationTotals> {
        let mut out: HashMap<LocationKey, LocationTotals> = HashMap::new();
        for (key, history) in &self.histories {
            let (bytes, count) = value(history);
            if bytes <= 0 && count <= 0 {
                continue;
            }
            let key = if merge_threads { key.merged() } else { *key };
            let totals = out.entry(key).or_default();
            totals.n_bytes += bytes.max(0) as usize;
            totals.n_allocations += count.max(0) as usize;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::testing::event;
    use crate::format::AllocatorKind;

    fn key(frame_index: u32) -> LocationKey {
        LocationKey {
            frame_index,
            native_frame_id: 0,
            tid: 1,
        }
    }

    fn bytes_at(map: &HashMap<LocationKey, LocationTotals>, frame_index: u32) -> usize {
        map.get(&key(frame_index)).map(|t| t.n_bytes).unwrap_or(0)
    }

    #[test]
    fn single_allocation_peaks_and_leaks_nothing_after_free() {
        let mut agg = HighWaterMarkAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0x1000, 100));
        agg.add(&event(1, 1, AllocatorKind::Free, 0x1000, 0));
        assert_eq!(agg.peak_heap_size(), 100);
        let peak = agg.high_water_mark_by_location(false);
        assert_eq!(bytes_at(&peak, 1), 100);
        assert!(agg.leaks_by_location(false).is_empty());
    }

    #[test]
    fn peak_attribution_across_interleaved_lifetimes() {
        // A=100, B=200, free B, C=50, free A, D=300: the final heap of
        // 350 is the global peak, made of C's 50 and D's 300.
        let mut agg = HighWaterMarkAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0xa000, 100)); // A
        agg.add(&event(1, 2, AllocatorKind::Malloc, 0xb000, 200)); // B
        agg.add(&event(1, 2, AllocatorKind::Free, 0xb000, 0));
        agg.add(&event(1, 3, AllocatorKind::Malloc, 0xc000, 50)); // C
        agg.add(&event(1, 1, AllocatorKind::Free, 0xa000, 0));
        agg.add(&event(1, 4, AllocatorKind::Malloc, 0xd000, 300)); // D

        assert_eq!(agg.current_heap_size(), 350);
        assert_eq!(agg.peak_heap_size(), 350);

        let peak = agg.high_water_mark_by_location(false);
        assert_eq!(bytes_at(&peak, 1), 0);
        assert_eq!(bytes_at(&peak, 2), 0);
        assert_eq!(bytes_at(&peak, 3), 50);
        assert_eq!(bytes_at(&peak, 4), 300);

        let leaks = agg.leaks_by_location(false);
        assert_eq!(bytes_at(&leaks, 1), 0);
        assert_eq!(bytes_at(&leaks, 2), 0);
        assert_eq!(bytes_at(&leaks, 3), 50);
        assert_eq!(bytes_at(&leaks, 4), 300);
    }

    #[test]
    fn superseded_peak_is_not_reported() {
        // Peak 300 at site 1+2, then everything freed, then a higher
        // peak at site 3 alone.
        let mut agg = HighWaterMarkAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0xa000, 100));
        agg.add(&event(1, 2, AllocatorKind::Malloc, 0xb000, 200));
        agg.add(&event(1, 1, AllocatorKind::Free, 0xa000, 0));
        agg.add(&event(1, 2, AllocatorKind::Free, 0xb000, 0));
        agg.add(&event(1, 3, AllocatorKind::Malloc, 0xc000, 400));

        let peak = agg.high_water_mark_by_location(false);
        assert_eq!(bytes_at(&peak, 1), 0);
        assert_eq!(bytes_at(&peak, 2), 0);
        assert_eq!(bytes_at(&peak, 3), 400);
        assert_eq!(agg.peak_heap_size(), 400);
    }

    #[test]
    fn leaks_sum_to_current_heap() {
        let mut agg = HighWaterMarkAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Malloc, 0xa000, 128));
        agg.add(&event(2, 2, AllocatorKind::Mmap, 0x10000, 4096));
        agg.add(&event(2, 2, AllocatorKind::Munmap, 0x10000, 1024));
        agg.add(&event(1, 1, AllocatorKind::Free, 0xa000, 0));
        agg.add(&event(1, 3, AllocatorKind::Calloc, 0xe000, 512));
        let leaks = agg.leaks_by_location(false);
        let total: usize = leaks.values().map(|t| t.n_bytes).sum();
        assert_eq!(total, agg.current_heap_size());
        assert_eq!(total, 4096 - 1024 + 512);
    }

    #[test]
    fn partial_unmap_keeps_count_until_range_is_empty() {
        let mut agg = HighWaterMarkAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Mmap, 0x10000, 0x2000));
        agg.add(&event(1, 1, AllocatorKind::Munmap, 0x10000, 0x1000));
        let leaks = agg.leaks_by_location(false);
        let totals = leaks.get(&key(1)).unwrap();
        assert_eq!(totals.n_bytes, 0x1000);
        assert_eq!(totals.n_allocations, 1);

        agg.add(&event(1, 1, AllocatorKind::Munmap, 0x11000, 0x1000));
        let leaks = agg.leaks_by_location(false);
        assert_eq!(bytes_at(&leaks, 1), 0);
    }

    #[test]
    fn unmatched_free_is_ignored() {
        let mut agg = HighWaterMarkAggregator::new();
        agg.add(&event(1, 1, AllocatorKind::Free, 0xdead, 0));
        assert_eq!(agg.current_heap_size(), 0);
        assert!(agg.leaks_by_location(false).is_empty());
    }
}
