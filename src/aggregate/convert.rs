//! Conversion of a full capture into the pre-aggregated format.
//!
//! Replays an all-allocations capture through a high-water-mark
//! aggregator, emits a MEMORY_SNAPSHOT at every memory record of the
//! source, and finishes with one AGGREGATED_ALLOCATION per surviving
//! location carrying its peak and leaked totals. Stacks are re-interned
//! into the output's own frame and trace index tables.

use std::collections::HashMap;

use crate::aggregate::{HighWaterMarkAggregator, LocationKey};
use crate::error::{TrackerError, TrackerResult};
use crate::format::reader::{ReadOutcome, RecordReader};
use crate::format::writer::RecordWriter;
use crate::format::{AggregatedAllocation, AllocatorKind, FileFormat};
use crate::sink::Sink;

/// Reduce `reader`'s capture into an aggregated capture on `sink`.
pub fn convert_to_aggregated(
    reader: &mut RecordReader,
    sink: Box<dyn Sink>,
) -> TrackerResult<()> {
    if reader.header().file_format != FileFormat::AllAllocations {
        return Err(TrackerError::format(
            "only all-allocations captures can be aggregated",
        ));
    }
    let mut header = reader.header().clone();
    header.file_format = FileFormat::AggregatedAllocations;
    let mut writer = RecordWriter::new(sink, header)?;

    let mut aggregator = HighWaterMarkAggregator::new();
    // The aggregated record carries the allocator; a location is keyed by
    // call site, so remember the allocator that first touched it.
    let mut allocator_by_location: HashMap<LocationKey, AllocatorKind> = HashMap::new();

    loop {
        match reader.next_record()? {
            ReadOutcome::Allocation => {
                let allocation = *reader.allocation().expect("allocation outcome");
                allocator_by_location
                    .entry(LocationKey::for_allocation(&allocation))
                    .or_insert(allocation.allocator);
                aggregator.add(&allocation);
            }
            ReadOutcome::MemoryRecord => {
                let record = *reader.memory_record().expect("memory record outcome");
                writer.write_memory_snapshot(
                    record.ms_since_start,
                    record.rss_bytes,
                    aggregator.current_heap_size(),
                )?;
            }
            ReadOutcome::ObjectRecord
            | ReadOutcome::MemorySnapshot
            | ReadOutcome::AggregatedAllocation => {}
            ReadOutcome::EndOfFile => break,
        }
    }

    let peak = aggregator.high_water_mark_by_location(false);
    let leaks = aggregator.leaks_by_location(false);
    let mut locations: Vec<LocationKey> = peak.keys().chain(leaks.keys()).copied().collect();
    locations.sort_by_key(|key| (key.tid, key.frame_index, key.native_frame_id));
    locations.dedup();

    if !reader.mappings().is_empty() {
        writer.write_mappings(reader.mappings())?;
    }

    for location in locations {
        let frame_leaf = reencode_stack(reader, &mut writer, location.frame_index)?;
        let native_leaf = if location.native_frame_id != 0 {
            let ips = reader.get_native_stack(location.native_frame_id, usize::MAX);
            writer.write_native_stack(&ips)?
        } else {
            0
        };
        let peak_totals = peak.get(&location).copied().unwrap_or_default();
        let leak_totals = leaks.get(&location).copied().unwrap_or_default();
        writer.write_aggregated_allocation(&AggregatedAllocation {
            tid: location.tid,
            allocator: allocator_by_location
                .get(&location)
                .copied()
                .unwrap_or(AllocatorKind::Malloc),
            frame_index: frame_leaf,
            native_frame_id: native_leaf,
            native_segment_generation: 0,
            n_allocations_in_high_water_mark: peak_totals.n_allocations,
            n_allocations_leaked: leak_totals.n_allocations,
            bytes_in_high_water_mark: peak_totals.n_bytes,
            bytes_leaked: leak_totals.n_bytes,
        })?;
    }

    writer.finalize()
}

/// Re-intern one managed stack into the output's frame/trace tables.
fn reencode_stack(
    reader: &RecordReader,
    writer: &mut RecordWriter,
    leaf: u32,
) -> TrackerResult<u32> {
    let innermost_first = reader.stack_frame_ids(leaf, usize::MAX);
    let mut out_frame_ids = Vec::with_capacity(innermost_first.len());
    for frame_id in innermost_first.iter().rev() {
        let Some((code_id, offset, entry)) = reader.frame_key(*frame_id) else {
            continue;
        };
        let Some(code) = reader.code_object(code_id) else {
            continue;
        };
        out_frame_ids.push(writer.write_frame_index(code, offset, entry)?);
    }
    writer.write_trace_index(&out_frame_ids)
}
