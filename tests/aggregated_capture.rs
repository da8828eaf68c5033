//! Converting a full capture into the pre-aggregated format and reading
//! it back.

mod common;

use heaptrail::aggregate::convert_to_aggregated;
use heaptrail::format::reader::{ReadOutcome, RecordReader};
use heaptrail::format::writer::RecordWriter;
use heaptrail::format::{
    AllocatorKind, CodeObject, FileFormat, HeaderInfo, HeaderStats, RuntimeAllocatorKind,
    FORMAT_VERSION,
};

use common::{runtime_version, SharedSink};

fn full_header() -> HeaderInfo {
    HeaderInfo {
        version: FORMAT_VERSION,
        runtime_version: runtime_version(3, 8),
        native_traces: false,
        file_format: FileFormat::AllAllocations,
        stats: HeaderStats::default(),
        command_line: "app --serve".into(),
        pid: 7,
        main_tid: 1,
        skipped_frames_on_main_tid: 0,
        runtime_allocator: RuntimeAllocatorKind::SystemMalloc,
        trace_runtime_allocators: false,
        track_object_lifetimes: false,
    }
}

fn code(function_name: &str, firstlineno: i32) -> CodeObject {
    CodeObject {
        function_name: function_name.into(),
        filename: "app.py".into(),
        linetable: Vec::new(),
        firstlineno,
    }
}

#[test]
fn aggregation_preserves_peak_and_leak_totals() {
    // Source capture: site_a allocates 100 and frees it; site_b leaks
    // 200; the peak (300) holds both.
    let sink = SharedSink::new();
    let source = sink.clone();
    let mut writer = RecordWriter::new(Box::new(sink), full_header()).unwrap();
    writer.write_frame_push(1, &code("site_a", 10), 0, false).unwrap();
    writer
        .write_allocation(1, AllocatorKind::Malloc, 0x1000, 100, None)
        .unwrap();
    writer.write_frame_pop(1, 1).unwrap();
    writer.write_frame_push(1, &code("site_b", 20), 0, false).unwrap();
    writer
        .write_allocation(1, AllocatorKind::Malloc, 0x2000, 200, None)
        .unwrap();
    writer.write_frame_pop(1, 1).unwrap();
    writer.write_memory_record(5_000_000, 10).unwrap();
    writer.write_frame_push(1, &code("site_a", 10), 0, false).unwrap();
    writer
        .write_allocation(1, AllocatorKind::Free, 0x1000, 0, None)
        .unwrap();
    writer.finalize().unwrap();

    let mut reader = RecordReader::from_bytes(source.bytes()).unwrap();
    let sink = SharedSink::new();
    let aggregated = sink.clone();
    convert_to_aggregated(&mut reader, Box::new(sink)).unwrap();

    let mut reader = RecordReader::from_bytes(aggregated.bytes()).unwrap();
    assert_eq!(
        reader.header().file_format,
        FileFormat::AggregatedAllocations
    );

    let mut snapshots = Vec::new();
    let mut records = Vec::new();
    loop {
        match reader.next_record().unwrap() {
            ReadOutcome::MemorySnapshot => {
                snapshots.push(*reader.memory_snapshot().unwrap())
            }
            ReadOutcome::AggregatedAllocation => {
                let record = *reader.aggregated_allocation().unwrap();
                let site = reader
                    .get_stack(record.frame_index, 8)
                    .first()
                    .map(|frame| frame.function_name.clone())
                    .unwrap_or_default();
                records.push((site, record));
            }
            ReadOutcome::EndOfFile => break,
            other => panic!("unexpected record {other:?} in aggregated capture"),
        }
    }

    // The memory snapshot carries the heap size at that boundary.
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].rss_bytes, 5_000_000);
    assert_eq!(snapshots[0].heap_bytes, 300);

    records.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(records.len(), 2);

    let (site_a, record_a) = &records[0];
    assert_eq!(site_a, "site_a");
    assert_eq!(record_a.bytes_in_high_water_mark, 100);
    assert_eq!(record_a.bytes_leaked, 0);
    assert_eq!(record_a.n_allocations_in_high_water_mark, 1);
    assert_eq!(record_a.n_allocations_leaked, 0);

    let (site_b, record_b) = &records[1];
    assert_eq!(site_b, "site_b");
    assert_eq!(record_b.bytes_in_high_water_mark, 200);
    assert_eq!(record_b.bytes_leaked, 200);
    assert_eq!(record_b.tid, 1);
    assert_eq!(record_b.allocator, AllocatorKind::Malloc);
}

#[test]
fn aggregating_an_aggregated_capture_is_rejected() {
    let sink = SharedSink::new();
    let source = sink.clone();
    let mut header = full_header();
    header.file_format = FileFormat::AggregatedAllocations;
    let mut writer = RecordWriter::new(Box::new(sink), header).unwrap();
    writer.finalize().unwrap();

    let mut reader = RecordReader::from_bytes(source.bytes()).unwrap();
    assert!(convert_to_aggregated(&mut reader, Box::new(SharedSink::new())).is_err());
}
