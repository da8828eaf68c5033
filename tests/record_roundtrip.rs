//! Writer/reader round trips over the capture format.

mod common;

use heaptrail::format::reader::{ReadOutcome, RecordReader};
use heaptrail::format::writer::RecordWriter;
use heaptrail::format::{
    AllocatorKind, CodeObject, FileFormat, HeaderInfo, HeaderStats, ImageSegments,
    RuntimeAllocatorKind, Segment, FORMAT_VERSION,
};
use heaptrail::sink::FileSink;

use common::runtime_version;

fn test_header() -> HeaderInfo {
    HeaderInfo {
        version: FORMAT_VERSION,
        runtime_version: runtime_version(3, 8),
        native_traces: false,
        file_format: FileFormat::AllAllocations,
        stats: HeaderStats::default(),
        command_line: "pytest -x tests/".into(),
        pid: 4242,
        main_tid: 1,
        skipped_frames_on_main_tid: 0,
        runtime_allocator: RuntimeAllocatorKind::SmallObjectPools,
        trace_runtime_allocators: false,
        track_object_lifetimes: true,
    }
}

fn code(function_name: &str, filename: &str, firstlineno: i32) -> CodeObject {
    CodeObject {
        function_name: function_name.into(),
        filename: filename.into(),
        linetable: Vec::new(),
        firstlineno,
    }
}

/// Run a writer script against an in-memory sink and hand back the bytes.
fn capture(script: impl FnOnce(&mut RecordWriter)) -> Vec<u8> {
    let sink = common::SharedSink::new();
    let bytes_handle = sink.clone();
    let mut writer = RecordWriter::new(Box::new(sink), test_header()).unwrap();
    script(&mut writer);
    writer.finalize().unwrap();
    bytes_handle.bytes()
}

#[test]
fn header_survives_the_roundtrip() {
    let bytes = capture(|_| {});
    let reader = RecordReader::from_bytes(bytes).unwrap();
    let header = reader.header();
    assert_eq!(header.version, FORMAT_VERSION);
    assert_eq!(header.runtime_version, runtime_version(3, 8));
    assert_eq!(header.command_line, "pytest -x tests/");
    assert_eq!(header.pid, 4242);
    assert_eq!(header.main_tid, 1);
    assert_eq!(header.file_format, FileFormat::AllAllocations);
    assert_eq!(header.runtime_allocator, RuntimeAllocatorKind::SmallObjectPools);
    assert!(header.track_object_lifetimes);
    // Final stats were rewritten in place at finalize time.
    assert!(header.stats.end_ms >= header.stats.start_ms);
}

#[test]
fn allocations_replay_with_their_stacks() {
    let outer = code("main", "app.py", 10);
    let inner = code("build_buffer", "app.py", 42);
    let bytes = capture(|writer| {
        writer.write_frame_push(1, &outer, 0, true).unwrap();
        writer.write_frame_push(1, &inner, 6, false).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x1000, 128, None)
            .unwrap();
        writer.write_frame_pop(1, 1).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x2000, 64, None)
            .unwrap();
    });

    let mut reader = RecordReader::from_bytes(bytes).unwrap();

    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    let first = *reader.allocation().unwrap();
    assert_eq!(first.tid, 1);
    assert_eq!(first.address, 0x1000);
    assert_eq!(first.size, 128);
    assert_eq!(first.allocator, AllocatorKind::Malloc);
    let stack = reader.get_stack(first.frame_index, 32);
    let names: Vec<_> = stack.iter().map(|f| f.function_name.as_str()).collect();
    assert_eq!(names, ["build_buffer", "main"]);
    assert!(stack[1].is_entry_frame);
    assert_eq!(stack[1].lineno, 10);

    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    let second = *reader.allocation().unwrap();
    assert_eq!(second.address, 0x2000);
    let names: Vec<_> = reader
        .get_stack(second.frame_index, 32)
        .iter()
        .map(|f| f.function_name.clone())
        .collect();
    assert_eq!(names, ["main"]);

    assert_eq!(reader.next_record().unwrap(), ReadOutcome::EndOfFile);
}

#[test]
fn context_switches_partition_threads() {
    let site_a = code("worker_a", "a.py", 1);
    let site_b = code("worker_b", "b.py", 1);
    let bytes = capture(|writer| {
        writer.write_frame_push(10, &site_a, 0, false).unwrap();
        writer
            .write_allocation(10, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
        writer.write_frame_push(20, &site_b, 0, false).unwrap();
        writer
            .write_allocation(20, AllocatorKind::Malloc, 0x200, 2, None)
            .unwrap();
        writer
            .write_allocation(10, AllocatorKind::Malloc, 0x300, 3, None)
            .unwrap();
    });

    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    let mut seen = Vec::new();
    while reader.next_record().unwrap() == ReadOutcome::Allocation {
        let allocation = *reader.allocation().unwrap();
        let top = reader
            .get_stack(allocation.frame_index, 1)
            .first()
            .map(|f| f.function_name.clone())
            .unwrap();
        seen.push((allocation.tid, allocation.address, top));
    }
    assert_eq!(
        seen,
        [
            (10, 0x100, "worker_a".to_string()),
            (20, 0x200, "worker_b".to_string()),
            (10, 0x300, "worker_a".to_string()),
        ]
    );
}

#[test]
fn simple_deallocations_carry_no_size_but_ranged_do() {
    let bytes = capture(|writer| {
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x1000, 99, None)
            .unwrap();
        writer
            .write_allocation(1, AllocatorKind::Free, 0x1000, 12345, None)
            .unwrap();
        writer
            .write_allocation(1, AllocatorKind::Munmap, 0x8000, 4096, None)
            .unwrap();
    });
    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    reader.next_record().unwrap();
    reader.next_record().unwrap();
    // The size passed to the writer for the free is not on the wire.
    assert_eq!(reader.allocation().unwrap().size, 0);
    reader.next_record().unwrap();
    assert_eq!(reader.allocation().unwrap().size, 4096);
}

#[test]
fn frame_pops_batch_past_sixteen() {
    let site = code("deep", "deep.py", 1);
    let bytes = capture(|writer| {
        for depth in 0..40 {
            writer.write_frame_push(1, &site, depth, false).unwrap();
        }
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
        writer.write_frame_pop(1, 37).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x200, 1, None)
            .unwrap();
    });
    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    reader.next_record().unwrap();
    assert_eq!(reader.get_stack(reader.allocation().unwrap().frame_index, 64).len(), 40);
    reader.next_record().unwrap();
    assert_eq!(reader.get_stack(reader.allocation().unwrap().frame_index, 64).len(), 3);
}

#[test]
fn native_stacks_intern_shared_prefixes() {
    let bytes = capture(|writer| {
        let leaf_one = writer.write_native_stack(&[0x30, 0x20, 0x10]).unwrap();
        let leaf_two = writer.write_native_stack(&[0x31, 0x20, 0x10]).unwrap();
        assert_ne!(leaf_one, leaf_two);
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x1000, 8, Some(leaf_one))
            .unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x2000, 8, Some(leaf_two))
            .unwrap();
    });
    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    reader.next_record().unwrap();
    let first = *reader.allocation().unwrap();
    assert_eq!(reader.get_native_stack(first.native_frame_id, 16), [0x30, 0x20, 0x10]);
    reader.next_record().unwrap();
    let second = *reader.allocation().unwrap();
    assert_eq!(reader.get_native_stack(second.native_frame_id, 16), [0x31, 0x20, 0x10]);
}

#[test]
fn thread_names_memory_and_object_records() {
    let bytes = capture(|writer| {
        writer
            .write_allocation(7, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
        writer.write_thread_name(7, "worker").unwrap();
        writer
            .write_allocation(7, AllocatorKind::Malloc, 0x200, 1, None)
            .unwrap();
        writer.write_memory_record(123456, 99).unwrap();
        writer.write_object_record(7, 0x200, true).unwrap();
    });
    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.thread_name(7), Some("worker"));
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::MemoryRecord);
    let memory = *reader.memory_record().unwrap();
    assert_eq!(memory.rss_bytes, 123456);
    assert_eq!(memory.ms_since_start, 99);
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::ObjectRecord);
    let object = *reader.object_record().unwrap();
    assert_eq!(object.address, 0x200);
    assert!(object.created);
    assert_eq!(object.tid, 7);
}

#[test]
fn image_maps_bump_the_segment_generation() {
    let images = vec![ImageSegments {
        filename: "/usr/lib/libfoo.so".into(),
        load_address: 0x7f0000000000,
        segments: vec![
            Segment { vaddr: 0x7f0000000000, memsz: 0x1000 },
            Segment { vaddr: 0x7f0000002000, memsz: 0x4000 },
        ],
    }];
    let bytes = capture(|writer| {
        writer.write_mappings(&images).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
        writer.write_mappings(&images).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x200, 1, None)
            .unwrap();
    });
    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    reader.next_record().unwrap();
    assert_eq!(reader.allocation().unwrap().native_segment_generation, 1);
    reader.next_record().unwrap();
    assert_eq!(reader.allocation().unwrap().native_segment_generation, 2);
    assert_eq!(reader.mappings(), &images[..]);
}

#[test]
fn trailing_zero_padding_is_skipped() {
    let mut bytes = capture(|writer| {
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 42, None)
            .unwrap();
    });
    // Simulate the chunk-grown file of a killed process.
    bytes.extend(std::iter::repeat(0u8).take(4096));
    let mut reader = RecordReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.allocation().unwrap().size, 42);
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::EndOfFile);
}

#[test]
fn truncation_mid_record_loses_at_most_that_record() {
    let bytes = capture(|writer| {
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0xffff_4242, 77, None)
            .unwrap();
    });
    // Chop inside the final allocation record (and its trailer).
    let truncated = bytes[..bytes.len() - 4].to_vec();
    let mut reader = RecordReader::from_bytes(truncated).unwrap();
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.allocation().unwrap().address, 0x100);
    // The cut record never surfaces; the stream just ends.
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::EndOfFile);
}

#[test]
fn stream_source_treats_eof_as_clean_end() {
    let bytes = capture(|writer| {
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 5, None)
            .unwrap();
    });
    let cursor = std::io::Cursor::new(bytes);
    let mut reader = RecordReader::from_stream(Box::new(cursor)).unwrap();
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::EndOfFile);
    // The reader stays closed.
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::EndOfFile);
}

#[test]
fn bad_magic_is_a_format_error() {
    assert!(RecordReader::from_bytes(b"notacapture".to_vec()).is_err());
}

#[test]
fn file_capture_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    {
        let sink = FileSink::create(&path, true).unwrap();
        let mut writer = RecordWriter::new(Box::new(sink), test_header()).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0xabc, 321, None)
            .unwrap();
        writer.finalize().unwrap();
    }
    let mut reader = RecordReader::from_file(&path).unwrap();
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.allocation().unwrap().size, 321);
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::EndOfFile);
    // Final stats were patched into the header on disk.
    assert_eq!(reader.header().stats.n_allocations, 1);
}

#[test]
fn child_writer_targets_a_pid_suffixed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let sink = FileSink::create(&path, true).unwrap();
    let writer = RecordWriter::new(Box::new(sink), test_header()).unwrap();

    let mut child = writer.clone_in_child_process().unwrap().unwrap();
    child
        .write_allocation(1, AllocatorKind::Malloc, 0x1, 16, None)
        .unwrap();
    child.finalize().unwrap();
    drop(child);
    drop(writer);

    let pid = unsafe { libc::getpid() };
    let child_path = dir.path().join(format!("capture.bin.{pid}"));
    let mut reader = RecordReader::from_file(&child_path).unwrap();
    assert_eq!(reader.header().pid, pid);
    assert_eq!(reader.next_record().unwrap(), ReadOutcome::Allocation);
    assert_eq!(reader.allocation().unwrap().size, 16);
}

#[test]
fn repeated_code_objects_are_written_once() {
    let site = code("hot", "hot.py", 3);
    let with_one_push = capture(|writer| {
        writer.write_frame_push(1, &site, 0, false).unwrap();
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
    })
    .len();
    let with_many_pushes = capture(|writer| {
        for _ in 0..10 {
            writer.write_frame_push(1, &site, 0, false).unwrap();
        }
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x100, 1, None)
            .unwrap();
    })
    .len();
    // Nine extra pushes cost a few bytes each, not nine code objects.
    assert!(with_many_pushes < with_one_push + 9 * 8);
}
