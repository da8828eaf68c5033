//! Benchmark for the record writer hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use heaptrail::format::writer::RecordWriter;
use heaptrail::format::{
    AllocatorKind, CodeObject, FileFormat, HeaderInfo, HeaderStats, RuntimeAllocatorKind,
    FORMAT_VERSION,
};
use heaptrail::sink::NullSink;

fn bench_header() -> HeaderInfo {
    HeaderInfo {
        version: FORMAT_VERSION,
        runtime_version: (3 << 16) | (8 << 8),
        native_traces: false,
        file_format: FileFormat::AllAllocations,
        stats: HeaderStats::default(),
        command_line: "bench".into(),
        pid: 1,
        main_tid: 1,
        skipped_frames_on_main_tid: 0,
        runtime_allocator: RuntimeAllocatorKind::SystemMalloc,
        trace_runtime_allocators: false,
        track_object_lifetimes: false,
    }
}

fn bench_allocation_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_1000_allocations");

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            let mut writer =
                RecordWriter::new(Box::new(NullSink::new()), bench_header()).unwrap();
            for i in 0..1000usize {
                writer
                    .write_allocation(1, AllocatorKind::Malloc, 0x1000 + i * 16, 64, None)
                    .unwrap();
            }
            black_box(writer);
        });
    });

    group.bench_function("alternating_threads", |b| {
        b.iter(|| {
            let mut writer =
                RecordWriter::new(Box::new(NullSink::new()), bench_header()).unwrap();
            for i in 0..1000usize {
                let tid = 1 + (i % 2) as u64;
                writer
                    .write_allocation(tid, AllocatorKind::Malloc, 0x1000 + i * 16, 64, None)
                    .unwrap();
            }
            black_box(writer);
        });
    });

    group.finish();
}

fn bench_frame_churn(c: &mut Criterion) {
    let code = CodeObject {
        function_name: "hot_function".into(),
        filename: "hot.py".into(),
        linetable: vec![8, 1, 8, 1],
        firstlineno: 10,
    };
    c.bench_function("push_alloc_pop_cycle", |b| {
        b.iter(|| {
            let mut writer =
                RecordWriter::new(Box::new(NullSink::new()), bench_header()).unwrap();
            for i in 0..500usize {
                writer.write_frame_push(1, &code, (i % 32) as u32, false).unwrap();
                writer
                    .write_allocation(1, AllocatorKind::Malloc, 0x1000 + i * 16, 64, None)
                    .unwrap();
                writer.write_frame_pop(1, 1).unwrap();
            }
            black_box(writer);
        });
    });
}

criterion_group!(benches, bench_allocation_stream, bench_frame_churn);
criterion_main!(benches);
