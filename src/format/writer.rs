//! Single-writer append-only record encoder.
//!
//! One writer owns the sink for the lifetime of a capture. Per-thread
//! records are preceded by a CONTEXT_SWITCH whenever the emitting thread
//! changes, which keeps thread ids out of the per-record cost entirely.
//! Code objects and native frames are interned and written once; later
//! references are small delta-encoded integers.
//!
//! Access is serialized by the owner (the tracker holds the writer inside
//! its session mutex); the writer itself carries no lock.

use crate::ds::{FrameTree, Registry};
use crate::error::TrackerResult;
use crate::format::varint::{write_signed_varint, write_varint, DeltaCell};
use crate::format::{
    other_tag, AggregatedAllocation, AllocatorKind, CodeObject, HeaderInfo, ImageSegments,
    MAGIC, MAX_POPS_PER_RECORD, TAG_ALLOCATION, TAG_ALLOCATION_NATIVE_BIT, TAG_FRAME_POP,
    TAG_FRAME_PUSH, TAG_FRAME_PUSH_ENTRY_BIT, TRAILER_BYTE,
};
use crate::sink::Sink;
use crate::util::time::now_ms;

/// Frame identity used when pre-aggregated captures intern stacks.
type ManagedFrameKey = (u32, u32, bool);

/// Encoder for the capture record stream.
pub struct RecordWriter {
    sink: Box<dyn Sink>,
    header: HeaderInfo,
    buffer: Vec<u8>,

    last_tid: Option<u64>,
    address_cell: DeltaCell,
    code_object_cell: DeltaCell,
    native_ip_cell: DeltaCell,
    native_parent_cell: DeltaCell,
    native_leaf_cell: DeltaCell,

    code_objects: Registry<CodeObject>,
    native_ip_ids: Registry<usize>,
    native_tree: FrameTree,

    managed_frames: Registry<ManagedFrameKey>,
    managed_tree: FrameTree,
}

impl RecordWriter {
    /// Build a writer and put the header on the wire.
    pub fn new(sink: Box<dyn Sink>, mut header: HeaderInfo) -> TrackerResult<Self> {
        header.stats.start_ms = now_ms();
        let mut writer = Self {
            sink,
            header,
            buffer: Vec::with_capacity(64),
            last_tid: None,
            address_cell: DeltaCell::new(),
            code_object_cell: DeltaCell::new(),
            native_ip_cell: DeltaCell::new(),
            native_parent_cell: DeltaCell::new(),
            native_leaf_cell: DeltaCell::new(),
            code_objects: Registry::new(),
            native_ip_ids: Registry::new(),
            native_tree: FrameTree::new(),
            managed_frames: Registry::new(),
            managed_tree: FrameTree::new(),
        };
        writer.write_header(false)?;
        Ok(writer)
    }

    /// The header as it will be rewritten at shutdown.
    pub fn header(&self) -> &HeaderInfo {
        &self.header
    }

    /// Milliseconds elapsed since the capture started.
    pub fn ms_since_start(&self) -> u64 {
        (now_ms() - self.header.stats.start_ms).max(0) as u64
    }

    /// Write the header fields in declared order. With `seek_to_start`
    /// the sink is rewound first; returns false when it cannot seek.
    pub fn write_header(&mut self, seek_to_start: bool) -> TrackerResult<bool> {
        if seek_to_start && !self.sink.seek_to_start()? {
            return Ok(false);
        }
        let header = &self.header;
        let buffer = &mut self.buffer;
        buffer.clear();
        buffer.extend_from_slice(&MAGIC);
        buffer.extend_from_slice(&header.version.to_le_bytes());
        buffer.extend_from_slice(&header.runtime_version.to_le_bytes());
        buffer.push(header.native_traces as u8);
        buffer.push(header.file_format as u8);
        buffer.extend_from_slice(&header.stats.n_allocations.to_le_bytes());
        buffer.extend_from_slice(&header.stats.n_frames.to_le_bytes());
        buffer.extend_from_slice(&header.stats.start_ms.to_le_bytes());
        buffer.extend_from_slice(&header.stats.end_ms.to_le_bytes());
        push_cstr(buffer, &header.command_line);
        buffer.extend_from_slice(&header.pid.to_le_bytes());
        buffer.extend_from_slice(&header.main_tid.to_le_bytes());
        buffer.extend_from_slice(&header.skipped_frames_on_main_tid.to_le_bytes());
        buffer.push(header.runtime_allocator as u8);
        buffer.push(header.trace_runtime_allocators as u8);
        buffer.push(header.track_object_lifetimes as u8);
        self.sink.write_all(buffer)?;
        Ok(true)
    }

    /// Append the trailer, refresh the header stats in place when the
    /// sink can rewind, and flush.
    pub fn finalize(&mut self) -> TrackerResult<()> {
        self.buffer.clear();
        self.buffer.push(TRAILER_BYTE);
        let buffer = std::mem::take(&mut self.buffer);
        self.sink.write_all(&buffer)?;
        self.buffer = buffer;
        self.header.stats.end_ms = now_ms();
        // Best effort: a socket sink keeps its original header.
        let _ = self.write_header(true)?;
        self.sink.flush()?;
        Ok(())
    }

    fn emit(&mut self) -> TrackerResult<()> {
        self.sink.write_all(&self.buffer)?;
        Ok(())
    }

    /// Insert a CONTEXT_SWITCH when the emitting thread changed.
    fn update_thread(&mut self, tid: u64) -> TrackerResult<()> {
        if self.last_tid == Some(tid) {
            return Ok(());
        }
        self.last_tid = Some(tid);
        self.buffer.clear();
        self.buffer.push(other_tag::CONTEXT_SWITCH);
        self.buffer.extend_from_slice(&tid.to_le_bytes());
        self.emit()
    }

    /// Record one allocation event on `tid`.
    ///
    /// `size` is ignored on the wire for simple deallocators. When the
    /// event carries a native trace, `native_leaf` is the index returned
    /// by [`write_native_stack`].
    ///
    /// [`write_native_stack`]: RecordWriter::write_native_stack
    pub fn write_allocation(
        &mut self,
        tid: u64,
        allocator: AllocatorKind,
        address: usize,
        size: usize,
        native_leaf: Option<u32>,
    ) -> TrackerResult<()> {
        self.update_thread(tid)?;
        let mut tag = TAG_ALLOCATION | (allocator as u8);
        if native_leaf.is_some() {
            tag |= TAG_ALLOCATION_NATIVE_BIT;
        }
        let address_delta = self.address_cell.encode(address as u64);
        let native_delta =
            native_leaf.map(|leaf| self.native_leaf_cell.encode(u64::from(leaf)));
        self.buffer.clear();
        self.buffer.push(tag);
        write_signed_varint(&mut self.buffer, address_delta)?;
        if allocator.carries_size() {
            write_varint(&mut self.buffer, size as u64)?;
        }
        if let Some(delta) = native_delta {
            write_signed_varint(&mut self.buffer, delta)?;
        }
        self.header.stats.n_allocations += 1;
        self.emit()
    }

    /// Record a managed frame push on `tid`, interning the code object on
    /// first sight.
    pub fn write_frame_push(
        &mut self,
        tid: u64,
        code: &CodeObject,
        instruction_offset: u32,
        is_entry_frame: bool,
    ) -> TrackerResult<()> {
        self.update_thread(tid)?;
        let code_id = self.intern_code_object(code)?;
        let code_delta = self.code_object_cell.encode(u64::from(code_id));
        self.buffer.clear();
        let mut tag = TAG_FRAME_PUSH;
        if is_entry_frame {
            tag |= TAG_FRAME_PUSH_ENTRY_BIT;
        }
        self.buffer.push(tag);
        write_signed_varint(&mut self.buffer, code_delta)?;
        write_varint(&mut self.buffer, u64::from(instruction_offset))?;
        self.header.stats.n_frames += 1;
        self.emit()
    }

    /// Record `count` frame pops on `tid`, split into tag-packed records
    /// of at most 16 pops each.
    pub fn write_frame_pop(&mut self, tid: u64, mut count: u32) -> TrackerResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.update_thread(tid)?;
        while count > 0 {
            let batch = count.min(MAX_POPS_PER_RECORD);
            self.buffer.clear();
            self.buffer.push(TAG_FRAME_POP | (batch - 1) as u8);
            self.emit()?;
            count -= batch;
        }
        Ok(())
    }

    /// Record the current name of `tid`.
    pub fn write_thread_name(&mut self, tid: u64, name: &str) -> TrackerResult<()> {
        self.update_thread(tid)?;
        self.buffer.clear();
        self.buffer.push(other_tag::THREAD_RECORD);
        push_cstr(&mut self.buffer, name);
        self.emit()
    }

    /// Append a resident-set-size sample.
    pub fn write_memory_record(&mut self, rss_bytes: usize, ms_since_start: u64) -> TrackerResult<()> {
        self.buffer.clear();
        self.buffer.push(other_tag::MEMORY_RECORD);
        write_varint(&mut self.buffer, rss_bytes as u64)?;
        write_varint(&mut self.buffer, ms_since_start)?;
        self.emit()
    }

    /// Replace the recorded image map with `images`.
    pub fn write_mappings(&mut self, images: &[ImageSegments]) -> TrackerResult<()> {
        self.buffer.clear();
        self.buffer.push(other_tag::MEMORY_MAP_START);
        self.emit()?;
        for image in images {
            self.buffer.clear();
            self.buffer.push(other_tag::SEGMENT_HEADER);
            push_cstr(&mut self.buffer, &image.filename);
            write_varint(&mut self.buffer, image.segments.len() as u64)?;
            self.buffer
                .extend_from_slice(&(image.load_address as u64).to_le_bytes());
            self.emit()?;
            for segment in &image.segments {
                self.buffer.clear();
                self.buffer.push(other_tag::SEGMENT);
                self.buffer
                    .extend_from_slice(&(segment.vaddr as u64).to_le_bytes());
                write_varint(&mut self.buffer, segment.memsz as u64)?;
                self.emit()?;
            }
        }
        Ok(())
    }

    /// Intern a native stack (innermost instruction pointer first) into
    /// the native frame tree, emitting one NATIVE_TRACE_INDEX per new
    /// node, and return the leaf index.
    pub fn write_native_stack(&mut self, ips_innermost_first: &[usize]) -> TrackerResult<u32> {
        let Self {
            sink,
            buffer,
            native_ip_cell,
            native_parent_cell,
            native_ip_ids,
            native_tree,
            ..
        } = self;

        let mut index = 0u32;
        for &ip in ips_innermost_first.iter().rev() {
            let mut io: TrackerResult<()> = Ok(());
            let (ip_id, _) = native_ip_ids.get_or_register(&ip);
            index = native_tree.get_or_create_child(index, ip_id, |_, parent| {
                let ip_delta = native_ip_cell.encode(ip as u64);
                let parent_delta = native_parent_cell.encode(u64::from(parent));
                buffer.clear();
                buffer.push(other_tag::NATIVE_TRACE_INDEX);
                let encoded = write_signed_varint(buffer, ip_delta)
                    .and_then(|_| write_signed_varint(buffer, parent_delta));
                match encoded.map_err(Into::into).and_then(|_| sink.write_all(buffer)) {
                    Ok(()) => true,
                    Err(error) => {
                        io = Err(error);
                        false
                    }
                }
            });
            io?;
            if index == 0 {
                break;
            }
        }
        Ok(index)
    }

    /// Record an object birth or death on `tid`.
    pub fn write_object_record(
        &mut self,
        tid: u64,
        address: usize,
        created: bool,
    ) -> TrackerResult<()> {
        self.update_thread(tid)?;
        let address_delta = self.address_cell.encode(address as u64);
        self.buffer.clear();
        self.buffer.push(other_tag::OBJECT_RECORD);
        self.buffer.push(created as u8);
        write_signed_varint(&mut self.buffer, address_delta)?;
        self.emit()
    }

    /// Append a heap/RSS snapshot boundary (pre-aggregated captures).
    pub fn write_memory_snapshot(
        &mut self,
        ms_since_start: u64,
        rss_bytes: usize,
        heap_bytes: usize,
    ) -> TrackerResult<()> {
        self.buffer.clear();
        self.buffer.push(other_tag::MEMORY_SNAPSHOT);
        write_varint(&mut self.buffer, ms_since_start)?;
        write_varint(&mut self.buffer, rss_bytes as u64)?;
        write_varint(&mut self.buffer, heap_bytes as u64)?;
        self.emit()
    }

    /// Intern one managed frame for a pre-aggregated capture and return
    /// its dense frame id.
    pub fn write_frame_index(
        &mut self,
        code: &CodeObject,
        instruction_offset: u32,
        is_entry_frame: bool,
    ) -> TrackerResult<u32> {
        let code_id = self.intern_code_object(code)?;
        let key = (code_id, instruction_offset, is_entry_frame);
        let (frame_id, new) = self.managed_frames.get_or_register(&key);
        if new {
            self.buffer.clear();
            self.buffer.push(other_tag::FRAME_INDEX);
            write_varint(&mut self.buffer, u64::from(frame_id))?;
            write_varint(&mut self.buffer, u64::from(code_id))?;
            write_varint(&mut self.buffer, u64::from(instruction_offset))?;
            self.buffer.push(is_entry_frame as u8);
            self.emit()?;
        }
        Ok(frame_id)
    }

    /// Intern a whole managed stack (outermost frame id first) into the
    /// trace tree of a pre-aggregated capture; returns the leaf index.
    pub fn write_trace_index(&mut self, frame_ids_outermost_first: &[u32]) -> TrackerResult<u32> {
        let Self {
            sink,
            buffer,
            managed_tree,
            ..
        } = self;

        let mut index = 0u32;
        for &frame_id in frame_ids_outermost_first {
            let mut io: TrackerResult<()> = Ok(());
            index = managed_tree.get_or_create_child(index, frame_id, |frame_id, parent| {
                buffer.clear();
                buffer.push(other_tag::TRACE_INDEX);
                let encoded = write_varint(buffer, u64::from(frame_id))
                    .and_then(|_| write_varint(buffer, u64::from(parent)));
                match encoded.map_err(Into::into).and_then(|_| sink.write_all(buffer)) {
                    Ok(()) => true,
                    Err(error) => {
                        io = Err(error);
                        false
                    }
                }
            });
            io?;
            if index == 0 {
                break;
            }
        }
        Ok(index)
    }

    /// Append one pre-reduced per-location record.
    pub fn write_aggregated_allocation(
        &mut self,
        record: &AggregatedAllocation,
    ) -> TrackerResult<()> {
        self.buffer.clear();
        self.buffer.push(other_tag::AGGREGATED_ALLOCATION);
        self.buffer.extend_from_slice(&record.tid.to_le_bytes());
        self.buffer.push(record.allocator as u8);
        write_varint(&mut self.buffer, u64::from(record.frame_index))?;
        write_varint(&mut self.buffer, u64::from(record.native_frame_id))?;
        write_varint(&mut self.buffer, u64::from(record.native_segment_generation))?;
        write_varint(&mut self.buffer, record.n_allocations_in_high_water_mark as u64)?;
        write_varint(&mut self.buffer, record.n_allocations_leaked as u64)?;
        write_varint(&mut self.buffer, record.bytes_in_high_water_mark as u64)?;
        write_varint(&mut self.buffer, record.bytes_leaked as u64)?;
        self.emit()
    }

    fn intern_code_object(&mut self, code: &CodeObject) -> TrackerResult<u32> {
        let (code_id, new) = self.code_objects.get_or_register(code);
        if new {
            self.buffer.clear();
            self.buffer.push(other_tag::CODE_OBJECT);
            write_varint(&mut self.buffer, u64::from(code_id))?;
            push_cstr(&mut self.buffer, &code.function_name);
            push_cstr(&mut self.buffer, &code.filename);
            write_varint(&mut self.buffer, code.linetable.len() as u64)?;
            self.buffer.extend_from_slice(&code.linetable);
            write_signed_varint(&mut self.buffer, i64::from(code.firstlineno))?;
            self.emit()?;
        }
        Ok(code_id)
    }

    /// Flush buffered bytes to the sink.
    pub fn flush(&mut self) -> TrackerResult<()> {
        self.sink.flush()
    }

    /// Build the writer a forked child should continue with, or `None`
    /// when the sink cannot follow a fork.
    pub fn clone_in_child_process(&self) -> TrackerResult<Option<RecordWriter>> {
        let Some(sink) = self.sink.clone_in_child_process()? else {
            return Ok(None);
        };
        let mut header = self.header.clone();
        header.stats = Default::default();
        header.pid = unsafe { libc::getpid() };
        RecordWriter::new(sink, header).map(Some)
    }
}

fn push_cstr(buffer: &mut Vec<u8>, text: &str) {
    // Interior NULs would desynchronize the reader; drop them.
    buffer.extend(text.bytes().filter(|&b| b != 0));
    buffer.push(0);
}
