//! Capture replay.
//!
//! The reader is the inverse state machine of the writer: it reads tag
//! bytes, undoes the delta encoding with mirrored cells, rebuilds the
//! frame tree and the per-thread stacks, and surfaces one reconstructed
//! record per [`RecordReader::next_record`] call. Book-keeping records
//! (pushes, pops, context switches, code objects, segment maps) are
//! consumed silently; only allocations, memory samples, snapshots and
//! object records terminate a call.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;

use log::debug;

use crate::ds::{FrameTree, Registry};
use crate::error::{TrackerError, TrackerResult};
use crate::format::varint::{read_signed_varint, read_varint, DeltaCell};
use crate::format::{
    other_tag, AggregatedAllocation, Allocation, AllocatorKind, CodeObject, FileFormat, Frame,
    HeaderInfo, HeaderStats, ImageSegments, MemoryRecord, MemorySnapshot, ObjectRecord,
    RuntimeAllocatorKind, Segment, FORMAT_VERSION, MAGIC, TAG_ALLOCATION_NATIVE_BIT,
    TAG_FRAME_PUSH_ENTRY_BIT,
};

/// What a [`RecordReader::next_record`] call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Allocation,
    AggregatedAllocation,
    MemoryRecord,
    MemorySnapshot,
    ObjectRecord,
    EndOfFile,
}

enum Source {
    Buffer { data: Vec<u8>, pos: usize },
    Stream(Box<dyn Read>),
}

impl Source {
    fn at_end(&self) -> bool {
        match self {
            Source::Buffer { data, pos } => *pos >= data.len(),
            Source::Stream(_) => false,
        }
    }
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Buffer { data, pos } => {
                let remaining = &data[(*pos).min(data.len())..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *pos += n;
                Ok(n)
            }
            Source::Stream(stream) => stream.read(buf),
        }
    }
}

/// Replays a capture stream.
pub struct RecordReader {
    source: Source,
    header: HeaderInfo,

    address_cell: DeltaCell,
    code_object_cell: DeltaCell,
    native_ip_cell: DeltaCell,
    native_parent_cell: DeltaCell,
    native_leaf_cell: DeltaCell,

    code_objects: Vec<CodeObject>,
    frames: Registry<Frame>,
    frame_tree: FrameTree,
    frame_cache: HashMap<(u32, u32), u32>,
    /// `(code_object_id, instruction_offset, is_entry)` that first
    /// produced each frame id; the aggregation converter re-encodes
    /// stacks from these.
    frame_keys: Vec<(u32, u32, bool)>,

    /// `(instruction pointer, parent index)` per native node; 0 is the
    /// sentinel root.
    native_nodes: Vec<(usize, u32)>,

    current_tid: u64,
    stacks: HashMap<u64, Vec<u32>>,
    thread_names: HashMap<u64, String>,

    mappings: Vec<ImageSegments>,
    pending_image: Option<(ImageSegments, usize)>,
    native_segment_generation: u32,

    // Pre-aggregated captures.
    agg_frame_keys: Vec<(u32, u32, bool)>,
    agg_node_map: Vec<u32>,

    last_allocation: Option<Allocation>,
    last_aggregated: Option<AggregatedAllocation>,
    last_memory_record: Option<MemoryRecord>,
    last_memory_snapshot: Option<MemorySnapshot>,
    last_object_record: Option<ObjectRecord>,

    closed: bool,
}

impl RecordReader {
    /// Open a capture loaded fully in memory (a file). Trailing zero
    /// padding from the chunked file growth is scanned off the end.
    pub fn from_bytes(mut data: Vec<u8>) -> TrackerResult<Self> {
        let mut end = data.len();
        while end > 0 && data[end - 1] == 0 {
            end -= 1;
        }
        if end > 0 && data[end - 1] == super::TRAILER_BYTE {
            // Stop before the trailer; everything past it is padding.
            end -= 1;
        }
        data.truncate(end);
        Self::build(Source::Buffer { data, pos: 0 })
    }

    /// Open a capture file.
    pub fn from_file(path: impl AsRef<Path>) -> TrackerResult<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Read records from a live stream (socket); EOF is clean termination.
    pub fn from_stream(stream: Box<dyn Read>) -> TrackerResult<Self> {
        Self::build(Source::Stream(stream))
    }

    fn build(mut source: Source) -> TrackerResult<Self> {
        let header = read_header(&mut source)?;
        Ok(Self {
            source,
            header,
            address_cell: DeltaCell::new(),
            code_object_cell: DeltaCell::new(),
            native_ip_cell: DeltaCell::new(),
            native_parent_cell: DeltaCell::new(),
            native_leaf_cell: DeltaCell::new(),
            code_objects: Vec::new(),
            frames: Registry::new(),
            frame_tree: FrameTree::new(),
            frame_cache: HashMap::new(),
            frame_keys: Vec::new(),
            native_nodes: vec![(0, 0)],
            current_tid: 0,
            stacks: HashMap::new(),
            thread_names: HashMap::new(),
            mappings: Vec::new(),
            pending_image: None,
            native_segment_generation: 0,
            agg_frame_keys: Vec::new(),
            agg_node_map: vec![0],
            last_allocation: None,
            last_aggregated: None,
            last_memory_record: None,
            last_memory_snapshot: None,
            last_object_record: None,
            closed: false,
        })
    }

    pub fn header(&self) -> &HeaderInfo {
        &self.header
    }

    /// The most recently surfaced allocation.
    pub fn allocation(&self) -> Option<&Allocation> {
        self.last_allocation.as_ref()
    }

    pub fn aggregated_allocation(&self) -> Option<&AggregatedAllocation> {
        self.last_aggregated.as_ref()
    }

    pub fn memory_record(&self) -> Option<&MemoryRecord> {
        self.last_memory_record.as_ref()
    }

    pub fn memory_snapshot(&self) -> Option<&MemorySnapshot> {
        self.last_memory_snapshot.as_ref()
    }

    pub fn object_record(&self) -> Option<&ObjectRecord> {
        self.last_object_record.as_ref()
    }

    /// Latest recorded name for `tid`, if any.
    pub fn thread_name(&self, tid: u64) -> Option<&str> {
        self.thread_names.get(&tid).map(String::as_str)
    }

    /// Current image map as of the last MEMORY_MAP_START group.
    pub fn mappings(&self) -> &[ImageSegments] {
        &self.mappings
    }

    /// The managed frame tree leaf currently on top of `tid`'s stack.
    pub fn stack_leaf(&self, tid: u64) -> u32 {
        self.stacks
            .get(&tid)
            .and_then(|stack| stack.last().copied())
            .unwrap_or(0)
    }

    /// Resolve a managed stack by frame-tree leaf, innermost frame first.
    pub fn get_stack(&self, leaf: u32, max_frames: usize) -> Vec<Frame> {
        self.frame_tree
            .path_to_root(leaf, max_frames)
            .into_iter()
            .map(|frame_id| {
                self.frames.get(frame_id).cloned().unwrap_or_else(|| Frame {
                    function_name: "<unknown>".into(),
                    filename: "<unknown>".into(),
                    lineno: -1,
                    is_entry_frame: false,
                })
            })
            .collect()
    }

    /// Resolve a native stack by leaf index, innermost ip first.
    pub fn get_native_stack(&self, leaf: u32, max_frames: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut index = leaf as usize;
        while index != 0 && out.len() < max_frames {
            let Some(&(ip, parent)) = self.native_nodes.get(index) else {
                break;
            };
            out.push(ip);
            index = parent as usize;
        }
        out
    }

    /// Read until the next surfaced record.
    ///
    /// A format error closes the reader; later calls keep returning
    /// [`ReadOutcome::EndOfFile`].
    pub fn next_record(&mut self) -> TrackerResult<ReadOutcome> {
        if self.closed {
            return Ok(ReadOutcome::EndOfFile);
        }
        loop {
            if self.source.at_end() {
                self.closed = true;
                return Ok(ReadOutcome::EndOfFile);
            }
            let mut tag = [0u8; 1];
            match self.source.read(&mut tag) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(ReadOutcome::EndOfFile);
                }
                Ok(_) => {}
                Err(error) => {
                    self.closed = true;
                    return Err(error.into());
                }
            }
            match self.dispatch(tag[0]) {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => continue,
                Err(TrackerError::Io(error))
                    if error.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    // A record was cut off mid-write; at most one event
                    // is lost.
                    debug!("capture ends mid-record; treating as end of file");
                    self.closed = true;
                    return Ok(ReadOutcome::EndOfFile);
                }
                Err(error) => {
                    self.closed = true;
                    return Err(error);
                }
            }
        }
    }

    fn dispatch(&mut self, tag: u8) -> TrackerResult<Option<ReadOutcome>> {
        if tag & 0x80 != 0 {
            return self.parse_allocation(tag).map(Some);
        }
        if tag & 0b0100_0000 != 0 {
            self.parse_frame_push(tag)?;
            return Ok(None);
        }
        if tag & 0b0010_0000 != 0 {
            self.parse_frame_pop(tag);
            return Ok(None);
        }
        match tag {
            0 => Err(TrackerError::format("unexpected zero byte in stream")),
            other_tag::TRAILER => {
                self.closed = true;
                Ok(Some(ReadOutcome::EndOfFile))
            }
            other_tag::MEMORY_RECORD => {
                let rss_bytes = read_varint(&mut self.source)? as usize;
                let ms_since_start = read_varint(&mut self.source)?;
                self.last_memory_record = Some(MemoryRecord {
                    ms_since_start,
                    rss_bytes,
                });
                Ok(Some(ReadOutcome::MemoryRecord))
            }
            other_tag::CONTEXT_SWITCH => {
                self.current_tid = read_u64(&mut self.source)?;
                Ok(None)
            }
            other_tag::THREAD_RECORD => {
                let name = read_cstr(&mut self.source)?;
                self.thread_names.insert(self.current_tid, name);
                Ok(None)
            }
            other_tag::MEMORY_MAP_START => {
                self.mappings.clear();
                self.pending_image = None;
                self.native_segment_generation += 1;
                Ok(None)
            }
            other_tag::SEGMENT_HEADER => {
                let filename = read_cstr(&mut self.source)?;
                let count = read_varint(&mut self.source)? as usize;
                let load_address = read_u64(&mut self.source)? as usize;
                let image = ImageSegments {
                    filename,
                    load_address,
                    segments: Vec::with_capacity(count.min(1024)),
                };
                if count == 0 {
                    self.mappings.push(image);
                } else {
                    self.pending_image = Some((image, count));
                }
                Ok(None)
            }
            other_tag::SEGMENT => {
                let vaddr = read_u64(&mut self.source)? as usize;
                let memsz = read_varint(&mut self.source)? as usize;
                let Some((image, remaining)) = self.pending_image.as_mut() else {
                    return Err(TrackerError::format("segment without a segment header"));
                };
                image.segments.push(Segment { vaddr, memsz });
                *remaining -= 1;
                if *remaining == 0 {
                    let (image, _) = self.pending_image.take().expect("checked above");
                    self.mappings.push(image);
                }
                Ok(None)
            }
            other_tag::NATIVE_TRACE_INDEX => {
                let ip = self.native_ip_cell.decode(read_signed_varint(&mut self.source)?);
                let parent = self
                    .native_parent_cell
                    .decode(read_signed_varint(&mut self.source)?);
                if parent as usize >= self.native_nodes.len() {
                    return Err(TrackerError::format("native trace parent out of range"));
                }
                self.native_nodes.push((ip as usize, parent as u32));
                Ok(None)
            }
            other_tag::CODE_OBJECT => {
                let code_id = read_varint(&mut self.source)? as usize;
                let function_name = read_cstr(&mut self.source)?;
                let filename = read_cstr(&mut self.source)?;
                let table_len = read_varint(&mut self.source)? as usize;
                let mut linetable = vec![0u8; table_len];
                self.source.read_exact(&mut linetable)?;
                let firstlineno = read_signed_varint(&mut self.source)? as i32;
                if code_id != self.code_objects.len() {
                    return Err(TrackerError::format("code object ids out of order"));
                }
                self.code_objects.push(CodeObject {
                    function_name,
                    filename,
                    linetable,
                    firstlineno,
                });
                Ok(None)
            }
            other_tag::OBJECT_RECORD => {
                let mut flag = [0u8; 1];
                self.source.read_exact(&mut flag)?;
                let address = self
                    .address_cell
                    .decode(read_signed_varint(&mut self.source)?);
                self.last_object_record = Some(ObjectRecord {
                    tid: self.current_tid,
                    address: address as usize,
                    created: flag[0] != 0,
                });
                Ok(Some(ReadOutcome::ObjectRecord))
            }
            other_tag::MEMORY_SNAPSHOT => {
                let ms_since_start = read_varint(&mut self.source)?;
                let rss_bytes = read_varint(&mut self.source)? as usize;
                let heap_bytes = read_varint(&mut self.source)? as usize;
                self.last_memory_snapshot = Some(MemorySnapshot {
                    ms_since_start,
                    rss_bytes,
                    heap_bytes,
                });
                Ok(Some(ReadOutcome::MemorySnapshot))
            }
            other_tag::FRAME_INDEX => {
                let frame_id = read_varint(&mut self.source)? as usize;
                let code_id = read_varint(&mut self.source)? as u32;
                let offset = read_varint(&mut self.source)? as u32;
                let mut entry = [0u8; 1];
                self.source.read_exact(&mut entry)?;
                if frame_id != self.agg_frame_keys.len() {
                    return Err(TrackerError::format("frame index ids out of order"));
                }
                self.agg_frame_keys.push((code_id, offset, entry[0] != 0));
                Ok(None)
            }
            other_tag::TRACE_INDEX => {
                let frame_id = read_varint(&mut self.source)? as usize;
                let parent = read_varint(&mut self.source)? as usize;
                let Some(&(code_id, offset, entry)) = self.agg_frame_keys.get(frame_id) else {
                    return Err(TrackerError::format("trace index references unknown frame"));
                };
                let Some(&tree_parent) = self.agg_node_map.get(parent) else {
                    return Err(TrackerError::format("trace index parent out of range"));
                };
                let resolved = self.resolve_frame(code_id, offset, entry);
                let tree_index =
                    self.frame_tree
                        .get_or_create_child(tree_parent, resolved, |_, _| true);
                self.agg_node_map.push(tree_index);
                Ok(None)
            }
            other_tag::AGGREGATED_ALLOCATION => {
                let tid = read_u64(&mut self.source)?;
                let mut allocator = [0u8; 1];
                self.source.read_exact(&mut allocator)?;
                let allocator = AllocatorKind::from_u8(allocator[0])?;
                let leaf = read_varint(&mut self.source)? as usize;
                let native_frame_id = read_varint(&mut self.source)? as u32;
                let native_segment_generation = read_varint(&mut self.source)? as u32;
                let n_allocations_in_high_water_mark = read_varint(&mut self.source)? as usize;
                let n_allocations_leaked = read_varint(&mut self.source)? as usize;
                let bytes_in_high_water_mark = read_varint(&mut self.source)? as usize;
                let bytes_leaked = read_varint(&mut self.source)? as usize;
                let Some(&frame_index) = self.agg_node_map.get(leaf) else {
                    return Err(TrackerError::format(
                        "aggregated allocation references unknown trace",
                    ));
                };
                self.last_aggregated = Some(AggregatedAllocation {
                    tid,
                    allocator,
                    frame_index,
                    native_frame_id,
                    native_segment_generation,
                    n_allocations_in_high_water_mark,
                    n_allocations_leaked,
                    bytes_in_high_water_mark,
                    bytes_leaked,
                });
                Ok(Some(ReadOutcome::AggregatedAllocation))
            }
            unknown => Err(TrackerError::format(format!(
                "unknown record tag {unknown:#x}"
            ))),
        }
    }

    fn parse_allocation(&mut self, tag: u8) -> TrackerResult<ReadOutcome> {
        let has_native = tag & TAG_ALLOCATION_NATIVE_BIT != 0;
        let allocator = AllocatorKind::from_u8(tag & 0x0f)?;
        let address = self
            .address_cell
            .decode(read_signed_varint(&mut self.source)?) as usize;
        let size = if allocator.carries_size() {
            read_varint(&mut self.source)? as usize
        } else {
            0
        };
        let native_frame_id = if has_native {
            self.native_leaf_cell
                .decode(read_signed_varint(&mut self.source)?) as u32
        } else {
            0
        };
        self.last_allocation = Some(Allocation {
            tid: self.current_tid,
            address,
            size,
            allocator,
            native_frame_id,
            frame_index: self.stack_leaf(self.current_tid),
            native_segment_generation: self.native_segment_generation,
            n_allocations: 1,
        });
        Ok(ReadOutcome::Allocation)
    }

    fn parse_frame_push(&mut self, tag: u8) -> TrackerResult<()> {
        let is_entry = tag & TAG_FRAME_PUSH_ENTRY_BIT != 0;
        let code_id = self
            .code_object_cell
            .decode(read_signed_varint(&mut self.source)?) as u32;
        let offset = read_varint(&mut self.source)? as u32;
        let frame_id = self.resolve_frame(code_id, offset, is_entry);
        let parent = self.stack_leaf(self.current_tid);
        let leaf = self
            .frame_tree
            .get_or_create_child(parent, frame_id, |_, _| true);
        self.stacks
            .entry(self.current_tid)
            .or_default()
            .push(leaf);
        Ok(())
    }

    fn parse_frame_pop(&mut self, tag: u8) {
        let count = u32::from(tag & 0x0f) + 1;
        if let Some(stack) = self.stacks.get_mut(&self.current_tid) {
            for _ in 0..count {
                if stack.pop().is_none() {
                    debug!(
                        "frame pop on empty stack for thread {}",
                        self.current_tid
                    );
                    break;
                }
            }
        }
    }

    /// Map `(code object, instruction offset)` to a dense resolved frame
    /// id, decoding the linetable on first sight of the pair.
    fn resolve_frame(&mut self, code_id: u32, offset: u32, is_entry: bool) -> u32 {
        if let Some(&frame_id) = self.frame_cache.get(&(code_id, offset)) {
            return frame_id;
        }
        let frame = match self.code_objects.get(code_id as usize) {
            Some(code) => {
                let lineno = self
                    .header
                    .linetable_format()
                    .decode(&code.linetable, code.firstlineno, offset)
                    .map(|position| position.lineno)
                    .unwrap_or(code.firstlineno);
                Frame {
                    function_name: code.function_name.clone(),
                    filename: code.filename.clone(),
                    lineno,
                    is_entry_frame: is_entry,
                }
            }
            None => Frame {
                function_name: "<unknown>".into(),
                filename: "<unknown>".into(),
                lineno: -1,
                is_entry_frame: is_entry,
            },
        };
        let (frame_id, new) = self.frames.get_or_register(&frame);
        if new {
            debug_assert_eq!(frame_id as usize, self.frame_keys.len());
            self.frame_keys.push((code_id, offset, is_entry));
        }
        self.frame_cache.insert((code_id, offset), frame_id);
        frame_id
    }

    /// The wire-level identity behind a resolved frame id.
    pub fn frame_key(&self, frame_id: u32) -> Option<(u32, u32, bool)> {
        self.frame_keys.get(frame_id as usize).copied()
    }

    /// Code object by dense id.
    pub fn code_object(&self, code_id: u32) -> Option<&CodeObject> {
        self.code_objects.get(code_id as usize)
    }

    /// Frame ids on the path from `leaf` to the root, innermost first.
    pub fn stack_frame_ids(&self, leaf: u32, max_frames: usize) -> Vec<u32> {
        self.frame_tree.path_to_root(leaf, max_frames)
    }
}

fn read_u64<R: Read>(input: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i32<R: Read>(input: &mut R) -> io::Result<i32> {
    Ok(read_u32(input)? as i32)
}

fn read_i64<R: Read>(input: &mut R) -> io::Result<i64> {
    Ok(read_u64(input)? as i64)
}

fn read_u8<R: Read>(input: &mut R) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_cstr<R: Read>(input: &mut R) -> TrackerResult<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = read_u8(input)?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|_| TrackerError::format("record string is not UTF-8"))
}

fn read_header(source: &mut Source) -> TrackerResult<HeaderInfo> {
    let mut magic = [0u8; 6];
    source.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(TrackerError::format("bad magic; not a capture file"));
    }
    let version = read_u32(source)?;
    if version != FORMAT_VERSION {
        return Err(TrackerError::format(format!(
            "unsupported capture version {version}"
        )));
    }
    let runtime_version = read_u32(source)?;
    let native_traces = read_u8(source)? != 0;
    let file_format = FileFormat::from_u8(read_u8(source)?)?;
    let stats = HeaderStats {
        n_allocations: read_u64(source)?,
        n_frames: read_u64(source)?,
        start_ms: read_i64(source)?,
        end_ms: read_i64(source)?,
    };
    let command_line = read_cstr(source)?;
    let pid = read_i32(source)?;
    let main_tid = read_u64(source)?;
    let skipped_frames_on_main_tid = read_u64(source)?;
    let runtime_allocator = RuntimeAllocatorKind::from_u8(read_u8(source)?)?;
    let trace_runtime_allocators = read_u8(source)? != 0;
    let track_object_lifetimes = read_u8(source)? != 0;
    Ok(HeaderInfo {
        version,
        runtime_version,
        native_traces,
        file_format,
        stats,
        command_line,
        pid,
        main_tid,
        skipped_frames_on_main_tid,
        runtime_allocator,
        trace_runtime_allocators,
        track_object_lifetimes,
    })
}
