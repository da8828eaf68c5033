//! Capture file format: record grammar, tag encoding, header layout.
//!
//! A capture is a header followed by a stream of tagged records and a
//! one-byte trailer. The file sink grows the file in 4 KiB-aligned chunks,
//! so a killed process leaves a zero-padded tail; readers scan backwards
//! past the zeros to the trailer. All fixed-width integers are little
//! endian; everything else is LEB128 varint, zigzag for signed values, and
//! the high-traffic fields are delta-encoded against the previous value.
//!
//! Tag byte layout:
//!
//! | bits        | record     | payload in tag                       |
//! |-------------|------------|--------------------------------------|
//! | `1xxxxxxx`  | ALLOCATION | bit 6 native-trace bit, low 4 bits allocator |
//! | `01xxxxxx`  | FRAME_PUSH | bit 0 entry-frame bit                |
//! | `001xxxxx`  | FRAME_POP  | low 4 bits count-1 (1..=16)          |
//! | `000xxxxx`  | other      | record type enumerator               |
//!
//! The `other` space starts at 1 so that a zero byte can never be a valid
//! record tag.

pub mod linetable;
pub mod reader;
pub mod varint;
pub mod writer;

pub use linetable::{LinePosition, LinetableFormat};
pub use reader::{ReadOutcome, RecordReader};
pub use writer::RecordWriter;

use crate::error::{TrackerError, TrackerResult};

/// Magic bytes at offset 0 of every capture.
pub const MAGIC: [u8; 6] = *b"heaptr";

/// Capture format version written to the header.
pub const FORMAT_VERSION: u32 = 1;

/// The trailer byte; non-zero so it survives the zero-padding scan.
pub const TRAILER_BYTE: u8 = other_tag::TRAILER;

/// Tag values for records without their own high-bit namespace.
pub(crate) mod other_tag {
    pub const TRAILER: u8 = 0x01;
    pub const MEMORY_RECORD: u8 = 0x02;
    pub const CONTEXT_SWITCH: u8 = 0x03;
    pub const THREAD_RECORD: u8 = 0x04;
    pub const MEMORY_MAP_START: u8 = 0x05;
    pub const SEGMENT_HEADER: u8 = 0x06;
    pub const SEGMENT: u8 = 0x07;
    pub const NATIVE_TRACE_INDEX: u8 = 0x08;
    pub const CODE_OBJECT: u8 = 0x09;
    pub const OBJECT_RECORD: u8 = 0x0A;
    pub const MEMORY_SNAPSHOT: u8 = 0x0B;
    pub const AGGREGATED_ALLOCATION: u8 = 0x0C;
    pub const FRAME_INDEX: u8 = 0x0D;
    pub const TRACE_INDEX: u8 = 0x0E;
}

pub(crate) const TAG_ALLOCATION: u8 = 0b1000_0000;
pub(crate) const TAG_ALLOCATION_NATIVE_BIT: u8 = 0b0100_0000;
pub(crate) const TAG_FRAME_PUSH: u8 = 0b0100_0000;
pub(crate) const TAG_FRAME_PUSH_ENTRY_BIT: u8 = 0b0000_0001;
pub(crate) const TAG_FRAME_POP: u8 = 0b0010_0000;

/// Largest pop count a single FRAME_POP record can carry.
pub(crate) const MAX_POPS_PER_RECORD: u32 = 16;

/// The allocator (or deallocator) behind an allocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocatorKind {
    Malloc = 0,
    Free = 1,
    Calloc = 2,
    Realloc = 3,
    PosixMemalign = 4,
    AlignedAlloc = 5,
    Memalign = 6,
    Valloc = 7,
    Pvalloc = 8,
    Mmap = 9,
    Munmap = 10,
    RuntimeMalloc = 11,
    RuntimeCalloc = 12,
    RuntimeRealloc = 13,
    RuntimeFree = 14,
}

/// Behavioral class of an [`AllocatorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorClass {
    /// malloc family: single pointer, all-or-nothing free.
    SimpleAllocator,
    SimpleDeallocator,
    /// mmap family: a byte range that may be partially freed.
    RangedAllocator,
    RangedDeallocator,
}

impl AllocatorKind {
    pub fn class(self) -> AllocatorClass {
        match self {
            AllocatorKind::Malloc
            | AllocatorKind::Calloc
            | AllocatorKind::Realloc
            | AllocatorKind::PosixMemalign
            | AllocatorKind::AlignedAlloc
            | AllocatorKind::Memalign
            | AllocatorKind::Valloc
            | AllocatorKind::Pvalloc
            | AllocatorKind::RuntimeMalloc
            | AllocatorKind::RuntimeCalloc
            | AllocatorKind::RuntimeRealloc => AllocatorClass::SimpleAllocator,
            AllocatorKind::Free | AllocatorKind::RuntimeFree => {
                AllocatorClass::SimpleDeallocator
            }
            AllocatorKind::Mmap => AllocatorClass::RangedAllocator,
            AllocatorKind::Munmap => AllocatorClass::RangedDeallocator,
        }
    }

    pub fn is_allocator(self) -> bool {
        matches!(
            self.class(),
            AllocatorClass::SimpleAllocator | AllocatorClass::RangedAllocator
        )
    }

    pub fn is_deallocator(self) -> bool {
        !self.is_allocator()
    }

    /// Whether the on-wire record carries a size field.
    ///
    /// Simple deallocators omit it; ranged deallocators must carry the
    /// unmapped length.
    pub(crate) fn carries_size(self) -> bool {
        self.class() != AllocatorClass::SimpleDeallocator
    }

    pub(crate) fn from_u8(raw: u8) -> TrackerResult<Self> {
        match raw {
            0 => Ok(AllocatorKind::Malloc),
            1 => Ok(AllocatorKind::Free),
            2 => Ok(AllocatorKind::Calloc),
            3 => Ok(AllocatorKind::Realloc),
            4 => Ok(AllocatorKind::PosixMemalign),
            5 => Ok(AllocatorKind::AlignedAlloc),
            6 => Ok(AllocatorKind::Memalign),
            7 => Ok(AllocatorKind::Valloc),
            8 => Ok(AllocatorKind::Pvalloc),
            9 => Ok(AllocatorKind::Mmap),
            10 => Ok(AllocatorKind::Munmap),
            11 => Ok(AllocatorKind::RuntimeMalloc),
            12 => Ok(AllocatorKind::RuntimeCalloc),
            13 => Ok(AllocatorKind::RuntimeRealloc),
            14 => Ok(AllocatorKind::RuntimeFree),
            other => Err(TrackerError::format(format!(
                "unknown allocator enumerator {other}"
            ))),
        }
    }
}

/// On-disk layout of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileFormat {
    /// Every allocation event, in source order.
    AllAllocations = 0,
    /// Pre-reduced per-location totals plus memory snapshots.
    AggregatedAllocations = 1,
}

impl FileFormat {
    pub(crate) fn from_u8(raw: u8) -> TrackerResult<Self> {
        match raw {
            0 => Ok(FileFormat::AllAllocations),
            1 => Ok(FileFormat::AggregatedAllocations),
            other => Err(TrackerError::format(format!(
                "unknown file format {other}"
            ))),
        }
    }
}

/// Which small-object allocator the traced runtime was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeAllocatorKind {
    SystemMalloc = 0,
    SmallObjectPools = 1,
    Other = 2,
}

impl RuntimeAllocatorKind {
    pub(crate) fn from_u8(raw: u8) -> TrackerResult<Self> {
        match raw {
            0 => Ok(RuntimeAllocatorKind::SystemMalloc),
            1 => Ok(RuntimeAllocatorKind::SmallObjectPools),
            2 => Ok(RuntimeAllocatorKind::Other),
            other => Err(TrackerError::format(format!(
                "unknown runtime allocator kind {other}"
            ))),
        }
    }
}

/// Running totals stored in the header; rewritten at deactivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderStats {
    pub n_allocations: u64,
    pub n_frames: u64,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Everything the header carries besides the magic and version.
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub version: u32,
    /// `major << 16 | minor << 8 | patch` of the traced runtime; selects
    /// the linetable decoder.
    pub runtime_version: u32,
    pub native_traces: bool,
    pub file_format: FileFormat,
    pub stats: HeaderStats,
    pub command_line: String,
    pub pid: i32,
    pub main_tid: u64,
    pub skipped_frames_on_main_tid: u64,
    pub runtime_allocator: RuntimeAllocatorKind,
    pub trace_runtime_allocators: bool,
    pub track_object_lifetimes: bool,
}

impl HeaderInfo {
    /// Linetable decoder matching `runtime_version`.
    pub fn linetable_format(&self) -> LinetableFormat {
        LinetableFormat::for_runtime_version(self.runtime_version)
    }
}

/// A fully resolved managed frame.
///
/// Identity is value equality of the two strings plus the line number; the
/// entry bit marks the first managed frame entered from native code and
/// does not participate in identity.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function_name: String,
    pub filename: String,
    pub lineno: i32,
    pub is_entry_frame: bool,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.function_name == other.function_name
            && self.filename == other.filename
            && self.lineno == other.lineno
    }
}

impl Eq for Frame {}

impl std::hash::Hash for Frame {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.function_name.hash(state);
        self.filename.hash(state);
        self.lineno.hash(state);
    }
}

/// Source-level metadata for a compiled function body.
///
/// Frames on the wire reference a code object id plus an instruction
/// offset; line numbers are recovered by decoding `linetable` at that
/// offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeObject {
    pub function_name: String,
    pub filename: String,
    pub linetable: Vec<u8>,
    pub firstlineno: i32,
}

/// One loaded image and its mapped segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegments {
    pub filename: String,
    pub load_address: usize,
    pub segments: Vec<Segment>,
}

/// A single mapped segment of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub memsz: usize,
}

/// A reconstructed allocation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub tid: u64,
    pub address: usize,
    pub size: usize,
    pub allocator: AllocatorKind,
    /// Leaf in the native frame tree, 0 when no native trace was captured.
    pub native_frame_id: u32,
    /// Leaf in the managed frame tree for the emitting thread.
    pub frame_index: u32,
    /// Which image-map generation the native trace belongs to.
    pub native_segment_generation: u32,
    /// Number of source events folded into this value (1 for raw events).
    pub n_allocations: usize,
}

/// A pre-reduced per-location record from an aggregated capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedAllocation {
    pub tid: u64,
    pub allocator: AllocatorKind,
    pub frame_index: u32,
    pub native_frame_id: u32,
    pub native_segment_generation: u32,
    pub n_allocations_in_high_water_mark: usize,
    pub n_allocations_leaked: usize,
    pub bytes_in_high_water_mark: usize,
    pub bytes_leaked: usize,
}

/// Periodic resident-set-size sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRecord {
    pub ms_since_start: u64,
    pub rss_bytes: usize,
}

/// Heap/RSS state at an aggregation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub ms_since_start: u64,
    pub rss_bytes: usize,
    pub heap_bytes: usize,
}

/// Object birth/death notification (when lifetimes are tracked).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    pub tid: u64,
    pub address: usize,
    pub created: bool,
}
