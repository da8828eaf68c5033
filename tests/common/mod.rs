//! Shared test doubles: a scripted managed runtime, live fake frames,
//! and a sink whose bytes stay reachable after the tracker consumes it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use heaptrail::error::TrackerResult;
use heaptrail::format::{CodeObject, RuntimeAllocatorKind};
use heaptrail::runtime::{FrameRef, Runtime, RuntimeFrame, TaskHandle, ThreadSnapshot};
use heaptrail::sink::Sink;

/// Version triple helper matching the header encoding.
pub fn runtime_version(major: u32, minor: u32) -> u32 {
    (major << 16) | (minor << 8)
}

/// A live frame whose instruction offset tests can move.
pub struct FakeFrame {
    code: Arc<CodeObject>,
    offset: AtomicU32,
    entry: bool,
}

impl FakeFrame {
    fn build(function_name: &str, filename: &str, firstlineno: i32, entry: bool) -> Arc<Self> {
        Arc::new(Self {
            code: Arc::new(CodeObject {
                function_name: function_name.into(),
                filename: filename.into(),
                linetable: Vec::new(),
                firstlineno,
            }),
            offset: AtomicU32::new(0),
            entry,
        })
    }

    /// A frame whose code object carries a legacy byte-delta linetable,
    /// so different instruction offsets resolve to different lines.
    pub fn with_linetable(
        function_name: &str,
        filename: &str,
        firstlineno: i32,
        pairs: &[(u8, i8)],
    ) -> Arc<Self> {
        Arc::new(Self {
            code: Arc::new(CodeObject {
                function_name: function_name.into(),
                filename: filename.into(),
                linetable: pairs.iter().flat_map(|&(b, l)| [b, l as u8]).collect(),
                firstlineno,
            }),
            offset: AtomicU32::new(0),
            entry: false,
        })
    }

    pub fn new(function_name: &str, filename: &str, firstlineno: i32) -> Arc<Self> {
        Self::build(function_name, filename, firstlineno, false)
    }

    pub fn entry(function_name: &str, filename: &str, firstlineno: i32) -> Arc<Self> {
        Self::build(function_name, filename, firstlineno, true)
    }

    pub fn advance_to(&self, offset: u32) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

impl RuntimeFrame for FakeFrame {
    fn code_object(&self) -> Arc<CodeObject> {
        self.code.clone()
    }

    fn instruction_offset(&self) -> u32 {
        self.offset.load(Ordering::Relaxed)
    }

    fn is_entry_frame(&self) -> bool {
        self.entry
    }
}

/// A single-threaded scripted runtime.
pub struct FakeRuntime {
    pub tid: u64,
    pub initial_stack: Mutex<Vec<FrameRef>>,
    pub thread_name: Option<String>,
}

impl FakeRuntime {
    pub fn new(tid: u64) -> Arc<Self> {
        Arc::new(Self {
            tid,
            initial_stack: Mutex::new(Vec::new()),
            thread_name: None,
        })
    }

    pub fn with_initial_stack(tid: u64, stack: Vec<FrameRef>) -> Arc<Self> {
        Arc::new(Self {
            tid,
            initial_stack: Mutex::new(stack),
            thread_name: None,
        })
    }
}

impl Runtime for FakeRuntime {
    fn version(&self) -> u32 {
        runtime_version(3, 8)
    }

    fn allocator_kind(&self) -> RuntimeAllocatorKind {
        RuntimeAllocatorKind::SmallObjectPools
    }

    fn current_thread_id(&self) -> u64 {
        self.tid
    }

    fn enumerate_threads(&self) -> Vec<ThreadSnapshot> {
        vec![ThreadSnapshot {
            tid: self.tid,
            stack: self.initial_stack.lock().unwrap().clone(),
            name: self.thread_name.clone(),
        }]
    }

    fn current_thread_stack(&self) -> Vec<FrameRef> {
        self.initial_stack.lock().unwrap().clone()
    }

    fn with_threads_paused(&self, f: &mut dyn FnMut()) {
        f();
    }

    fn install_profile_hook(&self) {}

    fn remove_profile_hook(&self) {}
}

/// A coroutine object carrying its logical thread id.
#[derive(Default)]
pub struct FakeTask {
    stored: Mutex<Option<u64>>,
}

impl TaskHandle for FakeTask {
    fn stored_thread_id(&self) -> Option<u64> {
        *self.stored.lock().unwrap()
    }

    fn store_thread_id(&self, tid: u64) {
        *self.stored.lock().unwrap() = Some(tid);
    }
}

/// Sink over a shared buffer, so tests can read the capture back after
/// handing ownership to the tracker.
#[derive(Clone, Default)]
pub struct SharedSink {
    buffer: Arc<Mutex<Vec<u8>>>,
    cursor: Arc<Mutex<usize>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }
}

impl Sink for SharedSink {
    fn write_all(&mut self, data: &[u8]) -> TrackerResult<()> {
        let mut buffer = self.buffer.lock().unwrap();
        let mut cursor = self.cursor.lock().unwrap();
        let end = *cursor + data.len();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[*cursor..end].copy_from_slice(data);
        *cursor = end;
        Ok(())
    }

    fn flush(&mut self) -> TrackerResult<()> {
        Ok(())
    }

    fn seek_to_start(&mut self) -> TrackerResult<bool> {
        *self.cursor.lock().unwrap() = 0;
        Ok(true)
    }

    fn clone_in_child_process(&self) -> TrackerResult<Option<Box<dyn Sink>>> {
        Ok(Some(Box::new(SharedSink::new())))
    }
}
