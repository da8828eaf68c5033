//! Abstract interface to the traced managed runtime.
//!
//! The profiler never links against a concrete runtime; it consumes a
//! narrow capability set: enumerate threads and their frame chains,
//! install a per-thread profile callback that reports CALL/RETURN events,
//! optionally hook the runtime's own small-object allocator, and learn
//! about coroutine context switches. Test suites drive the engine with
//! in-process fakes implementing these traits.

pub mod shadow;

use std::sync::Arc;

use crate::format::{CodeObject, RuntimeAllocatorKind};

/// A live managed frame owned by the runtime.
///
/// The shadow stack holds references to live frames so the instruction
/// offset of the top frame can be refreshed right before it is emitted.
pub trait RuntimeFrame: Send + Sync {
    /// The compiled function body this frame executes.
    fn code_object(&self) -> Arc<CodeObject>;

    /// Current instruction offset; changes as the frame executes.
    fn instruction_offset(&self) -> u32;

    /// Whether this is the first managed frame entered from native code.
    fn is_entry_frame(&self) -> bool;
}

/// Shared handle to a live frame.
pub type FrameRef = Arc<dyn RuntimeFrame>;

/// Snapshot of one managed thread taken while the world is stopped.
pub struct ThreadSnapshot {
    /// Runtime thread id; matches [`Runtime::current_thread_id`] when the
    /// thread itself calls in later.
    pub tid: u64,
    /// Frame chain, outermost frame first.
    pub stack: Vec<FrameRef>,
    /// Thread name, when the runtime knows one.
    pub name: Option<String>,
}

/// A coroutine/greenlet object that can carry a logical thread id across
/// context switches.
pub trait TaskHandle {
    /// Id previously stored on this task, if any.
    fn stored_thread_id(&self) -> Option<u64>;

    /// Persist `tid` on the task so a later switch back restores it.
    fn store_thread_id(&self, tid: u64);
}

/// Capability set the tracker needs from the managed runtime.
pub trait Runtime: Send + Sync {
    /// `major << 16 | minor << 8 | patch`; selects the linetable decoder.
    fn version(&self) -> u32;

    /// Which small-object allocator the runtime was built with.
    fn allocator_kind(&self) -> RuntimeAllocatorKind {
        RuntimeAllocatorKind::SystemMalloc
    }

    /// Runtime id of the calling thread.
    fn current_thread_id(&self) -> u64;

    /// Snapshot every live managed thread. Called with threads paused.
    fn enumerate_threads(&self) -> Vec<ThreadSnapshot>;

    /// Frame chain of the calling thread, outermost frame first.
    fn current_thread_stack(&self) -> Vec<FrameRef>;

    /// Halt all managed threads while `f` runs; used when a new capture
    /// snapshots initial stacks and installs the profile hook.
    fn with_threads_paused(&self, f: &mut dyn FnMut());

    /// Install the CALL/RETURN profile callback on every thread.
    fn install_profile_hook(&self);

    /// Remove the profile callback everywhere.
    fn remove_profile_hook(&self);

    /// Redirect the runtime's small-object allocator domain through the
    /// tracker. Returns false when the runtime has no such domain.
    fn install_allocator_hooks(&self) -> bool {
        false
    }

    fn remove_allocator_hooks(&self) {}
}

/// Profile callback events delivered by the runtime.
pub enum TraceEvent {
    Call(FrameRef),
    Return,
}
