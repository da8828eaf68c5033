//! Per-thread shadow stack with lazy record emission.
//!
//! The profile callback fires on every managed CALL and RETURN, but most
//! managed calls never allocate. Pushing to the writer at event time would
//! cost two records per call; instead the shadow stack tracks what the
//! runtime did and defers emission until the next allocation record on the
//! same thread. Pops of already-emitted frames are batched in a counter;
//! frames that are pushed and popped between two allocations produce no
//! records at all.
//!
//! Invariant: the contiguous prefix of the stack marked `emitted` is
//! exactly what the writer has recorded as pushed for this thread. The
//! replay test suite leans on this: after consuming the log up to any
//! allocation, the reader's per-thread leaf equals the writer's.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TrackerResult;
use crate::format::writer::RecordWriter;
use crate::runtime::{FrameRef, Runtime, TaskHandle, TraceEvent};

/// Logical thread ids for threads (and coroutines) the runtime does not
/// number itself. Allocated from a high base so they stay disjoint from
/// runtime-assigned thread ids.
static NEXT_LOGICAL_TID: AtomicU64 = AtomicU64::new(1 << 32);

/// Allocate a fresh logical thread id.
pub fn allocate_thread_id() -> u64 {
    NEXT_LOGICAL_TID.fetch_add(1, Ordering::Relaxed)
}

/// Initial stacks captured at session start, keyed by runtime thread id.
pub type InitialStacks = HashMap<u64, Vec<FrameRef>>;

struct LazilyEmittedFrame {
    frame: FrameRef,
    instruction_offset: u32,
    is_entry_frame: bool,
    emitted: bool,
    /// Cleared when the runtime may have moved this frame's instruction
    /// offset since it was last read.
    offset_valid: bool,
    /// Frames captured from another thread's snapshot; their offsets are
    /// never refreshed because the frame may no longer be live.
    frozen: bool,
}

impl LazilyEmittedFrame {
    fn new(frame: FrameRef, frozen: bool) -> Self {
        Self {
            instruction_offset: frame.instruction_offset(),
            is_entry_frame: frame.is_entry_frame(),
            frame,
            emitted: false,
            offset_valid: false,
            frozen,
        }
    }
}

struct ThreadState {
    tid: u64,
    frames: Vec<LazilyEmittedFrame>,
    pending_pops: u32,
    /// Last tracker generation this thread synchronized with.
    generation: u64,
}

thread_local! {
    static SHADOW: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

fn with_state<F, R>(default_tid: impl FnOnce() -> u64, f: F) -> R
where
    F: FnOnce(&mut ThreadState) -> R,
{
    SHADOW.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let state = borrow.get_or_insert_with(|| ThreadState {
            tid: default_tid(),
            frames: Vec::new(),
            pending_pops: 0,
            generation: 0,
        });
        f(state)
    })
}

/// Handle a CALL/RETURN event from the runtime's profile callback.
///
/// Runs on the thread executing managed code. Nothing is written; the
/// writer sees the net effect at the next allocation.
pub fn on_trace_event(event: TraceEvent) {
    with_state(allocate_thread_id, |state| {
        match event {
            TraceEvent::Call(frame) => {
                state.frames.push(LazilyEmittedFrame::new(frame, false));
            }
            TraceEvent::Return => {
                if let Some(top) = state.frames.pop() {
                    if top.emitted {
                        state.pending_pops += 1;
                    }
                }
            }
        }
        // The new top frame resumes executing; its cached offset is stale.
        if let Some(top) = state.frames.last_mut() {
            if !top.frozen {
                top.offset_valid = false;
            }
        }
    });
}

fn default_tid_for(runtime: Option<&dyn Runtime>) -> impl FnOnce() -> u64 + '_ {
    move || match runtime {
        Some(runtime) => runtime.current_thread_id(),
        None => allocate_thread_id(),
    }
}

fn ensure_generation(
    state: &mut ThreadState,
    generation: u64,
    initial_stacks: &InitialStacks,
    runtime: Option<&dyn Runtime>,
) {
    if state.generation == generation {
        return;
    }
    // A new capture started; whatever we emitted belonged to the
    // previous writer. Rebuild from the captured initial stack.
    state.frames.clear();
    state.pending_pops = 0;
    if let Some(runtime) = runtime {
        state.tid = runtime.current_thread_id();
    }
    if let Some(initial) = initial_stacks.get(&state.tid) {
        for frame in initial {
            state
                .frames
                .push(LazilyEmittedFrame::new(frame.clone(), true));
        }
    }
    state.generation = generation;
}

/// Discard a shadow stack belonging to a dead capture and reload it from
/// the generation's captured initial stacks. Called from the profile
/// callback path so trace events never mutate a stale stack.
pub fn reload_if_tracker_changed(
    generation: u64,
    initial_stacks: &InitialStacks,
    runtime: Option<&dyn Runtime>,
) {
    with_state(default_tid_for(runtime), |state| {
        ensure_generation(state, generation, initial_stacks, runtime);
    });
}

/// Synchronize with the tracker generation, then emit all deferred pops
/// and pushes for this thread. Returns the thread id records should be
/// attributed to.
///
/// Called on the allocation hot path, under the tracker lock, right
/// before the allocation record is appended.
pub fn sync_and_emit(
    writer: &mut RecordWriter,
    generation: u64,
    initial_stacks: &InitialStacks,
    runtime: Option<&dyn Runtime>,
) -> TrackerResult<u64> {
    with_state(default_tid_for(runtime), |state| {
        ensure_generation(state, generation, initial_stacks, runtime);
        emit_pending(state, writer)?;
        Ok(state.tid)
    })
}

fn emit_pending(state: &mut ThreadState, writer: &mut RecordWriter) -> TrackerResult<()> {
    // Walk newest to oldest. The stale region is contiguous at the top:
    // unemitted frames, plus at most one emitted frame whose instruction
    // offset may have moved since it was recorded.
    for frame in state.frames.iter_mut().rev() {
        if !frame.emitted {
            if !frame.frozen {
                frame.instruction_offset = frame.frame.instruction_offset();
                frame.offset_valid = true;
            }
            continue;
        }
        if frame.offset_valid || frame.frozen {
            break;
        }
        let current = frame.frame.instruction_offset();
        frame.offset_valid = true;
        if current == frame.instruction_offset {
            break;
        }
        // The frame advanced: cancel its previous push and re-emit it at
        // the new offset.
        frame.instruction_offset = current;
        frame.emitted = false;
        state.pending_pops += 1;
        break;
    }

    if state.pending_pops > 0 {
        writer.write_frame_pop(state.tid, state.pending_pops)?;
        state.pending_pops = 0;
    }

    let first_unemitted = state
        .frames
        .iter()
        .position(|frame| !frame.emitted)
        .unwrap_or(state.frames.len());
    for index in first_unemitted..state.frames.len() {
        let frame = &mut state.frames[index];
        let code = frame.frame.code_object();
        writer.write_frame_push(
            state.tid,
            &code,
            frame.instruction_offset,
            frame.is_entry_frame,
        )?;
        frame.emitted = true;
    }
    Ok(())
}

/// Handle a coroutine context switch on the current thread.
///
/// The shadow stack belongs to the logical task, not the OS thread: pops
/// for everything emitted are charged to the outgoing task's id, the id is
/// parked on the outgoing task object, and the stack is rebuilt from the
/// incoming task's live frame chain under its own (possibly new) id.
pub fn on_task_switch(
    writer: &mut RecordWriter,
    from: &dyn TaskHandle,
    to: &dyn TaskHandle,
    live_stack: Vec<FrameRef>,
) -> TrackerResult<()> {
    with_state(allocate_thread_id, |state| {
        let emitted = state.frames.iter().filter(|frame| frame.emitted).count() as u32;
        let pops = emitted + state.pending_pops;
        if pops > 0 {
            writer.write_frame_pop(state.tid, pops)?;
        }
        state.frames.clear();
        state.pending_pops = 0;

        from.store_thread_id(state.tid);
        state.tid = to
            .stored_thread_id()
            .unwrap_or_else(allocate_thread_id);

        for frame in live_stack {
            state.frames.push(LazilyEmittedFrame::new(frame, false));
        }
        Ok(())
    })
}

/// Recover from a shadow stack that no longer matches the runtime: emit
/// pops for everything recorded, then rebuild from the live frame chain.
pub fn resync_from_live_stack(
    writer: &mut RecordWriter,
    live_stack: Vec<FrameRef>,
) -> TrackerResult<()> {
    with_state(allocate_thread_id, |state| {
        let emitted = state.frames.iter().filter(|frame| frame.emitted).count() as u32;
        let pops = emitted + state.pending_pops;
        if pops > 0 {
            writer.write_frame_pop(state.tid, pops)?;
        }
        state.frames.clear();
        state.pending_pops = 0;
        for frame in live_stack {
            state.frames.push(LazilyEmittedFrame::new(frame, false));
        }
        Ok(())
    })
}

/// Forget this thread's shadow stack entirely (used by tests and by the
/// fork child, whose inherited stack belongs to a vanished capture).
pub fn reset_current_thread() {
    SHADOW.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// The logical thread id the current thread would record under.
pub fn current_thread_id(runtime: Option<&dyn Runtime>) -> u64 {
    with_state(
        || match runtime {
            Some(runtime) => runtime.current_thread_id(),
            None => allocate_thread_id(),
        },
        |state| state.tid,
    )
}

/// Depth of the current thread's shadow stack. Test hook.
#[doc(hidden)]
pub fn stack_depth() -> usize {
    SHADOW.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|state| state.frames.len())
            .unwrap_or(0)
    })
}
