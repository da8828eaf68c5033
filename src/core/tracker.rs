//! The tracking session orchestrator.
//!
//! One tracker exists per process at a time. A process-wide atomic is the
//! on/off gate the allocation hot paths read; the instance itself is
//! handed to every entry point rather than re-fetched internally, so all
//! real work happens on a context value. The session mutex serializes the
//! shadow-stack emission and the record writer, which totally orders
//! events from different threads in the log.
//!
//! Hot path, in order: thread-local recursion guard (lock-free), the
//! active gate (lock-free), then the session mutex for the single event
//! append.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};

use log::{debug, error, info};

use crate::config::TrackerConfig;
use crate::core::guard::RecursionGuard;
use crate::core::rss::{read_resident_set_size, MemorySampler};
use crate::error::{TrackerError, TrackerResult};
use crate::format::writer::RecordWriter;
use crate::format::{AllocatorKind, HeaderInfo, HeaderStats, RuntimeAllocatorKind, FORMAT_VERSION};
use crate::hooks::patcher::{loaded_images, SymbolPatcher};
use crate::native::{BacktraceUnwinder, NativeTrace, Unwinder};
use crate::runtime::shadow::{self, InitialStacks};
use crate::runtime::{Runtime, TaskHandle, TraceEvent};
use crate::sink::Sink;
use crate::sync::mutex::Mutex;

/// Lock-free on/off gate read by every interceptor.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// The installed session, if any. Held briefly to clone the handle.
static INSTANCE: Mutex<Option<Arc<Tracker>>> = Mutex::new(None);

/// Bumped when a new session begins; threads compare against their cached
/// value to notice that their shadow stack belongs to a dead capture.
static GENERATION: AtomicU64 = AtomicU64::new(0);

static FORK_HANDLERS: Once = Once::new();

/// Native frames between the interceptor entry point and the traced
/// program's call site; hidden from captured stacks.
const PROFILER_NATIVE_FRAMES: usize = 2;

struct TrackerState {
    writer: RecordWriter,
    patcher: SymbolPatcher,
    /// Set by dlopen/dlclose; the image map is re-emitted before the next
    /// allocation record.
    mappings_dirty: bool,
}

/// A tracking session.
pub struct Tracker {
    state: Mutex<TrackerState>,
    config: TrackerConfig,
    generation: u64,
    runtime: Option<Arc<dyn Runtime>>,
    unwinder: Arc<dyn Unwinder>,
    initial_stacks: InitialStacks,
    sampler: Mutex<Option<MemorySampler>>,
}

impl Tracker {
    /// Start a session writing to `sink`, without a managed runtime.
    pub fn create(sink: Box<dyn Sink>, config: TrackerConfig) -> TrackerResult<Arc<Tracker>> {
        Self::create_full(sink, config, None, None)
    }

    /// Start a session with a managed runtime attached.
    pub fn create_with_runtime(
        sink: Box<dyn Sink>,
        config: TrackerConfig,
        runtime: Arc<dyn Runtime>,
    ) -> TrackerResult<Arc<Tracker>> {
        Self::create_full(sink, config, Some(runtime), None)
    }

    /// Start a session with explicit collaborators.
    pub fn create_full(
        sink: Box<dyn Sink>,
        config: TrackerConfig,
        runtime: Option<Arc<dyn Runtime>>,
        unwinder: Option<Arc<dyn Unwinder>>,
    ) -> TrackerResult<Arc<Tracker>> {
        let header = HeaderInfo {
            version: FORMAT_VERSION,
            runtime_version: runtime.as_ref().map(|r| r.version()).unwrap_or(0),
            native_traces: config.native_traces,
            file_format: config.file_format,
            stats: HeaderStats::default(),
            command_line: config.command_line.clone(),
            pid: unsafe { libc::getpid() },
            main_tid: shadow::current_thread_id(runtime.as_deref()),
            skipped_frames_on_main_tid: 0,
            runtime_allocator: runtime
                .as_ref()
                .map(|r| r.allocator_kind())
                .unwrap_or(RuntimeAllocatorKind::SystemMalloc),
            trace_runtime_allocators: config.trace_runtime_allocators,
            track_object_lifetimes: config.track_object_lifetimes,
        };
        let writer = RecordWriter::new(sink, header)?;
        Self::create_internal(writer, config, runtime, unwinder)
    }

    fn create_internal(
        mut writer: RecordWriter,
        config: TrackerConfig,
        runtime: Option<Arc<dyn Runtime>>,
        unwinder: Option<Arc<dyn Unwinder>>,
    ) -> TrackerResult<Arc<Tracker>> {
        FORK_HANDLERS.call_once(|| unsafe {
            libc::pthread_atfork(Some(atfork_prepare), Some(atfork_parent), Some(atfork_child));
        });

        {
            let slot = INSTANCE.lock();
            if slot.is_some() {
                return Err(TrackerError::Session(
                    "a tracking session is already active".into(),
                ));
            }
        }

        let _guard = RecursionGuard::scoped();
        let generation = GENERATION.fetch_add(1, Ordering::SeqCst) + 1;

        // Stop the world, snapshot every thread's frame chain, and hook
        // the profile callback before any thread can run again; a thread
        // resuming with an unsnapshotted stack would emit pushes the
        // reader has no context for.
        let mut initial_stacks: InitialStacks = InitialStacks::new();
        let mut thread_names = Vec::new();
        if let Some(runtime) = runtime.as_ref() {
            let mut capture = || {
                for snapshot in runtime.enumerate_threads() {
                    if let Some(name) = snapshot.name.clone() {
                        thread_names.push((snapshot.tid, name));
                    }
                    initial_stacks.insert(snapshot.tid, snapshot.stack);
                }
                runtime.install_profile_hook();
            };
            runtime.with_threads_paused(&mut capture);
        }

        for (tid, name) in &thread_names {
            writer.write_thread_name(*tid, name)?;
        }
        if config.native_traces {
            writer.write_mappings(&loaded_images())?;
        }

        let tracker = Arc::new(Tracker {
            state: Mutex::new(TrackerState {
                writer,
                patcher: SymbolPatcher::new(),
                mappings_dirty: false,
            }),
            config,
            generation,
            runtime,
            unwinder: unwinder.unwrap_or_else(|| Arc::new(BacktraceUnwinder::new())),
            initial_stacks,
            sampler: Mutex::new(None),
        });

        let sampler = MemorySampler::start(
            Arc::downgrade(&tracker),
            tracker.config.memory_interval,
        );
        *tracker.sampler.lock() = Some(sampler);

        if tracker.config.trace_runtime_allocators {
            if let Some(runtime) = tracker.runtime.as_ref() {
                if !runtime.install_allocator_hooks() {
                    debug!("runtime has no allocator domain to hook");
                }
            }
        }

        if tracker.config.patch_symbols {
            tracker.state.lock().patcher.overwrite_symbols();
        }

        {
            let mut slot = INSTANCE.lock();
            if slot.is_some() {
                // Lost a creation race; back out without activating.
                return Err(TrackerError::Session(
                    "a tracking session is already active".into(),
                ));
            }
            *slot = Some(tracker.clone());
        }
        ACTIVE.store(true, Ordering::Release);
        info!("tracking session {generation} started");
        Ok(tracker)
    }

    /// Tear a session down: trailer and final header, sampler join,
    /// symbol restore, hook removal. Tolerates being called while the
    /// runtime is finalizing.
    pub fn destroy(tracker: Arc<Tracker>) {
        tracker.deactivate();
        let sampler = tracker.sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop();
        }
        {
            let _guard = RecursionGuard::scoped();
            tracker.state.lock().patcher.restore_symbols();
        }
        if let Some(runtime) = tracker.runtime.as_ref() {
            runtime.remove_profile_hook();
            runtime.remove_allocator_hooks();
        }
        let mut slot = INSTANCE.lock();
        if slot
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, &tracker))
        {
            *slot = None;
        }
        info!("tracking session {} ended", tracker.generation);
    }

    /// Whether a session is currently recording.
    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    /// Clone a handle to the installed session, if one is recording.
    pub fn instance() -> Option<Arc<Tracker>> {
        if !Self::is_active() {
            return None;
        }
        INSTANCE.lock().clone()
    }

    /// Stop recording and write the trailer and final header stats.
    pub fn deactivate(&self) {
        if !ACTIVE.swap(false, Ordering::AcqRel) {
            return;
        }
        let _guard = RecursionGuard::scoped();
        let mut state = self.state.lock();
        if let Err(err) = state.writer.finalize() {
            debug!("could not finalize capture: {err}");
        }
    }

    /// Stop recording because a write failed; no trailer is attempted.
    fn deactivate_on_error(&self, err: TrackerError) {
        ACTIVE.store(false, Ordering::Release);
        error!("deactivating tracking: {err}");
        eprintln!("heaptrail: deactivating tracking: {err}");
    }

    /// Record one allocator event. Called by the interceptors after the
    /// real allocator ran (before, for `munmap`, while the region is
    /// still owned).
    pub fn track_allocation(&self, allocator: AllocatorKind, address: usize, size: usize) {
        if RecursionGuard::is_active() || !Self::is_active() {
            return;
        }
        let _guard = RecursionGuard::scoped();
        let mut state = self.state.lock();
        let result = self.track_allocation_locked(&mut state, allocator, address, size);
        if let Err(err) = result {
            drop(state);
            self.deactivate_on_error(err);
        }
    }

    fn track_allocation_locked(
        &self,
        state: &mut TrackerState,
        allocator: AllocatorKind,
        address: usize,
        size: usize,
    ) -> TrackerResult<()> {
        if state.mappings_dirty {
            state.mappings_dirty = false;
            if self.config.patch_symbols {
                // New images brought in by dlopen get their slots
                // rewritten too; already-patched images are skipped.
                state.patcher.overwrite_symbols();
            }
            if self.config.native_traces {
                state.writer.write_mappings(&loaded_images())?;
            }
        }
        let tid = shadow::sync_and_emit(
            &mut state.writer,
            self.generation,
            &self.initial_stacks,
            self.runtime.as_deref(),
        )?;
        let native_leaf = if self.config.native_traces {
            let trace = NativeTrace::capture(&*self.unwinder, PROFILER_NATIVE_FRAMES);
            Some(state.writer.write_native_stack(trace.ips())?)
        } else {
            None
        };
        state
            .writer
            .write_allocation(tid, allocator, address, size, native_leaf)
    }

    /// Forward a profile-callback event into the current thread's shadow
    /// stack. Nothing is written until the next allocation on this
    /// thread.
    pub fn on_profile_event(event: TraceEvent) {
        let Some(tracker) = Self::instance() else {
            return;
        };
        let _guard = RecursionGuard::scoped();
        shadow::reload_if_tracker_changed(
            tracker.generation,
            &tracker.initial_stacks,
            tracker.runtime.as_deref(),
        );
        shadow::on_trace_event(event);
    }

    /// Handle a coroutine switch on the current thread.
    pub fn track_task_switch(&self, from: &dyn TaskHandle, to: &dyn TaskHandle) {
        if RecursionGuard::is_active() || !Self::is_active() {
            return;
        }
        let _guard = RecursionGuard::scoped();
        let live_stack = self
            .runtime
            .as_ref()
            .map(|runtime| runtime.current_thread_stack())
            .unwrap_or_default();
        let mut state = self.state.lock();
        if let Err(err) = shadow::on_task_switch(&mut state.writer, from, to, live_stack) {
            drop(state);
            self.deactivate_on_error(err);
        }
    }

    /// Record the current thread's name.
    pub fn register_thread_name(&self, name: &str) {
        if RecursionGuard::is_active() || !Self::is_active() {
            return;
        }
        let _guard = RecursionGuard::scoped();
        let tid = shadow::current_thread_id(self.runtime.as_deref());
        let mut state = self.state.lock();
        if let Err(err) = state.writer.write_thread_name(tid, name) {
            drop(state);
            self.deactivate_on_error(err);
        }
    }

    /// Record an object birth or death (when lifetimes are tracked).
    pub fn track_object(&self, address: usize, created: bool) {
        if !self.config.track_object_lifetimes {
            return;
        }
        if RecursionGuard::is_active() || !Self::is_active() {
            return;
        }
        let _guard = RecursionGuard::scoped();
        let tid = shadow::current_thread_id(self.runtime.as_deref());
        let mut state = self.state.lock();
        if let Err(err) = state.writer.write_object_record(tid, address, created) {
            drop(state);
            self.deactivate_on_error(err);
        }
    }

    /// Recover from a shadow stack that no longer matches the runtime
    /// (the profile hook was removed while frames were held): emit pops
    /// for everything recorded and rebuild from the live frame chain.
    pub fn handle_runtime_desync(&self) {
        if RecursionGuard::is_active() || !Self::is_active() {
            return;
        }
        let _guard = RecursionGuard::scoped();
        let live_stack = self
            .runtime
            .as_ref()
            .map(|runtime| runtime.current_thread_stack())
            .unwrap_or_default();
        let mut state = self.state.lock();
        if let Err(err) = shadow::resync_from_live_stack(&mut state.writer, live_stack) {
            drop(state);
            self.deactivate_on_error(err);
        }
    }

    /// Note that the loaded-image set changed (dlopen/dlclose). The image
    /// map is rewritten before the next allocation record; on unload the
    /// unwinder cache is flushed as well.
    pub fn handle_image_change(&self, unloading: bool) {
        if RecursionGuard::is_active() {
            return;
        }
        let _guard = RecursionGuard::scoped();
        self.state.lock().mappings_dirty = true;
        if unloading {
            self.unwinder.flush_cache();
        }
    }

    /// One sampler tick. Returns false when the sampler should exit.
    pub(crate) fn sample_memory(&self) -> bool {
        if !Self::is_active() {
            return false;
        }
        let rss = read_resident_set_size();
        if rss == 0 {
            error!("RSS sample read as zero; deactivating tracking");
            self.deactivate();
            return false;
        }
        let mut state = self.state.lock();
        let elapsed = state.writer.ms_since_start();
        if let Err(err) = state.writer.write_memory_record(rss, elapsed) {
            drop(state);
            self.deactivate_on_error(err);
            return false;
        }
        true
    }

    /// The generation this session was created under. Test hook.
    #[doc(hidden)]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

unsafe extern "C" fn atfork_prepare() {
    // Allocations made by fork itself must not be recorded.
    RecursionGuard::set_active();
}

unsafe extern "C" fn atfork_parent() {
    RecursionGuard::clear();
}

unsafe extern "C" fn atfork_child() {
    after_fork_in_child();
    RecursionGuard::clear();
}

/// Re-establish (or abandon) tracking in a forked child.
///
/// The parent's instance is intentionally leaked: its session mutex and
/// sampler belong to threads that do not exist in this process. When the
/// instance slot or the session state cannot be locked, some vanished
/// thread held it across fork and the child simply stays untracked.
fn after_fork_in_child() {
    ACTIVE.store(false, Ordering::Release);
    let Some(mut slot) = INSTANCE.try_lock() else {
        return;
    };
    let Some(old) = slot.take() else {
        return;
    };
    drop(slot);

    shadow::reset_current_thread();

    let follow = old.config.follow_fork;
    let mut child_writer = None;
    if follow {
        if let Some(state) = old.state.try_lock() {
            match state.writer.clone_in_child_process() {
                Ok(writer) => child_writer = writer,
                Err(err) => debug!("cannot clone capture sink into child: {err}"),
            }
        }
    }
    let config = old.config.clone();
    let runtime = old.runtime.clone();
    let unwinder = old.unwinder.clone();
    std::mem::forget(old);

    if let Some(writer) = child_writer {
        if let Err(err) = Tracker::create_internal(writer, config, runtime, Some(unwinder)) {
            debug!("could not re-create tracker in forked child: {err}");
        }
    }
}
