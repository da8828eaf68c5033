//! Native stack capture.
//!
//! The tracker only needs one capability from the unwinder: an ordered
//! sequence of instruction pointers for the current native stack. The
//! default implementation wraps the `backtrace` crate; tests substitute
//! canned stacks.
//!
//! The per-thread scratch buffer lives behind a pthread TLS key rather
//! than a language-level thread local: thread finalization may run
//! allocator calls after Rust TLS destructors have already executed, and
//! a pthread key can be repopulated during finalization and is freed
//! deterministically.

use std::sync::OnceLock;

/// Produces raw native stacks on demand.
pub trait Unwinder: Send + Sync {
    /// Fill `ips` with the current native stack, innermost frame first.
    fn unwind(&self, ips: &mut Vec<usize>);

    /// Drop cached unwind state; called after `dlclose` so stale module
    /// ranges are not consulted.
    fn flush_cache(&self) {}
}

/// Unwinder backed by the `backtrace` crate.
#[derive(Debug, Default)]
pub struct BacktraceUnwinder;

impl BacktraceUnwinder {
    pub fn new() -> Self {
        BacktraceUnwinder
    }
}

impl Unwinder for BacktraceUnwinder {
    fn unwind(&self, ips: &mut Vec<usize>) {
        ips.clear();
        // The unsynchronized walk is serialized by the tracker mutex held
        // around every capture.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                ips.push(frame.ip() as usize);
                true
            });
        }
    }
}

/// One captured native stack with the profiler's own frames skipped.
pub struct NativeTrace {
    ips: Vec<usize>,
    skip: usize,
}

impl NativeTrace {
    /// Capture the current stack, hiding the first `skip` frames (the
    /// interceptor and tracker machinery above the real call site).
    pub fn capture(unwinder: &dyn Unwinder, skip: usize) -> Self {
        let ips = with_scratch(|scratch| {
            unwinder.unwind(scratch);
            scratch.clone()
        });
        Self { ips, skip }
    }

    /// Build from pre-captured instruction pointers. Test hook.
    pub fn from_ips(ips: Vec<usize>, skip: usize) -> Self {
        Self { ips, skip }
    }

    /// Instruction pointers below the skipped prefix, innermost first.
    pub fn ips(&self) -> &[usize] {
        self.ips.get(self.skip.min(self.ips.len())..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.ips().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips().is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ips().iter().copied()
    }
}

static SCRATCH_KEY: OnceLock<libc::pthread_key_t> = OnceLock::new();

unsafe extern "C" fn drop_scratch(ptr: *mut libc::c_void) {
    drop(Box::from_raw(ptr as *mut Vec<usize>));
}

fn scratch_key() -> libc::pthread_key_t {
    *SCRATCH_KEY.get_or_init(|| {
        let mut key: libc::pthread_key_t = 0;
        let rc = unsafe { libc::pthread_key_create(&mut key, Some(drop_scratch)) };
        assert_eq!(rc, 0, "pthread_key_create failed");
        key
    })
}

fn with_scratch<R>(f: impl FnOnce(&mut Vec<usize>) -> R) -> R {
    let key = scratch_key();
    unsafe {
        let mut ptr = libc::pthread_getspecific(key) as *mut Vec<usize>;
        if ptr.is_null() {
            ptr = Box::into_raw(Box::new(Vec::with_capacity(128)));
            libc::pthread_setspecific(key, ptr as *mut libc::c_void);
        }
        f(&mut *ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedUnwinder(Vec<usize>);

    impl Unwinder for CannedUnwinder {
        fn unwind(&self, ips: &mut Vec<usize>) {
            ips.clear();
            ips.extend_from_slice(&self.0);
        }
    }

    #[test]
    fn skip_prefix_hides_profiler_frames() {
        let unwinder = CannedUnwinder(vec![0x100, 0x200, 0x300, 0x400]);
        let trace = NativeTrace::capture(&unwinder, 2);
        assert_eq!(trace.ips(), &[0x300, 0x400]);
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn skip_larger_than_stack_is_empty() {
        let unwinder = CannedUnwinder(vec![0x100]);
        let trace = NativeTrace::capture(&unwinder, 5);
        assert!(trace.is_empty());
    }

    #[test]
    fn backtrace_unwinder_returns_frames() {
        let unwinder = BacktraceUnwinder::new();
        let trace = NativeTrace::capture(&unwinder, 0);
        assert!(!trace.is_empty());
    }
}
