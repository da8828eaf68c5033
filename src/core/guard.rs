//! Thread-local re-entry fence.
//!
//! The profiler's own code allocates: the writer grows buffers, the
//! unwinder touches its caches, the system allocator may call itself.
//! While the guard is raised on a thread, every interceptor on that
//! thread is an exact passthrough to the real symbol.
//!
//! The flag lives behind a pthread TLS key instead of a Rust
//! `thread_local!`: interceptors run during thread finalization, after
//! language-level TLS destructors, and a pthread key stays usable there.
//! The stored value is just a tag pointer, so raising the guard never
//! allocates.

use std::sync::OnceLock;

static GUARD_KEY: OnceLock<libc::pthread_key_t> = OnceLock::new();

const ACTIVE: *mut libc::c_void = 1 as *mut libc::c_void;

fn guard_key() -> libc::pthread_key_t {
    *GUARD_KEY.get_or_init(|| {
        let mut key: libc::pthread_key_t = 0;
        let rc = unsafe { libc::pthread_key_create(&mut key, None) };
        assert_eq!(rc, 0, "pthread_key_create failed");
        key
    })
}

/// Scoped re-entry fence. Raising an already-raised guard is a no-op
/// scope, so nesting is harmless.
pub struct RecursionGuard {
    was_active: bool,
}

impl RecursionGuard {
    /// Whether the current thread is inside guarded profiler code.
    pub fn is_active() -> bool {
        unsafe { libc::pthread_getspecific(guard_key()) == ACTIVE }
    }

    /// Raise the guard for the current scope.
    pub fn scoped() -> Self {
        let was_active = Self::is_active();
        if !was_active {
            unsafe {
                libc::pthread_setspecific(guard_key(), ACTIVE);
            }
        }
        Self { was_active }
    }

    /// Raise the guard for the rest of the thread's lifetime. Used by the
    /// background sampler thread and around `fork`.
    pub fn set_active() {
        unsafe {
            libc::pthread_setspecific(guard_key(), ACTIVE);
        }
    }

    /// Lower the guard unconditionally (the post-fork parent handler).
    pub fn clear() {
        unsafe {
            libc::pthread_setspecific(guard_key(), std::ptr::null_mut());
        }
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        if !self.was_active {
            unsafe {
                libc::pthread_setspecific(guard_key(), std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_scoped() {
        assert!(!RecursionGuard::is_active());
        {
            let _guard = RecursionGuard::scoped();
            assert!(RecursionGuard::is_active());
            {
                // Nested scope neither double-sets nor clears early.
                let _inner = RecursionGuard::scoped();
                assert!(RecursionGuard::is_active());
            }
            assert!(RecursionGuard::is_active());
        }
        assert!(!RecursionGuard::is_active());
    }

    #[test]
    fn guard_is_per_thread() {
        let _guard = RecursionGuard::scoped();
        let other = std::thread::spawn(RecursionGuard::is_active)
            .join()
            .unwrap();
        assert!(!other);
    }

    #[test]
    fn clear_lowers_a_permanent_guard() {
        RecursionGuard::set_active();
        assert!(RecursionGuard::is_active());
        RecursionGuard::clear();
        assert!(!RecursionGuard::is_active());
    }
}
