//! C-ABI allocator wrappers.
//!
//! Every wrapper follows the same template: with the recursion guard
//! raised it is an exact passthrough; otherwise the real symbol runs
//! under the guard (so allocations made inside the system allocator do
//! not recurse) and the tracker is notified outside it. Deallocations
//! notify *before* the real call, so an address can never be reused
//! between a free and its record.

use std::ffi::c_void;

use libc::{c_char, c_int, off_t, size_t};

use crate::core::guard::RecursionGuard;
use crate::core::tracker::Tracker;
use crate::format::AllocatorKind;
use crate::hooks::real;

fn notify_allocation(allocator: AllocatorKind, address: usize, size: usize) {
    if let Some(tracker) = Tracker::instance() {
        tracker.track_allocation(allocator, address, size);
    }
}

pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let Some(real) = real::malloc() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(size);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(size)
    };
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::Malloc, ptr as usize, size);
    }
    ptr
}

pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(real) = real::free() else {
        return;
    };
    if RecursionGuard::is_active() {
        return real(ptr);
    }
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::Free, ptr as usize, 0);
    }
    let _guard = RecursionGuard::scoped();
    real(ptr)
}

pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real::calloc() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(count, size);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(count, size)
    };
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::Calloc, ptr as usize, count.saturating_mul(size));
    }
    ptr
}

pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let Some(real) = real::realloc() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(ptr, size);
    }
    let new_ptr = {
        let _guard = RecursionGuard::scoped();
        real(ptr, size)
    };
    if !new_ptr.is_null() {
        if !ptr.is_null() {
            notify_allocation(AllocatorKind::Free, ptr as usize, 0);
        }
        notify_allocation(AllocatorKind::Realloc, new_ptr as usize, size);
    }
    new_ptr
}

pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let Some(real) = real::posix_memalign() else {
        return libc::ENOMEM;
    };
    if RecursionGuard::is_active() {
        return real(memptr, alignment, size);
    }
    let rc = {
        let _guard = RecursionGuard::scoped();
        real(memptr, alignment, size)
    };
    if rc == 0 && !memptr.is_null() {
        let ptr = *memptr;
        if !ptr.is_null() {
            notify_allocation(AllocatorKind::PosixMemalign, ptr as usize, size);
        }
    }
    rc
}

pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real::aligned_alloc() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(alignment, size);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(alignment, size)
    };
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::AlignedAlloc, ptr as usize, size);
    }
    ptr
}

pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real::memalign() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(alignment, size);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(alignment, size)
    };
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::Memalign, ptr as usize, size);
    }
    ptr
}

pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    let Some(real) = real::valloc() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(size);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(size)
    };
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::Valloc, ptr as usize, size);
    }
    ptr
}

pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let Some(real) = real::pvalloc() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(size);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(size)
    };
    if !ptr.is_null() {
        notify_allocation(AllocatorKind::Pvalloc, ptr as usize, size);
    }
    ptr
}

pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let Some(real) = real::mmap() else {
        return libc::MAP_FAILED;
    };
    if RecursionGuard::is_active() {
        return real(addr, length, prot, flags, fd, offset);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(addr, length, prot, flags, fd, offset)
    };
    if ptr != libc::MAP_FAILED {
        notify_allocation(AllocatorKind::Mmap, ptr as usize, length);
    }
    ptr
}

pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let Some(real) = real::mmap64() else {
        return libc::MAP_FAILED;
    };
    if RecursionGuard::is_active() {
        return real(addr, length, prot, flags, fd, offset);
    }
    let ptr = {
        let _guard = RecursionGuard::scoped();
        real(addr, length, prot, flags, fd, offset)
    };
    if ptr != libc::MAP_FAILED {
        notify_allocation(AllocatorKind::Mmap, ptr as usize, length);
    }
    ptr
}

pub unsafe extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    let Some(real) = real::munmap() else {
        return -1;
    };
    if RecursionGuard::is_active() {
        return real(addr, length);
    }
    // Report while the region is still owned; the kernel may hand the
    // range to another thread the moment the real call returns.
    notify_allocation(AllocatorKind::Munmap, addr as usize, length);
    let _guard = RecursionGuard::scoped();
    real(addr, length)
}

pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let Some(real) = real::dlopen() else {
        return std::ptr::null_mut();
    };
    if RecursionGuard::is_active() {
        return real(filename, flags);
    }
    let handle = {
        let _guard = RecursionGuard::scoped();
        real(filename, flags)
    };
    if !handle.is_null() {
        if let Some(tracker) = Tracker::instance() {
            tracker.handle_image_change(false);
        }
    }
    handle
}

pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    let Some(real) = real::dlclose() else {
        return -1;
    };
    if RecursionGuard::is_active() {
        return real(handle);
    }
    let rc = {
        let _guard = RecursionGuard::scoped();
        real(handle)
    };
    if let Some(tracker) = Tracker::instance() {
        tracker.handle_image_change(true);
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    // No tracker is created here, so every call must behave exactly like
    // the real allocator.

    #[test]
    fn passthrough_under_the_recursion_guard() {
        let _guard = RecursionGuard::scoped();
        unsafe {
            let ptr = malloc(32);
            assert!(!ptr.is_null());
            let ptr = realloc(ptr, 64);
            assert!(!ptr.is_null());
            free(ptr);
        }
    }

    #[test]
    fn passthrough_without_an_active_tracker() {
        unsafe {
            let ptr = calloc(4, 8);
            assert!(!ptr.is_null());
            // calloc memory starts zeroed.
            assert_eq!(std::ptr::read(ptr as *const u8), 0);
            free(ptr);

            let mut aligned: *mut c_void = std::ptr::null_mut();
            assert_eq!(posix_memalign(&mut aligned, 64, 128), 0);
            assert_eq!(aligned as usize % 64, 0);
            free(aligned);
        }
    }

    #[test]
    fn mmap_and_munmap_pass_through() {
        unsafe {
            let ptr = mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(ptr, libc::MAP_FAILED);
            assert_eq!(munmap(ptr, 4096), 0);
        }
    }
}
