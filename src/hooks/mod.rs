//! Allocator interception.
//!
//! The profiler redirects the C allocator entry points of every loaded
//! image to thin wrappers ([`interceptors`]) by rewriting relocation
//! slots ([`patcher`]). The wrappers call the real symbol, saved here at
//! first use, and notify the tracker. The profiler's own calls reach the
//! real allocator either through these saved pointers or because its own
//! image is never patched.

pub mod interceptors;
pub mod patcher;

use std::ffi::c_void;
use std::sync::OnceLock;

use libc::{c_char, c_int, off_t, size_t};

/// The symbol set rewritten in every image.
pub const HOOKED_SYMBOLS: &[&str] = &[
    "malloc",
    "free",
    "calloc",
    "realloc",
    "posix_memalign",
    "aligned_alloc",
    "memalign",
    "valloc",
    "pvalloc",
    "mmap",
    "mmap64",
    "munmap",
    "dlopen",
    "dlclose",
];

pub(crate) type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub(crate) type FreeFn = unsafe extern "C" fn(*mut c_void);
pub(crate) type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub(crate) type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub(crate) type PosixMemalignFn =
    unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int;
pub(crate) type AlignedAllocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub(crate) type VallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub(crate) type MmapFn =
    unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
pub(crate) type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;
pub(crate) type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
pub(crate) type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

/// Saved pointers to the real allocator entry points.
///
/// Resolved once via `dlsym(RTLD_NEXT)` so the interceptors can reach the
/// symbols they replaced. Entries missing from the platform C library
/// stay `None` and their interceptors are never installed.
pub(crate) mod real {
    use super::*;

    fn lookup(name: &'static str) -> usize {
        debug_assert!(name.ends_with('\0'));
        unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) as usize }
    }

    macro_rules! real_symbol {
        ($getter:ident, $name:literal, $ty:ty) => {
            pub(crate) fn $getter() -> Option<$ty> {
                static SLOT: OnceLock<usize> = OnceLock::new();
                let addr = *SLOT.get_or_init(|| lookup(concat!($name, "\0")));
                if addr == 0 {
                    None
                } else {
                    Some(unsafe { std::mem::transmute::<usize, $ty>(addr) })
                }
            }
        };
    }

    real_symbol!(malloc, "malloc", MallocFn);
    real_symbol!(free, "free", FreeFn);
    real_symbol!(calloc, "calloc", CallocFn);
    real_symbol!(realloc, "realloc", ReallocFn);
    real_symbol!(posix_memalign, "posix_memalign", PosixMemalignFn);
    real_symbol!(aligned_alloc, "aligned_alloc", AlignedAllocFn);
    real_symbol!(memalign, "memalign", AlignedAllocFn);
    real_symbol!(valloc, "valloc", VallocFn);
    real_symbol!(pvalloc, "pvalloc", VallocFn);
    real_symbol!(mmap, "mmap", MmapFn);
    real_symbol!(mmap64, "mmap64", MmapFn);
    real_symbol!(munmap, "munmap", MunmapFn);
    real_symbol!(dlopen, "dlopen", DlopenFn);
    real_symbol!(dlclose, "dlclose", DlcloseFn);
}

/// Address of the interceptor installed for `symbol`, or `None` when the
/// symbol is unknown or its real counterpart could not be resolved.
pub(crate) fn interceptor_address(symbol: &str) -> Option<usize> {
    let address = match symbol {
        "malloc" => real::malloc().map(|_| interceptors::malloc as usize),
        "free" => real::free().map(|_| interceptors::free as usize),
        "calloc" => real::calloc().map(|_| interceptors::calloc as usize),
        "realloc" => real::realloc().map(|_| interceptors::realloc as usize),
        "posix_memalign" => {
            real::posix_memalign().map(|_| interceptors::posix_memalign as usize)
        }
        "aligned_alloc" => real::aligned_alloc().map(|_| interceptors::aligned_alloc as usize),
        "memalign" => real::memalign().map(|_| interceptors::memalign as usize),
        "valloc" => real::valloc().map(|_| interceptors::valloc as usize),
        "pvalloc" => real::pvalloc().map(|_| interceptors::pvalloc as usize),
        "mmap" => real::mmap().map(|_| interceptors::mmap as usize),
        "mmap64" => real::mmap64().map(|_| interceptors::mmap64 as usize),
        "munmap" => real::munmap().map(|_| interceptors::munmap as usize),
        "dlopen" => real::dlopen().map(|_| interceptors::dlopen as usize),
        "dlclose" => real::dlclose().map(|_| interceptors::dlclose as usize),
        _ => None,
    };
    address
}

/// Address the real symbol resolves to; written back on restore.
pub(crate) fn real_address(symbol: &str) -> Option<usize> {
    match symbol {
        "malloc" => real::malloc().map(|f| f as usize),
        "free" => real::free().map(|f| f as usize),
        "calloc" => real::calloc().map(|f| f as usize),
        "realloc" => real::realloc().map(|f| f as usize),
        "posix_memalign" => real::posix_memalign().map(|f| f as usize),
        "aligned_alloc" => real::aligned_alloc().map(|f| f as usize),
        "memalign" => real::memalign().map(|f| f as usize),
        "valloc" => real::valloc().map(|f| f as usize),
        "pvalloc" => real::pvalloc().map(|f| f as usize),
        "mmap" => real::mmap().map(|f| f as usize),
        "mmap64" => real::mmap64().map(|f| f as usize),
        "munmap" => real::munmap().map(|f| f as usize),
        "dlopen" => real::dlopen().map(|f| f as usize),
        "dlclose" => real::dlclose().map(|f| f as usize),
        _ => None,
    }
}
