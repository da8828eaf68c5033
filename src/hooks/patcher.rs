//! Per-image relocation rewriting.
//!
//! For every loaded image the platform backend locates the dynamic
//! linking metadata and overwrites the relocation slots of the hooked
//! allocator symbols, either with the interceptors (`overwrite`) or with
//! the saved real symbols (`restore`). Patching is best-effort: an image
//! that cannot be parsed is logged at debug level and skipped, and its
//! allocations are simply missed.

use std::collections::HashSet;

use crate::format::ImageSegments;
use crate::hooks::{interceptor_address, real_address};

#[cfg(target_os = "linux")]
#[path = "elf.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macho.rs"]
mod platform;

/// Whether slots are being pointed at the interceptors or back at the
/// real symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchDirection {
    Overwrite,
    Restore,
}

/// The value a hooked symbol's slot should hold under `direction`.
pub(crate) fn target_address(symbol: &str, direction: PatchDirection) -> Option<usize> {
    match direction {
        PatchDirection::Overwrite => interceptor_address(symbol),
        PatchDirection::Restore => real_address(symbol),
    }
}

/// Images that must never be patched: the dynamic loader itself, the
/// vdso, this profiler, and allocator-mediating debug interposers that
/// would fight over the same slots.
pub(crate) fn is_skipped_image(name: &str) -> bool {
    const SKIPPED: &[&str] = &[
        "ld-linux",
        "ld-musl",
        "linux-vdso",
        "linux-gate",
        "/usr/lib/dyld",
        "heaptrail",
        "libmemusage",
        "libmtrace",
        "libasan",
        "libtsan",
        "libmsan",
        "libubsan",
        "vgpreload",
    ];
    SKIPPED.iter().any(|skip| name.contains(skip))
}

/// Rewrites allocator relocations across all loaded images.
pub struct SymbolPatcher {
    /// Images already pointing at the interceptors, keyed by name and
    /// load address so re-loaded images are patched again.
    patched: HashSet<String>,
}

impl Default for SymbolPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolPatcher {
    pub fn new() -> Self {
        Self {
            patched: HashSet::new(),
        }
    }

    /// Point every image's hooked slots at the interceptors. Idempotent:
    /// already-patched images are skipped, so this is safe to call again
    /// after `dlopen` brings in new images.
    pub fn overwrite_symbols(&mut self) {
        platform::patch_all_images(PatchDirection::Overwrite, &mut self.patched);
    }

    /// Point every patched image's slots back at the real symbols.
    pub fn restore_symbols(&mut self) {
        platform::patch_all_images(PatchDirection::Restore, &mut self.patched);
        self.patched.clear();
    }

    /// Number of images currently patched. Test hook.
    #[doc(hidden)]
    pub fn patched_image_count(&self) -> usize {
        self.patched.len()
    }
}

/// Snapshot of the currently loaded images and their mapped segments,
/// written to the capture so the reader can attribute instruction
/// pointers to images across load/unload cycles.
pub fn loaded_images() -> Vec<ImageSegments> {
    platform::loaded_images()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_list_covers_loader_and_interposers() {
        assert!(is_skipped_image("/lib64/ld-linux-x86-64.so.2"));
        assert!(is_skipped_image("linux-vdso.so.1"));
        assert!(is_skipped_image("/usr/lib/libheaptrail.so"));
        assert!(is_skipped_image("/usr/lib/libasan.so.8"));
        assert!(!is_skipped_image("/usr/lib/libc.so.6"));
        assert!(!is_skipped_image("/usr/lib/libssl.so.3"));
    }

    #[test]
    fn loaded_images_include_segments() {
        let images = loaded_images();
        assert!(!images.is_empty());
        assert!(images
            .iter()
            .any(|image| image.segments.iter().any(|s| s.memsz > 0)));
    }

    #[test]
    fn restore_clears_the_patched_set() {
        // Bookkeeping-level check: restoring forgets every image, so the
        // next overwrite patches from scratch.
        let mut patcher = SymbolPatcher::new();
        patcher.restore_symbols();
        assert_eq!(patcher.patched_image_count(), 0);
    }
}
