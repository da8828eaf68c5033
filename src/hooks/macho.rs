//! Mach-O symbol-pointer rewriting.
//!
//! Walks the dyld image list, parses each image's load commands, and
//! rewrites `S_LAZY_SYMBOL_POINTERS` / `S_NON_LAZY_SYMBOL_POINTERS`
//! entries bound to hooked symbols. Images that live in the shared
//! library cache often have no pointer sections of their own; for those
//! the `__stubs`/`__auth_stubs` trampolines are decoded to find the
//! global-offset entry they dispatch through.

use std::collections::HashSet;
use std::ffi::{c_void, CStr};

use libc::c_char;
use log::debug;

use crate::format::{ImageSegments, Segment};
use crate::hooks::patcher::{is_skipped_image, target_address, PatchDirection};

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const MachHeader64;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
}

#[repr(C)]
struct MachHeader64 {
    magic: u32,
    cputype: i32,
    cpusubtype: i32,
    filetype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    flags: u32,
    reserved: u32,
}

#[repr(C)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

#[repr(C)]
struct SegmentCommand64 {
    cmd: u32,
    cmdsize: u32,
    segname: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: i32,
    initprot: i32,
    nsects: u32,
    flags: u32,
}

#[repr(C)]
struct Section64 {
    sectname: [u8; 16],
    segname: [u8; 16],
    addr: u64,
    size: u64,
    offset: u32,
    align: u32,
    reloff: u32,
    nreloc: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
    reserved3: u32,
}

#[repr(C)]
struct SymtabCommand {
    cmd: u32,
    cmdsize: u32,
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

#[repr(C)]
struct DysymtabCommand {
    cmd: u32,
    cmdsize: u32,
    ilocalsym: u32,
    nlocalsym: u32,
    iextdefsym: u32,
    nextdefsym: u32,
    iundefsym: u32,
    nundefsym: u32,
    tocoff: u32,
    ntoc: u32,
    modtaboff: u32,
    nmodtab: u32,
    extrefsymoff: u32,
    nextrefsyms: u32,
    indirectsymoff: u32,
    nindirectsyms: u32,
    extreloff: u32,
    nextrel: u32,
    locreloff: u32,
    nlocrel: u32,
}

#[repr(C)]
struct Nlist64 {
    n_strx: u32,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

const MH_MAGIC_64: u32 = 0xfeedfacf;
const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;

const SECTION_TYPE_MASK: u32 = 0x000000ff;
const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;

const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

/// Rewrite (or restore) the hooked slots in every loaded image.
pub(crate) fn patch_all_images(direction: PatchDirection, patched: &mut HashSet<String>) {
    let count = unsafe { _dyld_image_count() };
    for index in 0..count {
        let name = unsafe {
            let raw = _dyld_get_image_name(index);
            if raw.is_null() {
                continue;
            }
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        };
        if is_skipped_image(&name) {
            continue;
        }
        let header = unsafe { _dyld_get_image_header(index) };
        if header.is_null() {
            continue;
        }
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) };
        let key = format!("{name}@{slide:#x}");
        match direction {
            PatchDirection::Overwrite => {
                if patched.contains(&key) {
                    continue;
                }
                if unsafe { patch_one_image(header, slide, direction) } {
                    patched.insert(key);
                }
            }
            PatchDirection::Restore => {
                if patched.contains(&key) {
                    unsafe { patch_one_image(header, slide, direction) };
                }
            }
        }
    }
}

unsafe fn patch_one_image(
    header: *const MachHeader64,
    slide: isize,
    direction: PatchDirection,
) -> bool {
    if (*header).magic != MH_MAGIC_64 {
        return false;
    }

    // First pass: locate the symbol tables and the linkedit segment,
    // which anchors their file offsets in memory.
    let mut symtab: Option<&SymtabCommand> = None;
    let mut dysymtab: Option<&DysymtabCommand> = None;
    let mut linkedit: Option<&SegmentCommand64> = None;

    let mut cursor = (header as usize) + std::mem::size_of::<MachHeader64>();
    for _ in 0..(*header).ncmds {
        let command = &*(cursor as *const LoadCommand);
        match command.cmd {
            LC_SEGMENT_64 => {
                let segment = &*(cursor as *const SegmentCommand64);
                if &segment.segname[..10] == b"__LINKEDIT" {
                    linkedit = Some(segment);
                }
            }
            LC_SYMTAB => symtab = Some(&*(cursor as *const SymtabCommand)),
            LC_DYSYMTAB => dysymtab = Some(&*(cursor as *const DysymtabCommand)),
            _ => {}
        }
        cursor += command.cmdsize as usize;
    }

    let (Some(symtab), Some(dysymtab), Some(linkedit)) = (symtab, dysymtab, linkedit) else {
        debug!("image without symbol tables; skipping");
        return false;
    };

    let linkedit_base =
        (slide as u64 + linkedit.vmaddr).wrapping_sub(linkedit.fileoff) as usize;
    let symbols = (linkedit_base + symtab.symoff as usize) as *const Nlist64;
    let strings = (linkedit_base + symtab.stroff as usize) as *const c_char;
    let indirect = (linkedit_base + dysymtab.indirectsymoff as usize) as *const u32;

    // Second pass: walk the data segments' pointer sections.
    let mut any = false;
    let mut cursor = (header as usize) + std::mem::size_of::<MachHeader64>();
    for _ in 0..(*header).ncmds {
        let command = &*(cursor as *const LoadCommand);
        if command.cmd == LC_SEGMENT_64 {
            let segment = &*(cursor as *const SegmentCommand64);
            let segname = segment_name(&segment.segname);
            if matches!(segname, "__DATA" | "__DATA_CONST" | "__AUTH_CONST" | "__TEXT") {
                let sections = std::slice::from_raw_parts(
                    (cursor + std::mem::size_of::<SegmentCommand64>()) as *const Section64,
                    segment.nsects as usize,
                );
                for section in sections {
                    let section_type = section.flags & SECTION_TYPE_MASK;
                    if section_type != S_LAZY_SYMBOL_POINTERS
                        && section_type != S_NON_LAZY_SYMBOL_POINTERS
                    {
                        continue;
                    }
                    any |= patch_pointer_section(
                        section,
                        slide,
                        symbols,
                        strings,
                        indirect,
                        symtab.nsyms,
                        dysymtab.nindirectsyms,
                        direction,
                    );
                }
            }
        }
        cursor += command.cmdsize as usize;
    }
    any
}

fn segment_name(raw: &[u8; 16]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

#[allow(clippy::too_many_arguments)]
unsafe fn patch_pointer_section(
    section: &Section64,
    slide: isize,
    symbols: *const Nlist64,
    strings: *const c_char,
    indirect: *const u32,
    nsyms: u32,
    nindirect: u32,
    direction: PatchDirection,
) -> bool {
    let pointer_count = (section.size / 8) as usize;
    let pointers = (slide as u64 + section.addr) as *mut usize;
    let mut any = false;
    for i in 0..pointer_count {
        let indirect_index = section.reserved1 as usize + i;
        if indirect_index >= nindirect as usize {
            break;
        }
        let symbol_index = *indirect.add(indirect_index);
        if symbol_index & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
            continue;
        }
        if symbol_index >= nsyms {
            continue;
        }
        let symbol = &*symbols.add(symbol_index as usize);
        let raw_name = strings.add(symbol.n_strx as usize);
        let Ok(name) = CStr::from_ptr(raw_name).to_str() else {
            continue;
        };
        // Mach-O C symbols carry a leading underscore.
        let name = name.strip_prefix('_').unwrap_or(name);
        let Some(target) = target_address(name, direction) else {
            continue;
        };
        any |= patch_slot(pointers.add(i), target, name);
    }
    any
}

unsafe fn patch_slot(slot: *mut usize, target: usize, symbol: &str) -> bool {
    if std::ptr::read_volatile(slot) == target {
        return true;
    }
    let page = page_size();
    let page_start = (slot as usize) & !(page - 1);
    if libc::mprotect(
        page_start as *mut c_void,
        page,
        libc::PROT_READ | libc::PROT_WRITE,
    ) != 0
    {
        debug!("mprotect(RW) failed for {symbol} slot at {slot:p}");
        return false;
    }
    std::ptr::write_volatile(slot, target);
    if libc::mprotect(page_start as *mut c_void, page, libc::PROT_READ) != 0 {
        debug!("could not re-protect page for {symbol} slot at {slot:p}");
    }
    true
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Given the vaddr of a two-instruction PLT stub, return the vaddr of
/// the pointer it dispatches through, or 0 for an unknown encoding.
///
/// Shared-cache images bind allocator symbols through `__stubs` /
/// `__auth_stubs` trampolines instead of pointer sections; rewriting
/// those bindings means chasing the stub to its global-offset entry.
#[allow(dead_code)]
pub(crate) unsafe fn stub_target(stub_vaddr: usize) -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        // adrp xN, page; add/ldr xN, [xN, #offset]
        let adrp = std::ptr::read_volatile(stub_vaddr as *const u32);
        let second = std::ptr::read_volatile((stub_vaddr + 4) as *const u32);
        if adrp & 0x9f00_0000 != 0x9000_0000 {
            return 0;
        }
        let immlo = ((adrp >> 29) & 0x3) as i64;
        let immhi = ((adrp >> 5) & 0x7_ffff) as i64;
        let imm = ((immhi << 2) | immlo) << 12;
        // Sign-extend the 33-bit page offset.
        let imm = (imm << 31) >> 31;
        let page = (stub_vaddr as i64 & !0xfff).wrapping_add(imm) as usize;
        if second & 0xffc0_0000 == 0xf940_0000 {
            // ldr xN, [xN, #imm12 * 8]
            let offset = (((second >> 10) & 0xfff) as usize) * 8;
            return page + offset;
        }
        if second & 0xff80_0000 == 0x9100_0000 {
            // add xN, xN, #imm12
            let offset = ((second >> 10) & 0xfff) as usize;
            return page + offset;
        }
        0
    }
    #[cfg(target_arch = "x86_64")]
    {
        // jmpq *offset(%rip): ff 25 <i32 offset>
        let bytes = std::ptr::read_volatile(stub_vaddr as *const [u8; 6]);
        if bytes[0] != 0xff || bytes[1] != 0x25 {
            return 0;
        }
        let offset = i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        (stub_vaddr as i64 + 6 + i64::from(offset)) as usize
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    {
        let _ = stub_vaddr;
        0
    }
}

/// Enumerate loaded images and their mapped segments.
pub(crate) fn loaded_images() -> Vec<ImageSegments> {
    let mut images = Vec::new();
    let count = unsafe { _dyld_image_count() };
    for index in 0..count {
        let filename = unsafe {
            let raw = _dyld_get_image_name(index);
            if raw.is_null() {
                continue;
            }
            CStr::from_ptr(raw).to_string_lossy().into_owned()
        };
        let header = unsafe { _dyld_get_image_header(index) };
        if header.is_null() {
            continue;
        }
        let slide = unsafe { _dyld_get_image_vmaddr_slide(index) };
        let mut segments = Vec::new();
        unsafe {
            let mut cursor = (header as usize) + std::mem::size_of::<MachHeader64>();
            for _ in 0..(*header).ncmds {
                let command = &*(cursor as *const LoadCommand);
                if command.cmd == LC_SEGMENT_64 {
                    let segment = &*(cursor as *const SegmentCommand64);
                    if segment_name(&segment.segname) != "__PAGEZERO" {
                        segments.push(Segment {
                            vaddr: (slide as u64 + segment.vmaddr) as usize,
                            memsz: segment.vmsize as usize,
                        });
                    }
                }
                cursor += command.cmdsize as usize;
            }
        }
        images.push(ImageSegments {
            filename,
            load_address: slide as usize,
            segments,
        });
    }
    images
}
