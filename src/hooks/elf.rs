//! ELF relocation rewriting.
//!
//! Walks every loaded image with `dl_iterate_phdr`, parses the dynamic
//! segment to find the string table, symbol table and relocation tables
//! (`DT_PLTREL` selects whether the PLT uses REL or RELA entries), and
//! rewrites the slots of hooked symbols under a temporary `mprotect`.

use std::collections::HashSet;
use std::ffi::{c_void, CStr};

use libc::{c_int, size_t};
use log::debug;

use crate::format::{ImageSegments, Segment};
use crate::hooks::patcher::{is_skipped_image, target_address, PatchDirection};

// Dynamic-section types; the libc crate exposes the phdr iteration API
// but not these.
#[repr(C)]
struct ElfDyn {
    d_tag: i64,
    d_val: u64,
}

#[repr(C)]
struct ElfSym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

#[repr(C)]
struct ElfRela {
    r_offset: u64,
    r_info: u64,
    r_addend: i64,
}

#[repr(C)]
struct ElfRel {
    r_offset: u64,
    r_info: u64,
}

const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;

const PT_DYNAMIC: u32 = 2;
const PT_LOAD: u32 = 1;

struct PatchContext<'a> {
    direction: PatchDirection,
    patched: &'a mut HashSet<String>,
}

/// Rewrite (or restore) the hooked slots in every loaded image.
pub(crate) fn patch_all_images(direction: PatchDirection, patched: &mut HashSet<String>) {
    let mut context = PatchContext { direction, patched };
    unsafe {
        libc::dl_iterate_phdr(
            Some(patch_image_callback),
            &mut context as *mut PatchContext as *mut c_void,
        );
    }
}

unsafe extern "C" fn patch_image_callback(
    info: *mut libc::dl_phdr_info,
    _size: size_t,
    data: *mut c_void,
) -> c_int {
    let context = &mut *(data as *mut PatchContext);
    let info = &*info;
    let name = image_name(info);
    if is_skipped_image(&name) {
        return 0;
    }
    let key = format!("{name}@{:#x}", info.dlpi_addr);
    match context.direction {
        PatchDirection::Overwrite => {
            if context.patched.contains(&key) {
                return 0;
            }
            if patch_one_image(info, context.direction) {
                context.patched.insert(key);
            }
        }
        PatchDirection::Restore => {
            if context.patched.contains(&key) {
                patch_one_image(info, context.direction);
            }
        }
    }
    0
}

unsafe fn image_name(info: &libc::dl_phdr_info) -> String {
    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        // The empty name is the main executable.
        return std::fs::read_link("/proc/self/exe")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("<main>"));
    }
    CStr::from_ptr(info.dlpi_name)
        .to_string_lossy()
        .into_owned()
}

/// Dynamic-tag values may be stored absolute (glibc) or image-relative
/// (musl); anything below the load base is treated as relative.
fn tag_address(base: u64, value: u64) -> u64 {
    if value >= base {
        value
    } else {
        base.wrapping_add(value)
    }
}

unsafe fn patch_one_image(info: &libc::dl_phdr_info, direction: PatchDirection) -> bool {
    let base = info.dlpi_addr;
    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let Some(dynamic) = phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
        return false;
    };

    let mut strtab: u64 = 0;
    let mut symtab: u64 = 0;
    let mut rela: u64 = 0;
    let mut rela_size: u64 = 0;
    let mut rel: u64 = 0;
    let mut rel_size: u64 = 0;
    let mut jmprel: u64 = 0;
    let mut jmprel_size: u64 = 0;
    let mut pltrel_tag: i64 = DT_RELA;

    let mut entry = (base + dynamic.p_vaddr) as *const ElfDyn;
    while (*entry).d_tag != DT_NULL {
        let value = (*entry).d_val;
        match (*entry).d_tag {
            DT_STRTAB => strtab = tag_address(base, value),
            DT_SYMTAB => symtab = tag_address(base, value),
            DT_RELA => rela = tag_address(base, value),
            DT_RELASZ => rela_size = value,
            DT_REL => rel = tag_address(base, value),
            DT_RELSZ => rel_size = value,
            DT_JMPREL => jmprel = tag_address(base, value),
            DT_PLTRELSZ => jmprel_size = value,
            DT_PLTREL => pltrel_tag = value as i64,
            _ => {}
        }
        entry = entry.add(1);
    }

    if strtab == 0 || symtab == 0 {
        debug!("no dynamic symbol tables in image at {base:#x}; skipping");
        return false;
    }

    let mut any = false;
    if rela != 0 {
        any |= patch_rela_table(base, rela, rela_size, symtab, strtab, direction);
    }
    if rel != 0 {
        any |= patch_rel_table(base, rel, rel_size, symtab, strtab, direction);
    }
    if jmprel != 0 {
        any |= if pltrel_tag == DT_REL {
            patch_rel_table(base, jmprel, jmprel_size, symtab, strtab, direction)
        } else {
            patch_rela_table(base, jmprel, jmprel_size, symtab, strtab, direction)
        };
    }
    any
}

unsafe fn patch_rela_table(
    base: u64,
    table: u64,
    size: u64,
    symtab: u64,
    strtab: u64,
    direction: PatchDirection,
) -> bool {
    let count = size as usize / std::mem::size_of::<ElfRela>();
    let entries = std::slice::from_raw_parts(table as *const ElfRela, count);
    let mut any = false;
    for entry in entries {
        any |= patch_slot_for(base, entry.r_offset, entry.r_info, symtab, strtab, direction);
    }
    any
}

unsafe fn patch_rel_table(
    base: u64,
    table: u64,
    size: u64,
    symtab: u64,
    strtab: u64,
    direction: PatchDirection,
) -> bool {
    let count = size as usize / std::mem::size_of::<ElfRel>();
    let entries = std::slice::from_raw_parts(table as *const ElfRel, count);
    let mut any = false;
    for entry in entries {
        any |= patch_slot_for(base, entry.r_offset, entry.r_info, symtab, strtab, direction);
    }
    any
}

unsafe fn patch_slot_for(
    base: u64,
    r_offset: u64,
    r_info: u64,
    symtab: u64,
    strtab: u64,
    direction: PatchDirection,
) -> bool {
    let sym_index = (r_info >> 32) as usize;
    if sym_index == 0 {
        return false;
    }
    let sym = &*((symtab as *const ElfSym).add(sym_index));
    let name_ptr = (strtab + u64::from(sym.st_name)) as *const libc::c_char;
    let Ok(name) = CStr::from_ptr(name_ptr).to_str() else {
        return false;
    };
    let Some(target) = target_address(name, direction) else {
        return false;
    };
    let slot = (base + r_offset) as *mut usize;
    patch_slot(slot, target, name)
}

/// Overwrite one relocation slot, lifting the page protection around the
/// write and putting it back best-effort (the GOT is normally read-only
/// after relocation under RELRO).
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

/// Enumerate loaded images and their PT_LOAD segments.
pub(crate) fn loaded_images() -> Vec<ImageSegments> {
    let mut images: Vec<ImageSegments> = Vec::new();
    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: size_t,
        data: *mut c_void,
    ) -> c_int {
        let images = &mut *(data as *mut Vec<ImageSegments>);
        let info = &*info;
        let filename = image_name(info);
        let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let segments = phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .map(|p| Segment {
                vaddr: (info.dlpi_addr + p.p_vaddr) as usize,
                memsz: p.p_memsz as usize,
            })
            .collect();
        images.push(ImageSegments {
            filename,
            load_address: info.dlpi_addr as usize,
            segments,
        });
        0
    }
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut images as *mut _ as *mut c_void);
    }
    images
}
