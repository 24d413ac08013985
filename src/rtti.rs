//! MSVC x64 RTTI reader.
//!
//! A vtable produced by MSVC is preceded by a pointer to a complete object
//! locator; the locator carries RVAs back into its own image, including one to
//! itself, which makes false positives cheap to reject. Everything here works on
//! those invariants: `is_vtable` validates a candidate address, `get_type_info`
//! extracts the decorated class name behind it, and `find_all_vtables` sweeps a
//! module for every address that passes validation.

use std::ffi::CStr;
use std::mem;

use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS64;
use windows::Win32::System::SystemServices::{
    IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
};

use crate::memory;
use crate::module;

/// `_RTTICompleteObjectLocator`, 64-bit layout. All cross-references are RVAs.
#[repr(C)]
struct CompleteObjectLocator {
    signature: u32,
    offset: u32,
    cd_offset: u32,
    type_descriptor: u32,
    class_descriptor: u32,
    self_rva: u32,
}

/// On x64 the locator signature is always 1 (RVA-based references).
const COL_SIGNATURE_X64: u32 = 1;

/// Offset of the decorated name inside a `TypeDescriptor` (vftable pointer plus
/// spare pointer precede it).
const TYPE_NAME_OFFSET: usize = 2 * mem::size_of::<usize>();

/// Decorated class name behind a vtable, with a light undecorator for display.
pub struct TypeInfo {
    decorated: String,
}

impl TypeInfo {
    /// Raw decorated MSVC name, e.g. `.?AVHooker@@`.
    pub fn name(&self) -> &str {
        &self.decorated
    }

    /// Human-readable rendition: `.?AVFoo@detail@app@@` becomes `app::detail::Foo`.
    pub fn undecorated(&self) -> String {
        undecorate(&self.decorated)
    }
}

fn undecorate(decorated: &str) -> String {
    let stripped = decorated
        .strip_prefix(".?AV")
        .or_else(|| decorated.strip_prefix(".?AU"))
        .unwrap_or(decorated);
    let stripped = stripped.strip_suffix("@@").unwrap_or(stripped);

    let mut parts: Vec<&str> = stripped.split('@').filter(|p| !p.is_empty()).collect();
    parts.reverse();
    parts.join("::")
}

/// Validates and returns the complete object locator referenced just before
/// `vtable_addr`, together with its image base.
fn locate_col(vtable_addr: usize) -> Option<(&'static CompleteObjectLocator, usize)> {
    let col_slot = vtable_addr.checked_sub(mem::size_of::<usize>())?;
    if !memory::is_readable(col_slot, mem::size_of::<usize>()) {
        return None;
    }

    let col_addr = unsafe { (col_slot as *const usize).read_volatile() };
    if !memory::is_readable(col_addr, mem::size_of::<CompleteObjectLocator>()) {
        return None;
    }

    let image_base = module::get_module_within(col_addr)?;
    let col = unsafe { &*(col_addr as *const CompleteObjectLocator) };

    if col.signature != COL_SIGNATURE_X64 {
        return None;
    }

    // The locator stores its own RVA; a mismatch means we are looking at data
    // that merely resembles one.
    if image_base.checked_add(col.self_rva as usize) != Some(col_addr) {
        return None;
    }

    let td_addr = image_base + col.type_descriptor as usize;
    if !memory::is_readable(td_addr, TYPE_NAME_OFFSET + 4) {
        return None;
    }

    let name = unsafe { (td_addr as *const u8).add(TYPE_NAME_OFFSET) };
    let prefix = unsafe { std::slice::from_raw_parts(name, 3) };
    if prefix != b".?A" {
        return None;
    }

    Some((col, image_base))
}

/// True when `addr` is the first slot of an MSVC vtable.
pub fn is_vtable(addr: usize) -> bool {
    locate_col(addr).is_some()
}

/// Type information for the class whose vtable starts at `vtable_addr`.
pub fn get_type_info(vtable_addr: usize) -> Option<TypeInfo> {
    let (col, image_base) = locate_col(vtable_addr)?;
    let name_addr = image_base + col.type_descriptor as usize + TYPE_NAME_OFFSET;

    // Decorated names are short; 256 bytes is far beyond anything MSVC emits for
    // a class name, and the readability check keeps the CStr scan in bounds.
    if !memory::is_readable(name_addr, 256) {
        return None;
    }

    let raw = unsafe { CStr::from_ptr(name_addr as *const i8) };
    Some(TypeInfo {
        decorated: raw.to_string_lossy().into_owned(),
    })
}

fn image_size(base: usize) -> Option<usize> {
    if !memory::is_readable(base, mem::size_of::<IMAGE_DOS_HEADER>()) {
        return None;
    }

    let dos = unsafe { &*(base as *const IMAGE_DOS_HEADER) };
    if dos.e_magic != IMAGE_DOS_SIGNATURE {
        return None;
    }

    let nt_addr = base.checked_add(dos.e_lfanew as usize)?;
    if !memory::is_readable(nt_addr, mem::size_of::<IMAGE_NT_HEADERS64>()) {
        return None;
    }

    let nt = unsafe { &*(nt_addr as *const IMAGE_NT_HEADERS64) };
    if nt.Signature != IMAGE_NT_SIGNATURE {
        return None;
    }

    Some(nt.OptionalHeader.SizeOfImage as usize)
}

/// Every vtable base address found inside `module`, in ascending order.
pub fn find_all_vtables(module: HMODULE) -> Vec<usize> {
    let base = module.0 as usize;
    let Some(size) = image_size(base) else {
        return Vec::new();
    };

    let step = mem::size_of::<usize>();
    let mut found = Vec::new();
    let mut addr = base + step;

    while addr + step <= base + size {
        // Skip unreadable stretches a region at a time instead of probing every
        // qword in them.
        if !memory::is_readable(addr, step) {
            addr += 0x1000 - (addr & 0xFFF);
            continue;
        }

        if is_vtable(addr) {
            found.push(addr);
        }

        addr += step;
    }

    found
}

/// Vtables in `module` whose undecorated class name contains `name`.
pub fn find_vtables(module: HMODULE, name: &str) -> Vec<usize> {
    find_all_vtables(module)
        .into_iter()
        .filter(|&vt| {
            get_type_info(vt)
                .map(|ti| ti.undecorated().contains(name))
                .unwrap_or(false)
        })
        .collect()
}
