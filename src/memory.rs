//! Memory classification and code patching.
//!
//! The scanner and the dispatcher both lean on `VirtualQuery` to decide whether an
//! address may be dereferenced or executed; every code write in the crate funnels
//! through [`patch_bytes`], which does the protect / copy / restore / flush dance
//! in one place.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY, VirtualProtect,
    VirtualQuery,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use crate::errors::HookError;

/// One-byte `ret`.
pub const RET_OPCODE: u8 = 0xC3;
/// One-byte `nop`.
pub const NOP_OPCODE: u8 = 0x90;

fn query(addr: usize) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut mbi = MEMORY_BASIC_INFORMATION::default();
    let len = unsafe {
        VirtualQuery(
            Some(addr as *const c_void),
            &mut mbi,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };

    (len != 0).then_some(mbi)
}

fn region_matches(addr: usize, len: usize, accept: impl Fn(u32) -> bool) -> bool {
    let mut cursor = addr;
    let end = addr.checked_add(len).unwrap_or(usize::MAX);

    while cursor < end {
        let Some(mbi) = query(cursor) else {
            return false;
        };

        if mbi.State != MEM_COMMIT || !accept(mbi.Protect.0) {
            return false;
        }

        cursor = mbi.BaseAddress as usize + mbi.RegionSize;
    }

    true
}

/// True when `len` bytes starting at `addr` can be read without faulting.
pub fn is_readable(addr: usize, len: usize) -> bool {
    if addr == 0 || len == 0 {
        return false;
    }

    const READABLE: u32 = PAGE_READONLY.0
        | PAGE_READWRITE.0
        | PAGE_WRITECOPY.0
        | PAGE_EXECUTE_READ.0
        | PAGE_EXECUTE_READWRITE.0
        | PAGE_EXECUTE_WRITECOPY.0;

    region_matches(addr, len, |p| {
        p & READABLE != 0 && p & (PAGE_GUARD.0 | PAGE_NOACCESS.0) == 0
    })
}

/// True when `len` bytes starting at `addr` lie in committed executable memory.
pub fn is_good_code_ptr(addr: usize, len: usize) -> bool {
    if addr == 0 || len == 0 {
        return false;
    }

    const EXECUTABLE: u32 = PAGE_EXECUTE.0
        | PAGE_EXECUTE_READ.0
        | PAGE_EXECUTE_READWRITE.0
        | PAGE_EXECUTE_WRITECOPY.0;

    region_matches(addr, len, |p| {
        p & EXECUTABLE != 0 && p & (PAGE_GUARD.0 | PAGE_NOACCESS.0) == 0
    })
}

/// True when `code` is a trivial stub: a lone `ret`, optionally behind `nop`
/// padding. Such slots carry no behaviour worth observing.
pub fn is_stub_code(code: &[u8]) -> bool {
    let mut bytes = code.iter().copied();

    loop {
        match bytes.next() {
            Some(NOP_OPCODE) => continue,
            Some(RET_OPCODE) => return true,
            _ => return false,
        }
    }
}

/// Writes `bytes` over code at `addr` under a temporary RWX window, restoring the
/// previous protection and flushing the instruction cache afterwards.
pub fn patch_bytes(addr: usize, bytes: &[u8]) -> Result<(), HookError> {
    let mut old = PAGE_PROTECTION_FLAGS::default();

    unsafe {
        VirtualProtect(
            addr as *const c_void,
            bytes.len(),
            PAGE_EXECUTE_READWRITE,
            &mut old,
        )
        .map_err(|source| HookError::Protection {
            address: addr,
            source,
        })?;

        ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());

        let mut scratch = PAGE_PROTECTION_FLAGS::default();
        VirtualProtect(addr as *const c_void, bytes.len(), old, &mut scratch).ok();

        let _ = FlushInstructionCache(
            GetCurrentProcess(),
            Some(addr as *const c_void),
            bytes.len(),
        );
    }

    Ok(())
}
