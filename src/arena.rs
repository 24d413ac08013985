//! Executable-memory arena.
//!
//! Every generated code fragment (engine stubs, mid-hook preludes, trampolines)
//! lives in its own `ExecBuffer`: a dedicated RWX allocation that is written once
//! during construction and executed for as long as the owning hook record lives.
//! The pages stay RWX for their whole lifetime, matching how the gateway buffers
//! in the source system are managed.

use std::ffi::c_void;
use std::ptr;

use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc, VirtualFree,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use crate::errors::HookError;

/// An exclusively owned, executable allocation.
///
/// Freed with `VirtualFree(MEM_RELEASE)` on drop; callers must guarantee no thread
/// can still be executing inside the buffer by then (the hook teardown ordering
/// provides exactly that).
pub struct ExecBuffer {
    ptr: *mut u8,
    size: usize,
}

/// SAFETY: `ExecBuffer` is a raw pointer plus a length over memory this process
/// exclusively owns; nothing in it is tied to a thread or borrows non-`'static`
/// data, so moving or sharing it across threads is fine.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

impl ExecBuffer {
    /// Allocates `size` bytes of zeroed RWX memory.
    pub fn alloc(size: usize) -> Result<Self, HookError> {
        let ptr = unsafe {
            VirtualAlloc(
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        } as *mut u8;

        if ptr.is_null() {
            return Err(HookError::Alloc {
                size,
                source: windows::core::Error::from_win32(),
            });
        }

        Ok(Self { ptr, size })
    }

    /// Copies `bytes` into the buffer at `offset` and flushes the instruction
    /// cache so the new code is visible to every core.
    ///
    /// # Panics
    /// Debug-asserts that the write stays in bounds; the buffer sizes are fixed
    /// constants chosen by the callers.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.size);

        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(self.ptr.add(offset) as *const c_void),
                bytes.len(),
            );
        }
    }

    /// Base address of the buffer.
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Reads the buffer contents back out (used by tests and diagnostics).
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe {
            VirtualFree(self.ptr as *mut c_void, 0, MEM_RELEASE).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_write_read_back() {
        let buf = ExecBuffer::alloc(64).unwrap();
        assert_ne!(buf.addr(), 0);
        buf.write(0, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(&buf.as_slice()[..3], &[0xAA, 0xBB, 0xCC]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn buffer_is_executable() {
        // mov eax, 7; ret
        let buf = ExecBuffer::alloc(16).unwrap();
        buf.write(0, &[0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3]);

        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(buf.addr()) };
        assert_eq!(f(), 7);
    }
}
