//! Module resolution and unwind metadata lookup.

use std::ffi::c_void;
use std::mem;

use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Diagnostics::Debug::{
    IMAGE_RUNTIME_FUNCTION_ENTRY, RtlLookupFunctionEntry,
};
use windows::Win32::System::LibraryLoader::GetModuleFileNameW;
use windows::Win32::System::Memory::{MEM_IMAGE, MEMORY_BASIC_INFORMATION, VirtualQuery};

/// Returns the base address of the loaded image containing `addr`, if any.
pub fn get_module_within(addr: usize) -> Option<usize> {
    let mut mbi = MEMORY_BASIC_INFORMATION::default();
    let len = unsafe {
        VirtualQuery(
            Some(addr as *const c_void),
            &mut mbi,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };

    if len == 0 || mbi.Type != MEM_IMAGE || mbi.AllocationBase.is_null() {
        return None;
    }

    Some(mbi.AllocationBase as usize)
}

/// Full path of the module loaded at `base`.
pub fn get_module_path(base: usize) -> Option<String> {
    let mut buf = [0u16; 1024];
    let len = unsafe { GetModuleFileNameW(Some(HMODULE(base as *mut c_void)), &mut buf) };

    if len == 0 {
        return None;
    }

    Some(String::from_utf16_lossy(&buf[..len as usize]))
}

/// Function-table entry covering `ip`, or `None` for leaf/generated code that has
/// no unwind metadata.
pub fn find_function_entry(ip: u64) -> Option<*mut IMAGE_RUNTIME_FUNCTION_ENTRY> {
    let mut image_base = 0u64;
    let entry = unsafe { RtlLookupFunctionEntry(ip, &mut image_base, None) };

    (!entry.is_null()).then_some(entry)
}

/// Renders `addr` as `module.dll+0x1234`, falling back to the bare address when
/// the module cannot be resolved.
pub fn format_address(addr: usize) -> String {
    if let Some(base) = get_module_within(addr) {
        if let Some(path) = get_module_path(base) {
            let name = path.rsplit('\\').next().unwrap_or(path.as_str());
            return format!("{}+{:#x}", name, addr - base);
        }
    }

    format!("{addr:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_our_own_image() {
        let addr = resolves_our_own_image as usize;
        let base = get_module_within(addr).expect("test code lives in an image");
        assert!(base <= addr);
        assert!(get_module_path(base).is_some());
    }

    #[test]
    fn heap_is_not_an_image() {
        let boxed = Box::new(0u64);
        assert_eq!(get_module_within(&*boxed as *const u64 as usize), None);
    }

    #[test]
    fn formats_unknown_addresses_as_hex() {
        let boxed = Box::new(0u64);
        let addr = &*boxed as *const u64 as usize;
        assert_eq!(format_address(addr), format!("{addr:#x}"));
    }
}
