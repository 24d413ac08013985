//! Runtime vtable instrumentation engine.
//!
//! Injected into a target process, this library scans a C++ vtable for its
//! hookable slots, wires every slot through a shared accounting dispatcher, and
//! lets an operator watch call counts, caller return addresses and captured
//! callstacks per virtual method, or neutralize a method outright by patching
//! its prologue to an immediate `ret`. Dropping the hook-set puts every byte
//! back the way it was found.
//!
//! x86-64 Windows only; the dispatcher's receiver guard and the generated
//! thunks are built around the Microsoft calling convention.

#![allow(non_snake_case)]

pub mod arena;
pub mod errors;
pub mod hooker;
mod logger;
pub mod memory;
pub mod midhook;
pub mod module;
pub mod rtti;
pub mod scanner;
pub mod stub;

pub use errors::HookError;
pub use hooker::{Hook, Hooker};
pub use midhook::{Context, MidHook, MidHookFlags};

use std::sync::Mutex;

/// The one active hook-set, replaceable from the operator side; a replaced set
/// tears down as the new one is installed.
static ACTIVE_HOOKER: Mutex<Option<Hooker>> = Mutex::new(None);

/// Hooks the vtable at `vtable`, tearing down any previously active hook-set.
pub fn hook_vtable(vtable: *mut usize) {
    let hooker = Hooker::new(vtable);
    let mut active = match ACTIVE_HOOKER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *active = Some(hooker);
}

/// Tears down the active hook-set, if any.
pub fn unhook_vtable() {
    let mut active = match ACTIVE_HOOKER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *active = None;
}

/// Runs `f` with a view of the active hook-set.
pub fn with_active_hooker<R>(f: impl FnOnce(Option<&Hooker>) -> R) -> R {
    let active = match ACTIVE_HOOKER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(active.as_ref())
}

#[cfg(windows)]
mod bootstrap {
    use super::*;
    use flexi_logger::LoggerHandle;
    use log::info;
    use once_cell::sync::OnceCell;
    use std::thread;
    use windows::Win32::Foundation::{HINSTANCE, HMODULE};
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    /// Keeps the logger alive for the process lifetime.
    static LOG_HANDLE: OnceCell<LoggerHandle> = OnceCell::new();

    /// Windows-recommended pattern: do minimal work under loader lock, spawn a
    /// thread for everything else. Hooking itself is driven by the operator
    /// through the public API.
    #[unsafe(no_mangle)]
    pub extern "system" fn DllMain(hinst: HINSTANCE, reason: u32, _: *mut ()) -> bool {
        match reason {
            DLL_PROCESS_ATTACH => unsafe {
                // No per-thread attach work here, so skip the notifications.
                DisableThreadLibraryCalls(HMODULE::from(hinst)).ok();

                thread::spawn(|| {
                    if let Ok(handle) = logger::init_logger() {
                        LOG_HANDLE.set(handle).ok();
                        info!("vtable-probe loaded");
                    }
                });
            },

            DLL_PROCESS_DETACH => {
                // Restore every patched prologue before the image goes away.
                unhook_vtable();
            }

            _ => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_slot_replaces_and_clears() {
        hook_vtable(std::ptr::null_mut());
        with_active_hooker(|h| assert!(h.is_some()));
        hook_vtable(std::ptr::null_mut());
        with_active_hooker(|h| assert!(h.is_some()));
        unhook_vtable();
        with_active_hooker(|h| assert!(h.is_none()));
    }
}
