//! The vtable hook-set.
//!
//! `Hooker` owns one hooked vtable: a record per hookable slot, each wired
//! through the mid-hook primitive into the shared [`dispatch`] function. The
//! records carry all the state the dispatcher needs (the target vtable base and
//! the mismatch flag are threaded in at construction), so dispatch never reaches
//! back into the hook-set itself and teardown ordering stays simple: restore
//! prologue patches, disable every trampoline, then let the records drop.

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use log::{error, info, warn};
use once_cell::sync::{Lazy, OnceCell};
use windows::Win32::System::Diagnostics::Debug::{
    CONTEXT, CONTEXT_FULL_AMD64, RtlVirtualUnwind, UNW_FLAG_NHANDLER,
};

use crate::arena::ExecBuffer;
use crate::memory;
use crate::midhook::{Context, MidHook, MidHookFlags};
use crate::module;
use crate::rtti;
use crate::scanner;
use crate::stub;

/// Cap on captured stack depth; deeper frames are dropped, not an error.
const MAX_STACK_FRAMES: usize = 128;

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the first observation. Never returns zero, which
/// is reserved as the "never called" sentinel.
fn monotonic_nanos() -> u64 {
    (CLOCK_ANCHOR.elapsed().as_nanos() as u64).max(1)
}

/// One hooked vtable slot.
pub struct Hook {
    index: usize,
    target: usize,
    vtable: usize,
    ignore_mismatch: Arc<AtomicBool>,

    calls: AtomicUsize,
    last_return_address: AtomicUsize,
    last_call_ns: AtomicU64,
    delta_ns: AtomicU64,
    callstack: RwLock<Vec<usize>>,
    original_byte: Mutex<Option<u8>>,

    // Late-bound: the stub needs this record's address and the trampoline needs
    // the stub's, so both are attached after construction. Declared in teardown
    // order: the trampoline must drop (and restore the prologue) before its stub
    // buffer goes away.
    midhook: OnceCell<MidHook>,
    stub: OnceCell<ExecBuffer>,
}

/// SAFETY: `Hook` holds raw addresses into the host process and otherwise only
/// atomics, locks and exclusively owned buffers; every mutation of target code
/// goes through `patch_bytes`. Sharing records across threads is the whole
/// point of the dispatcher.
unsafe impl Send for Hook {}
unsafe impl Sync for Hook {}

impl Hook {
    fn new(index: usize, target: usize, vtable: usize, ignore_mismatch: Arc<AtomicBool>) -> Self {
        Self {
            index,
            target,
            vtable,
            ignore_mismatch,
            calls: AtomicUsize::new(0),
            last_return_address: AtomicUsize::new(0),
            last_call_ns: AtomicU64::new(0),
            delta_ns: AtomicU64::new(0),
            callstack: RwLock::new(Vec::new()),
            original_byte: Mutex::new(None),
            midhook: OnceCell::new(),
            stub: OnceCell::new(),
        }
    }

    /// Ordinal of this slot in its vtable.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the original virtual function.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Times the dispatcher has accounted a call through this slot.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Most recent caller return address, or 0 before the first call.
    pub fn last_return_address(&self) -> usize {
        self.last_return_address.load(Ordering::Acquire)
    }

    /// Monotonic timestamp of the most recent call, in nanoseconds; 0 before
    /// the first call.
    pub fn last_call_nanos(&self) -> u64 {
        self.last_call_ns.load(Ordering::Acquire)
    }

    /// Nanoseconds between the two most recent calls; 0 until the second call.
    pub fn delta_nanos(&self) -> u64 {
        self.delta_ns.load(Ordering::Acquire)
    }

    /// Returns a copy of the most recently captured callstack.
    pub fn callstack(&self) -> Vec<usize> {
        match self.callstack.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Overwrites the first byte of the target with `ret`, neutralizing the
    /// method. The original byte is recorded once, before the first patch.
    pub fn insert_ret(&self) {
        let mut original = match self.original_byte.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if original.is_none() {
            *original = Some(unsafe { (self.target as *const u8).read_volatile() });
        }

        match memory::patch_bytes(self.target, &[memory::RET_OPCODE]) {
            Ok(()) => info!(
                "Inserted ret instruction at index: {} ({:#x})",
                self.index, self.target
            ),
            Err(e) => error!("Failed to insert ret at {:#x}: {e}", self.target),
        }
    }

    /// Puts the recorded original byte back. No-op when nothing was patched.
    pub fn restore(&self) {
        let original = match self.original_byte.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(byte) = *original else {
            return;
        };

        match memory::patch_bytes(self.target, &[byte]) {
            Ok(()) => info!(
                "Restored original instruction at index: {} ({:#x})",
                self.index, self.target
            ),
            Err(e) => error!("Failed to restore byte at {:#x}: {e}", self.target),
        }
    }
}

/// Accounting callback every slot stub tail-jumps into.
///
/// Fixed C ABI and a fixed address: the generated stubs embed this function's
/// absolute address next to their per-record data pointer.
pub(crate) unsafe extern "C" fn dispatch(ctx: *mut Context, hook: *const Hook) {
    let (ctx, hook) = unsafe { (&*ctx, &*hook) };

    // A function this vtable shares with another class arrives here with a
    // receiver whose vtable slot is not ours; skip the accounting entirely.
    // The receiver read is guarded: a non-method slot may not carry `this`.
    if !hook.ignore_mismatch.load(Ordering::Relaxed) {
        let receiver = ctx.rcx as usize;
        if !memory::is_readable(receiver, mem::size_of::<usize>()) {
            return;
        }
        let receiver_vtable = unsafe { (receiver as *const usize).read_volatile() };
        if receiver_vtable != hook.vtable {
            return;
        }
    }

    let calls = hook.calls.fetch_add(1, Ordering::AcqRel) + 1;
    if calls == 1 {
        info!("Hook {} called for the first time!", hook.index);
    }

    let return_address = unsafe { (ctx.rsp as *const usize).read_volatile() };
    hook.last_return_address
        .store(return_address, Ordering::Release);

    let now = monotonic_nanos();
    let last = hook.last_call_ns.swap(now, Ordering::AcqRel);
    // Racing dispatches can swap out of order, leaving `last` ahead of `now`;
    // clamp instead of wrapping.
    let delta = if last == 0 { 0 } else { now.saturating_sub(last) };
    hook.delta_ns.store(delta, Ordering::Release);

    // Walk the caller chain via unwind metadata. The snapshot rip points into
    // the hook machinery, so the first frame is seeded from the original target.
    let mut context = CONTEXT {
        ContextFlags: CONTEXT_FULL_AMD64,
        ..Default::default()
    };
    context.Rip = hook.target as u64;
    context.Rsp = ctx.rsp;
    context.Rbp = ctx.rbp;
    context.Rax = ctx.rax;
    context.Rbx = ctx.rbx;
    context.Rcx = ctx.rcx;
    context.Rdx = ctx.rdx;
    context.Rsi = ctx.rsi;
    context.Rdi = ctx.rdi;
    context.R8 = ctx.r8;
    context.R9 = ctx.r9;
    context.R10 = ctx.r10;
    context.R11 = ctx.r11;
    context.R12 = ctx.r12;
    context.R13 = ctx.r13;
    context.R14 = ctx.r14;
    context.R15 = ctx.r15;

    let mut frames = [0usize; MAX_STACK_FRAMES];
    let mut depth = 0;

    while depth < MAX_STACK_FRAMES {
        let control_pc = context.Rip;
        frames[depth] = control_pc as usize;
        depth += 1;

        let image_base = module::get_module_within(control_pc as usize).unwrap_or(0) as u64;

        let Some(entry) = module::find_function_entry(control_pc) else {
            if calls == 1 {
                warn!(
                    "Failed to find runtime function for {}",
                    module::format_address(control_pc as usize)
                );
            }
            break;
        };

        let mut handler_data = ptr::null_mut();
        let mut establisher_frame = 0u64;
        let _ = unsafe {
            RtlVirtualUnwind(
                UNW_FLAG_NHANDLER,
                image_base,
                control_pc,
                entry,
                &mut context,
                &mut handler_data,
                &mut establisher_frame,
                None,
            )
        };

        if context.Rip == 0 {
            break;
        }
    }

    let mut stack = match hook.callstack.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    stack.clear();
    stack.extend_from_slice(&frames[..depth]);
}

/// A hooked vtable: every hookable slot wired through the shared dispatcher.
///
/// Dropping the set restores any prologue patches, disables every trampoline,
/// and releases the per-slot machinery, leaving the process as it was found.
pub struct Hooker {
    target: *mut usize,
    type_name: Option<String>,
    hooks: Vec<Arc<Hook>>,
    hook_map: HashMap<usize, Arc<Hook>>,
    ignore_mismatch: Arc<AtomicBool>,
}

/// SAFETY: the vtable pointer is never written through, and every other field
/// is `Send + Sync` in its own right (see `Hook`).
unsafe impl Send for Hooker {}
unsafe impl Sync for Hooker {}

impl Hooker {
    /// Number of hookable entries in the vtable at `vtable`.
    pub fn count(vtable: *const usize) -> usize {
        scanner::count(vtable)
    }

    /// Hooks every hookable slot of the vtable at `vtable`.
    ///
    /// All slots are wired start-disabled first and enabled in a second pass,
    /// so the dispatcher can never observe a half-installed record.
    pub fn new(vtable: *mut usize) -> Self {
        let target = vtable as usize;
        let type_name = rtti::get_type_info(target).map(|ti| ti.undecorated());

        match &type_name {
            Some(name) => info!("Hooking vtable at {target:#x} ({name})"),
            None => info!("Hooking vtable at {target:#x}"),
        }

        let ignore_mismatch = Arc::new(AtomicBool::new(false));
        let mut hooks = Vec::new();
        let mut hook_map = HashMap::new();

        for slot in scanner::scan(vtable) {
            info!("Hooking {} at {:#x}", slot.index, slot.target);

            let hook = Arc::new(Hook::new(
                slot.index,
                slot.target,
                target,
                Arc::clone(&ignore_mismatch),
            ));

            let stub = match stub::create_stub(dispatch as usize, Arc::as_ptr(&hook) as usize) {
                Ok(stub) => stub,
                Err(e) => {
                    error!("Failed to build stub for index: {}, error: {e}", slot.index);
                    continue;
                }
            };

            let mid = match MidHook::create(slot.target, stub.addr(), MidHookFlags::StartDisabled)
            {
                Ok(mid) => mid,
                Err(e) => {
                    error!("Failed to hook index: {}, error: {e}", slot.index);
                    continue;
                }
            };

            hook.stub.set(stub).ok();
            hook.midhook.set(mid).ok();

            hook_map.insert(slot.index, Arc::clone(&hook));
            hooks.push(hook);
        }

        // Enable in a second pass, once every record is fully wired.
        for hook in &hooks {
            if let Some(mid) = hook.midhook.get() {
                if let Err(e) = mid.enable() {
                    error!("Failed to enable hook for index: {}, error: {e}", hook.index);
                }
            }
        }

        info!("Done hooking vtable at {target:#x}");

        Self {
            target: vtable,
            type_name,
            hooks,
            hook_map,
            ignore_mismatch,
        }
    }

    /// Base address of the hooked vtable.
    pub fn get_target(&self) -> usize {
        self.target as usize
    }

    /// Undecorated class name behind the vtable, when RTTI resolved one.
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Records in vtable order.
    pub fn get_hooks(&self) -> &[Arc<Hook>] {
        &self.hooks
    }

    /// Records indexed by slot number.
    pub fn hooks_by_slot(&self) -> &HashMap<usize, Arc<Hook>> {
        &self.hook_map
    }

    /// Record for `vtable_index`, if that slot was hooked. Slot counts are
    /// small; a linear scan over the ordered sequence is fine.
    pub fn find_hook(&self, vtable_index: usize) -> Option<Arc<Hook>> {
        self.hooks
            .iter()
            .find(|hook| hook.index == vtable_index)
            .cloned()
    }

    /// When set, the dispatcher accounts calls even if the receiver's vtable is
    /// not the hooked one.
    pub fn set_ignore_vtable_mismatch(&self, ignore: bool) {
        self.ignore_mismatch.store(ignore, Ordering::Relaxed);
    }

    pub fn ignore_vtable_mismatch(&self) -> bool {
        self.ignore_mismatch.load(Ordering::Relaxed)
    }
}

impl Drop for Hooker {
    fn drop(&mut self) {
        info!("Unhooking vtable at {:#x}", self.target as usize);

        for hook in &self.hooks {
            hook.restore();
        }

        // Disable before any record can drop; after this returns no thread can
        // be entering a stub, and threads already inside finish through the
        // still-live trampolines.
        for hook in &self.hooks {
            if let Some(mid) = hook.midhook.get() {
                if let Err(e) = mid.disable() {
                    error!("Failed to disable hook for index: {}, error: {e}", hook.index);
                }
            }
        }
    }
}

#[cfg(all(test, windows, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn null_vtable_yields_an_empty_set() {
        let hooker = Hooker::new(std::ptr::null_mut());
        assert_eq!(Hooker::count(std::ptr::null()), 0);
        assert!(hooker.get_hooks().is_empty());
        assert!(hooker.find_hook(0).is_none());
    }

    #[test]
    fn mismatch_flag_round_trips() {
        let hooker = Hooker::new(std::ptr::null_mut());
        assert!(!hooker.ignore_vtable_mismatch());
        hooker.set_ignore_vtable_mismatch(true);
        assert!(hooker.ignore_vtable_mismatch());
    }

    #[test]
    fn clock_never_reports_zero() {
        assert_ne!(monotonic_nanos(), 0);
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }
}
