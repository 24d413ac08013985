//! Mid-function hook primitive.
//!
//! Installing a hook overwrites the first 14 bytes of the target with
//! `jmp [rip+0]` into a per-hook prelude. The prelude smuggles a pointer to this
//! hook's descriptor onto the stack and jumps to a shared capture routine, which
//! snapshots every general-purpose register (plus the volatile XMM registers)
//! into a [`Context`], calls the hook's callback with a pointer to that snapshot,
//! restores the registers and resumes the displaced original instructions from a
//! relocated trampoline.
//!
//! The callback therefore runs at the very first instruction of the target with
//! a faithful view of the guest CPU state: `ctx.rcx` is the receiver of a
//! virtual call, `[ctx.rsp]` is the caller's return address.

use std::sync::atomic::{AtomicBool, Ordering};

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, InstructionBlock,
};
use log::error;

use crate::arena::ExecBuffer;
use crate::errors::HookError;
use crate::memory;

/// Bytes displaced at the target by the `jmp [rip+0]` patch.
pub const JMP_PATCH_LEN: usize = 14;

/// Size of the per-hook prelude emitted into the code buffer.
const PRELUDE_LEN: usize = 29;

/// Trampoline start inside the per-hook code buffer.
const TRAMPOLINE_OFFSET: usize = 32;

/// Per-hook code buffer size: prelude, trampoline, slack for re-encoding.
const CODE_BUFFER_LEN: usize = 128;

/// Prologue window handed to the decoder.
const DECODE_WINDOW: usize = 32;

/// Guest register snapshot passed to the hook callback.
///
/// Field order matches the capture routine's stack layout; do not reorder.
/// `rsp` holds the stack pointer as it was at the first instruction of the
/// target, and `rip` the address of the target itself.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
}

/// Per-hook descriptor read by the capture routine. Field offsets are baked
/// into the assembly; do not reorder.
#[repr(C)]
struct ThunkData {
    target: u64,
    callback: u64,
    trampoline: u64,
}

// Shared capture routine. Stack on entry, arranged by the prelude:
//   [rsp]   = ThunkData pointer
//   [rsp+8] = caller return address (the guest rsp points here)
//
// The ThunkData slot is overwritten with the trampoline address once the
// descriptor has been read, so the trailing `ret` resumes the displaced
// original instructions with every register restored.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".balign 16",
    ".globl vtable_probe_capture",
    "vtable_probe_capture:",
    "sub rsp, 0x88",
    "mov [rsp + 0x00], rax",
    "mov [rsp + 0x08], rcx",
    "mov [rsp + 0x10], rdx",
    "mov [rsp + 0x18], rbx",
    "mov [rsp + 0x20], rsi",
    "mov [rsp + 0x28], rdi",
    "mov [rsp + 0x30], rbp",
    "mov [rsp + 0x38], r8",
    "mov [rsp + 0x40], r9",
    "mov [rsp + 0x48], r10",
    "mov [rsp + 0x50], r11",
    "mov [rsp + 0x58], r12",
    "mov [rsp + 0x60], r13",
    "mov [rsp + 0x68], r14",
    "mov [rsp + 0x70], r15",
    "lea rax, [rsp + 0x90]",
    "mov [rsp + 0x78], rax",
    "mov rax, [rsp + 0x88]",
    "mov rcx, [rax + 0x00]",
    "mov [rsp + 0x80], rcx",
    "mov rcx, [rax + 0x10]",
    "mov [rsp + 0x88], rcx",
    "mov rax, [rax + 0x08]",
    "sub rsp, 0x68",
    "movups [rsp + 0x00], xmm0",
    "movups [rsp + 0x10], xmm1",
    "movups [rsp + 0x20], xmm2",
    "movups [rsp + 0x30], xmm3",
    "movups [rsp + 0x40], xmm4",
    "movups [rsp + 0x50], xmm5",
    "lea rcx, [rsp + 0x68]",
    "sub rsp, 0x20",
    "call rax",
    "add rsp, 0x20",
    "movups xmm0, [rsp + 0x00]",
    "movups xmm1, [rsp + 0x10]",
    "movups xmm2, [rsp + 0x20]",
    "movups xmm3, [rsp + 0x30]",
    "movups xmm4, [rsp + 0x40]",
    "movups xmm5, [rsp + 0x50]",
    "add rsp, 0x68",
    "mov rax, [rsp + 0x00]",
    "mov rcx, [rsp + 0x08]",
    "mov rdx, [rsp + 0x10]",
    "mov rbx, [rsp + 0x18]",
    "mov rsi, [rsp + 0x20]",
    "mov rdi, [rsp + 0x28]",
    "mov rbp, [rsp + 0x30]",
    "mov r8,  [rsp + 0x38]",
    "mov r9,  [rsp + 0x40]",
    "mov r10, [rsp + 0x48]",
    "mov r11, [rsp + 0x50]",
    "mov r12, [rsp + 0x58]",
    "mov r13, [rsp + 0x60]",
    "mov r14, [rsp + 0x68]",
    "mov r15, [rsp + 0x70]",
    "add rsp, 0x88",
    "ret",
);

unsafe extern "C" {
    fn vtable_probe_capture();
}

/// `jmp [rip+0]` through an inline absolute address. Clobbers no registers,
/// which is what lets the capture routine report an untouched guest state.
fn jmp_shellcode(destination: usize) -> [u8; JMP_PATCH_LEN] {
    let mut code = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
    code[6..].copy_from_slice(&(destination as u64).to_le_bytes());
    code
}

/// Per-hook prelude: preserve `rax`, swap the descriptor pointer into the slot
/// `push` just made, and fall through to the shared capture routine.
fn prelude_shellcode(data: *const ThunkData) -> [u8; PRELUDE_LEN] {
    let mut code = [0u8; PRELUDE_LEN];
    code[0] = 0x50; // push rax
    code[1..3].copy_from_slice(&[0x48, 0xB8]); // movabs rax, data
    code[3..11].copy_from_slice(&(data as u64).to_le_bytes());
    code[11..15].copy_from_slice(&[0x48, 0x87, 0x04, 0x24]); // xchg [rsp], rax
    code[15..21].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]); // jmp [rip+0]
    code[21..29].copy_from_slice(&(vtable_probe_capture as usize as u64).to_le_bytes());
    code
}

/// Relocates at least [`JMP_PATCH_LEN`] bytes of whole instructions from
/// `target` to `trampoline_rip`, returning the re-encoded bytes and the number
/// of source bytes consumed.
fn relocate_prologue(target: usize, trampoline_rip: usize) -> Result<(Vec<u8>, usize), HookError> {
    let bytes = unsafe { std::slice::from_raw_parts(target as *const u8, DECODE_WINDOW) };
    let mut decoder = Decoder::with_ip(64, bytes, target as u64, DecoderOptions::NONE);

    let mut consumed = 0;
    let mut instructions = Vec::new();

    for instr in &mut decoder {
        if instr.is_invalid() {
            return Err(HookError::InvalidBytes { address: target });
        }

        if consumed >= JMP_PATCH_LEN {
            break;
        }

        if instr.is_ip_rel_memory_operand() {
            return Err(HookError::UnrelocatableInstruction { address: target });
        }

        match instr.flow_control() {
            FlowControl::Next | FlowControl::Return => {
                consumed += instr.len();
                instructions.push(instr);
            }
            _ => {
                return Err(HookError::UnrelocatableInstruction { address: target });
            }
        }
    }

    if consumed < JMP_PATCH_LEN {
        return Err(HookError::NotEnoughBytes {
            address: target,
            have: consumed,
            need: JMP_PATCH_LEN,
        });
    }

    let block = InstructionBlock::new(&instructions, trampoline_rip as u64);
    let mut encoded = BlockEncoder::encode(decoder.bitness(), block, BlockEncoderOptions::NONE)
        .map(|b| b.code_buffer)
        .map_err(|e| HookError::Encoding {
            address: target,
            reason: e.to_string(),
        })?;

    // Resume past the displaced source bytes, not past the re-encoded copy; the
    // two lengths can differ.
    encoded.extend_from_slice(&jmp_shellcode(target + consumed));

    Ok((encoded, consumed))
}

/// Creation flags for [`MidHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidHookFlags {
    /// Patch the target immediately.
    Immediate,
    /// Wire everything up but leave the target untouched until [`MidHook::enable`].
    StartDisabled,
}

/// An installed (or armed) mid-function hook.
///
/// While enabled, control arriving at `target` is redirected through the capture
/// routine into `callback`; dropping the hook restores the original prologue.
pub struct MidHook {
    target: usize,
    saved: [u8; JMP_PATCH_LEN],
    enabled: AtomicBool,
    data: Box<ThunkData>,
    code: ExecBuffer,
}

/// SAFETY: `MidHook` owns its code buffer and descriptor outright; `target` is a
/// raw address it never aliases mutably outside `patch_bytes`. Enable state is
/// atomic. Sharing across threads is sound.
unsafe impl Send for MidHook {}
unsafe impl Sync for MidHook {}

impl MidHook {
    /// Wires a mid-hook at `target` invoking `callback` (a code address that
    /// must expect a `*mut Context` in `rcx` and return normally).
    pub fn create(
        target: usize,
        callback: usize,
        flags: MidHookFlags,
    ) -> Result<Self, HookError> {
        if !memory::is_readable(target, DECODE_WINDOW) {
            return Err(HookError::UnreadableTarget { address: target });
        }

        let code = ExecBuffer::alloc(CODE_BUFFER_LEN)?;
        let trampoline_rip = code.addr() + TRAMPOLINE_OFFSET;

        let (trampoline, _consumed) = relocate_prologue(target, trampoline_rip)?;
        if TRAMPOLINE_OFFSET + trampoline.len() > CODE_BUFFER_LEN {
            return Err(HookError::Encoding {
                address: target,
                reason: format!("trampoline of {} bytes exceeds the code buffer", trampoline.len()),
            });
        }

        let data = Box::new(ThunkData {
            target: target as u64,
            callback: callback as u64,
            trampoline: trampoline_rip as u64,
        });

        code.write(0, &prelude_shellcode(&*data));
        code.write(TRAMPOLINE_OFFSET, &trampoline);

        let mut saved = [0u8; JMP_PATCH_LEN];
        unsafe {
            std::ptr::copy_nonoverlapping(target as *const u8, saved.as_mut_ptr(), JMP_PATCH_LEN);
        }

        let hook = Self {
            target,
            saved,
            enabled: AtomicBool::new(false),
            data,
            code,
        };

        if flags == MidHookFlags::Immediate {
            hook.enable()?;
        }

        Ok(hook)
    }

    /// Redirects the target into the hook. Idempotent.
    pub fn enable(&self) -> Result<(), HookError> {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        memory::patch_bytes(self.target, &jmp_shellcode(self.code.addr())).inspect_err(|_| {
            self.enabled.store(false, Ordering::Release);
        })
    }

    /// Restores the original prologue. Idempotent; synchronous, so no new thread
    /// can be entering the prelude once this returns.
    pub fn disable(&self) -> Result<(), HookError> {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        memory::patch_bytes(self.target, &self.saved).inspect_err(|_| {
            self.enabled.store(true, Ordering::Release);
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

impl Drop for MidHook {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            error!("Failed to disable hook at {:#x}: {e}", self.target);
        }
    }
}
