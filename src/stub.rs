//! Per-slot dispatcher stubs.
//!
//! Every hooked slot gets one of these thunks as its mid-hook callback. The
//! capture routine arrives with the guest snapshot pointer in `rcx`; the thunk's
//! only job is to load this slot's record pointer into `rdx` and tail-jump into
//! the shared dispatcher, so a single dispatcher serves every slot of every
//! vtable.

use crate::arena::ExecBuffer;
use crate::errors::HookError;

/// Stub template:
///
/// ```text
/// mov  rdx, [rip + 14]   ; load per-hook data pointer
/// jmp  [rip + 0]         ; tail-jump through dispatcher pointer
/// <qword: dispatcher address>
/// <qword: hook record address>
/// ```
const STUB_TEMPLATE: [u8; STUB_LEN] = [
    0x48, 0x8B, 0x15, 0x0E, 0x00, 0x00, 0x00, // mov rdx, [rip + 14]
    0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp [rip + 0]
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // dispatcher
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // hook data
];

pub const STUB_LEN: usize = 29;

const DISPATCHER_OFFSET: usize = 13;
const DATA_OFFSET: usize = 21;

/// Emits a stub bound to `hook_data`, jumping into `dispatcher`.
pub fn create_stub(dispatcher: usize, hook_data: usize) -> Result<ExecBuffer, HookError> {
    let mut code = STUB_TEMPLATE;
    code[DISPATCHER_OFFSET..DISPATCHER_OFFSET + 8]
        .copy_from_slice(&(dispatcher as u64).to_le_bytes());
    code[DATA_OFFSET..DATA_OFFSET + 8].copy_from_slice(&(hook_data as u64).to_le_bytes());

    let buf = ExecBuffer::alloc(STUB_LEN)?;
    buf.write(0, &code);
    Ok(buf)
}
