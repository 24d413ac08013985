//! Vtable boundary scanner.
//!
//! Vtables in the target image are packed back to back with no terminator, so
//! the only way to know where one ends is to walk it entry by entry and stop at
//! the first value that cannot be a virtual method of this class. The rules are
//! deliberately conservative: over-inclusion would hook unrelated code,
//! under-inclusion merely loses methods.

use std::mem;

use crate::memory;
use crate::rtti;

/// A hookable vtable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Ordinal position in the vtable.
    pub index: usize,
    /// Function address stored at that position.
    pub target: usize,
}

/// Window of target bytes inspected by the trivial-stub classifier.
const STUB_WINDOW: usize = 16;

/// Walks the vtable at `base` and returns its hookable slots in order.
///
/// Iteration stops at the first entry that is null, unreadable, not executable,
/// or whose successor slot is the start of another vtable. Entries whose code is
/// a trivial stub are skipped without terminating the walk.
pub fn scan(base: *const usize) -> Vec<Slot> {
    let mut slots = Vec::new();

    if base.is_null() {
        return slots;
    }

    let ptr_len = mem::size_of::<usize>();

    for index in 0.. {
        let slot_addr = base as usize + index * ptr_len;
        if !memory::is_readable(slot_addr, ptr_len) {
            break;
        }

        let entry = unsafe { (slot_addr as *const usize).read_volatile() };

        if entry == 0 || !memory::is_readable(entry, ptr_len) {
            break;
        }

        // Non-executable data means we walked off the end of the table.
        if !memory::is_good_code_ptr(entry, ptr_len) {
            break;
        }

        // The next slot starting another vtable also ends this one.
        if rtti::is_vtable(slot_addr + ptr_len) {
            break;
        }

        let window = if memory::is_readable(entry, STUB_WINDOW) {
            STUB_WINDOW
        } else {
            1
        };
        let code = unsafe { std::slice::from_raw_parts(entry as *const u8, window) };
        if memory::is_stub_code(code) {
            continue;
        }

        slots.push(Slot {
            index,
            target: entry,
        });
    }

    slots
}

/// Number of hookable entries in the vtable at `base`.
pub fn count(base: *const usize) -> usize {
    scan(base).len()
}
