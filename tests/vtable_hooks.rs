//! End-to-end harness: fabricated vtables over generated functions.
//!
//! Each test builds a synthetic vtable (a flat array of pointers into
//! arena-generated x86-64 functions) and drives it the way the hooked process
//! would: virtual calls through a receiver whose first qword is the vtable
//! base. The generated bodies are kept trivially relocatable so the mid-hook
//! can always displace their prologues.

#![cfg(all(windows, target_arch = "x86_64"))]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use vtable_probe::arena::ExecBuffer;
use vtable_probe::{Hooker, module};

/// `mov eax, tag; nop sled; ret`: returns its tag, ignores the receiver.
fn tagged_fn(tag: u32) -> ExecBuffer {
    let buf = ExecBuffer::alloc(32).unwrap();
    let mut code = vec![0xB8];
    code.extend_from_slice(&tag.to_le_bytes());
    code.extend_from_slice(&[0x90; 9]);
    code.push(0xC3);
    buf.write(0, &code);
    buf
}

/// `movabs rax, counter; lock inc qword ptr [rax]; ret`: a body whose effect
/// is observable, for the neutralize/restore scenarios.
fn counting_fn(counter: &AtomicU64) -> ExecBuffer {
    let buf = ExecBuffer::alloc(32).unwrap();
    let mut code = vec![0x48, 0xB8];
    code.extend_from_slice(&(counter.as_ptr() as u64).to_le_bytes());
    code.extend_from_slice(&[0xF0, 0x48, 0xFF, 0x00]);
    code.push(0xC3);
    buf.write(0, &code);
    buf
}

/// A lone `ret`: the trivial stub shape the scanner skips.
fn stub_fn() -> ExecBuffer {
    let buf = ExecBuffer::alloc(16).unwrap();
    buf.write(0, &[0xC3]);
    buf
}

/// Minimal polymorphic object: first qword is the vtable pointer.
#[repr(C)]
struct Receiver {
    vtable: *const usize,
}

/// Virtual dispatch: fetch the slot from the receiver's vtable and call it.
fn vcall(recv: &Receiver, slot: usize) -> u32 {
    unsafe {
        let entry = *recv.vtable.add(slot);
        let f: extern "C" fn(*const Receiver) -> u32 = std::mem::transmute(entry);
        f(recv)
    }
}

fn snapshot_prologues(fns: &[ExecBuffer]) -> Vec<Vec<u8>> {
    fns.iter().map(|f| f.as_slice()[..16].to_vec()).collect()
}

#[test]
fn scenario_a_single_class_ten_slots() {
    let fns: Vec<ExecBuffer> = (0..10).map(tagged_fn).collect();
    let mut table: Vec<usize> = fns.iter().map(|f| f.addr()).collect();
    table.push(0);

    assert_eq!(Hooker::count(table.as_ptr()), 10);

    let hooker = Hooker::new(table.as_mut_ptr());
    assert_eq!(hooker.get_hooks().len(), 10);
    for (i, hook) in hooker.get_hooks().iter().enumerate() {
        assert_eq!(hook.index(), i);
        assert_eq!(hook.calls(), 0);
    }

    let recv = Receiver {
        vtable: table.as_ptr(),
    };

    for round in 0..7 {
        for slot in 0..10 {
            // The hook must stay transparent to the caller.
            assert_eq!(vcall(&recv, slot), slot as u32, "round {round}");
        }
    }

    for hook in hooker.get_hooks() {
        assert_eq!(hook.calls(), 7);
        assert_ne!(hook.last_return_address(), 0);
        assert_ne!(hook.last_call_nanos(), 0);
        // The captured entry frame is the original function, not the stub.
        assert_eq!(hook.callstack().first().copied(), Some(hook.target()));
    }
}

#[test]
fn scenario_b_trailing_trivial_stub() {
    let f0 = tagged_fn(0);
    let f1 = tagged_fn(1);
    let stub = stub_fn();
    let f3 = tagged_fn(3);
    let f4 = tagged_fn(4);
    let stub_before: Vec<u8> = stub.as_slice().to_vec();

    let mut table = [f0.addr(), f1.addr(), stub.addr(), f3.addr(), f4.addr(), 0];

    assert_eq!(Hooker::count(table.as_ptr()), 4);

    let hooker = Hooker::new(table.as_mut_ptr());
    let mut indices: Vec<usize> = hooker.get_hooks().iter().map(|h| h.index()).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 3, 4]);
    assert!(hooker.find_hook(2).is_none());
    assert!(hooker.hooks_by_slot().get(&2).is_none());

    // The skipped slot's code is never touched.
    assert_eq!(stub.as_slice(), &stub_before[..]);
}

#[test]
fn scenario_c_mismatch_guard() {
    let shared = tagged_fn(7);
    let mut table_x = [shared.addr(), 0];
    let table_y = [shared.addr(), 0];

    let hooker = Hooker::new(table_x.as_mut_ptr());
    let hook = hooker.find_hook(0).unwrap();

    let recv_x = Receiver {
        vtable: table_x.as_ptr(),
    };
    let recv_y = Receiver {
        vtable: table_y.as_ptr(),
    };

    assert_eq!(vcall(&recv_x, 0), 7);
    assert_eq!(hook.calls(), 1);

    // Same function, foreign vtable: guarded out.
    assert_eq!(vcall(&recv_y, 0), 7);
    assert_eq!(hook.calls(), 1);

    hooker.set_ignore_vtable_mismatch(true);
    assert_eq!(vcall(&recv_y, 0), 7);
    assert_eq!(hook.calls(), 2);

    hooker.set_ignore_vtable_mismatch(false);
    assert_eq!(vcall(&recv_y, 0), 7);
    assert_eq!(hook.calls(), 2);
}

#[test]
fn scenario_d_neutralize_and_restore() {
    static BODY_HITS: AtomicU64 = AtomicU64::new(0);

    let body = counting_fn(&BODY_HITS);
    let mut table = [body.addr(), 0];

    let hooker = Hooker::new(table.as_mut_ptr());
    let hook = hooker.find_hook(0).unwrap();
    let recv = Receiver {
        vtable: table.as_ptr(),
    };

    vcall(&recv, 0);
    assert_eq!(BODY_HITS.load(Ordering::SeqCst), 1);
    assert_eq!(hook.calls(), 1);

    // Neutralized: the call returns immediately, no body effect, no accounting.
    hook.insert_ret();
    vcall(&recv, 0);
    vcall(&recv, 0);
    assert_eq!(BODY_HITS.load(Ordering::SeqCst), 1);
    assert_eq!(hook.calls(), 1);

    hook.restore();
    vcall(&recv, 0);
    assert_eq!(BODY_HITS.load(Ordering::SeqCst), 2);
    assert_eq!(hook.calls(), 2);
}

#[test]
fn scenario_e_clean_teardown_under_load() {
    static LOAD_HITS: AtomicU64 = AtomicU64::new(0);

    let body = counting_fn(&LOAD_HITS);
    let mut table = [body.addr(), 0usize];
    let before = snapshot_prologues(std::slice::from_ref(&body));

    let hooker = Hooker::new(table.as_mut_ptr());

    let stop = Arc::new(AtomicBool::new(false));
    let table_addr = table.as_ptr() as usize;
    let worker = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let recv = Receiver {
                vtable: table_addr as *const usize,
            };
            while !stop.load(Ordering::Relaxed) {
                vcall(&recv, 0);
            }
        })
    };

    thread::sleep(Duration::from_millis(5));
    drop(hooker);

    // The worker keeps calling the now-unhooked function unharmed.
    let after_teardown = LOAD_HITS.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(5));
    assert!(LOAD_HITS.load(Ordering::SeqCst) > after_teardown);

    stop.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    assert_eq!(snapshot_prologues(std::slice::from_ref(&body)), before);
}

#[test]
fn install_teardown_round_trips_prologues() {
    let fns: Vec<ExecBuffer> = (0..4).map(tagged_fn).collect();
    let before = snapshot_prologues(&fns);
    let mut table: Vec<usize> = fns.iter().map(|f| f.addr()).collect();
    table.push(0);

    {
        let hooker = Hooker::new(table.as_mut_ptr());
        let hook = hooker.find_hook(1).unwrap();

        // Patch twice, restore once: must not stack.
        hook.insert_ret();
        hook.insert_ret();
        hook.restore();
    }

    assert_eq!(snapshot_prologues(&fns), before);
}

#[test]
fn timing_fields_publish_after_second_call() {
    let f = tagged_fn(0);
    let mut table = [f.addr(), 0];

    let hooker = Hooker::new(table.as_mut_ptr());
    let hook = hooker.find_hook(0).unwrap();
    let recv = Receiver {
        vtable: table.as_ptr(),
    };

    assert_eq!(hook.last_call_nanos(), 0);
    assert_eq!(hook.delta_nanos(), 0);

    vcall(&recv, 0);
    let first = hook.last_call_nanos();
    assert_ne!(first, 0);
    assert_eq!(hook.delta_nanos(), 0);

    thread::sleep(Duration::from_millis(2));
    vcall(&recv, 0);
    assert!(hook.last_call_nanos() > first);
    assert!(hook.delta_nanos() > 0);
}

#[test]
fn caller_return_address_points_into_this_image() {
    let f = tagged_fn(0);
    let mut table = [f.addr(), 0];

    let hooker = Hooker::new(table.as_mut_ptr());
    let hook = hooker.find_hook(0).unwrap();
    let recv = Receiver {
        vtable: table.as_ptr(),
    };

    vcall(&recv, 0);
    let retaddr = hook.last_return_address();
    assert!(module::get_module_within(retaddr).is_some());
}

#[test]
fn callstack_snapshots_are_never_torn() {
    let f = tagged_fn(0);
    let mut table = [f.addr(), 0usize];

    let hooker = Hooker::new(table.as_mut_ptr());
    let hook = hooker.find_hook(0).unwrap();
    let target = hook.target();

    let stop = Arc::new(AtomicBool::new(false));
    let table_addr = table.as_ptr() as usize;
    let writer = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let recv = Receiver {
                vtable: table_addr as *const usize,
            };
            while !stop.load(Ordering::Relaxed) {
                vcall(&recv, 0);
            }
        })
    };

    for _ in 0..10_000 {
        let snapshot = hook.callstack();
        // Either no capture yet, or a complete one starting at the entry frame.
        assert!(snapshot.is_empty() || snapshot[0] == target);
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();
}
