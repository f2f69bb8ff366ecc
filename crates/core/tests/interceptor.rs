//! End-to-end interception tests: real functions in this binary are hooked,
//! called, and restored.

#![cfg(all(target_arch = "x86_64", unix))]

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use divert_core::{ClosureListener, Interceptor, Listener};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

// The interceptor and its transaction level are process-wide, so the suite
// runs one test at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// Hook targets. Each test owns its target so attach/detach cycles never
// overlap on one function.

#[inline(never)]
extern "C" fn add_logged(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

#[inline(never)]
extern "C" fn add_mutated(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

#[inline(never)]
extern "C" fn add_retval(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

#[inline(never)]
extern "C" fn nested_inner(x: u64) -> u64 {
    x.wrapping_mul(3)
}

#[inline(never)]
extern "C" fn nested_outer(x: u64) -> u64 {
    nested_inner(x).wrapping_add(1)
}

#[inline(never)]
extern "C" fn replace_me(x: u64) -> u64 {
    x.wrapping_add(7)
}

#[inline(never)]
extern "C" fn restore_me(a: u64, b: u64) -> u64 {
    a.wrapping_mul(b)
}

#[inline(never)]
extern "C" fn scratch_target(x: u64) -> u64 {
    x.wrapping_add(40)
}

#[inline(never)]
extern "C" fn racy_target(x: u64) -> u64 {
    x.wrapping_add(5)
}

#[inline(never)]
extern "C" fn txn_target(x: u64) -> u64 {
    x.wrapping_add(11)
}

#[inline(never)]
extern "C" fn ignored_target(x: u64) -> u64 {
    x.wrapping_add(21)
}

#[inline(never)]
extern "C" fn twice_target(x: u64) -> u64 {
    x.wrapping_add(33)
}

#[inline(never)]
extern "C" fn observed_target(x: u64) -> u64 {
    x.wrapping_mul(3)
}

#[test]
fn scalar_argument_passthrough() {
    init_tracing();
    let _serial = serial();
    let log: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&log);
    let listener = ClosureListener::on_enter(move |ctx| {
        seen.lock()
            .unwrap()
            .push((ctx.nth_argument(0), ctx.nth_argument(1)));
    });

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(add_logged as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }

    assert_eq!(add_logged(2, 3), 5);

    interceptor.detach(&listener);
    assert_eq!(log.lock().unwrap().as_slice(), &[(2, 3)]);
}

#[test]
fn argument_mutation_changes_the_call() {
    init_tracing();
    let _serial = serial();
    let listener = ClosureListener::on_enter(|ctx| {
        ctx.replace_nth_argument(1, 5);
    });

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(add_mutated as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }

    assert_eq!(add_mutated(2, 3), 7);

    interceptor.detach(&listener);
    assert_eq!(add_mutated(2, 3), 5);
}

#[test]
fn return_value_mutation() {
    init_tracing();
    let _serial = serial();
    let listener = ClosureListener::on_leave(|ctx| {
        assert_eq!(ctx.return_value(), 5);
        ctx.replace_return_value(42);
    });

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(add_retval as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }

    assert_eq!(add_retval(2, 3), 42);

    interceptor.detach(&listener);
    assert_eq!(add_retval(2, 3), 5);
}

#[test]
fn nested_hooks_report_depth() {
    init_tracing();
    let _serial = serial();
    let depths: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let outer_depths = Arc::clone(&depths);
    let outer_listener = ClosureListener::on_enter(move |ctx| {
        outer_depths.lock().unwrap().push((0, ctx.depth()));
    });
    let inner_depths = Arc::clone(&depths);
    let inner_listener = ClosureListener::on_enter(move |ctx| {
        inner_depths.lock().unwrap().push((1, ctx.depth()));
    });

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(nested_outer as usize, &outer_listener, std::ptr::null_mut())
            .unwrap();
        interceptor
            .attach(nested_inner as usize, &inner_listener, std::ptr::null_mut())
            .unwrap();
    }

    assert_eq!(nested_outer(2), 7);

    interceptor.detach(&outer_listener);
    interceptor.detach(&inner_listener);

    let depths = depths.lock().unwrap();
    assert_eq!(depths.as_slice(), &[(0, 0), (1, 1)]);
}

static REPLACEMENT_CALLS: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_FN: AtomicUsize = AtomicUsize::new(0);

extern "C" fn replacement(x: u64) -> u64 {
    REPLACEMENT_CALLS.fetch_add(1, Ordering::SeqCst);
    let original: extern "C" fn(u64) -> u64 =
        unsafe { std::mem::transmute(ORIGINAL_FN.load(Ordering::SeqCst)) };
    original(x).wrapping_add(100)
}

#[test]
fn replace_and_chain_to_original() {
    init_tracing();
    let _serial = serial();
    let interceptor = Interceptor::obtain();

    let original = unsafe {
        interceptor
            .replace(
                replace_me as usize,
                replacement as *const c_void,
                std::ptr::null_mut(),
            )
            .unwrap()
    };
    ORIGINAL_FN.store(original as usize, Ordering::SeqCst);

    // replacement runs, calls the original exactly once, and its return
    // value is what callers observe
    assert_eq!(replace_me(1), 108);
    assert_eq!(REPLACEMENT_CALLS.load(Ordering::SeqCst), 1);

    interceptor.revert(replace_me as usize);
    assert_eq!(replace_me(1), 8);
    assert_eq!(REPLACEMENT_CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn detach_restores_the_prologue() {
    init_tracing();
    let _serial = serial();
    let before: [u8; 16] =
        unsafe { std::ptr::read_unaligned(restore_me as usize as *const [u8; 16]) };

    let listener = ClosureListener::on_enter(|_| {});
    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(restore_me as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }

    let patched: [u8; 16] =
        unsafe { std::ptr::read_unaligned(restore_me as usize as *const [u8; 16]) };
    assert_ne!(before, patched, "prologue should carry the redirect");
    assert_eq!(patched[0], 0xE9);
    assert_eq!(restore_me(6, 7), 42);

    interceptor.detach(&listener);

    let after: [u8; 16] =
        unsafe { std::ptr::read_unaligned(restore_me as usize as *const [u8; 16]) };
    assert_eq!(before, after, "detach must restore the original bytes");
    assert_eq!(restore_me(6, 7), 42);
}

#[test]
fn invocation_data_propagates_enter_to_leave() {
    init_tracing();
    let _serial = serial();
    let matched = Arc::new(AtomicUsize::new(0));

    struct ScratchListener {
        matched: Arc<AtomicUsize>,
    }
    impl Listener for ScratchListener {
        fn on_enter(&self, ctx: &mut divert_core::InvocationContext<'_>) {
            let data = ctx.listener_invocation_data(8);
            assert!(!data.is_null());
            unsafe { (data as *mut u64).write(0xFEED_FACE) };
        }
        fn on_leave(&self, ctx: &mut divert_core::InvocationContext<'_>) {
            let data = ctx.listener_invocation_data(8);
            assert!(!data.is_null());
            if unsafe { (data as *const u64).read() } == 0xFEED_FACE {
                self.matched.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let listener: Arc<dyn Listener> = Arc::new(ScratchListener {
        matched: Arc::clone(&matched),
    });
    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(scratch_target as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }

    assert_eq!(scratch_target(2), 42);
    assert_eq!(scratch_target(2), 42);

    interceptor.detach(&listener);
    assert_eq!(matched.load(Ordering::SeqCst), 2);
}

#[test]
fn listener_set_is_stable_within_one_invocation() {
    init_tracing();
    let _serial = serial();
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let reached_enter = Arc::new(Barrier::new(2));
    let attach_done = Arc::new(Barrier::new(2));

    let l1_events = Arc::clone(&events);
    let l1_reached = Arc::clone(&reached_enter);
    let l1_attached = Arc::clone(&attach_done);
    let first = ClosureListener::new(
        move |_ctx| {
            l1_events.lock().unwrap().push("l1-enter");
            l1_reached.wait();
            l1_attached.wait();
        },
        {
            let events = Arc::clone(&events);
            move |_ctx| events.lock().unwrap().push("l1-leave")
        },
    );

    let l2_events = Arc::clone(&events);
    let second = ClosureListener::new(
        {
            let events = Arc::clone(&l2_events);
            move |_ctx| events.lock().unwrap().push("l2-enter")
        },
        move |_ctx| l2_events.lock().unwrap().push("l2-leave"),
    );

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(racy_target as usize, &first, std::ptr::null_mut())
            .unwrap();
    }

    let worker = std::thread::spawn(move || racy_target(1));

    reached_enter.wait();
    unsafe {
        interceptor
            .attach(racy_target as usize, &second, std::ptr::null_mut())
            .unwrap();
    }
    attach_done.wait();

    assert_eq!(worker.join().unwrap(), 6);

    interceptor.detach(&first);
    interceptor.detach(&second);

    // the in-flight call may not observe a partial set: if l2 was seen at
    // enter it must be seen at leave, and vice versa
    let events = events.lock().unwrap();
    let entered_l2 = events.iter().any(|e| *e == "l2-enter");
    let left_l2 = events.iter().any(|e| *e == "l2-leave");
    assert_eq!(entered_l2, left_l2, "partial listener set observed: {events:?}");
    assert!(events.contains(&"l1-enter"));
    assert!(events.contains(&"l1-leave"));
}

#[test]
fn transaction_batches_activation() {
    init_tracing();
    let _serial = serial();
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&hits);
    let listener = ClosureListener::on_enter(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    let interceptor = Interceptor::obtain();
    interceptor.begin_transaction();
    interceptor.begin_transaction();
    unsafe {
        interceptor
            .attach(txn_target as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }
    interceptor.end_transaction();

    // still inside the outer transaction: nothing is patched yet
    assert_eq!(txn_target(1), 12);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    interceptor.end_transaction();

    assert_eq!(txn_target(1), 12);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    interceptor.detach(&listener);
}

#[test]
fn ignored_thread_skips_listeners() {
    init_tracing();
    let _serial = serial();
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&hits);
    let listener = ClosureListener::on_enter(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(ignored_target as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }

    interceptor.ignore_current_thread();
    assert_eq!(ignored_target(1), 22);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    interceptor.unignore_current_thread();

    assert_eq!(ignored_target(1), 22);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    interceptor.detach(&listener);
}

#[test]
fn double_attach_is_rejected() {
    init_tracing();
    let _serial = serial();
    let listener = ClosureListener::on_enter(|_| {});
    let interceptor = Interceptor::obtain();

    unsafe {
        interceptor
            .attach(twice_target as usize, &listener, std::ptr::null_mut())
            .unwrap();
        assert_eq!(
            interceptor.attach(twice_target as usize, &listener, std::ptr::null_mut()),
            Err(divert_core::AttachError::AlreadyAttached)
        );
    }
    interceptor.detach(&listener);
    assert_eq!(twice_target(1), 34);
}

#[test]
fn current_invocation_is_visible_inside_callbacks() {
    init_tracing();
    let _serial = serial();
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&observed);
    let listener = ClosureListener::on_enter(move |_ctx| {
        if Interceptor::current_invocation().is_some() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    let interceptor = Interceptor::obtain();
    unsafe {
        interceptor
            .attach(observed_target as usize, &listener, std::ptr::null_mut())
            .unwrap();
    }
    assert!(Interceptor::current_invocation().is_none());
    assert_eq!(observed_target(4), 12);
    interceptor.detach(&listener);

    assert_eq!(observed.load(Ordering::SeqCst), 1);
}
