//! Scenario-level tests against the public API.
//!
//! The collector is one process-wide singleton, so every test here takes
//! `serial()` first rather than relying on `cargo test -- --test-threads=1`
//! — two tests racing the same background collector and the same heap
//! would otherwise produce flaky live-object counts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use tracegc::ptr::{AtomicTracked, Stack, Tracked};
use tracegc::{force_collect, last_live_object_count, make_tracked, make_tracked_array};

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Locks the process-wide test serialization mutex and, on the first call
/// from any test in this binary, installs a `tracing_subscriber::fmt`
/// subscriber so collector cycle spans/events show up under `--nocapture`.
fn serial() -> std::sync::MutexGuard<'static, ()> {
    static INIT_TRACING: std::sync::Once = std::sync::Once::new();
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

struct Counted(#[allow(dead_code)] u64);

static DROPPED: AtomicUsize = AtomicUsize::new(0);

impl Drop for Counted {
    fn drop(&mut self) {
        DROPPED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn orphan_cycle_is_reclaimed() {
    let _guard = serial();
    struct Ring {
        next: Tracked<Ring>,
    }

    let before = last_live_object_count();
    {
        let anchor_a: Tracked<Ring> = Tracked::default();
        let anchor_b: Tracked<Ring> = Tracked::default();
        let u_a = make_tracked(|| Ring { next: Tracked::default() }).unwrap();
        let u_b = make_tracked(|| Ring { next: Tracked::default() }).unwrap();

        // SAFETY: both addresses were just handed out by make_tracked and
        // are still exclusively owned by u_a/u_b at this point.
        unsafe {
            let a_ref = &*(u_a.addr() as *const Ring);
            let b_ref = &*(u_b.addr() as *const Ring);
            a_ref.next.store(u_b.addr(), Ordering::Release);
            b_ref.next.store(u_a.addr(), Ordering::Release);
        }
        u_a.into_tracked(&anchor_a);
        u_b.into_tracked(&anchor_b);
        // anchor_a/anchor_b are plain locals: dropping them unregisters
        // nothing, so once this block ends the cycle is unreachable from
        // any root even though a and b still point at each other.
    }

    assert!(force_collect(true));
    assert!(force_collect(true));
    let after = last_live_object_count();
    assert!(after <= before, "orphan cycle should not remain live: before={before} after={after}");
}

#[test]
fn write_barrier_keeps_stored_object_alive_across_a_cycle() {
    let _guard = serial();
    let before_drops = DROPPED.load(Ordering::SeqCst);
    let root: Tracked<Counted> = Tracked::default();
    {
        let u = make_tracked(|| Counted(42)).unwrap();
        u.into_tracked(&root);
    }
    assert!(force_collect(true));
    assert_ne!(root.load(Ordering::Acquire), 0, "rooted object must survive a cycle");
    assert_eq!(
        DROPPED.load(Ordering::SeqCst),
        before_drops,
        "rooted object's destructor must not have run"
    );
}

#[test]
fn stack_root_keeps_object_alive_until_dropped() {
    let _guard = serial();
    let before_drops = DROPPED.load(Ordering::SeqCst);

    fn with_stack_root(f: impl FnOnce(&Stack<Counted>)) {
        let s: Stack<Counted> = Stack::new(0);
        let u = make_tracked(|| Counted(7)).unwrap();
        u.into_stack(&s);
        f(&s);
    }

    with_stack_root(|s| {
        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(force_collect(true));
            });
        });
        assert_ne!(s.load(Ordering::Acquire), 0, "stack-resident root must survive a cycle");
        assert_eq!(DROPPED.load(Ordering::SeqCst), before_drops);
    });

    assert!(force_collect(true));
    assert!(force_collect(true));
    assert!(
        DROPPED.load(Ordering::SeqCst) > before_drops,
        "object must be destroyed once its stack root goes out of scope"
    );
}

#[test]
fn atomic_swap_leaves_exactly_one_survivor() {
    let _guard = serial();
    struct Payload(#[allow(dead_code)] usize);

    let root: AtomicTracked<Payload> = AtomicTracked::new(0);
    let iterations = 500usize;

    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                for i in 0..iterations {
                    let u = make_tracked(|| Payload(i)).unwrap();
                    let addr = u.addr();
                    std::mem::forget(u); // ownership transfers to the root below
                    let mut current = root.load(Ordering::Acquire);
                    loop {
                        match root.compare_exchange(current, addr, Ordering::AcqRel, Ordering::Acquire) {
                            Ok(_) => break,
                            Err(observed) => current = observed,
                        }
                    }
                }
            });
        }
    });

    assert!(force_collect(true));
    assert!(force_collect(true));
    assert_ne!(root.load(Ordering::Acquire), 0, "the final swap winner must still be live");
}

#[test]
fn large_array_round_trips_through_a_collection_cycle() {
    let _guard = serial();
    let page_size = 4096usize;
    let len = page_size * 4;

    let before_pages = tracegc::page_alloc::live_page_count();

    let root: Tracked<u8> = Tracked::default();
    {
        let arr = make_tracked_array::<u8>(len, |i| (i % 251) as u8).unwrap();
        assert_eq!(arr.len(), len);
        arr.into_tracked(&root);
    }
    assert_ne!(root.load(Ordering::Acquire), 0);
    assert!(
        tracegc::page_alloc::live_page_count() > before_pages,
        "large array must have minted at least one fresh page"
    );

    // SAFETY: root currently holds the array's own header address, not a
    // `u8` — reinterpreting purely to drive the write-barrier/GC path is
    // fine here since we never read through this typed view.
    root.store(0, Ordering::Release);
    assert!(force_collect(true));
    assert!(force_collect(true));
    assert_eq!(
        tracegc::page_alloc::live_page_count(),
        before_pages,
        "large page backing the array must be returned to the OS once its slot sweeps to unused"
    );
}

#[test]
fn child_pointer_discovery_finds_exactly_one_offset() {
    let _guard = serial();
    struct Bar(#[allow(dead_code)] u32);
    struct Foo {
        child: Tracked<Bar>,
    }

    let u = make_tracked(|| Foo { child: Tracked::default() }).unwrap();
    let root: Tracked<Foo> = Tracked::default();
    u.into_tracked(&root);
    assert!(force_collect(true));

    let meta = tracegc::type_info::type_metadata::<Foo>();
    assert!(meta.child_map.is_final());
    let offsets = meta.child_map.offsets().expect("finalized map must report offsets");
    assert_eq!(offsets, &[core::mem::offset_of!(Foo, child)]);
}

#[test]
fn constructor_panic_is_isolated() {
    let _guard = serial();
    let before = last_live_object_count();
    let err = make_tracked(|| -> Counted { panic!("boom") }).unwrap_err();
    assert!(matches!(err, tracegc::MakeTrackedError::ConstructorPanicked));
    assert!(force_collect(true));
    let after = last_live_object_count();
    assert!(after <= before + 1);
}
