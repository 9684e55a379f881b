//! The background collector thread: a single dedicated
//! thread that owns the full mark/sweep cycle while mutators run
//! uninterrupted.
//!
//! Pacing uses a plain `std::sync::{Mutex, Condvar}` rather than this
//! codebase's `GhostCondvar` — that primitive is coupled to the branded
//! mutex/token system for `GhostCell`-guarded data, which has no bearing
//! on a process-wide background worker with a timed wait loop. See
//! `DESIGN.md`.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use crate::block;
use crate::hazard::HazardSnapshot;
use crate::page::PageHeader;
use crate::page_alloc::{GlobalPageAlloc, PageAlloc};
use crate::ptr::ArrayHeader;
use crate::slot_state;
use crate::thread_ctx::{self, ThreadContext};
use crate::type_info;

struct CollectorState {
    force_remaining: u32,
    terminating: bool,
    terminated: bool,
    pending_enum: bool,
    enum_cycles_remaining: u32,
    paused_for_enum: bool,
    live_objects: Option<Vec<usize>>,
    empty_cycles: u32,
}

struct CycleStats {
    live_count: usize,
    swept: usize,
    pages_recycled: usize,
}

/// The collector singleton. Owns the registered-page list and the command
/// state mutators observe through `force_collect`/`get_live_objects`/
/// `terminate`.
pub struct Collector {
    state: Mutex<CollectorState>,
    cv: Condvar,
    registered_pages: Mutex<Vec<usize>>,
    cycle_count: AtomicU64,
    /// Live-set size observed at the end of the most recent cycle. Kept as
    /// its own atomic (rather than inside `state`) so `record_alloc` can
    /// read it from the allocation hot path without taking the state lock.
    last_live_count: AtomicUsize,
    /// Allocations since the last cycle started, compared against
    /// `last_live_count` and `Config::trigger_percentage` to wake the
    /// collector early under allocation pressure.
    alloc_since_cycle: AtomicUsize,
}

impl Collector {
    fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState {
                force_remaining: 0,
                terminating: false,
                terminated: false,
                pending_enum: false,
                enum_cycles_remaining: 0,
                paused_for_enum: false,
                live_objects: None,
                empty_cycles: 0,
            }),
            cv: Condvar::new(),
            registered_pages: Mutex::new(Vec::new()),
            cycle_count: AtomicU64::new(0),
            last_live_count: AtomicUsize::new(0),
            alloc_since_cycle: AtomicUsize::new(0),
        }
    }

    /// Records one fresh allocation and, once growth since the last cycle
    /// crosses `trigger_percentage` of the live set that cycle ended with,
    /// wakes the collector instead of leaving it to `max_sleep_time`.
    ///
    /// Deliberately does not hold `state`'s lock: this is an early-wake
    /// hint, not a change to any predicate the collector's wait loop
    /// checks, so a notification racing ahead of the next `wait_timeout`
    /// call costs at most one extra loop iteration, never a missed wakeup
    /// that matters — the fixed `max_sleep_time` timer is still there as a
    /// backstop.
    fn record_alloc(&self) {
        let count = self.alloc_since_cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let baseline = self.last_live_count.load(Ordering::Relaxed).max(1);
        let trigger_percentage = crate::config::config().trigger_percentage as usize;
        if count.saturating_mul(100) >= baseline.saturating_mul(trigger_percentage) {
            self.cv.notify_all();
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let capture_live = {
                let mut state = self.state.lock().unwrap();
                if state.pending_enum && state.enum_cycles_remaining > 0 {
                    state.enum_cycles_remaining -= 1;
                    state.enum_cycles_remaining == 0
                } else {
                    false
                }
            };

            let stats = self.run_cycle(capture_live);

            let terminated_now;
            {
                let mut state = self.state.lock().unwrap();
                self.last_live_count.store(stats.live_count, Ordering::Relaxed);
                self.alloc_since_cycle.store(0, Ordering::Relaxed);
                if state.force_remaining > 0 {
                    state.force_remaining -= 1;
                }
                if capture_live {
                    state.pending_enum = false;
                    state.paused_for_enum = true;
                }
                if stats.live_count == 0 && stats.swept == 0 {
                    state.empty_cycles += 1;
                } else {
                    state.empty_cycles = 0;
                }
                if state.terminating && state.empty_cycles >= 5 {
                    state.terminated = true;
                }
                terminated_now = state.terminated;
                self.cv.notify_all();
            }

            if terminated_now {
                return;
            }

            let mut state = self.state.lock().unwrap();
            while state.paused_for_enum {
                state = self.cv.wait(state).unwrap();
            }

            if state.terminating {
                continue;
            }

            if state.force_remaining == 0 && !state.pending_enum {
                let max_sleep = crate::config::config().max_sleep_time;
                let _ = self.cv.wait_timeout(state, max_sleep).unwrap();
            }
        }
    }

    /// Runs one full collector cycle, optionally capturing the live set for
    /// `get_live_objects`.
    fn run_cycle(&self, capture_live: bool) -> CycleStats {
        let page_size = crate::config::config().page_size;
        let cycle = self.cycle_count.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("gc_cycle", cycle);
        let _enter = span.enter();

        // Steps 1-2: drain newly minted pages into the registered set.
        let new_pages = block::new_page_registry().drain();
        let mut pages = {
            let mut guard = self.registered_pages.lock().unwrap();
            guard.extend(new_pages);
            guard.clone()
        };

        // Step 3: register objects.
        for &addr in &pages {
            let header = unsafe { &*(addr as *const PageHeader) };
            if !header.object_created.load(Ordering::Acquire) {
                continue;
            }
            for idx in 0..header.slot_count {
                if slot_state::is_created(header.states[idx].observe()) {
                    header.registered_flags.test_and_set(idx, Ordering::Relaxed);
                }
            }
        }

        // Step 4: clear this cycle's mark bits, downgrade stale Reachable.
        for &addr in &pages {
            let header = unsafe { &*(addr as *const PageHeader) };
            header.reachable_flags.clear_all(Ordering::Relaxed);
            header.marked_flags.clear_all(Ordering::Relaxed);
            for idx in 0..header.slot_count {
                let _ = header.states[idx].compare_exchange(slot_state::REACHABLE, slot_state::USED);
            }
        }

        // Step 5: hazard pointers.
        let threads = thread_ctx::snapshot_and_prune();
        let hazard_snapshot = HazardSnapshot::build(threads.iter().map(|t| t.hazard.get()).collect());

        // Steps 6-7: mark roots, trace to a fixed point.
        mark_and_trace(&pages, &threads, &hazard_snapshot, page_size);

        // Step 8: sweep.
        let swept = sweep(&pages, page_size);

        let live_count = count_live(&pages);
        if capture_live {
            let captured = collect_live(&pages);
            let mut state = self.state.lock().unwrap();
            state.live_objects = Some(captured);
        }

        // Step 9: recycle fully-dead large-object pages back to the OS.
        // Slab pages are already recycled logically by `sweep`'s call to
        // `release_to_freelist`, picked back up by `TypeAllocator::alloc`;
        // returning slab page memory to the OS would need retiring it out
        // of the active/available lock-free stack first, which is scoped
        // out here (see `DESIGN.md`).
        let pages_recycled = recycle_large_pages(&mut pages, page_size);
        *self.registered_pages.lock().unwrap() = pages;

        tracing::debug!(swept, live_count, pages_recycled, "gc cycle complete");

        CycleStats {
            live_count,
            swept,
            pages_recycled,
        }
    }

    fn force_collect(&self, wait: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.terminating || state.paused_for_enum {
            return false;
        }
        state.force_remaining = 2;
        self.cv.notify_all();
        if wait {
            while state.force_remaining > 0 && !state.paused_for_enum && !state.terminating {
                state = self.cv.wait(state).unwrap();
            }
        }
        !state.paused_for_enum && !state.terminating
    }

    fn get_live_objects(self: &Arc<Self>) -> (PauseGuard, Vec<usize>) {
        let mut state = self.state.lock().unwrap();
        state.pending_enum = true;
        state.enum_cycles_remaining = 2;
        self.cv.notify_all();
        while !state.paused_for_enum {
            state = self.cv.wait(state).unwrap();
        }
        let live = state.live_objects.take().unwrap_or_default();
        drop(state);
        (
            PauseGuard {
                collector: Arc::clone(self),
            },
            live,
        )
    }

    fn terminate(&self) {
        let mut state = self.state.lock().unwrap();
        if state.terminating {
            return;
        }
        state.terminating = true;
        self.cv.notify_all();
        while !state.terminated {
            state = self.cv.wait(state).unwrap();
        }
    }
}

/// Held by the caller of `get_live_objects`; dropping it un-pauses the
/// collector.
pub struct PauseGuard {
    collector: Arc<Collector>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let mut state = self.collector.state.lock().unwrap();
        state.paused_for_enum = false;
        self.collector.cv.notify_all();
    }
}

/// Marks `addr`'s slot live-this-cycle, returning `true` iff this call was
/// the one that transitioned it (used both for the worklist push decision
/// and to detect convergence in the unreachable-page pass).
fn try_mark(addr: usize, page_size: usize, worklist: &mut Vec<usize>) -> bool {
    if addr == 0 {
        return false;
    }
    let header = unsafe { PageHeader::from_addr(addr, page_size).as_ref() };
    let idx = header.slot_index(addr);
    if !header.registered_flags.is_set(idx, Ordering::Acquire) {
        return false;
    }
    if header.reachable_flags.test_and_set(idx, Ordering::AcqRel) {
        return false;
    }
    worklist.push(addr);
    true
}

/// Expands one already-marked slot's embedded child pointers onto the
/// worklist.
fn trace_one(addr: usize, page_size: usize, worklist: &mut Vec<usize>) {
    let header = unsafe { PageHeader::from_addr(addr, page_size).as_ref() };
    let idx = header.slot_index(addr);
    if header.marked_flags.test_and_set(idx, Ordering::AcqRel) {
        return;
    }

    if header.is_array {
        let array_header = unsafe { &*(addr as *const ArrayHeader) };
        let elem_meta = type_info::type_metadata_by_id(header.type_id);
        if let Some(offsets) = elem_meta.child_map.offsets() {
            for i in 0..array_header.len {
                let elem_addr = addr + array_header.element_offset(i);
                for &offset in offsets {
                    let child = unsafe { *((elem_addr + offset) as *const usize) };
                    try_mark(child, page_size, worklist);
                }
            }
        }
    } else {
        let meta = type_info::type_metadata_by_id(header.type_id);
        if let Some(offsets) = meta.child_map.offsets() {
            for &offset in offsets {
                let child = unsafe { *((addr + offset) as *const usize) };
                try_mark(child, page_size, worklist);
            }
        }
    }
}

/// Root-marks every thread's stack shadow and every heap root, traces to a
/// fixed point, then repeatedly sweeps unreachable pages for slots whose
/// state raced ahead (a write-barrier or a hazard-protected load) since the
/// cycle began, re-tracing until a full pass finds nothing new.
fn mark_and_trace(
    pages: &[usize],
    threads: &[Arc<ThreadContext>],
    hazard_snapshot: &HazardSnapshot,
    page_size: usize,
) {
    let mut worklist = Vec::new();

    for t in threads {
        for payload in t.shadow.scan() {
            try_mark(payload, page_size, &mut worklist);
        }
    }
    for payload in crate::ptr::stack::scan_heap_roots() {
        try_mark(payload, page_size, &mut worklist);
    }

    loop {
        while let Some(addr) = worklist.pop() {
            trace_one(addr, page_size, &mut worklist);
        }

        let mut added = false;
        for &page_addr in pages {
            let header = unsafe { &*(page_addr as *const PageHeader) };
            for idx in 0..header.slot_count {
                if header.reachable_flags.is_set(idx, Ordering::Acquire) {
                    continue;
                }
                let state = header.states[idx].observe();
                let slot_addr = header.slot_addr(idx);
                if slot_state::must_trace(state) || hazard_snapshot.protects(slot_addr) {
                    if try_mark(slot_addr, page_size, &mut worklist) {
                        added = true;
                    }
                }
            }
        }
        if !added {
            break;
        }
    }
}

/// Destructs and retires every registered-but-unreachable slot, returning
/// the number of objects actually destructed.
fn sweep(pages: &[usize], _page_size: usize) -> usize {
    let mut swept = 0;
    for &page_addr in pages {
        let header = unsafe { &*(page_addr as *const PageHeader) };
        for idx in 0..header.slot_count {
            if !header.registered_flags.is_set(idx, Ordering::Acquire) {
                continue;
            }
            if header.reachable_flags.is_set(idx, Ordering::Acquire) {
                continue;
            }
            let state = header.states[idx].observe();
            let slot_addr = header.slot_addr(idx);
            if !slot_state::skip_destructor(state) {
                if header.is_array {
                    let array_header = unsafe { &*(slot_addr as *const ArrayHeader) };
                    for i in 0..array_header.len {
                        let elem = (slot_addr + array_header.element_offset(i)) as *mut u8;
                        unsafe { array_header.metadata.drop_element(elem) };
                    }
                } else {
                    let meta = type_info::type_metadata_by_id(header.type_id);
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
                        meta.drop_in_place(slot_addr as *mut u8);
                    }));
                    if outcome.is_err() {
                        tracing::warn!(type_name = meta.name, addr = slot_addr, "destructor panicked during sweep");
                    }
                }
                swept += 1;
            }
            header.registered_flags.clear(idx, Ordering::Relaxed);
            header.states[idx].collector_set(slot_state::UNUSED);
            if !header.is_large {
                header.release_to_freelist(slot_addr);
            }
        }
    }
    swept
}

/// Physically deallocates large-object pages whose single slot swept to
/// `Unused` this cycle or a previous one — safe because large pages are
/// minted fresh per-object and never pooled, so nothing else can be
/// holding a reference to the page once its slot is dead.
fn recycle_large_pages(pages: &mut Vec<usize>, page_size: usize) -> usize {
    let mut removed = 0;
    pages.retain(|&addr| {
        let header = unsafe { &*(addr as *const PageHeader) };
        if header.is_large && header.states[0].observe() == slot_state::UNUSED {
            let layout = header.raw_layout(page_size);
            unsafe {
                GlobalPageAlloc.dealloc_page(header.raw_addr as *mut u8, layout);
                drop(Box::from_raw(addr as *mut PageHeader));
            }
            removed += 1;
            false
        } else {
            true
        }
    });
    removed
}

fn count_live(pages: &[usize]) -> usize {
    pages
        .iter()
        .map(|&addr| {
            let header = unsafe { &*(addr as *const PageHeader) };
            header.reachable_flags.iter_set(Ordering::Acquire).count()
        })
        .sum()
}

fn collect_live(pages: &[usize]) -> Vec<usize> {
    let mut out = Vec::new();
    for &addr in pages {
        let header = unsafe { &*(addr as *const PageHeader) };
        out.extend(
            header
                .reachable_flags
                .iter_set(Ordering::Acquire)
                .map(|idx| header.slot_addr(idx)),
        );
    }
    out
}

static COLLECTOR: OnceLock<Arc<Collector>> = OnceLock::new();

fn collector() -> &'static Arc<Collector> {
    COLLECTOR.get_or_init(|| {
        let c = Arc::new(Collector::new());
        let worker = Arc::clone(&c);
        std::thread::Builder::new()
            .name("tracegc-collector".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn tracegc collector thread");
        c
    })
}

/// Requests a collection, optionally blocking until it completes two full
/// cycles (so objects unreachable only as of the first cycle are reclaimed
/// by the second). Returns `false` if the collector is paused for live-set
/// enumeration or already shutting down.
pub fn force_collect(wait: bool) -> bool {
    collector().force_collect(wait)
}

/// Pauses the collector after two cycles and returns every currently
/// reachable slot address, plus a guard that un-pauses it on drop.
pub fn get_live_objects() -> (PauseGuard, Vec<usize>) {
    collector().get_live_objects()
}

/// The live-object count observed at the end of the most recent cycle.
pub fn last_live_object_count() -> usize {
    collector().last_live_count.load(Ordering::Relaxed)
}

/// Notifies the collector of a fresh allocation on the mutator side, waking
/// it early once growth since the last cycle crosses
/// `Config::trigger_percentage`. Called from the allocator hot path in
/// `block.rs`.
pub(crate) fn notify_alloc() {
    collector().record_alloc();
}

/// Shuts the collector down, idempotently. Blocks until five consecutive
/// empty cycles have run.
pub fn terminate() {
    collector().terminate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::make::make_tracked;
    use crate::ptr::Tracked;

    struct Leaf(u64);
    struct Node {
        next: Tracked<Leaf>,
    }

    #[test]
    fn force_collect_reclaims_dropped_unique() {
        let before = last_live_object_count();
        {
            let _u = make_tracked(|| Leaf(1)).unwrap();
            assert!(force_collect(true));
        }
        assert!(force_collect(true));
        let after = last_live_object_count();
        assert!(after <= before + 1);
    }

    #[test]
    fn write_barrier_keeps_stored_object_alive() {
        let root: Tracked<Leaf> = Tracked::default();
        let u = make_tracked(|| Leaf(7)).unwrap();
        u.into_tracked(&root);
        assert!(force_collect(true));
        assert_ne!(root.load(core::sync::atomic::Ordering::Acquire), 0);
    }

    #[test]
    fn node_with_child_traces_through() {
        let u = make_tracked(|| Node { next: Tracked::default() }).unwrap();
        let leaf = make_tracked(|| Leaf(9)).unwrap();
        unsafe {
            let node_ref = &*(u.addr() as *const Node);
            leaf.into_tracked(&node_ref.next);
        }
        let root: Tracked<Node> = Tracked::default();
        u.into_tracked(&root);
        assert!(force_collect(true));
        assert_ne!(root.load(core::sync::atomic::Ordering::Acquire), 0);
    }
}
