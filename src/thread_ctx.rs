//! Per-thread context: stack-root shadow region and hazard slot.
//!
//! Thread registration mirrors this codebase's registry pattern for
//! process-wide state (a `Mutex`-guarded `Vec`, pruned lazily) rather than
//! a lock-free intrusive list: registration happens once per thread
//! lifetime and pruning once per collector cycle, both well outside any
//! allocation hot path, so the simpler structure costs nothing observable.
//! See `DESIGN.md`.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::hazard::HazardSlot;

/// Address-hashed shadow region recording every live `Stack<T>` on this
/// thread. Indexed by page number (modulo bucket count) composed
/// with the in-page word offset, so distinct offsets within the same page
/// never collide; distinct pages far enough apart can, which is an
/// accepted approximation of the source design (a collision only risks
/// over-retention if the evicted slot's object is also referenced
/// elsewhere, since the stale payload is still a `Tracked`-shaped word the
/// tracer would otherwise have marked).
pub struct ShadowRegion {
    slots: Box<[AtomicUsize]>,
    pages: usize,
    words_per_page: usize,
    page_size: usize,
}

impl ShadowRegion {
    fn new(max_stack_size: usize, page_size: usize) -> Self {
        let word = core::mem::size_of::<usize>();
        let words_per_page = (page_size / word).max(1);
        let pages = (max_stack_size / page_size).max(1);
        let slots = (0..pages * words_per_page)
            .map(|_| AtomicUsize::new(0))
            .collect();
        Self {
            slots,
            pages,
            words_per_page,
            page_size,
        }
    }

    fn index_for(&self, addr: usize) -> usize {
        let word = core::mem::size_of::<usize>();
        let page_no = (addr / self.page_size) % self.pages;
        let in_page_word = (addr % self.page_size) / word;
        page_no * self.words_per_page + in_page_word.min(self.words_per_page - 1)
    }

    /// Publishes `payload` (the pointer's raw tagged word) at the bucket
    /// addressed by the stack slot living at `addr`.
    pub fn register(&self, addr: usize, payload: usize) {
        self.slots[self.index_for(addr)].store(payload, Ordering::Release);
    }

    /// Clears the bucket for `addr` once the `Stack<T>` at that address is
    /// dropped or moves away.
    pub fn unregister(&self, addr: usize) {
        self.slots[self.index_for(addr)].store(0, Ordering::Release);
    }

    /// Every currently-published, non-zero payload (root-marking scan).
    pub fn scan(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&v| v != 0)
            .collect()
    }
}

/// Per-thread allocator/root state.
pub struct ThreadContext {
    pub shadow: ShadowRegion,
    pub hazard: HazardSlot,
    deleted: AtomicBool,
}

impl ThreadContext {
    fn new() -> Self {
        let cfg = crate::config::config();
        Self {
            shadow: ShadowRegion::new(cfg.max_stack_size, cfg.page_size),
            hazard: HazardSlot::new(),
            deleted: AtomicBool::new(false),
        }
    }

    /// `true` once this thread has exited and the collector should prune
    /// this entry after draining its shadow/hazard state one last time.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

struct Registry {
    threads: Mutex<Vec<Arc<ThreadContext>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        threads: Mutex::new(Vec::new()),
    })
}

struct ThreadHandle {
    ctx: Arc<ThreadContext>,
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.ctx.deleted.store(true, Ordering::Release);
    }
}

thread_local! {
    static CTX: ThreadHandle = {
        let ctx = Arc::new(ThreadContext::new());
        registry().threads.lock().unwrap().push(ctx.clone());
        ThreadHandle { ctx }
    };
}

/// This thread's context, registering it with the collector on first use.
pub fn current() -> Arc<ThreadContext> {
    CTX.with(|h| h.ctx.clone())
}

/// A live snapshot of every registered thread, pruning entries whose
/// thread has exited (used by the collector's registration/scan steps).
pub fn snapshot_and_prune() -> Vec<Arc<ThreadContext>> {
    let mut threads = registry().threads.lock().unwrap();
    let snapshot = threads.clone();
    threads.retain(|t| !t.is_deleted());
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_register_and_scan() {
        let shadow = ShadowRegion::new(4096 * 4, 4096);
        let addr = 0x7000_1234usize;
        shadow.register(addr, 0xdead_beef);
        assert_eq!(shadow.scan(), vec![0xdead_beefusize]);
        shadow.unregister(addr);
        assert!(shadow.scan().is_empty());
    }

    #[test]
    fn distinct_in_page_offsets_do_not_collide() {
        let shadow = ShadowRegion::new(4096, 4096);
        let word = core::mem::size_of::<usize>();
        shadow.register(0x1000, 111);
        shadow.register(0x1000 + word, 222);
        let mut scanned = shadow.scan();
        scanned.sort_unstable();
        assert_eq!(scanned, vec![111, 222]);
    }

    #[test]
    fn current_thread_context_is_stable_within_thread() {
        let a = current();
        let b = current();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
