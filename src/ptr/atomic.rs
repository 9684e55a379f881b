//! Hazard-pointer-protected atomic pointer.
//!
//! Identical storage and write-barrier to [`crate::ptr::tracked::Tracked`],
//! but `load` publishes the observed value into the calling thread's
//! hazard slot before trusting it: the collector will not reclaim any slot
//! whose address currently sits in any thread's hazard slot, so a
//! concurrent sweep can never pull the rug out from under a `load` that is
//! still in flight.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::page;
use crate::thread_ctx;

/// A `Tracked`-shaped pointer whose `load` is hazard-pointer protected.
pub struct AtomicTracked<T> {
    word: AtomicUsize,
    _marker: PhantomData<T>,
}

impl<T> AtomicTracked<T> {
    /// Creates a pointer holding `addr` (`0` for null).
    pub fn new(addr: usize) -> Self {
        Self {
            word: AtomicUsize::new(addr),
            _marker: PhantomData,
        }
    }

    /// Publishes the observed value into this thread's hazard slot, rereads
    /// to confirm it hasn't changed, and retries on mismatch — the standard
    /// hazard-pointer load loop.
    #[inline]
    pub fn load(&self, order: Ordering) -> usize {
        // Minimum `Acquire` regardless of what the caller requested.
        let effective = match order {
            Ordering::Relaxed => Ordering::Acquire,
            other => other,
        };
        let hazard = &thread_ctx::current().hazard;
        loop {
            let observed = self.word.load(effective);
            hazard.publish(observed);
            let recheck = self.word.load(effective);
            if recheck == observed {
                hazard.clear();
                return observed;
            }
        }
    }

    /// Stores `addr`, applying the write-barrier when non-null.
    #[inline]
    pub fn store(&self, addr: usize, order: Ordering) {
        self.word.store(addr, order);
        if addr != 0 {
            unsafe { page::mark_reachable(addr) };
        }
    }

    /// Atomically replaces the target, applying the write-barrier to the
    /// new value. Returns the previous address.
    #[inline]
    pub fn swap(&self, addr: usize, order: Ordering) -> usize {
        let previous = self.word.swap(addr, order);
        if addr != 0 {
            unsafe { page::mark_reachable(addr) };
        }
        previous
    }

    /// Compare-and-swap; the write-barrier applies to `new` only on
    /// success.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        let result = self.word.compare_exchange(current, new, success, failure);
        if result.is_ok() && new != 0 {
            unsafe { page::mark_reachable(new) };
        }
        result
    }

    /// Weak compare-and-swap variant.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: usize,
        new: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<usize, usize> {
        let result = self
            .word
            .compare_exchange_weak(current, new, success, failure);
        if result.is_ok() && new != 0 {
            unsafe { page::mark_reachable(new) };
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_clears_hazard_slot_after_success() {
        let a = AtomicTracked::<u8>::new(0x3000);
        assert_eq!(a.load(Ordering::Acquire), 0x3000);
        assert_eq!(thread_ctx::current().hazard.get(), 0);
    }

    #[test]
    fn store_then_load_round_trips() {
        let a = AtomicTracked::<u8>::new(0);
        a.store(0x4000, Ordering::Release);
        assert_eq!(a.load(Ordering::Acquire), 0x4000);
    }
}
