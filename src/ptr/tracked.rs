//! Heap-embedded tracked pointer.
//!
//! Storage is a single `AtomicUsize` carrying either `0` (null) or a slot
//! address handed out by the page allocator. `Default` — the only public
//! zero-arg constructor — leaves the word holding
//! [`crate::type_info::CHILD_SENTINEL`] rather than `0`, so that
//! `make_tracked`'s discovery pass can tell "an embedded tracked
//! pointer, left at its default value" apart from "an ordinary field that
//! happens to contain that exact byte pattern by chance" with the same
//! confidence the original address-identity scheme gets from never seeing
//! that pattern anywhere else in a freshly sentinel-filled slot.
//!
//! Embedded pointers are wired up with `store` *after* construction
//! returns from `make_tracked`, not inside the constructor closure itself
//! — see the module-level note on `make_tracked` for why.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::page;
use crate::type_info::CHILD_SENTINEL;

/// A pointer field embedded inside a managed object, applying a
/// write-barrier on every non-null store.
pub struct Tracked<T> {
    word: AtomicUsize,
    _marker: PhantomData<T>,
}

impl<T> Tracked<T> {
    /// Loads the current target address, `0` meaning null.
    #[inline]
    pub fn load(&self, order: Ordering) -> usize {
        self.word.load(order)
    }

    /// Stores `addr` (`0` for null), applying the write-barrier when
    /// non-null: the target slot's state is published as `Reachable`.
    #[inline]
    pub fn store(&self, addr: usize, order: Ordering) {
        self.word.store(addr, order);
        if addr != 0 {
            // SAFETY: a non-zero `addr` stored into a `Tracked<T>` must be a
            // live slot address; callers uphold this by construction (every
            // safe way to obtain one comes from the allocator).
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

    /// Compare-and-swap; the write-barrier applies to `new` only if the
    /// exchange succeeds.
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

    /// Weak compare-and-swap variant; same write-barrier semantics as
    /// [`Tracked::compare_exchange`].
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

    /// `true` if this word currently holds the discovery sentinel (used
    /// only by `make_tracked`'s child-offset scan).
    pub(crate) fn holds_sentinel(&self) -> bool {
        self.word.load(Ordering::Relaxed) == CHILD_SENTINEL
    }

    /// Resets a sentinel-holding word to null (used only by
    /// `make_tracked`, after recording the field's offset).
    pub(crate) fn reset_to_null(&self) {
        self.word.store(0, Ordering::Relaxed);
    }
}

impl<T> Default for Tracked<T> {
    fn default() -> Self {
        Self {
            word: AtomicUsize::new(CHILD_SENTINEL),
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_holds_sentinel_until_reset() {
        let t: Tracked<u8> = Tracked::default();
        assert!(t.holds_sentinel());
        t.reset_to_null();
        assert!(!t.holds_sentinel());
        assert_eq!(t.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn store_null_is_a_total_operation() {
        let t: Tracked<u8> = Tracked::default();
        t.store(0, Ordering::Relaxed);
        assert_eq!(t.load(Ordering::Relaxed), 0);
    }
}
