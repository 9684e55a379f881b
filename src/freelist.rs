//! A lock-free Treiber-stack freelist of raw addresses, tagged to dodge ABA.
//!
//! Adapted from this codebase's `BrandedFreelist`: same packed-pointer
//! tagging scheme, with the `'brand`/`GhostBorrow` token dropped since the
//! collector's allocator has no compile-time token scoping — callers here
//! are plain concurrent mutator threads.

use core::sync::atomic::{AtomicUsize, Ordering};

const PTR_MASK: usize = 0x0000_FFFF_FFFF_FFFF;
const TAG_SHIFT: usize = 48;

#[inline(always)]
fn pack(addr: usize, tag: usize) -> usize {
    (addr & PTR_MASK) | (tag << TAG_SHIFT)
}

#[inline(always)]
fn unpack(val: usize) -> (usize, usize) {
    (val & PTR_MASK, val >> TAG_SHIFT)
}

/// A lock-free freelist of raw slot addresses belonging to one page.
///
/// Each free block's first `size_of::<usize>()` bytes are reused to store
/// the "next" link, exactly as `BrandedFreelist` does.
pub struct Freelist {
    head: AtomicUsize,
}

impl Freelist {
    /// An empty freelist.
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    /// Pushes `addr` onto the list.
    ///
    /// # Safety
    /// `addr` must be a valid, currently-unused block of at least
    /// `size_of::<usize>()` bytes that the caller has exclusive access to.
    pub unsafe fn push(&self, addr: usize) {
        debug_assert_ne!(addr, 0);
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (next_addr, tag) = unpack(current);
            *(addr as *mut usize) = next_addr;
            let new_head = pack(addr, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(
                current,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pops an address from the list, or `None` if empty.
    pub fn pop(&self) -> Option<usize> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (addr, tag) = unpack(current);
            if addr == 0 {
                return None;
            }
            // SAFETY: `addr` was pushed by `push`, which always reserves the
            // leading word for the next-link.
            let next_addr = unsafe { *(addr as *const usize) };
            let new_head = pack(next_addr, tag.wrapping_add(1));
            match self.head.compare_exchange_weak(
                current,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(addr),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drains every entry (single-threaded cleanup use only, e.g. when a
    /// page is being released back to the block allocator).
    pub fn drain(&self) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(a) = self.pop() {
            out.push(a);
        }
        out
    }
}

unsafe impl Send for Freelist {}
unsafe impl Sync for Freelist {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_roundtrip() {
        let mut buf = [0u8; 64];
        let fl = Freelist::new();
        let addr = buf.as_mut_ptr() as usize;
        unsafe { fl.push(addr) };
        assert_eq!(fl.pop(), Some(addr));
        assert_eq!(fl.pop(), None);
    }

    #[test]
    fn lifo_order_for_multiple_pushes() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        let fl = Freelist::new();
        let addr_a = a.as_mut_ptr() as usize;
        let addr_b = b.as_mut_ptr() as usize;
        unsafe {
            fl.push(addr_a);
            fl.push(addr_b);
        }
        assert_eq!(fl.pop(), Some(addr_b));
        assert_eq!(fl.pop(), Some(addr_a));
    }
}
