//! Hazard-pointer slot.
//!
//! One slot per thread, published before an atomic pointer load is trusted
//! and cleared immediately after. The collector's trace pass treats any
//! address currently sitting in any thread's slot as implicitly reachable,
//! regardless of what the mark bits say.

use core::sync::atomic::{AtomicUsize, Ordering};

/// A single hazard-pointer publication slot, owned by one thread context.
pub struct HazardSlot {
    addr: AtomicUsize,
}

impl HazardSlot {
    pub const fn new() -> Self {
        Self {
            addr: AtomicUsize::new(0),
        }
    }

    /// Publishes `addr` as currently being dereferenced by this thread.
    pub fn publish(&self, addr: usize) {
        self.addr.store(addr, Ordering::SeqCst);
    }

    /// Clears the slot once the protected load has been consumed.
    pub fn clear(&self) {
        self.addr.store(0, Ordering::SeqCst);
    }

    /// Reads the currently-published address, `0` if none.
    pub fn get(&self) -> usize {
        self.addr.load(Ordering::SeqCst)
    }
}

impl Default for HazardSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A sorted snapshot of every hazard address currently published, used by
/// the collector to veto reclamation.
pub struct HazardSnapshot {
    sorted: Vec<usize>,
}

impl HazardSnapshot {
    pub fn build(mut addrs: Vec<usize>) -> Self {
        addrs.retain(|&a| a != 0);
        addrs.sort_unstable();
        addrs.dedup();
        Self { sorted: addrs }
    }

    /// `true` if `addr` is currently protected by some thread's hazard slot.
    pub fn protects(&self, addr: usize) -> bool {
        self.sorted.binary_search(&addr).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_clear_round_trip() {
        let slot = HazardSlot::new();
        assert_eq!(slot.get(), 0);
        slot.publish(0x1000);
        assert_eq!(slot.get(), 0x1000);
        slot.clear();
        assert_eq!(slot.get(), 0);
    }

    #[test]
    fn snapshot_protects_published_addresses_only() {
        let snap = HazardSnapshot::build(vec![0, 16, 32, 16]);
        assert!(snap.protects(16));
        assert!(snap.protects(32));
        assert!(!snap.protects(48));
        assert!(!snap.protects(0));
    }
}
