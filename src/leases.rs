//! Lease-based liveness for volatile entries (§3, §4.E).
//!
//! A client holds a CI alive by leasing it; an unrenewed lease expires
//! after somewhere between one and two lease periods. That grace
//! window comes from double-buffering two bit vectors instead of
//! tracking a timestamp per CI: `new` accumulates this period's
//! leases and renewals, `old` holds last period's. A CI is leased iff
//! it's set in either. Each tick swaps `new` into `old` (dropping the
//! previous `old`) and clears `new` — so a CI survives the tick it's
//! swapped into `old` on, and only truly expires if it goes a whole
//! further period unrenewed.
//!
//! Expiration can be paused ([`LeaseSet::disable_expiration`]) for the
//! duration of the weeder's mark phase, so the set of roots it reads
//! via [`LeaseSet::leased`] can't shrink out from under it mid-mark
//! (§4.F).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::bitvector::BitVector;
use crate::entry::Ci;

struct LeaseSetInner {
    old: BitVector,
    new: BitVector,
}

/// Shared, thread-safe lease table with a background expiry ticker.
pub struct LeaseSet {
    inner: Mutex<LeaseSetInner>,
    expiration_enabled: AtomicBool,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl LeaseSet {
    pub fn new() -> Arc<Self> {
        let (stop_tx, stop_rx) = bounded(1);
        Arc::new(LeaseSet {
            inner: Mutex::new(LeaseSetInner {
                old: BitVector::new(),
                new: BitVector::new(),
            }),
            expiration_enabled: AtomicBool::new(true),
            stop_tx,
            stop_rx,
        })
    }

    /// Take out (or renew) a lease on `ci`. Both are the same
    /// operation on this representation: set the bit in `new`.
    pub fn new_lease(&self, ci: Ci) {
        self.inner.lock().unwrap().new.set(ci);
    }

    pub fn renew_lease(&self, ci: Ci) {
        self.new_lease(ci);
    }

    pub fn is_leased(&self, ci: Ci) -> bool {
        let guard = self.inner.lock().unwrap();
        guard.old.get(ci) || guard.new.get(ci)
    }

    /// Every CI currently leased — the weeder's root set (§4.F).
    pub fn leased(&self) -> BitVector {
        let guard = self.inner.lock().unwrap();
        BitVector::union(&guard.old, &guard.new)
    }

    pub fn disable_expiration(&self) {
        self.expiration_enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable_expiration(&self) {
        self.expiration_enabled.store(true, Ordering::SeqCst);
    }

    /// One expiry tick: `old := new`, `new := {}`. A no-op while
    /// expiration is disabled, so leases held during a mark phase
    /// can't lapse out of `old` either.
    fn tick(&self) {
        if !self.expiration_enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.inner.lock().unwrap();
        guard.old = std::mem::take(&mut guard.new);
    }

    /// Spawn the background ticker. The returned handle's `Drop`
    /// (via [`LeaseSet::stop`]) is not automatic — callers own the
    /// `JoinHandle` and should call `stop` explicitly during shutdown.
    pub fn spawn_expiry_thread(self: &Arc<Self>, period: Duration) -> std::thread::JoinHandle<()> {
        let set = Arc::clone(self);
        std::thread::spawn(move || loop {
            match set.stop_rx.recv_timeout(period) {
                Ok(()) => return,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => set.tick(),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lease_survives_one_tick_then_expires_without_renewal() {
        let leases = LeaseSet::new();
        leases.new_lease(7);
        assert!(leases.is_leased(7));

        leases.tick(); // new -> old
        assert!(leases.is_leased(7), "must survive the tick it moves into old on");

        leases.tick(); // old replaced by empty new
        assert!(!leases.is_leased(7), "must expire after a full period unrenewed");
    }

    #[test]
    fn renewal_before_tick_keeps_lease_alive_indefinitely() {
        let leases = LeaseSet::new();
        leases.new_lease(3);
        leases.tick();
        leases.renew_lease(3);
        leases.tick();
        assert!(leases.is_leased(3));
    }

    #[test]
    fn disabling_expiration_freezes_the_lease_set() {
        let leases = LeaseSet::new();
        leases.new_lease(1);
        leases.tick();
        leases.disable_expiration();
        leases.tick();
        leases.tick();
        assert!(leases.is_leased(1), "ticks while disabled must not expire anything");
        leases.enable_expiration();
        leases.tick();
        assert!(!leases.is_leased(1));
    }

    #[test]
    fn leased_returns_union_of_old_and_new() {
        let leases = LeaseSet::new();
        leases.new_lease(1);
        leases.tick();
        leases.new_lease(2);
        let all = leases.leased();
        assert!(all.get(1));
        assert!(all.get(2));
    }
}
