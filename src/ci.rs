//! Cache-entry index allocation (§4.A, I1).
//!
//! CIs are handed out from an ever-growing counter and never reused,
//! even after the entry they named is deleted by the weeder — reusing
//! one would let a stale client's `kids` list silently point at an
//! unrelated entry. The allocator additionally tracks which CIs are
//! currently live (allocated and not yet deleted) as a [`BitVector`],
//! recording each allocation or deletion as an [`Intvl`] so the log can
//! replay allocator state on recovery without replaying every
//! individual `AddEntry`.

use crate::bitvector::{BitVector, Intvl};
use crate::entry::Ci;

/// Tracks the next CI to hand out and the set of currently live CIs.
pub struct CiAllocator {
    next: Ci,
    live: BitVector,
    log: Vec<Intvl>,
}

impl CiAllocator {
    pub fn new() -> Self {
        CiAllocator {
            next: 0,
            live: BitVector::new(),
            log: Vec::new(),
        }
    }

    /// Rebuild allocator state from a recovered interval log and the
    /// highest CI ever issued (read back from the checkpoint or replayed
    /// from the cache log). Used on startup recovery (§4.E, §9).
    pub fn recover(next: Ci, intervals: Vec<Intvl>) -> Self {
        let mut live = BitVector::new();
        for iv in &intervals {
            iv.apply(&mut live);
        }
        CiAllocator {
            next,
            live,
            log: intervals,
        }
    }

    /// Allocate one fresh CI. Never returns a value previously returned,
    /// even if that value's entry has since been deleted (I1).
    pub fn allocate(&mut self) -> Ci {
        let ci = self.next;
        self.next = self
            .next
            .checked_add(1)
            .expect("cache-entry index space exhausted");
        let iv = Intvl::Add { lo: ci, hi: ci };
        iv.apply(&mut self.live);
        self.log.push(iv);
        ci
    }

    /// Mark a set of CIs as deleted (weeder sweep completion, §4.F).
    /// Deleted CIs are removed from `live` but `next` never rewinds, so
    /// they cannot be handed out again.
    pub fn free(&mut self, cis: &BitVector) {
        for ci in cis.iter() {
            let iv = Intvl::Remove { lo: ci, hi: ci };
            iv.apply(&mut self.live);
            self.log.push(iv);
        }
    }

    /// Mark `ci` as live during cache-log replay, advancing `next`
    /// past it if necessary. Unlike [`CiAllocator::allocate`] this
    /// doesn't hand out a fresh index — it's restoring one the log
    /// says already existed.
    pub fn restore(&mut self, ci: Ci) {
        self.live.set(ci);
        if ci >= self.next {
            self.next = ci + 1;
        }
    }

    pub fn is_live(&self, ci: Ci) -> bool {
        self.live.get(ci)
    }

    pub fn live_set(&self) -> &BitVector {
        &self.live
    }

    pub fn next_ci(&self) -> Ci {
        self.next
    }

    /// Interval log entries since the last checkpoint, for
    /// checkpoint-time truncation (§4.B).
    pub fn pending_log(&self) -> &[Intvl] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }
}

impl Default for CiAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_monotonic_and_never_reused() {
        let mut alloc = CiAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(b > a);
        assert!(alloc.is_live(a));
        assert!(alloc.is_live(b));

        let mut freed = BitVector::new();
        freed.set(a);
        alloc.free(&freed);
        assert!(!alloc.is_live(a));

        let c = alloc.allocate();
        assert_ne!(c, a);
        assert!(c > b);
    }

    #[test]
    fn restore_advances_next_past_recovered_ci() {
        let mut alloc = CiAllocator::new();
        alloc.restore(41);
        assert!(alloc.is_live(41));
        assert_eq!(alloc.next_ci(), 42);
        let fresh = alloc.allocate();
        assert_eq!(fresh, 42);
    }

    #[test]
    fn recover_replays_interval_log_into_live_set() {
        let intervals = vec![
            Intvl::Add { lo: 0, hi: 9 },
            Intvl::Remove { lo: 3, hi: 5 },
        ];
        let alloc = CiAllocator::recover(10, intervals);
        assert!(alloc.is_live(0));
        assert!(!alloc.is_live(3));
        assert!(!alloc.is_live(5));
        assert!(alloc.is_live(9));
        assert_eq!(alloc.next_ci(), 10);
    }
}
