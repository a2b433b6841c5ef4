//! Weeder coordination: the mark/sweep protocol that reclaims dead
//! cache entries (§4.F).
//!
//! The actual graph walk is driven externally (a weeder client walks
//! the graph log from the roots this hands it); `Weeder` is the state
//! machine that keeps that external process and the server's own
//! locking in step, mirroring the original's `StartMark`/
//! `SetHitFilter`/`GetLeases`/`ResumeLeaseExp`/`EndMark`/`CommitChkpt`
//! RPC sequence (§4.F):
//!
//! ```text
//! Normal --StartMark--> Marking --EndMark--> Deleting --CommitChkpt--> Normal
//! ```
//!
//! `GetLeases` snapshots the root set while expiration is frozen, then
//! `ResumeLeaseExp` unfreezes it immediately afterward — the freeze
//! only needs to cover the snapshot itself, not the whole (potentially
//! slow) graph walk that follows. `EndMark` hands the state machine
//! the actual deletion target (the CIs to remove and the MultiPKFile
//! prefixes that contain them); [`crate::pipeline::Pipeline`] reads
//! those back out to drive the background sweep, and the hit filter
//! stays around until `CommitChkpt` so a concurrent `Lookup` keeps
//! excluding the same CIs while the sweep is still in flight (I3). A
//! crash mid-mark or mid-delete is recovered by
//! [`Weeder::recovering_state`], which the server checks on startup
//! (§4.E, §7): the hit filter and pending deletion set were durable
//! (stableVars) before the transition into `Deleting`, so a restart
//! can resume the sweep without re-marking from scratch.

use std::sync::Mutex;

use crate::bitvector::BitVector;
use crate::pkprefix::PkPrefix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeederState {
    Normal,
    Marking,
    Deleting,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WeederError {
    #[error("a weeder run is already in progress")]
    AlreadyRunning,
    #[error("operation not valid in the weeder's current state")]
    WrongState,
    #[error("EndMark called before SetHitFilter")]
    NoHitFilter,
}

struct Inner {
    state: WeederState,
    hit_filter: Option<BitVector>,
    pending_deletion: Option<BitVector>,
    pending_prefixes: Vec<PkPrefix>,
}

pub struct Weeder {
    inner: Mutex<Inner>,
}

impl Weeder {
    pub fn new() -> Self {
        Weeder {
            inner: Mutex::new(Inner {
                state: WeederState::Normal,
                hit_filter: None,
                pending_deletion: None,
                pending_prefixes: Vec::new(),
            }),
        }
    }

    /// Rebuild the FSM directly into `Deleting` on startup recovery,
    /// with the deletion target restored from stableVars (§7 "if
    /// `deleting` was true, re-enter Deleting and resume the worker
    /// from `mpksToWeed`").
    pub fn recover_into_deleting(hit_filter: BitVector, pending_deletion: BitVector, pending_prefixes: Vec<PkPrefix>) -> Self {
        Weeder {
            inner: Mutex::new(Inner {
                state: WeederState::Deleting,
                hit_filter: Some(hit_filter),
                pending_deletion: Some(pending_deletion),
                pending_prefixes,
            }),
        }
    }

    pub fn state(&self) -> WeederState {
        self.inner.lock().unwrap().state
    }

    /// `Normal -> Marking`. Freezes lease expiration so the next
    /// `GetLeases` sees a root set that can't shrink underneath it.
    pub fn start_mark(&self, leases: &crate::leases::LeaseSet) -> Result<(), WeederError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != WeederState::Normal {
            return Err(WeederError::AlreadyRunning);
        }
        leases.disable_expiration();
        inner.state = WeederState::Marking;
        Ok(())
    }

    /// Snapshot the current set of leased CIs as mark-phase roots.
    pub fn get_leases(&self, leases: &crate::leases::LeaseSet) -> Result<BitVector, WeederError> {
        let inner = self.inner.lock().unwrap();
        if inner.state != WeederState::Marking {
            return Err(WeederError::WrongState);
        }
        Ok(leases.leased())
    }

    /// Unfreeze lease expiration once the root snapshot has been taken
    /// — the graph walk itself doesn't need leases held still.
    pub fn resume_lease_exp(&self, leases: &crate::leases::LeaseSet) -> Result<(), WeederError> {
        let inner = self.inner.lock().unwrap();
        if inner.state != WeederState::Marking {
            return Err(WeederError::WrongState);
        }
        leases.enable_expiration();
        Ok(())
    }

    /// Record the result of the external graph walk: every CI reachable
    /// from a root.
    pub fn set_hit_filter(&self, filter: BitVector) -> Result<(), WeederError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != WeederState::Marking {
            return Err(WeederError::WrongState);
        }
        inner.hit_filter = Some(filter);
        Ok(())
    }

    pub fn hit_filter(&self) -> Option<BitVector> {
        self.inner.lock().unwrap().hit_filter.clone()
    }

    /// `Marking -> Deleting`. `cis` is the deletion target (the CIs the
    /// external weeder has decided are unreachable) and `pfxs` the
    /// MultiPKFile prefixes containing them; both become the pending
    /// state a background sweep (and, on a crash, recovery) reads back
    /// via [`Weeder::pending_deletion`]/[`Weeder::pending_prefixes`].
    pub fn end_mark(&self, cis: BitVector, pfxs: Vec<PkPrefix>) -> Result<(), WeederError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != WeederState::Marking {
            return Err(WeederError::WrongState);
        }
        if inner.hit_filter.is_none() {
            return Err(WeederError::NoHitFilter);
        }
        inner.pending_deletion = Some(cis);
        inner.pending_prefixes = pfxs;
        inner.state = WeederState::Deleting;
        Ok(())
    }

    pub fn pending_deletion(&self) -> Option<BitVector> {
        self.inner.lock().unwrap().pending_deletion.clone()
    }

    pub fn pending_prefixes(&self) -> Vec<PkPrefix> {
        self.inner.lock().unwrap().pending_prefixes.clone()
    }

    /// `Deleting -> Normal`, once a checkpoint has made the deletions
    /// durable.
    pub fn commit_chkpt(&self) -> Result<(), WeederError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != WeederState::Deleting {
            return Err(WeederError::WrongState);
        }
        inner.state = WeederState::Normal;
        inner.hit_filter = None;
        inner.pending_deletion = None;
        inner.pending_prefixes.clear();
        Ok(())
    }

    /// CIs that are live but unreached by the mark: the set the sweep
    /// should delete.
    pub fn dead_cis(live: &BitVector, hit_filter: &BitVector) -> BitVector {
        BitVector::difference(live, hit_filter)
    }

    /// Was a weeder run in progress (`Marking` or `Deleting`) at the
    /// point this state was captured before a crash? If so, startup
    /// recovery restarts from `Normal` (for `Marking`, where nothing
    /// durable had been committed yet) and expects the external weeder
    /// client to notice and re-run `StartMark`; a `Deleting` restart is
    /// resumed directly via [`Weeder::recover_into_deleting`] instead,
    /// since its deletion target was already durable (§4.F, §4.E).
    pub fn recovering_state(state: WeederState) -> bool {
        !matches!(state, WeederState::Normal)
    }
}

impl Default for Weeder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::leases::LeaseSet;

    fn prefix(n: u64) -> PkPrefix {
        PkPrefix::of(&Fingerprint::new(n, 0))
    }

    #[test]
    fn full_cycle_transitions_through_every_state() {
        let weeder = Weeder::new();
        let leases = LeaseSet::new();
        leases.new_lease(1);

        weeder.start_mark(&leases).unwrap();
        assert_eq!(weeder.state(), WeederState::Marking);

        let roots = weeder.get_leases(&leases).unwrap();
        assert!(roots.get(1));
        weeder.resume_lease_exp(&leases).unwrap();

        let mut hit = BitVector::new();
        hit.set(1);
        weeder.set_hit_filter(hit.clone()).unwrap();

        let mut dead = BitVector::new();
        dead.set(2);
        weeder.end_mark(dead.clone(), vec![prefix(7)]).unwrap();
        assert_eq!(weeder.state(), WeederState::Deleting);
        assert_eq!(weeder.pending_deletion().unwrap(), dead);
        assert_eq!(weeder.pending_prefixes(), vec![prefix(7)]);

        weeder.commit_chkpt().unwrap();
        assert_eq!(weeder.state(), WeederState::Normal);
        assert!(weeder.pending_deletion().is_none());
    }

    #[test]
    fn cannot_start_mark_twice_concurrently() {
        let weeder = Weeder::new();
        let leases = LeaseSet::new();
        weeder.start_mark(&leases).unwrap();
        assert_eq!(weeder.start_mark(&leases), Err(WeederError::AlreadyRunning));
    }

    #[test]
    fn end_mark_without_hit_filter_fails() {
        let weeder = Weeder::new();
        let leases = LeaseSet::new();
        weeder.start_mark(&leases).unwrap();
        assert_eq!(
            weeder.end_mark(BitVector::new(), vec![]),
            Err(WeederError::NoHitFilter)
        );
    }

    #[test]
    fn dead_cis_is_live_minus_hit_filter() {
        let live = BitVector::from_iter(vec![1, 2, 3]);
        let hit = BitVector::from_iter(vec![2]);
        assert_eq!(Weeder::dead_cis(&live, &hit).to_vec(), vec![1, 3]);
    }

    #[test]
    fn recovering_into_deleting_restores_pending_state() {
        let mut hit = BitVector::new();
        hit.set(1);
        let mut dead = BitVector::new();
        dead.set(9);
        let weeder = Weeder::recover_into_deleting(hit, dead.clone(), vec![prefix(3)]);
        assert_eq!(weeder.state(), WeederState::Deleting);
        assert_eq!(weeder.pending_deletion().unwrap(), dead);
    }
}
