//! The volatile store: entries added since the last checkpoint, plus a
//! cache of stable entries pulled in to answer `Lookup` (§3, §4.C,
//! §4.I, §9).
//!
//! A [`VPkFile`] holds one PK's state in memory: entries added this
//! epoch that haven't made it into the stable MultiPKFile yet
//! (`new_entries`), and a cache of entries already on disk, keyed by
//! combined fingerprint, so a `Lookup` that keeps missing on the same
//! CFP doesn't re-read the stable store every time. A [`VMultiPkFile`]
//! groups the PKFiles sharing one [`PkPrefix`] behind a single mutex —
//! matching the stable layout's grouping, and matching the lock the
//! weeder and the checkpoint path both have to take.
//!
//! Checkpointing takes the lock only long enough to detach the
//! `new_entries` lists (the "flush-detach-under-mutex" pattern of
//! §9) — it does the actual, slow stable-store write after releasing
//! it, so a checkpoint never blocks concurrent `Lookup`/`AddEntry`
//! calls on disk I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::entry::CacheEntry;
use crate::fingerprint::Fingerprint;
use crate::pkprefix::PkPrefix;
use crate::store::names::NameDict;

/// One PK's volatile state.
#[derive(Default)]
pub struct VPkFile {
    pub names: NameDict,
    new_entries: Vec<CacheEntry>,
    old_entries_cache: HashMap<Fingerprint, Vec<CacheEntry>>,
}

impl VPkFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: CacheEntry) {
        self.new_entries.push(entry);
    }

    pub fn new_entries(&self) -> &[CacheEntry] {
        &self.new_entries
    }

    /// Entries added this epoch whose CFP matches.
    pub fn new_entries_with_cfp(&self, cfp: Fingerprint) -> impl Iterator<Item = &CacheEntry> {
        self.new_entries.iter().filter(move |e| e.cfp == cfp)
    }

    /// Seed (or refresh) the cache of stable entries for one CFP
    /// bucket, so the next `Lookup` on the same CFP skips the stable
    /// read.
    pub fn cache_stable_entries(&mut self, cfp: Fingerprint, entries: Vec<CacheEntry>) {
        self.old_entries_cache.insert(cfp, entries);
    }

    pub fn cached_stable_entries(&self, cfp: Fingerprint) -> Option<&[CacheEntry]> {
        self.old_entries_cache.get(&cfp).map(|v| v.as_slice())
    }

    /// Remove this epoch's `new_entries`, returning them for the
    /// checkpoint writer. Called while the owning [`VMultiPkFile`]'s
    /// mutex is held; the caller drops the lock before doing anything
    /// slow with the result.
    pub fn detach_new_entries(&mut self) -> Vec<CacheEntry> {
        std::mem::take(&mut self.new_entries)
    }

    /// Drop the stable-entries cache. Needed after a checkpoint
    /// changes what's on disk, so a stale cache entry can't shadow
    /// entries the checkpoint just wrote or weeded.
    pub fn invalidate_stable_cache(&mut self) {
        self.old_entries_cache.clear();
    }
}

struct VMultiPkFileInner {
    pkfiles: HashMap<Fingerprint, VPkFile>,
}

/// All PKs sharing one [`PkPrefix`], guarded by a single mutex (§9:
/// "the fixed lock-ordering discipline" puts this below the weeder and
/// the CI allocator, above nothing).
pub struct VMultiPkFile {
    pub prefix: PkPrefix,
    inner: Mutex<VMultiPkFileInner>,
}

impl VMultiPkFile {
    pub fn new(prefix: PkPrefix) -> Self {
        VMultiPkFile {
            prefix,
            inner: Mutex::new(VMultiPkFileInner {
                pkfiles: HashMap::new(),
            }),
        }
    }

    /// Run `f` against the PKFile for `pk`, creating it if this is the
    /// first entry this process has seen for that PK.
    pub fn with_pkfile<R>(&self, pk: Fingerprint, f: impl FnOnce(&mut VPkFile) -> R) -> R {
        let mut guard = self.inner.lock().unwrap();
        let pkfile = guard.pkfiles.entry(pk).or_insert_with(VPkFile::new);
        f(pkfile)
    }

    /// Detach every PK's `new_entries` under one lock acquisition, for
    /// a checkpoint that flushes the whole prefix group at once.
    pub fn detach_all_new_entries(&self) -> Vec<(Fingerprint, Vec<CacheEntry>)> {
        let mut guard = self.inner.lock().unwrap();
        guard
            .pkfiles
            .iter_mut()
            .filter_map(|(&pk, v)| {
                let entries = v.detach_new_entries();
                if entries.is_empty() {
                    None
                } else {
                    Some((pk, entries))
                }
            })
            .collect()
    }

    pub fn invalidate_stable_cache(&self, pk: Fingerprint) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(v) = guard.pkfiles.get_mut(&pk) {
            v.invalidate_stable_cache();
        }
    }

    pub fn known_pks(&self) -> Vec<Fingerprint> {
        self.inner.lock().unwrap().pkfiles.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::IMap;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n, 0)
    }

    fn sample_entry(ci: u32) -> CacheEntry {
        CacheEntry {
            ci,
            cfp: fp(1),
            imap: IMap::Identity,
            fps: vec![],
            value: vec![],
            model: Fingerprint::ZERO,
            kids: vec![],
            source_func: "f".into(),
        }
    }

    #[test]
    fn add_then_detach_empties_new_entries() {
        let vmp = VMultiPkFile::new(PkPrefix::of(&fp(1)));
        vmp.with_pkfile(fp(1), |pkf| pkf.add_entry(sample_entry(1)));
        vmp.with_pkfile(fp(1), |pkf| assert_eq!(pkf.new_entries().len(), 1));

        let detached = vmp.detach_all_new_entries();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].1.len(), 1);

        vmp.with_pkfile(fp(1), |pkf| assert_eq!(pkf.new_entries().len(), 0));
    }

    #[test]
    fn stable_cache_can_be_seeded_and_invalidated() {
        let mut pkf = VPkFile::new();
        assert!(pkf.cached_stable_entries(fp(9)).is_none());
        pkf.cache_stable_entries(fp(9), vec![sample_entry(5)]);
        assert_eq!(pkf.cached_stable_entries(fp(9)).unwrap().len(), 1);
        pkf.invalidate_stable_cache();
        assert!(pkf.cached_stable_entries(fp(9)).is_none());
    }
}
