//! The four operations clients actually drive: `FreeVariables`,
//! `Lookup`, `AddEntry`, and `Checkpoint` (§4.I).
//!
//! `Pipeline` owns every piece of server state that isn't purely
//! per-connection: the volatile store, the CI allocator, the lease
//! set, the weeder, and the three logs. The RPC dispatch in
//! [`crate::server`] is a thin wrapper translating wire requests into
//! calls here; everything that isn't wire framing lives in this file.
//!
//! Lock ordering, should more than one of these be held at once:
//! weeder, then CI allocator, then a `VMultiPkFile`'s own mutex. No
//! operation here currently needs more than one at a time, but new
//! code must respect this order if it ever does (§9).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::bitvector::{BitVector, Intvl};
use crate::ci::CiAllocator;
use crate::config::Config;
use crate::entry::{CacheEntry, Ci, IMap};
use crate::error::{AddEntryOutcome, CacheError, CheckpointOutcome, LookupOutcome};
use crate::fingerprint::Fingerprint;
use crate::leases::LeaseSet;
use crate::log::cache_log::{CacheLogRecord, NewName};
use crate::log::empty_pk_log;
use crate::log::graph_log::GraphLogRecord;
use crate::log::AppendLog;
use crate::pkprefix::PkPrefix;
use crate::store::names::NameDict;
use crate::store::pkfile::{SMultiPkFile, SPkFile};
use crate::volatile::VMultiPkFile;
use crate::weeder::{Weeder, WeederError, WeederState};

/// One free variable supplied with a `Lookup` or `AddEntry` call:
/// a name, its declared type tag, and the fingerprint of the value
/// bound to it. `kind` is only meaningful on `AddEntry` — `Lookup`
/// callers may leave it at 0, since matching never inspects it.
#[derive(Clone, Debug)]
pub struct FreeVar {
    pub name: String,
    pub kind: u8,
    pub fp: Fingerprint,
}

/// `FreeVariables`'s reply (§4.I step 1): the PKFile-wide name
/// dictionary in order, its current epoch, and whether this PK has no
/// PKFile at all yet (in either store), in which case the evaluator
/// skips straight to `AddEntry`.
#[derive(Clone, Debug)]
pub struct FreeVariables {
    pub names: Vec<(String, u8)>,
    pub epoch: u64,
    pub is_empty: bool,
}

pub struct Pipeline {
    config: Config,
    vmultipkfiles: RwLock<HashMap<PkPrefix, Arc<VMultiPkFile>>>,
    ci_allocator: Mutex<CiAllocator>,
    pub leases: Arc<LeaseSet>,
    pub weeder: Weeder,
    cache_log: Mutex<AppendLog>,
    graph_log: Mutex<AppendLog>,
    empty_pk_log: Mutex<AppendLog>,
    /// CI allocator interval log (§4.A, I2): every `allocate`/`free`
    /// is appended and fsynced here before the RPC that caused it
    /// replies, independent of whatever the cache log already implies.
    ci_log: Mutex<AppendLog>,
    /// Bumped on every `StartMark`-driven graph-log rotation; stands
    /// in for the original's generation-numbered `graphLog/<version>`
    /// file naming (§6) without this crate actually splitting the
    /// graph log into per-generation files.
    graph_log_generation: AtomicU64,
    /// The background sweep `EndMark` forked, so `CommitChkpt` can
    /// join it before declaring the weed durable.
    deletion_handle: Mutex<Option<JoinHandle<()>>>,
    add_entry_disabled: std::sync::atomic::AtomicBool,
    /// Hit-provenance counters (`CacheIntf::LookupOutcome` in the
    /// original), exposed read-only via `GetCacheState`. Every `Lookup`
    /// bumps exactly one of these — which bucket it satisfied from
    /// falls out of `lookup_against` for free, so there's no extra work
    /// to compute it.
    lookup_stats: LookupStats,
}

#[derive(Default)]
struct LookupStats {
    new_hits: AtomicU64,
    warm_hits: AtomicU64,
    disk_hits: AtomicU64,
    all_misses: AtomicU64,
}

/// Which tier of the store satisfied a `Lookup`, mirroring the
/// original's `CacheIntf::LookupOutcome` (`NewHits`/`WarmHits`/
/// `DiskHits`/`AllMisses`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HitProvenance {
    /// Matched an entry this process added and hasn't checkpointed yet.
    New,
    /// Matched a stable entry already cached in the volatile PKFile
    /// from an earlier seek to the same CFP bucket.
    Warm,
    /// Matched a stable entry that required a fresh seek into the
    /// on-disk MultiPKFile.
    Disk,
    Miss,
}

impl LookupStats {
    fn record(&self, p: HitProvenance) {
        let counter = match p {
            HitProvenance::New => &self.new_hits,
            HitProvenance::Warm => &self.warm_hits,
            HitProvenance::Disk => &self.disk_hits,
            HitProvenance::Miss => &self.all_misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Pipeline {
    /// Open (or create) every log at `config`'s paths with nothing
    /// replayed yet. Use [`Pipeline::recover`] to restore state from
    /// an existing installation.
    pub fn open(config: Config) -> Result<Self, CacheError> {
        config.ensure_directories()?;
        Ok(Pipeline {
            vmultipkfiles: RwLock::new(HashMap::new()),
            ci_allocator: Mutex::new(CiAllocator::new()),
            leases: LeaseSet::new(),
            weeder: Weeder::new(),
            cache_log: Mutex::new(AppendLog::open(&config.cache_log_path())?),
            graph_log: Mutex::new(AppendLog::open(&config.graph_log_path())?),
            empty_pk_log: Mutex::new(AppendLog::open(&config.empty_pk_log_path())?),
            ci_log: Mutex::new(AppendLog::open(&config.ci_log_path())?),
            graph_log_generation: AtomicU64::new(0),
            deletion_handle: Mutex::new(None),
            add_entry_disabled: std::sync::atomic::AtomicBool::new(false),
            lookup_stats: LookupStats::default(),
            config,
        })
    }

    /// Replay the cache log into a fresh `Pipeline`: every `AddEntry`
    /// durable since the last checkpoint goes back into the volatile
    /// store, and the CI allocator's counter advances past every CI
    /// the log mentions (§4.E "recovery replay"). The CI interval log
    /// is replayed afterward, re-applying any weeder-driven frees a
    /// prior process committed — the cache log alone only ever grows
    /// the live set. Leases are not restored — a restart changes this
    /// instance's fingerprint (H), so every client must reconnect and
    /// re-establish whatever it still needs leased anyway. Finally,
    /// stableVars is consulted: if a weed was in `Deleting` when the
    /// process died, the weeder FSM re-enters `Deleting` directly with
    /// its durable deletion target, rather than forcing the external
    /// weeder to re-run `StartMark` from scratch (§7 step 4).
    pub fn recover(config: Config) -> Result<Self, CacheError> {
        match config.stable_multipkfile_count() {
            Ok(n) => log::info!("recovering: {} MultiPKFile(s) on disk", n),
            Err(e) => log::warn!("couldn't count on-disk MultiPKFiles: {}", e),
        }
        let mut pipeline = Self::open(config)?;
        let records = AppendLog::replay(&pipeline.config.cache_log_path())?;
        {
            let mut alloc = pipeline.ci_allocator.lock().unwrap();
            for bytes in records {
                let record = match CacheLogRecord::decode(&bytes) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let prefix = PkPrefix::of(&record.pk);
                let vmp = pipeline.vmultipkfile_for(prefix);
                vmp.with_pkfile(record.pk, |vpkf| {
                    for n in &record.new_names {
                        vpkf.names.intern(&n.name, n.kind);
                    }
                    alloc.restore(record.entry.ci);
                    vpkf.add_entry(record.entry.clone());
                });
            }

            for bytes in AppendLog::replay(&pipeline.config.ci_log_path())? {
                let iv = match Intvl::read(&mut &bytes[..]) {
                    Ok(iv) => iv,
                    Err(_) => continue,
                };
                match iv {
                    Intvl::Add { lo, hi } => {
                        for ci in lo..=hi {
                            alloc.restore(ci);
                        }
                    }
                    Intvl::Remove { lo, hi } => {
                        let mut freed = BitVector::new();
                        freed.set_range(lo, hi);
                        alloc.free(&freed);
                    }
                }
            }
        }

        // The cache log replay above just reinstalled every record it
        // found as a fresh volatile `new` entry, including ones a
        // checkpoint before the crash had already merged into the
        // stable store (the crash landed between that merge and the
        // cache log's rotation). Discharge those now so the next
        // checkpoint doesn't merge them into the stable store a second
        // time (§7, §4.B).
        for rec in AppendLog::replay(&pipeline.config.empty_pk_log_path())? {
            let rec = match empty_pk_log::EmptyPkRecord::decode(&rec) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let prefix = PkPrefix::of(&rec.pk);
            let vmp = pipeline.vmultipkfile_for(prefix);
            vmp.with_pkfile(rec.pk, |vpkf| {
                vpkf.detach_new_entries();
            });
        }

        pipeline.recover_weeder_state()?;
        Ok(pipeline)
    }

    /// §7 step 4: read back stableVars's `deleting` flag; if set, the
    /// weeder FSM resumes in `Deleting` with its durable target instead
    /// of `Normal`, and the background sweep is re-forked immediately
    /// so a crash mid-delete doesn't leak CIs that were already marked
    /// dead.
    fn recover_weeder_state(&mut self) -> Result<(), CacheError> {
        if !self.config.deleting_flag_path().exists() {
            return Ok(());
        }
        let hit_filter = read_bitvector_file(&self.config.hit_filter_path())?.unwrap_or_default();
        let pending = read_bitvector_file(&self.config.pending_deletion_path())?.unwrap_or_default();
        let prefixes = read_prefixes_file(&self.config.mpks_to_weed_path())?;
        self.weeder = Weeder::recover_into_deleting(hit_filter, pending, prefixes);
        Ok(())
    }

    fn vmultipkfile_for(&self, prefix: PkPrefix) -> Arc<VMultiPkFile> {
        if let Some(v) = self.vmultipkfiles.read().unwrap().get(&prefix) {
            return Arc::clone(v);
        }
        let mut guard = self.vmultipkfiles.write().unwrap();
        Arc::clone(
            guard
                .entry(prefix)
                .or_insert_with(|| Arc::new(VMultiPkFile::new(prefix))),
        )
    }

    fn stable_path(&self, prefix: &PkPrefix) -> std::path::PathBuf {
        SMultiPkFile::path_for(&self.config.scache_dir, prefix)
    }

    /// Load the stable dictionary for `pk` into the volatile PKFile the
    /// first time it's touched this process, so `find`/`intern` see
    /// every name a prior checkpoint already knew about.
    fn ensure_dict_seeded(&self, vpkf: &mut crate::volatile::VPkFile, stable_path: &Path, pk: Fingerprint) {
        if !vpkf.names.is_empty() {
            return;
        }
        if let Ok(Some(spkf)) = SMultiPkFile::seek_to_pkfile(stable_path, pk) {
            vpkf.names = spkf.names;
        }
    }

    /// `FreeVariables`: the free-variable dictionary this PK's cached
    /// entries currently reference, so a client can align its own
    /// fingerprint vector to existing `NameId`s before calling
    /// `Lookup` (§4.I step 1). `is_empty` tells the evaluator there is
    /// no PKFile for this `pk` anywhere yet (neither an in-memory one
    /// nor a stable one), so it can skip straight to `AddEntry`.
    pub fn free_variables(&self, pk: Fingerprint) -> FreeVariables {
        let prefix = PkPrefix::of(&pk);
        let vmp = self.vmultipkfile_for(prefix);
        let stable_path = self.stable_path(&prefix);
        let known_before = vmp.known_pks().contains(&pk);

        vmp.with_pkfile(pk, |vpkf| {
            self.ensure_dict_seeded(vpkf, &stable_path, pk);
            let names = vpkf.names.iter().map(|e| (e.name.clone(), e.kind)).collect();
            let is_empty = !known_before && vpkf.names.is_empty();
            FreeVariables {
                names,
                epoch: vpkf.names.epoch(),
                is_empty,
            }
        })
    }

    fn build_query_vector(dict: &NameDict, query: &[FreeVar]) -> Vec<Fingerprint> {
        let mut v = vec![Fingerprint::ZERO; dict.len() as usize];
        for fv in query {
            if let Some(id) = dict.find(&fv.name) {
                v[id as usize] = fv.fp;
            }
        }
        v
    }

    /// `Lookup` (§4.I, §7). `cfp` is the client's own combined
    /// fingerprint over exactly the free variables the candidate call
    /// depends on; `query` carries the `(name, fp)` pairs needed to
    /// resolve a mismatch down to individual names.
    pub fn lookup(&self, pk: Fingerprint, cfp: Fingerprint, query: &[FreeVar]) -> LookupOutcome {
        if query.iter().any(|fv| fv.name.is_empty()) {
            return LookupOutcome::BadLookupArgs;
        }

        let hit_filter = self.weeder.hit_filter();
        let prefix = PkPrefix::of(&pk);
        let vmp = self.vmultipkfile_for(prefix);
        let stable_path = self.stable_path(&prefix);

        let outcome = vmp.with_pkfile(pk, |vpkf| {
            self.ensure_dict_seeded(vpkf, &stable_path, pk);
            let query_vec = Self::build_query_vector(&vpkf.names, query);
            Self::lookup_against(vpkf, &stable_path, pk, cfp, &query_vec, hit_filter.as_ref())
        });
        self.lookup_stats.record(outcome.1);
        outcome.0
    }

    /// The wire-level `Lookup(pk, epoch, fps)`: unlike [`Pipeline::lookup`],
    /// `fps` is positional — index `i` is the fingerprint of whatever
    /// `NameId` `i` was at the dictionary `epoch` the caller last fetched
    /// via `FreeVariables`. If the dictionary has since grown (interning
    /// a new name bumps its epoch), the positions the caller assumed no
    /// longer line up with the real `NameId`s, so a stale epoch is
    /// reported as [`LookupOutcome::FvMismatch`] rather than silently
    /// comparing against the wrong slots — the caller is expected to
    /// re-fetch `FreeVariables` and retry.
    pub fn lookup_by_epoch(
        &self,
        pk: Fingerprint,
        epoch: u64,
        fps: &[Fingerprint],
    ) -> LookupOutcome {
        let hit_filter = self.weeder.hit_filter();
        let prefix = PkPrefix::of(&pk);
        let vmp = self.vmultipkfile_for(prefix);
        let stable_path = self.stable_path(&prefix);

        let outcome = vmp.with_pkfile(pk, |vpkf| {
            self.ensure_dict_seeded(vpkf, &stable_path, pk);
            if vpkf.names.epoch() != epoch {
                return (LookupOutcome::FvMismatch, HitProvenance::Miss);
            }
            if fps.len() > vpkf.names.len() as usize {
                return (LookupOutcome::BadLookupArgs, HitProvenance::Miss);
            }
            let mut query_vec = vec![Fingerprint::ZERO; vpkf.names.len() as usize];
            query_vec[..fps.len()].copy_from_slice(fps);
            let cfp = Fingerprint::combine_list(fps);
            Self::lookup_against(vpkf, &stable_path, pk, cfp, &query_vec, hit_filter.as_ref())
        });
        self.lookup_stats.record(outcome.1);
        outcome.0
    }

    /// Per the original `CacheC.H`: "In the event of a cache miss,
    /// `Miss` is returned" — a CFP bucket that has candidates but none
    /// of them match the query is still a `Miss`, not `FvMismatch`.
    /// `FvMismatch` is reserved for a stale dictionary epoch
    /// ([`Pipeline::lookup_by_epoch`]), never for a failed value
    /// comparison within a correctly-addressed bucket.
    ///
    /// `hit_filter`, when the weeder is `Marking` or `Deleting`, is the
    /// set of CIs the mark phase has already decided to discard (I3:
    /// a CI stays excluded the moment `SetHitFilter` names it, not only
    /// once the background sweep has physically rewritten it out of
    /// the stable store).
    fn lookup_against(
        vpkf: &mut crate::volatile::VPkFile,
        stable_path: &Path,
        pk: Fingerprint,
        cfp: Fingerprint,
        query_vec: &[Fingerprint],
        hit_filter: Option<&BitVector>,
    ) -> (LookupOutcome, HitProvenance) {
        let is_filtered = |ci: Ci| hit_filter.map(|f| f.get(ci)).unwrap_or(false);

        for e in vpkf.new_entries_with_cfp(cfp) {
            if is_filtered(e.ci) {
                continue;
            }
            if e.matches(query_vec) {
                return (LookupOutcome::Hit(e.ci, e.value.clone()), HitProvenance::New);
            }
        }

        let from_cache = vpkf.cached_stable_entries(cfp).is_some();
        let stable_candidates: Vec<CacheEntry> = match vpkf.cached_stable_entries(cfp) {
            Some(cached) => cached.to_vec(),
            None => {
                let loaded = SMultiPkFile::seek_to_pkfile(stable_path, pk)
                    .ok()
                    .flatten()
                    .map(|spkf| spkf.entries_with_cfp(cfp).cloned().collect())
                    .unwrap_or_default();
                vpkf.cache_stable_entries(cfp, loaded.clone());
                loaded
            }
        };

        let stable_provenance = if from_cache {
            HitProvenance::Warm
        } else {
            HitProvenance::Disk
        };
        for e in &stable_candidates {
            if is_filtered(e.ci) {
                continue;
            }
            if e.matches(query_vec) {
                return (LookupOutcome::Hit(e.ci, e.value.clone()), stable_provenance);
            }
        }

        (LookupOutcome::Miss, HitProvenance::Miss)
    }

    /// `AddEntry` (§4.I, §7, I4). `fv` lists exactly the free
    /// variables this entry depends on, in the order `fps` supplies
    /// their values. Every CI in `kids` must currently be leased by
    /// the caller — an unleased kid could be reclaimed by the weeder
    /// between this call committing and the caller actually relying on
    /// the new entry.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &self,
        pk: Fingerprint,
        fv: &[FreeVar],
        value: Vec<u8>,
        model: Fingerprint,
        kids: Vec<Ci>,
        source_func: String,
    ) -> Result<AddEntryOutcome, CacheError> {
        if self.add_entry_disabled.load(Ordering::SeqCst) {
            return Err(CacheError::Other(anyhow::anyhow!(
                "AddEntry disabled after a fatal log-append failure"
            )));
        }
        if fv.iter().any(|f| f.name.is_empty()) {
            return Ok(AddEntryOutcome::BadAddEntryArgs);
        }
        if kids.iter().any(|&k| !self.leases.is_leased(k)) {
            return Ok(AddEntryOutcome::NoLease);
        }

        let prefix = PkPrefix::of(&pk);
        let vmp = self.vmultipkfile_for(prefix);
        let stable_path = self.stable_path(&prefix);

        let fps: Vec<Fingerprint> = fv.iter().map(|f| f.fp).collect();
        let cfp = Fingerprint::combine_list(&fps);

        let (ci, record) = {
            let mut alloc = self.ci_allocator.lock().unwrap();
            let ci = alloc.allocate();
            let interval_bytes = Intvl::Add { lo: ci, hi: ci }.to_bytes();
            if let Err(e) = self.ci_log.lock().unwrap().append(&interval_bytes) {
                self.add_entry_disabled.store(true, Ordering::SeqCst);
                return Err(CacheError::Io(e));
            }

            let (entry, new_names) = vmp.with_pkfile(pk, |vpkf| {
                self.ensure_dict_seeded(vpkf, &stable_path, pk);

                let mut new_names = Vec::new();
                let assoc: Vec<(u32, u32)> = fv
                    .iter()
                    .enumerate()
                    .map(|(pos, f)| {
                        let (id, inserted) = vpkf.names.intern(&f.name, f.kind);
                        if inserted {
                            new_names.push(NewName {
                                name: f.name.clone(),
                                kind: f.kind,
                            });
                        }
                        (id, pos as u32)
                    })
                    .collect();

                let imap = IMap::build(assoc, vpkf.names.len());
                let entry = CacheEntry {
                    ci,
                    cfp,
                    imap,
                    fps: fps.clone(),
                    value: value.clone(),
                    model,
                    kids: kids.clone(),
                    source_func: source_func.clone(),
                };
                vpkf.add_entry(entry.clone());
                (entry, new_names)
            });

            let record = CacheLogRecord {
                pk,
                new_names,
                entry,
            };
            (ci, record)
        };

        let bytes = record.encode()?;
        if let Err(e) = self.cache_log.lock().unwrap().append(&bytes) {
            self.add_entry_disabled.store(true, Ordering::SeqCst);
            return Err(CacheError::Io(e));
        }

        let graph_bytes = GraphLogRecord::Node { ci, kids }.encode()?;
        if let Err(e) = self.graph_log.lock().unwrap().append(&graph_bytes) {
            self.add_entry_disabled.store(true, Ordering::SeqCst);
            return Err(CacheError::Io(e));
        }

        // I2: both the cache log and the CI interval log are durable
        // (fsynced, above) before the lease is taken and the reply is
        // built.
        self.leases.new_lease(ci);

        Ok(AddEntryOutcome::EntryAdded(ci))
    }

    /// `Checkpoint(pkgVersion, model, cis, done)`: flush every
    /// PKFile's `new_entries` into the stable store, record `cis` as
    /// this build's root set if `done` (§4.B "Root: (pkgVersion, model,
    /// cis[], done, ts). Written on Checkpoint to mark the CIs the
    /// evaluator considers roots of a (possibly partial) build"), then
    /// rotate the logs the checkpoint now subsumes (§9
    /// "flush-detach-under-mutex").
    ///
    /// A partial build (`done == false`) still gets its entries
    /// flushed to the stable store — that part of durability doesn't
    /// depend on the build finishing — but its CIs aren't recorded as
    /// roots yet, since a partial build's root set isn't final.
    ///
    /// The graph log is deliberately not rotated here — the weeder's
    /// mark phase needs the full dependency history back to the last
    /// time *it* ran a checkpoint, which can span several cache
    /// checkpoints, so graph log rotation is the weeder's own
    /// responsibility once a deletion pass completes.
    pub fn checkpoint(&self, roots: &[Ci], done: bool) -> Result<CheckpointOutcome, CacheError> {
        if roots.iter().any(|&ci| !self.leases.is_leased(ci)) {
            return Ok(CheckpointOutcome::NoLease);
        }

        if done {
            let mut graph_log = self.graph_log.lock().unwrap();
            for &ci in roots {
                let bytes = GraphLogRecord::Root { ci }.encode()?;
                graph_log.append(&bytes)?;
            }
        }

        let groups: Vec<(PkPrefix, Arc<VMultiPkFile>)> = self
            .vmultipkfiles
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();

        for (prefix, vmp) in groups {
            let detached = vmp.detach_all_new_entries();
            if detached.is_empty() {
                continue;
            }
            let path = self.stable_path(&prefix);
            let mut existing = SMultiPkFile::read_all(&path)?;

            // Record each flushed PK (and its dictionary epoch at flush
            // time) before the cache log gets rotated below, so a crash
            // between this stable write and that rotation still leaves
            // recovery a durable way to tell these entries are already
            // accounted for (§4.B, §7).
            let mut empty_pk_log = self.empty_pk_log.lock().unwrap();
            for (pk, new_entries) in detached {
                let epoch = vmp.with_pkfile(pk, |vpkf| vpkf.names.epoch());
                match existing.iter_mut().find(|s| s.pk == pk) {
                    Some(spkf) => {
                        vmp.with_pkfile(pk, |vpkf| spkf.names = vpkf.names.clone());
                        spkf.entries.extend(new_entries);
                    }
                    None => {
                        let mut spkf = SPkFile::new(pk);
                        vmp.with_pkfile(pk, |vpkf| spkf.names = vpkf.names.clone());
                        spkf.entries = new_entries;
                        existing.push(spkf);
                    }
                }
                vmp.invalidate_stable_cache(pk);
                let bytes = empty_pk_log::EmptyPkRecord { pk, epoch }.encode()?;
                empty_pk_log.append(&bytes)?;
            }
            drop(empty_pk_log);

            SMultiPkFile::write(&path, &existing)?;
        }

        self.cache_log.lock().unwrap().rotate()?;
        // Once the cache log is rotated, a restart has nothing left to
        // replay for the PKs just flushed, so the emptied-PK records
        // guarding against that window aren't needed past this point.
        self.empty_pk_log.lock().unwrap().rotate()?;
        Ok(CheckpointOutcome::Done)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `GetCacheId`: a fingerprint identifying this cache's *dataset*,
    /// stable across restarts unlike the instance fingerprint (H) —
    /// derived from the stable store's own path, since two servers
    /// pointed at the same `sCache_dir` are the same cache no matter
    /// how many times either has restarted.
    pub fn cache_id(&self) -> Fingerprint {
        Fingerprint::of_bytes(self.config.scache_dir.to_string_lossy().as_bytes())
    }

    // -- Weeder coordination (§4.F) -----------------------------------

    /// `RenewLeases`: renew every CI in `cis`, reporting whether every
    /// one of them actually held (or now holds) a lease.
    pub fn renew_leases(&self, cis: &[Ci]) -> bool {
        let mut all_ok = true;
        for &ci in cis {
            if !self.leases.is_leased(ci) {
                all_ok = false;
            }
            self.leases.renew_lease(ci);
        }
        all_ok
    }

    /// `WeederRecovering(doneMarking)`: is a weed already in flight? If
    /// so the caller must refuse to start a new one (§4.F "Any ->
    /// WeederRecovering... If another weed is already running reply
    /// true and refuse").
    pub fn weeder_recovering(&self) -> bool {
        self.weeder.state() != WeederState::Normal
    }

    /// `StartMark`: freezes lease expiration, checkpoints (rotates)
    /// the graph log, and returns the new generation number plus the
    /// live-CI root set.
    pub fn start_mark(&self) -> Result<(BitVector, u64), CacheError> {
        self.weeder
            .start_mark(&self.leases)
            .map_err(|e| CacheError::Other(e.into()))?;
        self.graph_log.lock().unwrap().rotate()?;
        let gen = self.graph_log_generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((self.leases.leased(), gen))
    }

    pub fn get_leases(&self) -> Result<BitVector, CacheError> {
        self.weeder
            .get_leases(&self.leases)
            .map_err(|e| CacheError::Other(e.into()))
    }

    pub fn resume_lease_exp(&self) -> Result<(), CacheError> {
        self.weeder
            .resume_lease_exp(&self.leases)
            .map_err(|e| CacheError::Other(e.into()))
    }

    pub fn set_hit_filter(&self, cis: BitVector) -> Result<(), CacheError> {
        self.weeder
            .set_hit_filter(cis)
            .map_err(|e| CacheError::Other(e.into()))
    }

    /// `EndMark(cis, pfxs)`: persists the deletion target to
    /// stableVars, transitions `Marking -> Deleting`, allocates a
    /// graph-log checkpoint generation, and forks the background
    /// deletion worker. Returns the checkpoint generation number the
    /// reply carries.
    pub fn end_mark(self: &Arc<Self>, cis: BitVector, pfxs: Vec<PkPrefix>) -> Result<u64, CacheError> {
        self.weeder
            .end_mark(cis.clone(), pfxs.clone())
            .map_err(|e| CacheError::Other(e.into()))?;

        let hit_filter = self.weeder.hit_filter().unwrap_or_default();
        write_bytes_atomic(&self.config.deleting_flag_path(), b"1")?;
        write_bitvector_file(&self.config.hit_filter_path(), &hit_filter)?;
        write_bitvector_file(&self.config.pending_deletion_path(), &cis)?;
        write_prefixes_file(&self.config.mpks_to_weed_path(), &pfxs)?;

        let chkpt_ver = self.graph_log_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let pipeline = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            if let Err(e) = pipeline.run_deletion_sweep() {
                log::error!(target: "cache::weeder", "deletion sweep failed: {:#}", e);
            }
        });
        *self.deletion_handle.lock().unwrap() = Some(handle);

        Ok(chkpt_ver)
    }

    /// The background worker `EndMark` forks: rewrite every pending
    /// MultiPKFile without the dead CIs, freeing each one from the CI
    /// allocator as its containing file is rewritten.
    fn run_deletion_sweep(&self) -> Result<(), CacheError> {
        let dead = self.weeder.pending_deletion().unwrap_or_default();
        let prefixes = self.weeder.pending_prefixes();
        log::info!(
            target: "cache::weeder",
            "deletion sweep starting over {} MultiPKFile(s), {} CIs targeted",
            prefixes.len(),
            dead.cardinality()
        );
        for prefix in prefixes {
            self.sweep_one_prefix(prefix, &dead)?;
        }
        log::info!(target: "cache::weeder", "deletion sweep complete");
        Ok(())
    }

    /// Rewrite one MultiPKFile, dropping every entry whose CI is in
    /// `dead` (I5: write-temp-then-rename), free the CIs that were
    /// actually present, and invalidate any volatile stable-entry
    /// cache a concurrent `Lookup` may have seeded for the PKs
    /// touched.
    fn sweep_one_prefix(&self, prefix: PkPrefix, dead: &BitVector) -> Result<(), CacheError> {
        let path = self.stable_path(&prefix);
        let mut pkfiles = SMultiPkFile::read_all(&path)?;
        let mut freed = BitVector::new();
        for spkf in pkfiles.iter_mut() {
            spkf.entries.retain(|e| {
                if dead.get(e.ci) {
                    freed.set(e.ci);
                    false
                } else {
                    true
                }
            });
        }
        pkfiles.retain(|s| !s.is_empty());
        SMultiPkFile::write(&path, &pkfiles)?;

        if !freed.is_empty() {
            let mut alloc = self.ci_allocator.lock().unwrap();
            alloc.free(&freed);
            drop(alloc);
            for lo in freed.iter() {
                let bytes = Intvl::Remove { lo, hi: lo }.to_bytes();
                self.ci_log.lock().unwrap().append(&bytes)?;
            }
        }

        if let Some(vmp) = self.vmultipkfiles.read().unwrap().get(&prefix) {
            for pk in vmp.known_pks() {
                vmp.invalidate_stable_cache(pk);
            }
        }
        Ok(())
    }

    /// `CommitChkpt(name)`: block until the background sweep finishes,
    /// rename the weeder-written graph-log checkpoint into place,
    /// clear stableVars, and transition `Deleting -> Normal`.
    pub fn commit_chkpt(&self, name: &str) -> Result<bool, CacheError> {
        if self.weeder.state() != WeederState::Deleting {
            return Ok(false);
        }
        if let Some(handle) = self.deletion_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        let src = self.config.graph_log_checkpoint_path(name);
        if src.exists() {
            let dest = self.config.graph_log_path().with_extension("ckp");
            std::fs::rename(&src, &dest)?;
        }

        self.weeder
            .commit_chkpt()
            .map_err(|e| CacheError::Other(e.into()))?;

        for p in [
            self.config.deleting_flag_path(),
            self.config.hit_filter_path(),
            self.config.pending_deletion_path(),
            self.config.mpks_to_weed_path(),
        ] {
            let _ = std::fs::remove_file(p);
        }
        Ok(true)
    }

    /// `GetCacheState`: a snapshot of the counters an operator or
    /// diagnostic CLI would want.
    pub fn state_snapshot(&self) -> CacheStateSnapshot {
        let alloc = self.ci_allocator.lock().unwrap();
        CacheStateSnapshot {
            next_ci: alloc.next_ci(),
            live_cis: alloc.live_set().cardinality(),
            leased_cis: self.leases.leased().cardinality(),
            weeder_state: self.weeder.state(),
            new_hits: self.lookup_stats.new_hits.load(Ordering::Relaxed),
            warm_hits: self.lookup_stats.warm_hits.load(Ordering::Relaxed),
            disk_hits: self.lookup_stats.disk_hits.load(Ordering::Relaxed),
            all_misses: self.lookup_stats.all_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStateSnapshot {
    pub next_ci: Ci,
    pub live_cis: u64,
    pub leased_cis: u64,
    pub weeder_state: WeederState,
    /// Lookups satisfied from this process's own not-yet-checkpointed
    /// entries.
    pub new_hits: u64,
    /// Lookups satisfied from a stable PKFile already cached in memory
    /// from an earlier seek.
    pub warm_hits: u64,
    /// Lookups that required a fresh on-disk seek into a MultiPKFile.
    pub disk_hits: u64,
    /// Lookups (or lookup-shaped errors) that matched nothing.
    pub all_misses: u64,
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp-write");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn write_bitvector_file(path: &Path, bv: &BitVector) -> std::io::Result<()> {
    let mut buf = Vec::new();
    bv.write(&mut buf)?;
    write_bytes_atomic(path, &buf)
}

fn read_bitvector_file(path: &Path) -> std::io::Result<Option<BitVector>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(BitVector::read(&mut &bytes[..])?))
}

fn write_prefixes_file(path: &Path, prefixes: &[PkPrefix]) -> std::io::Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(prefixes.len() as u32).to_be_bytes());
    for p in prefixes {
        buf.extend_from_slice(&p.raw().to_be_bytes());
    }
    write_bytes_atomic(path, &buf)
}

fn read_prefixes_file(path: &Path) -> std::io::Result<Vec<PkPrefix>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Ok(Vec::new());
    }
    let count = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    let mut off = 4;
    for _ in 0..count {
        if off + 8 > bytes.len() {
            break;
        }
        let raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        out.push(PkPrefix::from_raw(raw));
        off += 8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n, 0)
    }

    fn test_pipeline() -> (Pipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::defaults_under(dir.path());
        (Pipeline::open(config).unwrap(), dir)
    }

    #[test]
    fn add_then_lookup_round_trips_through_volatile_store() {
        let (pipeline, _dir) = test_pipeline();
        let pk = fp(1);
        let fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(100),
        }];

        let outcome = pipeline
            .add_entry(pk, &fv, b"result".to_vec(), fp(9), vec![], "build".into())
            .unwrap();
        let ci = match outcome {
            AddEntryOutcome::EntryAdded(ci) => ci,
            other => panic!("expected EntryAdded, got {:?}", other),
        };

        let cfp = Fingerprint::combine_list(&[fp(100)]);
        match pipeline.lookup(pk, cfp, &fv) {
            LookupOutcome::Hit(hit_ci, value) => {
                assert_eq!(hit_ci, ci);
                assert_eq!(value, b"result");
            }
            other => panic!("expected Hit, got {:?}", other),
        }
    }

    #[test]
    fn lookup_with_wrong_value_is_a_miss_not_fv_mismatch() {
        let (pipeline, _dir) = test_pipeline();
        let pk = fp(2);
        let fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(5),
        }];
        pipeline
            .add_entry(pk, &fv, b"v".to_vec(), fp(0), vec![], "f".into())
            .unwrap();

        let wrong_fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(999),
        }];
        let cfp = Fingerprint::combine_list(&[fp(999)]);
        match pipeline.lookup(pk, cfp, &wrong_fv) {
            LookupOutcome::Miss => (),
            other => panic!("expected Miss (different cfp bucket), got {:?}", other),
        }
    }

    #[test]
    fn lookup_same_cfp_bucket_wrong_value_is_a_miss() {
        // Two entries under the same PK that happen to collide on CFP
        // (same combined fingerprint, different per-name values) must
        // not turn a failed comparison into FvMismatch.
        let (pipeline, _dir) = test_pipeline();
        let pk = fp(20);
        let fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(100),
        }];
        pipeline
            .add_entry(pk, &fv, b"stored".to_vec(), fp(0), vec![], "f".into())
            .unwrap();

        let same_bucket_different_value = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(101),
        }];
        // Pass the *stored* entry's cfp so the CFP bucket lookup finds
        // it as a candidate, but supply a query vector that doesn't
        // match its fps — must fall through to Miss, not FvMismatch.
        let cfp = Fingerprint::combine_list(&[fp(100)]);
        match pipeline.lookup(pk, cfp, &same_bucket_different_value) {
            LookupOutcome::Miss => (),
            other => panic!("expected Miss, got {:?}", other),
        }
    }

    #[test]
    fn state_snapshot_classifies_hits_by_provenance() {
        let (pipeline, _dir) = test_pipeline();
        let pk = fp(30);
        let fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(100),
        }];
        pipeline
            .add_entry(pk, &fv, b"v".to_vec(), fp(0), vec![], "f".into())
            .unwrap();
        let cfp = Fingerprint::combine_list(&[fp(100)]);

        // Not yet checkpointed: a hit comes from the "new" list.
        assert!(matches!(pipeline.lookup(pk, cfp, &fv), LookupOutcome::Hit(..)));
        let snap = pipeline.state_snapshot();
        assert_eq!(snap.new_hits, 1);
        assert_eq!(snap.warm_hits, 0);
        assert_eq!(snap.disk_hits, 0);

        // A query that misses entirely still counts.
        let miss_fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(999),
        }];
        let miss_cfp = Fingerprint::combine_list(&[fp(999)]);
        assert!(matches!(pipeline.lookup(pk, miss_cfp, &miss_fv), LookupOutcome::Miss));
        let snap = pipeline.state_snapshot();
        assert_eq!(snap.all_misses, 1);
    }

    #[test]
    fn add_entry_rejects_unleased_kids() {
        let (pipeline, _dir) = test_pipeline();
        let pk = fp(3);
        let fv = vec![];
        let outcome = pipeline
            .add_entry(pk, &fv, b"v".to_vec(), fp(0), vec![999], "f".into())
            .unwrap();
        assert!(matches!(outcome, AddEntryOutcome::NoLease));
    }

    #[test]
    fn checkpoint_moves_entries_into_stable_store_and_survives_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::defaults_under(dir.path());
        let pipeline = Pipeline::open(config.clone()).unwrap();

        let pk = fp(4);
        let fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(1),
        }];
        pipeline
            .add_entry(pk, &fv, b"stable-value".to_vec(), fp(0), vec![], "f".into())
            .unwrap();
        pipeline.checkpoint(&[], true).unwrap();

        let recovered = Pipeline::recover(config).unwrap();
        let cfp = Fingerprint::combine_list(&[fp(1)]);
        match recovered.lookup(pk, cfp, &fv) {
            LookupOutcome::Hit(_, value) => assert_eq!(value, b"stable-value"),
            other => panic!("expected Hit after checkpoint+recovery, got {:?}", other),
        }
    }

    #[test]
    fn second_checkpoint_refreshes_stable_dictionary_after_dict_growth() {
        // Two checkpoints against the same PK, with a new free variable
        // interned between them. The second checkpoint's entry must
        // stay reachable after a restart, which means the stable
        // dictionary it was merged into has to carry the grown name
        // list, not the one-name snapshot the first checkpoint wrote.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::defaults_under(dir.path());
        let pipeline = Pipeline::open(config.clone()).unwrap();

        let pk = fp(8);
        let fv1 = vec![FreeVar {
            name: "x".into(),
            kind: 0,
            fp: fp(1),
        }];
        pipeline
            .add_entry(pk, &fv1, b"v1".to_vec(), fp(0), vec![], "f".into())
            .unwrap();
        pipeline.checkpoint(&[], true).unwrap();

        let fv2 = vec![
            FreeVar {
                name: "x".into(),
                kind: 0,
                fp: fp(1),
            },
            FreeVar {
                name: "y".into(),
                kind: 0,
                fp: fp(2),
            },
        ];
        pipeline
            .add_entry(pk, &fv2, b"v2".to_vec(), fp(0), vec![], "f".into())
            .unwrap();
        pipeline.checkpoint(&[], true).unwrap();

        let recovered = Pipeline::recover(config).unwrap();
        let cfp2 = Fingerprint::combine_list(&[fp(1), fp(2)]);
        match recovered.lookup(pk, cfp2, &fv2) {
            LookupOutcome::Hit(_, value) => assert_eq!(value, b"v2"),
            other => panic!(
                "expected Hit for the second checkpoint's entry after recovery, got {:?}",
                other
            ),
        }
    }

    #[test]
    fn recovery_discharges_entries_a_checkpoint_already_flushed_pre_crash() {
        // Simulates a crash landing between a checkpoint's stable-store
        // write and its cache log rotation: the cache log still has the
        // AddEntry record, but the emptied-PK log already has the
        // discharge record the checkpoint wrote first. Recovery must
        // not let the stale cache log record duplicate the entry that's
        // already durably in the stable store.
        let dir = tempfile::tempdir().unwrap();
        let config = Config::defaults_under(dir.path());
        let pipeline = Pipeline::open(config.clone()).unwrap();

        let pk = fp(7);
        let fv = vec![FreeVar {
            name: "CC".into(),
            kind: 0,
            fp: fp(1),
        }];
        pipeline
            .add_entry(pk, &fv, b"v".to_vec(), fp(0), vec![], "f".into())
            .unwrap();
        pipeline.checkpoint(&[], true).unwrap();

        // Re-append the same AddEntry record to the (freshly rotated,
        // now empty) cache log, and the matching discharge record to
        // the (also freshly rotated) emptied-PK log, reproducing the
        // on-disk state a crash in that window would have left behind.
        let stale_record = {
            let prefix = PkPrefix::of(&pk);
            let stable_path = SMultiPkFile::path_for(&config.scache_dir, &prefix);
            let spkf = SMultiPkFile::seek_to_pkfile(&stable_path, pk).unwrap().unwrap();
            CacheLogRecord {
                pk,
                new_names: vec![],
                entry: spkf.entries[0].clone(),
            }
        };
        {
            let mut cache_log = AppendLog::open(&config.cache_log_path()).unwrap();
            cache_log.append(&stale_record.encode().unwrap()).unwrap();
            let mut epk_log = AppendLog::open(&config.empty_pk_log_path()).unwrap();
            epk_log
                .append(&empty_pk_log::EmptyPkRecord { pk, epoch: 1 }.encode().unwrap())
                .unwrap();
        }

        let recovered = Pipeline::recover(config).unwrap();
        recovered.checkpoint(&[], true).unwrap();

        let prefix = PkPrefix::of(&pk);
        let stable_path = SMultiPkFile::path_for(&recovered.config.scache_dir, &prefix);
        let spkf = SMultiPkFile::seek_to_pkfile(&stable_path, pk).unwrap().unwrap();
        assert_eq!(
            spkf.entries.len(),
            1,
            "discharged entry must not be re-merged into the stable store"
        );
    }

    #[test]
    fn stale_epoch_is_fv_mismatch_not_miss() {
        let (pipeline, _dir) = test_pipeline();
        let pk = fp(40);
        let fv = vec![FreeVar {
            name: "x".into(),
            kind: 0,
            fp: fp(1),
        }];
        pipeline
            .add_entry(pk, &fv, b"v1".to_vec(), fp(0), vec![], "f".into())
            .unwrap();
        let epoch_after_first = pipeline.free_variables(pk).epoch;

        // Growing the name dictionary bumps the epoch a second time.
        let fv2 = vec![
            FreeVar {
                name: "x".into(),
                kind: 0,
                fp: fp(1),
            },
            FreeVar {
                name: "y".into(),
                kind: 0,
                fp: fp(2),
            },
        ];
        pipeline
            .add_entry(pk, &fv2, b"v2".to_vec(), fp(0), vec![], "f".into())
            .unwrap();

        // A client still holding the pre-growth epoch must be told to
        // refetch, not served a (possibly wrong) answer.
        match pipeline.lookup_by_epoch(pk, epoch_after_first, &[fp(1)]) {
            LookupOutcome::FvMismatch => (),
            other => panic!("expected FvMismatch, got {:?}", other),
        }

        let current_epoch = pipeline.free_variables(pk).epoch;
        assert!(current_epoch > epoch_after_first);
        match pipeline.lookup_by_epoch(pk, current_epoch, &[fp(1), fp(2)]) {
            LookupOutcome::Hit(_, value) => assert_eq!(value, b"v2"),
            other => panic!("expected Hit at the current epoch, got {:?}", other),
        }
    }

    #[test]
    fn weed_removes_targeted_ci_end_to_end() {
        let (pipeline, _dir) = test_pipeline();
        let pipeline = Arc::new(pipeline);
        let pk = fp(50);
        let fv = vec![FreeVar {
            name: "x".into(),
            kind: 0,
            fp: fp(1),
        }];
        let ci = match pipeline
            .add_entry(pk, &fv, b"v".to_vec(), fp(0), vec![], "f".into())
            .unwrap()
        {
            AddEntryOutcome::EntryAdded(ci) => ci,
            other => panic!("expected EntryAdded, got {:?}", other),
        };
        // Must be in the stable store for the sweep to find and drop it.
        pipeline.checkpoint(&[], true).unwrap();

        let (live_set, _gen) = pipeline.start_mark().unwrap();
        assert!(live_set.get(ci));
        pipeline.resume_lease_exp().unwrap();
        // The external weeder found nothing reachable: hit filter is empty.
        pipeline.set_hit_filter(BitVector::new()).unwrap();

        let mut dead = BitVector::new();
        dead.set(ci);
        pipeline.end_mark(dead, vec![PkPrefix::of(&pk)]).unwrap();
        assert!(pipeline.commit_chkpt("test-checkpoint").unwrap());

        let cfp = Fingerprint::combine_list(&[fp(1)]);
        match pipeline.lookup(pk, cfp, &fv) {
            LookupOutcome::Miss => (),
            other => panic!("expected Miss after weed, got {:?}", other),
        }
    }

    #[test]
    fn lookup_excludes_hit_filtered_ci_before_sweep_completes() {
        let (pipeline, _dir) = test_pipeline();
        let pipeline = Arc::new(pipeline);
        let pk = fp(51);
        let fv = vec![FreeVar {
            name: "x".into(),
            kind: 0,
            fp: fp(1),
        }];
        let ci = match pipeline
            .add_entry(pk, &fv, b"v".to_vec(), fp(0), vec![], "f".into())
            .unwrap()
        {
            AddEntryOutcome::EntryAdded(ci) => ci,
            other => panic!("expected EntryAdded, got {:?}", other),
        };
        let cfp = Fingerprint::combine_list(&[fp(1)]);

        // Still reachable before the weeder has decided anything.
        assert!(matches!(pipeline.lookup(pk, cfp, &fv), LookupOutcome::Hit(..)));

        pipeline.start_mark().unwrap();
        pipeline.resume_lease_exp().unwrap();

        let mut dead = BitVector::new();
        dead.set(ci);
        // SetHitFilter alone (still Marking, no EndMark/CommitChkpt yet)
        // must already hide `ci` — I3 takes effect the moment the hit
        // filter names it, not once the sweep has rewritten it away.
        pipeline.set_hit_filter(dead.clone()).unwrap();
        match pipeline.lookup(pk, cfp, &fv) {
            LookupOutcome::Miss => (),
            other => panic!("expected Miss once hit-filtered, got {:?}", other),
        }

        // EndMark (-> Deleting) forks the background sweep, but a Lookup
        // racing ahead of it (or arriving after it finishes, before
        // CommitChkpt clears the hit filter) must still see a Miss.
        pipeline.end_mark(dead, vec![PkPrefix::of(&pk)]).unwrap();
        match pipeline.lookup(pk, cfp, &fv) {
            LookupOutcome::Miss => (),
            other => panic!("expected Miss mid-sweep, got {:?}", other),
        }

        assert!(pipeline.commit_chkpt("test-checkpoint").unwrap());
    }

    #[test]
    fn checkpoint_rejects_unleased_roots() {
        let (pipeline, _dir) = test_pipeline();
        match pipeline.checkpoint(&[999], false).unwrap() {
            CheckpointOutcome::NoLease => (),
            other => panic!("expected NoLease, got {:?}", other),
        }
    }
}
