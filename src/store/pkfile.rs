//! The stable, on-disk PKFile and MultiPKFile formats (§3, §4.C, I5).
//!
//! Related PKs (same [`PkPrefix`]) share one on-disk *MultiPKFile*: a
//! sorted `pk -> (offset, length)` header table followed by the
//! concatenated bytes of each PKFile's own blob. A reader wanting one
//! PK's entries — the common `Lookup` path — binary-searches the
//! header, then seeks directly to that PKFile's span (`SeekToPKFile`
//! in the original, kept as the method name here) instead of decoding
//! the whole MultiPKFile.
//!
//! Each PKFile blob is itself: the PK, the free-variable name
//! dictionary entries share (see [`crate::store::names`]), a
//! `cfp -> local offset` index sorted by combined fingerprint so
//! `Lookup` only has to decode entries whose CFP actually matches, and
//! finally the entries themselves back-to-back.
//!
//! MultiPKFiles are replaced wholesale at checkpoint time via
//! write-temp-then-rename (I5) — there is no in-place mutation of a
//! stable file.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::entry::CacheEntry;
use crate::fingerprint::Fingerprint;
use crate::pkprefix::PkPrefix;
use crate::store::names::NameDict;

const PKFILE_MAGIC: &[u8; 4] = b"VCP1";
const MULTI_MAGIC: &[u8; 4] = b"VCM1";

/// One PK's worth of cache entries, plus the dictionary they share.
#[derive(Clone, Debug, Default)]
pub struct SPkFile {
    pub pk: Fingerprint,
    pub names: NameDict,
    pub entries: Vec<CacheEntry>,
}

impl SPkFile {
    pub fn new(pk: Fingerprint) -> Self {
        SPkFile {
            pk,
            names: NameDict::new(),
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize this PKFile to its self-contained blob form: header,
    /// name dictionary, cfp index, then the entries. The cfp index is
    /// sorted so a reader can binary-search it directly.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut entry_blobs = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            let mut buf = Vec::new();
            e.write(&mut buf)?;
            entry_blobs.push(buf);
        }

        let mut offsets = Vec::with_capacity(entry_blobs.len());
        let mut running = 0u64;
        for blob in &entry_blobs {
            offsets.push(running);
            running += blob.len() as u64;
        }

        let mut index: Vec<(Fingerprint, u64)> = self
            .entries
            .iter()
            .zip(offsets.iter())
            .map(|(e, &off)| (e.cfp, off))
            .collect();
        index.sort_by(cfp_order);

        let mut out = Vec::new();
        out.write_all(PKFILE_MAGIC)?;
        self.pk.write_to(&mut out)?;
        self.names.write(&mut out)?;

        out.write_all(&(index.len() as u32).to_be_bytes())?;
        for (cfp, off) in &index {
            cfp.write_to(&mut out)?;
            out.write_all(&off.to_be_bytes())?;
        }

        let entries_len: u64 = entry_blobs.iter().map(|b| b.len() as u64).sum();
        out.write_all(&entries_len.to_be_bytes())?;
        out.write_all(&(entry_blobs.len() as u32).to_be_bytes())?;
        for blob in &entry_blobs {
            out.write_all(blob)?;
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut r = bytes;
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != PKFILE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad PKFile magic"));
        }
        let pk = Fingerprint::read_from(&mut r)?;
        let names = NameDict::read(&mut r)?;

        let mut idx_len_buf = [0u8; 4];
        r.read_exact(&mut idx_len_buf)?;
        let idx_len = u32::from_be_bytes(idx_len_buf);
        for _ in 0..idx_len {
            let _ = Fingerprint::read_from(&mut r)?;
            let mut off_buf = [0u8; 8];
            r.read_exact(&mut off_buf)?;
        }

        let mut entries_len_buf = [0u8; 8];
        r.read_exact(&mut entries_len_buf)?;
        let _entries_len = u64::from_be_bytes(entries_len_buf);

        let mut count_buf = [0u8; 4];
        r.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(CacheEntry::read(&mut r)?);
        }

        Ok(SPkFile { pk, names, entries })
    }

    /// Entries whose combined fingerprint is `cfp` (§4.I: "the CFP
    /// narrows the search; the IMap-filtered comparison decides it").
    pub fn entries_with_cfp(&self, cfp: Fingerprint) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter().filter(move |e| e.cfp == cfp)
    }
}

fn cfp_order(a: &(Fingerprint, u64), b: &(Fingerprint, u64)) -> std::cmp::Ordering {
    (a.0.word1(), a.0.word0()).cmp(&(b.0.word1(), b.0.word0()))
}

/// Header entry: one PK's span within a MultiPKFile.
#[derive(Clone, Copy, Debug)]
struct PkTableEntry {
    pk: Fingerprint,
    offset: u64,
    length: u64,
}

/// A group of PKFiles sharing a [`PkPrefix`], stored as one physical
/// file.
pub struct SMultiPkFile;

impl SMultiPkFile {
    /// Atomically write a full set of PKFiles to `path` (write-temp,
    /// fsync, rename — I5). `pkfiles` need not be pre-sorted.
    pub fn write(path: &Path, pkfiles: &[SPkFile]) -> io::Result<()> {
        let mut sorted: Vec<&SPkFile> = pkfiles.iter().collect();
        sorted.sort_by(|a, b| (a.pk.word1(), a.pk.word0()).cmp(&(b.pk.word1(), b.pk.word0())));

        let mut blobs = Vec::with_capacity(sorted.len());
        for pkf in &sorted {
            blobs.push(pkf.encode()?);
        }

        let mut table = Vec::with_capacity(blobs.len());
        let mut running = 0u64;
        for (pkf, blob) in sorted.iter().zip(blobs.iter()) {
            table.push(PkTableEntry {
                pk: pkf.pk,
                offset: running,
                length: blob.len() as u64,
            });
            running += blob.len() as u64;
        }

        let tmp = path.with_extension("tmp-write");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(MULTI_MAGIC)?;
            f.write_all(&(table.len() as u32).to_be_bytes())?;
            for e in &table {
                e.pk.write_to(&mut f)?;
                f.write_all(&e.offset.to_be_bytes())?;
                f.write_all(&e.length.to_be_bytes())?;
            }
            for blob in &blobs {
                f.write_all(blob)?;
            }
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_table(f: &mut File) -> io::Result<Vec<PkTableEntry>> {
        f.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        f.read_exact(&mut magic)?;
        if &magic != MULTI_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad MultiPKFile magic"));
        }
        let mut count_buf = [0u8; 4];
        f.read_exact(&mut count_buf)?;
        let count = u32::from_be_bytes(count_buf);
        let mut table = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let pk = Fingerprint::read_from(f)?;
            let mut off_buf = [0u8; 8];
            f.read_exact(&mut off_buf)?;
            let mut len_buf = [0u8; 8];
            f.read_exact(&mut len_buf)?;
            table.push(PkTableEntry {
                pk,
                offset: u64::from_be_bytes(off_buf),
                length: u64::from_be_bytes(len_buf),
            });
        }
        Ok(table)
    }

    fn body_start(table_len: usize) -> u64 {
        4 + 4 + (table_len as u64) * (16 + 8 + 8)
    }

    /// Read every PKFile whose prefix matches `prefix` — used by
    /// recovery and by the weeder's sweep, which both want the whole
    /// group.
    pub fn read_all(path: &Path) -> io::Result<Vec<SPkFile>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut f = File::open(path)?;
        let table = Self::read_table(&mut f)?;
        let start = Self::body_start(table.len());
        let mut out = Vec::with_capacity(table.len());
        for e in &table {
            f.seek(SeekFrom::Start(start + e.offset))?;
            let mut buf = vec![0u8; e.length as usize];
            f.read_exact(&mut buf)?;
            out.push(SPkFile::decode(&buf)?);
        }
        Ok(out)
    }

    /// Read just one PK's PKFile by seeking directly to its span,
    /// without decoding any sibling PKFile in the group
    /// (`SeekToPKFile`).
    pub fn seek_to_pkfile(path: &Path, pk: Fingerprint) -> io::Result<Option<SPkFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut f = File::open(path)?;
        let table = Self::read_table(&mut f)?;
        let key = (pk.word1(), pk.word0());
        let found = table
            .binary_search_by(|e| (e.pk.word1(), e.pk.word0()).cmp(&key))
            .ok()
            .map(|i| table[i]);
        let Some(e) = found else { return Ok(None) };
        let start = Self::body_start(table.len());
        f.seek(SeekFrom::Start(start + e.offset))?;
        let mut buf = vec![0u8; e.length as usize];
        f.read_exact(&mut buf)?;
        Ok(Some(SPkFile::decode(&buf)?))
    }

    /// All PKs present in the group, without decoding any PKFile body.
    pub fn list_pks(path: &Path) -> io::Result<Vec<Fingerprint>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut f = File::open(path)?;
        Ok(Self::read_table(&mut f)?.into_iter().map(|e| e.pk).collect())
    }

    /// Directory + filename this prefix group lives at, rooted at
    /// `sCache_dir`.
    pub fn path_for(scache_dir: &Path, prefix: &PkPrefix) -> std::path::PathBuf {
        let mut p = scache_dir.to_path_buf();
        p.push(format!("gran-{}", crate::pkprefix::GRANULARITY));
        for arc in prefix.path_arcs(crate::pkprefix::GRANULARITY) {
            p.push(arc);
        }
        p.push("multi");
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::IMap;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n, 0)
    }

    fn sample_entry(ci: u32, fps: Vec<Fingerprint>) -> CacheEntry {
        CacheEntry {
            ci,
            cfp: Fingerprint::combine_list(&fps),
            imap: IMap::Identity,
            fps,
            value: b"value".to_vec(),
            model: Fingerprint::ZERO,
            kids: vec![],
            source_func: "f".into(),
        }
    }

    #[test]
    fn pkfile_round_trips_entries_and_dictionary() {
        let mut pkf = SPkFile::new(fp(1));
        pkf.names.intern("CC", 1);
        pkf.entries.push(sample_entry(1, vec![fp(10)]));
        pkf.entries.push(sample_entry(2, vec![fp(11)]));

        let bytes = pkf.encode().unwrap();
        let back = SPkFile::decode(&bytes).unwrap();
        assert_eq!(back.pk, pkf.pk);
        assert_eq!(back.entries.len(), 2);
        assert_eq!(back.names.get(0).unwrap().name, "CC");
    }

    #[test]
    fn multipkfile_seek_finds_one_pk_without_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi");

        let mut a = SPkFile::new(fp(1));
        a.entries.push(sample_entry(1, vec![fp(100)]));
        let mut b = SPkFile::new(fp(2));
        b.entries.push(sample_entry(2, vec![fp(200)]));

        SMultiPkFile::write(&path, &[a, b]).unwrap();

        let got = SMultiPkFile::seek_to_pkfile(&path, fp(2)).unwrap().unwrap();
        assert_eq!(got.pk, fp(2));
        assert_eq!(got.entries[0].ci, 2);

        let missing = SMultiPkFile::seek_to_pkfile(&path, fp(3)).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn multipkfile_read_all_recovers_every_group_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi");
        let a = SPkFile::new(fp(5));
        let b = SPkFile::new(fp(6));
        SMultiPkFile::write(&path, &[a, b]).unwrap();

        let all = SMultiPkFile::read_all(&path).unwrap();
        assert_eq!(all.len(), 2);
    }
}
