//! Cache entries and the free-variable index map (§3, §4.C).
//!
//! A [`CacheEntry`] is the unit the cache stores and matches on
//! `Lookup`. Its free-variable names live once per PKFile (see
//! [`crate::store::names`]); an entry only carries the mapping from
//! that shared dictionary to its own fingerprint-vector positions, the
//! [`IMap`].

use std::io::{self, Read, Write};

use crate::fingerprint::Fingerprint;

/// Cache-entry index: dense, 32-bit, never reused (I1).
pub type Ci = u32;

/// Per-PKFile free-variable name identifier (position in the union
/// dictionary).
pub type NameId = u32;

/// Graph-log model identifier (the parent evaluation file). Opaque
/// beyond equality/fingerprint semantics, so it's just a fingerprint.
pub type ModelId = Fingerprint;

/// The map from a PKFile's shared name dictionary to one entry's own
/// position within its `fps` vector.
///
/// `Identity` means the entry references every name in the dictionary,
/// in the dictionary's own order — the common case, and the one §3
/// says entries "omit the map" for. `Explicit` is the general case: a
/// sparse or reordered subset, stored as `(name_id, fps_index)` pairs.
///
/// On disk the pairs are packed as 16-bit ints when every value fits,
/// falling back to 32-bit otherwise (§4.C, §9 "IMap dual width"); a
/// one-byte discriminator in front means a single reader path handles
/// both without probing ahead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IMap {
    Identity,
    Explicit(Vec<(NameId, u32)>),
}

const IMAP_TAG_IDENTITY: u8 = 0;
const IMAP_TAG_NARROW: u8 = 1; // 16-bit pairs
const IMAP_TAG_WIDE: u8 = 2; // 32-bit pairs

impl IMap {
    /// Build the map an entry needs given the full dictionary's current
    /// length and the entry's own `(name_id, fps_index)` associations in
    /// fps order. Returns `Identity` when `assoc` is exactly
    /// `(0,0), (1,1), ..., (dict_len-1, dict_len-1)`.
    pub fn build(assoc: Vec<(NameId, u32)>, dict_len: u32) -> IMap {
        let is_identity = assoc.len() as u32 == dict_len
            && assoc
                .iter()
                .enumerate()
                .all(|(i, &(name, pos))| name as usize == i && pos as usize == i);
        if is_identity {
            IMap::Identity
        } else {
            IMap::Explicit(assoc)
        }
    }

    /// Resolve the fps-vector position for a dictionary name, if this
    /// entry references it at all.
    pub fn position_of(&self, name: NameId) -> Option<u32> {
        match self {
            IMap::Identity => Some(name),
            IMap::Explicit(pairs) => pairs
                .iter()
                .find(|&&(n, _)| n == name)
                .map(|&(_, pos)| pos),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            IMap::Identity => w.write_all(&[IMAP_TAG_IDENTITY]),
            IMap::Explicit(pairs) => {
                let wide = pairs
                    .iter()
                    .any(|&(a, b)| a > u16::MAX as u32 || b > u16::MAX as u32);
                w.write_all(&[if wide { IMAP_TAG_WIDE } else { IMAP_TAG_NARROW }])?;
                w.write_all(&(pairs.len() as u32).to_be_bytes())?;
                for &(a, b) in pairs {
                    if wide {
                        w.write_all(&a.to_be_bytes())?;
                        w.write_all(&b.to_be_bytes())?;
                    } else {
                        w.write_all(&(a as u16).to_be_bytes())?;
                        w.write_all(&(b as u16).to_be_bytes())?;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<IMap> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        match tag[0] {
            IMAP_TAG_IDENTITY => Ok(IMap::Identity),
            IMAP_TAG_NARROW => {
                let len = read_u32(r)?;
                let mut pairs = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    let a = read_u16(r)? as u32;
                    let b = read_u16(r)? as u32;
                    pairs.push((a, b));
                }
                Ok(IMap::Explicit(pairs))
            }
            IMAP_TAG_WIDE => {
                let len = read_u32(r)?;
                let mut pairs = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    let a = read_u32(r)?;
                    let b = read_u32(r)?;
                    pairs.push((a, b));
                }
                Ok(IMap::Explicit(pairs))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown IMap tag {}", other),
            )),
        }
    }
}

fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// A stored cache entry (§3 "Cache entry"). `pk` is not stored inline —
/// it's implied by the PKFile the entry lives in — except in the cache
/// log, where each record must stand alone (§4.B); see
/// [`crate::log::cache_log::CacheLogRecord`].
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub ci: Ci,
    pub cfp: Fingerprint,
    pub imap: IMap,
    pub fps: Vec<Fingerprint>,
    pub value: Vec<u8>,
    pub model: ModelId,
    pub kids: Vec<Ci>,
    pub source_func: String,
}

impl CacheEntry {
    /// Does this entry's fingerprint vector equal `query`, under this
    /// entry's IMap restricted to the names the caller actually
    /// supplied? (I3, §4.I step 3: "only the names `e` actually
    /// references are compared.")
    ///
    /// `query` is indexed by dictionary `NameId` (the caller's fps are
    /// aligned to the current dictionary order by the pipeline before
    /// this is called).
    pub fn matches(&self, query: &[Fingerprint]) -> bool {
        match &self.imap {
            IMap::Identity => self.fps.as_slice() == query,
            IMap::Explicit(pairs) => pairs.iter().all(|&(name, pos)| {
                query
                    .get(name as usize)
                    .zip(self.fps.get(pos as usize))
                    .map(|(a, b)| a == b)
                    .unwrap_or(false)
            }),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.ci.to_be_bytes())?;
        self.imap.write(w)?;
        w.write_all(&(self.fps.len() as u32).to_be_bytes())?;
        for fp in &self.fps {
            fp.write_to(w)?;
        }
        w.write_all(&(self.value.len() as u32).to_be_bytes())?;
        w.write_all(&self.value)?;
        self.model.write_to(w)?;
        w.write_all(&(self.kids.len() as u32).to_be_bytes())?;
        for kid in &self.kids {
            w.write_all(&kid.to_be_bytes())?;
        }
        let src = self.source_func.as_bytes();
        w.write_all(&(src.len() as u32).to_be_bytes())?;
        w.write_all(src)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<CacheEntry> {
        let ci = read_u32(r)?;
        let imap = IMap::read(r)?;
        let fps_len = read_u32(r)?;
        let mut fps = Vec::with_capacity(fps_len as usize);
        for _ in 0..fps_len {
            fps.push(Fingerprint::read_from(r)?);
        }
        let value_len = read_u32(r)?;
        let mut value = vec![0u8; value_len as usize];
        r.read_exact(&mut value)?;
        let model = Fingerprint::read_from(r)?;
        let kids_len = read_u32(r)?;
        let mut kids = Vec::with_capacity(kids_len as usize);
        for _ in 0..kids_len {
            kids.push(read_u32(r)?);
        }
        let src_len = read_u32(r)?;
        let mut src_buf = vec![0u8; src_len as usize];
        r.read_exact(&mut src_buf)?;
        let source_func = String::from_utf8(src_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let cfp = Fingerprint::combine_list(&fps);

        Ok(CacheEntry {
            ci,
            cfp,
            imap,
            fps,
            value,
            model,
            kids,
            source_func,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::new(n, 0)
    }

    #[test]
    fn identity_imap_matches_whole_vector() {
        let e = CacheEntry {
            ci: 1,
            cfp: Fingerprint::combine_list(&[fp(1), fp(2)]),
            imap: IMap::Identity,
            fps: vec![fp(1), fp(2)],
            value: b"v".to_vec(),
            model: Fingerprint::ZERO,
            kids: vec![],
            source_func: "f".into(),
        };
        assert!(e.matches(&[fp(1), fp(2)]));
        assert!(!e.matches(&[fp(1), fp(3)]));
    }

    #[test]
    fn explicit_imap_only_compares_referenced_names() {
        // entry only references dictionary name 0, stored at fps[0]
        let e = CacheEntry {
            ci: 2,
            cfp: Fingerprint::combine_list(&[fp(7)]),
            imap: IMap::Explicit(vec![(0, 0)]),
            fps: vec![fp(7)],
            value: b"v".to_vec(),
            model: Fingerprint::ZERO,
            kids: vec![],
            source_func: "f".into(),
        };
        // query has two names; only name 0 is checked
        assert!(e.matches(&[fp(7), fp(999)]));
        assert!(!e.matches(&[fp(6), fp(999)]));
    }

    #[test]
    fn imap_build_detects_identity() {
        let identity = IMap::build(vec![(0, 0), (1, 1), (2, 2)], 3);
        assert_eq!(identity, IMap::Identity);

        let subset = IMap::build(vec![(0, 0), (2, 1)], 3);
        assert_eq!(subset, IMap::Explicit(vec![(0, 0), (2, 1)]));
    }

    #[test]
    fn imap_width_transition_at_65535_to_65536() {
        let narrow = IMap::Explicit(vec![(0, 65535)]);
        let mut buf = Vec::new();
        narrow.write(&mut buf).unwrap();
        assert_eq!(buf[0], IMAP_TAG_NARROW);
        let back = IMap::read(&mut &buf[..]).unwrap();
        assert_eq!(narrow, back);

        let wide = IMap::Explicit(vec![(0, 65536)]);
        let mut buf2 = Vec::new();
        wide.write(&mut buf2).unwrap();
        assert_eq!(buf2[0], IMAP_TAG_WIDE);
        let back2 = IMap::read(&mut &buf2[..]).unwrap();
        assert_eq!(wide, back2);
    }

    #[test]
    fn entry_encode_decode_round_trips_each_imap_kind() {
        for imap in [
            IMap::Identity,
            IMap::Explicit(vec![(0, 0)]),
            IMap::Explicit(vec![(0, 70000)]),
        ] {
            let e = CacheEntry {
                ci: 42,
                cfp: Fingerprint::combine_list(&[fp(1)]),
                imap,
                fps: vec![fp(1)],
                value: b"payload".to_vec(),
                model: fp(9),
                kids: vec![1, 2, 3],
                source_func: "pkg/Foo.src".into(),
            };
            let mut buf = Vec::new();
            e.write(&mut buf).unwrap();
            let back = CacheEntry::read(&mut &buf[..]).unwrap();
            assert_eq!(e.ci, back.ci);
            assert_eq!(e.imap, back.imap);
            assert_eq!(e.fps, back.fps);
            assert_eq!(e.value, back.value);
            assert_eq!(e.model, back.model);
            assert_eq!(e.kids, back.kids);
            assert_eq!(e.source_func, back.source_func);
        }
    }

    #[test]
    fn empty_name_list_entry_round_trips() {
        let e = CacheEntry {
            ci: 5,
            cfp: Fingerprint::combine_list(&[]),
            imap: IMap::Identity,
            fps: vec![],
            value: b"v".to_vec(),
            model: Fingerprint::ZERO,
            kids: vec![],
            source_func: "".into(),
        };
        assert!(e.matches(&[]));
        let mut buf = Vec::new();
        e.write(&mut buf).unwrap();
        let back = CacheEntry::read(&mut &buf[..]).unwrap();
        assert_eq!(back.fps.len(), 0);
    }
}
