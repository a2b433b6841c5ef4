//! Cache log: the write-ahead record of every committed `AddEntry`
//! (§4.B).
//!
//! Each record stands on its own — unlike the on-disk entry format,
//! which relies on a PKFile-wide name dictionary, a cache log record
//! carries its PK and any dictionary names the entry introduced inline,
//! so replay never needs to consult the stable store to make sense of
//! a record.

use std::io::{self, Read, Write};

use crate::entry::CacheEntry;
use crate::fingerprint::Fingerprint;

/// A name newly introduced to a PKFile's free-variable dictionary by
/// this `AddEntry` (§4.C: "the name dictionary... a one-byte type per
/// name").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewName {
    pub name: String,
    pub kind: u8,
}

#[derive(Clone, Debug)]
pub struct CacheLogRecord {
    pub pk: Fingerprint,
    pub new_names: Vec<NewName>,
    pub entry: CacheEntry,
}

impl CacheLogRecord {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.pk.write_to(&mut buf)?;
        buf.write_all(&(self.new_names.len() as u32).to_be_bytes())?;
        for n in &self.new_names {
            let bytes = n.name.as_bytes();
            buf.write_all(&(bytes.len() as u32).to_be_bytes())?;
            buf.write_all(bytes)?;
            buf.write_all(&[n.kind])?;
        }
        self.entry.write(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<CacheLogRecord> {
        let mut r = bytes;
        let pk = Fingerprint::read_from(&mut r)?;
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let count = u32::from_be_bytes(len_buf);
        let mut new_names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut nlen_buf = [0u8; 4];
            r.read_exact(&mut nlen_buf)?;
            let nlen = u32::from_be_bytes(nlen_buf) as usize;
            let mut name_buf = vec![0u8; nlen];
            r.read_exact(&mut name_buf)?;
            let name = String::from_utf8(name_buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut kind_buf = [0u8; 1];
            r.read_exact(&mut kind_buf)?;
            new_names.push(NewName {
                name,
                kind: kind_buf[0],
            });
        }
        let entry = CacheEntry::read(&mut r)?;
        Ok(CacheLogRecord {
            pk,
            new_names,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::IMap;

    #[test]
    fn record_round_trips_through_bytes() {
        let rec = CacheLogRecord {
            pk: Fingerprint::new(1, 2),
            new_names: vec![NewName {
                name: "CC".into(),
                kind: 1,
            }],
            entry: CacheEntry {
                ci: 7,
                cfp: Fingerprint::combine_list(&[]),
                imap: IMap::Identity,
                fps: vec![],
                value: b"ok".to_vec(),
                model: Fingerprint::ZERO,
                kids: vec![],
                source_func: "build".into(),
            },
        };
        let bytes = rec.encode().unwrap();
        let back = CacheLogRecord::decode(&bytes).unwrap();
        assert_eq!(back.pk, rec.pk);
        assert_eq!(back.new_names, rec.new_names);
        assert_eq!(back.entry.ci, rec.entry.ci);
        assert_eq!(back.entry.value, rec.entry.value);
    }
}
