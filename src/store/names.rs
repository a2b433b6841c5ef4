//! The free-variable name dictionary shared by every entry in one
//! PKFile (§4.C, §4.I).
//!
//! Storing names once per PKFile instead of once per entry is the
//! entire reason [`crate::entry::IMap`] exists. `NameDict` is the
//! structure both the volatile and stable PKFile representations build
//! their `IMap`s against; its `epoch` increments on every append so a
//! caller holding a cached `(name -> NameId)` lookup from a previous
//! epoch knows to rebuild it rather than serve a stale index (the
//! "epoch-guarded free-variable name dictionary" of §9).

use std::io::{self, Read, Write};

use crate::entry::NameId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameEntry {
    pub name: String,
    pub kind: u8,
}

/// Free-variable names in dictionary order, plus an epoch that bumps
/// on every append.
#[derive(Clone, Debug, Default)]
pub struct NameDict {
    entries: Vec<NameEntry>,
    epoch: u64,
}

impl NameDict {
    pub fn new() -> Self {
        NameDict {
            entries: Vec::new(),
            epoch: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn get(&self, id: NameId) -> Option<&NameEntry> {
        self.entries.get(id as usize)
    }

    pub fn find(&self, name: &str) -> Option<NameId> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as NameId)
    }

    /// Look up `name`, inserting it at the end of the dictionary (and
    /// bumping the epoch) if it isn't already present. Returns the
    /// resulting id and whether it was newly inserted, so the caller
    /// can decide whether to emit a [`crate::log::cache_log::NewName`].
    pub fn intern(&mut self, name: &str, kind: u8) -> (NameId, bool) {
        if let Some(id) = self.find(name) {
            return (id, false);
        }
        self.entries.push(NameEntry {
            name: name.to_string(),
            kind,
        });
        self.epoch += 1;
        ((self.entries.len() - 1) as NameId, true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NameEntry> {
        self.entries.iter()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.entries.len() as u32).to_be_bytes())?;
        for e in &self.entries {
            let bytes = e.name.as_bytes();
            w.write_all(&(bytes.len() as u32).to_be_bytes())?;
            w.write_all(bytes)?;
            w.write_all(&[e.kind])?;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let n = u32::from_be_bytes(len_buf);
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let mut nlen_buf = [0u8; 4];
            r.read_exact(&mut nlen_buf)?;
            let nlen = u32::from_be_bytes(nlen_buf) as usize;
            let mut name_buf = vec![0u8; nlen];
            r.read_exact(&mut name_buf)?;
            let name = String::from_utf8(name_buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut kind_buf = [0u8; 1];
            r.read_exact(&mut kind_buf)?;
            entries.push(NameEntry {
                name,
                kind: kind_buf[0],
            });
        }
        Ok(NameDict { entries, epoch: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_reuses_existing_names_without_bumping_epoch() {
        let mut dict = NameDict::new();
        let (id_a, inserted_a) = dict.intern("CC", 1);
        assert!(inserted_a);
        assert_eq!(dict.epoch(), 1);

        let (id_a_again, inserted_again) = dict.intern("CC", 1);
        assert_eq!(id_a, id_a_again);
        assert!(!inserted_again);
        assert_eq!(dict.epoch(), 1);

        let (id_b, inserted_b) = dict.intern("CFLAGS", 1);
        assert!(inserted_b);
        assert_ne!(id_a, id_b);
        assert_eq!(dict.epoch(), 2);
    }

    #[test]
    fn write_read_round_trips() {
        let mut dict = NameDict::new();
        dict.intern("a", 0);
        dict.intern("b", 1);
        let mut buf = Vec::new();
        dict.write(&mut buf).unwrap();
        let back = NameDict::read(&mut &buf[..]).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(0).unwrap().name, "a");
        assert_eq!(back.get(1).unwrap().kind, 1);
    }
}
