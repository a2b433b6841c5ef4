//! Emptied-PK log: PKs whose volatile `new` list a checkpoint just
//! flushed into the stable store (§4.B, §7).
//!
//! A `Checkpoint` merges a VPKFile's `new_entries` into the stable
//! MultiPKFile, then rotates the cache log — but those are two separate
//! durable writes, and a crash between them leaves the (not yet
//! rotated) cache log still claiming those entries are only volatile.
//! Recovery always replays the whole cache log first, reinstalling
//! every record it finds as a fresh volatile "new" entry, including
//! ones a pre-crash checkpoint had already flushed; replaying this log
//! *afterward* lets it discard exactly those, instead of double-merging
//! them into the stable store at the next checkpoint (§7 "Replay the
//! emptied-PK log afterwards to discharge entries that had already been
//! flushed pre-crash").
//!
//! Each record carries the post-flush epoch as well as the PK (§4.B),
//! so a reader could in principle tell *which* flush it belongs to; the
//! recovery algorithm here doesn't need that distinction (it trusts any
//! record present at all), but kept it for wire fidelity.

use std::io;

use crate::fingerprint::Fingerprint;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmptyPkRecord {
    pub pk: Fingerprint,
    pub epoch: u64,
}

impl EmptyPkRecord {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.pk.write_to(&mut buf)?;
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<EmptyPkRecord> {
        let mut r = bytes;
        let pk = Fingerprint::read_from(&mut r)?;
        let mut epoch_buf = [0u8; 8];
        std::io::Read::read_exact(&mut r, &mut epoch_buf)?;
        Ok(EmptyPkRecord {
            pk,
            epoch: u64::from_be_bytes(epoch_buf),
        })
    }
}

/// Read back every PK (and the epoch it was flushed at) emptied since
/// the last rotation of this log.
pub fn replay(path: &std::path::Path) -> io::Result<Vec<EmptyPkRecord>> {
    crate::log::AppendLog::replay(path)?
        .into_iter()
        .map(|bytes| EmptyPkRecord::decode(&bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips() {
        let rec = EmptyPkRecord {
            pk: Fingerprint::new(42, 0),
            epoch: 3,
        };
        let bytes = rec.encode().unwrap();
        let back = EmptyPkRecord::decode(&bytes).unwrap();
        assert_eq!(rec, back);
    }
}
