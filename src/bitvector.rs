//! Dense bit vectors over cache-entry indices (§4.A).
//!
//! CIs are densely allocated 32-bit integers, so a `Vec<u64>` of words
//! is a far better fit than a hash set: the lease set, the hit filter,
//! and the CI allocator's free map are all bit vectors, and
//! intersecting any two of them costs one word-at-a-time pass.

use std::io::{self, Read, Write};

/// A bit vector that grows on demand to the highest index ever set.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
}

const BITS: usize = 64;

impl BitVector {
    pub fn new() -> Self {
        BitVector { words: Vec::new() }
    }

    fn word_index(i: u32) -> usize {
        (i as usize) / BITS
    }

    fn bit_mask(i: u32) -> u64 {
        1u64 << ((i as usize) % BITS)
    }

    fn ensure_word(&mut self, idx: usize) {
        if idx >= self.words.len() {
            self.words.resize(idx + 1, 0);
        }
    }

    /// Set bit `i`. Grows the vector if `i` is past the current end.
    pub fn set(&mut self, i: u32) {
        let idx = Self::word_index(i);
        self.ensure_word(idx);
        self.words[idx] |= Self::bit_mask(i);
    }

    /// Clear bit `i`. A no-op if `i` is past the current end.
    pub fn reset(&mut self, i: u32) {
        let idx = Self::word_index(i);
        if idx < self.words.len() {
            self.words[idx] &= !Self::bit_mask(i);
        }
    }

    /// Read bit `i`. Bits past the current end read as unset.
    pub fn get(&self, i: u32) -> bool {
        let idx = Self::word_index(i);
        idx < self.words.len() && (self.words[idx] & Self::bit_mask(i)) != 0
    }

    pub fn reset_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
    }

    /// Number of set bits.
    pub fn cardinality(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Set `[lo, hi]` inclusive.
    pub fn set_range(&mut self, lo: u32, hi: u32) {
        for i in lo..=hi {
            self.set(i);
        }
    }

    /// Clear `[lo, hi]` inclusive.
    pub fn reset_range(&mut self, lo: u32, hi: u32) {
        for i in lo..=hi {
            self.reset(i);
        }
    }

    pub fn union_with(&mut self, other: &BitVector) {
        self.ensure_word(other.words.len().saturating_sub(1));
        for (i, w) in other.words.iter().enumerate() {
            self.words[i] |= w;
        }
    }

    pub fn union(a: &BitVector, b: &BitVector) -> BitVector {
        let mut out = a.clone();
        out.union_with(b);
        out
    }

    pub fn intersection(a: &BitVector, b: &BitVector) -> BitVector {
        let n = a.words.len().min(b.words.len());
        let words = (0..n).map(|i| a.words[i] & b.words[i]).collect();
        BitVector { words }
    }

    /// `a` minus `b` (bits in `a` not in `b`).
    pub fn difference(a: &BitVector, b: &BitVector) -> BitVector {
        let mut words = a.words.clone();
        for i in 0..words.len().min(b.words.len()) {
            words[i] &= !b.words[i];
        }
        BitVector { words }
    }

    pub fn contains_any(&self, other: &BitVector) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Iterate the indices of set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..BITS).filter_map(move |bit| {
                if w & (1u64 << bit) != 0 {
                    Some((wi * BITS + bit) as u32)
                } else {
                    None
                }
            })
        })
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    pub fn from_iter<I: IntoIterator<Item = u32>>(it: I) -> Self {
        let mut bv = BitVector::new();
        for i in it {
            bv.set(i);
        }
        bv
    }

    /// Highest word index actually touched (nonzero), so `write` only
    /// stores the run of words that matter instead of the whole
    /// allocation.
    fn highest_nonzero_word(&self) -> usize {
        self.words
            .iter()
            .rposition(|&w| w != 0)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Serialize: word count, then the words themselves, big-endian.
    /// Only the run of words up to the last nonzero one is written.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let n = self.highest_nonzero_word();
        w.write_all(&(n as u32).to_be_bytes())?;
        for word in &self.words[..n] {
            w.write_all(&word.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let n = u32::from_be_bytes(len_buf) as usize;
        let mut words = Vec::with_capacity(n);
        let mut buf = [0u8; 8];
        for _ in 0..n {
            r.read_exact(&mut buf)?;
            words.push(u64::from_be_bytes(buf));
        }
        Ok(BitVector { words })
    }
}

impl std::fmt::Debug for BitVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BitVector{:?}", self.to_vec())
    }
}

/// An add-or-remove delta over a contiguous index range, the unit of
/// record in the CI allocator's interval log (§4.A, §9: "implement the
/// allocator as an ever-growing counter plus an interval log that
/// encodes add range / remove range deltas").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intvl {
    Add { lo: u32, hi: u32 },
    Remove { lo: u32, hi: u32 },
}

impl Intvl {
    pub fn apply(&self, bv: &mut BitVector) {
        match *self {
            Intvl::Add { lo, hi } => bv.set_range(lo, hi),
            Intvl::Remove { lo, hi } => bv.reset_range(lo, hi),
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let (tag, lo, hi) = match *self {
            Intvl::Add { lo, hi } => (0u8, lo, hi),
            Intvl::Remove { lo, hi } => (1u8, lo, hi),
        };
        w.write_all(&[tag])?;
        w.write_all(&lo.to_be_bytes())?;
        w.write_all(&hi.to_be_bytes())?;
        Ok(())
    }

    /// Convenience wrapper around [`Intvl::write`] for callers (the CI
    /// interval log) that just want the encoded bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf).expect("writing to a Vec cannot fail");
        buf
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        let mut lo_buf = [0u8; 4];
        let mut hi_buf = [0u8; 4];
        r.read_exact(&mut lo_buf)?;
        r.read_exact(&mut hi_buf)?;
        let lo = u32::from_be_bytes(lo_buf);
        let hi = u32::from_be_bytes(hi_buf);
        match tag[0] {
            0 => Ok(Intvl::Add { lo, hi }),
            1 => Ok(Intvl::Remove { lo, hi }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown Intvl tag {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reset_read_grow_on_demand() {
        let mut bv = BitVector::new();
        assert!(!bv.get(500));
        bv.set(500);
        assert!(bv.get(500));
        assert_eq!(bv.cardinality(), 1);
        bv.reset(500);
        assert!(!bv.get(500));
    }

    #[test]
    fn union_intersection_difference() {
        let a = BitVector::from_iter(vec![1, 2, 3]);
        let b = BitVector::from_iter(vec![2, 3, 4]);
        assert_eq!(BitVector::union(&a, &b).to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(BitVector::intersection(&a, &b).to_vec(), vec![2, 3]);
        assert_eq!(BitVector::difference(&a, &b).to_vec(), vec![1]);
    }

    #[test]
    fn write_read_is_identity() {
        let bv = BitVector::from_iter(vec![0, 5, 63, 64, 1000]);
        let mut buf = Vec::new();
        bv.write(&mut buf).unwrap();
        let back = BitVector::read(&mut &buf[..]).unwrap();
        assert_eq!(bv, back);
    }

    #[test]
    fn empty_vector_round_trips() {
        let bv = BitVector::new();
        let mut buf = Vec::new();
        bv.write(&mut buf).unwrap();
        let back = BitVector::read(&mut &buf[..]).unwrap();
        assert_eq!(bv, back);
        assert!(back.is_empty());
    }

    #[test]
    fn intvl_add_remove_round_trip_and_apply() {
        let add = Intvl::Add { lo: 10, hi: 20 };
        let mut buf = Vec::new();
        add.write(&mut buf).unwrap();
        let back = Intvl::read(&mut &buf[..]).unwrap();
        assert_eq!(add, back);

        let mut bv = BitVector::new();
        add.apply(&mut bv);
        assert_eq!(bv.cardinality(), 11);

        let remove = Intvl::Remove { lo: 15, hi: 20 };
        remove.apply(&mut bv);
        assert_eq!(bv.cardinality(), 5);
    }
}
