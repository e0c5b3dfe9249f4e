//! Probabilistic touched-object set
//!
//! [`ConflictFilter`] is a fixed-size Bloom filter over [`ObjectId`]s. Each
//! transaction keeps one for its reads and one for its writes so that a
//! committer can cheaply rule out "these two footprints cannot overlap"
//! before walking the precise sets.
//!
//! # Contract
//!
//! - `insert` is idempotent
//! - `exists` never returns a false negative
//! - `exists` may return false positives; they only cause spurious aborts
//! - `intersects` returns true whenever the two filters share an inserted id

use crate::types::ObjectId;

/// Number of 64-bit words in a filter
const WORDS: usize = 64;

/// Total number of bits
const BITS: u64 = (WORDS as u64) * 64;

/// Probes per id
const PROBES: u64 = 3;

/// Fixed-size Bloom filter over object ids
#[derive(Clone, PartialEq, Eq)]
pub struct ConflictFilter {
    words: [u64; WORDS],
    inserted: usize,
}

/// SplitMix64 finalizer, spreads sequential ids across the bit space
#[inline]
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Bit positions probed for `id` (double hashing)
#[inline]
fn probes(id: ObjectId) -> impl Iterator<Item = u64> {
    let h1 = mix(id.as_u64());
    let h2 = mix(h1) | 1;
    (0..PROBES).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % BITS)
}

impl ConflictFilter {
    /// Create an empty filter
    pub const fn new() -> Self {
        Self {
            words: [0; WORDS],
            inserted: 0,
        }
    }

    /// Capacity in bits
    pub const fn bit_capacity() -> u64 {
        BITS
    }

    /// Record that `id` was touched
    pub fn insert(&mut self, id: ObjectId) {
        let mut fresh = false;
        for bit in probes(id) {
            let (word, mask) = ((bit / 64) as usize, 1u64 << (bit % 64));
            if self.words[word] & mask == 0 {
                fresh = true;
                self.words[word] |= mask;
            }
        }
        if fresh {
            self.inserted += 1;
        }
    }

    /// Whether `id` may have been inserted
    pub fn exists(&self, id: ObjectId) -> bool {
        probes(id).all(|bit| self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }

    /// Reset to empty
    pub fn clear(&mut self) {
        if self.inserted != 0 {
            self.words = [0; WORDS];
            self.inserted = 0;
        }
    }

    /// Whether the two filters could share a touched id
    pub fn intersects(&self, other: &ConflictFilter) -> bool {
        if self.inserted == 0 || other.inserted == 0 {
            return false;
        }
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Whether nothing has been inserted since the last clear
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// Approximate number of distinct ids inserted
    ///
    /// Undercounts when an id's probes all collide with earlier insertions.
    #[inline]
    pub fn approx_len(&self) -> usize {
        self.inserted
    }

    /// Fraction of bits set, a proxy for the false-positive rate
    pub fn saturation(&self) -> f64 {
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        set as f64 / BITS as f64
    }
}

impl Default for ConflictFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConflictFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictFilter")
            .field("inserted", &self.inserted)
            .field("saturation", &self.saturation())
            .finish()
    }
}
