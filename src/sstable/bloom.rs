//! Fixed-size bloom filter attached to every SSTable.
//!
//! The bit array has [`NUM_BITS`] bits and every key sets [`NUM_HASHES`]
//! of them. Bit positions are derived from a single 32-bit string hash
//! (`h = 31 * h + unit` over the key's UTF-16 code units, wrapping), salted
//! per function as `h + i * len(key)` and reduced modulo the array size.
//! The filter is rebuilt from file content on every open and never persisted.

/// Size of the bit array.
pub const NUM_BITS: usize = 224_668;

/// Number of bit positions derived per key.
pub const NUM_HASHES: usize = 10;

/// Polynomial 32-bit string hash over UTF-16 code units.
pub(crate) fn string_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Bit positions probed for `key`, one per hash function.
pub(crate) fn positions(key: &str) -> impl Iterator<Item = usize> {
    let hash = i64::from(string_hash(key));
    let len = key.encode_utf16().count() as i64;
    let modulus = NUM_BITS as i64;
    (0..NUM_HASHES as i64).map(move |i| ((hash + i * len) % modulus).unsigned_abs() as usize)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilter {
    pub fn new() -> Self {
        Self {
            words: vec![0; NUM_BITS.div_ceil(64)],
        }
    }

    pub fn add(&mut self, key: &str) {
        for bit in positions(key) {
            self.words[bit / 64] |= 1 << (bit % 64);
        }
    }

    /// `false` means the key was certainly never added.
    pub fn might_contain(&self, key: &str) -> bool {
        positions(key).all(|bit| self.words[bit / 64] & (1 << (bit % 64)) != 0)
    }

    /// Number of bits currently set.
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}
