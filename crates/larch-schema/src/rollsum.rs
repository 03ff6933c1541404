//! Rolling checksum for content-defined chunking.
//!
//! The bup/librsync-style sum over a sliding 64-byte window. A split
//! point occurs when the low [`BLOB_BITS`] bits of the sum are all ones;
//! [`RollSum::bits`] then scores the split by how many further bits
//! match, which the file writer uses to rank hash-tree levels.

/// Sliding window size in bytes. Must be a power of two.
pub const WINDOW_SIZE: usize = 64;

const CHAR_OFFSET: u32 = 31;

/// Number of low sum bits that must match for a split; the mean chunk is
/// `1 << BLOB_BITS` bytes. Raising this makes chunks bigger and the hash
/// tree shallower.
pub const BLOB_BITS: u32 = 13;

/// Mean chunk size implied by [`BLOB_BITS`].
pub const BLOB_SIZE: u32 = 1 << BLOB_BITS;

/// Rolling checksum state over the last [`WINDOW_SIZE`] bytes.
pub struct RollSum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    wofs: usize,
}

impl RollSum {
    pub fn new() -> RollSum {
        let window_size = WINDOW_SIZE as u32;
        RollSum {
            s1: window_size * CHAR_OFFSET,
            s2: window_size * (window_size - 1) * CHAR_OFFSET,
            window: [0; WINDOW_SIZE],
            wofs: 0,
        }
    }

    fn add(&mut self, drop: u8, add: u8) {
        self.s1 = self.s1.wrapping_add(add as u32).wrapping_sub(drop as u32);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub((WINDOW_SIZE as u32).wrapping_mul(drop as u32 + CHAR_OFFSET));
    }

    /// Slide one byte into the window.
    pub fn roll(&mut self, ch: u8) {
        let drop = self.window[self.wofs];
        self.window[self.wofs] = ch;
        self.wofs = (self.wofs + 1) & (WINDOW_SIZE - 1);
        self.add(drop, ch);
    }

    /// Whether the current position is a split point.
    pub fn on_split(&self) -> bool {
        (self.s2 & (BLOB_SIZE - 1)) == BLOB_SIZE - 1
    }

    /// Split strength: [`BLOB_BITS`] plus the number of additional
    /// matching high bits. Only meaningful at a split point.
    pub fn bits(&self) -> u32 {
        let mut bits = BLOB_BITS;
        let mut rsum = self.digest() >> BLOB_BITS;
        while (rsum >> 1) & 1 != 0 {
            bits += 1;
            rsum >>= 1;
        }
        bits
    }

    /// The current 32-bit sum.
    pub fn digest(&self) -> u32 {
        (self.s1 << 16) | (self.s2 & 0xffff)
    }
}

impl Default for RollSum {
    fn default() -> RollSum {
        RollSum::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic pseudo-random bytes (xorshift), so test inputs are
    /// stable across runs.
    pub(crate) fn test_bytes(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[test]
    fn digest_depends_only_on_window() {
        let data = test_bytes(4096);
        let mut rolling = RollSum::new();
        for &b in &data {
            rolling.roll(b);
        }

        let mut fresh = RollSum::new();
        for &b in &data[data.len() - WINDOW_SIZE..] {
            fresh.roll(b);
        }
        assert_eq!(rolling.digest(), fresh.digest());
    }

    #[test]
    fn split_frequency_is_roughly_mean_chunk_size() {
        let data = test_bytes(1 << 20);
        let mut rs = RollSum::new();
        let mut splits = 0usize;
        for &b in &data {
            rs.roll(b);
            if rs.on_split() {
                splits += 1;
            }
        }
        // Mean chunk is 8 KiB, so ~128 splits over 1 MiB. Allow a wide
        // band; the distribution is geometric.
        assert!((32..=512).contains(&splits), "got {splits} splits");
    }

    #[test]
    fn bits_is_at_least_blob_bits_on_split() {
        let data = test_bytes(1 << 18);
        let mut rs = RollSum::new();
        let mut saw_split = false;
        for &b in &data {
            rs.roll(b);
            if rs.on_split() {
                saw_split = true;
                assert!(rs.bits() >= BLOB_BITS);
            }
        }
        assert!(saw_split, "expected at least one split in 256 KiB");
    }

    #[test]
    fn identical_content_splits_identically() {
        let data = test_bytes(1 << 16);
        let split_positions = |data: &[u8]| -> Vec<usize> {
            let mut rs = RollSum::new();
            data.iter()
                .enumerate()
                .filter_map(|(i, &b)| {
                    rs.roll(b);
                    rs.on_split().then_some(i)
                })
                .collect()
        };
        assert_eq!(split_positions(&data), split_positions(&data));
    }
}
