//! Constant-sized bloom bitsets used to prune timer tag-name scans.
//!
//! Two sizes coexist: a 64-bit bloom per timer and a 128-bit bloom per
//! packet, covering all timer tag names of the packet. A packet bloom is
//! always a bit-superset of every timer bloom in the same packet, so a
//! failed packet-level subset test rejects the whole packet without
//! touching its timers.

const N_PROBES: u32 = 3;

// Fixed seeds: probe positions must agree between the repacker (which
// builds blooms from word ids) and report aggregators (which build the
// required-tags bloom from nameword ids).
const BLOOM_SEEDS: (u64, u64, u64, u64) = (
    0x9ae1_6a3b_2f90_404f,
    0xd8a9_d40d_9c8b_0c59,
    0x2b7e_1516_28ae_d2a6,
    0x4528_21e6_38d0_1377,
);

/// Hashes a dictionary word id into the 64-bit value blooms probe from.
#[inline]
#[must_use]
pub fn bloom_hash(word_id: u32) -> u64 {
    ahash::RandomState::with_seeds(BLOOM_SEEDS.0, BLOOM_SEEDS.1, BLOOM_SEEDS.2, BLOOM_SEEDS.3)
        .hash_one(word_id)
}

/// 64-bit bloom over the tag names of a single timer. Three probes drawn
/// from consecutive 6-bit slices of one 64-bit hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerBloom {
    bits: u64,
}

impl TimerBloom {
    const MASK: u64 = 63;
    const SHIFT: u32 = 6;

    #[inline]
    pub fn add(&mut self, word_id: u32) {
        self.add_hashed(bloom_hash(word_id));
    }

    #[inline]
    pub fn add_hashed(&mut self, hashed: u64) {
        for i in 0..N_PROBES {
            self.bits |= 1u64 << ((hashed >> (Self::SHIFT * i)) & Self::MASK);
        }
    }

    /// Subset test: true when every bit of `other` is set in `self`.
    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        (self.bits & other.bits) == other.bits
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// 128-bit bloom over all timer tag names of a packet. Three probes drawn
/// from consecutive 7-bit slices of one 64-bit hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketBloom {
    bits: [u64; 2],
}

impl PacketBloom {
    const MASK: u64 = 127;
    const SHIFT: u32 = 7;

    #[inline]
    pub fn add(&mut self, word_id: u32) {
        self.add_hashed(bloom_hash(word_id));
    }

    #[inline]
    pub fn add_hashed(&mut self, hashed: u64) {
        for i in 0..N_PROBES {
            let bit = (hashed >> (Self::SHIFT * i)) & Self::MASK;
            self.bits[(bit >> 6) as usize] |= 1u64 << (bit & 63);
        }
    }

    /// Subset test: true when every bit of `other` is set in `self`.
    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        (self.bits[0] & other.bits[0]) == other.bits[0]
            && (self.bits[1] & other.bits[1]) == other.bits[1]
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits[0] == 0 && self.bits[1] == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_bloom_contains_added() {
        let mut b = TimerBloom::default();
        for id in [1u32, 17, 100_000] {
            b.add(id);
        }

        for id in [1u32, 17, 100_000] {
            let mut single = TimerBloom::default();
            single.add(id);
            assert!(b.contains(&single));
        }
    }

    #[test]
    fn test_empty_bloom_is_subset_of_anything() {
        let empty = TimerBloom::default();
        let mut b = TimerBloom::default();
        b.add(42);
        assert!(b.contains(&empty));
        assert!(empty.contains(&empty));
        assert!(!empty.contains(&b));
    }

    #[test]
    fn test_packet_bloom_miss() {
        let mut b = PacketBloom::default();
        b.add(7);

        // With three probes over 128 bits, a disjoint id is overwhelmingly
        // likely to produce a missing bit; pick one that actually does.
        let mut miss = PacketBloom::default();
        let mut found = None;
        for id in 1000u32..2000 {
            miss = PacketBloom::default();
            miss.add(id);
            if !b.contains(&miss) {
                found = Some(id);
                break;
            }
        }
        assert!(found.is_some());
        assert!(!b.contains(&miss));
    }

    #[test]
    fn test_bloom_hash_is_stable() {
        assert_eq!(bloom_hash(12345), bloom_hash(12345));
        assert_ne!(bloom_hash(12345), bloom_hash(12346));
    }
}
