//! Keyed, invertible permutations over the key universe `[0, 2^W)`.
//!
//! Every hash index `i` of a level owns one permutation. The low address
//! bits of the permuted key select the bucket and the high bits become the
//! stored remainder, so the inverse must be exact: it is what recovers an
//! evicted key from its slot during a cuckoo chain.

use cust_core::DeviceCopy;

use crate::bits;

/// An exactly invertible keyed bijection on `[0, 2^width)`.
///
/// Implementations must be cheap enough to evaluate per probe on both the
/// host and the device, and must derive statistically independent members
/// from `(seed, index)` pairs.
pub trait Bijection: Copy + Send + Sync + DeviceCopy + 'static {
    /// Derives the `index`-th member of the family for a given seed and
    /// key width.
    fn derive(seed: u64, index: usize, key_width: u32) -> Self;

    /// Maps a key to its permuted image.
    fn forward(&self, key: u64) -> u64;

    /// Maps a permuted image back to the key: `backward(forward(k)) == k`.
    fn backward(&self, permuted: u64) -> u64;
}

/// One-round Feistel network over `[0, 2^width)`.
///
/// The key is split into a low `right_bits` half and a high half. The
/// round function is a seeded multiply-add hash of the low half; its top
/// bits are XORed into the high half and the halves are swapped:
///
/// ```text
/// k = (l, r)          σ(k) = (r, l ^ f(r))
/// ```
///
/// Swapping moves the mixed half into the low (address) bits, so the
/// bucket address depends on every bit of the key. The construction is a
/// bijection for any round function, and the inverse just replays the
/// round.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FeistelPermutation {
    mul: u64,
    add: u64,
    left_bits: u32,
    right_bits: u32,
}

impl FeistelPermutation {
    /// Round function: top `left_bits` of a multiply-add over the low half.
    ///
    /// The multiplier is forced odd so consecutive low halves spread over
    /// the output range.
    #[inline(always)]
    fn round(&self, right: u64) -> u64 {
        let mixed = right.wrapping_mul(self.mul).wrapping_add(self.add);
        mixed >> (u64::BITS - self.left_bits)
    }
}

impl Bijection for FeistelPermutation {
    fn derive(seed: u64, index: usize, key_width: u32) -> Self {
        debug_assert!(key_width >= 1 && key_width <= 64);
        let right_bits = key_width / 2;
        let left_bits = key_width - right_bits;
        let a = bits::splitmix64(seed ^ bits::splitmix64(index as u64));
        let b = bits::splitmix64(a);
        FeistelPermutation {
            mul: a | 1,
            add: b,
            left_bits,
            right_bits,
        }
    }

    #[inline(always)]
    fn forward(&self, key: u64) -> u64 {
        let left = key >> self.right_bits;
        let right = key & bits::mask(self.right_bits);
        let mixed = left ^ (self.round(right) & bits::mask(self.left_bits));
        (right << self.left_bits) | mixed
    }

    #[inline(always)]
    fn backward(&self, permuted: u64) -> u64 {
        let mixed = permuted & bits::mask(self.left_bits);
        let right = permuted >> self.left_bits;
        let left = mixed ^ (self.round(right) & bits::mask(self.left_bits));
        (left << self.right_bits) | right
    }
}

// Safety: FeistelPermutation is four plain integers with no pointers or
// references, so copying it to device memory is sound.
unsafe impl DeviceCopy for FeistelPermutation {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    fn family(width: u32, seed: u64) -> [FeistelPermutation; 3] {
        core::array::from_fn(|i| FeistelPermutation::derive(seed, i, width))
    }

    #[test]
    fn round_trips_exactly() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        for width in [1, 2, 5, 21, 32, 47, 64] {
            for sigma in family(width, 0xdead_beef) {
                for _ in 0..200 {
                    let k = rng.random::<u64>() & crate::bits::mask(width);
                    let p = sigma.forward(k);
                    assert!(p <= crate::bits::mask(width), "image escapes universe");
                    assert_eq!(sigma.backward(p), k);
                }
            }
        }
    }

    #[test]
    fn small_universe_is_a_permutation() {
        // Exhaustive check that forward is injective on a small width.
        let width = 10;
        for sigma in family(width, 42) {
            let mut seen = vec![false; 1 << width];
            for k in 0..(1u64 << width) {
                let p = sigma.forward(k) as usize;
                assert!(!seen[p], "collision at {k}");
                seen[p] = true;
            }
        }
    }

    #[test]
    fn members_differ() {
        let [s0, s1, s2] = family(21, 99);
        let probe = 12345u64;
        let images = [s0.forward(probe), s1.forward(probe), s2.forward(probe)];
        assert!(images[0] != images[1] || images[1] != images[2]);
    }

    #[test]
    fn seed_changes_the_family() {
        let a = FeistelPermutation::derive(1, 0, 21);
        let b = FeistelPermutation::derive(2, 0, 21);
        assert_ne!(a.forward(777), b.forward(777));
    }
}
