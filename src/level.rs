//! One compact table level: the slot codec plus the bucket-cooperative
//! probe engine.
//!
//! A level is `2^A` buckets of `B` slots. Each slot packs a state tag
//! (which hash function owns the entry, or zero for empty) and the high
//! bits of the permuted key; the bucket address carries the low bits, so
//! the full key is recoverable from `(slot, bucket)` alone. Both table
//! families are built from this engine: the cuckoo table is a single
//! level driven through [`Level::chain_put`], the iceberg table combines
//! a no-eviction primary level with a cuckoo secondary.
//!
//! On the host a "tile" is rendered in software: one worker thread scans
//! the `B` slots of a bucket and reduces them to a ballot mask, which
//! preserves the cooperative protocol exactly. The device rendition with
//! real warp ballots lives in [`crate::device`].

use core::marker::PhantomData;

use cust_core::DeviceCopy;

use crate::bits;
use crate::permute::Bijection;
use crate::slab::{RowWord, SlabRef};

#[cfg(not(target_arch = "nvptx64"))]
use crate::error::TableError;
#[cfg(not(target_arch = "nvptx64"))]
use crate::outcome::Outcome;
#[cfg(not(target_arch = "nvptx64"))]
use crate::slab::Slab;

/// The slot codec of one level: permutation family, key width and address
/// width. Trivially copyable so it can ride inside a device table ref.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Coding<R, P, const H: usize> {
    perms: [P; H],
    key_width: u32,
    addr_width: u32,
    _row: PhantomData<R>,
}

// Safety: Coding is an array of DeviceCopy permutations plus two integers;
// PhantomData is zero sized. No host references are carried.
unsafe impl<R: RowWord, P: Bijection, const H: usize> DeviceCopy for Coding<R, P, H> {}

impl<R: RowWord, P: Bijection, const H: usize> Coding<R, P, H> {
    /// Width of the state tag: enough bits for `0..=H`.
    pub const STATE_BITS: u32 = bits::width_for(H as u64);

    /// Checks a level geometry before any allocation happens.
    #[cfg(not(target_arch = "nvptx64"))]
    pub fn validate(key_width: u32, addr_width: u32, bucket_size: usize) -> Result<(), TableError> {
        if key_width == 0 || key_width > u64::BITS {
            return Err(TableError::KeyWidth(key_width));
        }
        if addr_width >= key_width {
            return Err(TableError::AddrWidth {
                addr: addr_width,
                key: key_width,
            });
        }
        if bucket_size == 0 || 32 % bucket_size != 0 {
            return Err(TableError::BucketSize(bucket_size));
        }
        let rem = key_width - addr_width;
        if Self::STATE_BITS + rem > R::BITS {
            return Err(TableError::RowWidth {
                row: R::BITS,
                state: Self::STATE_BITS,
                rem,
            });
        }
        Ok(())
    }

    /// Derives the permutation family for `(seed, key_width)` and fixes
    /// the geometry. Call [`Coding::validate`] first; this constructor
    /// only debug-asserts.
    pub fn new(key_width: u32, addr_width: u32, seed: u64) -> Self {
        debug_assert!(key_width >= 1 && key_width <= u64::BITS);
        debug_assert!(addr_width < key_width);
        debug_assert!(Self::STATE_BITS + (key_width - addr_width) <= R::BITS);
        Coding {
            perms: core::array::from_fn(|i| P::derive(seed, i, key_width)),
            key_width,
            addr_width,
            _row: PhantomData,
        }
    }

    #[inline]
    pub fn key_width(&self) -> u32 {
        self.key_width
    }

    #[inline]
    pub fn addr_width(&self) -> u32 {
        self.addr_width
    }

    #[inline]
    pub fn num_buckets(&self) -> usize {
        1usize << self.addr_width
    }

    /// Bits below the state tag; the remainder lives in the low end of
    /// this span.
    #[inline(always)]
    fn state_shift(&self) -> u32 {
        R::BITS - Self::STATE_BITS
    }

    /// Bucket address and occupied row for `key` under hash `hash`.
    #[inline(always)]
    pub fn addr_row(&self, hash: usize, key: u64) -> (usize, R) {
        debug_assert!(hash < H);
        debug_assert!(key <= bits::mask(self.key_width));
        let p = self.perms[hash].forward(key);
        let bucket = (p & bits::mask(self.addr_width)) as usize;
        let rem = p >> self.addr_width;
        let row = ((hash as u64 + 1) << self.state_shift()) | rem;
        (bucket, R::from_u64(row))
    }

    /// Recovers `(hash, key)` from an occupied row read out of `bucket`.
    ///
    /// The state tag names the permutation; remainder and address
    /// reassemble its image, and the inverse permutation yields the key.
    #[inline(always)]
    pub fn decode(&self, row: R, bucket: usize) -> (usize, u64) {
        let raw = row.to_u64();
        let state = raw >> self.state_shift();
        debug_assert!(state != 0, "decoding an empty row");
        debug_assert!(state <= H as u64);
        let hash = (state - 1) as usize;
        let rem = raw & bits::mask(self.state_shift());
        let p = (rem << self.addr_width) | bucket as u64;
        (hash, self.perms[hash].backward(p))
    }
}

/// What one cooperative bucket pass observed.
#[cfg(not(target_arch = "nvptx64"))]
#[derive(Clone, Copy)]
struct Scan {
    /// Ballot of non-empty lanes, one bit per slot.
    occupied: u32,
    /// Some lane holds exactly the probed row.
    hit: bool,
}

/// Result of trying to claim a free slot in one bucket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Claim {
    /// A free slot was claimed with the probed row.
    Put,
    /// The probed row is already present (duplicate avoidance on).
    Found,
    /// Every slot is occupied by other rows.
    BucketFull,
}

/// A host-resident level: codec plus owned slot storage.
#[cfg(not(target_arch = "nvptx64"))]
pub(crate) struct Level<R: RowWord, P: Bijection, const B: usize, const H: usize> {
    coding: Coding<R, P, H>,
    slab: Slab<R>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<R: RowWord, P: Bijection, const B: usize, const H: usize> Level<R, P, B, H> {
    /// Validates the geometry, then allocates and zeroes the slab.
    pub fn new(key_width: u32, addr_width: u32, seed: u64) -> Result<Self, TableError> {
        Coding::<R, P, H>::validate(key_width, addr_width, B)?;
        let coding = Coding::new(key_width, addr_width, seed);
        let slab = Slab::new(coding.num_buckets() * B);
        Ok(Level { coding, slab })
    }

    #[inline]
    pub fn coding(&self) -> &Coding<R, P, H> {
        &self.coding
    }

    /// Total slots in this level.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slab.len()
    }

    pub fn occupied_slots(&self) -> usize {
        self.slab.occupied()
    }

    pub fn clear(&mut self) {
        self.slab.clear();
    }

    /// One cooperative bucket pass: every lane reads its slot, the lane
    /// observations are reduced into a ballot.
    fn scan_bucket(&self, bucket: usize, row: R) -> Scan {
        let base = bucket * B;
        let mut occupied = 0u32;
        let mut hit = false;
        for lane in 0..B {
            let tmp = self.slab.read(base + lane);
            if tmp == row {
                hit = true;
            }
            if tmp.to_u64() != 0 {
                occupied |= 1u32 << lane;
            }
        }
        Scan { occupied, hit }
    }

    /// Cuckoo lookup. An empty slot under hash `i` proves the key was
    /// never displaced out of that bucket, so probing can stop early:
    /// slots are monotone, they never return to empty short of a clear.
    ///
    /// Safe against concurrent `chain_put`, but a concurrent insert of
    /// the same key may be missed; bulk pipelines re-check after they
    /// synchronize.
    pub fn find(&self, key: u64) -> bool {
        for hash in 0..H {
            let (bucket, row) = self.coding.addr_row(hash, key);
            let scan = self.scan_bucket(bucket, row);
            if scan.hit {
                return true;
            }
            if scan.occupied != bits::lane_mask(B) {
                return false;
            }
        }
        false
    }

    /// Lookup for an overflow-backed level (the iceberg primary): a row
    /// match is conclusive, but an empty slot is not proof of absence
    /// because the key may have overflowed to the next level while this
    /// bucket still had room for other keys. The caller must consult the
    /// overflow level on `false`.
    pub fn probe_without_absence(&self, key: u64) -> bool {
        for hash in 0..H {
            let (bucket, row) = self.coding.addr_row(hash, key);
            let scan = self.scan_bucket(bucket, row);
            if scan.hit {
                return true;
            }
            if scan.occupied != bits::lane_mask(B) {
                // The key can only sit under a later hash if this bucket
                // filled up first; it has not.
                break;
            }
        }
        false
    }

    /// Tries to claim a free slot of `bucket` for `row`.
    ///
    /// The claim goes to the slot at the bucket's load (its popcount of
    /// occupied lanes). Slots fill left to right and never empty out, so
    /// this is also the leftmost free slot, and concurrent inserters of
    /// the same key elect the same slot: exactly one wins the CAS and the
    /// others observe the winner's row when they rescan.
    pub(crate) fn claim_in_bucket(&self, bucket: usize, row: R, avoid_dups: bool) -> Claim {
        let base = bucket * B;
        loop {
            let scan = self.scan_bucket(bucket, row);
            if avoid_dups && scan.hit {
                return Claim::Found;
            }
            let load = scan.occupied.count_ones() as usize;
            if load == B {
                return Claim::BucketFull;
            }
            match self.slab.compare_exchange(base + load, R::from_u64(0), row) {
                Ok(_) => return Claim::Put,
                Err(winner) => {
                    if avoid_dups && winner == row {
                        return Claim::Found;
                    }
                    // Another insert took the slot first; rescan.
                }
            }
        }
    }

    /// Claims a slot for `key` under a single hash, without eviction.
    pub(crate) fn claim_at(&self, hash: usize, key: u64, avoid_dups: bool) -> Claim {
        let (bucket, row) = self.coding.addr_row(hash, key);
        self.claim_in_bucket(bucket, row, avoid_dups)
    }

    /// The cuckoo insert protocol with a bounded eviction chain.
    ///
    /// When the target bucket is full, a victim is evicted by atomic
    /// exchange and re-homed under its next hash function. The victim
    /// slot rotates with the chain depth and the bucket index so
    /// concurrent chains spread their atomic traffic across the bucket.
    /// The exchanged-out row is never empty (a full bucket stays full),
    /// so decoding it is always valid.
    pub fn chain_put(&self, key: u64, avoid_dups: bool, max_chain: usize) -> Outcome {
        let mut key = key;
        let mut hash = 0usize;
        let mut step = 0usize;
        loop {
            let (bucket, row) = self.coding.addr_row(hash, key);
            match self.claim_in_bucket(bucket, row, avoid_dups) {
                Claim::Put => return Outcome::Put,
                Claim::Found => return Outcome::Found,
                Claim::BucketFull => {}
            }
            if step >= max_chain {
                return Outcome::Full;
            }
            let victim = (bucket + step) % B;
            let evicted = self.slab.swap(bucket * B + victim, row);
            let (evicted_hash, evicted_key) = self.coding.decode(evicted, bucket);
            key = evicted_key;
            hash = (evicted_hash + 1) % H;
            step += 1;
        }
    }

    /// Occurrences of `key` in this level, across all of its hash
    /// locations. Host-only: it walks host-visible memory.
    pub fn count(&self, key: u64) -> usize {
        let mut n = 0;
        for hash in 0..H {
            let (bucket, row) = self.coding.addr_row(hash, key);
            let base = bucket * B;
            for lane in 0..B {
                if self.slab.read(base + lane) == row {
                    n += 1;
                }
            }
        }
        n
    }
}

/// Trivially copyable view of one level, for device kernels.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LevelRef<R: RowWord, P: Bijection, const B: usize, const H: usize> {
    coding: Coding<R, P, H>,
    slab: SlabRef<R>,
}

// Safety: both fields are DeviceCopy; no host references are carried.
unsafe impl<R: RowWord, P: Bijection, const B: usize, const H: usize> DeviceCopy
    for LevelRef<R, P, B, H>
{
}

impl<R: RowWord, P: Bijection, const B: usize, const H: usize> LevelRef<R, P, B, H> {
    /// Builds a level view over caller-managed slot memory.
    ///
    /// # Safety
    /// `slab` must cover exactly `coding.num_buckets() * B` slots of
    /// zero-initialized (or table-written) device memory, valid for the
    /// lifetime of the view.
    pub const unsafe fn new(coding: Coding<R, P, H>, slab: SlabRef<R>) -> Self {
        LevelRef { coding, slab }
    }

    #[inline]
    pub fn coding(&self) -> &Coding<R, P, H> {
        &self.coding
    }

    #[inline]
    pub fn slab(&self) -> &SlabRef<R> {
        &self.slab
    }
}

#[cfg(all(test, not(target_arch = "nvptx64")))]
mod tests {
    use super::*;
    use crate::permute::FeistelPermutation;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    type C3 = Coding<u32, FeistelPermutation, 3>;

    #[test]
    fn codec_round_trips() {
        let coding = C3::new(21, 5, 0x1234);
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        for _ in 0..500 {
            let key = rng.random::<u64>() & bits::mask(21);
            for hash in 0..3 {
                let (bucket, row) = coding.addr_row(hash, key);
                assert!(bucket < coding.num_buckets());
                assert_eq!(coding.decode(row, bucket), (hash, key));
            }
        }
    }

    #[test]
    fn occupied_rows_are_never_zero() {
        let coding = C3::new(21, 5, 9);
        for key in 0..2048 {
            for hash in 0..3 {
                let (_, row) = coding.addr_row(hash, key);
                assert_ne!(row, 0);
            }
        }
    }

    #[test]
    fn geometry_validation() {
        // 2 state bits + 16 remainder bits fit a u32 row.
        assert!(C3::validate(21, 5, 32).is_ok());
        // But not 2 + 31.
        assert_eq!(
            Coding::<u32, FeistelPermutation, 3>::validate(36, 5, 32),
            Err(TableError::RowWidth {
                row: 32,
                state: 2,
                rem: 31
            })
        );
        assert!(Coding::<u64, FeistelPermutation, 3>::validate(36, 5, 32).is_ok());
        assert_eq!(C3::validate(0, 0, 32), Err(TableError::KeyWidth(0)));
        assert_eq!(
            C3::validate(21, 21, 32),
            Err(TableError::AddrWidth { addr: 21, key: 21 })
        );
        assert_eq!(C3::validate(21, 5, 12), Err(TableError::BucketSize(12)));
        assert_eq!(C3::validate(21, 5, 0), Err(TableError::BucketSize(0)));
    }

    #[test]
    fn single_level_put_find_count() {
        let level = Level::<u32, FeistelPermutation, 8, 3>::new(16, 4, 77).unwrap();
        for key in 0..64u64 {
            assert_eq!(level.chain_put(key, true, 60), Outcome::Put);
        }
        for key in 0..64u64 {
            assert!(level.find(key));
            assert_eq!(level.count(key), 1);
        }
        for key in 64..128u64 {
            assert!(!level.find(key));
            assert_eq!(level.count(key), 0);
        }
        // Re-inserting with duplicate avoidance reports presence.
        for key in 0..64u64 {
            assert_eq!(level.chain_put(key, true, 60), Outcome::Found);
        }
        assert_eq!(level.occupied_slots(), 64);
    }

    #[test]
    fn eviction_chains_rehome_keys() {
        // 4 buckets of 4 slots at moderate load, so chains run but the
        // table never saturates: every key must come back out.
        let level = Level::<u32, FeistelPermutation, 4, 3>::new(12, 2, 5).unwrap();
        for key in 0..10u64 {
            assert_eq!(level.chain_put(key, true, 60), Outcome::Put);
        }
        for key in 0..10u64 {
            assert!(level.find(key), "key {key} lost by eviction");
            assert_eq!(level.count(key), 1);
        }
    }

    #[test]
    fn overfill_keeps_one_slot_per_put() {
        // 32 distinct keys into 16 slots: at least half must come back
        // Full, and each Put claims exactly one slot. Eviction exchanges
        // overwrite occupied slots with occupied slots, so the occupancy
        // equals the number of successful puts even across failed chains.
        let level = Level::<u32, FeistelPermutation, 4, 3>::new(12, 2, 5).unwrap();
        let mut puts = 0;
        let mut fulls = 0;
        for key in 0..32u64 {
            match level.chain_put(key, true, 60) {
                Outcome::Put => puts += 1,
                Outcome::Full => fulls += 1,
                Outcome::Found => panic!("distinct keys cannot collide"),
            }
        }
        assert!(fulls >= 16);
        assert_eq!(puts + fulls, 32);
        assert_eq!(level.occupied_slots(), puts);
    }

    #[test]
    fn clear_resets_counts() {
        let mut level = Level::<u64, FeistelPermutation, 8, 3>::new(20, 3, 1).unwrap();
        for key in 0..32u64 {
            level.chain_put(key, false, 60);
        }
        assert!(level.occupied_slots() > 0);
        level.clear();
        assert_eq!(level.occupied_slots(), 0);
        for key in 0..32u64 {
            assert_eq!(level.count(key), 0);
        }
    }
}
