//! Two-level iceberg table: a primary level that never evicts, backed by
//! a smaller cuckoo-style secondary for overflow.

use cust_core::DeviceCopy;

use crate::level::LevelRef;
use crate::permute::{Bijection, FeistelPermutation};
use crate::slab::RowWord;

#[cfg(not(target_arch = "nvptx64"))]
use crate::bits;
#[cfg(not(target_arch = "nvptx64"))]
use crate::cuckoo::DEFAULT_CHAIN_FACTOR;
#[cfg(not(target_arch = "nvptx64"))]
use crate::dispatch;
#[cfg(not(target_arch = "nvptx64"))]
use crate::error::TableError;
#[cfg(not(target_arch = "nvptx64"))]
use crate::level::{Claim, Level};
#[cfg(not(target_arch = "nvptx64"))]
use crate::outcome::{note_outcome, Outcome, EMPTY};

/// A two-level iceberg hash table for `W`-bit keys.
///
/// The primary level handles the common case with a short hash chain
/// (`HP`, typically one) and leftmost-free-slot insertion; it never
/// evicts. Keys whose primary buckets are all full fall through to the
/// secondary level, which has its own geometry and permutation family
/// and runs the full cuckoo protocol including bounded eviction chains.
///
/// A key that goes through find-or-put occupies at most one slot across
/// both levels: concurrent inserters of the same key elect the same slot
/// and serialize on its CAS. Raw [`IcebergTable::put`] does not make
/// that guarantee.
#[cfg(not(target_arch = "nvptx64"))]
pub struct IcebergTable<
    RP: RowWord = u64,
    RS: RowWord = u64,
    P: Bijection = FeistelPermutation,
    const BP: usize = 32,
    const BS: usize = 16,
    const HP: usize = 1,
    const HS: usize = 3,
> {
    primary: Level<RP, P, BP, HP>,
    secondary: Level<RS, P, BS, HS>,
    max_chain: usize,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<
        RP: RowWord,
        RS: RowWord,
        P: Bijection,
        const BP: usize,
        const BS: usize,
        const HP: usize,
        const HS: usize,
    > IcebergTable<RP, RS, P, BP, BS, HP, HS>
{
    /// Constructs a table with a randomly drawn seed.
    pub fn new(key_width: u32, p_addr_width: u32, s_addr_width: u32) -> Result<Self, TableError> {
        Self::with_seed(key_width, p_addr_width, s_addr_width, rand::random())
    }

    /// Constructs a table with a caller-chosen seed. The secondary level
    /// derives an independent permutation family from the same seed.
    pub fn with_seed(
        key_width: u32,
        p_addr_width: u32,
        s_addr_width: u32,
        seed: u64,
    ) -> Result<Self, TableError> {
        Ok(IcebergTable {
            primary: Level::new(key_width, p_addr_width, seed)?,
            secondary: Level::new(key_width, s_addr_width, bits::splitmix64(seed))?,
            max_chain: DEFAULT_CHAIN_FACTOR * HS,
        })
    }

    pub fn max_chain(&self) -> usize {
        self.max_chain
    }

    pub fn set_max_chain(&mut self, max_chain: usize) {
        self.max_chain = max_chain;
    }

    pub fn key_width(&self) -> u32 {
        self.primary.coding().key_width()
    }

    /// Slots in the primary level.
    pub fn primary_capacity(&self) -> usize {
        self.primary.capacity()
    }

    /// Slots in the secondary level.
    pub fn secondary_capacity(&self) -> usize {
        self.secondary.capacity()
    }

    pub fn primary_occupied(&self) -> usize {
        self.primary.occupied_slots()
    }

    pub fn secondary_occupied(&self) -> usize {
        self.secondary.occupied_slots()
    }

    /// The per-key insert protocol: primary hashes in order, then the
    /// secondary cuckoo protocol once every primary bucket is full.
    fn put_one(&self, key: u64, avoid_dups: bool) -> Outcome {
        for hash in 0..HP {
            match self.primary.claim_at(hash, key, avoid_dups) {
                Claim::Put => return Outcome::Put,
                Claim::Found => return Outcome::Found,
                Claim::BucketFull => {}
            }
        }
        self.secondary.chain_put(key, avoid_dups, self.max_chain)
    }

    /// The per-key lookup. A primary empty slot is not proof of absence:
    /// the key may have overflowed while its primary bucket still had
    /// room for other keys inserted later, so the secondary is probed on
    /// every primary miss.
    fn find_one(&self, key: u64) -> bool {
        self.primary.probe_without_absence(key) || self.secondary.find(key)
    }

    /// Single-key lookup.
    pub fn contains(&self, key: u64) -> bool {
        self.find_one(key)
    }

    /// Occurrences of `key` across both levels. Host-callable because the
    /// backing memory is host-visible.
    pub fn count(&self, key: u64) -> usize {
        self.primary.count(key) + self.secondary.count(key)
    }

    /// Zeroes both slabs.
    pub fn clear(&mut self) {
        self.primary.clear();
        self.secondary.clear();
    }

    fn check_lengths(&self, keys: usize, results: usize) -> Result<(), TableError> {
        if keys != results {
            return Err(TableError::LengthMismatch { keys, results });
        }
        Ok(())
    }

    /// Attempts to insert every key, writing `Put` or `Full` per key.
    /// Duplicates are not detected.
    pub fn put(&self, keys: &[u64], results: &mut [Outcome]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::put_pass(keys, results, |key| self.put_one(key, false));
        Ok(())
    }

    /// As [`IcebergTable::put`], but reports `Found` for keys already
    /// present in a probed bucket.
    pub fn put_avoid_dups(&self, keys: &[u64], results: &mut [Outcome]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::put_pass(keys, results, |key| self.put_one(key, true));
        Ok(())
    }

    /// Membership test for every key.
    pub fn find(&self, keys: &[u64], results: &mut [bool]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::for_each(keys, results, |key, slot| *slot = self.find_one(key));
        Ok(())
    }

    /// Find-or-put over a sorted key range; same two-pass structure and
    /// `Found` coarsening for non-first occurrences as the cuckoo table.
    pub fn find_or_put_sorted(
        &self,
        keys: &[u64],
        results: &mut [Outcome],
    ) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::for_each_dedup(
            keys,
            results,
            |key, slot| {
                *slot = if self.find_one(key) {
                    Outcome::Found
                } else {
                    EMPTY
                };
            },
            |_| {},
        );
        dispatch::for_each_dedup(
            keys,
            results,
            |key, slot| {
                if !slot.is_found() {
                    *slot = note_outcome(self.put_one(key, true));
                }
            },
            |slot| *slot = Outcome::Found,
        );
        Ok(())
    }

    /// Find-or-put over an arbitrary key range, no scratch required.
    ///
    /// Unlike the cuckoo table this needs no sort: duplicate occurrences
    /// of a key all run the insert protocol with duplicate avoidance, and
    /// because racing inserters elect the same slot, exactly one of them
    /// wins the CAS while the rest observe the winner's row and report
    /// `Found`.
    pub fn find_or_put(&self, keys: &[u64], results: &mut [Outcome]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::for_each(keys, results, |key, slot| {
            *slot = if self.find_one(key) {
                Outcome::Found
            } else {
                EMPTY
            };
        });
        dispatch::for_each(keys, results, |key, slot| {
            if !slot.is_found() {
                *slot = note_outcome(self.put_one(key, true));
            }
        });
        Ok(())
    }
}

/// Trivially copyable iceberg table view for device kernels.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IcebergRef<
    RP: RowWord,
    RS: RowWord,
    P: Bijection,
    const BP: usize,
    const BS: usize,
    const HP: usize,
    const HS: usize,
> {
    primary: LevelRef<RP, P, BP, HP>,
    secondary: LevelRef<RS, P, BS, HS>,
    max_chain: usize,
}

// Safety: two LevelRefs plus an integer, all valid device data.
unsafe impl<
        RP: RowWord,
        RS: RowWord,
        P: Bijection,
        const BP: usize,
        const BS: usize,
        const HP: usize,
        const HS: usize,
    > DeviceCopy for IcebergRef<RP, RS, P, BP, BS, HP, HS>
{
}

impl<
        RP: RowWord,
        RS: RowWord,
        P: Bijection,
        const BP: usize,
        const BS: usize,
        const HP: usize,
        const HS: usize,
    > IcebergRef<RP, RS, P, BP, BS, HP, HS>
{
    /// Builds a table view over two caller-managed levels.
    ///
    /// # Safety
    /// Both level refs must satisfy the requirements of
    /// [`LevelRef::new`] for the whole lifetime of the view.
    pub const unsafe fn new(
        primary: LevelRef<RP, P, BP, HP>,
        secondary: LevelRef<RS, P, BS, HS>,
        max_chain: usize,
    ) -> Self {
        IcebergRef {
            primary,
            secondary,
            max_chain,
        }
    }

    #[inline]
    pub fn primary(&self) -> &LevelRef<RP, P, BP, HP> {
        &self.primary
    }

    #[inline]
    pub fn secondary(&self) -> &LevelRef<RS, P, BS, HS> {
        &self.secondary
    }

    #[inline]
    pub fn max_chain(&self) -> usize {
        self.max_chain
    }
}
