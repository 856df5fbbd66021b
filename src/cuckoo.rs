//! Single-level bucketed cuckoo table over compact slots.

use cust_core::DeviceCopy;

use crate::level::LevelRef;
use crate::permute::{Bijection, FeistelPermutation};
use crate::slab::RowWord;

#[cfg(not(target_arch = "nvptx64"))]
use rayon::prelude::*;

#[cfg(not(target_arch = "nvptx64"))]
use crate::bits;
#[cfg(not(target_arch = "nvptx64"))]
use crate::dispatch::{self, ScatterCells};
#[cfg(not(target_arch = "nvptx64"))]
use crate::error::TableError;
#[cfg(not(target_arch = "nvptx64"))]
use crate::level::Level;
#[cfg(not(target_arch = "nvptx64"))]
use crate::outcome::{note_outcome, Outcome, EMPTY};

/// Eviction chains are bounded by this factor times the hash count.
pub const DEFAULT_CHAIN_FACTOR: usize = 20;

/// A cuckoo hash table storing `W`-bit keys in `2^A` buckets of `B`
/// compact `R`-word slots, probed by `H` keyed permutations.
///
/// `W` and `A` are construction parameters, validated fail-fast; the row
/// type, bucket size and hash count are fixed at compile time because the
/// probe loops are the hot path. The default geometry matches the common
/// configuration: full-warp buckets and three hash functions.
///
/// Bulk operations borrow the caller's key and result slices for the
/// duration of the call and run the per-key protocol across a thread
/// pool; per-slot atomics make concurrent tiles safe. The table must not
/// be reconfigured while a bulk call is in flight (enforced by `&self` /
/// `&mut self` borrows).
#[cfg(not(target_arch = "nvptx64"))]
pub struct CuckooTable<
    R: RowWord = u64,
    P: Bijection = FeistelPermutation,
    const B: usize = 32,
    const H: usize = 3,
> {
    level: Level<R, P, B, H>,
    max_chain: usize,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<R: RowWord, P: Bijection, const B: usize, const H: usize> CuckooTable<R, P, B, H> {
    /// Constructs a table with a randomly drawn permutation seed.
    pub fn new(key_width: u32, addr_width: u32) -> Result<Self, TableError> {
        Self::with_seed(key_width, addr_width, rand::random())
    }

    /// Constructs a table with a caller-chosen seed, for reproducible
    /// layouts and for retrying a `Full` workload under a fresh family.
    pub fn with_seed(key_width: u32, addr_width: u32, seed: u64) -> Result<Self, TableError> {
        Ok(CuckooTable {
            level: Level::new(key_width, addr_width, seed)?,
            max_chain: DEFAULT_CHAIN_FACTOR * H,
        })
    }

    /// Upper bound on eviction chain length before a put gives up.
    pub fn max_chain(&self) -> usize {
        self.max_chain
    }

    pub fn set_max_chain(&mut self, max_chain: usize) {
        self.max_chain = max_chain;
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.level.capacity()
    }

    pub fn num_buckets(&self) -> usize {
        self.level.coding().num_buckets()
    }

    pub fn key_width(&self) -> u32 {
        self.level.coding().key_width()
    }

    pub fn addr_width(&self) -> u32 {
        self.level.coding().addr_width()
    }

    /// Occupied slots, by scanning the (host-visible) slab.
    pub fn occupied_slots(&self) -> usize {
        self.level.occupied_slots()
    }

    /// Single-key lookup.
    pub fn contains(&self, key: u64) -> bool {
        self.level.find(key)
    }

    /// Occurrences of `key` across all its hash locations. Host-callable
    /// because the backing memory is host-visible; `1` for any key that
    /// went through find-or-put, possibly more after raw `put` calls.
    pub fn count(&self, key: u64) -> usize {
        self.level.count(key)
    }

    /// Zeroes every slot. The only way occupied slots ever become empty.
    pub fn clear(&mut self) {
        self.level.clear();
    }

    fn check_lengths(&self, keys: usize, results: usize) -> Result<(), TableError> {
        if keys != results {
            return Err(TableError::LengthMismatch { keys, results });
        }
        Ok(())
    }

    /// Attempts to insert every key, writing `Put` or `Full` per key.
    /// Duplicates are not detected; inserting a present key stores a
    /// second copy.
    pub fn put(&self, keys: &[u64], results: &mut [Outcome]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::put_pass(keys, results, |key| {
            self.level.chain_put(key, false, self.max_chain)
        });
        Ok(())
    }

    /// As [`CuckooTable::put`], but reports `Found` when the key is
    /// already present in a probed bucket.
    pub fn put_avoid_dups(&self, keys: &[u64], results: &mut [Outcome]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::put_pass(keys, results, |key| {
            self.level.chain_put(key, true, self.max_chain)
        });
        Ok(())
    }

    /// Membership test for every key.
    pub fn find(&self, keys: &[u64], results: &mut [bool]) -> Result<(), TableError> {
        self.check_lengths(keys.len(), results.len())?;
        dispatch::for_each(keys, results, |key, slot| *slot = self.level.find(key));
        Ok(())
    }

    /// Find-or-put over a sorted key range.
    ///
    /// Two passes: a read pass marks first occurrences `Found` or leaves
    /// them undecided, then a write pass inserts the undecided ones.
    /// Every non-first occurrence reports `Found`, even when its first
    /// occurrence came back `Full`; that coarsening keeps the pass cheap
    /// and is part of the contract.
    ///
    /// The caller must present duplicates adjacently (sorted input); this
    /// is not checked.
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
                *slot = if self.level.find(key) {
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
                    *slot = note_outcome(self.level.chain_put(key, true, self.max_chain));
                }
            },
            |slot| *slot = Outcome::Found,
        );
        Ok(())
    }

    /// Find-or-put over an arbitrary key range.
    ///
    /// The keys are copied into `scratch` (which must hold `2 * L`
    /// words), stable-sorted together with an index permutation, and the
    /// sorted protocol runs through permuted views: each result lands at
    /// its key's original position. The range length must be
    /// representable in the key width, a limit inherited from encoding
    /// the permutation indices in key-sized words.
    pub fn find_or_put(
        &self,
        keys: &[u64],
        scratch: &mut [u64],
        results: &mut [Outcome],
    ) -> Result<(), TableError> {
        let len = keys.len();
        self.check_lengths(len, results.len())?;
        if scratch.len() < 2 * len {
            return Err(TableError::ScratchTooSmall {
                got: scratch.len(),
                need: 2 * len,
            });
        }
        if len as u64 > bits::mask(self.key_width()) {
            return Err(TableError::RangeTooLong {
                len,
                width: self.key_width(),
            });
        }
        if len == 0 {
            return Ok(());
        }

        let (skeys, sidx) = scratch[..2 * len].split_at_mut(len);
        skeys.copy_from_slice(keys);
        for (j, cell) in sidx.iter_mut().enumerate() {
            *cell = j as u64;
        }
        // Stable, so duplicate keys keep their input order.
        sidx.sort_by_key(|&j| keys[j as usize]);
        for j in 0..len {
            skeys[j] = keys[sidx[j] as usize];
        }

        let cells = ScatterCells::new(results);
        // Read pass over the sorted view, scattered to caller order.
        (0..len).into_par_iter().for_each(|j| {
            if j == 0 || skeys[j] != skeys[j - 1] {
                let outcome = if self.level.find(skeys[j]) {
                    Outcome::Found
                } else {
                    EMPTY
                };
                // Safety: `sidx` is a permutation of 0..len, so worker `j`
                // is the only one touching this cell.
                unsafe { cells.write(sidx[j] as usize, outcome) };
            }
        });
        // Write pass.
        (0..len).into_par_iter().for_each(|j| {
            let at = sidx[j] as usize;
            if j == 0 || skeys[j] != skeys[j - 1] {
                // Safety: permutation argument as above; the read pass has
                // completed before this pass starts.
                let decided = unsafe { cells.read(at) };
                if !decided.is_found() {
                    let outcome =
                        note_outcome(self.level.chain_put(skeys[j], true, self.max_chain));
                    // Safety: permutation argument as above.
                    unsafe { cells.write(at, outcome) };
                }
            } else {
                // Safety: permutation argument as above.
                unsafe { cells.write(at, Outcome::Found) };
            }
        });
        Ok(())
    }
}

/// Trivially copyable cuckoo table view for device kernels.
///
/// The embedding application owns the device allocation; it zeroes the
/// slot memory, builds a [`LevelRef`] over it and passes this ref to the
/// kernels by value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CuckooRef<R: RowWord, P: Bijection, const B: usize, const H: usize> {
    level: LevelRef<R, P, B, H>,
    max_chain: usize,
}

// Safety: a LevelRef plus an integer, both valid device data.
unsafe impl<R: RowWord, P: Bijection, const B: usize, const H: usize> DeviceCopy
    for CuckooRef<R, P, B, H>
{
}

impl<R: RowWord, P: Bijection, const B: usize, const H: usize> CuckooRef<R, P, B, H> {
    /// Builds a table view.
    ///
    /// # Safety
    /// `level` must satisfy the requirements of [`LevelRef::new`] for the
    /// whole lifetime of the view.
    pub const unsafe fn new(level: LevelRef<R, P, B, H>, max_chain: usize) -> Self {
        CuckooRef { level, max_chain }
    }

    #[inline]
    pub fn level(&self) -> &LevelRef<R, P, B, H> {
        &self.level
    }

    #[inline]
    pub fn max_chain(&self) -> usize {
        self.max_chain
    }
}
