//! Host-side bulk dispatch.
//!
//! On the device, a dispatcher is the tile leader-election loop: lanes
//! load one key each, the tile repeatedly elects the lowest pending lane,
//! broadcasts its key and probes one bucket cooperatively (see
//! [`crate::device`]). On the host the same contract is met by a rayon
//! traversal: each key is probed exactly once per call, order among
//! distinct keys is unspecified, and nothing blocks.

use rayon::prelude::*;

use crate::outcome::Outcome;

/// Runs `f` once for every key, giving it the matching result cell.
pub fn for_each<T, F>(keys: &[u64], results: &mut [T], f: F)
where
    T: Send,
    F: Fn(u64, &mut T) + Sync,
{
    debug_assert_eq!(keys.len(), results.len());
    keys.par_iter()
        .zip(results.par_iter_mut())
        .for_each(|(&key, slot)| f(key, slot));
}

/// Deduplicating traversal of a sorted key range.
///
/// `lead` runs once per distinct key, on its first occurrence; `follow`
/// runs on every other occurrence. The contract is strict: duplicates
/// must be adjacent, i.e. the input is sorted. Unsorted input silently
/// probes duplicates more than once.
pub fn for_each_dedup<T, L, R>(keys: &[u64], results: &mut [T], lead: L, follow: R)
where
    T: Send,
    L: Fn(u64, &mut T) + Sync,
    R: Fn(&mut T) + Sync,
{
    debug_assert_eq!(keys.len(), results.len());
    results
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, slot)| {
            if i == 0 || keys[i] != keys[i - 1] {
                lead(keys[i], slot);
            } else {
                follow(slot);
            }
        });
}

/// Shared-write view over a result buffer for permuted (scattered)
/// stores.
///
/// The unsorted find-or-put probes keys in sorted order but must land
/// each result at the key's original position. Workers therefore write
/// through a raw pointer; the index permutation guarantees every cell is
/// touched by exactly one worker.
pub(crate) struct ScatterCells<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: core::marker::PhantomData<&'a mut [T]>,
}

// Safety: ScatterCells hands out disjoint cells only (callers index it
// through a permutation), so sharing the pointer across workers is sound
// for any Send cell type.
unsafe impl<T: Send> Send for ScatterCells<'_, T> {}
unsafe impl<T: Send> Sync for ScatterCells<'_, T> {}

impl<'a, T: Copy> ScatterCells<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        ScatterCells {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: core::marker::PhantomData,
        }
    }

    /// Writes one cell.
    ///
    /// # Safety
    /// No other worker may touch `index` during the traversal.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        // Safety: in bounds per the debug assert; exclusivity is the
        // caller's permutation argument.
        unsafe { *self.ptr.add(index) = value };
    }

    /// Reads one cell written by an earlier, already-synchronized pass.
    ///
    /// # Safety
    /// No other worker may write `index` during the traversal.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        debug_assert!(index < self.len);
        // Safety: same argument as `write`.
        unsafe { *self.ptr.add(index) }
    }
}

/// Convenience wrapper for the common put-style call: run the per-key
/// protocol and record `Full` sightings on the process-wide flag.
pub(crate) fn put_pass<F>(keys: &[u64], results: &mut [Outcome], f: F)
where
    F: Fn(u64) -> Outcome + Sync,
{
    for_each(keys, results, |key, slot| {
        *slot = crate::outcome::note_outcome(f(key));
    });
}
