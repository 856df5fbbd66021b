//! Device-side rendition of the cooperative protocol.
//!
//! This module only exists on the `nvptx64` target. A tile is a fixed
//! partition of the 32-lane warp; every lane of a tile steps through the
//! protocol in lockstep and the software ballots of the host engine
//! become real warp votes. The bulk kernels implement the dispatcher's
//! leader-election loop: each lane loads one key, the tile repeatedly
//! elects the lowest pending lane, broadcasts its key and probes one
//! bucket cooperatively.

use core::sync::atomic::Ordering;

use cuda_std::atomic::mid;
use cuda_std::prelude::*;
use cuda_std::{thread, warp};

use crate::bits;
use crate::level::{Claim, LevelRef};
use crate::outcome::{Outcome, EMPTY};
use crate::permute::Bijection;
use crate::slab::RowWord;

/// One cooperative tile: a `width`-lane partition of the current warp.
#[derive(Clone, Copy)]
pub struct Tile {
    mask: u32,
    base: u32,
    width: u32,
}

impl Tile {
    /// Splits the warp into `width`-lane tiles and returns this lane's.
    ///
    /// # Safety
    /// `width` must divide 32 and all lanes of the resulting tile must be
    /// converged for the lifetime of the value.
    #[inline]
    pub unsafe fn split(width: u32) -> Self {
        let lane = warp::lane_id();
        let base = (lane / width) * width;
        let mask = bits::lane_mask(width as usize) << base;
        Tile { mask, base, width }
    }

    /// This lane's rank within the tile.
    #[inline(always)]
    pub fn rank(&self) -> u32 {
        warp::lane_id() - self.base
    }

    /// Synchronizes the tile's lanes.
    ///
    /// # Safety
    /// All lanes of the tile must reach this call.
    #[inline(always)]
    pub unsafe fn sync(&self) {
        // Safety: the tile mask is a valid warp partition by construction.
        unsafe { warp::sync_warp(self.mask) };
    }

    /// Ballot over the tile, normalized so bit `r` is lane `r`'s vote.
    ///
    /// # Safety
    /// All lanes of the tile must participate.
    #[inline(always)]
    pub unsafe fn ballot(&self, pred: bool) -> u32 {
        // Safety: valid warp partition, converged per the caller contract.
        let votes = unsafe { warp::warp_vote_ballot(self.mask, pred) };
        (votes >> self.base) & bits::lane_mask(self.width as usize)
    }

    /// Does any lane of the tile vote yes?
    ///
    /// # Safety
    /// All lanes of the tile must participate.
    #[inline(always)]
    pub unsafe fn any(&self, pred: bool) -> bool {
        // Safety: valid warp partition, converged per the caller contract.
        unsafe { warp::warp_vote_any(self.mask, pred) }
    }

    /// Broadcasts `value` from the lane with tile rank `src`.
    ///
    /// # Safety
    /// All lanes of the tile must participate and `src < width`.
    #[inline(always)]
    pub unsafe fn shfl(&self, value: u64, src: u32) -> u64 {
        // Safety: valid warp partition; the source lane is in the mask.
        let (v, _) = unsafe { warp::warp_shuffle_idx(self.mask, value, self.base + src, 32) };
        v
    }
}

impl<R: RowWord, P: Bijection, const B: usize, const H: usize> LevelRef<R, P, B, H> {
    /// Cooperative lookup with early absence on an empty slot.
    ///
    /// # Safety
    /// `tile` must be a converged `B`-lane partition of the warp.
    pub unsafe fn coop_find(&self, tile: &Tile, key: u64) -> bool {
        for hash in 0..H {
            let (bucket, row) = self.coding().addr_row(hash, key);
            let tmp = self.slab().read(bucket * B + tile.rank() as usize);
            // Safety: all lanes reach these votes together.
            unsafe {
                tile.sync();
                if tile.any(tmp == row) {
                    return true;
                }
                if tile.any(tmp.to_u64() == 0) {
                    return false;
                }
            }
        }
        false
    }

    /// Cooperative lookup that treats an empty slot as "unknown": a miss
    /// here means the caller must probe the overflow level.
    ///
    /// # Safety
    /// `tile` must be a converged `B`-lane partition of the warp.
    pub unsafe fn coop_probe_without_absence(&self, tile: &Tile, key: u64) -> bool {
        for hash in 0..H {
            let (bucket, row) = self.coding().addr_row(hash, key);
            let tmp = self.slab().read(bucket * B + tile.rank() as usize);
            // Safety: all lanes reach these votes together.
            unsafe {
                tile.sync();
                if tile.any(tmp == row) {
                    return true;
                }
                if tile.any(tmp.to_u64() == 0) {
                    break;
                }
            }
        }
        false
    }

    /// Cooperative claim of a free slot; the lane at the bucket's load
    /// performs the CAS and broadcasts the result.
    ///
    /// # Safety
    /// `tile` must be a converged `B`-lane partition of the warp.
    unsafe fn coop_claim(&self, tile: &Tile, bucket: usize, row: R, avoid_dups: bool) -> Claim {
        loop {
            let tmp = self.slab().read(bucket * B + tile.rank() as usize);
            // Safety: all lanes reach these votes together.
            let (present, occupied) =
                unsafe { (tile.any(tmp == row), tile.ballot(tmp.to_u64() != 0)) };
            if avoid_dups && present {
                return Claim::Found;
            }
            let load = occupied.count_ones();
            if load as usize == B {
                return Claim::BucketFull;
            }
            let attempt = if tile.rank() == load {
                self.slab()
                    .compare_exchange(bucket * B + load as usize, R::from_u64(0), row)
                    .to_u64()
            } else {
                0
            };
            // Safety: every lane participates in the broadcast.
            let prev = unsafe { tile.shfl(attempt, load) };
            if prev == 0 {
                return Claim::Put;
            }
            if avoid_dups && prev == row.to_u64() {
                return Claim::Found;
            }
            // Another tile won the slot; rescan the bucket.
        }
    }

    /// Cooperative insert under a single hash, without eviction.
    ///
    /// # Safety
    /// `tile` must be a converged `B`-lane partition of the warp.
    pub unsafe fn coop_claim_at(
        &self,
        tile: &Tile,
        hash: usize,
        key: u64,
        avoid_dups: bool,
    ) -> Claim {
        let (bucket, row) = self.coding().addr_row(hash, key);
        // Safety: forwarded caller contract.
        unsafe { self.coop_claim(tile, bucket, row, avoid_dups) }
    }

    /// Cooperative cuckoo insert with a bounded eviction chain; the
    /// victim lane performs the exchange and broadcasts the evicted row.
    ///
    /// # Safety
    /// `tile` must be a converged `B`-lane partition of the warp.
    pub unsafe fn coop_chain_put(
        &self,
        tile: &Tile,
        key: u64,
        avoid_dups: bool,
        max_chain: usize,
    ) -> Outcome {
        let mut key = key;
        let mut hash = 0usize;
        let mut step = 0usize;
        loop {
            let (bucket, row) = self.coding().addr_row(hash, key);
            // Safety: forwarded caller contract.
            match unsafe { self.coop_claim(tile, bucket, row, avoid_dups) } {
                Claim::Put => return Outcome::Put,
                Claim::Found => return Outcome::Found,
                Claim::BucketFull => {}
            }
            if step >= max_chain {
                return Outcome::Full;
            }
            let victim = ((bucket + step) % B) as u32;
            let swapped = if tile.rank() == victim {
                self.slab().swap(bucket * B + victim as usize, row).to_u64()
            } else {
                0
            };
            // Safety: every lane participates in the broadcast.
            let evicted = unsafe { tile.shfl(swapped, victim) };
            let (evicted_hash, evicted_key) = self.coding().decode(R::from_u64(evicted), bucket);
            key = evicted_key;
            hash = (evicted_hash + 1) % H;
            step += 1;
        }
    }
}

/// Relaxed store of the "some key came back Full" flag.
///
/// # Safety
/// `flag` must be a valid device pointer to a `u32`.
#[inline]
unsafe fn raise_full_flag(flag: *mut u32) {
    // Safety: valid, aligned device pointer per the caller contract.
    unsafe { mid::atomic_store_32_device(flag, Ordering::Relaxed, 1) };
}

/// The dispatcher's leader-election loop.
///
/// Each lane owns the key at `idx` (when in range and `pending`); the
/// tile repeatedly elects the lowest pending lane, broadcasts its key,
/// runs `probe` cooperatively and stores the result at the leader's
/// index.
///
/// # Safety
/// `tile` must be converged; `keys` and `results` must be valid for `n`
/// elements; distinct tiles must own distinct index ranges.
unsafe fn elect_and_probe<F>(
    tile: &Tile,
    idx: usize,
    n: usize,
    keys: *const u64,
    results: *mut Outcome,
    mut pending: bool,
    probe: F,
) where
    F: Fn(&Tile, u64) -> Outcome,
{
    // Safety: `idx < n` is checked before the read; the caller guarantees
    // `keys` covers `n` elements.
    let my_key = if idx < n { unsafe { *keys.add(idx) } } else { 0 };
    pending = pending && idx < n;
    loop {
        // Safety: all lanes of the tile reach the ballot together.
        let mask = unsafe { tile.ballot(pending) };
        if mask == 0 {
            return;
        }
        let leader = mask.trailing_zeros();
        // Safety: every lane participates; `leader` is a valid rank.
        let key = unsafe { tile.shfl(my_key, leader) };
        let outcome = probe(tile, key);
        if tile.rank() == leader {
            // Safety: the leader's `idx` was range-checked when it became
            // pending, and no other tile owns it.
            unsafe { *results.add(idx) = outcome };
            pending = false;
        }
    }
}

/// Whether this lane's key is the first occurrence in a sorted range.
///
/// # Safety
/// `keys` must be valid for `n` elements.
#[inline]
unsafe fn first_occurrence(keys: *const u64, idx: usize, n: usize) -> bool {
    if idx >= n {
        return false;
    }
    // Safety: `0 < idx < n`, both reads are in range.
    idx == 0 || unsafe { *keys.add(idx) != *keys.add(idx - 1) }
}

// One kernel family per canonical geometry. The row type is u32 (the
// compact configuration the tables are benchmarked with); the embedding
// application builds the matching refs over its own device allocations.
macro_rules! table_kernels {
    (@cuckoo $b:tt) => {
        paste::paste! {
            mod [<cuckoo_kernels_bs $b>] {
                use super::*;
                use crate::cuckoo::CuckooRef;
                use crate::permute::FeistelPermutation;

                type Ref = CuckooRef<u32, FeistelPermutation, $b, 3>;

                /// Bulk insert. `avoid_dups != 0` reports `Found` for
                /// keys already present in a probed bucket.
                ///
                /// # Safety
                /// `keys` and `results` must be valid device pointers for
                /// `n` elements; `full_flag` must be a valid device
                /// pointer; `table` must view live slot memory.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<cuckoo_put_bs $b>](
                    keys: *const u64,
                    n: usize,
                    results: *mut Outcome,
                    avoid_dups: u32,
                    full_flag: *mut u32,
                    table: Ref,
                ) {
                    // Safety: B divides 32 and the block is converged on entry.
                    let tile = unsafe { Tile::split($b) };
                    let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
                    let mut idx = thread::index_1d() as usize;
                    let rounds = (n + stride - 1) / stride;
                    for _ in 0..rounds {
                        // Safety: forwarded pointer contracts; tiles own
                        // disjoint index ranges by construction.
                        unsafe {
                            elect_and_probe(&tile, idx, n, keys, results, true, |tile, key| {
                                // Safety: `tile` is converged and B-wide.
                                let out = unsafe {
                                    table.level().coop_chain_put(
                                        tile,
                                        key,
                                        avoid_dups != 0,
                                        table.max_chain(),
                                    )
                                };
                                if out.is_full() {
                                    unsafe { raise_full_flag(full_flag) };
                                }
                                out
                            });
                        }
                        idx += stride;
                    }
                }

                /// Bulk membership test.
                ///
                /// # Safety
                /// `keys` and `results` must be valid device pointers for
                /// `n` elements; `table` must view live slot memory.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<cuckoo_find_bs $b>](
                    keys: *const u64,
                    n: usize,
                    results: *mut bool,
                    table: Ref,
                ) {
                    // Safety: B divides 32 and the block is converged on entry.
                    let tile = unsafe { Tile::split($b) };
                    let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
                    let mut idx = thread::index_1d() as usize;
                    let rounds = (n + stride - 1) / stride;
                    for _ in 0..rounds {
                        // Safety: `idx < n` guarded; lanes own their index.
                        let my_key = if idx < n { unsafe { *keys.add(idx) } } else { 0 };
                        let mut pending = idx < n;
                        loop {
                            // Safety: converged tile.
                            let mask = unsafe { tile.ballot(pending) };
                            if mask == 0 {
                                break;
                            }
                            let leader = mask.trailing_zeros();
                            // Safety: converged tile, valid rank.
                            let key = unsafe { tile.shfl(my_key, leader) };
                            // Safety: converged B-wide tile.
                            let hit = unsafe { table.level().coop_find(&tile, key) };
                            if tile.rank() == leader {
                                // Safety: in-range index owned by this lane.
                                unsafe { *results.add(idx) = hit };
                                pending = false;
                            }
                        }
                        idx += stride;
                    }
                }

                /// Read pass of the sorted find-or-put: first occurrences
                /// learn `Found` or stay undecided.
                ///
                /// # Safety
                /// As for the put kernel; `keys` must be sorted.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<cuckoo_fop_pass1_bs $b>](
                    keys: *const u64,
                    n: usize,
                    results: *mut Outcome,
                    table: Ref,
                ) {
                    // Safety: B divides 32 and the block is converged on entry.
                    let tile = unsafe { Tile::split($b) };
                    let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
                    let mut idx = thread::index_1d() as usize;
                    let rounds = (n + stride - 1) / stride;
                    for _ in 0..rounds {
                        // Safety: forwarded pointer contracts.
                        let lead = unsafe { first_occurrence(keys, idx, n) };
                        unsafe {
                            elect_and_probe(&tile, idx, n, keys, results, lead, |tile, key| {
                                // Safety: converged B-wide tile.
                                if unsafe { table.level().coop_find(tile, key) } {
                                    Outcome::Found
                                } else {
                                    EMPTY
                                }
                            });
                        }
                        idx += stride;
                    }
                }

                /// Write pass of the sorted find-or-put: undecided first
                /// occurrences insert, every other occurrence coarsens to
                /// `Found`.
                ///
                /// # Safety
                /// As for the put kernel; `keys` must be sorted and pass 1
                /// must have completed.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<cuckoo_fop_pass2_bs $b>](
                    keys: *const u64,
                    n: usize,
                    results: *mut Outcome,
                    full_flag: *mut u32,
                    table: Ref,
                ) {
                    // Safety: B divides 32 and the block is converged on entry.
                    let tile = unsafe { Tile::split($b) };
                    let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
                    let mut idx = thread::index_1d() as usize;
                    let rounds = (n + stride - 1) / stride;
                    for _ in 0..rounds {
                        // Safety: forwarded pointer contracts.
                        let lead = unsafe { first_occurrence(keys, idx, n) };
                        let undecided = if idx < n {
                            if lead {
                                // Safety: in-range index owned by this lane.
                                unsafe { *results.add(idx) != Outcome::Found }
                            } else {
                                // Safety: as above.
                                unsafe { *results.add(idx) = Outcome::Found };
                                false
                            }
                        } else {
                            false
                        };
                        unsafe {
                            elect_and_probe(&tile, idx, n, keys, results, undecided, |tile, key| {
                                // Safety: converged B-wide tile.
                                let out = unsafe {
                                    table.level().coop_chain_put(tile, key, true, table.max_chain())
                                };
                                if out.is_full() {
                                    unsafe { raise_full_flag(full_flag) };
                                }
                                out
                            });
                        }
                        idx += stride;
                    }
                }
            }
        }
    };
    ($($b:tt),+ $(,)?) => {
        $( table_kernels!(@cuckoo $b); )+
    };
}
table_kernels!(16, 32);

mod iceberg_kernels {
    use super::*;
    use crate::iceberg::IcebergRef;
    use crate::permute::FeistelPermutation;

    type Ref = IcebergRef<u32, u32, FeistelPermutation, 32, 16, 1, 3>;

    const SUB_WIDTH: u32 = 16;

    fn outcome_from(raw: u64) -> Outcome {
        match raw {
            0 => Outcome::Found,
            1 => Outcome::Put,
            _ => Outcome::Full,
        }
    }

    /// The iceberg per-key insert: the primary hash on the full 32-lane
    /// tile, then the secondary cuckoo protocol on the low 16-lane
    /// subtile.
    ///
    /// Secondary buckets are half a tile wide, so only the low half runs
    /// the chain; the high lanes wait at the broadcast and pick up the
    /// outcome from lane zero. Running both halves would have them race
    /// each other on the same slot CAS.
    ///
    /// # Safety
    /// `tile` must be a converged 32-lane tile and `sub` the 16-lane
    /// partition containing this lane.
    unsafe fn put_one(tile: &Tile, sub: &Tile, table: &Ref, key: u64, avoid_dups: bool) -> Outcome {
        // Safety: converged 32-wide tile.
        match unsafe { table.primary().coop_claim_at(tile, 0, key, avoid_dups) } {
            Claim::Put => return Outcome::Put,
            Claim::Found => return Outcome::Found,
            Claim::BucketFull => {}
        }
        let raw = if tile.rank() < SUB_WIDTH {
            // Safety: the low lanes form a converged 16-wide subtile.
            let out =
                unsafe { table.secondary().coop_chain_put(sub, key, avoid_dups, table.max_chain()) };
            out as u8 as u64
        } else {
            0
        };
        // Safety: every lane of the full tile participates.
        outcome_from(unsafe { tile.shfl(raw, 0) })
    }

    /// The iceberg per-key lookup: a primary miss is inconclusive, the
    /// secondary decides. Same half-tile split as `put_one`.
    ///
    /// # Safety
    /// Same tile contract as `put_one`.
    unsafe fn find_one(tile: &Tile, sub: &Tile, table: &Ref, key: u64) -> bool {
        // Safety: converged 32-wide tile.
        if unsafe { table.primary().coop_probe_without_absence(tile, key) } {
            return true;
        }
        let raw = if tile.rank() < SUB_WIDTH {
            // Safety: the low lanes form a converged 16-wide subtile.
            u64::from(unsafe { table.secondary().coop_find(sub, key) })
        } else {
            0
        };
        // Safety: every lane of the full tile participates.
        unsafe { tile.shfl(raw, 0) != 0 }
    }

    /// Bulk insert.
    ///
    /// # Safety
    /// `keys` and `results` must be valid device pointers for `n`
    /// elements; `full_flag` must be a valid device pointer; `table` must
    /// view live slot memory for both levels.
    #[kernel]
    #[allow(improper_ctypes_definitions)]
    pub unsafe fn iceberg_put(
        keys: *const u64,
        n: usize,
        results: *mut Outcome,
        avoid_dups: u32,
        full_flag: *mut u32,
        table: Ref,
    ) {
        // Safety: both widths divide 32; the block is converged on entry.
        let tile = unsafe { Tile::split(32) };
        let sub = unsafe { Tile::split(16) };
        let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
        let mut idx = thread::index_1d() as usize;
        let rounds = (n + stride - 1) / stride;
        for _ in 0..rounds {
            // Safety: forwarded pointer contracts.
            unsafe {
                elect_and_probe(&tile, idx, n, keys, results, true, |tile, key| {
                    // Safety: tile contract established above.
                    let out = unsafe { put_one(tile, &sub, &table, key, avoid_dups != 0) };
                    if out.is_full() {
                        unsafe { raise_full_flag(full_flag) };
                    }
                    out
                });
            }
            idx += stride;
        }
    }

    /// Bulk membership test.
    ///
    /// # Safety
    /// `keys` and `results` must be valid device pointers for `n`
    /// elements; `table` must view live slot memory for both levels.
    #[kernel]
    #[allow(improper_ctypes_definitions)]
    pub unsafe fn iceberg_find(keys: *const u64, n: usize, results: *mut bool, table: Ref) {
        // Safety: both widths divide 32; the block is converged on entry.
        let tile = unsafe { Tile::split(32) };
        let sub = unsafe { Tile::split(16) };
        let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
        let mut idx = thread::index_1d() as usize;
        let rounds = (n + stride - 1) / stride;
        for _ in 0..rounds {
            // Safety: `idx < n` guarded before the read.
            let my_key = if idx < n { unsafe { *keys.add(idx) } } else { 0 };
            let mut pending = idx < n;
            loop {
                // Safety: converged tile.
                let mask = unsafe { tile.ballot(pending) };
                if mask == 0 {
                    break;
                }
                let leader = mask.trailing_zeros();
                // Safety: converged tile, valid rank.
                let key = unsafe { tile.shfl(my_key, leader) };
                // Safety: tile contract established above.
                let hit = unsafe { find_one(&tile, &sub, &table, key) };
                if tile.rank() == leader {
                    // Safety: in-range index owned by this lane.
                    unsafe { *results.add(idx) = hit };
                    pending = false;
                }
            }
            idx += stride;
        }
    }

    /// Read pass of find-or-put; works for sorted and unsorted input,
    /// the dedup (if any) happens in pass 2 through slot election.
    ///
    /// # Safety
    /// As for `iceberg_put`.
    #[kernel]
    #[allow(improper_ctypes_definitions)]
    pub unsafe fn iceberg_fop_pass1(keys: *const u64, n: usize, results: *mut Outcome, table: Ref) {
        // Safety: both widths divide 32; the block is converged on entry.
        let tile = unsafe { Tile::split(32) };
        let sub = unsafe { Tile::split(16) };
        let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
        let mut idx = thread::index_1d() as usize;
        let rounds = (n + stride - 1) / stride;
        for _ in 0..rounds {
            // Safety: forwarded pointer contracts.
            unsafe {
                elect_and_probe(&tile, idx, n, keys, results, true, |tile, key| {
                    // Safety: tile contract established above.
                    if unsafe { find_one(tile, &sub, &table, key) } {
                        Outcome::Found
                    } else {
                        EMPTY
                    }
                });
            }
            idx += stride;
        }
    }

    /// Write pass of find-or-put: every undecided occurrence runs the
    /// insert protocol with duplicate avoidance.
    ///
    /// # Safety
    /// As for `iceberg_put`; pass 1 must have completed.
    #[kernel]
    #[allow(improper_ctypes_definitions)]
    pub unsafe fn iceberg_fop_pass2(
        keys: *const u64,
        n: usize,
        results: *mut Outcome,
        full_flag: *mut u32,
        table: Ref,
    ) {
        // Safety: both widths divide 32; the block is converged on entry.
        let tile = unsafe { Tile::split(32) };
        let sub = unsafe { Tile::split(16) };
        let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
        let mut idx = thread::index_1d() as usize;
        let rounds = (n + stride - 1) / stride;
        for _ in 0..rounds {
            let undecided = if idx < n {
                // Safety: in-range index owned by this lane.
                unsafe { *results.add(idx) != Outcome::Found }
            } else {
                false
            };
            unsafe {
                elect_and_probe(&tile, idx, n, keys, results, undecided, |tile, key| {
                    // Safety: tile contract established above.
                    let out = unsafe { put_one(tile, &sub, &table, key, true) };
                    if out.is_full() {
                        unsafe { raise_full_flag(full_flag) };
                    }
                    out
                });
            }
            idx += stride;
        }
    }
}
