//! Slot storage: a zero-initializable array of row words mutated only
//! through per-slot atomics.
//!
//! The host side owns the allocation (`Slab`); a trivially copyable
//! `SlabRef` carries the raw pointer and length into device kernels, in
//! the same spirit as a bucket storage reference passed to CUDA code.
//! Host atomics go through `core::sync::atomic`; device atomics go
//! through the `cuda_std` mid-level intrinsics.

use core::marker::PhantomData;

use cust_core::DeviceCopy;

#[cfg(not(target_arch = "nvptx64"))]
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(target_arch = "nvptx64")]
use core::sync::atomic::Ordering;
#[cfg(target_arch = "nvptx64")]
use cuda_std::atomic::mid;

/// A word type usable as one table slot.
///
/// Rows are `u32` or `u64`; the choice fixes the physical row width of a
/// level. All slot traffic is relaxed: the protocol only ever compares
/// whole rows, and cross-slot ordering is provided by host-side
/// synchronization between bulk calls.
pub trait RowWord:
    Copy + PartialEq + Eq + core::fmt::Debug + Send + Sync + DeviceCopy + 'static
{
    /// Physical width of the row in bits.
    const BITS: u32;

    /// The matching host atomic cell.
    #[cfg(not(target_arch = "nvptx64"))]
    type Atomic: Send + Sync;

    /// Truncating conversion from the `u64` the codec works in.
    fn from_u64(v: u64) -> Self;

    /// Widening conversion into the `u64` the codec works in.
    fn to_u64(self) -> u64;

    #[cfg(not(target_arch = "nvptx64"))]
    fn atomic_zero() -> Self::Atomic;

    #[cfg(not(target_arch = "nvptx64"))]
    fn atomic_load(slot: &Self::Atomic) -> Self;

    #[cfg(not(target_arch = "nvptx64"))]
    fn atomic_store(slot: &Self::Atomic, v: Self);

    /// Single-slot compare-and-swap. Returns the previous value as
    /// `Ok`/`Err` depending on whether the swap happened.
    #[cfg(not(target_arch = "nvptx64"))]
    fn atomic_compare_exchange(slot: &Self::Atomic, current: Self, new: Self)
        -> Result<Self, Self>;

    /// Single-slot unconditional exchange. Returns the previous value.
    #[cfg(not(target_arch = "nvptx64"))]
    fn atomic_swap(slot: &Self::Atomic, v: Self) -> Self;

    /// Device-side relaxed load.
    ///
    /// # Safety
    /// `ptr` must be a valid, aligned pointer to initialized device memory.
    #[cfg(target_arch = "nvptx64")]
    unsafe fn device_load(ptr: *const Self) -> Self;

    /// Device-side relaxed compare-and-swap, returning the previous value.
    ///
    /// # Safety
    /// `ptr` must be a valid, aligned pointer to initialized device memory.
    #[cfg(target_arch = "nvptx64")]
    unsafe fn device_compare_exchange(ptr: *mut Self, current: Self, new: Self) -> Self;

    /// Device-side relaxed exchange, returning the previous value.
    ///
    /// # Safety
    /// `ptr` must be a valid, aligned pointer to initialized device memory.
    #[cfg(target_arch = "nvptx64")]
    unsafe fn device_swap(ptr: *mut Self, new: Self) -> Self;
}

macro_rules! impl_row_word {
    ($word:ty, $atomic:ty, $bits:expr, $load:ident, $cas:ident, $exch:ident) => {
        impl RowWord for $word {
            const BITS: u32 = $bits;

            #[cfg(not(target_arch = "nvptx64"))]
            type Atomic = $atomic;

            #[inline(always)]
            fn from_u64(v: u64) -> Self {
                debug_assert!(v <= <$word>::MAX as u64);
                v as $word
            }

            #[inline(always)]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[cfg(not(target_arch = "nvptx64"))]
            #[inline(always)]
            fn atomic_zero() -> Self::Atomic {
                <$atomic>::new(0)
            }

            #[cfg(not(target_arch = "nvptx64"))]
            #[inline(always)]
            fn atomic_load(slot: &Self::Atomic) -> Self {
                slot.load(Ordering::Relaxed)
            }

            #[cfg(not(target_arch = "nvptx64"))]
            #[inline(always)]
            fn atomic_store(slot: &Self::Atomic, v: Self) {
                slot.store(v, Ordering::Relaxed)
            }

            #[cfg(not(target_arch = "nvptx64"))]
            #[inline(always)]
            fn atomic_compare_exchange(
                slot: &Self::Atomic,
                current: Self,
                new: Self,
            ) -> Result<Self, Self> {
                slot.compare_exchange(current, new, Ordering::Relaxed, Ordering::Relaxed)
            }

            #[cfg(not(target_arch = "nvptx64"))]
            #[inline(always)]
            fn atomic_swap(slot: &Self::Atomic, v: Self) -> Self {
                slot.swap(v, Ordering::Relaxed)
            }

            #[cfg(target_arch = "nvptx64")]
            #[inline(always)]
            unsafe fn device_load(ptr: *const Self) -> Self {
                // Safety: forwarded to the caller, see trait docs.
                unsafe { mid::$load(ptr as *mut Self, Ordering::Relaxed) }
            }

            #[cfg(target_arch = "nvptx64")]
            #[inline(always)]
            unsafe fn device_compare_exchange(ptr: *mut Self, current: Self, new: Self) -> Self {
                // Safety: forwarded to the caller, see trait docs.
                unsafe { mid::$cas(ptr, current, new, Ordering::Relaxed) }
            }

            #[cfg(target_arch = "nvptx64")]
            #[inline(always)]
            unsafe fn device_swap(ptr: *mut Self, new: Self) -> Self {
                // Safety: forwarded to the caller, see trait docs.
                unsafe { mid::$exch(ptr, Ordering::Relaxed, new) }
            }
        }
    };
}

impl_row_word!(
    u32,
    AtomicU32,
    32,
    atomic_load_32_device,
    atomic_compare_and_swap_u32_device,
    atomic_exchange_u32_device
);
impl_row_word!(
    u64,
    AtomicU64,
    64,
    atomic_load_64_device,
    atomic_compare_and_swap_u64_device,
    atomic_exchange_u64_device
);

/// Host-owned slot array. Zeroed on construction; freed on drop, so every
/// exit path releases the backing memory.
#[cfg(not(target_arch = "nvptx64"))]
pub struct Slab<R: RowWord> {
    slots: Box<[R::Atomic]>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<R: RowWord> Slab<R> {
    /// Allocates `len` zeroed slots.
    pub fn new(len: usize) -> Self {
        let slots = (0..len).map(|_| R::atomic_zero()).collect();
        Slab { slots }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the slab has no slots at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Relaxed read of one slot.
    #[inline(always)]
    pub fn read(&self, index: usize) -> R {
        R::atomic_load(&self.slots[index])
    }

    /// Compare-and-swap on one slot.
    #[inline(always)]
    pub fn compare_exchange(&self, index: usize, current: R, new: R) -> Result<R, R> {
        R::atomic_compare_exchange(&self.slots[index], current, new)
    }

    /// Unconditional exchange on one slot, returning the previous row.
    #[inline(always)]
    pub fn swap(&self, index: usize, new: R) -> R {
        R::atomic_swap(&self.slots[index], new)
    }

    /// Rewrites every slot to the empty row.
    ///
    /// This is the whole-table clear; it is the only operation allowed to
    /// transition a slot from occupied back to empty.
    pub fn clear(&mut self) {
        for slot in self.slots.iter() {
            R::atomic_store(slot, R::from_u64(0));
        }
    }

    /// Number of occupied (non-zero) slots.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| R::atomic_load(s).to_u64() != 0)
            .count()
    }
}

/// Trivially copyable view of a slot array, for passing to device kernels
/// by value.
///
/// The embedding application allocates and zeroes the device memory (the
/// allocator is deliberately opaque to this crate) and builds the ref via
/// [`SlabRef::from_raw_parts`].
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SlabRef<R: RowWord> {
    slots: *mut R,
    len: usize,
    _marker: PhantomData<R>,
}

// Safety: SlabRef is a raw pointer plus a length; neither holds host-only
// state, so the bit pattern is meaningful on the device as long as the
// pointer targets device memory, which `from_raw_parts` requires.
unsafe impl<R: RowWord> DeviceCopy for SlabRef<R> {}

impl<R: RowWord> SlabRef<R> {
    /// Builds a slab view over raw memory.
    ///
    /// # Safety
    /// `slots` must point to at least `len` zero-initialized rows that stay
    /// valid and exclusively owned by table operations for the lifetime of
    /// the view.
    pub const unsafe fn from_raw_parts(slots: *mut R, len: usize) -> Self {
        SlabRef {
            slots,
            len,
            _marker: PhantomData,
        }
    }

    /// Number of slots.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the view covers no slots.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Relaxed read of one slot.
    #[cfg(target_arch = "nvptx64")]
    #[inline(always)]
    pub fn read(&self, index: usize) -> R {
        debug_assert!(index < self.len);
        // Safety: `from_raw_parts` guarantees `len` valid slots and `index`
        // is in bounds, so the pointer is valid and aligned for `R`.
        unsafe { R::device_load(self.slots.add(index)) }
    }

    /// Compare-and-swap on one slot, returning the previous row.
    #[cfg(target_arch = "nvptx64")]
    #[inline(always)]
    pub fn compare_exchange(&self, index: usize, current: R, new: R) -> R {
        debug_assert!(index < self.len);
        // Safety: same bounds argument as `read`.
        unsafe { R::device_compare_exchange(self.slots.add(index), current, new) }
    }

    /// Unconditional exchange on one slot, returning the previous row.
    #[cfg(target_arch = "nvptx64")]
    #[inline(always)]
    pub fn swap(&self, index: usize, new: R) -> R {
        debug_assert!(index < self.len);
        // Safety: same bounds argument as `read`.
        unsafe { R::device_swap(self.slots.add(index), new) }
    }
}
