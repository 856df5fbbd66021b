//! Per-key operation results and the process-wide capacity-failure flag.

use cust_core::DeviceCopy;

#[cfg(not(target_arch = "nvptx64"))]
use core::sync::atomic::{AtomicBool, Ordering};

/// Result of one per-key table operation.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// The key was already present.
    Found = 0,
    /// The key was inserted by this operation.
    Put = 1,
    /// The key could not be placed: the eviction chain hit its bound or
    /// the overflow level rejected it. Soft failure, surfaced per key.
    Full = 2,
}

/// Internal scratch state for the two-pass find-or-put: "nothing decided
/// yet". It deliberately shares the wire value of [`Outcome::Put`]; the
/// second pass distinguishes the two by re-running the protocol.
pub(crate) const EMPTY: Outcome = Outcome::Put;

// Safety: Outcome is a fieldless repr(u8) enum, trivially copyable with no
// host references, so its bit pattern is valid device data.
unsafe impl DeviceCopy for Outcome {}

impl Outcome {
    #[inline]
    pub fn is_found(self) -> bool {
        self == Outcome::Found
    }

    #[inline]
    pub fn is_put(self) -> bool {
        self == Outcome::Put
    }

    #[inline]
    pub fn is_full(self) -> bool {
        self == Outcome::Full
    }
}

impl From<Outcome> for u8 {
    fn from(o: Outcome) -> u8 {
        o as u8
    }
}

/// Did any operation since the last [`reset_full_flag`] produce
/// [`Outcome::Full`]?
///
/// This is a single process-wide flag written with relaxed ordering from
/// every worker. It exists so bulk ingest loops can skip scanning the
/// result array in the common all-fit case.
///
/// **The flag is not safe for concurrent independent operations.** Its
/// only supported lifecycle is: reset, run one bulk call (or one serial
/// sequence of calls), read, discard. Callers that interleave unrelated
/// bulk operations must rely on their own result buffers instead.
#[cfg(not(target_arch = "nvptx64"))]
static FULL_OBSERVED: AtomicBool = AtomicBool::new(false);

/// Clears the process-wide failure flag. Call before the bulk operation
/// whose failures you want to observe.
#[cfg(not(target_arch = "nvptx64"))]
pub fn reset_full_flag() {
    FULL_OBSERVED.store(false, Ordering::Relaxed);
}

/// Reads the process-wide failure flag. Only meaningful after the bulk
/// call it covers has completed.
#[cfg(not(target_arch = "nvptx64"))]
pub fn full_observed() -> bool {
    FULL_OBSERVED.load(Ordering::Relaxed)
}

#[cfg(not(target_arch = "nvptx64"))]
#[inline]
pub(crate) fn note_outcome(outcome: Outcome) -> Outcome {
    if outcome.is_full() {
        FULL_OBSERVED.store(true, Ordering::Relaxed);
    }
    outcome
}
