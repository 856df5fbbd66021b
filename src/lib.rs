//! Compact parallel hash tables: bucketed cuckoo and two-level iceberg
//! tables that store keys in fewer bits than the key width.
//!
//! Keys are pushed through an invertible keyed permutation; the low bits
//! of the image select a bucket and only the high bits (plus a small
//! state tag naming the hash function) are stored in the slot. The
//! bucket address carries the rest, so evicted slots decode back to full
//! keys through the inverse permutation.
//!
//! The crate compiles for two worlds:
//! - On the host it is a regular library: tables own their slot slabs,
//!   bulk operations fan out over a thread pool and the cooperative tile
//!   protocol is rendered with software ballots over per-slot atomics.
//! - On `nvptx64-nvidia-cuda` it is a kernels crate: the same protocol
//!   runs per warp tile with real ballots and shuffles, and bulk entry
//!   points are exported as `#[kernel]` functions. The embedding
//!   application owns device allocation and kernel launches.

#![cfg_attr(target_arch = "nvptx64", no_std)]

pub mod bits;
pub mod cuckoo;
pub mod iceberg;
pub mod level;
pub mod outcome;
pub mod permute;
pub mod slab;

#[cfg(not(target_arch = "nvptx64"))]
pub mod dispatch;
#[cfg(not(target_arch = "nvptx64"))]
pub mod error;

#[cfg(target_arch = "nvptx64")]
pub mod device;

pub use cuckoo::{CuckooRef, DEFAULT_CHAIN_FACTOR};
pub use iceberg::IcebergRef;
pub use level::{Coding, LevelRef};
pub use outcome::Outcome;
pub use permute::{Bijection, FeistelPermutation};
pub use slab::{RowWord, SlabRef};

#[cfg(not(target_arch = "nvptx64"))]
pub use cuckoo::CuckooTable;
#[cfg(not(target_arch = "nvptx64"))]
pub use error::TableError;
#[cfg(not(target_arch = "nvptx64"))]
pub use iceberg::IcebergTable;
#[cfg(not(target_arch = "nvptx64"))]
pub use outcome::{full_observed, reset_full_flag};
#[cfg(not(target_arch = "nvptx64"))]
pub use slab::Slab;
