//! Zero-sized hash builder for the store's internal lookup tables.
//!
//! Action tables, emitter channels and the per-action "latest task" map are
//! keyed by short names that never come from an adversary, so HashDoS
//! resistance is not needed and foldhash with a fixed seed is used instead.

use std::collections::HashMap;
use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized BuildHasher that uses foldhash with a fixed seed.
///
/// # Properties
/// - Zero-sized (`size_of::<FastHashBuilder>()` == 0)
/// - Deterministic (same input = same hash across all instances)
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517cc1b727220a95).build_hasher()
    }
}

/// HashMap using [`FastHashBuilder`]
pub type FastHashMap<K, V> = HashMap<K, V, FastHashBuilder>;
