//! Capacity reclamation for the per-flow tables.
//!
//! `HashMap` keeps its allocation after entries are removed, so a traffic burst
//! leaves the cache and dedup tables sized for the peak forever. When forced
//! reclamation is enabled the owning stage asks [`ShrinkPolicy`] after each sweep
//! whether the table is worth shrinking.

use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash},
};

/// Shrink when `capacity > entries * (numerator / denominator)` and capacity is
/// above `min_capacity`.
///
/// The default ratio is 23/8 (2.875x). hashbrown grows at a 7/8 load factor, so
/// right after a resize capacity is about 2x entries; 2.875x only trips once a
/// meaningful share of entries has gone, which avoids shrink/grow thrashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkPolicy {
    pub min_capacity: usize,
    pub waste_ratio_numerator: usize,
    pub waste_ratio_denominator: usize,
}

impl ShrinkPolicy {
    /// Policy for the accounting cache and dedup tables.
    pub const fn flow_tables() -> Self {
        Self {
            min_capacity: 1_024,
            waste_ratio_numerator: 23,
            waste_ratio_denominator: 8,
        }
    }

    /// ```
    /// use flowkeeper::runtime::memory::ShrinkPolicy;
    ///
    /// let policy = ShrinkPolicy::flow_tables();
    /// assert!(!policy.should_shrink(512, 0));
    /// assert!(policy.should_shrink(100_000, 10_000));
    /// assert!(!policy.should_shrink(100_000, 90_000));
    /// ```
    pub const fn should_shrink(&self, capacity: usize, entries: usize) -> bool {
        if capacity <= self.min_capacity {
            return false;
        }
        capacity * self.waste_ratio_denominator >= entries * self.waste_ratio_numerator
    }

    /// Shrinks `map` if the policy says so. Returns whether it did.
    pub fn reclaim<K, V, S>(&self, map: &mut HashMap<K, V, S>) -> bool
    where
        K: Eq + Hash,
        S: BuildHasher,
    {
        if !self.should_shrink(map.capacity(), map.len()) {
            return false;
        }
        map.shrink_to_fit();
        true
    }
}

impl Default for ShrinkPolicy {
    fn default() -> Self {
        Self::flow_tables()
    }
}
