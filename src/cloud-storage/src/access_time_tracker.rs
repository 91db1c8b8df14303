// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;

use shoal_model::Timestamp;
use xxhash_rust::xxh32::xxh32;

/// Tracks when each downloaded cache file was last accessed.
///
/// The table maps a 32-bit hash of the file path to a 32-bit
/// seconds-since-epoch stamp, which keeps the persisted blob small at any
/// cache size. Collisions are tolerated by design: a colliding
/// `add_timestamp` overwrites the other key, so the surviving stamp may be
/// larger than either file's true access time, and deleting one collider
/// forgets both. The cache-folder eviction re-verifies file presence before
/// acting, which makes both effects harmless.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccessTimeTracker {
    table: BTreeMap<u32, u32>,
    dirty: bool,
}

impl AccessTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_table(table: BTreeMap<u32, u32>) -> Self {
        AccessTimeTracker {
            table,
            dirty: false,
        }
    }

    pub(crate) fn table(&self) -> &BTreeMap<u32, u32> {
        &self.table
    }

    fn hash(key: &str) -> u32 {
        xxh32(key.as_bytes(), 0)
    }

    fn to_secs(ts: Timestamp) -> u32 {
        u32::try_from(ts.as_millis() / 1000).unwrap_or(u32::MAX)
    }

    /// Records an access at `ts`.
    pub fn add_timestamp(&mut self, key: &str, ts: Timestamp) {
        self.table.insert(Self::hash(key), Self::to_secs(ts));
        self.dirty = true;
    }

    /// Forgets a key (and, under collision, its collider).
    pub fn remove_timestamp(&mut self, key: &str) {
        if self.table.remove(&Self::hash(key)).is_some() {
            self.dirty = true;
        }
    }

    /// Last-access estimate for `key`. Under collision the estimate may
    /// belong to the colliding path and be larger than the truth.
    pub fn estimate_timestamp(&self, key: &str) -> Option<Timestamp> {
        self.table
            .get(&Self::hash(key))
            .map(|secs| Timestamp(i64::from(*secs) * 1000))
    }

    /// Retains only the keys also present in `other`. Used after a cache
    /// walk to drop stamps for files that no longer exist.
    pub fn remove_others(&mut self, other: &AccessTimeTracker) {
        let before = self.table.len();
        self.table.retain(|k, _| other.table.contains_key(k));
        if self.table.len() != before {
            self.dirty = true;
        }
    }

    /// True when the tracker holds changes not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the current contents as persisted.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use shoal_base::codec::Codec;

    use super::*;

    #[test]
    fn add_estimate_remove() {
        let mut t = AccessTimeTracker::new();
        assert!(t.estimate_timestamp("a.log").is_none());
        t.add_timestamp("a.log", Timestamp(12_000));
        assert_eq!(t.estimate_timestamp("a.log"), Some(Timestamp(12_000)));
        assert!(t.is_dirty());
        t.remove_timestamp("a.log");
        assert!(t.estimate_timestamp("a.log").is_none());
    }

    #[test]
    fn sub_second_precision_is_dropped() {
        let mut t = AccessTimeTracker::new();
        t.add_timestamp("a.log", Timestamp(12_789));
        assert_eq!(t.estimate_timestamp("a.log"), Some(Timestamp(12_000)));
    }

    #[test]
    fn remove_others_retains_intersection() {
        let mut t = AccessTimeTracker::new();
        t.add_timestamp("a.log", Timestamp(1_000));
        t.add_timestamp("b.log", Timestamp(2_000));
        t.add_timestamp("c.log", Timestamp(3_000));

        let mut walk = AccessTimeTracker::new();
        walk.add_timestamp("a.log", Timestamp(9_000));
        walk.add_timestamp("c.log", Timestamp(9_000));

        t.remove_others(&walk);
        assert_eq!(t.len(), 2);
        assert_eq!(t.estimate_timestamp("a.log"), Some(Timestamp(1_000)));
        assert!(t.estimate_timestamp("b.log").is_none());
    }

    #[test]
    fn dirty_flag_follows_persistence() {
        let mut t = AccessTimeTracker::new();
        t.add_timestamp("a.log", Timestamp(1_000));
        assert!(t.is_dirty());
        let bytes = t.encode_to_vec();
        t.mark_clean();
        assert!(!t.is_dirty());

        let restored = AccessTimeTracker::decode(&bytes).unwrap();
        assert!(!restored.is_dirty());
        assert_eq!(restored.estimate_timestamp("a.log"), Some(Timestamp(1_000)));
    }
}
