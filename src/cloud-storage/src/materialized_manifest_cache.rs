// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A byte-budgeted LRU of materialized spillover manifests.
//!
//! Hydrating a spillover shard costs an object-store GET plus a decode, so
//! materialized shards are kept under a byte budget with LRU eviction. The
//! twist is pinning: readers hold [`PinnedManifest`] handles, and a pinned
//! entry must not be evicted no matter how cold it is. Space is therefore
//! acquired in two steps: [`MaterializedManifestCache::prepare`] reserves
//! bytes (waiting, if necessary, for pins on the eviction candidates to be
//! released) and `put` consumes the reservation.
//!
//! Entries selected for eviction while still pinned move to a rollback list:
//! they stay readable and keep counting against `size_bytes`, and either get
//! reaped when their last pin drops or return to the LRU if the reservation
//! times out. A timed-out `prepare` therefore never corrupts the cache.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shoal_config::{Binding, ShrinkWakeupPolicy};
use shoal_model::Offset;
use tokio::sync::Notify;

use crate::spillover_manifest::SpilloverManifest;
use crate::CloudStorageError;

#[derive(Debug)]
struct Entry {
    manifest: Arc<SpilloverManifest>,
    size_bytes: u64,
    pins: usize,
    evicting: bool,
}

#[derive(Debug)]
struct CacheState {
    capacity: u64,
    entries: BTreeMap<i64, Entry>,
    /// Keys in LRU order, least recent at the front. Evicting keys live on
    /// `rollback` instead.
    lru: VecDeque<i64>,
    /// Keys marked as eviction candidates, in their original LRU order.
    rollback: Vec<i64>,
    /// Bytes promised to reservations not yet consumed by `put`.
    reserved: u64,
}

impl CacheState {
    /// Bytes held by entries (live and rollback) plus outstanding
    /// reservations.
    fn occupied(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum::<u64>() + self.reserved
    }

    fn fits(&self, bytes: u64) -> bool {
        // An oversized manifest must still be readable: a reservation larger
        // than the whole budget is granted once the cache is drained.
        self.occupied() + bytes <= self.capacity
            || (self.entries.is_empty() && self.reserved == 0)
    }

    /// Reaps eviction candidates whose pins are gone.
    fn evict_unpinned_marked(&mut self) {
        let keys: Vec<i64> = self.rollback.clone();
        for key in keys {
            let remove = matches!(self.entries.get(&key), Some(e) if e.evicting && e.pins == 0);
            if remove {
                self.entries.remove(&key);
                self.rollback.retain(|k| *k != key);
            }
        }
    }

    /// Marks LRU-tail entries as eviction candidates until `deficit` bytes
    /// are pending reclamation.
    fn mark_candidates(&mut self, deficit: u64) {
        let mut pending: u64 = self
            .rollback
            .iter()
            .filter_map(|k| self.entries.get(k))
            .map(|e| e.size_bytes)
            .sum();
        while pending < deficit {
            let Some(key) = self.lru.pop_front() else {
                break;
            };
            let entry = self.entries.get_mut(&key).expect("lru key has an entry");
            entry.evicting = true;
            pending += entry.size_bytes;
            self.rollback.push(key);
        }
    }

    /// Returns rollback candidates to the LRU, coldest first. Entries
    /// already reaped stay gone.
    fn restore_rollback(&mut self) {
        for key in std::mem::take(&mut self.rollback).into_iter().rev() {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.evicting = false;
                self.lru.push_front(key);
            }
        }
    }

    fn touch(&mut self, key: i64) {
        if let Some(pos) = self.lru.iter().position(|k| *k == key) {
            self.lru.remove(pos);
            self.lru.push_back(key);
        }
    }
}

#[derive(Debug)]
struct CacheShared {
    state: Mutex<CacheState>,
    /// Signaled on pin release, entry removal and capacity growth.
    release: Notify,
    /// Serializes `prepare` calls; tokio mutexes queue FIFO, which gives
    /// reservations their arrival-order service guarantee.
    prepare_queue: tokio::sync::Mutex<()>,
}

impl CacheShared {
    fn unpin(&self, key: i64) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.pins -= 1;
            if entry.pins == 0 && entry.evicting {
                state.entries.remove(&key);
                state.rollback.retain(|k| *k != key);
            }
        }
        drop(state);
        self.release.notify_waiters();
    }
}

/// A reservation of cache space produced by `prepare` and consumed by
/// `put`. Dropping it unconsumed returns the bytes.
#[derive(Debug)]
pub struct CacheReservation {
    shared: Arc<CacheShared>,
    bytes: u64,
    consumed: bool,
}

impl CacheReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for CacheReservation {
    fn drop(&mut self) {
        if !self.consumed {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.reserved -= self.bytes;
            drop(state);
            self.shared.release.notify_waiters();
        }
    }
}

/// A pinning handle to a cached manifest. While any handle is live the
/// entry cannot be evicted; dropping the last handle of an entry marked for
/// eviction removes it.
#[derive(Debug)]
pub struct PinnedManifest {
    shared: Arc<CacheShared>,
    key: i64,
    manifest: Arc<SpilloverManifest>,
}

impl std::ops::Deref for PinnedManifest {
    type Target = SpilloverManifest;

    fn deref(&self) -> &SpilloverManifest {
        &self.manifest
    }
}

impl Drop for PinnedManifest {
    fn drop(&mut self) {
        self.shared.unpin(self.key);
    }
}

#[derive(Debug)]
pub struct MaterializedManifestCache {
    shared: Arc<CacheShared>,
    shrink_policy: Binding<ShrinkWakeupPolicy>,
}

impl MaterializedManifestCache {
    pub fn new(capacity: u64, shrink_policy: Binding<ShrinkWakeupPolicy>) -> Self {
        MaterializedManifestCache {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    capacity,
                    entries: BTreeMap::new(),
                    lru: VecDeque::new(),
                    rollback: Vec::new(),
                    reserved: 0,
                }),
                release: Notify::new(),
                prepare_queue: tokio::sync::Mutex::new(()),
            }),
            shrink_policy,
        }
    }

    /// Number of cached manifests, eviction candidates included.
    pub fn size(&self) -> usize {
        self.shared.state.lock().expect("lock poisoned").entries.len()
    }

    /// Bytes held by cached manifests, eviction candidates included.
    pub fn size_bytes(&self) -> u64 {
        let state = self.shared.state.lock().expect("lock poisoned");
        state.entries.values().map(|e| e.size_bytes).sum()
    }

    pub fn capacity(&self) -> u64 {
        self.shared.state.lock().expect("lock poisoned").capacity
    }

    /// Reserves `bytes` of budget, evicting cold entries as needed.
    ///
    /// Completes immediately when the bytes fit. Otherwise LRU-tail entries
    /// are marked as eviction candidates and the call waits until enough
    /// pins are released, the capacity grows, or `timeout` elapses. On
    /// timeout the candidates are restored and the cache is exactly as
    /// before.
    pub async fn prepare(
        &self,
        bytes: u64,
        timeout: Option<Duration>,
    ) -> Result<CacheReservation, CloudStorageError> {
        let _queued = self.shared.prepare_queue.lock().await;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.shared.release.notified();
            tokio::pin!(notified);
            {
                let mut state = self.shared.state.lock().expect("lock poisoned");
                state.evict_unpinned_marked();
                if !state.fits(bytes) {
                    let deficit = (state.occupied() + bytes).saturating_sub(state.capacity);
                    state.mark_candidates(deficit);
                    state.evict_unpinned_marked();
                }
                if state.fits(bytes) {
                    state.reserved += bytes;
                    return Ok(CacheReservation {
                        shared: Arc::clone(&self.shared),
                        bytes,
                        consumed: false,
                    });
                }
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, &mut notified).await.is_err() {
                        let mut state = self.shared.state.lock().expect("lock poisoned");
                        state.restore_rollback();
                        return Err(CloudStorageError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Inserts a manifest at the most-recently-used position, consuming the
    /// reservation. The entry is keyed by the manifest's start offset.
    pub fn put(&self, mut reservation: CacheReservation, manifest: SpilloverManifest) {
        let key = manifest
            .manifest()
            .start_offset()
            .expect("spillover manifest can't be empty")
            .0;
        let mut state = self.shared.state.lock().expect("lock poisoned");
        state.reserved -= reservation.bytes;
        if state.entries.contains_key(&key) {
            state.lru.retain(|k| *k != key);
            state.rollback.retain(|k| *k != key);
        }
        state.entries.insert(
            key,
            Entry {
                manifest: Arc::new(manifest),
                size_bytes: reservation.bytes,
                pins: 0,
                evicting: false,
            },
        );
        state.lru.push_back(key);
        reservation.consumed = true;
    }

    /// Returns a pinning handle, promoting the entry. Entries on the
    /// rollback list remain accessible but are not promoted.
    pub fn get(&self, start_offset: Offset) -> Option<PinnedManifest> {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        let key = start_offset.0;
        let entry = state.entries.get_mut(&key)?;
        entry.pins += 1;
        let manifest = Arc::clone(&entry.manifest);
        let evicting = entry.evicting;
        if !evicting {
            state.touch(key);
        }
        Some(PinnedManifest {
            shared: Arc::clone(&self.shared),
            key,
            manifest,
        })
    }

    /// Marks an entry as recently used without producing a handle.
    pub fn promote(&self, start_offset: Offset) {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        state.touch(start_offset.0);
    }

    /// Removes an entry. A pinned entry becomes obsolete-on-release: it
    /// disappears when its last pin drops.
    pub fn remove(&self, start_offset: Offset) {
        let key = start_offset.0;
        let mut state = self.shared.state.lock().expect("lock poisoned");
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        if entry.pins == 0 {
            state.entries.remove(&key);
            state.lru.retain(|k| *k != key);
            state.rollback.retain(|k| *k != key);
        } else {
            entry.evicting = true;
            state.lru.retain(|k| *k != key);
            if !state.rollback.contains(&key) {
                state.rollback.push(key);
            }
        }
        drop(state);
        self.shared.release.notify_waiters();
    }

    /// Changes the byte budget. Shrinking evicts from the LRU tail until
    /// the cache fits (ordering with respect to pending `prepare` waiters
    /// follows the configured shrink wakeup policy); growing wakes waiters.
    pub fn set_capacity(&self, bytes: u64) {
        let policy = self.shrink_policy.get();
        {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.capacity = bytes;
            if policy == ShrinkWakeupPolicy::Immediate {
                self.shared.release.notify_waiters();
            }
            while state.occupied() > state.capacity {
                let Some(key) = state.lru.pop_front() else {
                    break;
                };
                let entry = state.entries.get_mut(&key).expect("lru key has an entry");
                if entry.pins == 0 {
                    state.entries.remove(&key);
                } else {
                    entry.evicting = true;
                    state.rollback.push(key);
                }
            }
        }
        self.shared.release.notify_waiters();
    }
}
