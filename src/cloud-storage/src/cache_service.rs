// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cache folder for downloaded segments.
//!
//! Remote reads land segment files under a local cache directory. The
//! [`AccessTimeTracker`] remembers when each file was last touched, and
//! trimming deletes the coldest files first until the folder fits its
//! budget. The tracker's hash collisions make its estimates approximate;
//! the trim walk re-checks the filesystem before every delete, so an
//! estimate that lies only costs eviction-order accuracy, never
//! correctness.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use shoal_base::codec::Codec;
use shoal_model::Timestamp;
use tracing::{debug, warn};

use crate::access_time_tracker::AccessTimeTracker;
use crate::CloudStorageError;

const TRACKER_FILE: &str = "accesstime";

#[derive(Debug)]
pub struct CacheService {
    dir: PathBuf,
    tracker: Mutex<AccessTimeTracker>,
}

impl CacheService {
    /// Opens the cache folder, restoring the tracker blob if one was
    /// persisted. A corrupt tracker is discarded; it is advisory state.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CloudStorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CloudStorageError::TransientIo(e.to_string()))?;
        let tracker = match tokio::fs::read(dir.join(TRACKER_FILE)).await {
            Ok(bytes) => match AccessTimeTracker::decode(&bytes) {
                Ok(t) => t,
                Err(e) => {
                    warn!(%e, "dropping corrupt access-time tracker");
                    AccessTimeTracker::new()
                }
            },
            Err(_) => AccessTimeTracker::new(),
        };
        Ok(CacheService {
            dir,
            tracker: Mutex::new(tracker),
        })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Stores a downloaded object and stamps its access time.
    pub async fn put(&self, name: &str, bytes: Bytes) -> Result<(), CloudStorageError> {
        let path = self.file_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CloudStorageError::TransientIo(e.to_string()))?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| CloudStorageError::TransientIo(e.to_string()))?;
        self.tracker
            .lock()
            .expect("lock poisoned")
            .add_timestamp(name, Timestamp::now());
        Ok(())
    }

    /// Reads a cached object, refreshing its access time on hit.
    pub async fn get(&self, name: &str) -> Option<Bytes> {
        match tokio::fs::read(self.file_path(name)).await {
            Ok(bytes) => {
                self.tracker
                    .lock()
                    .expect("lock poisoned")
                    .add_timestamp(name, Timestamp::now());
                Some(Bytes::from(bytes))
            }
            Err(_) => None,
        }
    }

    /// Total bytes of cached files.
    pub async fn size_bytes(&self) -> u64 {
        let mut total = 0;
        for (_, size) in self.walk().await {
            total += size;
        }
        total
    }

    /// Deletes coldest-first until the folder holds at most `target_bytes`.
    /// Returns the number of files removed.
    pub async fn trim(&self, target_bytes: u64) -> Result<usize, CloudStorageError> {
        let mut files = self.walk().await;
        let mut total: u64 = files.iter().map(|(_, size)| *size).sum();
        // Oldest first; files the tracker has no estimate for are treated
        // as the coldest of all.
        files.sort_by_key(|(name, _)| {
            self.tracker
                .lock()
                .expect("lock poisoned")
                .estimate_timestamp(name)
                .unwrap_or(Timestamp(0))
        });
        let mut removed = 0;
        for (name, size) in files {
            if total <= target_bytes {
                break;
            }
            let path = self.file_path(&name);
            // The tracker estimate may describe a hash collider; only act
            // on files that are really there.
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(%name, size, "trimmed cache file");
                    total = total.saturating_sub(size);
                    removed += 1;
                    self.tracker
                        .lock()
                        .expect("lock poisoned")
                        .remove_timestamp(&name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.tracker
                        .lock()
                        .expect("lock poisoned")
                        .remove_timestamp(&name);
                }
                Err(e) => return Err(CloudStorageError::TransientIo(e.to_string())),
            }
        }
        self.sync_tracker().await?;
        Ok(removed)
    }

    /// Persists the tracker blob next to the cached files, if dirty.
    pub async fn sync_tracker(&self) -> Result<(), CloudStorageError> {
        let bytes = {
            let mut tracker = self.tracker.lock().expect("lock poisoned");
            if !tracker.is_dirty() {
                return Ok(());
            }
            let bytes = tracker.encode_to_vec();
            tracker.mark_clean();
            bytes
        };
        tokio::fs::write(self.dir.join(TRACKER_FILE), bytes)
            .await
            .map_err(|e| CloudStorageError::TransientIo(e.to_string()))?;
        Ok(())
    }

    /// Drops tracker entries for files that no longer exist.
    pub async fn reconcile_tracker(&self) {
        let mut walk = AccessTimeTracker::new();
        for (name, _) in self.walk().await {
            walk.add_timestamp(&name, Timestamp(0));
        }
        self.tracker
            .lock()
            .expect("lock poisoned")
            .remove_others(&walk);
    }

    /// Lists cached files as (relative name, size), excluding the tracker
    /// blob itself.
    async fn walk(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        let mut stack = vec![self.dir.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(name) = relative_name(&self.dir, &path) else {
                    continue;
                };
                if name == TRACKER_FILE {
                    continue;
                }
                out.push((name, meta.len()));
            }
        }
        out
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .and_then(|p| p.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheService::open(dir.path()).await.unwrap();
        cache
            .put("ns/topic/0_1/10-1-v3.log.2", Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert_eq!(
            cache.get("ns/topic/0_1/10-1-v3.log.2").await,
            Some(Bytes::from_static(b"data"))
        );
        assert_eq!(cache.get("missing").await, None);
        assert_eq!(cache.size_bytes().await, 4);
    }

    #[tokio::test]
    async fn trim_deletes_coldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheService::open(dir.path()).await.unwrap();
        cache.put("old.log", Bytes::from(vec![0u8; 100])).await.unwrap();
        cache.put("mid.log", Bytes::from(vec![0u8; 100])).await.unwrap();
        cache.put("hot.log", Bytes::from(vec![0u8; 100])).await.unwrap();
        // Order the stamps explicitly; wall-clock puts land within the same
        // second.
        {
            let mut tracker = cache.tracker.lock().unwrap();
            tracker.add_timestamp("old.log", Timestamp(1_000));
            tracker.add_timestamp("mid.log", Timestamp(2_000));
            tracker.add_timestamp("hot.log", Timestamp(3_000));
        }

        let removed = cache.trim(150).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("old.log").await, None);
        assert_eq!(cache.get("mid.log").await, None);
        assert!(cache.get("hot.log").await.is_some());
    }

    #[tokio::test]
    async fn tracker_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheService::open(dir.path()).await.unwrap();
            cache.put("a.log", Bytes::from_static(b"x")).await.unwrap();
            cache.sync_tracker().await.unwrap();
        }
        let cache = CacheService::open(dir.path()).await.unwrap();
        let estimate = cache
            .tracker
            .lock()
            .unwrap()
            .estimate_timestamp("a.log");
        assert!(estimate.is_some());
    }

    #[tokio::test]
    async fn reconcile_drops_stamps_of_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheService::open(dir.path()).await.unwrap();
        cache.put("a.log", Bytes::from_static(b"x")).await.unwrap();
        cache.put("b.log", Bytes::from_static(b"y")).await.unwrap();
        tokio::fs::remove_file(dir.path().join("b.log")).await.unwrap();

        cache.reconcile_tracker().await;
        let tracker = cache.tracker.lock().unwrap();
        assert!(tracker.estimate_timestamp("a.log").is_some());
        assert!(tracker.estimate_timestamp("b.log").is_none());
    }
}
