// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Node-local key-value store.
//!
//! Small, infrequently written control-plane state: shard placement entries,
//! STM snapshots. Values are opaque blobs; namespacing is by [`KeySpace`] so
//! subsystems cannot collide.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;

use crate::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeySpace {
    ShardPlacement,
    Stms,
    Archival,
}

impl KeySpace {
    fn dir_name(self) -> &'static str {
        match self {
            KeySpace::ShardPlacement => "shard_placement",
            KeySpace::Stms => "stms",
            KeySpace::Archival => "archival",
        }
    }
}

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, space: KeySpace, key: &[u8]) -> Option<Bytes>;

    async fn put(&self, space: KeySpace, key: Vec<u8>, value: Bytes) -> Result<(), StorageError>;

    async fn remove(&self, space: KeySpace, key: &[u8]) -> Result<(), StorageError>;

    /// All entries of a key space, in key order. Used for startup recovery.
    async fn list(&self, space: KeySpace) -> Result<Vec<(Vec<u8>, Bytes)>, StorageError>;
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemKvStore {
    data: Mutex<BTreeMap<(KeySpace, Vec<u8>), Bytes>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, space: KeySpace, key: &[u8]) -> Option<Bytes> {
        self.data
            .lock()
            .expect("lock poisoned")
            .get(&(space, key.to_vec()))
            .cloned()
    }

    async fn put(&self, space: KeySpace, key: Vec<u8>, value: Bytes) -> Result<(), StorageError> {
        self.data
            .lock()
            .expect("lock poisoned")
            .insert((space, key), value);
        Ok(())
    }

    async fn remove(&self, space: KeySpace, key: &[u8]) -> Result<(), StorageError> {
        self.data
            .lock()
            .expect("lock poisoned")
            .remove(&(space, key.to_vec()));
        Ok(())
    }

    async fn list(&self, space: KeySpace) -> Result<Vec<(Vec<u8>, Bytes)>, StorageError> {
        Ok(self
            .data
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|((s, _), _)| *s == space)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// File-backed store: one file per key under `{root}/{space}/`, written via
/// a temp file + rename so readers never observe a torn value.
#[derive(Debug)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileKvStore { root: root.into() }
    }

    fn key_path(&self, space: KeySpace, key: &[u8]) -> PathBuf {
        // Hex-encode so arbitrary key bytes map onto portable file names.
        let mut name = String::with_capacity(key.len() * 2);
        for b in key {
            name.push_str(&format!("{b:02x}"));
        }
        self.root.join(space.dir_name()).join(name)
    }

    fn decode_key(name: &str) -> Option<Vec<u8>> {
        if name.len() % 2 != 0 {
            return None;
        }
        (0..name.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&name[i..i + 2], 16).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, space: KeySpace, key: &[u8]) -> Option<Bytes> {
        tokio::fs::read(self.key_path(space, key))
            .await
            .ok()
            .map(Bytes::from)
    }

    async fn put(&self, space: KeySpace, key: Vec<u8>, value: Bytes) -> Result<(), StorageError> {
        let path = self.key_path(space, &key);
        let dir = path.parent().expect("key path has a parent");
        tokio::fs::create_dir_all(dir).await?;
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, space: KeySpace, key: &[u8]) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.key_path(space, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, space: KeySpace) -> Result<Vec<(Vec<u8>, Bytes)>, StorageError> {
        let dir = self.root.join(space.dir_name());
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Skip temp files from interrupted writes.
            let Some(key) = Self::decode_key(name) else { continue };
            let value = tokio::fs::read(entry.path()).await?;
            out.push((key, Bytes::from(value)));
        }
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KvStore) {
        let k = b"partition/3".to_vec();
        assert!(store.get(KeySpace::Stms, &k).await.is_none());
        store
            .put(KeySpace::Stms, k.clone(), Bytes::from_static(b"snap-a"))
            .await
            .unwrap();
        store
            .put(KeySpace::Stms, k.clone(), Bytes::from_static(b"snap-b"))
            .await
            .unwrap();
        assert_eq!(
            store.get(KeySpace::Stms, &k).await.unwrap(),
            Bytes::from_static(b"snap-b")
        );
        // Key spaces do not bleed into one another.
        assert!(store.get(KeySpace::ShardPlacement, &k).await.is_none());

        let listed = store.list(KeySpace::Stms).await.unwrap();
        assert_eq!(listed, vec![(k.clone(), Bytes::from_static(b"snap-b"))]);

        store.remove(KeySpace::Stms, &k).await.unwrap();
        assert!(store.get(KeySpace::Stms, &k).await.is_none());
        store.remove(KeySpace::Stms, &k).await.unwrap();
    }

    #[tokio::test]
    async fn mem_store_round_trip() {
        exercise(&MemKvStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileKvStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKvStore::new(dir.path());
            store
                .put(
                    KeySpace::ShardPlacement,
                    b"ntp".to_vec(),
                    Bytes::from_static(b"state"),
                )
                .await
                .unwrap();
        }
        let store = FileKvStore::new(dir.path());
        assert_eq!(
            store.get(KeySpace::ShardPlacement, b"ntp").await.unwrap(),
            Bytes::from_static(b"state")
        );
    }
}
