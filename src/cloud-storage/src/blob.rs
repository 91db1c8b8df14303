// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The object-store abstraction.
//!
//! PUT/GET/LIST/DELETE over opaque blobs keyed by strings, all idempotent.
//! [`MemBlob`] keeps everything in a map and can inject transient faults,
//! which is what the retry-path tests run against; production talks to S3
//! through [`crate::S3Blob`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

/// Errors of the raw blob layer. `Transient` is retryable at the caller's
/// discretion; everything the retry budget cannot absorb surfaces as-is.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("transient object-store failure: {0}")]
    Transient(String),
    #[error("object-store failure: {0}")]
    Permanent(String),
}

/// Metadata of one listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub size_bytes: u64,
}

#[async_trait::async_trait]
pub trait Blob: Send + Sync + 'static {
    /// Returns the object, or `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError>;

    /// Creates or replaces the object. Idempotent.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), BlobError>;

    /// Lists objects under a key prefix, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobError>;

    /// Deletes the given keys. Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<(), BlobError>;
}

/// In-memory [`Blob`] for tests. `fail_next` makes the next N operations
/// fail with a transient error, exercising retry paths.
#[derive(Debug, Default)]
pub struct MemBlob {
    data: Mutex<BTreeMap<String, Bytes>>,
    fail_next: AtomicUsize,
}

impl MemBlob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranges for the next `n` operations to fail transiently.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.data
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn maybe_fail(&self) -> Result<(), BlobError> {
        let prev = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            Err(BlobError::Transient("injected fault".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Blob for MemBlob {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        self.maybe_fail()?;
        Ok(self.data.lock().expect("lock poisoned").get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), BlobError> {
        self.maybe_fail()?;
        self.data
            .lock()
            .expect("lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobError> {
        self.maybe_fail()?;
        Ok(self
            .data
            .lock()
            .expect("lock poisoned")
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| BlobMeta {
                key: k.clone(),
                size_bytes: v.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BlobError> {
        self.maybe_fail()?;
        let mut data = self.data.lock().expect("lock poisoned");
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_blob_crud() {
        let blob = MemBlob::new();
        assert_eq!(blob.get("a/b").await.unwrap(), None);
        blob.put("a/b", Bytes::from_static(b"one")).await.unwrap();
        blob.put("a/c", Bytes::from_static(b"two")).await.unwrap();
        blob.put("z", Bytes::from_static(b"three")).await.unwrap();
        assert_eq!(blob.get("a/b").await.unwrap(), Some(Bytes::from_static(b"one")));

        let listed = blob.list("a/").await.unwrap();
        assert_eq!(
            listed.iter().map(|m| m.key.as_str()).collect::<Vec<_>>(),
            vec!["a/b", "a/c"]
        );
        assert_eq!(listed[0].size_bytes, 3);

        blob.delete(&["a/b".into(), "missing".into()]).await.unwrap();
        assert_eq!(blob.get("a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_faults_are_transient() {
        let blob = MemBlob::new();
        blob.put("k", Bytes::from_static(b"v")).await.unwrap();
        blob.fail_next(2);
        assert!(matches!(
            blob.get("k").await.unwrap_err(),
            BlobError::Transient(_)
        ));
        assert!(blob.get("k").await.is_err());
        assert!(blob.get("k").await.is_ok());
    }
}
