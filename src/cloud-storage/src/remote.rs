// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Budgeted access to the object store.
//!
//! [`Remote`] wraps a [`Blob`] with the retry discipline every cloud
//! request follows: the caller passes a [`RetryChainNode`], transient
//! failures back off and retry while that node's budget lasts, and only an
//! exhausted budget (or abort) surfaces an error. Typed helpers cover the
//! blobs the archival core reads and writes.

use std::sync::Arc;

use bytes::Bytes;
use shoal_base::codec::Codec;
use shoal_base::retry::{RetryChainNode, RetryPermit};
use tracing::{debug, warn};

use crate::blob::{Blob, BlobError, BlobMeta};
use crate::metrics::CloudStorageMetrics;
use crate::partition_manifest::PartitionManifest;
use crate::spillover_manifest::SpilloverManifest;
use crate::CloudStorageError;

#[derive(Clone)]
pub struct Remote {
    blob: Arc<dyn Blob>,
    metrics: Arc<CloudStorageMetrics>,
}

impl Remote {
    pub fn new(blob: Arc<dyn Blob>, metrics: Arc<CloudStorageMetrics>) -> Self {
        Remote { blob, metrics }
    }

    pub fn metrics(&self) -> &CloudStorageMetrics {
        &self.metrics
    }

    /// Runs `op` under the retry-chain budget, backing off on transient
    /// failures.
    async fn with_retries<T, F, Fut>(
        &self,
        rtc: &mut RetryChainNode,
        what: &str,
        mut op: F,
    ) -> Result<T, CloudStorageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BlobError>>,
    {
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(BlobError::Transient(reason)) => match rtc.retry() {
                    RetryPermit::Allowed { delay } => {
                        self.metrics.retries.inc();
                        debug!(what, %reason, ?delay, "transient failure, backing off");
                        if !rtc.sleep(delay).await {
                            return Err(CloudStorageError::ShuttingDown);
                        }
                    }
                    RetryPermit::Disallowed => {
                        warn!(what, %reason, "retry budget exhausted");
                        return Err(if rtc.is_aborted() {
                            CloudStorageError::ShuttingDown
                        } else {
                            CloudStorageError::Timeout
                        });
                    }
                },
                Err(e @ BlobError::Permanent(_)) => return Err(e.into()),
            }
        }
    }

    pub async fn upload_object(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
        body: Bytes,
    ) -> Result<(), CloudStorageError> {
        self.with_retries(rtc, "put", || self.blob.put(key, body.clone()))
            .await
    }

    /// Downloads an object; `Ok(None)` when the key does not exist.
    pub async fn download_object(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
    ) -> Result<Option<Bytes>, CloudStorageError> {
        self.with_retries(rtc, "get", || self.blob.get(key)).await
    }

    pub async fn list_objects(
        &self,
        rtc: &mut RetryChainNode,
        prefix: &str,
    ) -> Result<Vec<BlobMeta>, CloudStorageError> {
        self.with_retries(rtc, "list", || self.blob.list(prefix))
            .await
    }

    pub async fn delete_objects(
        &self,
        rtc: &mut RetryChainNode,
        keys: &[String],
    ) -> Result<(), CloudStorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.with_retries(rtc, "delete", || self.blob.delete(keys))
            .await?;
        self.metrics.deletions.inc_by(keys.len() as u64);
        Ok(())
    }

    pub async fn upload_segment(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
        body: Bytes,
    ) -> Result<(), CloudStorageError> {
        self.upload_object(rtc, key, body).await?;
        self.metrics.uploads.inc();
        Ok(())
    }

    pub async fn download_segment(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
    ) -> Result<Bytes, CloudStorageError> {
        let body = self
            .download_object(rtc, key)
            .await?
            .ok_or_else(|| BlobError::Permanent(format!("segment missing: {key}")))?;
        self.metrics.downloads.inc();
        Ok(body)
    }

    pub async fn upload_manifest(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
        manifest: &PartitionManifest,
    ) -> Result<(), CloudStorageError> {
        let body = Bytes::from(manifest.encode_to_vec());
        self.upload_object(rtc, key, body).await?;
        self.metrics.manifest_uploads.inc();
        Ok(())
    }

    /// Downloads and decodes a manifest; `Ok(None)` when absent (a
    /// partition that has never uploaded).
    pub async fn download_manifest(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
    ) -> Result<Option<PartitionManifest>, CloudStorageError> {
        let Some(body) = self.download_object(rtc, key).await? else {
            return Ok(None);
        };
        self.metrics.manifest_downloads.inc();
        let manifest = PartitionManifest::decode(&body)
            .map_err(CloudStorageError::Malformed)?;
        Ok(Some(manifest))
    }

    pub async fn upload_topic_manifest(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
        manifest: &crate::TopicManifest,
    ) -> Result<(), CloudStorageError> {
        let body = Bytes::from(manifest.encode_to_vec());
        self.upload_object(rtc, key, body).await?;
        self.metrics.manifest_uploads.inc();
        Ok(())
    }

    pub async fn download_topic_manifest(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
    ) -> Result<Option<crate::TopicManifest>, CloudStorageError> {
        let Some(body) = self.download_object(rtc, key).await? else {
            return Ok(None);
        };
        self.metrics.manifest_downloads.inc();
        let manifest =
            crate::TopicManifest::decode(&body).map_err(CloudStorageError::Malformed)?;
        Ok(Some(manifest))
    }

    pub async fn upload_spillover_manifest(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
        shard: &SpilloverManifest,
    ) -> Result<(), CloudStorageError> {
        let body = Bytes::from(shard.manifest().encode_to_vec());
        self.upload_object(rtc, key, body).await?;
        self.metrics.spillover_manifest_uploads.inc();
        Ok(())
    }

    /// Downloads a spillover shard; absence is `ManifestNotFound`, since a
    /// shard listed in the spillover map must exist.
    pub async fn download_spillover_manifest(
        &self,
        rtc: &mut RetryChainNode,
        key: &str,
        base: shoal_model::Offset,
    ) -> Result<SpilloverManifest, CloudStorageError> {
        let Some(body) = self.download_object(rtc, key).await? else {
            return Err(CloudStorageError::ManifestNotFound(base));
        };
        self.metrics.manifest_downloads.inc();
        let manifest = PartitionManifest::decode(&body)
            .map_err(CloudStorageError::Malformed)?;
        Ok(SpilloverManifest::from(manifest))
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote").finish_non_exhaustive()
    }
}
