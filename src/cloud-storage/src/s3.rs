// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! S3 implementation of [`Blob`].
//!
//! One bucket per cluster; keys come from the remote path provider. All
//! errors except "no such key" are reported as transient and left to the
//! retry chain in [`crate::Remote`]. S3 surfaces throttling, timeouts and
//! internal errors through enough different shapes that classifying them
//! further buys nothing.

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use bytes::Bytes;

use crate::blob::{Blob, BlobError, BlobMeta};

#[derive(Debug, Clone)]
pub struct S3Blob {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Blob {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        S3Blob {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the ambient AWS environment (credentials chain,
    /// region, endpoint overrides).
    pub async fn open(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn transient<E: std::fmt::Display>(e: E) -> BlobError {
        BlobError::Transient(e.to_string())
    }
}

#[async_trait::async_trait]
impl Blob for S3Blob {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(out) => {
                let data = out.body.collect().await.map_err(Self::transient)?;
                Ok(Some(data.into_bytes()))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(Self::transient(e)),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(value.into())
            .send()
            .await
            .map_err(Self::transient)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobError> {
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(Self::transient)?;
            for obj in resp.contents().unwrap_or_default() {
                let Some(key) = obj.key() else { continue };
                out.push(BlobMeta {
                    key: key.to_string(),
                    size_bytes: u64::try_from(obj.size()).unwrap_or(0),
                });
            }
            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BlobError> {
        // DeleteObjects takes at most 1000 keys per request.
        for chunk in keys.chunks(1000) {
            let objects: Vec<ObjectIdentifier> = chunk
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect();
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(Delete::builder().set_objects(Some(objects)).build())
                .send()
                .await
                .map_err(Self::transient)?;
        }
        Ok(())
    }
}
