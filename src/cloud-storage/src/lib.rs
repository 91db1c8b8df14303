// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cloud tier of a shoal partition.
//!
//! A partition's recent history lives on local disk; everything older is
//! uploaded to an object store and described by a [`PartitionManifest`]. Once
//! the live manifest grows past its budget, its head is spilled into
//! immutable [`SpilloverManifest`] shards whose object keys embed their own
//! offset windows. Readers see the archive and the live manifest as one
//! contiguous sequence through the [`AsyncManifestView`], which hydrates
//! spilled shards on demand via the [`MaterializedManifestCache`].

mod access_time_tracker;
mod async_manifest_view;
mod blob;
mod cache_service;
mod encoding;
mod materialized_manifest_cache;
mod metrics;
mod partition_manifest;
mod remote;
mod remote_label;
mod remote_path_provider;
mod s3;
mod spillover_manifest;
mod topic_manifest;

pub use crate::access_time_tracker::AccessTimeTracker;
pub use crate::async_manifest_view::{
    AsyncManifestView, AsyncManifestViewCursor, CursorStatus, RetentionUpdate,
};
pub use crate::blob::{Blob, BlobError, BlobMeta, MemBlob};
pub use crate::cache_service::CacheService;
pub use crate::materialized_manifest_cache::{
    CacheReservation, MaterializedManifestCache, PinnedManifest,
};
pub use crate::metrics::CloudStorageMetrics;
pub use crate::partition_manifest::{ManifestError, PartitionManifest};
pub use crate::remote::Remote;
pub use crate::remote_label::RemoteLabel;
pub use crate::remote_path_provider::{RemotePathProvider, SpilloverPathComponents};
pub use crate::s3::S3Blob;
pub use crate::spillover_manifest::SpilloverManifest;
pub use crate::topic_manifest::TopicManifest;

use shoal_model::Offset;

/// Errors surfaced by the cloud-tier components.
///
/// Transient object-store failures are retried inside [`Remote`] under the
/// caller's retry-chain budget and only surface here once that budget is
/// exhausted.
#[derive(Debug, thiserror::Error)]
pub enum CloudStorageError {
    /// The caller asked for an offset below the oldest readable one.
    #[error("offset {0} is out of the addressable range")]
    OutOfRange(Offset),
    /// The archive shard covering the requested range is unreachable.
    #[error("no manifest covers offset {0}")]
    ManifestNotFound(Offset),
    /// The caller's deadline expired.
    #[error("operation timed out")]
    Timeout,
    /// Cooperative shutdown.
    #[error("shutting down")]
    ShuttingDown,
    /// Retry budget exhausted against the object store.
    #[error("object store: {0}")]
    Remote(#[from] BlobError),
    /// Local disk I/O trouble (cache folder reads/writes).
    #[error("io: {0}")]
    TransientIo(String),
    /// A persisted blob failed to decode.
    #[error("malformed persisted state: {0}")]
    Malformed(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}
