// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Local-storage surfaces consumed by the archival core.
//!
//! The disk log itself (record batch layout, indices, compaction) is an
//! external collaborator. This crate defines what the archival layer needs
//! from it (an iterator over closed segments with compaction flags and a
//! way to read their bytes) plus the node-local kv-store used to persist
//! shard placement and STM snapshots, and the disk-space monitor feeding
//! storage alerts.

mod kvstore;
mod log;
mod space;

pub use crate::kvstore::{FileKvStore, KeySpace, KvStore, MemKvStore};
pub use crate::log::{InMemoryLog, LogReader, PopulateSpec, SegmentInfo};
pub use crate::space::{DiskSpaceAlert, DiskSpaceMonitor, DiskSpaceSample};

/// Errors of the local storage surfaces.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("segment not found at base offset {0}")]
    SegmentNotFound(shoal_model::Offset),
    #[error("kv-store io: {0}")]
    KvIo(#[from] std::io::Error),
}
