// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-partition archival pipeline.
//!
//! Runs on the replica holding leadership. The [`NtpArchiver`] uploads
//! flushed local segments and keeps the partition manifest current;
//! housekeeping merges small adjacent uploads through the
//! [`SegmentCollector`], spills the manifest head into archive shards and
//! applies retention through the async manifest view.

mod adjacent_segment_merger;
mod housekeeping;
mod ntp_archiver;
mod probe;
mod segment_collector;

pub use crate::adjacent_segment_merger::AdjacentSegmentMerger;
pub use crate::housekeeping::HousekeepingJob;
pub use crate::ntp_archiver::{NtpArchiver, UploadSummary};
pub use crate::probe::ArchivalProbe;
pub use crate::segment_collector::SegmentCollector;

#[derive(Debug, thiserror::Error)]
pub enum ArchivalError {
    #[error(transparent)]
    CloudStorage(#[from] shoal_cloud_storage::CloudStorageError),
    #[error("storage: {0}")]
    Storage(#[from] shoal_storage::StorageError),
    #[error("raft: {0}")]
    Raft(#[from] shoal_raft::RaftError),
    #[error("lost leadership mid-operation")]
    NotLeader,
    #[error("shutting down")]
    ShuttingDown,
}
