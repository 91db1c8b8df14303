// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The raft surface the archival core consumes.
//!
//! The consensus implementation itself is an external collaborator; this
//! crate defines only the interface the archival and eviction machinery
//! calls (replicate, the visible-offset monitor, snapshot read/write, the
//! log-eviction notification stream) together with the record-batch model
//! those calls traffic in, and [`mem::InMemoryRaft`], a single-node
//! implementation backing the state-machine tests.

mod batch;
pub mod mem;
mod monitor;

pub use crate::batch::{Record, RecordBatch, RecordBatchBuilder, RecordBatchType};
pub use crate::monitor::OffsetMonitor;

use bytes::Bytes;
use shoal_base::CancellationToken;
use shoal_model::{Ntp, Offset, Term};

/// Consistency level requested for a replicate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    /// Acknowledge once a quorum has persisted the batch.
    QuorumAck,
    /// Acknowledge once the leader has persisted the batch.
    LeaderAck,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicateOptions {
    pub consistency: ConsistencyLevel,
}

impl ReplicateOptions {
    pub fn quorum_ack() -> Self {
        ReplicateOptions {
            consistency: ConsistencyLevel::QuorumAck,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicateResult {
    /// Model offset of the last record of the replicated batch.
    pub last_offset: Offset,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader for this partition")]
    NotLeader,
    #[error("operation timed out")]
    Timeout,
    #[error("shutting down")]
    ShuttingDown,
    #[error("term changed during the operation")]
    TermChanged,
}

/// Metadata of a raft snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub last_included_index: Offset,
    pub last_included_term: Term,
}

/// An open raft snapshot: its metadata plus the (possibly empty) blob.
#[derive(Debug, Clone)]
pub struct RaftSnapshot {
    pub metadata: SnapshotMetadata,
    pub data: Bytes,
}

/// Arguments to [`Raft::write_snapshot`].
#[derive(Debug, Clone)]
pub struct WriteSnapshotCfg {
    pub last_included_index: Offset,
    pub data: Bytes,
}

impl WriteSnapshotCfg {
    pub fn new(last_included_index: Offset, data: Bytes) -> Self {
        WriteSnapshotCfg {
            last_included_index,
            data,
        }
    }
}

/// A state machine fed from the committed batch stream.
///
/// `apply` must be deterministic: replicas see identical batches in
/// identical order and must land in identical states.
#[async_trait::async_trait]
pub trait StateMachine: Send + Sync + 'static {
    async fn apply(&self, batch: RecordBatch);

    fn last_applied_offset(&self) -> Option<Offset>;

    /// The highest offset this STM allows the log to snapshot away. Offsets
    /// above it are still needed (e.g. not yet uploaded to the cloud tier).
    fn max_collectible_offset(&self) -> Offset;
}

/// The consensus interface consumed by the archival core.
#[async_trait::async_trait]
pub trait Raft: Send + Sync + 'static {
    fn ntp(&self) -> Ntp;

    fn term(&self) -> Term;

    fn is_leader(&self) -> bool;

    /// First offset present in the raft log (after prefix truncation).
    fn start_offset(&self) -> Offset;

    fn committed_offset(&self) -> Option<Offset>;

    fn last_visible_index(&self) -> Option<Offset>;

    fn last_snapshot_index(&self) -> Option<Offset>;

    /// A monitor that resolves waits as offsets become visible (committed
    /// and readable) on this replica.
    fn visible_offset_monitor(&self) -> OffsetMonitor;

    /// Largest log index at a batch boundary that is `<= o`, if the log
    /// contains one.
    fn index_lower_bound(&self, o: Offset) -> Option<Offset>;

    /// The offset-translation delta at `o`: how many records at or below it
    /// are control records invisible in kafka space. Monotone in `o` and a
    /// deterministic function of the replicated log.
    fn offset_delta(&self, o: Offset) -> shoal_model::OffsetDelta;

    /// The highest offset every composed STM allows snapshotting away.
    fn max_collectible_offset(&self) -> Offset;

    async fn replicate(
        &self,
        term: Term,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> Result<ReplicateResult, RaftError>;

    async fn write_snapshot(&self, cfg: WriteSnapshotCfg) -> Result<(), RaftError>;

    async fn open_snapshot(&self) -> Result<Option<RaftSnapshot>, RaftError>;

    /// Resolves with the next storage-eviction candidate offset: the local
    /// retention layer wants everything at or below it gone. Resolves with
    /// `ShuttingDown` when `abort` fires.
    async fn monitor_log_eviction(&self, abort: CancellationToken) -> Result<Offset, RaftError>;
}
