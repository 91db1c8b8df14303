// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster-side support for the archival core: the replicated log-eviction
//! state machine and the per-node shard placement machinery.

mod log_eviction_stm;
mod shard_balancer;
mod shard_placement_table;
mod shard_reconciler;

pub use crate::log_eviction_stm::LogEvictionStm;
pub use crate::shard_balancer::ShardBalancer;
pub use crate::shard_placement_table::{
    HostedStatus, PlacementState, ReconciliationAction, ShardLocalAssignment, ShardLocalState,
    ShardPlacementTable,
};
pub use crate::shard_reconciler::{
    ExpectedReplica, PartitionHost, ReconcileSummary, ShardReconciler,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not the leader")]
    NotLeader,
    #[error("operation timed out")]
    Timeout,
    #[error("shutting down")]
    ShuttingDown,
    #[error("raft: {0}")]
    Raft(shoal_raft::RaftError),
    #[error("conflicting placement update: {0}")]
    PlacementConflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<shoal_raft::RaftError> for ClusterError {
    fn from(e: shoal_raft::RaftError) -> Self {
        match e {
            shoal_raft::RaftError::NotLeader | shoal_raft::RaftError::TermChanged => {
                ClusterError::NotLeader
            }
            shoal_raft::RaftError::Timeout => ClusterError::Timeout,
            shoal_raft::RaftError::ShuttingDown => ClusterError::ShuttingDown,
        }
    }
}
