// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Node-local tracking of which shard hosts which partition replica.
//!
//! For every ntp expected on this node the table holds two facts: the
//! target (`assigned`: which shard should host it, at which log revision)
//! and the current shard-local reality (`current`: what actually exists in
//! this shard's storage, and in what lifecycle state). The shard balancer
//! moves targets; the reconciliation backend moves reality, one
//! create/transfer/delete step at a time.
//!
//! Every mutation is persisted to the kv-store before the in-memory state
//! changes, and startup recovers from the kv-store alone. During normal
//! operation the store is write-only.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use shoal_model::{GroupId, Ntp, RevisionId, ShardId, ShardRevisionId};
use shoal_storage::{KeySpace, KvStore};
use tracing::{debug, info};

use crate::ClusterError;

/// Lifecycle of a replica's shard-local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostedStatus {
    /// Cross-shard transfer in progress; this shard is the destination.
    Receiving,
    /// Normal state; the partition instance can be started.
    Hosted,
    /// State was transferred away; the local copy must be deleted.
    Obsolete,
}

/// The fact that a partition replica is expected on a given shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLocalAssignment {
    pub group: GroupId,
    pub log_revision: RevisionId,
    pub shard_revision: ShardRevisionId,
}

/// Current shard-local state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLocalState {
    pub group: GroupId,
    pub log_revision: RevisionId,
    pub status: HostedStatus,
    pub shard_revision: ShardRevisionId,
}

impl ShardLocalState {
    fn from_assignment(assignment: &ShardLocalAssignment, status: HostedStatus) -> Self {
        ShardLocalState {
            group: assignment.group,
            log_revision: assignment.log_revision,
            status,
            shard_revision: assignment.shard_revision,
        }
    }
}

/// What the reconciliation backend must do next for an ntp on this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationAction {
    /// The replica must be removed from this node.
    Remove,
    /// The replica must move to another shard.
    Transfer,
    /// The target is stale; wait for the balancer to catch up.
    WaitForTargetUpdate,
    /// The replica must be created/started on this shard.
    Create,
}

/// Both sides of the story for one ntp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementState {
    pub current: Option<ShardLocalState>,
    pub assigned: Option<ShardLocalAssignment>,
}

impl PlacementState {
    /// Derives the next reconciliation step from the expected log revision
    /// (per the topic table) and the local state.
    pub fn get_reconciliation_action(
        &self,
        expected_log_revision: Option<RevisionId>,
    ) -> ReconciliationAction {
        let Some(expected) = expected_log_revision else {
            // The topic (or this replica) is gone.
            return ReconciliationAction::Remove;
        };
        if let Some(current) = &self.current {
            if current.log_revision < expected || current.status == HostedStatus::Obsolete {
                return ReconciliationAction::Remove;
            }
        }
        match &self.assigned {
            None => ReconciliationAction::Transfer,
            Some(assigned) if assigned.log_revision < expected => {
                ReconciliationAction::WaitForTargetUpdate
            }
            Some(_) => ReconciliationAction::Create,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct ProtoPlacementEntry {
    #[prost(message, optional, tag = "1")]
    current: ::core::option::Option<ProtoShardLocalState>,
    #[prost(message, optional, tag = "2")]
    assigned: ::core::option::Option<ProtoShardLocalAssignment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct ProtoShardLocalState {
    #[prost(int64, tag = "1")]
    group: i64,
    #[prost(int64, tag = "2")]
    log_revision: i64,
    #[prost(int32, tag = "3")]
    status: i32,
    #[prost(int64, tag = "4")]
    shard_revision: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct ProtoShardLocalAssignment {
    #[prost(int64, tag = "1")]
    group: i64,
    #[prost(int64, tag = "2")]
    log_revision: i64,
    #[prost(int64, tag = "3")]
    shard_revision: i64,
}

fn status_to_proto(status: HostedStatus) -> i32 {
    match status {
        HostedStatus::Receiving => 0,
        HostedStatus::Hosted => 1,
        HostedStatus::Obsolete => 2,
    }
}

fn status_from_proto(v: i32) -> Result<HostedStatus, ClusterError> {
    match v {
        0 => Ok(HostedStatus::Receiving),
        1 => Ok(HostedStatus::Hosted),
        2 => Ok(HostedStatus::Obsolete),
        other => Err(ClusterError::Persistence(format!(
            "unknown hosted status {other}"
        ))),
    }
}

/// Per-shard placement table. One instance per shard; the assignment side
/// is only mutated through the balancer running on the assignment shard.
pub struct ShardPlacementTable {
    shard: ShardId,
    kvstore: Arc<dyn KvStore>,
    /// Mutating operations serialize on this lock; readers snapshot.
    states: tokio::sync::Mutex<HashMap<Ntp, PlacementState>>,
}

impl ShardPlacementTable {
    pub fn new(shard: ShardId, kvstore: Arc<dyn KvStore>) -> Self {
        ShardPlacementTable {
            shard,
            kvstore,
            states: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    fn kv_key(&self, ntp: &Ntp) -> Vec<u8> {
        format!("{}/{}", self.shard, ntp).into_bytes()
    }

    /// Recovers the table from the kv-store. Called once at startup before
    /// any mutation.
    pub async fn initialize(&self) -> Result<(), ClusterError> {
        let entries = self
            .kvstore
            .list(KeySpace::ShardPlacement)
            .await
            .map_err(|e| ClusterError::Persistence(e.to_string()))?;
        let prefix = format!("{}/", self.shard).into_bytes();
        let mut states = self.states.lock().await;
        for (key, value) in entries {
            if !key.starts_with(&prefix) {
                continue;
            }
            let ntp = parse_ntp(&key[prefix.len()..])?;
            let proto = ProtoPlacementEntry::decode(&value[..])
                .map_err(|e| ClusterError::Persistence(e.to_string()))?;
            let state = PlacementState {
                current: proto
                    .current
                    .map(|c| {
                        Ok::<_, ClusterError>(ShardLocalState {
                            group: GroupId(c.group),
                            log_revision: RevisionId(c.log_revision),
                            status: status_from_proto(c.status)?,
                            shard_revision: ShardRevisionId(c.shard_revision),
                        })
                    })
                    .transpose()?,
                assigned: proto.assigned.map(|a| ShardLocalAssignment {
                    group: GroupId(a.group),
                    log_revision: RevisionId(a.log_revision),
                    shard_revision: ShardRevisionId(a.shard_revision),
                }),
            };
            states.insert(ntp, state);
        }
        info!(shard = %self.shard, replicas = states.len(), "recovered shard placement state");
        Ok(())
    }

    pub async fn get_state(&self, ntp: &Ntp) -> Option<PlacementState> {
        self.states.lock().await.get(ntp).copied()
    }

    pub async fn ntps(&self) -> Vec<Ntp> {
        self.states.lock().await.keys().cloned().collect()
    }

    async fn persist(
        &self,
        ntp: &Ntp,
        state: &PlacementState,
    ) -> Result<(), ClusterError> {
        let proto = ProtoPlacementEntry {
            current: state.current.map(|c| ProtoShardLocalState {
                group: c.group.0,
                log_revision: c.log_revision.0,
                status: status_to_proto(c.status),
                shard_revision: c.shard_revision.0,
            }),
            assigned: state.assigned.map(|a| ProtoShardLocalAssignment {
                group: a.group.0,
                log_revision: a.log_revision.0,
                shard_revision: a.shard_revision.0,
            }),
        };
        self.kvstore
            .put(
                KeySpace::ShardPlacement,
                self.kv_key(ntp),
                Bytes::from(proto.encode_to_vec()),
            )
            .await
            .map_err(|e| ClusterError::Persistence(e.to_string()))
    }

    /// Updates (or clears) the target assignment for an ntp on this shard.
    pub async fn set_target(
        &self,
        ntp: &Ntp,
        target: Option<ShardLocalAssignment>,
    ) -> Result<(), ClusterError> {
        let mut states = self.states.lock().await;
        let mut state = states.get(ntp).copied().unwrap_or_default();
        if let (Some(cur), Some(new)) = (&state.assigned, &target) {
            if new.shard_revision < cur.shard_revision {
                return Err(ClusterError::PlacementConflict(format!(
                    "stale target for {ntp}: shard revision {} < {}",
                    new.shard_revision, cur.shard_revision
                )));
            }
        }
        state.assigned = target;
        if state.current.is_none() && state.assigned.is_none() {
            self.kvstore
                .remove(KeySpace::ShardPlacement, &self.kv_key(ntp))
                .await
                .map_err(|e| ClusterError::Persistence(e.to_string()))?;
            states.remove(ntp);
            return Ok(());
        }
        self.persist(ntp, &state).await?;
        states.insert(ntp.clone(), state);
        debug!(shard = %self.shard, %ntp, ?target, "placement target updated");
        Ok(())
    }

    /// Marks the replica as hosted on this shard; the reconciliation step
    /// after the partition instance was created.
    pub async fn prepare_create(&self, ntp: &Ntp) -> Result<ShardLocalState, ClusterError> {
        let mut states = self.states.lock().await;
        let mut state = states.get(ntp).copied().unwrap_or_default();
        let assigned = state.assigned.ok_or_else(|| {
            ClusterError::PlacementConflict(format!("create of {ntp} without an assignment"))
        })?;
        let local = ShardLocalState::from_assignment(&assigned, HostedStatus::Hosted);
        state.current = Some(local);
        self.persist(ntp, &state).await?;
        states.insert(ntp.clone(), state);
        Ok(local)
    }

    /// Source half of a cross-shard transfer: the local copy becomes
    /// obsolete once the destination confirms receipt.
    pub async fn prepare_transfer(&self, ntp: &Ntp) -> Result<ShardLocalState, ClusterError> {
        let mut states = self.states.lock().await;
        let mut state = states.get(ntp).copied().ok_or_else(|| {
            ClusterError::PlacementConflict(format!("transfer of unknown ntp {ntp}"))
        })?;
        let Some(mut current) = state.current else {
            return Err(ClusterError::PlacementConflict(format!(
                "transfer of {ntp} with no local state"
            )));
        };
        current.status = HostedStatus::Obsolete;
        state.current = Some(current);
        self.persist(ntp, &state).await?;
        states.insert(ntp.clone(), state);
        Ok(current)
    }

    /// Destination half of a transfer: records the incoming replica, first
    /// as `Receiving`, flipped to `Hosted` by [`Self::finish_transfer`].
    pub async fn start_receiving(
        &self,
        ntp: &Ntp,
        incoming: ShardLocalState,
    ) -> Result<(), ClusterError> {
        let mut states = self.states.lock().await;
        let mut state = states.get(ntp).copied().unwrap_or_default();
        state.current = Some(ShardLocalState {
            status: HostedStatus::Receiving,
            ..incoming
        });
        self.persist(ntp, &state).await?;
        states.insert(ntp.clone(), state);
        Ok(())
    }

    pub async fn finish_transfer(&self, ntp: &Ntp) -> Result<(), ClusterError> {
        let mut states = self.states.lock().await;
        let mut state = states.get(ntp).copied().ok_or_else(|| {
            ClusterError::PlacementConflict(format!("finishing transfer of unknown ntp {ntp}"))
        })?;
        let Some(mut current) = state.current else {
            return Err(ClusterError::PlacementConflict(format!(
                "finishing transfer of {ntp} with no local state"
            )));
        };
        if current.status != HostedStatus::Receiving {
            return Err(ClusterError::PlacementConflict(format!(
                "finishing transfer of {ntp} in status {:?}",
                current.status
            )));
        }
        current.status = HostedStatus::Hosted;
        state.current = Some(current);
        self.persist(ntp, &state).await?;
        states.insert(ntp.clone(), state);
        Ok(())
    }

    /// Removes the shard-local state of a deleted or moved-away replica.
    /// The entry disappears entirely once neither side references it.
    pub async fn finish_delete(&self, ntp: &Ntp) -> Result<(), ClusterError> {
        let mut states = self.states.lock().await;
        let Some(mut state) = states.get(ntp).copied() else {
            return Ok(());
        };
        state.current = None;
        if state.assigned.is_none() {
            self.kvstore
                .remove(KeySpace::ShardPlacement, &self.kv_key(ntp))
                .await
                .map_err(|e| ClusterError::Persistence(e.to_string()))?;
            states.remove(ntp);
        } else {
            self.persist(ntp, &state).await?;
            states.insert(ntp.clone(), state);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ShardPlacementTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPlacementTable")
            .field("shard", &self.shard)
            .finish_non_exhaustive()
    }
}

fn parse_ntp(bytes: &[u8]) -> Result<Ntp, ClusterError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| ClusterError::Persistence(e.to_string()))?;
    let mut parts = s.splitn(3, '/');
    let (Some(ns), Some(topic), Some(partition)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ClusterError::Persistence(format!("malformed ntp key {s}")));
    };
    let partition: i32 = partition
        .parse()
        .map_err(|_| ClusterError::Persistence(format!("malformed partition in {s}")))?;
    Ok(Ntp::new(ns, topic, partition))
}
