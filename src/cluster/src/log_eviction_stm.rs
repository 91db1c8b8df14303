// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The replicated state machine behind delete-records and local retention.
//!
//! Two forces move a partition's start offset forward: clients calling
//! delete-records (replicated `PrefixTruncate` batches) and the local
//! retention layer evicting old segments. `apply` is the only place the
//! replicated state changes, and all it does is advance the in-memory
//! delete-records offset, deterministically and identically on every
//! replica.
//!
//! Everything that depends on local conditions (what is on disk, what the
//! composed STMs allow collecting) happens in background fibers that write
//! raft snapshots and whose failures never touch the replicated state:
//!
//!   - the eviction monitor listens for storage eviction signals, records
//!     the candidate offset and waits for the snapshotter to catch up
//!     before accepting the next signal;
//!   - the snapshotter resolves `max(delete_records, storage_eviction)` to
//!     a batch boundary no greater than the max collectible offset, waits
//!     for it to be visible, and writes the raft snapshot.
//!
//! The externally visible start offset derives only from replicated or
//! locally-durable facts: `1 + max(last_snapshot_index,
//! delete_records_eviction_offset)`. The storage eviction candidate is
//! deliberately excluded; it is not persisted anywhere, and counting it
//! would let the start offset regress across a crash.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use shoal_base::task::AbortOnDropHandle;
use shoal_base::CancellationToken;
use shoal_model::{next_offset, Ntp, Offset};
use shoal_raft::{
    OffsetMonitor, Raft, RecordBatch, RecordBatchBuilder, RecordBatchType, ReplicateOptions,
    StateMachine, WriteSnapshotCfg,
};
use shoal_storage::{KeySpace, KvStore};
use tracing::{debug, error, info, trace};

use crate::ClusterError;

/// Locally persisted snapshot of the replicated state, stored in the
/// kv-store so a restart does not replay the whole log.
#[derive(Clone, PartialEq, ::prost::Message)]
struct ProtoEvictionSnapshot {
    #[prost(int64, optional, tag = "1")]
    delete_records_eviction_offset: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "2")]
    last_applied_offset: ::core::option::Option<i64>,
}

/// Key of a `PrefixTruncate` record: the last offset to remove. The record
/// carries the point below the new start so that "truncate at X" replays
/// identically regardless of what X's batch boundary looks like locally.
#[derive(Clone, PartialEq, ::prost::Message)]
struct ProtoTruncateCommand {
    #[prost(int64, tag = "1")]
    last_removed_offset: i64,
}

#[derive(Debug, Default)]
struct EvictionState {
    delete_records_eviction_offset: Option<Offset>,
    storage_eviction_offset: Option<Offset>,
    last_applied: Option<Offset>,
}

struct StmInner {
    ntp: Ntp,
    raft: Arc<dyn Raft>,
    kvstore: Arc<dyn KvStore>,
    state: Mutex<EvictionState>,
    /// Wakes the snapshotter; signaled by `apply` and the eviction monitor.
    reap: tokio::sync::Notify,
    applied: OffsetMonitor,
    last_snapshot: OffsetMonitor,
    abort: CancellationToken,
}

impl StmInner {
    fn kv_key(&self) -> Vec<u8> {
        format!("log_eviction_stm/{}", self.ntp).into_bytes()
    }

    fn effective_start_offset(&self) -> Offset {
        let state = self.state.lock().expect("lock poisoned");
        let snap = self.raft.last_snapshot_index();
        next_offset(state.delete_records_eviction_offset.max(snap))
    }

    /// Persists the replicated portion of the state. An optimization only:
    /// losing it means replaying the log from the raft snapshot.
    async fn persist_local_snapshot(&self) {
        let proto = {
            let state = self.state.lock().expect("lock poisoned");
            ProtoEvictionSnapshot {
                delete_records_eviction_offset: state
                    .delete_records_eviction_offset
                    .map(|o| o.0),
                last_applied_offset: state.last_applied.map(|o| o.0),
            }
        };
        let bytes = Bytes::from(proto.encode_to_vec());
        if let Err(e) = self
            .kvstore
            .put(KeySpace::Stms, self.kv_key(), bytes)
            .await
        {
            // Never fail apply over a local snapshot write.
            error!(ntp = %self.ntp, error = %e, "failed to persist eviction snapshot");
        }
    }

    async fn recover_local_snapshot(&self) {
        let Some(bytes) = self.kvstore.get(KeySpace::Stms, &self.kv_key()).await else {
            return;
        };
        match ProtoEvictionSnapshot::decode(&bytes[..]) {
            Ok(proto) => {
                let mut state = self.state.lock().expect("lock poisoned");
                state.delete_records_eviction_offset =
                    proto.delete_records_eviction_offset.map(Offset);
                state.last_applied = proto.last_applied_offset.map(Offset);
                if let Some(applied) = state.last_applied {
                    self.applied.notify(applied);
                }
                info!(ntp = %self.ntp, ?state, "recovered eviction snapshot");
            }
            Err(e) => error!(ntp = %self.ntp, error = %e, "corrupt eviction snapshot, ignoring"),
        }
    }

    /// Listens for storage-eviction events. After each signal the fiber
    /// waits for the snapshotter to process it before accepting the next
    /// one, so a burst of eviction events cannot queue unbounded work.
    async fn monitor_log_eviction(self: Arc<Self>) {
        loop {
            match self.raft.monitor_log_eviction(self.abort.child_token()).await {
                Ok(offset) => {
                    trace!(ntp = %self.ntp, %offset, "storage eviction requested");
                    {
                        let mut state = self.state.lock().expect("lock poisoned");
                        state.storage_eviction_offset =
                            state.storage_eviction_offset.max(Some(offset));
                    }
                    let next_eviction = offset.min(self.raft.max_collectible_offset());
                    self.reap.notify_one();
                    if self
                        .last_snapshot
                        .wait(next_eviction, None, &self.abort)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(shoal_raft::RaftError::ShuttingDown) => return,
                Err(e) => {
                    debug!(ntp = %self.ntp, error = %e, "eviction monitor error");
                }
            }
        }
    }

    /// Writes raft snapshots as close to the effective start as the log and
    /// the composed STMs allow. Errors are logged and retried on the next
    /// wakeup.
    async fn write_raft_snapshots_in_background(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.reap.notified() => {}
                _ = self.abort.cancelled() => return,
            }
            let evict_until = {
                let state = self.state.lock().expect("lock poisoned");
                state
                    .delete_records_eviction_offset
                    .max(state.storage_eviction_offset)
            };
            let Some(evict_until) = evict_until else { continue };
            let Some(index_lb) = self.raft.index_lower_bound(evict_until) else {
                continue;
            };
            assert!(
                index_lb <= evict_until,
                "index lower bound {index_lb} above eviction target {evict_until}"
            );
            if let Err(e) = self.do_write_raft_snapshot(index_lb).await {
                error!(ntp = %self.ntp, error = %e, "failed to write raft snapshot");
            }
        }
    }

    async fn do_write_raft_snapshot(&self, mut index: Offset) -> Result<(), ClusterError> {
        if matches!(self.raft.last_snapshot_index(), Some(snap) if index <= snap) {
            // Already covered; let the monitor move on.
            self.last_snapshot.notify(index);
            return Ok(());
        }
        self.raft
            .visible_offset_monitor()
            .wait(index, None, &self.abort)
            .await?;
        let max_collectible = self.raft.max_collectible_offset();
        if index > max_collectible {
            trace!(ntp = %self.ntp, %max_collectible, "clamping snapshot index");
            index = max_collectible;
        }
        self.raft
            .write_snapshot(WriteSnapshotCfg::new(index, Bytes::new()))
            .await?;
        self.last_snapshot.notify(index);
        Ok(())
    }
}

/// See the module docs.
pub struct LogEvictionStm {
    inner: Arc<StmInner>,
    fibers: Mutex<Vec<AbortOnDropHandle<()>>>,
}

impl LogEvictionStm {
    pub fn new(raft: Arc<dyn Raft>, kvstore: Arc<dyn KvStore>) -> Arc<Self> {
        let ntp = raft.ntp();
        Arc::new(LogEvictionStm {
            inner: Arc::new(StmInner {
                ntp,
                raft,
                kvstore,
                state: Mutex::new(EvictionState::default()),
                reap: tokio::sync::Notify::new(),
                applied: OffsetMonitor::new(),
                last_snapshot: OffsetMonitor::new(),
                abort: CancellationToken::new(),
            }),
            fibers: Mutex::new(Vec::new()),
        })
    }

    /// Recovers persisted state and spawns the background fibers.
    pub async fn start(self: &Arc<Self>) {
        self.inner.recover_local_snapshot().await;
        if let Some(snap) = self.inner.raft.last_snapshot_index() {
            self.inner.last_snapshot.notify(snap);
        }
        let mut fibers = self.fibers.lock().expect("lock poisoned");
        let inner = Arc::clone(&self.inner);
        fibers.push(AbortOnDropHandle(shoal_base::task::spawn(
            || format!("cluster::log_eviction_monitor/{}", inner.ntp),
            inner.clone().monitor_log_eviction(),
        )));
        let inner = Arc::clone(&self.inner);
        fibers.push(AbortOnDropHandle(shoal_base::task::spawn(
            || format!("cluster::log_eviction_snapshotter/{}", inner.ntp),
            inner.clone().write_raft_snapshots_in_background(),
        )));
    }

    pub fn stop(&self) {
        self.inner.abort.cancel();
        self.fibers.lock().expect("lock poisoned").clear();
    }

    /// The externally visible first offset of the log.
    pub fn effective_start_offset(&self) -> Offset {
        self.inner.effective_start_offset()
    }

    /// Replicates a prefix truncation: everything below `truncate_offset`
    /// becomes unaddressable, `truncate_offset` itself is the new start.
    ///
    /// Returns once the command is applied locally and the start offset
    /// has moved, not when bytes are reclaimed; reclamation
    /// happens in the background.
    pub async fn truncate(
        &self,
        truncate_offset: Offset,
        deadline: Duration,
        abort: Option<&CancellationToken>,
    ) -> Result<(), ClusterError> {
        let command = ProtoTruncateCommand {
            last_removed_offset: truncate_offset.prev().0,
        };
        let mut builder = RecordBatchBuilder::new(RecordBatchType::PrefixTruncate, Offset(0));
        builder.add_raw_kv(Bytes::from(command.encode_to_vec()), Bytes::new());
        let batch = builder.build();

        info!(
            ntp = %self.inner.ntp,
            %truncate_offset,
            current_start = %self.effective_start_offset(),
            "replicating prefix_truncate command"
        );
        let result = self
            .replicate_command(batch, deadline, abort)
            .await?;
        // Wait until apply moved the in-memory start offset.
        let abort_token = abort.cloned().unwrap_or_else(|| self.inner.abort.child_token());
        self.inner
            .applied
            .wait(result, Some(deadline), &abort_token)
            .await?;
        Ok(())
    }

    async fn replicate_command(
        &self,
        batch: RecordBatch,
        deadline: Duration,
        abort: Option<&CancellationToken>,
    ) -> Result<Offset, ClusterError> {
        let term = self.inner.raft.term();
        let replicate = self
            .inner
            .raft
            .replicate(term, batch, ReplicateOptions::quorum_ack());
        let result = match abort {
            Some(token) => tokio::select! {
                res = tokio::time::timeout(deadline, replicate) => res,
                _ = token.cancelled() => return Err(ClusterError::ShuttingDown),
            },
            None => tokio::time::timeout(deadline, replicate).await,
        };
        match result {
            Ok(Ok(r)) => Ok(r.last_offset),
            Ok(Err(e)) => {
                error!(ntp = %self.inner.ntp, error = %e, "failed to replicate prefix_truncate");
                Err(e.into())
            }
            Err(_) => Err(ClusterError::Timeout),
        }
    }

    /// Returns the effective start offset after making sure this replica's
    /// apply is caught up with everything committed in the current term.
    pub async fn sync_effective_start(&self, timeout: Duration) -> Result<Offset, ClusterError> {
        if !self.inner.raft.is_leader() {
            return Err(ClusterError::NotLeader);
        }
        let term = self.inner.raft.term();
        if let Some(committed) = self.inner.raft.committed_offset() {
            // Only eviction batches advance our applied offset; anything
            // else committed at or below `committed` is irrelevant to the
            // start offset, so cap the wait at the last eviction command.
            let last_relevant = {
                let state = self.inner.state.lock().expect("lock poisoned");
                state.last_applied
            };
            if let Some(target) = last_relevant.filter(|o| *o <= committed) {
                let res = self
                    .inner
                    .applied
                    .wait(target, Some(timeout), &self.inner.abort)
                    .await;
                if res.is_err() {
                    return if self.inner.raft.term() != term {
                        Err(ClusterError::NotLeader)
                    } else {
                        Err(ClusterError::Timeout)
                    };
                }
            }
        }
        Ok(self.effective_start_offset())
    }

    /// Called when the apply path detects a gap: the log was prefix
    /// truncated past our applied offset and the only way forward is the
    /// raft snapshot.
    pub async fn handle_eviction(&self) -> Result<(), ClusterError> {
        let snapshot = self
            .inner
            .raft
            .open_snapshot()
            .await?
            .ok_or_else(|| {
                ClusterError::Persistence(format!(
                    "gap in the raft log but no snapshot, ntp {}",
                    self.inner.ntp
                ))
            })?;
        let index = snapshot.metadata.last_included_index;
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            state.delete_records_eviction_offset = None;
            state.storage_eviction_offset = Some(index);
            state.last_applied = Some(index);
        }
        self.inner.applied.notify(index);
        info!(
            ntp = %self.inner.ntp,
            new_start = %self.effective_start_offset(),
            "handled log eviction from raft snapshot"
        );
        Ok(())
    }

    /// The state-machine face registered with raft.
    pub fn state_machine(self: &Arc<Self>) -> Arc<dyn StateMachine> {
        Arc::new(LogEvictionApplier {
            inner: Arc::clone(&self.inner),
        })
    }
}

struct LogEvictionApplier {
    inner: Arc<StmInner>,
}

#[async_trait::async_trait]
impl StateMachine for LogEvictionApplier {
    /// Deterministic: only moves the in-memory delete-records offset
    /// forward. Reclamation is the background fibers' problem.
    async fn apply(&self, batch: RecordBatch) {
        let last = batch.last_offset();
        if batch.header().batch_type == RecordBatchType::PrefixTruncate {
            // PrefixTruncate batches carry exactly one record.
            let record = batch.records().first().expect("nonempty batch");
            let truncate_point = match ProtoTruncateCommand::decode(&record.key[..]) {
                Ok(cmd) => Offset(cmd.last_removed_offset),
                Err(e) => {
                    // A malformed replicated command is an invariant
                    // violation; continuing would fork the replicas.
                    panic!("malformed prefix_truncate command: {e}");
                }
            };
            let advanced = {
                let mut state = self.inner.state.lock().expect("lock poisoned");
                if Some(truncate_point) > state.delete_records_eviction_offset {
                    debug!(
                        ntp = %self.inner.ntp,
                        %truncate_point,
                        "advancing delete-records eviction offset"
                    );
                    state.delete_records_eviction_offset = Some(truncate_point);
                    true
                } else {
                    false
                }
            };
            if advanced {
                self.inner.reap.notify_one();
                // Delete-records is rare; persisting here means a restart
                // starts from the new offset without replay.
                self.inner.persist_local_snapshot().await;
            }
        }
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            state.last_applied = state.last_applied.max(Some(last));
        }
        self.inner.applied.notify(last);
    }

    fn last_applied_offset(&self) -> Option<Offset> {
        self.inner.state.lock().expect("lock poisoned").last_applied
    }

    fn max_collectible_offset(&self) -> Offset {
        // This STM drives eviction; it never holds the log back.
        Offset(i64::MAX)
    }
}
