// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A single-node, in-memory raft used by state-machine tests.
//!
//! Quorum is the local node, so a replicate call is committed and visible as
//! soon as it is appended, and registered state machines observe the batch
//! before the call returns. That collapses the replication round-trip while
//! preserving the ordering contract STMs rely on: identical batches, applied
//! in offset order, exactly once.

use std::sync::{Arc, Mutex};

use shoal_base::CancellationToken;
use shoal_model::{next_offset, Ntp, Offset, Term};
use tokio::sync::mpsc;

use crate::{
    OffsetMonitor, Raft, RaftError, RaftSnapshot, RecordBatch, ReplicateOptions, ReplicateResult,
    SnapshotMetadata, StateMachine, WriteSnapshotCfg,
};

#[derive(Debug)]
struct RaftState {
    term: Term,
    is_leader: bool,
    /// Batches above the snapshot, in offset order.
    log: Vec<RecordBatch>,
    committed: Option<Offset>,
    snapshot: Option<RaftSnapshot>,
    last_snapshot_index: Option<Offset>,
}

pub struct InMemoryRaft {
    ntp: Ntp,
    state: Mutex<RaftState>,
    stms: Mutex<Vec<Arc<dyn StateMachine>>>,
    visible: OffsetMonitor,
    eviction_tx: mpsc::UnboundedSender<Offset>,
    eviction_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Offset>>,
}

impl InMemoryRaft {
    pub fn new(ntp: Ntp) -> Arc<Self> {
        let (eviction_tx, eviction_rx) = mpsc::unbounded_channel();
        Arc::new(InMemoryRaft {
            ntp,
            state: Mutex::new(RaftState {
                term: Term(1),
                is_leader: true,
                log: Vec::new(),
                committed: None,
                snapshot: None,
                last_snapshot_index: None,
            }),
            stms: Mutex::new(Vec::new()),
            visible: OffsetMonitor::new(),
            eviction_tx,
            eviction_rx: tokio::sync::Mutex::new(eviction_rx),
        })
    }

    pub fn register_stm(&self, stm: Arc<dyn StateMachine>) {
        self.stms.lock().expect("lock poisoned").push(stm);
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.state.lock().expect("lock poisoned").is_leader = is_leader;
    }

    pub fn bump_term(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.term = Term(state.term.0 + 1);
    }

    /// Injects a storage-eviction notification, as the local retention layer
    /// would.
    pub fn signal_log_eviction(&self, offset: Offset) {
        // Receiver lives as long as self.
        let _ = self.eviction_tx.send(offset);
    }

    fn next_offset_locked(state: &RaftState) -> Offset {
        match state.log.last() {
            Some(batch) => batch.last_offset().next(),
            None => next_offset(state.last_snapshot_index),
        }
    }

    fn stms(&self) -> Vec<Arc<dyn StateMachine>> {
        self.stms.lock().expect("lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Raft for InMemoryRaft {
    fn ntp(&self) -> Ntp {
        self.ntp.clone()
    }

    fn term(&self) -> Term {
        self.state.lock().expect("lock poisoned").term
    }

    fn is_leader(&self) -> bool {
        self.state.lock().expect("lock poisoned").is_leader
    }

    fn start_offset(&self) -> Offset {
        let state = self.state.lock().expect("lock poisoned");
        match state.log.first() {
            Some(batch) => batch.base_offset(),
            None => next_offset(state.last_snapshot_index),
        }
    }

    fn committed_offset(&self) -> Option<Offset> {
        self.state.lock().expect("lock poisoned").committed
    }

    fn last_visible_index(&self) -> Option<Offset> {
        self.committed_offset()
    }

    fn last_snapshot_index(&self) -> Option<Offset> {
        self.state.lock().expect("lock poisoned").last_snapshot_index
    }

    fn visible_offset_monitor(&self) -> OffsetMonitor {
        self.visible.clone()
    }

    fn index_lower_bound(&self, o: Offset) -> Option<Offset> {
        let state = self.state.lock().expect("lock poisoned");
        let mut best = state.last_snapshot_index.filter(|snap| *snap <= o);
        for batch in &state.log {
            let last = batch.last_offset();
            if last <= o {
                best = Some(last);
            } else {
                break;
            }
        }
        best
    }

    fn offset_delta(&self, o: Offset) -> shoal_model::OffsetDelta {
        let state = self.state.lock().expect("lock poisoned");
        let mut delta = 0;
        for batch in &state.log {
            if !batch.header().batch_type.is_control() {
                continue;
            }
            if batch.base_offset() > o {
                break;
            }
            let last = batch.last_offset().min(o);
            delta += last.0 - batch.base_offset().0 + 1;
        }
        shoal_model::OffsetDelta(delta)
    }

    fn max_collectible_offset(&self) -> Offset {
        self.stms()
            .iter()
            .map(|stm| stm.max_collectible_offset())
            .min()
            .unwrap_or(Offset(i64::MAX))
    }

    async fn replicate(
        &self,
        term: Term,
        mut batch: RecordBatch,
        _opts: ReplicateOptions,
    ) -> Result<ReplicateResult, RaftError> {
        let last_offset = {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.is_leader {
                return Err(RaftError::NotLeader);
            }
            if state.term != term {
                return Err(RaftError::TermChanged);
            }
            let base = Self::next_offset_locked(&state);
            batch.assign(base, state.term);
            let last = batch.last_offset();
            state.log.push(batch.clone());
            state.committed = Some(last);
            last
        };
        self.visible.notify(last_offset);
        for stm in self.stms() {
            stm.apply(batch.clone()).await;
        }
        Ok(ReplicateResult { last_offset })
    }

    async fn write_snapshot(&self, cfg: WriteSnapshotCfg) -> Result<(), RaftError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if matches!(state.last_snapshot_index, Some(cur) if cur >= cfg.last_included_index) {
            return Ok(());
        }
        let term = state.term;
        state.snapshot = Some(RaftSnapshot {
            metadata: SnapshotMetadata {
                last_included_index: cfg.last_included_index,
                last_included_term: term,
            },
            data: cfg.data,
        });
        state.last_snapshot_index = Some(cfg.last_included_index);
        let cutoff = cfg.last_included_index;
        state.log.retain(|batch| batch.last_offset() > cutoff);
        Ok(())
    }

    async fn open_snapshot(&self) -> Result<Option<RaftSnapshot>, RaftError> {
        Ok(self.state.lock().expect("lock poisoned").snapshot.clone())
    }

    async fn monitor_log_eviction(&self, abort: CancellationToken) -> Result<Offset, RaftError> {
        let mut rx = self.eviction_rx.lock().await;
        tokio::select! {
            next = rx.recv() => next.ok_or(RaftError::ShuttingDown),
            _ = abort.cancelled() => Err(RaftError::ShuttingDown),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::{RecordBatchBuilder, RecordBatchType};

    fn data_batch(payload: &'static [u8]) -> RecordBatch {
        let mut builder = RecordBatchBuilder::new(RecordBatchType::RaftData, Offset(0));
        builder.add_raw_kv(Bytes::from_static(b"k"), Bytes::from_static(payload));
        builder.build()
    }

    struct CountingStm {
        applied: AtomicI64,
    }

    #[async_trait::async_trait]
    impl StateMachine for CountingStm {
        async fn apply(&self, batch: RecordBatch) {
            self.applied.store(batch.last_offset().0, Ordering::SeqCst);
        }

        fn last_applied_offset(&self) -> Option<Offset> {
            let v = self.applied.load(Ordering::SeqCst);
            (v >= 0).then_some(Offset(v))
        }

        fn max_collectible_offset(&self) -> Offset {
            Offset(i64::MAX)
        }
    }

    #[tokio::test]
    async fn replicate_assigns_contiguous_offsets_and_applies() {
        let raft = InMemoryRaft::new(Ntp::new("kafka", "t", 0));
        let stm = Arc::new(CountingStm {
            applied: AtomicI64::new(-1),
        });
        raft.register_stm(stm.clone());

        let term = raft.term();
        let r0 = raft
            .replicate(term, data_batch(b"a"), ReplicateOptions::quorum_ack())
            .await
            .unwrap();
        let r1 = raft
            .replicate(term, data_batch(b"b"), ReplicateOptions::quorum_ack())
            .await
            .unwrap();
        assert_eq!(r0.last_offset, Offset(0));
        assert_eq!(r1.last_offset, Offset(1));
        assert_eq!(stm.last_applied_offset(), Some(Offset(1)));
        assert_eq!(raft.committed_offset(), Some(Offset(1)));
    }

    #[tokio::test]
    async fn replicate_rejects_stale_term_and_non_leader() {
        let raft = InMemoryRaft::new(Ntp::new("kafka", "t", 0));
        let stale = raft.term();
        raft.bump_term();
        let err = raft
            .replicate(stale, data_batch(b"a"), ReplicateOptions::quorum_ack())
            .await
            .unwrap_err();
        assert_eq!(err, RaftError::TermChanged);

        raft.set_leader(false);
        let err = raft
            .replicate(raft.term(), data_batch(b"a"), ReplicateOptions::quorum_ack())
            .await
            .unwrap_err();
        assert_eq!(err, RaftError::NotLeader);
    }

    #[tokio::test]
    async fn snapshot_prefix_truncates_the_log() {
        let raft = InMemoryRaft::new(Ntp::new("kafka", "t", 0));
        let term = raft.term();
        for _ in 0..4 {
            raft.replicate(term, data_batch(b"x"), ReplicateOptions::quorum_ack())
                .await
                .unwrap();
        }
        raft.write_snapshot(WriteSnapshotCfg::new(Offset(1), Bytes::new()))
            .await
            .unwrap();
        assert_eq!(raft.last_snapshot_index(), Some(Offset(1)));
        assert_eq!(raft.start_offset(), Offset(2));
        // Regressions are ignored.
        raft.write_snapshot(WriteSnapshotCfg::new(Offset(0), Bytes::new()))
            .await
            .unwrap();
        assert_eq!(raft.last_snapshot_index(), Some(Offset(1)));

        assert_eq!(raft.index_lower_bound(Offset(2)), Some(Offset(2)));
        assert_eq!(raft.index_lower_bound(Offset(10)), Some(Offset(3)));
    }

    #[tokio::test]
    async fn eviction_monitor_delivers_signals() {
        let raft = InMemoryRaft::new(Ntp::new("kafka", "t", 0));
        raft.signal_log_eviction(Offset(17));
        let abort = CancellationToken::new();
        let got = raft.monitor_log_eviction(abort.clone()).await.unwrap();
        assert_eq!(got, Offset(17));

        abort.cancel();
        let err = raft.monitor_log_eviction(abort).await.unwrap_err();
        assert_eq!(err, RaftError::ShuttingDown);
    }
}
