// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Delete-records end to end: a replicated prefix truncation advances the
//! effective start offset, the raft log snapshots behind it, and the cloud
//! tier truncates and garbage collects its archive through the start-offset
//! override.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use shoal_archival::{ArchivalProbe, NtpArchiver};
use shoal_base::retry::RetryChainNode;
use shoal_base::CancellationToken;
use shoal_cloud_storage::{
    Blob, CloudStorageError, CloudStorageMetrics, MemBlob, PartitionManifest, Remote, RemoteLabel,
    RemotePathProvider,
};
use shoal_cluster::LogEvictionStm;
use shoal_config::{ShoalConfig, TopicRetentionConfig};
use shoal_model::{InitialRevisionId, KafkaOffset, Ntp, Offset, Term, Timestamp};
use shoal_raft::mem::InMemoryRaft;
use shoal_raft::{Raft, RecordBatchBuilder, RecordBatchType, ReplicateOptions};
use shoal_storage::{InMemoryLog, KvStore, LogReader, MemKvStore, SegmentInfo};

const REV: InitialRevisionId = InitialRevisionId(7);
const DEADLINE: Duration = Duration::from_secs(5);

async fn fill_raft(raft: &Arc<InMemoryRaft>, records: usize) {
    for i in 0..records {
        let mut builder = RecordBatchBuilder::new(RecordBatchType::RaftData, Offset(0));
        builder.add_raw_kv(
            Bytes::from(format!("k{i}")),
            Bytes::from_static(b"payload"),
        );
        raft.replicate(raft.term(), builder.build(), ReplicateOptions::quorum_ack())
            .await
            .unwrap();
    }
}

fn roll_segments(log: &InMemoryLog, count: usize) {
    for _ in 0..count {
        let base = log
            .segments()
            .last()
            .map_or(Offset(0), |s| s.committed_offset.next());
        let committed = Offset(base.0 + 9);
        log.add_segment(
            SegmentInfo {
                base_offset: base,
                committed_offset: committed,
                size_bytes: 1280,
                term: Term(1),
                base_timestamp: Timestamp(base.0 * 1000),
                max_timestamp: Timestamp(committed.0 * 1000),
                is_compacted: false,
                finished_self_compaction: false,
            },
            Bytes::from(vec![0x5a; 1280]),
        );
    }
}

#[tokio::test]
async fn delete_records_truncates_the_cloud_tier() {
    let cfg = Arc::new(ShoalConfig::new_for_tests());
    cfg.cloud_storage_spillover_manifest_max_segments.set(Some(1));
    let retention = Arc::new(TopicRetentionConfig::new());
    let ntp = Ntp::new("kafka", "deleted", 0);

    let raft = InMemoryRaft::new(ntp.clone());
    let kvstore = Arc::new(MemKvStore::new());
    let stm = LogEvictionStm::new(raft.clone(), Arc::clone(&kvstore) as Arc<dyn KvStore>);
    stm.start().await;
    raft.register_stm(stm.state_machine());

    // Thirty records in raft; the same range rolled into three closed local
    // segments.
    fill_raft(&raft, 30).await;
    let log = Arc::new(InMemoryLog::new());
    roll_segments(&log, 3);

    let blob = Arc::new(MemBlob::new());
    let provider = RemotePathProvider::new(Some(RemoteLabel::new("cl")));
    let remote = Remote::new(
        Arc::clone(&blob) as Arc<dyn Blob>,
        Arc::new(CloudStorageMetrics::new_unregistered()),
    );
    let manifest = Arc::new(RwLock::new(PartitionManifest::new(ntp.clone(), REV)));
    let archiver = NtpArchiver::new(
        ntp,
        REV,
        raft.clone(),
        Arc::clone(&log) as Arc<dyn LogReader>,
        Arc::clone(&manifest),
        remote,
        provider,
        &cfg,
        retention,
        Arc::new(ArchivalProbe::new_unregistered()),
    );

    // Archive everything: two shards ([0..9], [10..19]) plus the live tail.
    let mut rtc = RetryChainNode::new(
        Duration::from_secs(10),
        Duration::from_millis(1),
        CancellationToken::new(),
    );
    archiver.upload_next_candidates(&mut rtc).await.unwrap();
    archiver.apply_spillover(&mut rtc).await.unwrap();
    assert_eq!(manifest.read().unwrap().spillover().len(), 2);

    // The client deletes everything below offset 15.
    stm.truncate(Offset(15), DEADLINE, None).await.unwrap();
    assert_eq!(stm.effective_start_offset(), Offset(15));
    assert_eq!(stm.sync_effective_start(DEADLINE).await.unwrap(), Offset(15));

    // The background snapshotter trims the raft log up to the boundary.
    tokio::time::timeout(DEADLINE, async {
        while raft.start_offset() < Offset(15) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("raft snapshot was never written");

    // The new start propagates to the cloud tier as a kafka-space override
    // (no control batches below, so the spaces coincide).
    manifest
        .write()
        .unwrap()
        .advance_start_kafka_offset(KafkaOffset(15));
    archiver.apply_retention(&mut rtc).await.unwrap();

    let m = manifest.read().unwrap().clone();
    // The override lands inside [10..19], so that segment's base becomes
    // the archive start and the [0..9] shard is garbage collected.
    assert_eq!(m.archive_start_offset(), Some(Offset(10)));
    assert_eq!(m.archive_clean_offset(), Some(Offset(10)));
    assert_eq!(m.spillover().len(), 1);
    let keys = blob.keys();
    assert!(!keys.iter().any(|k| k.ends_with("/0-1-v3.log.1")), "{keys:?}");
    assert!(!keys.iter().any(|k| k.contains("manifest.bin.0.9")), "{keys:?}");

    // Readers below the new start are refused.
    let err = archiver.view().get_active(Offset(0)).await.unwrap_err();
    assert!(matches!(err, CloudStorageError::OutOfRange(_)), "{err}");
    archiver.stop();
    stm.stop();
}
