// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end archiver tests against the in-memory raft, log and object
//! store: upload rounds, manifest flushes, spillover, retention garbage
//! collection and adjacent-segment merging.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use shoal_archival::{AdjacentSegmentMerger, ArchivalProbe, HousekeepingJob, NtpArchiver};
use shoal_base::retry::RetryChainNode;
use shoal_base::CancellationToken;
use shoal_cloud_storage::{
    Blob, CloudStorageMetrics, MemBlob, PartitionManifest, Remote, RemoteLabel, RemotePathProvider,
};
use shoal_config::{ShoalConfig, TopicRetentionConfig};
use shoal_model::{InitialRevisionId, Ntp, Offset, Term, Timestamp};
use shoal_raft::mem::InMemoryRaft;
use shoal_storage::{InMemoryLog, LogReader, SegmentInfo};

const REV: InitialRevisionId = InitialRevisionId(1);

struct Fixture {
    cfg: Arc<ShoalConfig>,
    retention: Arc<TopicRetentionConfig>,
    raft: Arc<InMemoryRaft>,
    log: Arc<InMemoryLog>,
    blob: Arc<MemBlob>,
    stm: Arc<RwLock<PartitionManifest>>,
    provider: RemotePathProvider,
    archiver: Arc<NtpArchiver>,
}

impl Fixture {
    fn new() -> Self {
        let cfg = Arc::new(ShoalConfig::new_for_tests());
        let retention = Arc::new(TopicRetentionConfig::new());
        let ntp = Ntp::new("kafka", "audit", 0);
        let raft = InMemoryRaft::new(ntp.clone());
        let log = Arc::new(InMemoryLog::new());
        let blob = Arc::new(MemBlob::new());
        let stm = Arc::new(RwLock::new(PartitionManifest::new(ntp.clone(), REV)));
        let provider = RemotePathProvider::new(Some(RemoteLabel::new("cluster-1")));
        let remote = Remote::new(
            Arc::clone(&blob) as Arc<dyn Blob>,
            Arc::new(CloudStorageMetrics::new_unregistered()),
        );
        let archiver = NtpArchiver::new(
            ntp,
            REV,
            raft.clone(),
            Arc::clone(&log) as Arc<dyn LogReader>,
            Arc::clone(&stm),
            remote,
            provider.clone(),
            &cfg,
            Arc::clone(&retention),
            Arc::new(ArchivalProbe::new_unregistered()),
        );
        Fixture {
            cfg,
            retention,
            raft,
            log,
            blob,
            stm,
            provider,
            archiver,
        }
    }

    /// Appends `count` closed 10-record segments to the local log.
    fn roll_segments(&self, count: usize, compacted: bool) {
        for _ in 0..count {
            let base = self
                .log
                .segments()
                .last()
                .map_or(Offset(0), |s| s.committed_offset.next());
            let committed = Offset(base.0 + 9);
            self.log.add_segment(
                SegmentInfo {
                    base_offset: base,
                    committed_offset: committed,
                    size_bytes: 1280,
                    term: Term(1),
                    base_timestamp: Timestamp(base.0 * 1000),
                    max_timestamp: Timestamp(committed.0 * 1000),
                    is_compacted: compacted,
                    finished_self_compaction: compacted,
                },
                Bytes::from(vec![0x5a; 1280]),
            );
        }
    }

    fn rtc(&self) -> RetryChainNode {
        RetryChainNode::new(
            Duration::from_secs(10),
            Duration::from_millis(1),
            CancellationToken::new(),
        )
    }

    fn manifest_key(&self) -> String {
        self.provider
            .partition_manifest_path(self.stm.read().unwrap().ntp(), REV)
    }
}

#[tokio::test]
async fn upload_round_ships_new_segments_and_flushes_manifest() {
    let fx = Fixture::new();
    fx.roll_segments(3, false);

    let mut rtc = fx.rtc();
    let summary = fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();
    assert_eq!(summary.num_succeeded, 3);
    assert_eq!(summary.last_offset, Some(Offset(29)));

    let stm = fx.stm.read().unwrap().clone();
    assert_eq!(stm.len(), 3);
    assert_eq!(stm.last_offset(), Some(Offset(29)));

    // Segment objects and the manifest are both in the store.
    let keys = fx.blob.keys();
    assert!(keys.iter().any(|k| k.ends_with("/0-1-v3.log.1")), "{keys:?}");
    assert!(keys.contains(&fx.manifest_key()), "{keys:?}");

    // Nothing new: the next round is a no-op.
    let summary = fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();
    assert_eq!(summary.num_succeeded, 0);
}

#[tokio::test]
async fn upload_requires_leadership() {
    let fx = Fixture::new();
    fx.roll_segments(1, false);
    fx.raft.set_leader(false);
    let mut rtc = fx.rtc();
    assert!(fx
        .archiver
        .upload_next_candidates(&mut rtc)
        .await
        .is_err());
}

#[tokio::test]
async fn spillover_moves_the_manifest_head_to_the_archive() {
    let fx = Fixture::new();
    fx.cfg
        .cloud_storage_spillover_manifest_max_segments
        .set(Some(2));
    fx.roll_segments(5, false);

    let mut rtc = fx.rtc();
    fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();
    fx.archiver.apply_spillover(&mut rtc).await.unwrap();

    let stm = fx.stm.read().unwrap().clone();
    assert!(stm.len() <= 2, "live manifest still holds {} entries", stm.len());
    assert!(!stm.spillover().is_empty());
    assert_eq!(stm.archive_start_offset(), Some(Offset(0)));
    // The shard object is addressable by its content-derived key.
    let shard = stm.spillover()[0];
    let keys = fx.blob.keys();
    assert!(
        keys.iter().any(|k| k.contains(&format!(
            "manifest.bin.{}.{}",
            shard.base_offset, shard.committed_offset
        ))),
        "{keys:?}"
    );
}

#[tokio::test]
async fn retention_advances_start_and_garbage_collects() {
    let fx = Fixture::new();
    fx.cfg
        .cloud_storage_spillover_manifest_max_segments
        .set(Some(1));
    let mut rtc = fx.rtc();

    // Two rounds of upload + spillover produce two archive shards.
    fx.roll_segments(2, false);
    fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();
    fx.archiver.apply_spillover(&mut rtc).await.unwrap();
    fx.roll_segments(1, false);
    fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();
    fx.archiver.apply_spillover(&mut rtc).await.unwrap();

    let stm = fx.stm.read().unwrap().clone();
    assert_eq!(stm.spillover().len(), 2);
    let total = stm.cloud_log_size_bytes();
    assert_eq!(total, 3 * 1280);

    // A budget one byte short of "everything but the first segment" moves
    // the start to the second segment.
    fx.retention.retention_bytes.set(Some(total - 1281));
    fx.archiver.apply_retention(&mut rtc).await.unwrap();

    let stm = fx.stm.read().unwrap().clone();
    assert_eq!(stm.archive_start_offset(), Some(Offset(10)));
    assert_eq!(stm.archive_clean_offset(), Some(Offset(10)));
    // The first shard and its segment are gone from the store and from the
    // spillover map.
    assert_eq!(stm.spillover().len(), 1);
    let keys = fx.blob.keys();
    assert!(
        !keys.iter().any(|k| k.ends_with("/0-1-v3.log.1")),
        "{keys:?}"
    );
    assert!(
        !keys.iter().any(|k| k.contains("manifest.bin.0.9")),
        "{keys:?}"
    );
}

#[tokio::test]
async fn merger_collapses_small_adjacent_segments() {
    let fx = Fixture::new();
    fx.roll_segments(3, true);
    let mut rtc = fx.rtc();
    fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();
    assert_eq!(fx.stm.read().unwrap().len(), 3);

    let merger = AdjacentSegmentMerger::new(&fx.archiver, &fx.cfg);
    merger.run(&mut rtc).await.unwrap();

    let stm = fx.stm.read().unwrap().clone();
    assert_eq!(stm.len(), 1);
    let merged = stm.last_segment().unwrap();
    assert_eq!(merged.base_offset, Offset(0));
    assert_eq!(merged.committed_offset, Offset(29));
    assert_eq!(merged.size_bytes, 3 * 1280);
    // The merged object was published under the aligned name.
    let keys = fx.blob.keys();
    assert!(keys.iter().any(|k| k.ends_with("/0-1-v3.log.1")), "{keys:?}");
}

#[tokio::test]
async fn registered_jobs_run_during_housekeeping() {
    let fx = Fixture::new();
    fx.roll_segments(3, true);
    let mut rtc = fx.rtc();
    fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();

    let merger = Arc::new(AdjacentSegmentMerger::new(&fx.archiver, &fx.cfg));
    fx.archiver.register_housekeeping_job(merger);
    fx.archiver.housekeeping(&mut rtc).await.unwrap();
    assert_eq!(fx.stm.read().unwrap().len(), 1);
}

#[tokio::test]
async fn merger_respects_the_config_switch() {
    let fx = Fixture::new();
    fx.cfg.cloud_storage_enable_segment_merging.set(false);
    fx.roll_segments(3, true);
    let mut rtc = fx.rtc();
    fx.archiver.upload_next_candidates(&mut rtc).await.unwrap();

    let merger = AdjacentSegmentMerger::new(&fx.archiver, &fx.cfg);
    merger.run(&mut rtc).await.unwrap();
    assert_eq!(fx.stm.read().unwrap().len(), 3);
}

#[tokio::test]
async fn upload_loop_honors_the_test_switch() {
    let fx = Fixture::new();
    fx.cfg.cloud_storage_disable_upload_loop_for_tests.set(true);
    fx.roll_segments(2, false);
    fx.archiver.start();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.stm.read().unwrap().len(), 0, "loop ran while disabled");

    fx.cfg
        .cloud_storage_disable_upload_loop_for_tests
        .set(false);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.stm.read().unwrap().len(), 2);
    fx.archiver.stop();
}
