// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end tests of the async manifest view against an in-memory object
//! store: spillover generation, cursor iteration, truncation, the retention
//! backlog and retention computation.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use shoal_base::codec::Codec;
use shoal_cloud_storage::{
    AsyncManifestView, Blob, CloudStorageError, CloudStorageMetrics, CursorStatus, MemBlob,
    PartitionManifest, Remote, RemoteLabel, RemotePathProvider, SpilloverManifest,
};
use shoal_config::ShoalConfig;
use shoal_model::{
    InitialRevisionId, Ntp, Offset, OffsetDelta, SegmentMeta, SegmentNameFormat, Term, Timestamp,
};

const SEGMENT_SIZE: u64 = 4097;
const RECORDS_PER_SEGMENT: i64 = 10;
const TS_STEP_MS: i64 = 1000;

struct Fixture {
    cfg: ShoalConfig,
    stm: Arc<RwLock<PartitionManifest>>,
    blob: Arc<MemBlob>,
    provider: RemotePathProvider,
    view: AsyncManifestView,
    /// Start offsets of every spilled shard after the first, plus the live
    /// manifest start; mirrors how readers discover section boundaries.
    spillover_starts: Vec<Offset>,
    all_segments: Vec<SegmentMeta>,
    next_ts: i64,
    next_delta: i64,
}

impl Fixture {
    fn new() -> Self {
        let cfg = ShoalConfig::new_for_tests();
        let ntp = Ntp::new("kafka", "views", 42);
        let mut manifest = PartitionManifest::new(ntp, InitialRevisionId(111));
        manifest.set_archive_start_offset(Offset(0), OffsetDelta(0));
        manifest.set_archive_clean_offset(Offset(0), 0).unwrap();
        let stm = Arc::new(RwLock::new(manifest));
        let blob = Arc::new(MemBlob::new());
        let provider = RemotePathProvider::new(Some(RemoteLabel::new("test")));
        let remote = Remote::new(
            Arc::clone(&blob) as Arc<dyn Blob>,
            Arc::new(CloudStorageMetrics::new_unregistered()),
        );
        let view = AsyncManifestView::new(Arc::clone(&stm), remote, provider.clone(), &cfg);
        Fixture {
            cfg,
            stm,
            blob,
            provider,
            view,
            spillover_starts: Vec::new(),
            all_segments: Vec::new(),
            // Ten hours of history, one segment per second.
            next_ts: Timestamp::now().as_millis() - 10 * 3600 * 1000,
            next_delta: 0,
        }
    }

    fn add_segments(&mut self, count: usize) {
        let mut stm = self.stm.write().unwrap();
        for _ in 0..count {
            let base = stm.last_offset().map_or(Offset(0), |o| o.next());
            let meta = SegmentMeta {
                is_compacted: false,
                size_bytes: SEGMENT_SIZE,
                base_offset: base,
                committed_offset: Offset(base.0 + RECORDS_PER_SEGMENT - 1),
                base_timestamp: Timestamp(self.next_ts),
                max_timestamp: Timestamp(self.next_ts),
                delta_offset: OffsetDelta(self.next_delta),
                delta_offset_end: OffsetDelta(self.next_delta + 1),
                ntp_revision: InitialRevisionId(111),
                segment_term: Term(1),
                archiver_term: Term(1),
                sname_format: SegmentNameFormat::V3,
            };
            stm.add(meta).unwrap();
            self.all_segments.push(meta);
            self.next_ts += TS_STEP_MS;
            self.next_delta += 1;
        }
    }

    /// Spills the current manifest content to the archive and generates a
    /// fresh section, uploading the shard to the object store.
    async fn generate_manifest_section(&mut self, num_segments: usize) {
        if self.stm.read().unwrap().is_empty() {
            self.add_segments(num_segments);
        }
        let so = self.stm.read().unwrap().last_offset().unwrap().next();
        self.add_segments(num_segments);
        let spilled = self.stm.write().unwrap().spillover(so).unwrap();
        let (ntp, rev) = {
            let stm = self.stm.read().unwrap();
            (stm.ntp().clone(), stm.revision())
        };
        let shard = SpilloverManifest::from_segments(ntp, rev, spilled).unwrap();
        let key = shard.object_key(&self.provider, &self.stm.read().unwrap());
        let body = Bytes::from(shard.manifest().encode_to_vec());
        self.blob.put(&key, body).await.unwrap();
        self.spillover_starts.push(so);
    }

    async fn collect(
        &self,
        mut cursor: shoal_cloud_storage::AsyncManifestViewCursor,
    ) -> Vec<SegmentMeta> {
        let mut out = Vec::new();
        loop {
            cursor
                .with_manifest(|m| out.extend(m.segments().copied()))
                .unwrap();
            if !cursor.next().await.unwrap() {
                return out;
            }
        }
    }
}

#[tokio::test]
async fn cursor_opens_at_archive_start() {
    let mut fx = Fixture::new();
    for _ in 0..3 {
        fx.generate_manifest_section(100).await;
    }
    let cursor = fx.view.get_active(Offset(0)).await.unwrap();
    cursor
        .with_manifest(|m| assert_eq!(m.start_offset(), Some(Offset(0))))
        .unwrap();
}

#[tokio::test]
async fn cursor_fetches_each_section_start() {
    let mut fx = Fixture::new();
    for _ in 0..7 {
        fx.generate_manifest_section(100).await;
    }
    for so in fx.spillover_starts.clone() {
        let cursor = fx.view.get_active(so).await.unwrap();
        cursor
            .with_manifest(|m| assert_eq!(m.start_offset(), Some(so)))
            .unwrap();
    }
}

#[tokio::test]
async fn cursor_iterates_the_whole_log() {
    let mut fx = Fixture::new();
    for _ in 0..7 {
        fx.generate_manifest_section(100).await;
    }
    let cursor = fx.view.get_active(Offset(0)).await.unwrap();
    let actual = fx.collect(cursor).await;
    assert_eq!(actual, fx.all_segments);
}

#[tokio::test]
async fn truncation_hides_the_prefix_and_feeds_the_backlog() {
    let mut fx = Fixture::new();
    for _ in 0..3 {
        fx.generate_manifest_section(100).await;
    }
    let new_so = fx.spillover_starts[1];
    let clean_boundary = fx.spillover_starts[0];
    for _ in 0..4 {
        fx.generate_manifest_section(100).await;
    }
    fx.stm
        .write()
        .unwrap()
        .set_archive_start_offset(new_so, OffsetDelta(0));

    // Offsets below the new archive start are gone.
    let err = fx.view.get_active(Offset(0)).await.unwrap_err();
    assert!(matches!(err, CloudStorageError::OutOfRange(_)), "{err}");

    let removed: Vec<SegmentMeta> = fx
        .all_segments
        .iter()
        .filter(|m| m.base_offset < new_so)
        .copied()
        .collect();
    let remaining: Vec<SegmentMeta> = fx
        .all_segments
        .iter()
        .filter(|m| m.base_offset >= new_so)
        .copied()
        .collect();

    let cursor = fx.view.get_active(new_so).await.unwrap();
    assert_eq!(fx.collect(cursor).await, remaining);

    // The backlog spans [clean, archive start).
    let backlog = fx.view.get_retention_backlog().await.unwrap();
    assert_eq!(fx.collect(backlog).await, removed);

    // Advancing the clean offset shrinks the backlog.
    fx.stm
        .write()
        .unwrap()
        .set_archive_clean_offset(clean_boundary, 0)
        .unwrap();
    let still_dirty: Vec<SegmentMeta> = removed
        .iter()
        .filter(|m| m.committed_offset >= clean_boundary)
        .copied()
        .collect();
    let backlog = fx.view.get_retention_backlog().await.unwrap();
    assert_eq!(fx.collect(backlog).await, still_dirty);
}

#[tokio::test]
async fn missing_shard_surfaces_manifest_not_found() {
    let mut fx = Fixture::new();
    for _ in 0..3 {
        fx.generate_manifest_section(10).await;
    }
    // Delete every spilled shard object; the spillover map still lists
    // them.
    let keys = fx.blob.keys();
    fx.blob.delete(&keys).await.unwrap();
    let err = fx.view.get_active(Offset(0)).await.unwrap_err();
    assert!(matches!(err, CloudStorageError::ManifestNotFound(_)), "{err}");
}

#[tokio::test]
async fn idle_cursors_are_evicted_after_the_ttl() {
    let mut fx = Fixture::new();
    fx.cfg
        .cloud_storage_manifest_cache_ttl
        .set(Duration::from_millis(100));
    for _ in 0..3 {
        fx.generate_manifest_section(10).await;
    }
    let cursor = fx.view.get_active(Offset(0)).await.unwrap();
    assert_eq!(cursor.status(), CursorStatus::Attached);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cursor.status(), CursorStatus::Evicted);
    assert!(cursor.with_manifest(|_| ()).is_err());
}

#[tokio::test]
async fn retention_computation() {
    let mut fx = Fixture::new();
    for _ in 0..10 {
        fx.generate_manifest_section(20).await;
    }
    let total: u64 = fx.all_segments.iter().map(|m| m.size_bytes).sum();
    let storage_duration = Duration::from_secs(11 * 3600);

    // Neither bound violated: nothing to do.
    let rr = fx
        .view
        .compute_retention(Some(total * 2), None)
        .await
        .unwrap();
    assert_eq!(rr, Default::default());
    let rr = fx
        .view
        .compute_retention(None, Some(storage_duration * 2))
        .await
        .unwrap();
    assert_eq!(rr, Default::default());
    let rr = fx
        .view
        .compute_retention(Some(total * 2), Some(storage_duration * 2))
        .await
        .unwrap();
    assert_eq!(rr, Default::default());

    // Size-based retention: evicting the 50-segment prefix lands the new
    // start on the 50th segment.
    let prefix: Vec<SegmentMeta> = fx.all_segments.iter().take(50).copied().collect();
    let prefix_size: u64 = prefix.iter().map(|m| m.size_bytes).sum();
    let boundary = prefix.last().unwrap();
    let rr = fx
        .view
        .compute_retention(Some(total - prefix_size), Some(storage_duration))
        .await
        .unwrap();
    assert_eq!(rr.offset, boundary.base_offset);
    assert_eq!(rr.delta, boundary.delta_offset);

    // Time-based retention: a cutoff between the 49th and 50th segment
    // timestamps lands on the same boundary.
    let age_ms = Timestamp::now().as_millis() - boundary.base_timestamp.as_millis() + 500;
    let rr = fx
        .view
        .compute_retention(Some(total), Some(Duration::from_millis(age_ms as u64)))
        .await
        .unwrap();
    assert_eq!(rr.offset, boundary.base_offset);
    assert_eq!(rr.delta, boundary.delta_offset);

    // Offset-based retention: the start kafka offset override pulls the
    // start to the segment containing it.
    let target = fx.all_segments[55];
    fx.stm
        .write()
        .unwrap()
        .advance_start_kafka_offset(target.base_kafka_offset());
    let rr = fx
        .view
        .compute_retention(Some(total), Some(storage_duration))
        .await
        .unwrap();
    assert_eq!(rr.offset, target.base_offset);
    assert_eq!(rr.delta, target.delta_offset);
}
