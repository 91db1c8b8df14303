// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-partition archiver.
//!
//! Owns one partition's upload pipeline while this replica is the leader:
//!
//!   - the upload loop ships the next contiguous run of closed local
//!     segments and flushes the manifest after each round (a segment counts
//!     as uploaded only once both the segment PUT and the manifest PUT
//!     succeeded);
//!   - housekeeping merges small adjacent uploads, spills the manifest head
//!     into archive shards once it outgrows its budget, and applies
//!     retention through the async manifest view;
//!   - on (re)gaining leadership the archiver reconciles its manifest with
//!     the copy in the object store before uploading anything.
//!
//! All mutation of the manifest happens on this path; readers share it
//! through the view.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use shoal_base::retry::RetryChainNode;
use shoal_base::task::AbortOnDropHandle;
use shoal_base::CancellationToken;
use shoal_cloud_storage::{
    AsyncManifestView, PartitionManifest, Remote, RemotePathProvider, SpilloverManifest,
};
use shoal_config::{ShoalConfig, TopicRetentionConfig};
use shoal_model::{InitialRevisionId, Ntp, Offset, SegmentMeta, SegmentNameFormat};
use shoal_raft::Raft;
use shoal_storage::{LogReader, SegmentInfo};
use tracing::{debug, info, warn};

use crate::housekeeping::HousekeepingJob;
use crate::probe::ArchivalProbe;
use crate::segment_collector::SegmentCollector;
use crate::ArchivalError;

const UPLOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(300);
const BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of one upload round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub num_succeeded: usize,
    pub last_offset: Option<Offset>,
}

pub struct NtpArchiver {
    ntp: Ntp,
    revision: InitialRevisionId,
    raft: Arc<dyn Raft>,
    log: Arc<dyn LogReader>,
    stm: Arc<RwLock<PartitionManifest>>,
    view: AsyncManifestView,
    remote: Remote,
    provider: RemotePathProvider,
    retention: Arc<TopicRetentionConfig>,
    probe: Arc<ArchivalProbe>,
    jobs: Mutex<Vec<Arc<dyn HousekeepingJob>>>,
    disable_upload_loop: shoal_config::Binding<bool>,
    max_concurrent_uploads: shoal_config::Binding<usize>,
    spillover_max_segments: shoal_config::Binding<Option<usize>>,
    spillover_max_size: shoal_config::Binding<Option<u64>>,
    abort: CancellationToken,
    fibers: Mutex<Vec<AbortOnDropHandle<()>>>,
}

impl NtpArchiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ntp: Ntp,
        revision: InitialRevisionId,
        raft: Arc<dyn Raft>,
        log: Arc<dyn LogReader>,
        stm: Arc<RwLock<PartitionManifest>>,
        remote: Remote,
        provider: RemotePathProvider,
        cfg: &ShoalConfig,
        retention: Arc<TopicRetentionConfig>,
        probe: Arc<ArchivalProbe>,
    ) -> Arc<Self> {
        let view = AsyncManifestView::new(
            Arc::clone(&stm),
            remote.clone(),
            provider.clone(),
            cfg,
        );
        Arc::new(NtpArchiver {
            ntp,
            revision,
            raft,
            log,
            stm,
            view,
            remote,
            provider,
            retention,
            probe,
            jobs: Mutex::new(Vec::new()),
            disable_upload_loop: cfg.cloud_storage_disable_upload_loop_for_tests.bind(),
            max_concurrent_uploads: cfg.cloud_storage_max_concurrent_uploads.bind(),
            spillover_max_segments: cfg.cloud_storage_spillover_manifest_max_segments.bind(),
            spillover_max_size: cfg.cloud_storage_spillover_manifest_size.bind(),
            abort: CancellationToken::new(),
            fibers: Mutex::new(Vec::new()),
        })
    }

    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    pub fn view(&self) -> &AsyncManifestView {
        &self.view
    }

    /// Spawns the upload and housekeeping loops.
    pub fn start(self: &Arc<Self>) {
        let mut fibers = self.fibers.lock().expect("lock poisoned");
        let this = Arc::clone(self);
        let name = format!("archival::upload_loop/{}", self.ntp);
        fibers.push(AbortOnDropHandle(shoal_base::task::spawn(
            move || name,
            async move { this.upload_loop().await },
        )));
        let this = Arc::clone(self);
        let name = format!("archival::housekeeping_loop/{}", self.ntp);
        fibers.push(AbortOnDropHandle(shoal_base::task::spawn(
            move || name,
            async move { this.housekeeping_loop().await },
        )));
    }

    pub fn stop(&self) {
        self.abort.cancel();
        for job in self.jobs.lock().expect("lock poisoned").iter() {
            job.interrupt();
        }
        self.fibers.lock().expect("lock poisoned").clear();
    }

    /// Registers a housekeeping job to run on every housekeeping pass.
    pub fn register_housekeeping_job(&self, job: Arc<dyn HousekeepingJob>) {
        self.jobs.lock().expect("lock poisoned").push(job);
    }

    async fn upload_loop(self: Arc<Self>) {
        let mut synced_term = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(UPLOAD_POLL_INTERVAL) => {}
                _ = self.abort.cancelled() => return,
            }
            if self.disable_upload_loop.get() || !self.raft.is_leader() {
                continue;
            }
            // Re-entrancy across leadership changes: reconcile with the
            // uploaded manifest once per term before uploading.
            let term = self.raft.term();
            if synced_term != Some(term) {
                let mut rtc = self.rtc(UPLOAD_TIMEOUT);
                match self.sync_manifest(&mut rtc).await {
                    Ok(()) => synced_term = Some(term),
                    Err(e) => {
                        warn!(ntp = %self.ntp, error = %e, "manifest sync failed");
                        continue;
                    }
                }
            }
            let mut rtc = self.rtc(UPLOAD_TIMEOUT);
            match self.upload_next_candidates(&mut rtc).await {
                Ok(summary) if summary.num_succeeded > 0 => {
                    debug!(ntp = %self.ntp, ?summary, "uploaded segments");
                }
                Ok(_) => {}
                Err(ArchivalError::ShuttingDown) => return,
                Err(e) => warn!(ntp = %self.ntp, error = %e, "upload round failed"),
            }
        }
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {}
                _ = self.abort.cancelled() => return,
            }
            if !self.raft.is_leader() {
                continue;
            }
            let mut rtc = self.rtc(HOUSEKEEPING_TIMEOUT);
            match self.housekeeping(&mut rtc).await {
                Ok(()) => {}
                Err(ArchivalError::ShuttingDown) => return,
                Err(e) => warn!(ntp = %self.ntp, error = %e, "housekeeping failed"),
            }
        }
    }

    fn rtc(&self, timeout: Duration) -> RetryChainNode {
        RetryChainNode::new(timeout, BACKOFF, self.abort.child_token())
    }

    /// Adopts the uploaded manifest when it is ahead of the local one,
    /// which happens when another replica archived under a previous term.
    pub async fn sync_manifest(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError> {
        let key = self
            .provider
            .partition_manifest_path(&self.ntp, self.revision);
        let Some(uploaded) = self.remote.download_manifest(rtc, &key).await? else {
            return Ok(());
        };
        let mut stm = self.stm.write().expect("lock poisoned");
        if uploaded.last_offset() > stm.last_offset() {
            info!(
                ntp = %self.ntp,
                local = ?stm.last_offset(),
                uploaded = ?uploaded.last_offset(),
                "adopting uploaded manifest"
            );
            *stm = uploaded;
        }
        Ok(())
    }

    /// Uploads the next contiguous run of closed local segments past the
    /// manifest end, then flushes the manifest. PUTs run with bounded
    /// concurrency; manifest entries are added in offset order.
    pub async fn upload_next_candidates(
        &self,
        rtc: &mut RetryChainNode,
    ) -> Result<UploadSummary, ArchivalError> {
        if !self.raft.is_leader() {
            return Err(ArchivalError::NotLeader);
        }
        let term = self.raft.term();
        let manifest_last = self.stm.read().expect("lock poisoned").last_offset();
        let candidates: Vec<SegmentInfo> = self
            .log
            .segments()
            .into_iter()
            .filter(|info| manifest_last.map_or(true, |last| info.base_offset > last))
            .collect();
        if candidates.is_empty() {
            return Ok(UploadSummary::default());
        }

        let concurrency = self.max_concurrent_uploads.get().max(1);
        let mut uploaded: Vec<SegmentMeta> = Vec::new();
        for window in candidates.chunks(concurrency) {
            let mut in_flight = FuturesUnordered::new();
            for info in window {
                let meta = self.make_meta(info, term);
                let key = self.provider.segment_path(&self.ntp, self.revision, &meta);
                let mut child = rtc.child(UPLOAD_TIMEOUT, BACKOFF);
                in_flight.push(async move {
                    let body = self.log.read_segment(meta.base_offset).await?;
                    self.remote.upload_segment(&mut child, &key, body).await?;
                    Ok::<SegmentMeta, ArchivalError>(meta)
                });
            }
            while let Some(res) = in_flight.next().await {
                match res {
                    Ok(meta) => uploaded.push(meta),
                    Err(e) => {
                        self.probe.failed_uploads.inc();
                        return Err(e);
                    }
                }
            }
        }
        uploaded.sort_by_key(|meta| meta.base_offset);

        let summary = {
            let mut stm = self.stm.write().expect("lock poisoned");
            let mut summary = UploadSummary::default();
            for meta in uploaded {
                stm.add(meta).map_err(shoal_cloud_storage::CloudStorageError::from)?;
                self.probe.uploaded_segments.inc();
                self.probe.uploaded_bytes.inc_by(meta.size_bytes);
                summary.num_succeeded += 1;
                summary.last_offset = Some(meta.committed_offset);
            }
            if let Some(committed) = self.raft.committed_offset() {
                stm.advance_insync_offset(committed);
            }
            summary
        };
        // An upload only counts once the manifest referencing it is
        // uploaded as well.
        self.flush_manifest(rtc).await?;
        Ok(summary)
    }

    /// One housekeeping pass: registered jobs (merging among them), then
    /// spillover, then retention.
    pub async fn housekeeping(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError> {
        let jobs: Vec<Arc<dyn HousekeepingJob>> =
            self.jobs.lock().expect("lock poisoned").clone();
        for job in jobs {
            if job.interrupted() {
                continue;
            }
            if let Err(e) = job.run(rtc).await {
                warn!(ntp = %self.ntp, job = job.name(), error = %e, "housekeeping job failed");
            }
        }
        self.apply_spillover(rtc).await?;
        self.apply_retention(rtc).await?;
        Ok(())
    }

    /// Spills the manifest head into archive shards until the live
    /// manifest fits its segment-count and size budgets. Each shard itself
    /// honors the same budgets, so one oversized head spills as several
    /// sections rather than one giant shard.
    pub async fn apply_spillover(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError> {
        loop {
            let (max_segments, max_size) =
                (self.spillover_max_segments.get(), self.spillover_max_size.get());
            let upper = {
                let stm = self.stm.read().expect("lock poisoned");
                spillover_boundary(&stm, max_segments, max_size).map(|keep_boundary| {
                    shard_upper_bound(&stm, keep_boundary, max_segments, max_size)
                })
            };
            let Some(upper) = upper else { return Ok(()) };

            // Build and upload the shard before the manifest forgets the
            // segments; a crash in between leaves only an unreferenced
            // object behind.
            let shard = {
                let stm = self.stm.read().expect("lock poisoned");
                let spilled: Vec<SegmentMeta> = stm
                    .segments()
                    .take_while(|s| s.committed_offset < upper)
                    .copied()
                    .collect();
                SpilloverManifest::from_segments(self.ntp.clone(), self.revision, spilled)
                    .map_err(shoal_cloud_storage::CloudStorageError::from)?
            };
            let key = {
                let stm = self.stm.read().expect("lock poisoned");
                shard.object_key(&self.provider, &stm)
            };
            let mut child = rtc.child(UPLOAD_TIMEOUT, BACKOFF);
            self.remote
                .upload_spillover_manifest(&mut child, &key, &shard)
                .await?;

            {
                let mut stm = self.stm.write().expect("lock poisoned");
                stm.spillover(upper)
                    .map_err(shoal_cloud_storage::CloudStorageError::from)?;
                if stm.archive_start_offset().is_none() {
                    let first = shard
                        .manifest()
                        .segments()
                        .next()
                        .expect("spillover manifest can't be empty");
                    stm.set_archive_start_offset(first.base_offset, first.delta_offset);
                }
            }
            self.probe.spillover_manifests.inc();
            info!(ntp = %self.ntp, %upper, %key, "spilled manifest head");
            self.flush_manifest(rtc).await?;
        }
    }

    /// Applies the topic's retention policy to the cloud log and garbage
    /// collects the archive below the clean offset.
    pub async fn apply_retention(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError> {
        let max_bytes = self.retention.retention_bytes.get();
        let max_age = self.retention.retention_ms.get();
        let has_override = self
            .stm
            .read()
            .expect("lock poisoned")
            .start_kafka_offset_override()
            .is_some();
        // Delete-records moves the start override even on topics with no
        // retention policy; that alone forces a pass.
        if max_bytes.is_none() && max_age.is_none() && !has_override {
            return Ok(());
        }
        let update = self.view.compute_retention(max_bytes, max_age).await?;
        if update.offset > Offset(0) {
            self.probe.retention_runs.inc();
            info!(ntp = %self.ntp, offset = %update.offset, "advancing archive start for retention");
            self.stm
                .write()
                .expect("lock poisoned")
                .set_archive_start_offset(update.offset, update.delta);
            self.flush_manifest(rtc).await?;
        }
        self.garbage_collect_archive(rtc).await
    }

    /// Deletes archive shards (and their segments) that lie wholly below
    /// the archive start offset, then advances the clean offset.
    pub async fn garbage_collect_archive(
        &self,
        rtc: &mut RetryChainNode,
    ) -> Result<(), ArchivalError> {
        let Some(start) = self
            .stm
            .read()
            .expect("lock poisoned")
            .archive_start_offset()
        else {
            return Ok(());
        };
        let mut cursor = match self.view.get_retention_backlog().await {
            Ok(cursor) => cursor,
            Err(shoal_cloud_storage::CloudStorageError::OutOfRange(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut clean_until: Option<Offset> = None;
        let mut bytes_removed: u64 = 0;
        loop {
            let shard_info = cursor.with_manifest(|m| {
                m.last_offset().map(|last| {
                    let keys: Vec<String> = m
                        .segments()
                        .map(|seg| self.provider.segment_path(&self.ntp, self.revision, seg))
                        .collect();
                    let bytes: u64 = m.segments().map(|s| s.size_bytes).sum();
                    (keys, bytes, last)
                })
            });
            let Ok(Some((mut keys, bytes, shard_last))) = shard_info else {
                break;
            };
            if shard_last >= start {
                // The shard straddles the start offset; it is still
                // addressable and must survive.
                break;
            }
            let shard_key = cursor
                .with_manifest(|m| {
                    SpilloverManifest::from(m.clone()).object_key(&self.provider, m)
                })
                .map_err(shoal_cloud_storage::CloudStorageError::from)?;
            keys.push(shard_key);
            let mut child = rtc.child(UPLOAD_TIMEOUT, BACKOFF);
            self.remote.delete_objects(&mut child, &keys).await?;
            self.probe.gc_deleted_objects.inc_by(keys.len() as u64);
            bytes_removed += bytes;
            clean_until = Some(shard_last.next());
            if !cursor.next().await? {
                break;
            }
        }
        if let Some(clean) = clean_until {
            self.stm
                .write()
                .expect("lock poisoned")
                .set_archive_clean_offset(clean, bytes_removed)
                .map_err(shoal_cloud_storage::CloudStorageError::from)?;
            info!(ntp = %self.ntp, %clean, bytes_removed, "garbage collected archive prefix");
            self.flush_manifest(rtc).await?;
        }
        Ok(())
    }

    /// Merges a run of small adjacent uploaded segments into one re-upload
    /// when the collector finds a replaceable range. Returns the offset the
    /// next scan should start from.
    pub async fn maybe_merge_adjacent(
        &self,
        rtc: &mut RetryChainNode,
        scan_start: Offset,
        target_size: u64,
        min_size: Option<u64>,
    ) -> Result<Option<Offset>, ArchivalError> {
        let manifest_snapshot = self.stm.read().expect("lock poisoned").clone();
        let mut collector =
            SegmentCollector::new(scan_start, &manifest_snapshot, self.log.as_ref(), target_size);
        collector.collect_segments();
        if !collector.can_replace_manifest_segment() {
            return Ok(None);
        }
        let replaced: Vec<SegmentMeta> = manifest_snapshot
            .segments()
            .filter(|s| {
                collector.begin_inclusive() <= s.base_offset
                    && s.committed_offset <= collector.end_inclusive()
            })
            .copied()
            .collect();
        let replaced_bytes: u64 = replaced.iter().map(|s| s.size_bytes).sum();
        // Merging pays for itself when several entries collapse into one or
        // compaction shrank the data; a lone entry above the minimum size
        // is left alone.
        let worthwhile = replaced.len() >= 2
            || collector.collected_size_bytes() < replaced_bytes
            || min_size.map_or(false, |min| replaced_bytes < min);
        if !worthwhile {
            return Ok(None);
        }

        let term = self.raft.term();
        let mut body = Vec::with_capacity(collector.collected_size_bytes() as usize);
        for info in collector.segments() {
            let data = self.log.read_segment(info.base_offset).await?;
            body.extend_from_slice(&data);
            tokio::task::yield_now().await;
        }
        let first = collector.segments().first().expect("nonempty collection");
        let last = collector.segments().last().expect("nonempty collection");
        let merged = SegmentMeta {
            is_compacted: true,
            size_bytes: body.len() as u64,
            base_offset: collector.begin_inclusive(),
            committed_offset: collector.end_inclusive(),
            base_timestamp: first.base_timestamp,
            max_timestamp: last.max_timestamp,
            delta_offset: self.delta_below(collector.begin_inclusive()),
            delta_offset_end: self.raft.offset_delta(collector.end_inclusive()),
            ntp_revision: self.revision,
            segment_term: first.term,
            archiver_term: term,
            sname_format: SegmentNameFormat::V3,
        };
        let key = self.provider.segment_path(&self.ntp, self.revision, &merged);
        debug_assert!(key.contains(collector.adjust_segment_name().as_str()));
        let mut child = rtc.child(UPLOAD_TIMEOUT, BACKOFF);
        self.remote
            .upload_segment(&mut child, &key, bytes::Bytes::from(body))
            .await?;
        {
            let mut stm = self.stm.write().expect("lock poisoned");
            stm.replace_range(merged)
                .map_err(shoal_cloud_storage::CloudStorageError::from)?;
        }
        self.probe.merged_segments.inc_by(replaced.len() as u64);
        info!(
            ntp = %self.ntp,
            begin = %collector.begin_inclusive(),
            end = %collector.end_inclusive(),
            replaced = replaced.len(),
            "merged adjacent segments"
        );
        self.flush_manifest(rtc).await?;
        Ok(Some(collector.end_inclusive().next()))
    }

    /// Uploads the current manifest (and its legacy JSON mirror under the
    /// prefixed layout).
    pub async fn flush_manifest(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError> {
        let snapshot = self.stm.read().expect("lock poisoned").clone();
        let key = self
            .provider
            .partition_manifest_path(&self.ntp, self.revision);
        self.remote.upload_manifest(rtc, &key, &snapshot).await?;
        if let Some(json_key) = self
            .provider
            .partition_manifest_path_json(&self.ntp, self.revision)
        {
            let body = bytes::Bytes::from(snapshot.to_legacy_json());
            self.remote.upload_object(rtc, &json_key, body).await?;
        }
        Ok(())
    }

    fn make_meta(&self, info: &SegmentInfo, archiver_term: shoal_model::Term) -> SegmentMeta {
        SegmentMeta {
            is_compacted: info.is_compacted,
            size_bytes: info.size_bytes,
            base_offset: info.base_offset,
            committed_offset: info.committed_offset,
            base_timestamp: info.base_timestamp,
            max_timestamp: info.max_timestamp,
            delta_offset: self.delta_below(info.base_offset),
            delta_offset_end: self.raft.offset_delta(info.committed_offset),
            ntp_revision: self.revision,
            segment_term: info.term,
            archiver_term,
            sname_format: SegmentNameFormat::V3,
        }
    }

    /// The offset-translation delta right below `o`, i.e. at the first
    /// record of a segment starting at `o`.
    fn delta_below(&self, o: Offset) -> shoal_model::OffsetDelta {
        if o <= Offset(0) {
            return shoal_model::OffsetDelta(0);
        }
        self.raft.offset_delta(o.prev())
    }
}

impl std::fmt::Debug for NtpArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtpArchiver")
            .field("ntp", &self.ntp)
            .finish_non_exhaustive()
    }
}

/// Picks the spillover boundary: the base offset of the first segment to
/// keep so that the remaining live manifest fits both budgets. `None` when
/// the manifest already fits. At least one segment always stays live.
fn spillover_boundary(
    stm: &PartitionManifest,
    max_segments: Option<usize>,
    max_size: Option<u64>,
) -> Option<Offset> {
    let len = stm.len();
    if len <= 1 {
        return None;
    }
    let over_count = max_segments.map_or(false, |max| len > max);
    let over_size = max_size.map_or(false, |max| stm.stm_size_bytes() > max);
    if !over_count && !over_size {
        return None;
    }
    let mut keep_count = 0usize;
    let mut keep_bytes = 0u64;
    let mut boundary = None;
    // Walk from the newest end, keeping segments while they fit.
    for seg in stm.segments().collect::<Vec<_>>().into_iter().rev() {
        let fits_count = max_segments.map_or(true, |max| keep_count + 1 <= max);
        let fits_size = max_size.map_or(true, |max| keep_bytes + seg.size_bytes <= max);
        if keep_count > 0 && (!fits_count || !fits_size) {
            break;
        }
        keep_count += 1;
        keep_bytes += seg.size_bytes;
        boundary = Some(seg.base_offset);
    }
    boundary.filter(|b| Some(*b) != stm.start_offset())
}

/// Caps one spillover shard at the same budgets the live manifest honors:
/// the shard takes head segments up to `keep_boundary`, stopping early once
/// it would itself exceed the count or size limit.
fn shard_upper_bound(
    stm: &PartitionManifest,
    keep_boundary: Offset,
    max_segments: Option<usize>,
    max_size: Option<u64>,
) -> Offset {
    let mut count = 0usize;
    let mut bytes = 0u64;
    for seg in stm.segments().take_while(|s| s.base_offset < keep_boundary) {
        let fits_count = max_segments.map_or(true, |max| count + 1 <= max.max(1));
        let fits_size = max_size.map_or(true, |max| bytes + seg.size_bytes <= max);
        if count > 0 && (!fits_count || !fits_size) {
            return seg.base_offset;
        }
        count += 1;
        bytes += seg.size_bytes;
    }
    keep_boundary
}

#[cfg(test)]
mod tests {
    use shoal_model::Timestamp;

    use super::*;

    fn meta(base: i64, committed: i64, size: u64) -> SegmentMeta {
        SegmentMeta {
            size_bytes: size,
            base_offset: Offset(base),
            committed_offset: Offset(committed),
            base_timestamp: Timestamp(base),
            max_timestamp: Timestamp(committed),
            ..Default::default()
        }
    }

    fn stm(segments: &[(i64, i64, u64)]) -> PartitionManifest {
        let mut m = PartitionManifest::new(
            Ntp::new("kafka", "t", 0),
            InitialRevisionId(1),
        );
        for (b, c, s) in segments {
            m.add(meta(*b, *c, *s)).unwrap();
        }
        m
    }

    #[test]
    fn spillover_boundary_by_count() {
        let m = stm(&[(0, 9, 10), (10, 19, 10), (20, 29, 10), (30, 39, 10)]);
        // Keep at most two live segments.
        assert_eq!(spillover_boundary(&m, Some(2), None), Some(Offset(20)));
        assert_eq!(spillover_boundary(&m, Some(4), None), None);
    }

    #[test]
    fn spillover_boundary_by_size() {
        let m = stm(&[(0, 9, 100), (10, 19, 100), (20, 29, 100)]);
        assert_eq!(spillover_boundary(&m, None, Some(150)), Some(Offset(20)));
        assert_eq!(spillover_boundary(&m, None, Some(500)), None);
        // An oversized tail segment still stays live.
        let m = stm(&[(0, 9, 100), (10, 19, 1000)]);
        assert_eq!(spillover_boundary(&m, None, Some(150)), Some(Offset(10)));
    }

    #[test]
    fn spillover_boundary_never_spills_everything() {
        let m = stm(&[(0, 9, 100)]);
        assert_eq!(spillover_boundary(&m, Some(0), Some(1)), None);
    }

    #[test]
    fn shard_upper_bound_caps_sections() {
        let m = stm(&[(0, 9, 10), (10, 19, 10), (20, 29, 10), (30, 39, 10)]);
        // Keep boundary at 30; one-segment shards.
        assert_eq!(shard_upper_bound(&m, Offset(30), Some(1), None), Offset(10));
        // Size cap splits the head after two segments.
        assert_eq!(
            shard_upper_bound(&m, Offset(30), None, Some(20)),
            Offset(20)
        );
        // No cap: the whole head goes into one shard.
        assert_eq!(shard_upper_bound(&m, Offset(30), None, None), Offset(30));
    }
}
