// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-partition index of uploaded segments.
//!
//! An ordered map from base offset to segment metadata, plus the offsets
//! that delimit what is addressable: `start_offset`/`last_offset` for the
//! live ("STM") portion, `archive_start_offset`/`archive_clean_offset` for
//! the spilled-over archive below it, and an optional kafka-space start
//! override driven by delete-records.
//!
//! Invariants maintained here:
//!   - segments never overlap; adjacent entries are contiguous or separated
//!     by a gap (gaps appear where retention deleted data);
//!   - `archive_clean_offset <= archive_start_offset <= start_offset`;
//!   - the start kafka offset override only moves forward.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shoal_model::{
    InitialRevisionId, KafkaOffset, Ntp, Offset, OffsetDelta, SegmentMeta, SegmentName,
};

/// Errors of manifest mutation. `OutOfOrder` and `BoundaryInsideSegment`
/// indicate caller bugs severe enough that state machines crash on them
/// rather than continue with a corrupt index.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("segment at {base} added out of order; last committed is {last_committed}")]
    OutOfOrder {
        base: Offset,
        last_committed: Offset,
    },
    #[error("spillover boundary {0} falls inside a segment")]
    BoundaryInsideSegment(Offset),
    #[error("archive clean offset {clean} may not exceed archive start {start}")]
    CleanAboveStart { clean: Offset, start: Offset },
    #[error("malformed manifest: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionManifest {
    ntp: Ntp,
    revision: InitialRevisionId,
    segments: BTreeMap<i64, SegmentMeta>,
    /// Ordered index of spilled-over shards; one descriptor summarizes one
    /// shard manifest (its offset window, timestamps and total size).
    spillover: Vec<SegmentMeta>,
    start_offset: Option<Offset>,
    /// Offset of the last record described by the live manifest.
    last_offset: Option<Offset>,
    /// Raft offset the manifest content is synced up to.
    insync_offset: Option<Offset>,
    archive_start_offset: Option<Offset>,
    archive_start_offset_delta: OffsetDelta,
    archive_clean_offset: Option<Offset>,
    start_kafka_offset_override: Option<KafkaOffset>,
    /// Total size of segments in the archive (spilled shards), maintained
    /// incrementally as shards are added and garbage-collected.
    archive_size_bytes: u64,
}

impl PartitionManifest {
    pub fn new(ntp: Ntp, revision: InitialRevisionId) -> Self {
        PartitionManifest {
            ntp,
            revision,
            segments: BTreeMap::new(),
            spillover: Vec::new(),
            start_offset: None,
            last_offset: None,
            insync_offset: None,
            archive_start_offset: None,
            archive_start_offset_delta: OffsetDelta(0),
            archive_clean_offset: None,
            start_kafka_offset_override: None,
            archive_size_bytes: 0,
        }
    }

    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    pub fn revision(&self) -> InitialRevisionId {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentMeta> {
        self.segments.values()
    }

    pub fn start_offset(&self) -> Option<Offset> {
        self.start_offset
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.last_offset
    }

    pub fn insync_offset(&self) -> Option<Offset> {
        self.insync_offset
    }

    pub fn advance_insync_offset(&mut self, o: Offset) {
        if self.insync_offset.map_or(true, |cur| o > cur) {
            self.insync_offset = Some(o);
        }
    }

    pub fn archive_start_offset(&self) -> Option<Offset> {
        self.archive_start_offset
    }

    pub fn archive_start_offset_delta(&self) -> OffsetDelta {
        self.archive_start_offset_delta
    }

    pub fn archive_clean_offset(&self) -> Option<Offset> {
        self.archive_clean_offset
    }

    pub fn start_kafka_offset_override(&self) -> Option<KafkaOffset> {
        self.start_kafka_offset_override
    }

    pub fn archive_size_bytes(&self) -> u64 {
        self.archive_size_bytes
    }

    /// Total size of the segments in the live manifest.
    pub fn stm_size_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.size_bytes).sum()
    }

    /// Total size of everything addressable in the cloud: archive + live.
    pub fn cloud_log_size_bytes(&self) -> u64 {
        self.archive_size_bytes + self.stm_size_bytes()
    }

    /// The spillover map: one descriptor per archived shard, in offset
    /// order.
    pub fn spillover(&self) -> &[SegmentMeta] {
        &self.spillover
    }

    /// Appends a segment. The segment must start past the current last
    /// committed offset; gaps are legal, overlap is not.
    pub fn add(&mut self, meta: SegmentMeta) -> Result<(), ManifestError> {
        if let Some(last) = self.last_offset {
            if meta.base_offset <= last {
                return Err(ManifestError::OutOfOrder {
                    base: meta.base_offset,
                    last_committed: last,
                });
            }
        }
        if self.start_offset.is_none() {
            self.start_offset = Some(meta.base_offset);
        }
        self.last_offset = Some(meta.committed_offset);
        self.segments.insert(meta.base_offset.0, meta);
        Ok(())
    }

    /// Advances the manifest start offset, dropping segments that end below
    /// it. Returns the dropped segments.
    pub fn truncate(&mut self, new_start: Offset) -> Vec<SegmentMeta> {
        let removed: Vec<SegmentMeta> = self
            .segments
            .values()
            .take_while(|s| s.committed_offset < new_start)
            .copied()
            .collect();
        for meta in &removed {
            self.segments.remove(&meta.base_offset.0);
        }
        if self.start_offset.map_or(true, |cur| new_start > cur) {
            self.start_offset = Some(new_start);
        }
        removed
    }

    /// Splits off the strict prefix of segments with
    /// `committed_offset < upper`, removes them from the live manifest and
    /// records the resulting shard in the spillover map. Fails when `upper`
    /// falls inside a segment.
    pub fn spillover(&mut self, upper: Offset) -> Result<Vec<SegmentMeta>, ManifestError> {
        if self
            .segments
            .values()
            .any(|s| s.base_offset < upper && upper <= s.committed_offset)
        {
            return Err(ManifestError::BoundaryInsideSegment(upper));
        }
        let spilled: Vec<SegmentMeta> = self
            .segments
            .values()
            .take_while(|s| s.committed_offset < upper)
            .copied()
            .collect();
        if spilled.is_empty() {
            return Ok(spilled);
        }
        for meta in &spilled {
            self.segments.remove(&meta.base_offset.0);
        }
        let first = spilled.first().expect("nonempty");
        let last = spilled.last().expect("nonempty");
        let size_bytes: u64 = spilled.iter().map(|s| s.size_bytes).sum();
        self.spillover.push(SegmentMeta {
            is_compacted: false,
            size_bytes,
            base_offset: first.base_offset,
            committed_offset: last.committed_offset,
            base_timestamp: first.base_timestamp,
            max_timestamp: last.max_timestamp,
            delta_offset: first.delta_offset,
            delta_offset_end: last.delta_offset_end,
            ntp_revision: first.ntp_revision,
            segment_term: first.segment_term,
            archiver_term: last.archiver_term,
            sname_format: last.sname_format,
        });
        self.archive_size_bytes += size_bytes;
        self.start_offset = Some(match self.segments.values().next() {
            Some(head) => head.base_offset,
            None => upper,
        });
        Ok(spilled)
    }

    /// Moves the oldest-readable boundary of the archive forward. The delta
    /// accompanies the offset so kafka-space translation at the new start
    /// needs no shard hydration.
    pub fn set_archive_start_offset(&mut self, offset: Offset, delta: OffsetDelta) {
        if self.archive_start_offset.map_or(true, |cur| offset > cur) {
            self.archive_start_offset = Some(offset);
            self.archive_start_offset_delta = delta;
        }
        if self.archive_clean_offset.is_none() {
            self.archive_clean_offset = Some(Offset(0));
        }
    }

    /// Moves the garbage-collection boundary of the archive forward, after
    /// `bytes_removed` bytes of shard data below it were deleted.
    pub fn set_archive_clean_offset(
        &mut self,
        offset: Offset,
        bytes_removed: u64,
    ) -> Result<(), ManifestError> {
        if let Some(start) = self.archive_start_offset {
            if offset > start {
                return Err(ManifestError::CleanAboveStart {
                    clean: offset,
                    start,
                });
            }
        }
        if self.archive_clean_offset.map_or(true, |cur| offset > cur) {
            self.archive_clean_offset = Some(offset);
            self.archive_size_bytes = self.archive_size_bytes.saturating_sub(bytes_removed);
            // Descriptors fully below the clean offset are garbage-collected
            // from the spillover map.
            self.spillover.retain(|s| s.committed_offset >= offset);
        }
        Ok(())
    }

    /// Raises the kafka-space start override. Returns false when the
    /// requested offset does not advance it.
    pub fn advance_start_kafka_offset(&mut self, k: KafkaOffset) -> bool {
        if self.start_kafka_offset_override.map_or(true, |cur| k > cur) {
            self.start_kafka_offset_override = Some(k);
            true
        } else {
            false
        }
    }

    /// The live segment containing the given kafka offset.
    pub fn segment_containing(&self, k: KafkaOffset) -> Option<&SegmentMeta> {
        self.segments
            .values()
            .find(|s| s.base_kafka_offset() <= k && k < s.next_kafka_offset())
    }

    /// The live segment containing the given model offset.
    pub fn segment_containing_model_offset(&self, o: Offset) -> Option<&SegmentMeta> {
        self.segments
            .values()
            .take_while(|s| s.base_offset <= o)
            .find(|s| o <= s.committed_offset)
    }

    /// The first live segment starting strictly above `o`.
    pub fn next_segment_after(&self, o: Offset) -> Option<&SegmentMeta> {
        self.segments
            .range((o.0 + 1)..)
            .next()
            .map(|(_, meta)| meta)
    }

    /// The first segment a reader may address, honoring the start kafka
    /// offset override.
    pub fn first_addressable_segment(&self) -> Option<&SegmentMeta> {
        let first = self.segments.values().next()?;
        match self.start_kafka_offset_override {
            None => Some(first),
            Some(k) if k <= first.base_kafka_offset() => Some(first),
            Some(k) => self.segments.values().find(|s| s.next_kafka_offset() > k),
        }
    }

    pub fn last_segment(&self) -> Option<&SegmentMeta> {
        self.segments.values().next_back()
    }

    /// The shard descriptor covering the given model offset, together with
    /// its index in the spillover map.
    pub fn spillover_containing(&self, o: Offset) -> Option<(usize, &SegmentMeta)> {
        // An offset below a shard's base fell into a retention gap; the
        // following shard still covers the read.
        self.spillover
            .iter()
            .enumerate()
            .find(|(_, s)| o <= s.committed_offset)
    }

    /// Replaces the manifest entries fully contained in `[meta.base_offset,
    /// meta.committed_offset]` with the single merged segment `meta`. The
    /// window must not split any entry: both ends land on entry boundaries
    /// or inside gaps. Returns the replaced entries.
    pub fn replace_range(&mut self, meta: SegmentMeta) -> Result<Vec<SegmentMeta>, ManifestError> {
        let begin = meta.base_offset;
        let end = meta.committed_offset;
        if let Some(seg) = self.segment_containing_model_offset(begin) {
            if seg.base_offset != begin {
                return Err(ManifestError::BoundaryInsideSegment(begin));
            }
        }
        if let Some(seg) = self.segment_containing_model_offset(end) {
            if seg.committed_offset != end {
                return Err(ManifestError::BoundaryInsideSegment(end));
            }
        }
        let replaced: Vec<SegmentMeta> = self
            .segments
            .range(begin.0..=end.0)
            .map(|(_, m)| *m)
            .collect();
        if replaced.is_empty() {
            return Err(ManifestError::Malformed(format!(
                "replacement [{begin}, {end}] covers no manifest entry"
            )));
        }
        for old in &replaced {
            self.segments.remove(&old.base_offset.0);
        }
        self.segments.insert(begin.0, meta);
        Ok(replaced)
    }

    /// Restores a spillover descriptor while decoding a persisted manifest.
    pub(crate) fn push_spillover_descriptor(&mut self, meta: SegmentMeta) {
        self.spillover.push(meta);
    }

    /// Restores the explicit start offset while decoding; `truncate` may
    /// have advanced it past the first segment's base.
    pub(crate) fn force_start_offset(&mut self, o: Offset) {
        self.start_offset = Some(o);
    }

    /// Restores the last offset while decoding; a fully spilled manifest
    /// has no segments to derive it from.
    pub(crate) fn force_last_offset(&mut self, o: Offset) {
        if self.last_offset.map_or(true, |cur| o > cur) {
            self.last_offset = Some(o);
        }
    }

    pub(crate) fn force_archive_size_bytes(&mut self, bytes: u64) {
        self.archive_size_bytes = bytes;
    }

    /// Remote file name of the live manifest blob.
    pub fn manifest_filename() -> &'static str {
        "manifest.bin"
    }

    /// Name a re-uploaded or freshly uploaded segment publishes under.
    pub fn remote_segment_name(meta: &SegmentMeta) -> SegmentName {
        SegmentName::format(meta.base_offset, meta.segment_term, meta.sname_format)
    }
}

/// Legacy JSON mirror of the manifest, kept write-compatible for tooling
/// that predates the binary format. Only the unlabeled layout publishes it.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JsonManifest {
    pub version: u32,
    pub namespace: String,
    pub topic: String,
    pub partition: i32,
    pub revision: i64,
    pub last_offset: i64,
    #[serde(default)]
    pub segments: BTreeMap<String, JsonSegmentMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JsonSegmentMeta {
    pub is_compacted: bool,
    pub size_bytes: u64,
    pub base_offset: i64,
    pub committed_offset: i64,
    #[serde(default)]
    pub max_timestamp: Option<i64>,
    #[serde(default)]
    pub base_timestamp: Option<i64>,
    #[serde(default)]
    pub delta_offset: Option<i64>,
    #[serde(default)]
    pub delta_offset_end: Option<i64>,
}

impl PartitionManifest {
    /// Serializes the legacy JSON mirror.
    pub fn to_legacy_json(&self) -> String {
        let segments = self
            .segments
            .values()
            .map(|s| {
                let name = Self::remote_segment_name(s);
                (
                    name.0,
                    JsonSegmentMeta {
                        is_compacted: s.is_compacted,
                        size_bytes: s.size_bytes,
                        base_offset: s.base_offset.0,
                        committed_offset: s.committed_offset.0,
                        max_timestamp: Some(s.max_timestamp.0),
                        base_timestamp: Some(s.base_timestamp.0),
                        delta_offset: Some(s.delta_offset.0),
                        delta_offset_end: Some(s.delta_offset_end.0),
                    },
                )
            })
            .collect();
        let doc = JsonManifest {
            version: 1,
            namespace: self.ntp.ns.to_string(),
            topic: self.ntp.topic.to_string(),
            partition: self.ntp.partition.0,
            revision: self.revision.0,
            last_offset: self.last_offset.map_or(-1, |o| o.0),
            segments,
        };
        serde_json::to_string(&doc).expect("manifest is serializable")
    }

    /// Reads a legacy JSON manifest.
    pub fn from_legacy_json(data: &str) -> Result<Self, ManifestError> {
        let doc: JsonManifest =
            serde_json::from_str(data).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        let mut manifest = PartitionManifest::new(
            Ntp::new(doc.namespace, doc.topic, doc.partition),
            InitialRevisionId(doc.revision),
        );
        for (name, seg) in doc.segments {
            let (_, term, format) = SegmentName(name)
                .parse()
                .map_err(|e| ManifestError::Malformed(e.to_string()))?;
            manifest.add(SegmentMeta {
                is_compacted: seg.is_compacted,
                size_bytes: seg.size_bytes,
                base_offset: Offset(seg.base_offset),
                committed_offset: Offset(seg.committed_offset),
                base_timestamp: shoal_model::Timestamp(seg.base_timestamp.unwrap_or(0)),
                max_timestamp: shoal_model::Timestamp(seg.max_timestamp.unwrap_or(0)),
                delta_offset: OffsetDelta(seg.delta_offset.unwrap_or(0)),
                delta_offset_end: OffsetDelta(seg.delta_offset_end.unwrap_or(0)),
                ntp_revision: InitialRevisionId(doc.revision),
                segment_term: term,
                archiver_term: term,
                sname_format: format,
            })?;
        }
        Ok(manifest)
    }
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
            base_timestamp: Timestamp(base * 1000),
            max_timestamp: Timestamp(committed * 1000),
            ..Default::default()
        }
    }

    fn manifest() -> PartitionManifest {
        PartitionManifest::new(Ntp::new("kafka", "audit", 0), InitialRevisionId(1))
    }

    #[test]
    fn add_tracks_start_and_last() {
        let mut m = manifest();
        m.add(meta(10, 19, 1024)).unwrap();
        m.add(meta(20, 29, 2048)).unwrap();
        assert_eq!(m.start_offset(), Some(Offset(10)));
        assert_eq!(m.last_offset(), Some(Offset(29)));
        assert_eq!(m.stm_size_bytes(), 3072);
        assert_eq!(m.last_segment().unwrap().base_offset, Offset(20));
    }

    #[test]
    fn add_rejects_overlap_but_permits_gaps() {
        let mut m = manifest();
        m.add(meta(10, 19, 1)).unwrap();
        // Overlapping and duplicate adds fail.
        assert_eq!(
            m.add(meta(15, 25, 1)),
            Err(ManifestError::OutOfOrder {
                base: Offset(15),
                last_committed: Offset(19),
            })
        );
        assert!(m.add(meta(19, 25, 1)).is_err());
        // A gap is fine.
        m.add(meta(30, 39, 1)).unwrap();
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn spillover_splits_the_prefix() {
        let mut m = manifest();
        for i in 0..4 {
            m.add(meta(i * 10, i * 10 + 9, 100)).unwrap();
        }
        let spilled = m.spillover(Offset(20)).unwrap();
        assert_eq!(spilled.len(), 2);
        assert_eq!(m.len(), 2);
        assert_eq!(m.start_offset(), Some(Offset(20)));
        assert_eq!(m.spillover().len(), 1);
        let shard = &m.spillover()[0];
        assert_eq!(shard.base_offset, Offset(0));
        assert_eq!(shard.committed_offset, Offset(19));
        assert_eq!(shard.size_bytes, 200);
        assert_eq!(m.archive_size_bytes(), 200);
    }

    #[test]
    fn spillover_rejects_mid_segment_boundary() {
        let mut m = manifest();
        m.add(meta(0, 9, 100)).unwrap();
        m.add(meta(10, 19, 100)).unwrap();
        assert_eq!(
            m.spillover(Offset(15)),
            Err(ManifestError::BoundaryInsideSegment(Offset(15)))
        );
        // Nothing was removed.
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn archive_offsets_are_monotone_and_ordered() {
        let mut m = manifest();
        m.set_archive_start_offset(Offset(100), OffsetDelta(3));
        m.set_archive_start_offset(Offset(50), OffsetDelta(1));
        assert_eq!(m.archive_start_offset(), Some(Offset(100)));
        assert_eq!(m.archive_start_offset_delta(), OffsetDelta(3));

        assert!(m.set_archive_clean_offset(Offset(120), 0).is_err());
        m.set_archive_clean_offset(Offset(80), 0).unwrap();
        assert_eq!(m.archive_clean_offset(), Some(Offset(80)));
    }

    #[test]
    fn clean_offset_garbage_collects_spillover_map() {
        let mut m = manifest();
        for i in 0..6 {
            m.add(meta(i * 10, i * 10 + 9, 100)).unwrap();
        }
        m.spillover(Offset(20)).unwrap();
        m.spillover(Offset(40)).unwrap();
        assert_eq!(m.spillover().len(), 2);
        m.set_archive_start_offset(Offset(40), OffsetDelta(0));
        m.set_archive_clean_offset(Offset(20), 200).unwrap();
        assert_eq!(m.spillover().len(), 1);
        assert_eq!(m.archive_size_bytes(), 200);
    }

    #[test]
    fn start_kafka_override_is_monotone() {
        let mut m = manifest();
        assert!(m.advance_start_kafka_offset(KafkaOffset(5)));
        assert!(!m.advance_start_kafka_offset(KafkaOffset(3)));
        assert!(m.advance_start_kafka_offset(KafkaOffset(9)));
        assert_eq!(m.start_kafka_offset_override(), Some(KafkaOffset(9)));
    }

    #[test]
    fn lookups_by_offset() {
        let mut m = manifest();
        m.add(meta(10, 19, 1)).unwrap();
        m.add(meta(30, 39, 1)).unwrap();
        assert_eq!(
            m.segment_containing_model_offset(Offset(15)).unwrap().base_offset,
            Offset(10)
        );
        assert!(m.segment_containing_model_offset(Offset(25)).is_none());
        assert_eq!(
            m.next_segment_after(Offset(19)).unwrap().base_offset,
            Offset(30)
        );
        assert!(m.next_segment_after(Offset(39)).is_none());
        // Kafka space: no deltas here, so spaces coincide.
        assert_eq!(
            m.segment_containing(KafkaOffset(31)).unwrap().base_offset,
            Offset(30)
        );
    }

    #[test]
    fn truncate_drops_fully_covered_segments() {
        let mut m = manifest();
        m.add(meta(0, 9, 1)).unwrap();
        m.add(meta(10, 19, 1)).unwrap();
        m.add(meta(20, 29, 1)).unwrap();
        let removed = m.truncate(Offset(15));
        assert_eq!(removed.len(), 1);
        assert_eq!(m.start_offset(), Some(Offset(15)));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn replace_range_merges_covered_entries() {
        let mut m = manifest();
        m.add(meta(10, 19, 100)).unwrap();
        m.add(meta(20, 29, 100)).unwrap();
        m.add(meta(30, 39, 100)).unwrap();
        let merged = meta(10, 29, 150);
        let replaced = m.replace_range(merged).unwrap();
        assert_eq!(replaced.len(), 2);
        assert_eq!(m.len(), 2);
        assert_eq!(
            m.segment_containing_model_offset(Offset(25)).unwrap().base_offset,
            Offset(10)
        );

        // A window splitting an entry is rejected.
        assert!(m.replace_range(meta(10, 35, 1)).is_err());
    }

    #[test]
    fn legacy_json_round_trip() {
        let mut m = manifest();
        m.add(meta(10, 19, 1024)).unwrap();
        m.add(meta(20, 29, 2048)).unwrap();
        let json = m.to_legacy_json();
        let parsed = PartitionManifest::from_legacy_json(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.last_offset(), Some(Offset(29)));
        assert_eq!(parsed.ntp(), m.ntp());
    }
}
