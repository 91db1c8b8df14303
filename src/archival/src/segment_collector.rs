// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Collects compacted local segments for re-upload.
//!
//! Compaction shrinks local segments after their originals were already
//! uploaded. Re-uploading the compacted data replaces fat remote segments
//! with lean ones, but only whole manifest entries (or whole gaps between
//! them) can be replaced, never parts. The collector therefore aligns both
//! ends of a candidate range to manifest boundaries:
//!
//!   - a boundary strictly inside a manifest entry is pushed outward to the
//!     entry's edge, so the re-upload can never overlap remote data;
//!   - a boundary inside a gap stays put, shrinking the gap.
//!
//! A collection is only usable when, after alignment, it still fully covers
//! at least one manifest entry or completely spans a gap.

use shoal_cloud_storage::PartitionManifest;
use shoal_model::{Offset, SegmentName, SegmentNameFormat};
use shoal_storage::{LogReader, SegmentInfo};

pub struct SegmentCollector<'a> {
    begin_inclusive: Offset,
    end_inclusive: Offset,
    manifest: &'a PartitionManifest,
    log: &'a dyn LogReader,
    max_uploaded_segment_size: u64,
    segments: Vec<SegmentInfo>,
    can_replace: bool,
}

impl std::fmt::Debug for SegmentCollector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCollector")
            .field("begin_inclusive", &self.begin_inclusive)
            .field("end_inclusive", &self.end_inclusive)
            .field("can_replace", &self.can_replace)
            .finish_non_exhaustive()
    }
}

impl<'a> SegmentCollector<'a> {
    pub fn new(
        begin_inclusive: Offset,
        manifest: &'a PartitionManifest,
        log: &'a dyn LogReader,
        max_uploaded_segment_size: u64,
    ) -> Self {
        SegmentCollector {
            begin_inclusive,
            end_inclusive: begin_inclusive,
            manifest,
            log,
            max_uploaded_segment_size,
            segments: Vec::new(),
            can_replace: false,
        }
    }

    /// Runs the collection. Afterwards [`SegmentCollector::segments`] holds
    /// the collected local segments and
    /// [`SegmentCollector::can_replace_manifest_segment`] reports whether
    /// uploading them would replace anything.
    pub fn collect_segments(&mut self) {
        let Some(manifest_last) = self.manifest.last_offset() else {
            return;
        };
        if self.begin_inclusive >= manifest_last {
            return;
        }
        if let Some(start) = self.manifest.start_offset() {
            // Data below the manifest start was deleted by retention;
            // re-uploading it would resurrect it.
            if self.begin_inclusive < start {
                self.begin_inclusive = start;
            }
        }
        self.do_collect(manifest_last);
        if self.segments.is_empty() {
            return;
        }
        self.align_begin_offset_to_manifest();
        let collected_end = self
            .segments
            .last()
            .expect("nonempty collection")
            .committed_offset;
        self.align_end_offset_to_manifest(collected_end, manifest_last);
        self.can_replace = self.find_replacement_boundary();
    }

    /// Walks local segments from the search start, taking finished-
    /// compaction segments until the size cap, a non-compacted segment, or
    /// the end of the manifest.
    fn do_collect(&mut self, manifest_last: Offset) {
        let mut cursor = self.begin_inclusive;
        let mut collected_size = 0u64;
        for info in self.log.segments() {
            if info.committed_offset < cursor {
                continue;
            }
            if !info.is_compacted || !info.finished_self_compaction {
                break;
            }
            if info.base_offset > manifest_last {
                break;
            }
            if collected_size + info.size_bytes > self.max_uploaded_segment_size {
                break;
            }
            if self.segments.is_empty() {
                // The upload can't begin before the first collected
                // segment's data.
                self.begin_inclusive = self.begin_inclusive.max(info.base_offset);
            }
            collected_size += info.size_bytes;
            cursor = info.committed_offset.next();
            self.segments.push(info);
            if info.committed_offset >= manifest_last {
                break;
            }
        }
    }

    fn align_begin_offset_to_manifest(&mut self) {
        if let Some(seg) = self
            .manifest
            .segment_containing_model_offset(self.begin_inclusive)
        {
            if seg.base_offset != self.begin_inclusive {
                self.begin_inclusive = seg.committed_offset.next();
            }
        }
        // Inside a gap: keep, the re-upload shrinks the gap.
    }

    fn align_end_offset_to_manifest(&mut self, collected_end: Offset, manifest_last: Offset) {
        self.end_inclusive = collected_end.min(manifest_last);
        if let Some(seg) = self
            .manifest
            .segment_containing_model_offset(self.end_inclusive)
        {
            if seg.committed_offset != self.end_inclusive {
                self.end_inclusive = seg.base_offset.prev();
            }
        }
    }

    /// The collection is valid when `[begin, end]` fully covers a manifest
    /// entry or completely spans a gap between two adjacent entries.
    fn find_replacement_boundary(&self) -> bool {
        if self.begin_inclusive > self.end_inclusive {
            return false;
        }
        let covers_entry = self.manifest.segments().any(|seg| {
            self.begin_inclusive <= seg.base_offset && seg.committed_offset <= self.end_inclusive
        });
        if covers_entry {
            return true;
        }
        let mut it = self.manifest.segments().peekable();
        while let Some(cur) = it.next() {
            let Some(next) = it.peek() else { break };
            let gap_begin = cur.committed_offset.next();
            let gap_end = next.base_offset.prev();
            if gap_begin <= gap_end
                && self.begin_inclusive <= gap_begin
                && gap_end <= self.end_inclusive
            {
                return true;
            }
        }
        false
    }

    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    pub fn can_replace_manifest_segment(&self) -> bool {
        self.can_replace
    }

    pub fn begin_inclusive(&self) -> Offset {
        self.begin_inclusive
    }

    pub fn end_inclusive(&self) -> Offset {
        self.end_inclusive
    }

    /// Total byte size of the collected segments.
    pub fn collected_size_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size_bytes).sum()
    }

    /// The remote file name the re-upload will publish under: the aligned
    /// begin offset with the first collected segment's term. Collections
    /// with equal aligned boundaries always produce equal names.
    pub fn adjust_segment_name(&self) -> SegmentName {
        let term = self
            .segments
            .first()
            .expect("nonempty collection")
            .term;
        SegmentName::format(self.begin_inclusive, term, SegmentNameFormat::V3)
    }
}

#[cfg(test)]
mod tests {
    use shoal_model::{InitialRevisionId, Ntp, SegmentMeta};
    use shoal_storage::{InMemoryLog, PopulateSpec};

    use super::*;

    const MAX_UPLOAD_SIZE: u64 = 4096 * 1024;

    /// Manifest {[10..19]@1024, [20..29]@2048, [30..39]@4096}.
    fn manifest() -> PartitionManifest {
        let mut m =
            PartitionManifest::new(Ntp::new("test-ns", "test-topic", 42), InitialRevisionId(1));
        for (base, committed, size) in [(10, 19, 1024), (20, 29, 2048), (30, 39, 4096)] {
            m.add(SegmentMeta {
                size_bytes: size,
                base_offset: Offset(base),
                committed_offset: Offset(committed),
                ..Default::default()
            })
            .unwrap();
        }
        m
    }

    /// Manifest {[10..19], [30..39], [50..59]} with gaps 20..29 and 40..49.
    fn manifest_with_gaps() -> PartitionManifest {
        let mut m =
            PartitionManifest::new(Ntp::new("test-ns", "test-topic", 42), InitialRevisionId(1));
        for (base, committed) in [(10, 19), (30, 39), (50, 59)] {
            m.add(SegmentMeta {
                size_bytes: 1024,
                base_offset: Offset(base),
                committed_offset: Offset(committed),
                ..Default::default()
            })
            .unwrap();
        }
        m
    }

    fn populate(starts: &[i64], compacted: &[usize], last_records: i64) -> InMemoryLog {
        InMemoryLog::populate(PopulateSpec {
            segment_starts: starts.to_vec(),
            compacted_segment_indices: compacted.to_vec(),
            last_segment_num_records: last_records,
        })
    }

    #[test]
    fn simple_collection() {
        let m = manifest();
        // Local log starts before the manifest and ends past it; the first
        // three segments are compacted.
        let log = populate(&[5, 22, 35, 50], &[0, 1, 2], 10);
        let mut collector = SegmentCollector::new(Offset(4), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.begin_inclusive(), Offset(10));
        assert_eq!(collector.end_inclusive(), Offset(39));
        assert_eq!(collector.segments().len(), 3);
    }

    #[test]
    fn start_ahead_of_manifest() {
        let m = manifest();
        let log = populate(&[5], &[0], 10);

        // Start past the manifest end: nothing to replace.
        let mut collector = SegmentCollector::new(Offset(400), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert!(!collector.can_replace_manifest_segment());
        assert!(collector.segments().is_empty());

        // Start exactly at the manifest end: likewise.
        let mut collector = SegmentCollector::new(Offset(39), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert!(!collector.can_replace_manifest_segment());
        assert!(collector.segments().is_empty());
    }

    #[test]
    fn empty_manifest() {
        let m =
            PartitionManifest::new(Ntp::new("test-ns", "test-topic", 42), InitialRevisionId(1));
        let log = populate(&[0], &[0], 10);
        let mut collector = SegmentCollector::new(Offset(2), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert!(!collector.can_replace_manifest_segment());
        assert!(collector.segments().is_empty());
    }

    // A short compacted segment strictly inside a manifest entry: begin is
    // advanced to the manifest start, one segment is collected, then begin
    // is re-advanced past the entry to avoid overlap, leaving begin > end.
    #[test]
    fn alignment_inside_manifest_segment() {
        let m = manifest();
        let log = populate(&[12], &[0], 3);
        let mut collector = SegmentCollector::new(Offset(1), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert!(!collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
    }

    #[test]
    fn compacted_segment_aligned_with_manifest_segment() {
        let m = manifest();
        let log = populate(&[10, 20, 45, 55], &[0], 10);
        let mut collector = SegmentCollector::new(Offset(1), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
        let seg = &collector.segments()[0];
        assert_eq!(seg.base_offset, Offset(10));
        assert_eq!(seg.committed_offset, Offset(19));
    }

    #[test]
    fn short_aligned_segment_cannot_replace() {
        let m = manifest();
        // Aligned with the entry start but too short to cover it.
        let log = populate(&[10], &[0], 5);
        let mut collector = SegmentCollector::new(Offset(0), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(!collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
        assert_eq!(collector.segments()[0].committed_offset, Offset(14));
    }

    #[test]
    fn many_small_segments_cover_one_manifest_entry() {
        let m = manifest();
        let log = populate(&[10, 12, 14, 16, 18], &[0, 1, 2, 3, 4], 2);
        let mut collector = SegmentCollector::new(Offset(0), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 5);
        assert_eq!(collector.begin_inclusive(), Offset(10));
        assert_eq!(collector.end_inclusive(), Offset(19));
    }

    // One compacted segment sticking out of a manifest entry on both sides
    // is trimmed to the entry by alignment.
    #[test]
    fn compacted_segment_larger_than_manifest_segment() {
        let m = manifest();
        let log = populate(&[8], &[0], 20);
        let mut collector = SegmentCollector::new(Offset(2), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
        assert_eq!(collector.begin_inclusive(), Offset(10));
        assert_eq!(collector.end_inclusive(), Offset(19));
    }

    #[test]
    fn collection_capped_by_size() {
        let m = manifest();
        let log = populate(&[5, 15, 25, 35, 50, 60], &[0, 1, 2, 3], 20);
        // Room for exactly the first three compacted segments.
        let max_size = log.segment(0).size_bytes
            + log.segment(1).size_bytes
            + log.segment(2).size_bytes;
        let mut collector = SegmentCollector::new(Offset(0), &m, &log, max_size);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 3);
        assert_eq!(collector.begin_inclusive(), Offset(10));
        // The end rolls back to the second manifest boundary.
        assert_eq!(collector.end_inclusive(), Offset(29));
        assert!(collector.collected_size_bytes() <= max_size);
    }

    #[test]
    fn no_compacted_segments() {
        let m = manifest();
        let log = populate(&[5, 15, 25, 35, 50, 60], &[], 20);
        let mut collector = SegmentCollector::new(Offset(5), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert!(!collector.can_replace_manifest_segment());
        assert!(collector.segments().is_empty());
    }

    #[test]
    fn segment_name_adjustment() {
        let m = manifest();
        let log = populate(&[8], &[0], 20);
        let mut collector = SegmentCollector::new(Offset(8), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert_eq!(collector.adjust_segment_name().as_str(), "10-1-v3.log");

        // Same aligned boundaries from a different search start: same name.
        let mut collector = SegmentCollector::new(Offset(2), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();
        assert_eq!(collector.adjust_segment_name().as_str(), "10-1-v3.log");
    }

    #[test]
    fn collection_ends_at_gap_boundary() {
        let m = manifest_with_gaps();
        let log = populate(&[5, 15, 25, 35, 50, 60], &[0, 1, 2, 3], 20);
        let max_size = log.segment(0).size_bytes
            + log.segment(1).size_bytes
            + log.segment(2).size_bytes;
        let mut collector = SegmentCollector::new(Offset(0), &m, &log, max_size);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 3);
        assert_eq!(collector.begin_inclusive(), Offset(10));
        // End lands inside the 20..29 gap and stays there.
        assert_eq!(collector.end_inclusive(), Offset(29));
    }

    #[test]
    fn collection_completely_covers_gap() {
        let m = manifest_with_gaps();
        let log = populate(&[5, 15, 25, 40, 50, 60], &[0, 1, 2, 3], 20);
        let max_size = log.segment(0).size_bytes
            + log.segment(1).size_bytes
            + log.segment(2).size_bytes;
        let mut collector = SegmentCollector::new(Offset(0), &m, &log, max_size);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 3);
        assert_eq!(collector.begin_inclusive(), Offset(10));
        assert_eq!(collector.end_inclusive(), Offset(39));
    }

    #[test]
    fn collection_starts_in_gap() {
        let m = manifest_with_gaps();
        let log = populate(&[25, 40, 50], &[0], 20);
        let mut collector = SegmentCollector::new(Offset(2), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
        // Start stays inside the gap, shrinking it.
        assert_eq!(collector.begin_inclusive(), Offset(25));
        assert_eq!(collector.end_inclusive(), Offset(39));
    }

    #[test]
    fn collection_ends_in_gap() {
        let m = manifest_with_gaps();
        let log = populate(&[15, 45, 50], &[0], 20);
        let mut collector = SegmentCollector::new(Offset(1), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
        assert_eq!(collector.begin_inclusive(), Offset(20));
        assert_eq!(collector.end_inclusive(), Offset(44));
    }

    #[test]
    fn compacted_segment_after_manifest_start() {
        let m = manifest();
        // Manifest starts at 10, the compacted segment at 15; begin is
        // realigned past the first entry to avoid overlap.
        let log = populate(&[15, 45, 50], &[0], 20);
        let mut collector = SegmentCollector::new(Offset(0), &m, &log, MAX_UPLOAD_SIZE);
        collector.collect_segments();

        assert!(collector.can_replace_manifest_segment());
        assert_eq!(collector.segments().len(), 1);
        assert_eq!(collector.begin_inclusive(), Offset(20));
        assert_eq!(collector.end_inclusive(), Offset(39));
    }
}
