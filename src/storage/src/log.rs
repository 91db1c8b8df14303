// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use shoal_model::{Offset, Term, Timestamp};

use crate::StorageError;

/// Metadata of one closed local segment, as exposed to the archival layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub base_offset: Offset,
    pub committed_offset: Offset,
    pub size_bytes: u64,
    pub term: Term,
    pub base_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub is_compacted: bool,
    /// True once the segment's own compaction pass has completed; only then
    /// is the segment stable enough to re-upload.
    pub finished_self_compaction: bool,
}

/// Read access to the closed portion of one partition's local log.
#[async_trait::async_trait]
pub trait LogReader: Send + Sync {
    /// Closed segments in base-offset order. The open head segment is never
    /// included.
    fn segments(&self) -> Vec<SegmentInfo>;

    /// The largest segment base offset `<= o`, if any segment starts at or
    /// below `o`.
    fn index_lower_bound(&self, o: Offset) -> Option<Offset> {
        self.segments()
            .iter()
            .take_while(|s| s.base_offset <= o)
            .last()
            .map(|s| s.base_offset)
    }

    /// Reads the raw bytes of the segment starting at `base`.
    async fn read_segment(&self, base: Offset) -> Result<Bytes, StorageError>;
}

/// Describes a synthetic log for tests: where each closed segment starts,
/// which of them are compacted, and how many records the last one holds.
#[derive(Debug, Clone, Default)]
pub struct PopulateSpec {
    pub segment_starts: Vec<i64>,
    pub compacted_segment_indices: Vec<usize>,
    pub last_segment_num_records: i64,
}

/// An in-memory [`LogReader`] used by archival tests. Closed segments can
/// be appended while readers hold the log, mirroring how the real log
/// rolls.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    segments: std::sync::Mutex<Vec<(SegmentInfo, Bytes)>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a closed segment. Panics when out of order, mirroring the
    /// invariant the real log maintains.
    pub fn add_segment(&self, info: SegmentInfo, data: Bytes) {
        let mut segments = self.segments.lock().expect("lock poisoned");
        if let Some((prev, _)) = segments.last() {
            assert!(
                info.base_offset > prev.committed_offset,
                "segment {:?} overlaps predecessor {:?}",
                info,
                prev
            );
        }
        segments.push((info, data));
    }

    /// Builds a log of adjacent segments per `spec`. Segment `i` spans
    /// `[starts[i], starts[i+1] - 1]`; the last spans
    /// `last_segment_num_records` records. Each synthetic record occupies
    /// [`InMemoryLog::RECORD_SIZE`] bytes, so size-capped collection tests
    /// can reason about byte budgets.
    pub fn populate(spec: PopulateSpec) -> Self {
        const FILLER: u8 = 0x5a;
        let log = Self::new();
        for (i, &base) in spec.segment_starts.iter().enumerate() {
            let committed = match spec.segment_starts.get(i + 1) {
                Some(&next) => next - 1,
                None => base + spec.last_segment_num_records - 1,
            };
            let records = committed - base + 1;
            assert!(records > 0, "empty segment at {base}");
            let size = u64::try_from(records).expect("negative record count")
                * Self::RECORD_SIZE;
            let compacted = spec.compacted_segment_indices.contains(&i);
            let info = SegmentInfo {
                base_offset: Offset(base),
                committed_offset: Offset(committed),
                size_bytes: size,
                term: Term(1),
                base_timestamp: Timestamp(base * 1000),
                max_timestamp: Timestamp(committed * 1000),
                is_compacted: compacted,
                finished_self_compaction: compacted,
            };
            let data = Bytes::from(vec![FILLER; usize::try_from(size).expect("size")]);
            log.add_segment(info, data);
        }
        log
    }

    /// Bytes per synthetic record in [`InMemoryLog::populate`].
    pub const RECORD_SIZE: u64 = 128;

    pub fn segment(&self, idx: usize) -> SegmentInfo {
        self.segments.lock().expect("lock poisoned")[idx].0
    }
}

#[async_trait::async_trait]
impl LogReader for InMemoryLog {
    fn segments(&self) -> Vec<SegmentInfo> {
        self.segments
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(info, _)| *info)
            .collect()
    }

    async fn read_segment(&self, base: Offset) -> Result<Bytes, StorageError> {
        self.segments
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|(info, _)| info.base_offset == base)
            .map(|(_, data)| data.clone())
            .ok_or(StorageError::SegmentNotFound(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_builds_adjacent_segments() {
        let log = InMemoryLog::populate(PopulateSpec {
            segment_starts: vec![5, 22, 35, 50],
            compacted_segment_indices: vec![0, 1, 2],
            last_segment_num_records: 10,
        });
        let segs = log.segments();
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].base_offset, Offset(5));
        assert_eq!(segs[0].committed_offset, Offset(21));
        assert!(segs[0].is_compacted);
        assert_eq!(segs[3].base_offset, Offset(50));
        assert_eq!(segs[3].committed_offset, Offset(59));
        assert!(!segs[3].is_compacted);
    }

    #[test]
    fn index_lower_bound_finds_covering_segment() {
        let log = InMemoryLog::populate(PopulateSpec {
            segment_starts: vec![0, 10, 20],
            compacted_segment_indices: vec![],
            last_segment_num_records: 10,
        });
        assert_eq!(log.index_lower_bound(Offset(15)), Some(Offset(10)));
        assert_eq!(log.index_lower_bound(Offset(25)), Some(Offset(20)));
        let empty = InMemoryLog::new();
        assert_eq!(empty.index_lower_bound(Offset(5)), None);
    }

    #[tokio::test]
    async fn read_segment_returns_bytes() {
        let log = InMemoryLog::populate(PopulateSpec {
            segment_starts: vec![0],
            compacted_segment_indices: vec![],
            last_segment_num_records: 4,
        });
        let data = log.read_segment(Offset(0)).await.unwrap();
        assert_eq!(data.len() as u64, 4 * InMemoryLog::RECORD_SIZE);
        assert!(log.read_segment(Offset(9)).await.is_err());
    }
}
