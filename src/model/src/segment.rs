// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::{InitialRevisionId, KafkaOffset, Offset, OffsetDelta, Term, Timestamp};

/// Version tag of the segment naming scheme. The format version is baked into
/// every uploaded segment name, so new fields can be added to the name
/// without breaking listings of old objects.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SegmentNameFormat {
    V1 = 1,
    V2 = 2,
    #[default]
    V3 = 3,
}

impl SegmentNameFormat {
    pub fn from_version(v: u32) -> Option<SegmentNameFormat> {
        match v {
            1 => Some(SegmentNameFormat::V1),
            2 => Some(SegmentNameFormat::V2),
            3 => Some(SegmentNameFormat::V3),
            _ => None,
        }
    }

    pub fn version(self) -> u32 {
        self as u32
    }
}

/// Metadata describing one closed, immutable segment of a partition log.
///
/// Offsets are carried in both spaces: `base_offset`/`committed_offset` are
/// model offsets, while the deltas let readers map either boundary into
/// kafka space without consulting the offset translator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub is_compacted: bool,
    pub size_bytes: u64,
    pub base_offset: Offset,
    pub committed_offset: Offset,
    pub base_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    /// Offset delta at `base_offset`.
    pub delta_offset: OffsetDelta,
    /// Offset delta right past `committed_offset`.
    pub delta_offset_end: OffsetDelta,
    pub ntp_revision: InitialRevisionId,
    /// Term under which the segment's records were written.
    pub segment_term: Term,
    /// Term of the archiver that uploaded the segment. Part of the remote
    /// name, so a re-upload by a newer archiver never clobbers the original.
    pub archiver_term: Term,
    pub sname_format: SegmentNameFormat,
}

impl SegmentMeta {
    /// Kafka offset of the first record in the segment.
    pub fn base_kafka_offset(&self) -> KafkaOffset {
        self.base_offset - self.delta_offset
    }

    /// Kafka offset right past the last record in the segment.
    pub fn next_kafka_offset(&self) -> KafkaOffset {
        self.committed_offset.next() - self.delta_offset_end
    }
}

/// Error parsing a segment file name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed segment name: {0}")]
pub struct SegmentNameParseError(pub String);

/// A segment file name of the form `{base}-{term}-v{format}.log`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentName(pub String);

impl SegmentName {
    pub fn format(base: Offset, term: Term, format: SegmentNameFormat) -> SegmentName {
        SegmentName(format!("{}-{}-v{}.log", base, term, format.version()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the name back into its components.
    pub fn parse(&self) -> Result<(Offset, Term, SegmentNameFormat), SegmentNameParseError> {
        let err = || SegmentNameParseError(self.0.clone());
        let stem = self.0.strip_suffix(".log").ok_or_else(err)?;
        let mut parts = stem.splitn(3, '-');
        let base = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(err)?;
        let term = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(err)?;
        let format = parts
            .next()
            .and_then(|s| s.strip_prefix('v'))
            .and_then(|s| s.parse::<u32>().ok())
            .and_then(SegmentNameFormat::from_version)
            .ok_or_else(err)?;
        Ok((Offset(base), Term(term), format))
    }
}

impl std::fmt::Display for SegmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
