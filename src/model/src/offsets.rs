// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The two offset spaces.
//!
//! Model offsets number every record in the replicated log, including
//! control/configuration batches that are invisible to Kafka clients. Kafka
//! offsets exclude those batches. The difference is the offset delta, which
//! is monotonically non-decreasing along the log. Keeping the spaces as
//! distinct types means a conversion is always an explicit `-`/`+` with a
//! delta, never an implicit cast.

use serde::{Deserialize, Serialize};

/// An offset in model space: one slot per record, control batches included.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Offset(pub i64);

impl Offset {
    /// The offset of the record after this one.
    pub fn next(self) -> Offset {
        Offset(self.0 + 1)
    }

    /// The offset of the record before this one.
    pub fn prev(self) -> Offset {
        Offset(self.0 - 1)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Sub<OffsetDelta> for Offset {
    type Output = KafkaOffset;

    fn sub(self, delta: OffsetDelta) -> KafkaOffset {
        KafkaOffset(self.0 - delta.0)
    }
}

/// The next model offset after `o`, where `None` means "before the start of
/// the log" and therefore yields offset zero.
pub fn next_offset(o: Option<Offset>) -> Offset {
    match o {
        Some(o) => o.next(),
        None => Offset(0),
    }
}

/// An offset in kafka space: control batches excluded.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KafkaOffset(pub i64);

impl KafkaOffset {
    pub fn next(self) -> KafkaOffset {
        KafkaOffset(self.0 + 1)
    }
}

impl std::fmt::Display for KafkaOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<OffsetDelta> for KafkaOffset {
    type Output = Offset;

    fn add(self, delta: OffsetDelta) -> Offset {
        Offset(self.0 + delta.0)
    }
}

/// The number of non-data records at or below some model offset. Subtracting
/// it from a model offset produces the kafka offset of the same record.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OffsetDelta(pub i64);

impl std::fmt::Display for OffsetDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raft term.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub i64);

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the unix epoch, as stamped into record batches and
/// segment metadata.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Timestamp {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("wall clock before unix epoch")
            .as_millis();
        Timestamp(i64::try_from(ms).expect("wall clock overflow"))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_space_conversions() {
        let o = Offset(100);
        let d = OffsetDelta(12);
        let k = o - d;
        assert_eq!(k, KafkaOffset(88));
        assert_eq!(k + d, o);
    }

    #[test]
    fn next_offset_of_empty_log() {
        assert_eq!(next_offset(None), Offset(0));
        assert_eq!(next_offset(Some(Offset(41))), Offset(42));
    }
}
