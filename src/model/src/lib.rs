// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Core identifiers and metadata shared by every shoal subsystem.
//!
//! Everything in here is plain data: newtypes over integers and strings with
//! the arithmetic that makes the two offset spaces hard to mix up by
//! accident. Persistence encodings live with the components that persist
//! them, not here.

mod ntp;
mod offsets;
mod segment;

pub use crate::ntp::{Namespace, Ntp, PartitionId, TopicName};
pub use crate::offsets::{next_offset, KafkaOffset, Offset, OffsetDelta, Term, Timestamp};
pub use crate::segment::{SegmentMeta, SegmentName, SegmentNameFormat, SegmentNameParseError};

use serde::{Deserialize, Serialize};

/// Revision assigned to a topic when it is first created. Remote object keys
/// embed it so that a topic deleted and re-created with the same name does
/// not collide with its predecessor's objects.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InitialRevisionId(pub i64);

impl std::fmt::Display for InitialRevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision of the command that created or moved a partition replica. Used by
/// the shard placement machinery to tell stale state from current state.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RevisionId(pub i64);

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic counter of shard-placement changes on a node.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShardRevisionId(pub i64);

impl std::fmt::Display for ShardRevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a core-local shard (one scheduling domain per core).
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShardId(pub u32);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft group identifier of one replicated partition log.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupId(pub i64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
