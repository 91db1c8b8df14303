// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deterministic mapping from partition identities to object-store keys.
//!
//! Two layouts exist. The legacy "prefixed" layout spreads keys across the
//! bucket keyspace by prepending a hash of the stable part of the key, which
//! was needed to dodge per-prefix request-rate limits. The "labeled" layout
//! nests everything under an opaque cluster label, which makes prefix
//! listings meaningful and is what new clusters use. The provider is pure:
//! equal inputs always produce byte-identical keys, which re-upload
//! idempotency and spillover shard addressing both rely on.

use shoal_model::{InitialRevisionId, Ntp, SegmentMeta, SegmentName, Timestamp};
use xxhash_rust::xxh32::xxh32;

use crate::partition_manifest::PartitionManifest;
use crate::remote_label::RemoteLabel;

/// The offset and timestamp window a spillover manifest key embeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpilloverPathComponents {
    pub base: shoal_model::Offset,
    pub last: shoal_model::Offset,
    pub base_kafka: shoal_model::KafkaOffset,
    pub next_kafka: shoal_model::KafkaOffset,
    pub base_ts: Timestamp,
    pub last_ts: Timestamp,
}

impl SpilloverPathComponents {
    /// Derives the components from a shard descriptor in the spillover map.
    pub fn from_meta(meta: &SegmentMeta) -> Self {
        SpilloverPathComponents {
            base: meta.base_offset,
            last: meta.committed_offset,
            base_kafka: meta.base_kafka_offset(),
            next_kafka: meta.next_kafka_offset(),
            base_ts: meta.base_timestamp,
            last_ts: meta.max_timestamp,
        }
    }
}

impl std::fmt::Display for SpilloverPathComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{base: {}, last: {}, base_kafka: {}, next_kafka: {}, base_ts: {}, last_ts: {}}}",
            self.base, self.last, self.base_kafka, self.next_kafka, self.base_ts, self.last_ts
        )
    }
}

const MANIFEST_FILENAME: &str = "manifest.bin";
const MANIFEST_FILENAME_JSON: &str = "manifest.json";
const TOPIC_MANIFEST_FILENAME: &str = "topic_manifest.bin";

/// Maps partition identities and segment metadata to object-store keys.
#[derive(Debug, Clone)]
pub struct RemotePathProvider {
    label: Option<RemoteLabel>,
}

impl RemotePathProvider {
    pub fn new(label: Option<RemoteLabel>) -> Self {
        RemotePathProvider { label }
    }

    /// Top nibble of the xxh32 of the stable key part, which is how the
    /// legacy layout spreads keys over 16 bucket prefixes.
    fn masked_hash(input: &str) -> String {
        format!("{:08x}", xxh32(input.as_bytes(), 0) & 0xf000_0000)
    }

    fn full_hash(input: &str) -> String {
        format!("{:08x}", xxh32(input.as_bytes(), 0))
    }

    /// Directory-like prefix of the topic-level metadata.
    pub fn topic_manifest_prefix(&self, ntp: &Ntp) -> String {
        let topic = ntp.topic_path_component();
        match &self.label {
            Some(label) => format!("{label}/meta/{topic}"),
            None => format!("{}/meta/{topic}", Self::masked_hash(&topic)),
        }
    }

    pub fn topic_manifest_path(&self, ntp: &Ntp) -> String {
        format!(
            "{}/{}",
            self.topic_manifest_prefix(ntp),
            TOPIC_MANIFEST_FILENAME
        )
    }

    /// Directory-like prefix of one partition's manifests.
    pub fn partition_manifest_prefix(&self, ntp: &Ntp, rev: InitialRevisionId) -> String {
        let part = ntp.remote_path_component(rev);
        match &self.label {
            Some(label) => format!("{label}/meta/{part}"),
            None => format!("{}/meta/{part}", Self::masked_hash(&part)),
        }
    }

    pub fn partition_manifest_path(&self, ntp: &Ntp, rev: InitialRevisionId) -> String {
        format!(
            "{}/{}",
            self.partition_manifest_prefix(ntp, rev),
            MANIFEST_FILENAME
        )
    }

    /// The legacy JSON manifest key. Only the prefixed layout ever wrote
    /// one; labeled clusters have no JSON mirror.
    pub fn partition_manifest_path_json(
        &self,
        ntp: &Ntp,
        rev: InitialRevisionId,
    ) -> Option<String> {
        if self.label.is_some() {
            return None;
        }
        Some(format!(
            "{}/{}",
            self.partition_manifest_prefix(ntp, rev),
            MANIFEST_FILENAME_JSON
        ))
    }

    /// Key of a spillover shard. The suffix embeds the shard's window in
    /// both offset spaces and both timestamps, so listing the manifest
    /// prefix yields a content-addressed view of the archive.
    pub fn spillover_manifest_path(
        &self,
        stm_manifest: &PartitionManifest,
        c: &SpilloverPathComponents,
    ) -> String {
        format!(
            "{}.{}.{}.{}.{}.{}.{}",
            self.partition_manifest_path(stm_manifest.ntp(), stm_manifest.revision()),
            c.base,
            c.last,
            c.base_kafka,
            c.next_kafka,
            c.base_ts,
            c.last_ts
        )
    }

    /// Key of an uploaded segment. The archiver term is part of the key so
    /// a re-upload under a newer term never overwrites the original object.
    pub fn segment_path(&self, ntp: &Ntp, rev: InitialRevisionId, meta: &SegmentMeta) -> String {
        let name = SegmentName::format(meta.base_offset, meta.segment_term, meta.sname_format);
        self.segment_path_by_name(ntp, rev, &name, meta.archiver_term)
    }

    pub fn segment_path_by_name(
        &self,
        ntp: &Ntp,
        rev: InitialRevisionId,
        name: &SegmentName,
        archiver_term: shoal_model::Term,
    ) -> String {
        let stem = format!("{}/{}", ntp.remote_path_component(rev), name);
        match &self.label {
            Some(label) => format!("{label}/{stem}.{archiver_term}"),
            None => format!("{}/{stem}.{archiver_term}", Self::full_hash(&stem)),
        }
    }
}
