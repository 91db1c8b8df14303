// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use shoal_model::{InitialRevisionId, Ntp, SegmentMeta};

use crate::partition_manifest::{ManifestError, PartitionManifest};
use crate::remote_path_provider::{RemotePathProvider, SpilloverPathComponents};

/// An immutable section of the partition manifest that was spilled over to
/// the archive.
///
/// Structurally this is a partition manifest; the difference is addressing.
/// A spillover manifest's object key embeds its own offset and timestamp
/// window, so the full archive can be reconstructed from a prefix listing
/// and the key changes whenever the content would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilloverManifest {
    manifest: PartitionManifest,
}

impl SpilloverManifest {
    pub fn new(ntp: Ntp, revision: InitialRevisionId) -> Self {
        SpilloverManifest {
            manifest: PartitionManifest::new(ntp, revision),
        }
    }

    /// Builds a shard from the segments removed by
    /// [`PartitionManifest::spillover`].
    pub fn from_segments(
        ntp: Ntp,
        revision: InitialRevisionId,
        segments: impl IntoIterator<Item = SegmentMeta>,
    ) -> Result<Self, ManifestError> {
        let mut shard = SpilloverManifest::new(ntp, revision);
        for meta in segments {
            shard.add(meta)?;
        }
        Ok(shard)
    }

    pub fn add(&mut self, meta: SegmentMeta) -> Result<(), ManifestError> {
        self.manifest.add(meta)
    }

    pub fn manifest(&self) -> &PartitionManifest {
        &self.manifest
    }

    /// The key components this shard publishes under. A spillover manifest
    /// is never empty; an empty one has no window to address.
    pub fn path_components(&self) -> SpilloverPathComponents {
        let first = self
            .manifest
            .segments()
            .next()
            .expect("spillover manifest can't be empty");
        let last = self
            .manifest
            .last_segment()
            .expect("spillover manifest can't be empty");
        SpilloverPathComponents {
            base: first.base_offset,
            last: last.committed_offset,
            base_kafka: first.base_kafka_offset(),
            next_kafka: last.next_kafka_offset(),
            base_ts: first.base_timestamp,
            last_ts: last.max_timestamp,
        }
    }

    /// The object key of this shard, derived from the owning STM manifest's
    /// location and this shard's own window.
    pub fn object_key(
        &self,
        provider: &RemotePathProvider,
        stm_manifest: &PartitionManifest,
    ) -> String {
        provider.spillover_manifest_path(stm_manifest, &self.path_components())
    }
}

impl From<PartitionManifest> for SpilloverManifest {
    fn from(manifest: PartitionManifest) -> Self {
        SpilloverManifest { manifest }
    }
}

#[cfg(test)]
mod tests {
    use shoal_base::codec::Codec;
    use shoal_model::{Offset, OffsetDelta, Timestamp};

    use super::*;

    fn meta(base: i64, committed: i64) -> SegmentMeta {
        SegmentMeta {
            size_bytes: 1024,
            base_offset: Offset(base),
            committed_offset: Offset(committed),
            base_timestamp: Timestamp(base),
            max_timestamp: Timestamp(committed),
            delta_offset: OffsetDelta(2),
            delta_offset_end: OffsetDelta(3),
            ..Default::default()
        }
    }

    #[test]
    fn key_recomposes_from_content() {
        let ntp = Ntp::new("kafka", "orders", 1);
        let stm = PartitionManifest::new(ntp.clone(), InitialRevisionId(7));
        let shard =
            SpilloverManifest::from_segments(ntp, InitialRevisionId(7), [meta(100, 149), meta(150, 199)])
                .unwrap();
        let provider = RemotePathProvider::new(Some(crate::RemoteLabel::new("lbl")));
        let key = shard.object_key(&provider, &stm);
        // {base}.{last}.{base_kafka}.{next_kafka}.{base_ts}.{last_ts}
        assert!(key.ends_with("manifest.bin.100.199.98.197.100.199"), "{key}");

        // The key of a shard is a pure function of its content: a decoded
        // copy produces the identical key.
        let decoded: SpilloverManifest =
            PartitionManifest::decode(&shard.manifest().encode_to_vec())
                .unwrap()
                .into();
        assert_eq!(decoded.object_key(&provider, &stm), key);
    }
}
