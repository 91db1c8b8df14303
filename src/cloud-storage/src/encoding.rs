// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Persisted encodings of the cloud-tier state.
//!
//! Every blob written to the object store or the local kv-store goes through
//! these protobuf messages. The messages are maintained by hand and must
//! stay append-only: new fields get new tags, old tags are never reused, so
//! a manifest written by an old version always decodes.
//!
//! Encodings must also be byte-stable: repeated fields are emitted in
//! manifest order and the tracker table is a sorted map, so encoding equal
//! values yields identical bytes. Spillover keys and change detection depend
//! on that.

use std::collections::BTreeMap;

use bytes::BufMut;
use prost::Message;
use shoal_base::codec::Codec;
use shoal_model::{
    InitialRevisionId, KafkaOffset, Ntp, Offset, OffsetDelta, SegmentMeta, SegmentNameFormat,
    Term, Timestamp,
};
use shoal_proto::{RustType, TryFromProtoError};

use crate::access_time_tracker::AccessTimeTracker;
use crate::partition_manifest::{ManifestError, PartitionManifest};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSegmentMeta {
    #[prost(bool, tag = "1")]
    pub is_compacted: bool,
    #[prost(uint64, tag = "2")]
    pub size_bytes: u64,
    #[prost(int64, tag = "3")]
    pub base_offset: i64,
    #[prost(int64, tag = "4")]
    pub committed_offset: i64,
    #[prost(int64, tag = "5")]
    pub base_timestamp: i64,
    #[prost(int64, tag = "6")]
    pub max_timestamp: i64,
    #[prost(int64, tag = "7")]
    pub delta_offset: i64,
    #[prost(int64, tag = "8")]
    pub delta_offset_end: i64,
    #[prost(int64, tag = "9")]
    pub ntp_revision: i64,
    #[prost(int64, tag = "10")]
    pub segment_term: i64,
    #[prost(int64, tag = "11")]
    pub archiver_term: i64,
    #[prost(uint32, tag = "12")]
    pub sname_format: u32,
}

impl RustType<ProtoSegmentMeta> for SegmentMeta {
    fn into_proto(&self) -> ProtoSegmentMeta {
        ProtoSegmentMeta {
            is_compacted: self.is_compacted,
            size_bytes: self.size_bytes,
            base_offset: self.base_offset.0,
            committed_offset: self.committed_offset.0,
            base_timestamp: self.base_timestamp.0,
            max_timestamp: self.max_timestamp.0,
            delta_offset: self.delta_offset.0,
            delta_offset_end: self.delta_offset_end.0,
            ntp_revision: self.ntp_revision.0,
            segment_term: self.segment_term.0,
            archiver_term: self.archiver_term.0,
            sname_format: self.sname_format.version(),
        }
    }

    fn from_proto(proto: ProtoSegmentMeta) -> Result<Self, TryFromProtoError> {
        Ok(SegmentMeta {
            is_compacted: proto.is_compacted,
            size_bytes: proto.size_bytes,
            base_offset: Offset(proto.base_offset),
            committed_offset: Offset(proto.committed_offset),
            base_timestamp: Timestamp(proto.base_timestamp),
            max_timestamp: Timestamp(proto.max_timestamp),
            delta_offset: OffsetDelta(proto.delta_offset),
            delta_offset_end: OffsetDelta(proto.delta_offset_end),
            ntp_revision: InitialRevisionId(proto.ntp_revision),
            segment_term: Term(proto.segment_term),
            archiver_term: Term(proto.archiver_term),
            sname_format: SegmentNameFormat::from_version(proto.sname_format).ok_or_else(
                || {
                    TryFromProtoError::unknown_enum_variant(format!(
                        "sname_format {}",
                        proto.sname_format
                    ))
                },
            )?,
        })
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoPartitionManifest {
    #[prost(string, tag = "1")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub topic: ::prost::alloc::string::String,
    #[prost(int32, tag = "3")]
    pub partition: i32,
    #[prost(int64, tag = "4")]
    pub revision: i64,
    #[prost(message, repeated, tag = "5")]
    pub segments: ::prost::alloc::vec::Vec<ProtoSegmentMeta>,
    #[prost(message, repeated, tag = "6")]
    pub spillover: ::prost::alloc::vec::Vec<ProtoSegmentMeta>,
    #[prost(int64, optional, tag = "7")]
    pub start_offset: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "8")]
    pub last_offset: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "9")]
    pub insync_offset: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "10")]
    pub archive_start_offset: ::core::option::Option<i64>,
    #[prost(int64, tag = "11")]
    pub archive_start_offset_delta: i64,
    #[prost(int64, optional, tag = "12")]
    pub archive_clean_offset: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "13")]
    pub start_kafka_offset_override: ::core::option::Option<i64>,
    #[prost(uint64, tag = "14")]
    pub archive_size_bytes: u64,
}

impl PartitionManifest {
    /// Rebuilds a manifest from its proto representation, revalidating the
    /// ordering invariants on the way in.
    fn from_proto_parts(proto: ProtoPartitionManifest) -> Result<Self, TryFromProtoError> {
        let ntp = Ntp::new(proto.namespace, proto.topic, proto.partition);
        let mut manifest = PartitionManifest::new(ntp, InitialRevisionId(proto.revision));
        for seg in proto.segments {
            let meta = SegmentMeta::from_proto(seg)?;
            manifest.add(meta).map_err(|e: ManifestError| {
                TryFromProtoError::InvalidPersistedState(e.to_string())
            })?;
        }
        for shard in proto.spillover {
            let meta = SegmentMeta::from_proto(shard)?;
            manifest.push_spillover_descriptor(meta);
        }
        if let Some(o) = proto.start_offset {
            manifest.force_start_offset(Offset(o));
        }
        if let Some(o) = proto.last_offset {
            manifest.force_last_offset(Offset(o));
        }
        if let Some(o) = proto.insync_offset {
            manifest.advance_insync_offset(Offset(o));
        }
        if let Some(o) = proto.archive_start_offset {
            manifest
                .set_archive_start_offset(Offset(o), OffsetDelta(proto.archive_start_offset_delta));
        }
        if let Some(o) = proto.archive_clean_offset {
            manifest
                .set_archive_clean_offset(Offset(o), 0)
                .map_err(|e| TryFromProtoError::InvalidPersistedState(e.to_string()))?;
        }
        if let Some(k) = proto.start_kafka_offset_override {
            manifest.advance_start_kafka_offset(KafkaOffset(k));
        }
        manifest.force_archive_size_bytes(proto.archive_size_bytes);
        Ok(manifest)
    }
}

impl RustType<ProtoPartitionManifest> for PartitionManifest {
    fn into_proto(&self) -> ProtoPartitionManifest {
        ProtoPartitionManifest {
            namespace: self.ntp().ns.to_string(),
            topic: self.ntp().topic.to_string(),
            partition: self.ntp().partition.0,
            revision: self.revision().0,
            segments: self.segments().map(|s| s.into_proto()).collect(),
            spillover: self.spillover().iter().map(|s| s.into_proto()).collect(),
            start_offset: self.start_offset().map(|o| o.0),
            last_offset: self.last_offset().map(|o| o.0),
            insync_offset: self.insync_offset().map(|o| o.0),
            archive_start_offset: self.archive_start_offset().map(|o| o.0),
            archive_start_offset_delta: self.archive_start_offset_delta().0,
            archive_clean_offset: self.archive_clean_offset().map(|o| o.0),
            start_kafka_offset_override: self.start_kafka_offset_override().map(|k| k.0),
            archive_size_bytes: self.archive_size_bytes(),
        }
    }

    fn from_proto(proto: ProtoPartitionManifest) -> Result<Self, TryFromProtoError> {
        Self::from_proto_parts(proto)
    }
}

impl Codec for PartitionManifest {
    fn codec_name() -> String {
        "proto[PartitionManifest]".into()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.into_proto()
            .encode(buf)
            .expect("no required fields means no initialization errors");
    }

    fn decode(buf: &[u8]) -> Result<Self, String> {
        let proto = ProtoPartitionManifest::decode(buf).map_err(|e| e.to_string())?;
        Self::from_proto(proto).map_err(|e| e.to_string())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAccessTimeTracker {
    #[prost(btree_map = "uint32, uint32", tag = "1")]
    pub table: BTreeMap<u32, u32>,
}

impl Codec for AccessTimeTracker {
    fn codec_name() -> String {
        "proto[AccessTimeTracker]".into()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let proto = ProtoAccessTimeTracker {
            table: self.table().clone(),
        };
        proto
            .encode(buf)
            .expect("no required fields means no initialization errors");
    }

    fn decode(buf: &[u8]) -> Result<Self, String> {
        let proto = ProtoAccessTimeTracker::decode(buf).map_err(|e| e.to_string())?;
        Ok(AccessTimeTracker::from_table(proto.table))
    }
}
