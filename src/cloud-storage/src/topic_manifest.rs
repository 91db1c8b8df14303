// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Topic-level metadata in the object store.
//!
//! One blob per topic, written at topic creation and consulted during
//! topic recovery: without it a bucket full of partition objects cannot be
//! mapped back to a topic configuration. Partition manifests stay
//! authoritative for per-partition state; this records only what the topic
//! looked like when it was created.

use bytes::BufMut;
use prost::Message;
use shoal_base::codec::Codec;
use shoal_model::{InitialRevisionId, Namespace, TopicName};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicManifest {
    pub ns: Namespace,
    pub topic: TopicName,
    pub partition_count: i32,
    pub replication_factor: i16,
    pub revision: InitialRevisionId,
    /// Cloud retention at creation time; live values come from the topic
    /// configuration, this is a recovery fallback.
    pub retention_bytes: Option<u64>,
    pub retention_ms: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTopicManifest {
    #[prost(string, tag = "1")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub topic: ::prost::alloc::string::String,
    #[prost(int32, tag = "3")]
    pub partition_count: i32,
    #[prost(int32, tag = "4")]
    pub replication_factor: i32,
    #[prost(int64, tag = "5")]
    pub revision: i64,
    #[prost(uint64, optional, tag = "6")]
    pub retention_bytes: ::core::option::Option<u64>,
    #[prost(int64, optional, tag = "7")]
    pub retention_ms: ::core::option::Option<i64>,
}

impl Codec for TopicManifest {
    fn codec_name() -> String {
        "proto[TopicManifest]".into()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let proto = ProtoTopicManifest {
            namespace: self.ns.to_string(),
            topic: self.topic.to_string(),
            partition_count: self.partition_count,
            replication_factor: i32::from(self.replication_factor),
            revision: self.revision.0,
            retention_bytes: self.retention_bytes,
            retention_ms: self.retention_ms,
        };
        proto
            .encode(buf)
            .expect("no required fields means no initialization errors");
    }

    fn decode(buf: &[u8]) -> Result<Self, String> {
        let proto = ProtoTopicManifest::decode(buf).map_err(|e| e.to_string())?;
        Ok(TopicManifest {
            ns: Namespace::new(proto.namespace),
            topic: TopicName::new(proto.topic),
            partition_count: proto.partition_count,
            replication_factor: i16::try_from(proto.replication_factor)
                .map_err(|e| e.to_string())?,
            revision: InitialRevisionId(proto.revision),
            retention_bytes: proto.retention_bytes,
            retention_ms: proto.retention_ms,
        })
    }
}
