// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::InitialRevisionId;

/// A topic namespace, e.g. `kafka` for user topics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl Namespace {
    pub fn new(s: impl Into<String>) -> Self {
        Namespace(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicName(pub String);

impl TopicName {
    pub fn new(s: impl Into<String>) -> Self {
        TopicName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PartitionId(pub i32);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The globally unique identity of one replicated partition log:
/// (namespace, topic, partition).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ntp {
    pub ns: Namespace,
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl Ntp {
    pub fn new(ns: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Ntp {
            ns: Namespace::new(ns),
            topic: TopicName::new(topic),
            partition: PartitionId(partition),
        }
    }

    /// The `{ns}/{topic}/{partition}_{rev}` path component used by every
    /// partition-scoped remote key.
    pub fn remote_path_component(&self, rev: InitialRevisionId) -> String {
        format!("{}/{}/{}_{}", self.ns, self.topic, self.partition, rev)
    }

    /// The `{ns}/{topic}` path component used by topic-scoped remote keys.
    pub fn topic_path_component(&self) -> String {
        format!("{}/{}", self.ns, self.topic)
    }
}

impl std::fmt::Display for Ntp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.ns, self.topic, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_display_and_paths() {
        let ntp = Ntp::new("kafka", "payments", 3);
        assert_eq!(ntp.to_string(), "kafka/payments/3");
        assert_eq!(
            ntp.remote_path_component(InitialRevisionId(21)),
            "kafka/payments/3_21"
        );
        assert_eq!(ntp.topic_path_component(), "kafka/payments");
    }
}
