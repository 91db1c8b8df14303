// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Assigns partition replicas to shards on this node.
//!
//! Counts-based: a new replica lands on the shard currently hosting the
//! fewest. The balancer is the only writer of placement targets; it runs on
//! the designated assignment shard and publishes targets through the
//! per-shard placement tables.

use std::collections::HashMap;
use std::sync::Arc;

use shoal_model::{GroupId, Ntp, RevisionId, ShardId, ShardRevisionId};
use tracing::info;

use crate::shard_placement_table::{ShardLocalAssignment, ShardPlacementTable};
use crate::ClusterError;

pub struct ShardBalancer {
    tables: Vec<Arc<ShardPlacementTable>>,
    /// Where each ntp is currently targeted, so moves retract the old
    /// target.
    targets: tokio::sync::Mutex<HashMap<Ntp, ShardId>>,
    next_shard_revision: std::sync::atomic::AtomicI64,
}

impl ShardBalancer {
    /// One table per shard, indexed by shard id.
    pub fn new(tables: Vec<Arc<ShardPlacementTable>>) -> Self {
        ShardBalancer {
            tables,
            targets: tokio::sync::Mutex::new(HashMap::new()),
            next_shard_revision: std::sync::atomic::AtomicI64::new(1),
        }
    }

    fn bump_revision(&self) -> ShardRevisionId {
        ShardRevisionId(
            self.next_shard_revision
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        )
    }

    async fn counts(&self) -> HashMap<ShardId, usize> {
        let targets = self.targets.lock().await;
        let mut counts: HashMap<ShardId, usize> =
            self.tables.iter().map(|t| (t.shard(), 0)).collect();
        for shard in targets.values() {
            *counts.entry(*shard).or_default() += 1;
        }
        counts
    }

    fn table(&self, shard: ShardId) -> &Arc<ShardPlacementTable> {
        self.tables
            .iter()
            .find(|t| t.shard() == shard)
            .expect("shard id out of range")
    }

    /// Places a new replica on the least-loaded shard and publishes the
    /// target. Returns the chosen shard.
    pub async fn assign(
        &self,
        ntp: &Ntp,
        group: GroupId,
        log_revision: RevisionId,
    ) -> Result<ShardId, ClusterError> {
        let counts = self.counts().await;
        let shard = counts
            .into_iter()
            .min_by_key(|(shard, count)| (*count, shard.0))
            .map(|(shard, _)| shard)
            .expect("balancer has at least one shard");
        let assignment = ShardLocalAssignment {
            group,
            log_revision,
            shard_revision: self.bump_revision(),
        };
        self.table(shard).set_target(ntp, Some(assignment)).await?;
        self.targets.lock().await.insert(ntp.clone(), shard);
        info!(%ntp, %shard, ?log_revision, "assigned replica to shard");
        Ok(shard)
    }

    /// Moves a replica to an explicit shard, retracting the previous
    /// target so the old shard reconciles to a transfer.
    pub async fn reassign_shard(
        &self,
        ntp: &Ntp,
        group: GroupId,
        log_revision: RevisionId,
        to: ShardId,
    ) -> Result<(), ClusterError> {
        let prev = self.targets.lock().await.get(ntp).copied();
        if let Some(prev) = prev.filter(|p| *p != to) {
            self.table(prev).set_target(ntp, None).await?;
        }
        let assignment = ShardLocalAssignment {
            group,
            log_revision,
            shard_revision: self.bump_revision(),
        };
        self.table(to).set_target(ntp, Some(assignment)).await?;
        self.targets.lock().await.insert(ntp.clone(), to);
        info!(%ntp, shard = %to, "reassigned replica");
        Ok(())
    }

    /// Retracts the target of a removed replica everywhere.
    pub async fn remove(&self, ntp: &Ntp) -> Result<(), ClusterError> {
        let prev = self.targets.lock().await.remove(ntp);
        if let Some(shard) = prev {
            self.table(shard).set_target(ntp, None).await?;
        }
        Ok(())
    }
}
