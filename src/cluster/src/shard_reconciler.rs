// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives shard-local reality toward the placement targets.
//!
//! One pass walks every placement entry on every shard, asks the table for
//! the required action and executes it against the [`PartitionHost`] (the
//! layer that actually starts, stops and moves partition instances). The
//! pass is convergent, not transactional: each step persists its own
//! placement update, so a crash mid-pass leaves a state the next pass
//! continues from.

use std::collections::HashMap;
use std::sync::Arc;

use shoal_model::{GroupId, Ntp, RevisionId, ShardId};
use tracing::{debug, info, warn};

use crate::shard_placement_table::{
    HostedStatus, ReconciliationAction, ShardPlacementTable,
};
use crate::ClusterError;

/// What the topic table expects of one partition replica on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedReplica {
    pub group: GroupId,
    pub log_revision: RevisionId,
}

/// The layer that materializes reconciliation decisions: creates partition
/// instances, tears them down, and moves their shard-local state.
#[async_trait::async_trait]
pub trait PartitionHost: Send + Sync {
    async fn create_partition(
        &self,
        shard: ShardId,
        ntp: &Ntp,
        group: GroupId,
        log_revision: RevisionId,
    ) -> Result<(), ClusterError>;

    async fn remove_partition(&self, shard: ShardId, ntp: &Ntp) -> Result<(), ClusterError>;

    /// Moves the shard-local state of `ntp` between two shards on this
    /// node. Called after the placement handshake recorded the transfer.
    async fn transfer_partition(
        &self,
        ntp: &Ntp,
        from: ShardId,
        to: ShardId,
    ) -> Result<(), ClusterError>;
}

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub removed: usize,
    pub transferred: usize,
    /// Entries whose target lags the topic table; they need another pass.
    pub pending: usize,
}

impl ReconcileSummary {
    /// True when nothing changed and nothing is waiting.
    pub fn converged(&self) -> bool {
        *self == ReconcileSummary::default()
    }
}

pub struct ShardReconciler {
    tables: Vec<Arc<ShardPlacementTable>>,
    host: Arc<dyn PartitionHost>,
}

impl ShardReconciler {
    pub fn new(tables: Vec<Arc<ShardPlacementTable>>, host: Arc<dyn PartitionHost>) -> Self {
        ShardReconciler { tables, host }
    }

    /// Runs one pass over every shard. `expected` is the node's slice of
    /// the topic table: which replicas should exist here at which revision.
    pub async fn reconcile(
        &self,
        expected: &HashMap<Ntp, ExpectedReplica>,
    ) -> Result<ReconcileSummary, ClusterError> {
        let mut summary = ReconcileSummary::default();
        for table in &self.tables {
            for ntp in table.ntps().await {
                let Some(state) = table.get_state(&ntp).await else {
                    continue;
                };
                let expectation = expected.get(&ntp);
                let action =
                    state.get_reconciliation_action(expectation.map(|e| e.log_revision));
                debug!(shard = %table.shard(), %ntp, ?action, "reconciling replica");
                match action {
                    ReconciliationAction::Create => {
                        // Converged entries also report Create; only act when
                        // nothing is hosted yet.
                        if state.current.map_or(true, |c| {
                            c.status == HostedStatus::Receiving
                        }) {
                            let expect =
                                expectation.expect("create implies an expected replica");
                            self.host
                                .create_partition(
                                    table.shard(),
                                    &ntp,
                                    expect.group,
                                    expect.log_revision,
                                )
                                .await?;
                            table.prepare_create(&ntp).await?;
                            summary.created += 1;
                        }
                    }
                    ReconciliationAction::Remove => {
                        if state.current.is_some() {
                            self.host.remove_partition(table.shard(), &ntp).await?;
                            summary.removed += 1;
                        }
                        table.finish_delete(&ntp).await?;
                        // A retracted assignment with no local state leaves a
                        // dangling target; clear it so the entry disappears.
                        if expectation.is_none() {
                            table.set_target(&ntp, None).await?;
                        }
                    }
                    ReconciliationAction::Transfer => {
                        match self.find_target_shard(&ntp, table.shard()).await {
                            Some(dest) => {
                                self.transfer(table, &dest, &ntp).await?;
                                summary.transferred += 1;
                            }
                            None => {
                                // Target not published yet; try again later.
                                summary.pending += 1;
                            }
                        }
                    }
                    ReconciliationAction::WaitForTargetUpdate => {
                        summary.pending += 1;
                    }
                }
            }
        }
        if !summary.converged() {
            info!(?summary, "reconciliation pass applied changes");
        }
        Ok(summary)
    }

    /// Finds the shard (other than `source`) currently assigned `ntp`.
    async fn find_target_shard(
        &self,
        ntp: &Ntp,
        source: ShardId,
    ) -> Option<Arc<ShardPlacementTable>> {
        for table in &self.tables {
            if table.shard() == source {
                continue;
            }
            if let Some(state) = table.get_state(ntp).await {
                if state.assigned.is_some() {
                    return Some(Arc::clone(table));
                }
            }
        }
        None
    }

    async fn transfer(
        &self,
        source: &Arc<ShardPlacementTable>,
        dest: &Arc<ShardPlacementTable>,
        ntp: &Ntp,
    ) -> Result<(), ClusterError> {
        let outgoing = source.prepare_transfer(ntp).await?;
        dest.start_receiving(ntp, outgoing).await?;
        if let Err(e) = self
            .host
            .transfer_partition(ntp, source.shard(), dest.shard())
            .await
        {
            warn!(%ntp, error = %e, "partition transfer failed; source stays obsolete");
            return Err(e);
        }
        dest.finish_transfer(ntp).await?;
        // The obsolete source copy is torn down like any removal.
        self.host.remove_partition(source.shard(), ntp).await?;
        source.finish_delete(ntp).await?;
        Ok(())
    }
}
