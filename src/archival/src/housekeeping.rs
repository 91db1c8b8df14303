// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use shoal_base::retry::RetryChainNode;

use crate::ArchivalError;

/// A unit of background maintenance the archiver schedules between upload
/// rounds: segment merging, spillover, retention.
///
/// Jobs are interruptible: leadership loss or shutdown calls `interrupt`,
/// and a running job is expected to notice at its next suspension point and
/// bail with `ShuttingDown`.
#[async_trait::async_trait]
pub trait HousekeepingJob: Send + Sync {
    /// Runs one pass of the job under the given retry budget.
    async fn run(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError>;

    fn interrupt(&self);

    fn interrupted(&self) -> bool;

    /// Name for logs and metrics.
    fn name(&self) -> &'static str;
}
