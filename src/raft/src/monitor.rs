// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::Arc;
use std::time::Duration;

use shoal_base::CancellationToken;
use shoal_model::Offset;
use tokio::sync::watch;

use crate::RaftError;

/// A monotonically advancing offset that waiters can block on.
///
/// The producer side calls [`OffsetMonitor::notify`] as offsets become
/// visible/durable; any number of waiters block until the monitored value
/// reaches their target. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct OffsetMonitor {
    tx: Arc<watch::Sender<Option<Offset>>>,
}

impl OffsetMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        OffsetMonitor { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Option<Offset> {
        *self.tx.borrow()
    }

    /// Advances the monitored offset. Regressions are ignored; the monitor
    /// is monotone by construction.
    pub fn notify(&self, offset: Offset) {
        self.tx.send_if_modified(|cur| match cur {
            Some(c) if *c >= offset => false,
            _ => {
                *cur = Some(offset);
                true
            }
        });
    }

    /// Waits until the monitored offset reaches `target`, the deadline
    /// passes, or `abort` fires.
    pub async fn wait(
        &self,
        target: Offset,
        timeout: Option<Duration>,
        abort: &CancellationToken,
    ) -> Result<(), RaftError> {
        let mut rx = self.tx.subscribe();
        let reached = |v: &Option<Offset>| matches!(v, Some(o) if *o >= target);
        let wait = async {
            loop {
                if reached(&rx.borrow()) {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(RaftError::ShuttingDown);
                }
            }
        };
        let bounded = async {
            match timeout {
                Some(t) => tokio::time::timeout(t, wait)
                    .await
                    .unwrap_or(Err(RaftError::Timeout)),
                None => wait.await,
            }
        };
        tokio::select! {
            res = bounded => res,
            _ = abort.cancelled() => Err(RaftError::ShuttingDown),
        }
    }
}

impl Default for OffsetMonitor {
    fn default() -> Self {
        Self::new()
    }
}
