// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task spawning with mandatory names.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a named task onto the current runtime.
///
/// The name closure keeps allocation off the non-debug path and shows up as
/// a `task` span on everything the task logs.
pub fn spawn<N, S, F>(name: N, fut: F) -> JoinHandle<F::Output>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name();
    let span = tracing::info_span!("task", name = name.as_ref());
    tokio::spawn(fut.instrument(span))
}

/// A task handle that aborts the task when dropped.
///
/// Background loops tied to an owner (archiver, manifest view, STM) hold
/// their fibers through this so teardown cannot leak them.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(pub JoinHandle<T>);

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
