// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry budgets.
//!
//! Two layers cooperate here. [`Retry`]/[`RetryStream`] is a plain jittered
//! exponential backoff, used where an operation retries against a single
//! external service. [`RetryChainNode`] adds the budget discipline for
//! nested async call chains: every remote operation holds a node, child
//! operations derive child nodes, and a child can only ever shrink the
//! deadline it inherited. That keeps total backoff bounded no matter how
//! deeply uploads, hydrations and housekeeping nest.

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::CancellationToken;

/// Configures a [`RetryStream`].
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    /// The initial backoff for the first retry.
    pub initial_backoff: Duration,
    /// The backoff multiplier applied per attempt.
    pub multiplier: u32,
    /// An upper bound on a single sleep.
    pub clamp: Duration,
    /// Seed for jitter, so tests can be deterministic.
    pub seed: u64,
}

impl Retry {
    /// Defaults tuned for object-store requests: fast first retry, capped at
    /// a few seconds so a stuck dependency is re-probed regularly.
    pub fn remote_defaults(seed: u64) -> Self {
        Retry {
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            clamp: Duration::from_secs(4),
            seed,
        }
    }

    pub fn into_retry_stream(self) -> RetryStream {
        let rng = SmallRng::seed_from_u64(self.seed);
        let next_sleep = self.initial_backoff;
        RetryStream {
            cfg: self,
            rng,
            attempt: 0,
            next_sleep,
        }
    }
}

/// The state of a sequence of retries driven by a [`Retry`].
#[derive(Debug)]
pub struct RetryStream {
    cfg: Retry,
    rng: SmallRng,
    attempt: usize,
    next_sleep: Duration,
}

impl RetryStream {
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// The sleep the next [`RetryStream::sleep`] call will perform, before
    /// jitter.
    pub fn next_sleep(&self) -> Duration {
        self.next_sleep
    }

    /// Sleeps for the current backoff (with up to +25% jitter) and advances
    /// the stream.
    pub async fn sleep(&mut self) {
        let jitter = self.rng.gen_range(1.0..1.25);
        let sleep = self.next_sleep.mul_f64(jitter).min(self.cfg.clamp);
        self.attempt += 1;
        self.next_sleep = self
            .next_sleep
            .saturating_mul(self.cfg.multiplier)
            .min(self.cfg.clamp);
        tokio::time::sleep(sleep).await;
    }
}

/// The verdict a [`RetryChainNode`] gives about one more attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPermit {
    /// Try again after sleeping for the contained backoff.
    Allowed { delay: Duration },
    /// The budget is exhausted or the chain was aborted; give up.
    Disallowed,
}

impl RetryPermit {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RetryPermit::Allowed { .. })
    }
}

/// A node of the tree-structured retry budget threaded through async call
/// chains.
///
/// The root carries the caller's overall deadline. Children inherit the
/// parent's deadline, clamped by their own timeout, so the subtree under any
/// node always finishes within that node's budget.
#[derive(Debug)]
pub struct RetryChainNode {
    deadline: Instant,
    backoff: Duration,
    next_backoff: Duration,
    token: CancellationToken,
}

impl RetryChainNode {
    pub fn new(timeout: Duration, backoff: Duration, token: CancellationToken) -> Self {
        let deadline = Instant::now() + timeout;
        RetryChainNode {
            deadline,
            backoff,
            next_backoff: backoff,
            token,
        }
    }

    /// Derives a child node. The child's deadline never exceeds the
    /// parent's.
    pub fn child(&self, timeout: Duration, backoff: Duration) -> RetryChainNode {
        let deadline = (Instant::now() + timeout).min(self.deadline);
        RetryChainNode {
            deadline,
            backoff,
            next_backoff: backoff,
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Asks for one more attempt. Allowed while the deadline has not passed
    /// and the chain is not aborted; the granted delay doubles per call and
    /// never extends past the deadline.
    pub fn retry(&mut self) -> RetryPermit {
        let now = Instant::now();
        if self.token.is_cancelled() || now >= self.deadline {
            return RetryPermit::Disallowed;
        }
        let remaining = self.deadline - now;
        let delay = self.next_backoff.min(remaining);
        self.next_backoff = self.next_backoff.saturating_mul(2);
        RetryPermit::Allowed { delay }
    }

    /// Resets the backoff progression, e.g. after a successful request.
    pub fn reset(&mut self) {
        self.next_backoff = self.backoff;
    }

    /// Sleeps for `delay`, returning early with `false` if the chain is
    /// aborted mid-sleep.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.token.cancelled() => false,
        }
    }
}
