// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Housekeeping job re-uploading runs of small adjacent segments.
//!
//! Frequent flushes and low-throughput topics produce many tiny uploaded
//! segments; each costs a GET on every read path. This job scans the
//! manifest left to right, proposing collections through the archiver's
//! segment collector and re-uploading where a run of entries can collapse
//! into one object. The scan position survives between runs so one pass
//! over the partition converges instead of rescanning the head forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use shoal_base::retry::RetryChainNode;
use shoal_config::ShoalConfig;
use shoal_model::Offset;
use tracing::debug;

use crate::housekeeping::HousekeepingJob;
use crate::ntp_archiver::NtpArchiver;
use crate::ArchivalError;

/// Upper bound on a merged re-upload when no target size is configured.
const DEFAULT_TARGET_SIZE: u64 = 128 * 1024 * 1024;

pub struct AdjacentSegmentMerger {
    /// Weak: the archiver owns its housekeeping jobs, so a strong reference
    /// here would cycle.
    archiver: Weak<NtpArchiver>,
    enabled: shoal_config::Binding<bool>,
    target_segment_size: shoal_config::Binding<Option<u64>>,
    min_segment_size: shoal_config::Binding<Option<u64>>,
    /// Where the next scan resumes.
    last: Mutex<Offset>,
    interrupted: AtomicBool,
}

impl AdjacentSegmentMerger {
    pub fn new(archiver: &Arc<NtpArchiver>, cfg: &ShoalConfig) -> Self {
        AdjacentSegmentMerger {
            archiver: Arc::downgrade(archiver),
            enabled: cfg.cloud_storage_enable_segment_merging.bind(),
            target_segment_size: cfg.cloud_storage_segment_size_target.bind(),
            min_segment_size: cfg.cloud_storage_segment_size_min.bind(),
            last: Mutex::new(Offset(0)),
            interrupted: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl HousekeepingJob for AdjacentSegmentMerger {
    async fn run(&self, rtc: &mut RetryChainNode) -> Result<(), ArchivalError> {
        if !self.enabled.get() || self.interrupted() {
            return Ok(());
        }
        let Some(archiver) = self.archiver.upgrade() else {
            return Ok(());
        };
        let scan_start = {
            let last = self.last.lock().expect("lock poisoned");
            let manifest_start = archiver
                .view()
                .with_stm(|stm| stm.start_offset())
                .unwrap_or(Offset(0));
            (*last).max(manifest_start)
        };
        let target = self
            .target_segment_size
            .get()
            .unwrap_or(DEFAULT_TARGET_SIZE);
        let min = self.min_segment_size.get();
        match archiver
            .maybe_merge_adjacent(rtc, scan_start, target, min)
            .await?
        {
            Some(resume_at) => {
                *self.last.lock().expect("lock poisoned") = resume_at;
            }
            None => {
                debug!(ntp = %archiver.ntp(), %scan_start, "no merge candidate");
                // Restart from the manifest head next time; compaction may
                // have caught up behind the scan position.
                *self.last.lock().expect("lock poisoned") = Offset(0);
            }
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "adjacent_segment_merger"
    }
}
