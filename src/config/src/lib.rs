// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Live-bindable configuration.
//!
//! Every tunable is a [`Property`]: a current value plus a broadcast of
//! changes. Components either read the current value at the point of use or
//! hold a [`Binding`] and observe updates without a restart. There is no
//! "reload" step anywhere; setting a property is immediately visible to all
//! bindings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// One live-updatable configuration value.
#[derive(Debug)]
pub struct Property<T> {
    name: &'static str,
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq + std::fmt::Debug> Property<T> {
    pub fn new(name: &'static str, default: T) -> Self {
        let (tx, _rx) = watch::channel(default);
        Property { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Updates the value, waking every binding.
    pub fn set(&self, value: T) {
        let prev = self.tx.send_replace(value.clone());
        if prev != value {
            tracing::info!(property = self.name, ?prev, ?value, "config changed");
        }
    }

    /// A live view of this property.
    pub fn bind(&self) -> Binding<T> {
        Binding {
            rx: self.tx.subscribe(),
        }
    }
}

/// A live view of a [`Property`]. Cheap to clone and to read.
#[derive(Debug, Clone)]
pub struct Binding<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> Binding<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Completes when the underlying property changes. Returns `false` when
    /// the property was dropped and no further changes can arrive.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// What a shrinking manifest cache does with `prepare` waiters whose
/// reservation fits the new, smaller capacity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShrinkWakeupPolicy {
    /// Finish eager eviction first, then wake waiters.
    #[default]
    AfterEviction,
    /// Wake fitting waiters before eviction completes.
    Immediate,
}

/// Per-topic log cleanup policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Compact,
    CompactDelete,
}

impl CleanupPolicy {
    pub fn compacts(self) -> bool {
        matches!(self, CleanupPolicy::Compact | CleanupPolicy::CompactDelete)
    }

    pub fn deletes(self) -> bool {
        matches!(self, CleanupPolicy::Delete | CleanupPolicy::CompactDelete)
    }
}

/// Node-wide tunables of the archival core. One instance per process,
/// shared by reference.
#[derive(Debug)]
pub struct ShoalConfig {
    /// Byte budget of the per-core materialized manifest cache.
    pub cloud_storage_manifest_cache_size: Property<u64>,
    /// Inactivity TTL after which manifest-view cursors are evicted.
    pub cloud_storage_manifest_cache_ttl: Property<Duration>,
    /// What a cache shrink does with pending `prepare` waiters.
    pub cloud_storage_manifest_cache_shrink_wakeup_policy: Property<ShrinkWakeupPolicy>,
    /// Spill the manifest head once the live manifest holds this many
    /// segments.
    pub cloud_storage_spillover_manifest_max_segments: Property<Option<usize>>,
    /// Spill the manifest head once its serialized size exceeds this.
    pub cloud_storage_spillover_manifest_size: Property<Option<u64>>,
    /// Master switch for adjacent-segment merging during housekeeping.
    pub cloud_storage_enable_segment_merging: Property<bool>,
    /// Desired size of merged re-uploaded segments.
    pub cloud_storage_segment_size_target: Property<Option<u64>>,
    /// Uploaded segments smaller than this are merge candidates.
    pub cloud_storage_segment_size_min: Property<Option<u64>>,
    /// Upper bound on concurrent segment uploads per partition.
    pub cloud_storage_max_concurrent_uploads: Property<usize>,
    /// Stops the archiver upload loop; housekeeping keeps running.
    pub cloud_storage_disable_upload_loop_for_tests: Property<bool>,
    /// Free-space alert threshold in bytes (0 disables).
    pub storage_space_alert_free_threshold_bytes: Property<u64>,
    /// Free-space alert threshold in percent of volume size.
    pub storage_space_alert_free_threshold_percent: Property<u8>,
    /// Below this many free bytes the node degrades to read-only behavior.
    pub storage_min_free_bytes: Property<u64>,
}

impl ShoalConfig {
    pub fn new() -> Self {
        ShoalConfig {
            cloud_storage_manifest_cache_size: Property::new(
                "cloud_storage_manifest_cache_size",
                1024 * 1024,
            ),
            cloud_storage_manifest_cache_ttl: Property::new(
                "cloud_storage_manifest_cache_ttl_ms",
                Duration::from_secs(30),
            ),
            cloud_storage_manifest_cache_shrink_wakeup_policy: Property::new(
                "cloud_storage_manifest_cache_shrink_wakeup_policy",
                ShrinkWakeupPolicy::AfterEviction,
            ),
            cloud_storage_spillover_manifest_max_segments: Property::new(
                "cloud_storage_spillover_manifest_max_segments",
                None,
            ),
            cloud_storage_spillover_manifest_size: Property::new(
                "cloud_storage_spillover_manifest_size",
                Some(64 * 1024),
            ),
            cloud_storage_enable_segment_merging: Property::new(
                "cloud_storage_enable_segment_merging",
                true,
            ),
            cloud_storage_segment_size_target: Property::new(
                "cloud_storage_segment_size_target",
                None,
            ),
            cloud_storage_segment_size_min: Property::new("cloud_storage_segment_size_min", None),
            cloud_storage_max_concurrent_uploads: Property::new(
                "cloud_storage_max_concurrent_uploads",
                4,
            ),
            cloud_storage_disable_upload_loop_for_tests: Property::new(
                "cloud_storage_disable_upload_loop_for_tests",
                false,
            ),
            storage_space_alert_free_threshold_bytes: Property::new(
                "storage_space_alert_free_threshold_bytes",
                0,
            ),
            storage_space_alert_free_threshold_percent: Property::new(
                "storage_space_alert_free_threshold_percent",
                5,
            ),
            storage_min_free_bytes: Property::new(
                "storage_min_free_bytes",
                100 * 1024 * 1024,
            ),
        }
    }

    /// A config suitable for unit tests: tiny budgets, fast TTLs.
    pub fn new_for_tests() -> Self {
        let cfg = Self::new();
        cfg.cloud_storage_manifest_cache_size.set(64 * 1024);
        cfg.cloud_storage_manifest_cache_ttl
            .set(Duration::from_millis(100));
        cfg
    }
}

impl Default for ShoalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retention tunables of one topic. Held per partition by the archiver.
#[derive(Debug)]
pub struct TopicRetentionConfig {
    /// Total cloud retention by size; unlimited when unset.
    pub retention_bytes: Property<Option<u64>>,
    /// Total cloud retention by age; unlimited when unset.
    pub retention_ms: Property<Option<Duration>>,
    /// Size of the log kept on local disk before eviction to the cloud tier.
    pub retention_local_target_bytes: Property<Option<u64>>,
    pub cleanup_policy: Property<CleanupPolicy>,
}

impl TopicRetentionConfig {
    pub fn new() -> Self {
        TopicRetentionConfig {
            retention_bytes: Property::new("retention.bytes", None),
            retention_ms: Property::new("retention.ms", None),
            retention_local_target_bytes: Property::new("retention.local.target.bytes", None),
            cleanup_policy: Property::new("cleanup.policy", CleanupPolicy::Delete),
        }
    }
}

impl Default for TopicRetentionConfig {
    fn default() -> Self {
        Self::new()
    }
}
