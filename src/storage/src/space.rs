// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use shoal_config::ShoalConfig;

/// A point-in-time reading of the data volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpaceSample {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Severity of the current free-space situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskSpaceAlert {
    Ok,
    /// Below the alert thresholds; retention should tighten.
    LowSpace,
    /// Below the hard floor; writes should be refused.
    Degraded,
}

/// Classifies disk-space samples against the configured thresholds.
///
/// Thresholds are read live, so lowering `storage_min_free_bytes` on a
/// choking node takes effect on the next sample.
#[derive(Debug)]
pub struct DiskSpaceMonitor {
    alert_bytes: shoal_config::Binding<u64>,
    alert_percent: shoal_config::Binding<u8>,
    min_free_bytes: shoal_config::Binding<u64>,
}

impl DiskSpaceMonitor {
    pub fn new(cfg: &ShoalConfig) -> Self {
        DiskSpaceMonitor {
            alert_bytes: cfg.storage_space_alert_free_threshold_bytes.bind(),
            alert_percent: cfg.storage_space_alert_free_threshold_percent.bind(),
            min_free_bytes: cfg.storage_min_free_bytes.bind(),
        }
    }

    pub fn classify(&self, sample: DiskSpaceSample) -> DiskSpaceAlert {
        if sample.free_bytes <= self.min_free_bytes.get() {
            return DiskSpaceAlert::Degraded;
        }
        let alert_bytes = self.alert_bytes.get();
        if alert_bytes > 0 && sample.free_bytes <= alert_bytes {
            return DiskSpaceAlert::LowSpace;
        }
        let percent = u64::from(self.alert_percent.get());
        if percent > 0 && sample.free_bytes * 100 <= sample.total_bytes * percent {
            return DiskSpaceAlert::LowSpace;
        }
        DiskSpaceAlert::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, free: u64) -> DiskSpaceSample {
        DiskSpaceSample {
            total_bytes: total,
            free_bytes: free,
        }
    }

    #[test]
    fn classification_bands() {
        let cfg = ShoalConfig::new();
        cfg.storage_min_free_bytes.set(10);
        cfg.storage_space_alert_free_threshold_bytes.set(100);
        cfg.storage_space_alert_free_threshold_percent.set(5);
        let monitor = DiskSpaceMonitor::new(&cfg);

        assert_eq!(monitor.classify(sample(10_000, 5_000)), DiskSpaceAlert::Ok);
        assert_eq!(
            monitor.classify(sample(10_000, 90)),
            DiskSpaceAlert::LowSpace
        );
        // 4% free trips the percentage threshold even above the byte one.
        assert_eq!(
            monitor.classify(sample(100_000, 4_000)),
            DiskSpaceAlert::LowSpace
        );
        assert_eq!(monitor.classify(sample(10_000, 9)), DiskSpaceAlert::Degraded);
    }

    #[test]
    fn thresholds_update_live() {
        let cfg = ShoalConfig::new();
        cfg.storage_space_alert_free_threshold_percent.set(0);
        cfg.storage_space_alert_free_threshold_bytes.set(0);
        cfg.storage_min_free_bytes.set(0);
        let monitor = DiskSpaceMonitor::new(&cfg);
        assert_eq!(monitor.classify(sample(1_000, 1)), DiskSpaceAlert::Ok);

        cfg.storage_min_free_bytes.set(50);
        assert_eq!(monitor.classify(sample(1_000, 1)), DiskSpaceAlert::Degraded);
    }
}
