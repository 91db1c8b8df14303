// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use prometheus::{IntCounter, Registry};

/// Prometheus metrics of the archival pipeline. One instance per process;
/// archivers share it by reference.
#[derive(Debug)]
pub struct ArchivalProbe {
    pub uploaded_segments: IntCounter,
    pub uploaded_bytes: IntCounter,
    pub merged_segments: IntCounter,
    pub spillover_manifests: IntCounter,
    pub retention_runs: IntCounter,
    pub gc_deleted_objects: IntCounter,
    pub failed_uploads: IntCounter,
}

impl ArchivalProbe {
    pub fn register(registry: &Registry) -> Self {
        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::new(name, help).expect("valid metric");
            registry
                .register(Box::new(c.clone()))
                .expect("metric registered once");
            c
        }
        ArchivalProbe {
            uploaded_segments: counter(
                registry,
                "shoal_archival_uploaded_segments_total",
                "Segments shipped to the cloud tier",
            ),
            uploaded_bytes: counter(
                registry,
                "shoal_archival_uploaded_bytes_total",
                "Bytes shipped to the cloud tier",
            ),
            merged_segments: counter(
                registry,
                "shoal_archival_merged_segments_total",
                "Manifest entries collapsed by adjacent-segment merging",
            ),
            spillover_manifests: counter(
                registry,
                "shoal_archival_spillover_manifests_total",
                "Manifest sections spilled to the archive",
            ),
            retention_runs: counter(
                registry,
                "shoal_archival_retention_runs_total",
                "Retention passes that moved the archive start",
            ),
            gc_deleted_objects: counter(
                registry,
                "shoal_archival_gc_deleted_objects_total",
                "Objects deleted by archive garbage collection",
            ),
            failed_uploads: counter(
                registry,
                "shoal_archival_failed_uploads_total",
                "Upload rounds that surfaced an error",
            ),
        }
    }

    /// A probe registered into a throwaway registry, for tests.
    pub fn new_unregistered() -> Self {
        Self::register(&Registry::new())
    }
}
