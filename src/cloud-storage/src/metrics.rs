// Copyright Shoal Data, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use prometheus::{IntCounter, IntGauge, Registry};

/// Prometheus metrics of the cloud-tier plumbing. One instance per process,
/// shared by reference.
#[derive(Debug)]
pub struct CloudStorageMetrics {
    pub uploads: IntCounter,
    pub downloads: IntCounter,
    pub deletions: IntCounter,
    pub retries: IntCounter,
    pub manifest_uploads: IntCounter,
    pub manifest_downloads: IntCounter,
    pub spillover_manifest_uploads: IntCounter,
    pub manifest_cache_hits: IntCounter,
    pub manifest_cache_misses: IntCounter,
    pub manifest_cache_size_bytes: IntGauge,
}

impl CloudStorageMetrics {
    pub fn register(registry: &Registry) -> Self {
        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::new(name, help).expect("valid metric");
            registry
                .register(Box::new(c.clone()))
                .expect("metric registered once");
            c
        }
        let gauge = IntGauge::new(
            "shoal_cloud_manifest_cache_size_bytes",
            "Bytes of materialized spillover manifests currently cached",
        )
        .expect("valid metric");
        registry
            .register(Box::new(gauge.clone()))
            .expect("metric registered once");
        CloudStorageMetrics {
            uploads: counter(
                registry,
                "shoal_cloud_segment_uploads_total",
                "Segments uploaded to the object store",
            ),
            downloads: counter(
                registry,
                "shoal_cloud_segment_downloads_total",
                "Segments downloaded from the object store",
            ),
            deletions: counter(
                registry,
                "shoal_cloud_object_deletions_total",
                "Objects deleted from the object store",
            ),
            retries: counter(
                registry,
                "shoal_cloud_request_retries_total",
                "Object-store requests retried after transient failures",
            ),
            manifest_uploads: counter(
                registry,
                "shoal_cloud_manifest_uploads_total",
                "Partition manifest uploads",
            ),
            manifest_downloads: counter(
                registry,
                "shoal_cloud_manifest_downloads_total",
                "Partition manifest downloads",
            ),
            spillover_manifest_uploads: counter(
                registry,
                "shoal_cloud_spillover_manifest_uploads_total",
                "Spillover manifest shard uploads",
            ),
            manifest_cache_hits: counter(
                registry,
                "shoal_cloud_manifest_cache_hits_total",
                "Materialized manifest cache hits",
            ),
            manifest_cache_misses: counter(
                registry,
                "shoal_cloud_manifest_cache_misses_total",
                "Materialized manifest cache misses (hydrations)",
            ),
            manifest_cache_size_bytes: gauge,
        }
    }

    /// Metrics registered into a throwaway registry, for tests.
    pub fn new_unregistered() -> Self {
        Self::register(&Registry::new())
    }
}
