// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Operator metrics. Everything is labeled by cluster name and registered
//! into the registry passed in at startup; nothing here is process-global.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

#[derive(Clone, Debug)]
pub struct Metrics {
    /// 1 while a credential rotation is in flight for the cluster.
    pub rotation_in_progress: IntGaugeVec,
    /// Partition decrements blocked by the rate limiter.
    pub partition_update_retries: IntCounterVec,
    /// Replicas reported by the cluster's StatefulSet.
    pub statefulset_replicas: IntGaugeVec,
    /// Replicas already running the updated revision.
    pub statefulset_updated_replicas: IntGaugeVec,
    /// Unix timestamp of the most recent partition decrement.
    pub last_partition_update: IntGaugeVec,
}

impl Metrics {
    pub fn register_into(registry: &Registry) -> Self {
        let metrics = Self {
            rotation_in_progress: IntGaugeVec::new(
                Opts::new(
                    "silo_credential_rotation_in_progress",
                    "Whether a system user credential rotation is in flight.",
                ),
                &["cluster"],
            )
            .unwrap(),
            partition_update_retries: IntCounterVec::new(
                Opts::new(
                    "silo_partition_update_retries_total",
                    "Partition decrements deferred because one happened too recently.",
                ),
                &["cluster"],
            )
            .unwrap(),
            statefulset_replicas: IntGaugeVec::new(
                Opts::new(
                    "silo_statefulset_replicas",
                    "Replicas reported by the cluster's StatefulSet.",
                ),
                &["cluster"],
            )
            .unwrap(),
            statefulset_updated_replicas: IntGaugeVec::new(
                Opts::new(
                    "silo_statefulset_updated_replicas",
                    "Replicas already running the StatefulSet's update revision.",
                ),
                &["cluster"],
            )
            .unwrap(),
            last_partition_update: IntGaugeVec::new(
                Opts::new(
                    "silo_partition_last_update_timestamp_seconds",
                    "Unix timestamp of the most recent partition decrement.",
                ),
                &["cluster"],
            )
            .unwrap(),
        };
        registry
            .register(Box::new(metrics.rotation_in_progress.clone()))
            .unwrap();
        registry
            .register(Box::new(metrics.partition_update_retries.clone()))
            .unwrap();
        registry
            .register(Box::new(metrics.statefulset_replicas.clone()))
            .unwrap();
        registry
            .register(Box::new(metrics.statefulset_updated_replicas.clone()))
            .unwrap();
        registry
            .register(Box::new(metrics.last_partition_update.clone()))
            .unwrap();
        metrics
    }

    /// Drops all series for a deleted cluster.
    pub fn forget_cluster(&self, cluster: &str) {
        let labels = &[cluster];
        let _ = self.rotation_in_progress.remove_label_values(labels);
        let _ = self.partition_update_retries.remove_label_values(labels);
        let _ = self.statefulset_replicas.remove_label_values(labels);
        let _ = self.statefulset_updated_replicas.remove_label_values(labels);
        let _ = self.last_partition_update.remove_label_values(labels);
    }
}
