// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry,
};

const BATCH_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 30., 60.,
];

#[derive(Clone, Debug)]
pub struct SyncMetrics {
    /// `from` / `to` bounds of the sync window
    pub(crate) window_bound: IntGaugeVec,
    pub(crate) last_synced_epoch: IntGauge,
    pub(crate) last_batch_size: IntGauge,
    pub(crate) synced_epochs: IntCounter,
    pub(crate) pivot_switches: IntCounter,
    pub(crate) overflow_flushes: IntCounter,
    pub(crate) checkpoint_mismatches: IntCounter,
    /// Failures by stage (`fetch`, `write`, `revert`, `flush`, `checkpoint`)
    pub(crate) sync_errors: IntCounterVec,
    pub(crate) batch_latency: Histogram,
    pub(crate) monitor_healthy: IntGauge,
}

impl SyncMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            window_bound: register_int_gauge_vec_with_registry!(
                "epoch_sync_window_bound",
                "Current bounds of the epoch sync window",
                &["bound"],
                registry,
            )
            .unwrap(),
            last_synced_epoch: register_int_gauge_with_registry!(
                "epoch_sync_last_synced_epoch",
                "Highest epoch written to the store",
                registry,
            )
            .unwrap(),
            last_batch_size: register_int_gauge_with_registry!(
                "epoch_sync_last_batch_size",
                "Number of epochs in the last committed batch",
                registry,
            )
            .unwrap(),
            synced_epochs: register_int_counter_with_registry!(
                "epoch_sync_synced_epochs",
                "Total number of epochs written to the store",
                registry,
            )
            .unwrap(),
            pivot_switches: register_int_counter_with_registry!(
                "epoch_sync_pivot_switches",
                "Total number of reverted pivot switches",
                registry,
            )
            .unwrap(),
            overflow_flushes: register_int_counter_with_registry!(
                "epoch_sync_overflow_flushes",
                "Total number of store flushes caused by a decayed window",
                registry,
            )
            .unwrap(),
            checkpoint_mismatches: register_int_counter_with_registry!(
                "epoch_sync_checkpoint_mismatches",
                "Total number of checkpoints that found diverged epochs",
                registry,
            )
            .unwrap(),
            sync_errors: register_int_counter_vec_with_registry!(
                "epoch_sync_errors",
                "Total number of sync errors by stage",
                &["stage"],
                registry,
            )
            .unwrap(),
            batch_latency: register_histogram_with_registry!(
                "epoch_sync_batch_latency",
                "Latency of fetching and writing one epoch batch",
                BATCH_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            monitor_healthy: register_int_gauge_with_registry!(
                "epoch_sync_monitor_healthy",
                "Whether the stall monitor reports healthy sync progress",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }

    pub(crate) fn observe_window(&self, from: u64, to: u64) {
        self.window_bound
            .with_label_values(&["from"])
            .set(from as i64);
        self.window_bound.with_label_values(&["to"]).set(to as i64);
    }

    pub(crate) fn inc_error(&self, stage: &str) {
        self.sync_errors.with_label_values(&[stage]).inc();
    }
}
