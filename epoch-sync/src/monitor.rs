// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sync height watchdog
//!
//! The monitor tracks the sync height reported by the engine and the time it last
//! grew. Every `max_stalled_duration` it checks whether the height is still moving,
//! or is at least within `max_allowed_lag` of the chain head. Results go through a
//! [`HealthCounter`] so a single slow interval does not flip the external health
//! state.

use crate::config::{HealthConfig, StallMonitorConfig};
use crate::metrics::SyncMetrics;
use crate::types::LatestHeight;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Consecutive failure counter with a threshold and periodic reminders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCounter {
    failures: u64,
}

impl HealthCounter {
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn is_healthy(&self, config: &HealthConfig) -> bool {
        self.failures < config.threshold
    }

    /// Record a success. Returns `(recovered, failures)` where `recovered` is true
    /// when the counter was unhealthy before this success.
    pub fn on_success(&mut self, config: &HealthConfig) -> (bool, u64) {
        if self.failures == 0 {
            return (false, 0);
        }

        let failures = std::mem::take(&mut self.failures);
        (failures >= config.threshold, failures)
    }

    /// Record a failure. Returns `(unhealthy, unrecovered, failures)`:
    /// `unhealthy` is set once when the threshold is reached, `unrecovered` every
    /// `remind` failures after that.
    pub fn on_failure(&mut self, config: &HealthConfig) -> (bool, bool, u64) {
        self.failures += 1;

        if self.failures < config.threshold {
            return (false, false, self.failures);
        }

        if self.failures == config.threshold {
            return (true, false, self.failures);
        }

        let remind = config.remind.max(1);
        let unrecovered = (self.failures - config.threshold) % remind == 0;
        (false, unrecovered, self.failures)
    }
}

#[derive(Debug)]
struct MonitorState {
    current_height: u64,
    last_advanced_at: Instant,
    health: HealthCounter,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            current_height: 0,
            last_advanced_at: Instant::now(),
            health: HealthCounter::default(),
        }
    }
}

struct MonitorInner {
    config: StallMonitorConfig,
    height_source: Arc<dyn LatestHeight>,
    state: Mutex<MonitorState>,
    metrics: Option<Arc<SyncMetrics>>,
}

/// Periodic check that the sync height keeps growing.
#[derive(Clone)]
pub struct StallMonitor {
    inner: Arc<MonitorInner>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl StallMonitor {
    pub fn new(config: StallMonitorConfig, height_source: Arc<dyn LatestHeight>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                height_source,
                state: Mutex::new(MonitorState::new()),
                metrics: None,
            }),
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_metrics(
        config: StallMonitorConfig,
        height_source: Arc<dyn LatestHeight>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        metrics.monitor_healthy.set(1);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                height_source,
                state: Mutex::new(MonitorState::new()),
                metrics: Some(metrics),
            }),
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the periodic check. A running check task is cancelled first and the
    /// tracked height is reset.
    pub async fn start(&self, parent: &CancellationToken) {
        let mut cancel = self.cancel.lock().await;
        if let Some(prev) = cancel.take() {
            prev.cancel();
        }

        let token = parent.child_token();
        *cancel = Some(token.clone());

        *self.inner.state.lock().await = MonitorState::new();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(token).await;
        });
    }

    /// Stop the periodic check. Calling it while stopped is a no-op.
    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
            info!("[StallMonitor] Stopped");
        }
    }

    pub async fn update(&self, new_height: u64) {
        let mut state = self.inner.state.lock().await;
        if new_height > state.current_height {
            state.last_advanced_at = Instant::now();
        }
        state.current_height = new_height;
    }

    /// Run a single check immediately.
    pub async fn check_once(&self) {
        self.inner.check_once().await;
    }

    pub async fn is_healthy(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.health.is_healthy(&self.inner.config.health)
    }

    pub async fn current_height(&self) -> u64 {
        self.inner.state.lock().await.current_height
    }
}

impl MonitorInner {
    async fn run(&self, cancel: CancellationToken) {
        let period = self.config.max_stalled_duration();
        info!(
            "[StallMonitor] Started (max_stalled={:?}, max_allowed_lag={})",
            period, self.config.max_allowed_lag
        );

        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[StallMonitor] Check task cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.check_once().await;
                }
            }
        }
    }

    async fn check_once(&self) {
        let latest_height = match self.height_source.latest_height().await {
            Ok(height) => height,
            Err(e) => {
                info!("[StallMonitor] Failed to fetch latest height: {:?}", e);
                let mut state = self.state.lock().await;
                self.on_failure(&mut state, None);
                return;
            }
        };

        let mut state = self.state.lock().await;

        if state.last_advanced_at.elapsed() < self.config.max_stalled_duration() {
            self.on_success(&mut state);
            return;
        }

        // Not growing; fine as long as it is caught up with the chain head.
        if state.current_height + self.config.max_allowed_lag < latest_height + 1 {
            self.on_failure(&mut state, Some(latest_height));
        } else {
            self.on_success(&mut state);
        }
    }

    fn on_success(&self, state: &mut MonitorState) {
        let (recovered, failures) = state.health.on_success(&self.config.health);
        if recovered {
            info!(
                "[StallMonitor] Sync height growing again after {} failures",
                failures
            );
        }
        self.report_health(state);
    }

    fn on_failure(&self, state: &mut MonitorState, latest_height: Option<u64>) {
        let (unhealthy, unrecovered, failures) = state.health.on_failure(&self.config.health);
        if unhealthy || unrecovered {
            error!(
                current_height = state.current_height,
                latest_height = ?latest_height,
                failures,
                "[StallMonitor] Sync height not growing"
            );
        }
        self.report_health(state);
    }

    fn report_health(&self, state: &MonitorState) {
        if let Some(ref m) = self.metrics {
            let healthy = state.health.is_healthy(&self.config.health);
            m.monitor_healthy.set(i64::from(healthy));
        }
    }
}
