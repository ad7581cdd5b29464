// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Epoch Sync Engine
//!
//! Drives epoch data from a chain data source into an epoch store.
//!
//! ## Event loop
//!
//! A single task multiplexes three triggers with `tokio::select!`:
//! - checkpoint requests (sent when the epoch subscription (re)starts),
//! - new epoch notifications from the subscription,
//! - a dual-speed ticker: `poll_interval_catch_up` while the window still holds
//!   epochs, `poll_interval_normal` once drained or after an error.
//!
//! Events are handled one at a time, so the [`EpochWindow`] is never shared.
//!
//! ## Consistency
//!
//! A batch is fetched in full before it is written, and the window only advances
//! after the store accepted the batch. A failed fetch or write leaves the window
//! untouched and the same batch is retried on the next tick.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::metrics::SyncMetrics;
use crate::monitor::StallMonitor;
use crate::types::{EpochData, EpochDataSource, EpochStore};
use crate::window::EpochWindow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cloneable producer side of the engine's event queues
#[derive(Clone, Debug)]
pub struct SyncEngineHandle {
    epoch_tx: mpsc::Sender<u64>,
    checkpoint_tx: mpsc::Sender<()>,
}

impl SyncEngineHandle {
    /// Deliver a newly observed chain epoch. Waits for queue capacity.
    pub async fn on_epoch_received(&self, epoch: u64) -> SyncResult<()> {
        debug!("[SyncEngine] New epoch received: {}", epoch);
        self.epoch_tx
            .send(epoch)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Request a checkpoint. Dropped when a checkpoint is already queued.
    pub fn on_subscription_start(&self) -> SyncResult<()> {
        match self.checkpoint_tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("[SyncEngine] Checkpoint already pending, request dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::ChannelClosed),
        }
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn EpochDataSource>,
    store: Arc<dyn EpochStore>,
    window: EpochWindow,

    epoch_tx: mpsc::Sender<u64>,
    epoch_rx: mpsc::Receiver<u64>,
    checkpoint_tx: mpsc::Sender<()>,
    checkpoint_rx: mpsc::Receiver<()>,

    monitor: Option<StallMonitor>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl SyncEngine {
    /// Create an engine resuming after the last epoch held by `store`.
    ///
    /// Fails with [`SyncError::Config`] on an invalid `config`, and with
    /// [`SyncError::Startup`] if the persisted range cannot be read for any reason
    /// other than the store being empty.
    pub async fn new(
        config: SyncConfig,
        source: Arc<dyn EpochDataSource>,
        store: Arc<dyn EpochStore>,
    ) -> SyncResult<Self> {
        config.validate().map_err(SyncError::Config)?;
        let mut window = EpochWindow::new(config.decayed_epoch_gap_threshold);

        match store.global_epoch_range().await {
            Ok((min_epoch, max_epoch)) => {
                info!(
                    "[SyncEngine] Resuming after stored epochs [{}, {}]",
                    min_epoch, max_epoch
                );
                window.reset(max_epoch + 1, max_epoch);
            }
            Err(e) if e.is_record_not_found() => {
                info!("[SyncEngine] Store is empty, starting from epoch 0");
            }
            Err(e) => {
                error!("[SyncEngine] Failed to load last synced epoch: {:?}", e);
                return Err(SyncError::Startup(e));
            }
        }

        let (epoch_tx, epoch_rx) = mpsc::channel(config.sub_buffer.max(1));
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(config.checkpoint_buffer.max(1));

        Ok(Self {
            config,
            source,
            store,
            window,
            epoch_tx,
            epoch_rx,
            checkpoint_tx,
            checkpoint_rx,
            monitor: None,
            metrics: None,
        })
    }

    /// Report every committed batch to `monitor`.
    pub fn with_monitor(mut self, monitor: StallMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        metrics.observe_window(self.window.from(), self.window.to());
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> SyncEngineHandle {
        SyncEngineHandle {
            epoch_tx: self.epoch_tx.clone(),
            checkpoint_tx: self.checkpoint_tx.clone(),
        }
    }

    pub fn window(&self) -> &EpochWindow {
        &self.window
    }

    /// Run the event loop until `cancel` fires. Cancellation is only observed
    /// between events, so a batch write is never interrupted.
    pub async fn run(mut self, cancel: CancellationToken) -> SyncResult<()> {
        info!(
            "[SyncEngine] Starting epoch sync (window={}, max_batch={})",
            self.window, self.config.max_epochs_per_batch
        );

        self.do_checkpoint().await;

        let ticker = time::sleep(self.config.poll_interval_catch_up());
        tokio::pin!(ticker);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("[SyncEngine] Shutdown (window={})", self.window);
                    break;
                }
                Some(()) = self.checkpoint_rx.recv() => {
                    self.do_checkpoint().await;
                }
                Some(epoch) = self.epoch_rx.recv() => {
                    self.handle_new_epoch(epoch).await;
                }
                _ = &mut ticker => {
                    let next = self.do_tick().await;
                    ticker.as_mut().reset(Instant::now() + next);
                }
            }
        }

        Ok(())
    }

    /// Apply a new chain epoch to the window, reverting or flushing the store
    /// first when needed.
    async fn handle_new_epoch(&mut self, new_epoch: u64) {
        debug!(
            "[SyncEngine] Handling new epoch {} (window={})",
            new_epoch, self.window
        );

        if self.window.peek_will_pivot_switch(new_epoch) {
            info!(
                "[SyncEngine] Pivot switch detected at epoch {} (window={})",
                new_epoch, self.window
            );
            match self.store.popn(new_epoch).await {
                Ok(()) => {
                    self.window.pivot_switch_to(new_epoch);
                    if let Some(ref m) = self.metrics {
                        m.pivot_switches.inc();
                    }
                }
                Err(e) => {
                    let err = SyncError::store("revert epoch data", e);
                    error!(
                        "[SyncEngine] Failed to revert epochs from {}: {}",
                        new_epoch, err
                    );
                    self.inc_error("revert");
                }
            }
        } else if self.window.peek_will_overflow(new_epoch) {
            warn!(
                "[SyncEngine] Sync window decayed at epoch {} (window={}), flushing store",
                new_epoch, self.window
            );
            match self.store.flush().await {
                Ok(()) => {
                    self.window.reset(new_epoch, new_epoch);
                    if let Some(ref m) = self.metrics {
                        m.overflow_flushes.inc();
                    }
                }
                Err(e) => {
                    let err = SyncError::store("flush decayed epoch data", e);
                    error!("[SyncEngine] {}", err);
                    self.inc_error("flush");
                }
            }
        } else {
            self.window.expand_to(new_epoch);
        }

        self.observe_window();
    }

    /// One ticker round; returns the delay until the next round.
    async fn do_tick(&mut self) -> Duration {
        match self.sync_once().await {
            Ok(true) => self.config.poll_interval_normal(),
            Ok(false) => self.config.poll_interval_catch_up(),
            Err(e) => {
                warn!("[SyncEngine] Failed to sync epoch data: {}", e);
                self.config.poll_interval_normal()
            }
        }
    }

    /// Sync one batch. Returns true when the window is drained.
    async fn sync_once(&mut self) -> SyncResult<bool> {
        if self.window.is_empty() {
            debug!("[SyncEngine] Window empty, nothing to sync");
            return Ok(true);
        }

        let started = Instant::now();
        let (sync_from, sync_size) = self.window.peek_shrink_from(self.config.max_epochs_per_batch);
        if sync_size == 0 {
            return Ok(false);
        }
        debug!(sync_from, sync_size, "[SyncEngine] Syncing epochs");

        let mut batch: Vec<EpochData> = Vec::with_capacity(sync_size as usize);
        for epoch in sync_from..sync_from + u64::from(sync_size) {
            match self.source.query_epoch_data(epoch).await {
                Ok(data) => batch.push(data),
                Err(source) => {
                    self.inc_error("fetch");
                    return Err(SyncError::Fetch { epoch, source });
                }
            }
        }

        if let Err(e) = self.store.pushn(&batch).await {
            self.inc_error("write");
            return Err(SyncError::store("write epoch data", e));
        }

        self.window.shrink_from(self.config.max_epochs_per_batch);
        let last_synced = sync_from + u64::from(sync_size) - 1;

        if let Some(ref monitor) = self.monitor {
            monitor.update(last_synced).await;
        }
        if let Some(ref m) = self.metrics {
            m.synced_epochs.inc_by(u64::from(sync_size));
            m.last_synced_epoch.set(last_synced as i64);
            m.last_batch_size.set(i64::from(sync_size));
            m.batch_latency.observe(started.elapsed().as_secs_f64());
        }
        self.observe_window();

        debug!(
            "[SyncEngine] Synced epochs [{}, {}] (window={})",
            sync_from, last_synced, self.window
        );
        Ok(self.window.is_empty())
    }

    /// Validate the stored suffix against the chain and revert what diverged.
    async fn do_checkpoint(&mut self) {
        debug!("[SyncEngine] Doing checkpoint");
        match self.find_diverged_epoch().await {
            Ok(Some(epoch)) => {
                warn!(
                    "[SyncEngine] Checkpoint found stored epochs diverged from epoch {}",
                    epoch
                );
                if let Some(ref m) = self.metrics {
                    m.checkpoint_mismatches.inc();
                }
                self.handle_new_epoch(epoch).await;
            }
            Ok(None) => debug!("[SyncEngine] Checkpoint ok"),
            Err(e) => {
                error!("[SyncEngine] Failed to do checkpoint: {}", e);
                self.inc_error("checkpoint");
            }
        }
    }

    /// Walk back from the newest stored epoch and return the earliest one whose
    /// pivot block no longer matches the chain.
    async fn find_diverged_epoch(&self) -> SyncResult<Option<u64>> {
        let (min_epoch, max_epoch) = match self.store.global_epoch_range().await {
            Ok(range) => range,
            Err(e) if e.is_record_not_found() => return Ok(None),
            Err(e) => return Err(SyncError::store("load stored epoch range", e)),
        };

        let mut diverged = None;
        for epoch in (min_epoch..=max_epoch).rev() {
            let stored = self
                .store
                .epoch_pivot_hash(epoch)
                .await
                .map_err(|e| SyncError::store("load stored pivot hash", e))?;
            let chain = self
                .source
                .query_epoch_data(epoch)
                .await
                .map_err(|source| SyncError::Fetch { epoch, source })?;

            let matched = match (stored, chain.pivot_block()) {
                (Some(stored), Some(pivot)) => stored == pivot.hash,
                _ => false,
            };
            if matched {
                break;
            }
            diverged = Some(epoch);
        }

        Ok(diverged)
    }

    fn observe_window(&self) {
        if let Some(ref m) = self.metrics {
            m.observe_window(self.window.from(), self.window.to());
        }
    }

    fn inc_error(&self, stage: &str) {
        if let Some(ref m) = self.metrics {
            m.inc_error(stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StallMonitorConfig;
    use crate::test_utils::{epoch_data, MockDataSource, MockHeightSource, RecordingStore, StoreOp};

    fn config(threshold: u64) -> SyncConfig {
        SyncConfig {
            decayed_epoch_gap_threshold: threshold,
            ..Default::default()
        }
    }

    async fn engine_with(
        config: SyncConfig,
    ) -> (SyncEngine, Arc<MockDataSource>, Arc<RecordingStore>) {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        let engine = SyncEngine::new(config, source.clone(), store.clone())
            .await
            .unwrap();
        (engine, source, store)
    }

    async fn seed(store: &RecordingStore, epochs: std::ops::RangeInclusive<u64>) {
        let batch: Vec<_> = epochs.map(epoch_data).collect();
        store.pushn(&batch).await.unwrap();
        store.clear_ops();
    }

    #[tokio::test]
    async fn test_startup_with_empty_store() {
        let (engine, _, _) = engine_with(config(100)).await;
        assert_eq!((engine.window().from(), engine.window().to()), (0, 0));
    }

    #[tokio::test]
    async fn test_startup_resumes_after_stored_range() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        seed(&store, 5..=7).await;

        let engine = SyncEngine::new(config(100), source, store).await.unwrap();
        assert!(engine.window().is_empty());
        assert_eq!((engine.window().from(), engine.window().to()), (8, 7));
    }

    #[tokio::test]
    async fn test_startup_rejects_invalid_config() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        let config = SyncConfig {
            max_epochs_per_batch: 0,
            ..Default::default()
        };

        let err = SyncEngine::new(config, source, store).await.err().unwrap();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_sync_once_with_zero_batch_writes_nothing() {
        let (mut engine, source, store) = engine_with(config(100)).await;
        engine.handle_new_epoch(5).await;
        engine.config.max_epochs_per_batch = 0;

        assert!(!engine.sync_once().await.unwrap());
        assert_eq!((engine.window().from(), engine.window().to()), (0, 5));
        assert!(store.ops().is_empty());
        assert!(source.queried().is_empty());
    }

    #[tokio::test]
    async fn test_startup_fails_on_corrupted_range() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        store.set_corrupt_range(true);

        let err = SyncEngine::new(config(100), source, store)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Startup(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_overflow_flushes_and_resets() {
        let (mut engine, _, store) = engine_with(config(5)).await;
        engine.window.reset(100, 100);

        engine.handle_new_epoch(106).await;
        assert_eq!((engine.window().from(), engine.window().to()), (106, 106));
        assert_eq!(store.ops(), vec![StoreOp::Flush]);
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_window() {
        let (mut engine, _, store) = engine_with(config(5)).await;
        engine.window.reset(100, 100);
        store.set_fail_flush(true);

        engine.handle_new_epoch(106).await;
        assert_eq!((engine.window().from(), engine.window().to()), (100, 100));
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_pivot_switch_inside_unsynced_range_keeps_from() {
        let (mut engine, _, store) = engine_with(config(100)).await;
        engine.window.reset(50, 80);

        engine.handle_new_epoch(60).await;
        assert_eq!((engine.window().from(), engine.window().to()), (50, 60));
        assert_eq!(store.ops(), vec![StoreOp::Popn(60)]);
    }

    #[tokio::test]
    async fn test_pivot_switch_past_stored_tail_syncs_through() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        seed(&store, 0..=7).await;
        let mut engine = SyncEngine::new(config(100), source.clone(), store.clone())
            .await
            .unwrap();

        engine.handle_new_epoch(20).await;
        engine.handle_new_epoch(12).await;
        assert_eq!((engine.window().from(), engine.window().to()), (8, 12));

        assert!(engine.sync_once().await.unwrap());
        assert_eq!(
            store.ops(),
            vec![StoreOp::Popn(12), StoreOp::Pushn((8..=12).collect())]
        );
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 12));
        assert_eq!(source.queried(), (8..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pivot_switch_below_synced_epoch_reverts_and_resyncs() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        seed(&store, 0..=7).await;
        let mut engine = SyncEngine::new(config(100), source.clone(), store.clone())
            .await
            .unwrap();

        engine.handle_new_epoch(20).await;
        assert!(!engine.sync_once().await.unwrap());
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 17));

        engine.handle_new_epoch(15).await;
        assert_eq!((engine.window().from(), engine.window().to()), (15, 15));
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 14));

        store.clear_ops();
        assert!(engine.sync_once().await.unwrap());
        assert_eq!(store.ops(), vec![StoreOp::Pushn(vec![15])]);
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 15));
    }

    #[tokio::test]
    async fn test_revert_failure_keeps_window() {
        let (mut engine, _, store) = engine_with(config(100)).await;
        engine.window.reset(50, 80);
        store.set_fail_popn(true);

        engine.handle_new_epoch(60).await;
        assert_eq!((engine.window().from(), engine.window().to()), (50, 80));
    }

    #[tokio::test]
    async fn test_new_epoch_expands_window() {
        let (mut engine, _, store) = engine_with(config(100)).await;
        engine.handle_new_epoch(1).await;
        engine.handle_new_epoch(42).await;
        assert_eq!((engine.window().from(), engine.window().to()), (0, 42));
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_sync_once_writes_one_batch() {
        let (mut engine, source, store) = engine_with(config(100)).await;
        engine.handle_new_epoch(25).await;

        let drained = engine.sync_once().await.unwrap();
        assert!(!drained);
        assert_eq!(store.ops(), vec![StoreOp::Pushn((0..10).collect())]);
        assert_eq!(source.queried(), (0..10).collect::<Vec<_>>());
        assert_eq!(engine.window().from(), 10);

        engine.sync_once().await.unwrap();
        let drained = engine.sync_once().await.unwrap();
        assert!(drained);
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 25));
        assert!(engine.sync_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_failure_retries_whole_batch() {
        let (mut engine, source, store) = engine_with(config(100)).await;
        engine.handle_new_epoch(5).await;
        source.fail_epoch(3);

        let err = engine.sync_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch { epoch: 3, .. }));
        assert!(err.is_recoverable());
        assert_eq!(engine.window().from(), 0);
        assert!(store.ops().is_empty());

        source.heal_epoch(3);
        assert!(engine.sync_once().await.unwrap());
        assert_eq!(store.ops(), vec![StoreOp::Pushn((0..=5).collect())]);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_window() {
        let (mut engine, _, store) = engine_with(config(100)).await;
        engine.handle_new_epoch(5).await;
        store.set_fail_pushn(true);

        let err = engine.sync_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Store { .. }));
        assert_eq!((engine.window().from(), engine.window().to()), (0, 5));

        store.set_fail_pushn(false);
        assert!(engine.sync_once().await.unwrap());
        assert_eq!(engine.window().from(), 6);
    }

    #[tokio::test]
    async fn test_tick_interval_follows_progress() {
        let (mut engine, _, store) = engine_with(config(100)).await;
        engine.handle_new_epoch(15).await;

        assert_eq!(engine.do_tick().await, engine.config.poll_interval_catch_up());
        assert_eq!(engine.do_tick().await, engine.config.poll_interval_normal());

        engine.handle_new_epoch(20).await;
        store.set_fail_pushn(true);
        assert_eq!(engine.do_tick().await, engine.config.poll_interval_normal());
    }

    #[tokio::test]
    async fn test_checkpoint_reverts_diverged_suffix() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        seed(&store, 0..=9).await;
        let mut engine = SyncEngine::new(config(100), source.clone(), store.clone())
            .await
            .unwrap();

        source.fork_from(7, "fork");
        assert_eq!(engine.find_diverged_epoch().await.unwrap(), Some(7));

        engine.do_checkpoint().await;
        assert_eq!(store.ops(), vec![StoreOp::Popn(7)]);
        assert_eq!((engine.window().from(), engine.window().to()), (7, 7));
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 6));

        assert!(engine.sync_once().await.unwrap());
        assert_eq!(
            store.epoch_pivot_hash(7).await.unwrap().as_deref(),
            Some("0xfork-7")
        );
    }

    #[tokio::test]
    async fn test_checkpoint_on_matching_store_is_noop() {
        let source = Arc::new(MockDataSource::new());
        let store = Arc::new(RecordingStore::new());
        seed(&store, 0..=4).await;
        let mut engine = SyncEngine::new(config(100), source.clone(), store.clone())
            .await
            .unwrap();

        engine.do_checkpoint().await;
        assert!(store.ops().is_empty());
        // only the newest epoch had to be compared
        assert_eq!(source.queried(), vec![4]);
        assert_eq!((engine.window().from(), engine.window().to()), (5, 4));
    }

    #[tokio::test]
    async fn test_checkpoint_requests_are_coalesced() {
        let (engine, _, _) = engine_with(SyncConfig {
            checkpoint_buffer: 1,
            ..Default::default()
        })
        .await;
        let handle = engine.handle();
        for _ in 0..5 {
            handle.on_subscription_start().unwrap();
        }
    }

    #[tokio::test]
    async fn test_monitor_tracks_synced_height() {
        let (engine, _, _) = engine_with(config(100)).await;
        let monitor = StallMonitor::new(
            StallMonitorConfig::default(),
            Arc::new(MockHeightSource::new(100)),
        );
        let mut engine = engine
            .with_monitor(monitor.clone())
            .with_metrics(Arc::new(SyncMetrics::new_for_testing()));

        engine.handle_new_epoch(3).await;
        engine.sync_once().await.unwrap();
        assert_eq!(monitor.current_height().await, 3);
        let metrics = engine.metrics.as_ref().unwrap();
        assert_eq!(metrics.last_synced_epoch.get(), 3);
        assert_eq!(metrics.synced_epochs.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_syncs_notified_epochs() {
        let (engine, _, store) = engine_with(config(100)).await;
        let handle = engine.handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        handle.on_subscription_start().unwrap();
        for epoch in 1..=12 {
            handle.on_epoch_received(epoch).await.unwrap();
        }
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 12));

        // reorg back to 10 while running
        handle.on_epoch_received(10).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        assert!(store.ops().contains(&StoreOp::Popn(10)));
        assert_eq!(store.inner().global_epoch_range().await.unwrap(), (0, 10));

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(handle.on_epoch_received(13).await.is_err());
    }
}
