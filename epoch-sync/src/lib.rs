// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reorg-tolerant epoch synchronization
//!
//! [`SyncEngine`] pulls epoch data from an [`EpochDataSource`] into an
//! [`EpochStore`], using an [`EpochWindow`] to track what is left to sync and to
//! react to pivot switches and decayed backlogs. [`StallMonitor`] watches the
//! resulting sync height.

pub mod config;
pub mod error;
pub mod memory_store;
pub mod metrics;
pub mod monitor;
pub mod syncer;
pub mod types;
pub mod window;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{EpochSyncConfig, HealthConfig, PartitionConfig, StallMonitorConfig, SyncConfig};
pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use memory_store::MemoryEpochStore;
pub use metrics::SyncMetrics;
pub use monitor::{HealthCounter, StallMonitor};
pub use syncer::{SyncEngine, SyncEngineHandle};
pub use types::{
    Block, BlockRange, EpochData, EpochDataSource, EpochStore, LatestHeight, Log, LogExtra,
    Receipt, ReceiptExtra, Transaction,
};
pub use window::EpochWindow;
