// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory epoch cache
//!
//! Keeps recently synced epochs in a `BTreeMap` keyed by epoch number. With a
//! capacity set, the oldest epochs are evicted once the cache grows past it.

use crate::error::{StoreError, StoreResult};
use crate::types::{EpochData, EpochStore};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryEpochStore {
    epochs: RwLock<BTreeMap<u64, EpochData>>,
    capacity: Option<usize>,
}

impl MemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: RwLock::new(BTreeMap::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub async fn get(&self, epoch: u64) -> Option<EpochData> {
        self.epochs.read().await.get(&epoch).cloned()
    }

    pub async fn len(&self) -> usize {
        self.epochs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.epochs.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl EpochStore for MemoryEpochStore {
    async fn global_epoch_range(&self) -> StoreResult<(u64, u64)> {
        let epochs = self.epochs.read().await;
        match (epochs.keys().next(), epochs.keys().next_back()) {
            (Some(min), Some(max)) => Ok((*min, *max)),
            _ => Err(StoreError::RecordNotFound),
        }
    }

    async fn pushn(&self, data: &[EpochData]) -> StoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut epochs = self.epochs.write().await;

        // Batch must continue right after the cached tail and be contiguous.
        let mut expected = epochs.keys().next_back().map(|max| max + 1);
        for item in data {
            if let Some(next) = expected {
                if item.epoch != next {
                    return Err(StoreError::Corrupted(format!(
                        "discontinuous epoch {}, expected {}",
                        item.epoch, next
                    )));
                }
            }
            expected = Some(item.epoch + 1);
        }

        for item in data {
            epochs.insert(item.epoch, item.clone());
        }

        if let Some(capacity) = self.capacity {
            while epochs.len() > capacity {
                if let Some((evicted, _)) = epochs.pop_first() {
                    debug!("[MemoryStore] Evicted epoch {}", evicted);
                }
            }
        }

        Ok(())
    }

    async fn popn(&self, revert_to: u64) -> StoreResult<()> {
        let mut epochs = self.epochs.write().await;
        let removed = epochs.split_off(&revert_to);
        if !removed.is_empty() {
            debug!(
                "[MemoryStore] Popped {} epochs from {}",
                removed.len(),
                revert_to
            );
        }
        Ok(())
    }

    async fn flush(&self) -> StoreResult<()> {
        self.epochs.write().await.clear();
        Ok(())
    }

    async fn epoch_pivot_hash(&self, epoch: u64) -> StoreResult<Option<String>> {
        let epochs = self.epochs.read().await;
        Ok(epochs
            .get(&epoch)
            .and_then(|data| data.pivot_block())
            .map(|block| block.hash.clone()))
    }
}
