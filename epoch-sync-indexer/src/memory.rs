// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory storage backend
//!
//! [`MemoryUnitOfWork`] implements every storage trait over plain collections.
//! [`MemoryLogEpochStore`] runs each epoch store operation against a copy of the
//! state and commits the copy only when the operation succeeds, which gives the
//! same all-or-nothing behaviour as a database transaction.

use crate::log_store::{BlockMapResolver, Contract, ContractResolver, LogRecord, LogRowStorage};
use crate::partition::{Partition, PartitionStorage};
use crate::store::{EpochBlockMap, EpochLogStore, EpochMapStorage};
use epoch_sync::{BlockRange, EpochData, EpochStore, PartitionConfig, StoreResult};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Debug, Default, Clone)]
pub struct MemoryUnitOfWork {
    partitions: BTreeMap<String, BTreeMap<u32, Partition>>,
    shards: HashMap<String, Vec<LogRecord>>,
    contracts: HashMap<String, Contract>,
    epoch_maps: BTreeMap<u64, EpochBlockMap>,
}

impl MemoryUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_shard(&self, shard: &str) -> bool {
        self.shards.contains_key(shard)
    }

    pub fn shard_rows(&self, shard: &str) -> Vec<LogRecord> {
        self.shards.get(shard).cloned().unwrap_or_default()
    }

    pub fn contract_count(&self) -> usize {
        self.contracts.len()
    }

    /// Record the block map of `data` directly.
    #[cfg(test)]
    pub(crate) fn map_epoch(&mut self, data: &EpochData) {
        let map = EpochBlockMap::from_epoch_data(data).unwrap();
        self.epoch_maps.insert(map.epoch, map);
    }

    fn shard_mut(&mut self, shard: &str) -> StoreResult<&mut Vec<LogRecord>> {
        self.shards
            .get_mut(shard)
            .ok_or_else(|| anyhow::anyhow!("relation \"{}\" does not exist", shard).into())
    }
}

#[async_trait::async_trait]
impl PartitionStorage for MemoryUnitOfWork {
    async fn load_partitions(&mut self, entity: &str) -> StoreResult<Vec<Partition>> {
        Ok(self
            .partitions
            .get(entity)
            .map(|parts| parts.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_partition(&mut self, entity: &str, index: u32) -> StoreResult<Option<Partition>> {
        Ok(self
            .partitions
            .get(entity)
            .and_then(|parts| parts.get(&index))
            .cloned())
    }

    async fn save_partition(&mut self, entity: &str, partition: &Partition) -> StoreResult<()> {
        self.partitions
            .entry(entity.to_string())
            .or_default()
            .insert(partition.index, partition.clone());
        Ok(())
    }

    async fn create_shard(&mut self, shard: &str) -> StoreResult<()> {
        self.shards.entry(shard.to_string()).or_default();
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogRowStorage for MemoryUnitOfWork {
    async fn insert_logs(&mut self, shard: &str, logs: &[LogRecord]) -> StoreResult<u64> {
        self.shard_mut(shard)?.extend_from_slice(logs);
        Ok(logs.len() as u64)
    }

    async fn delete_logs_from(&mut self, shard: &str, bn: u64) -> StoreResult<u64> {
        let rows = self.shard_mut(shard)?;
        let before = rows.len();
        rows.retain(|row| row.block_number < bn);
        Ok((before - rows.len()) as u64)
    }

    async fn count_logs(&mut self, shard: &str) -> StoreResult<u64> {
        Ok(self.shard_mut(shard)?.len() as u64)
    }
}

#[async_trait::async_trait]
impl ContractResolver for MemoryUnitOfWork {
    async fn add_contract_if_absent(&mut self, address: &str) -> StoreResult<(Contract, bool)> {
        if let Some(contract) = self.contracts.get(address) {
            return Ok((contract.clone(), false));
        }

        let contract = Contract {
            id: self.contracts.len() as u64 + 1,
            address: address.to_string(),
        };
        self.contracts.insert(address.to_string(), contract.clone());
        Ok((contract, true))
    }
}

#[async_trait::async_trait]
impl BlockMapResolver for MemoryUnitOfWork {
    async fn block_range(&mut self, epoch: u64) -> StoreResult<Option<BlockRange>> {
        Ok(self.epoch_maps.get(&epoch).map(|map| map.bn_range))
    }
}

#[async_trait::async_trait]
impl EpochMapStorage for MemoryUnitOfWork {
    async fn save_epoch_maps(&mut self, maps: &[EpochBlockMap]) -> StoreResult<()> {
        for map in maps {
            self.epoch_maps.insert(map.epoch, map.clone());
        }
        Ok(())
    }

    async fn delete_epoch_maps_from(&mut self, epoch: u64) -> StoreResult<u64> {
        Ok(self.epoch_maps.split_off(&epoch).len() as u64)
    }

    async fn epoch_map_range(&mut self) -> StoreResult<Option<(u64, u64)>> {
        match (
            self.epoch_maps.keys().next(),
            self.epoch_maps.keys().next_back(),
        ) {
            (Some(min), Some(max)) => Ok(Some((*min, *max))),
            _ => Ok(None),
        }
    }

    async fn epoch_pivot_hash(&mut self, epoch: u64) -> StoreResult<Option<String>> {
        Ok(self.epoch_maps.get(&epoch).map(|map| map.pivot_hash.clone()))
    }

    async fn clear_epoch_maps(&mut self) -> StoreResult<()> {
        self.epoch_maps.clear();
        Ok(())
    }
}

/// [`EpochStore`] over partitioned logs kept in memory
///
/// Every mutation runs against a copy of the whole state, which replaces the
/// committed state only on success. The copy grows with the stored rows, so this
/// store fits tests and small caches; use [`crate::PgEpochStore`] for real volumes.
#[derive(Debug)]
pub struct MemoryLogEpochStore {
    state: Mutex<MemoryUnitOfWork>,
    store: EpochLogStore,
}

impl MemoryLogEpochStore {
    pub fn new(config: &PartitionConfig) -> Self {
        Self {
            state: Mutex::new(MemoryUnitOfWork::new()),
            store: EpochLogStore::new(config),
        }
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> MemoryUnitOfWork {
        self.state.lock().await.clone()
    }

    pub fn store(&self) -> &EpochLogStore {
        &self.store
    }
}

#[async_trait::async_trait]
impl EpochStore for MemoryLogEpochStore {
    async fn global_epoch_range(&self) -> StoreResult<(u64, u64)> {
        let mut state = self.state.lock().await;
        self.store.global_epoch_range(&mut *state).await
    }

    async fn pushn(&self, data: &[EpochData]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut uow = state.clone();
        self.store.pushn(&mut uow, data).await?;
        *state = uow;
        Ok(())
    }

    async fn popn(&self, revert_to: u64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut uow = state.clone();
        self.store.popn(&mut uow, revert_to).await?;
        *state = uow;
        Ok(())
    }

    async fn flush(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut uow = state.clone();
        self.store.flush(&mut uow).await?;
        *state = uow;
        Ok(())
    }

    async fn epoch_pivot_hash(&self, epoch: u64) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        self.store.epoch_pivot_hash(&mut *state, epoch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::LOGS_ENTITY;
    use epoch_sync::test_utils::{EpochDataBuilder, MockDataSource};
    use epoch_sync::{StoreError, SyncConfig, SyncEngine};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn epoch_with_logs(epoch: u64, branch: &str) -> EpochData {
        EpochDataBuilder::new(epoch)
            .block(epoch * 10, &format!("0x{}-{}a", branch, epoch))
            .executed_tx(&format!("0xtx{}a", epoch), &["0xa"])
            .block(epoch * 10 + 1, &format!("0x{}-{}", branch, epoch))
            .executed_tx(&format!("0xtx{}b", epoch), &["0xb", "0xc"])
            .build()
    }

    fn store(volume_size: u64) -> MemoryLogEpochStore {
        MemoryLogEpochStore::new(&PartitionConfig {
            log_volume_size: volume_size,
        })
    }

    fn total_rows(state: &MemoryUnitOfWork) -> usize {
        (0..16)
            .map(|i| state.shard_rows(&format!("logs_{}", i)).len())
            .sum()
    }

    #[tokio::test]
    async fn test_push_pop_flush() {
        let store = store(4);
        assert!(store.global_epoch_range().await.unwrap_err().is_record_not_found());

        let batch: Vec<_> = (1..=3).map(|e| epoch_with_logs(e, "main")).collect();
        store.pushn(&batch).await.unwrap();
        store.pushn(&[epoch_with_logs(4, "main")]).await.unwrap();
        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 4));
        assert_eq!(
            store.epoch_pivot_hash(2).await.unwrap().as_deref(),
            Some("0xmain-2")
        );

        let state = store.snapshot().await;
        assert_eq!(total_rows(&state), 12);
        assert_eq!(state.shard_rows("logs_0").len(), 9);
        assert_eq!(state.shard_rows("logs_1").len(), 3);

        store.popn(3).await.unwrap();
        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 2));
        let state = store.snapshot().await;
        assert_eq!(total_rows(&state), 6);
        assert!(state
            .shard_rows("logs_0")
            .iter()
            .all(|row| row.block_number < 30));
        assert!(store.store().logs().reconcile(&mut state.clone()).await.unwrap().is_empty());

        // past the tail: nothing to revert
        store.popn(10).await.unwrap();
        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 2));

        store.flush().await.unwrap();
        assert!(store.global_epoch_range().await.unwrap_err().is_record_not_found());
        let mut state = store.snapshot().await;
        assert_eq!(total_rows(&state), 0);
        let partitions = state.load_partitions(LOGS_ENTITY).await.unwrap();
        assert!(partitions.iter().all(|p| p.count == 0 && p.bn_range.is_none()));
    }

    #[tokio::test]
    async fn test_rejected_push_leaves_store_unchanged() {
        let store = store(100);
        store.pushn(&[epoch_with_logs(1, "main")]).await.unwrap();
        let before = store.snapshot().await;

        // second epoch of the batch has no blocks
        let broken = EpochDataBuilder::new(3).build();
        let err = store
            .pushn(&[epoch_with_logs(2, "main"), broken])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));

        let err = store.pushn(&[epoch_with_logs(5, "main")]).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));

        let after = store.snapshot().await;
        assert_eq!(after.shard_rows("logs_0"), before.shard_rows("logs_0"));
        assert_eq!(store.global_epoch_range().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_popn_before_oldest_reverts_everything() {
        let store = store(100);
        let batch: Vec<_> = (5..=7).map(|e| epoch_with_logs(e, "main")).collect();
        store.pushn(&batch).await.unwrap();

        store.popn(2).await.unwrap();
        assert!(store.global_epoch_range().await.unwrap_err().is_record_not_found());
        assert_eq!(total_rows(&store.snapshot().await), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_engine_over_log_store() {
        let source = Arc::new(MockDataSource::new());
        for epoch in 0..=20 {
            source.set_epoch(epoch_with_logs(epoch, "main"));
        }
        let store = Arc::new(store(10));
        let engine = SyncEngine::new(SyncConfig::default(), source.clone(), store.clone())
            .await
            .unwrap();
        let handle = engine.handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        handle.on_epoch_received(20).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.global_epoch_range().await.unwrap(), (0, 20));
        assert_eq!(total_rows(&store.snapshot().await), 21 * 3);

        // chain reorganizes from epoch 15 on
        for epoch in 15..=20 {
            source.set_epoch(epoch_with_logs(epoch, "fork"));
        }
        handle.on_subscription_start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.global_epoch_range().await.unwrap(), (0, 15));
        assert_eq!(
            store.epoch_pivot_hash(15).await.unwrap().as_deref(),
            Some("0xfork-15")
        );

        let mut state = store.snapshot().await;
        assert!(store.store().logs().reconcile(&mut state).await.unwrap().is_empty());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_engine_pivot_past_stored_tail() {
        let source = Arc::new(MockDataSource::new());
        for epoch in 0..=20 {
            source.set_epoch(epoch_with_logs(epoch, "main"));
        }
        let store = Arc::new(store(10));
        let seeded: Vec<_> = (0..=7).map(|e| epoch_with_logs(e, "main")).collect();
        store.pushn(&seeded).await.unwrap();

        let engine = SyncEngine::new(SyncConfig::default(), source.clone(), store.clone())
            .await
            .unwrap();
        let handle = engine.handle();
        // window opens to 20, then the pivot moves back to 12 before anything syncs
        handle.on_epoch_received(20).await.unwrap();
        handle.on_epoch_received(12).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(store.global_epoch_range().await.unwrap(), (0, 12));
        assert_eq!(
            store.epoch_pivot_hash(12).await.unwrap().as_deref(),
            Some("0xmain-12")
        );
        assert!(store.epoch_pivot_hash(13).await.unwrap().is_none());

        let mut state = store.snapshot().await;
        assert_eq!(total_rows(&state), 13 * 3);
        assert!(store.store().logs().reconcile(&mut state).await.unwrap().is_empty());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
