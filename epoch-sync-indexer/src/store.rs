// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Epoch store over partitioned logs and the epoch to block map
//!
//! [`EpochLogStore`] implements the epoch store operations against any storage
//! handle that provides the log and block map traits. Callers run every operation
//! inside one unit of work (a database transaction for Postgres).

use crate::log_store::{BlockMapResolver, LogStorage, PartitionedLogStore, LOGS_ENTITY};
use crate::partition::{BnPartitionedStore, Partition};
use epoch_sync::{BlockRange, EpochData, PartitionConfig, StoreError, StoreResult};
use tracing::{debug, info};

/// Block numbers and pivot hash of one synced epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochBlockMap {
    pub epoch: u64,
    pub bn_range: BlockRange,
    pub pivot_hash: String,
}

impl EpochBlockMap {
    pub fn from_epoch_data(data: &EpochData) -> StoreResult<Self> {
        let (Some(bn_range), Some(pivot)) = (data.block_range(), data.pivot_block()) else {
            return Err(StoreError::Corrupted(format!(
                "epoch {} has no blocks",
                data.epoch
            )));
        };
        Ok(Self {
            epoch: data.epoch,
            bn_range,
            pivot_hash: pivot.hash.clone(),
        })
    }
}

#[async_trait::async_trait]
pub trait EpochMapStorage: BlockMapResolver {
    async fn save_epoch_maps(&mut self, maps: &[EpochBlockMap]) -> StoreResult<()>;

    /// Delete mappings of epochs `>= epoch`; returns the number deleted
    async fn delete_epoch_maps_from(&mut self, epoch: u64) -> StoreResult<u64>;

    /// Lowest and highest mapped epoch
    async fn epoch_map_range(&mut self) -> StoreResult<Option<(u64, u64)>>;

    async fn epoch_pivot_hash(&mut self, epoch: u64) -> StoreResult<Option<String>>;

    async fn clear_epoch_maps(&mut self) -> StoreResult<()>;
}

pub trait EpochLogStorage: LogStorage + EpochMapStorage {}

impl<T> EpochLogStorage for T where T: LogStorage + EpochMapStorage + ?Sized {}

#[derive(Debug, Clone)]
pub struct EpochLogStore {
    logs: PartitionedLogStore,
}

impl EpochLogStore {
    pub fn new(config: &PartitionConfig) -> Self {
        Self {
            logs: PartitionedLogStore::new(config),
        }
    }

    pub fn logs(&self) -> &PartitionedLogStore {
        &self.logs
    }

    pub async fn global_epoch_range<S>(&self, st: &mut S) -> StoreResult<(u64, u64)>
    where
        S: EpochLogStorage + ?Sized,
    {
        st.epoch_map_range().await?.ok_or(StoreError::RecordNotFound)
    }

    /// Append a contiguous batch of epochs following the newest stored epoch.
    pub async fn pushn<S>(&self, st: &mut S, data: &[EpochData]) -> StoreResult<()>
    where
        S: EpochLogStorage + ?Sized,
    {
        let Some(first) = data.first() else {
            return Ok(());
        };

        if let Some((_, max_epoch)) = st.epoch_map_range().await? {
            if first.epoch != max_epoch + 1 {
                return Err(StoreError::Corrupted(format!(
                    "discontinuous epoch {}, expected {}",
                    first.epoch,
                    max_epoch + 1
                )));
            }
        }

        let maps = data
            .iter()
            .map(EpochBlockMap::from_epoch_data)
            .collect::<StoreResult<Vec<_>>>()?;
        for pair in maps.windows(2) {
            if pair[1].epoch != pair[0].epoch + 1 {
                return Err(StoreError::Corrupted(format!(
                    "discontinuous epoch {}, expected {}",
                    pair[1].epoch,
                    pair[0].epoch + 1
                )));
            }
        }

        let partition = self.logs.prepare_partition(st).await?;
        let inserted = self.logs.pushn(st, data, &partition).await?;
        st.save_epoch_maps(&maps).await?;

        debug!(
            from_epoch = first.epoch,
            epochs = data.len(),
            logs = inserted,
            partition = partition.index,
            "[EpochLogStore] Pushed epochs"
        );
        Ok(())
    }

    /// Remove every epoch `>= revert_to`. Reverting past the newest epoch is a no-op.
    pub async fn popn<S>(&self, st: &mut S, revert_to: u64) -> StoreResult<()>
    where
        S: EpochLogStorage + ?Sized,
    {
        let Some((min_epoch, max_epoch)) = st.epoch_map_range().await? else {
            return Ok(());
        };
        if revert_to > max_epoch {
            return Ok(());
        }

        let revert_to = revert_to.max(min_epoch);
        let removed = self.logs.popn(st, revert_to).await?;
        let unmapped = st.delete_epoch_maps_from(revert_to).await?;

        info!(
            revert_to,
            epochs = unmapped,
            logs = removed,
            "[EpochLogStore] Reverted epochs"
        );
        Ok(())
    }

    /// Drop all logs and epoch mappings. Partitions are kept, emptied.
    pub async fn flush<S>(&self, st: &mut S) -> StoreResult<()>
    where
        S: EpochLogStorage + ?Sized,
    {
        for partition in st.load_partitions(LOGS_ENTITY).await? {
            let shard = BnPartitionedStore::shard_name(LOGS_ENTITY, partition.index);
            st.delete_logs_from(&shard, 0).await?;
            st.save_partition(LOGS_ENTITY, &Partition::new(partition.index))
                .await?;
        }
        st.clear_epoch_maps().await?;

        info!("[EpochLogStore] Flushed all epochs");
        Ok(())
    }

    pub async fn epoch_pivot_hash<S>(&self, st: &mut S, epoch: u64) -> StoreResult<Option<String>>
    where
        S: EpochLogStorage + ?Sized,
    {
        st.epoch_pivot_hash(epoch).await
    }
}
