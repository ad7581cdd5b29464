// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Event logs partitioned by block number
//!
//! Each ingest batch is written to a single partition: the latest one, or a fresh
//! one when the latest is full. Reverts delete every row at or above the block
//! number that starts the reverted epoch, in all partitions that reach it.

use crate::partition::{BnPartitionedStore, Partition, PartitionStorage};
use epoch_sync::{
    BlockRange, EpochData, LogExtra, PartitionConfig, StoreError, StoreResult,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Entity name of partitioned event logs
pub const LOGS_ENTITY: &str = "logs";

/// Number of topics stored per log
pub const MAX_TOPICS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub id: u64,
    pub address: String,
}

/// One event log row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub contract_id: u64,
    pub block_number: u64,
    pub epoch: u64,
    pub topics: [Option<String>; MAX_TOPICS],
    /// Position of the log within its receipt
    pub log_index: u64,
    pub extra: Option<Vec<u8>>,
}

/// Payload of [`LogRecord::extra`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecordExtra {
    pub data: Vec<u8>,
    pub tx_hash: String,
    pub block_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<LogExtra>,
}

#[async_trait::async_trait]
pub trait LogRowStorage: Send {
    /// Insert rows into `shard`; returns the number inserted
    async fn insert_logs(&mut self, shard: &str, logs: &[LogRecord]) -> StoreResult<u64>;

    /// Delete rows of `shard` with block number `>= bn`; returns the number deleted
    async fn delete_logs_from(&mut self, shard: &str, bn: u64) -> StoreResult<u64>;

    async fn count_logs(&mut self, shard: &str) -> StoreResult<u64>;
}

#[async_trait::async_trait]
pub trait ContractResolver: Send {
    /// Resolve the contract at `address`, registering it first if unknown.
    /// Returns the contract and whether it was created.
    async fn add_contract_if_absent(&mut self, address: &str) -> StoreResult<(Contract, bool)>;
}

#[async_trait::async_trait]
pub trait BlockMapResolver: Send {
    /// Block numbers of `epoch`, if it was synced
    async fn block_range(&mut self, epoch: u64) -> StoreResult<Option<BlockRange>>;
}

/// Everything the log store needs from one unit of work
pub trait LogStorage: PartitionStorage + LogRowStorage + ContractResolver + BlockMapResolver {}

impl<T> LogStorage for T where
    T: PartitionStorage + LogRowStorage + ContractResolver + BlockMapResolver + ?Sized
{
}

/// Partition whose recorded count differs from its physical row count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountDrift {
    pub index: u32,
    pub recorded: u64,
    pub actual: u64,
}

#[derive(Debug, Clone)]
pub struct PartitionedLogStore {
    partitions: BnPartitionedStore,
    volume_size: u64,
}

impl PartitionedLogStore {
    pub fn new(config: &PartitionConfig) -> Self {
        Self {
            partitions: BnPartitionedStore::new(),
            volume_size: config.log_volume_size.max(1),
        }
    }

    pub fn volume_size(&self) -> u64 {
        self.volume_size
    }

    /// Partition the next batch is written to, grown first if none exists or
    /// the latest one is full.
    pub async fn prepare_partition<S>(&self, st: &mut S) -> StoreResult<Partition>
    where
        S: LogStorage + ?Sized,
    {
        match self.partitions.latest_partition(st, LOGS_ENTITY).await? {
            Some(latest) if latest.count < self.volume_size => Ok(latest),
            latest => {
                let grown = self.partitions.grow_partition(st, LOGS_ENTITY).await?;
                info!(
                    entity = LOGS_ENTITY,
                    index = grown.index,
                    previous = ?latest.map(|p| p.index),
                    "[LogStore] Created new log partition"
                );
                Ok(grown)
            }
        }
    }

    /// Write the logs of every executed transaction in `data` to `partition`.
    /// Returns the number of rows inserted.
    pub async fn pushn<S>(
        &self,
        st: &mut S,
        data: &[EpochData],
        partition: &Partition,
    ) -> StoreResult<u64>
    where
        S: LogStorage + ?Sized,
    {
        let logs = self.collect_logs(st, data).await?;
        if logs.is_empty() {
            return Ok(0);
        }

        let shard = BnPartitionedStore::shard_name(LOGS_ENTITY, partition.index);
        let inserted = st.insert_logs(&shard, &logs).await?;

        let (Some(first), Some(last)) = (data.first(), data.last()) else {
            return Ok(inserted);
        };
        let bn_min = first.block_range().map(|r| r.from);
        let bn_max = last.block_range().map(|r| r.to);
        if let (Some(bn_min), Some(bn_max)) = (bn_min, bn_max) {
            self.partitions
                .expand_bn_range(st, LOGS_ENTITY, partition.index, bn_min, bn_max)
                .await?;
        }

        let delta = i64::try_from(inserted)
            .map_err(|_| StoreError::Corrupted(format!("too many logs: {}", inserted)))?;
        self.partitions
            .delta_update_count(st, LOGS_ENTITY, partition.index, delta)
            .await?;

        debug!(
            entity = LOGS_ENTITY,
            index = partition.index,
            inserted,
            "[LogStore] Inserted logs"
        );
        Ok(inserted)
    }

    /// Delete every log of epochs `>= epoch_until`. Returns the number of rows removed.
    pub async fn popn<S>(&self, st: &mut S, epoch_until: u64) -> StoreResult<u64>
    where
        S: LogStorage + ?Sized,
    {
        let range = st
            .block_range(epoch_until)
            .await?
            .ok_or(StoreError::NoBlockMapping(epoch_until))?;

        let partitions = self
            .partitions
            .shrink_bn_range(st, LOGS_ENTITY, range.from)
            .await?;

        let mut removed = 0;
        for partition in partitions.iter().rev() {
            let shard = BnPartitionedStore::shard_name(LOGS_ENTITY, partition.index);
            let deleted = st.delete_logs_from(&shard, range.from).await?;

            let delta = i64::try_from(deleted)
                .map_err(|_| StoreError::Corrupted(format!("too many logs: {}", deleted)))?;
            self.partitions
                .delta_update_count(st, LOGS_ENTITY, partition.index, -delta)
                .await?;
            removed += deleted;
        }

        debug!(
            entity = LOGS_ENTITY,
            epoch_until,
            bn = range.from,
            removed,
            "[LogStore] Popped logs"
        );
        Ok(removed)
    }

    /// Compare recorded partition counts with the rows actually stored.
    pub async fn reconcile<S>(&self, st: &mut S) -> StoreResult<Vec<CountDrift>>
    where
        S: LogStorage + ?Sized,
    {
        let mut drifts = Vec::new();
        for partition in st.load_partitions(LOGS_ENTITY).await? {
            let shard = BnPartitionedStore::shard_name(LOGS_ENTITY, partition.index);
            let actual = st.count_logs(&shard).await?;
            if actual != partition.count {
                warn!(
                    entity = LOGS_ENTITY,
                    index = partition.index,
                    recorded = partition.count,
                    actual,
                    "[LogStore] Partition count drift"
                );
                drifts.push(CountDrift {
                    index: partition.index,
                    recorded: partition.count,
                    actual,
                });
            }
        }
        Ok(drifts)
    }

    async fn collect_logs<S>(&self, st: &mut S, data: &[EpochData]) -> StoreResult<Vec<LogRecord>>
    where
        S: LogStorage + ?Sized,
    {
        let mut contracts: HashMap<String, u64> = HashMap::new();
        let mut logs = Vec::new();

        for epoch_data in data {
            for block in &epoch_data.blocks {
                for tx in &block.transactions {
                    // A tx hash may appear in several blocks of an epoch; only the
                    // block that executed it owns the receipt.
                    let Some(receipt) = epoch_data.receipts.get(&tx.hash) else {
                        continue;
                    };
                    if !tx.is_executed_in(block) {
                        continue;
                    }

                    let receipt_ext = epoch_data.receipt_extra(&tx.hash);

                    for (k, log) in receipt.logs.iter().enumerate() {
                        let contract_id = match contracts.get(&log.address) {
                            Some(id) => *id,
                            None => {
                                let (contract, created) =
                                    st.add_contract_if_absent(&log.address).await?;
                                if created {
                                    debug!("[LogStore] Registered contract {}", contract.address);
                                }
                                contracts.insert(log.address.clone(), contract.id);
                                contract.id
                            }
                        };

                        let ext = receipt_ext.and_then(|ext| ext.log_exts.get(k).cloned().flatten());
                        let extra = LogRecordExtra {
                            data: log.data.clone(),
                            tx_hash: tx.hash.clone(),
                            block_hash: block.hash.clone(),
                            ext,
                        };
                        let extra = serde_json::to_vec(&extra).map_err(anyhow::Error::from)?;

                        let mut topics: [Option<String>; MAX_TOPICS] = Default::default();
                        for (slot, topic) in topics.iter_mut().zip(log.topics.iter()) {
                            *slot = Some(topic.clone());
                        }

                        logs.push(LogRecord {
                            contract_id,
                            block_number: block.number,
                            epoch: epoch_data.epoch,
                            topics,
                            log_index: k as u64,
                            extra: Some(extra),
                        });
                    }
                }
            }
        }

        Ok(logs)
    }
}
