// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block-number partitioned storage
//!
//! An entity's append-only rows are spread over shards `"{entity}_{index}"`, each
//! bounded to a fixed row volume. Partitions are allocated in increasing index
//! order and only the latest one accepts new rows. The recorded block-number range
//! of a partition routes range lookups and reverts; membership is always
//! re-checked against the rows themselves when deleting.
//!
//! All operations take the storage handle of the current unit of work, so that
//! partition metadata changes commit together with the row changes they describe.

use epoch_sync::{BlockRange, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One shard of a partitioned entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub index: u32,
    /// Block numbers materialized in this shard; `None` until rows land
    pub bn_range: Option<BlockRange>,
    pub count: u64,
}

impl Partition {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            bn_range: None,
            count: 0,
        }
    }
}

/// Partition metadata and shard persistence of one unit of work
#[async_trait::async_trait]
pub trait PartitionStorage: Send {
    /// All partitions of `entity` in ascending index order
    async fn load_partitions(&mut self, entity: &str) -> StoreResult<Vec<Partition>>;

    async fn load_partition(&mut self, entity: &str, index: u32) -> StoreResult<Option<Partition>>;

    async fn latest_partition(&mut self, entity: &str) -> StoreResult<Option<Partition>> {
        Ok(self.load_partitions(entity).await?.pop())
    }

    /// Insert or overwrite the metadata of `partition`
    async fn save_partition(&mut self, entity: &str, partition: &Partition) -> StoreResult<()>;

    /// Create the physical shard; a no-op if it exists
    async fn create_shard(&mut self, shard: &str) -> StoreResult<()>;
}

/// Partition lifecycle and range routing, shared by every partitioned entity
#[derive(Debug, Default, Clone, Copy)]
pub struct BnPartitionedStore;

impl BnPartitionedStore {
    pub fn new() -> Self {
        Self
    }

    pub fn shard_name(entity: &str, index: u32) -> String {
        format!("{}_{}", entity, index)
    }

    pub async fn latest_partition<S>(&self, st: &mut S, entity: &str) -> StoreResult<Option<Partition>>
    where
        S: PartitionStorage + ?Sized,
    {
        st.latest_partition(entity).await
    }

    /// Allocate the partition following the latest one and create its shard.
    pub async fn grow_partition<S>(&self, st: &mut S, entity: &str) -> StoreResult<Partition>
    where
        S: PartitionStorage + ?Sized,
    {
        let index = match st.latest_partition(entity).await? {
            Some(latest) => latest.index.checked_add(1).ok_or_else(|| {
                StoreError::Corrupted(format!("partition index of '{}' overflows", entity))
            })?,
            None => 0,
        };

        st.create_shard(&Self::shard_name(entity, index)).await?;

        let partition = Partition::new(index);
        st.save_partition(entity, &partition).await?;

        debug!(entity, index, "[Partition] Grew new partition");
        Ok(partition)
    }

    /// Widen the recorded block range of a partition to cover `[bn_min, bn_max]`.
    pub async fn expand_bn_range<S>(
        &self,
        st: &mut S,
        entity: &str,
        index: u32,
        bn_min: u64,
        bn_max: u64,
    ) -> StoreResult<()>
    where
        S: PartitionStorage + ?Sized,
    {
        if bn_min > bn_max {
            return Err(StoreError::Corrupted(format!(
                "invalid block range [{}, {}]",
                bn_min, bn_max
            )));
        }

        let mut partition = Self::must_load(st, entity, index).await?;
        partition.bn_range = Some(match partition.bn_range {
            Some(range) => BlockRange::new(range.from.min(bn_min), range.to.max(bn_max)),
            None => BlockRange::new(bn_min, bn_max),
        });

        st.save_partition(entity, &partition).await
    }

    /// Cut the recorded ranges back to below `target_bn`.
    ///
    /// Returns, in ascending index order, every partition whose range reached
    /// `target_bn`. The caller deletes rows `bn >= target_bn` from each of them,
    /// highest index first.
    pub async fn shrink_bn_range<S>(
        &self,
        st: &mut S,
        entity: &str,
        target_bn: u64,
    ) -> StoreResult<Vec<Partition>>
    where
        S: PartitionStorage + ?Sized,
    {
        let mut shrunk = Vec::new();

        for mut partition in st.load_partitions(entity).await? {
            let Some(range) = partition.bn_range else {
                continue;
            };
            if range.to < target_bn {
                continue;
            }

            partition.bn_range = if range.from >= target_bn {
                None
            } else {
                Some(BlockRange::new(range.from, target_bn - 1))
            };
            st.save_partition(entity, &partition).await?;
            shrunk.push(partition);
        }

        debug!(
            entity,
            target_bn,
            partitions = shrunk.len(),
            "[Partition] Shrunk partition ranges"
        );
        Ok(shrunk)
    }

    /// Adjust the row count of a partition by `delta`. The count never goes negative.
    pub async fn delta_update_count<S>(
        &self,
        st: &mut S,
        entity: &str,
        index: u32,
        delta: i64,
    ) -> StoreResult<()>
    where
        S: PartitionStorage + ?Sized,
    {
        if delta == 0 {
            return Ok(());
        }

        let mut partition = Self::must_load(st, entity, index).await?;
        let updated = if delta >= 0 {
            partition.count.checked_add(delta.unsigned_abs())
        } else {
            partition.count.checked_sub(delta.unsigned_abs())
        };
        partition.count = updated.ok_or_else(|| StoreError::CountUnderflow {
            entity: entity.to_string(),
            index,
            count: partition.count,
            delta,
        })?;

        st.save_partition(entity, &partition).await
    }

    async fn must_load<S>(st: &mut S, entity: &str, index: u32) -> StoreResult<Partition>
    where
        S: PartitionStorage + ?Sized,
    {
        st.load_partition(entity, index)
            .await?
            .ok_or_else(|| StoreError::PartitionNotFound {
                entity: entity.to_string(),
                index,
            })
    }
}
