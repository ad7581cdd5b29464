// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Event log storage for synced epochs
//!
//! Logs are spread over block-number partitions (`logs_0`, `logs_1`, ...) and
//! every synced epoch keeps its block range and pivot hash, so a pivot switch can
//! be reverted down to the exact block where the reverted epoch started.

pub mod log_store;
pub mod memory;
pub mod partition;
pub mod pg;
pub mod store;

pub use log_store::{
    BlockMapResolver, Contract, ContractResolver, CountDrift, LogRecord, LogRecordExtra,
    LogRowStorage, LogStorage, PartitionedLogStore, LOGS_ENTITY, MAX_TOPICS,
};
pub use memory::{MemoryLogEpochStore, MemoryUnitOfWork};
pub use partition::{BnPartitionedStore, Partition, PartitionStorage};
pub use pg::{PgEpochStore, PgUnitOfWork};
pub use store::{EpochBlockMap, EpochLogStorage, EpochLogStore, EpochMapStorage};
