// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Epoch data model and the collaborator interfaces the sync engine consumes

use crate::error::StoreResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transaction status codes below this value mean the transaction was executed
/// in its containing block.
const TX_STATUS_SKIPPED: u64 = 2;

/// Inclusive block number range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, bn: u64) -> bool {
        self.from <= bn && bn <= self.to
    }
}

/// Event log emitted by a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: String,
    pub block_hash: String,
    pub logs: Vec<Log>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    /// Block the transaction was executed in, if any
    pub block_hash: Option<String>,
    /// 0 = success, 1 = failed, 2 = skipped, `None` = pending
    pub status: Option<u64>,
}

impl Transaction {
    /// Whether this transaction was executed in `block`.
    ///
    /// The same transaction hash may be packed in several blocks of one epoch, so
    /// both the status and the executing block hash are checked.
    pub fn is_executed_in(&self, block: &Block) -> bool {
        let executed = matches!(self.status, Some(status) if status < TX_STATUS_SKIPPED);
        executed && self.block_hash.as_deref() == Some(block.hash.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub number: u64,
    pub epoch: u64,
    pub transactions: Vec<Transaction>,
}

/// Derived per-log metadata attached to a log record
pub type LogExtra = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptExtra {
    pub log_exts: Vec<Option<LogExtra>>,
}

/// Chain content of one epoch: blocks in execution order, pivot block last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochData {
    pub epoch: u64,
    pub blocks: Vec<Block>,
    /// Receipts keyed by transaction hash
    pub receipts: HashMap<String, Receipt>,
    #[serde(default)]
    pub receipt_exts: Option<HashMap<String, ReceiptExtra>>,
}

impl EpochData {
    pub fn pivot_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Block number span covered by this epoch
    pub fn block_range(&self) -> Option<BlockRange> {
        let first = self.blocks.first()?;
        let pivot = self.pivot_block()?;
        Some(BlockRange::new(first.number, pivot.number))
    }

    pub fn receipt_extra(&self, tx_hash: &str) -> Option<&ReceiptExtra> {
        self.receipt_exts.as_ref()?.get(tx_hash)
    }
}

/// Source of epoch contents (the chain node RPC)
#[async_trait::async_trait]
pub trait EpochDataSource: Send + Sync {
    async fn query_epoch_data(&self, epoch: u64) -> anyhow::Result<EpochData>;
}

/// Store the sync engine writes epochs into (fast cache or durable database)
#[async_trait::async_trait]
pub trait EpochStore: Send + Sync {
    /// Range of epochs currently held; `StoreError::RecordNotFound` if empty
    async fn global_epoch_range(&self) -> StoreResult<(u64, u64)>;

    /// Append a contiguous batch of epochs as one unit of work
    async fn pushn(&self, data: &[EpochData]) -> StoreResult<()>;

    /// Remove every epoch `>= revert_to`
    async fn popn(&self, revert_to: u64) -> StoreResult<()>;

    /// Drop everything
    async fn flush(&self) -> StoreResult<()>;

    /// Hash of the pivot block stored for `epoch`, if the epoch is held
    async fn epoch_pivot_hash(&self, epoch: u64) -> StoreResult<Option<String>>;
}

/// Latest chain height, used by the stall monitor
#[async_trait::async_trait]
pub trait LatestHeight: Send + Sync {
    async fn latest_height(&self) -> anyhow::Result<u64>;
}
