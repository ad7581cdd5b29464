// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mocks and builders shared by the sync tests of this and downstream crates

use crate::error::{StoreError, StoreResult};
use crate::memory_store::MemoryEpochStore;
use crate::types::{
    Block, EpochData, EpochDataSource, EpochStore, LatestHeight, Log, Receipt, ReceiptExtra,
    Transaction,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Pivot hash of `epoch` on the chain branch named `branch`
pub fn pivot_hash(epoch: u64, branch: &str) -> String {
    format!("0x{}-{}", branch, epoch)
}

/// Single-block epoch on the `main` branch, block number equal to the epoch
pub fn epoch_data(epoch: u64) -> EpochData {
    EpochDataBuilder::new(epoch)
        .block(epoch, &pivot_hash(epoch, "main"))
        .build()
}

pub struct EpochDataBuilder {
    epoch: u64,
    blocks: Vec<Block>,
    receipts: HashMap<String, Receipt>,
    receipt_exts: Option<HashMap<String, ReceiptExtra>>,
}

impl EpochDataBuilder {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            blocks: Vec::new(),
            receipts: HashMap::new(),
            receipt_exts: None,
        }
    }

    /// Append an empty block; the last appended block is the pivot.
    pub fn block(mut self, number: u64, hash: &str) -> Self {
        self.blocks.push(Block {
            hash: hash.to_string(),
            number,
            epoch: self.epoch,
            transactions: Vec::new(),
        });
        self
    }

    /// Add a transaction executed in the last block, emitting one log per address.
    pub fn executed_tx(self, tx_hash: &str, log_addresses: &[&str]) -> Self {
        self.tx(tx_hash, Some(0), true, log_addresses)
    }

    /// Add a transaction packed in the last block but skipped by execution.
    pub fn skipped_tx(self, tx_hash: &str, log_addresses: &[&str]) -> Self {
        self.tx(tx_hash, Some(2), true, log_addresses)
    }

    /// Add a transaction packed in the last block but executed in another block.
    pub fn foreign_tx(self, tx_hash: &str, log_addresses: &[&str]) -> Self {
        self.tx(tx_hash, Some(0), false, log_addresses)
    }

    pub fn receipt_extra(mut self, tx_hash: &str, extra: ReceiptExtra) -> Self {
        self.receipt_exts
            .get_or_insert_with(HashMap::new)
            .insert(tx_hash.to_string(), extra);
        self
    }

    fn tx(mut self, tx_hash: &str, status: Option<u64>, here: bool, addresses: &[&str]) -> Self {
        let Some(block) = self.blocks.last_mut() else {
            panic!("add a block before adding transactions");
        };

        let executed_in = if here {
            block.hash.clone()
        } else {
            format!("{}-other", block.hash)
        };
        block.transactions.push(Transaction {
            hash: tx_hash.to_string(),
            block_hash: Some(executed_in.clone()),
            status,
        });

        let logs = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| Log {
                address: address.to_string(),
                topics: vec![format!("0xtopic{}", i)],
                data: vec![i as u8],
            })
            .collect();
        self.receipts.insert(
            tx_hash.to_string(),
            Receipt {
                transaction_hash: tx_hash.to_string(),
                block_hash: executed_in,
                logs,
            },
        );
        self
    }

    pub fn build(self) -> EpochData {
        EpochData {
            epoch: self.epoch,
            blocks: self.blocks,
            receipts: self.receipts,
            receipt_exts: self.receipt_exts,
        }
    }
}

/// Scriptable chain view. Epochs are generated on demand; epochs at or beyond a
/// fork point carry the fork branch's pivot hash.
#[derive(Default)]
pub struct MockDataSource {
    overrides: Mutex<HashMap<u64, EpochData>>,
    failing: Mutex<HashSet<u64>>,
    fork: Mutex<Option<(u64, String)>>,
    queried: Mutex<Vec<u64>>,
}

impl MockDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_epoch(&self, data: EpochData) {
        self.overrides.lock().unwrap().insert(data.epoch, data);
    }

    pub fn fail_epoch(&self, epoch: u64) {
        self.failing.lock().unwrap().insert(epoch);
    }

    pub fn heal_epoch(&self, epoch: u64) {
        self.failing.lock().unwrap().remove(&epoch);
    }

    /// Replace the chain from `epoch` onward with `branch`.
    pub fn fork_from(&self, epoch: u64, branch: &str) {
        *self.fork.lock().unwrap() = Some((epoch, branch.to_string()));
    }

    pub fn queried(&self) -> Vec<u64> {
        self.queried.lock().unwrap().clone()
    }

    pub fn clear_queried(&self) {
        self.queried.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl EpochDataSource for MockDataSource {
    async fn query_epoch_data(&self, epoch: u64) -> anyhow::Result<EpochData> {
        self.queried.lock().unwrap().push(epoch);

        if self.failing.lock().unwrap().contains(&epoch) {
            anyhow::bail!("rpc unavailable for epoch {}", epoch);
        }
        if let Some(data) = self.overrides.lock().unwrap().get(&epoch) {
            return Ok(data.clone());
        }

        let fork = self.fork.lock().unwrap().clone();
        match fork {
            Some((from, branch)) if epoch >= from => Ok(EpochDataBuilder::new(epoch)
                .block(epoch, &pivot_hash(epoch, &branch))
                .build()),
            _ => Ok(epoch_data(epoch)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Pushn(Vec<u64>),
    Popn(u64),
    Flush,
}

/// Memory store that records every mutation and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryEpochStore,
    ops: Mutex<Vec<StoreOp>>,
    fail_pushn: AtomicBool,
    fail_popn: AtomicBool,
    fail_flush: AtomicBool,
    corrupt_range: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn inner(&self) -> &MemoryEpochStore {
        &self.inner
    }

    pub fn set_fail_pushn(&self, fail: bool) {
        self.fail_pushn.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_popn(&self, fail: bool) {
        self.fail_popn.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Make `global_epoch_range` report a corrupted range.
    pub fn set_corrupt_range(&self, corrupt: bool) {
        self.corrupt_range.store(corrupt, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl EpochStore for RecordingStore {
    async fn global_epoch_range(&self) -> StoreResult<(u64, u64)> {
        if self.corrupt_range.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupted("epoch range min > max".to_string()));
        }
        self.inner.global_epoch_range().await
    }

    async fn pushn(&self, data: &[EpochData]) -> StoreResult<()> {
        if self.fail_pushn.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected pushn failure").into());
        }
        self.inner.pushn(data).await?;
        self.ops
            .lock()
            .unwrap()
            .push(StoreOp::Pushn(data.iter().map(|d| d.epoch).collect()));
        Ok(())
    }

    async fn popn(&self, revert_to: u64) -> StoreResult<()> {
        if self.fail_popn.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected popn failure").into());
        }
        self.inner.popn(revert_to).await?;
        self.ops.lock().unwrap().push(StoreOp::Popn(revert_to));
        Ok(())
    }

    async fn flush(&self) -> StoreResult<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected flush failure").into());
        }
        self.inner.flush().await?;
        self.ops.lock().unwrap().push(StoreOp::Flush);
        Ok(())
    }

    async fn epoch_pivot_hash(&self, epoch: u64) -> StoreResult<Option<String>> {
        self.inner.epoch_pivot_hash(epoch).await
    }
}

/// Chain head height source with failure injection
#[derive(Debug, Default)]
pub struct MockHeightSource {
    height: AtomicU64,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl MockHeightSource {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
            ..Default::default()
        }
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LatestHeight for MockHeightSource {
    async fn latest_height(&self) -> anyhow::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("height source unavailable");
        }
        Ok(self.height.load(Ordering::SeqCst))
    }
}
