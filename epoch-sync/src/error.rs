// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the sync engine and the stores it drives.

/// Error returned by an epoch store or one of its partition collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing has been persisted yet (e.g. empty epoch range).
    #[error("record not found")]
    RecordNotFound,

    #[error("no block mapping found for epoch {0}")]
    NoBlockMapping(u64),

    #[error("partition {index} of entity '{entity}' not found")]
    PartitionNotFound { entity: String, index: u32 },

    #[error("partition {index} of entity '{entity}' count {count} cannot apply delta {delta}")]
    CountUnderflow {
        entity: String,
        index: u32,
        count: u64,
        delta: i64,
    },

    /// Persisted state is inconsistent and cannot be trusted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_record_not_found(&self) -> bool {
        matches!(self, StoreError::RecordNotFound)
    }

    /// Recover a typed store error from an `anyhow` chain, e.g. after it crossed a
    /// database transaction boundary.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(store_err) => store_err,
            Err(err) => StoreError::Backend(err),
        }
    }

    /// Short label for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            StoreError::RecordNotFound => "record_not_found",
            StoreError::NoBlockMapping(_) => "no_block_mapping",
            StoreError::PartitionNotFound { .. } => "partition_not_found",
            StoreError::CountUnderflow { .. } => "count_underflow",
            StoreError::Corrupted(_) => "corrupted",
            StoreError::Backend(_) => "backend",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to query epoch data for epoch {epoch}: {source}")]
    Fetch {
        epoch: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    /// The persisted sync range could not be loaded; there is no safe starting point.
    #[error("failed to load last synced epoch: {0}")]
    Startup(#[source] StoreError),

    #[error("invalid sync config: {0}")]
    Config(#[source] anyhow::Error),

    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    pub fn store(op: &'static str, source: StoreError) -> Self {
        SyncError::Store { op, source }
    }

    /// Whether the engine may retry after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SyncError::Startup(_) | SyncError::Config(_) | SyncError::ChannelClosed
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
