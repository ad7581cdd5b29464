// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Epoch sync window
//!
//! Tracks the inclusive range `[from, to]` of epochs that are known but not yet
//! applied to the store. The window is empty when `to == from - 1`.
//!
//! Consumption is split into `peek_shrink_from` and `shrink_from` so the owner can
//! fetch and persist a batch before committing it: an epoch is never skipped when
//! a fetch or write fails.

use std::fmt;

/// Epoch range pending synchronization, owned by a single sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochWindow {
    from: u64,
    to: u64,
    /// Gap between a new epoch and `from` after which pending epochs are stale
    decayed_gap_threshold: u64,
}

impl EpochWindow {
    /// Create a window in zero state `[0, 0]`.
    pub fn new(decayed_gap_threshold: u64) -> Self {
        Self {
            from: 0,
            to: 0,
            decayed_gap_threshold,
        }
    }

    pub fn from(&self) -> u64 {
        self.from
    }

    pub fn to(&self) -> u64 {
        self.to
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }

    /// Number of epochs not yet consumed
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.to - self.from + 1
        }
    }

    /// Whether `new_epoch` lies inside or behind the tracked range, i.e. the chain
    /// head moved backward relative to what was assumed.
    pub fn peek_will_pivot_switch(&self, new_epoch: u64) -> bool {
        new_epoch <= self.to
    }

    /// Whether accepting `new_epoch` would stretch the window past the decay
    /// threshold.
    pub fn peek_will_overflow(&self, new_epoch: u64) -> bool {
        new_epoch > self.from && new_epoch - self.from > self.decayed_gap_threshold
    }

    pub fn expand_to(&mut self, new_epoch: u64) {
        if new_epoch > self.to {
            self.to = new_epoch;
        }
    }

    /// Restart the window at `new_epoch` after a reverted suffix.
    pub fn expand_from(&mut self, new_epoch: u64) {
        self.from = new_epoch;
        self.to = new_epoch;
    }

    /// Move the window end back to `new_epoch` after the store reverted epochs
    /// `>= new_epoch`. Unsynced epochs below `new_epoch` stay in the window.
    pub fn pivot_switch_to(&mut self, new_epoch: u64) {
        if new_epoch <= self.from {
            self.expand_from(new_epoch);
        } else {
            self.to = new_epoch;
        }
    }

    pub fn reset(&mut self, from: u64, to: u64) {
        self.from = from;
        self.to = to;
    }

    /// Next chunk of at most `max_count` epochs starting at `from`, without
    /// consuming it.
    pub fn peek_shrink_from(&self, max_count: u32) -> (u64, u32) {
        let size = self.len().min(u64::from(max_count)) as u32;
        (self.from, size)
    }

    /// Consume the chunk reported by `peek_shrink_from`.
    pub fn shrink_from(&mut self, max_count: u32) -> (u64, u32) {
        let (start, size) = self.peek_shrink_from(max_count);
        self.from += u64::from(size);
        (start, size)
    }
}

impl fmt::Display for EpochWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}
