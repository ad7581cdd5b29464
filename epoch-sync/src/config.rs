// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Epoch sync configuration
//!
//! Every value has a default so a config file only needs to name what it changes.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete epoch sync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochSyncConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub stall_monitor: StallMonitorConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
}

impl EpochSyncConfig {
    /// Load configuration from a YAML or JSON file with environment variable
    /// substitution. Files ending in `.json` are parsed as JSON, everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read epoch sync config file: {:?}", path))?;

        let contents = substitute_env_vars(&contents)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: EpochSyncConfig = if is_json {
            serde_json::from_str(&contents).context("Failed to parse epoch sync config JSON")?
        } else {
            serde_yaml::from_str(&contents).context("Failed to parse epoch sync config YAML")?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        self.stall_monitor.validate()?;
        self.partition.validate()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String> {
    use regex::Regex;

    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").context("Invalid env var pattern")?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        match std::env::var(var_name) {
            Ok(var_value) => result = result.replace(full_match, &var_value),
            Err(_) => tracing::warn!(
                "Environment variable {} not found, keeping placeholder",
                var_name
            ),
        }
    }

    Ok(result)
}

/// Sync loop behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tick interval when the window is drained (milliseconds)
    #[serde(default = "default_poll_interval_normal_ms")]
    pub poll_interval_normal_ms: u64,

    /// Tick interval while catching up (milliseconds)
    #[serde(default = "default_poll_interval_catch_up_ms")]
    pub poll_interval_catch_up_ms: u64,

    /// Maximum number of epochs fetched and written per tick
    #[serde(default = "default_max_epochs_per_batch")]
    pub max_epochs_per_batch: u32,

    /// Epoch gap after which pending epochs are dropped instead of drained
    #[serde(default = "default_decayed_epoch_gap_threshold")]
    pub decayed_epoch_gap_threshold: u64,

    /// Capacity of the new-epoch notification queue
    #[serde(default = "default_sub_buffer")]
    pub sub_buffer: usize,

    /// Capacity of the checkpoint request queue
    #[serde(default = "default_checkpoint_buffer")]
    pub checkpoint_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_normal_ms: default_poll_interval_normal_ms(),
            poll_interval_catch_up_ms: default_poll_interval_catch_up_ms(),
            max_epochs_per_batch: default_max_epochs_per_batch(),
            decayed_epoch_gap_threshold: default_decayed_epoch_gap_threshold(),
            sub_buffer: default_sub_buffer(),
            checkpoint_buffer: default_checkpoint_buffer(),
        }
    }
}

fn default_poll_interval_normal_ms() -> u64 {
    500
}

fn default_poll_interval_catch_up_ms() -> u64 {
    100
}

fn default_max_epochs_per_batch() -> u32 {
    10
}

fn default_decayed_epoch_gap_threshold() -> u64 {
    100_000
}

fn default_sub_buffer() -> usize {
    1000
}

fn default_checkpoint_buffer() -> usize {
    2
}

impl SyncConfig {
    pub fn poll_interval_normal(&self) -> Duration {
        Duration::from_millis(self.poll_interval_normal_ms)
    }

    pub fn poll_interval_catch_up(&self) -> Duration {
        Duration::from_millis(self.poll_interval_catch_up_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_normal_ms == 0 || self.poll_interval_catch_up_ms == 0 {
            bail!("sync poll intervals must be greater than zero");
        }
        if self.max_epochs_per_batch == 0 {
            bail!("sync.max_epochs_per_batch must be greater than zero");
        }
        if self.decayed_epoch_gap_threshold == 0 {
            bail!("sync.decayed_epoch_gap_threshold must be greater than zero");
        }
        if self.sub_buffer == 0 || self.checkpoint_buffer == 0 {
            bail!("sync channel buffers must be greater than zero");
        }
        Ok(())
    }
}

/// Hysteresis applied to health check results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before reporting unhealthy
    #[serde(default = "default_health_threshold")]
    pub threshold: u64,

    /// Remind every `remind` failures while still unhealthy
    #[serde(default = "default_health_remind")]
    pub remind: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            threshold: default_health_threshold(),
            remind: default_health_remind(),
        }
    }
}

fn default_health_threshold() -> u64 {
    5
}

fn default_health_remind() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallMonitorConfig {
    /// Longest tolerated time without height growth, also the check interval (seconds)
    #[serde(default = "default_max_stalled_duration_secs")]
    pub max_stalled_duration_secs: u64,

    /// Height lag behind the chain head still considered caught up
    #[serde(default = "default_max_allowed_lag")]
    pub max_allowed_lag: u64,

    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for StallMonitorConfig {
    fn default() -> Self {
        Self {
            max_stalled_duration_secs: default_max_stalled_duration_secs(),
            max_allowed_lag: default_max_allowed_lag(),
            health: HealthConfig::default(),
        }
    }
}

fn default_max_stalled_duration_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_allowed_lag() -> u64 {
    200
}

impl StallMonitorConfig {
    pub fn max_stalled_duration(&self) -> Duration {
        Duration::from_secs(self.max_stalled_duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_stalled_duration_secs == 0 {
            bail!("stall_monitor.max_stalled_duration_secs must be greater than zero");
        }
        if self.health.threshold == 0 {
            bail!("stall_monitor.health.threshold must be greater than zero");
        }
        if self.health.remind == 0 {
            bail!("stall_monitor.health.remind must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Row cap of a single log partition
    #[serde(default = "default_log_volume_size")]
    pub log_volume_size: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            log_volume_size: default_log_volume_size(),
        }
    }
}

fn default_log_volume_size() -> u64 {
    10_000_000
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_volume_size == 0 {
            bail!("partition.log_volume_size must be greater than zero");
        }
        Ok(())
    }
}
