// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{GlockError, Result};
use crate::types::FsId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable name that specifies the number of lock table shards.
/// - Purpose: Spread lock table insert/remove traffic over independent shards.
/// - Unit: number of shards (usize).
/// - Valid values: a power of two greater than zero.
/// - Example: `export RUSTFS_GLOCK_SHARD_COUNT=128`
/// - Note: More shards reduce contention between unrelated glocks at a small memory cost.
pub const ENV_GLOCK_SHARD_COUNT: &str = "RUSTFS_GLOCK_SHARD_COUNT";

/// Environment variable name that specifies the size of the per-key wait table.
/// - Purpose: Number of hashed wait buckets used while a dying glock is unlinked.
/// - Unit: bits (the table has `1 << bits` buckets).
/// - Valid values: 1 to 16.
/// - Example: `export RUSTFS_GLOCK_WAIT_TABLE_BITS=8`
pub const ENV_GLOCK_WAIT_TABLE_BITS: &str = "RUSTFS_GLOCK_WAIT_TABLE_BITS";

/// Environment variable name that specifies the initial glock hold time in milliseconds.
/// - Purpose: Minimum residency of a freshly granted glock before a remote demote is honored.
/// - Unit: milliseconds (u64).
/// - Valid values: between the configured minimum and maximum hold time.
/// - Example: `export RUSTFS_GLOCK_HOLD_TIME_MS=200`
/// - Note: Longer hold times damp lock ping-pong between nodes but delay remote waiters.
pub const ENV_GLOCK_HOLD_TIME_MS: &str = "RUSTFS_GLOCK_HOLD_TIME_MS";

/// Environment variable name that specifies the lower bound of the adaptive hold time.
/// - Unit: milliseconds (u64).
/// - Example: `export RUSTFS_GLOCK_HOLD_TIME_MIN_MS=10`
pub const ENV_GLOCK_HOLD_TIME_MIN_MS: &str = "RUSTFS_GLOCK_HOLD_TIME_MIN_MS";

/// Environment variable name that specifies the upper bound of the adaptive hold time.
/// - Unit: milliseconds (u64).
/// - Example: `export RUSTFS_GLOCK_HOLD_TIME_MAX_MS=1000`
pub const ENV_GLOCK_HOLD_TIME_MAX_MS: &str = "RUSTFS_GLOCK_HOLD_TIME_MAX_MS";

/// Environment variable name that specifies how much the hold time grows after a contended wait.
/// - Unit: milliseconds (u64).
/// - Example: `export RUSTFS_GLOCK_HOLD_TIME_INCR_MS=50`
pub const ENV_GLOCK_HOLD_TIME_INCR_MS: &str = "RUSTFS_GLOCK_HOLD_TIME_INCR_MS";

/// Environment variable name that specifies how much the hold time shrinks after an uncontested demote.
/// - Unit: milliseconds (u64).
/// - Example: `export RUSTFS_GLOCK_HOLD_TIME_DECR_MS=25`
pub const ENV_GLOCK_HOLD_TIME_DECR_MS: &str = "RUSTFS_GLOCK_HOLD_TIME_DECR_MS";

/// Environment variable name that specifies the wait duration counted as contention.
/// - Purpose: A holder that waits longer than this grows the glock hold time.
/// - Unit: milliseconds (u64).
/// - Example: `export RUSTFS_GLOCK_CONTENTION_THRESHOLD_MS=1000`
pub const ENV_GLOCK_CONTENTION_THRESHOLD_MS: &str = "RUSTFS_GLOCK_CONTENTION_THRESHOLD_MS";

/// Environment variable name that specifies the soft limit of idle glocks kept on the LRU.
/// - Purpose: The background shrinker demotes the oldest idle glocks above this count.
/// - Unit: number of glocks (usize).
/// - Valid values: 0 disables the background shrinker.
/// - Example: `export RUSTFS_GLOCK_LRU_MAX_ENTRIES=65536`
pub const ENV_GLOCK_LRU_MAX_ENTRIES: &str = "RUSTFS_GLOCK_LRU_MAX_ENTRIES";

/// Environment variable name that specifies the background shrinker period in seconds.
/// - Unit: seconds (u64).
/// - Example: `export RUSTFS_GLOCK_SHRINK_INTERVAL_SECS=5`
pub const ENV_GLOCK_SHRINK_INTERVAL_SECS: &str = "RUSTFS_GLOCK_SHRINK_INTERVAL_SECS";

/// Environment variable name that specifies how long unmount waits for every glock to be freed.
/// - Unit: seconds (u64).
/// - Example: `export RUSTFS_GLOCK_CLEAR_TIMEOUT_SECS=60`
pub const ENV_GLOCK_CLEAR_TIMEOUT_SECS: &str = "RUSTFS_GLOCK_CLEAR_TIMEOUT_SECS";

/// Environment variable name that bounds acquire hook restarts for a single holder.
/// - Unit: attempts (u32).
/// - Example: `export RUSTFS_GLOCK_ACQUIRE_HOOK_RETRIES=8`
pub const ENV_GLOCK_ACQUIRE_HOOK_RETRIES: &str = "RUSTFS_GLOCK_ACQUIRE_HOOK_RETRIES";

/// Glock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlockConfig {
    /// Filesystem instance this manager serves
    #[serde(default)]
    pub fs_id: FsId,

    /// Number of lock table shards
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Per-key wait table size in bits
    #[serde(default = "default_wait_table_bits")]
    pub wait_table_bits: u32,

    /// Initial hold time of a new glock
    #[serde(default = "default_hold_time")]
    pub hold_time: Duration,

    #[serde(default = "default_hold_time_min")]
    pub hold_time_min: Duration,

    #[serde(default = "default_hold_time_max")]
    pub hold_time_max: Duration,

    #[serde(default = "default_hold_time_incr")]
    pub hold_time_incr: Duration,

    #[serde(default = "default_hold_time_decr")]
    pub hold_time_decr: Duration,

    /// Holder waits longer than this count as contention
    #[serde(default = "default_contention_threshold")]
    pub contention_threshold: Duration,

    /// Soft limit for idle glocks; 0 disables background shrinking
    #[serde(default)]
    pub lru_max_entries: usize,

    #[serde(default = "default_shrink_interval")]
    pub shrink_interval: Duration,

    /// Upper bound for unmount to wait on outstanding glocks
    #[serde(default = "default_clear_timeout")]
    pub clear_timeout: Duration,

    #[serde(default = "default_acquire_hook_retries")]
    pub acquire_hook_retries: u32,

    /// Resource number of this node's own journal glock
    #[serde(default)]
    pub journal_id: Option<u64>,
}

impl Default for GlockConfig {
    fn default() -> Self {
        Self {
            fs_id: FsId::default(),
            shard_count: default_shard_count(),
            wait_table_bits: default_wait_table_bits(),
            hold_time: default_hold_time(),
            hold_time_min: default_hold_time_min(),
            hold_time_max: default_hold_time_max(),
            hold_time_incr: default_hold_time_incr(),
            hold_time_decr: default_hold_time_decr(),
            contention_threshold: default_contention_threshold(),
            lru_max_entries: 0,
            shrink_interval: default_shrink_interval(),
            clear_timeout: default_clear_timeout(),
            acquire_hook_retries: default_acquire_hook_retries(),
            journal_id: None,
        }
    }
}

impl GlockConfig {
    /// Small tables, short hold times. Used by tests and tools.
    pub fn minimal() -> Self {
        Self {
            shard_count: 4,
            wait_table_bits: 2,
            hold_time: Duration::from_millis(20),
            hold_time_min: Duration::from_millis(5),
            hold_time_max: Duration::from_millis(100),
            hold_time_incr: Duration::from_millis(10),
            hold_time_decr: Duration::from_millis(5),
            contention_threshold: Duration::from_millis(100),
            clear_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Apply `RUSTFS_GLOCK_*` overrides on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            shard_count: env_parse(ENV_GLOCK_SHARD_COUNT, defaults.shard_count)?,
            wait_table_bits: env_parse(ENV_GLOCK_WAIT_TABLE_BITS, defaults.wait_table_bits)?,
            hold_time: env_millis(ENV_GLOCK_HOLD_TIME_MS, defaults.hold_time)?,
            hold_time_min: env_millis(ENV_GLOCK_HOLD_TIME_MIN_MS, defaults.hold_time_min)?,
            hold_time_max: env_millis(ENV_GLOCK_HOLD_TIME_MAX_MS, defaults.hold_time_max)?,
            hold_time_incr: env_millis(ENV_GLOCK_HOLD_TIME_INCR_MS, defaults.hold_time_incr)?,
            hold_time_decr: env_millis(ENV_GLOCK_HOLD_TIME_DECR_MS, defaults.hold_time_decr)?,
            contention_threshold: env_millis(ENV_GLOCK_CONTENTION_THRESHOLD_MS, defaults.contention_threshold)?,
            lru_max_entries: env_parse(ENV_GLOCK_LRU_MAX_ENTRIES, defaults.lru_max_entries)?,
            shrink_interval: Duration::from_secs(env_parse(ENV_GLOCK_SHRINK_INTERVAL_SECS, defaults.shrink_interval.as_secs())?),
            clear_timeout: Duration::from_secs(env_parse(ENV_GLOCK_CLEAR_TIMEOUT_SECS, defaults.clear_timeout.as_secs())?),
            acquire_hook_retries: env_parse(ENV_GLOCK_ACQUIRE_HOOK_RETRIES, defaults.acquire_hook_retries)?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_fs_id(mut self, fs_id: FsId) -> Self {
        self.fs_id = fs_id;
        self
    }

    pub fn with_journal_id(mut self, journal_id: u64) -> Self {
        self.journal_id = Some(journal_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(GlockError::configuration(format!(
                "shard_count must be a power of two, got {}",
                self.shard_count
            )));
        }
        if self.wait_table_bits == 0 || self.wait_table_bits > 16 {
            return Err(GlockError::configuration(format!(
                "wait_table_bits must be within 1..=16, got {}",
                self.wait_table_bits
            )));
        }
        if self.hold_time_min > self.hold_time_max {
            return Err(GlockError::configuration("hold_time_min exceeds hold_time_max"));
        }
        if self.hold_time < self.hold_time_min || self.hold_time > self.hold_time_max {
            return Err(GlockError::configuration("hold_time must lie within [hold_time_min, hold_time_max]"));
        }
        if self.shrink_interval.is_zero() {
            return Err(GlockError::configuration("shrink_interval must be non-zero"));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| GlockError::configuration(format!("invalid value for {name}: {value}"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn default_shard_count() -> usize {
    64
}

fn default_wait_table_bits() -> u32 {
    8
}

fn default_hold_time() -> Duration {
    Duration::from_millis(200)
}

fn default_hold_time_min() -> Duration {
    Duration::from_millis(10)
}

fn default_hold_time_max() -> Duration {
    Duration::from_millis(1000)
}

fn default_hold_time_incr() -> Duration {
    Duration::from_millis(50)
}

fn default_hold_time_decr() -> Duration {
    Duration::from_millis(25)
}

fn default_contention_threshold() -> Duration {
    Duration::from_secs(1)
}

fn default_shrink_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_clear_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_acquire_hook_retries() -> u32 {
    8
}
