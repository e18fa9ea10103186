//! Engine configuration types.
//!
//! `EngineConfig` mirrors the `streamflow.toml` file. All fields have
//! defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the flow engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub join: JoinConfig,
    #[serde(default)]
    pub task: TaskConfig,
}

/// Bounds for each of the two pipeline caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries per cache before least-recently-used eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Idle time after which an entry is evicted.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

fn default_max_entries() -> usize {
    1000
}

fn default_idle_ttl_secs() -> u64 {
    86_400
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

/// Join barrier settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Partial join groups older than this are expired by a sweep.
    /// `None` keeps partial groups until they complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub straggler_timeout_secs: Option<u64>,
}

/// Task dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Upper bound on a single operator dispatch.
    #[serde(default = "default_operator_timeout_secs")]
    pub operator_timeout_secs: u64,
}

fn default_operator_timeout_secs() -> u64 {
    300
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            operator_timeout_secs: default_operator_timeout_secs(),
        }
    }
}
