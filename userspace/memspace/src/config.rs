// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TOML configuration for GC thresholds and the reserved kernel store
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below
//!
//! Percentages are expressed in 0..=100. Durations are whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::heap::StoreId;
use crate::registry::LEAK_SAMPLE_COUNT;
use crate::shed::IndexId;
use crate::Pid;

/// Garbage-collection thresholds and timer periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfig {
    /// Sweep period.
    pub interval_secs: u64,
    /// Leak-detection period.
    pub leak_interval_secs: u64,
    /// Trailing window of retained usage samples.
    pub leak_window_secs: u64,
    /// Stores with less free space than this are compacted.
    pub min_free_percent: f64,
    /// Stores above this usage are reported.
    pub max_usage_percent: f64,
    /// Sweeps skip compaction below this gap share of the occupied span.
    pub fragmentation_threshold: f64,
    /// Master switch for compaction.
    pub compaction_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            leak_interval_secs: 300,
            leak_window_secs: 300,
            min_free_percent: 10.0,
            max_usage_percent: 90.0,
            fragmentation_threshold: 25.0,
            compaction_enabled: true,
        }
    }
}

impl GcConfig {
    /// Sweep period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Leak-detection period as a [`Duration`].
    pub fn leak_interval(&self) -> Duration {
        Duration::from_secs(self.leak_interval_secs)
    }

    /// Leak window as a [`Duration`].
    pub fn leak_window(&self) -> Duration {
        Duration::from_secs(self.leak_window_secs)
    }

    /// Merges `patch` into `self`; returns `true` when a timer period changed.
    pub fn apply(&mut self, patch: &GcConfigPatch) -> bool {
        let before = (self.interval_secs, self.leak_interval_secs);
        if let Some(v) = patch.interval_secs {
            self.interval_secs = v;
        }
        if let Some(v) = patch.leak_interval_secs {
            self.leak_interval_secs = v;
        }
        if let Some(v) = patch.leak_window_secs {
            self.leak_window_secs = v;
        }
        if let Some(v) = patch.min_free_percent {
            self.min_free_percent = v;
        }
        if let Some(v) = patch.max_usage_percent {
            self.max_usage_percent = v;
        }
        if let Some(v) = patch.fragmentation_threshold {
            self.fragmentation_threshold = v;
        }
        if let Some(v) = patch.compaction_enabled {
            self.compaction_enabled = v;
        }
        before != (self.interval_secs, self.leak_interval_secs)
    }

    /// Rejects zero periods and percentages outside 0..=100.
    ///
    /// The leak window must also be long enough to hold [`LEAK_SAMPLE_COUNT`] samples.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 || self.leak_interval_secs == 0 {
            return Err(ConfigError::Invalid("timer periods must be non-zero".into()));
        }
        // Samples arrive on both timers, so the faster one sets the spacing.
        let spacing = self.interval_secs.min(self.leak_interval_secs);
        let needed = spacing.saturating_mul(LEAK_SAMPLE_COUNT as u64 - 1);
        if self.leak_window_secs < needed {
            return Err(ConfigError::Invalid(format!(
                "leak_window_secs must be at least {needed} to hold {LEAK_SAMPLE_COUNT} samples, got {}",
                self.leak_window_secs
            )));
        }
        for (name, value) in [
            ("min_free_percent", self.min_free_percent),
            ("max_usage_percent", self.max_usage_percent),
            ("fragmentation_threshold", self.fragmentation_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0..=100, got {value}")));
            }
        }
        Ok(())
    }
}

/// Partial update for [`GcConfig`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcConfigPatch {
    /// See [`GcConfig::interval_secs`].
    pub interval_secs: Option<u64>,
    /// See [`GcConfig::leak_interval_secs`].
    pub leak_interval_secs: Option<u64>,
    /// See [`GcConfig::leak_window_secs`].
    pub leak_window_secs: Option<u64>,
    /// See [`GcConfig::min_free_percent`].
    pub min_free_percent: Option<f64>,
    /// See [`GcConfig::max_usage_percent`].
    pub max_usage_percent: Option<f64>,
    /// See [`GcConfig::fragmentation_threshold`].
    pub fragmentation_threshold: Option<f64>,
    /// See [`GcConfig::compaction_enabled`].
    pub compaction_enabled: Option<bool>,
}

/// Identity and sizing of the reserved kernel store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelStoreConfig {
    /// Reserved process id.
    pub pid: Pid,
    /// Fixed heap id.
    pub store_id: StoreId,
    /// Fixed index id.
    pub index_id: IndexId,
    /// Heap capacity in bytes.
    pub store_size: usize,
    /// Index byte budget; 0 disables the check.
    pub index_size: usize,
}

impl Default for KernelStoreConfig {
    fn default() -> Self {
        Self { pid: 0, store_id: StoreId(1), index_id: IndexId(1), store_size: 64 * 1024, index_size: 0 }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemspaceConfig {
    /// `[gc]` table.
    pub gc: GcConfig,
    /// `[kernel]` table.
    pub kernel: KernelStoreConfig,
}

impl MemspaceConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gc.validate()?;
        if self.kernel.store_size == 0 {
            return Err(ConfigError::Invalid("kernel.store_size must be non-zero".into()));
        }
        Ok(())
    }
}
