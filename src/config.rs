//! Runtime configuration for every component, aggregated into one struct that
//! loads from and saves to TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::OrchestratorResult;

/// Tunable thresholds governing cross-GPU lending behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LendingPolicyConfig {
    /// Fraction of a GPU's capacity that must stay free before it may lend.
    pub min_free_ratio: f64,
    /// Maximum fraction of a GPU's capacity it may lend out at once.
    pub max_lend_ratio: f64,
    /// Utilization above which a GPU stops accepting new lend requests.
    pub stop_lending_threshold: f64,
    /// Utilization above which outstanding leases on a GPU are reclaimed.
    pub reclaim_threshold: f64,
    /// Utilization above which reclaim escalates to CRITICAL urgency.
    pub critical_threshold: f64,
    /// Minimum seconds a lease must live before it is eligible for reclaim.
    pub min_lease_duration_s: f64,
    /// Prefer lenders reachable over a fast interconnect (NVLink/Infinity Fabric).
    pub prefer_fast_interconnect: bool,
    /// Score penalty applied when lender and borrower are different vendors.
    pub cross_vendor_penalty: f64,
    /// Fraction of a GPU's capacity pre-allocated as the lending buffer.
    pub buffer_prealloc_ratio: f64,
}

impl Default for LendingPolicyConfig {
    fn default() -> Self {
        Self {
            min_free_ratio: 0.10,
            max_lend_ratio: 0.70,
            stop_lending_threshold: 0.75,
            reclaim_threshold: 0.80,
            critical_threshold: 0.95,
            min_lease_duration_s: 0.5,
            prefer_fast_interconnect: true,
            cross_vendor_penalty: 0.15,
            buffer_prealloc_ratio: 0.50,
        }
    }
}

/// Sizing knobs for a `PagedKvCache`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PagedKvConfigOptions {
    /// Tokens stored per physical page.
    pub page_size: usize,
    /// Hard cap on physical pages per device (0 = derive from device memory).
    pub max_pages: usize,
    /// Physical pages reserved per device before any are lent or borrowed.
    pub pages_per_device: usize,
}

impl Default for PagedKvConfigOptions {
    fn default() -> Self {
        Self {
            page_size: 16,
            max_pages: 0,
            pages_per_device: 4096,
        }
    }
}

/// Admission limits for a `ContinuousBatcher`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum number of requests admitted into one iteration.
    pub max_batch_size: usize,
    /// Maximum number of requests allowed to wait for admission.
    pub max_waiting_queue: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_waiting_queue: 256,
        }
    }
}

/// Top-level configuration aggregating every component's policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub lending: LendingPolicyConfig,
    pub paged_kv: PagedKvConfigOptions,
    pub batcher: BatcherConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn load(path: &Path) -> OrchestratorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Serialize and write configuration to a TOML file, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> OrchestratorResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.lending.min_free_ratio, 0.10);
        assert_eq!(cfg.lending.max_lend_ratio, 0.70);
        assert_eq!(cfg.lending.stop_lending_threshold, 0.75);
        assert_eq!(cfg.lending.reclaim_threshold, 0.80);
        assert_eq!(cfg.lending.critical_threshold, 0.95);
        assert_eq!(cfg.lending.min_lease_duration_s, 0.5);
        assert!(cfg.lending.prefer_fast_interconnect);
        assert_eq!(cfg.lending.cross_vendor_penalty, 0.15);
        assert_eq!(cfg.lending.buffer_prealloc_ratio, 0.50);
        assert_eq!(cfg.paged_kv.page_size, 16);
        assert_eq!(cfg.batcher.max_batch_size, 32);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = env::temp_dir().join(format!("vram-orchestrator-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut cfg = OrchestratorConfig::default();
        cfg.lending.cross_vendor_penalty = 0.42;
        cfg.save(&path).unwrap();

        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded.lending.cross_vendor_penalty, 0.42);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let dir = env::temp_dir().join(format!("vram-orchestrator-test-partial-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.toml");
        std::fs::write(&path, "[lending]\nmax_lend_ratio = 0.5\n").unwrap();

        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded.lending.max_lend_ratio, 0.5);
        assert_eq!(loaded.lending.min_free_ratio, 0.10);

        std::fs::remove_dir_all(&dir).ok();
    }
}
