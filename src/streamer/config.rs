//! Streamer configuration surface

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;

/// Recognized streaming options. All fields have defaults, so partial
/// JSON configs deserialize cleanly.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Minimum pixel occupancy for a geometry to count as seen
    pub threshold: u32,
    /// Minimum projected size (pixels) to even enter the id pass
    #[serde(rename = "bboxThreshold")]
    pub bbox_threshold: f32,
    /// Grace period before a hidden geometry is evicted
    #[serde(rename = "maxHiddenTime")]
    pub max_hidden_time_ms: u64,
    /// Maximum residency after going unseen with no re-appearance
    #[serde(rename = "maxLostTime")]
    pub max_lost_time_ms: u64,
    /// Soft cap on resident fragment bytes
    #[serde(rename = "maxRamBudget")]
    pub max_ram_budget: usize,
    /// How long raw tile blobs stay in the loader's RAM cache
    #[serde(rename = "maxRamTime")]
    pub max_ram_time_ms: u64,
    /// Whether to use the persistent store for tile files
    #[serde(rename = "useCache")]
    pub use_cache: bool,
    /// Whether `run` drives update cycles on an interval
    #[serde(rename = "autoUpdate")]
    pub auto_update: bool,
    #[serde(rename = "updateIntervalMs")]
    pub update_interval_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            threshold: 50,
            bbox_threshold: 200.0,
            max_hidden_time_ms: 5000,
            max_lost_time_ms: 30000,
            max_ram_budget: 1024 * 1024 * 1024,
            max_ram_time_ms: 5000,
            use_cache: true,
            auto_update: true,
            update_interval_ms: 1000,
        }
    }
}

impl StreamerConfig {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            threshold: self.threshold,
            bbox_threshold: self.bbox_threshold,
            max_hidden_time: Duration::from_millis(self.max_hidden_time_ms),
            max_lost_time: Duration::from_millis(self.max_lost_time_ms),
            max_ram_budget: self.max_ram_budget,
        }
    }

    pub fn max_ram_time(&self) -> Duration {
        Duration::from_millis(self.max_ram_time_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StreamerConfig =
            serde_json::from_str(r#"{"maxHiddenTime": 2000, "useCache": false}"#).unwrap();
        assert_eq!(config.max_hidden_time_ms, 2000);
        assert!(!config.use_cache);
        assert_eq!(config.threshold, StreamerConfig::default().threshold);
    }

    #[test]
    fn test_policy_conversion() {
        let config = StreamerConfig {
            max_hidden_time_ms: 1234,
            ..StreamerConfig::default()
        };
        assert_eq!(config.policy().max_hidden_time, Duration::from_millis(1234));
    }
}
