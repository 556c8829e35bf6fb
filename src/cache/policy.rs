//! Cache policy configuration

use std::time::Duration;

/// Tuning knobs for visibility classification and eviction
#[derive(Clone, Copy, Debug)]
pub struct CachePolicy {
    /// Minimum pixel occupancy for a code to count as seen
    pub threshold: u32,
    /// Minimum projected size (pixels) to even attempt a full test
    pub bbox_threshold: f32,
    /// Grace period before a hidden-but-recently-seen geometry is
    /// evicted
    pub max_hidden_time: Duration,
    /// Maximum residency after going unseen with no re-appearance
    pub max_lost_time: Duration,
    /// Soft cap on resident fragment bytes; stale geometries are
    /// evicted first when exceeded
    pub max_ram_budget: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            threshold: 50,
            bbox_threshold: 200.0,
            max_hidden_time: Duration::from_millis(5000),
            max_lost_time: Duration::from_millis(30000),
            max_ram_budget: 1024 * 1024 * 1024, // 1 GB
        }
    }
}
