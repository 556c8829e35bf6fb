//! Geometry record table and time-budgeted eviction
//!
//! Turns each visibility snapshot into load/unload decisions and show/
//! hide toggles. Eviction is dual-clock: a hidden clock against the
//! last confirmed-visible cycle and a lost clock against load time.
//! Not an LRU; a geometry seen this cycle is never unloaded this cycle.

pub mod policy;

pub use policy::CachePolicy;

use std::collections::HashMap;
use std::time::Instant;

use crate::culler::VisibilitySnapshot;
use crate::math::Frustum;
use crate::model::{GeometryKey, GeometryRecord, GeometryState, ModelIndex};

/// Decisions produced by one visibility cycle, applied by the
/// orchestrator
#[derive(Clone, Debug, Default)]
pub struct VisibilityDelta {
    /// Unseen geometries that became visible: fetch and decode
    pub to_load: Vec<GeometryKey>,
    /// Expired residents: remove from the scene and drop buffers
    pub to_unload: Vec<GeometryKey>,
    /// Resident geometries that became visible again
    pub to_show: Vec<GeometryKey>,
    /// Resident geometries that stopped being visible; stay resident
    pub to_hide: Vec<GeometryKey>,
    /// Subset of `to_hide` whose bounds are still inside the frustum
    /// (occluded rather than culled)
    pub hidden_but_tracked: Vec<GeometryKey>,
}

impl VisibilityDelta {
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty()
            && self.to_unload.is_empty()
            && self.to_show.is_empty()
            && self.to_hide.is_empty()
    }
}

/// Owns the geometry record table and applies the eviction policy.
///
/// All mutation happens on the control thread; workers only ever see
/// snapshots.
pub struct GeometryCache {
    policy: CachePolicy,
    records: HashMap<GeometryKey, GeometryRecord>,
    resident_bytes: usize,
}

impl GeometryCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
            resident_bytes: 0,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn insert(&mut self, record: GeometryRecord) {
        self.resident_bytes += record.resident_bytes;
        self.records.insert(record.key, record);
    }

    pub fn get(&self, key: GeometryKey) -> Option<&GeometryRecord> {
        self.records.get(&key)
    }

    pub fn get_mut(&mut self, key: GeometryKey) -> Option<&mut GeometryRecord> {
        self.records.get_mut(&key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total approximate bytes of resident fragments
    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    pub fn records(&self) -> impl Iterator<Item = &GeometryRecord> {
        self.records.values()
    }

    /// Drop every record of a model. Returns the keys that were
    /// resident so the orchestrator can remove their meshes.
    pub fn remove_model(&mut self, model: ModelIndex) -> Vec<GeometryKey> {
        let keys: Vec<GeometryKey> = self
            .records
            .keys()
            .copied()
            .filter(|key| key.model == model)
            .collect();
        let mut resident = Vec::new();
        for key in keys {
            if let Some(record) = self.records.remove(&key) {
                self.resident_bytes -= record.resident_bytes;
                if record.is_resident() {
                    resident.push(key);
                }
            }
        }
        resident
    }

    /// Transition a record from `Loading` to `Loaded`. Returns `false`
    /// when the record is gone or no longer loading (late result after
    /// cancel or unregister).
    pub fn mark_loaded(&mut self, key: GeometryKey, bytes: usize, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(&key) else {
            return false;
        };
        if record.state != GeometryState::Loading {
            return false;
        }
        record.state = GeometryState::Loaded;
        record.loaded_at = Some(now);
        record.visible = true;
        record.resident_bytes = bytes;
        self.resident_bytes += bytes;
        true
    }

    /// Revert a `Loading` record to `Unloaded` (failed or cancelled
    /// load); the geometry stays eligible for retry.
    pub fn revert_loading(&mut self, key: GeometryKey) -> bool {
        match self.records.get_mut(&key) {
            Some(record) if record.state == GeometryState::Loading => {
                record.state = GeometryState::Unloaded;
                true
            }
            _ => false,
        }
    }

    /// Pin or unpin a resident geometry. Pinned (`Static`) records are
    /// immune to eviction. Returns `false` if the record is not
    /// resident yet.
    pub fn set_static(&mut self, key: GeometryKey, active: bool) -> bool {
        let Some(record) = self.records.get_mut(&key) else {
            return false;
        };
        match (record.state, active) {
            (GeometryState::Loaded, true) => {
                record.state = GeometryState::Static;
                true
            }
            (GeometryState::Static, false) => {
                record.state = GeometryState::Loaded;
                true
            }
            (GeometryState::Static, true) | (GeometryState::Loaded, false) => true,
            _ => false,
        }
    }

    /// Apply one visibility snapshot to the record table.
    ///
    /// The four steps run in fixed order: seen bookkeeping and load
    /// marking, hide marking, the dual-clock eviction sweep, then the
    /// soft RAM budget. A key in this snapshot's seen set is never
    /// unloaded in the same cycle.
    pub fn on_visibility_update(
        &mut self,
        snapshot: &VisibilitySnapshot,
        frustum: Option<&Frustum>,
        now: Instant,
    ) -> VisibilityDelta {
        let mut delta = VisibilityDelta::default();

        // 1. Seen geometries: refresh the clock, start loads, reshow
        for &key in &snapshot.seen {
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            record.last_seen_at = Some(now);
            match record.state {
                GeometryState::Unloaded => {
                    if record.streams() {
                        record.state = GeometryState::Loading;
                        delta.to_load.push(key);
                    }
                }
                GeometryState::Loading => {}
                GeometryState::Loaded | GeometryState::Static => {
                    if !record.visible {
                        record.visible = true;
                        delta.to_show.push(key);
                    }
                }
            }
        }

        // 2. Residents that stopped being visible: hide, never unload
        // here. In-frustum ones are occluded, not culled.
        for (key, record) in &mut self.records {
            if snapshot.seen.contains(key) || !record.is_resident() || !record.visible {
                continue;
            }
            record.visible = false;
            delta.to_hide.push(*key);
            if frustum.is_some_and(|f| f.intersects_aabb(&record.world_bounds())) {
                delta.hidden_but_tracked.push(*key);
            }
        }

        // 3. Dual-clock sweep over loaded, non-static records
        for (key, record) in &mut self.records {
            if record.state != GeometryState::Loaded || snapshot.seen.contains(key) {
                continue;
            }
            let hidden_expired = record
                .last_seen_at
                .is_some_and(|t| now.duration_since(t) > self.policy.max_hidden_time);
            let lost_expired = record
                .loaded_at
                .is_some_and(|t| now.duration_since(t) > self.policy.max_lost_time);
            if hidden_expired || lost_expired {
                self.resident_bytes -= record.resident_bytes;
                record.state = GeometryState::Unloaded;
                record.visible = false;
                record.loaded_at = None;
                record.resident_bytes = 0;
                delta.to_unload.push(*key);
            }
        }

        // 3b. Soft RAM cap: stale-first until under budget
        if self.resident_bytes > self.policy.max_ram_budget {
            let mut candidates: Vec<(GeometryKey, Instant)> = self
                .records
                .iter()
                .filter(|&(key, record)| {
                    record.state == GeometryState::Loaded && !snapshot.seen.contains(key)
                })
                .map(|(&key, record)| (key, record.last_seen_at.unwrap_or(now)))
                .collect();
            candidates.sort_by_key(|&(_, seen_at)| seen_at);

            for (key, _) in candidates {
                if self.resident_bytes <= self.policy.max_ram_budget {
                    break;
                }
                let record = self.records.get_mut(&key).expect("candidate came from table");
                self.resident_bytes -= record.resident_bytes;
                record.state = GeometryState::Unloaded;
                record.visible = false;
                record.loaded_at = None;
                record.resident_bytes = 0;
                delta.to_unload.push(key);
            }
            if self.resident_bytes > self.policy.max_ram_budget {
                log::debug!(
                    "resident bytes {} still over budget {} after sweep",
                    self.resident_bytes,
                    self.policy.max_ram_budget
                );
            }
        }

        delta
    }
}
