//! Per-geometry residency records
//!
//! One record exists per distinct geometry tile from registration until
//! its owning model is unregistered. Eviction only returns a record to
//! `Unloaded`; the metadata stays so the tile can be re-streamed.

use std::time::Instant;

use crate::core::types::Mat4;
use crate::math::Aabb;
use crate::model::GeometryKey;

/// Residency state of one geometry tile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryState {
    /// Not resident; eligible for loading when seen
    Unloaded,
    /// Exactly one outstanding load request exists
    Loading,
    /// Resident and owned by the eviction clocks
    Loaded,
    /// Pinned resident; only ever toggled shown/hidden
    Static,
}

/// How a geometry is placed in the scene. Consumed uniformly by the
/// cache; only the world-bounds computation differs per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    /// One placement
    Single,
    /// Shared mesh repeated under many placements
    Instanced { count: u32 },
    /// Polyline geometry (alignments, grid lines)
    Curve,
}

impl GeometryKind {
    pub fn from_placement_count(count: usize) -> Self {
        if count > 1 {
            GeometryKind::Instanced { count: count as u32 }
        } else {
            GeometryKind::Single
        }
    }
}

/// One record per distinct geometry tile within a model
#[derive(Clone, Debug)]
pub struct GeometryRecord {
    pub key: GeometryKey,
    /// Local-space bounds from the manifest
    pub bounds: Aabb,
    /// Placement transforms collected from every asset referencing this
    /// geometry
    pub placements: Vec<Mat4>,
    pub kind: GeometryKind,
    /// Passed through to the decoder; affects triangulation choice
    pub has_holes: bool,
    /// Tile file holding this geometry's payload, if it streams
    pub geometry_file: Option<String>,
    pub state: GeometryState,
    /// Last confirmed-visible cycle
    pub last_seen_at: Option<Instant>,
    /// When the record entered `Loaded`
    pub loaded_at: Option<Instant>,
    /// Whether the resident mesh is currently shown
    pub visible: bool,
    /// Approximate resident fragment size, 0 while unloaded
    pub resident_bytes: usize,
}

impl GeometryRecord {
    pub fn new(
        key: GeometryKey,
        bounds: Aabb,
        placements: Vec<Mat4>,
        has_holes: bool,
        geometry_file: Option<String>,
    ) -> Self {
        let kind = GeometryKind::from_placement_count(placements.len());
        Self {
            key,
            bounds,
            placements,
            kind,
            has_holes,
            geometry_file,
            state: GeometryState::Unloaded,
            last_seen_at: None,
            loaded_at: None,
            visible: false,
            resident_bytes: 0,
        }
    }

    /// World-space bounds used for projection sizing and the frustum
    /// test. Instanced geometry takes the union over all placements;
    /// single and curve geometry use their one placement.
    pub fn world_bounds(&self) -> Aabb {
        match self.kind {
            GeometryKind::Single | GeometryKind::Curve => match self.placements.first() {
                Some(transform) => self.bounds.transformed(transform),
                None => self.bounds,
            },
            GeometryKind::Instanced { .. } => {
                let mut merged: Option<Aabb> = None;
                for transform in &self.placements {
                    let bounds = self.bounds.transformed(transform);
                    merged = Some(match merged {
                        Some(acc) => acc.merged(&bounds),
                        None => bounds,
                    });
                }
                merged.unwrap_or(self.bounds)
            }
        }
    }

    /// Whether the record is resident (loaded or pinned)
    pub fn is_resident(&self) -> bool {
        matches!(self.state, GeometryState::Loaded | GeometryState::Static)
    }

    /// Whether the tile actually streams. Embedded geometries have no
    /// tile file and never enter the load pipeline.
    pub fn streams(&self) -> bool {
        self.geometry_file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    fn unit_bounds() -> Aabb {
        Aabb::new(Vec3::ZERO, Vec3::ONE)
    }

    #[test]
    fn test_kind_from_placements() {
        assert_eq!(GeometryKind::from_placement_count(0), GeometryKind::Single);
        assert_eq!(GeometryKind::from_placement_count(1), GeometryKind::Single);
        assert_eq!(
            GeometryKind::from_placement_count(3),
            GeometryKind::Instanced { count: 3 }
        );
    }

    #[test]
    fn test_world_bounds_single() {
        let record = GeometryRecord::new(
            GeometryKey::new(0, 1),
            unit_bounds(),
            vec![Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))],
            false,
            None,
        );
        assert_eq!(record.world_bounds().min, Vec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_world_bounds_instanced_union() {
        let record = GeometryRecord::new(
            GeometryKey::new(0, 1),
            unit_bounds(),
            vec![
                Mat4::IDENTITY,
                Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)),
            ],
            false,
            None,
        );
        let bounds = record.world_bounds();
        assert_eq!(bounds.min, Vec3::ZERO);
        assert_eq!(bounds.max, Vec3::new(11.0, 1.0, 1.0));
    }

    #[test]
    fn test_new_record_starts_unloaded() {
        let record = GeometryRecord::new(GeometryKey::new(0, 1), unit_bounds(), vec![], false, None);
        assert_eq!(record.state, GeometryState::Unloaded);
        assert!(!record.is_resident());
        assert!(record.last_seen_at.is_none());
        assert!(!record.streams());
    }
}
