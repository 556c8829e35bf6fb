//! Manifest types describing a tiled model before any geometry is loaded
//!
//! A model registers with a list of assets (instance placements) and a
//! list of geometries (tiles). Bounding boxes and transforms use the
//! flat float-array wire forms produced by the tiling pipeline.

use serde::{Deserialize, Serialize};

use crate::core::types::Mat4;
use crate::math::Aabb;
use crate::model::GeometryId;

/// One streamable geometry tile of a model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamedGeometry {
    /// Unique id within the owning model
    pub id: GeometryId,
    /// `[min_x, min_y, min_z, max_x, max_y, max_z]`
    #[serde(rename = "boundingBox")]
    pub bounding_box: [f32; 6],
    /// Affects triangulation choice during decode; passed through opaquely
    #[serde(rename = "hasHoles")]
    pub has_holes: bool,
    /// Tile file holding the binary payload. Geometries without a file
    /// are embedded in the global data file and never streamed.
    #[serde(rename = "geometryFile", default, skip_serializing_if = "Option::is_none")]
    pub geometry_file: Option<String>,
}

impl StreamedGeometry {
    pub fn bounds(&self) -> Aabb {
        Aabb::from_slice(&self.bounding_box)
    }
}

/// Reference from an asset to one of its geometries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetGeometryRef {
    #[serde(rename = "geometryID")]
    pub geometry_id: GeometryId,
    /// Column-major 4x4 placement matrix
    pub transformation: [f32; 16],
    /// RGBA in `0..=1`
    pub color: [f32; 4],
}

impl AssetGeometryRef {
    pub fn transform(&self) -> Mat4 {
        Mat4::from_cols_array(&self.transformation)
    }
}

/// An instance placement referencing one or more geometries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamedAsset {
    pub id: u32,
    pub geometries: Vec<AssetGeometryRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    #[test]
    fn test_geometry_bounds() {
        let geometry = StreamedGeometry {
            id: 7,
            bounding_box: [0.0, 0.0, 0.0, 2.0, 4.0, 6.0],
            has_holes: false,
            geometry_file: Some("tile-7.bin".into()),
        };
        let bounds = geometry.bounds();
        assert_eq!(bounds.min, Vec3::ZERO);
        assert_eq!(bounds.max, Vec3::new(2.0, 4.0, 6.0));
    }

    #[test]
    fn test_manifest_json_round_trip() {
        let asset = StreamedAsset {
            id: 1,
            geometries: vec![AssetGeometryRef {
                geometry_id: 7,
                transformation: Mat4::IDENTITY.to_cols_array(),
                color: [0.5, 0.5, 0.5, 1.0],
            }],
        };
        let json = serde_json::to_string(&asset).unwrap();
        assert!(json.contains("\"geometryID\":7"));
        let back: StreamedAsset = serde_json::from_str(&json).unwrap();
        assert_eq!(back.geometries[0].geometry_id, 7);
        assert_eq!(back.geometries[0].transform(), Mat4::IDENTITY);
    }

    #[test]
    fn test_geometry_file_optional() {
        let json = r#"{"id":3,"boundingBox":[0,0,0,1,1,1],"hasHoles":true}"#;
        let geometry: StreamedGeometry = serde_json::from_str(json).unwrap();
        assert!(geometry.has_holes);
        assert!(geometry.geometry_file.is_none());
    }
}
