//! Decoded, render-ready fragments handed to the external scene

use crate::core::types::Mat4;
use crate::math::Aabb;

/// Primitive topology of a decoded mesh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshTopology {
    Triangles,
    /// Polyline geometry (alignments, grid lines)
    Lines,
}

/// Raw mesh buffers produced by the tile decoder
#[derive(Clone, Debug)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    pub topology: MeshTopology,
}

impl MeshData {
    /// Approximate in-memory footprint of the buffers
    pub fn byte_size(&self) -> usize {
        self.positions.len() * 12 + self.normals.len() * 12 + self.indices.len() * 4
    }
}

/// One placement of a fragment's mesh
#[derive(Clone, Copy, Debug)]
pub struct FragmentInstance {
    pub transform: Mat4,
    pub color: [f32; 4],
}

/// A decoded mesh plus its instance transforms, ready for the renderer
#[derive(Clone, Debug)]
pub struct DecodedFragment {
    pub mesh: MeshData,
    pub instances: Vec<FragmentInstance>,
    pub bounding_box: Aabb,
}

impl DecodedFragment {
    /// Approximate resident memory cost, used for the soft RAM budget
    pub fn byte_size(&self) -> usize {
        self.mesh.byte_size() + self.instances.len() * std::mem::size_of::<FragmentInstance>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    #[test]
    fn test_byte_size_counts_buffers_and_instances() {
        let fragment = DecodedFragment {
            mesh: MeshData {
                positions: vec![[0.0; 3]; 3],
                normals: vec![[0.0; 3]; 3],
                indices: vec![0, 1, 2],
                topology: MeshTopology::Triangles,
            },
            instances: vec![FragmentInstance {
                transform: Mat4::IDENTITY,
                color: [1.0; 4],
            }],
            bounding_box: Aabb::new(Vec3::ZERO, Vec3::ONE),
        };
        let mesh_bytes = 3 * 12 + 3 * 12 + 3 * 4;
        assert_eq!(
            fragment.byte_size(),
            mesh_bytes + std::mem::size_of::<FragmentInstance>()
        );
    }
}
