//! CPU-side mesh data and primitive generators.
//!
//! A [`MeshData`] is what the asset side hands to the renderer: interleaved
//! [`Vertex`] values plus indices, already validated. Index width is chosen
//! from the vertex count so small meshes upload 16-bit indices.

use glam::{Vec2, Vec3, Vec4};
use kiln_rhi::command::IndexType;
use kiln_rhi::vertex::Vertex;

use crate::error::{ResourceError, ResourceResult};

/// Index list in its upload width.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Indices {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Indices {
    pub fn len(&self) -> usize {
        match self {
            Self::U16(indices) => indices.len(),
            Self::U32(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_type(&self) -> IndexType {
        match self {
            Self::U16(_) => IndexType::U16,
            Self::U32(_) => IndexType::U32,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::U16(indices) => bytemuck::cast_slice(indices),
            Self::U32(indices) => bytemuck::cast_slice(indices),
        }
    }
}

/// Validated vertex and index data for one mesh.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshData {
    label: String,
    vertices: Vec<Vertex>,
    indices: Indices,
}

impl MeshData {
    /// Build a mesh, checking every index against the vertex count.
    pub fn new(
        label: impl Into<String>,
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
    ) -> ResourceResult<Self> {
        let label = label.into();
        if vertices.is_empty() || indices.is_empty() {
            return Err(ResourceError::EmptyMesh(label));
        }
        if let Some(&index) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(ResourceError::IndexOutOfRange {
                index,
                vertex_count: vertices.len(),
            });
        }

        let indices = if vertices.len() <= u16::MAX as usize + 1 {
            Indices::U16(indices.into_iter().map(|i| i as u16).collect())
        } else {
            Indices::U32(indices)
        };

        Ok(Self {
            label,
            vertices,
            indices,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &Indices {
        &self.indices
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        self.indices.as_bytes()
    }

    /// Axis-aligned bounds as `(min, max)`.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        self.vertices.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), v| {
                let p = Vec3::from_array(v.position);
                (min.min(p), max.max(p))
            },
        )
    }

    /// Set every vertex color.
    pub fn with_color(mut self, color: Vec4) -> Self {
        for vertex in &mut self.vertices {
            vertex.color = color.to_array();
        }
        self
    }

    /// Axis-aligned cube centered on the origin, four vertices per face.
    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up) in faces {
            let base = vertices.len() as u32;
            vertices.extend(face(normal * h, normal, up, h));
            indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self {
            label: "cube".into(),
            vertices,
            indices: Indices::U16(indices.into_iter().map(|i| i as u16).collect()),
        }
    }

    /// Unit quad in the XY plane facing +Z.
    pub fn quad(size: f32) -> Self {
        let h = size * 0.5;
        Self {
            label: "quad".into(),
            vertices: face(Vec3::ZERO, Vec3::Z, Vec3::Y, h).to_vec(),
            indices: Indices::U16(vec![0, 1, 2, 0, 2, 3]),
        }
    }
}

/// Four counter-clockwise vertices of a square facing `normal`.
fn face(center: Vec3, normal: Vec3, up: Vec3, h: f32) -> [Vertex; 4] {
    let right = up.cross(normal);
    let corners = [
        (-1.0, -1.0, Vec2::new(0.0, 1.0)),
        (1.0, -1.0, Vec2::new(1.0, 1.0)),
        (1.0, 1.0, Vec2::new(1.0, 0.0)),
        (-1.0, 1.0, Vec2::new(0.0, 0.0)),
    ];
    corners.map(|(x, y, uv)| {
        let mut vertex = Vertex::new(center + right * (x * h) + up * (y * h), uv, normal);
        vertex.tangent = right.extend(1.0).to_array();
        vertex
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_counts() {
        let cube = MeshData::cube(2.0);
        assert_eq!(cube.vertices().len(), 24);
        assert_eq!(cube.index_count(), 36);
        assert_eq!(cube.indices().index_type(), IndexType::U16);
        assert_eq!(cube.index_bytes().len(), 72);
        let (min, max) = cube.bounds();
        assert_eq!(min, Vec3::splat(-1.0));
        assert_eq!(max, Vec3::splat(1.0));
    }

    #[test]
    fn test_cube_faces_wind_outward() {
        let cube = MeshData::cube(1.0);
        let Indices::U16(indices) = cube.indices() else {
            panic!("cube uses 16-bit indices");
        };
        for tri in indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]]
                .map(|i| Vec3::from_array(cube.vertices()[i as usize].position));
            let normal = Vec3::from_array(cube.vertices()[tri[0] as usize].normal);
            assert!((b - a).cross(c - a).dot(normal) > 0.0);
        }
    }

    #[test]
    fn test_quad_faces_z() {
        let quad = MeshData::quad(1.0);
        assert_eq!(quad.vertices().len(), 4);
        assert!(quad.vertices().iter().all(|v| v.normal == [0.0, 0.0, 1.0]));
        assert_eq!(quad.vertex_bytes().len(), 4 * Vertex::stride() as usize);
    }

    #[test]
    fn test_rejects_out_of_range_index() {
        let vertices = vec![Vertex::default(); 3];
        let err = MeshData::new("tri", vertices, vec![0, 1, 3]).unwrap_err();
        assert!(matches!(
            err,
            ResourceError::IndexOutOfRange {
                index: 3,
                vertex_count: 3
            }
        ));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            MeshData::new("none", Vec::new(), vec![0]),
            Err(ResourceError::EmptyMesh(_))
        ));
    }

    #[test]
    fn test_large_mesh_uses_u32() {
        let count = u16::MAX as usize + 2;
        let vertices = vec![Vertex::default(); count];
        let mesh = MeshData::new("big", vertices, vec![0, 1, (count - 1) as u32]).unwrap();
        assert_eq!(mesh.indices().index_type(), IndexType::U32);
    }

    #[test]
    fn test_with_color() {
        let quad = MeshData::quad(1.0).with_color(Vec4::new(1.0, 0.0, 0.0, 1.0));
        assert!(quad.vertices().iter().all(|v| v.color == [1.0, 0.0, 0.0, 1.0]));
    }
}
