//! Fixed uniform blocks shared by every shader.
//!
//! - [`CameraUniforms`] is what a camera pushes into the materials of the
//!   drawables it renders, by property name
//! - [`DrawUniforms`] is the per-draw block at set 1, binding 0
//!
//! # Per-draw block layout (std140)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 64   | world |
//! | 64     | 64   | normal_matrix |
//!
//! # Example
//!
//! ```
//! use kiln_resources::ubo::DrawUniforms;
//! use glam::{Mat4, Vec3};
//!
//! let draw = DrawUniforms::new(Mat4::from_translation(Vec3::X));
//! assert_eq!(bytemuck::bytes_of(&draw).len(), DrawUniforms::size());
//! ```

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Material property names a camera writes.
pub const VIEW_PROPERTY: &str = "view";
pub const PROJECTION_PROPERTY: &str = "projection";
pub const VIEW_PROJECTION_PROPERTY: &str = "view_projection";
pub const CAMERA_POSITION_PROPERTY: &str = "camera_position";

/// View state a camera applies to the materials it draws.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CameraUniforms {
    pub view: Mat4,
    pub projection: Mat4,
    /// `projection * view`, precomputed.
    pub view_projection: Mat4,
    pub camera_position: Vec3,
}

impl CameraUniforms {
    #[inline]
    pub fn new(view: Mat4, projection: Mat4, camera_position: Vec3) -> Self {
        Self {
            view,
            projection,
            view_projection: projection * view,
            camera_position,
        }
    }
}

/// Per-draw uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DrawUniforms {
    /// Object to world transform.
    pub world: Mat4,
    /// Inverse transpose of `world`; only the upper 3x3 is meaningful.
    pub normal_matrix: Mat4,
}

impl DrawUniforms {
    #[inline]
    pub fn new(world: Mat4) -> Self {
        Self {
            world,
            normal_matrix: normal_matrix(world),
        }
    }

    #[inline]
    pub const fn size() -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Inverse transpose of `model`, or identity when `model` is singular.
pub fn normal_matrix(model: Mat4) -> Mat4 {
    const EPSILON: f32 = 1e-6;
    if model.determinant().abs() < EPSILON {
        Mat4::IDENTITY
    } else {
        model.inverse().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_uniforms_size() {
        assert_eq!(DrawUniforms::size(), 128);
    }

    #[test]
    fn test_view_projection_is_premultiplied() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(45.0_f32.to_radians(), 1.0, 0.1, 100.0);
        let camera = CameraUniforms::new(view, projection, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(camera.view_projection, projection * view);
    }

    #[test]
    fn test_normal_matrix_with_scale() {
        let model = Mat4::from_scale(Vec3::new(1.0, 2.0, 1.0));
        assert_eq!(DrawUniforms::new(model).normal_matrix, model.inverse().transpose());
    }

    #[test]
    fn test_singular_world_falls_back_to_identity() {
        let draw = DrawUniforms::new(Mat4::from_scale(Vec3::ZERO));
        assert_eq!(draw.normal_matrix, Mat4::IDENTITY);
    }
}
