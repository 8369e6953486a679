//! Transforms and the world-matrix contract the renderer pulls from.
//!
//! The renderer never owns scene objects. A drawable registered with a camera
//! holds a [`TransformSource`] and reads its world matrix once per update.
//! [`SharedTransform`] is the stock source: a transform behind a lock that
//! the owning side mutates freely, optionally parented to another one.
//!
//! # Example
//!
//! ```
//! use kiln_scene::{SharedTransform, Transform, TransformSource};
//! use glam::Vec3;
//!
//! let parent = SharedTransform::new(Transform::new().with_position(Vec3::new(1.0, 0.0, 0.0)));
//! let child = SharedTransform::new(Transform::new().with_position(Vec3::new(0.0, 1.0, 0.0)))
//!     .with_parent(parent.clone());
//!
//! let world = child.world_matrix();
//! assert!(world.w_axis.truncate().abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-6));
//!
//! parent.update(|t| t.position.x = 5.0);
//! assert!((child.world_matrix().w_axis.x - 5.0).abs() < 1e-6);
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use glam::{Mat3, Mat4, Quat, Vec3};

/// Position, rotation and scale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Create a new transform at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Inverse-transpose of the upper 3x3, for transforming normals.
    ///
    /// Falls back to identity for a degenerate (zero-scale) transform.
    pub fn normal_matrix(&self) -> Mat4 {
        let m = Mat3::from_mat4(self.local_matrix());
        if m.determinant().abs() < f32::EPSILON {
            return Mat4::IDENTITY;
        }
        Mat4::from_mat3(m.inverse().transpose())
    }

    /// Rotate so that -Z points at `target`.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = target - self.position;
        if forward.length_squared() <= f32::EPSILON {
            return;
        }
        self.rotation = Quat::from_mat4(&Mat4::look_to_rh(Vec3::ZERO, forward.normalize(), up))
            .inverse();
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }
}

/// Anything that can report a world matrix when the renderer asks.
pub trait TransformSource: Send + Sync {
    fn world_matrix(&self) -> Mat4;
}

impl TransformSource for Mat4 {
    fn world_matrix(&self) -> Mat4 {
        *self
    }
}

impl TransformSource for Transform {
    fn world_matrix(&self) -> Mat4 {
        self.local_matrix()
    }
}

/// A transform shared between the scene and the renderer.
#[derive(Clone, Debug, Default)]
pub struct SharedTransform {
    local: Arc<RwLock<Transform>>,
    parent: Option<Box<SharedTransform>>,
}

impl SharedTransform {
    pub fn new(transform: Transform) -> Self {
        Self {
            local: Arc::new(RwLock::new(transform)),
            parent: None,
        }
    }

    /// Make this transform relative to `parent`.
    pub fn with_parent(mut self, parent: SharedTransform) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Snapshot of the local transform.
    pub fn get(&self) -> Transform {
        *self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, transform: Transform) {
        *self.local.write().unwrap_or_else(PoisonError::into_inner) = transform;
    }

    /// Mutate the local transform in place.
    pub fn update(&self, f: impl FnOnce(&mut Transform)) {
        f(&mut self.local.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl TransformSource for SharedTransform {
    fn world_matrix(&self) -> Mat4 {
        let local = self.get().local_matrix();
        match &self.parent {
            Some(parent) => parent.world_matrix() * local,
            None => local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq_vec3(a: Vec3, b: Vec3) -> bool {
        a.abs_diff_eq(b, 1e-5)
    }

    #[test]
    fn test_transform_default() {
        let t = Transform::default();
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(t.rotation, Quat::IDENTITY);
        assert_eq!(t.scale, Vec3::ONE);
        assert_eq!(t.local_matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn test_normal_matrix_with_scale() {
        let t = Transform::new().with_scale(Vec3::new(2.0, 1.0, 1.0));
        let n = t.normal_matrix();
        assert!((n.x_axis.x - 0.5).abs() < 1e-6);
        assert!((n.y_axis.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normal_matrix_non_invertible() {
        let t = Transform::new().with_scale(Vec3::ZERO);
        assert_eq!(t.normal_matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn test_direction_vectors() {
        let t = Transform::new()
            .with_rotation(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2));
        assert!(approx_eq_vec3(t.forward(), Vec3::NEG_X));
        assert!(approx_eq_vec3(t.right(), Vec3::NEG_Z));
        assert!(approx_eq_vec3(t.up(), Vec3::Y));
    }

    #[test]
    fn test_look_at() {
        let mut t = Transform::new().with_position(Vec3::new(0.0, 0.0, 5.0));
        t.look_at(Vec3::ZERO, Vec3::Y);
        assert!(approx_eq_vec3(t.forward(), Vec3::NEG_Z));

        t.look_at(Vec3::new(10.0, 0.0, 5.0), Vec3::Y);
        assert!(approx_eq_vec3(t.forward(), Vec3::X));
    }

    #[test]
    fn test_world_matrix_with_parent_scale() {
        let parent = SharedTransform::new(Transform::new().with_scale(Vec3::splat(2.0)));
        let child = SharedTransform::new(Transform::new().with_position(Vec3::new(1.0, 0.0, 0.0)))
            .with_parent(parent);
        let world = child.world_matrix();
        assert!(approx_eq_vec3(world.w_axis.truncate(), Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn test_world_matrix_nested_hierarchy() {
        let root = SharedTransform::new(Transform::new().with_position(Vec3::X));
        let middle =
            SharedTransform::new(Transform::new().with_position(Vec3::Y)).with_parent(root.clone());
        let leaf = SharedTransform::new(Transform::new().with_position(Vec3::Z)).with_parent(middle);

        assert!(approx_eq_vec3(leaf.world_matrix().w_axis.truncate(), Vec3::ONE));

        root.set(Transform::new());
        assert!(approx_eq_vec3(
            leaf.world_matrix().w_axis.truncate(),
            Vec3::new(0.0, 1.0, 1.0)
        ));
    }

    #[test]
    fn test_shared_update_is_visible_to_clones() {
        let shared = SharedTransform::new(Transform::new());
        let renderer_side: Box<dyn TransformSource> = Box::new(shared.clone());
        shared.update(|t| t.position = Vec3::new(3.0, 0.0, 0.0));
        assert!((renderer_side.world_matrix().w_axis.x - 3.0).abs() < 1e-6);
    }
}
