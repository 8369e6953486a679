//! View and projection math for cameras.

use glam::{Mat4, Vec3};

/// How a camera projects the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// `fov_y` is the vertical field of view in degrees.
    Perspective { fov_y: f32, near: f32, far: f32 },
    /// `size` is half the vertical extent of the view volume.
    Orthographic { size: f32, near: f32, far: f32 },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: 60.0,
            near: 0.3,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn near(&self) -> f32 {
        match *self {
            Projection::Perspective { near, .. } | Projection::Orthographic { near, .. } => near,
        }
    }

    pub fn far(&self) -> f32 {
        match *self {
            Projection::Perspective { far, .. } | Projection::Orthographic { far, .. } => far,
        }
    }

    pub fn is_orthographic(&self) -> bool {
        matches!(self, Projection::Orthographic { .. })
    }

    /// Projection matrix for `aspect` (width / height), with the Y axis
    /// flipped for Vulkan clip space.
    pub fn matrix(&self, aspect: f32) -> Mat4 {
        let aspect = if aspect.is_finite() && aspect > 0.0 {
            aspect
        } else {
            1.0
        };
        let mut proj = match *self {
            Projection::Perspective { fov_y, near, far } => {
                Mat4::perspective_rh(fov_y.to_radians(), aspect, near, far)
            }
            Projection::Orthographic { size, near, far } => {
                let half_width = size * aspect;
                Mat4::orthographic_rh(-half_width, half_width, -size, size, near, far)
            }
        };
        proj.y_axis.y *= -1.0;
        proj
    }
}

/// View matrix of a camera placed by `camera_world`.
pub fn view_matrix(camera_world: Mat4) -> Mat4 {
    camera_world.inverse()
}

/// Left or right eye of a stereo camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    /// View matrix for this eye, offset half of `separation` along the
    /// camera's right axis.
    pub fn view_matrix(self, view: Mat4, separation: f32) -> Mat4 {
        let offset = match self {
            Eye::Left => separation * 0.5,
            Eye::Right => -separation * 0.5,
        };
        Mat4::from_translation(Vec3::new(offset, 0.0, 0.0)) * view
    }
}
