//! The narrow scene contract the renderer consumes.
//!
//! - [`Transform`] and the [`TransformSource`] world-matrix provider
//! - [`Projection`] and view math for cameras, including stereo eyes

pub mod camera;
pub mod transform;

pub use camera::{Eye, Projection, view_matrix};
pub use transform::{SharedTransform, Transform, TransformSource};
