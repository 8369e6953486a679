//! CPU-side asset data handed to the renderer.
//!
//! Decoding lives here so the rendering core only ever sees validated bytes:
//! - [`MeshData`] with primitive generators
//! - [`ImageData`] decoded to RGBA8 through the `image` crate
//! - fixed uniform block layouts in [`ubo`]

mod error;
pub mod image_data;
pub mod mesh;
pub mod ubo;

pub use error::{ResourceError, ResourceResult};
pub use image_data::ImageData;
pub use mesh::{Indices, MeshData};
