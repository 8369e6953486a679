//! Camera orchestration on top of the RHI.
//!
//! This crate turns scene state into command buffers:
//! - [`RenderContext`] holds the device and every cache, passed explicitly
//! - materials, shader programs, textures and off-screen render targets
//! - the [`DrawableTable`] the scene fills and cameras reference by id
//! - [`Camera`] keeps one secondary command buffer per drawable
//! - [`FrameDriver`] aggregates cameras into primaries, submits and presents
//! - [`AssetLoader`] decodes on worker threads and uploads on the render thread

pub mod camera;
pub mod context;
pub mod drawable;
pub mod frame_driver;
pub mod loader;
pub mod material;
pub mod program;
pub mod release;
pub mod texture;

pub use camera::{Camera, CameraId, CameraState, SurfaceTarget, UpdateReport, ViewportRect};
pub use context::RenderContext;
pub use drawable::{Drawable, DrawableId, DrawableKind, DrawableTable, Geometry, InstanceData};
pub use frame_driver::{FrameDriver, FrameOutcome, FrameStats};
pub use loader::{AssetLoader, DrainReport, TaskId};
pub use material::{Material, MaterialId};
pub use program::{ProgramDesc, PropertyValue, ShaderProgram};
pub use texture::{RenderTarget, RenderTargetDesc, Texture};
