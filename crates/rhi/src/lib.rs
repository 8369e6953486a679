//! Render hardware interface.
//!
//! Everything that talks to the GPU lives here:
//! - the [`GpuBackend`] seam with a Vulkan and a headless implementation
//! - instance, physical/logical device and surface setup
//! - GPU resources, command recordings and descriptor layouts
//! - the render pass, pipeline and shader caches
//! - the swapchain and the frame-in-flight [`SyncRing`]
//!
//! [`GpuBackend`]: backend::GpuBackend
//! [`SyncRing`]: sync::SyncRing

mod error;

pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod headless;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod render_pass;
pub mod resource;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vertex;
pub mod vulkan;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
