//! Window shell for the kiln renderer.
//!
//! Owns the winit window, hands out the raw handles the Vulkan backend needs
//! for surface creation, and turns window events into the renderer's
//! lifecycle hooks.

mod lifecycle;
mod window;

pub use lifecycle::{Lifecycle, lifecycle};
pub use window::Window;

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
