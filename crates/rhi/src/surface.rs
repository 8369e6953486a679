//! Window surface ownership.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// RAII wrapper for a Vulkan surface.
///
/// The instance that created the surface must outlive it.
pub struct Surface {
    handle: vk::SurfaceKHR,
    loader: ash::khr::surface::Instance,
}

impl Surface {
    /// Create a surface for a native window.
    ///
    /// # Safety
    ///
    /// The window behind `window` must stay alive until the surface is dropped.
    pub unsafe fn new(
        instance: &Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> RhiResult<Self> {
        if !instance.supports_surfaces() {
            return Err(RhiError::SurfaceError(
                "instance was created without surface extensions".into(),
            ));
        }

        let handle = unsafe {
            ash_window::create_surface(instance.entry(), instance.handle(), display, window, None)
        }
        .map_err(|e| RhiError::SurfaceError(format!("failed to create surface: {e}")))?;
        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());

        tracing::info!("Vulkan surface created");
        Ok(Self { handle, loader })
    }

    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    #[inline]
    pub fn loader(&self) -> &ash::khr::surface::Instance {
        &self.loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
        tracing::debug!("Vulkan surface destroyed");
    }
}
