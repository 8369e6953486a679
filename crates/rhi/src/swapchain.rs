//! Swapchain management.
//!
//! The [`Swapchain`] owns the presentable images' views and a depth buffer
//! sized to match. Presentable images themselves belong to the presentation
//! engine and are wrapped as borrowed [`GpuImage`]s, so dropping them only
//! destroys their views.
//!
//! Every (re)creation bumps [`Swapchain::generation`]. Render pass keys for
//! presentation targets carry the generation, so a resize always produces a
//! fresh render pass and framebuffer set.
//!
//! Fresh presentable images are in `UNDEFINED` layout. Nothing here
//! transitions them: an image may only be touched between acquire and
//! present, so the frame driver moves it when a pass first loads it.
//!
//! # Example
//!
//! ```no_run
//! use kiln_rhi::headless::HeadlessBackend;
//! use kiln_rhi::swapchain::{PresentPolicy, Swapchain};
//!
//! let backend = HeadlessBackend::new();
//! let mut swapchain = Swapchain::new(backend.clone(), 1280, 720, PresentPolicy::default())?;
//! backend.set_surface_extent(0, 0);
//! // A minimized window keeps the old swapchain.
//! assert!(!swapchain.recreate(0, 0)?);
//! # Ok::<(), kiln_rhi::RhiError>(())
//! ```

use std::sync::Arc;

use ash::vk;
use kiln_core::FrameConfig;
use tracing::{debug, info, warn};

use crate::backend::{GpuBackend, SurfaceSupport, SwapchainDesc};
use crate::error::{RhiError, RhiResult};
use crate::render_pass::TargetAttachments;
use crate::resource::{GpuImage, ImageDesc};

/// Depth format of the swapchain's depth buffer.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Presentation preferences.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentPolicy {
    /// Requested image count before clamping to the surface limits.
    pub desired_image_count: u32,
    /// Force the blocking FIFO mode.
    pub vsync: bool,
    /// Mobile targets always use FIFO.
    pub mobile: bool,
}

impl Default for PresentPolicy {
    fn default() -> Self {
        Self {
            desired_image_count: 3,
            vsync: false,
            mobile: false,
        }
    }
}

impl From<&FrameConfig> for PresentPolicy {
    fn from(config: &FrameConfig) -> Self {
        Self {
            desired_image_count: config.desired_image_count,
            vsync: config.vsync,
            mobile: config.mobile,
        }
    }
}

/// Presentable images plus a matching depth buffer.
pub struct Swapchain {
    backend: Arc<dyn GpuBackend>,
    swapchain: vk::SwapchainKHR,
    images: Vec<GpuImage>,
    depth: Option<GpuImage>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    policy: PresentPolicy,
    generation: u64,
}

impl Swapchain {
    /// Creates a swapchain for a `width` x `height` surface.
    ///
    /// # Arguments
    ///
    /// * `backend` - Device that owns the surface
    /// * `width`, `height` - Window size in pixels, used when the surface
    ///   leaves the extent to the application
    /// * `policy` - Image count and present mode preferences
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The surface reports no formats or present modes
    /// - The clamped extent is zero
    /// - Swapchain, view or depth buffer creation fails
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        width: u32,
        height: u32,
        policy: PresentPolicy,
    ) -> RhiResult<Self> {
        let mut swapchain = Self {
            backend,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            depth: None,
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            policy,
            generation: 0,
        };
        swapchain.build(width, height)?;
        Ok(swapchain)
    }

    fn surface_extent(&self, width: u32, height: u32) -> RhiResult<(SurfaceSupport, vk::Extent2D)> {
        let support = self.backend.surface_support()?;
        if !is_adequate(&support) {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }
        let extent = choose_extent(&support.capabilities, width, height);
        Ok((support, extent))
    }

    fn build(&mut self, width: u32, height: u32) -> RhiResult<()> {
        let (support, extent) = self.surface_extent(width, height)?;
        let caps = &support.capabilities;
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapchainError(format!(
                "surface extent is {}x{}",
                extent.width, extent.height
            )));
        }

        let desc = SwapchainDesc {
            image_count: determine_image_count(caps, self.policy.desired_image_count),
            format: choose_surface_format(&support.formats),
            extent,
            present_mode: choose_present_mode(&support.present_modes, self.policy),
            pre_transform: choose_transform(caps),
            composite_alpha: choose_composite_alpha(caps),
        };

        info!(
            "Creating swapchain: {}x{}, format {:?}, color space {:?}, present mode {:?}, {} images",
            extent.width,
            extent.height,
            desc.format.format,
            desc.format.color_space,
            desc.present_mode,
            desc.image_count
        );

        let old = self.swapchain;
        let (swapchain, raw_images) = self.backend.create_swapchain(&desc, old)?;
        if old != vk::SwapchainKHR::null() {
            self.backend.destroy_swapchain(old);
        }
        self.swapchain = swapchain;

        let color_desc = ImageDesc::color_target(desc.format.format, extent, 1);
        let mut images = Vec::with_capacity(raw_images.len());
        for image in raw_images {
            images.push(GpuImage::borrowed(self.backend.clone(), image, color_desc)?);
        }
        let depth = GpuImage::new(
            self.backend.clone(),
            ImageDesc::depth_target(DEPTH_FORMAT, extent, 1),
        )?;

        self.images = images;
        self.depth = Some(depth);
        self.format = desc.format;
        self.extent = extent;
        self.present_mode = desc.present_mode;
        self.generation += 1;

        info!(
            "Swapchain generation {} ready with {} images",
            self.generation,
            self.images.len()
        );
        Ok(())
    }

    /// Rebuild for a new surface size.
    ///
    /// Waits for the device to be idle, destroys the image views and the
    /// depth buffer, then creates the new swapchain from the old one.
    ///
    /// # Arguments
    ///
    /// * `width`, `height` - New window size in pixels
    ///
    /// # Returns
    ///
    /// `false` when the surface currently has a zero extent (a minimized
    /// window). The existing swapchain is left intact and the caller should
    /// try again later.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for the device, querying the surface or
    /// creating the new swapchain fails.
    pub fn recreate(&mut self, width: u32, height: u32) -> RhiResult<bool> {
        let (_, extent) = self.surface_extent(width, height)?;
        if extent.width == 0 || extent.height == 0 {
            debug!("Surface is {}x{}, keeping the current swapchain", extent.width, extent.height);
            return Ok(false);
        }

        self.backend.wait_idle()?;
        info!("Recreating swapchain for new size: {}x{}", width, height);

        self.images.clear();
        self.depth = None;
        self.build(width, height)?;
        Ok(true)
    }

    /// Next presentable image index and whether the swapchain is suboptimal.
    ///
    /// # Arguments
    ///
    /// * `semaphore` - Signaled when the image is ready to be rendered to
    ///
    /// # Errors
    ///
    /// [`RhiError::SwapchainOutOfDate`] when the surface changed; rebuild
    /// with [`Swapchain::recreate`]. Other errors come from the device.
    pub fn acquire_next(&self, semaphore: vk::Semaphore) -> RhiResult<(u32, bool)> {
        self.backend.acquire_next_image(self.swapchain, semaphore)
    }

    /// Raw swapchain handle, used for present.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Color format of the presentable images.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        DEPTH_FORMAT
    }

    /// Size of the presentable images, which may differ from the window
    /// size when the surface dictates its own extent.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Increments on every successful (re)creation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Presentable image `index` as returned by [`Swapchain::acquire_next`].
    pub fn image(&self, index: usize) -> Option<&GpuImage> {
        self.images.get(index)
    }

    /// View of the shared depth buffer, or a null handle while rebuilding.
    pub fn depth_view(&self) -> vk::ImageView {
        self.depth.as_ref().map(GpuImage::view).unwrap_or_default()
    }

    /// Color views (one framebuffer each) plus the shared depth view.
    pub fn attachments(&self) -> TargetAttachments {
        TargetAttachments {
            color_views: self.images.iter().map(GpuImage::view).collect(),
            depth_view: self.depth.as_ref().map(GpuImage::view),
            resolve_view: None,
            extent: self.extent,
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            warn!("wait_idle failed while destroying swapchain: {}", e);
        }
        self.images.clear();
        self.depth = None;
        if self.swapchain != vk::SwapchainKHR::null() {
            self.backend.destroy_swapchain(self.swapchain);
            info!(
                "Swapchain destroyed (was {}x{}, generation {})",
                self.extent.width, self.extent.height, self.generation
            );
        }
    }
}

fn is_adequate(support: &SurfaceSupport) -> bool {
    !support.formats.is_empty() && !support.present_modes.is_empty()
}

/// Prefers B8G8R8A8_SRGB, then B8G8R8A8_UNORM, both with SRGB_NONLINEAR.
/// Falls back to the first available format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let find = |format: vk::Format| {
        formats
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
    };

    if let Some(format) = find(vk::Format::B8G8R8A8_SRGB) {
        return format;
    }
    if let Some(format) = find(vk::Format::B8G8R8A8_UNORM) {
        warn!("Using fallback surface format: B8G8R8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }

    let first = formats.first().copied().unwrap_or(vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    });
    warn!("Using first available surface format: {:?}", first.format);
    first
}

/// MAILBOX when available and neither vsync nor a mobile target forces
/// FIFO. FIFO is always supported.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    policy: PresentPolicy,
) -> vk::PresentModeKHR {
    if !policy.vsync && !policy.mobile && present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        debug!("Selected MAILBOX present mode");
        return vk::PresentModeKHR::MAILBOX;
    }
    debug!("Selected FIFO present mode");
    vk::PresentModeKHR::FIFO
}

/// Uses the surface's current extent when defined, otherwise clamps the
/// requested size to the surface limits.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// `max(desired, min_image_count)`, clamped to `max_image_count` when the
/// surface sets one (0 means unlimited).
pub fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

fn choose_transform(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if capabilities
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| capabilities.supported_composite_alpha.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}
