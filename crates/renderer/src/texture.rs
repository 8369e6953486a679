//! Sampled textures and off-screen render targets.
//!
//! A multisampled target renders into transient color and depth images and
//! resolves color into the sampled texture at the end of each pass.

use std::sync::Arc;

use kiln_resources::ImageData;
use kiln_rhi::backend::GpuBackend;
use kiln_rhi::render_pass::TargetAttachments;
use kiln_rhi::resource::{GpuImage, ImageDesc, SamplerDesc, TextureFormat};
use kiln_rhi::swapchain::DEPTH_FORMAT;
use kiln_rhi::{RhiResult, vk};
use tracing::{debug, warn};

/// An image view plus the sampler used to read it.
pub struct Texture {
    backend: Arc<dyn GpuBackend>,
    image: GpuImage,
    sampler: vk::Sampler,
}

impl Texture {
    /// Wrap an existing image.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        image: GpuImage,
        sampler: SamplerDesc,
    ) -> RhiResult<Self> {
        let sampler = backend.create_sampler(&sampler)?;
        Ok(Self {
            backend,
            image,
            sampler,
        })
    }

    /// Upload decoded pixels.
    pub fn from_image(
        backend: Arc<dyn GpuBackend>,
        data: &ImageData,
        sampler: SamplerDesc,
    ) -> RhiResult<Self> {
        let image = GpuImage::with_pixels(
            backend.clone(),
            data.format(),
            data.width(),
            data.height(),
            data.pixels(),
        )?;
        debug!("Uploaded texture {}x{}", data.width(), data.height());
        Self::new(backend, image, sampler)
    }

    /// 1x1 opaque white, bound when a material has no texture.
    pub fn white(backend: Arc<dyn GpuBackend>) -> RhiResult<Self> {
        let image =
            GpuImage::with_pixels(backend.clone(), TextureFormat::Rgba8Unorm, 1, 1, &[255; 4])?;
        Self::new(backend, image, SamplerDesc::default())
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    #[inline]
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.backend.destroy_sampler(self.sampler);
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image)
            .field("sampler", &self.sampler)
            .finish()
    }
}

/// Parameters of an off-screen target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub depth: bool,
    /// Two layers make the target usable by a stereo camera.
    pub layers: u32,
    /// Samples per pixel. Values above 1 enable multisampling.
    pub samples: u32,
}

impl RenderTargetDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            depth: true,
            layers: 1,
            samples: 1,
        }
    }

    /// Request `samples` per pixel.
    ///
    /// # Arguments
    ///
    /// * `samples` - Requested count. It is rounded down to a power of two
    ///   and clamped to what the device supports when the target is created.
    ///
    /// # Example
    ///
    /// ```
    /// use kiln_renderer::texture::RenderTargetDesc;
    ///
    /// let desc = RenderTargetDesc::new(512, 512).with_samples(4);
    /// assert_eq!(desc.samples, 4);
    /// ```
    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn stereo(mut self) -> Self {
        self.layers = 2;
        self
    }

    pub fn without_depth(mut self) -> Self {
        self.depth = false;
        self
    }
}

/// Color (and optional depth) images a camera renders into and a later
/// camera can sample.
pub struct RenderTarget {
    id: u64,
    color: Arc<Texture>,
    depth: Option<GpuImage>,
    /// Multisampled color, resolved into `color`.
    msaa: Option<GpuImage>,
    desc: RenderTargetDesc,
}

/// Largest supported power of two not above `requested`.
fn supported_samples(requested: u32, max: u32) -> u32 {
    let limit = requested.min(max).max(1);
    1 << limit.ilog2()
}

impl RenderTarget {
    /// `id` must be unique among live targets; it keys the render pass.
    pub(crate) fn new(
        backend: Arc<dyn GpuBackend>,
        id: u64,
        desc: RenderTargetDesc,
    ) -> RhiResult<Self> {
        let mut desc = desc;
        let samples = supported_samples(desc.samples, backend.max_sample_count());
        if samples != desc.samples {
            warn!(
                "Render target {}: {} samples unsupported, using {}",
                id, desc.samples, samples
            );
            desc.samples = samples;
        }

        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };
        let format = desc.format.to_vk();
        let color_image = GpuImage::new(
            backend.clone(),
            ImageDesc::color_target(format, extent, desc.layers),
        )?;
        let msaa = if samples > 1 {
            Some(GpuImage::new(
                backend.clone(),
                ImageDesc::multisampled_color(format, extent, desc.layers, samples),
            )?)
        } else {
            None
        };
        let depth = if desc.depth {
            Some(GpuImage::new(
                backend.clone(),
                ImageDesc::depth_target(DEPTH_FORMAT, extent, desc.layers).with_samples(samples),
            )?)
        } else {
            None
        };
        let color = Arc::new(Texture::new(backend, color_image, SamplerDesc::default())?);
        debug!(
            "Render target {} created: {}x{}x{}, {}x samples",
            id, desc.width, desc.height, desc.layers, samples
        );
        Ok(Self {
            id,
            color,
            depth,
            msaa,
            desc,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The color attachment as a texture for materials.
    pub fn texture(&self) -> Arc<Texture> {
        self.color.clone()
    }

    pub fn color_format(&self) -> vk::Format {
        self.desc.format.to_vk()
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth.as_ref().map(GpuImage::format)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.color.extent()
    }

    pub fn layers(&self) -> u32 {
        self.desc.layers
    }

    /// Samples per pixel actually in use, after clamping to the device.
    pub fn samples(&self) -> u32 {
        self.desc.samples
    }

    /// Views for the framebuffer. A multisampled target renders into its
    /// transient color image and resolves into the sampled texture.
    pub fn attachments(&self) -> TargetAttachments {
        let texture = self.color.view();
        let (color, resolve) = match &self.msaa {
            Some(msaa) => (msaa.view(), Some(texture)),
            None => (texture, None),
        };
        TargetAttachments {
            color_views: vec![color],
            depth_view: self.depth.as_ref().map(GpuImage::view),
            resolve_view: resolve,
            extent: self.extent(),
        }
    }
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_rhi::headless::{HeadlessBackend, HeadlessEvent};

    #[test]
    fn test_texture_upload_and_release() {
        let backend = HeadlessBackend::new();
        let data = ImageData::solid(4, 4, [10, 20, 30, 255]).unwrap();
        let texture = Texture::from_image(backend.clone(), &data, SamplerDesc::default()).unwrap();
        assert_eq!(texture.extent().width, 4);
        assert_eq!(backend.stats().images_uploaded, 1);
        drop(texture);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_render_target_attachments() {
        let backend = HeadlessBackend::new();
        let target = RenderTarget::new(backend.clone(), 7, RenderTargetDesc::new(64, 32)).unwrap();
        let attachments = target.attachments();
        assert_eq!(attachments.color_views.len(), 1);
        assert!(attachments.depth_view.is_some());
        assert_eq!(attachments.extent.width, 64);
        assert_eq!(target.depth_format(), Some(DEPTH_FORMAT));
        assert_eq!(target.id(), 7);
    }

    #[test]
    fn test_render_target_without_depth() {
        let backend = HeadlessBackend::new();
        let target = RenderTarget::new(
            backend.clone(),
            1,
            RenderTargetDesc::new(8, 8).without_depth().stereo(),
        )
        .unwrap();
        assert!(target.attachments().depth_view.is_none());
        assert_eq!(target.layers(), 2);
    }

    #[test]
    fn test_multisampled_target_resolves_into_texture() {
        let backend = HeadlessBackend::new();
        let target = RenderTarget::new(
            backend.clone(),
            3,
            RenderTargetDesc::new(16, 16).with_samples(4),
        )
        .unwrap();
        assert_eq!(target.samples(), 4);
        let attachments = target.attachments();
        assert_eq!(attachments.resolve_view, Some(target.texture().view()));
        assert_ne!(attachments.color_views[0], target.texture().view());
        assert!(attachments.depth_view.is_some());
        drop(target);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_sample_count_is_clamped() {
        let backend = HeadlessBackend::new();
        backend.set_max_sample_count(2);
        let target = RenderTarget::new(
            backend.clone(),
            4,
            RenderTargetDesc::new(8, 8).with_samples(8),
        )
        .unwrap();
        assert_eq!(target.samples(), 2);

        assert_eq!(supported_samples(6, 8), 4);
        assert_eq!(supported_samples(0, 8), 1);
        assert_eq!(supported_samples(4, 1), 1);

        let single = RenderTarget::new(backend, 5, RenderTargetDesc::new(8, 8)).unwrap();
        assert_eq!(single.samples(), 1);
        assert!(single.attachments().resolve_view.is_none());
    }

    #[test]
    fn test_target_texture_outlives_target() {
        let backend = HeadlessBackend::new();
        let target = RenderTarget::new(backend.clone(), 2, RenderTargetDesc::new(8, 8)).unwrap();
        let texture = target.texture();
        let view = texture.view();
        drop(target);
        assert!(!backend.events().contains(&HeadlessEvent::DestroyImageView(view)));
        drop(texture);
        assert_eq!(backend.live_objects(), 0);
    }
}
