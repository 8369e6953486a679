//! GPU images and buffers with a destruction contract.
//!
//! [`GpuImage`] and [`GpuBuffer`] own their device objects and release them on
//! drop through the backend that created them. An image marked
//! [`Ownership::Borrowed`] (a swapchain image) only releases its view: the
//! presentation engine owns the image itself.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};

/// How a buffer will be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    /// Per-instance vertex data.
    Instance,
    Staging,
}

impl BufferUsage {
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Vertex | Self::Instance => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            Self::Uniform => {
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            Self::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Every buffer kind is written from the CPU, so all are host visible.
    pub fn memory_location(self) -> MemoryLocation {
        MemoryLocation::CpuToGpu
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Index => "index",
            Self::Uniform => "uniform",
            Self::Instance => "instance",
            Self::Staging => "staging",
        }
    }
}

/// Pixel formats the engine knows how to create. This is the only place where
/// engine formats map to native ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R8Unorm,
    Rgba16Float,
    Depth32Float,
    Depth24Stencil8,
}

impl TextureFormat {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Depth32Float => vk::Format::D32_SFLOAT,
            Self::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb
            | Self::Depth32Float
            | Self::Depth24Stencil8 => 4,
            Self::Rgba16Float => 8,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24Stencil8)
    }
}

/// Whether the aspect of `format` is depth (and maybe stencil) or color.
pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM => vk::ImageAspectFlags::DEPTH,
        vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Parameters for a 2D image (optionally layered) and its view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    /// Samples per pixel; only attachments use more than one.
    pub samples: u32,
}

impl ImageDesc {
    /// A sampled texture that is filled by an upload.
    pub fn texture(format: TextureFormat, width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            layers: 1,
            format: format.to_vk(),
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            samples: 1,
        }
    }

    /// A color target that a later pass may sample.
    pub fn color_target(format: vk::Format, extent: vk::Extent2D, layers: u32) -> Self {
        Self {
            extent,
            layers,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            samples: 1,
        }
    }

    /// A multisampled color attachment. It is never sampled; a render pass
    /// resolves it into a [`color_target`](Self::color_target).
    pub fn multisampled_color(format: vk::Format, extent: vk::Extent2D, layers: u32, samples: u32) -> Self {
        Self {
            extent,
            layers,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            samples,
        }
    }

    pub fn depth_target(format: vk::Format, extent: vk::Extent2D, layers: u32) -> Self {
        Self {
            extent,
            layers,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            samples: 1,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// Layout a new image is moved to right after creation: the layout the
    /// render passes that load it expect. `None` for images that start
    /// undefined (uploaded textures, presentable images).
    pub fn resting_layout(&self) -> Option<vk::ImageLayout> {
        if self.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT) {
            Some(if self.usage.contains(vk::ImageUsageFlags::SAMPLED) {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            })
        } else if self
            .usage
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        } else {
            None
        }
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for(self.format)
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        if self.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    ClampToEdge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub address: AddressMode,
}

/// Whether dropping the resource destroys the underlying object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Memory and handle belong to us.
    Owned,
    /// The handle belongs to someone else (the presentation engine); only the
    /// view is ours.
    Borrowed,
}

/// A device image with its view.
pub struct GpuImage {
    backend: Arc<dyn GpuBackend>,
    image: vk::Image,
    view: vk::ImageView,
    desc: ImageDesc,
    ownership: Ownership,
}

impl GpuImage {
    /// Allocate an image and create its view.
    pub fn new(backend: Arc<dyn GpuBackend>, desc: ImageDesc) -> RhiResult<Self> {
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.layers == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "image extent {}x{}x{} is empty",
                desc.extent.width, desc.extent.height, desc.layers
            )));
        }
        let image = backend.create_image(&desc)?;
        let view = match backend.create_image_view(image, &desc) {
            Ok(view) => view,
            Err(e) => {
                backend.destroy_image(image);
                return Err(e);
            }
        };
        debug!(
            "Created image {}x{} {:?}",
            desc.extent.width, desc.extent.height, desc.format
        );
        Ok(Self {
            backend,
            image,
            view,
            desc,
            ownership: Ownership::Owned,
        })
    }

    /// Wrap an image owned elsewhere and create a view for it.
    pub fn borrowed(
        backend: Arc<dyn GpuBackend>,
        image: vk::Image,
        desc: ImageDesc,
    ) -> RhiResult<Self> {
        let view = backend.create_image_view(image, &desc)?;
        Ok(Self {
            backend,
            image,
            view,
            desc,
            ownership: Ownership::Borrowed,
        })
    }

    /// Create a sampled texture and fill it with `pixels`.
    pub fn with_pixels(
        backend: Arc<dyn GpuBackend>,
        format: TextureFormat,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> RhiResult<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
        if pixels.len() != expected {
            return Err(RhiError::InvalidHandle(format!(
                "texture {}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                pixels.len()
            )));
        }
        let image = Self::new(backend, ImageDesc::texture(format, width, height))?;
        image.backend.upload_image(image.image, &image.desc, pixels)?;
        Ok(image)
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    #[inline]
    pub fn layers(&self) -> u32 {
        self.desc.layers
    }

    #[inline]
    pub fn samples(&self) -> u32 {
        self.desc.samples
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        // Memory goes with the image inside destroy_image; views first.
        self.backend.destroy_image_view(self.view);
        if self.ownership == Ownership::Owned {
            self.backend.destroy_image(self.image);
        }
        debug!(
            "Released {:?} image {}x{}",
            self.ownership, self.desc.extent.width, self.desc.extent.height
        );
    }
}

/// A host-visible device buffer.
pub struct GpuBuffer {
    backend: Arc<dyn GpuBackend>,
    buffer: vk::Buffer,
    size: u64,
    usage: BufferUsage,
}

impl GpuBuffer {
    pub fn new(backend: Arc<dyn GpuBackend>, usage: BufferUsage, size: u64) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let buffer = backend.create_buffer(usage, size)?;
        debug!("Created {} buffer: {} bytes", usage.name(), size);
        Ok(Self {
            backend,
            buffer,
            size,
            usage,
        })
    }

    /// Create a buffer sized for `data` and fill it.
    pub fn with_data(backend: Arc<dyn GpuBackend>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(backend, usage, data.len() as u64)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    /// Write `data` at `offset`. No command re-recording is involved.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        if offset + data.len() as u64 > self.size {
            return Err(RhiError::InvalidHandle(format!(
                "write of {} bytes at {} overflows {} buffer of {} bytes",
                data.len(),
                offset,
                self.usage.name(),
                self.size
            )));
        }
        self.backend.write_buffer(self.buffer, offset, data)
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.buffer);
        debug!("Destroyed {} buffer: {} bytes", self.usage.name(), self.size);
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

impl std::fmt::Debug for GpuImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuImage")
            .field("image", &self.image)
            .field("view", &self.view)
            .field("desc", &self.desc)
            .field("ownership", &self.ownership)
            .finish()
    }
}
