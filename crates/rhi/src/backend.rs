//! The seam between frame orchestration and the graphics API.
//!
//! Everything above this trait (caches, cameras, the frame driver) speaks in
//! Vulkan handle types but never calls the driver directly. [`VulkanBackend`]
//! forwards to `ash`; [`HeadlessBackend`] fabricates handles and records what
//! was asked of it, which is how the orchestration layer is tested without a
//! GPU.
//!
//! Destroy calls take the handle by value and cannot fail. Callers are
//! responsible for making sure the GPU is finished with an object first.
//!
//! [`VulkanBackend`]: crate::vulkan::VulkanBackend
//! [`HeadlessBackend`]: crate::headless::HeadlessBackend

use ash::vk;

use crate::command::{CommandLevel, Recording};
use crate::descriptor::{DescriptorBinding, DescriptorWrite};
use crate::error::RhiResult;
use crate::pipeline::PipelineDesc;
use crate::render_pass::{FramebufferDesc, RenderPassDesc};
use crate::resource::{BufferUsage, ImageDesc, SamplerDesc};

/// Surface capabilities as reported by the presentation engine.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Resolved swapchain parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

/// One graphics queue submission.
#[derive(Clone, Copy, Debug)]
pub struct SubmitDesc {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: Option<vk::Semaphore>,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// GPU device operations used by the rendering core.
pub trait GpuBackend: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> String;

    fn supports_multiview(&self) -> bool;

    /// Highest sample count usable for both color and depth attachments.
    fn max_sample_count(&self) -> u32;

    // Buffers. All buffers are host-visible and persistently mapped.
    fn create_buffer(&self, usage: BufferUsage, size: u64) -> RhiResult<vk::Buffer>;
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // Images.
    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image>;
    /// Copy `pixels` into mip 0 and leave the image shader-readable.
    fn upload_image(&self, image: vk::Image, desc: &ImageDesc, pixels: &[u8]) -> RhiResult<()>;
    /// Destroys the image and frees its memory.
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, image: vk::Image, desc: &ImageDesc) -> RhiResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Synchronization.
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` is signaled. There is no timeout.
    fn wait_fence(&self, fence: vk::Fence) -> RhiResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool>;
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_idle(&self) -> RhiResult<()>;

    // Command buffers.
    fn allocate_command_buffer(&self, level: CommandLevel) -> RhiResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);
    /// Reset `cmd` and record `recording` into it.
    fn record(&self, cmd: vk::CommandBuffer, recording: &Recording) -> RhiResult<()>;
    fn submit(&self, desc: &SubmitDesc) -> RhiResult<()>;

    // Render passes.
    fn create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> RhiResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Shaders, layouts, pipelines.
    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, desc: &PipelineDesc) -> RhiResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Descriptor sets.
    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;
    fn free_descriptor_set(&self, set: vk::DescriptorSet);
    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // Presentation.
    fn surface_support(&self) -> RhiResult<SurfaceSupport>;
    /// Create a swapchain, handing `old` to the driver for resource reuse.
    /// The caller destroys `old` afterwards.
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> RhiResult<(vk::SwapchainKHR, Vec<vk::Image>)>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Returns the image index and whether the swapchain is suboptimal.
    ///
    /// An out-of-date swapchain is reported as
    /// [`RhiError::SwapchainOutOfDate`](crate::RhiError::SwapchainOutOfDate).
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> RhiResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RhiResult<bool>;
}
