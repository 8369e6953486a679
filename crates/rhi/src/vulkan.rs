//! [`GpuBackend`] over a real Vulkan device.
//!
//! Memory comes from gpu-allocator. Buffers are host-visible and persistently
//! mapped; images live in device-local memory and are filled through a staging
//! buffer. Command buffers and descriptor sets come from one pool each, both
//! guarded by a mutex since Vulkan pools are externally synchronized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use tracing::{debug, error, info};

use crate::backend::{GpuBackend, SubmitDesc, SurfaceSupport, SwapchainDesc};
use crate::command::{self, CommandLevel, Recording};
use crate::descriptor::{self, DescriptorBinding, DescriptorWrite, MAX_DESCRIPTOR_SETS};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::physical_device::select_physical_device;
use crate::pipeline::{self, PipelineDesc, sample_count_flags};
use crate::render_pass::{FramebufferDesc, RenderPassDesc};
use crate::resource::{AddressMode, BufferUsage, FilterMode, ImageDesc, SamplerDesc};
use crate::surface::Surface;

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    swapchain_loader: ash::khr::swapchain::Device,
    command_pool: Mutex<vk::CommandPool>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    adapter_name: String,
    // Field order is drop order: surface and device before the instance.
    surface: Surface,
    device: Arc<Device>,
    instance: Instance,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn out_of_date(result: vk::Result) -> RhiError {
    match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => RhiError::SwapchainOutOfDate,
        other => RhiError::VulkanError(other),
    }
}

impl VulkanBackend {
    /// Bring up Vulkan for a native window: instance, surface, GPU, device,
    /// command and descriptor pools.
    ///
    /// # Safety
    ///
    /// The window behind `window` must outlive the backend.
    pub unsafe fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        enable_validation: bool,
    ) -> RhiResult<Arc<Self>> {
        let instance = Instance::new(enable_validation, Some(display))?;
        let surface = unsafe { Surface::new(&instance, display, window)? };
        let gpu = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let adapter_name = gpu.device_name().to_string();
        info!(
            "Using GPU '{}' ({})",
            adapter_name,
            gpu.device_type_name()
        );

        let device = Device::new(&instance, &gpu)?;
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());

        let graphics_family = gpu
            .queue_families
            .graphics_family
            .ok_or(RhiError::NoSuitableGpu)?;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_family);
        let command_pool = unsafe { device.handle().create_command_pool(&pool_info, None)? };

        let pool_sizes = descriptor::pool_sizes(MAX_DESCRIPTOR_SETS);
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe {
            device
                .handle()
                .create_descriptor_pool(&descriptor_pool_info, None)
        };
        let descriptor_pool = match descriptor_pool {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.handle().destroy_command_pool(command_pool, None) };
                return Err(e.into());
            }
        };

        Ok(Arc::new(Self {
            swapchain_loader,
            command_pool: Mutex::new(command_pool),
            descriptor_pool: Mutex::new(descriptor_pool),
            allocations: Mutex::new(HashMap::new()),
            adapter_name,
            surface,
            device,
            instance,
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    fn vk(&self) -> &ash::Device {
        self.device.handle()
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        lock(self.device.allocator())
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        Ok(self.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    }

    fn free_allocation(&self, raw: u64) {
        let Some(allocation) = lock(&self.allocations).remove(&raw) else {
            return;
        };
        if let Err(e) = self.allocator().free(allocation) {
            error!("Failed to free allocation: {:?}", e);
        }
    }

    /// Record and run a command buffer once, blocking until it completes.
    fn one_time_submit(&self, record: impl FnOnce(vk::CommandBuffer)) -> RhiResult<()> {
        let pool = lock(&self.command_pool);
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.vk().allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no command buffer".into()))?;
        let fence = unsafe { self.vk().create_fence(&vk::FenceCreateInfo::default(), None) };

        let result = fence.map_err(RhiError::from).and_then(|fence| {
            let run = (|| -> RhiResult<()> {
                unsafe {
                    let begin = vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                    self.vk().begin_command_buffer(cmd, &begin)?;
                    record(cmd);
                    self.vk().end_command_buffer(cmd)?;

                    let cmds = [cmd];
                    let submit = vk::SubmitInfo::default().command_buffers(&cmds);
                    self.device.submit_graphics(&[submit], fence)?;
                    self.vk().wait_for_fences(&[fence], true, u64::MAX)?;
                }
                Ok(())
            })();
            unsafe { self.vk().destroy_fence(fence, None) };
            run
        });

        unsafe { self.vk().free_command_buffers(*pool, &[cmd]) };
        result
    }

    fn transition(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        desc: &ImageDesc,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, _) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            _ => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ),
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range(desc))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        unsafe {
            self.vk().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Attachments rest in the layout their render passes load from.
    fn initialize_layout(&self, image: vk::Image, desc: &ImageDesc) -> RhiResult<()> {
        let Some(resting) = desc.resting_layout() else {
            return Ok(());
        };
        self.one_time_submit(|cmd| {
            self.transition(cmd, image, desc, vk::ImageLayout::UNDEFINED, resting)
        })
    }
}

fn subresource_range(desc: &ImageDesc) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(desc.aspect())
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(desc.layers)
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during drop: {:?}", e);
        }
        unsafe {
            self.vk()
                .destroy_descriptor_pool(*lock(&self.descriptor_pool), None);
            self.vk()
                .destroy_command_pool(*lock(&self.command_pool), None);
        }

        let leaked: Vec<Allocation> = lock(&self.allocations).drain().map(|(_, a)| a).collect();
        if !leaked.is_empty() {
            debug!("Freeing {} allocation(s) still alive at shutdown", leaked.len());
        }
        let mut allocator = self.allocator();
        for allocation in leaked {
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free allocation: {:?}", e);
            }
        }
        info!("Vulkan backend destroyed");
    }
}

// Safety: every Vulkan object is a plain handle, mutable state sits behind
// mutexes, and the device is Send + Sync.
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn supports_multiview(&self) -> bool {
        self.device.supports_multiview()
    }

    fn max_sample_count(&self) -> u32 {
        let limits = self.device.limits();
        let counts =
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
        [8, 4, 2]
            .into_iter()
            .find(|&n| counts.contains(sample_count_flags(n)))
            .unwrap_or(1)
    }

    fn create_buffer(&self, usage: BufferUsage, size: u64) -> RhiResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.vk().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.vk().get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(usage.name(), requirements, usage.memory_location(), true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.vk().destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        unsafe {
            self.vk()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }
        lock(&self.allocations).insert(buffer.as_raw(), allocation);

        debug!("Created {} buffer: {} bytes", usage.name(), size);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut allocations = lock(&self.allocations);
        let mapped = allocations
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {buffer:?}")))?
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::InvalidHandle("Buffer memory is not mapped".to_string()))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(RhiError::InvalidHandle(format!(
                "write of {} bytes at {} overflows mapping of {}",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.vk().destroy_buffer(buffer, None) };
        self.free_allocation(buffer.as_raw());
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.layers)
            .samples(sample_count_flags(desc.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.vk().create_image(&image_info, None)? };
        let requirements = unsafe { self.vk().get_image_memory_requirements(image) };

        let allocation = match self.allocate("image", requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.vk().destroy_image(image, None) };
                return Err(e);
            }
        };
        unsafe {
            self.vk()
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }
        lock(&self.allocations).insert(image.as_raw(), allocation);

        if let Err(e) = self.initialize_layout(image, desc) {
            self.destroy_image(image);
            return Err(e);
        }
        debug!(
            "Created image {}x{}x{} {:?} ({}x samples)",
            desc.extent.width, desc.extent.height, desc.layers, desc.format, desc.samples
        );
        Ok(image)
    }

    fn upload_image(&self, image: vk::Image, desc: &ImageDesc, pixels: &[u8]) -> RhiResult<()> {
        let staging = self.create_buffer(BufferUsage::Staging, pixels.len() as u64)?;
        let result = self.write_buffer(staging, 0, pixels).and_then(|()| {
            self.one_time_submit(|cmd| {
                self.transition(
                    cmd,
                    image,
                    desc,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                let region = vk::BufferImageCopy::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: desc.aspect(),
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: desc.layers,
                    })
                    .image_extent(vk::Extent3D {
                        width: desc.extent.width,
                        height: desc.extent.height,
                        depth: 1,
                    });
                unsafe {
                    self.vk().cmd_copy_buffer_to_image(
                        cmd,
                        staging,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                self.transition(
                    cmd,
                    image,
                    desc,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            })
        });
        self.destroy_buffer(staging);
        result
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.vk().destroy_image(image, None) };
        self.free_allocation(image.as_raw());
    }

    fn create_image_view(&self, image: vk::Image, desc: &ImageDesc) -> RhiResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type())
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource_range(desc));
        Ok(unsafe { self.vk().create_image_view(&create_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.vk().destroy_image_view(view, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        let filter = match desc.filter {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear => vk::Filter::LINEAR,
        };
        let address = match desc.address {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        };
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(address)
            .address_mode_v(address)
            .address_mode_w(address)
            .max_lod(vk::LOD_CLAMP_NONE);
        Ok(unsafe { self.vk().create_sampler(&create_info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.vk().destroy_sampler(sampler, None) };
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.vk().create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.vk().destroy_fence(fence, None) };
    }

    fn wait_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.vk().wait_for_fences(&[fence], true, u64::MAX)? };
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.vk().reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.vk().get_fence_status(fence)? })
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(unsafe {
            self.vk()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.vk().destroy_semaphore(semaphore, None) };
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }

    fn allocate_command_buffer(&self, level: CommandLevel) -> RhiResult<vk::CommandBuffer> {
        let pool = lock(&self.command_pool);
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(level.to_vk())
            .command_buffer_count(1);
        let buffers = unsafe { self.vk().allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no command buffer".into()))
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let pool = lock(&self.command_pool);
        unsafe { self.vk().free_command_buffers(*pool, &[cmd]) };
    }

    fn record(&self, cmd: vk::CommandBuffer, recording: &Recording) -> RhiResult<()> {
        let _pool = lock(&self.command_pool);
        command::encode(self.vk(), cmd, recording)
    }

    fn submit(&self, desc: &SubmitDesc) -> RhiResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> = desc.wait_semaphore.into_iter().collect();
        let wait_stages = vec![desc.wait_stage; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = desc.signal_semaphore.into_iter().collect();
        let command_buffers = [desc.command_buffer];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let _pool = lock(&self.command_pool);
        unsafe { self.device.submit_graphics(&[submit_info], desc.fence) }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<vk::RenderPass> {
        let mut attachments = vec![desc.color.to_vk()];
        attachments.extend(desc.depth.map(|depth| depth.to_vk()));
        attachments.extend(desc.resolve.map(|resolve| resolve.to_vk()));

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let resolve_refs = [vk::AttachmentReference {
            attachment: 1 + u32::from(desc.depth.is_some()),
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        if desc.resolve.is_some() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        let subpasses = [subpass];

        let view_masks = [desc.view_mask];
        let mut multiview = vk::RenderPassMultiviewCreateInfo::default()
            .view_masks(&view_masks)
            .correlation_masks(&view_masks);

        let mut create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&desc.dependencies);
        if desc.view_mask != 0 {
            create_info = create_info.push_next(&mut multiview);
        }

        unsafe { self.vk().create_render_pass(&create_info, None) }
            .map_err(|e| RhiError::RenderPassError(format!("vkCreateRenderPass: {e}")))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.vk().destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> RhiResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass)
            .attachments(&desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        unsafe { self.vk().create_framebuffer(&create_info, None) }
            .map_err(|e| RhiError::RenderPassError(format!("vkCreateFramebuffer: {e}")))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.vk().destroy_framebuffer(framebuffer, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.vk().create_shader_module(&create_info, None) }
            .map_err(|e| RhiError::ShaderError(format!("vkCreateShaderModule: {e}")))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.vk().destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> =
            bindings.iter().map(DescriptorBinding::to_vk).collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        Ok(unsafe { self.vk().create_descriptor_set_layout(&create_info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.vk().destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        Ok(unsafe { self.vk().create_pipeline_layout(&create_info, None)? })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.vk().destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipeline(&self, desc: &PipelineDesc) -> RhiResult<vk::Pipeline> {
        pipeline::create_graphics_pipeline(self.vk(), desc)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.vk().destroy_pipeline(pipeline, None) };
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let pool = lock(&self.descriptor_pool);
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.vk().allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no descriptor set".into()))
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        let pool = lock(&self.descriptor_pool);
        if let Err(e) = unsafe { self.vk().free_descriptor_sets(*pool, &[set]) } {
            error!("Failed to free descriptor set: {:?}", e);
        }
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let infos: Vec<(Option<vk::DescriptorBufferInfo>, Option<vk::DescriptorImageInfo>)> = writes
            .iter()
            .map(|write| match *write {
                DescriptorWrite::UniformBuffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => (
                    Some(vk::DescriptorBufferInfo {
                        buffer,
                        offset,
                        range,
                    }),
                    None,
                ),
                DescriptorWrite::SampledImage { view, .. } => (
                    None,
                    Some(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }),
                ),
                DescriptorWrite::Sampler { sampler, .. } => (
                    None,
                    Some(vk::DescriptorImageInfo {
                        sampler,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    }),
                ),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(&infos)
            .map(|(write, (buffer_info, image_info))| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding());
                match write {
                    DescriptorWrite::UniformBuffer { .. } => base
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(buffer_info.as_slice()),
                    DescriptorWrite::SampledImage { .. } => base
                        .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                        .image_info(image_info.as_slice()),
                    DescriptorWrite::Sampler { .. } => base
                        .descriptor_type(vk::DescriptorType::SAMPLER)
                        .image_info(image_info.as_slice()),
                }
            })
            .collect();

        unsafe { self.vk().update_descriptor_sets(&vk_writes, &[]) };
    }

    fn surface_support(&self) -> RhiResult<SurfaceSupport> {
        let loader = self.surface.loader();
        let gpu = self.device.physical_device();
        let surface = self.surface.handle();
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader.get_physical_device_surface_capabilities(gpu, surface)?,
                formats: loader.get_physical_device_surface_formats(gpu, surface)?,
                present_modes: loader.get_physical_device_surface_present_modes(gpu, surface)?,
            })
        }
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> RhiResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let families = self.device.queue_families();
        let (Some(graphics_family), Some(present_family)) =
            (families.graphics_family, families.present_family)
        else {
            return Err(RhiError::NoSuitableGpu);
        };
        let family_indices = [graphics_family, present_family];
        let (sharing_mode, indices) = if graphics_family != present_family {
            (vk::SharingMode::CONCURRENT, family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle())
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(indices)
            .pre_transform(desc.pre_transform)
            .composite_alpha(desc.composite_alpha)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };
        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) };
        match images {
            Ok(images) => Ok((swapchain, images)),
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                Err(e.into())
            }
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> RhiResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        }
        .map_err(out_of_date)
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RhiResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _pool = lock(&self.command_pool);
        unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue(), &present_info)
        }
        .map_err(out_of_date)
    }
}
