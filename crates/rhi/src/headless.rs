//! A GPU backend without a GPU.
//!
//! [`HeadlessBackend`] hands out unique fabricated handles, keeps buffer
//! contents in memory, stores every [`Recording`] it is asked to encode and
//! logs each call as a [`HeadlessEvent`]. Fences really block: a submission
//! either completes immediately (the default) or stays pending until the test
//! calls [`HeadlessBackend::complete_pending`] or
//! [`HeadlessBackend::signal_fence`], possibly from another thread.
//!
//! Re-recording or freeing a command buffer that belongs to a pending
//! submission is counted in [`HeadlessStats`] rather than rejected, so tests
//! can assert the orchestration never does it.
//!
//! Image layouts are simulated as well. Each submitted primary is walked in
//! order: barriers and render pass begins are checked against the layout the
//! image is currently in, and presenting checks for `PRESENT_SRC_KHR`. Every
//! disagreement bumps [`HeadlessStats::layout_mismatches`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};
use tracing::{debug, trace};

use crate::backend::{GpuBackend, SubmitDesc, SurfaceSupport, SwapchainDesc};
use crate::command::{Command, CommandLevel, RecordUsage, Recording};
use crate::descriptor::{DescriptorBinding, DescriptorWrite};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::PipelineDesc;
use crate::render_pass::{FramebufferDesc, RenderPassDesc};
use crate::resource::{BufferUsage, ImageDesc, SamplerDesc};

/// One backend call, in the order it was made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadlessEvent {
    CreateBuffer(vk::Buffer),
    DestroyBuffer(vk::Buffer),
    CreateImage(vk::Image),
    UploadImage(vk::Image),
    DestroyImage(vk::Image),
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    WaitIdle,
    AllocateCommandBuffer(vk::CommandBuffer, CommandLevel),
    FreeCommandBuffer(vk::CommandBuffer),
    Record(vk::CommandBuffer, CommandLevel),
    Submit {
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    },
    CreateRenderPass(vk::RenderPass),
    DestroyRenderPass(vk::RenderPass),
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    CreateShaderModule(vk::ShaderModule),
    DestroyShaderModule(vk::ShaderModule),
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreatePipelineLayout(vk::PipelineLayout),
    DestroyPipelineLayout(vk::PipelineLayout),
    CreatePipeline(vk::Pipeline),
    DestroyPipeline(vk::Pipeline),
    AllocateDescriptorSet(vk::DescriptorSet),
    FreeDescriptorSet(vk::DescriptorSet),
    WriteDescriptorSet(vk::DescriptorSet),
    CreateSwapchain(vk::SwapchainKHR),
    DestroySwapchain(vk::SwapchainKHR),
    Acquire(vk::SwapchainKHR, u32),
    Present(vk::SwapchainKHR, u32),
}

/// Call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub render_passes_created: usize,
    pub framebuffers_created: usize,
    pub pipelines_created: usize,
    pub pipelines_destroyed: usize,
    pub primary_records: usize,
    pub secondary_records: usize,
    pub submits: usize,
    pub acquires: usize,
    pub presents: usize,
    pub wait_idles: usize,
    pub descriptor_sets_allocated: usize,
    pub descriptor_set_writes: usize,
    pub swapchains_created: usize,
    pub images_uploaded: usize,
    /// Destroy calls for handles that were never created or already gone.
    pub invalid_destroys: usize,
    /// Records into a command buffer still referenced by a pending submit.
    pub in_flight_rerecords: usize,
    /// Frees of a command buffer still referenced by a pending submit.
    pub in_flight_frees: usize,
    /// Barriers, render pass begins or presents that found an image in a
    /// layout other than the one they expect.
    pub layout_mismatches: usize,
}

struct Submission {
    fence: u64,
    command_buffers: Vec<u64>,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next_image: u32,
}

struct State {
    next_handle: u64,
    live: HashSet<u64>,
    events: Vec<HeadlessEvent>,
    stats: HeadlessStats,
    buffers: HashMap<u64, Vec<u8>>,
    fences: HashMap<u64, bool>,
    recordings: HashMap<u64, Recording>,
    descriptor_writes: HashMap<u64, Vec<DescriptorWrite>>,
    pending: Vec<Submission>,
    swapchains: HashMap<u64, SwapchainState>,
    /// Current layout per image.
    layouts: HashMap<u64, vk::ImageLayout>,
    /// View to the image it was created for.
    views: HashMap<u64, u64>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, FramebufferDesc>,
    max_samples: u32,
    auto_complete: bool,
    surface: SurfaceSupport,
    multiview: bool,
    out_of_date: bool,
    suboptimal: bool,
}

impl State {
    fn fabricate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create(&mut self) -> u64 {
        let raw = self.fabricate();
        self.live.insert(raw);
        raw
    }

    fn destroy(&mut self, raw: u64) -> bool {
        let known = self.live.remove(&raw);
        if !known {
            self.stats.invalid_destroys += 1;
        }
        known
    }

    fn signal(&mut self, fence: u64) {
        if let Some(signaled) = self.fences.get_mut(&fence) {
            *signaled = true;
        }
        self.pending.retain(|submission| submission.fence != fence);
    }

    fn is_in_flight(&self, cmd: u64) -> bool {
        self.pending
            .iter()
            .any(|submission| submission.command_buffers.contains(&cmd))
    }

    fn layout(&self, image: u64) -> vk::ImageLayout {
        self.layouts
            .get(&image)
            .copied()
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    /// Move `image` from `expected` to `next`. An `UNDEFINED` expectation
    /// accepts any current layout.
    fn transition(&mut self, image: u64, expected: vk::ImageLayout, next: vk::ImageLayout) {
        let current = self.layout(image);
        if expected != vk::ImageLayout::UNDEFINED && current != expected {
            debug!(
                "headless: image {:#x} is {:?}, expected {:?}",
                image, current, expected
            );
            self.stats.layout_mismatches += 1;
        }
        self.layouts.insert(image, next);
    }

    fn begin_render_pass(&mut self, render_pass: u64, framebuffer: u64) {
        let (Some(desc), Some(fb)) = (
            self.render_passes.get(&render_pass).copied(),
            self.framebuffers.get(&framebuffer).cloned(),
        ) else {
            return;
        };
        let attachments = std::iter::once(desc.color)
            .chain(desc.depth)
            .chain(desc.resolve);
        for (view, attachment) in fb.attachments.iter().zip(attachments) {
            // Views the backend never created belong to no tracked image.
            if let Some(&image) = self.views.get(&view.as_raw()) {
                self.transition(image, attachment.initial_layout, attachment.final_layout);
            }
        }
    }

    fn execute(&mut self, recording: &Recording) {
        for command in recording.commands() {
            match command {
                Command::ImageBarrier {
                    image,
                    old_layout,
                    new_layout,
                } => self.transition(image.as_raw(), *old_layout, *new_layout),
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    ..
                } => self.begin_render_pass(render_pass.as_raw(), framebuffer.as_raw()),
                _ => {}
            }
        }
    }
}

fn default_surface() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

/// In-memory [`GpuBackend`].
pub struct HeadlessBackend {
    state: Mutex<State>,
    fence_signaled: Condvar,
}

impl HeadlessBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_handle: 0,
                live: HashSet::new(),
                events: Vec::new(),
                stats: HeadlessStats::default(),
                buffers: HashMap::new(),
                fences: HashMap::new(),
                recordings: HashMap::new(),
                descriptor_writes: HashMap::new(),
                pending: Vec::new(),
                swapchains: HashMap::new(),
                layouts: HashMap::new(),
                views: HashMap::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                max_samples: 8,
                auto_complete: true,
                surface: default_surface(),
                multiview: true,
                out_of_date: false,
                suboptimal: false,
            }),
            fence_signaled: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, event: HeadlessEvent) {
        trace!("headless: {:?}", event);
        self.state().events.push(event);
    }

    /// Every call made so far.
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state().stats
    }

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state().live.len()
    }

    /// A unique image handle the backend does not own.
    pub fn fabricate_image(&self) -> vk::Image {
        vk::Image::from_raw(self.state().fabricate())
    }

    /// A unique image view handle the backend does not own.
    pub fn fabricate_view(&self) -> vk::ImageView {
        vk::ImageView::from_raw(self.state().fabricate())
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state()
            .buffers
            .get(&buffer.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Simulated layout of `image`, or `None` for an image never used.
    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state().layouts.get(&image.as_raw()).copied()
    }

    /// Images of a live swapchain in index order.
    pub fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Vec<vk::Image> {
        self.state()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|chain| chain.images.clone())
            .unwrap_or_default()
    }

    pub fn set_max_sample_count(&self, samples: u32) {
        self.state().max_samples = samples;
    }

    /// The last recording encoded into `cmd`.
    pub fn recording(&self, cmd: vk::CommandBuffer) -> Option<Recording> {
        self.state().recordings.get(&cmd.as_raw()).cloned()
    }

    /// Current contents of `set`, one write per binding in binding order.
    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        let mut writes = self
            .state()
            .descriptor_writes
            .get(&set.as_raw())
            .cloned()
            .unwrap_or_default();
        writes.sort_by_key(DescriptorWrite::binding);
        writes
    }

    /// When off, submissions stay pending until signaled explicitly.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state().auto_complete = auto_complete;
    }

    /// Signal the fences of every pending submission.
    pub fn complete_pending(&self) {
        let mut state = self.state();
        let fences: Vec<u64> = state.pending.iter().map(|s| s.fence).collect();
        for fence in fences {
            state.signal(fence);
        }
        drop(state);
        self.fence_signaled.notify_all();
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        self.state().signal(fence.as_raw());
        self.fence_signaled.notify_all();
    }

    pub fn pending_submissions(&self) -> usize {
        self.state().pending.len()
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state().surface.capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state().surface.present_modes = modes;
    }

    pub fn set_image_count_limits(&self, min: u32, max: u32) {
        let mut state = self.state();
        state.surface.capabilities.min_image_count = min;
        state.surface.capabilities.max_image_count = max;
    }

    pub fn set_multiview(&self, supported: bool) {
        self.state().multiview = supported;
    }

    /// Make acquire and present report an out-of-date swapchain until the
    /// next swapchain is created.
    pub fn inject_out_of_date(&self) {
        self.state().out_of_date = true;
    }

    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state().suboptimal = suboptimal;
    }

    fn create_handle<H: Handle + Copy>(&self, event: impl FnOnce(H) -> HeadlessEvent) -> H {
        let handle = H::from_raw(self.state().create());
        self.log(event(handle));
        handle
    }

    fn destroy_handle<H: Handle + Copy>(&self, handle: H, event: impl FnOnce(H) -> HeadlessEvent) {
        if !self.state().destroy(handle.as_raw()) {
            debug!("headless: destroy of unknown handle {:#x}", handle.as_raw());
        }
        self.log(event(handle));
    }

    fn require_live(&self, raw: u64, what: &str) -> RhiResult<()> {
        if self.state().live.contains(&raw) {
            Ok(())
        } else {
            Err(RhiError::InvalidHandle(format!("{what} {raw:#x}")))
        }
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> String {
        "headless".to_string()
    }

    fn supports_multiview(&self) -> bool {
        self.state().multiview
    }

    fn max_sample_count(&self) -> u32 {
        self.state().max_samples
    }

    fn create_buffer(&self, _usage: BufferUsage, size: u64) -> RhiResult<vk::Buffer> {
        let buffer: vk::Buffer = self.create_handle(HeadlessEvent::CreateBuffer);
        self.state()
            .buffers
            .insert(buffer.as_raw(), vec![0; size as usize]);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state();
        let contents = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {buffer:?}")))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(RhiError::InvalidHandle(format!(
                "write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state().buffers.remove(&buffer.as_raw());
        self.destroy_handle(buffer, HeadlessEvent::DestroyBuffer);
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<vk::Image> {
        if desc.samples > self.max_sample_count() {
            return Err(RhiError::VulkanError(vk::Result::ERROR_FORMAT_NOT_SUPPORTED));
        }
        let image: vk::Image = self.create_handle(HeadlessEvent::CreateImage);
        if let Some(resting) = desc.resting_layout() {
            self.state().layouts.insert(image.as_raw(), resting);
        }
        Ok(image)
    }

    fn upload_image(&self, image: vk::Image, _desc: &ImageDesc, _pixels: &[u8]) -> RhiResult<()> {
        self.require_live(image.as_raw(), "image")?;
        {
            let mut state = self.state();
            state.stats.images_uploaded += 1;
            state
                .layouts
                .insert(image.as_raw(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        self.log(HeadlessEvent::UploadImage(image));
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state().layouts.remove(&image.as_raw());
        self.destroy_handle(image, HeadlessEvent::DestroyImage);
    }

    fn create_image_view(&self, image: vk::Image, _desc: &ImageDesc) -> RhiResult<vk::ImageView> {
        let view: vk::ImageView = self.create_handle(HeadlessEvent::CreateImageView);
        self.state().views.insert(view.as_raw(), image.as_raw());
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().views.remove(&view.as_raw());
        self.destroy_handle(view, HeadlessEvent::DestroyImageView);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        Ok(self.create_handle(HeadlessEvent::CreateSampler))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroy_handle(sampler, HeadlessEvent::DestroySampler);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence: vk::Fence = self.create_handle(HeadlessEvent::CreateFence);
        self.state().fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        {
            let mut state = self.state();
            state.fences.remove(&fence.as_raw());
            state.pending.retain(|s| s.fence != fence.as_raw());
        }
        self.destroy_handle(fence, HeadlessEvent::DestroyFence);
    }

    fn wait_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        self.log(HeadlessEvent::WaitFence(fence));
        let raw = fence.as_raw();
        let state = self.state();
        if !state.fences.contains_key(&raw) {
            return Err(RhiError::InvalidHandle(format!("fence {raw:#x}")));
        }
        let state = self
            .fence_signaled
            .wait_while(state, |s| !s.fences.get(&raw).copied().unwrap_or(true))
            .unwrap_or_else(PoisonError::into_inner);
        drop(state);
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        {
            let mut state = self.state();
            let signaled = state
                .fences
                .get_mut(&fence.as_raw())
                .ok_or_else(|| RhiError::InvalidHandle(format!("fence {fence:?}")))?;
            *signaled = false;
        }
        self.log(HeadlessEvent::ResetFence(fence));
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("fence {fence:?}")))
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(self.create_handle(HeadlessEvent::CreateSemaphore))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroy_handle(semaphore, HeadlessEvent::DestroySemaphore);
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.state().stats.wait_idles += 1;
        self.log(HeadlessEvent::WaitIdle);
        // Idle means every submission has finished.
        self.complete_pending();
        Ok(())
    }

    fn allocate_command_buffer(&self, level: CommandLevel) -> RhiResult<vk::CommandBuffer> {
        Ok(self.create_handle(|cmd| HeadlessEvent::AllocateCommandBuffer(cmd, level)))
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        {
            let mut state = self.state();
            if state.is_in_flight(cmd.as_raw()) {
                debug!("headless: command buffer {:#x} freed while in flight", cmd.as_raw());
                state.stats.in_flight_frees += 1;
            }
            state.recordings.remove(&cmd.as_raw());
        }
        self.destroy_handle(cmd, HeadlessEvent::FreeCommandBuffer);
    }

    fn record(&self, cmd: vk::CommandBuffer, recording: &Recording) -> RhiResult<()> {
        self.require_live(cmd.as_raw(), "command buffer")?;
        let level = recording.level();
        {
            let mut state = self.state();
            if state.is_in_flight(cmd.as_raw()) {
                state.stats.in_flight_rerecords += 1;
            }
            match recording.usage() {
                RecordUsage::Primary => state.stats.primary_records += 1,
                RecordUsage::Secondary { .. } => state.stats.secondary_records += 1,
            }
            state.recordings.insert(cmd.as_raw(), recording.clone());
        }
        self.log(HeadlessEvent::Record(cmd, level));
        Ok(())
    }

    fn submit(&self, desc: &SubmitDesc) -> RhiResult<()> {
        let cmd = desc.command_buffer.as_raw();
        let fence = desc.fence.as_raw();
        let auto_complete = {
            let mut state = self.state();
            let recording = state
                .recordings
                .get(&cmd)
                .cloned()
                .ok_or_else(|| RhiError::InvalidHandle(format!("unrecorded command buffer {cmd:#x}")))?;
            let mut command_buffers = vec![cmd];
            command_buffers.extend(recording.executed().iter().map(|c| c.as_raw()));

            if !state.fences.contains_key(&fence) {
                return Err(RhiError::InvalidHandle(format!("fence {fence:#x}")));
            }
            // The queue runs submissions in order, so layouts can be
            // advanced as soon as the work is queued.
            state.execute(&recording);
            state.stats.submits += 1;
            state.pending.push(Submission {
                fence,
                command_buffers,
            });
            state.auto_complete
        };
        self.log(HeadlessEvent::Submit {
            command_buffer: desc.command_buffer,
            fence: desc.fence,
        });
        if auto_complete {
            self.signal_fence(desc.fence);
        }
        Ok(())
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> RhiResult<vk::RenderPass> {
        let render_pass: vk::RenderPass = self.create_handle(HeadlessEvent::CreateRenderPass);
        let mut state = self.state();
        state.stats.render_passes_created += 1;
        state.render_passes.insert(render_pass.as_raw(), *desc);
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state().render_passes.remove(&render_pass.as_raw());
        self.destroy_handle(render_pass, HeadlessEvent::DestroyRenderPass);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> RhiResult<vk::Framebuffer> {
        self.require_live(desc.render_pass.as_raw(), "render pass")?;
        let framebuffer: vk::Framebuffer = self.create_handle(HeadlessEvent::CreateFramebuffer);
        let mut state = self.state();
        state.stats.framebuffers_created += 1;
        state.framebuffers.insert(framebuffer.as_raw(), desc.clone());
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state().framebuffers.remove(&framebuffer.as_raw());
        self.destroy_handle(framebuffer, HeadlessEvent::DestroyFramebuffer);
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RhiError::ShaderError("empty shader module".into()));
        }
        Ok(self.create_handle(HeadlessEvent::CreateShaderModule))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroy_handle(module, HeadlessEvent::DestroyShaderModule);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(self.create_handle(HeadlessEvent::CreateDescriptorSetLayout))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy_handle(layout, HeadlessEvent::DestroyDescriptorSetLayout);
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<vk::PipelineLayout> {
        Ok(self.create_handle(HeadlessEvent::CreatePipelineLayout))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy_handle(layout, HeadlessEvent::DestroyPipelineLayout);
    }

    fn create_graphics_pipeline(&self, _desc: &PipelineDesc) -> RhiResult<vk::Pipeline> {
        self.state().stats.pipelines_created += 1;
        Ok(self.create_handle(HeadlessEvent::CreatePipeline))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state().stats.pipelines_destroyed += 1;
        self.destroy_handle(pipeline, HeadlessEvent::DestroyPipeline);
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        self.require_live(layout.as_raw(), "descriptor set layout")?;
        self.state().stats.descriptor_sets_allocated += 1;
        Ok(self.create_handle(HeadlessEvent::AllocateDescriptorSet))
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        self.state().descriptor_writes.remove(&set.as_raw());
        self.destroy_handle(set, HeadlessEvent::FreeDescriptorSet);
    }

    fn write_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        {
            let mut state = self.state();
            state.stats.descriptor_set_writes += 1;
            let current = state.descriptor_writes.entry(set.as_raw()).or_default();
            for write in writes {
                current.retain(|existing| existing.binding() != write.binding());
                current.push(*write);
            }
        }
        self.log(HeadlessEvent::WriteDescriptorSet(set));
    }

    fn surface_support(&self) -> RhiResult<SurfaceSupport> {
        Ok(self.state().surface.clone())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        _old: vk::SwapchainKHR,
    ) -> RhiResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::SwapchainError("zero-sized swapchain".into()));
        }
        let swapchain: vk::SwapchainKHR = self.create_handle(HeadlessEvent::CreateSwapchain);
        let mut state = self.state();
        let images: Vec<vk::Image> = (0..desc.image_count)
            .map(|_| vk::Image::from_raw(state.fabricate()))
            .collect();
        state.swapchains.insert(
            swapchain.as_raw(),
            SwapchainState {
                images: images.clone(),
                next_image: 0,
            },
        );
        state.stats.swapchains_created += 1;
        state.out_of_date = false;
        Ok((swapchain, images))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        {
            let mut state = self.state();
            if let Some(chain) = state.swapchains.remove(&swapchain.as_raw()) {
                for image in chain.images {
                    state.layouts.remove(&image.as_raw());
                }
            }
        }
        self.destroy_handle(swapchain, HeadlessEvent::DestroySwapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _signal: vk::Semaphore,
    ) -> RhiResult<(u32, bool)> {
        let (index, suboptimal) = {
            let mut state = self.state();
            if state.out_of_date {
                return Err(RhiError::SwapchainOutOfDate);
            }
            let suboptimal = state.suboptimal;
            let chain = state
                .swapchains
                .get_mut(&swapchain.as_raw())
                .ok_or_else(|| RhiError::InvalidHandle(format!("swapchain {swapchain:?}")))?;
            let index = chain.next_image;
            chain.next_image = (index + 1) % chain.images.len().max(1) as u32;
            state.stats.acquires += 1;
            (index, suboptimal)
        };
        self.log(HeadlessEvent::Acquire(swapchain, index));
        Ok((index, suboptimal))
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> RhiResult<bool> {
        let suboptimal = {
            let mut state = self.state();
            if state.out_of_date {
                return Err(RhiError::SwapchainOutOfDate);
            }
            let image = state
                .swapchains
                .get(&swapchain.as_raw())
                .ok_or_else(|| RhiError::InvalidHandle(format!("swapchain {swapchain:?}")))?
                .images
                .get(image_index as usize)
                .copied()
                .ok_or_else(|| RhiError::InvalidHandle(format!("image index {image_index}")))?;
            let layout = state.layout(image.as_raw());
            if layout != vk::ImageLayout::PRESENT_SRC_KHR {
                debug!("headless: presenting image {:#x} in {:?}", image.as_raw(), layout);
                state.stats.layout_mismatches += 1;
            }
            state.stats.presents += 1;
            state.suboptimal
        };
        self.log(HeadlessEvent::Present(swapchain, image_index));
        Ok(suboptimal)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_handles_are_unique_and_tracked() {
        let backend = HeadlessBackend::new();
        let a = backend.create_buffer(BufferUsage::Vertex, 4).unwrap();
        let b = backend.create_buffer(BufferUsage::Vertex, 4).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.live_objects(), 2);

        backend.destroy_buffer(a);
        backend.destroy_buffer(a);
        assert_eq!(backend.live_objects(), 1);
        assert_eq!(backend.stats().invalid_destroys, 1);
    }

    #[test]
    fn test_fence_blocks_until_signaled_elsewhere() {
        let backend = HeadlessBackend::new();
        backend.set_auto_complete(false);
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer(CommandLevel::Primary).unwrap();
        backend.record(cmd, &Recording::primary()).unwrap();
        backend
            .submit(&SubmitDesc {
                command_buffer: cmd,
                wait_semaphore: None,
                wait_stage: vk::PipelineStageFlags::empty(),
                signal_semaphore: None,
                fence,
            })
            .unwrap();
        assert_eq!(backend.pending_submissions(), 1);

        let signaler = {
            let backend = backend.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                backend.complete_pending();
            })
        };
        backend.wait_fence(fence).unwrap();
        assert!(backend.fence_signaled(fence).unwrap());
        signaler.join().unwrap();
    }

    #[test]
    fn test_rerecord_in_flight_is_counted() {
        let backend = HeadlessBackend::new();
        backend.set_auto_complete(false);
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer(CommandLevel::Primary).unwrap();
        backend.record(cmd, &Recording::primary()).unwrap();
        backend
            .submit(&SubmitDesc {
                command_buffer: cmd,
                wait_semaphore: None,
                wait_stage: vk::PipelineStageFlags::empty(),
                signal_semaphore: None,
                fence,
            })
            .unwrap();

        backend.record(cmd, &Recording::primary()).unwrap();
        assert_eq!(backend.stats().in_flight_rerecords, 1);

        backend.wait_idle().unwrap();
        backend.record(cmd, &Recording::primary()).unwrap();
        assert_eq!(backend.stats().in_flight_rerecords, 1);
    }

    fn submit(backend: &HeadlessBackend, cmd: vk::CommandBuffer, fence: vk::Fence) {
        backend
            .submit(&SubmitDesc {
                command_buffer: cmd,
                wait_semaphore: None,
                wait_stage: vk::PipelineStageFlags::empty(),
                signal_semaphore: None,
                fence,
            })
            .unwrap();
    }

    #[test]
    fn test_free_in_flight_is_counted() {
        let backend = HeadlessBackend::new();
        backend.set_auto_complete(false);
        let fence = backend.create_fence(false).unwrap();
        let primary = backend.allocate_command_buffer(CommandLevel::Primary).unwrap();
        let secondary = backend.allocate_command_buffer(CommandLevel::Secondary).unwrap();
        let idle = backend.allocate_command_buffer(CommandLevel::Secondary).unwrap();
        let mut recording = Recording::primary();
        recording.push(Command::ExecuteCommands(vec![secondary]));
        backend.record(primary, &recording).unwrap();
        submit(&backend, primary, fence);

        backend.free_command_buffer(idle);
        assert_eq!(backend.stats().in_flight_frees, 0);
        backend.free_command_buffer(secondary);
        assert_eq!(backend.stats().in_flight_frees, 1);

        backend.signal_fence(fence);
        backend.free_command_buffer(primary);
        assert_eq!(backend.stats().in_flight_frees, 1);
    }

    #[test]
    fn test_layouts_follow_render_passes() {
        use crate::render_pass::{ClearFlags, RenderPassKey, TargetKind};

        let backend = HeadlessBackend::new();
        let format = vk::Format::B8G8R8A8_UNORM;
        let image = backend.fabricate_image();
        let view = backend
            .create_image_view(image, &ImageDesc::color_target(format, vk::Extent2D::default(), 1))
            .unwrap();
        let pass_for = |clear| {
            let desc = RenderPassDesc::from_key(&RenderPassKey {
                color_format: format,
                depth_format: None,
                clear,
                target: TargetKind::Surface { generation: 1 },
                stereo: false,
                samples: 1,
            });
            let render_pass = backend.create_render_pass(&desc).unwrap();
            let framebuffer = backend
                .create_framebuffer(&FramebufferDesc {
                    render_pass,
                    attachments: vec![view],
                    extent: vk::Extent2D::default(),
                })
                .unwrap();
            (render_pass, framebuffer)
        };
        let cleared = pass_for(ClearFlags::ColorAndDepth);
        let loaded = pass_for(ClearFlags::Nothing);
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer(CommandLevel::Primary).unwrap();
        let begin = |(render_pass, framebuffer): (vk::RenderPass, vk::Framebuffer)| Command::BeginRenderPass {
            render_pass,
            framebuffer,
            area: vk::Rect2D::default(),
            clear: Default::default(),
            has_depth: false,
        };

        // Loading a never-presented image is a mismatch.
        let mut recording = Recording::primary();
        recording.push(begin(loaded));
        backend.record(cmd, &recording).unwrap();
        submit(&backend, cmd, fence);
        assert_eq!(backend.stats().layout_mismatches, 1);

        let mut recording = Recording::primary();
        recording.image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        recording.push(begin(loaded));
        recording.push(begin(cleared));
        backend.record(cmd, &recording).unwrap();
        submit(&backend, cmd, fence);
        assert_eq!(backend.stats().layout_mismatches, 1);
        assert_eq!(
            backend.image_layout(image),
            Some(vk::ImageLayout::PRESENT_SRC_KHR)
        );
    }

    #[test]
    fn test_created_images_rest_in_attachment_layouts() {
        let backend = HeadlessBackend::new();
        let extent = vk::Extent2D {
            width: 4,
            height: 4,
        };
        let depth = backend
            .create_image(&ImageDesc::depth_target(vk::Format::D32_SFLOAT, extent, 1))
            .unwrap();
        assert_eq!(
            backend.image_layout(depth),
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        );

        backend.set_max_sample_count(4);
        let msaa = ImageDesc::multisampled_color(vk::Format::R8G8B8A8_UNORM, extent, 1, 4);
        let image = backend.create_image(&msaa).unwrap();
        assert_eq!(
            backend.image_layout(image),
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        );
        assert!(backend.create_image(&msaa.with_samples(8)).is_err());
    }

    #[test]
    fn test_out_of_date_until_recreated() {
        let backend = HeadlessBackend::new();
        let desc = SwapchainDesc {
            image_count: 3,
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        };
        let (swapchain, images) = backend
            .create_swapchain(&desc, vk::SwapchainKHR::null())
            .unwrap();
        assert_eq!(images.len(), 3);
        let semaphore = backend.create_semaphore().unwrap();
        assert_eq!(backend.acquire_next_image(swapchain, semaphore).unwrap(), (0, false));
        assert_eq!(backend.acquire_next_image(swapchain, semaphore).unwrap().0, 1);

        backend.inject_out_of_date();
        assert!(matches!(
            backend.acquire_next_image(swapchain, semaphore),
            Err(RhiError::SwapchainOutOfDate)
        ));
        let (replacement, _) = backend.create_swapchain(&desc, swapchain).unwrap();
        backend.destroy_swapchain(swapchain);
        assert!(backend.acquire_next_image(replacement, semaphore).is_ok());
    }
}
