//! The per-frame loop.
//!
//! [`FrameDriver::draw_frame`] runs one frame:
//!
//! 1. Wait for the next ring slot ([`SyncRing::begin_frame`]).
//! 2. Acquire a swapchain image. An out-of-date swapchain skips the frame
//!    and schedules a rebuild.
//! 3. Update every camera in ascending depth, then drain the asset loader
//!    and flush material uniforms. A fatal loader error ends the frame
//!    with that error.
//! 4. Re-record the image's primary command buffer if the camera set, a
//!    camera's clear values or any camera's draw list changed.
//! 5. Submit (wait on image acquired, signal render complete and the slot
//!    fence), present, and advance the ring.
//!
//! There is one primary command buffer per swapchain image, since each one
//! begins the render passes on that image's framebuffers. When the first
//! pass on the swapchain image loads its color attachment, the primary opens
//! with a barrier that moves the freshly acquired image into the layout that
//! pass expects. A primary with no pass on the swapchain image ends with the
//! same barrier so the image can be presented.

use std::sync::Arc;

use kiln_core::{Arena, EngineConfig, FrameConfig};
use kiln_rhi::backend::GpuBackend;
use kiln_rhi::command::{CommandLevel, Recording};
use kiln_rhi::resource::GpuImage;
use kiln_rhi::swapchain::{PresentPolicy, Swapchain};
use kiln_rhi::sync::SyncRing;
use kiln_rhi::{RhiResult, vk};
use tracing::{debug, info, trace, warn};

use crate::camera::{Camera, CameraId, SurfaceTarget};
use crate::context::RenderContext;
use crate::drawable::{DrawableId, DrawableTable};
use crate::loader::AssetLoader;

/// What happened to one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The swapchain went stale; it is rebuilt before the next frame.
    Skipped,
    /// Paused or minimized; nothing was touched.
    Paused,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub primary_rebuilds: u64,
    pub swapchain_rebuilds: u64,
}

struct Primary {
    cmd: vk::CommandBuffer,
    dirty: bool,
}

pub struct FrameDriver {
    cameras: Arena<Camera>,
    /// Creation order; the stable tie-break between equal depths.
    camera_order: Vec<CameraId>,
    primaries: Vec<Primary>,
    /// Slot fence of the last submission that used each swapchain image.
    image_fences: Vec<Option<vk::Fence>>,
    /// `(camera, primary epoch)` the primaries were recorded against.
    signature: Vec<(CameraId, u64)>,
    loader: AssetLoader,
    config: FrameConfig,
    suspended: bool,
    minimized: bool,
    needs_rebuild: bool,
    size: (u32, u32),
    frame: u64,
    stats: FrameStats,
    sync: SyncRing,
    swapchain: Swapchain,
    ctx: RenderContext,
}

impl FrameDriver {
    /// Driver over a surface of `width` x `height`, compiling shaders as
    /// `config.shaders` says.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        config: &EngineConfig,
        width: u32,
        height: u32,
    ) -> kiln_core::Result<Self> {
        let ctx = RenderContext::new(backend, &config.shaders, config.frames.frames_in_flight)?;
        Self::with_context(ctx, config, width, height)
    }

    pub fn with_context(
        ctx: RenderContext,
        config: &EngineConfig,
        width: u32,
        height: u32,
    ) -> kiln_core::Result<Self> {
        let backend = ctx.backend().clone();
        let swapchain = Swapchain::new(
            backend.clone(),
            width,
            height,
            PresentPolicy::from(&config.frames),
        )?;
        let sync = SyncRing::new(backend.clone(), config.frames.frames_in_flight)?;
        let loader = AssetLoader::new(config.loader.threads)?;

        let mut driver = Self {
            cameras: Arena::new(),
            camera_order: Vec::new(),
            primaries: Vec::new(),
            image_fences: Vec::new(),
            signature: Vec::new(),
            loader,
            config: config.frames.clone(),
            suspended: false,
            minimized: false,
            needs_rebuild: false,
            size: (width, height),
            frame: 0,
            stats: FrameStats::default(),
            sync,
            swapchain,
            ctx,
        };
        driver.allocate_primaries()?;
        info!(
            "Frame driver ready: {} swapchain image(s), {} frame(s) in flight",
            driver.swapchain.image_count(),
            config.frames.frames_in_flight
        );
        Ok(driver)
    }

    fn allocate_primaries(&mut self) -> RhiResult<()> {
        self.free_primaries();
        let count = self.swapchain.image_count() as usize;
        for _ in 0..count {
            let cmd = self
                .ctx
                .backend()
                .allocate_command_buffer(CommandLevel::Primary)?;
            self.primaries.push(Primary { cmd, dirty: true });
        }
        self.image_fences = vec![None; count];
        Ok(())
    }

    fn free_primaries(&mut self) {
        for primary in self.primaries.drain(..) {
            self.ctx.backend().free_command_buffer(primary.cmd);
        }
    }

    fn mark_primaries_dirty(&mut self) {
        for primary in &mut self.primaries {
            primary.dirty = true;
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.ctx
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn loader(&mut self) -> &mut AssetLoader {
        &mut self.loader
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_paused(&self) -> bool {
        self.suspended || self.minimized
    }

    /// Primary command buffer of swapchain image `index`.
    pub fn primary(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.primaries.get(index).map(|p| p.cmd)
    }

    // =========================================================================
    // Cameras
    // =========================================================================

    pub fn create_camera(&mut self) -> CameraId {
        let id = self.cameras.insert(Camera::new());
        if let Some(camera) = self.cameras.get_mut(id) {
            camera.set_id(id);
        }
        self.camera_order.push(id);
        debug!("Camera {:?} created", id);
        id
    }

    /// Destroy a camera and unregister its drawables.
    pub fn destroy_camera(&mut self, id: CameraId, drawables: &mut DrawableTable) -> RhiResult<bool> {
        let Some(mut camera) = self.cameras.remove(id) else {
            return Ok(false);
        };
        self.camera_order.retain(|c| *c != id);
        camera.release(&mut self.ctx, drawables)?;
        debug!("Camera {:?} destroyed", id);
        Ok(true)
    }

    pub fn camera(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(id)
    }

    pub fn camera_mut(&mut self, id: CameraId) -> Option<&mut Camera> {
        self.cameras.get_mut(id)
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    /// Register `drawable` with `camera`, moving it off any other camera.
    pub fn attach(
        &mut self,
        camera: CameraId,
        drawable: DrawableId,
        drawables: &mut DrawableTable,
    ) -> RhiResult<bool> {
        if !self.cameras.contains(camera) {
            warn!("attach: camera {:?} does not exist", camera);
            return Ok(false);
        }
        if let Some(current) = drawables.get(drawable).and_then(|d| d.camera()) {
            if current == camera {
                return Ok(false);
            }
            self.detach(drawable, drawables);
        }
        match self.cameras.get_mut(camera) {
            Some(target) => target.add_renderer(&mut self.ctx, drawables, drawable),
            None => Ok(false),
        }
    }

    /// Unregister `drawable` from whichever camera has it.
    pub fn detach(&mut self, drawable: DrawableId, drawables: &mut DrawableTable) -> bool {
        let Some(camera) = drawables.get(drawable).and_then(|d| d.camera()) else {
            return false;
        };
        match self.cameras.get_mut(camera) {
            Some(camera) => camera.remove_renderer(&mut self.ctx, drawables, drawable),
            None => false,
        }
    }

    /// Cameras in render order: ascending depth, then creation order.
    pub fn render_order(&self) -> Vec<CameraId> {
        let mut order = self.camera_order.clone();
        order.sort_by_key(|id| self.cameras.get(*id).map_or(0, Camera::depth));
        order
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// The window was resized. A zero size pauses rendering until a
    /// non-zero size arrives.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            if !self.minimized {
                info!("Surface minimized; rendering paused");
            }
            self.minimized = true;
            return;
        }
        if self.minimized {
            info!("Surface restored at {}x{}", width, height);
        }
        self.minimized = false;
        self.size = (width, height);
        self.needs_rebuild = true;
    }

    /// The application went to the background.
    pub fn on_pause(&mut self) -> RhiResult<()> {
        if self.suspended {
            return Ok(());
        }
        info!("Rendering paused");
        self.suspended = true;
        self.ctx.quiesce()?;
        for (_, camera) in self.cameras.iter_mut() {
            camera.on_pause();
        }
        self.mark_primaries_dirty();
        Ok(())
    }

    pub fn on_resume(&mut self) {
        if self.suspended {
            info!("Rendering resumed");
            self.suspended = false;
            self.needs_rebuild = true;
        }
    }

    /// Returns `false` when the surface is zero-sized and nothing was
    /// rebuilt; the rebuild stays scheduled.
    fn rebuild_swapchain(&mut self) -> RhiResult<bool> {
        let (width, height) = self.size;
        self.ctx.quiesce()?;
        if !self.swapchain.recreate(width, height)? {
            return Ok(false);
        }
        self.allocate_primaries()?;
        for (_, camera) in self.cameras.iter_mut() {
            camera.on_resize();
        }
        self.needs_rebuild = false;
        self.stats.swapchain_rebuilds += 1;
        info!(
            "Swapchain rebuilt: {}x{}, generation {}",
            self.swapchain.extent().width,
            self.swapchain.extent().height,
            self.swapchain.generation()
        );
        Ok(true)
    }

    /// Drop the current slot after a failed acquire.
    fn abandon_frame(&mut self) -> RhiResult<()> {
        let stale = self.sync.current().fence;
        self.sync.abandon_frame()?;
        for fence in &mut self.image_fences {
            if *fence == Some(stale) {
                *fence = None;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Render and present one frame.
    ///
    /// A stale swapchain is rebuilt here and the frame reported as
    /// [`FrameOutcome::Skipped`]. A surface that reports a zero size while a
    /// rebuild is due reports [`FrameOutcome::Paused`] and the rebuild is
    /// retried on the next call.
    ///
    /// # Errors
    ///
    /// Every error returned is fatal: device failures from acquire, submit
    /// or present, and fatal errors raised by asset loader completions.
    pub fn draw_frame(&mut self, drawables: &mut DrawableTable) -> kiln_core::Result<FrameOutcome> {
        if self.is_paused() {
            return Ok(FrameOutcome::Paused);
        }
        if self.needs_rebuild && !self.rebuild_swapchain()? {
            debug!("Surface reports a zero extent; frame paused");
            return Ok(FrameOutcome::Paused);
        }

        let slot = *self.sync.begin_frame()?;
        let image_index = match self.swapchain.acquire_next(slot.image_acquired) {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("Swapchain suboptimal; rebuilding after this frame");
                    self.needs_rebuild = true;
                }
                index
            }
            Err(e) if e.is_recoverable() => {
                warn!("Acquire failed ({}); skipping frame", e);
                self.abandon_frame()?;
                self.needs_rebuild = true;
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        let image = image_index as usize;

        // Another slot may still be rendering to this image.
        if let Some(previous) = self.image_fences.get(image).copied().flatten()
            && previous != slot.fence
        {
            self.ctx.backend().wait_fence(previous)?;
        }
        if let Some(fence) = self.image_fences.get_mut(image) {
            *fence = Some(slot.fence);
        }

        self.frame += 1;
        self.ctx.begin_frame(self.frame);

        // Cameras, then the loader's completions.
        let surface = SurfaceTarget::from_swapchain(&self.swapchain);
        let order = self.render_order();
        let mut rerecorded = 0;
        for id in &order {
            if let Some(camera) = self.cameras.get_mut(*id) {
                rerecorded += camera.update(&mut self.ctx, drawables, &surface)?.rerecorded;
            }
        }
        self.loader.drain(&mut self.ctx, drawables)?;
        self.ctx.flush_materials()?;

        let signature: Vec<(CameraId, u64)> = order
            .iter()
            .filter_map(|id| self.cameras.get(*id).map(|c| (*id, c.primary_epoch())))
            .collect();
        if signature != self.signature {
            self.signature = signature;
            self.mark_primaries_dirty();
        } else if self.config.strict_command_reuse && rerecorded > 0 {
            self.mark_primaries_dirty();
        }

        let Some(primary) = self.primaries.get(image).map(|p| (p.cmd, p.dirty)) else {
            return Err(kiln_rhi::RhiError::InvalidHandle(format!(
                "no primary for swapchain image {image}"
            ))
            .into());
        };
        let (cmd, dirty) = primary;
        if dirty {
            self.record_primary(cmd, &order, image)?;
            if let Some(primary) = self.primaries.get_mut(image) {
                primary.dirty = false;
            }
            self.stats.primary_rebuilds += 1;
        }

        self.sync.submit(cmd)?;
        self.ctx.note_submission();
        let outcome = match self.sync.present(self.swapchain.handle(), image_index) {
            Ok(suboptimal) => {
                if suboptimal {
                    self.needs_rebuild = true;
                }
                self.stats.frames_presented += 1;
                FrameOutcome::Presented
            }
            Err(e) if e.is_recoverable() => {
                warn!("Present failed ({}); rebuilding swapchain", e);
                self.needs_rebuild = true;
                self.stats.frames_skipped += 1;
                FrameOutcome::Skipped
            }
            Err(e) => return Err(e.into()),
        };
        self.sync.advance();
        trace!("Frame {} done: {:?}", self.frame, outcome);
        Ok(outcome)
    }

    fn record_primary(&self, cmd: vk::CommandBuffer, order: &[CameraId], image: usize) -> RhiResult<()> {
        let mut recording = Recording::primary();
        let target = self.swapchain.image(image).map(GpuImage::handle);
        let mut surface_touched = false;
        for id in order {
            let Some(camera) = self.cameras.get(*id) else {
                continue;
            };
            let Some(pass) = camera.render_pass() else {
                continue;
            };
            // An acquired image has undefined contents and layout.
            if pass.presents && !surface_touched {
                surface_touched = true;
                if pass.loads_color
                    && let Some(target) = target
                {
                    recording.image_barrier(
                        target,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::PRESENT_SRC_KHR,
                    );
                }
            }
            recording.begin_render_pass(
                pass.handle,
                pass.framebuffer(image),
                pass.extent,
                camera.clear_values(),
                pass.has_depth,
            );
            if !camera.draw_list().is_empty() {
                recording.execute_commands(camera.draw_list().to_vec());
            }
            recording.end_render_pass();
        }
        // Nothing rendered to the image; it still has to be presentable.
        if !surface_touched && let Some(target) = target {
            recording.image_barrier(
                target,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
        }
        self.ctx.backend().record(cmd, &recording)?;
        debug!(
            "Primary for image {} recorded: {} camera(s)",
            image,
            recording.render_passes().len()
        );
        Ok(())
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.backend().wait_idle() {
            warn!("wait_idle failed while destroying frame driver: {}", e);
        }
        for (_, camera) in self.cameras.iter_mut() {
            if let Err(e) = camera.release_gpu(&mut self.ctx) {
                warn!("Camera release failed: {}", e);
            }
        }
        self.free_primaries();
        debug!("Frame driver destroyed");
    }
}
