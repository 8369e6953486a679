//! Cameras: one viewpoint, one render pass, one sorted list of drawables.
//!
//! A camera moves through three states each [`Camera::update`]:
//!
//! - [`CameraState::RenderPassDirty`]: the target, clear policy or stereo
//!   flag changed, or the surface was resized. The pass and its framebuffers
//!   are rebuilt and every drawable's commands go stale.
//! - [`CameraState::InstancesDirty`]: some drawables changed material,
//!   geometry or binding. Only their secondary command buffers are
//!   re-recorded.
//! - [`CameraState::Clean`]: nothing to rebuild.
//!
//! The camera never owns drawables. It keeps one record per registered
//! [`DrawableId`] holding the secondary command buffer, the per-draw
//! uniform buffer and what the commands were recorded against.

use std::sync::Arc;

use glam::{Mat4, Vec4};
use kiln_core::Handle;
use kiln_resources::ubo::{
    CAMERA_POSITION_PROPERTY, CameraUniforms, DrawUniforms, PROJECTION_PROPERTY, VIEW_PROJECTION_PROPERTY,
    VIEW_PROPERTY,
};
use kiln_rhi::command::{ClearValues, Recording};
use kiln_rhi::pipeline::{PipelineDesc, PipelineKey};
use kiln_rhi::render_pass::{ClearFlags, RenderPassId, RenderPassKey, RenderPassRef, TargetAttachments, TargetKind};
use kiln_rhi::resource::GpuBuffer;
use kiln_rhi::swapchain::Swapchain;
use kiln_rhi::vertex::VertexInput;
use kiln_rhi::{RhiResult, vk};
use kiln_scene::{Eye, Projection, Transform, view_matrix};
use tracing::{debug, trace, warn};

use crate::context::RenderContext;
use crate::drawable::{DrawableId, DrawableTable, Geometry, InstanceData};
use crate::material::MaterialId;
use crate::program::PropertyValue;
use crate::release::Retired;
use crate::texture::RenderTarget;

pub type CameraId = Handle<Camera>;

/// Material properties receiving per-eye view-projection matrices.
pub const VIEW_PROJECTION_LEFT_PROPERTY: &str = "view_projection_left";
pub const VIEW_PROJECTION_RIGHT_PROPERTY: &str = "view_projection_right";

/// Default distance between the eyes of a stereo camera, in world units.
pub const DEFAULT_EYE_SEPARATION: f32 = 0.064;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Clean,
    RenderPassDirty,
    InstancesDirty,
}

/// Viewport rectangle in fractions of the target size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for ViewportRect {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

impl ViewportRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Pixel viewport inside `extent`.
    pub fn viewport(&self, extent: vk::Extent2D) -> vk::Viewport {
        vk::Viewport {
            x: self.x * extent.width as f32,
            y: self.y * extent.height as f32,
            width: self.width * extent.width as f32,
            height: self.height * extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn scissor(&self, extent: vk::Extent2D) -> vk::Rect2D {
        let viewport = self.viewport(extent);
        vk::Rect2D {
            offset: vk::Offset2D {
                x: viewport.x.max(0.0) as i32,
                y: viewport.y.max(0.0) as i32,
            },
            extent: vk::Extent2D {
                width: viewport.width.max(0.0) as u32,
                height: viewport.height.max(0.0) as u32,
            },
        }
    }

    /// Width over height of the pixel viewport inside `extent`.
    ///
    /// A degenerate viewport (zero or negative width or height, as with a
    /// minimized window) reports `1.0` so projections stay finite.
    ///
    /// # Example
    ///
    /// ```
    /// use kiln_renderer::ViewportRect;
    /// use kiln_rhi::vk;
    ///
    /// let rect = ViewportRect::default();
    /// let extent = vk::Extent2D { width: 200, height: 100 };
    /// assert_eq!(rect.aspect(extent), 2.0);
    /// assert_eq!(rect.aspect(vk::Extent2D { width: 200, height: 0 }), 1.0);
    /// ```
    pub fn aspect(&self, extent: vk::Extent2D) -> f32 {
        let viewport = self.viewport(extent);
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            return 1.0;
        }
        viewport.width / viewport.height
    }
}

/// The presentation surface as a camera sees it.
#[derive(Clone, Debug)]
pub struct SurfaceTarget {
    pub format: vk::Format,
    pub depth_format: vk::Format,
    pub generation: u64,
    pub attachments: TargetAttachments,
}

impl SurfaceTarget {
    pub fn from_swapchain(swapchain: &Swapchain) -> Self {
        Self {
            format: swapchain.format(),
            depth_format: swapchain.depth_format(),
            generation: swapchain.generation(),
            attachments: swapchain.attachments(),
        }
    }
}

/// What one [`Camera::update`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub pass_rebuilt: bool,
    pub rerecorded: usize,
    pub pruned: usize,
}

/// What a secondary command buffer was recorded against.
#[derive(Clone, Copy, Debug, PartialEq)]
struct RecordedState {
    pass: RenderPassId,
    material: MaterialId,
    binding_epoch: u64,
    drawable_epoch: u64,
    rect: ViewportRect,
}

/// Render-side state of one registered drawable.
struct DrawRecord {
    drawable: DrawableId,
    seq: u64,
    /// `(has_material, queue)`; records without a material sort first.
    sort_key: (bool, i32),
    cmd: Option<vk::CommandBuffer>,
    draw_set: vk::DescriptorSet,
    draw_buffer: GpuBuffer,
    recorded: Option<RecordedState>,
    geometry: Option<Geometry>,
    instances: Option<InstanceData>,
}

impl DrawRecord {
    fn retire(self, ctx: &mut RenderContext) {
        if let Some(cmd) = self.cmd {
            ctx.retire(Retired::CommandBuffer(cmd));
        }
        ctx.retire(Retired::DescriptorSet(self.draw_set));
        ctx.retire(Retired::Buffer(self.draw_buffer));
        if let Some(geometry) = self.geometry {
            ctx.retire(Retired::Geometry(geometry));
        }
        if let Some(instances) = self.instances {
            ctx.retire(Retired::Instances(instances));
        }
    }
}

pub struct Camera {
    id: Option<CameraId>,
    clear: ClearFlags,
    clear_values: ClearValues,
    rect: ViewportRect,
    target: Option<Arc<RenderTarget>>,
    projection: Projection,
    depth: i32,
    culling_mask: u32,
    stereo: bool,
    eye_separation: f32,
    transform: Transform,

    uniforms: CameraUniforms,
    uniforms_dirty: bool,
    pass: Option<(RenderPassKey, RenderPassRef)>,
    pass_dirty: bool,
    order_dirty: bool,
    records: Vec<DrawRecord>,
    next_seq: u64,
    draw_list: Vec<vk::CommandBuffer>,
    primary_epoch: u64,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera {
    pub fn new() -> Self {
        Self {
            id: None,
            clear: ClearFlags::ColorAndDepth,
            clear_values: ClearValues::default(),
            rect: ViewportRect::default(),
            target: None,
            projection: Projection::default(),
            depth: 0,
            culling_mask: u32::MAX,
            stereo: false,
            eye_separation: DEFAULT_EYE_SEPARATION,
            transform: Transform::default(),
            uniforms: CameraUniforms::new(Mat4::IDENTITY, Mat4::IDENTITY, glam::Vec3::ZERO),
            uniforms_dirty: true,
            pass: None,
            pass_dirty: true,
            order_dirty: false,
            records: Vec::new(),
            next_seq: 0,
            draw_list: Vec::new(),
            primary_epoch: 0,
        }
    }

    pub(crate) fn set_id(&mut self, id: CameraId) {
        self.id = Some(id);
    }

    pub fn id(&self) -> Option<CameraId> {
        self.id
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn clear_flags(&self) -> ClearFlags {
        self.clear
    }

    /// Choose which attachments the camera's pass clears.
    ///
    /// # Arguments
    ///
    /// * `clear` - Load behavior of color and depth. Anything but
    ///   [`ClearFlags::ColorAndDepth`] keeps what earlier cameras drew.
    ///
    /// Changing the flags rebuilds the render pass on the next update.
    pub fn set_clear_flags(&mut self, clear: ClearFlags) {
        if self.clear != clear {
            self.clear = clear;
            self.pass_dirty = true;
        }
    }

    pub fn clear_values(&self) -> ClearValues {
        self.clear_values
    }

    /// Set the color used when the pass clears, keeping depth and stencil.
    ///
    /// # Example
    ///
    /// ```
    /// use glam::Vec4;
    /// use kiln_renderer::Camera;
    ///
    /// let mut camera = Camera::new();
    /// let epoch = camera.primary_epoch();
    /// camera.set_clear_color(Vec4::new(0.1, 0.2, 0.3, 1.0));
    /// assert_eq!(camera.clear_values().color, [0.1, 0.2, 0.3, 1.0]);
    /// assert_ne!(camera.primary_epoch(), epoch);
    /// ```
    pub fn set_clear_color(&mut self, color: Vec4) {
        self.set_clear_values(ClearValues {
            color: color.to_array(),
            ..self.clear_values
        });
    }

    /// Clear values live in the primary command buffer only.
    pub fn set_clear_values(&mut self, values: ClearValues) {
        if self.clear_values != values {
            self.clear_values = values;
            self.primary_epoch += 1;
        }
    }

    pub fn rect(&self) -> ViewportRect {
        self.rect
    }

    /// Set the normalized viewport rectangle.
    ///
    /// # Arguments
    ///
    /// * `rect` - Position and size as fractions of the target extent
    pub fn set_rect(&mut self, rect: ViewportRect) {
        if self.rect != rect {
            self.rect = rect;
            self.uniforms_dirty = true;
        }
    }

    pub fn target(&self) -> Option<&Arc<RenderTarget>> {
        self.target.as_ref()
    }

    /// Render into `target`, or into the swapchain with `None`.
    ///
    /// A multisampled target makes the camera's pass resolve into the
    /// target's texture.
    pub fn set_target(&mut self, target: Option<Arc<RenderTarget>>) {
        let same = match (&self.target, &target) {
            (Some(a), Some(b)) => a.id() == b.id(),
            (None, None) => true,
            _ => false,
        };
        if !same {
            self.target = target;
            self.pass_dirty = true;
            self.uniforms_dirty = true;
        }
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Replace the projection. The aspect ratio always comes from the
    /// viewport, so only field of view or size and the clip planes are set.
    pub fn set_projection(&mut self, projection: Projection) {
        if self.projection != projection {
            self.projection = projection;
            self.uniforms_dirty = true;
        }
    }

    /// Perspective projection.
    ///
    /// # Arguments
    ///
    /// * `fov_y` - Vertical field of view in radians
    /// * `near`, `far` - Clip plane distances
    pub fn set_perspective(&mut self, fov_y: f32, near: f32, far: f32) {
        self.set_projection(Projection::Perspective { fov_y, near, far });
    }

    /// Orthographic projection.
    ///
    /// # Arguments
    ///
    /// * `size` - Half of the visible height in world units
    /// * `near`, `far` - Clip plane distances
    pub fn set_orthographic(&mut self, size: f32, near: f32, far: f32) {
        self.set_projection(Projection::Orthographic { size, near, far });
    }

    /// Cameras render in ascending depth.
    pub fn depth(&self) -> i32 {
        self.depth
    }

    /// Reorder this camera among the others. Takes effect in the next
    /// primary recording.
    pub fn set_depth(&mut self, depth: i32) {
        if self.depth != depth {
            self.depth = depth;
            self.primary_epoch += 1;
        }
    }

    pub fn culling_mask(&self) -> u32 {
        self.culling_mask
    }

    /// Draw only drawables whose layer mask shares a bit with `mask`.
    pub fn set_culling_mask(&mut self, mask: u32) {
        self.culling_mask = mask;
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    /// Render both eyes in one multiview pass.
    ///
    /// Needs a layered off-screen target and a device with multiview;
    /// otherwise the flag is dropped with a warning on the next update.
    pub fn set_stereo(&mut self, stereo: bool) {
        if self.stereo != stereo {
            self.stereo = stereo;
            self.pass_dirty = true;
            self.uniforms_dirty = true;
        }
    }

    /// Distance between the eyes of a stereo camera, in world units.
    pub fn set_eye_separation(&mut self, separation: f32) {
        self.eye_separation = separation;
        self.uniforms_dirty = true;
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Place the camera. Matrices are recomputed on the next update.
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.uniforms_dirty = true;
    }

    pub fn uniforms(&self) -> &CameraUniforms {
        &self.uniforms
    }

    // =========================================================================
    // State
    // =========================================================================

    /// What the next [`Camera::update`] has to do.
    pub fn state(&self) -> CameraState {
        if self.pass_dirty || self.pass.is_none() {
            CameraState::RenderPassDirty
        } else if self.records.iter().any(|r| r.recorded.is_none()) {
            CameraState::InstancesDirty
        } else {
            CameraState::Clean
        }
    }

    /// Current render pass.
    pub fn render_pass(&self) -> Option<&RenderPassRef> {
        self.pass.as_ref().map(|(_, pass)| pass)
    }

    /// Key of the current render pass, `None` before the first update.
    pub fn render_pass_key(&self) -> Option<&RenderPassKey> {
        self.pass.as_ref().map(|(key, _)| key)
    }

    /// Secondaries the primary executes, in draw order.
    pub fn draw_list(&self) -> &[vk::CommandBuffer] {
        &self.draw_list
    }

    /// Changes whenever the primary command buffer must be re-recorded.
    pub fn primary_epoch(&self) -> u64 {
        self.primary_epoch
    }

    /// Registered drawables in sort order.
    pub fn renderers(&self) -> impl Iterator<Item = DrawableId> + '_ {
        self.records.iter().map(|r| r.drawable)
    }

    /// Number of registered drawables, enabled or not.
    pub fn renderer_count(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, drawable: DrawableId) -> bool {
        self.records.iter().any(|r| r.drawable == drawable)
    }

    /// Secondary command buffer recorded for `drawable`.
    pub fn command_buffer(&self, drawable: DrawableId) -> Option<vk::CommandBuffer> {
        self.records
            .iter()
            .find(|r| r.drawable == drawable)
            .and_then(|r| r.cmd)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register `drawable`. Returns `false` if it already is registered or
    /// does not exist.
    pub fn add_renderer(
        &mut self,
        ctx: &mut RenderContext,
        drawables: &mut DrawableTable,
        id: DrawableId,
    ) -> RhiResult<bool> {
        if self.contains(id) {
            return Ok(false);
        }
        let Some(drawable) = drawables.get_mut(id) else {
            warn!("add_renderer: drawable {:?} does not exist", id);
            return Ok(false);
        };
        drawable.check();

        let (draw_set, draw_buffer) = ctx.allocate_draw_set()?;
        draw_buffer.write(0, bytemuck::bytes_of(&DrawUniforms::new(drawable.world_matrix())))?;
        if let Some(camera) = self.id {
            drawable.attached(camera);
        }
        let material = effective_material(ctx, drawable.material());
        let sort_key = sort_key(ctx, drawable.material());

        self.next_seq += 1;
        self.records.push(DrawRecord {
            drawable: id,
            seq: self.next_seq,
            sort_key,
            cmd: None,
            draw_set,
            draw_buffer,
            recorded: None,
            geometry: None,
            instances: None,
        });
        self.push_uniforms(ctx, material);
        self.order_dirty = true;
        trace!("Drawable {:?} registered with camera {:?}", id, self.id);
        Ok(true)
    }

    /// Unregister `drawable`.
    ///
    /// Its command buffer and uniform buffer go through the release queue,
    /// so they outlive every frame that may still execute them.
    pub fn remove_renderer(
        &mut self,
        ctx: &mut RenderContext,
        drawables: &mut DrawableTable,
        id: DrawableId,
    ) -> bool {
        let Some(index) = self.records.iter().position(|r| r.drawable == id) else {
            return false;
        };
        self.records.remove(index).retire(ctx);
        if let Some(drawable) = drawables.get_mut(id)
            && drawable.camera() == self.id
        {
            drawable.detached();
        }
        trace!("Drawable {:?} removed from camera {:?}", id, self.id);
        true
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn on_resize(&mut self) {
        self.pass_dirty = true;
        self.uniforms_dirty = true;
        self.invalidate_instances();
    }

    /// The surface and command buffers may not survive a pause.
    pub fn on_pause(&mut self) {
        self.pass_dirty = true;
        self.invalidate_instances();
    }

    fn invalidate_instances(&mut self) {
        for record in &mut self.records {
            record.recorded = None;
        }
    }

    /// Unregister everything and hand every GPU object back to `ctx`.
    pub(crate) fn release(&mut self, ctx: &mut RenderContext, drawables: &mut DrawableTable) -> RhiResult<()> {
        for record in &self.records {
            if let Some(drawable) = drawables.get_mut(record.drawable)
                && drawable.camera() == self.id
            {
                drawable.detached();
            }
        }
        self.release_gpu(ctx)
    }

    /// Like [`release`](Self::release), for when the drawables are out of
    /// reach.
    pub(crate) fn release_gpu(&mut self, ctx: &mut RenderContext) -> RhiResult<()> {
        for record in self.records.drain(..) {
            record.retire(ctx);
        }
        self.draw_list.clear();
        self.release_pass(ctx)
    }

    fn release_pass(&mut self, ctx: &mut RenderContext) -> RhiResult<()> {
        if let Some((key, _)) = self.pass.take() {
            ctx.quiesce()?;
            if let Some(id) = ctx.render_passes.release(ctx.backend.as_ref(), &key) {
                ctx.pipelines.evict_render_pass(ctx.backend.as_ref(), id);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Update
    // =========================================================================

    fn pass_key(&self, surface: &SurfaceTarget) -> RenderPassKey {
        match &self.target {
            Some(target) => RenderPassKey {
                color_format: target.color_format(),
                depth_format: target.depth_format(),
                clear: self.clear,
                target: TargetKind::Offscreen { id: target.id() },
                stereo: self.stereo,
                samples: target.samples(),
            },
            None => RenderPassKey {
                color_format: surface.format,
                depth_format: Some(surface.depth_format),
                clear: self.clear,
                target: TargetKind::Surface {
                    generation: surface.generation,
                },
                stereo: false,
                samples: 1,
            },
        }
    }

    fn check_stereo(&mut self, ctx: &RenderContext) {
        if !self.stereo {
            return;
        }
        let layered = self.target.as_ref().is_some_and(|t| t.layers() >= 2);
        if !layered || !ctx.backend.supports_multiview() {
            warn!(
                "Camera {:?}: stereo needs a layered render target and multiview; stereo disabled",
                self.id
            );
            self.stereo = false;
            self.pass_dirty = true;
        }
    }

    fn extent(&self, surface: &SurfaceTarget) -> vk::Extent2D {
        match &self.pass {
            Some((_, pass)) => pass.extent,
            None => self
                .target
                .as_ref()
                .map_or(surface.attachments.extent, |t| t.extent()),
        }
    }

    fn compute_uniforms(&mut self, extent: vk::Extent2D) {
        let world = self.transform.local_matrix();
        let view = view_matrix(world);
        let projection = self.projection.matrix(self.rect.aspect(extent));
        self.uniforms = CameraUniforms::new(view, projection, self.transform.position);
        self.uniforms_dirty = false;
    }

    /// Write this camera's matrices into `material` where it declares them.
    fn push_uniforms(&self, ctx: &mut RenderContext, material: MaterialId) {
        let uniforms = self.uniforms;
        let stereo = self.stereo.then(|| {
            [Eye::Left, Eye::Right].map(|eye| {
                uniforms.projection * eye.view_matrix(uniforms.view, self.eye_separation)
            })
        });
        let Some(material) = ctx.material_mut(material) else {
            return;
        };
        material.set_if_declared(VIEW_PROPERTY, PropertyValue::Mat4(uniforms.view));
        material.set_if_declared(PROJECTION_PROPERTY, PropertyValue::Mat4(uniforms.projection));
        material.set_if_declared(
            VIEW_PROJECTION_PROPERTY,
            PropertyValue::Mat4(uniforms.view_projection),
        );
        material.set_if_declared(
            CAMERA_POSITION_PROPERTY,
            PropertyValue::Vec3(uniforms.camera_position),
        );
        if let Some([left, right]) = stereo {
            material.set_if_declared(VIEW_PROJECTION_LEFT_PROPERTY, PropertyValue::Mat4(left));
            material.set_if_declared(VIEW_PROJECTION_RIGHT_PROPERTY, PropertyValue::Mat4(right));
        }
    }

    /// Bring the render pass, the draw order and every stale secondary up
    /// to date, and write per-draw uniforms from the drawables' transforms.
    pub fn update(
        &mut self,
        ctx: &mut RenderContext,
        drawables: &mut DrawableTable,
        surface: &SurfaceTarget,
    ) -> RhiResult<UpdateReport> {
        let mut report = UpdateReport::default();
        self.check_stereo(ctx);

        // Render pass.
        let key = self.pass_key(surface);
        let key_changed = self.pass.as_ref().is_none_or(|(current, _)| *current != key);
        if self.pass_dirty || key_changed {
            self.release_pass(ctx)?;
            let attachments = match &self.target {
                Some(target) => target.attachments(),
                None => surface.attachments.clone(),
            };
            let pass = ctx
                .render_passes
                .acquire(ctx.backend.as_ref(), key, &attachments)?;
            debug!(
                "Camera {:?} render pass {:?} ({}x{})",
                self.id, pass.id, pass.extent.width, pass.extent.height
            );
            self.pass = Some((key, pass));
            self.pass_dirty = false;
            self.uniforms_dirty = true;
            self.invalidate_instances();
            self.primary_epoch += 1;
            report.pass_rebuilt = true;
        }
        let Some((_, pass)) = self.pass.clone() else {
            return Ok(report);
        };

        // Drawables removed from the scene.
        let before = self.records.len();
        let (live, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| drawables.contains(r.drawable));
        self.records = live;
        for record in gone {
            record.retire(ctx);
        }
        report.pruned = before - self.records.len();

        // Camera matrices.
        if self.uniforms_dirty {
            self.compute_uniforms(pass.extent);
            let mut materials: Vec<MaterialId> = self
                .records
                .iter()
                .filter_map(|r| drawables.get(r.drawable))
                .map(|d| effective_material(ctx, d.material()))
                .collect();
            materials.sort_unstable();
            materials.dedup();
            for material in materials {
                self.push_uniforms(ctx, material);
            }
        }

        // Draw order.
        for record in &mut self.records {
            if let Some(drawable) = drawables.get(record.drawable) {
                let key = sort_key(ctx, drawable.material());
                if key != record.sort_key {
                    record.sort_key = key;
                    self.order_dirty = true;
                }
            }
        }
        if self.order_dirty {
            self.records.sort_by_key(|r| (r.sort_key, r.seq));
            self.order_dirty = false;
        }

        // Per-draw uniforms and stale secondaries.
        for index in 0..self.records.len() {
            let id = self.records[index].drawable;
            let Some(drawable) = drawables.get_mut(id) else {
                continue;
            };
            let enabled = drawable.check();
            let world = drawable.world_matrix();
            self.records[index]
                .draw_buffer
                .write(0, bytemuck::bytes_of(&DrawUniforms::new(world)))?;
            if !enabled {
                continue;
            }

            let material_id = effective_material(ctx, drawable.material());
            let Some(material) = ctx.material(material_id) else {
                continue;
            };
            let state = RecordedState {
                pass: pass.id,
                material: material_id,
                binding_epoch: material.binding_epoch(),
                drawable_epoch: drawable.epoch(),
                rect: self.rect,
            };
            if self.records[index].recorded == Some(state) {
                continue;
            }
            let material_changed = self.records[index]
                .recorded
                .is_none_or(|r| r.material != material_id);

            // The buffer may be pending in a submitted primary.
            if self.records[index].cmd.is_some() {
                ctx.quiesce()?;
            }
            let geometry = drawable.geometry().cloned();
            let instances = drawable.instances().cloned();
            if let Some(geometry) = &geometry {
                self.record_secondary(ctx, index, &pass, material_id, geometry, instances.as_ref())?;
            }
            let record = &mut self.records[index];
            record.recorded = Some(state);
            record.geometry = geometry;
            record.instances = instances;
            if material_changed {
                self.push_uniforms(ctx, material_id);
            }
            report.rerecorded += 1;
        }

        // The list the primary executes.
        let draw_list: Vec<vk::CommandBuffer> = self
            .records
            .iter()
            .filter(|r| {
                drawables.get(r.drawable).is_some_and(|d| {
                    d.is_enabled() && d.layer_mask() & self.culling_mask != 0
                })
            })
            .filter_map(|r| r.cmd)
            .collect();
        if draw_list != self.draw_list {
            self.draw_list = draw_list;
            self.primary_epoch += 1;
        }

        if report.rerecorded > 0 || report.pruned > 0 {
            debug!(
                "Camera {:?} updated: {} re-recorded, {} pruned",
                self.id, report.rerecorded, report.pruned
            );
        }
        Ok(report)
    }

    fn record_secondary(
        &mut self,
        ctx: &mut RenderContext,
        index: usize,
        pass: &RenderPassRef,
        material_id: MaterialId,
        geometry: &Geometry,
        instances: Option<&InstanceData>,
    ) -> RhiResult<()> {
        let Some(material) = ctx.material(material_id) else {
            return Ok(());
        };
        let program = material.program().clone();
        let material_set = material.descriptor_set();
        let instance_stride = instances.map(|i| i.stride);

        let key = PipelineKey {
            render_pass: pass.id,
            shader: program.id(),
            vertex_layout: program.vertex_layout(),
            state: program.state(),
            attachment_count: pass.attachment_count(),
            samples: pass.samples,
            instancing: instance_stride,
        };
        let layout = ctx.pipeline_layout();
        let pipeline = ctx.pipelines.get_or_build(ctx.backend.as_ref(), key, || PipelineDesc {
            render_pass: pass.handle,
            layout,
            vertex_module: program.vertex_module().handle(),
            fragment_module: program.fragment_module().handle(),
            vertex_input: VertexInput {
                layout: program.vertex_layout(),
                instance_stride,
            },
            state: program.state(),
            has_depth: pass.has_depth,
            samples: pass.samples,
        })?;

        let record = &mut self.records[index];
        let mut vertex_buffers = vec![geometry.vertices.handle()];
        vertex_buffers.extend(instances.map(|i| i.buffer.handle()));
        let mut recording = Recording::secondary(pass.handle);
        recording
            .bind_pipeline(pipeline)
            .set_viewport(self.rect.viewport(pass.extent))
            .set_scissor(self.rect.scissor(pass.extent))
            .bind_descriptor_sets(layout, 0, vec![material_set, record.draw_set])
            .bind_vertex_buffers(0, vertex_buffers)
            .bind_index_buffer(geometry.indices.handle(), geometry.index_type)
            .draw_indexed(
                geometry.index_count,
                instances.map_or(1, |i| i.count),
                geometry.first_index,
            );

        let cmd = match record.cmd {
            Some(cmd) => cmd,
            None => {
                let cmd = ctx
                    .backend
                    .allocate_command_buffer(kiln_rhi::command::CommandLevel::Secondary)?;
                record.cmd = Some(cmd);
                cmd
            }
        };
        ctx.backend.record(cmd, &recording)?;
        trace!(
            "Recorded secondary {:?} for drawable {:?} with shader {:?}",
            cmd,
            record.drawable,
            program.id()
        );
        Ok(())
    }
}

/// The material a drawable draws with: its own if it still exists, the
/// default otherwise.
fn effective_material(ctx: &RenderContext, material: Option<MaterialId>) -> MaterialId {
    material
        .filter(|id| ctx.material(*id).is_some())
        .unwrap_or_else(|| ctx.default_material())
}

fn sort_key(ctx: &RenderContext, material: Option<MaterialId>) -> (bool, i32) {
    material
        .and_then(|id| ctx.material(id))
        .map_or((false, 0), |m| (true, m.queue()))
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.id)
            .field("clear", &self.clear)
            .field("depth", &self.depth)
            .field("stereo", &self.stereo)
            .field("renderers", &self.records.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use kiln_resources::MeshData;
    use kiln_rhi::headless::HeadlessBackend;
    use kiln_rhi::swapchain::PresentPolicy;

    use crate::context::tests::context;
    use crate::drawable::Drawable;
    use crate::texture::RenderTargetDesc;

    struct Fixture {
        backend: Arc<HeadlessBackend>,
        ctx: RenderContext,
        swapchain: Swapchain,
        drawables: DrawableTable,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = HeadlessBackend::new();
            let ctx = context(&backend);
            let swapchain = Swapchain::new(backend.clone(), 800, 600, PresentPolicy::default()).unwrap();
            Self {
                backend,
                ctx,
                swapchain,
                drawables: DrawableTable::new(),
            }
        }

        fn surface(&self) -> SurfaceTarget {
            SurfaceTarget::from_swapchain(&self.swapchain)
        }

        fn cube(&mut self) -> DrawableId {
            let geometry = Geometry::upload(self.ctx.backend().clone(), &MeshData::cube(1.0)).unwrap();
            self.drawables.insert(Drawable::mesh(geometry, Mat4::IDENTITY))
        }

        fn update(&mut self, camera: &mut Camera) -> UpdateReport {
            let surface = self.surface();
            camera.update(&mut self.ctx, &mut self.drawables, &surface).unwrap()
        }
    }

    #[test]
    fn test_first_update_builds_everything() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        assert!(camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap());
        assert!(!camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap());
        assert_eq!(camera.state(), CameraState::RenderPassDirty);

        let report = fx.update(&mut camera);
        assert!(report.pass_rebuilt);
        assert_eq!(report.rerecorded, 1);
        assert_eq!(camera.state(), CameraState::Clean);
        assert_eq!(camera.draw_list().len(), 1);

        let report = fx.update(&mut camera);
        assert!(!report.pass_rebuilt);
        assert_eq!(report.rerecorded, 0);
        assert_eq!(fx.backend.stats().pipelines_created, 1);
    }

    #[test]
    fn test_secondary_binds_material_then_draw_set() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);

        let cmd = camera.command_buffer(a).unwrap();
        let recording = fx.backend.recording(cmd).unwrap();
        assert_eq!(recording.draw_count(), 1);
        let material_set = fx.ctx.material(fx.ctx.default_material()).unwrap().descriptor_set();
        assert!(recording.commands().iter().any(|c| matches!(
            c,
            kiln_rhi::command::Command::BindDescriptorSets { first_set: 0, sets, .. }
                if sets.len() == 2 && sets[0] == material_set
        )));
    }

    #[test]
    fn test_uniforms_reach_material() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        camera.set_transform(Transform::new().with_position(Vec3::new(0.0, 0.0, 5.0)));
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);

        let material = fx.ctx.material(fx.ctx.default_material()).unwrap();
        assert_eq!(
            material.property(VIEW_PROJECTION_PROPERTY),
            Some(PropertyValue::Mat4(camera.uniforms().view_projection))
        );
        // The unlit block does not declare the camera position.
        assert!(material.property(CAMERA_POSITION_PROPERTY).is_none());
    }

    #[test]
    fn test_removed_drawable_is_pruned() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        let b = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, b).unwrap();
        fx.update(&mut camera);
        let epoch = camera.primary_epoch();

        fx.drawables.remove(a);
        let report = fx.update(&mut camera);
        assert_eq!(report.pruned, 1);
        assert_eq!(camera.renderer_count(), 1);
        assert_eq!(camera.draw_list().len(), 1);
        assert!(camera.primary_epoch() > epoch);
    }

    #[test]
    fn test_culling_mask_filters_draw_list() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        let b = fx.cube();
        fx.drawables.get_mut(b).unwrap().set_layer(3);
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, b).unwrap();
        camera.set_culling_mask(1 << 3);
        fx.update(&mut camera);
        assert_eq!(camera.draw_list(), &[camera.command_buffer(b).unwrap()]);
    }

    #[test]
    fn test_disabled_drawable_is_skipped() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let broken = fx
            .drawables
            .insert(Drawable::new(crate::drawable::DrawableKind::Sprite, Mat4::IDENTITY));
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, broken).unwrap();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);
        assert!(!fx.drawables.get(broken).unwrap().is_enabled());
        assert!(camera.command_buffer(broken).is_none());
        assert_eq!(camera.draw_list().len(), 1);
    }

    #[test]
    fn test_stereo_without_layered_target_is_dropped() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        camera.set_stereo(true);
        fx.update(&mut camera);
        assert!(!camera.is_stereo());
        assert!(!camera.render_pass_key().unwrap().stereo);
    }

    #[test]
    fn test_stereo_on_layered_target() {
        let mut fx = Fixture::new();
        fx.backend.set_multiview(true);
        let target = fx
            .ctx
            .create_render_target(RenderTargetDesc::new(64, 64).stereo())
            .unwrap();
        let mut camera = Camera::new();
        camera.set_target(Some(target.clone()));
        camera.set_stereo(true);
        fx.update(&mut camera);
        assert!(camera.is_stereo());
        let key = camera.render_pass_key().unwrap();
        assert!(key.stereo);
        assert_eq!(key.target, TargetKind::Offscreen { id: target.id() });
        assert_eq!(camera.render_pass().unwrap().extent.width, 64);
    }

    #[test]
    fn test_multisampled_target_threads_sample_count() {
        let mut fx = Fixture::new();
        let target = fx
            .ctx
            .create_render_target(RenderTargetDesc::new(64, 64).with_samples(4))
            .unwrap();
        let mut camera = Camera::new();
        camera.set_target(Some(target));
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);

        assert_eq!(camera.render_pass_key().unwrap().samples, 4);
        let pass = camera.render_pass().unwrap();
        assert_eq!(pass.samples, 4);
        let program = fx
            .ctx
            .material(fx.ctx.default_material())
            .unwrap()
            .program()
            .clone();
        assert!(fx.ctx.pipelines().contains(&PipelineKey {
            render_pass: pass.id,
            shader: program.id(),
            vertex_layout: program.vertex_layout(),
            state: program.state(),
            attachment_count: pass.attachment_count(),
            samples: 4,
            instancing: None,
        }));
    }

    #[test]
    fn test_aspect_of_degenerate_viewport() {
        let rect = ViewportRect::default();
        let flat = vk::Extent2D {
            width: 640,
            height: 0,
        };
        assert_eq!(rect.aspect(flat), 1.0);
        assert_eq!(rect.aspect(vk::Extent2D::default()), 1.0);
        assert_eq!(ViewportRect::new(0.0, 0.0, 0.5, 0.0).aspect(flat), 1.0);
        assert_eq!(
            ViewportRect::new(0.0, 0.0, 0.5, 1.0).aspect(vk::Extent2D {
                width: 400,
                height: 100
            }),
            2.0
        );

        let mut camera = Camera::new();
        camera.compute_uniforms(flat);
        assert!(camera.uniforms().view_projection.is_finite());
    }

    #[test]
    fn test_clear_color_changes_primary_only() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);
        let epoch = camera.primary_epoch();

        camera.set_clear_color(Vec4::new(0.2, 0.3, 0.4, 1.0));
        let report = fx.update(&mut camera);
        assert_eq!(report.rerecorded, 0);
        assert!(!report.pass_rebuilt);
        assert_eq!(camera.primary_epoch(), epoch + 1);
    }

    #[test]
    fn test_clear_flags_rebuild_pass() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);
        let old = camera.render_pass().unwrap().id;

        camera.set_clear_flags(ClearFlags::DepthOnly);
        let report = fx.update(&mut camera);
        assert!(report.pass_rebuilt);
        assert_eq!(report.rerecorded, 1);
        assert_ne!(camera.render_pass().unwrap().id, old);
        assert_eq!(fx.ctx.render_passes().len(), 1);
    }

    #[test]
    fn test_release_returns_everything() {
        let mut fx = Fixture::new();
        let mut camera = Camera::new();
        let a = fx.cube();
        camera.add_renderer(&mut fx.ctx, &mut fx.drawables, a).unwrap();
        fx.update(&mut camera);
        camera.release(&mut fx.ctx, &mut fx.drawables).unwrap();
        assert!(fx.ctx.render_passes().is_empty());
        assert!(fx.ctx.pipelines().is_empty());
        assert_eq!(fx.ctx.pending_releases(), 0);
    }
}
