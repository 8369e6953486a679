//! Render passes, framebuffers and their cache.
//!
//! A render pass is fully determined by a [`RenderPassKey`]. The cache maps
//! each key to one render pass plus the framebuffers built against it (one
//! per swapchain image for the presentation target, one for an off-screen
//! target) and hands out a [`RenderPassRef`] snapshot. Entries are reference
//! counted; the last release destroys the framebuffers, then the pass, and
//! reports the pass id so pipelines built against it can be evicted.
//!
//! Resizing the surface bumps the swapchain generation carried in the key, so
//! a resized camera asks for a new key instead of mutating a shared entry.
//!
//! A key with more than one sample describes a multisampled pass: color and
//! depth are rendered at `samples` per pixel and color is resolved into a
//! single-sample attachment at the end of the subpass. Framebuffer
//! attachments are ordered color, depth, resolve.

use std::collections::HashMap;

use ash::vk;
use tracing::{debug, info};

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::sample_count_flags;

/// What a pass does with attachment contents on load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ClearFlags {
    /// Clear color and depth.
    #[default]
    ColorAndDepth,
    /// Keep color, clear depth.
    DepthOnly,
    /// Contents are fully overwritten; the driver may discard them.
    Invalidate,
    /// Keep both.
    Nothing,
}

impl ClearFlags {
    /// `(color load op, depth load op)` for this policy.
    pub fn load_ops(self) -> (vk::AttachmentLoadOp, vk::AttachmentLoadOp) {
        match self {
            Self::ColorAndDepth => (vk::AttachmentLoadOp::CLEAR, vk::AttachmentLoadOp::CLEAR),
            Self::DepthOnly => (vk::AttachmentLoadOp::LOAD, vk::AttachmentLoadOp::CLEAR),
            Self::Invalidate => (
                vk::AttachmentLoadOp::DONT_CARE,
                vk::AttachmentLoadOp::DONT_CARE,
            ),
            Self::Nothing => (vk::AttachmentLoadOp::LOAD, vk::AttachmentLoadOp::LOAD),
        }
    }
}

/// Where a pass renders to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// The swapchain, at the given rebuild generation.
    Surface { generation: u64 },
    /// An off-screen render target.
    Offscreen { id: u64 },
}

impl TargetKind {
    /// Whether the pass renders to a presentable image.
    #[inline]
    pub fn is_present(self) -> bool {
        matches!(self, Self::Surface { .. })
    }
}

/// Everything that determines a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub clear: ClearFlags,
    pub target: TargetKind,
    pub stereo: bool,
    /// Samples per pixel. Above 1 the pass resolves color at the end.
    pub samples: u32,
}

impl RenderPassKey {
    #[inline]
    pub fn is_multisampled(&self) -> bool {
        self.samples > 1
    }
}

/// One attachment of a render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub samples: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    pub fn to_vk(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(sample_count_flags(self.samples))
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

/// Backend-neutral description of a single-subpass render pass.
#[derive(Clone, Copy, Debug)]
pub struct RenderPassDesc {
    pub color: AttachmentDesc,
    pub depth: Option<AttachmentDesc>,
    /// Single-sample attachment that a multisampled color is resolved into.
    pub resolve: Option<AttachmentDesc>,
    /// Multiview mask; `0b11` renders both eyes of a stereo target.
    pub view_mask: u32,
    pub dependencies: [vk::SubpassDependency; 2],
}

/// Layout an attachment is left in between passes that load it.
fn loaded_layout(load_op: vk::AttachmentLoadOp, resting: vk::ImageLayout) -> vk::ImageLayout {
    if load_op == vk::AttachmentLoadOp::LOAD {
        resting
    } else {
        vk::ImageLayout::UNDEFINED
    }
}

impl RenderPassDesc {
    pub fn from_key(key: &RenderPassKey) -> Self {
        let (color_load, depth_load) = key.clear.load_ops();
        let target_final = if key.target.is_present() {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
        let samples = key.samples.max(1);
        // A multisampled color stays an attachment; its resolve is what
        // gets sampled or presented.
        let color_final = if key.is_multisampled() {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            target_final
        };

        let color = AttachmentDesc {
            format: key.color_format,
            samples,
            load_op: color_load,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: loaded_layout(color_load, color_final),
            final_layout: color_final,
        };

        let resolve = key.is_multisampled().then(|| AttachmentDesc {
            format: key.color_format,
            samples: 1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: target_final,
        });

        let depth = key.depth_format.map(|format| AttachmentDesc {
            format,
            samples,
            load_op: depth_load,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: depth_load,
            stencil_store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: loaded_layout(
                depth_load,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });

        Self {
            color,
            depth,
            resolve,
            view_mask: if key.stereo { 0b11 } else { 0 },
            dependencies: subpass_dependencies(),
        }
    }
}

/// External dependencies of the single subpass.
///
/// The first waits for any earlier read of the attachments (a previous pass,
/// the presentation engine) before color writes start. The second makes the
/// color writes visible to any later read (a sampling pass or presentation).
pub fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION),
    ]
}

/// Image views a target supplies for its framebuffers.
#[derive(Clone, Debug)]
pub struct TargetAttachments {
    /// One framebuffer is built per color view.
    pub color_views: Vec<vk::ImageView>,
    pub depth_view: Option<vk::ImageView>,
    /// Single-sample view a multisampled color is resolved into.
    pub resolve_view: Option<vk::ImageView>,
    pub extent: vk::Extent2D,
}

/// Parameters for one framebuffer.
#[derive(Clone, Debug)]
pub struct FramebufferDesc {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

/// Identity of a render pass object, unique for the life of a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderPassId(u64);

impl RenderPassId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Snapshot of a cached render pass and its framebuffers.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassRef {
    pub id: RenderPassId,
    pub handle: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub has_depth: bool,
    /// Samples per pixel of the color and depth attachments.
    pub samples: u32,
    /// The pass renders into a presentable image.
    pub presents: bool,
    /// The color attachment is loaded, so the image must already be in the
    /// pass's initial layout when it begins.
    pub loads_color: bool,
}

impl RenderPassRef {
    /// Framebuffer for swapchain image `index`, or the single off-screen one.
    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        match self.framebuffers.as_slice() {
            [single] => *single,
            many => many.get(index).copied().unwrap_or_default(),
        }
    }

    /// Attachments written by the subpass: color plus depth when present.
    /// The resolve attachment is not counted.
    pub fn attachment_count(&self) -> u32 {
        if self.has_depth { 2 } else { 1 }
    }
}

struct CacheEntry {
    pass: RenderPassRef,
    refs: usize,
}

/// Reference-counted map from [`RenderPassKey`] to render pass objects.
#[derive(Default)]
pub struct RenderPassCache {
    entries: HashMap<RenderPassKey, CacheEntry>,
    next_id: u64,
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pass for `key`, building it and its framebuffers on first use.
    ///
    /// Each call takes a reference that must be returned with [`release`].
    ///
    /// [`release`]: Self::release
    pub fn acquire(
        &mut self,
        backend: &dyn GpuBackend,
        key: RenderPassKey,
        attachments: &TargetAttachments,
    ) -> RhiResult<RenderPassRef> {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refs += 1;
            return Ok(entry.pass.clone());
        }

        if key.depth_format.is_some() != attachments.depth_view.is_some() {
            return Err(RhiError::RenderPassError(format!(
                "key {:?} and attachments disagree on depth",
                key
            )));
        }
        if attachments.color_views.is_empty() {
            return Err(RhiError::RenderPassError(
                "target has no color views".into(),
            ));
        }
        if key.is_multisampled() != attachments.resolve_view.is_some() {
            return Err(RhiError::RenderPassError(format!(
                "{} sample(s) per pixel but the target {} a resolve view",
                key.samples,
                if attachments.resolve_view.is_some() { "has" } else { "lacks" }
            )));
        }

        let desc = RenderPassDesc::from_key(&key);
        let handle = backend.create_render_pass(&desc)?;

        let mut framebuffers = Vec::with_capacity(attachments.color_views.len());
        for &color in &attachments.color_views {
            let mut views = vec![color];
            views.extend(attachments.depth_view);
            views.extend(attachments.resolve_view);
            let created = backend.create_framebuffer(&FramebufferDesc {
                render_pass: handle,
                attachments: views,
                extent: attachments.extent,
            });
            match created {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    for framebuffer in framebuffers {
                        backend.destroy_framebuffer(framebuffer);
                    }
                    backend.destroy_render_pass(handle);
                    return Err(e);
                }
            }
        }

        self.next_id += 1;
        let pass = RenderPassRef {
            id: RenderPassId(self.next_id),
            handle,
            framebuffers,
            extent: attachments.extent,
            has_depth: key.depth_format.is_some(),
            samples: key.samples.max(1),
            presents: key.target.is_present(),
            loads_color: desc.color.load_op == vk::AttachmentLoadOp::LOAD,
        };
        info!(
            "Render pass {:?} created: {:?}, {} framebuffer(s) {}x{}, {}x samples",
            pass.id,
            key.clear,
            pass.framebuffers.len(),
            pass.extent.width,
            pass.extent.height,
            pass.samples
        );

        self.entries.insert(
            key,
            CacheEntry {
                pass: pass.clone(),
                refs: 1,
            },
        );
        Ok(pass)
    }

    /// Current pass for `key`, without taking a reference.
    pub fn get(&self, key: &RenderPassKey) -> Option<&RenderPassRef> {
        self.entries.get(key).map(|entry| &entry.pass)
    }

    pub fn refcount(&self, key: &RenderPassKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.refs)
    }

    /// Drop one reference to `key`.
    ///
    /// When the count reaches zero the framebuffers and the pass are destroyed
    /// and the pass id is returned. The caller must ensure the GPU no longer
    /// uses them.
    pub fn release(&mut self, backend: &dyn GpuBackend, key: &RenderPassKey) -> Option<RenderPassId> {
        let entry = self.entries.get_mut(key)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }

        let entry = self.entries.remove(key)?;
        destroy_pass(backend, &entry.pass);
        Some(entry.pass.id)
    }

    /// Destroy every entry regardless of reference counts.
    pub fn clear(&mut self, backend: &dyn GpuBackend) -> Vec<RenderPassId> {
        self.entries
            .drain()
            .map(|(_, entry)| {
                destroy_pass(backend, &entry.pass);
                entry.pass.id
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn destroy_pass(backend: &dyn GpuBackend, pass: &RenderPassRef) {
    // Framebuffers reference the pass; they go first.
    for &framebuffer in &pass.framebuffers {
        backend.destroy_framebuffer(framebuffer);
    }
    backend.destroy_render_pass(pass.handle);
    debug!("Render pass {:?} destroyed", pass.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessBackend, HeadlessEvent};

    fn surface_key(clear: ClearFlags, generation: u64) -> RenderPassKey {
        RenderPassKey {
            color_format: vk::Format::B8G8R8A8_UNORM,
            depth_format: Some(vk::Format::D32_SFLOAT),
            clear,
            target: TargetKind::Surface { generation },
            stereo: false,
            samples: 1,
        }
    }

    fn attachments(backend: &HeadlessBackend, images: usize) -> TargetAttachments {
        TargetAttachments {
            color_views: (0..images).map(|_| backend.fabricate_view()).collect(),
            depth_view: Some(backend.fabricate_view()),
            resolve_view: None,
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
        }
    }

    #[test]
    fn test_clear_table() {
        use vk::AttachmentLoadOp as Op;
        assert_eq!(ClearFlags::ColorAndDepth.load_ops(), (Op::CLEAR, Op::CLEAR));
        assert_eq!(ClearFlags::DepthOnly.load_ops(), (Op::LOAD, Op::CLEAR));
        assert_eq!(
            ClearFlags::Invalidate.load_ops(),
            (Op::DONT_CARE, Op::DONT_CARE)
        );
        assert_eq!(ClearFlags::Nothing.load_ops(), (Op::LOAD, Op::LOAD));
    }

    #[test]
    fn test_desc_layouts() {
        let present = RenderPassDesc::from_key(&surface_key(ClearFlags::ColorAndDepth, 0));
        assert_eq!(present.color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(present.color.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(present.color.store_op, vk::AttachmentStoreOp::STORE);
        let depth = present.depth.unwrap();
        assert_eq!(depth.stencil_load_op, depth.load_op);
        assert_eq!(
            depth.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        let mut key = surface_key(ClearFlags::Nothing, 0);
        key.target = TargetKind::Offscreen { id: 3 };
        key.stereo = true;
        let offscreen = RenderPassDesc::from_key(&key);
        assert_eq!(
            offscreen.color.final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(offscreen.color.initial_layout, offscreen.color.final_layout);
        assert_eq!(offscreen.view_mask, 0b11);
        assert!(offscreen.resolve.is_none());
    }

    #[test]
    fn test_multisampled_desc_resolves_color() {
        let mut key = surface_key(ClearFlags::ColorAndDepth, 0);
        key.target = TargetKind::Offscreen { id: 1 };
        key.samples = 4;
        let desc = RenderPassDesc::from_key(&key);

        assert_eq!(desc.color.samples, 4);
        assert_eq!(desc.depth.unwrap().samples, 4);
        assert_eq!(
            desc.color.final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        let resolve = desc.resolve.unwrap();
        assert_eq!(resolve.samples, 1);
        assert_eq!(resolve.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(
            resolve.final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn test_multisampled_pass_needs_resolve_view() {
        let backend = HeadlessBackend::new();
        let mut cache = RenderPassCache::new();
        let mut key = surface_key(ClearFlags::ColorAndDepth, 0);
        key.target = TargetKind::Offscreen { id: 1 };
        key.samples = 4;

        let mut targets = attachments(&backend, 1);
        assert!(matches!(
            cache.acquire(backend.as_ref(), key, &targets),
            Err(RhiError::RenderPassError(_))
        ));

        targets.resolve_view = Some(backend.fabricate_view());
        let pass = cache.acquire(backend.as_ref(), key, &targets).unwrap();
        assert_eq!(pass.samples, 4);
        assert!(!pass.presents);
        assert_eq!(pass.attachment_count(), 2);
    }

    #[test]
    fn test_pass_reports_color_load() {
        let backend = HeadlessBackend::new();
        let mut cache = RenderPassCache::new();
        let targets = attachments(&backend, 2);
        let cleared = cache
            .acquire(backend.as_ref(), surface_key(ClearFlags::ColorAndDepth, 0), &targets)
            .unwrap();
        let loaded = cache
            .acquire(backend.as_ref(), surface_key(ClearFlags::DepthOnly, 0), &targets)
            .unwrap();
        assert!(cleared.presents && !cleared.loads_color);
        assert!(loaded.presents && loaded.loads_color);
    }

    #[test]
    fn test_dependencies() {
        let [incoming, outgoing] = subpass_dependencies();
        assert_eq!(incoming.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(incoming.dst_subpass, 0);
        assert_eq!(incoming.src_access_mask, vk::AccessFlags::MEMORY_READ);
        assert_eq!(outgoing.src_subpass, 0);
        assert_eq!(outgoing.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(outgoing.dst_access_mask, vk::AccessFlags::MEMORY_READ);
    }

    #[test]
    fn test_same_key_same_object() {
        let backend = HeadlessBackend::new();
        let mut cache = RenderPassCache::new();
        let key = surface_key(ClearFlags::ColorAndDepth, 0);
        let targets = attachments(&backend, 3);

        let first = cache.acquire(backend.as_ref(), key, &targets).unwrap();
        let second = cache.acquire(backend.as_ref(), key, &targets).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.framebuffers.len(), 3);
        assert_eq!(backend.stats().render_passes_created, 1);
        assert_eq!(backend.stats().framebuffers_created, 3);
        assert_eq!(cache.refcount(&key), 2);
    }

    #[test]
    fn test_distinct_keys_distinct_objects() {
        let backend = HeadlessBackend::new();
        let mut cache = RenderPassCache::new();
        let targets = attachments(&backend, 2);

        let keys = [
            surface_key(ClearFlags::ColorAndDepth, 0),
            surface_key(ClearFlags::DepthOnly, 0),
            surface_key(ClearFlags::ColorAndDepth, 1),
        ];
        let passes: Vec<_> = keys
            .iter()
            .map(|key| cache.acquire(backend.as_ref(), *key, &targets).unwrap())
            .collect();
        for (i, a) in passes.iter().enumerate() {
            for b in &passes[i + 1..] {
                assert_ne!(a.handle, b.handle);
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn test_last_release_destroys_framebuffers_then_pass() {
        let backend = HeadlessBackend::new();
        let mut cache = RenderPassCache::new();
        let key = surface_key(ClearFlags::ColorAndDepth, 0);
        let targets = attachments(&backend, 2);

        let pass = cache.acquire(backend.as_ref(), key, &targets).unwrap();
        cache.acquire(backend.as_ref(), key, &targets).unwrap();

        assert_eq!(cache.release(backend.as_ref(), &key), None);
        assert_eq!(cache.release(backend.as_ref(), &key), Some(pass.id));
        assert!(cache.is_empty());

        let events = backend.events();
        let pass_pos = events
            .iter()
            .position(|e| *e == HeadlessEvent::DestroyRenderPass(pass.handle))
            .unwrap();
        for framebuffer in &pass.framebuffers {
            let fb_pos = events
                .iter()
                .position(|e| *e == HeadlessEvent::DestroyFramebuffer(*framebuffer))
                .unwrap();
            assert!(fb_pos < pass_pos);
        }
    }

    #[test]
    fn test_depth_mismatch_rejected() {
        let backend = HeadlessBackend::new();
        let mut cache = RenderPassCache::new();
        let mut targets = attachments(&backend, 1);
        targets.depth_view = None;
        let result = cache.acquire(
            backend.as_ref(),
            surface_key(ClearFlags::ColorAndDepth, 0),
            &targets,
        );
        assert!(matches!(result, Err(RhiError::RenderPassError(_))));
        assert_eq!(backend.stats().render_passes_created, 0);
    }

    #[test]
    fn test_framebuffer_lookup() {
        let pass = RenderPassRef {
            id: RenderPassId(1),
            handle: vk::RenderPass::null(),
            framebuffers: vec![vk::Framebuffer::null()],
            extent: vk::Extent2D::default(),
            has_depth: true,
            samples: 1,
            presents: false,
            loads_color: false,
        };
        // A single framebuffer serves every image index.
        assert_eq!(pass.framebuffer(2), vk::Framebuffer::null());
        assert_eq!(pass.attachment_count(), 2);
    }
}
