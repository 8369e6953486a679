//! Graphics pipelines and the pipeline cache.
//!
//! A pipeline is an immutable compilation of two shader stages plus
//! fixed-function state, bound to one render pass. [`PipelineKey`] lists
//! everything that affects it; [`PipelineCache`] keeps exactly one pipeline
//! per key and only builds when no entry exists.
//!
//! Viewport and scissor are dynamic state and therefore not part of the key:
//! every secondary command buffer sets them when it is recorded.

use std::collections::HashMap;

use ash::vk;
use tracing::{debug, info};

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};
use crate::render_pass::RenderPassId;
use crate::shader::ShaderId;
use crate::vertex::{VertexInput, VertexLayout};

/// Primitive topology for input assembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Self::PointList => vk::PrimitiveTopology::POINT_LIST,
            Self::LineList => vk::PrimitiveTopology::LINE_LIST,
            Self::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

impl PolygonMode {
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            Self::Fill => vk::PolygonMode::FILL,
            Self::Line => vk::PolygonMode::LINE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

impl FrontFace {
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            Self::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            Self::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    #[default]
    LessOrEqual,
    Greater,
    Always,
}

impl CompareOp {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

/// Color blending presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// `src * src_alpha + dst * (1 - src_alpha)`
    AlphaBlend,
    /// `src * src_alpha + dst`
    Additive,
}

impl BlendMode {
    pub fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .color_blend_op(vk::BlendOp::ADD)
            .alpha_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO);
        match self {
            Self::Opaque => state
                .blend_enable(false)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ZERO),
            Self::AlphaBlend => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
            Self::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE),
        }
    }
}

/// Rasterizer, blend and depth-stencil state of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOp,
    pub blend: BlendMode,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_test: true,
            depth_write: true,
            depth_compare: CompareOp::LessOrEqual,
            blend: BlendMode::Opaque,
        }
    }
}

impl RenderState {
    /// Blended geometry: no depth writes, no culling.
    pub fn transparent() -> Self {
        Self {
            cull_mode: CullMode::None,
            depth_write: false,
            blend: BlendMode::AlphaBlend,
            ..Self::default()
        }
    }
}

/// Everything that determines a pipeline object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub render_pass: RenderPassId,
    pub shader: ShaderId,
    pub vertex_layout: VertexLayout,
    pub state: RenderState,
    pub attachment_count: u32,
    pub samples: u32,
    /// Instance buffer stride when instancing is on.
    pub instancing: Option<u32>,
}

/// Backend-neutral pipeline description.
#[derive(Clone, Copy, Debug)]
pub struct PipelineDesc {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub vertex_input: VertexInput,
    pub state: RenderState,
    pub has_depth: bool,
    pub samples: u32,
}

pub(crate) fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

/// Create a Vulkan graphics pipeline for subpass 0 of `desc.render_pass`.
pub(crate) fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &PipelineDesc,
) -> RhiResult<vk::Pipeline> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(desc.vertex_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(desc.fragment_module)
            .name(c"main"),
    ];

    let bindings = desc.vertex_input.bindings();
    let attributes = desc.vertex_input.attributes();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(desc.state.topology.to_vk())
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic.
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(desc.state.polygon_mode.to_vk())
        .line_width(1.0)
        .cull_mode(desc.state.cull_mode.to_vk())
        .front_face(desc.state.front_face.to_vk());

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(sample_count_flags(desc.samples));

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.has_depth && desc.state.depth_test)
        .depth_write_enable(desc.has_depth && desc.state.depth_write)
        .depth_compare_op(desc.state.depth_compare.to_vk())
        .max_depth_bounds(1.0);

    let color_blend_attachments = [desc.state.blend.to_vk()];
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, e)| RhiError::PipelineError(format!("vkCreateGraphicsPipelines: {e}")))?
    };
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| RhiError::PipelineError("driver returned no pipeline".into()))
}

/// One pipeline per [`PipelineKey`].
#[derive(Default)]
pub struct PipelineCache {
    pipelines: HashMap<PipelineKey, vk::Pipeline>,
    builds: u64,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Does a pipeline exist for `key`?
    pub fn contains(&self, key: &PipelineKey) -> bool {
        self.pipelines.contains_key(key)
    }

    pub fn get(&self, key: &PipelineKey) -> Option<vk::Pipeline> {
        self.pipelines.get(key).copied()
    }

    /// Return the pipeline for `key`, building it with `describe` only when
    /// the cache has no entry.
    pub fn get_or_build(
        &mut self,
        backend: &dyn GpuBackend,
        key: PipelineKey,
        describe: impl FnOnce() -> PipelineDesc,
    ) -> RhiResult<vk::Pipeline> {
        if let Some(pipeline) = self.get(&key) {
            return Ok(pipeline);
        }

        let pipeline = backend.create_graphics_pipeline(&describe())?;
        self.builds += 1;
        debug!(
            "Pipeline built for shader {:?} on render pass {:?}",
            key.shader, key.render_pass
        );
        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    /// Destroy every pipeline built against `render_pass`.
    ///
    /// The caller must ensure the GPU no longer uses them.
    pub fn evict_render_pass(&mut self, backend: &dyn GpuBackend, render_pass: RenderPassId) -> usize {
        let stale: Vec<PipelineKey> = self
            .pipelines
            .keys()
            .filter(|key| key.render_pass == render_pass)
            .copied()
            .collect();
        for key in &stale {
            if let Some(pipeline) = self.pipelines.remove(key) {
                backend.destroy_pipeline(pipeline);
            }
        }
        if !stale.is_empty() {
            info!(
                "Evicted {} pipeline(s) bound to render pass {:?}",
                stale.len(),
                render_pass
            );
        }
        stale.len()
    }

    /// Destroy every pipeline that uses `shader`.
    pub fn evict_shader(&mut self, backend: &dyn GpuBackend, shader: ShaderId) -> usize {
        let before = self.pipelines.len();
        self.pipelines.retain(|key, pipeline| {
            let keep = key.shader != shader;
            if !keep {
                backend.destroy_pipeline(*pipeline);
            }
            keep
        });
        before - self.pipelines.len()
    }

    pub fn clear(&mut self, backend: &dyn GpuBackend) {
        for (_, pipeline) in self.pipelines.drain() {
            backend.destroy_pipeline(pipeline);
        }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Total pipelines built over the cache's life.
    pub fn builds(&self) -> u64 {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::render_pass::{ClearFlags, RenderPassCache, RenderPassKey, TargetAttachments, TargetKind};
    use crate::vertex::VertexSlot;

    fn key(pass: RenderPassId, shader: u64) -> PipelineKey {
        PipelineKey {
            render_pass: pass,
            shader: ShaderId::from_raw(shader),
            vertex_layout: VertexLayout::from_slots(&[VertexSlot::Position, VertexSlot::Texcoord0]),
            state: RenderState::default(),
            attachment_count: 2,
            samples: 1,
            instancing: None,
        }
    }

    fn desc() -> PipelineDesc {
        PipelineDesc {
            render_pass: vk::RenderPass::null(),
            layout: vk::PipelineLayout::null(),
            vertex_module: vk::ShaderModule::null(),
            fragment_module: vk::ShaderModule::null(),
            vertex_input: VertexInput {
                layout: VertexLayout::from_slots(&[VertexSlot::Position]),
                instance_stride: None,
            },
            state: RenderState::default(),
            has_depth: true,
            samples: 1,
        }
    }

    fn passes(backend: &HeadlessBackend, count: u64) -> Vec<RenderPassId> {
        let mut cache = RenderPassCache::new();
        (0..count)
            .map(|generation| {
                cache
                    .acquire(
                        backend,
                        RenderPassKey {
                            color_format: vk::Format::B8G8R8A8_UNORM,
                            depth_format: None,
                            clear: ClearFlags::ColorAndDepth,
                            target: TargetKind::Surface { generation },
                            stereo: false,
                            samples: 1,
                        },
                        &TargetAttachments {
                            color_views: vec![backend.fabricate_view()],
                            depth_view: None,
                            resolve_view: None,
                            extent: vk::Extent2D {
                                width: 1,
                                height: 1,
                            },
                        },
                    )
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn test_get_or_build_is_idempotent() {
        let backend = HeadlessBackend::new();
        let pass = passes(&backend, 1)[0];
        let mut cache = PipelineCache::new();

        let first = cache.get_or_build(backend.as_ref(), key(pass, 1), desc).unwrap();
        let second = cache
            .get_or_build(backend.as_ref(), key(pass, 1), || panic!("rebuilt an existing key"))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.stats().pipelines_created, 1);
        assert_eq!(cache.builds(), 1);
        assert!(cache.contains(&key(pass, 1)));
    }

    #[test]
    fn test_key_components_separate_entries() {
        let backend = HeadlessBackend::new();
        let pass = passes(&backend, 1)[0];
        let mut cache = PipelineCache::new();

        let base = key(pass, 1);
        let mut instanced = base;
        instanced.instancing = Some(64);
        let mut blended = base;
        blended.state = RenderState::transparent();

        for k in [base, instanced, blended] {
            cache.get_or_build(backend.as_ref(), k, desc).unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(backend.stats().pipelines_created, 3);
    }

    #[test]
    fn test_evict_render_pass() {
        let backend = HeadlessBackend::new();
        let ids = passes(&backend, 2);
        let mut cache = PipelineCache::new();

        let old = cache.get_or_build(backend.as_ref(), key(ids[0], 1), desc).unwrap();
        cache.get_or_build(backend.as_ref(), key(ids[0], 2), desc).unwrap();
        cache.get_or_build(backend.as_ref(), key(ids[1], 1), desc).unwrap();

        assert_eq!(cache.evict_render_pass(backend.as_ref(), ids[0]), 2);
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(&key(ids[0], 1)));
        assert_eq!(backend.stats().pipelines_destroyed, 2);

        let rebuilt = cache.get_or_build(backend.as_ref(), key(ids[0], 1), desc).unwrap();
        assert_ne!(old, rebuilt);
    }

    #[test]
    fn test_evict_shader() {
        let backend = HeadlessBackend::new();
        let ids = passes(&backend, 1);
        let mut cache = PipelineCache::new();
        cache.get_or_build(backend.as_ref(), key(ids[0], 1), desc).unwrap();
        cache.get_or_build(backend.as_ref(), key(ids[0], 2), desc).unwrap();
        assert_eq!(cache.evict_shader(backend.as_ref(), ShaderId::from_raw(2)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_blend_presets() {
        assert_eq!(BlendMode::Opaque.to_vk().blend_enable, vk::FALSE);
        let alpha = BlendMode::AlphaBlend.to_vk();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(
            BlendMode::Additive.to_vk().dst_color_blend_factor,
            vk::BlendFactor::ONE
        );
    }

    #[test]
    fn test_sample_counts() {
        assert_eq!(sample_count_flags(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count_flags(3), vk::SampleCountFlags::TYPE_1);
    }
}
