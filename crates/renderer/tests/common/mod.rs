//! Shared fixtures for the renderer integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use glam::Mat4;
use kiln_core::EngineConfig;
use kiln_renderer::{Drawable, DrawableId, DrawableTable, FrameDriver, Geometry, MaterialId, RenderContext};
use kiln_resources::MeshData;
use kiln_rhi::RhiResult;
use kiln_rhi::headless::HeadlessBackend;
use kiln_rhi::shader::{SPIRV_MAGIC, ShaderCache, ShaderCompiler, ShaderStage};

/// Produces a header-only SPIR-V module for any source.
pub struct StubCompiler;

impl ShaderCompiler for StubCompiler {
    fn compile(&self, _stage: ShaderStage, _source: &str, _label: &str) -> RhiResult<Vec<u32>> {
        Ok(vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0])
    }
}

pub fn context(backend: &Arc<HeadlessBackend>, frames_in_flight: usize) -> RenderContext {
    RenderContext::with_shader_cache(
        backend.clone(),
        ShaderCache::disabled(Box::new(StubCompiler)),
        frames_in_flight,
    )
    .unwrap()
}

pub fn driver_with(backend: &Arc<HeadlessBackend>, config: &EngineConfig) -> FrameDriver {
    let ctx = context(backend, config.frames.frames_in_flight);
    FrameDriver::with_context(ctx, config, 800, 600).unwrap()
}

pub fn driver(backend: &Arc<HeadlessBackend>) -> FrameDriver {
    driver_with(backend, &EngineConfig::default())
}

pub fn cube(driver: &FrameDriver, drawables: &mut DrawableTable, material: Option<MaterialId>) -> DrawableId {
    let geometry = Geometry::upload(driver.context().backend().clone(), &MeshData::cube(1.0)).unwrap();
    let mut drawable = Drawable::mesh(geometry, Mat4::IDENTITY);
    drawable.set_material(material);
    drawables.insert(drawable)
}

/// A material on the built-in program with render queue `queue`.
pub fn material(driver: &mut FrameDriver, queue: i32) -> MaterialId {
    let ctx = driver.context_mut();
    let program = ctx.default_program().clone();
    let id = ctx.create_material(program).unwrap();
    ctx.material_mut(id).unwrap().set_queue(queue);
    id
}

/// Draw one frame per swapchain image.
pub fn draw_round(driver: &mut FrameDriver, drawables: &mut DrawableTable) {
    for _ in 0..driver.swapchain().image_count() {
        driver.draw_frame(drawables).unwrap();
    }
}
