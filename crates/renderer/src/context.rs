//! The render context: device handle plus every cache, passed explicitly to
//! whatever needs a lookup.
//!
//! Nothing here is global. Tests build as many contexts as they like, each
//! over its own [`HeadlessBackend`](kiln_rhi::headless::HeadlessBackend).

use std::sync::Arc;

use kiln_core::{Arena, ShaderConfig};
use kiln_resources::ImageData;
use kiln_resources::ubo::DrawUniforms;
use kiln_rhi::backend::GpuBackend;
use kiln_rhi::descriptor::{DRAW_UNIFORM_BINDING, DescriptorWrite, draw_set_bindings, material_set_bindings};
use kiln_rhi::pipeline::PipelineCache;
use kiln_rhi::render_pass::RenderPassCache;
use kiln_rhi::resource::{BufferUsage, GpuBuffer, SamplerDesc};
use kiln_rhi::shader::{NagaCompiler, ShaderCache, ShaderId, ShaderStage};
use kiln_rhi::{RhiResult, vk};
use tracing::{debug, info, warn};

use crate::material::{Material, MaterialId};
use crate::program::{ProgramDesc, ShaderProgram, unlit_desc};
use crate::release::{ReleaseQueue, Retired};
use crate::texture::{RenderTarget, RenderTargetDesc, Texture};

pub struct RenderContext {
    pub(crate) backend: Arc<dyn GpuBackend>,
    pub(crate) render_passes: RenderPassCache,
    pub(crate) pipelines: PipelineCache,
    shaders: ShaderCache,
    next_shader_id: u64,
    next_target_id: u64,
    material_layout: vk::DescriptorSetLayout,
    draw_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    materials: Arena<Material>,
    default_texture: Arc<Texture>,
    default_program: Arc<ShaderProgram>,
    default_material: MaterialId,
    released: ReleaseQueue,
    frame: u64,
    idle_since_submit: bool,
    idle_waits: u64,
}

impl RenderContext {
    /// Context with a GLSL compiler behind the on-disk shader cache
    /// described by `config`.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        config: &ShaderConfig,
        frames_in_flight: usize,
    ) -> RhiResult<Self> {
        let shaders = if config.cache_enabled {
            ShaderCache::new(config.cache_dir.clone(), Box::new(NagaCompiler))?
        } else {
            ShaderCache::disabled(Box::new(NagaCompiler))
        };
        Self::with_shader_cache(backend, shaders, frames_in_flight)
    }

    pub fn with_shader_cache(
        backend: Arc<dyn GpuBackend>,
        mut shaders: ShaderCache,
        frames_in_flight: usize,
    ) -> RhiResult<Self> {
        let material_layout = backend.create_descriptor_set_layout(&material_set_bindings())?;
        let layouts = backend
            .create_descriptor_set_layout(&draw_set_bindings())
            .and_then(|draw_layout| {
                backend
                    .create_pipeline_layout(&[material_layout, draw_layout])
                    .map(|pipeline_layout| (draw_layout, pipeline_layout))
                    .inspect_err(|_| backend.destroy_descriptor_set_layout(draw_layout))
            });
        let (draw_layout, pipeline_layout) = match layouts {
            Ok(layouts) => layouts,
            Err(e) => {
                backend.destroy_descriptor_set_layout(material_layout);
                return Err(e);
            }
        };

        let defaults = (|| -> RhiResult<(Arc<Texture>, Arc<ShaderProgram>, Material)> {
            let texture = Arc::new(Texture::white(backend.clone())?);
            let program = Arc::new(compile_program(&backend, &mut shaders, 1, &unlit_desc())?);
            let material =
                Material::new(backend.clone(), program.clone(), material_layout, texture.clone())?;
            Ok((texture, program, material))
        })();
        let (default_texture, default_program, material) = match defaults {
            Ok(defaults) => defaults,
            Err(e) => {
                backend.destroy_pipeline_layout(pipeline_layout);
                backend.destroy_descriptor_set_layout(draw_layout);
                backend.destroy_descriptor_set_layout(material_layout);
                return Err(e);
            }
        };
        let mut materials = Arena::new();
        let default_material = materials.insert(material);

        let ctx = Self {
            render_passes: RenderPassCache::new(),
            pipelines: PipelineCache::new(),
            shaders,
            next_shader_id: 1,
            next_target_id: 0,
            material_layout,
            draw_layout,
            pipeline_layout,
            materials,
            default_texture,
            default_program,
            default_material,
            released: ReleaseQueue::new(frames_in_flight),
            frame: 0,
            idle_since_submit: false,
            idle_waits: 0,
            backend,
        };
        info!(
            "Render context ready on {} ({} frames in flight)",
            ctx.backend.name(),
            frames_in_flight
        );
        Ok(ctx)
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn render_passes(&self) -> &RenderPassCache {
        &self.render_passes
    }

    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shaders
    }

    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    #[inline]
    pub fn material_layout(&self) -> vk::DescriptorSetLayout {
        self.material_layout
    }

    /// Compile (or load from the shader cache) and create a program.
    pub fn create_program(&mut self, desc: &ProgramDesc<'_>) -> RhiResult<Arc<ShaderProgram>> {
        self.next_shader_id += 1;
        let program = compile_program(&self.backend, &mut self.shaders, self.next_shader_id, desc)?;
        debug!("Program '{}' created as {:?}", desc.label, program.id());
        Ok(Arc::new(program))
    }

    /// Destroy every pipeline built from `program`.
    ///
    /// Waits for the device first. Materials still using the program will
    /// rebuild their pipelines on next use.
    pub fn unload_program(&mut self, program: &ShaderProgram) -> RhiResult<usize> {
        self.quiesce()?;
        Ok(self
            .pipelines
            .evict_shader(self.backend.as_ref(), program.id()))
    }

    pub fn default_program(&self) -> &Arc<ShaderProgram> {
        &self.default_program
    }

    pub fn default_texture(&self) -> &Arc<Texture> {
        &self.default_texture
    }

    /// Material used to draw drawables that have none.
    pub fn default_material(&self) -> MaterialId {
        self.default_material
    }

    pub fn create_texture(&self, image: &ImageData) -> RhiResult<Arc<Texture>> {
        Texture::from_image(self.backend.clone(), image, SamplerDesc::default()).map(Arc::new)
    }

    pub fn create_render_target(&mut self, desc: RenderTargetDesc) -> RhiResult<Arc<RenderTarget>> {
        self.next_target_id += 1;
        RenderTarget::new(self.backend.clone(), self.next_target_id, desc).map(Arc::new)
    }

    pub fn create_material(&mut self, program: Arc<ShaderProgram>) -> RhiResult<MaterialId> {
        let material = Material::new(
            self.backend.clone(),
            program,
            self.material_layout,
            self.default_texture.clone(),
        )?;
        Ok(self.materials.insert(material))
    }

    pub fn material(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id)
    }

    pub fn material_mut(&mut self, id: MaterialId) -> Option<&mut Material> {
        self.materials.get_mut(id)
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Bind `texture` to material `id`.
    ///
    /// Only secondaries that draw with this material are re-recorded.
    /// Returns `false` for an unknown material.
    pub fn set_material_texture(&mut self, id: MaterialId, texture: Arc<Texture>) -> RhiResult<bool> {
        let layout = self.material_layout;
        let Some(material) = self.materials.get_mut(id) else {
            warn!("set_material_texture on unknown material {:?}", id);
            return Ok(false);
        };
        let (old_set, old_texture) = material.replace_texture(layout, texture)?;
        self.retire(Retired::DescriptorSet(old_set));
        self.retire(Retired::Texture(old_texture));
        Ok(true)
    }

    /// Destroy a material once frames in flight are done with it.
    ///
    /// Drawables still pointing at it fall back to the default material.
    pub fn destroy_material(&mut self, id: MaterialId) -> bool {
        if id == self.default_material {
            warn!("The default material cannot be destroyed");
            return false;
        }
        match self.materials.remove(id) {
            Some(material) => {
                self.retire(Retired::Material(Box::new(material)));
                true
            }
            None => false,
        }
    }

    /// Push staged property values of every material to the GPU.
    pub fn flush_materials(&mut self) -> RhiResult<usize> {
        let mut flushed = 0;
        for (_, material) in self.materials.iter_mut() {
            if material.flush()? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Per-draw uniform buffer and the set that binds it.
    pub(crate) fn allocate_draw_set(&self) -> RhiResult<(vk::DescriptorSet, GpuBuffer)> {
        let buffer = GpuBuffer::new(
            self.backend.clone(),
            BufferUsage::Uniform,
            DrawUniforms::size() as u64,
        )?;
        let set = self.backend.allocate_descriptor_set(self.draw_layout)?;
        self.backend.write_descriptor_set(
            set,
            &[DescriptorWrite::UniformBuffer {
                binding: DRAW_UNIFORM_BINDING,
                buffer: buffer.handle(),
                offset: 0,
                range: buffer.size(),
            }],
        );
        Ok((set, buffer))
    }

    /// Hand `item` to the release queue.
    pub fn retire(&mut self, item: Retired) {
        self.released.retire(self.frame, item);
    }

    pub fn pending_releases(&self) -> usize {
        self.released.len()
    }

    /// Current frame number, as started by the frame driver.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Start frame `frame`: release what no frame in flight can still use.
    pub(crate) fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
        self.released.collect(self.backend.as_ref(), frame);
    }

    /// A submission was made; the next [`quiesce`](Self::quiesce) must wait.
    pub(crate) fn note_submission(&mut self) {
        self.idle_since_submit = false;
    }

    /// Make sure the GPU is not executing anything recorded so far.
    ///
    /// Waits for the device at most once between submissions and releases
    /// the whole release queue, since nothing in it can be in use any more.
    pub fn quiesce(&mut self) -> RhiResult<()> {
        if !self.idle_since_submit {
            self.backend.wait_idle()?;
            self.idle_since_submit = true;
            self.idle_waits += 1;
        }
        self.released.flush(self.backend.as_ref());
        Ok(())
    }

    /// Device-idle waits issued through [`quiesce`](Self::quiesce).
    pub fn idle_waits(&self) -> u64 {
        self.idle_waits
    }
}

fn compile_program(
    backend: &Arc<dyn GpuBackend>,
    shaders: &mut ShaderCache,
    id: u64,
    desc: &ProgramDesc<'_>,
) -> RhiResult<ShaderProgram> {
    let vertex_code = shaders.load_or_compile(ShaderStage::Vertex, desc.vertex_source, desc.label)?;
    let fragment_code =
        shaders.load_or_compile(ShaderStage::Fragment, desc.fragment_source, desc.label)?;
    ShaderProgram::from_spirv(
        backend.clone(),
        ShaderId::from_raw(id),
        desc,
        &vertex_code,
        &fragment_code,
    )
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            warn!("wait_idle failed while destroying render context: {}", e);
        }
        self.released.flush(self.backend.as_ref());
        self.materials = Arena::new();
        self.pipelines.clear(self.backend.as_ref());
        self.render_passes.clear(self.backend.as_ref());
        self.backend.destroy_pipeline_layout(self.pipeline_layout);
        self.backend.destroy_descriptor_set_layout(self.draw_layout);
        self.backend.destroy_descriptor_set_layout(self.material_layout);
        debug!("Render context destroyed");
    }
}
