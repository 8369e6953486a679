//! Materials: a program, a render queue, named properties and the GPU
//! objects that carry them.
//!
//! Property writes only touch a CPU copy of the uniform block; the block is
//! flushed into the uniform buffer before the frame is submitted, so changing
//! a value never re-records a command buffer. Swapping the texture does need
//! new commands: it allocates a fresh descriptor set and bumps
//! [`Material::binding_epoch`], which is what cameras compare to decide
//! whether a drawable's secondary command buffer is stale.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec4};
use kiln_core::Handle;
use kiln_rhi::backend::GpuBackend;
use kiln_rhi::descriptor::{
    DescriptorWrite, MATERIAL_SAMPLER_BINDING, MATERIAL_TEXTURE_BINDING, MATERIAL_UNIFORM_BINDING,
};
use kiln_rhi::resource::{BufferUsage, GpuBuffer};
use kiln_rhi::{RhiResult, vk};
use tracing::warn;

use crate::program::{PropertyValue, ShaderProgram};
use crate::texture::Texture;

pub type MaterialId = Handle<Material>;

pub struct Material {
    backend: Arc<dyn GpuBackend>,
    program: Arc<ShaderProgram>,
    queue: i32,
    values: HashMap<String, PropertyValue>,
    block: Vec<u8>,
    uniforms_dirty: bool,
    uniform_buffer: GpuBuffer,
    texture: Arc<Texture>,
    descriptor_set: vk::DescriptorSet,
    binding_epoch: u64,
}

impl Material {
    pub(crate) fn new(
        backend: Arc<dyn GpuBackend>,
        program: Arc<ShaderProgram>,
        layout: vk::DescriptorSetLayout,
        texture: Arc<Texture>,
    ) -> RhiResult<Self> {
        let block = program.uniforms().default_block();
        let size = (block.len() as u64).max(16);
        let uniform_buffer = GpuBuffer::new(backend.clone(), BufferUsage::Uniform, size)?;
        uniform_buffer.write(0, &block)?;

        let descriptor_set = backend.allocate_descriptor_set(layout)?;
        let material = Self {
            backend,
            queue: program.queue(),
            values: program
                .uniforms()
                .members()
                .iter()
                .map(|member| (member.name.clone(), member.default))
                .collect(),
            program,
            block,
            uniforms_dirty: false,
            uniform_buffer,
            texture,
            descriptor_set,
            binding_epoch: 0,
        };
        material.write_set(descriptor_set);
        Ok(material)
    }

    fn write_set(&self, set: vk::DescriptorSet) {
        self.backend.write_descriptor_set(
            set,
            &[
                DescriptorWrite::UniformBuffer {
                    binding: MATERIAL_UNIFORM_BINDING,
                    buffer: self.uniform_buffer.handle(),
                    offset: 0,
                    range: self.uniform_buffer.size(),
                },
                DescriptorWrite::SampledImage {
                    binding: MATERIAL_TEXTURE_BINDING,
                    view: self.texture.view(),
                },
                DescriptorWrite::Sampler {
                    binding: MATERIAL_SAMPLER_BINDING,
                    sampler: self.texture.sampler(),
                },
            ],
        );
    }

    pub fn program(&self) -> &Arc<ShaderProgram> {
        &self.program
    }

    /// Sort key among a camera's drawables; lower draws first.
    pub fn queue(&self) -> i32 {
        self.queue
    }

    pub fn set_queue(&mut self, queue: i32) {
        self.queue = queue;
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.values.get(name).copied()
    }

    /// Store a property and stage it for the uniform buffer.
    ///
    /// Properties the program's block does not declare are kept but never
    /// reach the GPU. A value whose type disagrees with the declared member
    /// is rejected with a warning and `false`.
    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> bool {
        if let Some(member) = self.program.uniforms().member(name) {
            if member.ty != value.uniform_type() {
                warn!(
                    "Material property '{}' of {} is {:?}, not {:?}; ignored",
                    name,
                    self.program.label(),
                    member.ty,
                    value.uniform_type()
                );
                return false;
            }
            let bytes = value.to_bytes();
            let start = member.offset as usize;
            self.block[start..start + bytes.len()].copy_from_slice(&bytes);
            self.uniforms_dirty = true;
        }
        self.values.insert(name.to_string(), value);
        true
    }

    /// Set `name` only when the program declares it.
    pub(crate) fn set_if_declared(&mut self, name: &str, value: PropertyValue) {
        if self.program.uniforms().member(name).is_some() {
            self.set_property(name, value);
        }
    }

    pub fn set_matrix(&mut self, name: &str, value: Mat4) -> bool {
        self.set_property(name, PropertyValue::Mat4(value))
    }

    pub fn set_color(&mut self, name: &str, value: Vec4) -> bool {
        self.set_property(name, PropertyValue::Color(value))
    }

    pub fn set_vector(&mut self, name: &str, value: Vec4) -> bool {
        self.set_property(name, PropertyValue::Vec4(value))
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> bool {
        self.set_property(name, PropertyValue::Float(value))
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> bool {
        self.set_property(name, PropertyValue::Int(value))
    }

    /// Write staged property values into the uniform buffer.
    ///
    /// Returns whether anything was written.
    pub fn flush(&mut self) -> RhiResult<bool> {
        if !self.uniforms_dirty {
            return Ok(false);
        }
        self.uniform_buffer.write(0, &self.block)?;
        self.uniforms_dirty = false;
        Ok(true)
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    /// Bind `texture` through a new descriptor set.
    ///
    /// Returns the previous set and texture; they may still be read by
    /// frames in flight.
    pub(crate) fn replace_texture(
        &mut self,
        layout: vk::DescriptorSetLayout,
        texture: Arc<Texture>,
    ) -> RhiResult<(vk::DescriptorSet, Arc<Texture>)> {
        let set = self.backend.allocate_descriptor_set(layout)?;
        let old_texture = std::mem::replace(&mut self.texture, texture);
        self.write_set(set);
        let old_set = std::mem::replace(&mut self.descriptor_set, set);
        self.binding_epoch += 1;
        Ok((old_set, old_texture))
    }

    #[inline]
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Bumped whenever the descriptor set changes.
    #[inline]
    pub fn binding_epoch(&self) -> u64 {
        self.binding_epoch
    }

    pub(crate) fn uniform_block(&self) -> &[u8] {
        &self.block
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        self.backend.free_descriptor_set(self.descriptor_set);
    }
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Material")
            .field("program", &self.program.label())
            .field("queue", &self.queue)
            .field("descriptor_set", &self.descriptor_set)
            .field("binding_epoch", &self.binding_epoch)
            .finish()
    }
}
