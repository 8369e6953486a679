//! Descriptor layouts and writes.
//!
//! The renderer uses one fixed layout for every shader:
//!
//! | set | binding | contents |
//! |-----|---------|----------|
//! | 0   | 0       | material uniform block |
//! | 0   | 1       | material texture (sampled image) |
//! | 0   | 2       | material sampler |
//! | 1   | 0       | per-draw uniform block (world matrix) |
//!
//! Fixing the layout lets materials and drawables allocate their sets without
//! reflecting each shader.

use ash::vk;

/// Set index of the material's descriptor set.
pub const MATERIAL_SET: u32 = 0;
/// Set index of the per-draw descriptor set.
pub const DRAW_SET: u32 = 1;

pub const MATERIAL_UNIFORM_BINDING: u32 = 0;
pub const MATERIAL_TEXTURE_BINDING: u32 = 1;
pub const MATERIAL_SAMPLER_BINDING: u32 = 2;
pub const DRAW_UNIFORM_BINDING: u32 = 0;

/// Sets per descriptor pool.
pub const MAX_DESCRIPTOR_SETS: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    SampledImage,
    Sampler,
}

impl DescriptorKind {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::Sampler => vk::DescriptorType::SAMPLER,
        }
    }
}

/// One binding slot of a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: vk::ShaderStageFlags,
}

impl DescriptorBinding {
    pub fn uniform_buffer(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: DescriptorKind::UniformBuffer,
            stages,
        }
    }

    pub fn sampled_image(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: DescriptorKind::SampledImage,
            stages,
        }
    }

    pub fn sampler(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            kind: DescriptorKind::Sampler,
            stages,
        }
    }

    pub fn to_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.kind.to_vk())
            .descriptor_count(1)
            .stage_flags(self.stages)
    }
}

/// Bindings of set 0.
pub fn material_set_bindings() -> Vec<DescriptorBinding> {
    vec![
        DescriptorBinding::uniform_buffer(
            MATERIAL_UNIFORM_BINDING,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        ),
        DescriptorBinding::sampled_image(MATERIAL_TEXTURE_BINDING, vk::ShaderStageFlags::FRAGMENT),
        DescriptorBinding::sampler(MATERIAL_SAMPLER_BINDING, vk::ShaderStageFlags::FRAGMENT),
    ]
}

/// Bindings of set 1.
pub fn draw_set_bindings() -> Vec<DescriptorBinding> {
    vec![DescriptorBinding::uniform_buffer(
        DRAW_UNIFORM_BINDING,
        vk::ShaderStageFlags::VERTEX,
    )]
}

/// Contents for one binding of an allocated set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorWrite {
    UniformBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    SampledImage {
        binding: u32,
        view: vk::ImageView,
    },
    Sampler {
        binding: u32,
        sampler: vk::Sampler,
    },
}

impl DescriptorWrite {
    pub fn binding(&self) -> u32 {
        match self {
            Self::UniformBuffer { binding, .. }
            | Self::SampledImage { binding, .. }
            | Self::Sampler { binding, .. } => *binding,
        }
    }
}

/// Pool sizes for a pool of `max_sets` sets shaped like the standard layout.
pub fn pool_sizes(max_sets: u32) -> [vk::DescriptorPoolSize; 3] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: max_sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: max_sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLER,
            descriptor_count: max_sets,
        },
    ]
}
