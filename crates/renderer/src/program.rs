//! Shader programs and their uniform block layout.
//!
//! A [`ShaderProgram`] is a vertex/fragment module pair plus everything the
//! pipeline cache needs to key on it: the vertex slots it reads, its fixed
//! render state and a stable [`ShaderId`]. Its material uniform block is
//! declared as a list of named members with default values; offsets follow
//! std140.
//!
//! # Example
//!
//! ```
//! use glam::{Mat4, Vec4};
//! use kiln_renderer::program::{PropertyValue, UniformLayout};
//!
//! let layout = UniformLayout::new(&[
//!     ("view_projection", PropertyValue::Mat4(Mat4::IDENTITY)),
//!     ("base_color", PropertyValue::Color(Vec4::ONE)),
//! ]);
//! assert_eq!(layout.member("base_color").map(|m| m.offset), Some(64));
//! assert_eq!(layout.size(), 80);
//! ```

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use kiln_rhi::backend::GpuBackend;
use kiln_rhi::pipeline::RenderState;
use kiln_rhi::shader::{ShaderId, ShaderModule};
use kiln_rhi::vertex::{VertexLayout, VertexSlot};

/// Value of a material property.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PropertyValue {
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    /// Linear RGBA, stored like a `vec4`.
    Color(Vec4),
    Mat4(Mat4),
}

impl PropertyValue {
    pub fn uniform_type(&self) -> UniformType {
        match self {
            Self::Float(_) => UniformType::Float,
            Self::Int(_) => UniformType::Int,
            Self::Vec2(_) => UniformType::Vec2,
            Self::Vec3(_) => UniformType::Vec3,
            Self::Vec4(_) | Self::Color(_) => UniformType::Vec4,
            Self::Mat4(_) => UniformType::Mat4,
        }
    }

    /// Bytes as laid out in a uniform block.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Float(v) => bytemuck::bytes_of(v).to_vec(),
            Self::Int(v) => bytemuck::bytes_of(v).to_vec(),
            Self::Vec2(v) => bytemuck::bytes_of(v).to_vec(),
            Self::Vec3(v) => bytemuck::bytes_of(v).to_vec(),
            Self::Vec4(v) | Self::Color(v) => bytemuck::bytes_of(v).to_vec(),
            Self::Mat4(v) => bytemuck::bytes_of(v).to_vec(),
        }
    }
}

/// GLSL type of a uniform block member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
}

impl UniformType {
    /// `(size, alignment)` in bytes under std140.
    pub const fn std140(self) -> (u32, u32) {
        match self {
            Self::Float | Self::Int => (4, 4),
            Self::Vec2 => (8, 8),
            Self::Vec3 => (12, 16),
            Self::Vec4 => (16, 16),
            Self::Mat4 => (64, 16),
        }
    }
}

/// One member of a uniform block.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformMember {
    pub name: String,
    pub ty: UniformType,
    pub offset: u32,
    pub default: PropertyValue,
}

/// std140 layout of a material uniform block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UniformLayout {
    members: Vec<UniformMember>,
    size: u32,
}

impl UniformLayout {
    /// Lay out `members` in declaration order.
    pub fn new(members: &[(&str, PropertyValue)]) -> Self {
        let mut offset = 0u32;
        let members = members
            .iter()
            .map(|(name, default)| {
                let ty = default.uniform_type();
                let (size, align) = ty.std140();
                let member_offset = offset.next_multiple_of(align);
                offset = member_offset + size;
                UniformMember {
                    name: (*name).to_string(),
                    ty,
                    offset: member_offset,
                    default: *default,
                }
            })
            .collect();
        Self {
            members,
            size: offset.next_multiple_of(16),
        }
    }

    pub fn member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|member| member.name == name)
    }

    pub fn members(&self) -> &[UniformMember] {
        &self.members
    }

    /// Block size, rounded up to 16 bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// A block filled with every member's default.
    pub fn default_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.size as usize];
        for member in &self.members {
            let bytes = member.default.to_bytes();
            let start = member.offset as usize;
            block[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        block
    }
}

/// GLSL sources and fixed state for a program.
#[derive(Clone, Debug)]
pub struct ProgramDesc<'a> {
    pub label: &'a str,
    pub vertex_source: &'a str,
    pub fragment_source: &'a str,
    pub uniforms: &'a [(&'a str, PropertyValue)],
    pub vertex_layout: VertexLayout,
    pub state: RenderState,
    /// Default render queue of materials using this program.
    pub queue: i32,
}

/// Name of the built-in program.
pub const UNLIT: &str = "unlit";

/// Built-in unlit program: vertex color times a texture, tinted by
/// `base_color`.
pub fn unlit_desc() -> ProgramDesc<'static> {
    const UNIFORMS: &[(&str, PropertyValue)] = &[
        ("view_projection", PropertyValue::Mat4(Mat4::IDENTITY)),
        ("base_color", PropertyValue::Color(Vec4::ONE)),
    ];
    ProgramDesc {
        label: UNLIT,
        vertex_source: include_str!("../shaders/unlit.vert"),
        fragment_source: include_str!("../shaders/unlit.frag"),
        uniforms: UNIFORMS,
        vertex_layout: VertexLayout::from_slots(&[
            VertexSlot::Position,
            VertexSlot::Color,
            VertexSlot::Texcoord0,
        ]),
        state: RenderState::default(),
        queue: 2000,
    }
}

/// Compiled vertex and fragment modules with their pipeline-relevant state.
pub struct ShaderProgram {
    id: ShaderId,
    label: String,
    vertex: ShaderModule,
    fragment: ShaderModule,
    uniforms: UniformLayout,
    vertex_layout: VertexLayout,
    state: RenderState,
    queue: i32,
}

impl ShaderProgram {
    pub(crate) fn new(
        id: ShaderId,
        desc: &ProgramDesc<'_>,
        vertex: ShaderModule,
        fragment: ShaderModule,
    ) -> Self {
        Self {
            id,
            label: desc.label.to_string(),
            vertex,
            fragment,
            uniforms: UniformLayout::new(desc.uniforms),
            vertex_layout: desc.vertex_layout,
            state: desc.state,
            queue: desc.queue,
        }
    }

    /// Compile both stages from SPIR-V words.
    pub fn from_spirv(
        backend: Arc<dyn GpuBackend>,
        id: ShaderId,
        desc: &ProgramDesc<'_>,
        vertex_code: &[u32],
        fragment_code: &[u32],
    ) -> kiln_rhi::RhiResult<Self> {
        use kiln_rhi::shader::ShaderStage;
        let vertex = ShaderModule::new(backend.clone(), ShaderStage::Vertex, vertex_code)?;
        let fragment = ShaderModule::new(backend, ShaderStage::Fragment, fragment_code)?;
        Ok(Self::new(id, desc, vertex, fragment))
    }

    #[inline]
    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vertex_module(&self) -> &ShaderModule {
        &self.vertex
    }

    pub fn fragment_module(&self) -> &ShaderModule {
        &self.fragment
    }

    pub fn uniforms(&self) -> &UniformLayout {
        &self.uniforms
    }

    pub fn vertex_layout(&self) -> VertexLayout {
        self.vertex_layout
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn queue(&self) -> i32 {
        self.queue
    }
}

impl std::fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("queue", &self.queue)
            .finish()
    }
}
