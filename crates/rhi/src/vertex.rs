//! Fixed vertex format and input layouts.
//!
//! Every mesh uses the same interleaved [`Vertex`] struct. Each semantic has a
//! slot with a fixed offset, and a shader picks the slots it reads through a
//! [`VertexLayout`] bitmask. Attribute descriptions come from the slot table,
//! never from shader reflection. The shader location of a slot is its index.
//!
//! | slot | semantic     | format | offset |
//! |------|--------------|--------|--------|
//! | 0    | position     | vec3   | 0      |
//! | 1    | color        | vec4   | 12     |
//! | 2    | texcoord0    | vec2   | 28     |
//! | 3    | texcoord1    | vec2   | 36     |
//! | 4    | normal       | vec3   | 44     |
//! | 5    | tangent      | vec4   | 56     |
//! | 6    | blend weight | vec4   | 72     |
//! | 7    | blend index  | vec4   | 88     |

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Binding index of per-vertex data.
pub const VERTEX_BINDING: u32 = 0;
/// Binding index of per-instance data.
pub const INSTANCE_BINDING: u32 = 1;
/// First shader location used by per-instance attributes (a mat4 as four vec4s).
pub const INSTANCE_LOCATION: u32 = 8;

/// Interleaved vertex with every supported semantic.
///
/// Fields are plain arrays: SIMD vector types would add alignment padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub uv: [f32; 2],
    pub uv2: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub blend_weight: [f32; 4],
    pub blend_index: [f32; 4],
}

impl Vertex {
    /// Vertex with a position, white color and the given texcoord and normal.
    pub fn new(position: Vec3, uv: Vec2, normal: Vec3) -> Self {
        Self {
            position: position.to_array(),
            color: [1.0; 4],
            uv: uv.to_array(),
            normal: normal.to_array(),
            ..Self::default()
        }
    }

    #[inline]
    pub const fn stride() -> u32 {
        std::mem::size_of::<Self>() as u32
    }
}

/// Semantic vertex slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VertexSlot {
    Position = 0,
    Color = 1,
    Texcoord0 = 2,
    Texcoord1 = 3,
    Normal = 4,
    Tangent = 5,
    BlendWeight = 6,
    BlendIndex = 7,
}

impl VertexSlot {
    pub const ALL: [VertexSlot; 8] = [
        Self::Position,
        Self::Color,
        Self::Texcoord0,
        Self::Texcoord1,
        Self::Normal,
        Self::Tangent,
        Self::BlendWeight,
        Self::BlendIndex,
    ];

    /// `(format, byte offset)` from the slot table.
    pub const fn format_and_offset(self) -> (vk::Format, u32) {
        match self {
            Self::Position => (vk::Format::R32G32B32_SFLOAT, 0),
            Self::Color => (vk::Format::R32G32B32A32_SFLOAT, 12),
            Self::Texcoord0 => (vk::Format::R32G32_SFLOAT, 28),
            Self::Texcoord1 => (vk::Format::R32G32_SFLOAT, 36),
            Self::Normal => (vk::Format::R32G32B32_SFLOAT, 44),
            Self::Tangent => (vk::Format::R32G32B32A32_SFLOAT, 56),
            Self::BlendWeight => (vk::Format::R32G32B32A32_SFLOAT, 72),
            Self::BlendIndex => (vk::Format::R32G32B32A32_SFLOAT, 88),
        }
    }

    #[inline]
    pub const fn location(self) -> u32 {
        self as u32
    }

    #[inline]
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of slots a shader reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout(u8);

impl VertexLayout {
    pub const EMPTY: Self = Self(0);

    pub fn from_slots(slots: &[VertexSlot]) -> Self {
        Self(slots.iter().fold(0, |bits, slot| bits | slot.bit()))
    }

    pub fn with(self, slot: VertexSlot) -> Self {
        Self(self.0 | slot.bit())
    }

    pub fn contains(self, slot: VertexSlot) -> bool {
        self.0 & slot.bit() != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn slots(self) -> impl Iterator<Item = VertexSlot> {
        VertexSlot::ALL.into_iter().filter(move |slot| self.contains(*slot))
    }
}

/// Vertex input state for one pipeline: per-vertex slots plus optional
/// per-instance data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInput {
    pub layout: VertexLayout,
    /// Stride of the instance buffer when instancing is on.
    pub instance_stride: Option<u32>,
}

impl VertexInput {
    pub fn bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        let mut bindings = vec![vk::VertexInputBindingDescription {
            binding: VERTEX_BINDING,
            stride: Vertex::stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        if let Some(stride) = self.instance_stride {
            bindings.push(vk::VertexInputBindingDescription {
                binding: INSTANCE_BINDING,
                stride,
                input_rate: vk::VertexInputRate::INSTANCE,
            });
        }
        bindings
    }

    pub fn attributes(&self) -> Vec<vk::VertexInputAttributeDescription> {
        let mut attributes: Vec<_> = self
            .layout
            .slots()
            .map(|slot| {
                let (format, offset) = slot.format_and_offset();
                vk::VertexInputAttributeDescription {
                    binding: VERTEX_BINDING,
                    location: slot.location(),
                    format,
                    offset,
                }
            })
            .collect();

        if self.instance_stride.is_some() {
            // Instance world matrix, one column per location.
            for column in 0..4u32 {
                attributes.push(vk::VertexInputAttributeDescription {
                    binding: INSTANCE_BINDING,
                    location: INSTANCE_LOCATION + column,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: column * 16,
                });
            }
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_vertex_stride() {
        assert_eq!(Vertex::stride(), 104);
    }

    #[test]
    fn test_slot_offsets_match_struct() {
        let offsets = [
            offset_of!(Vertex, position),
            offset_of!(Vertex, color),
            offset_of!(Vertex, uv),
            offset_of!(Vertex, uv2),
            offset_of!(Vertex, normal),
            offset_of!(Vertex, tangent),
            offset_of!(Vertex, blend_weight),
            offset_of!(Vertex, blend_index),
        ];
        for (slot, offset) in VertexSlot::ALL.iter().zip(offsets) {
            assert_eq!(slot.format_and_offset().1 as usize, offset, "{slot:?}");
        }
    }

    #[test]
    fn test_layout_bits() {
        let layout = VertexLayout::from_slots(&[VertexSlot::Position, VertexSlot::Texcoord0]);
        assert!(layout.contains(VertexSlot::Position));
        assert!(!layout.contains(VertexSlot::Normal));
        assert_eq!(layout.bits(), 0b101);
        assert_eq!(layout.with(VertexSlot::Normal).slots().count(), 3);
    }

    #[test]
    fn test_attributes_from_table() {
        let input = VertexInput {
            layout: VertexLayout::from_slots(&[VertexSlot::Position, VertexSlot::Normal]),
            instance_stride: None,
        };
        let attrs = input.attributes();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[1].location, 4);
        assert_eq!(attrs[1].offset, 44);
        assert_eq!(input.bindings().len(), 1);
        assert_eq!(input.bindings()[0].stride, 104);
    }

    #[test]
    fn test_instanced_input() {
        let input = VertexInput {
            layout: VertexLayout::from_slots(&[VertexSlot::Position]),
            instance_stride: Some(64),
        };
        let bindings = input.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        let attrs = input.attributes();
        assert_eq!(attrs.len(), 5);
        assert_eq!(attrs[4].location, INSTANCE_LOCATION + 3);
        assert_eq!(attrs[4].offset, 48);
    }
}
