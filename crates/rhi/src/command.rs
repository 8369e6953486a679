//! Command lists and their Vulkan encoding.
//!
//! Command buffers are described as a [`Recording`]: a level plus an ordered
//! list of [`Command`] values. A backend turns the recording into a real
//! command buffer in one call, so the orchestration layer never touches
//! `vkCmd*` directly and a headless backend can keep the list for inspection.
//!
//! # Example
//!
//! ```
//! use kiln_rhi::command::{Command, Recording};
//! use kiln_rhi::vk;
//!
//! let mut rec = Recording::secondary(vk::RenderPass::null());
//! rec.bind_pipeline(vk::Pipeline::null())
//!     .draw_indexed(36, 1, 0);
//! assert_eq!(rec.draw_count(), 1);
//! assert!(matches!(rec.commands()[0], Command::BindPipeline(_)));
//! ```

use ash::vk;

use crate::error::RhiResult;

/// Primary or secondary command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandLevel {
    Primary,
    Secondary,
}

impl CommandLevel {
    pub fn to_vk(self) -> vk::CommandBufferLevel {
        match self {
            Self::Primary => vk::CommandBufferLevel::PRIMARY,
            Self::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}

/// Index element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexType {
    #[default]
    U16,
    U32,
}

impl IndexType {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            Self::U16 => vk::IndexType::UINT16,
            Self::U32 => vk::IndexType::UINT32,
        }
    }

    pub fn size_bytes(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Clear values for a color attachment and an optional depth attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

impl ClearValues {
    /// Vulkan clear values in attachment order: color, then depth if present.
    pub fn to_vk(&self, has_depth: bool) -> Vec<vk::ClearValue> {
        let mut values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.color,
            },
        }];
        if has_depth {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth,
                    stencil: self.stencil,
                },
            });
        }
        values
    }
}

/// A single recorded command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Begin a render pass whose contents come from secondary command buffers.
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear: ClearValues,
        has_depth: bool,
    },
    ExecuteCommands(Vec<vk::CommandBuffer>),
    EndRenderPass,
    /// Layout transition of a single-layer color image, ordered after the
    /// color output stage (where the acquire semaphore is waited on).
    ImageBarrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: IndexType,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
    },
}

/// How a recording may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordUsage {
    /// Top-level buffer submitted to the queue.
    Primary,
    /// Executed inside subpass 0 of `render_pass`.
    Secondary { render_pass: vk::RenderPass },
}

/// An ordered command list for one command buffer.
#[derive(Debug, Clone)]
pub struct Recording {
    usage: RecordUsage,
    commands: Vec<Command>,
}

impl Recording {
    pub fn primary() -> Self {
        Self {
            usage: RecordUsage::Primary,
            commands: Vec::new(),
        }
    }

    /// A secondary recording that continues `render_pass`.
    pub fn secondary(render_pass: vk::RenderPass) -> Self {
        Self {
            usage: RecordUsage::Secondary { render_pass },
            commands: Vec::new(),
        }
    }

    pub fn usage(&self) -> RecordUsage {
        self.usage
    }

    pub fn level(&self) -> CommandLevel {
        match self.usage {
            RecordUsage::Primary => CommandLevel::Primary,
            RecordUsage::Secondary { .. } => CommandLevel::Secondary,
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    // =========================================================================
    // Render passes
    // =========================================================================

    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: ClearValues,
        has_depth: bool,
    ) -> &mut Self {
        self.push(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear,
            has_depth,
        })
    }

    pub fn execute_commands(&mut self, buffers: Vec<vk::CommandBuffer>) -> &mut Self {
        self.push(Command::ExecuteCommands(buffers))
    }

    pub fn end_render_pass(&mut self) -> &mut Self {
        self.push(Command::EndRenderPass)
    }

    /// Move a color image from `old_layout` to `new_layout` outside any
    /// render pass. `UNDEFINED` discards the contents.
    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> &mut Self {
        self.push(Command::ImageBarrier {
            image,
            old_layout,
            new_layout,
        })
    }

    // =========================================================================
    // Draw state
    // =========================================================================

    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) -> &mut Self {
        self.push(Command::BindPipeline(pipeline))
    }

    pub fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    ) -> &mut Self {
        self.push(Command::BindDescriptorSets {
            layout,
            first_set,
            sets,
        })
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> &mut Self {
        self.push(Command::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> &mut Self {
        self.push(Command::SetScissor(scissor))
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: Vec<vk::Buffer>) -> &mut Self {
        self.push(Command::BindVertexBuffers {
            first_binding,
            buffers,
        })
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, index_type: IndexType) -> &mut Self {
        self.push(Command::BindIndexBuffer { buffer, index_type })
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32) -> &mut Self {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
        })
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of draw calls in the recording.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::DrawIndexed { .. }))
            .count()
    }

    /// Secondary command buffers executed by this recording, in order.
    pub fn executed(&self) -> Vec<vk::CommandBuffer> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::ExecuteCommands(buffers) => Some(buffers.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Render passes begun by this recording, in order.
    pub fn render_passes(&self) -> Vec<vk::RenderPass> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::BeginRenderPass { render_pass, .. } => Some(*render_pass),
                _ => None,
            })
            .collect()
    }
}

/// Record `recording` into `cmd`, replacing its previous contents.
///
/// Buffers are recorded with `SIMULTANEOUS_USE` so one recording can stay in
/// flight in several frames at once.
pub(crate) fn encode(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    recording: &Recording,
) -> RhiResult<()> {
    unsafe {
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;

        match recording.usage() {
            RecordUsage::Primary => {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
                device.begin_command_buffer(cmd, &begin_info)?;
            }
            RecordUsage::Secondary { render_pass } => {
                let inheritance = vk::CommandBufferInheritanceInfo::default()
                    .render_pass(render_pass)
                    .subpass(0)
                    .framebuffer(vk::Framebuffer::null());
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(
                        vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
                            | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                    )
                    .inheritance_info(&inheritance);
                device.begin_command_buffer(cmd, &begin_info)?;
            }
        }

        for command in recording.commands() {
            encode_command(device, cmd, command);
        }

        device.end_command_buffer(cmd)?;
    }
    Ok(())
}

unsafe fn encode_command(device: &ash::Device, cmd: vk::CommandBuffer, command: &Command) {
    unsafe {
        match command {
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                area,
                clear,
                has_depth,
            } => {
                let clear_values = clear.to_vk(*has_depth);
                let begin_info = vk::RenderPassBeginInfo::default()
                    .render_pass(*render_pass)
                    .framebuffer(*framebuffer)
                    .render_area(*area)
                    .clear_values(&clear_values);
                device.cmd_begin_render_pass(
                    cmd,
                    &begin_info,
                    vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                );
            }
            Command::ExecuteCommands(buffers) => {
                if !buffers.is_empty() {
                    device.cmd_execute_commands(cmd, buffers);
                }
            }
            Command::EndRenderPass => device.cmd_end_render_pass(cmd),
            Command::ImageBarrier {
                image,
                old_layout,
                new_layout,
            } => {
                let barrier = vk::ImageMemoryBarrier::default()
                    .old_layout(*old_layout)
                    .new_layout(*new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(*image)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1),
                    )
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(
                        vk::AccessFlags::COLOR_ATTACHMENT_READ
                            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    );
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
            Command::BindPipeline(pipeline) => {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, *pipeline)
            }
            Command::BindDescriptorSets {
                layout,
                first_set,
                sets,
            } => device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                *layout,
                *first_set,
                sets,
                &[],
            ),
            Command::SetViewport(viewport) => device.cmd_set_viewport(cmd, 0, &[*viewport]),
            Command::SetScissor(scissor) => device.cmd_set_scissor(cmd, 0, &[*scissor]),
            Command::BindVertexBuffers {
                first_binding,
                buffers,
            } => {
                let offsets = vec![0; buffers.len()];
                device.cmd_bind_vertex_buffers(cmd, *first_binding, buffers, &offsets);
            }
            Command::BindIndexBuffer { buffer, index_type } => {
                device.cmd_bind_index_buffer(cmd, *buffer, 0, index_type.to_vk())
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
            } => device.cmd_draw_indexed(cmd, *index_count, *instance_count, *first_index, 0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_primary_inspection() {
        let a = vk::CommandBuffer::from_raw(1);
        let b = vk::CommandBuffer::from_raw(2);
        let c = vk::CommandBuffer::from_raw(3);
        let pass = vk::RenderPass::from_raw(10);

        let mut rec = Recording::primary();
        rec.begin_render_pass(
            pass,
            vk::Framebuffer::from_raw(11),
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            ClearValues::default(),
            true,
        )
        .execute_commands(vec![a, b])
        .end_render_pass()
        .begin_render_pass(
            pass,
            vk::Framebuffer::from_raw(11),
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            ClearValues::default(),
            true,
        )
        .execute_commands(vec![c])
        .end_render_pass();

        assert_eq!(rec.level(), CommandLevel::Primary);
        assert_eq!(rec.executed(), vec![a, b, c]);
        assert_eq!(rec.render_passes(), vec![pass, pass]);
        assert_eq!(rec.draw_count(), 0);
    }

    #[test]
    fn test_clear_values_order() {
        let clear = ClearValues {
            color: [0.1, 0.2, 0.3, 1.0],
            depth: 1.0,
            stencil: 0,
        };
        assert_eq!(clear.to_vk(false).len(), 1);
        let values = clear.to_vk(true);
        assert_eq!(values.len(), 2);
        let depth = unsafe { values[1].depth_stencil };
        assert_eq!(depth.depth, 1.0);
    }

    #[test]
    fn test_index_type() {
        assert_eq!(IndexType::U16.to_vk(), vk::IndexType::UINT16);
        assert_eq!(IndexType::U32.size_bytes(), 4);
        assert_eq!(IndexType::default(), IndexType::U16);
    }
}
