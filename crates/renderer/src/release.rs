//! Deferred destruction of objects that in-flight frames may still read.

use std::collections::VecDeque;
use std::sync::Arc;

use kiln_rhi::backend::GpuBackend;
use kiln_rhi::resource::GpuBuffer;
use kiln_rhi::vk;
use tracing::trace;

use crate::drawable::{Geometry, InstanceData};
use crate::material::Material;
use crate::texture::Texture;

/// Something waiting for the GPU to finish with it.
pub enum Retired {
    CommandBuffer(vk::CommandBuffer),
    DescriptorSet(vk::DescriptorSet),
    Buffer(GpuBuffer),
    Texture(Arc<Texture>),
    Geometry(Geometry),
    Instances(InstanceData),
    Material(Box<Material>),
}

impl Retired {
    fn release(self, backend: &dyn GpuBackend) {
        match self {
            Self::CommandBuffer(cmd) => backend.free_command_buffer(cmd),
            Self::DescriptorSet(set) => backend.free_descriptor_set(set),
            Self::Buffer(_)
            | Self::Texture(_)
            | Self::Geometry(_)
            | Self::Instances(_)
            | Self::Material(_) => {}
        }
    }
}

/// Objects are released once `frames_in_flight` further frames have begun,
/// by which point every frame that could reference them has completed.
pub struct ReleaseQueue {
    frames_in_flight: u64,
    entries: VecDeque<(u64, Retired)>,
}

impl ReleaseQueue {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight as u64,
            entries: VecDeque::new(),
        }
    }

    pub fn retire(&mut self, frame: u64, item: Retired) {
        self.entries.push_back((frame, item));
    }

    /// Release everything retired at least `frames_in_flight` frames before
    /// `frame`. Returns how many objects were released.
    pub fn collect(&mut self, backend: &dyn GpuBackend, frame: u64) -> usize {
        let mut released = 0;
        while let Some((retired_at, _)) = self.entries.front() {
            if retired_at + self.frames_in_flight > frame {
                break;
            }
            if let Some((_, item)) = self.entries.pop_front() {
                item.release(backend);
                released += 1;
            }
        }
        if released > 0 {
            trace!("Released {} retired object(s) at frame {}", released, frame);
        }
        released
    }

    /// Release everything now. The caller must have waited for the device.
    pub fn flush(&mut self, backend: &dyn GpuBackend) {
        for (_, item) in self.entries.drain(..) {
            item.release(backend);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
