//! Frame-in-flight synchronization.
//!
//! A [`SyncRing`] holds `K` [`FrameSlot`]s, each with:
//! - a fence the GPU signals when the slot's submission completes
//! - an "image acquired" semaphore signaled by the presentation engine
//! - a "render complete" semaphore that gates presentation
//!
//! The CPU may only touch a slot's resources after the slot's fence has
//! signaled. [`SyncRing::begin_frame`] enforces that by blocking, so at most
//! `K` frames are ever in flight.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln_rhi::backend::GpuBackend;
//! use kiln_rhi::sync::SyncRing;
//! use kiln_rhi::vk;
//!
//! # fn example(backend: Arc<dyn GpuBackend>, swapchain: vk::SwapchainKHR, cmd: vk::CommandBuffer)
//! #     -> kiln_rhi::RhiResult<()> {
//! let mut ring = SyncRing::new(backend.clone(), 2)?;
//! ring.begin_frame()?;
//! let (index, _) = backend.acquire_next_image(swapchain, ring.current().image_acquired)?;
//! ring.submit(cmd)?;
//! ring.present(swapchain, index)?;
//! ring.advance();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::backend::{GpuBackend, SubmitDesc};
use crate::error::{RhiError, RhiResult};

/// Default number of frames in flight.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Synchronization objects for one frame in flight.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    pub fence: vk::Fence,
    pub image_acquired: vk::Semaphore,
    pub render_complete: vk::Semaphore,
}

impl FrameSlot {
    fn new(backend: &dyn GpuBackend) -> RhiResult<Self> {
        // Signaled so the first wait on each slot returns at once.
        let fence = backend.create_fence(true)?;
        let image_acquired = backend.create_semaphore()?;
        let render_complete = backend.create_semaphore()?;
        Ok(Self {
            fence,
            image_acquired,
            render_complete,
        })
    }

    fn destroy(&self, backend: &dyn GpuBackend) {
        backend.destroy_fence(self.fence);
        backend.destroy_semaphore(self.image_acquired);
        backend.destroy_semaphore(self.render_complete);
    }
}

/// Ring of `K` frame slots.
pub struct SyncRing {
    backend: Arc<dyn GpuBackend>,
    slots: Vec<FrameSlot>,
    current: usize,
    frames_begun: u64,
}

impl SyncRing {
    /// Creates `frames_in_flight` slots, each with a signaled fence.
    ///
    /// # Arguments
    ///
    /// * `backend` - Device that owns the fences and semaphores
    /// * `frames_in_flight` - Number of frames the CPU may run ahead of the GPU
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `frames_in_flight` is zero
    /// - Fence or semaphore creation fails (slots created so far are destroyed)
    pub fn new(backend: Arc<dyn GpuBackend>, frames_in_flight: usize) -> RhiResult<Self> {
        if frames_in_flight == 0 {
            return Err(RhiError::InvalidHandle(
                "frames in flight must be at least 1".into(),
            ));
        }

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSlot::new(backend.as_ref()) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(backend.as_ref());
                    }
                    return Err(e);
                }
            }
        }

        info!("Created sync ring with {} frame slot(s)", frames_in_flight);
        Ok(Self {
            backend,
            slots,
            current: 0,
            frames_begun: 0,
        })
    }

    /// Number of slots in the ring.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Slot the next submission will use.
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// Frames started so far.
    pub fn frames_begun(&self) -> u64 {
        self.frames_begun
    }

    /// Block until the current slot's previous submission has completed,
    /// then reset its fence.
    ///
    /// Once this returns, every resource the slot's last submission used is
    /// safe to rewrite.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on or resetting the fence fails, which
    /// usually means the device was lost.
    pub fn begin_frame(&mut self) -> RhiResult<&FrameSlot> {
        let slot = self.slots[self.current];
        self.backend.wait_fence(slot.fence)?;
        self.backend.reset_fence(slot.fence)?;
        self.frames_begun += 1;
        Ok(&self.slots[self.current])
    }

    /// Undo [`begin_frame`](Self::begin_frame) when nothing will be
    /// submitted for the slot, so the next wait on it does not hang.
    ///
    /// The reset fence is replaced by a new signaled one.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement fence cannot be created. The old
    /// fence is kept in that case.
    pub fn abandon_frame(&mut self) -> RhiResult<()> {
        let fence = self.backend.create_fence(true)?;
        let slot = &mut self.slots[self.current];
        self.backend.destroy_fence(slot.fence);
        slot.fence = fence;
        debug!("Frame slot {} abandoned", self.current);
        Ok(())
    }

    /// Submit `cmd` for the current slot: wait on image acquisition, signal
    /// render completion and the slot fence.
    ///
    /// # Arguments
    ///
    /// * `cmd` - Recorded primary command buffer
    ///
    /// # Errors
    ///
    /// Returns the device's error if the queue submission fails.
    pub fn submit(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let slot = self.current();
        self.backend.submit(&SubmitDesc {
            command_buffer: cmd,
            wait_semaphore: Some(slot.image_acquired),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: Some(slot.render_complete),
            fence: slot.fence,
        })
    }

    /// Present `image_index` once rendering for the current slot completes.
    ///
    /// # Arguments
    ///
    /// * `swapchain` - Swapchain the image was acquired from
    /// * `image_index` - Index returned by the acquire
    ///
    /// # Returns
    ///
    /// Whether the swapchain is suboptimal.
    ///
    /// # Errors
    ///
    /// An out-of-date swapchain is reported as
    /// [`RhiError::SwapchainOutOfDate`]; other errors come from the device.
    pub fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32) -> RhiResult<bool> {
        self.backend
            .present(swapchain, image_index, self.current().render_complete)
    }

    /// Move to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Block until every slot's fence has signaled.
    ///
    /// # Errors
    ///
    /// Returns the first fence wait that fails.
    pub fn wait_all(&self) -> RhiResult<()> {
        for slot in &self.slots {
            self.backend.wait_fence(slot.fence)?;
        }
        Ok(())
    }
}

impl Drop for SyncRing {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            warn!("wait_idle failed while destroying sync ring: {}", e);
        }
        for slot in &self.slots {
            slot.destroy(self.backend.as_ref());
        }
        debug!("Destroyed sync ring");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::command::{CommandLevel, Recording};
    use crate::headless::HeadlessBackend;

    fn recorded_cmd(backend: &HeadlessBackend) -> vk::CommandBuffer {
        let cmd = backend
            .allocate_command_buffer(CommandLevel::Primary)
            .unwrap();
        backend.record(cmd, &Recording::primary()).unwrap();
        cmd
    }

    #[test]
    fn test_ring_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SyncRing>();
    }

    #[test]
    fn test_zero_slots_rejected() {
        let backend = HeadlessBackend::new();
        assert!(SyncRing::new(backend, 0).is_err());
    }

    #[test]
    fn test_advance_wraps() {
        let backend = HeadlessBackend::new();
        let mut ring = SyncRing::new(backend, 3).unwrap();
        let indices: Vec<usize> = (0..5)
            .map(|_| {
                let index = ring.current_index();
                ring.advance();
                index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_first_frames_do_not_block() {
        let backend = HeadlessBackend::new();
        backend.set_auto_complete(false);
        let mut ring = SyncRing::new(backend.clone(), 2).unwrap();
        ring.begin_frame().unwrap();
        ring.advance();
        ring.begin_frame().unwrap();
        assert_eq!(ring.frames_begun(), 2);
    }

    #[test]
    fn test_begin_frame_blocks_on_slot_reuse() {
        let backend = HeadlessBackend::new();
        backend.set_auto_complete(false);
        let cmd = recorded_cmd(&backend);
        let mut ring = SyncRing::new(backend.clone(), 2).unwrap();

        for _ in 0..2 {
            ring.begin_frame().unwrap();
            ring.submit(cmd).unwrap();
            ring.advance();
        }
        let slot0_fence = ring.slot(0).unwrap().fence;
        assert_eq!(ring.current_index(), 0);

        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            ring.begin_frame().unwrap();
            tx.send(()).unwrap();
            ring
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        backend.signal_fence(slot0_fence);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let ring = worker.join().unwrap();
        assert_eq!(ring.frames_begun(), 3);
        backend.complete_pending();
    }

    #[test]
    fn test_abandon_frame_unblocks_slot() {
        let backend = HeadlessBackend::new();
        backend.set_auto_complete(false);
        let mut ring = SyncRing::new(backend.clone(), 1).unwrap();
        ring.begin_frame().unwrap();
        let reset_fence = ring.current().fence;
        ring.abandon_frame().unwrap();

        assert_ne!(ring.current().fence, reset_fence);
        ring.begin_frame().unwrap();
    }

    #[test]
    fn test_present_out_of_date_is_recoverable() {
        let backend = HeadlessBackend::new();
        let ring = SyncRing::new(backend.clone(), 2).unwrap();
        backend.inject_out_of_date();
        let err = ring.present(vk::SwapchainKHR::null(), 0).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_drop_releases_objects() {
        let backend = HeadlessBackend::new();
        let ring = SyncRing::new(backend.clone(), 2).unwrap();
        assert_eq!(backend.live_objects(), 6);
        drop(ring);
        assert_eq!(backend.live_objects(), 0);
    }
}
