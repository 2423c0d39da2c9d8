// Frame synchronization
//
// Each frame in flight owns two semaphores, a fence and a command buffer.
// FrameRing tracks the state of every slot so the cap on in-flight frames
// can be checked without a GPU.

use super::device::GraphicsDevice;
use super::error::{CreationContext, Result, RhiError};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled, resources free to touch
    Idle,
    Acquiring,
    Recording,
    /// Fence reset, GPU executing
    Submitted,
}

/// Slot bookkeeping, cycled by a modulo counter
#[derive(Debug, Clone)]
pub struct FrameRing {
    states: Vec<SlotState>,
    current: usize,
}

impl FrameRing {
    pub fn new(slots: usize) -> Self {
        Self {
            states: vec![SlotState::Idle; slots.max(1)],
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// The slot's fence signaled
    pub fn retire(&mut self, slot: usize) {
        if self.states[slot] == SlotState::Submitted {
            self.states[slot] = SlotState::Idle;
        }
    }

    pub fn begin_acquire(&mut self) {
        debug_assert_eq!(self.states[self.current], SlotState::Idle);
        self.states[self.current] = SlotState::Acquiring;
    }

    /// Acquire failed; the fence was never reset so the slot is idle again
    pub fn abort_acquire(&mut self) {
        self.states[self.current] = SlotState::Idle;
    }

    pub fn begin_recording(&mut self) {
        debug_assert_eq!(self.states[self.current], SlotState::Acquiring);
        self.states[self.current] = SlotState::Recording;
    }

    pub fn submitted(&mut self) {
        debug_assert_eq!(self.states[self.current], SlotState::Recording);
        self.states[self.current] = SlotState::Submitted;
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.states.len();
    }

    pub fn in_flight(&self) -> usize {
        self.states
            .iter()
            .filter(|&&state| state == SlotState::Submitted)
            .count()
    }
}

/// Convert a configured fence timeout into nanoseconds (`None` waits forever)
pub fn fence_timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
    device: Arc<GraphicsDevice>,
}

impl FrameSlot {
    pub fn new(device: &Arc<GraphicsDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let vk_device = &device.device;
        unsafe {
            let image_available = vk_device
                .create_semaphore(&semaphore_info, None)
                .creating("image-available semaphore")?;
            let render_finished = match vk_device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(result) => {
                    vk_device.destroy_semaphore(image_available, None);
                    return Err(RhiError::ResourceCreation {
                        what: "render-finished semaphore",
                        result,
                    });
                }
            };
            let mut slot = Self {
                image_available,
                render_finished,
                in_flight: vk::Fence::null(),
                command_buffer: vk::CommandBuffer::null(),
                device: Arc::clone(device),
            };
            slot.in_flight = vk_device
                .create_fence(&fence_info, None)
                .creating("in-flight fence")?;
            slot.command_buffer = vk_device
                .allocate_command_buffers(&alloc_info)
                .creating("frame command buffer")?[0];
            Ok(slot)
        }
    }

    /// Block until the GPU has finished this slot's previous submission
    pub fn wait(&self, slot: usize, timeout: Option<Duration>) -> Result<()> {
        let result = unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight], true, fence_timeout_ns(timeout))
        };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::FenceTimeout {
                slot,
                waited: timeout.unwrap_or(Duration::MAX),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn reset_fence(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight]) }?;
        Ok(())
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        unsafe {
            let device = &self.device.device;
            if self.command_buffer != vk::CommandBuffer::null() {
                device.free_command_buffers(self.device.command_pool, &[self.command_buffer]);
            }
            if self.in_flight != vk::Fence::null() {
                device.destroy_fence(self.in_flight, None);
            }
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_semaphore(self.image_available, None);
        }
    }
}
