use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{eyre, Result};
use crate::renderer::contexts::frame_ctx::MAX_FRAMES_IN_FLIGHT;

/// Signals of one frame-in-flight slot
#[derive(Debug, Clone, Copy)]
pub struct SlotSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub dynamic_render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl SlotSync {
    const NULL: Self = Self {
        image_available: vk::Semaphore::null(),
        render_finished: vk::Semaphore::null(),
        dynamic_render_finished: vk::Semaphore::null(),
        in_flight: vk::Fence::null(),
    };
}

/// Semaphores and fences of every frame-in-flight slot.
/// Fences start signaled so the first wait on each slot returns at once.
pub struct FrameSync {
    slots: [SlotSync; MAX_FRAMES_IN_FLIGHT],
    device: Arc<ash::Device>,
}

impl FrameSync {
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        // Dropping a partly filled set destroys what was created so far
        let mut sync = Self {
            slots: [SlotSync::NULL; MAX_FRAMES_IN_FLIGHT],
            device,
        };
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default()
            .flags(vk::FenceCreateFlags::SIGNALED);
        for i in 0..MAX_FRAMES_IN_FLIGHT {
            unsafe {
                sync.slots[i].image_available = sync.device.create_semaphore(&semaphore_info, None)?;
                sync.slots[i].render_finished = sync.device.create_semaphore(&semaphore_info, None)?;
                sync.slots[i].dynamic_render_finished = sync.device.create_semaphore(&semaphore_info, None)?;
                sync.slots[i].in_flight = sync.device.create_fence(&fence_info, None)?;
            }
        }
        Ok(sync)
    }

    pub fn slot(&self, slot: usize) -> Result<&SlotSync> {
        self.slots
            .get(slot)
            .ok_or_else(|| eyre!("Frame slot {} out of range", slot))
    }

    /// Blocks until the slot's previous submission has completed. A timeout is fatal.
    pub fn wait(&self, slot: usize, timeout_ns: u64) -> Result<()> {
        let fence = self.slot(slot)?.in_flight;
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(eyre!("Timed out waiting for frame slot {}", slot)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn reset(&self, slot: usize) -> Result<()> {
        let fence = self.slot(slot)?.in_flight;
        unsafe {
            self.device.reset_fences(&[fence])?;
        }
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            for slot in &self.slots {
                for semaphore in [slot.image_available, slot.render_finished, slot.dynamic_render_finished] {
                    if semaphore != vk::Semaphore::null() {
                        self.device.destroy_semaphore(semaphore, None);
                    }
                }
                if slot.in_flight != vk::Fence::null() {
                    self.device.destroy_fence(slot.in_flight, None);
                }
            }
        }
    }
}
