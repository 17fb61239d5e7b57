use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{eyre, Result};
use crate::renderer::contexts::device_ctx::device::RenderDevice;

/// Graphics command pool with a static and a dynamic command buffer per swapchain image.
/// Static buffers are recorded once at load, dynamic ones every frame.
pub struct FrameCommands {
    pool: vk::CommandPool,
    static_buffers: Vec<vk::CommandBuffer>,
    dynamic_buffers: Vec<vk::CommandBuffer>,

    device: Arc<ash::Device>,
}

impl FrameCommands {
    pub fn new(dev: &RenderDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(dev.graphics_queue.family.index)
            // Dynamic buffers are reset one by one
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { dev.logical.create_command_pool(&pool_info, None)? };

        Ok(Self {
            pool,
            static_buffers: Vec::new(),
            dynamic_buffers: Vec::new(),
            device: dev.logical.clone(),
        })
    }

    pub fn allocate(&mut self, image_count: usize) -> Result<()> {
        if !self.static_buffers.is_empty() {
            return Err(eyre!("Frame command buffers are already allocated"));
        }
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(image_count as u32);
        unsafe {
            self.static_buffers = self.device.allocate_command_buffers(&info)?;
            self.dynamic_buffers = self.device.allocate_command_buffers(&info)?;
        }
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.static_buffers.len()
    }

    pub fn static_buffer(&self, image_index: usize) -> Result<vk::CommandBuffer> {
        self.static_buffers
            .get(image_index)
            .copied()
            .ok_or_else(|| eyre!("No static command buffer for image {}", image_index))
    }

    pub fn dynamic_buffer(&self, image_index: usize) -> Result<vk::CommandBuffer> {
        self.dynamic_buffers
            .get(image_index)
            .copied()
            .ok_or_else(|| eyre!("No dynamic command buffer for image {}", image_index))
    }

    /// Records the static buffer of `image_index`, resubmittable while pending
    pub fn record_static<F>(&self, image_index: usize, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.static_buffer(image_index)?;
        self.record(cmd, vk::CommandBufferUsageFlags::SIMULTANEOUS_USE, record)
    }

    /// Resets and re-records the dynamic buffer of `image_index`
    pub fn record_dynamic<F>(&self, image_index: usize, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.dynamic_buffer(image_index)?;
        unsafe {
            self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        }
        self.record(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, record)
    }

    pub fn free(&mut self) {
        unsafe {
            if !self.static_buffers.is_empty() {
                self.device.free_command_buffers(self.pool, &self.static_buffers);
            }
            if !self.dynamic_buffers.is_empty() {
                self.device.free_command_buffers(self.pool, &self.dynamic_buffers);
            }
        }
        self.static_buffers.clear();
        self.dynamic_buffers.clear();
    }

    fn record<F>(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe {
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        let recorded = record(cmd);
        // Ended even when recording failed so the buffer can be reset
        let ended = unsafe { self.device.end_command_buffer(cmd) };
        recorded?;
        ended?;
        Ok(())
    }
}

impl Drop for FrameCommands {
    fn drop(&mut self) {
        self.free();
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}
