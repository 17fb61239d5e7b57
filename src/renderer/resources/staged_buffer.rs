use std::sync::Arc;
use ash::vk;
use color_eyre::Result;
use gpu_allocator::MemoryLocation;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::resources::buffer::{Buffer, SrcData};

/// Host-visible staging buffer paired with the device-local buffer shaders bind.
/// Every update copies all registered sources, then the whole staging buffer.
pub struct StagedBuffer {
    pub staging: Buffer,
    pub device_local: Buffer,
}

impl StagedBuffer {
    pub fn new(
        name: &str,
        usage: vk::BufferUsageFlags,
        size: u64,
    ) -> Self {
        Self {
            staging: Buffer::new(
                &format!("{} staging", name),
                usage | vk::BufferUsageFlags::TRANSFER_SRC,
                size,
            ),
            device_local: Buffer::new(
                name,
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                size,
            ),
        }
    }

    pub fn add_src_data(&mut self, src: Arc<dyn SrcData>) {
        self.staging.add_src_data(src);
    }

    pub fn handle(&self) -> vk::Buffer {
        self.device_local.handle()
    }

    pub fn size(&self) -> u64 {
        self.device_local.size
    }

    pub fn allocate(&mut self, dev: &RenderDevice) -> Result<()> {
        self.staging.allocate(dev, MemoryLocation::CpuToGpu, false)?;
        self.staging.map_memory()?;
        self.device_local.size = self.staging.size;
        self.device_local.allocate(dev, MemoryLocation::GpuOnly, false)
    }

    /// Records the full host to device copy into `cmd`, followed by a barrier
    /// making the result visible to any later shader or vertex read
    pub fn update(&mut self, dev: &RenderDevice, cmd: vk::CommandBuffer) -> Result<()> {
        self.staging.copy_src_data(dev)?;
        Buffer::copy(&dev.logical, cmd, &self.staging, &self.device_local, 0, 0, 0)?;

        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ,
            )
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.device_local.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE);
        unsafe {
            dev.logical.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    pub fn free(&mut self) {
        self.staging.unmap_memory();
        self.staging.free();
        self.device_local.free();
    }
}
