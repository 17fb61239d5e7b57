use std::sync::{Arc, Mutex};
use ash::vk;
use bytemuck::Pod;
use color_eyre::eyre::{eyre, OptionExt, Result};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    MemoryLocation,
};
use crate::renderer::contexts::device_ctx::device::{lock_allocator, RenderDevice};
use crate::renderer::contexts::device_ctx::queue::QueueRole;

/// Host data a buffer copies from when it is filled
pub trait SrcData: Send + Sync {
    fn byte_len(&self) -> usize;
    fn copy_to(&self, dst: &mut [u8]) -> Result<()>;
}

impl<T: Pod + Send> SrcData for Mutex<T> {
    fn byte_len(&self) -> usize {
        size_of::<T>()
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        let value = self.lock().map_err(|e| eyre!(e.to_string()))?;
        dst.copy_from_slice(bytemuck::bytes_of(&*value));
        Ok(())
    }
}

impl SrcData for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(self);
        Ok(())
    }
}

/// Writes every source back to back into `dst`, in registration order.
/// Returns the number of bytes written.
pub fn concat_src_data(sources: &[Arc<dyn SrcData>], dst: &mut [u8]) -> Result<usize> {
    let mut offset = 0;
    for src in sources {
        let len = src.byte_len();
        let end = offset + len;
        if end > dst.len() {
            return Err(eyre!(
                "Source data ({} bytes) overflows destination ({} bytes)",
                end,
                dst.len()
            ));
        }
        src.copy_to(&mut dst[offset..end])?;
        offset = end;
    }
    Ok(offset)
}

/// Start of a flush range covering `offset`, rounded down to the non-coherent atom size
pub fn flush_offset(offset: u64, atom_size: u64) -> u64 {
    if atom_size == 0 {
        return offset;
    }
    offset - offset % atom_size
}

pub fn total_src_size(sources: &[Arc<dyn SrcData>]) -> u64 {
    sources.iter().map(|src| src.byte_len() as u64).sum()
}

struct BufferMemory {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    location: MemoryLocation,

    allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl Drop for BufferMemory {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free buffer memory: {}", e);
                    }
                }
                Err(e) => log::error!("Memory allocator poisoned: {}", e),
            }
        }
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// GPU buffer whose usage and size are declared up front and whose memory is bound on `allocate`
pub struct Buffer {
    pub usage: vk::BufferUsageFlags,
    pub size: u64,
    pub name: String,

    aligned_uniform_size: bool,
    queue_families: Vec<u32>,
    src_data: Vec<Arc<dyn SrcData>>,
    mapped: bool,

    memory: Option<BufferMemory>,
}

impl Buffer {
    pub fn new(
        name: &str,
        usage: vk::BufferUsageFlags,
        size: u64,
    ) -> Self {
        Self {
            usage,
            size,
            name: name.into(),
            aligned_uniform_size: false,
            queue_families: Vec::new(),
            src_data: Vec::new(),
            mapped: false,
            memory: None,
        }
    }

    /// Rounds the allocated size up to the device's uniform offset alignment
    pub fn with_aligned_uniform_size(mut self) -> Self {
        self.aligned_uniform_size = true;
        self
    }

    /// Makes the buffer concurrently accessible from the given queue families when they differ
    pub fn set_access_queues(&mut self, families: &[u32]) {
        self.queue_families = families.to_vec();
        self.queue_families.dedup();
    }

    pub fn add_src_data(&mut self, src: Arc<dyn SrcData>) {
        self.src_data.push(src);
    }

    pub fn src_data(&self) -> &[Arc<dyn SrcData>] {
        &self.src_data
    }

    pub fn handle(&self) -> vk::Buffer {
        self.memory
            .as_ref()
            .map_or(vk::Buffer::null(), |memory| memory.buffer)
    }

    pub fn is_allocated(&self) -> bool {
        self.memory.is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn allocate(
        &mut self,
        dev: &RenderDevice,
        location: MemoryLocation,
        copy_src_data: bool,
    ) -> Result<()> {
        if self.memory.is_some() {
            return Err(eyre!("Buffer '{}' is already allocated", self.name));
        }

        if self.size == 0 {
            self.size = total_src_size(&self.src_data);
        }
        if self.size == 0 {
            return Err(eyre!("Buffer '{}' has no size and no source data", self.name));
        }
        let size = if self.aligned_uniform_size {
            dev.aligned_uniform_size(self.size)
        } else {
            self.size
        };

        let buffer = {
            let mut buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(self.usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            if self.queue_families.len() > 1 {
                buffer_info = buffer_info
                    .sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&self.queue_families);
            }
            unsafe { dev.logical.create_buffer(&buffer_info, None)? }
        };

        let requirements = unsafe {
            dev.logical.get_buffer_memory_requirements(buffer)
        };
        let allocator = dev.memory_allocator();
        let allocation = lock_allocator(&allocator)?
            .allocate(&AllocationCreateDesc {
                name: &self.name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe {
                    dev.logical.destroy_buffer(buffer, None);
                }
                return Err(e.into());
            }
        };

        let bind_result = unsafe {
            dev.logical.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        // Released by Drop even if the bind failed
        self.memory = Some(BufferMemory {
            buffer,
            allocation: Some(allocation),
            location,
            allocator,
            device: dev.logical.clone(),
        });
        bind_result?;

        if copy_src_data {
            self.copy_src_data(dev)?;
        }

        Ok(())
    }

    /// Allocates device-local memory and fills it from the registered sources
    /// through a temporary staging buffer
    pub fn allocate_staged(&mut self, dev: &RenderDevice, role: QueueRole) -> Result<()> {
        allocate_buffers_staged(dev, role, &mut [self])
    }

    pub fn free(&mut self) {
        self.mapped = false;
        self.memory = None;
    }

    pub fn map_memory(&mut self) -> Result<()> {
        let memory = self.memory_ref()?;
        if memory.location == MemoryLocation::GpuOnly {
            return Err(eyre!("Buffer '{}' is not host visible", self.name));
        }
        self.mapped = true;
        Ok(())
    }

    pub fn unmap_memory(&mut self) {
        self.mapped = false;
    }

    /// Concatenates all registered sources into the buffer memory, mapping it for the copy if needed
    pub fn copy_src_data(&mut self, dev: &RenderDevice) -> Result<()> {
        let auto_mapped = !self.mapped;
        if auto_mapped {
            self.map_memory()?;
        }

        let result = self.write_src_data(dev);

        if auto_mapped {
            self.unmap_memory();
        }
        result
    }

    fn write_src_data(&mut self, dev: &RenderDevice) -> Result<()> {
        let sources = self.src_data.clone();
        let name = self.name.clone();
        let allocation = self.allocation_mut()?;
        let dst = allocation
            .mapped_slice_mut()
            .ok_or_eyre(format!("Buffer '{}' memory is not mapped", name))?;
        concat_src_data(&sources, dst)?;
        self.flush(dev)
    }

    /// Flushes host writes when the memory type is not host-coherent
    pub fn flush(&self, dev: &RenderDevice) -> Result<()> {
        let allocation = self.allocation_ref()?;
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let atom_size = dev.properties.limits.non_coherent_atom_size;
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(flush_offset(allocation.offset(), atom_size))
            .size(vk::WHOLE_SIZE);
        unsafe {
            dev.logical.flush_mapped_memory_ranges(&[range])?;
        }
        Ok(())
    }

    pub fn write_to_mapped_data(&mut self, data: &[u8], offset: usize) -> Result<()> {
        self.write(data, offset).map(|_| ())
    }

    pub fn write<T>(
        &mut self,
        data: &[T],
        start_offset: usize,
    ) -> Result<presser::CopyRecord>
    where
        T: Copy,
    {
        if !self.mapped {
            return Err(eyre!("Buffer '{}' must be mapped before writing", self.name));
        }
        Ok(presser::copy_from_slice_to_offset(
            data,
            self.allocation_mut()?,
            start_offset,
        )?)
    }

    /// Reads `size` bytes from the start of the mapped memory, 0 meaning the whole buffer
    pub fn read_from_mapped_data(&self, size: u64) -> Result<Vec<u8>> {
        if !self.mapped {
            return Err(eyre!("Buffer '{}' must be mapped before reading", self.name));
        }
        let size = (if size == 0 { self.size } else { size }) as usize;
        let src = self.allocation_ref()?
            .mapped_slice()
            .ok_or_eyre(format!("Buffer '{}' memory is not host visible", self.name))?;
        src.get(..size)
            .map(|bytes| bytes.to_vec())
            .ok_or_eyre(format!("Read of {} bytes exceeds buffer '{}'", size, self.name))
    }

    /// Records a buffer to buffer copy, a `size` of 0 copying the whole source
    pub fn copy(
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let size = if size == 0 { src.size } else { size };
        let src_handle = src.memory_ref()?.buffer;
        let dst_handle = dst.memory_ref()?.buffer;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            device.cmd_copy_buffer(cmd, src_handle, dst_handle, &[region]);
        }
        Ok(())
    }

    /// Allocates this buffer in device-local memory and copies the staging buffer into it
    pub fn allocate_from_staging(
        &mut self,
        dev: &RenderDevice,
        role: QueueRole,
        staging: &Buffer,
    ) -> Result<()> {
        if !staging.is_allocated() {
            return Err(eyre!("Staging buffer '{}' is not allocated", staging.name));
        }
        if self.size == 0 {
            self.size = staging.size;
        }
        self.usage |= vk::BufferUsageFlags::TRANSFER_DST;
        self.allocate(dev, MemoryLocation::GpuOnly, false)?;

        let this = &*self;
        dev.single_time_commands(role, |cmd, device| {
            Buffer::copy(device, cmd, staging, this, 0, 0, this.size.min(staging.size))
        })
    }

    fn memory_ref(&self) -> Result<&BufferMemory> {
        self.memory
            .as_ref()
            .ok_or_eyre(format!("Buffer '{}' is not allocated", self.name))
    }

    fn allocation_ref(&self) -> Result<&Allocation> {
        self.memory_ref()?
            .allocation
            .as_ref()
            .ok_or_eyre(format!("Buffer '{}' has no memory", self.name))
    }

    fn allocation_mut(&mut self) -> Result<&mut Allocation> {
        let name = &self.name;
        self.memory
            .as_mut()
            .and_then(|memory| memory.allocation.as_mut())
            .ok_or_eyre(format!("Buffer '{}' is not allocated", name))
    }
}

/// Fills several device-local buffers from their registered sources in one command buffer
pub fn allocate_buffers_staged(
    dev: &RenderDevice,
    role: QueueRole,
    buffers: &mut [&mut Buffer],
) -> Result<()> {
    let mut staging_buffers = Vec::with_capacity(buffers.len());
    for buffer in buffers.iter_mut() {
        let mut staging = Buffer::new(
            &format!("{} staging", buffer.name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            buffer.size,
        );
        for src in buffer.src_data() {
            staging.add_src_data(src.clone());
        }
        staging.allocate(dev, MemoryLocation::CpuToGpu, true)?;

        buffer.size = staging.size;
        buffer.usage |= vk::BufferUsageFlags::TRANSFER_DST;
        buffer.allocate(dev, MemoryLocation::GpuOnly, false)?;
        staging_buffers.push(staging);
    }

    dev.single_time_commands(role, |cmd, device| {
        for (staging, buffer) in staging_buffers.iter().zip(buffers.iter()) {
            Buffer::copy(device, cmd, staging, buffer, 0, 0, staging.size)?;
        }
        Ok(())
    })?;

    // Staging memory goes away once the copies have completed
    drop(staging_buffers);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Block {
        a: u32,
        b: f32,
    }

    #[test]
    fn sources_are_concatenated_in_order() {
        let first: Arc<dyn SrcData> = Arc::new(Mutex::new(Block { a: 7, b: 1.0 }));
        let second: Arc<dyn SrcData> = Arc::new(vec![0xAAu8, 0xBB, 0xCC]);
        let sources = vec![first, second];
        assert_eq!(total_src_size(&sources), 11);

        let mut dst = vec![0u8; 16];
        let written = concat_src_data(&sources, &mut dst).unwrap();
        assert_eq!(written, 11);
        assert_eq!(&dst[0..4], &7u32.to_ne_bytes());
        assert_eq!(&dst[4..8], &1.0f32.to_ne_bytes());
        assert_eq!(&dst[8..11], &[0xAA, 0xBB, 0xCC]);
        assert!(dst[11..].iter().all(|b| *b == 0));
    }

    #[test]
    fn source_overflow_is_an_error() {
        let sources: Vec<Arc<dyn SrcData>> = vec![Arc::new(vec![1u8; 8])];
        let mut dst = vec![0u8; 4];
        assert!(concat_src_data(&sources, &mut dst).is_err());
    }

    #[test]
    fn mutated_source_is_seen_on_next_copy() {
        let block = Arc::new(Mutex::new(Block { a: 1, b: 0.0 }));
        let sources: Vec<Arc<dyn SrcData>> = vec![block.clone()];
        let mut dst = vec![0u8; 8];

        concat_src_data(&sources, &mut dst).unwrap();
        block.lock().unwrap().a = 42;
        concat_src_data(&sources, &mut dst).unwrap();
        assert_eq!(&dst[0..4], &42u32.to_ne_bytes());
    }

    #[test]
    fn unallocated_buffer_has_null_handle() {
        let mut buffer = Buffer::new("test", vk::BufferUsageFlags::UNIFORM_BUFFER, 64);
        assert_eq!(buffer.handle(), vk::Buffer::null());
        assert!(buffer.map_memory().is_err());
        assert!(buffer.read_from_mapped_data(0).is_err());
    }

    #[test]
    fn flush_offset_is_atom_aligned() {
        assert_eq!(flush_offset(0, 64), 0);
        assert_eq!(flush_offset(256, 64), 256);
        assert_eq!(flush_offset(300, 64), 256);
        assert_eq!(flush_offset(300, 0), 300);
    }
}
