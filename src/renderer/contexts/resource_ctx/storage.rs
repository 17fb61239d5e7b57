use ash::vk;
use color_eyre::eyre::{eyre, Result};
use crate::renderer::contexts::resource_ctx::descriptor::ResourceResolver;
use crate::renderer::resources::buffer::Buffer;
use crate::renderer::resources::image::Image;
use crate::renderer::resources::staged_buffer::StagedBuffer;

/// Index of a buffer owned by a [`ResourceStorage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferHandle {
    Plain(usize),
    /// Resolves to the device-local half of the pair
    Staged(usize),
}

/// Index of an image owned by a [`ResourceStorage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub usize);

/// Single owner of the buffers and images a renderer declares.
/// Descriptors and passes refer to them by handle only.
#[derive(Default)]
pub struct ResourceStorage {
    buffers: Vec<Buffer>,
    staged_buffers: Vec<StagedBuffer>,
    images: Vec<Image>,
}

impl ResourceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> BufferHandle {
        self.buffers.push(buffer);
        BufferHandle::Plain(self.buffers.len() - 1)
    }

    pub fn add_staged_buffer(&mut self, buffer: StagedBuffer) -> BufferHandle {
        self.staged_buffers.push(buffer);
        BufferHandle::Staged(self.staged_buffers.len() - 1)
    }

    pub fn add_image(&mut self, image: Image) -> ImageHandle {
        self.images.push(image);
        ImageHandle(self.images.len() - 1)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&Buffer> {
        match handle {
            BufferHandle::Plain(i) => self.buffers.get(i),
            BufferHandle::Staged(i) => self.staged_buffers.get(i).map(|staged| &staged.device_local),
        }
        .ok_or_else(|| eyre!("Unknown buffer handle {:?}", handle))
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut Buffer> {
        match handle {
            BufferHandle::Plain(i) => self.buffers.get_mut(i),
            BufferHandle::Staged(i) => self.staged_buffers.get_mut(i).map(|staged| &mut staged.device_local),
        }
        .ok_or_else(|| eyre!("Unknown buffer handle {:?}", handle))
    }

    pub fn staged_buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut StagedBuffer> {
        match handle {
            BufferHandle::Staged(i) => self.staged_buffers.get_mut(i),
            BufferHandle::Plain(_) => None,
        }
        .ok_or_else(|| eyre!("{:?} is not a staged buffer", handle))
    }

    pub fn image(&self, handle: ImageHandle) -> Result<&Image> {
        self.images
            .get(handle.0)
            .ok_or_else(|| eyre!("Unknown image handle {:?}", handle))
    }

    pub fn image_mut(&mut self, handle: ImageHandle) -> Result<&mut Image> {
        self.images
            .get_mut(handle.0)
            .ok_or_else(|| eyre!("Unknown image handle {:?}", handle))
    }

    /// Frees the memory of every buffer, keeping the declarations for the next allocation
    pub fn free_buffers(&mut self) {
        for buffer in &mut self.buffers {
            buffer.free();
        }
        for staged in &mut self.staged_buffers {
            staged.free();
        }
    }

    pub fn destroy_images(&mut self) {
        for image in &mut self.images {
            image.destroy();
        }
    }

    /// Drops every declaration, invalidating all outstanding handles
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.staged_buffers.clear();
        self.images.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.staged_buffers.is_empty() && self.images.is_empty()
    }
}

impl ResourceResolver for ResourceStorage {
    fn resolve_buffer(&self, handle: BufferHandle) -> Option<(vk::Buffer, u64)> {
        self.buffer(handle).ok().map(|buffer| (buffer.handle(), buffer.size))
    }

    fn resolve_image(&self, handle: ImageHandle) -> Option<(vk::ImageView, vk::Sampler)> {
        self.image(handle).ok().map(|image| (image.view(), image.sampler()))
    }
}
