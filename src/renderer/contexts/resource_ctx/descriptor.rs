use ash::vk;
use gpu_descriptor::DescriptorTotalCount;
use crate::renderer::contexts::resource_ctx::storage::{BufferHandle, ImageHandle};

/// Native handles a descriptor needs, looked up when the set is written
pub trait ResourceResolver {
    /// Buffer handle and byte size, `None` when the handle is unknown
    fn resolve_buffer(&self, handle: BufferHandle) -> Option<(vk::Buffer, u64)>;
    /// Image view and sampler, `None` when the handle is unknown
    fn resolve_image(&self, handle: ImageHandle) -> Option<(vk::ImageView, vk::Sampler)>;
}

/// What a binding points at, one variant per supported descriptor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    StorageBuffer(BufferHandle),
    UniformBuffer(BufferHandle),
    /// Image view bound as a storage image
    StorageImage(ImageHandle),
    CombinedImageSampler(ImageHandle),
    InputAttachment(ImageHandle),
    InputAttachmentDepthStencil(ImageHandle),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl DescriptorResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            Self::CombinedImageSampler(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::InputAttachment(_) | Self::InputAttachmentDepthStencil(_) => {
                vk::DescriptorType::INPUT_ATTACHMENT
            }
            Self::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }

    /// Write payload for the bound resource, or `None` while any handle it needs is still null
    pub fn write_info(&self, resolver: &impl ResourceResolver) -> Option<WriteInfo> {
        match *self {
            Self::StorageBuffer(handle) | Self::UniformBuffer(handle) => {
                let (buffer, size) = resolver.resolve_buffer(handle)?;
                (buffer != vk::Buffer::null()).then(|| {
                    WriteInfo::Buffer(vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range: size,
                    })
                })
            }
            Self::StorageImage(handle) => {
                image_write(resolver, handle, vk::ImageLayout::GENERAL, false)
            }
            Self::CombinedImageSampler(handle) => {
                image_write(resolver, handle, vk::ImageLayout::GENERAL, true)
            }
            Self::InputAttachment(handle) => {
                image_write(resolver, handle, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, false)
            }
            Self::InputAttachmentDepthStencil(handle) => {
                image_write(resolver, handle, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL, false)
            }
            Self::AccelerationStructure(handle) => {
                (handle != vk::AccelerationStructureKHR::null())
                    .then_some(WriteInfo::AccelerationStructure(handle))
            }
        }
    }
}

fn image_write(
    resolver: &impl ResourceResolver,
    handle: ImageHandle,
    image_layout: vk::ImageLayout,
    with_sampler: bool,
) -> Option<WriteInfo> {
    let (image_view, sampler) = resolver.resolve_image(handle)?;
    if image_view == vk::ImageView::null() {
        return None;
    }
    if with_sampler && sampler == vk::Sampler::null() {
        return None;
    }
    Some(WriteInfo::Image(vk::DescriptorImageInfo {
        sampler: if with_sampler { sampler } else { vk::Sampler::null() },
        image_view,
        image_layout,
    }))
}

#[derive(Debug, Clone, Copy)]
pub enum WriteInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// Fully resolved descriptor write, owning its payload until submitted
#[derive(Debug, Clone, Copy)]
pub struct PendingWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub info: WriteInfo,
}

/// Submits every write in one `vkUpdateDescriptorSets` call
pub fn write_descriptor_sets(device: &ash::Device, pending: &[PendingWrite]) {
    if pending.is_empty() {
        return;
    }

    let mut acceleration_structure_infos = pending
        .iter()
        .map(|write| match &write.info {
            WriteInfo::AccelerationStructure(handle) => {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(handle))
            }
            _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
        })
        .collect::<Vec<_>>();

    let writes = pending
        .iter()
        .zip(acceleration_structure_infos.iter_mut())
        .map(|(write, acceleration_structure_info)| {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(write.array_element)
                .descriptor_type(write.descriptor_type);
            match &write.info {
                WriteInfo::Buffer(info) => base.buffer_info(std::slice::from_ref(info)),
                WriteInfo::Image(info) => base.image_info(std::slice::from_ref(info)),
                WriteInfo::AccelerationStructure(_) => base
                    .descriptor_count(1)
                    .push_next(acceleration_structure_info),
            }
        })
        .collect::<Vec<_>>();

    log::trace!("Writing {} descriptors", writes.len());
    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
}

pub fn empty_total_count() -> DescriptorTotalCount {
    DescriptorTotalCount {
        sampler: 0,
        combined_image_sampler: 0,
        sampled_image: 0,
        storage_image: 0,
        uniform_texel_buffer: 0,
        storage_texel_buffer: 0,
        uniform_buffer: 0,
        storage_buffer: 0,
        uniform_buffer_dynamic: 0,
        storage_buffer_dynamic: 0,
        input_attachment: 0,
        acceleration_structure: 0,
        inline_uniform_block_bytes: 0,
        inline_uniform_block_bindings: 0,
    }
}

/// Adds `count` descriptors of type `ty` to a pool size request
pub fn add_to_total_count(total: &mut DescriptorTotalCount, ty: vk::DescriptorType, count: u32) {
    let slot = match ty {
        vk::DescriptorType::SAMPLER => &mut total.sampler,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER => &mut total.combined_image_sampler,
        vk::DescriptorType::SAMPLED_IMAGE => &mut total.sampled_image,
        vk::DescriptorType::STORAGE_IMAGE => &mut total.storage_image,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER => &mut total.uniform_texel_buffer,
        vk::DescriptorType::STORAGE_TEXEL_BUFFER => &mut total.storage_texel_buffer,
        vk::DescriptorType::UNIFORM_BUFFER => &mut total.uniform_buffer,
        vk::DescriptorType::STORAGE_BUFFER => &mut total.storage_buffer,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => &mut total.uniform_buffer_dynamic,
        vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => &mut total.storage_buffer_dynamic,
        vk::DescriptorType::INPUT_ATTACHMENT => &mut total.input_attachment,
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => &mut total.acceleration_structure,
        _ => {
            log::warn!("Descriptor type {:?} is not counted in pool sizes", ty);
            return;
        }
    };
    *slot += count;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeResolver {
        pub buffers: HashMap<BufferHandle, (vk::Buffer, u64)>,
        pub images: HashMap<ImageHandle, (vk::ImageView, vk::Sampler)>,
    }

    impl ResourceResolver for FakeResolver {
        fn resolve_buffer(&self, handle: BufferHandle) -> Option<(vk::Buffer, u64)> {
            self.buffers.get(&handle).copied()
        }

        fn resolve_image(&self, handle: ImageHandle) -> Option<(vk::ImageView, vk::Sampler)> {
            self.images.get(&handle).copied()
        }
    }

    #[test]
    fn buffer_write_waits_for_a_real_handle() {
        let mut resolver = FakeResolver::default();
        let handle = BufferHandle::Plain(0);
        let resource = DescriptorResource::UniformBuffer(handle);

        assert!(resource.write_info(&resolver).is_none());
        resolver.buffers.insert(handle, (vk::Buffer::null(), 64));
        assert!(resource.write_info(&resolver).is_none());

        resolver.buffers.insert(handle, (vk::Buffer::from_raw(7), 64));
        match resource.write_info(&resolver) {
            Some(WriteInfo::Buffer(info)) => {
                assert_eq!(info.buffer, vk::Buffer::from_raw(7));
                assert_eq!(info.offset, 0);
                assert_eq!(info.range, 64);
            }
            other => panic!("unexpected write info {:?}", other),
        }
    }

    #[test]
    fn combined_sampler_needs_view_and_sampler() {
        let mut resolver = FakeResolver::default();
        let handle = ImageHandle(3);
        let resource = DescriptorResource::CombinedImageSampler(handle);

        resolver.images.insert(handle, (vk::ImageView::from_raw(1), vk::Sampler::null()));
        assert!(resource.write_info(&resolver).is_none());

        resolver.images.insert(handle, (vk::ImageView::from_raw(1), vk::Sampler::from_raw(2)));
        match resource.write_info(&resolver) {
            Some(WriteInfo::Image(info)) => {
                assert_eq!(info.sampler, vk::Sampler::from_raw(2));
                assert_eq!(info.image_layout, vk::ImageLayout::GENERAL);
            }
            other => panic!("unexpected write info {:?}", other),
        }
    }

    #[test]
    fn image_kinds_pick_their_layouts() {
        let mut resolver = FakeResolver::default();
        let handle = ImageHandle(0);
        resolver.images.insert(handle, (vk::ImageView::from_raw(9), vk::Sampler::from_raw(4)));

        let layout_of = |resource: DescriptorResource| match resource.write_info(&resolver) {
            Some(WriteInfo::Image(info)) => {
                assert_eq!(info.image_view, vk::ImageView::from_raw(9));
                (info.image_layout, info.sampler)
            }
            other => panic!("unexpected write info {:?}", other),
        };

        assert_eq!(
            layout_of(DescriptorResource::StorageImage(handle)),
            (vk::ImageLayout::GENERAL, vk::Sampler::null())
        );
        assert_eq!(
            layout_of(DescriptorResource::InputAttachment(handle)),
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::Sampler::null())
        );
        assert_eq!(
            layout_of(DescriptorResource::InputAttachmentDepthStencil(handle)),
            (vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL, vk::Sampler::null())
        );
    }

    #[test]
    fn acceleration_structure_write_needs_handle() {
        let resolver = FakeResolver::default();
        let null = DescriptorResource::AccelerationStructure(vk::AccelerationStructureKHR::null());
        assert!(null.write_info(&resolver).is_none());

        let live = DescriptorResource::AccelerationStructure(vk::AccelerationStructureKHR::from_raw(5));
        assert!(matches!(live.write_info(&resolver), Some(WriteInfo::AccelerationStructure(_))));
        assert_eq!(live.descriptor_type(), vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
    }

    #[test]
    fn total_count_accumulates_per_type() {
        let mut total = empty_total_count();
        add_to_total_count(&mut total, vk::DescriptorType::INPUT_ATTACHMENT, 1);
        add_to_total_count(&mut total, vk::DescriptorType::INPUT_ATTACHMENT, 2);
        add_to_total_count(&mut total, vk::DescriptorType::UNIFORM_BUFFER, 1);
        assert_eq!(total.input_attachment, 3);
        assert_eq!(total.uniform_buffer, 1);
        assert_eq!(total.storage_buffer, 0);
    }
}
