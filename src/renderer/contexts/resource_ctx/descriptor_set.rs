use std::collections::BTreeMap;
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use gpu_descriptor::{DescriptorSetLayoutCreateFlags, DescriptorTotalCount};
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor::{
    add_to_total_count, empty_total_count, write_descriptor_sets, DescriptorResource,
    PendingWrite, ResourceResolver,
};
use crate::renderer::contexts::resource_ctx::storage::{BufferHandle, ImageHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub stages: vk::ShaderStageFlags,
    pub resource: DescriptorResource,
    pub descriptor_count: u32,
    pub dst_array_element: u32,
}

impl DescriptorBinding {
    pub fn new(binding: u32, stages: vk::ShaderStageFlags, resource: DescriptorResource) -> Self {
        Self {
            binding,
            stages,
            resource,
            descriptor_count: 1,
            dst_array_element: 0,
        }
    }

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.resource.descriptor_type()
    }

    pub fn layout_binding(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type())
            .descriptor_count(self.descriptor_count)
            .stage_flags(self.stages)
    }
}

/// Declared bindings of one set, its layout and its allocation.
/// Bindings are kept ordered by binding number.
pub struct DescriptorSet {
    pub set: u32,
    bindings: BTreeMap<u32, DescriptorBinding>,
    layout: vk::DescriptorSetLayout,
    allocation: Option<gpu_descriptor::DescriptorSet<vk::DescriptorSet>>,
}

impl DescriptorSet {
    pub fn new(set: u32) -> Self {
        Self {
            set,
            bindings: BTreeMap::new(),
            layout: vk::DescriptorSetLayout::null(),
            allocation: None,
        }
    }

    /// Declares a binding, replacing any previous one with the same number
    pub fn add_binding(&mut self, binding: DescriptorBinding) -> &mut Self {
        if self.bindings.insert(binding.binding, binding).is_some() {
            log::warn!("Binding {} of set {} redeclared", binding.binding, self.set);
        }
        self
    }

    pub fn add_storage_buffer(&mut self, binding: u32, stages: vk::ShaderStageFlags, buffer: BufferHandle) -> &mut Self {
        self.add_binding(DescriptorBinding::new(binding, stages, DescriptorResource::StorageBuffer(buffer)))
    }

    pub fn add_uniform_buffer(&mut self, binding: u32, stages: vk::ShaderStageFlags, buffer: BufferHandle) -> &mut Self {
        self.add_binding(DescriptorBinding::new(binding, stages, DescriptorResource::UniformBuffer(buffer)))
    }

    pub fn add_storage_image(&mut self, binding: u32, stages: vk::ShaderStageFlags, image: ImageHandle) -> &mut Self {
        self.add_binding(DescriptorBinding::new(binding, stages, DescriptorResource::StorageImage(image)))
    }

    pub fn add_combined_image_sampler(&mut self, binding: u32, stages: vk::ShaderStageFlags, image: ImageHandle) -> &mut Self {
        self.add_binding(DescriptorBinding::new(binding, stages, DescriptorResource::CombinedImageSampler(image)))
    }

    pub fn add_input_attachment(&mut self, binding: u32, stages: vk::ShaderStageFlags, image: ImageHandle) -> &mut Self {
        self.add_binding(DescriptorBinding::new(binding, stages, DescriptorResource::InputAttachment(image)))
    }

    pub fn add_input_attachment_depth_stencil(&mut self, binding: u32, stages: vk::ShaderStageFlags, image: ImageHandle) -> &mut Self {
        self.add_binding(DescriptorBinding::new(binding, stages, DescriptorResource::InputAttachmentDepthStencil(image)))
    }

    pub fn add_acceleration_structure(
        &mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> &mut Self {
        self.add_binding(DescriptorBinding::new(
            binding,
            stages,
            DescriptorResource::AccelerationStructure(acceleration_structure),
        ))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &DescriptorBinding> {
        self.bindings.values()
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.allocation
            .as_ref()
            .map_or(vk::DescriptorSet::null(), |allocation| *allocation.raw())
    }

    /// Pool space one allocation of this set needs
    pub fn total_count(&self) -> DescriptorTotalCount {
        let mut total = empty_total_count();
        for binding in self.bindings() {
            add_to_total_count(&mut total, binding.descriptor_type(), binding.descriptor_count);
        }
        total
    }

    pub fn create_layout(&mut self, device: &ash::Device) -> Result<()> {
        if self.layout != vk::DescriptorSetLayout::null() {
            return Err(eyre!("Layout of descriptor set {} already exists", self.set));
        }
        let layout_bindings = self.bindings()
            .map(DescriptorBinding::layout_binding)
            .collect::<Vec<_>>();
        let info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&layout_bindings);
        self.layout = unsafe { device.create_descriptor_set_layout(&info, None)? };
        Ok(())
    }

    pub fn destroy_layout(&mut self, device: &ash::Device) {
        if self.layout != vk::DescriptorSetLayout::null() {
            unsafe {
                device.destroy_descriptor_set_layout(self.layout, None);
            }
            self.layout = vk::DescriptorSetLayout::null();
        }
    }

    /// Writes for every binding whose resource is ready. Nothing is written before the set is allocated.
    pub fn pending_writes(&self, resolver: &impl ResourceResolver) -> Vec<PendingWrite> {
        let set = self.handle();
        if set == vk::DescriptorSet::null() {
            return Vec::new();
        }
        self.bindings()
            .filter_map(|binding| {
                let info = binding.resource.write_info(resolver)?;
                Some(PendingWrite {
                    set,
                    binding: binding.binding,
                    array_element: binding.dst_array_element,
                    descriptor_type: binding.descriptor_type(),
                    info,
                })
            })
            .collect()
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if self.layout != vk::DescriptorSetLayout::null() || self.allocation.is_some() {
            log::error!("Descriptor set {} dropped while its layout or allocation is alive", self.set);
        }
    }
}

/// Index of a set owned by a [`DescriptorSetRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub usize);

/// Owns every descriptor set of a renderer. Sets are declared during layout
/// initialization and created, written and destroyed together.
#[derive(Default)]
pub struct DescriptorSetRegistry {
    sets: Vec<DescriptorSet>,
}

impl DescriptorSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, set: DescriptorSet) -> DescriptorSetHandle {
        self.sets.push(set);
        DescriptorSetHandle(self.sets.len() - 1)
    }

    pub fn get(&self, handle: DescriptorSetHandle) -> Result<&DescriptorSet> {
        self.sets
            .get(handle.0)
            .ok_or_else(|| eyre!("Unknown descriptor set {:?}", handle))
    }

    pub fn get_mut(&mut self, handle: DescriptorSetHandle) -> Result<&mut DescriptorSet> {
        self.sets
            .get_mut(handle.0)
            .ok_or_else(|| eyre!("Unknown descriptor set {:?}", handle))
    }

    pub fn layout(&self, handle: DescriptorSetHandle) -> Result<vk::DescriptorSetLayout> {
        Ok(self.get(handle)?.layout())
    }

    pub fn handle(&self, handle: DescriptorSetHandle) -> Result<vk::DescriptorSet> {
        Ok(self.get(handle)?.handle())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Creates every layout, then allocates one set per layout from pools sized by its bindings
    pub fn create_all(&mut self, dev: &RenderDevice) -> Result<()> {
        for set in &mut self.sets {
            set.create_layout(&dev.logical)?;
        }

        let descriptor_device = dev.descriptor_device();
        let mut allocator = dev.descriptor_allocator
            .lock()
            .map_err(|e| eyre!(e.to_string()))?;
        for set in &mut self.sets {
            let total = set.total_count();
            let allocation = unsafe {
                allocator
                    .allocate(
                        &descriptor_device,
                        &set.layout,
                        DescriptorSetLayoutCreateFlags::empty(),
                        &total,
                        1,
                    )?
                    .drain(..)
                    .next()
                    .ok_or_eyre(format!("Failed to allocate descriptor set {}", set.set))?
            };
            set.allocation = Some(allocation);
        }
        log::debug!("Allocated {} descriptor sets", self.sets.len());
        Ok(())
    }

    /// Returns every allocation to its pool and destroys the layouts
    pub fn destroy_all(&mut self, dev: &RenderDevice) -> Result<()> {
        let allocations = self.sets
            .iter_mut()
            .filter_map(|set| set.allocation.take())
            .collect::<Vec<_>>();
        if !allocations.is_empty() {
            let descriptor_device = dev.descriptor_device();
            let mut allocator = dev.descriptor_allocator
                .lock()
                .map_err(|e| eyre!(e.to_string()))?;
            unsafe {
                allocator.free(&descriptor_device, allocations);
            }
        }
        for set in &mut self.sets {
            set.destroy_layout(&dev.logical);
        }
        Ok(())
    }

    pub fn update_all(&self, dev: &RenderDevice, resolver: &impl ResourceResolver) {
        let pending = self.sets
            .iter()
            .flat_map(|set| set.pending_writes(resolver))
            .collect::<Vec<_>>();
        write_descriptor_sets(&dev.logical, &pending);
    }

    /// Rewrites only the given sets
    pub fn update(
        &self,
        dev: &RenderDevice,
        resolver: &impl ResourceResolver,
        subset: &[DescriptorSetHandle],
    ) -> Result<()> {
        let mut pending = Vec::new();
        for handle in subset {
            pending.extend(self.get(*handle)?.pending_writes(resolver));
        }
        write_descriptor_sets(&dev.logical, &pending);
        Ok(())
    }

    /// Forgets every declaration. Sets must already be destroyed.
    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::resource_ctx::descriptor::tests::FakeResolver;

    fn lighting_inputs() -> DescriptorSet {
        let mut set = DescriptorSet::new(1);
        set.add_input_attachment(2, vk::ShaderStageFlags::FRAGMENT, ImageHandle(2))
            .add_input_attachment(0, vk::ShaderStageFlags::FRAGMENT, ImageHandle(0))
            .add_input_attachment(1, vk::ShaderStageFlags::FRAGMENT, ImageHandle(1));
        set
    }

    #[test]
    fn bindings_iterate_in_binding_order() {
        let set = lighting_inputs();
        let order = set.bindings().map(|b| b.binding).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2]);

        let layout_bindings = set.bindings().map(DescriptorBinding::layout_binding).collect::<Vec<_>>();
        assert!(layout_bindings.iter().all(|b| b.descriptor_type == vk::DescriptorType::INPUT_ATTACHMENT));
        assert!(layout_bindings.iter().all(|b| b.descriptor_count == 1));
        assert_eq!(layout_bindings[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn pool_size_counts_every_binding() {
        let mut set = lighting_inputs();
        set.add_uniform_buffer(3, vk::ShaderStageFlags::ALL_GRAPHICS, BufferHandle::Staged(0));
        let total = set.total_count();
        assert_eq!(total.input_attachment, 3);
        assert_eq!(total.uniform_buffer, 1);
        assert_eq!(total.combined_image_sampler, 0);
    }

    #[test]
    fn redeclared_binding_replaces_previous() {
        let mut set = DescriptorSet::new(0);
        set.add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX, BufferHandle::Plain(0))
            .add_storage_buffer(0, vk::ShaderStageFlags::VERTEX, BufferHandle::Plain(1));
        let bindings = set.bindings().collect::<Vec<_>>();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].descriptor_type(), vk::DescriptorType::STORAGE_BUFFER);
    }

    #[test]
    fn unallocated_set_produces_no_writes() {
        let set = lighting_inputs();
        let resolver = FakeResolver::default();
        assert!(set.pending_writes(&resolver).is_empty());
        assert_eq!(set.handle(), vk::DescriptorSet::null());
    }

    #[test]
    fn registry_handles_are_sequential() {
        let mut registry = DescriptorSetRegistry::new();
        let camera = registry.add(DescriptorSet::new(0));
        let inputs = registry.add(lighting_inputs());
        assert_eq!(camera, DescriptorSetHandle(0));
        assert_eq!(inputs, DescriptorSetHandle(1));
        assert_eq!(registry.get(inputs).unwrap().set, 1);
        assert_eq!(registry.layout(camera).unwrap(), vk::DescriptorSetLayout::null());
        assert!(registry.get(DescriptorSetHandle(2)).is_err());
    }
}
