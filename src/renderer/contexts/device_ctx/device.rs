use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_descriptor::{CreatePoolError, DescriptorAllocator, DescriptorDevice, DescriptorPoolCreateFlags, DescriptorTotalCount, DeviceAllocationError};
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::instance::RenderInstance;
use crate::renderer::contexts::device_ctx::queue::{find_queue_families, Queue, QueueFamilySelection, QueueRole};
use crate::renderer::contexts::device_ctx::transfer_ctx::TransferContext;

/// What device selection knows about one physical device
#[derive(Clone, Debug)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub extensions: Vec<CString>,
    pub queue_families: Option<QueueFamilySelection>,
}

impl PhysicalDeviceInfo {
    pub fn supports_extension(&self, ext: &CStr) -> bool {
        self.extensions.iter().any(|sup| sup.as_c_str() == ext)
    }
}

/// Returns `None` when the device can't be used at all, otherwise its score.
/// A usable device starts at 1 and gains a point per supported optional extension
/// before the caller gets to adjust the score.
pub fn score_candidate(
    info: &PhysicalDeviceInfo,
    required_extensions: &[&CStr],
    optional_extensions: &[&CStr],
    scorer: &dyn Fn(&mut i32, &PhysicalDeviceInfo),
) -> Option<i32> {
    info.queue_families.as_ref()?;

    for ext in required_extensions {
        if !info.supports_extension(ext) {
            log::debug!("{} does not support required extension {:?}", info.name, ext);
            return None;
        }
    }

    let mut score = 1;
    score += optional_extensions
        .iter()
        .filter(|ext| info.supports_extension(ext))
        .count() as i32;

    scorer(&mut score, info);
    Some(score)
}

/// Highest positive score wins, ties go to the first enumerated device.
/// A score of 0 or below vetoes the device.
pub fn select_best(scores: &[Option<i32>]) -> Option<usize> {
    let mut best: Option<(usize, i32)> = None;
    for (i, score) in scores.iter().enumerate() {
        if let Some(score) = score.filter(|score| *score > 0) {
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((i, score));
            }
        }
    }
    best.map(|(i, _)| i)
}

pub fn aligned_uniform_size(size: u64, min_alignment: u64) -> u64 {
    if min_alignment == 0 {
        return size;
    }
    size.div_ceil(min_alignment) * min_alignment
}

pub struct RenderDevice {
    pub logical: Arc<ash::Device>,
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    instance: ash::Instance,

    pub graphics_queue: Arc<Queue>,
    pub transfer_queue: Arc<Queue>,
    // Always the graphics queue
    pub present_queue: Arc<Queue>,

    enabled_extensions: Vec<CString>,

    memory_allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    pub descriptor_allocator: Mutex<DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>>,

    graphics_transfer_context: ManuallyDrop<TransferContext>,
    transfer_context: ManuallyDrop<TransferContext>,
}

impl RenderDevice {
    pub fn new(
        instance: &RenderInstance,
        surface: Option<vk::SurfaceKHR>,
        config: &RenderConfig,
        scorer: &dyn Fn(&mut i32, &PhysicalDeviceInfo),
    ) -> Result<Self> {
        let required_extensions = config.required_extensions();
        let optional_extensions = &config.optional_device_extensions;

        let candidates = Self::enumerate_candidates(instance, surface)?;
        let scores = candidates
            .iter()
            .map(|info| score_candidate(info, &required_extensions, optional_extensions, scorer))
            .collect::<Vec<_>>();
        let best = select_best(&scores)
            .ok_or_eyre("No suitable physical device found")?;
        let selected = &candidates[best];
        let queue_families = selected.queue_families
            .clone()
            .ok_or_eyre("Selected physical device has no usable queues")?;

        let mut enabled_extensions = required_extensions
            .iter()
            .map(|ext| CString::from(*ext))
            .collect::<Vec<_>>();
        enabled_extensions.extend(
            optional_extensions
                .iter()
                .filter(|ext| selected.supports_extension(ext))
                .map(|ext| CString::from(*ext))
        );

        let properties = unsafe {
            instance.instance.get_physical_device_properties(selected.handle)
        };
        log::info!("Selected physical device: {} ({:?})", selected.name, selected.device_type);
        log::info!("Enabled device extensions: {:?}", enabled_extensions);

        let physical_device = selected.handle;
        let (logical_device, graphics_queue, transfer_queue) = Self::create_logical_device(
            &instance.instance,
            physical_device,
            &queue_families,
            &enabled_extensions,
        )?;

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: logical_device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: false,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let logical_device = Arc::new(logical_device);
        let graphics_queue = Arc::new(graphics_queue);
        let transfer_queue = Arc::new(transfer_queue);

        let timeout_ns = config.frame_timeout_ns();
        let graphics_transfer_context = TransferContext::new(
            graphics_queue.clone(),
            logical_device.clone(),
            timeout_ns,
        )?;
        let transfer_context = TransferContext::new(
            transfer_queue.clone(),
            logical_device.clone(),
            timeout_ns,
        )?;

        Ok(Self {
            logical: logical_device,
            physical: physical_device,
            properties,
            instance: instance.instance.clone(),

            present_queue: graphics_queue.clone(),
            graphics_queue,
            transfer_queue,

            enabled_extensions,

            memory_allocator: ManuallyDrop::new(Arc::new(Mutex::new(memory_allocator))),
            descriptor_allocator: Mutex::new(DescriptorAllocator::new(1024)),

            graphics_transfer_context: ManuallyDrop::new(graphics_transfer_context),
            transfer_context: ManuallyDrop::new(transfer_context),
        })
    }

    pub fn memory_allocator(&self) -> Arc<Mutex<Allocator>> {
        Arc::clone(&self.memory_allocator)
    }

    pub fn queue(&self, role: QueueRole) -> &Arc<Queue> {
        match role {
            QueueRole::Graphics => &self.graphics_queue,
            QueueRole::Transfer => &self.transfer_queue,
        }
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance.get_physical_device_format_properties(self.physical, format)
        }
    }

    pub fn is_device_extension_enabled(&self, ext: &CStr) -> bool {
        self.enabled_extensions.iter().any(|e| e.as_c_str() == ext)
    }

    /// Rounds `size` up to the device's minimum uniform buffer offset alignment
    pub fn aligned_uniform_size(&self, size: u64) -> u64 {
        aligned_uniform_size(size, self.properties.limits.min_uniform_buffer_offset_alignment)
    }

    /// Runs `func` inside a one-time command buffer on the given queue and waits for completion
    pub fn single_time_commands<F>(
        &self,
        role: QueueRole,
        func: F,
    ) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device) -> Result<()>,
    {
        match role {
            QueueRole::Graphics => self.graphics_transfer_context.immediate_submit(func),
            QueueRole::Transfer => self.transfer_context.immediate_submit(func),
        }
    }

    /// Queue family indices that resources shared between the graphics and transfer queues need
    pub fn shared_queue_families(&self) -> Vec<u32> {
        let mut families = vec![self.graphics_queue.family.index];
        if self.transfer_queue.family.index != self.graphics_queue.family.index {
            families.push(self.transfer_queue.family.index);
        }
        families
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.logical.device_wait_idle()?;
        }
        Ok(())
    }

    pub fn descriptor_device(&self) -> DescriptorAshDevice {
        DescriptorAshDevice::from(self.logical.clone())
    }

    fn enumerate_candidates(
        instance: &RenderInstance,
        surface: Option<vk::SurfaceKHR>,
    ) -> Result<Vec<PhysicalDeviceInfo>> {
        let physical_devices = unsafe {
            instance.instance.enumerate_physical_devices()?
        };

        physical_devices
            .into_iter()
            .map(|device| {
                let props = unsafe {
                    instance.instance.get_physical_device_properties(device)
                };
                let name = props
                    .device_name_as_c_str()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "<unnamed>".into());

                let extensions = unsafe {
                    instance.instance
                        .enumerate_device_extension_properties(device)
                        .unwrap_or_default()
                }
                    .iter()
                    .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CString::from))
                    .collect::<Vec<_>>();

                let queue_family_props = unsafe {
                    instance.instance.get_physical_device_queue_family_properties(device)
                };
                let queue_families = find_queue_families(&queue_family_props, |index| match surface {
                    Some(surface) => unsafe {
                        instance.surface_loader
                            .get_physical_device_surface_support(device, index, surface)
                            .unwrap_or(false)
                    },
                    None => true,
                });

                Ok(PhysicalDeviceInfo {
                    handle: device,
                    name,
                    device_type: props.device_type,
                    extensions,
                    queue_families,
                })
            })
            .collect()
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilySelection,
        enabled_extensions: &[CString],
    ) -> Result<(ash::Device, Queue, Queue)> {
        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_families.graphics.index)
                .queue_priorities(&queue_priorities),
        ];
        if queue_families.transfer.index != queue_families.graphics.index {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(queue_families.transfer.index)
                    .queue_priorities(&queue_priorities),
            );
        }

        let device = {
            let enabled_extension_names = enabled_extensions
                .iter()
                .map(|ext| ext.as_ptr())
                .collect::<Vec<*const c_char>>();
            // Every supported core feature gets enabled
            let enabled_features = unsafe {
                instance.get_physical_device_features(physical_device)
            };

            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&enabled_extension_names)
                .enabled_features(&enabled_features);

            unsafe {
                instance.create_device(physical_device, &device_create_info, None)?
            }
        };

        let graphics_queue = unsafe {
            let queue = device.get_device_queue(queue_families.graphics.index, 0);
            Queue::new(queue_families.graphics.clone(), queue)
        };
        let transfer_queue = unsafe {
            let queue = device.get_device_queue(queue_families.transfer.index, 0);
            Queue::new(queue_families.transfer.clone(), queue)
        };

        Ok((device, graphics_queue, transfer_queue))
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.logical.device_wait_idle() {
                log::error!("Failed to wait for device idle before destruction: {}", e);
            }

            ManuallyDrop::drop(&mut self.transfer_context);
            ManuallyDrop::drop(&mut self.graphics_transfer_context);

            match self.descriptor_allocator.lock() {
                Ok(mut allocator) => allocator.cleanup(&self.descriptor_device()),
                Err(e) => log::error!("Descriptor allocator poisoned: {}", e),
            }

            let allocator = ManuallyDrop::take(&mut self.memory_allocator);
            if Arc::strong_count(&allocator) > 1 {
                log::error!("Device memory allocator still referenced at device destruction");
            }
            drop(allocator);

            self.logical.destroy_device(None);
        }
    }
}

pub struct DescriptorAshDevice(pub Arc<ash::Device>);

impl From<Arc<ash::Device>> for DescriptorAshDevice {
    fn from(device: Arc<ash::Device>) -> Self {
        Self(device)
    }
}

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
for DescriptorAshDevice
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let counts = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
            (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, descriptor_count.acceleration_structure),
        ];
        let pool_sizes = counts
            .iter()
            .filter(|(_, count)| *count != 0)
            .map(|(ty, count)| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: *count,
            })
            .collect::<smallvec::SmallVec<[_; 12]>>();

        if descriptor_count.inline_uniform_block_bytes != 0
            || descriptor_count.inline_uniform_block_bindings != 0
        {
            log::error!("Inline uniform blocks are not supported");
            return Err(CreatePoolError::OutOfHostMemory);
        }

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();

        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }

        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(ash_flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("Unexpected descriptor pool creation result '{}'", err);
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.0.destroy_descriptor_pool(pool, None)
        }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();

        unsafe {
            match self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            ) {
                Ok(allocated) => {
                    sets.extend(allocated);
                    Ok(())
                }
                Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
                    Err(DeviceAllocationError::OutOfDeviceMemory)
                }
                Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
                Err(err) => {
                    log::error!("Unexpected descriptor set allocation result '{}'", err);
                    Err(DeviceAllocationError::OutOfHostMemory)
                }
            }
        }
    }

    unsafe fn dealloc_descriptor_sets(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        unsafe {
            if let Err(err) = self.0.free_descriptor_sets(*pool, &sets) {
                log::error!("Failed to free descriptor sets: {}", err);
            }
        }
    }
}

/// Turns a poisoned allocator lock into an error
pub fn lock_allocator(allocator: &Mutex<Allocator>) -> Result<std::sync::MutexGuard<'_, Allocator>> {
    allocator.lock().map_err(|e| eyre!(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::device_ctx::queue::QueueFamily;

    fn candidate(name: &str, extensions: &[&CStr], usable_queues: bool) -> PhysicalDeviceInfo {
        let family = QueueFamily::new(0, vk::QueueFamilyProperties::default(), true);
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            name: name.into(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            extensions: extensions.iter().map(|e| CString::from(*e)).collect(),
            queue_families: usable_queues.then(|| QueueFamilySelection {
                graphics: family.clone(),
                transfer: family,
            }),
        }
    }

    fn no_adjustment(_: &mut i32, _: &PhysicalDeviceInfo) {}

    #[test]
    fn optional_extensions_add_to_score() {
        let swapchain = ash::khr::swapchain::NAME;
        let optional = [ash::khr::maintenance3::NAME, ash::ext::descriptor_indexing::NAME];
        let info = candidate("gpu", &[swapchain, ash::khr::maintenance3::NAME], true);
        assert_eq!(score_candidate(&info, &[swapchain], &optional, &no_adjustment), Some(2));
    }

    #[test]
    fn missing_requirements_reject_device() {
        let swapchain = ash::khr::swapchain::NAME;
        let no_swapchain = candidate("a", &[], true);
        let no_queues = candidate("b", &[swapchain], false);
        assert_eq!(score_candidate(&no_swapchain, &[swapchain], &[], &no_adjustment), None);
        assert_eq!(score_candidate(&no_queues, &[swapchain], &[], &no_adjustment), None);
    }

    #[test]
    fn scorer_callback_adjusts_score() {
        let info = candidate("integrated", &[], true);
        let penalize = |score: &mut i32, info: &PhysicalDeviceInfo| {
            if info.name == "integrated" {
                *score -= 5;
            }
        };
        assert_eq!(score_candidate(&info, &[], &[], &penalize), Some(-4));
    }

    #[test]
    fn highest_score_wins_and_ties_keep_first() {
        assert_eq!(select_best(&[Some(1), Some(3), None, Some(3)]), Some(1));
        assert_eq!(select_best(&[None, None]), None);
        assert_eq!(select_best(&[Some(-2), Some(2)]), Some(1));
    }

    #[test]
    fn scorer_can_veto_every_device() {
        let devices = [candidate("discrete", &[], true), candidate("integrated", &[], true)];
        let veto = |score: &mut i32, _: &PhysicalDeviceInfo| *score = 0;
        let scores = devices
            .iter()
            .map(|info| score_candidate(info, &[], &[], &veto))
            .collect::<Vec<_>>();
        assert_eq!(scores, vec![Some(0), Some(0)]);
        assert_eq!(select_best(&scores), None);
        assert_eq!(select_best(&[Some(0), Some(-3)]), None);
    }

    #[test]
    fn uniform_size_rounds_up_to_alignment() {
        assert_eq!(aligned_uniform_size(100, 256), 256);
        assert_eq!(aligned_uniform_size(256, 256), 256);
        assert_eq!(aligned_uniform_size(257, 64), 320);
        assert_eq!(aligned_uniform_size(12, 0), 12);
    }
}
