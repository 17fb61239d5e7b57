use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    MemoryLocation,
};
use crate::renderer::contexts::device_ctx::device::{lock_allocator, RenderDevice};
use crate::renderer::contexts::device_ctx::queue::QueueRole;
use crate::renderer::resources::buffer::Buffer;

/// Format features an image must support for every usage bit it declares
pub fn required_format_features(usage: vk::ImageUsageFlags) -> vk::FormatFeatureFlags {
    const MAPPING: [(vk::ImageUsageFlags, vk::FormatFeatureFlags); 6] = [
        (vk::ImageUsageFlags::COLOR_ATTACHMENT, vk::FormatFeatureFlags::COLOR_ATTACHMENT),
        (vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT),
        (vk::ImageUsageFlags::SAMPLED, vk::FormatFeatureFlags::SAMPLED_IMAGE),
        (vk::ImageUsageFlags::STORAGE, vk::FormatFeatureFlags::STORAGE_IMAGE),
        (vk::ImageUsageFlags::TRANSFER_DST, vk::FormatFeatureFlags::TRANSFER_DST),
        (vk::ImageUsageFlags::TRANSFER_SRC, vk::FormatFeatureFlags::TRANSFER_SRC),
    ];
    MAPPING
        .iter()
        .filter(|(bit, _)| usage.contains(*bit))
        .fold(vk::FormatFeatureFlags::empty(), |acc, (_, feature)| acc | *feature)
}

/// First candidate whose tiling features cover `features`
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties_of: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|format| {
            let props = properties_of(*format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                _ => false,
            }
        })
        .ok_or_else(|| eyre!("No format in {:?} supports {:?}", candidates, features))
}

/// Concurrent sharing is only needed when at least two distinct families access the image
pub fn needs_concurrent_sharing(families: &[u32]) -> bool {
    families.len() > 2 || (families.len() == 2 && families[0] != families[1])
}

/// Access masks for a layout transition barrier, by old and new layout
pub fn layout_transition_access(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags) {
    let mut src = match old_layout {
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    };
    let dst = match new_layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            if src.is_empty() {
                src = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE;
            }
            vk::AccessFlags::SHADER_READ
        }
        _ => vk::AccessFlags::empty(),
    };
    (src, dst)
}

pub fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    mip_levels: u32,
    layer_count: u32,
) {
    let aspect_mask = if new_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    };
    let (src_access_mask, dst_access_mask) = layout_transition_access(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count,
        })
        .src_access_mask(src_access_mask)
        .dst_access_mask(dst_access_mask);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Copies a tightly packed buffer into mip 0, layer 0 of an image in TRANSFER_DST_OPTIMAL layout
pub fn copy_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) {
    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D { width, height, depth: 1 });

    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

struct ImageMemory {
    image: vk::Image,
    view: vk::ImageView,
    sampler: vk::Sampler,
    allocation: Option<Allocation>,

    allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl Drop for ImageMemory {
    fn drop(&mut self) {
        unsafe {
            if self.sampler != vk::Sampler::null() {
                self.device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            match self.allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free image memory: {}", e);
                    }
                }
                Err(e) => log::error!("Memory allocator poisoned: {}", e),
            }
        }
        unsafe {
            self.device.destroy_image(self.image, None);
        }
    }
}

/// Device-local 2D image with a view, and a sampler when it is sampled.
/// The concrete format is picked from the preferred list on `create`.
pub struct Image {
    pub name: String,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub preferred_formats: Vec<vk::Format>,
    pub aspect: vk::ImageAspectFlags,
    pub flags: vk::ImageCreateFlags,
    pub view_type: vk::ImageViewType,

    pub width: u32,
    pub height: u32,
    pub format: vk::Format,

    queue_families: Vec<u32>,
    memory: Option<ImageMemory>,
}

impl Image {
    pub fn new(
        name: &str,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        array_layers: u32,
        preferred_formats: &[vk::Format],
    ) -> Self {
        Self {
            name: name.into(),
            usage,
            mip_levels,
            array_layers,
            preferred_formats: preferred_formats.to_vec(),
            aspect: vk::ImageAspectFlags::COLOR,
            flags: vk::ImageCreateFlags::empty(),
            view_type: vk::ImageViewType::TYPE_2D,

            width: 0,
            height: 0,
            format: vk::Format::R32G32B32A32_SFLOAT,

            queue_families: Vec::new(),
            memory: None,
        }
    }

    /// Single-sampled color attachment in RGBA32F
    pub fn color_attachment(name: &str, usage: vk::ImageUsageFlags) -> Self {
        Self::new(
            name,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | usage,
            1,
            1,
            &[vk::Format::R32G32B32A32_SFLOAT],
        )
    }

    pub fn depth_stencil(name: &str, usage: vk::ImageUsageFlags) -> Self {
        let mut image = Self::new(
            name,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | usage,
            1,
            1,
            &[vk::Format::D32_SFLOAT_S8_UINT],
        );
        image.aspect = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        image
    }

    pub fn depth(name: &str, usage: vk::ImageUsageFlags) -> Self {
        let mut image = Self::new(
            name,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | usage,
            1,
            1,
            &[vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT],
        );
        image.aspect = vk::ImageAspectFlags::DEPTH;
        image
    }

    pub fn cube_map(name: &str, usage: vk::ImageUsageFlags) -> Self {
        let mut image = Self::new(
            name,
            usage,
            1,
            6,
            &[vk::Format::R32G32B32A32_SFLOAT],
        );
        image.flags = vk::ImageCreateFlags::CUBE_COMPATIBLE;
        image.view_type = vk::ImageViewType::CUBE;
        image
    }

    pub fn set_access_queues(&mut self, families: &[u32]) {
        self.queue_families = families.to_vec();
    }

    pub fn handle(&self) -> vk::Image {
        self.memory.as_ref().map_or(vk::Image::null(), |memory| memory.image)
    }

    pub fn view(&self) -> vk::ImageView {
        self.memory.as_ref().map_or(vk::ImageView::null(), |memory| memory.view)
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.memory.as_ref().map_or(vk::Sampler::null(), |memory| memory.sampler)
    }

    pub fn is_created(&self) -> bool {
        self.memory.is_some()
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// Creates the image, its memory and view. `try_formats` overrides the preferred formats when not empty.
    pub fn create(
        &mut self,
        dev: &RenderDevice,
        width: u32,
        height: u32,
        try_formats: &[vk::Format],
    ) -> Result<()> {
        if self.memory.is_some() {
            return Err(eyre!("Image '{}' is already created", self.name));
        }

        let candidates = if try_formats.is_empty() {
            &self.preferred_formats
        } else {
            try_formats
        };
        let tiling = vk::ImageTiling::OPTIMAL;
        let format = find_supported_format(
            candidates,
            tiling,
            required_format_features(self.usage),
            |format| dev.format_properties(format),
        ).map_err(|e| eyre!("Image '{}': {}", self.name, e))?;

        let image = {
            let mut info = vk::ImageCreateInfo::default()
                .flags(self.flags)
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D { width, height, depth: 1 })
                .mip_levels(self.mip_levels)
                .array_layers(self.array_layers)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(tiling)
                .usage(self.usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            if needs_concurrent_sharing(&self.queue_families) {
                info = info
                    .sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&self.queue_families);
            }
            unsafe { dev.logical.create_image(&info, None)? }
        };

        let requirements = unsafe { dev.logical.get_image_memory_requirements(image) };
        let allocator = dev.memory_allocator();
        let allocation = lock_allocator(&allocator)?
            .allocate(&AllocationCreateDesc {
                name: &self.name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::DedicatedImage(image),
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe {
                    dev.logical.destroy_image(image, None);
                }
                return Err(e.into());
            }
        };

        let bind_result = unsafe {
            dev.logical.bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        // Anything created so far is released through Drop on failure below
        let memory = self.memory.insert(ImageMemory {
            image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: Some(allocation),
            allocator,
            device: dev.logical.clone(),
        });
        bind_result?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(self.view_type)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: self.mip_levels,
                base_array_layer: 0,
                layer_count: self.array_layers,
            });
        memory.view = unsafe { dev.logical.create_image_view(&view_info, None)? };

        if self.usage.contains(vk::ImageUsageFlags::SAMPLED) {
            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .mip_lod_bias(0.0)
                .anisotropy_enable(true)
                .max_anisotropy(1.0)
                .compare_enable(false)
                .compare_op(vk::CompareOp::NEVER)
                .min_lod(0.0)
                .max_lod(1.0)
                .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
                .unnormalized_coordinates(false);
            memory.sampler = unsafe { dev.logical.create_sampler(&sampler_info, None)? };
        }

        self.width = width;
        self.height = height;
        self.format = format;
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.memory = None;
    }

    pub fn transition_layout(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        transition_image_layout(
            device,
            cmd,
            self.handle(),
            old_layout,
            new_layout,
            self.mip_levels,
            self.array_layers,
        );
    }

    /// Layout transition recorded and waited on through a single-time graphics command buffer
    pub fn transition_layout_now(
        &self,
        dev: &RenderDevice,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        if !self.is_created() {
            return Err(eyre!("Image '{}' is not created", self.name));
        }
        dev.single_time_commands(QueueRole::Graphics, |cmd, device| {
            self.transition_layout(device, cmd, old_layout, new_layout);
            Ok(())
        })
    }

    /// Fills mip 0 from `buffer`; the image must already be in TRANSFER_DST_OPTIMAL
    pub fn copy_from_buffer_now(&self, dev: &RenderDevice, buffer: &Buffer) -> Result<()> {
        let image = self.memory
            .as_ref()
            .map(|memory| memory.image)
            .ok_or_eyre(format!("Image '{}' is not created", self.name))?;
        if !buffer.is_allocated() {
            return Err(eyre!("Buffer '{}' is not allocated", buffer.name));
        }
        dev.single_time_commands(QueueRole::Graphics, |cmd, device| {
            copy_buffer_to_image(device, cmd, buffer.handle(), image, self.width, self.height);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(optimal: vk::FormatFeatureFlags) -> vk::FormatProperties {
        vk::FormatProperties {
            optimal_tiling_features: optimal,
            ..Default::default()
        }
    }

    #[test]
    fn usage_maps_to_format_features() {
        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::INPUT_ATTACHMENT;
        assert_eq!(
            required_format_features(usage),
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE
        );
        assert_eq!(
            required_format_features(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        );
    }

    #[test]
    fn first_ranked_supported_format_wins() {
        let candidates = [
            vk::Format::R32G32B32A32_SFLOAT,
            vk::Format::R16G16B16A16_SFLOAT,
            vk::Format::R8G8B8A8_UNORM,
        ];
        let format = find_supported_format(
            &candidates,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::STORAGE_IMAGE,
            |format| match format {
                vk::Format::R32G32B32A32_SFLOAT => props(vk::FormatFeatureFlags::COLOR_ATTACHMENT),
                _ => props(vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::STORAGE_IMAGE),
            },
        ).unwrap();
        assert_eq!(format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn no_supported_format_is_an_error() {
        let result = find_supported_format(
            &[vk::Format::D32_SFLOAT_S8_UINT],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| props(vk::FormatFeatureFlags::SAMPLED_IMAGE),
        );
        assert!(result.is_err());
    }

    #[test]
    fn linear_tiling_checks_linear_features() {
        let result = find_supported_format(
            &[vk::Format::R8G8B8A8_UNORM],
            vk::ImageTiling::LINEAR,
            vk::FormatFeatureFlags::SAMPLED_IMAGE,
            |_| props(vk::FormatFeatureFlags::SAMPLED_IMAGE),
        );
        assert!(result.is_err());
    }

    #[test]
    fn sharing_is_concurrent_only_for_distinct_families() {
        assert!(!needs_concurrent_sharing(&[]));
        assert!(!needs_concurrent_sharing(&[0]));
        assert!(!needs_concurrent_sharing(&[1, 1]));
        assert!(needs_concurrent_sharing(&[0, 1]));
        assert!(needs_concurrent_sharing(&[0, 0, 0]));
    }

    #[test]
    fn shader_read_transition_from_undefined_waits_on_uploads() {
        let (src, dst) = layout_transition_access(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);

        let (src, dst) = layout_transition_access(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn attachment_transitions_pick_write_masks() {
        assert_eq!(
            layout_transition_access(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
            (vk::AccessFlags::empty(), vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        );
        assert_eq!(
            layout_transition_access(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
            (vk::AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::empty())
        );
    }

    #[test]
    fn variants_configure_aspect_and_layers() {
        let depth_stencil = Image::depth_stencil("ds", vk::ImageUsageFlags::INPUT_ATTACHMENT);
        assert_eq!(depth_stencil.aspect, vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);
        assert_eq!(depth_stencil.preferred_formats, vec![vk::Format::D32_SFLOAT_S8_UINT]);
        assert!(depth_stencil.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));

        let depth = Image::depth("d", vk::ImageUsageFlags::empty());
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
        assert_eq!(depth.preferred_formats.len(), 2);

        let cube = Image::cube_map("sky", vk::ImageUsageFlags::SAMPLED);
        assert_eq!(cube.array_layers, 6);
        assert_eq!(cube.view_type, vk::ImageViewType::CUBE);
        assert!(cube.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert_eq!(cube.view(), vk::ImageView::null());
    }
}
