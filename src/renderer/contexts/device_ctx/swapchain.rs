use std::sync::Arc;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::device_ctx::instance::RenderInstance;

pub struct SwapchainCreateInfo<'a> {
    pub surface: vk::SurfaceKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: &'a vk::SurfaceCapabilitiesKHR,
    pub extent: vk::Extent2D,
    pub old_swapchain: vk::SwapchainKHR,
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub loader: ash::khr::swapchain::Device,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,

    device: Arc<ash::Device>,
}

impl Swapchain {
    pub fn new(
        info: &SwapchainCreateInfo,
        ins: &RenderInstance,
        dev: &RenderDevice,
    ) -> Result<Self> {
        let capabilities = info.capabilities;
        let min_image_count = choose_image_count(capabilities);
        let pre_transform = if capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };
        let image_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_DST;

        let queue_family_indices = [
            dev.graphics_queue.family.index,
            dev.present_queue.family.index,
        ];
        let concurrent = queue_family_indices[0] != queue_family_indices[1];

        let loader = ash::khr::swapchain::Device::new(
            &ins.instance,
            &dev.logical,
        );
        let mut swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(info.surface)
            .min_image_count(min_image_count)
            .image_format(info.surface_format.format)
            .image_color_space(info.surface_format.color_space)
            .image_extent(info.extent)
            .image_usage(image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(info.present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(info.old_swapchain);
        if concurrent {
            swapchain_info = swapchain_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices);
        }

        let handle = unsafe {
            loader.create_swapchain(&swapchain_info, None)?
        };

        let (images, image_views) = match Self::create_swapchain_images(
            handle,
            &loader,
            info.surface_format.format,
            &dev.logical,
        ) {
            Ok(images) => images,
            Err(e) => {
                unsafe {
                    loader.destroy_swapchain(handle, None);
                }
                return Err(e);
            }
        };

        log::info!(
            "Swapchain created: {}x{}, {:?}/{:?}, {:?}, {} images",
            info.extent.width,
            info.extent.height,
            info.surface_format.format,
            info.surface_format.color_space,
            info.present_mode,
            images.len(),
        );

        Ok(Self {
            handle,
            loader,
            present_mode: info.present_mode,
            images,
            image_views,
            extent: info.extent,
            format: info.surface_format.format,
            color_space: info.surface_format.color_space,
            device: dev.logical.clone(),
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Viewport and scissor covering the whole swapchain
    pub fn viewport(&self) -> (vk::Viewport, vk::Rect2D) {
        full_viewport(self.extent)
    }

    pub fn acquire_next_image(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.loader.acquire_next_image(
                self.handle,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        image_index: u32,
    ) -> VkResult<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe {
            self.loader.queue_present(queue, &present_info)
        }
    }

    fn create_swapchain_images(
        swapchain: vk::SwapchainKHR,
        loader: &ash::khr::swapchain::Device,
        format: vk::Format,
        device: &ash::Device,
    ) -> Result<(Vec<vk::Image>, Vec<vk::ImageView>)> {
        let images = unsafe {
            loader.get_swapchain_images(swapchain)?
        };
        let mut image_views = Vec::with_capacity(images.len());
        for image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image(*image);
            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        unsafe {
                            device.destroy_image_view(view, None);
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        Ok((images, image_views))
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// First preferred format the surface supports, otherwise whatever the surface lists first
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    preferred
        .iter()
        .find(|pref| {
            available
                .iter()
                .any(|av| av.format == pref.format && av.color_space == pref.color_space)
        })
        .or_else(|| available.first())
        .copied()
}

/// First preferred mode the surface supports, otherwise FIFO which is always available
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    preferred
        .iter()
        .find(|mode| available.contains(mode))
        .copied()
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_size: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_size.0.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_size.1.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let min = capabilities.min_image_count;
    let max = capabilities.max_image_count;
    // Request one more than the minimum so acquiring doesn't wait on the driver
    if max > 0 && min + 1 > max {
        max
    } else {
        min + 1
    }
}
