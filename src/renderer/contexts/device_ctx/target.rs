use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use winit::window::Window;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::device_ctx::instance::RenderInstance;
use crate::renderer::contexts::device_ctx::swapchain::{
    choose_extent, choose_present_mode, choose_surface_format, Swapchain, SwapchainCreateInfo,
};

/// Presentation target of the renderer, encapsulating the window, surface, and swapchain
pub struct RenderTarget {
    pub window: Arc<Window>,

    pub surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,

    pub swapchain: Option<Swapchain>,
}

impl RenderTarget {
    pub fn new(
        window: Arc<Window>,
        ins: &RenderInstance,
    ) -> Result<Self> {
        let surface = ins.create_surface(&window)?;

        Ok(Self {
            window,
            surface,
            surface_loader: ins.surface_loader.clone(),
            swapchain: None,
        })
    }

    /// Creates the swapchain for the current window size, handing the previous one over.
    /// A zero-area surface creates nothing and returns `false`.
    pub fn create_swapchain(
        &mut self,
        ins: &RenderInstance,
        dev: &RenderDevice,
        config: &RenderConfig,
    ) -> Result<bool> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(dev.physical, self.surface)?
        };
        let window_size = self.window.inner_size();
        let extent = choose_extent(&capabilities, (window_size.width, window_size.height));

        if extent.width == 0 || extent.height == 0 {
            log::debug!("Surface has zero area, swapchain not created");
            self.swapchain = None;
            return Ok(false);
        }

        let surface_formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(dev.physical, self.surface)?
        };
        let surface_present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(dev.physical, self.surface)?
        };

        let surface_format = choose_surface_format(&surface_formats, &config.preferred_surface_formats)
            .ok_or_eyre("No suitable surface format found")?;
        let present_mode = choose_present_mode(&surface_present_modes, &config.preferred_present_modes);

        let old_swapchain = self.swapchain
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |swapchain| swapchain.handle);

        let swapchain = Swapchain::new(
            &SwapchainCreateInfo {
                surface: self.surface,
                surface_format,
                present_mode,
                capabilities: &capabilities,
                extent,
                old_swapchain,
            },
            ins,
            dev,
        )?;

        // The retired swapchain is destroyed here, after the new one took over
        self.swapchain = Some(swapchain);

        Ok(true)
    }

    pub fn destroy_swapchain(&mut self) {
        self.swapchain = None;
    }

    pub fn get_size(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if self.swapchain.is_some() {
            log::warn!("Render target dropped while its swapchain is alive");
        }
        self.swapchain = None;
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
