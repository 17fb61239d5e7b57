pub mod device;
pub mod instance;
pub mod queue;
pub mod swapchain;
pub mod target;
pub mod transfer_ctx;

use std::sync::Arc;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::device::{PhysicalDeviceInfo, RenderDevice};
use crate::renderer::contexts::device_ctx::instance::RenderInstance;
use crate::renderer::contexts::device_ctx::swapchain::Swapchain;
use crate::renderer::contexts::device_ctx::target::RenderTarget;

/// Responsibilities:
/// - Keep the Vulkan instance and the window surface alive for the whole session
/// - Create and destroy the logical device and queues on demand
/// - Create and destroy the swapchain, recreated on resize
pub struct RenderDeviceContext {
    // Declared before `instance` so the surface goes away first
    pub target: RenderTarget,
    pub device: Option<RenderDevice>,
    pub instance: RenderInstance,
}

impl RenderDeviceContext {
    pub fn new(
        config: &RenderConfig,
        window: Arc<winit::window::Window>,
    ) -> Result<Self> {
        let instance = RenderInstance::new(config, Some(&window))?;
        let target = RenderTarget::new(window, &instance)?;

        Ok(Self {
            target,
            device: None,
            instance,
        })
    }

    pub fn create_device(
        &mut self,
        config: &RenderConfig,
        scorer: &dyn Fn(&mut i32, &PhysicalDeviceInfo),
    ) -> Result<()> {
        let device = RenderDevice::new(&self.instance, Some(self.target.surface), config, scorer)?;
        self.device = Some(device);
        Ok(())
    }

    pub fn destroy_device(&mut self) {
        self.target.destroy_swapchain();
        self.device = None;
    }

    pub fn create_swapchain(&mut self, config: &RenderConfig) -> Result<bool> {
        let device = self.device
            .as_ref()
            .ok_or_eyre("Swapchain requested before the device exists")?;
        self.target.create_swapchain(&self.instance, device, config)
    }

    pub fn destroy_swapchain(&mut self) {
        self.target.destroy_swapchain();
    }

    pub fn device(&self) -> Result<&RenderDevice> {
        self.device
            .as_ref()
            .ok_or_eyre("Render device is not loaded")
    }

    pub fn swapchain(&self) -> Result<&Swapchain> {
        self.target.swapchain
            .as_ref()
            .ok_or_eyre("Swapchain is not created")
    }
}

impl Drop for RenderDeviceContext {
    fn drop(&mut self) {
        self.destroy_device();
    }
}
