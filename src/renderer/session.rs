use std::sync::Arc;
use ash::vk;
use color_eyre::eyre::{OptionExt, Result};
use winit::window::Window;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::RenderDeviceContext;
use crate::renderer::contexts::frame_ctx::commands::FrameCommands;
use crate::renderer::contexts::frame_ctx::orchestrator::{
    classify_acquire, classify_present, classify_submit, Acquired, FrameBackend, Presented, Submitted,
};
use crate::renderer::contexts::frame_ctx::sync::FrameSync;
use crate::renderer::contexts::resource_ctx::descriptor_set::DescriptorSetHandle;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::phases::{GraphicsContext, RenderPhases};

/// Vulkan side of a renderer: the device session, frame objects, declared resources
/// and the phase callbacks that fill them
pub struct RenderSession<P: RenderPhases> {
    pub phases: P,
    pub config: RenderConfig,

    commands: Option<FrameCommands>,
    sync: Option<FrameSync>,
    resources: RenderResourceContext,
    // Last so everything above is released before the device
    device_ctx: RenderDeviceContext,
}

impl<P: RenderPhases> RenderSession<P> {
    /// Runs `init`, creates the instance and surface, then declares layouts and configures shaders
    pub fn new(
        mut config: RenderConfig,
        window: Arc<Window>,
        mut phases: P,
    ) -> Result<Self> {
        phases.init(&mut config)?;
        let device_ctx = RenderDeviceContext::new(&config, window)?;

        let mut resources = RenderResourceContext::new();
        phases.init_layouts(&mut resources)?;
        phases.configure_shaders()?;

        Ok(Self {
            phases,
            config,
            commands: None,
            sync: None,
            resources,
            device_ctx,
        })
    }

    pub fn has_device(&self) -> bool {
        self.device_ctx.device.is_some()
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.device_ctx.target.window
    }

    /// Rewrites only the given descriptor sets
    pub fn update_descriptor_sets(&self, subset: &[DescriptorSetHandle]) -> Result<()> {
        let device = self.device_ctx.device()?;
        self.resources.update_descriptor_set_subset(device, subset)
    }

    fn sync(&self) -> Result<&FrameSync> {
        self.sync
            .as_ref()
            .ok_or_eyre("Frame sync objects are not created")
    }

    fn commands(&self) -> Result<&FrameCommands> {
        self.commands
            .as_ref()
            .ok_or_eyre("Frame command buffers are not created")
    }
}

impl<P: RenderPhases> FrameBackend for RenderSession<P> {
    fn create_devices(&mut self) -> Result<()> {
        let phases = &self.phases;
        self.device_ctx.create_device(&self.config, &|score, info| {
            phases.score_physical_device(score, info)
        })
    }

    fn destroy_devices(&mut self) {
        self.device_ctx.destroy_device();
    }

    fn create_sync_objects(&mut self) -> Result<()> {
        let device = self.device_ctx.device()?;
        self.sync = Some(FrameSync::new(device.logical.clone())?);
        Ok(())
    }

    fn destroy_sync_objects(&mut self) {
        self.sync = None;
    }

    fn create_swapchain(&mut self) -> Result<bool> {
        self.device_ctx.create_swapchain(&self.config)
    }

    fn destroy_swapchain(&mut self) {
        self.device_ctx.destroy_swapchain();
    }

    fn read_shaders(&mut self) -> Result<()> {
        self.phases.read_shaders(&self.config.shader_dir)
    }

    fn load_graphics(&mut self) -> Result<()> {
        let device = self.device_ctx.device()?;
        let swapchain = self.device_ctx.swapchain()?;

        let commands = self.commands.insert(FrameCommands::new(device)?);

        let mut ctx = GraphicsContext {
            device,
            swapchain,
            resources: &mut self.resources,
        };
        self.phases.create_resources(&mut ctx)?;
        self.phases.allocate_buffers(&mut ctx)?;
        ctx.resources.create_descriptor_sets(device)?;
        self.phases.create_pipelines(&mut ctx)?;

        commands.allocate(swapchain.image_count())?;
        let phases = &self.phases;
        for image_index in 0..swapchain.image_count() {
            commands.record_static(image_index, |cmd| {
                phases.record_graphics_command_buffer(&ctx, cmd, image_index)
            })?;
        }

        log::debug!("Graphics loaded for {} swapchain images", swapchain.image_count());
        Ok(())
    }

    fn unload_graphics(&mut self) -> Result<()> {
        let device = self.device_ctx.device()?;
        // Fails after a device loss, when nothing is running anymore
        if let Err(e) = device.wait_idle() {
            log::warn!("Device wait idle failed before unloading graphics: {}", e);
        }

        if let Some(commands) = self.commands.as_mut() {
            commands.free();
        }

        let swapchain = self.device_ctx.swapchain()?;
        let mut ctx = GraphicsContext {
            device,
            swapchain,
            resources: &mut self.resources,
        };
        self.phases.destroy_pipelines(&mut ctx);
        let descriptor_sets = ctx.resources.destroy_descriptor_sets(device);
        self.phases.free_buffers(&mut ctx);
        self.phases.destroy_resources(&mut ctx);

        self.commands = None;
        descriptor_sets
    }

    fn acquire_next_image(&mut self, slot: usize, timeout_ns: u64) -> Result<Acquired> {
        let image_available = self.sync()?.slot(slot)?.image_available;
        let swapchain = self.device_ctx.swapchain()?;
        classify_acquire(swapchain.acquire_next_image(image_available, timeout_ns))
    }

    fn frame_update(&mut self, image_index: u32) -> Result<()> {
        self.phases.frame_update(image_index as usize)
    }

    fn wait_for_slot(&mut self, slot: usize, timeout_ns: u64) -> Result<()> {
        self.sync()?.wait(slot, timeout_ns)
    }

    fn record_dynamic(&mut self, image_index: u32) -> Result<()> {
        let device = self.device_ctx.device()?;
        let swapchain = self.device_ctx.swapchain()?;
        let commands = self.commands
            .as_ref()
            .ok_or_eyre("Frame command buffers are not created")?;

        let mut ctx = GraphicsContext {
            device,
            swapchain,
            resources: &mut self.resources,
        };
        let phases = &mut self.phases;
        let image_index = image_index as usize;
        commands.record_dynamic(image_index, |cmd| {
            phases.run_dynamic_graphics(&mut ctx, cmd, image_index)
        })
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<Submitted> {
        let device = self.device_ctx.device()?;
        let commands = self.commands()?;
        let sync = self.sync()?;
        let signals = *sync.slot(slot)?;

        let dynamic_buffers = [commands.dynamic_buffer(image_index as usize)?];
        let static_buffers = [commands.static_buffer(image_index as usize)?];
        let dynamic_signal = [signals.dynamic_render_finished];
        let static_wait = [signals.image_available];
        let static_wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let static_signal = [signals.render_finished];

        let submits = [
            vk::SubmitInfo::default()
                .command_buffers(&dynamic_buffers)
                .signal_semaphores(&dynamic_signal),
            vk::SubmitInfo::default()
                .wait_semaphores(&static_wait)
                .wait_dst_stage_mask(&static_wait_stages)
                .command_buffers(&static_buffers)
                .signal_semaphores(&static_signal),
        ];

        sync.reset(slot)?;
        classify_submit(unsafe {
            device.logical.queue_submit(device.graphics_queue.handle, &submits, signals.in_flight)
        })
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented> {
        let device = self.device_ctx.device()?;
        let swapchain = self.device_ctx.swapchain()?;
        let signals = self.sync()?.slot(slot)?;
        let waits = [signals.render_finished, signals.dynamic_render_finished];
        classify_present(swapchain.present(device.present_queue.handle, &waits, image_index))
    }
}
