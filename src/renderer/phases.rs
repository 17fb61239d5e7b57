use std::path::Path;
use ash::vk;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::device::{PhysicalDeviceInfo, RenderDevice};
use crate::renderer::contexts::device_ctx::swapchain::Swapchain;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;

/// What a phase callback can reach while graphics are loaded to the device
pub struct GraphicsContext<'a> {
    pub device: &'a RenderDevice,
    pub swapchain: &'a Swapchain,
    pub resources: &'a mut RenderResourceContext,
}

/// The scene side of a renderer. The renderer calls these at fixed points of its lifecycle:
///
/// - once at construction: `init`, `init_layouts`, `configure_shaders`
/// - on every (re)load: `read_shaders` before the device exists, `score_physical_device` while picking it
/// - on every graphics load: `create_resources`, `allocate_buffers`, `create_pipelines`,
///   then `record_graphics_command_buffer` once per swapchain image
/// - every frame: `frame_update`, then `run_dynamic_graphics`
/// - on every graphics unload, after the device went idle: `destroy_pipelines`, `free_buffers`,
///   `destroy_resources`
///
/// Destroy callbacks may run after a partial load and must skip what was never created.
pub trait RenderPhases {
    fn init(&mut self, _config: &mut RenderConfig) -> Result<()> {
        Ok(())
    }

    /// Adjusts the score of a candidate that already passed the required checks
    fn score_physical_device(&self, _score: &mut i32, _info: &PhysicalDeviceInfo) {}

    /// Declares the resources and descriptor sets the pipelines bind
    fn init_layouts(&mut self, resources: &mut RenderResourceContext) -> Result<()>;

    fn configure_shaders(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_shaders(&mut self, shader_dir: &Path) -> Result<()>;

    fn create_resources(&mut self, ctx: &mut GraphicsContext) -> Result<()>;
    fn destroy_resources(&mut self, ctx: &mut GraphicsContext);

    fn allocate_buffers(&mut self, ctx: &mut GraphicsContext) -> Result<()>;
    fn free_buffers(&mut self, ctx: &mut GraphicsContext);

    fn create_pipelines(&mut self, ctx: &mut GraphicsContext) -> Result<()>;
    fn destroy_pipelines(&mut self, ctx: &mut GraphicsContext);

    /// Records the static command buffer of `image_index`, replayed every frame until the next unload
    fn record_graphics_command_buffer(
        &self,
        ctx: &GraphicsContext,
        cmd: vk::CommandBuffer,
        image_index: usize,
    ) -> Result<()>;

    /// Records the dynamic command buffer of this frame
    fn run_dynamic_graphics(
        &mut self,
        ctx: &mut GraphicsContext,
        cmd: vk::CommandBuffer,
        image_index: usize,
    ) -> Result<()>;

    /// CPU side scene update, no GPU calls
    fn frame_update(&mut self, _image_index: usize) -> Result<()> {
        Ok(())
    }

    fn load_scene(&mut self) -> Result<()> {
        Ok(())
    }

    fn unload_scene(&mut self) {}
}
