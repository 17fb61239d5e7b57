pub mod camera;
pub mod config;
pub mod contexts;
pub mod phases;
pub mod resources;
pub mod session;
pub mod shader_data;

use std::sync::Arc;
use color_eyre::Result;
use winit::window::Window;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::frame_ctx::orchestrator::FrameOrchestrator;
use crate::renderer::contexts::resource_ctx::descriptor_set::DescriptorSetHandle;
use crate::renderer::phases::RenderPhases;
use crate::renderer::session::RenderSession;

pub use crate::renderer::contexts::frame_ctx::orchestrator::RenderHandle;

/// Deferred renderer driving the phases `P` through the frame protocol.
///
/// Lifecycle: `new`, `read_shaders`, `load_scene`, `load_renderer`, then `render` every tick,
/// and `unload_renderer`, `unload_scene` at the end.
pub struct Renderer<P: RenderPhases> {
    orchestrator: FrameOrchestrator,
    session: RenderSession<P>,
}

impl<P: RenderPhases> Renderer<P> {
    pub fn new(
        config: RenderConfig,
        window: Arc<Window>,
        phases: P,
    ) -> Result<Self> {
        let orchestrator = FrameOrchestrator::new(config.frame_timeout_ns());
        let session = RenderSession::new(config, window, phases)?;
        Ok(Self {
            orchestrator,
            session,
        })
    }

    pub fn handle(&self) -> RenderHandle {
        self.orchestrator.handle()
    }

    pub fn phases(&self) -> &P {
        &self.session.phases
    }

    pub fn phases_mut(&mut self) -> &mut P {
        &mut self.session.phases
    }

    pub fn window(&self) -> &Arc<Window> {
        self.session.window()
    }

    pub fn read_shaders(&mut self) -> Result<()> {
        self.session.phases.read_shaders(&self.session.config.shader_dir)
    }

    pub fn load_scene(&mut self) -> Result<()> {
        self.session.phases.load_scene()
    }

    pub fn unload_scene(&mut self) {
        self.session.phases.unload_scene();
    }

    pub fn load_renderer(&mut self) -> Result<()> {
        self.orchestrator.load_renderer(&mut self.session)
    }

    pub fn unload_renderer(&mut self) -> Result<()> {
        self.orchestrator.unload_renderer(&mut self.session)
    }

    /// Deferred to the next `render` when called off the render thread
    pub fn reload_renderer(&mut self) -> Result<()> {
        self.orchestrator.reload_renderer(&mut self.session)
    }

    pub fn recreate_swapchains(&mut self) -> Result<()> {
        self.orchestrator.recreate_swapchains(&mut self.session)
    }

    /// The swapchain is rebuilt at the start of the next `render`
    pub fn request_resize(&self) {
        self.orchestrator.handle().request_resize();
    }

    pub fn render(&mut self) -> Result<()> {
        self.orchestrator.render(&mut self.session)
    }

    pub fn is_graphics_loaded(&self) -> bool {
        self.orchestrator.is_graphics_loaded()
    }

    pub fn update_descriptor_sets(&self, subset: &[DescriptorSetHandle]) -> Result<()> {
        self.session.update_descriptor_sets(subset)
    }
}

impl<P: RenderPhases> Drop for Renderer<P> {
    fn drop(&mut self) {
        if self.session.has_device() {
            if let Err(e) = self.unload_renderer() {
                log::error!("Failed to unload renderer on drop: {}", e);
            }
        }
    }
}
