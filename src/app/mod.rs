mod game;
pub mod scene;

use std::sync::{Arc, Mutex};
use color_eyre::eyre::Report;
use color_eyre::Result;
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use crate::app::game::GameThread;
use crate::app::scene::DeferredScene;
use crate::renderer::camera::Camera;
use crate::renderer::config::RenderConfig;
use crate::renderer::Renderer;

/// Window and event loop around the deferred renderer.
/// The event loop thread renders, a game thread moves the camera.
pub struct App {
    config: RenderConfig,
    camera: Arc<Mutex<Camera>>,
    renderer: Option<Renderer<DeferredScene>>,
    game_thread: Option<GameThread>,

    // First fatal error, returned from `run`
    error: Option<Report>,
}

impl App {
    pub fn new() -> Result<Self> {
        let config = RenderConfig {
            application_name: "Simple Deferred Renderer".into(),
            ..Default::default()
        };

        Ok(Self {
            config,
            camera: Arc::new(Mutex::new(Camera::new())),
            renderer: None,
            game_thread: None,
            error: None,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);
        event_loop.run_app(self)?;

        let shutdown = self.shutdown();
        match self.error.take() {
            Some(e) => Err(e),
            None => shutdown,
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(event_loop.create_window(
            Window::default_attributes().with_title(self.config.application_name.as_str()),
        )?);

        let scene = DeferredScene::new(self.camera.clone());
        let mut renderer = Renderer::new(self.config.clone(), window, scene)?;
        renderer.read_shaders()?;
        renderer.load_scene()?;
        renderer.load_renderer()?;

        self.game_thread = Some(GameThread::spawn(renderer.handle(), self.camera.clone()));
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Stops the game thread before the renderer goes away
    fn shutdown(&mut self) -> Result<()> {
        if let Some(mut game_thread) = self.game_thread.take() {
            game_thread.stop();
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.unload_renderer()?;
            renderer.unload_scene();
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: Report) {
        log::error!("{:#}", e);
        if self.error.is_none() {
            self.error = Some(e);
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent
    ) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        if window_id != renderer.window().id() {
            return;
        }

        let result = match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
                Ok(())
            }
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                renderer.request_resize();
                Ok(())
            }
            WindowEvent::RedrawRequested => renderer.render(),
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: key,
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
                ..
            } => match key.as_ref() {
                Key::Named(NamedKey::Escape) => {
                    event_loop.exit();
                    Ok(())
                }
                Key::Named(NamedKey::F5) => renderer.reload_renderer(),
                _ => Ok(()),
            },
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.as_ref() {
            renderer.window().request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Err(e) = self.shutdown() {
            log::error!("Failed to shut down renderer: {:#}", e);
        }
    }
}
