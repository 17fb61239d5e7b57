use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use color_eyre::eyre::{eyre, Result};
use glam::Vec3;
use crate::renderer::camera::Camera;
use crate::renderer::RenderHandle;

const TICK: Duration = Duration::from_millis(10);
const ORBIT_CENTER: Vec3 = Vec3::new(0.0, 4.0, 0.0);
const ORBIT_RADIUS: f32 = 10.0;

/// Camera position on its orbit around the scene `secs` after start
pub fn orbit_position(secs: f32) -> Vec3 {
    let angle = secs * 0.5;
    ORBIT_CENTER + Vec3::new(angle.cos() * ORBIT_RADIUS, angle.sin() * ORBIT_RADIUS, 3.0)
}

/// Moves the camera on its own thread. It never touches GPU handles,
/// only the camera, and only while no frame is being rendered.
pub struct GameThread {
    running: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl GameThread {
    pub fn spawn(render: RenderHandle, camera: Arc<Mutex<Camera>>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let join_handle = thread::spawn(move || {
            let start = Instant::now();
            while thread_running.load(Ordering::Acquire) {
                if let Err(e) = tick(&render, &camera, start.elapsed().as_secs_f32()) {
                    log::error!("Game thread stopped: {}", e);
                    break;
                }
                thread::sleep(TICK);
            }
        });

        Self {
            running,
            join_handle: Some(join_handle),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::error!("Game thread panicked");
            }
        }
    }
}

impl Drop for GameThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(render: &RenderHandle, camera: &Mutex<Camera>, secs: f32) -> Result<()> {
    render.with_render_lock(|| {
        let mut camera = camera.lock().map_err(|e| eyre!(e.to_string()))?;
        camera.world_position = orbit_position(secs);
        camera.look_at(ORBIT_CENTER);
        Ok(())
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::contexts::frame_ctx::orchestrator::FrameOrchestrator;

    #[test]
    fn orbit_keeps_its_radius() {
        for secs in [0.0, 1.3, 7.9] {
            let offset = orbit_position(secs) - ORBIT_CENTER;
            assert!((offset.truncate().length() - ORBIT_RADIUS).abs() < 1e-4);
            assert_eq!(offset.z, 3.0);
        }
    }

    #[test]
    fn tick_points_camera_at_scene() {
        let orchestrator = FrameOrchestrator::new(1);
        let camera = Mutex::new(Camera::new());
        tick(&orchestrator.handle(), &camera, 2.0).unwrap();
        let camera = camera.lock().unwrap();
        assert_eq!(camera.world_position, orbit_position(2.0));
        let expected = (ORBIT_CENTER - orbit_position(2.0)).normalize();
        assert!(camera.look_direction.abs_diff_eq(expected, 1e-5));
    }
}
