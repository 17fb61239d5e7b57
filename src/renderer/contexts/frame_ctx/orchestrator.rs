use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::eyre::{eyre, Result};
use crate::renderer::contexts::frame_ctx::MAX_FRAMES_IN_FLIGHT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    /// The surface changed, the swapchain must be recreated
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Ok,
    DeviceLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Done,
    Suboptimal,
    OutOfDate,
}

pub fn classify_acquire(result: VkResult<(u32, bool)>) -> Result<Acquired> {
    match result {
        Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
            Err(eyre!("Timed out acquiring a swapchain image"))
        }
        Err(e) => Err(eyre!("Failed to acquire swapchain image: {}", e)),
    }
}

pub fn classify_submit(result: VkResult<()>) -> Result<Submitted> {
    match result {
        Ok(()) => Ok(Submitted::Ok),
        Err(vk::Result::ERROR_DEVICE_LOST) => Ok(Submitted::DeviceLost),
        Err(e) => Err(eyre!("Failed to submit graphics command buffers: {}", e)),
    }
}

pub fn classify_present(result: VkResult<bool>) -> Result<Presented> {
    match result {
        Ok(false) => Ok(Presented::Done),
        Ok(true) => Ok(Presented::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::OutOfDate),
        Err(e) => Err(eyre!("Failed to present swapchain image: {}", e)),
    }
}

/// GPU side of the frame protocol. The orchestrator decides what runs when,
/// the backend owns every handle.
pub trait FrameBackend {
    fn create_devices(&mut self) -> Result<()>;
    fn destroy_devices(&mut self);
    fn create_sync_objects(&mut self) -> Result<()>;
    fn destroy_sync_objects(&mut self);
    /// `false` when the surface has zero area and nothing was created
    fn create_swapchain(&mut self) -> Result<bool>;
    fn destroy_swapchain(&mut self);
    fn read_shaders(&mut self) -> Result<()>;
    fn load_graphics(&mut self) -> Result<()>;
    /// Waits for the device to go idle before destroying anything
    fn unload_graphics(&mut self) -> Result<()>;

    fn acquire_next_image(&mut self, slot: usize, timeout_ns: u64) -> Result<Acquired>;
    fn frame_update(&mut self, image_index: u32) -> Result<()>;
    fn wait_for_slot(&mut self, slot: usize, timeout_ns: u64) -> Result<()>;
    fn record_dynamic(&mut self, image_index: u32) -> Result<()>;
    /// Resets the slot fence and submits the dynamic and static buffers in one call
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<Submitted>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented>;
}

/// State shared with other threads through [`RenderHandle`]
pub struct FrameShared {
    rendering: Mutex<()>,
    low_priority: Mutex<()>,
    must_reload: AtomicBool,
    resize_requested: AtomicBool,
    render_thread: Mutex<ThreadId>,
}

fn lock(mutex: &Mutex<()>) -> Result<MutexGuard<'_, ()>> {
    mutex.lock().map_err(|e| eyre!(e.to_string()))
}

/// Cloneable access to the renderer from threads that must not touch GPU handles
#[derive(Clone)]
pub struct RenderHandle {
    shared: Arc<FrameShared>,
}

impl RenderHandle {
    /// The render thread performs the reload on its next frame
    pub fn request_reload(&self) {
        self.shared.must_reload.store(true, Ordering::Release);
    }

    pub fn request_resize(&self) {
        self.shared.resize_requested.store(true, Ordering::Release);
    }

    pub fn reload_requested(&self) -> bool {
        self.shared.must_reload.load(Ordering::Acquire)
    }

    /// Runs `f` while no frame is being rendered
    pub fn with_render_lock<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let _rendering = lock(&self.shared.rendering)?;
        Ok(f())
    }

    /// Runs `f` while no swapchain or device rebuild is in progress.
    /// `f` must not take the render lock.
    pub fn with_low_priority_lock<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let _low_priority = lock(&self.shared.low_priority)?;
        Ok(f())
    }
}

/// Drives the frame protocol: acquire, update, record, submit, present, advance.
/// Also sequences the structural load, unload, swapchain recreation and reload.
pub struct FrameOrchestrator {
    shared: Arc<FrameShared>,
    timeout_ns: u64,
    slot: usize,
    graphics_loaded: bool,
}

impl FrameOrchestrator {
    pub fn new(timeout_ns: u64) -> Self {
        Self {
            shared: Arc::new(FrameShared {
                rendering: Mutex::new(()),
                low_priority: Mutex::new(()),
                must_reload: AtomicBool::new(false),
                resize_requested: AtomicBool::new(false),
                render_thread: Mutex::new(thread::current().id()),
            }),
            timeout_ns,
            slot: 0,
            graphics_loaded: false,
        }
    }

    pub fn handle(&self) -> RenderHandle {
        RenderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn current_slot(&self) -> usize {
        self.slot
    }

    pub fn is_graphics_loaded(&self) -> bool {
        self.graphics_loaded
    }

    pub fn load_renderer(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        let shared = self.shared.clone();
        let _rendering = lock(&shared.rendering)?;
        let _low_priority = lock(&shared.low_priority)?;

        backend.create_devices()?;
        backend.create_sync_objects()?;
        if backend.create_swapchain()? {
            self.load_graphics_locked(backend)?;
        }
        Ok(())
    }

    pub fn unload_renderer(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        let shared = self.shared.clone();
        let _rendering = lock(&shared.rendering)?;
        let _low_priority = lock(&shared.low_priority)?;

        if self.graphics_loaded {
            self.unload_graphics_locked(backend)?;
        }
        backend.destroy_swapchain();
        backend.destroy_sync_objects();
        backend.destroy_devices();
        Ok(())
    }

    pub fn recreate_swapchains(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        let shared = self.shared.clone();
        let _rendering = lock(&shared.rendering)?;
        let _low_priority = lock(&shared.low_priority)?;
        self.recreate_swapchains_locked(backend)
    }

    /// Called off the render thread this only raises the reload flag
    pub fn reload_renderer(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        let shared = self.shared.clone();
        if *shared.render_thread.lock().map_err(|e| eyre!(e.to_string()))? != thread::current().id() {
            shared.must_reload.store(true, Ordering::Release);
            return Ok(());
        }
        let _rendering = lock(&shared.rendering)?;
        let _low_priority = lock(&shared.low_priority)?;
        self.reload_locked(backend)
    }

    /// Renders one frame, or performs the pending load, reload or swapchain recreation instead
    pub fn render(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        let shared = self.shared.clone();
        let _rendering = lock(&shared.rendering)?;
        *shared.render_thread.lock().map_err(|e| eyre!(e.to_string()))? = thread::current().id();

        if !self.graphics_loaded {
            shared.resize_requested.store(false, Ordering::Release);
            let _low_priority = lock(&shared.low_priority)?;
            return self.recreate_swapchains_locked(backend);
        }

        if shared.must_reload.load(Ordering::Acquire) {
            let _low_priority = lock(&shared.low_priority)?;
            return self.reload_locked(backend);
        }

        if shared.resize_requested.swap(false, Ordering::AcqRel) {
            let _low_priority = lock(&shared.low_priority)?;
            return self.recreate_swapchains_locked(backend);
        }

        let image_index = match backend.acquire_next_image(self.slot, self.timeout_ns)? {
            Acquired::Image { index, suboptimal } => {
                if suboptimal {
                    log::warn!("Swapchain is suboptimal");
                }
                index
            }
            Acquired::OutOfDate => {
                let _low_priority = lock(&shared.low_priority)?;
                return self.recreate_swapchains_locked(backend);
            }
        };

        backend.frame_update(image_index)?;

        backend.wait_for_slot(self.slot, self.timeout_ns)?;
        backend.record_dynamic(image_index)?;

        if backend.submit(self.slot, image_index)? == Submitted::DeviceLost {
            log::warn!("Device lost while submitting graphics commands, reloading renderer");
            let _low_priority = lock(&shared.low_priority)?;
            return self.reload_locked(backend);
        }

        match backend.present(self.slot, image_index)? {
            Presented::Done => {}
            Presented::Suboptimal => log::warn!("Swapchain is suboptimal"),
            Presented::OutOfDate => {
                let _low_priority = lock(&shared.low_priority)?;
                return self.recreate_swapchains_locked(backend);
            }
        }

        self.slot = (self.slot + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(())
    }

    fn load_graphics_locked(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        if let Err(e) = backend.load_graphics() {
            if let Err(unload_error) = backend.unload_graphics() {
                log::error!("Failed to unload partly loaded graphics: {}", unload_error);
            }
            return Err(e);
        }
        self.graphics_loaded = true;
        Ok(())
    }

    fn unload_graphics_locked(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        self.graphics_loaded = false;
        backend.unload_graphics()
    }

    fn recreate_swapchains_locked(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        if self.graphics_loaded {
            self.unload_graphics_locked(backend)?;
        }
        if backend.create_swapchain()? {
            self.load_graphics_locked(backend)?;
        }
        Ok(())
    }

    fn reload_locked(&mut self, backend: &mut impl FrameBackend) -> Result<()> {
        self.shared.must_reload.store(false, Ordering::Release);
        log::info!("Reloading renderer");

        if self.graphics_loaded {
            self.unload_graphics_locked(backend)?;
        }
        backend.destroy_swapchain();
        backend.destroy_sync_objects();
        backend.destroy_devices();

        backend.read_shaders()?;

        backend.create_devices()?;
        backend.create_sync_objects()?;
        self.slot = 0;
        if backend.create_swapchain()? {
            self.load_graphics_locked(backend)?;
        }

        log::info!("Renderer reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        CreateDevices,
        DestroyDevices,
        CreateSync,
        DestroySync,
        CreateSwapchain,
        DestroySwapchain,
        ReadShaders,
        LoadGraphics,
        UnloadGraphics,
        Acquire(usize),
        Update(u32),
        Wait(usize),
        Record(u32),
        Submit(usize, u32),
        Present(usize, u32),
    }

    /// Records the protocol and models the GPU as a list of unfinished submissions
    struct MockBackend {
        calls: Vec<Call>,
        surface_area: bool,
        image_count: u32,
        next_image: u32,
        acquire_out_of_date: bool,
        present_results: Vec<Presented>,
        submits: usize,
        lose_device_on_submit: Option<usize>,
        outstanding: Vec<usize>,
        max_outstanding: usize,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                surface_area: true,
                image_count: 3,
                next_image: 0,
                acquire_out_of_date: false,
                present_results: Vec::new(),
                submits: 0,
                lose_device_on_submit: None,
                outstanding: Vec::new(),
                max_outstanding: 0,
            }
        }

        fn take_calls(&mut self) -> Vec<Call> {
            std::mem::take(&mut self.calls)
        }

        fn count(&self, call: Call) -> usize {
            self.calls.iter().filter(|c| **c == call).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn create_devices(&mut self) -> Result<()> {
            self.calls.push(Call::CreateDevices);
            Ok(())
        }

        fn destroy_devices(&mut self) {
            self.calls.push(Call::DestroyDevices);
        }

        fn create_sync_objects(&mut self) -> Result<()> {
            self.calls.push(Call::CreateSync);
            Ok(())
        }

        fn destroy_sync_objects(&mut self) {
            self.calls.push(Call::DestroySync);
            self.outstanding.clear();
        }

        fn create_swapchain(&mut self) -> Result<bool> {
            self.calls.push(Call::CreateSwapchain);
            Ok(self.surface_area)
        }

        fn destroy_swapchain(&mut self) {
            self.calls.push(Call::DestroySwapchain);
        }

        fn read_shaders(&mut self) -> Result<()> {
            self.calls.push(Call::ReadShaders);
            Ok(())
        }

        fn load_graphics(&mut self) -> Result<()> {
            self.calls.push(Call::LoadGraphics);
            Ok(())
        }

        fn unload_graphics(&mut self) -> Result<()> {
            self.calls.push(Call::UnloadGraphics);
            // Device wait idle
            self.outstanding.clear();
            Ok(())
        }

        fn acquire_next_image(&mut self, slot: usize, _timeout_ns: u64) -> Result<Acquired> {
            self.calls.push(Call::Acquire(slot));
            if std::mem::take(&mut self.acquire_out_of_date) {
                return Ok(Acquired::OutOfDate);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(Acquired::Image { index, suboptimal: false })
        }

        fn frame_update(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::Update(image_index));
            Ok(())
        }

        fn wait_for_slot(&mut self, slot: usize, _timeout_ns: u64) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.outstanding.retain(|s| *s != slot);
            Ok(())
        }

        fn record_dynamic(&mut self, image_index: u32) -> Result<()> {
            self.calls.push(Call::Record(image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> Result<Submitted> {
            self.calls.push(Call::Submit(slot, image_index));
            self.submits += 1;
            if self.lose_device_on_submit == Some(self.submits) {
                return Ok(Submitted::DeviceLost);
            }
            assert!(!self.outstanding.contains(&slot), "slot {} reused before its fence signaled", slot);
            self.outstanding.push(slot);
            self.max_outstanding = self.max_outstanding.max(self.outstanding.len());
            Ok(Submitted::Ok)
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented> {
            self.calls.push(Call::Present(slot, image_index));
            if self.present_results.is_empty() {
                Ok(Presented::Done)
            } else {
                Ok(self.present_results.remove(0))
            }
        }
    }

    fn loaded() -> (FrameOrchestrator, MockBackend) {
        let mut orchestrator = FrameOrchestrator::new(30_000_000_000);
        let mut backend = MockBackend::new();
        orchestrator.load_renderer(&mut backend).unwrap();
        assert!(orchestrator.is_graphics_loaded());
        backend.take_calls();
        (orchestrator, backend)
    }

    #[test]
    fn steady_frame_follows_protocol_order() {
        let (mut orchestrator, mut backend) = loaded();
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(
            backend.take_calls(),
            vec![
                Call::Acquire(0),
                Call::Update(0),
                Call::Wait(0),
                Call::Record(0),
                Call::Submit(0, 0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(orchestrator.current_slot(), 1);

        orchestrator.render(&mut backend).unwrap();
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(orchestrator.current_slot(), 1);
        assert!(backend.calls.contains(&Call::Submit(1, 1)));
        assert!(backend.calls.contains(&Call::Submit(0, 2)));
    }

    #[test]
    fn frames_in_flight_stay_bounded() {
        let (mut orchestrator, mut backend) = loaded();
        for _ in 0..20 {
            orchestrator.render(&mut backend).unwrap();
        }
        assert_eq!(backend.submits, 20);
        assert!(backend.max_outstanding <= MAX_FRAMES_IN_FLIGHT);
        assert_eq!(backend.max_outstanding, MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn device_loss_reloads_then_renders_normally() {
        let (mut orchestrator, mut backend) = loaded();
        backend.lose_device_on_submit = Some(2);

        orchestrator.render(&mut backend).unwrap();
        assert_eq!(backend.count(Call::Present(0, 0)), 1);
        backend.take_calls();

        orchestrator.render(&mut backend).unwrap();
        let calls = backend.take_calls();
        assert_eq!(
            calls,
            vec![
                Call::Acquire(1),
                Call::Update(1),
                Call::Wait(1),
                Call::Record(1),
                Call::Submit(1, 1),
                Call::UnloadGraphics,
                Call::DestroySwapchain,
                Call::DestroySync,
                Call::DestroyDevices,
                Call::ReadShaders,
                Call::CreateDevices,
                Call::CreateSync,
                Call::CreateSwapchain,
                Call::LoadGraphics,
            ]
        );
        assert!(orchestrator.is_graphics_loaded());

        orchestrator.render(&mut backend).unwrap();
        let calls = backend.take_calls();
        assert_eq!(calls.first(), Some(&Call::Acquire(0)));
        assert!(calls.contains(&Call::Present(0, 2)));
        assert!(!calls.contains(&Call::UnloadGraphics));
    }

    #[test]
    fn zero_area_surface_leaves_renderer_unloaded() {
        let mut orchestrator = FrameOrchestrator::new(1);
        let mut backend = MockBackend::new();
        backend.surface_area = false;

        orchestrator.load_renderer(&mut backend).unwrap();
        assert!(!orchestrator.is_graphics_loaded());
        assert_eq!(backend.count(Call::LoadGraphics), 0);

        // Every tick retries the swapchain without rendering
        backend.take_calls();
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(backend.take_calls(), vec![Call::CreateSwapchain]);

        backend.surface_area = true;
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(backend.take_calls(), vec![Call::CreateSwapchain, Call::LoadGraphics]);
        assert!(orchestrator.is_graphics_loaded());
    }

    #[test]
    fn stale_surface_recreates_swapchain_without_advancing() {
        let (mut orchestrator, mut backend) = loaded();
        backend.acquire_out_of_date = true;

        orchestrator.render(&mut backend).unwrap();
        assert_eq!(
            backend.take_calls(),
            vec![Call::Acquire(0), Call::UnloadGraphics, Call::CreateSwapchain, Call::LoadGraphics]
        );
        assert_eq!(orchestrator.current_slot(), 0);

        backend.present_results = vec![Presented::OutOfDate];
        orchestrator.render(&mut backend).unwrap();
        let calls = backend.take_calls();
        assert_eq!(&calls[calls.len() - 3..], &[Call::UnloadGraphics, Call::CreateSwapchain, Call::LoadGraphics]);
        assert_eq!(orchestrator.current_slot(), 0);
    }

    #[test]
    fn suboptimal_present_still_advances() {
        let (mut orchestrator, mut backend) = loaded();
        backend.present_results = vec![Presented::Suboptimal];
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(orchestrator.current_slot(), 1);
        assert_eq!(backend.count(Call::UnloadGraphics), 0);
    }

    #[test]
    fn reload_from_another_thread_is_deferred() {
        let (mut orchestrator, mut backend) = loaded();
        orchestrator.render(&mut backend).unwrap();
        backend.take_calls();

        thread::scope(|scope| {
            scope.spawn(|| orchestrator.reload_renderer(&mut backend).unwrap());
        });
        assert!(backend.calls.is_empty());
        assert!(orchestrator.handle().reload_requested());

        orchestrator.render(&mut backend).unwrap();
        let calls = backend.take_calls();
        assert_eq!(calls.first(), Some(&Call::UnloadGraphics));
        assert!(calls.contains(&Call::ReadShaders));
        assert!(!calls.iter().any(|c| matches!(c, Call::Acquire(_))));
        assert!(!orchestrator.handle().reload_requested());
    }

    #[test]
    fn reload_on_render_thread_runs_at_once() {
        let (mut orchestrator, mut backend) = loaded();
        orchestrator.reload_renderer(&mut backend).unwrap();
        assert_eq!(backend.count(Call::ReadShaders), 1);
        assert_eq!(backend.count(Call::LoadGraphics), 1);
    }

    #[test]
    fn handle_requests_are_served_by_next_frame() {
        let (mut orchestrator, mut backend) = loaded();
        let handle = orchestrator.handle();

        handle.request_resize();
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(
            backend.take_calls(),
            vec![Call::UnloadGraphics, Call::CreateSwapchain, Call::LoadGraphics]
        );

        let other = handle.clone();
        thread::spawn(move || other.request_reload()).join().unwrap();
        orchestrator.render(&mut backend).unwrap();
        assert_eq!(backend.count(Call::DestroyDevices), 1);
        assert_eq!(handle.with_render_lock(|| 7).unwrap(), 7);
    }

    #[test]
    fn unload_tears_down_in_reverse() {
        let (mut orchestrator, mut backend) = loaded();
        orchestrator.unload_renderer(&mut backend).unwrap();
        assert_eq!(
            backend.take_calls(),
            vec![Call::UnloadGraphics, Call::DestroySwapchain, Call::DestroySync, Call::DestroyDevices]
        );
        assert!(!orchestrator.is_graphics_loaded());
    }

    #[test]
    fn native_results_are_classified() {
        assert_eq!(classify_acquire(Ok((2, true))).unwrap(), Acquired::Image { index: 2, suboptimal: true });
        assert_eq!(classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(), Acquired::OutOfDate);
        assert!(classify_acquire(Err(vk::Result::TIMEOUT)).is_err());
        assert!(classify_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());

        assert_eq!(classify_submit(Ok(())).unwrap(), Submitted::Ok);
        assert_eq!(classify_submit(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap(), Submitted::DeviceLost);
        assert!(classify_submit(Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)).is_err());

        assert_eq!(classify_present(Ok(false)).unwrap(), Presented::Done);
        assert_eq!(classify_present(Ok(true)).unwrap(), Presented::Suboptimal);
        assert_eq!(classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(), Presented::OutOfDate);
        assert!(classify_present(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }
}
