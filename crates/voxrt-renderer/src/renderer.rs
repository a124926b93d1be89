//! Presentation loop: wait, acquire, record, submit, present.
//!
//! Surface changes are only discovered through acquire and present results.
//! Either one triggers a full swapchain recreation followed by a resize of the
//! output image. While the window has no area, frames are skipped and a pending
//! recreation is carried over to the first frame that can be drawn.

use std::time::{Duration, Instant};

use ash::vk;
use tracing::{debug, info, instrument};
use winit::window::Window;

use crate::camera::Camera;
use crate::config::RendererConfig;
use crate::error::Result;
use crate::frame::ACQUIRE_WAIT_STAGE;
use crate::scene::VoxelScene;
use crate::voxel::VoxelGrid;
use crate::vulkan::raytracing::ShaderBinaries;
use crate::vulkan::{
    AcquireOutcome, CommandManager, FramePacer, FrameSyncSet, MemoryManager, PresentOutcome,
    PresentSemaphores, Swapchain, VulkanContext, VulkanSurface,
};

/// Frames counted over one-second windows.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    frames: u32,
    window_start: Instant,
}

impl FpsCounter {
    pub const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
        }
    }

    /// Count a frame; returns the rate once a full window has elapsed.
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Self::WINDOW {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}

/// Ray traced voxel renderer bound to one window.
pub struct VoxelRenderer {
    scene: VoxelScene,
    present_semaphores: PresentSemaphores,
    sync: FrameSyncSet,
    commands: CommandManager,
    swapchain: Swapchain,
    surface: VulkanSurface,
    // Dropped after every object allocated from it and before the device
    memory: MemoryManager,
    ctx: VulkanContext,

    pacer: FramePacer,
    camera: Camera,
    window_size: (u32, u32),
    recreate_pending: bool,
    fps: FpsCounter,
}

impl VoxelRenderer {
    /// Set up the device, swapchain and scene for `window`.
    ///
    /// # Safety
    /// `window` must outlive the renderer.
    pub unsafe fn new(window: &Window, config: &RendererConfig) -> Result<Self> {
        let size = window.inner_size();
        let window_size = (size.width, size.height);

        let binaries = ShaderBinaries::load(&config.shader_dir)?;
        let (ctx, surface_handle) = VulkanContext::with_window(window, config.validation)?;

        let mut surface = match VulkanSurface::new(&ctx, surface_handle, config.vsync) {
            Ok(surface) => surface,
            Err(e) => {
                if let Ok(loader) = ctx.surface_loader() {
                    loader.destroy_surface(surface_handle, None);
                }
                return Err(e);
            }
        };

        let mut swapchain = match Swapchain::new(&ctx, &surface, window_size.0, window_size.1, None) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                surface.destroy(&ctx);
                return Err(e);
            }
        };

        let pacer = FramePacer::new(config.frames_in_flight);
        let presentation = Self::create_frame_state(&ctx, &swapchain, pacer.frames_in_flight(), &binaries);
        let (memory, commands, sync, present_semaphores, scene) = match presentation {
            Ok(state) => state,
            Err(e) => {
                swapchain.destroy(&ctx);
                surface.destroy(&ctx);
                return Err(e);
            }
        };

        info!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            frames_in_flight = pacer.frames_in_flight(),
            validation = ctx.validation_enabled(),
            "Renderer initialized"
        );

        Ok(Self {
            scene,
            present_semaphores,
            sync,
            commands,
            swapchain,
            surface,
            memory,
            ctx,
            pacer,
            camera: Camera::default(),
            window_size,
            recreate_pending: false,
            fps: FpsCounter::new(Instant::now()),
        })
    }

    unsafe fn create_frame_state(
        ctx: &VulkanContext,
        swapchain: &Swapchain,
        slots: usize,
        binaries: &ShaderBinaries,
    ) -> Result<(MemoryManager, CommandManager, FrameSyncSet, PresentSemaphores, VoxelScene)> {
        let memory = MemoryManager::new(ctx)?;
        let mut commands = CommandManager::new(ctx, slots)?;

        let mut sync = match FrameSyncSet::new(ctx, slots) {
            Ok(sync) => sync,
            Err(e) => {
                commands.destroy(ctx);
                return Err(e);
            }
        };

        let mut present_semaphores = match PresentSemaphores::new(ctx, swapchain.images.len()) {
            Ok(semaphores) => semaphores,
            Err(e) => {
                sync.destroy();
                commands.destroy(ctx);
                return Err(e);
            }
        };

        let scene = VoxelScene::build(
            ctx,
            &memory,
            &commands,
            &VoxelGrid::default(),
            binaries,
            swapchain.format,
            swapchain.extent,
            slots,
        );

        match scene {
            Ok(scene) => Ok((memory, commands, sync, present_semaphores, scene)),
            Err(e) => {
                present_semaphores.destroy();
                sync.destroy();
                commands.destroy(ctx);
                Err(e)
            }
        }
    }

    /// Record the window's new size; the swapchain follows on the next out-of-date report.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.window_size = (width, height);
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Frames submitted so far.
    pub fn frame_number(&self) -> u64 {
        self.pacer.frame_number()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Validation-layer errors reported so far, 0 without validation.
    pub fn validation_error_count(&self) -> usize {
        self.ctx.validation_error_count()
    }

    /// Render and present one frame, advancing the camera by `delta_time` seconds.
    pub fn render_frame(&mut self, delta_time: f32) -> Result<()> {
        let (width, height) = self.window_size;
        if width == 0 || height == 0 {
            return Ok(());
        }

        unsafe {
            if self.recreate_pending {
                self.recreate_swapchain()?;
                if self.recreate_pending {
                    return Ok(());
                }
            }

            let token = self.pacer.wait_for_slot(&self.sync)?;
            let slot = token.slot();
            let frame_sync = self.sync.get(slot);
            let (image_available, in_flight) = (frame_sync.image_available, frame_sync.in_flight);

            let (index, suboptimal) = match self.swapchain.acquire_next_image(&self.ctx, image_available)? {
                AcquireOutcome::Ready { index, suboptimal } => (index, suboptimal),
                AcquireOutcome::OutOfDate => {
                    // The fence was not reset, so the slot stays usable
                    return self.recreate_swapchain();
                }
            };

            let render_finished = self.present_semaphores.get(index)?;
            self.sync.reset(slot)?;

            let cmd = self.commands.begin_frame(&token)?;
            self.scene.draw_frame(
                &self.ctx,
                cmd,
                slot,
                self.swapchain.image(index),
                &mut self.camera,
                delta_time,
            )?;
            self.commands.end_frame(&token)?;

            self.commands.submit_frame(
                &self.ctx,
                &token,
                image_available,
                ACQUIRE_WAIT_STAGE,
                render_finished,
                in_flight,
            )?;
            self.pacer.advance(token);

            let presented = self.swapchain.present(&self.ctx, index, render_finished)?;
            if suboptimal || presented == PresentOutcome::NeedsRecreate {
                self.recreate_swapchain()?;
            }
        }

        if let Some(fps) = self.fps.tick(Instant::now()) {
            debug!(fps, frame = self.pacer.frame_number(), "Frame rate");
        }

        Ok(())
    }

    #[instrument(skip(self), fields(width = self.window_size.0, height = self.window_size.1))]
    unsafe fn recreate_swapchain(&mut self) -> Result<()> {
        let (width, height) = self.window_size;

        self.ctx.wait_idle()?;
        self.surface.refresh_capabilities(&self.ctx)?;

        let extent = self.surface.get_extent(width, height);
        if width == 0 || height == 0 || extent.width == 0 || extent.height == 0 {
            self.recreate_pending = true;
            return Ok(());
        }

        self.swapchain.recreate(&self.ctx, &self.surface, width, height)?;
        self.present_semaphores.recreate(self.swapchain.images.len())?;
        self.scene.handle_resize(
            &self.ctx,
            &self.memory,
            &self.commands,
            self.swapchain.format,
            self.swapchain.extent,
        )?;
        self.recreate_pending = false;

        info!(
            width = self.swapchain.extent.width,
            height = self.swapchain.extent.height,
            "Swapchain recreated"
        );
        Ok(())
    }
}

impl Drop for VoxelRenderer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.wait_idle_for_teardown();
            self.scene.destroy(&self.ctx, &self.memory);
            self.present_semaphores.destroy();
            self.sync.destroy();
            self.commands.destroy(&self.ctx);
            self.swapchain.destroy(&self.ctx);
            self.surface.destroy(&self.ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // FpsCounter
    // ============================================================

    #[test]
    fn test_no_rate_before_a_full_second() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        for i in 1..10 {
            assert_eq!(counter.tick(start + Duration::from_millis(i * 100)), None);
        }
    }

    #[test]
    fn test_rate_reported_after_one_second() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        for i in 1..60 {
            assert_eq!(counter.tick(start + Duration::from_millis(i * 16)), None);
        }
        let fps = counter.tick(start + Duration::from_secs(1)).unwrap();
        assert!((fps - 60.0).abs() < 0.01);
    }

    #[test]
    fn test_window_restarts_after_report() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        let one_second = start + Duration::from_secs(1);
        assert!(counter.tick(one_second).is_some());
        assert_eq!(counter.tick(one_second + Duration::from_millis(10)), None);
    }
}
