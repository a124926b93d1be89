//! Per-frame synchronization primitives and frame pacing.
//!
//! A frame slot's fence is waited on before anything belonging to that slot
//! (command buffer, uniform buffer, descriptor set) is touched again. The
//! only way to obtain the slot index is [`FramePacer::wait_for_slot`], which
//! performs that wait first.
//!
//! The semaphore a frame signals for presentation belongs to the acquired
//! swapchain image instead of the slot: a pending present keeps it until that
//! image is acquired again.

use ash::vk;

use super::VulkanContext;
use crate::error::{RenderError, Result, VkResultExt};

/// Acquire semaphore and fence of one frame slot.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight: vk::Fence,
}

/// Something that can block until a frame slot's previous submission finished.
pub trait FenceWait {
    fn wait_for_slot(&self, slot: usize) -> Result<()>;
}

/// Something that can block until the whole device is idle.
pub trait IdleWait {
    fn wait_idle(&self) -> Result<()>;
}

impl IdleWait for VulkanContext {
    fn wait_idle(&self) -> Result<()> {
        VulkanContext::wait_idle(self)
    }
}

/// Run `release` once the device reported idle; a failed wait releases nothing.
pub fn release_when_idle<W: IdleWait, T>(waiter: &W, release: impl FnOnce() -> T) -> Result<T> {
    waiter.wait_idle()?;
    Ok(release())
}

/// Sync objects for every frame slot.
pub struct FrameSyncSet {
    frames: Vec<FrameSync>,
    device: ash::Device,
}

impl FrameSyncSet {
    /// Create sync objects for `frames_in_flight` slots; fences start signaled.
    pub unsafe fn new(ctx: &VulkanContext, frames_in_flight: usize) -> Result<Self> {
        let mut set = Self {
            frames: Vec::with_capacity(frames_in_flight),
            device: ctx.device.clone(),
        };

        for _ in 0..frames_in_flight {
            let mut frame = FrameSync {
                image_available: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            };
            let created = set.create_objects(&mut frame);
            set.frames.push(frame);

            if let Err(e) = created {
                set.destroy();
                return Err(e);
            }
        }

        Ok(set)
    }

    unsafe fn create_objects(&self, frame: &mut FrameSync) -> Result<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        frame.image_available = self
            .device
            .create_semaphore(&semaphore_info, None)
            .context("Failed to create semaphore")?;
        frame.in_flight = self
            .device
            .create_fence(&fence_info, None)
            .context("Failed to create fence")?;
        Ok(())
    }

    pub fn get(&self, slot: usize) -> &FrameSync {
        &self.frames[slot]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Return the slot's fence to the unsignaled state before submitting.
    pub unsafe fn reset(&self, slot: usize) -> Result<()> {
        self.device
            .reset_fences(&[self.frames[slot].in_flight])
            .context("Failed to reset fence")
    }

    /// Destroy all semaphores and fences.
    pub unsafe fn destroy(&mut self) {
        for sync in self.frames.drain(..) {
            if sync.image_available != vk::Semaphore::null() {
                self.device.destroy_semaphore(sync.image_available, None);
            }
            if sync.in_flight != vk::Fence::null() {
                self.device.destroy_fence(sync.in_flight, None);
            }
        }
    }
}

impl FenceWait for FrameSyncSet {
    fn wait_for_slot(&self, slot: usize) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.frames[slot].in_flight], true, u64::MAX)
                .context("Failed to wait for fence")
        }
    }
}

/// One presentation semaphore per swapchain image.
pub struct PresentSemaphores {
    semaphores: Vec<vk::Semaphore>,
    device: ash::Device,
}

impl PresentSemaphores {
    pub unsafe fn new(ctx: &VulkanContext, image_count: usize) -> Result<Self> {
        let mut set = Self {
            semaphores: Vec::with_capacity(image_count),
            device: ctx.device.clone(),
        };
        if let Err(e) = set.create(image_count) {
            set.destroy();
            return Err(e);
        }
        Ok(set)
    }

    unsafe fn create(&mut self, image_count: usize) -> Result<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in 0..image_count {
            let semaphore = self
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            self.semaphores.push(semaphore);
        }
        Ok(())
    }

    /// Replace every semaphore after a swapchain recreation; the device must be idle.
    pub unsafe fn recreate(&mut self, image_count: usize) -> Result<()> {
        self.destroy();
        self.create(image_count)
    }

    /// Semaphore signaled by the frame that renders into image `index`.
    pub fn get(&self, index: u32) -> Result<vk::Semaphore> {
        self.semaphores
            .get(index as usize)
            .copied()
            .ok_or_else(|| RenderError::Other(format!("no present semaphore for swapchain image {index}")))
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }

    pub unsafe fn destroy(&mut self) {
        for semaphore in self.semaphores.drain(..) {
            self.device.destroy_semaphore(semaphore, None);
        }
    }
}

/// Proof that the slot's previous submission has completed.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameToken {
    slot: usize,
    frame_number: u64,
}

impl FrameToken {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}

/// Round-robin frame slot selection.
#[derive(Debug, Clone)]
pub struct FramePacer {
    frames_in_flight: usize,
    frame_number: u64,
}

impl FramePacer {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame_number: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Frames completed so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot of the next frame.
    pub fn current_slot(&self) -> usize {
        (self.frame_number % self.frames_in_flight as u64) as usize
    }

    /// Wait on the current slot's fence and hand out its token.
    pub fn wait_for_slot<W: FenceWait>(&self, waiter: &W) -> Result<FrameToken> {
        let slot = self.current_slot();
        waiter.wait_for_slot(slot)?;
        Ok(FrameToken {
            slot,
            frame_number: self.frame_number,
        })
    }

    /// Move to the next slot once the token's frame has been submitted.
    pub fn advance(&mut self, token: FrameToken) {
        debug_assert_eq!(token.frame_number, self.frame_number);
        self.frame_number = token.frame_number + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Record(usize),
    }

    #[derive(Default)]
    struct LoggingWaiter {
        log: RefCell<Vec<Event>>,
        fail_on: Option<usize>,
    }

    impl FenceWait for LoggingWaiter {
        fn wait_for_slot(&self, slot: usize) -> Result<()> {
            if self.fail_on == Some(slot) {
                return Err(RenderError::Vulkan {
                    context: "wait",
                    result: vk::Result::ERROR_DEVICE_LOST,
                });
            }
            self.log.borrow_mut().push(Event::Wait(slot));
            Ok(())
        }
    }

    // ============================================================
    // FramePacer
    // ============================================================

    #[test]
    fn test_slots_cycle_round_robin() {
        let waiter = LoggingWaiter::default();
        let mut pacer = FramePacer::new(3);
        let mut slots = Vec::new();
        for _ in 0..7 {
            let token = pacer.wait_for_slot(&waiter).unwrap();
            slots.push(token.slot());
            pacer.advance(token);
        }
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(pacer.frame_number(), 7);
    }

    #[test]
    fn test_every_record_preceded_by_wait_on_same_slot() {
        let waiter = LoggingWaiter::default();
        let mut pacer = FramePacer::new(2);
        for _ in 0..6 {
            let token = pacer.wait_for_slot(&waiter).unwrap();
            waiter.log.borrow_mut().push(Event::Record(token.slot()));
            pacer.advance(token);
        }

        let log = waiter.log.borrow();
        for (i, event) in log.iter().enumerate() {
            if let Event::Record(slot) = event {
                assert!(i > 0);
                assert_eq!(log[i - 1], Event::Wait(*slot));
            }
        }
        assert_eq!(log.iter().filter(|e| matches!(e, Event::Record(_))).count(), 6);
    }

    #[test]
    fn test_failed_wait_yields_no_token() {
        let waiter = LoggingWaiter {
            fail_on: Some(1),
            ..Default::default()
        };
        let mut pacer = FramePacer::new(2);
        let token = pacer.wait_for_slot(&waiter).unwrap();
        pacer.advance(token);
        assert!(pacer.wait_for_slot(&waiter).is_err());
        assert_eq!(pacer.current_slot(), 1);
    }

    #[test]
    fn test_skipped_frame_reuses_slot() {
        let waiter = LoggingWaiter::default();
        let pacer = FramePacer::new(2);
        let first = pacer.wait_for_slot(&waiter).unwrap();
        drop(first);
        let again = pacer.wait_for_slot(&waiter).unwrap();
        assert_eq!(again.slot(), 0);
        assert_eq!(again.frame_number(), 0);
    }

    #[test]
    fn test_single_frame_in_flight() {
        let waiter = LoggingWaiter::default();
        let mut pacer = FramePacer::new(1);
        for _ in 0..3 {
            let token = pacer.wait_for_slot(&waiter).unwrap();
            assert_eq!(token.slot(), 0);
            pacer.advance(token);
        }
    }

    #[test]
    fn test_zero_frames_clamped_to_one() {
        assert_eq!(FramePacer::new(0).frames_in_flight(), 1);
    }

    // ============================================================
    // release_when_idle
    // ============================================================

    struct IdleResult(Option<vk::Result>);

    impl IdleWait for IdleResult {
        fn wait_idle(&self) -> Result<()> {
            match self.0 {
                Some(result) => Err(result).context("Failed to wait for device idle"),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn test_lost_device_releases_nothing() {
        let released = Cell::new(false);
        let result = release_when_idle(&IdleResult(Some(vk::Result::ERROR_DEVICE_LOST)), || released.set(true));

        assert!(matches!(
            result,
            Err(RenderError::Vulkan {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            })
        ));
        assert!(!released.get());
    }

    #[test]
    fn test_idle_device_runs_release() {
        let released = Cell::new(false);
        let value = release_when_idle(&IdleResult(None), || {
            released.set(true);
            7
        })
        .unwrap();
        assert_eq!(value, 7);
        assert!(released.get());
    }
}
