//! Vulkan swapchain management.
//!
//! Swapchain images are only ever copy destinations: the ray-traced output
//! image is copied into the acquired image, which is then presented.

use ash::prelude::VkResult;
use ash::vk;
use tracing::info;

use super::{VulkanContext, VulkanSurface};
use crate::error::{RenderError, Result, VkResultExt};

/// Result of acquiring a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready; a suboptimal swapchain should be recreated after presenting.
    Ready { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be recreated first.
    OutOfDate,
}

impl AcquireOutcome {
    pub fn from_result(result: VkResult<(u32, bool)>) -> Result<Self> {
        match result {
            Ok((index, suboptimal)) => Ok(Self::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Self::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }
}

/// Result of presenting a swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    NeedsRecreate,
}

impl PresentOutcome {
    pub fn from_result(result: VkResult<bool>) -> Result<Self> {
        match result {
            Ok(false) => Ok(Self::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Self::NeedsRecreate),
            Err(e) => Err(e).context("Failed to present"),
        }
    }
}

/// One more than the minimum, within the surface's limit (0 means unlimited).
pub fn desired_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count == 0 {
        wanted
    } else {
        wanted.min(capabilities.max_image_count)
    }
}

/// Vulkan swapchain.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain, retiring `old_swapchain` if given.
    pub unsafe fn new(
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        width: u32,
        height: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let loader = ctx.swapchain_loader()?;
        let extent = surface.get_extent(width, height);

        if !surface
            .capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(RenderError::Unsupported(
                "swapchain images cannot be copy destinations".into(),
            ));
        }

        let queue_families = [ctx.graphics_family, ctx.present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(desired_image_count(&surface.capabilities))
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(surface.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        create_info = if ctx.graphics_family != ctx.present_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = loader
            .create_swapchain(&create_info, None)
            .context("Failed to create swapchain")?;

        if let Some(old) = old_swapchain {
            loader.destroy_swapchain(old, None);
        }

        let images = match loader.get_swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                loader.destroy_swapchain(handle, None);
                return Err(e).context("Failed to get swapchain images");
            }
        };

        info!(
            width = extent.width,
            height = extent.height,
            images = images.len(),
            format = ?surface.format.format,
            present_mode = ?surface.present_mode,
            "Swapchain created"
        );

        Ok(Self {
            handle,
            images,
            format: surface.format.format,
            extent,
        })
    }

    /// Acquire the next image, signaling `semaphore` once it is usable.
    pub unsafe fn acquire_next_image(
        &self,
        ctx: &VulkanContext,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = ctx.swapchain_loader()?.acquire_next_image(
            self.handle,
            u64::MAX,
            semaphore,
            vk::Fence::null(),
        );
        AcquireOutcome::from_result(result)
    }

    /// Present image `index` once `wait_semaphore` is signaled.
    pub unsafe fn present(
        &self,
        ctx: &VulkanContext,
        index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = ctx
            .swapchain_loader()?
            .queue_present(ctx.present_queue, &present_info);
        PresentOutcome::from_result(result)
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    /// Recreate the swapchain (e.g., after window resize).
    pub unsafe fn recreate(
        &mut self,
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        width: u32,
        height: u32,
    ) -> Result<()> {
        ctx.wait_idle()?;

        // The retired swapchain is destroyed by `new` only once its successor exists
        *self = Self::new(ctx, surface, width, height, Some(self.handle))?;

        Ok(())
    }

    /// Destroy the swapchain.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        if self.handle == vk::SwapchainKHR::null() {
            return;
        }
        ctx.wait_idle_for_teardown();
        if let Ok(loader) = ctx.swapchain_loader() {
            loader.destroy_swapchain(self.handle, None);
        }
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // AcquireOutcome
    // ============================================================

    #[test]
    fn test_acquire_ready() {
        let outcome = AcquireOutcome::from_result(Ok((2, false))).unwrap();
        assert_eq!(outcome, AcquireOutcome::Ready { index: 2, suboptimal: false });
    }

    #[test]
    fn test_acquire_suboptimal_still_renders() {
        let outcome = AcquireOutcome::from_result(Ok((1, true))).unwrap();
        assert_eq!(outcome, AcquireOutcome::Ready { index: 1, suboptimal: true });
    }

    #[test]
    fn test_acquire_out_of_date() {
        let outcome = AcquireOutcome::from_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
        assert_eq!(outcome, AcquireOutcome::OutOfDate);
    }

    #[test]
    fn test_acquire_device_lost_is_error() {
        let err = AcquireOutcome::from_result(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert!(matches!(
            err,
            RenderError::Vulkan { result: vk::Result::ERROR_DEVICE_LOST, .. }
        ));
    }

    // ============================================================
    // PresentOutcome
    // ============================================================

    #[test]
    fn test_present_outcomes() {
        assert_eq!(PresentOutcome::from_result(Ok(false)).unwrap(), PresentOutcome::Presented);
        assert_eq!(PresentOutcome::from_result(Ok(true)).unwrap(), PresentOutcome::NeedsRecreate);
        assert_eq!(
            PresentOutcome::from_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::NeedsRecreate
        );
        assert!(PresentOutcome::from_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }

    // ============================================================
    // desired_image_count
    // ============================================================

    #[test]
    fn test_image_count_one_above_minimum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(desired_image_count(&caps), 3);
    }

    #[test]
    fn test_image_count_capped_by_maximum() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(desired_image_count(&caps), 3);
    }

    #[test]
    fn test_image_count_unbounded() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(desired_image_count(&caps), 5);
    }
}
