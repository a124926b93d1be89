//! Window surface properties: format, present mode and extent.

use ash::vk;

use super::VulkanContext;
use crate::error::{RenderError, Result, VkResultExt};

/// Wrapper around a Vulkan surface.
pub struct VulkanSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl VulkanSurface {
    /// Query the properties of a surface created alongside the context.
    ///
    /// The ray-traced output image shares the swapchain format, so only
    /// formats usable as storage images are accepted.
    pub unsafe fn new(ctx: &VulkanContext, handle: vk::SurfaceKHR, vsync: bool) -> Result<Self> {
        let loader = ctx.surface_loader()?;

        let capabilities = loader
            .get_physical_device_surface_capabilities(ctx.physical_device, handle)
            .context("Failed to get surface capabilities")?;

        let formats = loader
            .get_physical_device_surface_formats(ctx.physical_device, handle)
            .context("Failed to get surface formats")?;

        let format = choose_surface_format(&formats, |format| {
            ctx.instance
                .get_physical_device_format_properties(ctx.physical_device, format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
        })
        .ok_or_else(|| {
            RenderError::Unsupported("no surface format supports storage image writes".into())
        })?;

        let present_modes = loader
            .get_physical_device_surface_present_modes(ctx.physical_device, handle)
            .context("Failed to get present modes")?;

        let present_mode = choose_present_mode(&present_modes, vsync);

        Ok(Self {
            handle,
            format,
            present_mode,
            capabilities,
        })
    }

    /// Refresh surface capabilities (e.g., after window resize).
    pub unsafe fn refresh_capabilities(&mut self, ctx: &VulkanContext) -> Result<()> {
        self.capabilities = ctx
            .surface_loader()?
            .get_physical_device_surface_capabilities(ctx.physical_device, self.handle)
            .context("Failed to refresh surface capabilities")?;
        Ok(())
    }

    /// Get the current extent, clamped to surface capabilities.
    pub fn get_extent(&self, desired_width: u32, desired_height: u32) -> vk::Extent2D {
        surface_extent(&self.capabilities, desired_width, desired_height)
    }

    /// Destroy the surface.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        if self.handle == vk::SurfaceKHR::null() {
            return;
        }
        if let Ok(loader) = ctx.surface_loader() {
            loader.destroy_surface(self.handle, None);
        }
        self.handle = vk::SurfaceKHR::null();
    }
}

/// Choose the surface format: B8G8R8A8_UNORM, then R8G8B8A8_UNORM, then any
/// format accepted by `storage_capable`.
pub fn choose_surface_format<F>(formats: &[vk::SurfaceFormatKHR], storage_capable: F) -> Option<vk::SurfaceFormatKHR>
where
    F: Fn(vk::Format) -> bool,
{
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

    for preferred in PREFERRED {
        if let Some(format) = formats
            .iter()
            .find(|f| f.format == preferred && storage_capable(f.format))
        {
            return Some(*format);
        }
    }

    formats.iter().find(|f| storage_capable(f.format)).copied()
}

/// Choose the present mode.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // FIFO is guaranteed to be available
        return vk::PresentModeKHR::FIFO;
    }

    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }

    if modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        return vk::PresentModeKHR::IMMEDIATE;
    }

    vk::PresentModeKHR::FIFO
}

/// Surface-defined extent, or the desired size clamped to the allowed range.
pub fn surface_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: desired_width
            .max(capabilities.min_image_extent.width)
            .min(capabilities.max_image_extent.width),
        height: desired_height
            .max(capabilities.min_image_extent.height)
            .min(capabilities.max_image_extent.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    // ============================================================
    // choose_surface_format
    // ============================================================

    #[test]
    fn test_prefers_bgra_unorm() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        let chosen = choose_surface_format(&formats, |_| true).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_rgba_unorm_when_bgra_lacks_storage() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let chosen = choose_surface_format(&formats, |f| f != vk::Format::B8G8R8A8_UNORM).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_any_storage_format_as_last_resort() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
        ];
        let chosen =
            choose_surface_format(&formats, |f| f == vk::Format::A2B10G10R10_UNORM_PACK32).unwrap();
        assert_eq!(chosen.format, vk::Format::A2B10G10R10_UNORM_PACK32);
    }

    #[test]
    fn test_no_storage_format_is_none() {
        let formats = [surface_format(vk::Format::B8G8R8A8_SRGB)];
        assert!(choose_surface_format(&formats, |_| false).is_none());
        assert!(choose_surface_format(&[], |_| true).is_none());
    }

    // ============================================================
    // choose_present_mode
    // ============================================================

    #[test]
    fn test_vsync_is_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_no_vsync_prefers_mailbox() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn test_no_vsync_falls_back() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    // ============================================================
    // surface_extent
    // ============================================================

    #[test]
    fn test_defined_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };
        assert_eq!(surface_extent(&caps, 1920, 1080), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_undefined_extent_clamps() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
            ..Default::default()
        };
        assert_eq!(surface_extent(&caps, 10, 5000), vk::Extent2D { width: 64, height: 2048 });
        assert_eq!(surface_extent(&caps, 1280, 720), vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn test_minimized_window_reports_zero() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 0, height: 0 },
            ..Default::default()
        };
        let extent = surface_extent(&caps, 1280, 720);
        assert_eq!(extent.width, 0);
    }
}
