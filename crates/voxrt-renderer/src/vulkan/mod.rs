//! Vulkan backend with KHR ray tracing.
//!
//! Extension function tables are loaded once when the [`VulkanContext`] is
//! created and handed to every component by reference.

pub mod commands;
pub mod context;
pub mod descriptors;
pub mod memory;
pub mod raytracing;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use commands::{CommandManager, LayoutTransition, QueueKind};
pub use context::{QueueFamilyIndices, RtDispatch, RtProperties, VulkanContext};
pub use descriptors::{Binding, DescriptorManager};
pub use memory::{Buffer, Image, MemoryManager};
pub use surface::VulkanSurface;
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
pub use sync::{
    release_when_idle, FenceWait, FramePacer, FrameSync, FrameSyncSet, FrameToken, IdleWait, PresentSemaphores,
};

use ash::vk;
use std::ffi::CStr;

/// Minimum instance/device API version (buffer device address is core in 1.2).
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"VoxRT";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"VoxRT Renderer";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

/// Khronos validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
