//! Error type shared by every renderer component.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Any failure raised while setting up or driving the renderer.
///
/// Surface changes (out-of-date or suboptimal swapchains) are not errors;
/// they are reported through the swapchain's outcome types instead.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("{context}: {result:?}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },

    #[error("failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("failed to read shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("a top-level acceleration structure needs at least one instance")]
    EmptyInstanceList,

    #[error("unknown {0}")]
    UnknownHandle(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("window error: {0}")]
    Window(String),

    #[error("{0}")]
    Other(String),
}

/// Result type for renderer operations.
pub type Result<T> = std::result::Result<T, RenderError>;

/// Attach a description to a raw Vulkan result.
pub trait VkResultExt<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|result| RenderError::Vulkan { context, result })
    }
}
