//! Hardware ray-traced renderer for a static voxel volume.
//!
//! The renderer builds a two-level acceleration structure over the volume's
//! bounding box, links a ray tracing pipeline with a procedural hit group and
//! dispatches one ray per pixel into a storage image, which is then copied
//! into the swapchain image for presentation.

pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_resources;
pub mod renderer;
pub mod scene;
pub mod voxel;
pub mod vulkan;

pub use camera::{Camera, CameraUniform, MoveInput};
pub use config::RendererConfig;
pub use error::{RenderError, Result};
pub use renderer::VoxelRenderer;
pub use scene::VoxelScene;
pub use voxel::VoxelGrid;
