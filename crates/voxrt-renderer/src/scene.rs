//! The static voxel scene: everything built once at startup and drawn every frame.

use ash::vk;
use tracing::{info, instrument};

use crate::camera::{Camera, CameraUniform};
use crate::error::Result;
use crate::frame::FrameCommands;
use crate::frame_resources::FrameResources;
use crate::voxel::VoxelGrid;
use crate::vulkan::raytracing::{
    AccelerationStructureRegistry, BlasHandle, RayTracingPipeline, ShaderBinaries, ShaderBindingTable,
    TlasHandle, IDENTITY_TRANSFORM,
};
use crate::vulkan::{Buffer, CommandManager, MemoryManager, VulkanContext};

/// Usage of the voxel occupancy buffer; readable back for inspection.
pub const VOXEL_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

/// GPU objects of the single ray traced voxel volume.
pub struct VoxelScene {
    voxel_buffer: Buffer,
    registry: AccelerationStructureRegistry,
    blas: BlasHandle,
    tlas: TlasHandle,
    resources: FrameResources,
    pipeline: RayTracingPipeline,
    sbt: ShaderBindingTable,
}

impl VoxelScene {
    /// Upload `grid`, build both acceleration structures, the frame resources,
    /// the pipeline and its binding table.
    #[instrument(skip_all, fields(width = extent.width, height = extent.height, slots = slot_count))]
    pub unsafe fn build(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        grid: &VoxelGrid,
        binaries: &ShaderBinaries,
        format: vk::Format,
        extent: vk::Extent2D,
        slot_count: usize,
    ) -> Result<Self> {
        let mut voxel_buffer =
            memory.upload_staged(ctx, commands, grid.cells(), VOXEL_BUFFER_USAGE, "voxel grid")?;
        let mut registry = AccelerationStructureRegistry::new(ctx);

        let structures = registry
            .build_blas_from_aabbs(ctx, memory, commands, &[VoxelGrid::bounds()])
            .and_then(|blas| {
                let tlas = registry.build_tlas(ctx, memory, commands, &[(blas, IDENTITY_TRANSFORM)])?;
                Ok((blas, tlas, registry.tlas(tlas)?))
            });

        let (blas, tlas, tlas_handle) = match structures {
            Ok(built) => built,
            Err(e) => {
                registry.destroy(memory);
                memory.destroy_buffer(&mut voxel_buffer);
                return Err(e);
            }
        };

        let mut resources = match FrameResources::new(
            ctx,
            memory,
            commands,
            tlas_handle,
            &voxel_buffer,
            format,
            extent,
            slot_count,
        ) {
            Ok(resources) => resources,
            Err(e) => {
                registry.destroy(memory);
                memory.destroy_buffer(&mut voxel_buffer);
                return Err(e);
            }
        };

        let mut pipeline = match RayTracingPipeline::build(ctx, resources.layout(), binaries) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                resources.destroy(ctx, memory);
                registry.destroy(memory);
                memory.destroy_buffer(&mut voxel_buffer);
                return Err(e);
            }
        };

        let sbt = match ShaderBindingTable::new(ctx, memory, &pipeline) {
            Ok(sbt) => sbt,
            Err(e) => {
                pipeline.destroy(ctx);
                resources.destroy(ctx, memory);
                registry.destroy(memory);
                memory.destroy_buffer(&mut voxel_buffer);
                return Err(e);
            }
        };

        info!(solid_voxels = grid.solid_count(), "Voxel scene ready");

        Ok(Self {
            voxel_buffer,
            registry,
            blas,
            tlas,
            resources,
            pipeline,
            sbt,
        })
    }

    /// Update the camera, upload its uniform block for `slot` and record the frame.
    ///
    /// `cmd` must be recording and the slot's previous submission must have completed.
    pub unsafe fn draw_frame(
        &mut self,
        ctx: &VulkanContext,
        cmd: vk::CommandBuffer,
        slot: usize,
        target: vk::Image,
        camera: &mut Camera,
        delta_time: f32,
    ) -> Result<()> {
        camera.update(delta_time);

        let extent = self.resources.output().extent;
        let uniform = camera.uniform(extent.width, extent.height);
        self.record_frame(ctx, cmd, slot, target, &uniform)
    }

    /// Upload `uniform` for `slot` and record the dispatch and copy into `cmd`.
    pub unsafe fn record_frame(
        &mut self,
        ctx: &VulkanContext,
        cmd: vk::CommandBuffer,
        slot: usize,
        target: vk::Image,
        uniform: &CameraUniform,
    ) -> Result<()> {
        self.resources.update_descriptor_set(slot, uniform)?;

        FrameCommands {
            pipeline: &self.pipeline,
            sbt: &self.sbt,
            descriptor_set: self.resources.descriptor_set(slot)?,
            output: self.resources.output(),
            target,
        }
        .record(ctx, cmd);

        Ok(())
    }

    /// Recreate the output image for a new swapchain format and extent.
    pub unsafe fn handle_resize(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.resources.handle_resize(ctx, memory, commands, format, extent)
    }

    pub fn voxel_buffer(&self) -> &Buffer {
        &self.voxel_buffer
    }

    pub fn registry(&self) -> &AccelerationStructureRegistry {
        &self.registry
    }

    pub fn blas(&self) -> BlasHandle {
        self.blas
    }

    pub fn tlas(&self) -> TlasHandle {
        self.tlas
    }

    pub fn resources(&self) -> &FrameResources {
        &self.resources
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    /// Destroy every scene object; the device must be idle.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        self.sbt.destroy(memory);
        self.pipeline.destroy(ctx);
        self.resources.destroy(ctx, memory);
        self.registry.destroy(memory);
        memory.destroy_buffer(&mut self.voxel_buffer);
    }
}
