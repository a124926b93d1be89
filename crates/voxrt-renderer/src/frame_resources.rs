//! Output image, per-slot camera uniforms and descriptor sets.
//!
//! The output image is the only resource that changes after startup: a resize
//! destroys it, creates a replacement at the new extent and rewrites binding 1
//! of every slot's set. Bindings 0 and 3 are written once, binding 2 every frame.

use ash::vk;
use tracing::{debug, info};

use crate::camera::CameraUniform;
use crate::error::{RenderError, Result};
use crate::vulkan::commands::record_image_barrier;
use crate::vulkan::{
    release_when_idle, Buffer, CommandManager, DescriptorManager, Image, LayoutTransition, MemoryManager,
    QueueKind, VulkanContext,
};

/// Usage of the ray traced output image: written by raygen, copied to the swapchain.
pub const OUTPUT_IMAGE_USAGE: vk::ImageUsageFlags =
    vk::ImageUsageFlags::from_raw(vk::ImageUsageFlags::STORAGE.as_raw() | vk::ImageUsageFlags::TRANSFER_SRC.as_raw());

/// Per-slot descriptor sets and the resources they point at.
pub struct FrameResources {
    descriptors: DescriptorManager,
    sets: Vec<vk::DescriptorSet>,
    uniforms: Vec<Buffer>,
    output: Image,
    bound_output_view: vk::ImageView,
}

impl FrameResources {
    /// Create the output image, `slot_count` uniform buffers and one fully written set per slot.
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        tlas: vk::AccelerationStructureKHR,
        voxels: &Buffer,
        format: vk::Format,
        extent: vk::Extent2D,
        slot_count: usize,
    ) -> Result<Self> {
        let descriptors = DescriptorManager::new(ctx, slot_count as u32)?;

        let mut resources = Self {
            descriptors,
            sets: Vec::new(),
            uniforms: Vec::with_capacity(slot_count),
            output: Image {
                handle: vk::Image::null(),
                view: vk::ImageView::null(),
                allocation: None,
                format,
                extent,
            },
            bound_output_view: vk::ImageView::null(),
        };

        if let Err(e) = resources.populate(ctx, memory, commands, tlas, voxels, slot_count) {
            resources.destroy(ctx, memory);
            return Err(e);
        }

        Ok(resources)
    }

    unsafe fn populate(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        tlas: vk::AccelerationStructureKHR,
        voxels: &Buffer,
        slot_count: usize,
    ) -> Result<()> {
        self.output = Self::create_image(ctx, memory, commands, self.output.format, self.output.extent)?;

        for slot in 0..slot_count {
            let buffer = Self::create_uniform_buffer(memory, slot)?;
            self.uniforms.push(buffer);
        }

        self.sets = self.create_descriptor_set(tlas, voxels)?;
        self.bound_output_view = self.output.view;
        Ok(())
    }

    /// Create the storage image the raygen shader writes and leave it in GENERAL layout.
    ///
    /// The layout change runs on its own fenced one-shot submission, outside the
    /// frame slots' fences and semaphores.
    pub unsafe fn create_image(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Image> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::Other(format!(
                "output image extent {}x{} has no pixels",
                extent.width, extent.height
            )));
        }

        let mut image = memory.create_image_2d(extent, format, OUTPUT_IMAGE_USAGE, "ray traced output")?;

        let transition = LayoutTransition::between(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);
        let transitioned = commands.begin_single_time(QueueKind::Graphics).and_then(|cmd| {
            record_image_barrier(&ctx.device, cmd, image.handle, &transition);
            commands.end_single_time_fenced(ctx, QueueKind::Graphics, cmd)
        });

        if let Err(e) = transitioned {
            memory.destroy_image(&mut image);
            return Err(e);
        }

        debug!(
            width = extent.width,
            height = extent.height,
            format = ?format,
            "Output image created"
        );
        Ok(image)
    }

    /// Host-visible uniform buffer holding one [`CameraUniform`].
    pub unsafe fn create_uniform_buffer(memory: &MemoryManager, slot: usize) -> Result<Buffer> {
        memory.create_uniform_buffer(CameraUniform::size(), &format!("camera uniform {slot}"))
    }

    /// Allocate one set per slot and write all four bindings.
    pub unsafe fn create_descriptor_set(
        &self,
        tlas: vk::AccelerationStructureKHR,
        voxels: &Buffer,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let sets = self.descriptors.allocate_sets(self.uniforms.len() as u32)?;

        for (set, uniform) in sets.iter().zip(&self.uniforms) {
            self.descriptors.write_acceleration_structure(*set, tlas);
            self.descriptors.write_storage_image(*set, self.output.view);
            self.descriptors.write_uniform_buffer(*set, uniform.handle, uniform.size);
            self.descriptors.write_storage_buffer(*set, voxels.handle, voxels.size);
        }

        Ok(sets)
    }

    /// Copy this frame's camera block into the slot's uniform buffer and rebind it.
    ///
    /// The slot's previous submission must have completed.
    pub unsafe fn update_descriptor_set(&mut self, slot: usize, camera: &CameraUniform) -> Result<()> {
        let set = self.descriptor_set(slot)?;
        let uniform = &mut self.uniforms[slot];
        uniform.write(std::slice::from_ref(camera))?;
        self.descriptors.write_uniform_buffer(set, uniform.handle, uniform.size);
        Ok(())
    }

    /// Replace the output image with one of `format` and `extent`, then rewrite binding 1.
    pub unsafe fn handle_resize(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<()> {
        release_when_idle(ctx, || memory.destroy_image(&mut self.output))?;
        self.bound_output_view = vk::ImageView::null();

        self.output = Self::create_image(ctx, memory, commands, format, extent)?;

        for set in &self.sets {
            self.descriptors.write_storage_image(*set, self.output.view);
        }
        self.bound_output_view = self.output.view;

        info!(width = extent.width, height = extent.height, "Output image recreated");
        Ok(())
    }

    pub fn descriptor_set(&self, slot: usize) -> Result<vk::DescriptorSet> {
        self.sets
            .get(slot)
            .copied()
            .ok_or_else(|| RenderError::Other(format!("no descriptor set for frame slot {slot}")))
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.descriptors.layout()
    }

    pub fn output(&self) -> &Image {
        &self.output
    }

    /// View currently written to binding 1 of every set.
    pub fn bound_output_view(&self) -> vk::ImageView {
        self.bound_output_view
    }

    pub fn slot_count(&self) -> usize {
        self.sets.len()
    }

    /// Destroy everything; the device must be idle.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        memory.destroy_image(&mut self.output);
        self.bound_output_view = vk::ImageView::null();
        for uniform in &mut self.uniforms {
            memory.destroy_buffer(uniform);
        }
        self.uniforms.clear();
        self.sets.clear();
        self.descriptors.destroy(ctx);
    }
}
