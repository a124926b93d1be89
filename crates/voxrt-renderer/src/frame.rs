//! Per-frame command recording: trace rays, then copy the output into the swapchain image.
//!
//! The swapchain image is first touched by the copy barrier, so the submission
//! waits on the acquire semaphore at [`ACQUIRE_WAIT_STAGE`] and the first
//! barrier on the target chains onto that stage.

use ash::vk;

use crate::vulkan::commands::record_image_barrier;
use crate::vulkan::raytracing::{RayTracingPipeline, ShaderBindingTable};
use crate::vulkan::{Image, LayoutTransition, VulkanContext};

/// Stage at which a frame's submission waits for the acquired image.
pub const ACQUIRE_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

/// Image a frame step applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameImage {
    /// Acquired swapchain image
    Target,
    /// Ray traced storage image
    Output,
}

/// One layout transition recorded around the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStep {
    pub image: FrameImage,
    pub transition: LayoutTransition,
}

/// Transitions between the dispatch and the copy.
pub fn pre_copy_steps() -> [ImageStep; 2] {
    [
        ImageStep {
            image: FrameImage::Target,
            transition: LayoutTransition::between(
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
            .after_stage(ACQUIRE_WAIT_STAGE),
        },
        ImageStep {
            image: FrameImage::Output,
            transition: LayoutTransition::between(
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ),
        },
    ]
}

/// Transitions after the copy, handing the target to presentation.
pub fn post_copy_steps() -> [ImageStep; 2] {
    [
        ImageStep {
            image: FrameImage::Target,
            transition: LayoutTransition::between(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
        },
        ImageStep {
            image: FrameImage::Output,
            transition: LayoutTransition::between(
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::GENERAL,
            ),
        },
    ]
}

/// Full-extent color copy between two single-mip images.
pub fn copy_region(extent: vk::Extent2D) -> vk::ImageCopy {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    vk::ImageCopy {
        src_subresource: layers,
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers,
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

/// Everything a frame's commands reference.
pub struct FrameCommands<'a> {
    pub pipeline: &'a RayTracingPipeline,
    pub sbt: &'a ShaderBindingTable,
    pub descriptor_set: vk::DescriptorSet,
    pub output: &'a Image,
    pub target: vk::Image,
}

impl FrameCommands<'_> {
    fn image(&self, which: FrameImage) -> vk::Image {
        match which {
            FrameImage::Target => self.target,
            FrameImage::Output => self.output.handle,
        }
    }

    unsafe fn record_steps(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer, steps: &[ImageStep]) {
        for step in steps {
            record_image_barrier(&ctx.device, cmd, self.image(step.image), &step.transition);
        }
    }

    /// Record the frame into `cmd`, which must be in the recording state.
    pub unsafe fn record(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer) {
        let extent = self.output.extent;

        self.pipeline.bind(ctx, cmd, self.descriptor_set);
        self.sbt.trace_rays(&ctx.rt, cmd, extent.width, extent.height, 1);

        self.record_steps(ctx, cmd, &pre_copy_steps());

        ctx.device.cmd_copy_image(
            cmd,
            self.output.handle,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.target,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy_region(extent)],
        );

        self.record_steps(ctx, cmd, &post_copy_steps());
    }
}
