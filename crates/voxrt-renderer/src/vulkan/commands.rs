//! Command buffer management and image layout transitions.
//!
//! Each frame slot owns a resettable pool with one primary buffer. One-shot
//! work (uploads, acceleration structure builds, the initial layout of the
//! output image) goes through transient pools on the graphics or transfer
//! queue and is waited on before returning.

use ash::vk;
use tracing::trace;

use super::sync::FrameToken;
use super::VulkanContext;
use crate::error::{Result, VkResultExt};

/// Queue a one-shot command buffer is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

/// Command pool and primary buffer for a single frame slot.
struct FrameCommands {
    pool: vk::CommandPool,
    primary: vk::CommandBuffer,
}

/// Access masks and pipeline stages of one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Transition whose scopes follow from the layouts involved.
    pub fn between(old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        let (src_access, src_stage) = source_scope(old_layout);
        let (dst_access, dst_stage) = destination_scope(new_layout);
        Self {
            old_layout,
            new_layout,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        }
    }

    /// Override the source stage, e.g. to chain onto a semaphore wait stage.
    pub fn after_stage(mut self, stage: vk::PipelineStageFlags) -> Self {
        self.src_stage = stage;
        self
    }

    /// Barrier for the single color subresource of `image`.
    pub fn barrier(&self, image: vk::Image) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range())
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

fn source_scope(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

fn destination_scope(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Mip 0, layer 0 of a color image.
pub fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Record a layout transition of `image` into `cmd`.
pub unsafe fn record_image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    transition: &LayoutTransition,
) {
    device.cmd_pipeline_barrier(
        cmd,
        transition.src_stage,
        transition.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[transition.barrier(image)],
    );
}

/// Command buffer manager with per-frame pools.
pub struct CommandManager {
    frames: Vec<FrameCommands>,
    graphics_pool: vk::CommandPool,
    transfer_pool: vk::CommandPool,
    device: ash::Device,
}

impl CommandManager {
    /// Create a command manager with one pool per frame slot.
    pub unsafe fn new(ctx: &VulkanContext, frames_in_flight: usize) -> Result<Self> {
        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(ctx.graphics_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            let pool = ctx
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            let primary = match ctx.device.allocate_command_buffers(&alloc_info) {
                Ok(buffers) => buffers[0],
                Err(e) => {
                    ctx.device.destroy_command_pool(pool, None);
                    return Err(e).context("Failed to allocate command buffer");
                }
            };

            frames.push(FrameCommands { pool, primary });
        }

        let graphics_pool = Self::create_transient_pool(ctx, ctx.graphics_family)?;
        let transfer_pool = Self::create_transient_pool(ctx, ctx.transfer_family)?;

        Ok(Self {
            frames,
            graphics_pool,
            transfer_pool,
            device: ctx.device.clone(),
        })
    }

    unsafe fn create_transient_pool(ctx: &VulkanContext, family: u32) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        ctx.device
            .create_command_pool(&info, None)
            .context("Failed to create transient pool")
    }

    fn transient_pool(&self, kind: QueueKind) -> vk::CommandPool {
        match kind {
            QueueKind::Graphics => self.graphics_pool,
            QueueKind::Transfer => self.transfer_pool,
        }
    }

    /// Number of frame slots.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Reset and begin the primary buffer of the token's slot.
    pub unsafe fn begin_frame(&self, token: &FrameToken) -> Result<vk::CommandBuffer> {
        let frame = &self.frames[token.slot()];

        self.device
            .reset_command_buffer(frame.primary, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset command buffer")?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        self.device
            .begin_command_buffer(frame.primary, &begin_info)
            .context("Failed to begin command buffer")?;

        Ok(frame.primary)
    }

    /// End recording for the token's slot.
    pub unsafe fn end_frame(&self, token: &FrameToken) -> Result<()> {
        let frame = &self.frames[token.slot()];
        self.device
            .end_command_buffer(frame.primary)
            .context("Failed to end command buffer")
    }

    /// Submit the slot's commands to the graphics queue.
    pub unsafe fn submit_frame(
        &self,
        ctx: &VulkanContext,
        token: &FrameToken,
        wait_semaphore: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let frame = &self.frames[token.slot()];

        let wait_semaphores = [wait_semaphore];
        let wait_stages = [wait_stage];
        let signal_semaphores = [signal_semaphore];
        let command_buffers = [frame.primary];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        ctx.device
            .queue_submit(ctx.graphics_queue, &[submit_info], fence)
            .context("Failed to submit command buffer")
    }

    /// Begin a single-use command buffer on the given queue's transient pool.
    pub unsafe fn begin_single_time(&self, kind: QueueKind) -> Result<vk::CommandBuffer> {
        let pool = self.transient_pool(kind);
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self
            .device
            .allocate_command_buffers(&alloc_info)
            .context("Failed to allocate command buffer")?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(pool, &[cmd]);
            return Err(e).context("Failed to begin command buffer");
        }

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, waiting for the queue to idle.
    pub unsafe fn end_single_time(
        &self,
        ctx: &VulkanContext,
        kind: QueueKind,
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        let command_buffers = [cmd];
        let result = self.submit_and_wait_idle(ctx, kind, &command_buffers);
        self.device
            .free_command_buffers(self.transient_pool(kind), &command_buffers);
        result
    }

    unsafe fn submit_and_wait_idle(
        &self,
        ctx: &VulkanContext,
        kind: QueueKind,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<()> {
        self.device
            .end_command_buffer(command_buffers[0])
            .context("Failed to end command buffer")?;

        let queue = ctx.queue(kind);
        let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);

        ctx.device
            .queue_submit(queue, &[submit_info], vk::Fence::null())
            .context("Failed to submit command buffer")?;

        ctx.device
            .queue_wait_idle(queue)
            .context("Failed to wait for queue")
    }

    /// End and submit a single-use command buffer, waiting on a dedicated fence.
    ///
    /// Unlike [`end_single_time`](Self::end_single_time) this leaves other work
    /// on the queue alone.
    pub unsafe fn end_single_time_fenced(
        &self,
        ctx: &VulkanContext,
        kind: QueueKind,
        cmd: vk::CommandBuffer,
    ) -> Result<()> {
        let command_buffers = [cmd];
        let result = self.submit_and_wait_fence(ctx, kind, &command_buffers);
        self.device
            .free_command_buffers(self.transient_pool(kind), &command_buffers);
        result
    }

    unsafe fn submit_and_wait_fence(
        &self,
        ctx: &VulkanContext,
        kind: QueueKind,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<()> {
        self.device
            .end_command_buffer(command_buffers[0])
            .context("Failed to end command buffer")?;

        let fence = self
            .device
            .create_fence(&vk::FenceCreateInfo::default(), None)
            .context("Failed to create fence")?;

        let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);
        let result = ctx
            .device
            .queue_submit(ctx.queue(kind), &[submit_info], fence)
            .context("Failed to submit command buffer")
            .and_then(|()| {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .context("Failed to wait for fence")
            });

        self.device.destroy_fence(fence, None);
        result
    }

    /// Record `record` into a one-shot buffer on `kind` and wait for it.
    pub unsafe fn execute_single_time<F>(&self, ctx: &VulkanContext, kind: QueueKind, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.begin_single_time(kind)?;
        record(cmd);
        trace!(?kind, "Submitting one-shot command buffer");
        self.end_single_time(ctx, kind, cmd)
    }

    /// Destroy all command pools.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        for frame in self.frames.drain(..) {
            ctx.device.destroy_command_pool(frame.pool, None);
        }
        ctx.device.destroy_command_pool(self.graphics_pool, None);
        ctx.device.destroy_command_pool(self.transfer_pool, None);
        self.graphics_pool = vk::CommandPool::null();
        self.transfer_pool = vk::CommandPool::null();
    }
}
