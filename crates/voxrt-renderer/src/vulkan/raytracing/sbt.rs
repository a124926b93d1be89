//! Shader Binding Table (SBT) management for ray tracing pipelines.
//!
//! Every shader group gets its own slot of `shaderGroupBaseAlignment` bytes,
//! so each region starts at `base + group_index * base_alignment`.

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::debug;

use super::align_up;
use super::pipeline::{first_group_in, groups_in, RayTracingPipeline, SbtRegion};
use crate::error::{RenderError, Result, VkResultExt};
use crate::vulkan::{Buffer, MemoryManager, RtDispatch, VulkanContext};

/// Byte layout of the table, computed from device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub handle_size_aligned: u64,
    pub base_alignment: u64,
    pub group_count: u64,
}

impl SbtLayout {
    pub fn compute(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        group_count: u32,
    ) -> Result<Self> {
        let handle_size = handle_size as u64;
        let handle_size_aligned = align_up(handle_size, handle_alignment as u64);
        let base_alignment = base_alignment as u64;

        if handle_size == 0 || base_alignment == 0 {
            return Err(RenderError::Unsupported(
                "device reports zero shader group handle size or base alignment".into(),
            ));
        }
        if handle_size_aligned > base_alignment {
            return Err(RenderError::Unsupported(format!(
                "aligned handle size {handle_size_aligned} exceeds base alignment {base_alignment}"
            )));
        }

        Ok(Self {
            handle_size,
            handle_size_aligned,
            base_alignment,
            group_count: group_count as u64,
        })
    }

    /// One base-aligned slot per group.
    pub fn buffer_size(&self) -> u64 {
        self.group_count * self.base_alignment
    }

    pub fn slot_offset(&self, group: usize) -> u64 {
        group as u64 * self.base_alignment
    }

    /// Place each tightly packed handle from `handles` at the start of its slot.
    pub fn scatter_handles(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = self.group_count as usize * handle_size;
        if handles.len() < expected {
            return Err(RenderError::Other(format!(
                "expected {expected} bytes of shader group handles, got {}",
                handles.len()
            )));
        }

        let mut table = vec![0u8; self.buffer_size() as usize];
        for (group, handle) in handles[..expected].chunks_exact(handle_size).enumerate() {
            let offset = self.slot_offset(group) as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }

    /// Strided region for `region` in a table starting at `base_address`.
    pub fn region(&self, region: SbtRegion, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        match first_group_in(region) {
            Some(group) => vk::StridedDeviceAddressRegionKHR {
                device_address: base_address + self.slot_offset(group),
                stride: self.handle_size_aligned,
                size: self.handle_size_aligned * groups_in(region) as u64,
            },
            None => vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

/// Shader Binding Table for ray tracing.
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub layout: SbtLayout,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Create a shader binding table from a ray tracing pipeline.
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        pipeline: &RayTracingPipeline,
    ) -> Result<Self> {
        let props = &ctx.rt.properties;
        let layout = SbtLayout::compute(
            props.shader_group_handle_size,
            props.shader_group_handle_alignment,
            props.shader_group_base_alignment,
            pipeline.group_count,
        )?;

        let handles = ctx
            .rt
            .pipeline
            .get_ray_tracing_shader_group_handles(
                pipeline.handle,
                0,
                pipeline.group_count,
                (layout.group_count * layout.handle_size) as usize,
            )
            .context("Failed to get shader group handles")?;

        let table = layout.scatter_handles(&handles)?;

        let mut buffer = memory.create_buffer_aligned(
            layout.buffer_size(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            layout.base_alignment,
            "shader binding table",
        )?;

        let base_address = match buffer.write(&table).and_then(|()| buffer.address()) {
            Ok(address) => address,
            Err(e) => {
                memory.destroy_buffer(&mut buffer);
                return Err(e);
            }
        };

        debug!(
            base_address,
            size = layout.buffer_size(),
            stride = layout.handle_size_aligned,
            "Shader binding table written"
        );

        Ok(Self {
            buffer,
            layout,
            raygen_region: layout.region(SbtRegion::Raygen, base_address),
            miss_region: layout.region(SbtRegion::Miss, base_address),
            hit_region: layout.region(SbtRegion::Hit, base_address),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    /// Record a trace rays command.
    pub unsafe fn trace_rays(
        &self,
        rt: &RtDispatch,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        rt.pipeline.cmd_trace_rays(
            cmd,
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            width,
            height,
            depth,
        );
    }

    /// Destroy the shader binding table.
    pub unsafe fn destroy(&mut self, memory: &MemoryManager) {
        memory.destroy_buffer(&mut self.buffer);
    }
}
