//! Descriptor set layout, pool and writes for the ray tracing pipeline.
//!
//! Every frame slot gets its own set with the same four bindings.

use ash::vk;

use super::VulkanContext;
use crate::error::{Result, VkResultExt};

/// Bindings of the single descriptor set used by the ray tracing shaders.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    /// Top-level acceleration structure
    AccelerationStructure = 0,
    /// Storage image written by the raygen shader
    OutputImage = 1,
    /// Camera uniform block
    Camera = 2,
    /// Voxel occupancy buffer read by the intersection shader
    Voxels = 3,
}

impl Binding {
    pub const ALL: [Binding; 4] = [
        Binding::AccelerationStructure,
        Binding::OutputImage,
        Binding::Camera,
        Binding::Voxels,
    ];

    pub const fn index(self) -> u32 {
        self as u32
    }

    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Binding::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            Binding::OutputImage => vk::DescriptorType::STORAGE_IMAGE,
            Binding::Camera => vk::DescriptorType::UNIFORM_BUFFER,
            Binding::Voxels => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    pub fn stages(self) -> vk::ShaderStageFlags {
        match self {
            Binding::Voxels => vk::ShaderStageFlags::INTERSECTION_KHR,
            _ => vk::ShaderStageFlags::RAYGEN_KHR,
        }
    }

    pub fn layout_binding(self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.index())
            .descriptor_type(self.descriptor_type())
            .descriptor_count(1)
            .stage_flags(self.stages())
    }
}

/// Pool capacity for `set_count` sets of [`Binding::ALL`].
pub fn pool_sizes(set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    Binding::ALL
        .iter()
        .map(|binding| vk::DescriptorPoolSize {
            ty: binding.descriptor_type(),
            descriptor_count: set_count,
        })
        .collect()
}

/// Manages the descriptor pool, the set layout and set updates.
pub struct DescriptorManager {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    device: ash::Device,
}

impl DescriptorManager {
    /// Create the layout and a pool sized for `set_count` sets.
    pub unsafe fn new(ctx: &VulkanContext, set_count: u32) -> Result<Self> {
        let bindings: Vec<_> = Binding::ALL.iter().map(|b| b.layout_binding()).collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = ctx
            .device
            .create_descriptor_set_layout(&layout_info, None)
            .context("Failed to create descriptor set layout")?;

        let sizes = pool_sizes(set_count);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&sizes)
            .max_sets(set_count);

        let pool = match ctx.device.create_descriptor_pool(&pool_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                ctx.device.destroy_descriptor_set_layout(layout, None);
                return Err(e).context("Failed to create descriptor pool");
            }
        };

        Ok(Self {
            pool,
            layout,
            device: ctx.device.clone(),
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Allocate `count` sets with the shared layout.
    pub unsafe fn allocate_sets(&self, count: u32) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![self.layout; count as usize];

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        self.device
            .allocate_descriptor_sets(&alloc_info)
            .context("Failed to allocate descriptor sets")
    }

    /// Bind the top-level acceleration structure.
    pub unsafe fn write_acceleration_structure(
        &self,
        set: vk::DescriptorSet,
        tlas: vk::AccelerationStructureKHR,
    ) {
        let structures = [tlas];
        let mut as_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);

        // The count is not implied by an image or buffer info here
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(Binding::AccelerationStructure.index())
            .dst_array_element(0)
            .descriptor_type(Binding::AccelerationStructure.descriptor_type())
            .descriptor_count(1)
            .push_next(&mut as_info);

        self.device.update_descriptor_sets(&[write], &[]);
    }

    /// Bind the output storage image, expected in GENERAL layout.
    pub unsafe fn write_storage_image(&self, set: vk::DescriptorSet, view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::GENERAL,
        };

        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(Binding::OutputImage.index())
            .dst_array_element(0)
            .descriptor_type(Binding::OutputImage.descriptor_type())
            .image_info(std::slice::from_ref(&image_info));

        self.device.update_descriptor_sets(&[write], &[]);
    }

    /// Bind the camera uniform block.
    pub unsafe fn write_uniform_buffer(&self, set: vk::DescriptorSet, buffer: vk::Buffer, range: vk::DeviceSize) {
        self.write_buffer(set, Binding::Camera, buffer, range);
    }

    /// Bind the voxel storage buffer.
    pub unsafe fn write_storage_buffer(&self, set: vk::DescriptorSet, buffer: vk::Buffer, range: vk::DeviceSize) {
        self.write_buffer(set, Binding::Voxels, buffer, range);
    }

    unsafe fn write_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: Binding,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        };

        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding.index())
            .dst_array_element(0)
            .descriptor_type(binding.descriptor_type())
            .buffer_info(std::slice::from_ref(&buffer_info));

        self.device.update_descriptor_sets(&[write], &[]);
    }

    /// Destroy the pool (freeing its sets) and the layout.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        if self.pool != vk::DescriptorPool::null() {
            ctx.device.destroy_descriptor_pool(self.pool, None);
            self.pool = vk::DescriptorPool::null();
        }
        if self.layout != vk::DescriptorSetLayout::null() {
            ctx.device.destroy_descriptor_set_layout(self.layout, None);
            self.layout = vk::DescriptorSetLayout::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Binding
    // ============================================================

    #[test]
    fn test_binding_indices_are_sequential() {
        let indices: Vec<u32> = Binding::ALL.iter().map(|b| b.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_binding_types() {
        assert_eq!(
            Binding::AccelerationStructure.descriptor_type(),
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
        assert_eq!(Binding::OutputImage.descriptor_type(), vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(Binding::Camera.descriptor_type(), vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(Binding::Voxels.descriptor_type(), vk::DescriptorType::STORAGE_BUFFER);
    }

    #[test]
    fn test_binding_stages() {
        assert_eq!(Binding::AccelerationStructure.stages(), vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(Binding::OutputImage.stages(), vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(Binding::Camera.stages(), vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(Binding::Voxels.stages(), vk::ShaderStageFlags::INTERSECTION_KHR);
    }

    #[test]
    fn test_layout_binding_single_descriptor() {
        for binding in Binding::ALL {
            let layout = binding.layout_binding();
            assert_eq!(layout.binding, binding.index());
            assert_eq!(layout.descriptor_count, 1);
            assert_eq!(layout.descriptor_type, binding.descriptor_type());
        }
    }

    // ============================================================
    // pool_sizes
    // ============================================================

    #[test]
    fn test_pool_sizes_cover_every_binding() {
        let sizes = pool_sizes(3);
        assert_eq!(sizes.len(), 4);
        assert!(sizes.iter().all(|s| s.descriptor_count == 3));
        assert!(sizes
            .iter()
            .any(|s| s.ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
    }
}
