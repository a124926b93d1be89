//! Acceleration structure management for ray tracing.
//!
//! Bottom-level structures are built over procedural AABB geometry, top-level
//! structures over instances of them. The registry owns both kinds; a TLAS
//! only records which BLAS handles it references, and [`destroy`] tears the
//! TLAS set down before the BLAS set.
//!
//! Every build is submitted on its own one-shot command buffer and waited on,
//! so scratch and input buffers are freed only after the GPU is done.
//!
//! [`destroy`]: AccelerationStructureRegistry::destroy

use ash::khr::acceleration_structure;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use crate::error::{RenderError, Result, VkResultExt};
use crate::vulkan::{Buffer, CommandManager, MemoryManager, QueueKind, VulkanContext};

/// Axis-aligned box in the layout of `VkAabbPositionsKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

/// Row-major 3x4 identity transform.
pub const IDENTITY_TRANSFORM: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Handle to a bottom-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlasHandle(usize);

/// Handle to a top-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlasHandle(usize);

/// Bottom-level acceleration structure (BLAS).
struct Blas {
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
    device_address: vk::DeviceAddress,
}

/// Top-level acceleration structure (TLAS).
struct Tlas {
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
    instances: Vec<BlasHandle>,
}

/// Instance record in the layout of `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl RtInstance {
    /// Instance of the BLAS at `blas_address`: mask 0xFF, hit group 0,
    /// custom index 0, face culling disabled.
    pub fn new(transform: [[f32; 4]; 3], blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: 0xFF << 24,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
        .with_sbt_offset(0, vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE)
    }

    /// Set the visibility mask.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask =
            ((mask as u32) << 24) | (self.instance_custom_index_and_mask & 0xFF_FFFF);
        self
    }

    /// Set the 24-bit custom index reported to shaders.
    pub fn with_custom_index(mut self, index: u32) -> Self {
        self.instance_custom_index_and_mask =
            (self.instance_custom_index_and_mask & 0xFF00_0000) | (index & 0xFF_FFFF);
        self
    }

    /// Set the SBT offset and flags.
    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags =
            ((flags.as_raw() & 0xFF) << 24) | (offset & 0xFF_FFFF);
        self
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFF_FFFF
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFF_FFFF
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }

    pub fn blas_address(&self) -> vk::DeviceAddress {
        self.acceleration_structure_reference
    }
}

/// Pack (BLAS address, transform) pairs into instance records.
///
/// An empty list is rejected: a TLAS must reference at least one instance.
pub fn pack_instances(instances: &[(vk::DeviceAddress, [[f32; 4]; 3])]) -> Result<Vec<RtInstance>> {
    if instances.is_empty() {
        return Err(RenderError::EmptyInstanceList);
    }

    instances
        .iter()
        .enumerate()
        .map(|(i, &(address, transform))| {
            if address == 0 {
                return Err(RenderError::Other(format!(
                    "instance {i} references a null bottom-level address"
                )));
            }
            Ok(RtInstance::new(transform, address).with_custom_index(i as u32))
        })
        .collect()
}

/// A built structure and the buffer backing it.
struct Built {
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
    device_address: vk::DeviceAddress,
}

/// Owns every acceleration structure of the scene.
pub struct AccelerationStructureRegistry {
    loader: acceleration_structure::Device,
    min_scratch_alignment: u64,
    max_instance_count: u64,
    blas_map: HashMap<BlasHandle, Blas>,
    tlas_map: HashMap<TlasHandle, Tlas>,
    next_id: usize,
}

impl AccelerationStructureRegistry {
    pub fn new(ctx: &VulkanContext) -> Self {
        Self {
            loader: ctx.rt.acceleration_structure.clone(),
            min_scratch_alignment: ctx.rt.properties.min_scratch_offset_alignment as u64,
            max_instance_count: ctx.rt.properties.max_instance_count,
            blas_map: HashMap::new(),
            tlas_map: HashMap::new(),
            next_id: 0,
        }
    }

    /// Upload `aabbs` and build a BLAS over them.
    pub unsafe fn build_blas_from_aabbs(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        aabbs: &[Aabb],
    ) -> Result<BlasHandle> {
        let geometry = memory.upload_staged(
            ctx,
            commands,
            aabbs,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "blas aabbs",
        )?;
        self.build_blas_aabbs(ctx, memory, commands, geometry, aabbs.len() as u32)
    }

    /// Build a BLAS over `count` AABBs stored in `geometry`.
    ///
    /// The geometry buffer is consumed and freed once the build has completed.
    #[instrument(skip_all, fields(count = count))]
    pub unsafe fn build_blas_aabbs(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        mut geometry: Buffer,
        count: u32,
    ) -> Result<BlasHandle> {
        let result = geometry.address().and_then(|address| {
            let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(vk::DeviceOrHostAddressConstKHR { device_address: address })
                .stride(std::mem::size_of::<Aabb>() as vk::DeviceSize);

            let geometries = [vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                .flags(vk::GeometryFlagsKHR::OPAQUE)];

            self.build(
                ctx,
                memory,
                commands,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                &geometries,
                count,
                "blas",
            )
        });

        memory.destroy_buffer(&mut geometry);
        let built = result?;

        let handle = BlasHandle(self.next_id);
        self.next_id += 1;

        info!(?handle, address = built.device_address, aabbs = count, "Built BLAS");

        self.blas_map.insert(
            handle,
            Blas {
                handle: built.handle,
                buffer: built.buffer,
                device_address: built.device_address,
            },
        );

        Ok(handle)
    }

    /// Build a TLAS with one instance per (BLAS, transform) pair.
    #[instrument(skip_all, fields(instances = instances.len()))]
    pub unsafe fn build_tlas(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        instances: &[(BlasHandle, [[f32; 4]; 3])],
    ) -> Result<TlasHandle> {
        let addressed = instances
            .iter()
            .map(|&(blas, transform)| Ok((self.blas_address(blas)?, transform)))
            .collect::<Result<Vec<_>>>()?;

        let packed = pack_instances(&addressed)?;
        if packed.len() as u64 > self.max_instance_count {
            return Err(RenderError::Unsupported(format!(
                "{} instances exceed the device limit of {}",
                packed.len(),
                self.max_instance_count
            )));
        }

        let mut instance_buffer = memory.upload_staged(
            ctx,
            commands,
            &packed,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "tlas instances",
        )?;

        let result = instance_buffer.address().and_then(|address| {
            let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: address });

            let geometries = [vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data })
                .flags(vk::GeometryFlagsKHR::OPAQUE)];

            self.build(
                ctx,
                memory,
                commands,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                &geometries,
                packed.len() as u32,
                "tlas",
            )
        });

        memory.destroy_buffer(&mut instance_buffer);
        let built = result?;

        let handle = TlasHandle(self.next_id);
        self.next_id += 1;

        info!(?handle, instances = packed.len(), "Built TLAS");

        self.tlas_map.insert(
            handle,
            Tlas {
                handle: built.handle,
                buffer: built.buffer,
                instances: instances.iter().map(|&(blas, _)| blas).collect(),
            },
        );

        Ok(handle)
    }

    /// Size query, storage and scratch allocation, then a blocking build.
    #[allow(clippy::too_many_arguments)]
    unsafe fn build(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        ty: vk::AccelerationStructureTypeKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR<'_>],
        primitive_count: u32,
        name: &str,
    ) -> Result<Built> {
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut size_info,
        );

        debug!(
            name,
            storage = size_info.acceleration_structure_size,
            scratch = size_info.build_scratch_size,
            "Acceleration structure sizes"
        );

        let mut storage = memory.create_buffer(
            size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.handle)
            .size(size_info.acceleration_structure_size)
            .ty(ty);

        let handle = match self.loader.create_acceleration_structure(&create_info, None) {
            Ok(handle) => handle,
            Err(e) => {
                memory.destroy_buffer(&mut storage);
                return Err(e).context("Failed to create acceleration structure");
            }
        };

        let built = self.record_build(ctx, memory, commands, build_info, handle, &size_info, primitive_count);

        if let Err(e) = built {
            self.loader.destroy_acceleration_structure(handle, None);
            memory.destroy_buffer(&mut storage);
            return Err(e);
        }

        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        let device_address = self.loader.get_acceleration_structure_device_address(&addr_info);

        Ok(Built {
            handle,
            buffer: storage,
            device_address,
        })
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn record_build(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        build_info: vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        handle: vk::AccelerationStructureKHR,
        size_info: &vk::AccelerationStructureBuildSizesInfoKHR<'_>,
        primitive_count: u32,
    ) -> Result<()> {
        let mut scratch = memory.create_buffer_aligned(
            size_info.build_scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            self.min_scratch_alignment,
            "as scratch",
        )?;

        let result = scratch.address().and_then(|scratch_address| {
            let build_infos = [build_info
                .dst_acceleration_structure(handle)
                .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address })];

            let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(primitive_count)];
            let range_slices: [&[vk::AccelerationStructureBuildRangeInfoKHR]; 1] = [&ranges];

            commands.execute_single_time(ctx, QueueKind::Graphics, |cmd| {
                self.loader
                    .cmd_build_acceleration_structures(cmd, &build_infos, &range_slices);
            })
        });

        memory.destroy_buffer(&mut scratch);
        result
    }

    /// Device address of a BLAS, as referenced by instance records.
    pub fn blas_address(&self, handle: BlasHandle) -> Result<vk::DeviceAddress> {
        self.blas_map
            .get(&handle)
            .map(|blas| blas.device_address)
            .ok_or_else(|| RenderError::UnknownHandle(format!("{handle:?}")))
    }

    /// Vulkan handle of a TLAS, for descriptor writes.
    pub fn tlas(&self, handle: TlasHandle) -> Result<vk::AccelerationStructureKHR> {
        self.tlas_map
            .get(&handle)
            .map(|tlas| tlas.handle)
            .ok_or_else(|| RenderError::UnknownHandle(format!("{handle:?}")))
    }

    /// BLAS handles referenced by a TLAS, in instance order.
    pub fn tlas_instances(&self, handle: TlasHandle) -> Result<&[BlasHandle]> {
        self.tlas_map
            .get(&handle)
            .map(|tlas| tlas.instances.as_slice())
            .ok_or_else(|| RenderError::UnknownHandle(format!("{handle:?}")))
    }

    pub fn blas_count(&self) -> usize {
        self.blas_map.len()
    }

    pub fn tlas_count(&self) -> usize {
        self.tlas_map.len()
    }

    /// Destroy all acceleration structures, top-level first.
    pub unsafe fn destroy(&mut self, memory: &MemoryManager) {
        for (_, mut tlas) in self.tlas_map.drain() {
            self.loader.destroy_acceleration_structure(tlas.handle, None);
            memory.destroy_buffer(&mut tlas.buffer);
        }

        for (_, mut blas) in self.blas_map.drain() {
            self.loader.destroy_acceleration_structure(blas.handle, None);
            memory.destroy_buffer(&mut blas.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Binary layouts
    // ============================================================

    #[test]
    fn test_aabb_matches_vk_layout() {
        assert_eq!(
            std::mem::size_of::<Aabb>(),
            std::mem::size_of::<vk::AabbPositionsKHR>()
        );
        let aabb = Aabb { min: [1.0, 2.0, 3.0], max: [4.0, 5.0, 6.0] };
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&aabb));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_instance_matches_vk_layout() {
        assert_eq!(std::mem::size_of::<RtInstance>(), 64);
        assert_eq!(
            std::mem::size_of::<RtInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_instance_field_offsets() {
        let instance = RtInstance::new(IDENTITY_TRANSFORM, 0x1234_5678_9ABC_DEF0)
            .with_custom_index(7)
            .with_mask(0x0F);
        let bytes: &[u8] = bytemuck::bytes_of(&instance);
        let transform: &[f32] = bytemuck::cast_slice(&bytes[..48]);
        assert_eq!(transform[0], 1.0);
        assert_eq!(transform[5], 1.0);
        assert_eq!(transform[10], 1.0);
        assert_eq!(transform[3], 0.0);
        assert_eq!(u32::from_ne_bytes(bytes[48..52].try_into().unwrap()), 0x0F00_0007);
        assert_eq!(
            u64::from_ne_bytes(bytes[56..64].try_into().unwrap()),
            0x1234_5678_9ABC_DEF0
        );
    }

    // ============================================================
    // RtInstance packing
    // ============================================================

    #[test]
    fn test_new_instance_defaults() {
        let instance = RtInstance::new(IDENTITY_TRANSFORM, 42);
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.custom_index(), 0);
        assert_eq!(instance.sbt_offset(), 0);
        assert_eq!(
            instance.flags(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
        );
        assert_eq!(instance.blas_address(), 42);
    }

    #[test]
    fn test_mask_and_custom_index_independent() {
        let instance = RtInstance::new(IDENTITY_TRANSFORM, 1)
            .with_custom_index(0xABCDEF)
            .with_mask(0x3C);
        assert_eq!(instance.mask(), 0x3C);
        assert_eq!(instance.custom_index(), 0xABCDEF);

        let instance = instance.with_custom_index(0x1FF_FFFF);
        assert_eq!(instance.custom_index(), 0xFF_FFFF);
        assert_eq!(instance.mask(), 0x3C);
    }

    #[test]
    fn test_sbt_offset_and_flags_independent() {
        let instance = RtInstance::new(IDENTITY_TRANSFORM, 1)
            .with_sbt_offset(5, vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
        assert_eq!(instance.sbt_offset(), 5);
        assert_eq!(instance.flags(), vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
    }

    // ============================================================
    // pack_instances
    // ============================================================

    #[test]
    fn test_empty_instance_list_rejected() {
        assert!(matches!(pack_instances(&[]), Err(RenderError::EmptyInstanceList)));
    }

    #[test]
    fn test_pack_references_every_address() {
        let input: Vec<_> = (1..=5u64).map(|i| (i * 0x100, IDENTITY_TRANSFORM)).collect();
        let packed = pack_instances(&input).unwrap();
        assert_eq!(packed.len(), 5);
        for (i, instance) in packed.iter().enumerate() {
            assert_eq!(instance.blas_address(), (i as u64 + 1) * 0x100);
            assert_eq!(instance.custom_index(), i as u32);
            assert_eq!(instance.mask(), 0xFF);
        }
    }

    #[test]
    fn test_pack_keeps_transform() {
        let mut transform = IDENTITY_TRANSFORM;
        transform[0][3] = 10.0;
        let packed = pack_instances(&[(0x1000, transform)]).unwrap();
        assert_eq!(packed[0].transform[0][3], 10.0);
    }

    #[test]
    fn test_pack_rejects_null_address() {
        let input = [(0x1000, IDENTITY_TRANSFORM), (0, IDENTITY_TRANSFORM)];
        assert!(pack_instances(&input).is_err());
    }
}
