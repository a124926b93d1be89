//! GPU memory management using gpu-allocator.

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::commands::{color_subresource_range, CommandManager, QueueKind};
use super::VulkanContext;
use crate::error::{RenderError, Result, VkResultExt};

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// CPU view of the buffer, `None` for GPU-only memory.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|a| a.mapped_slice())
    }

    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut().and_then(|a| a.mapped_slice_mut())
    }

    /// Copy `data` to the start of a host-visible buffer.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mapped = self
            .mapped_slice_mut()
            .ok_or_else(|| RenderError::Other("buffer is not host visible".into()))?;

        if bytes.len() > mapped.len() {
            return Err(RenderError::Other(format!(
                "write of {} bytes overflows buffer of {} bytes",
                bytes.len(),
                mapped.len()
            )));
        }

        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read the first `count` elements of a host-visible buffer.
    pub fn read<T: Pod>(&self, count: usize) -> Result<Vec<T>> {
        let mapped = self
            .mapped_slice()
            .ok_or_else(|| RenderError::Other("buffer is not host visible".into()))?;

        let len = count * std::mem::size_of::<T>();
        if len > mapped.len() {
            return Err(RenderError::Other(format!(
                "read of {} bytes overflows buffer of {} bytes",
                len,
                mapped.len()
            )));
        }

        Ok(bytemuck::pod_collect_to_vec(&mapped[..len]))
    }

    /// Device address, for buffers created with SHADER_DEVICE_ADDRESS.
    pub fn address(&self) -> Result<vk::DeviceAddress> {
        self.device_address
            .ok_or_else(|| RenderError::Other("buffer has no device address".into()))
    }

    pub fn is_null(&self) -> bool {
        self.handle == vk::Buffer::null()
    }
}

/// 2D GPU image with a color view.
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Image {
    pub fn is_null(&self) -> bool {
        self.handle == vk::Image::null()
    }
}

/// Queue families that share buffers: one entry means exclusive ownership.
pub fn sharing_families(graphics_family: u32, transfer_family: u32) -> Vec<u32> {
    if graphics_family == transfer_family {
        vec![graphics_family]
    } else {
        vec![graphics_family, transfer_family]
    }
}

/// Raise the alignment of `requirements` to at least `min_alignment`.
pub fn with_min_alignment(mut requirements: vk::MemoryRequirements, min_alignment: u64) -> vk::MemoryRequirements {
    requirements.alignment = requirements.alignment.max(min_alignment.max(1));
    requirements
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Mutex<Allocator>,
    device: ash::Device,
    queue_families: Vec<u32>,
    live_buffers: AtomicUsize,
    live_images: AtomicUsize,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Mutex::new(allocator),
            device: ctx.device.clone(),
            queue_families: sharing_families(ctx.graphics_family, ctx.transfer_family),
            live_buffers: AtomicUsize::new(0),
            live_images: AtomicUsize::new(0),
        })
    }

    /// Create a buffer with the specified usage and memory location.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        self.create_buffer_aligned(size, usage, location, 1, name)
    }

    /// Create a buffer whose memory offset is a multiple of `min_alignment`.
    pub unsafe fn create_buffer_aligned(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        min_alignment: u64,
        name: &str,
    ) -> Result<Buffer> {
        let mut buffer_info = vk::BufferCreateInfo::default().size(size).usage(usage);

        buffer_info = if self.queue_families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&self.queue_families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?;

        let requirements = with_min_alignment(
            self.device.get_buffer_memory_requirements(handle),
            min_alignment,
        );

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(e).context("Failed to bind buffer memory");
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        self.live_buffers.fetch_add(1, Ordering::Relaxed);

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Create a staging buffer (CPU-visible, transfer source).
    pub unsafe fn create_staging_buffer(&self, size: vk::DeviceSize, name: &str) -> Result<Buffer> {
        self.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu, name)
    }

    /// Create a uniform buffer (CPU-visible for per-frame updates).
    pub unsafe fn create_uniform_buffer(&self, size: vk::DeviceSize, name: &str) -> Result<Buffer> {
        self.create_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER, MemoryLocation::CpuToGpu, name)
    }

    /// Upload `data` into a new GPU-only buffer through a staging copy on the transfer queue.
    pub unsafe fn upload_staged<T: Pod>(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;
        if size == 0 {
            return Err(RenderError::Other(format!("cannot upload empty buffer {name}")));
        }

        let mut staging = self.create_staging_buffer(size, &format!("{name} staging"))?;
        if let Err(e) = staging.write(bytes) {
            self.destroy_buffer(&mut staging);
            return Err(e);
        }

        let mut buffer = match self.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.destroy_buffer(&mut staging);
                return Err(e);
            }
        };

        let result = commands.execute_single_time(ctx, QueueKind::Transfer, |cmd| {
            let region = vk::BufferCopy::default().size(size);
            self.device
                .cmd_copy_buffer(cmd, staging.handle, buffer.handle, &[region]);
        });

        self.destroy_buffer(&mut staging);

        match result {
            Ok(()) => {
                debug!(name, size, "Uploaded buffer");
                Ok(buffer)
            }
            Err(e) => {
                self.destroy_buffer(&mut buffer);
                Err(e)
            }
        }
    }

    /// Copy `count` elements from the start of a TRANSFER_SRC buffer back to the host.
    pub unsafe fn read_back<T: Pod>(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        source: &Buffer,
        count: usize,
    ) -> Result<Vec<T>> {
        let size = (count * std::mem::size_of::<T>()) as vk::DeviceSize;
        if size > source.size {
            return Err(RenderError::Other(format!(
                "read back of {} bytes overflows buffer of {} bytes",
                size, source.size
            )));
        }

        let mut readback = self.create_buffer(
            size.max(1),
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback",
        )?;

        let result = commands
            .execute_single_time(ctx, QueueKind::Transfer, |cmd| {
                let region = vk::BufferCopy::default().size(size.max(1));
                self.device
                    .cmd_copy_buffer(cmd, source.handle, readback.handle, &[region]);
            })
            .and_then(|()| readback.read::<T>(count));

        self.destroy_buffer(&mut readback);
        result
    }

    /// Create a single-mip 2D image with a color view.
    pub unsafe fn create_image_2d(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self
            .device
            .create_image(&image_info, None)
            .context("Failed to create image")?;

        let requirements = self.device.get_image_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e.into());
            }
        };

        let bound = self
            .device
            .bind_image_memory(handle, allocation.memory(), allocation.offset())
            .context("Failed to bind image memory");

        let view = bound.and_then(|()| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(handle)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(color_subresource_range());

            self.device
                .create_image_view(&view_info, None)
                .context("Failed to create image view")
        });

        let view = match view {
            Ok(view) => view,
            Err(e) => {
                self.device.destroy_image(handle, None);
                let _ = self.allocator.lock().free(allocation);
                return Err(e);
            }
        };

        self.live_images.fetch_add(1, Ordering::Relaxed);

        Ok(Image {
            handle,
            view,
            allocation: Some(allocation),
            format,
            extent,
        })
    }

    /// Destroy a buffer. Destroying an already destroyed buffer is a no-op.
    pub unsafe fn destroy_buffer(&self, buffer: &mut Buffer) {
        if buffer.is_null() {
            return;
        }
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation.take() {
            let _ = self.allocator.lock().free(allocation);
        }
        buffer.handle = vk::Buffer::null();
        buffer.device_address = None;
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Destroy an image and its view. Destroying an already destroyed image is a no-op.
    pub unsafe fn destroy_image(&self, image: &mut Image) {
        if image.is_null() {
            return;
        }
        self.device.destroy_image_view(image.view, None);
        self.device.destroy_image(image.handle, None);
        if let Some(allocation) = image.allocation.take() {
            let _ = self.allocator.lock().free(allocation);
        }
        image.handle = vk::Image::null();
        image.view = vk::ImageView::null();
        self.live_images.fetch_sub(1, Ordering::Relaxed);
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffer_count(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }

    /// Images created and not yet destroyed.
    pub fn live_image_count(&self) -> usize {
        self.live_images.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // sharing_families
    // ============================================================

    #[test]
    fn test_same_family_is_exclusive() {
        assert_eq!(sharing_families(0, 0), vec![0]);
    }

    #[test]
    fn test_distinct_families_are_shared() {
        assert_eq!(sharing_families(0, 2), vec![0, 2]);
    }

    // ============================================================
    // with_min_alignment
    // ============================================================

    fn requirements(alignment: u64) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 4096,
            alignment,
            memory_type_bits: 0xF,
        }
    }

    #[test]
    fn test_alignment_raised_to_minimum() {
        let r = with_min_alignment(requirements(16), 64);
        assert_eq!(r.alignment, 64);
        assert_eq!(r.size, 4096);
        assert_eq!(r.memory_type_bits, 0xF);
    }

    #[test]
    fn test_larger_alignment_kept() {
        assert_eq!(with_min_alignment(requirements(256), 64).alignment, 256);
    }

    #[test]
    fn test_zero_minimum_is_ignored() {
        assert_eq!(with_min_alignment(requirements(4), 0).alignment, 4);
    }

    // ============================================================
    // Buffer host access
    // ============================================================

    fn unbacked_buffer() -> Buffer {
        Buffer {
            handle: vk::Buffer::null(),
            allocation: None,
            size: 64,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            device_address: None,
        }
    }

    #[test]
    fn test_write_without_mapping_fails() {
        let mut buffer = unbacked_buffer();
        assert!(buffer.write(&[1u32, 2, 3]).is_err());
        assert!(buffer.read::<u32>(1).is_err());
    }

    #[test]
    fn test_missing_device_address_is_error() {
        assert!(unbacked_buffer().address().is_err());
        assert!(unbacked_buffer().is_null());
    }
}
