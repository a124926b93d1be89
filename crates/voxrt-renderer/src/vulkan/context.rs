//! Vulkan context: instance, physical device, logical device, and queues.

use ash::khr::{acceleration_structure, deferred_host_operations, ray_tracing_pipeline};
use ash::khr::{surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::borrow::Cow;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::commands::QueueKind;
use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION, VALIDATION_LAYER};
use crate::error::{RenderError, Result, VkResultExt};

/// Ray tracing limits of the selected physical device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub max_instance_count: u64,
    pub min_scratch_offset_alignment: u32,
}

/// Ray tracing extension entry points, loaded once per logical device.
#[derive(Clone)]
pub struct RtDispatch {
    pub acceleration_structure: acceleration_structure::Device,
    pub pipeline: ray_tracing_pipeline::Device,
    pub properties: RtProperties,
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Pick families from their properties.
    ///
    /// Graphics is the first family with GRAPHICS. Present prefers the graphics
    /// family. Transfer is the first family with TRANSFER but no GRAPHICS.
    pub fn from_properties<F>(families: &[vk::QueueFamilyProperties], supports_present: F) -> Self
    where
        F: Fn(u32) -> bool,
    {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            if family.queue_count == 0 {
                continue;
            }

            if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(i);
            }

            if indices.transfer.is_none()
                && family.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                indices.transfer = Some(i);
            }
        }

        indices.present = match indices.graphics {
            Some(g) if supports_present(g) => Some(g),
            _ => (0..families.len() as u32)
                .find(|&i| families[i as usize].queue_count > 0 && supports_present(i)),
        };

        indices
    }

    pub fn is_complete(&self, needs_present: bool) -> bool {
        self.graphics.is_some() && (!needs_present || self.present.is_some())
    }

    /// (graphics, present, transfer); present and transfer fall back to graphics.
    pub fn resolve(&self) -> Result<(u32, u32, u32)> {
        let graphics = self
            .graphics
            .ok_or_else(|| RenderError::Unsupported("No graphics queue family".into()))?;
        Ok((
            graphics,
            self.present.unwrap_or(graphics),
            self.transfer.unwrap_or(graphics),
        ))
    }
}

/// Rank a device that already passed the capability checks (higher is better).
pub fn score_device(device_type: vk::PhysicalDeviceType, device_local_mb: u64) -> u64 {
    let type_score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 10_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1_000,
        _ => 1,
    };
    type_score + device_local_mb.min(99_999) / 100
}

/// Main Vulkan context holding all core Vulkan objects.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,

    // Queues (transfer falls back to graphics without a dedicated family)
    pub graphics_family: u32,
    pub present_family: u32,
    pub transfer_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub transfer_queue: vk::Queue,

    // Presentation loaders, absent on headless contexts
    surface_loader: Option<surface::Instance>,
    swapchain_loader: Option<swapchain::Device>,

    pub rt: RtDispatch,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    validation_errors: Arc<AtomicUsize>,
}

impl VulkanContext {
    /// Create a context able to present to `window`, returning the window surface.
    ///
    /// # Safety
    /// The window must outlive the returned surface.
    pub unsafe fn with_window(
        window: &winit::window::Window,
        enable_validation: bool,
    ) -> Result<(Self, vk::SurfaceKHR)> {
        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::Window(format!("Failed to get display handle: {e}")))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::Window(format!("Failed to get window handle: {e}")))?
            .as_raw();

        let (ctx, surface) = Self::init(Some((display_handle, window_handle)), enable_validation)?;
        let surface = surface.ok_or_else(|| RenderError::Window("surface was not created".into()))?;
        Ok((ctx, surface))
    }

    /// Create a context without any presentation support.
    pub unsafe fn headless(enable_validation: bool) -> Result<Self> {
        Self::init(None, enable_validation).map(|(ctx, _)| ctx)
    }

    unsafe fn init(
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
        enable_validation: bool,
    ) -> Result<(Self, Option<vk::SurfaceKHR>)> {
        let entry = Entry::load()?;

        let api_version = entry
            .try_enumerate_instance_version()
            .context("Failed to enumerate instance version")?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(RenderError::Unsupported(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let validation = enable_validation && Self::validation_layer_available(&entry);
        if enable_validation && !validation {
            warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }

        let instance = Self::create_instance(&entry, window.map(|(display, _)| display), validation)?;

        let validation_errors = Arc::new(AtomicUsize::new(0));
        let surface_loader = window.map(|_| surface::Instance::new(&entry, &instance));
        let mut debug_utils = None;
        let mut surface = None;

        let created = Self::create_device_objects(
            &entry,
            &instance,
            window,
            validation,
            &validation_errors,
            surface_loader.as_ref(),
            &mut debug_utils,
            &mut surface,
        );

        let (device, physical_device, properties, (graphics_family, present_family, transfer_family)) =
            match created {
                Ok(created) => created,
                Err(e) => {
                    if let (Some(loader), Some(surface)) = (&surface_loader, surface) {
                        loader.destroy_surface(surface, None);
                    }
                    if let Some((loader, messenger)) = &debug_utils {
                        loader.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

        let device_properties = instance.get_physical_device_properties(physical_device);

        let graphics_queue = device.get_device_queue(graphics_family, 0);
        let present_queue = device.get_device_queue(present_family, 0);
        let transfer_queue = device.get_device_queue(transfer_family, 0);

        let swapchain_loader = surface.map(|_| swapchain::Device::new(&instance, &device));

        let rt = RtDispatch {
            acceleration_structure: acceleration_structure::Device::new(&instance, &device),
            pipeline: ray_tracing_pipeline::Device::new(&instance, &device),
            properties,
        };

        debug!(
            graphics_family,
            present_family, transfer_family, "Queue families resolved"
        );

        Ok((
            Self {
                entry,
                instance,
                physical_device,
                device,
                graphics_family,
                present_family,
                transfer_family,
                graphics_queue,
                present_queue,
                transfer_queue,
                surface_loader,
                swapchain_loader,
                rt,
                device_properties,
                debug_utils,
                validation_errors,
            },
            surface,
        ))
    }

    /// Everything between the instance and the logical device. Objects created
    /// here are handed back through `debug_utils` and `surface` even on failure.
    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    unsafe fn create_device_objects(
        entry: &Entry,
        instance: &Instance,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
        validation: bool,
        validation_errors: &Arc<AtomicUsize>,
        surface_loader: Option<&surface::Instance>,
        debug_utils: &mut Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
        surface: &mut Option<vk::SurfaceKHR>,
    ) -> Result<(Device, vk::PhysicalDevice, RtProperties, (u32, u32, u32))> {
        if validation {
            *debug_utils = Some(Self::setup_debug_messenger(entry, instance, validation_errors)?);
        }

        if let Some((display, handle)) = window {
            *surface = Some(
                ash_window::create_surface(entry, instance, display, handle, None)
                    .context("Failed to create Vulkan surface")?,
            );
        }

        let (physical_device, families, properties) =
            Self::pick_physical_device(instance, surface_loader.zip(*surface))?;
        let resolved = families.resolve()?;
        let (graphics_family, present_family, transfer_family) = resolved;

        let device = Self::create_logical_device(
            instance,
            physical_device,
            &[graphics_family, present_family, transfer_family],
            surface.is_some(),
        )?;

        Ok((device, physical_device, properties, resolved))
    }

    unsafe fn validation_layer_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers
                    .iter()
                    .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER)
            })
            .unwrap_or(false)
    }

    /// Create Vulkan instance with required extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: Option<RawDisplayHandle>,
        enable_validation: bool,
    ) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions: Vec<*const c_char> = match display_handle {
            Some(display) => ash_window::enumerate_required_extensions(display)
                .context("Failed to get required surface extensions")?
                .to_vec(),
            None => Vec::new(),
        };

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        entry
            .create_instance(&create_info, None)
            .context("Failed to create Vulkan instance")
    }

    /// Route validation messages to `tracing` and count errors.
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
        error_counter: &Arc<AtomicUsize>,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(Arc::as_ptr(error_counter) as *mut c_void);

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Select the best ray-tracing-capable physical device.
    unsafe fn pick_physical_device(
        instance: &Instance,
        surface: Option<(&surface::Instance, vk::SurfaceKHR)>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, RtProperties)> {
        let devices = instance
            .enumerate_physical_devices()
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            return Err(RenderError::Unsupported("No Vulkan-capable GPU found".into()));
        }

        let mut scored_devices: Vec<_> = devices
            .iter()
            .filter_map(|&device| {
                Self::rate_device(instance, device, surface).map(|score| (device, score))
            })
            .collect();

        scored_devices.sort_by(|a, b| b.1.cmp(&a.1));

        let &(physical_device, _) = scored_devices.first().ok_or_else(|| {
            RenderError::Unsupported(
                "No GPU with acceleration structure and ray tracing pipeline support found".into(),
            )
        })?;

        let queue_families = Self::find_queue_families(instance, physical_device, surface);
        let properties = Self::query_rt_properties(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        info!(
            gpu = %name,
            handle_size = properties.shader_group_handle_size,
            base_alignment = properties.shader_group_base_alignment,
            "Selected GPU"
        );

        Ok((physical_device, queue_families, properties))
    }

    /// Rate a physical device, `None` when it cannot run the renderer.
    unsafe fn rate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<(&surface::Instance, vk::SurfaceKHR)>,
    ) -> Option<u64> {
        let props = instance.get_physical_device_properties(device);
        if props.api_version < REQUIRED_VK_VERSION {
            return None;
        }

        let queue_families = Self::find_queue_families(instance, device, surface);
        if !queue_families.is_complete(surface.is_some()) {
            return None;
        }

        if !Self::check_rt_support(instance, device, surface.is_some()) {
            return None;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        let device_local_mb: u64 = memory_props.memory_heaps[..memory_props.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Some(score_device(props.device_type, device_local_mb))
    }

    /// Find queue family indices for a physical device.
    unsafe fn find_queue_families(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: Option<(&surface::Instance, vk::SurfaceKHR)>,
    ) -> QueueFamilyIndices {
        let families = instance.get_physical_device_queue_family_properties(device);

        QueueFamilyIndices::from_properties(&families, |i| match surface {
            Some((loader, surface)) => loader
                .get_physical_device_surface_support(device, i, surface)
                .unwrap_or(false),
            None => false,
        })
    }

    /// Check extensions and features the renderer cannot run without.
    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice, needs_swapchain: bool) -> bool {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return false,
        };

        let has_extension = |wanted: &CStr| {
            extensions
                .iter()
                .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has_extension(acceleration_structure::NAME)
            || !has_extension(ray_tracing_pipeline::NAME)
            || !has_extension(deferred_host_operations::NAME)
            || (needs_swapchain && !has_extension(swapchain::NAME))
        {
            return false;
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        instance.get_physical_device_features2(device, &mut features2);
        let write_without_format = features2.features.shader_storage_image_write_without_format;

        vulkan_12_features.buffer_device_address == vk::TRUE
            && accel_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE
            && write_without_format == vk::TRUE
    }

    unsafe fn query_rt_properties(instance: &Instance, device: vk::PhysicalDevice) -> RtProperties {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut as_props);

        instance.get_physical_device_properties2(device, &mut props2);

        RtProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            max_instance_count: as_props.max_instance_count,
            min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Create logical device with ray tracing features and extensions.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        families: &[u32],
        enable_swapchain: bool,
    ) -> Result<Device> {
        let mut unique_families: Vec<u32> = Vec::with_capacity(families.len());
        for &family in families {
            if !unique_families.contains(&family) {
                unique_families.push(family);
            }
        }

        let queue_priorities = [1.0f32];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let mut extensions: Vec<*const c_char> = vec![
            acceleration_structure::NAME.as_ptr(),
            ray_tracing_pipeline::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
        ];
        if enable_swapchain {
            extensions.push(swapchain::NAME.as_ptr());
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        let device_features = vk::PhysicalDeviceFeatures::default()
            .shader_storage_image_write_without_format(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(device_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .context("Failed to create logical device")
    }

    /// Surface loader; only present on contexts created with a window.
    pub fn surface_loader(&self) -> Result<&surface::Instance> {
        self.surface_loader
            .as_ref()
            .ok_or_else(|| RenderError::Unsupported("context was created without a surface".into()))
    }

    /// Swapchain loader; only present on contexts created with a window.
    pub fn swapchain_loader(&self) -> Result<&swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| RenderError::Unsupported("context was created without a surface".into()))
    }

    /// Queue used for the given kind of work.
    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Validation-layer errors reported since the context was created.
    pub fn validation_error_count(&self) -> usize {
        self.validation_errors.load(Ordering::Relaxed)
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle().context("Failed to wait for device idle") }
    }

    /// [`wait_idle`](Self::wait_idle) for teardown paths, where a lost device is only logged.
    pub fn wait_idle_for_teardown(&self) {
        if let Err(e) = self.wait_idle() {
            warn!("{e}");
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle_for_teardown();

            self.device.destroy_device(None);

            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || (*data).p_message.is_null() {
        Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*data).p_message).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        if !user_data.is_null() {
            (*(user_data as *const AtomicUsize)).fetch_add(1, Ordering::Relaxed);
        }
        error!(target: "vulkan", ?ty, "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", ?ty, "{}", message);
    } else {
        trace!(target: "vulkan", ?ty, "{}", message);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    // ============================================================
    // QueueFamilyIndices::from_properties
    // ============================================================

    #[test]
    fn test_single_universal_family() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::from_properties(&families, |_| true);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.transfer, None);
        assert!(indices.is_complete(true));
    }

    #[test]
    fn test_dedicated_transfer_family_found() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::from_properties(&families, |i| i == 0);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.transfer, Some(1));
    }

    #[test]
    fn test_present_prefers_graphics_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let indices = QueueFamilyIndices::from_properties(&families, |_| true);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn test_present_falls_back_to_other_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
        ];
        let indices = QueueFamilyIndices::from_properties(&families, |i| i == 1);
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn test_headless_needs_no_present() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::from_properties(&families, |_| false);
        assert_eq!(indices.present, None);
        assert!(indices.is_complete(false));
        assert!(!indices.is_complete(true));
    }

    #[test]
    fn test_empty_families_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::from_properties(&families, |_| true);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn test_no_graphics_incomplete() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        let indices = QueueFamilyIndices::from_properties(&families, |_| true);
        assert!(!indices.is_complete(false));
    }

    // ============================================================
    // QueueFamilyIndices::resolve
    // ============================================================

    #[test]
    fn test_resolve_without_graphics_is_an_error() {
        let indices = QueueFamilyIndices {
            graphics: None,
            present: Some(0),
            transfer: Some(1),
        };
        assert!(matches!(indices.resolve(), Err(RenderError::Unsupported(_))));
    }

    #[test]
    fn test_resolve_falls_back_to_graphics() {
        let indices = QueueFamilyIndices {
            graphics: Some(2),
            present: None,
            transfer: None,
        };
        assert_eq!(indices.resolve().unwrap(), (2, 2, 2));

        let dedicated = QueueFamilyIndices {
            graphics: Some(0),
            present: Some(1),
            transfer: Some(3),
        };
        assert_eq!(dedicated.resolve().unwrap(), (0, 1, 3));
    }

    // ============================================================
    // score_device
    // ============================================================

    #[test]
    fn test_discrete_beats_integrated() {
        let discrete = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 0);
        let integrated = score_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 1_000_000);
        assert!(discrete > integrated);
    }

    #[test]
    fn test_more_memory_breaks_ties() {
        let small = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 4096);
        let large = score_device(vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        assert!(large > small);
    }

    #[test]
    fn test_cpu_device_scores_lowest() {
        let cpu = score_device(vk::PhysicalDeviceType::CPU, 65536);
        let virt = score_device(vk::PhysicalDeviceType::VIRTUAL_GPU, 0);
        assert!(virt > cpu);
    }
}
