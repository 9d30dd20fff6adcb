// Vulkan Device - Gpu implementation on top of ash
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU)
// - Logical device + single graphics/compute queue
// - Memory allocator setup (gpu-allocator behind a mutex)
//
// Headless: no surface or swapchain extensions are requested.

use super::gpu::{BufferAllocDesc, GpuBuffer, GpuImage, ImageAllocDesc, SubmitBatch};
use super::Gpu;
use crate::config::DeviceConfig;
use crate::error::{Error, Result, VkResultExt};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

/// One physical device as reported by the loader.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    /// Discrete GPU with its own memory
    pub dedicated: bool,
    pub device_local_bytes: u64,
    /// Host-visible heap size that is not device local
    pub shared_bytes: u64,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device, see Drop
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    queue: vk::Queue,
    queue_family: u32,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    name: String,
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// Fails with `Error::Loader` when no Vulkan driver is installed, which
    /// callers use to fall back to the headless backend.
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", config.app_name);

        let entry = unsafe { Entry::load() }?;
        let instance = Self::create_instance(&entry, &config.app_name, config.validation_layers)?;

        // Everything created below is destroyed again if a later step fails
        let mut teardown = Teardown::default();
        let owned = instance.clone();
        teardown.push("instance", move || unsafe { owned.destroy_instance(None) });

        let debug_utils = if config.validation_layers {
            let (utils, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            let owned = utils.clone();
            teardown.push("debug messenger", move || unsafe {
                owned.destroy_debug_utils_messenger(messenger, None)
            });
            Some((utils, messenger))
        } else {
            None
        };

        let (physical_device, queue_family) = Self::pick_physical_device(&instance)?;

        let (device, queue) =
            Self::create_logical_device(&instance, physical_device, queue_family)?;
        let owned = device.clone();
        teardown.push("device", move || unsafe { owned.destroy_device(None) });

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Selected GPU: {}", name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        teardown.disarm();
        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            queue,
            queue_family,
            debug_utils,
            name,
            properties,
        })
    }

    /// Lists every adapter the loader can see, without creating a device.
    pub fn enumerate_adapters() -> Result<Vec<AdapterInfo>> {
        let entry = unsafe { Entry::load() }?;
        let instance = Self::create_instance(&entry, "adapter-query", false)?;

        let devices =
            unsafe { instance.enumerate_physical_devices() }.call("vkEnumeratePhysicalDevices");
        let adapters = devices.map(|devices| {
            devices
                .into_iter()
                .map(|pd| unsafe {
                    let props = instance.get_physical_device_properties(pd);
                    let memory = instance.get_physical_device_memory_properties(pd);
                    let heaps = &memory.memory_heaps[..memory.memory_heap_count as usize];
                    let (local, shared) = heaps.iter().fold((0, 0), |(local, shared), heap| {
                        if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                            (local + heap.size, shared)
                        } else {
                            (local, shared + heap.size)
                        }
                    });
                    AdapterInfo {
                        name: CStr::from_ptr(props.device_name.as_ptr())
                            .to_string_lossy()
                            .into_owned(),
                        dedicated: props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
                        device_local_bytes: local,
                        shared_bytes: shared,
                    }
                })
                .collect()
        });

        unsafe { instance.destroy_instance(None) };
        adapters
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name.replace('\0', "")).unwrap_or_default();
        let engine_name = c"inflight";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = Vec::new();
        let mut layer_names = Vec::new();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layer_names.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.call("vkCreateInstance")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .call("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices =
            unsafe { instance.enumerate_physical_devices() }.call("vkEnumeratePhysicalDevices")?;

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            // Transfers and copies are all the core records, so compute-only
            // families qualify too
            let family = queue_families
                .iter()
                .position(|f| {
                    f.queue_flags
                        .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                })
                .map(|i| i as u32);

            if let Some(family) = family {
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, family));
                }
            }
        }

        best_device.ok_or(Error::NoSuitableDevice)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .call("vkCreateDevice")?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: gpu_allocator::MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        allocation.map_err(|e| {
            log::error!("[Allocator] '{}' ({} bytes): {}", name, requirements.size, e);
            Error::Allocation(e)
        })
    }

    fn free(&self, allocation: Option<Allocation>) {
        if let Some(allocation) = allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("[Allocator] free failed: {}", e);
            }
        }
    }

    /// Mapped range covering `offset..offset + size` of the buffer, widened to
    /// nonCoherentAtomSize.
    fn mapped_range(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
    ) -> Option<vk::MappedMemoryRange> {
        let allocation = buffer.allocation.as_ref()?;
        let atom = self.properties.limits.non_coherent_atom_size.max(1);
        let start = allocation.offset() + offset;
        let aligned_start = start / atom * atom;
        let aligned_end = (start + size + atom - 1) / atom * atom;
        Some(
            vk::MappedMemoryRange::builder()
                .memory(unsafe { allocation.memory() })
                .offset(aligned_start)
                .size(aligned_end - aligned_start)
                .build(),
        )
    }
}

impl Gpu for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> vk::Queue {
        self.queue
    }

    fn queue_family_index(&self) -> u32 {
        self.queue_family
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }.call("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&info, None) }.call("vkCreateFence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Err(vk::Result::TIMEOUT) => {
                log::error!("[Vulkan] fence wait timed out after {}ns", timeout_ns);
                Err(Error::FenceTimeout { timeout_ns })
            }
            other => other.call("vkWaitForFences"),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        unsafe { self.device.get_fence_status(fence) }.call("vkGetFenceStatus")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }.call("vkResetFences")
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch) -> Result<()> {
        let wait_semaphores: Vec<_> = batch.waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<_> = batch.waits.iter().map(|w| w.stage).collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(batch.command_buffers)
            .signal_semaphores(batch.signals)
            .build();

        let fence = batch.fence.unwrap_or_else(vk::Fence::null);
        unsafe { self.device.queue_submit(queue, &[submit_info], fence) }.call("vkQueueSubmit")
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.queue_wait_idle(queue) }.call("vkQueueWaitIdle")
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&info, None) }.call("vkCreateCommandPool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }.call("vkAllocateCommandBuffers")
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(pool, buffers) };
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> Result<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &info) }.call("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }.call("vkEndCommandBuffer")
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .call("vkResetCommandBuffer")
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(cmd, src, dst, dst_layout, regions) };
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_image_to_buffer(cmd, src, src_layout, dst, regions) };
    }

    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image(cmd, src, src_layout, dst, dst_layout, regions)
        };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(cmd, src, src_layout, dst, dst_layout, regions, filter)
        };
    }

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(barrier),
            )
        };
    }

    fn create_buffer(&self, desc: &BufferAllocDesc) -> Result<GpuBuffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.device.create_buffer(&info, None) }.call("vkCreateBuffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };

        let allocation = match self.allocate(desc.name, requirements, desc.location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        }
        .call("vkBindBufferMemory");
        if let Err(e) = bound {
            self.free(Some(allocation));
            unsafe { self.device.destroy_buffer(handle, None) };
            return Err(e);
        }

        let mapped = allocation.mapped_ptr().map(NonNull::cast::<u8>);
        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        log::debug!(
            "Buffer '{}' ({} bytes, {:?}) mapped={} coherent={}",
            desc.name,
            desc.size,
            desc.location,
            mapped.is_some(),
            coherent
        );

        Ok(GpuBuffer {
            handle,
            size: desc.size,
            mapped,
            coherent,
            allocation: Some(allocation),
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        self.free(buffer.allocation);
        unsafe { self.device.destroy_buffer(buffer.handle, None) };
    }

    fn create_image(&self, desc: &ImageAllocDesc) -> Result<GpuImage> {
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let info = vk::ImageCreateInfo::builder()
            .image_type(image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { self.device.create_image(&info, None) }.call("vkCreateImage")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };

        let allocation = match self.allocate(desc.name, requirements, desc.location, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        }
        .call("vkBindImageMemory");
        if let Err(e) = bound {
            self.free(Some(allocation));
            unsafe { self.device.destroy_image(handle, None) };
            return Err(e);
        }

        Ok(GpuImage {
            handle,
            extent: desc.extent,
            format: desc.format,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            allocation: Some(allocation),
        })
    }

    fn destroy_image(&self, image: GpuImage) {
        self.free(image.allocation);
        unsafe { self.device.destroy_image(image.handle, None) };
    }

    fn flush_mapped(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()> {
        if buffer.coherent {
            return Ok(());
        }
        match self.mapped_range(buffer, offset, size) {
            Some(range) => unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
                .call("vkFlushMappedMemoryRanges"),
            None => Ok(()),
        }
    }

    fn invalidate_mapped(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()> {
        if buffer.coherent {
            return Ok(());
        }
        match self.mapped_range(buffer, offset, size) {
            Some(range) => unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }
                .call("vkInvalidateMappedMemoryRanges"),
            None => Ok(()),
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::warn!("Device did not go idle before destruction: {}", e);
        }

        unsafe {
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Destroys partially created device objects, newest first, unless disarmed.
#[derive(Default)]
struct Teardown {
    steps: Vec<(&'static str, Box<dyn FnOnce()>)>,
}

impl Teardown {
    fn push(&mut self, what: &'static str, step: impl FnOnce() + 'static) {
        self.steps.push((what, Box::new(step)));
    }

    /// Creation succeeded; ownership moves to the finished object.
    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        while let Some((what, step)) = self.steps.pop() {
            log::debug!("Device creation failed, destroying {}", what);
            step();
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
