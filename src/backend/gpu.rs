// The low-level GPU interface the core is written against
//
// Everything above this trait deals in raw ash handles (vk::Semaphore,
// vk::CommandBuffer, ...). VulkanDevice forwards to the driver; HeadlessGpu
// emulates a single queue in process so the submission protocol and the
// frame-multiplexed storage can run without a driver.

use crate::error::Result;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;

/// A semaphore to wait on, paired with the stage that waits for it.
///
/// Keeping the two together is what guarantees the wait-semaphore and
/// wait-stage arrays handed to vkQueueSubmit have equal length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSemaphore {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// One queue submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [WaitSemaphore],
    pub signals: &'a [vk::Semaphore],
    pub fence: Option<vk::Fence>,
}

#[derive(Debug, Clone)]
pub struct BufferAllocDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Debug, Clone)]
pub struct ImageAllocDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub location: MemoryLocation,
}

/// A buffer bound to its memory.
#[derive(Debug)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    /// Persistent host mapping, present for host-visible memory only
    pub mapped: Option<NonNull<u8>>,
    pub coherent: bool,
    pub(crate) allocation: Option<Allocation>,
}

impl GpuBuffer {
    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }
}

/// An image bound to its memory.
#[derive(Debug)]
pub struct GpuImage {
    pub handle: vk::Image,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub(crate) allocation: Option<Allocation>,
}

/// The device, queue and memory operations the core needs.
///
/// Recording calls (`cmd_*`) cannot fail at record time in Vulkan, so they
/// return nothing; errors surface at `end_command_buffer` or submission.
pub trait Gpu {
    fn name(&self) -> &str;
    fn queue(&self) -> vk::Queue;
    fn queue_family_index(&self) -> u32;

    // Semaphores and fences
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `Error::FenceTimeout` when the timeout elapses first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    // Queue
    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch) -> Result<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;

    // Command buffers
    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    /// Back to the initial state from any state, including recording.
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    );

    // Memory
    fn create_buffer(&self, desc: &BufferAllocDesc) -> Result<GpuBuffer>;
    fn destroy_buffer(&self, buffer: GpuBuffer);
    fn create_image(&self, desc: &ImageAllocDesc) -> Result<GpuImage>;
    fn destroy_image(&self, image: GpuImage);
    /// Makes host writes in `offset..offset + size` visible to the device.
    /// A no-op for coherent memory.
    fn flush_mapped(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()>;
    /// Makes device writes in `offset..offset + size` visible to the host.
    fn invalidate_mapped(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()>;
}

/// Bytes per texel for the uncompressed formats the core can upload.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::R16G16_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

/// Extent of mip `level`, each dimension halved per level and clamped to 1.
pub fn mip_extent(extent: vk::Extent3D, level: u32) -> vk::Extent3D {
    let shrink = |d: u32| d.checked_shr(level).unwrap_or(0).max(1);
    vk::Extent3D {
        width: shrink(extent.width),
        height: shrink(extent.height),
        depth: shrink(extent.depth),
    }
}

/// Length of the full mip chain down to 1x1x1.
pub fn full_mip_count(extent: vk::Extent3D) -> u32 {
    let largest = extent.width.max(extent.height).max(extent.depth).max(1);
    u32::BITS - largest.leading_zeros()
}
