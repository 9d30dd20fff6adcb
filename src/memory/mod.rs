// Frame-multiplexed GPU memory
//
// Buffers and images can be replicated once per frame in flight so the CPU
// writes frame N's copy while the GPU still reads frame N - 1's. Every call
// that touches storage takes the Frame it is acting for.

pub mod buffer;
pub mod image;

pub use buffer::{Buffer, BufferDesc, MappedScope};
pub use image::{Image, ImageDesc};

use crate::backend::{BufferAllocDesc, Gpu, GpuBuffer};
use crate::error::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

/// Where a resource's memory lives.
///
/// `HostOnly` and `DeviceAndHost` currently allocate alike: gpu-allocator
/// has no location for plain system memory, and its `CpuToGpu` already
/// prefers device-local host-visible heaps and falls back to system memory.
/// The two stay separate so callers can state intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPreset {
    /// System memory the device reads over the bus
    HostOnly,
    /// Device memory the host can map (BAR / unified memory); falls back to
    /// system memory where no such heap exists
    DeviceAndHost,
    /// Fastest device memory, reached from the host through staging
    DeviceOnly,
}

/// How the host touches a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAccess {
    None,
    /// Written front to back, never read (uploads)
    Sequential,
    /// Read back or updated piecemeal
    Random,
}

/// Host-visible presets share `CpuToGpu` for uploads; anything read back
/// piecemeal goes to cached `GpuToCpu` memory.
pub(crate) fn memory_location(preset: MemoryPreset, access: HostAccess) -> MemoryLocation {
    match (preset, access) {
        (MemoryPreset::DeviceOnly, _) => MemoryLocation::GpuOnly,
        (_, HostAccess::Random) => MemoryLocation::GpuToCpu,
        _ => MemoryLocation::CpuToGpu,
    }
}

/// Copies `data` into mapped memory at `offset`.
///
/// # Safety
/// `base` must map at least `offset + data.len()` bytes.
pub(crate) unsafe fn copy_to_mapped(base: NonNull<u8>, offset: u64, data: &[u8]) {
    ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(offset as usize), data.len());
}

/// Copies from mapped memory at `offset` into `out`.
///
/// # Safety
/// `base` must map at least `offset + out.len()` bytes.
pub(crate) unsafe fn copy_from_mapped(base: NonNull<u8>, offset: u64, out: &mut [u8]) {
    ptr::copy_nonoverlapping(base.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
}

/// Host-visible transfer buffer for one trip into or out of device-only
/// memory. Destroyed on drop.
pub(crate) struct StagingBuffer<'a> {
    gpu: &'a dyn Gpu,
    buffer: ManuallyDrop<GpuBuffer>,
}

impl<'a> StagingBuffer<'a> {
    /// A staging buffer already holding `data`.
    pub fn upload(gpu: &'a dyn Gpu, data: &[u8]) -> Result<Self> {
        let staging = Self::new(
            gpu,
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let mapped = staging.mapped()?;
        unsafe { copy_to_mapped(mapped, 0, data) };
        gpu.flush_mapped(&staging.buffer, 0, data.len() as u64)?;
        Ok(staging)
    }

    /// An empty staging buffer for the device to copy into.
    pub fn readback(gpu: &'a dyn Gpu, size: u64) -> Result<Self> {
        Self::new(
            gpu,
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )
    }

    fn new(
        gpu: &'a dyn Gpu,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer = gpu.create_buffer(&BufferAllocDesc {
            name: "staging",
            size,
            usage,
            location,
        })?;
        Ok(Self {
            gpu,
            buffer: ManuallyDrop::new(buffer),
        })
    }

    fn mapped(&self) -> Result<NonNull<u8>> {
        self.buffer
            .mapped
            .ok_or(crate::error::Error::NotHostVisible)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle
    }

    /// Copies the device's writes out. Call after the transfer has finished.
    pub fn read(&self, out: &mut [u8]) -> Result<()> {
        let mapped = self.mapped()?;
        self.gpu.invalidate_mapped(&self.buffer, 0, out.len() as u64)?;
        unsafe { copy_from_mapped(mapped, 0, out) };
        Ok(())
    }
}

impl Drop for StagingBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: taken exactly once, here
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        self.gpu.destroy_buffer(buffer);
    }
}
