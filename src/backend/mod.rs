// Backend module - the low-level GPU layer
//
// Gpu is the seam the core is written against. VulkanDevice drives a real
// driver through ash; HeadlessGpu runs the same calls in process.

pub mod device;
pub mod gpu;
pub mod headless;

pub use device::{AdapterInfo, VulkanDevice};
pub use gpu::{
    full_mip_count, mip_extent, texel_size, BufferAllocDesc, Gpu, GpuBuffer, GpuImage,
    ImageAllocDesc, SubmitBatch, WaitSemaphore,
};
pub use headless::{FenceState, HeadlessGpu, SubmissionRecord};
