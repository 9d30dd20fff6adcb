// Error types for the resource and submission core
//
// API failures keep the raw vk::Result so callers see exactly what the driver
// returned. Invariant violations (refcount underflow, self dependencies,
// out-of-range frame slots) are not represented here: they panic.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Driver / allocator failures
    // ========================================================================
    /// A Vulkan entry point returned a failure code.
    #[error("{call} failed: {result}")]
    Vk {
        call: &'static str,
        result: vk::Result,
    },

    #[error("failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("no Vulkan device with a graphics or compute queue")]
    NoSuitableDevice,

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// A fence wait ran out of time. Treated as fatal by callers: submitted
    /// work cannot be cancelled, so there is nothing to retry.
    #[error("timed out after {timeout_ns}ns waiting for fence")]
    FenceTimeout { timeout_ns: u64 },

    // ========================================================================
    // Usage errors
    // ========================================================================
    #[error("access of {size} bytes at offset {offset} exceeds resource extent of {extent} bytes")]
    OutOfBounds { offset: u64, size: u64, extent: u64 },

    #[error("resource memory is not host visible")]
    NotHostVisible,

    #[error("{semaphores} wait semaphores but {stages} wait stage masks")]
    WaitStageMismatch { semaphores: usize, stages: usize },

    /// The task's previous completion signal was never waited on. Signalling
    /// again would drop that signal on the floor.
    #[error("task '{task}' resubmitted before its previous completion signal was consumed")]
    UnconsumedSignal { task: String },

    #[error("command buffer slot {slot} is not recording")]
    NotRecording { slot: usize },

    #[error("unsupported image format {0:?}")]
    UnsupportedFormat(vk::Format),

    // ========================================================================
    // Resource loading
    // ========================================================================
    #[error("failed to load '{}': {reason}", path.display())]
    Load { path: PathBuf, reason: String },
}

/// Attaches the entry point name to a raw `vk::Result` and logs the failure.
pub(crate) trait VkResultExt<T> {
    fn call(self, name: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn call(self, name: &'static str) -> Result<T> {
        self.map_err(|result| {
            log::error!("[Vulkan] {} returned {:?}", name, result);
            Error::Vk { call: name, result }
        })
    }
}
