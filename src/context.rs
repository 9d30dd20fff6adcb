// Core context - the long-lived object every resource hangs off
//
// Owns the Gpu, the command pool all command buffers come from, and the two
// numbers resources need to size themselves: max_frames_in_flight and the
// fence timeout. Shared through Handle<CoreContext>; the last resource to go
// away destroys the pool and the device.

use crate::backend::Gpu;
use crate::error::Result;
use crate::handle::Handle;
use ash::vk;

/// Construction parameters for [`CoreContext`].
#[derive(Debug, Clone, Copy)]
pub struct ContextDesc {
    pub max_frames_in_flight: u32,
    /// Applied to every CPU-side fence wait. `u64::MAX` waits forever.
    pub fence_timeout_ns: u64,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            fence_timeout_ns: u64::MAX,
        }
    }
}

pub struct CoreContext {
    gpu: Box<dyn Gpu>,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    max_frames_in_flight: u32,
    fence_timeout_ns: u64,
}

impl CoreContext {
    pub fn new(gpu: Box<dyn Gpu>, desc: ContextDesc) -> Result<Handle<CoreContext>> {
        assert!(
            desc.max_frames_in_flight > 0,
            "need at least one frame in flight"
        );

        let command_pool = gpu.create_command_pool()?;
        let queue = gpu.queue();
        let queue_family_index = gpu.queue_family_index();

        log::info!(
            "Core context on '{}': {} frames in flight, queue family {}",
            gpu.name(),
            desc.max_frames_in_flight,
            queue_family_index
        );

        Ok(Handle::new(Self {
            gpu,
            queue,
            queue_family_index,
            command_pool,
            max_frames_in_flight: desc.max_frames_in_flight,
            fence_timeout_ns: desc.fence_timeout_ns,
        }))
    }

    pub fn gpu(&self) -> &dyn Gpu {
        self.gpu.as_ref()
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn max_frames_in_flight(&self) -> u32 {
        self.max_frames_in_flight
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ns
    }
}

impl Drop for CoreContext {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            log::warn!("GPU did not go idle before context teardown: {}", e);
        }
        self.gpu.destroy_command_pool(self.command_pool);
        log::debug!("Core context destroyed");
    }
}

/// Context over a deferred-execution [`HeadlessGpu`](crate::backend::HeadlessGpu),
/// plus a clone of the GPU for inspection.
#[cfg(test)]
pub(crate) fn test_context(
    max_frames_in_flight: u32,
) -> (crate::backend::HeadlessGpu, Handle<CoreContext>) {
    let gpu = crate::backend::HeadlessGpu::new();
    let ctx = CoreContext::new(
        Box::new(gpu.clone()),
        ContextDesc {
            max_frames_in_flight,
            ..Default::default()
        },
    )
    .unwrap();
    (gpu, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_lives_as_long_as_the_context() {
        let (gpu, ctx) = test_context(2);
        assert_eq!(gpu.live_object_count(), 1);

        let second = ctx.clone();
        drop(ctx);
        assert_eq!(gpu.live_object_count(), 1);

        drop(second);
        assert_eq!(gpu.live_object_count(), 0);
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    #[should_panic(expected = "at least one frame")]
    fn rejects_zero_frames_in_flight() {
        let _ = CoreContext::new(
            Box::new(crate::backend::HeadlessGpu::new()),
            ContextDesc {
                max_frames_in_flight: 0,
                ..Default::default()
            },
        );
    }
}
