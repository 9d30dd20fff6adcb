// inflight - frame-in-flight resources and semaphore-chained submission
//
// Layers, leaves first:
//   handle   - intrusive refcounted ownership for every GPU object wrapper
//   backend  - the Gpu trait, VulkanDevice (ash + gpu-allocator), HeadlessGpu
//   context  - CoreContext shared by everything through a Handle
//   frame    - Frame / FrameClock, passed explicitly into every per-frame call
//   sync     - Semaphore, Fence, SyncTask and the submission protocol
//   command  - per-frame CommandBuffer, Submission, CommandBufferSingleUse
//   memory   - frame-multiplexed Buffer and Image

pub mod backend;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod handle;
pub mod memory;
pub mod sync;

pub use backend::{Gpu, HeadlessGpu, VulkanDevice, WaitSemaphore};
pub use command::{ActiveBuffer, CommandBuffer, CommandBufferSingleUse, SlotState, Submission};
pub use config::Config;
pub use context::{ContextDesc, CoreContext};
pub use error::{Error, Result};
pub use frame::{Frame, FrameClock};
pub use handle::{AtomicCount, Handle, LocalCount, RefCount, SharedHandle};
pub use memory::{Buffer, BufferDesc, HostAccess, Image, ImageDesc, MemoryPreset};
pub use sync::{Dependency, Fence, Semaphore, SubmitReport, SyncTask};
