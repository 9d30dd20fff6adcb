// Command buffers - one native buffer per frame in flight
//
// A CommandBuffer resolves its slot from the Frame passed in, so recording for
// frame N never touches a buffer the GPU may still be executing for frame
// N - 1. Recording state is tracked per slot:
//
//   Initial --get_buffer--> Recording --finalize--> Executable
//      ^                        |                      |
//      +------------- request_rerecord (resets) -------+
//
// An Executable slot from an earlier frame number is re-begun by get_buffer
// unless the buffer is static (recorded once, submitted every frame). A slot
// still Recording for an earlier frame was abandoned without finalize; it is
// reset and re-begun, so its commands never reach a later frame.

use crate::backend::{Gpu, SubmitBatch, WaitSemaphore};
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handle::Handle;
use crate::sync::Fence;
use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Initial,
    Recording { frame: u64 },
    Executable { frame: u64 },
}

/// The native buffer for a frame, and whether commands should be recorded
/// into it now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveBuffer {
    pub handle: vk::CommandBuffer,
    pub recording: bool,
}

pub struct CommandBuffer {
    ctx: Handle<CoreContext>,
    buffers: Vec<vk::CommandBuffer>,
    states: Vec<SlotState>,
    static_record_index: Option<u32>,
    one_time: bool,
}

impl CommandBuffer {
    /// A buffer with no native storage yet. See [`CommandBuffer::delay_initialize`].
    pub fn empty() -> Self {
        Self {
            ctx: Handle::empty(),
            buffers: Vec::new(),
            states: Vec::new(),
            static_record_index: None,
            one_time: false,
        }
    }

    /// One native buffer per frame in flight.
    pub fn new(ctx: &Handle<CoreContext>) -> Result<Self> {
        let mut buffer = Self::empty();
        buffer.delay_initialize(ctx)?;
        Ok(buffer)
    }

    /// A single native buffer, recorded once and submitted as-is every frame.
    pub fn new_static(ctx: &Handle<CoreContext>) -> Result<Self> {
        Self::allocate(ctx, 1, Some(0), false)
    }

    /// A single native buffer begun with ONE_TIME_SUBMIT.
    pub fn create_single_buffer(ctx: &Handle<CoreContext>) -> Result<Self> {
        Self::allocate(ctx, 1, Some(0), true)
    }

    /// Second phase of [`CommandBuffer::empty`].
    pub fn delay_initialize(&mut self, ctx: &Handle<CoreContext>) -> Result<()> {
        assert!(
            !self.ctx.is_valid_ref(),
            "command buffer initialized twice"
        );
        *self = Self::allocate(ctx, ctx.max_frames_in_flight(), None, false)?;
        Ok(())
    }

    fn allocate(
        ctx: &Handle<CoreContext>,
        count: u32,
        static_record_index: Option<u32>,
        one_time: bool,
    ) -> Result<Self> {
        let buffers = ctx
            .gpu()
            .allocate_command_buffers(ctx.command_pool(), count)?;
        log::trace!("Allocated {} command buffer(s)", count);
        Ok(Self {
            ctx: ctx.clone(),
            states: vec![SlotState::Initial; buffers.len()],
            buffers,
            static_record_index,
            one_time,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.ctx.is_valid_ref()
    }

    pub fn static_record_index(&self) -> Option<u32> {
        self.static_record_index
    }

    /// Pins every frame to one slot. That slot is recorded once and then only
    /// submitted. Pass `None` to go back to per-frame slots; a buffer created
    /// with a single slot gets the missing per-frame slots allocated.
    pub fn set_static_record_index(&mut self, index: Option<u32>) -> Result<()> {
        match index {
            Some(i) => assert!(
                (i as usize) < self.buffers.len(),
                "static record index {} out of range for {} buffer(s)",
                i,
                self.buffers.len()
            ),
            None => self.grow_to_frame_count()?,
        }
        self.static_record_index = index;
        Ok(())
    }

    fn grow_to_frame_count(&mut self) -> Result<()> {
        let Some(ctx) = self.ctx.get() else {
            return Ok(());
        };
        let wanted = ctx.max_frames_in_flight() as usize;
        if self.buffers.len() >= wanted {
            return Ok(());
        }
        let missing = (wanted - self.buffers.len()) as u32;
        let extra = ctx
            .gpu()
            .allocate_command_buffers(ctx.command_pool(), missing)?;
        log::trace!("Allocated {} command buffer(s) for per-frame recording", missing);
        self.buffers.extend(extra);
        self.states.resize(self.buffers.len(), SlotState::Initial);
        Ok(())
    }

    fn slot(&self, frame: Frame) -> usize {
        let slot = match self.static_record_index {
            Some(i) => i as usize,
            None => frame.slot(),
        };
        assert!(
            slot < self.buffers.len(),
            "frame slot {} out of range for {} command buffer(s)",
            slot,
            self.buffers.len()
        );
        slot
    }

    /// Resolves the buffer for `frame`, beginning recording when the slot needs
    /// new commands.
    ///
    /// The caller must have waited for the GPU to finish with this slot's
    /// previous submission before a re-begin happens.
    pub fn get_buffer(&mut self, frame: Frame) -> Result<ActiveBuffer> {
        let slot = self.slot(frame);
        let handle = self.buffers[slot];

        let current = self.states[slot];
        let begin = match current {
            SlotState::Initial => true,
            SlotState::Recording { frame: recorded } if recorded != frame.number => {
                log::warn!(
                    "Command buffer slot {} abandoned while recording frame {}, re-recording",
                    slot,
                    recorded
                );
                self.ctx.gpu().reset_command_buffer(handle)?;
                self.states[slot] = SlotState::Initial;
                true
            }
            SlotState::Recording { .. } => false,
            SlotState::Executable { frame: recorded } => {
                self.static_record_index.is_none() && recorded != frame.number
            }
        };
        if begin {
            self.ctx.gpu().begin_command_buffer(handle, self.one_time)?;
            self.states[slot] = SlotState::Recording {
                frame: frame.number,
            };
        }

        Ok(ActiveBuffer {
            handle,
            recording: matches!(self.states[slot], SlotState::Recording { .. }),
        })
    }

    /// The buffer for `frame` with no state change. Used at submit time.
    pub fn readonly_buffer(&self, frame: Frame) -> vk::CommandBuffer {
        self.buffers[self.slot(frame)]
    }

    pub fn state(&self, frame: Frame) -> SlotState {
        self.states[self.slot(frame)]
    }

    pub fn is_executable(&self, frame: Frame) -> bool {
        matches!(self.state(frame), SlotState::Executable { .. })
    }

    /// Ends recording for the slot `frame` resolves to.
    pub fn finalize(&mut self, frame: Frame) -> Result<()> {
        let slot = self.slot(frame);
        match self.states[slot] {
            SlotState::Recording { frame: recorded } => {
                self.ctx.gpu().end_command_buffer(self.buffers[slot])?;
                self.states[slot] = SlotState::Executable { frame: recorded };
                Ok(())
            }
            _ => Err(Error::NotRecording { slot }),
        }
    }

    /// Sends every slot back to Initial so the next get_buffer records again.
    /// Slots caught mid-recording are reset first.
    pub fn request_rerecord(&mut self) -> Result<()> {
        for (state, &handle) in self.states.iter_mut().zip(&self.buffers) {
            if matches!(state, SlotState::Recording { .. }) {
                self.ctx.gpu().reset_command_buffer(handle)?;
            }
            *state = SlotState::Initial;
        }
        Ok(())
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submits to an explicit queue. Blocking waits have no timeout.
    pub fn submit_to_queue(gpu: &dyn Gpu, queue: vk::Queue, submission: &Submission) -> Result<()> {
        let waits = submission.paired_waits()?;
        submit_batch(gpu, queue, &submission.batch(&waits), submission.block, u64::MAX)
    }

    /// Submits to the context queue, waiting with the context fence timeout
    /// when blocking.
    pub fn submit(ctx: &CoreContext, submission: &Submission) -> Result<()> {
        let waits = submission.paired_waits()?;
        submit_batch(
            ctx.gpu(),
            ctx.queue(),
            &submission.batch(&waits),
            submission.block,
            ctx.fence_timeout_ns(),
        )
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.get() {
            ctx.gpu()
                .free_command_buffers(ctx.command_pool(), &self.buffers);
        }
    }
}

/// A queue submission with parallel wait arrays, as the raw API takes them.
///
/// Slices accept both fixed-size arrays and vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: Option<vk::Fence>,
    /// Wait for the fence (or the whole queue without one) before returning
    pub block: bool,
}

impl<'a> Submission<'a> {
    fn paired_waits(&self) -> Result<Vec<WaitSemaphore>> {
        if self.wait_semaphores.len() != self.wait_stages.len() {
            log::error!(
                "Submission rejected: {} wait semaphores, {} wait stages",
                self.wait_semaphores.len(),
                self.wait_stages.len()
            );
            return Err(Error::WaitStageMismatch {
                semaphores: self.wait_semaphores.len(),
                stages: self.wait_stages.len(),
            });
        }
        Ok(self
            .wait_semaphores
            .iter()
            .zip(self.wait_stages)
            .map(|(&semaphore, &stage)| WaitSemaphore { semaphore, stage })
            .collect())
    }

    fn batch<'b>(&'b self, waits: &'b [WaitSemaphore]) -> SubmitBatch<'b> {
        SubmitBatch {
            command_buffers: self.command_buffers,
            waits,
            signals: self.signal_semaphores,
            fence: self.fence,
        }
    }
}

pub(crate) fn submit_batch(
    gpu: &dyn Gpu,
    queue: vk::Queue,
    batch: &SubmitBatch,
    block: bool,
    timeout_ns: u64,
) -> Result<()> {
    gpu.queue_submit(queue, batch)?;
    if block {
        match batch.fence {
            Some(fence) => gpu.wait_for_fence(fence, timeout_ns)?,
            None => gpu.queue_wait_idle(queue)?,
        }
    }
    Ok(())
}

/// A command buffer for one-off transfers: recording has begun on creation,
/// `execute` submits it and waits.
pub struct CommandBufferSingleUse {
    ctx: Handle<CoreContext>,
    buffer: CommandBuffer,
    fence: Handle<Fence>,
    handle: vk::CommandBuffer,
}

impl CommandBufferSingleUse {
    pub fn new(ctx: &Handle<CoreContext>) -> Result<Self> {
        let mut buffer = CommandBuffer::create_single_buffer(ctx)?;
        let active = buffer.get_buffer(Frame::first())?;
        let fence = Fence::new(ctx, false)?;
        Ok(Self {
            ctx: ctx.clone(),
            buffer,
            fence,
            handle: active.handle,
        })
    }

    pub fn cmd(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn fence(&self) -> &Handle<Fence> {
        &self.fence
    }

    /// Ends recording, submits, and returns once the GPU has finished.
    pub fn execute(mut self) -> Result<()> {
        self.buffer.finalize(Frame::first())?;
        let command_buffers = [self.handle];
        submit_batch(
            self.ctx.gpu(),
            self.ctx.queue(),
            &SubmitBatch {
                command_buffers: &command_buffers,
                fence: Some(self.fence.handle()),
                ..Default::default()
            },
            true,
            self.ctx.fence_timeout_ns(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::memory::{Buffer, BufferDesc};

    #[test]
    fn per_frame_slots_record_once_per_frame() {
        let (_gpu, ctx) = test_context(2);
        let mut cmd = CommandBuffer::new(&ctx).unwrap();

        let f0 = Frame::new(0, 0);
        let first = cmd.get_buffer(f0).unwrap();
        assert!(first.recording);
        // Same frame again: still the same recording, no second begin
        assert_eq!(cmd.get_buffer(f0).unwrap(), first);
        cmd.finalize(f0).unwrap();
        assert!(!cmd.get_buffer(f0).unwrap().recording);

        let f1 = Frame::new(1, 1);
        let second = cmd.get_buffer(f1).unwrap();
        assert_ne!(second.handle, first.handle);
        assert!(second.recording);
        cmd.finalize(f1).unwrap();

        // Slot 0 comes round again in a later frame and is re-recorded
        let again = cmd.get_buffer(Frame::new(0, 2)).unwrap();
        assert_eq!(again.handle, first.handle);
        assert!(again.recording);
    }

    #[test]
    fn static_buffer_records_once() {
        let (_gpu, ctx) = test_context(3);
        let mut cmd = CommandBuffer::new_static(&ctx).unwrap();
        assert!(cmd.get_buffer(Frame::new(0, 0)).unwrap().recording);
        cmd.finalize(Frame::new(0, 0)).unwrap();

        for (index, number) in [(1, 1), (2, 2), (0, 3)] {
            let active = cmd.get_buffer(Frame::new(index, number)).unwrap();
            assert!(!active.recording);
            assert!(cmd.is_executable(Frame::new(index, number)));
        }

        cmd.request_rerecord().unwrap();
        assert!(cmd.get_buffer(Frame::new(1, 4)).unwrap().recording);
    }

    #[test]
    fn rerecord_requested_mid_recording_begins_cleanly() {
        let (gpu, ctx) = test_context(2);
        let mut cmd = CommandBuffer::new(&ctx).unwrap();
        let f0 = Frame::first();

        assert!(cmd.get_buffer(f0).unwrap().recording);
        cmd.request_rerecord().unwrap();
        assert_eq!(cmd.state(f0), SlotState::Initial);

        assert!(cmd.get_buffer(f0).unwrap().recording);
        cmd.finalize(f0).unwrap();
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn abandoned_recording_does_not_leak_into_a_later_frame() {
        let (gpu, ctx) = test_context(2);
        let mut src = Buffer::new(&ctx, BufferDesc::host(4, vk::BufferUsageFlags::STORAGE_BUFFER))
            .unwrap();
        let dst = src.clone_layout().unwrap();
        src.write(Frame::first(), 0, &[1; 4]).unwrap();

        let mut cmd = CommandBuffer::new(&ctx).unwrap();
        // Frame 0 records a copy and never finalizes
        let active = cmd.get_buffer(Frame::new(0, 0)).unwrap();
        src.copy_to_whole(active.handle, Frame::first(), &dst).unwrap();

        // Frame 2 maps to the same slot and records nothing
        let later = Frame::new(0, 2);
        let active = cmd.get_buffer(later).unwrap();
        assert!(active.recording);
        assert_eq!(cmd.state(later), SlotState::Recording { frame: 2 });
        cmd.finalize(later).unwrap();

        let fence = Fence::new(&ctx, false).unwrap();
        CommandBuffer::submit(
            &ctx,
            &Submission {
                command_buffers: &[cmd.readonly_buffer(later)],
                fence: Some(fence.handle()),
                block: true,
                ..Default::default()
            },
        )
        .unwrap();

        let mut out = [9u8; 4];
        dst.read(later, 0, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn unpinning_a_static_buffer_allocates_per_frame_slots() {
        let (gpu, ctx) = test_context(3);
        let mut cmd = CommandBuffer::new_static(&ctx).unwrap();
        assert_eq!(gpu.live_object_count(), 2);

        cmd.set_static_record_index(None).unwrap();
        assert_eq!(cmd.static_record_index(), None);
        // pool + 3 buffers
        assert_eq!(gpu.live_object_count(), 4);

        let f1 = Frame::new(1, 1);
        let active = cmd.get_buffer(f1).unwrap();
        assert!(active.recording);
        assert_ne!(active.handle, cmd.readonly_buffer(Frame::first()));
        cmd.finalize(f1).unwrap();

        cmd.set_static_record_index(Some(2)).unwrap();
        assert_eq!(cmd.readonly_buffer(Frame::first()), cmd.readonly_buffer(f1));
        drop(cmd);
        assert_eq!(gpu.live_object_count(), 1);
    }

    #[test]
    fn finalize_without_recording_fails() {
        let (_gpu, ctx) = test_context(2);
        let mut cmd = CommandBuffer::new(&ctx).unwrap();
        assert!(matches!(
            cmd.finalize(Frame::first()),
            Err(Error::NotRecording { slot: 0 })
        ));
    }

    #[test]
    fn delayed_initialization_allocates_per_frame() {
        let (gpu, ctx) = test_context(3);
        let mut cmd = CommandBuffer::empty();
        assert!(!cmd.is_initialized());
        cmd.delay_initialize(&ctx).unwrap();
        assert!(cmd.is_initialized());
        // pool + 3 buffers
        assert_eq!(gpu.live_object_count(), 4);
        drop(cmd);
        assert_eq!(gpu.live_object_count(), 1);
    }

    #[test]
    fn mismatched_wait_arrays_never_reach_the_queue() {
        let (gpu, ctx) = test_context(2);
        let semaphore = gpu.create_semaphore().unwrap();
        let result = CommandBuffer::submit(
            &ctx,
            &Submission {
                wait_semaphores: &[semaphore],
                wait_stages: &[],
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(Error::WaitStageMismatch {
                semaphores: 1,
                stages: 0
            })
        ));
        assert!(gpu.submissions().is_empty());
        gpu.destroy_semaphore(semaphore);
    }

    #[test]
    fn blocking_submit_returns_with_fence_signaled() {
        let (gpu, ctx) = test_context(2);
        let mut cmd = CommandBuffer::new(&ctx).unwrap();
        let active = cmd.get_buffer(Frame::first()).unwrap();
        cmd.finalize(Frame::first()).unwrap();
        let fence = Fence::new(&ctx, false).unwrap();

        CommandBuffer::submit(
            &ctx,
            &Submission {
                command_buffers: &[active.handle],
                fence: Some(fence.handle()),
                block: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(fence.is_signaled().unwrap());
        assert_eq!(gpu.pending_submissions(), 0);
    }

    #[test]
    fn non_blocking_submit_leaves_work_in_flight() {
        let (gpu, ctx) = test_context(2);
        let fence = Fence::new(&ctx, false).unwrap();
        let stages = vec![vk::PipelineStageFlags::TRANSFER; 0];

        CommandBuffer::submit_to_queue(
            ctx.gpu(),
            ctx.queue(),
            &Submission {
                wait_stages: &stages,
                fence: Some(fence.handle()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!fence.is_signaled().unwrap());
        assert_eq!(gpu.pending_submissions(), 1);

        fence.wait().unwrap();
        assert!(fence.is_signaled().unwrap());
    }

    #[test]
    fn single_use_on_empty_buffer_signals_fence() {
        let (gpu, ctx) = test_context(2);
        let single = CommandBufferSingleUse::new(&ctx).unwrap();
        let fence = single.fence().clone();
        single.execute().unwrap();

        assert!(fence.is_signaled().unwrap());
        assert!(gpu.validation_messages().is_empty());
    }
}
