// Synchronization - semaphores, fences and the task graph
//
// A SyncTask is one unit of GPU work. Edges say "this task waits for that
// task's output at this pipeline stage". On submit, each edge consumes the
// producer's pending signal (read-and-clear), so a binary semaphore is waited
// on at most once per signal. Tasks must be submitted in dependency order
// each frame; submitting a producer twice while its previous signal is still
// pending is reported as Error::UnconsumedSignal.
//
// Edges hold strong handles to their producers. A cycle of edges leaks.

use crate::backend::{SubmitBatch, WaitSemaphore};
use crate::command::{submit_batch, CommandBuffer};
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handle::Handle;
use ash::vk;
use std::cell::{Cell, Ref, RefCell};

// ============================================================================
// Primitives
// ============================================================================

/// Binary semaphore, destroyed with its last handle.
pub struct Semaphore {
    ctx: Handle<CoreContext>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(ctx: &Handle<CoreContext>) -> Result<Handle<Semaphore>> {
        let handle = ctx.gpu().create_semaphore()?;
        Ok(Handle::new(Self {
            ctx: ctx.clone(),
            handle,
        }))
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.ctx.gpu().destroy_semaphore(self.handle);
    }
}

pub struct Fence {
    ctx: Handle<CoreContext>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(ctx: &Handle<CoreContext>, signaled: bool) -> Result<Handle<Fence>> {
        let handle = ctx.gpu().create_fence(signaled)?;
        Ok(Handle::new(Self {
            ctx: ctx.clone(),
            handle,
        }))
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Waits using the context timeout.
    pub fn wait(&self) -> Result<()> {
        self.wait_timeout(self.ctx.fence_timeout_ns())
    }

    pub fn wait_timeout(&self, timeout_ns: u64) -> Result<()> {
        self.ctx.gpu().wait_for_fence(self.handle, timeout_ns)
    }

    /// Polls without blocking.
    pub fn is_signaled(&self) -> Result<bool> {
        self.ctx.gpu().fence_signaled(self.handle)
    }

    pub fn reset(&self) -> Result<()> {
        self.ctx.gpu().reset_fence(self.handle)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.ctx.gpu().destroy_fence(self.handle);
    }
}

// ============================================================================
// Task graph
// ============================================================================

/// "Wait for `producer` at `wait_stage`."
pub struct Dependency {
    producer: Handle<SyncTask>,
    wait_stage: vk::PipelineStageFlags,
    consumed: Cell<bool>,
}

impl Dependency {
    pub fn producer(&self) -> &Handle<SyncTask> {
        &self.producer
    }

    pub fn wait_stage(&self) -> vk::PipelineStageFlags {
        self.wait_stage
    }

    /// Whether the last submit of the dependent task waited on this edge.
    pub fn was_consumed(&self) -> bool {
        self.consumed.get()
    }
}

/// What a submission waited on and signalled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub waited: Vec<WaitSemaphore>,
    pub signaled: Option<vk::Semaphore>,
}

pub struct SyncTask {
    ctx: Handle<CoreContext>,
    name: String,
    /// Empty until some task depends on this one
    completion_semaphore: RefCell<Handle<Semaphore>>,
    completion_fence: Handle<Fence>,
    dependencies: RefCell<Vec<Dependency>>,
    /// Signalled and not yet waited on by any consumer
    executing: Cell<bool>,
}

impl SyncTask {
    pub fn new(ctx: &Handle<CoreContext>, name: impl Into<String>) -> Handle<SyncTask> {
        Handle::new(Self::build(ctx, name.into(), Handle::empty()))
    }

    /// A task whose submissions also signal a fence the CPU can wait on.
    pub fn with_fence(
        ctx: &Handle<CoreContext>,
        name: impl Into<String>,
        signaled: bool,
    ) -> Result<Handle<SyncTask>> {
        let fence = Fence::new(ctx, signaled)?;
        Ok(Handle::new(Self::build(ctx, name.into(), fence)))
    }

    fn build(ctx: &Handle<CoreContext>, name: String, completion_fence: Handle<Fence>) -> Self {
        log::debug!("Task '{}' created", name);
        Self {
            ctx: ctx.clone(),
            name,
            completion_semaphore: RefCell::new(Handle::empty()),
            completion_fence,
            dependencies: RefCell::new(Vec::new()),
            executing: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The semaphore this task signals on every submission, created on first
    /// request.
    pub fn get_or_create_completion_semaphore(&self) -> Result<vk::Semaphore> {
        let mut slot = self.completion_semaphore.borrow_mut();
        if !slot.is_valid_ref() {
            *slot = Semaphore::new(&self.ctx)?;
            log::debug!("Task '{}' now signals a completion semaphore", self.name);
        }
        Ok(slot.handle())
    }

    pub fn completion_semaphore(&self) -> Option<vk::Semaphore> {
        self.completion_semaphore.borrow().get().map(Semaphore::handle)
    }

    pub fn completion_fence(&self) -> Option<vk::Fence> {
        self.completion_fence.get().map(Fence::handle)
    }

    /// Makes every future submit of this task wait for `producer`'s latest
    /// signal at `wait_stage`.
    pub fn add_dependency(
        &self,
        producer: &Handle<SyncTask>,
        wait_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        assert!(
            !std::ptr::eq(&**producer, self),
            "task '{}' cannot depend on itself",
            self.name
        );
        producer.get_or_create_completion_semaphore()?;
        log::debug!(
            "Task '{}' waits on '{}' at {:?}",
            self.name,
            producer.name,
            wait_stage
        );
        self.dependencies.borrow_mut().push(Dependency {
            producer: producer.clone(),
            wait_stage,
            consumed: Cell::new(false),
        });
        Ok(())
    }

    pub fn dependencies(&self) -> Ref<'_, [Dependency]> {
        Ref::map(self.dependencies.borrow(), |deps| deps.as_slice())
    }

    pub fn submit(&self, cmd: vk::CommandBuffer) -> Result<SubmitReport> {
        self.submit_buffers(&[cmd])
    }

    /// Submits the slot of `buffer` that `frame` resolves to.
    pub fn submit_command_buffer(
        &self,
        buffer: &CommandBuffer,
        frame: Frame,
    ) -> Result<SubmitReport> {
        self.submit(buffer.readonly_buffer(frame))
    }

    /// One queue submission that waits on every producer with a pending
    /// signal and signals this task's semaphore and fence.
    pub fn submit_buffers(&self, command_buffers: &[vk::CommandBuffer]) -> Result<SubmitReport> {
        if self.executing.get() {
            log::error!(
                "Task '{}' submitted again before its signal was consumed",
                self.name
            );
            return Err(Error::UnconsumedSignal {
                task: self.name.clone(),
            });
        }

        let mut waited = Vec::new();
        for dep in self.dependencies.borrow().iter() {
            let pending = dep.producer.take_signal();
            dep.consumed.set(pending);
            if !pending {
                continue;
            }
            if let Some(semaphore) = dep.producer.completion_semaphore() {
                waited.push(WaitSemaphore {
                    semaphore,
                    stage: dep.wait_stage,
                });
            }
        }

        let signaled = self.completion_semaphore();
        let signals: Vec<vk::Semaphore> = signaled.into_iter().collect();
        let batch = SubmitBatch {
            command_buffers,
            waits: &waited,
            signals: &signals,
            fence: self.completion_fence(),
        };
        submit_batch(
            self.ctx.gpu(),
            self.ctx.queue(),
            &batch,
            false,
            self.ctx.fence_timeout_ns(),
        )?;

        if signaled.is_some() {
            self.executing.set(true);
        }
        log::trace!(
            "Task '{}' submitted: {} buffer(s), {} wait(s), signals={}",
            self.name,
            command_buffers.len(),
            waited.len(),
            signaled.is_some()
        );

        Ok(SubmitReport { waited, signaled })
    }

    /// Reads and clears the pending-signal flag. A true result obliges the
    /// caller to wait on the completion semaphore.
    pub fn take_signal(&self) -> bool {
        self.executing.replace(false)
    }

    pub fn is_executing(&self) -> bool {
        self.executing.get()
    }

    /// For consumers outside the task graph (presentation, for one) that
    /// waited on the semaphore themselves.
    pub fn reset_execution(&self) {
        self.executing.set(false);
    }

    /// Blocks until the last submission finished, then resets the fence for
    /// reuse. Tasks without a fence wait for the whole queue.
    pub fn wait_completion(&self) -> Result<()> {
        match self.completion_fence.get() {
            Some(fence) => {
                fence.wait()?;
                fence.reset()
            }
            None => self.ctx.gpu().queue_wait_idle(self.ctx.queue()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Gpu;
    use crate::context::test_context;

    const STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;

    #[test]
    fn consumer_waits_on_producer_exactly_once() {
        let (gpu, ctx) = test_context(2);
        let a = SyncTask::new(&ctx, "a");
        let b = SyncTask::new(&ctx, "b");
        b.add_dependency(&a, STAGE).unwrap();
        let a_semaphore = a.completion_semaphore().unwrap();

        let report = a.submit_buffers(&[]).unwrap();
        assert_eq!(report.signaled, Some(a_semaphore));
        assert!(a.is_executing());

        let report = b.submit_buffers(&[]).unwrap();
        assert_eq!(
            report.waited,
            vec![WaitSemaphore {
                semaphore: a_semaphore,
                stage: STAGE
            }]
        );
        assert!(!a.is_executing());
        assert!(b.dependencies()[0].was_consumed());

        // Without a new submission of `a` there is nothing left to wait on
        let report = b.submit_buffers(&[]).unwrap();
        assert!(report.waited.is_empty());
        assert!(!b.dependencies()[0].was_consumed());

        gpu.complete_pending();
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn double_submit_of_producer_is_rejected() {
        let (gpu, ctx) = test_context(2);
        let a = SyncTask::new(&ctx, "upload");
        let b = SyncTask::new(&ctx, "draw");
        b.add_dependency(&a, STAGE).unwrap();

        a.submit_buffers(&[]).unwrap();
        match a.submit_buffers(&[]) {
            Err(Error::UnconsumedSignal { task }) => assert_eq!(task, "upload"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(gpu.submissions().len(), 1);
    }

    #[test]
    fn task_without_consumers_never_signals() {
        let (gpu, ctx) = test_context(2);
        let task = SyncTask::new(&ctx, "standalone");
        task.submit_buffers(&[]).unwrap();
        task.submit_buffers(&[]).unwrap();
        assert!(!task.is_executing());
        assert!(gpu.submissions().iter().all(|s| s.signals.is_empty()));
    }

    #[test]
    fn completion_semaphore_is_created_once() {
        let (_gpu, ctx) = test_context(2);
        let task = SyncTask::new(&ctx, "t");
        let first = task.get_or_create_completion_semaphore().unwrap();
        assert_eq!(task.get_or_create_completion_semaphore().unwrap(), first);
    }

    #[test]
    fn fence_task_can_be_waited_and_reused() {
        let (gpu, ctx) = test_context(2);
        let task = SyncTask::with_fence(&ctx, "readback", false).unwrap();
        let fence = task.completion_fence().unwrap();

        for _ in 0..3 {
            task.submit_buffers(&[]).unwrap();
            assert_eq!(gpu.pending_submissions(), 1);
            task.wait_completion().unwrap();
            assert_eq!(gpu.pending_submissions(), 0);
            assert!(!gpu.fence_signaled(fence).unwrap());
        }
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn reset_execution_drops_pending_signal() {
        let (_gpu, ctx) = test_context(2);
        let a = SyncTask::new(&ctx, "a");
        a.get_or_create_completion_semaphore().unwrap();
        a.submit_buffers(&[]).unwrap();
        assert!(a.is_executing());
        a.reset_execution();
        assert!(!a.is_executing());
    }

    #[test]
    #[should_panic(expected = "cannot depend on itself")]
    fn self_dependency_panics() {
        let (_gpu, ctx) = test_context(2);
        let a = SyncTask::new(&ctx, "a");
        let _ = a.add_dependency(&a, STAGE);
    }

    #[test]
    fn tasks_release_their_objects() {
        let (gpu, ctx) = test_context(2);
        {
            let a = SyncTask::with_fence(&ctx, "a", true).unwrap();
            let b = SyncTask::new(&ctx, "b");
            b.add_dependency(&a, STAGE).unwrap();
        }
        // Only the command pool remains
        assert_eq!(gpu.live_object_count(), 1);
    }
}
