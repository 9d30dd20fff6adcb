//! Frame Pipeline Tests
//!
//! End-to-end checks through the public API on the headless GPU:
//! - Task chains: semaphore hand-off across frames, read-and-clear consumption
//! - Frame residency: slot selection driven by FrameClock
//! - Command buffers: per-frame re-recording vs static buffers
//! - Handle lifetimes: every GPU object released with its last handle

use ash::vk;

use inflight::backend::HeadlessGpu;
use inflight::{
    Buffer, BufferDesc, CommandBuffer, CommandBufferSingleUse, ContextDesc, CoreContext, Error,
    Frame, FrameClock, Gpu, Handle, Image, ImageDesc, SharedHandle, SyncTask,
};

const TRANSFER: vk::PipelineStageFlags = vk::PipelineStageFlags::TRANSFER;
const STORAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::STORAGE_BUFFER;

fn context(max_frames_in_flight: u32) -> (HeadlessGpu, Handle<CoreContext>) {
    let gpu = HeadlessGpu::new();
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

// ============================================================================
// Task chain Tests
// ============================================================================

#[test]
fn chain_of_three_tasks_hands_off_every_frame() {
    let (gpu, ctx) = context(2);
    let a = SyncTask::new(&ctx, "a");
    let b = SyncTask::new(&ctx, "b");
    let c = SyncTask::with_fence(&ctx, "c", false).unwrap();
    b.add_dependency(&a, TRANSFER).unwrap();
    c.add_dependency(&b, vk::PipelineStageFlags::COMPUTE_SHADER).unwrap();

    for _ in 0..4 {
        a.submit_buffers(&[]).unwrap();
        let b_report = b.submit_buffers(&[]).unwrap();
        let c_report = c.submit_buffers(&[]).unwrap();
        assert_eq!(b_report.waited.len(), 1);
        assert_eq!(c_report.waited.len(), 1);
        assert_eq!(c_report.waited[0].semaphore, b.completion_semaphore().unwrap());
        assert_eq!(c_report.waited[0].stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        c.wait_completion().unwrap();
    }

    assert_eq!(gpu.submissions().len(), 12);
    assert!(gpu.validation_messages().is_empty());
}

#[test]
fn fan_in_waits_on_every_producer() {
    let (gpu, ctx) = context(2);
    let left = SyncTask::new(&ctx, "left");
    let right = SyncTask::new(&ctx, "right");
    let join = SyncTask::new(&ctx, "join");
    join.add_dependency(&left, TRANSFER).unwrap();
    join.add_dependency(&right, TRANSFER).unwrap();

    left.submit_buffers(&[]).unwrap();
    right.submit_buffers(&[]).unwrap();
    let report = join.submit_buffers(&[]).unwrap();

    let waited: Vec<_> = report.waited.iter().map(|w| w.semaphore).collect();
    assert_eq!(
        waited,
        vec![
            left.completion_semaphore().unwrap(),
            right.completion_semaphore().unwrap()
        ]
    );
    let last = gpu.last_submission().unwrap();
    assert_eq!(last.waits, report.waited);
}

#[test]
fn producer_skipped_this_frame_is_not_waited_on() {
    let (gpu, ctx) = context(2);
    let optional = SyncTask::new(&ctx, "optional");
    let always = SyncTask::new(&ctx, "always");
    let consumer = SyncTask::new(&ctx, "consumer");
    consumer.add_dependency(&optional, TRANSFER).unwrap();
    consumer.add_dependency(&always, TRANSFER).unwrap();

    always.submit_buffers(&[]).unwrap();
    let report = consumer.submit_buffers(&[]).unwrap();

    assert_eq!(report.waited.len(), 1);
    assert!(!consumer.dependencies()[0].was_consumed());
    assert!(consumer.dependencies()[1].was_consumed());
    gpu.complete_pending();
    assert!(gpu.validation_messages().is_empty());
}

#[test]
fn resubmitting_a_producer_is_reported() {
    let (gpu, ctx) = context(2);
    let producer = SyncTask::new(&ctx, "producer");
    let consumer = SyncTask::new(&ctx, "consumer");
    consumer.add_dependency(&producer, TRANSFER).unwrap();

    producer.submit_buffers(&[]).unwrap();
    assert!(matches!(
        producer.submit_buffers(&[]),
        Err(Error::UnconsumedSignal { .. })
    ));

    // Once consumed, the producer may run again
    consumer.submit_buffers(&[]).unwrap();
    producer.submit_buffers(&[]).unwrap();
    assert_eq!(gpu.submissions().len(), 3);
}

// ============================================================================
// Frame residency Tests
// ============================================================================

#[test]
fn clock_driven_writes_land_in_matching_slots() {
    let (_gpu, ctx) = context(3);
    let mut buffer = Buffer::new(&ctx, BufferDesc::host(1, STORAGE).frame_resident()).unwrap();
    let mut clock = FrameClock::new(ctx.max_frames_in_flight());

    let mut indices = Vec::new();
    for _ in 0..5 {
        let frame = clock.current();
        indices.push(frame.index);
        buffer.write(frame, 0, &[frame.number as u8]).unwrap();
        clock.advance();
    }
    assert_eq!(indices, vec![0, 1, 2, 0, 1]);

    let expected = [3u8, 4, 2];
    for (slot, value) in expected.iter().enumerate() {
        let mut out = [0u8];
        buffer.read(Frame::new(slot as u32, 5), 0, &mut out).unwrap();
        assert_eq!(out[0], *value, "slot {}", slot);
    }
}

#[test]
fn upload_and_readback_over_frames_in_flight() {
    let (gpu, ctx) = context(2);
    let mut upload_buffer =
        Buffer::new(&ctx, BufferDesc::host(64, STORAGE).frame_resident()).unwrap();
    let device_buffer =
        Buffer::new(&ctx, BufferDesc::device(64, STORAGE).frame_resident()).unwrap();
    let readback_buffer = upload_buffer.clone_layout().unwrap();

    let mut upload_cmd = CommandBuffer::new(&ctx).unwrap();
    let mut readback_cmd = CommandBuffer::new(&ctx).unwrap();
    let upload = SyncTask::new(&ctx, "upload");
    let readback = SyncTask::with_fence(&ctx, "readback", false).unwrap();
    readback.add_dependency(&upload, TRANSFER).unwrap();

    let mut clock = FrameClock::new(2);
    for _ in 0..6 {
        let frame = clock.current();
        let payload = [frame.number as u8 + 1; 64];
        upload_buffer.write(frame, 0, &payload).unwrap();

        let active = upload_cmd.get_buffer(frame).unwrap();
        assert!(active.recording);
        upload_buffer.copy_to_whole(active.handle, frame, &device_buffer).unwrap();
        upload_cmd.finalize(frame).unwrap();

        let active = readback_cmd.get_buffer(frame).unwrap();
        device_buffer.copy_to_whole(active.handle, frame, &readback_buffer).unwrap();
        readback_cmd.finalize(frame).unwrap();

        upload.submit_command_buffer(&upload_cmd, frame).unwrap();
        readback.submit_command_buffer(&readback_cmd, frame).unwrap();
        readback.wait_completion().unwrap();

        let mut out = [0u8; 64];
        readback_buffer.read(frame, 0, &mut out).unwrap();
        assert_eq!(out, payload);
        clock.advance();
    }
    assert!(gpu.validation_messages().is_empty());
}

#[test]
fn static_command_buffer_is_submitted_without_rerecording() {
    let (gpu, ctx) = context(3);
    let mut cmd = CommandBuffer::new_static(&ctx).unwrap();
    let task = SyncTask::with_fence(&ctx, "static", false).unwrap();

    let mut clock = FrameClock::new(3);
    let mut recorded = 0;
    for _ in 0..5 {
        let frame = clock.current();
        if cmd.get_buffer(frame).unwrap().recording {
            recorded += 1;
            cmd.finalize(frame).unwrap();
        }
        task.submit_command_buffer(&cmd, frame).unwrap();
        task.wait_completion().unwrap();
        clock.advance();
    }

    assert_eq!(recorded, 1);
    let submitted: Vec<_> = gpu
        .submissions()
        .iter()
        .map(|s| s.command_buffers[0])
        .collect();
    assert!(submitted.windows(2).all(|w| w[0] == w[1]));
}

// ============================================================================
// Lifetime Tests
// ============================================================================

#[test]
fn every_gpu_object_is_released_with_its_last_handle() {
    let (gpu, ctx) = context(2);
    {
        let _buffer = Buffer::new(&ctx, BufferDesc::device(16, STORAGE).frame_resident()).unwrap();
        let _image = Image::new(
            &ctx,
            ImageDesc::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED),
        )
        .unwrap();
        let _cmd = CommandBuffer::new(&ctx).unwrap();
        let single = CommandBufferSingleUse::new(&ctx).unwrap();
        single.execute().unwrap();

        let producer = SyncTask::new(&ctx, "p");
        let consumer = SyncTask::with_fence(&ctx, "c", true).unwrap();
        consumer.add_dependency(&producer, TRANSFER).unwrap();
        assert!(gpu.live_object_count() > 1);
    }
    // The command pool belongs to the context
    assert_eq!(gpu.live_object_count(), 1);

    drop(ctx);
    assert_eq!(gpu.live_object_count(), 0);
    assert!(gpu.validation_messages().is_empty());
}

#[test]
fn shared_handles_cross_threads() {
    let shared = SharedHandle::new(vec![1u32, 2, 3]);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let local = shared.clone();
            std::thread::spawn(move || local.iter().sum::<u32>())
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), 6);
    }
    assert_eq!(shared.ref_count(), 1);
}

#[test]
fn immediate_gpu_executes_at_submit() {
    let gpu = HeadlessGpu::immediate();
    let ctx = CoreContext::new(Box::new(gpu.clone()), ContextDesc::default()).unwrap();
    let task = SyncTask::with_fence(&ctx, "now", false).unwrap();
    task.submit_buffers(&[]).unwrap();

    let fence = task.completion_fence().unwrap();
    assert!(gpu.fence_signaled(fence).unwrap());
    assert_eq!(gpu.pending_submissions(), 0);
}
