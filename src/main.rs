// =============================================================================
// INFLIGHT DEMO - upload -> readback task chain over frames in flight
// =============================================================================
//
// Runs without a window. Every frame:
//
//   host data --write--> upload[slot] --copy--> device[slot] --copy--> readback[slot]
//                        (task "upload", signals)       (task "readback", waits + fence)
//
// and checks the readback against what was written. Uses Vulkan when a driver
// loads, the in-process headless GPU otherwise.

use anyhow::{Context, Result};
use ash::vk;
use inflight::config::{Backend, Config, DemoConfig};
use inflight::{
    Buffer, BufferDesc, CommandBuffer, ContextDesc, CoreContext, Frame, FrameClock, Gpu, Handle,
    HeadlessGpu, HostAccess, Image, ImageDesc, SyncTask, VulkanDevice,
};
use std::fs::OpenOptions;
use std::io::Write;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting inflight demo");
    log::info!(
        "{} frame(s) in flight, {} frame(s) of {} bytes",
        config.frames.max_frames_in_flight,
        config.demo.frames,
        config.demo.buffer_size
    );

    let gpu = create_gpu(&config)?;
    let ctx = CoreContext::new(
        gpu,
        ContextDesc {
            max_frames_in_flight: config.frames.max_frames_in_flight,
            fence_timeout_ns: config.fence_timeout_ns(),
        },
    )
    .context("Failed to create core context")?;

    verify_image_round_trip(&ctx).context("Image round trip failed")?;
    run_frames(&ctx, &config.demo).context("Frame loop failed")?;

    log::info!("All frames verified");
    Ok(())
}

/// Initialize logging with optional file header
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(config.log_level());
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== inflight demo log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

fn create_gpu(config: &Config) -> Result<Box<dyn Gpu>> {
    let backend = config.backend();
    if backend != Backend::Headless {
        match VulkanDevice::enumerate_adapters() {
            Ok(adapters) => {
                for adapter in adapters {
                    log::info!(
                        "Adapter: {} (dedicated: {}, local: {} MiB, shared: {} MiB)",
                        adapter.name,
                        adapter.dedicated,
                        adapter.device_local_bytes >> 20,
                        adapter.shared_bytes >> 20
                    );
                }
            }
            Err(e) => log::debug!("Adapter enumeration failed: {}", e),
        }
    }

    match backend {
        Backend::Headless => Ok(Box::new(HeadlessGpu::new())),
        Backend::Vulkan => {
            let device =
                VulkanDevice::new(&config.device).context("Failed to create Vulkan device")?;
            Ok(Box::new(device))
        }
        Backend::Auto => match VulkanDevice::new(&config.device) {
            Ok(device) => Ok(Box::new(device)),
            Err(e) => {
                log::warn!("Vulkan unavailable ({}), falling back to headless GPU", e);
                Ok(Box::new(HeadlessGpu::new()))
            }
        },
    }
}

// =============================================================================
// WORKLOAD
// =============================================================================

/// Deterministic per-frame payload so stale slots show up as mismatches.
fn fill_payload(payload: &mut [u8], frame: Frame) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i as u64).wrapping_add(frame.number.wrapping_mul(31)) as u8;
    }
}

fn run_frames(ctx: &Handle<CoreContext>, demo: &DemoConfig) -> Result<()> {
    let size = demo.buffer_size.max(1);
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER;

    let mut upload_buffer = Buffer::new(
        ctx,
        BufferDesc::host(size, usage).frame_resident().named("upload"),
    )?;
    let device_buffer = Buffer::new(
        ctx,
        BufferDesc::device(size, usage).frame_resident().named("device"),
    )?;
    let readback_buffer = Buffer::new(
        ctx,
        BufferDesc::host(size, usage)
            .with_access(HostAccess::Random)
            .frame_resident()
            .named("readback"),
    )?;

    let mut upload_cmd = CommandBuffer::new(ctx)?;
    let mut readback_cmd = CommandBuffer::new(ctx)?;

    // readback waits for upload's copy at the transfer stage
    let upload = SyncTask::new(ctx, "upload");
    let readback = SyncTask::with_fence(ctx, "readback", false)?;
    readback.add_dependency(&upload, vk::PipelineStageFlags::TRANSFER)?;

    let mut clock = FrameClock::new(ctx.max_frames_in_flight());
    let mut payload = vec![0u8; size as usize];
    let mut result = vec![0u8; size as usize];

    for _ in 0..demo.frames {
        let frame = clock.current();

        fill_payload(&mut payload, frame);
        upload_buffer.write(frame, 0, &payload)?;

        let active = upload_cmd.get_buffer(frame)?;
        if active.recording {
            upload_buffer.copy_to_whole(active.handle, frame, &device_buffer)?;
            upload_cmd.finalize(frame)?;
        }
        let active = readback_cmd.get_buffer(frame)?;
        if active.recording {
            device_buffer.copy_to_whole(active.handle, frame, &readback_buffer)?;
            readback_cmd.finalize(frame)?;
        }

        // Dependency order: producer first
        upload.submit_command_buffer(&upload_cmd, frame)?;
        let report = readback.submit_command_buffer(&readback_cmd, frame)?;
        readback.wait_completion()?;

        readback_buffer.read(frame, 0, &mut result)?;
        if result != payload {
            anyhow::bail!(
                "frame {} (slot {}): readback does not match upload",
                frame.number,
                frame.index
            );
        }
        log::info!(
            "Frame {} (slot {}): {} bytes verified, waited on {} semaphore(s)",
            frame.number,
            frame.index,
            size,
            report.waited.len()
        );

        clock.advance();
    }
    Ok(())
}

fn verify_image_round_trip(ctx: &Handle<CoreContext>) -> Result<()> {
    let layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    let desc = ImageDesc::new_2d(16, 16, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED)
        .named("checker")
        .frame_resident();
    let image = Image::new(ctx, desc)?;

    for index in 0..ctx.max_frames_in_flight() {
        let frame = Frame::new(index, index as u64);
        let pixels: Vec<u8> = (0..16 * 16 * 4)
            .map(|i: u32| ((i / 4 + index) % 2 * 255) as u8)
            .collect();
        image.write(frame, &pixels, vk::ImageLayout::UNDEFINED, layout)?;

        let mut out = vec![0u8; pixels.len()];
        image.read(frame, layout, &mut out)?;
        if out != pixels {
            anyhow::bail!("image slot {} does not match what was written", index);
        }
    }
    log::info!("Image round trip verified on {} slot(s)", image.slot_count());
    Ok(())
}
