// Headless GPU - a software queue implementing the Gpu trait
//
// Used by the test-suite and by the demo when no Vulkan driver is available.
//
// - Command buffers record copy, blit and barrier commands
// - Submissions are queued and only "execute" when the CPU waits on a fence,
//   waits for idle, or calls complete_pending() (or at submit time in
//   immediate mode), so non-blocking submission is observable
// - Image layouts are tracked per mip level and checked by every transfer
// - Misuse a validation layer would flag is collected as messages instead of
//   aborting, so tests can assert on it

use super::gpu::{
    mip_extent, texel_size, BufferAllocDesc, GpuBuffer, GpuImage, ImageAllocDesc, SubmitBatch,
    WaitSemaphore,
};
use super::Gpu;
use crate::error::{Error, Result};
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::rc::Rc;

const QUEUE_HANDLE: u64 = 0x51;

/// Outcome of executing one command; the message becomes a validation entry.
type Check<T = ()> = std::result::Result<T, String>;

/// Zero-initialised host memory only ever touched through raw pointers, so
/// mapped pointers handed out to resources stay valid until destruction.
struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let leaked: &mut [u8] = Box::leak(vec![0u8; len.max(1)].into_boxed_slice());
        let len = leaked.len();
        Self {
            ptr: NonNull::from(leaked).cast::<u8>(),
            len,
        }
    }

    fn contains(&self, offset: u64, size: u64) -> bool {
        offset
            .checked_add(size)
            .map_or(false, |end| end <= self.len as u64)
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> bool {
        if !self.contains(offset, out.len() as u64) {
            return false;
        }
        // SAFETY: bounds checked above
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        true
    }

    fn write(&self, offset: u64, data: &[u8]) -> bool {
        if !self.contains(offset, data.len() as u64) {
            return false;
        }
        // SAFETY: bounds checked above
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        true
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from the boxed slice leaked in `zeroed`
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Copies `len` bytes between two host memories, returning false when either
/// range is out of bounds.
fn copy_between(
    src: &HostMemory,
    src_offset: u64,
    dst: &HostMemory,
    dst_offset: u64,
    len: u64,
) -> bool {
    if !src.contains(src_offset, len) || !dst.contains(dst_offset, len) {
        return false;
    }
    // SAFETY: both ranges were bounds checked; `copy` tolerates overlap
    unsafe {
        ptr::copy(
            src.ptr.as_ptr().add(src_offset as usize),
            dst.ptr.as_ptr().add(dst_offset as usize),
            len as usize,
        );
    }
    true
}

/// Every mip level stored back to back, each holding all array layers.
struct ImageMemory {
    memory: HostMemory,
    extent: vk::Extent3D,
    layers: u32,
    texel: u64,
    format: vk::Format,
    mip_offsets: Vec<u64>,
    /// One layout per mip level; array layers move together
    layouts: Vec<vk::ImageLayout>,
}

impl ImageMemory {
    fn new(desc: &ImageAllocDesc, texel: u64) -> Self {
        let levels = desc.mip_levels.max(1);
        let mut mip_offsets = Vec::with_capacity(levels as usize);
        let mut total = 0u64;
        for level in 0..levels {
            mip_offsets.push(total);
            let e = mip_extent(desc.extent, level);
            total += e.width as u64 * e.height as u64 * e.depth as u64
                * desc.array_layers as u64
                * texel;
        }
        Self {
            memory: HostMemory::zeroed(total as usize),
            extent: desc.extent,
            layers: desc.array_layers,
            texel,
            format: desc.format,
            mip_offsets,
            layouts: vec![vk::ImageLayout::UNDEFINED; levels as usize],
        }
    }

    /// Byte offset of one texel, None when it lies outside the image.
    fn texel_offset(&self, mip: u32, layer: u32, x: u32, y: u32, z: u32) -> Option<u64> {
        let base = *self.mip_offsets.get(mip as usize)?;
        let e = mip_extent(self.extent, mip);
        if layer >= self.layers || x >= e.width || y >= e.height || z >= e.depth {
            return None;
        }
        let (w, h, d) = (e.width as u64, e.height as u64, e.depth as u64);
        let index = ((layer as u64 * d + z as u64) * h + y as u64) * w + x as u64;
        Some(base + index * self.texel)
    }

    /// Whether `layers` starting at the subresource's base and the box at
    /// `offset` of `size` fit inside its mip level.
    fn contains(
        &self,
        subresource: &vk::ImageSubresourceLayers,
        offset: vk::Offset3D,
        size: vk::Extent3D,
    ) -> bool {
        if subresource.mip_level as usize >= self.mip_offsets.len()
            || subresource.base_array_layer as u64 + subresource.layer_count as u64
                > self.layers as u64
            || offset.x < 0
            || offset.y < 0
            || offset.z < 0
        {
            return false;
        }
        let e = mip_extent(self.extent, subresource.mip_level);
        offset.x as u64 + size.width as u64 <= e.width as u64
            && offset.y as u64 + size.height as u64 <= e.height as u64
            && offset.z as u64 + size.depth as u64 <= e.depth as u64
    }

    fn expect_layout(&self, image: vk::Image, mip: u32, layout: vk::ImageLayout) -> Check {
        match self.layouts.get(mip as usize) {
            Some(&current) if current == layout => Ok(()),
            Some(&current) => Err(format!(
                "image {:?} mip {} used as {:?} while in {:?}",
                image, mip, layout, current
            )),
            None => Err(format!("image {:?} has no mip {}", image, mip)),
        }
    }
}

/// Formats whose channels are all 8-bit normalized, which a linear blit can
/// average byte by byte.
fn has_byte_channels(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::R8_UNORM
            | vk::Format::R8_SRGB
            | vk::Format::R8G8_UNORM
            | vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
    )
}

#[derive(Debug, Clone)]
enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    ImageBarrier {
        image: vk::Image,
        new_layout: vk::ImageLayout,
        base_mip: u32,
        level_count: u32,
    },
}

#[derive(Default)]
struct CommandState {
    recording: bool,
    commands: Vec<Command>,
}

/// Fence lifecycle as seen by the emulated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Unsignaled,
    /// Attached to a submission that has not executed yet
    Pending,
    Signaled,
}

/// A queue submission as the queue received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<WaitSemaphore>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

struct PendingWork {
    commands: Vec<Command>,
    fence: Option<vk::Fence>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    immediate: bool,
    semaphores: HashMap<vk::Semaphore, bool>,
    fences: HashMap<vk::Fence, FenceState>,
    pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, CommandState>,
    buffers: HashMap<vk::Buffer, HostMemory>,
    images: HashMap<vk::Image, ImageMemory>,
    pending: VecDeque<PendingWork>,
    submissions: Vec<SubmissionRecord>,
    validation: Vec<String>,
    flushes: usize,
    invalidations: usize,
}

impl State {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        // Keep clear of the queue handle
        QUEUE_HANDLE + self.next_handle
    }

    fn report(&mut self, message: String) {
        log::warn!("[Headless validation] {}", message);
        self.validation.push(message);
    }

    /// Executes queued work in submission order. Stops after the submission
    /// carrying `until`, or drains the queue when `until` is None.
    fn execute(&mut self, until: Option<vk::Fence>) {
        while let Some(work) = self.pending.pop_front() {
            for command in &work.commands {
                if let Err(message) = self.run(command) {
                    self.report(message);
                }
            }
            if let Some(fence) = work.fence {
                self.fences.insert(fence, FenceState::Signaled);
            }
            if until.is_some() && work.fence == until {
                break;
            }
        }
    }

    fn buffer(&self, handle: vk::Buffer) -> Check<&HostMemory> {
        self.buffers
            .get(&handle)
            .ok_or_else(|| format!("use of destroyed or unknown buffer {:?}", handle))
    }

    fn image(&self, handle: vk::Image) -> Check<&ImageMemory> {
        self.images
            .get(&handle)
            .ok_or_else(|| format!("use of destroyed or unknown image {:?}", handle))
    }

    fn run(&mut self, command: &Command) -> Check {
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                let (s, d) = (self.buffer(*src)?, self.buffer(*dst)?);
                let ok = regions
                    .iter()
                    .all(|r| copy_between(s, r.src_offset, d, r.dst_offset, r.size));
                if !ok {
                    return Err(format!("buffer copy {:?} -> {:?} is out of bounds", src, dst));
                }
            }
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                let (buffer, image) = (self.buffer(*src)?, self.image(*dst)?);
                for region in regions {
                    image.expect_layout(*dst, region.image_subresource.mip_level, *dst_layout)?;
                    if !copy_image_region(buffer, image, region, true) {
                        return Err(format!(
                            "buffer to image copy {:?} -> {:?} is out of bounds",
                            src, dst
                        ));
                    }
                }
            }
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions,
            } => {
                let (image, buffer) = (self.image(*src)?, self.buffer(*dst)?);
                for region in regions {
                    image.expect_layout(*src, region.image_subresource.mip_level, *src_layout)?;
                    if !copy_image_region(buffer, image, region, false) {
                        return Err(format!(
                            "image to buffer copy {:?} -> {:?} is out of bounds",
                            src, dst
                        ));
                    }
                }
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                let (s, d) = (self.image(*src)?, self.image(*dst)?);
                for region in regions {
                    s.expect_layout(*src, region.src_subresource.mip_level, *src_layout)?;
                    d.expect_layout(*dst, region.dst_subresource.mip_level, *dst_layout)?;
                    if !copy_between_images(s, d, region) {
                        return Err(format!("image copy {:?} -> {:?} is invalid", src, dst));
                    }
                }
            }
            Command::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
                filter,
            } => {
                let (s, d) = (self.image(*src)?, self.image(*dst)?);
                for region in regions {
                    s.expect_layout(*src, region.src_subresource.mip_level, *src_layout)?;
                    d.expect_layout(*dst, region.dst_subresource.mip_level, *dst_layout)?;
                    if !blit_region(s, d, region, *filter) {
                        return Err(format!("blit {:?} -> {:?} is invalid", src, dst));
                    }
                }
            }
            Command::ImageBarrier {
                image,
                new_layout,
                base_mip,
                level_count,
            } => {
                let img = self
                    .images
                    .get_mut(image)
                    .ok_or_else(|| format!("barrier on unknown image {:?}", image))?;
                let levels = img.layouts.len();
                let end = if *level_count == vk::REMAINING_MIP_LEVELS {
                    levels
                } else {
                    (base_mip.saturating_add(*level_count) as usize).min(levels)
                };
                for layout in img.layouts.iter_mut().take(end).skip(*base_mip as usize) {
                    *layout = *new_layout;
                }
            }
        }
        Ok(())
    }
}

/// Copies one `BufferImageCopy` region in either direction.
fn copy_image_region(
    buffer: &HostMemory,
    image: &ImageMemory,
    region: &vk::BufferImageCopy,
    to_image: bool,
) -> bool {
    let sub = &region.image_subresource;
    let e = region.image_extent;
    let o = region.image_offset;
    if !image.contains(sub, o, e) {
        return false;
    }
    let row_length = match region.buffer_row_length {
        0 => e.width,
        n => n,
    };
    let image_height = match region.buffer_image_height {
        0 => e.height,
        n => n,
    };
    let row_bytes = e.width as u64 * image.texel;

    for layer in 0..sub.layer_count {
        for z in 0..e.depth {
            for y in 0..e.height {
                let row = (layer as u64 * e.depth as u64 + z as u64) * image_height as u64
                    + y as u64;
                let buffer_offset = region.buffer_offset + row * row_length as u64 * image.texel;
                let image_offset = match image.texel_offset(
                    sub.mip_level,
                    sub.base_array_layer + layer,
                    o.x as u32,
                    o.y as u32 + y,
                    o.z as u32 + z,
                ) {
                    Some(offset) => offset,
                    None => return false,
                };
                let copied = if to_image {
                    copy_between(buffer, buffer_offset, &image.memory, image_offset, row_bytes)
                } else {
                    copy_between(&image.memory, image_offset, buffer, buffer_offset, row_bytes)
                };
                if !copied {
                    return false;
                }
            }
        }
    }
    true
}

fn copy_between_images(src: &ImageMemory, dst: &ImageMemory, region: &vk::ImageCopy) -> bool {
    let (ss, ds) = (&region.src_subresource, &region.dst_subresource);
    let e = region.extent;
    if src.texel != dst.texel
        || ss.layer_count != ds.layer_count
        || !src.contains(ss, region.src_offset, e)
        || !dst.contains(ds, region.dst_offset, e)
    {
        return false;
    }
    let (so, d_o) = (region.src_offset, region.dst_offset);
    let row_bytes = e.width as u64 * src.texel;
    for layer in 0..ss.layer_count {
        for z in 0..e.depth {
            for y in 0..e.height {
                let from = src.texel_offset(
                    ss.mip_level,
                    ss.base_array_layer + layer,
                    so.x as u32,
                    so.y as u32 + y,
                    so.z as u32 + z,
                );
                let to = dst.texel_offset(
                    ds.mip_level,
                    ds.base_array_layer + layer,
                    d_o.x as u32,
                    d_o.y as u32 + y,
                    d_o.z as u32 + z,
                );
                match (from, to) {
                    (Some(from), Some(to)) => {
                        if !copy_between(&src.memory, from, &dst.memory, to, row_bytes) {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
        }
    }
    true
}

/// Size of the box between two blit corners. Mirrored boxes are not
/// emulated.
fn box_size(a: vk::Offset3D, b: vk::Offset3D) -> Option<vk::Extent3D> {
    if a.x < 0 || a.y < 0 || a.z < 0 || b.x <= a.x || b.y <= a.y || b.z <= a.z {
        return None;
    }
    Some(vk::Extent3D {
        width: (b.x - a.x) as u32,
        height: (b.y - a.y) as u32,
        depth: (b.z - a.z) as u32,
    })
}

/// Source texels covered by destination texel `i` when `src` texels are
/// scaled onto `dst`. Never empty.
fn covered(i: u32, src: u32, dst: u32) -> Range<u32> {
    let (i, src, dst) = (i as u64, src as u64, dst as u64);
    let start = i * src / dst;
    let end = ((i + 1) * src + dst - 1) / dst;
    start as u32..end.max(start + 1) as u32
}

/// Source texel under the centre of destination texel `i`.
fn nearest(i: u32, src: u32, dst: u32) -> u32 {
    ((2 * i as u64 + 1) * src as u64 / (2 * dst as u64)) as u32
}

/// Scales one region. LINEAR on 8-bit formats averages every covered source
/// texel (what hardware bilinear gives for an exact 2:1 reduction); anything
/// else samples the nearest texel.
fn blit_region(
    src: &ImageMemory,
    dst: &ImageMemory,
    region: &vk::ImageBlit,
    filter: vk::Filter,
) -> bool {
    let (ss, ds) = (&region.src_subresource, &region.dst_subresource);
    let (s0, d0) = (region.src_offsets[0], region.dst_offsets[0]);
    let (src_size, dst_size) = match (
        box_size(s0, region.src_offsets[1]),
        box_size(d0, region.dst_offsets[1]),
    ) {
        (Some(s), Some(d)) => (s, d),
        _ => return false,
    };
    if src.texel != dst.texel
        || ss.layer_count != ds.layer_count
        || !src.contains(ss, s0, src_size)
        || !dst.contains(ds, d0, dst_size)
    {
        return false;
    }

    let average = filter == vk::Filter::LINEAR && has_byte_channels(src.format);
    let texel = src.texel as usize;
    let mut sample = vec![0u8; texel];
    let mut sum = vec![0u32; texel];
    let mut out = vec![0u8; texel];

    for layer in 0..ss.layer_count {
        let src_at = |x: u32, y: u32, z: u32| {
            src.texel_offset(
                ss.mip_level,
                ss.base_array_layer + layer,
                s0.x as u32 + x,
                s0.y as u32 + y,
                s0.z as u32 + z,
            )
        };
        for z in 0..dst_size.depth {
            for y in 0..dst_size.height {
                for x in 0..dst_size.width {
                    if average {
                        sum.iter_mut().for_each(|s| *s = 0);
                        let mut count = 0u32;
                        for sz in covered(z, src_size.depth, dst_size.depth) {
                            for sy in covered(y, src_size.height, dst_size.height) {
                                for sx in covered(x, src_size.width, dst_size.width) {
                                    match src_at(sx, sy, sz) {
                                        Some(offset) if src.memory.read(offset, &mut sample) => {}
                                        _ => return false,
                                    }
                                    for (total, byte) in sum.iter_mut().zip(&sample) {
                                        *total += *byte as u32;
                                    }
                                    count += 1;
                                }
                            }
                        }
                        for (byte, total) in out.iter_mut().zip(&sum) {
                            *byte = ((total + count / 2) / count) as u8;
                        }
                    } else {
                        let at = src_at(
                            nearest(x, src_size.width, dst_size.width),
                            nearest(y, src_size.height, dst_size.height),
                            nearest(z, src_size.depth, dst_size.depth),
                        );
                        match at {
                            Some(offset) if src.memory.read(offset, &mut out) => {}
                            _ => return false,
                        }
                    }

                    let target = dst.texel_offset(
                        ds.mip_level,
                        ds.base_array_layer + layer,
                        d0.x as u32 + x,
                        d0.y as u32 + y,
                        d0.z as u32 + z,
                    );
                    match target {
                        Some(offset) if dst.memory.write(offset, &out) => {}
                        _ => return false,
                    }
                }
            }
        }
    }
    true
}


/// In-process stand-in for a Vulkan device with a single queue.
///
/// Cloning shares the same emulated device, so a test can keep a clone to
/// inspect what the core submitted.
#[derive(Clone, Default)]
pub struct HeadlessGpu {
    state: Rc<RefCell<State>>,
}

impl HeadlessGpu {
    /// Work executes only when the CPU waits or `complete_pending` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Work executes at submission time.
    pub fn immediate() -> Self {
        let gpu = Self::default();
        gpu.state.borrow_mut().immediate = true;
        gpu
    }

    /// Lets the "GPU" catch up with everything submitted so far.
    pub fn complete_pending(&self) {
        self.state.borrow_mut().execute(None);
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.borrow().submissions.clone()
    }

    pub fn last_submission(&self) -> Option<SubmissionRecord> {
        self.state.borrow().submissions.last().cloned()
    }

    pub fn validation_messages(&self) -> Vec<String> {
        self.state.borrow().validation.clone()
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.borrow().fences.get(&fence).copied()
    }

    /// Layout of mip level 0.
    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.mip_layouts(image)?.first().copied()
    }

    /// Layout of every mip level, in order.
    pub fn mip_layouts(&self, image: vk::Image) -> Option<Vec<vk::ImageLayout>> {
        self.state.borrow().images.get(&image).map(|i| i.layouts.clone())
    }

    pub fn flush_count(&self) -> usize {
        self.state.borrow().flushes
    }

    pub fn invalidate_count(&self) -> usize {
        self.state.borrow().invalidations
    }

    /// Semaphores, fences, pools, command buffers, buffers and images that
    /// have been created and not destroyed yet.
    pub fn live_object_count(&self) -> usize {
        let s = self.state.borrow();
        s.semaphores.len()
            + s.fences.len()
            + s.pools.len()
            + s.command_buffers.len()
            + s.buffers.len()
            + s.images.len()
    }

    fn record(&self, cmd: vk::CommandBuffer, command: Command) {
        let mut s = self.state.borrow_mut();
        match s.command_buffers.get_mut(&cmd) {
            Some(cb) if cb.recording => cb.commands.push(command),
            Some(_) => s.report(format!("command recorded into {:?} outside begin/end", cmd)),
            None => s.report(format!("command recorded into unknown command buffer {:?}", cmd)),
        }
    }
}

impl Gpu for HeadlessGpu {
    fn name(&self) -> &str {
        "headless"
    }

    fn queue(&self) -> vk::Queue {
        vk::Queue::from_raw(QUEUE_HANDLE)
    }

    fn queue_family_index(&self) -> u32 {
        0
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut s = self.state.borrow_mut();
        let semaphore = vk::Semaphore::from_raw(s.next_raw());
        s.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut s = self.state.borrow_mut();
        if s.semaphores.remove(&semaphore).is_none() {
            s.report(format!("destroy of unknown semaphore {:?}", semaphore));
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut s = self.state.borrow_mut();
        let fence = vk::Fence::from_raw(s.next_raw());
        let state = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        s.fences.insert(fence, state);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.state.borrow_mut();
        match s.fences.remove(&fence) {
            Some(FenceState::Pending) => {
                s.report(format!("destroyed fence {:?} while in use", fence))
            }
            Some(_) => {}
            None => s.report(format!("destroy of unknown fence {:?}", fence)),
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        let mut s = self.state.borrow_mut();
        match s.fences.get(&fence).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                s.execute(Some(fence));
                Ok(())
            }
            Some(FenceState::Unsignaled) => {
                // Nothing will ever signal it; a real device would hang here
                s.report(format!("wait on fence {:?} that was never submitted", fence));
                Err(Error::FenceTimeout { timeout_ns })
            }
            None => {
                s.report(format!("wait on unknown fence {:?}", fence));
                Err(Error::Vk {
                    call: "vkWaitForFences",
                    result: vk::Result::ERROR_UNKNOWN,
                })
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(self.state.borrow().fences.get(&fence) == Some(&FenceState::Signaled))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut s = self.state.borrow_mut();
        if s.fences.get(&fence) == Some(&FenceState::Pending) {
            s.report(format!("reset of fence {:?} still in use by a submission", fence));
        }
        s.fences.insert(fence, FenceState::Unsignaled);
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, batch: &SubmitBatch) -> Result<()> {
        let mut s = self.state.borrow_mut();
        if queue != vk::Queue::from_raw(QUEUE_HANDLE) {
            s.report(format!("submit to unknown queue {:?}", queue));
        }

        for wait in batch.waits {
            match s.semaphores.get(&wait.semaphore).copied() {
                Some(true) => {
                    s.semaphores.insert(wait.semaphore, false);
                }
                Some(false) => s.report(format!(
                    "wait on semaphore {:?} that has no pending signal",
                    wait.semaphore
                )),
                None => s.report(format!("wait on unknown semaphore {:?}", wait.semaphore)),
            }
        }
        for &signal in batch.signals {
            match s.semaphores.get(&signal).copied() {
                Some(false) => {
                    s.semaphores.insert(signal, true);
                }
                Some(true) => s.report(format!(
                    "signal of semaphore {:?} that is already signaled",
                    signal
                )),
                None => s.report(format!("signal of unknown semaphore {:?}", signal)),
            }
        }
        if let Some(fence) = batch.fence {
            match s.fences.get(&fence).copied() {
                Some(FenceState::Unsignaled) => {
                    s.fences.insert(fence, FenceState::Pending);
                }
                Some(state) => {
                    s.report(format!("submit with fence {:?} in state {:?}", fence, state))
                }
                None => s.report(format!("submit with unknown fence {:?}", fence)),
            }
        }

        let mut commands = Vec::new();
        for cmd in batch.command_buffers {
            let snapshot = match s.command_buffers.get(cmd) {
                Some(cb) if cb.recording => {
                    Err(format!("submit of {:?} while still recording", cmd))
                }
                Some(cb) => Ok(cb.commands.clone()),
                None => Err(format!("submit of unknown command buffer {:?}", cmd)),
            };
            match snapshot {
                Ok(recorded) => commands.extend(recorded),
                Err(message) => s.report(message),
            }
        }

        s.submissions.push(SubmissionRecord {
            command_buffers: batch.command_buffers.to_vec(),
            waits: batch.waits.to_vec(),
            signals: batch.signals.to_vec(),
            fence: batch.fence,
        });
        s.pending.push_back(PendingWork {
            commands,
            fence: batch.fence,
        });
        if s.immediate {
            s.execute(None);
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> Result<()> {
        self.complete_pending();
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.complete_pending();
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let mut s = self.state.borrow_mut();
        let pool = vk::CommandPool::from_raw(s.next_raw());
        s.pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut s = self.state.borrow_mut();
        if !s.pools.remove(&pool) {
            s.report(format!("destroy of unknown command pool {:?}", pool));
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut s = self.state.borrow_mut();
        if !s.pools.contains(&pool) {
            s.report(format!("allocation from unknown command pool {:?}", pool));
        }
        let buffers: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(s.next_raw()))
            .collect();
        for &cmd in &buffers {
            s.command_buffers.insert(cmd, CommandState::default());
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut s = self.state.borrow_mut();
        for cmd in buffers {
            if s.command_buffers.remove(cmd).is_none() {
                s.report(format!("free of unknown command buffer {:?}", cmd));
            }
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time_submit: bool) -> Result<()> {
        let mut s = self.state.borrow_mut();
        match s.command_buffers.get_mut(&cmd) {
            Some(cb) if cb.recording => {
                s.report(format!("begin of {:?} while already recording", cmd));
            }
            Some(cb) => {
                // Begin implicitly resets (pool created with RESET_COMMAND_BUFFER)
                cb.recording = true;
                cb.commands.clear();
            }
            None => s.report(format!("begin of unknown command buffer {:?}", cmd)),
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut s = self.state.borrow_mut();
        match s.command_buffers.get_mut(&cmd) {
            Some(cb) if cb.recording => cb.recording = false,
            Some(_) => s.report(format!("end of {:?} which is not recording", cmd)),
            None => s.report(format!("end of unknown command buffer {:?}", cmd)),
        }
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut s = self.state.borrow_mut();
        match s.command_buffers.get_mut(&cmd) {
            Some(cb) => *cb = CommandState::default(),
            None => s.report(format!("reset of unknown command buffer {:?}", cmd)),
        }
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            cmd,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cmd,
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.record(
            cmd,
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.record(
            cmd,
            Command::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions: regions.to_vec(),
                filter,
            },
        );
    }

    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        self.record(
            cmd,
            Command::ImageBarrier {
                image: barrier.image,
                new_layout: barrier.new_layout,
                base_mip: barrier.subresource_range.base_mip_level,
                level_count: barrier.subresource_range.level_count,
            },
        );
    }

    fn create_buffer(&self, desc: &BufferAllocDesc) -> Result<GpuBuffer> {
        let mut s = self.state.borrow_mut();
        let handle = vk::Buffer::from_raw(s.next_raw());
        let memory = HostMemory::zeroed(desc.size as usize);
        let mapped = match desc.location {
            MemoryLocation::GpuOnly => None,
            _ => Some(memory.ptr),
        };
        s.buffers.insert(handle, memory);
        log::trace!("Headless buffer '{}' ({} bytes) -> {:?}", desc.name, desc.size, handle);
        Ok(GpuBuffer {
            handle,
            size: desc.size,
            mapped,
            // Readback memory is modelled as cached, non-coherent memory
            coherent: desc.location != MemoryLocation::GpuToCpu,
            allocation: None,
        })
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut s = self.state.borrow_mut();
        if s.buffers.remove(&buffer.handle).is_none() {
            s.report(format!("destroy of unknown buffer {:?}", buffer.handle));
        }
    }

    fn create_image(&self, desc: &ImageAllocDesc) -> Result<GpuImage> {
        let texel = texel_size(desc.format).ok_or(Error::UnsupportedFormat(desc.format))?;
        let mut s = self.state.borrow_mut();
        let handle = vk::Image::from_raw(s.next_raw());
        s.images.insert(handle, ImageMemory::new(desc, texel));
        Ok(GpuImage {
            handle,
            extent: desc.extent,
            format: desc.format,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            allocation: None,
        })
    }

    fn destroy_image(&self, image: GpuImage) {
        let mut s = self.state.borrow_mut();
        if s.images.remove(&image.handle).is_none() {
            s.report(format!("destroy of unknown image {:?}", image.handle));
        }
    }

    fn flush_mapped(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()> {
        let mut s = self.state.borrow_mut();
        let in_range = s
            .buffers
            .get(&buffer.handle)
            .map_or(false, |m| m.contains(offset, size));
        if !in_range {
            s.report(format!("flush of {:?} outside its memory", buffer.handle));
        }
        s.flushes += 1;
        Ok(())
    }

    fn invalidate_mapped(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Result<()> {
        let mut s = self.state.borrow_mut();
        let in_range = s
            .buffers
            .get(&buffer.handle)
            .map_or(false, |m| m.contains(offset, size));
        if !in_range {
            s.report(format!("invalidate of {:?} outside its memory", buffer.handle));
        }
        s.invalidations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_buffer(gpu: &HeadlessGpu, size: u64) -> GpuBuffer {
        gpu.create_buffer(&BufferAllocDesc {
            name: "test",
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::CpuToGpu,
        })
        .unwrap()
    }

    fn write(buffer: &GpuBuffer, bytes: &[u8]) {
        let ptr = buffer.mapped.unwrap();
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
    }

    fn read(buffer: &GpuBuffer, len: usize) -> Vec<u8> {
        let ptr = buffer.mapped.unwrap();
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec()
    }

    #[test]
    fn copies_run_when_cpu_waits() {
        let gpu = HeadlessGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let cmd = gpu.allocate_command_buffers(pool, 1).unwrap()[0];
        let src = host_buffer(&gpu, 8);
        let dst = host_buffer(&gpu, 8);
        write(&src, &[1, 2, 3, 4, 5, 6, 7, 8]);

        gpu.begin_command_buffer(cmd, true).unwrap();
        let whole = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 8,
        };
        gpu.cmd_copy_buffer(cmd, src.handle, dst.handle, &[whole]);
        gpu.end_command_buffer(cmd).unwrap();

        let fence = gpu.create_fence(false).unwrap();
        gpu.queue_submit(
            gpu.queue(),
            &SubmitBatch {
                command_buffers: &[cmd],
                fence: Some(fence),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(read(&dst, 8), vec![0; 8]);
        assert!(!gpu.fence_signaled(fence).unwrap());

        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        assert_eq!(read(&dst, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn flags_semaphore_misuse() {
        let gpu = HeadlessGpu::immediate();
        let semaphore = gpu.create_semaphore().unwrap();
        let waits = [WaitSemaphore {
            semaphore,
            stage: vk::PipelineStageFlags::TRANSFER,
        }];

        gpu.queue_submit(gpu.queue(), &SubmitBatch { waits: &waits, ..Default::default() })
            .unwrap();
        assert_eq!(gpu.validation_messages().len(), 1);

        gpu.queue_submit(gpu.queue(), &SubmitBatch { signals: &[semaphore], ..Default::default() })
            .unwrap();
        gpu.queue_submit(gpu.queue(), &SubmitBatch { signals: &[semaphore], ..Default::default() })
            .unwrap();
        assert_eq!(gpu.validation_messages().len(), 2);
        assert!(gpu.validation_messages()[1].contains("already signaled"));
    }

    #[test]
    fn waiting_on_unsubmitted_fence_times_out() {
        let gpu = HeadlessGpu::new();
        let fence = gpu.create_fence(false).unwrap();
        assert!(matches!(
            gpu.wait_for_fence(fence, 1_000),
            Err(Error::FenceTimeout { timeout_ns: 1_000 })
        ));
    }

    fn rgba_image(gpu: &HeadlessGpu, size: u32, mip_levels: u32) -> GpuImage {
        gpu.create_image(&ImageAllocDesc {
            name: "test",
            extent: vk::Extent3D {
                width: size,
                height: size,
                depth: 1,
            },
            format: vk::Format::R8G8B8A8_UNORM,
            mip_levels,
            array_layers: 1,
            usage: vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        })
        .unwrap()
    }

    fn to_layout(
        gpu: &HeadlessGpu,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        base_mip: u32,
        layout: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier {
            image,
            new_layout: layout,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: base_mip,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        let stage = vk::PipelineStageFlags::TRANSFER;
        gpu.cmd_image_barrier(cmd, stage, stage, &barrier);
    }

    fn mip_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    fn buffer_region(mip_level: u32, size: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            image_subresource: mip_layers(mip_level),
            image_extent: vk::Extent3D {
                width: size,
                height: size,
                depth: 1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn linear_blit_averages_two_by_two_blocks() {
        let gpu = HeadlessGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let cmd = gpu.allocate_command_buffers(pool, 1).unwrap()[0];
        let image = rgba_image(&gpu, 2, 2);
        let src = host_buffer(&gpu, 16);
        let dst = host_buffer(&gpu, 4);
        write(&src, &[0, 10, 100, 255, 2, 10, 100, 255, 4, 30, 100, 255, 6, 30, 100, 255]);

        let (src_layout, dst_layout) = (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        gpu.begin_command_buffer(cmd, true).unwrap();
        to_layout(&gpu, cmd, image.handle, 0, dst_layout);
        let region = buffer_region(0, 2);
        gpu.cmd_copy_buffer_to_image(cmd, src.handle, image.handle, dst_layout, &[region]);
        to_layout(&gpu, cmd, image.handle, 0, src_layout);
        to_layout(&gpu, cmd, image.handle, 1, dst_layout);
        let blit = vk::ImageBlit {
            src_subresource: mip_layers(0),
            src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: 2, y: 2, z: 1 }],
            dst_subresource: mip_layers(1),
            dst_offsets: [vk::Offset3D::default(), vk::Offset3D { x: 1, y: 1, z: 1 }],
        };
        gpu.cmd_blit_image(
            cmd,
            image.handle,
            src_layout,
            image.handle,
            dst_layout,
            &[blit],
            vk::Filter::LINEAR,
        );
        to_layout(&gpu, cmd, image.handle, 1, src_layout);
        let region = buffer_region(1, 1);
        gpu.cmd_copy_image_to_buffer(cmd, image.handle, src_layout, dst.handle, &[region]);
        gpu.end_command_buffer(cmd).unwrap();

        let batch = SubmitBatch {
            command_buffers: &[cmd],
            ..Default::default()
        };
        gpu.queue_submit(gpu.queue(), &batch).unwrap();
        gpu.complete_pending();

        assert_eq!(read(&dst, 4), vec![3, 20, 100, 255]);
        assert_eq!(gpu.mip_layouts(image.handle), Some(vec![src_layout, src_layout]));
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn transfer_in_the_wrong_layout_is_flagged() {
        let gpu = HeadlessGpu::immediate();
        let pool = gpu.create_command_pool().unwrap();
        let cmd = gpu.allocate_command_buffers(pool, 1).unwrap()[0];
        let image = rgba_image(&gpu, 1, 1);
        let src = host_buffer(&gpu, 4);

        gpu.begin_command_buffer(cmd, true).unwrap();
        gpu.cmd_copy_buffer_to_image(
            cmd,
            src.handle,
            image.handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[buffer_region(0, 1)],
        );
        gpu.end_command_buffer(cmd).unwrap();
        let batch = SubmitBatch {
            command_buffers: &[cmd],
            ..Default::default()
        };
        gpu.queue_submit(gpu.queue(), &batch).unwrap();

        let messages = gpu.validation_messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("while in UNDEFINED"), "{}", messages[0]);
    }

    #[test]
    fn reset_leaves_a_recording_buffer_empty() {
        let gpu = HeadlessGpu::new();
        let pool = gpu.create_command_pool().unwrap();
        let cmd = gpu.allocate_command_buffers(pool, 1).unwrap()[0];

        gpu.begin_command_buffer(cmd, false).unwrap();
        gpu.reset_command_buffer(cmd).unwrap();
        gpu.begin_command_buffer(cmd, false).unwrap();
        gpu.end_command_buffer(cmd).unwrap();
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn tracks_live_objects() {
        let gpu = HeadlessGpu::new();
        let semaphore = gpu.create_semaphore().unwrap();
        let buffer = host_buffer(&gpu, 16);
        assert_eq!(gpu.live_object_count(), 2);
        gpu.destroy_semaphore(semaphore);
        gpu.destroy_buffer(buffer);
        assert_eq!(gpu.live_object_count(), 0);
    }
}
