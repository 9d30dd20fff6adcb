// Frame-multiplexed buffer
//
// A frame-resident buffer owns one allocation per frame in flight; every
// call resolves its slot from the Frame argument. A non-resident buffer has a
// single allocation and ignores the frame.
//
// Host-visible memory is persistently mapped by the allocator. `map` only
// changes when flushes happen: while mapped, writes are not flushed until
// unmap / flush_to_gpu. Device-only memory is reached through a staging
// buffer and a blocking single-use command buffer.

use super::{
    copy_from_mapped, copy_to_mapped, memory_location, HostAccess, MemoryPreset, StagingBuffer,
};
use crate::backend::{BufferAllocDesc, GpuBuffer};
use crate::command::CommandBufferSingleUse;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handle::Handle;
use ash::vk;
use std::ops::{Deref, DerefMut};

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub preset: MemoryPreset,
    pub access: HostAccess,
    pub frame_resident: bool,
}

impl BufferDesc {
    /// Host memory written sequentially by the CPU.
    pub fn host(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name: "buffer".to_string(),
            size,
            usage,
            preset: MemoryPreset::HostOnly,
            access: HostAccess::Sequential,
            frame_resident: false,
        }
    }

    /// Device-only memory.
    pub fn device(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            preset: MemoryPreset::DeviceOnly,
            access: HostAccess::None,
            ..Self::host(size, usage)
        }
    }

    pub fn frame_resident(mut self) -> Self {
        self.frame_resident = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_preset(mut self, preset: MemoryPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_access(mut self, access: HostAccess) -> Self {
        self.access = access;
        self
    }
}

pub struct Buffer {
    ctx: Handle<CoreContext>,
    desc: BufferDesc,
    slots: Vec<GpuBuffer>,
    mapped: bool,
}

impl Buffer {
    pub fn new(ctx: &Handle<CoreContext>, mut desc: BufferDesc) -> Result<Self> {
        assert!(desc.size > 0, "buffer '{}' has zero size", desc.name);
        // Staging copies and duplicate() need both directions
        desc.usage |= vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let slots = Self::allocate_slots(ctx, &desc)?;
        log::debug!(
            "Buffer '{}': {} bytes x {} slot(s), {:?}",
            desc.name,
            desc.size,
            slots.len(),
            desc.preset
        );
        Ok(Self {
            ctx: ctx.clone(),
            desc,
            slots,
            mapped: false,
        })
    }

    fn allocate_slots(ctx: &Handle<CoreContext>, desc: &BufferDesc) -> Result<Vec<GpuBuffer>> {
        let count = if desc.frame_resident {
            ctx.max_frames_in_flight()
        } else {
            1
        };
        let location = memory_location(desc.preset, desc.access);

        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let created = ctx.gpu().create_buffer(&BufferAllocDesc {
                name: &desc.name,
                size: desc.size,
                usage: desc.usage,
                location,
            });
            match created {
                Ok(buffer) => slots.push(buffer),
                Err(e) => {
                    for buffer in slots {
                        ctx.gpu().destroy_buffer(buffer);
                    }
                    return Err(e);
                }
            }
        }
        Ok(slots)
    }

    fn slot(&self, frame: Frame) -> usize {
        if !self.desc.frame_resident {
            return 0;
        }
        let slot = frame.slot();
        assert!(
            slot < self.slots.len(),
            "frame slot {} out of range for buffer '{}' with {} slot(s)",
            slot,
            self.desc.name,
            self.slots.len()
        );
        slot
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.desc.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                size,
                extent: self.desc.size,
            }),
        }
    }

    // ========================================================================
    // Host transfers
    // ========================================================================

    /// Writes into the slot for `frame`.
    pub fn write(&mut self, frame: Frame, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        self.write_slot(self.slot(frame), offset, data)
    }

    /// Writes into every slot. Meant for initialization.
    pub fn write_all(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        for slot in 0..self.slots.len() {
            self.write_slot(slot, offset, data)?;
        }
        Ok(())
    }

    fn write_slot(&self, slot: usize, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let target = &self.slots[slot];
        match target.mapped {
            Some(base) => {
                unsafe { copy_to_mapped(base, offset, data) };
                if !self.mapped {
                    self.ctx.gpu().flush_mapped(target, offset, data.len() as u64)?;
                }
                Ok(())
            }
            None => {
                let gpu = self.ctx.gpu();
                let staging = StagingBuffer::upload(gpu, data)?;
                let single = CommandBufferSingleUse::new(&self.ctx)?;
                gpu.cmd_copy_buffer(
                    single.cmd(),
                    staging.handle(),
                    target.handle,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: offset,
                        size: data.len() as u64,
                    }],
                );
                single.execute()
            }
        }
    }

    /// Reads from the slot for `frame`. Device work writing that slot must
    /// have completed.
    pub fn read(&self, frame: Frame, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len() as u64)?;
        if out.is_empty() {
            return Ok(());
        }
        let source = &self.slots[self.slot(frame)];
        match source.mapped {
            Some(base) => {
                if !self.mapped {
                    self.ctx
                        .gpu()
                        .invalidate_mapped(source, offset, out.len() as u64)?;
                }
                unsafe { copy_from_mapped(base, offset, out) };
                Ok(())
            }
            None => {
                let gpu = self.ctx.gpu();
                let staging = StagingBuffer::readback(gpu, out.len() as u64)?;
                let single = CommandBufferSingleUse::new(&self.ctx)?;
                gpu.cmd_copy_buffer(
                    single.cmd(),
                    source.handle,
                    staging.handle(),
                    &[vk::BufferCopy {
                        src_offset: offset,
                        dst_offset: 0,
                        size: out.len() as u64,
                    }],
                );
                single.execute()?;
                staging.read(out)
            }
        }
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Host view of the slot for `frame`. Until `unmap`, writes through
    /// `write` are not flushed either.
    pub fn map(&mut self, frame: Frame) -> Result<&mut [u8]> {
        let slot = self.slot(frame);
        let target = &self.slots[slot];
        let base = target.mapped.ok_or(Error::NotHostVisible)?;
        self.ctx.gpu().invalidate_mapped(target, 0, self.desc.size)?;
        self.mapped = true;
        // SAFETY: the mapping spans `size` bytes and stays valid while the
        // slot exists; the slice borrows self mutably, so no resize or drop
        // can happen while it is alive
        Ok(unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), self.desc.size as usize) })
    }

    /// Flushes every slot and leaves the mapped state.
    pub fn unmap(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }
        for slot in &self.slots {
            if slot.is_host_visible() {
                self.ctx.gpu().flush_mapped(slot, 0, self.desc.size)?;
            }
        }
        self.mapped = false;
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Maps the slot for `frame` for the lifetime of the guard. Dropping the
    /// guard flushes that slot and restores the previous mapped state.
    pub fn mapped_scope(&mut self, frame: Frame) -> Result<MappedScope<'_>> {
        let was_mapped = self.mapped;
        let slot = self.slot(frame);
        self.map(frame)?;
        Ok(MappedScope {
            buffer: self,
            slot,
            was_mapped,
        })
    }

    pub fn flush_to_gpu(&self, frame: Frame) -> Result<()> {
        let slot = &self.slots[self.slot(frame)];
        if !slot.is_host_visible() {
            return Err(Error::NotHostVisible);
        }
        self.ctx.gpu().flush_mapped(slot, 0, self.desc.size)
    }

    pub fn invalidate_to_cpu(&self, frame: Frame) -> Result<()> {
        let slot = &self.slots[self.slot(frame)];
        if !slot.is_host_visible() {
            return Err(Error::NotHostVisible);
        }
        self.ctx.gpu().invalidate_mapped(slot, 0, self.desc.size)
    }

    // ========================================================================
    // Storage management
    // ========================================================================

    /// Replaces every slot with new storage of `size` bytes, even when the
    /// size is unchanged, so it doubles as a way to drop the old contents.
    /// Contents are not preserved; the mapped state carries over.
    pub fn resize(&mut self, size: u64) -> Result<()> {
        assert!(size > 0, "buffer '{}' resized to zero", self.desc.name);
        let mut desc = self.desc.clone();
        desc.size = size;
        let fresh = Self::allocate_slots(&self.ctx, &desc)?;
        let old = std::mem::replace(&mut self.slots, fresh);
        for buffer in old {
            self.ctx.gpu().destroy_buffer(buffer);
        }
        log::debug!(
            "Buffer '{}' resized {} -> {} bytes",
            self.desc.name,
            self.desc.size,
            size
        );
        self.desc = desc;
        Ok(())
    }

    /// Records a copy from this buffer's slot for `frame` into `dst`'s slot
    /// for the same frame.
    pub fn copy_to(
        &self,
        cmd: vk::CommandBuffer,
        frame: Frame,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        self.ctx.gpu().cmd_copy_buffer(
            cmd,
            self.handle(frame),
            dst.handle(frame),
            &[vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            }],
        );
        Ok(())
    }

    /// `copy_to` over as many bytes as both buffers hold.
    pub fn copy_to_whole(&self, cmd: vk::CommandBuffer, frame: Frame, dst: &Buffer) -> Result<()> {
        let size = self.desc.size.min(dst.desc.size);
        self.copy_to(cmd, frame, dst, 0, 0, size)
    }

    /// Same properties, new and uninitialized storage.
    pub fn clone_layout(&self) -> Result<Buffer> {
        Buffer::new(&self.ctx, self.desc.clone())
    }

    /// Same properties, with every slot holding a copy of the slot for `frame`.
    pub fn duplicate(&self, frame: Frame) -> Result<Buffer> {
        let copy = self.clone_layout()?;
        let single = CommandBufferSingleUse::new(&self.ctx)?;
        let source = self.handle(frame);
        for slot in &copy.slots {
            self.ctx.gpu().cmd_copy_buffer(
                single.cmd(),
                source,
                slot.handle,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: self.desc.size,
                }],
            );
        }
        single.execute()?;
        Ok(copy)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn handle(&self, frame: Frame) -> vk::Buffer {
        self.slots[self.slot(frame)].handle
    }

    pub fn handle_at(&self, slot: usize) -> vk::Buffer {
        self.slots[slot].handle
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_host_visible(&self) -> bool {
        self.slots.iter().all(GpuBuffer::is_host_visible)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        for buffer in self.slots.drain(..) {
            self.ctx.gpu().destroy_buffer(buffer);
        }
    }
}

/// Mapped view of one slot. See [`Buffer::mapped_scope`].
pub struct MappedScope<'a> {
    buffer: &'a mut Buffer,
    slot: usize,
    was_mapped: bool,
}

impl Deref for MappedScope<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let slot = &self.buffer.slots[self.slot];
        match slot.mapped {
            // SAFETY: see Buffer::map
            Some(base) => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), self.buffer.desc.size as usize)
            },
            None => &[],
        }
    }
}

impl DerefMut for MappedScope<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let slot = &self.buffer.slots[self.slot];
        match slot.mapped {
            // SAFETY: see Buffer::map
            Some(base) => unsafe {
                std::slice::from_raw_parts_mut(base.as_ptr(), self.buffer.desc.size as usize)
            },
            None => &mut [],
        }
    }
}

impl Drop for MappedScope<'_> {
    fn drop(&mut self) {
        let slot = &self.buffer.slots[self.slot];
        if let Err(e) = self
            .buffer
            .ctx
            .gpu()
            .flush_mapped(slot, 0, self.buffer.desc.size)
        {
            log::warn!("Flush of '{}' failed: {}", self.buffer.desc.name, e);
        }
        self.buffer.mapped = self.was_mapped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuffer;
    use crate::context::test_context;
    use crate::sync::SyncTask;

    const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::STORAGE_BUFFER;

    fn frame(index: u32, number: u64) -> Frame {
        Frame::new(index, number)
    }

    #[test]
    fn frame_resident_writes_hit_their_own_slot() {
        let (_gpu, ctx) = test_context(3);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(4, USAGE).frame_resident()).unwrap();
        assert_eq!(buffer.slot_count(), 3);

        // Indices 0,1,2,0,1 over frames 0..5
        for (number, index) in [0u32, 1, 2, 0, 1].into_iter().enumerate() {
            let value = number as u8 + 10;
            buffer
                .write(frame(index, number as u64), 0, &[value; 4])
                .unwrap();
        }

        let mut out = [0u8; 4];
        buffer.read(frame(0, 5), 0, &mut out).unwrap();
        assert_eq!(out, [13; 4]);
        buffer.read(frame(1, 5), 0, &mut out).unwrap();
        assert_eq!(out, [14; 4]);
        buffer.read(frame(2, 5), 0, &mut out).unwrap();
        assert_eq!(out, [12; 4]);
    }

    #[test]
    fn non_resident_buffer_ignores_the_frame() {
        let (_gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(2, USAGE)).unwrap();
        buffer.write(frame(1, 1), 0, &[7, 8]).unwrap();
        let mut out = [0u8; 2];
        buffer.read(frame(0, 2), 0, &mut out).unwrap();
        assert_eq!(out, [7, 8]);
        assert_eq!(buffer.handle(frame(0, 0)), buffer.handle(frame(1, 1)));
    }

    #[test]
    fn device_only_goes_through_staging() {
        let (gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::device(8, USAGE).frame_resident()).unwrap();
        assert!(!buffer.is_host_visible());

        buffer.write(frame(1, 1), 2, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 8];
        buffer.read(frame(1, 1), 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 0, 0, 0]);
        buffer.read(frame(0, 2), 0, &mut out).unwrap();
        assert_eq!(out, [0; 8]);

        assert!(matches!(buffer.map(Frame::first()), Err(Error::NotHostVisible)));
        // One staging round trip per transfer, each on its own fence
        assert_eq!(gpu.submissions().len(), 3);
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn out_of_extent_access_is_rejected() {
        let (_gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(8, USAGE)).unwrap();
        assert!(matches!(
            buffer.write(Frame::first(), 6, &[0; 4]),
            Err(Error::OutOfBounds {
                offset: 6,
                size: 4,
                extent: 8
            })
        ));
        let mut out = [0u8; 1];
        assert!(buffer.read(Frame::first(), u64::MAX, &mut out).is_err());
    }

    #[test]
    fn resize_moves_the_mapping_to_new_storage() {
        let (_gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(4, USAGE)).unwrap();
        let old_handle = buffer.handle(Frame::first());
        buffer.map(Frame::first()).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let old_ptr = buffer.map(Frame::first()).unwrap().as_ptr();

        buffer.resize(16).unwrap();
        assert!(buffer.is_mapped());
        assert_ne!(buffer.handle(Frame::first()), old_handle);

        let view = buffer.map(Frame::first()).unwrap();
        assert_eq!(view.len(), 16);
        assert_ne!(view.as_ptr(), old_ptr);

        assert!(buffer.write(Frame::first(), 12, &[9; 4]).is_ok());
        assert!(buffer.write(Frame::first(), 13, &[9; 4]).is_err());
    }

    #[test]
    fn same_size_resize_still_replaces_storage() {
        let (gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(4, USAGE).frame_resident()).unwrap();
        buffer.write(frame(1, 1), 0, &[5; 4]).unwrap();
        buffer.map(frame(1, 1)).unwrap();
        let old = [buffer.handle_at(0), buffer.handle_at(1)];
        let objects = gpu.live_object_count();

        buffer.resize(4).unwrap();
        assert_ne!(buffer.handle_at(0), old[0]);
        assert_ne!(buffer.handle_at(1), old[1]);
        assert_eq!(gpu.live_object_count(), objects);
        assert!(buffer.is_mapped());

        let mut out = [0xffu8; 4];
        buffer.read(frame(1, 1), 0, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn mapped_scope_restores_state_and_flushes() {
        let (gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(4, USAGE).frame_resident()).unwrap();
        let flushes = gpu.flush_count();
        {
            let mut view = buffer.mapped_scope(frame(1, 1)).unwrap();
            view.copy_from_slice(&[4, 3, 2, 1]);
        }
        assert!(!buffer.is_mapped());
        assert_eq!(gpu.flush_count(), flushes + 1);

        let mut out = [0u8; 4];
        buffer.read(frame(1, 1), 0, &mut out).unwrap();
        assert_eq!(out, [4, 3, 2, 1]);
    }

    #[test]
    fn writes_while_mapped_defer_the_flush() {
        let (gpu, ctx) = test_context(2);
        let mut buffer = Buffer::new(&ctx, BufferDesc::host(4, USAGE)).unwrap();
        buffer.map(Frame::first()).unwrap();
        let flushes = gpu.flush_count();
        buffer.write(Frame::first(), 0, &[1]).unwrap();
        assert_eq!(gpu.flush_count(), flushes);
        buffer.unmap().unwrap();
        assert_eq!(gpu.flush_count(), flushes + 1);
    }

    #[test]
    fn readback_memory_is_invalidated_before_reads() {
        let (gpu, ctx) = test_context(2);
        let desc = BufferDesc::host(4, USAGE).with_access(HostAccess::Random);
        let buffer = Buffer::new(&ctx, desc).unwrap();
        let before = gpu.invalidate_count();
        let mut out = [0u8; 4];
        buffer.read(Frame::first(), 0, &mut out).unwrap();
        assert_eq!(gpu.invalidate_count(), before + 1);
    }

    #[test]
    fn recorded_copy_uses_the_frame_slot() {
        let (gpu, ctx) = test_context(2);
        let mut src = Buffer::new(&ctx, BufferDesc::host(4, USAGE).frame_resident()).unwrap();
        let dst = src.clone_layout().unwrap();
        src.write_all(0, &[5; 4]).unwrap();
        src.write(frame(1, 1), 0, &[6; 4]).unwrap();

        let mut cmd = CommandBuffer::new(&ctx).unwrap();
        let active = cmd.get_buffer(frame(1, 1)).unwrap();
        src.copy_to_whole(active.handle, frame(1, 1), &dst).unwrap();
        cmd.finalize(frame(1, 1)).unwrap();

        let task = SyncTask::with_fence(&ctx, "copy", false).unwrap();
        task.submit_command_buffer(&cmd, frame(1, 1)).unwrap();
        task.wait_completion().unwrap();

        let mut out = [0u8; 4];
        dst.read(frame(1, 1), 0, &mut out).unwrap();
        assert_eq!(out, [6; 4]);
        dst.read(frame(0, 2), 0, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
        assert!(gpu.validation_messages().is_empty());
    }

    #[test]
    fn duplicate_copies_one_slot_everywhere() {
        let (_gpu, ctx) = test_context(3);
        let mut src = Buffer::new(&ctx, BufferDesc::device(4, USAGE).frame_resident()).unwrap();
        src.write(frame(2, 2), 0, &[42; 4]).unwrap();

        let copy = src.duplicate(frame(2, 2)).unwrap();
        for index in 0..3 {
            let mut out = [0u8; 4];
            copy.read(frame(index, 3), 0, &mut out).unwrap();
            assert_eq!(out, [42; 4]);
        }
    }

    #[test]
    fn dropping_buffers_frees_every_slot() {
        let (gpu, ctx) = test_context(3);
        let buffer = Buffer::new(&ctx, BufferDesc::host(4, USAGE).frame_resident()).unwrap();
        assert_eq!(gpu.live_object_count(), 4);
        drop(buffer);
        assert_eq!(gpu.live_object_count(), 1);
    }
}
