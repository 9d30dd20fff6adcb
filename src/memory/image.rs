// Frame-multiplexed image
//
// Layouts are never tracked: every transfer takes the layout the caller
// knows the image is in and the layout it should be left in. Host transfers
// move one mip level of every array layer, tightly packed.

use super::{memory_location, HostAccess, MemoryPreset, StagingBuffer};
use crate::backend::{full_mip_count, mip_extent, texel_size, GpuImage, ImageAllocDesc};
use crate::command::CommandBufferSingleUse;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::handle::Handle;
use ash::vk;
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub preset: MemoryPreset,
    pub frame_resident: bool,
}

impl ImageDesc {
    /// Single-mip, single-layer colour image in device memory.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            name: "image".to_string(),
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            mip_levels: 1,
            array_layers: 1,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
            preset: MemoryPreset::DeviceOnly,
            frame_resident: false,
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

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// Levels past 0 are filled by [`Image::generate_mipmaps`].
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Every level down to 1x1.
    pub fn with_full_mip_chain(mut self) -> Self {
        self.mip_levels = full_mip_count(self.extent);
        self
    }

    pub fn with_aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }
}

/// Access mask and pipeline stage a layout is used with, for barriers.
fn layout_scope(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

pub struct Image {
    ctx: Handle<CoreContext>,
    desc: ImageDesc,
    slots: Vec<GpuImage>,
}

impl Image {
    pub fn new(ctx: &Handle<CoreContext>, mut desc: ImageDesc) -> Result<Self> {
        let e = desc.extent;
        assert!(
            e.width > 0 && e.height > 0 && e.depth > 0,
            "image '{}' has a zero extent",
            desc.name
        );
        assert!(
            desc.mip_levels >= 1 && desc.mip_levels <= full_mip_count(e),
            "image '{}' cannot have {} mip level(s)",
            desc.name,
            desc.mip_levels
        );
        desc.usage |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        let slots = Self::allocate_slots(ctx, &desc)?;
        log::debug!(
            "Image '{}': {}x{}x{} {:?} x {} slot(s)",
            desc.name,
            e.width,
            e.height,
            e.depth,
            desc.format,
            slots.len()
        );
        Ok(Self {
            ctx: ctx.clone(),
            desc,
            slots,
        })
    }

    fn allocate_slots(ctx: &Handle<CoreContext>, desc: &ImageDesc) -> Result<Vec<GpuImage>> {
        let count = if desc.frame_resident {
            ctx.max_frames_in_flight()
        } else {
            1
        };
        let location = memory_location(desc.preset, HostAccess::None);

        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let created = ctx.gpu().create_image(&ImageAllocDesc {
                name: &desc.name,
                extent: desc.extent,
                format: desc.format,
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
                usage: desc.usage,
                location,
            });
            match created {
                Ok(image) => slots.push(image),
                Err(e) => {
                    for image in slots {
                        ctx.gpu().destroy_image(image);
                    }
                    return Err(e);
                }
            }
        }
        Ok(slots)
    }

    /// Decodes an image file to RGBA8 and uploads it into a new image.
    pub fn load_from_disk(
        ctx: &Handle<CoreContext>,
        path: impl AsRef<Path>,
        usage: vk::ImageUsageFlags,
        final_layout: vk::ImageLayout,
    ) -> Result<Image> {
        let path = path.as_ref();
        let load_error = |reason: String| {
            log::error!("Failed to load image {:?}: {}", path, reason);
            Error::Load {
                path: path.to_path_buf(),
                reason,
            }
        };

        let decoded = ::image::open(path).map_err(|e| load_error(e.to_string()))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        if width == 0 || height == 0 {
            return Err(load_error("image has no pixels".to_string()));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let desc = ImageDesc::new_2d(width, height, vk::Format::R8G8B8A8_UNORM, usage).named(name);
        let mut loaded = Image::new(ctx, desc)?;
        loaded.write_all(rgba.as_raw(), vk::ImageLayout::UNDEFINED, final_layout)?;

        log::info!("Loaded image {:?} ({}x{})", path, width, height);
        Ok(loaded)
    }

    fn slot(&self, frame: Frame) -> usize {
        if !self.desc.frame_resident {
            return 0;
        }
        let slot = frame.slot();
        assert!(
            slot < self.slots.len(),
            "frame slot {} out of range for image '{}' with {} slot(s)",
            slot,
            self.desc.name,
            self.slots.len()
        );
        slot
    }

    /// Bytes in mip level 0 across every layer, tightly packed.
    pub fn byte_size(&self) -> Result<u64> {
        self.mip_byte_size(0)
    }

    /// Bytes in mip `level` across every layer, tightly packed.
    pub fn mip_byte_size(&self, level: u32) -> Result<u64> {
        let format = self.desc.format;
        let texel = texel_size(format).ok_or(Error::UnsupportedFormat(format))?;
        let e = mip_extent(self.desc.extent, level);
        let texels = e.width as u64 * e.height as u64 * e.depth as u64;
        Ok(texels * self.desc.array_layers as u64 * texel)
    }

    fn check_len(&self, level: u32, len: usize) -> Result<()> {
        let extent = self.mip_byte_size(level)?;
        if len as u64 != extent {
            return Err(Error::OutOfBounds {
                offset: 0,
                size: len as u64,
                extent,
            });
        }
        Ok(())
    }

    fn mip_layers(&self, level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: self.desc.aspect,
            mip_level: level,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        }
    }

    fn mip_copy_region(&self, level: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: self.mip_layers(level),
            image_offset: vk::Offset3D::default(),
            image_extent: mip_extent(self.desc.extent, level),
        }
    }

    /// Far corner of mip `level`, for blits.
    fn mip_corner(&self, level: u32) -> vk::Offset3D {
        let e = mip_extent(self.desc.extent, level);
        vk::Offset3D {
            x: e.width as i32,
            y: e.height as i32,
            z: e.depth as i32,
        }
    }

    /// Records a layout transition of the slot for `frame` over every mip and
    /// layer.
    pub fn record_barrier(
        &self,
        cmd: vk::CommandBuffer,
        frame: Frame,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.record_barrier_at(cmd, self.slot(frame), old_layout, new_layout);
    }

    fn record_barrier_at(
        &self,
        cmd: vk::CommandBuffer,
        slot: usize,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let levels = 0..self.desc.mip_levels;
        self.record_mip_barrier(cmd, self.slots[slot].handle, levels, old_layout, new_layout);
    }

    fn record_mip_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        levels: Range<u32>,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, src_stage) = layout_scope(old_layout);
        let (dst_access, dst_stage) = layout_scope(new_layout);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.desc.aspect,
                base_mip_level: levels.start,
                level_count: levels.len() as u32,
                base_array_layer: 0,
                layer_count: self.desc.array_layers,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        self.ctx
            .gpu()
            .cmd_image_barrier(cmd, src_stage, dst_stage, &barrier);
    }

    /// Uploads mip 0 of every layer of the slot for `frame`, blocking until
    /// the copy is done.
    pub fn write(
        &self,
        frame: Frame,
        data: &[u8],
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        self.check_len(0, data.len())?;
        self.write_slots(&[self.slot(frame)], data, old_layout, new_layout)
    }

    /// `write` into every slot.
    pub fn write_all(
        &mut self,
        data: &[u8],
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        self.check_len(0, data.len())?;
        let slots: Vec<usize> = (0..self.slots.len()).collect();
        self.write_slots(&slots, data, old_layout, new_layout)
    }

    fn write_slots(
        &self,
        slots: &[usize],
        data: &[u8],
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let gpu = self.ctx.gpu();
        let staging = StagingBuffer::upload(gpu, data)?;
        let single = CommandBufferSingleUse::new(&self.ctx)?;
        let region = self.mip_copy_region(0);
        for &slot in slots {
            let dst = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            self.record_barrier_at(single.cmd(), slot, old_layout, dst);
            gpu.cmd_copy_buffer_to_image(
                single.cmd(),
                staging.handle(),
                self.slots[slot].handle,
                dst,
                &[region],
            );
            self.record_barrier_at(single.cmd(), slot, dst, new_layout);
        }
        single.execute()
    }

    /// Downloads mip 0 of every layer of the slot for `frame`. The image is
    /// left in `layout`.
    pub fn read(&self, frame: Frame, layout: vk::ImageLayout, out: &mut [u8]) -> Result<()> {
        self.read_mip(frame, 0, layout, out)
    }

    /// `read` for mip `level`; `out` holds [`Image::mip_byte_size`] bytes.
    pub fn read_mip(
        &self,
        frame: Frame,
        level: u32,
        layout: vk::ImageLayout,
        out: &mut [u8],
    ) -> Result<()> {
        assert!(
            level < self.desc.mip_levels,
            "image '{}' has no mip {}",
            self.desc.name,
            level
        );
        self.check_len(level, out.len())?;
        let slot = self.slot(frame);
        let gpu = self.ctx.gpu();
        let staging = StagingBuffer::readback(gpu, out.len() as u64)?;
        let single = CommandBufferSingleUse::new(&self.ctx)?;

        let src = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        self.record_barrier_at(single.cmd(), slot, layout, src);
        gpu.cmd_copy_image_to_buffer(
            single.cmd(),
            self.slots[slot].handle,
            src,
            staging.handle(),
            &[self.mip_copy_region(level)],
        );
        self.record_barrier_at(single.cmd(), slot, src, layout);
        single.execute()?;
        staging.read(out)
    }

    /// Transitions the slot for `frame` and waits for it.
    pub fn set_layout(
        &self,
        frame: Frame,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let single = CommandBufferSingleUse::new(&self.ctx)?;
        self.record_barrier(single.cmd(), frame, old_layout, new_layout);
        single.execute()
    }

    /// Replaces every slot with new storage. Contents are discarded and the
    /// new images start in UNDEFINED. The mip count shrinks if the new extent
    /// cannot hold it.
    pub fn resize(&mut self, extent: vk::Extent3D) -> Result<()> {
        assert!(
            extent.width > 0 && extent.height > 0 && extent.depth > 0,
            "image '{}' resized to a zero extent",
            self.desc.name
        );
        let mut desc = self.desc.clone();
        desc.extent = extent;
        desc.mip_levels = desc.mip_levels.min(full_mip_count(extent));
        let fresh = Self::allocate_slots(&self.ctx, &desc)?;
        for image in std::mem::replace(&mut self.slots, fresh) {
            self.ctx.gpu().destroy_image(image);
        }
        self.desc = desc;
        Ok(())
    }

    /// Fills mip levels 1.. of the slot for `frame` by repeatedly halving
    /// level 0 with linear blits, then waits. The image must be in `layout`
    /// and is left there; the format must support linear blit filtering.
    pub fn generate_mipmaps(&self, frame: Frame, layout: vk::ImageLayout) -> Result<()> {
        let levels = self.desc.mip_levels;
        if levels <= 1 {
            return Ok(());
        }
        let image = self.slots[self.slot(frame)].handle;
        let gpu = self.ctx.gpu();
        let single = CommandBufferSingleUse::new(&self.ctx)?;
        let cmd = single.cmd();
        let (src, dst) = (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        self.record_mip_barrier(cmd, image, 0..1, layout, src);
        // Lower levels are overwritten, so their old contents can go
        self.record_mip_barrier(cmd, image, 1..levels, vk::ImageLayout::UNDEFINED, dst);
        for level in 1..levels {
            let blit = vk::ImageBlit {
                src_subresource: self.mip_layers(level - 1),
                src_offsets: [vk::Offset3D::default(), self.mip_corner(level - 1)],
                dst_subresource: self.mip_layers(level),
                dst_offsets: [vk::Offset3D::default(), self.mip_corner(level)],
            };
            gpu.cmd_blit_image(cmd, image, src, image, dst, &[blit], vk::Filter::LINEAR);
            self.record_mip_barrier(cmd, image, level..level + 1, dst, src);
        }
        self.record_mip_barrier(cmd, image, 0..levels, src, layout);
        single.execute()?;

        log::debug!("Image '{}': generated {} mip level(s)", self.desc.name, levels - 1);
        Ok(())
    }

    /// Same properties, new storage with undefined contents.
    pub fn clone_layout(&self) -> Result<Image> {
        Image::new(&self.ctx, self.desc.clone())
    }

    /// Same properties, with every slot holding a copy of every mip and layer
    /// of the slot for `frame`. The source stays in `layout`; the copy ends in
    /// `copy_layout`, or `layout` when that is None.
    pub fn duplicate(
        &self,
        frame: Frame,
        layout: vk::ImageLayout,
        copy_layout: Option<vk::ImageLayout>,
    ) -> Result<Image> {
        assert!(
            layout != vk::ImageLayout::UNDEFINED,
            "image '{}' duplicated while its contents are undefined",
            self.desc.name
        );
        let copy = self.clone_layout()?;
        let source = self.slots[self.slot(frame)].handle;
        let final_layout = copy_layout.unwrap_or(layout);
        let levels = 0..self.desc.mip_levels;
        let regions: Vec<vk::ImageCopy> = levels
            .clone()
            .map(|level| vk::ImageCopy {
                src_subresource: self.mip_layers(level),
                src_offset: vk::Offset3D::default(),
                dst_subresource: self.mip_layers(level),
                dst_offset: vk::Offset3D::default(),
                extent: mip_extent(self.desc.extent, level),
            })
            .collect();

        let gpu = self.ctx.gpu();
        let single = CommandBufferSingleUse::new(&self.ctx)?;
        let cmd = single.cmd();
        let (src, dst) = (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        self.record_mip_barrier(cmd, source, levels.clone(), layout, src);
        for target in &copy.slots {
            let undefined = vk::ImageLayout::UNDEFINED;
            self.record_mip_barrier(cmd, target.handle, levels.clone(), undefined, dst);
            gpu.cmd_copy_image(cmd, source, src, target.handle, dst, &regions);
            self.record_mip_barrier(cmd, target.handle, levels.clone(), dst, final_layout);
        }
        self.record_mip_barrier(cmd, source, levels, src, layout);
        single.execute()?;
        Ok(copy)
    }

    pub fn handle(&self, frame: Frame) -> vk::Image {
        self.slots[self.slot(frame)].handle
    }

    pub fn handle_at(&self, slot: usize) -> vk::Image {
        self.slots[slot].handle
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        for image in self.slots.drain(..) {
            self.ctx.gpu().destroy_image(image);
        }
    }
}
