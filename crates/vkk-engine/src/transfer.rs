//! Staging transfers between host memory and device-local resources.
//!
//! Every operation runs through a transfer instance (one command buffer and
//! one fence). Instances and host-visible staging buffers are pooled: staging
//! buffers live in a multimap keyed by their power-of-two byte size, and an
//! instance only goes back to the idle list once its fence has been observed
//! signaled.
//!
//! Recording takes the engine's `cmd` lock (the command buffers come from the
//! shared pool) and submission takes the `renderer` lock. The pools themselves
//! sit behind the manager's own mutex, which is never held across either.

use crate::buffer::Buffer;
use crate::command;
use crate::device::{Device, QueueId};
use crate::error::{driver, TransferError};
use crate::image::Image;
use crate::locks::EngineLocks;
use crate::memory::{Allocation, MemoryManager};
use ash::vk;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Smallest staging buffer created.
const MIN_STAGING_SIZE: u64 = 256;

/// Direction and host memory of a [`TransferManager::blit_storage`] call.
pub enum XferMode<'a> {
    /// Device to host; waits for completion.
    Read(&'a mut [u8]),
    /// Host to device; waits for completion.
    Write(&'a [u8]),
    /// Host to device; returns once submitted. The copy goes to the
    /// renderer's queue ([`QueueId::Foreground`]) followed by a transfer to
    /// shader barrier, so frames submitted afterwards observe the write. Completion
    /// is detected on a later transfer, [`TransferManager::poll`] or
    /// [`TransferManager::wait_buffer`].
    WriteAsync(&'a [u8]),
}

impl XferMode<'_> {
    fn len(&self) -> u64 {
        match self {
            Self::Read(out) => out.len() as u64,
            Self::Write(data) | Self::WriteAsync(data) => data.len() as u64,
        }
    }
}

/// A device buffer region addressed by a transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferTarget {
    pub buffer: vk::Buffer,
    pub size: u64,
}

impl BufferTarget {
    fn check(&self, offset: u64, size: u64) -> Result<(), TransferError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(TransferError::OutOfRange {
                offset,
                size,
                capacity: self.size,
            }),
        }
    }
}

/// An image addressed by a transfer, with its layout tracking.
pub(crate) struct ImageTarget<'a> {
    pub image: vk::Image,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub aspect: vk::ImageAspectFlags,
    /// Byte size of mip level 0.
    pub bytes: u64,
    pub layouts: &'a Mutex<Vec<vk::ImageLayout>>,
}

/// Usage counters of the transfer manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Transfer instances owned (idle and in flight).
    pub instances: usize,
    /// Instances whose fence has not been observed signaled.
    pub in_flight: usize,
    /// Staging buffers available in the pool.
    pub staging_buffers: usize,
    /// Bytes of pooled staging buffers.
    pub staging_bytes: u64,
    /// Staging buffers created since startup.
    pub staging_created: u64,
    /// Successful queue submissions.
    pub submissions: u64,
}

struct StagingBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct TransferInstance {
    cb: vk::CommandBuffer,
    fence: vk::Fence,
    staging: Option<StagingBuffer>,
    /// Buffer written by an asynchronous transfer still in flight.
    target: Option<vk::Buffer>,
}

#[derive(Default)]
struct TransferState {
    idle: Vec<TransferInstance>,
    in_flight: Vec<TransferInstance>,
    buffer_map: BTreeMap<u64, Vec<StagingBuffer>>,
    staging_created: u64,
    submissions: u64,
}

impl TransferState {
    fn claim_staging(&mut self, key: u64) -> Option<StagingBuffer> {
        let list = self.buffer_map.get_mut(&key)?;
        let staging = list.pop();
        if list.is_empty() {
            self.buffer_map.remove(&key);
        }
        staging
    }

    fn return_staging(&mut self, staging: StagingBuffer) {
        self.buffer_map.entry(staging.size).or_default().push(staging);
    }
}

enum Completion<'a> {
    Wait,
    ReadBack(&'a mut [u8]),
    Async(vk::Buffer),
}

fn staging_key(size: u64) -> u64 {
    size.max(MIN_STAGING_SIZE).next_power_of_two()
}

fn image_barrier(
    target: &ImageTarget<'_>,
    base_mip: u32,
    mip_count: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(target.image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: target.aspect,
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: 0,
            layer_count: 1,
        })
}

fn mip0_copy(target: &ImageTarget<'_>) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: target.aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(target.extent)
}

fn buffer_barrier(
    buffer: vk::Buffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_INPUT.as_raw()
        | vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

/// Pooled staging transfers.
pub struct TransferManager {
    device: Arc<dyn Device>,
    memory: Arc<MemoryManager>,
    locks: Arc<EngineLocks>,
    state: Mutex<TransferState>,
    shutdown: AtomicBool,
}

impl TransferManager {
    /// Create a manager with empty pools.
    pub fn new(
        device: Arc<dyn Device>,
        memory: Arc<MemoryManager>,
        locks: Arc<EngineLocks>,
    ) -> Self {
        Self {
            device,
            memory,
            locks,
            state: Mutex::new(TransferState::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Fill `size` bytes of a device-local buffer at `offset` with a repeated
    /// 32-bit pattern. Waits for completion.
    pub fn fill_storage(
        &self,
        buffer: &Buffer,
        offset: u64,
        size: u64,
        pattern: u32,
    ) -> Result<(), TransferError> {
        self.fill_target(buffer.transfer_target()?, offset, size, pattern)
    }

    /// Copy between host memory and a buffer at `offset`.
    pub fn blit_storage(
        &self,
        mode: XferMode<'_>,
        buffer: &Buffer,
        offset: u64,
    ) -> Result<(), TransferError> {
        self.blit_target(mode, buffer.transfer_target()?, offset)
    }

    /// Device-to-device copy of `size` bytes. Waits for completion.
    pub fn blit_storage2(
        &self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        let src = src.transfer_target()?;
        let dst = dst.transfer_target()?;
        src.check(src_offset, size)?;
        dst.check(dst_offset, size)?;
        if size == 0 {
            return Ok(());
        }

        self.execute(0, None, Completion::Wait, |cb, _| unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &[
                    buffer_barrier(
                        src.buffer,
                        vk::AccessFlags::MEMORY_WRITE,
                        vk::AccessFlags::TRANSFER_READ,
                    ),
                    buffer_barrier(
                        dst.buffer,
                        vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                        vk::AccessFlags::TRANSFER_WRITE,
                    ),
                ],
                &[],
            );
            self.device.cmd_copy_buffer(
                cb,
                src.buffer,
                dst.buffer,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                }],
            );
            self.write_to_shader_barrier(cb, dst.buffer);
        })
    }

    /// Upload mip level 0 of `image` and generate the remaining levels.
    ///
    /// `pixels` must hold exactly one level-0 image. Every mip level ends in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn write_image(&self, image: &Image, pixels: &[u8]) -> Result<(), TransferError> {
        self.write_image_target(&image.transfer_target(), pixels)
    }

    /// Read mip level 0 of `image` into `out`.
    pub fn read_image(&self, image: &Image, out: &mut [u8]) -> Result<(), TransferError> {
        self.read_image_target(&image.transfer_target(), out)
    }

    pub(crate) fn fill_target(
        &self,
        target: BufferTarget,
        offset: u64,
        size: u64,
        pattern: u32,
    ) -> Result<(), TransferError> {
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(TransferError::Incompatible(format!(
                "fill range {offset}+{size} is not 4-byte aligned"
            )));
        }
        target.check(offset, size)?;
        if size == 0 {
            return Ok(());
        }

        self.execute(0, None, Completion::Wait, |cb, _| unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &[buffer_barrier(
                    target.buffer,
                    vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
                &[],
            );
            self.device
                .cmd_fill_buffer(cb, target.buffer, offset, size, pattern);
            self.write_to_shader_barrier(cb, target.buffer);
        })
    }

    pub(crate) fn blit_target(
        &self,
        mode: XferMode<'_>,
        target: BufferTarget,
        offset: u64,
    ) -> Result<(), TransferError> {
        let size = mode.len();
        target.check(offset, size)?;
        if size == 0 {
            return Ok(());
        }

        let upload = |cb: vk::CommandBuffer, staging: vk::Buffer| unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &[buffer_barrier(
                    target.buffer,
                    vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
                &[],
            );
            self.device.cmd_copy_buffer(
                cb,
                staging,
                target.buffer,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size,
                }],
            );
            self.write_to_shader_barrier(cb, target.buffer);
        };

        match mode {
            XferMode::Write(data) => self.execute(size, Some(data), Completion::Wait, upload),
            XferMode::WriteAsync(data) => {
                self.execute(size, Some(data), Completion::Async(target.buffer), upload)
            }
            XferMode::Read(out) => {
                self.execute(size, None, Completion::ReadBack(out), |cb, staging| unsafe {
                    self.device.cmd_pipeline_barrier(
                        cb,
                        vk::PipelineStageFlags::ALL_COMMANDS,
                        vk::PipelineStageFlags::TRANSFER,
                        &[buffer_barrier(
                            target.buffer,
                            vk::AccessFlags::MEMORY_WRITE,
                            vk::AccessFlags::TRANSFER_READ,
                        )],
                        &[],
                    );
                    self.device.cmd_copy_buffer(
                        cb,
                        target.buffer,
                        staging,
                        &[vk::BufferCopy {
                            src_offset: offset,
                            dst_offset: 0,
                            size,
                        }],
                    );
                    self.device.cmd_pipeline_barrier(
                        cb,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::HOST,
                        &[buffer_barrier(
                            staging,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::HOST_READ,
                        )],
                        &[],
                    );
                })
            }
        }
    }

    pub(crate) fn write_image_target(
        &self,
        target: &ImageTarget<'_>,
        pixels: &[u8],
    ) -> Result<(), TransferError> {
        if pixels.len() as u64 != target.bytes {
            return Err(TransferError::Incompatible(format!(
                "image upload expects {} bytes, got {}",
                target.bytes,
                pixels.len()
            )));
        }

        // Held for the whole transfer so layout state matches the GPU.
        let mut layouts = target.layouts.lock();
        self.execute(target.bytes, Some(pixels), Completion::Wait, |cb, staging| unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &[image_barrier(
                    target,
                    0,
                    target.mip_levels,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
            );
            self.device.cmd_copy_buffer_to_image(
                cb,
                staging,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[mip0_copy(target)],
            );
            self.record_mipmaps(cb, target);
        })?;

        layouts.fill(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        Ok(())
    }

    pub(crate) fn read_image_target(
        &self,
        target: &ImageTarget<'_>,
        out: &mut [u8],
    ) -> Result<(), TransferError> {
        if out.len() as u64 != target.bytes {
            return Err(TransferError::Incompatible(format!(
                "image readback expects {} bytes, got {}",
                target.bytes,
                out.len()
            )));
        }

        let mut layouts = target.layouts.lock();
        let old_layout = layouts[0];
        let final_layout = if old_layout == vk::ImageLayout::UNDEFINED {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            old_layout
        };

        self.execute(target.bytes, None, Completion::ReadBack(out), |cb, staging| unsafe {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &[image_barrier(
                    target,
                    0,
                    1,
                    old_layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                )],
            );
            self.device.cmd_copy_image_to_buffer(
                cb,
                target.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                staging,
                &[mip0_copy(target)],
            );
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST | SHADER_STAGES,
                &[buffer_barrier(
                    staging,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::HOST_READ,
                )],
                &[image_barrier(
                    target,
                    0,
                    1,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    final_layout,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::SHADER_READ,
                )],
            );
        })?;

        layouts[0] = final_layout;
        Ok(())
    }

    /// Blit each level from the one above, leaving every level shader-readable.
    ///
    /// # Safety
    /// `cb` is recording and level 0 is in `TRANSFER_DST_OPTIMAL`.
    unsafe fn record_mipmaps(&self, cb: vk::CommandBuffer, target: &ImageTarget<'_>) {
        let mut width = target.extent.width as i32;
        let mut height = target.extent.height as i32;
        let mut depth = target.extent.depth as i32;

        for level in 1..target.mip_levels {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &[],
                &[image_barrier(
                    target,
                    level - 1,
                    1,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                )],
            );

            let next = ((width / 2).max(1), (height / 2).max(1), (depth / 2).max(1));
            let blit = vk::ImageBlit::default()
                .src_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: target.aspect,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .src_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: width,
                        y: height,
                        z: depth,
                    },
                ])
                .dst_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: target.aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .dst_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: next.0,
                        y: next.1,
                        z: next.2,
                    },
                ]);
            self.device.cmd_blit_image(
                cb,
                target.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );

            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                SHADER_STAGES,
                &[],
                &[image_barrier(
                    target,
                    level - 1,
                    1,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::SHADER_READ,
                )],
            );

            (width, height, depth) = next;
        }

        self.device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::TRANSFER,
            SHADER_STAGES,
            &[],
            &[image_barrier(
                target,
                target.mip_levels - 1,
                1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            )],
        );
    }

    unsafe fn write_to_shader_barrier(&self, cb: vk::CommandBuffer, buffer: vk::Buffer) {
        self.device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::TRANSFER,
            SHADER_STAGES | vk::PipelineStageFlags::TRANSFER,
            &[buffer_barrier(
                buffer,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE
                    | vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ
                    | vk::AccessFlags::TRANSFER_READ,
            )],
            &[],
        );
    }

    /// Acquire, record, submit and complete one transfer.
    ///
    /// `record` receives the command buffer and the staging buffer (null when
    /// `staging_size` is zero).
    fn execute(
        &self,
        staging_size: u64,
        upload: Option<&[u8]>,
        completion: Completion<'_>,
        record: impl FnOnce(vk::CommandBuffer, vk::Buffer),
    ) -> Result<(), TransferError> {
        let mut instance = self.acquire(staging_size)?;

        if let (Some(data), Some(staging)) = (upload, instance.staging.as_mut()) {
            if let Err(e) = staging.allocation.write(0, data) {
                self.retire(instance);
                return Err(e.into());
            }
        }

        // Async writes share the renderer's queue so later frames are ordered
        // after them.
        let queue = match completion {
            Completion::Async(_) => QueueId::Foreground,
            Completion::Wait | Completion::ReadBack(_) => QueueId::Background,
        };
        if let Err(e) = self.submit(&instance, queue, record) {
            self.retire(instance);
            return Err(e);
        }

        match completion {
            Completion::Async(target) => {
                instance.target = Some(target);
                self.state.lock().in_flight.push(instance);
                Ok(())
            }
            Completion::Wait => self.wait(instance, None),
            Completion::ReadBack(out) => self.wait(instance, Some(out)),
        }
    }

    fn acquire(&self, staging_size: u64) -> Result<TransferInstance, TransferError> {
        if self.is_shutdown() {
            return Err(TransferError::Shutdown);
        }

        let key = staging_key(staging_size);
        let (idle, mut staging) = {
            let mut state = self.state.lock();
            self.reap(&mut state);
            let staging = if staging_size > 0 {
                state.claim_staging(key)
            } else {
                None
            };
            (state.idle.pop(), staging)
        };

        let mut instance = match idle {
            Some(instance) => instance,
            None => match self.new_instance() {
                Ok(instance) => instance,
                Err(e) => {
                    if let Some(staging) = staging {
                        self.state.lock().return_staging(staging);
                    }
                    return Err(e);
                }
            },
        };

        if staging_size > 0 && staging.is_none() {
            match self.new_staging(key) {
                Ok(buffer) => staging = Some(buffer),
                Err(e) => {
                    self.retire(instance);
                    return Err(e);
                }
            }
        }

        instance.staging = staging;
        Ok(instance)
    }

    fn submit(
        &self,
        instance: &TransferInstance,
        queue: QueueId,
        record: impl FnOnce(vk::CommandBuffer, vk::Buffer),
    ) -> Result<(), TransferError> {
        let staging = instance
            .staging
            .as_ref()
            .map_or(vk::Buffer::null(), |s| s.buffer);

        {
            let _cmd = self.locks.cmd_lock();
            // SAFETY: the instance is idle, so its command buffer is not pending.
            unsafe {
                command::record_one_time(self.device.as_ref(), instance.cb, |cb| {
                    record(cb, staging)
                })?;
            }
        }

        {
            let _renderer = self.locks.renderer_lock();
            // SAFETY: queue access is serialized by the renderer lock.
            unsafe {
                self.device
                    .reset_fence(instance.fence)
                    .map_err(driver("vkResetFences"))?;
                self.device
                    .queue_submit(
                        queue,
                        &[instance.cb],
                        &[],
                        &[],
                        &[],
                        instance.fence,
                    )
                    .map_err(driver("vkQueueSubmit"))?;
            }
        }

        self.state.lock().submissions += 1;
        Ok(())
    }

    fn wait(
        &self,
        instance: TransferInstance,
        out: Option<&mut [u8]>,
    ) -> Result<(), TransferError> {
        // SAFETY: the fence belongs to a submitted instance.
        if let Err(result) = unsafe { self.device.wait_for_fence(instance.fence, u64::MAX) } {
            // Fence state unknown; leave the instance for teardown.
            self.state.lock().in_flight.push(instance);
            return Err(driver("vkWaitForFences")(result).into());
        }

        let read = match (out, instance.staging.as_ref()) {
            (Some(out), Some(staging)) => {
                staging.allocation.read(0, out).map_err(TransferError::from)
            }
            _ => Ok(()),
        };
        self.retire(instance);
        read
    }

    /// Return a completed instance and its staging buffer to the pools, or
    /// destroy both once the manager has shut down.
    fn retire(&self, mut instance: TransferInstance) {
        instance.target = None;
        let staging = instance.staging.take();

        if self.is_shutdown() {
            // SAFETY: the instance is not pending.
            unsafe {
                if let Some(staging) = staging {
                    self.destroy_staging(staging);
                }
                self.destroy_instance(instance);
            }
            return;
        }

        let mut state = self.state.lock();
        if let Some(staging) = staging {
            state.return_staging(staging);
        }
        state.idle.push(instance);
    }

    /// Move every in-flight instance whose fence has signaled back to idle.
    fn reap(&self, state: &mut TransferState) {
        let mut i = 0;
        while i < state.in_flight.len() {
            // SAFETY: fence status queries need no external synchronization.
            let done =
                unsafe { self.device.fence_status(state.in_flight[i].fence) }.unwrap_or(false);
            if done {
                let mut instance = state.in_flight.swap_remove(i);
                instance.target = None;
                if let Some(staging) = instance.staging.take() {
                    state.return_staging(staging);
                }
                state.idle.push(instance);
            } else {
                i += 1;
            }
        }
    }

    fn new_instance(&self) -> Result<TransferInstance, TransferError> {
        let cb = {
            let cmd = self.locks.cmd_lock();
            // SAFETY: pool access is serialized by the cmd lock.
            unsafe { self.device.allocate_command_buffer(cmd.pool()) }
                .map_err(driver("vkAllocateCommandBuffers"))?
        };

        // SAFETY: the device is valid.
        let fence = match unsafe { self.device.create_fence(false) } {
            Ok(fence) => fence,
            Err(result) => {
                let cmd = self.locks.cmd_lock();
                // SAFETY: never submitted.
                unsafe { self.device.free_command_buffer(cmd.pool(), cb) };
                return Err(driver("vkCreateFence")(result).into());
            }
        };

        tracing::debug!("new transfer instance");
        Ok(TransferInstance {
            cb,
            fence,
            staging: None,
            target: None,
        })
    }

    fn new_staging(&self, size: u64) -> Result<StagingBuffer, TransferError> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device is valid.
        let buffer = unsafe { self.device.create_buffer(&info) }.map_err(driver("vkCreateBuffer"))?;
        // SAFETY: `buffer` is fresh and unbound.
        let allocation = match unsafe { self.memory.alloc_buffer(buffer, false, None) } {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: never used.
                unsafe { self.device.destroy_buffer(buffer) };
                return Err(e.into());
            }
        };

        self.state.lock().staging_created += 1;
        tracing::debug!("new staging buffer: {size} bytes");
        Ok(StagingBuffer {
            buffer,
            allocation,
            size,
        })
    }

    unsafe fn destroy_instance(&self, instance: TransferInstance) {
        {
            let cmd = self.locks.cmd_lock();
            self.device.free_command_buffer(cmd.pool(), instance.cb);
        }
        self.device.destroy_fence(instance.fence);
    }

    unsafe fn destroy_staging(&self, staging: StagingBuffer) {
        self.device.destroy_buffer(staging.buffer);
        self.memory.free(staging.allocation);
    }

    /// Retire asynchronous transfers that have completed.
    pub fn poll(&self) {
        let mut state = self.state.lock();
        self.reap(&mut state);
    }

    /// Wait for every in-flight transfer that writes `buffer`.
    ///
    /// The waited instances leave the in-flight list first, so no other
    /// thread can recycle and reset their fences during the wait.
    pub fn wait_buffer(&self, buffer: vk::Buffer) -> Result<(), TransferError> {
        let waited: Vec<TransferInstance> = {
            let mut state = self.state.lock();
            let (waited, rest) = std::mem::take(&mut state.in_flight)
                .into_iter()
                .partition(|i| i.target == Some(buffer));
            state.in_flight = rest;
            waited
        };

        let mut waited = waited.into_iter();
        while let Some(instance) = waited.next() {
            if let Err(e) = self.wait(instance, None) {
                self.state.lock().in_flight.extend(waited);
                return Err(e);
            }
        }
        self.poll();
        Ok(())
    }

    /// Current pool statistics.
    pub fn stats(&self) -> TransferStats {
        let state = self.state.lock();
        TransferStats {
            instances: state.idle.len() + state.in_flight.len(),
            in_flight: state.in_flight.len(),
            staging_buffers: state.buffer_map.values().map(Vec::len).sum(),
            staging_bytes: state
                .buffer_map
                .iter()
                .map(|(size, list)| size * list.len() as u64)
                .sum(),
            staging_created: state.staging_created,
            submissions: state.submissions,
        }
    }

    /// Whether [`TransferManager::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Reject new transfers. Transfers already submitted still complete and
    /// their instances are destroyed instead of pooled.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Wait for in-flight transfers and destroy every pooled object.
    pub fn destroy(&self) {
        self.shutdown();

        let in_flight = std::mem::take(&mut self.state.lock().in_flight);
        for instance in &in_flight {
            // SAFETY: teardown; the fence belongs to a submitted instance.
            if let Err(result) = unsafe { self.device.wait_for_fence(instance.fence, u64::MAX) } {
                tracing::warn!("abandoning transfer with unknown fence state: {result}");
            }
        }

        let (idle, staging) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.buffer_map),
            )
        };

        let instances = in_flight.len() + idle.len();
        let mut buffers = 0;
        for mut instance in in_flight.into_iter().chain(idle) {
            // SAFETY: every instance has completed or been abandoned above.
            unsafe {
                if let Some(staging) = instance.staging.take() {
                    self.destroy_staging(staging);
                    buffers += 1;
                }
                self.destroy_instance(instance);
            }
        }
        for staging in staging.into_values().flatten() {
            // SAFETY: pooled staging buffers are idle.
            unsafe { self.destroy_staging(staging) };
            buffers += 1;
        }

        if instances + buffers > 0 {
            tracing::debug!(
                "destroyed {instances} transfer instances and {buffers} staging buffers"
            );
        }
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::mock::{init_tracing, HandleKind, MockDevice, MockOp};
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        device: Arc<MockDevice>,
        memory: Arc<MemoryManager>,
        transfer: TransferManager,
        pool: vk::CommandPool,
    }

    impl Fixture {
        fn new() -> Self {
            init_tracing();
            let device = MockDevice::discrete();
            let pool = unsafe {
                device
                    .create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .unwrap()
            };
            let memory = Arc::new(MemoryManager::new(device.clone(), MemoryConfig::default()));
            let locks = Arc::new(EngineLocks::new(pool));
            let transfer = TransferManager::new(device.clone(), memory.clone(), locks);
            Self {
                device,
                memory,
                transfer,
                pool,
            }
        }

        /// Device-local buffer, not host-visible on the discrete mock.
        fn local_buffer(&self, size: u64) -> (BufferTarget, Allocation) {
            let info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(vk::BufferUsageFlags::STORAGE_BUFFER);
            let buffer = unsafe { self.device.create_buffer(&info).unwrap() };
            let allocation = unsafe { self.memory.alloc_buffer(buffer, true, None).unwrap() };
            assert!(!allocation.is_host_visible());
            (BufferTarget { buffer, size }, allocation)
        }

        fn teardown(self, buffers: Vec<(BufferTarget, Allocation)>) {
            for (target, allocation) in buffers {
                unsafe { self.device.destroy_buffer(target.buffer) };
                self.memory.free(allocation);
            }
            self.transfer.destroy();
            unsafe { self.device.destroy_command_pool(self.pool) };
            self.memory.destroy();
            assert_eq!(self.device.total_live(), 0);
            assert_eq!(self.device.double_destroys(), 0);
        }
    }

    fn sequential_words(count: u32) -> Vec<u8> {
        (0..count).flat_map(u32::to_le_bytes).collect()
    }

    #[test]
    fn round_trip_after_unrelated_transfers() {
        let fx = Fixture::new();
        let big = fx.local_buffer(64 * 1024);
        let small = fx.local_buffer(1024);
        let pattern = sequential_words(16384);

        fx.transfer
            .blit_target(XferMode::Write(&pattern), big.0, 0)
            .unwrap();
        fx.transfer
            .blit_target(XferMode::Write(&[7u8; 1024]), small.0, 0)
            .unwrap();
        fx.transfer.fill_target(small.0, 0, 1024, 0xdead_beef).unwrap();

        let mut out = vec![0u8; pattern.len()];
        fx.transfer
            .blit_target(XferMode::Read(&mut out), big.0, 0)
            .unwrap();

        assert_eq!(out, pattern);
        let stats = fx.transfer.stats();
        // One 64 KiB and one 1 KiB staging buffer; the readback reused the former.
        assert_eq!(stats.staging_created, 2);
        assert_eq!(stats.staging_buffers, 2);
        assert_eq!(stats.staging_bytes, 64 * 1024 + 1024);
        assert_eq!(stats.instances, 1);
        assert_eq!(stats.submissions, 4);

        fx.teardown(vec![big, small]);
    }

    #[test]
    fn round_trip_at_offset() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(4096);
        let data: Vec<u8> = (0..=255).collect();

        fx.transfer
            .blit_target(XferMode::Write(&data), buf.0, 1000)
            .unwrap();
        let mut out = vec![0u8; 256];
        fx.transfer
            .blit_target(XferMode::Read(&mut out), buf.0, 1000)
            .unwrap();

        assert_eq!(out, data);
        assert_eq!(&fx.device.buffer_contents(buf.0.buffer)[1000..1256], &data[..]);
        fx.teardown(vec![buf]);
    }

    #[test]
    fn staging_not_reused_while_in_flight() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(2048);

        fx.device.hold_submissions(true);
        fx.transfer
            .blit_target(XferMode::WriteAsync(&[1u8; 1024]), buf.0, 0)
            .unwrap();
        fx.transfer
            .blit_target(XferMode::WriteAsync(&[2u8; 1024]), buf.0, 1024)
            .unwrap();

        let stats = fx.transfer.stats();
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.instances, 2);
        assert_eq!(stats.staging_created, 2);
        assert_eq!(stats.staging_buffers, 0);

        fx.device.release_held();
        fx.transfer.poll();
        let stats = fx.transfer.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.staging_buffers, 2);

        fx.transfer
            .blit_target(XferMode::WriteAsync(&[3u8; 1024]), buf.0, 0)
            .unwrap();
        assert_eq!(fx.transfer.stats().staging_created, 2);
        fx.transfer.wait_buffer(buf.0.buffer).unwrap();

        let contents = fx.device.buffer_contents(buf.0.buffer);
        assert!(contents[..1024].iter().all(|&b| b == 3));
        assert!(contents[1024..].iter().all(|&b| b == 2));
        fx.teardown(vec![buf]);
    }

    #[test]
    fn fill_writes_pattern() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(256);

        fx.transfer.fill_target(buf.0, 64, 128, 0x0403_0201).unwrap();

        let contents = fx.device.buffer_contents(buf.0.buffer);
        assert!(contents[..64].iter().all(|&b| b == 0));
        assert_eq!(&contents[64..72], &[1, 2, 3, 4, 1, 2, 3, 4]);
        assert!(contents[192..].iter().all(|&b| b == 0));
        // Fills need no staging memory.
        assert_eq!(fx.transfer.stats().staging_created, 0);

        let err = fx.transfer.fill_target(buf.0, 2, 8, 0).unwrap_err();
        assert!(matches!(err, TransferError::Incompatible(_)));
        fx.teardown(vec![buf]);
    }

    #[test]
    fn device_to_device_copy() {
        let fx = Fixture::new();
        let src = fx.local_buffer(512);
        let dst = fx.local_buffer(512);
        let data: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();

        fx.transfer
            .blit_target(XferMode::Write(&data), src.0, 0)
            .unwrap();
        let created = fx.transfer.stats().staging_created;

        // The same path as blit_storage2 without Buffer wrappers.
        fx.transfer
            .execute(0, None, Completion::Wait, |cb, staging| unsafe {
                assert_eq!(staging, vk::Buffer::null());
                fx.device.cmd_copy_buffer(
                    cb,
                    src.0.buffer,
                    dst.0.buffer,
                    &[vk::BufferCopy {
                        src_offset: 256,
                        dst_offset: 0,
                        size: 256,
                    }],
                );
            })
            .unwrap();

        assert_eq!(&fx.device.buffer_contents(dst.0.buffer)[..256], &data[256..]);
        assert_eq!(fx.transfer.stats().staging_created, created);
        fx.teardown(vec![src, dst]);
    }

    #[test]
    fn out_of_range_is_rejected_before_submission() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(128);

        let err = fx
            .transfer
            .blit_target(XferMode::Write(&[0u8; 64]), buf.0, 100)
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::OutOfRange {
                offset: 100,
                size: 64,
                capacity: 128
            }
        );
        assert_eq!(fx.device.calls(MockOp::QueueSubmit), 0);
        fx.teardown(vec![buf]);
    }

    #[test]
    fn submit_failure_returns_resources() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(1024);

        fx.device.fail_next(MockOp::QueueSubmit);
        let err = fx
            .transfer
            .blit_target(XferMode::Write(&[5u8; 512]), buf.0, 0)
            .unwrap_err();
        assert!(matches!(err, TransferError::Driver(_)));

        let stats = fx.transfer.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.instances, 1);
        assert_eq!(stats.staging_buffers, 1);

        fx.transfer
            .blit_target(XferMode::Write(&[5u8; 512]), buf.0, 0)
            .unwrap();
        assert_eq!(fx.transfer.stats().staging_created, 1);
        fx.teardown(vec![buf]);
    }

    #[test]
    fn staging_allocation_failure_unwinds() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(1024);
        let buffers_before = fx.device.live(HandleKind::Buffer);

        fx.device.fail_next(MockOp::AllocateMemory);
        let err = fx
            .transfer
            .blit_target(XferMode::Write(&[1u8; 1024]), buf.0, 0)
            .unwrap_err();
        assert!(matches!(err, TransferError::Staging(_)));
        assert_eq!(fx.device.live(HandleKind::Buffer), buffers_before);
        assert_eq!(fx.transfer.stats().in_flight, 0);
        fx.teardown(vec![buf]);
    }

    #[test]
    fn shutdown_rejects_new_transfers() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(256);

        fx.device.hold_submissions(true);
        fx.transfer
            .blit_target(XferMode::WriteAsync(&[9u8; 256]), buf.0, 0)
            .unwrap();
        fx.transfer.shutdown();

        let err = fx
            .transfer
            .blit_target(XferMode::Write(&[1u8; 256]), buf.0, 0)
            .unwrap_err();
        assert_eq!(err, TransferError::Shutdown);

        // The in-flight write still lands.
        fx.device.release_held();
        assert!(fx.device.buffer_contents(buf.0.buffer).iter().all(|&b| b == 9));
        fx.teardown(vec![buf]);
    }

    #[test]
    fn async_writes_share_the_renderer_queue() {
        let fx = Fixture::new();
        let buf = fx.local_buffer(512);

        fx.transfer
            .blit_target(XferMode::WriteAsync(&[4u8; 256]), buf.0, 0)
            .unwrap();
        fx.transfer
            .blit_target(XferMode::Write(&[5u8; 256]), buf.0, 256)
            .unwrap();
        let mut out = vec![0u8; 512];
        fx.transfer
            .blit_target(XferMode::Read(&mut out), buf.0, 0)
            .unwrap();

        assert_eq!(fx.device.submissions_on(QueueId::Foreground), 1);
        assert_eq!(fx.device.submissions_on(QueueId::Background), 2);
        assert!(out[..256].iter().all(|&b| b == 4));
        assert!(out[256..].iter().all(|&b| b == 5));
        fx.teardown(vec![buf]);
    }

    #[test]
    fn concurrent_round_trips_keep_pools_consistent() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 50;
        let fx = Fixture::new();
        let buffers: Vec<_> = (0..THREADS).map(|_| fx.local_buffer(4096)).collect();

        thread::scope(|s| {
            for (t, buf) in buffers.iter().enumerate() {
                let transfer = &fx.transfer;
                s.spawn(move || {
                    let mut out = vec![0u8; 4096];
                    for round in 0..ROUNDS {
                        let data: Vec<u8> =
                            (0..4096).map(|i| (i + t * 31 + round) as u8).collect();
                        transfer
                            .blit_target(XferMode::Write(&data), buf.0, 0)
                            .unwrap();
                        transfer
                            .blit_target(XferMode::Read(&mut out), buf.0, 0)
                            .unwrap();
                        assert_eq!(out, data);
                    }
                });
            }
        });

        let stats = fx.transfer.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.staging_buffers as u64, stats.staging_created);
        assert_eq!(stats.submissions, (THREADS * ROUNDS * 2) as u64);
        fx.teardown(buffers);
    }

    #[test]
    fn waited_fences_are_not_reset_by_other_threads() {
        let fx = Fixture::new();
        let waited = fx.local_buffer(1024);
        let busy = fx.local_buffer(1024);

        fx.device.hold_submissions(true);
        fx.transfer
            .blit_target(XferMode::WriteAsync(&[1u8; 1024]), waited.0, 0)
            .unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| fx.transfer.wait_buffer(waited.0.buffer));
            thread::sleep(Duration::from_millis(20));
            fx.device.release_held();
            for i in 0..50u8 {
                fx.transfer
                    .blit_target(XferMode::Write(&[i; 1024]), busy.0, 0)
                    .unwrap();
            }
            waiter.join().unwrap().unwrap();
        });

        assert_eq!(fx.device.resets_while_waited(), 0);
        assert_eq!(fx.transfer.stats().in_flight, 0);
        assert!(fx.device.buffer_contents(waited.0.buffer).iter().all(|&b| b == 1));
        fx.teardown(vec![waited, busy]);
    }
}
