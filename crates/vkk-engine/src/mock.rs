//! Emulated device for unit tests.
//!
//! Memory is host RAM, recorded copy and fill commands execute when the
//! submission "completes", and fences can be held unsignaled to model work
//! still in flight. Every entry point is counted and any fallible one can be
//! told to fail.

use crate::device::{Device, MemoryProperties, QueueId};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entry points that are counted and can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    AllocateMemory,
    MapMemory,
    BindMemory,
    CreateBuffer,
    CreateImage,
    CreateImageView,
    CreateFence,
    CreateSemaphore,
    CreateCommandPool,
    AllocateCommandBuffer,
    BeginCommandBuffer,
    EndCommandBuffer,
    QueueSubmit,
    CreateDescriptorSetLayout,
    CreateDescriptorPool,
    AllocateDescriptorSets,
    CreatePipelineLayout,
    CreateShaderModule,
    CreateSampler,
    CreatePipeline,
}

/// Kinds of handles tracked for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Memory,
    Buffer,
    Image,
    ImageView,
    Fence,
    Semaphore,
    CommandPool,
    CommandBuffer,
    DescriptorSetLayout,
    DescriptorPool,
    PipelineLayout,
    ShaderModule,
    Sampler,
    Pipeline,
}

/// Heap bytes standing in for a device allocation.
struct HostBytes {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: plain heap memory; accesses are serialized by the test.
unsafe impl Send for HostBytes {}

impl HostBytes {
    fn new(len: usize) -> Self {
        let boxed = vec![0u8; len.max(1)].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed).cast::<u8>()).expect("box pointer");
        Self { ptr, len: len.max(1) }
    }

    fn at(&self, offset: u64, len: u64) -> *mut u8 {
        assert!(
            offset + len <= self.len as u64,
            "device access {offset}+{len} outside {} bytes",
            self.len
        );
        // SAFETY: bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset as usize) }
    }
}

impl Drop for HostBytes {
    fn drop(&mut self) {
        // SAFETY: reconstructs the box leaked in `new`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct MemoryRes {
    bytes: HostBytes,
    memory_type: u32,
}

struct BufferRes {
    size: u64,
    bound: Option<(u64, u64)>,
}

struct ImageRes {
    /// (offset, size) of each mip level within the image's memory.
    mips: Vec<(u64, u64)>,
    size: u64,
    bound: Option<(u64, u64)>,
}

enum Command {
    CopyBuffer {
        src: u64,
        dst: u64,
        regions: Vec<vk::BufferCopy>,
    },
    Fill {
        buffer: u64,
        offset: u64,
        size: u64,
        data: u32,
    },
    BufferToImage {
        buffer: u64,
        image: u64,
        regions: Vec<vk::BufferImageCopy>,
    },
    ImageToBuffer {
        image: u64,
        buffer: u64,
        regions: Vec<vk::BufferImageCopy>,
    },
}

struct Submission {
    command_buffers: Vec<u64>,
    fence: u64,
}

#[derive(Default)]
struct State {
    memory: HashMap<u64, MemoryRes>,
    buffers: HashMap<u64, BufferRes>,
    images: HashMap<u64, ImageRes>,
    fences: HashMap<u64, bool>,
    command_buffers: HashMap<u64, Vec<Command>>,
    descriptor_pools: HashMap<u64, (u32, u32)>,
    live: HashMap<HandleKind, HashSet<u64>>,
    destroyed: HashMap<HandleKind, usize>,
    double_destroys: usize,
    calls: HashMap<MockOp, usize>,
    fail: HashMap<MockOp, usize>,
    hold: bool,
    held: Vec<Submission>,
    submissions: usize,
    queues: HashMap<QueueId, usize>,
    dispatches: Vec<(u32, u32, u32)>,
    fence_waiters: HashMap<u64, usize>,
    resets_while_waited: usize,
    memory_type_bits: u32,
}

/// Emulated Vulkan device.
pub struct MockDevice {
    props: MemoryProperties,
    next: AtomicU64,
    state: Mutex<State>,
    cond: Condvar,
}

fn format_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM => 1,
        vk::Format::R8G8_UNORM
        | vk::Format::R4G4B4A4_UNORM_PACK16
        | vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8_UNORM => 3,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

impl MockDevice {
    fn with_types(memory_types: Vec<vk::MemoryPropertyFlags>, unified: bool) -> Arc<Self> {
        let count = memory_types.len() as u32;
        Arc::new(Self {
            props: MemoryProperties {
                memory_types,
                unified,
                max_allocation_count: 4096,
            },
            next: AtomicU64::new(0x1000),
            state: Mutex::new(State {
                memory_type_bits: (1 << count) - 1,
                ..Default::default()
            }),
            cond: Condvar::new(),
        })
    }

    /// Discrete GPU: device-local VRAM plus host-visible system memory.
    pub fn discrete() -> Arc<Self> {
        Self::with_types(
            vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            false,
        )
    }

    /// Mobile-style unified memory.
    pub fn unified() -> Arc<Self> {
        Self::with_types(
            vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
                    | vk::MemoryPropertyFlags::HOST_CACHED,
            ],
            true,
        )
    }

    /// Fail the next call of `op`.
    pub fn fail_next(&self, op: MockOp) {
        self.fail_after(op, 0);
    }

    /// Let `successes` calls of `op` through, then fail one.
    pub fn fail_after(&self, op: MockOp, successes: usize) {
        self.state.lock().fail.insert(op, successes);
    }

    /// Number of calls made to `op`.
    pub fn calls(&self, op: MockOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Live handles of `kind`.
    pub fn live(&self, kind: HandleKind) -> usize {
        self.state.lock().live.get(&kind).map_or(0, HashSet::len)
    }

    /// Live handles of every kind.
    pub fn total_live(&self) -> usize {
        self.state.lock().live.values().map(HashSet::len).sum()
    }

    /// Destroy calls made for `kind`.
    pub fn destroyed(&self, kind: HandleKind) -> usize {
        self.state.lock().destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Destroy calls for handles that were not live.
    pub fn double_destroys(&self) -> usize {
        self.state.lock().double_destroys
    }

    /// Total successful queue submissions.
    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    /// Successful submissions to `queue`.
    pub fn submissions_on(&self, queue: QueueId) -> usize {
        self.state.lock().queues.get(&queue).copied().unwrap_or(0)
    }

    /// Fence resets issued while another thread was waiting on the fence.
    pub fn resets_while_waited(&self) -> usize {
        self.state.lock().resets_while_waited
    }

    /// Dispatch sizes recorded so far.
    pub fn dispatches(&self) -> Vec<(u32, u32, u32)> {
        self.state.lock().dispatches.clone()
    }

    /// Restrict the memory types reported in memory requirements.
    pub fn set_memory_type_bits(&self, bits: u32) {
        self.state.lock().memory_type_bits = bits;
    }

    /// While held, submitted work does not execute and fences stay unsignaled.
    pub fn hold_submissions(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    /// Complete every held submission in order.
    pub fn release_held(&self) {
        let mut state = self.state.lock();
        state.hold = false;
        let held = std::mem::take(&mut state.held);
        for submission in held {
            Self::complete(&mut state, submission);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Raw contents of a bound buffer, bypassing host visibility.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        let state = self.state.lock();
        let res = &state.buffers[&buffer.as_raw()];
        let (memory, offset) = res.bound.expect("buffer is bound");
        let ptr = state.memory[&memory].bytes.at(offset, res.size);
        let mut out = vec![0u8; res.size as usize];
        // SAFETY: `ptr` covers `res.size` bytes.
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
        out
    }

    fn begin(&self, op: MockOp) -> VkResult<MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.fail.get_mut(&op) {
            if *remaining == 0 {
                state.fail.remove(&op);
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            *remaining -= 1;
        }
        Ok(state)
    }

    fn create<T: Handle>(&self, state: &mut State, kind: HandleKind) -> T {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        state.live.entry(kind).or_default().insert(raw);
        T::from_raw(raw)
    }

    fn release(&self, kind: HandleKind, raw: u64) -> MutexGuard<'_, State> {
        let mut state = self.state.lock();
        let removed = state.live.entry(kind).or_default().remove(&raw);
        if removed {
            *state.destroyed.entry(kind).or_default() += 1;
        } else if raw != 0 {
            state.double_destroys += 1;
        }
        state
    }

    fn buffer_ptr(state: &State, buffer: u64, offset: u64, len: u64) -> *mut u8 {
        let res = &state.buffers[&buffer];
        assert!(offset + len <= res.size, "buffer access out of range");
        let (memory, base) = res.bound.expect("buffer is bound");
        state.memory[&memory].bytes.at(base + offset, len)
    }

    fn image_ptr(state: &State, image: u64, mip: u32, offset: u64, len: u64) -> *mut u8 {
        let res = &state.images[&image];
        let (mip_offset, mip_size) = res.mips[mip as usize];
        assert!(offset + len <= mip_size, "image access out of range");
        let (memory, base) = res.bound.expect("image is bound");
        state.memory[&memory].bytes.at(base + mip_offset + offset, len)
    }

    fn execute(state: &State, command: &Command) {
        // SAFETY (all arms): pointers come from bounds-checked lookups and
        // `ptr::copy` tolerates overlap.
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                for r in regions {
                    let s = Self::buffer_ptr(state, *src, r.src_offset, r.size);
                    let d = Self::buffer_ptr(state, *dst, r.dst_offset, r.size);
                    unsafe { std::ptr::copy(s, d, r.size as usize) };
                }
            }
            Command::Fill {
                buffer,
                offset,
                size,
                data,
            } => {
                let size = if *size == vk::WHOLE_SIZE {
                    state.buffers[buffer].size - offset
                } else {
                    *size
                };
                let d = Self::buffer_ptr(state, *buffer, *offset, size);
                let pattern = data.to_le_bytes();
                for i in 0..size as usize {
                    unsafe { *d.add(i) = pattern[i % 4] };
                }
            }
            Command::BufferToImage {
                buffer,
                image,
                regions,
            } => {
                for r in regions {
                    let len = Self::region_len(state, *image, r);
                    let s = Self::buffer_ptr(state, *buffer, r.buffer_offset, len);
                    let d = Self::image_ptr(state, *image, r.image_subresource.mip_level, 0, len);
                    unsafe { std::ptr::copy(s, d, len as usize) };
                }
            }
            Command::ImageToBuffer {
                image,
                buffer,
                regions,
            } => {
                for r in regions {
                    let len = Self::region_len(state, *image, r);
                    let s = Self::image_ptr(state, *image, r.image_subresource.mip_level, 0, len);
                    let d = Self::buffer_ptr(state, *buffer, r.buffer_offset, len);
                    unsafe { std::ptr::copy(s, d, len as usize) };
                }
            }
        }
    }

    /// Engine copies always cover a whole mip level.
    fn region_len(state: &State, image: u64, region: &vk::BufferImageCopy) -> u64 {
        state.images[&image].mips[region.image_subresource.mip_level as usize].1
    }

    fn complete(state: &mut State, submission: Submission) {
        for cb in &submission.command_buffers {
            if let Some(commands) = state.command_buffers.get(cb) {
                for command in commands {
                    Self::execute(state, command);
                }
            }
        }
        if submission.fence != 0 {
            state.fences.insert(submission.fence, true);
        }
    }

    fn record(&self, cb: vk::CommandBuffer, command: Command) {
        let mut state = self.state.lock();
        state
            .command_buffers
            .get_mut(&cb.as_raw())
            .expect("recording into a live command buffer")
            .push(command);
    }
}

impl Device for MockDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.props
    }

    fn queue_family_index(&self) -> u32 {
        0
    }

    unsafe fn allocate_memory(&self, size: u64, memory_type: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.begin(MockOp::AllocateMemory)?;
        let memory: vk::DeviceMemory = self.create(&mut state, HandleKind::Memory);
        state.memory.insert(
            memory.as_raw(),
            MemoryRes {
                bytes: HostBytes::new(size as usize),
                memory_type,
            },
        );
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.release(HandleKind::Memory, memory.as_raw());
        state.memory.remove(&memory.as_raw());
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<*mut u8> {
        let state = self.begin(MockOp::MapMemory)?;
        let res = &state.memory[&memory.as_raw()];
        if !self.props.is_host_visible(res.memory_type) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(res.bytes.at(0, size))
    }

    unsafe fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.begin(MockOp::CreateBuffer)?;
        let buffer: vk::Buffer = self.create(&mut state, HandleKind::Buffer);
        state.buffers.insert(
            buffer.as_raw(),
            BufferRes {
                size: info.size,
                bound: None,
            },
        );
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.release(HandleKind::Buffer, buffer.as_raw());
        state.buffers.remove(&buffer.as_raw());
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers[&buffer.as_raw()].size;
        vk::MemoryRequirements {
            size: size.div_ceil(16) * 16,
            alignment: 256,
            memory_type_bits: state.memory_type_bits,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut state = self.begin(MockOp::BindMemory)?;
        if let Some(res) = state.buffers.get_mut(&buffer.as_raw()) {
            res.bound = Some((memory.as_raw(), offset));
        }
        Ok(())
    }

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.begin(MockOp::CreateImage)?;
        let image: vk::Image = self.create(&mut state, HandleKind::Image);
        let bpp = format_size(info.format);
        let mut mips = Vec::new();
        let mut offset = 0;
        for level in 0..info.mip_levels.max(1) {
            let w = u64::from((info.extent.width >> level).max(1));
            let h = u64::from((info.extent.height >> level).max(1));
            let d = u64::from((info.extent.depth >> level).max(1));
            let size = w * h * d * bpp;
            mips.push((offset, size));
            offset += size;
        }
        state.images.insert(
            image.as_raw(),
            ImageRes {
                mips,
                size: offset,
                bound: None,
            },
        );
        Ok(image)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        let mut state = self.release(HandleKind::Image, image.as_raw());
        state.images.remove(&image.as_raw());
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        vk::MemoryRequirements {
            size: state.images[&image.as_raw()].size,
            alignment: 4096,
            memory_type_bits: state.memory_type_bits,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let mut state = self.begin(MockOp::BindMemory)?;
        if let Some(res) = state.images.get_mut(&image.as_raw()) {
            res.bound = Some((memory.as_raw(), offset));
        }
        Ok(())
    }

    unsafe fn create_image_view(
        &self,
        _info: &vk::ImageViewCreateInfo<'_>,
    ) -> VkResult<vk::ImageView> {
        let mut state = self.begin(MockOp::CreateImageView)?;
        Ok(self.create(&mut state, HandleKind::ImageView))
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.release(HandleKind::ImageView, view.as_raw());
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.begin(MockOp::CreateFence)?;
        let fence: vk::Fence = self.create(&mut state, HandleKind::Fence);
        state.fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.release(HandleKind::Fence, fence.as_raw());
        state.fences.remove(&fence.as_raw());
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.state.lock().fences[&fence.as_raw()])
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let raw = fence.as_raw();
        let mut state = self.state.lock();
        *state.fence_waiters.entry(raw).or_default() += 1;
        let result = loop {
            if state.fences[&raw] {
                break Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && !state.fences[&raw]
                    {
                        break Err(vk::Result::TIMEOUT);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        };
        if let Some(waiters) = state.fence_waiters.get_mut(&raw) {
            *waiters -= 1;
        }
        result
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.fence_waiters.get(&raw).is_some_and(|&n| n > 0) {
            state.resets_while_waited += 1;
        }
        state.fences.insert(raw, false);
        Ok(())
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.begin(MockOp::CreateSemaphore)?;
        Ok(self.create(&mut state, HandleKind::Semaphore))
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.release(HandleKind::Semaphore, semaphore.as_raw());
    }

    unsafe fn create_command_pool(
        &self,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.begin(MockOp::CreateCommandPool)?;
        Ok(self.create(&mut state, HandleKind::CommandPool))
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.release(HandleKind::CommandPool, pool.as_raw());
    }

    unsafe fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.begin(MockOp::AllocateCommandBuffer)?;
        let cb: vk::CommandBuffer = self.create(&mut state, HandleKind::CommandBuffer);
        state.command_buffers.insert(cb.as_raw(), Vec::new());
        Ok(cb)
    }

    unsafe fn free_command_buffer(&self, _pool: vk::CommandPool, cb: vk::CommandBuffer) {
        let mut state = self.release(HandleKind::CommandBuffer, cb.as_raw());
        state.command_buffers.remove(&cb.as_raw());
    }

    unsafe fn begin_command_buffer(
        &self,
        cb: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.begin(MockOp::BeginCommandBuffer)?;
        if let Some(commands) = state.command_buffers.get_mut(&cb.as_raw()) {
            commands.clear();
        }
        Ok(())
    }

    unsafe fn end_command_buffer(&self, _cb: vk::CommandBuffer) -> VkResult<()> {
        self.begin(MockOp::EndCommandBuffer)?;
        Ok(())
    }

    unsafe fn reset_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        if let Some(commands) = self.state.lock().command_buffers.get_mut(&cb.as_raw()) {
            commands.clear();
        }
        Ok(())
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            cb,
            Command::CopyBuffer {
                src: src.as_raw(),
                dst: dst.as_raw(),
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_fill_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        self.record(
            cb,
            Command::Fill {
                buffer: buffer.as_raw(),
                offset,
                size,
                data,
            },
        );
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        _cb: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        _buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        _image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cb,
            Command::BufferToImage {
                buffer: src.as_raw(),
                image: dst.as_raw(),
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            cb,
            Command::ImageToBuffer {
                image: src.as_raw(),
                buffer: dst.as_raw(),
                regions: regions.to_vec(),
            },
        );
    }

    unsafe fn cmd_blit_image(
        &self,
        _cb: vk::CommandBuffer,
        _src: vk::Image,
        _src_layout: vk::ImageLayout,
        _dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        _regions: &[vk::ImageBlit],
        _filter: vk::Filter,
    ) {
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        _cb: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        _cb: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        _sets: &[vk::DescriptorSet],
    ) {
    }

    unsafe fn cmd_dispatch(&self, _cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state.lock().dispatches.push((x, y, z));
    }

    unsafe fn queue_submit(
        &self,
        queue: QueueId,
        command_buffers: &[vk::CommandBuffer],
        _wait_semaphores: &[vk::Semaphore],
        _wait_stages: &[vk::PipelineStageFlags],
        _signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.begin(MockOp::QueueSubmit)?;
        state.submissions += 1;
        *state.queues.entry(queue).or_default() += 1;
        let submission = Submission {
            command_buffers: command_buffers.iter().map(|cb| cb.as_raw()).collect(),
            fence: fence.as_raw(),
        };
        if state.hold {
            state.held.push(submission);
        } else {
            Self::complete(&mut state, submission);
            drop(state);
            self.cond.notify_all();
        }
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, _queue: QueueId) -> VkResult<()> {
        self.release_held();
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> VkResult<()> {
        self.release_held();
        Ok(())
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        _info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.begin(MockOp::CreateDescriptorSetLayout)?;
        Ok(self.create(&mut state, HandleKind::DescriptorSetLayout))
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.release(HandleKind::DescriptorSetLayout, layout.as_raw());
    }

    unsafe fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.begin(MockOp::CreateDescriptorPool)?;
        let pool: vk::DescriptorPool = self.create(&mut state, HandleKind::DescriptorPool);
        state.descriptor_pools.insert(pool.as_raw(), (info.max_sets, 0));
        Ok(pool)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.release(HandleKind::DescriptorPool, pool.as_raw());
        state.descriptor_pools.remove(&pool.as_raw());
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.begin(MockOp::AllocateDescriptorSets)?;
        let count = info.descriptor_set_count;
        let pool = state
            .descriptor_pools
            .get_mut(&info.descriptor_pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if pool.1 + count > pool.0 {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        pool.1 += count;
        Ok((0..count)
            .map(|_| vk::DescriptorSet::from_raw(self.next.fetch_add(1, Ordering::Relaxed)))
            .collect())
    }

    unsafe fn update_descriptor_sets(&self, _writes: &[vk::WriteDescriptorSet<'_>]) {}

    unsafe fn create_pipeline_layout(
        &self,
        _info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout> {
        let mut state = self.begin(MockOp::CreatePipelineLayout)?;
        Ok(self.create(&mut state, HandleKind::PipelineLayout))
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.release(HandleKind::PipelineLayout, layout.as_raw());
    }

    unsafe fn create_shader_module(&self, _code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.begin(MockOp::CreateShaderModule)?;
        Ok(self.create(&mut state, HandleKind::ShaderModule))
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.release(HandleKind::ShaderModule, module.as_raw());
    }

    unsafe fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        let mut state = self.begin(MockOp::CreateSampler)?;
        Ok(self.create(&mut state, HandleKind::Sampler))
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.release(HandleKind::Sampler, sampler.as_raw());
    }

    unsafe fn create_compute_pipeline(
        &self,
        _info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.begin(MockOp::CreatePipeline)?;
        Ok(self.create(&mut state, HandleKind::Pipeline))
    }

    unsafe fn create_graphics_pipeline(
        &self,
        _info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.begin(MockOp::CreatePipeline)?;
        Ok(self.create(&mut state, HandleKind::Pipeline))
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.release(HandleKind::Pipeline, pipeline.as_raw());
    }
}

/// Route engine logs to the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
