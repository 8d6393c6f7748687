//! Buffers with per-frame update modes.

use crate::deferred::Object;
use crate::engine::{Core, Engine};
use crate::error::{driver, EngineError, Result, TransferError};
use crate::memory::Allocation;
use crate::renderer::Tracked;
use crate::transfer::{BufferTarget, XferMode};
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a buffer is updated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// One copy; updates land immediately. The caller keeps the GPU off it.
    Synchronous,
    /// One copy; contents are fixed at creation.
    Static,
    /// One copy per frame in flight; updates write the current frame's copy.
    Asynchronous,
}

/// What a buffer is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Uniform,
    Vertex,
    Index,
    /// Device-local, single copy; accessed through the transfer manager.
    Storage,
}

impl BufferUsage {
    fn flags(self) -> vk::BufferUsageFlags {
        let usage = match self {
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
        usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }

    pub(crate) fn descriptor_type(self) -> Option<vk::DescriptorType> {
        match self {
            Self::Uniform => Some(vk::DescriptorType::UNIFORM_BUFFER),
            Self::Storage => Some(vk::DescriptorType::STORAGE_BUFFER),
            Self::Vertex | Self::Index => None,
        }
    }
}

/// Vulkan handles of a released buffer.
pub struct BufferResources {
    buffers: Vec<vk::Buffer>,
    allocations: Vec<Allocation>,
    pub(crate) ts: u64,
}

impl BufferResources {
    /// # Safety
    /// No pending GPU work may reference the buffers.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        for &buffer in &self.buffers {
            if let Err(e) = core.transfer.wait_buffer(buffer) {
                tracing::warn!("destroying buffer with transfers in unknown state: {e}");
            }
            core.device.destroy_buffer(buffer);
        }
        for allocation in self.allocations {
            core.memory.free(allocation);
        }
    }
}

/// A buffer, replicated per frame in flight for [`UpdateMode::Asynchronous`].
pub struct Buffer {
    engine: Engine,
    mode: UpdateMode,
    usage: BufferUsage,
    size: u64,
    buffers: Vec<vk::Buffer>,
    allocations: Vec<Allocation>,
    ts: AtomicU64,
}

impl Buffer {
    /// Create a buffer of `size` bytes, optionally initialized from `data`.
    ///
    /// Storage buffers and static buffers live in device-local memory and are
    /// uploaded through the transfer manager, blocking until the copy lands.
    pub fn new(
        engine: &Engine,
        mode: UpdateMode,
        usage: BufferUsage,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<Self> {
        engine.check_live()?;
        if size == 0 {
            return Err(EngineError::validation("buffer size must be non-zero"));
        }
        if let Some(data) = data {
            if data.len() as u64 > size {
                return Err(EngineError::validation(format!(
                    "initial data of {} bytes exceeds buffer size {size}",
                    data.len()
                )));
            }
        }

        let copies = match (mode, usage) {
            (UpdateMode::Asynchronous, BufferUsage::Storage)
            | (UpdateMode::Synchronous | UpdateMode::Static, _) => 1,
            (UpdateMode::Asynchronous, _) => engine.frames_in_flight(),
        };
        let local_memory = usage == BufferUsage::Storage || mode == UpdateMode::Static;
        let core = engine.core();

        let mut resources = BufferResources {
            buffers: Vec::with_capacity(copies),
            allocations: Vec::with_capacity(copies),
            ts: 0,
        };
        for _ in 0..copies {
            if let Err(e) =
                Self::create_copy(core, &mut resources, usage, size, local_memory, data)
            {
                // SAFETY: nothing referencing the copies was submitted.
                unsafe { resources.destroy(core) };
                return Err(e);
            }
        }

        Ok(Self {
            engine: engine.clone(),
            mode,
            usage,
            size,
            buffers: resources.buffers,
            allocations: resources.allocations,
            ts: AtomicU64::new(0),
        })
    }

    fn create_copy(
        core: &Core,
        resources: &mut BufferResources,
        usage: BufferUsage,
        size: u64,
        local_memory: bool,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: the device is valid.
        let buffer = unsafe { core.device.create_buffer(&info) }.map_err(driver("vkCreateBuffer"))?;
        resources.buffers.push(buffer);

        // SAFETY: `buffer` is fresh and unbound.
        let allocation = unsafe { core.memory.alloc_buffer(buffer, local_memory, data) }?;
        let host_visible = allocation.is_host_visible();
        resources.allocations.push(allocation);

        if let (Some(data), false) = (data, host_visible) {
            core.transfer
                .blit_target(XferMode::Write(data), BufferTarget { buffer, size }, 0)?;
        }
        Ok(())
    }

    /// Update mode chosen at creation.
    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Usage chosen at creation.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Size of each copy in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of copies.
    pub fn copies(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the buffer's memory can be written by the host.
    pub fn is_host_visible(&self) -> bool {
        self.allocations[0].is_host_visible()
    }

    fn slot(&self) -> usize {
        self.engine.frame_slot() % self.buffers.len()
    }

    /// Handle of the copy for the current frame slot.
    pub fn handle(&self) -> vk::Buffer {
        self.buffers[self.slot()]
    }

    /// Handle of copy `index`.
    pub fn handle_at(&self, index: usize) -> vk::Buffer {
        self.buffers[index % self.buffers.len()]
    }

    /// Write `data` at the start of the current frame's copy.
    ///
    /// Host-visible copies are written directly; device-local ones go through
    /// a synchronous transfer. `&mut self` keeps a single writer per buffer.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        if self.mode == UpdateMode::Static {
            return Err(EngineError::validation("static buffers cannot be updated"));
        }
        if data.len() as u64 > self.size {
            return Err(EngineError::validation(format!(
                "update of {} bytes exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        let slot = self.slot();
        let allocation = &mut self.allocations[slot];
        if allocation.is_host_visible() {
            allocation.write(0, data)?;
        } else {
            let target = BufferTarget {
                buffer: self.buffers[slot],
                size: self.size,
            };
            self.engine
                .transfer()
                .blit_target(XferMode::Write(data), target, 0)?;
        }
        Ok(())
    }

    /// Write a plain-data value at the start of the current frame's copy.
    pub fn update_pod<T: bytemuck::Pod>(&mut self, value: &T) -> Result<()> {
        self.update(bytemuck::bytes_of(value))
    }

    /// Single-copy target for the transfer manager.
    pub(crate) fn transfer_target(&self) -> std::result::Result<BufferTarget, TransferError> {
        if self.buffers.len() != 1 {
            return Err(TransferError::Incompatible(format!(
                "buffer has {} copies",
                self.buffers.len()
            )));
        }
        Ok(BufferTarget {
            buffer: self.buffers[0],
            size: self.size,
        })
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Tracked for Buffer {
    fn mark_used(&self, ts: u64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("mode", &self.mode)
            .field("usage", &self.usage)
            .field("size", &self.size)
            .field("copies", &self.buffers.len())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let resources = BufferResources {
            buffers: std::mem::take(&mut self.buffers),
            allocations: std::mem::take(&mut self.allocations),
            ts: self.ts.load(Ordering::Acquire),
        };
        self.engine.delete_object(Object::Buffer(resources));
    }
}
