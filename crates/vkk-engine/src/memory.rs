//! Pooled device memory management.
//!
//! `vkAllocateMemory` is slow and capped by `maxMemoryAllocationCount`
//! (commonly 4096), so buffers and images never get a device allocation of
//! their own. Requests are rounded up to a power-of-two size class and
//! served from pools keyed by memory type, size class and tiling. Each pool
//! owns slabs (one device allocation each) split into equal blocks.
//!
//! Fully free slabs are retained up to [`MemoryConfig::retained_empty_slabs`]
//! per pool; any further empty slab is returned to the device on free.

use crate::config::MemoryConfig;
use crate::device::Device;
use crate::error::{driver, AllocationError};
use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pools never mix linear (buffer) and optimal (image) resources, which
/// keeps `bufferImageGranularity` out of the block math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    memory_type: u32,
    stride: u64,
    linear: bool,
}

/// Persistently mapped slab base pointer.
#[derive(Debug, Clone, Copy)]
struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to device memory mapped for the lifetime of the
// slab; access to each block is exclusive to the owning `Allocation`.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

struct Slab {
    id: u64,
    memory: vk::DeviceMemory,
    mapped: Option<MappedPtr>,
    free: Vec<u32>,
}

struct Pool {
    blocks_per_slab: u32,
    slabs: Vec<Slab>,
}

impl Pool {
    fn is_empty_slab(&self, slab: &Slab) -> bool {
        slab.free.len() == self.blocks_per_slab as usize
    }

    fn empty_slabs(&self) -> usize {
        self.slabs.iter().filter(|s| self.is_empty_slab(s)).count()
    }
}

#[derive(Default)]
struct MemoryState {
    pools: HashMap<PoolKey, Pool>,
    next_slab_id: u64,
    device_allocations: u64,
    device_frees: u64,
    live_blocks: usize,
    block_bytes: u64,
}

/// Snapshot of memory manager usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Pools with at least one slab.
    pub pools: usize,
    /// Slabs currently held.
    pub slabs: usize,
    /// Device allocations made since creation.
    pub device_allocations: u64,
    /// Device allocations released since creation.
    pub device_frees: u64,
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Bytes held in slabs.
    pub slab_bytes: u64,
    /// Bytes of blocks currently handed out.
    pub block_bytes: u64,
}

/// A block of device memory bound to one buffer or image.
///
/// Allocations are not `Clone`: a block has exactly one owner, and returning
/// it with [`MemoryManager::free`] consumes the handle.
pub struct Allocation {
    key: PoolKey,
    slab_id: u64,
    block: u32,
    memory: vk::DeviceMemory,
    offset: u64,
    size: u64,
    mapped: Option<MappedPtr>,
}

impl Allocation {
    /// Backing device memory.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Offset of the block within the device memory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size class the request was rounded to.
    pub fn block_size(&self) -> u64 {
        self.key.stride
    }

    /// Memory type index of the backing slab.
    pub fn memory_type(&self) -> u32 {
        self.key.memory_type
    }

    /// Whether the block can be written from the host.
    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }

    fn host_ptr(&self, offset: u64, len: usize) -> Result<*mut u8, AllocationError> {
        let base = self.mapped.ok_or(AllocationError::NotHostVisible)?;
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.size) {
            return Err(AllocationError::OutOfRange {
                offset,
                len: len as u64,
                size: self.size,
            });
        }
        // SAFETY: the slab is mapped in full and the range was checked above.
        Ok(unsafe { base.0.as_ptr().add((self.offset + offset) as usize) })
    }

    /// Copy `data` into the block (host-visible memory only).
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), AllocationError> {
        let dst = self.host_ptr(offset, data.len())?;
        // SAFETY: `dst` is valid for `data.len()` bytes and this block is owned by `self`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Copy bytes out of the block (host-visible memory only).
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), AllocationError> {
        let src = self.host_ptr(offset, out.len())?;
        // SAFETY: `src` is valid for `out.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("memory_type", &self.key.memory_type)
            .field("block_size", &self.key.stride)
            .field("slab", &self.slab_id)
            .field("block", &self.block)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("host_visible", &self.mapped.is_some())
            .finish()
    }
}

/// Device memory pools for buffers and images.
pub struct MemoryManager {
    device: Arc<dyn Device>,
    config: MemoryConfig,
    state: Mutex<MemoryState>,
    shutdown: AtomicBool,
}

impl MemoryManager {
    /// Create an empty manager. Pools are created on first use.
    pub fn new(device: Arc<dyn Device>, config: MemoryConfig) -> Self {
        Self {
            device,
            config,
            state: Mutex::new(MemoryState::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Find a memory type allowed by `type_bits` that has all of `flags`.
    pub fn memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, AllocationError> {
        self.device
            .memory_properties()
            .find_type(type_bits, flags)
            .ok_or(AllocationError::NoMemoryType { type_bits, flags })
    }

    /// Pick a memory type for the `local_memory` hint.
    ///
    /// Local requests prefer device-local memory, and on unified-memory
    /// devices a device-local type that is also host-visible. Everything else
    /// gets host-visible coherent memory.
    fn select_memory_type(
        &self,
        type_bits: u32,
        local_memory: bool,
    ) -> Result<u32, AllocationError> {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let candidates = if !local_memory {
            vec![host]
        } else if self.device.memory_properties().unified {
            vec![local | host, local, host]
        } else {
            vec![local, host]
        };

        candidates
            .iter()
            .find_map(|&flags| self.device.memory_properties().find_type(type_bits, flags))
            .ok_or(AllocationError::NoMemoryType {
                type_bits,
                flags: candidates[0],
            })
    }

    /// Allocate and bind memory for a buffer.
    ///
    /// When the chosen memory is host-visible and `data` is given, the data is
    /// copied in directly. Device-local memory is left uninitialized and the
    /// caller uploads through the transfer manager.
    ///
    /// # Safety
    /// `buffer` must be a valid, unbound buffer created on this device.
    pub unsafe fn alloc_buffer(
        &self,
        buffer: vk::Buffer,
        local_memory: bool,
        data: Option<&[u8]>,
    ) -> Result<Allocation, AllocationError> {
        let requirements = self.device.buffer_memory_requirements(buffer);
        let memory_type = self.select_memory_type(requirements.memory_type_bits, local_memory)?;
        let mut allocation = self.alloc_block(&requirements, memory_type, true)?;

        if let Err(e) = self
            .device
            .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
            .map_err(driver("vkBindBufferMemory"))
        {
            self.free(allocation);
            return Err(e.into());
        }

        if let Some(data) = data {
            if allocation.is_host_visible() {
                if let Err(e) = allocation.write(0, data) {
                    self.free(allocation);
                    return Err(e);
                }
            }
        }

        Ok(allocation)
    }

    /// Allocate and bind memory for an image. Image memory is never
    /// initialized here; pixels go through the transfer manager.
    ///
    /// # Safety
    /// `image` must be a valid, unbound image created on this device.
    pub unsafe fn alloc_image(
        &self,
        image: vk::Image,
        local_memory: bool,
    ) -> Result<Allocation, AllocationError> {
        let requirements = self.device.image_memory_requirements(image);
        let memory_type = self.select_memory_type(requirements.memory_type_bits, local_memory)?;
        let allocation = self.alloc_block(&requirements, memory_type, false)?;

        if let Err(e) = self
            .device
            .bind_image_memory(image, allocation.memory, allocation.offset)
            .map_err(driver("vkBindImageMemory"))
        {
            self.free(allocation);
            return Err(e.into());
        }

        Ok(allocation)
    }

    fn alloc_block(
        &self,
        requirements: &vk::MemoryRequirements,
        memory_type: u32,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AllocationError::Shutdown);
        }

        // Power-of-two strides keep every block aligned to any power-of-two
        // alignment not larger than the stride.
        let stride = requirements
            .size
            .max(requirements.alignment)
            .max(self.config.min_block_size)
            .next_power_of_two();
        let key = PoolKey {
            memory_type,
            stride,
            linear,
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let blocks_per_slab = (self.config.slab_size / stride)
            .clamp(1, u64::from(self.config.max_blocks_per_slab.max(1))) as u32;
        let pool = state.pools.entry(key).or_insert_with(|| Pool {
            blocks_per_slab,
            slabs: Vec::new(),
        });

        // Fill the fullest slab first so empty ones can be released.
        let slab_index = pool
            .slabs
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.free.is_empty())
            .min_by_key(|(_, s)| s.free.len())
            .map(|(i, _)| i);

        let slab_index = match slab_index {
            Some(i) => i,
            None => {
                let slab_bytes = stride * u64::from(pool.blocks_per_slab);
                // SAFETY: the device is valid for the manager's lifetime.
                let memory = unsafe { self.device.allocate_memory(slab_bytes, memory_type) }
                    .map_err(|result| {
                        tracing::error!(
                            "vkAllocateMemory failed: {result} ({slab_bytes} bytes, type {memory_type})"
                        );
                        AllocationError::OutOfMemory {
                            size: slab_bytes,
                            memory_type,
                        }
                    })?;

                let mapped = if self.device.memory_properties().is_host_visible(memory_type) {
                    // SAFETY: freshly allocated host-visible memory, mapped once.
                    match unsafe { self.device.map_memory(memory, slab_bytes) } {
                        Ok(ptr) => NonNull::new(ptr).map(MappedPtr),
                        Err(result) => {
                            // SAFETY: nothing is bound to the memory yet.
                            unsafe { self.device.free_memory(memory) };
                            return Err(driver("vkMapMemory")(result).into());
                        }
                    }
                } else {
                    None
                };

                state.next_slab_id += 1;
                state.device_allocations += 1;
                pool.slabs.push(Slab {
                    id: state.next_slab_id,
                    memory,
                    mapped,
                    free: (0..pool.blocks_per_slab).rev().collect(),
                });
                tracing::debug!(
                    "new slab {}: {} x {} bytes, memory type {}",
                    state.next_slab_id,
                    pool.blocks_per_slab,
                    stride,
                    memory_type
                );
                pool.slabs.len() - 1
            }
        };

        let slab = &mut pool.slabs[slab_index];
        let block = slab.free.pop().ok_or(AllocationError::OutOfMemory {
            size: requirements.size,
            memory_type,
        })?;
        state.live_blocks += 1;
        state.block_bytes += stride;

        Ok(Allocation {
            key,
            slab_id: slab.id,
            block,
            memory: slab.memory,
            offset: u64::from(block) * stride,
            size: requirements.size,
            mapped: slab.mapped,
        })
    }

    /// Return a block to its slab. Never blocks on the GPU.
    ///
    /// The caller guarantees no submitted work still references the resource
    /// bound to this allocation.
    pub fn free(&self, allocation: Allocation) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(pool) = state.pools.get_mut(&allocation.key) else {
            tracing::warn!("free of {allocation:?} after its pool was destroyed");
            return;
        };
        let Some(index) = pool.slabs.iter().position(|s| s.id == allocation.slab_id) else {
            tracing::warn!("free of {allocation:?} after its slab was released");
            return;
        };

        pool.slabs[index].free.push(allocation.block);
        state.live_blocks -= 1;
        state.block_bytes -= allocation.key.stride;

        let slab_empty = pool.is_empty_slab(&pool.slabs[index]);
        if slab_empty && pool.empty_slabs() > self.config.retained_empty_slabs {
            let slab = pool.slabs.swap_remove(index);
            // SAFETY: every block of the slab is free, so nothing is bound to it.
            unsafe { self.release_slab(&slab) };
            state.device_frees += 1;
            tracing::debug!("released empty slab {}", slab.id);
        }

        if pool.slabs.is_empty() {
            state.pools.remove(&allocation.key);
        }
    }

    unsafe fn release_slab(&self, slab: &Slab) {
        if slab.mapped.is_some() {
            self.device.unmap_memory(slab.memory);
        }
        self.device.free_memory(slab.memory);
    }

    /// Current usage counters.
    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        let slabs = state.pools.values().map(|p| p.slabs.len()).sum();
        let slab_bytes = state
            .pools
            .iter()
            .map(|(k, p)| k.stride * u64::from(p.blocks_per_slab) * p.slabs.len() as u64)
            .sum();
        MemoryStats {
            pools: state.pools.len(),
            slabs,
            device_allocations: state.device_allocations,
            device_frees: state.device_frees,
            live_blocks: state.live_blocks,
            slab_bytes,
            block_bytes: state.block_bytes,
        }
    }

    /// Log a usage summary.
    pub fn log_info(&self) {
        let stats = self.stats();
        tracing::info!(
            "memory: {} pools, {} slabs ({} KiB), {} live blocks ({} KiB), {} device allocations, {} frees",
            stats.pools,
            stats.slabs,
            stats.slab_bytes / 1024,
            stats.live_blocks,
            stats.block_bytes / 1024,
            stats.device_allocations,
            stats.device_frees
        );
    }

    /// Reject further allocations. Frees are still accepted.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Release every slab back to the device.
    ///
    /// Must run after all buffers and images have been destroyed; remaining
    /// blocks are reported as leaks.
    pub fn destroy(&self) {
        self.shutdown();
        let mut state = self.state.lock();
        let mut leaked = 0;
        let pools = std::mem::take(&mut state.pools);
        for (_, pool) in pools {
            for slab in &pool.slabs {
                leaked += pool.blocks_per_slab as usize - slab.free.len();
                // SAFETY: teardown; the engine has waited for the device to idle.
                unsafe { self.release_slab(slab) };
                state.device_frees += 1;
            }
        }
        if leaked > 0 {
            tracing::warn!("memory manager destroyed with {leaked} live blocks");
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
