//! The engine: device, memory and transfer managers, locks, caches and the
//! destructor queue.

use crate::config::EngineConfig;
use crate::deferred::{DestructQueue, Object};
use crate::device::{Device, QueueId};
use crate::error::{driver, DriverError, EngineError, Result};
use crate::locks::{CmdGuard, EngineLocks, RendererGuard, UsfGuard, UtilityGuard};
use crate::memory::MemoryManager;
use crate::transfer::TransferManager;
use crate::utility::SamplerInfo;
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// State shared by the engine handle, its objects and the destructor worker.
pub(crate) struct Core {
    pub(crate) device: Arc<dyn Device>,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) transfer: TransferManager,
    pub(crate) locks: Arc<EngineLocks>,
    pub(crate) config: EngineConfig,
    frame_slot: AtomicUsize,
}

impl Core {
    pub(crate) fn frame_slot(&self) -> usize {
        self.frame_slot.load(Ordering::Acquire)
    }

    pub(crate) fn queue_submit_locked(
        &self,
        _renderer: &RendererGuard<'_>,
        queue: QueueId,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> std::result::Result<(), DriverError> {
        // SAFETY: the renderer guard serializes queue access.
        unsafe {
            self.device.queue_submit(
                queue,
                command_buffers,
                wait_semaphores,
                wait_stages,
                signal_semaphores,
                fence,
            )
        }
        .map_err(driver("vkQueueSubmit"))
    }

    pub(crate) fn new_descriptor_pool_locked(
        &self,
        _usf: &UsfGuard<'_>,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> std::result::Result<vk::DescriptorPool, DriverError> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::empty())
            .max_sets(max_sets)
            .pool_sizes(sizes);
        // SAFETY: descriptor pool creation is serialized by the usf lock.
        unsafe { self.device.create_descriptor_pool(&info) }
            .map_err(driver("vkCreateDescriptorPool"))
    }

    /// Raw result so callers can react to `ERROR_OUT_OF_POOL_MEMORY`.
    pub(crate) fn allocate_descriptor_sets_locked(
        &self,
        _usf: &UsfGuard<'_>,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> ash::prelude::VkResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: the pool is externally synchronized by the usf lock.
        unsafe { self.device.allocate_descriptor_sets(&info) }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.transfer.destroy();
        // SAFETY: the last object is gone and the device is idle.
        unsafe {
            let device = &*self.device;
            self.locks.utility_lock().destroy(device);
            self.locks.usf_lock().destroy_all(device);
            device.destroy_command_pool(self.locks.cmd_lock().pool());
        }
        self.memory.destroy();
    }
}

struct EngineInner {
    core: Arc<Core>,
    destruct: Mutex<Option<DestructQueue>>,
    shutdown: AtomicBool,
}

impl EngineInner {
    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let core = &self.core;
        tracing::info!("engine shutting down");

        core.transfer.shutdown();
        core.memory.shutdown();
        {
            let _renderer = core.locks.renderer_lock();
            // SAFETY: queue access is serialized by the renderer lock.
            if let Err(result) = unsafe { core.device.device_wait_idle() } {
                DriverError::log("vkDeviceWaitIdle", result);
            }
        }
        core.locks.renderer_shutdown();

        let queue = self.destruct.lock().take();
        if let Some(mut queue) = queue {
            queue.shutdown();
        }
        core.transfer.destroy();
        core.memory.log_info();
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the engine. Cheap to clone; every engine object holds one.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine on `device`.
    ///
    /// Creates the shared command pool and starts the destructor worker.
    /// Zero counts in `config` are raised to one.
    pub fn new(device: Arc<dyn Device>, mut config: EngineConfig) -> Result<Self> {
        config.frames_in_flight = config.frames_in_flight.max(1);
        config.descriptor_pool_sets = config.descriptor_pool_sets.max(1);

        // SAFETY: the device is valid.
        let pool = unsafe {
            device.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        }
        .map_err(driver("vkCreateCommandPool"))?;

        let memory = Arc::new(MemoryManager::new(device.clone(), config.memory.clone()));
        let locks = Arc::new(EngineLocks::new(pool));
        let transfer = TransferManager::new(device.clone(), memory.clone(), locks.clone());
        let core = Arc::new(Core {
            device,
            memory,
            transfer,
            locks,
            config,
            frame_slot: AtomicUsize::new(0),
        });

        // On failure `core` drops here and releases the pool.
        let destruct = DestructQueue::spawn(core.clone())
            .map_err(|e| EngineError::Other(format!("failed to spawn destructor worker: {e}")))?;

        tracing::info!(
            "engine '{}' created ({} frames in flight, {} memory types{})",
            core.config.app_name,
            core.config.frames_in_flight,
            core.device.memory_properties().memory_types.len(),
            if core.device.memory_properties().unified {
                ", unified memory"
            } else {
                ""
            }
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                core,
                destruct: Mutex::new(Some(destruct)),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    /// The device seam.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.core().device
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.core().config
    }

    /// Device memory pools.
    pub fn memory(&self) -> &MemoryManager {
        &self.core().memory
    }

    /// Staging transfers.
    pub fn transfer(&self) -> &TransferManager {
        &self.core().transfer
    }

    /// The lock set.
    pub fn locks(&self) -> &EngineLocks {
        &self.core().locks
    }

    /// Lock the shared command pool.
    pub fn cmd_lock(&self) -> CmdGuard<'_> {
        self.locks().cmd_lock()
    }

    /// Lock uniform set factory state.
    pub fn usf_lock(&self) -> UsfGuard<'_> {
        self.locks().usf_lock()
    }

    /// Lock the shader module and sampler caches.
    pub fn utility_lock(&self) -> UtilityGuard<'_> {
        self.locks().utility_lock()
    }

    /// Lock queue access and renderer state.
    pub fn renderer_lock(&self) -> RendererGuard<'_> {
        self.locks().renderer_lock()
    }

    /// Wake threads blocked in [`Engine::renderer_wait`].
    pub fn renderer_signal(&self) {
        self.locks().renderer_signal();
    }

    /// Release the renderer lock until signaled.
    pub fn renderer_wait(&self, guard: &mut RendererGuard<'_>) {
        self.locks().renderer_wait(guard);
    }

    /// Block until frame serial `ts` has retired.
    pub fn renderer_wait_for_timestamp(&self, ts: u64) {
        self.locks().renderer_wait_for_timestamp(ts);
    }

    /// Publish that every frame up to `ts` has retired.
    pub fn renderer_expire(&self, ts: u64) {
        self.locks().renderer_expire(ts);
    }

    /// Hand an object over for destruction.
    ///
    /// The only path by which engine objects release Vulkan handles. Before
    /// shutdown the object is queued for the destructor worker; afterwards it
    /// is destroyed on the calling thread.
    pub fn delete_object(&self, object: Object) {
        let destruct = self.inner.destruct.lock();
        let object = match destruct.as_ref() {
            Some(queue) => match queue.push(object) {
                Ok(()) => return,
                Err(object) => object,
            },
            None => object,
        };
        drop(destruct);

        // SAFETY: the device is idle once the destructor queue is gone.
        unsafe { object.destroy(self.core()) };
    }

    /// Block until every queued object has been destroyed.
    ///
    /// Objects waiting on a frame that never retires keep this blocked.
    pub fn wait_deletions(&self) {
        let pending = self.inner.destruct.lock().as_ref().map(DestructQueue::pending);
        if let Some(pending) = pending {
            pending.wait_idle();
        }
    }

    /// Find a memory type allowed by `type_bits` with all of `flags`.
    pub fn memory_type_index(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Result<u32> {
        Ok(self.memory().memory_type_index(type_bits, flags)?)
    }

    /// Submit to `queue`. Requires the renderer lock.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_submit_locked(
        &self,
        renderer: &RendererGuard<'_>,
        queue: QueueId,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        Ok(self.core().queue_submit_locked(
            renderer,
            queue,
            command_buffers,
            wait_semaphores,
            wait_stages,
            signal_semaphores,
            fence,
        )?)
    }

    /// Wait for `queue` to drain. Requires the renderer lock.
    pub fn queue_wait_idle_locked(
        &self,
        _renderer: &RendererGuard<'_>,
        queue: QueueId,
    ) -> Result<()> {
        // SAFETY: the renderer guard serializes queue access.
        unsafe { self.device().queue_wait_idle(queue) }.map_err(driver("vkQueueWaitIdle"))?;
        Ok(())
    }

    /// Wait for the whole device to drain.
    pub fn device_wait_idle(&self) -> Result<()> {
        let _renderer = self.renderer_lock();
        // SAFETY: the renderer lock serializes queue access.
        unsafe { self.device().device_wait_idle() }.map_err(driver("vkDeviceWaitIdle"))?;
        Ok(())
    }

    /// Create a descriptor pool. Requires the usf lock.
    pub fn new_descriptor_pool_locked(
        &self,
        usf: &UsfGuard<'_>,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        Ok(self.core().new_descriptor_pool_locked(usf, sizes, max_sets)?)
    }

    /// Allocate `count` sets of `layout` from `pool`. Requires the usf lock.
    pub fn allocate_descriptor_sets_locked(
        &self,
        usf: &UsfGuard<'_>,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        self.core()
            .allocate_descriptor_sets_locked(usf, pool, layout, count)
            .map_err(|result| DriverError::log("vkAllocateDescriptorSets", result).into())
    }

    /// Cached shader module for `name`, loaded with `load` on first use.
    pub fn shader_module(
        &self,
        name: &str,
        load: impl FnOnce() -> Result<Vec<u32>>,
    ) -> Result<vk::ShaderModule> {
        self.utility_lock()
            .shader_module(self.device().as_ref(), name, load)
    }

    /// Cached sampler for `info`.
    pub fn sampler(&self, info: SamplerInfo) -> Result<vk::Sampler> {
        self.utility_lock().sampler(self.device().as_ref(), info)
    }

    /// Frames in flight, and so copies of asynchronous buffers and sets.
    pub fn frames_in_flight(&self) -> usize {
        self.config().frames_in_flight
    }

    /// Frame slot currently being recorded.
    pub fn frame_slot(&self) -> usize {
        self.core().frame_slot()
    }

    pub(crate) fn set_frame_slot(&self, slot: usize) {
        self.core().frame_slot.store(slot, Ordering::Release);
    }

    /// Reject new objects, wait for the device, and destroy queued objects.
    ///
    /// Objects still alive afterwards are destroyed inline when dropped.
    /// Final teardown happens when the last engine handle drops.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Whether [`Engine::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Log memory and transfer statistics.
    pub fn log_info(&self) {
        self.memory().log_info();
        let stats = self.transfer().stats();
        tracing::info!(
            "transfer: {} instances ({} in flight), {} staging buffers ({} KiB pooled, {} created), {} submissions",
            stats.instances,
            stats.in_flight,
            stats.staging_buffers,
            stats.staging_bytes / 1024,
            stats.staging_created,
            stats.submissions
        );
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("app_name", &self.config().app_name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
