//! Synchronous compute submissions on the background-most queue.

use crate::buffer::Buffer;
use crate::command;
use crate::deferred::Object;
use crate::device::{Device, QueueId};
use crate::engine::{Core, Engine};
use crate::error::{driver, EngineError, Result};
use crate::pipeline::ComputePipeline;
use crate::sync;
use crate::uniform::UniformSet;
use ash::vk;

/// Command buffer and fence of a released [`Compute`].
pub struct ComputeResources {
    cb: vk::CommandBuffer,
    fence: vk::Fence,
}

impl ComputeResources {
    /// # Safety
    /// The command buffer must not be pending.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        {
            let cmd = core.locks.cmd_lock();
            core.device.free_command_buffer(cmd.pool(), self.cb);
        }
        core.device.destroy_fence(self.fence);
    }
}

/// Records compute work for one [`Compute::submit`].
pub struct ComputeRecorder<'a> {
    device: &'a dyn Device,
    cb: vk::CommandBuffer,
    layout: Option<vk::PipelineLayout>,
}

impl ComputeRecorder<'_> {
    pub fn bind_pipeline(&mut self, pipeline: &ComputePipeline) {
        // SAFETY: the command buffer is recording.
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cb, vk::PipelineBindPoint::COMPUTE, pipeline.handle())
        };
        self.layout = Some(pipeline.layout());
    }

    /// Bind each set at its own set index against the bound pipeline's layout.
    pub fn bind_uniform_sets(&mut self, sets: &[&UniformSet]) -> Result<()> {
        let layout = self
            .layout
            .ok_or_else(|| EngineError::validation("uniform sets bound before a pipeline"))?;
        for set in sets {
            // SAFETY: the command buffer is recording.
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    self.cb,
                    vk::PipelineBindPoint::COMPUTE,
                    layout,
                    set.set_index(),
                    &[set.handle()],
                )
            };
        }
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        if self.layout.is_none() {
            return Err(EngineError::validation("dispatch without a pipeline"));
        }
        // SAFETY: the command buffer is recording.
        unsafe { self.device.cmd_dispatch(self.cb, x, y, z) };
        Ok(())
    }

    /// Make shader writes to `buffer` visible to later dispatches.
    pub fn buffer_barrier(&mut self, buffer: &Buffer) {
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE);
        // SAFETY: the command buffer is recording.
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cb,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &[barrier],
                &[],
            )
        };
    }
}

/// Runs compute work to completion on [`QueueId::Other`].
pub struct Compute {
    engine: Engine,
    cb: vk::CommandBuffer,
    fence: vk::Fence,
}

impl Compute {
    pub fn new(engine: &Engine) -> Result<Self> {
        engine.check_live()?;
        let device = engine.device();
        let cb = {
            let cmd = engine.cmd_lock();
            // SAFETY: the shared pool is guarded by the cmd lock.
            unsafe { device.allocate_command_buffer(cmd.pool()) }
                .map_err(driver("vkAllocateCommandBuffers"))?
        };
        // SAFETY: plain fence creation.
        let fence = match unsafe { device.create_fence(false) } {
            Ok(fence) => fence,
            Err(result) => {
                let cmd = engine.cmd_lock();
                // SAFETY: the buffer was never recorded.
                unsafe { device.free_command_buffer(cmd.pool(), cb) };
                return Err(driver("vkCreateFence")(result).into());
            }
        };
        Ok(Self {
            engine: engine.clone(),
            cb,
            fence,
        })
    }

    /// Record with `record`, submit, and block until the work completes.
    pub fn submit<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&mut ComputeRecorder<'_>) -> Result<()>,
    {
        self.engine.check_live()?;
        let device = self.engine.device().as_ref();

        {
            let _cmd = self.engine.cmd_lock();
            let mut recorder = ComputeRecorder {
                device,
                cb: self.cb,
                layout: None,
            };
            let mut recorded = Ok(());
            // SAFETY: the buffer is idle after the last wait; the pool is locked.
            unsafe {
                command::record_one_time(device, self.cb, |_| recorded = record(&mut recorder))
            }?;
            recorded?;
        }

        {
            let renderer = self.engine.renderer_lock();
            // SAFETY: the fence has no pending submission.
            unsafe { device.reset_fence(self.fence) }.map_err(driver("vkResetFences"))?;
            self.engine.queue_submit_locked(
                &renderer,
                QueueId::Other,
                &[self.cb],
                &[],
                &[],
                &[],
                self.fence,
            )?;
        }

        // SAFETY: the fence belongs to the submission above.
        unsafe { sync::wait_for_fence(device, self.fence, u64::MAX) }?;
        tracing::trace!("compute submission complete");
        Ok(())
    }
}

impl Drop for Compute {
    fn drop(&mut self) {
        self.engine.delete_object(Object::Compute(ComputeResources {
            cb: self.cb,
            fence: self.fence,
        }));
    }
}

impl std::fmt::Debug for Compute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compute").field("cb", &self.cb).finish()
    }
}
