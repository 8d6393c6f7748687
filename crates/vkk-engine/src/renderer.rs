//! Frame timeline.
//!
//! A renderer records one frame at a time into the command buffer of the
//! current frame slot and submits it to the foreground queue. Every frame
//! gets an engine-wide serial. Objects used by a frame are stamped with its
//! serial through [`Tracked::mark_used`]; the destructor worker holds a
//! dropped object until that serial has retired.

use crate::command;
use crate::deferred::Object;
use crate::device::QueueId;
use crate::engine::{Core, Engine};
use crate::error::{driver, DriverError, EngineError, Result};
use crate::sync::FrameSlots;
use ash::vk;

/// Objects whose destruction waits for the frames that used them.
pub trait Tracked {
    /// Record use by the frame with serial `ts`.
    fn mark_used(&self, ts: u64);
}

/// Outcome of [`Renderer::end_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Submitted,
    /// Submission failed; the frame's commands were dropped.
    Skipped,
}

/// Semaphores of a frame submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSync<'a> {
    pub wait: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal: &'a [vk::Semaphore],
}

/// Command pool and frame slots of a released renderer.
pub struct RendererResources {
    pool: vk::CommandPool,
    slots: FrameSlots,
}

impl RendererResources {
    /// # Safety
    /// No slot may be pending.
    pub(crate) unsafe fn destroy(self, core: &Core) {
        self.slots.destroy(core.device.as_ref(), self.pool);
        core.device.destroy_command_pool(self.pool);
    }
}

/// Counters of a renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub submitted: u64,
    pub skipped: u64,
}

/// Records and submits frames.
pub struct Renderer {
    engine: Engine,
    id: u64,
    pool: vk::CommandPool,
    slots: FrameSlots,
    recording: Option<u64>,
    stats: RendererStats,
}

impl Renderer {
    /// Create a renderer with one slot per frame in flight.
    pub fn new(engine: &Engine) -> Result<Self> {
        engine.check_live()?;
        let device = engine.device();

        // SAFETY: the pool is owned by this renderer.
        let pool = unsafe {
            device.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        }
        .map_err(driver("vkCreateCommandPool"))?;

        // SAFETY: `pool` is ours.
        let slots =
            match unsafe { FrameSlots::new(device.as_ref(), pool, engine.frames_in_flight()) } {
                Ok(slots) => slots,
                Err(e) => {
                    // SAFETY: nothing was allocated from the pool.
                    unsafe { device.destroy_command_pool(pool) };
                    return Err(e.into());
                }
            };

        Ok(Self {
            engine: engine.clone(),
            id: engine.locks().renderer_register(),
            pool,
            slots,
            recording: None,
            stats: RendererStats::default(),
        })
    }

    /// Wait for the current slot, then start recording a frame into it.
    pub fn begin_frame(&mut self) -> Result<vk::CommandBuffer> {
        self.engine.check_live()?;
        if self.recording.is_some() {
            return Err(EngineError::validation("a frame is already being recorded"));
        }
        let device = self.engine.device().clone();

        // SAFETY: the slot belongs to this renderer.
        unsafe { self.slots.current_mut().wait(device.as_ref())? };
        self.poll();

        let serial = self
            .engine
            .locks()
            .renderer_begin(self.id, self.slots.oldest_pending());
        let cb = self.slots.current().cb;

        // SAFETY: the slot's fence has signaled, so `cb` is not pending, and
        // the pool is only used from `&mut self`.
        if let Err(e) = unsafe {
            command::begin_command_buffer(
                device.as_ref(),
                cb,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
        } {
            self.publish();
            return Err(e.into());
        }

        self.recording = Some(serial);
        self.engine.set_frame_slot(self.slots.index());
        Ok(cb)
    }

    /// Finish and submit the frame being recorded.
    ///
    /// A failed submission is logged and reported as
    /// [`FrameStatus::Skipped`]; the renderer stays usable.
    pub fn end_frame(&mut self, sync: FrameSync<'_>) -> Result<FrameStatus> {
        let Some(serial) = self.recording.take() else {
            return Err(EngineError::validation("no frame is being recorded"));
        };
        let device = self.engine.device().clone();

        let status = match self.submit(sync) {
            Ok(()) => {
                let slot = self.slots.current_mut();
                slot.serial = serial;
                slot.pending = true;
                self.stats.submitted += 1;
                FrameStatus::Submitted
            }
            Err(e) => {
                tracing::error!("frame {serial} skipped: {e}");
                self.stats.skipped += 1;
                // SAFETY: the submission failed, so the fence is not pending.
                let replaced = unsafe { self.slots.current_mut().replace_fence(device.as_ref()) };
                if let Err(e) = replaced {
                    // The serial is spent either way; keep retirement moving.
                    self.slots.advance();
                    self.publish();
                    return Err(e.into());
                }
                FrameStatus::Skipped
            }
        };

        self.slots.advance();
        self.publish();
        Ok(status)
    }

    fn submit(&self, sync: FrameSync<'_>) -> std::result::Result<(), DriverError> {
        let device = self.engine.device();
        let slot = self.slots.current();
        // SAFETY: `slot.cb` is recording.
        unsafe { command::end_command_buffer(device.as_ref(), slot.cb)? };

        let renderer = self.engine.renderer_lock();
        // SAFETY: the fence is not pending; queue access is serialized by
        // the renderer lock.
        unsafe { device.reset_fence(slot.fence) }.map_err(driver("vkResetFences"))?;
        self.engine.core().queue_submit_locked(
            &renderer,
            QueueId::Foreground,
            &[slot.cb],
            sync.wait,
            sync.wait_stages,
            sync.signal,
            slot.fence,
        )
    }

    /// Observe completed frames and publish their retirement.
    pub fn poll(&mut self) {
        // SAFETY: fence status queries only.
        unsafe { self.slots.poll(self.engine.device().as_ref()) };
        self.publish();
    }

    /// Wait for every submitted frame.
    pub fn wait_idle(&mut self) -> Result<()> {
        // SAFETY: the slots belong to this renderer.
        unsafe { self.slots.wait_all(self.engine.device().as_ref())? };
        self.publish();
        Ok(())
    }

    fn oldest_needed(&self) -> Option<u64> {
        match (self.slots.oldest_pending(), self.recording) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn publish(&self) {
        self.engine
            .locks()
            .renderer_retire(self.id, self.oldest_needed());
    }

    /// Stamp `object` with the frame being recorded, or with the next frame
    /// when none is.
    pub fn mark_used(&self, object: &dyn Tracked) {
        let serial = self
            .recording
            .unwrap_or_else(|| self.engine.renderer_lock().next_serial());
        object.mark_used(serial);
    }

    /// Serial of the frame being recorded.
    pub fn current_serial(&self) -> Option<u64> {
        self.recording
    }

    /// Command buffer of the frame being recorded.
    pub fn command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.recording.map(|_| self.slots.current().cb)
    }

    pub fn stats(&self) -> RendererStats {
        self.stats
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.recording = None;
        // SAFETY: the slots belong to this renderer.
        if let Err(e) = unsafe { self.slots.wait_all(self.engine.device().as_ref()) } {
            tracing::error!("renderer teardown with frames in unknown state: {e}");
        }
        self.engine.locks().renderer_retire(self.id, None);

        let resources = RendererResources {
            pool: self.pool,
            slots: std::mem::take(&mut self.slots),
        };
        self.engine.delete_object(Object::Renderer(resources));
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("id", &self.id)
            .field("recording", &self.recording)
            .field("stats", &self.stats)
            .finish()
    }
}
