//! Frame synchronization.

use crate::device::Device;
use crate::error::{driver, DriverError};
use ash::vk;

/// Wait for a fence to be signaled.
///
/// # Safety
/// The fence must be valid.
pub(crate) unsafe fn wait_for_fence(
    device: &dyn Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<(), DriverError> {
    device
        .wait_for_fence(fence, timeout_ns)
        .map_err(driver("vkWaitForFences"))
}

/// Command buffer and fence of one frame in flight.
pub(crate) struct FrameSlot {
    pub cb: vk::CommandBuffer,
    pub fence: vk::Fence,
    /// Serial of the last frame submitted from this slot.
    pub serial: u64,
    /// Submitted and not yet observed complete.
    pub pending: bool,
}

impl FrameSlot {
    /// # Safety
    /// `pool` must be owned by the caller.
    unsafe fn new(device: &dyn Device, pool: vk::CommandPool) -> Result<Self, DriverError> {
        let cb = device
            .allocate_command_buffer(pool)
            .map_err(driver("vkAllocateCommandBuffers"))?;
        let fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(result) => {
                device.free_command_buffer(pool, cb);
                return Err(driver("vkCreateFence")(result));
            }
        };
        Ok(Self {
            cb,
            fence,
            serial: 0,
            pending: false,
        })
    }

    /// Block until the slot's last submission completes.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&mut self, device: &dyn Device) -> Result<(), DriverError> {
        if self.pending {
            wait_for_fence(device, self.fence, u64::MAX)?;
            self.pending = false;
        }
        Ok(())
    }

    /// Check the fence without blocking.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn poll(&mut self, device: &dyn Device) {
        if self.pending && device.fence_status(self.fence).unwrap_or(false) {
            self.pending = false;
        }
    }

    /// Swap in a fresh signaled fence after a failed submission left the old
    /// one unsignaled.
    ///
    /// # Safety
    /// The old fence must not be pending.
    pub unsafe fn replace_fence(&mut self, device: &dyn Device) -> Result<(), DriverError> {
        let fence = device.create_fence(true).map_err(driver("vkCreateFence"))?;
        device.destroy_fence(self.fence);
        self.fence = fence;
        self.pending = false;
        Ok(())
    }
}

/// Slots for every frame in flight, used round-robin.
#[derive(Default)]
pub(crate) struct FrameSlots {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameSlots {
    /// Create `count` slots from `pool`.
    ///
    /// # Safety
    /// `pool` must be owned by the caller.
    pub unsafe fn new(
        device: &dyn Device,
        pool: vk::CommandPool,
        count: usize,
    ) -> Result<Self, DriverError> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match FrameSlot::new(device, pool) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    Self { slots, current: 0 }.destroy(device, pool);
                    return Err(e);
                }
            }
        }
        Ok(Self { slots, current: 0 })
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    /// Index of the current slot.
    pub fn index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Update completion state of every slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn poll(&mut self, device: &dyn Device) {
        for slot in &mut self.slots {
            slot.poll(device);
        }
    }

    /// Serial of the oldest frame not yet observed complete.
    pub fn oldest_pending(&self) -> Option<u64> {
        self.slots
            .iter()
            .filter(|s| s.pending)
            .map(|s| s.serial)
            .min()
    }

    /// Wait for every slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all(&mut self, device: &dyn Device) -> Result<(), DriverError> {
        for slot in &mut self.slots {
            slot.wait(device)?;
        }
        Ok(())
    }

    /// Destroy every fence and command buffer.
    ///
    /// # Safety
    /// No slot may be pending.
    pub unsafe fn destroy(self, device: &dyn Device, pool: vk::CommandPool) {
        for slot in self.slots {
            device.destroy_fence(slot.fence);
            device.free_command_buffer(pool, slot.cb);
        }
    }
}
