//! Command buffer recording helpers.

use crate::device::Device;
use crate::error::{driver, DriverError};
use ash::vk;

/// Reset a command buffer and begin recording.
///
/// # Safety
/// `cmd` must not be pending, and its pool must be externally synchronized.
pub(crate) unsafe fn begin_command_buffer(
    device: &dyn Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<(), DriverError> {
    device
        .reset_command_buffer(cmd)
        .map_err(driver("vkResetCommandBuffer"))?;
    device
        .begin_command_buffer(cmd, flags)
        .map_err(driver("vkBeginCommandBuffer"))
}

/// End recording a command buffer.
///
/// # Safety
/// `cmd` must be recording.
pub(crate) unsafe fn end_command_buffer(
    device: &dyn Device,
    cmd: vk::CommandBuffer,
) -> Result<(), DriverError> {
    device
        .end_command_buffer(cmd)
        .map_err(driver("vkEndCommandBuffer"))
}

/// Record a one-time-submit command buffer with `f`.
///
/// # Safety
/// Same as [`begin_command_buffer`].
pub(crate) unsafe fn record_one_time<F>(
    device: &dyn Device,
    cmd: vk::CommandBuffer,
    f: F,
) -> Result<(), DriverError>
where
    F: FnOnce(vk::CommandBuffer),
{
    begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    f(cmd);
    end_command_buffer(device, cmd)
}
