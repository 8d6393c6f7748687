//! Engine error types.

use ash::vk;
use thiserror::Error;

/// A Vulkan entry point returned something other than `VK_SUCCESS`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{call} failed: {result}")]
pub struct DriverError {
    /// Name of the failing Vulkan call.
    pub call: &'static str,
    /// Result code reported by the driver.
    pub result: vk::Result,
}

impl DriverError {
    /// Log a failing call and wrap its result.
    pub fn log(call: &'static str, result: vk::Result) -> Self {
        tracing::error!("{call} failed: {result}");
        Self { call, result }
    }
}

/// Returns a `map_err` adapter that logs the failing call.
pub(crate) fn driver(call: &'static str) -> impl FnOnce(vk::Result) -> DriverError {
    move |result| DriverError::log(call, result)
}

/// Device memory allocation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// No memory type satisfies the requirement bitmask.
    #[error("No memory type matches bits {type_bits:#x} with {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// The device refused a new slab.
    #[error("Out of device memory allocating {size} bytes from memory type {memory_type}")]
    OutOfMemory { size: u64, memory_type: u32 },

    /// Allocation is not host-visible but host access was requested.
    #[error("Allocation is not host-visible")]
    NotHostVisible,

    /// Host access outside the allocation.
    #[error("Range {offset}+{len} exceeds allocation of {size} bytes")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// Driver failure while binding or mapping.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The memory manager has been shut down.
    #[error("Memory manager is shut down")]
    Shutdown,
}

/// Host/device transfer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer manager has been shut down.
    #[error("Transfer manager is shut down")]
    Shutdown,

    /// Staging buffer allocation failed.
    #[error("Staging buffer allocation failed: {0}")]
    Staging(#[from] AllocationError),

    /// Driver failure while recording, submitting or waiting.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Requested region lies outside the target resource.
    #[error("Transfer range {offset}+{size} exceeds resource of {capacity} bytes")]
    OutOfRange {
        offset: u64,
        size: u64,
        capacity: u64,
    },

    /// Target resource cannot be used for this transfer.
    #[error("Incompatible transfer target: {0}")]
    Incompatible(String),
}

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// Transfer failed.
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Driver(#[from] DriverError),

    /// Invalid parameters passed to a constructor or update.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// The engine has been shut down.
    #[error("Engine is shut down")]
    Shutdown,

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::warn!("invalid argument: {msg}");
        Self::Validation(msg)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, EngineError>;
