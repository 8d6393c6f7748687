//! VKK engine core: Vulkan memory, transfers and object lifetimes.
//!
//! This crate provides:
//! - A slab-pooling memory manager over `vkAllocateMemory`
//! - A transfer manager for staged uploads and readbacks
//! - The engine's five locks (four mutexes plus the renderer condvar)
//! - A deferred destructor worker
//! - Buffers, images, uniform sets, pipelines, renderers and compute
//! - An `ash` backend behind the [`Device`] trait

pub mod backend;
pub mod buffer;
pub mod capabilities;
mod command;
pub mod compute;
pub mod config;
pub mod deferred;
pub mod device;
pub mod engine;
pub mod error;
pub mod image;
pub mod instance;
pub mod locks;
pub mod memory;
pub mod pipeline;
pub mod renderer;
mod sync;
pub mod transfer;
pub mod uniform;
pub mod utility;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{AshDevice, EngineBuilder};
pub use buffer::{Buffer, BufferUsage, UpdateMode};
pub use capabilities::{DeviceCapabilities, GpuVendor};
pub use compute::{Compute, ComputeRecorder};
pub use config::{EngineConfig, MemoryConfig};
pub use deferred::{Object, ObjectKind};
pub use device::{Device, MemoryProperties, QueueId};
pub use engine::Engine;
pub use error::{AllocationError, DriverError, EngineError, Result, TransferError};
pub use image::{Image, ImageFormat, ImageInfo, ImageUsage};
pub use locks::{CmdGuard, EngineLocks, RendererGuard, UsfGuard, UtilityGuard};
pub use memory::{Allocation, MemoryManager, MemoryStats};
pub use pipeline::{
    ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig, PipelineLayout,
};
pub use renderer::{FrameStatus, FrameSync, Renderer, RendererStats, Tracked};
pub use transfer::{TransferManager, TransferStats, XferMode};
pub use uniform::{UniformAttachment, UniformBinding, UniformSet, UniformSetFactory, UniformType};
pub use utility::{MipmapMode, SamplerFilter, SamplerInfo};
