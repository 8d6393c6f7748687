//! The device seam between the engine core and a Vulkan implementation.
//!
//! Everything above this module talks to the GPU through [`Device`]. The
//! production implementation is [`crate::backend::AshDevice`]; tests run the
//! same code against an emulated device.

use ash::prelude::VkResult;
use ash::vk;

/// Logical queues exposed by the engine.
///
/// All three come from the same queue family so resources never need
/// ownership transfers. Devices with fewer queues alias them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Default renderer presentation work.
    Foreground,
    /// Transfer manager uploads and readbacks.
    Background,
    /// Compute dispatches and offscreen renderers.
    Other,
}

impl QueueId {
    /// Queue index within the engine's queue family.
    pub fn index(self) -> usize {
        match self {
            Self::Foreground => 0,
            Self::Background => 1,
            Self::Other => 2,
        }
    }
}

/// Memory topology of the physical device.
#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    /// Property flags per memory type index.
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Device-local memory is also host-visible (integrated and mobile GPUs).
    pub unified: bool,
    /// `maxMemoryAllocationCount` limit.
    pub max_allocation_count: u32,
}

impl MemoryProperties {
    /// Build from the Vulkan memory property query.
    pub fn from_vk(props: &vk::PhysicalDeviceMemoryProperties, max_allocation_count: u32) -> Self {
        let memory_types: Vec<_> = props
            .memory_types
            .iter()
            .take(props.memory_type_count as usize)
            .map(|t| t.property_flags)
            .collect();

        let unified = memory_types
            .iter()
            .filter(|f| f.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .all(|f| f.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

        Self {
            memory_types,
            unified,
            max_allocation_count,
        }
    }

    /// First memory type allowed by `type_bits` whose flags contain `flags`.
    pub fn find_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(i, f)| type_bits & (1 << i) != 0 && f.contains(flags))
            .map(|(i, _)| i as u32)
    }

    /// Whether a memory type can be mapped.
    pub fn is_host_visible(&self, memory_type: u32) -> bool {
        self.memory_types
            .get(memory_type as usize)
            .is_some_and(|f| f.contains(vk::MemoryPropertyFlags::HOST_VISIBLE))
    }
}

/// Vulkan entry points used by the engine core.
///
/// Method names and parameters follow `ash::Device`. Implementations do not
/// synchronize: callers hold the engine lock that covers each externally
/// synchronized parameter.
#[allow(clippy::missing_safety_doc)]
pub trait Device: Send + Sync {
    /// Memory topology of the physical device.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Queue family all engine queues belong to.
    fn queue_family_index(&self) -> u32;

    // Memory

    unsafe fn allocate_memory(&self, size: u64, memory_type: u32) -> VkResult<vk::DeviceMemory>;
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map the whole allocation persistently.
    unsafe fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<*mut u8>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    // Buffers and images

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
    unsafe fn destroy_image(&self, image: vk::Image);
    unsafe fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;
    unsafe fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>)
        -> VkResult<vk::ImageView>;
    unsafe fn destroy_image_view(&self, view: vk::ImageView);

    // Synchronization

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    /// `Ok(true)` once signaled, `Ok(false)` while pending.
    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    /// Returns `Err(vk::Result::TIMEOUT)` when the timeout elapses.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command pools and recording

    unsafe fn create_command_pool(
        &self,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn allocate_command_buffer(&self, pool: vk::CommandPool)
        -> VkResult<vk::CommandBuffer>;
    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, cb: vk::CommandBuffer);
    unsafe fn begin_command_buffer(
        &self,
        cb: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    unsafe fn end_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()>;
    unsafe fn reset_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()>;

    unsafe fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    unsafe fn cmd_fill_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    );
    unsafe fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    unsafe fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    #[allow(clippy::too_many_arguments)]
    unsafe fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    unsafe fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    unsafe fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    unsafe fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32);

    // Queues

    #[allow(clippy::too_many_arguments)]
    unsafe fn queue_submit(
        &self,
        queue: QueueId,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<()>;
    unsafe fn queue_wait_idle(&self, queue: QueueId) -> VkResult<()>;
    unsafe fn device_wait_idle(&self) -> VkResult<()>;

    // Descriptors

    unsafe fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout>;
    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    unsafe fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool>;
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    unsafe fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // Pipelines and shaders

    unsafe fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout>;
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    unsafe fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule);
    unsafe fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler>;
    unsafe fn destroy_sampler(&self, sampler: vk::Sampler);
    unsafe fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline>;
    unsafe fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline>;
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete() -> MemoryProperties {
        MemoryProperties {
            memory_types: vec![
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ],
            unified: false,
            max_allocation_count: 4096,
        }
    }

    #[test]
    fn find_type_respects_type_bits() {
        let props = discrete();
        assert_eq!(
            props.find_type(0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(
            props.find_type(0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
        assert_eq!(
            props.find_type(0b11, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
    }

    #[test]
    fn unified_detection() {
        let mut raw = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        raw.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT;
        raw.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        assert!(MemoryProperties::from_vk(&raw, 4096).unified);

        raw.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert!(!MemoryProperties::from_vk(&raw, 4096).unified);
    }
}
