//! [`Device`] over `ash`, and the builder that opens a real GPU.

use crate::capabilities::DeviceCapabilities;
use crate::config::EngineConfig;
use crate::device::{Device, MemoryProperties, QueueId};
use crate::engine::Engine;
use crate::error::{driver, EngineError, Result};
use crate::instance::{create_instance, select_physical_device};
use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Vulkan device with one graphics+compute family and up to three queues.
pub struct AshDevice {
    // Entry must be kept alive for the lifetime of the instance
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: DeviceCapabilities,
    memory: MemoryProperties,
    queue_family: u32,
    queues: Vec<Mutex<vk::Queue>>,
}

impl AshDevice {
    /// Load Vulkan, create a headless instance, and open the best device.
    pub fn open(app_name: &str, validation: bool) -> Result<Self> {
        // SAFETY: loading the system Vulkan library.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| EngineError::Loader(e.to_string()))?;

        // SAFETY: the entry was just loaded.
        let instance = unsafe { create_instance(&entry, app_name, validation) }?;

        // SAFETY: the instance is valid; on failure it is destroyed before returning.
        match unsafe { Self::open_device(&instance) } {
            Ok((physical_device, capabilities, device, family, queues)) => {
                // SAFETY: the physical device belongs to the instance.
                let raw =
                    unsafe { instance.get_physical_device_memory_properties(physical_device) };
                let memory =
                    MemoryProperties::from_vk(&raw, capabilities.max_memory_allocation_count);
                tracing::info!(
                    "selected GPU: {} ({} queue{})",
                    capabilities.summary(),
                    queues.len(),
                    if queues.len() == 1 { "" } else { "s" }
                );
                Ok(Self {
                    _entry: entry,
                    instance,
                    physical_device,
                    device,
                    capabilities,
                    memory,
                    queue_family: family,
                    queues: queues.into_iter().map(Mutex::new).collect(),
                })
            }
            Err(e) => {
                // SAFETY: nothing else references the instance.
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    /// # Safety
    /// The instance must be valid.
    #[allow(clippy::type_complexity)]
    unsafe fn open_device(
        instance: &ash::Instance,
    ) -> Result<(
        vk::PhysicalDevice,
        DeviceCapabilities,
        ash::Device,
        u32,
        Vec<vk::Queue>,
    )> {
        let (physical_device, capabilities) = select_physical_device(instance)?;
        let family = capabilities
            .queue_family
            .ok_or(EngineError::NoSuitableDevice)?;
        let queue_count = family.queue_count.min(3);

        let priorities = [1.0_f32, 0.5, 0.5];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family.index)
            .queue_priorities(&priorities[..queue_count as usize])];

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let mut features2 =
            vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features2);

        let device = instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(driver("vkCreateDevice"))?;

        let queues = (0..queue_count)
            .map(|i| device.get_device_queue(family.index, i))
            .collect();

        Ok((physical_device, capabilities, device, family.index, queues))
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// Devices with fewer than three queues alias the later ids onto the last queue.
    fn queue(&self, id: QueueId) -> &Mutex<vk::Queue> {
        &self.queues[id.index().min(self.queues.len() - 1)]
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        // SAFETY: the engine core released every child object before its
        // last reference to this device went away.
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Device for AshDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory
    }

    fn queue_family_index(&self) -> u32 {
        self.queue_family
    }

    unsafe fn allocate_memory(&self, size: u64, memory_type: u32) -> VkResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        self.device.allocate_memory(&info, None)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.device.free_memory(memory, None);
    }

    unsafe fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> VkResult<*mut u8> {
        self.device
            .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
            .map(|ptr| ptr.cast())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.device.unmap_memory(memory);
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        self.device.create_buffer(info, None)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.device.destroy_buffer(buffer, None);
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        self.device.get_buffer_memory_requirements(buffer)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        self.device.bind_buffer_memory(buffer, memory, offset)
    }

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        self.device.create_image(info, None)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.device.destroy_image(image, None);
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        self.device.get_image_memory_requirements(image)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        self.device.bind_image_memory(image, memory, offset)
    }

    unsafe fn create_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
    ) -> VkResult<vk::ImageView> {
        self.device.create_image_view(info, None)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        self.device
            .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.device.get_fence_status(fence)
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        self.device.wait_for_fences(&[fence], true, timeout_ns)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.reset_fences(&[fence])
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None);
    }

    unsafe fn create_command_pool(
        &self,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(self.queue_family);
        self.device.create_command_pool(&info, None)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.device.destroy_command_pool(pool, None);
    }

    unsafe fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.device
            .allocate_command_buffers(&info)?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn free_command_buffer(&self, pool: vk::CommandPool, cb: vk::CommandBuffer) {
        self.device.free_command_buffers(pool, &[cb]);
    }

    unsafe fn begin_command_buffer(
        &self,
        cb: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        self.device
            .begin_command_buffer(cb, &vk::CommandBufferBeginInfo::default().flags(flags))
    }

    unsafe fn end_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        self.device.end_command_buffer(cb)
    }

    unsafe fn reset_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        self.device
            .reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.device.cmd_copy_buffer(cb, src, dst, regions);
    }

    unsafe fn cmd_fill_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        data: u32,
    ) {
        self.device.cmd_fill_buffer(cb, buffer, offset, size, data);
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.device.cmd_pipeline_barrier(
            cb,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            buffer_barriers,
            image_barriers,
        );
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.device
            .cmd_copy_buffer_to_image(cb, src, dst, dst_layout, regions);
    }

    unsafe fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.device
            .cmd_copy_image_to_buffer(cb, src, src_layout, dst, regions);
    }

    unsafe fn cmd_blit_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.device
            .cmd_blit_image(cb, src, src_layout, dst, dst_layout, regions, filter);
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.device.cmd_bind_pipeline(cb, bind_point, pipeline);
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.device
            .cmd_bind_descriptor_sets(cb, bind_point, layout, first_set, sets, &[]);
    }

    unsafe fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.device.cmd_dispatch(cb, x, y, z);
    }

    unsafe fn queue_submit(
        &self,
        queue: QueueId,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);
        let queue = self.queue(queue).lock();
        self.device.queue_submit(*queue, &[submit], fence)
    }

    unsafe fn queue_wait_idle(&self, queue: QueueId) -> VkResult<()> {
        let queue = self.queue(queue).lock();
        self.device.queue_wait_idle(*queue)
    }

    unsafe fn device_wait_idle(&self) -> VkResult<()> {
        // vkDeviceWaitIdle synchronizes every queue.
        let _guards: Vec<_> = self.queues.iter().map(|q| q.lock()).collect();
        self.device.device_wait_idle()
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        self.device.create_descriptor_set_layout(info, None)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.device.destroy_descriptor_set_layout(layout, None);
    }

    unsafe fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        self.device.create_descriptor_pool(info, None)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.device.destroy_descriptor_pool(pool, None);
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        self.device.allocate_descriptor_sets(info)
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        self.device.update_descriptor_sets(writes, &[]);
    }

    unsafe fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout> {
        self.device.create_pipeline_layout(info, None)
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.device.destroy_pipeline_layout(layout, None);
    }

    unsafe fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        self.device
            .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.device.destroy_shader_module(module, None);
    }

    unsafe fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        self.device.create_sampler(info, None)
    }

    unsafe fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.device.destroy_sampler(sampler, None);
    }

    unsafe fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        let pipelines = self
            .device
            .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
            .map_err(|(_, e)| e)?;
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        let pipelines = self
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
            .map_err(|(_, e)| e)?;
        pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.device.destroy_pipeline(pipeline, None);
    }
}

/// Builder for an [`Engine`] on the system's best GPU.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.validation = enable;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the device and create the engine.
    pub fn build(self) -> Result<Engine> {
        let device = AshDevice::open(&self.config.app_name, self.config.validation)?;
        Engine::new(Arc::new(device), self.config)
    }
}
