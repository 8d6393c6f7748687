//! Engine configuration.

/// Memory manager tuning.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Target byte size of one slab (one `vkAllocateMemory` call).
    pub slab_size: u64,
    /// Smallest block handed out; requests are rounded up to a power of two
    /// no smaller than this.
    pub min_block_size: u64,
    /// Upper bound on blocks per slab for small size classes.
    pub max_blocks_per_slab: u32,
    /// Fully free slabs kept per pool before further ones are released.
    pub retained_empty_slabs: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            slab_size: 4 * 1024 * 1024,
            min_block_size: 256,
            max_blocks_per_slab: 256,
            retained_empty_slabs: 1,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frames the renderer keeps in flight; also the copy count of
    /// asynchronous buffers and uniform sets.
    pub frames_in_flight: usize,
    /// Descriptor sets per descriptor pool created by a uniform set factory.
    pub descriptor_pool_sets: u32,
    /// Memory manager tuning.
    pub memory: MemoryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: "VKK".to_string(),
            validation: cfg!(debug_assertions),
            frames_in_flight: 3,
            descriptor_pool_sets: 64,
            memory: MemoryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frames in flight (at least one).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Set the number of descriptor sets per pool.
    pub fn with_descriptor_pool_sets(mut self, sets: u32) -> Self {
        self.descriptor_pool_sets = sets.max(1);
        self
    }

    /// Replace the memory manager tuning.
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }
}
