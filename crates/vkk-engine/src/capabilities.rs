//! Physical device capability detection and scoring.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Arm,
    Qualcomm,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            other => Self::Other(other),
        }
    }
}

/// Queue family carrying the engine's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    /// Queues available in the family.
    pub queue_count: u32,
}

/// Detected device capabilities.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub max_memory_allocation_count: u32,
    /// First family supporting graphics and compute, if any.
    pub queue_family: Option<QueueFamily>,
}

impl DeviceCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let families = instance.get_physical_device_queue_family_properties(physical_device);

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            queue_family: find_queue_family(&families),
        }
    }

    /// Vulkan 1.3 and a graphics+compute queue family.
    pub fn meets_requirements(&self) -> bool {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        (major, minor) >= (1, 3) && self.queue_family.is_some()
    }

    /// Selection score; `None` when the device is unusable.
    pub fn score(&self) -> Option<u64> {
        if !self.meets_requirements() {
            return None;
        }
        let mut score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 1,
        };
        // +1 per GB of VRAM
        score += self.device_local_memory_mb / 1024;
        // Separate queues let transfers overlap rendering.
        score += u64::from(self.queue_family.map_or(0, |f| f.queue_count.min(3)));
        Some(score)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// First family supporting both graphics and compute.
fn find_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamily> {
    families
        .iter()
        .enumerate()
        .find(|(_, f)| {
            f.queue_count > 0
                && f.queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|(i, f)| QueueFamily {
            index: i as u32,
            queue_count: f.queue_count,
        })
}
