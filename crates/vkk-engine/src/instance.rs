//! Headless Vulkan instance creation and device selection.

use crate::capabilities::DeviceCapabilities;
use crate::error::{driver, EngineError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Validation layers requested when validation is enabled.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance extensions. No surface extensions: the engine core is headless.
fn instance_extensions() -> Vec<&'static CStr> {
    vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Create a Vulkan 1.3 instance.
///
/// Requested validation layers the loader does not provide are skipped with
/// a warning.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| EngineError::validation("application name contains a NUL byte"))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"VKK")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const c_char> =
        instance_extensions().iter().map(|ext| ext.as_ptr()).collect();

    let mut layers = Vec::new();
    if enable_validation {
        let available = entry
            .enumerate_instance_layer_properties()
            .map_err(driver("vkEnumerateInstanceLayerProperties"))?;
        for layer in validation_layers() {
            let found = available
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == layer);
            if found {
                layers.push(layer.as_ptr());
            } else {
                tracing::warn!("validation layer {} not available", layer.to_string_lossy());
            }
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layers)
        .flags(create_flags);

    Ok(entry
        .create_instance(&create_info, None)
        .map_err(driver("vkCreateInstance"))?)
}

/// Select the highest scoring physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, DeviceCapabilities)> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(driver("vkEnumeratePhysicalDevices"))?;

    let mut best: Option<(u64, vk::PhysicalDevice, DeviceCapabilities)> = None;
    for device in devices {
        let caps = DeviceCapabilities::query(instance, device);
        match caps.score() {
            Some(score) if best.as_ref().map_or(true, |(s, _, _)| score > *s) => {
                best = Some((score, device, caps));
            }
            Some(_) => {}
            None => tracing::debug!("skipping unsuitable device {}", caps.summary()),
        }
    }

    best.map(|(_, device, caps)| (device, caps))
        .ok_or(EngineError::NoSuitableDevice)
}
