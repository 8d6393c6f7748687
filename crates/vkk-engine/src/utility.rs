//! Shader module and sampler caches (the `utility` lock state).

use crate::device::Device;
use crate::error::{driver, Result};
use ash::vk;
use hashbrown::HashMap;

/// Texture filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

impl SamplerFilter {
    fn vk(self) -> vk::Filter {
        match self {
            Self::Nearest => vk::Filter::NEAREST,
            Self::Linear => vk::Filter::LINEAR,
        }
    }
}

/// Mipmap sampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipmapMode {
    /// Sample only the base level.
    #[default]
    None,
    Nearest,
    Linear,
}

/// Key of the sampler cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerInfo {
    pub min_filter: SamplerFilter,
    pub mag_filter: SamplerFilter,
    pub mipmap_mode: MipmapMode,
}

impl SamplerInfo {
    fn create_info(&self) -> vk::SamplerCreateInfo<'static> {
        let (mipmap_mode, max_lod) = match self.mipmap_mode {
            MipmapMode::None => (vk::SamplerMipmapMode::NEAREST, 0.0),
            MipmapMode::Nearest => (vk::SamplerMipmapMode::NEAREST, vk::LOD_CLAMP_NONE),
            MipmapMode::Linear => (vk::SamplerMipmapMode::LINEAR, vk::LOD_CLAMP_NONE),
        };

        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter.vk())
            .min_filter(self.min_filter.vk())
            .mipmap_mode(mipmap_mode)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .min_lod(0.0)
            .max_lod(max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
    }
}

/// Lazily populated caches, keyed by shader name and sampler parameters.
#[derive(Debug, Default)]
pub struct UtilityCaches {
    shader_modules: HashMap<String, vk::ShaderModule>,
    samplers: HashMap<SamplerInfo, vk::Sampler>,
}

impl UtilityCaches {
    /// Look up a shader module by name, creating it from `load` on a miss.
    pub(crate) fn shader_module(
        &mut self,
        device: &dyn Device,
        name: &str,
        load: impl FnOnce() -> Result<Vec<u32>>,
    ) -> Result<vk::ShaderModule> {
        if let Some(&module) = self.shader_modules.get(name) {
            return Ok(module);
        }

        let code = load()?;
        // SAFETY: the device is valid; SPIR-V validity is the loader's contract.
        let module =
            unsafe { device.create_shader_module(&code) }.map_err(driver("vkCreateShaderModule"))?;
        tracing::debug!("cached shader module {name}");
        self.shader_modules.insert(name.to_string(), module);
        Ok(module)
    }

    /// Look up a sampler, creating it on a miss.
    pub(crate) fn sampler(
        &mut self,
        device: &dyn Device,
        info: SamplerInfo,
    ) -> Result<vk::Sampler> {
        if let Some(&sampler) = self.samplers.get(&info) {
            return Ok(sampler);
        }

        // SAFETY: the device is valid.
        let sampler = unsafe { device.create_sampler(&info.create_info()) }
            .map_err(driver("vkCreateSampler"))?;
        self.samplers.insert(info, sampler);
        Ok(sampler)
    }

    /// Number of cached shader modules and samplers.
    pub fn counts(&self) -> (usize, usize) {
        (self.shader_modules.len(), self.samplers.len())
    }

    /// Destroy every cached object.
    ///
    /// # Safety
    /// No pipeline or descriptor set referencing the cached objects may be in use.
    pub(crate) unsafe fn destroy(&mut self, device: &dyn Device) {
        for (_, module) in self.shader_modules.drain() {
            device.destroy_shader_module(module);
        }
        for (_, sampler) in self.samplers.drain() {
            device.destroy_sampler(sampler);
        }
    }
}
